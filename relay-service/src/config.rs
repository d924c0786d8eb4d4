//! Configuration for the upload relay
//!
//! Everything is read once at startup from the process environment (a `.env`
//! file is honoured) and is immutable afterwards. Missing or malformed
//! provider credentials are a startup error, never a per-request one.

use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::providers::dropbox::DEFAULT_CONTENT_URL;
use crate::providers::google_drive::{ServiceAccountKey, DEFAULT_UPLOAD_URL};

const MEGABYTE: u64 = 1024 * 1024;

/// Main configuration structure for the relay
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub upload: UploadConfig,
    pub provider: ProviderConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            server: ServerConfig::from_lookup(&lookup)?,
            upload: UploadConfig::from_lookup(&lookup)?,
            provider: ProviderConfig::from_lookup(&lookup)?,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.upload.validate()?;
        self.provider.validate()?;
        Ok(())
    }

    /// Parent reference handed to the provider with every upload: a Dropbox
    /// folder path or a Drive folder id.
    pub fn destination_parent(&self) -> &str {
        match &self.provider {
            ProviderConfig::Dropbox(dropbox) => &dropbox.upload_path,
            ProviderConfig::GoogleDrive(drive) => &drive.folder_id,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            host: lookup("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: lookup("PORT")
                .unwrap_or_else(|| "3000".to_string())
                .trim()
                .parse()
                .context("Invalid PORT")?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            bail!("Server port cannot be 0");
        }
        if self.host.trim().is_empty() {
            bail!("Server host cannot be empty");
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

/// How many files a request may carry and under which form field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    /// One file under the `file` field
    Single,
    /// Any number of files under the `photo` field
    Batch,
}

impl UploadMode {
    pub fn field_name(&self) -> &'static str {
        match self {
            UploadMode::Single => "file",
            UploadMode::Batch => "photo",
        }
    }

    pub fn success_message(&self) -> &'static str {
        match self {
            UploadMode::Single => "✅ File uploaded successfully!",
            UploadMode::Batch => "✅ All files uploaded successfully!",
        }
    }
}

impl FromStr for UploadMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(UploadMode::Single),
            "batch" | "multi" => Ok(UploadMode::Batch),
            other => bail!("Unknown UPLOAD_MODE '{}', expected 'single' or 'batch'", other),
        }
    }
}

/// Upload handling configuration
#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub mode: UploadMode,
    pub temp_dir: PathBuf,
    pub static_dir: PathBuf,
    pub max_file_size_bytes: u64,
    /// `None` means no cap on the number of files in a batch
    pub max_files: Option<usize>,
    /// `None` leaves the whole request body unbounded; each file is still
    /// capped by `max_file_size_bytes`
    pub max_request_size_bytes: Option<u64>,
    pub timestamp_prefix: bool,
}

impl UploadConfig {
    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mode: UploadMode = lookup("UPLOAD_MODE")
            .unwrap_or_else(|| "single".to_string())
            .parse()?;

        let max_file_size_mb: u64 = lookup("MAX_FILE_SIZE_MB")
            .unwrap_or_else(|| "100".to_string())
            .trim()
            .parse()
            .context("Invalid MAX_FILE_SIZE_MB")?;

        let max_files: Option<usize> = match mode {
            UploadMode::Single => Some(1),
            UploadMode::Batch => lookup("MAX_FILES")
                .map(|value| value.trim().parse().context("Invalid MAX_FILES"))
                .transpose()?,
        };

        let max_request_size_mb: Option<u64> = lookup("MAX_REQUEST_SIZE_MB")
            .map(|value| value.trim().parse().context("Invalid MAX_REQUEST_SIZE_MB"))
            .transpose()?;

        let timestamp_prefix = match lookup("TIMESTAMP_PREFIX") {
            Some(value) => parse_bool(&value).context("Invalid TIMESTAMP_PREFIX")?,
            None => false,
        };

        Ok(Self {
            mode,
            temp_dir: PathBuf::from(lookup("UPLOAD_TEMP_DIR").unwrap_or_else(|| "uploads".to_string())),
            static_dir: PathBuf::from(lookup("STATIC_DIR").unwrap_or_else(|| "public".to_string())),
            max_file_size_bytes: max_file_size_mb.saturating_mul(MEGABYTE),
            max_files,
            max_request_size_bytes: max_request_size_mb.map(|mb| mb.saturating_mul(MEGABYTE)),
            timestamp_prefix,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_file_size_bytes == 0 {
            bail!("MAX_FILE_SIZE_MB must be at least 1");
        }
        if self.max_files == Some(0) {
            bail!("MAX_FILES must be at least 1");
        }
        if self.max_request_size_bytes == Some(0) {
            bail!("MAX_REQUEST_SIZE_MB must be at least 1");
        }
        if self.mode == UploadMode::Single && self.max_files != Some(1) {
            bail!("Single upload mode accepts exactly one file");
        }
        if self.temp_dir.as_os_str().is_empty() {
            bail!("UPLOAD_TEMP_DIR cannot be empty");
        }
        Ok(())
    }

    /// Upper bound on a whole request body.
    ///
    /// An explicit `MAX_REQUEST_SIZE_MB` wins. Otherwise a capped file count
    /// allows every file at full size plus one megabyte of multipart framing,
    /// and an uncapped batch leaves the body unbounded.
    pub fn request_body_limit(&self) -> usize {
        let limit = match (self.max_request_size_bytes, self.max_files) {
            (Some(bytes), _) => bytes,
            (None, Some(files)) => self
                .max_file_size_bytes
                .saturating_mul(files as u64)
                .saturating_add(MEGABYTE),
            (None, None) => u64::MAX,
        };
        usize::try_from(limit).unwrap_or(usize::MAX)
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            mode: UploadMode::Single,
            temp_dir: PathBuf::from("uploads"),
            static_dir: PathBuf::from("public"),
            max_file_size_bytes: 100 * MEGABYTE,
            max_files: Some(1),
            max_request_size_bytes: None,
            timestamp_prefix: false,
        }
    }
}

/// Which storage provider receives the relayed files
#[derive(Debug, Clone)]
pub enum ProviderConfig {
    Dropbox(DropboxConfig),
    GoogleDrive(GoogleDriveConfig),
}

impl ProviderConfig {
    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let provider = lookup("STORAGE_PROVIDER").unwrap_or_else(|| "dropbox".to_string());

        match provider.trim().to_ascii_lowercase().as_str() {
            "dropbox" => Ok(ProviderConfig::Dropbox(DropboxConfig::from_lookup(lookup)?)),
            "google_drive" | "google-drive" | "gdrive" | "drive" => Ok(ProviderConfig::GoogleDrive(
                GoogleDriveConfig::from_lookup(lookup)?,
            )),
            other => bail!(
                "Unknown STORAGE_PROVIDER '{}', expected 'dropbox' or 'google_drive'",
                other
            ),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            ProviderConfig::Dropbox(dropbox) => dropbox.validate(),
            ProviderConfig::GoogleDrive(drive) => drive.validate(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProviderConfig::Dropbox(_) => "dropbox",
            ProviderConfig::GoogleDrive(_) => "google_drive",
        }
    }
}

/// Dropbox configuration
#[derive(Debug, Clone)]
pub struct DropboxConfig {
    pub access_token: String,
    pub upload_path: String,
    pub content_url: String,
}

impl DropboxConfig {
    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let access_token = lookup("DROPBOX_ACCESS_TOKEN")
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .context("DROPBOX_ACCESS_TOKEN must be set")?;

        Ok(Self {
            access_token,
            upload_path: lookup("DROPBOX_UPLOAD_PATH").unwrap_or_else(|| "/".to_string()),
            content_url: DEFAULT_CONTENT_URL.to_string(),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.access_token.trim().is_empty() {
            bail!("Dropbox access token cannot be empty");
        }
        if !self.upload_path.starts_with('/') {
            bail!(
                "DROPBOX_UPLOAD_PATH must be an absolute Dropbox path, got '{}'",
                self.upload_path
            );
        }
        Ok(())
    }
}

/// Google Drive configuration
#[derive(Debug, Clone)]
pub struct GoogleDriveConfig {
    pub service_account: ServiceAccountKey,
    pub folder_id: String,
    pub upload_url: String,
}

impl GoogleDriveConfig {
    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let raw_key = match (
            lookup("GOOGLE_SERVICE_ACCOUNT_JSON"),
            lookup("GOOGLE_SERVICE_ACCOUNT_FILE"),
        ) {
            (Some(json), _) if !json.trim().is_empty() => json,
            (_, Some(path)) if !path.trim().is_empty() => std::fs::read_to_string(path.trim())
                .with_context(|| format!("Failed to read service account key file {}", path))?,
            _ => bail!("GOOGLE_SERVICE_ACCOUNT_JSON or GOOGLE_SERVICE_ACCOUNT_FILE must be set"),
        };

        let service_account: ServiceAccountKey =
            serde_json::from_str(&raw_key).context("Malformed Google service account key")?;

        let folder_id = lookup("GOOGLE_DRIVE_FOLDER_ID")
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .context("GOOGLE_DRIVE_FOLDER_ID must be set")?;

        Ok(Self {
            service_account,
            folder_id,
            upload_url: DEFAULT_UPLOAD_URL.to_string(),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.folder_id.trim().is_empty() {
            bail!("Google Drive folder id cannot be empty");
        }
        if self.service_account.client_email.trim().is_empty() {
            bail!("Service account key has no client_email");
        }
        if !self.service_account.private_key.contains("PRIVATE KEY") {
            bail!("Service account key has no PEM private_key");
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => bail!("expected a boolean, got '{}'", other),
    }
}
