//! Google Drive upload client
//!
//! Authenticates as a service account (signed JWT exchanged for a bearer
//! token) and creates files with a single `multipart/related` request that
//! carries the JSON metadata and the media together.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{ProviderError, RemoteObjectRef, StorageProvider, UploadRequest};
use crate::config::GoogleDriveConfig;

pub const DEFAULT_UPLOAD_URL: &str = "https://www.googleapis.com";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// The subset of a service-account JSON key the relay needs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    ASSERTION_LIFETIME_SECS
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(TOKEN_REFRESH_MARGIN_SECS) < self.expires_at
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FileCreateMetadata<'a> {
    name: &'a str,
    parents: [&'a str; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    mime_type: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
    name: String,
    #[serde(default)]
    parents: Vec<String>,
}

pub struct GoogleDriveProvider {
    http_client: Client,
    service_account: ServiceAccountKey,
    encoding_key: EncodingKey,
    upload_url: String,
    token: Mutex<Option<CachedToken>>,
}

impl GoogleDriveProvider {
    pub fn new(config: &GoogleDriveConfig) -> Result<Self> {
        let encoding_key = EncodingKey::from_rsa_pem(config.service_account.private_key.as_bytes())
            .context("Service account private_key is not a valid RSA PEM key")?;

        let http_client = Client::builder()
            .user_agent(concat!("upload-relay/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        info!(
            "Google Drive client configured for {}",
            config.service_account.client_email
        );

        Ok(Self {
            http_client,
            service_account: config.service_account.clone(),
            encoding_key,
            upload_url: format!(
                "{}/upload/drive/v3/files",
                config.upload_url.trim_end_matches('/')
            ),
            token: Mutex::new(None),
        })
    }

    /// Return a valid access token, exchanging a fresh JWT assertion when the
    /// cached one is missing or about to expire.
    async fn access_token(&self) -> Result<String, ProviderError> {
        let mut cached = self.token.lock().await;
        let now = Utc::now();

        if let Some(token) = cached.as_ref().filter(|token| token.is_fresh(now)) {
            return Ok(token.access_token.clone());
        }

        let token = self.exchange_assertion(now).await?;
        let access_token = token.access_token.clone();
        *cached = Some(token);
        Ok(access_token)
    }

    async fn exchange_assertion(&self, now: DateTime<Utc>) -> Result<CachedToken, ProviderError> {
        let claims = Claims {
            iss: &self.service_account.client_email,
            scope: DRIVE_SCOPE,
            aud: &self.service_account.token_uri,
            iat: now.timestamp(),
            exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
        };
        let mut jwt_header = Header::new(Algorithm::RS256);
        jwt_header.kid = self.service_account.private_key_id.clone();

        let assertion = jsonwebtoken::encode(&jwt_header, &claims, &self.encoding_key)
            .map_err(|e| ProviderError::Auth(format!("Failed to sign assertion: {}", e)))?;

        debug!("Requesting Google access token for {}", self.service_account.client_email);

        let response = self
            .http_client
            .post(&self.service_account.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            error!("Google token exchange failed: {} - {}", status, body);
            return Err(ProviderError::Auth(body));
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::InvalidResponse(format!("{}: {}", e, body)))?;

        Ok(CachedToken {
            access_token: token.access_token,
            expires_at: now + Duration::seconds(token.expires_in),
        })
    }
}

#[async_trait]
impl StorageProvider for GoogleDriveProvider {
    fn name(&self) -> &'static str {
        "google_drive"
    }

    async fn upload(&self, request: UploadRequest) -> Result<RemoteObjectRef, ProviderError> {
        let access_token = self.access_token().await?;

        let metadata = FileCreateMetadata {
            name: request.name.as_str(),
            parents: [request.parent.as_str()],
            mime_type: request.content_type.as_deref(),
        };
        let metadata_json = serde_json::to_vec(&metadata)
            .map_err(|e| ProviderError::InvalidResponse(format!("Failed to encode metadata: {}", e)))?;

        let boundary = format!("relay-{}", Uuid::new_v4().simple());
        let body = multipart_related_body(
            &boundary,
            &metadata_json,
            request.content_type.as_deref(),
            &request.content,
        );

        debug!(
            "Uploading {} ({} bytes) to Drive folder {}",
            request.name,
            request.content.len(),
            request.parent
        );

        let response = self
            .http_client
            .post(&self.upload_url)
            .query(&[
                ("uploadType", "multipart"),
                ("supportsAllDrives", "true"),
                ("fields", "id,name,parents"),
            ])
            .bearer_auth(access_token)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            error!("Drive upload failed: {} - {}", status, body);
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let file: DriveFile = serde_json::from_str(&body)
            .map_err(|e| ProviderError::InvalidResponse(format!("{}: {}", e, body)))?;

        info!("File uploaded to Drive: {} (id {})", file.name, file.id);

        let parent = file.parents.into_iter().next().unwrap_or(request.parent);

        Ok(RemoteObjectRef {
            id: Some(file.id),
            name: file.name,
            parent,
        })
    }
}

fn multipart_related_body(
    boundary: &str,
    metadata_json: &[u8],
    content_type: Option<&str>,
    content: &[u8],
) -> Vec<u8> {
    let fallback = mime::APPLICATION_OCTET_STREAM;
    let media_type = content_type.unwrap_or(fallback.essence_str());

    let mut body = Vec::with_capacity(content.len() + metadata_json.len() + 256);
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata_json);
    body.extend_from_slice(format!("\r\n--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", media_type).as_bytes());
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    body
}
