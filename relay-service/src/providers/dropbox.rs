//! Dropbox content upload client
//!
//! Uses the single-request `files/upload` endpoint: the raw bytes go in the
//! body and the destination is described by a JSON `Dropbox-API-Arg` header.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::{ProviderError, RemoteObjectRef, StorageProvider, UploadRequest};
use crate::config::DropboxConfig;

pub const DEFAULT_CONTENT_URL: &str = "https://content.dropboxapi.com";

const API_ARG_HEADER: &str = "Dropbox-API-Arg";

#[derive(Debug, Serialize)]
struct UploadArg<'a> {
    path: &'a str,
    mode: &'static str,
    autorename: bool,
    mute: bool,
}

#[derive(Debug, Deserialize)]
struct FileMetadata {
    id: Option<String>,
    name: String,
    path_display: Option<String>,
}

pub struct DropboxProvider {
    http_client: Client,
    access_token: String,
    upload_url: String,
}

impl DropboxProvider {
    pub fn new(config: &DropboxConfig) -> Result<Self> {
        let http_client = Client::builder()
            .user_agent(concat!("upload-relay/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            access_token: config.access_token.clone(),
            upload_url: format!("{}/2/files/upload", config.content_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl StorageProvider for DropboxProvider {
    fn name(&self) -> &'static str {
        "dropbox"
    }

    async fn upload(&self, request: UploadRequest) -> Result<RemoteObjectRef, ProviderError> {
        let path = dropbox_path(&request.parent, &request.name);
        let arg = UploadArg {
            path: &path,
            mode: "add",
            autorename: true,
            mute: false,
        };
        let arg_json = serde_json::to_string(&arg)
            .map_err(|e| ProviderError::InvalidResponse(format!("Failed to encode upload arg: {}", e)))?;

        debug!("Uploading {} ({} bytes) to Dropbox", path, request.content.len());

        let response = self
            .http_client
            .post(&self.upload_url)
            .bearer_auth(&self.access_token)
            .header(API_ARG_HEADER, header_safe_json(&arg_json))
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(request.content)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            error!("Dropbox upload failed: {} - {}", status, body);
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let metadata: FileMetadata = serde_json::from_str(&body)
            .map_err(|e| ProviderError::InvalidResponse(format!("{}: {}", e, body)))?;

        info!(
            "File uploaded to Dropbox: {}",
            metadata.path_display.as_deref().unwrap_or(&metadata.name)
        );

        Ok(RemoteObjectRef {
            id: metadata.id,
            name: metadata.name,
            parent: request.parent,
        })
    }
}

/// Join a Dropbox folder path and a file name: `/` + `a.png` is `/a.png`,
/// `/photos/` + `a.png` is `/photos/a.png`.
fn dropbox_path(parent: &str, name: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), name)
}

/// Dropbox requires the arg header to be plain ASCII, so every non-ASCII
/// character is written as a JSON `\uXXXX` escape (surrogate pairs above the BMP).
fn header_safe_json(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    for ch in json.chars() {
        if ch.is_ascii() && ch != '\u{7f}' {
            out.push(ch);
        } else {
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}
