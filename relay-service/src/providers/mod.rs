//! Remote storage providers
//!
//! The relay only ever needs one capability from a provider: create a file
//! from a blob of bytes under a parent folder. Everything else about the
//! provider's protocol stays behind [`StorageProvider`].

pub mod dropbox;
pub mod google_drive;

#[cfg(test)]
pub mod mock;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::config::ProviderConfig;

/// Provider error types
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider answered with a non-success status; `body` is its error
    /// text, passed through verbatim.
    #[error("{body}")]
    Rejected { status: u16, body: String },

    #[error("Provider request failed: {0}")]
    Transport(String),

    #[error("Provider authentication failed: {0}")]
    Auth(String),

    #[error("Unexpected provider response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Transport(err.to_string())
    }
}

/// One file to create on the remote side
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Destination file name
    pub name: String,
    /// Dropbox folder path or Drive folder id
    pub parent: String,
    pub content: Bytes,
    pub content_type: Option<String>,
}

/// What the provider reports back for a created file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObjectRef {
    pub id: Option<String>,
    pub name: String,
    pub parent: String,
}

#[async_trait]
pub trait StorageProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn upload(&self, request: UploadRequest) -> Result<RemoteObjectRef, ProviderError>;
}

/// Build the provider selected by configuration.
///
/// Credential problems that can be detected offline (an unparsable RSA key,
/// for instance) surface here so the process fails before serving.
pub fn from_config(config: &ProviderConfig) -> Result<Arc<dyn StorageProvider>> {
    let provider: Arc<dyn StorageProvider> = match config {
        ProviderConfig::Dropbox(dropbox) => Arc::new(dropbox::DropboxProvider::new(dropbox)?),
        ProviderConfig::GoogleDrive(drive) => {
            Arc::new(google_drive::GoogleDriveProvider::new(drive)?)
        }
    };

    tracing::info!(provider = provider.name(), "Storage provider initialized");
    Ok(provider)
}
