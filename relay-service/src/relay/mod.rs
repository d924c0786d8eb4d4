//! The relay loop: push every spooled file of a batch to the provider, one
//! at a time, and leave nothing behind in the scratch directory.

pub mod naming;

use chrono::Utc;
use tracing::{error, info};

use self::naming::DestinationNamer;
use crate::error::RelayError;
use crate::providers::{RemoteObjectRef, StorageProvider, UploadRequest};
use crate::storage::{remove_all, remove_temp_file, IncomingFile};

/// Per-process relay settings
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Dropbox folder path or Drive folder id
    pub parent: String,
    pub timestamp_prefix: bool,
}

/// Relay a batch sequentially.
///
/// Each file's temp copy is removed right after its upload succeeds. The
/// first failure stops the loop: no further uploads are attempted, every temp
/// file of the batch is removed, and the error is returned. Files uploaded
/// before the failure stay on the remote side.
pub async fn relay_batch(
    provider: &dyn StorageProvider,
    files: &[IncomingFile],
    options: &RelayOptions,
) -> Result<Vec<RemoteObjectRef>, RelayError> {
    if files.is_empty() {
        return Err(RelayError::NoFiles);
    }

    let mut namer = DestinationNamer::new(options.timestamp_prefix);
    let mut uploaded = Vec::with_capacity(files.len());

    for (index, file) in files.iter().enumerate() {
        let name = namer.next_name(&file.original_name, Utc::now().timestamp_millis());

        match relay_one(provider, file, name, &options.parent).await {
            Ok(remote) => {
                remove_temp_file(&file.temp_path).await;
                uploaded.push(remote);
            }
            Err(e) => {
                error!(
                    provider = provider.name(),
                    position = index + 1,
                    total = files.len(),
                    "Relay of {} aborted: {}",
                    file.original_name,
                    e
                );
                remove_all(files).await;
                return Err(e);
            }
        }
    }

    info!(
        provider = provider.name(),
        count = uploaded.len(),
        "Batch relayed"
    );
    Ok(uploaded)
}

async fn relay_one(
    provider: &dyn StorageProvider,
    file: &IncomingFile,
    name: String,
    parent: &str,
) -> Result<RemoteObjectRef, RelayError> {
    let content = file.read().await?;

    info!(
        "Relaying {} as {} ({} bytes, content_type={:?})",
        file.original_name, name, file.size, file.content_type
    );

    let remote = provider
        .upload(UploadRequest {
            name,
            parent: parent.to_string(),
            content,
            content_type: file.content_type.clone(),
        })
        .await?;

    info!(
        "Relayed {} -> {} (id {})",
        file.original_name,
        remote.name,
        remote.id.as_deref().unwrap_or("-")
    );
    Ok(remote)
}
