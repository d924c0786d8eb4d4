use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("file exceeds the limit of {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("request body exceeds the size limit")]
    BodyTooLarge,

    #[error("{0}")]
    Stream(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One uploaded file part, spooled to local scratch space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingFile {
    /// Client-supplied name, untrusted
    pub original_name: String,
    /// Client-supplied MIME type, untrusted
    pub content_type: Option<String>,
    pub size: u64,
    pub temp_path: PathBuf,
}

impl IncomingFile {
    /// Read the whole spooled file back into memory
    pub async fn read(&self) -> std::io::Result<Bytes> {
        async_fs::read(&self.temp_path).await.map(Bytes::from)
    }
}

/// Scratch directory that holds request bodies until they are relayed
#[derive(Debug, Clone)]
pub struct TempStore {
    temp_path: PathBuf,
    max_file_size: u64,
}

impl TempStore {
    /// Create the store, creating the directory if needed
    pub fn new(temp_path: impl Into<PathBuf>, max_file_size: u64) -> anyhow::Result<Self> {
        let temp_path = temp_path.into();
        std::fs::create_dir_all(&temp_path)
            .with_context(|| format!("Failed to create upload directory {}", temp_path.display()))?;

        Ok(Self {
            temp_path,
            max_file_size,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.temp_path
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    fn allocate_path(&self) -> PathBuf {
        self.temp_path.join(Uuid::new_v4().simple().to_string())
    }

    /// Write a part's byte stream to a fresh temp file.
    ///
    /// Chunks are written as they arrive so memory stays bounded by the chunk
    /// size. On any failure, or if the returned future is dropped half way,
    /// the partial file is removed.
    pub async fn spool<S, E>(
        &self,
        original_name: &str,
        content_type: Option<String>,
        stream: S,
    ) -> Result<IncomingFile, SpoolError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Into<SpoolError>,
    {
        let partial = PartialFile::new(self.allocate_path());
        let size = self.write_stream(partial.path(), stream).await?;
        let temp_path = partial.keep();

        debug!(
            "Spooled {} ({} bytes) to {}",
            original_name,
            size,
            temp_path.display()
        );
        Ok(IncomingFile {
            original_name: original_name.to_string(),
            content_type,
            size,
            temp_path,
        })
    }

    async fn write_stream<S, E>(&self, path: &Path, stream: S) -> Result<u64, SpoolError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Into<SpoolError>,
    {
        let mut stream = std::pin::pin!(stream);
        let mut file = async_fs::File::create(path).await?;
        let mut size: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(Into::<SpoolError>::into)?;
            size += chunk.len() as u64;
            if size > self.max_file_size {
                return Err(SpoolError::TooLarge {
                    limit: self.max_file_size,
                });
            }
            file.write_all(&chunk).await?;
        }

        file.flush().await?;
        Ok(size)
    }
}

/// Best-effort removal of a temp file. A file that is already gone counts as
/// removed; any other failure is logged and swallowed.
pub async fn remove_temp_file(path: &Path) {
    match async_fs::remove_file(path).await {
        Ok(()) => debug!("Removed temp file {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("Temp file {} already removed", path.display())
        }
        Err(e) => warn!("Failed to remove temp file {}: {}", path.display(), e),
    }
}

/// Best-effort removal of every temp file in a batch
pub async fn remove_all(files: &[IncomingFile]) {
    for file in files {
        remove_temp_file(&file.temp_path).await;
    }
}

/// Synchronous removal for `Drop` paths, where nothing can be awaited
fn remove_leftover(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed leftover temp file {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove temp file {}: {}", path.display(), e),
    }
}

/// A temp file still being written. Removed on drop unless kept.
struct PartialFile {
    path: PathBuf,
    kept: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, kept: false }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn keep(mut self) -> PathBuf {
        self.kept = true;
        std::mem::take(&mut self.path)
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.kept {
            remove_leftover(&self.path);
        }
    }
}

/// Every temp file spooled for one request.
///
/// Whatever is still on disk when the batch is dropped gets removed, so a
/// request that is cancelled or panics leaves nothing in the scratch
/// directory.
#[derive(Debug, Default)]
pub struct SpooledBatch {
    files: Vec<IncomingFile>,
}

impl SpooledBatch {
    pub fn push(&mut self, file: IncomingFile) {
        self.files.push(file);
    }

    pub fn files(&self) -> &[IncomingFile] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl Drop for SpooledBatch {
    fn drop(&mut self) {
        for file in &self.files {
            remove_leftover(&file.temp_path);
        }
    }
}
