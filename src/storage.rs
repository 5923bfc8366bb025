//! Persistence of verified pieces.

use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::ApplicationError;

/// Sink for hash-verified pieces.
#[async_trait]
pub trait PieceWriter: Send + Sync {
    /// Persists piece `index`. Only ever called once per successful
    /// verification, with exactly the piece's declared length.
    async fn write_piece(&self, index: usize, data: &[u8]) -> Result<(), ApplicationError>;
}

/// Writes pieces into a single pre-sized output file.
///
/// Writes go through one file handle behind a mutex, so two pieces completing
/// at the same time never interleave their seek and write.
pub struct FileWriter {
    path: PathBuf,
    piece_length: u64,
    file: Mutex<File>,
}

impl FileWriter {
    /// Creates (or truncates) `path` and sizes it to `total_length`.
    pub async fn create<P: AsRef<Path>>(
        path: P,
        total_length: u64,
        piece_length: u64,
    ) -> Result<Self, ApplicationError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(|e| {
                ApplicationError::StorageError(format!("cannot open {}: {}", path.display(), e))
            })?;

        file.set_len(total_length).await.map_err(|e| {
            ApplicationError::StorageError(format!("cannot size {}: {}", path.display(), e))
        })?;

        info!(path = %path.display(), bytes = total_length, "output file ready");

        Ok(Self {
            path,
            piece_length,
            file: Mutex::new(file),
        })
    }
}

#[async_trait]
impl PieceWriter for FileWriter {
    async fn write_piece(&self, index: usize, data: &[u8]) -> Result<(), ApplicationError> {
        let offset = index as u64 * self.piece_length;
        let mut file = self.file.lock().await;

        let write = async {
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(data).await?;
            file.flush().await
        };
        write.await.map_err(|e| {
            ApplicationError::StorageError(format!(
                "writing piece {} to {}: {}",
                index,
                self.path.display(),
                e
            ))
        })?;

        debug!(piece = index, offset, bytes = data.len(), "piece written");
        Ok(())
    }
}
