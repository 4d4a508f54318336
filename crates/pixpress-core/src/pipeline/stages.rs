//! Per-task stage operations shared by the concurrent and sequential runners.
//!
//! Each stage returns a tagged result instead of bailing out, so a failed
//! read or transcode still travels to the result collector.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::CompressionConfig;
use crate::error::{ErrorKind, PipelineError, PipelineResult};
use crate::storage::{parent_key, Storage};
use crate::types::FileTask;

use super::codec::{output_file_name, transcode_bytes, EncodedImage};

/// Encoded output and where it should be written.
#[derive(Debug, Clone)]
pub struct EncodedOutput {
    /// New display name (original name with the target extension)
    pub name: String,
    /// Destination storage key
    pub key: String,
    pub image: EncodedImage,
}

/// A compressed file that has been written to storage.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodedFile {
    pub name: String,
    pub key: String,
    pub bytes_written: u64,
}

/// Final per-task result produced by either runner.
#[derive(Debug)]
pub struct TaskResult {
    pub task: FileTask,
    pub result: PipelineResult<TranscodedFile>,
}

impl TaskResult {
    /// Result for a task interrupted between stages.
    pub fn cancelled(task: FileTask) -> Self {
        let path = PathBuf::from(&task.path);
        Self {
            task,
            result: Err(PipelineError::Cancelled { path }),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(&self.result, Err(e) if e.kind() == ErrorKind::Cancelled)
    }
}

/// Job handed from the read stage to the transcode stage.
#[derive(Debug)]
pub struct TranscodeJob {
    pub task: FileTask,
    pub source: PipelineResult<Vec<u8>>,
}

/// Job handed from the transcode stage to the write stage.
#[derive(Debug)]
pub struct WriteJob {
    pub task: FileTask,
    pub output: PipelineResult<EncodedOutput>,
}

/// Read, transcode, and write operations over a storage backend.
pub struct Transcoder {
    storage: Arc<dyn Storage>,
    config: Arc<CompressionConfig>,
}

impl Transcoder {
    pub fn new(storage: Arc<dyn Storage>, config: CompressionConfig) -> Self {
        Self {
            storage,
            config: Arc::new(config),
        }
    }

    /// Read the task's source object fully into memory.
    pub async fn read(&self, task: &FileTask) -> PipelineResult<Vec<u8>> {
        let read_error = |e: std::io::Error| PipelineError::Read {
            path: PathBuf::from(&task.path),
            message: e.to_string(),
        };

        let mut reader = self.storage.open(&task.path).await.map_err(read_error)?;
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).await.map_err(read_error)?;
        tracing::trace!("Read {} bytes for file {}", bytes.len(), task.id);
        Ok(bytes)
    }

    /// Decode, downsample, and encode on the blocking pool.
    pub async fn transcode(&self, task: &FileTask, bytes: Vec<u8>) -> PipelineResult<EncodedOutput> {
        let path = PathBuf::from(&task.path);
        let config = self.config.clone();
        let path_for_task = path.clone();

        let image = tokio::task::spawn_blocking(move || {
            transcode_bytes(&bytes, &path_for_task, &config)
        })
        .await
        .map_err(|e| PipelineError::Join {
            path,
            message: e.to_string(),
        })??;

        let name = output_file_name(&task.name, self.config.format);
        let file_stem = output_file_name(
            task.path.rsplit('/').next().unwrap_or(&task.path),
            self.config.format,
        );
        let key = self.storage.join(parent_key(&task.path), &file_stem);

        Ok(EncodedOutput { name, key, image })
    }

    /// Stream the encoded bytes to their destination key.
    ///
    /// A partially written destination is removed on failure.
    pub async fn write(&self, task: &FileTask, output: EncodedOutput) -> PipelineResult<TranscodedFile> {
        let write_error = |e: std::io::Error| PipelineError::Write {
            path: PathBuf::from(&output.key),
            message: e.to_string(),
        };

        let mut writer = self.storage.create(&output.key).await.map_err(write_error)?;
        let written = async {
            writer.write_all(&output.image.bytes).await?;
            writer.shutdown().await
        }
        .await;

        if let Err(e) = written {
            drop(writer);
            if output.key != task.path {
                if let Err(cleanup) = self.storage.delete(&output.key).await {
                    tracing::debug!("Could not remove partial output {}: {}", output.key, cleanup);
                }
            }
            return Err(write_error(e));
        }

        Ok(TranscodedFile {
            name: output.name,
            key: output.key,
            bytes_written: output.image.bytes.len() as u64,
        })
    }

    /// Run all three stages for one task.
    pub async fn process(&self, task: &FileTask) -> PipelineResult<TranscodedFile> {
        let bytes = self.read(task).await?;
        let output = self.transcode(task, bytes).await?;
        self.write(task, output).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pipeline::codec::tests::png_bytes;
    use crate::storage::LocalStorage;
    use crate::types::FileStatus;
    use chrono::Utc;

    pub(crate) fn task(id: i64, path: &str) -> FileTask {
        FileTask {
            id,
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            path: path.to_string(),
            status: FileStatus::Processing,
            failed_attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_process_writes_sibling_output() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("uploads")).unwrap();
        std::fs::write(dir.path().join("uploads/cat.png"), png_bytes(32, 16)).unwrap();

        let transcoder = Transcoder::new(
            Arc::new(LocalStorage::new(dir.path())),
            CompressionConfig::default(),
        );
        let file = transcoder.process(&task(1, "uploads/cat.png")).await.unwrap();

        assert_eq!(file.name, "cat.webp");
        assert_eq!(file.key, "uploads/cat.webp");
        assert!(file.bytes_written > 0);
        let written = std::fs::read(dir.path().join("uploads/cat.webp")).unwrap();
        assert_eq!(written.len() as u64, file.bytes_written);
        // Source is left alone; deletion is deferred
        assert!(dir.path().join("uploads/cat.png").exists());
    }

    #[tokio::test]
    async fn test_read_missing_source_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let transcoder = Transcoder::new(
            Arc::new(LocalStorage::new(dir.path())),
            CompressionConfig::default(),
        );
        let err = transcoder.process(&task(1, "missing.png")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Read { .. }));
    }

    #[tokio::test]
    async fn test_corrupt_source_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.png"), b"\x89PNG garbage").unwrap();
        let transcoder = Transcoder::new(
            Arc::new(LocalStorage::new(dir.path())),
            CompressionConfig::default(),
        );
        let err = transcoder.process(&task(1, "broken.png")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Decode { .. }));
        assert!(!dir.path().join("broken.webp").exists());
    }
}
