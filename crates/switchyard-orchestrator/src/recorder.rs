use crate::types::TaskRecord;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use switchyard_core::{SwitchyardError, SwitchyardResult};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Receives every task that reaches a terminal status. The broker calls it
/// off the dispatch path; a failing recorder never blocks or fails a task.
#[async_trait]
pub trait TaskRecorder: Send + Sync {
    async fn record(&self, record: &TaskRecord) -> SwitchyardResult<()>;
}

/// Discards records.
pub struct NoopRecorder;

#[async_trait]
impl TaskRecorder for NoopRecorder {
    async fn record(&self, _record: &TaskRecord) -> SwitchyardResult<()> {
        Ok(())
    }
}

/// Appends one JSON object per line to a file.
pub struct JsonlTaskRecorder {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlTaskRecorder {
    /// Append to `path`, creating parent directories.
    pub async fn new(path: PathBuf) -> SwitchyardResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// File the records go to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every record, oldest first. A missing file yields none.
    pub async fn read_all(&self) -> SwitchyardResult<Vec<TaskRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&self.path).await?;
        data.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                serde_json::from_str(l).map_err(|e| {
                    SwitchyardError::Config(format!("Corrupt task record in history: {e}"))
                })
            })
            .collect()
    }
}

#[async_trait]
impl TaskRecorder for JsonlTaskRecorder {
    async fn record(&self, record: &TaskRecord) -> SwitchyardResult<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
