use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::Handler;
use crate::HandlerError;
use crate::Transition;

/// Appends every transition as one JSON line.
#[derive(Debug)]
pub struct FileHandler {
    name: String,
    path: PathBuf,
    // Dispatches for different entities run concurrently; lines must not interleave
    write_lock: Mutex<()>,
}

impl FileHandler {
    pub fn new(
        name: &str,
        path: PathBuf,
    ) -> Self {
        Self {
            name: name.to_string(),
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn failed(
        &self,
        reason: impl ToString,
    ) -> HandlerError {
        HandlerError::Failed {
            handler: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Handler for FileHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn notify(
        &self,
        transition: &Transition,
    ) -> std::result::Result<(), HandlerError> {
        let mut line = serde_json::to_vec(transition).map_err(|e| self.failed(e))?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.failed(format!("open {}: {}", self.path.display(), e)))?;
        file.write_all(&line).await.map_err(|e| self.failed(e))?;
        file.flush().await.map_err(|e| self.failed(e))?;
        Ok(())
    }
}
