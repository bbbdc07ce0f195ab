//! Writes completed transfers into a download directory

use anyhow::{Context, Result};
use log::info;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};

use super::{ControlFrame, FileReceiver, ReceiveEvent};

pub struct DownloadSink {
    dir: PathBuf,
    receiver: Mutex<FileReceiver>,
}

impl DownloadSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            receiver: Mutex::new(FileReceiver::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// True if `frame` belongs to a file transfer rather than some other payload
    pub fn accepts(&self, frame: &[u8]) -> bool {
        self.receiver.lock().in_progress() || ControlFrame::parse(frame).is_some()
    }

    /// Feed one frame. Returns the written path once a transfer completes.
    pub async fn on_receive_frame(&self, frame: &[u8]) -> Result<Option<PathBuf>> {
        let event = self.receiver.lock().on_receive_frame(frame)?;

        let ReceiveEvent::Completed(file) = event else {
            return Ok(None);
        };

        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let path = self.dir.join(file.file_name());
        tokio::fs::write(&path, &file.data)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        info!("Saved {} ({} bytes)", path.display(), file.data.len());
        Ok(Some(path))
    }
}
