//! File sink for progress events.

use std::path::Path;

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use testbench_core::error::DeliveryError;
use testbench_core::event::ProgressEvent;
use testbench_engine::Observer;

/// Appends each event as one JSON object per line.
///
/// The file is created if missing and never truncated, so several runs can
/// share one log.
#[derive(Debug)]
pub struct JsonLinesObserver {
    file: Mutex<File>,
}

impl JsonLinesObserver {
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        tracing::debug!(path = %path.display(), "event log opened");
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl Observer for JsonLinesObserver {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn deliver(&self, event: &ProgressEvent) -> Result<(), DeliveryError> {
        let mut line = event
            .to_json()
            .map_err(|e| DeliveryError::Encode(e.to_string()))?;
        line.push('\n');

        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
