//! Local collaborator implementations for the CLI: a filesystem sink and a
//! log-line progress notifier that doubles as the completion signal.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use sluice_engine::{DownloadSink, ProgressEvent, ProgressNotifier, Result, SinkReceipt};

/// Writes merged output into a directory; the external id is the final path.
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

fn sanitize(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect();
    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned
    }
}

#[async_trait]
impl DownloadSink for FileSink {
    async fn deliver(&self, filename: &str, data: Bytes) -> Result<SinkReceipt> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(sanitize(filename));
        tokio::fs::write(&path, &data).await?;
        info!(path = %path.display(), bytes = data.len(), "output written");
        Ok(SinkReceipt {
            external_id: path.to_string_lossy().into_owned(),
        })
    }
}

fn is_terminal_status(status: &str) -> bool {
    status == "Completed" || status == "Cancelled" || status.starts_with("Failed:")
}

/// Logs progress events and counts down outstanding tasks so the CLI knows
/// when every enqueued download has reached a terminal state.
pub struct ConsoleNotifier {
    remaining: watch::Sender<usize>,
}

impl ConsoleNotifier {
    pub fn new(total: usize) -> (Self, watch::Receiver<usize>) {
        let (tx, rx) = watch::channel(total);
        (Self { remaining: tx }, rx)
    }
}

impl ProgressNotifier for ConsoleNotifier {
    fn notify(&self, event: ProgressEvent) {
        if is_terminal_status(&event.status) {
            if event.status == "Completed" {
                info!(
                    task_id = %event.task_id,
                    filename = %event.filename,
                    "download finished: {}",
                    event.status
                );
            } else {
                warn!(
                    task_id = %event.task_id,
                    filename = %event.filename,
                    "download finished: {}",
                    event.status
                );
            }
            self.remaining.send_modify(|n| *n = n.saturating_sub(1));
        } else {
            debug!(
                task_id = %event.task_id,
                percentage = format!("{:.1}", event.percentage),
                downloaded = event.downloaded,
                "{}",
                event.status
            );
        }
    }
}

/// Waits until every tracked task has reached a terminal state.
pub async fn wait_for_drain(mut remaining: watch::Receiver<usize>) {
    while *remaining.borrow() > 0 {
        if remaining.changed().await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_engine::TaskId;

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("a/b\\c:d.mp4"), "a_b_c_d.mp4");
        assert_eq!(sanitize(""), "download");
        assert_eq!(sanitize("plain.ts"), "plain.ts");
    }

    #[tokio::test]
    async fn test_file_sink_writes_output() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path().to_path_buf());
        let receipt = sink
            .deliver("clip.ts", Bytes::from_static(b"abc"))
            .await
            .unwrap();
        let written = std::fs::read(&receipt.external_id).unwrap();
        assert_eq!(written, b"abc");
    }

    #[tokio::test]
    async fn test_notifier_counts_down_on_terminal_events() {
        let (notifier, rx) = ConsoleNotifier::new(2);
        let event = |status: &str| ProgressEvent {
            task_id: TaskId::new(),
            filename: "f.ts".to_string(),
            downloaded: 0,
            total: 0,
            percentage: 0.0,
            status: status.to_string(),
            awaiting_user_interaction: false,
        };
        notifier.notify(event("Downloading segments"));
        assert_eq!(*rx.borrow(), 2);
        notifier.notify(event("Completed"));
        notifier.notify(event("Failed: boom"));
        assert_eq!(*rx.borrow(), 0);
        wait_for_drain(rx).await;
    }
}
