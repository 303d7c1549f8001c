use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use stepflow_core::event::RunEvent;
use stepflow_core::types::RunId;

/// JSONL run logger.
///
/// Writes every event of one run to `{log_dir}/{run_id}.jsonl`, one JSON
/// object per line, flushing after each line so a crash never loses an
/// already reported event.
pub struct RunLogger {
    log_dir: PathBuf,
}

impl RunLogger {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    pub fn log_path(&self, run_id: &RunId) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", run_id))
    }

    /// Run the logger as a background task.
    ///
    /// `rx` must be subscribed before the run starts so that `run_started`
    /// is not missed. Stops after the run's terminal event, when the bus
    /// closes, or on cancellation.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<RunEvent>,
        run_id: RunId,
        cancel: CancellationToken,
    ) {
        let log_path = self.log_path(&run_id);
        let mut writer = match open_log(&self.log_dir, &log_path).await {
            Ok(w) => w,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open run log");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if event.run_id != run_id {
                                continue;
                            }
                            let done = event.event_type.is_run_terminal();

                            if let Ok(json) = serde_json::to_string(&event) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush log");
                                }
                            }

                            if done {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }
}

async fn open_log(dir: &Path, path: &Path) -> std::io::Result<tokio::io::BufWriter<tokio::fs::File>> {
    tokio::fs::create_dir_all(dir).await?;
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    Ok(tokio::io::BufWriter::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepflow_core::event::{EventBus, EventType};

    #[tokio::test]
    async fn test_writes_one_line_per_event_of_its_run() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new(16);
        let run_id = RunId::from("run-log-1");
        let other = RunId::from("someone-else");

        let logger = RunLogger::new(dir.path().join("runs"));
        let path = logger.log_path(&run_id);
        let handle = tokio::spawn(logger.run(bus.subscribe(), run_id.clone(), CancellationToken::new()));

        bus.publish(RunEvent::run(&run_id, EventType::RunStarted, json!({})));
        bus.publish(RunEvent::run(&other, EventType::RunStarted, json!({})));
        bus.publish(RunEvent::node(&run_id, "a", EventType::NodeQueued, json!({})));
        bus.publish(RunEvent::run(&run_id, EventType::RunCompleted, json!({ "partial": false })));
        // After the terminal event, nothing else is written.
        bus.publish(RunEvent::node(&run_id, "late", EventType::NodeQueued, json!({})));

        handle.await.unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<RunEvent> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].event_type, EventType::RunStarted);
        assert_eq!(lines[1].node_key.as_deref(), Some("a"));
        assert_eq!(lines[2].event_type, EventType::RunCompleted);
    }

    #[tokio::test]
    async fn test_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new(16);
        let cancel = CancellationToken::new();
        let logger = RunLogger::new(dir.path().to_path_buf());

        let handle = tokio::spawn(logger.run(bus.subscribe(), RunId::from("r"), cancel.clone()));
        cancel.cancel();
        handle.await.unwrap();
    }
}
