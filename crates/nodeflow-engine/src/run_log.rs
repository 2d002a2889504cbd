use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use nodeflow_core::event::topics;
use nodeflow_core::{BusEvent, ExecutionLogEntry, LogStatus, Result};

/// In-memory, append-only log of one run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionLog {
    entries: Vec<ExecutionLogEntry>,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: ExecutionLogEntry) {
        self.entries.push(entry);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[ExecutionLogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries with status `error`.
    pub fn errors(&self) -> impl Iterator<Item = &ExecutionLogEntry> {
        self.entries.iter().filter(|e| e.status == LogStatus::Error)
    }

    pub fn into_entries(self) -> Vec<ExecutionLogEntry> {
        self.entries
    }
}

/// JSONL mirror of run events.
///
/// Reads the event bus stream and appends one JSON object per line to a
/// file, flushing after every line so a crash leaves all earlier lines
/// intact. Stops once the run it follows completes or fails.
pub struct RunLogWriter {
    path: PathBuf,
    execution_id: Option<String>,
}

/// A single line of the JSONL file.
#[derive(Serialize)]
struct LogLine {
    timestamp: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    execution_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<Value>,
}

impl RunLogWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            execution_id: None,
        }
    }

    /// Only record events of this run.
    pub fn for_execution(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    /// Write events until the run ends, the stream closes or `cancel` fires.
    ///
    /// Subscribe before the run starts so no event is missed. Returns the
    /// number of lines written.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<BusEvent>,
        cancel: CancellationToken,
    ) -> Result<usize> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        info!(path = %self.path.display(), "Run log started");

        let mut writer = tokio::io::BufWriter::new(file);
        let mut written = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Run log cancelled");
                    break;
                }
                received = rx.recv() => match received {
                    Ok(event) => {
                        let Some(line) = self.to_line(&event) else {
                            continue;
                        };
                        let mut json = serde_json::to_string(&line)?;
                        json.push('\n');
                        if let Err(e) = writer.write_all(json.as_bytes()).await {
                            error!(error = %e, "Failed to write run log line");
                            return Err(e.into());
                        }
                        writer.flush().await?;
                        written += 1;

                        if is_run_end(&event.topic) {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "Run log lagged, skipped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Event stream closed, run log stopping");
                        break;
                    }
                }
            }
        }

        writer.flush().await?;
        debug!(path = %self.path.display(), lines = written, "Run log finished");
        Ok(written)
    }

    /// Map a bus event to a log line. Events of other runs and
    /// non-run topics are dropped.
    fn to_line(&self, event: &BusEvent) -> Option<LogLine> {
        let recorded = event.topic.starts_with("flow.")
            || event.topic.starts_with("node.")
            || event.topic.starts_with("variables.");
        if !recorded {
            return None;
        }

        let execution_id = event
            .payload
            .get("execution_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(wanted) = &self.execution_id {
            // Variable events carry no run id
            if execution_id.as_ref().is_some_and(|id| id != wanted) {
                return None;
            }
        }

        let node_id = event
            .payload
            .get("node_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        Some(LogLine {
            timestamp: Utc::now().to_rfc3339(),
            event_type: event.topic.clone(),
            execution_id,
            node_id,
            detail: Some(event.payload.clone()).filter(|p| !p.is_null()),
        })
    }
}

fn is_run_end(topic: &str) -> bool {
    topic == topics::FLOW_COMPLETED || topic == topics::FLOW_FAILED
}
