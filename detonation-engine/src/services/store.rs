use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use shared::messaging::TaskEvent;

use crate::models::report::AnalysisReport;

/// One buffered record bound for the persistent store
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum StoreRecord {
    Event(TaskEvent),
    Report(Box<AnalysisReport>),
}

/// Fire-and-forget client for the persistent store collaborator.
///
/// `record`/`store_report` enqueue and return immediately; a background
/// forwarder drains the buffer and posts with bounded retries. The core
/// never blocks on store availability.
#[derive(Clone)]
pub struct ReportStoreClient {
    tx: mpsc::UnboundedSender<StoreRecord>,
}

impl ReportStoreClient {
    pub fn new(endpoint: Option<String>, max_attempts: u32, retry_delay: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(forwarder(endpoint, max_attempts, retry_delay, rx));
        Self { tx }
    }

    /// Capture records into a channel instead of forwarding them.
    #[cfg(test)]
    pub fn with_sink() -> (Self, mpsc::UnboundedReceiver<StoreRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn record(&self, event: TaskEvent) {
        debug!(title = %event.get_title(), "Store event");
        let _ = self.tx.send(StoreRecord::Event(event));
    }

    pub fn store_report(&self, report: &AnalysisReport) {
        let _ = self.tx.send(StoreRecord::Report(Box::new(report.clone())));
    }
}

async fn forwarder(
    endpoint: Option<String>,
    max_attempts: u32,
    retry_delay: Duration,
    mut rx: mpsc::UnboundedReceiver<StoreRecord>,
) {
    let client = reqwest::Client::new();

    while let Some(record) = rx.recv().await {
        let Some(base) = endpoint.as_deref() else {
            debug!("Store endpoint not configured, dropping record");
            continue;
        };

        let url = match &record {
            StoreRecord::Event(_) => format!("{}/events", base.trim_end_matches('/')),
            StoreRecord::Report(_) => format!("{}/reports", base.trim_end_matches('/')),
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match client.post(&url).json(&record).send().await {
                Ok(response) if response.status().is_success() => break,
                Ok(response) => {
                    warn!(%url, status = %response.status(), attempt, "Store rejected record")
                }
                Err(e) => warn!(%url, error = %e, attempt, "Store unreachable"),
            }
            if attempt >= max_attempts {
                warn!(%url, "Dropping record after {} attempts", attempt);
                break;
            }
            tokio::time::sleep(retry_delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_record_never_blocks_and_reaches_sink() {
        let (store, mut rx) = ReportStoreClient::with_sink();

        store.record(TaskEvent::TaskQueued {
            task_id: Uuid::new_v4(),
            platform: "linux-x64".to_string(),
            priority: "normal".to_string(),
            timestamp: Utc::now(),
        });

        match rx.recv().await.unwrap() {
            StoreRecord::Event(TaskEvent::TaskQueued { platform, .. }) => {
                assert_eq!(platform, "linux-x64")
            }
            other => panic!("unexpected record: {:?}", other),
        }
    }
}
