// src/request_log.rs

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::Database;

const CHANNEL_CAPACITY: usize = 2048;
const FLUSH_BATCH: usize = 256;
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Final outcome of one inbound proxy request. Written once per request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestLogEntry {
    pub id: Uuid,
    pub group_name: String,
    pub key_id: Option<i64>,
    pub model: Option<String>,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub success: bool,
    pub attempts: u32,
    pub duration_ms: u64,
    pub error: Option<String>,
    /// Captured only when `enable_request_body_logging` is set for the group.
    pub request_body: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Asynchronous request-log writer: entries go through a bounded channel and
/// are flushed to the `request_logs` table in batches. Logging is lossy under
/// backpressure; the request path never blocks on it.
#[derive(Clone)]
pub struct RequestLogger {
    tx: mpsc::Sender<RequestLogEntry>,
}

impl RequestLogger {
    pub fn start(db: Database) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<RequestLogEntry>(CHANNEL_CAPACITY);

        let handle = tokio::spawn(async move {
            let mut pending: Vec<RequestLogEntry> = Vec::with_capacity(FLUSH_BATCH);
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    entry = rx.recv() => {
                        match entry {
                            Some(entry) => {
                                pending.push(entry);
                                if pending.len() >= FLUSH_BATCH {
                                    flush(&db, &mut pending).await;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = ticker.tick() => {
                        flush(&db, &mut pending).await;
                    }
                }
            }
            flush(&db, &mut pending).await;
            debug!("request log writer drained and stopped");
        });

        (Self { tx }, handle)
    }

    /// Enqueues one entry. Drops it when the writer is saturated.
    pub fn record(&self, entry: RequestLogEntry) {
        if self.tx.try_send(entry).is_err() {
            warn!("request log channel full, dropping entry");
        }
    }
}

async fn flush(db: &Database, pending: &mut Vec<RequestLogEntry>) {
    if pending.is_empty() {
        return;
    }
    if let Err(e) = db.insert_request_logs(pending).await {
        warn!(error = %e, count = pending.len(), "failed to persist request logs");
    }
    pending.clear();
}
