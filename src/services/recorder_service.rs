use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::sync::{mpsc, Mutex, Notify};
use uuid::Uuid;

use crate::{
    config::RecorderConfig,
    models::{InvocationRecord, InvocationStatus, Model, NormalizedRequest, NormalizedResponse},
};

/// Response text capture cap unless full capture is enabled.
const RESPONSE_TEXT_CAP: usize = 64 * 1024;

/// Narrow write interface against the external observability store.
#[async_trait]
pub trait InvocationStore: Send + Sync {
    async fn write_batch(&self, records: &[InvocationRecord]) -> anyhow::Result<()>;
}

/// Async writer of per-call observability records.
///
/// The hot path enqueues with a non-blocking try-send; a full queue drops the
/// record and bumps a counter; observability never back-pressures the
/// serving path. One background worker drains the queue in batches. Store
/// failures are logged and counted, never propagated to callers.
pub struct InvocationRecorder {
    tx: mpsc::Sender<InvocationRecord>,
    dropped: Arc<AtomicU64>,
    write_failures: Arc<AtomicU64>,
    shutdown: Arc<Notify>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    full_capture: bool,
}

impl InvocationRecorder {
    /// Spawn the drain worker and return the recorder handle.
    pub fn spawn(store: Arc<dyn InvocationStore>, config: &RecorderConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let write_failures = Arc::new(AtomicU64::new(0));
        let shutdown = Arc::new(Notify::new());

        let worker = tokio::spawn(drain_loop(
            rx,
            store,
            config.batch_size.max(1),
            write_failures.clone(),
            shutdown.clone(),
        ));

        Self {
            tx,
            dropped,
            write_failures,
            shutdown,
            worker: Mutex::new(Some(worker)),
            full_capture: config.full_capture,
        }
    }

    /// Enqueue one record without blocking. Drops on a full queue.
    pub fn record(&self, record: InvocationRecord) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(record) {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(dropped_total = total, "invocation record dropped: queue full");
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn write_failure_count(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    /// Build a record from one completed call, applying the redaction rules:
    /// no headers are ever captured, the response text is truncated at 64 KiB
    /// unless full capture is enabled, and secrets never reach any field.
    pub fn build_record(
        &self,
        model: &Model,
        request: &NormalizedRequest,
        outcome: Result<&NormalizedResponse, &str>,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> InvocationRecord {
        let duration_ms = (completed_at - started_at).num_milliseconds();

        let (status, error_message, response) = match outcome {
            Ok(response) => (InvocationStatus::Success, None, Some(response)),
            Err(message) => (InvocationStatus::Error, Some(message.to_string()), None),
        };

        let response_text = response.map(|r| {
            if self.full_capture {
                r.output_text.clone()
            } else {
                truncate_utf8(&r.output_text, RESPONSE_TEXT_CAP)
            }
        });
        let response_text_length = response.map(|r| r.output_text.len() as i64);

        let usage = response.and_then(|r| r.usage);
        let prompt_tokens = usage.and_then(|u| u.prompt_tokens).map(|v| v as i64);
        let completion_tokens = usage.and_then(|u| u.completion_tokens).map(|v| v as i64);
        let total_tokens = usage.and_then(|u| u.total_tokens).map(|v| v as i64);

        // Cost is computed at record time; null counts yield null cost.
        let cost = model.config.cost(
            usage.and_then(|u| u.prompt_tokens),
            usage.and_then(|u| u.completion_tokens),
        );

        InvocationRecord {
            id: Uuid::new_v4().to_string(),
            provider_name: model.provider_name.clone(),
            model_name: model.model_name.clone(),
            started_at,
            completed_at,
            duration_ms,
            status,
            error_message,
            request_prompt: request.prompt.clone(),
            request_messages: request
                .messages
                .as_ref()
                .and_then(|m| serde_json::to_value(m).ok()),
            request_parameters: serde_json::Value::Object(request.parameters.clone()),
            response_text,
            response_text_length,
            prompt_tokens,
            completion_tokens,
            total_tokens,
            cost,
            raw_response: response.and_then(|r| r.raw.clone()),
        }
    }

    /// Signal the worker, drain up to the grace deadline, then return.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.notify_one();
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(grace, handle).await.is_err() {
                tracing::warn!("recorder worker did not drain within the shutdown grace period");
            }
        }
    }
}

async fn drain_loop(
    mut rx: mpsc::Receiver<InvocationRecord>,
    store: Arc<dyn InvocationStore>,
    batch_size: usize,
    write_failures: Arc<AtomicU64>,
    shutdown: Arc<Notify>,
) {
    let mut batch: Vec<InvocationRecord> = Vec::with_capacity(batch_size);

    loop {
        tokio::select! {
            received = rx.recv() => {
                match received {
                    Some(record) => {
                        batch.push(record);
                        // Opportunistically fill the batch before writing.
                        while batch.len() < batch_size {
                            match rx.try_recv() {
                                Ok(record) => batch.push(record),
                                Err(_) => break,
                            }
                        }
                        flush(&store, &mut batch, &write_failures).await;
                    }
                    // All senders gone.
                    None => break,
                }
            }
            _ = shutdown.notified() => {
                // Drain whatever is already queued, then exit.
                while let Ok(record) = rx.try_recv() {
                    batch.push(record);
                    if batch.len() >= batch_size {
                        flush(&store, &mut batch, &write_failures).await;
                    }
                }
                flush(&store, &mut batch, &write_failures).await;
                break;
            }
        }
    }

    flush(&store, &mut batch, &write_failures).await;
}

async fn flush(
    store: &Arc<dyn InvocationStore>,
    batch: &mut Vec<InvocationRecord>,
    write_failures: &AtomicU64,
) {
    if batch.is_empty() {
        return;
    }
    if let Err(e) = store.write_batch(batch).await {
        let total = write_failures.fetch_add(batch.len() as u64, Ordering::Relaxed)
            + batch.len() as u64;
        tracing::error!(
            failed_total = total,
            "failed to write invocation batch: {:?}",
            e
        );
    }
    batch.clear();
}

/// Truncate at a char boundary at or below `cap` bytes.
fn truncate_utf8(s: &str, cap: usize) -> String {
    if s.len() <= cap {
        return s.to_string();
    }
    let mut end = cap;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

// =========================================================================
// STORE IMPLEMENTATIONS
// =========================================================================

/// Invocation store over the embedded SQLite database.
pub struct SqliteInvocationStore {
    pool: SqlitePool,
}

impl SqliteInvocationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InvocationStore for SqliteInvocationStore {
    async fn write_batch(&self, records: &[InvocationRecord]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO invocations (
                    id, provider_name, model_name, started_at, completed_at,
                    duration_ms, status, error_message, request_prompt,
                    request_messages, request_parameters, response_text,
                    response_text_length, prompt_tokens, completion_tokens,
                    total_tokens, cost, raw_response
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.id)
            .bind(&record.provider_name)
            .bind(&record.model_name)
            .bind(record.started_at.to_rfc3339())
            .bind(record.completed_at.to_rfc3339())
            .bind(record.duration_ms)
            .bind(record.status.as_str())
            .bind(&record.error_message)
            .bind(&record.request_prompt)
            .bind(record.request_messages.as_ref().map(|v| v.to_string()))
            .bind(record.request_parameters.to_string())
            .bind(&record.response_text)
            .bind(record.response_text_length)
            .bind(record.prompt_tokens)
            .bind(record.completion_tokens)
            .bind(record.total_tokens)
            .bind(record.cost)
            .bind(record.raw_response.as_ref().map(|v| v.to_string()))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

/// In-memory invocation store for tests.
#[derive(Default)]
pub struct MemoryInvocationStore {
    pub records: Mutex<Vec<InvocationRecord>>,
    /// When set, writes fail; used to exercise failure counting.
    pub fail_writes: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl InvocationStore for MemoryInvocationStore {
    async fn write_batch(&self, records: &[InvocationRecord]) -> anyhow::Result<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            anyhow::bail!("store unreachable");
        }
        self.records.lock().await.extend_from_slice(records);
        Ok(())
    }
}
