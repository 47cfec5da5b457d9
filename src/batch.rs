//! Chunked parallel batch execution
//!
//! # Overview
//!
//! A batch splits its items into ordered chunks and runs them on a bounded set
//! of worker tasks:
//!
//! ```text
//!   dispatcher ──(bounded queue)──► worker × N ──(result channel)──► aggregator
//!        ▲                                                              │
//!        └────────────── semaphore window (payload bound) ◄─────────────┘
//! ```
//!
//! The dispatcher holds one semaphore permit per chunk in flight. The permit
//! travels with the chunk and is released once the aggregator has handed the
//! payload to the sink, so at most `window` payloads exist at any moment.
//! In strict mode the window is twice the worker count, leaving room to
//! buffer chunks that complete ahead of their turn.
//!
//! Cancellation is cooperative: the dispatcher stops, queued chunks are
//! skipped by the worker that picks them up, and chunks already executing run
//! to completion.

use crate::error::{ErrorKind, GatewayError, Result};
use async_trait::async_trait;
use erp_gateway_core_resilience::{clamp_workers, with_retry, FaultClass, RetryPolicy};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::Range;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default number of items per chunk
pub const DEFAULT_CHUNK_SIZE: usize = 100;

/// Work applied to one chunk of items
#[async_trait]
pub trait ChunkOperation: Send + Sync {
    /// Process `items`, the chunk at position `index`
    async fn execute(&self, index: usize, items: &[Value]) -> Result<Value>;
}

/// Payload of one completed chunk
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPayload {
    pub index: usize,
    pub range: Range<usize>,
    pub payload: Value,
}

/// Receiver of chunk payloads
///
/// Payloads arrive in completion order, or in submission order when the
/// batch runs in strict mode.
#[async_trait]
pub trait ChunkSink: Send {
    async fn accept(&mut self, chunk: ChunkPayload) -> Result<()>;
}

/// Sink that keeps every payload in memory
#[derive(Debug, Default)]
pub struct CollectSink {
    pub chunks: Vec<ChunkPayload>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads in arrival order
    pub fn into_payloads(self) -> Vec<Value> {
        self.chunks.into_iter().map(|c| c.payload).collect()
    }
}

#[async_trait]
impl ChunkSink for CollectSink {
    async fn accept(&mut self, chunk: ChunkPayload) -> Result<()> {
        self.chunks.push(chunk);
        Ok(())
    }
}

#[async_trait]
impl ChunkSink for mpsc::Sender<ChunkPayload> {
    async fn accept(&mut self, chunk: ChunkPayload) -> Result<()> {
        self.send(chunk)
            .await
            .map_err(|_| GatewayError::Internal("payload receiver dropped".to_string()))
    }
}

/// Result of one chunk
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChunkStatus {
    Succeeded,
    /// Succeeded after `retries` chunk-level retries
    Retried { retries: u32 },
    Failed { kind: ErrorKind, reason: String },
    /// Never executed because the batch was cancelled
    Skipped,
}

impl ChunkStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ChunkStatus::Succeeded | ChunkStatus::Retried { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkReport {
    pub index: usize,
    /// First item index, inclusive
    pub start: usize,
    /// Last item index, exclusive
    pub end: usize,
    #[serde(flatten)]
    pub status: ChunkStatus,
    pub attempts: u32,
}

impl ChunkReport {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// One item that did not succeed, with the reason of its chunk
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemFailure {
    pub index: usize,
    pub item: Value,
    pub kind: ErrorKind,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded,
    Partial,
    Failed,
    Cancelled,
}

/// Incremental progress of a running batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    pub completed_chunks: usize,
    pub total_chunks: usize,
    pub processed_items: usize,
    pub total_items: usize,
}

impl BatchProgress {
    pub fn is_done(&self) -> bool {
        self.completed_chunks == self.total_chunks
    }
}

/// Summary of one finished batch
#[derive(Debug, Clone, Serialize)]
pub struct BatchJob {
    pub status: JobStatus,
    pub total_items: usize,
    pub chunk_size: usize,
    pub total_chunks: usize,
    pub chunks: Vec<ChunkReport>,
    pub succeeded: usize,
    pub failed: usize,
    pub partial_errors: Vec<ItemFailure>,
    pub progress: BatchProgress,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    pub cancelled: bool,
}

impl BatchJob {
    fn empty(chunk_size: usize) -> Self {
        Self {
            status: JobStatus::Succeeded,
            total_items: 0,
            chunk_size,
            total_chunks: 0,
            chunks: Vec::new(),
            succeeded: 0,
            failed: 0,
            partial_errors: Vec::new(),
            progress: BatchProgress::default(),
            elapsed: Duration::ZERO,
            cancelled: false,
        }
    }

    pub fn failed_chunks(&self) -> impl Iterator<Item = &ChunkReport> {
        self.chunks
            .iter()
            .filter(|c| matches!(c.status, ChunkStatus::Failed { .. }))
    }

    /// Turn anything but full success into an error
    pub fn ensure_complete(self) -> Result<Self> {
        match self.status {
            JobStatus::Succeeded => Ok(self),
            JobStatus::Cancelled => Err(GatewayError::Cancelled(format!(
                "batch cancelled with {} of {} items processed",
                self.succeeded, self.total_items
            ))),
            JobStatus::Partial | JobStatus::Failed => Err(GatewayError::PartialBatchFailure {
                total: self.total_items,
                succeeded: self.succeeded,
                failed: self.failed,
                failures: self.partial_errors,
            }),
        }
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// Per-run options
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub chunk_size: usize,
    /// Worker count; 0 selects the default
    pub workers: usize,
    /// Deliver payloads in submission order
    pub ordered: bool,
    pub cancel: Option<CancellationToken>,
    pub progress: Option<watch::Sender<BatchProgress>>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            workers: 0,
            ordered: false,
            cancel: None,
            progress: None,
        }
    }
}

impl BatchOptions {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_progress(mut self, sender: watch::Sender<BatchProgress>) -> Self {
        self.progress = Some(sender);
        self
    }
}

struct WorkItem {
    index: usize,
    range: Range<usize>,
    permit: OwnedSemaphorePermit,
}

enum ChunkOutcome {
    Done {
        status: ChunkStatus,
        attempts: u32,
        payload: Option<Value>,
    },
    Skipped,
}

struct ChunkResult {
    index: usize,
    range: Range<usize>,
    outcome: ChunkOutcome,
    _permit: OwnedSemaphorePermit,
}

/// Runs batches with a chunk-level retry policy
#[derive(Debug, Clone)]
pub struct BatchExecutor {
    chunk_policy: RetryPolicy,
    default_workers: usize,
}

impl Default for BatchExecutor {
    fn default() -> Self {
        Self::new(RetryPolicy::chunk_default(), 0)
    }
}

impl BatchExecutor {
    /// `default_workers` of 0 derives the count from available parallelism
    pub fn new(chunk_policy: RetryPolicy, default_workers: usize) -> Self {
        Self {
            chunk_policy,
            default_workers: clamp_workers(default_workers),
        }
    }

    pub fn default_workers(&self) -> usize {
        self.default_workers
    }

    /// Run `operation` over `items`
    ///
    /// Never fails as a whole: chunk failures are reported in the returned
    /// job and its `partial_errors`.
    pub async fn run(
        &self,
        items: Vec<Value>,
        operation: Arc<dyn ChunkOperation>,
        options: BatchOptions,
        mut sink: Option<&mut dyn ChunkSink>,
    ) -> BatchJob {
        let chunk_size = options.chunk_size.max(1);
        let total_items = items.len();
        if total_items == 0 {
            return BatchJob::empty(chunk_size);
        }

        let started = Instant::now();
        let items = Arc::new(items);
        let ranges: Vec<Range<usize>> = (0..total_items)
            .step_by(chunk_size)
            .map(|start| start..(start + chunk_size).min(total_items))
            .collect();
        let total_chunks = ranges.len();

        let workers = match options.workers {
            0 => self.default_workers,
            n => clamp_workers(n),
        }
        .min(total_chunks);
        let window = if options.ordered { workers * 2 } else { workers };
        let cancel = options.cancel.clone().unwrap_or_default();

        info!(
            "Starting batch: {} items in {} chunks of {}, {} workers{}",
            total_items,
            total_chunks,
            chunk_size,
            workers,
            if options.ordered { ", strict order" } else { "" }
        );

        let (work_tx, work_rx) = mpsc::channel::<WorkItem>(workers);
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
        let (result_tx, mut result_rx) = mpsc::channel::<ChunkResult>(window);

        let dispatcher = {
            let ranges = ranges.clone();
            let permits = Arc::new(Semaphore::new(window));
            let cancel = cancel.clone();
            tokio::spawn(async move {
                for (index, range) in ranges.into_iter().enumerate() {
                    let permit = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        permit = Arc::clone(&permits).acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };
                    if cancel.is_cancelled() {
                        break;
                    }
                    if work_tx
                        .send(WorkItem {
                            index,
                            range,
                            permit,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            })
        };

        let mut worker_handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let work_rx = Arc::clone(&work_rx);
            let result_tx = result_tx.clone();
            let operation = Arc::clone(&operation);
            let items = Arc::clone(&items);
            let policy = self.chunk_policy.clone();
            let cancel = cancel.clone();

            worker_handles.push(tokio::spawn(async move {
                loop {
                    let next = work_rx.lock().await.recv().await;
                    let Some(work) = next else {
                        break;
                    };

                    let outcome = if cancel.is_cancelled() {
                        ChunkOutcome::Skipped
                    } else {
                        debug!("Worker {} running chunk {}", worker_id, work.index);
                        run_chunk(
                            operation.as_ref(),
                            &policy,
                            work.index,
                            &items[work.range.clone()],
                        )
                        .await
                    };

                    let result = ChunkResult {
                        index: work.index,
                        range: work.range,
                        outcome,
                        _permit: work.permit,
                    };
                    if result_tx.send(result).await.is_err() {
                        break;
                    }
                }
            }));
        }
        drop(result_tx);

        let mut aggregator = Aggregator {
            reports: vec![None; total_chunks],
            progress: BatchProgress {
                total_chunks,
                total_items,
                ..Default::default()
            },
            progress_tx: options.progress.clone(),
            cancel: cancel.clone(),
        };
        if let Some(tx) = &aggregator.progress_tx {
            tx.send_replace(aggregator.progress);
        }

        let mut pending: BTreeMap<usize, ChunkResult> = BTreeMap::new();
        let mut next_index = 0;
        while let Some(result) = result_rx.recv().await {
            if options.ordered {
                pending.insert(result.index, result);
                while let Some(result) = pending.remove(&next_index) {
                    aggregator.complete(result, &mut sink).await;
                    next_index += 1;
                }
            } else {
                aggregator.complete(result, &mut sink).await;
            }
        }
        for (_, result) in std::mem::take(&mut pending) {
            aggregator.complete(result, &mut sink).await;
        }

        if let Err(e) = dispatcher.await {
            error!("Batch dispatcher failed: {}", e);
        }
        for handle in worker_handles {
            if let Err(e) = handle.await {
                error!("Batch worker failed: {}", e);
            }
        }

        let job = aggregator.finish(&items, &ranges, chunk_size, started.elapsed());
        info!(
            "Batch finished: {:?}, {} succeeded, {} failed, {:.2}s",
            job.status,
            job.succeeded,
            job.failed,
            job.elapsed.as_secs_f64()
        );
        job
    }
}

/// Run one chunk with chunk-level retry
///
/// Only failures that already exhausted the call-level transient budget are
/// retried here; panics are reported as internal failures.
async fn run_chunk(
    operation: &dyn ChunkOperation,
    policy: &RetryPolicy,
    index: usize,
    items: &[Value],
) -> ChunkOutcome {
    let result = with_retry(policy, chunk_fault_class, |_| {
        AssertUnwindSafe(operation.execute(index, items))
            .catch_unwind()
            .map(|caught| caught.unwrap_or_else(|panic| Err(panic_error(index, panic))))
    })
    .await;

    match result {
        Ok(retried) => ChunkOutcome::Done {
            status: if retried.attempts > 1 {
                ChunkStatus::Retried {
                    retries: retried.attempts - 1,
                }
            } else {
                ChunkStatus::Succeeded
            },
            attempts: retried.attempts,
            payload: Some(retried.value),
        },
        Err(failure) => {
            warn!(
                "Chunk {} failed after {} attempt(s): {}",
                index, failure.attempts, failure.error
            );
            ChunkOutcome::Done {
                status: ChunkStatus::Failed {
                    kind: failure.error.kind(),
                    reason: failure.error.to_string(),
                },
                attempts: failure.attempts,
                payload: None,
            }
        }
    }
}

fn chunk_fault_class(error: &GatewayError) -> FaultClass {
    match error {
        GatewayError::TransientRemote { .. } => FaultClass::Transient,
        _ => FaultClass::Permanent,
    }
}

fn panic_error(index: usize, panic: Box<dyn std::any::Any + Send>) -> GatewayError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    GatewayError::Internal(format!("chunk {} panicked: {}", index, message))
}

struct Aggregator {
    reports: Vec<Option<ChunkReport>>,
    progress: BatchProgress,
    progress_tx: Option<watch::Sender<BatchProgress>>,
    cancel: CancellationToken,
}

impl Aggregator {
    async fn complete(&mut self, result: ChunkResult, sink: &mut Option<&mut dyn ChunkSink>) {
        let ChunkResult {
            index,
            range,
            outcome,
            _permit,
        } = result;

        let (mut status, attempts, payload) = match outcome {
            ChunkOutcome::Done {
                status,
                attempts,
                payload,
            } => (status, attempts, payload),
            ChunkOutcome::Skipped => (ChunkStatus::Skipped, 0, None),
        };

        if let (Some(payload), Some(sink)) = (payload, sink.as_deref_mut()) {
            let chunk = ChunkPayload {
                index,
                range: range.clone(),
                payload,
            };
            if let Err(e) = sink.accept(chunk).await {
                error!("Sink rejected chunk {}: {}, cancelling batch", index, e);
                status = ChunkStatus::Failed {
                    kind: e.kind(),
                    reason: e.to_string(),
                };
                self.cancel.cancel();
            }
        }

        if status != ChunkStatus::Skipped {
            self.progress.completed_chunks += 1;
            self.progress.processed_items += range.len();
            if let Some(tx) = &self.progress_tx {
                tx.send_replace(self.progress);
            }
        }

        self.reports[index] = Some(ChunkReport {
            index,
            start: range.start,
            end: range.end,
            status,
            attempts,
        });
    }

    fn finish(
        self,
        items: &[Value],
        ranges: &[Range<usize>],
        chunk_size: usize,
        elapsed: Duration,
    ) -> BatchJob {
        let chunks: Vec<ChunkReport> = self
            .reports
            .into_iter()
            .zip(ranges)
            .enumerate()
            .map(|(index, (report, range))| {
                report.unwrap_or(ChunkReport {
                    index,
                    start: range.start,
                    end: range.end,
                    status: ChunkStatus::Skipped,
                    attempts: 0,
                })
            })
            .collect();

        let mut succeeded = 0;
        let mut failed = 0;
        let mut succeeded_chunks = 0;
        let mut skipped_chunks = 0;
        let mut partial_errors = Vec::new();

        for chunk in &chunks {
            let (kind, reason) = match &chunk.status {
                ChunkStatus::Succeeded | ChunkStatus::Retried { .. } => {
                    succeeded += chunk.len();
                    succeeded_chunks += 1;
                    continue;
                }
                ChunkStatus::Failed { kind, reason } => (*kind, reason.clone()),
                ChunkStatus::Skipped => {
                    skipped_chunks += 1;
                    (
                        ErrorKind::Cancelled,
                        "batch cancelled before this chunk ran".to_string(),
                    )
                }
            };
            failed += chunk.len();
            partial_errors.extend((chunk.start..chunk.end).map(|i| ItemFailure {
                index: i,
                item: items[i].clone(),
                kind,
                reason: reason.clone(),
            }));
        }

        let status = if skipped_chunks > 0 {
            JobStatus::Cancelled
        } else if succeeded_chunks == chunks.len() {
            JobStatus::Succeeded
        } else if succeeded_chunks == 0 {
            JobStatus::Failed
        } else {
            JobStatus::Partial
        };

        BatchJob {
            status,
            total_items: items.len(),
            chunk_size,
            total_chunks: chunks.len(),
            chunks,
            succeeded,
            failed,
            partial_errors,
            progress: self.progress,
            elapsed,
            cancelled: self.cancel.is_cancelled(),
        }
    }
}
