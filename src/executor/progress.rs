use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::types::ProgressConfig;
use crate::planner::plan::{OperationStatus, Plan, PlanStatus};

/// Progress of one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub running: usize,
}

/// Point-in-time view of a plan's execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorProgress {
    pub plan_id: String,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub running: usize,
    pub pending: usize,
    pub current_stage: usize,
    pub max_stage: usize,
    pub percent: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub stages: BTreeMap<usize, StageProgress>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ProgressEvent {
    Start { plan_id: String, total: usize },
    Progress(ExecutorProgress),
    Operation {
        operation_id: String,
        address: String,
        status: OperationStatus,
    },
    Complete { plan_id: String, status: PlanStatus },
    Error { operation_id: String, message: String },
}

#[derive(Debug, Default)]
struct PlanMeta {
    plan_id: String,
    current_stage: usize,
    max_stage: usize,
    started_at: Option<DateTime<Utc>>,
}

/// Aggregates per-operation status into stage and overall progress, and
/// publishes events on a bounded channel. A full channel drops the newest
/// event; senders never wait.
pub struct ProgressTracker {
    meta: RwLock<PlanMeta>,
    operations: DashMap<String, (usize, String, OperationStatus)>,
    tx: mpsc::Sender<ProgressEvent>,
    rx: Mutex<Option<mpsc::Receiver<ProgressEvent>>>,
    dropped: AtomicU64,
    interval: Duration,
    worker: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ProgressTracker {
    pub fn new(config: &ProgressConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.event_buffer.max(1));
        Self {
            meta: RwLock::new(PlanMeta::default()),
            operations: DashMap::new(),
            tx,
            rx: Mutex::new(Some(rx)),
            dropped: AtomicU64::new(0),
            interval: config.update_interval(),
            worker: Mutex::new(None),
        }
    }

    /// Take the event receiver. Only the first caller gets it.
    pub fn subscribe(&self) -> Option<mpsc::Receiver<ProgressEvent>> {
        self.rx.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Events dropped because the channel was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn emit(&self, event: ProgressEvent) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Reset for a new plan: every operation pending, stage zero.
    pub fn begin(&self, plan: &Plan) {
        self.operations.clear();
        for op in &plan.operations {
            self.operations
                .insert(op.id.clone(), (op.stage(), op.address(), OperationStatus::Pending));
        }
        {
            let mut meta = self.meta.write().unwrap_or_else(PoisonError::into_inner);
            *meta = PlanMeta {
                plan_id: plan.id.clone(),
                current_stage: 0,
                max_stage: plan.max_stage,
                started_at: Some(Utc::now()),
            };
        }
        self.emit(ProgressEvent::Start {
            plan_id: plan.id.clone(),
            total: plan.operations.len(),
        });
    }

    pub fn set_stage(&self, stage: usize) {
        self.meta
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .current_stage = stage;
    }

    pub fn update(&self, operation_id: &str, status: OperationStatus) {
        let address = match self.operations.get_mut(operation_id) {
            Some(mut entry) => {
                entry.2 = status;
                entry.1.clone()
            }
            None => return,
        };
        self.emit(ProgressEvent::Operation {
            operation_id: operation_id.to_string(),
            address,
            status,
        });
    }

    pub fn record_error(&self, operation_id: &str, message: &str) {
        self.emit(ProgressEvent::Error {
            operation_id: operation_id.to_string(),
            message: message.to_string(),
        });
    }

    pub fn finish(&self, status: PlanStatus) {
        let plan_id = self
            .meta
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .plan_id
            .clone();
        self.emit(ProgressEvent::Progress(self.snapshot()));
        self.emit(ProgressEvent::Complete { plan_id, status });
    }

    pub fn status(&self, operation_id: &str) -> Option<OperationStatus> {
        self.operations.get(operation_id).map(|e| e.2)
    }

    pub fn snapshot(&self) -> ExecutorProgress {
        let meta = self.meta.read().unwrap_or_else(PoisonError::into_inner);
        let mut progress = ExecutorProgress {
            plan_id: meta.plan_id.clone(),
            current_stage: meta.current_stage,
            max_stage: meta.max_stage,
            started_at: meta.started_at,
            ..Default::default()
        };
        drop(meta);

        for entry in self.operations.iter() {
            let (stage, _, status) = entry.value();
            let stage_progress = progress.stages.entry(*stage).or_default();
            stage_progress.total += 1;
            progress.total += 1;
            match status {
                OperationStatus::Completed => {
                    stage_progress.completed += 1;
                    progress.completed += 1;
                }
                OperationStatus::Skipped => {
                    stage_progress.skipped += 1;
                    stage_progress.completed += 1;
                    progress.skipped += 1;
                    progress.completed += 1;
                }
                OperationStatus::Failed => {
                    stage_progress.failed += 1;
                    progress.failed += 1;
                }
                OperationStatus::Running | OperationStatus::Retrying => {
                    stage_progress.running += 1;
                    progress.running += 1;
                }
                OperationStatus::Pending => progress.pending += 1,
            }
        }
        progress.percent = if progress.total == 0 {
            100.0
        } else {
            (progress.completed + progress.failed) as f64 * 100.0 / progress.total as f64
        };
        progress
    }

    /// Start the periodic progress ticker. Starting twice is a no-op.
    pub fn start(self: &Arc<Self>, parent: &CancellationToken) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return;
        }
        let token = parent.child_token();
        let child = token.clone();
        let tracker = Arc::clone(self);
        let interval = self.interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = child.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        tracker.emit(ProgressEvent::Progress(tracker.snapshot()));
                    }
                }
            }
        });
        *worker = Some((token, handle));
    }

    pub async fn stop(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((token, handle)) = worker {
            token.cancel();
            let _ = handle.await;
        }
    }
}
