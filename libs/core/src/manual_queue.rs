//! Manual refresh queue: out-of-band refresh requests driven
//! through tracked job state by a fixed worker pool. Grounded on this
//! codebase's cancellation-token-guarded background task idiom, generalized
//! from a single reload signal to a full job table.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use uuid::Uuid;

use crate::metrics::{JobStateValue, Metrics};
use crate::scope::Scope;
use crate::snapshot::SnapshotService;
use crate::stream::{EnvelopeKind, StreamRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ManualJob {
    pub id: String,
    pub domain: String,
    pub scope: String,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

struct QueuedJob {
    id: String,
    domain: String,
    scope: Scope,
    cancel: CancellationToken,
}

pub struct ManualRefreshQueue {
    jobs: RwLock<HashMap<String, ManualJob>>,
    dedup: RwLock<HashMap<String, String>>,
    cancels: RwLock<HashMap<String, CancellationToken>>,
    metrics: Arc<Metrics>,
    tx: mpsc::Sender<QueuedJob>,
}

fn dedup_key(domain: &str, scope: &Scope) -> String {
    format!("{domain}\u{1}{scope}")
}

impl ManualRefreshQueue {
    pub fn new(snapshot_service: Arc<SnapshotService>, streams: Arc<StreamRegistry>, worker_count: usize) -> Arc<Self> {
        Self::with_metrics(snapshot_service, streams, worker_count, Arc::new(Metrics::default()))
    }

    pub fn with_metrics(
        snapshot_service: Arc<SnapshotService>,
        streams: Arc<StreamRegistry>,
        worker_count: usize,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<QueuedJob>(256);
        let queue = Arc::new(Self {
            jobs: RwLock::new(HashMap::new()),
            dedup: RwLock::new(HashMap::new()),
            cancels: RwLock::new(HashMap::new()),
            metrics,
            tx,
        });

        let rx = Arc::new(Mutex::new(rx));
        for worker_id in 0..worker_count.max(1) {
            let queue = queue.clone();
            let snapshot_service = snapshot_service.clone();
            let streams = streams.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(job) = job else { break };
                    queue.run_job(job, &snapshot_service, &streams).await;
                    tracing::trace!(worker_id, "manual refresh worker idle");
                }
            });
        }

        queue
    }

    /// `Submit(domain, scope) -> jobId`. Returns the existing
    /// job id if one is already queued or running for the same
    /// `(domain, scope)`.
    pub async fn submit(&self, domain: &str, scope: Scope) -> String {
        let key = dedup_key(domain, &scope);
        if let Some(existing_id) = self.dedup.read().await.get(&key).cloned() {
            if let Some(job) = self.jobs.read().await.get(&existing_id) {
                if !job.state.is_terminal() {
                    return existing_id;
                }
            }
        }

        let id = Uuid::new_v4().to_string();
        let job = ManualJob {
            id: id.clone(),
            domain: domain.to_string(),
            scope: scope.to_string(),
            state: JobState::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        };
        self.jobs.write().await.insert(id.clone(), job);
        self.dedup.write().await.insert(key, id.clone());

        let cancel = CancellationToken::new();
        self.cancels.write().await.insert(id.clone(), cancel.clone());

        if self
            .tx
            .send(QueuedJob {
                id: id.clone(),
                domain: domain.to_string(),
                scope,
                cancel,
            })
            .await
            .is_err()
        {
            error!("manual refresh queue worker channel closed; job will never run");
        }

        id
    }

    pub async fn get(&self, job_id: &str) -> Option<ManualJob> {
        self.jobs.read().await.get(job_id).cloned()
    }

    /// `Cancel(jobId)`: queued jobs move to `cancelled`
    /// immediately; running jobs are signalled and the worker finishes
    /// best-effort.
    pub async fn cancel(&self, job_id: &str) {
        let mut jobs = self.jobs.write().await;
        let mut cancelled_while_queued = false;
        if let Some(job) = jobs.get_mut(job_id) {
            match job.state {
                JobState::Queued => {
                    job.state = JobState::Cancelled;
                    job.completed_at = Some(Utc::now());
                    cancelled_while_queued = true;
                }
                JobState::Running => {
                    if let Some(cancel) = self.cancels.read().await.get(job_id) {
                        cancel.cancel();
                    }
                }
                _ => {}
            }
        }
        drop(jobs);
        if cancelled_while_queued {
            self.metrics.jobs.record(JobStateValue::Cancelled);
        }
    }

    async fn run_job(&self, queued: QueuedJob, snapshot_service: &Arc<SnapshotService>, streams: &Arc<StreamRegistry>) {
        {
            let mut jobs = self.jobs.write().await;
            if let Some(job) = jobs.get_mut(&queued.id) {
                if job.state == JobState::Cancelled {
                    return;
                }
                job.state = JobState::Running;
                job.started_at = Some(Utc::now());
            }
        }

        let build = snapshot_service.force_rebuild(&queued.domain, queued.scope.clone());
        let outcome = tokio::select! {
            result = build => result,
            _ = queued.cancel.cancelled() => {
                self.finish(&queued.id, JobState::Cancelled, None).await;
                self.dedup.write().await.remove(&dedup_key(&queued.domain, &queued.scope));
                return;
            }
        };

        match outcome {
            Ok(snapshot) => {
                self.finish(&queued.id, JobState::Succeeded, None).await;
                if let Some(hub) = streams.get(&queued.domain, &queued.scope.to_string()).await {
                    hub.publish(EnvelopeKind::Reset, snapshot.payload).await;
                }
            }
            Err(e) => {
                warn!(domain = %queued.domain, error = %e, "manual refresh job failed");
                self.finish(&queued.id, JobState::Failed, Some(e.to_string())).await;
            }
        }

        self.dedup.write().await.remove(&dedup_key(&queued.domain, &queued.scope));
        self.cancels.write().await.remove(&queued.id);
    }

    async fn finish(&self, job_id: &str, state: JobState, error: Option<String>) {
        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs.get_mut(job_id) {
            job.state = state;
            job.completed_at = Some(Utc::now());
            job.error = error;
        }
        drop(jobs);

        let label = match state {
            JobState::Succeeded => Some(JobStateValue::Succeeded),
            JobState::Failed => Some(JobStateValue::Failed),
            JobState::Cancelled => Some(JobStateValue::Cancelled),
            JobState::Queued | JobState::Running => None,
        };
        if let Some(label) = label {
            self.metrics.jobs.record(label);
        }
    }
}
