use crate::{
    http::env_u64,
    models::{ApiError, RewriteFailure, RewriteRequest, RewriteResult},
    pipeline::Pipeline,
    quota::Credit,
    security::AuthContext,
};
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    entries: Arc<Mutex<HashMap<Uuid, JobEntry>>>,
    pipeline: Pipeline,
    ttl: Duration,
}

struct Job {
    id: Uuid,
    request: RewriteRequest,
    context: AuthContext,
    credit: Credit,
}

/// Finished entries are dropped once `ttl` has passed since they finished.
struct JobEntry {
    owner: String,
    state: JobState,
    finished: Option<Instant>,
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed { result: RewriteResult },
    Failed { failure: RewriteFailure },
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
}

impl JobQueue {
    pub fn spawn(pipeline: Pipeline) -> (Self, JoinHandle<()>) {
        let capacity = env_u64("QUEUE_CAPACITY", 64).max(1) as usize;
        let ttl = Duration::from_secs(env_u64("JOB_TTL_SECS", 3600));
        Self::start(pipeline, capacity, ttl)
    }

    fn start(pipeline: Pipeline, capacity: usize, ttl: Duration) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(capacity);
        let entries: Arc<Mutex<HashMap<Uuid, JobEntry>>> = Arc::new(Mutex::new(HashMap::new()));
        let entries_bg = entries.clone();
        let worker = pipeline.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                set_state(&entries_bg, job.id, JobState::Running).await;
                debug!(target: "wb.api", job_id = %job.id, "job_started");

                let state = match worker.run(job.request, &job.context, job.credit).await {
                    Ok(result) => JobState::Completed { result },
                    Err(failure) => JobState::Failed { failure },
                };
                let mut guard = entries_bg.lock().await;
                if let Some(entry) = guard.get_mut(&job.id) {
                    entry.state = state;
                    entry.finished = Some(Instant::now());
                }
                prune(&mut guard, ttl);
            }
        });

        (
            Self {
                tx,
                entries,
                pipeline,
                ttl,
            },
            handle,
        )
    }

    /// Queues a rewrite on a credit already reserved for `context`.
    pub async fn enqueue(
        &self,
        request: RewriteRequest,
        context: AuthContext,
        credit: Credit,
    ) -> Result<Uuid, ApiError> {
        let id = Uuid::new_v4();
        {
            let mut guard = self.entries.lock().await;
            prune(&mut guard, self.ttl);
            guard.insert(
                id,
                JobEntry {
                    owner: context.identity.clone(),
                    state: JobState::Queued,
                    finished: None,
                },
            );
        }
        let job = Job {
            id,
            request,
            context,
            credit,
        };
        if let Err(mpsc::error::SendError(job)) = self.tx.send(job).await {
            self.entries.lock().await.remove(&id);
            if let Err(err) = self.pipeline.quota().refund(job.credit).await {
                warn!(target: "wb.quota", error = %err, "quota_refund_failed");
            }
            return Err(ApiError {
                error: "queue_send_failed".into(),
                detail: Some("worker not available".into()),
            });
        }
        Ok(id)
    }

    /// Jobs are visible only to the identity that queued them.
    pub async fn get(&self, id: Uuid, identity: &str) -> Option<JobInfo> {
        let mut guard = self.entries.lock().await;
        prune(&mut guard, self.ttl);
        guard
            .get(&id)
            .filter(|entry| entry.owner == identity)
            .map(|entry| JobInfo {
                id: id.to_string(),
                state: entry.state.clone(),
            })
    }
}

async fn set_state(entries: &Mutex<HashMap<Uuid, JobEntry>>, id: Uuid, state: JobState) {
    if let Some(entry) = entries.lock().await.get_mut(&id) {
        entry.state = state;
    }
}

fn prune(entries: &mut HashMap<Uuid, JobEntry>, ttl: Duration) {
    entries.retain(|_, entry| entry.finished.is_none_or(|at| at.elapsed() < ttl));
}
