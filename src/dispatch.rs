use crate::errors::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::RwLock;
use tokio::sync::{Mutex, Notify};
use tokio::time::Duration;

#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job_id: String,
    pub project_id: String,
    pub priority: i32,
    pub queued_at: DateTime<Utc>,
    /// Retries are held back until their backoff elapses.
    pub not_before: DateTime<Utc>,
}

pub type ExecutorFuture = Pin<Box<dyn Future<Output = bool> + Send>>;
pub type JobExecutor = Arc<dyn Fn(String) -> ExecutorFuture + Send + Sync>;

/// In-process priority queue in front of job execution. Enforces a global and a
/// per-project concurrency limit; persistence of job state lives elsewhere.
#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<Mutex<Vec<QueuedJob>>>,
    running_global: Arc<Mutex<usize>>,
    running_project: Arc<Mutex<HashMap<String, usize>>>,
    notify: Arc<Notify>,
    executor: Arc<RwLock<Option<JobExecutor>>>,
    global_limit: usize,
    per_project_limit: usize,
    max_queue_size: usize,
}

impl Dispatcher {
    pub fn new(global_limit: usize, per_project_limit: usize, max_queue_size: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(Vec::new())),
            running_global: Arc::new(Mutex::new(0)),
            running_project: Arc::new(Mutex::new(HashMap::new())),
            notify: Arc::new(Notify::new()),
            executor: Arc::new(RwLock::new(None)),
            global_limit: global_limit.max(1),
            per_project_limit: per_project_limit.max(1),
            max_queue_size,
        }
    }

    pub fn set_executor(&self, executor: JobExecutor) {
        let mut writer = self
            .executor
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *writer = Some(executor);
    }

    pub async fn enqueue(&self, job: QueuedJob) -> EngineResult<()> {
        {
            let mut queue = self.queue.lock().await;
            if queue.iter().any(|queued| queued.job_id == job.job_id) {
                return Ok(());
            }
            if queue.len() >= self.max_queue_size {
                return Err(EngineError::Orchestration(format!(
                    "queue capacity exceeded (max {})",
                    self.max_queue_size
                )));
            }
            queue.push(job);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Drops a job that has not started yet. Returns whether it was queued.
    pub async fn remove(&self, job_id: &str) -> bool {
        let mut queue = self.queue.lock().await;
        let before = queue.len();
        queue.retain(|queued| queued.job_id != job_id);
        queue.len() != before
    }

    pub async fn queued_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub fn start(&self) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.run_loop().await;
        });
    }

    async fn run_loop(self) {
        loop {
            self.notify.notified().await;
            loop {
                let (maybe_job, next_delay) = self.reserve_next_job().await;
                let Some(job) = maybe_job else {
                    if let Some(delay) = next_delay {
                        let notify = self.notify.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            notify.notify_one();
                        });
                    }
                    break;
                };

                let dispatcher = self.clone();
                tokio::spawn(async move {
                    let succeeded = dispatcher.execute(job.job_id.clone()).await;
                    dispatcher.release_slot(&job.project_id).await;
                    if !succeeded {
                        tracing::warn!(job_id = %job.job_id, project_id = %job.project_id, "dispatched job did not complete");
                    }
                    dispatcher.notify.notify_one();
                });
            }
        }
    }

    async fn execute(&self, job_id: String) -> bool {
        let executor = self
            .executor
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match executor {
            Some(executor) => executor(job_id).await,
            None => false,
        }
    }

    /// Takes the best ready job whose project still has a free slot and reserves
    /// that slot. Jobs of saturated projects stay queued without blocking the rest.
    /// The delay is how long until the earliest held-back retry becomes ready.
    async fn reserve_next_job(&self) -> (Option<QueuedJob>, Option<Duration>) {
        let mut queue = self.queue.lock().await;
        if queue.is_empty() {
            return (None, None);
        }
        let mut global = self.running_global.lock().await;
        if *global >= self.global_limit {
            return (None, None);
        }
        let mut project_map = self.running_project.lock().await;

        let now = Utc::now();
        let best_index = queue
            .iter()
            .enumerate()
            .filter(|(_, job)| job.not_before <= now)
            .filter(|(_, job)| project_map.get(&job.project_id).copied().unwrap_or(0) < self.per_project_limit)
            .max_by_key(|(_, job)| effective_priority(job, now))
            .map(|(index, _)| index);

        match best_index {
            Some(index) => {
                let job = queue.remove(index);
                *global += 1;
                *project_map.entry(job.project_id.clone()).or_insert(0) += 1;
                (Some(job), None)
            }
            None => {
                let delay = queue
                    .iter()
                    .filter(|job| job.not_before > now)
                    .map(|job| job.not_before)
                    .min()
                    .map(|at| {
                        let diff = at.signed_duration_since(now).num_milliseconds();
                        Duration::from_millis(u64::try_from(diff).unwrap_or(0))
                    });
                (None, delay)
            }
        }
    }

    async fn release_slot(&self, project_id: &str) {
        let mut global = self.running_global.lock().await;
        if *global > 0 {
            *global -= 1;
        }

        let mut project_map = self.running_project.lock().await;
        if let Some(entry) = project_map.get_mut(project_id) {
            if *entry > 0 {
                *entry -= 1;
            }
            if *entry == 0 {
                project_map.remove(project_id);
            }
        }
    }
}

/// One priority step is worth 100 points; waiting adds a point every 15 seconds.
fn effective_priority(job: &QueuedJob, now: DateTime<Utc>) -> i64 {
    let waited = (now - job.queued_at).num_seconds().max(0);
    i64::from(job.priority) * 100 + waited / 15
}
