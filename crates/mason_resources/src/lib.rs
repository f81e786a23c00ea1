//! Named concurrency governors. Every parallel section of the engine runs
//! under a `Resource`: a counting semaphore bounds simultaneous tasks, and a
//! single pacer task meters reported bytes against the throughput budget in
//! strict arrival order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use mason_core::{CancelToken, Cancelled};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

/// Limits for one resource class. A `max_throughput` of zero means
/// unbounded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSettings {
    pub max_tasks: usize,
    #[serde(default)]
    pub max_throughput: u64,
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            max_tasks: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            max_throughput: 0,
        }
    }
}

/// Snapshot of a resource's current load.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub name: String,
    pub running: usize,
    pub waiting: usize,
    pub total_bytes: u64,
}

/// One live entry in the job registry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: u64,
    pub description: String,
    pub size: u64,
    pub current: u64,
}

struct JobEntry {
    description: String,
    size: u64,
    current: Arc<AtomicU64>,
}

struct PacerRequest {
    bytes: u64,
    ack: oneshot::Sender<()>,
}

struct Inner {
    name: String,
    semaphore: RwLock<Arc<Semaphore>>,
    max_throughput: AtomicU64,
    jobs: Mutex<HashMap<u64, JobEntry>>,
    next_id: AtomicU64,
    waiting: AtomicUsize,
    total_bytes: AtomicU64,
    pacer_tx: mpsc::Sender<PacerRequest>,
}

/// A ticket for one task slot. Dropping the job releases the slot; progress
/// flows through `Resource::report`.
pub struct Job {
    pub id: u64,
    pub started: bool,
    description: String,
    size: u64,
    current: Arc<AtomicU64>,
    _permit: OwnedSemaphorePermit,
}

impl Job {
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct Resource {
    inner: Arc<Inner>,
}

impl Resource {
    /// Spawns the pacer task on the current runtime. The pacer shuts down
    /// when the token fires, acknowledging anything still queued so no
    /// reporter is left hanging.
    pub fn new(name: impl Into<String>, settings: ResourceSettings, token: CancelToken) -> Self {
        let (pacer_tx, pacer_rx) = mpsc::channel::<PacerRequest>(64);
        let inner = Arc::new(Inner {
            name: name.into(),
            semaphore: RwLock::new(Arc::new(Semaphore::new(settings.max_tasks))),
            max_throughput: AtomicU64::new(settings.max_throughput),
            jobs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            waiting: AtomicUsize::new(0),
            total_bytes: AtomicU64::new(0),
            pacer_tx,
        });

        tokio::spawn(run_pacer(Arc::clone(&inner), pacer_rx, token));

        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Waits for a task slot. Cancellation while waiting leaves every
    /// counter unchanged.
    pub async fn begin(
        &self,
        description: impl Into<String>,
        size: u64,
        token: &CancelToken,
    ) -> Result<Job, Cancelled> {
        let description = description.into();
        let semaphore = self.inner.semaphore.read().expect("semaphore lock").clone();

        self.inner.waiting.fetch_add(1, Ordering::SeqCst);
        let permit = tokio::select! {
            permit = semaphore.acquire_owned() => {
                self.inner.waiting.fetch_sub(1, Ordering::SeqCst);
                permit.expect("resource semaphore closed")
            }
            _ = token.cancelled() => {
                self.inner.waiting.fetch_sub(1, Ordering::SeqCst);
                return Err(Cancelled);
            }
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let current = Arc::new(AtomicU64::new(0));
        self.inner.jobs.lock().expect("job registry lock").insert(
            id,
            JobEntry {
                description: description.clone(),
                size,
                current: Arc::clone(&current),
            },
        );
        trace!(resource = %self.inner.name, id, %description, "job started");

        Ok(Job {
            id,
            started: true,
            description,
            size,
            current,
            _permit: permit,
        })
    }

    /// Pays for `bytes` at the throughput budget before returning. Counters
    /// are bumped up front, so a cancellation mid-wait surrenders the credit
    /// rather than refunding it.
    pub async fn report(
        &self,
        job: &Job,
        bytes: u64,
        token: &CancelToken,
    ) -> Result<(), Cancelled> {
        self.account(job, bytes);

        let (ack_tx, ack_rx) = oneshot::channel();
        let request = PacerRequest {
            bytes,
            ack: ack_tx,
        };
        if self.inner.pacer_tx.send(request).await.is_err() {
            // Pacer already shut down; treat as unbounded.
            return token.check();
        }

        tokio::select! {
            _ = ack_rx => Ok(()),
            _ = token.cancelled() => Err(Cancelled),
        }
    }

    /// Updates counters without pacing. Monitoring-only signals use this.
    pub fn report_no_wait(&self, job: &Job, bytes: u64) {
        self.account(job, bytes);
    }

    fn account(&self, job: &Job, bytes: u64) {
        job.current.fetch_add(bytes, Ordering::Relaxed);
        self.inner.total_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Releases the task slot and drops the registry entry.
    pub fn finish(&self, job: Job) {
        self.inner
            .jobs
            .lock()
            .expect("job registry lock")
            .remove(&job.id);
        trace!(resource = %self.inner.name, id = job.id, "job finished");
        // The permit drops with the job, releasing the slot.
    }

    pub fn status_report(&self) -> StatusReport {
        let running = self.inner.jobs.lock().expect("job registry lock").len();
        StatusReport {
            name: self.inner.name.clone(),
            running,
            waiting: self.inner.waiting.load(Ordering::SeqCst),
            total_bytes: self.inner.total_bytes.load(Ordering::Relaxed),
        }
    }

    pub fn jobs(&self) -> Vec<JobSnapshot> {
        let jobs = self.inner.jobs.lock().expect("job registry lock");
        let mut out: Vec<_> = jobs
            .iter()
            .map(|(id, entry)| JobSnapshot {
                id: *id,
                description: entry.description.clone(),
                size: entry.size,
                current: entry.current.load(Ordering::Relaxed),
            })
            .collect();
        out.sort_by_key(|snapshot| snapshot.id);
        out
    }

    /// Swaps in new limits. The old semaphore is replaced wholesale:
    /// outstanding permits keep their reference to it and finish under the
    /// old cap; new `begin` calls see the new one.
    pub fn reload(&self, settings: ResourceSettings) {
        debug!(
            resource = %self.inner.name,
            max_tasks = settings.max_tasks,
            max_throughput = settings.max_throughput,
            "reloading resource settings"
        );
        *self.inner.semaphore.write().expect("semaphore lock") =
            Arc::new(Semaphore::new(settings.max_tasks));
        self.inner
            .max_throughput
            .store(settings.max_throughput, Ordering::SeqCst);
    }
}

/// The single pacer. Requests are acknowledged strictly in arrival order;
/// each waits `bytes / max_throughput` before its ack.
async fn run_pacer(
    inner: Arc<Inner>,
    mut rx: mpsc::Receiver<PacerRequest>,
    token: CancelToken,
) {
    loop {
        let request = tokio::select! {
            request = rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
            _ = token.cancelled() => {
                // Drain whatever is queued so reporters are released.
                while let Ok(request) = rx.try_recv() {
                    let _ = request.ack.send(());
                }
                break;
            }
        };

        let throughput = inner.max_throughput.load(Ordering::SeqCst);
        if throughput != 0 && throughput != u64::MAX {
            let delay = Duration::from_secs_f64(request.bytes as f64 / throughput as f64);
            tokio::time::sleep(delay).await;
        }
        let _ = request.ack.send(());
    }
}
