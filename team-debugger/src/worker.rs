// Job worker
//
// Runs key-deduplicated jobs on a bounded pool of tokio tasks. A job may wait
// for another job's key; while it waits it hands its pool slot back, so a
// chain of dependent jobs completes even with a single slot.

use crate::error::{DebuggerError, DebuggerResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobType {
    LoadImageDebugInfo,
    GetThreadState,
    GetCpuState,
    GetStackTrace,
    ResolveValueNodeValue,
    WriteValueNodeValue,
    EvaluateExpression,
    RetrieveMemoryBlock,
    WriteMemory,
    GenerateReport,
    Custom(u32),
}

/// Identifies a job by the object it works on and what it does with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub subject: u64,
    pub job_type: JobType,
}

impl JobKey {
    pub fn new(subject: u64, job_type: JobType) -> Self {
        Self { subject, job_type }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({:#x})", self.job_type, self.subject)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Waiting,
    Active,
    WaitingForDependency,
    WaitingForInput,
    Succeeded,
    Failed,
    Aborted,
}

impl JobState {
    pub fn is_finished(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Aborted)
    }
}

/// Outcome of waiting for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobWaitStatus {
    Succeeded,
    Failed,
    Aborted,
    /// No job with that key. Usually the job already finished.
    NotFound,
}

impl JobWaitStatus {
    /// Dependency callers count a vanished job as done.
    pub fn is_success(self) -> bool {
        matches!(self, JobWaitStatus::Succeeded | JobWaitStatus::NotFound)
    }
}

#[async_trait]
pub trait Job: Send + Sync {
    fn key(&self) -> JobKey;

    fn description(&self) -> String {
        self.key().to_string()
    }

    async fn run(&self, ctx: &JobContext) -> DebuggerResult<()>;
}

/// Job lifecycle callbacks. They run on the job's task.
pub trait JobListener: Send + Sync {
    fn job_started(&self, _key: JobKey, _description: &str) {}
    fn job_done(&self, _key: JobKey) {}
    fn job_failed(&self, _key: JobKey, _error: &DebuggerError) {}
    fn job_aborted(&self, _key: JobKey) {}
    fn job_waiting_for_input(&self, _key: JobKey) {}
}

struct JobEntry {
    job: Arc<dyn Job>,
    listener: Option<Arc<dyn JobListener>>,
    state: watch::Sender<JobState>,
    abort: watch::Sender<bool>,
    input: watch::Sender<u64>,
}

struct WorkerInner {
    jobs: Mutex<HashMap<JobKey, Arc<JobEntry>>>,
    permits: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("jobs", &self.inner.jobs.lock().len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Worker {
    pub fn new(max_concurrent_jobs: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(WorkerInner {
                jobs: Mutex::new(HashMap::new()),
                permits: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
                shutdown,
            }),
        }
    }

    /// Schedules `job`. Fails with `AlreadyInProgress` if a job with the same
    /// key is still active; the caller should wait for that one instead.
    pub fn schedule_job(
        &self,
        job: Arc<dyn Job>,
        listener: Option<Arc<dyn JobListener>>,
    ) -> DebuggerResult<()> {
        if self.is_shut_down() {
            return Err(DebuggerError::Shutdown);
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| DebuggerError::Unsupported(format!("no async runtime: {}", e)))?;

        let key = job.key();
        let entry = {
            let mut jobs = self.inner.jobs.lock();
            if jobs.contains_key(&key) {
                debug!("Job {} already scheduled", key);
                return Err(DebuggerError::AlreadyInProgress(key.to_string()));
            }
            let (state, _) = watch::channel(JobState::Waiting);
            let (abort, _) = watch::channel(false);
            let (input, _) = watch::channel(0);
            let entry = Arc::new(JobEntry {
                job,
                listener,
                state,
                abort,
                input,
            });
            jobs.insert(key, entry.clone());
            entry
        };

        debug!("Scheduled job {}", entry.job.description());
        let worker = self.clone();
        runtime.spawn(async move { worker.process_job(entry).await });
        Ok(())
    }

    /// Waits until the job with `key` has finished.
    pub async fn wait_for(&self, key: JobKey) -> JobWaitStatus {
        let mut state_rx = {
            let jobs = self.inner.jobs.lock();
            match jobs.get(&key) {
                Some(entry) => entry.state.subscribe(),
                None => return JobWaitStatus::NotFound,
            }
        };
        let mut shutdown_rx = self.inner.shutdown.subscribe();
        if *shutdown_rx.borrow() {
            return JobWaitStatus::Aborted;
        }

        tokio::select! {
            state = state_rx.wait_for(|s| s.is_finished()) => match state {
                Ok(state) => wait_status(*state),
                Err(_) => JobWaitStatus::Aborted,
            },
            _ = shutdown_rx.wait_for(|s| *s) => JobWaitStatus::Aborted,
        }
    }

    /// Asks the job with `key` to stop. Running jobs notice it the next time
    /// they poll or wait.
    pub fn abort_job(&self, key: JobKey) -> bool {
        let entry = self.inner.jobs.lock().get(&key).cloned();
        match entry {
            Some(entry) => {
                debug!("Aborting job {}", key);
                entry.abort.send_replace(true);
                true
            }
            None => false,
        }
    }

    pub fn get_job(&self, key: JobKey) -> Option<Arc<dyn Job>> {
        self.inner.jobs.lock().get(&key).map(|e| e.job.clone())
    }

    pub fn job_state(&self, key: JobKey) -> Option<JobState> {
        self.inner.jobs.lock().get(&key).map(|e| *e.state.borrow())
    }

    /// Wakes a job blocked in `JobContext::wait_for_input`.
    pub fn resume_job(&self, key: JobKey) -> bool {
        let entry = self.inner.jobs.lock().get(&key).cloned();
        match entry {
            Some(entry) => {
                entry.input.send_modify(|n| *n += 1);
                true
            }
            None => false,
        }
    }

    pub fn has_pending_jobs(&self) -> bool {
        !self.inner.jobs.lock().is_empty()
    }

    pub fn count_jobs(&self) -> usize {
        self.inner.jobs.lock().len()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Aborts every job and releases all waiters with `Aborted`.
    pub fn shut_down(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        info!("Worker shutting down");
        self.inner.permits.close();
        let entries: Vec<Arc<JobEntry>> = self.inner.jobs.lock().values().cloned().collect();
        for entry in entries {
            entry.abort.send_replace(true);
        }
    }

    async fn process_job(&self, entry: Arc<JobEntry>) {
        let key = entry.job.key();
        let mut abort_rx = entry.abort.subscribe();

        let permit = tokio::select! {
            permit = self.inner.permits.clone().acquire_owned() => permit.ok(),
            _ = abort_rx.wait_for(|a| *a) => None,
        };
        let Some(permit) = permit else {
            self.finish_job(&entry, Err(DebuggerError::Aborted));
            return;
        };

        entry.state.send_replace(JobState::Active);
        let description = entry.job.description();
        debug!("Job {} started", description);
        if let Some(listener) = &entry.listener {
            listener.job_started(key, &description);
        }

        let ctx = JobContext {
            worker: self.clone(),
            entry: entry.clone(),
            permit: Mutex::new(Some(permit)),
        };
        let result = entry.job.run(&ctx).await;
        drop(ctx);

        self.finish_job(&entry, result);
    }

    fn finish_job(&self, entry: &Arc<JobEntry>, result: DebuggerResult<()>) {
        let key = entry.job.key();
        let aborted = *entry.abort.borrow();
        let state = match &result {
            Ok(()) => JobState::Succeeded,
            Err(DebuggerError::Aborted) => JobState::Aborted,
            Err(_) if aborted => JobState::Aborted,
            Err(_) => JobState::Failed,
        };

        entry.state.send_replace(state);
        {
            let mut jobs = self.inner.jobs.lock();
            if jobs.get(&key).is_some_and(|current| Arc::ptr_eq(current, entry)) {
                jobs.remove(&key);
            }
        }

        match (&result, state) {
            (Err(e), JobState::Failed) => {
                warn!("Job {} failed: {}", key, e);
                if let Some(listener) = &entry.listener {
                    listener.job_failed(key, e);
                }
            }
            (_, JobState::Aborted) => {
                debug!("Job {} aborted", key);
                if let Some(listener) = &entry.listener {
                    listener.job_aborted(key);
                }
            }
            _ => {
                debug!("Job {} done", key);
                if let Some(listener) = &entry.listener {
                    listener.job_done(key);
                }
            }
        }
    }
}

fn wait_status(state: JobState) -> JobWaitStatus {
    match state {
        JobState::Succeeded => JobWaitStatus::Succeeded,
        JobState::Failed => JobWaitStatus::Failed,
        _ => JobWaitStatus::Aborted,
    }
}

/// Handed to `Job::run`: abort polling and dependency waits.
pub struct JobContext {
    worker: Worker,
    entry: Arc<JobEntry>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl JobContext {
    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    pub fn key(&self) -> JobKey {
        self.entry.job.key()
    }

    pub fn is_aborted(&self) -> bool {
        *self.entry.abort.borrow()
    }

    pub fn check_aborted(&self) -> DebuggerResult<()> {
        if self.is_aborted() {
            Err(DebuggerError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Suspends this job until the job with `key` finishes. The pool slot
    /// is released for the duration of the wait.
    pub async fn wait_for(&self, key: JobKey) -> JobWaitStatus {
        if key == self.key() {
            warn!("Job {} tried to wait for itself", key);
            return JobWaitStatus::Failed;
        }

        let mut abort_rx = self.entry.abort.subscribe();
        self.release_slot(JobState::WaitingForDependency);
        let status = tokio::select! {
            status = self.worker.wait_for(key) => status,
            _ = abort_rx.wait_for(|a| *a) => JobWaitStatus::Aborted,
        };

        if self.reacquire_slot().await {
            status
        } else {
            JobWaitStatus::Aborted
        }
    }

    /// Parks the job until `Worker::resume_job` is called for it.
    pub async fn wait_for_input(&self) -> DebuggerResult<()> {
        let mut input_rx = self.entry.input.subscribe();
        let seen = *input_rx.borrow_and_update();
        let mut abort_rx = self.entry.abort.subscribe();

        self.release_slot(JobState::WaitingForInput);
        if let Some(listener) = &self.entry.listener {
            listener.job_waiting_for_input(self.key());
        }

        let resumed = tokio::select! {
            result = input_rx.wait_for(|n| *n != seen) => result.is_ok(),
            _ = abort_rx.wait_for(|a| *a) => false,
        };

        if resumed && self.reacquire_slot().await {
            Ok(())
        } else {
            Err(DebuggerError::Aborted)
        }
    }

    fn release_slot(&self, state: JobState) {
        let permit = self.permit.lock().take();
        drop(permit);
        self.entry.state.send_replace(state);
    }

    async fn reacquire_slot(&self) -> bool {
        match self.worker.inner.permits.clone().acquire_owned().await {
            Ok(permit) => {
                *self.permit.lock() = Some(permit);
                self.entry.state.send_replace(JobState::Active);
                true
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct GatedJob {
        subject: u64,
        gate: Arc<Semaphore>,
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Job for GatedJob {
        fn key(&self) -> JobKey {
            JobKey::new(self.subject, JobType::Custom(1))
        }

        async fn run(&self, _ctx: &JobContext) -> DebuggerResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| DebuggerError::Aborted)?;
            Ok(())
        }
    }

    struct ChainJob {
        subject: u64,
        child: Option<u64>,
        log: Arc<Mutex<Vec<u64>>>,
    }

    #[async_trait]
    impl Job for ChainJob {
        fn key(&self) -> JobKey {
            JobKey::new(self.subject, JobType::Custom(2))
        }

        async fn run(&self, ctx: &JobContext) -> DebuggerResult<()> {
            if let Some(child) = self.child {
                let job = Arc::new(ChainJob {
                    subject: child,
                    child: None,
                    log: self.log.clone(),
                });
                let key = job.key();
                ctx.worker().schedule_job(job, None)?;
                if !ctx.wait_for(key).await.is_success() {
                    return Err(DebuggerError::Evaluation("child failed".to_string()));
                }
            }
            self.log.lock().push(self.subject);
            Ok(())
        }
    }

    struct FailingJob;

    #[async_trait]
    impl Job for FailingJob {
        fn key(&self) -> JobKey {
            JobKey::new(99, JobType::Custom(3))
        }

        async fn run(&self, _ctx: &JobContext) -> DebuggerResult<()> {
            Err(DebuggerError::TargetIo("read failed".to_string()))
        }
    }

    struct PollingJob;

    #[async_trait]
    impl Job for PollingJob {
        fn key(&self) -> JobKey {
            JobKey::new(7, JobType::Custom(4))
        }

        async fn run(&self, ctx: &JobContext) -> DebuggerResult<()> {
            loop {
                ctx.check_aborted()?;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    struct InputJob {
        done: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Job for InputJob {
        fn key(&self) -> JobKey {
            JobKey::new(8, JobType::Custom(5))
        }

        async fn run(&self, ctx: &JobContext) -> DebuggerResult<()> {
            ctx.wait_for_input().await?;
            self.done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        failed: Mutex<Vec<JobKey>>,
        done: Mutex<Vec<JobKey>>,
    }

    impl JobListener for RecordingListener {
        fn job_done(&self, key: JobKey) {
            self.done.lock().push(key);
        }

        fn job_failed(&self, key: JobKey, _error: &DebuggerError) {
            self.failed.lock().push(key);
        }
    }

    #[tokio::test]
    async fn test_duplicate_key_runs_once() {
        let worker = Worker::new(4);
        let gate = Arc::new(Semaphore::new(0));
        let runs = Arc::new(AtomicUsize::new(0));
        let make = || {
            Arc::new(GatedJob {
                subject: 1,
                gate: gate.clone(),
                runs: runs.clone(),
            }) as Arc<dyn Job>
        };

        let first = worker.schedule_job(make(), None);
        let second = worker.schedule_job(make(), None);
        assert!(first.is_ok());
        assert!(matches!(second, Err(DebuggerError::AlreadyInProgress(_))));

        // The second caller joins instead of duplicating. The waiter
        // subscribes on its first poll, before the gate opens.
        let key = JobKey::new(1, JobType::Custom(1));
        assert!(worker.job_state(key).is_some());
        let (status, ()) = tokio::join!(worker.wait_for(key), async {
            gate.add_permits(1);
        });

        assert_eq!(status, JobWaitStatus::Succeeded);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!worker.has_pending_jobs());
    }

    #[tokio::test]
    async fn test_wait_for_unknown_key() {
        let worker = Worker::new(1);
        let status = worker.wait_for(JobKey::new(42, JobType::GetCpuState)).await;
        assert_eq!(status, JobWaitStatus::NotFound);
        assert!(status.is_success());
    }

    #[tokio::test]
    async fn test_dependency_chain_on_single_slot() {
        let worker = Worker::new(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        let parent = Arc::new(ChainJob {
            subject: 1,
            child: Some(2),
            log: log.clone(),
        });
        let key = parent.key();

        worker.schedule_job(parent, None).unwrap();
        let status = tokio::time::timeout(Duration::from_secs(5), worker.wait_for(key))
            .await
            .expect("dependency chain deadlocked");

        assert_eq!(status, JobWaitStatus::Succeeded);
        assert_eq!(*log.lock(), vec![2, 1]);
    }

    #[tokio::test]
    async fn test_failure_reaches_listener() {
        let worker = Worker::new(2);
        let listener = Arc::new(RecordingListener::default());
        worker
            .schedule_job(Arc::new(FailingJob), Some(listener.clone()))
            .unwrap();

        let key = JobKey::new(99, JobType::Custom(3));
        assert_eq!(worker.wait_for(key).await, JobWaitStatus::Failed);
        // Listener callbacks run right after the state is published.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*listener.failed.lock(), vec![key]);
        assert!(listener.done.lock().is_empty());
    }

    #[tokio::test]
    async fn test_abort_running_job() {
        let worker = Worker::new(2);
        worker.schedule_job(Arc::new(PollingJob), None).unwrap();
        let key = JobKey::new(7, JobType::Custom(4));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(worker.job_state(key), Some(JobState::Active));
        assert!(worker.abort_job(key));
        assert_eq!(worker.wait_for(key).await, JobWaitStatus::Aborted);
        assert!(!worker.abort_job(key));
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let worker = Worker::new(1);
        let gate = Arc::new(Semaphore::new(0));
        let job = Arc::new(GatedJob {
            subject: 5,
            gate: gate.clone(),
            runs: Arc::new(AtomicUsize::new(0)),
        });
        let key = job.key();
        worker.schedule_job(job, None).unwrap();

        let waiter = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.wait_for(key).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        worker.shut_down();

        assert_eq!(waiter.await.unwrap(), JobWaitStatus::Aborted);
        let again = Arc::new(GatedJob {
            subject: 6,
            gate,
            runs: Arc::new(AtomicUsize::new(0)),
        });
        assert!(matches!(
            worker.schedule_job(again, None),
            Err(DebuggerError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_wait_for_input_and_resume() {
        let worker = Worker::new(1);
        let done = Arc::new(AtomicUsize::new(0));
        worker
            .schedule_job(Arc::new(InputJob { done: done.clone() }), None)
            .unwrap();
        let key = JobKey::new(8, JobType::Custom(5));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(worker.job_state(key), Some(JobState::WaitingForInput));
        assert_eq!(done.load(Ordering::SeqCst), 0);

        assert!(worker.resume_job(key));
        assert_eq!(worker.wait_for(key).await, JobWaitStatus::Succeeded);
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
