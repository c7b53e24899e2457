use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use iris_core::config::SchedulerConfig;
use tracing::{debug, error, info};

use crate::{
    error::{JobError, Result, SchedError},
    job::{now_ms, panic_message, Job},
};

/// Receives every job failure the run loop catches.
pub type ErrorHandler = Arc<dyn Fn(&JobError) + Send + Sync>;

/// Total order of the pending set: deadline first, then shorter intervals,
/// smaller offsets, and finally insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct JobKey {
    next_time: i64,
    interval: i64,
    offset: i64,
    id: u64,
}

impl JobKey {
    fn of(job: &Job, id: u64) -> Self {
        let (interval, offset) = job
            .period()
            .map(|p| (p.interval_ms(), p.offset_ms()))
            .unwrap_or((0, 0));
        Self {
            next_time: job.next_time_ms(),
            interval,
            offset,
            id,
        }
    }
}

struct Entry {
    job: Job,
    cancelled: Arc<AtomicBool>,
}

#[derive(Default)]
struct State {
    pending: BTreeMap<JobKey, Entry>,
    /// id → current key, for removal of pending jobs.
    keys: HashMap<u64, JobKey>,
    shutdown: bool,
}

struct Shared {
    name: String,
    state: Mutex<State>,
    wake: Condvar,
    next_id: AtomicU64,
    error_handler: RwLock<ErrorHandler>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(_) => fatal(&self.name, "pending set lock poisoned"),
        }
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, State>, timeout: Option<Duration>) -> MutexGuard<'a, State> {
        let woke = match timeout {
            Some(t) => self.wake.wait_timeout(guard, t).ok().map(|(g, _)| g),
            None => self.wake.wait(guard).ok(),
        };
        match woke {
            Some(guard) => guard,
            None => fatal(&self.name, "pending set lock poisoned while waiting"),
        }
    }

    fn handler(&self) -> ErrorHandler {
        match self.error_handler.read() {
            Ok(h) => Arc::clone(&h),
            Err(_) => fatal(&self.name, "error handler lock poisoned"),
        }
    }

    fn insert(&self, state: &mut State, id: u64, entry: Entry) {
        let key = JobKey::of(&entry.job, id);
        state.keys.insert(id, key);
        state.pending.insert(key, entry);
    }
}

/// Log and terminate: the scheduler cannot vouch for its own state any more.
fn fatal(scheduler: &str, what: &str) -> ! {
    error!(scheduler, "{what}; terminating process");
    std::process::exit(1)
}

fn log_failure(err: &JobError) {
    error!(job = %err.job(), "job failed: {err}");
}

/// Identifies a job added to a scheduler.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: u64,
    name: String,
    cancelled: Arc<AtomicBool>,
}

impl JobHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Cloneable handle for adding and removing jobs while the loop runs.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Queue a job. Wakes the loop so an earlier deadline is seen at once.
    pub fn add_job(&self, job: Job) -> JobHandle {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = JobHandle {
            id,
            name: job.name().to_string(),
            cancelled: Arc::clone(&cancelled),
        };
        debug!(scheduler = %self.shared.name, job = %job.name(), id, next = %job.next_time(), "job added");
        let mut state = self.shared.lock();
        self.shared.insert(&mut state, id, Entry { job, cancelled });
        drop(state);
        self.shared.wake.notify_one();
        handle
    }

    /// Cancel a job.
    ///
    /// A pending job is dropped immediately; a job that is running right now
    /// finishes but is not rescheduled. Returns whether a pending entry was
    /// removed.
    pub fn remove_job(&self, handle: &JobHandle) -> bool {
        let mut state = self.shared.lock();
        handle.cancelled.store(true, Ordering::SeqCst);
        let removed = match state.keys.remove(&handle.id) {
            Some(key) => state.pending.remove(&key).is_some(),
            None => false,
        };
        drop(state);
        self.shared.wake.notify_one();
        debug!(scheduler = %self.shared.name, job = %handle.name, id = handle.id, removed, "job removed");
        removed
    }

    /// Number of jobs waiting in the pending set (excludes one running now).
    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Replace the handler that receives job failures (default: log).
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&JobError) + Send + Sync + 'static,
    {
        match self.shared.error_handler.write() {
            Ok(mut h) => *h = Arc::new(handler),
            Err(_) => fatal(&self.shared.name, "error handler lock poisoned"),
        }
    }
}

/// One dedicated thread running the earliest-due job from its pending set.
///
/// Dropping the scheduler stops the loop after any job in flight and joins
/// the thread.
pub struct Scheduler {
    handle: SchedulerHandle,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl Scheduler {
    /// Spawn the scheduler thread, named `name`.
    pub fn start(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let shared = Arc::new(Shared {
            name: name.clone(),
            state: Mutex::new(State::default()),
            wake: Condvar::new(),
            next_id: AtomicU64::new(0),
            error_handler: RwLock::new(Arc::new(log_failure)),
        });
        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run(worker))
            .map_err(|source| SchedError::ThreadSpawn {
                name: name.clone(),
                source,
            })?;
        let thread_id = thread.thread().id();
        info!(scheduler = %name, "scheduler started");
        Ok(Self {
            handle: SchedulerHandle { shared },
            thread: Some(thread),
            thread_id,
        })
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }
}

impl std::ops::Deref for Scheduler {
    type Target = SchedulerHandle;

    fn deref(&self) -> &SchedulerHandle {
        &self.handle
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.handle.shared.lock().shutdown = true;
        self.handle.shared.wake.notify_all();
        if let Some(thread) = self.thread.take() {
            // a job dropping its own scheduler must not wait on itself
            if thread::current().id() != self.thread_id {
                let _ = thread.join();
            }
        }
        info!(scheduler = %self.handle.shared.name, "scheduler stopped");
    }
}

/// The timer and flush schedulers every server runs, named from `[scheduler]`.
///
/// Polls go on the timer thread; slow completion work such as the 5-minute
/// flush goes on the flush thread so it never delays the next poll.
pub struct Schedulers {
    pub timer: Scheduler,
    pub flush: Scheduler,
}

impl Schedulers {
    pub fn start(config: &SchedulerConfig) -> Result<Self> {
        Ok(Self {
            timer: Scheduler::start(config.timer_name.clone())?,
            flush: Scheduler::start(config.flush_name.clone())?,
        })
    }
}

/// Take the earliest job once it is due, blocking until then.
fn next_due(shared: &Shared) -> Option<(u64, Entry)> {
    let mut state = shared.lock();
    loop {
        if state.shutdown {
            return None;
        }
        let first = state.pending.keys().next().copied();
        let timeout = match first {
            None => None,
            Some(key) => {
                let now = now_ms();
                if key.next_time <= now {
                    let entry = state.pending.remove(&key)?;
                    state.keys.remove(&key.id);
                    return Some((key.id, entry));
                }
                Some(Duration::from_millis((key.next_time - now) as u64))
            }
        };
        state = shared.wait(state, timeout);
    }
}

fn run(shared: Arc<Shared>) {
    while let Some((id, mut entry)) = next_due(&shared) {
        if let Err(err) = entry.job.perform() {
            let handler = shared.handler();
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(&err))) {
                error!(
                    scheduler = %shared.name,
                    panic = %panic_message(payload.as_ref()),
                    "error handler panicked"
                );
                fatal(&shared.name, "unrecoverable failure in error handler");
            }
        }
        if entry.job.is_periodic() {
            let mut state = shared.lock();
            if !entry.cancelled.load(Ordering::SeqCst) && !state.shutdown {
                shared.insert(&mut state, id, entry);
            }
        }
    }
    debug!(scheduler = %shared.name, "run loop exited");
}
