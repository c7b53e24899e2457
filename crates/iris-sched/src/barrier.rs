use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::{job::Job, scheduler::SchedulerHandle};

/// Work run once per cycle after every sub-task has reported in.
/// Receives the stamp passed to [`CompletionBarrier::reset`].
pub type CompletionAction = Arc<dyn Fn(DateTime<Utc>) -> anyhow::Result<()> + Send + Sync>;

/// Counters of the current cycle, as seen by [`CompletionBarrier::counts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierCounts {
    pub total: u32,
    pub complete: u32,
}

#[derive(Debug, Default)]
struct BarrierState {
    stamp: Option<DateTime<Utc>>,
    /// Bumped by every reset; tickets from older cycles are ignored.
    generation: u64,
    ready: bool,
    checked: bool,
    fired: bool,
    total: u32,
    complete: u32,
}

impl BarrierState {
    fn is_complete(&self) -> bool {
        self.ready && self.total <= self.complete
    }
}

/// Fan-out/fan-in counter for one polling cycle.
///
/// Sub-tasks call [`up`](Self::up) as they start and [`down`](Self::down) as
/// they finish, from any thread. Once [`make_ready`](Self::make_ready) has been
/// called and every started task has finished, the completion job is queued on
/// the barrier's scheduler, at most once per cycle. The barrier is reused:
/// [`reset`](Self::reset) starts the next cycle.
pub struct CompletionBarrier {
    name: String,
    scheduler: SchedulerHandle,
    delay: Duration,
    action: CompletionAction,
    state: Mutex<BarrierState>,
}

impl CompletionBarrier {
    pub fn new<F>(name: impl Into<String>, scheduler: SchedulerHandle, action: F) -> Self
    where
        F: Fn(DateTime<Utc>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            scheduler,
            delay: Duration::ZERO,
            action: Arc::new(action),
            state: Mutex::new(BarrierState::default()),
        }
    }

    /// Delay the completion job by `delay` once the cycle completes.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().expect("barrier state poisoned")
    }

    /// Start a new cycle. Must precede that cycle's `up`/`down` calls.
    pub fn reset(&self, stamp: DateTime<Utc>) {
        let mut s = self.lock();
        *s = BarrierState {
            stamp: Some(stamp),
            generation: s.generation + 1,
            ..BarrierState::default()
        };
        debug!(barrier = %self.name, %stamp, "cycle reset");
    }

    /// Register one more sub-task. Ignored once the cycle is ready.
    pub fn up(&self) {
        let mut s = self.lock();
        if s.ready {
            warn!(
                barrier = %self.name,
                total = s.total,
                complete = s.complete,
                "up() after make_ready ignored"
            );
            return;
        }
        s.total += 1;
    }

    /// Report one sub-task finished.
    ///
    /// A report beyond the cycle's total is logged as CORRUPT and dropped.
    pub fn down(&self) {
        self.count_down(None);
    }

    /// Close registration; fires immediately if everything already finished.
    pub fn make_ready(&self) {
        let fire = {
            let mut s = self.lock();
            s.ready = true;
            self.take_completion(&mut s)
        };
        if let Some(stamp) = fire {
            self.done(stamp);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.lock().is_complete()
    }

    /// Watchdog check run before starting the next cycle.
    ///
    /// True when the barrier was never made ready or the cycle completed.
    /// Otherwise logs the counts, marks the cycle as checked and returns
    /// false. Takes no corrective action.
    pub fn check_complete(&self) -> bool {
        let mut s = self.lock();
        if !s.ready || s.is_complete() {
            return true;
        }
        s.checked = true;
        warn!(
            barrier = %self.name,
            stamp = ?s.stamp,
            total = s.total,
            complete = s.complete,
            "incomplete: complete < total"
        );
        false
    }

    pub fn counts(&self) -> BarrierCounts {
        let s = self.lock();
        BarrierCounts {
            total: s.total,
            complete: s.complete,
        }
    }

    /// Stamp of the current cycle, if one was started.
    pub fn stamp(&self) -> Option<DateTime<Utc>> {
        self.lock().stamp
    }

    /// Register a sub-task and return a ticket that reports it finished.
    pub fn enter(self: &Arc<Self>) -> Ticket {
        let generation = {
            let mut s = self.lock();
            if s.ready {
                warn!(barrier = %self.name, "enter() after make_ready ignored");
                None
            } else {
                s.total += 1;
                Some(s.generation)
            }
        };
        Ticket {
            barrier: generation.map(|g| (Arc::clone(self), g)),
        }
    }

    fn count_down(&self, generation: Option<u64>) {
        let fire = {
            let mut s = self.lock();
            if let Some(ticket) = generation.filter(|g| *g != s.generation) {
                warn!(
                    barrier = %self.name,
                    ticket,
                    current = s.generation,
                    "stale ticket from an earlier cycle ignored"
                );
                return;
            }
            if s.is_complete() {
                error!(
                    barrier = %self.name,
                    stamp = ?s.stamp,
                    total = s.total,
                    complete = s.complete,
                    at = %Utc::now(),
                    "CORRUPT: down() on a completed cycle"
                );
                return;
            }
            s.complete += 1;
            self.take_completion(&mut s)
        };
        if let Some(stamp) = fire {
            self.done(stamp);
        }
    }

    /// Arm the completion exactly once per cycle.
    fn take_completion(&self, s: &mut BarrierState) -> Option<DateTime<Utc>> {
        if s.fired || !s.is_complete() {
            return None;
        }
        s.fired = true;
        if s.checked {
            info!(barrier = %self.name, total = s.total, "late completion after watchdog check");
        }
        Some(s.stamp.unwrap_or_else(Utc::now))
    }

    /// Queue the completion job on the barrier's scheduler.
    fn done(&self, stamp: DateTime<Utc>) {
        let action = Arc::clone(&self.action);
        let job = Job::once(format!("{} complete", self.name), self.delay, move || action(stamp));
        debug!(barrier = %self.name, %stamp, "cycle complete");
        self.scheduler.add_job(job);
    }
}

/// Proof of one registered sub-task.
///
/// Reports completion when [`complete`](Self::complete) is called or the
/// ticket is dropped, whichever comes first, so a worker that bails out early
/// still counts down.
#[must_use = "dropping a ticket reports its task finished"]
pub struct Ticket {
    barrier: Option<(Arc<CompletionBarrier>, u64)>,
}

impl Ticket {
    pub fn complete(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if let Some((barrier, generation)) = self.barrier.take() {
            barrier.count_down(Some(generation));
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.finish();
    }
}
