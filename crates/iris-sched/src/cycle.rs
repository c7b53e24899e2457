use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use iris_core::config::{CompletionTarget, CycleConfig};
use tracing::{debug, info};

use crate::{
    barrier::CompletionBarrier,
    error::Result,
    job::{Job, Period},
    scheduler::{JobHandle, SchedulerHandle},
};

/// Starts the sub-tasks of one cycle.
///
/// Takes a [`Ticket`](crate::Ticket) from the barrier for each sub-task and
/// hands it to the thread doing the work. Must not block until that work is
/// done.
pub type FanOut = Arc<dyn Fn(&Arc<CompletionBarrier>) -> anyhow::Result<()> + Send + Sync>;

/// Calls `make_ready` when dropped, so a failed fan-out still closes the cycle.
struct ReadyOnDrop<'a>(&'a CompletionBarrier);

impl Drop for ReadyOnDrop<'_> {
    fn drop(&mut self) {
        self.0.make_ready();
    }
}

/// A periodic fan-out (e.g. "poll every comm line every 30 seconds").
///
/// Each tick skips if the previous cycle is still running, otherwise resets
/// the barrier with a stamp one interval in the past, starts the sub-tasks and
/// closes registration. The completion action runs on the completion scheduler
/// once every sub-task has reported back.
pub struct PollCycle {
    name: String,
    barrier: Arc<CompletionBarrier>,
    fan_out: FanOut,
    interval: chrono::Duration,
    timer: SchedulerHandle,
    job: JobHandle,
}

impl PollCycle {
    /// Build the cycle and schedule its periodic job on `timer`.
    pub fn start<F, C>(
        name: impl Into<String>,
        period: Period,
        timer: &SchedulerHandle,
        completion: SchedulerHandle,
        completion_delay: Duration,
        fan_out: F,
        on_complete: C,
    ) -> Self
    where
        F: Fn(&Arc<CompletionBarrier>) -> anyhow::Result<()> + Send + Sync + 'static,
        C: Fn(DateTime<Utc>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        let barrier = Arc::new(
            CompletionBarrier::new(name.clone(), completion, on_complete).with_delay(completion_delay),
        );
        let fan_out: FanOut = Arc::new(fan_out);
        let interval = period.interval();
        let job = {
            let barrier = Arc::clone(&barrier);
            let fan_out = Arc::clone(&fan_out);
            timer.add_job(Job::periodic(name.clone(), period, move || {
                tick(&barrier, &fan_out, interval)
            }))
        };
        info!(cycle = %name, interval_ms = period.interval_ms(), offset_ms = period.offset_ms(), "poll cycle scheduled");
        Self {
            name,
            barrier,
            fan_out,
            interval,
            timer: timer.clone(),
            job,
        }
    }

    /// Build from configuration, completing on `timer` or `flush` as configured.
    pub fn from_config<F, C>(
        config: &CycleConfig,
        timer: &SchedulerHandle,
        flush: &SchedulerHandle,
        fan_out: F,
        on_complete: C,
    ) -> Result<Self>
    where
        F: Fn(&Arc<CompletionBarrier>) -> anyhow::Result<()> + Send + Sync + 'static,
        C: Fn(DateTime<Utc>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let period = Period::new(
            chrono::Duration::seconds(config.interval_secs),
            chrono::Duration::seconds(config.offset_secs),
        )?;
        let completion = match config.completion {
            CompletionTarget::Timer => timer.clone(),
            CompletionTarget::Flush => flush.clone(),
        };
        Ok(Self::start(
            config.name.clone(),
            period,
            timer,
            completion,
            Duration::from_millis(config.completion_delay_ms),
            fan_out,
            on_complete,
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn barrier(&self) -> &Arc<CompletionBarrier> {
        &self.barrier
    }

    /// Run one tick now, outside the periodic schedule.
    pub fn trigger(&self) -> JobHandle {
        let barrier = Arc::clone(&self.barrier);
        let fan_out = Arc::clone(&self.fan_out);
        let interval = self.interval;
        debug!(cycle = %self.name, "manual trigger");
        self.timer.add_job(Job::now(format!("{} (manual)", self.name), move || {
            tick(&barrier, &fan_out, interval)
        }))
    }

    /// Stop scheduling further ticks. A cycle already in flight still completes.
    pub fn stop(&self) -> bool {
        self.timer.remove_job(&self.job)
    }
}

fn tick(barrier: &Arc<CompletionBarrier>, fan_out: &FanOut, interval: chrono::Duration) -> anyhow::Result<()> {
    if !barrier.check_complete() {
        return Ok(());
    }
    barrier.reset(Utc::now() - interval);
    let _ready = ReadyOnDrop(barrier.as_ref());
    fan_out(barrier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use std::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    fn hourly() -> Period {
        Period::every(chrono::Duration::hours(1)).unwrap()
    }

    #[test]
    fn trigger_fans_out_and_completes_once() {
        let timer = Scheduler::start("cycle-timer").unwrap();
        let flush = Scheduler::start("cycle-flush").unwrap();
        let (tx, rx) = mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        let cycle = PollCycle::start(
            "3-line",
            hourly(),
            &timer.handle(),
            flush.handle(),
            Duration::ZERO,
            |barrier| {
                for line in 0..3u64 {
                    let ticket = barrier.enter();
                    std::thread::spawn(move || {
                        std::thread::sleep(Duration::from_millis(10 * line));
                        ticket.complete();
                    });
                }
                Ok(())
            },
            move |stamp| {
                tx.lock().unwrap().send(stamp)?;
                Ok(())
            },
        );
        let before = Utc::now();
        cycle.trigger();
        let stamp = rx.recv_timeout(WAIT).unwrap();
        assert!(stamp <= before - chrono::Duration::minutes(59));
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(cycle.barrier().is_complete());
        assert!(cycle.stop());
    }

    #[test]
    fn tick_skips_while_previous_cycle_runs() {
        let timer = Scheduler::start("cycle-skip").unwrap();
        let (ticket_tx, ticket_rx) = mpsc::channel();
        let ticket_tx = std::sync::Mutex::new(ticket_tx);
        let cycle = PollCycle::start(
            "stuck",
            hourly(),
            &timer.handle(),
            timer.handle(),
            Duration::ZERO,
            move |barrier| {
                // park the ticket so the cycle stays open
                ticket_tx.lock().unwrap().send(barrier.enter())?;
                Ok(())
            },
            |_| Ok(()),
        );
        cycle.trigger();
        let ticket = ticket_rx.recv_timeout(WAIT).unwrap();
        let first = cycle.barrier().stamp();
        cycle.trigger();
        // second tick saw an incomplete cycle and started nothing
        assert!(ticket_rx.recv_timeout(Duration::from_millis(300)).is_err());
        assert_eq!(cycle.barrier().stamp(), first);
        ticket.complete();
        assert!(cycle.barrier().is_complete());
    }

    #[test]
    fn failed_fan_out_still_makes_ready() {
        let timer = Scheduler::start("cycle-fail").unwrap();
        let (tx, rx) = mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        let cycle = PollCycle::start(
            "broken",
            hourly(),
            &timer.handle(),
            timer.handle(),
            Duration::ZERO,
            |_| anyhow::bail!("no comm lines"),
            move |_| {
                tx.lock().unwrap().send(())?;
                Ok(())
            },
        );
        cycle.trigger();
        rx.recv_timeout(WAIT).unwrap();
    }

    #[test]
    fn from_config_validates_period() {
        let timer = Scheduler::start("cycle-config").unwrap();
        let bad = CycleConfig {
            name: "bad".into(),
            interval_secs: 30,
            offset_secs: 30,
            completion_delay_ms: 0,
            completion: CompletionTarget::Timer,
        };
        let result = PollCycle::from_config(
            &bad,
            &timer.handle(),
            &timer.handle(),
            |_| Ok(()),
            |_| Ok(()),
        );
        assert!(result.is_err());

        let config = iris_core::IrisConfig::default();
        let thirty = config.cycle("30-Second").unwrap();
        let cycle = PollCycle::from_config(
            thirty,
            &timer.handle(),
            &timer.handle(),
            |_| Ok(()),
            |_| Ok(()),
        )
        .unwrap();
        assert_eq!(cycle.name(), "30-Second");
        assert_eq!(timer.pending_count(), 1);
    }
}
