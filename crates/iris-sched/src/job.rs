use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use chrono::{DateTime, Duration, FixedOffset, Local, Offset, TimeZone, Utc};
use tracing::warn;

use crate::error::{JobError, Result, SchedError};

/// Work performed each time a job comes due.
pub type Action = Box<dyn FnMut() -> anyhow::Result<()> + Send>;

/// Hook run after every action, whether it succeeded or not.
pub type CompleteHook = Box<dyn FnMut() + Send>;

/// Interval and phase offset of a periodic job.
///
/// Both are absolute durations; a job with `interval = 30s, offset = 8s`
/// fires at :08 and :38 past every minute of local wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    interval_ms: i64,
    offset_ms: i64,
}

impl Period {
    /// Requires `interval > 0` and `0 <= offset < interval`.
    pub fn new(interval: Duration, offset: Duration) -> Result<Self> {
        let interval_ms = interval.num_milliseconds();
        let offset_ms = offset.num_milliseconds();
        if interval_ms <= 0 {
            return Err(SchedError::InvalidPeriod(format!(
                "interval must be positive, got {interval_ms} ms"
            )));
        }
        if offset_ms < 0 || offset_ms >= interval_ms {
            return Err(SchedError::InvalidPeriod(format!(
                "offset {offset_ms} ms outside [0, {interval_ms}) ms"
            )));
        }
        Ok(Self {
            interval_ms,
            offset_ms,
        })
    }

    /// Period with no phase offset.
    pub fn every(interval: Duration) -> Result<Self> {
        Self::new(interval, Duration::zero())
    }

    pub fn interval(&self) -> Duration {
        Duration::milliseconds(self.interval_ms)
    }

    pub fn offset(&self) -> Duration {
        Duration::milliseconds(self.offset_ms)
    }

    pub fn interval_ms(&self) -> i64 {
        self.interval_ms
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms
    }

    /// First wall-clock-aligned deadline strictly after `now_ms`.
    ///
    /// `zone_offset_ms` is the local zone's total UTC offset (standard plus
    /// daylight saving) at `now_ms`.
    pub fn next_after(&self, now_ms: i64, zone_offset_ms: i64) -> i64 {
        self.last_slot(now_ms, zone_offset_ms) + self.interval_ms + self.shift(zone_offset_ms)
    }

    fn shift(&self, zone_offset_ms: i64) -> i64 {
        self.offset_ms - zone_offset_ms
    }

    fn last_slot(&self, now_ms: i64, zone_offset_ms: i64) -> i64 {
        let off = self.shift(zone_offset_ms);
        (now_ms - off).div_euclid(self.interval_ms) * self.interval_ms
    }
}

/// Source of the UTC offset used to align periodic jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Zone {
    /// The host's local zone, including daylight saving.
    #[default]
    Local,
    Fixed(FixedOffset),
}

impl Zone {
    /// Offset from UTC in milliseconds at the instant `at_ms`.
    pub fn offset_ms(&self, at_ms: i64) -> i64 {
        match self {
            Zone::Local => Local
                .timestamp_millis_opt(at_ms)
                .single()
                .map(|t| i64::from(t.offset().fix().local_minus_utc()) * 1000)
                .unwrap_or(0),
            Zone::Fixed(fixed) => i64::from(fixed.local_minus_utc()) * 1000,
        }
    }
}

/// A unit of work for a [`Scheduler`](crate::Scheduler): periodic or one-shot.
pub struct Job {
    name: String,
    period: Option<Period>,
    zone: Zone,
    next_time: i64,
    action: Action,
    on_complete: Option<CompleteHook>,
}

impl Job {
    /// A job repeating on `period`, first due at the next aligned slot.
    pub fn periodic<F>(name: impl Into<String>, period: Period, action: F) -> Self
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        let zone = Zone::Local;
        let now = now_ms();
        Self {
            name: name.into(),
            period: Some(period),
            zone,
            next_time: period.next_after(now, zone.offset_ms(now)),
            action: Box::new(action),
            on_complete: None,
        }
    }

    /// A job run once, `delay` after construction.
    pub fn once<F>(name: impl Into<String>, delay: std::time::Duration, action: F) -> Self
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        Self {
            name: name.into(),
            period: None,
            zone: Zone::Local,
            next_time: now_ms().saturating_add(delay_ms),
            action: Box::new(action),
            on_complete: None,
        }
    }

    /// A one-shot job due immediately.
    pub fn now<F>(name: impl Into<String>, action: F) -> Self
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        Self::once(name, std::time::Duration::ZERO, action)
    }

    /// Attach a hook run after every execution, even one that failed.
    pub fn on_complete<F>(mut self, hook: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        self.on_complete = Some(Box::new(hook));
        self
    }

    /// Align a periodic job to a fixed UTC offset instead of the local zone.
    pub fn in_zone(mut self, offset: FixedOffset) -> Self {
        self.zone = Zone::Fixed(offset);
        if let Some(period) = self.period {
            let now = now_ms();
            self.next_time = period.next_after(now, self.zone.offset_ms(now));
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> Option<Period> {
        self.period
    }

    pub fn is_periodic(&self) -> bool {
        self.period.is_some()
    }

    /// Absolute deadline in epoch milliseconds.
    pub fn next_time_ms(&self) -> i64 {
        self.next_time
    }

    pub fn next_time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.next_time).unwrap_or_default()
    }

    /// Recompute the deadline of a periodic job from the current time.
    pub fn compute_next_time(&mut self) {
        let now = now_ms();
        let zone_offset = self.zone.offset_ms(now);
        self.compute_next_time_at(now, zone_offset);
    }

    /// Recompute the deadline as of `now_ms` with the given zone offset.
    ///
    /// The result is the next slot aligned to the interval in local time.
    /// It never moves backwards: if a clock step or zone change would yield
    /// a deadline at or before the previous one, whole intervals are added.
    /// One-shot jobs are left unchanged.
    pub fn compute_next_time_at(&mut self, now_ms: i64, zone_offset_ms: i64) -> i64 {
        let Some(period) = self.period else {
            return self.next_time;
        };
        let interval = period.interval_ms();
        let off = period.shift(zone_offset_ms);
        let last = period.last_slot(now_ms, zone_offset_ms);
        let behind = last + off - self.next_time;
        if behind > interval {
            warn!(
                job = %self.name,
                expected = %fmt_ms(self.next_time),
                slot = %fmt_ms(last + off),
                missed = behind / interval,
                "missed event"
            );
        }
        let mut next = last + interval + off;
        if next <= self.next_time {
            next += ((self.next_time - next) / interval + 1) * interval;
        }
        self.next_time = next;
        next
    }

    /// Run the job once.
    ///
    /// Periodic jobs are rescheduled before the action runs, so a slow
    /// action never pushes back the following slot.
    pub(crate) fn perform(&mut self) -> std::result::Result<(), JobError> {
        if self.is_periodic() {
            self.compute_next_time();
        }
        let result = catch_unwind(AssertUnwindSafe(|| (self.action)()));
        if let Some(hook) = self.on_complete.as_mut() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(hook)) {
                warn!(
                    job = %self.name,
                    panic = %panic_message(payload.as_ref()),
                    "completion hook panicked"
                );
            }
        }
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(JobError::Failed {
                job: self.name.clone(),
                error,
            }),
            Err(payload) => Err(JobError::Panicked {
                job: self.name.clone(),
                message: panic_message(payload.as_ref()),
            }),
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("period", &self.period)
            .field("zone", &self.zone)
            .field("next_time", &fmt_ms(self.next_time))
            .finish_non_exhaustive()
    }
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn fmt_ms(ms: i64) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    /// Collects formatted log lines for assertions.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }

        fn during(&self, f: impl FnOnce()) {
            let subscriber = tracing_subscriber::fmt()
                .with_writer(self.clone())
                .with_ansi(false)
                .finish();
            tracing::subscriber::with_default(subscriber, f);
        }
    }

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn at(h: u32, m: u32, s: u32) -> i64 {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
            .and_utc()
            .timestamp_millis()
    }

    fn thirty_sec() -> Period {
        Period::every(Duration::seconds(30)).unwrap()
    }

    fn utc_job(period: Period) -> Job {
        let mut job =
            Job::periodic("test", period, || Ok(())).in_zone(FixedOffset::east_opt(0).unwrap());
        // forget the deadline computed from the real clock
        job.next_time = 0;
        job
    }

    #[test]
    fn period_rejects_bad_interval_and_offset() {
        assert!(Period::every(Duration::zero()).is_err());
        assert!(Period::every(Duration::seconds(-5)).is_err());
        assert!(Period::new(Duration::seconds(30), Duration::seconds(-1)).is_err());
        assert!(Period::new(Duration::seconds(30), Duration::seconds(30)).is_err());
        assert!(Period::new(Duration::seconds(30), Duration::seconds(29)).is_ok());
    }

    #[test]
    fn thirty_seconds_aligns_to_the_minute() {
        let p = thirty_sec();
        assert_eq!(p.next_after(at(12, 0, 17), 0), at(12, 0, 30));
        assert_eq!(p.next_after(at(12, 0, 31), 0), at(12, 1, 0));
        // exactly on a slot: the next one is a full interval away
        assert_eq!(p.next_after(at(12, 0, 30), 0), at(12, 1, 0));
    }

    #[test]
    fn offset_shifts_the_phase() {
        let p = Period::new(Duration::seconds(30), Duration::seconds(8)).unwrap();
        assert_eq!(p.next_after(at(12, 0, 5), 0), at(12, 0, 8));
        assert_eq!(p.next_after(at(12, 0, 8), 0), at(12, 0, 38));
    }

    #[test]
    fn daily_job_follows_local_zone() {
        // 04:00 local in UTC-6 is 10:00 UTC
        let p = Period::new(Duration::days(1), Duration::hours(4)).unwrap();
        let cst = -6 * 3_600_000;
        assert_eq!(p.next_after(at(9, 0, 0), cst), at(10, 0, 0));
        // after the switch to daylight time (UTC-5) it moves to 09:00 UTC
        let cdt = -5 * 3_600_000;
        assert_eq!(p.next_after(at(8, 0, 0), cdt), at(9, 0, 0));
    }

    #[test]
    fn successive_computations_step_by_one_interval() {
        let mut job = utc_job(thirty_sec());
        let first = job.compute_next_time_at(at(12, 0, 17), 0);
        assert_eq!(first, at(12, 0, 30));
        let mut prev = first;
        for _ in 0..5 {
            let next = job.compute_next_time_at(prev, 0);
            assert_eq!(next - prev, 30_000);
            prev = next;
        }
    }

    #[test]
    fn deadline_never_moves_backwards() {
        let mut job = utc_job(thirty_sec());
        job.compute_next_time_at(at(12, 0, 17), 0);
        // clock stepped back a minute
        let next = job.compute_next_time_at(at(11, 59, 17), 0);
        assert_eq!(next, at(12, 1, 0));
    }

    #[test]
    fn missed_slots_self_correct() {
        let mut job = utc_job(thirty_sec());
        job.compute_next_time_at(at(12, 0, 17), 0);
        // paused for ten minutes
        let next = job.compute_next_time_at(at(12, 10, 5), 0);
        assert_eq!(next, at(12, 10, 30));
    }

    #[test]
    fn on_time_runs_log_nothing() {
        let mut job = utc_job(thirty_sec());
        job.compute_next_time_at(at(12, 0, 17), 0);

        let logs = Captured::default();
        logs.during(|| {
            // exactly on the deadline, then a little late but inside the slot
            job.compute_next_time_at(at(12, 0, 30), 0);
            job.compute_next_time_at(at(12, 1, 0) + 900, 0);
        });
        assert_eq!(job.next_time_ms(), at(12, 1, 30));
        assert_eq!(logs.text(), "");
    }

    #[test]
    fn pause_longer_than_an_interval_warns_missed_event() {
        let mut job = utc_job(thirty_sec());
        job.compute_next_time_at(at(12, 0, 17), 0);
        job.compute_next_time_at(at(12, 0, 30), 0);

        let logs = Captured::default();
        // due 12:01:00, next look at the clock is 12:10:05
        logs.during(|| {
            job.compute_next_time_at(at(12, 10, 5), 0);
        });
        let out = logs.text();
        assert!(out.contains("WARN"), "{out}");
        assert!(out.contains("missed event"), "{out}");
        assert!(out.contains("job=test"), "{out}");
        assert!(out.contains("missed=18"), "{out}");
        assert_eq!(out.lines().count(), 1);
    }

    #[test]
    fn one_shot_has_no_period() {
        let mut job = Job::once("once", std::time::Duration::from_millis(250), || Ok(()));
        assert!(!job.is_periodic());
        let before = job.next_time_ms();
        assert_eq!(job.compute_next_time_at(before + 10_000, 0), before);
    }

    #[test]
    fn completion_hook_runs_after_failure_and_panic() {
        let hooks = Arc::new(AtomicU32::new(0));
        let h = hooks.clone();
        let mut failing = Job::now("failing", || anyhow::bail!("boom"))
            .on_complete(move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        let err = failing.perform().unwrap_err();
        assert!(matches!(err, JobError::Failed { .. }));
        assert_eq!(err.job(), "failing");

        let h = hooks.clone();
        let mut panicking = Job::now("panicking", || panic!("kaboom")).on_complete(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        match panicking.perform() {
            Err(JobError::Panicked { message, .. }) => assert_eq!(message, "kaboom"),
            other => panic!("expected panic error, got {other:?}"),
        }
        assert_eq!(hooks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn periodic_reschedules_before_action_runs() {
        let seen = Arc::new(std::sync::Mutex::new(0i64));
        let period = Period::every(Duration::hours(1)).unwrap();
        let s = seen.clone();
        let mut job = Job::periodic("hourly", period, move || {
            *s.lock().unwrap() = now_ms();
            Ok(())
        });
        let before = job.next_time_ms();
        job.perform().unwrap();
        assert!(job.next_time_ms() > before);
        assert!(job.next_time_ms() > *seen.lock().unwrap());
    }
}
