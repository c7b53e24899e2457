//! `iris-sched`: wall-clock aligned job scheduling and cycle completion tracking.
//!
//! # Overview
//!
//! A [`Scheduler`] owns one dedicated thread that runs [`Job`]s in deadline
//! order. Periodic jobs fire on multiples of their interval in local time,
//! shifted by their offset, so a 30-second job with an 8-second offset fires at
//! :08 and :38 of every minute regardless of when it was added.
//!
//! A [`CompletionBarrier`] counts the sub-tasks of one fan-out cycle and queues
//! a completion job once all of them have finished. [`PollCycle`] ties the two
//! together: a periodic job that resets the barrier, fans out and closes
//! registration.
//!
//! | Type                | Role                                              |
//! |---------------------|---------------------------------------------------|
//! | `Scheduler`         | Thread plus ordered pending set                   |
//! | `SchedulerHandle`   | Cloneable add/remove access from any thread       |
//! | `Schedulers`        | The configured timer and flush pair               |
//! | `Job` / `Period`    | One unit of work and its alignment                |
//! | `CompletionBarrier` | up/down counter that fires once per cycle         |
//! | `Ticket`            | RAII registration on a barrier                    |
//! | `PollCycle`         | Periodic reset + fan-out + make_ready             |

pub mod barrier;
pub mod cycle;
pub mod error;
pub mod job;
pub mod scheduler;

pub use barrier::{BarrierCounts, CompletionBarrier, Ticket};
pub use cycle::{FanOut, PollCycle};
pub use error::{JobError, Result, SchedError};
pub use job::{Job, Period, Zone};
pub use scheduler::{ErrorHandler, JobHandle, Scheduler, SchedulerHandle, Schedulers};
