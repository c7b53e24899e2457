// Cross-thread behaviour of the completion barrier and poll cycle.
// Completion must fire exactly once per cycle, whatever order sub-tasks finish in.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use iris_sched::{CompletionBarrier, Job, Period, PollCycle, Scheduler};

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

fn fired_barrier(sched: &Scheduler) -> (Arc<CompletionBarrier>, Arc<AtomicU32>, mpsc::Receiver<()>) {
    let fired = Arc::new(AtomicU32::new(0));
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let counter = Arc::clone(&fired);
    let barrier = Arc::new(CompletionBarrier::new("fan-in", sched.handle(), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        tx.lock().unwrap().send(())?;
        Ok(())
    }));
    (barrier, fired, rx)
}

#[test]
fn five_downs_from_three_threads_fire_once() {
    let _ = iris_core::telemetry::init_tracing("iris_sched=debug");
    let sched = Scheduler::start("fan-in-5").unwrap();
    let (barrier, fired, rx) = fired_barrier(&sched);

    barrier.reset(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
    for _ in 0..5 {
        barrier.up();
    }
    barrier.make_ready();

    let start = Arc::new(Barrier::new(3));
    let workers: Vec<_> = [2, 2, 1]
        .into_iter()
        .map(|downs| {
            let barrier = Arc::clone(&barrier);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..downs {
                    barrier.down();
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    rx.recv_timeout(WAIT).unwrap();
    assert!(rx.recv_timeout(QUIET).is_err());
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(barrier.counts().complete, 5);
}

#[test]
fn concurrent_registration_fires_once() {
    let sched = Scheduler::start("fan-in-many").unwrap();
    let (barrier, fired, rx) = fired_barrier(&sched);
    barrier.reset(Utc::now());

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                for _ in 0..50 {
                    let ticket = barrier.enter();
                    thread::yield_now();
                    ticket.complete();
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
    // nothing can fire before registration closes
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    barrier.make_ready();
    rx.recv_timeout(WAIT).unwrap();
    assert!(rx.recv_timeout(QUIET).is_err());
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(barrier.counts().total, 400);
}

#[test]
fn completion_can_run_on_another_scheduler() {
    let timer = Scheduler::start("fan-in-timer").unwrap();
    let flush = Scheduler::start("fan-in-flush").unwrap();
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);

    let cycle = PollCycle::start(
        "lines",
        Period::every(chrono::Duration::hours(1)).unwrap(),
        &timer.handle(),
        flush.handle(),
        Duration::from_millis(50),
        |barrier| {
            for _ in 0..4 {
                let ticket = barrier.enter();
                thread::spawn(move || drop(ticket));
            }
            Ok(())
        },
        move |stamp| {
            let on = thread::current().name().map(String::from);
            tx.lock().unwrap().send((stamp, on))?;
            Ok(())
        },
    );

    cycle.trigger();
    let (_stamp, thread_name) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(thread_name.as_deref(), Some("fan-in-flush"));
    assert!(rx.recv_timeout(QUIET).is_err());
}

#[test]
fn scheduler_runs_jobs_in_deadline_order() {
    let sched = Scheduler::start("ordering").unwrap();
    let (tx, rx) = mpsc::channel();

    for (name, delay) in [("third", 120), ("first", 20), ("second", 70)] {
        let tx = tx.clone();
        sched.add_job(Job::once(name, Duration::from_millis(delay), move || {
            tx.send(name)?;
            Ok(())
        }));
    }

    let order: Vec<_> = (0..3).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
    assert_eq!(order, ["first", "second", "third"]);
}
