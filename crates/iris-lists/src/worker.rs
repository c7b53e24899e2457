use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;
use std::time::Instant;

use iris_core::SubscriberId;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{ListError, Result};
use crate::subscriber::Subscriber;
use crate::types::ListEvent;

enum Command<V> {
    Subscribe(Arc<dyn Subscriber<V>>),
    Unsubscribe(SubscriberId),
    Notify(ListEvent<V>),
    Flush(std_mpsc::Sender<()>),
}

/// Confined notification worker for one list.
///
/// The subscriber set lives only on the worker thread; every change to it and
/// every dispatch arrives through one queue, so each subscriber sees events
/// in the order they were queued. The thread exits once the owning list is
/// dropped and the queue drains.
pub(crate) struct Dispatcher<V> {
    list: String,
    tx: mpsc::UnboundedSender<Command<V>>,
    clients: Arc<AtomicUsize>,
}

impl<V: Send + Sync + 'static> Dispatcher<V> {
    pub(crate) fn spawn(list: &str) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let clients = Arc::new(AtomicUsize::new(0));
        let worker = Worker {
            list: list.to_string(),
            subscribers: Vec::new(),
            clients: Arc::clone(&clients),
        };
        thread::Builder::new()
            .name(format!("{list} notifier"))
            .spawn(move || worker.run(rx))
            .map_err(|source| ListError::WorkerSpawn {
                list: list.to_string(),
                source,
            })?;
        Ok(Self {
            list: list.to_string(),
            tx,
            clients,
        })
    }

    pub(crate) fn subscribe(&self, subscriber: Arc<dyn Subscriber<V>>) {
        self.queue(Command::Subscribe(subscriber));
    }

    pub(crate) fn unsubscribe(&self, id: SubscriberId) {
        self.queue(Command::Unsubscribe(id));
    }

    pub(crate) fn notify(&self, event: ListEvent<V>) {
        self.queue(Command::Notify(event));
    }

    /// Subscriber count as of the last command the worker finished.
    pub(crate) fn has_subscribers(&self) -> bool {
        self.clients.load(Ordering::Acquire) > 0
    }

    /// Block until every command queued before this call has run.
    pub(crate) fn flush(&self) {
        let (ack_tx, ack_rx) = std_mpsc::channel();
        self.queue(Command::Flush(ack_tx));
        // an Err means the worker is gone, so nothing is left to wait for
        let _ = ack_rx.recv();
    }

    fn queue(&self, command: Command<V>) {
        if self.tx.send(command).is_err() {
            warn!(list = %self.list, "notifier thread gone; command dropped");
        }
    }
}

struct Worker<V> {
    list: String,
    subscribers: Vec<Arc<dyn Subscriber<V>>>,
    clients: Arc<AtomicUsize>,
}

impl<V> Worker<V> {
    fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command<V>>) {
        while let Some(command) = rx.blocking_recv() {
            match command {
                Command::Subscribe(subscriber) => {
                    let id = subscriber.id();
                    if self.subscribers.iter().all(|s| s.id() != id) {
                        self.subscribers.push(subscriber);
                        debug!(list = %self.list, subscriber = %id, "subscribed");
                    }
                }
                Command::Unsubscribe(id) => {
                    self.subscribers.retain(|s| s.id() != id);
                    debug!(list = %self.list, subscriber = %id, "unsubscribed");
                }
                Command::Notify(event) => self.dispatch(&event),
                Command::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
            self.clients.store(self.subscribers.len(), Ordering::Release);
        }
        debug!(list = %self.list, "notifier exited");
    }

    fn dispatch(&mut self, event: &ListEvent<V>) {
        if self.subscribers.is_empty() {
            return;
        }
        let start = Instant::now();
        let list = &self.list;
        self.subscribers.retain(|s| match s.send(event) {
            Ok(()) => true,
            Err(e) => {
                warn!(list = %list, subscriber = %s.id(), error = %e, "delivery failed; dropping subscriber");
                false
            }
        });
        debug!(
            list = %self.list,
            clients = self.subscribers.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "notified"
        );
    }
}
