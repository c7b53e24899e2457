use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard};

use iris_core::SubscriberId;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ListError, Result};
use crate::subscriber::{ChannelSubscriber, ObservableSource, Subscriber};
use crate::types::{ListEvent, Snapshot};

/// Client-side replica of one observable list.
///
/// The snapshot and every later event go through the same apply task, in
/// receipt order, so the copy passes through the same sequence of states as
/// the source.
pub struct RemoteMirror<V> {
    name: String,
    source: Arc<dyn ObservableSource<V>>,
    subscriber: SubscriberId,
    shared: Arc<Shared<V>>,
    task: JoinHandle<()>,
}

struct Shared<V> {
    entries: RwLock<Vec<V>>,
    /// Count of applied events, for `wait_until`.
    applied: watch::Sender<u64>,
    disposed: AtomicBool,
}

impl<V> Shared<V> {
    fn read(&self) -> RwLockReadGuard<'_, Vec<V>> {
        self.entries.read().expect("mirror entries poisoned")
    }

    fn apply(&self, list: &str, event: ListEvent<V>) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        let mut entries = self.entries.write().expect("mirror entries poisoned");
        let len = entries.len();
        match event {
            ListEvent::Add { position, value } if position <= len => entries.insert(position, value),
            ListEvent::Remove { position } if position < len => {
                entries.remove(position);
            }
            ListEvent::Set { position, value } if position < len => entries[position] = value,
            other => {
                warn!(list, position = other.position(), len, "event outside mirror bounds ignored");
                return;
            }
        }
        drop(entries);
        self.applied.send_modify(|n| *n += 1);
    }
}

impl<V: Clone + Send + Sync + 'static> RemoteMirror<V> {
    /// Subscribe to `source` and start applying its events on the current
    /// Tokio runtime. Outside a runtime nothing is subscribed.
    pub fn attach(source: Arc<dyn ObservableSource<V>>) -> Result<Self> {
        let name = source.name().to_string();
        let runtime = Handle::try_current().map_err(|err| ListError::NoRuntime {
            list: name.clone(),
            source: err,
        })?;
        let (subscriber, rx) = ChannelSubscriber::<V>::new();
        let id = subscriber.id();
        let snapshot = source.subscribe(Arc::new(subscriber));
        let (applied, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            entries: RwLock::new(Vec::new()),
            applied,
            disposed: AtomicBool::new(false),
        });
        debug!(list = %name, subscriber = %id, len = snapshot.len(), "mirror attached");
        let task = runtime.spawn(apply_loop(name.clone(), snapshot, rx, Arc::clone(&shared)));
        Ok(Self {
            name,
            source,
            subscriber: id,
            shared,
            task,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entries(&self) -> Vec<V> {
        self.shared.read().clone()
    }

    pub fn get(&self, position: usize) -> Option<V> {
        self.shared.read().get(position).cloned()
    }

    pub fn len(&self) -> usize {
        self.shared.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.read().is_empty()
    }

    /// Wait until `predicate` holds for the current contents.
    pub async fn wait_until<F>(&self, predicate: F)
    where
        F: Fn(&[V]) -> bool,
    {
        let mut changes = self.shared.applied.subscribe();
        loop {
            if predicate(self.shared.read().as_slice()) {
                return;
            }
            if changes.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// Unsubscribe and stop applying. Events still in flight are dropped.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.source.unsubscribe(self.subscriber);
        self.task.abort();
        debug!(list = %self.name, subscriber = %self.subscriber, "mirror disposed");
    }
}

impl<V> Drop for RemoteMirror<V> {
    fn drop(&mut self) {
        if !self.shared.disposed.swap(true, Ordering::AcqRel) {
            self.source.unsubscribe(self.subscriber);
            self.task.abort();
        }
    }
}

async fn apply_loop<V>(
    list: String,
    snapshot: Snapshot<V>,
    mut rx: mpsc::UnboundedReceiver<ListEvent<V>>,
    shared: Arc<Shared<V>>,
) {
    for (position, value) in snapshot.into_vec().into_iter().enumerate() {
        shared.apply(&list, ListEvent::Add { position, value });
    }
    while let Some(event) = rx.recv().await {
        shared.apply(&list, event);
    }
    debug!(list = %list, "mirror feed closed");
}
