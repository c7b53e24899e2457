use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use iris_core::SubscriberId;
use tracing::{debug, info};

use crate::error::{ListError, Result};
use crate::store::{ListKey, ListStore};
use crate::subscriber::{ObservableSource, Subscriber};
use crate::types::{ListEvent, Snapshot};
use crate::worker::Dispatcher;

/// Key-sorted list. Events carry `(key, value)` pairs positioned by the
/// key's rank in ascending order.
pub struct SortedList<K, V> {
    name: String,
    store: Arc<dyn ListStore<K, V>>,
    entries: Mutex<BTreeMap<K, V>>,
    dispatcher: Dispatcher<(K, V)>,
}

/// Lexicographically sorted by name.
pub type StringKeyList<V> = SortedList<String, V>;

/// Numerically sorted, sparse integer keys.
pub type IntKeyList<V> = SortedList<i64, V>;

impl<K, V> SortedList<K, V>
where
    K: ListKey,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, store: Arc<dyn ListStore<K, V>>) -> Result<Self> {
        Self::with_entries(name.into(), store, BTreeMap::new())
    }

    /// Build from whatever the store holds.
    pub fn load(name: impl Into<String>, store: Arc<dyn ListStore<K, V>>) -> Result<Self> {
        let entries = store.load()?.into_iter().collect();
        Self::with_entries(name.into(), store, entries)
    }

    fn with_entries(name: String, store: Arc<dyn ListStore<K, V>>, entries: BTreeMap<K, V>) -> Result<Self> {
        let dispatcher = Dispatcher::spawn(&name)?;
        info!(list = %name, len = entries.len(), "sorted list ready");
        Ok(Self {
            name,
            store,
            entries: Mutex::new(entries),
            dispatcher,
        })
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<K, V>> {
        self.entries.lock().expect("list entries poisoned")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a new entry and return its position.
    pub fn insert(&self, key: K, value: V) -> Result<usize> {
        let mut entries = self.lock();
        if entries.contains_key(&key) {
            return Err(ListError::DuplicateKey {
                list: self.name.clone(),
                key: key.to_string(),
            });
        }
        self.store.create(&key, &value)?;
        entries.insert(key.clone(), value.clone());
        let position = entries.range(..&key).count();
        self.dispatcher.notify(ListEvent::Add {
            position,
            value: (key, value),
        });
        Ok(position)
    }

    /// Remove the entry under `key` and return its value.
    pub fn remove(&self, key: &K) -> Result<V> {
        let mut entries = self.lock();
        let value = entries
            .get(key)
            .ok_or_else(|| ListError::not_found(&self.name, key))?;
        self.store
            .check_deletable(key, value)
            .map_err(|e| ListError::refused(&self.name, e))?;
        self.store.delete(key)?;
        // linear walk; lists hold hundreds of devices at most
        let position = rank(&entries, key);
        let value = entries
            .remove(key)
            .ok_or_else(|| ListError::not_found(&self.name, key))?;
        self.dispatcher.notify(ListEvent::Remove { position });
        Ok(value)
    }

    /// Re-announce the entry under `key` without changing it.
    pub fn update(&self, key: &K) -> Result<()> {
        let entries = self.lock();
        let value = entries
            .get(key)
            .cloned()
            .ok_or_else(|| ListError::not_found(&self.name, key))?;
        let position = rank(&entries, key);
        self.dispatcher.notify(ListEvent::Set {
            position,
            value: (key.clone(), value),
        });
        Ok(())
    }

    /// Persist a new value under `key` and announce it; returns the old one.
    pub fn replace(&self, key: &K, value: V) -> Result<V> {
        let mut entries = self.lock();
        if !entries.contains_key(key) {
            return Err(ListError::not_found(&self.name, key));
        }
        self.store.update(key, &value)?;
        let position = rank(&entries, key);
        let old = entries
            .insert(key.clone(), value.clone())
            .ok_or_else(|| ListError::not_found(&self.name, key))?;
        self.dispatcher.notify(ListEvent::Set {
            position,
            value: (key.clone(), value),
        });
        Ok(old)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.lock().get(key).cloned()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    /// Current rank of `key`, if present.
    pub fn position_of(&self, key: &K) -> Option<usize> {
        let entries = self.lock();
        entries.contains_key(key).then(|| rank(&entries, key))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Entries in key order.
    pub fn entries(&self) -> Vec<(K, V)> {
        pairs(&self.lock())
    }

    pub fn has_subscribers(&self) -> bool {
        self.dispatcher.has_subscribers()
    }

    /// Block until every event queued so far has been dispatched.
    pub fn flush(&self) {
        self.dispatcher.flush();
    }
}

fn rank<K: Ord, V>(entries: &BTreeMap<K, V>, key: &K) -> usize {
    entries.keys().take_while(|k| *k != key).count()
}

fn pairs<K: Clone, V: Clone>(entries: &BTreeMap<K, V>) -> Vec<(K, V)> {
    entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

impl<K, V> ObservableSource<(K, V)> for SortedList<K, V>
where
    K: ListKey,
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn subscribe(&self, subscriber: Arc<dyn Subscriber<(K, V)>>) -> Snapshot<(K, V)> {
        let entries = self.lock();
        debug!(list = %self.name, subscriber = %subscriber.id(), len = entries.len(), "subscribe");
        self.dispatcher.subscribe(subscriber);
        Snapshot::from_vec(pairs(&entries))
    }

    fn unsubscribe(&self, id: SubscriberId) {
        self.dispatcher.unsubscribe(id);
    }
}
