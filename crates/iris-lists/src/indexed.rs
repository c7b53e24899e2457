use std::sync::{Arc, Mutex, MutexGuard};

use iris_core::SubscriberId;
use tracing::{debug, info};

use crate::error::{ListError, Result, StoreError};
use crate::store::ListStore;
use crate::subscriber::{ObservableSource, Subscriber};
use crate::types::{ListEvent, Snapshot};
use crate::worker::Dispatcher;

/// Dense-index list: positions are `0..len`, growth and shrinkage happen at
/// the tail only.
///
/// Every mutation persists first, then changes memory, then queues the event,
/// all under the entries lock, so the queued order is the mutation order.
pub struct IndexedList<V> {
    name: String,
    store: Arc<dyn ListStore<usize, V>>,
    entries: Mutex<Vec<V>>,
    dispatcher: Dispatcher<V>,
}

impl<V: Clone + Send + Sync + 'static> IndexedList<V> {
    pub fn new(name: impl Into<String>, store: Arc<dyn ListStore<usize, V>>) -> Result<Self> {
        Self::with_entries(name.into(), store, Vec::new())
    }

    /// Build from whatever the store holds. Indices must be contiguous from 0.
    pub fn load(name: impl Into<String>, store: Arc<dyn ListStore<usize, V>>) -> Result<Self> {
        let name = name.into();
        let mut rows = store.load()?;
        rows.sort_by_key(|(index, _)| *index);
        if let Some((slot, (index, _))) = rows.iter().enumerate().find(|(slot, (index, _))| slot != index) {
            return Err(StoreError::Backend(format!("{name}: index {index} stored at slot {slot}")).into());
        }
        let entries = rows.into_iter().map(|(_, value)| value).collect();
        Self::with_entries(name, store, entries)
    }

    fn with_entries(name: String, store: Arc<dyn ListStore<usize, V>>, entries: Vec<V>) -> Result<Self> {
        let dispatcher = Dispatcher::spawn(&name)?;
        info!(list = %name, len = entries.len(), "indexed list ready");
        Ok(Self {
            name,
            store,
            entries: Mutex::new(entries),
            dispatcher,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<V>> {
        self.entries.lock().expect("list entries poisoned")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add `value` at index `len` and return that index.
    pub fn append(&self, value: V) -> Result<usize> {
        let mut entries = self.lock();
        let position = entries.len();
        self.store.create(&position, &value)?;
        entries.push(value.clone());
        self.dispatcher.notify(ListEvent::Add { position, value });
        Ok(position)
    }

    /// Remove and return the tail entry.
    pub fn remove_last(&self) -> Result<V> {
        let mut entries = self.lock();
        let (position, tail) = match entries.last() {
            Some(tail) => (entries.len() - 1, tail),
            None => {
                return Err(ListError::Empty {
                    list: self.name.clone(),
                })
            }
        };
        self.store
            .check_deletable(&position, tail)
            .map_err(|e| ListError::refused(&self.name, e))?;
        self.store.delete(&position)?;
        let value = entries.remove(position);
        self.dispatcher.notify(ListEvent::Remove { position });
        Ok(value)
    }

    /// Re-announce the entry at `position` without changing it.
    pub fn update(&self, position: usize) -> Result<()> {
        let entries = self.lock();
        let value = entries
            .get(position)
            .cloned()
            .ok_or_else(|| ListError::not_found(&self.name, position))?;
        self.dispatcher.notify(ListEvent::Set { position, value });
        Ok(())
    }

    /// Persist a new value at `position` and announce it; returns the old one.
    pub fn replace(&self, position: usize, value: V) -> Result<V> {
        let mut entries = self.lock();
        if position >= entries.len() {
            return Err(ListError::not_found(&self.name, position));
        }
        self.store.update(&position, &value)?;
        let old = std::mem::replace(&mut entries[position], value.clone());
        self.dispatcher.notify(ListEvent::Set { position, value });
        Ok(old)
    }

    pub fn get(&self, position: usize) -> Option<V> {
        self.lock().get(position).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn to_vec(&self) -> Vec<V> {
        self.lock().clone()
    }

    pub fn has_subscribers(&self) -> bool {
        self.dispatcher.has_subscribers()
    }

    /// Block until every event queued so far has been dispatched.
    pub fn flush(&self) {
        self.dispatcher.flush();
    }
}

impl<V: Clone + Send + Sync + 'static> ObservableSource<V> for IndexedList<V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn subscribe(&self, subscriber: Arc<dyn Subscriber<V>>) -> Snapshot<V> {
        let entries = self.lock();
        debug!(list = %self.name, subscriber = %subscriber.id(), len = entries.len(), "subscribe");
        self.dispatcher.subscribe(subscriber);
        Snapshot::from_vec(entries.clone())
    }

    fn unsubscribe(&self, id: SubscriberId) {
        self.dispatcher.unsubscribe(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreResult;
    use crate::store::TransientStore;
    use crate::subscriber::ChannelSubscriber;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Store double that can be told to fail or veto.
    #[derive(Default)]
    struct Flaky {
        fail: AtomicBool,
        veto: AtomicBool,
    }

    impl ListStore<usize, String> for Flaky {
        fn create(&self, _key: &usize, _value: &String) -> StoreResult<()> {
            self.check()
        }

        fn update(&self, _key: &usize, _value: &String) -> StoreResult<()> {
            self.check()
        }

        fn delete(&self, _key: &usize) -> StoreResult<()> {
            self.check()
        }

        fn check_deletable(&self, key: &usize, _value: &String) -> StoreResult<()> {
            if self.veto.load(Ordering::SeqCst) {
                return Err(StoreError::Veto {
                    key: key.to_string(),
                    reason: "in use by a plan".into(),
                });
            }
            Ok(())
        }

        fn load(&self) -> StoreResult<Vec<(usize, String)>> {
            Ok(Vec::new())
        }
    }

    impl Flaky {
        fn check(&self) -> StoreResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("disk full".into()));
            }
            Ok(())
        }
    }

    fn list(name: &str) -> IndexedList<String> {
        IndexedList::new(name, Arc::new(TransientStore)).unwrap()
    }

    #[test]
    fn append_to_three_announces_index_three() {
        let list = list("comm-lines");
        for line in ["L1", "L2", "L3"] {
            list.append(line.to_string()).unwrap();
        }
        let (sub, mut rx) = ChannelSubscriber::<String>::new();
        let snapshot = list.subscribe(Arc::new(sub));
        assert_eq!(snapshot.len(), 3);

        assert_eq!(list.append("L4".into()).unwrap(), 3);
        list.flush();
        assert_eq!(
            rx.try_recv().unwrap(),
            ListEvent::Add {
                position: 3,
                value: "L4".into()
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn remove_last_on_empty_list_fails_without_notifying() {
        let list = list("empty");
        let (sub, mut rx) = ChannelSubscriber::<String>::new();
        assert_eq!(list.subscribe(Arc::new(sub)), Snapshot::Empty);
        assert!(matches!(list.remove_last(), Err(ListError::Empty { .. })));
        list.flush();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn remove_last_takes_the_tail() {
        let list = list("tail");
        list.append("a".into()).unwrap();
        list.append("b".into()).unwrap();
        let (sub, mut rx) = ChannelSubscriber::<String>::new();
        list.subscribe(Arc::new(sub));
        assert_eq!(list.remove_last().unwrap(), "b");
        list.flush();
        assert_eq!(rx.try_recv().unwrap(), ListEvent::Remove { position: 1 });
        assert_eq!(list.to_vec(), vec!["a".to_string()]);
    }

    #[test]
    fn store_failure_leaves_list_and_subscribers_untouched() {
        let store = Arc::new(Flaky::default());
        let list = IndexedList::new("flaky", Arc::clone(&store) as Arc<dyn ListStore<usize, String>>).unwrap();
        list.append("kept".into()).unwrap();
        let (sub, mut rx) = ChannelSubscriber::<String>::new();
        list.subscribe(Arc::new(sub));

        store.fail.store(true, Ordering::SeqCst);
        assert!(matches!(list.append("lost".into()), Err(ListError::Store(_))));
        assert!(matches!(list.replace(0, "lost".into()), Err(ListError::Store(_))));
        assert!(matches!(list.remove_last(), Err(ListError::Store(_))));
        list.flush();
        assert!(rx.try_recv().is_err());
        assert_eq!(list.to_vec(), vec!["kept".to_string()]);
    }

    #[test]
    fn vetoed_delete_is_not_deletable() {
        let store = Arc::new(Flaky::default());
        let list = IndexedList::new("veto", Arc::clone(&store) as Arc<dyn ListStore<usize, String>>).unwrap();
        list.append("busy".into()).unwrap();
        store.veto.store(true, Ordering::SeqCst);
        assert!(matches!(list.remove_last(), Err(ListError::NotDeletable { .. })));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn update_and_replace_emit_set() {
        let list = list("set");
        list.append("x".into()).unwrap();
        let (sub, mut rx) = ChannelSubscriber::<String>::new();
        list.subscribe(Arc::new(sub));
        list.update(0).unwrap();
        assert_eq!(list.replace(0, "y".into()).unwrap(), "x");
        assert!(matches!(list.update(5), Err(ListError::NotFound { .. })));
        list.flush();
        assert_eq!(rx.try_recv().unwrap(), ListEvent::Set { position: 0, value: "x".into() });
        assert_eq!(rx.try_recv().unwrap(), ListEvent::Set { position: 0, value: "y".into() });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unsubscribed_listener_hears_nothing_more() {
        let list = list("unsub");
        let (sub, mut rx) = ChannelSubscriber::<String>::new();
        let id = sub.id();
        list.subscribe(Arc::new(sub));
        list.flush();
        assert!(list.has_subscribers());
        list.unsubscribe(id);
        list.append("late".into()).unwrap();
        list.flush();
        assert!(!list.has_subscribers());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn load_rejects_gaps() {
        struct Gappy;
        impl ListStore<usize, String> for Gappy {
            fn create(&self, _: &usize, _: &String) -> StoreResult<()> {
                Ok(())
            }
            fn update(&self, _: &usize, _: &String) -> StoreResult<()> {
                Ok(())
            }
            fn delete(&self, _: &usize) -> StoreResult<()> {
                Ok(())
            }
            fn load(&self) -> StoreResult<Vec<(usize, String)>> {
                Ok(vec![(0, "a".into()), (2, "c".into())])
            }
        }
        assert!(IndexedList::<String>::load("gappy", Arc::new(Gappy)).is_err());
    }
}
