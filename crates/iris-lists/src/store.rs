use std::fmt::{Debug, Display};

use crate::error::StoreResult;

/// Key types a list can be positioned and persisted by.
pub trait ListKey: Clone + Ord + Display + Debug + Send + Sync + 'static {
    fn to_store_key(&self) -> String;

    fn from_store_key(raw: &str) -> Option<Self>;
}

impl ListKey for String {
    fn to_store_key(&self) -> String {
        self.clone()
    }

    fn from_store_key(raw: &str) -> Option<Self> {
        Some(raw.to_string())
    }
}

impl ListKey for i64 {
    fn to_store_key(&self) -> String {
        self.to_string()
    }

    fn from_store_key(raw: &str) -> Option<Self> {
        raw.parse().ok()
    }
}

impl ListKey for usize {
    fn to_store_key(&self) -> String {
        self.to_string()
    }

    fn from_store_key(raw: &str) -> Option<Self> {
        raw.parse().ok()
    }
}

/// Synchronous persist hook behind every list mutation.
///
/// Each call runs before the in-memory change and must return an error
/// instead of partially applying; a failure leaves the list untouched and
/// sends no event.
pub trait ListStore<K, V>: Send + Sync {
    fn create(&self, key: &K, value: &V) -> StoreResult<()>;

    fn update(&self, key: &K, value: &V) -> StoreResult<()>;

    fn delete(&self, key: &K) -> StoreResult<()>;

    /// Domain veto on removal. Return `StoreError::Veto` to refuse.
    fn check_deletable(&self, _key: &K, _value: &V) -> StoreResult<()> {
        Ok(())
    }

    /// Everything persisted for this list, in any order.
    fn load(&self) -> StoreResult<Vec<(K, V)>>;
}

/// Store for lists with no durable backing.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransientStore;

impl<K, V> ListStore<K, V> for TransientStore {
    fn create(&self, _key: &K, _value: &V) -> StoreResult<()> {
        Ok(())
    }

    fn update(&self, _key: &K, _value: &V) -> StoreResult<()> {
        Ok(())
    }

    fn delete(&self, _key: &K) -> StoreResult<()> {
        Ok(())
    }

    fn load(&self) -> StoreResult<Vec<(K, V)>> {
        Ok(Vec::new())
    }
}
