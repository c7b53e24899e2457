//! `iris-lists`: server-authoritative observable lists and their client mirrors.
//!
//! # Overview
//!
//! A list persists each change through its [`ListStore`], applies it in memory
//! and queues a [`ListEvent`] for its subscribers, all under one lock. A
//! per-list notifier thread owns the subscriber set and delivers the queued
//! events in order; an unreachable subscriber is logged and dropped without
//! affecting the others.
//!
//! | List                | Positions                                 |
//! |---------------------|-------------------------------------------|
//! | `IndexedList`       | dense `0..len`, append / remove-last only |
//! | `StringKeyList`     | rank of a string key, lexicographic       |
//! | `IntKeyList`        | rank of an integer key, numeric, sparse   |
//!
//! [`RemoteMirror`] subscribes once, seeds itself from the returned
//! [`Snapshot`] and replays events on a Tokio task.

pub mod db;
pub mod error;
pub mod indexed;
pub mod mirror;
pub mod sorted;
pub mod store;
pub mod subscriber;
pub mod types;
mod worker;

pub use db::SqliteStore;
pub use error::{DeliveryError, ListError, Result, StoreError, StoreResult};
pub use indexed::IndexedList;
pub use mirror::RemoteMirror;
pub use sorted::{IntKeyList, SortedList, StringKeyList};
pub use store::{ListKey, ListStore, TransientStore};
pub use subscriber::{ChannelSubscriber, ObservableSource, Subscriber};
pub use types::{ListEvent, Snapshot};
