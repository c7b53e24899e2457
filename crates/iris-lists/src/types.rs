use serde::{Deserialize, Serialize};

/// One change pushed to subscribers. `position` is the entry's ordinal rank
/// at the moment the change was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ListEvent<V> {
    Add { position: usize, value: V },
    Remove { position: usize },
    Set { position: usize, value: V },
}

impl<V> ListEvent<V> {
    pub fn position(&self) -> usize {
        match self {
            ListEvent::Add { position, .. }
            | ListEvent::Remove { position }
            | ListEvent::Set { position, .. } => *position,
        }
    }
}

/// Contents handed back by `subscribe`.
///
/// `Empty` is explicit so a caller can tell an empty list apart from a
/// missing answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "entries", rename_all = "snake_case")]
pub enum Snapshot<V> {
    Empty,
    Entries(Vec<V>),
}

impl<V> Snapshot<V> {
    pub fn from_vec(entries: Vec<V>) -> Self {
        if entries.is_empty() {
            Snapshot::Empty
        } else {
            Snapshot::Entries(entries)
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Snapshot::Empty => 0,
            Snapshot::Entries(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Snapshot::Empty)
    }

    pub fn into_vec(self) -> Vec<V> {
        match self {
            Snapshot::Empty => Vec::new(),
            Snapshot::Entries(entries) => entries,
        }
    }
}
