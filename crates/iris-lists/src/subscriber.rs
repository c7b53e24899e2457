use std::sync::Arc;

use iris_core::SubscriberId;
use tokio::sync::mpsc;

use crate::error::DeliveryError;
use crate::types::{ListEvent, Snapshot};

/// A remote channel that receives one list's change events, in order.
///
/// `send` is called from the list's dispatcher thread only and must not
/// block. An error marks the subscriber unreachable and it is dropped.
pub trait Subscriber<V>: Send + Sync {
    fn id(&self) -> SubscriberId;

    fn send(&self, event: &ListEvent<V>) -> Result<(), DeliveryError>;
}

/// Anything a mirror can attach to.
pub trait ObservableSource<V>: Send + Sync {
    fn name(&self) -> &str;

    /// Return the current contents and queue registration of `subscriber`.
    ///
    /// Every event applied after the snapshot was taken reaches the
    /// subscriber; none applied before it do.
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<V>>) -> Snapshot<V>;

    /// Queue removal. Events already in flight may still arrive.
    fn unsubscribe(&self, id: SubscriberId);
}

/// Subscriber backed by an unbounded tokio channel.
pub struct ChannelSubscriber<V> {
    id: SubscriberId,
    tx: mpsc::UnboundedSender<ListEvent<V>>,
}

impl<V> ChannelSubscriber<V> {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ListEvent<V>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::from_sender(tx), rx)
    }

    pub fn from_sender(tx: mpsc::UnboundedSender<ListEvent<V>>) -> Self {
        Self {
            id: SubscriberId::new(),
            tx,
        }
    }
}

impl<V: Clone + Send + 'static> Subscriber<V> for ChannelSubscriber<V> {
    fn id(&self) -> SubscriberId {
        self.id
    }

    fn send(&self, event: &ListEvent<V>) -> Result<(), DeliveryError> {
        self.tx
            .send(event.clone())
            .map_err(|_| DeliveryError::Disconnected)
    }
}
