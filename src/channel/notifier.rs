use serde_json::Value;
use tokio::sync::mpsc;

/// An event emitted toward the controlling process, targeting the entity
/// identified by `target_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub target_id: u32,
    pub event: String,
    pub data: Value,
}

/// Cloneable sink for control-plane notifications.
///
/// Every object that can emit events (peer, transport, producer, consumer)
/// holds a clone. Dropping the receiver silently discards further events,
/// which is the shutdown path of the channel transport.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl Notifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Notifier { tx }, rx)
    }

    pub fn emit(&self, target_id: u32, event: &str, data: Value) {
        let notification = Notification {
            target_id,
            event: event.to_owned(),
            data,
        };
        if self.tx.send(notification).is_err() {
            log::trace!("notification channel closed, dropping \"{event}\"");
        }
    }
}
