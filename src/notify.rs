use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Event, MonthKey};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for LISTEN/NOTIFY per calendar month.
#[derive(Default)]
pub struct NotifyHub {
    channels: DashMap<MonthKey, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to changes to weddings in `month`. Creates the channel if needed.
    pub fn subscribe(&self, month: MonthKey) -> broadcast::Receiver<Event> {
        self.channels
            .entry(month)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, month: MonthKey, event: &Event) {
        if let Some(sender) = self.channels.get(&month) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop channels whose last listener went away.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
