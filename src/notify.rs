use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{DateRange, Event, Ms};

const CHANNEL_CAPACITY: usize = 256;

/// What subscribers of a property hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A committed change to the property's calendar or bookings.
    Changed(Event),
    /// A booking is waiting for the guest to pay.
    PaymentRequired {
        booking_id: Ulid,
        amount: Decimal,
        currency: String,
        deadline: Ms,
    },
    /// An imported calendar covers nights that a local booking holds.
    ExternalOverlap {
        link_id: Ulid,
        range: DateRange,
    },
}

/// Broadcast hub for per-property change notifications.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for a property. Creates the channel if needed.
    pub fn subscribe(&self, property_id: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(property_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, property_id: Ulid, notification: Notification) {
        if let Some(sender) = self.channels.get(&property_id) {
            let _ = sender.send(notification);
        }
    }

    pub fn changed(&self, property_id: Ulid, event: &Event) {
        if self.channels.contains_key(&property_id) {
            self.send(property_id, Notification::Changed(event.clone()));
        }
    }

    /// Drop a property's channel, e.g. when the property is deleted.
    pub fn remove(&self, property_id: &Ulid) {
        self.channels.remove(property_id);
    }
}
