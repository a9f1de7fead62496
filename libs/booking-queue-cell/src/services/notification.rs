use tokio::sync::broadcast;
use tracing::debug;

use crate::BookingEvent;

pub type BookingEventReceiver = broadcast::Receiver<BookingEvent>;

/// Outbound hand-off of booking outcomes to the notification collaborator.
///
/// Publishing never blocks and never fails the caller: with no subscriber, or
/// a subscriber that lags, events are dropped and only logged.
#[derive(Clone)]
pub struct BookingEventPublisher {
    sender: broadcast::Sender<BookingEvent>,
}

impl BookingEventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: BookingEvent) {
        let kind = event.kind;
        let message_id = event.message_id;
        match self.sender.send(event) {
            Ok(receivers) => debug!("Published {:?} event for message {} to {} receivers", kind, message_id, receivers),
            Err(_) => debug!("No notification subscribers for {:?} event of message {}", kind, message_id),
        }
    }

    pub fn subscribe(&self) -> BookingEventReceiver {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BookingEventPublisher {
    fn default() -> Self {
        Self::new(1000)
    }
}
