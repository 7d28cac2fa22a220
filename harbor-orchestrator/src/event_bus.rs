//! # Event Bus
//!
//! The single channel that multiplexes the progress of every service task of a deployment
//! back to one consumer (the terminal renderer or the SSE endpoint).
//!
//! Publication order is the observable record of a deployment. The channel is unbounded so a
//! slow consumer never drops an event nor stalls a service task.

use harbor_protocol::Event;
use log::debug;
use tokio::sync::mpsc;

/// Receiving half handed to the consumer.
pub type EventStream = mpsc::UnboundedReceiver<Event>;

/// Sending half, cloned into every service task.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: mpsc::UnboundedSender<Event>,
}

impl EventBus {
    /// Creates a bus and the stream that receives everything published on it.
    pub fn channel() -> (Self, EventStream) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Publishes an event.
    ///
    /// A consumer that went away does not stop the deployment: the event is dropped.
    pub fn publish(&self, event: Event) {
        if let Err(mpsc::error::SendError(event)) = self.sender.send(event) {
            debug!("EventBus: no consumer, dropped {}", event);
        }
    }
}
