//! Broadcast bus between the network core and whatever front-end listens.

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::debug;

use crate::types::Event;

/// Replies stream in as many progress events; keep enough room for a burst.
const CAPACITY: usize = 256;

/// Cloneable handle for publishing [`Event`]s. Every clone feeds the same
/// subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CAPACITY);
        Self { sender }
    }

    /// Publish `event`, returning how many subscribers will see it. Events
    /// published while nobody listens are dropped.
    pub fn emit(&self, event: Event) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Listen for events published from now on.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

/// One listener's view of the bus.
///
/// A subscriber that falls behind loses the oldest events; the gap is logged
/// and skipped rather than surfaced.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
}

impl Subscription {
    /// Wait for the next event. `None` once every [`EventBus`] handle is gone.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(missed)) => debug!(missed, "Subscriber lagged behind"),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Every event already waiting, without blocking.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Lagged(missed)) => debug!(missed, "Subscriber lagged behind"),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return events,
            }
        }
    }

    /// Wait until a sign-in attempt concludes, skipping everything else.
    pub async fn auth_outcome(&mut self) -> Option<Event> {
        while let Some(event) = self.next().await {
            if event.is_auth_outcome() {
                return Some(event);
            }
        }
        None
    }
}
