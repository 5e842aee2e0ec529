//! Subscription registry and message fan-out
//!
//! Every call to `add` creates its own registration, so overlapping filters (or the same
//! filter registered twice) each receive their own callback for a matching message.

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use super::packet::{Message, QoS};
use super::topic::TopicFilter;

/// Callback invoked for every message matching a registration
pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Registration {
    id: HandlerId,
    filter: TopicFilter,
    qos: QoS,
    handler: Option<MessageHandler>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("filter", &self.filter)
            .field("qos", &self.qos)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

/// Handlers selected for one topic by [`SubscriptionRegistry::matching`]
pub struct Delivery {
    handlers: Vec<MessageHandler>,
}

impl Delivery {
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn dispatch(self, message: &Message) -> usize {
        for handler in &self.handlers {
            handler(message);
        }
        trace!("Dispatched '{}' to {} handlers", message.topic, self.handlers.len());
        self.handlers.len()
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    registrations: Vec<Registration>,
    next_id: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a filter, optionally with a handler; handlerless entries still count
    /// towards [`effective_qos`](Self::effective_qos)
    pub fn add(
        &mut self,
        filter: TopicFilter,
        qos: QoS,
        handler: Option<MessageHandler>,
    ) -> HandlerId {
        self.next_id += 1;
        let id = HandlerId(self.next_id);
        self.registrations.push(Registration {
            id,
            filter,
            qos,
            handler,
        });
        id
    }

    /// Drops every registration for `filter`, returning how many were removed
    pub fn remove(&mut self, filter: &str) -> usize {
        let before = self.registrations.len();
        self.registrations.retain(|r| r.filter.as_str() != filter);
        before - self.registrations.len()
    }

    pub fn remove_handler(&mut self, id: HandlerId) -> bool {
        let before = self.registrations.len();
        self.registrations.retain(|r| r.id != id);
        before != self.registrations.len()
    }

    /// Handlers of all registrations matching `topic`, in registration order
    ///
    /// The result is detached from the registry, so callbacks run from it may register
    /// or remove handlers.
    pub fn matching(&self, topic: &str) -> Delivery {
        Delivery {
            handlers: self
                .registrations
                .iter()
                .filter(|r| r.filter.matches(topic))
                .filter_map(|r| r.handler.clone())
                .collect(),
        }
    }

    /// Invokes every matching handler once, returning the number of calls made
    pub fn dispatch(&self, message: &Message) -> usize {
        self.matching(&message.topic).dispatch(message)
    }

    /// Highest QoS among registrations matching `topic`
    pub fn effective_qos(&self, topic: &str) -> Option<QoS> {
        self.registrations
            .iter()
            .filter(|r| r.filter.matches(topic))
            .map(|r| r.qos)
            .max()
    }

    pub fn contains(&self, filter: &str) -> bool {
        self.registrations.iter().any(|r| r.filter.as_str() == filter)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn clear(&mut self) {
        self.registrations.clear();
    }
}
