//! Context events.
//!
//! Subscribers receive an event for every user-visible change made to a
//! context. Changes made while the context is in internal mode (loading,
//! copying, reconciling after a persist) are not reported.
//!
//! ```rust,ignore
//! let events = ctx.subscribe();
//! ctx.set_value(order, "number", "A-7".into())?;
//! assert!(matches!(events.try_recv(), Ok(ContextEvent::ValueChanged { .. })));
//! ```

use crate::entity::EntityId;
use relgraph_store::Value;
use std::sync::mpsc::{self, Receiver, Sender};

/// A change observed in an entity context.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextEvent {
    /// An entity's primary key changed.
    KeyChanged {
        /// Entity.
        id: EntityId,
        /// Previous key.
        old: Option<Value>,
        /// New key.
        new: Option<Value>,
    },
    /// A value node was assigned.
    ValueChanged {
        /// Entity.
        id: EntityId,
        /// Node name.
        node: String,
    },
    /// A reference node now points elsewhere.
    ReferenceChanged {
        /// Entity.
        id: EntityId,
        /// Node name.
        node: String,
        /// Previous target.
        old: Option<EntityId>,
        /// New target.
        new: Option<EntityId>,
    },
    /// Collection members changed.
    CollectionChanged {
        /// Owner.
        id: EntityId,
        /// Node name.
        node: String,
    },
    /// An entity was loaded from the database.
    Loaded {
        /// Entity.
        id: EntityId,
    },
    /// An entity was unloaded.
    Unloaded {
        /// Entity.
        id: EntityId,
    },
    /// An entity was removed from the context.
    Removed {
        /// Entity.
        id: EntityId,
    },
}

/// Fan-out of context events to channel subscribers.
#[derive(Debug, Default)]
pub(crate) struct EventFeed {
    subscribers: Vec<Sender<ContextEvent>>,
}

impl EventFeed {
    pub(crate) fn subscribe(&mut self) -> Receiver<ContextEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    /// Sends to every live subscriber, dropping disconnected ones.
    pub(crate) fn emit(&mut self, event: ContextEvent) {
        if self.subscribers.is_empty() {
            return;
        }
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_to_all_subscribers() {
        let mut feed = EventFeed::default();
        let a = feed.subscribe();
        let b = feed.subscribe();
        let id = EntityId::new();

        feed.emit(ContextEvent::Loaded { id });

        assert_eq!(a.try_recv().unwrap(), ContextEvent::Loaded { id });
        assert_eq!(b.try_recv().unwrap(), ContextEvent::Loaded { id });
    }

    #[test]
    fn drops_disconnected_subscribers() {
        let mut feed = EventFeed::default();
        let rx = feed.subscribe();
        drop(feed.subscribe());

        feed.emit(ContextEvent::Removed { id: EntityId::new() });

        assert_eq!(feed.subscriber_count(), 1);
        assert!(rx.try_recv().is_ok());
    }
}
