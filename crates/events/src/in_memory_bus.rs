//! In-process audit bus.
//!
//! Fans envelopes out to live subscriptions and optionally keeps the most
//! recent ones, so a consumer that attaches late (an audit tail opened after
//! startup, a test asserting on what an engine call emitted) can still see
//! them.

use std::collections::VecDeque;
use std::sync::{Mutex, mpsc};

use crate::bus::{EventBus, Subscription};

#[derive(Debug)]
pub enum InMemoryBusError {
    /// Publish failed due to internal lock poisoning.
    Poisoned,
}

#[derive(Debug)]
struct BusState<M> {
    subscribers: Vec<mpsc::Sender<M>>,
    retained: VecDeque<M>,
    published: u64,
}

/// In-memory pub/sub bus for audit envelopes.
///
/// Publishing never blocks on consumers. Subscriptions whose receiver was
/// dropped are pruned on the next publish. With a retention of `n`, the last
/// `n` messages stay readable through [`InMemoryEventBus::recent`] and are
/// replayed to [`InMemoryEventBus::subscribe_with_backlog`].
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    state: Mutex<BusState<M>>,
    retention: usize,
}

impl<M> InMemoryEventBus<M> {
    /// Live fan-out only; nothing is retained.
    pub fn new() -> Self {
        Self::with_retention(0)
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            state: Mutex::new(BusState {
                subscribers: Vec::new(),
                retained: VecDeque::with_capacity(retention),
                published: 0,
            }),
            retention,
        }
    }

    /// Messages accepted since the bus was created.
    pub fn published(&self) -> u64 {
        self.state.lock().map(|s| s.published).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().map(|s| s.subscribers.len()).unwrap_or(0)
    }
}

impl<M: Clone> InMemoryEventBus<M> {
    /// Retained messages, oldest first.
    pub fn recent(&self) -> Vec<M> {
        self.state
            .lock()
            .map(|s| s.retained.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Subscribes and queues the retained messages ahead of live ones.
    pub fn subscribe_with_backlog(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut state) = self.state.lock() {
            for m in &state.retained {
                // The receiver is alive: it is returned below.
                let _ = tx.send(m.clone());
            }
            state.subscribers.push(tx);
        }
        Subscription::new(rx)
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut state = self.state.lock().map_err(|_| InMemoryBusError::Poisoned)?;

        state.subscribers.retain(|tx| tx.send(message.clone()).is_ok());
        if self.retention > 0 {
            if state.retained.len() == self.retention {
                state.retained.pop_front();
            }
            state.retained.push_back(message);
        }
        state.published += 1;

        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();

        // A poisoned bus still hands out a subscription; it never receives.
        if let Ok(mut state) = self.state.lock() {
            state.subscribers.push(tx);
        }

        Subscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_receives_every_message() {
        let bus: InMemoryEventBus<u32> = InMemoryEventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.publish(1).unwrap();
        bus.publish(2).unwrap();

        assert_eq!(a.drain(), vec![1, 2]);
        assert_eq!(b.drain(), vec![1, 2]);
        assert_eq!(bus.published(), 2);
        assert!(bus.recent().is_empty());
    }

    #[test]
    fn dropped_subscribers_are_pruned_on_publish() {
        let bus: InMemoryEventBus<u32> = InMemoryEventBus::new();
        drop(bus.subscribe());
        let live = bus.subscribe();

        bus.publish(7).unwrap();

        assert_eq!(live.drain(), vec![7]);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn retention_keeps_the_newest_messages() {
        let bus: InMemoryEventBus<u32> = InMemoryEventBus::with_retention(2);
        for m in 1..=3 {
            bus.publish(m).unwrap();
        }

        assert_eq!(bus.recent(), vec![2, 3]);
        assert_eq!(bus.published(), 3);
    }

    #[test]
    fn late_subscribers_get_the_backlog_then_live_messages() {
        let bus: InMemoryEventBus<u32> = InMemoryEventBus::with_retention(8);
        bus.publish(1).unwrap();
        bus.publish(2).unwrap();

        let late = bus.subscribe_with_backlog();
        let plain = bus.subscribe();
        bus.publish(3).unwrap();

        assert_eq!(late.drain(), vec![1, 2, 3]);
        assert_eq!(plain.drain(), vec![3]);
    }
}
