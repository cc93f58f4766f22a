//! ABOUTME: EventBus implementation with pattern and execution-ID routing
//! ABOUTME: Synchronous fan-out over unbounded channels plus a broadcast firehose

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;
use uuid::Uuid;

use crate::event::BusEvent;

const BROADCAST_CAPACITY: usize = 10_000;

/// Individual subscription
#[derive(Debug)]
struct Subscription {
    id: Uuid,
    execution_filter: Option<String>,
    sender: mpsc::UnboundedSender<BusEvent>,
}

/// Event bus for publishing and subscribing to engine events.
///
/// Routing is synchronous: by the time `publish` returns, every matching
/// subscriber's channel holds the event, preserving per-publisher FIFO
/// order. Subscribers whose receivers were dropped are pruned lazily.
pub struct EventBus {
    /// Pattern-keyed subscriptions
    subscriptions: Arc<DashMap<String, Vec<Subscription>>>,
    /// Broadcast channel for all events
    broadcast_tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            subscriptions: Arc::new(DashMap::new()),
            broadcast_tx,
        }
    }

    /// Publish an event to every matching subscriber
    pub fn publish(&self, event: BusEvent) {
        if self.broadcast_tx.send(event.clone()).is_err() {
            debug!(event_type = %event.event_type, "no broadcast receivers");
        }

        for mut entry in self.subscriptions.iter_mut() {
            let pattern = entry.key().clone();
            if !event.matches_pattern(&pattern) {
                continue;
            }
            entry.value_mut().retain(|subscription| {
                if let Some(filter) = &subscription.execution_filter {
                    if filter != &event.execution_id {
                        return true;
                    }
                }
                match subscription.sender.send(event.clone()) {
                    Ok(()) => true,
                    Err(_) => {
                        debug!(
                            subscription = %subscription.id,
                            pattern = %pattern,
                            "pruning dropped subscriber"
                        );
                        false
                    }
                }
            });
        }
    }

    /// Subscribe to events matching a glob pattern
    pub fn subscribe(&self, pattern: &str) -> mpsc::UnboundedReceiver<BusEvent> {
        self.subscribe_inner(pattern, None)
    }

    /// Subscribe to every event of a single execution
    pub fn subscribe_execution(&self, execution_id: &str) -> mpsc::UnboundedReceiver<BusEvent> {
        self.subscribe_inner("*", Some(execution_id.to_string()))
    }

    /// Subscribe to a pattern, filtered to one execution
    pub fn subscribe_filtered(
        &self,
        pattern: &str,
        execution_id: &str,
    ) -> mpsc::UnboundedReceiver<BusEvent> {
        self.subscribe_inner(pattern, Some(execution_id.to_string()))
    }

    fn subscribe_inner(
        &self,
        pattern: &str,
        execution_filter: Option<String>,
    ) -> mpsc::UnboundedReceiver<BusEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions
            .entry(pattern.to_string())
            .or_default()
            .push(Subscription {
                id: Uuid::new_v4(),
                execution_filter,
                sender: tx,
            });
        rx
    }

    /// Get a broadcast receiver for all events
    pub fn subscribe_all(&self) -> broadcast::Receiver<BusEvent> {
        self.broadcast_tx.subscribe()
    }

    /// Number of live pattern subscriptions
    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .iter()
            .map(|entry| entry.value().len())
            .sum()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
