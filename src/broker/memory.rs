//! Process-local broker.
//!
//! Used for single-node deployments and as the broker double in tests: it counts
//! subscribe calls and can be switched unavailable to simulate an outage.

use super::{Broker, BrokerMessage, DeliverySink, SubscriptionHandle};
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tracing::debug;

pub struct MemoryBroker {
    routes: Mutex<HashMap<String, HashMap<u64, DeliverySink>>>,
    next_id: AtomicU64,
    subscribe_calls: AtomicUsize,
    publish_calls: AtomicUsize,
    available: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            subscribe_calls: AtomicUsize::new(0),
            publish_calls: AtomicUsize::new(0),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Successful `subscribe` calls since creation.
    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn publish_calls(&self) -> usize {
        self.publish_calls.load(Ordering::SeqCst)
    }

    /// Open subscriptions on `topic`.
    pub fn subscriptions_for(&self, topic: &str) -> usize {
        self.routes.lock().get(topic).map_or(0, HashMap::len)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RelayError::ConnectionFail("memory broker unavailable".to_string()))
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        self.ensure_available()
            .map_err(|e| RelayError::MessagePublish(e.to_string()))?;
        self.publish_calls.fetch_add(1, Ordering::SeqCst);

        let mut routes = self.routes.lock();
        if let Some(sinks) = routes.get_mut(topic) {
            // Sinks whose receiver is gone are dropped here.
            sinks.retain(|_, sink| {
                sink.send(BrokerMessage {
                    topic: topic.to_string(),
                    payload: payload.to_string(),
                })
                .is_ok()
            });
            debug!("Published on '{}' to {} subscription(s)", topic, sinks.len());
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, sink: DeliverySink) -> Result<SubscriptionHandle> {
        self.ensure_available()
            .map_err(|e| RelayError::Subscription(e.to_string()))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.routes
            .lock()
            .entry(topic.to_string())
            .or_default()
            .insert(id, sink);
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);

        Ok(SubscriptionHandle {
            id,
            topic: topic.to_string(),
        })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        let mut routes = self.routes.lock();
        if let Some(sinks) = routes.get_mut(&handle.topic) {
            sinks.remove(&handle.id);
            if sinks.is_empty() {
                routes.remove(&handle.topic);
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}
