//! Typed interface over the external publish/subscribe broker.

pub mod memory;
pub mod mqtt;

use crate::config::{BrokerBackend, BrokerConfig};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use memory::MemoryBroker;
pub use mqtt::MqttBroker;

/// A message the broker delivered for a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: String,
}

/// Where a broker subscription delivers its messages.
pub type DeliverySink = mpsc::UnboundedSender<BrokerMessage>;

/// Identifies one broker-level subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: u64,
    pub topic: String,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish `payload` on `topic`. Fails when the broker is unreachable.
    async fn publish(&self, topic: &str, payload: &str) -> Result<()>;

    /// Open a subscription; every message on `topic` is sent to `sink` until the
    /// returned handle is unsubscribed.
    async fn subscribe(&self, topic: &str, sink: DeliverySink) -> Result<SubscriptionHandle>;

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()>;

    /// Whether the broker connection is currently up.
    fn is_connected(&self) -> bool;
}

/// Connect the configured backend. Fails with `ConnectionFail` if the broker cannot be
/// reached within the connect timeout.
pub async fn connect(
    config: &BrokerConfig,
    shutdown: CancellationToken,
) -> Result<Arc<dyn Broker>> {
    match config.backend {
        BrokerBackend::Mqtt => Ok(Arc::new(MqttBroker::connect(config, shutdown).await?)),
        BrokerBackend::Memory => Ok(Arc::new(MemoryBroker::new())),
    }
}
