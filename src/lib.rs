pub mod auth;
pub mod broker;
pub mod config;
pub mod connection;
pub mod error;
pub mod fanout;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod router;
pub mod web_server;

pub use auth::{Identity, JwtVerifier, TokenVerifier};
pub use broker::{Broker, MemoryBroker, MqttBroker};
pub use config::Config;
pub use error::{RelayError, Result};
pub use relay::{LocalSubscription, Relay};
