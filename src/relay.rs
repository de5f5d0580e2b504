use crate::auth::{JwtVerifier, TokenVerifier};
use crate::broker::{self, Broker};
use crate::config::Config;
use crate::connection::{Connection, Outbound};
use crate::error::Result as RelayResult;
use crate::fanout::TopicFanout;
use crate::metrics::Metrics;
use crate::protocol::ServerFrame;
use crate::registry::ConnectionRegistry;
use crate::router::{MessageRouter, RouterSettings};
use crate::web_server::{self, AppState};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Composition root: owns the broker connection and wires the registry, fan-out table
/// and router behind the WebSocket transport.
pub struct Relay {
    config: Config,
    broker: Arc<dyn Broker>,
    router: Arc<MessageRouter>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
}

impl Relay {
    /// Connect to the broker and build the relay. A broker that cannot be reached is a
    /// startup failure: no connections are accepted without one.
    pub async fn new(config: Config) -> Result<Self> {
        info!("Initializing WebSocket relay");

        let shutdown = CancellationToken::new();
        let broker = broker::connect(&config.broker, shutdown.child_token())
            .await
            .context("Broker unreachable at startup")?;
        let verifier = Arc::new(JwtVerifier::new(&config.auth));

        Self::with_parts(config, broker, verifier, shutdown)
    }

    /// Build the relay around an already connected broker and a token verifier.
    pub fn with_parts(
        config: Config,
        broker: Arc<dyn Broker>,
        verifier: Arc<dyn TokenVerifier>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let metrics = Metrics::new().context("Failed to register metrics")?;
        let registry = Arc::new(ConnectionRegistry::new());
        let fanout = TopicFanout::spawn(
            Arc::clone(&broker),
            config.broker.request_timeout(),
            Arc::clone(&metrics),
        );

        let settings = RouterSettings {
            ack_subscriptions: config.server.ack_subscriptions,
            session_policy: config.server.session_policy,
            request_timeout: config.broker.request_timeout(),
        };
        let router = Arc::new(MessageRouter::new(
            verifier,
            registry,
            fanout,
            Arc::clone(&broker),
            Arc::clone(&metrics),
            settings,
        ));

        Ok(Self {
            config,
            broker,
            router,
            metrics,
            shutdown,
        })
    }

    pub fn app(&self) -> axum::Router {
        let state = AppState {
            router: Arc::clone(&self.router),
            broker: Arc::clone(&self.broker),
            metrics: Arc::clone(&self.metrics),
            idle_timeout: self.config.server.idle_timeout(),
            ping_interval: self.config.server.ping_interval(),
            outbound_capacity: self.config.server.outbound_buffer,
        };
        web_server::create_router(state, &self.config.server.ws_path)
    }

    /// Publish from inside the process, bypassing client authentication.
    pub async fn publish(&self, topic: &str, message: &str) -> RelayResult<()> {
        self.router.publish_message(topic, message).await
    }

    /// Receive a topic's messages inside the process, through the same fan-out table
    /// that serves client connections.
    pub async fn subscribe(&self, topic: &str) -> RelayResult<LocalSubscription> {
        let (connection, rx) = Connection::with_capacity(self.config.server.outbound_buffer);
        self.router.fanout().subscribe(topic, &connection).await?;

        Ok(LocalSubscription {
            topic: topic.to_string(),
            connection,
            rx,
            fanout: self.router.fanout().clone(),
            active: true,
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn run(&self) -> Result<()> {
        let address = self.config.server.bind_address();
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("Failed to bind to {}", address))?;
        self.serve(listener).await
    }

    /// Serve on `listener` until Ctrl-C or [`Relay::shutdown`].
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!(
            "WebSocket relay listening on ws://{}{}",
            listener.local_addr()?,
            self.config.server.ws_path
        );

        let shutdown = self.shutdown.clone();
        axum::serve(listener, self.app())
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Shutting down WebSocket relay"),
                    _ = shutdown.cancelled() => {}
                }
            })
            .await?;

        // Stops the broker event loop as well.
        self.shutdown.cancel();
        Ok(())
    }
}

/// In-process subscription to a topic. Dropping it leaves the topic.
pub struct LocalSubscription {
    topic: String,
    connection: Arc<Connection>,
    rx: mpsc::Receiver<Outbound>,
    fanout: TopicFanout,
    active: bool,
}

impl LocalSubscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next message on the topic, or `None` once the subscription is closed.
    ///
    /// A subscription that falls more than the outbound buffer behind is closed.
    pub async fn recv(&mut self) -> Option<String> {
        loop {
            let item = tokio::select! {
                biased;
                item = self.rx.recv() => item?,
                _ = self.connection.closed() => return None,
            };
            match item {
                Outbound::Frame(ServerFrame::Delivery { message, .. }) => return Some(message),
                Outbound::Frame(_) => continue,
                Outbound::Close => return None,
            }
        }
    }

    pub async fn unsubscribe(mut self) {
        self.active = false;
        self.connection.mark_closed();
        self.fanout.unsubscribe_all(self.connection.id()).await;
    }
}

impl Drop for LocalSubscription {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        self.connection.mark_closed();

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let fanout = self.fanout.clone();
        let id = self.connection.id();
        debug!("Local subscription to '{}' dropped", self.topic);
        runtime.spawn(async move {
            fanout.unsubscribe_all(id).await;
        });
    }
}
