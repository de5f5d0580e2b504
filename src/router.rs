//! Per-frame message routing.
//!
//! Each frame is handled on its own: parse, verify the token, dispatch. The connection
//! carries no authenticated state between frames, so token expiry or rotation takes
//! effect on the next frame.

use crate::auth::{Identity, TokenVerifier};
use crate::broker::Broker;
use crate::config::SessionPolicy;
use crate::connection::Connection;
use crate::error::{RelayError, Result};
use crate::fanout::TopicFanout;
use crate::metrics::Metrics;
use crate::protocol::{
    Action, ClientFrame, ServerFrame, STATUS_PUBLISHED, STATUS_SUBSCRIBED, STATUS_UNSUBSCRIBED,
};
use crate::registry::ConnectionRegistry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub ack_subscriptions: bool,
    pub session_policy: SessionPolicy,
    pub request_timeout: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            ack_subscriptions: true,
            session_policy: SessionPolicy::Replace,
            request_timeout: Duration::from_secs(5),
        }
    }
}

pub struct MessageRouter {
    verifier: Arc<dyn TokenVerifier>,
    registry: Arc<ConnectionRegistry>,
    fanout: TopicFanout,
    broker: Arc<dyn Broker>,
    metrics: Arc<Metrics>,
    settings: RouterSettings,
}

impl MessageRouter {
    pub fn new(
        verifier: Arc<dyn TokenVerifier>,
        registry: Arc<ConnectionRegistry>,
        fanout: TopicFanout,
        broker: Arc<dyn Broker>,
        metrics: Arc<Metrics>,
        settings: RouterSettings,
    ) -> Self {
        Self {
            verifier,
            registry,
            fanout,
            broker,
            metrics,
            settings,
        }
    }

    /// Handle one inbound text frame and write any reply to `connection`.
    ///
    /// Never fails: frame errors become an `{"error": ...}` reply to the sender. A reply
    /// that cannot be written marks the connection closed so its task runs cleanup.
    pub async fn handle_frame(&self, connection: &Arc<Connection>, text: &str) {
        let start = Instant::now();
        self.metrics.frames_received.inc();

        let reply = match self.dispatch(connection, text).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Frame from connection {} rejected: {}", connection.id(), e);
                self.metrics
                    .frames_rejected
                    .with_label_values(&[e.kind()])
                    .inc();
                Some(ServerFrame::error(e.client_message()))
            }
        };

        if let Some(reply) = reply {
            if let Err(e) = connection.send(reply) {
                debug!("Could not reply on connection {}: {}", connection.id(), e);
            }
        }

        self.metrics
            .frame_latency
            .observe(start.elapsed().as_secs_f64());
    }

    /// Parse, authenticate and execute a frame, returning the reply for the sender.
    pub async fn dispatch(
        &self,
        connection: &Arc<Connection>,
        text: &str,
    ) -> Result<Option<ServerFrame>> {
        let frame = ClientFrame::parse(text)?;
        let identity = self.verifier.verify(&frame.token)?;

        match frame.action {
            Action::Subscribe => self.subscribe(connection, &identity, &frame.topic).await,
            Action::Unsubscribe => self.unsubscribe(connection, &identity, &frame.topic).await,
            Action::Publish { message } => self.publish(&identity, &frame.topic, &message).await,
        }
    }

    async fn subscribe(
        &self,
        connection: &Arc<Connection>,
        identity: &Identity,
        topic: &str,
    ) -> Result<Option<ServerFrame>> {
        connection.set_identity(&identity.user_id);
        let previous = self.registry.register(&identity.user_id, connection);

        let outcome = self.fanout.subscribe(topic, connection).await?;
        debug!(
            "User '{}' subscribed to '{}' on connection {} ({:?})",
            identity.user_id,
            topic,
            connection.id(),
            outcome
        );

        // The older session is only closed once the new one holds its subscription.
        if let Some(previous) = previous {
            if self.settings.session_policy == SessionPolicy::ClosePrevious {
                info!(
                    "Closing connection {} replaced by {} for user '{}'",
                    previous.id(),
                    connection.id(),
                    identity.user_id
                );
                previous.close();
            }
        }

        Ok(self
            .settings
            .ack_subscriptions
            .then(|| ServerFrame::status(STATUS_SUBSCRIBED)))
    }

    async fn unsubscribe(
        &self,
        connection: &Arc<Connection>,
        identity: &Identity,
        topic: &str,
    ) -> Result<Option<ServerFrame>> {
        let removed = self.fanout.unsubscribe(topic, connection.id()).await;
        debug!(
            "User '{}' unsubscribed from '{}' (was subscribed: {})",
            identity.user_id, topic, removed
        );
        Ok(Some(ServerFrame::status(STATUS_UNSUBSCRIBED)))
    }

    async fn publish(
        &self,
        identity: &Identity,
        topic: &str,
        message: &str,
    ) -> Result<Option<ServerFrame>> {
        self.publish_message(topic, message).await?;
        info!("User '{}' published to topic '{}'", identity.user_id, topic);
        Ok(Some(ServerFrame::status(STATUS_PUBLISHED)))
    }

    /// Publish on the broker with the configured timeout.
    pub async fn publish_message(&self, topic: &str, message: &str) -> Result<()> {
        match tokio::time::timeout(
            self.settings.request_timeout,
            self.broker.publish(topic, message),
        )
        .await
        {
            Ok(Ok(())) => {
                self.metrics.messages_published.inc();
                Ok(())
            }
            Ok(Err(e @ RelayError::MessagePublish(_))) => Err(e),
            Ok(Err(e)) => Err(RelayError::MessagePublish(e.to_string())),
            Err(_) => Err(RelayError::MessagePublish(format!(
                "publish to '{}' timed out after {:?}",
                topic, self.settings.request_timeout
            ))),
        }
    }

    pub fn fanout(&self) -> &TopicFanout {
        &self.fanout
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MockTokenVerifier;
    use crate::broker::MemoryBroker;
    use crate::connection::Outbound;
    use tokio::sync::mpsc;

    struct Harness {
        broker: Arc<MemoryBroker>,
        registry: Arc<ConnectionRegistry>,
        router: MessageRouter,
    }

    /// Tokens of the form `valid:<user>` verify as `<user>`; anything else fails.
    fn verifier() -> MockTokenVerifier {
        let mut verifier = MockTokenVerifier::new();
        verifier.expect_verify().returning(|token| {
            token
                .strip_prefix("valid:")
                .map(|user| Identity {
                    user_id: user.to_string(),
                })
                .ok_or_else(|| RelayError::Authentication("bad token".to_string()))
        });
        verifier
    }

    fn harness(settings: RouterSettings) -> Harness {
        harness_with_verifier(settings, verifier())
    }

    fn harness_with_verifier(settings: RouterSettings, verifier: MockTokenVerifier) -> Harness {
        let broker = Arc::new(MemoryBroker::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let metrics = Metrics::new().unwrap();
        let fanout = TopicFanout::spawn(broker.clone(), settings.request_timeout, metrics.clone());
        let router = MessageRouter::new(
            Arc::new(verifier),
            registry.clone(),
            fanout,
            broker.clone(),
            metrics,
            settings,
        );
        Harness {
            broker,
            registry,
            router,
        }
    }

    async fn next_frame(rx: &mut mpsc::Receiver<Outbound>) -> Option<ServerFrame> {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(Outbound::Frame(frame))) => Some(frame),
            _ => None,
        }
    }

    fn subscribe_frame(topic: &str, user: &str) -> String {
        serde_json::json!({
            "action": "subscribe",
            "topic": topic,
            "token": format!("valid:{}", user),
        })
        .to_string()
    }

    fn publish_frame(topic: &str, message: &str, user: &str) -> String {
        serde_json::json!({
            "action": "publish",
            "topic": topic,
            "message": message,
            "token": format!("valid:{}", user),
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber_not_publisher() {
        let h = harness(RouterSettings::default());
        let (c1, mut rx1) = Connection::channel();
        let (c2, mut rx2) = Connection::channel();

        h.router.handle_frame(&c1, &subscribe_frame("news", "alice")).await;
        assert_eq!(
            next_frame(&mut rx1).await,
            Some(ServerFrame::status(STATUS_SUBSCRIBED))
        );

        h.router
            .handle_frame(&c2, &publish_frame("news", "hello", "bob"))
            .await;
        assert_eq!(
            next_frame(&mut rx2).await,
            Some(ServerFrame::status(STATUS_PUBLISHED))
        );
        assert_eq!(
            next_frame(&mut rx1).await,
            Some(ServerFrame::delivery("news", "hello"))
        );

        h.router.fanout().stats().await;
        assert!(rx2.try_recv().is_err());
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_two_subscribers_share_one_broker_subscription() {
        let h = harness(RouterSettings::default());
        let (a, mut rx_a) = Connection::channel();
        let (b, mut rx_b) = Connection::channel();
        let (p, _rx_p) = Connection::channel();

        h.router.handle_frame(&a, &subscribe_frame("news", "alice")).await;
        h.router.handle_frame(&b, &subscribe_frame("news", "bob")).await;
        assert_eq!(h.broker.subscribe_calls(), 1);
        next_frame(&mut rx_a).await;
        next_frame(&mut rx_b).await;

        h.router.handle_frame(&p, &publish_frame("sport", "goal", "carol")).await;
        h.router.handle_frame(&p, &publish_frame("news", "hello", "carol")).await;

        let expected = Some(ServerFrame::delivery("news", "hello"));
        assert_eq!(next_frame(&mut rx_a).await, expected);
        assert_eq!(next_frame(&mut rx_b).await, expected);
        h.router.fanout().stats().await;
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_token_keeps_connection_usable() {
        let h = harness(RouterSettings::default());
        let (c, mut rx) = Connection::channel();

        let bad = r#"{"action":"subscribe","topic":"news","token":"forged"}"#;
        h.router.handle_frame(&c, bad).await;
        assert_eq!(
            next_frame(&mut rx).await,
            Some(ServerFrame::error("Invalid token."))
        );
        assert!(c.is_open());
        assert!(h.registry.lookup("forged").is_none());

        h.router.handle_frame(&c, &subscribe_frame("news", "alice")).await;
        assert_eq!(
            next_frame(&mut rx).await,
            Some(ServerFrame::status(STATUS_SUBSCRIBED))
        );
    }

    #[tokio::test]
    async fn test_publish_without_message_never_reaches_broker() {
        let mut verifier = MockTokenVerifier::new();
        verifier.expect_verify().never();
        let h = harness_with_verifier(RouterSettings::default(), verifier);
        let (c, mut rx) = Connection::channel();

        h.router
            .handle_frame(&c, r#"{"action":"publish","topic":"news","token":"valid:alice"}"#)
            .await;
        assert_eq!(
            next_frame(&mut rx).await,
            Some(ServerFrame::error(
                "Invalid action or missing message for publish."
            ))
        );
        assert_eq!(h.broker.publish_calls(), 0);
    }

    #[tokio::test]
    async fn test_malformed_json_is_reported() {
        let h = harness(RouterSettings::default());
        let (c, mut rx) = Connection::channel();

        h.router.handle_frame(&c, "{oops").await;
        assert_eq!(
            next_frame(&mut rx).await,
            Some(ServerFrame::error("Invalid JSON message."))
        );
        h.router
            .handle_frame(&c, r#"{"action":"subscribe","topic":"news"}"#)
            .await;
        assert_eq!(
            next_frame(&mut rx).await,
            Some(ServerFrame::error("Authentication required."))
        );
    }

    #[tokio::test]
    async fn test_broker_publish_failure_is_reported() {
        let h = harness(RouterSettings::default());
        let (c, mut rx) = Connection::channel();

        h.broker.set_available(false);
        h.router
            .handle_frame(&c, &publish_frame("news", "hello", "alice"))
            .await;
        assert_eq!(
            next_frame(&mut rx).await,
            Some(ServerFrame::error("Failed to publish message."))
        );
        assert!(c.is_open());

        h.broker.set_available(true);
        h.router
            .handle_frame(&c, &publish_frame("news", "hello", "alice"))
            .await;
        assert_eq!(
            next_frame(&mut rx).await,
            Some(ServerFrame::status(STATUS_PUBLISHED))
        );
    }

    #[tokio::test]
    async fn test_broker_subscribe_failure_is_reported() {
        let h = harness(RouterSettings::default());
        let (c, mut rx) = Connection::channel();

        h.broker.set_available(false);
        h.router.handle_frame(&c, &subscribe_frame("news", "alice")).await;
        assert_eq!(
            next_frame(&mut rx).await,
            Some(ServerFrame::error("Failed to subscribe to topic."))
        );
        assert!(c.is_open());
    }

    #[tokio::test]
    async fn test_subscription_ack_can_be_disabled() {
        let h = harness(RouterSettings {
            ack_subscriptions: false,
            ..RouterSettings::default()
        });
        let (c, mut rx) = Connection::channel();

        h.router.handle_frame(&c, &subscribe_frame("news", "alice")).await;
        h.router.fanout().deliver("news", "hello").await;
        assert_eq!(
            next_frame(&mut rx).await,
            Some(ServerFrame::delivery("news", "hello"))
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_action() {
        let h = harness(RouterSettings::default());
        let (c, mut rx) = Connection::channel();

        h.router.handle_frame(&c, &subscribe_frame("news", "alice")).await;
        next_frame(&mut rx).await;

        let frame = r#"{"action":"unsubscribe","topic":"news","token":"valid:alice"}"#;
        h.router.handle_frame(&c, frame).await;
        assert_eq!(
            next_frame(&mut rx).await,
            Some(ServerFrame::status(STATUS_UNSUBSCRIBED))
        );
        assert_eq!(h.broker.subscriptions_for("news"), 0);

        assert_eq!(h.router.fanout().deliver("news", "late").await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_replace_policy_keeps_previous_open() {
        let h = harness(RouterSettings::default());
        let (first, _rx1) = Connection::channel();
        let (second, _rx2) = Connection::channel();

        h.router.handle_frame(&first, &subscribe_frame("news", "alice")).await;
        h.router.handle_frame(&second, &subscribe_frame("news", "alice")).await;

        assert_eq!(h.registry.lookup("alice").unwrap().id(), second.id());
        assert!(first.is_open());
    }

    #[tokio::test]
    async fn test_close_previous_policy() {
        let h = harness(RouterSettings {
            session_policy: SessionPolicy::ClosePrevious,
            ..RouterSettings::default()
        });
        let (first, mut rx1) = Connection::channel();
        let (second, _rx2) = Connection::channel();

        h.router.handle_frame(&first, &subscribe_frame("news", "alice")).await;
        next_frame(&mut rx1).await;
        h.router.handle_frame(&second, &subscribe_frame("news", "alice")).await;

        assert!(!first.is_open());
        assert_eq!(rx1.recv().await, Some(Outbound::Close));
        assert_eq!(h.registry.lookup("alice").unwrap().id(), second.id());
    }

    #[tokio::test]
    async fn test_close_previous_keeps_old_session_when_subscribe_fails() {
        let h = harness(RouterSettings {
            session_policy: SessionPolicy::ClosePrevious,
            ..RouterSettings::default()
        });
        let (first, mut rx1) = Connection::channel();
        let (second, mut rx2) = Connection::channel();

        h.router.handle_frame(&first, &subscribe_frame("news", "alice")).await;
        next_frame(&mut rx1).await;

        h.broker.set_available(false);
        h.router.handle_frame(&second, &subscribe_frame("sport", "alice")).await;
        assert_eq!(
            next_frame(&mut rx2).await,
            Some(ServerFrame::error("Failed to subscribe to topic."))
        );
        assert!(first.is_open());
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscribe_records_connection_identity() {
        let h = harness(RouterSettings::default());
        let (c, mut rx) = Connection::channel();

        h.router.handle_frame(&c, &publish_frame("news", "hi", "bob")).await;
        next_frame(&mut rx).await;
        assert_eq!(c.identity(), None);

        h.router.handle_frame(&c, &subscribe_frame("news", "alice")).await;
        next_frame(&mut rx).await;
        assert_eq!(c.identity().as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_reply_to_closed_connection_is_swallowed() {
        let h = harness(RouterSettings::default());
        let (c, rx) = Connection::channel();
        drop(rx);

        h.router
            .handle_frame(&c, &publish_frame("news", "hello", "alice"))
            .await;
        assert!(!c.is_open());
        assert_eq!(h.broker.publish_calls(), 1);
    }
}
