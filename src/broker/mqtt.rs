use super::{Broker, BrokerMessage, DeliverySink, SubscriptionHandle};
use crate::config::BrokerConfig;
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, Incoming, MqttOptions, QoS, Transport,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type Routes = Arc<Mutex<HashMap<String, HashMap<u64, DeliverySink>>>>;

/// Broker adapter backed by an MQTT broker.
///
/// One MQTT subscription is held per topic; every delivery for the topic is copied to
/// the sinks registered for it.
pub struct MqttBroker {
    link: Link,
    next_id: AtomicU64,
}

/// State shared by the broker handle and its event loop task.
#[derive(Clone)]
struct Link {
    client: AsyncClient,
    routes: Routes,
    connected: Arc<AtomicBool>,
}

impl MqttBroker {
    /// Connect and wait for the broker's CONNACK before returning, then hand the event
    /// loop to a background task that runs until `shutdown` is cancelled.
    pub async fn connect(config: &BrokerConfig, shutdown: CancellationToken) -> Result<Self> {
        info!(
            "Connecting to MQTT broker at {}:{}",
            config.address, config.port
        );

        let (client, mut eventloop) = AsyncClient::new(mqtt_options(config), 10000);

        let connack = tokio::time::timeout(config.connect_timeout(), async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => return Ok(()),
                    Ok(_) => continue,
                    Err(e) => return Err(e),
                }
            }
        })
        .await;

        match connack {
            Ok(Ok(())) => info!(
                "Connected to MQTT broker at {}:{}",
                config.address, config.port
            ),
            Ok(Err(e)) => {
                return Err(RelayError::ConnectionFail(format!(
                    "{}:{}: {}",
                    config.address, config.port, e
                )))
            }
            Err(_) => {
                return Err(RelayError::ConnectionFail(format!(
                    "{}:{}: timed out after {:?}",
                    config.address,
                    config.port,
                    config.connect_timeout()
                )))
            }
        }

        let link = Link::new(client, true);
        let driver = EventLoopDriver {
            eventloop,
            link: link.clone(),
            reconnect_delay: config.reconnect_delay(),
        };
        tokio::spawn(driver.run(shutdown));

        Ok(Self::with_link(link))
    }

    fn with_link(link: Link) -> Self {
        Self {
            link,
            next_id: AtomicU64::new(1),
        }
    }

    fn remove_route(&self, topic: &str, id: u64) -> bool {
        let mut routes = self.link.routes.lock();
        let Some(sinks) = routes.get_mut(topic) else {
            return false;
        };
        sinks.remove(&id);
        if sinks.is_empty() {
            routes.remove(topic);
            true
        } else {
            false
        }
    }
}

fn mqtt_options(config: &BrokerConfig) -> MqttOptions {
    // Relay instances share a broker, so each needs its own client id.
    let client_id = format!("{}-{}", config.client_id, uuid::Uuid::new_v4());
    let mut options = MqttOptions::new(client_id, &config.address, config.port);
    options.set_keep_alive(Duration::from_secs(60));

    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username, password);
    }

    if config.use_tls {
        options.set_transport(Transport::tls_with_default_config());
        info!("TLS enabled for MQTT broker connection");
    }

    options
}

/// Topics are opaque keys to the relay, so MQTT wildcard and NUL characters are refused.
fn check_topic(topic: &str) -> std::result::Result<(), String> {
    if topic.is_empty() {
        return Err("empty topic".to_string());
    }
    if topic.contains(['+', '#', '\0']) {
        return Err(format!("topic '{}' contains reserved MQTT characters", topic));
    }
    Ok(())
}

#[async_trait]
impl Broker for MqttBroker {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        check_topic(topic).map_err(RelayError::MessagePublish)?;
        if !self.is_connected() {
            return Err(RelayError::MessagePublish(
                "MQTT broker is not connected".to_string(),
            ));
        }

        self.link
            .client
            .publish(topic, QoS::AtLeastOnce, false, payload.as_bytes().to_vec())
            .await
            .map_err(|e| RelayError::MessagePublish(e.to_string()))
    }

    async fn subscribe(&self, topic: &str, sink: DeliverySink) -> Result<SubscriptionHandle> {
        check_topic(topic).map_err(RelayError::Subscription)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let first = {
            let mut routes = self.link.routes.lock();
            let sinks = routes.entry(topic.to_string()).or_default();
            sinks.insert(id, sink);
            sinks.len() == 1
        };

        if first {
            if let Err(e) = self.link.client.subscribe(topic, QoS::AtLeastOnce).await {
                self.remove_route(topic, id);
                return Err(RelayError::Subscription(e.to_string()));
            }
            info!("Subscribed to MQTT topic '{}'", topic);
        }

        Ok(SubscriptionHandle {
            id,
            topic: topic.to_string(),
        })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        if self.remove_route(&handle.topic, handle.id) {
            self.link
                .client
                .unsubscribe(handle.topic.as_str())
                .await
                .map_err(|e| RelayError::Subscription(e.to_string()))?;
            info!("Unsubscribed from MQTT topic '{}'", handle.topic);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link.connected.load(Ordering::Acquire)
    }
}

impl Link {
    fn new(client: AsyncClient, connected: bool) -> Self {
        Self {
            client,
            routes: Arc::new(Mutex::new(HashMap::new())),
            connected: Arc::new(AtomicBool::new(connected)),
        }
    }

    fn on_event(&self, event: Event) {
        match event {
            Event::Incoming(Incoming::ConnAck(_)) => {
                self.connected.store(true, Ordering::Release);
                let resubscribed = self.resubscribe();
                info!(
                    "Reconnected to MQTT broker, re-subscribed to {} topic(s)",
                    resubscribed
                );
            }
            Event::Incoming(Incoming::Publish(publish)) => {
                let payload = String::from_utf8_lossy(&publish.payload);
                self.route(&publish.topic, &payload);
            }
            _ => {}
        }
    }

    fn on_error(&self, e: &ConnectionError) {
        if self.connected.swap(false, Ordering::AcqRel) {
            error!("MQTT broker connection lost: {}", e);
        } else {
            debug!("MQTT reconnect attempt failed: {}", e);
        }
    }

    /// Copy a message to every sink registered for `topic`, dropping sinks whose
    /// receiver is gone. Returns how many sinks received it.
    fn route(&self, topic: &str, payload: &str) -> usize {
        let mut routes = self.routes.lock();
        let Some(sinks) = routes.get_mut(topic) else {
            debug!("Dropping message on unrouted topic '{}'", topic);
            return 0;
        };

        sinks.retain(|_, sink| {
            sink.send(BrokerMessage {
                topic: topic.to_string(),
                payload: payload.to_string(),
            })
            .is_ok()
        });
        sinks.len()
    }

    // Runs on the event loop task, so requests must not wait on the loop itself.
    fn resubscribe(&self) -> usize {
        let topics: Vec<String> = self.routes.lock().keys().cloned().collect();
        for topic in &topics {
            if let Err(e) = self.client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                warn!("Failed to re-subscribe to '{}': {}", topic, e);
            }
        }
        topics.len()
    }
}

struct EventLoopDriver {
    eventloop: EventLoop,
    link: Link,
    reconnect_delay: Duration,
}

impl EventLoopDriver {
    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Stopping MQTT event loop");
                    let _ = self.link.client.try_disconnect();
                    break;
                }
                event = self.eventloop.poll() => match event {
                    Ok(event) => self.link.on_event(event),
                    Err(e) => {
                        self.link.on_error(&e);
                        tokio::time::sleep(self.reconnect_delay).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, ConnectReturnCode, Publish, Request};
    use tokio::sync::mpsc;

    /// A link whose client is never driven; queued requests stay in the event loop.
    fn offline_link() -> (Link, EventLoop) {
        let (client, eventloop) = AsyncClient::new(mqtt_options(&BrokerConfig::default()), 10);
        (Link::new(client, false), eventloop)
    }

    fn queued_requests(eventloop: &mut EventLoop) -> Vec<Request> {
        eventloop.clean();
        eventloop.pending.drain(..).collect()
    }

    fn subscribed_topics(requests: &[Request]) -> Vec<String> {
        let mut topics: Vec<String> = requests
            .iter()
            .filter_map(|request| match request {
                Request::Subscribe(subscribe) => Some(subscribe.filters.clone()),
                _ => None,
            })
            .flatten()
            .map(|filter| filter.path)
            .collect();
        topics.sort();
        topics
    }

    fn connack() -> Event {
        Event::Incoming(Incoming::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        )))
    }

    #[test]
    fn test_check_topic() {
        assert!(check_topic("news").is_ok());
        assert!(check_topic("home/kitchen/temp").is_ok());
        assert!(check_topic("").is_err());
        assert!(check_topic("home/+/temp").is_err());
        assert!(check_topic("home/#").is_err());
    }

    #[test]
    fn test_client_ids_are_unique_per_instance() {
        let config = BrokerConfig::default();
        let first = mqtt_options(&config);
        let second = mqtt_options(&config);

        assert!(first.client_id().starts_with("ws-relay-"));
        assert_ne!(first.client_id(), second.client_id());
        assert_eq!(
            first.broker_address(),
            ("localhost".to_string(), 1883)
        );
    }

    #[tokio::test]
    async fn test_incoming_publish_reaches_topic_sinks() {
        let (link, _eventloop) = offline_link();
        let (news_a, mut rx_a) = mpsc::unbounded_channel();
        let (news_b, rx_b) = mpsc::unbounded_channel();
        let (sport, mut rx_sport) = mpsc::unbounded_channel();
        {
            let mut routes = link.routes.lock();
            routes.entry("news".to_string()).or_default().insert(1, news_a);
            routes.entry("news".to_string()).or_default().insert(2, news_b);
            routes.entry("sport".to_string()).or_default().insert(3, sport);
        }

        let publish = Publish::new("news", QoS::AtLeastOnce, "hello");
        link.on_event(Event::Incoming(Incoming::Publish(publish)));

        let expected = BrokerMessage {
            topic: "news".to_string(),
            payload: "hello".to_string(),
        };
        assert_eq!(rx_a.try_recv().unwrap(), expected);
        assert!(rx_sport.try_recv().is_err());

        drop(rx_b);
        assert_eq!(link.route("news", "again"), 1);
        assert_eq!(link.routes.lock()["news"].len(), 1);
        assert_eq!(link.route("weather", "sunny"), 0);
    }

    #[tokio::test]
    async fn test_reconnect_resubscribes_open_topics() {
        let (link, mut eventloop) = offline_link();
        for (id, topic) in ["news", "sport"].into_iter().enumerate() {
            let (sink, _rx) = mpsc::unbounded_channel();
            link.routes
                .lock()
                .entry(topic.to_string())
                .or_default()
                .insert(id as u64, sink);
        }

        link.on_event(connack());

        assert!(link.connected.load(Ordering::Acquire));
        let requests = queued_requests(&mut eventloop);
        assert_eq!(subscribed_topics(&requests), vec!["news", "sport"]);
    }

    #[tokio::test]
    async fn test_publish_fails_while_disconnected() {
        let (link, mut eventloop) = offline_link();
        link.connected.store(true, Ordering::Release);
        let broker = MqttBroker::with_link(link.clone());

        link.on_error(&ConnectionError::NetworkTimeout);
        assert!(!broker.is_connected());
        assert!(matches!(
            broker.publish("news", "hello").await,
            Err(RelayError::MessagePublish(_))
        ));
        assert!(queued_requests(&mut eventloop).is_empty());

        link.on_event(connack());
        assert!(broker.is_connected());
        broker.publish("news", "hello").await.unwrap();

        let requests = queued_requests(&mut eventloop);
        assert!(matches!(
            requests.as_slice(),
            [Request::Publish(publish)] if publish.topic == "news"
        ));
    }

    #[tokio::test]
    async fn test_one_mqtt_subscription_per_topic() {
        let (link, mut eventloop) = offline_link();
        let broker = MqttBroker::with_link(link);
        let (sink, _rx) = mpsc::unbounded_channel();

        let first = broker.subscribe("news", sink.clone()).await.unwrap();
        let second = broker.subscribe("news", sink).await.unwrap();
        assert_eq!(
            subscribed_topics(&queued_requests(&mut eventloop)),
            vec!["news"]
        );

        broker.unsubscribe(first).await.unwrap();
        assert!(queued_requests(&mut eventloop).is_empty());

        broker.unsubscribe(second).await.unwrap();
        let requests = queued_requests(&mut eventloop);
        assert!(matches!(
            requests.as_slice(),
            [Request::Unsubscribe(unsubscribe)] if unsubscribe.topics == ["news"]
        ));
    }

    #[tokio::test]
    async fn test_wildcard_subscribe_is_refused() {
        let (link, mut eventloop) = offline_link();
        let broker = MqttBroker::with_link(link);
        let (sink, _rx) = mpsc::unbounded_channel();

        assert!(matches!(
            broker.subscribe("home/#", sink).await,
            Err(RelayError::Subscription(_))
        ));
        assert!(queued_requests(&mut eventloop).is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_connection_failure() {
        let config = BrokerConfig {
            address: "127.0.0.1".to_string(),
            port: 1,
            connect_timeout_secs: 2,
            ..BrokerConfig::default()
        };

        match MqttBroker::connect(&config, CancellationToken::new()).await {
            Err(RelayError::ConnectionFail(_)) => {}
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("connected to a closed port"),
        }
    }
}
