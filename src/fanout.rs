//! Topic fan-out table.
//!
//! Maps each topic to the connections subscribed to it and holds at most one broker
//! subscription per topic, however many connections want it. All table state lives in
//! a single task: membership changes arrive as commands, broker deliveries arrive on the
//! subscription sink, and both are processed one at a time by that task.
//!
//! Broker calls run on their own tasks. A topic whose broker subscription is being
//! opened or closed stays in the table in a transitional phase; subscribers that join it
//! meanwhile are answered once the broker call reports back.

use crate::broker::{Broker, BrokerMessage, DeliverySink, SubscriptionHandle};
use crate::connection::{Connection, ConnectionId};
use crate::error::{RelayError, Result};
use crate::metrics::Metrics;
use crate::protocol::ServerFrame;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Added,
    AlreadySubscribed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutStats {
    /// Topics with at least one subscriber, equal to open broker subscriptions.
    pub topics: usize,
    /// (topic, connection) pairs.
    pub subscriptions: usize,
    /// Connections subscribed to at least one topic.
    pub connections: usize,
}

enum Command {
    Subscribe {
        topic: String,
        connection: Arc<Connection>,
        reply: oneshot::Sender<Result<SubscribeOutcome>>,
    },
    Unsubscribe {
        topic: String,
        connection: ConnectionId,
        reply: oneshot::Sender<bool>,
    },
    UnsubscribeAll {
        connection: ConnectionId,
        reply: oneshot::Sender<usize>,
    },
    Deliver {
        message: BrokerMessage,
        reply: oneshot::Sender<usize>,
    },
    Stats {
        reply: oneshot::Sender<FanoutStats>,
    },
}

/// Cloneable handle to the fan-out task. The task stops once every handle is dropped,
/// closing its remaining broker subscriptions.
#[derive(Clone)]
pub struct TopicFanout {
    commands: mpsc::UnboundedSender<Command>,
}

impl TopicFanout {
    pub fn spawn(
        broker: Arc<dyn Broker>,
        request_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (sink, deliveries) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        let table = FanoutTable {
            broker,
            sink,
            request_timeout,
            metrics,
            completions: completions_tx,
            in_flight: 0,
            topics: HashMap::new(),
            memberships: HashMap::new(),
        };
        tokio::spawn(table.run(commands_rx, deliveries, completions_rx));

        Self {
            commands: commands_tx,
        }
    }

    /// Add `connection` to `topic`, opening the broker subscription if it is the
    /// topic's first subscriber. Re-subscribing is a no-op.
    pub async fn subscribe(
        &self,
        topic: &str,
        connection: &Arc<Connection>,
    ) -> Result<SubscribeOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Subscribe {
            topic: topic.to_string(),
            connection: Arc::clone(connection),
            reply,
        });
        rx.await
            .unwrap_or_else(|_| Err(RelayError::Subscription("fan-out table stopped".to_string())))
    }

    /// Remove `connection` from `topic`; returns whether it was subscribed. Resolves
    /// after the broker subscription is released if this was the last subscriber.
    pub async fn unsubscribe(&self, topic: &str, connection: ConnectionId) -> bool {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Unsubscribe {
            topic: topic.to_string(),
            connection,
            reply,
        });
        rx.await.unwrap_or(false)
    }

    /// Remove `connection` from every topic; returns how many it left.
    pub async fn unsubscribe_all(&self, connection: ConnectionId) -> usize {
        let (reply, rx) = oneshot::channel();
        self.send(Command::UnsubscribeAll { connection, reply });
        rx.await.unwrap_or(0)
    }

    /// Fan a message out to the topic's open subscribers; returns how many received it.
    pub async fn deliver(&self, topic: &str, payload: &str) -> usize {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Deliver {
            message: BrokerMessage {
                topic: topic.to_string(),
                payload: payload.to_string(),
            },
            reply,
        });
        rx.await.unwrap_or(0)
    }

    pub async fn stats(&self) -> FanoutStats {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats { reply });
        rx.await.unwrap_or_default()
    }

    fn send(&self, command: Command) {
        // A stopped table drops the reply sender, which the caller observes.
        let _ = self.commands.send(command);
    }
}

type SubscribeReply = oneshot::Sender<Result<SubscribeOutcome>>;

enum Phase {
    /// Broker subscribe in flight.
    Opening,
    Open(SubscriptionHandle),
    /// Broker unsubscribe in flight. Subscribers that join meanwhile reopen the topic.
    Closing,
}

struct TopicEntry {
    phase: Phase,
    subscribers: HashMap<ConnectionId, Arc<Connection>>,
    /// Subscribe calls waiting for the topic to open.
    waiters: Vec<(SubscribeReply, SubscribeOutcome)>,
}

/// Result of a broker call made outside the table task.
enum Completion {
    Opened {
        topic: String,
        result: Result<SubscriptionHandle>,
    },
    Closed {
        topic: String,
    },
}

struct FanoutTable {
    broker: Arc<dyn Broker>,
    sink: DeliverySink,
    request_timeout: Duration,
    metrics: Arc<Metrics>,
    completions: mpsc::UnboundedSender<Completion>,
    /// Completions still to arrive.
    in_flight: usize,
    topics: HashMap<String, TopicEntry>,
    memberships: HashMap<ConnectionId, HashSet<String>>,
}

impl FanoutTable {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut deliveries: mpsc::UnboundedReceiver<BrokerMessage>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        loop {
            tokio::select! {
                // Pending deliveries go first so a message is fanned out against the
                // membership that existed when the broker handed it over.
                biased;

                Some(message) = deliveries.recv() => {
                    self.deliver(&message);
                }
                Some(completion) = completions.recv() => {
                    self.complete(completion);
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
            }
        }

        self.shutdown(completions).await;
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Subscribe {
                topic,
                connection,
                reply,
            } => self.subscribe(topic, connection, reply),
            Command::Unsubscribe {
                topic,
                connection,
                reply,
            } => self.unsubscribe(&topic, connection, reply),
            Command::UnsubscribeAll { connection, reply } => {
                self.unsubscribe_all(connection, reply)
            }
            Command::Deliver { message, reply } => {
                let _ = reply.send(self.deliver(&message));
            }
            Command::Stats { reply } => {
                let _ = reply.send(FanoutStats {
                    topics: self
                        .topics
                        .values()
                        .filter(|e| matches!(e.phase, Phase::Open(_)))
                        .count(),
                    subscriptions: self.topics.values().map(|e| e.subscribers.len()).sum(),
                    connections: self.memberships.len(),
                });
            }
        }
    }

    fn subscribe(&mut self, topic: String, connection: Arc<Connection>, reply: SubscribeReply) {
        let id = connection.id();

        match self.topics.get_mut(&topic) {
            Some(entry) => {
                let outcome = if entry.subscribers.contains_key(&id) {
                    SubscribeOutcome::AlreadySubscribed
                } else {
                    entry.subscribers.insert(id, connection);
                    SubscribeOutcome::Added
                };
                match entry.phase {
                    Phase::Open(_) => {
                        let _ = reply.send(Ok(outcome));
                    }
                    Phase::Opening | Phase::Closing => entry.waiters.push((reply, outcome)),
                }
            }
            None => {
                let mut subscribers = HashMap::new();
                subscribers.insert(id, connection);
                self.topics.insert(
                    topic.clone(),
                    TopicEntry {
                        phase: Phase::Opening,
                        subscribers,
                        waiters: vec![(reply, SubscribeOutcome::Added)],
                    },
                );
                self.open(topic.clone());
            }
        }

        self.memberships.entry(id).or_default().insert(topic);
    }

    fn unsubscribe(&mut self, topic: &str, connection: ConnectionId, reply: oneshot::Sender<bool>) {
        let removed = self
            .topics
            .get_mut(topic)
            .is_some_and(|entry| entry.subscribers.remove(&connection).is_some());
        if !removed {
            let _ = reply.send(false);
            return;
        }
        self.leave(connection, topic);

        match self.begin_close(topic) {
            Some(closing) => self.close(vec![closing], move || {
                let _ = reply.send(true);
            }),
            None => {
                let _ = reply.send(true);
            }
        }
    }

    fn unsubscribe_all(&mut self, connection: ConnectionId, reply: oneshot::Sender<usize>) {
        let Some(topics) = self.memberships.remove(&connection) else {
            let _ = reply.send(0);
            return;
        };

        let count = topics.len();
        let mut closing = Vec::new();
        for topic in topics {
            if let Some(entry) = self.topics.get_mut(&topic) {
                entry.subscribers.remove(&connection);
            }
            closing.extend(self.begin_close(&topic));
        }
        debug!("Connection {} left {} topic(s)", connection, count);

        if closing.is_empty() {
            let _ = reply.send(count);
        } else {
            self.close(closing, move || {
                let _ = reply.send(count);
            });
        }
    }

    fn leave(&mut self, connection: ConnectionId, topic: &str) {
        if let Some(topics) = self.memberships.get_mut(&connection) {
            topics.remove(topic);
            if topics.is_empty() {
                self.memberships.remove(&connection);
            }
        }
    }

    /// Start a broker subscribe for `topic` on a separate task.
    fn open(&mut self, topic: String) {
        let broker = Arc::clone(&self.broker);
        let sink = self.sink.clone();
        let completions = self.completions.clone();
        let timeout = self.request_timeout;
        self.in_flight += 1;

        tokio::spawn(async move {
            let subscribe = broker.subscribe(&topic, sink);
            let result = match tokio::time::timeout(timeout, subscribe).await {
                Ok(result) => result,
                Err(_) => Err(RelayError::Subscription(format!(
                    "broker subscribe for '{}' timed out after {:?}",
                    topic, timeout
                ))),
            };
            let _ = completions.send(Completion::Opened { topic, result });
        });
    }

    /// Move an open topic without subscribers to `Closing`, handing back its broker
    /// subscription.
    fn begin_close(&mut self, topic: &str) -> Option<(String, SubscriptionHandle)> {
        let entry = self.topics.get_mut(topic)?;
        if !entry.subscribers.is_empty() || !matches!(entry.phase, Phase::Open(_)) {
            return None;
        }
        let Phase::Open(handle) = std::mem::replace(&mut entry.phase, Phase::Closing) else {
            return None;
        };
        self.metrics.broker_subscriptions.dec();
        Some((topic.to_string(), handle))
    }

    /// Release broker subscriptions on a separate task, then run `done`.
    fn close(
        &mut self,
        closing: Vec<(String, SubscriptionHandle)>,
        done: impl FnOnce() + Send + 'static,
    ) {
        let broker = Arc::clone(&self.broker);
        let completions = self.completions.clone();
        let timeout = self.request_timeout;
        self.in_flight += closing.len();

        tokio::spawn(async move {
            for (topic, handle) in closing {
                release(broker.as_ref(), &topic, handle, timeout).await;
                let _ = completions.send(Completion::Closed { topic });
            }
            done();
        });
    }

    fn complete(&mut self, completion: Completion) {
        self.in_flight = self.in_flight.saturating_sub(1);
        match completion {
            Completion::Opened { topic, result } => self.opened(topic, result),
            Completion::Closed { topic } => self.closed(topic),
        }
    }

    fn opened(&mut self, topic: String, result: Result<SubscriptionHandle>) {
        let Some(entry) = self.topics.get_mut(&topic) else {
            if let Ok(handle) = result {
                self.close(vec![(topic, handle)], || {});
            }
            return;
        };

        match result {
            Ok(handle) => {
                info!("Opened broker subscription for topic '{}'", topic);
                self.metrics.broker_subscriptions.inc();
                entry.phase = Phase::Open(handle);
                for (reply, outcome) in entry.waiters.drain(..) {
                    let _ = reply.send(Ok(outcome));
                }
                // Everyone may have left while the subscribe was in flight.
                if let Some(closing) = self.begin_close(&topic) {
                    self.close(vec![closing], || {});
                }
            }
            Err(e) => {
                warn!("Broker subscription for topic '{}' failed: {}", topic, e);
                let waiters = std::mem::take(&mut entry.waiters);
                let members: Vec<ConnectionId> = entry.subscribers.keys().copied().collect();
                self.topics.remove(&topic);

                for id in members {
                    self.leave(id, &topic);
                }
                for (reply, _) in waiters {
                    let _ = reply.send(Err(e.clone()));
                }
            }
        }
    }

    fn closed(&mut self, topic: String) {
        let Some(entry) = self.topics.get_mut(&topic) else {
            return;
        };
        if !matches!(entry.phase, Phase::Closing) {
            return;
        }

        if entry.subscribers.is_empty() {
            if let Some(entry) = self.topics.remove(&topic) {
                for (reply, outcome) in entry.waiters {
                    let _ = reply.send(Ok(outcome));
                }
            }
        } else {
            debug!("Reopening broker subscription for topic '{}'", topic);
            entry.phase = Phase::Opening;
            self.open(topic);
        }
    }

    fn deliver(&self, message: &BrokerMessage) -> usize {
        let Some(entry) = self.topics.get(&message.topic) else {
            debug!("No subscribers for topic '{}'", message.topic);
            return 0;
        };

        let frame = ServerFrame::delivery(&message.topic, &message.payload);
        let mut delivered = 0;

        for connection in entry.subscribers.values() {
            // Closed sockets are skipped; their own close path cleans them up.
            if !connection.is_open() {
                continue;
            }
            match connection.send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!("Skipping delivery on '{}': {}", message.topic, e),
            }
        }

        self.metrics.messages_delivered.inc_by(delivered as u64);
        debug!(
            "Delivered message on '{}' to {} connection(s)",
            message.topic, delivered
        );
        delivered
    }

    async fn shutdown(mut self, mut completions: mpsc::UnboundedReceiver<Completion>) {
        let open: Vec<(String, SubscriptionHandle)> = self
            .topics
            .drain()
            .filter_map(|(topic, entry)| match entry.phase {
                Phase::Open(handle) => Some((topic, handle)),
                Phase::Opening | Phase::Closing => None,
            })
            .collect();
        for (topic, handle) in open {
            self.metrics.broker_subscriptions.dec();
            release(self.broker.as_ref(), &topic, handle, self.request_timeout).await;
        }

        // Subscriptions still being opened are released as they arrive.
        while self.in_flight > 0 {
            let Some(completion) = completions.recv().await else {
                break;
            };
            self.in_flight -= 1;
            if let Completion::Opened {
                topic,
                result: Ok(handle),
            } = completion
            {
                release(self.broker.as_ref(), &topic, handle, self.request_timeout).await;
            }
        }
        debug!("Fan-out table stopped");
    }
}

async fn release(broker: &dyn Broker, topic: &str, handle: SubscriptionHandle, timeout: Duration) {
    match tokio::time::timeout(timeout, broker.unsubscribe(handle)).await {
        Ok(Ok(())) => info!("Closed broker subscription for topic '{}'", topic),
        Ok(Err(e)) => warn!("Failed to close broker subscription for '{}': {}", topic, e),
        Err(_) => warn!("Closing broker subscription for '{}' timed out", topic),
    }
}
