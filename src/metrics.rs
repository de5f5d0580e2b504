use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

pub struct Metrics {
    registry: Registry,
    pub frames_received: IntCounter,
    pub frames_rejected: IntCounterVec,
    pub messages_published: IntCounter,
    pub messages_delivered: IntCounter,
    pub frame_latency: Histogram,
    pub active_connections: IntGauge,
    pub broker_subscriptions: IntGauge,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Arc<Self>> {
        let registry = Registry::new();

        let frames_received = IntCounter::new(
            "relay_frames_received_total",
            "Total number of frames received from clients",
        )?;
        let frames_rejected = IntCounterVec::new(
            Opts::new(
                "relay_frames_rejected_total",
                "Frames answered with an error, by error kind",
            ),
            &["kind"],
        )?;
        let messages_published = IntCounter::new(
            "relay_messages_published_total",
            "Total number of client messages published to the broker",
        )?;
        let messages_delivered = IntCounter::new(
            "relay_messages_delivered_total",
            "Total number of broker messages delivered to connections",
        )?;
        let frame_latency = Histogram::with_opts(HistogramOpts::new(
            "relay_frame_latency_seconds",
            "Frame handling latency in seconds",
        ))?;
        let active_connections = IntGauge::new(
            "relay_active_connections",
            "Number of open client connections",
        )?;
        let broker_subscriptions = IntGauge::new(
            "relay_broker_subscriptions",
            "Number of broker-level topic subscriptions",
        )?;

        registry.register(Box::new(frames_received.clone()))?;
        registry.register(Box::new(frames_rejected.clone()))?;
        registry.register(Box::new(messages_published.clone()))?;
        registry.register(Box::new(messages_delivered.clone()))?;
        registry.register(Box::new(frame_latency.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(broker_subscriptions.clone()))?;

        Ok(Arc::new(Self {
            registry,
            frames_received,
            frames_rejected,
            messages_published,
            messages_delivered,
            frame_latency,
            active_connections,
            broker_subscriptions,
        }))
    }

    /// Prometheus text exposition of every relay metric.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
