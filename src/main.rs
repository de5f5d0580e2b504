use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};
use ws_relay::{config::Config, relay::Relay};

#[tokio::main]
async fn main() -> Result<()> {
    let json = std::env::var("RELAY_LOG_FORMAT").is_ok_and(|format| format == "json");
    let fmt_layer = if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ws_relay=info,rumqttc=warn,tower_http=info".into()),
        )
        .with(fmt_layer)
        .init();

    tracing::info!("Starting WebSocket relay");

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded: {:?}", config);

    let relay = Relay::new(config).await?;
    relay.run().await?;

    Ok(())
}
