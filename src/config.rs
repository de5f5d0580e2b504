use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const ENV_CONFIG_PATH: &str = "RELAY_CONFIG";
const ENV_PREFIX: &str = "RELAY";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_address: String,
    pub port: u16,
    /// Path the WebSocket upgrade is served on
    pub ws_path: String,
    /// Connections silent for this long are closed
    pub idle_timeout_secs: u64,
    pub ping_interval_secs: u64,
    /// Reply `{"status": ...}` after a successful subscribe
    pub ack_subscriptions: bool,
    pub session_policy: SessionPolicy,
    /// Frames queued per connection before a client that stopped reading is dropped
    pub outbound_buffer: usize,
}

/// What happens to the previous connection when a user authenticates on a new one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPolicy {
    /// Replace the registry mapping and leave the old connection open
    #[default]
    Replace,
    /// Replace the mapping and close the old connection
    ClosePrevious,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerBackend {
    #[default]
    Mqtt,
    /// Process-local broker, no cross-instance fan-out
    Memory,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub backend: BrokerBackend,
    /// Address of the MQTT broker to connect to
    pub address: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub connect_timeout_secs: u64,
    /// Upper bound for a single publish/subscribe call
    pub request_timeout_ms: u64,
    pub reconnect_delay_secs: u64,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC secret used to verify bearer tokens
    pub secret: String,
    pub issuer: Option<String>,
    pub leeway_secs: u64,
    pub require_exp: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            port: 8080,
            ws_path: "/".to_string(),
            idle_timeout_secs: 300,
            ping_interval_secs: 30,
            ack_subscriptions: true,
            session_policy: SessionPolicy::Replace,
            outbound_buffer: 1024,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::Mqtt,
            address: "localhost".to_string(),
            port: 1883,
            client_id: "ws-relay".to_string(),
            username: None,
            password: None,
            use_tls: false,
            connect_timeout_secs: 5,
            request_timeout_ms: 5000,
            reconnect_delay_secs: 5,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            issuer: None,
            leeway_secs: 0,
            require_exp: false,
        }
    }
}

// Secrets stay out of the startup log line.
impl std::fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("backend", &self.backend)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("use_tls", &self.use_tls)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("reconnect_delay_secs", &self.reconnect_delay_secs)
            .finish()
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("secret", &"***")
            .field("issuer", &self.issuer)
            .field("leeway_secs", &self.leeway_secs)
            .field("require_exp", &self.require_exp)
            .finish()
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.listen_address, self.port)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

impl BrokerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

impl Config {
    /// Layer the optional config file named by `RELAY_CONFIG` with `RELAY_*` env vars,
    /// e.g. `RELAY_AUTH__SECRET` or `RELAY_SERVER__PORT`.
    pub fn from_env() -> Result<Self> {
        let config_path = std::env::var(ENV_CONFIG_PATH)
            .unwrap_or_else(|_| "./config/relay.toml".to_string());
        Self::load(&config_path, None)
    }

    /// `env` replaces the process environment when given.
    fn load(config_path: &str, env: Option<config::Map<String, String>>) -> Result<Self> {
        let layered = config::Config::builder()
            .add_source(
                config::File::with_name(config_path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .with_context(|| format!("Failed to load configuration from {}", config_path))?;

        let config: Config = layered
            .try_deserialize()
            .context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config =
            toml::from_str(&contents).with_context(|| "Failed to parse TOML configuration")?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.auth.secret.is_empty() {
            bail!("auth.secret must be set (RELAY_AUTH__SECRET)");
        }
        if self.server.idle_timeout_secs == 0 || self.server.ping_interval_secs == 0 {
            bail!("server timeouts must be greater than zero");
        }
        if self.server.outbound_buffer == 0 {
            bail!("server.outbound_buffer must be greater than zero");
        }
        if self.broker.connect_timeout_secs == 0 || self.broker.request_timeout_ms == 0 {
            bail!("broker timeouts must be greater than zero");
        }
        if !self.server.ws_path.starts_with('/') {
            bail!("server.ws_path must start with '/'");
        }
        if matches!(self.server.ws_path.as_str(), "/health" | "/metrics") {
            bail!("server.ws_path conflicts with {}", self.server.ws_path);
        }
        Ok(())
    }
}
