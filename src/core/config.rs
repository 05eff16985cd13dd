use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::env;
use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str = "lotusx-engine";

/// Which exchange market the engine talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Market {
    UsdM,
    CoinM,
    Spot,
}

impl std::str::FromStr for Market {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "usdm" | "usd-m" => Ok(Self::UsdM),
            "coinm" | "coin-m" => Ok(Self::CoinM),
            "spot" => Ok(Self::Spot),
            other => Err(ConfigError::InvalidConfiguration(format!(
                "unknown market '{}'",
                other
            ))),
        }
    }
}

/// Where the TLS layer takes its trust anchors from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TrustStore {
    /// Platform roots plus any certificates added on the builder.
    #[default]
    System,
    /// Only the certificates added on the builder.
    CustomOnly,
}

/// Per-phase time bounds for sessions.
///
/// Resolution and connect share one bound, TLS and the write (REST) or WebSocket
/// upgrade (streams) share another, and the REST read has its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    pub rest_connect: Duration,
    pub rest_handshake: Duration,
    pub rest_read: Duration,
    pub ws_connect: Duration,
    pub ws_handshake: Duration,
    pub ws_close: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            rest_connect: Duration::from_secs(10),
            rest_handshake: Duration::from_secs(5),
            rest_read: Duration::from_secs(30),
            ws_connect: Duration::from_secs(30),
            ws_handshake: Duration::from_secs(10),
            ws_close: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub rest_host: String,
    pub ws_host: String,
    pub rest_port: u16,
    pub ws_port: u16,
    pub api_key: Secret<String>,
    pub secret_key: Secret<String>,
    pub verify_peer: bool,
    pub trust_store: TrustStore,
    pub use_tls: bool,
    pub timeouts: SessionTimeouts,
    pub user_agent: String,
}

// Custom Serialize implementation - never expose secrets in serialization
impl Serialize for ConnectionConfig {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("ConnectionConfig", 9)?;
        state.serialize_field("rest_host", &self.rest_host)?;
        state.serialize_field("ws_host", &self.ws_host)?;
        state.serialize_field("rest_port", &self.rest_port)?;
        state.serialize_field("ws_port", &self.ws_port)?;
        state.serialize_field("api_key", "[REDACTED]")?;
        state.serialize_field("secret_key", "[REDACTED]")?;
        state.serialize_field("verify_peer", &self.verify_peer)?;
        state.serialize_field("trust_store", &self.trust_store)?;
        state.serialize_field("use_tls", &self.use_tls)?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for ConnectionConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct ConnectionConfigHelper {
            rest_host: String,
            ws_host: String,
            rest_port: u16,
            ws_port: u16,
            #[serde(default)]
            api_key: String,
            #[serde(default)]
            secret_key: String,
            verify_peer: bool,
            #[serde(default)]
            trust_store: TrustStore,
            #[serde(default = "default_use_tls")]
            use_tls: bool,
        }

        let helper = ConnectionConfigHelper::deserialize(deserializer)?;
        Ok(Self {
            rest_host: helper.rest_host,
            ws_host: helper.ws_host,
            rest_port: helper.rest_port,
            ws_port: helper.ws_port,
            api_key: Secret::new(helper.api_key),
            secret_key: Secret::new(helper.secret_key),
            verify_peer: helper.verify_peer,
            trust_store: helper.trust_store,
            use_tls: helper.use_tls,
            timeouts: SessionTimeouts::default(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        })
    }
}

const fn default_use_tls() -> bool {
    true
}

impl ConnectionConfig {
    /// Config for an arbitrary pair of hosts. TLS on, peer verified.
    #[must_use]
    pub fn new(rest_host: impl Into<String>, ws_host: impl Into<String>) -> Self {
        Self {
            rest_host: rest_host.into(),
            ws_host: ws_host.into(),
            rest_port: 443,
            ws_port: 443,
            api_key: Secret::new(String::new()),
            secret_key: Secret::new(String::new()),
            verify_peer: true,
            trust_store: TrustStore::System,
            use_tls: true,
            timeouts: SessionTimeouts::default(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    /// Production endpoints for `market`.
    #[must_use]
    pub fn live(market: Market) -> Self {
        let (rest, ws, ws_port) = match market {
            Market::UsdM => ("fapi.binance.com", "fstream.binance.com", 443),
            Market::CoinM => ("dapi.binance.com", "dstream.binance.com", 443),
            Market::Spot => ("api.binance.com", "stream.binance.com", 9443),
        };
        Self::new(rest, ws).ws_port(ws_port)
    }

    /// Testnet endpoints for `market`.
    ///
    /// The testnets do not present a verifiable chain, so peer verification is off.
    #[must_use]
    pub fn testnet(market: Market) -> Self {
        let (rest, ws) = match market {
            Market::UsdM => ("testnet.binancefuture.com", "stream.binancefuture.com"),
            Market::CoinM => ("testnet.binancefuture.com", "dstream.binancefuture.com"),
            Market::Spot => ("testnet.binance.vision", "testnet.binance.vision"),
        };
        Self::new(rest, ws).verify_peer(false)
    }

    /// Create configuration from environment variables
    ///
    /// Expected environment variables:
    /// - `{PREFIX}_API_KEY` (e.g., `BINANCE_API_KEY`)
    /// - `{PREFIX}_SECRET_KEY` (e.g., `BINANCE_SECRET_KEY`)
    /// - `{PREFIX}_TESTNET` (optional, defaults to false)
    /// - `{PREFIX}_MARKET` (optional, `usdm`, `coinm` or `spot`, defaults to `usdm`)
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        let prefix = prefix.to_uppercase();
        let api_key_var = format!("{}_API_KEY", prefix);
        let secret_key_var = format!("{}_SECRET_KEY", prefix);

        let api_key = env::var(&api_key_var)
            .map_err(|_| ConfigError::MissingEnvironmentVariable(api_key_var))?;
        let secret_key = env::var(&secret_key_var)
            .map_err(|_| ConfigError::MissingEnvironmentVariable(secret_key_var))?;

        let testnet = env::var(format!("{}_TESTNET", prefix))
            .unwrap_or_else(|_| "false".to_string())
            .parse::<bool>()
            .unwrap_or(false);

        let market = match env::var(format!("{}_MARKET", prefix)) {
            Ok(value) => value.parse()?,
            Err(_) => Market::UsdM,
        };

        let config = if testnet {
            Self::testnet(market)
        } else {
            Self::live(market)
        };
        Ok(config.credentials(api_key, secret_key))
    }

    /// Load a `.env` file (if present) and then read the environment as [`Self::from_env`].
    ///
    /// **Security Warning**: Never commit .env files to version control!
    #[cfg(feature = "env-file")]
    pub fn from_env_file(prefix: &str, env_file_path: &str) -> Result<Self, ConfigError> {
        match dotenv::from_path(env_file_path) {
            Ok(()) => {}
            Err(dotenv::Error::Io(io_err)) if io_err.kind() == std::io::ErrorKind::NotFound => {
                // no file, fall back to the process environment
            }
            Err(e) => {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "Failed to load .env file '{}': {}",
                    env_file_path, e
                )));
            }
        }

        Self::from_env(prefix)
    }

    #[must_use]
    pub fn credentials(mut self, api_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        self.api_key = Secret::new(api_key.into());
        self.secret_key = Secret::new(secret_key.into());
        self
    }

    #[must_use]
    pub const fn rest_port(mut self, port: u16) -> Self {
        self.rest_port = port;
        self
    }

    #[must_use]
    pub const fn ws_port(mut self, port: u16) -> Self {
        self.ws_port = port;
        self
    }

    #[must_use]
    pub const fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }

    #[must_use]
    pub const fn trust_store(mut self, trust_store: TrustStore) -> Self {
        self.trust_store = trust_store;
        self
    }

    /// Speak plain TCP instead of TLS. Only meant for loopback test servers.
    #[must_use]
    pub const fn use_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    #[must_use]
    pub const fn timeouts(mut self, timeouts: SessionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Check if this configuration has valid credentials for signed operations
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        !self.api_key.expose_secret().is_empty() && !self.secret_key.expose_secret().is_empty()
    }

    /// Get API key (use carefully - exposes secret)
    pub fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }

    /// Get secret key (use carefully - exposes secret)
    pub fn secret_key(&self) -> &str {
        self.secret_key.expose_secret()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvironmentVariable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}
