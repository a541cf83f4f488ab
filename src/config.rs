//! Gateway configuration module
//!
//! Loads the daemon configuration from `.env` and environment variables and
//! splits it into the immutable pieces handed to the REST coordinator and
//! the shard orchestrator.

use crate::error::GatewayError;
use crate::timer::IDENTIFY_WINDOW;
use config::{Config, Environment};
use std::time::Duration;
use twilight_model::gateway::Intents;

pub const DEFAULT_API_BASE: &str = "https://discord.com/api";
pub const DEFAULT_API_VERSION: u8 = 10;
pub const DEFAULT_GATEWAY_VERSION: u8 = 10;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_LARGE_THRESHOLD: u32 = 50;
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

/// Settings for the REST coordinator; immutable for the process lifetime
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Bot token, sent as `Authorization: Bot <token>`
    pub token: String,
    /// API root without version, e.g. `https://discord.com/api`
    pub api_base: String,
    pub api_version: u8,
    pub user_agent: String,
    /// Hard timeout per HTTP call
    pub request_timeout: Duration,
}

impl RestConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            api_version: DEFAULT_API_VERSION,
            user_agent: default_user_agent(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Settings for the shard orchestrator and each shard connection
#[derive(Debug, Clone)]
pub struct ShardConfig {
    pub token: String,
    pub gateway_version: u8,
    pub intents: Intents,
    /// Request zlib-stream transport compression
    pub compress: bool,
    pub large_threshold: u32,
    /// Overrides the recommended shard count from discovery
    pub total_shards: Option<u32>,
    /// Identify rate window per concurrency allowance
    pub identify_window: Duration,
    /// Capacity of the dispatch and lifecycle broadcast channels
    pub event_buffer: usize,
}

impl ShardConfig {
    pub fn new(token: impl Into<String>, intents: Intents) -> Self {
        Self {
            token: token.into(),
            gateway_version: DEFAULT_GATEWAY_VERSION,
            intents,
            compress: true,
            large_threshold: DEFAULT_LARGE_THRESHOLD,
            total_shards: None,
            identify_window: IDENTIFY_WINDOW,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Discord bot token
    pub discord_token: String,

    pub api_base: String,
    pub api_version: u8,
    pub gateway_version: u8,
    pub user_agent: String,
    pub request_timeout: Duration,

    /// Explicit shard count (skips the recommended count from discovery)
    pub total_shards: Option<u32>,

    /// Explicit shard ids to run in this process
    pub shard_ids: Option<Vec<u32>>,

    pub intents: Intents,
    pub compress: bool,
    pub large_threshold: u32,

    /// NATS server URL(s) - comma-separated for multiple servers
    pub nats_url: Option<String>,

    /// Health/metrics HTTP port
    pub http_port: u16,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl GatewayConfig {
    /// Load configuration from `.env` and environment variables
    pub fn from_env() -> Result<Self, GatewayError> {
        dotenvy::dotenv().ok();

        let settings = Config::builder()
            .set_default("api_base", DEFAULT_API_BASE)
            .and_then(|b| b.set_default("api_version", DEFAULT_API_VERSION as i64))
            .and_then(|b| b.set_default("gateway_version", DEFAULT_GATEWAY_VERSION as i64))
            .and_then(|b| b.set_default("user_agent", default_user_agent()))
            .and_then(|b| b.set_default("request_timeout_ms", DEFAULT_REQUEST_TIMEOUT.as_millis() as i64))
            .and_then(|b| b.set_default("gateway_compress", true))
            .and_then(|b| b.set_default("large_threshold", DEFAULT_LARGE_THRESHOLD as i64))
            .and_then(|b| b.set_default("http_port", 9090_i64))
            .and_then(|b| b.set_default("log_level", "info"))
            .map_err(config_error)?
            .add_source(Environment::default().try_parsing(true))
            .build()
            .map_err(config_error)?;

        Self::from_settings(&settings)
    }

    fn from_settings(settings: &Config) -> Result<Self, GatewayError> {
        let discord_token = settings
            .get_string("discord_token")
            .or_else(|_| settings.get_string("discord_bot_token"))
            .map_err(|_| {
                GatewayError::Config("DISCORD_TOKEN or DISCORD_BOT_TOKEN must be set".to_string())
            })?;

        let total_shards = match settings.get_int("total_shards") {
            Ok(n) => Some(u32::try_from(n).map_err(|_| {
                GatewayError::Config(format!("TOTAL_SHARDS must be a valid shard count: {n}"))
            })?),
            Err(config::ConfigError::NotFound(_)) => None,
            Err(e) => return Err(config_error(e)),
        };

        let shard_ids = match settings.get_string("shard_ids") {
            Ok(raw) => Some(parse_shard_ids(&raw)?),
            Err(config::ConfigError::NotFound(_)) => None,
            Err(e) => return Err(config_error(e)),
        };

        let intents = match settings.get_int("gateway_intents") {
            Ok(bits) => Intents::from_bits_truncate(bits as u64),
            Err(config::ConfigError::NotFound(_)) => Self::intents(),
            Err(e) => return Err(config_error(e)),
        };

        let int = |key: &str| settings.get_int(key).map_err(config_error);

        Ok(Self {
            discord_token,
            api_base: settings.get_string("api_base").map_err(config_error)?,
            api_version: narrow(int("api_version")?, "API_VERSION")?,
            gateway_version: narrow(int("gateway_version")?, "GATEWAY_VERSION")?,
            user_agent: settings.get_string("user_agent").map_err(config_error)?,
            request_timeout: Duration::from_millis(narrow(int("request_timeout_ms")?, "REQUEST_TIMEOUT_MS")?),
            total_shards,
            shard_ids,
            intents,
            compress: settings.get_bool("gateway_compress").map_err(config_error)?,
            large_threshold: narrow(int("large_threshold")?, "LARGE_THRESHOLD")?,
            nats_url: settings.get_string("nats_url").ok(),
            http_port: narrow(int("http_port")?, "HTTP_PORT")?,
            log_level: settings.get_string("log_level").map_err(config_error)?,
        })
    }

    /// Default Discord intents
    ///
    /// - GUILDS: Required for guild lifecycle events
    /// - GUILD_MEMBERS: Required for member events and member chunking
    pub fn intents() -> Intents {
        Intents::GUILDS | Intents::GUILD_MEMBERS
    }

    pub fn rest_config(&self) -> RestConfig {
        RestConfig {
            token: self.discord_token.clone(),
            api_base: self.api_base.clone(),
            api_version: self.api_version,
            user_agent: self.user_agent.clone(),
            request_timeout: self.request_timeout,
        }
    }

    pub fn shard_config(&self) -> ShardConfig {
        ShardConfig {
            gateway_version: self.gateway_version,
            compress: self.compress,
            large_threshold: self.large_threshold,
            total_shards: self.total_shards,
            ..ShardConfig::new(self.discord_token.clone(), self.intents)
        }
    }
}

pub fn default_user_agent() -> String {
    format!(
        "DiscordBot (https://github.com/0xHoneyJar/arrakis, {})",
        env!("CARGO_PKG_VERSION")
    )
}

/// Parse a comma separated shard id list, e.g. `0,1,4`
pub fn parse_shard_ids(raw: &str) -> Result<Vec<u32>, GatewayError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>()
                .map_err(|e| GatewayError::Config(format!("SHARD_IDS entry '{s}' is invalid: {e}")))
        })
        .collect()
}

fn narrow<T: TryFrom<i64>>(value: i64, key: &str) -> Result<T, GatewayError> {
    T::try_from(value).map_err(|_| GatewayError::Config(format!("{key} is out of range: {value}")))
}

fn config_error(e: config::ConfigError) -> GatewayError {
    GatewayError::Config(e.to_string())
}
