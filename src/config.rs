use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use channel_plugin::message::ChannelType;
use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::domain::{Bot, BotConfig, BotStatus, Channel, User};
use crate::repository::Repositories;

pub const ROOT_ENV: &str = "OMNIGATE_ROOT";
pub const DEFAULT_ROOT: &str = "./omnigate";
pub const GATEWAY_FILE: &str = "gateway.yaml";
pub const DEFAULT_WEBCHAT_ADDR: &str = "0.0.0.0:8080";

pub const PLUGIN_DIR_ENV: &str = "OMNIGATE_PLUGIN_DIR";
pub const WEBCHAT_ADDR_ENV: &str = "OMNIGATE_WEBCHAT_ADDR";
pub const LOG_LEVEL_ENV: &str = "OMNIGATE_LOG_LEVEL";
pub const LOG_DIR_ENV: &str = "OMNIGATE_LOG_DIR";
pub const OTEL_ENDPOINT_ENV: &str = "OMNIGATE_OTEL_ENDPOINT";
pub const RPC_TIMEOUT_ENV: &str = "OMNIGATE_RPC_TIMEOUT_MS";
pub const HANDSHAKE_TIMEOUT_ENV: &str = "OMNIGATE_HANDSHAKE_TIMEOUT_MS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },

    #[error("duplicate {kind} id `{id}`")]
    Duplicate { kind: &'static str, id: String },

    #[error("{0}")]
    Gateway(String),

    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing gateway file: {0}")]
    Yaml(#[from] serde_yaml_bw::Error),
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Resolve the omnigate root directory from the environment or use default.
pub fn resolve_root_dir() -> PathBuf {
    match env::var(ROOT_ENV) {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => PathBuf::from(DEFAULT_ROOT),
    }
}

/// Loads `<root>/.env` into the process environment. Missing files are
/// logged and ignored.
pub fn load_env(root: &Path) -> bool {
    let env_file = root.join(".env");
    if env_file.exists() && dotenvy::from_path(&env_file).is_ok() {
        info!("Loaded .env from {}", env_file.display());
        true
    } else {
        error!("could not load .env from {}", env_file.display());
        false
    }
}

/// Process level settings, read from `OMNIGATE_*` variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub root: PathBuf,
    pub gateway_file: PathBuf,
    pub plugin_dir: PathBuf,
    pub webchat_addr: SocketAddr,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
    pub otel_endpoint: Option<Url>,
    pub rpc_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl Settings {
    pub fn from_env(root: PathBuf) -> Result<Self, ConfigError> {
        Self::from_lookup(root, |key| env::var(key).ok())
    }

    pub fn from_lookup<F>(root: PathBuf, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let plugin_dir = get(PLUGIN_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| root.join("plugins"));

        let webchat_addr = get(WEBCHAT_ADDR_ENV)
            .unwrap_or_else(|| DEFAULT_WEBCHAT_ADDR.to_string())
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::invalid(WEBCHAT_ADDR_ENV, e.to_string()))?;

        let otel_endpoint = get(OTEL_ENDPOINT_ENV)
            .map(|raw| parse_endpoint(&raw))
            .transpose()?;

        let rpc_timeout = parse_millis(RPC_TIMEOUT_ENV, get(RPC_TIMEOUT_ENV))?
            .unwrap_or(channel_plugin::loader::DEFAULT_CALL_TIMEOUT);
        let handshake_timeout = parse_millis(HANDSHAKE_TIMEOUT_ENV, get(HANDSHAKE_TIMEOUT_ENV))?
            .unwrap_or(channel_plugin::loader::DEFAULT_HANDSHAKE_TIMEOUT);

        Ok(Self {
            gateway_file: root.join(GATEWAY_FILE),
            plugin_dir,
            webchat_addr,
            log_level: get(LOG_LEVEL_ENV).unwrap_or_else(|| "info".to_string()),
            log_dir: get(LOG_DIR_ENV).map(PathBuf::from),
            otel_endpoint,
            rpc_timeout,
            handshake_timeout,
            root,
        })
    }
}

fn parse_endpoint(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::invalid(OTEL_ENDPOINT_ENV, e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::invalid(
            OTEL_ENDPOINT_ENV,
            format!("unsupported scheme `{other}`"),
        )),
    }
}

fn parse_millis(key: &str, raw: Option<String>) -> Result<Option<Duration>, ConfigError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    match raw.parse::<u64>() {
        Ok(0) => Err(ConfigError::invalid(key, "must be greater than zero")),
        Ok(ms) => Ok(Some(Duration::from_millis(ms))),
        Err(e) => Err(ConfigError::invalid(key, e.to_string())),
    }
}

fn default_true() -> bool {
    true
}

/// A channel declared in the gateway file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ChannelSpec {
    pub id: String,
    pub tenant_id: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Plugin binary serving this channel. Webchat channels without one use
    /// the built-in adapter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    /// Adapter configuration, passed through untouched.
    #[serde(default)]
    pub config: HashMap<String, String>,
}

impl ChannelSpec {
    pub fn to_channel(&self) -> Channel {
        let name = if self.name.is_empty() { &self.id } else { &self.name };
        let mut channel = Channel::new(&self.id, &self.tenant_id, self.channel_type, name);
        channel.enabled = self.enabled;
        channel.config = self.config.clone();
        channel
    }

    pub fn is_builtin(&self) -> bool {
        self.plugin.is_none() && self.channel_type == ChannelType::Webchat
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct BotSpec {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    #[serde(default)]
    pub status: BotStatus,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub config: BotConfig,
}

impl BotSpec {
    pub fn to_bot(&self) -> Bot {
        Bot {
            id: self.id.clone(),
            tenant_id: self.tenant_id.clone(),
            name: self.name.clone(),
            status: self.status,
            channels: self.channels.clone(),
            config: self.config.clone(),
            created_at: Utc::now(),
        }
    }
}

/// Channels, bots and agents the gateway starts with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GatewayFile {
    #[serde(default)]
    pub channels: Vec<ChannelSpec>,
    #[serde(default)]
    pub bots: Vec<BotSpec>,
    #[serde(default)]
    pub agents: Vec<User>,
}

impl GatewayFile {
    /// Reads and validates a gateway file. A missing file is an empty gateway.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            error!("no gateway file at {}, starting without channels", path.display());
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file = Self::parse(&raw)?;
        info!(
            channels = file.channels.len(),
            bots = file.bots.len(),
            agents = file.agents.len(),
            "Loaded gateway file from {}",
            path.display()
        );
        Ok(file)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let file: Self = serde_yaml_bw::from_str(raw)?;
        file.validate()?;
        Ok(file)
    }

    pub fn schema() -> schemars::Schema {
        schemars::schema_for!(GatewayFile)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let channel_ids = unique_ids("channel", self.channels.iter().map(|c| c.id.as_str()))?;
        unique_ids("bot", self.bots.iter().map(|b| b.id.as_str()))?;
        unique_ids("agent", self.agents.iter().map(|a| a.id.as_str()))?;

        for channel in &self.channels {
            if channel.tenant_id.trim().is_empty() {
                return Err(ConfigError::Gateway(format!("channel `{}` has no tenant_id", channel.id)));
            }
            if channel.plugin.is_none() && channel.channel_type != ChannelType::Webchat {
                return Err(ConfigError::Gateway(format!(
                    "channel `{}` of type {} needs a plugin",
                    channel.id, channel.channel_type
                )));
            }
        }

        let mut claimed: HashMap<&str, &str> = HashMap::new();
        for bot in &self.bots {
            for channel_id in &bot.channels {
                if !channel_ids.contains(channel_id.as_str()) {
                    return Err(ConfigError::Gateway(format!(
                        "bot `{}` refers to unknown channel `{channel_id}`",
                        bot.id
                    )));
                }
                if let Some(other) = claimed.insert(channel_id, &bot.id) {
                    return Err(ConfigError::Gateway(format!(
                        "channel `{channel_id}` is served by both `{other}` and `{}`",
                        bot.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Stores bots and agents. Channels are saved when the gateway
    /// configures them.
    pub async fn seed(&self, repos: &Repositories) -> crate::error::Result<()> {
        for bot in &self.bots {
            repos.bots.save(bot.to_bot()).await?;
        }
        for agent in &self.agents {
            repos.users.save(agent.clone()).await?;
        }
        Ok(())
    }
}

fn unique_ids<'a>(
    kind: &'static str,
    ids: impl Iterator<Item = &'a str>,
) -> Result<HashSet<&'a str>, ConfigError> {
    let mut seen = HashSet::new();
    for id in ids {
        if id.trim().is_empty() {
            return Err(ConfigError::Gateway(format!("{kind} with an empty id")));
        }
        if !seen.insert(id) {
            return Err(ConfigError::Duplicate { kind, id: id.to_string() });
        }
    }
    Ok(seen)
}
