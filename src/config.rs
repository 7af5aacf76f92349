//! Layered application configuration.
//!
//! Precedence, lowest first: built-in defaults, `./config.yaml` (or the file
//! named by `--config`), `RELAY_`-prefixed environment variables
//! (`RELAY_SERVER__PORT=9000`), then command-line flags.

use std::env;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use crate::broker::BrokerSettings;
use crate::error::RelayError;
use crate::llm::{DEFAULT_MAX_TOKENS, LlmSettings, Provider};
use crate::session::{DEFAULT_SYSTEM_PROMPT, EvictionPolicy};

/// Environment variables consulted for the API key when none is configured.
pub const API_KEY_FALLBACKS: [&str; 2] = ["OPENROUTER_API_KEY", "LLM_API_KEY"];

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "RELAY_CONFIG_FILE")]
    pub config: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Where assistant replies come from
    #[arg(long, value_enum)]
    pub mode: Option<RelayMode>,
}

/// Reply backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Stream from the upstream chat completions API.
    Upstream,
    /// Publish turns to the broker and relay reply records.
    Broker,
}

impl RelayMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Upstream => "upstream",
            Self::Broker => "broker",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub relay: RelayConfig,
    pub llm: LlmConfig,
    pub broker: BrokerConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    pub mode: RelayMode,
}

#[derive(Deserialize, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub max_tokens: u32,
    /// Azure deployment name; required when `base_url` points at Azure.
    #[serde(default)]
    pub azure_deployment: Option<String>,
    #[serde(default)]
    pub azure_api_version: Option<String>,
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("max_tokens", &self.max_tokens)
            .field("azure_deployment", &self.azure_deployment)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    pub bootstrap_servers: String,
    pub user_topic: String,
    pub reply_topic: String,
    pub consumer_group: String,
    /// Seconds to wait between reply records; 0 waits forever.
    pub idle_timeout_secs: u64,
    /// Run a completion worker in-process against the upstream API.
    pub embedded_worker: bool,
}

/// Eviction policy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionKind {
    None,
    Ttl,
    Capacity,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    pub system_prompt: String,
    pub eviction: EvictionKind,
    pub ttl_secs: u64,
    pub capacity: usize,
    pub sweep_interval_secs: u64,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(env::args())
    }

    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        let defaults = BrokerSettings::default();
        let mut builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8000)?
            .set_default("relay.mode", RelayMode::Upstream.as_str())?
            .set_default("llm.base_url", "https://openrouter.ai/api")?
            .set_default("llm.model", "gpt-4o")?
            .set_default("llm.max_tokens", i64::from(DEFAULT_MAX_TOKENS))?
            .set_default("broker.bootstrap_servers", defaults.bootstrap_servers)?
            .set_default("broker.user_topic", defaults.user_topic)?
            .set_default("broker.reply_topic", defaults.reply_topic)?
            .set_default("broker.consumer_group", defaults.consumer_group)?
            .set_default("broker.idle_timeout_secs", 0)?
            .set_default("broker.embedded_worker", true)?
            .set_default("session.system_prompt", DEFAULT_SYSTEM_PROMPT)?
            .set_default("session.eviction", "none")?
            .set_default("session.ttl_secs", 3600)?
            .set_default("session.capacity", 10_000)?
            .set_default("session.sweep_interval_secs", 60)?;

        builder = match &cli.config {
            Some(path) => builder.add_source(File::with_name(path)),
            None => builder.add_source(File::new("config.yaml", FileFormat::Yaml).required(false)),
        };

        builder = builder.add_source(
            Environment::with_prefix("RELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", i64::from(port))?;
        }
        if let Some(mode) = cli.mode {
            builder = builder.set_override("relay.mode", mode.as_str())?;
        }

        let mut cfg: Self = builder.build()?.try_deserialize()?;
        if cfg.llm.api_key.as_deref().is_none_or(|k| k.trim().is_empty()) {
            cfg.llm.api_key = API_KEY_FALLBACKS
                .iter()
                .find_map(|name| env::var(name).ok().filter(|k| !k.trim().is_empty()));
        }

        cfg.validate()
            .map_err(|e| config::ConfigError::Message(e.to_string()))?;
        Ok(cfg)
    }

    /// Reject settings that cannot work.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.llm.base_url.trim().is_empty() {
            return Err(RelayError::Config("llm.base_url cannot be empty".to_string()));
        }
        if self.llm.model.trim().is_empty() {
            return Err(RelayError::Config("llm.model cannot be empty".to_string()));
        }
        if self.llm.max_tokens == 0 {
            return Err(RelayError::Config("llm.max_tokens must be positive".to_string()));
        }
        let missing_deployment = matches!(
            self.llm_settings().provider,
            Provider::AzureOpenAI { deployment_name, .. } if deployment_name.is_empty()
        );
        if missing_deployment {
            return Err(RelayError::Config(
                "llm.azure_deployment is required for Azure endpoints".to_string(),
            ));
        }
        self.eviction_policy()?;
        if self.session.eviction == EvictionKind::Ttl && self.session.sweep_interval_secs == 0 {
            return Err(RelayError::Config(
                "session.sweep_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Upstream client settings.
    #[must_use]
    pub fn llm_settings(&self) -> LlmSettings {
        let mut provider = Provider::detect_from_url(&self.llm.base_url);
        if let Provider::AzureOpenAI {
            deployment_name,
            api_version,
        } = &mut provider
        {
            if let Some(deployment) = &self.llm.azure_deployment {
                deployment_name.clone_from(deployment);
            }
            if let Some(version) = &self.llm.azure_api_version {
                api_version.clone_from(version);
            }
        }

        LlmSettings {
            base_url: self.llm.base_url.clone(),
            api_key: self.llm.api_key.clone(),
            model: self.llm.model.clone(),
            max_tokens: self.llm.max_tokens,
            provider,
        }
    }

    /// Broker bridge settings.
    #[must_use]
    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            bootstrap_servers: self.broker.bootstrap_servers.clone(),
            user_topic: self.broker.user_topic.clone(),
            reply_topic: self.broker.reply_topic.clone(),
            consumer_group: self.broker.consumer_group.clone(),
            idle_timeout: (self.broker.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(self.broker.idle_timeout_secs)),
        }
    }

    /// Session eviction policy.
    pub fn eviction_policy(&self) -> Result<EvictionPolicy, RelayError> {
        match self.session.eviction {
            EvictionKind::None => Ok(EvictionPolicy::None),
            EvictionKind::Ttl if self.session.ttl_secs == 0 => Err(RelayError::Config(
                "session.ttl_secs must be positive".to_string(),
            )),
            EvictionKind::Ttl => Ok(EvictionPolicy::Ttl(Duration::from_secs(
                self.session.ttl_secs,
            ))),
            EvictionKind::Capacity if self.session.capacity == 0 => Err(RelayError::Config(
                "session.capacity must be positive".to_string(),
            )),
            EvictionKind::Capacity => Ok(EvictionPolicy::Capacity(self.session.capacity)),
        }
    }

    /// Interval between TTL sweeps.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session.sweep_interval_secs)
    }
}
