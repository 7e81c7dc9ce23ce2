use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppEnv {
    Local,
    Dev,
    Test,
    Prod,
}

impl AppEnv {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Dev => "dev",
            Self::Test => "test",
            Self::Prod => "prod",
        }
    }
}

impl std::str::FromStr for AppEnv {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "dev" | "development" => Ok(Self::Dev),
            "test" => Ok(Self::Test),
            "prod" | "production" => Ok(Self::Prod),
            other => Err(ConfigError::InvalidEnv(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub app: AppSection,
    pub chain: ChainSection,
    pub escrow: EscrowSection,
    pub observability: ObservabilitySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSection {
    pub env: AppEnv,
    pub service_name: String,
    pub http_bind_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSection {
    pub node_url: String,
    pub explorer_base_url: String,
    pub network: String,
    /// Coin type tag for the emojicoin token; test networks piggyback on the
    /// APT coin here.
    pub emojicoin_type: String,
    pub confirmation_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowSection {
    pub escrow_address: String,
    /// Minimum balances (human units) for a token to be offered for betting.
    pub min_apt_balance: f64,
    pub min_emojicoin_balance: f64,
    /// How many pending records a reconciliation pass examines; 0 disables
    /// the background pass.
    pub reconcile_batch_size: u32,
    pub reconcile_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilitySection {
    pub log_filter: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid APP_ENV value: {0}")]
    InvalidEnv(String),
    #[error("unable to locate config directory (expected config/default.toml)")]
    ConfigDirNotFound,
    #[error("failed reading config file {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed parsing config file {path}: {source}")]
    ParseToml {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("ESCROW_PRIVATE_KEY is not set; refusing to start the settlement surface")]
    MissingEscrowKey,
}

/// The escrow signing key is never a config-file field; it comes from the
/// environment only and callers must treat the value as opaque.
pub fn load_escrow_private_key() -> Result<String, ConfigError> {
    match env::var("ESCROW_PRIVATE_KEY") {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingEscrowKey),
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartialAppConfig {
    app: Option<PartialAppSection>,
    chain: Option<PartialChainSection>,
    escrow: Option<PartialEscrowSection>,
    observability: Option<PartialObservabilitySection>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialAppSection {
    env: Option<AppEnv>,
    service_name: Option<String>,
    http_bind_addr: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialChainSection {
    node_url: Option<String>,
    explorer_base_url: Option<String>,
    network: Option<String>,
    emojicoin_type: Option<String>,
    confirmation_timeout_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialEscrowSection {
    escrow_address: Option<String>,
    min_apt_balance: Option<f64>,
    min_emojicoin_balance: Option<f64>,
    reconcile_batch_size: Option<u32>,
    reconcile_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialObservabilitySection {
    log_filter: Option<String>,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let app_env = env::var("APP_ENV")
            .ok()
            .map(|value| value.parse())
            .transpose()?
            .unwrap_or(AppEnv::Local);
        let config_dir = resolve_config_dir()?;
        Self::load_from_dir_for_env(config_dir, app_env)
    }

    pub fn load_from_dir_for_env(
        config_dir: impl AsRef<Path>,
        app_env: AppEnv,
    ) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let mut config = Self::default_for_env(app_env);
        merge_file(&mut config, &config_dir.join("default.toml"))?;
        let env_file = config_dir.join(format!("{}.toml", app_env.as_str()));
        if env_file.exists() {
            merge_file(&mut config, &env_file)?;
        }
        config.app.env = app_env;
        config.apply_env_overrides()?;
        Ok(config)
    }

    #[must_use]
    pub fn default_for_env(app_env: AppEnv) -> Self {
        Self {
            app: AppSection {
                env: app_env,
                service_name: "escrow-settlement".to_string(),
                http_bind_addr: "127.0.0.1:8200".to_string(),
            },
            chain: ChainSection {
                node_url: "https://fullnode.testnet.aptoslabs.com".to_string(),
                explorer_base_url: "https://explorer.aptoslabs.com".to_string(),
                network: "testnet".to_string(),
                emojicoin_type: "0x1::aptos_coin::AptosCoin".to_string(),
                confirmation_timeout_ms: 30_000,
                poll_interval_ms: 1_000,
            },
            escrow: EscrowSection {
                escrow_address: String::new(),
                min_apt_balance: 1.0,
                min_emojicoin_balance: 100.0,
                reconcile_batch_size: 25,
                reconcile_interval_ms: 60_000,
            },
            observability: ObservabilitySection {
                log_filter: "info".to_string(),
            },
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(raw_env) = env::var("APP_ENV") {
            self.app.env = raw_env.parse()?;
        }
        if let Ok(value) = env::var("SETTLEMENT__SERVICE_NAME") {
            self.app.service_name = value;
        }
        if let Ok(value) = env::var("SETTLEMENT__HTTP_BIND_ADDR") {
            self.app.http_bind_addr = value;
        }
        if let Ok(value) = env::var("CHAIN__NODE_URL") {
            self.chain.node_url = value;
        }
        if let Ok(value) = env::var("CHAIN__EMOJICOIN_TYPE") {
            self.chain.emojicoin_type = value;
        }
        if let Ok(value) = env::var("ESCROW__ADDRESS") {
            self.escrow.escrow_address = value;
        }
        if let Ok(value) = env::var("OBSERVABILITY__LOG_FILTER") {
            self.observability.log_filter = value;
        } else if let Ok(value) = env::var("RUST_LOG") {
            self.observability.log_filter = value;
        }
        Ok(())
    }

    fn merge_partial(&mut self, partial: PartialAppConfig) {
        if let Some(app) = partial.app {
            if let Some(value) = app.env {
                self.app.env = value;
            }
            if let Some(value) = app.service_name {
                self.app.service_name = value;
            }
            if let Some(value) = app.http_bind_addr {
                self.app.http_bind_addr = value;
            }
        }
        if let Some(chain) = partial.chain {
            if let Some(value) = chain.node_url {
                self.chain.node_url = value;
            }
            if let Some(value) = chain.explorer_base_url {
                self.chain.explorer_base_url = value;
            }
            if let Some(value) = chain.network {
                self.chain.network = value;
            }
            if let Some(value) = chain.emojicoin_type {
                self.chain.emojicoin_type = value;
            }
            if let Some(value) = chain.confirmation_timeout_ms {
                self.chain.confirmation_timeout_ms = value;
            }
            if let Some(value) = chain.poll_interval_ms {
                self.chain.poll_interval_ms = value;
            }
        }
        if let Some(escrow) = partial.escrow {
            if let Some(value) = escrow.escrow_address {
                self.escrow.escrow_address = value;
            }
            if let Some(value) = escrow.min_apt_balance {
                self.escrow.min_apt_balance = value;
            }
            if let Some(value) = escrow.min_emojicoin_balance {
                self.escrow.min_emojicoin_balance = value;
            }
            if let Some(value) = escrow.reconcile_batch_size {
                self.escrow.reconcile_batch_size = value;
            }
            if let Some(value) = escrow.reconcile_interval_ms {
                self.escrow.reconcile_interval_ms = value;
            }
        }
        if let Some(observability) = partial.observability {
            if let Some(value) = observability.log_filter {
                self.observability.log_filter = value;
            }
        }
    }
}

fn merge_file(config: &mut AppConfig, path: &Path) -> Result<(), ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.display().to_string(),
        source,
    })?;
    let partial =
        toml::from_str::<PartialAppConfig>(&content).map_err(|source| ConfigError::ParseToml {
            path: path.display().to_string(),
            source,
        })?;
    config.merge_partial(partial);
    Ok(())
}

fn resolve_config_dir() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = env::var("ESCROW_PLATFORM_CONFIG_DIR") {
        return Ok(PathBuf::from(path));
    }

    let mut current_dir = env::current_dir().map_err(|_| ConfigError::ConfigDirNotFound)?;
    loop {
        let candidate = current_dir.join("config");
        if candidate.join("default.toml").exists() {
            return Ok(candidate);
        }
        if !current_dir.pop() {
            break;
        }
    }

    Err(ConfigError::ConfigDirNotFound)
}
