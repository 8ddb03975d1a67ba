use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::fil::DEFAULT_LOOKBACK_EPOCHS;
use crate::logging;

pub const APP_NAME: &str = "brokkr";

#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[clap(
    version,
    about = "Multi-tenant storage-deal broker",
    long_about = "Brokkr places tenant-claimed pieces with storage providers: it admits \
                  reservations against replication rules, signs and delivers deal proposals, \
                  and reconciles the result with on-chain market state"
)]
pub struct Config {
    #[clap(
        long,
        env = "LOG_FORMAT",
        help = "Log format (plain, json)",
        default_value = "plain"
    )]
    pub log_format: logging::Format,

    #[clap(
        long,
        env = "LOTUS_API_LITE",
        help = "Chain node used for state reads",
        default_value = "https://api.chain.love"
    )]
    pub lotus_api_lite: String,

    #[clap(
        long,
        env = "LOTUS_API_HEAVY",
        help = "Chain node used for signing, beacons and market state",
        default_value = "http://localhost:1234"
    )]
    pub lotus_api_heavy: String,

    #[clap(
        long,
        env = "LOTUS_API_HEAVY_TOKEN",
        help = "Bearer token for the heavy node"
    )]
    pub lotus_api_heavy_token: Option<String>,

    #[clap(
        long,
        env = "LOTUS_LOOKBACK_EPOCHS",
        help = "How many epochs behind head chain-final reads run",
        default_value_t = DEFAULT_LOOKBACK_EPOCHS
    )]
    pub lotus_lookback_epochs: i64,

    #[clap(long, env = "DATA_DIR", help = "Directory holding the broker database")]
    pub data_dir: PathBuf,

    #[clap(
        long,
        env = "WEBAPI_LISTEN_ADDRESS",
        help = "Listen address for the SP-facing HTTP API",
        default_value = "127.0.0.1:8080"
    )]
    pub webapi_listen_address: String,

    #[clap(long, env = "PROMETHEUS_PUSH_URL", hide = true)]
    pub prometheus_push_url: Option<String>,

    #[clap(long, env = "PROMETHEUS_PUSH_USER", hide = true)]
    pub prometheus_push_user: Option<String>,

    #[clap(long, env = "PROMETHEUS_PUSH_PASS", hide = true)]
    pub prometheus_push_pass: Option<String>,
}

/// Values from `~/.brokkr.toml` become process env vars when not already
/// set, so the precedence is flags > env > config file > built-in default.
/// Must run before the runtime spawns any threads.
pub fn seed_env_from_toml() -> Result<()> {
    let Some(home) = std::env::home_dir() else {
        return Ok(());
    };
    let path = home.join(format!(".{}.toml", APP_NAME));
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).context(format!("reading {}", path.display())),
    };
    let table: toml::Table = raw
        .parse()
        .with_context(|| format!("parsing {}", path.display()))?;
    for (key, value) in table {
        let env_key = key.replace('-', "_").to_uppercase();
        if std::env::var_os(&env_key).is_some() {
            continue;
        }
        let rendered = match value {
            toml::Value::String(s) => s,
            other => other.to_string(),
        };
        unsafe { std::env::set_var(&env_key, rendered) };
    }
    Ok(())
}

impl Config {
    pub fn new_na() -> Self {
        let na = "n/a".to_string();
        Self {
            log_format: logging::Format::Plain,
            lotus_api_lite: na.clone(),
            lotus_api_heavy: na,
            lotus_api_heavy_token: None,
            lotus_lookback_epochs: DEFAULT_LOOKBACK_EPOCHS,
            data_dir: "will be set".into(),
            webapi_listen_address: "127.0.0.1:0".into(),
            prometheus_push_url: None,
            prometheus_push_user: None,
            prometheus_push_pass: None,
        }
    }
}
