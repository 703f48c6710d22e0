use std::{env, fmt::Display, fs::read_to_string, str::FromStr, time::Duration};

use anyhow::{Result, anyhow};
use tracing::{debug, info, warn};

pub struct Config {
    pub port: u16,
    /// Frontend origin the shareable token URLs point at, no trailing slash.
    pub public_base_url: String,
    /// Patients live in memory when unset.
    pub redis_url: Option<String>,
    /// Zero disables the background token sweep.
    pub sweep_interval: Duration,
    pub cors_max_age: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        let public_base_url: String = try_load("PUBLIC_BASE_URL", "http://localhost:3000")?;

        Ok(Self {
            port: try_load("RUST_PORT", "1111")?,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            redis_url: var("REDIS_URL").ok().or_else(|| read_secret("REDIS_URL")),
            sweep_interval: Duration::from_secs(try_load("TOKEN_SWEEP_SECS", "3600")?),
            cors_max_age: Duration::from_secs(try_load("CORS_MAX_AGE_SECS", "3600")?),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 1111,
            public_base_url: "http://localhost:3000".to_string(),
            redis_url: None,
            sweep_interval: Duration::from_secs(60 * 60),
            cors_max_age: Duration::from_secs(60 * 60),
        }
    }
}

fn var(key: &str) -> Result<String, ()> {
    env::var(key).map_err(|_| {
        debug!("Environment variable {key} not found");
    })
}

fn try_load<T: FromStr>(key: &str, default: &str) -> Result<T>
where
    T::Err: Display,
{
    var(key)
        .unwrap_or_else(|_| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e| {
            warn!("Invalid {key} value: {e}");
            anyhow!("Environment misconfigured, invalid {key} value: {e}")
        })
}

fn read_secret(secret_name: &str) -> Option<String> {
    let path = format!("/run/secrets/{secret_name}");

    read_to_string(&path)
        .map(|s| s.trim().to_string())
        .map_err(|e| {
            debug!("No {secret_name} secret at {path}: {e}");
        })
        .ok()
        .filter(|s| !s.is_empty())
}
