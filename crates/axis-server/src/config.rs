use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, bail};

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
    "secret",
];

/// Used when `RUST_LOG` is unset. Covers every workspace crate.
pub const DEFAULT_LOG_FILTER: &str =
    "axis6=debug,axis_api=debug,axis_gateway=debug,axis_db=debug,axis_sync=debug,tower_http=debug";

#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub addr: SocketAddr,
    pub webhook_secret: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup, so tests need not touch the process env.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let jwt_secret = get("AXIS_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("AXIS_JWT_SECRET is unset or still a placeholder");
        }

        let db_path = get("AXIS_DB_PATH").unwrap_or_else(|| "axis6.db".into()).into();
        let host = get("AXIS_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = get("AXIS_PORT")
            .unwrap_or_else(|| "3000".into())
            .parse()
            .context("AXIS_PORT must be a port number")?;
        let addr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", host, port))?;

        let webhook_secret = get("AXIS_WEBHOOK_SECRET").filter(|s| !s.is_empty());

        Ok(Self {
            jwt_secret,
            db_path,
            addr,
            webhook_secret,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> anyhow::Result<Config> {
        let env: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_apply() {
        let cfg = config(&[("AXIS_JWT_SECRET", "a-long-random-value")]).unwrap();
        assert_eq!(cfg.db_path, PathBuf::from("axis6.db"));
        assert_eq!(cfg.addr.port(), 3000);
        assert!(cfg.webhook_secret.is_none());
    }

    #[test]
    fn placeholder_secret_is_rejected() {
        assert!(config(&[]).is_err());
        assert!(config(&[("AXIS_JWT_SECRET", "dev-secret-change-me")]).is_err());
    }

    #[test]
    fn bad_port_is_rejected() {
        assert!(config(&[("AXIS_JWT_SECRET", "x9f2"), ("AXIS_PORT", "http")]).is_err());
    }

    #[test]
    fn default_log_filter_covers_every_crate() {
        assert!(tracing_subscriber::EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
        for target in ["axis6", "axis_api", "axis_gateway", "axis_db", "axis_sync", "tower_http"] {
            assert!(DEFAULT_LOG_FILTER.contains(&format!("{target}=debug")), "{target}");
        }
    }

    #[test]
    fn empty_webhook_secret_counts_as_unset() {
        let cfg = config(&[("AXIS_JWT_SECRET", "x9f2"), ("AXIS_WEBHOOK_SECRET", "")]).unwrap();
        assert!(cfg.webhook_secret.is_none());
    }
}
