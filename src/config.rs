//! Service configuration read from the environment.

use anyhow::{Context, Result};
use std::str::FromStr;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub database_url: String,
    pub max_connections: u32,
    pub port: u16,
    pub nats_url: Option<String>,
    pub events_subject: String,
    /// Prefix for relative catalog image paths.
    pub image_base_url: String,
}

fn parse_or<T>(raw: Option<String>, default: T, key: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw {
        Some(v) => v.trim().parse().with_context(|| format!("invalid {}: {:?}", key, v)),
        None => Ok(default),
    }
}

impl Config {
    /// Reads the process environment; call `dotenvy::dotenv()` first to pick up `.env`.
    pub fn from_env() -> Result<Self> { Self::from_lookup(|key| std::env::var(key).ok()) }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Ok(Self {
            database_url: get("DATABASE_URL").context("DATABASE_URL must be set")?,
            max_connections: parse_or(get("DATABASE_MAX_CONNECTIONS"), 10, "DATABASE_MAX_CONNECTIONS")?,
            port: parse_or(get("PORT"), 8084, "PORT")?,
            nats_url: get("NATS_URL"),
            events_subject: get("CART_EVENTS_SUBJECT").unwrap_or_else(|| "cart.events".to_string()),
            image_base_url: get("IMAGE_BASE_URL").unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let c = config(&[("DATABASE_URL", "postgres://localhost/cart")]).unwrap();
        assert_eq!(c.port, 8084);
        assert_eq!(c.max_connections, 10);
        assert_eq!(c.nats_url, None);
        assert_eq!(c.events_subject, "cart.events");
        assert_eq!(c.image_base_url, "");
    }

    #[test]
    fn test_overrides_and_errors() {
        let c = config(&[("DATABASE_URL", "postgres://db/cart"), ("PORT", "9000"), ("NATS_URL", "nats://bus:4222"), ("IMAGE_BASE_URL", "https://img")]).unwrap();
        assert_eq!(c.port, 9000);
        assert_eq!(c.nats_url.as_deref(), Some("nats://bus:4222"));
        assert!(config(&[]).is_err());
        assert!(config(&[("DATABASE_URL", "x"), ("PORT", "eighty")]).is_err());
    }
}
