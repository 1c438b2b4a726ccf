//! Store configuration, read from the environment.
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `ALLOCATION_STORE` | `memory` or `postgres` | `memory` |
//! | `DATABASE_URL` | full Postgres URL; wins over the `DB_*` parts | unset |
//! | `DB_HOST` | Postgres host | `localhost` |
//! | `DB_PORT` | Postgres port | `54321` on localhost, `5432` elsewhere |
//! | `DB_USER` / `DB_NAME` | role and database | `allocation` |
//! | `DB_PASSWORD` | password | `abc123` |
//! | `ALLOCATION_DB_MAX_CONNECTIONS` | pool size | `5` |

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown store kind '{0}' (expected 'memory' or 'postgres')")]
    UnknownStore(String),

    #[error("{key} must be a positive integer, got '{value}'")]
    InvalidNumber { key: &'static str, value: String },
}

/// Which store backs units of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    Memory,
    Postgres(PostgresConfig),
}

/// Connection settings for [`PgSessionFactory`](crate::session::PgSessionFactory).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

impl PostgresConfig {
    /// Build the configuration from `DATABASE_URL` or the `DB_*` parts.
    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let url = match lookup("DATABASE_URL") {
            Some(url) => url,
            None => {
                let host = lookup("DB_HOST").unwrap_or_else(|| "localhost".to_string());
                let port: u16 = match lookup("DB_PORT") {
                    Some(port) => parse_positive("DB_PORT", &port)?,
                    None if host == "localhost" => 54321,
                    None => 5432,
                };
                let user = lookup("DB_USER").unwrap_or_else(|| "allocation".to_string());
                let password = lookup("DB_PASSWORD").unwrap_or_else(|| "abc123".to_string());
                let db_name = lookup("DB_NAME").unwrap_or_else(|| "allocation".to_string());
                format!("postgres://{user}:{password}@{host}:{port}/{db_name}")
            }
        };

        let max_connections = match lookup("ALLOCATION_DB_MAX_CONNECTIONS") {
            Some(raw) => parse_positive("ALLOCATION_DB_MAX_CONNECTIONS", &raw)?,
            None => DEFAULT_MAX_CONNECTIONS,
        };

        Ok(Self {
            url,
            max_connections,
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key: &str| std::env::var(key).ok())
    }

    /// The URL with its password masked, for logs.
    pub fn redacted_url(&self) -> String {
        let Some((scheme, rest)) = self.url.split_once("://") else {
            return self.url.clone();
        };
        let Some((credentials, location)) = rest.rsplit_once('@') else {
            return self.url.clone();
        };
        match credentials.split_once(':') {
            Some((user, _)) => format!("{scheme}://{user}:***@{location}"),
            None => self.url.clone(),
        }
    }
}

impl StoreConfig {
    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let kind = lookup("ALLOCATION_STORE").unwrap_or_else(|| "memory".to_string());
        match kind.trim().to_ascii_lowercase().as_str() {
            "memory" | "in-memory" => Ok(StoreConfig::Memory),
            "postgres" | "postgresql" => Ok(StoreConfig::Postgres(PostgresConfig::from_lookup(lookup)?)),
            _ => Err(ConfigError::UnknownStore(kind)),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key: &str| std::env::var(key).ok())
    }
}

fn parse_positive<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: core::str::FromStr + PartialOrd + Default,
{
    match raw.trim().parse::<T>() {
        Ok(v) if v > T::default() => Ok(v),
        _ => Err(ConfigError::InvalidNumber {
            key,
            value: raw.to_string(),
        }),
    }
}
