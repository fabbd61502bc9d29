use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, anyhow};

pub const DATABASE_URL_VAR: &str = "PEDIGREE_DATABASE_URL";
pub const MAX_CONNECTIONS_VAR: &str = "PEDIGREE_MAX_CONNECTIONS";
pub const BUSY_TIMEOUT_VAR: &str = "PEDIGREE_BUSY_TIMEOUT_MS";
pub const BIND_VAR: &str = "PEDIGREE_BIND";

pub const DEFAULT_DATABASE_URL: &str = "sqlite://pedigree.db";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_BIND: &str = "127.0.0.1:4010";

/// Connection settings for the person store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// How long a writer waits for the store lock before failing.
    pub busy_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        }
    }
}

impl StoreConfig {
    /// Single-connection in-memory store; the connection must never be recycled.
    pub fn in_memory() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 1,
            ..Self::default()
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.database_url.contains(":memory:") || self.database_url.contains("mode=memory")
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup(DATABASE_URL_VAR)
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let max_connections = match lookup(MAX_CONNECTIONS_VAR) {
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .with_context(|| format!("invalid {} '{}'", MAX_CONNECTIONS_VAR, raw))?,
            None => DEFAULT_MAX_CONNECTIONS,
        };
        if max_connections == 0 {
            return Err(anyhow!("{} must be at least 1", MAX_CONNECTIONS_VAR));
        }

        let busy_timeout_ms = match lookup(BUSY_TIMEOUT_VAR) {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .with_context(|| format!("invalid {} '{}'", BUSY_TIMEOUT_VAR, raw))?,
            None => DEFAULT_BUSY_TIMEOUT_MS,
        };

        Ok(Self {
            database_url,
            max_connections,
            busy_timeout: Duration::from_millis(busy_timeout_ms),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub store: StoreConfig,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind = lookup(BIND_VAR).unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind: SocketAddr = bind
            .parse()
            .with_context(|| format!("invalid {} '{}'", BIND_VAR, bind))?;

        Ok(Self {
            bind,
            store: StoreConfig::from_lookup(lookup)?,
        })
    }
}
