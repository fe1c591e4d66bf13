use std::{env, fmt::Display, path::PathBuf, str::FromStr};

use thiserror::Error;
use tracing::{info, warn};

use crate::projections::MAX_SCANNED_RECORDS;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {key} value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// SQLite file. `None` keeps responses in memory.
    pub database_path: Option<PathBuf>,
    pub client_build_dir: PathBuf,
    pub client_dir: PathBuf,
    pub aggregate_limit: usize,
    pub subscriber_buffer: usize,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; `load` uses the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            host: try_load(&lookup, "HOST", "0.0.0.0")?,
            port: try_load(&lookup, "PORT", "3000")?,
            database_path: lookup("DATABASE_PATH")
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            client_build_dir: try_load(&lookup, "CLIENT_BUILD_DIR", "client/build")?,
            client_dir: try_load(&lookup, "CLIENT_DIR", "client")?,
            aggregate_limit: try_load(&lookup, "AGGREGATE_LIMIT", &MAX_SCANNED_RECORDS.to_string())?,
            subscriber_buffer: try_load(&lookup, "SUBSCRIBER_BUFFER", "64")?,
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Directory static assets are served from: the client build output if
    /// present, else the client source directory, else nothing.
    pub fn static_root(&self) -> Option<PathBuf> {
        if self.client_build_dir.is_dir() {
            info!("Serving static files from {}", self.client_build_dir.display());
            Some(self.client_build_dir.clone())
        } else if self.client_dir.is_dir() {
            info!("Serving static files from {}", self.client_dir.display());
            Some(self.client_dir.clone())
        } else {
            warn!(
                "No client static files found ({} or {})",
                self.client_dir.display(),
                self.client_build_dir.display()
            );
            None
        }
    }
}

fn try_load<F, T>(lookup: &F, key: &'static str, default: &str) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    let value = lookup(key).unwrap_or_else(|| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });

    value.parse().map_err(|e: T::Err| {
        warn!("Invalid {key} value: {e}");
        ConfigError::Invalid {
            key,
            value: value.clone(),
            reason: e.to_string(),
        }
    })
}
