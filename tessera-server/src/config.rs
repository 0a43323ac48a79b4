//! Server configuration from the environment.
//!
//! | variable | default |
//! |---|---|
//! | `PORT` | `8001` |
//! | `TESSERA_BIND_HOST` | `0.0.0.0` |
//! | `TESSERA_DATA_DIR` | unset, grid kept in memory |
//! | `TESSERA_BROADCAST_CAPACITY` | `256` |

use std::path::PathBuf;
use tessera_collab::ServerConfig;

pub const DEFAULT_PORT: u16 = 8001;
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Invalid environment value.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    InvalidNumber { var: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidNumber { var, value } => {
                write!(f, "{var} must be a positive number, got '{value}'")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Read the configuration from process environment variables.
pub fn from_env() -> Result<ServerConfig, ConfigError> {
    from_lookup(|var| std::env::var(var).ok())
}

/// Build the configuration from an arbitrary variable lookup.
pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<ServerConfig, ConfigError> {
    let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    let port: u16 = parse_number("PORT", get("PORT"))?.unwrap_or(DEFAULT_PORT);
    let host = get("TESSERA_BIND_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());

    let mut config = ServerConfig {
        bind_addr: format!("{host}:{port}"),
        storage_path: get("TESSERA_DATA_DIR").map(PathBuf::from),
        ..ServerConfig::default()
    };
    if let Some(capacity) = parse_number("TESSERA_BROADCAST_CAPACITY", get("TESSERA_BROADCAST_CAPACITY"))? {
        if capacity == 0 {
            return Err(ConfigError::InvalidNumber {
                var: "TESSERA_BROADCAST_CAPACITY",
                value: "0".to_string(),
            });
        }
        config.broadcast_capacity = capacity;
    }

    Ok(config)
}

fn parse_number<T: std::str::FromStr>(
    var: &'static str,
    value: Option<String>,
) -> Result<Option<T>, ConfigError> {
    match value {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { var, value }),
        None => Ok(None),
    }
}
