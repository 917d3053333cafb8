//! Configuration management for the request handlers.

use std::env;
use std::str::FromStr;

use crate::{Error, Result};

/// How handlers obtain database connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Open a fresh connection for every invocation and close it afterwards.
    PerRequest,
    /// Share a pool across invocations served by the same process.
    Pooled { max_connections: u32 },
}

/// Scheme used when writing new password hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PasswordScheme {
    /// Salted Argon2id PHC string.
    #[default]
    Argon2id,
    /// Unsalted SHA-256 hex digest, kept for compatibility with existing stores.
    LegacySha256,
}

impl FromStr for PasswordScheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "argon2id" | "argon2" => Ok(Self::Argon2id),
            "sha256" => Ok(Self::LegacySha256),
            other => Err(Error::Config(format!("Unknown PASSWORD_SCHEME: {}", other))),
        }
    }
}

/// Application configuration loaded from environment variables.
///
/// Built once in `main` and handed by reference to each handler's state.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection address
    pub database_url: String,
    /// Connection acquisition strategy
    pub connection_mode: ConnectionMode,
    /// Scheme for newly written password hashes
    pub password_scheme: PasswordScheme,
}

const DEFAULT_MAX_CONNECTIONS: u32 = 5;

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| Error::Config("DATABASE_URL not set".to_string()))?;

        let max_connections = match lookup("DB_MAX_CONNECTIONS") {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("Invalid DB_MAX_CONNECTIONS: {}", raw)))?,
            None => DEFAULT_MAX_CONNECTIONS,
        };

        let connection_mode = match lookup("DB_CONNECTION_MODE")
            .map(|v| v.trim().to_ascii_lowercase())
            .as_deref()
        {
            None | Some("") | Some("per_request") => ConnectionMode::PerRequest,
            Some("pooled") => ConnectionMode::Pooled { max_connections },
            Some(other) => {
                return Err(Error::Config(format!(
                    "Unknown DB_CONNECTION_MODE: {}",
                    other
                )))
            }
        };

        let password_scheme = match lookup("PASSWORD_SCHEME") {
            Some(raw) if !raw.trim().is_empty() => raw.parse()?,
            _ => PasswordScheme::default(),
        };

        Ok(Self {
            database_url,
            connection_mode,
            password_scheme,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[("DATABASE_URL", "postgres://db/asubt")])).unwrap();
        assert_eq!(config.database_url, "postgres://db/asubt");
        assert_eq!(config.connection_mode, ConnectionMode::PerRequest);
        assert_eq!(config.password_scheme, PasswordScheme::Argon2id);
    }

    #[test]
    fn test_missing_database_url_is_fatal() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_pooled_mode() {
        let config = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/asubt"),
            ("DB_CONNECTION_MODE", "pooled"),
            ("DB_MAX_CONNECTIONS", "12"),
            ("PASSWORD_SCHEME", "sha256"),
        ]))
        .unwrap();
        assert_eq!(config.connection_mode, ConnectionMode::Pooled { max_connections: 12 });
        assert_eq!(config.password_scheme, PasswordScheme::LegacySha256);
    }

    #[test]
    fn test_rejects_unknown_mode() {
        let result = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/asubt"),
            ("DB_CONNECTION_MODE", "sharded"),
        ]));
        assert!(result.is_err());
    }
}
