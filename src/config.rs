use std::env;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// How log lines are rendered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

impl LogFormat {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "plain" | "pretty" | "text" => Ok(Self::Plain),
            other => Err(ConfigError::Invalid {
                name: "LOG_FORMAT",
                reason: format!("unknown format {other:?}"),
            }),
        }
    }
}

/// Process configuration, read from the environment.
#[derive(Clone, Debug)]
pub struct Config {
    /// Absent means the in-memory store is used.
    pub mongodb_uri: Option<String>,
    pub database: String,
    pub bind_addr: String,
    pub session_secret: String,
    /// Absent means any origin is allowed.
    pub cors_allowed_origin: Option<String>,
    /// `EnvFilter` directives, e.g. `info,splitledger=debug`.
    pub log_filter: String,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let session_secret =
            non_empty("SESSION_SECRET").ok_or(ConfigError::Missing("SESSION_SECRET"))?;
        if session_secret.len() < 16 {
            return Err(ConfigError::Invalid {
                name: "SESSION_SECRET",
                reason: "must be at least 16 characters".into(),
            });
        }

        let log_filter = non_empty("LOG_LEVEL")
            .or_else(|| non_empty("RUST_LOG"))
            .unwrap_or_else(|| "info".to_string());
        if let Err(err) = EnvFilter::try_new(&log_filter) {
            return Err(ConfigError::Invalid {
                name: "LOG_LEVEL",
                reason: err.to_string(),
            });
        }
        let log_format = match non_empty("LOG_FORMAT") {
            Some(raw) => LogFormat::parse(&raw)?,
            None => LogFormat::Json,
        };

        Ok(Self {
            mongodb_uri: non_empty("MONGODB_URI"),
            database: non_empty("MONGODB_DATABASE").unwrap_or_else(|| "OpenSplit".to_string()),
            bind_addr: non_empty("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            session_secret,
            cors_allowed_origin: non_empty("CORS_ALLOWED_ORIGIN"),
            log_filter,
            log_format,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply() {
        let config = config(&[("SESSION_SECRET", "0123456789abcdef")]).unwrap();
        assert_eq!(config.mongodb_uri, None);
        assert_eq!(config.database, "OpenSplit");
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.cors_allowed_origin, None);
        assert_eq!(config.log_filter, "info");
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn logging_is_configurable() {
        let configured = config(&[
            ("SESSION_SECRET", "0123456789abcdef"),
            ("RUST_LOG", "warn"),
            ("LOG_LEVEL", "info,splitledger=debug"),
            ("LOG_FORMAT", "Pretty"),
        ])
        .unwrap();
        assert_eq!(configured.log_filter, "info,splitledger=debug");
        assert_eq!(configured.log_format, LogFormat::Plain);

        let fallback = config(&[("SESSION_SECRET", "0123456789abcdef"), ("RUST_LOG", "warn")]);
        assert_eq!(fallback.unwrap().log_filter, "warn");

        assert!(matches!(
            config(&[("SESSION_SECRET", "0123456789abcdef"), ("LOG_FORMAT", "xml")]),
            Err(ConfigError::Invalid { name: "LOG_FORMAT", .. })
        ));
        assert!(matches!(
            config(&[("SESSION_SECRET", "0123456789abcdef"), ("LOG_LEVEL", "splitledger=loud")]),
            Err(ConfigError::Invalid { name: "LOG_LEVEL", .. })
        ));
    }

    #[test]
    fn secret_is_required() {
        assert!(matches!(config(&[]), Err(ConfigError::Missing("SESSION_SECRET"))));
        assert!(matches!(
            config(&[("SESSION_SECRET", "short")]),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn blank_values_count_as_unset() {
        let config = config(&[
            ("SESSION_SECRET", "0123456789abcdef"),
            ("MONGODB_URI", "  "),
            ("BIND_ADDR", "127.0.0.1:9000"),
        ])
        .unwrap();
        assert_eq!(config.mongodb_uri, None);
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
    }
}
