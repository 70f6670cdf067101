//! Process configuration, read once from `CREWPLAN_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last rewrite before the compactor kicks in.
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5434,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "crewplan".into(),
            max_connections: 256,
            compact_threshold: 1000,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, String>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| format!("{key}={raw:?}: {e}")),
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset variables fall back to the defaults; malformed ones are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let defaults = Self::default();
        let config = Self {
            port: parsed(&lookup, "CREWPLAN_PORT")?.unwrap_or(defaults.port),
            bind: lookup("CREWPLAN_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("CREWPLAN_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            password: lookup("CREWPLAN_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&lookup, "CREWPLAN_MAX_CONNECTIONS")?.unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "CREWPLAN_COMPACT_THRESHOLD")?.unwrap_or(defaults.compact_threshold),
            tls_cert: lookup("CREWPLAN_TLS_CERT"),
            tls_key: lookup("CREWPLAN_TLS_KEY"),
            metrics_port: parsed(&lookup, "CREWPLAN_METRICS_PORT")?,
        };
        if config.max_connections == 0 {
            return Err("CREWPLAN_MAX_CONNECTIONS must be at least 1".into());
        }
        if config.compact_threshold == 0 {
            return Err("CREWPLAN_COMPACT_THRESHOLD must be at least 1".into());
        }
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<ServerConfig, String> {
        let env: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        ServerConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.listen_addr(), "0.0.0.0:5434");
    }

    #[test]
    fn overrides_are_applied() {
        let config = from_pairs(&[
            ("CREWPLAN_PORT", "6000"),
            ("CREWPLAN_DATA_DIR", "/var/lib/crewplan"),
            ("CREWPLAN_MAX_CONNECTIONS", "8"),
            ("CREWPLAN_METRICS_PORT", "9100"),
        ])
        .unwrap();
        assert_eq!(config.port, 6000);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/crewplan"));
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.password, "crewplan");
    }

    #[test]
    fn malformed_number_is_an_error() {
        let err = from_pairs(&[("CREWPLAN_PORT", "http")]).unwrap_err();
        assert!(err.contains("CREWPLAN_PORT"), "{err}");
        assert!(from_pairs(&[("CREWPLAN_MAX_CONNECTIONS", "0")]).is_err());
    }
}
