// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development.

use std::{net::SocketAddr, time::Duration};

pub const DEFAULT_SOLR_URL: &str = "http://localhost:8983/solr";
pub const DEFAULT_COLLECTION: &str = "onde";
pub const DEFAULT_SEARCH_INTERVAL_MS: u64 = 5_000;

/// Which store backend the relay talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Solr,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    pub store: StoreKind,
    /// Base URL of the Solr server, without the collection.
    pub solr_url: String,
    /// Collection holding cards and user records.
    pub collection: String,
    /// How often live queries re-run.
    pub search_interval: Duration,
    /// Log filter directive (e.g. `info`, `onde_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `ONDE_HOST` | `0.0.0.0` |
    /// | `ONDE_PORT` | `8080` |
    /// | `ONDE_STORE` | `solr` (`memory` for an in-process store) |
    /// | `ONDE_SOLR_URL` | `http://localhost:8983/solr` |
    /// | `ONDE_COLLECTION` | `onde` |
    /// | `ONDE_SEARCH_INTERVAL_MS` | `5000` |
    /// | `ONDE_LOG_FILTER` | `info` |
    /// | `ONDE_LOG_FORMAT` | `text` (`json` for structured output) |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    pub fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("ONDE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("ONDE_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let store = match env("ONDE_STORE").as_deref().map(str::trim) {
            Ok(value) if value.eq_ignore_ascii_case("memory") => StoreKind::Memory,
            _ => StoreKind::Solr,
        };

        let solr_url = env("ONDE_SOLR_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|_| DEFAULT_SOLR_URL.into());
        let collection = env("ONDE_COLLECTION").unwrap_or_else(|_| DEFAULT_COLLECTION.into());

        let search_interval_ms = env("ONDE_SEARCH_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .unwrap_or(DEFAULT_SEARCH_INTERVAL_MS);

        let log_filter = env("ONDE_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("ONDE_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Self {
            listen_addr,
            store,
            solr_url,
            collection,
            search_interval: Duration::from_millis(search_interval_ms),
            log_filter,
            log_format,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| map.get(key).map(|v| v.to_string()).ok_or(std::env::VarError::NotPresent)
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = RelayConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.port(), 8080);
        assert_eq!(cfg.listen_addr.ip().to_string(), "0.0.0.0");
        assert_eq!(cfg.store, StoreKind::Solr);
        assert_eq!(cfg.solr_url, DEFAULT_SOLR_URL);
        assert_eq!(cfg.collection, "onde");
        assert_eq!(cfg.search_interval, Duration::from_secs(5));
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.log_format, LogFormat::Text);
    }

    #[test]
    fn custom_host_and_port() {
        let mut m = HashMap::new();
        m.insert("ONDE_HOST", "127.0.0.1");
        m.insert("ONDE_PORT", "3000");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:3000");
    }

    #[test]
    fn invalid_port_uses_default() {
        let mut m = HashMap::new();
        m.insert("ONDE_PORT", "not_a_number");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.port(), 8080);
    }

    #[test]
    fn memory_store_selected() {
        let mut m = HashMap::new();
        m.insert("ONDE_STORE", "Memory");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.store, StoreKind::Memory);
    }

    #[test]
    fn solr_url_loses_trailing_slash() {
        let mut m = HashMap::new();
        m.insert("ONDE_SOLR_URL", "http://solr.internal:8983/solr/");
        m.insert("ONDE_COLLECTION", "cards");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.solr_url, "http://solr.internal:8983/solr");
        assert_eq!(cfg.collection, "cards");
    }

    #[test]
    fn search_interval_override_and_fallback() {
        let mut m = HashMap::new();
        m.insert("ONDE_SEARCH_INTERVAL_MS", "250");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.search_interval, Duration::from_millis(250));

        let mut m = HashMap::new();
        m.insert("ONDE_SEARCH_INTERVAL_MS", "0");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.search_interval, Duration::from_millis(DEFAULT_SEARCH_INTERVAL_MS));
    }

    #[test]
    fn log_settings_override() {
        let mut m = HashMap::new();
        m.insert("ONDE_LOG_FILTER", "debug,hyper=warn");
        m.insert("ONDE_LOG_FORMAT", "json");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.log_filter, "debug,hyper=warn");
        assert_eq!(cfg.log_format, LogFormat::Json);
    }
}
