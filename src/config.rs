//! Store configuration.

use crate::error::{KvError, Result};

/// Settings for the reference store behind [`crate::server::Server`].
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database path; `:memory:` keeps everything in process.
    pub path: String,

    /// SQLite page cache size (megabytes).
    pub cache_mb: i64,

    /// How long a writer waits on a locked database file (milliseconds).
    pub busy_timeout_ms: u64,

    /// COUNT hint used by HSCAN/ZSCAN when the caller supplies none.
    pub scan_count: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: ":memory:".to_string(),
            cache_mb: 64,
            busy_timeout_ms: 5000,
            scan_count: 10,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Defaults overridden by `KVSCOPE_DB_PATH`, `KVSCOPE_CACHE_MB` and
    /// `KVSCOPE_SCAN_COUNT` when set.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = lookup("KVSCOPE_DB_PATH") {
            builder = builder.path(path);
        }
        if let Some(mb) = lookup("KVSCOPE_CACHE_MB") {
            builder = builder.cache_mb(parse_var("KVSCOPE_CACHE_MB", &mb)?);
        }
        if let Some(count) = lookup("KVSCOPE_SCAN_COUNT") {
            builder = builder.scan_count(parse_var("KVSCOPE_SCAN_COUNT", &count)?);
        }
        builder.build()
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| KvError::InvalidArgument(format!("{} has an invalid value: '{}'", name, raw)))
}

#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.config.path = path.into();
        self
    }

    pub fn cache_mb(mut self, mb: i64) -> Self {
        self.config.cache_mb = mb;
        self
    }

    pub fn busy_timeout_ms(mut self, ms: u64) -> Self {
        self.config.busy_timeout_ms = ms;
        self
    }

    pub fn scan_count(mut self, count: usize) -> Self {
        self.config.scan_count = count;
        self
    }

    pub fn build(self) -> Result<Config> {
        if self.config.scan_count == 0 {
            return Err(KvError::InvalidArgument(
                "scan_count must be at least 1".to_string(),
            ));
        }
        if self.config.cache_mb < 0 {
            return Err(KvError::InvalidArgument(
                "cache_mb must not be negative".to_string(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.path, ":memory:");
        assert_eq!(config.scan_count, 10);
    }

    #[test]
    fn test_builder_validates() {
        assert!(Config::builder().scan_count(0).build().is_err());
        assert!(Config::builder().cache_mb(-1).build().is_err());
        let config = Config::builder().path("/tmp/kv.db").scan_count(50).build().unwrap();
        assert_eq!(config.path, "/tmp/kv.db");
        assert_eq!(config.scan_count, 50);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [("KVSCOPE_DB_PATH", "data.db"), ("KVSCOPE_SCAN_COUNT", " 25 ")]
            .into_iter()
            .collect();
        let config = Config::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.path, "data.db");
        assert_eq!(config.scan_count, 25);
        assert_eq!(config.cache_mb, 64);

        let bad = Config::from_lookup(|k| (k == "KVSCOPE_CACHE_MB").then(|| "lots".to_string()));
        assert!(matches!(bad, Err(KvError::InvalidArgument(_))));
    }
}
