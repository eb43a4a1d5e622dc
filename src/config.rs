//! Startup configuration.
//!
//! Settings come from up to two layers: an optional JSON file and the
//! command line / environment. [`Settings::overlay`] merges them (the later
//! layer wins field by field) and [`Settings::resolve`] validates the result
//! into an immutable [`Config`].
//!
//! The file accepts both snake_case keys and the upper-case names used by
//! the environment:
//!
//! ```json
//! {
//!   "uri": "http://backend:9000",
//!   "CACHE_METHODS": ["GET", "POST"],
//!   "CACHE_ENDPOINTS": ["/", "/api/slow-endpoint/"],
//!   "CACHE_TIMEOUT": 60
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::cache::CachePolicy;
use crate::upstream::{DEFAULT_TIMEOUT, UpstreamOptions};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8888;
pub const DEFAULT_CACHE_METHODS: &[&str] = &["GET"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("an upstream URI is required (--uri)")]
    MissingUpstream,
}

/// One layer of raw settings. Every field is optional so layers can be merged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(alias = "URI")]
    pub uri: Option<String>,
    #[serde(alias = "HOST")]
    pub host: Option<String>,
    #[serde(alias = "PORT")]
    pub port: Option<u16>,
    #[serde(alias = "CACHE_METHODS")]
    pub cache_methods: Option<Vec<String>>,
    #[serde(alias = "CACHE_ENDPOINTS")]
    pub cache_endpoints: Option<Vec<String>>,
    /// Seconds; 0 means cached entries never expire.
    #[serde(alias = "CACHE_TIMEOUT")]
    pub cache_timeout: Option<u64>,
    /// Seconds allowed for connecting to, and for a whole exchange with, the upstream.
    #[serde(alias = "UPSTREAM_TIMEOUT")]
    pub upstream_timeout: Option<u64>,
}

impl Settings {
    /// Loads a settings layer from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Merges `over` on top of `self`; fields set in `over` win.
    #[must_use]
    pub fn overlay(self, over: Settings) -> Settings {
        Settings {
            uri: over.uri.or(self.uri),
            host: over.host.or(self.host),
            port: over.port.or(self.port),
            cache_methods: over.cache_methods.or(self.cache_methods),
            cache_endpoints: over.cache_endpoints.or(self.cache_endpoints),
            cache_timeout: over.cache_timeout.or(self.cache_timeout),
            upstream_timeout: over.upstream_timeout.or(self.upstream_timeout),
        }
    }

    /// Validates the merged settings and fills in defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingUpstream`] when no upstream URI was given.
    pub fn resolve(self) -> Result<Config, ConfigError> {
        let upstream_uri = self
            .uri
            .filter(|uri| !uri.trim().is_empty())
            .ok_or(ConfigError::MissingUpstream)?;

        let host = self.host.unwrap_or_else(|| DEFAULT_HOST.to_owned());
        let port = self.port.unwrap_or(DEFAULT_PORT);
        let listen_addr = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };

        let methods = self.cache_methods.unwrap_or_else(|| {
            DEFAULT_CACHE_METHODS.iter().map(|m| (*m).to_owned()).collect()
        });
        let endpoints = self.cache_endpoints.unwrap_or_default();
        let policy = CachePolicy::new(methods, endpoints)
            .with_ttl(Duration::from_secs(self.cache_timeout.unwrap_or(0)));

        let timeout = self
            .upstream_timeout
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);
        let upstream = UpstreamOptions {
            connect_timeout: timeout,
            timeout,
        };

        Ok(Config {
            upstream_uri,
            listen_addr,
            policy,
            upstream,
        })
    }
}

/// Validated configuration, fixed for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct Config {
    pub upstream_uri: String,
    pub listen_addr: String,
    pub policy: CachePolicy,
    pub upstream: UpstreamOptions,
}
