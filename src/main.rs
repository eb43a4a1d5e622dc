//! `cacheproxy` — run the caching reverse proxy in front of one upstream.
//!
//! ```text
//! cacheproxy --uri http://backend:9000 --port 8888 \
//!     --cache-methods GET,POST --cache-endpoints /,/api/slow-endpoint/ --cache-timeout 60
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cacheproxy::config::{Config, Settings};
use cacheproxy::{Dispatcher, MemoryCache, ProxyResponse, Server, UpstreamClient};

/// Transparent HTTP reverse proxy with an in-memory response cache
#[derive(Debug, Parser)]
#[command(name = "cacheproxy")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Upstream base URI every request is forwarded to
    #[arg(short = 'u', long, env = "PROXY_URI")]
    uri: Option<String>,

    /// Address to listen on [default: 0.0.0.0]
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port to listen on [default: 8888]
    #[arg(short, long)]
    port: Option<u16>,

    /// Methods eligible for caching, comma-separated [default: GET]
    #[arg(long, env = "CACHE_METHODS", value_delimiter = ',')]
    cache_methods: Option<Vec<String>>,

    /// Exact request paths eligible for caching, comma-separated
    #[arg(long, env = "CACHE_ENDPOINTS", value_delimiter = ',')]
    cache_endpoints: Option<Vec<String>>,

    /// Seconds a cached response stays fresh; 0 keeps it forever [default: 0]
    #[arg(long, env = "CACHE_TIMEOUT")]
    cache_timeout: Option<u64>,

    /// Upstream connect and request timeout in seconds [default: 20]
    #[arg(long, env = "UPSTREAM_TIMEOUT")]
    upstream_timeout: Option<u64>,

    /// JSON settings file; command-line and environment values override it
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl Cli {
    fn into_config(self) -> Result<Config> {
        let base = match &self.config {
            Some(path) => Settings::from_file(path)?,
            None => Settings::default(),
        };
        let overrides = Settings {
            uri: self.uri,
            host: self.host,
            port: self.port,
            cache_methods: self.cache_methods,
            cache_endpoints: self.cache_endpoints,
            cache_timeout: self.cache_timeout,
            upstream_timeout: self.upstream_timeout,
        };
        Ok(base.overlay(overrides).resolve()?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Cli::parse().into_config()?;
    info!(
        upstream = %config.upstream_uri,
        listen = %config.listen_addr,
        policy = ?config.policy,
        "starting proxy"
    );

    if config.policy.is_disabled() {
        warn!("no cacheable methods or endpoints configured; every request goes upstream");
    }

    let upstream = UpstreamClient::new(&config.upstream_uri, config.upstream)
        .context("cannot use upstream URI")?;
    let dispatcher = Dispatcher::new(
        config.policy,
        Arc::new(MemoryCache::<ProxyResponse>::new()),
        Arc::new(upstream),
    );

    let server = Server::bind(&config.listen_addr).await?;
    server
        .run_until(
            move |request| {
                let dispatcher = dispatcher.clone();
                async move { dispatcher.handle(request).await }
            },
            shutdown_signal(),
        )
        .await?;

    info!("proxy stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for Ctrl-C; running until killed");
        std::future::pending::<()>().await;
    }
}
