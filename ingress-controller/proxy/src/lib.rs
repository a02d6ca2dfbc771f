//! The data plane: HTTP and HTTPS listeners that route requests according to
//! the most recently published [`Config`].

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod authz;
mod compress;
mod error;
mod grpc_web;
mod handler;
mod metrics;
mod ratelimit;
mod server;
pub mod tls;
mod upstream;

#[cfg(test)]
mod tests;

pub use self::{
    error::Error,
    metrics::ProxyMetrics,
    ratelimit::{InMemoryRateLimitService, RateLimitService},
};
use self::{
    handler::{full, status_response, strip_hop_by_hop, Handler},
    ratelimit::LocalRateLimiter,
    tls::ServerConfigs,
    upstream::Upstream,
};
use ahash::AHashSet as HashSet;
use bytes::Bytes;
use ingress_controller_core::{Config, RouteAction};
use std::sync::Arc;
use tokio::{net::TcpListener, sync::watch};
use tracing::{info_span, Instrument};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

#[derive(Clone, Debug)]
pub struct Settings {
    /// The number of proxies in front of this one whose `X-Forwarded-For`
    /// entries are trusted.
    pub num_trusted_hops: usize,
    /// Whether responses are gzip compressed for clients that accept it.
    pub compression: bool,
    /// The domain global rate limit descriptors are checked in.
    pub ratelimit_domain: String,
}

/// Serves the published config on any number of listeners.
#[derive(Clone)]
pub struct Proxy {
    handler: Arc<Handler>,
    tls: Arc<ServerConfigs>,
}

// === impl Settings ===

impl Default for Settings {
    fn default() -> Self {
        Self {
            num_trusted_hops: 0,
            compression: true,
            ratelimit_domain: "ingress".to_string(),
        }
    }
}

// === impl Proxy ===

impl Proxy {
    pub fn new(
        config: watch::Receiver<Arc<Config>>,
        settings: Settings,
        global_limits: Option<Arc<dyn RateLimitService>>,
        metrics: ProxyMetrics,
    ) -> Self {
        let handler = Handler {
            config,
            upstream: Upstream::default(),
            local_limits: LocalRateLimiter::default(),
            global_limits,
            settings,
            metrics,
        };
        Self {
            handler: Arc::new(handler),
            tls: Default::default(),
        }
    }

    /// Serves plaintext HTTP until `drain` is signaled.
    pub async fn serve_http(self, listener: TcpListener, drain: drain::Watch) {
        let addr = listener.local_addr().ok();
        server::serve(listener, self.handler, None, drain)
            .instrument(info_span!("http", ?addr))
            .await
    }

    /// Serves HTTPS until `drain` is signaled, choosing a certificate from
    /// each connection's server name.
    pub async fn serve_https(self, listener: TcpListener, drain: drain::Watch) {
        let addr = listener.local_addr().ok();
        server::serve(listener, self.handler, Some(self.tls), drain)
            .instrument(info_span!("https", ?addr))
            .await
    }

    /// Runs health checks and prunes the rate limit and upstream state of
    /// removed routes until the config publisher is dropped.
    pub async fn run_background(self) {
        let health = self.handler.upstream.health_checks(self.handler.config.clone());
        let prune = async {
            let mut config = self.handler.config.clone();
            while config.changed().await.is_ok() {
                let config = config.borrow_and_update().clone();
                let keys = config
                    .vhosts
                    .iter()
                    .flat_map(|v| v.routes().iter())
                    .flat_map(|r| r.rate_limits.local.iter().map(|l| l.key.clone()))
                    .collect::<HashSet<_>>();
                self.handler.local_limits.retain(&keys);
                self.handler.upstream.retain(&cluster_names(&config));
            }
        };
        tokio::join!(
            health.instrument(info_span!("health")),
            prune.instrument(info_span!("prune"))
        );
    }
}

/// The names of every cluster that routes or authorization servers use.
fn cluster_names(config: &Config) -> HashSet<String> {
    let mut names = HashSet::new();
    for vhost in config.vhosts.iter() {
        if let Some(server) = &vhost.authorization {
            names.insert(server.cluster.name.clone());
        }
        for route in vhost.routes() {
            if let RouteAction::Forward(backends) = &route.action {
                names.extend(backends.iter().map(|b| b.cluster.name.clone()));
            }
        }
    }
    names
}
