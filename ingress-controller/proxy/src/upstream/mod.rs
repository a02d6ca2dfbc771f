mod connect;
mod health;

use self::{
    connect::{connect, Key, Pool, Target},
    health::HealthChecks,
};
use crate::{error::Error, tls::ClientConfigs};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;
use ingress_controller_core::{Backend, Cluster, Config, Endpoints};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use tokio::sync::watch;

/// Sends requests to cluster endpoints.
#[derive(Debug, Default)]
pub(crate) struct Upstream {
    tls: Arc<ClientConfigs>,
    health: HealthChecks,
    /// Round-robin position per cluster.
    cursors: Mutex<HashMap<String, usize>>,
    pool: Pool,
}

/// Picks a backend with probability proportional to its weight.
///
/// Returns `None` when every weight is zero.
pub(crate) fn select_backend<'b, R: Rng>(backends: &'b [Backend], rng: &mut R) -> Option<&'b Backend> {
    let total = backends.iter().map(|b| u64::from(b.weight)).sum::<u64>();
    if total == 0 {
        return None;
    }
    let mut pick = rng.gen_range(0..total);
    for backend in backends {
        let weight = u64::from(backend.weight);
        if pick < weight {
            return Some(backend);
        }
        pick -= weight;
    }
    None
}

// === impl Upstream ===

impl Upstream {
    pub(crate) fn health_checks(
        &self,
        config: watch::Receiver<Arc<Config>>,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        self.health.clone().run(config, self.tls.clone())
    }

    /// Sends `req` to one of the cluster's endpoints, reusing an idle
    /// connection when one is available.
    ///
    /// `server_name` is the rewritten `Host` of the request, if any.
    pub(crate) async fn send(
        &self,
        cluster: &Arc<Cluster>,
        req: Request<Full<Bytes>>,
        server_name: Option<&str>,
    ) -> Result<Response<Incoming>, Error> {
        let target = self.select_endpoint(cluster)?;
        let key = Key::new(cluster, target, server_name);
        let mut sender = match self.pool.checkout(cluster, &key) {
            Some(sender) => {
                tracing::trace!(cluster = %cluster.name, target = %key.target, "Reusing connection");
                sender
            }
            None => {
                tracing::trace!(cluster = %cluster.name, target = %key.target, "Connecting");
                connect(cluster, &key.target, key.server_name.as_deref(), &self.tls).await?
            }
        };
        let rsp = sender.send(req, cluster.is_tls()).await?;
        self.pool.checkin(cluster, key, sender);
        Ok(rsp)
    }

    /// Drops round-robin positions and idle connections of clusters that are
    /// no longer configured.
    pub(crate) fn retain(&self, clusters: &HashSet<String>) {
        self.cursors.lock().retain(|name, _| clusters.contains(name));
        self.pool.retain(clusters);
    }

    fn select_endpoint(&self, cluster: &Cluster) -> Result<Target, Error> {
        match &cluster.endpoints {
            Endpoints::ExternalName { host, port } => Ok(Target::Name {
                host: host.clone(),
                port: *port,
            }),
            Endpoints::Static(endpoints) => {
                let healthy = endpoints
                    .iter()
                    .filter(|e| self.health.is_healthy(&cluster.name, e.addr))
                    .collect::<Vec<_>>();
                if healthy.is_empty() {
                    return Err(Error::NoHealthyEndpoints(cluster.name.clone()));
                }
                let mut cursors = self.cursors.lock();
                let cursor = cursors.entry(cluster.name.clone()).or_default();
                let endpoint = healthy[*cursor % healthy.len()];
                *cursor = cursor.wrapping_add(1);
                Ok(Target::Addr(endpoint.addr))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use hyper::service::service_fn;
    use hyper_util::rt::{TokioExecutor, TokioIo};
    use ingress_controller_core::{Endpoint, ServiceRef, UpstreamProtocol};
    use rand::{rngs::StdRng, SeedableRng};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    fn cluster(name: &str, endpoints: Endpoints) -> Arc<Cluster> {
        Arc::new(Cluster {
            name: name.to_string(),
            service: ServiceRef {
                namespace: "ns".to_string(),
                name: name.to_string(),
                port: 80,
            },
            protocol: UpstreamProtocol::Http1,
            endpoints,
            validation: None,
            health_check: None,
        })
    }

    fn backend(name: &str, weight: u32) -> Backend {
        Backend {
            cluster: cluster(name, Endpoints::Static(vec![])),
            weight,
            request_headers: Default::default(),
            response_headers: Default::default(),
            cookie_rewrites: vec![],
        }
    }

    #[test]
    fn zero_weights_are_never_selected() {
        let mut rng = StdRng::seed_from_u64(7);
        let backends = vec![backend("a", 0), backend("b", 1)];
        for _ in 0..100 {
            let selected = select_backend(&backends, &mut rng).unwrap();
            assert_eq!(selected.cluster.name, "b");
        }
        assert!(select_backend(&[backend("a", 0)], &mut rng).is_none());
    }

    #[test]
    fn weights_split_traffic() {
        let mut rng = StdRng::seed_from_u64(7);
        let backends = vec![backend("a", 80), backend("b", 20)];
        let a = (0..10_000)
            .filter(|_| select_backend(&backends, &mut rng).unwrap().cluster.name == "a")
            .count();
        assert!((7_500..8_500).contains(&a), "{a}");
    }

    #[test]
    fn endpoints_are_selected_round_robin() {
        let upstream = Upstream::default();
        let endpoints = (1..=3)
            .map(|i| Endpoint {
                addr: format!("10.0.0.{i}:8080").parse().unwrap(),
                pod: None,
            })
            .collect::<Vec<_>>();
        let cluster = cluster("svc", Endpoints::Static(endpoints.clone()));
        let selected = (0..6)
            .map(|_| upstream.select_endpoint(&cluster).unwrap())
            .collect::<Vec<_>>();
        let expected = endpoints
            .iter()
            .chain(&endpoints)
            .map(|e| Target::Addr(e.addr))
            .collect::<Vec<_>>();
        assert_eq!(selected, expected);
    }

    #[test]
    fn removed_clusters_are_forgotten() {
        let upstream = Upstream::default();
        let endpoints = Endpoints::Static(vec![Endpoint {
            addr: "10.0.0.1:8080".parse().unwrap(),
            pod: None,
        }]);
        for name in ["kept", "removed"] {
            upstream
                .select_endpoint(&cluster(name, endpoints.clone()))
                .unwrap();
        }
        assert_eq!(upstream.cursors.lock().len(), 2);

        upstream.retain(&["kept".to_string()].into_iter().collect());
        let cursors = upstream.cursors.lock();
        assert_eq!(cursors.len(), 1);
        assert!(cursors.contains_key("kept"));
    }

    /// Serves `200 OK` over the given protocol and counts accepted connections.
    async fn server(http2: bool) -> (std::net::SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let count = accepted.clone();
        tokio::spawn(async move {
            loop {
                let (tcp, _) = listener.accept().await.unwrap();
                count.fetch_add(1, Ordering::SeqCst);
                let svc = service_fn(|_: Request<Incoming>| async {
                    Ok::<_, std::convert::Infallible>(Response::new(Full::<Bytes>::default()))
                });
                let io = TokioIo::new(tcp);
                if http2 {
                    tokio::spawn(
                        hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                            .serve_connection(io, svc),
                    );
                } else {
                    tokio::spawn(hyper::server::conn::http1::Builder::new().serve_connection(io, svc));
                }
            }
        });
        (addr, accepted)
    }

    async fn send_all(upstream: &Upstream, cluster: &Arc<Cluster>, n: usize) {
        for _ in 0..n {
            let req = Request::get("/")
                .header(http::header::HOST, "example.com")
                .body(Full::default())
                .unwrap();
            let rsp = upstream.send(cluster, req, None).await.unwrap();
            assert_eq!(rsp.status(), http::StatusCode::OK);
            rsp.into_body().collect().await.unwrap();
            // Let the connection task return to idle.
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn connections_are_reused() {
        for (protocol, http2) in [(UpstreamProtocol::Http1, false), (UpstreamProtocol::H2c, true)] {
            let (addr, accepted) = server(http2).await;
            let cluster = Arc::new(Cluster {
                protocol,
                ..(*cluster("svc", Endpoints::Static(vec![Endpoint { addr, pod: None }]))).clone()
            });
            let upstream = Upstream::default();

            send_all(&upstream, &cluster, 3).await;
            assert_eq!(accepted.load(Ordering::SeqCst), 1, "{protocol:?}");
            assert_eq!(upstream.pool.len(), 1, "{protocol:?}");

            upstream.retain(&HashSet::default());
            assert_eq!(upstream.pool.len(), 0, "{protocol:?}");
            send_all(&upstream, &cluster, 1).await;
            assert_eq!(accepted.load(Ordering::SeqCst), 2, "{protocol:?}");
        }
    }

    #[tokio::test]
    async fn changed_clusters_reconnect() {
        let (addr, accepted) = server(false).await;
        let endpoints = Endpoints::Static(vec![Endpoint { addr, pod: None }]);
        let upstream = Upstream::default();

        send_all(&upstream, &cluster("svc", endpoints.clone()), 1).await;
        let mut changed = (*cluster("svc", endpoints)).clone();
        changed.service.port = 8080;
        send_all(&upstream, &Arc::new(changed), 1).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn no_endpoints() {
        let upstream = Upstream::default();
        let cluster = cluster("svc", Endpoints::Static(vec![]));
        assert!(matches!(
            upstream.select_endpoint(&cluster),
            Err(Error::NoHealthyEndpoints(_))
        ));
    }
}
