use super::connect::{connect, Target};
use crate::tls::ClientConfigs;
use ahash::AHashMap as HashMap;
use http::{header, Request};
use http_body_util::Full;
use ingress_controller_core::{
    retry::HealthCheckPolicy, Cluster, Config, Endpoints, RouteAction,
};
use parking_lot::RwLock;
use std::{net::SocketAddr, sync::Arc};
use tokio::{sync::watch, task::JoinHandle, time};
use tracing::{info_span, Instrument};

type States = Arc<RwLock<HashMap<(String, SocketAddr), bool>>>;

/// Active HTTP health checks of every cluster that configures them.
///
/// Endpoints are healthy until they fail `unhealthy_threshold` consecutive
/// checks, and recover after `healthy_threshold` consecutive successes.
#[derive(Clone, Debug, Default)]
pub struct HealthChecks {
    states: States,
}

// === impl HealthChecks ===

impl HealthChecks {
    pub(crate) fn is_healthy(&self, cluster: &str, addr: SocketAddr) -> bool {
        self.states
            .read()
            .get(&(cluster.to_string(), addr))
            .copied()
            .unwrap_or(true)
    }

    /// Keeps one checker task per health checked cluster until the config
    /// publisher is dropped.
    pub(crate) async fn run(
        self,
        mut config: watch::Receiver<Arc<Config>>,
        tls: Arc<ClientConfigs>,
    ) {
        let mut checkers = HashMap::<String, (Arc<Cluster>, JoinHandle<()>)>::default();
        loop {
            let clusters = health_checked(&config.borrow_and_update());

            let mut stale = Vec::new();
            checkers.retain(|name, (cluster, task)| {
                let keep = clusters.get(name).is_some_and(|c| **c == **cluster);
                if !keep {
                    task.abort();
                    stale.push(name.clone());
                }
                keep
            });
            if !stale.is_empty() {
                self.states
                    .write()
                    .retain(|(name, _), _| !stale.contains(name));
            }

            for (name, cluster) in clusters {
                if checkers.contains_key(&name) {
                    continue;
                }
                let Some(policy) = cluster.health_check.clone() else {
                    continue;
                };
                tracing::debug!(cluster = %name, "Starting health checks");
                let task = tokio::spawn(
                    check(cluster.clone(), policy, self.states.clone(), tls.clone())
                        .instrument(info_span!("health", cluster = %name)),
                );
                checkers.insert(name, (cluster, task));
            }

            if config.changed().await.is_err() {
                break;
            }
        }

        for (_, (_, task)) in checkers {
            task.abort();
        }
    }
}

fn health_checked(config: &Config) -> HashMap<String, Arc<Cluster>> {
    let mut clusters = HashMap::default();
    for vhost in config.vhosts.iter() {
        for route in vhost.routes() {
            let RouteAction::Forward(backends) = &route.action else {
                continue;
            };
            for backend in backends {
                if backend.cluster.health_check.is_some() {
                    clusters.insert(backend.cluster.name.clone(), backend.cluster.clone());
                }
            }
        }
    }
    clusters
}

async fn check(
    cluster: Arc<Cluster>,
    policy: HealthCheckPolicy,
    states: States,
    tls: Arc<ClientConfigs>,
) {
    let Endpoints::Static(endpoints) = &cluster.endpoints else {
        return;
    };

    // Consecutive (successes, failures) per endpoint.
    let mut counts = HashMap::<SocketAddr, (u32, u32)>::default();
    let mut interval = time::interval(policy.interval);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        for endpoint in endpoints {
            let ok = check_endpoint(&cluster, endpoint.addr, &policy, &tls).await;
            let (successes, failures) = counts.entry(endpoint.addr).or_default();
            if ok {
                *successes += 1;
                *failures = 0;
            } else {
                *failures += 1;
                *successes = 0;
            }

            let key = (cluster.name.clone(), endpoint.addr);
            let healthy = states.read().get(&key).copied().unwrap_or(true);
            if healthy && *failures >= policy.unhealthy_threshold {
                tracing::info!(endpoint = %endpoint.addr, "Endpoint is unhealthy");
                states.write().insert(key, false);
            } else if !healthy && *successes >= policy.healthy_threshold {
                tracing::info!(endpoint = %endpoint.addr, "Endpoint is healthy");
                states.write().insert(key, true);
            }
        }
    }
}

async fn check_endpoint(
    cluster: &Arc<Cluster>,
    addr: SocketAddr,
    policy: &HealthCheckPolicy,
    tls: &ClientConfigs,
) -> bool {
    let Ok(req) = Request::get(policy.path.as_str())
        .header(header::HOST, policy.host.as_str())
        .header(header::USER_AGENT, "ingress-healthcheck")
        .body(Full::default())
    else {
        return false;
    };

    let rsp = time::timeout(policy.timeout, async {
        connect(cluster, &Target::Addr(addr), None, tls)
            .await?
            .send(req, cluster.is_tls())
            .await
    })
    .await;
    match rsp {
        Ok(Ok(rsp)) => rsp.status().is_success(),
        Ok(Err(error)) => {
            tracing::debug!(endpoint = %addr, %error, "Health check failed");
            false
        }
        Err(_) => {
            tracing::debug!(endpoint = %addr, "Health check timed out");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingress_controller_core::{Endpoint, ServiceRef, UpstreamProtocol};
    use tokio::net::TcpListener;

    fn cluster(addr: SocketAddr) -> Arc<Cluster> {
        Arc::new(Cluster {
            name: "ns/svc:80".to_string(),
            service: ServiceRef {
                namespace: "ns".to_string(),
                name: "svc".to_string(),
                port: 80,
            },
            protocol: UpstreamProtocol::Http1,
            endpoints: Endpoints::Static(vec![Endpoint { addr, pod: None }]),
            validation: None,
            health_check: Some(HealthCheckPolicy {
                interval: time::Duration::from_millis(10),
                timeout: time::Duration::from_millis(100),
                unhealthy_threshold: 2,
                healthy_threshold: 1,
                ..Default::default()
            }),
        })
    }

    #[tokio::test]
    async fn refused_connections_mark_endpoints_unhealthy() {
        // Bind and drop a listener to find a port that refuses connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let checks = HealthChecks::default();
        let cluster = cluster(addr);
        assert!(checks.is_healthy(&cluster.name, addr));

        let policy = cluster.health_check.clone().unwrap();
        let task = tokio::spawn(check(
            cluster.clone(),
            policy,
            checks.states.clone(),
            Default::default(),
        ));

        time::timeout(time::Duration::from_secs(5), async {
            while checks.is_healthy(&cluster.name, addr) {
                time::sleep(time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("endpoint must become unhealthy");
        task.abort();
    }
}
