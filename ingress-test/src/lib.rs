#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod client;
pub mod fixtures;
pub mod pki;
pub mod poll;
pub mod resources;

use self::{
    client::{Request, Response, TlsClient},
    fixtures::{Pod, Workload},
    pki::{Issuer, Leaf},
};
use ingress_controller_k8s_api::{
    self as k8s, validation::FieldErrors, HttpProxy, Resource,
};
use ingress_controller_k8s_index::{
    ConfigMetrics, Index, ProxyStatus, SecretRef, Settings, SharedIndex,
};
use ingress_controller_proxy::{self as proxy, InMemoryRateLimitService, Proxy, ProxyMetrics};
use kubert::index::IndexNamespacedResource;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::net::TcpListener;
use tracing::Instrument;

/// Controller settings a scenario runs with.
#[derive(Clone, Debug, Default)]
pub struct HarnessConfig {
    pub ingress_class_name: Option<String>,
    /// The name of a TLS secret, in the scenario's namespace, served to
    /// clients that send no SNI.
    pub fallback_certificate: Option<String>,
    /// Global rate limit rules, in the rate limit service's YAML format.
    pub global_ratelimits: Option<String>,
    pub num_trusted_hops: usize,
    pub disable_compression: bool,
}

/// A controller and data plane running in-process, fed directly through the
/// index rather than through a cluster watch.
pub struct Harness {
    pub namespace: String,
    pub index: SharedIndex,
    pub http_addr: SocketAddr,
    pub https_addr: SocketAddr,
    /// The authority that issues every certificate in the scenario.
    pub ca: Issuer,
    pods: Mutex<HashMap<String, Vec<Pod>>>,
    next_pod: AtomicUsize,
    _signal: drain::Signal,
}

/// Resources the harness can create. Proxies are validated the way the API
/// server's schema validation would before they reach the index.
pub trait Admit: Resource + Sized {
    fn admit(&self) -> Result<(), FieldErrors> {
        Ok(())
    }
}

impl Admit for HttpProxy {
    fn admit(&self) -> Result<(), FieldErrors> {
        k8s::validation::validate(&self.spec)
    }
}

impl Admit for k8s::Service {}
impl Admit for k8s::EndpointSlice {}
impl Admit for k8s::Secret {}

/// Runs `test` against a fresh harness in a random namespace.
pub async fn with_harness<F, Fut>(test: F)
where
    F: FnOnce(Arc<Harness>) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    with_harness_config(HarnessConfig::default(), test).await
}

pub async fn with_harness_config<F, Fut>(config: HarnessConfig, test: F)
where
    F: FnOnce(Arc<Harness>) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let _tracing = init_tracing();

    let namespace = format!("ingress-test-{}", random_suffix(6));
    tracing::debug!(%namespace, "Starting harness");
    let harness = Arc::new(Harness::start(namespace.clone(), config).await);

    tracing::trace!("spawning");
    let test = test(harness.clone());
    let res = tokio::spawn(test.instrument(tracing::info_span!("test", %namespace))).await;
    if res.is_err() {
        // If the test failed, stop tracing so the log is not polluted with more information about
        // cleanup after the failure was printed.
        drop(_tracing);
    }

    tracing::debug!(%namespace, "Stopping harness");
    drop(harness);
    if let Err(err) = res {
        std::panic::resume_unwind(err.into_panic());
    }
}

// === impl Harness ===

impl Harness {
    async fn start(namespace: String, config: HarnessConfig) -> Self {
        let settings = Settings {
            ingress_class_name: config.ingress_class_name,
            fallback_certificate: config.fallback_certificate.map(|name| SecretRef {
                namespace: namespace.clone(),
                name,
            }),
        };
        let index = Index::shared(settings, ConfigMetrics::default());

        let global = config.global_ratelimits.map(|yaml| {
            let service = InMemoryRateLimitService::from_yaml(&yaml)
                .expect("rate limit config must be valid");
            Arc::new(service) as Arc<dyn proxy::RateLimitService>
        });
        let proxy = Proxy::new(
            index.read().config_rx(),
            proxy::Settings {
                num_trusted_hops: config.num_trusted_hops,
                compression: !config.disable_compression,
                ..Default::default()
            },
            global,
            ProxyMetrics::default(),
        );

        let (signal, drain) = drain::channel();
        let http = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("HTTP listener must bind");
        let https = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("HTTPS listener must bind");
        let http_addr = http.local_addr().expect("listener must have an address");
        let https_addr = https.local_addr().expect("listener must have an address");
        tokio::spawn(proxy.clone().serve_http(http, drain.clone()));
        tokio::spawn(proxy.clone().serve_https(https, drain));
        tokio::spawn(proxy.run_background());

        Self {
            ca: Issuer::root(&format!("{namespace} root")),
            namespace,
            index,
            http_addr,
            https_addr,
            pods: Mutex::new(HashMap::new()),
            next_pod: AtomicUsize::new(0),
            _signal: signal,
        }
    }

    /// Applies a resource to the index, defaulting its namespace to the
    /// scenario's.
    ///
    /// Panics if the resource would be rejected at admission.
    pub fn create<T>(&self, resource: T)
    where
        T: Admit,
        Index: IndexNamespacedResource<T>,
    {
        if let Err(errors) = self.try_create(resource) {
            panic!("resource must be admitted: {errors}");
        }
    }

    pub fn try_create<T>(&self, mut resource: T) -> Result<(), FieldErrors>
    where
        T: Admit,
        Index: IndexNamespacedResource<T>,
    {
        resource.admit()?;
        let meta = resource.meta_mut();
        meta.namespace.get_or_insert_with(|| self.namespace.clone());
        meta.generation.get_or_insert(1);
        self.index.write().apply(resource);
        Ok(())
    }

    /// Applies a new version of a resource, bumping its generation.
    pub fn update<T>(&self, mut resource: T)
    where
        T: Admit,
        Index: IndexNamespacedResource<T>,
    {
        let meta = resource.meta_mut();
        meta.generation = Some(meta.generation.unwrap_or(1) + 1);
        self.create(resource)
    }

    pub fn delete<T>(&self, name: &str)
    where
        Index: IndexNamespacedResource<T>,
    {
        IndexNamespacedResource::<T>::delete(
            &mut *self.index.write(),
            self.namespace.clone(),
            name.to_string(),
        );
    }

    /// The published status of a proxy in the scenario's namespace.
    pub fn status(&self, name: &str) -> Option<ProxyStatus> {
        let id = ingress_controller_core::ProxyRef::new(&self.namespace, name);
        let statuses = self.index.read().statuses_rx();
        let status = statuses.borrow().get(&id).cloned();
        status
    }

    pub async fn await_status(&self, name: &str) -> ProxyStatus {
        poll::poll(poll::DEFAULT_INTERVAL, poll::DEFAULT_TIMEOUT, || async move {
            self.status(name)
                .ok_or_else(|| format!("no status for {name}"))
        })
        .await
        .unwrap_or_else(|error| panic!("{error}"))
    }

    /// Waits for a proxy to be reported valid, panicking with its errors
    /// otherwise.
    pub async fn await_valid(&self, name: &str) -> ProxyStatus {
        poll::poll(poll::DEFAULT_INTERVAL, poll::DEFAULT_TIMEOUT, || async move {
            match self.status(name) {
                Some(status) if status.is_valid() => Ok(status),
                Some(status) => Err(format!("{name} is invalid: {:?}", status.errors)),
                None => Err(format!("no status for {name}")),
            }
        })
        .await
        .unwrap_or_else(|error| panic!("{error}"))
    }

    /// Deploys a service backed by a single echo pod.
    pub async fn deploy_echo(&self, service: &str) {
        self.deploy(service, 1, Workload::Echo, None).await
    }

    pub async fn deploy_echo_replicas(&self, service: &str, replicas: usize) {
        self.deploy(service, replicas, Workload::Echo, None).await
    }

    /// Deploys an echo service whose pod serves TLS with a certificate for
    /// `subject`.
    pub async fn deploy_echo_tls(&self, service: &str, subject: &str) {
        let leaf = self.ca.server(&[subject]);
        self.deploy(service, 1, Workload::Echo, Some(leaf)).await
    }

    pub async fn deploy_authz(&self, service: &str) {
        self.deploy(service, 1, Workload::Authz, None).await
    }

    pub async fn deploy_grpc(&self, service: &str) {
        self.deploy(service, 1, Workload::Grpc, None).await
    }

    /// Creates a service without any endpoints.
    pub fn deploy_empty(&self, service: &str) {
        self.create(resources::service(&self.namespace, service));
    }

    /// Creates an `ExternalName` service pointing at the first pod of
    /// `target`, returning the port routes must use to reach it.
    pub fn deploy_external_name(&self, service: &str, target: &str) -> u16 {
        let port = self.pod_addrs(target)[0].port();
        self.create(resources::external_name(
            &self.namespace,
            service,
            "127.0.0.1",
            port,
        ));
        port
    }

    async fn deploy(&self, service: &str, replicas: usize, workload: Workload, tls: Option<Leaf>) {
        self.create(resources::service(&self.namespace, service));
        for _ in 0..replicas {
            let pod = self.spawn_pod(service, workload.clone(), tls.as_ref()).await;
            self.add_pod(service, pod);
        }
    }

    async fn spawn_pod(&self, service: &str, workload: Workload, tls: Option<&Leaf>) -> Pod {
        let n = self.next_pod.fetch_add(1, Ordering::Relaxed);
        Pod::spawn(
            &self.namespace,
            service,
            format!("{service}-{n}"),
            workload,
            tls.map(Leaf::server_config),
        )
        .await
    }

    fn add_pod(&self, service: &str, pod: Pod) {
        self.create(resources::endpoint_slice(
            &self.namespace,
            service,
            &pod.name,
            pod.addr.port(),
        ));
        self.pods
            .lock()
            .entry(service.to_string())
            .or_default()
            .push(pod);
    }

    /// Replaces the first pod of an echo service with a new one on a
    /// different port, returning the new pod's name.
    pub async fn restart_pod(&self, service: &str) -> String {
        let old = {
            let mut pods = self.pods.lock();
            let pods = pods
                .get_mut(service)
                .filter(|pods| !pods.is_empty())
                .unwrap_or_else(|| panic!("{service} has no pods"));
            pods.remove(0)
        };
        self.delete::<k8s::EndpointSlice>(&old.name);
        tracing::debug!(pod = %old.name, "Stopping pod");
        drop(old);

        let pod = self.spawn_pod(service, Workload::Echo, None).await;
        let name = pod.name.clone();
        self.add_pod(service, pod);
        name
    }

    pub fn pod_names(&self, service: &str) -> Vec<String> {
        self.pods
            .lock()
            .get(service)
            .map(|pods| pods.iter().map(|p| p.name.clone()).collect())
            .unwrap_or_default()
    }

    fn pod_addrs(&self, service: &str) -> Vec<SocketAddr> {
        self.pods
            .lock()
            .get(service)
            .map(|pods| pods.iter().map(|p| p.addr).collect())
            .unwrap_or_default()
    }

    /// Issues a serving certificate for `hosts` and stores it in a TLS
    /// secret.
    pub fn tls_secret(&self, name: &str, hosts: &[&str]) -> Leaf {
        let leaf = self.ca.server(hosts);
        self.create(resources::tls_secret(
            &self.namespace,
            name,
            leaf.chain_pem(),
            leaf.key_pem(),
        ));
        leaf
    }

    pub fn ca_secret(&self, name: &str, ca_pem: String) {
        self.create(resources::ca_secret(&self.namespace, name, ca_pem));
    }

    pub fn crl_secret(&self, name: &str, crl_pem: String) {
        self.create(resources::crl_secret(&self.namespace, name, crl_pem));
    }

    /// Sends a plaintext request, panicking if no response is received.
    pub async fn http(&self, req: Request) -> Response {
        client::send(self.http_addr, &req)
            .await
            .unwrap_or_else(|error| panic!("request failed: {error:#}"))
    }

    pub async fn https(&self, tls: &TlsClient, req: Request) -> Response {
        client::send_tls(self.https_addr, tls, &req)
            .await
            .unwrap_or_else(|error| panic!("request failed: {error:#}"))
    }

    /// Sends a plaintext request until `check` accepts the response.
    pub async fn http_until(&self, req: Request, check: impl Fn(&Response) -> bool) -> Response {
        let (req, check) = (&req, &check);
        let res = poll::poll(poll::DEFAULT_INTERVAL, poll::DEFAULT_TIMEOUT, || async move {
            let rsp = client::send(self.http_addr, req)
                .await
                .map_err(|error| format!("{error:#}"))?;
            if check(&rsp) {
                Ok(rsp)
            } else {
                Err(format!("{} {}", rsp.status, rsp.text()))
            }
        })
        .await;
        res.unwrap_or_else(|error| panic!("{error}"))
    }

    pub async fn https_until(
        &self,
        tls: &TlsClient,
        req: Request,
        check: impl Fn(&Response) -> bool,
    ) -> Response {
        let (req, check) = (&req, &check);
        let res = poll::poll(poll::DEFAULT_INTERVAL, poll::DEFAULT_TIMEOUT, || async move {
            let rsp = client::send_tls(self.https_addr, tls, req)
                .await
                .map_err(|error| format!("{error:#}"))?;
            if check(&rsp) {
                Ok(rsp)
            } else {
                Err(format!("{} {}", rsp.status, rsp.text()))
            }
        })
        .await;
        res.unwrap_or_else(|error| panic!("{error}"))
    }
}

pub fn random_suffix(len: usize) -> String {
    use rand::Rng;

    let rng = &mut rand::thread_rng();
    (0..len)
        .map(|_| rng.sample(LowercaseAlphanumeric) as char)
        .collect()
}

fn init_tracing() -> tracing::subscriber::DefaultGuard {
    tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "ingress=trace,debug".parse().unwrap()),
            )
            .finish(),
    )
}

struct LowercaseAlphanumeric;

impl rand::distributions::Distribution<u8> for LowercaseAlphanumeric {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> u8 {
        const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
        CHARSET[rng.gen_range(0..CHARSET.len())]
    }
}
