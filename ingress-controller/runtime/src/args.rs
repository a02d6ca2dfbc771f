use crate::{
    index::{self, SecretRef},
    k8s::{self, watcher, Client, HttpProxy, Resource},
    lease,
    proxy::{self, InMemoryRateLimitService, Proxy, ProxyMetrics, RateLimitService},
    status,
    tee::Tee,
};
use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::{net::TcpListener, sync::mpsc, time::Duration};
use tracing::{info, info_span, Instrument};

const RECONCILIATION_PERIOD: Duration = Duration::from_secs(10);

// The maximum number of status patches to buffer. Sending a patch takes at
// least 1ms, so the buffer holds a reconciliation period's worth of patches.
const STATUS_UPDATE_QUEUE_SIZE: usize = RECONCILIATION_PERIOD.as_millis() as usize;

#[derive(Debug, Parser)]
#[clap(name = "ingress", about = "An HTTPProxy ingress controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "ingress=info,warn",
        env = "INGRESS_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, default_value = "0.0.0.0:8080")]
    http_addr: SocketAddr,

    #[clap(long, default_value = "0.0.0.0:8443")]
    https_addr: SocketAddr,

    /// Only proxies with this ingress class are served. Without it, proxies
    /// with no class or the default class are served.
    #[clap(long)]
    ingress_class_name: Option<String>,

    /// The `namespace/name` of the Secret served to TLS clients that send no
    /// server name.
    #[clap(long)]
    fallback_certificate: Option<SecretRef>,

    /// A YAML file of global rate limit descriptors. Global rate limits are
    /// not enforced without it.
    #[clap(long)]
    global_ratelimit_config: Option<PathBuf>,

    #[clap(long, default_value = "ingress")]
    ratelimit_domain: String,

    /// The number of proxies in front of this one whose `X-Forwarded-For`
    /// entries are trusted.
    #[clap(long, default_value = "0")]
    num_trusted_hops: usize,

    #[clap(long, value_enum, default_value = "gzip")]
    compression: Compression,

    #[clap(long, default_value = "ingress")]
    controller_namespace: String,

    #[clap(long, default_value = "ingress-controller")]
    controller_deployment_name: String,

    #[clap(long, default_value = "5000")]
    patch_timeout_ms: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Compression {
    Gzip,
    Disabled,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            http_addr,
            https_addr,
            ingress_class_name,
            fallback_certificate,
            global_ratelimit_config,
            ratelimit_domain,
            num_trusted_hops,
            compression,
            controller_namespace,
            controller_deployment_name,
            patch_timeout_ms,
        } = self;

        let global_limits = match global_ratelimit_config {
            Some(path) => {
                let yaml = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let service = InMemoryRateLimitService::from_yaml(&yaml)
                    .with_context(|| format!("invalid rate limit config {}", path.display()))?;
                Some(Arc::new(service) as Arc<dyn RateLimitService>)
            }
            None => None,
        };

        let mut prom = <Registry>::default();
        let config_metrics = index::ConfigMetrics::register(prom.sub_registry_with_prefix("config"));

        // Build the index that compiles resources into the routing config.
        let ingress_index = index::Index::shared(
            index::Settings {
                ingress_class_name,
                fallback_certificate,
            },
            config_metrics,
        );
        let index_metrics =
            index::IndexMetrics::register(ingress_index.clone(), prom.sub_registry_with_prefix("index"))
                .shared();

        let resource_status = prom.sub_registry_with_prefix("resource_status");
        let status_metrics = status::ControllerMetrics::register(resource_status);
        let status_index_metrics = status::IndexMetrics::register(resource_status);

        let proxy_metrics = ProxyMetrics::register(prom.sub_registry_with_prefix("proxy"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let hostname =
            std::env::var("HOSTNAME").context("failed to read the HOSTNAME environment variable")?;

        let claims = lease::init(
            &runtime,
            &controller_namespace,
            &controller_deployment_name,
            &hostname,
        )
        .await?;

        // Build the status index which diffs compiled statuses against the
        // observed ones and queues patches.
        let (updates_tx, updates_rx) = mpsc::channel(STATUS_UPDATE_QUEUE_SIZE);
        let status_index = status::Index::shared(
            hostname.clone(),
            claims.clone(),
            updates_tx,
            status_index_metrics,
        );

        if !api_resource_exists::<HttpProxy>(&runtime.client()).await {
            bail!("httpproxies.ingress.io resource kind not found");
        }

        // Spawn resource watches.

        let proxies = runtime.watch_all::<HttpProxy>(watcher::Config::default());
        let proxies_indexes = Tee::shared(index_metrics.clone(), status_index.clone());
        tokio::spawn(
            kubert::index::namespaced(proxies_indexes, proxies)
                .instrument(info_span!("httpproxies")),
        );

        let services = runtime.watch_all::<k8s::Service>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index_metrics.clone(), services)
                .instrument(info_span!("services")),
        );

        let endpoint_slices = runtime.watch_all::<k8s::EndpointSlice>(
            watcher::Config::default().labels(k8s::SERVICE_NAME_LABEL),
        );
        tokio::spawn(
            kubert::index::namespaced(index_metrics.clone(), endpoint_slices)
                .instrument(info_span!("endpointslices")),
        );

        let secrets = runtime.watch_all::<k8s::Secret>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index_metrics, secrets).instrument(info_span!("secrets")),
        );

        // Spawn the status reconciliation and the writer that applies its
        // patches while this replica holds the lease.
        let statuses = ingress_index.read().statuses_rx();
        tokio::spawn(
            status::Index::run(status_index, statuses, RECONCILIATION_PERIOD)
                .instrument(info_span!("status_index")),
        );

        let status_controller = status::Controller::new(
            claims,
            runtime.client(),
            hostname,
            updates_rx,
            Duration::from_millis(patch_timeout_ms),
            status_metrics,
        );
        tokio::spawn(
            status_controller
                .run()
                .instrument(info_span!("status_controller")),
        );

        // Serve traffic from the compiled config.
        let config = ingress_index.read().config_rx();
        let proxy = Proxy::new(
            config,
            proxy::Settings {
                num_trusted_hops,
                compression: compression == Compression::Gzip,
                ratelimit_domain,
            },
            global_limits,
            proxy_metrics,
        );

        let http = TcpListener::bind(http_addr)
            .await
            .with_context(|| format!("failed to bind {http_addr}"))?;
        let https = TcpListener::bind(https_addr)
            .await
            .with_context(|| format!("failed to bind {https_addr}"))?;
        info!(%http_addr, %https_addr, "Proxy listening");

        tokio::spawn(
            proxy
                .clone()
                .serve_http(http, runtime.shutdown_handle()),
        );
        tokio::spawn(
            proxy
                .clone()
                .serve_https(https, runtime.shutdown_handle()),
        );
        tokio::spawn(proxy.run_background());

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

async fn api_resource_exists<T>(client: &Client) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    client
        .list_api_group_resources(&T::api_version(&dt))
        .await
        .ok()
        .iter()
        .flat_map(|r| r.resources.iter())
        .any(|r| r.kind == T::kind(&dt))
}
