use crate::compile::Statuses;
use ingress_controller_core::Config;
use ingress_controller_k8s_api::{CurrentStatus, ResourceExt};
use kubert::index::NamespacedRemoved;
use parking_lot::RwLock;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::sync::Arc;

/// Wraps an index, recording the watch events it processes and the number of
/// resources it holds per namespace.
pub struct IndexMetrics<T> {
    inner: T,
    events: Family<EventLabels, Counter>,
    size: Family<SizeLabels, Gauge>,
}

/// Describes the most recently compiled config.
#[derive(Clone, Debug, Default)]
pub struct ConfigMetrics {
    vhosts: Gauge,
    proxies: Family<StatusLabels, Gauge>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct EventLabels {
    kind: &'static str,
    op: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct SizeLabels {
    kind: &'static str,
    namespace: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct StatusLabels {
    status: &'static str,
}

/// Counts the resources of kind `R` that an index holds in a namespace.
pub trait SizedIndex<R> {
    fn size(&self, namespace: &str) -> usize;
}

// === impl IndexMetrics ===

impl<T> IndexMetrics<T> {
    pub fn register(inner: T, prom: &mut Registry) -> Self {
        let events = Family::default();
        prom.register(
            "events",
            "Count of watch events applied to the index",
            events.clone(),
        );
        let size = Family::default();
        prom.register(
            "size",
            "Gauge of the number of resources in the index",
            size.clone(),
        );
        Self { inner, events, size }
    }

    pub fn shared(self) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(self))
    }
}

impl<T> IndexMetrics<Arc<RwLock<T>>> {
    fn record<R>(&self, op: &'static str, namespaces: impl IntoIterator<Item = String>)
    where
        T: SizedIndex<R>,
        R: kube::Resource<DynamicType = ()>,
    {
        let kind = kind::<R>();
        self.events.get_or_create(&EventLabels { kind, op }).inc();
        let index = self.inner.read();
        for namespace in namespaces {
            let n = index.size(&namespace);
            self.size
                .get_or_create(&SizeLabels { kind, namespace })
                .set(n as i64);
        }
    }
}

fn kind<R: kube::Resource<DynamicType = ()>>() -> &'static str {
    match R::kind(&()).as_ref() {
        "HTTPProxy" => "httpproxy",
        "Service" => "service",
        "EndpointSlice" => "endpointslice",
        "Secret" => "secret",
        _ => "other",
    }
}

impl<R, T> kubert::index::IndexNamespacedResource<R> for IndexMetrics<Arc<RwLock<T>>>
where
    T: SizedIndex<R> + kubert::index::IndexNamespacedResource<R>,
    R: ResourceExt<DynamicType = ()>,
{
    fn apply(&mut self, resource: R) {
        let namespace = resource.namespace().unwrap_or_default();
        self.inner.write().apply(resource);
        self.record::<R>("apply", Some(namespace));
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.inner.write().delete(namespace.clone(), name);
        self.record::<R>("delete", Some(namespace));
    }

    fn reset(&mut self, resources: Vec<R>, removed: NamespacedRemoved) {
        let mut namespaces = resources
            .iter()
            .filter_map(|r| r.namespace())
            .chain(removed.keys().cloned())
            .collect::<Vec<_>>();
        namespaces.sort();
        namespaces.dedup();
        self.inner.write().reset(resources, removed);
        self.record::<R>("reset", namespaces);
    }
}

// === impl ConfigMetrics ===

impl ConfigMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();
        prom.register(
            "virtual_hosts",
            "Gauge of the number of virtual hosts being served",
            metrics.vhosts.clone(),
        );
        prom.register(
            "proxies",
            "Gauge of the number of HTTPProxy resources by status",
            metrics.proxies.clone(),
        );
        metrics
    }

    pub(crate) fn observe(&self, config: &Config, statuses: &Statuses) {
        self.vhosts.set(config.vhosts.len() as i64);
        for current in [
            CurrentStatus::Valid,
            CurrentStatus::Invalid,
            CurrentStatus::Orphaned,
        ] {
            let n = statuses.values().filter(|s| s.current == current).count();
            self.proxies
                .get_or_create(&StatusLabels {
                    status: current.as_str(),
                })
                .set(n as i64);
        }
    }
}
