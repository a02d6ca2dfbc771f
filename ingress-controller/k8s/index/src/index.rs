use crate::{
    compile::{compile, Statuses},
    metrics::{ConfigMetrics, SizedIndex},
    secrets::SecretIndex,
    services::ServiceIndex,
};
use ahash::AHashMap as HashMap;
use anyhow::{bail, Result};
use ingress_controller_core::{Config, ProxyRef};
use ingress_controller_k8s_api::{self as k8s, HttpProxy, ResourceExt};
use kubert::index::NamespacedRemoved;
use parking_lot::RwLock;
use std::{str::FromStr, sync::Arc};
use tokio::sync::watch;

pub type SharedIndex = Arc<RwLock<Index>>;

/// Controller-wide settings that affect compilation.
#[derive(Clone, Debug, Default)]
pub struct Settings {
    /// Proxies naming another ingress class are ignored.
    pub ingress_class_name: Option<String>,

    /// The certificate served to TLS clients that send no SNI, for virtual
    /// hosts that enable it.
    pub fallback_certificate: Option<SecretRef>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SecretRef {
    pub namespace: String,
    pub name: String,
}

/// Holds every resource the compiler reads and publishes the compiled
/// config and statuses whenever one of them changes.
#[derive(Debug)]
pub struct Index {
    settings: Settings,
    proxies: HashMap<ProxyRef, HttpProxy>,
    services: ServiceIndex,
    secrets: SecretIndex,
    config_tx: watch::Sender<Arc<Config>>,
    statuses_tx: watch::Sender<Arc<Statuses>>,
    metrics: ConfigMetrics,
}

// === impl SecretRef ===

impl FromStr for SecretRef {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => Ok(Self {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
            _ => bail!("secret reference {s:?} must have the form namespace/name"),
        }
    }
}

// === impl Index ===

impl Index {
    pub fn shared(settings: Settings, metrics: ConfigMetrics) -> SharedIndex {
        let (config_tx, _) = watch::channel(Arc::new(Config::default()));
        let (statuses_tx, _) = watch::channel(Arc::new(Statuses::default()));
        Arc::new(RwLock::new(Self {
            settings,
            proxies: HashMap::default(),
            services: ServiceIndex::default(),
            secrets: SecretIndex::default(),
            config_tx,
            statuses_tx,
            metrics,
        }))
    }

    pub fn config_rx(&self) -> watch::Receiver<Arc<Config>> {
        self.config_tx.subscribe()
    }

    pub fn statuses_rx(&self) -> watch::Receiver<Arc<Statuses>> {
        self.statuses_tx.subscribe()
    }

    /// Recompiles the whole graph and publishes the result.
    fn reindex(&mut self) {
        let compiled = compile(&self.settings, &self.proxies, &self.services, &self.secrets);
        tracing::debug!(
            vhosts = compiled.config.vhosts.len(),
            proxies = compiled.statuses.len(),
            "Compiled config"
        );
        self.metrics.observe(&compiled.config, &compiled.statuses);
        self.config_tx.send_replace(Arc::new(compiled.config));
        self.statuses_tx.send_if_modified(|current| {
            if **current == compiled.statuses {
                return false;
            }
            *current = Arc::new(compiled.statuses);
            true
        });
    }

    fn apply_proxy(&mut self, proxy: HttpProxy) -> bool {
        let id = ProxyRef::new(proxy.namespace().unwrap_or_default(), proxy.name_unchecked());
        if let Some(current) = self.proxies.get(&id) {
            if current.spec == proxy.spec && current.metadata.generation == proxy.metadata.generation
            {
                return false;
            }
        }
        self.proxies.insert(id, proxy);
        true
    }
}

impl kubert::index::IndexNamespacedResource<HttpProxy> for Index {
    fn apply(&mut self, proxy: HttpProxy) {
        if self.apply_proxy(proxy) {
            self.reindex();
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if self
            .proxies
            .remove(&ProxyRef::new(namespace, name))
            .is_some()
        {
            self.reindex();
        }
    }

    fn reset(&mut self, proxies: Vec<HttpProxy>, removed: NamespacedRemoved) {
        let mut changed = false;
        for proxy in proxies {
            changed |= self.apply_proxy(proxy);
        }
        for (namespace, names) in removed {
            for name in names {
                changed |= self
                    .proxies
                    .remove(&ProxyRef::new(&namespace, name))
                    .is_some();
            }
        }
        if changed {
            self.reindex();
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Service> for Index {
    fn apply(&mut self, svc: k8s::Service) {
        if self.services.apply_service(svc) {
            self.reindex();
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if self.services.delete_service(namespace, name) {
            self.reindex();
        }
    }

    fn reset(&mut self, services: Vec<k8s::Service>, removed: NamespacedRemoved) {
        let mut changed = false;
        for svc in services {
            changed |= self.services.apply_service(svc);
        }
        for (namespace, names) in removed {
            for name in names {
                changed |= self.services.delete_service(namespace.clone(), name);
            }
        }
        if changed {
            self.reindex();
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::EndpointSlice> for Index {
    fn apply(&mut self, slice: k8s::EndpointSlice) {
        if self.services.apply_slice(slice) {
            self.reindex();
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if self.services.delete_slice(namespace, name) {
            self.reindex();
        }
    }

    fn reset(&mut self, slices: Vec<k8s::EndpointSlice>, removed: NamespacedRemoved) {
        let mut changed = false;
        for slice in slices {
            changed |= self.services.apply_slice(slice);
        }
        for (namespace, names) in removed {
            for name in names {
                changed |= self.services.delete_slice(namespace.clone(), name);
            }
        }
        if changed {
            self.reindex();
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Secret> for Index {
    fn apply(&mut self, secret: k8s::Secret) {
        if self.secrets.apply(secret) {
            self.reindex();
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if self.secrets.delete(namespace, name) {
            self.reindex();
        }
    }

    fn reset(&mut self, secrets: Vec<k8s::Secret>, removed: NamespacedRemoved) {
        let mut changed = false;
        for secret in secrets {
            changed |= self.secrets.apply(secret);
        }
        for (namespace, names) in removed {
            for name in names {
                changed |= self.secrets.delete(namespace.clone(), name);
            }
        }
        if changed {
            self.reindex();
        }
    }
}

impl SizedIndex<HttpProxy> for Index {
    fn size(&self, namespace: &str) -> usize {
        self.proxies
            .keys()
            .filter(|id| id.namespace == namespace)
            .count()
    }
}

impl SizedIndex<k8s::Service> for Index {
    fn size(&self, namespace: &str) -> usize {
        self.services.service_count(namespace)
    }
}

impl SizedIndex<k8s::EndpointSlice> for Index {
    fn size(&self, namespace: &str) -> usize {
        self.services.slice_count(namespace)
    }
}

impl SizedIndex<k8s::Secret> for Index {
    fn size(&self, namespace: &str) -> usize {
        self.secrets.count(namespace)
    }
}
