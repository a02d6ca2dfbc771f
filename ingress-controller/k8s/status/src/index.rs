use ahash::AHashMap as HashMap;
#[cfg(not(test))]
use chrono::offset::Utc;
use chrono::SecondsFormat;
use ingress_controller_core::ProxyRef;
use ingress_controller_k8s_api::{
    self as k8s, status::VALID_CONDITION, CurrentStatus, DetailedCondition, HttpProxy,
    HttpProxyStatus, Resource, ResourceExt, SubCondition,
};
use ingress_controller_k8s_index::{ProxyStatus, Statuses};
use kubert::{index::NamespacedRemoved, lease::Claim};
use parking_lot::RwLock;
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use std::sync::Arc;
use tokio::{
    sync::{mpsc, watch},
    time::{self, Duration, MissedTickBehavior},
};

pub type SharedIndex = Arc<RwLock<Index>>;

/// Tracks the status every proxy carries on the cluster and queues patches
/// for the ones that disagree with the compiled statuses.
pub struct Index {
    name: String,
    claims: watch::Receiver<Arc<Claim>>,
    updates: mpsc::Sender<Update>,

    /// The status last observed on each proxy.
    observed: HashMap<ProxyRef, Option<HttpProxyStatus>>,
    statuses: Arc<Statuses>,

    metrics: IndexMetrics,
}

#[derive(Clone, Debug)]
pub struct IndexMetrics {
    patches_enqueued: Counter,
    patches_dropped: Counter,
}

#[derive(Debug, PartialEq)]
pub struct Update {
    pub id: ProxyRef,
    pub patch: k8s::Patch<serde_json::Value>,
}

// === impl IndexMetrics ===

impl IndexMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let patches_enqueued = Counter::default();
        prom.register(
            "patches_enqueued",
            "Count of status patches enqueued for the status controller",
            patches_enqueued.clone(),
        );

        let patches_dropped = Counter::default();
        prom.register(
            "patches_dropped",
            "Count of status patches dropped because the patch queue was full",
            patches_dropped.clone(),
        );

        Self {
            patches_enqueued,
            patches_dropped,
        }
    }
}

// === impl Index ===

impl Index {
    pub fn shared(
        name: impl ToString,
        claims: watch::Receiver<Arc<Claim>>,
        updates: mpsc::Sender<Update>,
        metrics: IndexMetrics,
    ) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            name: name.to_string(),
            claims,
            updates,
            observed: HashMap::default(),
            statuses: Arc::default(),
            metrics,
        }))
    }

    /// Reconciles on every change of the compiled statuses and, to retry
    /// dropped or failed patches, once per `period`.
    pub async fn run(
        index: SharedIndex,
        mut statuses: watch::Receiver<Arc<Statuses>>,
        period: Duration,
    ) {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                res = statuses.changed() => {
                    if res.is_err() {
                        tracing::debug!("Statuses publisher dropped");
                        return;
                    }
                    let latest = statuses.borrow_and_update().clone();
                    index.write().set_statuses(latest);
                }
                _ = interval.tick() => {
                    index.read().reconcile();
                }
            }
        }
    }

    pub(crate) fn set_statuses(&mut self, statuses: Arc<Statuses>) {
        self.statuses = statuses;
        self.reconcile();
    }

    fn is_leader(&self) -> bool {
        self.claims.borrow().is_current_for(&self.name)
    }

    fn reconcile(&self) {
        if !self.is_leader() {
            tracing::trace!("Not the leader; skipping status reconciliation");
            return;
        }
        for (id, observed) in &self.observed {
            self.reconcile_proxy(id, observed.as_ref());
        }
    }

    fn reconcile_proxy(&self, id: &ProxyRef, observed: Option<&HttpProxyStatus>) {
        // Proxies that are not compiled (e.g. another ingress class) are left
        // untouched.
        let Some(desired) = self.statuses.get(id) else {
            return;
        };
        let status = make_status(desired, observed);
        if observed == Some(&status) {
            return;
        }

        tracing::debug!(namespace = %id.namespace, name = %id.name, status = %desired.current, "Queueing status patch");
        let update = Update {
            id: id.clone(),
            patch: make_patch(&id.name, &status),
        };
        match self.updates.try_send(update) {
            Ok(()) => {
                self.metrics.patches_enqueued.inc();
            }
            Err(mpsc::error::TrySendError::Full(update)) => {
                self.metrics.patches_dropped.inc();
                tracing::warn!(namespace = %update.id.namespace, name = %update.id.name, "Status patch queue is full");
            }
            Err(mpsc::error::TrySendError::Closed(update)) => {
                tracing::error!(namespace = %update.id.namespace, name = %update.id.name, "Status controller has stopped");
            }
        }
    }

    fn observe(&mut self, proxy: HttpProxy) -> Option<ProxyRef> {
        let id = ProxyRef::new(proxy.namespace().unwrap_or_default(), proxy.name_unchecked());
        let status = proxy.status;
        if self.observed.get(&id) == Some(&status) {
            return None;
        }
        self.observed.insert(id.clone(), status);
        Some(id)
    }
}

impl kubert::index::IndexNamespacedResource<HttpProxy> for Index {
    fn apply(&mut self, proxy: HttpProxy) {
        if let Some(id) = self.observe(proxy) {
            if self.is_leader() {
                self.reconcile_proxy(&id, self.observed.get(&id).and_then(Option::as_ref));
            }
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.observed.remove(&ProxyRef::new(namespace, name));
    }

    fn reset(&mut self, proxies: Vec<HttpProxy>, removed: NamespacedRemoved) {
        for (namespace, names) in removed {
            for name in names {
                self.observed.remove(&ProxyRef::new(&namespace, name));
            }
        }
        for proxy in proxies {
            self.observe(proxy);
        }
        self.reconcile();
    }
}

/// Builds the status a proxy should carry.
///
/// The `Valid` condition keeps its transition time from `observed` unless its
/// status flips.
pub fn make_status(desired: &ProxyStatus, observed: Option<&HttpProxyStatus>) -> HttpProxyStatus {
    let status = if desired.is_valid() { "True" } else { "False" };
    let reason = match desired.current {
        CurrentStatus::Valid => "Valid",
        CurrentStatus::Invalid => "ErrorPresent",
        CurrentStatus::Orphaned => "Orphaned",
    };

    let last_transition_time = observed
        .and_then(HttpProxyStatus::valid_condition)
        .filter(|c| c.status == status)
        .and_then(|c| c.last_transition_time.clone())
        .unwrap_or_else(timestamp);

    HttpProxyStatus {
        current_status: Some(desired.current.as_str().to_string()),
        description: Some(desired.description.to_string()),
        conditions: vec![DetailedCondition {
            type_: VALID_CONDITION.to_string(),
            status: status.to_string(),
            observed_generation: desired.generation,
            last_transition_time: Some(last_transition_time),
            reason: reason.to_string(),
            message: desired.description.to_string(),
            errors: desired
                .errors
                .iter()
                .map(|e| SubCondition {
                    type_: e.type_.to_string(),
                    reason: e.reason.to_string(),
                    message: e.message.clone(),
                })
                .collect(),
        }],
    }
}

pub fn make_patch(name: &str, status: &HttpProxyStatus) -> k8s::Patch<serde_json::Value> {
    let value = serde_json::json!({
        "apiVersion": HttpProxy::api_version(&()),
        "kind": HttpProxy::kind(&()),
        "name": name,
        "status": status,
    });
    k8s::Patch::Merge(value)
}

fn timestamp() -> String {
    #[cfg(not(test))]
    let timestamp = Utc::now();
    #[cfg(test)]
    let timestamp = chrono::DateTime::<chrono::Utc>::MIN_UTC;

    timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
}
