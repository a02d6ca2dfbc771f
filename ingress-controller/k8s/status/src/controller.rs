use crate::{index::Update, STATUS_CONTROLLER_NAME};
use ingress_controller_k8s_api::{self as k8s, HttpProxy};
use kubert::lease::Claim;
use prometheus_client::{
    metrics::{counter::Counter, histogram::Histogram},
    registry::Registry,
};
use std::sync::Arc;
use tokio::{
    sync::{mpsc, watch},
    time::{self, Duration, Instant},
};

/// Applies queued status patches while this instance holds the lease.
pub struct Controller {
    claims: watch::Receiver<Arc<Claim>>,
    client: k8s::Client,
    name: String,
    updates: mpsc::Receiver<Update>,
    patch_timeout: Duration,
    metrics: ControllerMetrics,
}

#[derive(Clone, Debug)]
pub struct ControllerMetrics {
    patch_succeeded: Counter,
    patch_failed: Counter,
    patch_timeout: Counter,
    patch_skipped: Counter,
    patch_duration: Histogram,
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let patch_succeeded = Counter::default();
        prom.register(
            "patch_succeeded",
            "Count of successful status patches",
            patch_succeeded.clone(),
        );

        let patch_failed = Counter::default();
        prom.register(
            "patch_failed",
            "Count of status patches rejected by the API server",
            patch_failed.clone(),
        );

        let patch_timeout = Counter::default();
        prom.register(
            "patch_timeout",
            "Count of status patches that timed out",
            patch_timeout.clone(),
        );

        let patch_skipped = Counter::default();
        prom.register(
            "patch_skipped",
            "Count of status patches discarded because the lease was lost",
            patch_skipped.clone(),
        );

        let patch_duration = Histogram::new(
            [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0].into_iter(),
        );
        prom.register(
            "patch_duration_seconds",
            "Time taken to apply a status patch",
            patch_duration.clone(),
        );

        Self {
            patch_succeeded,
            patch_failed,
            patch_timeout,
            patch_skipped,
            patch_duration,
        }
    }
}

// === impl Controller ===

impl Controller {
    pub fn new(
        claims: watch::Receiver<Arc<Claim>>,
        client: k8s::Client,
        name: impl ToString,
        updates: mpsc::Receiver<Update>,
        patch_timeout: Duration,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            claims,
            client,
            name: name.to_string(),
            updates,
            patch_timeout,
            metrics,
        }
    }

    pub async fn run(mut self) {
        let patch_params = k8s::PatchParams::apply(STATUS_CONTROLLER_NAME);

        // Failed patches are not requeued here; the index resends them on its
        // next reconciliation.
        while let Some(Update { id, patch }) = self.updates.recv().await {
            // The lease may have moved since the patch was queued.
            if !self.claims.borrow().is_current_for(&self.name) {
                self.metrics.patch_skipped.inc();
                continue;
            }

            let api = k8s::Api::<HttpProxy>::namespaced(self.client.clone(), &id.namespace);
            let start = Instant::now();
            let res = time::timeout(
                self.patch_timeout,
                api.patch_status(&id.name, &patch_params, &patch),
            )
            .await;
            self.metrics
                .patch_duration
                .observe(start.elapsed().as_secs_f64());

            match res {
                Ok(Ok(_)) => {
                    self.metrics.patch_succeeded.inc();
                    tracing::debug!(namespace = %id.namespace, name = %id.name, "Patched HTTPProxy status");
                }
                Ok(Err(error)) => {
                    self.metrics.patch_failed.inc();
                    tracing::error!(namespace = %id.namespace, name = %id.name, %error, "Failed to patch HTTPProxy status");
                }
                Err(_) => {
                    self.metrics.patch_timeout.inc();
                    tracing::error!(namespace = %id.namespace, name = %id.name, timeout = ?self.patch_timeout, "Timed out patching HTTPProxy status");
                }
            }
        }
    }
}
