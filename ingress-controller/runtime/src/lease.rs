use crate::k8s::{
    self,
    api::{apps::v1::Deployment, coordination::v1::Lease},
    ObjectMeta, Resource,
};
use anyhow::Result;
use kube::api::PostParams;
use std::sync::Arc;
use tokio::{sync::watch, time};

const LEASE_SUFFIX: &str = "status-writer";

/// Lease timings for the status writer.
///
/// A new leader is elected at most `duration + grace` after the previous one
/// stops renewing.
#[derive(Clone, Debug)]
pub(crate) struct LeaseParams {
    pub duration: time::Duration,
    pub grace: time::Duration,
}

impl Default for LeaseParams {
    fn default() -> Self {
        Self {
            duration: time::Duration::from_secs(30),
            grace: time::Duration::from_secs(1),
        }
    }
}

/// Creates the status-writer Lease if needed and competes for it.
///
/// Only the replica holding the claim patches `HTTPProxy` statuses; every
/// replica compiles proxies and serves traffic.
pub(crate) async fn init<T>(
    runtime: &kubert::Runtime<T>,
    ns: &str,
    deployment_name: &str,
    hostname: &str,
) -> Result<watch::Receiver<Arc<kubert::lease::Claim>>> {
    let name = format!("{deployment_name}-{LEASE_SUFFIX}");
    let api = k8s::Api::<Lease>::namespaced(runtime.client(), ns);

    if api.get_opt(&name).await?.is_none() {
        // Owned by the deployment so that uninstalling the controller removes it.
        let owner = k8s::Api::<Deployment>::namespaced(runtime.client(), ns)
            .get(deployment_name)
            .await?
            .controller_owner_ref(&());
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(ns.to_string()),
                owner_references: owner.map(|o| vec![o]),
                labels: Some(
                    [(
                        "app.kubernetes.io/component".to_string(),
                        "ingress-controller".to_string(),
                    )]
                    .into_iter()
                    .collect(),
                ),
                ..Default::default()
            },
            spec: None,
        };
        match api.create(&PostParams::default(), &lease).await {
            Ok(_) => tracing::info!(%name, "Created status Lease"),
            // Another replica won the race.
            Err(kube::Error::Api(e)) if e.code == 409 => {
                tracing::debug!(%name, "Status Lease already exists")
            }
            Err(error) => return Err(error.into()),
        }
    }

    let LeaseParams { duration, grace } = LeaseParams::default();
    let params = kubert::lease::ClaimParams {
        lease_duration: duration,
        renew_grace_period: grace,
    };
    let (claims, _task) = kubert::lease::LeaseManager::init(api, &name)
        .await?
        .spawn(hostname, params)
        .await?;
    tracing::debug!(%name, %hostname, "Competing for status Lease");
    Ok(claims)
}
