use crate::{make_patch, make_status, Index, IndexMetrics, SharedIndex, Update};
use ingress_controller_core::ProxyRef;
use ingress_controller_k8s_api::{self as k8s, CurrentStatus, HttpProxy, HttpProxyStatus};
use ingress_controller_k8s_index::{
    ConditionError, ProxyStatus, Statuses, INVALID_DESCRIPTION, ORPHANED_DESCRIPTION,
    VALID_DESCRIPTION,
};
use kubert::index::IndexNamespacedResource;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tokio::{
    sync::{mpsc, watch},
    time::Duration,
};

const TEST_HOSTNAME: &str = "test";
const TEST_NAMESPACE: &str = "ns-0";

struct TestIndex {
    index: SharedIndex,
    updates: mpsc::Receiver<Update>,
    claims: watch::Sender<Arc<kubert::lease::Claim>>,
}

fn setup() -> TestIndex {
    let claim = kubert::lease::Claim {
        holder: TEST_HOSTNAME.to_string(),
        expiry: chrono::DateTime::<chrono::Utc>::MAX_UTC,
    };
    let (claims, claims_rx) = watch::channel(Arc::new(claim));
    let (updates_tx, updates) = mpsc::channel(100);
    let index = Index::shared(
        TEST_HOSTNAME,
        claims_rx,
        updates_tx,
        IndexMetrics::register(&mut Default::default()),
    );
    TestIndex {
        index,
        updates,
        claims,
    }
}

fn mk_proxy(name: &str, generation: i64, status: Option<HttpProxyStatus>) -> HttpProxy {
    HttpProxy {
        metadata: k8s::ObjectMeta {
            namespace: Some(TEST_NAMESPACE.to_string()),
            name: Some(name.to_string()),
            generation: Some(generation),
            ..Default::default()
        },
        spec: Default::default(),
        status,
    }
}

fn valid(generation: i64) -> ProxyStatus {
    ProxyStatus {
        generation: Some(generation),
        current: CurrentStatus::Valid,
        description: VALID_DESCRIPTION,
        errors: vec![],
    }
}

fn invalid(generation: i64, reason: &'static str) -> ProxyStatus {
    ProxyStatus {
        generation: Some(generation),
        current: CurrentStatus::Invalid,
        description: INVALID_DESCRIPTION,
        errors: vec![ConditionError {
            type_: "ServiceError",
            reason,
            message: "service ns-0/backend not found".to_string(),
        }],
    }
}

fn statuses(entries: impl IntoIterator<Item = (&'static str, ProxyStatus)>) -> Arc<Statuses> {
    Arc::new(
        entries
            .into_iter()
            .map(|(name, status)| (ProxyRef::new(TEST_NAMESPACE, name), status))
            .collect(),
    )
}

fn patched_status(update: &Update) -> HttpProxyStatus {
    let k8s::Patch::Merge(value) = &update.patch else {
        panic!("expected a merge patch: {:?}", update.patch);
    };
    serde_json::from_value(value["status"].clone()).expect("status must deserialize")
}

#[test]
fn new_proxy_is_patched() {
    let mut test = setup();
    test.index
        .write()
        .set_statuses(statuses([("root", invalid(1, "ServiceUnresolvedReference"))]));
    assert!(test.updates.try_recv().is_err(), "no proxy observed yet");

    test.index.write().apply(mk_proxy("root", 1, None));

    let update = test.updates.try_recv().expect("update must be queued");
    let expected = make_status(&invalid(1, "ServiceUnresolvedReference"), None);
    assert_eq!(update.id, ProxyRef::new(TEST_NAMESPACE, "root"));
    assert_eq!(update.patch, make_patch("root", &expected));

    let status = patched_status(&update);
    assert_eq!(status.current(), Some(CurrentStatus::Invalid));
    assert!(!status.is_valid());
    assert_eq!(status.error_reasons(), vec!["ServiceUnresolvedReference"]);
    assert_eq!(
        status.valid_condition().and_then(|c| c.observed_generation),
        Some(1)
    );
}

#[test]
fn current_status_is_not_repatched() {
    let mut test = setup();
    let current = make_status(&valid(1), None);
    test.index.write().apply(mk_proxy("root", 1, Some(current)));
    test.index
        .write()
        .set_statuses(statuses([("root", valid(1))]));

    assert!(test.updates.try_recv().is_err());
}

#[test]
fn uncompiled_proxies_are_ignored() {
    let mut test = setup();
    test.index
        .write()
        .set_statuses(statuses([("root", valid(1))]));
    test.index.write().apply(mk_proxy("other-class", 1, None));

    assert!(test.updates.try_recv().is_err());
}

#[test]
fn generation_changes_are_repatched() {
    let mut test = setup();
    let current = make_status(&valid(1), None);
    test.index
        .write()
        .apply(mk_proxy("root", 2, Some(current.clone())));
    test.index
        .write()
        .set_statuses(statuses([("root", valid(2))]));

    let update = test.updates.try_recv().expect("update must be queued");
    let status = patched_status(&update);
    let condition = status.valid_condition().expect("valid condition");
    assert_eq!(condition.observed_generation, Some(2));
    assert_eq!(
        condition.last_transition_time,
        current.valid_condition().unwrap().last_transition_time,
        "transition time is kept while the condition status is unchanged"
    );
}

#[test]
fn transition_time_resets_when_validity_flips() {
    let observed = HttpProxyStatus {
        conditions: vec![k8s::DetailedCondition {
            type_: "Valid".to_string(),
            status: "True".to_string(),
            last_transition_time: Some("2024-01-01T00:00:00Z".to_string()),
            ..Default::default()
        }],
        ..Default::default()
    };

    let still_valid = make_status(&valid(1), Some(&observed));
    assert_eq!(
        still_valid.valid_condition().unwrap().last_transition_time,
        Some("2024-01-01T00:00:00Z".to_string())
    );

    let now_invalid = make_status(&invalid(1, "SecretNotValid"), Some(&observed));
    assert_ne!(
        now_invalid.valid_condition().unwrap().last_transition_time,
        Some("2024-01-01T00:00:00Z".to_string())
    );
}

#[test]
fn orphaned_status() {
    let orphaned = ProxyStatus {
        generation: Some(3),
        current: CurrentStatus::Orphaned,
        description: ORPHANED_DESCRIPTION,
        errors: vec![ConditionError {
            type_: "Orphaned",
            reason: "Orphaned",
            message: ORPHANED_DESCRIPTION.to_string(),
        }],
    };
    let status = make_status(&orphaned, None);
    assert_eq!(status.current_status.as_deref(), Some("orphaned"));
    assert_eq!(status.description.as_deref(), Some(ORPHANED_DESCRIPTION));
    let condition = status.valid_condition().expect("valid condition");
    assert_eq!(condition.status, "False");
    assert_eq!(condition.reason, "Orphaned");
    assert_eq!(status.error_reasons(), vec!["Orphaned"]);
}

#[test]
fn followers_do_not_patch() {
    let mut test = setup();
    test.claims.send_replace(Arc::new(kubert::lease::Claim {
        holder: "other".to_string(),
        expiry: chrono::DateTime::<chrono::Utc>::MAX_UTC,
    }));

    test.index.write().apply(mk_proxy("root", 1, None));
    test.index
        .write()
        .set_statuses(statuses([("root", valid(1))]));
    assert!(test.updates.try_recv().is_err());

    // Once the lease is acquired, the next reconciliation catches up.
    test.claims.send_replace(Arc::new(kubert::lease::Claim {
        holder: TEST_HOSTNAME.to_string(),
        expiry: chrono::DateTime::<chrono::Utc>::MAX_UTC,
    }));
    test.index
        .write()
        .set_statuses(statuses([("root", valid(1))]));
    let update = test.updates.try_recv().expect("update must be queued");
    assert_eq!(update.id, ProxyRef::new(TEST_NAMESPACE, "root"));
}

#[test]
fn deleted_proxies_are_not_patched() {
    let mut test = setup();
    test.index.write().apply(mk_proxy("root", 1, None));
    IndexNamespacedResource::<HttpProxy>::delete(
        &mut *test.index.write(),
        TEST_NAMESPACE.to_string(),
        "root".to_string(),
    );
    test.index
        .write()
        .set_statuses(statuses([("root", valid(1))]));

    assert!(test.updates.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn run_reconciles_on_status_changes() {
    let mut test = setup();
    test.index.write().apply(mk_proxy("root", 1, None));

    let (statuses_tx, statuses_rx) = watch::channel(Arc::<Statuses>::default());
    let task = tokio::spawn(Index::run(
        test.index.clone(),
        statuses_rx,
        Duration::from_secs(10),
    ));

    statuses_tx.send_replace(statuses([("root", valid(1))]));
    let update = tokio::time::timeout(Duration::from_secs(1), test.updates.recv())
        .await
        .expect("update must be queued")
        .expect("index must be running");
    assert_eq!(patched_status(&update).current(), Some(CurrentStatus::Valid));

    // The patch was never observed, so the periodic reconciliation resends it.
    let retry = tokio::time::timeout(Duration::from_secs(11), test.updates.recv())
        .await
        .expect("update must be requeued")
        .expect("index must be running");
    assert_eq!(retry, update);

    drop(statuses_tx);
    task.await.expect("index task must not panic");
}
