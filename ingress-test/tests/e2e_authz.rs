use http::StatusCode;
use ingress_controller_k8s_api::{
    httpproxy::{AuthorizationPolicy, HttpDirectResponsePolicy, Route},
    HttpProxySpec,
};
use ingress_test::{
    client::Request,
    fixtures::AUTHZ_CLIENT_HEADER,
    resources::{authorization, proxy, route, vhost},
    with_harness, Harness,
};
use maplit::btreemap;
use std::collections::BTreeMap;

fn policy(disabled: bool, context: BTreeMap<String, String>) -> Option<AuthorizationPolicy> {
    Some(AuthorizationPolicy { disabled, context })
}

async fn deploy(h: &Harness) {
    h.deploy_authz("authz").await;
    h.deploy_echo("echo").await;
    let mut vh = vhost("authz.example.com");
    vh.authorization = Some(authorization(
        "authz",
        btreemap! { "tenant".to_string() => "vhost".to_string() },
    ));
    h.create(proxy(
        &h.namespace,
        "authz",
        HttpProxySpec {
            virtualhost: Some(vh),
            routes: vec![
                route("/", "echo"),
                Route {
                    auth_policy: policy(
                        false,
                        btreemap! {
                            "allow".to_string() => "true".to_string(),
                            "route".to_string() => "context".to_string(),
                        },
                    ),
                    ..route("/allowed", "echo")
                },
                Route {
                    auth_policy: policy(true, BTreeMap::new()),
                    ..route("/public", "echo")
                },
                Route {
                    conditions: vec![ingress_controller_k8s_api::httpproxy::MatchCondition::prefix(
                        "/direct",
                    )],
                    auth_policy: policy(true, BTreeMap::new()),
                    direct_response_policy: Some(HttpDirectResponsePolicy {
                        status_code: 200,
                        body: Some("direct".to_string()),
                    }),
                    ..Default::default()
                },
            ],
            ..Default::default()
        },
    ));
    h.await_valid("authz").await;
}

#[tokio::test(flavor = "current_thread")]
async fn denies_by_default() {
    with_harness(|h| async move {
        deploy(&h).await;

        let rsp = h.http(Request::get("authz.example.com", "/")).await;
        assert_eq!(rsp.status, StatusCode::UNAUTHORIZED);
        assert_eq!(rsp.header("x-authz-denied"), Some("true"));

        let rsp = h
            .http(Request::get("authz.example.com", "/").header(AUTHZ_CLIENT_HEADER, "allow"))
            .await;
        assert_eq!(rsp.status, StatusCode::OK);
        let echo = rsp.echo().unwrap();
        assert_eq!(echo.headers["auth-check"], vec!["ok"]);
        assert_eq!(echo.headers["auth-context-tenant"], vec!["vhost"]);
    })
    .await;
}

#[tokio::test(flavor = "current_thread")]
async fn route_context_is_forwarded() {
    with_harness(|h| async move {
        deploy(&h).await;

        let rsp = h.http(Request::get("authz.example.com", "/allowed")).await;
        assert_eq!(rsp.status, StatusCode::OK);
        let echo = rsp.echo().unwrap();
        assert_eq!(echo.headers["auth-context-allow"], vec!["true"]);
        assert_eq!(echo.headers["auth-context-route"], vec!["context"]);
        assert_eq!(
            echo.headers["auth-context-tenant"],
            vec!["vhost"],
            "the virtual host's context is merged"
        );
    })
    .await;
}

#[tokio::test(flavor = "current_thread")]
async fn disabled_routes_skip_the_check() {
    with_harness(|h| async move {
        deploy(&h).await;

        let rsp = h.http(Request::get("authz.example.com", "/public")).await;
        assert_eq!(rsp.status, StatusCode::OK);
        assert!(!rsp.echo().unwrap().headers.contains_key("auth-check"));

        let rsp = h.http(Request::get("authz.example.com", "/direct")).await;
        assert_eq!(rsp.status, StatusCode::OK);
        assert_eq!(rsp.text(), "direct");
    })
    .await;
}

#[tokio::test(flavor = "current_thread")]
async fn unavailable_server_fails_closed_unless_open() {
    with_harness(|h| async move {
        h.deploy_echo("echo").await;
        h.deploy_empty("missing-authz");

        let spec = |fail_open: bool, fqdn: &str| {
            let mut vh = vhost(fqdn);
            let mut authz = authorization("missing-authz", BTreeMap::new());
            authz.fail_open = fail_open;
            vh.authorization = Some(authz);
            HttpProxySpec {
                virtualhost: Some(vh),
                routes: vec![route("/", "echo")],
                ..Default::default()
            }
        };
        h.create(proxy(&h.namespace, "closed", spec(false, "closed.example.com")));
        h.create(proxy(&h.namespace, "open", spec(true, "open.example.com")));
        h.await_valid("closed").await;
        h.await_valid("open").await;

        let rsp = h.http(Request::get("closed.example.com", "/")).await;
        assert_eq!(rsp.status, StatusCode::UNAUTHORIZED);
        let rsp = h.http(Request::get("open.example.com", "/")).await;
        assert_eq!(rsp.status, StatusCode::OK);
        assert_eq!(rsp.echo().unwrap().service, "echo");
    })
    .await;
}
