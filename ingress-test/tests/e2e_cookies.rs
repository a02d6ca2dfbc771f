use ingress_controller_k8s_api::httpproxy::{
    CookieDomainRewrite, CookiePathRewrite, CookieRewritePolicy, Route, Service,
};
use ingress_test::{
    client::{Request, Response},
    fixtures::ECHO_SET_COOKIE,
    resources::{root, route, SERVICE_PORT},
    with_harness,
};

fn rewrite(name: &str) -> CookieRewritePolicy {
    CookieRewritePolicy {
        name: name.to_string(),
        ..Default::default()
    }
}

fn set_cookies(host: &str, path: &str, cookies: &[&str]) -> Request {
    cookies
        .iter()
        .fold(Request::get(host, path), |req, c| req.header(ECHO_SET_COOKIE, c))
}

fn cookies(rsp: &Response) -> Vec<String> {
    rsp.header_all("set-cookie")
}

#[tokio::test(flavor = "current_thread")]
async fn rewrites_are_scoped_to_routes() {
    with_harness(|h| async move {
        h.deploy_echo("echo").await;
        h.create(root(
            &h.namespace,
            "cookies",
            "cookies.example.com",
            vec![
                Route {
                    cookie_rewrite_policies: vec![CookieRewritePolicy {
                        path_rewrite: Some(CookiePathRewrite {
                            value: "/new".to_string(),
                        }),
                        domain_rewrite: Some(CookieDomainRewrite {
                            value: "new.example.com".to_string(),
                        }),
                        same_site: Some("Strict".to_string()),
                        secure: Some(true),
                        ..rewrite("session")
                    }],
                    ..route("/a", "echo")
                },
                route("/b", "echo"),
            ],
        ));
        h.await_valid("cookies").await;

        let original = "session=abc; Path=/old; Domain=old.example.com; Max-Age=60; HttpOnly";
        let rsp = h
            .http(set_cookies(
                "cookies.example.com",
                "/a",
                &[original, "other=1; Path=/x"],
            ))
            .await;
        assert_eq!(
            cookies(&rsp),
            vec![
                "session=abc; Path=/new; Domain=new.example.com; Max-Age=60; HttpOnly; SameSite=Strict; Secure",
                "other=1; Path=/x",
            ]
        );

        let rsp = h
            .http(set_cookies("cookies.example.com", "/b", &[original]))
            .await;
        assert_eq!(cookies(&rsp), vec![original]);
    })
    .await;
}

#[tokio::test(flavor = "current_thread")]
async fn route_and_service_rewrites_both_apply() {
    with_harness(|h| async move {
        h.deploy_echo("echo").await;
        h.create(root(
            &h.namespace,
            "layered",
            "layered.example.com",
            vec![Route {
                cookie_rewrite_policies: vec![CookieRewritePolicy {
                    path_rewrite: Some(CookiePathRewrite {
                        value: "/route".to_string(),
                    }),
                    ..rewrite("route-cookie")
                }],
                services: vec![Service {
                    cookie_rewrite_policies: vec![CookieRewritePolicy {
                        domain_rewrite: Some(CookieDomainRewrite {
                            value: "service.example.com".to_string(),
                        }),
                        secure: Some(false),
                        ..rewrite("service-cookie")
                    }],
                    ..Service::new("echo", SERVICE_PORT)
                }],
                ..route("/", "echo")
            }],
        ));
        h.await_valid("layered").await;

        let rsp = h
            .http(set_cookies(
                "layered.example.com",
                "/",
                &["route-cookie=1; Path=/", "service-cookie=2; Secure; HttpOnly"],
            ))
            .await;
        assert_eq!(
            cookies(&rsp),
            vec![
                "route-cookie=1; Path=/route",
                "service-cookie=2; HttpOnly; Domain=service.example.com",
            ]
        );
    })
    .await;
}

#[tokio::test(flavor = "current_thread")]
async fn malformed_cookies_pass_through() {
    with_harness(|h| async move {
        h.deploy_echo("echo").await;
        h.create(root(
            &h.namespace,
            "malformed",
            "malformed.example.com",
            vec![Route {
                cookie_rewrite_policies: vec![CookieRewritePolicy {
                    same_site: Some("Lax".to_string()),
                    ..rewrite("session")
                }],
                ..route("/", "echo")
            }],
        ));
        h.await_valid("malformed").await;

        for (cookie, expected) in [
            ("session", "session; SameSite=Lax"),
            ("session=abc;;", "session=abc; SameSite=Lax"),
            ("session=abc; ; SameSite=None;", "session=abc; SameSite=Lax"),
            ("unrelated; ;", "unrelated; ;"),
        ] {
            let rsp = h
                .http(set_cookies("malformed.example.com", "/", &[cookie]))
                .await;
            assert_eq!(cookies(&rsp), vec![expected], "{cookie:?}");
        }
    })
    .await;
}

#[tokio::test(flavor = "current_thread")]
async fn service_rewrites_do_not_leak_to_siblings() {
    with_harness(|h| async move {
        h.deploy_echo("rewritten").await;
        h.deploy_echo("untouched").await;
        h.create(root(
            &h.namespace,
            "weighted",
            "weighted.example.com",
            vec![Route {
                services: vec![
                    Service {
                        weight: Some(50),
                        cookie_rewrite_policies: vec![CookieRewritePolicy {
                            path_rewrite: Some(CookiePathRewrite {
                                value: "/rewritten".to_string(),
                            }),
                            ..rewrite("session")
                        }],
                        ..Service::new("rewritten", SERVICE_PORT)
                    },
                    Service {
                        weight: Some(50),
                        ..Service::new("untouched", SERVICE_PORT)
                    },
                ],
                ..route("/", "rewritten")
            }],
        ));
        h.await_valid("weighted").await;

        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..100 {
            let rsp = h
                .http(set_cookies("weighted.example.com", "/", &["session=1; Path=/"]))
                .await;
            let service = rsp.echo().unwrap().service;
            let expected = match service.as_str() {
                "rewritten" => "session=1; Path=/rewritten",
                _ => "session=1; Path=/",
            };
            assert_eq!(cookies(&rsp), vec![expected], "{service}");
            seen.insert(service);
            if seen.len() == 2 {
                break;
            }
        }
        assert_eq!(seen.len(), 2, "both backends must be selected");
    })
    .await;
}
