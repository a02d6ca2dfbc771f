use super::*;
use http::{header, HeaderMap, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::{body::Incoming, service::service_fn};
use hyper_util::rt::TokioIo;
use ingress_controller_core::{
    authz::{AuthorizationServer, RouteAuthorization},
    headers::{HeaderTemplate, HeadersPolicy},
    host::VirtualHosts,
    redirect::DirectResponse,
    retry::RetryPolicy,
    rewrite::PrefixReplacement,
    routes::{PathMatch, RouteMatch},
    tls::{TlsCertificate, TlsVersion, VirtualHostTls},
    Backend, Cluster, Endpoint, Endpoints, ProxyRef, Route, RouteAction, RouteRef, ServiceRef,
    UpstreamProtocol, VirtualHost,
};
use std::{
    net::SocketAddr,
    sync::atomic::{AtomicUsize, Ordering},
};
use tokio::net::TcpStream;

struct Running {
    addr: SocketAddr,
    _config: watch::Sender<Arc<Config>>,
    _signal: drain::Signal,
}

fn route(index: usize, prefix: &str, action: RouteAction) -> Route {
    Route {
        id: RouteRef {
            proxy: ProxyRef::new("ns", "proxy"),
            index,
        },
        matches: RouteMatch {
            path: Some(PathMatch::Prefix(prefix.to_string())),
            ..Default::default()
        },
        action,
        permit_insecure: false,
        authorization: RouteAuthorization::None,
        timeout: None,
        retry: None,
        path_rewrite: vec![],
        request_headers: Default::default(),
        response_headers: Default::default(),
        cookie_rewrites: vec![],
        rate_limits: Default::default(),
        ip_filter: Default::default(),
        internal_redirect: None,
        response_overrides: vec![],
    }
}

fn forward(addr: SocketAddr) -> RouteAction {
    let cluster = Cluster {
        name: "ns/echo:80".to_string(),
        service: ServiceRef {
            namespace: "ns".to_string(),
            name: "echo".to_string(),
            port: 80,
        },
        protocol: UpstreamProtocol::Http1,
        endpoints: Endpoints::Static(vec![Endpoint { addr, pod: None }]),
        validation: None,
        health_check: None,
    };
    RouteAction::Forward(vec![Backend {
        cluster: Arc::new(cluster),
        weight: 1,
        request_headers: Default::default(),
        response_headers: Default::default(),
        cookie_rewrites: vec![],
    }])
}

fn direct(body: &str) -> RouteAction {
    RouteAction::DirectResponse(DirectResponse {
        status: StatusCode::OK,
        body: Some(body.to_string()),
    })
}

fn config(fqdn: &str, tls: Option<Arc<VirtualHostTls>>, routes: Vec<Route>) -> Config {
    let mut vhosts = VirtualHosts::default();
    vhosts.insert(Arc::new(VirtualHost::new(
        fqdn.to_string(),
        ProxyRef::new("ns", "proxy"),
        tls,
        None,
        routes.into_iter().map(Arc::new).collect(),
    )));
    Config {
        vhosts,
        fallback_certificate: None,
    }
}

async fn serve(config: Config) -> Running {
    let (config_tx, config_rx) = watch::channel(Arc::new(config));
    let (signal, drain) = drain::channel();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let proxy = Proxy::new(config_rx, Settings::default(), None, ProxyMetrics::default());
    tokio::spawn(proxy.serve_http(listener, drain));
    Running {
        addr,
        _config: config_tx,
        _signal: signal,
    }
}

/// A backend that describes each request in its response headers. The first
/// `failures` requests are answered with 503.
async fn echo(failures: usize) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(AtomicUsize::new(0));
    let count = requests.clone();
    tokio::spawn(async move {
        loop {
            let (tcp, _) = listener.accept().await.unwrap();
            let count = count.clone();
            let svc = service_fn(move |req: Request<Incoming>| {
                let n = count.fetch_add(1, Ordering::SeqCst);
                async move {
                    let mut rsp = Response::new(Full::new(bytes::Bytes::from(
                        req.uri().to_string(),
                    )));
                    if n < failures {
                        *rsp.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
                    }
                    for (name, value) in req.headers() {
                        let name = format!("x-echo-{name}");
                        rsp.headers_mut()
                            .insert(header::HeaderName::try_from(name).unwrap(), value.clone());
                    }
                    Ok::<_, std::convert::Infallible>(rsp)
                }
            });
            tokio::spawn(
                hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(tcp), svc),
            );
        }
    });
    (addr, requests)
}

/// An authorization server that allows every request as user `alice` and
/// lists the `auth-` headers it was sent in `auth-checked`.
async fn authorizer() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (tcp, _) = listener.accept().await.unwrap();
            let svc = service_fn(|req: Request<Incoming>| async move {
                let checked = req
                    .headers()
                    .keys()
                    .map(|n| n.as_str())
                    .filter(|n| n.starts_with("auth-"))
                    .collect::<Vec<_>>()
                    .join(",");
                let rsp = Response::builder()
                    .header("auth-user", "alice")
                    .header("auth-checked", checked)
                    .body(Full::<bytes::Bytes>::default())
                    .unwrap();
                Ok::<_, std::convert::Infallible>(rsp)
            });
            tokio::spawn(
                hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(tcp), svc),
            );
        }
    });
    addr
}

async fn get(addr: SocketAddr, host: &str, path: &str) -> (StatusCode, HeaderMap, String) {
    get_with(addr, host, path, &[]).await
}

async fn get_with(
    addr: SocketAddr,
    host: &str,
    path: &str,
    headers: &[(&str, &str)],
) -> (StatusCode, HeaderMap, String) {
    let tcp = TcpStream::connect(addr).await.unwrap();
    let (mut tx, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tcp))
        .await
        .unwrap();
    tokio::spawn(conn);
    let mut req = Request::get(path).header(header::HOST, host);
    for (name, value) in headers {
        req = req.header(*name, *value);
    }
    let req = req.body(Full::<bytes::Bytes>::default()).unwrap();
    let rsp = tx.send_request(req).await.unwrap();
    let (parts, body) = rsp.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    (
        parts.status,
        parts.headers,
        String::from_utf8(body.to_vec()).unwrap(),
    )
}

#[tokio::test]
async fn unknown_hosts_and_paths() {
    let proxy = serve(config(
        "example.com",
        None,
        vec![route(0, "/known", direct("known"))],
    ))
    .await;

    let (status, _, body) = get(proxy.addr, "example.com", "/known").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "known");

    let (status, _, _) = get(proxy.addr, "EXAMPLE.com:8080", "/known/sub").await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, _) = get(proxy.addr, "example.com", "/unknown").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = get(proxy.addr, "other.com", "/known").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn plaintext_requests_to_tls_hosts_are_redirected() {
    let cert = rcgen::generate_simple_self_signed(vec!["secure.com".to_string()]).unwrap();
    let tls = Arc::new(VirtualHostTls {
        certificate: Arc::new(TlsCertificate {
            secret: "ns/cert".to_string(),
            chain_pem: cert.cert.pem().into_bytes(),
            key_pem: cert.key_pair.serialize_pem().into_bytes(),
        }),
        minimum_version: TlsVersion::V1_2,
        fallback_certificate: false,
        client_validation: None,
    });
    let insecure = Route {
        permit_insecure: true,
        ..route(1, "/insecure", direct("insecure"))
    };
    let proxy = serve(config(
        "secure.com",
        Some(tls),
        vec![route(0, "/", direct("secure")), insecure],
    ))
    .await;

    let (status, headers, _) = get(proxy.addr, "secure.com", "/path?q=1").await;
    assert_eq!(status, StatusCode::MOVED_PERMANENTLY);
    assert_eq!(headers[header::LOCATION], "https://secure.com/path?q=1");

    let (status, _, body) = get(proxy.addr, "secure.com", "/insecure").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "insecure");
}

#[tokio::test]
async fn forwards_with_rewrites() {
    let (backend, _) = echo(0).await;
    let rewrite = Route {
        path_rewrite: vec![PrefixReplacement {
            prefix: None,
            replacement: "/v2".to_string(),
        }],
        request_headers: HeadersPolicy {
            set: vec![(
                header::HeaderName::from_static("x-copied"),
                HeaderTemplate::parse("%REQ(Host)%-copy"),
            )],
            remove: vec![],
        },
        ..route(0, "/api", forward(backend))
    };
    let proxy = serve(config("example.com", None, vec![rewrite])).await;

    let (status, headers, body) = get(proxy.addr, "example.com", "/api/users?id=1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "/v2/users?id=1");
    assert_eq!(headers["x-echo-host"], "example.com");
    assert_eq!(headers["x-echo-x-copied"], "example.com-copy");
    assert_eq!(headers["x-echo-x-forwarded-for"], "127.0.0.1");
    assert_eq!(headers["x-echo-x-forwarded-proto"], "http");
    assert!(headers.contains_key("x-echo-x-request-id"));
}

#[tokio::test]
async fn retries_server_errors() {
    let (backend, requests) = echo(2).await;
    let retried = Route {
        retry: Some(RetryPolicy {
            count: 2,
            per_try_timeout: None,
            retry_on: vec![],
            retriable_status_codes: vec![],
        }),
        ..route(0, "/", forward(backend))
    };
    let proxy = serve(config("example.com", None, vec![retried])).await;

    let (status, _, _) = get(proxy.addr, "example.com", "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(requests.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn unreachable_backends_are_unavailable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed = listener.local_addr().unwrap();
    drop(listener);

    let proxy = serve(config(
        "example.com",
        None,
        vec![route(0, "/", forward(closed))],
    ))
    .await;
    let (status, _, body) = get(proxy.addr, "example.com", "/").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body.starts_with("upstream connect error"), "{body}");
}

#[tokio::test]
async fn clients_cannot_forge_authorization_headers() {
    let (backend, _) = echo(0).await;
    let RouteAction::Forward(backends) = forward(authorizer().await) else {
        unreachable!()
    };
    let server = AuthorizationServer {
        cluster: backends[0].cluster.clone(),
        fail_open: false,
        response_timeout: std::time::Duration::from_secs(5),
    };
    let checked = Route {
        authorization: RouteAuthorization::Check {
            context: [("tenant".to_string(), "acme".to_string())].into(),
        },
        ..route(0, "/", forward(backend))
    };
    let mut vhosts = VirtualHosts::default();
    vhosts.insert(Arc::new(VirtualHost::new(
        "example.com".to_string(),
        ProxyRef::new("ns", "proxy"),
        None,
        Some(server),
        vec![Arc::new(checked)],
    )));
    let proxy = serve(Config {
        vhosts,
        fallback_certificate: None,
    })
    .await;

    let (status, headers, _) = get_with(
        proxy.addr,
        "example.com",
        "/",
        &[
            ("auth-context-user", "forged"),
            ("auth-context-tenant", "forged"),
            ("auth-user", "mallory"),
        ],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-echo-auth-checked"], "auth-context-tenant");
    assert_eq!(headers["x-echo-auth-user"], "alice");
    assert!(!headers.contains_key("x-echo-auth-context-user"));
    assert!(!headers.contains_key("x-echo-auth-context-tenant"));
}
