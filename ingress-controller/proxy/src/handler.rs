use crate::{
    authz::{self, Decision},
    compress, grpc_web,
    metrics::{ProxyMetrics, UpstreamOutcome},
    ratelimit::{LocalRateLimiter, RateLimitService},
    upstream::{self, Upstream},
    BoxBody, Error, Settings,
};
use bytes::Bytes;
use http::{
    header::{self, HeaderName, HeaderValue},
    request, HeaderMap, Method, Request, Response, StatusCode, Uri,
};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use ingress_controller_core::{
    authz::RouteAuthorization,
    cookie::{rewrite_set_cookie, CookieRewrite},
    host::canonical_host,
    ip_filter::client_address,
    ratelimit,
    redirect::{InternalRedirectPolicy, RedirectSource},
    retry::Outcome,
    rewrite,
    routes::RequestRef,
    tls::sni_matches_host,
    Backend, Cluster, Config, Route, RouteAction, RouteRef,
};
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};
use tokio::{sync::watch, time};

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Serves requests against the current config snapshot.
pub(crate) struct Handler {
    pub(crate) config: watch::Receiver<Arc<Config>>,
    pub(crate) upstream: Upstream,
    pub(crate) local_limits: LocalRateLimiter,
    pub(crate) global_limits: Option<Arc<dyn RateLimitService>>,
    pub(crate) settings: Settings,
    pub(crate) metrics: ProxyMetrics,
}

/// The downstream connection a request arrived on.
#[derive(Clone, Debug)]
pub(crate) struct Client {
    pub(crate) peer: SocketAddr,
    pub(crate) tls: Option<TlsInfo>,
}

#[derive(Clone, Debug)]
pub(crate) struct TlsInfo {
    pub(crate) sni: Option<String>,
    /// Whether the handshake used the fallback certificate.
    pub(crate) fallback: bool,
}

/// A route a request is sent to, possibly after internal redirects.
struct Dispatch {
    scheme: &'static str,
    host: String,
    route: Arc<Route>,
    uri: Uri,
}

/// A buffered upstream request that can be sent more than once.
struct Outbound {
    method: Method,
    path: String,
    headers: HeaderMap,
    body: Bytes,
    /// The rewritten `Host`, used as SNI for TLS clusters.
    server_name: Option<String>,
}

/// The downstream request with its body read.
struct Inbound {
    parts: request::Parts,
    body: Bytes,
    auth_headers: HeaderMap,
}

// === impl Handler ===

impl Handler {
    pub(crate) async fn handle(&self, client: &Client, req: Request<Incoming>) -> Response<BoxBody> {
        let observer = self.metrics.start(client.listener());
        let rsp = self.dispatch(client, req).await;
        observer.end(rsp.status());
        rsp
    }

    async fn dispatch(&self, client: &Client, req: Request<Incoming>) -> Response<BoxBody> {
        let config = self.config.borrow().clone();

        let Some(host) = request_host(&req) else {
            return status_response(StatusCode::BAD_REQUEST);
        };
        let Some(vhost) = config.vhosts.get(&host) else {
            tracing::debug!(%host, "No virtual host");
            return status_response(StatusCode::NOT_FOUND);
        };

        if let Some(TlsInfo {
            sni: Some(sni),
            fallback: false,
        }) = &client.tls
        {
            if !sni_matches_host(sni, &host) {
                tracing::debug!(%sni, %host, "Server name does not match host");
                return status_response(StatusCode::MISDIRECTED_REQUEST);
            }
        }

        let Some(route) = vhost
            .route(&RequestRef::new(req.uri(), req.headers()))
            .cloned()
        else {
            tracing::debug!(%host, path = %req.uri().path(), "No route");
            return status_response(StatusCode::NOT_FOUND);
        };
        tracing::trace!(route = %route.id, "Routing");

        if client.tls.is_none() && vhost.tls.is_some() && !route.permit_insecure {
            let location = format!(
                "https://{}{}",
                canonical_host(&host),
                path_and_query(req.uri())
            );
            return redirect_response(StatusCode::MOVED_PERMANENTLY, &location);
        }

        let xff = req
            .headers()
            .get(X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok());
        let remote = client_address(client.peer.ip(), xff, self.settings.num_trusted_hops);
        if !route.ip_filter.permits(client.peer.ip(), remote) {
            tracing::debug!(peer = %client.peer, %remote, "Address is not permitted");
            return status_response(StatusCode::FORBIDDEN);
        }

        if let Some(policy) = self.local_limits.check(&route.rate_limits.local) {
            tracing::debug!(route = %route.id, "Local rate limit exceeded");
            let mut rsp = status_response(policy.response_status);
            rsp.headers_mut()
                .extend(ratelimit::response_headers(policy));
            return rsp;
        }

        let (mut parts, body) = req.into_parts();
        if vhost.authorization.is_some() {
            authz::strip_forwarded_headers(&mut parts.headers);
        }
        let auth_headers = match (&vhost.authorization, &route.authorization) {
            (Some(server), RouteAuthorization::Check { context }) => {
                match authz::check(&self.upstream, server, &parts, context).await {
                    Decision::Allow(headers) => headers,
                    Decision::Deny(rsp) => return rsp,
                }
            }
            _ => HeaderMap::new(),
        };

        if self.is_globally_limited(&route, &parts, remote).await {
            tracing::debug!(route = %route.id, "Global rate limit exceeded");
            return status_response(StatusCode::TOO_MANY_REQUESTS);
        }

        match &route.action {
            RouteAction::Redirect(redirect) => {
                let location = redirect.location(RedirectSource {
                    scheme: client.scheme(),
                    host: &host,
                    path: parts.uri.path(),
                    query: parts.uri.query(),
                    route_prefix: route.prefix(),
                });
                return redirect_response(redirect.status, &location);
            }
            RouteAction::DirectResponse(direct) => {
                let body = direct.body.clone().unwrap_or_default();
                let mut rsp = Response::new(full(body));
                *rsp.status_mut() = direct.status;
                return rsp;
            }
            RouteAction::Forward(_) => {}
        }

        let body = match body.collect().await {
            Ok(body) => body.to_bytes(),
            Err(error) => {
                tracing::debug!(%error, "Failed to read request body");
                return status_response(StatusCode::BAD_REQUEST);
            }
        };
        let dispatch = Dispatch {
            scheme: client.scheme(),
            host,
            route,
            uri: parts.uri.clone(),
        };
        let inbound = Inbound {
            parts,
            body,
            auth_headers,
        };
        self.forward(&config, client, dispatch, inbound).await
    }

    async fn is_globally_limited(
        &self,
        route: &Route,
        parts: &request::Parts,
        remote: IpAddr,
    ) -> bool {
        let Some(service) = &self.global_limits else {
            return false;
        };
        let req = RequestRef::new(&parts.uri, &parts.headers);
        for policy in &route.rate_limits.global {
            let descriptors = policy
                .descriptors
                .iter()
                .filter_map(|d| d.evaluate(&req, remote))
                .collect::<Vec<_>>();
            if descriptors.is_empty() {
                continue;
            }
            if service
                .should_rate_limit(&self.settings.ratelimit_domain, &descriptors)
                .await
            {
                return true;
            }
        }
        false
    }

    async fn forward(
        &self,
        config: &Config,
        client: &Client,
        mut dispatch: Dispatch,
        inbound: Inbound,
    ) -> Response<BoxBody> {
        let gzip = self.settings.compression && compress::accepts_gzip(&inbound.parts.headers);
        let mut visited = vec![dispatch.route.id.clone()];
        let mut redirects = 0;
        loop {
            let RouteAction::Forward(backends) = &dispatch.route.action else {
                return status_response(StatusCode::INTERNAL_SERVER_ERROR);
            };
            let Some(backend) =
                upstream::select_backend(backends, &mut rand::thread_rng()).cloned()
            else {
                tracing::debug!(route = %dispatch.route.id, "No backend has weight");
                return status_response(StatusCode::SERVICE_UNAVAILABLE);
            };

            let (outbound, grpc_web) = self.outbound(client, &dispatch, &backend, &inbound);
            let rsp = match self.send(&dispatch.route, &backend.cluster, &outbound).await {
                Ok(rsp) => rsp,
                Err(error) => {
                    tracing::debug!(route = %dispatch.route.id, %error, "Upstream request failed");
                    return error_response(&error);
                }
            };

            if let Some(policy) = &dispatch.route.internal_redirect {
                if policy.follows(rsp.status()) && redirects < policy.max_internal_redirects {
                    let next = redirect_target(
                        config,
                        &dispatch,
                        &rsp,
                        policy,
                        &visited,
                        &inbound.parts.headers,
                    );
                    if let Some(next) = next {
                        tracing::debug!(location = %next.uri, "Following internal redirect");
                        redirects += 1;
                        visited.push(next.route.id.clone());
                        dispatch = next;
                        continue;
                    }
                }
            }

            return self
                .respond(
                    rsp,
                    &dispatch.route,
                    &backend,
                    &inbound.parts.headers,
                    grpc_web,
                    gzip,
                )
                .await;
        }
    }

    fn outbound(
        &self,
        client: &Client,
        dispatch: &Dispatch,
        backend: &Backend,
        inbound: &Inbound,
    ) -> (Outbound, bool) {
        let original = &inbound.parts.headers;
        let mut headers = original.clone();
        strip_hop_by_hop(&mut headers);
        if let Ok(host) = HeaderValue::from_str(&dispatch.host) {
            headers.insert(header::HOST, host);
        }
        let grpc_web = grpc_web::translate_request(&mut headers);
        self.set_forwarded(&mut headers, client.peer.ip(), dispatch.scheme);
        for (name, value) in &inbound.auth_headers {
            headers.insert(name.clone(), value.clone());
        }
        dispatch.route.request_headers.apply(&mut headers, original);
        backend.request_headers.apply(&mut headers, original);

        let server_name = backend
            .request_headers
            .host_rewrite()
            .or_else(|| dispatch.route.request_headers.host_rewrite())
            .map(|tpl| tpl.render(original))
            .filter(|name| !name.is_empty());

        let path = dispatch.uri.path();
        let path = rewrite::replace_prefix(
            path,
            dispatch.route.prefix(),
            &dispatch.route.path_rewrite,
        )
        .unwrap_or_else(|| path.to_string());
        let path = match dispatch.uri.query() {
            Some(query) => format!("{path}?{query}"),
            None => path,
        };

        let outbound = Outbound {
            method: inbound.parts.method.clone(),
            path,
            headers,
            body: inbound.body.clone(),
            server_name,
        };
        (outbound, grpc_web)
    }

    fn set_forwarded(&self, headers: &mut HeaderMap, peer: IpAddr, scheme: &'static str) {
        let xff = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) => format!("{prior}, {peer}"),
            None => peer.to_string(),
        };
        if let Ok(xff) = HeaderValue::from_str(&xff) {
            headers.insert(X_FORWARDED_FOR, xff);
        }
        // Trusted proxies in front of this one set the original scheme.
        if self.settings.num_trusted_hops == 0 || !headers.contains_key(X_FORWARDED_PROTO) {
            headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(scheme));
        }
        if !headers.contains_key(X_REQUEST_ID) {
            let id = format!("{:032x}", rand::random::<u128>());
            if let Ok(id) = HeaderValue::from_str(&id) {
                headers.insert(X_REQUEST_ID, id);
            }
        }
    }

    /// Sends a request, retrying per the route's policy within the route's
    /// timeout.
    async fn send(
        &self,
        route: &Route,
        cluster: &Arc<Cluster>,
        outbound: &Outbound,
    ) -> Result<Response<Incoming>, Error> {
        let attempts = self.attempts(route, cluster, outbound);
        match route.timeout {
            Some(timeout) => time::timeout(timeout, attempts)
                .await
                .unwrap_or(Err(Error::Timeout)),
            None => attempts.await,
        }
    }

    async fn attempts(
        &self,
        route: &Route,
        cluster: &Arc<Cluster>,
        outbound: &Outbound,
    ) -> Result<Response<Incoming>, Error> {
        let mut retries = route.retry.as_ref().map_or(0, |r| r.count);
        loop {
            let attempt = self
                .upstream
                .send(cluster, outbound.request()?, outbound.server_name.as_deref());
            let result = match route.retry.as_ref().and_then(|r| r.per_try_timeout) {
                Some(timeout) => time::timeout(timeout, attempt)
                    .await
                    .unwrap_or(Err(Error::Timeout)),
                None => attempt.await,
            };

            let outcome = match &result {
                Ok(rsp) => Outcome::Response {
                    status: rsp.status(),
                    grpc_status: grpc_status(rsp.headers()),
                },
                Err(error) => error.outcome(),
            };
            self.metrics.upstream(match outcome {
                Outcome::Response { .. } => UpstreamOutcome::Response,
                Outcome::ConnectFailure => UpstreamOutcome::ConnectFailure,
                Outcome::Reset => UpstreamOutcome::Reset,
                Outcome::Timeout => UpstreamOutcome::Timeout,
            });

            let retry = retries > 0
                && route
                    .retry
                    .as_ref()
                    .is_some_and(|r| r.should_retry(outcome));
            if !retry {
                return result;
            }
            retries -= 1;
            self.metrics.upstream(UpstreamOutcome::Retry);
            tracing::debug!(?outcome, retries, "Retrying");
        }
    }

    async fn respond(
        &self,
        rsp: Response<Incoming>,
        route: &Route,
        backend: &Backend,
        request: &HeaderMap,
        grpc_web: bool,
        gzip: bool,
    ) -> Response<BoxBody> {
        let (mut parts, body) = rsp.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        route.response_headers.apply(&mut parts.headers, request);
        backend.response_headers.apply(&mut parts.headers, request);
        rewrite_cookies(&mut parts.headers, &route.cookie_rewrites);
        rewrite_cookies(&mut parts.headers, &backend.cookie_rewrites);

        if let Some(over) = route
            .response_overrides
            .iter()
            .find(|o| o.matches(parts.status))
        {
            parts.headers.remove(header::CONTENT_LENGTH);
            parts.headers.remove(header::CONTENT_ENCODING);
            if let Ok(ct) = HeaderValue::from_str(&over.content_type) {
                parts.headers.insert(header::CONTENT_TYPE, ct);
            }
            return Response::from_parts(parts, full(over.body.clone()));
        }

        if grpc_web {
            grpc_web::translate_response_headers(&mut parts.headers);
            let collected = match body.collect().await {
                Ok(collected) => collected,
                Err(error) => return body_error(&error),
            };
            let trailers = collected.trailers().cloned();
            let body = grpc_web::encode_trailers(collected.to_bytes(), trailers.as_ref());
            return Response::from_parts(parts, full(body));
        }

        if gzip && compress::is_compressible(&parts.headers) {
            let body = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(error) => return body_error(&error),
            };
            let body = match compress::gzip(&mut parts.headers, &body) {
                Ok(Some(compressed)) => Bytes::from(compressed),
                Ok(None) => body,
                Err(error) => {
                    tracing::warn!(%error, "Failed to compress response");
                    body
                }
            };
            return Response::from_parts(parts, full(body));
        }

        Response::from_parts(parts, body.boxed())
    }
}

// === impl Client ===

impl Client {
    fn scheme(&self) -> &'static str {
        if self.tls.is_some() {
            "https"
        } else {
            "http"
        }
    }

    fn listener(&self) -> &'static str {
        self.scheme()
    }
}

// === impl Outbound ===

impl Outbound {
    fn request(&self) -> Result<Request<Full<Bytes>>, http::Error> {
        let mut req = Request::builder()
            .method(self.method.clone())
            .uri(self.path.as_str())
            .body(Full::new(self.body.clone()))?;
        *req.headers_mut() = self.headers.clone();
        Ok(req)
    }
}

/// Resolves the route an upstream redirect points to, if the policy allows
/// following it.
fn redirect_target(
    config: &Config,
    current: &Dispatch,
    rsp: &Response<Incoming>,
    policy: &InternalRedirectPolicy,
    visited: &[RouteRef],
    headers: &HeaderMap,
) -> Option<Dispatch> {
    let location = rsp
        .headers()
        .get(header::LOCATION)?
        .to_str()
        .ok()?
        .parse::<Uri>()
        .ok()?;
    let scheme = match location.scheme_str()? {
        "http" => "http",
        "https" => "https",
        _ => return None,
    };
    if !policy.allows_scheme(current.scheme, scheme) {
        return None;
    }
    let host = location.authority()?.as_str().to_string();
    let route = config
        .vhosts
        .get(&host)?
        .route(&RequestRef::new(&location, headers))?
        .clone();
    if policy.deny_repeated_route_redirect && visited.contains(&route.id) {
        return None;
    }
    if !matches!(route.action, RouteAction::Forward(_)) {
        return None;
    }
    Some(Dispatch {
        scheme,
        host,
        route,
        uri: location,
    })
}

fn request_host<B>(req: &Request<B>) -> Option<String> {
    if let Some(authority) = req.uri().authority() {
        return Some(authority.as_str().to_string());
    }
    req.headers()
        .get(header::HOST)?
        .to_str()
        .ok()
        .map(str::to_string)
}

fn path_and_query(uri: &Uri) -> &str {
    uri.path_and_query().map_or("/", |pq| pq.as_str())
}

fn grpc_status(headers: &HeaderMap) -> Option<u32> {
    headers.get("grpc-status")?.to_str().ok()?.parse().ok()
}

fn rewrite_cookies(headers: &mut HeaderMap, rules: &[CookieRewrite]) {
    if rules.is_empty() || !headers.contains_key(header::SET_COOKIE) {
        return;
    }
    let values = headers
        .get_all(header::SET_COOKIE)
        .iter()
        .map(|value| {
            value
                .to_str()
                .ok()
                .and_then(|v| rewrite_set_cookie(v, rules))
                .and_then(|v| HeaderValue::from_str(&v).ok())
                .unwrap_or_else(|| value.clone())
        })
        .collect::<Vec<_>>();
    headers.remove(header::SET_COOKIE);
    for value in values {
        headers.append(header::SET_COOKIE, value);
    }
}

/// Removes connection-scoped headers, keeping `te: trailers`.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect::<Vec<_>>();
    for name in listed {
        headers.remove(name);
    }

    let trailers = headers
        .get_all(header::TE)
        .iter()
        .any(|v| v.as_bytes().eq_ignore_ascii_case(b"trailers"));
    for name in [
        header::CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-connection"),
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
    ] {
        headers.remove(name);
    }
    if trailers {
        headers.insert(header::TE, HeaderValue::from_static("trailers"));
    }
}

pub(crate) fn full(body: impl Into<Bytes>) -> BoxBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed()
}

pub(crate) fn status_response(status: StatusCode) -> Response<BoxBody> {
    let mut rsp = Response::new(full(Bytes::new()));
    *rsp.status_mut() = status;
    rsp
}

fn redirect_response(status: StatusCode, location: &str) -> Response<BoxBody> {
    let mut rsp = status_response(status);
    match HeaderValue::from_str(location) {
        Ok(location) => {
            rsp.headers_mut().insert(header::LOCATION, location);
        }
        Err(_) => *rsp.status_mut() = StatusCode::BAD_REQUEST,
    }
    rsp
}

fn error_response(error: &Error) -> Response<BoxBody> {
    let body = match error {
        Error::NoHealthyEndpoints(_) => "no healthy upstream",
        Error::Timeout => "upstream request timeout",
        _ => "upstream connect error or disconnect/reset before headers",
    };
    let mut rsp = Response::new(full(body));
    *rsp.status_mut() = error.status();
    rsp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain"),
    );
    rsp
}

fn body_error(error: &hyper::Error) -> Response<BoxBody> {
    tracing::debug!(%error, "Failed to read response body");
    status_response(StatusCode::BAD_GATEWAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingress_controller_core::cookie::SameSite;

    #[test]
    fn hop_by_hop_headers_are_removed() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("close, x-custom"));
        headers.insert("x-custom", HeaderValue::from_static("1"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(header::TE, HeaderValue::from_static("trailers"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert("x-kept", HeaderValue::from_static("1"));
        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 2, "{headers:?}");
        assert_eq!(headers[header::TE], "trailers");
        assert_eq!(headers["x-kept"], "1");

        let mut gzip = HeaderMap::new();
        gzip.insert(header::TE, HeaderValue::from_static("gzip"));
        strip_hop_by_hop(&mut gzip);
        assert!(gzip.is_empty());
    }

    #[test]
    fn cookies_are_rewritten_in_place() {
        let mut headers = HeaderMap::new();
        headers.append(
            header::SET_COOKIE,
            HeaderValue::from_static("session=abc; Path=/old; HttpOnly"),
        );
        headers.append(header::SET_COOKIE, HeaderValue::from_static("other=1"));
        let rules = [CookieRewrite {
            name: "session".to_string(),
            path: Some("/new".to_string()),
            domain: None,
            same_site: Some(SameSite::Strict),
            secure: None,
        }];
        rewrite_cookies(&mut headers, &rules);

        let values = headers
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect::<Vec<_>>();
        assert_eq!(values.len(), 2);
        assert!(values[0].contains("Path=/new"), "{values:?}");
        assert!(values[0].contains("SameSite=Strict"), "{values:?}");
        assert!(values[0].contains("HttpOnly"), "{values:?}");
        assert_eq!(values[1], "other=1");
    }

    #[test]
    fn request_hosts() {
        let req = Request::get("http://example.com:8080/path")
            .header(header::HOST, "ignored.com")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req).as_deref(), Some("example.com:8080"));

        let req = Request::get("/path")
            .header(header::HOST, "Example.com")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req).as_deref(), Some("Example.com"));

        let req = Request::get("/path").body(()).unwrap();
        assert_eq!(request_host(&req), None);
    }

    #[test]
    fn grpc_status_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(grpc_status(&headers), None);
        headers.insert("grpc-status", HeaderValue::from_static("14"));
        assert_eq!(grpc_status(&headers), Some(14));
    }
}
