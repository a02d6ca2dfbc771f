//! HTTP authorization checks.

use crate::{upstream::Upstream, BoxBody};
use bytes::Bytes;
use http::{header, request, HeaderMap, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use ingress_controller_core::authz::{context_headers, is_forwarded_header, AuthorizationServer};
use std::collections::BTreeMap;
use tokio::time;

/// The result of an authorization check.
#[derive(Debug)]
pub(crate) enum Decision {
    /// The request may proceed with these additional headers.
    Allow(HeaderMap),
    /// The request is answered with the authorization server's response.
    Deny(Response<BoxBody>),
}

/// Asks the authorization server whether a request may proceed.
///
/// The check request carries the original method, path and headers without
/// a body. Servers that cannot be reached deny with 401 unless the server is
/// configured to fail open.
pub(crate) async fn check(
    upstream: &Upstream,
    server: &AuthorizationServer,
    req: &request::Parts,
    context: &BTreeMap<String, String>,
) -> Decision {
    let rsp = match time::timeout(server.response_timeout, call(upstream, server, req, context)).await {
        Ok(Ok(rsp)) => rsp,
        Ok(Err(error)) => return failed(server, &error),
        Err(_) => return failed(server, &"timed out"),
    };

    let (parts, body) = rsp.into_parts();
    if parts.status.is_success() {
        let headers = parts
            .headers
            .iter()
            .filter(|(name, _)| is_forwarded_header(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        return Decision::Allow(headers);
    }

    tracing::debug!(status = %parts.status, "Request denied");
    let mut rsp = Response::new(crate::full(body));
    *rsp.status_mut() = parts.status;
    *rsp.headers_mut() = parts.headers;
    crate::strip_hop_by_hop(rsp.headers_mut());
    Decision::Deny(rsp)
}

/// Removes headers that only the authorization server may set, so that
/// clients cannot pass them off as the server's.
pub(crate) fn strip_forwarded_headers(headers: &mut HeaderMap) {
    let forged = headers
        .keys()
        .filter(|name| is_forwarded_header(name))
        .cloned()
        .collect::<Vec<_>>();
    for name in forged {
        tracing::debug!(header = %name, "Dropping client authorization header");
        headers.remove(name);
    }
}

async fn call(
    upstream: &Upstream,
    server: &AuthorizationServer,
    req: &request::Parts,
    context: &BTreeMap<String, String>,
) -> Result<Response<Bytes>, crate::Error> {
    let path = req
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut check = Request::builder()
        .method(req.method.clone())
        .uri(path)
        .body(Full::default())?;
    *check.headers_mut() = req.headers.clone();
    crate::strip_hop_by_hop(check.headers_mut());
    check.headers_mut().remove(header::CONTENT_LENGTH);
    for (name, value) in context_headers(context) {
        check.headers_mut().insert(name, value);
    }

    let rsp = upstream.send(&server.cluster, check, None).await?;
    let (parts, body) = rsp.into_parts();
    let body = body.collect().await.map_err(crate::Error::Upstream)?;
    Ok(Response::from_parts(parts, body.to_bytes()))
}

fn failed(server: &AuthorizationServer, error: &dyn std::fmt::Display) -> Decision {
    if server.fail_open {
        tracing::info!(%error, "Authorization server unavailable; allowing request");
        return Decision::Allow(HeaderMap::new());
    }
    tracing::info!(%error, "Authorization server unavailable");
    Decision::Deny(crate::status_response(StatusCode::UNAUTHORIZED))
}
