//! Backends that stand in for the workloads a scenario routes to.
//!
//! Each pod is an accept loop on an ephemeral loopback port. Connections are
//! served with HTTP/1.1 or prior-knowledge HTTP/2, optionally behind TLS.

use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode};
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full};
use hyper::{body::Incoming, service::service_fn};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, convert::Infallible, net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, task::JoinHandle, time};

pub const ECHO_STATUS: &str = "x-echo-status";
pub const ECHO_SET_COOKIE: &str = "x-echo-set-cookie";
pub const ECHO_HEADER: &str = "x-echo-header";
pub const ECHO_DELAY_MS: &str = "x-echo-delay-ms";

/// Allows an authorization check when set to `true` in the check context.
pub const AUTHZ_ALLOW_CONTEXT: &str = "auth-context-allow";
/// Allows an authorization check when sent by the client with value `allow`.
pub const AUTHZ_CLIENT_HEADER: &str = "x-authz";

type Body = UnsyncBoxBody<Bytes, Infallible>;

/// What a pod serves.
#[derive(Clone)]
pub enum Workload {
    /// Reflects each request as an [`EchoResponse`].
    Echo,
    /// An authorization server.
    Authz,
    /// Answers gRPC calls with the request message and `grpc-status: 0`.
    Grpc,
}

/// The identity of the pod that served a request, and what it observed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoResponse {
    pub namespace: String,
    pub service: String,
    pub pod: String,
    pub method: String,
    pub host: String,
    /// The request target as received, including the query.
    pub path: String,
    /// Header values by lowercase name.
    pub headers: BTreeMap<String, Vec<String>>,
}

/// A running pod. The pod stops serving when dropped.
pub struct Pod {
    pub name: String,
    pub addr: SocketAddr,
    task: JoinHandle<()>,
}

#[derive(Clone)]
struct Identity {
    namespace: String,
    service: String,
    pod: String,
}

// === impl Pod ===

impl Pod {
    pub async fn spawn(
        namespace: &str,
        service: &str,
        name: String,
        workload: Workload,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("loopback listener must bind");
        let addr = listener.local_addr().expect("listener must have an address");
        let identity = Identity {
            namespace: namespace.to_string(),
            service: service.to_string(),
            pod: name.clone(),
        };
        let task = tokio::spawn(accept(listener, identity, workload, tls));
        tracing::debug!(pod = %name, %addr, "Pod started");
        Self { name, addr, task }
    }
}

impl Drop for Pod {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept(
    listener: TcpListener,
    identity: Identity,
    workload: Workload,
    tls: Option<Arc<rustls::ServerConfig>>,
) {
    let acceptor = tls.map(tokio_rustls::TlsAcceptor::from);
    loop {
        let Ok((tcp, _)) = listener.accept().await else {
            continue;
        };
        let identity = identity.clone();
        let workload = workload.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            let svc = service_fn(move |req| {
                let identity = identity.clone();
                let workload = workload.clone();
                async move { Ok::<_, Infallible>(handle(&identity, &workload, req).await) }
            });
            let builder = auto::Builder::new(TokioExecutor::new());
            let res = match acceptor {
                Some(acceptor) => match acceptor.accept(tcp).await {
                    Ok(tls) => builder.serve_connection(TokioIo::new(tls), svc).await,
                    Err(error) => {
                        tracing::debug!(%error, "Fixture TLS handshake failed");
                        return;
                    }
                },
                None => builder.serve_connection(TokioIo::new(tcp), svc).await,
            };
            if let Err(error) = res {
                tracing::trace!(%error, "Fixture connection closed");
            }
        });
    }
}

async fn handle(identity: &Identity, workload: &Workload, req: Request<Incoming>) -> Response<Body> {
    match workload {
        Workload::Echo => echo(identity, req).await,
        Workload::Authz => authz(req),
        Workload::Grpc => grpc(identity, req).await,
    }
}

fn full(body: impl Into<Bytes>) -> Body {
    Full::new(body.into()).boxed_unsync()
}

async fn echo(identity: &Identity, req: Request<Incoming>) -> Response<Body> {
    let (parts, _) = req.into_parts();
    let mut headers = BTreeMap::<String, Vec<String>>::new();
    for (name, value) in &parts.headers {
        headers
            .entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    let echo = EchoResponse {
        namespace: identity.namespace.clone(),
        service: identity.service.clone(),
        pod: identity.pod.clone(),
        method: parts.method.to_string(),
        host: parts
            .headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .or_else(|| parts.uri.authority().map(|a| a.to_string()))
            .unwrap_or_default(),
        path: parts
            .uri
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_else(|| "/".to_string()),
        headers,
    };

    if let Some(ms) = header_str(&parts.headers, ECHO_DELAY_MS).and_then(|v| v.parse().ok()) {
        time::sleep(time::Duration::from_millis(ms)).await;
    }

    let body = serde_json::to_vec(&echo).expect("echo response must serialize");
    let mut rsp = Response::new(full(body));
    rsp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    if let Some(status) = header_str(&parts.headers, ECHO_STATUS)
        .and_then(|v| v.parse::<u16>().ok())
        .and_then(|v| StatusCode::from_u16(v).ok())
    {
        *rsp.status_mut() = status;
    }
    for cookie in parts.headers.get_all(ECHO_SET_COOKIE) {
        rsp.headers_mut().append(header::SET_COOKIE, cookie.clone());
    }
    for value in parts.headers.get_all(ECHO_HEADER) {
        let Some((name, value)) = value.to_str().ok().and_then(|v| v.split_once(':')) else {
            continue;
        };
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.trim()),
            HeaderValue::from_str(value.trim()),
        ) {
            rsp.headers_mut().append(name, value);
        }
    }
    rsp
}

/// Allows checks that carry `allow` in their context or that the client marked
/// with `x-authz: allow`, and reflects the check context to the upstream as
/// `auth-context-*` headers. Everything else is denied with 401.
fn authz(req: Request<Incoming>) -> Response<Body> {
    let headers = req.headers();
    let allowed = header_str(headers, AUTHZ_ALLOW_CONTEXT) == Some("true")
        || header_str(headers, AUTHZ_CLIENT_HEADER) == Some("allow");
    if !allowed {
        let mut rsp = Response::new(full("denied by authorization server"));
        *rsp.status_mut() = StatusCode::UNAUTHORIZED;
        rsp.headers_mut()
            .insert("x-authz-denied", HeaderValue::from_static("true"));
        return rsp;
    }

    let mut rsp = Response::new(full(Bytes::new()));
    rsp.headers_mut()
        .insert("auth-check", HeaderValue::from_static("ok"));
    for (name, value) in headers {
        if name.as_str().starts_with("auth-context-") {
            rsp.headers_mut().append(name.clone(), value.clone());
        }
    }
    rsp
}

async fn grpc(identity: &Identity, req: Request<Incoming>) -> Response<Body> {
    let (parts, body) = req.into_parts();
    let is_grpc = header_str(&parts.headers, header::CONTENT_TYPE.as_str())
        .is_some_and(|ct| ct.starts_with("application/grpc"));
    if !is_grpc {
        let mut rsp = Response::new(full("not a gRPC request"));
        *rsp.status_mut() = StatusCode::UNSUPPORTED_MEDIA_TYPE;
        return rsp;
    }
    let message = match body.collect().await {
        Ok(body) => body.to_bytes(),
        Err(_) => Bytes::new(),
    };

    let mut trailers = HeaderMap::new();
    trailers.insert("grpc-status", HeaderValue::from_static("0"));
    let body = Full::new(message)
        .with_trailers(async move { Some(Ok(trailers)) })
        .boxed_unsync();
    let mut rsp = Response::new(body);
    rsp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/grpc+proto"),
    );
    if let Ok(pod) = HeaderValue::from_str(&identity.pod) {
        rsp.headers_mut().insert("x-pod", pod);
    }
    rsp
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name)?.to_str().ok()
}

/// Frames a gRPC message with the uncompressed length prefix.
pub fn grpc_frame(message: &[u8]) -> Bytes {
    let mut buf = Vec::with_capacity(message.len() + 5);
    buf.push(0);
    buf.extend_from_slice(&(message.len() as u32).to_be_bytes());
    buf.extend_from_slice(message);
    buf.into()
}

/// Splits a gRPC-Web response body into its data frames and the trailers
/// carried by its final frame.
pub fn grpc_web_frames(mut body: &[u8]) -> (Vec<Bytes>, Option<String>) {
    let mut frames = vec![];
    let mut trailers = None;
    while body.len() >= 5 {
        let flag = body[0];
        let len = u32::from_be_bytes([body[1], body[2], body[3], body[4]]) as usize;
        let end = (5 + len).min(body.len());
        let payload = &body[5..end];
        if flag & 0x80 != 0 {
            trailers = Some(String::from_utf8_lossy(payload).into_owned());
        } else {
            frames.push(Bytes::copy_from_slice(payload));
        }
        body = &body[end..];
    }
    (frames, trailers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grpc_web_frames_split() {
        let mut body = grpc_frame(b"hello").to_vec();
        let trailer = b"grpc-status:0\r\n";
        body.push(0x80);
        body.extend_from_slice(&(trailer.len() as u32).to_be_bytes());
        body.extend_from_slice(trailer);

        let (frames, trailers) = grpc_web_frames(&body);
        assert_eq!(frames, vec![Bytes::from_static(b"hello")]);
        assert_eq!(trailers.as_deref(), Some("grpc-status:0\r\n"));
    }
}
