use crate::{error::Error, tls::ClientConfigs};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use bytes::Bytes;
use http::{header, uri, Request, Response, Uri};
use http_body_util::Full;
use hyper::{
    body::Incoming,
    client::conn::{http1, http2},
};
use hyper_util::rt::{TokioExecutor, TokioIo};
use ingress_controller_core::Cluster;
use parking_lot::Mutex;
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tracing::Instrument;

/// Where a connection to a cluster is opened.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Target {
    Addr(SocketAddr),
    Name { host: String, port: u16 },
}

/// A request sender on an upstream connection.
#[derive(Debug)]
pub(crate) enum Sender {
    Http1(http1::SendRequest<Full<Bytes>>),
    Http2(http2::SendRequest<Full<Bytes>>),
}

/// Identifies the connections that may carry a request.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct Key {
    pub cluster: String,
    pub target: Target,
    /// Only set for TLS clusters.
    pub server_name: Option<String>,
}

/// Idle upstream connections, reused across requests.
///
/// HTTP/2 connections are shared by every request to the same key; HTTP/1
/// connections are handed out to one request at a time.
#[derive(Debug, Default)]
pub(crate) struct Pool {
    idle: Mutex<HashMap<Key, Idle>>,
}

#[derive(Debug)]
struct Idle {
    /// Connections are dropped when the cluster's settings change.
    cluster: Arc<Cluster>,
    senders: Vec<Sender>,
}

const MAX_IDLE_PER_KEY: usize = 8;

// === impl Target ===

impl Target {
    fn host(&self) -> String {
        match self {
            Self::Addr(addr) => addr.ip().to_string(),
            Self::Name { host, .. } => host.clone(),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Addr(addr) => std::fmt::Display::fmt(addr, f),
            Self::Name { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

// === impl Key ===

impl Key {
    pub(crate) fn new(cluster: &Cluster, target: Target, server_name: Option<&str>) -> Self {
        Self {
            cluster: cluster.name.clone(),
            target,
            server_name: server_name
                .filter(|_| cluster.is_tls())
                .map(str::to_string),
        }
    }
}

// === impl Pool ===

impl Pool {
    /// Takes a usable idle connection for `key`, if there is one.
    pub(crate) fn checkout(&self, cluster: &Arc<Cluster>, key: &Key) -> Option<Sender> {
        let mut idle = self.idle.lock();
        let entry = idle.get_mut(key)?;
        if entry.cluster != *cluster {
            idle.remove(key);
            return None;
        }
        entry.senders.retain(|s| !s.is_closed());
        let ready = entry.senders.iter().position(Sender::is_ready)?;
        match &entry.senders[ready] {
            Sender::Http2(tx) => Some(Sender::Http2(tx.clone())),
            Sender::Http1(_) => Some(entry.senders.swap_remove(ready)),
        }
    }

    /// Returns a connection after its response has been received.
    pub(crate) fn checkin(&self, cluster: &Arc<Cluster>, key: Key, sender: Sender) {
        if sender.is_closed() {
            return;
        }
        let mut idle = self.idle.lock();
        let entry = idle.entry(key).or_insert_with(|| Idle {
            cluster: cluster.clone(),
            senders: Vec::new(),
        });
        if entry.cluster != *cluster {
            entry.cluster = cluster.clone();
            entry.senders.clear();
        }
        let full = match sender {
            Sender::Http2(_) => entry.senders.iter().any(|s| !s.is_closed()),
            Sender::Http1(_) => entry.senders.len() >= MAX_IDLE_PER_KEY,
        };
        if !full {
            entry.senders.push(sender);
        }
    }

    /// Drops the connections of clusters not in `clusters`.
    pub(crate) fn retain(&self, clusters: &HashSet<String>) {
        self.idle.lock().retain(|key, _| clusters.contains(&key.cluster));
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.idle.lock().values().map(|i| i.senders.len()).sum()
    }
}

/// Opens a connection to `target` speaking the cluster's protocol.
///
/// `server_name` is the rewritten `Host` of the request, if any, and is only
/// used as SNI when the cluster has no subject name to validate.
pub(crate) async fn connect(
    cluster: &Arc<Cluster>,
    target: &Target,
    server_name: Option<&str>,
    tls: &ClientConfigs,
) -> Result<Sender, Error> {
    let tcp = match target {
        Target::Addr(addr) => TcpStream::connect(addr).await,
        Target::Name { host, port } => TcpStream::connect((host.as_str(), *port)).await,
    }
    .map_err(|source| Error::Connect {
        addr: target.to_string(),
        source,
    })?;
    let _ = tcp.set_nodelay(true);

    if !cluster.is_tls() {
        return handshake(tcp, cluster.is_http2()).await;
    }

    let config = tls.get(cluster)?;
    let server_name = crate::tls::upstream_server_name(cluster, server_name, &target.host())?;
    let stream = tokio_rustls::TlsConnector::from(config)
        .connect(server_name, tcp)
        .await
        .map_err(|source| Error::UpstreamTls {
            addr: target.to_string(),
            source,
        })?;
    handshake(stream, cluster.is_http2()).await
}

async fn handshake<I>(io: I, http2: bool) -> Result<Sender, Error>
where
    I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let io = TokioIo::new(io);
    if http2 {
        let (tx, conn) = http2::handshake(TokioExecutor::new(), io)
            .await
            .map_err(Error::Handshake)?;
        tokio::spawn(
            async move {
                if let Err(error) = conn.await {
                    tracing::debug!(%error, "Upstream connection failed");
                }
            }
            .in_current_span(),
        );
        return Ok(Sender::Http2(tx));
    }

    let (tx, conn) = http1::handshake(io).await.map_err(Error::Handshake)?;
    tokio::spawn(
        async move {
            if let Err(error) = conn.await {
                tracing::debug!(%error, "Upstream connection failed");
            }
        }
        .in_current_span(),
    );
    Ok(Sender::Http1(tx))
}

// === impl Sender ===

impl Sender {
    fn is_ready(&self) -> bool {
        match self {
            Self::Http1(tx) => tx.is_ready(),
            Self::Http2(tx) => tx.is_ready(),
        }
    }

    fn is_closed(&self) -> bool {
        match self {
            Self::Http1(tx) => tx.is_closed(),
            Self::Http2(tx) => tx.is_closed(),
        }
    }

    /// Sends a request whose URI carries only a path and query.
    ///
    /// HTTP/2 requests get an absolute URI whose authority is taken from the
    /// request's `Host` header.
    pub(crate) async fn send(
        &mut self,
        mut req: Request<Full<Bytes>>,
        tls: bool,
    ) -> Result<Response<Incoming>, Error> {
        match self {
            Self::Http1(tx) => {
                *req.version_mut() = http::Version::HTTP_11;
                tx.ready().await.map_err(Error::Upstream)?;
                tx.send_request(req).await.map_err(Error::Upstream)
            }
            Self::Http2(tx) => {
                let authority = req
                    .headers_mut()
                    .remove(header::HOST)
                    .and_then(|h| h.to_str().ok().map(str::to_string))
                    .unwrap_or_else(|| "localhost".to_string());
                let mut parts = uri::Parts::default();
                parts.scheme = Some(if tls {
                    uri::Scheme::HTTPS
                } else {
                    uri::Scheme::HTTP
                });
                parts.authority = Some(authority.parse().map_err(http::Error::from)?);
                parts.path_and_query = req.uri().path_and_query().cloned();
                *req.uri_mut() = Uri::from_parts(parts).map_err(http::Error::from)?;
                *req.version_mut() = http::Version::HTTP_2;
                tx.ready().await.map_err(Error::Upstream)?;
                tx.send_request(req).await.map_err(Error::Upstream)
            }
        }
    }
}
