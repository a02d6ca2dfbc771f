use crate::{
    handler::{Client, Handler, TlsInfo},
    tls::ServerConfigs,
};
use hyper::service::service_fn;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use std::{convert::Infallible, net::SocketAddr, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    time,
};
use tracing::{info_span, Instrument};

const TLS_HANDSHAKE_TIMEOUT: time::Duration = time::Duration::from_secs(10);

/// Accepts connections until shutdown is signaled, serving each on its own
/// task. Connections in flight are closed gracefully.
pub(crate) async fn serve(
    listener: TcpListener,
    handler: Arc<Handler>,
    tls: Option<Arc<ServerConfigs>>,
    drain: drain::Watch,
) {
    let shutdown = drain.clone().signaled();
    tokio::pin!(shutdown);
    loop {
        let (tcp, peer) = tokio::select! {
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(error) => {
                    tracing::warn!(%error, "Failed to accept connection");
                    continue;
                }
            },
            _ = &mut shutdown => {
                tracing::debug!("Listener shutting down");
                return;
            }
        };
        let _ = tcp.set_nodelay(true);

        let handler = handler.clone();
        let tls = tls.clone();
        let drain = drain.clone();
        tokio::spawn(
            async move {
                match tls {
                    None => {
                        let client = Client { peer, tls: None };
                        serve_connection(tcp, client, handler, drain).await
                    }
                    Some(tls) => accept_tls(tcp, peer, handler, tls, drain).await,
                }
            }
            .instrument(info_span!("conn", %peer)),
        );
    }
}

async fn accept_tls(
    tcp: TcpStream,
    peer: SocketAddr,
    handler: Arc<Handler>,
    tls: Arc<ServerConfigs>,
    drain: drain::Watch,
) {
    let handshake = async {
        let acceptor =
            tokio_rustls::LazyConfigAcceptor::new(rustls::server::Acceptor::default(), tcp);
        let start = acceptor.await?;
        let sni = start.client_hello().server_name().map(str::to_string);
        let config = handler.config.borrow().clone();
        let selected = tls
            .select(&config, sni.as_deref())
            .map_err(std::io::Error::other)?;
        let stream = start.into_stream(selected.config).await?;
        Ok::<_, std::io::Error>((
            stream,
            TlsInfo {
                sni,
                fallback: selected.fallback,
            },
        ))
    };

    let (stream, info) = match time::timeout(TLS_HANDSHAKE_TIMEOUT, handshake).await {
        Ok(Ok(accepted)) => accepted,
        Ok(Err(error)) => {
            tracing::debug!(%error, "TLS handshake failed");
            handler.metrics.tls_rejected();
            return;
        }
        Err(_) => {
            tracing::debug!("TLS handshake timed out");
            handler.metrics.tls_rejected();
            return;
        }
    };
    tracing::trace!(sni = ?info.sni, fallback = info.fallback, "TLS handshake complete");

    let client = Client {
        peer,
        tls: Some(info),
    };
    serve_connection(stream, client, handler, drain).await
}

async fn serve_connection<I>(io: I, client: Client, handler: Arc<Handler>, drain: drain::Watch)
where
    I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let svc = service_fn(move |req| {
        let handler = handler.clone();
        let client = client.clone();
        async move { Ok::<_, Infallible>(handler.handle(&client, req).await) }
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(io), svc);
    tokio::pin!(conn);
    let res = tokio::select! {
        res = conn.as_mut() => res,
        release = drain.signaled() => {
            conn.as_mut().graceful_shutdown();
            release.release_after(conn).await
        }
    };
    if let Err(error) = res {
        tracing::debug!(%error, "Connection closed with an error");
    }
}
