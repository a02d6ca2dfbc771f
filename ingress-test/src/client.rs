//! A minimal HTTP client for probing the proxy's listeners.

use crate::{fixtures::EchoResponse, pki::ClientCert};
use anyhow::{Context, Result};
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, SignatureScheme,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    time::{self, Duration},
};
use tokio_rustls::client::TlsStream;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A request to send to the proxy.
#[derive(Clone, Debug)]
pub struct Request {
    pub method: Method,
    /// The `Host` header. No header is sent when unset.
    pub host: Option<String>,
    pub path: String,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub body: Bytes,
    /// Sends HTTP/2 with prior knowledge rather than HTTP/1.1.
    pub http2: bool,
}

#[derive(Clone, Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub trailers: Option<HeaderMap>,
}

/// How the client negotiates TLS.
#[derive(Clone, Default)]
pub struct TlsClient {
    /// The server name sent in the handshake. No SNI is sent when unset.
    pub sni: Option<String>,
    pub cert: Option<ClientCert>,
    /// Restricts the handshake to TLS 1.2, in which client certificates are
    /// verified before the handshake completes.
    pub tls12: bool,
}

// === impl Request ===

impl Request {
    pub fn get(host: impl ToString, path: impl ToString) -> Self {
        Self {
            method: Method::GET,
            host: Some(host.to_string()),
            path: path.to_string(),
            headers: vec![],
            body: Bytes::new(),
            http2: false,
        }
    }

    pub fn post(host: impl ToString, path: impl ToString, body: impl Into<Bytes>) -> Self {
        Self {
            method: Method::POST,
            body: body.into(),
            ..Self::get(host, path)
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        let name = HeaderName::try_from(name).expect("header name must be valid");
        let value = HeaderValue::from_str(value).expect("header value must be valid");
        self.headers.push((name, value));
        self
    }

    pub fn without_host(mut self) -> Self {
        self.host = None;
        self
    }

    pub fn http2(mut self) -> Self {
        self.http2 = true;
        self
    }

    fn build(&self, scheme: &str) -> Result<http::Request<Full<Bytes>>> {
        let builder = if self.http2 {
            let authority = self.host.as_deref().unwrap_or("localhost");
            http::Request::builder()
                .version(Version::HTTP_2)
                .uri(format!("{scheme}://{authority}{}", self.path))
        } else {
            http::Request::builder().uri(self.path.as_str())
        };
        let mut req = builder
            .method(self.method.clone())
            .body(Full::new(self.body.clone()))?;
        if let (Some(host), false) = (&self.host, self.http2) {
            req.headers_mut()
                .insert(header::HOST, HeaderValue::from_str(host)?);
        }
        for (name, value) in &self.headers {
            req.headers_mut().append(name.clone(), value.clone());
        }
        Ok(req)
    }
}

// === impl Response ===

impl Response {
    /// Decodes the echo fixture's description of the request, if the
    /// response came from one.
    pub fn echo(&self) -> Option<EchoResponse> {
        serde_json::from_slice(&self.body).ok()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }

    pub fn header_all(&self, name: &str) -> Vec<String> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect()
    }
}

// === impl TlsClient ===

impl TlsClient {
    pub fn sni(name: impl ToString) -> Self {
        Self {
            sni: Some(name.to_string()),
            ..Default::default()
        }
    }

    pub fn with_cert(mut self, cert: ClientCert) -> Self {
        self.cert = Some(cert);
        self
    }

    pub fn tls12(mut self) -> Self {
        self.tls12 = true;
        self
    }

    fn config(&self) -> Result<ClientConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let versions: &[&rustls::SupportedProtocolVersion] = if self.tls12 {
            &[&rustls::version::TLS12]
        } else {
            rustls::ALL_VERSIONS
        };
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(versions)?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)));
        let mut config = match &self.cert {
            Some(cert) => builder.with_client_auth_cert(cert.chain.clone(), cert.key.clone_key())?,
            None => builder.with_no_client_auth(),
        };
        config.enable_sni = self.sni.is_some();
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(config)
    }

    /// Completes a handshake with the proxy.
    pub async fn connect(&self, addr: SocketAddr) -> Result<TlsStream<TcpStream>> {
        let connector = tokio_rustls::TlsConnector::from(Arc::new(self.config()?));
        let name = ServerName::try_from(self.sni.clone().unwrap_or_else(|| "localhost".to_string()))?;
        let tcp = TcpStream::connect(addr).await?;
        let tls = time::timeout(REQUEST_TIMEOUT, connector.connect(name, tcp))
            .await
            .context("TLS handshake timed out")?
            .context("TLS handshake failed")?;
        Ok(tls)
    }
}

/// Sends a request over plaintext TCP.
pub async fn send(addr: SocketAddr, req: &Request) -> Result<Response> {
    let tcp = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;
    time::timeout(REQUEST_TIMEOUT, send_on(tcp, "http", req))
        .await
        .context("request timed out")?
}

/// Sends a request over TLS.
pub async fn send_tls(addr: SocketAddr, tls: &TlsClient, req: &Request) -> Result<Response> {
    let stream = tls.connect(addr).await?;
    let http2 = stream.get_ref().1.alpn_protocol() == Some(b"h2");
    let req = Request {
        http2: req.http2 || http2,
        ..req.clone()
    };
    time::timeout(REQUEST_TIMEOUT, send_on(stream, "https", &req))
        .await
        .context("request timed out")?
}

async fn send_on<I>(io: I, scheme: &str, req: &Request) -> Result<Response>
where
    I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let request = req.build(scheme)?;
    let rsp = if req.http2 {
        let (mut tx, conn) =
            hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(io)).await?;
        tokio::spawn(conn);
        tx.send_request(request).await?
    } else {
        let (mut tx, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;
        tokio::spawn(conn);
        tx.send_request(request).await?
    };
    let (parts, body) = rsp.into_parts();
    let collected = body.collect().await?;
    let trailers = collected.trailers().cloned();
    Ok(Response {
        status: parts.status,
        headers: parts.headers,
        body: collected.to_bytes(),
        trailers,
    })
}

/// Accepts any server certificate; scenarios assert on routing rather than on
/// the proxy's identity.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
