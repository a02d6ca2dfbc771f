//! rustls configuration for both sides of the proxy.
//!
//! Server configs are built lazily from the published virtual hosts and
//! cached until the virtual host's TLS settings change, so that secret
//! updates only affect new connections. Upstream client configs are cached
//! per cluster in the same way.

use ahash::AHashMap as HashMap;
use ingress_controller_core::{
    tls::{ClientValidation, TlsCertificate, TlsVersion, VirtualHostTls},
    Cluster, Config, UpstreamValidation,
};
use parking_lot::Mutex;
use rustls::{
    client::{
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        WebPkiServerVerifier,
    },
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    server::{
        danger::{ClientCertVerified, ClientCertVerifier},
        VerifierBuilderError, WebPkiClientVerifier,
    },
    ClientConfig, DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig,
    SignatureScheme, SupportedProtocolVersion,
};
use std::{io, sync::Arc};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no virtual host serves TLS for {0:?}")]
    UnknownServerName(String),

    #[error("client sent no server name and no fallback certificate is enabled")]
    NoServerName,

    #[error("{0}: no certificates found")]
    NoCertificate(String),

    #[error("{0}: no private key found")]
    NoPrivateKey(String),

    #[error("invalid PEM: {0}")]
    Pem(#[from] io::Error),

    #[error(transparent)]
    Rustls(#[from] rustls::Error),

    #[error("invalid certificate verifier: {0}")]
    Verifier(#[from] VerifierBuilderError),

    #[error("invalid server name {0:?}")]
    InvalidServerName(String),
}

/// Caches a server config per TLS virtual host.
#[derive(Debug, Default)]
pub struct ServerConfigs {
    vhosts: Mutex<HashMap<String, (Arc<VirtualHostTls>, Arc<ServerConfig>)>>,
    fallback: Mutex<Option<(Arc<TlsCertificate>, Arc<ServerConfig>)>>,
}

/// The server config chosen for a connection from its client hello.
#[derive(Clone, Debug)]
pub struct Selected {
    pub config: Arc<ServerConfig>,
    /// Whether the connection is served with the fallback certificate.
    pub fallback: bool,
}

/// Caches a client config per TLS cluster.
#[derive(Debug, Default)]
pub(crate) struct ClientConfigs {
    clusters: Mutex<HashMap<String, (Arc<Cluster>, Arc<ClientConfig>)>>,
}

/// Accepts any client certificate while still checking handshake
/// signatures.
#[derive(Debug)]
struct AcceptAnyClientCert {
    provider: Arc<CryptoProvider>,
    mandatory: bool,
}

/// Accepts a server certificate valid for any of several names.
#[derive(Debug)]
struct SubjectNames {
    inner: Arc<WebPkiServerVerifier>,
    names: Vec<ServerName<'static>>,
}

/// Accepts any server certificate.
#[derive(Debug)]
struct NoServerVerification(Arc<CryptoProvider>);

const ALPN_H2: &[u8] = b"h2";
const ALPN_HTTP1: &[u8] = b"http/1.1";

pub(crate) fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

// === impl ServerConfigs ===

impl ServerConfigs {
    /// Chooses the server config for a client hello's server name.
    ///
    /// Clients that send no server name, or a name that no TLS virtual host
    /// serves, get the fallback certificate when any virtual host enables it.
    pub fn select(&self, config: &Config, sni: Option<&str>) -> Result<Selected, ConfigError> {
        let vhost = sni.and_then(|sni| config.vhosts.get(sni).filter(|v| v.tls.is_some()));
        let Some((fqdn, tls)) = vhost.and_then(|v| Some((v.fqdn.clone(), v.tls.clone()?))) else {
            let cert = Self::fallback_certificate(config).ok_or_else(|| match sni {
                Some(sni) => ConfigError::UnknownServerName(sni.to_string()),
                None => ConfigError::NoServerName,
            })?;
            return Ok(Selected {
                config: self.fallback(cert)?,
                fallback: true,
            });
        };

        let mut vhosts = self.vhosts.lock();
        if let Some((cached, server)) = vhosts.get(&fqdn) {
            if **cached == *tls {
                return Ok(Selected {
                    config: server.clone(),
                    fallback: false,
                });
            }
        }

        tracing::debug!(%fqdn, secret = %tls.certificate.secret, "Building server config");
        let server = Arc::new(server_config(&tls)?);
        vhosts.retain(|name, _| config.vhosts.get(name).is_some());
        vhosts.insert(fqdn, (tls, server.clone()));
        Ok(Selected {
            config: server,
            fallback: false,
        })
    }

    /// The fallback certificate, if configured and enabled by a virtual host.
    fn fallback_certificate(config: &Config) -> Option<&Arc<TlsCertificate>> {
        config.fallback_certificate.as_ref().filter(|_| {
            config
                .vhosts
                .iter()
                .any(|v| v.tls.as_ref().is_some_and(|t| t.fallback_certificate))
        })
    }

    fn fallback(&self, cert: &Arc<TlsCertificate>) -> Result<Arc<ServerConfig>, ConfigError> {
        let mut fallback = self.fallback.lock();
        if let Some((cached, server)) = &*fallback {
            if **cached == **cert {
                return Ok(server.clone());
            }
        }
        tracing::debug!(secret = %cert.secret, "Building fallback server config");
        let server = Arc::new(fallback_config(cert)?);
        *fallback = Some((cert.clone(), server.clone()));
        Ok(server)
    }
}

static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

fn versions(min: TlsVersion) -> &'static [&'static SupportedProtocolVersion] {
    match min {
        TlsVersion::V1_2 => rustls::ALL_VERSIONS,
        TlsVersion::V1_3 => TLS13_ONLY,
    }
}

/// Builds the server config of a virtual host.
pub fn server_config(tls: &VirtualHostTls) -> Result<ServerConfig, ConfigError> {
    let provider = provider();
    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(versions(tls.minimum_version))?;
    let builder = match &tls.client_validation {
        None => builder.with_no_client_auth(),
        Some(validation) => {
            builder.with_client_cert_verifier(client_verifier(validation, provider)?)
        }
    };

    let chain = certs(&tls.certificate.chain_pem, &tls.certificate.secret)?;
    let key = private_key(&tls.certificate.key_pem, &tls.certificate.secret)?;
    let mut server = builder.with_single_cert(chain, key)?;
    server.alpn_protocols = vec![ALPN_H2.to_vec(), ALPN_HTTP1.to_vec()];
    Ok(server)
}

/// The fallback certificate is served without client validation.
fn fallback_config(cert: &TlsCertificate) -> Result<ServerConfig, ConfigError> {
    let chain = certs(&cert.chain_pem, &cert.secret)?;
    let key = private_key(&cert.key_pem, &cert.secret)?;
    let mut server = ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(versions(TlsVersion::V1_2))?
        .with_no_client_auth()
        .with_single_cert(chain, key)?;
    server.alpn_protocols = vec![ALPN_H2.to_vec(), ALPN_HTTP1.to_vec()];
    Ok(server)
}

fn client_verifier(
    validation: &ClientValidation,
    provider: Arc<CryptoProvider>,
) -> Result<Arc<dyn ClientCertVerifier>, ConfigError> {
    if validation.skip_verification {
        return Ok(Arc::new(AcceptAnyClientCert {
            provider,
            mandatory: !validation.optional,
        }));
    }

    let mut roots = RootCertStore::empty();
    for cert in certs(validation.ca_pem.as_deref().unwrap_or_default(), "client CA")? {
        roots.add(cert)?;
    }

    let crls = match &validation.crl_pem {
        Some(pem) => rustls_pemfile::crls(&mut io::Cursor::new(pem)).collect::<Result<Vec<_>, _>>()?,
        None => vec![],
    };

    let mut builder =
        WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider).with_crls(crls);
    if validation.only_verify_leaf_cert_crl {
        builder = builder.only_check_end_entity_revocation();
    }
    if validation.optional {
        builder = builder.allow_unauthenticated();
    }
    Ok(builder.build()?)
}

fn certs(pem: &[u8], source: &str) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let certs = rustls_pemfile::certs(&mut io::Cursor::new(pem)).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(ConfigError::NoCertificate(source.to_string()));
    }
    Ok(certs)
}

fn private_key(pem: &[u8], source: &str) -> Result<PrivateKeyDer<'static>, ConfigError> {
    rustls_pemfile::private_key(&mut io::Cursor::new(pem))?
        .ok_or_else(|| ConfigError::NoPrivateKey(source.to_string()))
}

// === impl ClientConfigs ===

impl ClientConfigs {
    pub(crate) fn get(&self, cluster: &Arc<Cluster>) -> Result<Arc<ClientConfig>, ConfigError> {
        let mut clusters = self.clusters.lock();
        if let Some((cached, config)) = clusters.get(&cluster.name) {
            if **cached == **cluster {
                return Ok(config.clone());
            }
        }
        let config = Arc::new(client_config(cluster)?);
        clusters.insert(cluster.name.clone(), (cluster.clone(), config.clone()));
        Ok(config)
    }
}

fn client_config(cluster: &Cluster) -> Result<ClientConfig, ConfigError> {
    let provider = provider();
    let verifier: Arc<dyn ServerCertVerifier> = match &cluster.validation {
        Some(validation) => Arc::new(SubjectNames::new(validation, provider.clone())?),
        None => Arc::new(NoServerVerification(provider.clone())),
    };
    let mut config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(versions(TlsVersion::V1_2))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    config.alpn_protocols = if cluster.is_http2() {
        vec![ALPN_H2.to_vec()]
    } else {
        vec![ALPN_HTTP1.to_vec()]
    };
    Ok(config)
}

/// The name sent as SNI to an upstream.
///
/// A validated subject name wins over a rewritten `Host`, which wins over the
/// target's own host.
pub(crate) fn upstream_server_name(
    cluster: &Cluster,
    rewritten: Option<&str>,
    host: &str,
) -> Result<ServerName<'static>, ConfigError> {
    let name = cluster
        .validation
        .as_ref()
        .and_then(|v| v.subject_names.first())
        .map(String::as_str)
        .or(rewritten)
        .unwrap_or(host);
    ServerName::try_from(name.to_string())
        .map_err(|_| ConfigError::InvalidServerName(name.to_string()))
}

// === impl AcceptAnyClientCert ===

impl ClientCertVerifier for AcceptAnyClientCert {
    fn client_auth_mandatory(&self) -> bool {
        self.mandatory
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
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
            &self.provider.signature_verification_algorithms,
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
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// === impl SubjectNames ===

impl SubjectNames {
    fn new(
        validation: &UpstreamValidation,
        provider: Arc<CryptoProvider>,
    ) -> Result<Self, ConfigError> {
        let mut roots = RootCertStore::empty();
        for cert in certs(&validation.ca_pem, "upstream CA")? {
            roots.add(cert)?;
        }
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider).build()?;
        let names = validation
            .subject_names
            .iter()
            .map(|n| {
                ServerName::try_from(n.clone()).map_err(|_| ConfigError::InvalidServerName(n.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { inner, names })
    }
}

impl ServerCertVerifier for SubjectNames {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let mut result = self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        );
        for name in &self.names {
            if result.is_ok() {
                break;
            }
            result = self
                .inner
                .verify_server_cert(end_entity, intermediates, name, ocsp_response, now);
        }
        result
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

// === impl NoServerVerification ===

impl ServerCertVerifier for NoServerVerification {
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
