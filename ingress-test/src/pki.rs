//! Certificate authorities, certificates and revocation lists for TLS
//! scenarios.

use rcgen::{
    date_time_ymd, BasicConstraints, CertificateParams, CertificateRevocationListParams, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyIdMethod, KeyPair, KeyUsagePurpose, RevocationReason,
    RevokedCertParams, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

static SERIALS: AtomicU64 = AtomicU64::new(1);

/// A certificate authority that issues leaf certificates, intermediate
/// authorities and revocation lists.
pub struct Issuer {
    cert: rcgen::Certificate,
    key: KeyPair,
    serial: u64,
    /// The issuer's own chain, excluding the root.
    chain: Vec<CertificateDer<'static>>,
    chain_pem: String,
}

/// An issued end-entity certificate.
pub struct Leaf {
    pub serial: u64,
    cert: rcgen::Certificate,
    key: KeyPair,
    chain: Vec<CertificateDer<'static>>,
    intermediates_pem: String,
}

/// A certificate chain and key presented by a TLS client.
pub struct ClientCert {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

fn next_serial() -> u64 {
    SERIALS.fetch_add(1, Ordering::Relaxed)
}

fn ca_params(name: &str, serial: u64) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.serial_number = Some(SerialNumber::from(serial));
    params
}

// === impl Issuer ===

impl Issuer {
    pub fn root(name: &str) -> Self {
        let serial = next_serial();
        let key = KeyPair::generate().expect("key generation must succeed");
        let cert = ca_params(name, serial)
            .self_signed(&key)
            .expect("root must be signed");
        Self {
            cert,
            key,
            serial,
            chain: vec![],
            chain_pem: String::new(),
        }
    }

    pub fn intermediate(&self, name: &str) -> Self {
        let serial = next_serial();
        let key = KeyPair::generate().expect("key generation must succeed");
        let cert = ca_params(name, serial)
            .signed_by(&key, &self.cert, &self.key)
            .expect("intermediate must be signed");
        let mut chain = vec![cert.der().clone()];
        chain.extend(self.chain.iter().cloned());
        let chain_pem = format!("{}{}", cert.pem(), self.chain_pem);
        Self {
            cert,
            key,
            serial,
            chain,
            chain_pem,
        }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// The PEM encoded certificate of this authority.
    pub fn pem(&self) -> String {
        self.cert.pem()
    }

    /// Issues a serving certificate for `hosts`.
    pub fn server(&self, hosts: &[&str]) -> Leaf {
        let names = hosts.iter().map(|h| h.to_string()).collect::<Vec<_>>();
        let mut params = CertificateParams::new(names).expect("host names must be valid");
        params
            .distinguished_name
            .push(DnType::CommonName, hosts.first().copied().unwrap_or("server"));
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        self.issue(params)
    }

    /// Issues a client certificate with the given common name.
    pub fn client(&self, name: &str) -> Leaf {
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, name);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        self.issue(params)
    }

    fn issue(&self, mut params: CertificateParams) -> Leaf {
        let serial = next_serial();
        params.serial_number = Some(SerialNumber::from(serial));
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        let key = KeyPair::generate().expect("key generation must succeed");
        let cert = params
            .signed_by(&key, &self.cert, &self.key)
            .expect("leaf must be signed");
        let mut chain = vec![cert.der().clone()];
        chain.extend(self.chain.iter().cloned());
        Leaf {
            serial,
            cert,
            key,
            chain,
            intermediates_pem: self.chain_pem.clone(),
        }
    }

    /// A PEM encoded revocation list, signed by this authority, revoking the
    /// given serial numbers.
    pub fn crl(&self, revoked: &[u64]) -> String {
        let params = CertificateRevocationListParams {
            this_update: date_time_ymd(2024, 1, 1),
            next_update: date_time_ymd(2099, 1, 1),
            crl_number: SerialNumber::from(next_serial()),
            issuing_distribution_point: None,
            revoked_certs: revoked
                .iter()
                .map(|serial| RevokedCertParams {
                    serial_number: SerialNumber::from(*serial),
                    revocation_time: date_time_ymd(2024, 1, 1),
                    reason_code: Some(RevocationReason::KeyCompromise),
                    invalidity_date: None,
                })
                .collect(),
            key_identifier_method: KeyIdMethod::Sha256,
        };
        params
            .signed_by(&self.cert, &self.key)
            .and_then(|crl| crl.pem())
            .expect("revocation list must be signed")
    }
}

// === impl Leaf ===

impl Leaf {
    /// The leaf followed by its intermediates.
    pub fn chain_pem(&self) -> String {
        format!("{}{}", self.cert.pem(), self.intermediates_pem)
    }

    pub fn key_pem(&self) -> String {
        self.key.serialize_pem()
    }

    /// A server config presenting this certificate, for TLS backends.
    pub fn server_config(&self) -> Arc<rustls::ServerConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .and_then(|b| {
                b.with_no_client_auth()
                    .with_single_cert(self.chain.clone(), self.client_cert().key)
            })
            .expect("server config must be valid");
        Arc::new(config)
    }

    pub fn client_cert(&self) -> ClientCert {
        ClientCert {
            chain: self.chain.clone(),
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key.serialize_der())),
        }
    }
}

// === impl ClientCert ===

impl Clone for ClientCert {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}
