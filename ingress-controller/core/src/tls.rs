use crate::host::canonical_host;
use std::{fmt, str::FromStr};

/// PEM-encoded certificate chain and private key, as read from a secret.
#[derive(Clone, PartialEq, Eq)]
pub struct TlsCertificate {
    /// `namespace/name` of the secret the material came from.
    pub secret: String,
    pub chain_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualHostTls {
    pub certificate: std::sync::Arc<TlsCertificate>,
    pub minimum_version: TlsVersion,
    pub fallback_certificate: bool,
    pub client_validation: Option<ClientValidation>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientValidation {
    pub ca_pem: Option<Vec<u8>>,
    pub crl_pem: Option<Vec<u8>>,
    pub only_verify_leaf_cert_crl: bool,
    pub skip_verification: bool,
    pub optional: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    #[default]
    V1_2,
    V1_3,
}

/// Whether a request's `Host` may be served on a connection established with
/// `sni`.
pub fn sni_matches_host(sni: &str, host: &str) -> bool {
    canonical_host(sni) == canonical_host(host)
}

// === impl TlsCertificate ===

impl fmt::Debug for TlsCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsCertificate")
            .field("secret", &self.secret)
            .finish_non_exhaustive()
    }
}

// === impl TlsVersion ===

impl FromStr for TlsVersion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "" | "1.2" => Ok(Self::V1_2),
            "1.3" => Ok(Self::V1_3),
            s => anyhow::bail!("unsupported TLS protocol version: {s}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sni_comparison() {
        assert!(sni_matches_host("foo.example.com", "FOO.example.com:443"));
        assert!(!sni_matches_host("foo.example.com", "bar.example.com"));
    }

    #[test]
    fn versions() {
        assert_eq!("1.3".parse::<TlsVersion>().unwrap(), TlsVersion::V1_3);
        assert_eq!("".parse::<TlsVersion>().unwrap(), TlsVersion::V1_2);
        assert!("1.1".parse::<TlsVersion>().is_err());
    }
}
