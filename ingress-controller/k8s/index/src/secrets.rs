use ahash::AHashMap as HashMap;
use ingress_controller_core::tls::TlsCertificate;
use ingress_controller_k8s_api::{self as k8s, ResourceExt};
use std::collections::BTreeMap;

pub(crate) const TLS_CERT_KEY: &str = "tls.crt";
pub(crate) const TLS_KEY_KEY: &str = "tls.key";
pub(crate) const CA_CERT_KEY: &str = "ca.crt";
pub(crate) const CRL_KEY: &str = "crl.pem";

#[derive(Debug, Default)]
pub(crate) struct SecretIndex {
    secrets: HashMap<(String, String), BTreeMap<String, Vec<u8>>>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum InvalidSecret {
    #[error("secret \"{0}\" not found")]
    NotFound(String),

    #[error("secret \"{secret}\" is missing key {key:?}")]
    MissingKey { secret: String, key: &'static str },

    #[error("secret \"{secret}\" key {key:?} holds no valid PEM {kind}")]
    InvalidPem {
        secret: String,
        key: &'static str,
        kind: &'static str,
    },
}

/// Splits a `name` or `namespace/name` reference, defaulting to `namespace`.
pub(crate) fn secret_ref<'a>(namespace: &'a str, reference: &'a str) -> (&'a str, &'a str) {
    reference.split_once('/').unwrap_or((namespace, reference))
}

// === impl SecretIndex ===

impl SecretIndex {
    pub(crate) fn apply(&mut self, secret: k8s::Secret) -> bool {
        let key = (secret.namespace().unwrap_or_default(), secret.name_unchecked());
        let data = secret
            .data
            .into_iter()
            .flatten()
            .map(|(k, v)| (k, v.0))
            .chain(
                secret
                    .string_data
                    .into_iter()
                    .flatten()
                    .map(|(k, v)| (k, v.into_bytes())),
            )
            .collect::<BTreeMap<_, _>>();
        if self.secrets.get(&key) == Some(&data) {
            return false;
        }
        self.secrets.insert(key, data);
        true
    }

    pub(crate) fn delete(&mut self, namespace: String, name: String) -> bool {
        self.secrets.remove(&(namespace, name)).is_some()
    }

    pub(crate) fn count(&self, namespace: &str) -> usize {
        self.secrets.keys().filter(|(ns, _)| ns == namespace).count()
    }

    fn get(&self, namespace: &str, name: &str) -> Result<&BTreeMap<String, Vec<u8>>, InvalidSecret> {
        self.secrets
            .get(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| InvalidSecret::NotFound(format!("{namespace}/{name}")))
    }

    fn key(&self, namespace: &str, name: &str, key: &'static str) -> Result<&[u8], InvalidSecret> {
        self.get(namespace, name)?
            .get(key)
            .map(Vec::as_slice)
            .ok_or_else(|| InvalidSecret::MissingKey {
                secret: format!("{namespace}/{name}"),
                key,
            })
    }

    /// A server certificate chain and its private key.
    pub(crate) fn certificate(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<TlsCertificate, InvalidSecret> {
        let secret = format!("{namespace}/{name}");
        let chain_pem = self.key(namespace, name, TLS_CERT_KEY)?;
        if !has_certs(chain_pem) {
            return Err(InvalidSecret::InvalidPem {
                secret,
                key: TLS_CERT_KEY,
                kind: "certificates",
            });
        }
        let key_pem = self.key(namespace, name, TLS_KEY_KEY)?;
        if !matches!(rustls_pemfile::private_key(&mut &*key_pem), Ok(Some(_))) {
            return Err(InvalidSecret::InvalidPem {
                secret,
                key: TLS_KEY_KEY,
                kind: "private key",
            });
        }
        Ok(TlsCertificate {
            secret,
            chain_pem: chain_pem.to_vec(),
            key_pem: key_pem.to_vec(),
        })
    }

    /// A CA bundle.
    pub(crate) fn ca_bundle(&self, namespace: &str, name: &str) -> Result<Vec<u8>, InvalidSecret> {
        let pem = self.key(namespace, name, CA_CERT_KEY)?;
        if !has_certs(pem) {
            return Err(InvalidSecret::InvalidPem {
                secret: format!("{namespace}/{name}"),
                key: CA_CERT_KEY,
                kind: "certificates",
            });
        }
        Ok(pem.to_vec())
    }

    /// Certificate revocation lists.
    pub(crate) fn crls(&self, namespace: &str, name: &str) -> Result<Vec<u8>, InvalidSecret> {
        let pem = self.key(namespace, name, CRL_KEY)?;
        let mut rd = pem;
        let mut found = false;
        for crl in rustls_pemfile::crls(&mut rd) {
            if crl.is_err() {
                found = false;
                break;
            }
            found = true;
        }
        if !found {
            return Err(InvalidSecret::InvalidPem {
                secret: format!("{namespace}/{name}"),
                key: CRL_KEY,
                kind: "CRLs",
            });
        }
        Ok(pem.to_vec())
    }
}

fn has_certs(pem: &[u8]) -> bool {
    let mut rd = pem;
    let mut certs = rustls_pemfile::certs(&mut rd).peekable();
    certs.peek().is_some() && certs.all(|c| c.is_ok())
}
