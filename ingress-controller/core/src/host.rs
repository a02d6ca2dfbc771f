use crate::VirtualHost;
use ahash::AHashMap as HashMap;
use std::sync::Arc;

/// Virtual hosts indexed by FQDN.
///
/// A wildcard `*.example.com` matches exactly one label below
/// `example.com`. Exact names always take precedence over wildcards.
#[derive(Clone, Debug, Default)]
pub struct VirtualHosts {
    exact: HashMap<String, Arc<VirtualHost>>,
    wildcard: HashMap<String, Arc<VirtualHost>>,
}

/// Normalizes a `Host` header or SNI value: lowercased, without a port or a
/// trailing dot.
pub fn canonical_host(host: &str) -> String {
    let host = host.trim();
    let host = if let Some(rest) = host.strip_prefix('[') {
        // IPv6 literal, possibly with a port.
        match rest.split_once(']') {
            Some((addr, _)) => addr,
            None => rest,
        }
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => host,
        }
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}

// === impl VirtualHosts ===

impl VirtualHosts {
    pub fn insert(&mut self, vhost: Arc<VirtualHost>) {
        let fqdn = vhost.fqdn.to_ascii_lowercase();
        match fqdn.strip_prefix("*.") {
            Some(suffix) => self.wildcard.insert(suffix.to_string(), vhost),
            None => self.exact.insert(fqdn, vhost),
        };
    }

    pub fn get(&self, host: &str) -> Option<&Arc<VirtualHost>> {
        let host = canonical_host(host);
        if let Some(vhost) = self.exact.get(&host) {
            return Some(vhost);
        }
        let (_, parent) = host.split_once('.')?;
        self.wildcard.get(parent)
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<VirtualHost>> {
        self.exact.values().chain(self.wildcard.values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProxyRef;

    fn vhost(fqdn: &str) -> Arc<VirtualHost> {
        Arc::new(VirtualHost::new(
            fqdn.to_string(),
            ProxyRef::new("ns", fqdn),
            None,
            None,
            vec![],
        ))
    }

    #[test]
    fn canonicalizes() {
        assert_eq!(canonical_host("Example.COM:8080"), "example.com");
        assert_eq!(canonical_host("example.com."), "example.com");
        assert_eq!(canonical_host("[::1]:443"), "::1");
        assert_eq!(canonical_host("example.com"), "example.com");
    }

    #[test]
    fn wildcard_matches_one_label() {
        let mut hosts = VirtualHosts::default();
        hosts.insert(vhost("*.domain.io"));

        assert_eq!(hosts.get("sub.domain.io").unwrap().fqdn, "*.domain.io");
        assert_eq!(hosts.get("SUB.domain.io:80").unwrap().fqdn, "*.domain.io");
        assert!(hosts.get("domain.io").is_none());
        assert!(hosts.get("a.b.domain.io").is_none());
    }

    #[test]
    fn exact_beats_wildcard() {
        let mut hosts = VirtualHosts::default();
        hosts.insert(vhost("*.domain.io"));
        hosts.insert(vhost("specific.domain.io"));
        hosts.insert(vhost("domain.io"));

        assert_eq!(
            hosts.get("specific.domain.io").unwrap().fqdn,
            "specific.domain.io"
        );
        assert_eq!(hosts.get("other.domain.io").unwrap().fqdn, "*.domain.io");
        assert_eq!(hosts.get("domain.io").unwrap().fqdn, "domain.io");
        assert_eq!(hosts.len(), 3);
    }
}
