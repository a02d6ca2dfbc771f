use ipnet::IpNet;
use std::net::IpAddr;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum IpSource {
    /// The address of the TCP peer.
    Peer,
    /// The client address derived from `X-Forwarded-For`.
    Remote,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IpRule {
    pub source: IpSource,
    pub net: IpNet,
}

/// Allow and deny rules. An empty filter permits everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IpFilter {
    pub allow: Vec<IpRule>,
    pub deny: Vec<IpRule>,
}

// === impl IpFilter ===

impl IpFilter {
    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }

    /// Returns `self` if it has any rules, else `parent`.
    pub fn or_inherit(self, parent: &IpFilter) -> IpFilter {
        if self.is_empty() {
            parent.clone()
        } else {
            self
        }
    }

    /// Any deny match rejects; when allow rules exist, one must match.
    pub fn permits(&self, peer: IpAddr, remote: IpAddr) -> bool {
        let hit = |rule: &IpRule| {
            let addr = match rule.source {
                IpSource::Peer => peer,
                IpSource::Remote => remote,
            };
            rule.net.contains(&addr)
        };
        if self.deny.iter().any(hit) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(hit)
    }
}

/// Derives the client address from the peer and the `X-Forwarded-For`
/// header, trusting `num_trusted_hops` proxies in front of this one.
///
/// Falls back to the peer address when the header has too few entries or
/// the selected entry does not parse.
pub fn client_address(peer: IpAddr, xff: Option<&str>, num_trusted_hops: usize) -> IpAddr {
    if num_trusted_hops == 0 {
        return peer;
    }
    let hops = xff
        .map(|v| v.split(',').map(str::trim).collect::<Vec<_>>())
        .unwrap_or_default();
    // The peer itself counts as the last hop.
    let len = hops.len() + 1;
    if num_trusted_hops >= len {
        return peer;
    }
    hops[len - 1 - num_trusted_hops]
        .parse()
        .unwrap_or(peer)
}
