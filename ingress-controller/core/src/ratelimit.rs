use crate::routes::{HeaderMatch, RequestRef};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use std::{net::IpAddr, sync::Arc, time::Duration};
use tokio::time::Instant;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RateLimitUnit {
    Second,
    Minute,
    Hour,
}

/// Rate limit policies declared on a virtual host or a route.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RateLimitPolicy {
    pub local: Option<LocalRateLimitPolicy>,
    pub global: Option<GlobalRateLimitPolicy>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalRateLimitPolicy {
    pub requests: u32,
    pub unit: RateLimitUnit,
    pub burst: u32,
    pub response_status: StatusCode,
    pub response_headers: Vec<(HeaderName, HeaderValue)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GlobalRateLimitPolicy {
    pub disabled: bool,
    pub descriptors: Vec<Descriptor>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Descriptor {
    pub entries: Vec<DescriptorEntry>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DescriptorEntry {
    GenericKey {
        key: String,
        value: String,
    },
    RequestHeader {
        header: HeaderName,
        key: String,
    },
    RequestHeaderValueMatch {
        headers: Vec<HeaderMatch>,
        expect_match: bool,
        value: String,
    },
    RemoteAddress,
}

/// How a route's rate limit policies combine with its virtual host's.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum VhostRateLimits {
    /// A route policy replaces the virtual host policy of the same kind.
    #[default]
    Override,
    /// Both policies apply.
    Include,
    /// The virtual host policy does not apply.
    Ignore,
}

/// A local policy bound to the identity of the bucket that enforces it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalRateLimit {
    pub key: Arc<str>,
    pub policy: LocalRateLimitPolicy,
}

/// The effective rate limits for a route.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RateLimits {
    pub local: Vec<LocalRateLimit>,
    pub global: Vec<GlobalRateLimitPolicy>,
}

/// A token bucket holding `requests + burst` tokens, refilled with
/// `requests` tokens at each elapsed unit.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    fill: u64,
    interval: Duration,
    tokens: u64,
    last_fill: Instant,
}

pub const GENERIC_KEY: &str = "generic_key";
pub const HEADER_MATCH_KEY: &str = "header_match";
pub const REMOTE_ADDRESS_KEY: &str = "remote_address";

/// Combines the policies of a virtual host and one of its routes.
pub fn compose(
    vhost_key: &str,
    vhost: &RateLimitPolicy,
    route_key: &str,
    route: &RateLimitPolicy,
    mode: VhostRateLimits,
) -> RateLimits {
    let mut limits = RateLimits::default();

    let vhost_local = vhost.local.clone().map(|policy| LocalRateLimit {
        key: vhost_key.into(),
        policy,
    });
    let route_local = route.local.clone().map(|policy| LocalRateLimit {
        key: route_key.into(),
        policy,
    });
    let vhost_global = vhost.global.clone().filter(|g| !g.disabled);
    let route_global = route.global.clone();

    match mode {
        VhostRateLimits::Override => {
            limits.local.extend(route_local.or(vhost_local));
            // A disabled route policy still replaces the virtual host's.
            limits.global.extend(route_global.or(vhost_global));
        }
        VhostRateLimits::Include => {
            limits.local.extend(vhost_local);
            limits.local.extend(route_local);
            limits.global.extend(vhost_global);
            limits.global.extend(route_global);
        }
        VhostRateLimits::Ignore => {
            limits.local.extend(route_local);
            limits.global.extend(route_global);
        }
    }
    limits.global.retain(|g| !g.disabled);
    limits
}

// === impl RateLimitUnit ===

impl RateLimitUnit {
    pub fn as_duration(&self) -> Duration {
        match self {
            Self::Second => Duration::from_secs(1),
            Self::Minute => Duration::from_secs(60),
            Self::Hour => Duration::from_secs(60 * 60),
        }
    }
}

impl std::str::FromStr for RateLimitUnit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "second" => Ok(Self::Second),
            "minute" => Ok(Self::Minute),
            "hour" => Ok(Self::Hour),
            s => anyhow::bail!("unsupported rate limit unit: {s}"),
        }
    }
}

// === impl Descriptor ===

impl Descriptor {
    /// Produces the descriptor's key/value entries for a request.
    ///
    /// Returns `None` if any entry cannot be produced, e.g. when a referenced
    /// header is absent, in which case the descriptor is skipped.
    pub fn evaluate(&self, req: &RequestRef<'_>, remote: IpAddr) -> Option<Vec<(String, String)>> {
        self.entries
            .iter()
            .map(|entry| entry.evaluate(req, remote))
            .collect()
    }
}

impl DescriptorEntry {
    fn evaluate(&self, req: &RequestRef<'_>, remote: IpAddr) -> Option<(String, String)> {
        match self {
            Self::GenericKey { key, value } => Some((key.clone(), value.clone())),
            Self::RequestHeader { header, key } => {
                let value = req.headers.get(header)?.to_str().ok()?;
                Some((key.clone(), value.to_string()))
            }
            Self::RequestHeaderValueMatch {
                headers,
                expect_match,
                value,
            } => {
                let matched = headers.iter().all(|h| h.matches(req));
                (matched == *expect_match).then(|| (HEADER_MATCH_KEY.to_string(), value.clone()))
            }
            Self::RemoteAddress => Some((REMOTE_ADDRESS_KEY.to_string(), remote.to_string())),
        }
    }
}

// === impl TokenBucket ===

impl TokenBucket {
    pub fn new(policy: &LocalRateLimitPolicy, now: Instant) -> Self {
        let capacity = u64::from(policy.requests) + u64::from(policy.burst);
        Self {
            capacity,
            fill: u64::from(policy.requests),
            interval: policy.unit.as_duration(),
            tokens: capacity,
            last_fill: now,
        }
    }

    /// Takes a token if one is available.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_fill);
        let intervals = elapsed.as_nanos() / self.interval.as_nanos().max(1);
        if intervals > 0 {
            let added = self
                .fill
                .saturating_mul(u64::try_from(intervals).unwrap_or(u64::MAX));
            self.tokens = self.tokens.saturating_add(added).min(self.capacity);
            self.last_fill += self.interval * u32::try_from(intervals).unwrap_or(u32::MAX);
        }
        if self.tokens == 0 {
            return false;
        }
        self.tokens -= 1;
        true
    }
}

/// Converts the headers a rate limited response carries.
pub fn response_headers(policy: &LocalRateLimitPolicy) -> HeaderMap {
    policy.response_headers.iter().cloned().collect()
}
