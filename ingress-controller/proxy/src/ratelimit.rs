//! Local token buckets and the in-process global rate limit service.

use ahash::AHashMap as HashMap;
use ingress_controller_core::ratelimit::{LocalRateLimit, LocalRateLimitPolicy, TokenBucket};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// Per-key token buckets enforcing local rate limit policies.
///
/// A bucket is replaced when the policy bound to its key changes.
#[derive(Debug, Default)]
pub(crate) struct LocalRateLimiter {
    buckets: Mutex<HashMap<Arc<str>, (LocalRateLimitPolicy, TokenBucket)>>,
}

/// Decides whether a request described by a set of descriptors is over its
/// limit.
#[async_trait::async_trait]
pub trait RateLimitService: Send + Sync + 'static {
    async fn should_rate_limit(&self, domain: &str, descriptors: &[Vec<(String, String)>])
        -> bool;
}

/// A rate limit service that counts requests in memory with fixed windows.
///
/// Its configuration follows the descriptor format of the Envoy rate limit
/// service: one YAML document per domain, each with a tree of descriptors.
#[derive(Debug)]
pub struct InMemoryRateLimitService {
    domains: HashMap<String, Vec<DescriptorConfig>>,
    start: Instant,
    counters: Mutex<HashMap<String, (u64, u32)>>,
}

#[derive(Clone, Debug, Deserialize)]
struct DomainConfig {
    domain: String,
    #[serde(default)]
    descriptors: Vec<DescriptorConfig>,
}

#[derive(Clone, Debug, Deserialize)]
struct DescriptorConfig {
    key: String,
    value: Option<String>,
    rate_limit: Option<LimitConfig>,
    #[serde(default)]
    descriptors: Vec<DescriptorConfig>,
}

#[derive(Clone, Debug, Deserialize)]
struct LimitConfig {
    #[serde(default)]
    unlimited: bool,
    unit: Option<Unit>,
    #[serde(default)]
    requests_per_unit: u32,
}

#[derive(Copy, Clone, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Unit {
    Second,
    Minute,
    Hour,
    Day,
}

// === impl LocalRateLimiter ===

impl LocalRateLimiter {
    /// Takes a token from each bucket in order, returning the policy of the
    /// first bucket that is empty.
    pub(crate) fn check<'l>(&self, limits: &'l [LocalRateLimit]) -> Option<&'l LocalRateLimitPolicy> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        for limit in limits {
            let (policy, bucket) = buckets
                .entry(limit.key.clone())
                .or_insert_with(|| (limit.policy.clone(), TokenBucket::new(&limit.policy, now)));
            if *policy != limit.policy {
                *policy = limit.policy.clone();
                *bucket = TokenBucket::new(&limit.policy, now);
            }
            if !bucket.try_acquire(now) {
                return Some(&limit.policy);
            }
        }
        None
    }

    /// Drops buckets whose keys are no longer in use.
    pub(crate) fn retain(&self, keys: &ahash::AHashSet<Arc<str>>) {
        self.buckets.lock().retain(|k, _| keys.contains(k));
    }
}

// === impl InMemoryRateLimitService ===

impl InMemoryRateLimitService {
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let mut domains = HashMap::default();
        for doc in serde_yaml::Deserializer::from_str(yaml) {
            let config = DomainConfig::deserialize(doc)?;
            if domains.contains_key(&config.domain) {
                anyhow::bail!("duplicate rate limit domain: {}", config.domain);
            }
            domains.insert(config.domain, config.descriptors);
        }
        Ok(Self {
            domains,
            start: Instant::now(),
            counters: Default::default(),
        })
    }

    fn limit(&self, domain: &str, entries: &[(String, String)]) -> Option<&LimitConfig> {
        let mut nodes = self.domains.get(domain)?;
        let mut limit = None;
        for (key, value) in entries {
            let node = nodes
                .iter()
                .find(|d| d.key == *key && d.value.as_deref() == Some(value.as_str()))
                .or_else(|| nodes.iter().find(|d| d.key == *key && d.value.is_none()))?;
            limit = node.rate_limit.as_ref();
            nodes = &node.descriptors;
        }
        limit
    }
}

#[async_trait::async_trait]
impl RateLimitService for InMemoryRateLimitService {
    async fn should_rate_limit(
        &self,
        domain: &str,
        descriptors: &[Vec<(String, String)>],
    ) -> bool {
        let elapsed = Instant::now().saturating_duration_since(self.start);
        let mut over = false;
        let mut counters = self.counters.lock();
        for entries in descriptors {
            let Some(limit) = self.limit(domain, entries) else {
                continue;
            };
            let Some(unit) = limit.unit.filter(|_| !limit.unlimited) else {
                continue;
            };

            let window = elapsed.as_secs() / unit.as_duration().as_secs();
            let key = entries
                .iter()
                .fold(domain.to_string(), |k, (name, value)| format!("{k}_{name}_{value}"));
            let (current, hits) = counters.entry(key).or_insert((window, 0));
            if *current != window {
                *current = window;
                *hits = 0;
            }
            *hits = hits.saturating_add(1);
            if *hits > limit.requests_per_unit {
                tracing::debug!(?entries, "Over limit");
                over = true;
            }
        }
        over
    }
}

impl Unit {
    fn as_duration(self) -> Duration {
        match self {
            Self::Second => Duration::from_secs(1),
            Self::Minute => Duration::from_secs(60),
            Self::Hour => Duration::from_secs(60 * 60),
            Self::Day => Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingress_controller_core::{ratelimit::RateLimitUnit, StatusCode};

    const CONFIG: &str = r#"
domain: ingress
descriptors:
  - key: generic_key
    value: vhostlimit
    rate_limit:
      unit: hour
      requests_per_unit: 1
  - key: remote_address
    rate_limit:
      unit: minute
      requests_per_unit: 2
  - key: generic_key
    value: tree
    descriptors:
      - key: header_match
        value: admin
        rate_limit:
          unlimited: true
      - key: header_match
        rate_limit:
          unit: second
          requests_per_unit: 1
---
domain: other
descriptors:
  - key: generic_key
    value: vhostlimit
    rate_limit:
      unit: hour
      requests_per_unit: 100
"#;

    fn entries(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_windows() {
        let svc = InMemoryRateLimitService::from_yaml(CONFIG).unwrap();
        let vhost = vec![entries(&[("generic_key", "vhostlimit")])];
        assert!(!svc.should_rate_limit("ingress", &vhost).await);
        assert!(svc.should_rate_limit("ingress", &vhost).await);
        assert!(!svc.should_rate_limit("other", &vhost).await);

        tokio::time::advance(Duration::from_secs(60 * 60)).await;
        assert!(!svc.should_rate_limit("ingress", &vhost).await);
    }

    #[tokio::test(start_paused = true)]
    async fn values_are_counted_separately() {
        let svc = InMemoryRateLimitService::from_yaml(CONFIG).unwrap();
        let a = vec![entries(&[("remote_address", "10.0.0.1")])];
        let b = vec![entries(&[("remote_address", "10.0.0.2")])];
        assert!(!svc.should_rate_limit("ingress", &a).await);
        assert!(!svc.should_rate_limit("ingress", &a).await);
        assert!(svc.should_rate_limit("ingress", &a).await);
        assert!(!svc.should_rate_limit("ingress", &b).await);
    }

    #[tokio::test(start_paused = true)]
    async fn nested_descriptors() {
        let svc = InMemoryRateLimitService::from_yaml(CONFIG).unwrap();
        let admin = vec![entries(&[("generic_key", "tree"), ("header_match", "admin")])];
        let user = vec![entries(&[("generic_key", "tree"), ("header_match", "user")])];
        for _ in 0..5 {
            assert!(!svc.should_rate_limit("ingress", &admin).await);
        }
        assert!(!svc.should_rate_limit("ingress", &user).await);
        assert!(svc.should_rate_limit("ingress", &user).await);

        // A partial descriptor has no limit of its own.
        let partial = vec![entries(&[("generic_key", "tree")])];
        assert!(!svc.should_rate_limit("ingress", &partial).await);
        // Unknown keys are never limited.
        let unknown = vec![entries(&[("generic_key", "unknown")])];
        assert!(!svc.should_rate_limit("ingress", &unknown).await);
    }

    #[test]
    fn duplicate_domains() {
        let yaml = "domain: a\n---\ndomain: a\n";
        assert!(InMemoryRateLimitService::from_yaml(yaml).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn local_buckets_are_keyed() {
        let policy = LocalRateLimitPolicy {
            requests: 1,
            unit: RateLimitUnit::Minute,
            burst: 0,
            response_status: StatusCode::TOO_MANY_REQUESTS,
            response_headers: vec![],
        };
        let vhost = LocalRateLimit {
            key: "vhost/a.example.com".into(),
            policy: policy.clone(),
        };
        let other = LocalRateLimit {
            key: "vhost/b.example.com".into(),
            policy: policy.clone(),
        };
        let limiter = LocalRateLimiter::default();
        assert_eq!(limiter.check(std::slice::from_ref(&vhost)), None);
        assert_eq!(limiter.check(std::slice::from_ref(&vhost)), Some(&policy));
        assert_eq!(limiter.check(std::slice::from_ref(&other)), None);

        // A changed policy starts with a full bucket.
        let raised = LocalRateLimit {
            key: vhost.key.clone(),
            policy: LocalRateLimitPolicy {
                requests: 2,
                ..policy.clone()
            },
        };
        assert_eq!(limiter.check(std::slice::from_ref(&raised)), None);
        assert_eq!(limiter.check(std::slice::from_ref(&raised)), None);
        assert!(limiter.check(std::slice::from_ref(&raised)).is_some());
    }
}
