//! Converts `HTTPProxy` policy fields into the data-plane model.
//!
//! Specs are statically validated before conversion, so values that fail to
//! convert here are skipped rather than reported.

use crate::conditions::header_match;
use ingress_controller_core::{
    authz::AuthPolicy,
    cookie::CookieRewrite,
    headers::{HeaderTemplate, HeadersPolicy},
    ip_filter::{IpFilter, IpRule, IpSource},
    ratelimit::{
        Descriptor, DescriptorEntry, GlobalRateLimitPolicy, LocalRateLimitPolicy, RateLimitPolicy,
        VhostRateLimits, GENERIC_KEY,
    },
    redirect::{
        CrossSchemeRedirect, DirectResponse, InternalRedirectPolicy, PathModifier, RequestRedirect,
        ResponseOverride, StatusMatch,
    },
    retry::{HealthCheckPolicy, RetryPolicy},
    rewrite::PrefixReplacement,
    HeaderName, HeaderValue, StatusCode,
};
use ingress_controller_k8s_api::{duration::Timeout, httpproxy as api, validation::parse_cidr};
use std::time::Duration;

/// Upstream response timeout when a route sets no timeout policy.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(15);

const DEFAULT_RESPONSE_CONTENT_TYPE: &str = "text/plain";

pub(crate) fn headers(policy: Option<&api::HeadersPolicy>) -> HeadersPolicy {
    let Some(policy) = policy else {
        return HeadersPolicy::default();
    };
    HeadersPolicy {
        set: policy
            .set
            .iter()
            .filter_map(|h| {
                let name = HeaderName::from_bytes(h.name.to_ascii_lowercase().as_bytes()).ok()?;
                Some((name, HeaderTemplate::parse(&h.value)))
            })
            .collect(),
        remove: policy
            .remove
            .iter()
            .filter_map(|n| HeaderName::from_bytes(n.to_ascii_lowercase().as_bytes()).ok())
            .collect(),
    }
}

pub(crate) fn cookie_rewrites(policies: &[api::CookieRewritePolicy]) -> Vec<CookieRewrite> {
    policies
        .iter()
        .map(|p| CookieRewrite {
            name: p.name.clone(),
            path: p.path_rewrite.as_ref().map(|r| r.value.clone()),
            domain: p.domain_rewrite.as_ref().map(|r| r.value.clone()),
            same_site: p.same_site.as_deref().and_then(|s| s.parse().ok()),
            secure: p.secure,
        })
        .collect()
}

pub(crate) fn rate_limits(policy: Option<&api::RateLimitPolicy>) -> (RateLimitPolicy, VhostRateLimits) {
    let Some(policy) = policy else {
        return Default::default();
    };
    let local = policy.local.as_ref().and_then(|l| {
        Some(LocalRateLimitPolicy {
            requests: l.requests,
            unit: l.unit.parse().ok()?,
            burst: l.burst,
            response_status: l
                .response_status_code
                .and_then(|c| StatusCode::from_u16(u16::try_from(c).ok()?).ok())
                .unwrap_or(StatusCode::TOO_MANY_REQUESTS),
            response_headers: l
                .response_headers_to_add
                .iter()
                .filter_map(|h| {
                    Some((
                        HeaderName::from_bytes(h.name.to_ascii_lowercase().as_bytes()).ok()?,
                        HeaderValue::from_str(&h.value).ok()?,
                    ))
                })
                .collect(),
        })
    });
    let global = policy.global.as_ref().map(|g| GlobalRateLimitPolicy {
        disabled: g.disabled,
        descriptors: g
            .descriptors
            .iter()
            .map(|d| Descriptor {
                entries: d.entries.iter().filter_map(descriptor_entry).collect(),
            })
            .collect(),
    });
    let mode = match policy.vhost_rate_limits.as_deref() {
        Some("Include") => VhostRateLimits::Include,
        Some("Ignore") => VhostRateLimits::Ignore,
        _ => VhostRateLimits::Override,
    };
    (RateLimitPolicy { local, global }, mode)
}

fn descriptor_entry(entry: &api::RateLimitDescriptorEntry) -> Option<DescriptorEntry> {
    if let Some(g) = &entry.generic_key {
        return Some(DescriptorEntry::GenericKey {
            key: g.key.clone().unwrap_or_else(|| GENERIC_KEY.to_string()),
            value: g.value.clone(),
        });
    }
    if let Some(h) = &entry.request_header {
        return Some(DescriptorEntry::RequestHeader {
            header: HeaderName::from_bytes(h.header_name.to_ascii_lowercase().as_bytes()).ok()?,
            key: h.descriptor_key.clone(),
        });
    }
    if let Some(m) = &entry.request_header_value_match {
        return Some(DescriptorEntry::RequestHeaderValueMatch {
            headers: m.headers.iter().filter_map(|h| header_match(h).ok()).collect(),
            expect_match: m.expect_match.unwrap_or(true),
            value: m.value.clone(),
        });
    }
    entry
        .remote_address
        .as_ref()
        .map(|_| DescriptorEntry::RemoteAddress)
}

pub(crate) fn ip_filter(allow: &[api::IpFilterPolicy], deny: &[api::IpFilterPolicy]) -> IpFilter {
    let rules = |policies: &[api::IpFilterPolicy]| {
        policies
            .iter()
            .filter_map(|p| {
                let source = match p.source.as_str() {
                    "Peer" => IpSource::Peer,
                    "Remote" => IpSource::Remote,
                    _ => return None,
                };
                Some(IpRule {
                    source,
                    net: parse_cidr(&p.cidr)?,
                })
            })
            .collect()
    };
    IpFilter {
        allow: rules(allow),
        deny: rules(deny),
    }
}

pub(crate) fn auth_policy(policy: Option<&api::AuthorizationPolicy>) -> Option<AuthPolicy> {
    policy.map(|p| AuthPolicy {
        disabled: p.disabled,
        context: p.context.clone(),
    })
}

/// The upstream response timeout. `infinity` disables it.
pub(crate) fn response_timeout(policy: Option<&api::TimeoutPolicy>) -> Option<Duration> {
    match policy.and_then(|p| p.response.as_deref()) {
        None => Some(DEFAULT_RESPONSE_TIMEOUT),
        Some(t) => t
            .parse::<Timeout>()
            .map(Timeout::duration)
            .unwrap_or(Some(DEFAULT_RESPONSE_TIMEOUT)),
    }
}

pub(crate) fn retry(policy: Option<&api::RetryPolicy>) -> Option<RetryPolicy> {
    let policy = policy?;
    Some(RetryPolicy {
        count: policy.count.unwrap_or(1),
        per_try_timeout: policy.per_try_timeout.map(Into::into),
        retry_on: policy.retry_on.iter().filter_map(|r| r.parse().ok()).collect(),
        retriable_status_codes: policy
            .retriable_status_codes
            .iter()
            .filter_map(|c| u16::try_from(*c).ok())
            .collect(),
    })
}

pub(crate) fn health_check(policy: Option<&api::HttpHealthCheckPolicy>) -> Option<HealthCheckPolicy> {
    let policy = policy?;
    let defaults = HealthCheckPolicy::default();
    Some(HealthCheckPolicy {
        path: policy.path.clone(),
        host: policy.host.clone().unwrap_or(defaults.host),
        interval: policy
            .interval_seconds
            .map(Duration::from_secs)
            .unwrap_or(defaults.interval),
        timeout: policy
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeout),
        unhealthy_threshold: policy
            .unhealthy_threshold_count
            .unwrap_or(defaults.unhealthy_threshold),
        healthy_threshold: policy
            .healthy_threshold_count
            .unwrap_or(defaults.healthy_threshold),
    })
}

pub(crate) fn path_rewrite(policy: Option<&api::PathRewritePolicy>) -> Vec<PrefixReplacement> {
    policy
        .map(|p| {
            p.replace_prefix
                .iter()
                .map(|r| PrefixReplacement {
                    prefix: r.prefix.clone(),
                    replacement: r.replacement.clone(),
                })
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn internal_redirect(
    policy: Option<&api::HttpInternalRedirectPolicy>,
) -> Option<InternalRedirectPolicy> {
    let policy = policy?;
    let defaults = InternalRedirectPolicy::default();
    let codes = policy
        .redirect_response_codes
        .iter()
        .filter_map(|c| StatusCode::from_u16(u16::try_from(*c).ok()?).ok())
        .collect::<Vec<_>>();
    Some(InternalRedirectPolicy {
        max_internal_redirects: policy
            .max_internal_redirects
            .unwrap_or(defaults.max_internal_redirects),
        redirect_response_codes: if codes.is_empty() {
            defaults.redirect_response_codes
        } else {
            codes
        },
        allow_cross_scheme_redirect: match policy.allow_cross_scheme_redirect.as_deref() {
            Some("SafeOnly") => CrossSchemeRedirect::SafeOnly,
            Some("Always") => CrossSchemeRedirect::Always,
            _ => CrossSchemeRedirect::Never,
        },
        deny_repeated_route_redirect: policy.deny_repeated_route_redirect,
    })
}

pub(crate) fn direct_response(policy: &api::HttpDirectResponsePolicy) -> Option<DirectResponse> {
    Some(DirectResponse {
        status: StatusCode::from_u16(u16::try_from(policy.status_code).ok()?).ok()?,
        body: policy.body.clone(),
    })
}

pub(crate) fn request_redirect(policy: &api::HttpRequestRedirectPolicy) -> Option<RequestRedirect> {
    let status = match policy.status_code {
        None => StatusCode::FOUND,
        Some(c) => StatusCode::from_u16(u16::try_from(c).ok()?).ok()?,
    };
    let path = match (&policy.path, &policy.prefix) {
        (Some(p), _) => Some(PathModifier::Full(p.clone())),
        (None, Some(p)) => Some(PathModifier::Prefix(p.clone())),
        (None, None) => None,
    };
    Some(RequestRedirect {
        scheme: policy.scheme.clone(),
        hostname: policy.hostname.clone(),
        port: policy.port.and_then(|p| u16::try_from(p).ok()),
        status,
        path,
    })
}

pub(crate) fn response_overrides(policies: &[api::HttpResponseOverridePolicy]) -> Vec<ResponseOverride> {
    policies
        .iter()
        .map(|p| ResponseOverride {
            statuses: p
                .match_
                .status_codes
                .iter()
                .filter_map(|m| match (m.type_.as_str(), m.value, &m.range) {
                    ("Value", Some(v), _) => Some(StatusMatch::Value(u16::try_from(v).ok()?)),
                    ("Range", _, Some(r)) => Some(StatusMatch::Range {
                        start: u16::try_from(r.start).ok()?,
                        end: u16::try_from(r.end).ok()?,
                    }),
                    _ => None,
                })
                .collect(),
            content_type: p
                .response
                .content_type
                .clone()
                .unwrap_or_else(|| DEFAULT_RESPONSE_CONTENT_TYPE.to_string()),
            body: p.response.body.clone(),
        })
        .collect()
}

/// Resolves backend weights: when no service sets a weight, all are equal;
/// otherwise unset weights are zero.
pub(crate) fn weights(services: &[api::Service]) -> Vec<u32> {
    if services.iter().all(|s| s.weight.is_none()) {
        return vec![1; services.len()];
    }
    services.iter().map(|s| s.weight.unwrap_or(0)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_weights_by_default() {
        let svc = |weight| api::Service {
            weight,
            ..api::Service::new("svc", 80)
        };
        assert_eq!(weights(&[svc(None), svc(None)]), vec![1, 1]);
        assert_eq!(weights(&[svc(Some(90)), svc(None)]), vec![90, 0]);
    }

    #[test]
    fn response_timeouts() {
        assert_eq!(response_timeout(None), Some(DEFAULT_RESPONSE_TIMEOUT));
        let policy = |s: &str| api::TimeoutPolicy {
            response: Some(s.to_string()),
        };
        assert_eq!(response_timeout(Some(&policy("infinity"))), None);
        assert_eq!(
            response_timeout(Some(&policy("1s"))),
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    fn rate_limit_modes() {
        let (policy, mode) = rate_limits(Some(&api::RateLimitPolicy {
            local: Some(api::LocalRateLimitPolicy {
                requests: 5,
                unit: "second".to_string(),
                response_status_code: Some(503),
                ..Default::default()
            }),
            global: Some(api::GlobalRateLimitPolicy {
                disabled: false,
                descriptors: vec![api::RateLimitDescriptor {
                    entries: vec![api::RateLimitDescriptorEntry {
                        generic_key: Some(api::GenericKeyDescriptor {
                            key: None,
                            value: "foo".to_string(),
                        }),
                        ..Default::default()
                    }],
                }],
            }),
            vhost_rate_limits: Some("Include".to_string()),
        }));
        assert_eq!(mode, VhostRateLimits::Include);
        let local = policy.local.unwrap();
        assert_eq!(local.response_status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            policy.global.unwrap().descriptors[0].entries,
            vec![DescriptorEntry::GenericKey {
                key: GENERIC_KEY.to_string(),
                value: "foo".to_string(),
            }]
        );
    }

    #[test]
    fn redirects_default_to_found() {
        let r = request_redirect(&api::HttpRequestRedirectPolicy {
            prefix: Some("/new".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(r.status, StatusCode::FOUND);
        assert_eq!(r.path, Some(PathModifier::Prefix("/new".to_string())));
    }
}
