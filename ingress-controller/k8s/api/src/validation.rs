//! Static field validation of `HTTPProxy` specs.
//!
//! Errors are reported the way the Kubernetes API server reports schema
//! violations: a field path, a reason, and the offending value.

use crate::httpproxy::*;
use regex::Regex;
use std::{fmt, sync::OnceLock};

const FQDN_REGEX: &str =
    r"^(\*\.)?[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$";

pub const RETRY_ON: &[&str] = &[
    "5xx",
    "gateway-error",
    "reset",
    "connect-failure",
    "retriable-4xx",
    "refused-stream",
    "retriable-status-codes",
    "retriable-headers",
    "cancelled",
    "deadline-exceeded",
    "internal",
    "resource-exhausted",
    "unavailable",
];

const SAME_SITE: &[&str] = &["Strict", "Lax", "None"];
const REDIRECT_CODES: &[&str] = &["301", "302", "303", "307", "308"];
const IP_SOURCES: &[&str] = &["Peer", "Remote"];
const RATE_LIMIT_UNITS: &[&str] = &["second", "minute", "hour"];
const VHOST_RATE_LIMITS: &[&str] = &["Override", "Include", "Ignore"];
const PROTOCOLS: &[&str] = &["h2", "h2c", "tls"];
const TLS_VERSIONS: &[&str] = &["1.2", "1.3"];
const CROSS_SCHEME: &[&str] = &["Never", "SafeOnly", "Always"];
const SCHEMES: &[&str] = &["http", "https"];
const STATUS_MATCH_TYPES: &[&str] = &["Value", "Range"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub reason: Reason,
    pub detail: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reason {
    Required,
    Unsupported,
    Invalid,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldErrors(pub Vec<FieldError>);

/// Validates every field of `spec`, collecting all errors.
pub fn validate(spec: &HttpProxySpec) -> Result<(), FieldErrors> {
    let mut v = Validator::default();
    if let Some(vhost) = &spec.virtualhost {
        v.vhost("spec.virtualhost", vhost);
    }
    for (i, route) in spec.routes.iter().enumerate() {
        v.route(&format!("spec.routes[{i}]"), route);
    }
    for (i, inc) in spec.includes.iter().enumerate() {
        let path = format!("spec.includes[{i}]");
        if inc.name.is_empty() {
            v.required(&format!("{path}.name"));
        }
        for (j, c) in inc.conditions.iter().enumerate() {
            v.condition(&format!("{path}.conditions[{j}]"), c);
        }
    }
    if v.errors.is_empty() {
        Ok(())
    } else {
        Err(FieldErrors(v.errors))
    }
}

pub fn is_valid_fqdn(fqdn: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(FQDN_REGEX).expect("FQDN regex must compile"))
        .is_match(fqdn)
}

#[derive(Default)]
struct Validator {
    errors: Vec<FieldError>,
}

// === impl Validator ===

impl Validator {
    fn push(&mut self, field: &str, reason: Reason, detail: String) {
        self.errors.push(FieldError {
            field: field.to_string(),
            reason,
            detail,
        });
    }

    fn required(&mut self, field: &str) {
        self.push(field, Reason::Required, String::new());
    }

    fn invalid(&mut self, field: &str, value: impl fmt::Display, detail: impl ToString) {
        self.push(
            field,
            Reason::Invalid,
            format!("\"{value}\": {}", detail.to_string()),
        );
    }

    fn one_of(&mut self, field: &str, value: &str, supported: &[&str]) {
        if !supported.contains(&value) {
            let supported = supported
                .iter()
                .map(|s| format!("\"{s}\""))
                .collect::<Vec<_>>()
                .join(", ");
            self.push(
                field,
                Reason::Unsupported,
                format!("\"{value}\": supported values: {supported}"),
            );
        }
    }

    fn vhost(&mut self, path: &str, vhost: &VirtualHost) {
        if vhost.fqdn.is_empty() {
            self.required(&format!("{path}.fqdn"));
        } else if !is_valid_fqdn(&vhost.fqdn) {
            self.invalid(
                &format!("{path}.fqdn"),
                &vhost.fqdn,
                format!("should match '{FQDN_REGEX}'"),
            );
        }

        if let Some(tls) = &vhost.tls {
            let path = format!("{path}.tls");
            if tls.secret_name.as_deref().unwrap_or_default().is_empty() {
                self.required(&format!("{path}.secretName"));
            }
            if let Some(version) = &tls.minimum_protocol_version {
                self.one_of(
                    &format!("{path}.minimumProtocolVersion"),
                    version,
                    TLS_VERSIONS,
                );
            }
            if let Some(cv) = &tls.client_validation {
                let has_ca = cv.ca_secret.as_deref().is_some_and(|s| !s.is_empty());
                if !has_ca && !cv.skip_client_cert_validation {
                    self.required(&format!("{path}.clientValidation.caSecret"));
                }
            }
        }

        if let Some(authz) = &vhost.authorization {
            let path = format!("{path}.authorization");
            if authz.extension_ref.name.is_empty() {
                self.required(&format!("{path}.extensionRef.name"));
            }
            if let Some(port) = authz.extension_ref.port {
                self.port(&format!("{path}.extensionRef.port"), port);
            }
        }

        if let Some(rl) = &vhost.rate_limit_policy {
            let path = format!("{path}.rateLimitPolicy");
            self.rate_limit(&path, rl);
            if rl.vhost_rate_limits.is_some() {
                self.invalid(
                    &format!("{path}.vhostRateLimits"),
                    rl.vhost_rate_limits.as_deref().unwrap_or_default(),
                    "may only be set on routes",
                );
            }
        }
        self.ip_filters(path, &vhost.ip_allow_policy, &vhost.ip_deny_policy);
    }

    fn route(&mut self, path: &str, route: &Route) {
        let mut path_conditions = 0;
        for (i, c) in route.conditions.iter().enumerate() {
            self.condition(&format!("{path}.conditions[{i}]"), c);
            if c.is_path() {
                path_conditions += 1;
            }
        }
        if path_conditions > 1 {
            self.invalid(
                &format!("{path}.conditions"),
                path_conditions,
                "at most one path condition may be set",
            );
        }

        for (i, svc) in route.services.iter().enumerate() {
            self.service(&format!("{path}.services[{i}]"), svc);
        }

        let actions = [
            !route.services.is_empty(),
            route.direct_response_policy.is_some(),
            route.request_redirect_policy.is_some(),
        ]
        .iter()
        .filter(|a| **a)
        .count();
        if actions > 1 {
            self.invalid(
                path,
                actions,
                "only one of services, directResponsePolicy or requestRedirectPolicy may be set",
            );
        }

        if let Some(retry) = &route.retry_policy {
            for (i, on) in retry.retry_on.iter().enumerate() {
                self.one_of(&format!("{path}.retryPolicy.retryOn[{i}]"), on, RETRY_ON);
            }
            for (i, code) in retry.retriable_status_codes.iter().enumerate() {
                if !(100..=599).contains(code) {
                    self.invalid(
                        &format!("{path}.retryPolicy.retriableStatusCodes[{i}]"),
                        code,
                        "must be between 100 and 599",
                    );
                }
            }
        }

        if let Some(timeout) = route
            .timeout_policy
            .as_ref()
            .and_then(|t| t.response.as_deref())
        {
            if timeout.parse::<crate::duration::Timeout>().is_err() {
                self.invalid(
                    &format!("{path}.timeoutPolicy.response"),
                    timeout,
                    "must be a duration or \"infinity\"",
                );
            }
        }

        if let Some(hc) = &route.health_check_policy {
            if hc.path.is_empty() || !hc.path.starts_with('/') {
                self.invalid(
                    &format!("{path}.healthCheckPolicy.path"),
                    &hc.path,
                    "must be an absolute path",
                );
            }
        }

        if let Some(rewrite) = &route.path_rewrite_policy {
            for (i, rp) in rewrite.replace_prefix.iter().enumerate() {
                if let Some(prefix) = &rp.prefix {
                    if !prefix.starts_with('/') {
                        self.invalid(
                            &format!("{path}.pathRewritePolicy.replacePrefix[{i}].prefix"),
                            prefix,
                            "must start with '/'",
                        );
                    }
                }
                if !rp.replacement.starts_with('/') {
                    self.invalid(
                        &format!("{path}.pathRewritePolicy.replacePrefix[{i}].replacement"),
                        &rp.replacement,
                        "must start with '/'",
                    );
                }
            }
        }

        self.headers_policies(
            path,
            route.request_headers_policy.as_ref(),
            route.response_headers_policy.as_ref(),
        );
        self.cookie_rewrites(path, &route.cookie_rewrite_policies);

        if let Some(rl) = &route.rate_limit_policy {
            let path = format!("{path}.rateLimitPolicy");
            self.rate_limit(&path, rl);
            if let Some(mode) = &rl.vhost_rate_limits {
                self.one_of(&format!("{path}.vhostRateLimits"), mode, VHOST_RATE_LIMITS);
            }
        }
        self.ip_filters(path, &route.ip_allow_policy, &route.ip_deny_policy);

        if let Some(ir) = &route.internal_redirect_policy {
            let path = format!("{path}.internalRedirectPolicy");
            for (i, code) in ir.redirect_response_codes.iter().enumerate() {
                self.one_of(
                    &format!("{path}.redirectResponseCodes[{i}]"),
                    &code.to_string(),
                    REDIRECT_CODES,
                );
            }
            if let Some(cross) = &ir.allow_cross_scheme_redirect {
                self.one_of(
                    &format!("{path}.allowCrossSchemeRedirect"),
                    cross,
                    CROSS_SCHEME,
                );
            }
        }

        if let Some(dr) = &route.direct_response_policy {
            if !(200..=599).contains(&dr.status_code) {
                self.invalid(
                    &format!("{path}.directResponsePolicy.statusCode"),
                    dr.status_code,
                    "must be between 200 and 599",
                );
            }
        }

        if let Some(rr) = &route.request_redirect_policy {
            let path = format!("{path}.requestRedirectPolicy");
            if let Some(code) = rr.status_code {
                self.one_of(
                    &format!("{path}.statusCode"),
                    &code.to_string(),
                    REDIRECT_CODES,
                );
            }
            if let Some(scheme) = &rr.scheme {
                self.one_of(&format!("{path}.scheme"), scheme, SCHEMES);
            }
            if let Some(port) = rr.port {
                self.port(&format!("{path}.port"), port);
            }
            if rr.path.is_some() && rr.prefix.is_some() {
                self.invalid(
                    &path,
                    "path, prefix",
                    "path and prefix are mutually exclusive",
                );
            }
        }

        for (i, o) in route.response_override_policy.iter().enumerate() {
            let path = format!("{path}.responseOverridePolicy[{i}]");
            if o.match_.status_codes.is_empty() {
                self.required(&format!("{path}.match.statusCodes"));
            }
            for (j, m) in o.match_.status_codes.iter().enumerate() {
                let path = format!("{path}.match.statusCodes[{j}]");
                self.one_of(&format!("{path}.type"), &m.type_, STATUS_MATCH_TYPES);
                match (m.type_.as_str(), m.value, &m.range) {
                    ("Value", Some(v), _) if (100..=599).contains(&v) => {}
                    ("Value", Some(v), _) => {
                        self.invalid(&format!("{path}.value"), v, "must be between 100 and 599")
                    }
                    ("Value", None, _) => self.required(&format!("{path}.value")),
                    ("Range", _, Some(r)) if r.start <= r.end => {}
                    ("Range", _, Some(r)) => self.invalid(
                        &format!("{path}.range"),
                        format!("{}-{}", r.start, r.end),
                        "start must not exceed end",
                    ),
                    ("Range", _, None) => self.required(&format!("{path}.range")),
                    _ => {}
                }
            }
        }
    }

    fn condition(&mut self, path: &str, c: &MatchCondition) {
        let set = [
            c.prefix.is_some(),
            c.exact.is_some(),
            c.regex.is_some(),
            c.header.is_some(),
            c.query_parameter.is_some(),
        ]
        .iter()
        .filter(|s| **s)
        .count();
        if set != 1 {
            self.invalid(
                path,
                set,
                "exactly one of prefix, exact, regex, header or queryParameter must be set",
            );
            return;
        }

        for (field, p) in [("prefix", &c.prefix), ("exact", &c.exact)] {
            if let Some(p) = p {
                if !p.starts_with('/') {
                    self.invalid(&format!("{path}.{field}"), p, "must start with '/'");
                }
            }
        }
        if let Some(re) = &c.regex {
            self.regex(&format!("{path}.regex"), re);
        }

        if let Some(h) = &c.header {
            self.header_condition(&format!("{path}.header"), h);
        }

        if let Some(q) = &c.query_parameter {
            let path = format!("{path}.queryParameter");
            if q.name.is_empty() {
                self.required(&format!("{path}.name"));
            }
            let ops = [
                q.present,
                q.exact.is_some(),
                q.prefix.is_some(),
                q.suffix.is_some(),
                q.regex.is_some(),
                q.contains.is_some(),
            ]
            .iter()
            .filter(|s| **s)
            .count();
            if ops != 1 {
                self.invalid(&path, ops, "exactly one match operator must be set");
            }
            if let Some(re) = &q.regex {
                self.regex(&format!("{path}.regex"), re);
            }
        }
    }

    fn header_condition(&mut self, path: &str, h: &HeaderMatchCondition) {
        if h.name.is_empty() {
            self.required(&format!("{path}.name"));
        } else if !is_header_name(&h.name) {
            self.invalid(&format!("{path}.name"), &h.name, "not a valid header name");
        }
        let ops = [
            h.present,
            h.not_present,
            h.contains.is_some(),
            h.not_contains.is_some(),
            h.exact.is_some(),
            h.not_exact.is_some(),
            h.regex.is_some(),
        ]
        .iter()
        .filter(|s| **s)
        .count();
        if ops != 1 {
            self.invalid(path, ops, "exactly one match operator must be set");
        }
        if let Some(re) = &h.regex {
            self.regex(&format!("{path}.regex"), re);
        }
    }

    fn service(&mut self, path: &str, svc: &Service) {
        if svc.name.is_empty() {
            self.required(&format!("{path}.name"));
        }
        self.port(&format!("{path}.port"), svc.port);
        if let Some(protocol) = &svc.protocol {
            self.one_of(&format!("{path}.protocol"), protocol, PROTOCOLS);
        }
        if let Some(val) = &svc.validation {
            let path = format!("{path}.validation");
            if val.ca_secret.is_empty() {
                self.required(&format!("{path}.caSecret"));
            }
            if val.subject_name.is_empty() {
                self.required(&format!("{path}.subjectName"));
            } else if val
                .subject_names
                .first()
                .is_some_and(|first| *first != val.subject_name)
            {
                self.invalid(
                    &format!("{path}.subjectNames"),
                    val.subject_names.join(","),
                    "subjectNames[0] must equal subjectName if set",
                );
            }
        }
        self.headers_policies(
            path,
            svc.request_headers_policy.as_ref(),
            svc.response_headers_policy.as_ref(),
        );
        self.cookie_rewrites(path, &svc.cookie_rewrite_policies);
    }

    fn port(&mut self, path: &str, port: i32) {
        if !(1..=65535).contains(&port) {
            self.invalid(path, port, "must be between 1 and 65535");
        }
    }

    fn regex(&mut self, path: &str, re: &str) {
        if let Err(error) = Regex::new(re) {
            self.invalid(path, re, error);
        }
    }

    fn headers_policies(
        &mut self,
        path: &str,
        request: Option<&HeadersPolicy>,
        response: Option<&HeadersPolicy>,
    ) {
        for (field, policy) in [
            ("requestHeadersPolicy", request),
            ("responseHeadersPolicy", response),
        ] {
            let Some(policy) = policy else { continue };
            for (i, h) in policy.set.iter().enumerate() {
                if !is_header_name(&h.name) {
                    self.invalid(
                        &format!("{path}.{field}.set[{i}].name"),
                        &h.name,
                        "not a valid header name",
                    );
                }
            }
            for (i, name) in policy.remove.iter().enumerate() {
                if !is_header_name(name) {
                    self.invalid(
                        &format!("{path}.{field}.remove[{i}]"),
                        name,
                        "not a valid header name",
                    );
                }
            }
        }
    }

    fn cookie_rewrites(&mut self, path: &str, policies: &[CookieRewritePolicy]) {
        for (i, c) in policies.iter().enumerate() {
            let path = format!("{path}.cookieRewritePolicies[{i}]");
            if c.name.is_empty() {
                self.required(&format!("{path}.name"));
            }
            if let Some(ss) = &c.same_site {
                self.one_of(&format!("{path}.sameSite"), ss, SAME_SITE);
            }
            if c.path_rewrite.is_none()
                && c.domain_rewrite.is_none()
                && c.secure.is_none()
                && c.same_site.is_none()
            {
                self.invalid(&path, &c.name, "at least one rewrite must be set");
            }
        }
    }

    fn rate_limit(&mut self, path: &str, rl: &RateLimitPolicy) {
        if let Some(local) = &rl.local {
            let path = format!("{path}.local");
            if local.requests == 0 {
                self.invalid(
                    &format!("{path}.requests"),
                    local.requests,
                    "must be greater than 0",
                );
            }
            self.one_of(&format!("{path}.unit"), &local.unit, RATE_LIMIT_UNITS);
            if let Some(code) = local.response_status_code {
                if !(400..=599).contains(&code) {
                    self.invalid(
                        &format!("{path}.responseStatusCode"),
                        code,
                        "must be between 400 and 599",
                    );
                }
            }
        }
        if let Some(global) = &rl.global {
            let path = format!("{path}.global");
            if !global.disabled && global.descriptors.is_empty() {
                self.required(&format!("{path}.descriptors"));
            }
            for (i, d) in global.descriptors.iter().enumerate() {
                for (j, e) in d.entries.iter().enumerate() {
                    let path = format!("{path}.descriptors[{i}].entries[{j}]");
                    let set = [
                        e.generic_key.is_some(),
                        e.request_header.is_some(),
                        e.request_header_value_match.is_some(),
                        e.remote_address.is_some(),
                    ]
                    .iter()
                    .filter(|s| **s)
                    .count();
                    if set != 1 {
                        self.invalid(&path, set, "exactly one descriptor entry type must be set");
                    }
                    if let Some(rh) = &e.request_header {
                        if !is_header_name(&rh.header_name) {
                            self.invalid(
                                &format!("{path}.requestHeader.headerName"),
                                &rh.header_name,
                                "not a valid header name",
                            );
                        }
                    }
                    if let Some(m) = &e.request_header_value_match {
                        for (k, h) in m.headers.iter().enumerate() {
                            self.header_condition(
                                &format!("{path}.requestHeaderValueMatch.headers[{k}]"),
                                h,
                            );
                        }
                    }
                }
            }
        }
    }

    fn ip_filters(&mut self, path: &str, allow: &[IpFilterPolicy], deny: &[IpFilterPolicy]) {
        for (field, filters) in [("ipAllowPolicy", allow), ("ipDenyPolicy", deny)] {
            for (i, f) in filters.iter().enumerate() {
                let path = format!("{path}.{field}[{i}]");
                self.one_of(&format!("{path}.source"), &f.source, IP_SOURCES);
                if parse_cidr(&f.cidr).is_none() {
                    self.invalid(
                        &format!("{path}.cidr"),
                        &f.cidr,
                        "must be an IP address or CIDR",
                    );
                }
            }
        }
    }
}

/// Parses a CIDR, or a single address as a host network.
pub fn parse_cidr(s: &str) -> Option<ipnet::IpNet> {
    s.parse::<ipnet::IpNet>()
        .ok()
        .or_else(|| s.parse::<std::net::IpAddr>().ok().map(Into::into))
}

fn is_header_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b))
}

// === impl FieldError ===

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)?;
        if !self.detail.is_empty() {
            write!(f, ": {}", self.detail)?;
        }
        Ok(())
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Required => "Required value",
            Self::Unsupported => "Unsupported value",
            Self::Invalid => "Invalid value",
        })
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            fmt::Display::fmt(e, f)?;
        }
        Ok(())
    }
}

impl std::error::Error for FieldErrors {}

#[cfg(test)]
mod tests;
