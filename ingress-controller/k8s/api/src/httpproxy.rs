use crate::{duration::K8sDuration, status::HttpProxyStatus};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// HTTPProxy describes a virtual host, the routes it serves, and the
/// proxies its routing tree delegates to.
///
/// A proxy that sets `virtualhost` is a root; proxies without one are only
/// reachable through another proxy's `includes`.
#[derive(
    Clone, Debug, Default, PartialEq, kube::CustomResource, Deserialize, Serialize, JsonSchema,
)]
#[kube(
    group = "ingress.io",
    version = "v1",
    kind = "HTTPProxy",
    root = "HttpProxy",
    status = "HttpProxyStatus",
    shortname = "proxy",
    namespaced,
    printcolumn = r#"{"name":"FQDN","type":"string","jsonPath":".spec.virtualhost.fqdn"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.currentStatus"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HttpProxySpec {
    pub virtualhost: Option<VirtualHost>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub includes: Vec<Include>,

    /// Restricts this proxy to controllers serving the named ingress class.
    pub ingress_class_name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualHost {
    /// The fully qualified domain name of the virtual host. A leading `*.`
    /// label matches any single subdomain.
    pub fqdn: String,
    pub tls: Option<Tls>,
    pub authorization: Option<AuthorizationServer>,
    pub rate_limit_policy: Option<RateLimitPolicy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_allow_policy: Vec<IpFilterPolicy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_deny_policy: Vec<IpFilterPolicy>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Tls {
    /// A `kubernetes.io/tls` secret, as `name` or `namespace/name`.
    pub secret_name: Option<String>,
    pub minimum_protocol_version: Option<String>,
    #[serde(default)]
    pub enable_fallback_certificate: bool,
    pub client_validation: Option<DownstreamValidation>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DownstreamValidation {
    /// A secret holding the CA bundle under `ca.crt`.
    pub ca_secret: Option<String>,
    /// A secret holding PEM CRLs under `crl.pem`.
    pub crl_secret: Option<String>,
    #[serde(default)]
    pub only_verify_leaf_cert_crl: bool,
    #[serde(default)]
    pub skip_client_cert_validation: bool,
    #[serde(default)]
    pub optional_client_certificate: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationServer {
    pub extension_ref: ExtensionServiceReference,
    pub auth_policy: Option<AuthorizationPolicy>,
    pub response_timeout: Option<K8sDuration>,
    #[serde(default)]
    pub fail_open: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionServiceReference {
    pub namespace: Option<String>,
    pub name: String,
    pub port: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationPolicy {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Include {
    pub name: String,
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<MatchCondition>,
}

/// Exactly one field must be set.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MatchCondition {
    pub prefix: Option<String>,
    pub exact: Option<String>,
    pub regex: Option<String>,
    pub header: Option<HeaderMatchCondition>,
    pub query_parameter: Option<QueryParameterMatchCondition>,
}

/// Exactly one operator must be set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HeaderMatchCondition {
    pub name: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub present: bool,
    #[serde(
        default,
        rename = "notpresent",
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub not_present: bool,
    pub contains: Option<String>,
    #[serde(rename = "notcontains")]
    pub not_contains: Option<String>,
    pub exact: Option<String>,
    #[serde(rename = "notexact")]
    pub not_exact: Option<String>,
    pub regex: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ignore_case: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub treat_missing_as_empty: bool,
}

/// Exactly one operator must be set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueryParameterMatchCondition {
    pub name: String,
    pub exact: Option<String>,
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    pub regex: Option<String>,
    pub contains: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub present: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ignore_case: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<MatchCondition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<Service>,
    /// Serves this route on the plaintext listener even when the virtual
    /// host has TLS configured.
    #[serde(default)]
    pub permit_insecure: bool,
    pub auth_policy: Option<AuthorizationPolicy>,
    pub timeout_policy: Option<TimeoutPolicy>,
    pub retry_policy: Option<RetryPolicy>,
    pub health_check_policy: Option<HttpHealthCheckPolicy>,
    pub path_rewrite_policy: Option<PathRewritePolicy>,
    pub request_headers_policy: Option<HeadersPolicy>,
    pub response_headers_policy: Option<HeadersPolicy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cookie_rewrite_policies: Vec<CookieRewritePolicy>,
    pub rate_limit_policy: Option<RateLimitPolicy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_allow_policy: Vec<IpFilterPolicy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_deny_policy: Vec<IpFilterPolicy>,
    pub internal_redirect_policy: Option<HttpInternalRedirectPolicy>,
    pub direct_response_policy: Option<HttpDirectResponsePolicy>,
    pub request_redirect_policy: Option<HttpRequestRedirectPolicy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_override_policy: Vec<HttpResponseOverridePolicy>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub name: String,
    pub port: i32,
    /// One of `h2`, `h2c` or `tls`. Plaintext HTTP/1.1 when unset.
    pub protocol: Option<String>,
    pub weight: Option<u32>,
    pub validation: Option<UpstreamValidation>,
    pub request_headers_policy: Option<HeadersPolicy>,
    pub response_headers_policy: Option<HeadersPolicy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cookie_rewrite_policies: Vec<CookieRewritePolicy>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamValidation {
    /// A secret holding the CA bundle under `ca.crt`.
    #[serde(default)]
    pub ca_secret: String,
    #[serde(default)]
    pub subject_name: String,
    /// When set, the first entry must equal `subjectName`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subject_names: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutPolicy {
    /// A duration, or `infinity` to disable the timeout.
    pub response: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub count: Option<u32>,
    pub per_try_timeout: Option<K8sDuration>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retriable_status_codes: Vec<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpHealthCheckPolicy {
    pub path: String,
    pub host: Option<String>,
    pub interval_seconds: Option<u64>,
    pub timeout_seconds: Option<u64>,
    pub unhealthy_threshold_count: Option<u32>,
    pub healthy_threshold_count: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PathRewritePolicy {
    #[serde(default)]
    pub replace_prefix: Vec<ReplacePrefix>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplacePrefix {
    /// The prefix to replace; defaults to the route's prefix condition.
    pub prefix: Option<String>,
    pub replacement: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HeadersPolicy {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub set: Vec<HeaderValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HeaderValue {
    pub name: String,
    /// May reference request headers as `%REQ(Header-Name)%`.
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CookieRewritePolicy {
    pub name: String,
    pub path_rewrite: Option<CookiePathRewrite>,
    pub domain_rewrite: Option<CookieDomainRewrite>,
    pub secure: Option<bool>,
    /// One of `Strict`, `Lax` or `None`.
    pub same_site: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct CookiePathRewrite {
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct CookieDomainRewrite {
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitPolicy {
    pub local: Option<LocalRateLimitPolicy>,
    pub global: Option<GlobalRateLimitPolicy>,
    /// Route-level only: `Override` (default), `Include` or `Ignore`.
    pub vhost_rate_limits: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalRateLimitPolicy {
    pub requests: u32,
    /// One of `second`, `minute` or `hour`.
    pub unit: String,
    #[serde(default)]
    pub burst: u32,
    pub response_status_code: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_headers_to_add: Vec<HeaderValue>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GlobalRateLimitPolicy {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub descriptors: Vec<RateLimitDescriptor>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDescriptor {
    pub entries: Vec<RateLimitDescriptorEntry>,
}

/// Exactly one field must be set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDescriptorEntry {
    pub generic_key: Option<GenericKeyDescriptor>,
    pub request_header: Option<RequestHeaderDescriptor>,
    pub request_header_value_match: Option<RequestHeaderValueMatchDescriptor>,
    pub remote_address: Option<RemoteAddressDescriptor>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenericKeyDescriptor {
    pub key: Option<String>,
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RequestHeaderDescriptor {
    pub header_name: String,
    pub descriptor_key: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RequestHeaderValueMatchDescriptor {
    pub headers: Vec<HeaderMatchCondition>,
    pub expect_match: Option<bool>,
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct RemoteAddressDescriptor {}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IpFilterPolicy {
    /// `Peer` or `Remote`.
    pub source: String,
    pub cidr: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpInternalRedirectPolicy {
    pub max_internal_redirects: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redirect_response_codes: Vec<u32>,
    /// `Never` (default), `SafeOnly` or `Always`.
    pub allow_cross_scheme_redirect: Option<String>,
    #[serde(default)]
    pub deny_repeated_route_redirect: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpDirectResponsePolicy {
    pub status_code: i32,
    pub body: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestRedirectPolicy {
    pub scheme: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<i32>,
    pub status_code: Option<i32>,
    pub path: Option<String>,
    pub prefix: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponseOverridePolicy {
    #[serde(rename = "match")]
    pub match_: ResponseOverrideMatch,
    pub response: ResponseOverrideResponse,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResponseOverrideMatch {
    pub status_codes: Vec<StatusCodeMatch>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusCodeMatch {
    /// `Value` or `Range`.
    #[serde(rename = "type")]
    pub type_: String,
    pub value: Option<i32>,
    pub range: Option<StatusCodeRange>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct StatusCodeRange {
    pub start: i32,
    pub end: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResponseOverrideResponse {
    pub content_type: Option<String>,
    pub body: String,
}

// === impl HttpProxy ===

impl HttpProxy {
    pub fn is_root(&self) -> bool {
        self.spec.virtualhost.is_some()
    }
}

// === impl MatchCondition ===

impl MatchCondition {
    pub fn prefix(p: impl ToString) -> Self {
        Self {
            prefix: Some(p.to_string()),
            ..Default::default()
        }
    }

    pub fn exact(p: impl ToString) -> Self {
        Self {
            exact: Some(p.to_string()),
            ..Default::default()
        }
    }

    pub fn regex(p: impl ToString) -> Self {
        Self {
            regex: Some(p.to_string()),
            ..Default::default()
        }
    }

    pub fn header(h: HeaderMatchCondition) -> Self {
        Self {
            header: Some(h),
            ..Default::default()
        }
    }

    pub fn query_parameter(q: QueryParameterMatchCondition) -> Self {
        Self {
            query_parameter: Some(q),
            ..Default::default()
        }
    }

    pub fn is_path(&self) -> bool {
        self.prefix.is_some() || self.exact.is_some() || self.regex.is_some()
    }
}

// === impl Service ===

impl Service {
    pub fn new(name: impl ToString, port: i32) -> Self {
        Self {
            name: name.to_string(),
            port,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_yaml() {
        let proxy: HttpProxySpec = serde_yaml::from_str(
            r#"
virtualhost:
  fqdn: echo.example.com
  tls:
    secretName: echo
    clientValidation:
      caSecret: ca
      onlyVerifyLeafCertCrl: true
routes:
  - conditions:
      - prefix: /api
      - header:
          name: x-user
          notcontains: bot
          ignoreCase: true
      - queryParameter:
          name: targetExact
          exact: ExactValue
    services:
      - name: echo
        port: 80
        protocol: h2c
    retryPolicy:
      count: 3
      perTryTimeout: 150ms
      retryOn: [5xx, reset]
    rateLimitPolicy:
      vhostRateLimits: Include
      local:
        requests: 1
        unit: hour
includes:
  - name: child
    namespace: other
    conditions:
      - prefix: /child
"#,
        )
        .unwrap();

        let vhost = proxy.virtualhost.as_ref().unwrap();
        assert_eq!(vhost.fqdn, "echo.example.com");
        let validation = vhost
            .tls
            .as_ref()
            .unwrap()
            .client_validation
            .as_ref()
            .unwrap();
        assert!(validation.only_verify_leaf_cert_crl);
        assert!(!validation.skip_client_cert_validation);

        let route = &proxy.routes[0];
        assert_eq!(route.conditions.len(), 3);
        let header = route.conditions[1].header.as_ref().unwrap();
        assert_eq!(header.not_contains.as_deref(), Some("bot"));
        assert!(header.ignore_case);
        assert_eq!(route.services[0].protocol.as_deref(), Some("h2c"));
        let retry = route.retry_policy.as_ref().unwrap();
        assert_eq!(
            retry.per_try_timeout.map(std::time::Duration::from),
            Some(std::time::Duration::from_millis(150))
        );
        assert_eq!(
            route
                .rate_limit_policy
                .as_ref()
                .unwrap()
                .vhost_rate_limits
                .as_deref(),
            Some("Include")
        );
        assert_eq!(proxy.includes[0].namespace.as_deref(), Some("other"));
    }
}
