use crate::Cluster;
use http::{HeaderName, HeaderValue};
use std::{collections::BTreeMap, sync::Arc, time::Duration};

/// Prefix of the headers that carry authorization context to the
/// authorization server.
pub const CONTEXT_HEADER_PREFIX: &str = "auth-context-";

/// Check response headers with this prefix are forwarded upstream.
pub const FORWARDED_HEADER_PREFIX: &str = "auth-";

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// An HTTP authorization server bound to a virtual host.
#[derive(Clone, Debug)]
pub struct AuthorizationServer {
    pub cluster: Arc<Cluster>,
    pub fail_open: bool,
    pub response_timeout: Duration,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthPolicy {
    pub disabled: bool,
    pub context: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteAuthorization {
    /// The virtual host has no authorization server.
    None,
    Disabled,
    Check { context: BTreeMap<String, String> },
}

/// Resolves a route's authorization from the virtual host default and the
/// route's own policy. The route's `disabled` flag wins; context keys are
/// merged with route values taking precedence.
pub fn route_authorization(
    vhost: Option<&AuthPolicy>,
    route: Option<&AuthPolicy>,
) -> RouteAuthorization {
    let disabled = route
        .or(vhost)
        .map(|p| p.disabled)
        .unwrap_or(false);
    if disabled {
        return RouteAuthorization::Disabled;
    }
    let mut context = vhost.map(|p| p.context.clone()).unwrap_or_default();
    if let Some(route) = route {
        context.extend(route.context.clone());
    }
    RouteAuthorization::Check { context }
}

/// Encodes context entries as check request headers. Entries whose key or
/// value cannot be encoded are skipped.
pub fn context_headers(
    context: &BTreeMap<String, String>,
) -> impl Iterator<Item = (HeaderName, HeaderValue)> + '_ {
    context.iter().filter_map(|(k, v)| {
        let name = HeaderName::try_from(format!("{CONTEXT_HEADER_PREFIX}{k}")).ok()?;
        let value = HeaderValue::from_str(v).ok()?;
        Some((name, value))
    })
}

pub fn is_forwarded_header(name: &HeaderName) -> bool {
    name.as_str().starts_with(FORWARDED_HEADER_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    #[test]
    fn route_overrides_vhost() {
        let vhost = AuthPolicy {
            disabled: false,
            context: btreemap! {
                "header_1".to_string() => "message_1".to_string(),
                "header_2".to_string() => "message_2".to_string(),
            },
        };
        let route = AuthPolicy {
            disabled: false,
            context: btreemap! {
                "header_2".to_string() => "message_2_route".to_string(),
                "header_3".to_string() => "message_3".to_string(),
            },
        };
        assert_eq!(
            route_authorization(Some(&vhost), Some(&route)),
            RouteAuthorization::Check {
                context: btreemap! {
                    "header_1".to_string() => "message_1".to_string(),
                    "header_2".to_string() => "message_2_route".to_string(),
                    "header_3".to_string() => "message_3".to_string(),
                }
            }
        );
    }

    #[test]
    fn disabled() {
        let off = AuthPolicy {
            disabled: true,
            ..Default::default()
        };
        let on = AuthPolicy::default();
        assert_eq!(
            route_authorization(None, Some(&off)),
            RouteAuthorization::Disabled
        );
        assert_eq!(
            route_authorization(Some(&off), None),
            RouteAuthorization::Disabled
        );
        assert_eq!(
            route_authorization(Some(&off), Some(&on)),
            RouteAuthorization::Check {
                context: Default::default()
            }
        );
        assert_eq!(
            route_authorization(None, None),
            RouteAuthorization::Check {
                context: Default::default()
            }
        );
    }

    #[test]
    fn encodes_context() {
        let context = btreemap! {
            "target".to_string() => "echo".to_string(),
            "bad key".to_string() => "skipped".to_string(),
        };
        let headers = context_headers(&context).collect::<Vec<_>>();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].0, "auth-context-target");
        assert_eq!(headers[0].1, "echo");
        assert!(is_forwarded_header(&headers[0].0));
        assert!(!is_forwarded_header(&HeaderName::from_static("x-auth")));
    }
}
