use crate::rewrite;
use http::StatusCode;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestRedirect {
    pub scheme: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub status: StatusCode,
    pub path: Option<PathModifier>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathModifier {
    Full(String),
    Prefix(String),
}

/// A fixed response returned without contacting a backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectResponse {
    pub status: StatusCode,
    pub body: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InternalRedirectPolicy {
    pub max_internal_redirects: u32,
    pub redirect_response_codes: Vec<StatusCode>,
    pub allow_cross_scheme_redirect: CrossSchemeRedirect,
    pub deny_repeated_route_redirect: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CrossSchemeRedirect {
    #[default]
    Never,
    /// Only redirects to `https` are followed across schemes.
    SafeOnly,
    Always,
}

/// Replaces the body of upstream responses whose status matches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseOverride {
    pub statuses: Vec<StatusMatch>,
    pub content_type: String,
    pub body: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StatusMatch {
    Value(u16),
    Range { start: u16, end: u16 },
}

/// The request attributes a redirect location is derived from.
#[derive(Copy, Clone, Debug)]
pub struct RedirectSource<'a> {
    pub scheme: &'a str,
    pub host: &'a str,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub route_prefix: Option<&'a str>,
}

// === impl RequestRedirect ===

impl RequestRedirect {
    pub fn location(&self, src: RedirectSource<'_>) -> String {
        let scheme = self.scheme.as_deref().unwrap_or(src.scheme);
        let host = self
            .hostname
            .clone()
            .unwrap_or_else(|| crate::host::canonical_host(src.host));
        let authority = match self.port {
            Some(port) => format!("{host}:{port}"),
            None => host,
        };
        let path = match &self.path {
            None => src.path.to_string(),
            Some(PathModifier::Full(p)) => p.clone(),
            Some(PathModifier::Prefix(p)) => {
                match src.route_prefix.and_then(|pre| src.path.strip_prefix(pre)) {
                    Some(rest) => rewrite::join(p, rest),
                    None => p.clone(),
                }
            }
        };
        match src.query {
            Some(q) => format!("{scheme}://{authority}{path}?{q}"),
            None => format!("{scheme}://{authority}{path}"),
        }
    }
}

/// Redirect status codes a route may return.
pub fn is_redirect_status(code: u16) -> bool {
    matches!(code, 301 | 302 | 303 | 307 | 308)
}

// === impl InternalRedirectPolicy ===

impl Default for InternalRedirectPolicy {
    fn default() -> Self {
        Self {
            max_internal_redirects: 1,
            redirect_response_codes: vec![StatusCode::FOUND],
            allow_cross_scheme_redirect: CrossSchemeRedirect::Never,
            deny_repeated_route_redirect: false,
        }
    }
}

impl InternalRedirectPolicy {
    pub fn follows(&self, status: StatusCode) -> bool {
        self.redirect_response_codes.contains(&status)
    }

    pub fn allows_scheme(&self, from: &str, to: &str) -> bool {
        from == to
            || match self.allow_cross_scheme_redirect {
                CrossSchemeRedirect::Never => false,
                CrossSchemeRedirect::SafeOnly => to == "https",
                CrossSchemeRedirect::Always => true,
            }
    }
}

// === impl ResponseOverride ===

impl ResponseOverride {
    pub fn matches(&self, status: StatusCode) -> bool {
        let code = status.as_u16();
        self.statuses.iter().any(|m| match *m {
            StatusMatch::Value(v) => v == code,
            StatusMatch::Range { start, end } => (start..=end).contains(&code),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src<'a>(path: &'a str, query: Option<&'a str>) -> RedirectSource<'a> {
        RedirectSource {
            scheme: "http",
            host: "Example.com:8080",
            path,
            query,
            route_prefix: Some("/old"),
        }
    }

    #[test]
    fn locations() {
        let redirect = RequestRedirect {
            scheme: Some("https".to_string()),
            hostname: None,
            port: None,
            status: StatusCode::MOVED_PERMANENTLY,
            path: None,
        };
        assert_eq!(
            redirect.location(src("/a", Some("b=c"))),
            "https://example.com/a?b=c"
        );

        let redirect = RequestRedirect {
            scheme: None,
            hostname: Some("other.com".to_string()),
            port: Some(9000),
            status: StatusCode::FOUND,
            path: Some(PathModifier::Full("/full".to_string())),
        };
        assert_eq!(
            redirect.location(src("/a", None)),
            "http://other.com:9000/full"
        );

        let redirect = RequestRedirect {
            path: Some(PathModifier::Prefix("/new".to_string())),
            ..redirect
        };
        assert_eq!(
            redirect.location(src("/old/rest", None)),
            "http://other.com:9000/new/rest"
        );
    }

    #[test]
    fn cross_scheme() {
        let mut policy = InternalRedirectPolicy::default();
        assert!(policy.allows_scheme("http", "http"));
        assert!(!policy.allows_scheme("http", "https"));
        policy.allow_cross_scheme_redirect = CrossSchemeRedirect::SafeOnly;
        assert!(policy.allows_scheme("http", "https"));
        assert!(!policy.allows_scheme("https", "http"));
        policy.allow_cross_scheme_redirect = CrossSchemeRedirect::Always;
        assert!(policy.allows_scheme("https", "http"));
    }

    #[test]
    fn override_statuses() {
        let o = ResponseOverride {
            statuses: vec![
                StatusMatch::Value(404),
                StatusMatch::Range {
                    start: 500,
                    end: 503,
                },
            ],
            content_type: "text/plain".to_string(),
            body: "oops".to_string(),
        };
        assert!(o.matches(StatusCode::NOT_FOUND));
        assert!(o.matches(StatusCode::BAD_GATEWAY));
        assert!(!o.matches(StatusCode::GATEWAY_TIMEOUT));
        assert!(!o.matches(StatusCode::OK));
    }
}
