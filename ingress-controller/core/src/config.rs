use crate::{
    authz::{AuthorizationServer, RouteAuthorization},
    cookie::CookieRewrite,
    headers::HeadersPolicy,
    host::VirtualHosts,
    ip_filter::IpFilter,
    ratelimit::RateLimits,
    redirect::{DirectResponse, InternalRedirectPolicy, RequestRedirect, ResponseOverride},
    retry::{HealthCheckPolicy, RetryPolicy},
    routes::{RequestRef, RouteMatch},
    tls::{TlsCertificate, VirtualHostTls},
};
use std::{fmt, net::SocketAddr, sync::Arc, time::Duration};

/// A compiled snapshot of every valid virtual host.
///
/// Snapshots are immutable; the compiler publishes a new one whenever any
/// input resource changes.
#[derive(Clone, Debug, Default)]
pub struct Config {
    pub vhosts: VirtualHosts,
    pub fallback_certificate: Option<Arc<TlsCertificate>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProxyRef {
    pub namespace: String,
    pub name: String,
}

/// Identifies a route by its position in the proxy that declares it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RouteRef {
    pub proxy: ProxyRef,
    pub index: usize,
}

#[derive(Clone, Debug)]
pub struct VirtualHost {
    pub fqdn: String,
    pub proxy: ProxyRef,
    pub tls: Option<Arc<VirtualHostTls>>,
    pub authorization: Option<AuthorizationServer>,
    routes: Vec<Arc<Route>>,
}

#[derive(Clone, Debug)]
pub struct Route {
    pub id: RouteRef,
    pub matches: RouteMatch,
    pub action: RouteAction,
    pub permit_insecure: bool,
    pub authorization: RouteAuthorization,
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
    pub path_rewrite: Vec<crate::rewrite::PrefixReplacement>,
    pub request_headers: HeadersPolicy,
    pub response_headers: HeadersPolicy,
    pub cookie_rewrites: Vec<CookieRewrite>,
    pub rate_limits: RateLimits,
    pub ip_filter: IpFilter,
    pub internal_redirect: Option<InternalRedirectPolicy>,
    pub response_overrides: Vec<ResponseOverride>,
}

#[derive(Clone, Debug)]
pub enum RouteAction {
    Forward(Vec<Backend>),
    Redirect(RequestRedirect),
    DirectResponse(DirectResponse),
}

#[derive(Clone, Debug)]
pub struct Backend {
    pub cluster: Arc<Cluster>,
    pub weight: u32,
    pub request_headers: HeadersPolicy,
    pub response_headers: HeadersPolicy,
    pub cookie_rewrites: Vec<CookieRewrite>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServiceRef {
    pub namespace: String,
    pub name: String,
    pub port: u16,
}

/// A set of interchangeable upstream endpoints along with how to talk to
/// them.
#[derive(Clone, Debug, PartialEq)]
pub struct Cluster {
    pub name: String,
    pub service: ServiceRef,
    pub protocol: UpstreamProtocol,
    pub endpoints: Endpoints,
    pub validation: Option<UpstreamValidation>,
    pub health_check: Option<HealthCheckPolicy>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum UpstreamProtocol {
    #[default]
    Http1,
    H2c,
    /// HTTP/2 over TLS.
    H2,
    /// HTTP/1.1 over TLS.
    Tls,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoints {
    Static(Vec<Endpoint>),
    ExternalName { host: String, port: u16 },
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub addr: SocketAddr,
    pub pod: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamValidation {
    pub ca_pem: Vec<u8>,
    /// Accepted server names; the first entry is used as SNI.
    pub subject_names: Vec<String>,
}

// === impl ProxyRef ===

impl ProxyRef {
    pub fn new(namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ProxyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl fmt::Display for RouteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/routes[{}]", self.proxy, self.index)
    }
}

// === impl VirtualHost ===

impl VirtualHost {
    /// Builds a virtual host, ordering its routes from most to least specific.
    ///
    /// Routes of equal specificity keep their declaration order.
    pub fn new(
        fqdn: String,
        proxy: ProxyRef,
        tls: Option<Arc<VirtualHostTls>>,
        authorization: Option<AuthorizationServer>,
        mut routes: Vec<Arc<Route>>,
    ) -> Self {
        routes.sort_by(|a, b| b.matches.cmp_specificity(&a.matches));
        Self {
            fqdn,
            proxy,
            tls,
            authorization,
            routes,
        }
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    /// Returns the most specific route whose conditions all match.
    pub fn route(&self, req: &RequestRef<'_>) -> Option<&Arc<Route>> {
        self.routes.iter().find(|r| r.matches.matches(req))
    }
}

// === impl Route ===

impl Route {
    /// The path prefix this route matched on, if any.
    pub fn prefix(&self) -> Option<&str> {
        match self.matches.path {
            Some(crate::routes::PathMatch::Prefix(ref p)) => Some(p),
            _ => None,
        }
    }
}

// === impl Cluster ===

impl Cluster {
    pub fn is_tls(&self) -> bool {
        matches!(self.protocol, UpstreamProtocol::H2 | UpstreamProtocol::Tls)
    }

    pub fn is_http2(&self) -> bool {
        matches!(self.protocol, UpstreamProtocol::H2 | UpstreamProtocol::H2c)
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.name, self.port)
    }
}
