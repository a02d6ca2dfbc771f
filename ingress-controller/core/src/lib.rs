#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod authz;
mod config;
pub mod cookie;
pub mod headers;
pub mod host;
pub mod ip_filter;
pub mod ratelimit;
pub mod redirect;
pub mod retry;
pub mod rewrite;
pub mod routes;
pub mod tls;

pub use self::config::{
    Backend, Cluster, Config, Endpoint, Endpoints, ProxyRef, Route, RouteAction, RouteRef,
    ServiceRef, UpstreamProtocol, UpstreamValidation, VirtualHost,
};
pub use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
pub use ipnet::{IpNet, Ipv4Net, Ipv6Net};

pub const INGRESS_CONTROLLER_NAME: &str = "ingress.io/ingress-controller";
