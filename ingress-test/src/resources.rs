//! Builders for the resources scenarios create.

use ingress_controller_k8s_api::{
    self as k8s,
    httpproxy::{
        AuthorizationPolicy, AuthorizationServer, ExtensionServiceReference, Include,
        MatchCondition, Route, Service, Tls, VirtualHost,
    },
    HttpProxy, HttpProxySpec,
};
use maplit::btreemap;
use std::collections::BTreeMap;

pub const SERVICE_PORT: i32 = 80;
const PORT_NAME: &str = "http";

pub fn proxy(ns: &str, name: &str, spec: HttpProxySpec) -> HttpProxy {
    HttpProxy {
        metadata: k8s::ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            generation: Some(1),
            ..Default::default()
        },
        spec,
        status: None,
    }
}

/// A root proxy for `fqdn` serving `routes`.
pub fn root(ns: &str, name: &str, fqdn: &str, routes: Vec<Route>) -> HttpProxy {
    proxy(
        ns,
        name,
        HttpProxySpec {
            virtualhost: Some(vhost(fqdn)),
            routes,
            ..Default::default()
        },
    )
}

pub fn vhost(fqdn: &str) -> VirtualHost {
    VirtualHost {
        fqdn: fqdn.to_string(),
        ..Default::default()
    }
}

pub fn tls(secret: &str) -> Tls {
    Tls {
        secret_name: Some(secret.to_string()),
        ..Default::default()
    }
}

pub fn authorization(service: &str, context: BTreeMap<String, String>) -> AuthorizationServer {
    AuthorizationServer {
        extension_ref: ExtensionServiceReference {
            namespace: None,
            name: service.to_string(),
            port: None,
        },
        auth_policy: (!context.is_empty()).then(|| AuthorizationPolicy {
            disabled: false,
            context,
        }),
        response_timeout: None,
        fail_open: false,
    }
}

/// A route forwarding everything under `prefix` to `service`.
pub fn route(prefix: &str, service: &str) -> Route {
    Route {
        conditions: vec![MatchCondition::prefix(prefix)],
        services: vec![Service::new(service, SERVICE_PORT)],
        ..Default::default()
    }
}

/// A route with the given conditions forwarding to `service`.
pub fn route_when(conditions: Vec<MatchCondition>, service: &str) -> Route {
    Route {
        conditions,
        services: vec![Service::new(service, SERVICE_PORT)],
        ..Default::default()
    }
}

pub fn include(ns: Option<&str>, name: &str, conditions: Vec<MatchCondition>) -> Include {
    Include {
        name: name.to_string(),
        namespace: ns.map(str::to_string),
        conditions,
    }
}

pub fn service(ns: &str, name: &str) -> k8s::Service {
    k8s::Service {
        metadata: k8s::ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(k8s::ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            ports: Some(vec![k8s::ServicePort {
                name: Some(PORT_NAME.to_string()),
                port: SERVICE_PORT,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// An `ExternalName` service resolving to `host` on `port`.
pub fn external_name(ns: &str, name: &str, host: &str, port: u16) -> k8s::Service {
    k8s::Service {
        metadata: k8s::ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(k8s::ServiceSpec {
            type_: Some("ExternalName".to_string()),
            external_name: Some(host.to_string()),
            ports: Some(vec![k8s::ServicePort {
                name: Some(PORT_NAME.to_string()),
                port: i32::from(port),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A single-endpoint slice for a pod of `service` listening on `port`.
pub fn endpoint_slice(ns: &str, service: &str, pod: &str, port: u16) -> k8s::EndpointSlice {
    k8s::EndpointSlice {
        metadata: k8s::ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(pod.to_string()),
            labels: Some(btreemap! {
                k8s::SERVICE_NAME_LABEL.to_string() => service.to_string(),
            }),
            ..Default::default()
        },
        address_type: "IPv4".to_string(),
        endpoints: vec![k8s::Endpoint {
            addresses: vec!["127.0.0.1".to_string()],
            conditions: Some(k8s::EndpointConditions {
                ready: Some(true),
                ..Default::default()
            }),
            target_ref: Some(k8s::api::core::v1::ObjectReference {
                kind: Some("Pod".to_string()),
                namespace: Some(ns.to_string()),
                name: Some(pod.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }],
        ports: Some(vec![k8s::EndpointPort {
            name: Some(PORT_NAME.to_string()),
            port: Some(i32::from(port)),
            ..Default::default()
        }]),
    }
}

/// A secret holding the given PEM entries.
pub fn secret(ns: &str, name: &str, type_: &str, data: BTreeMap<&str, String>) -> k8s::Secret {
    k8s::Secret {
        metadata: k8s::ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        type_: Some(type_.to_string()),
        data: Some(
            data.into_iter()
                .map(|(k, v)| (k.to_string(), k8s::ByteString(v.into_bytes())))
                .collect(),
        ),
        ..Default::default()
    }
}

pub fn tls_secret(ns: &str, name: &str, chain_pem: String, key_pem: String) -> k8s::Secret {
    secret(
        ns,
        name,
        "kubernetes.io/tls",
        btreemap! { "tls.crt" => chain_pem, "tls.key" => key_pem },
    )
}

pub fn ca_secret(ns: &str, name: &str, ca_pem: String) -> k8s::Secret {
    secret(ns, name, "Opaque", btreemap! { "ca.crt" => ca_pem })
}

pub fn crl_secret(ns: &str, name: &str, crl_pem: String) -> k8s::Secret {
    secret(ns, name, "Opaque", btreemap! { "crl.pem" => crl_pem })
}
