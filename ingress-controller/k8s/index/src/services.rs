use ahash::AHashMap as HashMap;
use ingress_controller_core::{Endpoint, Endpoints};
use ingress_controller_k8s_api::{self as k8s, ResourceExt};
use std::net::{IpAddr, SocketAddr};

/// Services and the ready endpoints of their `EndpointSlice`s.
#[derive(Debug, Default)]
pub(crate) struct ServiceIndex {
    services: HashMap<(String, String), ServiceInfo>,
    slices: HashMap<(String, String), SliceInfo>,
}

#[derive(Debug, PartialEq, Eq)]
struct ServiceInfo {
    ports: Vec<ServicePort>,
    external_name: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
struct ServicePort {
    name: Option<String>,
    port: u16,
}

#[derive(Debug, PartialEq, Eq)]
struct SliceInfo {
    service: String,
    ports: Vec<(Option<String>, u16)>,
    endpoints: Vec<(IpAddr, Option<String>)>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum Unresolved {
    #[error("service \"{namespace}/{name}\" not found")]
    Service { namespace: String, name: String },

    #[error("port {port} not found on service \"{namespace}/{name}\"")]
    Port {
        namespace: String,
        name: String,
        port: u16,
    },
}

// === impl ServiceIndex ===

impl ServiceIndex {
    /// Returns true if the indexed state changed.
    pub(crate) fn apply_service(&mut self, svc: k8s::Service) -> bool {
        let key = (svc.namespace().unwrap_or_default(), svc.name_unchecked());
        let spec = svc.spec.unwrap_or_default();
        let external_name = match spec.type_.as_deref() {
            Some("ExternalName") => spec.external_name,
            _ => None,
        };
        let ports = spec
            .ports
            .into_iter()
            .flatten()
            .filter_map(|p| {
                Some(ServicePort {
                    name: p.name.filter(|n| !n.is_empty()),
                    port: u16::try_from(p.port).ok()?,
                })
            })
            .collect();
        let info = ServiceInfo {
            ports,
            external_name,
        };
        if self.services.get(&key) == Some(&info) {
            return false;
        }
        self.services.insert(key, info);
        true
    }

    pub(crate) fn delete_service(&mut self, namespace: String, name: String) -> bool {
        self.services.remove(&(namespace, name)).is_some()
    }

    pub(crate) fn apply_slice(&mut self, slice: k8s::EndpointSlice) -> bool {
        let key = (slice.namespace().unwrap_or_default(), slice.name_unchecked());
        let Some(service) = slice.labels().get(k8s::SERVICE_NAME_LABEL).cloned() else {
            return self.slices.remove(&key).is_some();
        };

        let ports = slice
            .ports
            .into_iter()
            .flatten()
            .filter_map(|p| {
                let port = u16::try_from(p.port?).ok()?;
                Some((p.name.filter(|n| !n.is_empty()), port))
            })
            .collect();

        let mut endpoints = Vec::new();
        for ep in slice.endpoints {
            // A missing condition means ready.
            let ready = ep.conditions.as_ref().and_then(|c| c.ready).unwrap_or(true);
            if !ready {
                continue;
            }
            let pod = ep
                .target_ref
                .as_ref()
                .filter(|r| r.kind.as_deref() == Some("Pod"))
                .and_then(|r| r.name.clone());
            for addr in &ep.addresses {
                match addr.parse::<IpAddr>() {
                    Ok(ip) => endpoints.push((ip, pod.clone())),
                    Err(_) => tracing::debug!(%addr, "Ignoring non-IP endpoint address"),
                }
            }
        }

        let info = SliceInfo {
            service,
            ports,
            endpoints,
        };
        if self.slices.get(&key) == Some(&info) {
            return false;
        }
        self.slices.insert(key, info);
        true
    }

    pub(crate) fn delete_slice(&mut self, namespace: String, name: String) -> bool {
        self.slices.remove(&(namespace, name)).is_some()
    }

    pub(crate) fn service_count(&self, namespace: &str) -> usize {
        self.services.keys().filter(|(ns, _)| ns == namespace).count()
    }

    pub(crate) fn slice_count(&self, namespace: &str) -> usize {
        self.slices.keys().filter(|(ns, _)| ns == namespace).count()
    }

    /// The first port of a service, used when a reference omits the port.
    pub(crate) fn default_port(&self, namespace: &str, name: &str) -> Option<u16> {
        self.services
            .get(&(namespace.to_string(), name.to_string()))?
            .ports
            .first()
            .map(|p| p.port)
    }

    /// Resolves a service port to its endpoints.
    ///
    /// `ExternalName` services resolve to their external name on the
    /// requested port. Other services resolve to the ready endpoints of their
    /// slices, on the target port of the slice port with the same name.
    pub(crate) fn resolve(
        &self,
        namespace: &str,
        name: &str,
        port: u16,
    ) -> Result<Endpoints, Unresolved> {
        let svc = self
            .services
            .get(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| Unresolved::Service {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;

        if let Some(host) = &svc.external_name {
            return Ok(Endpoints::ExternalName {
                host: host.clone(),
                port,
            });
        }

        let svc_port = svc
            .ports
            .iter()
            .find(|p| p.port == port)
            .ok_or_else(|| Unresolved::Port {
                namespace: namespace.to_string(),
                name: name.to_string(),
                port,
            })?;

        let mut endpoints = self
            .slices
            .iter()
            .filter(|((ns, _), slice)| ns == namespace && slice.service == name)
            .flat_map(|(_, slice)| {
                let target = slice
                    .ports
                    .iter()
                    .find(|(n, _)| *n == svc_port.name)
                    .map(|(_, p)| *p);
                slice.endpoints.iter().filter_map(move |(ip, pod)| {
                    Some(Endpoint {
                        addr: SocketAddr::new(*ip, target?),
                        pod: pod.clone(),
                    })
                })
            })
            .collect::<Vec<_>>();
        endpoints.sort_by(|a, b| a.addr.cmp(&b.addr));
        endpoints.dedup();
        Ok(Endpoints::Static(endpoints))
    }
}
