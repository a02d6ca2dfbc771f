use crate::{
    conditions::{route_match, InvalidConditions},
    index::Settings,
    policy,
    secrets::{secret_ref, InvalidSecret, SecretIndex},
    services::{ServiceIndex, Unresolved},
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use ingress_controller_core::{
    authz::{self, AuthPolicy, AuthorizationServer, RouteAuthorization},
    host::VirtualHosts,
    ip_filter::IpFilter,
    ratelimit::{self, RateLimitPolicy},
    retry::HealthCheckPolicy,
    tls::{ClientValidation, TlsCertificate, TlsVersion, VirtualHostTls},
    Backend, Cluster, Config, Endpoints, ProxyRef, Route, RouteAction, RouteRef, ServiceRef,
    UpstreamProtocol, UpstreamValidation, VirtualHost,
};
use ingress_controller_k8s_api::{
    httpproxy::{self as api, MatchCondition},
    validation, CurrentStatus, HttpProxy,
};
use std::{collections::BTreeMap, sync::Arc};

/// The compiled status of every `HTTPProxy` the controller accepts.
pub type Statuses = HashMap<ProxyRef, ProxyStatus>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyStatus {
    pub generation: Option<i64>,
    pub current: CurrentStatus,
    pub description: &'static str,
    pub errors: Vec<ConditionError>,
}

/// An error entry of a proxy's `Valid` condition.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConditionError {
    pub type_: &'static str,
    pub reason: &'static str,
    pub message: String,
}

pub const VALID_DESCRIPTION: &str = "Valid HTTPProxy";
pub const INVALID_DESCRIPTION: &str = "At least one error present, see Errors for details";
pub const ORPHANED_DESCRIPTION: &str =
    "this HTTPProxy is not part of a delegation chain from a root HTTPProxy";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum ProxyError {
    #[error("Spec failed validation: {0}")]
    Spec(String),

    #[error("fqdn {fqdn:?} is used in multiple HTTPProxies: {proxies}")]
    DuplicateVhost { fqdn: String, proxies: String },

    #[error("Spec.Routes unresolved service reference: {0}")]
    ServiceUnresolved(Unresolved),

    #[error("Spec.VirtualHost.Authorization unresolved service reference: {0}")]
    AuthServiceUnresolved(Unresolved),

    #[error("route {0}: route.services must have at least one entry")]
    NoServices(usize),

    #[error("Spec.VirtualHost.TLS.SecretName is required")]
    MissingSecretName,

    #[error("Spec.VirtualHost.TLS {0}")]
    Secret(InvalidSecret),

    #[error("service {service:?} upstream validation: {error}")]
    UpstreamCa {
        service: String,
        error: InvalidSecret,
    },

    #[error("Spec.VirtualHost.TLS.MinimumProtocolVersion {0:?} is not supported")]
    TlsVersion(String),

    #[error("Spec.VirtualHost.TLS enables the fallback certificate but none is configured")]
    FallbackNotPresent,

    #[error("Spec.VirtualHost.TLS fallback certificate and client validation are incompatible")]
    FallbackIncompatible,

    #[error("include {0} not found")]
    IncludeNotFound(ProxyRef),

    #[error("include {0} is invalid")]
    IncludeInvalid(ProxyRef),

    #[error("include creates an include cycle: {0}")]
    IncludeCycle(String),

    #[error("root httpproxy cannot include another root httpproxy: {0}")]
    RootIncludesRoot(ProxyRef),

    #[error("duplicate conditions defined on an include")]
    DuplicateIncludeConditions,

    #[error("include {0}: more than one path condition")]
    IncludePathConditions(ProxyRef),

    #[error("route {index}: {error}")]
    RouteConditions {
        index: usize,
        error: InvalidConditions,
    },

    #[error("route {index}: invalid {policy}")]
    RoutePolicy { index: usize, policy: &'static str },
}

pub(crate) struct Compiled {
    pub(crate) config: Config,
    pub(crate) statuses: Statuses,
}

struct Compiler<'a> {
    proxies: &'a BTreeMap<ProxyRef, &'a HttpProxy>,
    services: &'a ServiceIndex,
    secrets: &'a SecretIndex,
    errors: BTreeMap<ProxyRef, Vec<ProxyError>>,
    spec_invalid: HashSet<ProxyRef>,
    reached: HashSet<ProxyRef>,
    clusters: HashMap<String, Vec<Arc<Cluster>>>,
}

/// Virtual-host scoped state shared by every route of a delegation tree.
struct VhostContext {
    fqdn: String,
    rate_limit_key: String,
    rate_limits: RateLimitPolicy,
    ip_filter: IpFilter,
    authorized: bool,
    auth_policy: Option<AuthPolicy>,
}

/// Compiles every accepted proxy into a routing snapshot along with each
/// proxy's status.
pub(crate) fn compile(
    settings: &Settings,
    proxies: &HashMap<ProxyRef, HttpProxy>,
    services: &ServiceIndex,
    secrets: &SecretIndex,
) -> Compiled {
    let accepted = proxies
        .iter()
        .filter(|(_, p)| accepts(settings, p))
        .map(|(id, p)| (id.clone(), p))
        .collect::<BTreeMap<_, _>>();

    let mut compiler = Compiler {
        proxies: &accepted,
        services,
        secrets,
        errors: BTreeMap::new(),
        spec_invalid: HashSet::new(),
        reached: HashSet::new(),
        clusters: HashMap::new(),
    };

    for (id, proxy) in &accepted {
        if let Err(errors) = validation::validate(&proxy.spec) {
            compiler.error(id, ProxyError::Spec(errors.to_string()));
            compiler.spec_invalid.insert(id.clone());
        }
    }

    let mut fqdns = BTreeMap::<String, Vec<ProxyRef>>::new();
    for (id, proxy) in &accepted {
        if compiler.spec_invalid.contains(id) {
            continue;
        }
        if let Some(vhost) = &proxy.spec.virtualhost {
            fqdns
                .entry(vhost.fqdn.to_ascii_lowercase())
                .or_default()
                .push(id.clone());
        }
    }

    let fallback = settings.fallback_certificate.as_ref().and_then(|s| {
        match secrets.certificate(&s.namespace, &s.name) {
            Ok(cert) => Some(Arc::new(cert)),
            Err(error) => {
                tracing::warn!(%error, "Fallback certificate is not available");
                None
            }
        }
    });

    let mut vhosts = VirtualHosts::default();
    for (fqdn, roots) in fqdns {
        if let [root] = &roots[..] {
            if let Some(vhost) = compiler.virtual_host(root, fqdn, fallback.is_some()) {
                vhosts.insert(Arc::new(vhost));
            }
            continue;
        }
        let names = roots
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        for root in &roots {
            compiler.error(
                root,
                ProxyError::DuplicateVhost {
                    fqdn: fqdn.clone(),
                    proxies: names.clone(),
                },
            );
        }
    }

    let mut statuses = Statuses::default();
    for (id, proxy) in &accepted {
        let errors = compiler.errors.remove(id).unwrap_or_default();
        let status = if !errors.is_empty() {
            ProxyStatus {
                generation: proxy.metadata.generation,
                current: CurrentStatus::Invalid,
                description: INVALID_DESCRIPTION,
                errors: errors.iter().map(ConditionError::from).collect(),
            }
        } else if proxy.is_root() || compiler.reached.contains(id) {
            ProxyStatus {
                generation: proxy.metadata.generation,
                current: CurrentStatus::Valid,
                description: VALID_DESCRIPTION,
                errors: vec![],
            }
        } else {
            ProxyStatus {
                generation: proxy.metadata.generation,
                current: CurrentStatus::Orphaned,
                description: ORPHANED_DESCRIPTION,
                errors: vec![ConditionError {
                    type_: "Orphaned",
                    reason: "Orphaned",
                    message: ORPHANED_DESCRIPTION.to_string(),
                }],
            }
        };
        statuses.insert(id.clone(), status);
    }

    Compiled {
        config: Config {
            vhosts,
            fallback_certificate: fallback,
        },
        statuses,
    }
}

/// Proxies without a class are served by every controller.
fn accepts(settings: &Settings, proxy: &HttpProxy) -> bool {
    match &proxy.spec.ingress_class_name {
        None => true,
        Some(class) => settings.ingress_class_name.as_ref() == Some(class),
    }
}

// === impl Compiler ===

impl<'a> Compiler<'a> {
    fn error(&mut self, id: &ProxyRef, error: ProxyError) {
        let errors = self.errors.entry(id.clone()).or_default();
        if !errors.contains(&error) {
            errors.push(error);
        }
    }

    fn has_errors(&self, id: &ProxyRef) -> bool {
        self.errors.get(id).is_some_and(|e| !e.is_empty())
    }

    fn virtual_host(
        &mut self,
        root: &ProxyRef,
        fqdn: String,
        has_fallback: bool,
    ) -> Option<VirtualHost> {
        let proxies = self.proxies;
        let proxy = *proxies.get(root)?;
        let spec = proxy.spec.virtualhost.as_ref()?;

        let tls = match spec.tls.as_ref().map(|tls| self.tls(root, tls, has_fallback)) {
            None => None,
            Some(Ok(tls)) => Some(Arc::new(tls)),
            Some(Err(error)) => {
                self.error(root, error);
                None
            }
        };

        let authorization = match spec
            .authorization
            .as_ref()
            .map(|authz| self.authorization(root, authz))
        {
            None => None,
            Some(Ok(server)) => Some(server),
            Some(Err(error)) => {
                self.error(root, error);
                None
            }
        };

        let vhost = VhostContext {
            rate_limit_key: format!("vhost/{fqdn}"),
            rate_limits: policy::rate_limits(spec.rate_limit_policy.as_ref()).0,
            ip_filter: policy::ip_filter(&spec.ip_allow_policy, &spec.ip_deny_policy),
            authorized: spec.authorization.is_some(),
            auth_policy: policy::auth_policy(
                spec.authorization
                    .as_ref()
                    .and_then(|a| a.auth_policy.as_ref()),
            ),
            fqdn,
        };

        let mut routes = Vec::new();
        self.visit(&vhost, root, &[], &mut Vec::new(), &mut routes);
        if self.has_errors(root) {
            tracing::debug!(proxy = %root, fqdn = %vhost.fqdn, "Virtual host is invalid");
            return None;
        }
        Some(VirtualHost::new(
            vhost.fqdn,
            root.clone(),
            tls,
            authorization,
            routes,
        ))
    }

    /// Compiles a proxy's routes and walks its includes depth-first.
    ///
    /// Returns false if the proxy or anything it includes is invalid.
    fn visit(
        &mut self,
        vhost: &VhostContext,
        id: &ProxyRef,
        inherited: &[MatchCondition],
        stack: &mut Vec<ProxyRef>,
        routes: &mut Vec<Arc<Route>>,
    ) -> bool {
        let proxies = self.proxies;
        let Some(&proxy) = proxies.get(id) else {
            return false;
        };
        self.reached.insert(id.clone());
        if self.spec_invalid.contains(id) {
            return false;
        }

        stack.push(id.clone());
        for (index, route) in proxy.spec.routes.iter().enumerate() {
            let conditions = inherited
                .iter()
                .chain(&route.conditions)
                .cloned()
                .collect::<Vec<_>>();
            match self.route(vhost, id, index, route, &conditions) {
                Ok(route) => routes.push(Arc::new(route)),
                Err(error) => self.error(id, error),
            }
        }

        let mut seen = Vec::<&[MatchCondition]>::new();
        for include in &proxy.spec.includes {
            let target = ProxyRef::new(
                include.namespace.as_deref().unwrap_or(&id.namespace),
                &include.name,
            );
            if include.conditions.iter().filter(|c| c.is_path()).count() > 1 {
                self.error(id, ProxyError::IncludePathConditions(target));
                continue;
            }
            if seen.contains(&include.conditions.as_slice()) {
                self.error(id, ProxyError::DuplicateIncludeConditions);
                continue;
            }
            seen.push(&include.conditions);

            let Some(&child) = proxies.get(&target) else {
                self.error(id, ProxyError::IncludeNotFound(target));
                continue;
            };
            if child.is_root() {
                self.error(id, ProxyError::RootIncludesRoot(target));
                continue;
            }
            if stack.contains(&target) {
                let cycle = stack
                    .iter()
                    .chain(Some(&target))
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" -> ");
                self.error(id, ProxyError::IncludeCycle(cycle));
                continue;
            }

            let conditions = inherited
                .iter()
                .chain(&include.conditions)
                .cloned()
                .collect::<Vec<_>>();
            if !self.visit(vhost, &target, &conditions, stack, routes) {
                self.error(id, ProxyError::IncludeInvalid(target));
            }
        }
        stack.pop();

        !self.has_errors(id)
    }

    fn route(
        &mut self,
        vhost: &VhostContext,
        proxy: &ProxyRef,
        index: usize,
        route: &api::Route,
        conditions: &[MatchCondition],
    ) -> Result<Route, ProxyError> {
        let matches =
            route_match(conditions).map_err(|error| ProxyError::RouteConditions { index, error })?;
        let id = RouteRef {
            proxy: proxy.clone(),
            index,
        };

        let action = if let Some(direct) = &route.direct_response_policy {
            RouteAction::DirectResponse(policy::direct_response(direct).ok_or(
                ProxyError::RoutePolicy {
                    index,
                    policy: "directResponsePolicy",
                },
            )?)
        } else if let Some(redirect) = &route.request_redirect_policy {
            RouteAction::Redirect(policy::request_redirect(redirect).ok_or(
                ProxyError::RoutePolicy {
                    index,
                    policy: "requestRedirectPolicy",
                },
            )?)
        } else if route.services.is_empty() {
            return Err(ProxyError::NoServices(index));
        } else {
            let health_check = policy::health_check(route.health_check_policy.as_ref());
            let weights = policy::weights(&route.services);
            let backends = route
                .services
                .iter()
                .zip(weights)
                .map(|(svc, weight)| -> Result<Backend, ProxyError> {
                    Ok(Backend {
                        cluster: self.cluster(&proxy.namespace, svc, health_check.clone())?,
                        weight,
                        request_headers: policy::headers(svc.request_headers_policy.as_ref()),
                        response_headers: policy::headers(svc.response_headers_policy.as_ref()),
                        cookie_rewrites: policy::cookie_rewrites(&svc.cookie_rewrite_policies),
                    })
                })
                .collect::<Result<Vec<_>, ProxyError>>()?;
            RouteAction::Forward(backends)
        };

        let authorization = if vhost.authorized {
            authz::route_authorization(
                vhost.auth_policy.as_ref(),
                policy::auth_policy(route.auth_policy.as_ref()).as_ref(),
            )
        } else {
            RouteAuthorization::None
        };

        let (route_limits, mode) = policy::rate_limits(route.rate_limit_policy.as_ref());
        let rate_limits = ratelimit::compose(
            &vhost.rate_limit_key,
            &vhost.rate_limits,
            &format!("{}/{id}", vhost.fqdn),
            &route_limits,
            mode,
        );

        Ok(Route {
            id,
            matches,
            action,
            permit_insecure: route.permit_insecure,
            authorization,
            timeout: policy::response_timeout(route.timeout_policy.as_ref()),
            retry: policy::retry(route.retry_policy.as_ref()),
            path_rewrite: policy::path_rewrite(route.path_rewrite_policy.as_ref()),
            request_headers: policy::headers(route.request_headers_policy.as_ref()),
            response_headers: policy::headers(route.response_headers_policy.as_ref()),
            cookie_rewrites: policy::cookie_rewrites(&route.cookie_rewrite_policies),
            rate_limits,
            ip_filter: policy::ip_filter(&route.ip_allow_policy, &route.ip_deny_policy)
                .or_inherit(&vhost.ip_filter),
            internal_redirect: policy::internal_redirect(route.internal_redirect_policy.as_ref()),
            response_overrides: policy::response_overrides(&route.response_override_policy),
        })
    }

    fn cluster(
        &mut self,
        namespace: &str,
        svc: &api::Service,
        health_check: Option<HealthCheckPolicy>,
    ) -> Result<Arc<Cluster>, ProxyError> {
        // Out-of-range ports are rejected by validation; port 0 never resolves.
        let port = u16::try_from(svc.port).unwrap_or(0);
        let endpoints = self
            .services
            .resolve(namespace, &svc.name, port)
            .map_err(ProxyError::ServiceUnresolved)?;

        let validation = match &svc.validation {
            None => None,
            Some(v) => {
                let (ns, name) = secret_ref(namespace, &v.ca_secret);
                let ca_pem =
                    self.secrets
                        .ca_bundle(ns, name)
                        .map_err(|error| ProxyError::UpstreamCa {
                            service: svc.name.clone(),
                            error,
                        })?;
                let subject_names = if v.subject_names.is_empty() {
                    vec![v.subject_name.clone()]
                } else {
                    v.subject_names.clone()
                };
                Some(UpstreamValidation {
                    ca_pem,
                    subject_names,
                })
            }
        };

        let protocol = match svc.protocol.as_deref() {
            Some("h2") => UpstreamProtocol::H2,
            Some("h2c") => UpstreamProtocol::H2c,
            Some("tls") => UpstreamProtocol::Tls,
            _ if validation.is_some() => UpstreamProtocol::Tls,
            _ => UpstreamProtocol::Http1,
        };

        Ok(self.intern(Cluster {
            name: String::new(),
            service: ServiceRef {
                namespace: namespace.to_string(),
                name: svc.name.clone(),
                port,
            },
            protocol,
            endpoints,
            validation,
            health_check,
        }))
    }

    /// Shares identical clusters across routes. Clusters of the same service
    /// port with different settings get distinct names.
    fn intern(&mut self, mut cluster: Cluster) -> Arc<Cluster> {
        let base = cluster.service.to_string();
        let variants = self.clusters.entry(base.clone()).or_default();
        for existing in variants.iter() {
            cluster.name.clone_from(&existing.name);
            if **existing == cluster {
                return existing.clone();
            }
        }
        cluster.name = match variants.len() {
            0 => base,
            n => format!("{base}#{n}"),
        };
        let cluster = Arc::new(cluster);
        variants.push(cluster.clone());
        cluster
    }

    fn authorization(
        &mut self,
        root: &ProxyRef,
        server: &api::AuthorizationServer,
    ) -> Result<AuthorizationServer, ProxyError> {
        let ext = &server.extension_ref;
        let namespace = ext.namespace.as_deref().unwrap_or(&root.namespace);
        let unresolved = || Unresolved::Service {
            namespace: namespace.to_string(),
            name: ext.name.clone(),
        };
        let port = match ext.port {
            Some(port) => u16::try_from(port).unwrap_or(0),
            None => self
                .services
                .default_port(namespace, &ext.name)
                .ok_or_else(|| ProxyError::AuthServiceUnresolved(unresolved()))?,
        };
        let endpoints: Endpoints = self
            .services
            .resolve(namespace, &ext.name, port)
            .map_err(ProxyError::AuthServiceUnresolved)?;
        let cluster = self.intern(Cluster {
            name: String::new(),
            service: ServiceRef {
                namespace: namespace.to_string(),
                name: ext.name.clone(),
                port,
            },
            protocol: UpstreamProtocol::Http1,
            endpoints,
            validation: None,
            health_check: None,
        });
        Ok(AuthorizationServer {
            cluster,
            fail_open: server.fail_open,
            response_timeout: server
                .response_timeout
                .map(Into::into)
                .unwrap_or(authz::DEFAULT_RESPONSE_TIMEOUT),
        })
    }

    fn tls(
        &self,
        root: &ProxyRef,
        tls: &api::Tls,
        has_fallback: bool,
    ) -> Result<VirtualHostTls, ProxyError> {
        let secret_name = tls
            .secret_name
            .as_deref()
            .ok_or(ProxyError::MissingSecretName)?;
        let (ns, name) = secret_ref(&root.namespace, secret_name);
        let certificate: TlsCertificate = self
            .secrets
            .certificate(ns, name)
            .map_err(ProxyError::Secret)?;

        let version = tls.minimum_protocol_version.as_deref().unwrap_or_default();
        let minimum_version = version
            .parse::<TlsVersion>()
            .map_err(|_| ProxyError::TlsVersion(version.to_string()))?;

        if tls.enable_fallback_certificate {
            if tls.client_validation.is_some() {
                return Err(ProxyError::FallbackIncompatible);
            }
            if !has_fallback {
                return Err(ProxyError::FallbackNotPresent);
            }
        }

        let client_validation = match &tls.client_validation {
            None => None,
            Some(v) => {
                let ca_pem = v
                    .ca_secret
                    .as_deref()
                    .map(|s| {
                        let (ns, name) = secret_ref(&root.namespace, s);
                        self.secrets.ca_bundle(ns, name)
                    })
                    .transpose()
                    .map_err(ProxyError::Secret)?;
                let crl_pem = v
                    .crl_secret
                    .as_deref()
                    .map(|s| {
                        let (ns, name) = secret_ref(&root.namespace, s);
                        self.secrets.crls(ns, name)
                    })
                    .transpose()
                    .map_err(ProxyError::Secret)?;
                Some(ClientValidation {
                    ca_pem,
                    crl_pem,
                    only_verify_leaf_cert_crl: v.only_verify_leaf_cert_crl,
                    skip_verification: v.skip_client_cert_validation,
                    optional: v.optional_client_certificate,
                })
            }
        };

        Ok(VirtualHostTls {
            certificate: Arc::new(certificate),
            minimum_version,
            fallback_certificate: tls.enable_fallback_certificate,
            client_validation,
        })
    }
}

// === impl ProxyError ===

impl ProxyError {
    /// The condition type and reason this error is reported under.
    fn condition(&self) -> (&'static str, &'static str) {
        match self {
            Self::Spec(_) => ("SpecError", "SpecError"),
            Self::DuplicateVhost { .. } => ("VirtualHostError", "DuplicateVhost"),
            Self::ServiceUnresolved(_) => ("ServiceError", "ServiceUnresolvedReference"),
            Self::AuthServiceUnresolved(_) => ("AuthError", "ServiceUnresolvedReference"),
            Self::NoServices(_) => ("RouteError", "NoServicesPresent"),
            Self::MissingSecretName | Self::Secret(_) => ("TLSError", "SecretNotValid"),
            Self::UpstreamCa { .. } => ("ServiceError", "SecretNotValid"),
            Self::TlsVersion(_) => ("TLSError", "TLSConfigNotValid"),
            Self::FallbackNotPresent => ("TLSError", "FallbackNotPresent"),
            Self::FallbackIncompatible => ("TLSError", "TLSIncompatibleFeatures"),
            Self::IncludeNotFound(_) => ("IncludeError", "IncludeNotFound"),
            Self::IncludeInvalid(_) => ("IncludeError", "IncludeInvalid"),
            Self::IncludeCycle(_) => ("IncludeError", "IncludeCreatesCycle"),
            Self::RootIncludesRoot(_) => ("IncludeError", "RootIncludesRoot"),
            Self::DuplicateIncludeConditions => ("IncludeError", "DuplicateMatchConditions"),
            Self::IncludePathConditions(_) => ("IncludeError", "PathMatchConditionsNotValid"),
            Self::RouteConditions { .. } => ("RouteError", "PathMatchConditionsNotValid"),
            Self::RoutePolicy { .. } => ("RouteError", "PolicyNotValid"),
        }
    }
}

impl From<&ProxyError> for ConditionError {
    fn from(error: &ProxyError) -> Self {
        let (type_, reason) = error.condition();
        Self {
            type_,
            reason,
            message: error.to_string(),
        }
    }
}

// === impl ProxyStatus ===

impl ProxyStatus {
    pub fn is_valid(&self) -> bool {
        self.current == CurrentStatus::Valid
    }

    pub fn reasons(&self) -> Vec<&'static str> {
        self.errors.iter().map(|e| e.reason).collect()
    }
}
