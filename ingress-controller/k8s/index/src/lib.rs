//! Ingress controller index
//!
//! The index holds every resource that affects routing and compiles them into a single
//! [`Config`](ingress_controller_core::Config) snapshot. It watches the following cluster
//! resources:
//!
//! - An `HTTPProxy` with a `virtualhost` is a root: it claims an FQDN and may delegate parts
//!   of its path space to other proxies through `includes`.
//! - Each `Service` resolves route backends to ports. `ExternalName` services resolve to
//!   their external name.
//! - Each `EndpointSlice` labeled with `kubernetes.io/service-name` contributes the ready
//!   addresses of its service.
//! - Each `Secret` may hold serving certificates, CA bundles or CRLs.
//!
//! ```text
//! [ HTTPProxy (root) ] -> [ HTTPProxy ]* -> [ Service ] <- [ EndpointSlice ]
//!          \-> [ Secret ]
//! ```
//!
//! Any change recompiles the whole graph. The resulting config and the status of every
//! proxy are published on separate watches, so the data plane and the status writer never
//! observe partially updated state.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod compile;
mod conditions;
mod index;
mod metrics;
mod policy;
mod secrets;
mod services;


pub use self::{
    compile::{
        ConditionError, ProxyStatus, Statuses, INVALID_DESCRIPTION, ORPHANED_DESCRIPTION,
        VALID_DESCRIPTION,
    },
    index::{Index, SecretRef, Settings, SharedIndex},
    metrics::{ConfigMetrics, IndexMetrics, SizedIndex},
    policy::DEFAULT_RESPONSE_TIMEOUT,
};
