#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod duration;
pub mod httpproxy;
pub mod status;
pub mod validation;

pub use self::{
    httpproxy::{HttpProxy, HttpProxySpec},
    status::{CurrentStatus, DetailedCondition, HttpProxyStatus, SubCondition},
};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{Secret, Service, ServicePort, ServiceSpec},
        discovery::v1::{Endpoint, EndpointConditions, EndpointPort, EndpointSlice},
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
    ByteString,
};
pub use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams, Resource, ResourceExt},
    runtime::watcher,
    Client,
};

/// The label that associates an `EndpointSlice` with its `Service`.
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";
