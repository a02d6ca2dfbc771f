//! Writes the validity of every `HTTPProxy` back to its status subresource.
//!
//! The [`Index`] diffs the statuses computed by the resource index against the
//! status each proxy currently carries and queues merge patches for the ones
//! that differ. The [`Controller`] applies them. Only the holder of the
//! controller's lease writes statuses.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod controller;
mod index;

#[cfg(test)]
mod tests;

pub use self::{
    controller::{Controller, ControllerMetrics},
    index::{make_patch, make_status, Index, IndexMetrics, SharedIndex, Update},
};

/// The field manager used for status patches.
pub const STATUS_CONTROLLER_NAME: &str = "ingress.io/status-controller";
