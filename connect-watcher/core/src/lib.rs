#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod config;
pub mod duration;
mod health;
mod identity;
pub mod registry;

pub use self::{
    config::{Config, Downstream, Tls, Upstream, UpstreamNode},
    duration::GoDuration,
    health::{aggregated_status, HealthStatus},
    identity::{LeafIdentity, TrustRoots},
    registry::Registry,
};

/// The address a sidecar listener binds when the registration doesn't name one.
pub const DEFAULT_DOWNSTREAM_BIND_ADDR: &str = "0.0.0.0";

/// The address of the local application when the registration doesn't name one.
pub const DEFAULT_TARGET_ADDR: &str = "127.0.0.1";
