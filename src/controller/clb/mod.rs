//! Classic load balancer pipeline
//!
//! [`build_local`] turns the Service into the desired model,
//! [`build_remote`] reads the actual one back and [`apply`] converges the
//! two: load balancer first, then virtual server groups and listeners
//! concurrently, then cleanup.

mod applier;
mod builder;
mod fetcher;
mod listener;

#[cfg(test)]
mod applier_test;

pub use applier::apply;
pub use builder::build_local;
pub use fetcher::build_remote;
pub use listener::{strategy_for, ProtocolStrategy};

/// Backends per add/remove/update call
pub const MAX_BACKENDS_PER_CALL: usize = 39;
