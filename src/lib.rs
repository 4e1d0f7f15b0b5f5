//! Cloud LB Controller: reconciles Kubernetes Services of type LoadBalancer
//! into cloud CLB/NLB load balancers.
//!
//! The pipeline resolves endpoints into backends, builds the desired model,
//! fetches the remote one, diffs them and applies the difference through a
//! [`provider::CloudProvider`].

pub mod annotations;
pub mod backend;
pub mod config;
pub mod controller;
pub mod diff;
pub mod error;
pub mod model;
pub mod provider;
pub mod retry;

pub use crate::error::{Error, Result};
