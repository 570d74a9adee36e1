//! Stash Kubernetes Operator
//!
//! Injects restic backup containers into workloads selected by `Restic`
//! policies and restores their data on `Recovery` requests.

pub mod adapters;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod reconcilers;
pub mod recovery;
pub mod resources;
pub mod restic;
pub mod runner;
pub mod workload;

pub use error::{Error, Result};
