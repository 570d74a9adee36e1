//! Reconcilers for the Stash resources
//!
//! This module contains the business logic run by the queue workers:
//! - Validating Restic and Recovery specs
//! - Fanning Restic changes out to workloads
//! - Injecting and removing backup containers
//! - Launching recovery and check jobs with their RBAC

pub mod jobs;
pub mod rbac;
pub mod recovery;
pub mod restic;
pub mod workload;

pub use jobs::launch_check_job;
pub use recovery::RecoveryReconciler;
pub use restic::{ResticReconciler, WorkloadQueues};
pub use workload::WorkloadReconciler;
