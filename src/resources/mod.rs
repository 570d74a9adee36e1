//! Builders for the Kubernetes objects the operator derives from its
//! resources: backup containers and volumes injected into workloads, and
//! recovery/check jobs.
//!
//! All list mutations are upserts keyed by name, so applying a builder twice
//! yields the same object as applying it once.

mod job;
mod sidecar;

pub use job::*;
pub use sidecar::*;

use k8s_openapi::api::core::v1::{Container, LocalObjectReference, Volume};

/// Name of the injected backup container and of job containers
pub const STASH_CONTAINER: &str = "stash";
/// Volume derived from a local backend
pub const LOCAL_VOLUME_NAME: &str = "stash-local";
/// Scratch space of the backup container
pub const SCRATCH_DIR_VOLUME_NAME: &str = "stash-scratchdir";
/// Downward API projection of the pod labels
pub const PODINFO_VOLUME_NAME: &str = "stash-podinfo";

pub const SCRATCH_DIR_MOUNT_PATH: &str = "/tmp";
pub const PODINFO_MOUNT_PATH: &str = "/etc/stash";

pub const RECOVERY_JOB_PREFIX: &str = "stash-recovery-";
pub const CHECK_JOB_PREFIX: &str = "stash-check-";

pub const LABEL_APP: &str = "app";
pub const APP_LABEL_STASH: &str = "stash";
pub const LABEL_RESTIC: &str = "restic";
pub const LABEL_RECOVERY: &str = "recovery";
pub const LABEL_OPERATION: &str = "operation";

pub const OPERATION_RECOVERY: &str = "recovery";
pub const OPERATION_CHECK: &str = "check";

/// Workload annotation holding the Restic that was last applied to it
pub const LAST_APPLIED_CONFIGURATION: &str = "restic.appscode.com/last-applied-configuration";
/// Restic annotation overriding the image tag of its backup container
pub const VERSION_TAG: &str = "restic.appscode.com/tag";

pub const ANALYTICS_CLIENT_ID_ENV: &str = "APPSCODE_ANALYTICS_CLIENT_ID";
pub const NODE_NAME_ENV: &str = "NODE_NAME";
pub const POD_NAME_ENV: &str = "POD_NAME";

/// Volume names user-declared mounts must not use
pub const RESERVED_VOLUME_NAMES: [&str; 3] = [
    LOCAL_VOLUME_NAME,
    SCRATCH_DIR_VOLUME_NAME,
    PODINFO_VOLUME_NAME,
];

/// Replace the volume with the same name in place, or append it
pub fn upsert_volume(volumes: &mut Vec<Volume>, volume: Volume) {
    match volumes.iter_mut().find(|v| v.name == volume.name) {
        Some(existing) => *existing = volume,
        None => volumes.push(volume),
    }
}

/// Remove the volume with the given name, keeping the order of the rest
pub fn ensure_volume_deleted(volumes: &mut Vec<Volume>, name: &str) {
    volumes.retain(|v| v.name != name);
}

/// Replace the container with the same name in place, or append it
pub fn upsert_container(containers: &mut Vec<Container>, container: Container) {
    match containers.iter_mut().find(|c| c.name == container.name) {
        Some(existing) => *existing = container,
        None => containers.push(container),
    }
}

pub fn ensure_container_deleted(containers: &mut Vec<Container>, name: &str) {
    containers.retain(|c| c.name != name);
}

/// Add every reference not already present, by name
pub fn merge_local_object_references(
    existing: &mut Vec<LocalObjectReference>,
    additions: &[LocalObjectReference],
) {
    for reference in additions {
        if !existing.iter().any(|r| r.name == reference.name) {
            existing.push(reference.clone());
        }
    }
}
