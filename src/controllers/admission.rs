//! Admission and change suppression
//!
//! Every add/update notification passes through an [`Admission`] before it
//! reaches a queue: invalid objects are rejected and reported, updates that
//! leave the declared spec unchanged are suppressed. Status writes and
//! resyncs therefore never re-enter the queue.

use k8s_openapi::api::core::v1::{ObjectReference, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::DynamicObject;
use kube::{Resource, ResourceExt};

use crate::adapters::reasons;
use crate::crd::{Recovery, RecoverySpec, Restic, ResticSpec};
use crate::error::{Error, Result};
use crate::reconcilers;
use crate::resources::LAST_APPLIED_CONFIGURATION;
use crate::workload::{WorkloadKind, WorkloadRef};

/// Outcome of admitting an add/update notification
#[derive(Debug)]
pub enum Decision {
    Enqueue,
    Reject(Error),
    Suppress,
}

/// Admission policy of one resource kind
pub trait Admission<K>: Send + Sync + 'static {
    /// Kind label used in logs and metrics
    fn kind(&self) -> &'static str;

    fn validate(&self, obj: &K) -> Result<()>;

    /// Whether `new` differs from `old` in a way worth reprocessing
    fn meaningful_change(&self, old: &K, new: &K) -> bool;

    /// Event reason attached to rejected objects
    fn invalid_reason(&self) -> &'static str;

    fn object_ref(&self, obj: &K) -> ObjectReference;
}

/// Decide what to do with an add (`old` is `None`) or update notification.
///
/// An update without a meaningful change is suppressed before validation,
/// so an invalid object is reported once per change rather than on every
/// resync.
pub fn decide<K, A: Admission<K>>(admission: &A, old: Option<&K>, new: &K) -> Decision {
    if let Some(old) = old {
        if !admission.meaningful_change(old, new) {
            return Decision::Suppress;
        }
    }
    match admission.validate(new) {
        Ok(()) => Decision::Enqueue,
        Err(e) => Decision::Reject(e),
    }
}

pub struct ResticAdmission;

impl Admission<Restic> for ResticAdmission {
    fn kind(&self) -> &'static str {
        "Restic"
    }

    fn validate(&self, obj: &Restic) -> Result<()> {
        reconcilers::restic::validate(obj)
    }

    fn meaningful_change(&self, old: &Restic, new: &Restic) -> bool {
        !restic_spec_equal(&old.spec, &new.spec)
    }

    fn invalid_reason(&self) -> &'static str {
        reasons::INVALID_RESTIC
    }

    fn object_ref(&self, obj: &Restic) -> ObjectReference {
        obj.object_ref(&())
    }
}

pub struct RecoveryAdmission;

impl Admission<Recovery> for RecoveryAdmission {
    fn kind(&self) -> &'static str {
        "Recovery"
    }

    fn validate(&self, obj: &Recovery) -> Result<()> {
        reconcilers::recovery::validate(obj)
    }

    fn meaningful_change(&self, old: &Recovery, new: &Recovery) -> bool {
        !recovery_spec_equal(&old.spec, &new.spec)
    }

    fn invalid_reason(&self) -> &'static str {
        reasons::INVALID_RECOVERY
    }

    fn object_ref(&self, obj: &Recovery) -> ObjectReference {
        obj.object_ref(&())
    }
}

/// Workloads are always admitted; updates count when the labels, the pod
/// template or the applied Restic change.
pub struct WorkloadAdmission {
    pub kind: WorkloadKind,
}

impl Admission<DynamicObject> for WorkloadAdmission {
    fn kind(&self) -> &'static str {
        self.kind.as_str()
    }

    fn validate(&self, _obj: &DynamicObject) -> Result<()> {
        Ok(())
    }

    fn meaningful_change(&self, old: &DynamicObject, new: &DynamicObject) -> bool {
        old.labels() != new.labels()
            || old.annotations().get(LAST_APPLIED_CONFIGURATION)
                != new.annotations().get(LAST_APPLIED_CONFIGURATION)
            || old.data.pointer("/spec/template") != new.data.pointer("/spec/template")
    }

    fn invalid_reason(&self) -> &'static str {
        reasons::INVALID_WORKLOAD
    }

    fn object_ref(&self, obj: &DynamicObject) -> ObjectReference {
        obj.object_ref(&self.kind.api_resource())
    }
}

fn selector_equal(a: &LabelSelector, b: &LabelSelector) -> bool {
    a.match_labels.clone().unwrap_or_default() == b.match_labels.clone().unwrap_or_default()
        && a.match_expressions.as_deref().unwrap_or_default()
            == b.match_expressions.as_deref().unwrap_or_default()
}

fn resources_equal(a: Option<&ResourceRequirements>, b: Option<&ResourceRequirements>) -> bool {
    let normalize = |r: Option<&ResourceRequirements>| {
        let r = r.cloned().unwrap_or_default();
        ResourceRequirements {
            claims: r.claims.filter(|c| !c.is_empty()),
            limits: r.limits.filter(|m| !m.is_empty()),
            requests: r.requests.filter(|m| !m.is_empty()),
        }
    };
    normalize(a) == normalize(b)
}

/// Compare the declared Restic specs, treating absent and empty as equal
pub fn restic_spec_equal(a: &ResticSpec, b: &ResticSpec) -> bool {
    selector_equal(&a.selector, &b.selector)
        && a.file_groups == b.file_groups
        && a.backend == b.backend
        && a.schedule == b.schedule
        && a.volume_mounts == b.volume_mounts
        && resources_equal(a.resources.as_ref(), b.resources.as_ref())
        && a.retention_policies == b.retention_policies
        && a.backup_type == b.backup_type
        && a.image_pull_secrets == b.image_pull_secrets
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn workload_equal(a: &crate::crd::LocalTypedReference, b: &crate::crd::LocalTypedReference) -> bool {
    match (WorkloadRef::canonicalize(a), WorkloadRef::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Compare the declared Recovery specs; workload kind aliases and empty
/// optional strings compare equal to their canonical forms
pub fn recovery_spec_equal(a: &RecoverySpec, b: &RecoverySpec) -> bool {
    workload_equal(&a.workload, &b.workload)
        && non_empty(&a.pod_ordinal) == non_empty(&b.pod_ordinal)
        && non_empty(&a.node_name) == non_empty(&b.node_name)
        && a.backend == b.backend
        && a.paths == b.paths
        && a.recovered_volumes == b.recovered_volumes
        && a.image_pull_secrets == b.image_pull_secrets
}
