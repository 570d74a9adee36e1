//! Recovery Custom Resource Definition

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::LocalObjectReference;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{Backend, LocalSpec, LocalTypedReference};

/// Recovery resource specification
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "stash.appscode.com",
    version = "v1alpha1",
    kind = "Recovery",
    plural = "recoveries",
    singular = "recovery",
    shortname = "rec",
    namespaced,
    status = "RecoveryStatus",
    printcolumn = r#"{"name": "Workload", "type": "string", "jsonPath": ".spec.workload.name"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RecoverySpec {
    /// Workload whose backed-up data is restored
    #[serde(default)]
    pub workload: LocalTypedReference,

    /// Replica ordinal, StatefulSet only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_ordinal: Option<String>,

    /// Node whose data is restored, DaemonSet only. The job is pinned there.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    /// Repository backend
    #[serde(default)]
    pub backend: Backend,

    /// Paths to restore
    #[serde(default)]
    pub paths: Vec<String>,

    /// Volumes the data is restored into
    #[serde(default)]
    pub recovered_volumes: Vec<LocalSpec>,

    #[serde(default)]
    pub image_pull_secrets: Vec<LocalObjectReference>,
}

/// Recovery lifecycle phase
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum RecoveryPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RecoveryPhase {
    /// Succeeded and Failed are never left
    pub fn is_terminal(self) -> bool {
        matches!(self, RecoveryPhase::Succeeded | RecoveryPhase::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryPhase::Pending => "Pending",
            RecoveryPhase::Running => "Running",
            RecoveryPhase::Succeeded => "Succeeded",
            RecoveryPhase::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for RecoveryPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recovery status
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryStatus {
    /// Unset means Pending
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<RecoveryPhase>,

    /// One entry per restored path
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stats: Vec<RestoreStats>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Outcome of restoring one path
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RestoreStats {
    pub path: String,
    /// Wall-clock time of the restore, e.g. `1.5s`
    pub duration: String,
    /// Succeeded or Failed
    pub phase: RecoveryPhase,
}

impl Recovery {
    /// Current phase, Pending when no status has been written yet
    pub fn phase(&self) -> RecoveryPhase {
        self.status
            .as_ref()
            .and_then(|s| s.phase)
            .unwrap_or_default()
    }
}
