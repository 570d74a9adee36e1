//! Restic Custom Resource Definition
//!
//! A Restic is a backup policy: it selects workloads by label and describes
//! which paths are backed up, where to, and on which schedule.

use k8s_openapi::api::core::v1::{LocalObjectReference, ResourceRequirements, VolumeMount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::Backend;

/// Restic resource specification
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "stash.appscode.com",
    version = "v1alpha1",
    kind = "Restic",
    plural = "restics",
    singular = "restic",
    shortname = "rst",
    namespaced,
    printcolumn = r#"{"name": "Schedule", "type": "string", "jsonPath": ".spec.schedule"}"#,
    printcolumn = r#"{"name": "Type", "type": "string", "jsonPath": ".spec.type"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ResticSpec {
    /// Label query over workloads this policy applies to
    #[serde(default)]
    pub selector: LabelSelector,

    /// Paths to back up
    #[serde(default)]
    pub file_groups: Vec<FileGroup>,

    /// Repository backend
    #[serde(default)]
    pub backend: Backend,

    /// Cron schedule of the sidecar
    #[serde(default)]
    pub schedule: String,

    /// Workload volumes exposed read-only to the backup container
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,

    /// Compute resources of the backup container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[serde(default)]
    pub retention_policies: Vec<RetentionPolicy>,

    /// Online policies run a sidecar, offline policies an init container
    #[serde(default, rename = "type")]
    pub backup_type: BackupType,

    #[serde(default)]
    pub image_pull_secrets: Vec<LocalObjectReference>,
}

/// A path backed up as one restic snapshot
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileGroup {
    pub path: String,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_policy_name: Option<String>,
}

/// Snapshot retention, mirrors `restic forget` flags
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_last: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_hourly: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_daily: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_weekly: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_monthly: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_yearly: Option<u32>,
    #[serde(default)]
    pub keep_tags: Vec<String>,
    #[serde(default)]
    pub prune: bool,
    #[serde(default)]
    pub dry_run: bool,
}

/// How the backup container is attached to the workload
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    /// Continuous: a sidecar driven by the cron schedule
    #[default]
    Online,
    /// One-shot: an init container that runs before the workload starts
    Offline,
}
