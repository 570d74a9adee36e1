//! Workload kinds the operator can inject backup containers into
//!
//! Every kind is handled through the same [`Workload`] wrapper around a
//! `DynamicObject`; the per-kind differences (API coordinates, replica
//! semantics, host identity) live on [`WorkloadKind`].

mod selector;

pub use selector::*;

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{ObjectReference, PodSpec};
use kube::api::{ApiResource, DynamicObject};
use kube::core::GroupVersionKind;
use kube::{Resource, ResourceExt};
use serde_json::Value;

use crate::crd::LocalTypedReference;
use crate::error::{Error, Result};

/// Closed set of workload kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkloadKind {
    Deployment,
    ReplicaSet,
    ReplicationController,
    StatefulSet,
    DaemonSet,
    DeploymentConfig,
}

impl WorkloadKind {
    pub const ALL: [WorkloadKind; 6] = [
        WorkloadKind::Deployment,
        WorkloadKind::ReplicaSet,
        WorkloadKind::ReplicationController,
        WorkloadKind::StatefulSet,
        WorkloadKind::DaemonSet,
        WorkloadKind::DeploymentConfig,
    ];

    /// Map a kind name or one of its aliases onto the closed set
    pub fn canonicalize(kind: &str) -> Result<Self> {
        match kind.to_lowercase().as_str() {
            "deployments" | "deployment" | "deploy" => Ok(WorkloadKind::Deployment),
            "replicasets" | "replicaset" | "rs" => Ok(WorkloadKind::ReplicaSet),
            "replicationcontrollers" | "replicationcontroller" | "rc" => {
                Ok(WorkloadKind::ReplicationController)
            }
            "statefulsets" | "statefulset" => Ok(WorkloadKind::StatefulSet),
            "daemonsets" | "daemonset" | "ds" => Ok(WorkloadKind::DaemonSet),
            "deploymentconfigs" | "deploymentconfig" | "dc" => Ok(WorkloadKind::DeploymentConfig),
            _ => Err(Error::validation(format!(
                "unrecognized workload \"Kind\" {}",
                kind
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::ReplicaSet => "ReplicaSet",
            WorkloadKind::ReplicationController => "ReplicationController",
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::DaemonSet => "DaemonSet",
            WorkloadKind::DeploymentConfig => "DeploymentConfig",
        }
    }

    /// API coordinates used for dynamic access
    pub fn api_resource(self) -> ApiResource {
        let (group, version, plural) = match self {
            WorkloadKind::Deployment => ("apps", "v1", "deployments"),
            WorkloadKind::ReplicaSet => ("apps", "v1", "replicasets"),
            WorkloadKind::ReplicationController => ("", "v1", "replicationcontrollers"),
            WorkloadKind::StatefulSet => ("apps", "v1", "statefulsets"),
            WorkloadKind::DaemonSet => ("apps", "v1", "daemonsets"),
            WorkloadKind::DeploymentConfig => ("apps.openshift.io", "v1", "deploymentconfigs"),
        };
        ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk(group, version, self.as_str()),
            plural,
        )
    }

    /// Whether pods of this kind have a stable per-replica identity
    pub fn needs_pod_ordinal(self) -> bool {
        self == WorkloadKind::StatefulSet
    }

    /// Whether data of this kind is partitioned per node
    pub fn needs_node_name(self) -> bool {
        self == WorkloadKind::DaemonSet
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonicalized workload reference
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadRef {
    pub kind: WorkloadKind,
    pub name: String,
}

impl WorkloadRef {
    pub fn new(kind: WorkloadKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    /// Canonicalize a user-declared reference
    pub fn canonicalize(reference: &LocalTypedReference) -> Result<Self> {
        if reference.name.is_empty() || reference.kind.is_empty() {
            return Err(Error::validation("missing workload name or kind"));
        }
        Ok(Self {
            kind: WorkloadKind::canonicalize(&reference.kind)?,
            name: reference.name.clone(),
        })
    }

    /// Repository host name and path prefix the data of this workload is
    /// stored under.
    pub fn hostname_prefix(&self, pod_name: &str, node_name: &str) -> Result<(String, String)> {
        match self.kind {
            WorkloadKind::Deployment
            | WorkloadKind::ReplicaSet
            | WorkloadKind::ReplicationController
            | WorkloadKind::DeploymentConfig => {
                Ok((self.name.clone(), format!("{}/{}", self.kind, self.name)))
            }
            WorkloadKind::StatefulSet => {
                if pod_name.is_empty() {
                    return Err(Error::validation(format!("missing podName for {}", self.kind)));
                }
                Ok((pod_name.to_string(), format!("{}/{}", self.kind, pod_name)))
            }
            WorkloadKind::DaemonSet => {
                if node_name.is_empty() {
                    return Err(Error::validation(format!("missing nodeName for {}", self.kind)));
                }
                Ok((
                    node_name.to_string(),
                    format!("{}/{}/{}", self.kind, self.name, node_name),
                ))
            }
        }
    }
}

/// Name of the StatefulSet pod with the given ordinal
pub fn statefulset_pod_name(app_name: &str, pod_ordinal: &str) -> Result<String> {
    if app_name.is_empty() || pod_ordinal.is_empty() {
        return Err(Error::validation("missing appName or podOrdinal"));
    }
    Ok(format!("{}-{}", app_name, pod_ordinal))
}

/// A live workload object of any supported kind
#[derive(Clone, Debug)]
pub struct Workload {
    pub kind: WorkloadKind,
    pub object: DynamicObject,
}

impl Workload {
    pub fn new(kind: WorkloadKind, object: DynamicObject) -> Self {
        Self { kind, object }
    }

    pub fn reference(&self) -> WorkloadRef {
        WorkloadRef::new(self.kind, self.object.name_any())
    }

    /// Reference used to attach events to the workload
    pub fn object_ref(&self) -> ObjectReference {
        self.object.object_ref(&self.kind.api_resource())
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        self.object.labels()
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        self.object.annotations()
    }

    pub fn annotations_mut(&mut self) -> &mut BTreeMap<String, String> {
        self.object.annotations_mut()
    }

    /// Decode the pod template spec
    pub fn pod_spec(&self) -> Result<PodSpec> {
        let spec = self
            .object
            .data
            .pointer("/spec/template/spec")
            .cloned()
            .ok_or_else(|| {
                Error::validation(format!(
                    "{} {} has no pod template",
                    self.kind,
                    self.object.name_any()
                ))
            })?;
        Ok(serde_json::from_value(spec)?)
    }

    /// Apply `f` to the pod template spec and write the result back.
    ///
    /// Only the fields the operator owns (containers, init containers,
    /// volumes, image pull secrets) are written back so unknown fields of
    /// newer API versions survive. Returns whether anything changed.
    pub fn mutate_pod_spec<F>(&mut self, f: F) -> Result<bool>
    where
        F: FnOnce(&mut PodSpec) -> Result<()>,
    {
        let before = self.pod_spec()?;
        let mut after = before.clone();
        f(&mut after)?;
        if after == before {
            return Ok(false);
        }

        let kind = self.kind;
        let name = self.object.name_any();
        let target = self
            .object
            .data
            .pointer_mut("/spec/template/spec")
            .and_then(Value::as_object_mut)
            .ok_or_else(|| Error::validation(format!("{} {} has no pod template", kind, name)))?;

        target.insert("containers".to_string(), serde_json::to_value(&after.containers)?);
        put_list(target, "initContainers", &after.init_containers)?;
        put_list(target, "volumes", &after.volumes)?;
        put_list(target, "imagePullSecrets", &after.image_pull_secrets)?;
        Ok(true)
    }
}

fn put_list<T: serde::Serialize>(
    target: &mut serde_json::Map<String, Value>,
    key: &str,
    list: &Option<Vec<T>>,
) -> Result<()> {
    match list {
        Some(items) if !items.is_empty() => {
            target.insert(key.to_string(), serde_json::to_value(items)?);
        }
        _ => {
            target.remove(key);
        }
    }
    Ok(())
}
