//! RBAC provisioning for launched jobs and injected sidecars
//!
//! Job service accounts are owned by the object that triggered the job, so
//! they go away together with it.

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use tracing::{debug, info};

use crate::adapters::{Applied, ClusterApi};
use crate::crd::GROUP;
use crate::error::{Error, Result};
use crate::resources::{APP_LABEL_STASH, LABEL_APP};
use crate::workload::WorkloadRef;

/// Cluster role bound to the service account of every mutated workload
pub const SIDECAR_CLUSTER_ROLE: &str = "stash-sidecar";

const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

fn rule(api_group: &str, resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![api_group.to_string()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

fn named_rule(api_group: &str, resource: &str, name: &str, verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        resource_names: Some(vec![name.to_string()]),
        ..rule(api_group, &[resource], verbs)
    }
}

/// Permissions of the `recover` command
pub fn recovery_job_rules(recovery_name: &str, secret_name: &str) -> Vec<PolicyRule> {
    vec![
        named_rule(GROUP, "recoveries", recovery_name, &["get"]),
        named_rule(GROUP, "recoveries/status", recovery_name, &["get", "patch", "update"]),
        named_rule("", "secrets", secret_name, &["get"]),
        rule("", &["events"], &["create", "patch"]),
    ]
}

/// Permissions of the `check` command
pub fn check_job_rules(restic_name: &str, secret_name: &str) -> Vec<PolicyRule> {
    vec![
        named_rule(GROUP, "restics", restic_name, &["get"]),
        named_rule("", "secrets", secret_name, &["get"]),
        rule("", &["events"], &["create", "patch"]),
    ]
}

/// Permissions of the injected backup container
pub fn sidecar_cluster_role() -> ClusterRole {
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(SIDECAR_CLUSTER_ROLE.to_string()),
            labels: Some([(LABEL_APP.to_string(), APP_LABEL_STASH.to_string())].into()),
            ..Default::default()
        },
        rules: Some(vec![
            rule(GROUP, &["restics"], &["get", "list", "watch"]),
            rule(
                "apps",
                &["deployments", "replicasets", "statefulsets", "daemonsets"],
                &["get", "list", "patch"],
            ),
            rule("", &["replicationcontrollers"], &["get", "list", "patch"]),
            rule("apps.openshift.io", &["deploymentconfigs"], &["get", "list", "patch"]),
            rule("", &["secrets"], &["get"]),
            rule("", &["configmaps"], &["get", "create", "update"]),
            rule("", &["events"], &["create", "patch"]),
            // launch-check
            rule("batch", &["jobs"], &["get", "create"]),
            rule("", &["serviceaccounts"], &["create"]),
            rule(RBAC_GROUP, &["roles", "rolebindings"], &["create"]),
        ]),
        ..Default::default()
    }
}

fn meta(name: &str, namespace: &str, owner: Option<&OwnerReference>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some([(LABEL_APP.to_string(), APP_LABEL_STASH.to_string())].into()),
        owner_references: owner.map(|o| vec![o.clone()]),
        ..Default::default()
    }
}

fn service_account_subject(name: &str, namespace: &str) -> Subject {
    Subject {
        kind: "ServiceAccount".to_string(),
        name: name.to_string(),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// ServiceAccount, Role and RoleBinding all named after the job
pub fn job_rbac_objects(
    job_name: &str,
    namespace: &str,
    owner: Option<&OwnerReference>,
    rules: Vec<PolicyRule>,
) -> (ServiceAccount, Role, RoleBinding) {
    let account = ServiceAccount {
        metadata: meta(job_name, namespace, owner),
        ..Default::default()
    };
    let role = Role {
        metadata: meta(job_name, namespace, owner),
        rules: Some(rules),
    };
    let binding = RoleBinding {
        metadata: meta(job_name, namespace, owner),
        role_ref: RoleRef {
            api_group: RBAC_GROUP.to_string(),
            kind: "Role".to_string(),
            name: job_name.to_string(),
        },
        subjects: Some(vec![service_account_subject(job_name, namespace)]),
    };
    (account, role, binding)
}

/// Provision the service account a job runs as.
///
/// Objects that already exist count as provisioned. Any other failure is
/// reported as [`Error::Rbac`].
pub async fn ensure_job_rbac(
    cluster: &dyn ClusterApi,
    job_name: &str,
    namespace: &str,
    owner: Option<&OwnerReference>,
    rules: Vec<PolicyRule>,
) -> Result<()> {
    let (account, role, binding) = job_rbac_objects(job_name, namespace, owner, rules);
    let wrap = |what: &str, e: Error| {
        Error::rbac(format!("failed to create {} {}/{}: {}", what, namespace, job_name, e))
    };

    let created = [
        cluster
            .create_service_account(&account)
            .await
            .map_err(|e| wrap("ServiceAccount", e))?,
        cluster.create_role(&role).await.map_err(|e| wrap("Role", e))?,
        cluster
            .create_role_binding(&binding)
            .await
            .map_err(|e| wrap("RoleBinding", e))?,
    ];
    if created.iter().all(|a| *a == Applied::AlreadyExists) {
        debug!(job = %job_name, "Job RBAC already provisioned");
    } else {
        info!(job = %job_name, namespace = %namespace, "Provisioned job RBAC");
    }
    Ok(())
}

pub fn sidecar_role_binding_name(workload: &WorkloadRef) -> String {
    format!(
        "{}-{}-{}",
        SIDECAR_CLUSTER_ROLE,
        workload.kind.as_str().to_lowercase(),
        workload.name
    )
}

/// Bind the workload's service account to the sidecar cluster role
pub async fn ensure_sidecar_role_binding(
    cluster: &dyn ClusterApi,
    workload: &WorkloadRef,
    namespace: &str,
    service_account: &str,
) -> Result<()> {
    let name = sidecar_role_binding_name(workload);
    let binding = RoleBinding {
        metadata: meta(&name, namespace, None),
        role_ref: RoleRef {
            api_group: RBAC_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: SIDECAR_CLUSTER_ROLE.to_string(),
        },
        subjects: Some(vec![service_account_subject(service_account, namespace)]),
    };
    cluster
        .create_role_binding(&binding)
        .await
        .map_err(|e| Error::rbac(format!("failed to create RoleBinding {}/{}: {}", namespace, name, e)))?;
    Ok(())
}
