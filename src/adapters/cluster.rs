//! Cluster API access
//!
//! Every read and write the reconcilers perform goes through [`ClusterApi`],
//! so the reconcilers can be exercised against an in-memory cluster.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, Role, RoleBinding};
use kube::api::{ListParams, Patch, PatchParams, PostParams};
use kube::core::DynamicObject;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::crd::{Recovery, RecoveryStatus, Restic};
use crate::error::{is_already_exists, is_not_found, Error, Result};
use crate::workload::{Workload, WorkloadKind};

/// Field manager used for every write
pub const FIELD_MANAGER: &str = "stash-operator";

/// Outcome of a create call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    Created,
    /// An object with the same name was already there
    AlreadyExists,
}

/// Cluster API collaborator
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_recovery(&self, namespace: &str, name: &str) -> Result<Option<Recovery>>;

    /// Merge-patch the status subresource of a Recovery
    async fn patch_recovery_status(
        &self,
        namespace: &str,
        name: &str,
        status: &RecoveryStatus,
    ) -> Result<()>;

    async fn get_restic(&self, namespace: &str, name: &str) -> Result<Option<Restic>>;

    /// Fails with [`Error::SecretNotFound`] when the secret is absent
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret>;

    async fn create_job(&self, job: &Job) -> Result<Applied>;

    async fn get_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Workload>>;

    async fn list_workloads(&self, kind: WorkloadKind, namespace: &str) -> Result<Vec<Workload>>;

    /// Replace the workload; the carried resource version makes concurrent
    /// writers fail with a conflict instead of overwriting each other.
    async fn replace_workload(&self, workload: &Workload) -> Result<()>;

    async fn create_service_account(&self, account: &ServiceAccount) -> Result<Applied>;

    async fn create_role(&self, role: &Role) -> Result<Applied>;

    async fn create_role_binding(&self, binding: &RoleBinding) -> Result<Applied>;

    /// Server-side apply of a cluster-scoped role
    async fn apply_cluster_role(&self, role: &ClusterRole) -> Result<()>;
}

/// [`ClusterApi`] backed by a live API server
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn workload_api(&self, kind: WorkloadKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &kind.api_resource())
    }
}

async fn get_opt<K>(api: &Api<K>, name: &str) -> Result<Option<K>>
where
    K: Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(e) if is_not_found(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn create<K>(api: &Api<K>, obj: &K) -> Result<Applied>
where
    K: Resource + Clone + DeserializeOwned + Serialize + std::fmt::Debug,
{
    match api.create(&PostParams::default(), obj).await {
        Ok(_) => Ok(Applied::Created),
        Err(e) if is_already_exists(&e) => {
            debug!(name = %obj.name_any(), "Object already exists");
            Ok(Applied::AlreadyExists)
        }
        Err(e) => Err(e.into()),
    }
}

fn namespace_of<K: Resource>(obj: &K) -> Result<String> {
    obj.meta()
        .namespace
        .clone()
        .ok_or_else(|| Error::validation(format!("{} has no namespace", obj.name_any())))
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_recovery(&self, namespace: &str, name: &str) -> Result<Option<Recovery>> {
        get_opt(&Api::<Recovery>::namespaced(self.client.clone(), namespace), name).await
    }

    async fn patch_recovery_status(
        &self,
        namespace: &str,
        name: &str,
        status: &RecoveryStatus,
    ) -> Result<()> {
        let api: Api<Recovery> = Api::namespaced(self.client.clone(), namespace);
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(json!({ "status": status })),
        )
        .await?;
        Ok(())
    }

    async fn get_restic(&self, namespace: &str, name: &str) -> Result<Option<Restic>> {
        get_opt(&Api::<Restic>::namespaced(self.client.clone(), namespace), name).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await.map_err(|e| {
            if is_not_found(&e) {
                Error::SecretNotFound(format!("{}/{}", namespace, name))
            } else {
                Error::Kube(e)
            }
        })
    }

    async fn create_job(&self, job: &Job) -> Result<Applied> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), &namespace_of(job)?);
        create(&api, job).await
    }

    async fn get_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Workload>> {
        let object = get_opt(&self.workload_api(kind, namespace), name).await?;
        Ok(object.map(|o| Workload::new(kind, o)))
    }

    async fn list_workloads(&self, kind: WorkloadKind, namespace: &str) -> Result<Vec<Workload>> {
        let list = self
            .workload_api(kind, namespace)
            .list(&ListParams::default())
            .await?;
        Ok(list.items.into_iter().map(|o| Workload::new(kind, o)).collect())
    }

    async fn replace_workload(&self, workload: &Workload) -> Result<()> {
        let namespace = namespace_of(&workload.object)?;
        self.workload_api(workload.kind, &namespace)
            .replace(&workload.object.name_any(), &PostParams::default(), &workload.object)
            .await?;
        Ok(())
    }

    async fn create_service_account(&self, account: &ServiceAccount) -> Result<Applied> {
        let api: Api<ServiceAccount> =
            Api::namespaced(self.client.clone(), &namespace_of(account)?);
        create(&api, account).await
    }

    async fn create_role(&self, role: &Role) -> Result<Applied> {
        let api: Api<Role> = Api::namespaced(self.client.clone(), &namespace_of(role)?);
        create(&api, role).await
    }

    async fn create_role_binding(&self, binding: &RoleBinding) -> Result<Applied> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), &namespace_of(binding)?);
        create(&api, binding).await
    }

    async fn apply_cluster_role(&self, role: &ClusterRole) -> Result<()> {
        let api: Api<ClusterRole> = Api::all(self.client.clone());
        api.patch(
            &role.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(role),
        )
        .await?;
        Ok(())
    }
}
