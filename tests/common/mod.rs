//! In-memory collaborators shared by the integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ObjectReference, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::DynamicObject;
use kube::core::ErrorResponse;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use serde_json::json;

use stash_operator::adapters::{Applied, ClusterApi, EventPublisher};
use stash_operator::controllers::Lister;
use stash_operator::crd::{Recovery, RecoveryStatus, Restic};
use stash_operator::restic::DataTransfer;
use stash_operator::workload::{Workload, WorkloadKind};
use stash_operator::{Error, Result};

pub type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn meta_key<K: Resource>(obj: &K) -> Key {
    key(&obj.namespace().unwrap_or_default(), &obj.name_any())
}

pub fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("injected {}", reason),
        reason: reason.to_string(),
        code,
    }))
}

#[derive(Default)]
pub struct State {
    pub recoveries: BTreeMap<Key, Recovery>,
    pub restics: BTreeMap<Key, Restic>,
    pub secrets: BTreeMap<Key, Secret>,
    pub jobs: BTreeMap<Key, Job>,
    pub workloads: BTreeMap<(WorkloadKind, String, String), DynamicObject>,
    pub service_accounts: BTreeMap<Key, ServiceAccount>,
    pub roles: BTreeMap<Key, Role>,
    pub role_bindings: BTreeMap<Key, RoleBinding>,
    pub cluster_roles: BTreeMap<String, ClusterRole>,
    /// Every status written, in order
    pub status_writes: Vec<RecoveryStatus>,
    /// Number of workload replace calls
    pub workload_writes: usize,
    /// Kinds whose API is not served
    pub unserved: HashSet<WorkloadKind>,
    pub fail_job_create: bool,
    pub fail_rbac: bool,
    pub fail_status_patch: bool,
}

/// [`ClusterApi`] over in-memory maps
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn add_recovery(&self, recovery: Recovery) {
        self.state().recoveries.insert(meta_key(&recovery), recovery);
    }

    pub fn recovery(&self, namespace: &str, name: &str) -> Recovery {
        self.state().recoveries[&key(namespace, name)].clone()
    }

    pub fn add_restic(&self, restic: Restic) {
        self.state().restics.insert(meta_key(&restic), restic);
    }

    pub fn add_secret(&self, namespace: &str, name: &str, data: &[(&str, &str)]) {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        };
        self.state().secrets.insert(key(namespace, name), secret);
    }

    pub fn add_workload(&self, kind: WorkloadKind, mut object: DynamicObject) {
        object.metadata.resource_version.get_or_insert_with(|| "1".to_string());
        let namespace = object.namespace().unwrap_or_default();
        self.state()
            .workloads
            .insert((kind, namespace, object.name_any()), object);
    }

    pub fn workload(&self, kind: WorkloadKind, namespace: &str, name: &str) -> Workload {
        let object = self.state().workloads[&(kind, namespace.to_string(), name.to_string())].clone();
        Workload::new(kind, object)
    }

    /// Delete everything owned by the object with `uid`, like the garbage
    /// collector does
    pub fn cascade_delete(&self, uid: &str) {
        fn owned<K: Resource>(obj: &K, uid: &str) -> bool {
            obj.owner_references().iter().any(|o| o.uid == uid)
        }
        let mut state = self.state();
        state.jobs.retain(|_, o| !owned(o, uid));
        state.service_accounts.retain(|_, o| !owned(o, uid));
        state.roles.retain(|_, o| !owned(o, uid));
        state.role_bindings.retain(|_, o| !owned(o, uid));
    }
}

fn insert_new<K: Resource + Clone>(map: &mut BTreeMap<Key, K>, obj: &K) -> Applied {
    let key = meta_key(obj);
    if map.contains_key(&key) {
        return Applied::AlreadyExists;
    }
    map.insert(key, obj.clone());
    Applied::Created
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_recovery(&self, namespace: &str, name: &str) -> Result<Option<Recovery>> {
        Ok(self.state().recoveries.get(&key(namespace, name)).cloned())
    }

    async fn patch_recovery_status(
        &self,
        namespace: &str,
        name: &str,
        status: &RecoveryStatus,
    ) -> Result<()> {
        let mut state = self.state();
        if state.fail_status_patch {
            return Err(api_error(503, "ServiceUnavailable"));
        }
        let recovery = state
            .recoveries
            .get_mut(&key(namespace, name))
            .ok_or_else(|| api_error(404, "NotFound"))?;
        recovery.status = Some(status.clone());
        state.status_writes.push(status.clone());
        Ok(())
    }

    async fn get_restic(&self, namespace: &str, name: &str) -> Result<Option<Restic>> {
        Ok(self.state().restics.get(&key(namespace, name)).cloned())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        self.state()
            .secrets
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| Error::SecretNotFound(format!("{}/{}", namespace, name)))
    }

    async fn create_job(&self, job: &Job) -> Result<Applied> {
        let mut state = self.state();
        if state.fail_job_create {
            return Err(api_error(500, "InternalError"));
        }
        Ok(insert_new(&mut state.jobs, job))
    }

    async fn get_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Workload>> {
        Ok(self
            .state()
            .workloads
            .get(&(kind, namespace.to_string(), name.to_string()))
            .map(|o| Workload::new(kind, o.clone())))
    }

    async fn list_workloads(&self, kind: WorkloadKind, namespace: &str) -> Result<Vec<Workload>> {
        let state = self.state();
        if state.unserved.contains(&kind) {
            return Err(api_error(404, "NotFound"));
        }
        Ok(state
            .workloads
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .map(|(_, o)| Workload::new(kind, o.clone()))
            .collect())
    }

    async fn replace_workload(&self, workload: &Workload) -> Result<()> {
        let mut state = self.state();
        let id = (
            workload.kind,
            workload.object.namespace().unwrap_or_default(),
            workload.object.name_any(),
        );
        let stored = state
            .workloads
            .get(&id)
            .ok_or_else(|| api_error(404, "NotFound"))?;
        if stored.metadata.resource_version != workload.object.metadata.resource_version {
            return Err(api_error(409, "Conflict"));
        }
        let next: u64 = stored
            .metadata
            .resource_version
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
            + 1;
        let mut object = workload.object.clone();
        object.metadata.resource_version = Some(next.to_string());
        state.workloads.insert(id, object);
        state.workload_writes += 1;
        Ok(())
    }

    async fn create_service_account(&self, account: &ServiceAccount) -> Result<Applied> {
        let mut state = self.state();
        if state.fail_rbac {
            return Err(api_error(403, "Forbidden"));
        }
        Ok(insert_new(&mut state.service_accounts, account))
    }

    async fn create_role(&self, role: &Role) -> Result<Applied> {
        Ok(insert_new(&mut self.state().roles, role))
    }

    async fn create_role_binding(&self, binding: &RoleBinding) -> Result<Applied> {
        let mut state = self.state();
        if state.fail_rbac {
            return Err(api_error(403, "Forbidden"));
        }
        Ok(insert_new(&mut state.role_bindings, binding))
    }

    async fn apply_cluster_role(&self, role: &ClusterRole) -> Result<()> {
        self.state()
            .cluster_roles
            .insert(role.name_any(), role.clone());
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    pub object: String,
    pub warning: bool,
    pub reason: String,
    pub note: String,
}

/// [`EventPublisher`] that keeps every event
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn all(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.all().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEvents {
    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: Option<String>,
    ) {
        self.events.lock().unwrap().push(RecordedEvent {
            object: reference.name.clone().unwrap_or_default(),
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            note: note.unwrap_or_default(),
        });
    }
}

/// [`Lister`] over a fixed set of objects
pub struct MapLister<K> {
    objects: Mutex<Vec<Arc<K>>>,
}

impl<K: Resource> MapLister<K> {
    pub fn new(objects: Vec<K>) -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(objects.into_iter().map(Arc::new).collect()),
        })
    }

    pub fn set(&self, objects: Vec<K>) {
        *self.objects.lock().unwrap() = objects.into_iter().map(Arc::new).collect();
    }
}

impl<K: Resource + Send + Sync> Lister<K> for MapLister<K> {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .find(|o| o.namespace().as_deref() == Some(namespace) && o.name_any() == name)
            .cloned()
    }

    fn list(&self, namespace: &str) -> Vec<Arc<K>> {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .filter(|o| o.namespace().as_deref() == Some(namespace))
            .cloned()
            .collect()
    }
}

/// [`DataTransfer`] that fails for chosen paths and records every call
#[derive(Default)]
pub struct FakeTransfer {
    pub failing: BTreeSet<String>,
    pub fail_check: bool,
    calls: Mutex<Vec<(String, String)>>,
}

impl FakeTransfer {
    pub fn failing(paths: &[&str]) -> Self {
        Self {
            failing: paths.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn failing_check() -> Self {
        Self {
            fail_check: true,
            ..Default::default()
        }
    }

    /// `(path, host)` of every restore, in order
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DataTransfer for FakeTransfer {
    async fn restore(&self, path: &str, host: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((path.to_string(), host.to_string()));
        if self.failing.contains(path) {
            return Err(Error::data_transfer(format!(
                "restic restore exited with code 1 (fatal error): no snapshot for {}",
                path
            )));
        }
        Ok(())
    }

    async fn check(&self) -> Result<()> {
        if self.fail_check {
            return Err(Error::data_transfer("restic check exited with code 1 (fatal error)"));
        }
        Ok(())
    }
}

/// Deployment `name` with one `app` container and a `data` volume
pub fn deployment(name: &str, labels: serde_json::Value) -> DynamicObject {
    let ar = WorkloadKind::Deployment.api_resource();
    let mut object = DynamicObject::new(name, &ar).within("default").data(json!({
        "spec": {
            "replicas": 1,
            "template": {
                "metadata": { "labels": labels.clone() },
                "spec": {
                    "containers": [{ "name": "app", "image": "nginx:1.25" }],
                    "volumes": [{ "name": "data", "emptyDir": {} }]
                }
            }
        }
    }));
    object.metadata.labels = serde_json::from_value(labels).unwrap();
    object
}

pub fn metadata(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some("default".to_string()),
        uid: Some(format!("uid-{}", name)),
        generation: Some(1),
        ..Default::default()
    }
}

/// Online Restic `name` selecting `app=<app>`, backing up to S3
pub fn restic(name: &str, app: &str) -> Restic {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use stash_operator::crd::{Backend, FileGroup, ResticSpec, S3Spec};

    Restic {
        metadata: metadata(name),
        spec: ResticSpec {
            selector: LabelSelector {
                match_labels: Some([("app".to_string(), app.to_string())].into()),
                match_expressions: None,
            },
            file_groups: vec![FileGroup {
                path: "/source/data".to_string(),
                ..Default::default()
            }],
            backend: Backend {
                storage_secret_name: "stash-demo".to_string(),
                s3: Some(S3Spec {
                    endpoint: "s3.amazonaws.com".to_string(),
                    bucket: "stash-qa".to_string(),
                    prefix: Some("demo".to_string()),
                }),
                ..Default::default()
            },
            schedule: "0 2 * * *".to_string(),
            ..Default::default()
        },
    }
}

/// Pending Recovery `name` of Deployment `web` restoring `paths`
pub fn recovery(name: &str, paths: &[&str]) -> Recovery {
    use k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource;
    use stash_operator::crd::{LocalSpec, LocalTypedReference, RecoverySpec};

    Recovery {
        metadata: metadata(name),
        spec: RecoverySpec {
            workload: LocalTypedReference {
                kind: "Deployment".to_string(),
                name: "web".to_string(),
            },
            backend: restic("nightly", "web").spec.backend,
            paths: paths.iter().map(|p| p.to_string()).collect(),
            recovered_volumes: vec![LocalSpec {
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: "web-restored".to_string(),
                    ..Default::default()
                }),
                mount_path: "/data".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        },
        status: None,
    }
}
