//! Types shared by the Restic and Recovery resources

use k8s_openapi::api::core::v1::{
    EmptyDirVolumeSource, HostPathVolumeSource, NFSVolumeSource,
    PersistentVolumeClaimVolumeSource, Volume, VolumeMount,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Reference to a workload in the same namespace
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalTypedReference {
    /// Workload kind, e.g. `Deployment` or one of its short forms
    #[serde(default)]
    pub kind: String,

    /// Workload name
    #[serde(default)]
    pub name: String,
}

/// Repository backend. Exactly one storage variant must be set.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Backend {
    /// Secret holding the repository password and provider credentials
    #[serde(default)]
    pub storage_secret_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Spec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcs: Option<GcsSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swift: Option<SwiftSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b2: Option<B2Spec>,
}

/// Resolved view of a [`Backend`]
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BackendKind<'a> {
    /// Host- or volume-backed repository
    Local(&'a LocalSpec),
    /// Object-store repository, authenticated through the storage secret
    Remote {
        store: RemoteStore<'a>,
        secret_name: &'a str,
    },
}

/// Object-store descriptors
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RemoteStore<'a> {
    S3(&'a S3Spec),
    Gcs(&'a GcsSpec),
    Azure(&'a AzureSpec),
    Swift(&'a SwiftSpec),
    B2(&'a B2Spec),
}

impl Backend {
    /// Resolve the populated storage variant.
    ///
    /// Fails when no variant or more than one variant is set, or when the
    /// storage secret is missing.
    pub fn resolve(&self) -> Result<BackendKind<'_>> {
        if self.storage_secret_name.is_empty() {
            return Err(Error::validation("missing backend storageSecretName"));
        }

        let mut found: Vec<BackendKind<'_>> = Vec::with_capacity(1);
        let secret_name = self.storage_secret_name.as_str();
        if let Some(local) = &self.local {
            found.push(BackendKind::Local(local));
        }
        let remotes = [
            self.s3.as_ref().map(RemoteStore::S3),
            self.gcs.as_ref().map(RemoteStore::Gcs),
            self.azure.as_ref().map(RemoteStore::Azure),
            self.swift.as_ref().map(RemoteStore::Swift),
            self.b2.as_ref().map(RemoteStore::B2),
        ];
        found.extend(
            remotes
                .into_iter()
                .flatten()
                .map(|store| BackendKind::Remote { store, secret_name }),
        );

        match found.len() {
            0 => Err(Error::validation("missing backend: one of local, s3, gcs, azure, swift or b2 must be set")),
            1 => Ok(found[0]),
            n => Err(Error::validation(format!(
                "backend must declare exactly one storage, found {}",
                n
            ))),
        }
    }
}

/// Volume-backed storage
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<HostPathVolumeSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<PersistentVolumeClaimVolumeSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nfs: Option<NFSVolumeSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<EmptyDirVolumeSource>,

    /// Path the volume is mounted at
    pub mount_path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
}

impl LocalSpec {
    /// Build the volume and the matching mount under the given name
    pub fn to_volume_and_mount(&self, name: &str) -> (Volume, VolumeMount) {
        let volume = Volume {
            name: name.to_string(),
            host_path: self.host_path.clone(),
            persistent_volume_claim: self.persistent_volume_claim.clone(),
            nfs: self.nfs.clone(),
            empty_dir: self.empty_dir.clone(),
            ..Default::default()
        };
        let mount = VolumeMount {
            name: name.to_string(),
            mount_path: self.mount_path.clone(),
            sub_path: self.sub_path.clone(),
            ..Default::default()
        };
        (volume, mount)
    }

    /// Whether a volume source is declared at all
    pub fn has_source(&self) -> bool {
        self.host_path.is_some()
            || self.persistent_volume_claim.is_some()
            || self.nfs.is_some()
            || self.empty_dir.is_some()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct S3Spec {
    pub endpoint: String,
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GcsSpec {
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AzureSpec {
    pub container: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SwiftSpec {
    pub container: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct B2Spec {
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}
