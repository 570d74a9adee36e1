//! The data-transfer collaborator: restic, run as a subprocess
//!
//! The repository location is derived from the backend and the smart
//! prefix of the workload replica, credentials come from the storage secret.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use tokio::process::Command;
use tracing::{debug, info};

use crate::adapters::secret_env;
use crate::crd::{Backend, BackendKind, RemoteStore};
use crate::error::{Error, Result};

/// Secret key holding a GCS service account JSON key
pub const GOOGLE_SERVICE_ACCOUNT_JSON_KEY: &str = "GOOGLE_SERVICE_ACCOUNT_JSON_KEY";
pub const RESTIC_REPOSITORY: &str = "RESTIC_REPOSITORY";

/// Per-path operations of the data-transfer tool.
///
/// The tool holds an exclusive lock on the repository, so callers run one
/// operation at a time.
#[async_trait]
pub trait DataTransfer: Send + Sync {
    /// Restore the latest snapshot of `path` taken on `host`
    async fn restore(&self, path: &str, host: &str) -> Result<()>;

    /// Verify the repository
    async fn check(&self) -> Result<()>;
}

/// Repository URL for the backend, with `smart_prefix` appended to the
/// backend's own prefix
pub fn repository(backend: &Backend, smart_prefix: &str) -> Result<String> {
    Ok(match backend.resolve()? {
        BackendKind::Local(local) => {
            let path = join(&[
                local.mount_path.as_str(),
                local.sub_path.as_deref().unwrap_or_default(),
                smart_prefix,
            ]);
            format!("/{}", path)
        }
        BackendKind::Remote { store, .. } => match store {
            RemoteStore::S3(s3) => format!(
                "s3:{}/{}",
                s3.endpoint.trim_end_matches('/'),
                join(&[s3.bucket.as_str(), s3.prefix.as_deref().unwrap_or_default(), smart_prefix])
            ),
            RemoteStore::Gcs(gcs) => format!(
                "gs:{}:/{}",
                gcs.bucket,
                join(&[gcs.prefix.as_deref().unwrap_or_default(), smart_prefix])
            ),
            RemoteStore::Azure(azure) => format!(
                "azure:{}:/{}",
                azure.container,
                join(&[azure.prefix.as_deref().unwrap_or_default(), smart_prefix])
            ),
            RemoteStore::Swift(swift) => format!(
                "swift:{}:/{}",
                swift.container,
                join(&[swift.prefix.as_deref().unwrap_or_default(), smart_prefix])
            ),
            RemoteStore::B2(b2) => format!(
                "b2:{}:{}",
                b2.bucket,
                join(&[b2.prefix.as_deref().unwrap_or_default(), smart_prefix])
            ),
        },
    })
}

fn join(segments: &[&str]) -> String {
    segments
        .iter()
        .map(|s| s.trim_matches('/'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// [`DataTransfer`] driving the `restic` binary
#[derive(Clone, Debug)]
pub struct ResticCli {
    binary: PathBuf,
    scratch_dir: PathBuf,
    env: BTreeMap<String, String>,
}

impl ResticCli {
    /// Prepare the environment for the repository of `backend`.
    ///
    /// Every key of the storage secret is exported. A GCS service account key
    /// is written below `scratch_dir` because restic only reads it from a
    /// file.
    pub async fn setup(
        binary: impl Into<PathBuf>,
        scratch_dir: impl Into<PathBuf>,
        backend: &Backend,
        secret: &Secret,
        smart_prefix: &str,
    ) -> Result<Self> {
        let scratch_dir = scratch_dir.into();
        let mut env = secret_env(secret)?;
        let repository = repository(backend, smart_prefix)?;
        info!(repository = %repository, "Using restic repository");
        env.insert(RESTIC_REPOSITORY.to_string(), repository);

        if let Some(key) = env.remove(GOOGLE_SERVICE_ACCOUNT_JSON_KEY) {
            let path = scratch_dir.join("gcs-sa.json");
            tokio::fs::create_dir_all(&scratch_dir).await?;
            tokio::fs::write(&path, key).await?;
            env.insert(
                "GOOGLE_APPLICATION_CREDENTIALS".to_string(),
                path.to_string_lossy().into_owned(),
            );
        }

        Ok(Self {
            binary: binary.into(),
            scratch_dir,
            env,
        })
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    fn cache_dir(&self) -> PathBuf {
        self.scratch_dir.join("restic-cache")
    }

    async fn run(&self, args: &[&str]) -> Result<()> {
        debug!(binary = %self.binary.display(), ?args, "Running restic");
        let output = Command::new(&self.binary)
            .args(args)
            .arg("--cache-dir")
            .arg(self.cache_dir())
            .envs(&self.env)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                Error::data_transfer(format!("failed to run {}: {}", self.binary.display(), e))
            })?;

        if output.status.success() {
            return Ok(());
        }
        Err(Error::data_transfer(format!(
            "restic {} exited with {}: {}",
            args.first().copied().unwrap_or_default(),
            exit_reason(output.status.code()),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

fn exit_reason(code: Option<i32>) -> String {
    match code {
        Some(1) => "code 1 (fatal error)".to_string(),
        Some(3) => "code 3 (source data could not be read)".to_string(),
        Some(c) => format!("code {}", c),
        None => "no exit code".to_string(),
    }
}

#[async_trait]
impl DataTransfer for ResticCli {
    async fn restore(&self, path: &str, host: &str) -> Result<()> {
        self.run(&[
            "restore", "latest", "--host", host, "--path", path, "--target", "/",
        ])
        .await
    }

    async fn check(&self) -> Result<()> {
        self.run(&["check"]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{AzureSpec, B2Spec, GcsSpec, LocalSpec, S3Spec, SwiftSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;

    fn backend() -> Backend {
        Backend {
            storage_secret_name: "stash-demo".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn local_repository() {
        let b = Backend {
            local: Some(LocalSpec {
                mount_path: "/safe/data".to_string(),
                sub_path: Some("repo".to_string()),
                ..Default::default()
            }),
            ..backend()
        };
        assert_eq!(
            repository(&b, "Deployment/web").unwrap(),
            "/safe/data/repo/Deployment/web"
        );
    }

    #[test]
    fn remote_repositories() {
        let s3 = Backend {
            s3: Some(S3Spec {
                endpoint: "s3.amazonaws.com/".to_string(),
                bucket: "stash-qa".to_string(),
                prefix: Some("demo".to_string()),
            }),
            ..backend()
        };
        assert_eq!(
            repository(&s3, "Deployment/web").unwrap(),
            "s3:s3.amazonaws.com/stash-qa/demo/Deployment/web"
        );

        let gcs = Backend {
            gcs: Some(GcsSpec {
                bucket: "stash-qa".to_string(),
                prefix: None,
            }),
            ..backend()
        };
        assert_eq!(repository(&gcs, "DaemonSet/agent/node-1").unwrap(), "gs:stash-qa:/DaemonSet/agent/node-1");

        let azure = Backend {
            azure: Some(AzureSpec {
                container: "backups".to_string(),
                prefix: Some("/demo/".to_string()),
            }),
            ..backend()
        };
        assert_eq!(repository(&azure, "StatefulSet/db-0").unwrap(), "azure:backups:/demo/StatefulSet/db-0");

        let swift = Backend {
            swift: Some(SwiftSpec {
                container: "backups".to_string(),
                prefix: None,
            }),
            ..backend()
        };
        assert_eq!(repository(&swift, "Deployment/web").unwrap(), "swift:backups:/Deployment/web");

        let b2 = Backend {
            b2: Some(B2Spec {
                bucket: "stash".to_string(),
                prefix: Some("demo".to_string()),
            }),
            ..backend()
        };
        assert_eq!(repository(&b2, "Deployment/web").unwrap(), "b2:stash:demo/Deployment/web");
    }

    #[test]
    fn repository_requires_a_backend() {
        assert!(matches!(repository(&backend(), "x"), Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn setup_writes_gcs_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("stash-demo".to_string()),
                ..Default::default()
            },
            data: Some(
                [
                    ("RESTIC_PASSWORD", "changeit"),
                    ("GOOGLE_PROJECT_ID", "demo"),
                    (GOOGLE_SERVICE_ACCOUNT_JSON_KEY, "{\"type\":\"service_account\"}"),
                ]
                .into_iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
            ),
            ..Default::default()
        };
        let b = Backend {
            gcs: Some(GcsSpec {
                bucket: "stash-qa".to_string(),
                prefix: None,
            }),
            ..backend()
        };

        let cli = ResticCli::setup("restic", dir.path(), &b, &secret, "Deployment/web")
            .await
            .unwrap();

        let env = cli.env();
        assert_eq!(env[RESTIC_REPOSITORY], "gs:stash-qa:/Deployment/web");
        assert_eq!(env["GOOGLE_PROJECT_ID"], "demo");
        assert!(!env.contains_key(GOOGLE_SERVICE_ACCOUNT_JSON_KEY));
        let credentials = &env["GOOGLE_APPLICATION_CREDENTIALS"];
        let written = std::fs::read_to_string(credentials).unwrap();
        assert_eq!(written, "{\"type\":\"service_account\"}");
    }

    #[tokio::test]
    async fn missing_binary_is_data_transfer_error() {
        let dir = tempfile::tempdir().unwrap();
        let cli = ResticCli {
            binary: dir.path().join("no-such-restic"),
            scratch_dir: dir.path().to_path_buf(),
            env: BTreeMap::new(),
        };
        assert!(matches!(cli.check().await, Err(Error::DataTransfer(_))));
    }
}
