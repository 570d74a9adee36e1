//! Commands run inside launched jobs: `recover` and `check`
//!
//! Both report their outcome on the triggering object (status and events)
//! rather than through the exit code, so a failed restore does not make the
//! job controller retry it.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::core::v1::Secret;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{reasons, ClusterApi, EventPublisher};
use crate::crd::{Backend, Recovery, RecoveryPhase, RecoveryStatus};
use crate::error::{Error, Result};
use crate::metrics;
use crate::reconcilers::recovery::validate;
use crate::recovery::{transition, RecoveryTracker};
use crate::restic::DataTransfer;
use crate::workload::{statefulset_pod_name, WorkloadRef};

/// Repository host name and smart prefix a Recovery restores from
pub fn resolve_target(recovery: &Recovery) -> Result<(String, String)> {
    let spec = &recovery.spec;
    let workload = WorkloadRef::canonicalize(&spec.workload)?;
    let pod_name = match statefulset_pod_name(
        &spec.workload.name,
        spec.pod_ordinal.as_deref().unwrap_or_default(),
    ) {
        Ok(pod) => pod,
        Err(e) => {
            // only StatefulSets have ordinal pod names
            debug!(kind = %workload.kind, reason = %e, "No ordinal pod name, using empty pod name");
            String::new()
        }
    };
    workload.hostname_prefix(&pod_name, spec.node_name.as_deref().unwrap_or_default())
}

/// Runs the in-pod commands against the cluster
pub struct JobRunner {
    cluster: Arc<dyn ClusterApi>,
    events: Arc<dyn EventPublisher>,
}

impl JobRunner {
    pub fn new(cluster: Arc<dyn ClusterApi>, events: Arc<dyn EventPublisher>) -> Self {
        Self { cluster, events }
    }

    /// Restore every path of the Recovery `namespace/name`.
    ///
    /// `connect` opens the data-transfer tool for the backend, the storage
    /// secret and the smart prefix of the target. Returns the phase the
    /// Recovery ended in; a Recovery that already finished is left alone.
    #[instrument(skip(self, connect))]
    pub async fn recover<C, Fut, T>(&self, namespace: &str, name: &str, connect: C) -> Result<RecoveryPhase>
    where
        C: FnOnce(Backend, Secret, String) -> Fut,
        Fut: Future<Output = Result<T>>,
        T: DataTransfer,
    {
        let recovery = self
            .cluster
            .get_recovery(namespace, name)
            .await?
            .ok_or_else(|| Error::validation(format!("recovery {}/{} not found", namespace, name)))?;

        let phase = recovery.phase();
        if phase.is_terminal() {
            info!(phase = %phase, "Recovery already finished");
            return Ok(phase);
        }

        if let Err(e) = validate(&recovery) {
            error!(error = %e, "Failed to validate recovery");
            return self
                .fail(&recovery, format!("Failed to validate recovery {}, reason: {}", name, e))
                .await;
        }

        let prepared = async {
            let (host, prefix) = resolve_target(&recovery)?;
            let secret = self
                .cluster
                .get_secret(namespace, &recovery.spec.backend.storage_secret_name)
                .await?;
            let transfer = connect(recovery.spec.backend.clone(), secret, prefix).await?;
            Ok::<_, Error>((host, transfer))
        };
        match prepared.await {
            Ok((host, transfer)) => self.restore_paths(&recovery, &transfer, &host).await,
            Err(e) => {
                error!(error = %e, "Failed to prepare recovery");
                self.fail(&recovery, format!("Failed to complete recovery {}, reason: {}", name, e))
                    .await
            }
        }
    }

    /// Restore the paths one after another.
    ///
    /// A failed path does not stop the others. Stats are written after every
    /// path so progress is visible while the job runs.
    pub async fn restore_paths(
        &self,
        recovery: &Recovery,
        transfer: &dyn DataTransfer,
        host: &str,
    ) -> Result<RecoveryPhase> {
        let namespace = recovery.namespace().unwrap_or_default();
        let name = recovery.name_any();
        let mut status = recovery.status.clone().unwrap_or_default();
        let mut tracker = RecoveryTracker::new(recovery.spec.paths.clone(), status.stats.clone());

        for path in &recovery.spec.paths {
            info!(path = %path, host = %host, "Restoring path");
            let started = Instant::now();
            let result = transfer.restore(path, host).await;
            let elapsed = started.elapsed();

            let entry = tracker.record(path, elapsed, result.is_ok());
            metrics::RECOVERY_PATHS
                .with_label_values(&[entry.phase.as_str()])
                .inc();
            metrics::RECOVERY_PATH_DURATION
                .with_label_values(&[entry.phase.as_str()])
                .observe(elapsed.as_secs_f64());

            if let Err(e) = result {
                warn!(path = %path, error = %e, "Failed to restore path");
                self.events
                    .warning(
                        &recovery.object_ref(&()),
                        reasons::FAILED_TO_RECOVER,
                        format!("failed to recover FileGroup {}, reason: {}", path, e),
                    )
                    .await;
            }

            status.stats = tracker.stats().to_vec();
            if let Err(e) = self.cluster.patch_recovery_status(&namespace, &name, &status).await {
                warn!(path = %path, error = %e, "Failed to record path stats");
            }
        }

        let phase = tracker.phase();
        let failed = tracker.failed_paths();
        let message = if failed.is_empty() {
            format!("Recovery {} succeeded", name)
        } else {
            format!(
                "Failed to complete recovery {}, reason: failed paths: {}",
                name,
                failed.join(", ")
            )
        };
        let status = transition(Some(&status), phase, message.clone(), recovery.metadata.generation)?;
        self.cluster
            .patch_recovery_status(&namespace, &name, &status)
            .await?;

        if phase == RecoveryPhase::Succeeded {
            info!("{}", message);
            self.events
                .normal(&recovery.object_ref(&()), reasons::SUCCESSFUL_RECOVERY, message)
                .await;
        } else {
            error!("{}", message);
            self.events
                .warning(&recovery.object_ref(&()), reasons::FAILED_TO_RECOVER, message)
                .await;
        }
        Ok(phase)
    }

    async fn fail(&self, recovery: &Recovery, message: String) -> Result<RecoveryPhase> {
        self.events
            .warning(&recovery.object_ref(&()), reasons::FAILED_TO_RECOVER, message.clone())
            .await;
        let status: RecoveryStatus = transition(
            recovery.status.as_ref(),
            RecoveryPhase::Failed,
            message,
            recovery.metadata.generation,
        )?;
        self.cluster
            .patch_recovery_status(
                &recovery.namespace().unwrap_or_default(),
                &recovery.name_any(),
                &status,
            )
            .await?;
        Ok(RecoveryPhase::Failed)
    }

    /// Verify the repository of the Restic `namespace/name` under
    /// `smart_prefix`. The outcome is reported as an event on the Restic.
    #[instrument(skip(self, connect))]
    pub async fn check<C, Fut, T>(
        &self,
        namespace: &str,
        name: &str,
        smart_prefix: &str,
        connect: C,
    ) -> Result<()>
    where
        C: FnOnce(Backend, Secret, String) -> Fut,
        Fut: Future<Output = Result<T>>,
        T: DataTransfer,
    {
        let restic = self
            .cluster
            .get_restic(namespace, name)
            .await?
            .ok_or_else(|| Error::validation(format!("restic {}/{} not found", namespace, name)))?;

        let result = async {
            let secret = self
                .cluster
                .get_secret(namespace, &restic.spec.backend.storage_secret_name)
                .await?;
            let transfer = connect(restic.spec.backend.clone(), secret, smart_prefix.to_string()).await?;
            transfer.check().await
        }
        .await;

        match result {
            Ok(()) => {
                info!("Repository check succeeded");
                self.events
                    .normal(
                        &restic.object_ref(&()),
                        reasons::SUCCESSFUL_CHECK,
                        format!("Check successful for prefix {}", smart_prefix),
                    )
                    .await;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Repository check failed");
                self.events
                    .warning(
                        &restic.object_ref(&()),
                        reasons::FAILED_TO_CHECK,
                        format!("Check failed for prefix {}, reason: {}", smart_prefix, e),
                    )
                    .await;
                Err(e)
            }
        }
    }
}
