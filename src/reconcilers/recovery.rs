//! Recovery reconciler
//!
//! Handles the business logic for recovery requests:
//! - Spec validation
//! - Launching the recovery job exactly once
//! - RBAC for the job's service account
//! - Phase updates and events

use std::sync::Arc;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{reasons, Applied, ClusterApi, EventPublisher};
use crate::config::OperatorConfig;
use crate::controllers::queue::Reconcile;
use crate::controllers::{split_key, Lister};
use crate::crd::{Recovery, RecoveryPhase};
use crate::error::{Error, Result};
use crate::metrics;
use crate::recovery::transition;
use crate::resources::{new_recovery_job, recovery_job_name, OPERATION_RECOVERY};
use crate::workload::WorkloadRef;

use super::rbac::{ensure_job_rbac, recovery_job_rules};

/// Validate the Recovery spec
pub fn validate(recovery: &Recovery) -> Result<()> {
    let spec = &recovery.spec;
    let workload = WorkloadRef::canonicalize(&spec.workload)?;

    spec.backend.resolve()?;

    if spec.paths.is_empty() {
        return Err(Error::validation("missing filepaths"));
    }
    if let Some(path) = spec.paths.iter().find(|p| !p.starts_with('/')) {
        return Err(Error::validation(format!("path {:?} is not absolute", path)));
    }

    if spec.recovered_volumes.is_empty() {
        return Err(Error::validation("missing recovery volume"));
    }
    for volume in &spec.recovered_volumes {
        if volume.mount_path.is_empty() {
            return Err(Error::validation("missing mountPath for recovered volume"));
        }
        if !volume.has_source() {
            return Err(Error::validation(format!(
                "recovered volume at {} has no volume source",
                volume.mount_path
            )));
        }
    }

    let has_ordinal = spec.pod_ordinal.as_deref().is_some_and(|o| !o.is_empty());
    let has_node = spec.node_name.as_deref().is_some_and(|n| !n.is_empty());
    let kind = workload.kind;
    if kind.needs_pod_ordinal() != has_ordinal {
        return Err(Error::validation(if has_ordinal {
            format!("should not specify podOrdinal for workload kind {}", kind)
        } else {
            format!("must specify podOrdinal for workload kind {}", kind)
        }));
    }
    if kind.needs_node_name() != has_node {
        return Err(Error::validation(if has_node {
            format!("should not specify nodeName for workload kind {}", kind)
        } else {
            format!("must specify nodeName for workload kind {}", kind)
        }));
    }

    Ok(())
}

/// Launches recovery jobs for queued Recovery keys
pub struct RecoveryReconciler {
    lister: Arc<dyn Lister<Recovery>>,
    cluster: Arc<dyn ClusterApi>,
    events: Arc<dyn EventPublisher>,
    config: Arc<OperatorConfig>,
}

impl RecoveryReconciler {
    pub fn new(
        lister: Arc<dyn Lister<Recovery>>,
        cluster: Arc<dyn ClusterApi>,
        events: Arc<dyn EventPublisher>,
        config: Arc<OperatorConfig>,
    ) -> Self {
        Self {
            lister,
            cluster,
            events,
            config,
        }
    }

    /// Create the recovery job unless the Recovery is past Pending.
    ///
    /// The job name is derived from the Recovery name, so a job that
    /// already exists is the one an earlier attempt created.
    #[instrument(skip(self, recovery), fields(name = %recovery.name_any(), namespace = %recovery.namespace().unwrap_or_default()))]
    pub async fn launch(&self, recovery: &Recovery) -> Result<()> {
        let phase = recovery.phase();
        if phase != RecoveryPhase::Pending {
            debug!(phase = %phase, "Recovery already handled, skipping");
            return Ok(());
        }

        let name = recovery.name_any();
        let namespace = recovery.namespace().unwrap_or_default();
        let job = new_recovery_job(recovery, &self.config);
        let job_name = recovery_job_name(&name);

        let created = match self.cluster.create_job(&job).await {
            Ok(Applied::Created) => {
                metrics::JOBS_CREATED
                    .with_label_values(&[OPERATION_RECOVERY])
                    .inc();
                true
            }
            Ok(Applied::AlreadyExists) => {
                info!(job = %job_name, "Recovery job already exists");
                false
            }
            Err(e) => {
                error!(job = %job_name, error = %e, "Failed to create recovery job");
                self.fail(recovery, reasons::JOB_FAILED, format!("Failed to create job {}: {}", job_name, e))
                    .await?;
                return Err(e);
            }
        };

        // an existing job may have been left before its RBAC was provisioned
        if self.config.enable_rbac {
            let rules = recovery_job_rules(&name, &recovery.spec.backend.storage_secret_name);
            let owner = recovery.controller_owner_ref(&());
            if let Err(e) =
                ensure_job_rbac(self.cluster.as_ref(), &job_name, &namespace, owner.as_ref(), rules).await
            {
                error!(job = %job_name, error = %e, "Failed to provision RBAC for recovery job");
                self.fail(recovery, reasons::RBAC_FAILED, e.to_string()).await?;
                return Err(e);
            }
        }

        if !created {
            return self.mark_running_if_pending(&namespace, &name, &job_name).await;
        }

        info!(job = %job_name, "Recovery job created");
        self.events
            .normal(
                &recovery.object_ref(&()),
                reasons::JOB_CREATED,
                format!("Recovery job created: {}", job_name),
            )
            .await;
        self.set_phase(recovery, RecoveryPhase::Running, format!("Recovery job {} created", job_name))
            .await
    }

    /// The cached object may be stale, so the phase is read live
    async fn mark_running_if_pending(&self, namespace: &str, name: &str, job_name: &str) -> Result<()> {
        let Some(live) = self.cluster.get_recovery(namespace, name).await? else {
            return Ok(());
        };
        if live.phase() != RecoveryPhase::Pending {
            return Ok(());
        }
        let message = format!("Recovery job {} exists", job_name);
        self.events
            .normal(&live.object_ref(&()), reasons::JOB_CREATED, message.clone())
            .await;
        self.set_phase(&live, RecoveryPhase::Running, message).await
    }

    async fn set_phase(&self, recovery: &Recovery, phase: RecoveryPhase, message: String) -> Result<()> {
        let status = transition(
            recovery.status.as_ref(),
            phase,
            message,
            recovery.metadata.generation,
        )?;
        self.cluster
            .patch_recovery_status(
                &recovery.namespace().unwrap_or_default(),
                &recovery.name_any(),
                &status,
            )
            .await
    }

    async fn fail(&self, recovery: &Recovery, reason: &str, message: String) -> Result<()> {
        self.events
            .warning(&recovery.object_ref(&()), reason, message.clone())
            .await;
        self.set_phase(recovery, RecoveryPhase::Failed, message).await
    }
}

#[async_trait]
impl Reconcile for RecoveryReconciler {
    async fn reconcile(&self, key: &str) -> Result<()> {
        let (namespace, name) = split_key(key)?;
        let Some(recovery) = self.lister.get(namespace, name) else {
            debug!(key, "Recovery does not exist anymore");
            return Ok(());
        };

        if let Err(e) = validate(&recovery) {
            warn!(key, error = %e, "Recovery is invalid");
            self.events
                .warning(&recovery.object_ref(&()), reasons::INVALID_RECOVERY, format!("Reason: {}", e))
                .await;
            return Err(e);
        }

        self.launch(&recovery).await
    }
}
