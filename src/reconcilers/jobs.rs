//! Check job launch

use k8s_openapi::api::batch::v1::Job;
use kube::{Resource, ResourceExt};
use tracing::{error, info};

use crate::adapters::{reasons, Applied, ClusterApi, EventPublisher};
use crate::config::OperatorConfig;
use crate::crd::Restic;
use crate::error::Result;
use crate::metrics;
use crate::resources::{check_job_name, new_check_job, OPERATION_CHECK};

use super::rbac::{check_job_rules, ensure_job_rbac};

/// Launch the repository check of `restic` for one host.
///
/// A job left by an earlier launch counts as launched. Its RBAC objects are
/// still ensured, as that launch may have stopped before creating them.
pub async fn launch_check_job(
    cluster: &dyn ClusterApi,
    events: &dyn EventPublisher,
    config: &OperatorConfig,
    restic: &Restic,
    host_name: &str,
    smart_prefix: &str,
) -> Result<Applied> {
    let name = restic.name_any();
    let namespace = restic.namespace().unwrap_or_default();
    let job: Job = new_check_job(restic, host_name, smart_prefix, config);
    let job_name = check_job_name(&name);

    let applied = match cluster.create_job(&job).await {
        Ok(applied) => applied,
        Err(e) => {
            error!(job = %job_name, error = %e, "Failed to create check job");
            events
                .warning(
                    &restic.object_ref(&()),
                    reasons::JOB_FAILED,
                    format!("Failed to create job {}: {}", job_name, e),
                )
                .await;
            return Err(e);
        }
    };
    if applied == Applied::Created {
        metrics::JOBS_CREATED.with_label_values(&[OPERATION_CHECK]).inc();
    }

    if config.enable_rbac {
        let rules = check_job_rules(&name, &restic.spec.backend.storage_secret_name);
        let owner = restic.controller_owner_ref(&());
        if let Err(e) = ensure_job_rbac(cluster, &job_name, &namespace, owner.as_ref(), rules).await {
            events
                .warning(&restic.object_ref(&()), reasons::RBAC_FAILED, e.to_string())
                .await;
            return Err(e);
        }
    }

    if applied == Applied::AlreadyExists {
        info!(job = %job_name, "Check job already exists");
        return Ok(applied);
    }

    info!(job = %job_name, host = %host_name, "Check job created");
    events
        .normal(
            &restic.object_ref(&()),
            reasons::JOB_CREATED,
            format!("Check job created: {}", job_name),
        )
        .await;
    Ok(applied)
}
