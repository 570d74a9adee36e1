//! Restic reconciler
//!
//! A Restic is never acted on directly. A change to it is fanned out to the
//! workload queues, whose reconciler injects or removes the backup container.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::adapters::{reasons, ClusterApi, EventPublisher};
use crate::controllers::queue::{Reconcile, WorkQueue};
use crate::controllers::{object_key, split_key, Lister};
use crate::crd::{BackendKind, BackupType, Restic};
use crate::error::{is_not_found, Error, Result};
use crate::resources::RESERVED_VOLUME_NAMES;
use crate::workload::{selector_matches, validate_selector, Workload, WorkloadKind};

use super::workload::applied_restic_name;

/// Queues of the workload controllers, by kind
pub type WorkloadQueues = BTreeMap<WorkloadKind, Arc<WorkQueue>>;

/// Validate the Restic spec
pub fn validate(restic: &Restic) -> Result<()> {
    let spec = &restic.spec;

    if let BackendKind::Local(local) = spec.backend.resolve()? {
        if !local.has_source() {
            return Err(Error::validation("local backend declares no volume source"));
        }
        if local.mount_path.is_empty() {
            return Err(Error::validation("missing mountPath for local backend"));
        }
    }

    validate_selector(&spec.selector)?;

    if spec.file_groups.is_empty() {
        return Err(Error::validation("missing fileGroups"));
    }
    for group in &spec.file_groups {
        if group.path.is_empty() {
            return Err(Error::validation("missing path in fileGroup"));
        }
        if let Some(policy) = group.retention_policy_name.as_deref() {
            if !spec.retention_policies.iter().any(|p| p.name == policy) {
                return Err(Error::validation(format!(
                    "retention policy {:?} of path {} is not declared",
                    policy, group.path
                )));
            }
        }
    }

    if spec.backup_type == BackupType::Online {
        validate_schedule(&spec.schedule)?;
    }

    if let Some(mount) = spec
        .volume_mounts
        .iter()
        .find(|m| RESERVED_VOLUME_NAMES.contains(&m.name.as_str()))
    {
        return Err(Error::validation(format!(
            "volume mount name {:?} is reserved",
            mount.name
        )));
    }

    Ok(())
}

/// Accept standard 5-field cron expressions, ones with seconds, and
/// `@every <interval>` such as `@every 1h30m`
fn validate_schedule(schedule: &str) -> Result<()> {
    let schedule = schedule.trim();
    if schedule.is_empty() {
        return Err(Error::validation("missing schedule"));
    }
    if let Some(interval) = schedule.strip_prefix("@every") {
        return if is_interval(interval.trim()) {
            Ok(())
        } else {
            Err(Error::validation(format!("invalid schedule {:?}: bad interval", schedule)))
        };
    }
    let expr = if schedule.split_whitespace().count() == 5 {
        format!("0 {}", schedule)
    } else {
        schedule.to_string()
    };
    cron::Schedule::from_str(&expr)
        .map(|_| ())
        .map_err(|e| Error::validation(format!("invalid schedule {:?}: {}", schedule, e)))
}

/// Interval made of `<number><unit>` pairs, units h, m, s or ms
fn is_interval(interval: &str) -> bool {
    let mut rest = interval;
    if rest.is_empty() {
        return false;
    }
    while !rest.is_empty() {
        let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        if digits == 0 {
            return false;
        }
        rest = &rest[digits..];
        rest = match ["ms", "h", "m", "s"].iter().find(|u| rest.starts_with(*u)) {
            Some(unit) => &rest[unit.len()..],
            None => return false,
        };
    }
    true
}

/// Fans Restic changes out to the workloads they affect
pub struct ResticReconciler {
    lister: Arc<dyn Lister<Restic>>,
    cluster: Arc<dyn ClusterApi>,
    events: Arc<dyn EventPublisher>,
    queues: Arc<WorkloadQueues>,
}

impl ResticReconciler {
    pub fn new(
        lister: Arc<dyn Lister<Restic>>,
        cluster: Arc<dyn ClusterApi>,
        events: Arc<dyn EventPublisher>,
        queues: Arc<WorkloadQueues>,
    ) -> Self {
        Self {
            lister,
            cluster,
            events,
            queues,
        }
    }

    /// Workloads of `kind` that `restic` selects or that still carry it.
    ///
    /// `restic` is `None` once the Restic is deleted; only workloads that
    /// carry it are affected then.
    async fn affected(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        restic: Option<&Restic>,
    ) -> Result<Vec<Workload>> {
        let workloads = match self.cluster.list_workloads(kind, namespace).await {
            Ok(w) => w,
            Err(Error::Kube(e)) if is_not_found(&e) => {
                debug!(kind = %kind, "Workload API not served, skipping");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let mut affected = Vec::new();
        for workload in workloads {
            let selected = match restic {
                Some(r) => selector_matches(&r.spec.selector, workload.labels())?,
                None => false,
            };
            if selected || applied_restic_name(&workload).as_deref() == Some(name) {
                affected.push(workload);
            }
        }
        Ok(affected)
    }
}

#[async_trait]
impl Reconcile for ResticReconciler {
    #[instrument(skip(self))]
    async fn reconcile(&self, key: &str) -> Result<()> {
        let (namespace, name) = split_key(key)?;
        let restic = self.lister.get(namespace, name);

        match restic.as_deref() {
            Some(r) => {
                if let Err(e) = validate(r) {
                    warn!(key, error = %e, "Restic is invalid");
                    self.events
                        .warning(&r.object_ref(&()), reasons::INVALID_RESTIC, format!("Reason: {}", e))
                        .await;
                    return Err(e);
                }
            }
            None => debug!(key, "Restic deleted, releasing its workloads"),
        }

        let mut queued = 0;
        for (kind, queue) in self.queues.iter() {
            for workload in self.affected(*kind, namespace, name, restic.as_deref()).await? {
                debug!(kind = %kind, workload = %workload.object.name_any(), "Queueing workload");
                queue.add(object_key(&workload.object));
                queued += 1;
            }
        }
        info!(key, workloads = queued, "Fanned out Restic change");
        Ok(())
    }
}
