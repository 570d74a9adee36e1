//! Workload reconciler
//!
//! Keeps the backup container of a workload in line with the single Restic
//! that selects it. The Restic applied last is recorded on the workload in
//! an annotation, so removal works after the Restic itself is gone.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use crate::adapters::{reasons, ClusterApi, EventPublisher};
use crate::config::OperatorConfig;
use crate::controllers::queue::Reconcile;
use crate::controllers::{split_key, Lister};
use crate::crd::Restic;
use crate::error::{Error, Result};
use crate::metrics;
use crate::resources::{apply_backup, remove_backup, LAST_APPLIED_CONFIGURATION};
use crate::workload::{selector_matches, Workload, WorkloadKind};

use super::rbac::ensure_sidecar_role_binding;
use super::restic::validate;

/// The single valid Restic in `restics` selecting `workload`.
///
/// Invalid Restics select nothing; they are reported on themselves. More
/// than one match is ambiguous and reported as a validation error.
pub fn find_restic(restics: &[Arc<Restic>], workload: &Workload) -> Result<Option<Arc<Restic>>> {
    let mut matched = Vec::new();
    for restic in restics {
        if let Err(e) = validate(restic) {
            debug!(restic = %restic.name_any(), error = %e, "Skipping invalid Restic");
            continue;
        }
        if selector_matches(&restic.spec.selector, workload.labels())? {
            matched.push(Arc::clone(restic));
        }
    }
    match matched.len() {
        0 => Ok(None),
        1 => Ok(matched.pop()),
        _ => {
            let mut names: Vec<_> = matched.iter().map(|r| r.name_any()).collect();
            names.sort();
            Err(Error::validation(format!(
                "{} {} matches multiple Restics: {}",
                workload.kind,
                workload.object.name_any(),
                names.join(", ")
            )))
        }
    }
}

/// Restic recorded in the last-applied annotation of `workload`
pub fn applied_restic(workload: &Workload) -> Result<Option<Restic>> {
    match workload.annotations().get(LAST_APPLIED_CONFIGURATION) {
        Some(raw) if !raw.is_empty() => Ok(Some(serde_json::from_str(raw)?)),
        _ => Ok(None),
    }
}

/// Name of the Restic recorded on `workload`; unreadable records count as none
pub fn applied_restic_name(workload: &Workload) -> Option<String> {
    match applied_restic(workload) {
        Ok(restic) => restic.map(|r| r.name_any()),
        Err(e) => {
            warn!(workload = %workload.object.name_any(), error = %e, "Unreadable last-applied annotation");
            None
        }
    }
}

/// Annotation value recording `restic`: name, namespace and spec only
pub fn last_applied_value(restic: &Restic) -> Result<String> {
    let minimal = Restic {
        metadata: ObjectMeta {
            name: restic.metadata.name.clone(),
            namespace: restic.metadata.namespace.clone(),
            annotations: restic.metadata.annotations.clone().filter(|a| !a.is_empty()),
            ..Default::default()
        },
        spec: restic.spec.clone(),
    };
    Ok(serde_json::to_string(&minimal)?)
}

/// Injects and removes backup containers for one workload kind
pub struct WorkloadReconciler {
    kind: WorkloadKind,
    restics: Arc<dyn Lister<Restic>>,
    cluster: Arc<dyn ClusterApi>,
    events: Arc<dyn EventPublisher>,
    config: Arc<OperatorConfig>,
}

impl WorkloadReconciler {
    pub fn new(
        kind: WorkloadKind,
        restics: Arc<dyn Lister<Restic>>,
        cluster: Arc<dyn ClusterApi>,
        events: Arc<dyn EventPublisher>,
        config: Arc<OperatorConfig>,
    ) -> Self {
        Self {
            kind,
            restics,
            cluster,
            events,
            config,
        }
    }

    /// Bring `workload` in line with the Restic selecting it.
    ///
    /// Writes only when the pod template or the annotation change.
    pub async fn sync(&self, mut workload: Workload) -> Result<()> {
        let namespace = workload.object.namespace().unwrap_or_default();
        let name = workload.object.name_any();
        let reference = workload.reference();

        let restics = self.restics.list(&namespace);
        let restic = match find_restic(&restics, &workload) {
            Ok(r) => r,
            Err(e) => {
                warn!(kind = %self.kind, name = %name, error = %e, "Ambiguous Restic selection");
                self.events
                    .warning(&workload.object_ref(), reasons::MULTIPLE_RESTICS_MATCHED, e.to_string())
                    .await;
                return Err(e);
            }
        };
        let old = applied_restic(&workload)?;

        let action = match restic.as_deref() {
            Some(restic) => {
                let config = self.config.as_ref();
                let mut changed = workload.mutate_pod_spec(|pod| {
                    apply_backup(pod, restic, old.as_ref(), &reference, config);
                    Ok(())
                })?;
                let value = last_applied_value(restic)?;
                if workload.annotations().get(LAST_APPLIED_CONFIGURATION) != Some(&value) {
                    workload
                        .annotations_mut()
                        .insert(LAST_APPLIED_CONFIGURATION.to_string(), value);
                    changed = true;
                }
                changed.then_some("inject")
            }
            None => {
                let mut changed = workload.mutate_pod_spec(|pod| {
                    remove_backup(pod, old.as_ref());
                    Ok(())
                })?;
                if workload
                    .annotations_mut()
                    .remove(LAST_APPLIED_CONFIGURATION)
                    .is_some()
                {
                    changed = true;
                }
                changed.then_some("remove")
            }
        };

        let Some(action) = action else {
            debug!(kind = %self.kind, name = %name, "Workload up to date");
            return Ok(());
        };

        self.cluster.replace_workload(&workload).await?;
        metrics::WORKLOAD_MUTATIONS
            .with_label_values(&[self.kind.as_str(), action])
            .inc();

        match restic.as_deref() {
            Some(restic) => {
                info!(kind = %self.kind, name = %name, restic = %restic.name_any(), "Injected backup container");
                self.events
                    .normal(
                        &workload.object_ref(),
                        reasons::SIDECAR_INJECTED,
                        format!("Backup container injected for Restic {}", restic.name_any()),
                    )
                    .await;
                if self.config.enable_rbac {
                    let account = workload
                        .pod_spec()?
                        .service_account_name
                        .filter(|s| !s.is_empty())
                        .unwrap_or_else(|| "default".to_string());
                    ensure_sidecar_role_binding(self.cluster.as_ref(), &reference, &namespace, &account)
                        .await?;
                }
            }
            None => {
                info!(kind = %self.kind, name = %name, "Removed backup container");
                self.events
                    .normal(
                        &workload.object_ref(),
                        reasons::SIDECAR_REMOVED,
                        "Backup container removed".to_string(),
                    )
                    .await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Reconcile for WorkloadReconciler {
    #[instrument(skip(self))]
    async fn reconcile(&self, key: &str) -> Result<()> {
        let (namespace, name) = split_key(key)?;
        match self.cluster.get_workload(self.kind, namespace, name).await? {
            Some(workload) => self.sync(workload).await,
            None => {
                debug!(key, "Workload does not exist anymore");
                Ok(())
            }
        }
    }
}
