//! Kubernetes Event recording
//!
//! Events are fire-and-forget: a failed publish is logged and never fails
//! the reconcile that emitted it.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Component name shown as the event source
pub const REPORTER: &str = "stash-operator";

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event on the referenced object
    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: Option<String>,
    );

    async fn normal(&self, reference: &ObjectReference, reason: &str, note: String) {
        self.publish(reference, EventType::Normal, reason, Some(note))
            .await
    }

    async fn warning(&self, reference: &ObjectReference, reason: &str, note: String) {
        self.publish(reference, EventType::Warning, reason, Some(note))
            .await
    }
}

/// Production publisher backed by the events API
pub struct KubeEventPublisher {
    client: Client,
    reporter: Reporter,
}

impl KubeEventPublisher {
    pub fn new(client: Client, instance: Option<String>) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: REPORTER.to_string(),
                instance,
            },
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: Option<String>,
    ) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), reference.clone());
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: actions::RECONCILE.to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!(
                reason,
                object = reference.name.as_deref().unwrap_or_default(),
                error = %e,
                "Failed to publish event"
            );
        }
    }
}

/// Event reasons, shown in the REASON column of `kubectl get events`
pub mod reasons {
    pub const INVALID_RESTIC: &str = "InvalidRestic";
    pub const INVALID_RECOVERY: &str = "InvalidRecovery";
    pub const INVALID_WORKLOAD: &str = "InvalidWorkload";
    pub const MULTIPLE_RESTICS_MATCHED: &str = "MultipleResticsMatched";
    pub const JOB_CREATED: &str = "JobCreated";
    pub const JOB_FAILED: &str = "JobFailedToCreate";
    pub const RBAC_FAILED: &str = "RBACFailedToProvision";
    pub const SIDECAR_INJECTED: &str = "SidecarInjected";
    pub const SIDECAR_REMOVED: &str = "SidecarRemoved";
    pub const SUCCESSFUL_RECOVERY: &str = "SuccessfulRecovery";
    pub const FAILED_TO_RECOVER: &str = "FailedToRecover";
    pub const SUCCESSFUL_CHECK: &str = "SuccessfulCheck";
    pub const FAILED_TO_CHECK: &str = "FailedToCheck";
}

pub mod actions {
    pub const RECONCILE: &str = "Reconcile";
}
