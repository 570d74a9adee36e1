//! Workload controllers
//!
//! One watch, queue and worker pool per workload kind. Workers start only
//! once the Restic cache is synced: a workload reconciled against an empty
//! cache would lose its backup container.

use std::sync::Arc;

use kube::api::{DynamicObject, ListParams};
use kube::runtime::reflector::Store;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::admission::WorkloadAdmission;
use super::feed::Feed;
use super::queue::{RetryPolicy, WorkQueue};
use super::{resync, Context};
use crate::crd::Restic;
use crate::reconcilers::{WorkloadQueues, WorkloadReconciler};
use crate::workload::WorkloadKind;

/// Workload kinds the API server serves; DeploymentConfig only exists on
/// OpenShift
pub(super) async fn served_kinds(client: &Client) -> Vec<WorkloadKind> {
    let mut kinds = Vec::new();
    for kind in WorkloadKind::ALL {
        let api: Api<DynamicObject> = Api::all_with(client.clone(), &kind.api_resource());
        match api.list(&ListParams::default().limit(1)).await {
            Ok(_) => kinds.push(kind),
            Err(e) => warn!(kind = %kind, error = %e, "Workload kind not served, not watching it"),
        }
    }
    kinds
}

/// Queue per served kind
pub(super) fn queues(kinds: &[WorkloadKind], policy: RetryPolicy) -> WorkloadQueues {
    kinds
        .iter()
        .map(|kind| (*kind, WorkQueue::new(kind.as_str(), policy)))
        .collect()
}

/// Run the controller of one workload kind until `shutdown` fires
pub(super) async fn run(
    ctx: Arc<Context>,
    kind: WorkloadKind,
    queue: Arc<WorkQueue>,
    restics: Store<Restic>,
    shutdown: CancellationToken,
) {
    info!(kind = %kind, "Starting workload controller");

    let ar = kind.api_resource();
    let api: Api<DynamicObject> = Api::all_with(ctx.client.clone(), &ar);
    let feed = Feed::new_with(
        WorkloadAdmission { kind },
        ar,
        Arc::clone(&queue),
        Arc::clone(&ctx.events),
    );
    let resync = resync(
        feed.store(),
        Arc::clone(&queue),
        ctx.config.resync_period(),
        shutdown.clone(),
    );
    let reconciler = Arc::new(WorkloadReconciler::new(
        kind,
        Arc::new(restics.clone()),
        Arc::clone(&ctx.cluster),
        Arc::clone(&ctx.events),
        Arc::clone(&ctx.config),
    ));

    let workers = async {
        tokio::select! {
            ready = restics.wait_until_ready() => {
                if ready.is_err() {
                    warn!(kind = %kind, "Restic cache gone before sync");
                    return;
                }
            }
            _ = shutdown.cancelled() => return,
        }
        Arc::clone(&queue)
            .run(ctx.config.num_threads, reconciler)
            .await;
    };
    let stop = async {
        shutdown.cancelled().await;
        queue.shut_down();
    };

    tokio::join!(feed.run(api, shutdown.clone()), resync, workers, stop);
    info!(kind = %kind, "Workload controller stopped");
}
