//! Recovery controller
//!
//! Watches Recovery resources and launches one recovery job per request.

use std::sync::Arc;

use kube::api::ListParams;
use kube::Api;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::admission::RecoveryAdmission;
use super::feed::Feed;
use super::queue::{RetryPolicy, WorkQueue};
use super::{drive, resync, Context};
use crate::crd::Recovery;
use crate::reconcilers::RecoveryReconciler;

/// Run the Recovery controller until `shutdown` fires
pub async fn run(ctx: Arc<Context>, shutdown: CancellationToken) {
    let api: Api<Recovery> = Api::all(ctx.client.clone());

    // Verify CRD is installed
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("Recovery CRD not installed: {}", e);
        return;
    }

    info!("Starting Recovery controller");

    let queue = WorkQueue::new("Recovery", RetryPolicy::from_config(&ctx.config));
    let feed = Feed::new(RecoveryAdmission, Arc::clone(&queue), Arc::clone(&ctx.events));
    let store = feed.store();
    let reconciler = Arc::new(RecoveryReconciler::new(
        Arc::new(store.clone()),
        Arc::clone(&ctx.cluster),
        Arc::clone(&ctx.events),
        Arc::clone(&ctx.config),
    ));

    let feed = feed.run(api, shutdown.clone());
    let resync = resync(store, Arc::clone(&queue), ctx.config.resync_period(), shutdown.clone());
    let watch = async move {
        tokio::join!(feed, resync);
    };
    drive(
        watch,
        queue,
        ctx.config.num_threads,
        reconciler,
        shutdown,
    )
    .await;
    info!("Recovery controller stopped");
}
