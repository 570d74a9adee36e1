//! Restic controller
//!
//! Watches Restic resources and fans their changes out to the workload
//! controllers, which it runs alongside: both sides share the Restic cache
//! and the workload queues.

use std::sync::Arc;

use futures::future::join_all;
use kube::api::ListParams;
use kube::Api;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::admission::ResticAdmission;
use super::feed::Feed;
use super::queue::{RetryPolicy, WorkQueue};
use super::workload_controller;
use super::{drive, resync, Context};
use crate::crd::Restic;
use crate::reconcilers::ResticReconciler;

/// Run the Restic controller and the workload controllers until `shutdown`
/// fires
pub async fn run(ctx: Arc<Context>, shutdown: CancellationToken) {
    let api: Api<Restic> = Api::all(ctx.client.clone());

    // Verify CRD is installed
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("Restic CRD not installed: {}", e);
        return;
    }

    info!("Starting Restic controller");

    let policy = RetryPolicy::from_config(&ctx.config);
    let kinds = workload_controller::served_kinds(&ctx.client).await;
    let workload_queues = Arc::new(workload_controller::queues(&kinds, policy));

    let queue = WorkQueue::new("Restic", policy);
    let feed = Feed::new(ResticAdmission, Arc::clone(&queue), Arc::clone(&ctx.events));
    let restics = feed.store();
    let reconciler = Arc::new(ResticReconciler::new(
        Arc::new(restics.clone()),
        Arc::clone(&ctx.cluster),
        Arc::clone(&ctx.events),
        Arc::clone(&workload_queues),
    ));

    let workloads = join_all(workload_queues.iter().map(|(kind, queue)| {
        workload_controller::run(
            Arc::clone(&ctx),
            *kind,
            Arc::clone(queue),
            restics.clone(),
            shutdown.clone(),
        )
    }));
    let feed = feed.run(api, shutdown.clone());
    let resync = resync(restics, Arc::clone(&queue), ctx.config.resync_period(), shutdown.clone());
    let watch = async move {
        tokio::join!(feed, resync);
    };
    let restic = drive(
        watch,
        queue,
        ctx.config.num_threads,
        reconciler,
        shutdown.clone(),
    );

    tokio::join!(restic, workloads);
    info!("Restic controller stopped");
}
