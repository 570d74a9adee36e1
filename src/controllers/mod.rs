//! Controllers: one change feed, queue and worker pool per watched kind
//!
//! Watch events flow feed -> admission -> queue -> reconciler. Each kind
//! runs independently; within a kind only distinct keys run in parallel.

pub mod admission;
pub mod feed;
pub mod queue;
mod recovery_controller;
mod restic_controller;
mod workload_controller;

pub use recovery_controller::run as run_recovery_controller;
pub use restic_controller::run as run_restic_controller;

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Client, Resource, ResourceExt};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::adapters::{ClusterApi, EventPublisher, KubeCluster, KubeEventPublisher};
use crate::config::OperatorConfig;
use crate::error::{Error, Result};

use queue::{Reconcile, WorkQueue};

/// Shared context for all controllers
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    pub config: Arc<OperatorConfig>,
    pub cluster: Arc<dyn ClusterApi>,
    pub events: Arc<dyn EventPublisher>,
}

impl Context {
    /// Context backed by the API server `client` talks to
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        Self {
            cluster: Arc::new(KubeCluster::new(client.clone())),
            events: Arc::new(KubeEventPublisher::new(client.clone(), None)),
            config: Arc::new(config),
            client,
        }
    }
}

/// Read access to cached objects of one kind
pub trait Lister<K>: Send + Sync {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>>;

    /// Every cached object in `namespace`
    fn list(&self, namespace: &str) -> Vec<Arc<K>>;
}

impl<K> Lister<K> for Store<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        Store::get(self, &ObjectRef::new(name).within(namespace))
    }

    fn list(&self, namespace: &str) -> Vec<Arc<K>> {
        self.state()
            .into_iter()
            .filter(|o| o.namespace().as_deref() == Some(namespace))
            .collect()
    }
}

/// Run a watch and the workers of its queue until `shutdown` fires
async fn drive<W, R>(
    watch: W,
    queue: Arc<WorkQueue>,
    workers: usize,
    reconciler: Arc<R>,
    shutdown: CancellationToken,
) where
    W: Future<Output = ()>,
    R: Reconcile,
{
    let stop = async {
        shutdown.cancelled().await;
        queue.shut_down();
    };
    tokio::join!(watch, Arc::clone(&queue).run(workers, reconciler), stop);
}

/// Queue every cached object of `store`, returning how many were queued
pub fn requeue_all<K>(store: &Store<K>, queue: &WorkQueue) -> usize
where
    K: Resource + Clone + 'static,
    K::DynamicType: Clone + Eq + Hash,
{
    let objects = store.state();
    for obj in &objects {
        queue.add(object_key(obj.as_ref()));
    }
    objects.len()
}

/// Requeue the whole cache every `period` until `shutdown` fires.
///
/// Keys dropped after exhausting their retries get another chance here
/// instead of waiting for the next change of the object.
async fn resync<K>(
    store: Store<K>,
    queue: Arc<WorkQueue>,
    period: Option<Duration>,
    shutdown: CancellationToken,
) where
    K: Resource + Clone + 'static,
    K::DynamicType: Clone + Eq + Hash,
{
    let Some(period) = period else {
        return;
    };
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately and the initial list already
    // queued everything
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let count = requeue_all(&store, &queue);
                debug!(kind = queue.kind(), count, "Resync");
            }
        }
    }
}

/// Queue key of an object: `namespace/name`
pub fn object_key<K: Resource>(obj: &K) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

/// Split a queue key into namespace and name
pub fn split_key(key: &str) -> Result<(&str, &str)> {
    key.split_once('/')
        .filter(|(ns, name)| !ns.is_empty() && !name.is_empty())
        .ok_or_else(|| Error::validation(format!("invalid key {:?}", key)))
}
