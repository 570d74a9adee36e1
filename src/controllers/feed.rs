//! Change feed: watch stream -> cache -> admission -> queue

use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use kube::runtime::reflector::{store::Writer, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::admission::{decide, Admission, Decision};
use super::object_key;
use super::queue::WorkQueue;
use crate::adapters::EventPublisher;
use crate::metrics;

/// Routes notifications of one kind into its queue
pub struct Feed<K, A>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Clone + Eq + Hash,
{
    admission: A,
    dyntype: K::DynamicType,
    writer: Writer<K>,
    queue: Arc<WorkQueue>,
    events: Arc<dyn EventPublisher>,
    /// Keys listed during the current relist
    relisted: HashSet<String>,
    /// Keys admitted during the current relist
    pending: Vec<String>,
}

impl<K, A> Feed<K, A>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Clone + Eq + Hash + Default,
    A: Admission<K>,
{
    pub fn new(admission: A, queue: Arc<WorkQueue>, events: Arc<dyn EventPublisher>) -> Self {
        Self::new_with(admission, Default::default(), queue, events)
    }
}

impl<K, A> Feed<K, A>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Clone + Eq + Hash,
    A: Admission<K>,
{
    pub fn new_with(
        admission: A,
        dyntype: K::DynamicType,
        queue: Arc<WorkQueue>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            admission,
            writer: Writer::new(dyntype.clone()),
            dyntype,
            queue,
            events,
            relisted: HashSet::new(),
            pending: Vec::new(),
        }
    }

    /// Cached state of the watched objects
    pub fn store(&self) -> Store<K> {
        self.writer.as_reader()
    }

    /// Previous state of `obj`; the store is only updated after routing
    fn cached(&self, obj: &K) -> Option<Arc<K>> {
        self.writer
            .as_reader()
            .get(&ObjectRef::from_obj_with(obj, self.dyntype.clone()))
    }

    /// Route one watch event.
    ///
    /// Keys are queued only once the cache reflects the event, so a worker
    /// never looks up an object the cache has not seen yet. Keys admitted
    /// during a relist wait for the relist to complete.
    pub async fn handle(&mut self, event: watcher::Event<K>) {
        let mut ready = Vec::new();
        match &event {
            watcher::Event::Init => {
                self.relisted.clear();
                self.pending.clear();
            }
            watcher::Event::InitApply(obj) => {
                let key = object_key(obj);
                self.relisted.insert(key.clone());
                let old = self.cached(obj);
                if self.admit(old.as_deref(), obj).await {
                    self.pending.push(key);
                }
            }
            watcher::Event::InitDone => {
                // objects deleted while the watch was down never get a Delete
                for obj in self.writer.as_reader().state() {
                    let key = object_key(obj.as_ref());
                    if !self.relisted.contains(&key) {
                        debug!(kind = self.admission.kind(), key = %key, "Gone after relist");
                        ready.push(key);
                    }
                }
                ready.append(&mut self.pending);
                self.relisted.clear();
            }
            watcher::Event::Apply(obj) => {
                let old = self.cached(obj);
                if self.admit(old.as_deref(), obj).await {
                    ready.push(object_key(obj));
                }
            }
            watcher::Event::Delete(obj) => {
                // cleanup must run even for invalid objects
                debug!(kind = self.admission.kind(), name = %obj.name_any(), "Deleted");
                ready.push(object_key(obj));
            }
        }
        self.writer.apply_watcher_event(&event);
        for key in ready {
            self.queue.add(key);
        }
    }

    /// Whether the notification should be queued
    async fn admit(&self, old: Option<&K>, obj: &K) -> bool {
        let kind = self.admission.kind();
        match decide(&self.admission, old, obj) {
            Decision::Enqueue => true,
            Decision::Suppress => {
                metrics::SUPPRESSED_UPDATES.with_label_values(&[kind]).inc();
                false
            }
            Decision::Reject(e) => {
                warn!(kind, name = %obj.name_any(), error = %e, "Rejected invalid object");
                metrics::ADMISSION_REJECTIONS.with_label_values(&[kind]).inc();
                self.events
                    .warning(
                        &self.admission.object_ref(obj),
                        self.admission.invalid_reason(),
                        format!("Reason: {}", e),
                    )
                    .await;
                false
            }
        }
    }

    /// Watch `api` until `shutdown` fires
    pub async fn run(mut self, api: Api<K>, shutdown: CancellationToken) {
        let kind = self.admission.kind();
        info!(kind, "Starting watch");
        let mut stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .into_stream()
            .boxed();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = stream.try_next() => match next {
                    Ok(Some(event)) => self.handle(event).await,
                    Ok(None) => break,
                    Err(e) => error!(kind, error = %e, "Watch error"),
                },
            }
        }
        info!(kind, "Watch stopped");
    }
}
