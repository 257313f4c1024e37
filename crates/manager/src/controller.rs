//! Controller loops: watcher events and dynamic-cache fan-out feed a
//! coalescing key queue drained by a bounded worker pool.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::TryStreamExt;
use kube::{
    api::Api,
    runtime::watcher::{self, Event},
    Client, Resource, ResourceExt,
};
use metrics::counter;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use convoy_cache::{DynamicCache, OwnerKey};
use convoy_core::{env_u64, ObjectKey};
use convoy_hosted::{hosted_cluster_api_resource, HostedClusterController};
use convoy_template::{TemplateOwner, TemplateReconciler};

use crate::queue::KeyQueue;

/// Run one reconcile loop over a key queue until the process shuts down.
pub async fn run_workers<F, Fut, E>(
    name: &'static str,
    queue: Arc<KeyQueue<ObjectKey>>,
    workers: usize,
    reconcile: F,
) where
    F: Fn(ObjectKey) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: std::fmt::Display + Send,
{
    let backoff_max = env_u64("CONVOY_REQUEUE_BACKOFF_MAX_SECS", 60);
    let backoffs: Arc<Mutex<HashMap<ObjectKey, u64>>> = Arc::new(Mutex::new(HashMap::new()));

    let mut handles = Vec::with_capacity(workers);
    for worker in 0..workers {
        let queue = queue.clone();
        let reconcile = reconcile.clone();
        let backoffs = backoffs.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let key = queue.pop().await;
                match reconcile(key.clone()).await {
                    Ok(()) => {
                        backoffs.lock().unwrap().remove(&key);
                        counter!("reconcile_ok_total", 1u64, "controller" => name);
                    }
                    Err(e) => {
                        counter!("reconcile_err_total", 1u64, "controller" => name);
                        let delay = {
                            let mut map = backoffs.lock().unwrap();
                            let entry = map.entry(key.clone()).or_insert(1);
                            let delay = *entry;
                            *entry = (*entry * 2).min(backoff_max.max(1));
                            delay
                        };
                        warn!(controller = name, worker, key = %key, error = %e, delay_secs = delay, "reconcile failed, requeueing");
                        let queue = queue.clone();
                        let key_retry = key.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_secs(delay)).await;
                            queue.push(key_retry);
                        });
                    }
                }
                if queue.done(&key) {
                    debug!(controller = name, key = %key, "stale events during reconcile, running again");
                }
            }
        }));
    }
    let _ = futures::future::join_all(handles).await;
}

/// Feed primary watch events of `K` into the queue, keyed by object.
pub async fn pump_watcher<K>(api: Api<K>, queue: Arc<KeyQueue<ObjectKey>>)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    loop {
        match stream.try_next().await {
            Ok(Some(Event::Applied(obj))) => {
                queue.push(ObjectKey::new(obj.namespace().as_deref(), &obj.name_any()));
            }
            Ok(Some(Event::Deleted(obj))) => {
                queue.push(ObjectKey::new(obj.namespace().as_deref(), &obj.name_any()));
            }
            Ok(Some(Event::Restarted(list))) => {
                for obj in list {
                    queue.push(ObjectKey::new(obj.namespace().as_deref(), &obj.name_any()));
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "primary watch error, retrying");
                counter!("watch_errors_total", 1u64);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Forward dynamic-cache enqueue events for owners of the given kind.
pub async fn pump_cache_events(
    mut events: broadcast::Receiver<OwnerKey>,
    api_version: String,
    kind: String,
    queue: Arc<KeyQueue<ObjectKey>>,
) {
    loop {
        match events.recv().await {
            Ok(owner) if owner.kind == kind && owner.api_version == api_version => {
                queue.push(ObjectKey::new(owner.namespace.as_deref(), &owner.name));
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(kind = %kind, missed, "cache event fan-out lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Template controller: reconciles on owner changes and on every change of a
/// watched source kind.
pub async fn run_template_controller<T: TemplateOwner>(
    name: &'static str,
    client: Client,
    cache: Arc<DynamicCache>,
    workers: usize,
) {
    info!(controller = name, "starting");
    let queue = Arc::new(KeyQueue::new());
    let reconciler = Arc::new(TemplateReconciler::<T>::new(client.clone(), cache.clone()));

    let api: Api<T> = Api::all(client);
    tokio::spawn(pump_watcher(api, queue.clone()));
    tokio::spawn(pump_cache_events(
        cache.subscribe(),
        T::api_version(&()).to_string(),
        T::kind(&()).to_string(),
        queue.clone(),
    ));

    run_workers(name, queue, workers, move |key| {
        let reconciler = reconciler.clone();
        async move { reconciler.reconcile(&key).await }
    })
    .await;
}

/// Hosted-cluster controller: watches the external kind and provisions
/// remote-phase manager packages.
pub async fn run_hosted_controller(client: Client, image: String, workers: usize) {
    info!(controller = "hostedclusters", image = %image, "starting");
    let queue = Arc::new(KeyQueue::new());
    let controller = Arc::new(HostedClusterController::new(client.clone(), image));

    let ar = hosted_cluster_api_resource();
    let api: Api<kube::core::DynamicObject> = Api::all_with(client, &ar);
    tokio::spawn(pump_watcher(api, queue.clone()));

    run_workers("hostedclusters", queue, workers, move |key| {
        let controller = controller.clone();
        async move { controller.reconcile(&key).await }
    })
    .await;
}
