//! Convoy dynamic cache – lazily registered informers keyed by kind, with
//! per-owner interest tracking and owner-key event fan-out.

#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::TryStreamExt;
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    runtime::watcher::{self, Event},
    Client, Resource, ResourceExt,
};
use metrics::counter;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use convoy_core::{env_u64, env_usize, gvk_key, ObjectKey, CACHE_LABEL, CACHE_LABEL_VALUE};

mod discovery;
mod writer;

pub use discovery::resolve_api_resource;
pub use writer::{KubeWriter, Writer};

/// Identity of a watch-registration owner. Owners are enqueued by key, never
/// by reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerKey {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    pub uid: String,
}

impl OwnerKey {
    pub fn from_dynamic(obj: &DynamicObject) -> Option<Self> {
        let types = obj.types.as_ref()?;
        Some(Self {
            api_version: types.api_version.clone(),
            kind: types.kind.clone(),
            namespace: obj.metadata.namespace.clone(),
            name: obj.metadata.name.clone()?,
            uid: obj.metadata.uid.clone().unwrap_or_default(),
        })
    }

    pub fn from_resource<K>(obj: &K) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self {
            api_version: K::api_version(&()).to_string(),
            kind: K::kind(&()).to_string(),
            namespace: obj.meta().namespace.clone(),
            name: obj.name_any(),
            uid: obj.meta().uid.clone().unwrap_or_default(),
        }
    }
}

impl std::fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("not found: {kind} {key}")]
    NotFound { kind: String, key: String },
    #[error("kind not watched: {0}")]
    NotWatched(String),
    #[error("discovery: {0}")]
    Discovery(String),
    #[error("invalid object: {0}")]
    InvalidObject(String),
    #[error("kube: {0}")]
    Kube(#[from] kube::Error),
}

impl CacheError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound { .. })
    }

    pub(crate) fn not_found(kind: &str, key: &ObjectKey) -> Self {
        CacheError::NotFound { kind: kind.to_string(), key: key.to_string() }
    }
}

/// Read/watch surface reconcilers depend on. Implemented by [`DynamicCache`]
/// and by in-memory fakes in tests.
#[async_trait]
pub trait ObjectCache: Send + Sync {
    /// Idempotently ensure an informer exists for `gvk` and record the
    /// owner's interest. May suspend while the initial list completes.
    async fn watch(&self, owner: &OwnerKey, gvk: &GroupVersionKind) -> Result<(), CacheError>;

    /// Non-blocking read from the informer store.
    fn get(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> Result<DynamicObject, CacheError>;

    /// Release every watch registration held by `owner`.
    async fn free(&self, owner: &OwnerKey) -> Result<(), CacheError>;
}

// ------------- interest registry -------------

/// Pure bookkeeping of `(owner, kind)` registrations with a reverse index.
#[derive(Default)]
struct Registry {
    by_kind: HashMap<String, HashSet<OwnerKey>>,
    by_owner: HashMap<OwnerKey, HashSet<String>>,
}

impl Registry {
    /// Record interest; returns true when the owner was not yet registered
    /// for this kind.
    fn insert(&mut self, owner: &OwnerKey, kind_key: &str) -> bool {
        self.by_owner.entry(owner.clone()).or_default().insert(kind_key.to_string());
        self.by_kind.entry(kind_key.to_string()).or_default().insert(owner.clone())
    }

    fn interested(&self, kind_key: &str) -> Vec<OwnerKey> {
        self.by_kind.get(kind_key).map(|s| s.iter().cloned().collect()).unwrap_or_default()
    }

    /// Drop all registrations of `owner`; returns the kinds whose interest
    /// set became empty.
    fn free(&mut self, owner: &OwnerKey) -> Vec<String> {
        let kinds = self.by_owner.remove(owner).unwrap_or_default();
        let mut emptied = Vec::new();
        for kind_key in kinds {
            if let Some(owners) = self.by_kind.get_mut(&kind_key) {
                owners.remove(owner);
                if owners.is_empty() {
                    self.by_kind.remove(&kind_key);
                    emptied.push(kind_key);
                }
            }
        }
        emptied
    }
}

// ------------- informer store -------------

type SharedStore = Arc<RwLock<HashMap<ObjectKey, DynamicObject>>>;

struct KindHandle {
    task: tokio::task::JoinHandle<()>,
}

struct KindCell {
    init: tokio::sync::OnceCell<KindHandle>,
}

/// Process-wide registry of lazily started informers.
///
/// `watch` is additive and `free` removes per owner; both are serialized per
/// kind. Reads never touch the network once an informer is running.
pub struct DynamicCache {
    client: Client,
    registry: Arc<RwLock<Registry>>,
    kinds: RwLock<HashMap<String, Arc<KindCell>>>,
    stores: Arc<RwLock<HashMap<String, SharedStore>>>,
    events: broadcast::Sender<OwnerKey>,
}

impl DynamicCache {
    pub fn new(client: Client) -> Self {
        let cap = env_usize("CONVOY_QUEUE_CAP", 2048);
        let (events, _) = broadcast::channel(cap);
        Self {
            client,
            registry: Arc::new(RwLock::new(Registry::default())),
            kinds: RwLock::new(HashMap::new()),
            stores: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Event source: every object change enqueues the keys of all owners
    /// whose interest set includes the changed kind.
    pub fn subscribe(&self) -> broadcast::Receiver<OwnerKey> {
        self.events.subscribe()
    }

    async fn ensure_informer(&self, kind_key: &str, gvk: &GroupVersionKind) -> Result<(), CacheError> {
        let cell = {
            let mut kinds = self.kinds.write().unwrap();
            kinds
                .entry(kind_key.to_string())
                .or_insert_with(|| Arc::new(KindCell { init: tokio::sync::OnceCell::new() }))
                .clone()
        };

        // Per-kind serialization: concurrent callers for the same kind rendezvous
        // here and only one initial list runs.
        cell.init
            .get_or_try_init(|| async {
                let (ar, namespaced) = resolve_api_resource(self.client.clone(), gvk).await?;
                let store: SharedStore = Arc::new(RwLock::new(HashMap::new()));

                let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
                prime_store(&api, &store).await?;
                self.stores.write().unwrap().insert(kind_key.to_string(), store.clone());

                let task = tokio::spawn(run_informer(
                    self.client.clone(),
                    ar,
                    namespaced,
                    kind_key.to_string(),
                    store.clone(),
                    self.registry.clone(),
                    self.events.clone(),
                ));
                info!(kind = %kind_key, "informer started");
                Ok::<_, CacheError>(KindHandle { task })
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectCache for DynamicCache {
    async fn watch(&self, owner: &OwnerKey, gvk: &GroupVersionKind) -> Result<(), CacheError> {
        let kind_key = gvk_key(gvk);
        self.ensure_informer(&kind_key, gvk).await?;
        if self.registry.write().unwrap().insert(owner, &kind_key) {
            debug!(owner = %owner, kind = %kind_key, "watch registered");
        }
        Ok(())
    }

    fn get(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> Result<DynamicObject, CacheError> {
        let kind_key = gvk_key(gvk);
        let stores = self.stores.read().unwrap();
        let store = stores.get(&kind_key).ok_or_else(|| CacheError::NotWatched(kind_key.clone()))?;
        let result = store
            .read()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| CacheError::not_found(&kind_key, key));
        result
    }

    async fn free(&self, owner: &OwnerKey) -> Result<(), CacheError> {
        let emptied = self.registry.write().unwrap().free(owner);
        for kind_key in emptied {
            self.stores.write().unwrap().remove(&kind_key);
            if let Some(cell) = self.kinds.write().unwrap().remove(&kind_key) {
                if let Some(handle) = cell.init.get() {
                    handle.task.abort();
                }
            }
            info!(kind = %kind_key, "informer stopped, no interest left");
        }
        debug!(owner = %owner, "watch registrations freed");
        Ok(())
    }
}

fn cache_selector() -> String {
    format!("{}={}", CACHE_LABEL, CACHE_LABEL_VALUE)
}

/// Initial paged list filling the store before the watch stream starts.
async fn prime_store(api: &Api<DynamicObject>, store: &SharedStore) -> Result<usize, CacheError> {
    let page_limit = env_u64("CONVOY_SNAPSHOT_PAGE_LIMIT", 500) as u32;
    let mut filled = 0usize;
    let mut continue_token: Option<String> = None;
    loop {
        let mut params = ListParams::default().labels(&cache_selector());
        if page_limit > 0 {
            params = params.limit(page_limit);
        }
        if let Some(ref token) = continue_token {
            params = params.continue_token(token.as_str());
        }
        let list = api.list(&params).await?;
        continue_token = list.metadata.continue_.clone();
        filled += insert_page(store, list.items);
        if continue_token.is_none() {
            break;
        }
        tokio::task::yield_now().await;
    }
    Ok(filled)
}

/// Inserts a page of listed objects into the store. Kept as a plain
/// (non-async) function so the `RwLockWriteGuard` never becomes part of an
/// async generator's state across an `.await` point.
fn insert_page(store: &SharedStore, items: Vec<DynamicObject>) -> usize {
    let mut guard = store.write().unwrap();
    let mut filled = 0usize;
    for obj in items {
        guard.insert(ObjectKey::from_object(&obj), obj);
        filled += 1;
    }
    filled
}

fn fan_out(
    registry: &RwLock<Registry>,
    events: &broadcast::Sender<OwnerKey>,
    kind_key: &str,
) {
    for owner in registry.read().unwrap().interested(kind_key) {
        let _ = events.send(owner);
    }
}

/// Long-running list+watch loop for one kind, adapted to restart with
/// backoff and to relist periodically.
async fn run_informer(
    client: Client,
    ar: ApiResource,
    _namespaced: bool,
    kind_key: String,
    store: SharedStore,
    registry: Arc<RwLock<Registry>>,
    events: broadcast::Sender<OwnerKey>,
) {
    let relist_secs = env_u64("CONVOY_RELIST_SECS", 300);
    let backoff_max = env_u64("CONVOY_WATCH_BACKOFF_MAX_SECS", 30);
    let mut backoff: u64 = 1;

    loop {
        let api: Api<DynamicObject> = Api::all_with(client.clone(), &ar);
        let cfg = watcher::Config::default().labels(&cache_selector());
        let stream = watcher::watcher(api, cfg);
        futures::pin_mut!(stream);

        let relist_timer = tokio::time::sleep(std::time::Duration::from_secs(relist_secs.max(1)));
        tokio::pin!(relist_timer);

        let ended = loop {
            tokio::select! {
                maybe_ev = stream.try_next() => {
                    match maybe_ev {
                        Ok(Some(Event::Applied(obj))) => {
                            store.write().unwrap().insert(ObjectKey::from_object(&obj), obj);
                            fan_out(&registry, &events, &kind_key);
                        }
                        Ok(Some(Event::Deleted(obj))) => {
                            store.write().unwrap().remove(&ObjectKey::from_object(&obj));
                            fan_out(&registry, &events, &kind_key);
                        }
                        Ok(Some(Event::Restarted(list))) => {
                            debug!(kind = %kind_key, count = list.len(), "watch restarted");
                            let mut guard = store.write().unwrap();
                            guard.clear();
                            for obj in list {
                                guard.insert(ObjectKey::from_object(&obj), obj);
                            }
                            drop(guard);
                            fan_out(&registry, &events, &kind_key);
                        }
                        Ok(None) => break true,
                        Err(e) => {
                            warn!(kind = %kind_key, error = %e, "watch stream error, will backoff and restart");
                            counter!("watch_errors_total", 1u64);
                            break true;
                        }
                    }
                }
                _ = &mut relist_timer => {
                    debug!(kind = %kind_key, "periodic relist, restarting watch");
                    counter!("relist_total", 1u64);
                    break false;
                }
            }
        };

        if ended {
            let dur = std::time::Duration::from_secs(backoff.min(backoff_max));
            tokio::time::sleep(dur).await;
            backoff = (backoff * 2).min(backoff_max).max(1);
        } else {
            backoff = 1;
        }
        counter!("watch_restarts_total", 1u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(name: &str) -> OwnerKey {
        OwnerKey {
            api_version: "convoy.run/v1alpha1".into(),
            kind: "ObjectSet".into(),
            namespace: Some("default".into()),
            name: name.into(),
            uid: format!("uid-{name}"),
        }
    }

    #[test]
    fn registry_tracks_interest_both_ways() {
        let mut reg = Registry::default();
        assert!(reg.insert(&owner("a"), "v1/ConfigMap"));
        assert!(!reg.insert(&owner("a"), "v1/ConfigMap"));
        reg.insert(&owner("a"), "v1/Secret");
        reg.insert(&owner("b"), "v1/ConfigMap");

        let mut interested = reg.interested("v1/ConfigMap");
        interested.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(interested.len(), 2);
        assert_eq!(interested[0].name, "a");
    }

    #[test]
    fn free_removes_only_the_owners_registrations() {
        let mut reg = Registry::default();
        reg.insert(&owner("a"), "v1/ConfigMap");
        reg.insert(&owner("a"), "v1/Secret");
        reg.insert(&owner("b"), "v1/ConfigMap");

        let emptied = reg.free(&owner("a"));
        assert_eq!(emptied, vec!["v1/Secret".to_string()]);
        assert_eq!(reg.interested("v1/ConfigMap").len(), 1);
        assert_eq!(reg.interested("v1/ConfigMap")[0].name, "b");
        assert!(reg.interested("v1/Secret").is_empty());

        // Freeing again is a no-op.
        assert!(reg.free(&owner("a")).is_empty());
    }

    #[test]
    fn owner_key_from_dynamic_needs_type_meta() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "convoy.run/v1alpha1",
            "kind": "ObjectSet",
            "metadata": {"name": "set-1", "namespace": "prod", "uid": "u-1"}
        }))
        .unwrap();
        let key = OwnerKey::from_dynamic(&obj).unwrap();
        assert_eq!(key.kind, "ObjectSet");
        assert_eq!(key.uid, "u-1");
        assert_eq!(key.to_string(), "ObjectSet prod/set-1");

        let untyped = DynamicObject { types: None, ..obj };
        assert!(OwnerKey::from_dynamic(&untyped).is_none());
    }
}
