//! BFE watch store: per-kind caches, secret reference index, certificate store and event fan-out

#![forbid(unsafe_code)]

pub mod cache;
pub mod certs;
pub mod chain;
pub mod class;
pub mod compare;
pub mod der;
pub mod objref;
pub mod ring;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bfe_core::{meta_key, ClassConfig, Delta, Event, EventKind, PodInfo, Resource, ResourceKind};
use bfe_kubehub::{pod_watch_options, scoped_api, start_watcher, AuditRecorder, WatchError, WatchOptions};
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::{Api, Client};
use metrics::counter;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{Cache, Change};
use crate::certs::{CertConfig, CertError, CertStore, CertificateRecord, TlsMaterial};
use crate::objref::ObjectRefMap;
use crate::ring::RingSender;

pub use crate::class::is_valid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {key} not found in local store")]
    NotFound { kind: ResourceKind, key: String },
    #[error(transparent)]
    Cert(#[from] CertError),
    #[error(transparent)]
    Watch(#[from] WatchError),
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Watch a single namespace; `None` watches all of them.
    pub namespace: Option<String>,
    /// Full relist period; `None` disables periodic resync.
    pub resync_period: Option<Duration>,
    pub class: ClassConfig,
    pub certs: CertConfig,
    /// Upper bound on the wait for each initial cache sync.
    pub cache_sync_timeout: Duration,
    /// Pause between the dependency caches syncing and the route watch starting.
    pub settle_delay: Duration,
    /// Controller pod to watch for phase changes.
    pub pod: Option<PodInfo>,
    /// Per-kind buffer between a watcher and its handlers.
    pub delta_buffer: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            resync_period: Some(Duration::from_secs(600)),
            class: ClassConfig::default(),
            certs: CertConfig::default(),
            cache_sync_timeout: Duration::from_secs(60),
            settle_delay: Duration::from_secs(1),
            pod: None,
            delta_buffer: 256,
        }
    }
}

impl StoreConfig {
    pub fn ssl_dir(&self) -> &PathBuf { &self.certs.ssl_dir }
}

/// Local mirror of the cluster objects the controller cares about.
///
/// Handlers run on the delivering watcher's task: they update the cache, keep the reference index
/// and certificate store current, and push normalized [`Event`]s into the ring.
pub struct Store {
    cfg: StoreConfig,
    routes: Cache<Ingress>,
    endpoints: Cache<Endpoints>,
    services: Cache<Service>,
    secrets: Cache<Secret>,
    configs: Cache<ConfigMap>,
    pods: Cache<Pod>,
    secret_refs: ObjectRefMap,
    certs: CertStore,
    sync_secrets_lock: Mutex<()>,
    updates: RingSender<Event>,
    recorder: Arc<dyn AuditRecorder>,
}

fn route_name(ing: &Ingress) -> String { meta_key(&ing.metadata).unwrap_or_default() }

fn normalize_routes(delta: Delta<Ingress>) -> Delta<Ingress> {
    let fix = |mut ing: Ingress| {
        class::default_path_types(&mut ing);
        ing
    };
    match delta {
        Delta::Applied(i) => Delta::Applied(fix(i)),
        Delta::Deleted(i) => Delta::Deleted(fix(i)),
        Delta::Relisted(list) => Delta::Relisted(list.into_iter().map(fix).collect()),
    }
}

impl Store {
    pub fn new(cfg: StoreConfig, updates: RingSender<Event>, recorder: Arc<dyn AuditRecorder>) -> Self {
        let certs = CertStore::new(cfg.certs.clone());
        Self {
            cfg,
            routes: Cache::new(),
            endpoints: Cache::new(),
            services: Cache::new(),
            secrets: Cache::new(),
            configs: Cache::new(),
            pods: Cache::new(),
            secret_refs: ObjectRefMap::new(),
            certs,
            sync_secrets_lock: Mutex::new(()),
            updates,
            recorder,
        }
    }

    pub fn config(&self) -> &StoreConfig { &self.cfg }
    pub fn class_config(&self) -> &ClassConfig { &self.cfg.class }
    pub fn reference_index(&self) -> &ObjectRefMap { &self.secret_refs }
    pub fn cert_store(&self) -> &CertStore { &self.certs }

    fn emit(&self, kind: EventKind, object: Resource) {
        counter!("store_events_total", 1u64, "kind" => object.kind().as_str(), "event" => kind.to_string());
        debug!(event = %kind, object = %object.kind(), key = ?object.key(), "emit");
        self.updates.send(Event::new(kind, object));
    }

    // ---- lookups ----

    pub fn get_secret(&self, key: &str) -> Result<Arc<Secret>, StoreError> {
        self.secrets.get(key).ok_or_else(|| StoreError::NotFound { kind: ResourceKind::Secret, key: key.to_string() })
    }

    pub fn get_service(&self, key: &str) -> Result<Arc<Service>, StoreError> {
        self.services.get(key).ok_or_else(|| StoreError::NotFound { kind: ResourceKind::Service, key: key.to_string() })
    }

    pub fn get_endpoints(&self, key: &str) -> Result<Arc<Endpoints>, StoreError> {
        self.endpoints.get(key).ok_or_else(|| StoreError::NotFound { kind: ResourceKind::Endpoints, key: key.to_string() })
    }

    pub fn get_config_map(&self, key: &str) -> Result<Arc<ConfigMap>, StoreError> {
        self.configs.get(key).ok_or_else(|| StoreError::NotFound { kind: ResourceKind::Config, key: key.to_string() })
    }

    pub fn get_route(&self, key: &str) -> Result<Arc<Ingress>, StoreError> {
        self.routes.get(key).ok_or_else(|| StoreError::NotFound { kind: ResourceKind::Route, key: key.to_string() })
    }

    pub fn get_pod(&self, key: &str) -> Result<Arc<Pod>, StoreError> {
        self.pods.get(key).ok_or_else(|| StoreError::NotFound { kind: ResourceKind::Pod, key: key.to_string() })
    }

    pub fn get_local_cert(&self, key: &str) -> Result<CertificateRecord, StoreError> { Ok(self.certs.get(key)?) }

    /// Cached routes accepted by `filter`, oldest first. Routes created in the same second are
    /// ordered by `namespace/name`, descending.
    pub fn list_routes<F>(&self, filter: F) -> Vec<Arc<Ingress>>
    where
        F: Fn(&Ingress) -> bool,
    {
        let mut out: Vec<Arc<Ingress>> = self.routes.list().into_iter().filter(|i| filter(i)).collect();
        out.sort_by(|a, b| {
            let ta = a.metadata.creation_timestamp.as_ref().map(|t| t.0);
            let tb = b.metadata.creation_timestamp.as_ref().map(|t| t.0);
            ta.cmp(&tb).then_with(|| route_name(b).cmp(&route_name(a)))
        });
        out
    }

    /// Routes this controller serves, in listing order.
    pub fn list_member_routes(&self) -> Vec<Arc<Ingress>> { self.list_routes(|i| is_valid(i, &self.cfg.class)) }

    // ---- routes ----

    pub async fn apply_route(&self, delta: Delta<Ingress>) {
        for change in self.routes.apply(normalize_routes(delta)) {
            match change {
                Change::Added(ing) => self.on_route_add(ing).await,
                Change::Updated { old, new } => self.on_route_update(old, new).await,
                Change::Removed(ing) => self.on_route_delete(ing).await,
            }
        }
    }

    async fn on_route_add(&self, ing: Arc<Ingress>) {
        let key = route_name(&ing);
        if !is_valid(&ing, &self.cfg.class) {
            info!(ingress = %key, "ignoring add for ingress based on class");
            return;
        }
        self.audit(&ing, "CREATE", &key);
        self.update_secret_refs(&ing);
        self.sync_secrets(&ing).await;
        self.emit(EventKind::Create, Resource::Route(ing));
    }

    async fn on_route_update(&self, old: Arc<Ingress>, cur: Arc<Ingress>) {
        let key = route_name(&cur);
        let valid_old = is_valid(&old, &self.cfg.class);
        let valid_cur = is_valid(&cur, &self.cfg.class);
        if !valid_old && valid_cur {
            info!(ingress = %key, "creating ingress based on class");
            self.audit(&cur, "CREATE", &key);
        } else if valid_old && !valid_cur {
            info!(ingress = %key, "removing ingress based on class");
            self.on_route_delete(old).await;
            return;
        } else if valid_cur && !compare::same_route(&old, &cur) {
            self.audit(&cur, "UPDATE", &key);
        } else {
            debug!(ingress = %key, "no changes on ingress; skipping update");
            return;
        }
        self.update_secret_refs(&cur);
        self.sync_secrets(&cur).await;
        self.emit(EventKind::Update, Resource::Route(cur));
    }

    async fn on_route_delete(&self, ing: Arc<Ingress>) {
        let key = route_name(&ing);
        if !is_valid(&ing, &self.cfg.class) {
            info!(ingress = %key, "ignoring delete for ingress based on class");
            return;
        }
        self.audit(&ing, "DELETE", &key);
        self.secret_refs.delete(&key);
        self.emit(EventKind::Delete, Resource::Route(ing));
    }

    /// Hand the audit record to its own task; handlers never wait on the events API.
    fn audit(&self, ing: &Arc<Ingress>, reason: &'static str, key: &str) {
        let recorder = Arc::clone(&self.recorder);
        let ing = Arc::clone(ing);
        let note = format!("Ingress {key}");
        tokio::spawn(async move { recorder.record(&ing, reason, note).await });
    }

    fn update_secret_refs(&self, ing: &Ingress) {
        let key = route_name(ing);
        self.secret_refs.insert(&key, class::secret_refs(ing));
    }

    /// Refresh the certificate record of every secret the route references.
    async fn sync_secrets(&self, ing: &Ingress) {
        let _guard = self.sync_secrets_lock.lock().await;
        for secret in self.secret_refs.referenced_by(&route_name(ing)) {
            self.sync_secret(&secret).await;
        }
    }

    async fn sync_secret(&self, key: &str) {
        let secret = match self.get_secret(key) {
            Ok(s) => s,
            Err(e) => {
                warn!(secret = %key, error = %e, "error obtaining secret");
                return;
            }
        };
        let uid = secret.metadata.uid.clone().unwrap_or_default();
        let material = TlsMaterial::from_secret(&secret);
        if let Err(e) = self.certs.put_material(key, &uid, &material).await {
            warn!(secret = %key, error = %e, "error obtaining X.509 certificate");
        }
    }

    // ---- secrets ----

    pub async fn apply_secret(&self, delta: Delta<Secret>) {
        for change in self.secrets.apply(delta) {
            match change {
                Change::Added(s) => self.on_secret_change(EventKind::Create, s).await,
                Change::Updated { old, new } => {
                    if !compare::same_secret(&old, &new) { self.on_secret_change(EventKind::Update, new).await; }
                }
                Change::Removed(s) => self.on_secret_delete(s),
            }
        }
    }

    async fn on_secret_change(&self, kind: EventKind, secret: Arc<Secret>) {
        let Some(key) = meta_key(&secret.metadata) else { return };
        let routes = self.secret_refs.reference(&key);
        if routes.is_empty() { return; }
        info!(secret = %key, event = %kind, routes = routes.len(), "referenced secret changed; parsing");
        for route in routes {
            match self.get_route(&route) {
                Ok(ing) => self.sync_secrets(&ing).await,
                Err(e) => error!(ingress = %route, error = %e, "could not find ingress in local store"),
            }
        }
        self.emit(kind, Resource::Secret(secret));
    }

    fn on_secret_delete(&self, secret: Arc<Secret>) {
        let Some(key) = meta_key(&secret.metadata) else { return };
        self.certs.delete(&key);
        if !self.secret_refs.reference(&key).is_empty() {
            info!(secret = %key, "referenced secret deleted");
            self.emit(EventKind::Delete, Resource::Secret(secret));
        }
    }

    // ---- endpoints, services, config maps, pods ----

    pub async fn apply_endpoints(&self, delta: Delta<Endpoints>) {
        for change in self.endpoints.apply(delta) {
            match change {
                Change::Added(e) => self.emit(EventKind::Create, Resource::Endpoints(e)),
                Change::Updated { old, new } => {
                    if !compare::same_subsets(&old, &new) { self.emit(EventKind::Update, Resource::Endpoints(new)); }
                }
                Change::Removed(e) => self.emit(EventKind::Delete, Resource::Endpoints(e)),
            }
        }
    }

    pub async fn apply_service(&self, delta: Delta<Service>) {
        for change in self.services.apply(delta) {
            if let Change::Updated { old, new } = change {
                if !compare::same_service(&old, &new) { self.emit(EventKind::Update, Resource::Service(new)); }
            }
        }
    }

    pub async fn apply_config_map(&self, delta: Delta<ConfigMap>) {
        for change in self.configs.apply(delta) {
            match change {
                Change::Added(c) => self.emit(EventKind::ConfigurationChanged, Resource::Config(c)),
                Change::Updated { old, new } => {
                    if !compare::same_config(&old, &new) { self.emit(EventKind::ConfigurationChanged, Resource::Config(new)); }
                }
                Change::Removed(_) => {}
            }
        }
    }

    pub async fn apply_pod(&self, delta: Delta<Pod>) {
        for change in self.pods.apply(delta) {
            match change {
                Change::Added(p) => self.emit(EventKind::Create, Resource::Pod(p)),
                Change::Updated { old, new } => {
                    if !compare::same_phase(&old, &new) {
                        info!(pod = ?meta_key(&new.metadata), phase = ?compare::pod_phase(&new), "pod phase changed");
                        self.emit(EventKind::Update, Resource::Pod(new));
                    }
                }
                Change::Removed(p) => self.emit(EventKind::Delete, Resource::Pod(p)),
            }
        }
    }

    // ---- watch wiring ----

    /// Start every watcher and block until the caches are primed.
    ///
    /// Endpoints, services, secrets and config maps (plus the pod, when configured) go first; the
    /// route watch starts only after they synced (or the timeout passed) and the settle delay
    /// elapsed, so route handlers find the objects they reference. Watchers keep running until
    /// `cancel` fires.
    pub async fn run(self: &Arc<Self>, client: Client, cancel: CancellationToken) -> Result<(), StoreError> {
        let ns = self.cfg.namespace.as_deref();
        let opts = WatchOptions::filtered(self.cfg.resync_period);
        let mut synced = vec![
            self.spawn_kind(scoped_api::<Endpoints>(client.clone(), ns), opts.clone(), &cancel, |s, d| async move {
                s.apply_endpoints(d).await
            }),
            self.spawn_kind(scoped_api::<Service>(client.clone(), ns), opts.clone(), &cancel, |s, d| async move {
                s.apply_service(d).await
            }),
            self.spawn_kind(scoped_api::<Secret>(client.clone(), ns), opts.clone(), &cancel, |s, d| async move {
                s.apply_secret(d).await
            }),
            self.spawn_kind(scoped_api::<ConfigMap>(client.clone(), ns), opts.clone(), &cancel, |s, d| async move {
                s.apply_config_map(d).await
            }),
        ];
        if let Some(pod) = &self.cfg.pod {
            let api: Api<Pod> = Api::namespaced(client.clone(), &pod.namespace);
            let pod_opts = pod_watch_options(pod, self.cfg.resync_period);
            synced.push(self.spawn_kind(api, pod_opts, &cancel, |s, d| async move { s.apply_pod(d).await }));
        }
        if !self.wait_synced(synced, &cancel).await {
            return Ok(());
        }
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(self.cfg.settle_delay) => {}
        }
        let routes = self.spawn_kind(scoped_api::<Ingress>(client, ns), opts, &cancel, |s, d| async move {
            s.apply_route(d).await
        });
        self.wait_synced(vec![routes], &cancel).await;
        info!(routes = self.routes.len(), secrets = self.secrets.len(), "store synced");
        Ok(())
    }

    /// Wait for every receiver to flip to `true`. Returns `false` only on cancellation.
    async fn wait_synced(&self, receivers: Vec<watch::Receiver<bool>>, cancel: &CancellationToken) -> bool {
        let all = async {
            for mut rx in receivers {
                let _ = rx.wait_for(|s| *s).await;
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => false,
            res = tokio::time::timeout(self.cfg.cache_sync_timeout, all) => {
                if res.is_err() {
                    warn!(timeout_secs = self.cfg.cache_sync_timeout.as_secs(), "timeout waiting for caches to sync");
                }
                true
            }
        }
    }

    fn spawn_kind<K, F, Fut>(self: &Arc<Self>, api: Api<K>, opts: WatchOptions, cancel: &CancellationToken, apply: F) -> watch::Receiver<bool>
    where
        K: kube::Resource<DynamicType = ()> + Clone + DeserializeOwned + std::fmt::Debug + Send + Sync + 'static,
        F: Fn(Arc<Store>, Delta<K>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Delta<K>>(self.cfg.delta_buffer.max(1));
        let (synced_tx, synced_rx) = watch::channel(false);
        let kind = K::kind(&()).to_string();
        let watch_cancel = cancel.clone();
        let watch_kind = kind.clone();
        tokio::spawn(async move {
            if let Err(e) = start_watcher(api, opts, tx, watch_cancel).await {
                error!(kind = %watch_kind, error = %e, "watcher failed");
            }
        });
        let store = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(delta) = rx.recv().await {
                let relist = delta.is_relist();
                apply(Arc::clone(&store), delta).await;
                if relist && !*synced_tx.borrow() {
                    info!(kind = %kind, "cache synced");
                    synced_tx.send_replace(true);
                }
            }
            debug!(kind = %kind, "delta stream closed");
        });
        synced_rx
    }
}
