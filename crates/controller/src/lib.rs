//! BFE ingress controller reconciler
//!
//! Wires the watch store to the sync queue and supervises the data-plane process.

#![forbid(unsafe_code)]

pub mod dataplane;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bfe_core::{dummy_object, meta_key, Event, EventKind, CONFIGURATION_SENTINEL};
use bfe_kubehub::AuditRecorder;
use bfe_queue::TaskQueue;
use bfe_store::certs::CertificateRecord;
use bfe_store::ring::{ring_channel, RingReceiver};
use bfe_store::{Store, StoreConfig, StoreError};
use kube::Client;
use metrics::counter;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use bfe_queue::SyncHandler as SyncAction;

use crate::dataplane::{wait_exit, DataPlane, DataPlaneExit, DEFAULT_BINARY, DEFAULT_CONF_DIR};

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("failed to start data plane {binary}: {source}")]
    DataPlaneStart { binary: PathBuf, source: std::io::Error },
    #[error("data plane exited ({status})")]
    DataPlaneExited { status: String, abnormal: bool },
    #[error("shutdown already in progress")]
    ShutdownInProgress,
    #[error("controller already started")]
    AlreadyStarted,
    #[error("signal data plane: {0}")]
    Signal(#[from] nix::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub binary: PathBuf,
    pub conf_dir: PathBuf,
    /// Restart delay for the queue worker.
    pub worker_period: Duration,
    /// Capacity of the event ring between the store and the dispatcher.
    pub event_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from(DEFAULT_BINARY),
            conf_dir: PathBuf::from(DEFAULT_CONF_DIR),
            worker_period: Duration::from_secs(1),
            event_capacity: 1024,
        }
    }
}

/// Default sync action: reads a consistent view of member routes and certificate records and logs it.
pub struct SnapshotSync {
    store: Arc<Store>,
}

impl SnapshotSync {
    pub fn new(store: Arc<Store>) -> Self { Self { store } }

    pub fn certificates(&self) -> Vec<CertificateRecord> {
        self.store.cert_store().keys().iter().filter_map(|k| self.store.get_local_cert(k).ok()).collect()
    }
}

#[async_trait::async_trait]
impl SyncAction for SnapshotSync {
    async fn sync(&self, key: &str) -> anyhow::Result<()> {
        let routes = self.store.list_member_routes();
        let certs = self.certificates();
        counter!("controller_snapshots_total", 1u64);
        info!(trigger = %key, routes = routes.len(), certificates = certs.len(), "ingress snapshot assembled");
        if tracing::enabled!(tracing::Level::DEBUG) {
            let names: Vec<String> = routes.iter().filter_map(|r| meta_key(&r.metadata)).collect();
            debug!(routes = ?names, certificates = %serde_json::to_string(&certs)?, "snapshot contents");
        }
        Ok(())
    }
}

pub struct Controller {
    cfg: ControllerConfig,
    store: Arc<Store>,
    queue: Arc<TaskQueue>,
    events: Mutex<Option<RingReceiver<Event>>>,
    data_plane: Mutex<Option<DataPlane>>,
    stopping: AtomicBool,
    cancel: CancellationToken,
}

impl Controller {
    /// Build the store, the event ring and the queue around `action` (or [`SnapshotSync`]).
    pub fn new(
        cfg: ControllerConfig,
        store_cfg: StoreConfig,
        recorder: Arc<dyn AuditRecorder>,
        action: Option<Arc<dyn SyncAction>>,
    ) -> Self {
        let (tx, rx) = ring_channel(cfg.event_capacity.max(1));
        let store = Arc::new(Store::new(store_cfg, tx, recorder));
        let action = action.unwrap_or_else(|| -> Arc<dyn SyncAction> { Arc::new(SnapshotSync::new(Arc::clone(&store))) });
        Self {
            cfg,
            store,
            queue: Arc::new(TaskQueue::new(action)),
            events: Mutex::new(Some(rx)),
            data_plane: Mutex::new(None),
            stopping: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &Arc<Store> { &self.store }
    pub fn queue(&self) -> &Arc<TaskQueue> { &self.queue }
    pub fn cancellation(&self) -> CancellationToken { self.cancel.clone() }
    pub fn is_stopping(&self) -> bool { self.stopping.load(Ordering::SeqCst) }

    fn lock_dp(&self) -> MutexGuard<'_, Option<DataPlane>> { self.data_plane.lock().unwrap_or_else(|e| e.into_inner()) }

    /// Hand out the event receiver. Only the first caller gets it.
    pub fn take_events(&self) -> Result<RingReceiver<Event>, ControllerError> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).take().ok_or(ControllerError::AlreadyStarted)
    }

    /// Sync caches, start the data plane and the queue worker, then dispatch events until
    /// cancellation or until the data plane dies.
    pub async fn start(self: &Arc<Self>, client: Client) -> Result<(), ControllerError> {
        info!("starting bfe ingress controller");
        let events = self.take_events()?;
        self.store.run(client, self.cancel.clone()).await?;
        if self.cancel.is_cancelled() { return Ok(()); }

        let exit = match self.spawn_data_plane() {
            Ok(rx) => rx,
            Err(ControllerError::ShutdownInProgress) => return Ok(()),
            Err(e) => return Err(e),
        };
        tokio::spawn(Arc::clone(&self.queue).run(self.cfg.worker_period, self.cancel.clone()));
        self.dispatch(events, exit).await
    }

    /// Launch `<binary> -c <conf dir>` and return its exit watch.
    pub fn spawn_data_plane(&self) -> Result<watch::Receiver<Option<DataPlaneExit>>, ControllerError> {
        let mut slot = self.lock_dp();
        if self.is_stopping() { return Err(ControllerError::ShutdownInProgress); }
        let dp = DataPlane::spawn(&self.cfg.binary, &self.cfg.conf_dir)?;
        let rx = dp.subscribe();
        *slot = Some(dp);
        Ok(rx)
    }

    /// Event loop: every event enqueues its object; configuration changes also enqueue the
    /// configuration sentinel. An unexpected data-plane exit cancels the workers and drains the
    /// queue before the error is returned.
    pub async fn dispatch(
        &self,
        mut events: RingReceiver<Event>,
        exit: watch::Receiver<Option<DataPlaneExit>>,
    ) -> Result<(), ControllerError> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                out = wait_exit(exit.clone()) => {
                    if self.is_stopping() { return Ok(()); }
                    let abnormal = !out.success;
                    if abnormal {
                        error!(status = %out.status, "data plane exited abnormally");
                    } else {
                        warn!(status = %out.status, "data plane exited");
                    }
                    // let the in-flight sync finish before the runtime goes away
                    self.cancel.cancel();
                    self.queue.shutdown().await;
                    return Err(ControllerError::DataPlaneExited { status: out.status, abnormal });
                }
                ev = events.recv() => match ev {
                    Some(ev) => self.handle_event(ev),
                    None => {
                        warn!("event ring closed");
                        return Ok(());
                    }
                },
            }
        }
    }

    pub fn handle_event(&self, event: Event) {
        if self.is_stopping() { return; }
        debug!(event = %event.kind, kind = %event.object.kind(), key = ?event.object.key(), "event received");
        counter!("controller_events_total", 1u64, "event" => event.kind.to_string());
        if event.kind == EventKind::ConfigurationChanged {
            self.queue.enqueue_task(&dummy_object(CONFIGURATION_SENTINEL));
        }
        self.queue.enqueue_task(&event.object);
    }

    /// Graceful stop. A second call fails.
    pub async fn stop(&self) -> Result<(), ControllerError> {
        if self.stopping.swap(true, Ordering::SeqCst) || self.queue.is_shutting_down() {
            return Err(ControllerError::ShutdownInProgress);
        }
        info!("shutting down controller queues");
        self.cancel.cancel();
        self.queue.shutdown().await;

        let exit = {
            let dp = self.lock_dp();
            match dp.as_ref() {
                Some(dp) => {
                    dp.terminate()?;
                    Some(dp.subscribe())
                }
                None => None,
            }
        };
        if let Some(rx) = exit {
            let out = wait_exit(rx).await;
            info!(status = %out.status, "data plane stopped");
        }
        Ok(())
    }
}
