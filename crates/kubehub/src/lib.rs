//! BFE kubehub – watcher wiring, audit events and cluster discovery

#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::time::Duration;

use bfe_core::{ClassConfig, Delta, PodInfo};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::networking::v1::{Ingress, IngressClass};
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::Api,
    runtime::{
        events::{Event as AuditEvent, EventType, Recorder, Reporter},
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Resource,
};
use metrics::counter;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Component name reported on audit events.
pub const CONTROLLER_NAME: &str = "bfe-ingress-controller";

/// Label selector keeping Helm v2 release config maps out of the caches.
pub const TILLER_FILTER: &str = "OWNER!=TILLER";

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("kube: {0}")]
    Kube(#[from] kube::Error),
    #[error("unable to get POD information (missing POD_NAME or POD_NAMESPACE environment variable)")]
    MissingPodEnv,
    #[error("unable to get POD information for {0}")]
    PodNotFound(String),
}

/// List+watch options shared by every kind.
#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    /// Re-create the watch (full relist) at this period; `None` disables it.
    pub resync: Option<Duration>,
}

impl WatchOptions {
    pub fn filtered(resync: Option<Duration>) -> Self {
        Self { label_selector: Some(TILLER_FILTER.to_string()), field_selector: None, resync }
    }

    fn watcher_config(&self) -> watcher::Config {
        let mut cfg = watcher::Config::default();
        if let Some(l) = self.label_selector.as_deref() { cfg = cfg.labels(l); }
        if let Some(f) = self.field_selector.as_deref() { cfg = cfg.fields(f); }
        cfg
    }
}

/// Api scoped to one namespace, or cluster-wide when `namespace` is `None`.
pub fn scoped_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) if !ns.is_empty() => Api::namespaced(client, ns),
        _ => Api::all(client),
    }
}

/// Run list+watch for one kind and forward deltas until cancelled or the receiver goes away.
///
/// Watch errors are retried with the runtime's default backoff, resuming from the last
/// resource version. Each resync period the watch is re-created, which delivers a fresh
/// `Relisted` snapshot.
pub async fn start_watcher<K>(
    api: Api<K>,
    opts: WatchOptions,
    tx: mpsc::Sender<Delta<K>>,
    cancel: CancellationToken,
) -> Result<(), WatchError>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let kind = K::kind(&()).to_string();
    loop {
        let stream = watcher::watcher(api.clone(), opts.watcher_config()).default_backoff();
        futures::pin_mut!(stream);
        let relist = async {
            match opts.resync {
                Some(period) if !period.is_zero() => tokio::time::sleep(period).await,
                _ => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(relist);
        info!(kind = %kind, "watcher started");
        loop {
            let delta = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(kind = %kind, "watcher stopped");
                    return Ok(());
                }
                _ = &mut relist => {
                    debug!(kind = %kind, "periodic resync; restarting watch");
                    break;
                }
                ev = stream.next() => match ev {
                    Some(Ok(Event::Applied(o))) => Delta::Applied(o),
                    Some(Ok(Event::Deleted(o))) => Delta::Deleted(o),
                    Some(Ok(Event::Restarted(list))) => {
                        debug!(kind = %kind, count = list.len(), "watch restart");
                        Delta::Relisted(list)
                    }
                    Some(Err(e)) => {
                        warn!(kind = %kind, error = %e, "watch error");
                        continue;
                    }
                    None => {
                        warn!(kind = %kind, "watcher stream ended; restarting");
                        break;
                    }
                },
            };
            counter!("watch_deltas_total", 1, "kind" => kind.clone());
            if tx.send(delta).await.is_err() {
                debug!(kind = %kind, "delta receiver closed; watcher exiting");
                return Ok(());
            }
        }
    }
}

/// Sink for human-readable audit events attached to routes.
#[async_trait::async_trait]
pub trait AuditRecorder: Send + Sync {
    async fn record(&self, ingress: &Ingress, reason: &str, note: String);
}

/// Drops every event; used when no API server is around.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

#[async_trait::async_trait]
impl AuditRecorder for NoopRecorder {
    async fn record(&self, _ingress: &Ingress, _reason: &str, _note: String) {}
}

/// Publishes `Normal` events through the Kubernetes events API.
#[derive(Clone)]
pub struct KubeRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeRecorder {
    pub fn new(client: Client, instance: Option<String>) -> Self {
        Self { client, reporter: Reporter { controller: CONTROLLER_NAME.to_string(), instance } }
    }
}

#[async_trait::async_trait]
impl AuditRecorder for KubeRecorder {
    async fn record(&self, ingress: &Ingress, reason: &str, note: String) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), ingress.object_ref(&()));
        let ev = AuditEvent {
            type_: EventType::Normal,
            reason: reason.to_string(),
            note: Some(note),
            action: reason.to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(ev).await {
            warn!(error = %e, reason, "failed to publish audit event");
        }
    }
}

/// Parse `major`/`minor` strings as reported by the version endpoint (`"1"`, `"27+"`).
pub fn parse_version(major: &str, minor: &str) -> Option<(u32, u32)> {
    let digits = |s: &str| s.chars().take_while(|c| c.is_ascii_digit()).collect::<String>().parse::<u32>().ok();
    Some((digits(major)?, digits(minor)?))
}

/// IngressClass resources are served from 1.18 on.
pub fn supports_ingress_class(major: u32, minor: u32) -> bool {
    major > 1 || (major == 1 && minor >= 18)
}

/// Probe the server version and look up the IngressClass named after the configured class.
///
/// Failures degrade to annotation-only class matching rather than aborting startup.
pub async fn discover_class_config(client: Client, class_name: &str) -> ClassConfig {
    let mut cfg = ClassConfig::with_class(class_name);
    let info = match client.apiserver_version().await {
        Ok(info) => info,
        Err(e) => {
            warn!(error = %e, "failed to query server version; assuming no ingress class support");
            return cfg;
        }
    };
    info!(major = %info.major, minor = %info.minor, git = %info.git_version, platform = %info.platform, "running in kubernetes cluster");
    cfg.ingress_v1_ready = parse_version(&info.major, &info.minor)
        .map(|(major, minor)| supports_ingress_class(major, minor))
        .unwrap_or(false);
    if !cfg.ingress_v1_ready {
        return cfg;
    }
    let api: Api<IngressClass> = Api::all(client);
    match api.get_opt(class_name).await {
        Ok(Some(ic)) => {
            info!(class = %class_name, controller = ?ic.spec.as_ref().and_then(|s| s.controller.clone()), "found ingress class");
            cfg.ingress_class = ic.metadata.name;
        }
        Ok(None) => info!(class = %class_name, "no ingress class resource; using annotation matching"),
        Err(e) => warn!(error = %e, class = %class_name, "failed to get ingress class"),
    }
    cfg
}

/// Controller pod identity from `POD_NAME` / `POD_NAMESPACE`.
pub fn pod_info_from_env() -> Result<PodInfo, WatchError> {
    let name = std::env::var("POD_NAME").unwrap_or_default();
    let namespace = std::env::var("POD_NAMESPACE").unwrap_or_default();
    if name.is_empty() || namespace.is_empty() {
        return Err(WatchError::MissingPodEnv);
    }
    Ok(PodInfo { name, namespace })
}

/// Resolve and verify the controller pod against the API server.
pub async fn get_pod_details(client: Client) -> Result<PodInfo, WatchError> {
    let info = pod_info_from_env()?;
    let api: Api<Pod> = Api::namespaced(client, &info.namespace);
    match api.get_opt(&info.name).await? {
        Some(_) => Ok(info),
        None => Err(WatchError::PodNotFound(info.key())),
    }
}

/// Watch options narrowing the pod watch to the controller's own pod.
pub fn pod_watch_options(pod: &PodInfo, resync: Option<Duration>) -> WatchOptions {
    WatchOptions { label_selector: None, field_selector: Some(format!("metadata.name={}", pod.name)), resync }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parsing_strips_suffixes() {
        assert_eq!(parse_version("1", "27+"), Some((1, 27)));
        assert_eq!(parse_version("1", "17"), Some((1, 17)));
        assert_eq!(parse_version("", "17"), None);
    }

    #[test]
    fn ingress_class_support_threshold() {
        assert!(!supports_ingress_class(1, 17));
        assert!(supports_ingress_class(1, 18));
        assert!(supports_ingress_class(2, 0));
    }

    #[test]
    fn filtered_options_exclude_tiller() {
        let o = WatchOptions::filtered(Some(Duration::from_secs(600)));
        assert_eq!(o.label_selector.as_deref(), Some(TILLER_FILTER));
        let pod = PodInfo { name: "bfe-0".into(), namespace: "ingress".into() };
        assert_eq!(pod_watch_options(&pod, None).field_selector.as_deref(), Some("metadata.name=bfe-0"));
    }
}
