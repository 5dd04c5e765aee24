//! BFE core types: watch deltas, normalized events and object identity.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

/// Annotation selecting the ingress class of a route.
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// Class served when nothing else is configured.
pub const DEFAULT_CLASS_NAME: &str = "bfe";

/// Fixed identity all configuration changes collapse onto in the work queue.
pub const CONFIGURATION_SENTINEL: &str = "configmap-change";

/// A single watch delivery for one resource kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta<K> {
    Applied(K),
    Deleted(K),
    /// Full snapshot after an initial list or a periodic relist.
    Relisted(Vec<K>),
}

impl<K> Delta<K> {
    pub fn is_relist(&self) -> bool { matches!(self, Delta::Relisted(_)) }
}

/// Build the `namespace/name` cache key (or just `name` for cluster-scoped objects).
pub fn key_of(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name.to_string(),
    }
}

/// Cache key of an object, `None` when the object carries no name.
pub fn meta_key(meta: &ObjectMeta) -> Option<String> {
    let name = meta.name.as_deref().filter(|n| !n.is_empty())?;
    Some(key_of(meta.namespace.as_deref(), name))
}

/// Metadata-only object usable as a queue identity, e.g. the configuration sentinel.
pub fn dummy_object(name: &str) -> ObjectMeta {
    ObjectMeta { name: Some(name.to_string()), ..ObjectMeta::default() }
}

/// Anything the work queue can derive a stable identity from.
pub trait ObjectKey {
    fn object_key(&self) -> Option<String>;
}

impl ObjectKey for ObjectMeta {
    fn object_key(&self) -> Option<String> { meta_key(self) }
}

impl ObjectKey for str {
    fn object_key(&self) -> Option<String> {
        if self.is_empty() { None } else { Some(self.to_string()) }
    }
}

impl ObjectKey for String {
    fn object_key(&self) -> Option<String> { self.as_str().object_key() }
}

/// Kind tag of a watched resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Route,
    Endpoints,
    Service,
    Secret,
    Config,
    Pod,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Route => "ingress",
            ResourceKind::Endpoints => "endpoints",
            ResourceKind::Service => "service",
            ResourceKind::Secret => "secret",
            ResourceKind::Config => "configmap",
            ResourceKind::Pod => "pod",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// One watched object, tagged by kind. Payloads are shared read-only with the caches.
#[derive(Debug, Clone)]
pub enum Resource {
    Route(Arc<Ingress>),
    Endpoints(Arc<Endpoints>),
    Service(Arc<Service>),
    Secret(Arc<Secret>),
    Config(Arc<ConfigMap>),
    Pod(Arc<Pod>),
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Route(_) => ResourceKind::Route,
            Resource::Endpoints(_) => ResourceKind::Endpoints,
            Resource::Service(_) => ResourceKind::Service,
            Resource::Secret(_) => ResourceKind::Secret,
            Resource::Config(_) => ResourceKind::Config,
            Resource::Pod(_) => ResourceKind::Pod,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Resource::Route(o) => &o.metadata,
            Resource::Endpoints(o) => &o.metadata,
            Resource::Service(o) => &o.metadata,
            Resource::Secret(o) => &o.metadata,
            Resource::Config(o) => &o.metadata,
            Resource::Pod(o) => &o.metadata,
        }
    }

    pub fn key(&self) -> Option<String> { meta_key(self.metadata()) }
}

impl ObjectKey for Resource {
    fn object_key(&self) -> Option<String> { self.key() }
}

/// Normalized kind of change emitted by the watch store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Create,
    Update,
    Delete,
    ConfigurationChanged,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Create => "CREATE",
            EventKind::Update => "UPDATE",
            EventKind::Delete => "DELETE",
            EventKind::ConfigurationChanged => "CONFIGURATION",
        };
        f.write_str(s)
    }
}

/// Event envelope consumed by the reconciler.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub object: Resource,
}

impl Event {
    pub fn new(kind: EventKind, object: Resource) -> Self { Self { kind, object } }
}

/// Controller-wide ingress class settings, passed explicitly wherever membership is decided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassConfig {
    /// Class this controller instance serves.
    pub class_name: String,
    /// Class name treated as the cluster default.
    pub default_class: String,
    /// Server supports `networking.k8s.io/v1` ingress classes (>= 1.18).
    pub ingress_v1_ready: bool,
    /// Name of the IngressClass resource owned by this controller, if one was found.
    pub ingress_class: Option<String>,
}

impl Default for ClassConfig {
    fn default() -> Self {
        Self {
            class_name: DEFAULT_CLASS_NAME.to_string(),
            default_class: DEFAULT_CLASS_NAME.to_string(),
            ingress_v1_ready: false,
            ingress_class: None,
        }
    }
}

impl ClassConfig {
    pub fn with_class(class_name: impl Into<String>) -> Self {
        Self { class_name: class_name.into(), ..Self::default() }
    }

    pub fn serves_default(&self) -> bool { self.class_name == self.default_class }
}

/// Identity of the running controller pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
}

impl PodInfo {
    pub fn key(&self) -> String { key_of(Some(&self.namespace), &self.name) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_include_namespace_when_present() {
        let mut meta = dummy_object("web");
        assert_eq!(meta_key(&meta).as_deref(), Some("web"));
        meta.namespace = Some("prod".into());
        assert_eq!(meta_key(&meta).as_deref(), Some("prod/web"));
        meta.name = Some(String::new());
        assert_eq!(meta_key(&meta), None);
    }

    #[test]
    fn resource_key_and_kind() {
        let mut secret = Secret::default();
        secret.metadata = ObjectMeta { name: Some("tls".into()), namespace: Some("default".into()), ..ObjectMeta::default() };
        let r = Resource::Secret(Arc::new(secret));
        assert_eq!(r.kind(), ResourceKind::Secret);
        assert_eq!(r.object_key().as_deref(), Some("default/tls"));
    }

    #[test]
    fn default_class_config_serves_default() {
        assert!(ClassConfig::default().serves_default());
        assert!(!ClassConfig::with_class("other").serves_default());
    }
}
