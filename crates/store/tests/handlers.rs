#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use bfe_core::{ClassConfig, Delta, Event, EventKind, ResourceKind, INGRESS_CLASS_ANNOTATION};
use bfe_kubehub::AuditRecorder;
use bfe_store::certs::CertConfig;
use bfe_store::ring::{ring_channel, RingReceiver};
use bfe_store::{Store, StoreConfig};
use k8s_openapi::api::core::v1::{ConfigMap, EndpointAddress, EndpointSubset, Endpoints, Secret, Service, ServiceSpec};
use k8s_openapi::api::networking::v1::{Ingress, IngressSpec, IngressTLS};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::ByteString;
use rcgen::{CertificateParams, DnType, KeyPair};

#[derive(Default)]
struct Recorded(Mutex<Vec<String>>);

#[async_trait::async_trait]
impl AuditRecorder for Recorded {
    async fn record(&self, _ingress: &Ingress, reason: &str, note: String) {
        self.0.lock().unwrap().push(format!("{reason} {note}"));
    }
}

struct Harness {
    store: Arc<Store>,
    rx: RingReceiver<Event>,
    audit: Arc<Recorded>,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn new(class: ClassConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = ring_channel(64);
        let audit = Arc::new(Recorded::default());
        let cfg = StoreConfig {
            class,
            certs: CertConfig { ssl_dir: dir.path().to_path_buf(), ..CertConfig::default() },
            ..StoreConfig::default()
        };
        let store = Arc::new(Store::new(cfg, tx, audit.clone()));
        Self { store, rx, audit, _dir: dir }
    }

    fn drain(&mut self) -> Vec<(EventKind, ResourceKind, String)> {
        std::iter::from_fn(|| self.rx.try_recv())
            .map(|e| (e.kind, e.object.kind(), e.object.key().unwrap_or_default()))
            .collect()
    }

    /// Audit records published so far, once spawned recorder tasks had a chance to run.
    async fn audit(&self) -> Vec<String> {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        self.audit.0.lock().unwrap().clone()
    }
}

fn meta(name: &str) -> ObjectMeta {
    ObjectMeta { name: Some(name.into()), namespace: Some("default".into()), ..Default::default() }
}

fn route(name: &str, tls_secret: Option<&str>) -> Ingress {
    let tls = tls_secret.map(|s| vec![IngressTLS { hosts: Some(vec!["a.example".into()]), secret_name: Some(s.into()) }]);
    Ingress { metadata: meta(name), spec: Some(IngressSpec { tls, ..Default::default() }), status: None }
}

fn tls_secret(name: &str, cn: &str) -> Secret {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(vec![cn.to_string()]).unwrap();
    params.distinguished_name.push(DnType::CommonName, cn);
    let cert = params.self_signed(&key).unwrap();
    let data = [
        ("tls.crt".to_string(), ByteString(cert.pem().into_bytes())),
        ("tls.key".to_string(), ByteString(key.serialize_pem().into_bytes())),
    ];
    Secret { metadata: meta(name), data: Some(data.into()), type_: Some("kubernetes.io/tls".into()), ..Default::default() }
}

#[tokio::test]
async fn route_and_secret_lifecycle() {
    let mut h = Harness::new(ClassConfig::default());

    // route first, secret not there yet
    h.store.apply_route(Delta::Applied(route("a", Some("s")))).await;
    assert_eq!(h.drain(), vec![(EventKind::Create, ResourceKind::Route, "default/a".to_string())]);
    assert!(h.store.get_local_cert("default/s").is_err());
    assert_eq!(h.store.reference_index().reference("default/s"), vec!["default/a"]);

    // secret arrives: record created, resync event emitted
    h.store.apply_secret(Delta::Applied(tls_secret("s", "a.example"))).await;
    assert_eq!(h.drain(), vec![(EventKind::Create, ResourceKind::Secret, "default/s".to_string())]);
    let rec = h.store.get_local_cert("default/s").unwrap();
    assert!(rec.common_names.contains("a.example"));

    // route drops its TLS block
    h.store.apply_route(Delta::Applied(route("a", None))).await;
    assert_eq!(h.drain(), vec![(EventKind::Update, ResourceKind::Route, "default/a".to_string())]);
    assert!(h.store.reference_index().reference("default/s").is_empty());

    // unreferenced secret deleted: silent
    h.store.apply_secret(Delta::Deleted(tls_secret("s", "a.example"))).await;
    assert!(h.drain().is_empty());
    assert!(h.store.get_local_cert("default/s").is_err());

    assert_eq!(h.audit().await, vec!["CREATE Ingress default/a", "UPDATE Ingress default/a"]);
}

#[tokio::test]
async fn referenced_secret_update_and_delete_emit() {
    let mut h = Harness::new(ClassConfig::default());
    h.store.apply_secret(Delta::Applied(tls_secret("s", "a.example"))).await;
    assert!(h.drain().is_empty(), "unreferenced secrets produce no work");

    h.store.apply_route(Delta::Applied(route("a", Some("s")))).await;
    assert_eq!(h.drain().len(), 1);
    let first = h.store.get_local_cert("default/s").unwrap();

    h.store.apply_secret(Delta::Applied(tls_secret("s", "b.example"))).await;
    assert_eq!(h.drain(), vec![(EventKind::Update, ResourceKind::Secret, "default/s".to_string())]);
    let second = h.store.get_local_cert("default/s").unwrap();
    assert_ne!(first, second);
    assert!(second.common_names.contains("b.example"));

    h.store.apply_secret(Delta::Deleted(tls_secret("s", "b.example"))).await;
    assert_eq!(h.drain(), vec![(EventKind::Delete, ResourceKind::Secret, "default/s".to_string())]);
}

#[tokio::test]
async fn invalid_secret_keeps_previous_record() {
    let mut h = Harness::new(ClassConfig::default());
    h.store.apply_route(Delta::Applied(route("a", Some("s")))).await;
    h.store.apply_secret(Delta::Applied(tls_secret("s", "a.example"))).await;
    let good = h.store.get_local_cert("default/s").unwrap();
    h.drain();

    let mut broken = tls_secret("s", "a.example");
    broken.data.as_mut().unwrap().insert("tls.key".into(), ByteString(b"junk".to_vec()));
    h.store.apply_secret(Delta::Applied(broken)).await;
    assert_eq!(h.drain().len(), 1);
    assert_eq!(h.store.get_local_cert("default/s").unwrap(), good);
}

#[tokio::test]
async fn class_transitions() {
    let mut h = Harness::new(ClassConfig::default());
    let mut other = route("b", None);
    other.metadata.annotations = Some([(INGRESS_CLASS_ANNOTATION.to_string(), "nginx".to_string())].into());

    h.store.apply_route(Delta::Applied(other.clone())).await;
    assert!(h.drain().is_empty());
    assert!(h.store.get_route("default/b").is_ok(), "non-members are still cached");

    // not-member -> member
    h.store.apply_route(Delta::Applied(route("b", None))).await;
    assert_eq!(h.drain(), vec![(EventKind::Update, ResourceKind::Route, "default/b".to_string())]);

    // identical delivery is a no-op
    h.store.apply_route(Delta::Applied(route("b", None))).await;
    assert!(h.drain().is_empty());

    // member -> not-member
    h.store.apply_route(Delta::Applied(other.clone())).await;
    assert_eq!(h.drain(), vec![(EventKind::Delete, ResourceKind::Route, "default/b".to_string())]);

    h.store.apply_route(Delta::Deleted(other)).await;
    assert!(h.drain().is_empty());
    assert_eq!(h.audit().await, vec!["CREATE Ingress default/b", "DELETE Ingress default/b"]);
}

#[tokio::test]
async fn dependency_kinds_filter_noise() {
    let mut h = Harness::new(ClassConfig::default());

    let svc = Service { metadata: meta("svc"), spec: Some(ServiceSpec::default()), status: None };
    h.store.apply_service(Delta::Applied(svc.clone())).await;
    assert!(h.drain().is_empty(), "service adds are silent");
    let mut changed = svc.clone();
    changed.spec.as_mut().unwrap().cluster_ip = Some("10.0.0.9".into());
    h.store.apply_service(Delta::Applied(changed.clone())).await;
    assert_eq!(h.drain(), vec![(EventKind::Update, ResourceKind::Service, "default/svc".to_string())]);
    h.store.apply_service(Delta::Deleted(changed)).await;
    assert!(h.drain().is_empty());

    let subset = |ip: &str| {
        Some(vec![EndpointSubset { addresses: Some(vec![EndpointAddress { ip: ip.into(), ..Default::default() }]), ..Default::default() }])
    };
    let ep = Endpoints { metadata: meta("svc"), subsets: subset("10.1.0.1") };
    h.store.apply_endpoints(Delta::Applied(ep.clone())).await;
    let mut relabeled = ep.clone();
    relabeled.metadata.resource_version = Some("7".into());
    h.store.apply_endpoints(Delta::Applied(relabeled)).await;
    let mut moved = ep.clone();
    moved.subsets = subset("10.1.0.2");
    h.store.apply_endpoints(Delta::Applied(moved)).await;
    assert_eq!(
        h.drain(),
        vec![
            (EventKind::Create, ResourceKind::Endpoints, "default/svc".to_string()),
            (EventKind::Update, ResourceKind::Endpoints, "default/svc".to_string()),
        ]
    );

    let cm = ConfigMap { metadata: meta("bfe"), data: Some([("k".to_string(), "v".to_string())].into()), ..Default::default() };
    h.store.apply_config_map(Delta::Applied(cm.clone())).await;
    h.store.apply_config_map(Delta::Applied(cm.clone())).await;
    h.store.apply_config_map(Delta::Deleted(cm)).await;
    assert_eq!(h.drain(), vec![(EventKind::ConfigurationChanged, ResourceKind::Config, "default/bfe".to_string())]);
}

#[tokio::test]
async fn relist_synthesizes_deletes() {
    let mut h = Harness::new(ClassConfig::default());
    h.store.apply_route(Delta::Relisted(vec![route("a", None), route("b", None)])).await;
    assert_eq!(h.drain().len(), 2);
    h.store.apply_route(Delta::Relisted(vec![route("b", None)])).await;
    assert_eq!(h.drain(), vec![(EventKind::Delete, ResourceKind::Route, "default/a".to_string())]);
}

#[tokio::test]
async fn routes_list_oldest_first() {
    let h = Harness::new(ClassConfig::default());
    let at = |name: &str, secs: i64| {
        let mut r = route(name, None);
        r.metadata.creation_timestamp = Some(Time(chrono::DateTime::from_timestamp(secs, 0).unwrap()));
        r
    };
    h.store.apply_route(Delta::Relisted(vec![at("late", 300), at("b", 100), at("a", 100), at("early", 50)])).await;
    let names: Vec<String> = h.store.list_routes(|_| true).iter().map(|r| r.metadata.name.clone().unwrap()).collect();
    assert_eq!(names, vec!["early", "b", "a", "late"]);

    let filtered = h.store.list_routes(|r| r.metadata.name.as_deref() != Some("late"));
    assert_eq!(filtered.len(), 3);
}

struct Stalled;

#[async_trait::async_trait]
impl AuditRecorder for Stalled {
    async fn record(&self, _ingress: &Ingress, _reason: &str, _note: String) {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
    }
}

#[tokio::test]
async fn slow_audit_does_not_hold_route_handlers() {
    let (tx, mut rx) = ring_channel(8);
    let store = Store::new(StoreConfig::default(), tx, Arc::new(Stalled));
    let applied = tokio::time::timeout(std::time::Duration::from_secs(2), store.apply_route(Delta::Applied(route("a", None))));
    assert!(applied.await.is_ok(), "route add waited on the audit recorder");
    let ev = rx.try_recv().unwrap();
    assert_eq!((ev.kind, ev.object.kind()), (EventKind::Create, ResourceKind::Route));
}

#[tokio::test]
async fn deleting_unseen_route_is_silent() {
    let mut h = Harness::new(ClassConfig::default());
    h.store.apply_route(Delta::Deleted(route("ghost", None))).await;
    assert!(h.drain().is_empty());
    assert!(h.audit().await.is_empty());
}
