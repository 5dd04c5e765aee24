//! Field-by-field change detection per kind. Server bookkeeping (resourceVersion,
//! managedFields, timestamps) never counts as a change.

use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

fn same_meta(a: &ObjectMeta, b: &ObjectMeta) -> bool {
    a.name == b.name
        && a.namespace == b.namespace
        && a.uid == b.uid
        && a.labels == b.labels
        && a.annotations == b.annotations
        && a.deletion_timestamp == b.deletion_timestamp
}

pub fn same_route(a: &Ingress, b: &Ingress) -> bool { same_meta(&a.metadata, &b.metadata) && a.spec == b.spec && a.status == b.status }

pub fn same_service(a: &Service, b: &Service) -> bool { same_meta(&a.metadata, &b.metadata) && a.spec == b.spec && a.status == b.status }

/// Only the address topology matters for endpoints.
pub fn same_subsets(a: &Endpoints, b: &Endpoints) -> bool { a.subsets == b.subsets }

pub fn same_config(a: &ConfigMap, b: &ConfigMap) -> bool {
    same_meta(&a.metadata, &b.metadata) && a.data == b.data && a.binary_data == b.binary_data && a.immutable == b.immutable
}

pub fn same_secret(a: &Secret, b: &Secret) -> bool {
    same_meta(&a.metadata, &b.metadata) && a.type_ == b.type_ && a.data == b.data && a.string_data == b.string_data
}

pub fn pod_phase(p: &Pod) -> Option<&str> { p.status.as_ref().and_then(|s| s.phase.as_deref()) }

pub fn same_phase(a: &Pod, b: &Pod) -> bool { pod_phase(a) == pod_phase(b) }
