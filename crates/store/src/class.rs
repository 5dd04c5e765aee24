//! Route helpers: ingress class membership, path type defaulting, secret references.

use bfe_core::{key_of, ClassConfig, INGRESS_CLASS_ANNOTATION};
use k8s_openapi::api::networking::v1::Ingress;

const PATH_TYPE_PREFIX: &str = "Prefix";
const PATH_TYPE_IMPLEMENTATION_SPECIFIC: &str = "ImplementationSpecific";

/// Whether `ing` belongs to the class this controller serves.
///
/// The class annotation wins when present (an empty value means the default class). Without it,
/// an IngressClass resource decides on clusters that support one; otherwise only the default
/// class controller picks the route up.
pub fn is_valid(ing: &Ingress, cfg: &ClassConfig) -> bool {
    let annotation = ing.metadata.annotations.as_ref().and_then(|a| a.get(INGRESS_CLASS_ANNOTATION));
    if let Some(class) = annotation {
        if class.is_empty() && cfg.serves_default() { return true; }
        return *class == cfg.class_name;
    }
    if !cfg.ingress_v1_ready { return cfg.serves_default(); }
    match &cfg.ingress_class {
        None => cfg.serves_default(),
        Some(name) => ing.spec.as_ref().and_then(|s| s.ingress_class_name.as_deref()) == Some(name.as_str()),
    }
}

/// Default unset and `ImplementationSpecific` path types to `Prefix`.
pub fn default_path_types(ing: &mut Ingress) {
    let Some(spec) = ing.spec.as_mut() else { return };
    for rule in spec.rules.iter_mut().flatten() {
        let Some(http) = rule.http.as_mut() else { continue };
        for path in http.paths.iter_mut() {
            if path.path_type.is_empty() || path.path_type == PATH_TYPE_IMPLEMENTATION_SPECIFIC {
                path.path_type = PATH_TYPE_PREFIX.to_string();
            }
        }
    }
}

/// `namespace/secret` keys named by the route's TLS section.
pub fn secret_refs(ing: &Ingress) -> Vec<String> {
    let ns = ing.metadata.namespace.as_deref();
    ing.spec
        .as_ref()
        .and_then(|s| s.tls.as_ref())
        .map(|tls| {
            tls.iter()
                .filter_map(|t| t.secret_name.as_deref())
                .filter(|n| !n.is_empty())
                .map(|n| key_of(ns, n))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, IngressBackend, IngressRule, IngressSpec, IngressTLS,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn route(annotation: Option<&str>, class_name: Option<&str>) -> Ingress {
        let annotations = annotation.map(|a| [(INGRESS_CLASS_ANNOTATION.to_string(), a.to_string())].into());
        Ingress {
            metadata: ObjectMeta { name: Some("r".into()), namespace: Some("ns".into()), annotations, ..Default::default() },
            spec: Some(IngressSpec { ingress_class_name: class_name.map(str::to_string), ..Default::default() }),
            status: None,
        }
    }

    #[test]
    fn membership_table() {
        let bfe = ClassConfig::default();
        assert!(is_valid(&route(None, None), &bfe));
        assert!(!is_valid(&route(Some("other"), None), &bfe));
        assert!(is_valid(&route(Some(""), None), &bfe));
        assert!(is_valid(&route(Some("bfe"), None), &bfe));

        let custom = ClassConfig::with_class("internal");
        assert!(!is_valid(&route(None, None), &custom));
        assert!(!is_valid(&route(Some(""), None), &custom));
        assert!(is_valid(&route(Some("internal"), None), &custom));
    }

    #[test]
    fn ingress_class_resource_decides_without_annotation() {
        let cfg = ClassConfig { ingress_v1_ready: true, ingress_class: Some("bfe".into()), ..ClassConfig::default() };
        assert!(is_valid(&route(None, Some("bfe")), &cfg));
        assert!(!is_valid(&route(None, Some("nginx")), &cfg));
        assert!(!is_valid(&route(None, None), &cfg));
        // annotation still wins
        assert!(is_valid(&route(Some("bfe"), Some("nginx")), &cfg));

        let no_class = ClassConfig { ingress_v1_ready: true, ..ClassConfig::default() };
        assert!(is_valid(&route(None, Some("anything")), &no_class));
    }

    #[test]
    fn path_types_default_to_prefix() {
        let path = |t: &str| HTTPIngressPath {
            path: Some("/".into()),
            path_type: t.to_string(),
            backend: IngressBackend::default(),
        };
        let mut ing = route(None, None);
        ing.spec.as_mut().unwrap().rules = Some(vec![IngressRule {
            host: Some("a.example".into()),
            http: Some(HTTPIngressRuleValue { paths: vec![path(""), path("ImplementationSpecific"), path("Exact")] }),
        }]);
        default_path_types(&mut ing);
        let types: Vec<_> = ing.spec.unwrap().rules.unwrap()[0].http.as_ref().unwrap().paths.iter().map(|p| p.path_type.clone()).collect();
        assert_eq!(types, vec!["Prefix", "Prefix", "Exact"]);
    }

    #[test]
    fn tls_secret_refs_are_namespaced() {
        let mut ing = route(None, None);
        ing.spec.as_mut().unwrap().tls = Some(vec![
            IngressTLS { hosts: None, secret_name: Some("a".into()) },
            IngressTLS { hosts: None, secret_name: Some(String::new()) },
            IngressTLS { hosts: None, secret_name: None },
        ]);
        assert_eq!(secret_refs(&ing), vec!["ns/a"]);
    }
}
