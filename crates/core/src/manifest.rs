//! Manifest decoding: one structured YAML/JSON document into a canonical JSON tree.

use serde_json::{Map, Value as Json};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::gvk::Gvk;

/// Number of JSON nodes in `v`; stops counting once past `limit`.
fn count_nodes(v: &Json, limit: usize) -> usize {
    let mut pending = vec![v];
    let mut seen = 0usize;
    while let Some(node) = pending.pop() {
        seen += 1;
        if seen > limit {
            break;
        }
        match node {
            Json::Object(map) => pending.extend(map.values()),
            Json::Array(items) => pending.extend(items.iter()),
            _ => {}
        }
    }
    seen
}

/// A decoded resource document. Always a mapping carrying `apiVersion`, `kind`
/// and a non-empty `metadata.name`.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    value: Json,
    gvk: Gvk,
}

impl Manifest {
    /// Decode with default limits.
    pub fn decode(raw: &str) -> Result<Self> { Self::decode_with(raw, &EngineConfig::default()) }

    pub fn decode_with(raw: &str, cfg: &EngineConfig) -> Result<Self> {
        if raw.len() > cfg.max_manifest_bytes {
            return Err(Error::parse(format!("manifest too large (>{} bytes)", cfg.max_manifest_bytes)));
        }
        // serde_yaml refuses input with more than one document.
        let val: serde_yaml::Value = serde_yaml::from_str(raw).map_err(|e| Error::parse(format!("parsing manifest: {}", e)))?;
        let json = serde_json::to_value(val).map_err(|e| Error::parse(format!("converting manifest to JSON: {}", e)))?;
        if count_nodes(&json, cfg.max_manifest_nodes) > cfg.max_manifest_nodes {
            return Err(Error::parse(format!("manifest too complex (>{} nodes)", cfg.max_manifest_nodes)));
        }
        let m = Self::from_value(json)?;
        tracing::debug!(gvk = %m.gvk, name = %m.name(), ns = ?m.namespace(), bytes = raw.len(), "manifest decoded");
        Ok(m)
    }

    /// Validate an already-built tree.
    pub fn from_value(value: Json) -> Result<Self> {
        let obj = value.as_object().ok_or_else(|| Error::parse("manifest must be a mapping"))?;
        let api_version = obj.get("apiVersion").and_then(|v| v.as_str()).ok_or_else(|| Error::parse("manifest missing apiVersion"))?;
        let kind = obj.get("kind").and_then(|v| v.as_str()).ok_or_else(|| Error::parse("manifest missing kind"))?;
        let gvk = Gvk::from_api_version(api_version, kind)?;
        let meta = obj.get("metadata").and_then(|m| m.as_object()).ok_or_else(|| Error::parse("manifest missing metadata"))?;
        match meta.get("name").and_then(|v| v.as_str()) {
            Some(n) if !n.is_empty() => {}
            _ => return Err(Error::parse("manifest missing metadata.name")),
        }
        match meta.get("namespace") {
            None | Some(Json::Null) | Some(Json::String(_)) => {}
            Some(_) => return Err(Error::parse("metadata.namespace must be a string")),
        }
        Ok(Self { value, gvk })
    }

    pub fn gvk(&self) -> &Gvk { &self.gvk }

    pub fn api_version(&self) -> String { self.gvk.api_version() }

    pub fn kind(&self) -> &str { &self.gvk.kind }

    pub fn name(&self) -> &str {
        self.value.get("metadata").and_then(|m| m.get("name")).and_then(|v| v.as_str()).unwrap_or_default()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.value
            .get("metadata")
            .and_then(|m| m.get("namespace"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    /// Force `metadata.namespace`; `None` removes it.
    pub fn set_namespace(&mut self, ns: Option<&str>) {
        let Some(meta) = self.value.get_mut("metadata").and_then(|m| m.as_object_mut()) else { return };
        match ns {
            Some(ns) => { meta.insert("namespace".into(), Json::String(ns.to_string())); }
            None => { meta.remove("namespace"); }
        }
    }

    pub fn as_value(&self) -> &Json { &self.value }

    pub fn into_value(self) -> Json { self.value }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(&self.value).map_err(|e| Error::parse(format!("encoding manifest: {}", e)))
    }
}

/// Metadata keys the API server owns.
const SERVER_METADATA: [&str; 6] = ["uid", "resourceVersion", "generation", "creationTimestamp", "managedFields", "selfLink"];

/// Remove server-populated bookkeeping so a live object can seed desired state.
/// `status` goes too, and so does an `annotations` map left empty.
pub fn strip_server_fields(mut v: Json) -> Json {
    let Some(obj) = v.as_object_mut() else { return v };
    obj.remove("status");
    if let Some(meta) = obj.get_mut("metadata").and_then(Json::as_object_mut) {
        meta.retain(|k, val| {
            !SERVER_METADATA.contains(&k.as_str()) && !(k == "annotations" && val.as_object().is_some_and(Map::is_empty))
        });
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_configmap() {
        let m = Manifest::decode("kind: ConfigMap\napiVersion: v1\nmetadata:\n  name: cm1\ndata:\n  foo: bar\n").expect("decode");
        assert_eq!(m.gvk(), &Gvk::new("", "v1", "ConfigMap"));
        assert_eq!(m.name(), "cm1");
        assert_eq!(m.namespace(), None);
        assert_eq!(m.as_value()["data"]["foo"], "bar");
    }

    #[test]
    fn keeps_numeric_and_string_scalars_apart() {
        let m = Manifest::decode(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: p\ndata:\n  quoted: \"8080\"\n  bare: 8080\n",
        )
        .expect("decode");
        assert_eq!(m.as_value()["data"]["quoted"], Json::String("8080".into()));
        assert_eq!(m.as_value()["data"]["bare"], serde_json::json!(8080));
        assert_ne!(m.as_value()["data"]["quoted"], m.as_value()["data"]["bare"]);
    }

    #[test]
    fn preserves_key_order() {
        let m = Manifest::decode("kind: Secret\napiVersion: v1\nmetadata:\n  name: s\nstringData:\n  zeta: 1\n  alpha: 2\n").expect("decode");
        let keys: Vec<_> = m.as_value().as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["kind", "apiVersion", "metadata", "stringData"]);
        let inner: Vec<_> = m.as_value()["stringData"].as_object().unwrap().keys().cloned().collect();
        assert_eq!(inner, vec!["zeta", "alpha"]);
    }

    #[test]
    fn errors_name_the_missing_key() {
        let e1 = Manifest::decode("kind: Foo\nmetadata:\n  name: x\n").unwrap_err().to_string();
        assert!(e1.contains("missing apiVersion"), "e1={}", e1);
        let e2 = Manifest::decode("apiVersion: v1\nmetadata:\n  name: x\n").unwrap_err().to_string();
        assert!(e2.contains("missing kind"), "e2={}", e2);
        let e3 = Manifest::decode("apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n").unwrap_err().to_string();
        assert!(e3.contains("missing metadata.name"), "e3={}", e3);
    }

    #[test]
    fn rejects_malformed_and_multi_document_input() {
        assert!(matches!(Manifest::decode("kind: [unclosed"), Err(Error::Parse(_))));
        assert!(matches!(Manifest::decode("- a\n- b\n"), Err(Error::Parse(_))));
        assert!(matches!(Manifest::decode(""), Err(Error::Parse(_))));
        let two = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: b\n";
        assert!(matches!(Manifest::decode(two), Err(Error::Parse(_))));
    }

    #[test]
    fn enforces_size_budgets() {
        let cfg = EngineConfig { max_manifest_bytes: 16, ..Default::default() };
        assert!(Manifest::decode_with("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n", &cfg).is_err());
        let cfg = EngineConfig { max_manifest_nodes: 4, ..Default::default() };
        let err = Manifest::decode_with("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\ndata:\n  k: v\n", &cfg).unwrap_err();
        assert!(err.to_string().contains("too complex"));
        assert_eq!(count_nodes(&serde_json::json!({"a": [1, 2], "b": null}), 100), 5);
        assert_eq!(count_nodes(&serde_json::json!({"a": [1, 2], "b": null}), 2), 3);
    }

    #[test]
    fn live_object_sheds_server_bookkeeping() {
        let live = serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "web",
                "namespace": "shop",
                "labels": {"app": "web"},
                "annotations": {},
                "uid": "3f6d2a10-9c1b-4e0a-8d55-1b2f3c4d5e6f",
                "resourceVersion": "48213",
                "generation": 3,
                "creationTimestamp": "2024-05-02T08:15:00Z",
                "managedFields": [{"manager": "kubectl", "operation": "Update"}]
            },
            "spec": {"replicas": 2},
            "status": {"readyReplicas": 2}
        });
        let desired = strip_server_fields(live);
        let meta_keys: Vec<_> = desired["metadata"].as_object().unwrap().keys().cloned().collect();
        assert_eq!(meta_keys, vec!["name", "namespace", "labels"]);
        assert!(desired.get("status").is_none());
        assert_eq!(desired["spec"]["replicas"], 2);
    }
}
