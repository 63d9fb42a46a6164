//! In-memory cluster: serves discovery and object storage with API server
//! semantics (uid, resourceVersion, conflicts, merge patch). Used by tests and
//! offline dry runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use kman_core::{ApiStatus, Error, GroupVersion, Gvk, Object, ResourceIdentity, Result};
use rustc_hash::FxHashMap;
use serde_json::{json, Map, Value as Json};
use tracing::debug;

use crate::backend::{ObjectRef, ResourceBackend};
use crate::mapping::{DiscoverySource, RestMapping};

#[derive(Default)]
struct State {
    kinds: FxHashMap<GroupVersion, Vec<RestMapping>>,
    objects: BTreeMap<String, Object>,
    resource_version: u64,
}

#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
    discovery_calls: AtomicUsize,
    discovery_delay_ms: AtomicU32,
    pending_conflicts: AtomicU32,
}

const SERVER_DEFAULT_NAMESPACE: &str = "default";

fn key(target: &ObjectRef) -> String {
    format!(
        "{}/{}/{}/{}",
        target.mapping.api_version(),
        target.mapping.plural,
        target.namespace.as_deref().unwrap_or(""),
        target.name
    )
}

fn status(code: u16, reason: &str, message: String) -> ApiStatus { ApiStatus::new(code, reason, message) }

/// Apply an RFC 7386 JSON merge patch in place.
pub fn merge_patch(target: &mut Json, patch: &Json) {
    let Json::Object(p) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Json::Object(Map::new());
    }
    if let Json::Object(t) = target {
        for (k, v) in p {
            if v.is_null() {
                t.remove(k);
            } else {
                merge_patch(t.entry(k.clone()).or_insert(Json::Null), v);
            }
        }
    }
}

impl MemoryCluster {
    pub fn new() -> Self { Self::default() }

    /// Cluster serving the core and apps kinds most manifests use.
    pub fn with_builtin_kinds() -> Self {
        let c = Self::new();
        for (api_version, kind, plural, namespaced) in [
            ("v1", "ConfigMap", "configmaps", true),
            ("v1", "Secret", "secrets", true),
            ("v1", "Service", "services", true),
            ("v1", "Pod", "pods", true),
            ("v1", "PersistentVolumeClaim", "persistentvolumeclaims", true),
            ("v1", "ServiceAccount", "serviceaccounts", true),
            ("v1", "Namespace", "namespaces", false),
            ("v1", "PersistentVolume", "persistentvolumes", false),
            ("apps/v1", "Deployment", "deployments", true),
            ("apps/v1", "StatefulSet", "statefulsets", true),
            ("apps/v1", "DaemonSet", "daemonsets", true),
            ("batch/v1", "Job", "jobs", true),
            ("networking.k8s.io/v1", "Ingress", "ingresses", true),
            ("rbac.authorization.k8s.io/v1", "ClusterRole", "clusterroles", false),
        ] {
            if let Ok(gvk) = Gvk::from_api_version(api_version, kind) {
                c.install(RestMapping::new(&gvk, plural, namespaced));
            }
        }
        c
    }

    /// Start serving a kind, as a CRD install would.
    pub fn install(&self, mapping: RestMapping) {
        let gv = mapping.gvk().group_version();
        let mut st = self.lock();
        let list = st.kinds.entry(gv).or_default();
        list.retain(|m| m.kind != mapping.kind);
        list.push(mapping);
    }

    pub fn discovery_calls(&self) -> usize { self.discovery_calls.load(Ordering::SeqCst) }

    /// Slow discovery down, to widen race windows in tests.
    pub fn set_discovery_delay(&self, delay: Duration) {
        self.discovery_delay_ms.store(delay.as_millis().min(u32::MAX as u128) as u32, Ordering::SeqCst);
    }

    /// Fail the next `n` patches with 409 Conflict.
    pub fn inject_conflicts(&self, n: u32) { self.pending_conflicts.store(n, Ordering::SeqCst); }

    pub fn len(&self) -> usize { self.lock().objects.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Stored object for `id`, if any.
    pub fn object(&self, id: &ResourceIdentity) -> Option<Object> {
        let st = self.lock();
        let target = Self::locate(&st, id)?;
        st.objects.get(&key(&target)).cloned()
    }

    /// Mutate a stored object out of band (controllers writing status, another
    /// client racing us). Bumps resourceVersion. Returns false when absent.
    pub fn modify(&self, id: &ResourceIdentity, f: impl FnOnce(&mut Object)) -> bool {
        let mut st = self.lock();
        let Some(target) = Self::locate(&st, id) else { return false };
        st.resource_version += 1;
        let rv = st.resource_version;
        let Some(obj) = st.objects.get_mut(&key(&target)) else { return false };
        f(obj);
        obj["metadata"]["resourceVersion"] = Json::String(rv.to_string());
        true
    }

    /// Replace `status` wholesale.
    pub fn set_status(&self, id: &ResourceIdentity, status: Object) -> bool {
        self.modify(id, |obj| {
            if let Some(map) = obj.as_object_mut() {
                map.insert("status".into(), status);
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // a panicking test thread must not wedge the others
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn locate(st: &State, id: &ResourceIdentity) -> Option<ObjectRef> {
        let gv = id.gvk().ok()?.group_version();
        let mapping = st.kinds.get(&gv)?.iter().find(|m| m.kind == id.kind)?.clone();
        Some(ObjectRef::scoped(mapping, id.namespace(), SERVER_DEFAULT_NAMESPACE, id.name.as_str()))
    }

    fn next_rv(st: &mut State) -> String {
        st.resource_version += 1;
        st.resource_version.to_string()
    }
}

#[async_trait::async_trait]
impl DiscoverySource for MemoryCluster {
    async fn discover(&self, gv: &GroupVersion) -> Result<Vec<RestMapping>> {
        self.discovery_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.discovery_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(u64::from(delay))).await;
        }
        let st = self.lock();
        match st.kinds.get(gv) {
            Some(list) => Ok(list.clone()),
            None => Err(Error::from_status(
                gv.api_version(),
                status(404, "NotFound", format!("the server could not find the requested resource ({})", gv)),
            )),
        }
    }
}

#[async_trait::async_trait]
impl ResourceBackend for MemoryCluster {
    async fn create(&self, target: &ObjectRef, body: &Object, field_manager: &str) -> Result<Object> {
        let mut st = self.lock();
        let k = key(target);
        if st.objects.contains_key(&k) {
            let reason = format!("{} \"{}\" already exists", target.mapping.plural, target.name);
            return Err(Error::from_status(target.to_string(), status(409, "AlreadyExists", reason)));
        }
        let mut obj = body.clone();
        if !obj.get("metadata").map(Json::is_object).unwrap_or(false) {
            return Err(Error::Invalid(format!("{}: metadata must be a mapping", target)));
        }
        let rv = Self::next_rv(&mut st);
        let meta = &mut obj["metadata"];
        match target.namespace.as_deref() {
            Some(ns) => meta["namespace"] = Json::String(ns.to_string()),
            None => {
                if let Some(m) = meta.as_object_mut() {
                    m.remove("namespace");
                }
            }
        }
        meta["uid"] = Json::String(uuid::Uuid::new_v4().to_string());
        meta["resourceVersion"] = Json::String(rv);
        meta["generation"] = json!(1);
        meta["creationTimestamp"] = Json::String(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true));
        meta["managedFields"] = json!([{ "manager": field_manager, "operation": "Update" }]);
        if let Some(m) = obj.as_object_mut() {
            m.remove("status");
        }
        debug!(target = %target, "memory create");
        st.objects.insert(k, obj.clone());
        Ok(obj)
    }

    async fn get(&self, target: &ObjectRef) -> Result<Object> {
        let st = self.lock();
        st.objects.get(&key(target)).cloned().ok_or_else(|| {
            Error::from_status(target.to_string(), status(404, "NotFound", format!("{} \"{}\" not found", target.mapping.plural, target.name)))
        })
    }

    async fn patch(&self, target: &ObjectRef, patch: &Object, field_manager: &str) -> Result<Object> {
        let mut st = self.lock();
        let k = key(target);
        let Some(current) = st.objects.get(&k).cloned() else {
            return Err(Error::from_status(
                target.to_string(),
                status(404, "NotFound", format!("{} \"{}\" not found", target.mapping.plural, target.name)),
            ));
        };
        let conflict = || {
            Error::from_status(
                target.to_string(),
                status(409, "Conflict", "the object has been modified; please apply your changes to the latest version".into()),
            )
        };
        if self.pending_conflicts.load(Ordering::SeqCst) > 0 {
            self.pending_conflicts.fetch_sub(1, Ordering::SeqCst);
            return Err(conflict());
        }
        let precondition = patch.pointer("/metadata/resourceVersion").and_then(Json::as_str);
        let live_rv = current.pointer("/metadata/resourceVersion").and_then(Json::as_str);
        if precondition.is_some() && precondition != live_rv {
            return Err(conflict());
        }

        let mut next = current.clone();
        merge_patch(&mut next, patch);
        // identity and server bookkeeping are not patchable
        for field in ["name", "namespace", "uid", "creationTimestamp", "generation"] {
            match current["metadata"].get(field) {
                Some(v) => next["metadata"][field] = v.clone(),
                None => {
                    if let Some(m) = next["metadata"].as_object_mut() {
                        m.remove(field);
                    }
                }
            }
        }
        if current.get("spec") != next.get("spec") {
            let generation = current.pointer("/metadata/generation").and_then(Json::as_i64).unwrap_or(0);
            next["metadata"]["generation"] = json!(generation + 1);
        }
        next["metadata"]["resourceVersion"] = Json::String(Self::next_rv(&mut st));
        next["metadata"]["managedFields"] = json!([{ "manager": field_manager, "operation": "Update" }]);
        debug!(target = %target, "memory patch");
        st.objects.insert(k, next.clone());
        Ok(next)
    }

    async fn delete(&self, target: &ObjectRef) -> Result<()> {
        let mut st = self.lock();
        match st.objects.remove(&key(target)) {
            Some(_) => Ok(()),
            None => Err(Error::from_status(
                target.to_string(),
                status(404, "NotFound", format!("{} \"{}\" not found", target.mapping.plural, target.name)),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cm_ref(name: &str) -> ObjectRef {
        ObjectRef {
            mapping: RestMapping::new(&Gvk::new("", "v1", "ConfigMap"), "configmaps", true),
            namespace: Some("default".into()),
            name: name.into(),
        }
    }

    fn cm(name: &str) -> Object {
        json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name}, "data": {"a": "1"}})
    }

    #[test]
    fn merge_patch_follows_rfc7386() {
        let mut doc = json!({"a": "b", "c": {"d": "e", "f": "g"}, "l": [1, 2]});
        merge_patch(&mut doc, &json!({"a": "z", "c": {"f": null}, "l": [3]}));
        assert_eq!(doc, json!({"a": "z", "c": {"d": "e"}, "l": [3]}));
        let mut scalar = json!("x");
        merge_patch(&mut scalar, &json!({"k": {"n": null, "m": 1}}));
        assert_eq!(scalar, json!({"k": {"m": 1}}));
    }

    #[tokio::test]
    async fn create_stamps_server_fields_and_rejects_duplicates() {
        let c = MemoryCluster::with_builtin_kinds();
        let live = c.create(&cm_ref("a"), &cm("a"), "kman").await.expect("create");
        assert_eq!(live["metadata"]["namespace"], "default");
        assert!(live["metadata"]["uid"].as_str().is_some());
        assert_eq!(live["metadata"]["resourceVersion"], "1");
        let err = c.create(&cm_ref("a"), &cm("a"), "kman").await.unwrap_err();
        assert!(err.is_already_exists(), "{err}");
        assert_eq!(c.len(), 1);
    }

    #[tokio::test]
    async fn patch_enforces_resource_version_precondition() {
        let c = MemoryCluster::with_builtin_kinds();
        c.create(&cm_ref("a"), &cm("a"), "kman").await.expect("create");
        let stale = json!({"metadata": {"resourceVersion": "0"}, "data": {"a": "2"}});
        assert!(c.patch(&cm_ref("a"), &stale, "kman").await.unwrap_err().is_conflict());
        let fresh = json!({"metadata": {"resourceVersion": "1"}, "data": {"a": "2"}});
        let live = c.patch(&cm_ref("a"), &fresh, "kman").await.expect("patch");
        assert_eq!(live["data"]["a"], "2");
        assert_eq!(live["metadata"]["resourceVersion"], "2");
    }

    #[tokio::test]
    async fn injected_conflicts_are_consumed() {
        let c = MemoryCluster::with_builtin_kinds();
        c.create(&cm_ref("a"), &cm("a"), "kman").await.expect("create");
        c.inject_conflicts(1);
        let p = json!({"data": {"b": "x"}});
        assert!(c.patch(&cm_ref("a"), &p, "kman").await.unwrap_err().is_conflict());
        assert!(c.patch(&cm_ref("a"), &p, "kman").await.is_ok());
    }

    #[tokio::test]
    async fn discovery_of_unknown_group_is_not_found() {
        let c = MemoryCluster::with_builtin_kinds();
        let err = c.discover(&GroupVersion { group: "example.com".into(), version: "v1".into() }).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(c.discovery_calls(), 1);
    }

    #[tokio::test]
    async fn modify_bumps_resource_version() {
        let c = MemoryCluster::with_builtin_kinds();
        c.create(&cm_ref("a"), &cm("a"), "kman").await.expect("create");
        let id = ResourceIdentity::new(Some("default"), "v1", "ConfigMap", "a");
        assert!(c.set_status(&id, json!({"phase": "Active"})));
        let obj = c.object(&id).expect("stored");
        assert_eq!(obj["status"]["phase"], "Active");
        // an empty namespace addresses the server default
        assert_eq!(c.object(&ResourceIdentity::new(None, "v1", "ConfigMap", "a")), Some(obj.clone()));
        assert_eq!(obj["metadata"]["resourceVersion"], "2");
        assert!(c.delete(&cm_ref("a")).await.is_ok());
        assert!(c.delete(&cm_ref("a")).await.unwrap_err().is_not_found());
    }
}
