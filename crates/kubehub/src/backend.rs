//! Backend seam: the four object verbs against an already-resolved mapping.

use std::fmt;

use kman_core::{Object, Result};

use crate::mapping::RestMapping;

/// A fully addressed object: mapping plus namespace (namespaced kinds only) and name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub mapping: RestMapping,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    /// Build a reference honouring the mapping's scope: cluster-scoped kinds
    /// never carry a namespace, namespaced kinds fall back to `default_ns`.
    pub fn scoped(mapping: RestMapping, namespace: Option<&str>, default_ns: &str, name: impl Into<String>) -> Self {
        let namespace = if mapping.namespaced {
            Some(namespace.filter(|ns| !ns.is_empty()).unwrap_or(default_ns).to_string())
        } else {
            None
        };
        Self { mapping, namespace, name: name.into() }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} {}/{}", self.mapping.api_version(), self.mapping.kind, ns, self.name),
            None => write!(f, "{}/{} {}", self.mapping.api_version(), self.mapping.kind, self.name),
        }
    }
}

#[async_trait::async_trait]
pub trait ResourceBackend: Send + Sync {
    async fn create(&self, target: &ObjectRef, body: &Object, field_manager: &str) -> Result<Object>;
    async fn get(&self, target: &ObjectRef) -> Result<Object>;
    /// JSON merge patch (RFC 7386). A `metadata.resourceVersion` in the patch
    /// is an optimistic-concurrency precondition.
    async fn patch(&self, target: &ObjectRef, patch: &Object, field_manager: &str) -> Result<Object>;
    async fn delete(&self, target: &ObjectRef) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use kman_core::Gvk;

    #[test]
    fn scope_decides_namespace() {
        let cm = RestMapping::new(&Gvk::new("", "v1", "ConfigMap"), "configmaps", true);
        let ns = RestMapping::new(&Gvk::new("", "v1", "Namespace"), "namespaces", false);
        assert_eq!(ObjectRef::scoped(cm.clone(), None, "default", "a").namespace.as_deref(), Some("default"));
        assert_eq!(ObjectRef::scoped(cm.clone(), Some(""), "default", "a").namespace.as_deref(), Some("default"));
        assert_eq!(ObjectRef::scoped(cm, Some("team"), "default", "a").namespace.as_deref(), Some("team"));
        let r = ObjectRef::scoped(ns, Some("team"), "default", "prod");
        assert_eq!(r.namespace, None);
        assert_eq!(r.to_string(), "v1/Namespace prod");
    }
}
