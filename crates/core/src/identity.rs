//! Resource identity and its persisted string form.
//!
//! The encoded form is `<namespace>/<groupVersion>/<kind>/<name>`, with an empty
//! namespace for cluster-scoped objects. No escaping is applied: Kubernetes
//! forbids `/` in namespaces, kinds and names, so decoding takes the namespace
//! from the first field, name and kind from the last two, and joins whatever
//! is left (one field for the core group, two for named groups) into the
//! groupVersion. This keeps every identity ever written decodable byte for byte.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::gvk::{split_api_version, Gvk};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceIdentity {
    /// `None` for cluster-scoped objects.
    pub namespace: Option<String>,
    /// `v1` for the core group, `group/version` otherwise.
    pub group_version: String,
    pub kind: String,
    pub name: String,
}

impl ResourceIdentity {
    pub fn new(
        namespace: Option<&str>,
        group_version: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()).map(|s| s.to_string()),
            group_version: group_version.into(),
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn from_gvk(gvk: &Gvk, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self::new(namespace, gvk.api_version(), gvk.kind.clone(), name)
    }

    pub fn gvk(&self) -> Result<Gvk> {
        let (group, version) = split_api_version(&self.group_version)?;
        Ok(Gvk::new(group, version, self.kind.clone()))
    }

    pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }

    pub fn encode(&self) -> String {
        format!("{}/{}/{}/{}", self.namespace.as_deref().unwrap_or(""), self.group_version, self.kind, self.name)
    }

    pub fn decode(id: &str) -> Result<Self> {
        let parts: Vec<&str> = id.split('/').collect();
        let (ns, gv, kind, name) = match parts.as_slice() {
            [ns, version, kind, name] => (*ns, (*version).to_string(), *kind, *name),
            [ns, group, version, kind, name] => (*ns, format!("{}/{}", group, version), *kind, *name),
            _ => {
                return Err(Error::parse(format!(
                    "invalid identity {:?}: expected namespace/groupVersion/kind/name, got {} field(s)",
                    id,
                    parts.len()
                )))
            }
        };
        split_api_version(&gv).map_err(|_| Error::parse(format!("invalid identity {:?}: bad groupVersion {:?}", id, gv)))?;
        if kind.is_empty() || name.is_empty() {
            return Err(Error::parse(format!("invalid identity {:?}: kind and name are required", id)));
        }
        Ok(Self::new(Some(ns), gv, kind, name))
    }
}

impl std::fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

impl std::str::FromStr for ResourceIdentity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> { Self::decode(s) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_group_cluster_scoped_round_trip() {
        let id = ResourceIdentity::new(None, "v1", "Namespace", "team-a");
        assert_eq!(id.encode(), "/v1/Namespace/team-a");
        assert_eq!(ResourceIdentity::decode(&id.encode()).expect("decode"), id);
    }

    #[test]
    fn named_group_round_trip() {
        let id = ResourceIdentity::new(Some("prod"), "cert-manager.io/v1", "Certificate", "web-tls");
        let s = id.encode();
        assert_eq!(s, "prod/cert-manager.io/v1/Certificate/web-tls");
        let back: ResourceIdentity = s.parse().expect("decode");
        assert_eq!(back, id);
        assert_eq!(back.gvk().expect("gvk").group, "cert-manager.io");
    }

    #[test]
    fn decodes_configmap_scenario() {
        let id = ResourceIdentity::decode("/v1/ConfigMap/cm1").expect("decode");
        assert_eq!(id.namespace, None);
        assert_eq!(id.group_version, "v1");
        assert_eq!(id.kind, "ConfigMap");
        assert_eq!(id.name, "cm1");
    }

    #[test]
    fn rejects_wrong_field_counts() {
        for bad in ["", "v1/ConfigMap/cm1", "a/b/c/d/e/f", "ns/a/b/c/Kind/name"] {
            let err = ResourceIdentity::decode(bad).unwrap_err();
            assert!(matches!(err, Error::Parse(_)), "{bad:?} -> {err}");
        }
    }

    #[test]
    fn rejects_empty_components() {
        assert!(ResourceIdentity::decode("ns//ConfigMap/a").is_err());
        assert!(ResourceIdentity::decode("ns/v1//a").is_err());
        assert!(ResourceIdentity::decode("ns/v1/ConfigMap/").is_err());
        assert!(ResourceIdentity::decode("ns//v1/Kind/a").is_err());
    }

    #[test]
    fn empty_namespace_normalizes_to_none() {
        let id = ResourceIdentity::new(Some(""), "v1", "ConfigMap", "a");
        assert_eq!(id.namespace, None);
    }
}
