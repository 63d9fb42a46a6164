use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Group/Version/Kind. `group` is empty for the core API group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Build from an `apiVersion` string (`v1` or `apps/v1`) and a kind.
    pub fn from_api_version(api_version: &str, kind: &str) -> Result<Self> {
        let (group, version) = split_api_version(api_version)?;
        if kind.is_empty() {
            return Err(Error::parse("kind must not be empty"));
        }
        Ok(Self::new(group, version, kind))
    }

    /// `v1` for the core group, `group/version` otherwise.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    /// Key for the discovery document that serves this kind.
    pub fn group_version(&self) -> GroupVersion {
        GroupVersion { group: self.group.clone(), version: self.version.clone() }
    }
}

impl std::fmt::Display for Gvk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupVersion {
    pub group: String,
    pub version: String,
}

impl GroupVersion {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

impl std::fmt::Display for GroupVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.api_version())
    }
}

/// Split `apiVersion` into `(group, version)`.
pub fn split_api_version(api_version: &str) -> Result<(String, String)> {
    match api_version.split('/').collect::<Vec<_>>().as_slice() {
        [version] if !version.is_empty() => Ok((String::new(), (*version).to_string())),
        [group, version] if !group.is_empty() && !version.is_empty() => Ok(((*group).to_string(), (*version).to_string())),
        _ => Err(Error::parse(format!("invalid apiVersion: {:?} (expect v1 or group/v1)", api_version))),
    }
}
