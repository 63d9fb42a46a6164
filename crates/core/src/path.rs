//! Dotted field paths and the ignore-fields set.
//!
//! `.metadata.labels.app` addresses `metadata -> labels -> app`. The leading dot
//! is optional; `\.` is a literal dot inside a segment, so
//! `.metadata.annotations.example\.com/owner` addresses one annotation key.
//! A numeric segment also matches that index of a sequence.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FieldPath {
    segments: SmallVec<[String; 4]>,
}

impl FieldPath {
    pub fn root() -> Self { Self::default() }

    pub fn parse(raw: &str) -> Result<Self> {
        let body = raw.strip_prefix('.').unwrap_or(raw);
        if body.is_empty() {
            return Err(Error::parse(format!("empty field path {:?}", raw)));
        }
        let mut segments: SmallVec<[String; 4]> = SmallVec::new();
        let mut cur = String::new();
        let mut chars = body.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some(next) => cur.push(next),
                    None => return Err(Error::parse(format!("dangling escape in field path {:?}", raw))),
                },
                '.' => segments.push(std::mem::take(&mut cur)),
                _ => cur.push(c),
            }
        }
        segments.push(cur);
        if segments.iter().any(|s| s.is_empty()) {
            return Err(Error::parse(format!("empty segment in field path {:?}", raw)));
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] { &self.segments }

    pub fn is_root(&self) -> bool { self.segments.is_empty() }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    pub fn index(&self, i: usize) -> Self { self.child(i.to_string()) }

    /// True when `self` equals `other` or is an ancestor of it.
    pub fn is_prefix_of(&self, other: &FieldPath) -> bool {
        self.segments.len() <= other.segments.len() && self.segments.iter().zip(other.segments.iter()).all(|(a, b)| a == b)
    }

    /// The rest of `self` below `prefix`, when `prefix` is an ancestor or equal.
    pub fn strip_prefix(&self, prefix: &FieldPath) -> Option<FieldPath> {
        prefix.is_prefix_of(self).then(|| Self { segments: self.segments[prefix.segments.len()..].iter().cloned().collect() })
    }

    /// Look the path up in a JSON tree.
    pub fn lookup<'a>(&self, root: &'a serde_json::Value) -> Option<&'a serde_json::Value> {
        let mut cur = root;
        for seg in self.segments.iter() {
            cur = match cur {
                serde_json::Value::Object(map) => map.get(seg)?,
                serde_json::Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(cur)
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.segments.is_empty() {
            return f.write_str(".");
        }
        for seg in self.segments.iter() {
            write!(f, ".{}", seg.replace('\\', "\\\\").replace('.', "\\."))?;
        }
        Ok(())
    }
}

impl std::str::FromStr for FieldPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> { Self::parse(s) }
}

/// Caller-supplied paths excluded from diffing and from being overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IgnoreFields {
    paths: Vec<FieldPath>,
}

impl IgnoreFields {
    pub fn none() -> Self { Self::default() }

    pub fn parse<S: AsRef<str>>(raw: &[S]) -> Result<Self> {
        let paths = raw.iter().map(|s| FieldPath::parse(s.as_ref())).collect::<Result<Vec<_>>>()?;
        Ok(Self { paths })
    }

    pub fn paths(&self) -> &[FieldPath] { &self.paths }

    pub fn is_empty(&self) -> bool { self.paths.is_empty() }

    /// Whether `path` sits at or below any ignored path.
    pub fn covers(&self, path: &FieldPath) -> bool { self.paths.iter().any(|p| p.is_prefix_of(path)) }

    /// Whether some ignored path lies strictly below `path`.
    pub fn has_descendant_of(&self, path: &FieldPath) -> bool {
        self.paths.iter().any(|p| path.is_prefix_of(p) && p.segments().len() > path.segments().len())
    }
}
