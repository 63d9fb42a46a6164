//! One-directional diff of desired against live state, producing a JSON merge patch.
//!
//! Only what `desired` states is compared; anything extra in `live` belongs to
//! someone else (defaulting, controllers, other owners) and is left alone.

use kman_core::{FieldPath, IgnoreFields, Object};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    /// Paths set in desired and absent live.
    pub adds: usize,
    /// Paths present on both sides with different values.
    pub updates: usize,
    /// Explicit `null`s in desired that delete a live key.
    pub removes: usize,
}

/// Result of a diff: the merge-patch body plus the paths that differ.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChangeSet {
    patch: Map<String, Json>,
    paths: Vec<FieldPath>,
    summary: DiffSummary,
}

impl ChangeSet {
    /// Nothing to write; the live object already matches.
    pub fn is_empty(&self) -> bool { self.patch.is_empty() }

    pub fn paths(&self) -> &[FieldPath] { &self.paths }

    pub fn summary(&self) -> DiffSummary { self.summary }

    /// Merge-patch body.
    pub fn patch(&self) -> Object { Json::Object(self.patch.clone()) }

    /// Patch body guarded by the live object's `metadata.resourceVersion`, so the
    /// write fails with a conflict if anyone else wrote in between.
    pub fn conditional_patch(&self, live: &Object) -> Object {
        let mut body = self.patch.clone();
        if let Some(rv) = live.pointer("/metadata/resourceVersion").and_then(Json::as_str) {
            let meta = body.entry("metadata").or_insert_with(|| Json::Object(Map::new()));
            if let Some(meta) = meta.as_object_mut() {
                meta.insert("resourceVersion".into(), Json::String(rv.to_string()));
            }
        }
        Json::Object(body)
    }

    /// What `live` would look like after the patch is applied.
    pub fn preview(&self, live: &Object) -> Object {
        let mut out = live.clone();
        kman_kubehub::merge_patch(&mut out, &self.patch());
        out
    }
}

struct Walker<'a> {
    ignore: &'a IgnoreFields,
    paths: Vec<FieldPath>,
    summary: DiffSummary,
}

/// Compare `desired` against `live`, skipping every path under `ignore`.
pub fn diff(desired: &Object, live: &Object, ignore: &IgnoreFields) -> ChangeSet {
    let mut w = Walker { ignore, paths: Vec::new(), summary: DiffSummary::default() };
    let patch = match w.walk(&FieldPath::root(), desired, Some(live)) {
        Some(Json::Object(map)) => map,
        // a non-mapping root cannot be merge-patched field by field
        Some(_) | None => Map::new(),
    };
    ChangeSet { patch, paths: w.paths, summary: w.summary }
}

impl Walker<'_> {
    /// Patch fragment for `path`, or `None` when desired and live agree there.
    fn walk(&mut self, path: &FieldPath, desired: &Json, live: Option<&Json>) -> Option<Json> {
        if self.ignore.covers(path) {
            return None;
        }
        match desired {
            Json::Object(want) => {
                let have = live.and_then(Json::as_object);
                let mut out = Map::new();
                for (k, dv) in want {
                    let child = path.child(k.as_str());
                    let lv = have.and_then(|m| m.get(k));
                    if dv.is_null() {
                        // merge-patch delete; only a delta when there is something to delete
                        if lv.is_some() && !self.ignore.covers(&child) {
                            self.summary.removes += 1;
                            self.paths.push(child);
                            out.insert(k.clone(), Json::Null);
                        }
                        continue;
                    }
                    if let Some(frag) = self.walk(&child, dv, lv) {
                        out.insert(k.clone(), frag);
                    }
                }
                if out.is_empty() { None } else { Some(Json::Object(out)) }
            }
            Json::Array(want) => {
                if self.sequence_matches(path, want, live) {
                    return None;
                }
                self.record(path, live);
                Some(self.emit_sequence(path, want, live))
            }
            scalar => {
                if live == Some(scalar) {
                    return None;
                }
                self.record(path, live);
                Some(scalar.clone())
            }
        }
    }

    fn record(&mut self, path: &FieldPath, live: Option<&Json>) {
        match live {
            None | Some(Json::Null) => self.summary.adds += 1,
            Some(_) => self.summary.updates += 1,
        }
        self.paths.push(path.clone());
    }

    /// Element-wise, same one-directional rule inside every element.
    fn sequence_matches(&self, path: &FieldPath, want: &[Json], live: Option<&Json>) -> bool {
        let Some(have) = live.and_then(Json::as_array) else { return false };
        if have.len() != want.len() {
            return false;
        }
        let mut probe = Walker { ignore: self.ignore, paths: Vec::new(), summary: DiffSummary::default() };
        want.iter().zip(have.iter()).enumerate().all(|(i, (dv, lv))| probe.walk(&path.index(i), dv, Some(lv)).is_none())
    }

    /// Merge patch replaces sequences wholesale, so send all of desired, with
    /// ignored sub-paths put back to their live values.
    fn emit_sequence(&self, path: &FieldPath, want: &[Json], live: Option<&Json>) -> Json {
        let mut out = Json::Array(want.iter().map(drop_nulls).collect());
        if !self.ignore.has_descendant_of(path) {
            return out;
        }
        for rel in self.ignore.paths().iter().filter_map(|p| p.strip_prefix(path)).filter(|rel| !rel.is_root()) {
            match live.and_then(|l| rel.lookup(l)) {
                Some(v) => set(&mut out, rel.segments(), v.clone()),
                None => remove(&mut out, rel.segments()),
            }
        }
        out
    }
}

fn drop_nulls(v: &Json) -> Json {
    match v {
        Json::Object(map) => Json::Object(map.iter().filter(|(_, v)| !v.is_null()).map(|(k, v)| (k.clone(), drop_nulls(v))).collect()),
        Json::Array(items) => Json::Array(items.iter().map(drop_nulls).collect()),
        other => other.clone(),
    }
}

fn set(root: &mut Json, rel: &[String], value: Json) {
    let Some((last, parents)) = rel.split_last() else { return };
    let mut cur = root;
    for seg in parents {
        cur = match cur {
            Json::Object(map) => map.entry(seg.clone()).or_insert_with(|| Json::Object(Map::new())),
            Json::Array(items) => match seg.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                Some(v) => v,
                None => return,
            },
            _ => return,
        };
    }
    match cur {
        Json::Object(map) => {
            map.insert(last.clone(), value);
        }
        Json::Array(items) => {
            if let Some(slot) = last.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                *slot = value;
            }
        }
        _ => {}
    }
}

fn remove(root: &mut Json, rel: &[String]) {
    let Some((last, parents)) = rel.split_last() else { return };
    let mut cur = root;
    for seg in parents {
        cur = match cur {
            Json::Object(map) => match map.get_mut(seg) {
                Some(v) => v,
                None => return,
            },
            Json::Array(items) => match seg.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                Some(v) => v,
                None => return,
            },
            _ => return,
        };
    }
    // array elements are positional; only mapping keys are removed
    if let Json::Object(map) = cur {
        map.remove(last);
    }
}
