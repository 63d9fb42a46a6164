//! Readiness of arbitrary objects from their `status` conventions.
//!
//! Rules, first match wins:
//! 1. a status viewer registered for the object's group and kind says not ready
//! 2. replica counts are present and nothing is ready
//! 3. a phase is present and is not one of the accepted phases
//! 4. the kind needs a load balancer and no ingress has been assigned
//!
//! Objects without a `status` are ready.

use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use kman_core::{Error, Object, Result};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

pub const ACCEPTED_PHASES: [&str; 6] = ["Active", "Bound", "Running", "Ready", "Online", "Healthy"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotReadyReason {
    /// Message from a kind-specific status viewer.
    Viewer(String),
    NoReadyReplicas,
    Phase(String),
    LoadBalancerPending,
}

impl fmt::Display for NotReadyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotReadyReason::Viewer(msg) => f.write_str(msg.trim_end()),
            NotReadyReason::NoReadyReplicas => f.write_str("no ready replicas"),
            NotReadyReason::Phase(p) => write!(f, "phase {:?} is not ready", p),
            NotReadyReason::LoadBalancerPending => f.write_str("waiting for load balancer ingress"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Readiness {
    Ready,
    NotReady(NotReadyReason),
    Error(String),
}

impl Readiness {
    pub fn is_ready(&self) -> bool { matches!(self, Readiness::Ready) }
}

/// The recognised parts of a live object's `status`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub replicas: Option<i64>,
    pub ready_replicas: Option<i64>,
    pub phase: Option<String>,
    /// `Some` when `status.loadBalancer` exists; a missing ingress list reads as empty.
    pub load_balancer_ingress: Option<Vec<Json>>,
}

impl StatusSnapshot {
    /// `None` when the object has no status subtree at all.
    pub fn project(obj: &Object) -> Option<Self> {
        let status = obj.get("status").filter(|s| !s.is_null())?;
        Some(Self {
            replicas: status.get("replicas").and_then(Json::as_i64),
            ready_replicas: status.get("readyReplicas").and_then(Json::as_i64),
            phase: status.get("phase").and_then(Json::as_str).map(str::to_string),
            load_balancer_ingress: status
                .get("loadBalancer")
                .map(|lb| lb.get("ingress").and_then(Json::as_array).cloned().unwrap_or_default()),
        })
    }

    /// Only an explicit `readyReplicas: 0` counts; many scaled custom
    /// resources report `replicas` without ever writing `readyReplicas`.
    pub fn no_ready_replicas(&self) -> bool { self.ready_replicas == Some(0) }
}

/// Kind-specific readiness check: `(message, ready)`.
pub trait StatusViewer: Send + Sync {
    fn status(&self, obj: &Object) -> Result<(String, bool)>;
}

impl<F> StatusViewer for F
where
    F: Fn(&Object) -> Result<(String, bool)> + Send + Sync,
{
    fn status(&self, obj: &Object) -> Result<(String, bool)> { self(obj) }
}

/// Registry of status viewers keyed by (group, kind).
#[derive(Clone, Default)]
pub struct StatusViewers {
    viewers: FxHashMap<(String, String), Arc<dyn StatusViewer>>,
}

impl StatusViewers {
    pub fn new() -> Self { Self::default() }

    /// Rollout checks for the apps/v1 workloads.
    pub fn with_builtin_workloads() -> Self {
        let mut v = Self::new();
        v.register("apps", "Deployment", deployment_status);
        v.register("apps", "DaemonSet", daemon_set_status);
        v.register("apps", "StatefulSet", stateful_set_status);
        v
    }

    pub fn register(&mut self, group: &str, kind: &str, viewer: impl StatusViewer + 'static) {
        self.viewers.insert((group.to_string(), kind.to_string()), Arc::new(viewer));
    }

    pub fn get(&self, group: &str, kind: &str) -> Option<&Arc<dyn StatusViewer>> {
        self.viewers.get(&(group.to_string(), kind.to_string()))
    }

    pub fn len(&self) -> usize { self.viewers.len() }

    pub fn is_empty(&self) -> bool { self.viewers.is_empty() }
}

impl fmt::Debug for StatusViewers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.viewers.keys().collect();
        keys.sort();
        f.debug_struct("StatusViewers").field("kinds", &keys).finish()
    }
}

fn group_of(obj: &Object) -> &str {
    let api_version = obj.get("apiVersion").and_then(Json::as_str).unwrap_or_default();
    api_version.rsplit_once('/').map(|(g, _)| g).unwrap_or("")
}

/// Core Services wait for an address only as `type: LoadBalancer`; any other
/// object that reports `status.loadBalancer` waits for a non-empty ingress.
fn needs_load_balancer(obj: &Object, snap: &StatusSnapshot) -> bool {
    let kind = obj.get("kind").and_then(Json::as_str).unwrap_or_default();
    match (group_of(obj), kind) {
        ("", "Service") => obj.pointer("/spec/type").and_then(Json::as_str) == Some("LoadBalancer"),
        _ => snap.load_balancer_ingress.is_some(),
    }
}

/// One readiness evaluation of a live object.
pub fn evaluate(obj: &Object, viewers: &StatusViewers) -> Readiness {
    let Some(snap) = StatusSnapshot::project(obj) else { return Readiness::Ready };
    let kind = obj.get("kind").and_then(Json::as_str).unwrap_or_default();
    if let Some(viewer) = viewers.get(group_of(obj), kind) {
        match viewer.status(obj) {
            Ok((_, true)) => {}
            Ok((msg, false)) => return Readiness::NotReady(NotReadyReason::Viewer(msg)),
            Err(e) => return Readiness::Error(e.to_string()),
        }
    }
    if snap.no_ready_replicas() {
        return Readiness::NotReady(NotReadyReason::NoReadyReplicas);
    }
    if let Some(phase) = snap.phase.as_deref() {
        if !ACCEPTED_PHASES.contains(&phase) {
            return Readiness::NotReady(NotReadyReason::Phase(phase.to_string()));
        }
    }
    if needs_load_balancer(obj, &snap) && snap.load_balancer_ingress.as_ref().map(Vec::is_empty).unwrap_or(true) {
        return Readiness::NotReady(NotReadyReason::LoadBalancerPending);
    }
    Readiness::Ready
}

/// Per-object readiness state across polls. `Ready` and `Error` are terminal;
/// `NotReady` is re-checked on the next poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessState {
    Unknown,
    Checking,
    Ready,
    NotReady(NotReadyReason),
    Error(String),
}

#[derive(Debug, Clone)]
pub struct ReadinessTracker {
    state: ReadinessState,
    polls: u32,
}

impl Default for ReadinessTracker {
    fn default() -> Self { Self { state: ReadinessState::Unknown, polls: 0 } }
}

impl ReadinessTracker {
    pub fn new() -> Self { Self::default() }

    pub fn state(&self) -> &ReadinessState { &self.state }

    pub fn polls(&self) -> u32 { self.polls }

    pub fn is_terminal(&self) -> bool { matches!(self.state, ReadinessState::Ready | ReadinessState::Error(_)) }

    /// Feed one poll's live object.
    pub fn observe(&mut self, obj: &Object, viewers: &StatusViewers) -> &ReadinessState {
        if self.is_terminal() {
            return &self.state;
        }
        self.state = ReadinessState::Checking;
        self.polls += 1;
        self.state = match evaluate(obj, viewers) {
            Readiness::Ready => ReadinessState::Ready,
            Readiness::NotReady(reason) => ReadinessState::NotReady(reason),
            Readiness::Error(msg) => ReadinessState::Error(msg),
        };
        debug!(polls = self.polls, state = ?self.state, "readiness observed");
        &self.state
    }

    /// Record a failed poll (the object could not be read).
    pub fn fail(&mut self, err: &Error) -> &ReadinessState {
        self.state = ReadinessState::Error(err.to_string());
        &self.state
    }
}

fn decode<T: serde::de::DeserializeOwned>(obj: &Object) -> Result<T> {
    serde_json::from_value(obj.clone()).map_err(|e| Error::parse(format!("decoding status: {}", e)))
}

fn rolling_update_only(strategy: Option<&str>) -> Result<()> {
    // the server defaults an absent strategy to RollingUpdate
    match strategy {
        None | Some("RollingUpdate") => Ok(()),
        Some(_) => Err(Error::Invalid("rollout status is only available for RollingUpdate strategy type".into())),
    }
}

fn deployment_status(obj: &Object) -> Result<(String, bool)> {
    let d: Deployment = decode(obj)?;
    let name = d.metadata.name.clone().unwrap_or_default();
    let status = d.status.unwrap_or_default();
    let generation = d.metadata.generation.unwrap_or(0);
    if generation > status.observed_generation.unwrap_or(0) {
        return Ok(("Waiting for deployment spec update to be observed...".into(), false));
    }
    let deadline_exceeded = status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == "Progressing" && c.reason.as_deref() == Some("ProgressDeadlineExceeded"));
    if deadline_exceeded {
        return Err(Error::Invalid(format!("deployment {:?} exceeded its progress deadline", name)));
    }
    let updated = status.updated_replicas.unwrap_or(0);
    let replicas = status.replicas.unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);
    if let Some(want) = d.spec.and_then(|s| s.replicas) {
        if updated < want {
            return Ok((
                format!("Waiting for deployment {:?} rollout to finish: {} out of {} new replicas have been updated...", name, updated, want),
                false,
            ));
        }
    }
    if replicas > updated {
        return Ok((
            format!("Waiting for deployment {:?} rollout to finish: {} old replicas are pending termination...", name, replicas - updated),
            false,
        ));
    }
    if available < updated {
        return Ok((
            format!("Waiting for deployment {:?} rollout to finish: {} of {} updated replicas are available...", name, available, updated),
            false,
        ));
    }
    Ok((format!("deployment {:?} successfully rolled out", name), true))
}

fn daemon_set_status(obj: &Object) -> Result<(String, bool)> {
    let ds: DaemonSet = decode(obj)?;
    let name = ds.metadata.name.clone().unwrap_or_default();
    rolling_update_only(ds.spec.as_ref().and_then(|s| s.update_strategy.as_ref()).and_then(|u| u.type_.as_deref()))?;
    let status = ds.status.unwrap_or_default();
    if ds.metadata.generation.unwrap_or(0) > status.observed_generation.unwrap_or(0) {
        return Ok(("Waiting for daemon set spec update to be observed...".into(), false));
    }
    let desired = status.desired_number_scheduled;
    let updated = status.updated_number_scheduled.unwrap_or(0);
    if updated < desired {
        return Ok((
            format!("Waiting for daemon set {:?} rollout to finish: {} out of {} new pods have been updated...", name, updated, desired),
            false,
        ));
    }
    let available = status.number_available.unwrap_or(0);
    if available < desired {
        return Ok((
            format!("Waiting for daemon set {:?} rollout to finish: {} of {} updated pods are available...", name, available, desired),
            false,
        ));
    }
    Ok((format!("daemon set {:?} successfully rolled out", name), true))
}

fn stateful_set_status(obj: &Object) -> Result<(String, bool)> {
    let sts: StatefulSet = decode(obj)?;
    let spec = sts.spec.unwrap_or_default();
    let strategy = spec.update_strategy.unwrap_or_default();
    rolling_update_only(strategy.type_.as_deref())?;
    let status = sts.status.unwrap_or_default();
    let observed = status.observed_generation.unwrap_or(0);
    if observed == 0 || sts.metadata.generation.unwrap_or(0) > observed {
        return Ok(("Waiting for statefulset spec update to be observed...".into(), false));
    }
    let ready = status.ready_replicas.unwrap_or(0);
    if let Some(want) = spec.replicas {
        if ready < want {
            return Ok((format!("Waiting for {} pods to be ready...", want - ready), false));
        }
    }
    let partition = strategy.rolling_update.and_then(|r| r.partition);
    if let (Some(partition), Some(want)) = (partition, spec.replicas) {
        let updated = status.updated_replicas.unwrap_or(0);
        if updated < want - partition {
            return Ok((
                format!(
                    "Waiting for partitioned roll out to finish: {} out of {} new pods have been updated...",
                    updated,
                    want - partition
                ),
                false,
            ));
        }
        return Ok((format!("partitioned roll out complete: {} new pods have been updated...", updated), true));
    }
    let current = status.current_revision.unwrap_or_default();
    let update = status.update_revision.unwrap_or_default();
    if update != current {
        return Ok((
            format!(
                "waiting for statefulset rolling update to complete {} pods at revision {}...",
                status.updated_replicas.unwrap_or(0),
                update
            ),
            false,
        ));
    }
    Ok((format!("statefulset rolling update complete {} pods at revision {}...", status.current_replicas.unwrap_or(0), current), true))
}
