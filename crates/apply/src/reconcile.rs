//! Manifest lifecycle against one cluster session: create, read, plan, update,
//! delete, import and readiness.

use std::sync::Arc;
use std::time::Instant;

use kman_core::{strip_server_fields, CallContext, Error, IgnoreFields, Manifest, Object, ResourceIdentity, Result};
use kman_kubehub::DynamicClient;
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::diff::{diff, ChangeSet};
use crate::readiness::{evaluate, Readiness, StatusViewers};

#[derive(Debug, Clone, PartialEq)]
pub struct Created {
    pub id: ResourceIdentity,
    pub object: Object,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    /// Live state already matches.
    NoOp,
    Update(ChangeSet),
    /// Namespace, group/version, kind or name changed: delete and recreate.
    Replace { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Updated {
    Unchanged,
    Patched(Object),
}

#[derive(Clone)]
pub struct Reconciler {
    client: DynamicClient,
    viewers: Arc<StatusViewers>,
}

impl Reconciler {
    /// Reconciler with the built-in workload status viewers.
    pub fn new(client: DynamicClient) -> Self { Self::with_viewers(client, StatusViewers::with_builtin_workloads()) }

    pub fn with_viewers(client: DynamicClient, viewers: StatusViewers) -> Self { Self { client, viewers: Arc::new(viewers) } }

    pub fn client(&self) -> &DynamicClient { &self.client }

    pub fn viewers(&self) -> &StatusViewers { &self.viewers }

    /// Create the object. An existing object with the same identity is an
    /// `AlreadyExists` error, never adopted.
    pub async fn create(&self, ctx: &CallContext, manifest: &Manifest) -> Result<Created> {
        let t0 = Instant::now();
        let id = self.client.identity_for(ctx, manifest).await?;
        let object = match self.client.create(ctx, manifest).await {
            Ok(o) => o,
            Err(e) => {
                counter!("kman_reconcile_errors_total", 1u64, "op" => "create");
                return Err(e);
            }
        };
        counter!("kman_reconcile_create_total", 1u64);
        histogram!("kman_reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => "create");
        info!(id = %id.encode(), took_ms = %t0.elapsed().as_millis(), "reconcile create");
        Ok(Created { id, object })
    }

    /// Live object, or `None` when it no longer exists.
    pub async fn read(&self, ctx: &CallContext, id: &ResourceIdentity) -> Result<Option<Object>> {
        match self.client.get(ctx, id).await {
            Ok(o) => Ok(Some(o)),
            Err(e) if e.is_not_found() => {
                debug!(id = %id.encode(), "read: gone");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn plan(&self, ctx: &CallContext, id: &ResourceIdentity, desired: &Manifest, ignore: &IgnoreFields) -> Result<Plan> {
        let desired = match self.in_place(ctx, id, desired).await? {
            InPlace::Body(m) => m,
            InPlace::Moved(reason) => return Ok(Plan::Replace { reason }),
        };
        let live = self.client.get(ctx, id).await?;
        let cs = diff(desired.as_value(), &live, ignore);
        if cs.is_empty() {
            Ok(Plan::NoOp)
        } else {
            Ok(Plan::Update(cs))
        }
    }

    /// Bring the live object in line with `desired`, leaving ignored and
    /// undeclared fields alone. Conflicts re-read live state and re-diff.
    pub async fn update(&self, ctx: &CallContext, id: &ResourceIdentity, desired: &Manifest, ignore: &IgnoreFields) -> Result<Updated> {
        let desired = match self.in_place(ctx, id, desired).await? {
            InPlace::Body(m) => m,
            InPlace::Moved(reason) => return Err(Error::Invalid(format!("cannot update in place: {}", reason))),
        };
        let t0 = Instant::now();
        let retries = self.client.config().conflict_retries;
        let mut attempt = 0u32;
        loop {
            let live = self.client.get(ctx, id).await?;
            let cs = diff(desired.as_value(), &live, ignore);
            if cs.is_empty() {
                counter!("kman_reconcile_noop_total", 1u64);
                debug!(id = %id.encode(), attempt, "update: already matches");
                return Ok(Updated::Unchanged);
            }
            debug!(id = %id.encode(), paths = ?cs.paths().iter().map(ToString::to_string).collect::<Vec<_>>(), "update: changes");
            match self.client.update(ctx, id, &cs.conditional_patch(&live)).await {
                Ok(obj) => {
                    let s = cs.summary();
                    counter!("kman_reconcile_update_total", 1u64);
                    histogram!("kman_reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => "update");
                    info!(
                        id = %id.encode(),
                        adds = s.adds, updates = s.updates, removes = s.removes,
                        attempts = attempt + 1,
                        took_ms = %t0.elapsed().as_millis(),
                        "reconcile update"
                    );
                    return Ok(Updated::Patched(obj));
                }
                Err(e) if e.is_conflict() && attempt < retries => {
                    counter!("kman_reconcile_conflict_retries_total", 1u64);
                    warn!(id = %id.encode(), attempt, "update conflict; re-reading live state");
                    attempt += 1;
                }
                Err(e) => {
                    counter!("kman_reconcile_errors_total", 1u64, "op" => "update");
                    return Err(e);
                }
            }
        }
    }

    /// Delete; already gone is success.
    pub async fn delete(&self, ctx: &CallContext, id: &ResourceIdentity) -> Result<()> {
        self.client.delete(ctx, id).await?;
        counter!("kman_reconcile_delete_total", 1u64);
        Ok(())
    }

    /// One readiness evaluation of the live object. Polling and timeouts
    /// belong to the caller.
    pub async fn readiness(&self, ctx: &CallContext, id: &ResourceIdentity) -> Result<Readiness> {
        let live = self.client.get(ctx, id).await?;
        let r = evaluate(&live, &self.viewers);
        debug!(id = %id.encode(), readiness = ?r, "readiness evaluated");
        Ok(r)
    }

    /// Live object with server bookkeeping stripped, usable as desired state.
    pub async fn import(&self, ctx: &CallContext, id: &ResourceIdentity) -> Result<Manifest> {
        let live = self.client.get(ctx, id).await?;
        let m = Manifest::from_value(strip_server_fields(live))?;
        info!(id = %id.encode(), "imported");
        Ok(m)
    }

    /// `desired` as the server would store it at `id`, or why it belongs elsewhere.
    async fn in_place(&self, ctx: &CallContext, id: &ResourceIdentity, desired: &Manifest) -> Result<InPlace> {
        let current = self.client.locate(ctx, id).await?;
        let (target, body) = self.client.scoped(ctx, desired).await?;
        if target == current {
            Ok(InPlace::Body(body))
        } else {
            Ok(InPlace::Moved(format!("identity changed from {} to {}", current, target)))
        }
    }
}

enum InPlace {
    Body(Manifest),
    Moved(String),
}
