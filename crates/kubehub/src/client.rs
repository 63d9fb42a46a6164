//! Generic object client: kind-agnostic create/get/update/delete.
//!
//! Every call resolves the kind through the shared [`RestMapper`] first, then
//! goes to the backend under the caller's [`CallContext`].

use std::sync::Arc;
use std::time::Instant;

use kman_core::{CallContext, EngineConfig, Error, Gvk, Manifest, Object, ResourceIdentity, Result};
use metrics::{counter, histogram};
use tracing::{debug, info};

use crate::backend::{ObjectRef, ResourceBackend};
use crate::mapping::{RestMapper, RestMapping};

#[derive(Clone)]
pub struct DynamicClient {
    mapper: Arc<RestMapper>,
    backend: Arc<dyn ResourceBackend>,
    cfg: EngineConfig,
}

impl DynamicClient {
    pub fn new(mapper: Arc<RestMapper>, backend: Arc<dyn ResourceBackend>, cfg: EngineConfig) -> Self {
        Self { mapper, backend, cfg }
    }

    pub fn mapper(&self) -> &RestMapper { &self.mapper }

    pub fn config(&self) -> &EngineConfig { &self.cfg }

    pub async fn mapping(&self, ctx: &CallContext, gvk: &Gvk) -> Result<RestMapping> { self.mapper.resolve(ctx, gvk).await }

    /// Identity of a manifest as written. Cluster-scoped kinds drop the
    /// namespace; a namespaced manifest without one keeps it empty, and the
    /// default namespace is only filled in when addressing the server.
    pub async fn identity_for(&self, ctx: &CallContext, manifest: &Manifest) -> Result<ResourceIdentity> {
        let mapping = self.resolve_named(ctx, manifest.gvk(), manifest.name()).await?;
        let namespace = if mapping.namespaced { manifest.namespace() } else { None };
        Ok(ResourceIdentity::new(namespace, mapping.api_version(), mapping.kind, manifest.name()))
    }

    /// Where `id` lives on the server.
    pub async fn locate(&self, ctx: &CallContext, id: &ResourceIdentity) -> Result<ObjectRef> {
        let gvk = id.gvk()?;
        self.target(ctx, &gvk, id.namespace(), &id.name).await
    }

    /// Target of `manifest` and its body with `metadata.namespace` set the way
    /// the server stores it: dropped for cluster-scoped kinds, defaulted otherwise.
    pub async fn scoped(&self, ctx: &CallContext, manifest: &Manifest) -> Result<(ObjectRef, Manifest)> {
        let target = self.target(ctx, manifest.gvk(), manifest.namespace(), manifest.name()).await?;
        let mut body = manifest.clone();
        body.set_namespace(target.namespace.as_deref());
        Ok((target, body))
    }

    pub async fn create(&self, ctx: &CallContext, manifest: &Manifest) -> Result<Object> {
        let t0 = Instant::now();
        let (target, body) = self.scoped(ctx, manifest).await?;
        let out = ctx.run(self.backend.create(&target, body.as_value(), &self.cfg.field_manager)).await;
        observe("create", t0, &out);
        let live = out?;
        info!(target = %target, took_ms = %t0.elapsed().as_millis(), "object created");
        Ok(live)
    }

    pub async fn get(&self, ctx: &CallContext, id: &ResourceIdentity) -> Result<Object> {
        let t0 = Instant::now();
        let target = self.locate(ctx, id).await?;
        let out = ctx.run(self.backend.get(&target)).await;
        observe("get", t0, &out);
        out
    }

    /// Merge-patch the object. Carry the last observed `metadata.resourceVersion`
    /// in `patch` to make the write conditional.
    pub async fn update(&self, ctx: &CallContext, id: &ResourceIdentity, patch: &Object) -> Result<Object> {
        let t0 = Instant::now();
        let target = self.locate(ctx, id).await?;
        let out = ctx.run(self.backend.patch(&target, patch, &self.cfg.field_manager)).await;
        observe("update", t0, &out);
        let live = out?;
        info!(target = %target, took_ms = %t0.elapsed().as_millis(), "object updated");
        Ok(live)
    }

    /// Delete; an object that is already gone counts as deleted.
    pub async fn delete(&self, ctx: &CallContext, id: &ResourceIdentity) -> Result<()> {
        let t0 = Instant::now();
        let target = self.locate(ctx, id).await?;
        let out = ctx.run(self.backend.delete(&target)).await;
        observe("delete", t0, &out);
        match out {
            Ok(()) => {
                info!(target = %target, took_ms = %t0.elapsed().as_millis(), "object deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(target = %target, "delete: already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn target(&self, ctx: &CallContext, gvk: &Gvk, namespace: Option<&str>, name: &str) -> Result<ObjectRef> {
        let mapping = self.resolve_named(ctx, gvk, name).await?;
        Ok(ObjectRef::scoped(mapping, namespace, &self.cfg.default_namespace, name))
    }

    async fn resolve_named(&self, ctx: &CallContext, gvk: &Gvk, name: &str) -> Result<RestMapping> {
        if name.is_empty() {
            return Err(Error::Invalid(format!("{}: empty object name", gvk)));
        }
        self.mapper.resolve(ctx, gvk).await
    }
}

fn observe<T>(verb: &'static str, t0: Instant, out: &Result<T>) {
    histogram!("kman_client_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "verb" => verb);
    if out.is_err() {
        counter!("kman_client_errors_total", 1u64, "verb" => verb);
    }
}
