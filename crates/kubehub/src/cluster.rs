//! Live API server backend over kube-rs dynamic objects.

use std::time::Instant;

use kman_core::{ApiStatus, Error, GroupVersion, Object, Result};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject},
    discovery::{self, Scope},
    Client,
};
use tracing::{debug, info};

use crate::backend::{ObjectRef, ResourceBackend};
use crate::mapping::{DiscoverySource, RestMapping};

#[derive(Clone)]
pub struct KubeBackend {
    client: Client,
}

impl KubeBackend {
    pub fn new(client: Client) -> Self { Self { client } }

    pub fn client(&self) -> &Client { &self.client }

    fn api(&self, target: &ObjectRef) -> Api<DynamicObject> {
        let m = &target.mapping;
        let ar = ApiResource {
            group: m.group.clone(),
            version: m.version.clone(),
            api_version: m.api_version(),
            kind: m.kind.clone(),
            plural: m.plural.clone(),
        };
        match target.namespace.as_deref() {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }
}

/// Map a kube-rs failure onto the engine taxonomy, keeping the server status.
pub(crate) fn translate(target: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(resp) => Error::from_status(target, ApiStatus::new(resp.code, resp.reason, resp.message)),
        kube::Error::SerdeError(e) => Error::parse(format!("{}: {}", target, e)),
        other => Error::transport(format!("{}: {}", target, other)),
    }
}

fn to_dynamic(body: &Object) -> Result<DynamicObject> { Ok(serde_json::from_value(body.clone())?) }

fn from_dynamic(obj: &DynamicObject) -> Result<Object> { Ok(serde_json::to_value(obj)?) }

#[async_trait::async_trait]
impl DiscoverySource for KubeBackend {
    async fn discover(&self, gv: &GroupVersion) -> Result<Vec<RestMapping>> {
        let t0 = Instant::now();
        let kgv = kube::core::GroupVersion::gv(&gv.group, &gv.version);
        let group = discovery::pinned_group(&self.client, &kgv).await.map_err(|e| translate(&gv.api_version(), e))?;
        let out: Vec<RestMapping> = group
            .versioned_resources(&gv.version)
            .into_iter()
            .map(|(ar, caps)| RestMapping {
                group: ar.group,
                version: ar.version,
                kind: ar.kind,
                plural: ar.plural,
                namespaced: matches!(caps.scope, Scope::Namespaced),
            })
            .collect();
        debug!(gv = %gv, resources = out.len(), took_ms = %t0.elapsed().as_millis(), "pinned discovery");
        Ok(out)
    }
}

#[async_trait::async_trait]
impl ResourceBackend for KubeBackend {
    async fn create(&self, target: &ObjectRef, body: &Object, field_manager: &str) -> Result<Object> {
        let t0 = Instant::now();
        let obj = to_dynamic(body)?;
        let pp = PostParams { field_manager: Some(field_manager.to_string()), ..Default::default() };
        let created = self.api(target).create(&pp, &obj).await.map_err(|e| translate(&target.to_string(), e))?;
        info!(target = %target, took_ms = %t0.elapsed().as_millis(), "created");
        from_dynamic(&created)
    }

    async fn get(&self, target: &ObjectRef) -> Result<Object> {
        let obj = self.api(target).get(&target.name).await.map_err(|e| translate(&target.to_string(), e))?;
        from_dynamic(&obj)
    }

    async fn patch(&self, target: &ObjectRef, patch: &Object, field_manager: &str) -> Result<Object> {
        let t0 = Instant::now();
        let mut pp = PatchParams::default();
        pp.field_manager = Some(field_manager.to_string());
        let obj = self
            .api(target)
            .patch(&target.name, &pp, &Patch::Merge(patch))
            .await
            .map_err(|e| translate(&target.to_string(), e))?;
        info!(target = %target, took_ms = %t0.elapsed().as_millis(), "patched");
        from_dynamic(&obj)
    }

    async fn delete(&self, target: &ObjectRef) -> Result<()> {
        self.api(target)
            .delete(&target.name, &DeleteParams::default())
            .await
            .map_err(|e| translate(&target.to_string(), e))?;
        info!(target = %target, "delete requested");
        Ok(())
    }
}
