//! Dynamic REST mapping: group/version/kind to plural resource and scope.
//!
//! Discovery runs lazily, one group/version at a time, and every resource the
//! server reports for that group/version is cached. Concurrent misses on the
//! same group/version share one discovery call.

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use kman_core::{CallContext, EngineConfig, Error, GroupVersion, Gvk, Result};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Where and how a kind is served.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RestMapping {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Lowercase plural resource name used in request paths.
    pub plural: String,
    pub namespaced: bool,
}

impl RestMapping {
    pub fn new(gvk: &Gvk, plural: impl Into<String>, namespaced: bool) -> Self {
        Self { group: gvk.group.clone(), version: gvk.version.clone(), kind: gvk.kind.clone(), plural: plural.into(), namespaced }
    }

    pub fn gvk(&self) -> Gvk { Gvk::new(self.group.clone(), self.version.clone(), self.kind.clone()) }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

/// Source of discovery documents; the API server in production.
#[async_trait::async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Every resource served under `gv`. `Error::NotFound` when the
    /// group/version itself is not served.
    async fn discover(&self, gv: &GroupVersion) -> Result<Vec<RestMapping>>;
}

type Slot = Arc<OnceCell<Arc<Vec<RestMapping>>>>;

/// Read-through mapping cache shared by every reconciliation in a session.
pub struct RestMapper {
    source: Arc<dyn DiscoverySource>,
    cache: ArcSwap<FxHashMap<GroupVersion, Slot>>,
    retries: u32,
    cfg: EngineConfig,
}

impl RestMapper {
    pub fn new(source: Arc<dyn DiscoverySource>, cfg: &EngineConfig) -> Self {
        Self { source, cache: ArcSwap::from_pointee(FxHashMap::default()), retries: cfg.mapping_retries, cfg: cfg.clone() }
    }

    /// Resolve `gvk`. A miss invalidates the group/version and rediscovers it,
    /// with exponential backoff, at most `mapping_retries` times.
    pub async fn resolve(&self, ctx: &CallContext, gvk: &Gvk) -> Result<RestMapping> {
        let gv = gvk.group_version();
        let mut attempt = 0u32;
        loop {
            match self.lookup(ctx, &gv).await {
                Ok(list) => {
                    if let Some(m) = list.iter().find(|m| m.kind == gvk.kind) {
                        return Ok(m.clone());
                    }
                }
                // group/version not served (yet)
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            if attempt >= self.retries {
                counter!("kman_mapping_not_found_total", 1u64);
                return Err(Error::MappingNotFound { gvk: gvk.to_string(), attempts: attempt + 1 });
            }
            let backoff = self.cfg.mapping_backoff(attempt);
            warn!(gvk = %gvk, attempt, backoff_ms = %backoff.as_millis(), "no mapping; refreshing discovery");
            counter!("kman_mapping_refresh_total", 1u64);
            self.invalidate(&gv);
            ctx.sleep(backoff).await?;
            attempt += 1;
        }
    }

    /// Drop the cached discovery document for one group/version.
    pub fn invalidate(&self, gv: &GroupVersion) {
        self.cache.rcu(|cur| {
            let mut next = FxHashMap::clone(cur);
            next.remove(gv);
            next
        });
    }

    /// Whether a discovery document for `gv` is currently cached.
    pub fn is_cached(&self, gv: &GroupVersion) -> bool {
        self.cache.load().get(gv).map(|slot| slot.initialized()).unwrap_or(false)
    }

    async fn lookup(&self, ctx: &CallContext, gv: &GroupVersion) -> Result<Arc<Vec<RestMapping>>> {
        let slot = self.slot(gv);
        if let Some(list) = slot.get() {
            counter!("kman_mapping_cache_hits_total", 1u64);
            debug!(gv = %gv, "mapping cache hit");
            return Ok(Arc::clone(list));
        }
        let list = slot
            .get_or_try_init(|| async {
                let t0 = Instant::now();
                counter!("kman_discovery_calls_total", 1u64);
                let list = ctx.run(self.source.discover(gv)).await?;
                histogram!("kman_discovery_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                info!(gv = %gv, resources = list.len(), took_ms = %t0.elapsed().as_millis(), "discovery ok");
                Ok::<_, Error>(Arc::new(list))
            })
            .await?;
        Ok(Arc::clone(list))
    }

    fn slot(&self, gv: &GroupVersion) -> Slot {
        if let Some(slot) = self.cache.load().get(gv) {
            return Arc::clone(slot);
        }
        let mut out: Option<Slot> = None;
        self.cache.rcu(|cur| {
            let mut next = FxHashMap::clone(cur);
            let slot = next.entry(gv.clone()).or_insert_with(|| Arc::new(OnceCell::new()));
            out = Some(Arc::clone(slot));
            next
        });
        out.unwrap_or_else(|| Arc::new(OnceCell::new()))
    }
}
