//! Keel schema registry: discovers, builds and caches the structural schema of
//! each resource kind for the lifetime of the process.
//!
//! Lookups are single-flight per [`Gvk`]: the table of cells is copy-on-write
//! (`arc-swap`), each cell a `tokio::sync::OnceCell`. Readers never block each
//! other, concurrent misses on one kind share one discovery round trip, and a
//! cell is either empty or holds a complete entry. Failures leave the cell
//! empty so the next caller retries.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use keel_core::{ErrorKind, Gvk, KeelResult};
use keel_kubehub::{cancellable, Cluster, DiscoveredResource, RawSchema};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod build;
pub mod node;

pub use crate::node::{object_meta, ListType, NodeKind, ScalarType, SchemaNode};

/// Everything the engine needs to know about a served kind.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedKind {
    pub resource: DiscoveredResource,
    pub schema: Arc<SchemaNode>,
    /// Where the schema came from: `openapi-v3`, `crd` or `none`.
    pub source: &'static str,
}

type Cell = Arc<OnceCell<Arc<ResolvedKind>>>;

pub struct SchemaRegistry {
    cluster: Arc<dyn Cluster>,
    cells: ArcSwap<FxHashMap<Gvk, Cell>>,
}

impl SchemaRegistry {
    pub fn new(cluster: Arc<dyn Cluster>) -> Self {
        Self { cluster, cells: ArcSwap::from_pointee(FxHashMap::default()) }
    }

    fn cell(&self, gvk: &Gvk) -> Cell {
        if let Some(c) = self.cells.load().get(gvk) {
            return c.clone();
        }
        // first writer wins: a racing insert of the same key keeps the existing cell
        self.cells.rcu(|cur| {
            if cur.contains_key(gvk) {
                return Arc::clone(cur);
            }
            let mut next = (**cur).clone();
            next.insert(gvk.clone(), Arc::new(OnceCell::new()));
            Arc::new(next)
        });
        self.cells.load().get(gvk).cloned().unwrap_or_else(|| Arc::new(OnceCell::new()))
    }

    /// Resolve `gvk` to its served resource and schema.
    ///
    /// Fails with `UnknownKind` when the server does not serve the kind and
    /// `DiscoveryUnavailable` when discovery itself failed (retryable).
    pub async fn resolve(&self, gvk: &Gvk, cancel: &CancellationToken) -> KeelResult<Arc<ResolvedKind>> {
        let cell = self.cell(gvk);
        if let Some(hit) = cell.get() {
            counter!("schema_cache_hit", 1u64);
            debug!(gvk = %gvk, "schema cache hit");
            return Ok(hit.clone());
        }
        let resolved = cancellable(cancel, cell.get_or_try_init(|| self.discover(gvk))).await?;
        Ok(resolved.clone())
    }

    /// Schema only; see [`SchemaRegistry::resolve`].
    pub async fn schema(&self, gvk: &Gvk, cancel: &CancellationToken) -> KeelResult<Arc<SchemaNode>> {
        Ok(self.resolve(gvk, cancel).await?.schema.clone())
    }

    /// Kinds resolved so far.
    pub fn cached(&self) -> Vec<Gvk> {
        let mut out: Vec<Gvk> =
            self.cells.load().iter().filter(|(_, c)| c.initialized()).map(|(g, _)| g.clone()).collect();
        out.sort();
        out
    }

    async fn discover(&self, gvk: &Gvk) -> KeelResult<Arc<ResolvedKind>> {
        let t0 = Instant::now();
        counter!("schema_cache_miss", 1u64);
        info!(gvk = %gvk, "schema discovery start");
        let res = self.discover_inner(gvk).await;
        histogram!("schema_discovery_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(r) => info!(gvk = %gvk, source = r.source, took_ms = %t0.elapsed().as_millis(), "schema discovery ok"),
            Err(e) if e.is_retryable() => warn!(gvk = %gvk, error = %e, "schema discovery unavailable"),
            Err(e) => info!(gvk = %gvk, error = %e, "schema discovery failed"),
        }
        res
    }

    async fn discover_inner(&self, gvk: &Gvk) -> KeelResult<Arc<ResolvedKind>> {
        let resource = self.cluster.discover(gvk).await?;
        let (schema, source) = match self.cluster.fetch_schema(&resource).await? {
            RawSchema::OpenApiV3(doc) => match build::from_openapi_v3(&doc, gvk)? {
                Some(node) => (node, "openapi-v3"),
                None => {
                    // served but absent from its group-version document
                    return Err(ErrorKind::UnknownKind { gvk: gvk.key() }.into());
                }
            },
            RawSchema::Crd(schema) => (build::from_crd(&schema), "crd"),
            RawSchema::Missing => {
                warn!(gvk = %gvk, "kind publishes no schema; using permissive schema");
                (build::permissive_root(), "none")
            }
        };
        Ok(Arc::new(ResolvedKind { resource, schema: Arc::new(schema), source }))
    }
}
