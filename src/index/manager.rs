use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, info};

use super::{build_index, BuildReport, IndexKind, LayerIndex, SpatialIndex};
use crate::check::CheckContext;
use crate::dataset::VectorDataset;
use crate::errors::EngineError;
use crate::geometry::Envelope;
use crate::rule::SpatialRelation;

type CacheKey = (PathBuf, String, IndexKind);

/// Keyed cache of built indices. Lookups take a read lock; an insert
/// takes the single write lock. Builds of the same key are serialized
/// through a per-key gate so only one builder runs at a time.
pub struct IndexManager {
    cache: RwLock<HashMap<CacheKey, Arc<LayerIndex>>>,
    build_gates: Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
}

impl Default for IndexManager {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexManager {
    pub fn new() -> Self {
        IndexManager {
            cache: RwLock::new(HashMap::new()),
            build_gates: Mutex::new(HashMap::new()),
        }
    }

    /// Cached index for `(store, layer, kind)`, building one on a miss.
    /// A cache hit returns an empty build report.
    pub fn create_index(
        &self,
        dataset: &VectorDataset,
        layer_name: &str,
        kind: IndexKind,
        context: &CheckContext,
    ) -> Result<(Arc<LayerIndex>, BuildReport), EngineError> {
        let key = (dataset.path().to_path_buf(), layer_name.to_owned(), kind);
        if let Some(index) = self.lookup(&key) {
            debug!("index cache hit for {layer_name} ({kind})");
            return Ok((index, BuildReport::default()));
        }
        let gate = self.gate_for(&key);
        let _builder = gate.lock().expect("index build gate poisoned");
        // A racing builder may have finished while we waited.
        if let Some(index) = self.lookup(&key) {
            return Ok((index, BuildReport::default()));
        }
        info!("building {kind} index for layer '{layer_name}'");
        let (index, report) = build_index(dataset, layer_name, kind, context)?;
        let index = Arc::new(index);
        let _previous = self
            .cache
            .write()
            .expect("index cache poisoned")
            .insert(key, Arc::clone(&index));
        Ok((index, report))
    }

    fn lookup(&self, key: &CacheKey) -> Option<Arc<LayerIndex>> {
        self.cache
            .read()
            .expect("index cache poisoned")
            .get(key)
            .cloned()
    }

    fn gate_for(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        Arc::clone(
            self.build_gates
                .lock()
                .expect("index build gates poisoned")
                .entry(key.clone())
                .or_default(),
        )
    }

    pub fn query_intersecting(&self, index: &LayerIndex, envelope: &Envelope) -> Vec<i64> {
        index.query(envelope)
    }

    /// Coarse candidate pairs: each source envelope probes the target
    /// index. Only intersection-like relations can be answered this
    /// way; the caller still evaluates the exact predicate per pair.
    pub fn query_spatial_relation(
        &self,
        source: &LayerIndex,
        target: &LayerIndex,
        relation: SpatialRelation,
    ) -> Result<Vec<(i64, i64)>, EngineError> {
        if !relation.index_assisted() {
            return Err(EngineError::InputInvalid(format!(
                "relation {relation:?} cannot be answered by an envelope pass"
            )));
        }
        let mut pairs = Vec::new();
        for (source_fid, envelope) in source.entries() {
            for target_fid in target.query(&envelope) {
                pairs.push((source_fid, target_fid));
            }
        }
        Ok(pairs)
    }

    pub fn clear_cache(&self) {
        self.cache.write().expect("index cache poisoned").clear();
        self.build_gates
            .lock()
            .expect("index build gates poisoned")
            .clear();
    }

    pub fn cached_count(&self) -> usize {
        self.cache.read().expect("index cache poisoned").len()
    }
}
