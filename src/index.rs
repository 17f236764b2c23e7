pub mod grid;
pub mod manager;
pub mod quadtree;
pub mod rtree;

pub use grid::GridIndex;
pub use manager::IndexManager;
pub use quadtree::QuadTreeIndex;
pub use rtree::RTreeIndex;

use core::fmt::{Display, Formatter, Result as FmtResult};
use core::str::FromStr;
use std::time::Instant;

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::check::{CheckContext, CANCEL_POLL_STRIDE, VERTEX_LIMIT};
use crate::dataset::VectorDataset;
use crate::errors::EngineError;
use crate::geometry::{self, Envelope};
use crate::report::ValidationError;
use crate::rule::codes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexKind {
    RTree,
    QuadTree,
    Grid,
}

impl Display for IndexKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::RTree => write!(f, "rtree"),
            Self::QuadTree => write!(f, "quadtree"),
            Self::Grid => write!(f, "grid"),
        }
    }
}

impl FromStr for IndexKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "rtree" => Ok(Self::RTree),
            "quadtree" => Ok(Self::QuadTree),
            "grid" => Ok(Self::Grid),
            other => Err(format!("unknown index kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IndexStats {
    pub kind: IndexKind,
    pub entries: usize,
    pub nodes: usize,
    pub depth: usize,
}

/// Common contract of the index family. `query` returns exactly the
/// stored features whose envelope intersects the probe, deduplicated
/// and sorted by id.
pub trait SpatialIndex {
    fn insert(&mut self, fid: i64, envelope: Envelope);
    fn remove(&mut self, fid: i64);
    fn query(&self, envelope: &Envelope) -> Vec<i64>;
    fn count(&self) -> usize;
    fn clear(&mut self);
    fn envelope_of(&self, fid: i64) -> Option<Envelope>;
    fn stats(&self) -> IndexStats;
}

/// The three index variants behind one statically dispatched value.
pub enum LayerIndex {
    RTree(RTreeIndex),
    QuadTree(QuadTreeIndex),
    Grid(GridIndex),
}

impl LayerIndex {
    pub fn empty(kind: IndexKind, extent: &Envelope) -> Self {
        match kind {
            IndexKind::RTree => Self::RTree(RTreeIndex::new()),
            IndexKind::QuadTree => Self::QuadTree(QuadTreeIndex::new(*extent)),
            IndexKind::Grid => Self::Grid(GridIndex::uniform(*extent)),
        }
    }

    pub fn kind(&self) -> IndexKind {
        match self {
            Self::RTree(_) => IndexKind::RTree,
            Self::QuadTree(_) => IndexKind::QuadTree,
            Self::Grid(_) => IndexKind::Grid,
        }
    }

    /// All stored entries, sorted by feature id.
    pub fn entries(&self) -> Vec<(i64, Envelope)> {
        let mut entries: Vec<(i64, Envelope)> = match self {
            Self::RTree(index) => index.entry_map().iter().map(|(k, v)| (*k, *v)).collect(),
            Self::QuadTree(index) => index.entry_map().iter().map(|(k, v)| (*k, *v)).collect(),
            Self::Grid(index) => index.entry_map().iter().map(|(k, v)| (*k, *v)).collect(),
        };
        entries.sort_by_key(|(fid, _)| *fid);
        entries
    }
}

impl SpatialIndex for LayerIndex {
    fn insert(&mut self, fid: i64, envelope: Envelope) {
        match self {
            Self::RTree(index) => index.insert(fid, envelope),
            Self::QuadTree(index) => index.insert(fid, envelope),
            Self::Grid(index) => index.insert(fid, envelope),
        }
    }

    fn remove(&mut self, fid: i64) {
        match self {
            Self::RTree(index) => index.remove(fid),
            Self::QuadTree(index) => index.remove(fid),
            Self::Grid(index) => index.remove(fid),
        }
    }

    fn query(&self, envelope: &Envelope) -> Vec<i64> {
        match self {
            Self::RTree(index) => index.query(envelope),
            Self::QuadTree(index) => index.query(envelope),
            Self::Grid(index) => index.query(envelope),
        }
    }

    fn count(&self) -> usize {
        match self {
            Self::RTree(index) => index.count(),
            Self::QuadTree(index) => index.count(),
            Self::Grid(index) => index.count(),
        }
    }

    fn clear(&mut self) {
        match self {
            Self::RTree(index) => index.clear(),
            Self::QuadTree(index) => index.clear(),
            Self::Grid(index) => index.clear(),
        }
    }

    fn envelope_of(&self, fid: i64) -> Option<Envelope> {
        match self {
            Self::RTree(index) => index.envelope_of(fid),
            Self::QuadTree(index) => index.envelope_of(fid),
            Self::Grid(index) => index.envelope_of(fid),
        }
    }

    fn stats(&self) -> IndexStats {
        match self {
            Self::RTree(index) => index.stats(),
            Self::QuadTree(index) => index.stats(),
            Self::Grid(index) => index.stats(),
        }
    }
}

#[derive(Debug, Default)]
pub struct BuildReport {
    pub processed: u64,
    pub skipped: usize,
    /// Defects found while indexing; surfaced ahead of the rule passes.
    pub pre_errors: Vec<ValidationError>,
}

/// Streams a layer into a fresh index. Individual invalid geometries
/// are skipped and surfaced as pre-validation errors; only a missing
/// layer or store failure aborts the build.
pub fn build_index(
    dataset: &VectorDataset,
    layer_name: &str,
    kind: IndexKind,
    context: &CheckContext,
) -> Result<(LayerIndex, BuildReport), EngineError> {
    let extent = dataset.layer_extent(layer_name)?;
    let mut index = LayerIndex::empty(kind, &extent);
    let mut report = BuildReport::default();
    let rule_id = format!("{layer_name}:index-build");
    let started = Instant::now();
    let mut counter = 0usize;

    let processed = dataset.read_features(layer_name, |record| {
        counter += 1;
        if counter % CANCEL_POLL_STRIDE == 0 {
            context.ensure_not_cancelled()?;
        }
        if started.elapsed() > context.layer_timeout {
            return Err(EngineError::Timeout {
                what: format!("index build for layer '{layer_name}'"),
                processed: counter,
            });
        }
        let Some(geometry) = record.geometry.as_ref() else {
            warn!("skipping feature {} of '{layer_name}': no geometry", record.oid);
            report.skipped += 1;
            report.pre_errors.push(ValidationError::new(
                codes::GEOM_INVALID,
                &rule_id,
                layer_name,
                record.oid,
                "feature has no geometry",
            ));
            return Ok(true);
        };
        if let Some(reason) = geometry::basic_validity_reason(geometry) {
            warn!("skipping feature {} of '{layer_name}': {reason}", record.oid);
            report.skipped += 1;
            let mut error = ValidationError::new(
                codes::GEOM_INVALID,
                &rule_id,
                layer_name,
                record.oid,
                reason,
            );
            if let Some((x, y)) = geometry::anchor_point(geometry) {
                error = error.at(x, y);
            }
            report.pre_errors.push(error);
            return Ok(true);
        }
        let vertices = geometry::vertex_count(geometry);
        if vertices > VERTEX_LIMIT {
            warn!(
                "skipping feature {} of '{layer_name}': {vertices} vertices",
                record.oid
            );
            report.skipped += 1;
            let mut error = ValidationError::new(
                codes::GEOM_TOO_COMPLEX,
                &rule_id,
                layer_name,
                record.oid,
                format!("geometry has {vertices} vertices, limit is {VERTEX_LIMIT}"),
            )
            .measured(vertices as f64, VERTEX_LIMIT as f64);
            if let Some((x, y)) = geometry::anchor_point(geometry) {
                error = error.at(x, y);
            }
            report.pre_errors.push(error);
            return Ok(true);
        }

        let feature_started = Instant::now();
        index.insert(record.fid, Envelope::of(geometry));
        if feature_started.elapsed() > context.feature_budget {
            index.remove(record.fid);
            report.skipped += 1;
            let mut error = ValidationError::new(
                codes::GEOM_PROCESSING_TIMEOUT,
                &rule_id,
                layer_name,
                record.oid,
                format!(
                    "indexing one geometry exceeded the {}s budget",
                    context.feature_budget.as_secs()
                ),
            )
            .detail("vertices", json!(vertices));
            if let Some((x, y)) = geometry::anchor_point(geometry) {
                error = error.at(x, y);
            }
            report.pre_errors.push(error);
        }
        Ok(true)
    })?;
    report.processed = processed;
    Ok((index, report))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_envelopes() -> Vec<(i64, Envelope)> {
        vec![
            (1, Envelope::new(0.0, 0.0, 1.0, 1.0)),
            (2, Envelope::new(5.0, 5.0, 6.0, 6.0)),
            (3, Envelope::new(0.5, 0.5, 5.5, 5.5)),
            (4, Envelope::new(9.0, 9.0, 10.0, 10.0)),
        ]
    }

    fn all_kinds() -> Vec<LayerIndex> {
        let extent = Envelope::new(0.0, 0.0, 10.0, 10.0);
        vec![
            LayerIndex::empty(IndexKind::RTree, &extent),
            LayerIndex::empty(IndexKind::QuadTree, &extent),
            LayerIndex::empty(IndexKind::Grid, &extent),
        ]
    }

    #[test]
    fn every_entry_is_found_by_its_own_envelope() {
        for mut index in all_kinds() {
            for (fid, envelope) in sample_envelopes() {
                index.insert(fid, envelope);
            }
            for (fid, envelope) in sample_envelopes() {
                let hits = index.query(&envelope);
                assert!(
                    hits.contains(&fid),
                    "{} lost feature {fid}",
                    index.kind()
                );
            }
        }
    }

    #[test]
    fn disjoint_probe_finds_nothing() {
        for mut index in all_kinds() {
            for (fid, envelope) in sample_envelopes() {
                index.insert(fid, envelope);
            }
            let hits = index.query(&Envelope::new(20.0, 20.0, 30.0, 30.0));
            assert!(hits.is_empty(), "{} over-reported", index.kind());
        }
    }

    #[test]
    fn query_results_are_unique_and_sorted() {
        for mut index in all_kinds() {
            for (fid, envelope) in sample_envelopes() {
                index.insert(fid, envelope);
            }
            let hits = index.query(&Envelope::new(0.0, 0.0, 10.0, 10.0));
            let mut deduped = hits.clone();
            deduped.dedup();
            assert_eq!(hits, deduped);
            let mut sorted = hits.clone();
            sorted.sort();
            assert_eq!(hits, sorted);
            assert_eq!(hits.len(), 4);
        }
    }

    #[test]
    fn removed_entries_stop_matching() {
        for mut index in all_kinds() {
            for (fid, envelope) in sample_envelopes() {
                index.insert(fid, envelope);
            }
            index.remove(3);
            assert_eq!(index.count(), 3);
            assert!(index.envelope_of(3).is_none());
            let hits = index.query(&Envelope::new(2.0, 2.0, 3.0, 3.0));
            assert!(!hits.contains(&3));
        }
    }

    #[test]
    fn clear_empties_the_index() {
        for mut index in all_kinds() {
            for (fid, envelope) in sample_envelopes() {
                index.insert(fid, envelope);
            }
            index.clear();
            assert_eq!(index.count(), 0);
            assert!(index.query(&Envelope::new(0.0, 0.0, 10.0, 10.0)).is_empty());
        }
    }

    #[test]
    fn empty_layer_builds_and_answers() {
        for index in all_kinds() {
            assert_eq!(index.count(), 0);
            assert!(index.query(&Envelope::new(0.0, 0.0, 1.0, 1.0)).is_empty());
            let stats = index.stats();
            assert_eq!(stats.entries, 0);
        }
    }

    #[test]
    fn kind_parses_from_cli_spelling() {
        assert_eq!("rtree".parse::<IndexKind>().unwrap(), IndexKind::RTree);
        assert_eq!("QuadTree".parse::<IndexKind>().unwrap(), IndexKind::QuadTree);
        assert_eq!("grid".parse::<IndexKind>().unwrap(), IndexKind::Grid);
        assert!("kdtree".parse::<IndexKind>().is_err());
    }
}
