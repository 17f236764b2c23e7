//! Geometric and relational validation engine for vector geospatial
//! datasets: spatial indices, per-layer geometry checks, cross-layer
//! topology rules and a streaming error sink over a GDAL error store.

pub mod check;
pub mod classify;
pub mod config;
pub mod dataset;
pub mod errors;
pub mod geometry;
pub mod index;
pub mod memory;
pub mod report;
pub mod rule;
pub mod run;
pub mod sink;

pub use check::CheckContext;
pub use config::RuleSet;
pub use dataset::{
    AttrValue, DriverCapability, FeatureRecord, GdalDrivers, SrsComparison, VectorDataset,
};
pub use errors::EngineError;
pub use geometry::Envelope;
pub use index::{IndexKind, IndexManager, LayerIndex, SpatialIndex};
pub use memory::MemoryController;
pub use report::{ErrorStatistics, RunRecord, RunStatus, ValidationError};
pub use run::{execute_run, JobController, JobStatus, RunOptions, RunOutcome, Stage};
pub use sink::StreamingSink;
