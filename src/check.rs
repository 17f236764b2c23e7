pub mod geometry;
pub mod relation;
pub mod topology;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::EngineError;
use crate::memory::MemoryController;

/// Cancellation is polled at every batch boundary and every this many
/// features within one.
pub const CANCEL_POLL_STRIDE: usize = 100;
/// Soft per-feature processing budget.
pub const FEATURE_BUDGET: Duration = Duration::from_secs(5);
/// Per-layer index build timeout.
pub const LAYER_BUILD_TIMEOUT: Duration = Duration::from_secs(300);
/// Vertex count above which a geometry is rejected as too complex.
pub const VERTEX_LIMIT: usize = 500_000;
/// Feature count above which cross-layer passes switch to chunked
/// streaming with spatial filters.
pub const LARGE_LAYER_THRESHOLD: i64 = 10_000;
/// WKT byte length above which a geometry is simplified before the
/// exact predicate call.
pub const SIMPLIFY_WKT_BYTES: usize = 1024 * 1024;

/// Shared state of one validation pass: the cooperative cancellation
/// flag, the process memory controller and the per-feature budgets.
#[derive(Clone)]
pub struct CheckContext {
    cancel: Arc<AtomicBool>,
    pub memory: Arc<MemoryController>,
    pub feature_budget: Duration,
    pub layer_timeout: Duration,
}

impl CheckContext {
    pub fn new(memory: Arc<MemoryController>) -> Self {
        CheckContext {
            cancel: Arc::new(AtomicBool::new(false)),
            memory,
            feature_budget: FEATURE_BUDGET,
            layer_timeout: LAYER_BUILD_TIMEOUT,
        }
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn ensure_not_cancelled(&self) -> Result<(), EngineError> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Index acquisition with the linear-scan fallback: when a build fails
/// for a reason other than cancellation, retry with the grid variant,
/// whose single-pass build is the cheapest scan the store allows.
pub(crate) fn index_or_fallback(
    manager: &crate::index::IndexManager,
    dataset: &crate::dataset::VectorDataset,
    layer: &str,
    kind: crate::index::IndexKind,
    context: &CheckContext,
) -> Result<
    (
        std::sync::Arc<crate::index::LayerIndex>,
        crate::index::BuildReport,
    ),
    EngineError,
> {
    match manager.create_index(dataset, layer, kind, context) {
        Ok(built) => Ok(built),
        Err(EngineError::Cancelled) => Err(EngineError::Cancelled),
        Err(error) if kind != crate::index::IndexKind::Grid => {
            log::warn!("{kind} index build for '{layer}' failed ({error}), falling back to grid");
            manager.create_index(dataset, layer, crate::index::IndexKind::Grid, context)
        }
        Err(error) => Err(error),
    }
}

/// What one rule pass did.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassOutcome {
    pub processed: u64,
    pub emitted: usize,
}

/// Forwards the pre-validation defects an index build collected. A
/// cached index returns an empty report, so nothing is emitted twice.
pub(crate) fn emit_build_report<Emit>(
    report: crate::index::BuildReport,
    outcome: &mut PassOutcome,
    emit: &mut Emit,
) -> Result<(), EngineError>
where
    Emit: FnMut(crate::report::ValidationError) -> Result<(), EngineError>,
{
    for error in report.pre_errors {
        outcome.emitted += 1;
        emit(error)?;
    }
    Ok(())
}

/// Streams a layer in batches sized by the memory controller, polling
/// cancellation at every batch boundary and every hundred features.
pub(crate) fn for_each_batch<Handle>(
    dataset: &crate::dataset::VectorDataset,
    layer: &str,
    context: &CheckContext,
    mut handle: Handle,
) -> Result<u64, EngineError>
where
    Handle: FnMut(&[crate::dataset::FeatureRecord]) -> Result<(), EngineError>,
{
    let mut sizer = crate::memory::BatchSizer::new(&context.memory);
    let mut batch: Vec<crate::dataset::FeatureRecord> = Vec::with_capacity(sizer.current());
    let mut counter = 0usize;
    let processed = dataset.read_features(layer, |record| {
        counter += 1;
        if counter % CANCEL_POLL_STRIDE == 0 {
            context.ensure_not_cancelled()?;
        }
        batch.push(record);
        if batch.len() >= sizer.current() {
            context.ensure_not_cancelled()?;
            handle(&batch)?;
            batch.clear();
            let _next = sizer.after_batch();
        }
        Ok(true)
    })?;
    if !batch.is_empty() {
        context.ensure_not_cancelled()?;
        handle(&batch)?;
    }
    Ok(processed)
}
