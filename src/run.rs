use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::check::{self, CheckContext};
use crate::classify::classify;
use crate::config::RuleSet;
use crate::dataset::VectorDataset;
use crate::errors::EngineError;
use crate::index::{IndexKind, IndexManager};
use crate::memory::{MemoryController, PressureAction, PressureEvent, DEFAULT_CEILING_BYTES};
use crate::report::{ErrorStatistics, RunRecord, RunStatus, ValidationError};
use crate::rule::codes;
use crate::sink::StreamingSink;

/// The five pipeline stages, numbered as the job-control surface counts
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    TableChecks,
    Schema,
    Geometry,
    AttributeRelation,
    SpatialRelation,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Self::TableChecks,
        Self::Schema,
        Self::Geometry,
        Self::AttributeRelation,
        Self::SpatialRelation,
    ];

    pub fn number(&self) -> u32 {
        match self {
            Self::TableChecks => 1,
            Self::Schema => 2,
            Self::Geometry => 3,
            Self::AttributeRelation => 4,
            Self::SpatialRelation => 5,
        }
    }

    pub fn from_number(number: u32) -> Option<Stage> {
        Stage::ALL.into_iter().find(|stage| stage.number() == number)
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::TableChecks => "table checks",
            Self::Schema => "schema checks",
            Self::Geometry => "geometry rules",
            Self::AttributeRelation => "attribute relations",
            Self::SpatialRelation => "spatial relations",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: Stage,
    pub state: StageState,
    pub errors: u64,
    pub warnings: u64,
    pub duration_ms: u64,
    pub note: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub store_path: PathBuf,
    pub output_path: PathBuf,
    pub output_driver: Option<String>,
    pub stages: Vec<Stage>,
    pub stop_on_table_failure: bool,
    pub index_kind: IndexKind,
    pub run_name: String,
    pub executed_by: String,
    pub memory_ceiling_bytes: u64,
}

impl RunOptions {
    pub fn new(store_path: PathBuf, output_path: PathBuf) -> Self {
        RunOptions {
            store_path,
            output_path,
            output_driver: None,
            stages: Stage::ALL.to_vec(),
            stop_on_table_failure: false,
            index_kind: IndexKind::RTree,
            run_name: "validation".to_owned(),
            executed_by: whoami(),
            memory_ceiling_bytes: DEFAULT_CEILING_BYTES,
        }
    }
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_owned())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run: RunRecord,
    pub statistics: ErrorStatistics,
    pub stages: Vec<StageResult>,
    pub state: RunStatus,
}

/// Live view of a running job, §6's job-status payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: RunStatus,
    pub progress: f64,
    pub current_stage: Option<u32>,
    pub errors: u64,
    pub warnings: u64,
    pub elapsed_seconds: f64,
    pub remaining_seconds: Option<f64>,
}

impl JobStatus {
    fn pending() -> Self {
        JobStatus {
            state: RunStatus::Running,
            progress: 0.0,
            current_stage: None,
            errors: 0,
            warnings: 0,
            elapsed_seconds: 0.0,
            remaining_seconds: None,
        }
    }
}

#[derive(Clone)]
pub struct ProgressHandle {
    status: Arc<Mutex<JobStatus>>,
    started: Instant,
}

impl Default for ProgressHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressHandle {
    pub fn new() -> Self {
        ProgressHandle {
            status: Arc::new(Mutex::new(JobStatus::pending())),
            started: Instant::now(),
        }
    }

    pub fn snapshot(&self) -> JobStatus {
        self.status.lock().expect("job status poisoned").clone()
    }

    fn update(
        &self,
        stage: Option<Stage>,
        progress: f64,
        statistics: &ErrorStatistics,
    ) {
        let elapsed = self.started.elapsed().as_secs_f64();
        let mut status = self.status.lock().expect("job status poisoned");
        status.current_stage = stage.map(|stage| stage.number());
        status.progress = progress.clamp(0.0, 1.0);
        status.errors = statistics.total_errors;
        status.warnings = statistics.total_warnings;
        status.elapsed_seconds = elapsed;
        status.remaining_seconds = if progress > 0.01 {
            Some(elapsed / progress * (1.0 - progress))
        } else {
            None
        };
    }

    fn finish(&self, state: RunStatus) {
        let mut status = self.status.lock().expect("job status poisoned");
        status.state = state;
        if state == RunStatus::Completed {
            status.progress = 1.0;
            status.remaining_seconds = Some(0.0);
        }
    }
}

/// Executes the stage pipeline against one store and streams every
/// defect through the classifier into the sink. Cancellation produces a
/// Cancelled outcome with partial results preserved; only store-open
/// and configuration failures surface as hard errors.
pub fn execute_run(
    options: &RunOptions,
    ruleset: &RuleSet,
    context: &CheckContext,
    progress: &ProgressHandle,
) -> Result<RunOutcome, EngineError> {
    ruleset.validate()?;
    let dataset = VectorDataset::open(&options.store_path)?;
    let srs = ruleset
        .referenced_layers()
        .iter()
        .find_map(|layer| dataset.layer_spatial_ref(layer).ok().flatten());

    let run = RunRecord::start(
        options.run_name.clone(),
        options.store_path.display().to_string(),
        ruleset.version.clone(),
        options.executed_by.clone(),
    );
    let mut sink = StreamingSink::create(
        &options.output_path,
        options.output_driver.clone(),
        run,
        srs.as_ref(),
    )?;

    let manager = IndexManager::new();
    let pressure_events = context.memory.subscribe();

    let mut stages: Vec<StageResult> = Vec::new();
    let mut skip_remaining = false;
    let mut cancelled = false;
    let planned: Vec<Stage> = Stage::ALL
        .into_iter()
        .filter(|stage| options.stages.contains(stage))
        .collect();
    let total = planned.len().max(1) as f64;

    for (position, stage) in planned.iter().copied().enumerate() {
        let state = if cancelled {
            StageState::Cancelled
        } else if skip_remaining {
            StageState::Skipped
        } else {
            StageState::Running
        };
        if state != StageState::Running {
            stages.push(StageResult {
                stage,
                state,
                errors: 0,
                warnings: 0,
                duration_ms: 0,
                note: None,
            });
            continue;
        }

        drain_pressure_events(&pressure_events, &manager);
        info!("stage {} ({}) starting", stage.number(), stage.title());
        let started = Instant::now();
        let before_errors = sink.statistics().total_errors;
        let before_warnings = sink.statistics().total_warnings;
        progress.update(Some(stage), position as f64 / total, sink.statistics());

        let ran = run_stage(stage, &dataset, ruleset, context, &manager, options, &mut sink);
        let duration_ms = started.elapsed().as_millis() as u64;
        let errors = sink.statistics().total_errors - before_errors;
        let warnings = sink.statistics().total_warnings - before_warnings;
        let result = match ran {
            Ok(note) => {
                let failed = stage == Stage::TableChecks && errors > 0;
                if failed && options.stop_on_table_failure {
                    warn!("table checks failed, skipping remaining stages");
                    skip_remaining = true;
                }
                StageResult {
                    stage,
                    state: if failed { StageState::Failed } else { StageState::Completed },
                    errors,
                    warnings,
                    duration_ms,
                    note,
                }
            }
            Err(EngineError::Cancelled) => {
                cancelled = true;
                StageResult {
                    stage,
                    state: StageState::Cancelled,
                    errors,
                    warnings,
                    duration_ms,
                    note: None,
                }
            }
            Err(error) => {
                warn!("stage {} failed: {error}", stage.number());
                StageResult {
                    stage,
                    state: StageState::Failed,
                    errors,
                    warnings,
                    duration_ms,
                    note: Some(format!("{error}")),
                }
            }
        };
        stages.push(result);
        progress.update(Some(stage), (position + 1) as f64 / total, sink.statistics());
    }

    // Cancellation clears the index cache; partial results stay in the
    // sink.
    if cancelled {
        manager.clear_cache();
    }
    let state = if cancelled {
        RunStatus::Cancelled
    } else if stages.iter().any(|stage| stage.state == StageState::Failed) {
        RunStatus::Failed
    } else {
        RunStatus::Completed
    };
    let statistics = sink.finalize(state)?;
    let run = sink.run().clone();
    progress.finish(run.status);
    info!("run {} finished: {}", run.run_id, run.summary);
    Ok(RunOutcome {
        state: run.status,
        run,
        statistics,
        stages,
    })
}

fn drain_pressure_events(events: &Receiver<PressureEvent>, manager: &IndexManager) {
    while let Ok(event) = events.try_recv() {
        if event.suggested == PressureAction::ReleaseCaches {
            info!("releasing index cache under memory pressure ({:.2})", event.ratio);
            manager.clear_cache();
        }
    }
}

fn run_stage(
    stage: Stage,
    dataset: &VectorDataset,
    ruleset: &RuleSet,
    context: &CheckContext,
    manager: &IndexManager,
    options: &RunOptions,
    sink: &mut StreamingSink,
) -> Result<Option<String>, EngineError> {
    let mut emit = |mut error: ValidationError| -> Result<(), EngineError> {
        classify(&mut error);
        sink.write_one(error)
    };
    let mut notes: Vec<String> = Vec::new();
    match stage {
        Stage::TableChecks => {
            for layer in ruleset.referenced_layers() {
                context.ensure_not_cancelled()?;
                if !dataset.table_exists(&layer) {
                    emit(ValidationError::new(
                        codes::TABLE_MISSING,
                        format!("{layer}:table"),
                        &layer,
                        -1,
                        "layer does not exist in the store",
                    ))?;
                    continue;
                }
                if let Err(error) = dataset.record_count(&layer) {
                    emit(ValidationError::new(
                        codes::TABLE_READ_FAILED,
                        format!("{layer}:table"),
                        &layer,
                        -1,
                        format!("record count unavailable: {error}"),
                    ))?;
                }
            }
        }
        Stage::Schema => {
            for table in &ruleset.tables {
                context.ensure_not_cancelled()?;
                if !dataset.table_exists(&table.table_name) {
                    continue;
                }
                let declared = dataset.layer_geometry_type(&table.table_name)?;
                let expected = table.geometry_type.to_uppercase();
                let matches = declared.contains(&expected)
                    || expected.contains(&declared)
                    || declared.contains("UNKNOWN");
                if !expected.is_empty() && !matches {
                    emit(
                        ValidationError::new(
                            codes::SCHEMA_MISMATCH,
                            format!("{}:schema", table.table_name),
                            &table.table_name,
                            -1,
                            format!(
                                "declared geometry type {expected} but layer stores {declared}"
                            ),
                        )
                        .table_id(table.table_id.clone()),
                    )?;
                }
            }
        }
        Stage::Geometry => {
            for rule in &ruleset.geometry {
                context.ensure_not_cancelled()?;
                if !dataset.table_exists(&rule.layer) {
                    continue;
                }
                let outcome =
                    check::geometry::run_geometry_rule(dataset, rule, context, &mut emit);
                note_pass(&mut notes, rule.rule_id(), outcome)?;
            }
        }
        Stage::AttributeRelation => {
            for rule in &ruleset.relations {
                context.ensure_not_cancelled()?;
                if !dataset.table_exists(&rule.source_layer)
                    || !dataset.table_exists(&rule.target_layer)
                {
                    continue;
                }
                let outcome = check::relation::run_relation_rule(
                    dataset,
                    rule,
                    context,
                    manager,
                    options.index_kind,
                    &mut emit,
                );
                note_pass(&mut notes, rule.rule_id(), outcome)?;
            }
        }
        Stage::SpatialRelation => {
            for rule in &ruleset.topology {
                context.ensure_not_cancelled()?;
                if !dataset.table_exists(&rule.source_layer) {
                    continue;
                }
                if let Some(target) = &rule.target_layer {
                    if !dataset.table_exists(target) {
                        continue;
                    }
                }
                let outcome = check::topology::run_topology_rule(
                    dataset,
                    rule,
                    context,
                    manager,
                    options.index_kind,
                    &mut emit,
                );
                note_pass(&mut notes, rule.rule_id(), outcome)?;
            }
        }
    }
    if notes.is_empty() {
        Ok(None)
    } else {
        Ok(Some(notes.join("; ")))
    }
}

/// Per-rule failures other than cancellation become a stage note; a
/// timeout additionally leaves its mark as a warning note per §7.
fn note_pass(
    notes: &mut Vec<String>,
    rule_id: String,
    outcome: Result<check::PassOutcome, EngineError>,
) -> Result<(), EngineError> {
    match outcome {
        Ok(_) => Ok(()),
        Err(EngineError::Cancelled) => Err(EngineError::Cancelled),
        Err(EngineError::Timeout { what, processed }) => {
            warn!("rule {rule_id} timed out after {processed} features");
            notes.push(format!("{rule_id}: {what} timed out after {processed} features"));
            Ok(())
        }
        Err(error) => {
            warn!("rule {rule_id} failed: {error}");
            notes.push(format!("{rule_id}: {error}"));
            Ok(())
        }
    }
}

struct Job {
    context: CheckContext,
    progress: ProgressHandle,
    result: Arc<Mutex<Option<Result<RunOutcome, String>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// The job-control surface: start, observe, cancel and collect
/// validation runs. Each job runs on its own thread with its own
/// cancellation flag.
pub struct JobController {
    jobs: Mutex<HashMap<u64, Arc<Job>>>,
    next_id: AtomicU64,
}

impl Default for JobController {
    fn default() -> Self {
        Self::new()
    }
}

impl JobController {
    pub fn new() -> Self {
        JobController {
            jobs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn start_validation(&self, options: RunOptions, ruleset: RuleSet) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let memory = Arc::new(MemoryController::new(options.memory_ceiling_bytes));
        let context = CheckContext::new(memory);
        let job = Arc::new(Job {
            context: context.clone(),
            progress: ProgressHandle::new(),
            result: Arc::new(Mutex::new(None)),
            worker: Mutex::new(None),
        });
        let progress = job.progress.clone();
        let result = Arc::clone(&job.result);
        let worker = std::thread::spawn(move || {
            let outcome = execute_run(&options, &ruleset, &context, &progress)
                .map_err(|error| format!("{error}"));
            if let Err(ref error) = outcome {
                progress.finish(RunStatus::Failed);
                warn!("job failed: {error}");
            }
            *result.lock().expect("job result poisoned") = Some(outcome);
        });
        *job.worker.lock().expect("job worker poisoned") = Some(worker);
        let _previous = self
            .jobs
            .lock()
            .expect("job table poisoned")
            .insert(id, job);
        id
    }

    pub fn job_status(&self, id: u64) -> Option<JobStatus> {
        self.job(id).map(|job| job.progress.snapshot())
    }

    pub fn job_result(&self, id: u64) -> Option<Result<RunOutcome, String>> {
        self.job(id)
            .and_then(|job| job.result.lock().expect("job result poisoned").clone())
    }

    pub fn cancel_job(&self, id: u64) -> bool {
        match self.job(id) {
            Some(job) => {
                job.context.request_cancel();
                true
            }
            None => false,
        }
    }

    /// Blocks until the job's worker finishes and returns its outcome.
    pub fn wait(&self, id: u64) -> Option<Result<RunOutcome, String>> {
        let job = self.job(id)?;
        let worker = job.worker.lock().expect("job worker poisoned").take();
        if let Some(worker) = worker {
            let _joined = worker.join();
        }
        self.job_result(id)
    }

    fn job(&self, id: u64) -> Option<Arc<Job>> {
        self.jobs.lock().expect("job table poisoned").get(&id).cloned()
    }
}
