use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use gdal::spatial_ref::SpatialRef;
use gdal::vector::{FieldDefn, FieldValue, LayerAccess, LayerOptions, OGRFieldType, OGRwkbGeometryType};
use gdal::{Dataset, DatasetOptions, GdalOpenFlags};
use log::{error as log_error, info, warn};

use crate::dataset::create_dataset;
use crate::errors::EngineError;
use crate::report::{ErrorStatistics, RunRecord, RunStatus, ValidationError};
use crate::rule::base_severity;

pub const RUNS_LAYER: &str = "QC_Runs";
pub const POINT_ERRORS_LAYER: &str = "QC_Errors_Point";
pub const NO_GEOM_ERRORS_LAYER: &str = "QC_Errors_NoGeom";

/// One transactional append per this many buffered errors.
pub const DEFAULT_WRITE_BATCH: usize = 500;

const RUN_FIELDS: [(&str, OGRFieldType::Type); 13] = [
    ("GlobalID", OGRFieldType::OFTString),
    ("RunName", OGRFieldType::OFTString),
    ("TargetFilePath", OGRFieldType::OFTString),
    ("RulesetVersion", OGRFieldType::OFTString),
    ("StartTimeUTC", OGRFieldType::OFTString),
    ("EndTimeUTC", OGRFieldType::OFTString),
    ("ExecutedBy", OGRFieldType::OFTString),
    ("Status", OGRFieldType::OFTString),
    ("TotalErrors", OGRFieldType::OFTInteger64),
    ("TotalWarnings", OGRFieldType::OFTInteger64),
    ("ResultSummary", OGRFieldType::OFTString),
    ("CreatedUTC", OGRFieldType::OFTString),
    ("UpdatedUTC", OGRFieldType::OFTString),
];

/// Writes errors to the error store as they arrive, never holding the
/// full result set. Statistics track every write; the per-run record is
/// created at stream start and completed on finalize. A batch the store
/// refuses goes to a JSON-lines side log instead of aborting the pass.
pub struct StreamingSink {
    dataset: Dataset,
    path: PathBuf,
    run: RunRecord,
    run_fid: Option<u64>,
    batch: Vec<ValidationError>,
    batch_size: usize,
    statistics: ErrorStatistics,
    side_log: PathBuf,
    failed_batches: u64,
}

impl StreamingSink {
    pub fn create(
        path: &Path,
        driver: Option<String>,
        run: RunRecord,
        srs: Option<&SpatialRef>,
    ) -> Result<Self, EngineError> {
        let mut dataset = if path.exists() {
            let options = DatasetOptions {
                open_flags: GdalOpenFlags::GDAL_OF_VECTOR | GdalOpenFlags::GDAL_OF_UPDATE,
                ..Default::default()
            };
            Dataset::open_ex(path, options)
                .map_err(|error| EngineError::StoreOpen(path.to_path_buf(), format!("{error}")))?
        } else {
            create_dataset(path, driver)?
        };
        Self::ensure_layers(&mut dataset, srs)?;
        let side_log = path.with_extension("sidelog.jsonl");
        let mut sink = StreamingSink {
            dataset,
            path: path.to_path_buf(),
            run,
            run_fid: None,
            batch: Vec::with_capacity(DEFAULT_WRITE_BATCH),
            batch_size: DEFAULT_WRITE_BATCH,
            statistics: ErrorStatistics::started(Utc::now()),
            side_log,
            failed_batches: 0,
        };
        sink.insert_run_row()?;
        Ok(sink)
    }

    /// In-memory sink over an already-open dataset; used by tests.
    pub(crate) fn over_dataset(dataset: Dataset, run: RunRecord) -> Result<Self, EngineError> {
        let mut dataset = dataset;
        Self::ensure_layers(&mut dataset, None)?;
        let mut sink = StreamingSink {
            dataset,
            path: PathBuf::from("memory"),
            run,
            run_fid: None,
            batch: Vec::with_capacity(DEFAULT_WRITE_BATCH),
            batch_size: DEFAULT_WRITE_BATCH,
            statistics: ErrorStatistics::started(Utc::now()),
            side_log: std::env::temp_dir().join("spatial-qc-sidelog.jsonl"),
            failed_batches: 0,
        };
        sink.insert_run_row()?;
        Ok(sink)
    }

    fn ensure_layers(dataset: &mut Dataset, srs: Option<&SpatialRef>) -> Result<(), EngineError> {
        let existing: Vec<String> = dataset.layers().map(|layer| layer.name()).collect();
        if !existing.iter().any(|name| name == RUNS_LAYER) {
            let runs = dataset.create_layer(LayerOptions {
                name: RUNS_LAYER,
                ty: OGRwkbGeometryType::wkbNone,
                ..Default::default()
            })?;
            runs.create_defn_fields(&RUN_FIELDS)?;
        }
        if !existing.iter().any(|name| name == POINT_ERRORS_LAYER) {
            let points = dataset.create_layer(LayerOptions {
                name: POINT_ERRORS_LAYER,
                ty: OGRwkbGeometryType::wkbPoint,
                srs,
                ..Default::default()
            })?;
            Self::create_error_fields(&points, true)?;
        }
        if !existing.iter().any(|name| name == NO_GEOM_ERRORS_LAYER) {
            let bare = dataset.create_layer(LayerOptions {
                name: NO_GEOM_ERRORS_LAYER,
                ty: OGRwkbGeometryType::wkbNone,
                ..Default::default()
            })?;
            Self::create_error_fields(&bare, false)?;
        }
        Ok(())
    }

    fn create_error_fields(layer: &gdal::vector::Layer, with_xy: bool) -> Result<(), EngineError> {
        for (name, width) in [
            ("ErrCode", 32),
            ("TableId", 128),
            ("TableName", 128),
            ("RelatedTableId", 128),
            ("RelatedTableName", 128),
        ] {
            let field = FieldDefn::new(name, OGRFieldType::OFTString)?;
            field.set_width(width);
            field.add_to_layer(layer)?;
        }
        let oid = FieldDefn::new("SourceOID", OGRFieldType::OFTInteger64)?;
        oid.add_to_layer(layer)?;
        let message = FieldDefn::new("Message", OGRFieldType::OFTString)?;
        message.set_width(1024);
        message.add_to_layer(layer)?;
        if with_xy {
            for name in ["X", "Y"] {
                let field = FieldDefn::new(name, OGRFieldType::OFTReal)?;
                field.add_to_layer(layer)?;
            }
        }
        Ok(())
    }

    pub fn run(&self) -> &RunRecord {
        &self.run
    }

    pub fn statistics(&self) -> &ErrorStatistics {
        &self.statistics
    }

    pub fn write_one(&mut self, error: ValidationError) -> Result<(), EngineError> {
        self.statistics.record(&error);
        self.batch.push(error);
        if self.batch.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    pub fn write_many(
        &mut self,
        errors: impl IntoIterator<Item = ValidationError>,
    ) -> Result<(), EngineError> {
        for error in errors {
            self.write_one(error)?;
        }
        Ok(())
    }

    /// One transactional append for the buffered batch. A failed write
    /// lands in the side log; the upstream pass is not aborted.
    pub fn flush(&mut self) -> Result<(), EngineError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.batch);
        match self.append_batch(&batch) {
            Ok(()) => {}
            Err(error) => {
                log_error!("error store write failed, {} records to side log: {error}", batch.len());
                self.failed_batches += 1;
                self.side_log_batch(&batch);
            }
        }
        Ok(())
    }

    fn append_batch(&mut self, batch: &[ValidationError]) -> Result<(), EngineError> {
        match self.dataset.start_transaction() {
            Ok(transaction) => {
                Self::write_records(&transaction, batch)?;
                transaction.commit()?;
            }
            Err(_) => {
                // Driver without transactions; plain appends.
                Self::write_records(&self.dataset, batch)?;
            }
        }
        self.dataset.flush_cache();
        Ok(())
    }

    fn write_records(dataset: &Dataset, batch: &[ValidationError]) -> Result<(), EngineError> {
        let point_layer = dataset.layer_by_name(POINT_ERRORS_LAYER)?;
        let bare_layer = dataset.layer_by_name(NO_GEOM_ERRORS_LAYER)?;
        for record in batch {
            if record.has_location() {
                Self::write_record(&point_layer, record, true)?;
            } else {
                Self::write_record(&bare_layer, record, false)?;
            }
        }
        Ok(())
    }

    fn write_record(
        layer: &gdal::vector::Layer,
        record: &ValidationError,
        with_xy: bool,
    ) -> Result<(), EngineError> {
        let mut feature = gdal::vector::Feature::new(layer.defn())?;
        feature.set_field("ErrCode", &FieldValue::StringValue(record.code.clone()))?;
        feature.set_field(
            "TableId",
            &FieldValue::StringValue(record.source_table_id.clone()),
        )?;
        feature.set_field(
            "TableName",
            &FieldValue::StringValue(record.source_layer.clone()),
        )?;
        feature.set_field(
            "RelatedTableId",
            &FieldValue::StringValue(record.target_table_id.clone().unwrap_or_default()),
        )?;
        feature.set_field(
            "RelatedTableName",
            &FieldValue::StringValue(record.target_layer.clone().unwrap_or_default()),
        )?;
        feature.set_field("SourceOID", &FieldValue::Integer64Value(record.source_fid))?;
        let mut message = record.message.clone();
        if message.len() > 1024 {
            let mut cut = 1024;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        feature.set_field("Message", &FieldValue::StringValue(message))?;
        if with_xy {
            feature.set_field("X", &FieldValue::RealValue(record.x))?;
            feature.set_field("Y", &FieldValue::RealValue(record.y))?;
            let wkt = record
                .geometry_wkt
                .clone()
                .unwrap_or_else(|| crate::geometry::point_wkt(record.x, record.y));
            feature.set_geometry(gdal::vector::Geometry::from_wkt(&wkt)?)?;
        }
        feature.create(layer)?;
        Ok(())
    }

    fn side_log_batch(&self, batch: &[ValidationError]) {
        let opened = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.side_log);
        match opened {
            Ok(mut file) => {
                for record in batch {
                    if let Ok(line) = serde_json::to_string(record) {
                        if writeln!(file, "{line}").is_err() {
                            warn!("side log write failed, records dropped");
                            return;
                        }
                    }
                }
            }
            Err(error) => warn!("side log {:?} unavailable: {error}", self.side_log),
        }
    }

    fn insert_run_row(&mut self) -> Result<(), EngineError> {
        let layer = self.dataset.layer_by_name(RUNS_LAYER)?;
        let feature = gdal::vector::Feature::new(layer.defn())?;
        let now = Utc::now().to_rfc3339();
        feature.set_field("GlobalID", &FieldValue::StringValue(self.run.run_id.clone()))?;
        feature.set_field("RunName", &FieldValue::StringValue(self.run.run_name.clone()))?;
        feature.set_field(
            "TargetFilePath",
            &FieldValue::StringValue(self.run.target_file.clone()),
        )?;
        feature.set_field(
            "RulesetVersion",
            &FieldValue::StringValue(self.run.ruleset_version.clone()),
        )?;
        feature.set_field(
            "StartTimeUTC",
            &FieldValue::StringValue(self.run.started_at.to_rfc3339()),
        )?;
        feature.set_field(
            "ExecutedBy",
            &FieldValue::StringValue(self.run.executed_by.clone()),
        )?;
        feature.set_field(
            "Status",
            &FieldValue::StringValue(self.run.status.as_str().to_owned()),
        )?;
        feature.set_field("TotalErrors", &FieldValue::Integer64Value(0))?;
        feature.set_field("TotalWarnings", &FieldValue::Integer64Value(0))?;
        feature.set_field("CreatedUTC", &FieldValue::StringValue(now.clone()))?;
        feature.set_field("UpdatedUTC", &FieldValue::StringValue(now))?;
        feature.create(&layer)?;
        self.run_fid = feature.fid();
        info!("run {} recorded in {}", self.run.run_id, RUNS_LAYER);
        Ok(())
    }

    fn update_run_row(&mut self) -> Result<(), EngineError> {
        let layer = self.dataset.layer_by_name(RUNS_LAYER)?;
        let Some(fid) = self.run_fid else {
            return Err(EngineError::StoreWrite("run row was never created".to_owned()));
        };
        let feature = layer.feature(fid).ok_or_else(|| {
            EngineError::StoreWrite(format!("run row {fid} disappeared from {RUNS_LAYER}"))
        })?;
        feature.set_field(
            "Status",
            &FieldValue::StringValue(self.run.status.as_str().to_owned()),
        )?;
        if let Some(ended) = self.run.ended_at {
            feature.set_field("EndTimeUTC", &FieldValue::StringValue(ended.to_rfc3339()))?;
        }
        feature.set_field(
            "TotalErrors",
            &FieldValue::Integer64Value(self.run.total_errors as i64),
        )?;
        feature.set_field(
            "TotalWarnings",
            &FieldValue::Integer64Value(self.run.total_warnings as i64),
        )?;
        feature.set_field(
            "ResultSummary",
            &FieldValue::StringValue(self.run.summary.clone()),
        )?;
        feature.set_field(
            "UpdatedUTC",
            &FieldValue::StringValue(Utc::now().to_rfc3339()),
        )?;
        layer.set_feature(feature)?;
        Ok(())
    }

    /// Flushes the tail batch, completes the run record and returns the
    /// final statistics. A run with side-logged batches finishes Failed.
    pub fn finalize(&mut self, status: RunStatus) -> Result<ErrorStatistics, EngineError> {
        self.flush()?;
        let status = if self.failed_batches > 0 && status == RunStatus::Completed {
            RunStatus::Failed
        } else {
            status
        };
        self.run.status = status;
        self.run.ended_at = Some(Utc::now());
        self.run.total_errors = self.statistics.total_errors;
        self.run.total_warnings = self.statistics.total_warnings;
        self.run.summary = self.statistics.summary_line();
        self.statistics.end_time = self.run.ended_at;
        self.update_run_row()?;
        self.dataset.flush_cache();
        Ok(self.statistics.clone())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn failed_batches(&self) -> u64 {
        self.failed_batches
    }
}

/// Rebuilds statistics from a persisted error store. Severities are
/// derived from the stored codes; totals come from the error rows.
pub fn read_statistics(path: &Path) -> Result<ErrorStatistics, EngineError> {
    let dataset = Dataset::open(path)
        .map_err(|error| EngineError::StoreOpen(path.to_path_buf(), format!("{error}")))?;
    read_statistics_from(&dataset)
}

pub(crate) fn read_statistics_from(dataset: &Dataset) -> Result<ErrorStatistics, EngineError> {
    let mut statistics = ErrorStatistics::default();
    for layer_name in [POINT_ERRORS_LAYER, NO_GEOM_ERRORS_LAYER] {
        let mut layer = dataset.layer_by_name(layer_name)?;
        for feature in layer.features() {
            let code = match feature.field("ErrCode")? {
                Some(FieldValue::StringValue(code)) => code,
                _ => continue,
            };
            let table = match feature.field("TableName")? {
                Some(FieldValue::StringValue(table)) => table,
                _ => String::new(),
            };
            let severity = base_severity(&code);
            match severity {
                crate::rule::Severity::Critical | crate::rule::Severity::Error => {
                    statistics.total_errors += 1
                }
                _ => statistics.total_warnings += 1,
            }
            *statistics.by_code.entry(code).or_insert(0) += 1;
            *statistics.by_severity.entry(severity).or_insert(0) += 1;
            *statistics.by_table.entry(table).or_insert(0) += 1;
        }
    }
    Ok(statistics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify;
    use crate::rule::codes;

    fn run() -> RunRecord {
        RunRecord::start("unit", "/tmp/data.gdb", "v1", "tester")
    }

    fn memory_sink() -> StreamingSink {
        let driver = gdal::DriverManager::get_driver_by_name("Memory").expect("memory driver");
        let dataset = driver.create_vector_only("sink-test").expect("dataset");
        StreamingSink::over_dataset(dataset, run()).expect("sink")
    }

    fn located_error(fid: i64) -> ValidationError {
        let mut error = ValidationError::new(
            codes::OVERLAP_VIOLATION,
            "parcels~roads:OVERLAP_VIOLATION",
            "parcels",
            fid,
            "overlap",
        )
        .against("roads", fid + 1000)
        .at(fid as f64, 2.0 * fid as f64);
        classify(&mut error);
        error
    }

    fn unlocated_error(fid: i64) -> ValidationError {
        ValidationError::new(codes::TABLE_MISSING, "t", "ghost_layer", fid, "layer missing")
    }

    #[test]
    fn errors_split_between_point_and_bare_layers() {
        let mut sink = memory_sink();
        sink.write_many((0..5).map(located_error)).expect("write");
        sink.write_one(unlocated_error(9)).expect("write");
        let statistics = sink.finalize(RunStatus::Completed).expect("finalize");
        assert_eq!(statistics.total(), 6);
        let rebuilt = read_statistics_from(&sink.dataset).expect("read back");
        assert_eq!(rebuilt.by_code[codes::OVERLAP_VIOLATION], 5);
        assert_eq!(rebuilt.by_code[codes::TABLE_MISSING], 1);
        assert_eq!(rebuilt.by_table["parcels"], 5);
        assert_eq!(rebuilt.total_errors, statistics.total_errors);
        assert_eq!(rebuilt.total_warnings, statistics.total_warnings);
    }

    #[test]
    fn run_row_reaches_terminal_state() {
        let mut sink = memory_sink();
        sink.write_one(located_error(1)).expect("write");
        let _statistics = sink.finalize(RunStatus::Cancelled).expect("finalize");
        assert_eq!(sink.run().status, RunStatus::Cancelled);
        let layer = sink.dataset.layer_by_name(RUNS_LAYER).expect("runs layer");
        let feature = layer.feature(sink.run_fid.expect("fid")).expect("run row");
        match feature.field("Status").expect("field") {
            Some(FieldValue::StringValue(status)) => assert_eq!(status, "Cancelled"),
            other => panic!("unexpected status field {other:?}"),
        }
        match feature.field("TotalErrors").expect("field") {
            Some(FieldValue::Integer64Value(count)) => assert_eq!(count, 1),
            other => panic!("unexpected count field {other:?}"),
        }
    }

    #[test]
    fn statistics_follow_every_write() {
        let mut sink = memory_sink();
        for fid in 0..3 {
            sink.write_one(located_error(fid)).expect("write");
        }
        assert_eq!(sink.statistics().total_errors, 3);
        assert_eq!(sink.statistics().by_table["parcels"], 3);
        assert_eq!(sink.failed_batches(), 0);
    }
}
