use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::geometry::point_wkt;
use crate::rule::Severity;

/// Review state of a stored error record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorStatus {
    Open,
    Reviewed,
    Dismissed,
}

/// One georeferenced defect. Created by an evaluator or checker, mutated
/// once by the classifier, flushed once by the sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationError {
    pub code: String,
    pub rule_id: String,
    pub severity: Severity,
    pub status: ErrorStatus,
    pub source_layer: String,
    pub source_table_id: String,
    pub source_fid: i64,
    pub target_layer: Option<String>,
    pub target_table_id: Option<String>,
    pub target_fid: Option<i64>,
    pub message: String,
    pub error_value: Option<f64>,
    pub threshold: Option<f64>,
    pub x: f64,
    pub y: f64,
    pub geometry_wkt: Option<String>,
    /// Geometry type of the stored defect; always POINT, the location.
    pub geometry_type: String,
    pub details: Value,
    pub detected_at: DateTime<Utc>,
}

impl ValidationError {
    pub fn new(
        code: &str,
        rule_id: impl Into<String>,
        source_layer: impl Into<String>,
        source_fid: i64,
        message: impl Into<String>,
    ) -> Self {
        let source_layer = source_layer.into();
        ValidationError {
            code: code.to_owned(),
            rule_id: rule_id.into(),
            severity: crate::rule::base_severity(code),
            status: ErrorStatus::Open,
            source_table_id: source_layer.clone(),
            source_layer,
            source_fid,
            target_layer: None,
            target_table_id: None,
            target_fid: None,
            message: message.into(),
            error_value: None,
            threshold: None,
            x: f64::NAN,
            y: f64::NAN,
            geometry_wkt: None,
            geometry_type: "POINT".to_owned(),
            details: Value::Object(Map::new()),
            detected_at: Utc::now(),
        }
    }

    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.x = x;
        self.y = y;
        self.geometry_wkt = Some(point_wkt(x, y));
        self
    }

    pub fn against(mut self, target_layer: impl Into<String>, target_fid: i64) -> Self {
        let target_layer = target_layer.into();
        self.target_table_id = Some(target_layer.clone());
        self.target_layer = Some(target_layer);
        self.target_fid = Some(target_fid);
        self
    }

    pub fn measured(mut self, value: f64, threshold: f64) -> Self {
        self.error_value = Some(value);
        self.threshold = Some(threshold);
        self
    }

    pub fn table_id(mut self, id: impl Into<String>) -> Self {
        self.source_table_id = id.into();
        self
    }

    pub fn detail(mut self, key: &str, value: Value) -> Self {
        if let Value::Object(map) = &mut self.details {
            let _previous = map.insert(key.to_owned(), value);
        }
        self
    }

    pub fn detail_get(&self, key: &str) -> Option<&Value> {
        self.details.as_object().and_then(|map| map.get(key))
    }

    pub fn has_location(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    /// Unordered identity of a pair defect, for pass-wide dedup.
    pub fn pair_key(&self) -> (String, i64, i64) {
        let other = self.target_fid.unwrap_or(self.source_fid);
        (
            self.code.clone(),
            self.source_fid.min(other),
            self.source_fid.max(other),
        )
    }
}

/// Run status vocabulary of the QC_Runs layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }
}

/// One row of QC_Runs: a single validation invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub run_name: String,
    pub target_file: String,
    pub ruleset_version: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub executed_by: String,
    pub status: RunStatus,
    pub total_errors: u64,
    pub total_warnings: u64,
    pub summary: String,
}

impl RunRecord {
    pub fn start(
        run_name: impl Into<String>,
        target_file: impl Into<String>,
        ruleset_version: impl Into<String>,
        executed_by: impl Into<String>,
    ) -> Self {
        RunRecord {
            run_id: Uuid::new_v4().to_string(),
            run_name: run_name.into(),
            target_file: target_file.into(),
            ruleset_version: ruleset_version.into(),
            started_at: Utc::now(),
            ended_at: None,
            executed_by: executed_by.into(),
            status: RunStatus::Running,
            total_errors: 0,
            total_warnings: 0,
            summary: String::new(),
        }
    }
}

/// Live counters the sink maintains; updated with every write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorStatistics {
    pub total_errors: u64,
    pub total_warnings: u64,
    pub by_code: HashMap<String, u64>,
    pub by_severity: HashMap<Severity, u64>,
    pub by_table: HashMap<String, u64>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl ErrorStatistics {
    pub fn started(now: DateTime<Utc>) -> Self {
        ErrorStatistics {
            start_time: Some(now),
            ..Default::default()
        }
    }

    pub fn record(&mut self, error: &ValidationError) {
        match error.severity {
            Severity::Warning | Severity::Info => self.total_warnings += 1,
            Severity::Critical | Severity::Error => self.total_errors += 1,
        }
        *self.by_code.entry(error.code.clone()).or_insert(0) += 1;
        *self.by_severity.entry(error.severity).or_insert(0) += 1;
        *self
            .by_table
            .entry(error.source_layer.clone())
            .or_insert(0) += 1;
    }

    pub fn total(&self) -> u64 {
        self.total_errors + self.total_warnings
    }

    pub fn summary_line(&self) -> String {
        let mut codes: Vec<_> = self.by_code.iter().collect();
        codes.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
        let breakdown = codes
            .iter()
            .map(|(code, count)| format!("{code}={count}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "{} errors, {} warnings ({breakdown})",
            self.total_errors, self.total_warnings
        )
    }
}
