use std::collections::HashSet;

use serde_json::json;

use crate::geometry::{envelope_center_from_wkt, point_wkt};
use crate::report::ValidationError;
use crate::rule::base_severity;

/// Detail keys the emitters fill in for the classifier.
pub mod keys {
    /// Rule tolerance, for the within-tolerance downgrade.
    pub const TOLERANCE: &str = "tolerance";
    /// Distance from the defect to the source geometry's boundary.
    pub const BORDER_DISTANCE: &str = "border_distance";
    /// Set when the violated relation is Within/Contains/Crosses.
    pub const RELATION_CRITICAL: &str = "relation_critical";
    /// Korean display label of the rule or relation kind.
    pub const LABEL: &str = "label";
    /// The emitter's original message, kept so enrichment can be
    /// re-applied without compounding.
    pub const RAW_MESSAGE: &str = "raw_message";
    /// WKT of the originating feature, location fallback source.
    pub const SOURCE_WKT: &str = "source_wkt";
    /// Storage code of a rule-declared base severity, overriding the
    /// per-code default.
    pub const BASE_SEVERITY: &str = "base_severity";
}

/// Severity assignment and adjustment, message enrichment, location
/// repair. Idempotent: everything is recomputed from the code and the
/// stashed raw material, never from a previous classification.
pub fn classify(error: &mut ValidationError) {
    let mut severity = error
        .detail_get(keys::BASE_SEVERITY)
        .and_then(|value| value.as_str())
        .and_then(crate::rule::Severity::from_storage_code)
        .unwrap_or_else(|| base_severity(&error.code));

    if error
        .detail_get(keys::RELATION_CRITICAL)
        .and_then(|value| value.as_bool())
        .unwrap_or(false)
    {
        severity = severity.step_up();
    }

    let tolerance = error
        .detail_get(keys::TOLERANCE)
        .and_then(|value| value.as_f64());
    if let (Some(value), Some(tolerance)) = (error.error_value, tolerance) {
        if value.abs() < tolerance {
            severity = severity.step_down();
        }
    }
    if let (Some(border), Some(tolerance)) = (
        error
            .detail_get(keys::BORDER_DISTANCE)
            .and_then(|value| value.as_f64()),
        tolerance,
    ) {
        if border < tolerance {
            severity = severity.step_down();
        }
    }
    error.severity = severity;

    repair_location(error);

    let raw = match error.detail_get(keys::RAW_MESSAGE) {
        Some(value) => value.as_str().unwrap_or_default().to_owned(),
        None => {
            let raw = error.message.clone();
            if let Some(map) = error.details.as_object_mut() {
                let _previous = map.insert(keys::RAW_MESSAGE.to_owned(), json!(raw));
            }
            raw
        }
    };
    let label = error
        .detail_get(keys::LABEL)
        .and_then(|value| value.as_str())
        .unwrap_or("검수")
        .to_owned();
    error.message = if error.has_location() {
        format!(
            "[{label}] {}: {raw} ({:.4}, {:.4})",
            error.rule_id, error.x, error.y
        )
    } else {
        format!("[{label}] {}: {raw}", error.rule_id)
    };
}

/// Non-finite coordinates fall back to the envelope centre of the
/// originating feature's WKT, when one was preserved.
fn repair_location(error: &mut ValidationError) {
    if error.has_location() {
        return;
    }
    let fallback = error
        .detail_get(keys::SOURCE_WKT)
        .and_then(|value| value.as_str())
        .and_then(envelope_center_from_wkt);
    if let Some((x, y)) = fallback {
        error.x = x;
        error.y = y;
        error.geometry_wkt = Some(point_wkt(x, y));
    }
}

pub fn classify_all(errors: &mut [ValidationError]) {
    for error in errors.iter_mut() {
        classify(error);
    }
}

/// Ordered snapshot: severity first, then source feature id.
pub fn sort_snapshot(errors: &mut [ValidationError]) {
    errors.sort_by(|a, b| {
        a.severity
            .cmp(&b.severity)
            .then(a.source_fid.cmp(&b.source_fid))
    });
}

/// Drops repeated defects: the same code on the same unordered feature
/// pair (or the same single feature) is reported once.
pub fn dedup_errors(errors: Vec<ValidationError>) -> Vec<ValidationError> {
    let mut seen: HashSet<(String, String, i64, i64)> = HashSet::new();
    errors
        .into_iter()
        .filter(|error| {
            let (code, low, high) = error.pair_key();
            seen.insert((code, error.source_layer.clone(), low, high))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{codes, Severity};

    fn overlap_error() -> ValidationError {
        ValidationError::new(
            codes::OVERLAP_VIOLATION,
            "parcels~buildings:OVERLAP_VIOLATION",
            "parcels",
            12,
            "overlap of area 25",
        )
        .against("buildings", 7)
        .at(7.5, 7.5)
        .measured(25.0, 0.01)
        .detail(keys::TOLERANCE, json!(0.01))
        .detail(keys::LABEL, json!("겹침금지"))
    }

    #[test]
    fn classification_is_idempotent() {
        let mut once = overlap_error();
        classify(&mut once);
        let mut twice = once.clone();
        classify(&mut twice);
        assert_eq!(once.severity, twice.severity);
        assert_eq!(once.message, twice.message);
        assert_eq!(once.x, twice.x);
        assert_eq!(once.details, twice.details);
    }

    #[test]
    fn message_carries_label_rule_and_location() {
        let mut error = overlap_error();
        classify(&mut error);
        assert!(error.message.contains("겹침금지"));
        assert!(error.message.contains("parcels~buildings:OVERLAP_VIOLATION"));
        assert!(error.message.contains("7.5000"));
        assert_eq!(error.severity, Severity::Error);
    }

    #[test]
    fn within_tolerance_violations_step_down() {
        let mut error = overlap_error().measured(0.005, 0.01);
        classify(&mut error);
        assert_eq!(error.severity, Severity::Warning);
    }

    #[test]
    fn border_defects_step_down() {
        let mut error = overlap_error().detail(keys::BORDER_DISTANCE, json!(0.001));
        classify(&mut error);
        assert_eq!(error.severity, Severity::Warning);
    }

    #[test]
    fn critical_relations_step_up() {
        let mut error = ValidationError::new(
            "REL_WITHIN",
            "wells~parcels:REL_WITHIN",
            "wells",
            3,
            "well outside any parcel",
        )
        .at(100.0, 100.0)
        .detail(keys::RELATION_CRITICAL, json!(true));
        classify(&mut error);
        assert_eq!(error.severity, Severity::Critical);
    }

    #[test]
    fn missing_location_recovers_from_source_wkt() {
        let mut error = ValidationError::new(
            codes::GEOM_INVALID,
            "parcels:GEOM_INVALID",
            "parcels",
            4,
            "broken ring",
        )
        .detail(
            keys::SOURCE_WKT,
            json!("POLYGON ((0 0, 4 0, 4 2, 0 2, 0 0))"),
        );
        assert!(!error.has_location());
        classify(&mut error);
        assert!(error.has_location());
        assert_eq!((error.x, error.y), (2.0, 1.0));
        assert_eq!(error.geometry_wkt.as_deref(), Some("POINT (2 1)"));
    }

    #[test]
    fn snapshot_sorts_by_severity_then_fid() {
        let mut errors = vec![
            ValidationError::new(codes::NOT_COVERED, "r", "a", 9, ""),
            ValidationError::new(codes::GAP_DETECTED, "r", "a", 5, ""),
            ValidationError::new(codes::GAP_DETECTED, "r", "a", 2, ""),
        ];
        classify_all(&mut errors);
        sort_snapshot(&mut errors);
        assert_eq!(errors[0].source_fid, 2);
        assert_eq!(errors[1].source_fid, 5);
        assert_eq!(errors[2].code, codes::NOT_COVERED);
    }

    #[test]
    fn unordered_pairs_dedup() {
        let first = overlap_error();
        let mut flipped = overlap_error();
        flipped.source_fid = 7;
        flipped.target_fid = Some(12);
        let kept = dedup_errors(vec![first, flipped]);
        assert_eq!(kept.len(), 1);
    }
}
