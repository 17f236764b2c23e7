use geo::{BooleanOps, CoordsIter, EuclideanLength};
use geo_types::{Geometry, MultiLineString};
use log::debug;
use serde_json::json;

use super::{CheckContext, PassOutcome, CANCEL_POLL_STRIDE};
use crate::classify::keys;
use crate::dataset::{FeatureRecord, VectorDataset};
use crate::errors::EngineError;
use crate::geometry::{
    anchor_point, first_intersection_point, intersection_point_count, is_lineal, is_polygonal,
    is_puntal, to_linestrings, to_multi_polygon,
};
use crate::index::{IndexKind, IndexManager, SpatialIndex};
use crate::report::ValidationError;
use crate::rule::{codes, RelationRule, SpatialRelation};

/// Runs one cross-layer relation rule. Point-against-polygon and
/// line-against-polygon pairs get their specialised semantics; any
/// other combination is evaluated through the generic predicate.
pub fn run_relation_rule<Emit>(
    dataset: &VectorDataset,
    rule: &RelationRule,
    context: &CheckContext,
    manager: &IndexManager,
    index_kind: IndexKind,
    mut emit: Emit,
) -> Result<PassOutcome, EngineError>
where
    Emit: FnMut(ValidationError) -> Result<(), EngineError>,
{
    debug!("relation rule {} starting", rule.rule_id());
    let (source_index, source_report) =
        super::index_or_fallback(manager, dataset, &rule.source_layer, index_kind, context)?;
    let (target_index, target_report) =
        super::index_or_fallback(manager, dataset, &rule.target_layer, index_kind, context)?;

    let target_is_polygonal = target_layer_is_polygonal(dataset, &rule.target_layer)?;
    let mut targets = TargetReader::new(dataset, &rule.target_layer);
    let mut outcome = PassOutcome::default();
    super::emit_build_report(source_report, &mut outcome, &mut emit)?;
    super::emit_build_report(target_report, &mut outcome, &mut emit)?;

    for (position, (source_fid, envelope)) in source_index.entries().into_iter().enumerate() {
        if position % CANCEL_POLL_STRIDE == 0 {
            context.ensure_not_cancelled()?;
        }
        outcome.processed += 1;
        let Some(record) = dataset.feature_by_id(&rule.source_layer, source_fid)? else {
            continue;
        };
        let Some(geometry) = record.geometry.as_ref() else { continue };
        let probe = envelope.expand_by(rule.tolerance);
        let candidates = target_index.query(&probe);

        let found = if is_puntal(geometry) && target_is_polygonal {
            point_in_polygon(rule, &record, geometry, &candidates, &mut targets)?
        } else if is_lineal(geometry) && target_is_polygonal {
            line_against_polygons(rule, &record, geometry, &candidates, &mut targets)?
        } else {
            generic_relation(rule, &record, geometry, &candidates, &mut targets)?
        };
        for error in found {
            outcome.emitted += 1;
            emit(error)?;
        }
    }
    Ok(outcome)
}

/// The declared layer geometry type, falling back to the first stored
/// feature when the layer does not declare one.
fn target_layer_is_polygonal(
    dataset: &VectorDataset,
    layer: &str,
) -> Result<bool, EngineError> {
    let declared = dataset.layer_geometry_type(layer)?;
    if declared.contains("POLYGON") {
        return Ok(true);
    }
    let undeclared = declared.contains("UNKNOWN") || declared == "NONE" || declared == "GEOMETRY";
    if !undeclared {
        return Ok(false);
    }
    let mut polygonal = false;
    let _scanned = dataset.read_features(layer, |record| {
        if let Some(geometry) = record.geometry.as_ref() {
            polygonal = is_polygonal(geometry);
            return Ok(false);
        }
        Ok(true)
    })?;
    Ok(polygonal)
}

fn relation_error(
    rule: &RelationRule,
    code: &str,
    oid: i64,
    message: impl Into<String>,
) -> ValidationError {
    ValidationError::new(code, rule.rule_id(), &rule.source_layer, oid, message)
        .detail(keys::LABEL, json!(rule.relation.korean_label()))
        .detail(keys::BASE_SEVERITY, json!(rule.severity.storage_code()))
        .detail(keys::RELATION_CRITICAL, json!(rule.relation.is_critical()))
        .detail("relation", json!(rule.relation.code()))
}

/// Required: the point must fall inside some polygon. Forbidden: it
/// must not fall inside any.
fn point_in_polygon(
    rule: &RelationRule,
    record: &FeatureRecord,
    geometry: &Geometry<f64>,
    candidates: &[i64],
    targets: &mut TargetReader,
) -> Result<Vec<ValidationError>, EngineError> {
    let mut found = Vec::new();
    let mut contained = false;
    for fid in candidates {
        let Some(target) = targets.fetch(*fid)? else { continue };
        let Some(target_geometry) = target.geometry.as_ref() else { continue };
        if SpatialRelation::Within.evaluate(geometry, target_geometry) {
            contained = true;
            if !rule.required {
                let Some((x, y)) = anchor_point(geometry) else { continue };
                found.push(
                    relation_error(
                        rule,
                        codes::POINT_IN_POLYGON_VIOLATION,
                        record.oid,
                        "point inside a forbidden polygon",
                    )
                    .against(&rule.target_layer, target.oid)
                    .at(x, y),
                );
            } else {
                break;
            }
        }
    }
    if rule.required && !contained {
        if let Some((x, y)) = anchor_point(geometry) {
            found.push(
                relation_error(
                    rule,
                    codes::POINT_IN_POLYGON_VIOLATION,
                    record.oid,
                    "point not inside any required polygon",
                )
                .at(x, y),
            );
        }
    }
    Ok(found)
}

/// Interaction classes in evaluation order; the first match wins.
fn classify_interaction(
    line: &Geometry<f64>,
    polygon: &Geometry<f64>,
) -> Option<&'static str> {
    for (name, relation) in [
        ("within", SpatialRelation::Within),
        ("crosses", SpatialRelation::Crosses),
        ("touches", SpatialRelation::Touches),
        ("overlaps", SpatialRelation::Overlaps),
        ("intersects", SpatialRelation::Intersects),
    ] {
        if relation.evaluate(line, polygon) {
            return Some(name);
        }
    }
    None
}

fn mid_vertex(geometry: &Geometry<f64>) -> Option<(f64, f64)> {
    let count = geometry.coords_count();
    geometry
        .coords_iter()
        .nth(count / 2)
        .map(|coord| (coord.x, coord.y))
}

fn clipped_length(line: &Geometry<f64>, polygon: &Geometry<f64>) -> f64 {
    let Some(own) = to_multi_polygon(polygon) else { return 0.0 };
    let lines = MultiLineString::new(to_linestrings(line));
    own.clip(&lines, false).euclidean_length()
}

/// Required: the line must interact with some polygon per the rule's
/// relation. Forbidden: any such interaction is a violation, located at
/// the first intersection point and measured by the clipped length.
/// Disjoint inverts into a forbidden/required Intersects, since a truly
/// disjoint polygon never surfaces as an envelope candidate.
fn line_against_polygons(
    rule: &RelationRule,
    record: &FeatureRecord,
    geometry: &Geometry<f64>,
    candidates: &[i64],
    targets: &mut TargetReader,
) -> Result<Vec<ValidationError>, EngineError> {
    let (relation, required) = match rule.relation {
        SpatialRelation::Disjoint => (SpatialRelation::Intersects, !rule.required),
        other => (other, rule.required),
    };
    let mut found = Vec::new();
    let mut satisfied = false;
    for fid in candidates {
        let Some(target) = targets.fetch(*fid)? else { continue };
        let Some(target_geometry) = target.geometry.as_ref() else { continue };
        if !relation.evaluate(geometry, target_geometry) {
            continue;
        }
        satisfied = true;
        if required {
            break;
        }
        // The interaction class only decorates the message.
        let interaction =
            classify_interaction(geometry, target_geometry).unwrap_or(rule.relation.code());
        let message = match rule.relation {
            SpatialRelation::Disjoint => {
                format!("line {interaction} a polygon it must stay disjoint from")
            }
            _ => format!("line {interaction} a forbidden polygon"),
        };
        let location = first_intersection_point(geometry, target_geometry)
            .or_else(|| anchor_point(geometry));
        let Some((x, y)) = location else { continue };
        found.push(
            relation_error(rule, codes::LINE_POLYGON_VIOLATION, record.oid, message)
                .against(&rule.target_layer, target.oid)
                .at(x, y)
                .detail(
                    "intersection_length",
                    json!(clipped_length(geometry, target_geometry)),
                )
                .detail(
                    "intersection_point_count",
                    json!(intersection_point_count(geometry, target_geometry)),
                ),
        );
    }
    if required && !satisfied {
        // No interaction at all: anchor at the line's mid-vertex.
        let message = match rule.relation {
            SpatialRelation::Disjoint => {
                "line touches no polygon though disjointness is forbidden".to_owned()
            }
            other => format!("line has no required {} interaction", other.code()),
        };
        if let Some((x, y)) = mid_vertex(geometry).or_else(|| anchor_point(geometry)) {
            found.push(
                relation_error(rule, codes::LINE_POLYGON_VIOLATION, record.oid, message)
                    .at(x, y)
                    .detail("intersection_length", json!(0.0))
                    .detail("intersection_point_count", json!(0)),
            );
        }
    }
    Ok(found)
}

/// Any other geometry pairing: the rule's predicate, evaluated exactly
/// on every candidate. A required Disjoint inverts into a forbidden
/// Intersects and vice versa, since disjointness cannot be probed
/// through an envelope index.
fn generic_relation(
    rule: &RelationRule,
    record: &FeatureRecord,
    geometry: &Geometry<f64>,
    candidates: &[i64],
    targets: &mut TargetReader,
) -> Result<Vec<ValidationError>, EngineError> {
    let (relation, required) = match rule.relation {
        SpatialRelation::Disjoint => (SpatialRelation::Intersects, !rule.required),
        other => (other, rule.required),
    };
    let mut found = Vec::new();
    let mut satisfied = false;
    for fid in candidates {
        let Some(target) = targets.fetch(*fid)? else { continue };
        let Some(target_geometry) = target.geometry.as_ref() else { continue };
        if relation.evaluate(geometry, target_geometry) {
            satisfied = true;
            if required {
                break;
            }
            let location = first_intersection_point(geometry, target_geometry)
                .or_else(|| anchor_point(geometry));
            let Some((x, y)) = location else { continue };
            found.push(
                relation_error(
                    rule,
                    rule.relation.code(),
                    record.oid,
                    format!("forbidden {} relation holds", rule.relation.code()),
                )
                .against(&rule.target_layer, target.oid)
                .at(x, y),
            );
        }
    }
    if required && !satisfied {
        if let Some((x, y)) = anchor_point(geometry) {
            found.push(
                relation_error(
                    rule,
                    rule.relation.code(),
                    record.oid,
                    format!("required {} relation not satisfied", rule.relation.code()),
                )
                .at(x, y),
            );
        }
    }
    Ok(found)
}

/// Random-access target fetches with a bounded cache.
struct TargetReader<'a> {
    dataset: &'a VectorDataset,
    layer: &'a str,
    held: std::collections::HashMap<i64, Option<FeatureRecord>>,
}

impl<'a> TargetReader<'a> {
    const CAP: usize = 10_000;

    fn new(dataset: &'a VectorDataset, layer: &'a str) -> Self {
        TargetReader {
            dataset,
            layer,
            held: std::collections::HashMap::new(),
        }
    }

    fn fetch(&mut self, fid: i64) -> Result<Option<FeatureRecord>, EngineError> {
        if self.held.len() > Self::CAP {
            self.held.clear();
        }
        if let Some(record) = self.held.get(&fid) {
            return Ok(record.clone());
        }
        let record = self.dataset.feature_by_id(self.layer, fid)?;
        let _previous = self.held.insert(fid, record.clone());
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryController, DEFAULT_CEILING_BYTES};
    use crate::rule::Severity;
    use gdal::vector::{LayerOptions, OGRwkbGeometryType, ToGdal};
    use geo::{line_string, point, polygon};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn context() -> CheckContext {
        CheckContext::new(Arc::new(MemoryController::new(DEFAULT_CEILING_BYTES)))
    }

    fn relation_rule(relation: SpatialRelation, required: bool) -> RelationRule {
        RelationRule {
            source_layer: "source".to_owned(),
            target_layer: "target".to_owned(),
            relation,
            required,
            severity: Severity::Error,
            tolerance: 1e-3,
        }
    }

    fn dataset_with(
        source: Vec<geo_types::Geometry<f64>>,
        target: Vec<geo_types::Geometry<f64>>,
    ) -> VectorDataset {
        let driver = gdal::DriverManager::get_driver_by_name("Memory").expect("memory driver");
        let mut dataset = driver.create_vector_only("relation-test").expect("dataset");
        for (name, geometries) in [("source", source), ("target", target)] {
            let mut layer = dataset
                .create_layer(LayerOptions {
                    name,
                    ty: OGRwkbGeometryType::wkbUnknown,
                    ..Default::default()
                })
                .expect("layer");
            for geometry in geometries {
                layer
                    .create_feature(geometry.to_gdal().expect("gdal geometry"))
                    .expect("feature");
            }
        }
        VectorDataset::from_dataset(dataset, PathBuf::from("relation-test"))
    }

    fn collect(dataset: &VectorDataset, rule: &RelationRule) -> Vec<ValidationError> {
        let manager = IndexManager::new();
        let mut errors = Vec::new();
        let _outcome = run_relation_rule(
            dataset,
            rule,
            &context(),
            &manager,
            IndexKind::Grid,
            |error| {
                errors.push(error);
                Ok(())
            },
        )
        .expect("pass");
        errors
    }

    fn zone() -> geo_types::Geometry<f64> {
        polygon![
            (x: 0.0, y: 0.0), (x: 10.0, y: 0.0), (x: 10.0, y: 10.0), (x: 0.0, y: 10.0), (x: 0.0, y: 0.0)
        ]
        .into()
    }

    #[test]
    fn outside_point_violates_a_required_containment() {
        let dataset = dataset_with(
            vec![
                point! {x: 1.0, y: 1.0}.into(),
                point! {x: 100.0, y: 100.0}.into(),
            ],
            vec![zone()],
        );
        let rule = relation_rule(SpatialRelation::Within, true);
        let errors = collect(&dataset, &rule);
        assert_eq!(errors.len(), 1);
        let error = &errors[0];
        assert_eq!(error.code, codes::POINT_IN_POLYGON_VIOLATION);
        assert_eq!((error.x, error.y), (100.0, 100.0));
    }

    #[test]
    fn inside_point_violates_a_forbidden_containment() {
        let dataset = dataset_with(
            vec![point! {x: 1.0, y: 1.0}.into(), point! {x: 50.0, y: 50.0}.into()],
            vec![zone()],
        );
        let rule = relation_rule(SpatialRelation::Within, false);
        let errors = collect(&dataset, &rule);
        assert_eq!(errors.len(), 1);
        assert_eq!((errors[0].x, errors[0].y), (1.0, 1.0));
        assert!(errors[0].target_fid.is_some());
    }

    #[test]
    fn crossing_line_reports_length_and_points() {
        let dataset = dataset_with(
            vec![line_string![(x: -5.0, y: 5.0), (x: 15.0, y: 5.0)].into()],
            vec![zone()],
        );
        let rule = relation_rule(SpatialRelation::Crosses, false);
        let errors = collect(&dataset, &rule);
        assert_eq!(errors.len(), 1);
        let error = &errors[0];
        assert_eq!(error.code, codes::LINE_POLYGON_VIOLATION);
        let length = error
            .detail_get("intersection_length")
            .and_then(|value| value.as_f64())
            .unwrap();
        assert!((length - 10.0).abs() < 1e-6);
        let crossings = error
            .detail_get("intersection_point_count")
            .and_then(|value| value.as_u64())
            .unwrap();
        assert_eq!(crossings, 2);
    }

    #[test]
    fn disjoint_line_rules_cut_both_ways() {
        let dataset = dataset_with(
            vec![
                // Crosses the zone.
                line_string![(x: -5.0, y: 5.0), (x: 15.0, y: 5.0)].into(),
                // Nowhere near it.
                line_string![(x: 20.0, y: 20.0), (x: 30.0, y: 20.0)].into(),
            ],
            vec![zone()],
        );

        let required = relation_rule(SpatialRelation::Disjoint, true);
        let errors = collect(&dataset, &required);
        assert_eq!(errors.len(), 1, "only the crossing line breaks required disjointness");
        assert_eq!(errors[0].code, codes::LINE_POLYGON_VIOLATION);
        assert_eq!(errors[0].y, 5.0);
        assert!(errors[0].target_fid.is_some());

        let forbidden = relation_rule(SpatialRelation::Disjoint, false);
        let errors = collect(&dataset, &forbidden);
        assert_eq!(errors.len(), 1, "only the detached line stays disjoint");
        assert_eq!(errors[0].code, codes::LINE_POLYGON_VIOLATION);
        // Mid-vertex of the detached line.
        assert_eq!(errors[0].y, 20.0);
        assert!(errors[0].target_fid.is_none());
    }

    #[test]
    fn detached_line_violates_a_required_interaction() {
        let dataset = dataset_with(
            vec![line_string![(x: 20.0, y: 20.0), (x: 30.0, y: 20.0)].into()],
            vec![zone()],
        );
        let rule = relation_rule(SpatialRelation::Intersects, true);
        let errors = collect(&dataset, &rule);
        assert_eq!(errors.len(), 1);
        let error = &errors[0];
        assert_eq!(error.code, codes::LINE_POLYGON_VIOLATION);
        // Mid-vertex of the detached line.
        assert_eq!(error.y, 20.0);
    }

    #[test]
    fn generic_polygon_relation_holds_both_ways() {
        let dataset = dataset_with(
            vec![zone()],
            vec![
                polygon![(x: 2.0, y: 2.0), (x: 4.0, y: 2.0), (x: 4.0, y: 4.0), (x: 2.0, y: 4.0), (x: 2.0, y: 2.0)]
                    .into(),
            ],
        );
        let required = relation_rule(SpatialRelation::Contains, true);
        assert!(collect(&dataset, &required).is_empty());
        let forbidden = relation_rule(SpatialRelation::Contains, false);
        assert_eq!(collect(&dataset, &forbidden).len(), 1);
    }

    #[test]
    fn required_disjoint_flags_intersecting_features() {
        let dataset = dataset_with(
            vec![zone()],
            vec![
                polygon![(x: 5.0, y: 5.0), (x: 15.0, y: 5.0), (x: 15.0, y: 15.0), (x: 5.0, y: 15.0), (x: 5.0, y: 5.0)]
                    .into(),
            ],
        );
        let rule = relation_rule(SpatialRelation::Disjoint, true);
        let errors = collect(&dataset, &rule);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, "REL_DISJOINT");
    }
}
