use std::collections::{HashMap, HashSet};
use std::time::Instant;

use geo::{Area, BooleanOps};
use geo_types::Geometry;
use log::debug;
use rayon::prelude::*;
use serde_json::json;

use super::{for_each_batch, CheckContext, PassOutcome};
use crate::classify::keys;
use crate::dataset::{FeatureRecord, VectorDataset};
use crate::errors::EngineError;
use crate::geometry::{
    anchor_point, area_of, basic_validity_reason, boundary_distance, geometry_distance,
    length_of, perimeter_of, self_intersections, to_multi_polygon, to_wkt, vertex_count,
    Envelope,
};
use crate::index::{GridIndex, SpatialIndex};
use crate::report::ValidationError;
use crate::rule::{codes, GeometryCheck, GeometryRule};

/// WKT longer than this is not copied into detailsJson.
const DETAIL_WKT_CAP: usize = 64 * 1024;

/// Runs one geometry rule over its layer, forwarding every defect to
/// the emit callback in source-feature order.
pub fn run_geometry_rule<Emit>(
    dataset: &VectorDataset,
    rule: &GeometryRule,
    context: &CheckContext,
    emit: Emit,
) -> Result<PassOutcome, EngineError>
where
    Emit: FnMut(ValidationError) -> Result<(), EngineError>,
{
    debug!("geometry rule {} starting", rule.rule_id());
    match rule.check {
        GeometryCheck::DuplicateGeom
        | GeometryCheck::OverlapGeom
        | GeometryCheck::PolygonInPolygon => run_pair_check(dataset, rule, context, emit),
        _ => run_per_feature_check(dataset, rule, context, emit),
    }
}

fn run_per_feature_check<Emit>(
    dataset: &VectorDataset,
    rule: &GeometryRule,
    context: &CheckContext,
    mut emit: Emit,
) -> Result<PassOutcome, EngineError>
where
    Emit: FnMut(ValidationError) -> Result<(), EngineError>,
{
    let mut outcome = PassOutcome::default();
    let budget = context.feature_budget;
    let processed = for_each_batch(dataset, &rule.layer, context, |batch| {
        // The predicates are pure; evaluate the batch in parallel and
        // emit in feature order afterwards.
        let defects: Vec<Vec<ValidationError>> = batch
            .par_iter()
            .map(|record| {
                let started = Instant::now();
                let mut found = feature_defects(rule, record);
                if started.elapsed() > budget {
                    found.push(budget_exceeded(rule, record, budget.as_secs()));
                }
                found
            })
            .collect();
        for error in defects.into_iter().flatten() {
            outcome.emitted += 1;
            emit(error)?;
        }
        Ok(())
    })?;
    outcome.processed = processed;
    Ok(outcome)
}

fn budget_exceeded(rule: &GeometryRule, record: &FeatureRecord, seconds: u64) -> ValidationError {
    let mut error = ValidationError::new(
        codes::GEOM_PROCESSING_TIMEOUT,
        rule.rule_id(),
        &rule.layer,
        record.oid,
        format!("processing one feature exceeded the {seconds}s budget"),
    );
    if let Some(table_id) = &rule.table_id {
        error = error.table_id(table_id.clone());
    }
    if let Some((x, y)) = record.geometry.as_ref().and_then(anchor_point) {
        error = error.at(x, y);
    }
    error.detail(keys::LABEL, json!(rule.check.korean_label()))
}

/// The single-feature checks: validity, self-intersection, sliver,
/// short length, small area.
fn feature_defects(rule: &GeometryRule, record: &FeatureRecord) -> Vec<ValidationError> {
    let mut found = Vec::new();
    let Some(geometry) = record.geometry.as_ref() else {
        if rule.check == GeometryCheck::BasicValidity {
            found.push(base_error(rule, record, "feature has no geometry"));
        }
        return found;
    };
    match rule.check {
        GeometryCheck::BasicValidity => {
            if let Some(reason) = basic_validity_reason(geometry) {
                found.push(located(base_error(rule, record, reason), geometry));
            } else if vertex_count(geometry) > super::VERTEX_LIMIT {
                let vertices = vertex_count(geometry);
                let error = ValidationError::new(
                    codes::GEOM_TOO_COMPLEX,
                    rule.rule_id(),
                    &rule.layer,
                    record.oid,
                    format!("geometry has {vertices} vertices, limit is {}", super::VERTEX_LIMIT),
                )
                .measured(vertices as f64, super::VERTEX_LIMIT as f64)
                .detail(keys::LABEL, json!(rule.check.korean_label()));
                found.push(located(error, geometry));
            }
        }
        GeometryCheck::SelfIntersect => {
            let crossings = self_intersections(geometry).crossings;
            if let Some(first) = crossings.first() {
                let error = base_error(rule, record, "geometry crosses itself")
                    .at(first.x, first.y)
                    .detail("crossing_count", json!(crossings.len()));
                found.push(with_source_wkt(error, geometry));
            }
        }
        GeometryCheck::Sliver => {
            let area = area_of(geometry);
            let perimeter = perimeter_of(geometry);
            if area > 0.0
                && area < rule.thresholds.small_area
                && perimeter * perimeter / area > rule.thresholds.sliverness
            {
                let error = base_error(rule, record, "sliver polygon")
                    .measured(perimeter * perimeter / area, rule.thresholds.sliverness)
                    .detail("area", json!(area))
                    .detail("perimeter", json!(perimeter));
                found.push(located(error, geometry));
            }
        }
        GeometryCheck::ShortLength => {
            let length = length_of(geometry);
            if length > 0.0 && length < rule.thresholds.short_length {
                let error = base_error(rule, record, "line shorter than threshold")
                    .measured(length, rule.thresholds.short_length);
                found.push(located(error, geometry));
            }
        }
        GeometryCheck::SmallArea => {
            let area = area_of(geometry);
            if area > 0.0 && area < rule.thresholds.small_area {
                let error = base_error(rule, record, "polygon smaller than threshold")
                    .measured(area, rule.thresholds.small_area);
                found.push(located(error, geometry));
            }
        }
        // Pair checks are handled by run_pair_check.
        GeometryCheck::DuplicateGeom
        | GeometryCheck::OverlapGeom
        | GeometryCheck::PolygonInPolygon => {}
    }
    found
}

fn base_error(rule: &GeometryRule, record: &FeatureRecord, message: &str) -> ValidationError {
    let mut error = ValidationError::new(
        rule.code(),
        rule.rule_id(),
        &rule.layer,
        record.oid,
        message,
    )
    .detail(keys::LABEL, json!(rule.check.korean_label()));
    if let Some(table_id) = &rule.table_id {
        error = error.table_id(table_id.clone());
    }
    error
}

fn located(error: ValidationError, geometry: &Geometry<f64>) -> ValidationError {
    let error = match anchor_point(geometry) {
        Some((x, y)) => error.at(x, y),
        None => error,
    };
    with_source_wkt(error, geometry)
}

fn with_source_wkt(error: ValidationError, geometry: &Geometry<f64>) -> ValidationError {
    match to_wkt(geometry) {
        Ok(wkt) if wkt.len() <= DETAIL_WKT_CAP => error.detail(keys::SOURCE_WKT, json!(wkt)),
        _ => error,
    }
}

/// Candidate-pair sweep over one layer: an adaptive grid keyed on the
/// tolerance-expanded envelopes, each unordered pair evaluated once.
fn run_pair_check<Emit>(
    dataset: &VectorDataset,
    rule: &GeometryRule,
    context: &CheckContext,
    mut emit: Emit,
) -> Result<PassOutcome, EngineError>
where
    Emit: FnMut(ValidationError) -> Result<(), EngineError>,
{
    let extent = dataset.layer_extent(&rule.layer)?;
    let mut grid = GridIndex::adaptive(extent, rule.tolerance.max(f64::EPSILON));
    let mut oids: HashMap<i64, i64> = HashMap::new();

    let mut counter = 0usize;
    let _indexed = dataset.read_features(&rule.layer, |record| {
        counter += 1;
        if counter % super::CANCEL_POLL_STRIDE == 0 {
            context.ensure_not_cancelled()?;
        }
        if let Some(geometry) = record.geometry.as_ref() {
            let envelope = Envelope::of(geometry).expand_by(rule.tolerance);
            grid.insert(record.fid, envelope);
            let _previous = oids.insert(record.fid, record.oid);
        }
        Ok(true)
    })?;

    // Phase two walks the indexed entries in feature order with random
    // reads only, so no sequential cursor stays open while candidates
    // are fetched from the same layer.
    let mut entries: Vec<(i64, Envelope)> =
        grid.entry_map().iter().map(|(fid, env)| (*fid, *env)).collect();
    entries.sort_by_key(|(fid, _)| *fid);

    let mut outcome = PassOutcome::default();
    let mut processed_pairs: HashSet<(i64, i64)> = HashSet::new();
    let mut cache: GeometryCache = GeometryCache::new(dataset, &rule.layer);
    let mut sizer = crate::memory::BatchSizer::new(&context.memory);

    for (position, (fid, probe)) in entries.iter().enumerate() {
        let fid = *fid;
        if position % super::CANCEL_POLL_STRIDE == 0 {
            context.ensure_not_cancelled()?;
        }
        if position > 0 && position % sizer.current().max(1) == 0 {
            let _next = sizer.after_batch();
            cache.trim();
        }
        outcome.processed += 1;
        let Some(geometry) = cache.fetch(fid)? else {
            continue;
        };
        let oid = oids.get(&fid).copied().unwrap_or(fid);
        for candidate_fid in grid.query(probe) {
            if candidate_fid == fid {
                continue;
            }
            let pair = (fid.min(candidate_fid), fid.max(candidate_fid));
            if !processed_pairs.insert(pair) {
                continue;
            }
            let Some(candidate) = cache.fetch(candidate_fid)? else {
                continue;
            };
            let candidate_oid = oids.get(&candidate_fid).copied().unwrap_or(candidate_fid);
            if let Some(error) =
                evaluate_pair(rule, oid, &geometry, candidate_oid, &candidate)
            {
                outcome.emitted += 1;
                emit(error)?;
            }
        }
    }
    Ok(outcome)
}

fn pair_error(rule: &GeometryRule, oid: i64, message: &str) -> ValidationError {
    let mut error = ValidationError::new(rule.code(), rule.rule_id(), &rule.layer, oid, message)
        .detail(keys::LABEL, json!(rule.check.korean_label()));
    if let Some(table_id) = &rule.table_id {
        error = error.table_id(table_id.clone());
    }
    error
}

fn evaluate_pair(
    rule: &GeometryRule,
    oid: i64,
    geometry: &Geometry<f64>,
    candidate_oid: i64,
    candidate: &Geometry<f64>,
) -> Option<ValidationError> {
    match rule.check {
        GeometryCheck::DuplicateGeom => {
            let distance = geometry_distance(geometry, candidate);
            if distance < rule.tolerance {
                let error = pair_error(rule, oid, "geometry duplicates a neighbour")
                    .against(&rule.layer, candidate_oid)
                    .measured(distance, rule.tolerance);
                return Some(located(error, geometry));
            }
            None
        }
        GeometryCheck::OverlapGeom => {
            let own = to_multi_polygon(geometry)?;
            let other = to_multi_polygon(candidate)?;
            let overlap = own.intersection(&other);
            let area = overlap.unsigned_area();
            if area > 0.0 && area > rule.tolerance {
                let overlap_geometry: Geometry<f64> = overlap.into();
                let (x, y) = anchor_point(&overlap_geometry)?;
                let mut error = pair_error(rule, oid, "geometry overlaps a neighbour")
                    .against(&rule.layer, candidate_oid)
                    .measured(area, rule.tolerance)
                    .at(x, y)
                    .detail(keys::TOLERANCE, json!(rule.tolerance));
                if let Some(border) = boundary_distance(geometry, x, y) {
                    error = error.detail(keys::BORDER_DISTANCE, json!(border));
                }
                return Some(error);
            }
            None
        }
        GeometryCheck::PolygonInPolygon => {
            use crate::rule::SpatialRelation;
            // The pair is visited once, from whichever side comes
            // first, so containment is tested both ways.
            if SpatialRelation::Equals.evaluate(geometry, candidate) {
                return None;
            }
            if SpatialRelation::Contains.evaluate(geometry, candidate) {
                let error = pair_error(rule, oid, "polygon strictly contains another")
                    .against(&rule.layer, candidate_oid);
                return Some(located(error, candidate));
            }
            if SpatialRelation::Contains.evaluate(candidate, geometry) {
                let error = pair_error(rule, candidate_oid, "polygon strictly contains another")
                    .against(&rule.layer, oid);
                return Some(located(error, geometry));
            }
            None
        }
        _ => None,
    }
}

/// Random-access geometry fetches for pair candidates, bounded per
/// batch.
struct GeometryCache<'a> {
    dataset: &'a VectorDataset,
    layer: &'a str,
    held: HashMap<i64, Option<Geometry<f64>>>,
}

impl<'a> GeometryCache<'a> {
    const CAP: usize = 10_000;

    fn new(dataset: &'a VectorDataset, layer: &'a str) -> Self {
        GeometryCache {
            dataset,
            layer,
            held: HashMap::new(),
        }
    }

    fn fetch(&mut self, fid: i64) -> Result<Option<Geometry<f64>>, EngineError> {
        if let Some(geometry) = self.held.get(&fid) {
            return Ok(geometry.clone());
        }
        let geometry = self
            .dataset
            .feature_by_id(self.layer, fid)?
            .and_then(|record| record.geometry);
        let _previous = self.held.insert(fid, geometry.clone());
        Ok(geometry)
    }

    fn trim(&mut self) {
        if self.held.len() > Self::CAP {
            self.held.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryController, DEFAULT_CEILING_BYTES};
    use crate::rule::Thresholds;
    use gdal::vector::{LayerOptions, OGRwkbGeometryType, ToGdal};
    use geo::{line_string, point, polygon};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn context() -> CheckContext {
        CheckContext::new(Arc::new(MemoryController::new(DEFAULT_CEILING_BYTES)))
    }

    fn rule(layer: &str, check: GeometryCheck) -> GeometryRule {
        GeometryRule {
            layer: layer.to_owned(),
            table_id: None,
            check,
            tolerance: 1e-3,
            thresholds: Thresholds::default(),
        }
    }

    fn dataset_of(
        layer: &str,
        ty: OGRwkbGeometryType::Type,
        geometries: Vec<geo_types::Geometry<f64>>,
    ) -> VectorDataset {
        let driver = gdal::DriverManager::get_driver_by_name("Memory").expect("memory driver");
        let mut dataset = driver.create_vector_only("pair-test").expect("dataset");
        {
            let mut target = dataset
                .create_layer(LayerOptions {
                    name: layer,
                    ty,
                    ..Default::default()
                })
                .expect("layer");
            for geometry in geometries {
                target
                    .create_feature(geometry.to_gdal().expect("gdal geometry"))
                    .expect("feature");
            }
        }
        VectorDataset::from_dataset(dataset, PathBuf::from("pair-test"))
    }

    fn collect(
        dataset: &VectorDataset,
        rule: &GeometryRule,
    ) -> (PassOutcome, Vec<ValidationError>) {
        let mut errors = Vec::new();
        let outcome = run_geometry_rule(dataset, rule, &context(), |error| {
            errors.push(error);
            Ok(())
        })
        .expect("pass");
        (outcome, errors)
    }

    #[test]
    fn coincident_points_yield_exactly_one_duplicate() {
        let dataset = dataset_of(
            "wells",
            OGRwkbGeometryType::wkbPoint,
            vec![
                point! {x: 0.0, y: 0.0}.into(),
                point! {x: 0.0005, y: 0.0}.into(),
            ],
        );
        let (outcome, errors) = collect(&dataset, &rule("wells", GeometryCheck::DuplicateGeom));
        assert_eq!(outcome.processed, 2);
        assert_eq!(errors.len(), 1, "one DUP001 per unordered pair");
        assert_eq!(errors[0].code, codes::DUPLICATE);
        assert!(errors[0].x.abs() < 1e-3);
        assert_eq!(errors[0].y, 0.0);
    }

    #[test]
    fn separated_points_are_not_duplicates() {
        let dataset = dataset_of(
            "wells",
            OGRwkbGeometryType::wkbPoint,
            vec![
                point! {x: 0.0, y: 0.0}.into(),
                point! {x: 5.0, y: 0.0}.into(),
            ],
        );
        let (_, errors) = collect(&dataset, &rule("wells", GeometryCheck::DuplicateGeom));
        assert!(errors.is_empty());
    }

    #[test]
    fn single_feature_layer_emits_nothing() {
        let dataset = dataset_of(
            "wells",
            OGRwkbGeometryType::wkbPoint,
            vec![point! {x: 0.0, y: 0.0}.into()],
        );
        for check in [GeometryCheck::DuplicateGeom, GeometryCheck::OverlapGeom] {
            let (_, errors) = collect(&dataset, &rule("wells", check));
            assert!(errors.is_empty());
        }
    }

    #[test]
    fn overlapping_polygons_report_the_intersection() {
        let dataset = dataset_of(
            "parcels",
            OGRwkbGeometryType::wkbPolygon,
            vec![
                polygon![(x: 0.0, y: 0.0), (x: 10.0, y: 0.0), (x: 10.0, y: 10.0), (x: 0.0, y: 10.0), (x: 0.0, y: 0.0)]
                    .into(),
                polygon![(x: 5.0, y: 5.0), (x: 15.0, y: 5.0), (x: 15.0, y: 15.0), (x: 5.0, y: 15.0), (x: 5.0, y: 5.0)]
                    .into(),
            ],
        );
        let (_, errors) = collect(&dataset, &rule("parcels", GeometryCheck::OverlapGeom));
        assert_eq!(errors.len(), 1);
        let error = &errors[0];
        assert_eq!(error.code, codes::OVERLAP);
        assert!((error.error_value.unwrap() - 25.0).abs() < 1e-6);
        assert!(error.x > 5.0 && error.x < 10.0);
        assert!(error.y > 5.0 && error.y < 10.0);
    }

    #[test]
    fn bowtie_is_a_self_intersection() {
        let dataset = dataset_of(
            "roads",
            OGRwkbGeometryType::wkbLineString,
            vec![line_string![
                (x: 0.0, y: 0.0),
                (x: 2.0, y: 2.0),
                (x: 2.0, y: 0.0),
                (x: 0.0, y: 2.0)
            ]
            .into()],
        );
        let (_, errors) = collect(&dataset, &rule("roads", GeometryCheck::SelfIntersect));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, codes::SELF_INTERSECT);
        assert!((errors[0].x - 1.0).abs() < 1e-9);
    }

    #[test]
    fn thin_polygon_is_a_sliver() {
        let dataset = dataset_of(
            "parcels",
            OGRwkbGeometryType::wkbPolygon,
            vec![
                polygon![(x: 0.0, y: 0.0), (x: 10.0, y: 0.0), (x: 10.0, y: 0.01), (x: 0.0, y: 0.01), (x: 0.0, y: 0.0)]
                    .into(),
            ],
        );
        let (_, errors) = collect(&dataset, &rule("parcels", GeometryCheck::Sliver));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, codes::SLIVER);
    }

    #[test]
    fn short_line_and_small_polygon_trip_their_thresholds() {
        let roads = dataset_of(
            "roads",
            OGRwkbGeometryType::wkbLineString,
            vec![line_string![(x: 0.0, y: 0.0), (x: 0.2, y: 0.0)].into()],
        );
        let (_, errors) = collect(&roads, &rule("roads", GeometryCheck::ShortLength));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, codes::SHORT_LENGTH);

        let parcels = dataset_of(
            "parcels",
            OGRwkbGeometryType::wkbPolygon,
            vec![
                polygon![(x: 0.0, y: 0.0), (x: 0.5, y: 0.0), (x: 0.5, y: 0.5), (x: 0.0, y: 0.5), (x: 0.0, y: 0.0)]
                    .into(),
            ],
        );
        let (_, errors) = collect(&parcels, &rule("parcels", GeometryCheck::SmallArea));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, codes::SMALL_AREA);
    }

    #[test]
    fn nested_polygon_is_reported_once() {
        let dataset = dataset_of(
            "parcels",
            OGRwkbGeometryType::wkbPolygon,
            vec![
                polygon![(x: 0.0, y: 0.0), (x: 10.0, y: 0.0), (x: 10.0, y: 10.0), (x: 0.0, y: 10.0), (x: 0.0, y: 0.0)]
                    .into(),
                polygon![(x: 2.0, y: 2.0), (x: 4.0, y: 2.0), (x: 4.0, y: 4.0), (x: 2.0, y: 4.0), (x: 2.0, y: 2.0)]
                    .into(),
            ],
        );
        let (_, errors) = collect(&dataset, &rule("parcels", GeometryCheck::PolygonInPolygon));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, codes::POLYGON_IN_POLYGON);
        assert!(errors[0].x > 2.0 && errors[0].x < 4.0);
    }
}
