use std::collections::HashSet;

use geo::{Area, BooleanOps, Centroid, Simplify};
use geo_types::{Geometry, MultiPolygon};
use log::{debug, info};
use rayon::prelude::*;
use serde_json::json;

use super::{
    for_each_batch, CheckContext, PassOutcome, CANCEL_POLL_STRIDE, LARGE_LAYER_THRESHOLD,
    SIMPLIFY_WKT_BYTES,
};
use crate::classify::keys;
use crate::dataset::{AttrValue, FeatureRecord, VectorDataset};
use crate::errors::EngineError;
use crate::geometry::{
    anchor_point, boundary_distance, self_intersections, to_multi_polygon, to_wkt, Envelope,
};
use crate::index::{IndexKind, IndexManager, SpatialIndex};
use crate::report::ValidationError;
use crate::rule::{SpatialRelation, TopologyKind, TopologyRule};

/// Runs one topology rule, forwarding every violation to the emit
/// callback in source-feature order.
pub fn run_topology_rule<Emit>(
    dataset: &VectorDataset,
    rule: &TopologyRule,
    context: &CheckContext,
    manager: &IndexManager,
    index_kind: IndexKind,
    emit: Emit,
) -> Result<PassOutcome, EngineError>
where
    Emit: FnMut(ValidationError) -> Result<(), EngineError>,
{
    debug!("topology rule {} starting", rule.rule_id());
    match rule.kind {
        TopologyKind::MustNotOverlap => {
            must_not_overlap(dataset, rule, context, manager, index_kind, emit)
        }
        TopologyKind::MustNotHaveGaps => must_not_have_gaps(dataset, rule, context, emit),
        TopologyKind::MustBeCoveredBy => coverage(dataset, rule, context, emit, Coverage::By),
        TopologyKind::MustCover => coverage(dataset, rule, context, emit, Coverage::Of),
        TopologyKind::MustNotIntersect => {
            must_not_intersect(dataset, rule, context, manager, index_kind, emit)
        }
        TopologyKind::MustBeProperlyInside => {
            must_be_properly_inside(dataset, rule, context, emit)
        }
        TopologyKind::MustNotSelfOverlap | TopologyKind::MustNotSelfIntersect => {
            self_geometry(dataset, rule, context, emit)
        }
    }
}

fn target_layer<'rule>(rule: &'rule TopologyRule) -> Result<&'rule str, EngineError> {
    rule.target_layer.as_deref().ok_or_else(|| {
        EngineError::InputInvalid(format!("topology rule {} has no target layer", rule.rule_id()))
    })
}

/// Attribute-equality exceptions of the form `FIELD=VALUE`.
fn is_exempt(rule: &TopologyRule, record: &FeatureRecord) -> bool {
    if !rule.allow_exceptions {
        return false;
    }
    rule.exception_conditions.iter().any(|condition| {
        let Some((field, value)) = condition.split_once('=') else {
            return false;
        };
        match record.attributes.get(field.trim()) {
            Some(AttrValue::Text(text)) => text == value.trim(),
            Some(AttrValue::Int(number)) => value.trim().parse() == Ok(*number),
            Some(AttrValue::Real(number)) => value.trim().parse() == Ok(*number),
            None => false,
        }
    })
}

fn violation(rule: &TopologyRule, oid: i64, message: impl Into<String>) -> ValidationError {
    ValidationError::new(
        rule.kind.code(),
        rule.rule_id(),
        &rule.source_layer,
        oid,
        message,
    )
    .detail(keys::LABEL, json!(rule.kind.korean_label()))
}

/// Simplifies oversized geometries ahead of expensive predicates; the
/// original WKT is preserved in the error details.
fn maybe_simplified(geometry: &Geometry<f64>) -> (Geometry<f64>, Option<String>) {
    let Ok(wkt) = to_wkt(geometry) else {
        return (geometry.clone(), None);
    };
    if wkt.len() <= SIMPLIFY_WKT_BYTES {
        return (geometry.clone(), None);
    }
    info!("simplifying a {} byte geometry before the predicate pass", wkt.len());
    let simplified = match geometry {
        Geometry::Polygon(polygon) => Geometry::Polygon(polygon.simplify(&1.0)),
        Geometry::MultiPolygon(polygons) => Geometry::MultiPolygon(polygons.simplify(&1.0)),
        Geometry::LineString(line) => Geometry::LineString(line.simplify(&1.0)),
        Geometry::MultiLineString(lines) => Geometry::MultiLineString(lines.simplify(&1.0)),
        other => other.clone(),
    };
    (simplified, Some(wkt))
}

fn overlap_error(
    rule: &TopologyRule,
    source_oid: i64,
    target_name: &str,
    target_oid: i64,
    source_geometry: &Geometry<f64>,
    overlap: &MultiPolygon<f64>,
    original_wkt: Option<String>,
) -> Option<ValidationError> {
    let area = overlap.unsigned_area();
    if area <= rule.tolerance {
        return None;
    }
    let overlap_geometry: Geometry<f64> = overlap.clone().into();
    let (x, y) = anchor_point(&overlap_geometry)?;
    let mut error = violation(rule, source_oid, "features overlap")
        .against(target_name, target_oid)
        .measured(area, rule.tolerance)
        .at(x, y)
        .detail(keys::TOLERANCE, json!(rule.tolerance));
    if let Some(border) = boundary_distance(source_geometry, x, y) {
        error = error.detail(keys::BORDER_DISTANCE, json!(border));
    }
    if let Some(wkt) = original_wkt {
        error = error.detail(keys::SOURCE_WKT, json!(wkt));
    }
    Some(error)
}

fn must_not_overlap<Emit>(
    dataset: &VectorDataset,
    rule: &TopologyRule,
    context: &CheckContext,
    manager: &IndexManager,
    index_kind: IndexKind,
    mut emit: Emit,
) -> Result<PassOutcome, EngineError>
where
    Emit: FnMut(ValidationError) -> Result<(), EngineError>,
{
    let target_name = target_layer(rule)?;
    let source_count = dataset.record_count(&rule.source_layer)?;
    let target_count = dataset.record_count(target_name)?;
    let mut outcome = PassOutcome::default();
    let same_layer = rule.source_layer == target_name;
    let mut emitted_pairs: HashSet<(i64, i64)> = HashSet::new();

    if source_count > LARGE_LAYER_THRESHOLD || target_count > LARGE_LAYER_THRESHOLD {
        // Chunked streaming: source entries come from the envelope
        // index and are fetched by id, so the only open cursor is the
        // spatially filtered probe of the target layer.
        info!(
            "must-not-overlap streaming mode ({source_count} x {target_count} features)"
        );
        let (source_index, source_report) =
            super::index_or_fallback(manager, dataset, &rule.source_layer, index_kind, context)?;
        super::emit_build_report(source_report, &mut outcome, &mut emit)?;
        let mut cache = RecordCache::new(dataset, &rule.source_layer);
        let mut sizer = crate::memory::BatchSizer::new(&context.memory);
        for (position, (source_fid, envelope)) in source_index.entries().into_iter().enumerate()
        {
            if position % CANCEL_POLL_STRIDE == 0 {
                context.ensure_not_cancelled()?;
            }
            if position > 0 && position % sizer.current().max(1) == 0 {
                let _next = sizer.after_batch();
            }
            outcome.processed += 1;
            let Some(record) = cache.fetch(source_fid)? else { continue };
            let Some(geometry) = record.geometry.as_ref() else { continue };
            if is_exempt(rule, &record) || to_multi_polygon(geometry).is_none() {
                continue;
            }
            let (probe_geometry, original_wkt) = maybe_simplified(geometry);
            let Some(own) = to_multi_polygon(&probe_geometry) else { continue };
            let mut found = Vec::new();
            let _scanned = dataset.read_features_in(target_name, &envelope, |target| {
                if same_layer
                    && (target.fid == record.fid
                        || !pair_is_new(&mut emitted_pairs, record.fid, target.fid))
                {
                    return Ok(true);
                }
                let Some(target_geometry) = target.geometry.as_ref() else {
                    return Ok(true);
                };
                let Some(other) = to_multi_polygon(target_geometry) else {
                    return Ok(true);
                };
                if SpatialRelation::Overlaps.evaluate(&probe_geometry, target_geometry) {
                    let overlap = own.intersection(&other);
                    if let Some(error) = overlap_error(
                        rule,
                        record.oid,
                        target_name,
                        target.oid,
                        geometry,
                        &overlap,
                        original_wkt.clone(),
                    ) {
                        found.push(error);
                    }
                }
                Ok(true)
            })?;
            for error in found {
                outcome.emitted += 1;
                emit(error)?;
            }
        }
        return Ok(outcome);
    }

    let (source_index, source_report) =
        super::index_or_fallback(manager, dataset, &rule.source_layer, index_kind, context)?;
    let (target_index, target_report) =
        super::index_or_fallback(manager, dataset, target_name, index_kind, context)?;
    super::emit_build_report(source_report, &mut outcome, &mut emit)?;
    super::emit_build_report(target_report, &mut outcome, &mut emit)?;
    let pairs = manager.query_spatial_relation(
        &source_index,
        &target_index,
        SpatialRelation::Overlaps,
    )?;
    let mut source_cache = RecordCache::new(dataset, &rule.source_layer);
    let mut target_cache = RecordCache::new(dataset, target_name);
    let mut counter = 0usize;
    for (source_fid, target_fid) in pairs {
        counter += 1;
        if counter % CANCEL_POLL_STRIDE == 0 {
            context.ensure_not_cancelled()?;
        }
        if same_layer
            && (source_fid == target_fid
                || !pair_is_new(&mut emitted_pairs, source_fid, target_fid))
        {
            continue;
        }
        let Some(source) = source_cache.fetch(source_fid)? else { continue };
        if is_exempt(rule, &source) {
            continue;
        }
        let Some(target) = target_cache.fetch(target_fid)? else { continue };
        let (Some(source_geometry), Some(target_geometry)) =
            (source.geometry.as_ref(), target.geometry.as_ref())
        else {
            continue;
        };
        let (probe_geometry, original_wkt) = maybe_simplified(source_geometry);
        let (Some(own), Some(other)) = (
            to_multi_polygon(&probe_geometry),
            to_multi_polygon(target_geometry),
        ) else {
            continue;
        };
        if SpatialRelation::Overlaps.evaluate(&probe_geometry, target_geometry) {
            let overlap = own.intersection(&other);
            if let Some(error) = overlap_error(
                rule,
                source.oid,
                target_name,
                target.oid,
                source_geometry,
                &overlap,
                original_wkt,
            ) {
                outcome.emitted += 1;
                emit(error)?;
            }
        }
        outcome.processed += 1;
    }
    Ok(outcome)
}

fn pair_is_new(seen: &mut HashSet<(i64, i64)>, a: i64, b: i64) -> bool {
    seen.insert((a.min(b), a.max(b)))
}

/// Incremental union of the source polygons; gaps are the components
/// of the bounding box minus the union.
fn must_not_have_gaps<Emit>(
    dataset: &VectorDataset,
    rule: &TopologyRule,
    context: &CheckContext,
    mut emit: Emit,
) -> Result<PassOutcome, EngineError>
where
    Emit: FnMut(ValidationError) -> Result<(), EngineError>,
{
    let mut outcome = PassOutcome::default();
    let union = layer_union(dataset, &rule.source_layer, context)?;
    let Some(union) = union else {
        return Ok(outcome);
    };
    let union_geometry: Geometry<f64> = union.clone().into();
    let Some(bounds) = Envelope::of(&union_geometry).to_polygon() else {
        return Ok(outcome);
    };
    let frame = MultiPolygon::from_iter(std::iter::once(bounds));
    let gaps = frame.difference(&union);
    for gap in gaps.0 {
        let area = gap.unsigned_area();
        if area <= rule.tolerance {
            continue;
        }
        let center = gap
            .centroid()
            .map(|point| (point.x(), point.y()))
            .or_else(|| Envelope::from_rect(geo::BoundingRect::bounding_rect(&gap)?).center());
        let Some((x, y)) = center else { continue };
        let error = violation(rule, -1, "gap between features")
            .measured(area, rule.tolerance)
            .at(x, y)
            .detail(keys::TOLERANCE, json!(rule.tolerance))
            .detail("gap_area", json!(area));
        outcome.emitted += 1;
        emit(error)?;
    }
    Ok(outcome)
}

enum Coverage {
    /// Source features must be covered by the target union.
    By,
    /// Target features must be covered by the source union.
    Of,
}

fn coverage<Emit>(
    dataset: &VectorDataset,
    rule: &TopologyRule,
    context: &CheckContext,
    mut emit: Emit,
    direction: Coverage,
) -> Result<PassOutcome, EngineError>
where
    Emit: FnMut(ValidationError) -> Result<(), EngineError>,
{
    let target_name = target_layer(rule)?;
    let (cover_layer, walk_layer) = match direction {
        Coverage::By => (target_name, rule.source_layer.as_str()),
        Coverage::Of => (rule.source_layer.as_str(), target_name),
    };
    let cover = layer_union(dataset, cover_layer, context)?;
    let cover_geometry: Option<Geometry<f64>> = cover.clone().map(Into::into);

    let mut outcome = PassOutcome::default();
    let processed = for_each_batch(dataset, walk_layer, context, |batch| {
        for record in batch {
            let Some(geometry) = record.geometry.as_ref() else { continue };
            if is_exempt(rule, record) {
                continue;
            }
            let Some(own) = to_multi_polygon(geometry) else { continue };
            let covered = cover_geometry
                .as_ref()
                .is_some_and(|cover| SpatialRelation::Contains.evaluate(cover, geometry));
            if covered {
                continue;
            }
            let remainder = match &cover {
                Some(cover) => own.difference(cover),
                None => own,
            };
            for part in remainder.0 {
                let area = part.unsigned_area();
                if area <= rule.tolerance {
                    continue;
                }
                let part_geometry: Geometry<f64> = part.into();
                let Some((x, y)) = anchor_point(&part_geometry) else { continue };
                // The walked layer owns the defect; under MustCover that
                // is the rule's target layer.
                let error = ValidationError::new(
                    rule.kind.code(),
                    rule.rule_id(),
                    walk_layer,
                    record.oid,
                    "feature not covered",
                )
                .detail(keys::LABEL, json!(rule.kind.korean_label()))
                .against(cover_layer, -1)
                .measured(area, rule.tolerance)
                .at(x, y)
                .detail(keys::TOLERANCE, json!(rule.tolerance));
                outcome.emitted += 1;
                emit(error)?;
            }
        }
        Ok(())
    })?;
    outcome.processed = processed;
    Ok(outcome)
}

fn must_not_intersect<Emit>(
    dataset: &VectorDataset,
    rule: &TopologyRule,
    context: &CheckContext,
    manager: &IndexManager,
    index_kind: IndexKind,
    mut emit: Emit,
) -> Result<PassOutcome, EngineError>
where
    Emit: FnMut(ValidationError) -> Result<(), EngineError>,
{
    let target_name = target_layer(rule)?;
    let same_layer = rule.source_layer == target_name;
    let (source_index, source_report) =
        super::index_or_fallback(manager, dataset, &rule.source_layer, index_kind, context)?;
    let (target_index, target_report) =
        super::index_or_fallback(manager, dataset, target_name, index_kind, context)?;
    let pairs = manager.query_spatial_relation(
        &source_index,
        &target_index,
        SpatialRelation::Intersects,
    )?;

    let mut outcome = PassOutcome::default();
    super::emit_build_report(source_report, &mut outcome, &mut emit)?;
    super::emit_build_report(target_report, &mut outcome, &mut emit)?;
    let mut emitted_pairs: HashSet<(i64, i64)> = HashSet::new();
    let mut source_cache = RecordCache::new(dataset, &rule.source_layer);
    let mut target_cache = RecordCache::new(dataset, target_name);
    let mut counter = 0usize;

    for (source_fid, target_fid) in pairs {
        counter += 1;
        if counter % CANCEL_POLL_STRIDE == 0 {
            context.ensure_not_cancelled()?;
        }
        if same_layer
            && (source_fid == target_fid
                || !pair_is_new(&mut emitted_pairs, source_fid, target_fid))
        {
            continue;
        }
        let Some(source) = source_cache.fetch(source_fid)? else { continue };
        if is_exempt(rule, &source) {
            continue;
        }
        let Some(target) = target_cache.fetch(target_fid)? else { continue };
        let (Some(source_geometry), Some(target_geometry)) =
            (source.geometry.as_ref(), target.geometry.as_ref())
        else {
            continue;
        };
        outcome.processed += 1;
        if !SpatialRelation::Intersects.evaluate(source_geometry, target_geometry)
            || SpatialRelation::Touches.evaluate(source_geometry, target_geometry)
        {
            continue;
        }
        let areal = to_multi_polygon(source_geometry)
            .zip(to_multi_polygon(target_geometry))
            .map(|(own, other)| own.intersection(&other));
        let error = match areal {
            Some(overlap) => {
                let area = overlap.unsigned_area();
                if area <= rule.tolerance {
                    continue;
                }
                let overlap_geometry: Geometry<f64> = overlap.into();
                let Some((x, y)) = anchor_point(&overlap_geometry) else { continue };
                let mut error = violation(rule, source.oid, "features intersect")
                    .against(target_name, target.oid)
                    .measured(area, rule.tolerance)
                    .at(x, y)
                    .detail(keys::TOLERANCE, json!(rule.tolerance));
                if let Some(border) = boundary_distance(source_geometry, x, y) {
                    error = error.detail(keys::BORDER_DISTANCE, json!(border));
                }
                error
            }
            None => {
                // Non-areal pair: the rule reduces to a proper crossing.
                let Some((x, y)) =
                    crate::geometry::first_intersection_point(source_geometry, target_geometry)
                else {
                    continue;
                };
                violation(rule, source.oid, "features intersect")
                    .against(target_name, target.oid)
                    .at(x, y)
            }
        };
        outcome.emitted += 1;
        emit(error)?;
    }
    Ok(outcome)
}

fn must_be_properly_inside<Emit>(
    dataset: &VectorDataset,
    rule: &TopologyRule,
    context: &CheckContext,
    mut emit: Emit,
) -> Result<PassOutcome, EngineError>
where
    Emit: FnMut(ValidationError) -> Result<(), EngineError>,
{
    let target_name = target_layer(rule)?;
    let cover = layer_union(dataset, target_name, context)?;
    let cover_geometry: Option<Geometry<f64>> = cover.map(Into::into);

    let mut outcome = PassOutcome::default();
    let processed = for_each_batch(dataset, &rule.source_layer, context, |batch| {
        let violations: Vec<Option<ValidationError>> = batch
            .par_iter()
            .map(|record| {
                let geometry = record.geometry.as_ref()?;
                if is_exempt(rule, record) {
                    return None;
                }
                let proper = cover_geometry.as_ref().is_some_and(|cover| {
                    SpatialRelation::Within.evaluate(geometry, cover)
                        && !SpatialRelation::Touches.evaluate(geometry, cover)
                });
                if proper {
                    return None;
                }
                let (x, y) = anchor_point(geometry)?;
                Some(
                    violation(rule, record.oid, "feature not properly inside")
                        .against(target_name, -1)
                        .at(x, y),
                )
            })
            .collect();
        for error in violations.into_iter().flatten() {
            outcome.emitted += 1;
            emit(error)?;
        }
        Ok(())
    })?;
    outcome.processed = processed;
    Ok(outcome)
}

/// Self-layer rules: a geometry overlapping or crossing itself.
fn self_geometry<Emit>(
    dataset: &VectorDataset,
    rule: &TopologyRule,
    context: &CheckContext,
    mut emit: Emit,
) -> Result<PassOutcome, EngineError>
where
    Emit: FnMut(ValidationError) -> Result<(), EngineError>,
{
    let want_overlaps = rule.kind == TopologyKind::MustNotSelfOverlap;
    let mut outcome = PassOutcome::default();
    let processed = for_each_batch(dataset, &rule.source_layer, context, |batch| {
        let violations: Vec<Option<ValidationError>> = batch
            .par_iter()
            .map(|record| {
                let geometry = record.geometry.as_ref()?;
                if is_exempt(rule, record) {
                    return None;
                }
                let found = self_intersections(geometry);
                if want_overlaps {
                    let overlap = found.overlaps.first()?;
                    Some(
                        violation(rule, record.oid, "geometry overlaps itself")
                            .at(overlap.start.x, overlap.start.y)
                            .detail("overlap_count", json!(found.overlaps.len())),
                    )
                } else {
                    let crossing = found.crossings.first()?;
                    Some(
                        violation(rule, record.oid, "geometry crosses itself")
                            .at(crossing.x, crossing.y)
                            .detail("crossing_count", json!(found.crossings.len())),
                    )
                }
            })
            .collect();
        for error in violations.into_iter().flatten() {
            outcome.emitted += 1;
            emit(error)?;
        }
        Ok(())
    })?;
    outcome.processed = processed;
    Ok(outcome)
}

/// Incremental union of every polygon in a layer.
fn layer_union(
    dataset: &VectorDataset,
    layer: &str,
    context: &CheckContext,
) -> Result<Option<MultiPolygon<f64>>, EngineError> {
    let mut union: Option<MultiPolygon<f64>> = None;
    let mut counter = 0usize;
    let _processed = dataset.read_features(layer, |record| {
        counter += 1;
        if counter % CANCEL_POLL_STRIDE == 0 {
            context.ensure_not_cancelled()?;
        }
        if let Some(own) = record.geometry.as_ref().and_then(to_multi_polygon) {
            union = Some(match union.take() {
                None => own,
                Some(current) => current.union(&own),
            });
        }
        Ok(true)
    })?;
    Ok(union)
}

/// Random-access record fetches for candidate pairs.
struct RecordCache<'a> {
    dataset: &'a VectorDataset,
    layer: &'a str,
    held: std::collections::HashMap<i64, Option<FeatureRecord>>,
}

impl<'a> RecordCache<'a> {
    const CAP: usize = 10_000;

    fn new(dataset: &'a VectorDataset, layer: &'a str) -> Self {
        RecordCache {
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
    use gdal::vector::{LayerOptions, OGRwkbGeometryType, ToGdal};
    use geo::polygon;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn context() -> CheckContext {
        CheckContext::new(Arc::new(MemoryController::new(DEFAULT_CEILING_BYTES)))
    }

    fn topology_rule(kind: TopologyKind, source: &str, target: Option<&str>) -> TopologyRule {
        TopologyRule {
            source_layer: source.to_owned(),
            target_layer: target.map(str::to_owned),
            kind,
            tolerance: 0.01,
            allow_exceptions: false,
            exception_conditions: Vec::new(),
        }
    }

    fn two_layer_dataset(
        source: Vec<geo_types::Geometry<f64>>,
        target: Vec<geo_types::Geometry<f64>>,
    ) -> VectorDataset {
        let driver = gdal::DriverManager::get_driver_by_name("Memory").expect("memory driver");
        let mut dataset = driver.create_vector_only("topology-test").expect("dataset");
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
        VectorDataset::from_dataset(dataset, PathBuf::from("topology-test"))
    }

    fn collect(
        dataset: &VectorDataset,
        rule: &TopologyRule,
    ) -> Vec<ValidationError> {
        let manager = IndexManager::new();
        let mut errors = Vec::new();
        let _outcome = run_topology_rule(
            dataset,
            rule,
            &context(),
            &manager,
            IndexKind::RTree,
            |error| {
                errors.push(error);
                Ok(())
            },
        )
        .expect("pass");
        errors
    }

    fn unit_square(x0: f64, y0: f64, x1: f64, y1: f64) -> geo_types::Geometry<f64> {
        polygon![(x: x0, y: y0), (x: x1, y: y0), (x: x1, y: y1), (x: x0, y: y1), (x: x0, y: y0)]
            .into()
    }

    #[test]
    fn overlap_reports_the_intersection_surface() {
        let dataset = two_layer_dataset(
            vec![unit_square(0.0, 0.0, 10.0, 10.0)],
            vec![unit_square(5.0, 5.0, 15.0, 15.0)],
        );
        let rule = topology_rule(TopologyKind::MustNotOverlap, "source", Some("target"));
        let errors = collect(&dataset, &rule);
        assert_eq!(errors.len(), 1);
        let error = &errors[0];
        assert_eq!(error.code, "OVERLAP_VIOLATION");
        assert!((error.error_value.unwrap() - 25.0).abs() < 1e-6);
        assert_eq!((error.x, error.y), (7.5, 7.5));
    }

    #[test]
    fn touching_squares_do_not_overlap() {
        let dataset = two_layer_dataset(
            vec![unit_square(0.0, 0.0, 10.0, 10.0)],
            vec![unit_square(10.0, 0.0, 20.0, 10.0)],
        );
        let rule = topology_rule(TopologyKind::MustNotOverlap, "source", Some("target"));
        assert!(collect(&dataset, &rule).is_empty());
    }

    #[test]
    fn gap_between_tiles_is_detected() {
        // Covers [0,10]x[0,10] except the square [4,5]x[4,5].
        let left: geo_types::Geometry<f64> = polygon![
            (x: 0.0, y: 0.0), (x: 4.0, y: 0.0), (x: 4.0, y: 10.0), (x: 0.0, y: 10.0), (x: 0.0, y: 0.0)
        ]
        .into();
        let right: geo_types::Geometry<f64> = polygon![
            (x: 4.0, y: 0.0), (x: 10.0, y: 0.0), (x: 10.0, y: 10.0), (x: 4.0, y: 10.0),
            (x: 4.0, y: 5.0), (x: 5.0, y: 5.0), (x: 5.0, y: 4.0), (x: 4.0, y: 4.0), (x: 4.0, y: 0.0)
        ]
        .into();
        let dataset = two_layer_dataset(vec![left, right], vec![]);
        let rule = topology_rule(TopologyKind::MustNotHaveGaps, "source", None);
        let errors = collect(&dataset, &rule);
        assert_eq!(errors.len(), 1);
        let error = &errors[0];
        assert_eq!(error.code, "GAP_DETECTED");
        assert!((error.error_value.unwrap() - 1.0).abs() < 1e-6);
        assert!(error.x > 4.0 && error.x < 5.0);
        assert!(error.y > 4.0 && error.y < 5.0);
    }

    #[test]
    fn full_coverage_has_no_gaps() {
        let dataset = two_layer_dataset(
            vec![unit_square(0.0, 0.0, 5.0, 10.0), unit_square(5.0, 0.0, 10.0, 10.0)],
            vec![],
        );
        let rule = topology_rule(TopologyKind::MustNotHaveGaps, "source", None);
        assert!(collect(&dataset, &rule).is_empty());
    }

    #[test]
    fn uncovered_remainder_is_reported() {
        let dataset = two_layer_dataset(
            vec![unit_square(0.0, 0.0, 10.0, 10.0)],
            vec![unit_square(0.0, 0.0, 10.0, 6.0)],
        );
        let rule = topology_rule(TopologyKind::MustBeCoveredBy, "source", Some("target"));
        let errors = collect(&dataset, &rule);
        assert_eq!(errors.len(), 1);
        let error = &errors[0];
        assert_eq!(error.code, "NOT_COVERED_BY");
        assert!((error.error_value.unwrap() - 40.0).abs() < 1e-6);
        assert!(error.y > 6.0);
    }

    #[test]
    fn covered_features_stay_silent() {
        let dataset = two_layer_dataset(
            vec![unit_square(2.0, 2.0, 4.0, 4.0)],
            vec![unit_square(0.0, 0.0, 10.0, 10.0)],
        );
        let rule = topology_rule(TopologyKind::MustBeCoveredBy, "source", Some("target"));
        assert!(collect(&dataset, &rule).is_empty());
        let rule = topology_rule(TopologyKind::MustCover, "target", Some("source"));
        assert!(collect(&dataset, &rule).is_empty());
    }

    #[test]
    fn intersection_violation_needs_more_than_touching() {
        let dataset = two_layer_dataset(
            vec![unit_square(0.0, 0.0, 10.0, 10.0)],
            vec![unit_square(8.0, 8.0, 12.0, 12.0), unit_square(10.0, 0.0, 12.0, 2.0)],
        );
        let rule = topology_rule(TopologyKind::MustNotIntersect, "source", Some("target"));
        let errors = collect(&dataset, &rule);
        assert_eq!(errors.len(), 1, "the touching square must not be reported");
        assert_eq!(errors[0].code, "INTERSECTION_VIOLATION");
        assert!((errors[0].error_value.unwrap() - 4.0).abs() < 1e-6);
    }

    #[test]
    fn exception_conditions_exempt_features() {
        let driver = gdal::DriverManager::get_driver_by_name("Memory").expect("memory driver");
        let mut dataset = driver.create_vector_only("exempt-test").expect("dataset");
        {
            use gdal::vector::FieldValue;
            let mut layer = dataset
                .create_layer(LayerOptions {
                    name: "source",
                    ty: OGRwkbGeometryType::wkbPolygon,
                    ..Default::default()
                })
                .expect("layer");
            layer
                .create_defn_fields(&[("KIND", gdal::vector::OGRFieldType::OFTString)])
                .expect("fields");
            let square = unit_square(0.0, 0.0, 10.0, 10.0);
            layer
                .create_feature_fields(
                    square.to_gdal().expect("gdal"),
                    &["KIND"],
                    &[FieldValue::StringValue("bridge".to_owned())],
                )
                .expect("feature");
        }
        {
            let mut layer = dataset
                .create_layer(LayerOptions {
                    name: "target",
                    ty: OGRwkbGeometryType::wkbPolygon,
                    ..Default::default()
                })
                .expect("layer");
            layer
                .create_feature(unit_square(5.0, 5.0, 15.0, 15.0).to_gdal().expect("gdal"))
                .expect("feature");
        }
        let dataset = VectorDataset::from_dataset(dataset, PathBuf::from("exempt-test"));
        let mut rule = topology_rule(TopologyKind::MustNotOverlap, "source", Some("target"));
        rule.allow_exceptions = true;
        rule.exception_conditions = vec!["KIND=bridge".to_owned()];
        assert!(collect(&dataset, &rule).is_empty());
        rule.exception_conditions = vec!["KIND=tunnel".to_owned()];
        assert_eq!(collect(&dataset, &rule).len(), 1);
    }
}
