use geo::algorithm::LineIntersection;
use geo::sweep::Intersections;
use geo::{
    Area, BoundingRect, Centroid, Coord, CoordsIter, EuclideanDistance, EuclideanLength,
    InteriorPoint, Line, LineString, MultiPolygon, Point, Polygon, Rect,
};
use geo_types::Geometry;
use geozero::{ToGeo, ToWkt};
use itertools::Itertools;
use regex::Regex;

use crate::errors::EngineError;

/// Axis-aligned bounding rectangle. The empty envelope is an explicit
/// state, never inverted bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Envelope {
    min_x: f64,
    min_y: f64,
    max_x: f64,
    max_y: f64,
    empty: bool,
}

impl Envelope {
    pub const EMPTY: Envelope = Envelope {
        min_x: 0.0,
        min_y: 0.0,
        max_x: 0.0,
        max_y: 0.0,
        empty: true,
    };

    /// Corners in any order; bounds are sorted on construction.
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Envelope {
            min_x: x1.min(x2),
            min_y: y1.min(y2),
            max_x: x1.max(x2),
            max_y: y1.max(y2),
            empty: false,
        }
    }

    pub fn from_rect(rect: Rect<f64>) -> Self {
        Self::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y)
    }

    pub fn of(geometry: &Geometry<f64>) -> Self {
        match geometry.bounding_rect() {
            Some(rect) => Self::from_rect(rect),
            None => Self::EMPTY,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.empty
    }

    pub fn min_x(&self) -> f64 {
        self.min_x
    }

    pub fn min_y(&self) -> f64 {
        self.min_y
    }

    pub fn max_x(&self) -> f64 {
        self.max_x
    }

    pub fn max_y(&self) -> f64 {
        self.max_y
    }

    pub fn width(&self) -> f64 {
        if self.empty {
            0.0
        } else {
            self.max_x - self.min_x
        }
    }

    pub fn height(&self) -> f64 {
        if self.empty {
            0.0
        } else {
            self.max_y - self.min_y
        }
    }

    pub fn center_x(&self) -> f64 {
        (self.min_x + self.max_x) / 2.0
    }

    pub fn center_y(&self) -> f64 {
        (self.min_y + self.max_y) / 2.0
    }

    pub fn center(&self) -> Option<(f64, f64)> {
        if self.empty {
            None
        } else {
            Some((self.center_x(), self.center_y()))
        }
    }

    pub fn intersects(&self, other: &Envelope) -> bool {
        if self.empty || other.empty {
            return false;
        }
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }

    pub fn contains(&self, other: &Envelope) -> bool {
        if self.empty || other.empty {
            return false;
        }
        self.min_x <= other.min_x
            && self.max_x >= other.max_x
            && self.min_y <= other.min_y
            && self.max_y >= other.max_y
    }

    pub fn contains_xy(&self, x: f64, y: f64) -> bool {
        !self.empty && x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    pub fn expand_by(&self, amount: f64) -> Self {
        if self.empty {
            return *self;
        }
        Self::new(
            self.min_x - amount,
            self.min_y - amount,
            self.max_x + amount,
            self.max_y + amount,
        )
    }

    pub fn union(&self, other: &Envelope) -> Self {
        match (self.empty, other.empty) {
            (true, true) => Self::EMPTY,
            (true, false) => *other,
            (false, true) => *self,
            (false, false) => Self::new(
                self.min_x.min(other.min_x),
                self.min_y.min(other.min_y),
                self.max_x.max(other.max_x),
                self.max_y.max(other.max_y),
            ),
        }
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    pub fn to_rect(&self) -> Option<Rect<f64>> {
        if self.empty {
            None
        } else {
            Some(Rect::new(
                Coord {
                    x: self.min_x,
                    y: self.min_y,
                },
                Coord {
                    x: self.max_x,
                    y: self.max_y,
                },
            ))
        }
    }

    pub fn to_polygon(&self) -> Option<Polygon<f64>> {
        self.to_rect().map(|rect| rect.to_polygon())
    }
}

pub fn to_wkt(geometry: &Geometry<f64>) -> Result<String, EngineError> {
    geometry
        .to_wkt()
        .map_err(|error| EngineError::WktOut(format!("{error}")))
}

pub fn from_wkt(wkt: &str) -> Result<Geometry<f64>, EngineError> {
    geozero::wkt::Wkt(wkt)
        .to_geo()
        .map_err(|error| EngineError::WktIn(format!("{error}")))
}

pub fn point_wkt(x: f64, y: f64) -> String {
    format!("POINT ({x} {y})")
}

pub fn geometry_type_name(geometry: &Geometry<f64>) -> &'static str {
    match geometry {
        Geometry::Point(_) => "POINT",
        Geometry::MultiPoint(_) => "MULTIPOINT",
        Geometry::Line(_) | Geometry::LineString(_) => "LINESTRING",
        Geometry::MultiLineString(_) => "MULTILINESTRING",
        Geometry::Polygon(_) | Geometry::Rect(_) | Geometry::Triangle(_) => "POLYGON",
        Geometry::MultiPolygon(_) => "MULTIPOLYGON",
        Geometry::GeometryCollection(_) => "GEOMETRYCOLLECTION",
    }
}

pub fn vertex_count(geometry: &Geometry<f64>) -> usize {
    geometry.coords_count()
}

pub fn has_finite_coords(geometry: &Geometry<f64>) -> bool {
    geometry
        .coords_iter()
        .all(|coord| coord.x.is_finite() && coord.y.is_finite())
}

/// Why a geometry fails basic validity, or None when it passes.
pub fn basic_validity_reason(geometry: &Geometry<f64>) -> Option<&'static str> {
    if vertex_count(geometry) == 0 {
        return Some("geometry is empty");
    }
    if !has_finite_coords(geometry) {
        return Some("geometry has non-finite coordinates");
    }
    fn ring_defect(ring: &LineString<f64>) -> Option<&'static str> {
        if ring.0.len() < 4 {
            return Some("polygon ring has fewer than four points");
        }
        if !ring.is_closed() {
            return Some("polygon ring is not closed");
        }
        None
    }
    fn polygon_defect(polygon: &Polygon<f64>) -> Option<&'static str> {
        ring_defect(polygon.exterior())
            .or_else(|| polygon.interiors().iter().find_map(ring_defect))
    }
    match geometry {
        Geometry::LineString(line) if line.0.len() < 2 => {
            Some("linestring has fewer than two points")
        }
        Geometry::MultiLineString(lines) if lines.iter().any(|line| line.0.len() < 2) => {
            Some("linestring has fewer than two points")
        }
        Geometry::Polygon(polygon) => polygon_defect(polygon),
        Geometry::MultiPolygon(polygons) => polygons.iter().find_map(polygon_defect),
        _ => None,
    }
}

/// Convert Geometry to Polygon, multipart to singlepart. Non-areal input
/// yields an empty vector.
pub fn to_polygons(geometry: &Geometry<f64>) -> Vec<Polygon<f64>> {
    match geometry {
        Geometry::Polygon(polygon) => vec![polygon.clone()],
        Geometry::MultiPolygon(multipolygon) => multipolygon.0.clone(),
        Geometry::Rect(rect) => vec![rect.to_polygon()],
        Geometry::Triangle(triangle) => vec![triangle.to_polygon()],
        _ => Vec::new(),
    }
}

pub fn to_multi_polygon(geometry: &Geometry<f64>) -> Option<MultiPolygon<f64>> {
    let polygons = to_polygons(geometry);
    if polygons.is_empty() {
        None
    } else {
        Some(MultiPolygon::from_iter(polygons))
    }
}

/// Convert Geometry to LineString, multipart to singlepart.
pub fn to_linestrings(geometry: &Geometry<f64>) -> Vec<LineString<f64>> {
    match geometry {
        Geometry::LineString(linestring) => vec![linestring.clone()],
        Geometry::MultiLineString(multilinestring) => multilinestring.0.clone(),
        Geometry::Line(line) => vec![(*line).into()],
        _ => Vec::new(),
    }
}

pub fn to_points(geometry: &Geometry<f64>) -> Vec<Point<f64>> {
    match geometry {
        Geometry::Point(point) => vec![*point],
        Geometry::MultiPoint(points) => points.0.clone(),
        _ => Vec::new(),
    }
}

pub fn is_polygonal(geometry: &Geometry<f64>) -> bool {
    matches!(
        geometry,
        Geometry::Polygon(_) | Geometry::MultiPolygon(_) | Geometry::Rect(_) | Geometry::Triangle(_)
    )
}

pub fn is_lineal(geometry: &Geometry<f64>) -> bool {
    matches!(
        geometry,
        Geometry::LineString(_) | Geometry::MultiLineString(_) | Geometry::Line(_)
    )
}

pub fn is_puntal(geometry: &Geometry<f64>) -> bool {
    matches!(geometry, Geometry::Point(_) | Geometry::MultiPoint(_))
}

pub fn area_of(geometry: &Geometry<f64>) -> f64 {
    geometry.unsigned_area()
}

pub fn length_of(geometry: &Geometry<f64>) -> f64 {
    to_linestrings(geometry)
        .iter()
        .map(|linestring| linestring.euclidean_length())
        .sum()
}

pub fn perimeter_of(geometry: &Geometry<f64>) -> f64 {
    to_polygons(geometry)
        .iter()
        .flat_map(|polygon| {
            polygon
                .interiors()
                .iter()
                .chain(std::iter::once(polygon.exterior()))
                .map(|ring| ring.euclidean_length())
                .collect_vec()
        })
        .sum()
}

/// Representative defect location: first vertex for points and lines,
/// point-on-surface for polygons, envelope centre as last fallback.
pub fn anchor_point(geometry: &Geometry<f64>) -> Option<(f64, f64)> {
    if is_polygonal(geometry) {
        if let Some(point) = geometry.interior_point() {
            return Some((point.x(), point.y()));
        }
    } else if let Some(coord) = geometry.coords_iter().next() {
        return Some((coord.x, coord.y));
    }
    Envelope::of(geometry).center()
}

pub fn centroid_of(geometry: &Geometry<f64>) -> Option<(f64, f64)> {
    geometry
        .centroid()
        .map(|point| (point.x(), point.y()))
        .or_else(|| Envelope::of(geometry).center())
}

/// Every constituent segment: linestring legs plus polygon ring legs.
pub fn segments(geometry: &Geometry<f64>) -> Vec<Line<f64>> {
    let mut lines: Vec<Line<f64>> = to_linestrings(geometry)
        .iter()
        .flat_map(|linestring| linestring.lines().collect_vec())
        .collect();
    for polygon in to_polygons(geometry) {
        lines.extend(polygon.exterior().lines());
        for interior in polygon.interiors() {
            lines.extend(interior.lines());
        }
    }
    lines
}

/// Proper self-crossings and collinear self-overlaps of one geometry,
/// from a sweep over its own segments. Shared endpoints of consecutive
/// segments surface as improper intersections and are ignored.
pub struct SelfIntersections {
    pub crossings: Vec<Coord<f64>>,
    pub overlaps: Vec<Line<f64>>,
}

pub fn self_intersections(geometry: &Geometry<f64>) -> SelfIntersections {
    let lines = segments(geometry);
    let mut crossings = Vec::new();
    let mut overlaps = Vec::new();
    if lines.len() < 2 {
        return SelfIntersections { crossings, overlaps };
    }
    for (_, _, intersection) in Intersections::<_>::from_iter(lines) {
        match intersection {
            LineIntersection::SinglePoint {
                intersection,
                is_proper: true,
            } => crossings.push(intersection),
            LineIntersection::Collinear { intersection }
                if intersection.start != intersection.end =>
            {
                overlaps.push(intersection)
            }
            _ => (),
        }
    }
    crossings.sort_by(|a, b| a.x.total_cmp(&b.x).then(a.y.total_cmp(&b.y)));
    crossings.dedup();
    SelfIntersections { crossings, overlaps }
}

/// Minimum euclidean distance between two geometries over their
/// flattened singlepart components.
pub fn geometry_distance(a: &Geometry<f64>, b: &Geometry<f64>) -> f64 {
    let mut best = f64::INFINITY;
    let a_points = to_points(a);
    let a_lines = to_linestrings(a);
    let a_polygons = to_polygons(a);
    let b_points = to_points(b);
    let b_lines = to_linestrings(b);
    let b_polygons = to_polygons(b);

    for point in &a_points {
        for other in &b_points {
            best = best.min(point.euclidean_distance(other));
        }
        for other in &b_lines {
            best = best.min(point.euclidean_distance(other));
        }
        for other in &b_polygons {
            best = best.min(point.euclidean_distance(other));
        }
    }
    for line in &a_lines {
        for other in &b_points {
            best = best.min(other.euclidean_distance(line));
        }
        for other in &b_lines {
            best = best.min(line.euclidean_distance(other));
        }
        for other in &b_polygons {
            best = best.min(line.euclidean_distance(other));
        }
    }
    for polygon in &a_polygons {
        for other in &b_points {
            best = best.min(other.euclidean_distance(polygon));
        }
        for other in &b_lines {
            best = best.min(other.euclidean_distance(polygon));
        }
        for other in &b_polygons {
            best = best.min(polygon.euclidean_distance(other));
        }
    }
    best
}

/// Distance from a defect location to the topological boundary of its
/// source geometry: polygon rings, or linestring endpoints. Points have
/// no boundary.
pub fn boundary_distance(geometry: &Geometry<f64>, x: f64, y: f64) -> Option<f64> {
    let point = Point::new(x, y);
    let mut best: Option<f64> = None;
    for polygon in to_polygons(geometry) {
        for ring in polygon
            .interiors()
            .iter()
            .chain(std::iter::once(polygon.exterior()))
        {
            let distance = point.euclidean_distance(ring);
            best = Some(best.map_or(distance, |current| current.min(distance)));
        }
    }
    for linestring in to_linestrings(geometry) {
        for end in [linestring.0.first(), linestring.0.last()].into_iter().flatten() {
            let distance = point.euclidean_distance(&Point::from(*end));
            best = Some(best.map_or(distance, |current| current.min(distance)));
        }
    }
    best
}

/// First coordinate where the segments of two geometries cross or
/// touch. Falls back to the first geometry's anchor.
pub fn first_intersection_point(a: &Geometry<f64>, b: &Geometry<f64>) -> Option<(f64, f64)> {
    let b_segments = segments(b);
    for own in segments(a) {
        for other in &b_segments {
            if let Some(LineIntersection::SinglePoint { intersection, .. }) =
                geo::algorithm::line_intersection::line_intersection(own, *other)
            {
                return Some((intersection.x, intersection.y));
            }
        }
    }
    anchor_point(a)
}

/// How many distinct points the segments of two geometries share.
pub fn intersection_point_count(a: &Geometry<f64>, b: &Geometry<f64>) -> usize {
    let b_segments = segments(b);
    let mut points: Vec<Coord<f64>> = Vec::new();
    for own in segments(a) {
        for other in &b_segments {
            if let Some(LineIntersection::SinglePoint { intersection, .. }) =
                geo::algorithm::line_intersection::line_intersection(own, *other)
            {
                points.push(intersection);
            }
        }
    }
    points.sort_by(|a, b| a.x.total_cmp(&b.x).then(a.y.total_cmp(&b.y)));
    points.dedup();
    points.len()
}

/// Centre of the coordinate envelope scraped out of a WKT string. Used
/// as the location fallback when an error carries no finite (x, y).
pub fn envelope_center_from_wkt(wkt: &str) -> Option<(f64, f64)> {
    let number = Regex::new(r"-?\d+(?:\.\d+)?(?:[eE][+-]?\d+)?").ok()?;
    let values: Vec<f64> = number
        .find_iter(wkt)
        .filter_map(|m| m.as_str().parse().ok())
        .collect();
    if values.len() < 2 {
        return None;
    }
    let mut envelope = Envelope::EMPTY;
    for pair in values.chunks(2) {
        if let [x, y] = pair {
            envelope = envelope.union(&Envelope::new(*x, *y, *x, *y));
        }
    }
    envelope.center()
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{line_string, point, polygon};

    #[test]
    fn envelope_never_inverts() {
        let envelope = Envelope::new(10.0, 5.0, 0.0, -5.0);
        assert_eq!(envelope.min_x(), 0.0);
        assert_eq!(envelope.max_x(), 10.0);
        assert_eq!(envelope.min_y(), -5.0);
        assert_eq!(envelope.max_y(), 5.0);
        assert!(!envelope.is_empty());
    }

    #[test]
    fn empty_envelope_matches_nothing() {
        let envelope = Envelope::EMPTY;
        assert!(!envelope.intersects(&Envelope::new(0.0, 0.0, 1.0, 1.0)));
        assert!(!Envelope::new(0.0, 0.0, 1.0, 1.0).contains(&envelope));
        assert_eq!(envelope.center(), None);
    }

    #[test]
    fn envelope_expand_and_union() {
        let a = Envelope::new(0.0, 0.0, 1.0, 1.0);
        let b = Envelope::new(2.0, 2.0, 3.0, 3.0);
        assert!(!a.intersects(&b));
        assert!(a.expand_by(1.0).intersects(&b));
        let both = a.union(&b);
        assert!(both.contains(&a) && both.contains(&b));
    }

    #[test]
    fn anchor_of_a_line_is_its_first_vertex() {
        let line: Geometry<f64> = line_string![(x: 3.0, y: 4.0), (x: 9.0, y: 9.0)].into();
        assert_eq!(anchor_point(&line), Some((3.0, 4.0)));
    }

    #[test]
    fn anchor_of_a_polygon_lies_inside() {
        let polygon: Geometry<f64> =
            polygon![(x: 0.0, y: 0.0), (x: 10.0, y: 0.0), (x: 10.0, y: 10.0), (x: 0.0, y: 10.0), (x: 0.0, y: 0.0)]
                .into();
        let (x, y) = anchor_point(&polygon).unwrap();
        assert!(x > 0.0 && x < 10.0);
        assert!(y > 0.0 && y < 10.0);
    }

    #[test]
    fn bowtie_reports_one_self_crossing() {
        // Segments cross at (1, 1).
        let bowtie: Geometry<f64> = line_string![
            (x: 0.0, y: 0.0),
            (x: 2.0, y: 2.0),
            (x: 2.0, y: 0.0),
            (x: 0.0, y: 2.0)
        ]
        .into();
        let found = self_intersections(&bowtie);
        assert_eq!(found.crossings.len(), 1);
        let crossing = found.crossings[0];
        assert!((crossing.x - 1.0).abs() < 1e-9);
        assert!((crossing.y - 1.0).abs() < 1e-9);
    }

    #[test]
    fn straight_line_has_no_self_crossing() {
        let line: Geometry<f64> =
            line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 2.0, y: 0.0)].into();
        let found = self_intersections(&line);
        assert!(found.crossings.is_empty());
        assert!(found.overlaps.is_empty());
    }

    #[test]
    fn wkt_round_trip_preserves_envelope() {
        let polygon: Geometry<f64> =
            polygon![(x: 0.5, y: 0.5), (x: 7.25, y: 0.5), (x: 7.25, y: 3.0), (x: 0.5, y: 3.0), (x: 0.5, y: 0.5)]
                .into();
        let wkt = to_wkt(&polygon).unwrap();
        let back = from_wkt(&wkt).unwrap();
        assert_eq!(Envelope::of(&polygon), Envelope::of(&back));
    }

    #[test]
    fn envelope_center_recovered_from_wkt() {
        let (x, y) =
            envelope_center_from_wkt("POLYGON ((0 0, 10 0, 10 10, 0 10, 0 0))").unwrap();
        assert_eq!((x, y), (5.0, 5.0));
    }

    #[test]
    fn distance_between_disjoint_points() {
        let a: Geometry<f64> = point! {x: 0.0, y: 0.0}.into();
        let b: Geometry<f64> = point! {x: 0.0005, y: 0.0}.into();
        assert!((geometry_distance(&a, &b) - 0.0005).abs() < 1e-12);
    }

    #[test]
    fn validity_rejects_short_ring() {
        let degenerate = Geometry::Polygon(Polygon::new(
            LineString::from(vec![(0.0, 0.0), (1.0, 0.0), (0.0, 0.0)]),
            vec![],
        ));
        assert!(basic_validity_reason(&degenerate).is_some());
    }
}
