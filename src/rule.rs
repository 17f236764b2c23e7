use geo::Relate;
use geo_types::Geometry;
use serde::{Deserialize, Serialize};

/// Severity of an emitted error, most severe first. The storage
/// vocabulary of the error store is CRIT/MAJOR/MINOR/INFO.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Severity {
    Critical,
    Error,
    Warning,
    Info,
}

impl Severity {
    pub fn storage_code(&self) -> &'static str {
        match self {
            Self::Critical => "CRIT",
            Self::Error => "MAJOR",
            Self::Warning => "MINOR",
            Self::Info => "INFO",
        }
    }

    pub fn from_storage_code(code: &str) -> Option<Self> {
        match code {
            "CRIT" => Some(Self::Critical),
            "MAJOR" => Some(Self::Error),
            "MINOR" => Some(Self::Warning),
            "INFO" => Some(Self::Info),
            _ => None,
        }
    }

    pub fn step_up(&self) -> Self {
        match self {
            Self::Critical | Self::Error => Self::Critical,
            Self::Warning => Self::Error,
            Self::Info => Self::Warning,
        }
    }

    pub fn step_down(&self) -> Self {
        match self {
            Self::Critical => Self::Error,
            Self::Error => Self::Warning,
            Self::Warning | Self::Info => Self::Info,
        }
    }
}

/// Per-layer geometry checks, one column each in the rule matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GeometryCheck {
    BasicValidity,
    DuplicateGeom,
    OverlapGeom,
    SelfIntersect,
    Sliver,
    ShortLength,
    SmallArea,
    PolygonInPolygon,
}

impl GeometryCheck {
    pub const ALL: [GeometryCheck; 8] = [
        Self::BasicValidity,
        Self::DuplicateGeom,
        Self::OverlapGeom,
        Self::SelfIntersect,
        Self::Sliver,
        Self::ShortLength,
        Self::SmallArea,
        Self::PolygonInPolygon,
    ];

    pub fn from_column_name(name: &str) -> Option<Self> {
        match name.trim() {
            "BasicValidity" => Some(Self::BasicValidity),
            "DuplicateGeom" => Some(Self::DuplicateGeom),
            "OverlapGeom" => Some(Self::OverlapGeom),
            "SelfIntersect" => Some(Self::SelfIntersect),
            "Sliver" => Some(Self::Sliver),
            "ShortLength" => Some(Self::ShortLength),
            "SmallArea" => Some(Self::SmallArea),
            "PolygonInPolygon" => Some(Self::PolygonInPolygon),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::BasicValidity => codes::GEOM_INVALID,
            Self::DuplicateGeom => codes::DUPLICATE,
            Self::OverlapGeom => codes::OVERLAP,
            Self::SelfIntersect => codes::SELF_INTERSECT,
            Self::Sliver => codes::SLIVER,
            Self::ShortLength => codes::SHORT_LENGTH,
            Self::SmallArea => codes::SMALL_AREA,
            Self::PolygonInPolygon => codes::POLYGON_IN_POLYGON,
        }
    }

    pub fn korean_label(&self) -> &'static str {
        match self {
            Self::BasicValidity => "기본무결성",
            Self::DuplicateGeom => "중복",
            Self::OverlapGeom => "겹침",
            Self::SelfIntersect => "자체교차",
            Self::Sliver => "슬리버",
            Self::ShortLength => "짧은객체",
            Self::SmallArea => "미세면적",
            Self::PolygonInPolygon => "폴리곤포함",
        }
    }

    /// Which checks make sense for a layer's declared geometry type.
    pub fn available(geometry_type: &str) -> Vec<GeometryCheck> {
        let polygonal = matches!(geometry_type, "POLYGON" | "MULTIPOLYGON");
        let lineal = matches!(geometry_type, "LINESTRING" | "MULTILINESTRING");
        Self::ALL
            .into_iter()
            .filter(|check| match check {
                Self::Sliver | Self::SmallArea | Self::PolygonInPolygon => polygonal,
                Self::ShortLength => lineal,
                _ => true,
            })
            .collect()
    }
}

/// Binary spatial predicates for cross-layer relation rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpatialRelation {
    Intersects,
    Within,
    Contains,
    Crosses,
    Touches,
    Overlaps,
    Disjoint,
    Equals,
}

impl SpatialRelation {
    pub fn evaluate(&self, source: &Geometry<f64>, target: &Geometry<f64>) -> bool {
        let matrix = source.relate(target);
        match self {
            Self::Intersects => matrix.is_intersects(),
            Self::Within => matrix.is_within(),
            Self::Contains => matrix.is_contains(),
            Self::Crosses => matrix.is_crosses(),
            Self::Touches => matrix.is_touches(),
            Self::Overlaps => matrix.is_overlaps(),
            Self::Disjoint => matrix.is_disjoint(),
            Self::Equals => matrix.is_equal_topo(),
        }
    }

    /// Relations a coarse envelope pass can produce candidates for.
    /// Disjoint cannot be answered by envelope probing.
    pub fn index_assisted(&self) -> bool {
        !matches!(self, Self::Disjoint)
    }

    /// Relations whose violation is considered structurally critical.
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Within | Self::Contains | Self::Crosses)
    }

    pub fn korean_label(&self) -> &'static str {
        match self {
            Self::Intersects => "교차",
            Self::Within => "내부",
            Self::Contains => "포함",
            Self::Crosses => "관통",
            Self::Touches => "접촉",
            Self::Overlaps => "겹침",
            Self::Disjoint => "분리",
            Self::Equals => "동일",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Intersects => "REL_INTERSECTS",
            Self::Within => "REL_WITHIN",
            Self::Contains => "REL_CONTAINS",
            Self::Crosses => "REL_CROSSES",
            Self::Touches => "REL_TOUCHES",
            Self::Overlaps => "REL_OVERLAPS",
            Self::Disjoint => "REL_DISJOINT",
            Self::Equals => "REL_EQUALS",
        }
    }
}

/// Cross-layer (and self-layer) topology rule kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TopologyKind {
    MustNotOverlap,
    MustNotHaveGaps,
    MustBeCoveredBy,
    MustCover,
    MustNotIntersect,
    MustBeProperlyInside,
    MustNotSelfOverlap,
    MustNotSelfIntersect,
}

impl TopologyKind {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MustNotOverlap => codes::OVERLAP_VIOLATION,
            Self::MustNotHaveGaps => codes::GAP_DETECTED,
            Self::MustBeCoveredBy => codes::NOT_COVERED_BY,
            Self::MustCover => codes::NOT_COVERED,
            Self::MustNotIntersect => codes::INTERSECTION_VIOLATION,
            Self::MustBeProperlyInside => codes::NOT_PROPERLY_INSIDE,
            Self::MustNotSelfOverlap => codes::SELF_OVERLAP_VIOLATION,
            Self::MustNotSelfIntersect => codes::SELF_INTERSECT_VIOLATION,
        }
    }

    pub fn korean_label(&self) -> &'static str {
        match self {
            Self::MustNotOverlap => "겹침금지",
            Self::MustNotHaveGaps => "틈금지",
            Self::MustBeCoveredBy => "피복필수",
            Self::MustCover => "피복제공",
            Self::MustNotIntersect => "교차금지",
            Self::MustBeProperlyInside => "내부필수",
            Self::MustNotSelfOverlap => "자체겹침금지",
            Self::MustNotSelfIntersect => "자체교차금지",
        }
    }

    /// Rules that operate on the source layer alone.
    pub fn is_self_rule(&self) -> bool {
        matches!(
            self,
            Self::MustNotHaveGaps | Self::MustNotSelfOverlap | Self::MustNotSelfIntersect
        )
    }
}

/// Stable error codes of the emitted catalogue.
pub mod codes {
    pub const DUPLICATE: &str = "DUP001";
    pub const OVERLAP: &str = "OVL001";
    pub const SELF_INTERSECT: &str = "SLF001";
    pub const SLIVER: &str = "SLV001";
    pub const SHORT_LENGTH: &str = "SHT001";
    pub const SMALL_AREA: &str = "SML001";
    pub const POLYGON_IN_POLYGON: &str = "PIP001";
    pub const GEOM_INVALID: &str = "GEOM_INVALID";
    pub const GEOM_TOO_COMPLEX: &str = "GEOM_TOO_COMPLEX";
    pub const GEOM_PROCESSING_TIMEOUT: &str = "GEOM_PROCESSING_TIMEOUT";
    pub const OVERLAP_VIOLATION: &str = "OVERLAP_VIOLATION";
    pub const GAP_DETECTED: &str = "GAP_DETECTED";
    pub const NOT_COVERED_BY: &str = "NOT_COVERED_BY";
    pub const NOT_COVERED: &str = "NOT_COVERED";
    pub const INTERSECTION_VIOLATION: &str = "INTERSECTION_VIOLATION";
    pub const NOT_PROPERLY_INSIDE: &str = "NOT_PROPERLY_INSIDE";
    pub const SELF_OVERLAP_VIOLATION: &str = "SELF_OVERLAP_VIOLATION";
    pub const SELF_INTERSECT_VIOLATION: &str = "SELF_INTERSECT_VIOLATION";
    pub const POINT_IN_POLYGON_VIOLATION: &str = "POINT_IN_POLYGON_VIOLATION";
    pub const LINE_POLYGON_VIOLATION: &str = "LINE_POLYGON_VIOLATION";
    pub const TABLE_MISSING: &str = "TABLE_MISSING";
    pub const TABLE_READ_FAILED: &str = "TABLE_READ_FAILED";
    pub const SCHEMA_MISMATCH: &str = "SCHEMA_MISMATCH";

    /// Codes whose violations are always structurally critical.
    pub const CRITICAL: [&str; 5] = [
        GAP_DETECTED,
        SELF_OVERLAP_VIOLATION,
        SELF_INTERSECT_VIOLATION,
        GEOM_INVALID,
        TABLE_MISSING,
    ];
}

/// Base severity for a code, before the classifier adjusts it.
pub fn base_severity(code: &str) -> Severity {
    if codes::CRITICAL.contains(&code) {
        return Severity::Critical;
    }
    match code {
        codes::OVERLAP_VIOLATION
        | codes::INTERSECTION_VIOLATION
        | codes::NOT_PROPERLY_INSIDE
        | codes::POINT_IN_POLYGON_VIOLATION
        | codes::LINE_POLYGON_VIOLATION
        | codes::GEOM_PROCESSING_TIMEOUT
        | codes::DUPLICATE
        | codes::OVERLAP => Severity::Error,
        codes::NOT_COVERED_BY
        | codes::NOT_COVERED
        | codes::GEOM_TOO_COMPLEX
        | codes::SLIVER
        | codes::SHORT_LENGTH
        | codes::SMALL_AREA
        | codes::POLYGON_IN_POLYGON
        | codes::SCHEMA_MISMATCH => Severity::Warning,
        _ => Severity::Error,
    }
}

/// Size and shape thresholds of the geometry checks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Thresholds {
    pub small_area: f64,
    pub sliverness: f64,
    pub short_length: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            small_area: 1.0,
            sliverness: 100.0,
            short_length: 1.0,
        }
    }
}

pub const DEFAULT_TOLERANCE: f64 = 1e-3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeometryRule {
    pub layer: String,
    #[serde(default)]
    pub table_id: Option<String>,
    pub check: GeometryCheck,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    #[serde(default)]
    pub thresholds: Thresholds,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationRule {
    pub source_layer: String,
    pub target_layer: String,
    pub relation: SpatialRelation,
    pub required: bool,
    #[serde(default = "default_relation_severity")]
    pub severity: Severity,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyRule {
    pub source_layer: String,
    #[serde(default)]
    pub target_layer: Option<String>,
    pub kind: TopologyKind,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    #[serde(default)]
    pub allow_exceptions: bool,
    #[serde(default)]
    pub exception_conditions: Vec<String>,
}

fn default_tolerance() -> f64 {
    DEFAULT_TOLERANCE
}

fn default_relation_severity() -> Severity {
    Severity::Error
}

impl GeometryRule {
    pub fn rule_id(&self) -> String {
        format!("{}:{}", self.layer, self.code())
    }

    pub fn code(&self) -> &'static str {
        self.check.code()
    }
}

impl RelationRule {
    pub fn rule_id(&self) -> String {
        format!(
            "{}~{}:{}",
            self.source_layer,
            self.target_layer,
            self.relation.code()
        )
    }
}

impl TopologyRule {
    pub fn rule_id(&self) -> String {
        match &self.target_layer {
            Some(target) => format!("{}~{}:{}", self.source_layer, target, self.kind.code()),
            None => format!("{}:{}", self.source_layer, self.kind.code()),
        }
    }
}

/// The rule sum type: one work unit of a validation stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Rule {
    Geometry(GeometryRule),
    Relation(RelationRule),
    Topology(TopologyRule),
}

impl Rule {
    pub fn rule_id(&self) -> String {
        match self {
            Self::Geometry(rule) => rule.rule_id(),
            Self::Relation(rule) => rule.rule_id(),
            Self::Topology(rule) => rule.rule_id(),
        }
    }

    pub fn tolerance(&self) -> f64 {
        match self {
            Self::Geometry(rule) => rule.tolerance,
            Self::Relation(rule) => rule.tolerance,
            Self::Topology(rule) => rule.tolerance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_steps_saturate() {
        assert_eq!(Severity::Critical.step_up(), Severity::Critical);
        assert_eq!(Severity::Info.step_down(), Severity::Info);
        assert_eq!(Severity::Warning.step_up(), Severity::Error);
        assert_eq!(Severity::Error.step_down(), Severity::Warning);
    }

    #[test]
    fn severity_sorts_most_severe_first() {
        let mut severities = vec![Severity::Info, Severity::Critical, Severity::Warning];
        severities.sort();
        assert_eq!(severities[0], Severity::Critical);
    }

    #[test]
    fn storage_codes_round_trip() {
        for severity in [
            Severity::Critical,
            Severity::Error,
            Severity::Warning,
            Severity::Info,
        ] {
            assert_eq!(
                Severity::from_storage_code(severity.storage_code()),
                Some(severity)
            );
        }
    }

    #[test]
    fn polygon_checks_not_offered_for_lines() {
        let available = GeometryCheck::available("LINESTRING");
        assert!(available.contains(&GeometryCheck::ShortLength));
        assert!(!available.contains(&GeometryCheck::Sliver));
        assert!(!available.contains(&GeometryCheck::SmallArea));
    }

    #[test]
    fn relation_predicates_on_simple_shapes() {
        use geo::polygon;
        let outer: Geometry<f64> =
            polygon![(x: 0.0, y: 0.0), (x: 10.0, y: 0.0), (x: 10.0, y: 10.0), (x: 0.0, y: 10.0), (x: 0.0, y: 0.0)]
                .into();
        let inner: Geometry<f64> =
            polygon![(x: 2.0, y: 2.0), (x: 4.0, y: 2.0), (x: 4.0, y: 4.0), (x: 2.0, y: 4.0), (x: 2.0, y: 2.0)]
                .into();
        assert!(SpatialRelation::Contains.evaluate(&outer, &inner));
        assert!(SpatialRelation::Within.evaluate(&inner, &outer));
        assert!(SpatialRelation::Intersects.evaluate(&outer, &inner));
        assert!(!SpatialRelation::Disjoint.evaluate(&outer, &inner));
        assert!(!SpatialRelation::Equals.evaluate(&outer, &inner));
    }
}
