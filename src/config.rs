use std::fs::File;
use std::io::Read;
use std::path::Path;

use csv::ReaderBuilder;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::rule::{
    GeometryCheck, GeometryRule, RelationRule, Thresholds, TopologyRule, DEFAULT_TOLERANCE,
};

/// One parsed row of the rule matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRule {
    pub table_id: String,
    pub table_name: String,
    pub geometry_type: String,
    pub checks: Vec<GeometryCheck>,
}

/// Everything one validation run needs to know about its rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    pub version: String,
    pub tables: Vec<TableRule>,
    pub geometry: Vec<GeometryRule>,
    pub relations: Vec<RelationRule>,
    pub topology: Vec<TopologyRule>,
}

impl RuleSet {
    pub fn assemble(
        version: impl Into<String>,
        tables: Vec<TableRule>,
        relations: Vec<RelationRule>,
        topology: Vec<TopologyRule>,
    ) -> Self {
        let geometry = tables
            .iter()
            .flat_map(|table| {
                table.checks.iter().map(|check| GeometryRule {
                    layer: table.table_name.clone(),
                    table_id: Some(table.table_id.clone()),
                    check: *check,
                    tolerance: DEFAULT_TOLERANCE,
                    thresholds: Thresholds::default(),
                })
            })
            .collect();
        RuleSet {
            version: version.into(),
            tables,
            geometry,
            relations,
            topology,
        }
    }

    /// Layers named by any rule, for the table-check stage.
    pub fn referenced_layers(&self) -> Vec<String> {
        let mut layers: Vec<String> = self
            .tables
            .iter()
            .map(|table| table.table_name.clone())
            .chain(self.relations.iter().flat_map(|rule| {
                [rule.source_layer.clone(), rule.target_layer.clone()]
            }))
            .chain(self.topology.iter().flat_map(|rule| {
                std::iter::once(rule.source_layer.clone())
                    .chain(rule.target_layer.clone())
            }))
            .collect();
        layers.sort();
        layers.dedup();
        layers
    }

    /// Rejects malformed rules before any stage runs.
    pub fn validate(&self) -> Result<(), EngineError> {
        for rule in &self.geometry {
            if rule.tolerance < 0.0 {
                return Err(EngineError::NegativeTolerance(rule.rule_id(), rule.tolerance));
            }
        }
        for rule in &self.relations {
            if rule.tolerance < 0.0 {
                return Err(EngineError::NegativeTolerance(rule.rule_id(), rule.tolerance));
            }
        }
        for rule in &self.topology {
            if rule.tolerance < 0.0 {
                return Err(EngineError::NegativeTolerance(rule.rule_id(), rule.tolerance));
            }
            if !rule.kind.is_self_rule() && rule.target_layer.is_none() {
                return Err(EngineError::InputInvalid(format!(
                    "topology rule {} needs a target layer",
                    rule.rule_id()
                )));
            }
        }
        Ok(())
    }
}

/// Parses the tabular rule matrix: header row, first three columns
/// `TableId, TableName, GeometryType`, remaining columns rule names
/// with Y/N cells. Anything but `Y` leaves a check off.
pub fn parse_rule_matrix<Source: Read>(source: Source) -> Result<Vec<TableRule>, EngineError> {
    let mut reader = ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(source);
    let headers = reader.headers()?.clone();
    if headers.len() < 3 {
        return Err(EngineError::RuleTableRead(
            "rule matrix needs TableId, TableName and GeometryType columns".to_owned(),
        ));
    }
    let checks: Vec<(usize, Option<GeometryCheck>)> = headers
        .iter()
        .enumerate()
        .skip(3)
        .map(|(position, name)| {
            let check = GeometryCheck::from_column_name(name);
            if check.is_none() {
                warn!("unknown rule column '{name}' ignored");
            }
            (position, check)
        })
        .collect();

    let mut tables = Vec::new();
    for row in reader.records() {
        let row = row?;
        if row.len() != headers.len() {
            return Err(EngineError::RuleTableRead(format!(
                "row {:?} has {} columns, header has {}",
                row.get(0).unwrap_or(""),
                row.len(),
                headers.len()
            )));
        }
        let table_id = row.get(0).unwrap_or("").to_owned();
        let table_name = row.get(1).unwrap_or("").to_owned();
        let geometry_type = row.get(2).unwrap_or("").to_uppercase();
        if table_name.is_empty() {
            return Err(EngineError::RuleTableRead(format!(
                "row '{table_id}' has no table name"
            )));
        }
        let offered = GeometryCheck::available(&geometry_type);
        let mut enabled = Vec::new();
        for (position, check) in &checks {
            let Some(check) = check else { continue };
            if row.get(*position).map(str::trim) != Some("Y") {
                continue;
            }
            if offered.contains(check) {
                enabled.push(*check);
            } else {
                warn!(
                    "check {check:?} is not applicable to {geometry_type} table '{table_name}', ignored"
                );
            }
        }
        tables.push(TableRule {
            table_id,
            table_name,
            geometry_type,
            checks: enabled,
        });
    }
    Ok(tables)
}

pub fn load_rule_matrix(path: &Path) -> Result<Vec<TableRule>, EngineError> {
    let file = File::open(path)
        .map_err(|error| EngineError::RuleTableRead(format!("{path:?}: {error}")))?;
    parse_rule_matrix(file)
}

pub fn load_relation_rules(path: &Path) -> Result<Vec<RelationRule>, EngineError> {
    let file = File::open(path)
        .map_err(|error| EngineError::RuleFileRead(format!("{path:?}: {error}")))?;
    serde_json::from_reader(file)
        .map_err(|error| EngineError::RuleFileRead(format!("{path:?}: {error}")))
}

pub fn load_topology_rules(path: &Path) -> Result<Vec<TopologyRule>, EngineError> {
    let file = File::open(path)
        .map_err(|error| EngineError::RuleFileRead(format!("{path:?}: {error}")))?;
    serde_json::from_reader(file)
        .map_err(|error| EngineError::RuleFileRead(format!("{path:?}: {error}")))
}
