//! SNMP variables to time-series points

use std::collections::BTreeMap;

use serde::Serialize;

use crate::snmp::{SnmpType, SnmpVariable};

/// Normalization errors
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("undefined SNMP variable type {snmp_type:?} for {oid}")]
    UnknownType { oid: String, snmp_type: String },

    #[error("invalid numeric value {value:?} for {oid}")]
    InvalidNumber { oid: String, value: String },
}

/// Primitive value of a variable
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SnmpValue {
    Integer(i64),
    Float(f64),
    Text(String),
    Null,
}

/// One time-series point
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub value: SnmpValue,
    /// Unix seconds; the server assigns the time when absent
    pub timestamp: Option<i64>,
}

/// Convert a variable to its primitive value
pub fn normalize_value(variable: &SnmpVariable) -> Result<SnmpValue, TransformError> {
    let raw = variable.value.trim();
    let invalid = || TransformError::InvalidNumber {
        oid: variable.oid.clone(),
        value: variable.value.clone(),
    };

    match &variable.snmp_type {
        SnmpType::Integer
        | SnmpType::Counter32
        | SnmpType::Counter64
        | SnmpType::Gauge32
        | SnmpType::Timeticks
        | SnmpType::Unsigned32 => parse_integer(raw).ok_or_else(invalid),
        SnmpType::String | SnmpType::IpAddress | SnmpType::Oid => {
            Ok(SnmpValue::Text(variable.value.clone()))
        }
        SnmpType::HexString => Ok(SnmpValue::Text(normalize_hex(raw))),
        SnmpType::Opaque => parse_opaque(raw).ok_or_else(invalid),
        SnmpType::NoSuchObject | SnmpType::NoSuchInstance | SnmpType::EndOfMibView => {
            Ok(SnmpValue::Null)
        }
        SnmpType::Other(label) => Err(TransformError::UnknownType {
            oid: variable.oid.clone(),
            snmp_type: label.clone(),
        }),
    }
}

// Counter64 values past i64::MAX degrade to floats
fn parse_integer(raw: &str) -> Option<SnmpValue> {
    if let Ok(value) = raw.parse::<i64>() {
        return Some(SnmpValue::Integer(value));
    }
    raw.parse::<u64>().ok().map(|value| SnmpValue::Float(value as f64))
}

fn parse_opaque(raw: &str) -> Option<SnmpValue> {
    let (kind, value) = raw.split_once(':')?;
    let value = value.trim();
    match kind.trim() {
        "Float" | "Double" => value.parse().ok().map(SnmpValue::Float),
        _ => parse_integer(value),
    }
}

/// Upper-case, single-space separated hex octets
fn normalize_hex(raw: &str) -> String {
    raw.split_whitespace()
        .map(str::to_uppercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build a point from one variable, or `None` when it carries no value
pub fn to_point(
    variable: &SnmpVariable,
    tags: &BTreeMap<String, String>,
    timestamp: Option<i64>,
) -> Result<Option<Point>, TransformError> {
    let value = normalize_value(variable)?;
    if value == SnmpValue::Null {
        return Ok(None);
    }

    let mut point_tags = tags.clone();
    if let Some(index) = &variable.index {
        point_tags.insert("index".to_string(), index.clone());
    }

    Ok(Some(Point {
        measurement: variable.oid.clone(),
        tags: point_tags,
        value,
        timestamp,
    }))
}

/// Build points from many variables, skipping the ones without a value
pub fn to_points(
    variables: &[SnmpVariable],
    tags: &BTreeMap<String, String>,
    timestamp: Option<i64>,
) -> Result<Vec<Point>, TransformError> {
    let mut points = Vec::with_capacity(variables.len());
    for variable in variables {
        if let Some(point) = to_point(variable, tags, timestamp)? {
            points.push(point);
        }
    }
    Ok(points)
}
