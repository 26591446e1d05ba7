//! Field and scalar algebra
//!
//! Endpoints declare what they return as a tuple of [`Field`]s; every record
//! that flows through the pipeline is a vector of [`Scalar`]s whose kinds are
//! assignable to those fields. The kind set maps bijectively onto Postgres
//! column types, which is what lets the persistence gateway create tables
//! straight from an endpoint declaration.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Serialize, Serializer};
use std::fmt;

use crate::error::{Error, Result};
use crate::timefmt;

/// The closed set of wire/storage types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Text,
    Bool,
    Int,
    Float,
    Date,
    Time,
    Timestamp,
    Interval,
}

impl FieldKind {
    /// Postgres column type for this kind
    pub fn pg_type(&self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::Bool => "boolean",
            FieldKind::Int => "bigint",
            FieldKind::Float => "double precision",
            FieldKind::Date => "date",
            FieldKind::Time => "time",
            FieldKind::Timestamp => "timestamp",
            FieldKind::Interval => "interval",
        }
    }

    /// Inverse of [`pg_type`](Self::pg_type)
    pub fn from_pg_type(s: &str) -> Option<FieldKind> {
        match s {
            "text" | "character varying" => Some(FieldKind::Text),
            "boolean" => Some(FieldKind::Bool),
            "bigint" | "integer" | "smallint" => Some(FieldKind::Int),
            "double precision" | "real" | "numeric" => Some(FieldKind::Float),
            "date" => Some(FieldKind::Date),
            "time" | "time without time zone" => Some(FieldKind::Time),
            "timestamp" | "timestamp without time zone" => Some(FieldKind::Timestamp),
            "interval" => Some(FieldKind::Interval),
            _ => None,
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.pg_type())
    }
}

/// A named, typed column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub kind: FieldKind,
}

impl Field {
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self { name, kind }
    }
}

/// A single typed value
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Text(String),
    Bool(bool),
    Int(i64),
    Float(f64),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    Interval(Duration),
}

/// One row of endpoint output
pub type Record = Vec<Scalar>;

impl Scalar {
    /// The kind this value inhabits; `Null` inhabits none
    pub fn kind(&self) -> Option<FieldKind> {
        match self {
            Scalar::Null => None,
            Scalar::Text(_) => Some(FieldKind::Text),
            Scalar::Bool(_) => Some(FieldKind::Bool),
            Scalar::Int(_) => Some(FieldKind::Int),
            Scalar::Float(_) => Some(FieldKind::Float),
            Scalar::Date(_) => Some(FieldKind::Date),
            Scalar::Time(_) => Some(FieldKind::Time),
            Scalar::Timestamp(_) => Some(FieldKind::Timestamp),
            Scalar::Interval(_) => Some(FieldKind::Interval),
        }
    }

    /// Whether this value is assignable to a column of `kind`
    pub fn assignable_to(&self, kind: FieldKind) -> bool {
        match self.kind() {
            None => true,
            Some(own) => own == kind || (own == FieldKind::Int && kind == FieldKind::Float),
        }
    }

    /// Coerce a JSON value into a scalar of the given kind
    ///
    /// Vendors routinely return numbers as strings and vice versa, so the
    /// coercion is permissive within the target kind and strict across kinds.
    pub fn coerce(kind: FieldKind, value: &serde_json::Value) -> Result<Scalar> {
        use serde_json::Value;

        if value.is_null() {
            return Ok(Scalar::Null);
        }
        let fail = || Error::SchemaDrift(format!("cannot coerce {value} to {kind}"));

        match kind {
            FieldKind::Text => match value {
                Value::String(s) => Ok(Scalar::Text(s.clone())),
                Value::Number(n) => Ok(Scalar::Text(n.to_string())),
                Value::Bool(b) => Ok(Scalar::Text(b.to_string())),
                _ => Err(fail()),
            },
            FieldKind::Bool => match value {
                Value::Bool(b) => Ok(Scalar::Bool(*b)),
                Value::String(s) => s.parse().map(Scalar::Bool).map_err(|_| fail()),
                _ => Err(fail()),
            },
            FieldKind::Int => match value {
                Value::Number(n) => n.as_i64().map(Scalar::Int).ok_or_else(fail),
                Value::String(s) => s.parse().map(Scalar::Int).map_err(|_| fail()),
                _ => Err(fail()),
            },
            FieldKind::Float => match value {
                Value::Number(n) => n.as_f64().map(Scalar::Float).ok_or_else(fail),
                Value::String(s) => s.parse().map(Scalar::Float).map_err(|_| fail()),
                _ => Err(fail()),
            },
            FieldKind::Date => value
                .as_str()
                .ok_or_else(fail)
                .and_then(timefmt::parse_date)
                .map(Scalar::Date),
            FieldKind::Time => value
                .as_str()
                .ok_or_else(fail)
                .and_then(timefmt::parse_time)
                .map(Scalar::Time),
            FieldKind::Timestamp => value
                .as_str()
                .ok_or_else(fail)
                .and_then(timefmt::parse_timestamp)
                .map(Scalar::Timestamp),
            FieldKind::Interval => value
                .as_str()
                .ok_or_else(fail)
                .and_then(timefmt::parse_duration)
                .map(Scalar::Interval),
        }
    }

    /// JSON projection used by the HTTP response encoding
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            Scalar::Null => Value::Null,
            Scalar::Text(s) => Value::String(s.clone()),
            Scalar::Bool(b) => Value::Bool(*b),
            Scalar::Int(n) => Value::from(*n),
            Scalar::Float(f) => Value::from(*f),
            Scalar::Date(d) => Value::String(timefmt::format_date(*d)),
            Scalar::Time(t) => Value::String(timefmt::format_time(*t)),
            Scalar::Timestamp(dt) => Value::String(timefmt::format_timestamp(*dt)),
            Scalar::Interval(d) => Value::String(timefmt::format_duration(*d)),
        }
    }
}

impl Serialize for Scalar {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_json() {
            serde_json::Value::String(s) => f.write_str(&s),
            other => write!(f, "{other}"),
        }
    }
}

/// Check one record against an endpoint's declared return fields
///
/// Arity must match exactly and each element must be assignable to its
/// declared kind.
pub fn check_record(returns: &[Field], record: &Record) -> Result<()> {
    if record.len() != returns.len() {
        return Err(Error::SchemaDrift(format!(
            "record arity {} does not match declared arity {}",
            record.len(),
            returns.len()
        )));
    }
    for (field, value) in returns.iter().zip(record) {
        if !value.assignable_to(field.kind) {
            return Err(Error::SchemaDrift(format!(
                "field `{}` expects {}, got {:?}",
                field.name, field.kind, value
            )));
        }
    }
    Ok(())
}
