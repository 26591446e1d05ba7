//! Vendor resources
//!
//! A resource is an immutable, validated parameter bundle naming an
//! addressable unit at a vendor (a FRED series, a broker contract). Each
//! resource class declares a constant field group (fixed for every instance)
//! and a variable field group (per-instance, validated at construction), and
//! a subset of the variable fields forms the canonical string handle.
//!
//! The serialized form `<ClassName>$<handle>` is what templates and HTTP
//! request params carry.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::field::{Field, Scalar};
use crate::error::{Error, Result};

/// Separator between class name and handle in the serialized form
pub const CLASS_SEP: char = '$';
/// Separator between handle field values
pub const HANDLE_SEP: char = '_';

/// Declaration of one variable field: the field, whether it is required, and
/// the default used when an optional field is absent
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub field: Field,
    pub required: bool,
    pub default: Option<Scalar>,
}

impl FieldDef {
    pub fn required(field: Field) -> Self {
        Self {
            field,
            required: true,
            default: None,
        }
    }

    pub fn optional(field: Field, default: Scalar) -> Self {
        Self {
            field,
            required: false,
            default: Some(default),
        }
    }
}

/// A resource class: the validator and codec for one kind of addressable unit
#[derive(Debug)]
pub struct ResourceClass {
    name: &'static str,
    constant: Vec<(Field, Scalar)>,
    variable: Vec<FieldDef>,
    handle_fields: Vec<&'static str>,
}

impl ResourceClass {
    /// Declare a class. `handle_fields` must name variable fields; they form
    /// the handle in the given order.
    pub fn new(
        name: &'static str,
        constant: Vec<(Field, Scalar)>,
        variable: Vec<FieldDef>,
        handle_fields: Vec<&'static str>,
    ) -> Arc<Self> {
        for handle_field in &handle_fields {
            assert!(
                variable.iter().any(|def| def.field.name == *handle_field),
                "handle field `{handle_field}` is not a variable field of `{name}`"
            );
        }
        Arc::new(Self {
            name,
            constant,
            variable,
            handle_fields,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Construct an instance from per-field JSON values
    ///
    /// Validates that every required field is present, every value coerces to
    /// its declared kind, and no extraneous keys were supplied.
    pub fn instantiate(
        self: &Arc<Self>,
        mut values: BTreeMap<String, serde_json::Value>,
    ) -> Result<Resource> {
        let mut resolved = BTreeMap::new();

        for (field, value) in &self.constant {
            resolved.insert(field.name.to_string(), value.clone());
        }

        for def in &self.variable {
            match values.remove(def.field.name) {
                Some(raw) => {
                    let scalar = Scalar::coerce(def.field.kind, &raw).map_err(|e| {
                        Error::BadRequest(format!(
                            "resource {}: field `{}`: {e}",
                            self.name, def.field.name
                        ))
                    })?;
                    resolved.insert(def.field.name.to_string(), scalar);
                }
                None if def.required => {
                    return Err(Error::BadRequest(format!(
                        "resource {}: missing required field `{}`",
                        self.name, def.field.name
                    )));
                }
                None => {
                    let default = def.default.clone().unwrap_or(Scalar::Null);
                    resolved.insert(def.field.name.to_string(), default);
                }
            }
        }

        if let Some(extra) = values.keys().next() {
            return Err(Error::BadRequest(format!(
                "resource {}: unknown field `{extra}`",
                self.name
            )));
        }

        Ok(Resource {
            class: Arc::clone(self),
            values: resolved,
        })
    }

    /// Reconstruct an instance from its handle
    ///
    /// The handle supplies the handle fields in declaration order; the last
    /// field absorbs any embedded separators. Non-handle variable fields take
    /// their defaults.
    pub fn decode(self: &Arc<Self>, handle: &str) -> Result<Resource> {
        let parts: Vec<&str> = handle.splitn(self.handle_fields.len(), HANDLE_SEP).collect();
        if parts.len() != self.handle_fields.len() {
            return Err(Error::BadRequest(format!(
                "resource {}: handle `{handle}` has {} parts, expected {}",
                self.name,
                parts.len(),
                self.handle_fields.len()
            )));
        }
        let values = self
            .handle_fields
            .iter()
            .zip(parts)
            .map(|(name, part)| (name.to_string(), serde_json::Value::String(part.to_string())))
            .collect();
        self.instantiate(values)
    }
}

/// An immutable, validated resource instance
#[derive(Debug, Clone)]
pub struct Resource {
    class: Arc<ResourceClass>,
    values: BTreeMap<String, Scalar>,
}

impl Resource {
    pub fn class_name(&self) -> &'static str {
        self.class.name
    }

    pub fn get(&self, name: &str) -> Option<&Scalar> {
        self.values.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(Scalar::Text(s)) => Some(s),
            _ => None,
        }
    }

    /// The canonical handle: handle field values joined by `_`
    pub fn handle(&self) -> String {
        self.class
            .handle_fields
            .iter()
            .map(|name| self.values[*name].to_string())
            .collect::<Vec<_>>()
            .join(&HANDLE_SEP.to_string())
    }

    /// The serialized form `<ClassName>$<handle>`
    pub fn encode(&self) -> String {
        format!("{}{}{}", self.class.name, CLASS_SEP, self.handle())
    }
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.class.name == other.class.name && self.values == other.values
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Split a serialized resource into `(class name, handle)`
pub fn split_encoded(encoded: &str) -> Result<(&str, &str)> {
    encoded
        .split_once(CLASS_SEP)
        .ok_or_else(|| Error::BadRequest(format!("resource `{encoded}` is not `<Class>${{handle}}`")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::field::FieldKind;
    use serde_json::json;

    fn series_class() -> Arc<ResourceClass> {
        ResourceClass::new(
            "Series",
            vec![],
            vec![
                FieldDef::required(Field::new("series_id", FieldKind::Text)),
                FieldDef::optional(Field::new("offset", FieldKind::Int), Scalar::Int(0)),
            ],
            vec!["series_id"],
        )
    }

    #[test]
    fn instantiate_validates_required_fields() {
        let cls = series_class();
        let err = cls.instantiate(BTreeMap::new()).unwrap_err();
        assert!(err.to_string().contains("series_id"));
    }

    #[test]
    fn instantiate_rejects_unknown_fields() {
        let cls = series_class();
        let values = BTreeMap::from([
            ("series_id".to_string(), json!("GDP")),
            ("bogus".to_string(), json!(1)),
        ]);
        assert!(cls.instantiate(values).is_err());
    }

    #[test]
    fn optional_fields_take_defaults() {
        let cls = series_class();
        let values = BTreeMap::from([("series_id".to_string(), json!("GDP"))]);
        let resource = cls.instantiate(values).unwrap();
        assert_eq!(resource.get("offset"), Some(&Scalar::Int(0)));
    }

    #[test]
    fn encode_decode_round_trip() {
        let cls = series_class();
        let values = BTreeMap::from([("series_id".to_string(), json!("GDP"))]);
        let resource = cls.instantiate(values).unwrap();
        assert_eq!(resource.encode(), "Series$GDP");
        assert_eq!(cls.decode(&resource.handle()).unwrap(), resource);
    }

    #[test]
    fn multi_field_handles_absorb_trailing_separators() {
        let cls = ResourceClass::new(
            "Contract",
            vec![(
                Field::new("sec_type", FieldKind::Text),
                Scalar::Text("STK".into()),
            )],
            vec![
                FieldDef::required(Field::new("symbol", FieldKind::Text)),
                FieldDef::required(Field::new("exchange", FieldKind::Text)),
            ],
            vec!["symbol", "exchange"],
        );
        let resource = cls.decode("BRK.B_NYSE_ARCA").unwrap();
        assert_eq!(resource.get_str("symbol"), Some("BRK.B"));
        assert_eq!(resource.get_str("exchange"), Some("NYSE_ARCA"));
        assert_eq!(resource.get_str("sec_type"), Some("STK"));
    }

    #[test]
    fn split_encoded_form() {
        assert_eq!(split_encoded("Series$GDP").unwrap(), ("Series", "GDP"));
        assert!(split_encoded("SeriesGDP").is_err());
    }
}
