//! Dynamically typed values used for configuration documents and opaque node
//! parameters. A `Variant` is a bounded tree of nulls, booleans, numbers,
//! strings, arrays and objects with codecs for JSON and XML.

mod json;
mod xml;

use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone, Debug, PartialEq)]
pub enum Variant {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<Variant>),
    Object(BTreeMap<String, Variant>),
}

pub type VariantResult<T> = Result<T, VariantError>;

#[derive(Debug)]
pub enum VariantError {
    Json(String),
    Xml(String),
    /// A value was accessed as a type it does not hold.
    Type(&'static str),
    /// A required object field is absent.
    Missing(String),
}

impl fmt::Display for VariantError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VariantError::Json(msg) => write!(f, "json error: {}", msg),
            VariantError::Xml(msg) => write!(f, "xml error: {}", msg),
            VariantError::Type(expected) => write!(f, "type error: expected {}", expected),
            VariantError::Missing(key) => write!(f, "missing field: {}", key),
        }
    }
}

impl std::error::Error for VariantError {}

impl Variant {
    /// Parse a JSON document.
    pub fn from_json(text: &str) -> VariantResult<Variant> {
        json::parse(text)
    }

    /// Render as compact JSON.
    pub fn to_json(&self) -> String {
        json::render(self)
    }

    /// Parse an XML document in the variant element scheme.
    pub fn from_xml(text: &str) -> VariantResult<Variant> {
        xml::parse(text)
    }

    /// Render as an XML document in the variant element scheme.
    pub fn to_xml(&self) -> String {
        xml::render(self)
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Variant::Null)
    }

    #[inline]
    pub fn as_bool(&self) -> VariantResult<bool> {
        match self {
            Variant::Bool(value) => Ok(*value),
            _ => Err(VariantError::Type("bool")),
        }
    }

    /// Integer access. Floats with an integral value coerce.
    #[inline]
    pub fn as_int(&self) -> VariantResult<i64> {
        match self {
            Variant::Int(value) => Ok(*value),
            Variant::Float(value) if value.fract() == 0.0 => Ok(*value as i64),
            _ => Err(VariantError::Type("int")),
        }
    }

    /// Float access. Integers coerce.
    #[inline]
    pub fn as_float(&self) -> VariantResult<f64> {
        match self {
            Variant::Float(value) => Ok(*value),
            Variant::Int(value) => Ok(*value as f64),
            _ => Err(VariantError::Type("float")),
        }
    }

    #[inline]
    pub fn as_str(&self) -> VariantResult<&str> {
        match self {
            Variant::Str(value) => Ok(value),
            _ => Err(VariantError::Type("string")),
        }
    }

    #[inline]
    pub fn as_array(&self) -> VariantResult<&[Variant]> {
        match self {
            Variant::Array(items) => Ok(items),
            _ => Err(VariantError::Type("array")),
        }
    }

    #[inline]
    pub fn as_object(&self) -> VariantResult<&BTreeMap<String, Variant>> {
        match self {
            Variant::Object(map) => Ok(map),
            _ => Err(VariantError::Type("object")),
        }
    }

    /// Object field lookup; `None` for non-objects and absent keys.
    #[inline]
    pub fn get(&self, key: &str) -> Option<&Variant> {
        match self {
            Variant::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Object field lookup that errors with the key name when absent.
    #[inline]
    pub fn require(&self, key: &str) -> VariantResult<&Variant> {
        self.get(key).ok_or_else(|| VariantError::Missing(key.to_string()))
    }
}

impl From<bool> for Variant {
    fn from(value: bool) -> Variant {
        Variant::Bool(value)
    }
}

impl From<i64> for Variant {
    fn from(value: i64) -> Variant {
        Variant::Int(value)
    }
}

impl From<f64> for Variant {
    fn from(value: f64) -> Variant {
        Variant::Float(value)
    }
}

impl From<&str> for Variant {
    fn from(value: &str) -> Variant {
        Variant::Str(value.to_string())
    }
}

impl From<String> for Variant {
    fn from(value: String) -> Variant {
        Variant::Str(value)
    }
}

impl From<Vec<Variant>> for Variant {
    fn from(items: Vec<Variant>) -> Variant {
        Variant::Array(items)
    }
}

impl From<BTreeMap<String, Variant>> for Variant {
    fn from(map: BTreeMap<String, Variant>) -> Variant {
        Variant::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Variant {
        let mut object = BTreeMap::new();
        object.insert("name".to_string(), Variant::from("producer"));
        object.insert("count".to_string(), Variant::Int(100));
        object.insert("rate".to_string(), Variant::Float(0.5));
        object.insert("live".to_string(), Variant::Bool(true));
        object.insert("tag".to_string(), Variant::Null);
        object.insert(
            "ports".to_string(),
            Variant::Array(vec![Variant::from("in"), Variant::from("out")]),
        );
        Variant::Object(object)
    }

    #[test]
    fn test_accessors() {
        let value = sample();

        assert_eq!(value.require("count").unwrap().as_int().unwrap(), 100);
        assert_eq!(value.require("rate").unwrap().as_float().unwrap(), 0.5);
        assert!(value.require("live").unwrap().as_bool().unwrap());
        assert_eq!(value.require("name").unwrap().as_str().unwrap(), "producer");
        assert!(value.require("tag").unwrap().is_null());
        assert_eq!(value.require("ports").unwrap().as_array().unwrap().len(), 2);
        assert!(value.get("absent").is_none());
    }

    #[test]
    fn test_int_float_coercion() {
        assert_eq!(Variant::Float(3.0).as_int().unwrap(), 3);
        assert!(Variant::Float(3.5).as_int().is_err());
        assert_eq!(Variant::Int(3).as_float().unwrap(), 3.0);
    }

    #[test]
    fn test_type_errors() {
        let err = Variant::Null.as_str().unwrap_err();
        match err {
            VariantError::Type(expected) => assert_eq!(expected, "string"),
            other => panic!("Unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_json_roundtrip() {
        let value = sample();
        let text = value.to_json();
        let parsed = Variant::from_json(&text).unwrap();

        assert_eq!(parsed, value);
    }

    #[test]
    fn test_json_parse_rejects_garbage() {
        assert!(Variant::from_json("{not json").is_err());
    }

    #[test]
    fn test_xml_roundtrip() {
        let value = sample();
        let text = value.to_xml();
        let parsed = Variant::from_xml(&text).unwrap();

        assert_eq!(parsed, value);
    }

    #[test]
    fn test_xml_nested_roundtrip() {
        let mut inner = BTreeMap::new();
        inner.insert("capacity".to_string(), Variant::Int(4096));

        let mut outer = BTreeMap::new();
        outer.insert("queue".to_string(), Variant::Object(inner));
        outer.insert(
            "stages".to_string(),
            Variant::Array(vec![Variant::Int(1), Variant::Array(vec![Variant::Null])]),
        );

        let value = Variant::Object(outer);
        let parsed = Variant::from_xml(&value.to_xml()).unwrap();

        assert_eq!(parsed, value);
    }

    #[test]
    fn test_xml_escaping() {
        let value = Variant::from("a < b & \"c\"");
        let parsed = Variant::from_xml(&value.to_xml()).unwrap();

        assert_eq!(parsed, value);
    }
}
