//! JSON codec mapping `Variant` onto `serde_json::Value`.

use super::{Variant, VariantError, VariantResult};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

pub fn parse(text: &str) -> VariantResult<Variant> {
    let value: Value =
        serde_json::from_str(text).map_err(|err| VariantError::Json(err.to_string()))?;

    Ok(from_value(value))
}

pub fn render(variant: &Variant) -> String {
    serde_json::to_string(&to_value(variant)).expect("Variant always renders as JSON")
}

fn from_value(value: Value) -> Variant {
    match value {
        Value::Null => Variant::Null,
        Value::Bool(value) => Variant::Bool(value),
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                Variant::Int(int)
            } else {
                // Out-of-range integers degrade to floats along with all
                // fractional values.
                Variant::Float(number.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(value) => Variant::Str(value),
        Value::Array(items) => Variant::Array(items.into_iter().map(from_value).collect()),
        Value::Object(map) => {
            let mut object = BTreeMap::new();
            for (key, value) in map {
                object.insert(key, from_value(value));
            }
            Variant::Object(object)
        }
    }
}

fn to_value(variant: &Variant) -> Value {
    match variant {
        Variant::Null => Value::Null,
        Variant::Bool(value) => Value::Bool(*value),
        Variant::Int(value) => Value::Number(Number::from(*value)),
        Variant::Float(value) => match Number::from_f64(*value) {
            Some(number) => Value::Number(number),
            None => Value::Null,
        },
        Variant::Str(value) => Value::String(value.clone()),
        Variant::Array(items) => Value::Array(items.iter().map(to_value).collect()),
        Variant::Object(object) => {
            let mut map = Map::new();
            for (key, value) in object {
                map.insert(key.clone(), to_value(value));
            }
            Value::Object(map)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scalars() {
        assert_eq!(parse("null").unwrap(), Variant::Null);
        assert_eq!(parse("true").unwrap(), Variant::Bool(true));
        assert_eq!(parse("42").unwrap(), Variant::Int(42));
        assert_eq!(parse("4.25").unwrap(), Variant::Float(4.25));
        assert_eq!(parse("\"queue\"").unwrap(), Variant::Str("queue".to_string()));
    }

    #[test]
    fn test_parse_nested() {
        let value = parse(r#"{"nodes": [{"name": "a"}, {"name": "b"}]}"#).unwrap();
        let nodes = value.require("nodes").unwrap().as_array().unwrap();

        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[1].require("name").unwrap().as_str().unwrap(), "b");
    }

    #[test]
    fn test_nan_degrades_to_null() {
        assert_eq!(render(&Variant::Float(f64::NAN)), "null");
    }
}
