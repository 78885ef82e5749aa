//! Attribute values of resource definitions.
//!
//! Values are JSON-like literals, references to another resource's output
//! (`{"$ref": "type.name.attribute"}`), or a computed placeholder
//! (`{"$computed": true}`) for values only known after apply.

use serde::de::{self, Deserializer, MapAccess, SeqAccess, Unexpected, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::fmt;

use super::address::Reference;

/// Key marking a reference object.
const REF_KEY: &str = "$ref";

/// Key marking a computed placeholder object.
const COMPUTED_KEY: &str = "$computed";

/// Ordered mapping of attribute name to value.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(into = "Value")]
pub enum AttributeValue {
    /// Explicit null.
    Null,
    /// Boolean literal.
    Bool(bool),
    /// Integer literal.
    Integer(i64),
    /// Floating point literal.
    Float(f64),
    /// String literal.
    String(String),
    /// Ordered list of values.
    List(Vec<AttributeValue>),
    /// Nested map of values.
    Map(BTreeMap<String, AttributeValue>),
    /// Reference to another resource's output attribute.
    Reference(Reference),
    /// Value only known once the referenced resource has been applied.
    Computed,
}

impl AttributeValue {
    /// Creates a string value.
    #[must_use]
    pub fn string(value: impl Into<String>) -> Self {
        Self::String(value.into())
    }

    /// Collects every reference contained in this value, depth first.
    pub fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Reference(reference) => out.push(reference),
            Self::List(items) => items.iter().for_each(|item| item.collect_references(out)),
            Self::Map(entries) => entries
                .values()
                .for_each(|item| item.collect_references(out)),
            _ => {}
        }
    }

    /// Returns true if the value contains neither references nor computed parts.
    #[must_use]
    pub fn is_known(&self) -> bool {
        match self {
            Self::Reference(_) | Self::Computed => false,
            Self::List(items) => items.iter().all(Self::is_known),
            Self::Map(entries) => entries.values().all(Self::is_known),
            _ => true,
        }
    }

    /// Returns a copy with every reference replaced by `lookup`'s answer.
    ///
    /// # Errors
    ///
    /// Propagates the first error returned by `lookup`.
    pub fn resolve<E, F>(&self, lookup: &mut F) -> Result<Self, E>
    where
        F: FnMut(&Reference) -> Result<Self, E>,
    {
        Ok(match self {
            Self::Reference(reference) => lookup(reference)?,
            Self::List(items) => Self::List(
                items
                    .iter()
                    .map(|item| item.resolve(lookup))
                    .collect::<Result<_, E>>()?,
            ),
            Self::Map(entries) => Self::Map(
                entries
                    .iter()
                    .map(|(key, item)| item.resolve(lookup).map(|v| (key.clone(), v)))
                    .collect::<Result<_, E>>()?,
            ),
            other => other.clone(),
        })
    }
}

/// Resolves every reference in an attribute map.
///
/// # Errors
///
/// Propagates the first error returned by `lookup`.
pub fn resolve_attributes<E, F>(attributes: &Attributes, mut lookup: F) -> Result<Attributes, E>
where
    F: FnMut(&Reference) -> Result<AttributeValue, E>,
{
    attributes
        .iter()
        .map(|(key, value)| value.resolve(&mut lookup).map(|v| (key.clone(), v)))
        .collect()
}

impl<'de> Deserialize<'de> for AttributeValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(AttributeValueVisitor)
    }
}

struct AttributeValueVisitor;

impl<'de> Visitor<'de> for AttributeValueVisitor {
    type Value = AttributeValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a literal, a list, a map, a {\"$ref\"} or a {\"$computed\"} object")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(AttributeValue::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(AttributeValue::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        AttributeValue::deserialize(deserializer)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
        Ok(AttributeValue::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        Ok(AttributeValue::Integer(v))
    }

    #[allow(clippy::cast_precision_loss)]
    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(i64::try_from(v).map_or(AttributeValue::Float(v as f64), AttributeValue::Integer))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
        if v.is_finite() {
            Ok(AttributeValue::Float(v))
        } else {
            Err(E::invalid_value(Unexpected::Float(v), &"a finite number"))
        }
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        Ok(AttributeValue::String(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
        Ok(AttributeValue::String(v))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(AttributeValue::List(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut entries = BTreeMap::new();
        while let Some((key, value)) = map.next_entry::<String, AttributeValue>()? {
            entries.insert(key, value);
        }

        if entries.len() == 1 {
            if let Some(AttributeValue::String(target)) = entries.get(REF_KEY) {
                return Reference::parse(target)
                    .map(AttributeValue::Reference)
                    .map_err(de::Error::custom);
            }
            if entries.get(COMPUTED_KEY) == Some(&AttributeValue::Bool(true)) {
                return Ok(AttributeValue::Computed);
            }
        }
        Ok(AttributeValue::Map(entries))
    }
}

impl From<AttributeValue> for Value {
    fn from(value: AttributeValue) -> Self {
        match value {
            AttributeValue::Null => Self::Null,
            AttributeValue::Bool(b) => Self::Bool(b),
            AttributeValue::Integer(i) => Self::Number(i.into()),
            AttributeValue::Float(f) => Number::from_f64(f).map_or(Self::Null, Self::Number),
            AttributeValue::String(s) => Self::String(s),
            AttributeValue::List(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            AttributeValue::Map(entries) => Self::Object(
                entries
                    .into_iter()
                    .map(|(key, item)| (key, Self::from(item)))
                    .collect(),
            ),
            AttributeValue::Reference(reference) => {
                let mut map = Map::new();
                map.insert(REF_KEY.to_string(), Self::String(reference.to_string()));
                Self::Object(map)
            }
            AttributeValue::Computed => {
                let mut map = Map::new();
                map.insert(COMPUTED_KEY.to_string(), Self::Bool(true));
                Self::Object(map)
            }
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<Reference> for AttributeValue {
    fn from(reference: Reference) -> Self {
        Self::Reference(reference)
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Computed => write!(f, "(known after apply)"),
            Self::Reference(reference) => write!(f, "{reference}"),
            other => write!(f, "{}", Value::from(other.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Address;

    #[test]
    fn test_parse_reference_object() {
        let value: AttributeValue =
            serde_json::from_str(r#"{"$ref": "network.main.id"}"#).expect("parse");
        assert_eq!(
            value,
            AttributeValue::Reference(Address::new("network", "main").attr("id"))
        );
    }

    #[test]
    fn test_map_with_extra_keys_is_not_a_reference() {
        let value: AttributeValue =
            serde_json::from_str(r#"{"$ref": "network.main.id", "other": 1}"#).expect("parse");
        assert!(matches!(value, AttributeValue::Map(_)));
    }

    #[test]
    fn test_nested_references_are_collected() {
        let yaml = r"
- 1
- nested:
    vnet: { $ref: network.main.id }
- { $ref: vault.main.uri }
";
        let value: AttributeValue = serde_yaml::from_str(yaml).expect("parse");
        let mut refs = Vec::new();
        value.collect_references(&mut refs);
        let rendered: Vec<String> = refs.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["network.main.id", "vault.main.uri"]);
        assert!(!value.is_known());
    }

    #[test]
    fn test_resolve_substitutes_references() {
        let value = AttributeValue::List(vec![
            AttributeValue::Reference(Address::new("network", "main").attr("id")),
            AttributeValue::Integer(3),
        ]);
        let resolved = value
            .resolve(&mut |_: &Reference| Ok::<_, ()>(AttributeValue::string("vnet-1")))
            .expect("resolve");
        assert_eq!(
            resolved,
            AttributeValue::List(vec![
                AttributeValue::string("vnet-1"),
                AttributeValue::Integer(3)
            ])
        );
        assert!(resolved.is_known());
    }

    #[test]
    fn test_computed_display_and_json() {
        assert_eq!(AttributeValue::Computed.to_string(), "(known after apply)");
        let json = serde_json::to_string(&AttributeValue::Computed).expect("serialize");
        assert_eq!(json, r#"{"$computed":true}"#);
        assert_eq!(AttributeValue::string("10.0.0.0/16").to_string(), "\"10.0.0.0/16\"");
    }

    #[test]
    fn test_non_finite_floats_are_rejected() {
        for literal in [".nan", ".inf", "-.inf"] {
            let err = serde_yaml::from_str::<AttributeValue>(&format!("[1.5, {literal}]"))
                .expect_err("non-finite");
            assert!(err.to_string().contains("a finite number"), "{literal}: {err}");
        }

        let value: AttributeValue = serde_yaml::from_str("2.5").expect("finite");
        assert_eq!(value, AttributeValue::Float(2.5));
        let json = serde_json::to_string(&value).expect("serialize");
        assert_eq!(serde_json::from_str::<AttributeValue>(&json).expect("reparse"), value);
    }

    #[test]
    fn test_integers_beyond_i64_become_floats() {
        let value: AttributeValue = serde_json::from_str("18446744073709551615").expect("parse");
        assert!(matches!(value, AttributeValue::Float(_)));
        let value: AttributeValue = serde_yaml::from_str("42").expect("parse");
        assert_eq!(value, AttributeValue::Integer(42));
    }
}
