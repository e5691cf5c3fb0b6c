//! String-only property headers.
//!
//! Brokers carry properties as a flat `string -> string` map. Typed property
//! structs are encoded field by field: strings travel raw, absent optionals
//! are omitted, and every other value is carried as JSON text. Decoding runs
//! a serde deserializer over the map that parses each value into whatever
//! type the target field asks for, so `decode(encode(v)) == v`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::de::value::{Error as ValueError, MapDeserializer, StrDeserializer};
use serde::de::{self, DeserializeOwned, IntoDeserializer, Visitor};
use serde::{Deserializer, Serialize, forward_to_deserialize_any};
use serde_json::Value;
use thiserror::Error;

/// Normalized property headers of a message.
pub type PropertyMap = BTreeMap<String, String>;

/// Property headers as a broker client hands them back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawProperties {
    /// Ordered key/value pairs; later duplicates win.
    Pairs(Vec<(String, String)>),
    Map(HashMap<String, String>),
}

impl Default for RawProperties {
    fn default() -> Self {
        RawProperties::Pairs(Vec::new())
    }
}

impl From<PropertyMap> for RawProperties {
    fn from(map: PropertyMap) -> Self {
        RawProperties::Pairs(map.into_iter().collect())
    }
}

/// Collapses either broker representation into a [`PropertyMap`].
pub fn normalize_properties(raw: RawProperties) -> PropertyMap {
    match raw {
        RawProperties::Pairs(pairs) => pairs.into_iter().collect(),
        RawProperties::Map(map) => map.into_iter().collect(),
    }
}

#[derive(Error, Debug)]
pub enum PropertyCodecError {
    #[error("properties must serialize to an object, got {0}")]
    NotAnObject(&'static str),
    #[error("failed to encode properties: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to decode properties: {0}")]
    Decode(#[from] ValueError),
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Encodes a typed property struct into string headers.
pub fn encode_properties<P: Serialize>(
    properties: &P,
) -> Result<PropertyMap, PropertyCodecError> {
    match serde_json::to_value(properties)? {
        Value::Object(fields) => Ok(fields
            .into_iter()
            .filter_map(|(key, value)| match value {
                Value::Null => None,
                Value::String(text) => Some((key, text)),
                other => Some((key, other.to_string())),
            })
            .collect()),
        // Unit-like property types carry no headers.
        Value::Null => Ok(PropertyMap::new()),
        other => Err(PropertyCodecError::NotAnObject(kind_of(&other))),
    }
}

/// Decodes string headers into a typed property struct.
pub fn decode_properties<P: DeserializeOwned>(
    properties: &PropertyMap,
) -> Result<P, PropertyCodecError> {
    Ok(P::deserialize(PropertiesDeserializer { map: properties })?)
}

struct PropertiesDeserializer<'a> {
    map: &'a PropertyMap,
}

impl<'de> Deserializer<'de> for PropertiesDeserializer<'_> {
    type Error = ValueError;

    fn deserialize_any<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        let entries = self
            .map
            .iter()
            .map(|(key, value)| (key.as_str(), PropertyValue(value.as_str())));
        visitor.visit_map(MapDeserializer::new(entries))
    }

    fn deserialize_unit<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        visitor.visit_unit()
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        visitor.visit_unit()
    }

    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf option newtype_struct seq tuple tuple_struct map
        struct enum identifier ignored_any
    }
}

/// A single header value, parsed lazily into the requested type.
#[derive(Clone, Copy)]
struct PropertyValue<'a>(&'a str);

impl fmt::Debug for PropertyValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PropertyValue").field(&self.0).finish()
    }
}

impl<'de> IntoDeserializer<'de, ValueError> for PropertyValue<'_> {
    type Deserializer = Self;

    fn into_deserializer(self) -> Self::Deserializer {
        self
    }
}

impl PropertyValue<'_> {
    fn parse<T: std::str::FromStr>(&self, expected: &str) -> Result<T, ValueError> {
        self.0.parse::<T>().map_err(|_| {
            de::Error::invalid_value(de::Unexpected::Str(self.0), &expected)
        })
    }

    fn json(&self) -> Result<Value, ValueError> {
        serde_json::from_str(self.0).map_err(de::Error::custom)
    }
}

macro_rules! parse_scalar {
    ($($method:ident => $visit:ident: $ty:ty),* $(,)?) => {
        $(
            fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
                visitor.$visit(self.parse::<$ty>(stringify!($ty))?)
            }
        )*
    };
}

impl<'de> Deserializer<'de> for PropertyValue<'_> {
    type Error = ValueError;

    /// Untyped targets see structured JSON where the text parses as a
    /// non-string JSON value, and the raw string otherwise.
    fn deserialize_any<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        match serde_json::from_str::<Value>(self.0) {
            Ok(Value::String(_)) | Err(_) => visitor.visit_str(self.0),
            Ok(value) => value.deserialize_any(visitor).map_err(de::Error::custom),
        }
    }

    parse_scalar! {
        deserialize_bool => visit_bool: bool,
        deserialize_i8 => visit_i8: i8,
        deserialize_i16 => visit_i16: i16,
        deserialize_i32 => visit_i32: i32,
        deserialize_i64 => visit_i64: i64,
        deserialize_i128 => visit_i128: i128,
        deserialize_u8 => visit_u8: u8,
        deserialize_u16 => visit_u16: u16,
        deserialize_u32 => visit_u32: u32,
        deserialize_u64 => visit_u64: u64,
        deserialize_u128 => visit_u128: u128,
        deserialize_f32 => visit_f32: f32,
        deserialize_f64 => visit_f64: f64,
        deserialize_char => visit_char: char,
    }

    fn deserialize_str<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        visitor.visit_str(self.0)
    }

    fn deserialize_string<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        visitor.visit_str(self.0)
    }

    fn deserialize_identifier<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        visitor.visit_str(self.0)
    }

    fn deserialize_bytes<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        visitor.visit_bytes(self.0.as_bytes())
    }

    fn deserialize_byte_buf<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        visitor.visit_bytes(self.0.as_bytes())
    }

    // A header that is present is always `Some`; absence is handled by the
    // map simply not yielding the key.
    fn deserialize_option<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        visitor.visit_some(self)
    }

    fn deserialize_unit<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        match self.0 {
            "" | "null" => visitor.visit_unit(),
            other => Err(de::Error::invalid_value(
                de::Unexpected::Str(other),
                &"an empty or null header",
            )),
        }
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        self.deserialize_unit(visitor)
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        self.json()?.deserialize_seq(visitor).map_err(de::Error::custom)
    }

    fn deserialize_tuple<V: Visitor<'de>>(
        self,
        len: usize,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        self.json()?
            .deserialize_tuple(len, visitor)
            .map_err(de::Error::custom)
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        len: usize,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        self.json()?
            .deserialize_tuple_struct(name, len, visitor)
            .map_err(de::Error::custom)
    }

    fn deserialize_map<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        self.json()?.deserialize_map(visitor).map_err(de::Error::custom)
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        self.json()?
            .deserialize_struct(name, fields, visitor)
            .map_err(de::Error::custom)
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        if self.0.trim_start().starts_with('{') {
            return self
                .json()?
                .deserialize_enum(name, variants, visitor)
                .map_err(de::Error::custom);
        }
        let unit: StrDeserializer<'_, ValueError> = self.0.into_deserializer();
        unit.deserialize_enum(name, variants, visitor)
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        visitor.visit_unit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
    enum Priority {
        Low,
        High,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Headers {
        #[serde(rename = "x-workflow-id")]
        workflow_id: String,
        attempt: u32,
        urgent: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
        priority: Priority,
        tags: Vec<String>,
        ratio: f64,
    }

    fn sample() -> Headers {
        Headers {
            workflow_id: "wf_1".into(),
            attempt: 3,
            urgent: true,
            note: None,
            priority: Priority::High,
            tags: vec!["a".into(), "b".into()],
            ratio: 0.25,
        }
    }

    #[test]
    fn encodes_strings_raw_and_everything_else_as_json() {
        let map = encode_properties(&sample()).unwrap();
        assert_eq!(map["x-workflow-id"], "wf_1");
        assert_eq!(map["attempt"], "3");
        assert_eq!(map["urgent"], "true");
        assert_eq!(map["priority"], "HIGH");
        assert_eq!(map["tags"], r#"["a","b"]"#);
        assert!(!map.contains_key("note"));
    }

    #[test]
    fn numeric_looking_strings_stay_strings() {
        let mut headers = sample();
        headers.workflow_id = "12345".into();
        headers.note = Some("true".into());
        let decoded: Headers =
            decode_properties(&encode_properties(&headers).unwrap()).unwrap();
        assert_eq!(decoded, headers);
    }

    #[test]
    fn missing_required_header_is_rejected() {
        let mut map = encode_properties(&sample()).unwrap();
        map.remove("attempt");
        let err = decode_properties::<Headers>(&map).unwrap_err();
        assert!(err.to_string().contains("attempt"));
    }

    #[test]
    fn malformed_number_is_rejected() {
        let mut map = encode_properties(&sample()).unwrap();
        map.insert("attempt".into(), "three".into());
        assert!(decode_properties::<Headers>(&map).is_err());
    }

    #[test]
    fn non_object_properties_cannot_be_encoded() {
        assert!(matches!(
            encode_properties(&vec![1, 2]),
            Err(PropertyCodecError::NotAnObject("array"))
        ));
        assert!(encode_properties(&()).unwrap().is_empty());
    }

    #[test]
    fn normalizes_both_broker_shapes() {
        let pairs = RawProperties::Pairs(vec![
            ("a".into(), "1".into()),
            ("b".into(), "2".into()),
            ("a".into(), "3".into()),
        ]);
        let map = normalize_properties(pairs);
        assert_eq!(map.get("a").map(String::as_str), Some("3"));
        assert_eq!(map.len(), 2);

        let hashed = RawProperties::Map(HashMap::from([(
            "k".to_string(),
            "v".to_string(),
        )]));
        assert_eq!(normalize_properties(hashed)["k"], "v");
    }

    proptest! {
        #[test]
        fn property_values_round_trip(
            workflow_id in ".*",
            attempt in any::<u32>(),
            urgent in any::<bool>(),
            note in proptest::option::of(".*"),
            high in any::<bool>(),
            tags in proptest::collection::vec(".*", 0..4),
            ratio in -1.0e6f64..1.0e6f64,
        ) {
            let headers = Headers {
                workflow_id,
                attempt,
                urgent,
                note,
                priority: if high { Priority::High } else { Priority::Low },
                tags,
                ratio,
            };
            let decoded: Headers =
                decode_properties(&encode_properties(&headers).unwrap()).unwrap();
            prop_assert_eq!(decoded, headers);
        }
    }
}
