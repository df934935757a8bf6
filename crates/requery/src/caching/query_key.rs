use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

/// A normalized parameter map. The B-tree keeps parameter keys in
/// lexicographic order, so two logically equal maps always encode to the
/// same key regardless of insertion order.
pub type Params = BTreeMap<String, ParamValue>;

/// An error constructing or parsing a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// The endpoint was empty.
    #[error("endpoint must be a non-empty string")]
    EmptyEndpoint,
    /// The parameter map could not be encoded.
    #[error("params could not be encoded: {0}")]
    Params(String),
    /// The string is not a valid serialized key.
    #[error("malformed query key: {0}")]
    Malformed(String),
}

/// A single parameter value.
///
/// Maps are B-tree backed, which makes nested objects order-independent as
/// well. Date values serialize as ISO-8601 strings with millisecond
/// precision and an explicit zone, and [`QueryKey::parse`] revives exactly
/// that shape back into [`ParamValue::DateTime`].
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    DateTime(DateTime<FixedOffset>),
    List(Vec<ParamValue>),
    Map(BTreeMap<String, ParamValue>),
}

impl Serialize for ParamValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ParamValue::Null => serializer.serialize_unit(),
            ParamValue::Bool(value) => serializer.serialize_bool(*value),
            ParamValue::Number(value) => value.serialize(serializer),
            ParamValue::String(value) => serializer.serialize_str(value),
            ParamValue::DateTime(value) => {
                serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            ParamValue::List(values) => {
                let mut seq = serializer.serialize_seq(Some(values.len()))?;
                for value in values {
                    seq.serialize_element(value)?;
                }
                seq.end()
            }
            ParamValue::Map(map) => {
                let mut entries = serializer.serialize_map(Some(map.len()))?;
                for (key, value) in map {
                    entries.serialize_entry(key, value)?;
                }
                entries.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for ParamValue {
    fn deserialize<D: de::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ParamVisitor;

        impl<'de> Visitor<'de> for ParamVisitor {
            type Value = ParamValue;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a query parameter value")
            }

            fn visit_bool<E: de::Error>(self, value: bool) -> Result<Self::Value, E> {
                Ok(ParamValue::Bool(value))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
                Ok(ParamValue::Number(value.into()))
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
                Ok(ParamValue::Number(value.into()))
            }

            fn visit_f64<E: de::Error>(self, value: f64) -> Result<Self::Value, E> {
                serde_json::Number::from_f64(value)
                    .map(ParamValue::Number)
                    .ok_or_else(|| de::Error::custom("non-finite number"))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                Ok(match revive_datetime(value) {
                    Some(datetime) => ParamValue::DateTime(datetime),
                    None => ParamValue::String(value.to_owned()),
                })
            }

            fn visit_string<E: de::Error>(self, value: String) -> Result<Self::Value, E> {
                self.visit_str(&value)
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(ParamValue::Null)
            }

            fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(ParamValue::Null)
            }

            fn visit_some<D: de::Deserializer<'de>>(
                self,
                deserializer: D,
            ) -> Result<Self::Value, D::Error> {
                Deserialize::deserialize(deserializer)
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut values = Vec::new();
                while let Some(value) = seq.next_element()? {
                    values.push(value);
                }
                Ok(ParamValue::List(values))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = BTreeMap::new();
                while let Some((key, value)) = map.next_entry::<String, ParamValue>()? {
                    entries.insert(key, value);
                }
                Ok(ParamValue::Map(entries))
            }
        }

        deserializer.deserialize_any(ParamVisitor)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::String(value.to_owned())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::String(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Number(value.into())
    }
}

impl From<u64> for ParamValue {
    fn from(value: u64) -> Self {
        ParamValue::Number(value.into())
    }
}

impl From<DateTime<FixedOffset>> for ParamValue {
    fn from(value: DateTime<FixedOffset>) -> Self {
        ParamValue::DateTime(value)
    }
}

impl From<DateTime<Utc>> for ParamValue {
    fn from(value: DateTime<Utc>) -> Self {
        ParamValue::DateTime(value.fixed_offset())
    }
}

/// Revives a string of exactly the shape `YYYY-MM-DDTHH:mm:ss[.sss]Z|±HH:mm`.
///
/// The shape check runs before the actual parse so that plain `YYYY-MM-DD`
/// strings, or timestamps with other fraction widths, are left alone.
fn revive_datetime(value: &str) -> Option<DateTime<FixedOffset>> {
    if !value.is_ascii() {
        return None;
    }
    let bytes = value.as_bytes();
    if bytes.len() < 20 || bytes[10] != b'T' {
        return None;
    }
    let tail = &value[19..];
    let zone = match tail.strip_prefix('.') {
        Some(fraction) => {
            let digits = fraction.get(..3)?;
            if !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            &fraction[3..]
        }
        None => tail,
    };
    let zone_ok = zone == "Z"
        || (zone.len() == 6
            && (zone.starts_with('+') || zone.starts_with('-'))
            && zone.as_bytes()[3] == b':');
    if !zone_ok {
        return None;
    }
    DateTime::parse_from_rfc3339(value).ok()
}

/// The endpoint and parameters recovered from a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParsedQuery {
    pub endpoint: String,
    pub params: Params,
}

#[derive(Serialize)]
struct KeyRepr<'a> {
    endpoint: &'a str,
    params: &'a Params,
}

/// A canonical, comparable identifier for one (endpoint, params) request.
///
/// Two [`QueryKey::build`] calls with the same logical content always yield
/// an identical string; the key doubles as the serialized form of the
/// request, so [`QueryKey::parse`] recovers the endpoint and parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(Arc<str>);

impl QueryKey {
    /// Builds the canonical key for `endpoint` and `params`.
    pub fn build(endpoint: &str, params: &Params) -> Result<Self, KeyError> {
        if endpoint.is_empty() {
            return Err(KeyError::EmptyEndpoint);
        }
        let repr = KeyRepr { endpoint, params };
        let encoded =
            serde_json::to_string(&repr).map_err(|err| KeyError::Params(err.to_string()))?;
        Ok(QueryKey(encoded.into()))
    }

    /// Recovers the endpoint and parameter map, reviving date values.
    pub fn parse(&self) -> Result<ParsedQuery, KeyError> {
        serde_json::from_str(&self.0).map_err(|err| KeyError::Malformed(err.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn params(entries: &[(&str, ParamValue)]) -> Params {
        entries
            .iter()
            .map(|(key, value)| ((*key).to_owned(), value.clone()))
            .collect()
    }

    #[test]
    fn keys_are_order_independent() {
        let mut first = Params::new();
        first.insert("name".into(), "ada".into());
        first.insert("limit".into(), ParamValue::from(25_i64));

        let mut second = Params::new();
        second.insert("limit".into(), ParamValue::from(25_i64));
        second.insert("name".into(), "ada".into());

        let a = QueryKey::build("/users/search", &first).unwrap();
        let b = QueryKey::build("/users/search", &second).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn canonical_encoding_is_stable() {
        let params = params(&[
            ("limit", ParamValue::from(25_i64)),
            ("name", "ada".into()),
        ]);
        let key = QueryKey::build("/users/search", &params).unwrap();
        insta::assert_snapshot!(
            key.as_str(),
            @r#"{"endpoint":"/users/search","params":{"limit":25,"name":"ada"}}"#
        );
    }

    #[test]
    fn empty_endpoint_is_rejected() {
        assert_eq!(
            QueryKey::build("", &Params::new()),
            Err(KeyError::EmptyEndpoint)
        );
    }

    #[test]
    fn round_trip_revives_dates() {
        let when = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 45).unwrap();
        let params = params(&[
            ("since", ParamValue::from(when)),
            ("tag", "release".into()),
            (
                "filters",
                ParamValue::Map(
                    [("active".to_owned(), ParamValue::Bool(true))]
                        .into_iter()
                        .collect(),
                ),
            ),
        ]);

        let key = QueryKey::build("/deploys", &params).unwrap();
        let parsed = key.parse().unwrap();
        assert_eq!(parsed.endpoint, "/deploys");
        assert_eq!(parsed.params, params);
    }

    #[test]
    fn plain_dates_are_not_revived() {
        let params = params(&[("day", "2024-03-01".into())]);
        let key = QueryKey::build("/report", &params).unwrap();
        let parsed = key.parse().unwrap();
        assert_eq!(
            parsed.params.get("day"),
            Some(&ParamValue::String("2024-03-01".into()))
        );
    }

    #[test]
    fn offset_zones_are_revived() {
        let params = params(&[("at", "2024-03-01T10:00:00.250+02:00".into())]);
        let key = QueryKey::build("/report", &params).unwrap();
        let parsed = key.parse().unwrap();
        match parsed.params.get("at") {
            Some(ParamValue::DateTime(dt)) => {
                assert_eq!(dt.to_rfc3339_opts(SecondsFormat::Millis, true), "2024-03-01T10:00:00.250+02:00");
            }
            other => panic!("expected a revived datetime, got {other:?}"),
        }
    }

    #[test]
    fn odd_fraction_widths_are_left_alone() {
        for raw in [
            "2024-03-01T10:00:00.2Z",
            "2024-03-01T10:00:00.12345Z",
            "2024-03-01T10:00:00",
            "2024-03-01T10:00:00.250",
        ] {
            assert!(revive_datetime(raw).is_none(), "revived {raw}");
        }
        assert!(revive_datetime("2024-03-01T10:00:00Z").is_some());
        assert!(revive_datetime("2024-03-01T10:00:00.250Z").is_some());
    }

    #[test]
    fn malformed_keys_fail_to_parse() {
        for raw in ["", "not json", r#"{"endpoint":"/x"}"#, r#"{"params":{}}"#] {
            let key = QueryKey(Arc::from(raw));
            assert!(matches!(key.parse(), Err(KeyError::Malformed(_))), "parsed {raw:?}");
        }
    }
}
