//! JSON encoding of [Document]s.
//!
//! Types without a native JSON form are wrapped in single-key tagged objects
//! (`$oid`, `$date`, `$binary`, `$numberLong`, `$numberDouble`). The encoding
//! is deterministic, so two equal values always encode to equal JSON, which
//! is what JSONB containment queries rely on.
//!
//! Document keys that start with `$` are written with one extra leading `$`,
//! so a user document can never be mistaken for a tagged value.

use std::borrow::Cow;

use chrono::{DateTime, SecondsFormat, Utc};
use data_encoding::BASE64;
use serde_json::{Map, Number};
use uuid::Uuid;

use super::{Document, Value};

#[derive(Debug, thiserror::Error)]
#[error("invalid document json: {0}")]
pub struct JsonDecodeError(String);

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int32(v) => serde_json::Value::Number(v.into()),
            Value::Int64(v) => tagged("$numberLong", v.to_string()),
            Value::Double(v) => match Number::from_f64(v) {
                Some(n) => serde_json::Value::Number(n),
                None => tagged("$numberDouble", v.to_string()),
            },
            Value::String(s) => serde_json::Value::String(s),
            Value::Id(id) => tagged("$oid", id.to_string()),
            Value::DateTime(ts) => {
                tagged("$date", ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            Value::Binary(data) => tagged("$binary", BASE64.encode(&data)),
            Value::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            Value::Document(doc) => doc.into(),
        }
    }
}

impl From<Document> for serde_json::Value {
    fn from(doc: Document) -> Self {
        let map: Map<String, serde_json::Value> =
            doc.into_iter().map(|(k, v)| (encode_key(&k).into_owned(), v.into())).collect();
        serde_json::Value::Object(map)
    }
}

impl TryFrom<serde_json::Value> for Value {
    type Error = JsonDecodeError;

    fn try_from(json: serde_json::Value) -> Result<Self, Self::Error> {
        Ok(match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(v) = n.as_i64() {
                    match i32::try_from(v) {
                        Ok(small) => Value::Int32(small),
                        Err(_) => Value::Int64(v),
                    }
                } else if let Some(v) = n.as_f64() {
                    Value::Double(v)
                } else {
                    return Err(JsonDecodeError(format!("unrepresentable number {}", n)));
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(Value::try_from)
                    .collect::<Result<_, _>>()?,
            ),
            serde_json::Value::Object(map) => {
                if map.len() == 1 {
                    if let Some((tag, serde_json::Value::String(inner))) = map.iter().next() {
                        if let Some(value) = untag(tag, inner)? {
                            return Ok(value);
                        }
                    }
                }
                Value::Document(Document::try_from(serde_json::Value::Object(map))?)
            }
        })
    }
}

impl TryFrom<serde_json::Value> for Document {
    type Error = JsonDecodeError;

    fn try_from(json: serde_json::Value) -> Result<Self, Self::Error> {
        match json {
            serde_json::Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| Ok::<_, JsonDecodeError>((decode_key(k), Value::try_from(v)?)))
                .collect(),
            other => Err(JsonDecodeError(format!("expected an object, got {}", other))),
        }
    }
}

/// The stored form of a document key.
pub(crate) fn encode_key(key: &str) -> Cow<'_, str> {
    if key.starts_with('$') {
        Cow::Owned(format!("${}", key))
    } else {
        Cow::Borrowed(key)
    }
}

fn decode_key(key: String) -> String {
    match key.strip_prefix("$$") {
        Some(rest) => format!("${}", rest),
        None => key,
    }
}

fn tagged(tag: &str, inner: String) -> serde_json::Value {
    let mut map = Map::new();
    map.insert(tag.to_string(), serde_json::Value::String(inner));
    serde_json::Value::Object(map)
}

fn untag(tag: &str, inner: &str) -> Result<Option<Value>, JsonDecodeError> {
    let value = match tag {
        "$oid" => Value::Id(
            Uuid::parse_str(inner).map_err(|e| JsonDecodeError(format!("$oid: {}", e)))?,
        ),
        "$date" => Value::DateTime(
            DateTime::parse_from_rfc3339(inner)
                .map_err(|e| JsonDecodeError(format!("$date: {}", e)))?
                .with_timezone(&Utc),
        ),
        "$binary" => Value::Binary(
            BASE64
                .decode(inner.as_bytes())
                .map_err(|e| JsonDecodeError(format!("$binary: {}", e)))?
                .into(),
        ),
        "$numberLong" => Value::Int64(
            inner
                .parse()
                .map_err(|e| JsonDecodeError(format!("$numberLong: {}", e)))?,
        ),
        "$numberDouble" => Value::Double(
            inner
                .parse()
                .map_err(|e| JsonDecodeError(format!("$numberDouble: {}", e)))?,
        ),
        _ => return Ok(None),
    };
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::TimeZone;
    use rstest::rstest;

    #[test]
    fn tagged_types_survive_json() {
        let doc = Document::new()
            .with("_id", Uuid::new_v4())
            .with("length", 600_000i64)
            .with("chunkSize", 255_000i32)
            .with(
                "uploadDate",
                Utc.with_ymd_and_hms(2024, 3, 22, 10, 0, 0).unwrap(),
            )
            .with("data", Bytes::from_static(&[0, 1, 2, 255]))
            .with("aliases", vec!["x", "y"])
            .with("metadata", Document::new().with("owner", "bob"));

        let json: serde_json::Value = doc.clone().into();
        assert_eq!(json["length"], serde_json::json!({"$numberLong": "600000"}));
        assert_eq!(json["chunkSize"], serde_json::json!(255000));

        let back = Document::try_from(json).expect("must decode");
        assert_eq!(doc, back);
    }

    #[test]
    fn plain_objects_with_unknown_tags_stay_documents() {
        let json = serde_json::json!({"meta": {"$unknown": "v"}});
        let doc = Document::try_from(json).expect("must decode");
        assert_eq!(
            doc.get_document("meta").and_then(|m| m.get_str("$unknown")),
            Some("v")
        );
    }

    #[rstest]
    #[case("$numberLong", "5")]
    #[case("$date", "yesterday")]
    #[case("$oid", "not-a-uuid")]
    #[case("$$already", "escaped")]
    #[case("$unknown", "v")]
    fn dollar_keys_in_user_documents_survive(#[case] key: &str, #[case] value: &str) {
        let doc = Document::new()
            .with("_id", Uuid::new_v4())
            .with("metadata", Document::new().with(key, value));

        let json: serde_json::Value = doc.clone().into();
        let back = Document::try_from(json).expect("must decode");
        assert_eq!(back, doc);
    }

    #[test]
    fn dollar_keys_are_escaped_in_storage() {
        let doc = Document::new().with("metadata", Document::new().with("$numberLong", "5"));
        let json: serde_json::Value = doc.clone().into();
        assert_eq!(json, serde_json::json!({"metadata": {"$$numberLong": "5"}}));
        assert_eq!(Document::try_from(json).expect("must decode"), doc);
    }

    #[test]
    fn malformed_tag_is_an_error() {
        let json = serde_json::json!({"_id": {"$oid": "not-a-uuid"}});
        assert!(Document::try_from(json).is_err());
    }
}
