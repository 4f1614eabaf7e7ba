//! Structural fingerprints of query shapes.
//!
//! A fingerprint keeps key names, nesting and the null/undefined/array
//! structure of a document while dropping every literal value, so
//! `{ _id: 1 }` and `{ _id: 2 }` both become `{ _id }`.
//!
//! Keys are visited in document insertion order. BSON documents are ordered,
//! so two documents built with the same keys in the same order always yield
//! byte-identical fingerprints.

use anyhow::{Context, Result};
use bson::{Bson, Document};
use serde_json::Value;

/// Fingerprint any BSON value.
///
/// Documents and arrays render their structure; a bare scalar renders as the
/// empty string and a bare null/undefined as `null`/`undefined`.
pub fn fingerprint(value: &Bson) -> String {
    let mut out = String::new();
    match value {
        Bson::Document(_) | Bson::Array(_) => write_nested(&mut out, value),
        Bson::Null => out.push_str("null"),
        Bson::Undefined => out.push_str("undefined"),
        _ => {}
    }
    out
}

pub fn fingerprint_document(doc: &Document) -> String {
    let mut out = String::new();
    write_document(&mut out, doc);
    out
}

/// Parse a JSON filter (key order preserved) and fingerprint it.
///
/// The JSON is read as plain structure: extended-JSON wrappers such as
/// `{"$oid": ..}` are ordinary keys here, as they are in a query shape.
pub fn fingerprint_json(json: &str) -> Result<String> {
    let value: Value = serde_json::from_str(json).context("parsing query shape as JSON")?;
    Ok(fingerprint(&json_to_bson(value)))
}

fn json_to_bson(value: Value) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Bson::Int64(i),
            None => Bson::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => Bson::String(s),
        Value::Array(items) => Bson::Array(items.into_iter().map(json_to_bson).collect()),
        Value::Object(map) => Bson::Document(map.into_iter().map(|(k, v)| (k, json_to_bson(v))).collect()),
    }
}

fn is_nullish(v: &Bson) -> bool {
    matches!(v, Bson::Null | Bson::Undefined)
}

fn write_nested(out: &mut String, value: &Bson) {
    match value {
        Bson::Document(doc) => write_document(out, doc),
        Bson::Array(items) => write_array(out, items),
        _ => {}
    }
}

fn write_document(out: &mut String, doc: &Document) {
    out.push_str("{ ");
    let mut first = true;
    for (key, value) in doc {
        if !first {
            out.push_str(", ");
        }
        first = false;
        out.push_str(key);
        match value {
            Bson::Null => out.push_str(": null"),
            Bson::Undefined => out.push_str(": undefined"),
            Bson::Document(_) | Bson::Array(_) => {
                out.push_str(": ");
                write_nested(out, value);
            }
            _ => {}
        }
    }
    out.push_str(" }");
}

fn write_array(out: &mut String, items: &[Bson]) {
    if !items.is_empty() && items.iter().all(is_nullish) {
        out.push_str("[ null ]");
        return;
    }
    out.push_str("[ ");
    let mut first = true;
    for item in items {
        let nested = match item {
            Bson::Document(_) | Bson::Array(_) => item,
            // scalars leave no token behind
            _ => continue,
        };
        if !first {
            out.push_str(", ");
        }
        first = false;
        write_nested(out, nested);
    }
    out.push_str(" ]");
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{doc, oid::ObjectId};

    fn fp(d: Document) -> String {
        fingerprint_document(&d)
    }

    #[test]
    fn bare_scalar_key() {
        assert_eq!(fp(doc! { "_id": 1 }), "{ _id }");
    }

    #[test]
    fn null_array_collapses() {
        assert_eq!(fp(doc! { "_id": "x", "groupIds": [Bson::Null] }), "{ _id, groupIds: [ null ] }");
        assert_eq!(
            fp(doc! { "_id": "x", "groupIds": [Bson::Null, Bson::Undefined, Bson::Null] }),
            "{ _id, groupIds: [ null ] }"
        );
    }

    #[test]
    fn null_and_undefined_values() {
        assert_eq!(fp(doc! { "_id": "x", "groupIds": Bson::Null }), "{ _id, groupIds: null }");
        assert_eq!(fp(doc! { "_id": "x", "groupIds": Bson::Undefined }), "{ _id, groupIds: undefined }");
    }

    #[test]
    fn nested_operators() {
        let d = doc! { "_id": "y", "$or": [ { "createdAt": { "$gt": 123 } } ] };
        assert_eq!(fp(d), "{ _id, $or: [ { createdAt: { $gt } } ] }");
    }

    #[test]
    fn empty_containers() {
        assert_eq!(fp(doc! {}), "{  }");
        assert_eq!(fp(doc! { "tags": [] }), "{ tags: [  ] }");
    }

    #[test]
    fn scalar_array_elements_are_invisible() {
        assert_eq!(fp(doc! { "a": { "$in": [1, 2, 3] } }), "{ a: { $in: [  ] } }");
        assert_eq!(fp(doc! { "a": [1, { "b": 2 }, "c", { "d": Bson::Null }] }), "{ a: [ { b }, { d: null } ] }");
    }

    #[test]
    fn nested_arrays() {
        assert_eq!(fp(doc! { "m": [[{ "x": 1 }], [Bson::Null]] }), "{ m: [ [ { x } ], [ null ] ] }");
    }

    #[test]
    fn values_do_not_matter() {
        let a = doc! { "user": ObjectId::new(), "age": { "$gte": 18 }, "name": { "$regex": "^bo" } };
        let b = doc! { "user": ObjectId::new(), "age": { "$gte": 99 }, "name": { "$regex": "x" } };
        assert_eq!(fp(a), fp(b));
    }

    #[test]
    fn key_presence_matters() {
        assert_ne!(fp(doc! { "a": 1 }), fp(doc! { "a": 1, "b": 1 }));
        assert_ne!(fp(doc! { "a": 1 }), fp(doc! { "a": Bson::Null }));
        assert_ne!(fp(doc! { "a": [Bson::Null] }), fp(doc! { "a": [1] }));
    }

    #[test]
    fn top_level_values() {
        assert_eq!(fingerprint(&Bson::Int32(4)), "");
        assert_eq!(fingerprint(&Bson::Null), "null");
        let pipeline = Bson::Array(vec![Bson::Document(doc! { "$match": { "a": 1 } })]);
        assert_eq!(fingerprint(&pipeline), "[ { $match: { a } } ]");
    }

    #[test]
    fn json_keeps_key_order() {
        let got = fingerprint_json(r#"{"z": 1, "a": {"$in": [1, 2]}, "m": null}"#).unwrap();
        assert_eq!(got, "{ z, a: { $in: [  ] }, m: null }");
        assert!(fingerprint_json("{not json").is_err());
    }

    #[test]
    fn json_dollar_keys_are_structure() {
        assert_eq!(fingerprint_json(r#"{"a": {"$code": "x"}}"#).unwrap(), "{ a: { $code } }");
        assert_eq!(fingerprint_json(r#"{"x": {"$oid": 5}}"#).unwrap(), "{ x: { $oid } }");
        assert_eq!(
            fingerprint_json(r#"{"x": {"$binary": 1, "y": 2}}"#).unwrap(),
            "{ x: { $binary, y } }"
        );
        assert_eq!(
            fingerprint_json(r#"{"d": {"$date": "2024-01-01"}, "n": [null]}"#).unwrap(),
            "{ d: { $date }, n: [ null ] }"
        );
    }
}
