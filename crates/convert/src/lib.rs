//! Keel value converter.
//!
//! [`encode`] turns a configuration value ([`HostValue`]) into the wire
//! representation ([`DynamicValue`]); [`decode`] goes the other way. Both walk
//! the kind's [`SchemaNode`] tree. Absent attributes vanish from the wire
//! while explicit nulls stay null, and wire fields the schema does not know
//! come back as [`HostValue::Opaque`] so nothing the server added is lost.
//!
//! For every `v` that conforms to `s`, `decode(&encode(&v, s)?, s)? == v`.

#![forbid(unsafe_code)]

use keel_core::{DynamicMap, DynamicValue, Error, FieldPath, HostValue, KeelResult};
use keel_schema::{NodeKind, ScalarType, SchemaNode};

mod manifest;

pub use crate::manifest::{build_identity, json_node_budget_exceeded, parse_manifests};

/// Encode `value` against `schema`. The root must be declared.
pub fn encode(value: &HostValue, schema: &SchemaNode) -> KeelResult<DynamicValue> {
    let mut path = FieldPath::root();
    encode_at(value, schema, &mut path)?.ok_or_else(|| Error::invalid("nothing to encode: value is absent"))
}

/// Decode a wire value into the host representation.
pub fn decode(value: &DynamicValue, schema: &SchemaNode) -> KeelResult<HostValue> {
    let mut path = FieldPath::root();
    decode_at(value, schema, &mut path)
}

/// Schema-less conversion: maps become [`HostValue::Map`].
pub fn untyped(value: &DynamicValue) -> HostValue {
    match value {
        DynamicValue::Null => HostValue::Null,
        DynamicValue::Bool(b) => HostValue::Bool(*b),
        DynamicValue::Number(n) => HostValue::Number(n.clone()),
        DynamicValue::String(s) => HostValue::String(s.clone()),
        DynamicValue::List(l) => HostValue::List(l.iter().map(untyped).collect()),
        DynamicValue::Map(m) => HostValue::Map(m.iter().map(|(k, v)| (k.clone(), untyped(v))).collect()),
    }
}

/// Schema-less conversion back to the wire; `None` for `Absent`.
pub fn to_wire(value: &HostValue) -> Option<DynamicValue> {
    Some(match value {
        HostValue::Absent => return None,
        HostValue::Null => DynamicValue::Null,
        HostValue::Bool(b) => DynamicValue::Bool(*b),
        HostValue::Number(n) => DynamicValue::Number(n.clone()),
        HostValue::String(s) => DynamicValue::String(s.clone()),
        HostValue::List(l) => DynamicValue::List(l.iter().map(|v| to_wire(v).unwrap_or(DynamicValue::Null)).collect()),
        HostValue::Map(a) | HostValue::Object(a) => {
            DynamicValue::Map(a.iter().filter_map(|(k, v)| to_wire(v).map(|w| (k.clone(), w))).collect())
        }
        HostValue::Opaque(d) => d.clone(),
    })
}

/// Paths of required fields missing from `value`, in sorted order. Lists are
/// checked element by element.
pub fn missing_required(value: &DynamicValue, schema: &SchemaNode) -> Vec<FieldPath> {
    fn walk(v: &DynamicValue, s: &SchemaNode, path: &mut FieldPath, out: &mut Vec<FieldPath>) {
        match (&s.kind, v) {
            (NodeKind::Object, DynamicValue::Map(m)) => {
                for req in &s.required {
                    if !m.contains_key(req) {
                        out.push(path.field(req));
                    }
                }
                for (k, child) in m {
                    if let Some(cs) = s.field(k) {
                        path.push(keel_core::PathSegment::Field(k.clone()));
                        walk(child, cs, path, out);
                        path.pop();
                    }
                }
            }
            (NodeKind::List, DynamicValue::List(items)) => {
                let el = s.element();
                for (i, item) in items.iter().enumerate() {
                    path.push(keel_core::PathSegment::Index(i));
                    walk(item, &el, path, out);
                    path.pop();
                }
            }
            (NodeKind::Map, DynamicValue::Map(m)) => {
                let el = s.element();
                for (k, child) in m {
                    path.push(keel_core::PathSegment::Field(k.clone()));
                    walk(child, &el, path, out);
                    path.pop();
                }
            }
            _ => {}
        }
    }
    let mut out = Vec::new();
    walk(value, schema, &mut FieldPath::root(), &mut out);
    out.sort();
    out
}

fn mismatch(path: &FieldPath, schema: &SchemaNode, found: &str) -> Error {
    Error::type_mismatch(path, schema.type_name(), found)
}

fn is_integral(n: &serde_json::Number) -> bool {
    n.is_i64() || n.is_u64()
}

fn encode_at(value: &HostValue, schema: &SchemaNode, path: &mut FieldPath) -> KeelResult<Option<DynamicValue>> {
    match value {
        HostValue::Absent => return Ok(None),
        HostValue::Null => return Ok(Some(DynamicValue::Null)),
        HostValue::Opaque(d) => return Ok(Some(d.clone())),
        _ => {}
    }
    let out = match &schema.kind {
        NodeKind::Any => encode_untyped(value, path)?,
        NodeKind::Scalar(t) => encode_scalar(value, *t, schema, path)?,
        NodeKind::List => {
            let HostValue::List(items) = value else {
                return Err(mismatch(path, schema, value.type_name()));
            };
            let el = schema.element();
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                path.push(keel_core::PathSegment::Index(i));
                let enc = encode_at(item, &el, path)?;
                let Some(enc) = enc else {
                    return Err(Error::invalid_at(path, "list elements cannot be absent"));
                };
                path.pop();
                out.push(enc);
            }
            DynamicValue::List(out)
        }
        NodeKind::Map => {
            let (HostValue::Map(attrs) | HostValue::Object(attrs)) = value else {
                return Err(mismatch(path, schema, value.type_name()));
            };
            let el = schema.element();
            let mut out = DynamicMap::with_capacity(attrs.len());
            for (k, v) in attrs {
                path.push(keel_core::PathSegment::Field(k.clone()));
                if let Some(enc) = encode_at(v, &el, path)? {
                    out.insert(k.clone(), enc);
                }
                path.pop();
            }
            DynamicValue::Map(out)
        }
        NodeKind::Object => {
            let (HostValue::Map(attrs) | HostValue::Object(attrs)) = value else {
                return Err(mismatch(path, schema, value.type_name()));
            };
            let mut out = DynamicMap::with_capacity(attrs.len());
            for (k, v) in attrs {
                path.push(keel_core::PathSegment::Field(k.clone()));
                let enc = match schema.field(k) {
                    Some(fs) => encode_at(v, fs, path)?,
                    None if v.is_absent() => None,
                    None if schema.preserve_unknown => Some(encode_untyped(v, path)?),
                    None => return Err(Error::invalid_at(path, "field is not part of the schema")),
                };
                if let Some(enc) = enc {
                    out.insert(k.clone(), enc);
                }
                path.pop();
            }
            DynamicValue::Map(out)
        }
    };
    Ok(Some(out))
}

fn encode_scalar(value: &HostValue, t: ScalarType, schema: &SchemaNode, path: &FieldPath) -> KeelResult<DynamicValue> {
    let ok = match (t, value) {
        (ScalarType::String, HostValue::String(_)) => true,
        (ScalarType::Boolean, HostValue::Bool(_)) => true,
        (ScalarType::Number, HostValue::Number(_)) => true,
        (ScalarType::Integer, HostValue::Number(n)) => is_integral(n),
        (ScalarType::IntOrString, HostValue::String(_)) => true,
        (ScalarType::IntOrString, HostValue::Number(n)) => is_integral(n),
        _ => false,
    };
    if !ok {
        let found = match value {
            HostValue::Number(n) if !is_integral(n) => "fractional number",
            other => other.type_name(),
        };
        return Err(mismatch(path, schema, found));
    }
    Ok(match value {
        HostValue::String(s) => DynamicValue::String(s.clone()),
        HostValue::Bool(b) => DynamicValue::Bool(*b),
        HostValue::Number(n) => DynamicValue::Number(n.clone()),
        _ => DynamicValue::Null,
    })
}

fn encode_untyped(value: &HostValue, path: &mut FieldPath) -> KeelResult<DynamicValue> {
    if let HostValue::List(items) = value {
        if items.iter().any(HostValue::is_absent) {
            return Err(Error::invalid_at(path, "list elements cannot be absent"));
        }
    }
    to_wire(value).ok_or_else(|| Error::invalid_at(path, "value is absent"))
}

fn decode_at(value: &DynamicValue, schema: &SchemaNode, path: &mut FieldPath) -> KeelResult<HostValue> {
    if value.is_null() {
        return Ok(HostValue::Null);
    }
    match &schema.kind {
        NodeKind::Any => Ok(untyped(value)),
        NodeKind::Scalar(t) => decode_scalar(value, *t, schema, path),
        NodeKind::List => {
            let DynamicValue::List(items) = value else {
                return Err(mismatch(path, schema, value.type_name()));
            };
            let el = schema.element();
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                path.push(keel_core::PathSegment::Index(i));
                out.push(decode_at(item, &el, path)?);
                path.pop();
            }
            Ok(HostValue::List(out))
        }
        NodeKind::Map => {
            let DynamicValue::Map(m) = value else {
                return Err(mismatch(path, schema, value.type_name()));
            };
            let el = schema.element();
            let mut out = keel_core::Attributes::new();
            for (k, v) in m {
                path.push(keel_core::PathSegment::Field(k.clone()));
                out.insert(k.clone(), decode_at(v, &el, path)?);
                path.pop();
            }
            Ok(HostValue::Map(out))
        }
        NodeKind::Object => {
            let DynamicValue::Map(m) = value else {
                return Err(mismatch(path, schema, value.type_name()));
            };
            let mut out: keel_core::Attributes =
                schema.fields.keys().map(|k| (k.clone(), HostValue::Absent)).collect();
            for (k, v) in m {
                let decoded = match schema.field(k) {
                    Some(fs) => {
                        path.push(keel_core::PathSegment::Field(k.clone()));
                        let d = decode_at(v, fs, path)?;
                        path.pop();
                        d
                    }
                    None => HostValue::Opaque(v.clone()),
                };
                out.insert(k.clone(), decoded);
            }
            Ok(HostValue::Object(out))
        }
    }
}

fn decode_scalar(value: &DynamicValue, t: ScalarType, schema: &SchemaNode, path: &FieldPath) -> KeelResult<HostValue> {
    let out = match (t, value) {
        (ScalarType::String | ScalarType::IntOrString, DynamicValue::String(s)) => HostValue::String(s.clone()),
        (ScalarType::Boolean, DynamicValue::Bool(b)) => HostValue::Bool(*b),
        (ScalarType::Number, DynamicValue::Number(n)) => HostValue::Number(n.clone()),
        (ScalarType::Integer | ScalarType::IntOrString, DynamicValue::Number(n)) if is_integral(n) => {
            HostValue::Number(n.clone())
        }
        _ => return Err(mismatch(path, schema, value.type_name())),
    };
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ErrorKind;
    use serde_json::json;

    fn schema() -> SchemaNode {
        let string = || SchemaNode::scalar(ScalarType::String);
        SchemaNode::object([
            ("apiVersion", string()),
            ("kind", string()),
            ("metadata", keel_schema::object_meta()),
            (
                "spec",
                SchemaNode::object([
                    ("replicas", SchemaNode::scalar(ScalarType::Integer)),
                    ("paused", SchemaNode::scalar(ScalarType::Boolean)),
                    ("ratio", SchemaNode::scalar(ScalarType::Number)),
                    ("port", SchemaNode::scalar(ScalarType::IntOrString)),
                    ("limits", SchemaNode::map(string())),
                    ("args", SchemaNode::list(string())),
                    ("extra", SchemaNode::any()),
                ]),
            ),
        ])
    }

    fn p(s: &str) -> FieldPath {
        FieldPath::parse(s).unwrap()
    }

    fn desired() -> HostValue {
        HostValue::object([
            ("apiVersion", HostValue::string("example.com/v1")),
            ("kind", HostValue::string("Widget")),
            ("metadata", HostValue::object([("name", HostValue::string("w")), ("labels", HostValue::map([("app", HostValue::string("w"))]))])),
            (
                "spec",
                HostValue::object([
                    ("replicas", HostValue::int(3)),
                    ("paused", HostValue::Null),
                    ("ratio", HostValue::Absent),
                    ("port", HostValue::string("http")),
                    ("limits", HostValue::map([("cpu", HostValue::string("200m"))])),
                    ("args", HostValue::List(vec![HostValue::string("-v")])),
                    ("extra", HostValue::map([("nested", HostValue::List(vec![HostValue::int(1), HostValue::Bool(true)]))])),
                ]),
            ),
        ])
    }

    #[test]
    fn absent_is_omitted_and_null_is_kept() {
        let wire = encode(&desired(), &schema()).unwrap();
        assert_eq!(wire.get_path(&p("spec.paused")), Some(&DynamicValue::Null));
        assert!(wire.get_path(&p("spec.ratio")).is_none());
        assert_eq!(wire.get_path(&p("spec.replicas")).and_then(DynamicValue::as_i64), Some(3));
    }

    #[test]
    fn round_trip_law() {
        let s = schema();
        let v = desired();
        let back = decode(&encode(&v, &s).unwrap(), &s).unwrap();
        assert_eq!(back, v);
        // explicit null survives the trip as null, not absent
        assert!(matches!(back.attr("spec").and_then(|sp| sp.attr("paused")), Some(HostValue::Null)));

        // manifests read from files arrive map-shaped
        let loaded = untyped(&encode(&v, &s).unwrap());
        assert!(matches!(loaded, HostValue::Map(_)));
        let back = decode(&encode(&loaded, &s).unwrap(), &s).unwrap();
        assert!(matches!(back, HostValue::Object(_)));
        assert_eq!(back, loaded);
        let small = HostValue::map([("spec", HostValue::map([("replicas", HostValue::int(3))]))]);
        assert_eq!(decode(&encode(&small, &s).unwrap(), &s).unwrap(), small);
    }

    #[test]
    fn type_mismatch_names_the_path() {
        let bad = HostValue::object([("spec", HostValue::object([("replicas", HostValue::map([("x", HostValue::int(1))]))]))]);
        let err = encode(&bad, &schema()).unwrap_err();
        match err.kind {
            ErrorKind::TypeMismatch { path, expected, found } => {
                assert_eq!(path, p("spec.replicas"));
                assert_eq!(expected, "integer");
                assert_eq!(found, "map");
            }
            other => panic!("unexpected {other:?}"),
        }
        let frac = HostValue::object([("spec", HostValue::object([("replicas", HostValue::Number(serde_json::Number::from_f64(1.5).unwrap()))]))]);
        assert!(matches!(encode(&frac, &schema()).unwrap_err().kind, ErrorKind::TypeMismatch { .. }));
        let nested = HostValue::object([("spec", HostValue::object([("args", HostValue::List(vec![HostValue::int(1)]))]))]);
        assert_eq!(encode(&nested, &schema()).unwrap_err().path(), Some(&p("spec.args[0]")));
    }

    #[test]
    fn unknown_fields_rejected_unless_opaque_or_preserved() {
        let bad = HostValue::object([("spec", HostValue::object([("typo", HostValue::int(1))]))]);
        let err = encode(&bad, &schema()).unwrap_err();
        assert_eq!(err.path(), Some(&p("spec.typo")));
        let ok = HostValue::object([("spec", HostValue::object([("typo", HostValue::Opaque(DynamicValue::from(1i64)))]))]);
        assert!(encode(&ok, &schema()).is_ok());
        // metadata preserves unknown fields
        let meta = HostValue::object([("metadata", HostValue::object([("uid", HostValue::string("abc"))]))]);
        assert!(encode(&meta, &schema()).is_ok());
    }

    #[test]
    fn decode_keeps_server_added_fields_opaque() {
        let wire = DynamicValue::from(json!({
            "spec": {"replicas": 1, "serverDefault": {"x": [1, 2]}},
            "status": {"ready": true}
        }));
        let host = decode(&wire, &schema()).unwrap();
        let spec = host.attr("spec").unwrap();
        assert_eq!(spec.attr("serverDefault"), Some(&HostValue::Opaque(DynamicValue::from(json!({"x": [1, 2]})))));
        assert!(spec.attr("paused").is_none());
        // and they survive re-encoding
        assert_eq!(encode(&host, &schema()).unwrap(), wire);
    }

    #[test]
    fn decode_rejects_wrong_wire_shapes() {
        let wire = DynamicValue::from(json!({"spec": {"limits": ["a"]}}));
        let err = decode(&wire, &schema()).unwrap_err();
        assert_eq!(err.path(), Some(&p("spec.limits")));
    }

    #[test]
    fn required_fields_are_reported_in_order() {
        let s = SchemaNode::object([(
            "spec",
            SchemaNode::object([
                ("b", SchemaNode::scalar(ScalarType::String)),
                ("items", SchemaNode::list(SchemaNode::object([("name", SchemaNode::scalar(ScalarType::String))]).with_required(["name"]))),
            ])
            .with_required(["a", "b"]),
        )]);
        let v = DynamicValue::from(json!({"spec": {"b": "x", "items": [{"name": "ok"}, {}]}}));
        assert_eq!(missing_required(&v, &s), vec![p("spec.a"), p("spec.items[1].name")]);
    }
}
