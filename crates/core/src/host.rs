//! Configuration-language side of the value boundary.
//!
//! A [`HostValue`] is what the declarative configuration hands to the engine
//! (already parsed) and what the engine hands back for persistence. Unlike the
//! wire representation it knows whether an attribute was declared at all:
//! [`HostValue::Absent`] (never declared) and [`HostValue::Null`] (declared as
//! null) are different values and stay different through conversion.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::DynamicValue;

pub type Attributes = BTreeMap<String, HostValue>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum HostValue {
    Absent,
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<HostValue>),
    /// Homogeneous map with arbitrary keys.
    Map(Attributes),
    /// Schema-typed object; attributes may be `Absent`.
    Object(Attributes),
    /// Wire data the schema does not describe, carried verbatim.
    Opaque(DynamicValue),
}

impl HostValue {
    pub fn object<I, K>(attrs: I) -> Self
    where
        I: IntoIterator<Item = (K, HostValue)>,
        K: Into<String>,
    {
        HostValue::Object(attrs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn map<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, HostValue)>,
        K: Into<String>,
    {
        HostValue::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn string(s: impl Into<String>) -> Self {
        HostValue::String(s.into())
    }

    pub fn int(n: i64) -> Self {
        HostValue::Number(n.into())
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, HostValue::Absent)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::Absent => "absent",
            HostValue::Null => "null",
            HostValue::Bool(_) => "bool",
            HostValue::Number(_) => "number",
            HostValue::String(_) => "string",
            HostValue::List(_) => "list",
            HostValue::Map(_) => "map",
            HostValue::Object(_) => "object",
            HostValue::Opaque(_) => "opaque",
        }
    }

    /// Declared attribute of an object or map; `Absent` counts as missing.
    pub fn attr(&self, name: &str) -> Option<&HostValue> {
        match self {
            HostValue::Object(a) | HostValue::Map(a) => a.get(name).filter(|v| !v.is_absent()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s),
            HostValue::Opaque(DynamicValue::String(s)) => Some(s),
            _ => None,
        }
    }
}

fn declared(attrs: &Attributes) -> impl Iterator<Item = (&String, &HostValue)> {
    attrs.iter().filter(|(_, v)| !v.is_absent())
}

/// `Map` and `Object` compare by declared attributes, and `Opaque` equals any
/// value with the same wire form. Decoding picks the variant from the schema,
/// so the variant a caller built with is not significant.
impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        use HostValue::*;
        match (self, other) {
            (Absent, Absent) | (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Number(a), Number(b)) => a == b,
            (String(a), String(b)) => a == b,
            (List(a), List(b)) => a == b,
            (Map(a) | Object(a), Map(b) | Object(b)) => declared(a).eq(declared(b)),
            (Opaque(a), Opaque(b)) => a == b,
            (Opaque(w), h) | (h, Opaque(w)) => same_wire(h, w),
            _ => false,
        }
    }
}

fn same_wire(h: &HostValue, w: &DynamicValue) -> bool {
    match (h, w) {
        (HostValue::Null, DynamicValue::Null) => true,
        (HostValue::Bool(a), DynamicValue::Bool(b)) => a == b,
        (HostValue::Number(a), DynamicValue::Number(b)) => a == b,
        (HostValue::String(a), DynamicValue::String(b)) => a == b,
        (HostValue::List(a), DynamicValue::List(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| same_wire(x, y))
        }
        (HostValue::Map(a) | HostValue::Object(a), DynamicValue::Map(b)) => {
            declared(a).count() == b.len()
                && declared(a).all(|(k, v)| b.get(k.as_str()).map_or(false, |y| same_wire(v, y)))
        }
        (HostValue::Opaque(a), b) => a == b,
        _ => false,
    }
}
