//! Wire-side dynamic value: the schemaless JSON object model of the remote API.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::path::{FieldPath, PathSegment};

/// Map of a [`DynamicValue`]. Equality ignores key order; iteration and
/// serialization keep insertion order.
pub type DynamicMap = IndexMap<String, DynamicValue>;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DynamicValue {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<DynamicValue>),
    Map(DynamicMap),
}

impl DynamicValue {
    pub fn map() -> Self {
        DynamicValue::Map(DynamicMap::new())
    }

    pub fn string(s: impl Into<String>) -> Self {
        DynamicValue::String(s.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, DynamicValue::Null)
    }

    /// Short type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            DynamicValue::Null => "null",
            DynamicValue::Bool(_) => "bool",
            DynamicValue::Number(_) => "number",
            DynamicValue::String(_) => "string",
            DynamicValue::List(_) => "list",
            DynamicValue::Map(_) => "map",
        }
    }

    /// True when both values are of the same shape (scalars of one type,
    /// lists, or maps).
    pub fn same_type(&self, other: &DynamicValue) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    pub fn as_map(&self) -> Option<&DynamicMap> {
        match self {
            DynamicValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut DynamicMap> {
        match self {
            DynamicValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[DynamicValue]> {
        match self {
            DynamicValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DynamicValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DynamicValue::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DynamicValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&DynamicValue> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Follow a field path through maps and lists.
    pub fn get_path(&self, path: &FieldPath) -> Option<&DynamicValue> {
        let mut cur = self;
        for seg in path.segments() {
            cur = match (seg, cur) {
                (PathSegment::Field(k), DynamicValue::Map(m)) => m.get(k)?,
                (PathSegment::Index(i), DynamicValue::List(l)) => l.get(*i)?,
                _ => return None,
            };
        }
        Some(cur)
    }

    /// Insert `value` at `path`, creating intermediate maps. Only field
    /// segments are supported; returns false when the path crosses a non-map.
    pub fn set_path(&mut self, path: &FieldPath, value: DynamicValue) -> bool {
        let segs = path.segments();
        let Some((last, parents)) = segs.split_last() else {
            *self = value;
            return true;
        };
        let mut cur = self;
        for seg in parents {
            let PathSegment::Field(k) = seg else { return false };
            if cur.is_null() {
                *cur = DynamicValue::map();
            }
            let Some(m) = cur.as_map_mut() else { return false };
            cur = m.entry(k.clone()).or_insert_with(DynamicValue::map);
        }
        let PathSegment::Field(k) = last else { return false };
        if cur.is_null() {
            *cur = DynamicValue::map();
        }
        match cur.as_map_mut() {
            Some(m) => {
                m.insert(k.clone(), value);
                true
            }
            None => false,
        }
    }

    /// Remove the entry at `path`; returns the removed value.
    pub fn remove_path(&mut self, path: &FieldPath) -> Option<DynamicValue> {
        let (last, parents) = path.segments().split_last()?;
        let mut cur = self;
        for seg in parents {
            let PathSegment::Field(k) = seg else { return None };
            cur = cur.as_map_mut()?.get_mut(k)?;
        }
        let PathSegment::Field(k) = last else { return None };
        cur.as_map_mut()?.shift_remove(k)
    }

    /// Recursively sort map keys. Two equal values produce identical
    /// serializations after canonicalization.
    pub fn canonicalize(&mut self) {
        match self {
            DynamicValue::Map(m) => {
                m.sort_keys();
                for v in m.values_mut() {
                    v.canonicalize();
                }
            }
            DynamicValue::List(l) => l.iter_mut().for_each(DynamicValue::canonicalize),
            _ => {}
        }
    }

    pub fn to_json(&self) -> Json {
        Json::from(self.clone())
    }
}

impl From<Json> for DynamicValue {
    fn from(v: Json) -> Self {
        match v {
            Json::Null => DynamicValue::Null,
            Json::Bool(b) => DynamicValue::Bool(b),
            Json::Number(n) => DynamicValue::Number(n),
            Json::String(s) => DynamicValue::String(s),
            Json::Array(a) => DynamicValue::List(a.into_iter().map(DynamicValue::from).collect()),
            Json::Object(o) => DynamicValue::Map(o.into_iter().map(|(k, v)| (k, DynamicValue::from(v))).collect()),
        }
    }
}

impl From<DynamicValue> for Json {
    fn from(v: DynamicValue) -> Self {
        match v {
            DynamicValue::Null => Json::Null,
            DynamicValue::Bool(b) => Json::Bool(b),
            DynamicValue::Number(n) => Json::Number(n),
            DynamicValue::String(s) => Json::String(s),
            DynamicValue::List(l) => Json::Array(l.into_iter().map(Json::from).collect()),
            DynamicValue::Map(m) => Json::Object(m.into_iter().map(|(k, v)| (k, Json::from(v))).collect()),
        }
    }
}

impl From<&str> for DynamicValue {
    fn from(s: &str) -> Self {
        DynamicValue::String(s.to_string())
    }
}

impl From<bool> for DynamicValue {
    fn from(b: bool) -> Self {
        DynamicValue::Bool(b)
    }
}

impl From<i64> for DynamicValue {
    fn from(n: i64) -> Self {
        DynamicValue::Number(n.into())
    }
}

impl std::fmt::Display for DynamicValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(self) {
            Ok(s) => f.write_str(&s),
            Err(_) => f.write_str("<unprintable>"),
        }
    }
}
