//! Field ownership as recorded by the API server in `metadata.managedFields`.
//!
//! The engine never owns this record. It parses an immutable snapshot per
//! fetch and only answers "who touches this path".

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::path::{FieldPath, PathSegment};
use crate::value::{DynamicMap, DynamicValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagedOperation {
    Apply,
    Update,
}

/// Trie of owned paths in FieldsV1 shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSet {
    /// The node itself is a member (leaf `{}` or a `"."` entry).
    member: bool,
    children: BTreeMap<PathSegment, FieldSet>,
}

impl FieldSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a FieldsV1 document (`{"f:spec": {"f:replicas": {}}}`).
    pub fn from_fields_v1(v: &DynamicValue) -> Result<Self, String> {
        let map = v.as_map().ok_or_else(|| format!("fieldsV1 must be a map, got {}", v.type_name()))?;
        let mut out = FieldSet::new();
        for (k, child) in map {
            if k == "." {
                out.member = true;
                continue;
            }
            let seg = parse_fields_v1_key(k)?;
            let mut node = FieldSet::from_fields_v1(child)?;
            if node.children.is_empty() {
                node.member = true;
            }
            out.children.insert(seg, node);
        }
        Ok(out)
    }

    pub fn to_fields_v1(&self) -> DynamicValue {
        let mut m = DynamicMap::new();
        if self.member && !self.children.is_empty() {
            m.insert(".".to_string(), DynamicValue::map());
        }
        for (seg, child) in &self.children {
            m.insert(fields_v1_key(seg), child.to_fields_v1());
        }
        DynamicValue::Map(m)
    }

    pub fn insert(&mut self, path: &FieldPath) {
        let mut node = self;
        for seg in path.segments() {
            node = node.children.entry(seg.clone()).or_default();
        }
        node.member = true;
    }

    /// Drop `path` and everything below it.
    pub fn remove(&mut self, path: &FieldPath) {
        let Some((last, parents)) = path.segments().split_last() else {
            *self = FieldSet::new();
            return;
        };
        let mut node = self;
        for seg in parents {
            match node.children.get_mut(seg) {
                Some(next) => node = next,
                None => return,
            }
        }
        node.children.remove(last);
    }

    pub fn is_empty(&self) -> bool {
        !self.member && self.children.is_empty()
    }

    /// True when the set holds `path`, something below it, or an atomic
    /// (childless member) ancestor of it.
    pub fn touches(&self, path: &FieldPath) -> bool {
        let mut node = self;
        let mut depth = 0usize;
        for seg in path.segments() {
            match node.children.get(seg) {
                Some(next) => node = next,
                None => return depth > 0 && node.member && node.children.is_empty(),
            }
            depth += 1;
        }
        true
    }

    /// Member paths in sorted order.
    pub fn members(&self) -> Vec<FieldPath> {
        fn walk(node: &FieldSet, prefix: &mut FieldPath, out: &mut Vec<FieldPath>) {
            if node.member && !prefix.is_root() {
                out.push(prefix.clone());
            }
            for (seg, child) in &node.children {
                prefix.push(seg.clone());
                walk(child, prefix, out);
                prefix.pop();
            }
        }
        let mut out = Vec::new();
        walk(self, &mut FieldPath::root(), &mut out);
        out
    }
}

fn parse_fields_v1_key(k: &str) -> Result<PathSegment, String> {
    let (prefix, rest) = k.split_once(':').ok_or_else(|| format!("invalid fieldsV1 key {:?}", k))?;
    match prefix {
        "f" => Ok(PathSegment::Field(rest.to_string())),
        "k" => Ok(PathSegment::Key(rest.to_string())),
        "v" => Ok(PathSegment::Value(rest.to_string())),
        "i" => rest.parse::<usize>().map(PathSegment::Index).map_err(|_| format!("invalid fieldsV1 index {:?}", k)),
        _ => Err(format!("unknown fieldsV1 prefix in {:?}", k)),
    }
}

fn fields_v1_key(seg: &PathSegment) -> String {
    match seg {
        PathSegment::Field(f) => format!("f:{}", f),
        PathSegment::Key(k) => format!("k:{}", k),
        PathSegment::Value(v) => format!("v:{}", v),
        PathSegment::Index(i) => format!("i:{}", i),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedEntry {
    pub manager: String,
    pub operation: ManagedOperation,
    pub api_version: Option<String>,
    pub subresource: Option<String>,
    pub fields: FieldSet,
}

/// Snapshot of an object's ownership record at fetch time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldOwnership {
    entries: Vec<ManagedEntry>,
}

impl FieldOwnership {
    pub fn new(entries: Vec<ManagedEntry>) -> Self {
        Self { entries }
    }

    /// Read `metadata.managedFields` from a full object. Entries that cannot be
    /// parsed, and entries for subresources (e.g. `status`), are skipped.
    pub fn from_object(obj: &DynamicValue) -> Self {
        let Some(list) = obj.get("metadata").and_then(|m| m.get("managedFields")).and_then(DynamicValue::as_list) else {
            return Self::default();
        };
        let mut entries = Vec::with_capacity(list.len());
        for item in list {
            let Some(manager) = item.get("manager").and_then(DynamicValue::as_str) else { continue };
            let operation = match item.get("operation").and_then(DynamicValue::as_str) {
                Some("Apply") => ManagedOperation::Apply,
                _ => ManagedOperation::Update,
            };
            let subresource = item.get("subresource").and_then(DynamicValue::as_str).filter(|s| !s.is_empty()).map(str::to_string);
            if subresource.is_some() {
                continue;
            }
            let fields = match item.get("fieldsV1").map(FieldSet::from_fields_v1) {
                Some(Ok(f)) => f,
                Some(Err(_)) => continue,
                None => FieldSet::new(),
            };
            entries.push(ManagedEntry {
                manager: manager.to_string(),
                operation,
                api_version: item.get("apiVersion").and_then(DynamicValue::as_str).map(str::to_string),
                subresource,
                fields,
            });
        }
        Self { entries }
    }

    pub fn entries(&self) -> &[ManagedEntry] {
        &self.entries
    }

    /// No ownership information at all (server did not report any).
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn managers_at(&self, path: &FieldPath) -> BTreeSet<&str> {
        self.entries
            .iter()
            .filter(|e| e.fields.touches(path))
            .map(|e| e.manager.as_str())
            .collect()
    }

    pub fn owned_by(&self, path: &FieldPath, manager: &str) -> bool {
        self.entries.iter().any(|e| e.manager == manager && e.fields.touches(path))
    }

    pub fn owned_by_other(&self, path: &FieldPath, manager: &str) -> bool {
        self.entries.iter().any(|e| e.manager != manager && e.fields.touches(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn p(s: &str) -> FieldPath {
        FieldPath::parse(s).unwrap()
    }

    fn object() -> DynamicValue {
        DynamicValue::from(json!({
            "metadata": {
                "name": "x",
                "managedFields": [
                    {
                        "manager": "keel",
                        "operation": "Apply",
                        "apiVersion": "v1",
                        "fieldsV1": {"f:spec": {"f:limits": {"f:memory": {}}, "f:ports": {}}}
                    },
                    {
                        "manager": "hpa-controller",
                        "operation": "Update",
                        "apiVersion": "v1",
                        "fieldsV1": {"f:spec": {"f:limits": {".": {}, "f:cpu": {}}}}
                    },
                    {
                        "manager": "kubelet",
                        "operation": "Update",
                        "subresource": "status",
                        "fieldsV1": {"f:status": {"f:phase": {}}}
                    }
                ]
            }
        }))
    }

    #[test]
    fn parses_managers_and_skips_subresources() {
        let own = FieldOwnership::from_object(&object());
        assert_eq!(own.entries().len(), 2);
        assert_eq!(own.entries()[0].operation, ManagedOperation::Apply);
        assert!(own.managers_at(&p("status.phase")).is_empty());
    }

    #[test]
    fn touches_leaves_descendants_and_atomic_ancestors() {
        let own = FieldOwnership::from_object(&object());
        assert!(own.owned_by(&p("spec.limits.memory"), "keel"));
        assert!(own.owned_by(&p("spec.limits"), "keel"));
        assert!(!own.owned_by(&p("spec.limits.cpu"), "keel"));
        assert!(own.owned_by_other(&p("spec.limits.cpu"), "keel"));
        // ports is an atomic member: anything below it belongs to its owner
        assert!(own.owned_by(&p("spec.ports[0].port"), "keel"));
        // "." makes limits a member for hpa-controller, but not its unlisted children
        assert!(!own.owned_by(&p("spec.limits.memory"), "hpa-controller"));
        assert_eq!(own.managers_at(&p("spec.limits")).into_iter().collect::<Vec<_>>(), vec!["hpa-controller", "keel"]);
    }

    #[test]
    fn fields_v1_round_trips_through_the_trie() {
        let raw = DynamicValue::from(json!({"f:spec": {".": {}, "f:a": {}, "f:b": {"f:c": {}}}}));
        let set = FieldSet::from_fields_v1(&raw).unwrap();
        assert_eq!(set.members(), vec![p("spec"), p("spec.a"), p("spec.b.c")]);
        assert_eq!(set.to_fields_v1(), raw);
    }

    #[test]
    fn insert_and_remove() {
        let mut set = FieldSet::new();
        set.insert(&p("spec.a"));
        set.insert(&p("spec.b"));
        set.remove(&p("spec.a"));
        assert_eq!(set.members(), vec![p("spec.b")]);
        assert!(!set.touches(&p("spec.a")));
        assert!(set.touches(&p("spec")));
    }
}
