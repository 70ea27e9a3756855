//! Building [`SchemaNode`] trees from published OpenAPI v3 material.

use std::collections::HashMap;
use std::sync::Arc;

use keel_core::{Error, Gvk, KeelResult};
use serde_json::{Map, Value as Json};

use crate::node::{object_meta, ListType, NodeKind, ScalarType, SchemaNode};

const REF_PREFIX: &str = "#/components/schemas/";

/// Root schema of `gvk` from a group-version OpenAPI v3 document.
/// `Ok(None)` when no component advertises the kind.
pub fn from_openapi_v3(doc: &Json, gvk: &Gvk) -> KeelResult<Option<SchemaNode>> {
    let Some(components) = doc.get("components").and_then(|c| c.get("schemas")).and_then(Json::as_object) else {
        return Err(Error::invalid(format!("OpenAPI document for {} has no components.schemas", gvk.api_version())));
    };
    let Some((name, _)) = components.iter().find(|(_, s)| advertises(s, gvk)) else {
        return Ok(None);
    };
    let mut b = Builder { components: Some(components), done: HashMap::new(), stack: Vec::new() };
    let root = b.by_ref(name);
    Ok(Some(finish_root((*root).clone())))
}

/// Root schema from a CRD's `openAPIV3Schema` (self-contained, no `$ref`s).
pub fn from_crd(schema: &Json) -> SchemaNode {
    let mut b = Builder { components: None, done: HashMap::new(), stack: Vec::new() };
    finish_root(b.node(schema))
}

/// Schema for kinds that publish nothing: identity fields typed, the rest
/// carried structurally.
pub fn permissive_root() -> SchemaNode {
    finish_root(SchemaNode::any())
}

fn advertises(schema: &Json, gvk: &Gvk) -> bool {
    schema
        .get("x-kubernetes-group-version-kind")
        .and_then(Json::as_array)
        .map(|list| {
            list.iter().any(|g| {
                g.get("group").and_then(Json::as_str).unwrap_or("") == gvk.group
                    && g.get("version").and_then(Json::as_str) == Some(gvk.version.as_str())
                    && g.get("kind").and_then(Json::as_str) == Some(gvk.kind.as_str())
            })
        })
        .unwrap_or(false)
}

fn finish_root(mut node: SchemaNode) -> SchemaNode {
    if node.kind != NodeKind::Object {
        node = SchemaNode::object(Vec::<(String, SchemaNode)>::new()).preserving_unknown();
    }
    let string = || Arc::new(SchemaNode::scalar(ScalarType::String));
    node.fields.entry("apiVersion".into()).or_insert_with(string);
    node.fields.entry("kind".into()).or_insert_with(string);
    let meta_is_opaque = node.fields.get("metadata").map(|m| m.fields.is_empty()).unwrap_or(true);
    if meta_is_opaque {
        node.fields.insert("metadata".into(), Arc::new(object_meta()));
    }
    node
}

struct Builder<'a> {
    components: Option<&'a Map<String, Json>>,
    done: HashMap<String, Arc<SchemaNode>>,
    /// Refs being built; a ref seen again is a cycle and becomes `Any`.
    stack: Vec<String>,
}

impl<'a> Builder<'a> {
    fn by_ref(&mut self, name: &str) -> Arc<SchemaNode> {
        if let Some(done) = self.done.get(name) {
            return done.clone();
        }
        if self.stack.iter().any(|s| s == name) {
            return Arc::new(SchemaNode::any());
        }
        let Some(schema) = self.components.and_then(|c| c.get(name)) else {
            return Arc::new(SchemaNode::any());
        };
        self.stack.push(name.to_string());
        let node = Arc::new(self.node(schema));
        self.stack.pop();
        self.done.insert(name.to_string(), node.clone());
        node
    }

    fn child(&mut self, s: &Json) -> Arc<SchemaNode> {
        if let Some(name) = ref_name(s) {
            return self.by_ref(name);
        }
        Arc::new(self.node(s))
    }

    fn node(&mut self, s: &Json) -> SchemaNode {
        if let Some(name) = ref_name(s) {
            return (*self.by_ref(name)).clone();
        }
        // `allOf: [{$ref}]` is how OpenAPI v3 attaches descriptions/defaults to refs
        if let Some([only]) = s.get("allOf").and_then(Json::as_array).map(Vec::as_slice) {
            let mut inner = self.node(only);
            if flag(s, "x-kubernetes-preserve-unknown-fields") {
                inner.preserve_unknown = true;
            }
            return inner;
        }
        if flag(s, "x-kubernetes-int-or-string") || s.get("format").and_then(Json::as_str) == Some("int-or-string") {
            return SchemaNode::scalar(ScalarType::IntOrString);
        }
        let preserve = flag(s, "x-kubernetes-preserve-unknown-fields");
        let props = s.get("properties").and_then(Json::as_object);
        let additional = s.get("additionalProperties");
        let items = s.get("items");

        match s.get("type").and_then(Json::as_str) {
            Some("string") => SchemaNode::scalar(ScalarType::String),
            Some("integer") => SchemaNode::scalar(ScalarType::Integer),
            Some("number") => SchemaNode::scalar(ScalarType::Number),
            Some("boolean") => SchemaNode::scalar(ScalarType::Boolean),
            Some("array") => self.list(s, items),
            Some("object") | None => {
                if let Some(props) = props.filter(|p| !p.is_empty()) {
                    self.object(s, props, preserve)
                } else if let Some(add) = additional.filter(|a| a.is_object()) {
                    SchemaNode::map((*self.child(add)).clone())
                } else if additional.and_then(Json::as_bool) == Some(true) {
                    SchemaNode::map(SchemaNode::any())
                } else if items.is_some() {
                    self.list(s, items)
                } else {
                    SchemaNode::any()
                }
            }
            Some(_) => SchemaNode::any(),
        }
    }

    fn object(&mut self, s: &Json, props: &Map<String, Json>, preserve: bool) -> SchemaNode {
        let mut node = SchemaNode::object(Vec::<(String, SchemaNode)>::new());
        for (k, v) in props {
            let child = self.child(v);
            node.fields.insert(k.clone(), child);
        }
        if let Some(req) = s.get("required").and_then(Json::as_array) {
            node.required.extend(req.iter().filter_map(Json::as_str).map(str::to_string));
        }
        node.preserve_unknown = preserve;
        node
    }

    fn list(&mut self, s: &Json, items: Option<&Json>) -> SchemaNode {
        let element = match items {
            Some(i) => (*self.child(i)).clone(),
            None => SchemaNode::any(),
        };
        let mut node = SchemaNode::list(element);
        node.list_type = match s.get("x-kubernetes-list-type").and_then(Json::as_str) {
            Some("atomic") => Some(ListType::Atomic),
            Some("set") => Some(ListType::Set),
            Some("map") => Some(ListType::Map(
                s.get("x-kubernetes-list-map-keys")
                    .and_then(Json::as_array)
                    .map(|ks| ks.iter().filter_map(Json::as_str).map(str::to_string).collect())
                    .unwrap_or_default(),
            )),
            _ => None,
        };
        node
    }
}

fn ref_name(s: &Json) -> Option<&str> {
    s.get("$ref").and_then(Json::as_str).and_then(|r| r.strip_prefix(REF_PREFIX))
}

fn flag(s: &Json, key: &str) -> bool {
    s.get(key).and_then(Json::as_bool).unwrap_or(false)
}
