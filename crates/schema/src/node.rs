//! Structural schema of one resource kind.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScalarType {
    String,
    Integer,
    Number,
    Boolean,
    IntOrString,
}

impl ScalarType {
    pub fn name(&self) -> &'static str {
        match self {
            ScalarType::String => "string",
            ScalarType::Integer => "integer",
            ScalarType::Number => "number",
            ScalarType::Boolean => "boolean",
            ScalarType::IntOrString => "int-or-string",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    Scalar(ScalarType),
    List,
    /// Homogeneous map (`additionalProperties`).
    Map,
    /// Fixed set of named fields (`properties`).
    Object,
    /// Anything goes; values are carried structurally.
    Any,
}

/// `x-kubernetes-list-type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ListType {
    Atomic,
    Set,
    /// Associative list keyed by `x-kubernetes-list-map-keys`.
    Map(Vec<String>),
}

/// Expected shape at one path of an object tree. Immutable once built and
/// shared through `Arc` by every conversion of the kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaNode {
    pub kind: NodeKind,
    /// Element schema of a list or map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element: Option<Arc<SchemaNode>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, Arc<SchemaNode>>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub required: BTreeSet<String>,
    /// `x-kubernetes-preserve-unknown-fields` on an object with properties.
    #[serde(default)]
    pub preserve_unknown: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_type: Option<ListType>,
}

impl SchemaNode {
    fn bare(kind: NodeKind) -> Self {
        Self {
            kind,
            element: None,
            fields: BTreeMap::new(),
            required: BTreeSet::new(),
            preserve_unknown: false,
            list_type: None,
        }
    }

    pub fn scalar(t: ScalarType) -> Self {
        Self::bare(NodeKind::Scalar(t))
    }

    pub fn any() -> Self {
        Self::bare(NodeKind::Any)
    }

    pub fn list(element: SchemaNode) -> Self {
        Self { element: Some(Arc::new(element)), ..Self::bare(NodeKind::List) }
    }

    pub fn map(element: SchemaNode) -> Self {
        Self { element: Some(Arc::new(element)), ..Self::bare(NodeKind::Map) }
    }

    pub fn object<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, SchemaNode)>,
        K: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(|(k, v)| (k.into(), Arc::new(v))).collect(),
            ..Self::bare(NodeKind::Object)
        }
    }

    pub fn with_required<I: IntoIterator<Item = S>, S: Into<String>>(mut self, names: I) -> Self {
        self.required.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn preserving_unknown(mut self) -> Self {
        self.preserve_unknown = true;
        self
    }

    pub fn field(&self, name: &str) -> Option<&Arc<SchemaNode>> {
        self.fields.get(name)
    }

    /// Element schema, or `Any` when none was published.
    pub fn element(&self) -> Arc<SchemaNode> {
        self.element.clone().unwrap_or_else(|| Arc::new(SchemaNode::any()))
    }

    /// Short description for messages: `string`, `list`, `object` ...
    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            NodeKind::Scalar(t) => t.name(),
            NodeKind::List => "list",
            NodeKind::Map => "map",
            NodeKind::Object => "object",
            NodeKind::Any => "any",
        }
    }

    /// Indented tree rendering used by `keelctl schema`.
    pub fn render_tree(&self) -> String {
        fn walk(node: &SchemaNode, name: &str, depth: usize, out: &mut String, budget: &mut usize) {
            if *budget == 0 {
                return;
            }
            *budget -= 1;
            out.push_str(&format!("{}{}: {}", "  ".repeat(depth), name, node.type_name()));
            match &node.list_type {
                Some(ListType::Set) => out.push_str(" (set)"),
                Some(ListType::Map(keys)) => out.push_str(&format!(" (map keyed by {})", keys.join(","))),
                _ => {}
            }
            if node.preserve_unknown {
                out.push_str(" (preserves unknown)");
            }
            out.push('\n');
            for (k, child) in &node.fields {
                let label = if node.required.contains(k) { format!("{k}*") } else { k.clone() };
                walk(child, &label, depth + 1, out, budget);
            }
            if let Some(el) = &node.element {
                walk(el, "[]", depth + 1, out, budget);
            }
        }
        let mut out = String::new();
        let mut budget = 2_000usize;
        walk(self, ".", 0, &mut out, &mut budget);
        if budget == 0 {
            out.push_str("...\n");
        }
        out
    }
}

/// Metadata node used when the published schema leaves `metadata` opaque
/// (CRDs always do).
pub fn object_meta() -> SchemaNode {
    let string = || SchemaNode::scalar(ScalarType::String);
    SchemaNode::object([
        ("name", string()),
        ("generateName", string()),
        ("namespace", string()),
        ("labels", SchemaNode::map(string())),
        ("annotations", SchemaNode::map(string())),
        ("finalizers", SchemaNode::list(string())),
        ("ownerReferences", SchemaNode::list(SchemaNode::any())),
    ])
    .preserving_unknown()
}
