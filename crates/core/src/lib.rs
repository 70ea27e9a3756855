//! Keel core types: identities, the two value models, field ownership, errors.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod host;
pub mod identity;
pub mod ownership;
pub mod path;
pub mod value;

use serde::{Deserialize, Serialize};

pub use config::{ApplyStrategy, EngineConfig, WaitConfig};
pub use error::{Error, ErrorKind, FieldConflict, KeelResult};
pub use host::{Attributes, HostValue};
pub use identity::{Gvk, ObjectName, ResourceIdentity};
pub use ownership::{FieldOwnership, FieldSet, ManagedEntry, ManagedOperation};
pub use path::{FieldPath, PathSegment};
pub use value::{DynamicMap, DynamicValue};

pub mod prelude {
    pub use super::{
        Baseline, DynamicValue, Error, ErrorKind, FieldOwnership, FieldPath, Gvk, HostValue, KeelResult,
        ObservedState, ResourceIdentity,
    };
}

/// The value this engine last applied to an identity. Host-persisted; the
/// engine receives it and hands back the successor.
pub type Baseline = DynamicValue;

/// Last fetched remote object with the ownership record active at fetch time.
/// Replaced wholesale on every fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedState {
    /// Full object without `metadata.managedFields`.
    pub value: DynamicValue,
    pub ownership: FieldOwnership,
    pub resource_version: Option<String>,
}

impl ObservedState {
    pub fn from_object(mut raw: DynamicValue) -> Self {
        let ownership = FieldOwnership::from_object(&raw);
        let resource_version = raw
            .get("metadata")
            .and_then(|m| m.get("resourceVersion"))
            .and_then(DynamicValue::as_str)
            .map(str::to_string);
        if let Some(meta) = raw.as_map_mut().and_then(|m| m.get_mut("metadata")).and_then(DynamicValue::as_map_mut) {
            meta.shift_remove("managedFields");
        }
        Self { value: raw, ownership, resource_version }
    }

    pub fn name(&self) -> Option<&str> {
        self.value.get("metadata").and_then(|m| m.get("name")).and_then(DynamicValue::as_str)
    }
}
