//! Error taxonomy shared by every crate of the engine.
//!
//! Every error carries the [`ResourceIdentity`] it concerns (when known) and,
//! where one exists, the offending field path.

use serde::{Deserialize, Serialize};

use crate::identity::ResourceIdentity;
use crate::path::FieldPath;

/// One field another manager holds.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldConflict {
    pub path: FieldPath,
    /// Current owner of `path`.
    pub manager: String,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum ErrorKind {
    #[error("unknown kind {gvk}")]
    UnknownKind { gvk: String },
    #[error("discovery unavailable for {gvk}: {message}")]
    DiscoveryUnavailable { gvk: String, message: String },
    #[error("type mismatch at {path}: expected {expected}, found {found}")]
    TypeMismatch { path: FieldPath, expected: String, found: String },
    #[error("{}", conflict_message(.manager, .conflicts))]
    Conflict { manager: String, conflicts: Vec<FieldConflict> },
    #[error("not found: {what}")]
    NotFound { what: String },
    #[error("cancelled")]
    Cancelled,
    #[error("timed out after {polls} polls ({elapsed_ms} ms)")]
    TimedOut { polls: u32, elapsed_ms: u64 },
    #[error("failed: {reason}")]
    Failed { reason: String },
    #[error("invalid{}: {message}", .path.as_ref().map(|p| format!(" at {}", p)).unwrap_or_default())]
    Invalid { path: Option<FieldPath>, message: String },
    #[error("remote api error ({code}): {message}")]
    Remote { code: u16, message: String },
}

fn conflict_message(manager: &str, conflicts: &[FieldConflict]) -> String {
    let fields: Vec<String> = conflicts
        .iter()
        .map(|c| format!("{} (owned by {:?})", c.path, c.manager))
        .collect();
    format!(
        "apply by field manager {:?} conflicts on {} field(s): {}",
        manager,
        conflicts.len(),
        fields.join(", ")
    )
}

#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("{}{}", .identity.as_ref().map(|i| format!("{}: ", i)).unwrap_or_default(), .kind)]
pub struct Error {
    pub identity: Option<ResourceIdentity>,
    pub kind: ErrorKind,
}

pub type KeelResult<T> = Result<T, Error>;

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self { identity: None, kind }
    }

    /// Attach `identity` unless one is already recorded.
    pub fn with_identity(mut self, identity: &ResourceIdentity) -> Self {
        if self.identity.is_none() {
            self.identity = Some(identity.clone());
        }
        self
    }

    pub fn type_mismatch(path: &FieldPath, expected: impl Into<String>, found: impl Into<String>) -> Self {
        ErrorKind::TypeMismatch { path: path.clone(), expected: expected.into(), found: found.into() }.into()
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        ErrorKind::Invalid { path: None, message: message.into() }.into()
    }

    pub fn invalid_at(path: &FieldPath, message: impl Into<String>) -> Self {
        ErrorKind::Invalid { path: Some(path.clone()), message: message.into() }.into()
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        ErrorKind::NotFound { what: what.into() }.into()
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        ErrorKind::Failed { reason: reason.into() }.into()
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, ErrorKind::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self.kind, ErrorKind::Conflict { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }

    /// Transient failures the host may retry as-is. Conflicts are recoverable
    /// too, but only after a re-plan or with force, so they are not listed.
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            ErrorKind::DiscoveryUnavailable { .. } => true,
            // code 0: the request never got an HTTP response
            ErrorKind::Remote { code, .. } => *code == 0 || *code == 429 || *code >= 500,
            _ => false,
        }
    }

    /// Field path the error points at, if any.
    pub fn path(&self) -> Option<&FieldPath> {
        match &self.kind {
            ErrorKind::TypeMismatch { path, .. } => Some(path),
            ErrorKind::Invalid { path, .. } => path.as_ref(),
            _ => None,
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}
