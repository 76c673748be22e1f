//! Error types shared by every layer of the crate.

use thiserror::Error;

/// Result type for audit event operations
pub type AuditResult<T> = Result<T, AuditError>;

/// Errors that can occur while storing, searching or migrating audit events.
#[derive(Error, Debug)]
pub enum AuditError {
    /// The predicate tree contains a node in a position the grammar does not allow.
    #[error("unsupported predicate: {0}")]
    UnsupportedPredicate(String),

    /// The underlying store could not be reached.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The underlying store rejected the request because of its throughput limits.
    #[error("request throttled: {0}")]
    Throttled(String),

    /// A legacy `Fields` payload is not valid JSON.
    #[error("malformed legacy payload in session {session_id} at index {event_index}: {source}")]
    MalformedLegacyPayload {
        /// Session of the offending record.
        session_id: String,
        /// Index of the offending record.
        event_index: i64,
        /// Parser error.
        #[source]
        source: serde_json::Error,
    },

    /// A resumption token failed to decode or no longer matches the request.
    #[error("invalid checkpoint: {0}")]
    CheckpointInvalid(String),

    /// A table, index or item does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid configuration or request parameter.
    #[error("bad parameter: {0}")]
    BadParameter(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An error annotated with the operation that produced it.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<AuditError>,
    },
}

impl AuditError {
    /// Wrap the error with a description of the failing operation.
    pub fn context(self, context: impl Into<String>) -> Self {
        AuditError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through any `Context` layers.
    pub fn root(&self) -> &AuditError {
        match self {
            AuditError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether a retry of the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.root(),
            AuditError::StoreUnavailable(_) | AuditError::Throttled(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), AuditError::NotFound(_))
    }

    pub fn is_checkpoint_invalid(&self) -> bool {
        matches!(self.root(), AuditError::CheckpointInvalid(_))
    }
}

/// Attach operation context to the error side of a result.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> AuditResult<T>;

    fn with_context<F: FnOnce() -> String>(self, f: F) -> AuditResult<T>;
}

impl<T> ResultExt<T> for AuditResult<T> {
    fn context(self, context: impl Into<String>) -> AuditResult<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> AuditResult<T> {
        self.map_err(|e| e.context(f()))
    }
}
