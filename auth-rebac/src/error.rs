use thiserror::Error;

/// Error taxonomy for the authorization core.
///
/// Depth-limit and traversal-cycle conditions never surface here: they
/// produce conservative denials and a diagnostic event. Cache failures are
/// logged and swallowed; the compute path is authoritative.
#[derive(Error, Debug)]
pub enum RebacError {
    /// Malformed entities, unknown subject-relation syntax, empty ids,
    /// relations not declared by the object type's namespace.
    #[error("validation error: {0}")]
    Validation(String),

    /// Disallowed cross-zone write.
    #[error("zone isolation violation: {message}")]
    ZoneIsolation {
        message: String,
        subject_zone: Option<String>,
        object_zone: Option<String>,
    },

    /// A parent-relation write would create a cycle.
    #[error("cycle detected: {0}")]
    Cycle(String),

    /// Schema references an undefined relation, or a schema document failed
    /// to parse.
    #[error("namespace error: {0}")]
    Namespace(String),

    /// Underlying persistence fault, surfaced after bounded retries.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RebacError {
    pub fn zone_isolation(
        message: impl Into<String>,
        subject_zone: Option<&str>,
        object_zone: Option<&str>,
    ) -> Self {
        RebacError::ZoneIsolation {
            message: message.into(),
            subject_zone: subject_zone.map(str::to_string),
            object_zone: object_zone.map(str::to_string),
        }
    }
}

pub type Result<T> = std::result::Result<T, RebacError>;
