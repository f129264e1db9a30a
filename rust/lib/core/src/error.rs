use thiserror::Error;

// ── Error codes ─────────────────────────────────────────────────────
//
// Stable, machine-readable identifiers. Callers match on these —
// never on the human-readable message string.

/// Stable error code constants.
///
/// Codes never change; messages may be reworded.
pub mod error_code {
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const VALIDATION_FAILED: &str = "VALIDATION_FAILED";
    pub const PERMISSION_DENIED: &str = "PERMISSION_DENIED";
    pub const USER_ERROR: &str = "USER_ERROR";
    pub const STORAGE_ERROR: &str = "STORAGE_ERROR";
    pub const INTERNAL: &str = "INTERNAL";
}

// ── ServiceError ────────────────────────────────────────────────────

/// Unified error type used across all crates in the workspace.
///
/// The taxonomy separates what the end user can act on from what only
/// a developer can act on:
///
/// - `UserError` — expected and recoverable (hash collision, malformed
///   input). Shown to the end user, never retried automatically.
/// - `Validation` — constraint violations with enough context to act on
///   (duplicate name, cyclic field dependency at registry build).
/// - `PermissionDenied` — access-control denial; propagates unchanged.
/// - `Internal` — engine invariant violations (a compute method left a
///   field unset). These indicate a programming error, fail loudly.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Record or resource does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Input or declaration violates a constraint.
    #[error("{0}")]
    Validation(String),

    /// Authenticated but lacks the required access right.
    #[error("{0}")]
    PermissionDenied(String),

    /// Expected, user-actionable error.
    #[error("{0}")]
    UserError(String),

    /// Storage backend failure.
    #[error("{0}")]
    Storage(String),

    /// Engine invariant violation or unexpected internal error.
    #[error("{0}")]
    Internal(String),
}

impl ServiceError {
    /// Stable, machine-readable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            ServiceError::NotFound(_) => error_code::NOT_FOUND,
            ServiceError::Validation(_) => error_code::VALIDATION_FAILED,
            ServiceError::PermissionDenied(_) => error_code::PERMISSION_DENIED,
            ServiceError::UserError(_) => error_code::USER_ERROR,
            ServiceError::Storage(_) => error_code::STORAGE_ERROR,
            ServiceError::Internal(_) => error_code::INTERNAL,
        }
    }

    /// Whether the error may be shown verbatim to an end user.
    ///
    /// Access-control and user errors bubble to the top of the request
    /// without modification; storage/internal errors are logged at the
    /// request boundary and reworded there.
    pub fn user_facing(&self) -> bool {
        matches!(
            self,
            ServiceError::UserError(_)
                | ServiceError::Validation(_)
                | ServiceError::PermissionDenied(_)
                | ServiceError::NotFound(_)
        )
    }
}
