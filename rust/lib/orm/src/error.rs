use terp_blob::BlobError;
use terp_core::ServiceError;
use thiserror::Error;

/// Errors produced by the recordset / field-computation core.
#[derive(Error, Debug)]
pub enum OrmError {
    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("unknown field: {model}.{field}")]
    UnknownField { model: String, field: String },

    #[error("expected a single record, got {0}")]
    MultipleRecords(usize),

    #[error("record does not exist or has been deleted: {model}({id})")]
    MissingRecord { model: String, id: i64 },

    #[error("cannot combine recordsets of {0} and {1}")]
    ModelMismatch(String, String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Constraint violation in a model declaration or input data.
    #[error("{0}")]
    Validation(String),

    /// A compute method finished without assigning a value it was
    /// declared to compute. Programming error in a business model —
    /// fail loudly, never default silently.
    #[error("compute method {method} left {model}.{field} unset for record {id}")]
    ComputeUnset {
        model: String,
        field: String,
        method: String,
        id: i64,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error("{0}")]
    Internal(String),
}

impl From<OrmError> for ServiceError {
    fn from(err: OrmError) -> Self {
        match err {
            OrmError::UnknownModel(_)
            | OrmError::UnknownField { .. }
            | OrmError::MissingRecord { .. } => ServiceError::NotFound(err.to_string()),
            OrmError::AccessDenied(_) => ServiceError::PermissionDenied(err.to_string()),
            OrmError::MultipleRecords(_)
            | OrmError::ModelMismatch(_, _)
            | OrmError::Validation(_) => ServiceError::Validation(err.to_string()),
            OrmError::Blob(BlobError::Collision(_)) => ServiceError::UserError(err.to_string()),
            OrmError::Storage(_) | OrmError::Blob(_) => ServiceError::Storage(err.to_string()),
            OrmError::ComputeUnset { .. } | OrmError::Internal(_) => {
                ServiceError::Internal(err.to_string())
            }
        }
    }
}
