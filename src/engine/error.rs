use ulid::Ulid;

use crate::model::{CelebrantId, ConflictRecord, LocationId};
use crate::validation::FieldError;

#[derive(Debug)]
pub enum EngineError {
    WeddingNotFound(Ulid),
    LocationNotFound(LocationId),
    CelebrantNotFound(CelebrantId),
    /// A location or celebrant with the same name already exists.
    AlreadyExists(String),
    /// The candidate booking violates one or more scheduling rules.
    Conflicts(Vec<ConflictRecord>),
    /// An individual booking already holds this slot; raised by the store's
    /// uniqueness index, independently of evaluation.
    SlotTaken(Ulid),
    ConfigUnavailable(String),
    StoreQueryFailed(String),
    InvalidInput(Vec<FieldError>),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        EngineError::InvalidInput(vec![FieldError::new(field, message)])
    }
}

impl From<Vec<FieldError>> for EngineError {
    fn from(errors: Vec<FieldError>) -> Self {
        EngineError::InvalidInput(errors)
    }
}

impl From<FieldError> for EngineError {
    fn from(error: FieldError) -> Self {
        EngineError::InvalidInput(vec![error])
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::WeddingNotFound(id) => write!(f, "wedding not found: {id}"),
            EngineError::LocationNotFound(id) => write!(f, "location not found: {id}"),
            EngineError::CelebrantNotFound(id) => write!(f, "celebrant not found: {id}"),
            EngineError::AlreadyExists(what) => write!(f, "already exists: {what}"),
            EngineError::Conflicts(conflicts) => {
                write!(f, "scheduling conflict")?;
                for (i, c) in conflicts.iter().enumerate() {
                    let sep = if i == 0 { ": " } else { "; " };
                    write!(f, "{sep}[{}] {}", c.kind.code(), c.message)?;
                }
                Ok(())
            }
            EngineError::SlotTaken(id) => write!(f, "slot already taken by wedding {id}"),
            EngineError::ConfigUnavailable(e) => write!(f, "capacity configuration unavailable: {e}"),
            EngineError::StoreQueryFailed(e) => write!(f, "booking store query failed: {e}"),
            EngineError::InvalidInput(errors) => {
                write!(f, "invalid input")?;
                for (i, e) in errors.iter().enumerate() {
                    let sep = if i == 0 { ": " } else { "; " };
                    write!(f, "{sep}{e}")?;
                }
                Ok(())
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
