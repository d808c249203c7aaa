use crate::{ItemId, WorkStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Payload size exceeds maximum allowed size of {max} bytes (got {actual})")]
    PayloadTooLarge { max: usize, actual: usize },

    #[error("Invalid status transition for item {id}: {from} -> {to}")]
    InvalidTransition {
        id: ItemId,
        from: WorkStatus,
        to: WorkStatus,
    },

    #[error("Unknown work status: {0}")]
    UnknownStatus(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;
