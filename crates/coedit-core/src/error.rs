//! Error types for coedit core

use thiserror::Error;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Document not loaded: {0}")]
    DocumentNotLoaded(String),

    #[error("Invalid document ID: {0}")]
    InvalidDocumentId(String),

    #[error("Invalid connection ID: {0}")]
    InvalidConnectionId(String),

    #[error("CRDT error: {0}")]
    Crdt(String),

    #[error("Malformed awareness update: {0}")]
    Awareness(String),

    #[error("Update size exceeds limit: {size} > {limit}")]
    UpdateTooLarge { size: usize, limit: usize },
}

/// Result type alias for coedit core operations
pub type Result<T> = std::result::Result<T, Error>;
