//! Error types for the silo-store crate.

use thiserror::Error;

use crate::MessageId;

/// Top-level store error type.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No table has been selected with `use_table`, or the table is unknown.
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    /// A filter or projection referenced a column the table does not have.
    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    /// Row not found.
    #[error("Message not found: {0}")]
    NotFound(MessageId),

    /// The raw query could not be understood by this backend.
    #[error("Unsupported query: {0}")]
    UnsupportedQuery(String),

    /// The store refused to grow any further.
    #[error("Store capacity exceeded: {used}/{capacity} rows")]
    CapacityExceeded { used: usize, capacity: usize },

    /// Backend unavailable (connection lost, injected fault, ...).
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Specialized `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::CapacityExceeded {
            used: 10,
            capacity: 10,
        };
        assert_eq!(err.to_string(), "Store capacity exceeded: 10/10 rows");

        let err = StoreError::NotFound(MessageId::new(7));
        assert!(err.to_string().contains('7'));
    }
}
