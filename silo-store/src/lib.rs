//! Row store used to persist offline messages
//!
//! The delivery pipeline only depends on the [`Store`] / [`Connection`] pair;
//! backends decide where rows actually live.

pub mod backends;
pub mod config;
pub mod error;
pub mod schema;
pub mod r#trait;
pub mod types;

pub use backends::{MemoryStore, Operation, TestStore};
pub use config::{MemoryConfig, StoreConfig};
pub use error::{Result, StoreError};
pub use schema::Schema;
pub use r#trait::{Connection, Store};
pub use types::{Condition, MessageId, Op, Row, Value};
