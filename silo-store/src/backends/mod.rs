//! Backend implementations for the row store
//!
//! - `memory`: in-memory tables, for development and transient deployments
//! - `test`: wraps `memory` with mutation accounting and fault injection

pub mod memory;

pub use memory::MemoryStore;
pub use test::{Operation, TestStore};
