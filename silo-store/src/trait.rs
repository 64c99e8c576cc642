use crate::{Condition, MessageId, Result, Row, Value};

/// A source of store connections
///
/// Connections are not shared between threads: every worker, and the timer
/// side, asks for its own.
pub trait Store: Send + Sync + std::fmt::Debug {
    /// Open a new connection
    ///
    /// # Errors
    /// If the backend cannot be reached
    fn connect(&self) -> Result<Box<dyn Connection>>;
}

/// A single connection to the row store
///
/// All operations act on the table selected by the last `use_table`.
pub trait Connection: Send {
    /// Select the table subsequent operations act on
    ///
    /// # Errors
    /// If the table does not exist
    fn use_table(&mut self, table: &str) -> Result<()>;

    /// Insert a row and return its newly assigned identifier
    ///
    /// # Errors
    /// If a column is unknown or the backend refuses the write
    fn insert(&mut self, values: &[(&str, Value)]) -> Result<MessageId>;

    /// Select `columns` from every row matching all of `filter`
    ///
    /// # Errors
    /// If a column is unknown or the backend is unavailable
    fn query(
        &mut self,
        filter: &[Condition],
        columns: &[&str],
        order_by: Option<&str>,
    ) -> Result<Vec<Row>>;

    /// Run a raw SELECT statement
    ///
    /// # Errors
    /// If the statement cannot be executed
    fn raw_query(&mut self, sql: &str) -> Result<Vec<Row>>;

    /// Set `values` on every row matching `filter`, returning the count updated
    ///
    /// # Errors
    /// If a column is unknown or the backend is unavailable
    fn update(&mut self, filter: &[Condition], values: &[(&str, Value)]) -> Result<usize>;

    /// Delete every row matching `filter`, returning the count deleted
    ///
    /// # Errors
    /// If a column is unknown or the backend is unavailable
    fn delete(&mut self, filter: &[Condition]) -> Result<usize>;
}
