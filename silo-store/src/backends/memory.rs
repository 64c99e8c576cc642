use std::{collections::BTreeMap, sync::Arc};

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::{
    Condition, Connection, MessageId, Row, Schema, Store, StoreError, Value, error::Result,
};

/// A single table: ordered column names and rows keyed by identifier
#[derive(Debug, Clone)]
pub(crate) struct Table {
    columns: Vec<String>,
    rows: BTreeMap<i64, Vec<Value>>,
    next_id: i64,
}

impl Table {
    fn new(id_column: &str, columns: &[&str]) -> Self {
        let mut all = Vec::with_capacity(columns.len() + 1);
        all.push(id_column.to_string());
        all.extend(columns.iter().map(|c| (*c).to_string()));

        Self {
            columns: all,
            rows: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn column(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| StoreError::UnknownColumn(name.to_string()))
    }

    fn matcher<'a>(&self, filter: &'a [Condition]) -> Result<Vec<(usize, &'a Condition)>> {
        filter
            .iter()
            .map(|cond| Ok((self.column(&cond.column)?, cond)))
            .collect()
    }

    fn matching_ids(&self, filter: &[Condition]) -> Result<Vec<i64>> {
        let matcher = self.matcher(filter)?;

        Ok(self
            .rows
            .iter()
            .filter(|(_, row)| matcher.iter().all(|(i, cond)| cond.matches(&row[*i])))
            .map(|(id, _)| *id)
            .collect())
    }

    fn project(&self, ids: &[i64], columns: &[&str], order_by: Option<&str>) -> Result<Vec<Row>> {
        let indices = columns
            .iter()
            .map(|c| self.column(c))
            .collect::<Result<Vec<_>>>()?;

        let mut rows: Vec<&Vec<Value>> = ids.iter().filter_map(|id| self.rows.get(id)).collect();

        if let Some(order) = order_by {
            let index = self.column(order)?;
            rows.sort_by(|a, b| {
                a[index]
                    .compare(&b[index])
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        Ok(rows
            .into_iter()
            .map(|row| Row(indices.iter().map(|i| row[*i].clone()).collect()))
            .collect())
    }
}

/// In-memory backing store
///
/// Tables live in a `HashMap` behind an `RwLock` shared by every connection
/// handed out by [`MemoryStore::connect`]. Rows are kept ordered by
/// identifier.
///
/// # Capacity Management
/// An optional capacity bounds the number of rows per table; inserts beyond
/// it fail with [`StoreError::CapacityExceeded`].
#[derive(Debug, Clone)]
pub struct MemoryStore {
    pub(crate) tables: Arc<RwLock<AHashMap<String, Table>>>,
    capacity: Option<usize>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(&Schema::default())
    }
}

impl MemoryStore {
    /// Create a store holding an empty message table laid out by `schema`
    #[must_use]
    pub fn new(schema: &Schema) -> Self {
        let store = Self {
            tables: Arc::new(RwLock::new(AHashMap::new())),
            capacity: None,
        };
        store.create_table(schema.table.as_str(), &schema.mid, &schema.data_columns());
        store
    }

    /// Create a store with a per-table row limit
    #[must_use]
    pub fn with_capacity(schema: &Schema, capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::new(schema)
        }
    }

    /// Create (or replace) a table
    pub fn create_table(&self, name: &str, id_column: &str, columns: &[&str]) {
        self.tables
            .write()
            .insert(name.to_string(), Table::new(id_column, columns));
    }

    /// Number of rows in `table`, 0 when it does not exist
    #[must_use]
    pub fn len(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, |t| t.rows.len())
    }

    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

impl Store for MemoryStore {
    fn connect(&self) -> Result<Box<dyn Connection>> {
        Ok(Box::new(MemoryConnection {
            store: self.clone(),
            table: None,
        }))
    }
}

/// Connection to a [`MemoryStore`]
#[derive(Debug)]
pub struct MemoryConnection {
    store: MemoryStore,
    table: Option<String>,
}

impl MemoryConnection {
    fn table_name(&self) -> Result<&str> {
        self.table
            .as_deref()
            .ok_or_else(|| StoreError::UnknownTable("<none selected>".to_string()))
    }

    fn with_table<T>(&self, f: impl FnOnce(&Table) -> Result<T>) -> Result<T> {
        let name = self.table_name()?;
        let tables = self.store.tables.read();
        let table = tables
            .get(name)
            .ok_or_else(|| StoreError::UnknownTable(name.to_string()))?;
        f(table)
    }

    fn with_table_mut<T>(&self, f: impl FnOnce(&mut Table) -> Result<T>) -> Result<T> {
        let name = self.table_name()?;
        let mut tables = self.store.tables.write();
        let table = tables
            .get_mut(name)
            .ok_or_else(|| StoreError::UnknownTable(name.to_string()))?;
        f(table)
    }
}

impl Connection for MemoryConnection {
    fn use_table(&mut self, table: &str) -> Result<()> {
        if !self.store.tables.read().contains_key(table) {
            return Err(StoreError::UnknownTable(table.to_string()));
        }
        self.table = Some(table.to_string());
        Ok(())
    }

    fn insert(&mut self, values: &[(&str, Value)]) -> Result<MessageId> {
        let capacity = self.store.capacity;

        self.with_table_mut(|table| {
            if let Some(capacity) = capacity
                && table.rows.len() >= capacity
            {
                return Err(StoreError::CapacityExceeded {
                    used: table.rows.len(),
                    capacity,
                });
            }

            let mut row = vec![Value::Null; table.columns.len()];
            for (column, value) in values {
                row[table.column(column)?] = value.clone();
            }

            let id = match row[0].as_int() {
                Some(explicit) => explicit,
                None => table.next_id,
            };
            row[0] = Value::Int(id);
            table.next_id = table.next_id.max(id + 1);
            table.rows.insert(id, row);

            Ok(MessageId::new(id))
        })
    }

    fn query(
        &mut self,
        filter: &[Condition],
        columns: &[&str],
        order_by: Option<&str>,
    ) -> Result<Vec<Row>> {
        self.with_table(|table| {
            let ids = table.matching_ids(filter)?;
            table.project(&ids, columns, order_by)
        })
    }

    fn raw_query(&mut self, sql: &str) -> Result<Vec<Row>> {
        let select = Select::parse(sql)?;
        let tables = self.store.tables.read();
        let table = tables
            .get(&select.table)
            .ok_or_else(|| StoreError::UnknownTable(select.table.clone()))?;

        let predicates = select
            .predicates
            .iter()
            .map(|(column, value)| Ok((table.column(column)?, Value::Int(*value))))
            .collect::<Result<Vec<_>>>()?;

        let ids: Vec<i64> = table
            .rows
            .iter()
            .filter(|(_, row)| {
                predicates.is_empty() || predicates.iter().any(|(i, value)| &row[*i] == value)
            })
            .map(|(id, _)| *id)
            .collect();

        let columns: Vec<&str> = select.columns.iter().map(String::as_str).collect();
        table.project(&ids, &columns, select.order_by.as_deref())
    }

    fn update(&mut self, filter: &[Condition], values: &[(&str, Value)]) -> Result<usize> {
        self.with_table_mut(|table| {
            let ids = table.matching_ids(filter)?;
            let targets = values
                .iter()
                .map(|(column, value)| Ok((table.column(column)?, value)))
                .collect::<Result<Vec<_>>>()?;

            for id in &ids {
                if let Some(row) = table.rows.get_mut(id) {
                    for (index, value) in &targets {
                        row[*index] = (*value).clone();
                    }
                }
            }

            Ok(ids.len())
        })
    }

    fn delete(&mut self, filter: &[Condition]) -> Result<usize> {
        self.with_table_mut(|table| {
            let ids = table.matching_ids(filter)?;
            for id in &ids {
                table.rows.remove(id);
            }
            Ok(ids.len())
        })
    }
}

/// The single raw statement shape this backend understands:
///
/// ```sql
/// SELECT `a`, `b` FROM `t` WHERE `a`=1 OR `a`=2 ORDER BY `a`
/// ```
#[derive(Debug, PartialEq, Eq)]
struct Select {
    columns: Vec<String>,
    table: String,
    predicates: Vec<(String, i64)>,
    order_by: Option<String>,
}

fn identifier(token: &str) -> String {
    token.trim().trim_matches(',').trim_matches('`').to_string()
}

impl Select {
    fn parse(sql: &str) -> Result<Self> {
        let unsupported = || StoreError::UnsupportedQuery(sql.to_string());
        let mut tokens = sql.split_whitespace().peekable();

        if !tokens.next().is_some_and(|t| t.eq_ignore_ascii_case("SELECT")) {
            return Err(unsupported());
        }

        let mut columns = Vec::new();
        for token in tokens.by_ref() {
            if token.eq_ignore_ascii_case("FROM") {
                break;
            }
            columns.extend(
                token
                    .split(',')
                    .map(identifier)
                    .filter(|column| !column.is_empty()),
            );
        }

        let table = tokens.next().map(identifier).ok_or_else(unsupported)?;
        if columns.is_empty() || table.is_empty() {
            return Err(unsupported());
        }

        let mut predicates = Vec::new();
        let mut order_by = None;

        while let Some(token) = tokens.next() {
            if token.eq_ignore_ascii_case("WHERE") {
                let mut clause = Vec::new();
                while let Some(next) = tokens.peek() {
                    if next.eq_ignore_ascii_case("ORDER") {
                        break;
                    }
                    clause.push(*next);
                    tokens.next();
                }

                for predicate in clause.join(" ").split(" OR ") {
                    let (column, value) = predicate.split_once('=').ok_or_else(unsupported)?;
                    let value = value.trim().parse::<i64>().map_err(|_| unsupported())?;
                    predicates.push((identifier(column), value));
                }
            } else if token.eq_ignore_ascii_case("ORDER") {
                if !tokens.next().is_some_and(|t| t.eq_ignore_ascii_case("BY")) {
                    return Err(unsupported());
                }
                order_by = Some(tokens.next().map(identifier).ok_or_else(unsupported)?);
            } else {
                return Err(unsupported());
            }
        }

        Ok(Self {
            columns,
            table,
            predicates,
            order_by,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::Op;

    fn insert_message(conn: &mut dyn Connection, schema: &Schema, user: &str, body: &str) -> MessageId {
        conn.insert(&[
            (schema.uri_user.as_str(), Value::from(user)),
            (schema.uri_host.as_str(), Value::from("example.org")),
            (schema.body.as_str(), Value::Blob(body.as_bytes().to_vec())),
            (schema.snd_time.as_str(), Value::Int(0)),
            (schema.exp_time.as_str(), Value::Int(100)),
        ])
        .expect("insert")
    }

    #[test]
    fn test_memory_store_basic_operations() {
        let schema = Schema::default();
        let store = MemoryStore::new(&schema);
        let mut conn = store.connect().unwrap();
        conn.use_table(&schema.table).unwrap();

        let first = insert_message(conn.as_mut(), &schema, "alice", "hello");
        let second = insert_message(conn.as_mut(), &schema, "bob", "world");
        assert_eq!(first, MessageId::new(1));
        assert_eq!(second, MessageId::new(2));
        assert_eq!(store.len(&schema.table), 2);

        let rows = conn
            .query(
                &[Condition::eq(schema.uri_user.as_str(), "bob")],
                &[schema.mid.as_str(), schema.body.as_str()],
                Some(schema.mid.as_str()),
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].message_id(0), Some(second));
        assert_eq!(rows[0].text(1).as_deref(), Some("world"));

        let updated = conn
            .update(
                &[Condition::eq(schema.mid.as_str(), first)],
                &[(schema.snd_time.as_str(), Value::Int(42))],
            )
            .unwrap();
        assert_eq!(updated, 1);

        let deleted = conn
            .delete(&[Condition::new(schema.snd_time.as_str(), Op::Leq, 0_i64)])
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.len(&schema.table), 1);
    }

    #[test]
    fn test_unknown_table_and_column() {
        let schema = Schema::default();
        let store = MemoryStore::new(&schema);
        let mut conn = store.connect().unwrap();

        assert!(matches!(
            conn.insert(&[("body", Value::Null)]),
            Err(StoreError::UnknownTable(_))
        ));
        assert!(matches!(
            conn.use_table("nope"),
            Err(StoreError::UnknownTable(_))
        ));

        conn.use_table(&schema.table).unwrap();
        assert!(matches!(
            conn.delete(&[Condition::eq("nope", 1_i64)]),
            Err(StoreError::UnknownColumn(_))
        ));
    }

    #[test]
    fn test_capacity_limit() {
        let schema = Schema::default();
        let store = MemoryStore::with_capacity(&schema, 1);
        let mut conn = store.connect().unwrap();
        conn.use_table(&schema.table).unwrap();

        insert_message(conn.as_mut(), &schema, "alice", "one");
        let err = conn
            .insert(&[(schema.uri_user.as_str(), Value::from("alice"))])
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::CapacityExceeded {
                used: 1,
                capacity: 1
            }
        ));
    }

    #[test]
    fn test_raw_query_batch_shape() {
        let schema = Schema::default();
        let store = MemoryStore::new(&schema);
        let mut conn = store.connect().unwrap();
        conn.use_table(&schema.table).unwrap();

        for user in ["a", "b", "c", "d"] {
            insert_message(conn.as_mut(), &schema, user, user);
        }

        let rows = conn
            .raw_query("SELECT `id`, `username` FROM `silo` WHERE `id`=4 OR `id`=2 ORDER BY `id`")
            .unwrap();

        assert_eq!(
            rows,
            vec![
                Row(vec![Value::Int(2), Value::from("b")]),
                Row(vec![Value::Int(4), Value::from("d")]),
            ]
        );
    }

    #[test]
    fn test_raw_query_rejects_other_shapes() {
        let schema = Schema::default();
        let store = MemoryStore::new(&schema);
        let mut conn = store.connect().unwrap();

        for sql in [
            "DELETE FROM `silo`",
            "SELECT FROM `silo`",
            "SELECT `id` FROM `silo` WHERE `id`='x'",
            "SELECT `id` FROM `silo` WHERE `id`=1 GROUP BY `id`",
        ] {
            assert!(
                matches!(conn.raw_query(sql), Err(StoreError::UnsupportedQuery(_))),
                "{sql} should be rejected"
            );
        }
    }

    #[test]
    fn test_select_parse_tolerates_spacing() {
        let select =
            Select::parse("SELECT `id`,`body` FROM `silo` WHERE  `id`=3  OR  `id`=5  ORDER BY `id`")
                .unwrap();

        assert_eq!(
            select,
            Select {
                columns: vec!["id".to_string(), "body".to_string()],
                table: "silo".to_string(),
                predicates: vec![("id".to_string(), 3), ("id".to_string(), 5)],
                order_by: Some("id".to_string()),
            }
        );
    }
}
