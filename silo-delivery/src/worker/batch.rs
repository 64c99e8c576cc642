//! Batched reload query
//!
//! One statement fetches every message of a batch:
//!
//! ```sql
//! SELECT `id`, `src_addr`, `dst_addr`, `body`, `ctype`, `inc_time` FROM `silo` WHERE `id`=3 OR `id`=5 ORDER BY `id`
//! ```

use std::fmt::Write;

use silo_store::{MessageId, Schema};

use crate::error::QueryError;

/// Upper bound on the statement length, in bytes
pub const MAX_QUERY_LEN: usize = 2048;

/// Column positions in the rows returned by the reload query
pub mod column {
    pub const MID: usize = 0;
    pub const FROM: usize = 1;
    pub const TO: usize = 2;
    pub const BODY: usize = 3;
    pub const CTYPE: usize = 4;
    pub const INC_TIME: usize = 5;
}

/// Build the reload statement for `ids`, ascending by identifier
///
/// # Errors
/// [`QueryError::EmptyBatch`] without identifiers and
/// [`QueryError::TooLong`] once the statement would exceed
/// [`MAX_QUERY_LEN`]. A partial statement is never returned.
pub fn build_reload_query(schema: &Schema, ids: &[MessageId]) -> Result<String, QueryError> {
    build_bounded(schema, ids, MAX_QUERY_LEN)
}

/// Most identifiers a reload statement is guaranteed to hold
///
/// Assumes every identifier prints at its widest, so any batch of this size
/// builds within [`MAX_QUERY_LEN`].
pub fn max_batch_size(schema: &Schema) -> usize {
    max_batch_size_bounded(schema, MAX_QUERY_LEN)
}

fn max_batch_size_bounded(schema: &Schema, limit: usize) -> usize {
    let fixed = header(schema).len() + footer(schema).len();
    let predicate = predicate(schema, MessageId::new(i64::MIN)).len();

    // n predicates need n - 1 separators
    (limit + OR.len())
        .checked_sub(fixed)
        .map_or(0, |room| room / (predicate + OR.len()))
}

const OR: &str = " OR ";

fn header(schema: &Schema) -> String {
    format!(
        "SELECT `{}`, `{}`, `{}`, `{}`, `{}`, `{}` FROM `{}` WHERE ",
        schema.mid, schema.from, schema.to, schema.body, schema.ctype, schema.inc_time, schema.table
    )
}

fn footer(schema: &Schema) -> String {
    format!(" ORDER BY `{}`", schema.mid)
}

fn predicate(schema: &Schema, id: MessageId) -> String {
    format!("`{}`={}", schema.mid, id.get())
}

fn build_bounded(schema: &Schema, ids: &[MessageId], limit: usize) -> Result<String, QueryError> {
    if ids.is_empty() {
        return Err(QueryError::EmptyBatch);
    }

    let mut sorted = ids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut sql = header(schema);

    for (i, id) in sorted.iter().enumerate() {
        if i > 0 {
            sql.push_str(OR);
        }
        write!(sql, "`{}`={}", schema.mid, id.get())?;

        if sql.len() > limit {
            return Err(QueryError::TooLong { limit });
        }
    }

    sql.push_str(&footer(schema));

    if sql.len() > limit {
        return Err(QueryError::TooLong { limit });
    }

    Ok(sql)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn ids(raw: &[i64]) -> Vec<MessageId> {
        raw.iter().copied().map(MessageId::new).collect()
    }

    #[test]
    fn test_predicates_are_ascending() {
        let sql = build_reload_query(&Schema::default(), &ids(&[5, 3, 9])).unwrap();

        assert_eq!(
            sql,
            "SELECT `id`, `src_addr`, `dst_addr`, `body`, `ctype`, `inc_time` FROM `silo` \
             WHERE `id`=3 OR `id`=5 OR `id`=9 ORDER BY `id`"
        );
        assert_eq!(sql.matches(" OR ").count(), 2);
        assert_eq!(sql.matches("`id`=").count(), 3);
    }

    #[test]
    fn test_empty_batch_fails() {
        assert_eq!(
            build_reload_query(&Schema::default(), &[]),
            Err(QueryError::EmptyBatch)
        );
    }

    #[test]
    fn test_fails_closed_when_too_long() {
        let schema = Schema::default();
        let batch = ids(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);

        let full = build_reload_query(&schema, &batch).unwrap();
        assert!(build_bounded(&schema, &batch, full.len()).is_ok());
        assert_eq!(
            build_bounded(&schema, &batch, full.len() - 1),
            Err(QueryError::TooLong {
                limit: full.len() - 1
            })
        );
        assert_eq!(
            build_bounded(&schema, &batch, 40),
            Err(QueryError::TooLong { limit: 40 })
        );
    }

    #[test]
    fn test_uses_configured_schema() {
        let schema = Schema {
            table: "offline".to_string(),
            mid: "msg_id".to_string(),
            ..Schema::default()
        };

        let sql = build_reload_query(&schema, &ids(&[7])).unwrap();
        assert!(sql.ends_with("FROM `offline` WHERE `msg_id`=7 ORDER BY `msg_id`"));
    }

    #[test]
    fn test_max_batch_size_always_fits() {
        let schema = Schema::default();
        let max = max_batch_size(&schema);
        assert!(max >= 10);

        // Widest identifiers there are
        let widest: Vec<MessageId> = (0..=max)
            .map(|i| MessageId::new(i64::MIN + i64::try_from(i).unwrap()))
            .collect();

        let sql = build_reload_query(&schema, &widest[..max]).unwrap();
        assert!(sql.len() <= MAX_QUERY_LEN);
        assert_eq!(
            build_reload_query(&schema, &widest),
            Err(QueryError::TooLong {
                limit: MAX_QUERY_LEN
            })
        );
    }

    #[test]
    fn test_max_batch_size_with_no_room() {
        assert_eq!(max_batch_size_bounded(&Schema::default(), 10), 0);
    }
}
