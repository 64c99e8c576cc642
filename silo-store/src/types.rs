use std::{cmp::Ordering, fmt};

use serde::{Deserialize, Serialize};

/// Identifier of a stored message
///
/// Assigned by the store when the row is inserted and stable for the whole
/// life of the message, across every delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(i64);

impl MessageId {
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for MessageId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// A single column value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    Str(String),
    Blob(Vec<u8>),
}

impl Value {
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Text view of the value; blobs are decoded lossily
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Str(s) => Some(s.clone()),
            Self::Blob(b) => Some(String::from_utf8_lossy(b).into_owned()),
            Self::Int(i) => Some(i.to_string()),
            Self::Null => None,
        }
    }

    /// Ordering between two values of the same kind
    ///
    /// Values of different kinds are incomparable, so every ordered
    /// comparison against them is false.
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Str(a), Self::Str(b)) => Some(a.cmp(b)),
            (Self::Blob(a), Self::Blob(b)) => Some(a.cmp(b)),
            (Self::Null, Self::Null) => Some(Ordering::Equal),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<MessageId> for Value {
    fn from(v: MessageId) -> Self {
        Self::Int(v.get())
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// One result row, values in the order the columns were requested
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row(pub Vec<Value>);

impl Row {
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    pub fn int(&self, index: usize) -> Option<i64> {
        self.get(index).and_then(Value::as_int)
    }

    pub fn text(&self, index: usize) -> Option<String> {
        self.get(index).and_then(Value::as_text)
    }

    pub fn message_id(&self, index: usize) -> Option<MessageId> {
        self.int(index).map(MessageId::new)
    }
}

/// Comparison operator of a filter condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Neq,
    Lt,
    Leq,
    Gt,
    Geq,
    /// Membership in a list of values
    In,
}

/// `column <op> value`; a filter is the conjunction of its conditions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub column: String,
    pub op: Op,
    pub values: Vec<Value>,
}

impl Condition {
    pub fn new(column: impl Into<String>, op: Op, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            op,
            values: vec![value.into()],
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, Op::Eq, value)
    }

    pub fn any_of<V: Into<Value>>(
        column: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self {
            column: column.into(),
            op: Op::In,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Evaluate this condition against a column value
    pub fn matches(&self, value: &Value) -> bool {
        let Some(expected) = self.values.first() else {
            return false;
        };

        match self.op {
            Op::In => self.values.iter().any(|v| v == value),
            Op::Eq => value == expected,
            Op::Neq => value != expected,
            Op::Lt => value.compare(expected) == Some(Ordering::Less),
            Op::Leq => matches!(
                value.compare(expected),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Op::Gt => value.compare(expected) == Some(Ordering::Greater),
            Op::Geq => matches!(
                value.compare(expected),
                Some(Ordering::Greater | Ordering::Equal)
            ),
        }
    }
}
