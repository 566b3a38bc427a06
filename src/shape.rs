//! Statement shape and bound values
//!
//! A statement is split into two parts:
//!
//! - its **shape**: everything that determines the query plan the server
//!   compiles (criteria, projection, ordering, grouping, update operations,
//!   whether a limit or offset is present, lock mode)
//! - its **arguments**: the values bound to placeholders plus the row count
//!   and offset of the limit clause
//!
//! Changing the shape invalidates a prepared plan. Changing the arguments
//! does not; a prepared plan is re-executed with the new arguments.
//!
//! Expressions are carried as opaque strings. Parsing them is the job of the
//! protocol layer that encodes the requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The CRUD operation a statement performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    /// Collection find
    Find,
    /// Collection modify
    Modify,
    /// Collection remove
    Remove,
    /// Table select
    Select,
    /// Table update
    Update,
    /// Table delete
    Delete,
}

impl StatementKind {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            StatementKind::Find => "find",
            StatementKind::Modify => "modify",
            StatementKind::Remove => "remove",
            StatementKind::Select => "select",
            StatementKind::Update => "update",
            StatementKind::Delete => "delete",
        }
    }

    /// Whether the statement returns rows
    pub fn returns_rows(&self) -> bool {
        matches!(self, StatementKind::Find | StatementKind::Select)
    }

    /// Whether the statement accepts update operations
    pub fn accepts_operations(&self) -> bool {
        matches!(self, StatementKind::Modify | StatementKind::Update)
    }
}

impl std::fmt::Display for StatementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The collection or table a statement runs against
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    /// Schema name
    pub schema: String,
    /// Collection or table name
    pub name: String,
}

impl Target {
    /// Create a new target
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "`{}`.`{}`", self.schema, self.name)
    }
}

/// How rows read by a statement are locked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// No row locking
    #[default]
    None,
    /// `FOR SHARE`
    Shared(LockContention),
    /// `FOR UPDATE`
    Exclusive(LockContention),
}

/// What a locking read does when a row is already locked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockContention {
    /// Wait for the lock
    #[default]
    Default,
    /// Fail immediately
    NoWait,
    /// Skip locked rows
    SkipLocked,
}

/// A single update applied by a modify or update statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum UpdateOperation {
    /// Set a document path or column to a value
    Set {
        /// Document path or column name
        path: String,
        /// New value
        value: Value,
    },
    /// Remove a document path
    Unset {
        /// Document path
        path: String,
    },
}

/// The plan-defining parts of a statement
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatementShape {
    /// Filter criteria expression
    pub criteria: Option<String>,
    /// Projected fields or columns
    pub projection: Vec<String>,
    /// Sort expressions, in order
    pub ordering: Vec<String>,
    /// Grouping expressions
    pub grouping: Vec<String>,
    /// Having criteria applied after grouping
    pub grouping_criteria: Option<String>,
    /// Update operations (modify and update only)
    pub operations: Vec<UpdateOperation>,
    /// Whether a row count limit is part of the statement
    pub has_limit: bool,
    /// Whether an offset is part of the statement
    pub has_offset: bool,
    /// Row locking mode
    pub lock: LockMode,
}

/// Values bound to named placeholders, in first-bind order
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundValues {
    entries: Vec<(String, Value)>,
}

impl BoundValues {
    /// Create an empty set of bindings
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a value, replacing any previous value for the placeholder
    ///
    /// Returns `true` if the placeholder was not bound before.
    pub fn bind(&mut self, name: impl Into<String>, value: impl Into<Value>) -> bool {
        let name = name.into();
        let value = value.into();
        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            entry.1 = value;
            return false;
        }
        self.entries.push((name, value));
        true
    }

    /// Look up the value bound to a placeholder
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Iterate over bindings in placeholder order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Number of bound placeholders
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is bound
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Arguments sent with every execution
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecuteArgs {
    /// Placeholder values
    pub values: BoundValues,
    /// Maximum number of rows
    pub limit: Option<u64>,
    /// Number of rows to skip
    pub offset: Option<u64>,
}

/// Everything the server needs to prepare or run a statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementDefinition {
    /// Kind of CRUD operation
    pub kind: StatementKind,
    /// Collection or table
    pub target: Target,
    /// Plan-defining parts
    pub shape: StatementShape,
}

impl StatementDefinition {
    /// Create a definition with an empty shape
    pub fn new(kind: StatementKind, target: Target) -> Self {
        Self {
            kind,
            target,
            shape: StatementShape::default(),
        }
    }

    /// Short description used in spans and logs
    pub fn describe(&self) -> String {
        format!("{} {}", self.kind, self.target)
    }
}
