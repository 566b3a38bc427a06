//! The requests the lifecycle sends to the server
//!
//! Message framing, expression encoding and the transport live behind
//! [`PreparedStatementProtocol`]. The lifecycle only decides *which* of the
//! four requests to send and in what order.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::shape::{ExecuteArgs, StatementDefinition};

/// A result row
pub type Row = Vec<Value>;

/// Column metadata sent ahead of result rows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    /// Column name or alias
    pub name: String,
    /// Server type name
    pub column_type: String,
}

impl ColumnMetadata {
    /// Create column metadata
    pub fn new(name: impl Into<String>, column_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_type: column_type.into(),
        }
    }
}

/// A warning attached to a statement result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    /// Warning level (`note`, `warning`, `error`)
    pub level: String,
    /// Server code
    pub code: u16,
    /// Message text
    pub message: String,
}

/// Execution details reported once a statement has run
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServerDetails {
    /// Rows or documents changed
    pub affected_items_count: u64,
    /// Value generated for an auto increment column
    pub auto_increment_value: Option<u64>,
    /// Document ids generated by the server
    pub generated_document_ids: Vec<String>,
    /// Warnings raised while running the statement
    pub warnings: Vec<Warning>,
}

/// Callbacks receiving rows and column metadata as they arrive
#[derive(Default)]
pub struct ResultHandlers<'a> {
    /// Called once per row
    pub on_row: Option<&'a mut (dyn FnMut(Row) + Send)>,
    /// Called once per result set, before its rows
    pub on_metadata: Option<&'a mut (dyn FnMut(&[ColumnMetadata]) + Send)>,
}

impl<'a> ResultHandlers<'a> {
    /// No callbacks
    pub fn none() -> Self {
        Self::default()
    }

    /// Receive rows
    pub fn with_rows(mut self, on_row: &'a mut (dyn FnMut(Row) + Send)) -> Self {
        self.on_row = Some(on_row);
        self
    }

    /// Receive column metadata
    pub fn with_metadata(
        mut self,
        on_metadata: &'a mut (dyn FnMut(&[ColumnMetadata]) + Send),
    ) -> Self {
        self.on_metadata = Some(on_metadata);
        self
    }

    /// Deliver a result set to whichever callbacks are present
    pub fn deliver(&mut self, columns: &[ColumnMetadata], rows: Vec<Row>) {
        if let Some(on_metadata) = self.on_metadata.as_mut() {
            on_metadata(columns);
        }
        if let Some(on_row) = self.on_row.as_mut() {
            for row in rows {
                on_row(row);
            }
        }
    }
}

impl std::fmt::Debug for ResultHandlers<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultHandlers")
            .field("on_row", &self.on_row.is_some())
            .field("on_metadata", &self.on_metadata.is_some())
            .finish()
    }
}

/// Server requests used by the statement lifecycle
///
/// Implementations own the connection; the lifecycle awaits each request to
/// completion before sending the next one for the same statement.
#[async_trait]
pub trait PreparedStatementProtocol: Send + Sync {
    /// Run a statement without preparing it
    async fn execute_plain(
        &self,
        statement: &StatementDefinition,
        args: &ExecuteArgs,
        handlers: ResultHandlers<'_>,
    ) -> Result<ServerDetails>;

    /// Ask the server to compile `statement` under `statement_id`
    async fn prepare(&self, statement_id: u32, statement: &StatementDefinition) -> Result<()>;

    /// Run the plan registered under `statement_id` with new arguments
    async fn execute_prepared(
        &self,
        statement_id: u32,
        args: &ExecuteArgs,
        handlers: ResultHandlers<'_>,
    ) -> Result<ServerDetails>;

    /// Drop the plan registered under `statement_id`
    async fn deallocate(&self, statement_id: u32) -> Result<()>;
}
