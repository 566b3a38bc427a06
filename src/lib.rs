//! # MySQL X Protocol prepared statements
//!
//! This crate decides when CRUD statements sent over the X Protocol are run
//! as plain requests and when they are promoted to server side prepared
//! statements.
//!
//! ## Lifecycle
//!
//! - The first execution of a statement is always plain.
//! - The second execution prepares it under a session unique id and runs the
//!   plan; later executions only send new arguments.
//! - Changing the statement's shape (criteria, ordering, grouping, lock
//!   mode, update operations) drops the plan and starts over. Rebinding
//!   placeholder values keeps it.
//! - If the server refuses to prepare (unknown command, or its
//!   `max_prepared_stmt_count` is reached), the session stops preparing
//!   for good and every statement runs plain. Callers never see that error.
//!
//! The transport is abstracted by [`PreparedStatementProtocol`]; a
//! connection implements it, and [`replay::ScriptedProtocol`] implements it
//! in memory for tests.
//!
//! ## Usage
//!
//! ```
//! use std::sync::Arc;
//! use mysqlx_prepared::replay::ScriptedProtocol;
//! use mysqlx_prepared::{LifecycleStage, PreparedStatementConfig, Session};
//!
//! # futures_util::FutureExt::now_or_never(async {
//! let session = Session::new(
//!     Arc::new(ScriptedProtocol::new()),
//!     PreparedStatementConfig::builder()
//!         .max_statement_ids(1024)
//!         .build(),
//! );
//!
//! let mut orders = session.select("shop", "orders");
//! orders.where_("customer_id = :customer").limit(20);
//!
//! for customer in [7, 8, 9] {
//!     orders.bind("customer", customer).execute().await?;
//! }
//! assert_eq!(orders.stage(), LifecycleStage::ToExecute);
//! # Ok::<(), mysqlx_prepared::Error>(())
//! # }).unwrap().unwrap();
//! ```

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod protocol;
pub mod registry;
pub mod replay;
pub mod session;
pub mod shape;
pub mod slots;
pub mod statement;
pub mod tracing_support;

// Re-exports
pub use config::{PreparedStatementConfig, PreparedStatementConfigBuilder};
pub use error::{Error, PrepareErrorClass, Result, ServerError};
pub use lifecycle::{LifecycleStage, Preparing};
pub use protocol::{ColumnMetadata, PreparedStatementProtocol, ResultHandlers, Row, ServerDetails};
pub use registry::SessionStatementRegistry;
pub use session::Session;
pub use shape::{LockContention, LockMode, StatementDefinition, StatementKind, Target};
pub use statement::Statement;
pub use tracing_support::{SpanEmitter, StatementSpan};
