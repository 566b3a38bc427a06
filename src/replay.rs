//! Scripted server for lifecycle testing
//!
//! [`ScriptedProtocol`] implements [`PreparedStatementProtocol`] in memory.
//! It records every request it receives into a [`RequestTranscript`], keeps
//! the set of plans a real server would hold, and fails requests on demand.
//!
//! The plan table is enforced the way the server enforces it: executing or
//! deallocating an id that was never prepared fails with
//! `ER_X_BAD_STATEMENT_ID`. A lifecycle bug that loses track of an id
//! therefore shows up as an error rather than a silently passing test.
//!
//! # Example
//!
//! ```
//! use mysqlx_prepared::replay::{Request, ScriptedProtocol};
//! use mysqlx_prepared::{PreparedStatementConfig, Session};
//! use std::sync::Arc;
//!
//! # futures_util::FutureExt::now_or_never(async {
//! let server = Arc::new(ScriptedProtocol::new());
//! let session = Session::new(server.clone(), PreparedStatementConfig::default());
//!
//! let mut find = session.find("app", "users");
//! find.where_("age > :age").bind("age", 18);
//! find.execute().await.unwrap();
//! find.bind("age", 21);
//! find.execute().await.unwrap();
//!
//! assert_eq!(
//!     server.requests(),
//!     vec![Request::Plain, Request::Prepare(1), Request::ExecutePrepared(1)]
//! );
//! # }).unwrap();
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, ER_MAX_PREPARED_STMT_COUNT_REACHED, ER_UNKNOWN_COM_ERROR};
use crate::protocol::{ColumnMetadata, PreparedStatementProtocol, ResultHandlers, Row, ServerDetails};
use crate::shape::{ExecuteArgs, StatementDefinition, StatementKind};

/// Server error for an id with no registered plan
pub const ER_X_BAD_STATEMENT_ID: u16 = 5110;

/// A request as seen by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "request", content = "statement_id", rename_all = "snake_case")]
pub enum Request {
    /// Unprepared execution
    Plain,
    /// Prepare under the given id
    Prepare(u32),
    /// Execute the plan with the given id
    ExecutePrepared(u32),
    /// Drop the plan with the given id
    Deallocate(u32),
}

impl Request {
    /// The statement id carried by the request, if any
    pub fn statement_id(&self) -> Option<u32> {
        match self {
            Request::Plain => None,
            Request::Prepare(id) | Request::ExecutePrepared(id) | Request::Deallocate(id) => {
                Some(*id)
            }
        }
    }
}

/// One recorded request and how the server answered it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    /// The request
    pub request: Request,
    /// Description of the statement involved, when the server knows it
    pub statement: Option<String>,
    /// Arguments sent with an execution
    pub args: Option<ExecuteArgs>,
    /// Error returned to the client
    pub error: Option<String>,
}

impl TranscriptEntry {
    /// Whether the server answered with an error
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Ordered record of every request a [`ScriptedProtocol`] received
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RequestTranscript {
    entries: Vec<TranscriptEntry>,
}

impl RequestTranscript {
    /// Create an empty transcript
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request
    pub fn record(&mut self, entry: TranscriptEntry) {
        self.entries.push(entry);
    }

    /// Requests in arrival order
    pub fn requests(&self) -> Vec<Request> {
        self.entries.iter().map(|e| e.request).collect()
    }

    /// Number of requests matching `predicate`
    pub fn count(&self, predicate: impl Fn(&Request) -> bool) -> usize {
        self.entries.iter().filter(|e| predicate(&e.request)).count()
    }

    /// Iterate over recorded entries
    pub fn iter(&self) -> impl Iterator<Item = &TranscriptEntry> {
        self.entries.iter()
    }

    /// Number of recorded requests
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize the transcript for golden files and failure reports
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Load a transcript written by [`to_json`](Self::to_json)
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[derive(Debug, Default)]
struct ServerState {
    transcript: RequestTranscript,
    plans: BTreeMap<u32, StatementDefinition>,
    plain_failures: VecDeque<Error>,
    prepare_failures: VecDeque<Error>,
    execute_failures: VecDeque<Error>,
    deallocate_failures: VecDeque<Error>,
    hang_next_prepare: bool,
    hang_next_deallocate: bool,
    columns: Vec<ColumnMetadata>,
    rows: Vec<Row>,
    affected_items: u64,
}

/// In-memory server double
#[derive(Debug)]
pub struct ScriptedProtocol {
    prepare_supported: bool,
    max_prepared_statements: Option<usize>,
    state: Mutex<ServerState>,
}

impl Default for ScriptedProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProtocol {
    /// A server that prepares statements without limit
    pub fn new() -> Self {
        Self {
            prepare_supported: true,
            max_prepared_statements: None,
            state: Mutex::new(ServerState::default()),
        }
    }

    /// A server that rejects every prepare as an unknown command
    pub fn without_prepared_statements() -> Self {
        Self {
            prepare_supported: false,
            ..Self::new()
        }
    }

    /// A server whose `max_prepared_stmt_count` is `max`
    pub fn with_max_prepared_statements(max: usize) -> Self {
        Self {
            max_prepared_statements: Some(max),
            ..Self::new()
        }
    }

    /// Result set returned by every execution of a find or select
    pub fn respond_with(&self, columns: Vec<ColumnMetadata>, rows: Vec<Row>) {
        let mut state = self.state();
        state.columns = columns;
        state.rows = rows;
    }

    /// Affected item count reported by every execution
    pub fn report_affected_items(&self, count: u64) {
        self.state().affected_items = count;
    }

    /// Fail the next plain execution
    pub fn fail_next_plain(&self, error: Error) {
        self.state().plain_failures.push_back(error);
    }

    /// Fail the next prepare
    pub fn fail_next_prepare(&self, error: Error) {
        self.state().prepare_failures.push_back(error);
    }

    /// Fail the next execute-prepared
    pub fn fail_next_execute(&self, error: Error) {
        self.state().execute_failures.push_back(error);
    }

    /// Fail the next deallocate
    pub fn fail_next_deallocate(&self, error: Error) {
        self.state().deallocate_failures.push_back(error);
    }

    /// Never answer the next prepare
    ///
    /// The request is recorded but no plan is registered.
    pub fn hang_next_prepare(&self) {
        self.state().hang_next_prepare = true;
    }

    /// Drop the plan on the next deallocate but never answer it
    pub fn hang_next_deallocate(&self) {
        self.state().hang_next_deallocate = true;
    }

    /// Drop every plan, as the server does on a session reset
    pub fn forget_plans(&self) {
        self.state().plans.clear();
    }

    /// Whether a plan is registered under `id`
    pub fn is_prepared(&self, id: u32) -> bool {
        self.state().plans.contains_key(&id)
    }

    /// Ids with a registered plan, ascending
    pub fn prepared_ids(&self) -> Vec<u32> {
        self.state().plans.keys().copied().collect()
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<Request> {
        self.state().transcript.requests()
    }

    /// Snapshot of the transcript
    pub fn transcript(&self) -> RequestTranscript {
        self.state().transcript.clone()
    }

    /// Forget recorded requests, keeping plans and scripted failures
    pub fn clear_requests(&self) {
        self.state().transcript = RequestTranscript::new();
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn result_set(state: &ServerState, kind: StatementKind) -> (Vec<ColumnMetadata>, Vec<Row>) {
        if kind.returns_rows() {
            (state.columns.clone(), state.rows.clone())
        } else {
            (Vec::new(), Vec::new())
        }
    }

    fn details(state: &ServerState) -> ServerDetails {
        ServerDetails {
            affected_items_count: state.affected_items,
            ..ServerDetails::default()
        }
    }
}

fn record(
    state: &mut ServerState,
    request: Request,
    statement: Option<String>,
    args: Option<&ExecuteArgs>,
    error: Option<&Error>,
) {
    state.transcript.record(TranscriptEntry {
        request,
        statement,
        args: args.cloned(),
        error: error.map(ToString::to_string),
    });
}

fn unknown_statement(id: u32) -> Error {
    Error::server(
        ER_X_BAD_STATEMENT_ID,
        "HY000",
        format!("Statement with ID={} was not prepared", id),
    )
}

#[async_trait]
impl PreparedStatementProtocol for ScriptedProtocol {
    async fn execute_plain(
        &self,
        statement: &StatementDefinition,
        args: &ExecuteArgs,
        mut handlers: ResultHandlers<'_>,
    ) -> Result<ServerDetails> {
        let (columns, rows, details) = {
            let mut state = self.state();
            let failure = state.plain_failures.pop_front();
            record(
                &mut state,
                Request::Plain,
                Some(statement.describe()),
                Some(args),
                failure.as_ref(),
            );
            if let Some(error) = failure {
                return Err(error);
            }
            let (columns, rows) = Self::result_set(&state, statement.kind);
            (columns, rows, Self::details(&state))
        };
        handlers.deliver(&columns, rows);
        Ok(details)
    }

    async fn prepare(&self, statement_id: u32, statement: &StatementDefinition) -> Result<()> {
        let hang = {
            let mut state = self.state();
            let failure = if !self.prepare_supported {
                Some(Error::server(ER_UNKNOWN_COM_ERROR, "HY000", "Unexpected message received"))
            } else if let Some(error) = state.prepare_failures.pop_front() {
                Some(error)
            } else if state.plans.contains_key(&statement_id) {
                Some(Error::server(
                    ER_X_BAD_STATEMENT_ID,
                    "HY000",
                    format!("Statement with ID={} already prepared", statement_id),
                ))
            } else if self
                .max_prepared_statements
                .is_some_and(|max| state.plans.len() >= max)
            {
                Some(Error::server(
                    ER_MAX_PREPARED_STMT_COUNT_REACHED,
                    "42000",
                    "Can't create more than max_prepared_stmt_count statements",
                ))
            } else {
                None
            };
            record(
                &mut state,
                Request::Prepare(statement_id),
                Some(statement.describe()),
                None,
                failure.as_ref(),
            );
            if let Some(error) = failure {
                return Err(error);
            }

            let hang = std::mem::take(&mut state.hang_next_prepare);
            if !hang {
                state.plans.insert(statement_id, statement.clone());
            }
            hang
        };

        if hang {
            futures_util::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn execute_prepared(
        &self,
        statement_id: u32,
        args: &ExecuteArgs,
        mut handlers: ResultHandlers<'_>,
    ) -> Result<ServerDetails> {
        let (columns, rows, details) = {
            let mut state = self.state();
            let plan = state
                .plans
                .get(&statement_id)
                .map(|plan| (plan.describe(), plan.kind));
            let failure = match plan {
                None => Some(unknown_statement(statement_id)),
                Some(_) => state.execute_failures.pop_front(),
            };
            let (described, kind) = match plan {
                Some((described, kind)) => (Some(described), Some(kind)),
                None => (None, None),
            };
            record(
                &mut state,
                Request::ExecutePrepared(statement_id),
                described,
                Some(args),
                failure.as_ref(),
            );
            if let Some(error) = failure {
                return Err(error);
            }
            let (columns, rows) = match kind {
                Some(kind) => Self::result_set(&state, kind),
                None => (Vec::new(), Vec::new()),
            };
            (columns, rows, Self::details(&state))
        };
        handlers.deliver(&columns, rows);
        Ok(details)
    }

    async fn deallocate(&self, statement_id: u32) -> Result<()> {
        let hang = {
            let mut state = self.state();
            let described = state.plans.get(&statement_id).map(StatementDefinition::describe);
            let failure = match described {
                None => Some(unknown_statement(statement_id)),
                Some(_) => state.deallocate_failures.pop_front(),
            };
            record(
                &mut state,
                Request::Deallocate(statement_id),
                described,
                None,
                failure.as_ref(),
            );
            if let Some(error) = failure {
                return Err(error);
            }
            state.plans.remove(&statement_id);
            std::mem::take(&mut state.hang_next_deallocate)
        };

        if hang {
            futures_util::future::pending::<()>().await;
        }
        Ok(())
    }
}
