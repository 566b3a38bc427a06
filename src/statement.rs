//! CRUD statement handle
//!
//! A [`Statement`] is built with chained mutators and executed any number of
//! times. Each mutator is classified as either changing the statement's
//! shape (the server side plan has to go) or only its arguments (the plan is
//! reused):
//!
//! | mutator | effect |
//! |---|---|
//! | [`where_`](Statement::where_), [`fields`](Statement::fields), [`sort`](Statement::sort) | restart |
//! | [`group_by`](Statement::group_by), [`having`](Statement::having) | restart |
//! | [`lock_shared`](Statement::lock_shared), [`lock_exclusive`](Statement::lock_exclusive) | restart |
//! | [`set`](Statement::set), [`unset`](Statement::unset) | restart |
//! | first [`limit`](Statement::limit) or [`offset`](Statement::offset) | reprepare |
//! | later `limit` / `offset` values, [`bind`](Statement::bind) | none |

use std::sync::Arc;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::lifecycle::{deallocate_orphans, ExecutionContext, LifecycleStage, Preparing};
use crate::protocol::{PreparedStatementProtocol, ResultHandlers, Row, ServerDetails};
use crate::session::SessionInner;
use crate::shape::{
    ExecuteArgs, LockContention, LockMode, StatementDefinition, StatementKind, Target,
    UpdateOperation,
};

/// A change applied to a statement through one of its mutators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    /// Filter criteria set or replaced
    Criteria,
    /// Projection set or replaced
    Projection,
    /// Sort expressions added
    Sort,
    /// Grouping expressions set or replaced
    Grouping,
    /// Having criteria set or replaced
    Having,
    /// Row lock mode set
    Lock,
    /// Update operation added
    Operation,
    /// Limit or offset present for the first time
    LimitIntroduced,
    /// Value of an existing limit or offset changed
    LimitValue,
    /// Placeholder value bound
    Bind,
}

/// What a mutation does to the preparation lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Drop the plan and treat the statement as new
    Restart,
    /// Drop the plan and prepare again on the next execution
    Reprepare,
    /// Keep the plan
    None,
}

impl Mutation {
    /// Lifecycle effect of this mutation
    pub fn transition(self) -> Transition {
        match self {
            Mutation::Criteria
            | Mutation::Projection
            | Mutation::Sort
            | Mutation::Grouping
            | Mutation::Having
            | Mutation::Lock
            | Mutation::Operation => Transition::Restart,
            Mutation::LimitIntroduced => Transition::Reprepare,
            Mutation::LimitValue | Mutation::Bind => Transition::None,
        }
    }
}

/// A CRUD statement bound to a session
///
/// Dropping a statement whose plan is still live queues its id for
/// deallocation on the session's next execution.
pub struct Statement {
    session: Arc<SessionInner>,
    definition: StatementDefinition,
    args: ExecuteArgs,
    preparing: Preparing,
}

impl Statement {
    pub(crate) fn new(session: Arc<SessionInner>, kind: StatementKind, target: Target) -> Self {
        Self {
            session,
            definition: StatementDefinition::new(kind, target),
            args: ExecuteArgs::default(),
            preparing: Preparing::new(),
        }
    }

    /// Set the filter criteria
    pub fn where_(&mut self, criteria: impl Into<String>) -> &mut Self {
        self.definition.shape.criteria = Some(criteria.into());
        self.apply(Mutation::Criteria)
    }

    /// Replace the projected fields or columns
    pub fn fields<I, S>(&mut self, fields: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.definition.shape.projection = fields.into_iter().map(Into::into).collect();
        self.apply(Mutation::Projection)
    }

    /// Append sort expressions
    pub fn sort<I, S>(&mut self, expressions: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.definition
            .shape
            .ordering
            .extend(expressions.into_iter().map(Into::into));
        self.apply(Mutation::Sort)
    }

    /// Replace the grouping expressions
    pub fn group_by<I, S>(&mut self, expressions: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.definition.shape.grouping = expressions.into_iter().map(Into::into).collect();
        self.apply(Mutation::Grouping)
    }

    /// Set the criteria applied after grouping
    pub fn having(&mut self, criteria: impl Into<String>) -> &mut Self {
        self.definition.shape.grouping_criteria = Some(criteria.into());
        self.apply(Mutation::Having)
    }

    /// Lock matching rows for reading (`FOR SHARE`)
    pub fn lock_shared(&mut self, contention: LockContention) -> &mut Self {
        self.definition.shape.lock = LockMode::Shared(contention);
        self.apply(Mutation::Lock)
    }

    /// Lock matching rows for writing (`FOR UPDATE`)
    pub fn lock_exclusive(&mut self, contention: LockContention) -> &mut Self {
        self.definition.shape.lock = LockMode::Exclusive(contention);
        self.apply(Mutation::Lock)
    }

    /// Set a document path or column
    ///
    /// Only modify and update statements carry update operations; on any
    /// other kind the call is ignored.
    pub fn set(&mut self, path: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.push_operation(UpdateOperation::Set {
            path: path.into(),
            value: value.into(),
        })
    }

    /// Remove a document path
    ///
    /// Ignored unless this is a modify or update statement.
    pub fn unset(&mut self, path: impl Into<String>) -> &mut Self {
        self.push_operation(UpdateOperation::Unset { path: path.into() })
    }

    fn push_operation(&mut self, operation: UpdateOperation) -> &mut Self {
        if !self.definition.kind.accepts_operations() {
            tracing::warn!(
                statement = %self.definition.describe(),
                "update operation ignored on a statement that does not update"
            );
            return self;
        }
        self.definition.shape.operations.push(operation);
        self.apply(Mutation::Operation)
    }

    /// Limit the number of rows
    pub fn limit(&mut self, row_count: u64) -> &mut Self {
        self.args.limit = Some(row_count);
        let introduced = !std::mem::replace(&mut self.definition.shape.has_limit, true);
        self.apply(if introduced {
            Mutation::LimitIntroduced
        } else {
            Mutation::LimitValue
        })
    }

    /// Skip rows before the first one returned
    pub fn offset(&mut self, offset: u64) -> &mut Self {
        self.args.offset = Some(offset);
        let introduced = !std::mem::replace(&mut self.definition.shape.has_offset, true);
        self.apply(if introduced {
            Mutation::LimitIntroduced
        } else {
            Mutation::LimitValue
        })
    }

    /// Bind a value to a named placeholder
    pub fn bind(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.args.values.bind(name, value);
        self.apply(Mutation::Bind)
    }

    fn apply(&mut self, mutation: Mutation) -> &mut Self {
        match mutation.transition() {
            Transition::Restart => self.preparing.force_restart(),
            Transition::Reprepare => self.preparing.force_reprepare(),
            Transition::None => {}
        }
        self
    }

    /// Run the statement, discarding any rows
    pub async fn execute(&mut self) -> Result<ServerDetails> {
        self.execute_with(ResultHandlers::none()).await
    }

    /// Run the statement and collect every row
    pub async fn fetch_all(&mut self) -> Result<(Vec<Row>, ServerDetails)> {
        let mut rows = Vec::new();
        let mut on_row = |row: Row| rows.push(row);
        let details = self
            .execute_with(ResultHandlers::none().with_rows(&mut on_row))
            .await?;
        Ok((rows, details))
    }

    /// Run the statement, streaming results to `handlers`
    pub async fn execute_with(&mut self, handlers: ResultHandlers<'_>) -> Result<ServerDetails> {
        let session = &*self.session;
        if session.is_closed() {
            return Err(Error::SessionClosed);
        }
        let protocol: &dyn PreparedStatementProtocol = session.protocol.as_ref();
        deallocate_orphans(&session.registry, protocol).await;

        let definition = &self.definition;
        let args = &self.args;
        let ctx = ExecutionContext {
            registry: &session.registry,
            protocol,
            emitter: session.emitter.as_ref(),
            statement: definition,
            args,
        };
        self.preparing
            .execute(
                &ctx,
                |handlers| protocol.execute_plain(definition, args, handlers),
                handlers,
            )
            .await
    }

    /// Drop the server side plan now instead of on the next redefinition
    pub async fn deallocate(&mut self) -> Result<()> {
        let session = &*self.session;
        if session.is_closed() {
            return Err(Error::SessionClosed);
        }
        let ctx = ExecutionContext {
            registry: &session.registry,
            protocol: session.protocol.as_ref(),
            emitter: session.emitter.as_ref(),
            statement: &self.definition,
            args: &self.args,
        };
        self.preparing.deallocate(&ctx).await
    }

    /// Current lifecycle stage
    pub fn stage(&self) -> LifecycleStage {
        self.preparing.stage()
    }

    /// Id of the live prepared plan, if any
    pub fn statement_id(&self) -> Option<u32> {
        self.preparing.statement_id()
    }

    /// The statement as sent to the server
    pub fn definition(&self) -> &StatementDefinition {
        &self.definition
    }

    /// Arguments sent with the next execution
    pub fn args(&self) -> &ExecuteArgs {
        &self.args
    }
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("definition", &self.definition)
            .field("args", &self.args)
            .field("preparing", &self.preparing)
            .finish()
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        if let Some(id) = self.preparing.statement_id() {
            self.session.registry.orphan(id, self.preparing.epoch());
        }
    }
}
