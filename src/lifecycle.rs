//! Prepared statement lifecycle
//!
//! Each statement carries a [`Preparing`] state machine that decides, on every
//! execution, whether to run the statement as a plain request or against a
//! server side prepared plan.
//!
//! ```text
//!            plain ok                 prepare ok
//!  ToStart ───────────▶ ToPrepare ───────────────▶ ToExecute ◀─┐
//!     ▲                    ▲  │ unsupported /          │  │     │ execute
//!     │ deallocate         │  │ exhausted              │  └─────┘ prepared
//!     │                    │  ▼                        │
//!  ToRestart           deallocate   ToSkip ◀── plain   │
//!     ▲                    │                           │
//!     │ force_restart  ToReprepare ◀── force_reprepare ┘
//!     └────────────────────────────────────────────────┘
//! ```
//!
//! A statement executed once is never prepared. The second execution
//! prepares it and runs the plan; later executions only send the new
//! arguments. A prepare rejected because the server cannot (or can no
//! longer) prepare statements closes the session's capability gate and the
//! execution silently falls back to a plain request.

use std::future::Future;

use crate::error::{Error, Result, ER_MAX_PREPARED_STMT_COUNT_REACHED};
use crate::protocol::{PreparedStatementProtocol, ResultHandlers, ServerDetails};
use crate::registry::{SessionStatementRegistry, SlotReservation};
use crate::shape::{ExecuteArgs, StatementDefinition};
use crate::tracing_support::{ErrorClass, SpanEmitter, SpanOperation, SpanTimer, StatementSpan};

/// Upper bound on dispatch steps within one execution.
///
/// The longest path is deallocate, prepare, execute prepared.
const MAX_STEPS: usize = 4;

/// Where a statement is in its preparation lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LifecycleStage {
    /// Never executed, or redefined since
    #[default]
    ToStart,
    /// Executed once as a plain request; prepare on the next execution
    ToPrepare,
    /// A valid prepared plan exists
    ToExecute,
    /// A plan exists but must be dropped and compiled again
    ToReprepare,
    /// A plan exists but must be dropped and the statement treated as new
    ToRestart,
    /// Preparation is unavailable; always run plain
    ToSkip,
}

impl LifecycleStage {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStage::ToStart => "to_start",
            LifecycleStage::ToPrepare => "to_prepare",
            LifecycleStage::ToExecute => "to_execute",
            LifecycleStage::ToReprepare => "to_reprepare",
            LifecycleStage::ToRestart => "to_restart",
            LifecycleStage::ToSkip => "to_skip",
        }
    }

    /// Whether a server side plan exists in this stage
    pub fn holds_plan(&self) -> bool {
        matches!(
            self,
            LifecycleStage::ToExecute | LifecycleStage::ToReprepare | LifecycleStage::ToRestart
        )
    }
}

impl std::fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Session collaborators and statement data for one execution
pub struct ExecutionContext<'a> {
    /// Session id bookkeeping and capability gate
    pub registry: &'a SessionStatementRegistry,
    /// Server requests
    pub protocol: &'a dyn PreparedStatementProtocol,
    /// Span sink
    pub emitter: &'a dyn SpanEmitter,
    /// Statement being executed
    pub statement: &'a StatementDefinition,
    /// Arguments for this execution
    pub args: &'a ExecuteArgs,
}

impl ExecutionContext<'_> {
    fn emit_ok(&self, timer: SpanTimer, affected_items: u64) {
        self.emitter.emit_span(&timer.finish_success(affected_items));
    }

    fn emit_err(&self, timer: SpanTimer, error: &Error) {
        let class = ErrorClass::from_error(error, self.registry.config());
        self.emitter
            .emit_span(&timer.finish_error(class, error.to_string()));
    }
}

/// A prepare that did not produce a plan
struct PrepareFailure<'r> {
    error: Error,
    /// `None` when no id could be reserved
    reservation: Option<SlotReservation<'r>>,
}

/// Preparation state of a single statement
#[derive(Debug, Clone, Default)]
pub struct Preparing {
    stage: LifecycleStage,
    statement_id: Option<u32>,
    /// Registry epoch the plan was prepared in
    epoch: u64,
}

impl Preparing {
    /// A statement that has never run
    pub fn new() -> Self {
        Self::default()
    }

    /// Current stage
    pub fn stage(&self) -> LifecycleStage {
        self.stage
    }

    /// Id of the live prepared plan, if any
    pub fn statement_id(&self) -> Option<u32> {
        self.statement_id
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    /// The statement was redefined; forget any plan and start over
    pub fn force_restart(&mut self) {
        let next = if self.stage.holds_plan() {
            LifecycleStage::ToRestart
        } else {
            LifecycleStage::ToStart
        };
        self.transition(next);
    }

    /// The plan no longer matches the statement; compile it again
    pub fn force_reprepare(&mut self) {
        if self.stage == LifecycleStage::ToExecute {
            self.transition(LifecycleStage::ToReprepare);
        }
    }

    /// Execute the statement
    ///
    /// `plain` runs the statement without preparation; it is called at most
    /// once and receives `handlers`. When the statement runs as a prepared
    /// plan, `handlers` go to the execute-prepared request instead.
    pub async fn execute<'h, P, Fut>(
        &mut self,
        ctx: &ExecutionContext<'_>,
        plain: P,
        handlers: ResultHandlers<'h>,
    ) -> Result<ServerDetails>
    where
        P: FnOnce(ResultHandlers<'h>) -> Fut,
        Fut: Future<Output = Result<ServerDetails>>,
    {
        self.discard_stale_plan(ctx.registry);

        for _ in 0..MAX_STEPS {
            match self.stage {
                LifecycleStage::ToRestart | LifecycleStage::ToReprepare => {
                    self.deallocate(ctx).await?;
                }
                LifecycleStage::ToPrepare => {
                    if !ctx.registry.prepared_statement_supported() {
                        self.transition(LifecycleStage::ToSkip);
                        continue;
                    }
                    if let Err(failure) = self.prepare(ctx).await {
                        return self.handle_prepare_error(ctx, failure, plain, handlers).await;
                    }
                }
                LifecycleStage::ToExecute => {
                    return self.execute_prepared(ctx, handlers).await;
                }
                LifecycleStage::ToStart | LifecycleStage::ToSkip => {
                    return self.execute_plain(ctx, plain, handlers).await;
                }
            }
        }

        Err(Error::Lifecycle(format!(
            "statement did not settle after {} steps (stage {})",
            MAX_STEPS, self.stage
        )))
    }

    /// Drop the live plan, if any
    ///
    /// `ToRestart` and `ToExecute` go back to `ToStart`, `ToReprepare` goes to
    /// `ToPrepare`. Without a plan this is a no-op. A failed deallocate is
    /// returned with the stage and id restored. If the future is
    /// dropped mid-request the stage has already moved on and the id is
    /// queued for deallocation by the next execution in the session.
    pub async fn deallocate(&mut self, ctx: &ExecutionContext<'_>) -> Result<()> {
        self.discard_stale_plan(ctx.registry);

        let next = match self.stage {
            LifecycleStage::ToRestart | LifecycleStage::ToExecute => LifecycleStage::ToStart,
            LifecycleStage::ToReprepare => LifecycleStage::ToPrepare,
            LifecycleStage::ToStart | LifecycleStage::ToPrepare | LifecycleStage::ToSkip => {
                return Ok(());
            }
        };
        let id = self.statement_id.ok_or_else(|| {
            Error::Lifecycle(format!("stage {} without a statement id", self.stage))
        })?;

        let timer = self.timer(ctx, SpanOperation::Deallocate);
        let previous = self.stage;
        // the statement moves on before the request; if the request is
        // abandoned the id is left to orphan cleanup
        let held = ctx.registry.track(id, self.epoch);
        self.statement_id = None;
        self.transition(next);

        match ctx.protocol.deallocate(id).await {
            Ok(()) => {
                ctx.emit_ok(timer, 0);
                held.release();
                Ok(())
            }
            Err(error) => {
                ctx.emit_err(timer, &error);
                held.commit();
                self.statement_id = Some(id);
                self.transition(previous);
                Err(error)
            }
        }
    }

    async fn prepare<'r>(
        &mut self,
        ctx: &ExecutionContext<'r>,
    ) -> std::result::Result<(), PrepareFailure<'r>> {
        let Some(reservation) = ctx.registry.reserve() else {
            return Err(PrepareFailure {
                error: Error::server(
                    ER_MAX_PREPARED_STMT_COUNT_REACHED,
                    "42000",
                    "client side statement id limit reached",
                ),
                reservation: None,
            });
        };

        let timer = SpanTimer::start_with(
            self.span(ctx, SpanOperation::Prepare)
                .with_statement_id(Some(reservation.id())),
        );
        match ctx.protocol.prepare(reservation.id(), ctx.statement).await {
            Ok(()) => {
                ctx.emit_ok(timer, 0);
                self.epoch = reservation.epoch();
                self.statement_id = Some(reservation.commit());
                self.transition(LifecycleStage::ToExecute);
                Ok(())
            }
            Err(error) => {
                ctx.emit_err(timer, &error);
                Err(PrepareFailure {
                    error,
                    reservation: Some(reservation),
                })
            }
        }
    }

    async fn handle_prepare_error<'h, P, Fut>(
        &mut self,
        ctx: &ExecutionContext<'_>,
        failure: PrepareFailure<'_>,
        plain: P,
        handlers: ResultHandlers<'h>,
    ) -> Result<ServerDetails>
    where
        P: FnOnce(ResultHandlers<'h>) -> Fut,
        Fut: Future<Output = Result<ServerDetails>>,
    {
        let PrepareFailure { error, reservation } = failure;
        if let Some(reservation) = reservation {
            reservation.release();
        }

        let class = ctx.registry.config().classify(&error);
        if !class.is_recoverable() {
            return Err(error);
        }

        tracing::debug!(
            statement = %ctx.statement.describe(),
            class = class.as_str(),
            code = error.server_code(),
            "prepare rejected, falling back to plain execution"
        );
        ctx.registry.mark_prepared_statement_unsupported();
        self.transition(LifecycleStage::ToSkip);
        self.execute_plain(ctx, plain, handlers).await
    }

    async fn execute_plain<'h, P, Fut>(
        &mut self,
        ctx: &ExecutionContext<'_>,
        plain: P,
        handlers: ResultHandlers<'h>,
    ) -> Result<ServerDetails>
    where
        P: FnOnce(ResultHandlers<'h>) -> Fut,
        Fut: Future<Output = Result<ServerDetails>>,
    {
        let timer = self.timer(ctx, SpanOperation::Plain);
        let details = match plain(handlers).await {
            Ok(details) => details,
            Err(error) => {
                ctx.emit_err(timer, &error);
                return Err(error);
            }
        };
        ctx.emit_ok(timer, details.affected_items_count);

        if self.stage != LifecycleStage::ToSkip {
            if ctx.registry.prepared_statement_supported() {
                self.transition(LifecycleStage::ToPrepare);
            } else {
                self.transition(LifecycleStage::ToSkip);
            }
        }
        Ok(details)
    }

    async fn execute_prepared(
        &mut self,
        ctx: &ExecutionContext<'_>,
        handlers: ResultHandlers<'_>,
    ) -> Result<ServerDetails> {
        let id = self.statement_id.ok_or_else(|| {
            Error::Lifecycle(format!("stage {} without a statement id", self.stage))
        })?;

        let timer = self.timer(ctx, SpanOperation::ExecutePrepared);
        match ctx.protocol.execute_prepared(id, ctx.args, handlers).await {
            Ok(details) => {
                ctx.emit_ok(timer, details.affected_items_count);
                Ok(details)
            }
            Err(error) => {
                ctx.emit_err(timer, &error);
                Err(error)
            }
        }
    }

    /// Forget a plan the server dropped in a session reset
    fn discard_stale_plan(&mut self, registry: &SessionStatementRegistry) {
        if self.statement_id.is_some() && self.epoch != registry.epoch() {
            tracing::debug!(
                statement_id = self.statement_id,
                "plan dropped by session reset"
            );
            self.statement_id = None;
            self.transition(LifecycleStage::ToStart);
        }
    }

    fn transition(&mut self, next: LifecycleStage) {
        if self.stage != next {
            tracing::trace!(
                from = self.stage.as_str(),
                to = next.as_str(),
                statement_id = self.statement_id,
                "stage transition"
            );
            self.stage = next;
        }
    }

    fn span(&self, ctx: &ExecutionContext<'_>, operation: SpanOperation) -> StatementSpan {
        let span = StatementSpan::new(operation)
            .with_stage(self.stage)
            .with_statement_id(self.statement_id);
        if ctx.registry.config().include_shape_in_spans() {
            span.with_statement(ctx.statement.describe())
        } else {
            span
        }
    }

    fn timer(&self, ctx: &ExecutionContext<'_>, operation: SpanOperation) -> SpanTimer {
        SpanTimer::start_with(self.span(ctx, operation))
    }
}

/// Send a deallocate for every id whose request was abandoned mid-flight
///
/// Failures are logged and ignored: the server may never have registered
/// the id. Each id is freed once its deallocate has completed. Ids not yet
/// handled when this future is dropped stay queued.
pub async fn deallocate_orphans(
    registry: &SessionStatementRegistry,
    protocol: &dyn PreparedStatementProtocol,
) {
    while let Some(claim) = registry.claim_orphan() {
        let id = claim.id();
        if let Err(error) = protocol.deallocate(id).await {
            tracing::warn!(statement_id = id, %error, "deallocating abandoned statement id failed");
        }
        claim.settle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PreparedStatementConfig;
    use crate::replay::{Request, ScriptedProtocol};
    use crate::shape::{StatementKind, Target};
    use crate::tracing_support::TestSpanEmitter;

    struct Fixture {
        registry: SessionStatementRegistry,
        protocol: ScriptedProtocol,
        emitter: TestSpanEmitter,
        statement: StatementDefinition,
        args: ExecuteArgs,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_config(PreparedStatementConfig::default())
        }

        fn with_config(config: PreparedStatementConfig) -> Self {
            Self {
                registry: SessionStatementRegistry::new(config),
                protocol: ScriptedProtocol::new(),
                emitter: TestSpanEmitter::new(),
                statement: StatementDefinition::new(
                    StatementKind::Find,
                    Target::new("app", "users"),
                ),
                args: ExecuteArgs::default(),
            }
        }

        fn ctx(&self) -> ExecutionContext<'_> {
            ExecutionContext {
                registry: &self.registry,
                protocol: &self.protocol,
                emitter: &self.emitter,
                statement: &self.statement,
                args: &self.args,
            }
        }

        async fn run(&self, preparing: &mut Preparing) -> Result<ServerDetails> {
            let ctx = self.ctx();
            let protocol = &self.protocol;
            let statement = &self.statement;
            let args = &self.args;
            preparing
                .execute(
                    &ctx,
                    |handlers| protocol.execute_plain(statement, args, handlers),
                    ResultHandlers::none(),
                )
                .await
        }
    }

    #[test]
    fn test_stage_as_str() {
        assert_eq!(LifecycleStage::ToStart.as_str(), "to_start");
        assert_eq!(LifecycleStage::ToReprepare.to_string(), "to_reprepare");
        assert_eq!(LifecycleStage::default(), LifecycleStage::ToStart);
    }

    #[test]
    fn test_holds_plan() {
        assert!(LifecycleStage::ToExecute.holds_plan());
        assert!(LifecycleStage::ToRestart.holds_plan());
        assert!(LifecycleStage::ToReprepare.holds_plan());
        assert!(!LifecycleStage::ToPrepare.holds_plan());
        assert!(!LifecycleStage::ToSkip.holds_plan());
    }

    #[tokio::test]
    async fn test_first_execution_is_plain() {
        let fx = Fixture::new();
        let mut preparing = Preparing::new();

        fx.run(&mut preparing).await.unwrap();

        assert_eq!(fx.protocol.requests(), vec![Request::Plain]);
        assert_eq!(preparing.stage(), LifecycleStage::ToPrepare);
        assert_eq!(preparing.statement_id(), None);
    }

    #[tokio::test]
    async fn test_second_execution_prepares_once() {
        let fx = Fixture::new();
        let mut preparing = Preparing::new();

        fx.run(&mut preparing).await.unwrap();
        fx.run(&mut preparing).await.unwrap();
        fx.run(&mut preparing).await.unwrap();

        assert_eq!(
            fx.protocol.requests(),
            vec![
                Request::Plain,
                Request::Prepare(1),
                Request::ExecutePrepared(1),
                Request::ExecutePrepared(1),
            ]
        );
        assert_eq!(preparing.stage(), LifecycleStage::ToExecute);
        assert_eq!(preparing.statement_id(), Some(1));
        assert!(fx.registry.is_allocated(1));
    }

    #[tokio::test]
    async fn test_restart_deallocates_then_runs_plain() {
        let fx = Fixture::new();
        let mut preparing = Preparing::new();
        fx.run(&mut preparing).await.unwrap();
        fx.run(&mut preparing).await.unwrap();
        fx.protocol.clear_requests();

        preparing.force_restart();
        assert_eq!(preparing.stage(), LifecycleStage::ToRestart);
        fx.run(&mut preparing).await.unwrap();

        assert_eq!(
            fx.protocol.requests(),
            vec![Request::Deallocate(1), Request::Plain]
        );
        assert_eq!(preparing.stage(), LifecycleStage::ToPrepare);
        assert_eq!(preparing.statement_id(), None);
        assert!(!fx.registry.is_allocated(1));
    }

    #[tokio::test]
    async fn test_reprepare_deallocates_then_prepares() {
        let fx = Fixture::new();
        let mut preparing = Preparing::new();
        fx.run(&mut preparing).await.unwrap();
        fx.run(&mut preparing).await.unwrap();
        fx.protocol.clear_requests();

        preparing.force_reprepare();
        assert_eq!(preparing.stage(), LifecycleStage::ToReprepare);
        fx.run(&mut preparing).await.unwrap();

        assert_eq!(
            fx.protocol.requests(),
            vec![
                Request::Deallocate(1),
                Request::Prepare(1),
                Request::ExecutePrepared(1),
            ]
        );
        assert_eq!(preparing.stage(), LifecycleStage::ToExecute);
    }

    #[test]
    fn test_force_restart_without_plan_resets() {
        let mut preparing = Preparing {
            stage: LifecycleStage::ToSkip,
            ..Preparing::default()
        };
        preparing.force_restart();
        assert_eq!(preparing.stage(), LifecycleStage::ToStart);

        let mut preparing = Preparing {
            stage: LifecycleStage::ToPrepare,
            ..Preparing::default()
        };
        preparing.force_restart();
        assert_eq!(preparing.stage(), LifecycleStage::ToStart);
    }

    #[test]
    fn test_force_restart_keeps_plan_in_transit() {
        let mut preparing = Preparing {
            stage: LifecycleStage::ToReprepare,
            statement_id: Some(3),
            epoch: 0,
        };
        preparing.force_restart();
        assert_eq!(preparing.stage(), LifecycleStage::ToRestart);
        assert_eq!(preparing.statement_id(), Some(3));
    }

    #[test]
    fn test_force_reprepare_only_from_execute() {
        for stage in [
            LifecycleStage::ToStart,
            LifecycleStage::ToPrepare,
            LifecycleStage::ToSkip,
            LifecycleStage::ToRestart,
        ] {
            let mut preparing = Preparing {
                stage,
                ..Preparing::default()
            };
            preparing.force_reprepare();
            assert_eq!(preparing.stage(), stage);
        }
    }

    #[tokio::test]
    async fn test_deallocate_from_restart_and_reprepare() {
        let fx = Fixture::new();
        let id = fx.registry.reserve().unwrap().commit();
        fx.protocol.prepare(id, &fx.statement).await.unwrap();
        let mut restarting = Preparing {
            stage: LifecycleStage::ToRestart,
            statement_id: Some(id),
            epoch: 0,
        };
        restarting.deallocate(&fx.ctx()).await.unwrap();
        assert_eq!(restarting.stage(), LifecycleStage::ToStart);
        assert_eq!(restarting.statement_id(), None);
        assert!(!fx.registry.is_allocated(id));

        let id = fx.registry.reserve().unwrap().commit();
        fx.protocol.prepare(id, &fx.statement).await.unwrap();
        let mut repreparing = Preparing {
            stage: LifecycleStage::ToReprepare,
            statement_id: Some(id),
            epoch: 0,
        };
        repreparing.deallocate(&fx.ctx()).await.unwrap();
        assert_eq!(repreparing.stage(), LifecycleStage::ToPrepare);
        assert_eq!(repreparing.statement_id(), None);
    }

    #[tokio::test]
    async fn test_deallocate_without_plan_is_noop() {
        let fx = Fixture::new();
        let mut preparing = Preparing::new();
        preparing.deallocate(&fx.ctx()).await.unwrap();
        assert!(fx.protocol.requests().is_empty());
    }

    #[tokio::test]
    async fn test_deallocate_failure_is_fatal() {
        let fx = Fixture::new();
        let mut preparing = Preparing::new();
        fx.run(&mut preparing).await.unwrap();
        fx.run(&mut preparing).await.unwrap();

        fx.protocol
            .fail_next_deallocate(Error::Transport("connection reset".into()));
        preparing.force_restart();
        let err = fx.run(&mut preparing).await.unwrap_err();

        assert_eq!(err, Error::Transport("connection reset".into()));
        assert_eq!(preparing.stage(), LifecycleStage::ToRestart);
        assert_eq!(preparing.statement_id(), Some(1));
        assert!(fx.registry.is_allocated(1));
    }

    #[tokio::test]
    async fn test_unsupported_prepare_falls_back() {
        let fx = Fixture::new();
        let mut preparing = Preparing::new();
        fx.run(&mut preparing).await.unwrap();

        fx.protocol
            .fail_next_prepare(Error::server(1047, "08S01", "Unknown command"));
        let details = fx.run(&mut preparing).await.unwrap();

        assert_eq!(details, ServerDetails::default());
        assert_eq!(
            fx.protocol.requests(),
            vec![Request::Plain, Request::Prepare(1), Request::Plain]
        );
        assert_eq!(preparing.stage(), LifecycleStage::ToSkip);
        assert!(!fx.registry.prepared_statement_supported());
        assert!(!fx.registry.is_allocated(1));
    }

    #[tokio::test]
    async fn test_other_prepare_error_propagates() {
        let fx = Fixture::new();
        let mut preparing = Preparing::new();
        fx.run(&mut preparing).await.unwrap();

        let deadlock = Error::server(1213, "40001", "Deadlock found");
        fx.protocol.fail_next_prepare(deadlock.clone());
        let err = fx.run(&mut preparing).await.unwrap_err();

        assert_eq!(err, deadlock);
        assert_eq!(preparing.stage(), LifecycleStage::ToPrepare);
        assert!(fx.registry.prepared_statement_supported());
        assert!(!fx.registry.is_allocated(1));

        // the next attempt prepares again
        fx.run(&mut preparing).await.unwrap();
        assert_eq!(preparing.stage(), LifecycleStage::ToExecute);
    }

    #[tokio::test]
    async fn test_closed_gate_skips_prepare() {
        let fx = Fixture::new();
        fx.registry.mark_prepared_statement_unsupported();
        let mut preparing = Preparing::new();

        fx.run(&mut preparing).await.unwrap();
        assert_eq!(preparing.stage(), LifecycleStage::ToSkip);
        fx.run(&mut preparing).await.unwrap();

        assert_eq!(fx.protocol.requests(), vec![Request::Plain, Request::Plain]);
    }

    #[tokio::test]
    async fn test_gate_closed_by_another_statement() {
        let fx = Fixture::new();
        let mut preparing = Preparing::new();
        fx.run(&mut preparing).await.unwrap();
        assert_eq!(preparing.stage(), LifecycleStage::ToPrepare);

        fx.registry.mark_prepared_statement_unsupported();
        fx.run(&mut preparing).await.unwrap();

        assert_eq!(fx.protocol.requests(), vec![Request::Plain, Request::Plain]);
        assert_eq!(preparing.stage(), LifecycleStage::ToSkip);
    }

    #[tokio::test]
    async fn test_client_id_cap_falls_back_without_request() {
        let fx =
            Fixture::with_config(PreparedStatementConfig::builder().max_statement_ids(0).build());
        let mut preparing = Preparing::new();
        fx.run(&mut preparing).await.unwrap();
        fx.run(&mut preparing).await.unwrap();

        assert_eq!(fx.protocol.requests(), vec![Request::Plain, Request::Plain]);
        assert_eq!(preparing.stage(), LifecycleStage::ToSkip);
        assert!(!fx.registry.prepared_statement_supported());
    }

    #[tokio::test]
    async fn test_plain_failure_keeps_stage() {
        let fx = Fixture::new();
        let mut preparing = Preparing::new();
        fx.protocol
            .fail_next_plain(Error::server(1146, "42S02", "Table doesn't exist"));

        assert!(fx.run(&mut preparing).await.is_err());
        assert_eq!(preparing.stage(), LifecycleStage::ToStart);
    }

    #[tokio::test]
    async fn test_execute_prepared_failure_keeps_plan() {
        let fx = Fixture::new();
        let mut preparing = Preparing::new();
        fx.run(&mut preparing).await.unwrap();
        fx.run(&mut preparing).await.unwrap();

        fx.protocol
            .fail_next_execute(Error::server(1205, "HY000", "Lock wait timeout"));
        assert!(fx.run(&mut preparing).await.is_err());
        assert_eq!(preparing.stage(), LifecycleStage::ToExecute);
        assert_eq!(preparing.statement_id(), Some(1));
    }

    #[tokio::test]
    async fn test_stale_plan_is_dropped_after_reset() {
        let fx = Fixture::new();
        let mut preparing = Preparing::new();
        fx.run(&mut preparing).await.unwrap();
        fx.run(&mut preparing).await.unwrap();
        fx.protocol.clear_requests();

        fx.registry.reset();
        fx.run(&mut preparing).await.unwrap();

        assert_eq!(fx.protocol.requests(), vec![Request::Plain]);
        assert_eq!(preparing.stage(), LifecycleStage::ToPrepare);
        assert_eq!(preparing.statement_id(), None);
    }

    #[tokio::test]
    async fn test_spans_follow_requests() {
        let fx = Fixture::new();
        let mut preparing = Preparing::new();
        fx.run(&mut preparing).await.unwrap();
        fx.run(&mut preparing).await.unwrap();

        assert_eq!(
            fx.emitter.operations(),
            vec![
                SpanOperation::Plain,
                SpanOperation::Prepare,
                SpanOperation::ExecutePrepared,
            ]
        );
        let spans = fx.emitter.get_spans();
        assert_eq!(spans[1].stage, Some(LifecycleStage::ToPrepare));
        assert_eq!(spans[1].statement_id, Some(1));
        assert_eq!(spans[2].statement.as_deref(), Some("find `app`.`users`"));
    }

    #[tokio::test]
    async fn test_failed_prepare_span_is_classified() {
        let fx = Fixture::new();
        let mut preparing = Preparing::new();
        fx.run(&mut preparing).await.unwrap();
        fx.protocol
            .fail_next_prepare(Error::server(1461, "42000", "Too many statements"));
        fx.run(&mut preparing).await.unwrap();

        let spans = fx.emitter.get_spans();
        assert_eq!(spans[1].operation, SpanOperation::Prepare);
        assert_eq!(spans[1].error_class, Some(ErrorClass::PrepareExhausted));
        assert_eq!(spans[2].operation, SpanOperation::Plain);
        assert!(!spans[2].is_error());
    }

    #[tokio::test]
    async fn test_deallocate_orphans() {
        let fx = Fixture::new();
        {
            let _abandoned = fx.registry.reserve().unwrap();
        }
        assert!(fx.registry.is_allocated(1));

        deallocate_orphans(&fx.registry, &fx.protocol).await;

        assert_eq!(fx.protocol.requests(), vec![Request::Deallocate(1)]);
        assert!(!fx.registry.is_allocated(1));
    }

    #[tokio::test]
    async fn test_deallocate_orphans_registered_on_server() {
        let fx = Fixture::new();
        {
            let reservation = fx.registry.reserve().unwrap();
            fx.protocol.prepare(reservation.id(), &fx.statement).await.unwrap();
        }
        assert!(fx.protocol.is_prepared(1));

        deallocate_orphans(&fx.registry, &fx.protocol).await;

        assert!(!fx.protocol.is_prepared(1));
        assert!(!fx.registry.is_allocated(1));
        assert!(fx.registry.orphans().is_empty());
    }
}
