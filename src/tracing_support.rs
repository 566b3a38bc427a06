//! Structured spans for statement requests
//!
//! Every request the lifecycle sends produces one [`StatementSpan`]. Spans are
//! handed to a [`SpanEmitter`]; sessions default to [`TracingSpanEmitter`],
//! which forwards them to the `tracing` crate as structured events.
//!
//! # Span Fields
//!
//! - `operation`: "plain", "prepare", "execute_prepared" or "deallocate"
//! - `stage`: lifecycle stage when the request was dispatched
//! - `statement_id`: id of the prepared plan, if any
//! - `statement`: kind and target, unless disabled in the session config
//!
//! # Example
//!
//! ```
//! use mysqlx_prepared::tracing_support::{SpanOperation, SpanTimer};
//!
//! let mut timer = SpanTimer::start(SpanOperation::Prepare);
//! timer.span_mut().statement_id = Some(1);
//! let span = timer.finish_success(0);
//! assert!(!span.is_error());
//! ```

use std::time::{Duration, Instant};

use crate::config::PreparedStatementConfig;
use crate::error::{Error, PrepareErrorClass};
use crate::lifecycle::LifecycleStage;

/// The request a span describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanOperation {
    /// Running a statement without a prepared plan
    Plain,
    /// Compiling a plan
    Prepare,
    /// Running a prepared plan
    ExecutePrepared,
    /// Dropping a plan
    Deallocate,
}

impl SpanOperation {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanOperation::Plain => "plain",
            SpanOperation::Prepare => "prepare",
            SpanOperation::ExecutePrepared => "execute_prepared",
            SpanOperation::Deallocate => "deallocate",
        }
    }
}

impl std::fmt::Display for SpanOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error classification recorded on failed spans
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Preparation is not supported by the server
    PrepareUnsupported,
    /// The server has no room for more prepared statements
    PrepareExhausted,
    /// Any other server error
    Server,
    /// Connection failure
    Transport,
    /// Unexpected server response
    Protocol,
    /// Session already closed
    SessionClosed,
    /// Lifecycle invariant violated
    Lifecycle,
}

impl ErrorClass {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::PrepareUnsupported => "prepare_unsupported",
            ErrorClass::PrepareExhausted => "prepare_exhausted",
            ErrorClass::Server => "server",
            ErrorClass::Transport => "transport",
            ErrorClass::Protocol => "protocol",
            ErrorClass::SessionClosed => "session_closed",
            ErrorClass::Lifecycle => "lifecycle",
        }
    }

    /// Classify an error using the session's fallback codes
    pub fn from_error(error: &Error, config: &PreparedStatementConfig) -> Self {
        match config.classify(error) {
            PrepareErrorClass::Unsupported => return ErrorClass::PrepareUnsupported,
            PrepareErrorClass::Exhausted => return ErrorClass::PrepareExhausted,
            PrepareErrorClass::Other => {}
        }
        match error {
            Error::Server(_) => ErrorClass::Server,
            Error::Transport(_) => ErrorClass::Transport,
            Error::Protocol(_) => ErrorClass::Protocol,
            Error::SessionClosed => ErrorClass::SessionClosed,
            Error::Lifecycle(_) => ErrorClass::Lifecycle,
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One request sent on behalf of a statement
#[derive(Debug, Clone)]
pub struct StatementSpan {
    /// The request type
    pub operation: SpanOperation,
    /// Lifecycle stage when the request was dispatched
    pub stage: Option<LifecycleStage>,
    /// Prepared statement id (if any)
    pub statement_id: Option<u32>,
    /// Statement kind and target (if captured)
    pub statement: Option<String>,
    /// Rows or documents changed
    pub affected_items: Option<u64>,
    /// Request duration
    pub duration: Option<Duration>,
    /// Error class (if failed)
    pub error_class: Option<ErrorClass>,
    /// Error message (if failed)
    pub error_message: Option<String>,
}

impl StatementSpan {
    /// Create a new span for a request
    pub fn new(operation: SpanOperation) -> Self {
        Self {
            operation,
            stage: None,
            statement_id: None,
            statement: None,
            affected_items: None,
            duration: None,
            error_class: None,
            error_message: None,
        }
    }

    /// Set the lifecycle stage
    pub fn with_stage(mut self, stage: LifecycleStage) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Set the statement id
    pub fn with_statement_id(mut self, id: Option<u32>) -> Self {
        self.statement_id = id;
        self
    }

    /// Set the statement description
    pub fn with_statement(mut self, statement: impl Into<String>) -> Self {
        self.statement = Some(statement.into());
        self
    }

    /// Record a successful request
    pub fn record_success(&mut self, affected_items: u64, duration: Duration) {
        self.affected_items = Some(affected_items);
        self.duration = Some(duration);
    }

    /// Record an error
    pub fn record_error(&mut self, error_class: ErrorClass, message: impl Into<String>) {
        self.error_class = Some(error_class);
        self.error_message = Some(message.into());
    }

    /// Check if the span represents a failure
    pub fn is_error(&self) -> bool {
        self.error_class.is_some()
    }

    /// Get a summary string for the span
    pub fn summary(&self) -> String {
        let mut parts = vec![format!("op={}", self.operation)];

        if let Some(stage) = self.stage {
            parts.push(format!("stage={}", stage));
        }

        if let Some(id) = self.statement_id {
            parts.push(format!("stmt_id={}", id));
        }

        if let Some(ref duration) = self.duration {
            parts.push(format!("duration={:?}", duration));
        }

        if let Some(items) = self.affected_items {
            parts.push(format!("affected={}", items));
        }

        if let Some(ref error) = self.error_class {
            parts.push(format!("error={}", error));
        }

        parts.join(" ")
    }
}

/// Trait for types that receive spans
pub trait SpanEmitter: Send + Sync {
    /// Emit a statement span
    fn emit_span(&self, span: &StatementSpan);
}

/// A no-op span emitter for when tracing is disabled
#[derive(Debug, Clone, Default)]
pub struct NoopSpanEmitter;

impl SpanEmitter for NoopSpanEmitter {
    fn emit_span(&self, _span: &StatementSpan) {}
}

/// Forwards spans to the `tracing` crate
#[derive(Debug, Clone, Default)]
pub struct TracingSpanEmitter;

impl SpanEmitter for TracingSpanEmitter {
    fn emit_span(&self, span: &StatementSpan) {
        let stage = span.stage.map(|s| s.as_str()).unwrap_or("-");
        let statement = span.statement.as_deref().unwrap_or("-");
        let duration_us = span.duration.map(|d| d.as_micros() as u64);
        match span.error_class {
            Some(class) => tracing::debug!(
                target: "mysqlx_prepared",
                operation = span.operation.as_str(),
                stage,
                statement_id = span.statement_id,
                statement,
                duration_us,
                error_class = class.as_str(),
                error = span.error_message.as_deref().unwrap_or(""),
                "statement request failed"
            ),
            None => tracing::trace!(
                target: "mysqlx_prepared",
                operation = span.operation.as_str(),
                stage,
                statement_id = span.statement_id,
                statement,
                duration_us,
                affected_items = span.affected_items,
                "statement request"
            ),
        }
    }
}

/// A span emitter that captures spans for assertions
#[derive(Debug, Default)]
pub struct TestSpanEmitter {
    spans: std::sync::Mutex<Vec<StatementSpan>>,
}

impl TestSpanEmitter {
    /// Create a new test span emitter
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all captured spans
    pub fn get_spans(&self) -> Vec<StatementSpan> {
        self.spans.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Operations of all captured spans, in order
    pub fn operations(&self) -> Vec<SpanOperation> {
        self.get_spans().iter().map(|s| s.operation).collect()
    }

    /// Clear all captured spans
    pub fn clear(&self) {
        if let Ok(mut spans) = self.spans.lock() {
            spans.clear();
        }
    }

    /// Get the number of captured spans
    pub fn len(&self) -> usize {
        self.spans.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Check if no spans have been captured
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SpanEmitter for TestSpanEmitter {
    fn emit_span(&self, span: &StatementSpan) {
        if let Ok(mut spans) = self.spans.lock() {
            spans.push(span.clone());
        }
    }
}

/// Helper to time a request and build its span
pub struct SpanTimer {
    start: Instant,
    span: StatementSpan,
}

impl SpanTimer {
    /// Start timing a request
    pub fn start(operation: SpanOperation) -> Self {
        Self {
            start: Instant::now(),
            span: StatementSpan::new(operation),
        }
    }

    /// Start timing a request with the span already filled in
    pub fn start_with(span: StatementSpan) -> Self {
        Self {
            start: Instant::now(),
            span,
        }
    }

    /// Get mutable access to the span
    pub fn span_mut(&mut self) -> &mut StatementSpan {
        &mut self.span
    }

    /// Finish timing and record success
    pub fn finish_success(mut self, affected_items: u64) -> StatementSpan {
        let duration = self.start.elapsed();
        self.span.record_success(affected_items, duration);
        self.span
    }

    /// Finish timing and record an error
    pub fn finish_error(
        mut self,
        error_class: ErrorClass,
        message: impl Into<String>,
    ) -> StatementSpan {
        self.span.duration = Some(self.start.elapsed());
        self.span.record_error(error_class, message);
        self.span
    }

    /// Get the elapsed duration so far
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_operation_as_str() {
        assert_eq!(SpanOperation::Plain.as_str(), "plain");
        assert_eq!(SpanOperation::Prepare.as_str(), "prepare");
        assert_eq!(SpanOperation::ExecutePrepared.as_str(), "execute_prepared");
        assert_eq!(SpanOperation::Deallocate.as_str(), "deallocate");
    }

    #[test]
    fn test_error_class_from_error() {
        let config = PreparedStatementConfig::default();
        assert_eq!(
            ErrorClass::from_error(&Error::server(1047, "08S01", "Unknown command"), &config),
            ErrorClass::PrepareUnsupported
        );
        assert_eq!(
            ErrorClass::from_error(&Error::server(1461, "42000", "Too many"), &config),
            ErrorClass::PrepareExhausted
        );
        assert_eq!(
            ErrorClass::from_error(&Error::server(1064, "42000", "Syntax"), &config),
            ErrorClass::Server
        );
        assert_eq!(
            ErrorClass::from_error(&Error::Transport("eof".into()), &config),
            ErrorClass::Transport
        );
        assert_eq!(
            ErrorClass::from_error(&Error::SessionClosed, &config),
            ErrorClass::SessionClosed
        );
    }

    #[test]
    fn test_span_builders() {
        let span = StatementSpan::new(SpanOperation::ExecutePrepared)
            .with_stage(LifecycleStage::ToExecute)
            .with_statement_id(Some(3))
            .with_statement("find `app`.`users`");

        assert_eq!(span.stage, Some(LifecycleStage::ToExecute));
        assert_eq!(span.statement_id, Some(3));
        assert_eq!(span.statement.as_deref(), Some("find `app`.`users`"));
    }

    #[test]
    fn test_span_record_error() {
        let mut span = StatementSpan::new(SpanOperation::Prepare);
        span.record_error(ErrorClass::PrepareExhausted, "Too many statements");

        assert!(span.is_error());
        assert_eq!(span.error_class, Some(ErrorClass::PrepareExhausted));
    }

    #[test]
    fn test_span_summary() {
        let mut span = StatementSpan::new(SpanOperation::ExecutePrepared)
            .with_stage(LifecycleStage::ToExecute)
            .with_statement_id(Some(2));
        span.record_success(5, Duration::from_millis(3));

        let summary = span.summary();
        assert!(summary.contains("op=execute_prepared"));
        assert!(summary.contains("stage=to_execute"));
        assert!(summary.contains("stmt_id=2"));
        assert!(summary.contains("affected=5"));
    }

    #[test]
    fn test_test_span_emitter() {
        let emitter = TestSpanEmitter::new();
        assert!(emitter.is_empty());

        emitter.emit_span(&StatementSpan::new(SpanOperation::Plain));
        emitter.emit_span(&StatementSpan::new(SpanOperation::Prepare));

        assert_eq!(emitter.len(), 2);
        assert_eq!(
            emitter.operations(),
            vec![SpanOperation::Plain, SpanOperation::Prepare]
        );

        emitter.clear();
        assert!(emitter.is_empty());
    }

    #[test]
    fn test_span_timer() {
        let timer = SpanTimer::start(SpanOperation::Plain);
        std::thread::sleep(Duration::from_millis(5));

        let span = timer.finish_success(1);
        assert!(span.duration.unwrap() >= Duration::from_millis(5));
        assert_eq!(span.affected_items, Some(1));
    }

    #[test]
    fn test_span_timer_error() {
        let timer = SpanTimer::start_with(
            StatementSpan::new(SpanOperation::Deallocate).with_statement_id(Some(4)),
        );
        let span = timer.finish_error(ErrorClass::Transport, "connection reset");

        assert!(span.is_error());
        assert_eq!(span.statement_id, Some(4));
        assert!(span.duration.is_some());
    }

    #[test]
    fn test_tracing_emitter_does_not_panic() {
        let mut span = StatementSpan::new(SpanOperation::Prepare);
        span.record_error(ErrorClass::Server, "boom");
        TracingSpanEmitter.emit_span(&span);
        NoopSpanEmitter.emit_span(&span);
    }
}
