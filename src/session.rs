//! Session handle
//!
//! A [`Session`] ties together the connection's [`PreparedStatementProtocol`],
//! the per-session [`SessionStatementRegistry`] and a [`SpanEmitter`]. Every
//! [`Statement`] created from a session shares them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::PreparedStatementConfig;
use crate::protocol::PreparedStatementProtocol;
use crate::registry::SessionStatementRegistry;
use crate::shape::{StatementKind, Target};
use crate::statement::Statement;
use crate::tracing_support::{SpanEmitter, TracingSpanEmitter};

pub(crate) struct SessionInner {
    pub(crate) protocol: Arc<dyn PreparedStatementProtocol>,
    pub(crate) registry: SessionStatementRegistry,
    pub(crate) emitter: Arc<dyn SpanEmitter>,
    closed: AtomicBool,
}

impl SessionInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A server session that statements are created from
///
/// Cloning is cheap; clones share the same registry and connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a session that reports requests through `tracing`
    pub fn new(
        protocol: Arc<dyn PreparedStatementProtocol>,
        config: PreparedStatementConfig,
    ) -> Self {
        Self::with_emitter(protocol, config, Arc::new(TracingSpanEmitter))
    }

    /// Create a session with a custom span emitter
    pub fn with_emitter(
        protocol: Arc<dyn PreparedStatementProtocol>,
        config: PreparedStatementConfig,
        emitter: Arc<dyn SpanEmitter>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                protocol,
                registry: SessionStatementRegistry::new(config),
                emitter,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Create a statement of any kind
    pub fn statement(&self, kind: StatementKind, target: Target) -> Statement {
        Statement::new(Arc::clone(&self.inner), kind, target)
    }

    /// Find documents in a collection
    pub fn find(&self, schema: impl Into<String>, collection: impl Into<String>) -> Statement {
        self.statement(StatementKind::Find, Target::new(schema, collection))
    }

    /// Modify documents in a collection
    pub fn modify(&self, schema: impl Into<String>, collection: impl Into<String>) -> Statement {
        self.statement(StatementKind::Modify, Target::new(schema, collection))
    }

    /// Remove documents from a collection
    pub fn remove(&self, schema: impl Into<String>, collection: impl Into<String>) -> Statement {
        self.statement(StatementKind::Remove, Target::new(schema, collection))
    }

    /// Select rows from a table
    pub fn select(&self, schema: impl Into<String>, table: impl Into<String>) -> Statement {
        self.statement(StatementKind::Select, Target::new(schema, table))
    }

    /// Update rows in a table
    pub fn update(&self, schema: impl Into<String>, table: impl Into<String>) -> Statement {
        self.statement(StatementKind::Update, Target::new(schema, table))
    }

    /// Delete rows from a table
    pub fn delete(&self, schema: impl Into<String>, table: impl Into<String>) -> Statement {
        self.statement(StatementKind::Delete, Target::new(schema, table))
    }

    /// Statement ids and capability gate of this session
    pub fn registry(&self) -> &SessionStatementRegistry {
        &self.inner.registry
    }

    /// Whether statements in this session may still be prepared
    pub fn prepared_statement_supported(&self) -> bool {
        self.inner.registry.prepared_statement_supported()
    }

    /// Record that the server session was reset
    ///
    /// The server forgets every prepared plan on reset. Statements holding a
    /// plan drop their id without a deallocate and start over on their next
    /// execution. The capability gate is kept.
    pub fn reset(&self) {
        tracing::debug!(in_use = self.inner.registry.in_use(), "session reset");
        self.inner.registry.reset();
    }

    /// Close the session
    ///
    /// Statements created from it fail with
    /// [`Error::SessionClosed`](crate::Error::SessionClosed) from now on.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("session closed");
            self.inner.registry.reset();
        }
    }

    /// Whether [`close`](Self::close) was called
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("registry", &self.inner.registry)
            .field("closed", &self.is_closed())
            .finish()
    }
}
