//! Session-level configuration for statement preparation
//!
//! The configuration decides whether statements may be prepared at all and
//! which server error codes mean "preparation is not available here". Those
//! codes are the only prepare failures that are absorbed; every other error
//! reaches the caller.
//!
//! # Example
//!
//! ```
//! use mysqlx_prepared::config::PreparedStatementConfig;
//!
//! let config = PreparedStatementConfig::builder()
//!     .exhausted_code(5141)
//!     .max_statement_ids(64)
//!     .build();
//!
//! assert!(config.enabled());
//! assert_eq!(config.max_statement_ids(), Some(64));
//! ```

use crate::error::{
    Error, PrepareErrorClass, ER_MAX_PREPARED_STMT_COUNT_REACHED, ER_UNKNOWN_COM_ERROR,
};

/// Configuration for prepared statement handling within a session
#[derive(Debug, Clone)]
pub struct PreparedStatementConfig {
    /// Whether statements may be promoted to prepared statements
    enabled: bool,
    /// Codes meaning the server cannot prepare statements
    unsupported_codes: Vec<u16>,
    /// Codes meaning the server ran out of prepared statement room
    exhausted_codes: Vec<u16>,
    /// Client side cap on simultaneously allocated ids
    max_statement_ids: Option<usize>,
    /// Whether spans describe the statement target
    include_shape_in_spans: bool,
}

impl Default for PreparedStatementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            unsupported_codes: vec![ER_UNKNOWN_COM_ERROR],
            exhausted_codes: vec![ER_MAX_PREPARED_STMT_COUNT_REACHED],
            max_statement_ids: None,
            include_shape_in_spans: true,
        }
    }
}

impl PreparedStatementConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration that never prepares statements
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Create a builder for configuring preparation
    pub fn builder() -> PreparedStatementConfigBuilder {
        PreparedStatementConfigBuilder::default()
    }

    /// Check if preparation is enabled
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Codes classified as [`PrepareErrorClass::Unsupported`]
    pub fn unsupported_codes(&self) -> &[u16] {
        &self.unsupported_codes
    }

    /// Codes classified as [`PrepareErrorClass::Exhausted`]
    pub fn exhausted_codes(&self) -> &[u16] {
        &self.exhausted_codes
    }

    /// Get the client side id cap (if set)
    pub fn max_statement_ids(&self) -> Option<usize> {
        self.max_statement_ids
    }

    /// Check if spans carry the statement description
    pub fn include_shape_in_spans(&self) -> bool {
        self.include_shape_in_spans
    }

    /// Classify an error returned by a prepare request
    pub fn classify(&self, error: &Error) -> PrepareErrorClass {
        match error.server_code() {
            Some(code) if self.unsupported_codes.contains(&code) => PrepareErrorClass::Unsupported,
            Some(code) if self.exhausted_codes.contains(&code) => PrepareErrorClass::Exhausted,
            _ => PrepareErrorClass::Other,
        }
    }
}

/// Builder for PreparedStatementConfig
#[derive(Debug, Default)]
pub struct PreparedStatementConfigBuilder {
    enabled: Option<bool>,
    extra_unsupported: Vec<u16>,
    extra_exhausted: Vec<u16>,
    max_statement_ids: Option<Option<usize>>,
    include_shape_in_spans: Option<bool>,
}

impl PreparedStatementConfigBuilder {
    /// Enable or disable preparation
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Treat another server code as "preparation unsupported"
    pub fn unsupported_code(mut self, code: u16) -> Self {
        self.extra_unsupported.push(code);
        self
    }

    /// Treat another server code as "prepared statement budget exhausted"
    pub fn exhausted_code(mut self, code: u16) -> Self {
        self.extra_exhausted.push(code);
        self
    }

    /// Cap the number of ids live at the same time
    pub fn max_statement_ids(mut self, max: usize) -> Self {
        self.max_statement_ids = Some(Some(max));
        self
    }

    /// Remove the id cap
    pub fn no_statement_id_limit(mut self) -> Self {
        self.max_statement_ids = Some(None);
        self
    }

    /// Choose whether spans describe the statement target
    pub fn include_shape_in_spans(mut self, include: bool) -> Self {
        self.include_shape_in_spans = Some(include);
        self
    }

    /// Build the configuration
    pub fn build(self) -> PreparedStatementConfig {
        let default = PreparedStatementConfig::default();
        let mut unsupported_codes = default.unsupported_codes;
        for code in self.extra_unsupported {
            if !unsupported_codes.contains(&code) {
                unsupported_codes.push(code);
            }
        }
        let mut exhausted_codes = default.exhausted_codes;
        for code in self.extra_exhausted {
            if !exhausted_codes.contains(&code) {
                exhausted_codes.push(code);
            }
        }

        PreparedStatementConfig {
            enabled: self.enabled.unwrap_or(default.enabled),
            unsupported_codes,
            exhausted_codes,
            max_statement_ids: self.max_statement_ids.unwrap_or(default.max_statement_ids),
            include_shape_in_spans: self
                .include_shape_in_spans
                .unwrap_or(default.include_shape_in_spans),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = PreparedStatementConfig::default();
        assert!(config.enabled());
        assert_eq!(config.unsupported_codes(), &[ER_UNKNOWN_COM_ERROR]);
        assert_eq!(config.exhausted_codes(), &[ER_MAX_PREPARED_STMT_COUNT_REACHED]);
        assert!(config.max_statement_ids().is_none());
        assert!(config.include_shape_in_spans());
    }

    #[test]
    fn test_config_disabled() {
        let config = PreparedStatementConfig::disabled();
        assert!(!config.enabled());
    }

    #[test]
    fn test_config_builder() {
        let config = PreparedStatementConfig::builder()
            .enabled(false)
            .unsupported_code(5001)
            .exhausted_code(5141)
            .exhausted_code(5141)
            .max_statement_ids(8)
            .include_shape_in_spans(false)
            .build();

        assert!(!config.enabled());
        assert_eq!(config.unsupported_codes(), &[1047, 5001]);
        assert_eq!(config.exhausted_codes(), &[1461, 5141]);
        assert_eq!(config.max_statement_ids(), Some(8));
        assert!(!config.include_shape_in_spans());
    }

    #[test]
    fn test_config_no_statement_id_limit() {
        let config = PreparedStatementConfig::builder()
            .max_statement_ids(4)
            .no_statement_id_limit()
            .build();
        assert!(config.max_statement_ids().is_none());
    }

    #[test]
    fn test_classify_known_codes() {
        let config = PreparedStatementConfig::default();
        assert_eq!(
            config.classify(&Error::server(1047, "08S01", "Unknown command")),
            PrepareErrorClass::Unsupported
        );
        assert_eq!(
            config.classify(&Error::server(1461, "42000", "Too many statements")),
            PrepareErrorClass::Exhausted
        );
    }

    #[test]
    fn test_classify_other_errors() {
        let config = PreparedStatementConfig::default();
        assert_eq!(
            config.classify(&Error::server(1213, "40001", "Deadlock found")),
            PrepareErrorClass::Other
        );
        assert_eq!(
            config.classify(&Error::Transport("broken pipe".into())),
            PrepareErrorClass::Other
        );
    }

    #[test]
    fn test_classify_configured_code() {
        let config = PreparedStatementConfig::builder().unsupported_code(5001).build();
        assert_eq!(
            config.classify(&Error::server(5001, "HY000", "Unexpected message")),
            PrepareErrorClass::Unsupported
        );
    }
}
