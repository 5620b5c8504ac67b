//! Connector error taxonomy with transient/validation classification.

use thiserror::Error;

/// How a failed connector call should be treated by the caller.
///
/// This is the typed replacement for exception-based control flow: the
/// executor matches on the class instead of parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Temporary condition (timeout, connectivity). Retry per backoff policy.
    Transient,
    /// The remote system rejected the data. Retrying cannot change the
    /// outcome; the operation is terminal without consuming retry budget.
    Validation,
    /// Anything else: configuration problems, unexpected internal failures.
    /// Terminal after the retry budget is exhausted.
    Fatal,
}

/// Error that can occur during connector operations.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Failed to establish connection to the target system.
    #[error("connection failed: {message}")]
    ConnectionFailed {
        /// Description of the connection failure.
        message: String,
    },

    /// Connection timed out.
    #[error("connection timeout after {timeout_secs} seconds")]
    ConnectionTimeout {
        /// Configured timeout that elapsed.
        timeout_secs: u64,
    },

    /// Target system is temporarily unavailable.
    #[error("target system unavailable: {message}")]
    TargetUnavailable {
        /// Description reported by the target system.
        message: String,
    },

    /// The target system rejected an attribute value.
    #[error("value rejected for attribute '{attribute}': {message}")]
    ValueRejected {
        /// Attribute whose value was rejected.
        attribute: String,
        /// Rejection reason from the target system.
        message: String,
    },

    /// The payload does not match the target schema.
    #[error("schema mismatch: {message}")]
    SchemaMismatch {
        /// Description of the mismatch.
        message: String,
    },

    /// A required attribute is missing from the payload.
    #[error("missing required attribute '{attribute}'")]
    MissingRequiredAttribute {
        /// The attribute the target system requires.
        attribute: String,
    },

    /// Object already exists in the target system (create conflict).
    #[error("object already exists: {identifier}")]
    ObjectAlreadyExists {
        /// Identifier of the conflicting object.
        identifier: String,
    },

    /// Object not found in the target system (update/delete target missing).
    #[error("object not found: {identifier}")]
    ObjectNotFound {
        /// Identifier that could not be resolved.
        identifier: String,
    },

    /// Invalid credentials or insufficient permissions.
    #[error("authentication failed: {message}")]
    AuthenticationFailed {
        /// Description of the authentication failure.
        message: String,
    },

    /// Connector configuration is invalid.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration {
        /// What is wrong with the configuration.
        message: String,
    },

    /// Internal connector error.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal failure.
        message: String,
    },
}

impl ConnectorError {
    /// Classify this error for the executor's retry decision.
    pub fn classify(&self) -> FailureClass {
        match self {
            ConnectorError::ConnectionFailed { .. }
            | ConnectorError::ConnectionTimeout { .. }
            | ConnectorError::TargetUnavailable { .. } => FailureClass::Transient,
            ConnectorError::ValueRejected { .. }
            | ConnectorError::SchemaMismatch { .. }
            | ConnectorError::MissingRequiredAttribute { .. }
            | ConnectorError::ObjectAlreadyExists { .. } => FailureClass::Validation,
            ConnectorError::ObjectNotFound { .. }
            | ConnectorError::AuthenticationFailed { .. }
            | ConnectorError::InvalidConfiguration { .. }
            | ConnectorError::Internal { .. } => FailureClass::Fatal,
        }
    }

    /// Check if this error is transient and the operation should be retried.
    pub fn is_transient(&self) -> bool {
        self.classify() == FailureClass::Transient
    }

    /// Check if this error is a validation failure (terminal, no retry).
    pub fn is_validation(&self) -> bool {
        self.classify() == FailureClass::Validation
    }

    /// Get a stable error code for classification in logs and archives.
    pub fn error_code(&self) -> &'static str {
        match self {
            ConnectorError::ConnectionFailed { .. } => "CONNECTION_FAILED",
            ConnectorError::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            ConnectorError::TargetUnavailable { .. } => "TARGET_UNAVAILABLE",
            ConnectorError::ValueRejected { .. } => "VALUE_REJECTED",
            ConnectorError::SchemaMismatch { .. } => "SCHEMA_MISMATCH",
            ConnectorError::MissingRequiredAttribute { .. } => "MISSING_REQUIRED_ATTRIBUTE",
            ConnectorError::ObjectAlreadyExists { .. } => "OBJECT_EXISTS",
            ConnectorError::ObjectNotFound { .. } => "OBJECT_NOT_FOUND",
            ConnectorError::AuthenticationFailed { .. } => "AUTH_FAILED",
            ConnectorError::InvalidConfiguration { .. } => "INVALID_CONFIG",
            ConnectorError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Create a connection failed error.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        ConnectorError::ConnectionFailed {
            message: message.into(),
        }
    }

    /// Create a target-unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        ConnectorError::TargetUnavailable {
            message: message.into(),
        }
    }

    /// Create a value-rejected error.
    pub fn value_rejected(attribute: impl Into<String>, message: impl Into<String>) -> Self {
        ConnectorError::ValueRejected {
            attribute: attribute.into(),
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        ConnectorError::Internal {
            message: message.into(),
        }
    }
}

/// Result type for connector operations.
pub type ConnectorResult<T> = Result<T, ConnectorError>;
