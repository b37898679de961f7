//! Core error type for the Spindle engine.
//!
//! `EngineError` is used throughout the engine (catalog, registry, store,
//! proxy, orchestrator). When the `axum` feature is enabled, it also
//! implements `IntoResponse` so the HTTP layer can return it directly.

/// How a failed operation may be recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Worth retrying with backoff (timeouts, 5xx, network errors).
    Retryable,
    /// Retrying will not help (contract violations, 4xx, bad expressions).
    Permanent,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid flow: {0}")]
    FlowInvalid(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unknown agent: {0}")]
    AgentUnknown(String),

    #[error("agent conflict: {0}")]
    AgentConflict(String),

    #[error("circuit breaker open for agent {0}")]
    AgentBreakerOpen(String),

    #[error("agent call timed out after {timeout_ms}ms: {agent_id}")]
    AgentTimeout { agent_id: String, timeout_ms: u64 },

    #[error("agent network error for {agent_id}: {message}")]
    AgentNetwork { agent_id: String, message: String },

    #[error("agent contract violation for {agent_id}: {message}")]
    AgentContract {
        agent_id: String,
        message: String,
        status: Option<u16>,
    },

    #[error("agent returned status {status} for {agent_id}")]
    AgentStatus {
        agent_id: String,
        status: u16,
        body: Option<String>,
    },

    #[error("agent {agent_id} reported an error: {message}")]
    AgentReported { agent_id: String, message: String },

    #[error("expression error in `{expr}`: {reason}")]
    Expression { expr: String, reason: String },

    #[error("execution cancelled")]
    Cancelled,

    #[error("execution deadline exceeded")]
    DeadlineExceeded,

    #[error("dispatch queue saturated")]
    Saturated,

    #[error("execution already terminal: {0}")]
    AlreadyTerminal(String),

    #[error("illegal status transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable machine-readable kind, surfaced on `ExecutionContext.error`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FlowInvalid(_) => "flow_invalid",
            Self::NotFound(_) => "not_found",
            Self::AgentUnknown(_) => "agent_unknown",
            Self::AgentConflict(_) => "agent_conflict",
            Self::AgentBreakerOpen(_) => "agent_breaker_open",
            Self::AgentTimeout { .. } => "agent_timeout",
            Self::AgentNetwork { .. } => "agent_network",
            Self::AgentContract { .. } => "agent_contract",
            Self::AgentStatus { .. } => "agent_status",
            Self::AgentReported { .. } => "agent_error",
            Self::Expression { .. } => "expression_error",
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Saturated => "saturated",
            Self::AlreadyTerminal(_) => "already_terminal",
            Self::IllegalTransition { .. } => "illegal_transition",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::Internal(_) => "internal",
        }
    }

    /// Classify a node-level failure per the retry policy: HTTP 408, 425,
    /// 429 and 5xx, network errors, timeouts and open breakers are
    /// retryable; everything else is permanent.
    pub fn recovery(&self) -> Recovery {
        match self {
            Self::AgentTimeout { .. } | Self::AgentNetwork { .. } | Self::Saturated => {
                Recovery::Retryable
            }
            // The dispatch fails fast, but backoff may outlive the open
            // window, so retries stay worthwhile.
            Self::AgentBreakerOpen(_) => Recovery::Retryable,
            Self::AgentStatus { status, .. } => match status {
                408 | 425 | 429 => Recovery::Retryable,
                s if *s >= 500 => Recovery::Retryable,
                _ => Recovery::Permanent,
            },
            Self::StoreUnavailable(_) => Recovery::Retryable,
            _ => Recovery::Permanent,
        }
    }

    /// Summary object stored on failed executions and node results.
    pub fn to_detail(&self) -> ErrorDetail {
        ErrorDetail {
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}

/// User-visible failure summary; raw agent bodies are deliberately omitted.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ErrorDetail {
    pub kind: String,
    pub message: String,
}

// ---------------------------------------------------------------------------
// axum integration (opt-in via feature flag)
// ---------------------------------------------------------------------------

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for EngineError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match &self {
            EngineError::FlowInvalid(_) | EngineError::Expression { .. } => {
                StatusCode::BAD_REQUEST
            }
            EngineError::NotFound(_) | EngineError::AgentUnknown(_) => StatusCode::NOT_FOUND,
            EngineError::AgentConflict(_) | EngineError::AlreadyTerminal(_) => {
                StatusCode::CONFLICT
            }
            EngineError::Saturated => StatusCode::TOO_MANY_REQUESTS,
            EngineError::AgentTimeout { .. } | EngineError::DeadlineExceeded => {
                StatusCode::GATEWAY_TIMEOUT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({ "error": self.to_string(), "kind": self.kind() });
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        for status in [408u16, 425, 429, 500, 502, 503] {
            let err = EngineError::AgentStatus {
                agent_id: "a".into(),
                status,
                body: None,
            };
            assert_eq!(err.recovery(), Recovery::Retryable, "status {status}");
        }
        for status in [400u16, 401, 403, 404, 422] {
            let err = EngineError::AgentStatus {
                agent_id: "a".into(),
                status,
                body: None,
            };
            assert_eq!(err.recovery(), Recovery::Permanent, "status {status}");
        }
    }

    #[test]
    fn kinds_are_stable() {
        assert_eq!(EngineError::Cancelled.kind(), "cancelled");
        assert_eq!(
            EngineError::FlowInvalid("cycle at a".into()).kind(),
            "flow_invalid"
        );
    }

    #[test]
    fn open_breaker_is_retryable() {
        let err = EngineError::AgentBreakerOpen("x".into());
        assert_eq!(err.recovery(), Recovery::Retryable);
    }
}
