//! Typed error hierarchy for the Orchestra engine.
//!
//! Two top-level enums cover the two failure domains:
//! - `ProviderError` — a single adapter invocation failed in a typed,
//!   recoverable way; absorbed by the fallback chain
//! - `EngineError` — failures that surface past the chain to the
//!   orchestrator or the session driver

use std::path::PathBuf;
use thiserror::Error;

use crate::adapter::Role;

/// Typed failure kinds for one backend invocation.
///
/// These are the only kinds the fallback chain will rotate on; anything
/// outside this set is a programming error and propagates as `anyhow`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderErrorKind {
    RateLimit,
    ContextExceeded,
    Timeout,
    ApiError,
}

impl ProviderErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "RATE_LIMIT",
            Self::ContextExceeded => "CONTEXT_EXCEEDED",
            Self::Timeout => "TIMEOUT",
            Self::ApiError => "API_ERROR",
        }
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One adapter invocation failed with a classified cause.
#[derive(Debug, Error)]
#[error("{provider} failed with {kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub provider: String,
    pub message: String,
}

impl ProviderError {
    pub fn new(
        kind: ProviderErrorKind,
        provider: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            provider: provider.into(),
            message: message.into(),
        }
    }
}

/// Failures that escape the fallback chain.
///
/// Only `ExhaustedProviders`, `PlanMissing` and `StateCorrupted` reach the
/// session driver; the rest are driven through state-machine transitions.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("All adapters for role {role} failed")]
    ExhaustedProviders { role: Role },

    #[error("Architect reported success but no plan was written to {path}")]
    PlanMissing { path: PathBuf },

    #[error("Repeated audit rejections at the iteration cap ({iterations})")]
    AuditUnrecoverable { iterations: u32 },

    #[error("Validation rejected {path}: {reason}")]
    ValidationFailed { path: PathBuf, reason: String },

    #[error("Session state at {path} failed schema check: {reason}")]
    StateCorrupted { path: PathBuf, reason: String },

    #[error("Session cancelled by user")]
    UserCancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Fatal errors end the session with no useful recovery path.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::PlanMissing { .. } | Self::StateCorrupted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_kind_round_trips_through_serde() {
        let json = serde_json::to_string(&ProviderErrorKind::RateLimit).unwrap();
        assert_eq!(json, "\"RATE_LIMIT\"");
        let parsed: ProviderErrorKind = serde_json::from_str("\"CONTEXT_EXCEEDED\"").unwrap();
        assert_eq!(parsed, ProviderErrorKind::ContextExceeded);
    }

    #[test]
    fn provider_error_display_includes_provider_and_kind() {
        let err = ProviderError::new(ProviderErrorKind::Timeout, "gemini", "deadline expired");
        let msg = err.to_string();
        assert!(msg.contains("gemini"));
        assert!(msg.contains("TIMEOUT"));
    }

    #[test]
    fn engine_error_exhausted_providers_carries_role() {
        let err = EngineError::ExhaustedProviders {
            role: Role::Executor,
        };
        assert!(err.to_string().contains("executor"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn plan_missing_and_state_corrupted_are_fatal() {
        let plan = EngineError::PlanMissing {
            path: PathBuf::from(".orchestra/plan"),
        };
        let state = EngineError::StateCorrupted {
            path: PathBuf::from(".orchestra/state.json"),
            reason: "missing sessionId".into(),
        };
        assert!(plan.is_fatal());
        assert!(state.is_fatal());
        assert!(!EngineError::UserCancelled.is_fatal());
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        let provider = ProviderError::new(ProviderErrorKind::ApiError, "glm", "exit 1");
        assert_std_error(&provider);
        let engine = EngineError::UserCancelled;
        assert_std_error(&engine);
    }
}
