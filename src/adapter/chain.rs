//! Role-scoped fallback chain.
//!
//! An ordered list of adapters for one role, primary first. Selection
//! consults availability and the rate ledger; invocation failures with a
//! typed kind rotate to the next eligible adapter. Every invocation,
//! successful or not, is returned as an [`Attempt`] for the caller to pin
//! onto the current workflow step.

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::errors::ProviderErrorKind;
use crate::events;
use crate::rate::RateLedger;
use crate::state::session::Attempt;

use super::{Adapter, AdapterInfo, InvokeRequest, InvokeResult, Role, default_chain_order};

/// What one chain call produced: the attempt trail, the rotation count,
/// and the winning result if any adapter succeeded.
#[derive(Debug)]
pub struct ChainOutcome {
    pub attempts: Vec<Attempt>,
    pub rotations: u64,
    pub winner: Option<(AdapterInfo, InvokeResult)>,
}

impl ChainOutcome {
    pub fn exhausted(&self) -> bool {
        self.winner.is_none()
    }
}

/// Ordered adapters for one role.
#[derive(Debug, Clone)]
pub struct FallbackChain {
    role: Role,
    adapters: Vec<Adapter>,
}

impl FallbackChain {
    /// Build a chain from an explicit adapter order. Adapters unsuited to
    /// the role are dropped.
    pub fn new(role: Role, adapters: Vec<Adapter>) -> Self {
        let adapters = adapters
            .into_iter()
            .filter(|a| a.info.suits(role))
            .collect();
        Self { role, adapters }
    }

    /// Build the default chain for a role from the adapter registry.
    pub fn for_role(role: Role, registry: &[Adapter]) -> Self {
        let adapters = default_chain_order(role)
            .into_iter()
            .filter_map(|id| registry.iter().find(|a| a.info.id == id))
            .filter(|a| a.info.suits(role))
            .cloned()
            .collect();
        Self { role, adapters }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn adapters(&self) -> &[Adapter] {
        &self.adapters
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Try the chain until an adapter succeeds or every candidate is
    /// spent. The one-substitution rule: at most one ledger-suggested
    /// provider swap per call.
    pub async fn invoke(&self, request: &InvokeRequest, ledger: &Mutex<RateLedger>) -> ChainOutcome {
        let mut outcome = ChainOutcome {
            attempts: Vec::new(),
            rotations: 0,
            winner: None,
        };
        let mut substitution_used = false;
        let mut tried: Vec<String> = Vec::new();
        let mut queue: Vec<&Adapter> = self.adapters.iter().collect();
        let mut first_candidate = true;

        while let Some(adapter) = queue.first().copied() {
            queue.remove(0);
            if tried.contains(&adapter.info.id) {
                continue;
            }

            if !first_candidate {
                outcome.rotations += 1;
                info!(
                    code = events::FALLBACK_ROTATION,
                    role = %self.role,
                    adapter = %adapter.info.id,
                    "fallback chain advanced"
                );
            }
            first_candidate = false;

            if !adapter.is_available().await {
                continue;
            }

            let decision = {
                let mut ledger = ledger.lock().await;
                ledger.check_before_call(adapter.info.provider, self.role)
            };
            if !decision.proceed {
                if decision.use_fallback
                    && !substitution_used
                    && let Some(provider) = decision.fallback_provider
                    && let Some(substitute) = self
                        .adapters
                        .iter()
                        .find(|a| a.info.provider == provider && !tried.contains(&a.info.id))
                {
                    substitution_used = true;
                    info!(
                        code = events::RATE_SUBSTITUTION,
                        from = %adapter.info.provider,
                        to = %provider,
                        reason = %decision.reason,
                        "provider substitution applied"
                    );
                    queue.insert(0, substitute);
                }
                continue;
            }

            tried.push(adapter.info.id.clone());
            let result = adapter.invoke(request).await;
            {
                let mut ledger = ledger.lock().await;
                if let Err(e) = ledger.record_usage(adapter.info.provider) {
                    warn!("failed to persist rate ledger: {e}");
                }
                if result.error_kind == Some(ProviderErrorKind::RateLimit)
                    && let Err(e) = ledger.handle_rate_limit_error(adapter.info.provider)
                {
                    warn!("failed to pin rate limit: {e}");
                }
            }

            outcome.attempts.push(Attempt {
                model_id: adapter.info.id.clone(),
                provider: adapter.info.provider,
                role: self.role,
                tokens_used: result.tokens_used,
                latency_ms: result.duration_ms,
                success: result.success,
                error_code: result.error_kind.into(),
                estimated_cost_usd: result.estimated_cost_usd,
                timestamp: Utc::now(),
            });

            if result.success {
                outcome.winner = Some((adapter.info.clone(), result));
                return outcome;
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::backend::{Backend, RawInvocation};
    use crate::adapter::{CostTier, Provider};
    use crate::state::session::AttemptErrorCode;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    /// Scripted backend: runs a canned sequence of outcomes and writes the
    /// expected outputs on success.
    struct ScriptedBackend {
        script: Vec<Script>,
        cursor: AtomicUsize,
        available: bool,
    }

    #[derive(Clone, Copy)]
    enum Script {
        Ok,
        Stderr(&'static str),
        Timeout,
    }

    impl ScriptedBackend {
        fn new(script: Vec<Script>) -> Self {
            Self {
                script,
                cursor: AtomicUsize::new(0),
                available: true,
            }
        }

        fn unavailable() -> Self {
            Self {
                script: vec![],
                cursor: AtomicUsize::new(0),
                available: false,
            }
        }
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        async fn invoke(&self, request: &InvokeRequest) -> Result<RawInvocation> {
            let idx = self.cursor.fetch_add(1, Ordering::SeqCst);
            let step = self.script.get(idx).copied().unwrap_or(Script::Ok);
            match step {
                Script::Ok => {
                    for out in &request.expected_outputs {
                        if let Some(parent) = out.parent() {
                            std::fs::create_dir_all(parent)?;
                        }
                        std::fs::write(out, "generated")?;
                    }
                    Ok(RawInvocation {
                        exit_code: 0,
                        timed_out: false,
                        stderr_excerpt: String::new(),
                        duration_ms: 5,
                    })
                }
                Script::Stderr(msg) => Ok(RawInvocation {
                    exit_code: 1,
                    timed_out: false,
                    stderr_excerpt: msg.to_string(),
                    duration_ms: 5,
                }),
                Script::Timeout => Ok(RawInvocation {
                    exit_code: -1,
                    timed_out: true,
                    stderr_excerpt: String::new(),
                    duration_ms: 5,
                }),
            }
        }

        async fn probe(&self) -> bool {
            self.available
        }

        fn describe(&self) -> String {
            "scripted".into()
        }
    }

    fn adapter(id: &str, provider: Provider, role: Role, backend: ScriptedBackend) -> Adapter {
        Adapter::new(
            AdapterInfo {
                id: id.into(),
                model: id.into(),
                provider,
                roles: vec![role],
                vision: false,
                tier: CostTier::Cheap,
            },
            Arc::new(backend),
        )
    }

    fn request(dir: &std::path::Path) -> InvokeRequest {
        InvokeRequest {
            prompt: "do the thing".into(),
            working_dir: dir.to_path_buf(),
            deadline: Duration::from_secs(5),
            expected_outputs: vec![dir.join("artifact")],
        }
    }

    fn ledger(dir: &std::path::Path) -> Mutex<RateLedger> {
        Mutex::new(RateLedger::load_or_default(dir.join("ledger.json")).unwrap())
    }

    #[tokio::test]
    async fn primary_success_records_one_attempt_no_rotation() {
        let dir = tempdir().unwrap();
        let chain = FallbackChain::new(
            Role::Executor,
            vec![adapter(
                "glm",
                Provider::Glm,
                Role::Executor,
                ScriptedBackend::new(vec![Script::Ok]),
            )],
        );
        let ledger = ledger(dir.path());
        let outcome = chain.invoke(&request(dir.path()), &ledger).await;

        assert!(!outcome.exhausted());
        assert_eq!(outcome.attempts.len(), 1);
        assert!(outcome.attempts[0].success);
        assert_eq!(outcome.rotations, 0);
        assert_eq!(
            ledger.lock().await.usage(Provider::Glm).used,
            1,
            "usage recorded against the provider"
        );
    }

    #[tokio::test]
    async fn rate_limit_rotates_and_pins_ledger() {
        let dir = tempdir().unwrap();
        let chain = FallbackChain::new(
            Role::Architect,
            vec![
                adapter(
                    "gemini",
                    Provider::Gemini,
                    Role::Architect,
                    ScriptedBackend::new(vec![Script::Stderr("HTTP 429 rate limit")]),
                ),
                adapter(
                    "glm",
                    Provider::Glm,
                    Role::Architect,
                    ScriptedBackend::new(vec![Script::Ok]),
                ),
            ],
        );
        let ledger = ledger(dir.path());
        let outcome = chain.invoke(&request(dir.path()), &ledger).await;

        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(outcome.attempts[0].error_code, AttemptErrorCode::RateLimit);
        assert!(!outcome.attempts[0].success);
        assert!(outcome.attempts[1].success);
        assert_eq!(outcome.rotations, 1);
        assert_eq!(outcome.winner.as_ref().unwrap().0.id, "glm");

        let guard = ledger.lock().await;
        let usage = guard.usage(Provider::Gemini);
        assert!((usage.confidence - 1.0).abs() < f64::EPSILON);
        assert_eq!(usage.estimated_limit, usage.used);
    }

    #[tokio::test]
    async fn unavailable_primary_is_skipped_without_attempt() {
        let dir = tempdir().unwrap();
        let chain = FallbackChain::new(
            Role::Executor,
            vec![
                adapter(
                    "codex",
                    Provider::Codex,
                    Role::Executor,
                    ScriptedBackend::unavailable(),
                ),
                adapter(
                    "glm",
                    Provider::Glm,
                    Role::Executor,
                    ScriptedBackend::new(vec![Script::Ok]),
                ),
            ],
        );
        let ledger = ledger(dir.path());
        let outcome = chain.invoke(&request(dir.path()), &ledger).await;

        assert_eq!(outcome.attempts.len(), 1, "skips record no attempt");
        assert_eq!(outcome.winner.as_ref().unwrap().0.id, "glm");
        assert_eq!(outcome.rotations, 1);
    }

    #[tokio::test]
    async fn exhaustion_returns_all_failed_attempts() {
        let dir = tempdir().unwrap();
        let chain = FallbackChain::new(
            Role::Auditor,
            vec![
                adapter(
                    "opus",
                    Provider::Opus,
                    Role::Auditor,
                    ScriptedBackend::new(vec![Script::Timeout]),
                ),
                adapter(
                    "glm",
                    Provider::Glm,
                    Role::Auditor,
                    ScriptedBackend::new(vec![Script::Stderr("boom")]),
                ),
            ],
        );
        let ledger = ledger(dir.path());
        let outcome = chain.invoke(&request(dir.path()), &ledger).await;

        assert!(outcome.exhausted());
        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(outcome.attempts[0].error_code, AttemptErrorCode::Timeout);
        assert_eq!(outcome.attempts[1].error_code, AttemptErrorCode::ApiError);
    }

    #[tokio::test]
    async fn chain_drops_adapters_unsuited_to_role() {
        let chain = FallbackChain::new(
            Role::Auditor,
            vec![adapter(
                "codex",
                Provider::Codex,
                Role::Executor,
                ScriptedBackend::new(vec![Script::Ok]),
            )],
        );
        assert!(chain.is_empty());
    }
}
