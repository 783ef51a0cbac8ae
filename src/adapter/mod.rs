//! Adapter façade over one LLM CLI backend.
//!
//! An [`Adapter`] pairs static [`AdapterInfo`] (provider, model, role
//! suitability, cost tier) with a [`Backend`] that does the actual
//! subprocess work. Coordination with other roles happens through files in
//! the session scratch area; the adapter never parses backend stdout.

pub mod backend;
pub mod chain;

pub use backend::{Backend, CliBackend, RawInvocation};
pub use chain::FallbackChain;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::OrchestraConfig;
use crate::errors::ProviderErrorKind;

/// The four logical roles in one orchestration cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Architect,
    Executor,
    Auditor,
    Consultant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Architect => "architect",
            Role::Executor => "executor",
            Role::Auditor => "auditor",
            Role::Consultant => "consultant",
        }
    }

    pub const ALL: [Role; 4] = [Role::Architect, Role::Executor, Role::Auditor, Role::Consultant];
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The billing and rate-limit boundary behind an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Sonnet,
    Opus,
    Gemini,
    Glm,
    Codex,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Sonnet => "sonnet",
            Provider::Opus => "opus",
            Provider::Gemini => "gemini",
            Provider::Glm => "glm",
            Provider::Codex => "codex",
        }
    }

    pub const ALL: [Provider; 5] = [
        Provider::Sonnet,
        Provider::Opus,
        Provider::Gemini,
        Provider::Glm,
        Provider::Codex,
    ];
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Relative cost tier used by the reward function and adapter selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostTier {
    Cheap,
    Medium,
    Expensive,
}

impl CostTier {
    /// Rough USD per million tokens, used for `estimated_cost_usd`.
    pub fn usd_per_mtok(&self) -> f64 {
        match self {
            CostTier::Cheap => 0.3,
            CostTier::Medium => 3.0,
            CostTier::Expensive => 15.0,
        }
    }
}

/// Static description of one adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterInfo {
    /// Stable identifier, e.g. "claude-sonnet"
    pub id: String,
    /// Model name passed to the backend CLI
    pub model: String,
    /// Rate-limit boundary this adapter bills against
    pub provider: Provider,
    /// Roles this adapter may fill
    pub roles: Vec<Role>,
    /// Whether the adapter can audit screenshots
    #[serde(default)]
    pub vision: bool,
    pub tier: CostTier,
}

impl AdapterInfo {
    pub fn suits(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

/// One invocation request handed to a backend.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub prompt: String,
    pub working_dir: PathBuf,
    pub deadline: Duration,
    /// Files the backend is instructed to write; the adapter verifies they
    /// exist after the call.
    pub expected_outputs: Vec<PathBuf>,
}

/// Classified result of one invocation.
#[derive(Debug, Clone)]
pub struct InvokeResult {
    pub success: bool,
    pub exit_code: i32,
    pub duration_ms: u64,
    /// First expected output that exists, if any
    pub output_artifact: Option<PathBuf>,
    pub error_kind: Option<ProviderErrorKind>,
    pub tokens_used: u64,
    pub estimated_cost_usd: f64,
    /// True when the result was served from the response cache
    pub cached: bool,
}

/// An adapter: static info plus a swappable backend.
///
/// Tests swap in scripted backends; production uses [`CliBackend`].
#[derive(Clone)]
pub struct Adapter {
    pub info: AdapterInfo,
    backend: Arc<dyn Backend>,
    cache_dir: Option<PathBuf>,
}

impl Adapter {
    pub fn new(info: AdapterInfo, backend: Arc<dyn Backend>) -> Self {
        Self {
            info,
            backend,
            cache_dir: None,
        }
    }

    /// Enable the response cache under the given directory.
    pub fn with_cache_dir(mut self, dir: PathBuf) -> Self {
        self.cache_dir = Some(dir);
        self
    }

    pub async fn is_available(&self) -> bool {
        self.backend.probe().await
    }

    pub fn describe(&self) -> String {
        format!("{} ({})", self.info.id, self.backend.describe())
    }

    /// Invoke the backend and classify the outcome.
    ///
    /// Success requires exit 0 *and* every expected output file present.
    pub async fn invoke(&self, request: &InvokeRequest) -> InvokeResult {
        if let Some(hit) = self.try_cache(request) {
            return hit;
        }

        let raw = match self.backend.invoke(request).await {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(adapter = %self.info.id, "backend invocation failed: {err}");
                return InvokeResult {
                    success: false,
                    exit_code: -1,
                    duration_ms: 0,
                    output_artifact: None,
                    error_kind: Some(ProviderErrorKind::ApiError),
                    tokens_used: 0,
                    estimated_cost_usd: 0.0,
                    cached: false,
                };
            }
        };

        let missing_output = request
            .expected_outputs
            .iter()
            .any(|p| !p.exists() || std::fs::metadata(p).map(|m| m.len()).unwrap_or(0) == 0);
        let output_artifact = request
            .expected_outputs
            .iter()
            .find(|p| p.exists())
            .cloned();

        let error_kind = classify(&raw, missing_output);
        let success = error_kind.is_none();

        let output_bytes: u64 = request
            .expected_outputs
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();
        // Token accounting is an estimate: the CLIs are opaque.
        let tokens_used = (request.prompt.len() as u64 + output_bytes) / 4;
        let estimated_cost_usd = tokens_used as f64 / 1_000_000.0 * self.info.tier.usd_per_mtok();

        let result = InvokeResult {
            success,
            exit_code: raw.exit_code,
            duration_ms: raw.duration_ms,
            output_artifact,
            error_kind,
            tokens_used,
            estimated_cost_usd,
            cached: false,
        };

        if result.success {
            self.store_cache(request);
        }

        result
    }

    fn cache_key(&self, request: &InvokeRequest) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.info.model.as_bytes());
        hasher.update(b"\0");
        hasher.update(request.prompt.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// On a cache hit, replay the stored output files and report a
    /// zero-cost attempt.
    fn try_cache(&self, request: &InvokeRequest) -> Option<InvokeResult> {
        let dir = self.cache_dir.as_ref()?.join(self.cache_key(request));
        if !dir.is_dir() {
            return None;
        }
        for (i, out) in request.expected_outputs.iter().enumerate() {
            let cached = dir.join(format!("{i:02}"));
            let content = std::fs::read(&cached).ok()?;
            if let Some(parent) = out.parent() {
                std::fs::create_dir_all(parent).ok()?;
            }
            std::fs::write(out, content).ok()?;
        }
        Some(InvokeResult {
            success: true,
            exit_code: 0,
            duration_ms: 0,
            output_artifact: request.expected_outputs.first().cloned(),
            error_kind: None,
            tokens_used: 0,
            estimated_cost_usd: 0.0,
            cached: true,
        })
    }

    fn store_cache(&self, request: &InvokeRequest) {
        let Some(dir) = self.cache_dir.as_ref() else {
            return;
        };
        let dir = dir.join(self.cache_key(request));
        if std::fs::create_dir_all(&dir).is_err() {
            return;
        }
        for (i, out) in request.expected_outputs.iter().enumerate() {
            if let Ok(content) = std::fs::read(out) {
                let _ = std::fs::write(dir.join(format!("{i:02}")), content);
            }
        }
    }
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// Map raw process facts to a typed error kind; `None` means success.
fn classify(raw: &RawInvocation, missing_output: bool) -> Option<ProviderErrorKind> {
    if raw.timed_out {
        return Some(ProviderErrorKind::Timeout);
    }
    let stderr = raw.stderr_excerpt.to_lowercase();
    if stderr.contains("429") || stderr.contains("rate limit") || stderr.contains("rate-limit") {
        return Some(ProviderErrorKind::RateLimit);
    }
    if stderr.contains("context length")
        || stderr.contains("context window")
        || stderr.contains("token limit")
        || stderr.contains("out of memory")
    {
        return Some(ProviderErrorKind::ContextExceeded);
    }
    if raw.exit_code != 0 {
        return Some(ProviderErrorKind::ApiError);
    }
    if missing_output {
        // Clean exit without the artifact is indistinguishable from an
        // API-side truncation.
        return Some(ProviderErrorKind::ApiError);
    }
    None
}

/// Build the default adapter set from the resolved configuration.
///
/// One adapter per backend CLI, each tagged with the roles it may fill and
/// its cost tier.
pub fn default_adapters(config: &OrchestraConfig) -> Vec<Adapter> {
    let specs: [(&str, &str, Provider, &[Role], bool, CostTier, &str); 5] = [
        (
            "glm",
            "glm-4.7",
            Provider::Glm,
            &[Role::Architect, Role::Executor, Role::Auditor],
            false,
            CostTier::Cheap,
            "glm",
        ),
        (
            "claude-sonnet",
            "sonnet",
            Provider::Sonnet,
            &[Role::Executor, Role::Consultant],
            false,
            CostTier::Medium,
            "claude",
        ),
        (
            "claude-opus",
            "opus",
            Provider::Opus,
            &[Role::Auditor, Role::Consultant],
            true,
            CostTier::Expensive,
            "claude",
        ),
        (
            "gemini",
            "gemini-2.5-pro",
            Provider::Gemini,
            &[Role::Architect, Role::Consultant],
            true,
            CostTier::Medium,
            "gemini",
        ),
        (
            "codex",
            "gpt-5-codex",
            Provider::Codex,
            &[Role::Executor],
            false,
            CostTier::Medium,
            "codex",
        ),
    ];

    specs
        .into_iter()
        .map(|(id, model, provider, roles, vision, tier, cmd)| {
            let info = AdapterInfo {
                id: id.to_string(),
                model: model.to_string(),
                provider,
                roles: roles.to_vec(),
                vision,
                tier,
            };
            let backend = Arc::new(CliBackend::for_provider(cmd, model, provider));
            let mut adapter = Adapter::new(info, backend);
            if config.tui.cache_enabled {
                adapter = adapter.with_cache_dir(config.cache_dir());
            }
            adapter
        })
        .collect()
}

/// Role preference order over the default adapter set, primary first.
pub fn default_chain_order(role: Role) -> Vec<&'static str> {
    match role {
        Role::Architect => vec!["gemini", "glm"],
        Role::Executor => vec!["glm", "claude-sonnet", "codex"],
        Role::Auditor => vec!["claude-opus", "glm"],
        Role::Consultant => vec!["claude-opus", "gemini", "claude-sonnet"],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(exit_code: i32, timed_out: bool, stderr: &str) -> RawInvocation {
        RawInvocation {
            exit_code,
            timed_out,
            stderr_excerpt: stderr.to_string(),
            duration_ms: 10,
        }
    }

    #[test]
    fn classify_success_requires_exit_zero_and_outputs() {
        assert_eq!(classify(&raw(0, false, ""), false), None);
        assert_eq!(
            classify(&raw(0, false, ""), true),
            Some(ProviderErrorKind::ApiError)
        );
    }

    #[test]
    fn classify_timeout_wins_over_everything() {
        assert_eq!(
            classify(&raw(1, true, "429 too many requests"), true),
            Some(ProviderErrorKind::Timeout)
        );
    }

    #[test]
    fn classify_rate_limit_from_stderr() {
        assert_eq!(
            classify(&raw(1, false, "HTTP 429"), false),
            Some(ProviderErrorKind::RateLimit)
        );
        assert_eq!(
            classify(&raw(2, false, "provider rate limit exceeded"), false),
            Some(ProviderErrorKind::RateLimit)
        );
    }

    #[test]
    fn classify_context_exceeded_from_stderr() {
        assert_eq!(
            classify(&raw(1, false, "prompt exceeds context length"), false),
            Some(ProviderErrorKind::ContextExceeded)
        );
        assert_eq!(
            classify(&raw(137, false, "out of memory"), false),
            Some(ProviderErrorKind::ContextExceeded)
        );
    }

    #[test]
    fn classify_other_nonzero_is_api_error() {
        assert_eq!(
            classify(&raw(3, false, "segfault"), false),
            Some(ProviderErrorKind::ApiError)
        );
    }

    #[test]
    fn adapter_info_suits_declared_roles_only() {
        let info = AdapterInfo {
            id: "glm".into(),
            model: "glm-4.7".into(),
            provider: Provider::Glm,
            roles: vec![Role::Executor, Role::Auditor],
            vision: false,
            tier: CostTier::Cheap,
        };
        assert!(info.suits(Role::Executor));
        assert!(!info.suits(Role::Consultant));
    }

    #[test]
    fn role_and_provider_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Architect).unwrap(), "\"architect\"");
        assert_eq!(serde_json::to_string(&Provider::Glm).unwrap(), "\"glm\"");
    }

    #[test]
    fn default_chain_order_covers_every_role() {
        for role in Role::ALL {
            assert!(!default_chain_order(role).is_empty());
        }
    }
}
