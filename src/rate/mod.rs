//! Per-provider usage ledger with learned limits and reset windows.
//!
//! The ledger never blocks a call outright below CRITICAL; it warns at
//! 80 % of the estimated limit and starts suggesting substitutions at
//! 95 %. Limits are *learned*: a confirmed RATE_LIMIT from a provider pins
//! the estimate at the current usage with full confidence, and the
//! estimate survives window resets.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::adapter::{Provider, Role};
use crate::events;

/// Usage ratio at which a warning event is emitted.
pub const WARN_THRESHOLD: f64 = 0.80;

/// Usage ratio at which substitution is attempted.
pub const CRITICAL_THRESHOLD: f64 = 0.95;

/// Per-provider usage entry, persisted verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderUsage {
    pub used: u64,
    pub estimated_limit: u64,
    /// How much we trust the estimate; forced to 1.0 once a provider
    /// confirms its limit by returning RATE_LIMIT
    pub confidence: f64,
    pub last_reset_utc: DateTime<Utc>,
    pub reset_period_seconds: i64,
    pub next_reset_utc: DateTime<Utc>,
}

impl ProviderUsage {
    fn new(now: DateTime<Utc>, estimated_limit: u64, reset_period_seconds: i64) -> Self {
        Self {
            used: 0,
            estimated_limit,
            confidence: 0.3,
            last_reset_utc: now,
            reset_period_seconds,
            next_reset_utc: now + Duration::seconds(reset_period_seconds),
        }
    }

    fn ratio(&self) -> f64 {
        if self.estimated_limit == 0 {
            return 1.0;
        }
        self.used as f64 / self.estimated_limit as f64
    }

    /// Zero the window if it has elapsed; the learned limit is kept.
    fn maybe_reset(&mut self, now: DateTime<Utc>) {
        if now >= self.next_reset_utc {
            self.used = 0;
            self.last_reset_utc = now;
            self.next_reset_utc = now + Duration::seconds(self.reset_period_seconds);
        }
    }
}

/// Whole-document ledger schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LedgerDoc {
    last_updated: Option<DateTime<Utc>>,
    limits: BTreeMap<Provider, ProviderUsage>,
}

/// Outcome of a pre-call check.
#[derive(Debug, Clone)]
pub struct RateDecision {
    pub proceed: bool,
    pub use_fallback: bool,
    pub fallback_provider: Option<Provider>,
    pub reason: String,
    pub wait_until: Option<DateTime<Utc>>,
}

impl RateDecision {
    fn go(reason: impl Into<String>) -> Self {
        Self {
            proceed: true,
            use_fallback: false,
            fallback_provider: None,
            reason: reason.into(),
            wait_until: None,
        }
    }
}

/// Static role-compatibility map used when a provider runs hot.
fn compatible_providers(role: Role) -> &'static [Provider] {
    match role {
        Role::Architect => &[Provider::Gemini, Provider::Glm],
        Role::Executor => &[Provider::Sonnet, Provider::Codex],
        Role::Auditor => &[Provider::Opus, Provider::Glm],
        Role::Consultant => &[Provider::Opus, Provider::Gemini],
    }
}

/// Initial per-provider guesses before anything is learned.
fn seed_usage(provider: Provider, now: DateTime<Utc>) -> ProviderUsage {
    let (limit, period_hours) = match provider {
        Provider::Glm => (200, 24),
        Provider::Gemini => (100, 24),
        Provider::Sonnet => (50, 5),
        Provider::Opus => (30, 5),
        Provider::Codex => (60, 3),
    };
    ProviderUsage::new(now, limit, period_hours * 3600)
}

/// Process-wide usage ledger, persisted as one JSON document.
#[derive(Debug)]
pub struct RateLedger {
    path: PathBuf,
    doc: LedgerDoc,
}

impl RateLedger {
    /// Load the ledger from disk, seeding any providers not yet present.
    pub fn load_or_default(path: PathBuf) -> Result<Self> {
        let doc = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read rate ledger: {}", path.display()))?;
            serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(code = events::RATE_LEDGER_RESET, error = %e, "rate ledger unreadable, starting fresh");
                LedgerDoc::default()
            })
        } else {
            LedgerDoc::default()
        };
        let mut ledger = Self { path, doc };
        let now = Utc::now();
        for provider in Provider::ALL {
            ledger
                .doc
                .limits
                .entry(provider)
                .or_insert_with(|| seed_usage(provider, now));
        }
        Ok(ledger)
    }

    /// Check whether a call against `provider` should proceed.
    pub fn check_before_call(&mut self, provider: Provider, role: Role) -> RateDecision {
        self.check_at(provider, role, Utc::now())
    }

    /// Time-injectable core of [`Self::check_before_call`].
    pub fn check_at(&mut self, provider: Provider, role: Role, now: DateTime<Utc>) -> RateDecision {
        for usage in self.doc.limits.values_mut() {
            usage.maybe_reset(now);
        }
        let usage = self
            .doc
            .limits
            .get(&provider)
            .expect("all providers seeded at load");
        let ratio = usage.ratio();

        if ratio >= CRITICAL_THRESHOLD {
            let fallback = compatible_providers(role)
                .iter()
                .copied()
                .filter(|p| *p != provider)
                .find(|p| {
                    self.doc
                        .limits
                        .get(p)
                        .map(|u| u.ratio() < WARN_THRESHOLD)
                        .unwrap_or(false)
                });
            let wait_until = self.doc.limits[&provider].next_reset_utc;
            return match fallback {
                Some(p) => RateDecision {
                    proceed: false,
                    use_fallback: true,
                    fallback_provider: Some(p),
                    reason: format!(
                        "{provider} at {:.0}% of estimated limit, suggesting {p}",
                        ratio * 100.0
                    ),
                    wait_until: None,
                },
                None => RateDecision {
                    proceed: false,
                    use_fallback: false,
                    fallback_provider: None,
                    reason: format!(
                        "{provider} at {:.0}% of estimated limit, no fallback below warn",
                        ratio * 100.0
                    ),
                    wait_until: Some(wait_until),
                },
            };
        }

        if ratio >= WARN_THRESHOLD {
            warn!(
                code = events::RATE_WARN,
                provider = %provider,
                ratio = format!("{:.2}", ratio),
                "provider usage above warn threshold"
            );
            return RateDecision::go(format!(
                "{provider} at {:.0}% of estimated limit",
                ratio * 100.0
            ));
        }

        RateDecision::go("under thresholds")
    }

    /// Count one successful or failed call against the provider.
    pub fn record_usage(&mut self, provider: Provider) -> Result<()> {
        let now = Utc::now();
        let usage = self
            .doc
            .limits
            .get_mut(&provider)
            .expect("all providers seeded at load");
        usage.maybe_reset(now);
        usage.used += 1;
        self.persist()
    }

    /// The provider told us its real limit: pin it at the current usage.
    pub fn handle_rate_limit_error(&mut self, provider: Provider) -> Result<()> {
        let usage = self
            .doc
            .limits
            .get_mut(&provider)
            .expect("all providers seeded at load");
        usage.estimated_limit = usage.used.max(1);
        usage.confidence = 1.0;
        tracing::info!(
            code = events::RATE_LIMIT_PINNED,
            provider = %provider,
            limit = usage.estimated_limit,
            "rate limit pinned from provider error"
        );
        self.persist()
    }

    pub fn usage(&self, provider: Provider) -> &ProviderUsage {
        &self.doc.limits[&provider]
    }

    /// Every mutation rewrites the whole document: lock, tmp write, fsync,
    /// atomic rename.
    fn persist(&mut self) -> Result<()> {
        self.doc.last_updated = Some(Utc::now());
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create ledger dir: {}", parent.display()))?;
        }
        let lock_path = self.path.with_extension("lock");
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .context("Failed to open ledger lock file")?;
        lock.lock_exclusive().context("Failed to lock ledger")?;

        let tmp = self.path.with_extension("tmp");
        let content =
            serde_json::to_string_pretty(&self.doc).context("Failed to serialize rate ledger")?;
        let mut file = std::fs::File::create(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        file.write_all(content.as_bytes())?;
        file.sync_all().context("Failed to fsync rate ledger")?;
        std::fs::rename(&tmp, &self.path).context("Failed to replace rate ledger")?;

        fs2::FileExt::unlock(&lock).ok();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ledger() -> (RateLedger, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let ledger = RateLedger::load_or_default(dir.path().join("rate-limits.json")).unwrap();
        (ledger, dir)
    }

    fn set_usage(ledger: &mut RateLedger, provider: Provider, used: u64, limit: u64) {
        let usage = ledger.doc.limits.get_mut(&provider).unwrap();
        usage.used = used;
        usage.estimated_limit = limit;
    }

    #[test]
    fn under_thresholds_proceeds() {
        let (mut ledger, _dir) = ledger();
        set_usage(&mut ledger, Provider::Glm, 10, 100);
        let decision = ledger.check_before_call(Provider::Glm, Role::Executor);
        assert!(decision.proceed);
        assert!(!decision.use_fallback);
    }

    #[test]
    fn exactly_warn_threshold_warns_without_substitution() {
        let (mut ledger, _dir) = ledger();
        set_usage(&mut ledger, Provider::Glm, 80, 100);
        let decision = ledger.check_before_call(Provider::Glm, Role::Executor);
        assert!(decision.proceed);
        assert!(!decision.use_fallback);
        assert!(decision.fallback_provider.is_none());
        assert!(decision.reason.contains("80%"));
    }

    #[test]
    fn exactly_critical_threshold_attempts_substitution() {
        let (mut ledger, _dir) = ledger();
        set_usage(&mut ledger, Provider::Glm, 95, 100);
        let decision = ledger.check_before_call(Provider::Glm, Role::Executor);
        assert!(!decision.proceed);
        assert!(decision.use_fallback);
        // executor compatibility map: sonnet first
        assert_eq!(decision.fallback_provider, Some(Provider::Sonnet));
    }

    #[test]
    fn critical_with_all_fallbacks_hot_waits_for_reset() {
        let (mut ledger, _dir) = ledger();
        set_usage(&mut ledger, Provider::Glm, 99, 100);
        set_usage(&mut ledger, Provider::Sonnet, 90, 100);
        set_usage(&mut ledger, Provider::Codex, 85, 100);
        let decision = ledger.check_before_call(Provider::Glm, Role::Executor);
        assert!(!decision.proceed);
        assert!(!decision.use_fallback);
        assert!(decision.wait_until.is_some());
    }

    #[test]
    fn window_reset_zeroes_usage_but_keeps_learned_limit() {
        let (mut ledger, _dir) = ledger();
        set_usage(&mut ledger, Provider::Codex, 59, 42);
        {
            let usage = ledger.doc.limits.get_mut(&Provider::Codex).unwrap();
            usage.next_reset_utc = Utc::now() - Duration::seconds(1);
        }
        let decision = ledger.check_before_call(Provider::Codex, Role::Executor);
        assert!(decision.proceed);
        let usage = ledger.usage(Provider::Codex);
        assert_eq!(usage.used, 0);
        assert_eq!(usage.estimated_limit, 42);
        assert!(usage.next_reset_utc > Utc::now());
    }

    #[test]
    fn rate_limit_error_pins_limit_with_full_confidence() {
        let (mut ledger, _dir) = ledger();
        set_usage(&mut ledger, Provider::Gemini, 17, 100);
        ledger.handle_rate_limit_error(Provider::Gemini).unwrap();
        let usage = ledger.usage(Provider::Gemini);
        assert_eq!(usage.estimated_limit, 17);
        assert!((usage.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn record_usage_persists_and_reloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rate-limits.json");
        {
            let mut ledger = RateLedger::load_or_default(path.clone()).unwrap();
            ledger.record_usage(Provider::Opus).unwrap();
            ledger.record_usage(Provider::Opus).unwrap();
        }
        let ledger = RateLedger::load_or_default(path).unwrap();
        assert_eq!(ledger.usage(Provider::Opus).used, 2);
    }

    #[test]
    fn corrupt_ledger_file_starts_fresh() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rate-limits.json");
        std::fs::write(&path, "{ definitely not json").unwrap();
        let ledger = RateLedger::load_or_default(path).unwrap();
        assert_eq!(ledger.usage(Provider::Glm).used, 0);
    }

    #[test]
    fn compatibility_map_matches_roles() {
        assert_eq!(
            compatible_providers(Role::Architect),
            &[Provider::Gemini, Provider::Glm]
        );
        assert_eq!(
            compatible_providers(Role::Auditor),
            &[Provider::Opus, Provider::Glm]
        );
        assert_eq!(
            compatible_providers(Role::Consultant),
            &[Provider::Opus, Provider::Gemini]
        );
    }
}
