//! Stable observability codes.
//!
//! Every recoverable transition logs exactly one `tracing` event carrying
//! one of these codes, so collaborators (TUI, control plane) can key off
//! them without parsing message text. Codes are append-only; never renumber.

/// Phase transition in the orchestrator state machine.
pub const PHASE_TRANSITION: &str = "ORC-001";
/// A checkpoint was created at a phase boundary.
pub const CHECKPOINT_CREATED: &str = "ORC-002";
/// Session persisted on cancellation.
pub const SESSION_CANCELLED: &str = "ORC-003";
/// Session soft wall clock expired; no new phase will start.
pub const WALL_CLOCK_EXPIRED: &str = "ORC-004";

/// The fallback chain advanced past its head.
pub const FALLBACK_ROTATION: &str = "ORC-101";
/// A provider confirmed its limit; the ledger pinned it.
pub const RATE_LIMIT_PINNED: &str = "ORC-102";
/// A provider crossed the warn threshold.
pub const RATE_WARN: &str = "ORC-103";
/// The ledger suggested a provider substitution.
pub const RATE_SUBSTITUTION: &str = "ORC-104";
/// The ledger file was unreadable and re-seeded.
pub const RATE_LEDGER_RESET: &str = "ORC-105";

/// An audit verdict line was neither APPROVED nor NEEDS_WORK.
pub const AUDIT_VERDICT_UNPARSEABLE: &str = "ORC-210";
/// Audit rejected the iteration; feedback forwarded to the executor.
pub const AUDIT_NEEDS_WORK: &str = "ORC-211";

/// A generated file failed validation and was queued for retry.
pub const VALIDATION_REJECTED: &str = "ORC-301";
/// A file hit CONTEXT_EXCEEDED and was marked recoverable.
pub const FILE_BACKPRESSURE: &str = "ORC-302";

/// Recovery pass started.
pub const RECOVERY_STARTED: &str = "ORC-401";
/// Workspace restored from the latest approved checkpoint.
pub const SESSION_REVERTED: &str = "ORC-402";

/// Consultant was invoked on a help-needed file.
pub const CONSULTANT_INVOKED: &str = "ORC-501";
