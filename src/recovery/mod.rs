//! Error classification and recovery.
//!
//! 1. [`classify`] — code / HTTP status / keyword → category, severity, recoverable
//! 2. [`json_fix`] — repair rules for malformed model output
//! 3. [`manager`]  — per-category strategy chains, bounded history, statistics

pub mod classify;
pub mod json_fix;
pub mod manager;

pub use classify::{
    classify, classify_error, classify_status, code_for_status, ErrorCategory,
    ErrorClassification, ErrorInfo, Severity,
};
pub use json_fix::{auto_fix_json, repair_json_text};
pub use manager::{
    DefaultValueStrategy, FallbackStrategy, JsonAutoFixStrategy, MemoryCleanupStrategy,
    Operation, RecoveryAttempt, RecoveryConfig, RecoveryContext, RecoveryManager,
    RecoveryMethod, RecoveryOutcome, RecoveryStats, RecoveryStatus, RecoveryStep,
    RecoveryStrategy, RetryStrategy, StrategyOutcome,
};
