//! Category-driven recovery: each error category owns an ordered list of
//! strategies, tried in turn until one of them produces a value.
//!
//! ```text
//! ErrorInfo ──▶ classify ──▶ recoverable? ──no──▶ NoRecoveryAvailable
//!                                 │yes
//!                                 ▼
//!                 strategies[category] ──▶ first success ──▶ Recovered
//! ```
//!
//! Strategies receive a [`RecoveryContext`] carrying whatever the caller can
//! offer: an operation to re-run, alternate processors, a default value, the
//! raw text of a malformed response, a memory manager to clean. A strategy
//! whose input is missing reports `NotApplicable` and is left out of the
//! attempt record.

use super::classify::{classify, ErrorCategory, ErrorClassification, ErrorInfo};
use super::json_fix::auto_fix_json;
use crate::config::RetryPolicy;
use crate::memory::MemoryManager;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Number of attempts kept by [`RecoveryManager::history`].
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// A re-runnable unit of work handed to the recovery layer.
pub type Operation = Arc<dyn Fn() -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMethod {
    Retry,
    Fallback,
    JsonAutoFix,
    DefaultValue,
    MemoryCleanup,
}

impl fmt::Display for RecoveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecoveryMethod::Retry => "retry",
            RecoveryMethod::Fallback => "fallback",
            RecoveryMethod::JsonAutoFix => "json_auto_fix",
            RecoveryMethod::DefaultValue => "default_value",
            RecoveryMethod::MemoryCleanup => "memory_cleanup",
        };
        f.write_str(s)
    }
}

/// What a single strategy achieved.
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyOutcome {
    /// Recovered, optionally with a replacement value.
    Recovered(Option<Value>),
    Failed(String),
    /// The context lacks what this strategy needs.
    NotApplicable,
}

#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn method(&self) -> RecoveryMethod;

    async fn attempt(&self, error: &ErrorInfo, ctx: &RecoveryContext) -> StrategyOutcome;
}

/// Inputs the caller offers to the strategies.
#[derive(Clone, Default)]
pub struct RecoveryContext {
    pub operation: Option<Operation>,
    pub fallbacks: Vec<Operation>,
    pub default_value: Option<Value>,
    pub raw_json: Option<String>,
    pub memory: Option<Arc<MemoryManager>>,
}

impl RecoveryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_operation(mut self, op: Operation) -> Self {
        self.operation = Some(op);
        self
    }

    pub fn with_fallback(mut self, op: Operation) -> Self {
        self.fallbacks.push(op);
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn with_raw_json(mut self, raw: impl Into<String>) -> Self {
        self.raw_json = Some(raw.into());
        self
    }

    pub fn with_memory(mut self, memory: Arc<MemoryManager>) -> Self {
        self.memory = Some(memory);
        self
    }
}

impl fmt::Debug for RecoveryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryContext")
            .field("operation", &self.operation.as_ref().map(|_| "<operation>"))
            .field("fallbacks", &self.fallbacks.len())
            .field("default_value", &self.default_value)
            .field("raw_json", &self.raw_json.as_ref().map(|s| s.len()))
            .field("memory", &self.memory.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    Recovered,
    NoRecoveryAvailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryStep {
    pub method: RecoveryMethod,
    pub success: bool,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// One call to [`RecoveryManager::handle_error`], as kept in the history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryAttempt {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub error: ErrorInfo,
    pub classification: ErrorClassification,
    pub steps: Vec<RecoveryStep>,
    /// Time spent walking the strategy list.
    pub duration_ms: u64,
    pub final_method: Option<RecoveryMethod>,
    pub final_status: RecoveryStatus,
}

#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    pub attempt: RecoveryAttempt,
    pub value: Option<Value>,
}

impl RecoveryOutcome {
    pub fn recovered(&self) -> bool {
        self.attempt.final_status == RecoveryStatus::Recovered
    }

    /// Method of the step that succeeded, if any.
    pub fn method(&self) -> Option<RecoveryMethod> {
        self.attempt.final_method
    }
}

/// Counts over the attempts still in the history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryStats {
    pub total_errors: u64,
    pub recoverable_errors: u64,
    pub recovered_errors: u64,
    /// `recovered / recoverable`, 0 when nothing was recoverable.
    pub recovery_rate: f64,
    pub by_category: HashMap<ErrorCategory, u64>,
    pub by_code: HashMap<String, u64>,
}

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub history_limit: usize,
    /// Attempts made by the built-in retry strategy.
    pub retry_attempts: u32,
    pub retry_policy: RetryPolicy,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            retry_attempts: 3,
            retry_policy: RetryPolicy::Fixed { delay_ms: 1000 },
        }
    }
}

// ── Built-in strategies ──────────────────────────────────────────────────

/// Re-run the context's operation with the configured delay schedule.
pub struct RetryStrategy {
    pub attempts: u32,
    pub policy: RetryPolicy,
}

#[async_trait]
impl RecoveryStrategy for RetryStrategy {
    fn method(&self) -> RecoveryMethod {
        RecoveryMethod::Retry
    }

    async fn attempt(&self, error: &ErrorInfo, ctx: &RecoveryContext) -> StrategyOutcome {
        let Some(op) = ctx.operation.as_ref() else {
            return StrategyOutcome::NotApplicable;
        };
        let mut last = String::new();
        for attempt in 1..=self.attempts {
            tokio::time::sleep(self.policy.delay_for(attempt)).await;
            match op().await {
                Ok(v) => return StrategyOutcome::Recovered(Some(v)),
                Err(e) => {
                    debug!(
                        "Retry {}/{} for {} failed: {}",
                        attempt, self.attempts, error.error_type, e
                    );
                    last = e;
                }
            }
        }
        StrategyOutcome::Failed(last)
    }
}

/// Try each alternate processor in order.
pub struct FallbackStrategy;

#[async_trait]
impl RecoveryStrategy for FallbackStrategy {
    fn method(&self) -> RecoveryMethod {
        RecoveryMethod::Fallback
    }

    async fn attempt(&self, _error: &ErrorInfo, ctx: &RecoveryContext) -> StrategyOutcome {
        if ctx.fallbacks.is_empty() {
            return StrategyOutcome::NotApplicable;
        }
        let mut last = String::new();
        for (i, op) in ctx.fallbacks.iter().enumerate() {
            match op().await {
                Ok(v) => return StrategyOutcome::Recovered(Some(v)),
                Err(e) => {
                    debug!("Fallback processor {} failed: {}", i, e);
                    last = e;
                }
            }
        }
        StrategyOutcome::Failed(last)
    }
}

/// Repair the raw text of a malformed JSON response.
pub struct JsonAutoFixStrategy;

#[async_trait]
impl RecoveryStrategy for JsonAutoFixStrategy {
    fn method(&self) -> RecoveryMethod {
        RecoveryMethod::JsonAutoFix
    }

    async fn attempt(&self, _error: &ErrorInfo, ctx: &RecoveryContext) -> StrategyOutcome {
        let Some(raw) = ctx.raw_json.as_deref() else {
            return StrategyOutcome::NotApplicable;
        };
        match auto_fix_json(raw) {
            Some(v) => StrategyOutcome::Recovered(Some(v)),
            None => StrategyOutcome::Failed("no repair rule produced valid JSON".into()),
        }
    }
}

/// Substitute the caller's default value.
pub struct DefaultValueStrategy;

#[async_trait]
impl RecoveryStrategy for DefaultValueStrategy {
    fn method(&self) -> RecoveryMethod {
        RecoveryMethod::DefaultValue
    }

    async fn attempt(&self, _error: &ErrorInfo, ctx: &RecoveryContext) -> StrategyOutcome {
        match &ctx.default_value {
            Some(v) => StrategyOutcome::Recovered(Some(v.clone())),
            None => StrategyOutcome::NotApplicable,
        }
    }
}

/// Free cleanable memory, then re-run the operation once if there is one.
pub struct MemoryCleanupStrategy;

#[async_trait]
impl RecoveryStrategy for MemoryCleanupStrategy {
    fn method(&self) -> RecoveryMethod {
        RecoveryMethod::MemoryCleanup
    }

    async fn attempt(&self, _error: &ErrorInfo, ctx: &RecoveryContext) -> StrategyOutcome {
        let Some(memory) = ctx.memory.as_ref() else {
            return StrategyOutcome::NotApplicable;
        };
        let freed = memory.aggressive_cleanup();
        info!("Memory recovery freed {} bytes", freed);
        match ctx.operation.as_ref() {
            Some(op) => match op().await {
                Ok(v) => StrategyOutcome::Recovered(Some(v)),
                Err(e) => StrategyOutcome::Failed(e),
            },
            None => StrategyOutcome::Recovered(None),
        }
    }
}

// ── Manager ──────────────────────────────────────────────────────────────

/// Classifies errors, runs the category's strategies and keeps a bounded
/// history plus running statistics.
pub struct RecoveryManager {
    config: RecoveryConfig,
    strategies: RwLock<HashMap<ErrorCategory, Vec<Arc<dyn RecoveryStrategy>>>>,
    history: Mutex<VecDeque<RecoveryAttempt>>,
}

impl Default for RecoveryManager {
    fn default() -> Self {
        Self::new(RecoveryConfig::default())
    }
}

impl fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RecoveryManager {
    pub fn new(config: RecoveryConfig) -> Self {
        let retry = || -> Arc<dyn RecoveryStrategy> {
            Arc::new(RetryStrategy {
                attempts: config.retry_attempts,
                policy: config.retry_policy,
            })
        };

        let mut strategies: HashMap<ErrorCategory, Vec<Arc<dyn RecoveryStrategy>>> =
            HashMap::new();
        strategies.insert(ErrorCategory::Network, vec![retry(), Arc::new(FallbackStrategy)]);
        strategies.insert(
            ErrorCategory::Processing,
            vec![Arc::new(FallbackStrategy), retry()],
        );
        strategies.insert(
            ErrorCategory::Validation,
            vec![Arc::new(JsonAutoFixStrategy), Arc::new(DefaultValueStrategy)],
        );
        strategies.insert(
            ErrorCategory::Memory,
            vec![Arc::new(MemoryCleanupStrategy), retry()],
        );
        strategies.insert(ErrorCategory::System, vec![retry()]);

        Self {
            strategies: RwLock::new(strategies),
            history: Mutex::new(VecDeque::with_capacity(config.history_limit.min(1024))),
            config,
        }
    }

    pub fn classify(&self, info: &ErrorInfo) -> ErrorClassification {
        classify(info)
    }

    /// Append a strategy to the end of a category's list.
    pub fn register_strategy(&self, category: ErrorCategory, strategy: Arc<dyn RecoveryStrategy>) {
        self.strategies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(category)
            .or_default()
            .push(strategy);
    }

    /// Replace a category's strategy list.
    pub fn set_strategies(&self, category: ErrorCategory, list: Vec<Arc<dyn RecoveryStrategy>>) {
        self.strategies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(category, list);
    }

    /// Classify `error` and, when recoverable, walk its category's
    /// strategies until one succeeds.
    pub async fn handle_error(&self, error: ErrorInfo, ctx: RecoveryContext) -> RecoveryOutcome {
        let classification = self.classify(&error);
        let started = Instant::now();
        let mut steps = Vec::new();
        let mut value = None;
        let mut status = RecoveryStatus::NoRecoveryAvailable;

        if classification.recoverable {
            let list: Vec<Arc<dyn RecoveryStrategy>> = self
                .strategies
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&classification.category)
                .cloned()
                .unwrap_or_default();

            for strategy in list {
                match strategy.attempt(&error, &ctx).await {
                    StrategyOutcome::NotApplicable => continue,
                    StrategyOutcome::Recovered(v) => {
                        steps.push(RecoveryStep {
                            method: strategy.method(),
                            success: true,
                            detail: None,
                            timestamp: Utc::now(),
                        });
                        value = v;
                        status = RecoveryStatus::Recovered;
                        break;
                    }
                    StrategyOutcome::Failed(detail) => steps.push(RecoveryStep {
                        method: strategy.method(),
                        success: false,
                        detail: Some(detail),
                        timestamp: Utc::now(),
                    }),
                }
            }
        }

        let final_method = steps.iter().find(|s| s.success).map(|s| s.method);
        match final_method {
            Some(method) => info!(
                "Recovered from {} ({}) via {}",
                classification.code, classification.category, method
            ),
            None => warn!(
                "No recovery for {} ({}): {}",
                classification.code, classification.category, error.message
            ),
        }

        let attempt = RecoveryAttempt {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            error,
            classification,
            steps,
            duration_ms: started.elapsed().as_millis() as u64,
            final_method,
            final_status: status,
        };
        self.record(&attempt);

        RecoveryOutcome { attempt, value }
    }

    fn lock_history(&self) -> MutexGuard<'_, VecDeque<RecoveryAttempt>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, attempt: &RecoveryAttempt) {
        if self.config.history_limit == 0 {
            return;
        }
        let mut history = self.lock_history();
        while history.len() >= self.config.history_limit {
            history.pop_front();
        }
        history.push_back(attempt.clone());
    }

    /// Oldest first.
    pub fn history(&self) -> Vec<RecoveryAttempt> {
        self.lock_history().iter().cloned().collect()
    }

    /// Counts over the bounded history; older attempts drop out.
    pub fn stats(&self) -> RecoveryStats {
        let history = self.lock_history();
        let mut stats = RecoveryStats::default();
        for attempt in history.iter() {
            stats.total_errors += 1;
            *stats
                .by_category
                .entry(attempt.classification.category)
                .or_insert(0) += 1;
            *stats
                .by_code
                .entry(attempt.classification.code.clone())
                .or_insert(0) += 1;
            if attempt.classification.recoverable {
                stats.recoverable_errors += 1;
            }
            if attempt.final_status == RecoveryStatus::Recovered {
                stats.recovered_errors += 1;
            }
        }
        stats.recovery_rate = if stats.recoverable_errors == 0 {
            0.0
        } else {
            stats.recovered_errors as f64 / stats.recoverable_errors as f64
        };
        stats
    }

    pub fn clear_history(&self) {
        self.lock_history().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quick() -> RecoveryManager {
        RecoveryManager::new(RecoveryConfig {
            history_limit: 100,
            retry_attempts: 2,
            retry_policy: RetryPolicy::Fixed { delay_ms: 1 },
        })
    }

    fn op_failing_then_ok(fails: usize) -> (Operation, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let op: Operation = Arc::new(move || {
            let n = c.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < fails {
                    Err("still down".to_string())
                } else {
                    Ok(json!("ok"))
                }
            }
            .boxed()
        });
        (op, calls)
    }

    #[tokio::test]
    async fn network_error_retried() {
        let m = quick();
        let (op, calls) = op_failing_then_ok(1);
        let out = m
            .handle_error(
                ErrorInfo::new("CONNECTION_FAILED", "reset"),
                RecoveryContext::new().with_operation(op),
            )
            .await;
        assert!(out.recovered());
        assert_eq!(out.method(), Some(RecoveryMethod::Retry));
        assert_eq!(out.attempt.final_method, Some(RecoveryMethod::Retry));
        assert_eq!(out.value, Some(json!("ok")));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let step = &out.attempt.steps[0];
        assert!(step.success);
        assert!(step.timestamp >= out.attempt.timestamp - chrono::Duration::seconds(1));
        // Each retry waits 1 ms first.
        assert!(out.attempt.duration_ms >= 1);
    }

    #[tokio::test]
    async fn unauthorized_not_attempted() {
        let m = quick();
        let (op, calls) = op_failing_then_ok(0);
        let out = m
            .handle_error(
                ErrorInfo::new("UNAUTHORIZED", "bad key"),
                RecoveryContext::new().with_operation(op),
            )
            .await;
        assert!(!out.recovered());
        assert_eq!(out.attempt.final_status, RecoveryStatus::NoRecoveryAvailable);
        assert_eq!(out.attempt.final_method, None);
        assert!(out.attempt.steps.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn processing_uses_fallback_first() {
        let m = quick();
        let (primary, primary_calls) = op_failing_then_ok(0);
        let fallback: Operation = Arc::new(|| async { Ok(json!("from fallback")) }.boxed());
        let out = m
            .handle_error(
                ErrorInfo::new("AI_PROCESSING_FAILED", "model error"),
                RecoveryContext::new()
                    .with_operation(primary)
                    .with_fallback(fallback),
            )
            .await;
        assert_eq!(out.method(), Some(RecoveryMethod::Fallback));
        assert_eq!(out.value, Some(json!("from fallback")));
        assert_eq!(primary_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn validation_fixes_json_then_defaults() {
        let m = quick();
        let out = m
            .handle_error(
                ErrorInfo::new("INVALID_JSON", "trailing comma"),
                RecoveryContext::new().with_raw_json(r#"{"a": 1,}"#),
            )
            .await;
        assert_eq!(out.method(), Some(RecoveryMethod::JsonAutoFix));
        assert_eq!(out.value, Some(json!({"a": 1})));

        let out = m
            .handle_error(
                ErrorInfo::new("INVALID_JSON", "garbage"),
                RecoveryContext::new()
                    .with_raw_json("not json")
                    .with_default(json!({"diagrams": []})),
            )
            .await;
        assert_eq!(out.method(), Some(RecoveryMethod::DefaultValue));
        assert_eq!(out.attempt.steps.len(), 2);
        assert!(!out.attempt.steps[0].success);
        assert!(out.attempt.steps[0].timestamp <= out.attempt.steps[1].timestamp);
    }

    #[tokio::test]
    async fn exhausted_strategies_report_no_recovery() {
        let m = quick();
        let (op, calls) = op_failing_then_ok(usize::MAX);
        let out = m
            .handle_error(
                ErrorInfo::new("TIMEOUT", "slow"),
                RecoveryContext::new().with_operation(op),
            )
            .await;
        assert!(!out.recovered());
        assert_eq!(out.attempt.final_method, None);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // Fallback had nothing to try and is not recorded.
        assert_eq!(out.attempt.steps.len(), 1);
    }

    #[tokio::test]
    async fn stats_and_bounded_history() {
        let m = RecoveryManager::new(RecoveryConfig {
            history_limit: 3,
            retry_attempts: 1,
            retry_policy: RetryPolicy::Fixed { delay_ms: 0 },
        });
        for _ in 0..4 {
            m.handle_error(
                ErrorInfo::new("INVALID_JSON", "x"),
                RecoveryContext::new().with_raw_json("[1,2,]"),
            )
            .await;
        }
        m.handle_error(ErrorInfo::new("FORBIDDEN", "no"), RecoveryContext::new())
            .await;

        // Only the last three attempts are counted.
        assert_eq!(m.history().len(), 3);
        let s = m.stats();
        assert_eq!(s.total_errors, 3);
        assert_eq!(s.recoverable_errors, 2);
        assert_eq!(s.recovered_errors, 2);
        assert_eq!(s.recovery_rate, 1.0);
        assert_eq!(s.by_category.get(&ErrorCategory::Validation), Some(&2));
        assert_eq!(s.by_category.get(&ErrorCategory::Security), Some(&1));
        assert_eq!(s.by_code.get("FORBIDDEN"), Some(&1));

        m.clear_history();
        assert!(m.history().is_empty());
        assert_eq!(m.stats().total_errors, 0);
    }

    #[tokio::test]
    async fn custom_strategy_registered() {
        struct Always;
        #[async_trait]
        impl RecoveryStrategy for Always {
            fn method(&self) -> RecoveryMethod {
                RecoveryMethod::DefaultValue
            }
            async fn attempt(&self, _e: &ErrorInfo, _c: &RecoveryContext) -> StrategyOutcome {
                StrategyOutcome::Recovered(Some(json!(42)))
            }
        }

        let m = quick();
        m.set_strategies(ErrorCategory::Memory, vec![]);
        m.register_strategy(ErrorCategory::Memory, Arc::new(Always));
        let out = m
            .handle_error(ErrorInfo::new("OUT_OF_MEMORY", "oom"), RecoveryContext::new())
            .await;
        assert_eq!(out.value, Some(json!(42)));
        assert_eq!(out.attempt.steps.len(), 1);
    }
}
