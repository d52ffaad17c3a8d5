//! Per-plugin execution guard
//!
//! One guard is attached to every loaded plugin and bounds the blast radius
//! of that plugin's code: payload validation, a coarse whole-process memory
//! ceiling, timeout/retry-wrapped invocation, and an error-count circuit
//! breaker for isolated execution. Guards are never shared across plugins.
//!
//! Isolation here is partial by design: only [`ExecutionGuard::execute_isolated`]
//! runs work against a restricted [`IsolatedContext`]; the common dispatch
//! path adds timeout and retries around a direct in-process call with no
//! capability isolation.

pub mod input;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{LazyLock, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use sysinfo::System;
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use self::input::ParamMap;

/// Default per-invocation timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default coarse memory ceiling (50 MiB)
pub const DEFAULT_MEMORY_LIMIT: u64 = 50 * 1024 * 1024;

/// Default attempts before a guarded invocation is abandoned
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Errors tolerated before the circuit opens
pub const DEFAULT_MAX_ERRORS: u32 = 10;

/// Longest delay an isolated task may schedule
const MAX_TIMER_DELAY: Duration = Duration::from_secs(60);

/// Guard event channel capacity
const EVENT_CAPACITY: usize = 16;

/// Whole-process memory gauge shared by every guard
///
/// The ceiling check measures the host process, not a per-plugin quota; one
/// gauge serves all guards.
static PROCESS_GAUGE: LazyLock<Mutex<System>> = LazyLock::new(|| Mutex::new(System::new()));

/// Current resident memory of this process in bytes (0 if unavailable)
fn process_memory_bytes() -> u64 {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0;
    };
    let mut system = PROCESS_GAUGE.lock().unwrap_or_else(PoisonError::into_inner);
    system.refresh_process(pid);
    system.process(pid).map_or(0, sysinfo::Process::memory)
}

/// Events emitted by a guard as its plugin misbehaves
#[derive(Debug, Clone)]
pub enum GuardEvent {
    /// An isolated execution failed
    Error {
        /// Plugin the guard belongs to
        plugin: String,
        /// Failure message
        message: String,
    },
    /// `error_count` reached `max_errors`; the circuit is now open
    MaxErrorsReached {
        /// Plugin the guard belongs to
        plugin: String,
        /// Error count at the time of the event
        error_count: u32,
    },
}

/// Read-only snapshot of guard state for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct GuardStats {
    /// Plugin the guard belongs to
    pub plugin_name: String,
    /// Accumulated failures since the last reset
    pub error_count: u32,
    /// Threshold at which the circuit opens
    pub max_errors: u32,
    /// Message of the most recent isolated-execution failure
    pub last_error: Option<String>,
    /// Invocation timeout in milliseconds
    pub timeout_ms: u64,
    /// Memory ceiling in bytes
    pub memory_limit_bytes: u64,
}

/// Options for a guard-wrapped invocation
#[derive(Debug, Clone, Copy)]
pub struct WrapOptions {
    /// Per-attempt timeout; defaults to the guard's own timeout
    pub timeout: Option<Duration>,
    /// Total attempts before giving up
    pub max_retries: u32,
}

impl Default for WrapOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Capabilities available to code running under [`ExecutionGuard::execute_isolated`]
///
/// The context carries plugin-tagged logging and a capped timer; anything it
/// does not expose (filesystem, network, host state) is simply not available
/// to the task through it.
#[derive(Debug, Clone)]
pub struct IsolatedContext {
    plugin_name: String,
}

impl IsolatedContext {
    fn new(plugin_name: String) -> Self {
        Self { plugin_name }
    }

    /// Plugin this context is scoped to
    #[must_use]
    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// Log at info level, tagged with the plugin name
    pub fn log_info(&self, message: &str) {
        tracing::info!(plugin = %self.plugin_name, "{message}");
    }

    /// Log at warn level, tagged with the plugin name
    pub fn log_warn(&self, message: &str) {
        tracing::warn!(plugin = %self.plugin_name, "{message}");
    }

    /// Log at error level, tagged with the plugin name
    pub fn log_error(&self, message: &str) {
        tracing::error!(plugin = %self.plugin_name, "{message}");
    }

    /// Log at debug level, tagged with the plugin name
    pub fn log_debug(&self, message: &str) {
        tracing::debug!(plugin = %self.plugin_name, "{message}");
    }

    /// Sleep for `delay`, rejecting delays above 60 seconds
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `delay` exceeds the timer cap.
    pub async fn sleep(&self, delay: Duration) -> Result<()> {
        if delay > MAX_TIMER_DELAY {
            return Err(Error::Validation(format!(
                "timer delay exceeds maximum ({}s)",
                MAX_TIMER_DELAY.as_secs()
            )));
        }
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

/// Isolation state for one plugin
///
/// Created with its plugin record, discarded on unload. The error count is
/// shared across concurrent invocations without coalescing: two concurrent
/// failures each add one.
pub struct ExecutionGuard {
    plugin_name: String,
    timeout: Duration,
    memory_limit: u64,
    max_errors: u32,
    error_count: AtomicU32,
    last_error: Mutex<Option<String>>,
    events: broadcast::Sender<GuardEvent>,
}

impl ExecutionGuard {
    /// Create a guard with default limits
    #[must_use]
    pub fn new(plugin_name: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            plugin_name: plugin_name.into(),
            timeout: DEFAULT_TIMEOUT,
            memory_limit: DEFAULT_MEMORY_LIMIT,
            max_errors: DEFAULT_MAX_ERRORS,
            error_count: AtomicU32::new(0),
            last_error: Mutex::new(None),
            events,
        }
    }

    /// Override the invocation timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the memory ceiling in bytes
    #[must_use]
    pub fn with_memory_limit(mut self, memory_limit: u64) -> Self {
        self.memory_limit = memory_limit;
        self
    }

    /// Override the circuit-breaker threshold
    #[must_use]
    pub fn with_max_errors(mut self, max_errors: u32) -> Self {
        self.max_errors = max_errors;
        self
    }

    /// Plugin this guard belongs to
    #[must_use]
    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// Current accumulated error count
    #[must_use]
    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Subscribe to guard events (best-effort delivery)
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GuardEvent> {
        self.events.subscribe()
    }

    /// Validate a payload against an action's parameter schema
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] on any schema mismatch.
    pub fn validate_input(
        &self,
        payload: &serde_json::Map<String, serde_json::Value>,
        schema: &ParamMap,
    ) -> Result<serde_json::Map<String, serde_json::Value>> {
        input::validate_input(payload, schema)
    }

    /// Check the whole-process memory ceiling
    ///
    /// This measures the host process, not the plugin: a single shared gauge,
    /// not a per-plugin quota.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MemoryLimitExceeded`] when current process memory is
    /// above the configured ceiling.
    pub fn check_memory_usage(&self) -> Result<()> {
        let used_bytes = process_memory_bytes();
        if used_bytes > self.memory_limit {
            return Err(Error::MemoryLimitExceeded {
                used_bytes,
                limit_bytes: self.memory_limit,
            });
        }
        Ok(())
    }

    /// Run an invocation with timeout and retries
    ///
    /// Each attempt is spawned and raced against the timeout; a timed-out
    /// attempt keeps running detached and its eventual result is discarded.
    /// Failed attempts back off `1000ms * attempt` before retrying. Only
    /// after all attempts are exhausted does the error count rise, by exactly
    /// one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExecutionTimeout`] when the final attempt timed out,
    /// [`Error::ExecutionFailed`] wrapping the last attempt's error otherwise.
    pub async fn run_wrapped<T, F>(&self, options: WrapOptions, attempt: F) -> Result<T>
    where
        F: Fn() -> BoxFuture<'static, Result<T>>,
        T: Send + 'static,
    {
        let timeout = options.timeout.unwrap_or(self.timeout);
        let max_retries = options.max_retries.max(1);
        let mut last_error: Option<Error> = None;

        for attempt_number in 1..=max_retries {
            let handle = tokio::spawn(attempt());
            let failure = match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(Ok(value))) => return Ok(value),
                Ok(Ok(Err(error))) => error,
                Ok(Err(join_error)) => Error::ExecutionFailed {
                    plugin: self.plugin_name.clone(),
                    attempts: attempt_number,
                    message: join_error.to_string(),
                },
                // The attempt is left running detached; the race only
                // discards its result.
                Err(_) => Error::ExecutionTimeout {
                    plugin: self.plugin_name.clone(),
                    attempts: attempt_number,
                },
            };

            tracing::warn!(
                plugin = %self.plugin_name,
                attempt = attempt_number,
                max_retries,
                error = %failure,
                "plugin invocation failed"
            );
            last_error = Some(failure);

            if attempt_number < max_retries {
                tokio::time::sleep(Duration::from_millis(1000 * u64::from(attempt_number))).await;
            }
        }

        self.error_count.fetch_add(1, Ordering::Relaxed);

        match last_error {
            Some(Error::ExecutionTimeout { .. }) => Err(Error::ExecutionTimeout {
                plugin: self.plugin_name.clone(),
                attempts: max_retries,
            }),
            Some(error) => Err(Error::ExecutionFailed {
                plugin: self.plugin_name.clone(),
                attempts: max_retries,
                message: error.to_string(),
            }),
            None => Err(Error::ExecutionFailed {
                plugin: self.plugin_name.clone(),
                attempts: 0,
                message: "no attempts were made".to_string(),
            }),
        }
    }

    /// Run a task against a restricted context under the guard's timeout
    ///
    /// Rejects immediately with [`Error::CircuitOpen`] once the error count
    /// has reached `max_errors`, without running the task. Failures increment
    /// the error count, record the last error, and emit [`GuardEvent::Error`];
    /// reaching the threshold emits [`GuardEvent::MaxErrorsReached`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::CircuitOpen`], [`Error::ExecutionTimeout`], or
    /// [`Error::ExecutionFailed`] wrapping the task's error.
    pub async fn execute_isolated<T, F>(&self, task: F) -> Result<T>
    where
        F: FnOnce(IsolatedContext) -> BoxFuture<'static, Result<T>>,
        T: Send + 'static,
    {
        if self.error_count.load(Ordering::Relaxed) >= self.max_errors {
            return Err(Error::CircuitOpen(self.plugin_name.clone()));
        }

        let context = IsolatedContext::new(self.plugin_name.clone());
        let handle = tokio::spawn(task(context));
        let outcome = match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(error))) => Err(Error::ExecutionFailed {
                plugin: self.plugin_name.clone(),
                attempts: 1,
                message: error.to_string(),
            }),
            Ok(Err(join_error)) => Err(Error::ExecutionFailed {
                plugin: self.plugin_name.clone(),
                attempts: 1,
                message: join_error.to_string(),
            }),
            Err(_) => Err(Error::ExecutionTimeout {
                plugin: self.plugin_name.clone(),
                attempts: 1,
            }),
        };

        match outcome {
            Ok(value) => Ok(value),
            Err(error) => {
                self.record_failure(&error.to_string());
                Err(error)
            }
        }
    }

    /// Zero the error count and clear the last error
    ///
    /// The only way out of the open-circuit state.
    pub fn reset(&self) {
        self.error_count.store(0, Ordering::Relaxed);
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
        tracing::debug!(plugin = %self.plugin_name, "guard reset");
    }

    /// Snapshot guard state for diagnostics
    #[must_use]
    pub fn stats(&self) -> GuardStats {
        GuardStats {
            plugin_name: self.plugin_name.clone(),
            error_count: self.error_count.load(Ordering::Relaxed),
            max_errors: self.max_errors,
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            memory_limit_bytes: self.memory_limit,
        }
    }

    fn record_failure(&self, message: &str) {
        let count = self.error_count.fetch_add(1, Ordering::Relaxed) + 1;
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(message.to_string());

        let _ = self.events.send(GuardEvent::Error {
            plugin: self.plugin_name.clone(),
            message: message.to_string(),
        });

        if count >= self.max_errors {
            tracing::error!(
                plugin = %self.plugin_name,
                error_count = count,
                "plugin exceeded maximum error count"
            );
            let _ = self.events.send(GuardEvent::MaxErrorsReached {
                plugin: self.plugin_name.clone(),
                error_count: count,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use super::*;

    fn failing_attempt(
        calls: Arc<AtomicU32>,
    ) -> impl Fn() -> BoxFuture<'static, Result<()>> {
        move || {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Validation("boom".to_string()))
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wrapped_failure_retries_then_counts_once() {
        let guard = ExecutionGuard::new("demo");
        let calls = Arc::new(AtomicU32::new(0));
        let started = tokio::time::Instant::now();

        let result = guard
            .run_wrapped(WrapOptions::default(), failing_attempt(Arc::clone(&calls)))
            .await;

        assert!(matches!(result, Err(Error::ExecutionFailed { attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(guard.error_count(), 1);
        // Backoff is 1s after the first attempt, 2s after the second.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn wrapped_success_leaves_error_count_alone() {
        let guard = ExecutionGuard::new("demo");
        let result = guard
            .run_wrapped(WrapOptions::default(), || Box::pin(async { Ok(42) }))
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(guard.error_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wrapped_timeout_surfaces_after_retries() {
        let guard = ExecutionGuard::new("demo").with_timeout(Duration::from_millis(50));
        let result: Result<()> = guard
            .run_wrapped(
                WrapOptions {
                    timeout: None,
                    max_retries: 2,
                },
                || {
                    Box::pin(async {
                        tokio::time::sleep(Duration::from_secs(600)).await;
                        Ok(())
                    })
                },
            )
            .await;

        assert!(matches!(result, Err(Error::ExecutionTimeout { attempts: 2, .. })));
        assert_eq!(guard.error_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_attempt_keeps_running_detached() {
        let guard = ExecutionGuard::new("demo").with_timeout(Duration::from_millis(100));
        let finished = Arc::new(AtomicBool::new(false));
        let finished_in_task = Arc::clone(&finished);

        let result: Result<()> = guard
            .run_wrapped(
                WrapOptions {
                    timeout: None,
                    max_retries: 1,
                },
                move || {
                    let finished = Arc::clone(&finished_in_task);
                    Box::pin(async move {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        finished.store(true, Ordering::SeqCst);
                        Ok(())
                    })
                },
            )
            .await;

        assert!(matches!(result, Err(Error::ExecutionTimeout { .. })));
        assert!(!finished.load(Ordering::SeqCst));

        // The race discarded the result but did not cancel the attempt:
        // letting time pass sees it run to completion.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn circuit_opens_after_max_errors_and_reset_restores() {
        let guard = ExecutionGuard::new("demo").with_max_errors(2);
        let invoked = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let invoked = Arc::clone(&invoked);
            let result: Result<()> = guard
                .execute_isolated(move |_ctx| {
                    Box::pin(async move {
                        invoked.fetch_add(1, Ordering::SeqCst);
                        Err(Error::Validation("bad".to_string()))
                    })
                })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(invoked.load(Ordering::SeqCst), 2);

        // Circuit is open: the task must not run.
        let blocked = Arc::clone(&invoked);
        let result: Result<()> = guard
            .execute_isolated(move |_ctx| {
                Box::pin(async move {
                    blocked.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .await;
        assert!(matches!(result, Err(Error::CircuitOpen(_))));
        assert_eq!(invoked.load(Ordering::SeqCst), 2);

        guard.reset();
        assert_eq!(guard.error_count(), 0);

        let result = guard
            .execute_isolated(|ctx| {
                Box::pin(async move {
                    ctx.log_debug("back in business");
                    Ok("ok")
                })
            })
            .await;
        assert_eq!(result.unwrap(), "ok");
    }

    #[tokio::test]
    async fn isolated_success_does_not_reset_error_count() {
        let guard = ExecutionGuard::new("demo");
        let result: Result<()> = guard
            .execute_isolated(|_ctx| {
                Box::pin(async { Err(Error::Validation("bad".to_string())) })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(guard.error_count(), 1);

        let result = guard.execute_isolated(|_ctx| Box::pin(async { Ok(()) })).await;
        assert!(result.is_ok());
        assert_eq!(guard.error_count(), 1);
    }

    #[tokio::test]
    async fn failures_emit_guard_events() {
        let guard = ExecutionGuard::new("demo").with_max_errors(1);
        let mut events = guard.subscribe();

        let result: Result<()> = guard
            .execute_isolated(|_ctx| {
                Box::pin(async { Err(Error::Validation("bad".to_string())) })
            })
            .await;
        assert!(result.is_err());

        let first = events.try_recv().unwrap();
        assert!(matches!(first, GuardEvent::Error { .. }));
        let second = events.try_recv().unwrap();
        assert!(matches!(
            second,
            GuardEvent::MaxErrorsReached { error_count: 1, .. }
        ));
    }

    #[tokio::test]
    async fn isolated_timer_is_capped() {
        let guard = ExecutionGuard::new("demo");
        let result: Result<()> = guard
            .execute_isolated(|ctx| {
                Box::pin(async move { ctx.sleep(Duration::from_secs(61)).await })
            })
            .await;
        assert!(matches!(result, Err(Error::ExecutionFailed { .. })));
        assert_eq!(guard.error_count(), 1);
    }

    #[test]
    fn memory_ceiling_trips_and_passes() {
        let tight = ExecutionGuard::new("demo").with_memory_limit(1);
        assert!(matches!(
            tight.check_memory_usage(),
            Err(Error::MemoryLimitExceeded { .. })
        ));

        let roomy = ExecutionGuard::new("demo").with_memory_limit(u64::MAX);
        assert!(roomy.check_memory_usage().is_ok());
    }

    #[tokio::test]
    async fn stats_snapshot_reflects_state() {
        let guard = ExecutionGuard::new("demo").with_max_errors(5);
        let result: Result<()> = guard
            .execute_isolated(|_ctx| {
                Box::pin(async { Err(Error::Validation("oops".to_string())) })
            })
            .await;
        assert!(result.is_err());

        let stats = guard.stats();
        assert_eq!(stats.plugin_name, "demo");
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.max_errors, 5);
        assert!(stats.last_error.unwrap().contains("oops"));
        assert_eq!(stats.timeout_ms, 30_000);
        assert_eq!(stats.memory_limit_bytes, DEFAULT_MEMORY_LIMIT);
    }
}
