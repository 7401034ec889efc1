//! Job handlers and type-based routing.
//!
//! A handler is chosen from the job's `job_type`:
//!
//! 1. exact match on the normalized type (trimmed, lowercased)
//! 2. the first substring rule that matches, in registration order
//! 3. the fallback handler
//!
//! The built-in handlers simulate real work with configurable delays; they
//! are what the service runs out of the box.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::{Value as JsonValue, json};
use tracing::debug;

use jobq_core::{HandlerOutcome, JobId, JobPayload, RetryPolicy};

/// What a handler gets to see of the job it runs.
#[derive(Debug, Clone, Copy)]
pub struct JobContext<'a> {
    pub job_id: JobId,
    pub job_type: &'a str,
    pub payload: &'a JobPayload,
    /// 0 on the first delivery.
    pub attempt: u32,
}

pub trait JobHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn handle(&self, ctx: &JobContext<'_>) -> HandlerOutcome;

    /// Overrides the executor's default policy for jobs routed here.
    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }
}

/// Maps job types to handlers.
pub struct HandlerRegistry {
    exact: HashMap<String, Arc<dyn JobHandler>>,
    rules: Vec<(Vec<String>, Arc<dyn JobHandler>)>,
    fallback: Arc<dyn JobHandler>,
}

fn normalize(job_type: &str) -> String {
    job_type.trim().to_lowercase()
}

impl HandlerRegistry {
    pub fn new(fallback: impl JobHandler + 'static) -> Self {
        Self {
            exact: HashMap::new(),
            rules: Vec::new(),
            fallback: Arc::new(fallback),
        }
    }

    /// Registry with the built-in handlers wired to their usual job types.
    pub fn with_builtin_handlers(work: SimulatedWork) -> Self {
        let mut registry = Self::new(DefaultHandler);
        registry
            .register_rule(&["email", "send"], QuickHandler::new(work.quick_delay))
            .register_rule(
                &["long", "calculation", "compute"],
                SlowHandler::new(work.slow_delay),
            )
            .register_rule(
                &["data", "analysis"],
                FlakyHandler::new(
                    work.flaky_delay,
                    work.flaky_failure_rate,
                    work.flaky_failing_attempts,
                ),
            );
        registry
    }

    /// Route exactly this job type (case-insensitive) to `handler`.
    pub fn register_handler(
        &mut self,
        job_type: &str,
        handler: impl JobHandler + 'static,
    ) -> &mut Self {
        self.exact.insert(normalize(job_type), Arc::new(handler));
        self
    }

    /// Route job types containing any of `needles` to `handler`.
    pub fn register_rule(
        &mut self,
        needles: &[&str],
        handler: impl JobHandler + 'static,
    ) -> &mut Self {
        let needles = needles.iter().map(|n| normalize(n)).collect();
        self.rules.push((needles, Arc::new(handler)));
        self
    }

    pub fn resolve(&self, job_type: &str) -> Arc<dyn JobHandler> {
        let key = normalize(job_type);

        if let Some(handler) = self.exact.get(&key) {
            return Arc::clone(handler);
        }

        for (needles, handler) in &self.rules {
            if needles.iter().any(|needle| key.contains(needle.as_str())) {
                return Arc::clone(handler);
            }
        }

        Arc::clone(&self.fallback)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("exact", &self.exact.keys().collect::<Vec<_>>())
            .field("rules", &self.rules.iter().map(|(n, h)| (n, h.name())).collect::<Vec<_>>())
            .field("fallback", &self.fallback.name())
            .finish()
    }
}

/// Timing and failure knobs of the built-in handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedWork {
    pub quick_delay: Duration,
    pub slow_delay: Duration,
    pub flaky_delay: Duration,
    /// Probability (0.0-1.0) that a flaky job fails transiently.
    pub flaky_failure_rate: f64,
    /// Attempts numbered at or above this always succeed.
    pub flaky_failing_attempts: u32,
}

impl Default for SimulatedWork {
    fn default() -> Self {
        Self {
            quick_delay: Duration::from_secs(2),
            slow_delay: Duration::from_secs(10),
            flaky_delay: Duration::from_secs(3),
            flaky_failure_rate: 0.5,
            flaky_failing_attempts: 2,
        }
    }
}

impl SimulatedWork {
    /// No sleeping and no random failures.
    pub fn instant() -> Self {
        Self {
            quick_delay: Duration::ZERO,
            slow_delay: Duration::ZERO,
            flaky_delay: Duration::ZERO,
            flaky_failure_rate: 0.0,
            flaky_failing_attempts: 0,
        }
    }
}

fn pause(delay: Duration) {
    if !delay.is_zero() {
        thread::sleep(delay);
    }
}

/// Short jobs such as sending an email.
#[derive(Debug, Clone)]
pub struct QuickHandler {
    delay: Duration,
}

impl QuickHandler {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl JobHandler for QuickHandler {
    fn name(&self) -> &'static str {
        "quick"
    }

    fn handle(&self, ctx: &JobContext<'_>) -> HandlerOutcome {
        pause(self.delay);
        let recipient = ctx.payload.get("to").cloned().unwrap_or(JsonValue::Null);
        HandlerOutcome::success(json!({
            "status": "success",
            "message": "Email sent successfully.",
            "recipient": recipient,
        }))
    }
}

/// Long-running computations.
///
/// Sums `1..=n` for the payload's `n` (default 1000).
#[derive(Debug, Clone)]
pub struct SlowHandler {
    delay: Duration,
}

impl SlowHandler {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl JobHandler for SlowHandler {
    fn name(&self) -> &'static str {
        "slow"
    }

    fn handle(&self, ctx: &JobContext<'_>) -> HandlerOutcome {
        let n = match ctx.payload.get("n") {
            None => 1000,
            Some(value) => match value.as_u64() {
                Some(n) => n,
                None => return HandlerOutcome::permanent("payload field 'n' must be a non-negative integer"),
            },
        };

        pause(self.delay);

        let n = u128::from(n);
        let sum = n * (n + 1) / 2;
        HandlerOutcome::success(json!({
            "status": "success",
            "message": "Long-running calculation finished.",
            "n": ctx.payload.get("n").cloned().unwrap_or(json!(1000)),
            "sum": sum.to_string(),
        }))
    }
}

/// Source of uniform samples in `[0, 1)`.
pub type Sampler = Arc<dyn Fn() -> f64 + Send + Sync>;

/// Work that fails transiently some of the time, like a call to an unreliable
/// upstream.
///
/// Only the first `failing_attempts` attempts can fail, so a retried job
/// eventually gets through.
#[derive(Clone)]
pub struct FlakyHandler {
    delay: Duration,
    failure_rate: f64,
    failing_attempts: u32,
    sample: Sampler,
}

impl FlakyHandler {
    pub fn new(delay: Duration, failure_rate: f64, failing_attempts: u32) -> Self {
        Self::with_sampler(
            delay,
            failure_rate,
            failing_attempts,
            Arc::new(rand::random::<f64>),
        )
    }

    pub fn with_sampler(
        delay: Duration,
        failure_rate: f64,
        failing_attempts: u32,
        sample: Sampler,
    ) -> Self {
        Self {
            delay,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            failing_attempts,
            sample,
        }
    }
}

impl std::fmt::Debug for FlakyHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlakyHandler")
            .field("delay", &self.delay)
            .field("failure_rate", &self.failure_rate)
            .field("failing_attempts", &self.failing_attempts)
            .finish()
    }
}

impl JobHandler for FlakyHandler {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn handle(&self, ctx: &JobContext<'_>) -> HandlerOutcome {
        pause(self.delay);

        if ctx.attempt < self.failing_attempts {
            let roll = (self.sample)();
            if roll < self.failure_rate {
                debug!(job_id = %ctx.job_id, attempt = ctx.attempt, roll, "simulated transient failure");
                return HandlerOutcome::transient("Simulated transient failure during data analysis.");
            }
        }

        HandlerOutcome::success(json!({
            "status": "success",
            "message": "Data analysis complete.",
            "fields_analyzed": ctx.payload.len(),
            "attempt": ctx.attempt,
        }))
    }
}

/// Completes any job nothing else claimed.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHandler;

impl JobHandler for DefaultHandler {
    fn name(&self) -> &'static str {
        "default"
    }

    fn handle(&self, ctx: &JobContext<'_>) -> HandlerOutcome {
        HandlerOutcome::success(json!({
            "status": "success",
            "message": format!("No specific handler for job type '{}'; processed by default handler.", ctx.job_type),
        }))
    }
}

/// Adapts a closure into a handler.
pub struct FnHandler<F> {
    name: &'static str,
    run: F,
    policy: Option<RetryPolicy>,
}

impl<F> FnHandler<F>
where
    F: Fn(&JobContext<'_>) -> HandlerOutcome + Send + Sync,
{
    pub fn new(name: &'static str, run: F) -> Self {
        Self {
            name,
            run,
            policy: None,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }
}

impl<F> JobHandler for FnHandler<F>
where
    F: Fn(&JobContext<'_>) -> HandlerOutcome + Send + Sync,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn handle(&self, ctx: &JobContext<'_>) -> HandlerOutcome {
        (self.run)(ctx)
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        self.policy.clone()
    }
}
