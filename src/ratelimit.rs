//! Adaptive pacing for all outbound registry and provider calls.
//!
//! Many workers share one [`AdaptiveLimiter`]. All mutable state sits behind a
//! single async mutex and is touched only through `acquire_slot` and
//! `report_outcome`; callers never mutate pacing state directly. Every
//! `checkpoint_every` reported outcomes the limiter evaluates the throttle
//! ratio over the window and hill-climbs its minimum interval: up (capped)
//! when the upstream pushes back, down (floored) when the coast is clear.

use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::{PipelineError, Result};

/// Classification of one completed outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    NotFound,
    RateLimited,
    Forbidden,
    ServerError,
    Other,
}

impl Outcome {
    /// Classifies an HTTP status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => Outcome::Success,
            404 => Outcome::NotFound,
            429 => Outcome::RateLimited,
            401 | 403 => Outcome::Forbidden,
            500..=599 => Outcome::ServerError,
            _ => Outcome::Other,
        }
    }

    /// Classifies the result of a call for reporting purposes.
    pub fn from_result<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Outcome::Success,
            Err(PipelineError::NotFound) => Outcome::NotFound,
            Err(PipelineError::RateLimited { .. }) => Outcome::RateLimited,
            Err(PipelineError::Forbidden { .. }) => Outcome::Forbidden,
            Err(PipelineError::Server { .. }) => Outcome::ServerError,
            Err(_) => Outcome::Other,
        }
    }
}

/// Per-class call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub success: u64,
    pub not_found: u64,
    pub rate_limited: u64,
    pub forbidden: u64,
    pub server_error: u64,
    pub other: u64,
}

impl Tally {
    fn note(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Success => self.success += 1,
            Outcome::NotFound => self.not_found += 1,
            Outcome::RateLimited => self.rate_limited += 1,
            Outcome::Forbidden => self.forbidden += 1,
            Outcome::ServerError => self.server_error += 1,
            Outcome::Other => self.other += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.success
            + self.not_found
            + self.rate_limited
            + self.forbidden
            + self.server_error
            + self.other
    }

    /// Calls that count against the upstream's tolerance.
    pub fn throttled(&self) -> u64 {
        self.rate_limited + self.forbidden
    }
}

#[derive(Clone, Debug)]
pub struct LimiterConfig {
    pub initial_interval: Duration,
    pub floor_interval: Duration,
    pub max_interval: Duration,
    /// Multiplier applied when the throttle ratio exceeds `high_ratio`.
    pub raise_factor: f64,
    /// Multiplier applied when the throttle ratio drops below `low_ratio`.
    pub lower_factor: f64,
    pub high_ratio: f64,
    pub low_ratio: f64,
    /// Outcome reports between controller evaluations.
    pub checkpoint_every: u64,
    /// Upper bound of the random per-call jitter.
    pub max_jitter: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            floor_interval: Duration::from_millis(20),
            max_interval: Duration::from_secs(5),
            raise_factor: 1.5,
            lower_factor: 0.8,
            high_ratio: 0.10,
            low_ratio: 0.02,
            checkpoint_every: 50,
            max_jitter: Duration::from_millis(50),
        }
    }
}

#[derive(Debug)]
struct PacerState {
    next_allowed: Instant,
    min_interval: Duration,
    window: Tally,
    totals: Tally,
    reports: u64,
}

/// Shared pacer with a hill-climbing interval controller.
#[derive(Debug)]
pub struct AdaptiveLimiter {
    config: LimiterConfig,
    state: Mutex<PacerState>,
}

impl AdaptiveLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        // A zero checkpoint cadence would make the modulo below panic.
        let config = LimiterConfig {
            checkpoint_every: config.checkpoint_every.max(1),
            ..config
        };
        let state = PacerState {
            next_allowed: Instant::now(),
            min_interval: config.initial_interval,
            window: Tally::default(),
            totals: Tally::default(),
            reports: 0,
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    /// Blocks until this caller's turn, then waits a bounded random jitter.
    ///
    /// The lock is held only to claim the slot; the sleep happens outside it
    /// so other workers can queue up behind us.
    pub async fn acquire_slot(&self) {
        let wait = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let slot = state.next_allowed.max(now);
            state.next_allowed = slot + state.min_interval;
            slot.saturating_duration_since(now)
        };
        let jitter_ms = self.config.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        if wait + jitter > Duration::ZERO {
            tokio::time::sleep(wait + jitter).await;
        }
    }

    /// Tallies one completed call and, at checkpoints, retunes the interval.
    pub async fn report_outcome(&self, outcome: Outcome) {
        let mut state = self.state.lock().await;
        state.window.note(outcome);
        state.totals.note(outcome);
        state.reports += 1;

        if state.reports % self.config.checkpoint_every != 0 {
            return;
        }

        let window = state.window;
        state.window = Tally::default();
        let before = state.min_interval;
        state.min_interval = adjusted_interval(&self.config, before, &window);

        if state.min_interval != before {
            info!(
                throttled = window.throttled(),
                total = window.total(),
                interval_before_ms = before.as_millis() as u64,
                interval_after_ms = state.min_interval.as_millis() as u64,
                "rate controller adjusted pacing interval"
            );
        } else {
            debug!(
                throttled = window.throttled(),
                total = window.total(),
                interval_ms = before.as_millis() as u64,
                "rate controller checkpoint, interval unchanged"
            );
        }
    }

    /// Current minimum interval between calls.
    pub async fn current_interval(&self) -> Duration {
        self.state.lock().await.min_interval
    }

    /// Cumulative outcome counters since construction.
    pub async fn totals(&self) -> Tally {
        self.state.lock().await.totals
    }
}

/// Pure controller step: the new interval given the last window's outcomes.
fn adjusted_interval(config: &LimiterConfig, current: Duration, window: &Tally) -> Duration {
    let total = window.total();
    if total == 0 {
        return current;
    }
    let ratio = window.throttled() as f64 / total as f64;
    if ratio > config.high_ratio {
        current.mul_f64(config.raise_factor).min(config.max_interval)
    } else if ratio < config.low_ratio {
        current.mul_f64(config.lower_factor).max(config.floor_interval)
    } else {
        current
    }
}

/// Bounded backoff for one logical operation.
///
/// Network and server errors back off linearly with the attempt number;
/// throttle responses back off `throttle_scale` times harder. Exhausting the
/// attempts yields [`PipelineError::Exhausted`], which callers treat as "skip
/// this item, a future run will pick it up" rather than a hard failure.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub throttle_scale: u32,
    pub backoff: Backoff,
}

/// How the delay grows with the attempt number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Backoff {
    /// `base * attempt` — per-call retries against the registry.
    #[default]
    Linear,
    /// `base * 2^(attempt-1)` — whole-batch retries against the provider.
    Exponential,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            throttle_scale: 4,
            backoff: Backoff::Linear,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32, throttled: bool) -> Duration {
        let scale = if throttled { self.throttle_scale } else { 1 };
        let steps = match self.backoff {
            Backoff::Linear => attempt,
            Backoff::Exponential => 1u32 << (attempt - 1).min(16),
        };
        self.base_delay * steps * scale
    }
}

/// Runs `op` under `policy`. The closure receives the 1-based attempt number.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last: Option<PipelineError> = None;
    for attempt in 1..=policy.max_attempts {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => {
                let delay = policy.delay_for(attempt, e.is_throttle());
                warn!(
                    what,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retryable failure, backing off"
                );
                last = Some(e);
                if attempt < policy.max_attempts {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(PipelineError::Exhausted {
        attempts: policy.max_attempts,
        last: Box::new(last.unwrap_or(PipelineError::Provider(format!(
            "{what}: retries exhausted without a recorded error"
        )))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn window_of(throttled: u64, total: u64) -> Tally {
        Tally {
            success: total - throttled,
            rate_limited: throttled,
            ..Default::default()
        }
    }

    #[test]
    fn controller_raises_under_pressure_until_cap() {
        let config = LimiterConfig::default();
        let mut interval = config.initial_interval;
        let mut previous = interval;
        for _ in 0..20 {
            interval = adjusted_interval(&config, interval, &window_of(20, 50));
            assert!(interval >= previous, "interval must not decrease under pressure");
            previous = interval;
        }
        assert_eq!(interval, config.max_interval);
    }

    #[test]
    fn controller_lowers_when_quiet_until_floor() {
        let config = LimiterConfig::default();
        let mut interval = Duration::from_secs(2);
        let mut previous = interval;
        for _ in 0..40 {
            interval = adjusted_interval(&config, interval, &window_of(0, 50));
            assert!(interval <= previous, "interval must not increase when quiet");
            previous = interval;
        }
        assert_eq!(interval, config.floor_interval);
    }

    #[test]
    fn controller_holds_in_the_dead_band() {
        let config = LimiterConfig::default();
        // 3/50 = 6%: between low (2%) and high (10%).
        let interval = adjusted_interval(&config, Duration::from_millis(200), &window_of(3, 50));
        assert_eq!(interval, Duration::from_millis(200));
    }

    #[test]
    fn controller_ignores_empty_windows() {
        let config = LimiterConfig::default();
        let interval =
            adjusted_interval(&config, Duration::from_millis(123), &Tally::default());
        assert_eq!(interval, Duration::from_millis(123));
    }

    #[tokio::test]
    async fn report_outcome_adjusts_at_checkpoints_only() {
        let config = LimiterConfig {
            checkpoint_every: 10,
            ..Default::default()
        };
        let limiter = AdaptiveLimiter::new(config.clone());
        let before = limiter.current_interval().await;

        for _ in 0..9 {
            limiter.report_outcome(Outcome::RateLimited).await;
        }
        assert_eq!(limiter.current_interval().await, before, "no checkpoint yet");

        limiter.report_outcome(Outcome::RateLimited).await;
        let after = limiter.current_interval().await;
        assert!(after > before, "checkpoint under pure throttling must raise");
        assert_eq!(after, before.mul_f64(config.raise_factor));
    }

    #[tokio::test]
    async fn zero_checkpoint_cadence_is_clamped() {
        let limiter = AdaptiveLimiter::new(LimiterConfig {
            checkpoint_every: 0,
            ..Default::default()
        });
        for _ in 0..3 {
            limiter.report_outcome(Outcome::Success).await;
        }
        assert_eq!(limiter.totals().await.success, 3);
    }

    #[tokio::test]
    async fn totals_accumulate_across_checkpoints() {
        let limiter = AdaptiveLimiter::new(LimiterConfig {
            checkpoint_every: 5,
            ..Default::default()
        });
        for _ in 0..12 {
            limiter.report_outcome(Outcome::Success).await;
        }
        limiter.report_outcome(Outcome::NotFound).await;
        let totals = limiter.totals().await;
        assert_eq!(totals.success, 12);
        assert_eq!(totals.not_found, 1);
        assert_eq!(totals.total(), 13);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_slot_spaces_calls_by_the_interval() {
        let limiter = AdaptiveLimiter::new(LimiterConfig {
            initial_interval: Duration::from_millis(100),
            max_jitter: Duration::ZERO,
            ..Default::default()
        });

        let start = Instant::now();
        limiter.acquire_slot().await;
        limiter.acquire_slot().await;
        limiter.acquire_slot().await;
        // Two full intervals must have elapsed for the third slot.
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_skips_after_bounded_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            throttle_scale: 2,
            ..Default::default()
        };
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(&policy, "always-429", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(PipelineError::RateLimited { status: 429 }) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(PipelineError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(last.is_throttle());
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_immediately_on_non_retryable_errors() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(&policy, "bad-config", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(PipelineError::Config("nope".into())) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_after_transient_failures() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let result = retry(&policy, "flaky", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(PipelineError::Server { status: 503 })
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn linear_and_exponential_delays() {
        let linear = RetryPolicy {
            base_delay: Duration::from_millis(100),
            ..Default::default()
        };
        assert_eq!(linear.delay_for(1, false), Duration::from_millis(100));
        assert_eq!(linear.delay_for(3, false), Duration::from_millis(300));
        assert_eq!(
            linear.delay_for(2, true),
            Duration::from_millis(200 * linear.throttle_scale as u64)
        );

        let expo = RetryPolicy {
            base_delay: Duration::from_millis(100),
            backoff: Backoff::Exponential,
            ..Default::default()
        };
        assert_eq!(expo.delay_for(1, false), Duration::from_millis(100));
        assert_eq!(expo.delay_for(2, false), Duration::from_millis(200));
        assert_eq!(expo.delay_for(4, false), Duration::from_millis(800));
    }

    #[test]
    fn status_classification_covers_the_taxonomy() {
        assert_eq!(Outcome::from_status(200), Outcome::Success);
        assert_eq!(Outcome::from_status(404), Outcome::NotFound);
        assert_eq!(Outcome::from_status(429), Outcome::RateLimited);
        assert_eq!(Outcome::from_status(403), Outcome::Forbidden);
        assert_eq!(Outcome::from_status(500), Outcome::ServerError);
        assert_eq!(Outcome::from_status(302), Outcome::Other);
    }
}
