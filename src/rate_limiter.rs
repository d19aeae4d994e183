use crate::error::AdapterError;
use log::warn;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::Mutex;

/// A clock abstraction so tests can drive backoff without sleeping for real
/// time.
pub trait Clock: Send + Sync {
    fn now_unix(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// A sleeper abstraction so tests can assert "we waited at least N seconds"
/// without actually blocking the test runner.
#[async_trait::async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: StdDuration);
}

pub struct TokioSleeper;

#[async_trait::async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: StdDuration) {
        tokio::time::sleep(duration).await;
    }
}

/// Per-upstream rate-limit state: remaining calls and reset time, read
/// atomically and written under a lock. Passed explicitly to adapter
/// constructors rather than held as a process-wide singleton.
#[derive(Debug, Default)]
struct RateLimitState {
    remaining: Option<u64>,
    reset_unix: Option<u64>,
}

pub struct RateLimiter {
    max_retries: u32,
    state: Mutex<RateLimitState>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

/// What the caller observed about a single HTTP response, enough for the
/// limiter to decide whether/how to wait.
#[derive(Debug, Clone)]
pub struct ResponseSignal {
    pub status: u16,
    pub remaining: Option<u64>,
    pub reset_unix: Option<u64>,
    /// Set when the transport was 200 but the GraphQL body carried an
    /// `errors` array.
    pub graphql_rate_limited: bool,
    pub graphql_error_message: Option<String>,
    /// The decoded JSON body of the response, carried through so a
    /// successful call can hand it back to the adapter without a second
    /// round trip.
    pub body: serde_json::Value,
}

impl Default for ResponseSignal {
    fn default() -> Self {
        Self {
            status: 0,
            remaining: None,
            reset_unix: None,
            graphql_rate_limited: false,
            graphql_error_message: None,
            body: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Verdict {
    Retry,
    Terminal,
    Success,
}

impl RateLimiter {
    pub fn new(max_retries: u32) -> Self {
        Self::with_clock_and_sleeper(max_retries, Arc::new(SystemClock), Arc::new(TokioSleeper))
    }

    pub fn with_clock_and_sleeper(max_retries: u32, clock: Arc<dyn Clock>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            max_retries,
            state: Mutex::new(RateLimitState::default()),
            clock,
            sleeper,
        }
    }

    /// Runs `make_request`, retrying until it succeeds, exhausts
    /// `max_retries`, or a terminal failure is observed.
    pub async fn call<F, Fut>(&self, mut make_request: F) -> Result<ResponseSignal, AdapterError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<ResponseSignal, AdapterError>>,
    {
        let mut attempt = 0u32;
        loop {
            let signal = make_request().await?;
            self.record(&signal).await;

            match self.classify(&signal) {
                Verdict::Success => return Ok(signal),
                Verdict::Terminal => {
                    return Err(AdapterError::Permanent(format!(
                        "terminal HTTP {} (graphql_error={:?})",
                        signal.status, signal.graphql_error_message
                    )))
                }
                Verdict::Retry => {
                    if attempt >= self.max_retries {
                        return Err(AdapterError::Transient(format!(
                            "exhausted {} retries, last status {}",
                            self.max_retries, signal.status
                        )));
                    }
                    let wait = self.backoff_duration(attempt, &signal).await;
                    warn!(
                        "rate-limiter: retrying after {:?} (attempt {}/{}, status={})",
                        wait, attempt + 1, self.max_retries, signal.status
                    );
                    self.sleeper.sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Classification: network/5xx/429/graphql "rate limit" are retryable;
    /// other 4xx are terminal.
    fn classify(&self, signal: &ResponseSignal) -> Verdict {
        if signal.graphql_rate_limited {
            return Verdict::Retry;
        }
        if let Some(msg) = &signal.graphql_error_message {
            let _ = msg;
            return Verdict::Terminal;
        }
        match signal.status {
            200..=299 => Verdict::Success,
            429 => Verdict::Retry,
            s if s >= 500 => Verdict::Retry,
            _ => Verdict::Terminal,
        }
    }

    async fn record(&self, signal: &ResponseSignal) {
        let mut state = self.state.lock().await;
        if signal.remaining.is_some() {
            state.remaining = signal.remaining;
        }
        if signal.reset_unix.is_some() {
            state.reset_unix = signal.reset_unix;
        }
    }

    /// `2^attempt` seconds by default; on 429 (or remaining < 100) with a
    /// reset hint, sleep until `max(0, reset - now) + 10s` instead.
    async fn backoff_duration(&self, attempt: u32, signal: &ResponseSignal) -> StdDuration {
        let low_remaining = signal.remaining.map(|r| r < 100).unwrap_or(false);
        if (signal.status == 429 || signal.graphql_rate_limited || low_remaining) && signal.reset_unix.is_some() {
            let reset = signal.reset_unix.unwrap();
            let now = self.clock.now_unix();
            let base = reset.saturating_sub(now);
            return StdDuration::from_secs(base + 10);
        }
        StdDuration::from_secs(2u64.saturating_pow(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FixedClock(AtomicU64);
    impl Clock for FixedClock {
        fn now_unix(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct RecordingSleeper {
        total: Mutex<StdDuration>,
    }
    #[async_trait::async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: StdDuration) {
            let mut total = self.total.lock().await;
            *total += duration;
        }
    }

    #[tokio::test]
    async fn retries_on_429_then_succeeds() {
        let clock = Arc::new(FixedClock(AtomicU64::new(1_000)));
        let sleeper = Arc::new(RecordingSleeper { total: Mutex::new(StdDuration::ZERO) });
        let limiter = RateLimiter::with_clock_and_sleeper(3, clock, sleeper.clone());

        let mut call_count = 0;
        let result = limiter
            .call(|| {
                call_count += 1;
                let n = call_count;
                async move {
                    if n == 1 {
                        Ok(ResponseSignal {
                            status: 429,
                            remaining: Some(0),
                            reset_unix: Some(1_002),
                            graphql_rate_limited: false,
                            graphql_error_message: None,
                        ..Default::default()
                        })
                    } else {
                        Ok(ResponseSignal {
                            status: 200,
                            remaining: Some(100),
                            reset_unix: None,
                            graphql_rate_limited: false,
                            graphql_error_message: None,
                        ..Default::default()
                        })
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(call_count, 2);
        let waited = *sleeper.total.lock().await;
        assert!(waited >= StdDuration::from_secs(2));
    }

    #[tokio::test]
    async fn non_rate_limit_4xx_is_terminal() {
        let limiter = RateLimiter::new(3);
        let result = limiter
            .call(|| async {
                Ok(ResponseSignal {
                    status: 404,
                    remaining: None,
                    reset_unix: None,
                    graphql_rate_limited: false,
                    graphql_error_message: None,
                    ..Default::default()
                })
            })
            .await;
        assert!(matches!(result, Err(AdapterError::Permanent(_))));
    }

    #[tokio::test]
    async fn graphql_errors_array_without_rate_limit_text_is_terminal() {
        let limiter = RateLimiter::new(3);
        let result = limiter
            .call(|| async {
                Ok(ResponseSignal {
                    status: 200,
                    remaining: None,
                    reset_unix: None,
                    graphql_rate_limited: false,
                    graphql_error_message: Some("field X does not exist".to_string()),
                    ..Default::default()
                })
            })
            .await;
        assert!(matches!(result, Err(AdapterError::Permanent(_))));
    }

    #[tokio::test]
    async fn exhausting_retries_on_5xx_is_transient() {
        let clock = Arc::new(FixedClock(AtomicU64::new(1_000)));
        let sleeper = Arc::new(RecordingSleeper { total: Mutex::new(StdDuration::ZERO) });
        let limiter = RateLimiter::with_clock_and_sleeper(2, clock, sleeper);
        let result = limiter
            .call(|| async {
                Ok(ResponseSignal {
                    status: 503,
                    remaining: None,
                    reset_unix: None,
                    graphql_rate_limited: false,
                    graphql_error_message: None,
                    ..Default::default()
                })
            })
            .await;
        assert!(matches!(result, Err(AdapterError::Transient(_))));
    }
}
