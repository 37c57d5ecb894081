use indexmap::IndexMap;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Single in-process token bucket rate limiter, keyed by client identifier
/// (spec.md §4.9). `rps`/`burst` are validated at construction, matching
/// the original's `rps <= 0` / `burst <= 0` guards.
pub struct TokenBucketLimiter {
    rps: f64,
    burst: f64,
    ttl: Duration,
    max_buckets: usize,
    state: Mutex<LimiterState>,
}

struct LimiterState {
    buckets: IndexMap<String, Bucket>,
    ops: u64,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

#[derive(Debug, Error)]
pub enum RateLimitConfigError {
    #[error("rps must be > 0")]
    InvalidRps,
    #[error("burst must be > 0")]
    InvalidBurst,
}

pub const DEFAULT_TTL_SECONDS: u64 = 3600;
pub const DEFAULT_MAX_BUCKETS: usize = 10_000;
const CLEANUP_INTERVAL_OPS: u64 = 256;

impl TokenBucketLimiter {
    pub fn new(rps: f64, burst: u32) -> Result<Self, RateLimitConfigError> {
        Self::with_limits(rps, burst, DEFAULT_TTL_SECONDS, DEFAULT_MAX_BUCKETS)
    }

    pub fn with_limits(
        rps: f64,
        burst: u32,
        ttl_seconds: u64,
        max_buckets: usize,
    ) -> Result<Self, RateLimitConfigError> {
        if rps <= 0.0 {
            return Err(RateLimitConfigError::InvalidRps);
        }
        if burst == 0 {
            return Err(RateLimitConfigError::InvalidBurst);
        }
        Ok(Self {
            rps,
            burst: burst as f64,
            ttl: Duration::from_secs(ttl_seconds),
            max_buckets,
            state: Mutex::new(LimiterState {
                buckets: IndexMap::new(),
                ops: 0,
            }),
        })
    }

    /// Returns `(allowed, retry_after_seconds)`. `retry_after_seconds` is
    /// only meaningful when `allowed = false`.
    pub fn consume(&self, key: &str) -> (bool, f64) {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        state.ops = state.ops.wrapping_add(1);

        if state.ops % CLEANUP_INTERVAL_OPS == 0 {
            self.cleanup_expired(&mut state, now);
        }

        if !state.buckets.contains_key(key) {
            if state.buckets.len() >= self.max_buckets {
                state.buckets.shift_remove_index(0);
            }
            state.buckets.insert(
                key.to_string(),
                Bucket {
                    tokens: self.burst,
                    last_refill: now,
                    last_seen: now,
                },
            );
        }

        let bucket = state.buckets.get_mut(key).unwrap();
        self.refill(bucket, now);
        bucket.last_seen = now;

        let result = if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            (true, 0.0)
        } else {
            let tokens_needed = 1.0 - bucket.tokens;
            (false, tokens_needed / self.rps)
        };

        state.buckets.move_index(
            state.buckets.get_index_of(key).unwrap(),
            state.buckets.len() - 1,
        );
        result
    }

    pub fn remaining(&self, key: &str) -> u32 {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        match state.buckets.get_mut(key) {
            None => self.burst as u32,
            Some(bucket) => {
                self.refill(bucket, now);
                bucket.tokens as u32
            }
        }
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        bucket.tokens = (bucket.tokens + elapsed * self.rps).min(self.burst);
        bucket.last_refill = now;
    }

    fn cleanup_expired(&self, state: &mut LimiterState, now: Instant) {
        if self.ttl.is_zero() {
            return;
        }
        let expired: Vec<String> = state
            .buckets
            .iter()
            .take_while(|(_, bucket)| now.saturating_duration_since(bucket.last_seen) > self.ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            state.buckets.shift_remove(&key);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryableStatus {
    Permanent,
    Retryable,
}

const PERMANENT_STATUS_CODES: [u16; 4] = [400, 401, 403, 404];

pub fn classify_status(status: u16) -> RetryableStatus {
    if PERMANENT_STATUS_CODES.contains(&status) {
        RetryableStatus::Permanent
    } else {
        RetryableStatus::Retryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_seconds: f64,
    pub max_delay_seconds: f64,
}

impl RetryPolicy {
    /// `delay_n = min(max_delay, max(retry_after, base·2^(n-1)·jitter))`,
    /// `jitter` uniform in `[0.5, 1.0]` (spec.md §4.9). `attempt` is 1-based.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<f64>) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..=1.0);
        let backoff = self.base_delay_seconds * 2f64.powi(attempt as i32 - 1) * jitter;
        let floor = retry_after.unwrap_or(0.0).max(backoff);
        Duration::from_secs_f64(floor.min(self.max_delay_seconds).max(0.0))
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("exhausted {attempts} attempts; last error: {source}")]
    Exhausted { attempts: u32, source: E },
}

/// Retries `operation` up to `policy.max_attempts` times. `operation` returns
/// `Err((status, retry_after, error))`, where `retry_after` is the
/// collaborator's advertised `Retry-After` in seconds, if any; permanent
/// statuses abort immediately without retrying (spec.md §4.9). The sleep
/// between attempts is injected via `sleep` so tests can run without real
/// delay.
pub async fn retry_with_backoff<T, E, F, Fut, S, SleepFut>(
    policy: RetryPolicy,
    mut operation: F,
    mut sleep: S,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, (u16, Option<f64>, E)>>,
    S: FnMut(Duration) -> SleepFut,
    SleepFut: std::future::Future<Output = ()>,
{
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err((status, retry_after, error)) => {
                if classify_status(status) == RetryableStatus::Permanent
                    || attempt >= policy.max_attempts
                {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        source: error,
                    });
                }
                sleep(policy.delay_for(attempt, retry_after)).await;
                attempt += 1;
            }
        }
    }
}

/// Request/job correlation id (spec.md §4.9). Accepts an inbound
/// `X-Request-Id` when it is non-empty and ≤128 chars; otherwise mints a
/// fresh UUID v4.
pub fn resolve_request_id(inbound: Option<&str>) -> String {
    match inbound {
        Some(value) if !value.trim().is_empty() && value.len() <= 128 => value.to_string(),
        _ => crate::model::new_id(),
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DownloadError {
    #[error("file too large: exceeded {max_bytes} bytes")]
    FileTooLarge { max_bytes: u64 },
}

/// Hashes a stream incrementally, aborting with `FileTooLarge` before
/// buffering any byte beyond `max_bytes` (spec.md's Testable Property 12).
/// `chunks` yields byte slices in arrival order.
pub fn hash_stream_with_cap<I>(chunks: I, max_bytes: u64) -> Result<(String, u64), DownloadError>
where
    I: IntoIterator<Item = Vec<u8>>,
{
    let mut hasher = Sha256::new();
    let mut total: u64 = 0;
    for chunk in chunks {
        total += chunk.len() as u64;
        if total > max_bytes {
            return Err(DownloadError::FileTooLarge { max_bytes });
        }
        hasher.update(&chunk);
    }
    Ok((format!("{:x}", hasher.finalize()), total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn rejects_non_positive_rps_or_burst() {
        assert!(matches!(
            TokenBucketLimiter::new(0.0, 5),
            Err(RateLimitConfigError::InvalidRps)
        ));
        assert!(matches!(
            TokenBucketLimiter::new(1.0, 0),
            Err(RateLimitConfigError::InvalidBurst)
        ));
    }

    #[test]
    fn allows_up_to_burst_then_denies() {
        let limiter = TokenBucketLimiter::new(1.0, 2).unwrap();
        let (allowed1, _) = limiter.consume("client-a");
        let (allowed2, _) = limiter.consume("client-a");
        let (allowed3, retry_after) = limiter.consume("client-a");
        assert!(allowed1);
        assert!(allowed2);
        assert!(!allowed3);
        assert!(retry_after >= 0.0);
    }

    #[test]
    fn buckets_are_independent_per_key() {
        let limiter = TokenBucketLimiter::new(1.0, 1).unwrap();
        let (a, _) = limiter.consume("a");
        let (b, _) = limiter.consume("b");
        assert!(a);
        assert!(b);
    }

    #[test]
    fn permanent_status_codes_never_retry() {
        assert_eq!(classify_status(404), RetryableStatus::Permanent);
        assert_eq!(classify_status(401), RetryableStatus::Permanent);
        assert_eq!(classify_status(503), RetryableStatus::Retryable);
    }

    #[test]
    fn retry_delay_respects_max_delay_cap() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_seconds: 100.0,
            max_delay_seconds: 1.0,
        };
        let delay = policy.delay_for(5, None);
        assert!(delay.as_secs_f64() <= 1.0);
    }

    #[tokio::test]
    async fn retry_with_backoff_stops_on_permanent_error() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_seconds: 0.0,
            max_delay_seconds: 0.0,
        };
        let mut attempts = 0u32;
        let result: Result<(), RetryError<&str>> = retry_with_backoff(
            policy,
            |n| {
                attempts = n;
                async move { Err((404, None, "not found")) }
            },
            |_| async {},
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn retry_with_backoff_honors_retry_after() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay_seconds: 0.01,
            max_delay_seconds: 30.0,
        };
        let slept: Arc<std::sync::Mutex<Vec<Duration>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let slept_in_closure = slept.clone();
        let result: Result<(), RetryError<&str>> = retry_with_backoff(
            policy,
            |_n| async move { Err((503, Some(5.0), "backend busy")) },
            move |delay| {
                slept_in_closure.lock().unwrap().push(delay);
                async {}
            },
        )
        .await;
        assert!(result.is_err());
        let recorded = slept.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].as_secs_f64() >= 5.0);
    }

    #[test]
    fn resolve_request_id_accepts_short_inbound_value() {
        assert_eq!(resolve_request_id(Some("abc-123")), "abc-123");
    }

    #[test]
    fn resolve_request_id_mints_uuid_when_missing_or_too_long() {
        let long = "x".repeat(200);
        assert_ne!(resolve_request_id(Some(&long)), long);
        assert!(resolve_request_id(None).len() > 0);
    }

    #[test]
    fn hash_stream_aborts_before_buffering_past_cap() {
        let chunks = vec![vec![0u8; 10], vec![0u8; 10], vec![0u8; 10]];
        let result = hash_stream_with_cap(chunks, 15);
        assert!(matches!(result, Err(DownloadError::FileTooLarge { max_bytes: 15 })));
    }

    #[test]
    fn hash_stream_succeeds_within_cap() {
        let chunks = vec![vec![1u8; 4], vec![2u8; 4]];
        let (digest, total) = hash_stream_with_cap(chunks, 100).unwrap();
        assert_eq!(total, 8);
        assert_eq!(digest.len(), 64);
    }
}
