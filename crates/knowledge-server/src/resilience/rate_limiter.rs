use crate::config::{RateLimitsConfig, ToolLimitConfig};
use crate::utils::error::ApiError;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const STALE_AFTER: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitVerdict {
    Allowed { remaining: u32 },
    Rejected { retry_after: Duration, reason: String },
}

impl RateLimitVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitVerdict::Allowed { .. })
    }

    pub fn into_error(self, tool: &str) -> Option<ApiError> {
        match self {
            RateLimitVerdict::Allowed { .. } => None,
            RateLimitVerdict::Rejected {
                retry_after,
                reason,
            } => Some(ApiError::RateLimited {
                retry_after_secs: retry_after.as_secs().max(1),
                reason: format!("{tool}: {reason}"),
            }),
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    /// Tokens per second.
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(limit: u32, burst: u32, period: Duration) -> Self {
        let capacity = (limit + burst) as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_rate: limit as f64 / period.as_secs_f64(),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self) -> Result<u32, Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(self.tokens as u32)
        } else {
            let missing = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(missing / self.refill_rate))
        }
    }

    fn refund(&mut self) {
        self.tokens = (self.tokens + 1.0).min(self.capacity);
    }
}

struct ToolBuckets {
    minute: TokenBucket,
    hour: TokenBucket,
    last_access: Instant,
}

/// Token buckets per (tool, optional client id) with independent
/// per-minute and per-hour capacities. Non-blocking `try_acquire`,
/// polling `wait_and_acquire`, and a sweep for stale buckets.
pub struct RateLimiterRegistry {
    config: RateLimitsConfig,
    buckets: DashMap<String, Mutex<ToolBuckets>>,
}

impl RateLimiterRegistry {
    pub fn new(config: RateLimitsConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    fn limit_for(&self, tool: &str) -> Option<ToolLimitConfig> {
        self.config
            .per_tool
            .get(tool)
            .or_else(|| self.config.per_tool.get("default"))
            .copied()
    }

    fn bucket_key(tool: &str, client: Option<&str>) -> String {
        match client {
            Some(client) => format!("{tool}:{client}"),
            None => tool.to_string(),
        }
    }

    pub fn try_acquire(&self, tool: &str, client: Option<&str>) -> RateLimitVerdict {
        let Some(limit) = self.limit_for(tool) else {
            // Tools without configured limits are not throttled.
            return RateLimitVerdict::Allowed { remaining: u32::MAX };
        };

        let key = Self::bucket_key(tool, client);
        let entry = self.buckets.entry(key).or_insert_with(|| {
            Mutex::new(ToolBuckets {
                minute: TokenBucket::new(limit.rpm, limit.burst, Duration::from_secs(60)),
                hour: TokenBucket::new(limit.rph, limit.burst, Duration::from_secs(3600)),
                last_access: Instant::now(),
            })
        });

        let mut buckets = entry.lock();
        buckets.last_access = Instant::now();

        let remaining = match buckets.minute.try_take() {
            Ok(remaining) => remaining,
            Err(retry_after) => {
                return RateLimitVerdict::Rejected {
                    retry_after,
                    reason: "per-minute limit exceeded".to_string(),
                };
            }
        };

        match buckets.hour.try_take() {
            Ok(hour_remaining) => RateLimitVerdict::Allowed {
                remaining: remaining.min(hour_remaining),
            },
            Err(retry_after) => {
                // The minute token must not be lost to an hour-level reject.
                buckets.minute.refund();
                RateLimitVerdict::Rejected {
                    retry_after,
                    reason: "per-hour limit exceeded".to_string(),
                }
            }
        }
    }

    /// Poll until a token is available or `max_wait` elapses.
    pub async fn wait_and_acquire(
        &self,
        tool: &str,
        client: Option<&str>,
        max_wait: Duration,
    ) -> Result<(), ApiError> {
        let deadline = Instant::now() + max_wait;
        loop {
            match self.try_acquire(tool, client) {
                RateLimitVerdict::Allowed { .. } => return Ok(()),
                RateLimitVerdict::Rejected {
                    retry_after,
                    reason,
                } => {
                    let now = Instant::now();
                    if now + retry_after > deadline {
                        warn!(tool, %reason, "Rate limit wait budget exhausted");
                        return Err(ApiError::RateLimited {
                            retry_after_secs: retry_after.as_secs().max(1),
                            reason,
                        });
                    }
                    tokio::time::sleep(retry_after.min(Duration::from_millis(250))).await;
                }
            }
        }
    }

    /// Drop buckets that have not been touched for ten minutes.
    pub fn sweep_stale(&self) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| bucket.lock().last_access.elapsed() < STALE_AFTER);
        let removed = before - self.buckets.len();
        if removed > 0 {
            debug!(removed, "Swept stale rate-limit buckets");
        }
        removed
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn registry(rpm: u32, rph: u32, burst: u32) -> RateLimiterRegistry {
        RateLimiterRegistry::new(RateLimitsConfig {
            per_tool: HashMap::from([(
                "rag_query".to_string(),
                ToolLimitConfig { rpm, rph, burst },
            )]),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn per_minute_limit_rejects_with_retry_after() {
        let limiter = registry(2, 100, 0);

        assert!(limiter.try_acquire("rag_query", None).is_allowed());
        assert!(limiter.try_acquire("rag_query", None).is_allowed());

        match limiter.try_acquire("rag_query", None) {
            RateLimitVerdict::Rejected {
                retry_after,
                reason,
            } => {
                assert!(retry_after > Duration::ZERO);
                assert!(reason.contains("per-minute"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hour_reject_refunds_the_minute_token() {
        let limiter = registry(10, 1, 0);

        assert!(limiter.try_acquire("rag_query", None).is_allowed());

        // Hour bucket is empty now; the rejection must refund the minute
        // token, leaving the full minute budget for when the hour resets.
        for _ in 0..5 {
            match limiter.try_acquire("rag_query", None) {
                RateLimitVerdict::Rejected { reason, .. } => {
                    assert!(reason.contains("per-hour"));
                }
                other => panic!("expected hour rejection, got {other:?}"),
            }
        }

        // After the hour refills one token, the minute bucket still has
        // capacity because every reject was refunded.
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(limiter.try_acquire("rag_query", None).is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_and_acquire_succeeds_after_window_reset() {
        let limiter = registry(2, 100, 0);
        assert!(limiter.try_acquire("rag_query", None).is_allowed());
        assert!(limiter.try_acquire("rag_query", None).is_allowed());
        assert!(!limiter.try_acquire("rag_query", None).is_allowed());

        // Paused clock auto-advances through the sleeps.
        limiter
            .wait_and_acquire("rag_query", None, Duration::from_secs(31))
            .await
            .expect("token after window reset");
    }

    #[tokio::test(start_paused = true)]
    async fn wait_and_acquire_gives_up_past_max_wait() {
        let limiter = registry(1, 1, 0);
        assert!(limiter.try_acquire("rag_query", None).is_allowed());

        let err = limiter
            .wait_and_acquire("rag_query", None, Duration::from_millis(100))
            .await
            .expect_err("budget too small");
        assert!(matches!(err, ApiError::RateLimited { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn clients_get_independent_buckets() {
        let limiter = registry(1, 100, 0);
        assert!(limiter.try_acquire("rag_query", Some("alpha")).is_allowed());
        assert!(limiter.try_acquire("rag_query", Some("beta")).is_allowed());
        assert!(!limiter.try_acquire("rag_query", Some("alpha")).is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn unconfigured_tools_are_not_throttled() {
        let limiter = RateLimiterRegistry::new(RateLimitsConfig {
            per_tool: HashMap::new(),
        });
        for _ in 0..100 {
            assert!(limiter.try_acquire("anything", None).is_allowed());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stale_buckets_are_swept() {
        let limiter = registry(5, 50, 0);
        assert!(limiter.try_acquire("rag_query", Some("alpha")).is_allowed());
        assert_eq!(limiter.bucket_count(), 1);

        tokio::time::advance(Duration::from_secs(601)).await;
        assert_eq!(limiter.sweep_stale(), 1);
        assert_eq!(limiter.bucket_count(), 0);
    }
}
