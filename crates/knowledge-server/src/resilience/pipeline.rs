use super::circuit_breaker::CircuitBreaker;
use super::retry::RetryPolicy;
use crate::config::ResilienceConfig;
use crate::utils::error::ApiError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Composed policy wrapping an outbound call, outer to inner:
/// timeout -> retry -> circuit breaker. Shutdown cancellation bypasses
/// retry entirely.
pub struct ResiliencePipeline {
    name: &'static str,
    timeout: Duration,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    shutdown: watch::Receiver<bool>,
}

impl ResiliencePipeline {
    pub fn new(
        name: &'static str,
        timeout: Duration,
        retry: RetryPolicy,
        breaker: CircuitBreaker,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            name,
            timeout,
            retry,
            breaker,
            shutdown,
        }
    }

    pub async fn execute<T, F, Fut>(&self, op: &str, f: F) -> Result<T, ApiError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return Err(ApiError::Cancelled(format!("{op}: shutting down")));
        }

        let guarded = self.retry.execute(op, || async {
            self.breaker.check()?;
            let outcome = f().await;
            self.breaker.record(outcome.as_ref().map(|_| ()));
            outcome
        });

        // Completes only on an actual shutdown signal; a dropped sender
        // must not cancel in-flight work.
        let wait_shutdown = async {
            loop {
                if *shutdown.borrow() {
                    return;
                }
                if shutdown.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = wait_shutdown => {
                debug!(pipeline = self.name, op, "Cancelled by shutdown");
                Err(ApiError::Cancelled(format!("{op}: shutting down")))
            }
            result = tokio::time::timeout(self.timeout, guarded) => match result {
                Ok(inner) => inner,
                Err(_) => Err(ApiError::Timeout(format!(
                    "{op} exceeded {}s budget in {} pipeline",
                    self.timeout.as_secs(),
                    self.name
                ))),
            },
        }
    }
}

/// The three named pipelines every outbound dependency goes through.
#[derive(Clone)]
pub struct Pipelines {
    pub embedding: Arc<ResiliencePipeline>,
    pub storage: Arc<ResiliencePipeline>,
    pub default: Arc<ResiliencePipeline>,
}

impl Pipelines {
    pub fn new(config: &ResilienceConfig, shutdown: watch::Receiver<bool>) -> Self {
        let retry = RetryPolicy::new(&config.retry);
        let make = |name: &'static str, timeout_s: u64| {
            Arc::new(ResiliencePipeline::new(
                name,
                Duration::from_secs(timeout_s),
                retry.clone(),
                CircuitBreaker::new(name, &config.breaker),
                shutdown.clone(),
            ))
        };

        Self {
            embedding: make("embedding", config.timeout.embedding_s),
            storage: make("storage", config.timeout.storage_s),
            default: make("default", config.timeout.default_s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, RetryConfig, TimeoutConfig};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_config() -> ResilienceConfig {
        ResilienceConfig {
            retry: RetryConfig {
                attempts: 3,
                initial_delay_ms: 1,
                max_delay_ms: 2,
                jitter: false,
            },
            breaker: BreakerConfig {
                failure_ratio: 0.5,
                min_throughput: 100,
                sampling_s: 60,
                break_s: 5,
            },
            timeout: TimeoutConfig {
                default_s: 1,
                embedding_s: 1,
                storage_s: 1,
            },
        }
    }

    #[tokio::test]
    async fn success_passes_through() {
        let (_tx, rx) = watch::channel(false);
        let pipelines = Pipelines::new(&test_config(), rx);
        let result = pipelines
            .default
            .execute("op", || async { Ok::<_, ApiError>(7) })
            .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn retries_inside_the_timeout_budget() {
        let (_tx, rx) = watch::channel(false);
        let pipelines = Pipelines::new(&test_config(), rx);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result = pipelines
            .embedding
            .execute("embed", move || {
                let calls = calls_clone.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(ApiError::ProviderUnavailable("connection refused".into()))
                    } else {
                        Ok(1u8)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_bounds_the_whole_operation() {
        let (_tx, rx) = watch::channel(false);
        let pipelines = Pipelines::new(&test_config(), rx);

        let result: Result<(), ApiError> = pipelines
            .default
            .execute("slow", || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(ApiError::Timeout(_))));
    }

    #[tokio::test]
    async fn shutdown_cancels_and_bypasses_retry() {
        let (tx, rx) = watch::channel(false);
        let pipelines = Pipelines::new(&test_config(), rx);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let task = tokio::spawn(async move {
            pipelines
                .default
                .execute("hang", move || {
                    let calls = calls_clone.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        Err::<(), _>(ApiError::ProviderUnavailable("down".into()))
                    }
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).expect("send shutdown");

        let result = task.await.expect("join");
        assert!(matches!(result, Err(ApiError::Cancelled(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1, "no retry after cancel");
    }

    #[tokio::test]
    async fn already_shut_down_rejects_immediately() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let pipelines = Pipelines::new(&test_config(), rx);

        let result: Result<(), ApiError> = pipelines
            .storage
            .execute("op", || async { Ok(()) })
            .await;
        assert!(matches!(result, Err(ApiError::Cancelled(_))));
    }
}
