use crate::config::BreakerConfig;
use crate::utils::error::ApiError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: State,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    /// (when, was_failure) samples inside the sampling window.
    samples: VecDeque<(Instant, bool)>,
}

/// Trips when the failure ratio over the sampling window exceeds the
/// threshold with at least `min_throughput` samples. Open state rejects
/// fast for `break_duration`, then admits a single half-open probe.
pub struct CircuitBreaker {
    name: String,
    failure_ratio: f64,
    min_throughput: usize,
    sampling_window: Duration,
    break_duration: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: &BreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            failure_ratio: config.failure_ratio,
            min_throughput: config.min_throughput.max(1),
            sampling_window: Duration::from_secs(config.sampling_s),
            break_duration: Duration::from_secs(config.break_s),
            inner: Mutex::new(BreakerInner {
                state: State::Closed,
                opened_at: None,
                probe_in_flight: false,
                samples: VecDeque::new(),
            }),
        }
    }

    /// Gate before the protected call. `Err(CircuitOpen)` rejects fast.
    pub fn check(&self) -> Result<(), ApiError> {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Closed => Ok(()),
            State::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.break_duration {
                    info!(breaker = %self.name, "Break elapsed, moving to half-open");
                    inner.state = State::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(ApiError::CircuitOpen(format!(
                        "{} open for another {:?}",
                        self.name,
                        self.break_duration - elapsed
                    )))
                }
            }
            State::HalfOpen => {
                if inner.probe_in_flight {
                    Err(ApiError::CircuitOpen(format!(
                        "{} half-open, probe in flight",
                        self.name
                    )))
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record the protected call's outcome. Errors that represent caller
    /// mistakes are not breaker failures.
    pub fn record(&self, outcome: Result<(), &ApiError>) {
        let failure = match outcome {
            Ok(()) => false,
            Err(err) => is_breaker_failure(err),
        };

        let mut inner = self.inner.lock();
        match inner.state {
            State::HalfOpen => {
                inner.probe_in_flight = false;
                if failure {
                    warn!(breaker = %self.name, "Half-open probe failed, reopening");
                    inner.state = State::Open;
                    inner.opened_at = Some(Instant::now());
                } else {
                    info!(breaker = %self.name, "Half-open probe succeeded, closing");
                    inner.state = State::Closed;
                    inner.samples.clear();
                }
            }
            State::Closed => {
                let now = Instant::now();
                inner.samples.push_back((now, failure));
                let window = self.sampling_window;
                while inner
                    .samples
                    .front()
                    .map(|(at, _)| now.duration_since(*at) > window)
                    .unwrap_or(false)
                {
                    inner.samples.pop_front();
                }

                let total = inner.samples.len();
                if total >= self.min_throughput {
                    let failures = inner.samples.iter().filter(|(_, f)| *f).count();
                    let ratio = failures as f64 / total as f64;
                    if ratio > self.failure_ratio {
                        warn!(
                            breaker = %self.name,
                            failures,
                            total,
                            "Failure ratio exceeded, opening circuit"
                        );
                        inner.state = State::Open;
                        inner.opened_at = Some(Instant::now());
                        inner.samples.clear();
                    }
                }
            }
            State::Open => {}
        }
    }
}

/// Caller mistakes and throttling must not poison the breaker; it watches
/// the health of the downstream dependency only.
fn is_breaker_failure(err: &ApiError) -> bool {
    !matches!(
        err,
        ApiError::InvalidArgument(_)
            | ApiError::NotFound(_)
            | ApiError::Conflict(_)
            | ApiError::DuplicateDocType(_)
            | ApiError::InvalidDocType(_)
            | ApiError::ValidationFailed(_)
            | ApiError::RateLimited { .. }
            | ApiError::Cancelled(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(min_throughput: usize, break_s: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            &BreakerConfig {
                failure_ratio: 0.5,
                min_throughput,
                sampling_s: 60,
                break_s,
            },
        )
    }

    fn fail(b: &CircuitBreaker) {
        b.record(Err(&ApiError::ProviderUnavailable("down".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn trips_after_min_throughput_failures() {
        let b = breaker(4, 10);

        for _ in 0..3 {
            assert!(b.check().is_ok());
            fail(&b);
        }
        // Below min throughput, still closed.
        assert!(b.check().is_ok());
        fail(&b);

        // Fourth failure pushes ratio over threshold with enough samples.
        assert!(matches!(b.check(), Err(ApiError::CircuitOpen(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_probe_closes_on_success() {
        let b = breaker(2, 5);
        for _ in 0..2 {
            let _ = b.check();
            fail(&b);
        }
        assert!(b.check().is_err());

        tokio::time::advance(Duration::from_secs(6)).await;

        // First caller becomes the probe; concurrent callers still rejected.
        assert!(b.check().is_ok());
        assert!(b.check().is_err());

        b.record(Ok(()));
        assert!(b.check().is_ok(), "success closes the circuit");
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_probe_failure_reopens() {
        let b = breaker(2, 5);
        for _ in 0..2 {
            let _ = b.check();
            fail(&b);
        }
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(b.check().is_ok());
        fail(&b);

        assert!(matches!(b.check(), Err(ApiError::CircuitOpen(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn caller_errors_do_not_trip_the_breaker() {
        let b = breaker(2, 5);
        for _ in 0..10 {
            assert!(b.check().is_ok());
            b.record(Err(&ApiError::InvalidArgument("bad".into())));
        }
        assert!(b.check().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn successes_keep_ratio_below_threshold() {
        let b = breaker(4, 5);
        for i in 0..12 {
            assert!(b.check().is_ok());
            if i % 3 == 0 {
                fail(&b);
            } else {
                b.record(Ok(()));
            }
        }
        assert!(b.check().is_ok());
    }
}
