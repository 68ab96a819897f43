use crate::error::GuardError;
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitState {
    pub phase: BreakerPhase,
    pub failure_count: u32,
    pub is_open: bool,
    pub opened_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    phase: BreakerPhase,
    failure_count: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(BreakerInner {
                phase: BreakerPhase::Closed,
                failure_count: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask permission to call through. Once the cooldown has elapsed a single
    /// trial call is admitted; everything else fails fast while open.
    pub fn try_acquire(&self, operation: &str) -> Result<(), GuardError> {
        let mut inner = self.lock()?;
        match inner.phase {
            BreakerPhase::Closed => Ok(()),
            BreakerPhase::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.settings.cooldown {
                    log::info!("Circuit '{}' half-open, admitting trial call", self.name);
                    inner.phase = BreakerPhase::HalfOpen;
                    inner.trial_in_flight = true;
                    Ok(())
                } else {
                    Err(GuardError::CircuitOpen {
                        operation: operation.to_string(),
                        retry_after: self.settings.cooldown - elapsed,
                    })
                }
            }
            BreakerPhase::HalfOpen => {
                if inner.trial_in_flight {
                    Err(GuardError::CircuitOpen {
                        operation: operation.to_string(),
                        retry_after: Duration::ZERO,
                    })
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let Ok(mut inner) = self.lock() else {
            return;
        };
        if inner.phase != BreakerPhase::Closed {
            log::info!("Circuit '{}' closed", self.name);
        }
        inner.phase = BreakerPhase::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    pub fn record_failure(&self) {
        let Ok(mut inner) = self.lock() else {
            return;
        };
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.trial_in_flight = false;
        match inner.phase {
            BreakerPhase::HalfOpen => {
                log::warn!("Circuit '{}' trial call failed, reopening", self.name);
                inner.phase = BreakerPhase::Open;
                inner.opened_at = Some(Instant::now());
            }
            BreakerPhase::Closed if inner.failure_count >= self.settings.failure_threshold => {
                log::warn!(
                    "Circuit '{}' opened after {} consecutive failures",
                    self.name,
                    inner.failure_count
                );
                inner.phase = BreakerPhase::Open;
                inner.opened_at = Some(Instant::now());
            }
            _ => {}
        }
    }

    pub fn reset(&self) {
        if let Ok(mut inner) = self.lock() {
            inner.phase = BreakerPhase::Closed;
            inner.failure_count = 0;
            inner.opened_at = None;
            inner.trial_in_flight = false;
        }
    }

    pub fn state(&self) -> CircuitState {
        match self.lock() {
            Ok(inner) => CircuitState {
                phase: inner.phase,
                failure_count: inner.failure_count,
                is_open: inner.phase != BreakerPhase::Closed,
                opened_at: inner.opened_at,
            },
            Err(_) => CircuitState {
                phase: BreakerPhase::Open,
                failure_count: 0,
                is_open: true,
                opened_at: None,
            },
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BreakerInner>, GuardError> {
        self.inner.lock().map_err(|_| GuardError::CircuitOpen {
            operation: self.name.clone(),
            retry_after: self.settings.cooldown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "host",
            BreakerSettings {
                failure_threshold: 3,
                cooldown: Duration::from_secs(10),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let breaker = breaker();
        for _ in 0..2 {
            breaker.try_acquire("op").unwrap();
            breaker.record_failure();
        }
        assert!(!breaker.state().is_open);

        breaker.try_acquire("op").unwrap();
        breaker.record_failure();
        let state = breaker.state();
        assert!(state.is_open);
        assert_eq!(state.failure_count, 3);
        assert!(state.opened_at.is_some());

        match breaker.try_acquire("op") {
            Err(GuardError::CircuitOpen { retry_after, .. }) => {
                assert_eq!(retry_after, Duration::from_secs(10))
            }
            other => panic!("expected open circuit, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_one_trial() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(10)).await;

        assert!(breaker.try_acquire("op").is_ok());
        assert_eq!(breaker.state().phase, BreakerPhase::HalfOpen);
        assert!(breaker.try_acquire("op").is_err());

        breaker.record_success();
        let state = breaker.state();
        assert_eq!(state.phase, BreakerPhase::Closed);
        assert_eq!(state.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        breaker.try_acquire("op").unwrap();
        breaker.record_failure();

        assert_eq!(breaker.state().phase, BreakerPhase::Open);
        assert!(breaker.try_acquire("op").is_err());
    }

    #[test]
    fn test_success_resets_count_and_manual_reset() {
        let breaker = breaker();
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert!(!breaker.state().is_open);

        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.state().is_open);
        breaker.reset();
        assert!(!breaker.state().is_open);
        assert!(breaker.try_acquire("op").is_ok());
    }
}
