//! Per-provider circuit breaker.
//!
//! Isolates a misbehaving provider so the rest of the run keeps moving.
//! Three states: CLOSED passes requests and counts consecutive trips; OPEN
//! rejects everything until the cooldown elapses; HALF_OPEN admits exactly
//! one probe whose outcome decides between CLOSED and another OPEN round.
//!
//! Only terminal retry-exhausted failures count as trips; the executor is
//! responsible for that filtering (see [`super::error::FetchError::is_breaker_trip`]).

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Breaker mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerMode {
    Closed,
    Open,
    HalfOpen,
}

/// How an admitted request should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal request in CLOSED state.
    Pass,
    /// The single HALF_OPEN probe.
    Probe,
}

#[derive(Debug)]
struct BreakerInner {
    mode: BreakerMode,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Breaker for a single provider.
#[derive(Debug)]
pub struct Breaker {
    provider_key: String,
    enabled: bool,
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl Breaker {
    fn new(provider_key: String, enabled: bool, threshold: u32, cooldown: Duration) -> Self {
        Self {
            provider_key,
            enabled,
            threshold: threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerInner {
                mode: BreakerMode::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Asks to start a request. `Err(())` means the circuit is open.
    pub fn try_admit(&self) -> Result<Admission, ()> {
        if !self.enabled {
            return Ok(Admission::Pass);
        }
        let mut inner = self.lock();
        match inner.mode {
            BreakerMode::Closed => Ok(Admission::Pass),
            BreakerMode::Open => {
                let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                if elapsed >= self.cooldown {
                    inner.mode = BreakerMode::HalfOpen;
                    inner.probe_in_flight = true;
                    info!(provider = %self.provider_key, "circuit half-open, admitting probe");
                    Ok(Admission::Probe)
                } else {
                    Err(())
                }
            }
            BreakerMode::HalfOpen => {
                if inner.probe_in_flight {
                    Err(())
                } else {
                    inner.probe_in_flight = true;
                    Ok(Admission::Probe)
                }
            }
        }
    }

    /// Reports a successful request.
    pub fn record_success(&self) {
        if !self.enabled {
            return;
        }
        let mut inner = self.lock();
        match inner.mode {
            BreakerMode::HalfOpen => {
                info!(provider = %self.provider_key, "probe succeeded, circuit closed");
                inner.mode = BreakerMode::Closed;
                inner.consecutive_failures = 0;
                inner.probe_in_flight = false;
                inner.opened_at = None;
            }
            BreakerMode::Closed => {
                inner.consecutive_failures = 0;
            }
            BreakerMode::Open => {}
        }
    }

    /// Reports a trip-class failure (retry-exhausted 429/5xx/reset).
    pub fn record_failure(&self) {
        if !self.enabled {
            return;
        }
        let mut inner = self.lock();
        match inner.mode {
            BreakerMode::HalfOpen => {
                warn!(provider = %self.provider_key, "probe failed, circuit re-opened");
                inner.mode = BreakerMode::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
            }
            BreakerMode::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.threshold {
                    warn!(
                        provider = %self.provider_key,
                        failures = inner.consecutive_failures,
                        cooldown_s = self.cooldown.as_secs(),
                        "failure threshold reached, circuit opened"
                    );
                    inner.mode = BreakerMode::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerMode::Open => {
                inner.opened_at = Some(Instant::now());
            }
        }
    }

    /// Current mode, for status output and tests.
    #[must_use]
    pub fn mode(&self) -> BreakerMode {
        if !self.enabled {
            return BreakerMode::Closed;
        }
        self.lock().mode
    }

    /// Consecutive failure count, for status output and tests.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Registry of breakers keyed by provider.
#[derive(Debug)]
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<Breaker>>,
    config: Config,
}

impl BreakerRegistry {
    /// Creates a registry drawing thresholds from `config`.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    /// Breaker for a provider, created on first use.
    #[must_use]
    pub fn breaker(&self, provider_key: &str) -> Arc<Breaker> {
        self.breakers
            .entry(provider_key.to_string())
            .or_insert_with(|| {
                let net = self.config.network(provider_key);
                debug!(
                    provider = provider_key,
                    enabled = net.circuit_breaker_enabled,
                    threshold = net.circuit_breaker_threshold,
                    "creating circuit breaker"
                );
                Arc::new(Breaker::new(
                    provider_key.to_string(),
                    net.circuit_breaker_enabled,
                    net.circuit_breaker_threshold,
                    Duration::from_secs(net.circuit_breaker_cooldown_s),
                ))
            })
            .clone()
    }

    /// True when every listed provider's breaker currently rejects.
    #[must_use]
    pub fn all_open(&self, provider_keys: &[String]) -> bool {
        !provider_keys.is_empty()
            && provider_keys.iter().all(|key| {
                self.breakers
                    .get(key)
                    .is_some_and(|b| b.try_admit().is_err())
            })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{NetworkConfig, ProviderSettings};

    fn breaker(threshold: u32, cooldown: Duration) -> Breaker {
        Breaker::new("x".to_string(), true, threshold, cooldown)
    }

    #[test]
    fn test_closed_admits_and_counts_failures() {
        let b = breaker(3, Duration::from_secs(1));
        assert_eq!(b.try_admit(), Ok(Admission::Pass));
        b.record_failure();
        b.record_failure();
        assert_eq!(b.mode(), BreakerMode::Closed);
        assert_eq!(b.consecutive_failures(), 2);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let b = breaker(3, Duration::from_secs(1));
        b.record_failure();
        b.record_failure();
        b.record_success();
        assert_eq!(b.consecutive_failures(), 0);
    }

    #[test]
    fn test_threshold_opens_circuit() {
        let b = breaker(2, Duration::from_secs(60));
        b.record_failure();
        b.record_failure();
        assert_eq!(b.mode(), BreakerMode::Open);
        assert!(b.try_admit().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_admits_single_probe() {
        let b = breaker(1, Duration::from_secs(1));
        b.record_failure();
        assert!(b.try_admit().is_err());

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert_eq!(b.try_admit(), Ok(Admission::Probe));
        // Second caller while probe in flight is rejected.
        assert!(b.try_admit().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_success_closes() {
        let b = breaker(1, Duration::from_secs(1));
        b.record_failure();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(b.try_admit(), Ok(Admission::Probe));
        b.record_success();
        assert_eq!(b.mode(), BreakerMode::Closed);
        assert_eq!(b.consecutive_failures(), 0);
        assert_eq!(b.try_admit(), Ok(Admission::Pass));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reopens() {
        let b = breaker(1, Duration::from_secs(1));
        b.record_failure();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(b.try_admit(), Ok(Admission::Probe));
        b.record_failure();
        assert_eq!(b.mode(), BreakerMode::Open);
        // Cooldown restarts from the probe failure.
        assert!(b.try_admit().is_err());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(b.try_admit(), Ok(Admission::Probe));
    }

    #[test]
    fn test_disabled_breaker_never_trips() {
        let b = Breaker::new("x".to_string(), false, 1, Duration::from_secs(60));
        b.record_failure();
        b.record_failure();
        assert_eq!(b.mode(), BreakerMode::Closed);
        assert_eq!(b.try_admit(), Ok(Admission::Pass));
    }

    #[test]
    fn test_registry_uses_provider_config() {
        let mut config = Config::default();
        config.provider_settings.insert(
            "x".to_string(),
            ProviderSettings {
                network: NetworkConfig {
                    circuit_breaker_threshold: 2,
                    circuit_breaker_cooldown_s: 1,
                    ..NetworkConfig::default()
                },
                ..ProviderSettings::default()
            },
        );
        let registry = BreakerRegistry::new(config);
        let b = registry.breaker("x");
        b.record_failure();
        b.record_failure();
        assert_eq!(b.mode(), BreakerMode::Open);
        // Same instance returned for the same key.
        assert_eq!(registry.breaker("x").mode(), BreakerMode::Open);
    }

    #[test]
    fn test_all_open() {
        let registry = BreakerRegistry::new(Config::default());
        let keys = vec!["a".to_string(), "b".to_string()];
        // Untracked providers are not "open".
        assert!(!registry.all_open(&keys));

        for key in &keys {
            let b = registry.breaker(key);
            for _ in 0..5 {
                b.record_failure();
            }
        }
        assert!(registry.all_open(&keys));
    }
}
