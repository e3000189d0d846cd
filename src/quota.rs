//! Persistent per-provider daily quota ledger.
//!
//! Some providers cap successful downloads per period (daily fast-download
//! allowances and the like). The ledger tracks consumption per provider,
//! advances the window when `reset_hours` have elapsed, and tells the
//! scheduler whether to defer or fall back on exhaustion.
//!
//! State survives restarts through the unified state file; see
//! [`crate::state`].

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::Config;

/// Persisted quota counters for one provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuotaState {
    /// Successful downloads allowed per window; 0 means unlimited.
    pub daily_limit: u32,
    pub used_today: u32,
    pub window_start_wall: DateTime<Utc>,
    pub reset_hours: u64,
    pub wait_on_exhaustion: bool,
}

impl QuotaState {
    fn window_end(&self) -> DateTime<Utc> {
        self.window_start_wall + ChronoDuration::hours(self.reset_hours as i64)
    }

    /// Advances the window if it has elapsed, resetting the counter
    /// atomically with the advance.
    fn roll_window(&mut self, now: DateTime<Utc>) {
        while now >= self.window_end() {
            self.window_start_wall = self.window_end();
            self.used_today = 0;
        }
    }

    fn is_exhausted(&self) -> bool {
        self.daily_limit > 0 && self.used_today >= self.daily_limit
    }
}

/// Outcome of a quota admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaDecision {
    /// The download may proceed.
    Allowed,
    /// The provider's window is spent.
    Exhausted {
        /// When the window resets and the download can be replayed.
        ready_at: DateTime<Utc>,
        /// Whether the provider policy prefers deferral over fallback.
        wait_for_reset: bool,
    },
}

/// Internally synchronized ledger of [`QuotaState`] per provider.
#[derive(Debug)]
pub struct QuotaLedger {
    states: Mutex<BTreeMap<String, QuotaState>>,
    config: Config,
}

impl QuotaLedger {
    /// Creates an empty ledger drawing per-provider policy from `config`.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            states: Mutex::new(BTreeMap::new()),
            config,
        }
    }

    /// Replaces in-memory state with a persisted snapshot, keeping
    /// configured limits authoritative over persisted ones.
    pub fn restore(&self, snapshot: BTreeMap<String, QuotaState>) {
        let mut states = self.lock();
        for (provider_key, mut state) in snapshot {
            let quota = self.config.quota(&provider_key);
            state.daily_limit = quota.daily_limit;
            state.reset_hours = quota.reset_hours;
            state.wait_on_exhaustion = quota.wait_for_reset;
            states.insert(provider_key, state);
        }
        if !states.is_empty() {
            info!(providers = states.len(), "restored quota ledger");
        }
    }

    /// Snapshot of all tracked providers for persistence.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, QuotaState> {
        self.lock().clone()
    }

    /// Checks whether a quota-gated download may proceed now.
    #[must_use]
    pub fn check(&self, provider_key: &str) -> QuotaDecision {
        self.check_at(provider_key, Utc::now())
    }

    /// Clock-injected form of [`QuotaLedger::check`].
    #[must_use]
    pub fn check_at(&self, provider_key: &str, now: DateTime<Utc>) -> QuotaDecision {
        let quota = self.config.quota(provider_key);
        if !quota.enabled || quota.daily_limit == 0 {
            return QuotaDecision::Allowed;
        }

        let mut states = self.lock();
        let state = states
            .entry(provider_key.to_string())
            .or_insert_with(|| QuotaState {
                daily_limit: quota.daily_limit,
                used_today: 0,
                window_start_wall: now,
                reset_hours: quota.reset_hours,
                wait_on_exhaustion: quota.wait_for_reset,
            });
        state.roll_window(now);

        if state.is_exhausted() {
            debug!(
                provider = provider_key,
                used = state.used_today,
                limit = state.daily_limit,
                "quota exhausted"
            );
            QuotaDecision::Exhausted {
                ready_at: state.window_end(),
                wait_for_reset: state.wait_on_exhaustion,
            }
        } else {
            QuotaDecision::Allowed
        }
    }

    /// Records one successful quota-gated download.
    pub fn record(&self, provider_key: &str) {
        self.record_at(provider_key, Utc::now());
    }

    /// Clock-injected form of [`QuotaLedger::record`].
    pub fn record_at(&self, provider_key: &str, now: DateTime<Utc>) {
        let quota = self.config.quota(provider_key);
        if !quota.enabled || quota.daily_limit == 0 {
            return;
        }
        let mut states = self.lock();
        let state = states
            .entry(provider_key.to_string())
            .or_insert_with(|| QuotaState {
                daily_limit: quota.daily_limit,
                used_today: 0,
                window_start_wall: now,
                reset_hours: quota.reset_hours,
                wait_on_exhaustion: quota.wait_for_reset,
            });
        state.roll_window(now);
        state.used_today += 1;
        if state.is_exhausted() {
            info!(
                provider = provider_key,
                used = state.used_today,
                limit = state.daily_limit,
                resets_at = %state.window_end(),
                "provider quota exhausted"
            );
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, QuotaState>> {
        match self.states.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{ProviderSettings, QuotaConfig};
    use chrono::TimeZone;

    fn config_with_quota(provider: &str, daily_limit: u32, wait: bool) -> Config {
        let mut config = Config::default();
        config.provider_settings.insert(
            provider.to_string(),
            ProviderSettings {
                quota: QuotaConfig {
                    enabled: true,
                    daily_limit,
                    reset_hours: 24,
                    wait_for_reset: wait,
                },
                ..ProviderSettings::default()
            },
        );
        config
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_disabled_quota_always_allows() {
        let ledger = QuotaLedger::new(Config::default());
        assert_eq!(ledger.check_at("annas", t0()), QuotaDecision::Allowed);
    }

    #[test]
    fn test_zero_limit_means_unlimited() {
        let ledger = QuotaLedger::new(config_with_quota("annas", 0, true));
        for _ in 0..100 {
            ledger.record_at("annas", t0());
        }
        assert_eq!(ledger.check_at("annas", t0()), QuotaDecision::Allowed);
    }

    #[test]
    fn test_exhaustion_after_limit() {
        let ledger = QuotaLedger::new(config_with_quota("annas", 2, true));
        assert_eq!(ledger.check_at("annas", t0()), QuotaDecision::Allowed);
        ledger.record_at("annas", t0());
        ledger.record_at("annas", t0());
        match ledger.check_at("annas", t0()) {
            QuotaDecision::Exhausted {
                ready_at,
                wait_for_reset,
            } => {
                assert_eq!(ready_at, t0() + ChronoDuration::hours(24));
                assert!(wait_for_reset);
            }
            QuotaDecision::Allowed => panic!("expected exhaustion"),
        }
    }

    #[test]
    fn test_window_advance_resets_counter() {
        let ledger = QuotaLedger::new(config_with_quota("annas", 1, true));
        ledger.record_at("annas", t0());
        assert!(matches!(
            ledger.check_at("annas", t0()),
            QuotaDecision::Exhausted { .. }
        ));
        let later = t0() + ChronoDuration::hours(25);
        assert_eq!(ledger.check_at("annas", later), QuotaDecision::Allowed);
        let snapshot = ledger.snapshot();
        let state = snapshot.get("annas").unwrap();
        assert_eq!(state.used_today, 0);
        assert_eq!(state.window_start_wall, t0() + ChronoDuration::hours(24));
    }

    #[test]
    fn test_window_advances_in_whole_steps() {
        let ledger = QuotaLedger::new(config_with_quota("annas", 1, true));
        ledger.record_at("annas", t0());
        // Three full windows later the start lands on a window boundary.
        let much_later = t0() + ChronoDuration::hours(75);
        assert_eq!(ledger.check_at("annas", much_later), QuotaDecision::Allowed);
        let state = ledger.snapshot().remove("annas").unwrap();
        assert_eq!(state.window_start_wall, t0() + ChronoDuration::hours(72));
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let config = config_with_quota("annas", 3, false);
        let ledger = QuotaLedger::new(config.clone());
        ledger.record_at("annas", t0());
        ledger.record_at("annas", t0());
        let snapshot = ledger.snapshot();

        let restored = QuotaLedger::new(config);
        restored.restore(snapshot.clone());
        assert_eq!(restored.snapshot(), snapshot);
        // Two of three used: still allowed.
        assert_eq!(restored.check_at("annas", t0()), QuotaDecision::Allowed);
        restored.record_at("annas", t0());
        assert!(matches!(
            restored.check_at("annas", t0()),
            QuotaDecision::Exhausted {
                wait_for_reset: false,
                ..
            }
        ));
    }

    #[test]
    fn test_restore_prefers_configured_limits() {
        let ledger = QuotaLedger::new(config_with_quota("annas", 10, true));
        let mut snapshot = BTreeMap::new();
        snapshot.insert(
            "annas".to_string(),
            QuotaState {
                daily_limit: 1, // stale persisted limit
                used_today: 5,
                window_start_wall: t0(),
                reset_hours: 12,
                wait_on_exhaustion: false,
            },
        );
        ledger.restore(snapshot);
        let state = ledger.snapshot().remove("annas").unwrap();
        assert_eq!(state.daily_limit, 10);
        assert_eq!(state.reset_hours, 24);
        assert!(state.wait_on_exhaustion);
        assert_eq!(state.used_today, 5);
    }
}
