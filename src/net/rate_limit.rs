//! Per-provider request pacing.
//!
//! Enforces a minimum interval plus random jitter between consecutive
//! requests to the same provider. Different providers never wait on each
//! other; waiters on the same provider are served FIFO because the gate's
//! fair async mutex is held across the sleep.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::Config;

/// State for one provider's pacing gate.
#[derive(Debug)]
struct Gate {
    delay: Duration,
    jitter: Duration,
    /// Time of the last admitted request. `None` until the first request,
    /// which is admitted immediately.
    last_request: Mutex<Option<Instant>>,
}

impl Gate {
    fn new(delay: Duration, jitter: Duration) -> Self {
        Self {
            delay,
            jitter,
            last_request: Mutex::new(None),
        }
    }

    async fn acquire(&self) {
        if self.delay.is_zero() && self.jitter.is_zero() {
            return;
        }

        // Holding the fair mutex through the sleep serializes waiters in
        // arrival order.
        let mut last = self.last_request.lock().await;
        if let Some(last_at) = *last {
            let jitter = if self.jitter.is_zero() {
                Duration::ZERO
            } else {
                let max_ms = self.jitter.as_millis() as u64;
                Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
            };
            let ready_at = last_at + self.delay + jitter;
            let now = Instant::now();
            if ready_at > now {
                trace!(wait_ms = (ready_at - now).as_millis() as u64, "pacing request");
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Registry of pacing gates keyed by provider.
#[derive(Debug)]
pub struct RateLimiter {
    gates: DashMap<String, Arc<Gate>>,
    config: Config,
}

impl RateLimiter {
    /// Creates a limiter drawing per-provider delay/jitter from `config`.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            gates: DashMap::new(),
            config,
        }
    }

    /// Waits until a request to `provider_key` is allowed to start.
    ///
    /// The first request to a provider proceeds immediately.
    pub async fn acquire(&self, provider_key: &str) {
        let gate = self
            .gates
            .entry(provider_key.to_string())
            .or_insert_with(|| {
                let net = self.config.network(provider_key);
                debug!(
                    provider = provider_key,
                    delay_ms = net.delay_ms,
                    jitter_ms = net.jitter_ms,
                    "creating pacing gate"
                );
                Arc::new(Gate::new(net.delay(), net.jitter()))
            })
            .clone();
        gate.acquire().await;
    }
}
