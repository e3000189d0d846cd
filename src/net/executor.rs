//! Bounded-attempt HTTP executor.
//!
//! Every outbound request — search API calls, manifest fetches, artifact
//! downloads — goes through here so one place applies the full network
//! policy chain: circuit breaker admission, per-provider pacing,
//! timeouts, Retry-After-aware backoff, TLS policy, and (for downloads)
//! streaming budget enforcement.
//!
//! Retriable failures are recovered locally; what escapes this module is
//! terminal for the attempt and already classified for the caller.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use futures_util::StreamExt;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

use super::breaker::BreakerRegistry;
use super::error::FetchError;
use super::rate_limit::RateLimiter;
use crate::budget::{BudgetAccountant, ContentClass};
use crate::config::{Config, NetworkConfig, SslErrorPolicy};

/// Jitter ceiling added to computed backoff delays.
const BACKOFF_JITTER: Duration = Duration::from_millis(500);

/// Suffix for in-flight download files; renamed away on completion.
pub const PARTIAL_SUFFIX: &str = "part";

/// Response body plus the content type it arrived with.
#[derive(Debug, Clone)]
pub struct Payload {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

impl Payload {
    /// Parses the body as JSON.
    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Interprets the body as UTF-8 text, lossily.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Parses a `Retry-After` value: integer seconds or an HTTP-date compared
/// against the current UTC wall clock. Returns `None` when unparseable.
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<i64>() {
        if seconds < 0 {
            return None;
        }
        #[allow(clippy::cast_sign_loss)]
        return Some(Duration::from_secs(seconds as u64));
    }
    let date = httpdate::parse_http_date(value).ok()?;
    match date.duration_since(std::time::SystemTime::now()) {
        Ok(duration) => Some(duration),
        // A date in the past means "now".
        Err(_) => Some(Duration::ZERO),
    }
}

fn backoff_delay(net: &NetworkConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let base = net.base_backoff_s.max(0.0);
    let raw = base * net.backoff_multiplier.max(1.0).powi(exponent as i32);
    let capped = raw.min(net.max_backoff_s.max(0.0));
    let jitter_ms = rand::thread_rng().gen_range(0..=BACKOFF_JITTER.as_millis() as u64);
    Duration::from_secs_f64(capped) + Duration::from_millis(jitter_ms)
}

fn is_tls_error(error: &reqwest::Error) -> bool {
    let text = error.to_string().to_lowercase();
    text.contains("certificate") || text.contains("tls") || text.contains("ssl")
}

fn header_map(net: &NetworkConfig, extra: Option<&[(&str, &str)]>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in &net.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            map.insert(name, value);
        }
    }
    if let Some(extra) = extra {
        for (name, value) in extra {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                map.insert(name, value);
            }
        }
    }
    map
}

/// One-attempt outcome inside the retry loop.
enum Attempt<T> {
    Done(T),
    RateLimited { retry_after: Option<String> },
    Transient { detail: String },
    Terminal(FetchError),
}

/// Executor applying limiter → breaker → retry policy → budget counting.
#[derive(Debug)]
pub struct HttpExecutor {
    client: reqwest::Client,
    insecure_client: OnceLock<reqwest::Client>,
    limiter: RateLimiter,
    breakers: BreakerRegistry,
    budget: std::sync::Arc<BudgetAccountant>,
    config: Config,
}

impl HttpExecutor {
    /// Builds the executor and its underlying HTTP client.
    pub fn new(
        config: Config,
        budget: std::sync::Arc<BudgetAccountant>,
    ) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(config.general.user_agent.clone())
            .build()
            .map_err(|e| FetchError::ClientInit(e.to_string()))?;
        Ok(Self {
            client,
            insecure_client: OnceLock::new(),
            limiter: RateLimiter::new(config.clone()),
            breakers: BreakerRegistry::new(config.clone()),
            budget,
            config,
        })
    }

    /// The breaker registry, shared with the scheduler for saturation
    /// detection.
    #[must_use]
    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// The budget accountant behind this executor.
    #[must_use]
    pub fn budget(&self) -> &BudgetAccountant {
        &self.budget
    }

    fn insecure(&self) -> Result<&reqwest::Client, FetchError> {
        if let Some(client) = self.insecure_client.get() {
            return Ok(client);
        }
        let built = reqwest::Client::builder()
            .user_agent(self.config.general.user_agent.clone())
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| FetchError::ClientInit(e.to_string()))?;
        let _ = self.insecure_client.set(built);
        self.insecure_client
            .get()
            .ok_or_else(|| FetchError::ClientInit("insecure client unavailable".to_string()))
    }

    /// GET returning the whole body, with the full policy chain applied.
    #[instrument(skip(self, extra_headers), fields(provider = provider_key))]
    pub async fn get(
        &self,
        provider_key: &str,
        url: &str,
        extra_headers: Option<&[(&str, &str)]>,
    ) -> Result<Payload, FetchError> {
        let net = self.config.network(provider_key);
        let breaker = self.breakers.breaker(provider_key);
        let headers = header_map(&net, extra_headers);
        let max_attempts = net.max_attempts.max(1);
        let mut insecure_used = false;
        let mut use_insecure = false;
        let mut attempt: u32 = 0;
        let mut last_error: Option<FetchError> = None;

        loop {
            attempt += 1;
            if attempt > max_attempts {
                break;
            }
            if breaker.try_admit().is_err() {
                return Err(FetchError::CircuitOpen {
                    provider: provider_key.to_string(),
                });
            }
            self.limiter.acquire(provider_key).await;

            let client = if use_insecure {
                self.insecure()?
            } else {
                &self.client
            };
            let outcome = self
                .one_get_attempt(client, url, &headers, net.timeout())
                .await;

            match outcome {
                Attempt::Done(payload) => {
                    breaker.record_success();
                    return Ok(payload);
                }
                Attempt::RateLimited { retry_after } => {
                    last_error = Some(FetchError::RateLimited {
                        url: url.to_string(),
                    });
                    if attempt >= max_attempts {
                        break;
                    }
                    let delay = retry_after
                        .as_deref()
                        .and_then(parse_retry_after)
                        .unwrap_or_else(|| backoff_delay(&net, attempt))
                        .min(Duration::from_secs_f64(net.max_backoff_s.max(0.0)));
                    warn!(
                        url,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "429 Too Many Requests, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Attempt::Transient { detail } => {
                    last_error = Some(FetchError::Transient {
                        url: url.to_string(),
                        detail: detail.clone(),
                    });
                    if attempt >= max_attempts {
                        break;
                    }
                    let delay = backoff_delay(&net, attempt);
                    warn!(
                        url,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        detail,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Attempt::Terminal(FetchError::TlsVerification { url: tls_url }) => {
                    if net.ssl_error_policy == SslErrorPolicy::RetryInsecureOnce && !insecure_used {
                        warn!(url, "TLS verification failed, retrying once without verification");
                        insecure_used = true;
                        use_insecure = true;
                        last_error = Some(FetchError::TlsVerification { url: tls_url });
                        continue;
                    }
                    return Err(FetchError::TlsVerification { url: tls_url });
                }
                Attempt::Terminal(error) => return Err(error),
            }
        }

        let last = last_error.unwrap_or_else(|| FetchError::Transient {
            url: url.to_string(),
            detail: "no attempt recorded".to_string(),
        });
        let exhausted = FetchError::Exhausted {
            url: url.to_string(),
            attempts: max_attempts,
            last: Box::new(last),
        };
        if exhausted.is_breaker_trip() {
            breaker.record_failure();
        }
        Err(exhausted)
    }

    async fn one_get_attempt(
        &self,
        client: &reqwest::Client,
        url: &str,
        headers: &HeaderMap,
        timeout: Duration,
    ) -> Attempt<Payload> {
        let response = match client
            .get(url)
            .headers(headers.clone())
            .timeout(timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => return classify_request_error(url, &error),
        };

        match classify_status(url, &response) {
            Some(attempt) => attempt,
            None => {
                let content_type = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                match response.bytes().await {
                    Ok(body) => Attempt::Done(Payload {
                        body: body.to_vec(),
                        content_type,
                    }),
                    Err(error) => Attempt::Transient {
                        detail: format!("body read failed: {error}"),
                    },
                }
            }
        }
    }

    /// GET parsed as JSON.
    pub async fn get_json(
        &self,
        provider_key: &str,
        url: &str,
    ) -> Result<serde_json::Value, FetchError> {
        let payload = self.get(provider_key, url, None).await?;
        payload.json().map_err(|e| FetchError::BadPayload {
            url: url.to_string(),
            detail: format!("invalid JSON: {e}"),
        })
    }

    /// GET interpreted as text.
    pub async fn get_text(&self, provider_key: &str, url: &str) -> Result<String, FetchError> {
        Ok(self.get(provider_key, url, None).await?.text())
    }

    /// Streams a download to `dest`, enforcing the budget chunk by chunk.
    ///
    /// The body streams into `<dest>.part`, which is renamed over `dest`
    /// only on success; any failure or budget violation deletes the
    /// partial file and rolls its bytes back out of the counters. Returns
    /// the byte count written.
    #[instrument(skip(self), fields(provider = provider_key, dest = %dest.display()))]
    pub async fn download_to_file(
        &self,
        provider_key: &str,
        url: &str,
        dest: &Path,
        class: ContentClass,
        work_id: Option<&str>,
    ) -> Result<u64, FetchError> {
        let net = self.config.network(provider_key);
        let breaker = self.breakers.breaker(provider_key);
        let headers = header_map(&net, None);
        let max_attempts = net.max_attempts.max(1);
        let mut insecure_used = false;
        let mut use_insecure = false;
        let mut attempt: u32 = 0;
        let mut last_error: Option<FetchError> = None;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FetchError::io(parent, e))?;
        }
        let part_path = partial_path(dest);

        loop {
            attempt += 1;
            if attempt > max_attempts {
                break;
            }
            if breaker.try_admit().is_err() {
                return Err(FetchError::CircuitOpen {
                    provider: provider_key.to_string(),
                });
            }
            self.limiter.acquire(provider_key).await;

            let client = if use_insecure {
                self.insecure()?
            } else {
                &self.client
            };
            let outcome = self
                .one_download_attempt(client, url, &headers, net.timeout(), &part_path, class, work_id)
                .await;

            match outcome {
                Attempt::Done(bytes) => {
                    tokio::fs::rename(&part_path, dest)
                        .await
                        .map_err(|e| FetchError::io(dest, e))?;
                    self.budget.commit_file(class, work_id);
                    breaker.record_success();
                    debug!(bytes, "download complete");
                    return Ok(bytes);
                }
                Attempt::RateLimited { retry_after } => {
                    last_error = Some(FetchError::RateLimited {
                        url: url.to_string(),
                    });
                    if attempt >= max_attempts {
                        break;
                    }
                    let delay = retry_after
                        .as_deref()
                        .and_then(parse_retry_after)
                        .unwrap_or_else(|| backoff_delay(&net, attempt))
                        .min(Duration::from_secs_f64(net.max_backoff_s.max(0.0)));
                    warn!(url, attempt, delay_ms = delay.as_millis() as u64, "429 on download");
                    tokio::time::sleep(delay).await;
                }
                Attempt::Transient { detail } => {
                    last_error = Some(FetchError::Transient {
                        url: url.to_string(),
                        detail: detail.clone(),
                    });
                    if attempt >= max_attempts {
                        break;
                    }
                    let delay = backoff_delay(&net, attempt);
                    warn!(url, attempt, detail, "transient download failure, backing off");
                    tokio::time::sleep(delay).await;
                }
                Attempt::Terminal(FetchError::TlsVerification { url: tls_url }) => {
                    if net.ssl_error_policy == SslErrorPolicy::RetryInsecureOnce && !insecure_used {
                        warn!(url, "TLS verification failed, retrying once without verification");
                        insecure_used = true;
                        use_insecure = true;
                        last_error = Some(FetchError::TlsVerification { url: tls_url });
                        continue;
                    }
                    return Err(FetchError::TlsVerification { url: tls_url });
                }
                Attempt::Terminal(error) => return Err(error),
            }
        }

        let last = last_error.unwrap_or_else(|| FetchError::Transient {
            url: url.to_string(),
            detail: "no attempt recorded".to_string(),
        });
        let exhausted = FetchError::Exhausted {
            url: url.to_string(),
            attempts: max_attempts,
            last: Box::new(last),
        };
        if exhausted.is_breaker_trip() {
            breaker.record_failure();
        }
        Err(exhausted)
    }

    #[allow(clippy::too_many_arguments)]
    async fn one_download_attempt(
        &self,
        client: &reqwest::Client,
        url: &str,
        headers: &HeaderMap,
        timeout: Duration,
        part_path: &Path,
        class: ContentClass,
        work_id: Option<&str>,
    ) -> Attempt<u64> {
        let response = match client
            .get(url)
            .headers(headers.clone())
            .timeout(timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => return classify_request_error(url, &error),
        };
        if let Some(attempt) = classify_status(url, &response) {
            return attempt;
        }

        let expected = response.content_length().unwrap_or(0);
        if let Err(e) = self.budget.reserve(class, work_id, expected) {
            return Attempt::Terminal(e.into());
        }

        let mut file = match tokio::fs::File::create(part_path).await {
            Ok(file) => file,
            Err(e) => return Attempt::Terminal(FetchError::io(part_path, e)),
        };

        let mut streamed: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(error) => {
                    self.abandon_partial(part_path, class, work_id, streamed).await;
                    return Attempt::Transient {
                        detail: format!("stream interrupted: {error}"),
                    };
                }
            };
            if let Err(e) = self.budget.consume(class, work_id, chunk.len() as u64) {
                self.abandon_partial(part_path, class, work_id, streamed).await;
                return Attempt::Terminal(e.into());
            }
            streamed += chunk.len() as u64;
            if let Err(e) = file.write_all(&chunk).await {
                self.abandon_partial(part_path, class, work_id, streamed).await;
                return Attempt::Terminal(FetchError::io(part_path, e));
            }
        }

        if let Err(e) = file.flush().await {
            self.abandon_partial(part_path, class, work_id, streamed).await;
            return Attempt::Terminal(FetchError::io(part_path, e));
        }
        drop(file);
        Attempt::Done(streamed)
    }

    async fn abandon_partial(
        &self,
        part_path: &Path,
        class: ContentClass,
        work_id: Option<&str>,
        streamed: u64,
    ) {
        self.budget.release(class, work_id, streamed);
        if let Err(error) = tokio::fs::remove_file(part_path).await {
            if error.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %part_path.display(), %error, "failed to remove partial file");
            }
        }
    }
}

/// Path of the in-flight variant of `dest`.
#[must_use]
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    dest.with_file_name(name)
}

fn classify_status<T>(url: &str, response: &reqwest::Response) -> Option<Attempt<T>> {
    let status = response.status();
    if status.is_success() {
        return None;
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        return Some(Attempt::RateLimited { retry_after });
    }
    if status.is_server_error() {
        return Some(Attempt::Transient {
            detail: format!("HTTP {}", status.as_u16()),
        });
    }
    Some(Attempt::Terminal(FetchError::ClientError {
        url: url.to_string(),
        status: status.as_u16(),
    }))
}

fn classify_request_error<T>(url: &str, error: &reqwest::Error) -> Attempt<T> {
    if is_tls_error(error) {
        return Attempt::Terminal(FetchError::TlsVerification {
            url: url.to_string(),
        });
    }
    if error.is_builder() {
        return Attempt::Terminal(FetchError::InvalidUrl {
            url: url.to_string(),
        });
    }
    // Timeouts, connection resets, DNS failures: all retryable.
    Attempt::Transient {
        detail: error.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(" 0 "), Some(Duration::ZERO));
        assert_eq!(parse_retry_after("-3"), None);
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn test_parse_retry_after_http_date_in_past_is_zero() {
        assert_eq!(
            parse_retry_after("Wed, 01 Jan 2020 00:00:00 GMT"),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_parse_retry_after_http_date_in_future() {
        let future = std::time::SystemTime::now() + Duration::from_secs(90);
        let value = httpdate::fmt_http_date(future);
        let parsed = parse_retry_after(&value).unwrap();
        assert!(parsed > Duration::from_secs(80) && parsed <= Duration::from_secs(95));
    }

    #[test]
    fn test_backoff_delay_grows_and_caps() {
        let net = NetworkConfig {
            base_backoff_s: 1.0,
            backoff_multiplier: 2.0,
            max_backoff_s: 5.0,
            ..NetworkConfig::default()
        };
        let d1 = backoff_delay(&net, 1);
        let d3 = backoff_delay(&net, 3);
        let d10 = backoff_delay(&net, 10);
        assert!(d1 >= Duration::from_secs(1) && d1 <= Duration::from_millis(1500));
        assert!(d3 >= Duration::from_secs(4) && d3 <= Duration::from_millis(4500));
        // Capped at 5s plus jitter.
        assert!(d10 <= Duration::from_millis(5500));
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/out/objects/e1_ia.pdf")),
            PathBuf::from("/out/objects/e1_ia.pdf.part")
        );
    }

    #[tokio::test]
    async fn test_executor_builds() {
        let budget = std::sync::Arc::new(BudgetAccountant::unlimited());
        let executor = HttpExecutor::new(Config::default(), budget).unwrap();
        assert_eq!(executor.breakers().breaker("x").consecutive_failures(), 0);
    }
}
