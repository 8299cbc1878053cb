//! Pooled HTTP session with JSON memoization and a circuit breaker
//! (spec.md §4.4, supplemented feature in SPEC_FULL.md).

use crate::catalog::auth::Authenticator;
use crate::error::{CampusFsError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub keep_alive: Duration,
    pub max_concurrent: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(60),
            max_concurrent: 10,
        }
    }
}

/// Closed -> Open -> Half-Open, tripped by a run of consecutive failures
/// rather than the original's rolling error-rate window (SPEC_FULL.md
/// §http_client.rs): a single mount process talking to one host doesn't
/// need the full sliding-window machinery.
struct CircuitBreaker {
    consecutive_failures: AtomicU32,
    trip_threshold: u32,
    cooldown: Duration,
    opened_at: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    fn new(trip_threshold: u32, cooldown: Duration) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            trip_threshold,
            cooldown,
            opened_at: Mutex::new(None),
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *self.opened_at.lock() = None;
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.trip_threshold {
            let mut guard = self.opened_at.lock();
            if guard.is_none() {
                *guard = Some(Instant::now());
            }
        }
    }

    /// `Err` if the circuit is open and the cooldown hasn't elapsed yet;
    /// half-open (one probe allowed through) once it has.
    fn check(&self) -> Result<()> {
        let opened_at = *self.opened_at.lock();
        match opened_at {
            Some(when) if when.elapsed() < self.cooldown => Err(CampusFsError::NetworkDisconnected(
                "circuit breaker open: too many consecutive failures".into(),
            )),
            _ => Ok(()),
        }
    }
}

/// A shared HTTP session: one pooled `reqwest::Client`, a URL-keyed JSON
/// response cache (successful responses only), the active authenticator,
/// and a circuit breaker. Grounded in `blz-core::fetcher::Fetcher` for the
/// client-construction/GET shape.
pub struct HttpSession {
    client: reqwest::Client,
    authenticator: Arc<dyn Authenticator>,
    json_cache: Mutex<HashMap<String, Arc<serde_json::Value>>>,
    breaker: CircuitBreaker,
    semaphore: tokio::sync::Semaphore,
}

impl HttpSession {
    pub fn new(config: ClientConfig, authenticator: Arc<dyn Authenticator>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .pool_idle_timeout(config.keep_alive)
            .user_agent(concat!("campusfs/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CampusFsError::Protocol(format!("building HTTP client: {e}")))?;
        Ok(Self {
            client,
            authenticator,
            json_cache: Mutex::new(HashMap::new()),
            breaker: CircuitBreaker::new(5, Duration::from_secs(30)),
            semaphore: tokio::sync::Semaphore::new(config.max_concurrent),
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// JSON GET, memoized at the URL level; only successful responses are
    /// cached (spec.md §4.3 "SHOULD memoize JSON GETs at the URL level").
    pub async fn get_json(&self, url: &str) -> Result<Arc<serde_json::Value>> {
        if let Some(cached) = self.json_cache.lock().get(url).cloned() {
            return Ok(cached);
        }
        self.breaker.check()?;
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("semaphore is never closed");

        let req = self.authenticator.decorate(self.client.get(url), "GET", url);
        let result = req.send().await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                let value: serde_json::Value = resp
                    .json()
                    .await
                    .map_err(|e| CampusFsError::from_reqwest(e, "parse JSON"))?;
                self.breaker.record_success();
                let value = Arc::new(value);
                self.json_cache.lock().insert(url.to_string(), value.clone());
                Ok(value)
            }
            Ok(resp) => {
                let err = CampusFsError::from_reqwest(resp.error_for_status().unwrap_err(), url);
                if !matches!(err, CampusFsError::NotFound(_) | CampusFsError::Forbidden(_)) {
                    self.breaker.record_failure();
                }
                Err(err)
            }
            Err(err) => {
                let err = CampusFsError::from_reqwest(err, url);
                self.breaker.record_failure();
                Err(err)
            }
        }
    }

    pub fn authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.authenticator
    }
}
