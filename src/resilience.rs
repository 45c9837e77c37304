// src/resilience.rs
//! Outbound call resilience shared by every provider: a per-endpoint circuit
//! breaker, bounded retry with jittered exponential backoff, and collapsing
//! of identical in-flight requests so concurrent callers share one result.
//!
//! The client emits per-endpoint success/failure counters; it does not log
//! business data.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell as StaticOnceCell;
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;

use crate::config::ResilienceConfig;
use crate::error::FetchError;

fn ensure_metrics_described() {
    static ONCE: StaticOnceCell<()> = StaticOnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "resilience_success_total",
            "Successful outbound calls per endpoint."
        );
        describe_counter!(
            "resilience_failure_total",
            "Failed outbound calls per endpoint (after retries)."
        );
        describe_counter!(
            "resilience_circuit_open_total",
            "Calls rejected fast because the circuit was open."
        );
    });
}

/// Minimal response surface shared between callers of a collapsed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// Public snapshot of one endpoint's breaker.
#[derive(Debug, Clone, Copy, Default)]
pub struct CircuitState {
    pub is_open: bool,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Circuit {
    state: CircuitState,
    /// Exactly one trial call is allowed while half-open.
    probe_in_flight: bool,
}

struct InFlight {
    started: Instant,
    cell: Arc<OnceCell<Result<HttpResponse, FetchError>>>,
}

pub struct ResilienceClient {
    cfg: ResilienceConfig,
    circuits: Mutex<HashMap<String, Circuit>>,
    in_flight: Mutex<HashMap<String, InFlight>>,
}

impl ResilienceClient {
    pub fn new(cfg: ResilienceConfig) -> Self {
        ensure_metrics_described();
        Self {
            cfg,
            circuits: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `request_fn` under the endpoint's breaker with retries.
    /// `request_key` must uniquely describe method+URL+body: identical keys
    /// issued within the in-flight window share one underlying call.
    pub async fn execute<F, Fut>(
        &self,
        endpoint_key: &str,
        request_key: &str,
        request_fn: F,
    ) -> Result<HttpResponse, FetchError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<HttpResponse, FetchError>>,
    {
        let cell = self.in_flight_cell(endpoint_key, request_key);
        cell.get_or_init(|| self.run_guarded(endpoint_key, &request_fn))
            .await
            .clone()
    }

    /// Snapshot for diagnostics/tests.
    pub fn circuit_state(&self, endpoint_key: &str) -> CircuitState {
        let circuits = self.circuits.lock().expect("circuit mutex poisoned");
        circuits
            .get(endpoint_key)
            .map(|c| c.state)
            .unwrap_or_default()
    }

    fn in_flight_cell(
        &self,
        endpoint_key: &str,
        request_key: &str,
    ) -> Arc<OnceCell<Result<HttpResponse, FetchError>>> {
        let mut hasher = Sha256::new();
        hasher.update(endpoint_key.as_bytes());
        hasher.update(b"\n");
        hasher.update(request_key.as_bytes());
        let key = format!("{:x}", hasher.finalize());

        let window = Duration::from_millis(self.cfg.inflight_window_ms);
        let mut map = self.in_flight.lock().expect("in-flight mutex poisoned");
        map.retain(|_, e| e.started.elapsed() < window.saturating_mul(8));
        match map.get(&key) {
            Some(entry) if entry.started.elapsed() < window => entry.cell.clone(),
            _ => {
                let cell = Arc::new(OnceCell::new());
                map.insert(
                    key,
                    InFlight {
                        started: Instant::now(),
                        cell: cell.clone(),
                    },
                );
                cell
            }
        }
    }

    async fn run_guarded<F, Fut>(&self, endpoint_key: &str, request_fn: &F) -> Result<HttpResponse, FetchError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<HttpResponse, FetchError>>,
    {
        if let Err(e) = self.admit(endpoint_key) {
            counter!("resilience_circuit_open_total", "endpoint" => endpoint_key.to_string())
                .increment(1);
            return Err(e);
        }

        let mut attempt: u32 = 0;
        loop {
            let outcome = match request_fn().await {
                Ok(resp) if resp.status < 400 => Ok(resp),
                Ok(resp) => Err(FetchError::Status(resp.status)),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(resp) => {
                    self.record_success(endpoint_key);
                    counter!("resilience_success_total", "endpoint" => endpoint_key.to_string())
                        .increment(1);
                    return Ok(resp);
                }
                Err(err) => {
                    attempt += 1;
                    if !err.is_transient() || attempt >= self.cfg.max_attempts {
                        self.record_failure(endpoint_key);
                        counter!("resilience_failure_total", "endpoint" => endpoint_key.to_string())
                            .increment(1);
                        return Err(err);
                    }
                    tokio::time::sleep(self.backoff_delay(attempt)).await;
                }
            }
        }
    }

    /// Gate a call on the breaker. While open and cooling down, fail fast;
    /// after cooldown, admit a single half-open probe.
    fn admit(&self, endpoint_key: &str) -> Result<(), FetchError> {
        let cooldown = Duration::from_millis(self.cfg.cooldown_ms);
        let mut circuits = self.circuits.lock().expect("circuit mutex poisoned");
        let circuit = circuits.entry(endpoint_key.to_string()).or_default();

        if !circuit.state.is_open {
            return Ok(());
        }
        let cooled = circuit
            .state
            .last_failure_at
            .map(|at| at.elapsed() >= cooldown)
            .unwrap_or(true);
        if cooled && !circuit.probe_in_flight {
            circuit.probe_in_flight = true;
            return Ok(());
        }
        Err(FetchError::CircuitOpen(endpoint_key.to_string()))
    }

    fn record_success(&self, endpoint_key: &str) {
        let mut circuits = self.circuits.lock().expect("circuit mutex poisoned");
        let circuit = circuits.entry(endpoint_key.to_string()).or_default();
        circuit.state.is_open = false;
        circuit.state.consecutive_failures = 0;
        circuit.state.last_failure_at = None;
        circuit.probe_in_flight = false;
    }

    fn record_failure(&self, endpoint_key: &str) {
        let mut circuits = self.circuits.lock().expect("circuit mutex poisoned");
        let circuit = circuits.entry(endpoint_key.to_string()).or_default();
        circuit.state.consecutive_failures = circuit.state.consecutive_failures.saturating_add(1);
        circuit.state.last_failure_at = Some(Instant::now());
        circuit.probe_in_flight = false;
        if circuit.state.consecutive_failures >= self.cfg.failure_threshold {
            circuit.state.is_open = true;
        }
    }

    /// `min(max_backoff, initial * 2^attempt)` with ±20% jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self
            .cfg
            .initial_backoff_ms
            .saturating_mul(1u64 << attempt.min(16));
        let capped = base.min(self.cfg.max_backoff_ms) as f64;
        let jitter = capped * 0.2 * (rand::rng().random::<f64>() * 2.0 - 1.0);
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}
