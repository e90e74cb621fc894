//! Broadcast Dispatcher — reliably submits signed transactions to one of
//! several remote endpoints with priority queuing, rate limiting,
//! per-endpoint circuit breakers, and exponential-backoff retries.

pub mod circuit;
pub mod retry;
pub mod transport;

pub use circuit::{BreakerState, CircuitBreaker};
pub use retry::{classify_error, ErrorClass, RetryConfig, RetryContext};
pub use transport::{HttpTransport, OnChainStatus, SubmitOutcome, Transport};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{oneshot, Semaphore};

use crate::error::DispatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Urgent = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastOptions {
    pub timeout_override: Option<Duration>,
    pub priority: Option<Priority>,
    pub max_retries_override: Option<u32>,
    pub pinned_endpoint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BroadcastResult {
    pub success: bool,
    pub endpoint: Option<String>,
    pub tx_id: Option<String>,
    pub retry_count: u32,
    pub errors: Vec<String>,
}

/// A remote service that accepts signed transactions.
#[derive(Clone)]
pub struct Endpoint {
    pub name: String,
    pub url: String,
    credential: String,
    pub priority: u32,
    pub timeout: Duration,
    pub max_retries: u32,
    pub enabled: bool,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, url: impl Into<String>, credential: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            credential: credential.into(),
            priority,
            timeout: Duration::from_secs(10),
            max_retries: 3,
            enabled: true,
        }
    }

    pub fn credential(&self) -> &str {
        &self.credential
    }
}

/// Manual `Debug`/`Display` that redact the credential, matching the
/// project's existing convention for config secrets.
impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("credential", &"<redacted>")
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Endpoint({}, priority={}, credential=<redacted>)", self.name, self.priority)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointHealth {
    Healthy,
    Degraded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct EndpointStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_latency: Duration,
    pub health: EndpointHealth,
}

impl Default for EndpointStats {
    fn default() -> Self {
        Self {
            requests: 0,
            successes: 0,
            failures: 0,
            avg_latency: Duration::ZERO,
            health: EndpointHealth::Healthy,
        }
    }
}

impl EndpointStats {
    fn record(&mut self, success: bool, latency: Duration) {
        self.requests += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        let n = self.requests as f64;
        let prev = self.avg_latency.as_secs_f64();
        self.avg_latency = Duration::from_secs_f64(prev + (latency.as_secs_f64() - prev) / n);
        self.health = if !success && self.requests >= 3 && self.failures * 2 >= self.requests {
            EndpointHealth::Degraded
        } else if !success && self.failures >= 10 {
            EndpointHealth::Failed
        } else {
            EndpointHealth::Healthy
        };
    }
}

#[derive(Debug, Clone)]
pub struct EndpointHealthSnapshot {
    pub name: String,
    pub health: EndpointHealth,
    pub breaker_state: BreakerState,
    pub consecutive_failures: u32,
    pub avg_latency: Duration,
}

struct QueuedBroadcast {
    tx: Vec<u8>,
    priority: Priority,
    enqueue_timestamp: Instant,
    options: BroadcastOptions,
    result_tx: oneshot::Sender<BroadcastResult>,
}

/// Token bucket keyed by current wall-second: admits at most
/// `rate_limit_per_second` requests within any given second.
struct RateLimiter {
    capacity: u32,
    current_second: AtomicU64,
    used_this_second: AtomicU32,
}

impl RateLimiter {
    fn new(capacity: u32) -> Self {
        Self {
            capacity,
            current_second: AtomicU64::new(0),
            used_this_second: AtomicU32::new(0),
        }
    }

    fn try_admit(&self) -> bool {
        if self.capacity == 0 {
            return true;
        }
        let now_secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let prev = self.current_second.swap(now_secs, Ordering::SeqCst);
        if prev != now_secs {
            self.used_this_second.store(0, Ordering::SeqCst);
        }
        let used = self.used_this_second.fetch_add(1, Ordering::SeqCst);
        used < self.capacity
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub default_timeout: Duration,
    pub max_concurrent_broadcasts: usize,
    pub batch_size: usize,
    pub retry_backoff_ms: u64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_reset_time: Duration,
    pub rate_limit_per_second: u32,
    pub max_queue_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(10),
            max_concurrent_broadcasts: 16,
            batch_size: 50,
            retry_backoff_ms: 500,
            circuit_breaker_threshold: 5,
            circuit_breaker_reset_time: Duration::from_secs(60),
            rate_limit_per_second: 100,
            max_queue_size: 1_000,
        }
    }
}

pub struct BroadcastDispatcher<T: Transport> {
    endpoints: Mutex<Vec<Endpoint>>,
    stats: DashMap<String, EndpointStats>,
    breakers: DashMap<String, Mutex<CircuitBreaker>>,
    transport: Arc<T>,
    config: Mutex<DispatcherConfig>,
    rate_limiter: RateLimiter,
    queue: Mutex<VecDeque<QueuedBroadcast>>,
    concurrency: Semaphore,
    draining: AtomicBool,
}

impl<T: Transport> BroadcastDispatcher<T> {
    pub fn new(endpoints: Vec<Endpoint>, transport: Arc<T>, config: DispatcherConfig) -> Self {
        let breakers = DashMap::new();
        let stats = DashMap::new();
        for endpoint in &endpoints {
            breakers.insert(
                endpoint.name.clone(),
                Mutex::new(CircuitBreaker::new(config.circuit_breaker_threshold, config.circuit_breaker_reset_time)),
            );
            stats.insert(endpoint.name.clone(), EndpointStats::default());
        }
        let rate_limiter = RateLimiter::new(config.rate_limit_per_second);
        let concurrency = Semaphore::new(config.max_concurrent_broadcasts);
        Self {
            endpoints: Mutex::new(endpoints),
            stats,
            breakers,
            transport,
            config: Mutex::new(config),
            rate_limiter,
            queue: Mutex::new(VecDeque::new()),
            concurrency,
            draining: AtomicBool::new(false),
        }
    }

    fn sorted_endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints = self.endpoints.lock().unwrap().clone();
        endpoints.retain(|e| e.enabled);
        endpoints.sort_by_key(|e| e.priority);
        endpoints
    }

    /// Single-shot submission: tries endpoints in ascending priority,
    /// skipping any whose circuit breaker is open, retrying within each
    /// endpoint with exponential backoff.
    pub async fn broadcast(&self, tx: &[u8], options: &BroadcastOptions) -> BroadcastResult {
        if !self.rate_limiter.try_admit() {
            return BroadcastResult {
                success: false,
                endpoint: None,
                tx_id: None,
                retry_count: 0,
                errors: vec![DispatchError::RateLimited.to_string()],
            };
        }

        let _permit = self.concurrency.acquire().await;
        let endpoints = self.sorted_endpoints();
        let candidates: Vec<Endpoint> = if let Some(pinned) = &options.pinned_endpoint {
            endpoints.into_iter().filter(|e| &e.name == pinned).collect()
        } else {
            endpoints
        };

        if candidates.is_empty() {
            return BroadcastResult {
                success: false,
                endpoint: None,
                tx_id: None,
                retry_count: 0,
                errors: vec![DispatchError::NoEndpoints.to_string()],
            };
        }

        let mut errors = Vec::new();
        let mut total_retry_count = 0u32;
        let mut any_breaker_open = false;

        for (idx, endpoint) in candidates.iter().enumerate() {
            let allowed = {
                let breaker = self.breakers.entry(endpoint.name.clone()).or_insert_with(|| {
                    let config = self.config.lock().unwrap();
                    Mutex::new(CircuitBreaker::new(config.circuit_breaker_threshold, config.circuit_breaker_reset_time))
                });
                breaker.lock().unwrap().allow_request()
            };
            if !allowed {
                any_breaker_open = true;
                let has_alternate = idx + 1 < candidates.len();
                let circuit_err = DispatchError::CircuitOpen { retryable: has_alternate };
                errors.push(format!("{}: {}", endpoint.name, circuit_err));
                continue;
            }

            let retry_config = RetryConfig {
                max_retries: options.max_retries_override.unwrap_or(endpoint.max_retries),
                base_backoff: Duration::from_millis(self.config.lock().unwrap().retry_backoff_ms),
                max_backoff: Duration::from_secs(10),
            };
            let timeout = options.timeout_override.unwrap_or(endpoint.timeout);

            let mut ctx = RetryContext::new();
            loop {
                let started = Instant::now();
                let outcome = self.transport.submit(&endpoint.url, tx, timeout).await;
                let latency = started.elapsed();

                match outcome {
                    Ok(result) => {
                        self.record_outcome(&endpoint.name, true, latency);
                        errors.extend(ctx.errors);
                        return BroadcastResult {
                            success: true,
                            endpoint: Some(endpoint.name.clone()),
                            tx_id: Some(result.tx_id),
                            retry_count: ctx.attempt,
                            errors,
                        };
                    }
                    Err(err) => {
                        self.record_outcome(&endpoint.name, false, latency);
                        let retryable = classify_error(&err.to_string()) == ErrorClass::Retryable || err.is_retryable();
                        let attempt_for_backoff = ctx.attempt;
                        ctx.record_failure(format!("{}: {}", endpoint.name, err));
                        if retryable && retry_config.should_retry(attempt_for_backoff) {
                            tokio::time::sleep(retry_config.backoff_for_attempt(attempt_for_backoff)).await;
                            total_retry_count += 1;
                            continue;
                        }
                        break;
                    }
                }
            }
            errors.extend(ctx.errors);
        }

        BroadcastResult {
            success: false,
            endpoint: None,
            tx_id: None,
            retry_count: total_retry_count,
            errors: if any_breaker_open && errors.iter().all(|e| e.contains("circuit breaker open")) {
                vec!["circuit breaker open".to_string()]
            } else {
                errors
            },
        }
    }

    fn record_outcome(&self, endpoint_name: &str, success: bool, latency: Duration) {
        if let Some(mut stats) = self.stats.get_mut(endpoint_name) {
            stats.record(success, latency);
        }
        let breaker_open = if let Some(breaker) = self.breakers.get(endpoint_name) {
            let mut breaker = breaker.lock().unwrap();
            if success {
                breaker.on_success();
            } else {
                breaker.on_failure();
            }
            breaker.state() == BreakerState::Open
        } else {
            false
        };
        crate::metrics::record_broadcast(endpoint_name, success, latency.as_secs_f64());
        crate::metrics::set_circuit_breaker_open(endpoint_name, breaker_open);
    }

    /// Chunks `txs` into endpoint-accepted batch sizes and submits with
    /// bounded concurrency.
    pub async fn batch_broadcast(&self, txs: &[Vec<u8>], options: &BroadcastOptions) -> Vec<BroadcastResult> {
        let batch_size = self.config.lock().unwrap().batch_size.max(1);
        let mut results = Vec::with_capacity(txs.len());
        for chunk in txs.chunks(batch_size) {
            let futures = chunk.iter().map(|tx| self.broadcast(tx, options));
            results.extend(futures::future::join_all(futures).await);
        }
        results
    }

    /// Rate-limited variant for sustained throughput.
    pub async fn streaming_broadcast(&self, txs: &[Vec<u8>], rate_limit_per_second: u32) -> Vec<BroadcastResult> {
        let mut results = Vec::with_capacity(txs.len());
        let interval = if rate_limit_per_second > 0 {
            Duration::from_secs_f64(1.0 / rate_limit_per_second as f64)
        } else {
            Duration::ZERO
        };
        for tx in txs {
            results.push(self.broadcast(tx, &BroadcastOptions::default()).await);
            if !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
        }
        results
    }

    /// Defers to the internal priority queue; returns a handle that
    /// resolves with the broadcast result. Entries are kept in a single
    /// sequence ordered by (priority rank, enqueue-timestamp); insertion is
    /// O(n) in queue length.
    pub fn enqueue(&self, tx: Vec<u8>, priority: Priority) -> Result<oneshot::Receiver<BroadcastResult>, DispatchError> {
        if self.draining.load(Ordering::Acquire) {
            return Err(DispatchError::ShuttingDown);
        }
        let max_queue_size = self.config.lock().unwrap().max_queue_size;
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= max_queue_size {
            return Err(DispatchError::QueueFull);
        }
        let (result_tx, result_rx) = oneshot::channel();
        let entry = QueuedBroadcast {
            tx,
            priority,
            enqueue_timestamp: Instant::now(),
            options: BroadcastOptions { priority: Some(priority), ..Default::default() },
            result_tx,
        };
        let pos = queue
            .iter()
            .position(|q| (q.priority, q.enqueue_timestamp) > (entry.priority, entry.enqueue_timestamp))
            .unwrap_or(queue.len());
        queue.insert(pos, entry);
        crate::metrics::set_dispatch_queue_depth(queue.len());
        Ok(result_rx)
    }

    /// Pops and processes the highest-priority queued broadcast, if any.
    /// Returns `false` when the queue was empty. A cancelled enqueue entry
    /// (receiver dropped) still completes; its result is simply discarded.
    pub async fn drain_once(&self) -> bool {
        let entry = {
            let mut queue = self.queue.lock().unwrap();
            let entry = queue.pop_front();
            crate::metrics::set_dispatch_queue_depth(queue.len());
            entry
        };
        match entry {
            Some(entry) => {
                let result = self.broadcast(&entry.tx, &entry.options).await;
                let _ = entry.result_tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Stops accepting new `enqueue` calls, lets in-flight queue entries
    /// drain up to `grace`, then abandons the rest.
    pub async fn drain(&self, grace: Duration) {
        self.draining.store(true, Ordering::Release);
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if !self.drain_once().await {
                break;
            }
        }
        let abandoned = self.queue.lock().unwrap().len();
        if abandoned > 0 {
            tracing::warn!(abandoned, "dispatcher drain grace period expired; abandoning remaining queue entries");
            self.queue.lock().unwrap().clear();
        }
    }

    /// Polls endpoints for on-chain status.
    pub async fn status(&self, tx_id: &str) -> OnChainStatus {
        for endpoint in self.sorted_endpoints() {
            if let Ok(status) = self.transport.status(&endpoint.url, tx_id).await {
                if status != OnChainStatus::Unknown {
                    return status;
                }
            }
        }
        OnChainStatus::Unknown
    }

    pub fn health_snapshot(&self) -> Vec<EndpointHealthSnapshot> {
        self.sorted_endpoints()
            .into_iter()
            .map(|e| {
                let stats = self.stats.get(&e.name).map(|s| s.clone()).unwrap_or_default();
                let breaker = self.breakers.get(&e.name);
                let (breaker_state, consecutive_failures) = breaker
                    .map(|b| {
                        let b = b.lock().unwrap();
                        (b.state(), b.consecutive_failures())
                    })
                    .unwrap_or((BreakerState::Closed, 0));
                EndpointHealthSnapshot {
                    name: e.name,
                    health: stats.health,
                    breaker_state,
                    consecutive_failures,
                    avg_latency: stats.avg_latency,
                }
            })
            .collect()
    }

    pub fn replace_endpoints(&self, endpoints: Vec<Endpoint>) {
        for endpoint in &endpoints {
            self.breakers.entry(endpoint.name.clone()).or_insert_with(|| {
                let config = self.config.lock().unwrap();
                Mutex::new(CircuitBreaker::new(config.circuit_breaker_threshold, config.circuit_breaker_reset_time))
            });
            self.stats.entry(endpoint.name.clone()).or_default();
        }
        *self.endpoints.lock().unwrap() = endpoints;
    }
}
