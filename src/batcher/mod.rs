//! Adaptive Event Batcher — aggregates a high-rate stream of `PaymentEvent`s
//! into `Batch`es per (content-hash, direction) key, flushing on size or
//! timeout thresholds that a periodic tuner adjusts to live throughput and
//! latency.
//!
//! Per-key state lives behind a [`dashmap::DashMap`] so unrelated keys never
//! contend with each other; the entry API's shard guard gives each key's
//! push-then-maybe-flush sequence the atomicity the ordering invariant
//! (`Ev-Order`) needs without a single global lock.

mod tuner;

pub use tuner::{LoadRegime, TunedParams, TunerBounds};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::bounded_cache::RingBuffer;
use crate::error::BatcherError;
use crate::scheduler::{Scheduler, TimerHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Sent,
    Received,
}

/// An immutable record of a single delivered block's payment.
#[derive(Debug, Clone)]
pub struct PaymentEvent {
    pub content_hash: String,
    pub direction: Direction,
    pub peer_id: Vec<u8>,
    pub block_index: u64,
    pub block_size: u64,
    pub amount: u64,
    pub arrival: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatcherKey {
    pub content_hash: String,
    pub direction: Direction,
}

impl PaymentEvent {
    pub fn key(&self) -> BatcherKey {
        BatcherKey {
            content_hash: self.content_hash.clone(),
            direction: self.direction,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Size,
    Timeout,
    Overflow,
    Shutdown,
}

impl FlushReason {
    fn as_str(self) -> &'static str {
        match self {
            FlushReason::Size => "size",
            FlushReason::Timeout => "timeout",
            FlushReason::Overflow => "overflow",
            FlushReason::Shutdown => "shutdown",
        }
    }
}

/// A flushed group of events sharing one key, in arrival order.
#[derive(Debug, Clone)]
pub struct Batch {
    pub key: BatcherKey,
    pub events: Vec<PaymentEvent>,
    pub opened_at: Instant,
    pub flushed_at: Instant,
    pub reason: FlushReason,
}

#[derive(Debug, Clone)]
pub struct BatchMetrics {
    pub count: usize,
    pub total_amount: u64,
    pub unique_peer_count: usize,
    pub unique_block_count: usize,
    pub time_span: Duration,
    pub flush_reason: FlushReason,
    pub throughput: f64,
}

impl BatchMetrics {
    fn from_batch(batch: &Batch) -> Self {
        let count = batch.events.len();
        let total_amount: u64 = batch.events.iter().map(|e| e.amount).sum();
        let mut peers: Vec<&[u8]> = batch.events.iter().map(|e| e.peer_id.as_slice()).collect();
        peers.sort_unstable();
        peers.dedup();
        let mut blocks: Vec<u64> = batch.events.iter().map(|e| e.block_index).collect();
        blocks.sort_unstable();
        blocks.dedup();
        let time_span = batch.flushed_at.saturating_duration_since(batch.opened_at);
        let throughput = if time_span.as_secs_f64() > 0.0 {
            count as f64 / time_span.as_secs_f64()
        } else {
            count as f64
        };
        Self {
            count,
            total_amount,
            unique_peer_count: peers.len(),
            unique_block_count: blocks.len(),
            time_span,
            flush_reason: batch.reason,
            throughput,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub min_batch_timeout_ms: u64,
    pub max_batch_timeout_ms: u64,
    pub high_load_events_per_sec: f64,
    pub low_load_events_per_sec: f64,
    pub target_latency_ms: f64,
    pub max_queue_size: usize,
    pub max_batches_in_memory: usize,
    pub tuning_interval_ms: u64,
    pub aggressive_tuning: bool,
    pub initial_batch_size: usize,
    pub initial_batch_timeout_ms: u64,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            min_batch_size: 10,
            max_batch_size: 500,
            min_batch_timeout_ms: 10,
            max_batch_timeout_ms: 5_000,
            high_load_events_per_sec: 1_000.0,
            low_load_events_per_sec: 50.0,
            target_latency_ms: 100.0,
            max_queue_size: 1_000,
            max_batches_in_memory: 100,
            tuning_interval_ms: 1_000,
            aggressive_tuning: false,
            initial_batch_size: 50,
            initial_batch_timeout_ms: 200,
        }
    }
}

impl BatcherConfig {
    fn aggressive_factor(&self) -> f64 {
        if self.aggressive_tuning {
            1.5
        } else {
            1.2
        }
    }

    fn bounds(&self) -> TunerBounds {
        TunerBounds {
            min_batch_size: self.min_batch_size,
            max_batch_size: self.max_batch_size,
            min_batch_timeout_ms: self.min_batch_timeout_ms,
            max_batch_timeout_ms: self.max_batch_timeout_ms,
        }
    }
}

#[derive(Debug, Default)]
struct LifetimeCounters {
    ingested: AtomicU64,
    rejected_overflow: AtomicU64,
    rejected_shutdown: AtomicU64,
    flushed: AtomicU64,
    flushed_events: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct BatcherMetricsSnapshot {
    pub total_ingested: u64,
    pub total_rejected: u64,
    pub total_flushed_batches: u64,
    pub total_flushed_events: u64,
    pub current_batch_size: usize,
    pub current_batch_timeout_ms: u64,
    pub recent_batches: Vec<BatchMetrics>,
}

struct PendingQueue {
    events: Vec<PaymentEvent>,
    open_at: Instant,
    timer: Option<TimerHandle>,
}

impl PendingQueue {
    fn new() -> Self {
        Self {
            events: Vec::new(),
            open_at: Instant::now(),
            timer: None,
        }
    }
}

pub type BatchObserver = Arc<dyn Fn(Batch) + Send + Sync>;

/// The Batcher itself. Always used behind an `Arc` since its internal
/// timers hold a weak reference back to schedule flushes.
pub struct EventBatcher<S: Scheduler> {
    config: RwLock<BatcherConfig>,
    adaptive: Mutex<TunedParams>,
    pending: DashMap<BatcherKey, PendingQueue>,
    scheduler: Arc<S>,
    shutdown: AtomicBool,
    counters: LifetimeCounters,
    recent_batches: Mutex<RingBuffer<BatchMetrics>>,
    latency_samples_ms: Mutex<RingBuffer<f64>>,
    on_batch: Mutex<Option<BatchObserver>>,
    events_since_tick: AtomicU64,
    last_tick_at: Mutex<Instant>,
}

impl<S: Scheduler + 'static> EventBatcher<S> {
    pub fn new(config: BatcherConfig, scheduler: Arc<S>) -> Arc<Self> {
        let adaptive = TunedParams {
            batch_size: config.initial_batch_size,
            batch_timeout_ms: config.initial_batch_timeout_ms,
        };
        let max_batches = config.max_batches_in_memory;
        Arc::new(Self {
            config: RwLock::new(config),
            adaptive: Mutex::new(adaptive),
            pending: DashMap::new(),
            scheduler,
            shutdown: AtomicBool::new(false),
            counters: LifetimeCounters::default(),
            recent_batches: Mutex::new(RingBuffer::new(max_batches)),
            latency_samples_ms: Mutex::new(RingBuffer::new(1_000)),
            on_batch: Mutex::new(None),
            events_since_tick: AtomicU64::new(0),
            last_tick_at: Mutex::new(Instant::now()),
        })
    }

    pub fn set_on_batch(&self, observer: BatchObserver) {
        *self.on_batch.lock().unwrap() = Some(observer);
    }

    fn schedule_flush_timer(self: &Arc<Self>, key: BatcherKey, timeout_ms: u64) -> TimerHandle {
        let weak: Weak<Self> = Arc::downgrade(self);
        let timer_key = key.clone();
        self.scheduler.schedule(
            Duration::from_millis(timeout_ms),
            Box::new(move || {
                if let Some(strong) = weak.upgrade() {
                    strong.flush_timed_out(timer_key);
                }
            }),
        )
    }

    fn flush_timed_out(self: Arc<Self>, key: BatcherKey) {
        if let Some((_, queue)) = self.pending.remove(&key) {
            if !queue.events.is_empty() {
                self.emit_batch(key, queue.events, queue.open_at, FlushReason::Timeout);
            }
        }
    }

    /// Admits a PaymentEvent. Fails with `RejectedOverflow` if the per-key
    /// queue exceeds max-queue-size; fails with `ShuttingDown` after
    /// shutdown. May trigger a synchronous flush.
    pub fn ingest(self: &Arc<Self>, event: PaymentEvent) -> Result<(), BatcherError> {
        if self.shutdown.load(Ordering::Acquire) {
            self.counters.rejected_shutdown.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_event_rejected("shutting_down");
            return Err(BatcherError::ShuttingDown);
        }

        let key = event.key();
        let event_direction = match event.direction {
            Direction::Sent => "sent",
            Direction::Received => "received",
        };
        let (current_batch_size, current_timeout_ms, max_queue_size) = {
            let adaptive = *self.adaptive.lock().unwrap();
            let max_queue_size = self.config.read().unwrap().max_queue_size;
            (adaptive.batch_size, adaptive.batch_timeout_ms, max_queue_size)
        };

        let mut flush_now: Option<(Vec<PaymentEvent>, Instant, FlushReason)> = None;

        match self.pending.entry(key.clone()) {
            Entry::Occupied(mut occ) => {
                let queue = occ.get_mut();
                queue.events.push(event);
                if queue.events.len() >= max_queue_size {
                    if let Some(h) = queue.timer.take() {
                        self.scheduler.cancel(h);
                    }
                    let (_, queue) = occ.remove_entry();
                    flush_now = Some((queue.events, queue.open_at, FlushReason::Overflow));
                } else if queue.events.len() >= current_batch_size {
                    if let Some(h) = queue.timer.take() {
                        self.scheduler.cancel(h);
                    }
                    let (_, queue) = occ.remove_entry();
                    flush_now = Some((queue.events, queue.open_at, FlushReason::Size));
                }
            }
            Entry::Vacant(vac) => {
                let mut queue = PendingQueue::new();
                queue.events.push(event);
                if max_queue_size <= 1 {
                    flush_now = Some((queue.events, queue.open_at, FlushReason::Overflow));
                } else if current_batch_size <= 1 {
                    flush_now = Some((queue.events, queue.open_at, FlushReason::Size));
                } else {
                    vac.insert(queue);
                }
            }
        }

        // Timer scheduling happens after releasing the shard guard above so
        // the scheduler call (which may run synchronously in tests) never
        // re-enters the same shard lock.
        if flush_now.is_none() {
            let needs_timer = self
                .pending
                .get(&key)
                .map(|q| q.timer.is_none())
                .unwrap_or(false);
            if needs_timer {
                let handle = self.schedule_flush_timer(key.clone(), current_timeout_ms);
                if let Some(mut q) = self.pending.get_mut(&key) {
                    q.timer = Some(handle);
                }
            }
        }

        self.counters.ingested.fetch_add(1, Ordering::Relaxed);
        self.events_since_tick.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_event_ingested(event_direction);

        if let Some((events, open_at, reason)) = flush_now {
            self.emit_batch(key, events, open_at, reason);
        }

        Ok(())
    }

    fn emit_batch(&self, key: BatcherKey, events: Vec<PaymentEvent>, open_at: Instant, reason: FlushReason) {
        let flushed_at = Instant::now();
        {
            let mut samples = self.latency_samples_ms.lock().unwrap();
            for event in &events {
                let latency = flushed_at.saturating_duration_since(event.arrival).as_secs_f64() * 1_000.0;
                samples.push(latency);
            }
        }

        self.counters.flushed.fetch_add(1, Ordering::Relaxed);
        self.counters.flushed_events.fetch_add(events.len() as u64, Ordering::Relaxed);

        let batch = Batch {
            key,
            events,
            opened_at: open_at,
            flushed_at,
            reason,
        };
        let batch_metrics = BatchMetrics::from_batch(&batch);
        crate::metrics::record_batch_flushed(reason.as_str(), batch_metrics.time_span.as_secs_f64() * 1_000.0);
        self.recent_batches.lock().unwrap().push(batch_metrics);

        tracing::debug!(
            key = ?batch.key,
            count = batch.events.len(),
            reason = ?batch.reason,
            "batch flushed"
        );

        if let Some(observer) = self.on_batch.lock().unwrap().clone() {
            observer(batch);
        }
    }

    /// Emits a Batch for `key` if non-empty, bypassing the size threshold.
    /// Used for operator-triggered flushes outside the normal size/timeout
    /// path; `flush_all` (shutdown) always uses `FlushReason::Shutdown`
    /// instead.
    pub fn flush(&self, key: &BatcherKey) -> bool {
        if let Some((_, queue)) = self.pending.remove(key) {
            if let Some(h) = queue.timer {
                self.scheduler.cancel(h);
            }
            if !queue.events.is_empty() {
                self.emit_batch(key.clone(), queue.events, queue.open_at, FlushReason::Timeout);
                return true;
            }
        }
        false
    }

    /// Flushes every non-empty key; invoked on shutdown.
    pub fn flush_all(&self) {
        self.shutdown.store(true, Ordering::Release);
        let keys: Vec<BatcherKey> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, queue)) = self.pending.remove(&key) {
                if let Some(h) = queue.timer {
                    self.scheduler.cancel(h);
                }
                if !queue.events.is_empty() {
                    self.emit_batch(key, queue.events, queue.open_at, FlushReason::Shutdown);
                }
            }
        }
    }

    /// Re-clamps current size/timeout into the new bounds and restarts
    /// active timers with the new timeout.
    pub fn update_config(self: &Arc<Self>, new_config: BatcherConfig) {
        let bounds = new_config.bounds();
        {
            let mut adaptive = self.adaptive.lock().unwrap();
            adaptive.batch_size = adaptive.batch_size.clamp(bounds.min_batch_size, bounds.max_batch_size);
            adaptive.batch_timeout_ms = adaptive
                .batch_timeout_ms
                .clamp(bounds.min_batch_timeout_ms, bounds.max_batch_timeout_ms);
        }
        self.recent_batches
            .lock()
            .unwrap()
            .set_capacity(new_config.max_batches_in_memory);
        *self.config.write().unwrap() = new_config;

        let new_timeout_ms = self.adaptive.lock().unwrap().batch_timeout_ms;
        let keys: Vec<BatcherKey> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some(mut queue) = self.pending.get_mut(&key) {
                if let Some(h) = queue.timer.take() {
                    self.scheduler.cancel(h);
                }
                queue.timer = Some(self.schedule_flush_timer(key.clone(), new_timeout_ms));
            }
        }
    }

    /// Runs one adaptive-tuning tick: observes events/sec, average latency,
    /// and queue depth, then applies the tuning rules.
    pub fn tune(&self) {
        let now = Instant::now();
        let elapsed = {
            let mut last = self.last_tick_at.lock().unwrap();
            let elapsed = now.saturating_duration_since(*last);
            *last = now;
            elapsed
        };
        let events_in_window = self.events_since_tick.swap(0, Ordering::Relaxed) as f64;
        let events_per_sec = if elapsed.as_secs_f64() > 0.0 {
            events_in_window / elapsed.as_secs_f64()
        } else {
            events_in_window
        };

        let avg_latency_ms = {
            let samples = self.latency_samples_ms.lock().unwrap();
            if samples.is_empty() {
                0.0
            } else {
                samples.iter().sum::<f64>() / samples.len() as f64
            }
        };

        let queue_depth: usize = self.pending.iter().map(|e| e.events.len()).sum();

        let config = self.config.read().unwrap().clone();
        let regime = tuner::classify_load(events_per_sec, config.high_load_events_per_sec, config.low_load_events_per_sec);
        let current = *self.adaptive.lock().unwrap();
        let tuned = tuner::tune(
            current,
            config.bounds(),
            regime,
            avg_latency_ms,
            config.target_latency_ms,
            queue_depth,
            config.aggressive_factor(),
        );
        *self.adaptive.lock().unwrap() = tuned;
        crate::metrics::set_adaptive_params(tuned.batch_size, tuned.batch_timeout_ms);

        self.latency_samples_ms.lock().unwrap().truncate_to_most_recent(500);

        tracing::info!(
            ?regime,
            events_per_sec,
            avg_latency_ms,
            queue_depth,
            new_batch_size = tuned.batch_size,
            new_batch_timeout_ms = tuned.batch_timeout_ms,
            "tuning tick"
        );
    }

    pub fn metrics(&self) -> BatcherMetricsSnapshot {
        let adaptive = *self.adaptive.lock().unwrap();
        let rejected = self.counters.rejected_overflow.load(Ordering::Relaxed)
            + self.counters.rejected_shutdown.load(Ordering::Relaxed);
        BatcherMetricsSnapshot {
            total_ingested: self.counters.ingested.load(Ordering::Relaxed),
            total_rejected: rejected,
            total_flushed_batches: self.counters.flushed.load(Ordering::Relaxed),
            total_flushed_events: self.counters.flushed_events.load(Ordering::Relaxed),
            current_batch_size: adaptive.batch_size,
            current_batch_timeout_ms: adaptive.batch_timeout_ms,
            recent_batches: self.recent_batches.lock().unwrap().iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::VirtualScheduler;
    use std::sync::atomic::AtomicUsize;

    fn event(hash: &str, direction: Direction, block_index: u64) -> PaymentEvent {
        PaymentEvent {
            content_hash: hash.to_string(),
            direction,
            peer_id: vec![1, 2, 3],
            block_index,
            block_size: 16384,
            amount: 17,
            arrival: Instant::now(),
        }
    }

    fn test_batcher(max_queue_size: usize, batch_size: usize) -> Arc<EventBatcher<VirtualScheduler>> {
        let scheduler = VirtualScheduler::new();
        let config = BatcherConfig {
            max_queue_size,
            initial_batch_size: batch_size,
            ..Default::default()
        };
        EventBatcher::new(config, scheduler)
    }

    #[test]
    fn flush_on_size_threshold() {
        let batcher = test_batcher(1_000, 3);
        let flushed = Arc::new(AtomicUsize::new(0));
        let f = flushed.clone();
        batcher.set_on_batch(Arc::new(move |batch| {
            assert_eq!(batch.reason, FlushReason::Size);
            f.fetch_add(batch.events.len(), Ordering::SeqCst);
        }));

        for i in 0..3 {
            batcher.ingest(event("a".repeat(40).as_str(), Direction::Sent, i)).unwrap();
        }
        assert_eq!(flushed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn overflow_forces_flush_at_max_queue_size() {
        let batcher = test_batcher(2, 1_000);
        let reasons = Arc::new(Mutex::new(Vec::new()));
        let r = reasons.clone();
        batcher.set_on_batch(Arc::new(move |batch| {
            r.lock().unwrap().push(batch.reason);
        }));
        batcher.ingest(event(&"a".repeat(40), Direction::Sent, 0)).unwrap();
        batcher.ingest(event(&"a".repeat(40), Direction::Sent, 1)).unwrap();
        assert_eq!(*reasons.lock().unwrap(), vec![FlushReason::Overflow]);
    }

    #[test]
    fn distinct_keys_do_not_interfere() {
        let batcher = test_batcher(1_000, 2);
        let groups = Arc::new(Mutex::new(std::collections::HashSet::new()));
        let g = groups.clone();
        batcher.set_on_batch(Arc::new(move |batch| {
            g.lock().unwrap().insert(batch.key.content_hash.clone());
        }));
        for k in 0..10 {
            let hash = format!("{:040x}", k);
            for i in 0..2 {
                batcher
                    .ingest(event(&hash, Direction::Sent, i))
                    .unwrap();
            }
        }
        assert_eq!(groups.lock().unwrap().len(), 10);
    }

    #[test]
    fn preserves_arrival_order_within_a_batch() {
        let batcher = test_batcher(1_000, 5);
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = order.clone();
        batcher.set_on_batch(Arc::new(move |batch| {
            o.lock().unwrap().extend(batch.events.iter().map(|e| e.block_index));
        }));
        for i in 0..5 {
            batcher.ingest(event(&"a".repeat(40), Direction::Sent, i)).unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn flush_all_drains_every_key_with_shutdown_reason() {
        let batcher = test_batcher(1_000, 1_000);
        let reasons = Arc::new(Mutex::new(Vec::new()));
        let r = reasons.clone();
        batcher.set_on_batch(Arc::new(move |batch| {
            r.lock().unwrap().push(batch.reason);
        }));
        batcher.ingest(event(&"a".repeat(40), Direction::Sent, 0)).unwrap();
        batcher.ingest(event(&"b".repeat(40), Direction::Received, 0)).unwrap();
        batcher.flush_all();
        assert_eq!(reasons.lock().unwrap().len(), 2);
        assert!(reasons.lock().unwrap().iter().all(|r| *r == FlushReason::Shutdown));
    }

    #[test]
    fn ingest_after_shutdown_is_rejected() {
        let batcher = test_batcher(1_000, 1_000);
        batcher.flush_all();
        let result = batcher.ingest(event(&"a".repeat(40), Direction::Sent, 0));
        assert!(matches!(result, Err(BatcherError::ShuttingDown)));
    }

    #[test]
    fn metrics_report_lifetime_counters() {
        let batcher = test_batcher(1_000, 2);
        for i in 0..4 {
            batcher.ingest(event(&"a".repeat(40), Direction::Sent, i)).unwrap();
        }
        let snapshot = batcher.metrics();
        assert_eq!(snapshot.total_ingested, 4);
        assert_eq!(snapshot.total_flushed_events, 4);
        assert_eq!(snapshot.total_flushed_batches, 2);
    }
}
