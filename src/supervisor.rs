//! Supervisor — owns the lifecycle of the Batcher, Channel Manager, and
//! Dispatcher, wiring the Batcher's flush output into the Channel Manager
//! and the Channel Manager's settlement calls into the Dispatcher.
//!
//! One `tokio::select!` drives the independent concurrent loops (tuning
//! tick, dispatcher drain), and shutdown is a broadcasted signal each loop
//! observes cooperatively rather than a hard abort.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::Network;

use crate::batcher::{BatcherConfig, EventBatcher, PaymentEvent};
use crate::channel::{ChannelManager, ChannelParams, RetryPolicy, SettlementSink, WithdrawalLimits};
use crate::composer::ScriptComposer;
use crate::config::Config;
use crate::dispatcher::{
    BroadcastDispatcher, BroadcastOptions, DispatcherConfig, Endpoint, HttpTransport, Priority,
};
use crate::error::DispatchError;
use crate::scheduler::TokioScheduler;

/// Binds the Channel Manager's settlement calls to the Composer and
/// Dispatcher: builds a single-payee settlement transaction moving the
/// channel's current balances and submits it for broadcast.
struct ComposerDispatchSink {
    composer: ScriptComposer,
    dispatcher: Arc<BroadcastDispatcher<HttpTransport>>,
}

#[async_trait]
impl SettlementSink for ComposerDispatchSink {
    async fn settle_channel(
        &self,
        channel_id: &str,
        local_address: &str,
        local_amount: u64,
        remote_address: &str,
        remote_amount: u64,
    ) -> Result<String, DispatchError> {
        let artifacts = self
            .composer
            .compose_settlement(local_address, local_amount, remote_address, remote_amount)
            .map_err(|e| DispatchError::MalformedTransaction(e.to_string()))?;

        let total_fee: u64 = artifacts.iter().map(|a| a.estimated_fee).sum();
        let tx_bytes: Vec<u8> = artifacts.iter().flat_map(|a| a.locking_bytes.iter().copied()).collect();

        tracing::debug!(channel_id, outputs = artifacts.len(), estimated_fee = total_fee, "settlement script composed");

        let result = self
            .dispatcher
            .broadcast(&tx_bytes, &BroadcastOptions { priority: Some(Priority::High), ..Default::default() })
            .await;

        if result.success {
            Ok(result.tx_id.unwrap_or_default())
        } else {
            Err(DispatchError::NetworkTransient(result.errors.join("; ")))
        }
    }
}

/// Resolves a flushed batch's peer id into a channel id. The engine is
/// handed pre-opened channels keyed by `channel_id`; this crate does not
/// invent a peer-to-channel directory, so the default resolver treats the
/// hex encoding of `peer_id` as the channel id, matching how channels are
/// expected to be opened by the embedding application (see DESIGN.md).
pub fn default_channel_id_for_peer(peer_id: &[u8]) -> String {
    hex::encode(peer_id)
}

pub struct Supervisor {
    batcher: Arc<EventBatcher<TokioScheduler>>,
    channels: Arc<ChannelManager<ComposerDispatchSink>>,
    dispatcher: Arc<BroadcastDispatcher<HttpTransport>>,
    config: Config,
    events_processed: AtomicU64,
}

impl Supervisor {
    pub fn new(config: Config) -> eyre::Result<Arc<Self>> {
        let scheduler = Arc::new(TokioScheduler::new());
        let batcher_config = BatcherConfig {
            min_batch_size: config.batcher.min_batch_size,
            max_batch_size: config.batcher.max_batch_size,
            min_batch_timeout_ms: config.batcher.min_batch_timeout_ms,
            max_batch_timeout_ms: config.batcher.max_batch_timeout_ms,
            high_load_events_per_sec: config.batcher.high_load_events_per_sec,
            low_load_events_per_sec: config.batcher.low_load_events_per_sec,
            target_latency_ms: config.batcher.target_latency_ms,
            max_queue_size: config.batcher.max_queue_size,
            max_batches_in_memory: config.batcher.max_batches_in_memory,
            tuning_interval_ms: config.batcher.tuning_interval_ms,
            aggressive_tuning: config.batcher.aggressive_tuning,
            initial_batch_size: config.batcher.min_batch_size.max(1),
            initial_batch_timeout_ms: config.batcher.min_batch_timeout_ms.max(1),
        };
        let batcher = EventBatcher::new(batcher_config, scheduler);

        let network = Network::from_str(&config.composer.network)
            .map_err(|_| eyre::eyre!("unrecognized composer.network: {}", config.composer.network))?;
        let composer = ScriptComposer::new(config.composer.fee_rate_sat_per_byte, network);

        let transport = Arc::new(HttpTransport::new());
        let endpoints: Vec<Endpoint> = config
            .dispatcher
            .endpoints
            .iter()
            .map(|e| {
                let mut endpoint = Endpoint::new(e.name.clone(), e.url.clone(), e.credential.clone(), e.priority);
                endpoint.timeout = e.timeout();
                endpoint.max_retries = e.max_retries;
                endpoint.enabled = e.enabled;
                endpoint
            })
            .collect();
        let dispatcher_config = DispatcherConfig {
            default_timeout: config.dispatcher.default_timeout(),
            max_concurrent_broadcasts: config.dispatcher.max_concurrent_broadcasts,
            batch_size: config.dispatcher.batch_size,
            retry_backoff_ms: config.dispatcher.retry_backoff_ms,
            circuit_breaker_threshold: config.dispatcher.circuit_breaker_threshold,
            circuit_breaker_reset_time: config.dispatcher.circuit_breaker_reset_time(),
            rate_limit_per_second: config.dispatcher.rate_limit_per_second,
            max_queue_size: config.dispatcher.max_queue_size,
        };
        let dispatcher = Arc::new(BroadcastDispatcher::new(endpoints, transport, dispatcher_config));

        let sink = ComposerDispatchSink { composer, dispatcher: dispatcher.clone() };
        let retry_policy = RetryPolicy {
            max_retries: config.channel.settlement_max_retries,
            base_backoff: Duration::from_millis(config.channel.settlement_base_backoff_ms),
        };
        let withdrawal_limits = WithdrawalLimits {
            per_transaction: config.channel.withdrawal_per_transaction,
            daily: config.channel.withdrawal_daily,
        };
        let channels = Arc::new(ChannelManager::with_limits(sink, retry_policy, withdrawal_limits));

        let supervisor = Arc::new(Self {
            batcher: batcher.clone(),
            channels: channels.clone(),
            dispatcher,
            config,
            events_processed: AtomicU64::new(0),
        });

        let channels_for_hook = channels.clone();
        let standard_block_size = supervisor.config.channel.standard_block_size;
        let standard_rate = supervisor.config.channel.standard_rate;
        let min_payment = supervisor.config.channel.min_payment_amount;
        let max_payment = supervisor.config.channel.max_payment_amount;
        batcher.set_on_batch(Arc::new(move |batch| {
            for event in &batch.events {
                let channel_id = default_channel_id_for_peer(&event.peer_id);
                let price = crate::channel::price_for_block(
                    event.block_size,
                    standard_rate,
                    standard_block_size,
                    min_payment,
                    max_payment,
                );
                let Some(amount) = price else {
                    tracing::debug!(channel_id, block_size = event.block_size, "priced block below floor, skipping");
                    continue;
                };
                if let Err(err) = channels_for_hook.admit_payment(&channel_id, amount, event.block_index) {
                    tracing::warn!(channel_id, error = %err, "batched payment rejected by channel manager");
                }
            }
            tracing::info!(
                key = ?batch.key,
                count = batch.events.len(),
                reason = ?batch.reason,
                "batch drained into channel manager"
            );
        }));

        Ok(supervisor)
    }

    pub fn batcher(&self) -> &Arc<EventBatcher<TokioScheduler>> {
        &self.batcher
    }

    pub fn channels(&self) -> &Arc<ChannelManager<ComposerDispatchSink>> {
        &self.channels
    }

    pub fn dispatcher(&self) -> &Arc<BroadcastDispatcher<HttpTransport>> {
        &self.dispatcher
    }

    pub fn open_channel(&self, params: ChannelParams) -> Result<String, crate::error::ChannelError> {
        self.channels.open(params)
    }

    pub fn ingest(&self, event: PaymentEvent) -> Result<(), crate::error::BatcherError> {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
        self.batcher.ingest(event)
    }

    /// Runs the tuning tick and the dispatcher's queue-drain loop
    /// concurrently until `shutdown` resolves, then flushes every
    /// outstanding batch and drains the dispatcher's remaining queue with a
    /// grace period before returning.
    pub async fn run(self: &Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let tuning_interval = Duration::from_millis(self.config.batcher.tuning_interval_ms.max(1));
        let this = self.clone();
        let tuning_loop = async move {
            let mut interval = tokio::time::interval(tuning_interval);
            loop {
                interval.tick().await;
                this.batcher.tune();
            }
        };

        let this = self.clone();
        let drain_loop = async move {
            loop {
                if !this.dispatcher.drain_once().await {
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
            }
        };

        tokio::select! {
            _ = tuning_loop => {}
            _ = drain_loop => {}
            _ = shutdown.changed() => {
                tracing::info!("supervisor received shutdown signal");
            }
        }

        self.shutdown_gracefully().await;
    }

    async fn shutdown_gracefully(&self) {
        self.batcher.flush_all();
        for channel in self.channels.list_by_status(crate::channel::ChannelStatus::Open) {
            if let Err(err) = self.channels.settle(&channel.channel_id).await {
                tracing::error!(channel_id = %channel.channel_id, error = %err, "settlement failed during shutdown");
            }
        }
        self.dispatcher.drain(Duration::from_secs(5)).await;
        tracing::info!("supervisor shutdown complete");
    }

    /// Re-clamps the Batcher's adaptive parameters and replaces the
    /// Dispatcher's endpoint table without dropping in-flight work.
    pub fn reload_config(self: &Arc<Self>, new_config: Config) {
        let batcher_config = BatcherConfig {
            min_batch_size: new_config.batcher.min_batch_size,
            max_batch_size: new_config.batcher.max_batch_size,
            min_batch_timeout_ms: new_config.batcher.min_batch_timeout_ms,
            max_batch_timeout_ms: new_config.batcher.max_batch_timeout_ms,
            high_load_events_per_sec: new_config.batcher.high_load_events_per_sec,
            low_load_events_per_sec: new_config.batcher.low_load_events_per_sec,
            target_latency_ms: new_config.batcher.target_latency_ms,
            max_queue_size: new_config.batcher.max_queue_size,
            max_batches_in_memory: new_config.batcher.max_batches_in_memory,
            tuning_interval_ms: new_config.batcher.tuning_interval_ms,
            aggressive_tuning: new_config.batcher.aggressive_tuning,
            initial_batch_size: new_config.batcher.min_batch_size.max(1),
            initial_batch_timeout_ms: new_config.batcher.min_batch_timeout_ms.max(1),
        };
        self.batcher.update_config(batcher_config);

        let endpoints: Vec<Endpoint> = new_config
            .dispatcher
            .endpoints
            .iter()
            .map(|e| {
                let mut endpoint = Endpoint::new(e.name.clone(), e.url.clone(), e.credential.clone(), e.priority);
                endpoint.timeout = e.timeout();
                endpoint.max_retries = e.max_retries;
                endpoint.enabled = e.enabled;
                endpoint
            })
            .collect();
        self.dispatcher.replace_endpoints(endpoints);
        tracing::info!("configuration reloaded");
    }
}
