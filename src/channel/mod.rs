//! Micropayment Channel Manager — owns per-peer streaming channels, enforces
//! balance and block-index safety, and drives settlement.
//!
//! Per-channel state lives behind a [`dashmap::DashMap`] keyed by channel
//! id; the entry API's shard guard totally orders concurrent
//! `admit_payment` calls against the same channel while leaving unrelated
//! channels free to proceed without contention (spec §5).

mod pricing;

pub use pricing::price_for_block;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{ChannelError, DispatchError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Open,
    Paused,
    Settling,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ChannelParams {
    pub channel_id: String,
    pub peer_public_id: String,
    pub local_address: String,
    pub remote_address: String,
    pub initial_local_balance: u64,
    pub initial_remote_balance: u64,
    pub rate_per_block: u64,
    pub max_balance: u64,
    pub funding_reference: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Channel {
    pub channel_id: String,
    pub peer_public_id: String,
    pub local_address: String,
    pub remote_address: String,
    pub local_balance: u64,
    pub remote_balance: u64,
    pub rate_per_block: u64,
    pub max_balance: u64,
    pub last_settled_block_index: Option<u64>,
    pub status: ChannelStatus,
    pub funding_reference: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Channel {
    fn from_params(params: ChannelParams) -> Self {
        Self {
            channel_id: params.channel_id,
            peer_public_id: params.peer_public_id,
            local_address: params.local_address,
            remote_address: params.remote_address,
            local_balance: params.initial_local_balance,
            remote_balance: params.initial_remote_balance,
            rate_per_block: params.rate_per_block,
            max_balance: params.max_balance,
            last_settled_block_index: None,
            status: ChannelStatus::Open,
            funding_reference: params.funding_reference,
            created_at: Utc::now(),
            expires_at: params.expires_at,
        }
    }
}

/// Read-only snapshot returned by `status`/`snapshot_all`; never aliases the
/// live channel state.
pub type ChannelSnapshot = Channel;

/// Hides the composer+dispatcher wiring behind one async call: the
/// Supervisor builds a concrete implementation over its `ScriptComposer` and
/// `BroadcastDispatcher`; the Channel Manager only needs a settlement
/// identifier or a `DispatchError` back.
#[async_trait]
pub trait SettlementSink: Send + Sync {
    async fn settle_channel(
        &self,
        channel_id: &str,
        local_address: &str,
        local_amount: u64,
        remote_address: &str,
        remote_amount: u64,
    ) -> Result<String, DispatchError>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(500),
        }
    }
}

/// Caps on the total value a single settlement may move on-chain, and on the
/// sum of settlements across a rolling UTC day, independent of any one
/// channel's own `max_balance`. These are operator-level safety rails, not
/// per-channel terms.
#[derive(Debug, Clone, Copy)]
pub struct WithdrawalLimits {
    pub per_transaction: u64,
    pub daily: u64,
}

impl Default for WithdrawalLimits {
    fn default() -> Self {
        Self {
            per_transaction: 10_000_000,
            daily: 100_000_000,
        }
    }
}

#[derive(Default)]
struct ChannelCounters {
    opened: AtomicU64,
    admitted: AtomicU64,
    rejected: AtomicU64,
    settled: AtomicU64,
}

pub struct ChannelManager<Sink: SettlementSink> {
    channels: DashMap<String, Channel>,
    sink: Sink,
    retry_policy: RetryPolicy,
    limits: WithdrawalLimits,
    daily_withdrawn: Mutex<(NaiveDate, u64)>,
    counters: ChannelCounters,
}

impl<Sink: SettlementSink> ChannelManager<Sink> {
    pub fn new(sink: Sink, retry_policy: RetryPolicy) -> Self {
        Self::with_limits(sink, retry_policy, WithdrawalLimits::default())
    }

    pub fn with_limits(sink: Sink, retry_policy: RetryPolicy, limits: WithdrawalLimits) -> Self {
        Self {
            channels: DashMap::new(),
            sink,
            retry_policy,
            limits,
            daily_withdrawn: Mutex::new((Utc::now().date_naive(), 0)),
            counters: ChannelCounters::default(),
        }
    }

    /// Checks the settlement amount against the per-transaction cap and
    /// reserves it against the rolling daily cap, rolling the daily counter
    /// over at UTC midnight. Reserves the full amount up front so concurrent
    /// settlements can't both observe headroom and jointly overshoot the cap.
    fn check_and_reserve_withdrawal(&self, amount: u64) -> Result<(), ChannelError> {
        if amount > self.limits.per_transaction {
            return Err(ChannelError::PerTransactionLimitExceeded {
                attempted: amount,
                limit: self.limits.per_transaction,
            });
        }
        let today = Utc::now().date_naive();
        let mut guard = self.daily_withdrawn.lock().unwrap();
        let (day, total) = &mut *guard;
        if *day != today {
            *day = today;
            *total = 0;
        }
        let remaining = self.limits.daily.saturating_sub(*total);
        if amount > remaining {
            return Err(ChannelError::DailyLimitExceeded {
                attempted: amount,
                remaining,
                limit: self.limits.daily,
            });
        }
        *total += amount;
        Ok(())
    }

    /// Creates an open channel with the given initial balance split.
    pub fn open(&self, params: ChannelParams) -> Result<String, ChannelError> {
        if params.initial_local_balance + params.initial_remote_balance > params.max_balance {
            return Err(ChannelError::InvalidParams(
                "initial balances exceed max_balance".into(),
            ));
        }
        if params.rate_per_block == 0 {
            return Err(ChannelError::InvalidParams("rate_per_block must be nonzero".into()));
        }
        let channel_id = params.channel_id.clone();
        match self.channels.entry(channel_id.clone()) {
            Entry::Occupied(_) => Err(ChannelError::DuplicateChannel(channel_id)),
            Entry::Vacant(vac) => {
                vac.insert(Channel::from_params(params));
                self.counters.opened.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_channel_opened();
                self.publish_open_channel_gauges();
                Ok(channel_id)
            }
        }
    }

    /// Refreshes the per-status open-channel gauges. Called after every
    /// status transition; cost is linear in channel count, acceptable at
    /// metrics-reporting frequency.
    fn publish_open_channel_gauges(&self) {
        let mut counts: HashMap<&'static str, i64> = HashMap::from([
            ("open", 0),
            ("paused", 0),
            ("settling", 0),
            ("closed", 0),
        ]);
        for entry in self.channels.iter() {
            let key = match entry.value().status {
                ChannelStatus::Open => "open",
                ChannelStatus::Paused => "paused",
                ChannelStatus::Settling => "settling",
                ChannelStatus::Closed => "closed",
            };
            *counts.get_mut(key).unwrap() += 1;
        }
        for (status, count) in counts {
            crate::metrics::set_open_channels(status, count);
        }
    }

    /// Atomically checks local-balance and block-index monotonicity, then
    /// applies the balance delta. Totally ordered per channel via the
    /// dashmap shard guard.
    pub fn admit_payment(&self, channel_id: &str, amount: u64, block_index: u64) -> Result<(), ChannelError> {
        let mut entry = self
            .channels
            .get_mut(channel_id)
            .ok_or_else(|| ChannelError::UnknownChannel(channel_id.to_string()))?;

        match entry.status {
            ChannelStatus::Paused => {
                return Err(ChannelError::ChannelPaused(channel_id.to_string()));
            }
            ChannelStatus::Closed | ChannelStatus::Settling => {
                return Err(ChannelError::ChannelClosed(channel_id.to_string()));
            }
            ChannelStatus::Open => {}
        }

        if let Some(last) = entry.last_settled_block_index {
            if block_index <= last {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_payment_rejected("nonmonotonic_block");
                tracing::warn!(channel_id, got = block_index, last_settled = last, "nonmonotonic block index");
                return Err(ChannelError::NonMonotonicBlock { got: block_index, last_settled: last });
            }
        }

        if amount > entry.local_balance {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_payment_rejected("insufficient_balance");
            tracing::warn!(channel_id, have = entry.local_balance, need = amount, "insufficient balance");
            return Err(ChannelError::InsufficientBalance {
                have: entry.local_balance,
                need: amount,
            });
        }

        entry.local_balance -= amount;
        entry.remote_balance += amount;
        entry.last_settled_block_index = Some(block_index);
        self.counters.admitted.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_payment_admitted("open");

        tracing::debug!(
            channel_id,
            amount,
            block_index,
            local_balance = entry.local_balance,
            remote_balance = entry.remote_balance,
            "payment admitted"
        );

        Ok(())
    }

    pub fn pause(&self, channel_id: &str) -> Result<(), ChannelError> {
        let mut entry = self
            .channels
            .get_mut(channel_id)
            .ok_or_else(|| ChannelError::UnknownChannel(channel_id.to_string()))?;
        let result = match entry.status {
            ChannelStatus::Open => {
                entry.status = ChannelStatus::Paused;
                Ok(())
            }
            ChannelStatus::Paused => Ok(()),
            _ => Err(ChannelError::ChannelClosed(channel_id.to_string())),
        };
        drop(entry);
        self.publish_open_channel_gauges();
        result
    }

    pub fn resume(&self, channel_id: &str) -> Result<(), ChannelError> {
        let mut entry = self
            .channels
            .get_mut(channel_id)
            .ok_or_else(|| ChannelError::UnknownChannel(channel_id.to_string()))?;
        let result = match entry.status {
            ChannelStatus::Paused => {
                entry.status = ChannelStatus::Open;
                Ok(())
            }
            ChannelStatus::Open => Ok(()),
            _ => Err(ChannelError::ChannelClosed(channel_id.to_string())),
        };
        drop(entry);
        self.publish_open_channel_gauges();
        result
    }

    /// Returns a snapshot; never mutates.
    pub fn status(&self, channel_id: &str) -> Result<ChannelSnapshot, ChannelError> {
        self.channels
            .get(channel_id)
            .map(|c| c.clone())
            .ok_or_else(|| ChannelError::UnknownChannel(channel_id.to_string()))
    }

    pub fn snapshot_all(&self) -> Vec<ChannelSnapshot> {
        self.channels.iter().map(|e| e.value().clone()).collect()
    }

    pub fn list_by_status(&self, status: ChannelStatus) -> Vec<ChannelSnapshot> {
        self.channels
            .iter()
            .filter(|e| e.value().status == status)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Transitions to settling, requests settlement via the `SettlementSink`
    /// with retry-with-backoff on retryable Dispatcher errors, then
    /// transitions to closed.
    pub async fn settle(&self, channel_id: &str) -> Result<String, ChannelError> {
        let (local_address, remote_address, local_amount, remote_amount) = {
            let mut entry = self
                .channels
                .get_mut(channel_id)
                .ok_or_else(|| ChannelError::UnknownChannel(channel_id.to_string()))?;
            match entry.status {
                ChannelStatus::Closed => return Err(ChannelError::ChannelClosed(channel_id.to_string())),
                ChannelStatus::Settling => return Err(ChannelError::ChannelClosed(channel_id.to_string())),
                _ => {}
            }
            let withdrawal_total = entry.local_balance + entry.remote_balance;
            self.check_and_reserve_withdrawal(withdrawal_total)?;
            entry.status = ChannelStatus::Settling;
            (
                entry.local_address.clone(),
                entry.remote_address.clone(),
                entry.local_balance,
                entry.remote_balance,
            )
        };
        self.publish_open_channel_gauges();

        let mut attempt = 0u32;
        let mut last_error = None;
        loop {
            match self
                .sink
                .settle_channel(channel_id, &local_address, local_amount, &remote_address, remote_amount)
                .await
            {
                Ok(settlement_id) => {
                    if let Some(mut entry) = self.channels.get_mut(channel_id) {
                        entry.status = ChannelStatus::Closed;
                    }
                    self.counters.settled.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_settlement(true);
                    self.publish_open_channel_gauges();
                    return Ok(settlement_id);
                }
                Err(err) if err.is_retryable() && attempt < self.retry_policy.max_retries => {
                    last_error = Some(err);
                    let backoff = self.retry_policy.base_backoff * 2u32.pow(attempt);
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => {
                    // Channel state is never mutated speculatively: it stays
                    // `Settling` so an operator can retry settlement later
                    // rather than silently reopening it.
                    crate::metrics::record_settlement(false);
                    return Err(ChannelError::SettlementFailed(format!(
                        "{err} (after {attempt} retries, last: {:?})",
                        last_error
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn params(id: &str) -> ChannelParams {
        ChannelParams {
            channel_id: id.to_string(),
            peer_public_id: "peer-1".to_string(),
            local_address: "1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2".to_string(),
            remote_address: "1111111111111111111114oLvT2".to_string(),
            initial_local_balance: 50,
            initial_remote_balance: 0,
            rate_per_block: 17,
            max_balance: 50,
            funding_reference: "fund-1".to_string(),
            expires_at: Utc::now() + chrono::Duration::days(1),
        }
    }

    struct AlwaysSucceeds;
    #[async_trait]
    impl SettlementSink for AlwaysSucceeds {
        async fn settle_channel(&self, _: &str, _: &str, _: u64, _: &str, _: u64) -> Result<String, DispatchError> {
            Ok("tx-1".repeat(16)[..64].to_string())
        }
    }

    struct FailsNTimesThenSucceeds {
        remaining_failures: AtomicU32,
    }
    #[async_trait]
    impl SettlementSink for FailsNTimesThenSucceeds {
        async fn settle_channel(&self, _: &str, _: &str, _: u64, _: &str, _: u64) -> Result<String, DispatchError> {
            if self.remaining_failures.fetch_sub(1, Ordering::SeqCst) > 0 {
                Err(DispatchError::Timeout)
            } else {
                Ok("settled".to_string())
            }
        }
    }

    struct AlwaysPermanentFailure;
    #[async_trait]
    impl SettlementSink for AlwaysPermanentFailure {
        async fn settle_channel(&self, _: &str, _: &str, _: u64, _: &str, _: u64) -> Result<String, DispatchError> {
            Err(DispatchError::MalformedTransaction("bad script".into()))
        }
    }

    #[test]
    fn channel_safety_scenario() {
        let manager = ChannelManager::new(AlwaysSucceeds, RetryPolicy::default());
        manager.open(params("c1")).unwrap();

        manager.admit_payment("c1", 17, 0).unwrap();
        manager.admit_payment("c1", 17, 1).unwrap();
        let result = manager.admit_payment("c1", 17, 2);

        assert!(matches!(result, Err(ChannelError::InsufficientBalance { .. })));
        let snapshot = manager.status("c1").unwrap();
        assert_eq!(snapshot.local_balance, 16);
        assert_eq!(snapshot.remote_balance, 34);
        assert_eq!(snapshot.last_settled_block_index, Some(1));
    }

    #[test]
    fn duplicate_channel_is_rejected() {
        let manager = ChannelManager::new(AlwaysSucceeds, RetryPolicy::default());
        manager.open(params("c1")).unwrap();
        assert!(matches!(manager.open(params("c1")), Err(ChannelError::DuplicateChannel(_))));
    }

    #[test]
    fn nonmonotonic_block_index_is_rejected() {
        let manager = ChannelManager::new(AlwaysSucceeds, RetryPolicy::default());
        manager.open(params("c1")).unwrap();
        manager.admit_payment("c1", 10, 5).unwrap();
        let result = manager.admit_payment("c1", 10, 5);
        assert!(matches!(result, Err(ChannelError::NonMonotonicBlock { .. })));
    }

    #[test]
    fn paused_channel_rejects_payments() {
        let manager = ChannelManager::new(AlwaysSucceeds, RetryPolicy::default());
        manager.open(params("c1")).unwrap();
        manager.pause("c1").unwrap();
        assert!(matches!(manager.admit_payment("c1", 1, 0), Err(ChannelError::ChannelPaused(_))));
        manager.resume("c1").unwrap();
        manager.admit_payment("c1", 1, 0).unwrap();
    }

    #[tokio::test]
    async fn settle_retries_on_retryable_error_then_succeeds() {
        let sink = FailsNTimesThenSucceeds { remaining_failures: AtomicU32::new(2) };
        let manager = ChannelManager::new(
            sink,
            RetryPolicy { max_retries: 3, base_backoff: Duration::from_millis(1) },
        );
        manager.open(params("c1")).unwrap();
        let result = manager.settle("c1").await;
        assert_eq!(result.unwrap(), "settled");
        assert_eq!(manager.status("c1").unwrap().status, ChannelStatus::Closed);
    }

    #[tokio::test]
    async fn settle_surfaces_non_retryable_error_without_reopening_channel() {
        let manager = ChannelManager::new(AlwaysPermanentFailure, RetryPolicy::default());
        manager.open(params("c1")).unwrap();
        let result = manager.settle("c1").await;
        assert!(result.is_err());
        // never mutated speculatively: stays in Settling, not silently reopened.
        assert_eq!(manager.status("c1").unwrap().status, ChannelStatus::Settling);
    }

    #[test]
    fn unknown_channel_surfaces_error() {
        let manager = ChannelManager::new(AlwaysSucceeds, RetryPolicy::default());
        assert!(matches!(manager.admit_payment("ghost", 1, 0), Err(ChannelError::UnknownChannel(_))));
    }

    #[tokio::test]
    async fn settle_rejects_withdrawal_over_per_transaction_limit() {
        let manager = ChannelManager::with_limits(
            AlwaysSucceeds,
            RetryPolicy::default(),
            WithdrawalLimits { per_transaction: 10, daily: 1_000 },
        );
        manager.open(params("c1")).unwrap();
        let result = manager.settle("c1").await;
        assert!(matches!(result, Err(ChannelError::PerTransactionLimitExceeded { attempted: 50, limit: 10 })));
        // rejected before any speculative state change
        assert_eq!(manager.status("c1").unwrap().status, ChannelStatus::Open);
    }

    #[tokio::test]
    async fn settle_rejects_withdrawal_over_remaining_daily_limit() {
        let manager = ChannelManager::with_limits(
            AlwaysSucceeds,
            RetryPolicy::default(),
            WithdrawalLimits { per_transaction: 1_000, daily: 60 },
        );
        manager.open(params("c1")).unwrap();
        manager.open(params("c2")).unwrap();

        // c1's settlement (total value 50) consumes most of the daily cap.
        manager.settle("c1").await.unwrap();
        // c2's settlement would need another 50, but only 10 remains.
        let result = manager.settle("c2").await;
        assert!(matches!(result, Err(ChannelError::DailyLimitExceeded { attempted: 50, remaining: 10, .. })));
        assert_eq!(manager.status("c2").unwrap().status, ChannelStatus::Open);
    }
}
