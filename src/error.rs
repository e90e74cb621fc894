//! Per-subsystem error types.
//!
//! Each core subsystem gets its own typed error enum rather than one
//! monolithic error, matching the granularity of the error-kind policy table:
//! callers branch on retryability per subsystem, not on a single flat variant
//! set.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BatcherError {
    #[error("per-key queue overflow for key {0:?}")]
    RejectedOverflow(String),
    #[error("batcher is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("invalid channel parameters: {0}")]
    InvalidParams(String),
    #[error("insufficient funds to open channel")]
    InsufficientFunds,
    #[error("channel {0} already exists")]
    DuplicateChannel(String),
    #[error("unknown channel {0}")]
    UnknownChannel(String),
    #[error("admit-payment exceeds local balance (have {have}, need {need})")]
    InsufficientBalance { have: u64, need: u64 },
    #[error("block-index {got} is not greater than last-settled {last_settled}")]
    NonMonotonicBlock { got: u64, last_settled: u64 },
    #[error("channel {0} is paused")]
    ChannelPaused(String),
    #[error("channel {0} is closed")]
    ChannelClosed(String),
    #[error("settlement failed after retries: {0}")]
    SettlementFailed(String),
    #[error("withdrawal of {attempted} exceeds per-transaction limit {limit}")]
    PerTransactionLimitExceeded { attempted: u64, limit: u64 },
    #[error("withdrawal of {attempted} would exceed remaining daily limit {remaining} (daily cap {limit})")]
    DailyLimitExceeded { attempted: u64, remaining: u64, limit: u64 },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("broadcast queue is full")]
    QueueFull,
    #[error("rate limit exceeded for this second")]
    RateLimited,
    #[error("circuit breaker open on all candidate endpoints")]
    CircuitOpen { retryable: bool },
    #[error("attempt exceeded its deadline")]
    Timeout,
    #[error("transient network error: {0}")]
    NetworkTransient(String),
    #[error("authentication rejected by endpoint {0}")]
    AuthFailure(String),
    #[error("malformed transaction: {0}")]
    MalformedTransaction(String),
    #[error("permanent policy rejection: {0}")]
    PolicyRejected(String),
    #[error("no endpoints configured")]
    NoEndpoints,
    #[error("dispatcher is draining/shutting down")]
    ShuttingDown,
}

impl DispatchError {
    /// Whether the retry loop should absorb this error or surface it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::Timeout
                | DispatchError::NetworkTransient(_)
                | DispatchError::CircuitOpen { retryable: true }
        )
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ComposerError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("invalid content hash: {0}")]
    InvalidHash(String),
    #[error("batch events do not share a recipient")]
    MixedRecipients,
    #[error("batch is empty")]
    EmptyBatch,
    #[error("batch total {total} does not equal sum of amounts {sum}")]
    TotalMismatch { total: u64, sum: u64 },
}
