//! Abstract transport the Dispatcher submits through. Production code uses
//! [`HttpTransport`]; tests use [`FakeTransport`] to script specific
//! failure/success sequences without a network.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::DispatchError;

#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub tx_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnChainStatus {
    Unknown,
    Pending,
    Confirmed { height: u64 },
    Failed,
}

/// The only thing the Dispatcher depends on for actually reaching an
/// endpoint: `submit` and `status`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn submit(&self, endpoint_url: &str, tx: &[u8], timeout: Duration) -> Result<SubmitOutcome, DispatchError>;
    async fn status(&self, endpoint_url: &str, tx_id: &str) -> Result<OnChainStatus, DispatchError>;
}

/// Default production transport: submits the raw transaction bytes as an
/// HTTP POST body and polls status via GET.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn submit(&self, endpoint_url: &str, tx: &[u8], timeout: Duration) -> Result<SubmitOutcome, DispatchError> {
        let response = tokio::time::timeout(
            timeout,
            self.client
                .post(endpoint_url)
                .header("content-type", "application/octet-stream")
                .body(tx.to_vec())
                .send(),
        )
        .await
        .map_err(|_| DispatchError::Timeout)?
        .map_err(|e| classify_reqwest_error(&e))?;

        if response.status().is_success() {
            let tx_id = response.text().await.unwrap_or_default().trim().to_string();
            Ok(SubmitOutcome { tx_id })
        } else if response.status().as_u16() == 401 || response.status().as_u16() == 403 {
            Err(DispatchError::AuthFailure(endpoint_url.to_string()))
        } else if response.status().is_server_error() {
            Err(DispatchError::NetworkTransient(format!("http {}", response.status())))
        } else {
            Err(DispatchError::PolicyRejected(format!("http {}", response.status())))
        }
    }

    async fn status(&self, endpoint_url: &str, tx_id: &str) -> Result<OnChainStatus, DispatchError> {
        let url = format!("{endpoint_url}/status/{tx_id}");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;
        if !response.status().is_success() {
            return Ok(OnChainStatus::Unknown);
        }
        let body = response.text().await.unwrap_or_default();
        Ok(match body.trim() {
            "confirmed" => OnChainStatus::Confirmed { height: 0 },
            "pending" => OnChainStatus::Pending,
            "failed" => OnChainStatus::Failed,
            _ => OnChainStatus::Unknown,
        })
    }
}

fn classify_reqwest_error(err: &reqwest::Error) -> DispatchError {
    if err.is_timeout() {
        DispatchError::Timeout
    } else if err.is_connect() {
        DispatchError::NetworkTransient(err.to_string())
    } else {
        DispatchError::NetworkTransient(err.to_string())
    }
}

/// A scripted in-memory transport for tests: each endpoint URL maps to a
/// queue of outcomes consumed in order, looping the last entry once
/// exhausted.
pub struct FakeTransport {
    scripts: Mutex<std::collections::HashMap<String, Vec<Result<SubmitOutcome, DispatchError>>>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self { scripts: Mutex::new(std::collections::HashMap::new()) }
    }

    pub fn script(&self, endpoint_url: &str, outcomes: Vec<Result<SubmitOutcome, DispatchError>>) {
        self.scripts.lock().unwrap().insert(endpoint_url.to_string(), outcomes);
    }
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn submit(&self, endpoint_url: &str, _tx: &[u8], _timeout: Duration) -> Result<SubmitOutcome, DispatchError> {
        let mut scripts = self.scripts.lock().unwrap();
        let queue = scripts
            .get_mut(endpoint_url)
            .ok_or_else(|| DispatchError::NetworkTransient("no script for endpoint".into()))?;
        if queue.is_empty() {
            return Err(DispatchError::NetworkTransient("script exhausted".into()));
        }
        if queue.len() == 1 {
            queue[0].clone()
        } else {
            queue.remove(0)
        }
    }

    async fn status(&self, _endpoint_url: &str, _tx_id: &str) -> Result<OnChainStatus, DispatchError> {
        Ok(OnChainStatus::Confirmed { height: 1 })
    }
}
