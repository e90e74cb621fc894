//! Contracts for the systems this crate treats as external collaborators:
//! the signer, chain tracker, document store, wallet authorization dialog,
//! and key derivation service named in §6. The embedding application wires
//! real implementations; this crate ships only in-memory test doubles.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// Signs an assembled transaction. Production implementations typically hold
/// a hardware wallet handle or a hot-key store; neither is this crate's
/// concern.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, unsigned_tx: &[u8]) -> Result<Vec<u8>, String>;
}

/// Reports best-known chain height for an endpoint. Optional: only consumed
/// by `Dispatcher::status` polling, never required for broadcast itself.
#[async_trait]
pub trait ChainTracker: Send + Sync {
    async fn best_height(&self, endpoint_name: &str) -> Result<u64, String>;
}

/// A single audit or snapshot record persisted by the document store.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AuditRecord {
    pub kind: String,
    pub at: chrono::DateTime<chrono::Utc>,
    pub amount: u64,
    pub tx_id: Option<String>,
    pub channel_id: Option<String>,
    pub peer_id: Option<String>,
    pub outcome: String,
}

/// Minimal persistence contract: insert, find, update. Real deployments back
/// this with whatever document store they already operate; this crate never
/// assumes a particular engine.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert_one(&self, record: AuditRecord) -> Result<(), String>;
    async fn find(&self, channel_id: &str) -> Result<Vec<AuditRecord>, String>;
    async fn update_one(&self, channel_id: &str, outcome: String) -> Result<(), String>;
}

/// A time-bounded authorization from a user allowing micropayments up to a
/// limit, returned by the wallet's authorization dialog.
#[derive(Debug, Clone)]
pub struct AuthorizationGrant {
    pub grant_token: String,
    pub user_id: String,
    pub max_amount: u64,
    pub allowed_purposes: Vec<String>,
    pub issued_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

impl AuthorizationGrant {
    pub fn covers(&self, purpose: &str, amount: u64, now: chrono::DateTime<chrono::Utc>) -> bool {
        now < self.expires_at
            && amount <= self.max_amount
            && self.allowed_purposes.iter().any(|p| p == purpose)
    }
}

/// Prompts the user-facing wallet for a spending grant.
#[async_trait]
pub trait AuthorizationDialog: Send + Sync {
    async fn request_grant(&self, purpose: &str, max_amount: u64) -> Result<AuthorizationGrant, String>;
}

/// Derives per-content session/encryption keys by path, consumed by the
/// Composer when building streaming locks.
#[async_trait]
pub trait KeyDerivation: Send + Sync {
    async fn derive(&self, path: &str) -> Result<[u8; 32], String>;
}

/// In-memory `DocumentStore` double: keeps everything in a `Vec` behind a
/// mutex. Sufficient for tests that assert audit-record shape, not a
/// production storage engine.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    records: Mutex<Vec<AuditRecord>>,
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn insert_one(&self, record: AuditRecord) -> Result<(), String> {
        self.records.lock().unwrap().push(record);
        Ok(())
    }

    async fn find(&self, channel_id: &str) -> Result<Vec<AuditRecord>, String> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.channel_id.as_deref() == Some(channel_id))
            .cloned()
            .collect())
    }

    async fn update_one(&self, channel_id: &str, outcome: String) -> Result<(), String> {
        let mut records = self.records.lock().unwrap();
        if let Some(r) = records
            .iter_mut()
            .rev()
            .find(|r| r.channel_id.as_deref() == Some(channel_id))
        {
            r.outcome = outcome;
            Ok(())
        } else {
            Err(format!("no record for channel {channel_id}"))
        }
    }
}

/// In-memory `Signer` double that "signs" by appending a fixed suffix.
/// Strictly for tests exercising the settlement pipeline end to end without
/// a real signer.
pub struct NullSigner;

#[async_trait]
impl Signer for NullSigner {
    async fn sign(&self, unsigned_tx: &[u8]) -> Result<Vec<u8>, String> {
        let mut signed = unsigned_tx.to_vec();
        signed.extend_from_slice(b"\x00SIGNED");
        Ok(signed)
    }
}

/// In-memory `KeyDerivation` double, deterministic per path for reproducible
/// tests.
#[derive(Default)]
pub struct FixedKeyDerivation {
    keys: Mutex<HashMap<String, [u8; 32]>>,
}

#[async_trait]
impl KeyDerivation for FixedKeyDerivation {
    async fn derive(&self, path: &str) -> Result<[u8; 32], String> {
        let mut keys = self.keys.lock().unwrap();
        Ok(*keys.entry(path.to_string()).or_insert_with(|| {
            let mut key = [0u8; 32];
            for (i, b) in path.bytes().enumerate().take(32) {
                key[i] = b;
            }
            key
        }))
    }
}
