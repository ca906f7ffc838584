//! Replay protection: at-most-once spend of an authorization's nonce,
//! across process restarts.
//!
//! Lookups are three-valued. `Unknown` means the durable store could not
//! answer; callers must treat it as used (fail closed) rather than let a
//! store outage open a replay window.

use dashmap::DashMap;
use std::sync::Mutex;

use rusqlite::OptionalExtension;
use thiserror::Error;

/// Answer from a nonce lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceState {
    Used,
    Unused,
    /// The store could not answer. Callers treat this as used.
    Unknown,
}

#[derive(Debug, Error)]
pub enum NonceStoreError {
    #[error("nonce store unavailable: {0}")]
    Unavailable(String),
}

/// Normalize a `(payer, nonce)` pair into store keys. Payers are lowercased
/// 0x-hex; nonces are stored as the caller-normalized hex string, lowercased.
pub fn nonce_key(payer: &str, nonce: &str) -> (String, String) {
    (payer.to_ascii_lowercase(), nonce.to_ascii_lowercase())
}

/// Storage backend for used nonces. Implementations must be thread-safe.
pub trait NonceStore: Send + Sync {
    /// Look up a `(payer, nonce)` pair.
    fn lookup(&self, payer: &str, nonce: &str) -> NonceState;

    /// Record a nonce as spent. Idempotent: re-marking an existing pair is
    /// not an error. A hard failure here means replay protection is
    /// compromised; the settlement path fails loudly on it.
    fn mark_used(
        &self,
        payer: &str,
        nonce: &str,
        token: &str,
        tx_id: &str,
    ) -> Result<(), NonceStoreError>;

    /// Whether this store loses its contents on restart. Production boots
    /// refuse ephemeral stores.
    fn is_ephemeral(&self) -> bool {
        false
    }
}

/// In-memory nonce store backed by DashMap. Lost on restart; acceptable
/// only outside production.
pub struct InMemoryNonceStore {
    nonces: DashMap<(String, String), String>,
}

impl InMemoryNonceStore {
    pub fn new() -> Self {
        Self {
            nonces: DashMap::new(),
        }
    }
}

impl Default for InMemoryNonceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NonceStore for InMemoryNonceStore {
    fn lookup(&self, payer: &str, nonce: &str) -> NonceState {
        if self.nonces.contains_key(&nonce_key(payer, nonce)) {
            NonceState::Used
        } else {
            NonceState::Unused
        }
    }

    fn mark_used(
        &self,
        payer: &str,
        nonce: &str,
        _token: &str,
        tx_id: &str,
    ) -> Result<(), NonceStoreError> {
        self.nonces
            .entry(nonce_key(payer, nonce))
            .or_insert_with(|| tx_id.to_string());
        Ok(())
    }

    fn is_ephemeral(&self) -> bool {
        true
    }
}

/// Persistent nonce store backed by SQLite. Survives restarts.
pub struct SqliteNonceStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteNonceStore {
    /// Open (or create) the nonce database at the given path.
    pub fn open(path: &str) -> Result<Self, rusqlite::Error> {
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS nonces (
                payer TEXT NOT NULL,
                nonce TEXT NOT NULL,
                token_address TEXT NOT NULL,
                used_at INTEGER NOT NULL,
                tx_id TEXT NOT NULL,
                PRIMARY KEY (payer, nonce)
            );
            PRAGMA journal_mode=WAL;",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl NonceStore for SqliteNonceStore {
    fn lookup(&self, payer: &str, nonce: &str) -> NonceState {
        let (payer, nonce) = nonce_key(payer, nonce);
        let conn = match self.conn.lock() {
            Ok(conn) => conn,
            Err(_) => return NonceState::Unknown,
        };
        let row: Result<Option<i64>, _> = conn
            .query_row(
                "SELECT 1 FROM nonces WHERE payer = ?1 AND nonce = ?2",
                rusqlite::params![payer, nonce],
                |row| row.get(0),
            )
            .optional();
        match row {
            Ok(Some(_)) => NonceState::Used,
            Ok(None) => NonceState::Unused,
            Err(e) => {
                tracing::error!(error = %e, "nonce lookup failed, answering unknown");
                NonceState::Unknown
            }
        }
    }

    fn mark_used(
        &self,
        payer: &str,
        nonce: &str,
        token: &str,
        tx_id: &str,
    ) -> Result<(), NonceStoreError> {
        let (payer, nonce) = nonce_key(payer, nonce);
        let conn = self
            .conn
            .lock()
            .map_err(|_| NonceStoreError::Unavailable("lock poisoned".to_string()))?;
        let now = chrono::Utc::now().timestamp();
        // (payer, nonce) is the primary key; re-marking is a no-op.
        conn.execute(
            "INSERT OR IGNORE INTO nonces (payer, nonce, token_address, used_at, tx_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![payer, nonce, token.to_ascii_lowercase(), now, tx_id],
        )
        .map_err(|e| NonceStoreError::Unavailable(e.to_string()))?;
        Ok(())
    }
}
