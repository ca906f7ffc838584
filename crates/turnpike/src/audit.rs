//! Durable audit log: one record per attempted settlement.
//!
//! The orchestrator owns each record's lifecycle end to end; this store is a
//! dumb persister. Records are append-only and advance `pending -> success`
//! or `pending -> failed`; any other transition is refused here rather than
//! trusted to callers.

use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::payment::PaymentProtocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Success,
    Failed,
}

impl TxStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("audit store lock poisoned")]
    LockPoisoned,

    #[error("a {status} record already exists for this (payer, nonce)")]
    Duplicate { status: TxStatus },

    #[error("record {id} is not pending; refusing transition")]
    IllegalTransition { id: i64 },

    #[error("record {id} not found")]
    NotFound { id: i64 },
}

/// Fields fixed at record creation.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub nonce: String,
    pub payer: String,
    pub receiver: String,
    pub token_address: String,
    pub token_symbol: String,
    pub amount: String,
    pub fee: String,
    pub fee_bps: u32,
    pub network: String,
    pub protocol: PaymentProtocol,
}

/// A persisted settlement attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub id: i64,
    pub nonce: String,
    pub payer: String,
    pub receiver: String,
    pub token_address: String,
    pub token_symbol: String,
    pub amount: String,
    pub fee: String,
    pub fee_bps: u32,
    pub network: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_tx_id: Option<String>,
    pub status: TxStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    pub protocol: PaymentProtocol,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<i64>,
}

/// Partial update applied by the orchestrator as a settlement progresses.
#[derive(Debug, Clone, Default)]
pub struct TransactionPatch {
    pub status: Option<TxStatus>,
    pub ledger_tx_id: Option<String>,
    pub error_reason: Option<String>,
    pub settled_at: Option<i64>,
}

/// Aggregate statistics over the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementStats {
    pub total: i64,
    pub successful: i64,
    pub failed: i64,
    pub pending: i64,
    /// Gross volume of successful settlements, smallest unit, decimal string.
    pub total_volume: String,
    /// Fees collected on successful settlements, decimal string.
    pub total_fees: String,
    /// Gross successful volume per token symbol.
    pub volume_by_symbol: std::collections::HashMap<String, String>,
}

/// SQLite-backed audit log.
#[derive(Clone)]
pub struct AuditLog {
    conn: Arc<Mutex<Connection>>,
}

impl AuditLog {
    pub fn open(path: &str) -> Result<Self, AuditError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// In-memory log for tests and non-production boots.
    pub fn in_memory() -> Result<Self, AuditError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, AuditError> {
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                nonce TEXT NOT NULL,
                payer TEXT NOT NULL,
                receiver TEXT NOT NULL,
                token_address TEXT NOT NULL,
                token_symbol TEXT NOT NULL,
                amount TEXT NOT NULL,
                fee TEXT NOT NULL,
                fee_bps INTEGER NOT NULL,
                network TEXT NOT NULL,
                tx_id TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                error_reason TEXT,
                protocol TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                settled_at INTEGER,
                UNIQUE (payer, nonce)
            )
            "#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_transactions_created ON transactions(created_at)",
            [],
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, AuditError> {
        self.conn.lock().map_err(|_| AuditError::LockPoisoned)
    }

    /// Open a pending record for a settlement attempt.
    ///
    /// `(payer, nonce)` is unique across the log. A prior `failed` attempt
    /// for the same pair is reopened in place (a timed-out authorization may
    /// legitimately be retried), while `pending` and `success` rows refuse
    /// the duplicate.
    pub fn create(&self, tx: &NewTransaction) -> Result<i64, AuditError> {
        let conn = self.lock()?;
        let now = chrono::Utc::now().timestamp();
        let payer = tx.payer.to_ascii_lowercase();

        let existing: Option<(i64, String)> = conn
            .query_row(
                "SELECT id, status FROM transactions WHERE payer = ?1 AND nonce = ?2",
                params![payer, tx.nonce],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((id, status)) = existing {
            let status = TxStatus::from_str(&status).unwrap_or(TxStatus::Pending);
            if status != TxStatus::Failed {
                return Err(AuditError::Duplicate { status });
            }
            conn.execute(
                r#"
                UPDATE transactions
                SET amount = ?2, fee = ?3, fee_bps = ?4, status = 'pending',
                    tx_id = NULL, error_reason = NULL, settled_at = NULL,
                    created_at = ?5
                WHERE id = ?1
                "#,
                params![id, tx.amount, tx.fee, tx.fee_bps, now],
            )?;
            return Ok(id);
        }

        conn.execute(
            r#"
            INSERT INTO transactions
                (nonce, payer, receiver, token_address, token_symbol, amount,
                 fee, fee_bps, network, status, protocol, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending', ?10, ?11)
            "#,
            params![
                tx.nonce,
                payer,
                tx.receiver.to_ascii_lowercase(),
                tx.token_address.to_ascii_lowercase(),
                tx.token_symbol,
                tx.amount,
                tx.fee,
                tx.fee_bps,
                tx.network,
                tx.protocol.as_str(),
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Apply a patch. Status changes are only accepted on pending records,
    /// enforcing the pending -> terminal state machine at the store.
    pub fn update(&self, id: i64, patch: &TransactionPatch) -> Result<(), AuditError> {
        let conn = self.lock()?;

        if let Some(status) = patch.status {
            let affected = conn.execute(
                r#"
                UPDATE transactions
                SET status = ?2,
                    tx_id = COALESCE(?3, tx_id),
                    error_reason = COALESCE(?4, error_reason),
                    settled_at = COALESCE(?5, settled_at)
                WHERE id = ?1 AND status = 'pending'
                "#,
                params![
                    id,
                    status.as_str(),
                    patch.ledger_tx_id,
                    patch.error_reason,
                    patch.settled_at
                ],
            )?;
            if affected == 0 {
                return Err(AuditError::IllegalTransition { id });
            }
            return Ok(());
        }

        let affected = conn.execute(
            r#"
            UPDATE transactions
            SET tx_id = COALESCE(?2, tx_id),
                error_reason = COALESCE(?3, error_reason),
                settled_at = COALESCE(?4, settled_at)
            WHERE id = ?1
            "#,
            params![id, patch.ledger_tx_id, patch.error_reason, patch.settled_at],
        )?;
        if affected == 0 {
            return Err(AuditError::NotFound { id });
        }
        Ok(())
    }

    /// Record the ledger id of a just-submitted spend, without touching
    /// status. Only fills an empty slot: a terminal patch that has already
    /// written the final ledger id wins over this in-flight note.
    pub fn record_ledger_tx(&self, id: i64, tx_id: &str) -> Result<(), AuditError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE transactions SET tx_id = COALESCE(tx_id, ?2) WHERE id = ?1",
            params![id, tx_id],
        )?;
        Ok(())
    }

    pub fn read(&self, id: i64) -> Result<Option<TransactionRecord>, AuditError> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                &format!("{SELECT_RECORD} WHERE id = ?1"),
                params![id],
                map_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Most recent records, newest first.
    pub fn recent(&self, limit: u32) -> Result<Vec<TransactionRecord>, AuditError> {
        let limit = limit.clamp(1, 500);
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{SELECT_RECORD} ORDER BY created_at DESC, id DESC LIMIT ?1"
        ))?;
        let records = stmt
            .query_map(params![limit], map_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn stats(&self) -> Result<SettlementStats, AuditError> {
        let conn = self.lock()?;

        let (total, successful, failed, pending) = conn.query_row(
            r#"
            SELECT COUNT(*),
                   COUNT(*) FILTER (WHERE status = 'success'),
                   COUNT(*) FILTER (WHERE status = 'failed'),
                   COUNT(*) FILTER (WHERE status = 'pending')
            FROM transactions
            "#,
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )?;

        let mut stmt = conn.prepare(
            "SELECT amount, fee, token_symbol FROM transactions WHERE status = 'success'",
        )?;
        let mut total_volume: u128 = 0;
        let mut total_fees: u128 = 0;
        let mut by_symbol: std::collections::HashMap<String, u128> =
            std::collections::HashMap::new();
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        for row in rows {
            let (amount, fee, symbol) = row?;
            let amount: u128 = amount.parse().unwrap_or(0);
            let fee: u128 = fee.parse().unwrap_or(0);
            total_volume = total_volume.saturating_add(amount);
            total_fees = total_fees.saturating_add(fee);
            let entry = by_symbol.entry(symbol).or_insert(0);
            *entry = entry.saturating_add(amount);
        }

        Ok(SettlementStats {
            total,
            successful,
            failed,
            pending,
            total_volume: total_volume.to_string(),
            total_fees: total_fees.to_string(),
            volume_by_symbol: by_symbol
                .into_iter()
                .map(|(k, v)| (k, v.to_string()))
                .collect(),
        })
    }
}

const SELECT_RECORD: &str = r#"
    SELECT id, nonce, payer, receiver, token_address, token_symbol, amount,
           fee, fee_bps, network, tx_id, status, error_reason, protocol,
           created_at, settled_at
    FROM transactions
"#;

fn map_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<TransactionRecord> {
    let status: String = row.get(11)?;
    let protocol: String = row.get(13)?;
    Ok(TransactionRecord {
        id: row.get(0)?,
        nonce: row.get(1)?,
        payer: row.get(2)?,
        receiver: row.get(3)?,
        token_address: row.get(4)?,
        token_symbol: row.get(5)?,
        amount: row.get(6)?,
        fee: row.get(7)?,
        fee_bps: row.get(8)?,
        network: row.get(9)?,
        ledger_tx_id: row.get(10)?,
        status: TxStatus::from_str(&status).unwrap_or(TxStatus::Failed),
        error_reason: row.get(12)?,
        protocol: if protocol == "witness-spend" {
            PaymentProtocol::WitnessSpend
        } else {
            PaymentProtocol::DirectAuth
        },
        created_at: row.get(14)?,
        settled_at: row.get(15)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_tx(nonce: &str) -> NewTransaction {
        NewTransaction {
            nonce: nonce.to_string(),
            payer: "0xAAAAaaaaAAAAaaaaAAAAaaaaAAAAaaaaAAAAaaaa".to_string(),
            receiver: "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb".to_string(),
            token_address: "0x833589fcd6edb6e08f4c7c32d4f71b54bda02913".to_string(),
            token_symbol: "USDC".to_string(),
            amount: "1000000".to_string(),
            fee: "1000".to_string(),
            fee_bps: 10,
            network: "eip155:8453".to_string(),
            protocol: PaymentProtocol::DirectAuth,
        }
    }

    #[test]
    fn test_create_and_read() {
        let log = AuditLog::in_memory().unwrap();
        let id = log.create(&new_tx("0x01")).unwrap();

        let record = log.read(id).unwrap().unwrap();
        assert_eq!(record.status, TxStatus::Pending);
        assert_eq!(record.amount, "1000000");
        assert_eq!(record.payer, "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        assert!(record.settled_at.is_none());
    }

    #[test]
    fn test_pending_to_success() {
        let log = AuditLog::in_memory().unwrap();
        let id = log.create(&new_tx("0x01")).unwrap();

        log.update(
            id,
            &TransactionPatch {
                status: Some(TxStatus::Success),
                ledger_tx_id: Some("0xhash".to_string()),
                settled_at: Some(chrono::Utc::now().timestamp()),
                ..Default::default()
            },
        )
        .unwrap();

        let record = log.read(id).unwrap().unwrap();
        assert_eq!(record.status, TxStatus::Success);
        assert_eq!(record.ledger_tx_id.as_deref(), Some("0xhash"));
        assert!(record.settled_at.is_some());
    }

    #[test]
    fn test_terminal_records_refuse_transitions() {
        let log = AuditLog::in_memory().unwrap();
        let id = log.create(&new_tx("0x01")).unwrap();

        log.update(
            id,
            &TransactionPatch {
                status: Some(TxStatus::Failed),
                error_reason: Some("simulation failed".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

        // failed -> success must be refused
        let result = log.update(
            id,
            &TransactionPatch {
                status: Some(TxStatus::Success),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(AuditError::IllegalTransition { .. })));
    }

    #[test]
    fn test_duplicate_pending_rejected() {
        let log = AuditLog::in_memory().unwrap();
        log.create(&new_tx("0x01")).unwrap();
        let result = log.create(&new_tx("0x01"));
        assert!(matches!(
            result,
            Err(AuditError::Duplicate {
                status: TxStatus::Pending
            })
        ));
    }

    #[test]
    fn test_failed_record_reopens_for_retry() {
        let log = AuditLog::in_memory().unwrap();
        let id = log.create(&new_tx("0x01")).unwrap();
        log.update(
            id,
            &TransactionPatch {
                status: Some(TxStatus::Failed),
                error_reason: Some("timeout".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

        let reopened = log.create(&new_tx("0x01")).unwrap();
        assert_eq!(reopened, id);
        let record = log.read(id).unwrap().unwrap();
        assert_eq!(record.status, TxStatus::Pending);
        assert!(record.error_reason.is_none());
    }

    #[test]
    fn test_recent_newest_first() {
        let log = AuditLog::in_memory().unwrap();
        let a = log.create(&new_tx("0x01")).unwrap();
        let b = log.create(&new_tx("0x02")).unwrap();
        let recent = log.recent(10).unwrap();
        assert_eq!(recent.len(), 2);
        // Same created_at second is possible; id breaks the tie.
        assert_eq!(recent[0].id, b);
        assert_eq!(recent[1].id, a);
    }

    #[test]
    fn test_stats_counts_and_volume() {
        let log = AuditLog::in_memory().unwrap();
        let a = log.create(&new_tx("0x01")).unwrap();
        let b = log.create(&new_tx("0x02")).unwrap();
        log.create(&new_tx("0x03")).unwrap();

        log.update(
            a,
            &TransactionPatch {
                status: Some(TxStatus::Success),
                ..Default::default()
            },
        )
        .unwrap();
        log.update(
            b,
            &TransactionPatch {
                status: Some(TxStatus::Failed),
                ..Default::default()
            },
        )
        .unwrap();

        let stats = log.stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.successful, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.total_volume, "1000000");
        assert_eq!(stats.total_fees, "1000");
        assert_eq!(stats.volume_by_symbol.get("USDC").unwrap(), "1000000");
    }
}
