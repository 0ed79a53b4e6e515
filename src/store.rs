//! SQLite ledger of already handled order emails.
//!
//! Messages are keyed by a fingerprint of their headers rather than the
//! IMAP UID, so reprocessing survives mailbox renumbering. A fingerprint
//! reaches a terminal status once and is never picked up again.

use crate::error::Result;
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{info, warn};

const STATUS_DONE: &str = "done";
const STATUS_SKIPPED: &str = "skipped";
const STATUS_FAILED: &str = "failed";
const STATUS_RETRYING: &str = "retrying";

pub struct ProcessedStore {
    conn: Connection,
}

impl ProcessedStore {
    /// Open or create the ledger database.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS processed_orders (
                fingerprint TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_processed_orders_status
             ON processed_orders(status)",
            [],
        )?;

        info!("order ledger initialized");
        Ok(Self { conn })
    }

    /// Stable identity for one email in one mailbox.
    pub fn fingerprint(message_id: &str, date: &str, account: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(message_id.as_bytes());
        hasher.update(date.as_bytes());
        hasher.update(account.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// True when the order reached a terminal status on an earlier cycle.
    pub fn is_finished(&self, fingerprint: &str) -> Result<bool> {
        let status: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM processed_orders WHERE fingerprint = ?1",
                params![fingerprint],
                |row| row.get(0),
            )
            .optional()?;
        Ok(matches!(
            status.as_deref(),
            Some(STATUS_DONE | STATUS_SKIPPED | STATUS_FAILED)
        ))
    }

    /// Invoice rendered and sent.
    pub fn record_done(&self, fingerprint: &str) -> Result<()> {
        self.set_terminal(fingerprint, STATUS_DONE)
    }

    /// Handled without an invoice: nothing ordered, or nothing matched.
    pub fn record_skipped(&self, fingerprint: &str) -> Result<()> {
        self.set_terminal(fingerprint, STATUS_SKIPPED)
    }

    /// Record one failed attempt.
    ///
    /// Returns true when the attempt budget is spent and the order moved
    /// to its terminal failed status.
    pub fn record_failure(
        &self,
        fingerprint: &str,
        error: &str,
        max_attempts: u32,
    ) -> Result<bool> {
        let attempts: u32 = self
            .conn
            .query_row(
                "SELECT attempts FROM processed_orders WHERE fingerprint = ?1",
                params![fingerprint],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0)
            + 1;
        let permanent = attempts >= max_attempts;
        let status = if permanent {
            STATUS_FAILED
        } else {
            STATUS_RETRYING
        };

        self.conn.execute(
            "INSERT INTO processed_orders (fingerprint, status, attempts, last_error, updated_at)
             VALUES (?1, ?2, ?3, ?4, CURRENT_TIMESTAMP)
             ON CONFLICT(fingerprint) DO UPDATE SET
                 status = excluded.status,
                 attempts = excluded.attempts,
                 last_error = excluded.last_error,
                 updated_at = CURRENT_TIMESTAMP",
            params![fingerprint, status, attempts, error],
        )?;
        if permanent {
            warn!(attempts, "attempt budget spent, order will not be retried");
        } else {
            info!(attempts, "order failure recorded, will retry next cycle");
        }
        Ok(permanent)
    }

    /// Current status and attempt count, if the order was ever seen.
    pub fn status(&self, fingerprint: &str) -> Result<Option<(String, u32)>> {
        Ok(self
            .conn
            .query_row(
                "SELECT status, attempts FROM processed_orders WHERE fingerprint = ?1",
                params![fingerprint],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?)
    }

    fn set_terminal(&self, fingerprint: &str, status: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO processed_orders (fingerprint, status, updated_at)
             VALUES (?1, ?2, CURRENT_TIMESTAMP)
             ON CONFLICT(fingerprint) DO UPDATE SET
                 status = excluded.status,
                 last_error = NULL,
                 updated_at = CURRENT_TIMESTAMP",
            params![fingerprint, status],
        )?;
        info!(status, "order recorded");
        Ok(())
    }
}
