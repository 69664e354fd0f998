//! Persisted ephemeral-account balances.

use super::MetadataStore;
use crate::error::{RentError, Result};
use crate::types::PublicKey;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedAccount {
    pub id: PublicKey,
    pub host_key: PublicKey,
    /// May drift negative between syncs; the host-side balance is
    /// authoritative.
    pub balance: i128,
    pub requires_sync: bool,
}

impl MetadataStore {
    pub fn ensure_account(&self, id: PublicKey, host_key: PublicKey) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO accounts (account_id, host_key) VALUES (?1, ?2)",
            params![id.as_bytes().as_slice(), host_key.as_bytes().as_slice()],
        )?;
        Ok(())
    }

    pub fn accounts(&self) -> Result<Vec<PersistedAccount>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT account_id, host_key, balance, requires_sync FROM accounts")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, Vec<u8>>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, bool>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, host_key, balance, requires_sync) = row?;
            out.push(PersistedAccount {
                id: PublicKey::from_slice(&id).unwrap_or_default(),
                host_key: PublicKey::from_slice(&host_key).unwrap_or_default(),
                balance: balance.parse().unwrap_or(0),
                requires_sync,
            });
        }
        Ok(out)
    }

    pub fn account_balance(&self, id: PublicKey) -> Result<i128> {
        let conn = self.conn()?;
        let balance: Option<String> = conn
            .query_row(
                "SELECT balance FROM accounts WHERE account_id = ?1",
                params![id.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        match balance {
            Some(b) => Ok(b.parse().unwrap_or(0)),
            None => Err(RentError::NotFound(format!("account {id}"))),
        }
    }

    pub fn add_account_balance(&self, id: PublicKey, delta: i128) -> Result<()> {
        let current = self.account_balance(id)?;
        self.set_account_balance(id, current + delta)
    }

    pub fn set_account_balance(&self, id: PublicKey, balance: i128) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE accounts SET balance = ?1 WHERE account_id = ?2",
            params![balance.to_string(), id.as_bytes().as_slice()],
        )?;
        if updated == 0 {
            return Err(RentError::NotFound(format!("account {id}")));
        }
        Ok(())
    }

    pub fn set_account_requires_sync(&self, id: PublicKey, requires_sync: bool) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE accounts SET requires_sync = ?1 WHERE account_id = ?2",
            params![requires_sync, id.as_bytes().as_slice()],
        )?;
        if updated == 0 {
            return Err(RentError::NotFound(format!("account {id}")));
        }
        Ok(())
    }
}
