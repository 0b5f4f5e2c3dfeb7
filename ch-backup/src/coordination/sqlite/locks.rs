use super::{from_ms, to_ms};
use crate::lock::{Acquire, Lease, LockHolder};
use crate::utils::errors::{BackupError, Result};
use crate::utils::{deadline_after, new_token};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::time::Duration;

fn row_to_holder(row: &Row) -> rusqlite::Result<LockHolder> {
    Ok(LockHolder {
        resource: row.get("resource")?,
        holder: row.get("holder")?,
        expires_at: from_ms(row.get("expires_at")?),
        acquired_at: from_ms(row.get("acquired_at")?),
    })
}

pub fn try_acquire(
    conn: &mut Connection,
    resource: &str,
    holder: &str,
    lease: Duration,
) -> Result<Acquire> {
    let now = Utc::now();
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let current = tx
        .query_row(
            "SELECT * FROM locks WHERE resource = ?1",
            params![resource],
            row_to_holder,
        )
        .optional()?;
    if let Some(current) = current {
        if current.expires_at > now {
            return Ok(Acquire::Busy {
                holder: current.holder,
                expires_at: current.expires_at,
            });
        }
        tracing::info!(
            resource,
            previous = %current.holder,
            "Taking over expired lock"
        );
    }

    let lease = Lease {
        resource: resource.to_string(),
        holder: holder.to_string(),
        token: new_token(),
        expires_at: deadline_after(lease),
    };
    tx.execute(
        "INSERT OR REPLACE INTO locks (resource, holder, token, expires_at, acquired_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            lease.resource,
            lease.holder,
            lease.token,
            to_ms(lease.expires_at),
            to_ms(now)
        ],
    )?;
    tx.commit()?;
    Ok(Acquire::Acquired { lease })
}

pub fn renew(conn: &mut Connection, lease: &Lease, duration: Duration) -> Result<Lease> {
    let expires_at = deadline_after(duration);
    let updated = conn.execute(
        "UPDATE locks SET expires_at = ?3 WHERE resource = ?1 AND token = ?2",
        params![lease.resource, lease.token, to_ms(expires_at)],
    )?;
    if updated == 0 {
        return Err(BackupError::LockLost(lease.resource.clone()));
    }
    Ok(Lease {
        expires_at,
        ..lease.clone()
    })
}

pub fn release(conn: &mut Connection, lease: &Lease) -> Result<()> {
    conn.execute(
        "DELETE FROM locks WHERE resource = ?1 AND token = ?2",
        params![lease.resource, lease.token],
    )?;
    Ok(())
}

pub fn holder(conn: &mut Connection, resource: &str) -> Result<Option<LockHolder>> {
    Ok(conn
        .query_row(
            "SELECT * FROM locks WHERE resource = ?1 AND expires_at > ?2",
            params![resource, to_ms(Utc::now())],
            row_to_holder,
        )
        .optional()?)
}

pub fn break_lock(conn: &mut Connection, resource: &str) -> Result<Option<LockHolder>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let current = tx
        .query_row(
            "SELECT * FROM locks WHERE resource = ?1",
            params![resource],
            row_to_holder,
        )
        .optional()?;
    tx.execute("DELETE FROM locks WHERE resource = ?1", params![resource])?;
    tx.commit()?;
    Ok(current)
}
