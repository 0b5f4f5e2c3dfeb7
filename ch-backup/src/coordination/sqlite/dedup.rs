//! Dedup index statements. Every mutation runs in a `BEGIN IMMEDIATE`
//! transaction so concurrent processes serialize on the database write lock.

use super::{from_ms, to_ms};
use crate::dedup::{
    BackupReferences, DedupRecord, DeletionClaim, RecordState, RefOwner, Reservation, Reserve,
    StoredObject,
};
use crate::fs::digest::ContentHash;
use crate::utils::errors::{BackupError, Result};
use crate::utils::{deadline_after, new_token};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::time::Duration;

struct RecordRow {
    state: RecordState,
    lease_expires_at: Option<i64>,
    object: Option<StoredObject>,
    refcount: u64,
    created_at: i64,
    last_referenced_at: Option<i64>,
}

impl RecordRow {
    fn lease_expired(&self, now_ms: i64) -> bool {
        self.lease_expires_at.map_or(true, |t| t <= now_ms)
    }
}

const RECORD_COLUMNS: &str = "state, lease_expires_at, location_key, compressed, \
     stored_size, created_at, last_referenced_at, \
     (SELECT COUNT(*) FROM dedup_refs f WHERE f.hash = r.hash) AS refcount";

fn row_to_record(row: &Row) -> rusqlite::Result<RecordRow> {
    let state: String = row.get("state")?;
    let state = RecordState::parse(&state).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let location_key: Option<String> = row.get("location_key")?;
    let compressed: bool = row.get("compressed")?;
    let stored_size: i64 = row.get("stored_size")?;
    let refcount: i64 = row.get("refcount")?;
    Ok(RecordRow {
        state,
        lease_expires_at: row.get("lease_expires_at")?,
        object: location_key.map(|key| StoredObject {
            key,
            compressed,
            stored_size: stored_size as u64,
        }),
        refcount: refcount as u64,
        created_at: row.get("created_at")?,
        last_referenced_at: row.get("last_referenced_at")?,
    })
}

fn load(conn: &Connection, hash: &ContentHash) -> Result<Option<RecordRow>> {
    Ok(conn
        .query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM dedup_records r WHERE hash = ?1"),
            params![hash.as_str()],
            row_to_record,
        )
        .optional()?)
}

fn begin(conn: &mut Connection) -> Result<Transaction<'_>> {
    Ok(conn.transaction_with_behavior(TransactionBehavior::Immediate)?)
}

fn refcount(tx: &Connection, hash: &ContentHash) -> Result<u64> {
    let count: i64 = tx.query_row(
        "SELECT COUNT(*) FROM dedup_refs WHERE hash = ?1",
        params![hash.as_str()],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

fn insert_ref(tx: &Connection, hash: &ContentHash, owner: &RefOwner, now_ms: i64) -> Result<()> {
    tx.execute(
        "INSERT OR IGNORE INTO dedup_refs (hash, backup_id, entry, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![hash.as_str(), owner.backup_id, owner.entry, now_ms],
    )?;
    tx.execute(
        "UPDATE dedup_records SET last_referenced_at = ?2 WHERE hash = ?1",
        params![hash.as_str(), now_ms],
    )?;
    Ok(())
}

pub fn try_reserve(conn: &mut Connection, hash: &ContentHash, lease: Duration) -> Result<Reserve> {
    let now_ms = to_ms(Utc::now());
    let tx = begin(conn)?;

    if let Some(row) = load(&tx, hash)? {
        match row.state {
            RecordState::Present => {
                if let Some(object) = row.object {
                    return Ok(Reserve::Hit { object });
                }
            }
            RecordState::Reserved | RecordState::Deleting if !row.lease_expired(now_ms) => {
                return Ok(Reserve::InFlight {
                    expires_at: from_ms(row.lease_expires_at.unwrap_or(now_ms)),
                });
            }
            _ => {}
        }
    }

    let reservation = Reservation {
        hash: hash.clone(),
        token: new_token(),
        expires_at: deadline_after(lease),
    };
    tx.execute(
        "INSERT INTO dedup_records (hash, state, token, lease_expires_at, created_at)
         VALUES (?1, 'reserved', ?2, ?3, ?4)
         ON CONFLICT(hash) DO UPDATE SET
           state = 'reserved', token = excluded.token,
           lease_expires_at = excluded.lease_expires_at,
           location_key = NULL, compressed = 0, stored_size = 0,
           created_at = excluded.created_at",
        params![
            hash.as_str(),
            reservation.token,
            to_ms(reservation.expires_at),
            now_ms
        ],
    )?;
    tx.commit()?;
    Ok(Reserve::Miss { reservation })
}

pub fn commit(
    conn: &mut Connection,
    reservation: &Reservation,
    object: &StoredObject,
    owner: &RefOwner,
) -> Result<u64> {
    let now_ms = to_ms(Utc::now());
    let tx = begin(conn)?;
    let updated = tx.execute(
        "UPDATE dedup_records
         SET state = 'present', token = NULL, lease_expires_at = NULL,
             location_key = ?3, compressed = ?4, stored_size = ?5
         WHERE hash = ?1 AND state = 'reserved' AND token = ?2",
        params![
            reservation.hash.as_str(),
            reservation.token,
            object.key,
            object.compressed,
            object.stored_size as i64
        ],
    )?;
    if updated == 0 {
        return Err(BackupError::DedupReservationExpired(
            reservation.hash.to_string(),
        ));
    }
    insert_ref(&tx, &reservation.hash, owner, now_ms)?;
    let count = refcount(&tx, &reservation.hash)?;
    tx.commit()?;
    Ok(count)
}

pub fn release(conn: &mut Connection, reservation: &Reservation) -> Result<()> {
    conn.execute(
        "DELETE FROM dedup_records WHERE hash = ?1 AND state = 'reserved' AND token = ?2",
        params![reservation.hash.as_str(), reservation.token],
    )?;
    Ok(())
}

pub fn add_reference(conn: &mut Connection, hash: &ContentHash, owner: &RefOwner) -> Result<u64> {
    let now_ms = to_ms(Utc::now());
    let tx = begin(conn)?;
    match load(&tx, hash)? {
        Some(row) if row.state == RecordState::Present => {}
        _ => return Err(BackupError::DedupRecordUnavailable(hash.to_string())),
    }
    insert_ref(&tx, hash, owner, now_ms)?;
    let count = refcount(&tx, hash)?;
    tx.commit()?;
    Ok(count)
}

pub fn remove_reference(
    conn: &mut Connection,
    hash: &ContentHash,
    owner: &RefOwner,
) -> Result<u64> {
    let tx = begin(conn)?;
    tx.execute(
        "DELETE FROM dedup_refs WHERE hash = ?1 AND backup_id = ?2 AND entry = ?3",
        params![hash.as_str(), owner.backup_id, owner.entry],
    )?;
    let count = refcount(&tx, hash)?;
    tx.commit()?;
    Ok(count)
}

pub fn record(conn: &mut Connection, hash: &ContentHash) -> Result<Option<DedupRecord>> {
    Ok(load(conn, hash)?.map(|row| DedupRecord {
        hash: hash.clone(),
        state: row.state,
        object: row.object,
        refcount: row.refcount,
        lease_expires_at: row.lease_expires_at.map(from_ms),
        created_at: from_ms(row.created_at),
        last_referenced_at: row.last_referenced_at.map(from_ms),
    }))
}

pub fn unreferenced(conn: &mut Connection, limit: usize) -> Result<Vec<ContentHash>> {
    let mut stmt = conn.prepare(
        "SELECT hash FROM dedup_records r
         WHERE state = 'present'
           AND NOT EXISTS (SELECT 1 FROM dedup_refs f WHERE f.hash = r.hash)
         ORDER BY hash LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for hash in rows {
        out.push(ContentHash::parse(&hash?)?);
    }
    Ok(out)
}

pub fn expire_stale(conn: &mut Connection) -> Result<usize> {
    let now_ms = to_ms(Utc::now());
    let removed = conn.execute(
        "DELETE FROM dedup_records
         WHERE state IN ('reserved', 'deleting') AND lease_expires_at <= ?1",
        params![now_ms],
    )?;
    Ok(removed)
}

pub fn claim_for_deletion(
    conn: &mut Connection,
    hash: &ContentHash,
    lease: Duration,
) -> Result<Option<DeletionClaim>> {
    let now_ms = to_ms(Utc::now());
    let token = new_token();
    let expires_at = deadline_after(lease);
    let tx = begin(conn)?;

    let object = match load(&tx, hash)? {
        None => {
            tx.execute(
                "INSERT INTO dedup_records (hash, state, token, lease_expires_at, created_at)
                 VALUES (?1, 'deleting', ?2, ?3, ?4)",
                params![hash.as_str(), token, to_ms(expires_at), now_ms],
            )?;
            None
        }
        Some(row)
            if (row.state == RecordState::Present && row.refcount == 0)
                || (row.state == RecordState::Deleting && row.lease_expired(now_ms)) =>
        {
            tx.execute(
                "UPDATE dedup_records SET state = 'deleting', token = ?2, lease_expires_at = ?3
                 WHERE hash = ?1",
                params![hash.as_str(), token, to_ms(expires_at)],
            )?;
            row.object
        }
        Some(_) => return Ok(None),
    };
    tx.commit()?;

    Ok(Some(DeletionClaim {
        hash: hash.clone(),
        token,
        expires_at,
        object,
    }))
}

pub fn finish_deletion(conn: &mut Connection, claim: &DeletionClaim) -> Result<bool> {
    let removed = conn.execute(
        "DELETE FROM dedup_records WHERE hash = ?1 AND state = 'deleting' AND token = ?2",
        params![claim.hash.as_str(), claim.token],
    )?;
    Ok(removed > 0)
}

pub fn referencing_backups(conn: &mut Connection) -> Result<Vec<BackupReferences>> {
    let mut stmt = conn.prepare(
        "SELECT backup_id, COUNT(*), MAX(created_at) FROM dedup_refs
         GROUP BY backup_id ORDER BY backup_id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(BackupReferences {
            backup_id: row.get(0)?,
            refs: row.get::<_, i64>(1)? as u64,
            last_referenced_at: from_ms(row.get(2)?),
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn remove_backup_references(conn: &mut Connection, backup_id: &str) -> Result<Vec<ContentHash>> {
    let tx = begin(conn)?;
    let hashes: Vec<String> = {
        let mut stmt = tx.prepare("SELECT DISTINCT hash FROM dedup_refs WHERE backup_id = ?1")?;
        let rows = stmt.query_map(params![backup_id], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };
    tx.execute(
        "DELETE FROM dedup_refs WHERE backup_id = ?1",
        params![backup_id],
    )?;

    let mut zeroed = Vec::new();
    for hash in hashes {
        let hash = ContentHash::parse(&hash)?;
        if refcount(&tx, &hash)? == 0 {
            zeroed.push(hash);
        }
    }
    tx.commit()?;
    zeroed.sort();
    Ok(zeroed)
}
