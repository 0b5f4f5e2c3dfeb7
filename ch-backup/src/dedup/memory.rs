//! Process-local dedup index, sharded by hash.

use super::{
    BackupReferences, DedupIndex, DedupRecord, DeletionClaim, RecordState, RefOwner, Reservation,
    Reserve, StoredObject,
};
use crate::fs::digest::ContentHash;
use crate::utils::errors::{BackupError, Result};
use crate::utils::{deadline_after, new_token};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const SHARDS: usize = 16;

#[derive(Debug, Clone)]
struct Entry {
    state: RecordState,
    token: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    object: Option<StoredObject>,
    refs: HashMap<RefOwner, DateTime<Utc>>,
    created_at: DateTime<Utc>,
    last_referenced_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn leased(state: RecordState, token: &str, expires_at: DateTime<Utc>) -> Self {
        Self {
            state,
            token: Some(token.to_string()),
            lease_expires_at: Some(expires_at),
            object: None,
            refs: HashMap::new(),
            created_at: Utc::now(),
            last_referenced_at: None,
        }
    }

    fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at.map_or(true, |t| t <= now)
    }

    fn add_ref(&mut self, owner: &RefOwner) -> u64 {
        let now = Utc::now();
        self.refs.entry(owner.clone()).or_insert(now);
        self.last_referenced_at = Some(now);
        self.refs.len() as u64
    }

    fn to_record(&self, hash: &ContentHash) -> DedupRecord {
        DedupRecord {
            hash: hash.clone(),
            state: self.state,
            object: self.object.clone(),
            refcount: self.refs.len() as u64,
            lease_expires_at: self.lease_expires_at,
            created_at: self.created_at,
            last_referenced_at: self.last_referenced_at,
        }
    }
}

type Shard = HashMap<ContentHash, Entry>;

pub struct MemoryDedupIndex {
    shards: Vec<Mutex<Shard>>,
}

impl MemoryDedupIndex {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, hash: &ContentHash) -> MutexGuard<'_, Shard> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        hash.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % SHARDS;
        self.shards[idx].lock().unwrap_or_else(|p| p.into_inner())
    }

    fn all_shards(&self) -> impl Iterator<Item = MutexGuard<'_, Shard>> {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(|p| p.into_inner()))
    }
}

impl Default for MemoryDedupIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DedupIndex for MemoryDedupIndex {
    async fn try_reserve(&self, hash: &ContentHash, lease: Duration) -> Result<Reserve> {
        let now = Utc::now();
        let mut shard = self.shard(hash);

        if let Some(entry) = shard.get(hash) {
            match entry.state {
                RecordState::Present => {
                    if let Some(object) = entry.object.clone() {
                        return Ok(Reserve::Hit { object });
                    }
                }
                RecordState::Reserved | RecordState::Deleting if !entry.lease_expired(now) => {
                    return Ok(Reserve::InFlight {
                        expires_at: entry.lease_expires_at.unwrap_or(now),
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
        shard.insert(
            hash.clone(),
            Entry::leased(RecordState::Reserved, &reservation.token, reservation.expires_at),
        );
        Ok(Reserve::Miss { reservation })
    }

    async fn commit(
        &self,
        reservation: &Reservation,
        object: &StoredObject,
        owner: &RefOwner,
    ) -> Result<u64> {
        let mut shard = self.shard(&reservation.hash);
        let entry = shard
            .get_mut(&reservation.hash)
            .filter(|e| {
                e.state == RecordState::Reserved && e.token.as_deref() == Some(&reservation.token)
            })
            .ok_or_else(|| BackupError::DedupReservationExpired(reservation.hash.to_string()))?;

        entry.state = RecordState::Present;
        entry.token = None;
        entry.lease_expires_at = None;
        entry.object = Some(object.clone());
        Ok(entry.add_ref(owner))
    }

    async fn release(&self, reservation: &Reservation) -> Result<()> {
        let mut shard = self.shard(&reservation.hash);
        let ours = shard.get(&reservation.hash).is_some_and(|e| {
            e.state == RecordState::Reserved && e.token.as_deref() == Some(&reservation.token)
        });
        if ours {
            shard.remove(&reservation.hash);
        }
        Ok(())
    }

    async fn add_reference(&self, hash: &ContentHash, owner: &RefOwner) -> Result<u64> {
        let mut shard = self.shard(hash);
        match shard.get_mut(hash) {
            Some(entry) if entry.state == RecordState::Present => Ok(entry.add_ref(owner)),
            _ => Err(BackupError::DedupRecordUnavailable(hash.to_string())),
        }
    }

    async fn remove_reference(&self, hash: &ContentHash, owner: &RefOwner) -> Result<u64> {
        let mut shard = self.shard(hash);
        Ok(match shard.get_mut(hash) {
            Some(entry) => {
                entry.refs.remove(owner);
                entry.refs.len() as u64
            }
            None => 0,
        })
    }

    async fn record(&self, hash: &ContentHash) -> Result<Option<DedupRecord>> {
        Ok(self.shard(hash).get(hash).map(|e| e.to_record(hash)))
    }

    async fn unreferenced(&self, limit: usize) -> Result<Vec<ContentHash>> {
        let mut out: Vec<ContentHash> = self
            .all_shards()
            .flat_map(|shard| {
                shard
                    .iter()
                    .filter(|(_, e)| e.state == RecordState::Present && e.refs.is_empty())
                    .map(|(h, _)| h.clone())
                    .collect::<Vec<_>>()
            })
            .collect();
        out.sort();
        out.truncate(limit);
        Ok(out)
    }

    async fn expire_stale(&self) -> Result<usize> {
        let now = Utc::now();
        let mut removed = 0;
        for mut shard in self.all_shards() {
            let before = shard.len();
            shard.retain(|_, e| e.state == RecordState::Present || !e.lease_expired(now));
            removed += before - shard.len();
        }
        Ok(removed)
    }

    async fn claim_for_deletion(
        &self,
        hash: &ContentHash,
        lease: Duration,
    ) -> Result<Option<DeletionClaim>> {
        let now = Utc::now();
        let mut shard = self.shard(hash);
        let token = new_token();
        let expires_at = deadline_after(lease);

        match shard.get_mut(hash) {
            None => {
                shard.insert(
                    hash.clone(),
                    Entry::leased(RecordState::Deleting, &token, expires_at),
                );
                Ok(Some(DeletionClaim {
                    hash: hash.clone(),
                    token,
                    expires_at,
                    object: None,
                }))
            }
            Some(entry)
                if (entry.state == RecordState::Present && entry.refs.is_empty())
                    || (entry.state == RecordState::Deleting && entry.lease_expired(now)) =>
            {
                entry.state = RecordState::Deleting;
                entry.token = Some(token.clone());
                entry.lease_expires_at = Some(expires_at);
                Ok(Some(DeletionClaim {
                    hash: hash.clone(),
                    token,
                    expires_at,
                    object: entry.object.clone(),
                }))
            }
            Some(_) => Ok(None),
        }
    }

    async fn finish_deletion(&self, claim: &DeletionClaim) -> Result<bool> {
        let mut shard = self.shard(&claim.hash);
        let ours = shard.get(&claim.hash).is_some_and(|e| {
            e.state == RecordState::Deleting && e.token.as_deref() == Some(&claim.token)
        });
        if ours {
            shard.remove(&claim.hash);
        }
        Ok(ours)
    }

    async fn referencing_backups(&self) -> Result<Vec<BackupReferences>> {
        let mut by_backup: BTreeMap<String, (u64, DateTime<Utc>)> = BTreeMap::new();
        for shard in self.all_shards() {
            for entry in shard.values() {
                for (owner, at) in &entry.refs {
                    let slot = by_backup
                        .entry(owner.backup_id.clone())
                        .or_insert((0, *at));
                    slot.0 += 1;
                    slot.1 = slot.1.max(*at);
                }
            }
        }
        Ok(by_backup
            .into_iter()
            .map(|(backup_id, (refs, last_referenced_at))| BackupReferences {
                backup_id,
                refs,
                last_referenced_at,
            })
            .collect())
    }

    async fn remove_backup_references(&self, backup_id: &str) -> Result<Vec<ContentHash>> {
        let mut zeroed = Vec::new();
        for mut shard in self.all_shards() {
            for (hash, entry) in shard.iter_mut() {
                let before = entry.refs.len();
                entry.refs.retain(|owner, _| owner.backup_id != backup_id);
                if before > 0 && entry.refs.is_empty() {
                    zeroed.push(hash.clone());
                }
            }
        }
        zeroed.sort();
        Ok(zeroed)
    }
}
