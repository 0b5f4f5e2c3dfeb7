//! Retention policy and garbage collection.
//!
//! Policy evaluation is pure: it turns one scope's manifests into a keep or
//! delete decision per backup. Physical deletion lives in [`sweep`].

pub mod sweep;

use crate::catalog::{BackupManifest, BackupState};
use crate::config::RetentionConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

pub use sweep::{CollectReport, GarbageCollector, SweepReport};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "backup", rename_all = "snake_case")]
pub enum KeepReason {
    /// Among the `min_keep` newest finished backups
    MinKeep,
    WithinMaxAge,
    /// Neither limit is configured
    NoPolicy,
    /// Incremental basis of a kept backup
    BasisOf(String),
    /// Not yet finished
    Active,
}

impl fmt::Display for KeepReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeepReason::MinKeep => write!(f, "min_keep"),
            KeepReason::WithinMaxAge => write!(f, "within max_age"),
            KeepReason::NoPolicy => write!(f, "no policy"),
            KeepReason::BasisOf(id) => write!(f, "basis of {id}"),
            KeepReason::Active => write!(f, "active"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RetentionDecision {
    Keep { reasons: Vec<KeepReason> },
    Delete,
}

impl RetentionDecision {
    pub fn is_delete(&self) -> bool {
        matches!(self, RetentionDecision::Delete)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetentionPolicy {
    pub min_keep: usize,
    pub max_age: Option<Duration>,
}

impl RetentionPolicy {
    pub fn from_config(config: &RetentionConfig) -> Self {
        Self {
            min_keep: config.min_keep,
            max_age: config.max_age,
        }
    }

    fn is_unbounded(&self) -> bool {
        self.min_keep == 0 && self.max_age.is_none()
    }

    /// Decide the fate of every backup in one scope, newest first.
    ///
    /// Failed and half-deleted backups are always eligible and never count
    /// toward `min_keep`. A finished backup is eligible once it is past the
    /// `min_keep` newest and older than `max_age`. The basis of any kept
    /// backup is kept, transitively.
    pub fn evaluate(
        &self,
        manifests: &[BackupManifest],
        now: DateTime<Utc>,
    ) -> Vec<(String, RetentionDecision)> {
        let mut ordered: Vec<&BackupManifest> = manifests.iter().collect();
        ordered.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.backup_id.cmp(&a.backup_id))
        });

        let max_age = self
            .max_age
            .and_then(|age| chrono::Duration::from_std(age).ok());
        let mut finished_seen = 0usize;
        let mut decisions: Vec<(String, RetentionDecision)> = Vec::with_capacity(ordered.len());
        for manifest in &ordered {
            let decision = match manifest.state {
                BackupState::Failed | BackupState::Deleting | BackupState::Deleted => {
                    RetentionDecision::Delete
                }
                BackupState::Finished => {
                    finished_seen += 1;
                    let mut reasons = Vec::new();
                    if self.is_unbounded() {
                        reasons.push(KeepReason::NoPolicy);
                    }
                    if finished_seen <= self.min_keep {
                        reasons.push(KeepReason::MinKeep);
                    }
                    if max_age.is_some_and(|age| now - manifest.created_at <= age) {
                        reasons.push(KeepReason::WithinMaxAge);
                    }
                    if reasons.is_empty() {
                        RetentionDecision::Delete
                    } else {
                        RetentionDecision::Keep { reasons }
                    }
                }
                _ => RetentionDecision::Keep {
                    reasons: vec![KeepReason::Active],
                },
            };
            decisions.push((manifest.backup_id.clone(), decision));
        }

        protect_bases(&ordered, &mut decisions);
        decisions
    }
}

/// Keep the basis of every kept finished backup until nothing changes.
fn protect_bases(ordered: &[&BackupManifest], decisions: &mut [(String, RetentionDecision)]) {
    let index: HashMap<&str, usize> = ordered
        .iter()
        .enumerate()
        .map(|(i, m)| (m.backup_id.as_str(), i))
        .collect();

    loop {
        let mut changed = false;
        for i in 0..ordered.len() {
            let kept = !decisions[i].1.is_delete() && ordered[i].state == BackupState::Finished;
            let Some(basis) = ordered[i].basis.as_deref() else {
                continue;
            };
            let Some(&j) = index.get(basis) else {
                continue;
            };
            if !kept || ordered[j].state != BackupState::Finished {
                continue;
            }
            let child = ordered[i].backup_id.clone();
            match &mut decisions[j].1 {
                RetentionDecision::Delete => {
                    decisions[j].1 = RetentionDecision::Keep {
                        reasons: vec![KeepReason::BasisOf(child)],
                    };
                    changed = true;
                }
                RetentionDecision::Keep { reasons } => {
                    let reason = KeepReason::BasisOf(child);
                    if !reasons.contains(&reason) {
                        reasons.push(reason);
                    }
                }
            }
        }
        if !changed {
            break;
        }
    }
}
