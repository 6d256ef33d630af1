//! Retention planning.
//!
//! The newest `keep_full` FULL and `keep_incremental` INCREMENTAL backups are
//! kept. Every ancestor of a kept backup is pinned as well, so retention
//! never breaks a restorable chain. Everything else is pruned, oldest first.
//!
//! Pinning wins over the incremental count: a long chain under a kept
//! incremental survives in full, so more incrementals than configured may
//! remain. [`pinned_incrementals`] reports the overflow.

use crate::catalog::{BackupRecord, BackupType};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetentionDecision {
    Keep { reasons: Vec<String> },
    Prune,
}

#[derive(Debug, Clone)]
pub struct RetentionEntry {
    pub backup_id: String,
    pub backup_type: BackupType,
    pub timestamp: DateTime<Utc>,
    pub decision: RetentionDecision,
}

impl RetentionEntry {
    pub fn is_pruned(&self) -> bool {
        self.decision == RetentionDecision::Prune
    }

    /// Kept only because a kept backup depends on it.
    pub fn is_pinned_only(&self) -> bool {
        match &self.decision {
            RetentionDecision::Keep { reasons } => reasons.iter().all(|r| r.starts_with("parent of ")),
            RetentionDecision::Prune => false,
        }
    }
}

/// Incrementals kept past `keep_incremental` by ancestor pinning.
pub fn pinned_incrementals(plan: &[RetentionEntry], keep_incremental: usize) -> usize {
    let kept = plan
        .iter()
        .filter(|e| e.backup_type == BackupType::Incremental && !e.is_pruned())
        .count();
    kept.saturating_sub(keep_incremental)
}

/// Decide the fate of every record. Entries are returned oldest first.
pub fn plan_retention(
    records: &[BackupRecord],
    keep_full: usize,
    keep_incremental: usize,
) -> Vec<RetentionEntry> {
    let mut ordered: Vec<&BackupRecord> = records.iter().collect();
    ordered.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

    let mut reasons: BTreeMap<&str, Vec<String>> = BTreeMap::new();

    for (backup_type, limit, label) in [
        (BackupType::Full, keep_full, "full"),
        (BackupType::Incremental, keep_incremental, "incremental"),
    ] {
        let newest_first = ordered
            .iter()
            .rev()
            .filter(|r| r.backup_type == backup_type)
            .take(limit);
        for (i, record) in newest_first.enumerate() {
            reasons
                .entry(record.id.as_str())
                .or_default()
                .push(format!("{label} #{}", i + 1));
        }
    }

    // Pin ancestors of everything kept so far
    let by_id: HashMap<&str, &BackupRecord> = ordered.iter().map(|r| (r.id.as_str(), *r)).collect();
    let kept: Vec<&str> = reasons.keys().copied().collect();
    for id in kept {
        let mut visited = HashSet::from([id]);
        let mut current = by_id.get(id).and_then(|&r| r.parent_id.as_deref());
        while let Some(parent) = current {
            if !visited.insert(parent) {
                break;
            }
            let Some(&parent_record) = by_id.get(parent) else {
                break;
            };
            let entry = reasons.entry(parent_record.id.as_str()).or_default();
            let reason = format!("parent of {id}");
            if !entry.contains(&reason) {
                entry.push(reason);
            }
            current = parent_record.parent_id.as_deref();
        }
    }

    ordered
        .iter()
        .map(|r| RetentionEntry {
            backup_id: r.id.clone(),
            backup_type: r.backup_type,
            timestamp: r.timestamp,
            decision: match reasons.get(r.id.as_str()) {
                Some(reasons) => RetentionDecision::Keep {
                    reasons: reasons.clone(),
                },
                None => RetentionDecision::Prune,
            },
        })
        .collect()
}
