//! Restore chain resolution: target → parent → … → FULL, returned oldest first.

use crate::catalog::BackupRecord;
use crate::utils::errors::{EngineError, Result};
use std::collections::HashSet;
use tracing::warn;

/// How to treat a chain that cannot be walked back to a FULL backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainMode {
    /// Any break in the chain is an error.
    Strict,
    /// Stop at the break and use the links found so far.
    Lenient,
}

/// Resolve the chain ending at `target`.
pub fn resolve_chain<F>(target: BackupRecord, lookup: F, mode: ChainMode) -> Result<Vec<BackupRecord>>
where
    F: Fn(&str) -> Option<BackupRecord>,
{
    let mut visited = HashSet::new();
    let mut chain = Vec::new();
    let mut current = target;

    loop {
        if !visited.insert(current.id.clone()) {
            let err = EngineError::ChainCycle(current.id.clone());
            return lenient_or(mode, err, chain);
        }

        if current.is_full() {
            chain.push(current);
            break;
        }

        let Some(parent_id) = current.parent_id.clone() else {
            let err = EngineError::OrphanIncremental(current.id.clone());
            chain.push(current);
            return lenient_or(mode, err, chain);
        };

        match lookup(&parent_id) {
            Some(parent) => {
                chain.push(current);
                current = parent;
            }
            None => {
                let err = EngineError::MissingParent {
                    backup_id: current.id.clone(),
                    parent_id,
                };
                chain.push(current);
                return lenient_or(mode, err, chain);
            }
        }
    }

    chain.reverse();
    Ok(chain)
}

fn lenient_or(mode: ChainMode, err: EngineError, mut chain: Vec<BackupRecord>) -> Result<Vec<BackupRecord>> {
    match mode {
        ChainMode::Strict => Err(err),
        ChainMode::Lenient => {
            warn!(error = %err, links = chain.len(), "Using partial backup chain");
            chain.reverse();
            Ok(chain)
        }
    }
}
