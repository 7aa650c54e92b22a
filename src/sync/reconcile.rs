//! Deterministic merge of two keychain snapshots.
//!
//! Both peers run [`reconcile`] on the same pair of snapshots (each with its
//! own side as `local`) and end up with identical stores.

use super::SyncStats;
use crate::models::{Chain, ChainLink, Keychain};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tracing::warn;
use uuid::Uuid;

/// A record that takes part in sync.
pub trait SyncRecord: Serialize + Clone + PartialEq {
    fn id(&self) -> Uuid;
    fn modified(&self) -> DateTime<Utc>;
    fn deleted(&self) -> bool;
}

impl SyncRecord for Chain {
    fn id(&self) -> Uuid {
        self.id
    }
    fn modified(&self) -> DateTime<Utc> {
        self.modified
    }
    fn deleted(&self) -> bool {
        self.deleted
    }
}

impl SyncRecord for ChainLink {
    fn id(&self) -> Uuid {
        self.id
    }
    fn modified(&self) -> DateTime<Utc> {
        self.modified
    }
    fn deleted(&self) -> bool {
        self.deleted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

/// A record to write into the local store.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordChange<T> {
    pub kind: ChangeKind,
    pub record: T,
}

/// Changes to apply to the local store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncPlan {
    pub chains: Vec<RecordChange<Chain>>,
    pub links: Vec<RecordChange<ChainLink>>,
    /// Links found encrypted under another chain key
    pub conflicts: usize,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.chains.is_empty() && self.links.is_empty()
    }
}

/// Total order deciding which version of a record wins: later
/// modification, then tombstone, then larger canonical encoding.
fn compare<T: SyncRecord>(a: &T, b: &T) -> Ordering {
    a.modified()
        .cmp(&b.modified())
        .then(a.deleted().cmp(&b.deleted()))
        .then_with(|| canonical(a).cmp(&canonical(b)))
}

fn canonical<T: Serialize>(record: &T) -> String {
    serde_json::to_string(record).unwrap_or_default()
}

fn winner<'a, T: SyncRecord>(local: Option<&'a T>, remote: Option<&'a T>) -> Option<&'a T> {
    match (local, remote) {
        (Some(l), Some(r)) => Some(if compare(r, l) == Ordering::Greater { r } else { l }),
        (l, r) => l.or(r),
    }
}

fn change<T: SyncRecord>(local: Option<&T>, merged: &T) -> Option<RecordChange<T>> {
    if local == Some(merged) {
        return None;
    }
    let kind = match local {
        _ if merged.deleted() && !local.is_some_and(|l| l.deleted()) => ChangeKind::Delete,
        None => ChangeKind::Create,
        Some(_) => ChangeKind::Update,
    };
    Some(RecordChange {
        kind,
        record: merged.clone(),
    })
}

/// Ids of both sides: local order first, then remote-only ids.
fn merged_ids<T: SyncRecord>(local: &[T], remote: &[T]) -> Vec<Uuid> {
    let mut seen = HashSet::new();
    local
        .iter()
        .chain(remote)
        .map(|record| record.id())
        .filter(|id| seen.insert(*id))
        .collect()
}

/// Work out what the local store must change to match the merged state.
pub fn reconcile(local: &Keychain, remote_chains: &[Chain], remote_links: &[ChainLink]) -> SyncPlan {
    let mut plan = SyncPlan::default();

    let local_chains: HashMap<Uuid, &Chain> = local.chains.iter().map(|c| (c.id, c)).collect();
    let remote_chain_map: HashMap<Uuid, &Chain> = remote_chains.iter().map(|c| (c.id, c)).collect();

    let mut merged_chains: HashMap<Uuid, Chain> = HashMap::new();
    for id in merged_ids(&local.chains, remote_chains) {
        let local_chain = local_chains.get(&id).copied();
        let Some(merged) = winner(local_chain, remote_chain_map.get(&id).copied()) else {
            continue;
        };
        if let Some(change) = change(local_chain, merged) {
            plan.chains.push(change);
        }
        merged_chains.insert(id, merged.clone());
    }

    let local_links: HashMap<Uuid, &ChainLink> = local.links.iter().map(|l| (l.id, l)).collect();
    let remote_link_map: HashMap<Uuid, &ChainLink> =
        remote_links.iter().map(|l| (l.id, l)).collect();

    for id in merged_ids(&local.links, remote_links) {
        let local_link = local_links.get(&id).copied();
        let remote_link = remote_link_map.get(&id).copied();
        let Some(candidate) = winner(local_link, remote_link) else {
            continue;
        };

        let Some(chain) = merged_chains.get(&candidate.chain_id) else {
            // Remote link for a chain neither side knows.
            continue;
        };

        let mut merged = candidate.clone();

        if chain.deleted {
            if !merged.deleted {
                merged.deleted = true;
                merged.modified = merged.modified.max(chain.modified);
            }
        } else if !merged.deleted && merged.key_generation != chain.key_generation {
            plan.conflicts += 1;
            let matching = [local_link, remote_link]
                .into_iter()
                .flatten()
                .filter(|l| l.deleted || l.key_generation == chain.key_generation)
                .fold(None, |best, l| winner(best, Some(l)));

            match matching {
                Some(l) => merged = l.clone(),
                None => {
                    // No copy is readable under the current key; both peers
                    // retire the link the same way.
                    warn!(
                        link = %candidate.name,
                        chain = %chain.name,
                        "Deleting link encrypted under a stale chain key"
                    );
                    merged.deleted = true;
                    merged.modified = merged.modified.max(chain.modified);
                }
            }
        }

        if let Some(change) = change(local_link, &merged) {
            plan.links.push(change);
        }
    }

    plan
}

/// Apply a plan to the local store.
pub fn apply(doc: &mut Keychain, plan: SyncPlan) -> SyncStats {
    let mut stats = SyncStats {
        conflicts: plan.conflicts,
        ..SyncStats::default()
    };

    for RecordChange { kind, record } in plan.chains {
        stats.count(kind);
        match doc.chains.iter_mut().find(|c| c.id == record.id) {
            Some(existing) => *existing = record,
            None => doc.chains.push(record),
        }
    }

    for RecordChange { kind, record } in plan.links {
        stats.count(kind);
        match doc.links.iter_mut().find(|l| l.id == record.id) {
            Some(existing) => *existing = record,
            None => doc.links.push(record),
        }
    }

    stats.renamed = resolve_name_clashes(doc);
    stats
}

/// Give live chains that share a name, and live links that share a name
/// within one chain, distinct names. The record with the smallest id keeps
/// the name; the others get an id suffix. Both peers compute the same
/// renames without touching `modified`.
pub fn resolve_name_clashes(doc: &mut Keychain) -> usize {
    let chain_renames = clashing(doc.live_chains().map(|c| ((Uuid::nil(), c.name.clone()), c.id)));
    let link_renames = clashing(
        doc.links
            .iter()
            .filter(|l| l.is_live() && doc.find_chain(l.chain_id).is_some())
            .map(|l| ((l.chain_id, l.name.clone()), l.id)),
    );

    let mut renamed = 0;
    for (id, name) in chain_renames {
        if let Some(chain) = doc.find_chain_mut(id) {
            chain.name = name;
            renamed += 1;
        }
    }
    for (id, name) in link_renames {
        if let Some(link) = doc.find_link_mut(id) {
            link.name = name;
            renamed += 1;
        }
    }
    renamed
}

/// New names for every record but the smallest id in each group.
fn clashing(records: impl Iterator<Item = ((Uuid, String), Uuid)>) -> Vec<(Uuid, String)> {
    let mut groups: HashMap<(Uuid, String), Vec<Uuid>> = HashMap::new();
    for (key, id) in records {
        groups.entry(key).or_default().push(id);
    }

    let mut renames = Vec::new();
    for ((_, name), mut ids) in groups {
        ids.sort();
        for id in ids.into_iter().skip(1) {
            let short = id.simple().to_string();
            renames.push((id, format!("{name} ({})", &short[..8])));
        }
    }
    renames
}
