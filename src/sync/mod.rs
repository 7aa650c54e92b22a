//! Peer-to-peer synchronization of two keychain stores over TCP.
//!
//! A session is a single exchange: both peers say hello, swap full
//! snapshots of their stores (passwords stay encrypted), merge the other
//! side's snapshot into their own with [`reconcile`] and report what changed.

mod client;
mod protocol;
mod reconcile;
mod server;

pub use client::sync_with_peer;
pub use protocol::{Connection, Message, MAX_FRAME_LEN, PROTOCOL_VERSION};
pub use reconcile::{apply, reconcile, resolve_name_clashes, ChangeKind, RecordChange, SyncPlan, SyncRecord};
pub use server::SyncServer;

use serde::{Deserialize, Serialize};

/// What a session changed in one store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub conflicts: usize,
    #[serde(default)]
    pub renamed: usize,
}

impl SyncStats {
    fn count(&mut self, kind: ChangeKind) {
        match kind {
            ChangeKind::Create => self.created += 1,
            ChangeKind::Update => self.updated += 1,
            ChangeKind::Delete => self.deleted += 1,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.created == 0 && self.updated == 0 && self.deleted == 0 && self.renamed == 0
    }
}

impl std::fmt::Display for SyncStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} created, {} updated, {} deleted",
            self.created, self.updated, self.deleted
        )?;
        if self.conflicts > 0 {
            write!(f, ", {} conflicts", self.conflicts)?;
        }
        if self.renamed > 0 {
            write!(f, ", {} renamed", self.renamed)?;
        }
        Ok(())
    }
}

/// Outcome of a finished session, seen from one side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Name the other side announced
    pub peer: String,
    /// Changes applied to our store
    pub local: SyncStats,
    /// Changes the peer applied to its store
    pub remote: SyncStats,
}
