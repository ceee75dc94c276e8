//! # CRDT Seam
//!
//! Slate Core treats the replicated document as opaque: the collaborator
//! (the editor layer) hands the core a [`CrdtHandle`] and the core only ever
//! moves byte payloads through it. Three operations are required:
//!
//! - `state_vector()` — a compact summary of everything this peer has seen,
//!   exchanged during the handshake.
//! - `encode_diff(remote_vector)` — the minimal update that brings a peer
//!   with that vector up to date (empty when nothing is missing).
//! - `apply_update(update, origin)` — merge a remote or local update into
//!   the document. Updates applied with [`UpdateOrigin::Peer`] must not be
//!   re-emitted as local updates, or the two peers will echo forever.
//!
//! `merge_updates` exists so the sync engine can coalesce a burst of local
//! edits into a single payload before putting it on the wire.

use crate::error::Result;

/// Where an update came from, threaded through `apply_update` so the
/// collaborator can suppress echo of peer-originated changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Produced by the local editor.
    Local,
    /// Received from the remote peer via the sync engine.
    Peer,
}

/// Handle to the collaborator's CRDT library.
///
/// All payloads are opaque bytes; the core never inspects them.
pub trait CrdtHandle: Send + Sync {
    /// Encode this peer's state vector.
    fn state_vector(&self) -> Vec<u8>;

    /// Encode the diff a peer with `remote_vector` is missing.
    ///
    /// An empty return means the remote is already up to date and nothing
    /// should be sent.
    fn encode_diff(&self, remote_vector: &[u8]) -> Vec<u8>;

    /// Apply an update to the document.
    fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<()>;

    /// Merge several queued updates into one equivalent update.
    fn merge_updates(&self, updates: &[Vec<u8>]) -> Vec<u8>;
}
