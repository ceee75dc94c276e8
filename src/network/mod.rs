//! # Network Module
//!
//! The peer-to-peer collaboration transport: document sync and file
//! transfer multiplexed over one flow-controlled data channel.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        COLLABORATION TRANSPORT                          │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   local edits          send_file / cancel            channel events    │
//! │       │                        │                           │           │
//! │       ▼                        ▼                           ▼           │
//! │  ┌───────────┐          ┌──────────────┐          ┌─────────────────┐  │
//! │  │ SyncEngine│          │TransferEngine│◄─────────│ChannelController│  │
//! │  │           │          │              │  routes  │                 │  │
//! │  │ coalesce  │          │ windows,     │  text /  │ dispatch, pump, │  │
//! │  │ b64 + cut │          │ ACK, resend, │  binary  │ lifecycle,      │  │
//! │  │ reassemble│          │ retry, cancel│          │ events buffer   │  │
//! │  └─────┬─────┘          └──────┬───────┘          └────────┬────────┘  │
//! │        │ control JSON          │ chunk frames              │           │
//! │        ▼                       ▼                           │           │
//! │  ──────────────────┐    ┌───────────┐                      │           │
//! │   send_control     │    │ SendQueue │── drain while ───────┘           │
//! │   (direct, with    │    │  (FIFO)   │   bufferedAmount < high-water    │
//! │    pending retry)  │    └───────────┘                                  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Control JSON goes straight to the channel (with engine-level re-queue on
//! backpressure); binary chunk frames go through the shared FIFO send queue
//! which drains against the channel's buffer budget.
//!
//! ## Concurrency
//!
//! The controller is a single-owner state machine: every mutation happens
//! between await points, and the only suspension points are file-source
//! reads and the embedder's timers. Multi-threaded embedders wrap it in the
//! [`session::CollabSession`] actor, which serializes commands through an
//! inbox.

pub mod chunking;
pub mod events;
pub mod frame;
pub mod protocol;
pub mod send_queue;
pub mod sync;
pub mod transfer;

#[cfg(not(target_arch = "wasm32"))]
pub mod session;

#[cfg(test)]
pub(crate) mod test_support;

pub use events::{CollabEvent, TransferDirection, TransferSnapshot, TransferStatus};
pub use protocol::ControlMessage;
pub use send_queue::{PendingChunkPacket, SendQueue};
pub use sync::SyncEngine;
pub use transfer::{ChunkJob, SendFileOptions, SpeedTracker, TransferEngine};

#[cfg(not(target_arch = "wasm32"))]
pub use session::{CollabSession, SessionCommand};

use std::collections::VecDeque;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use uuid::Uuid;

use crate::channel::{ChannelEvent, DataChannel};
use crate::crdt::{CrdtHandle, UpdateOrigin};
use crate::error::{Error, Result};
use crate::source::FileSource;

use chunking::{
    DATA_CHANNEL_MAX_BUFFER, DATA_CHANNEL_RESUME_THRESHOLD, MAX_MESSAGE_CHUNK_SIZE,
};
use transfer::{ChunkReceipt, InitOutcome};

/// Owns one data channel and the two engines multiplexed over it.
///
/// All methods take `&mut self` and a caller-sampled `now_ms`; the
/// controller never reads the clock or spawns tasks itself. Feed it
/// [`ChannelEvent`]s as they occur and call [`poll_timers`](Self::poll_timers)
/// periodically (the coalescing interval is a good cadence); collect
/// surfaced events with [`drain_events`](Self::drain_events) after each
/// call.
///
/// Constructing a second controller over a second channel yields fully
/// disjoint state.
pub struct ChannelController {
    channel: Arc<dyn DataChannel>,
    queue: SendQueue,
    sync: SyncEngine,
    transfers: TransferEngine,
    events: VecDeque<CollabEvent>,
    /// Set once the state vector went out on the current channel
    /// incarnation; cleared on close so a reopened channel resyncs.
    handshake_done: bool,
}

impl ChannelController {
    /// Create a controller over a connected (or connecting) channel.
    ///
    /// Configures the channel's low-water threshold. The channel must
    /// deliver binary messages as raw bytes. If the channel is already
    /// open, feed a synthetic [`ChannelEvent::Open`] to trigger the
    /// handshake.
    pub fn new(channel: Arc<dyn DataChannel>, crdt: Arc<dyn CrdtHandle>) -> Self {
        channel.set_buffered_amount_low_threshold(DATA_CHANNEL_RESUME_THRESHOLD);
        Self {
            channel,
            queue: SendQueue::new(),
            sync: SyncEngine::new(crdt),
            transfers: TransferEngine::new(),
            events: VecDeque::new(),
            handshake_done: false,
        }
    }

    // ── Public API ──────────────────────────────────────────────────────

    /// Start sending a file. Returns the transfer id.
    ///
    /// Fails with [`Error::InitFailed`] when the announcement could not be
    /// delivered; the transfer is then surfaced once as Failed and nothing
    /// else is registered.
    pub async fn send_file(
        &mut self,
        source: Arc<dyn FileSource>,
        options: SendFileOptions,
        now_ms: i64,
    ) -> Result<String> {
        let (id, init) = self.transfers.register_outgoing(source, options, now_ms);

        if let Err(err) = self.send_control(&init) {
            let failure = Error::InitFailed(err.to_string());
            if let Some(snapshot) =
                self.transfers.fail_outgoing(&id, &failure.to_string(), now_ms)
            {
                self.emit(CollabEvent::TransferUpdated(snapshot));
            }
            return Err(failure);
        }

        if let Some(snapshot) = self.transfers.snapshot(&id) {
            self.emit(CollabEvent::TransferUpdated(snapshot));
        }

        let jobs = self.transfers.window_jobs(&id);
        self.run_jobs(jobs, now_ms).await;
        self.drain_queue();
        Ok(id)
    }

    /// Cancel an outgoing transfer.
    ///
    /// Synchronous from the caller's perspective: on return no further
    /// frames for the id will be enqueued, queued frames are purged, and a
    /// best-effort `file-error` went out. Completes locally even when the
    /// channel is closed.
    pub fn cancel_transfer(&mut self, id: &str, now_ms: i64) -> Result<()> {
        let Some((message, snapshot)) = self.transfers.cancel_outgoing(id, now_ms) else {
            return Err(Error::TransferNotFound(id.to_string()));
        };

        let purged = self.queue.clear_for(id);
        if purged > 0 {
            tracing::debug!("Purged {} queued frames for cancelled transfer {}", purged, id);
        }
        if let Err(err) = self.send_control(&message) {
            tracing::debug!("Cancel notice for {} not delivered: {}", id, err);
        }
        self.emit(CollabEvent::TransferUpdated(snapshot));
        Ok(())
    }

    /// Feed one locally produced CRDT update. Peer-originated updates are
    /// ignored here — they were already applied on receipt.
    pub fn local_update(&mut self, update: &[u8], origin: UpdateOrigin, now_ms: i64) {
        if origin == UpdateOrigin::Peer {
            return;
        }
        self.sync.queue_local(update, now_ms);
    }

    /// Send a chat message.
    pub fn send_chat(&mut self, data: String, timestamp: i64) -> Result<()> {
        self.send_control(&ControlMessage::Chat { data, timestamp })
    }

    /// Ask the peer to send an asset (`file-request`).
    pub fn request_file(
        &mut self,
        asset_path: String,
        display_name: Option<String>,
    ) -> Result<()> {
        self.send_control(&ControlMessage::FileRequest {
            asset_path,
            display_name,
        })
    }

    /// Drive the two timers: the CRDT coalescing flush and the per-transfer
    /// retry scan. Call periodically; the coalescing interval is a good
    /// cadence.
    pub async fn poll_timers(&mut self, now_ms: i64) {
        if let Some(update) = self.sync.take_flush(now_ms) {
            self.send_y_update(update);
        }

        for (id, sequences) in self.transfers.retry_due(now_ms) {
            let jobs = self.transfers.resend_jobs(&id, &sequences);
            self.run_jobs(jobs, now_ms).await;
        }

        self.drain_queue();
    }

    /// Handle one channel event.
    pub async fn handle_channel_event(&mut self, event: ChannelEvent, now_ms: i64) {
        match event {
            ChannelEvent::Open => {
                tracing::info!("Data channel open");
                self.try_handshake();
                self.flush_pending_updates();
                self.pump_all(now_ms).await;
            }
            ChannelEvent::BufferedAmountLow => {
                self.try_handshake();
                self.flush_pending_updates();
                self.pump_all(now_ms).await;
            }
            ChannelEvent::Closed => {
                tracing::info!("Data channel closed");
                self.on_channel_down(now_ms);
            }
            ChannelEvent::Error(reason) => {
                tracing::warn!("Data channel error: {}", reason);
                self.on_channel_down(now_ms);
            }
            ChannelEvent::Text(text) => {
                self.handle_text(&text, now_ms).await;
            }
            ChannelEvent::Binary(data) => {
                self.handle_binary(&data, now_ms);
            }
        }
        self.drain_queue();
    }

    /// Drain buffered events for the application layer.
    pub fn drain_events(&mut self) -> Vec<CollabEvent> {
        self.events.drain(..).collect()
    }

    /// Snapshot of one transfer.
    pub fn snapshot(&self, id: &str) -> Option<TransferSnapshot> {
        self.transfers.snapshot(id)
    }

    /// Snapshots of every known transfer.
    pub fn snapshots(&self) -> Vec<TransferSnapshot> {
        self.transfers.snapshots()
    }

    /// Drop terminal transfer records.
    pub fn clear_completed(&mut self) {
        self.transfers.clear_completed();
    }

    // ── Inbound dispatch ────────────────────────────────────────────────

    async fn handle_text(&mut self, text: &str, now_ms: i64) {
        let message = match ControlMessage::from_json(text) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!("Dropping unparseable control message: {}", err);
                return;
            }
        };

        match message {
            ControlMessage::YjsSync { vector } => {
                if let Some(diff) = self.sync.diff_for(&vector) {
                    self.send_y_update(diff);
                }
                self.flush_pending_updates();
            }
            ControlMessage::YjsUpdate { update } => {
                self.sync.apply_remote(&update);
            }
            ControlMessage::YjsUpdateChunk {
                id,
                index,
                total,
                chunk,
            } => {
                self.sync.store_chunk(&id, index, total, chunk);
            }
            ControlMessage::Chat { data, timestamp } => {
                self.emit(CollabEvent::Chat { data, timestamp });
            }
            ControlMessage::FileInit {
                id,
                name,
                size,
                mime,
                chunk_size,
                total_chunks,
                ..
            } => {
                match self.transfers.register_incoming(
                    &id,
                    name,
                    mime,
                    size,
                    chunk_size as usize,
                    total_chunks,
                    now_ms,
                ) {
                    InitOutcome::AlreadyKnown => {}
                    InitOutcome::Registered { snapshot } => {
                        self.emit(CollabEvent::TransferUpdated(snapshot));
                    }
                    InitOutcome::Finalized {
                        snapshot,
                        metadata,
                        data,
                        complete,
                    } => {
                        self.send_best_effort(&complete);
                        self.emit(CollabEvent::TransferUpdated(snapshot));
                        self.emit(CollabEvent::FileReceived { metadata, data });
                    }
                }
            }
            ControlMessage::FileAck {
                id, acked, missing, ..
            } => {
                if let Some(outcome) =
                    self.transfers.on_ack(&id, &acked, missing.as_deref(), now_ms)
                {
                    self.emit(CollabEvent::TransferUpdated(outcome.snapshot));
                    if !outcome.resend.is_empty() {
                        let jobs = self.transfers.resend_jobs(&id, &outcome.resend);
                        self.run_jobs(jobs, now_ms).await;
                    }
                    let jobs = self.transfers.window_jobs(&id);
                    self.run_jobs(jobs, now_ms).await;
                }
            }
            ControlMessage::FileResend { id, missing } => {
                let jobs = self.transfers.resend_jobs(&id, &missing);
                self.run_jobs(jobs, now_ms).await;
            }
            ControlMessage::FileComplete { id } => {
                if let Some(snapshot) = self.transfers.on_complete(&id, now_ms) {
                    self.emit(CollabEvent::TransferUpdated(snapshot));
                }
            }
            ControlMessage::FileError { id, reason } => {
                if let Some(snapshot) = self.transfers.on_peer_error(&id, &reason, now_ms) {
                    self.queue.clear_for(&id);
                    self.emit(CollabEvent::TransferUpdated(snapshot));
                }
            }
            ControlMessage::FileRequest {
                asset_path,
                display_name,
            } => {
                self.emit(CollabEvent::FileRequested {
                    asset_path,
                    display_name,
                });
            }
        }
    }

    fn handle_binary(&mut self, data: &[u8], now_ms: i64) {
        let Some(chunk) = frame::decode(data) else {
            tracing::debug!("Dropping non-frame binary message ({} bytes)", data.len());
            return;
        };

        match self
            .transfers
            .store_chunk(&chunk.id, chunk.sequence, &chunk.payload, now_ms)
        {
            ChunkReceipt::Unknown => {}
            ChunkReceipt::Duplicate { ack, complete } => {
                self.send_best_effort(&ack);
                if let Some(complete) = complete {
                    self.send_best_effort(&complete);
                }
            }
            ChunkReceipt::Stored {
                ack,
                resend,
                snapshot,
                finalized,
            } => {
                self.send_best_effort(&ack);
                if let Some(resend) = resend {
                    self.send_best_effort(&resend);
                }
                self.emit(CollabEvent::TransferUpdated(snapshot));
                if let Some((metadata, data, complete)) = finalized {
                    self.send_best_effort(&complete);
                    self.emit(CollabEvent::FileReceived { metadata, data });
                }
            }
        }
    }

    // ── Outbound plumbing ───────────────────────────────────────────────

    /// Serialize and send one control message, honoring the buffer budget.
    fn send_control(&self, message: &ControlMessage) -> Result<()> {
        let text = message.to_json()?;
        if !self.channel.ready_state().is_open() {
            return Err(Error::ChannelNotOpen);
        }
        if self.channel.buffered_amount() >= DATA_CHANNEL_MAX_BUFFER {
            return Err(Error::Backpressure);
        }
        self.channel.send_text(&text)
    }

    /// Fire-and-forget control send. ACKs and completion notices tolerate
    /// loss: the transfer layer re-issues them via the retry path.
    fn send_best_effort(&self, message: &ControlMessage) {
        if let Err(err) = self.send_control(message) {
            tracing::debug!("Best-effort control message not sent: {}", err);
        }
    }

    /// Send one CRDT update, chunking oversized envelopes. Returns false
    /// when the update was parked on the pending queue instead.
    fn send_y_update(&mut self, update: Vec<u8>) -> bool {
        if !self.channel.ready_state().is_open()
            || self.channel.buffered_amount() >= DATA_CHANNEL_MAX_BUFFER
        {
            self.sync.push_pending(update);
            return false;
        }

        let encoded = STANDARD.encode(&update);
        if encoded.len() <= MAX_MESSAGE_CHUNK_SIZE {
            match self.send_control(&ControlMessage::YjsUpdate { update: encoded }) {
                Ok(()) => true,
                Err(err) => {
                    tracing::debug!("Re-queuing update after send failure: {}", err);
                    self.sync.push_pending(update);
                    false
                }
            }
        } else {
            // Oversized: cut the envelope into slices under one chunk-set
            // id. On any mid-set failure the peer would hold a partial set
            // forever, so the whole original update is re-queued and the
            // partial set left to the receiver's eviction.
            let slices = sync::split_envelope(&encoded);
            let total = slices.len() as u32;
            let chunk_id = Uuid::new_v4().to_string();
            for (index, slice) in slices.iter().enumerate() {
                let message = ControlMessage::YjsUpdateChunk {
                    id: chunk_id.clone(),
                    index: index as u32,
                    total,
                    chunk: (*slice).to_string(),
                };
                if let Err(err) = self.send_control(&message) {
                    tracing::debug!(
                        "Re-queuing whole update after chunk {}/{} send failure: {}",
                        index,
                        total,
                        err
                    );
                    self.sync.push_pending(update);
                    return false;
                }
            }
            true
        }
    }

    /// Send parked updates, oldest first, stopping (and re-parking in
    /// order) at the first failure.
    fn flush_pending_updates(&mut self) {
        let updates = self.sync.take_pending();
        let mut iter = updates.into_iter();
        while let Some(update) = iter.next() {
            if !self.send_y_update(update) {
                for rest in iter {
                    self.sync.push_pending(rest);
                }
                break;
            }
        }
    }

    /// Emit the state vector once per channel incarnation.
    fn try_handshake(&mut self) {
        if self.handshake_done {
            return;
        }
        let message = self.sync.handshake_message();
        match self.send_control(&message) {
            Ok(()) => self.handshake_done = true,
            Err(err) => tracing::warn!("Handshake deferred: {}", err),
        }
    }

    fn on_channel_down(&mut self, now_ms: i64) {
        let snapshots = self
            .transfers
            .fail_all(&Error::ChannelClosed.to_string(), now_ms);
        for snapshot in snapshots {
            self.emit(CollabEvent::TransferUpdated(snapshot));
        }
        self.queue.reset();
        self.handshake_done = false;
        // The CRDT pending queue is retained for the next open.
    }

    /// Run read jobs: pull the slice from the source, frame it, enqueue it.
    /// A failed read fails the whole transfer.
    async fn run_jobs(&mut self, jobs: Vec<ChunkJob>, now_ms: i64) {
        for job in jobs {
            let read = job.source.read(job.start, job.end).await;
            self.transfers.finish_read(&job.id, job.sequence);

            // cancelled or failed while the read was in flight
            if !self.transfers.is_outgoing_active(&job.id) {
                continue;
            }

            match read {
                Ok(data) => match frame::encode(&job.id, job.sequence, &data) {
                    Ok(encoded) => {
                        self.queue.enqueue(PendingChunkPacket {
                            id: job.id.clone(),
                            sequence: job.sequence,
                            size: encoded.len(),
                            frame: encoded,
                        });
                    }
                    Err(err) => {
                        self.fail_and_purge(&job.id, &err.to_string(), now_ms);
                    }
                },
                Err(err) => {
                    self.fail_and_purge(&job.id, &err.to_string(), now_ms);
                }
            }
        }
    }

    fn fail_and_purge(&mut self, id: &str, reason: &str, now_ms: i64) {
        if let Some(snapshot) = self.transfers.fail_outgoing(id, reason, now_ms) {
            self.queue.clear_for(id);
            self.emit(CollabEvent::TransferUpdated(snapshot));
        }
    }

    async fn pump_all(&mut self, now_ms: i64) {
        for id in self.transfers.pumpable_outgoing() {
            let jobs = self.transfers.window_jobs(&id);
            self.run_jobs(jobs, now_ms).await;
        }
    }

    fn drain_queue(&mut self) {
        let sent = self.queue.drain(self.channel.as_ref());
        if sent > 0 {
            let stats = CollabEvent::QueueStats {
                queued_packets: self.queue.len(),
                queued_bytes: self.queue.queued_bytes(),
                buffered_amount: self.channel.buffered_amount(),
            };
            self.emit(stats);
        }
    }

    fn emit(&mut self, event: CollabEvent) {
        self.events.push_back(event);
    }
}

// ============================================================================
// TESTS
// ============================================================================
