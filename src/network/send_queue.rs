//! # Send Queue
//!
//! One FIFO of encoded chunk frames, shared by every outgoing transfer.
//! Frames drain into the channel only while `buffered_amount` stays under
//! [`DATA_CHANNEL_MAX_BUFFER`]; when the channel's buffer drains below the
//! low-water threshold the controller calls [`SendQueue::drain`] again.
//!
//! Control JSON never passes through here — it is sent directly and relies
//! on its own retry paths (the CRDT pending queue, the transfer retry
//! timer).

use std::collections::VecDeque;

use bytes::Bytes;

use crate::channel::DataChannel;
use crate::network::chunking::DATA_CHANNEL_MAX_BUFFER;

/// One encoded chunk frame waiting for channel headroom.
#[derive(Debug, Clone)]
pub struct PendingChunkPacket {
    /// Transfer the frame belongs to (for cancellation purges).
    pub id: String,
    /// Sequence carried by the frame.
    pub sequence: u32,
    /// The fully encoded frame.
    pub frame: Bytes,
    /// Frame length in bytes, tracked for queue accounting.
    pub size: usize,
}

/// FIFO of outbound chunk frames with byte accounting.
#[derive(Debug, Default)]
pub struct SendQueue {
    queue: VecDeque<PendingChunkPacket>,
    queued_bytes: usize,
}

impl SendQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame. The caller schedules a drain at its next yield point
    /// so bursts of enqueues coalesce into one drain pass.
    pub fn enqueue(&mut self, packet: PendingChunkPacket) {
        self.queued_bytes += packet.size;
        self.queue.push_back(packet);
    }

    /// Remove every queued frame belonging to `id`.
    pub fn clear_for(&mut self, id: &str) -> usize {
        let before = self.queue.len();
        self.queue.retain(|p| p.id != id);
        let removed = before - self.queue.len();
        self.queued_bytes = self.queue.iter().map(|p| p.size).sum();
        removed
    }

    /// Drop everything. Used when the channel closes.
    pub fn reset(&mut self) {
        self.queue.clear();
        self.queued_bytes = 0;
    }

    /// Number of queued frames.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Total bytes across queued frames.
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Push frames into the channel while it is open and under the
    /// high-water mark. Stops at the first failed send, leaving that frame
    /// at the head for the next pass. Returns how many frames were sent.
    pub fn drain(&mut self, channel: &dyn DataChannel) -> usize {
        let mut sent = 0;

        while channel.ready_state().is_open()
            && channel.buffered_amount() < DATA_CHANNEL_MAX_BUFFER
        {
            let Some(packet) = self.queue.pop_front() else {
                break;
            };

            match channel.send_binary(&packet.frame) {
                Ok(()) => {
                    self.queued_bytes -= packet.size;
                    sent += 1;
                }
                Err(err) => {
                    tracing::debug!(
                        "Send queue drain stopped at transfer {} seq {}: {}",
                        packet.id,
                        packet.sequence,
                        err
                    );
                    self.queue.push_front(packet);
                    break;
                }
            }
        }

        sent
    }
}

// ============================================================================
// TESTS
// ============================================================================
