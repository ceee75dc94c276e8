//! Shared test doubles: a scriptable in-memory data channel and a
//! set-union CRDT with real convergence semantics.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::{ChannelEvent, ChannelState, DataChannel};
use crate::crdt::{CrdtHandle, UpdateOrigin};
use crate::error::{Error, Result};
use crate::network::ChannelController;

// ============================================================================
// TEST CHANNEL
// ============================================================================

/// In-memory data channel double. Sent messages land in outboxes the test
/// shuttles by hand; `buffered_amount` is either scripted or accumulated.
pub(crate) struct TestChannel {
    state: Mutex<ChannelState>,
    buffered: Mutex<usize>,
    accumulate: Mutex<bool>,
    fail_sends: Mutex<bool>,
    outbox_text: Mutex<Vec<String>>,
    outbox_binary: Mutex<Vec<Vec<u8>>>,
    low_threshold: Mutex<usize>,
}

impl TestChannel {
    pub fn open() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ChannelState::Open),
            buffered: Mutex::new(0),
            accumulate: Mutex::new(false),
            fail_sends: Mutex::new(false),
            outbox_text: Mutex::new(Vec::new()),
            outbox_binary: Mutex::new(Vec::new()),
            low_threshold: Mutex::new(0),
        })
    }

    pub fn set_state(&self, state: ChannelState) {
        *self.state.lock() = state;
    }

    pub fn set_buffered(&self, bytes: usize) {
        *self.buffered.lock() = bytes;
    }

    /// When enabled, sends add their length to `buffered_amount` like a
    /// real channel whose transport never drains.
    pub fn set_accumulate(&self, on: bool) {
        *self.accumulate.lock() = on;
    }

    pub fn set_fail_sends(&self, on: bool) {
        *self.fail_sends.lock() = on;
    }

    pub fn low_threshold(&self) -> usize {
        *self.low_threshold.lock()
    }

    pub fn take_text(&self) -> Vec<String> {
        std::mem::take(&mut self.outbox_text.lock())
    }

    pub fn take_binary(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbox_binary.lock())
    }
}

impl DataChannel for TestChannel {
    fn send_text(&self, text: &str) -> Result<()> {
        if !self.ready_state().is_open() {
            return Err(Error::ChannelNotOpen);
        }
        if *self.fail_sends.lock() {
            return Err(Error::SendFailed("test channel send failure".into()));
        }
        self.outbox_text.lock().push(text.to_string());
        if *self.accumulate.lock() {
            *self.buffered.lock() += text.len();
        }
        Ok(())
    }

    fn send_binary(&self, data: &[u8]) -> Result<()> {
        if !self.ready_state().is_open() {
            return Err(Error::ChannelNotOpen);
        }
        if *self.fail_sends.lock() {
            return Err(Error::SendFailed("test channel send failure".into()));
        }
        self.outbox_binary.lock().push(data.to_vec());
        if *self.accumulate.lock() {
            *self.buffered.lock() += data.len();
        }
        Ok(())
    }

    fn buffered_amount(&self) -> usize {
        *self.buffered.lock()
    }

    fn ready_state(&self) -> ChannelState {
        *self.state.lock()
    }

    fn set_buffered_amount_low_threshold(&self, bytes: usize) {
        *self.low_threshold.lock() = bytes;
    }
}

// ============================================================================
// SET CRDT
// ============================================================================

/// Grow-only set CRDT: updates and state vectors are JSON string arrays,
/// merging is set union. Order-free and idempotent, so any interleaving of
/// applies converges — which is exactly what the sync tests need to verify.
pub(crate) struct SetCrdt {
    state: Mutex<BTreeSet<String>>,
}

impl SetCrdt {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BTreeSet::new()),
        })
    }

    /// Local edit: insert an element and return the update describing it.
    pub fn insert(&self, value: &str) -> Vec<u8> {
        self.state.lock().insert(value.to_string());
        serde_json::to_vec(&vec![value.to_string()]).expect("string array serializes")
    }

    pub fn contains(&self, value: &str) -> bool {
        self.state.lock().contains(value)
    }

    pub fn len(&self) -> usize {
        self.state.lock().len()
    }
}

impl CrdtHandle for SetCrdt {
    fn state_vector(&self) -> Vec<u8> {
        serde_json::to_vec(&*self.state.lock()).expect("string set serializes")
    }

    fn encode_diff(&self, remote_vector: &[u8]) -> Vec<u8> {
        let remote: BTreeSet<String> = serde_json::from_slice(remote_vector).unwrap_or_default();
        let diff: Vec<String> = self
            .state
            .lock()
            .iter()
            .filter(|item| !remote.contains(*item))
            .cloned()
            .collect();
        if diff.is_empty() {
            Vec::new()
        } else {
            serde_json::to_vec(&diff).expect("string array serializes")
        }
    }

    fn apply_update(&self, update: &[u8], _origin: UpdateOrigin) -> Result<()> {
        let items: Vec<String> = serde_json::from_slice(update)?;
        self.state.lock().extend(items);
        Ok(())
    }

    fn merge_updates(&self, updates: &[Vec<u8>]) -> Vec<u8> {
        let mut merged: BTreeSet<String> = BTreeSet::new();
        for update in updates {
            if let Ok(items) = serde_json::from_slice::<Vec<String>>(update) {
                merged.extend(items);
            }
        }
        serde_json::to_vec(&merged).expect("string set serializes")
    }
}

// ============================================================================
// MESSAGE SHUTTLE
// ============================================================================

/// Fault injection for [`shuttle`]: return `true` to drop a message.
pub(crate) struct Faults {
    pub a_to_b_text: Box<dyn FnMut(&str) -> bool>,
    pub a_to_b_binary: Box<dyn FnMut(&[u8]) -> bool>,
    pub b_to_a_text: Box<dyn FnMut(&str) -> bool>,
    pub b_to_a_binary: Box<dyn FnMut(&[u8]) -> bool>,
}

impl Default for Faults {
    fn default() -> Self {
        Self {
            a_to_b_text: Box::new(|_| false),
            a_to_b_binary: Box::new(|_| false),
            b_to_a_text: Box::new(|_| false),
            b_to_a_binary: Box::new(|_| false),
        }
    }
}

/// Deliver queued messages between two controllers until both sides go
/// quiet. Dropped messages are consumed, not retried — retries must come
/// from the protocol itself.
pub(crate) async fn shuttle(
    a: &mut ChannelController,
    channel_a: &Arc<TestChannel>,
    b: &mut ChannelController,
    channel_b: &Arc<TestChannel>,
    faults: &mut Faults,
    now_ms: i64,
) {
    loop {
        let mut delivered = false;

        for text in channel_a.take_text() {
            if (faults.a_to_b_text)(&text) {
                continue;
            }
            delivered = true;
            b.handle_channel_event(ChannelEvent::Text(text), now_ms).await;
        }
        for data in channel_a.take_binary() {
            if (faults.a_to_b_binary)(&data) {
                continue;
            }
            delivered = true;
            b.handle_channel_event(ChannelEvent::Binary(data), now_ms).await;
        }
        for text in channel_b.take_text() {
            if (faults.b_to_a_text)(&text) {
                continue;
            }
            delivered = true;
            a.handle_channel_event(ChannelEvent::Text(text), now_ms).await;
        }
        for data in channel_b.take_binary() {
            if (faults.b_to_a_binary)(&data) {
                continue;
            }
            delivered = true;
            a.handle_channel_event(ChannelEvent::Binary(data), now_ms).await;
        }

        if !delivered {
            break;
        }
    }
}
