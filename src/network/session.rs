//! # Collaboration Session
//!
//! Actor wrapper for multi-threaded embedders. The
//! [`ChannelController`](super::ChannelController) is a single-owner state
//! machine; this module gives it a home: one spawned task owns the
//! controller, commands arrive through an mpsc inbox (FIFO, so ordering
//! matches the cooperative model), surfaced events fan out over a broadcast
//! channel, and one periodic tick drives both the CRDT coalescing flush and
//! the transfer retry scan.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │  CollabSession (handle)                                       │
//! │    send_file / cancel / local_update / channel_event ──┐      │
//! │                                                        ▼      │
//! │                                        mpsc inbox ─► task     │
//! │                                                        │      │
//! │    subscribe() ◄── broadcast events ◄── drain_events ──┘      │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! WASM embedders drive the controller directly on the browser's microtask
//! queue instead; this module is native-only.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::channel::{ChannelEvent, DataChannel};
use crate::crdt::{CrdtHandle, UpdateOrigin};
use crate::error::{Error, Result};
use crate::source::FileSource;
use crate::time::now_timestamp_millis;

use super::chunking::UPDATE_COALESCE_MS;
use super::events::{CollabEvent, TransferSnapshot};
use super::transfer::SendFileOptions;
use super::ChannelController;

/// Commands sent to the session task.
pub enum SessionCommand {
    /// Start an outgoing file transfer.
    SendFile {
        /// The file source to read from.
        source: Arc<dyn FileSource>,
        /// Transfer options.
        options: SendFileOptions,
        /// Channel for the resulting transfer id.
        reply: oneshot::Sender<Result<String>>,
    },
    /// Cancel an outgoing transfer.
    CancelTransfer {
        /// The transfer to cancel.
        id: String,
        /// Channel for the result.
        reply: oneshot::Sender<Result<()>>,
    },
    /// Feed one locally produced CRDT update.
    LocalUpdate {
        /// The opaque update payload.
        update: Vec<u8>,
        /// Where the update came from.
        origin: UpdateOrigin,
    },
    /// Send a chat message.
    Chat {
        /// Chat payload.
        data: String,
        /// Sender-side Unix timestamp in milliseconds.
        timestamp: i64,
    },
    /// Ask the peer for an asset.
    RequestFile {
        /// Logical asset path.
        asset_path: String,
        /// Optional display name.
        display_name: Option<String>,
    },
    /// Forward an event from the underlying channel.
    Channel(ChannelEvent),
    /// Fetch snapshots of every known transfer.
    Snapshots {
        /// Channel for the snapshots.
        reply: oneshot::Sender<Vec<TransferSnapshot>>,
    },
    /// Stop the session task.
    Shutdown,
}

impl std::fmt::Debug for SessionCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SendFile { options, .. } => f
                .debug_struct("SendFile")
                .field("name", &options.name)
                .finish(),
            Self::CancelTransfer { id, .. } => {
                f.debug_tuple("CancelTransfer").field(id).finish()
            }
            Self::LocalUpdate { update, origin } => f
                .debug_struct("LocalUpdate")
                .field("len", &update.len())
                .field("origin", origin)
                .finish(),
            Self::Chat { timestamp, .. } => {
                f.debug_struct("Chat").field("timestamp", timestamp).finish()
            }
            Self::RequestFile { asset_path, .. } => {
                f.debug_tuple("RequestFile").field(asset_path).finish()
            }
            Self::Channel(event) => f.debug_tuple("Channel").field(event).finish(),
            Self::Snapshots { .. } => write!(f, "Snapshots"),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Handle to a running collaboration session.
pub struct CollabSession {
    command_tx: mpsc::Sender<SessionCommand>,
    event_tx: broadcast::Sender<CollabEvent>,
    running: Arc<RwLock<bool>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CollabSession {
    /// Spawn the session task over a channel and a CRDT handle.
    ///
    /// If the channel is already open, the handshake goes out immediately;
    /// otherwise it waits for the embedder to forward
    /// [`ChannelEvent::Open`].
    pub fn spawn(channel: Arc<dyn DataChannel>, crdt: Arc<dyn CrdtHandle>) -> Self {
        let (command_tx, command_rx) = mpsc::channel(256);
        let (event_tx, _) = broadcast::channel(256);
        let running = Arc::new(RwLock::new(true));

        let loop_events = event_tx.clone();
        let loop_running = Arc::clone(&running);
        let handle = tokio::spawn(async move {
            run_session_loop(channel, crdt, command_rx, loop_events).await;
            *loop_running.write() = false;
        });

        Self {
            command_tx,
            event_tx,
            running,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Subscribe to surfaced events. Multiple subscribers are supported.
    pub fn subscribe(&self) -> broadcast::Receiver<CollabEvent> {
        self.event_tx.subscribe()
    }

    /// Whether the session task is still alive.
    pub fn is_running(&self) -> bool {
        *self.running.read()
    }

    /// Start an outgoing file transfer; resolves to the transfer id.
    pub async fn send_file(
        &self,
        source: Arc<dyn FileSource>,
        options: SendFileOptions,
    ) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.command(SessionCommand::SendFile {
            source,
            options,
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| Error::SendFailed("session dropped the reply".into()))?
    }

    /// Cancel an outgoing transfer.
    pub async fn cancel_transfer(&self, id: impl Into<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(SessionCommand::CancelTransfer {
            id: id.into(),
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| Error::SendFailed("session dropped the reply".into()))?
    }

    /// Feed one locally produced CRDT update.
    pub async fn local_update(&self, update: Vec<u8>, origin: UpdateOrigin) -> Result<()> {
        self.command(SessionCommand::LocalUpdate { update, origin })
            .await
    }

    /// Send a chat message (best-effort).
    pub async fn chat(&self, data: String, timestamp: i64) -> Result<()> {
        self.command(SessionCommand::Chat { data, timestamp }).await
    }

    /// Ask the peer for an asset.
    pub async fn request_file(
        &self,
        asset_path: String,
        display_name: Option<String>,
    ) -> Result<()> {
        self.command(SessionCommand::RequestFile {
            asset_path,
            display_name,
        })
        .await
    }

    /// Forward an event from the underlying channel.
    pub async fn channel_event(&self, event: ChannelEvent) -> Result<()> {
        self.command(SessionCommand::Channel(event)).await
    }

    /// Snapshots of every known transfer.
    pub async fn snapshots(&self) -> Result<Vec<TransferSnapshot>> {
        let (reply, rx) = oneshot::channel();
        self.command(SessionCommand::Snapshots { reply }).await?;
        rx.await
            .map_err(|_| Error::SendFailed("session dropped the reply".into()))
    }

    /// Stop the session task and wait for it to finish.
    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(SessionCommand::Shutdown).await;
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        *self.running.write() = false;
    }

    async fn command(&self, command: SessionCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| Error::SendFailed("session loop is gone".into()))
    }
}

// ============================================================================
// SESSION LOOP
// ============================================================================

async fn run_session_loop(
    channel: Arc<dyn DataChannel>,
    crdt: Arc<dyn CrdtHandle>,
    mut command_rx: mpsc::Receiver<SessionCommand>,
    event_tx: broadcast::Sender<CollabEvent>,
) {
    let mut controller = ChannelController::new(Arc::clone(&channel), crdt);

    // A channel handed over already open never fires its own open event.
    if channel.ready_state().is_open() {
        controller
            .handle_channel_event(ChannelEvent::Open, now_timestamp_millis())
            .await;
    }
    forward_events(&mut controller, &event_tx);

    // One tick drives both timers: the coalescing deadline and the retry
    // scan both tolerate the coalescing interval as jitter.
    let mut tick = tokio::time::interval(Duration::from_millis(UPDATE_COALESCE_MS as u64));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = command_rx.recv() => {
                match command {
                    None | Some(SessionCommand::Shutdown) => {
                        tracing::info!("Collaboration session shutting down");
                        break;
                    }
                    Some(command) => dispatch(&mut controller, command).await,
                }
            }
            _ = tick.tick() => {
                controller.poll_timers(now_timestamp_millis()).await;
            }
        }
        forward_events(&mut controller, &event_tx);
    }
}

async fn dispatch(controller: &mut ChannelController, command: SessionCommand) {
    let now_ms = now_timestamp_millis();
    match command {
        SessionCommand::SendFile {
            source,
            options,
            reply,
        } => {
            let result = controller.send_file(source, options, now_ms).await;
            let _ = reply.send(result);
        }
        SessionCommand::CancelTransfer { id, reply } => {
            let _ = reply.send(controller.cancel_transfer(&id, now_ms));
        }
        SessionCommand::LocalUpdate { update, origin } => {
            controller.local_update(&update, origin, now_ms);
        }
        SessionCommand::Chat { data, timestamp } => {
            if let Err(err) = controller.send_chat(data, timestamp) {
                tracing::debug!("Chat message not sent: {}", err);
            }
        }
        SessionCommand::RequestFile {
            asset_path,
            display_name,
        } => {
            if let Err(err) = controller.request_file(asset_path, display_name) {
                tracing::debug!("File request not sent: {}", err);
            }
        }
        SessionCommand::Channel(event) => {
            controller.handle_channel_event(event, now_ms).await;
        }
        SessionCommand::Snapshots { reply } => {
            let _ = reply.send(controller.snapshots());
        }
        // handled by the loop before dispatch
        SessionCommand::Shutdown => {}
    }
}

fn forward_events(controller: &mut ChannelController, event_tx: &broadcast::Sender<CollabEvent>) {
    for event in controller.drain_events() {
        // no subscribers is fine
        let _ = event_tx.send(event);
    }
}

// ============================================================================
// TESTS
// ============================================================================
