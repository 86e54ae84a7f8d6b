//! The sync engine actor.
//!
//! One task owns every piece of in-flight protocol state: pending remote
//! mail, awaited delivery confirmations, inbound chunk sets, relay entries,
//! board batching, and outstanding heartbeats. Inputs arrive as inbound
//! frames, commands from other subsystems, chunk-task completions, and a
//! periodic tick; nothing else touches the maps, so no locks are needed.
//!
//! Chunk transmission (which can spend minutes waiting on link ACKs) runs
//! on spawned tasks that report back through the event channel, keeping the
//! engine responsive to receives throughout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vireo_crypto::master::MasterKey;
use vireo_db::queries::peers;
use vireo_db::Db;
use vireo_transport::{Frame, Transport};
use vireo_types::clock::Clock;
use vireo_types::metrics::Metrics;

use crate::settings::SyncSettings;
use crate::wire::{self, FrameKind};
use crate::{RemoteMailRequest, Result, SyncError};

/// Capabilities the engine operates through.
pub struct EngineContext {
    pub db: Db,
    pub transport: Transport,
    pub master: Arc<MasterKey>,
    pub settings: SyncSettings,
    pub metrics: Metrics,
    pub clock: Clock,
}

/// Result of handing a remote mail to the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// The handshake is under way.
    Sent,
    /// No usable route right now; queued for redrive when one appears.
    Queued,
}

/// Where a pending outbound mail is in its handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PendingState {
    AwaitAck,
    SendingChunks,
}

/// Outbound remote mail awaiting MAILACK (or mid-chunk-transmission).
pub(crate) struct PendingRemoteMail {
    pub chunks: Vec<String>,
    pub dest_node: String,
    pub recipient: String,
    pub mailreq: String,
    pub attempts: u32,
    pub next_retry_us: i64,
    pub state: PendingState,
}

/// Chunks sent; awaiting MAILDLV.
pub(crate) struct AwaitingDlv {
    pub dest_node: String,
    pub chunks: Vec<String>,
    pub failed_chunks: Vec<u32>,
    pub attempts: u32,
    pub next_retry_us: i64,
}

/// Inbound remote mail collecting chunks.
pub(crate) struct IncomingRemoteMail {
    pub from_user: String,
    pub from_bbs: String,
    pub to_user: String,
    pub num_parts: u32,
    pub received: HashMap<u32, String>,
    pub sender_node: String,
    pub started_us: i64,
    pub delivering: bool,
}

/// Relay bookkeeping for a mail conversation passing through us.
pub(crate) struct RelayState {
    pub origin_node: String,
    pub dest_node: String,
    pub started_us: i64,
}

/// Outbound board batch awaiting BOARDACK/BOARDDLV.
pub(crate) struct PendingBoardSync {
    pub chunks: Vec<String>,
    pub max_ts_us: i64,
    pub started_us: i64,
}

/// Inbound board batch collecting chunks.
pub(crate) struct IncomingBoardSync {
    pub board_id: i64,
    pub num_parts: u32,
    pub received: HashMap<u32, String>,
    pub started_us: i64,
    pub delivering: bool,
}

/// Completions reported by spawned chunk-transmission tasks.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    MailChunksSent { uuid: String, failed: Vec<u32> },
    BoardChunksSent {
        board: String,
        peer_node: String,
        ok: bool,
    },
}

/// Commands from other subsystems.
pub enum EngineCommand {
    SendRemoteMail {
        request: RemoteMailRequest,
        reply: oneshot::Sender<Result<SendOutcome>>,
    },
    NotifyLocalPost { board: String },
    PropagateDelete { uuid: String },
}

/// The engine.
pub struct SyncEngine {
    pub(crate) ctx: EngineContext,

    // Remote mail
    pub(crate) pending_remote: HashMap<String, PendingRemoteMail>,
    pub(crate) awaiting_dlv: HashMap<String, AwaitingDlv>,
    pub(crate) incoming_mail: HashMap<String, IncomingRemoteMail>,
    pub(crate) relay: HashMap<String, RelayState>,

    // Bulletin sync
    pub(crate) board_counters: HashMap<String, u32>,
    pub(crate) last_board_flush_us: i64,
    pub(crate) pending_board: HashMap<(String, String), PendingBoardSync>,
    pub(crate) incoming_board: HashMap<(String, String), IncomingBoardSync>,

    // Route announcement
    pub(crate) pending_pings: HashMap<String, i64>,
    pub(crate) last_heartbeat_us: i64,
    pub(crate) last_route_share_us: i64,

    // Native sync
    pub(crate) pending_sync_acks: HashMap<String, (String, i64)>,
    pub(crate) last_hello_sent_us: HashMap<String, i64>,

    pub(crate) last_message_sweep_us: i64,

    pub(crate) events_tx: mpsc::UnboundedSender<EngineEvent>,
}

impl SyncEngine {
    /// Build an engine and the receiving side of its completion channel.
    ///
    /// Mirrors the configured peer list into the database so route and
    /// health queries see every peer from the first tick.
    pub fn new(ctx: EngineContext) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let now = ctx.clock.now_us();

        {
            let conn = ctx.db.lock();
            for peer in &ctx.settings.peers {
                if let Err(e) = peers::upsert_configured(
                    &conn,
                    &peer.node_id,
                    &peer.name,
                    "advbbs",
                    peer.enabled,
                    now,
                ) {
                    warn!("Failed to mirror peer {} into store: {e}", peer.node_id);
                }
            }
        }

        info!(
            "Sync engine initialized with {} peer(s)",
            ctx.settings.peers.len()
        );

        let engine = SyncEngine {
            ctx,
            pending_remote: HashMap::new(),
            awaiting_dlv: HashMap::new(),
            incoming_mail: HashMap::new(),
            relay: HashMap::new(),
            board_counters: HashMap::new(),
            last_board_flush_us: now,
            pending_board: HashMap::new(),
            incoming_board: HashMap::new(),
            pending_pings: HashMap::new(),
            last_heartbeat_us: 0,
            last_route_share_us: now,
            pending_sync_acks: HashMap::new(),
            last_hello_sent_us: HashMap::new(),
            last_message_sweep_us: now,
            events_tx,
        };
        (engine, events_rx)
    }

    /// Run a closure against the store.
    pub(crate) fn with_db<T>(
        &self,
        f: impl FnOnce(&rusqlite::Connection) -> vireo_db::Result<T>,
    ) -> vireo_db::Result<T> {
        let conn = self.ctx.db.lock();
        f(&conn)
    }

    pub(crate) fn now_us(&self) -> i64 {
        self.ctx.clock.now_us()
    }

    pub(crate) fn callsign(&self) -> &str {
        &self.ctx.settings.callsign
    }

    /// Fire-and-forget protocol send; failures are logged, never fatal.
    pub(crate) async fn send_frame(&self, text: &str, dest_node: &str) {
        if let Err(e) = self.ctx.transport.send_dm(text, dest_node).await {
            warn!("Protocol send to {dest_node} failed: {e}");
        }
    }

    /// Demultiplex an inbound frame. Returns whether it was consumed.
    ///
    /// Protocol errors are logged and swallowed here — a bad frame must
    /// never take the loop down.
    pub async fn handle_frame(&mut self, frame: &Frame) -> bool {
        if !self.ctx.settings.enabled {
            return false;
        }
        self.ctx.metrics.incr("sync.frames_rx", 1);

        match wire::classify(&frame.text) {
            FrameKind::Mail => {
                if !self.ctx.settings.is_peer(&frame.from) {
                    // Silent drop: no NAK for strangers.
                    warn!("Rejected mail protocol frame from non-peer {}", frame.from);
                    self.ctx.metrics.incr("sync.frames_unauthorized", 1);
                    return true;
                }
                if let Err(e) = self.handle_mail_frame(&frame.text, &frame.from).await {
                    self.log_protocol_error("mail", &e);
                }
                true
            }
            FrameKind::Board => {
                if !self.ctx.settings.is_peer(&frame.from) {
                    warn!("Rejected board protocol frame from non-peer {}", frame.from);
                    self.ctx.metrics.incr("sync.frames_unauthorized", 1);
                    return true;
                }
                if let Err(e) = self.handle_board_frame(&frame.text, &frame.from).await {
                    self.log_protocol_error("board", &e);
                }
                true
            }
            FrameKind::Native => {
                if let Err(e) = self.handle_native_frame(&frame.text, &frame.from).await {
                    self.log_protocol_error("native", &e);
                }
                true
            }
            FrameKind::Other => false,
        }
    }

    fn log_protocol_error(&self, family: &str, e: &SyncError) {
        match e {
            SyncError::MalformedFrame(detail) => {
                debug!("Dropped malformed {family} frame: {detail}");
                self.ctx.metrics.incr("sync.frames_malformed", 1);
            }
            other => warn!("Error handling {family} frame: {other}"),
        }
    }

    /// Apply a chunk-task completion.
    pub fn apply_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::MailChunksSent { uuid, failed } => {
                self.on_mail_chunks_sent(&uuid, failed);
            }
            EngineEvent::BoardChunksSent {
                board,
                peer_node,
                ok,
            } => {
                self.on_board_chunks_sent(&board, &peer_node, ok);
            }
        }
    }

    /// Periodic work: retries, garbage collection, heartbeats, route
    /// sweeps, board flushes, expiry sweeps.
    pub async fn tick(&mut self) {
        if !self.ctx.settings.enabled {
            return;
        }
        let now = self.now_us();

        self.retry_pending_mailreq(now).await;
        self.retry_awaiting_dlv(now);
        self.cleanup_stale_mail_state(now);
        self.cleanup_stale_board_state(now);
        self.cleanup_stale_sync_acks(now);

        self.maybe_flush_boards(now).await;

        if self.ctx.settings.rap_enabled {
            self.maybe_send_heartbeats(now).await;
            self.check_heartbeat_timeouts(now).await;
            self.maybe_share_routes(now).await;
            self.sweep_expired_routes(now);
            self.expire_pending_mail(now);
        }

        self.maybe_sweep_messages(now);
    }

    fn maybe_sweep_messages(&mut self, now: i64) {
        let interval_us = self.ctx.settings.message_sweep_interval_secs * 1_000_000;
        if now - self.last_message_sweep_us < interval_us {
            return;
        }
        self.last_message_sweep_us = now;
        match self.with_db(|conn| vireo_db::queries::messages::delete_expired(conn, now)) {
            Ok(n) if n > 0 => self.ctx.metrics.incr("store.messages_expired", n as u64),
            Ok(_) => {}
            Err(e) => warn!("Expired-message sweep failed: {e}"),
        }
    }

    /// Counters over the in-flight protocol state.
    pub fn stats(&self) -> SyncStats {
        SyncStats {
            pending_remote: self.pending_remote.len(),
            awaiting_dlv: self.awaiting_dlv.len(),
            incoming_mail: self.incoming_mail.len(),
            relay_entries: self.relay.len(),
            pending_board: self.pending_board.len(),
            incoming_board: self.incoming_board.len(),
            pending_pings: self.pending_pings.len(),
        }
    }

    fn cleanup_stale_sync_acks(&mut self, now: i64) {
        let timeout_us = 600 * 1_000_000;
        self.pending_sync_acks.retain(|uuid, (_, sent_us)| {
            let stale = now - *sent_us > timeout_us;
            if stale {
                warn!("Sync ACK timeout for {}", short(uuid));
            }
            !stale
        });
    }
}

/// Snapshot of the engine's in-flight state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub pending_remote: usize,
    pub awaiting_dlv: usize,
    pub incoming_mail: usize,
    pub relay_entries: usize,
    pub pending_board: usize,
    pub incoming_board: usize,
    pub pending_pings: usize,
}

/// Shared handle into a running engine.
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<EngineCommand>,
}

impl SyncHandle {
    /// Hand a remote mail to the engine.
    pub async fn send_remote_mail(&self, request: RemoteMailRequest) -> Result<SendOutcome> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(EngineCommand::SendRemoteMail { request, reply })
            .await
            .map_err(|_| SyncError::MalformedFrame("engine stopped".into()))?;
        rx.await
            .map_err(|_| SyncError::MalformedFrame("engine stopped".into()))?
    }

    /// Count a new locally-authored post toward the batch flush.
    pub async fn notify_local_post(&self, board: &str) {
        let _ = self
            .commands
            .send(EngineCommand::NotifyLocalPost {
                board: board.to_string(),
            })
            .await;
    }

    /// Ask peers to drop one of our messages.
    pub async fn propagate_delete(&self, uuid: &str) {
        let _ = self
            .commands
            .send(EngineCommand::PropagateDelete {
                uuid: uuid.to_string(),
            })
            .await;
    }
}

/// Spawn the engine loop.
pub fn spawn(
    mut engine: SyncEngine,
    mut events_rx: mpsc::UnboundedReceiver<EngineEvent>,
    mut frames: mpsc::Receiver<Frame>,
    mut shutdown: broadcast::Receiver<()>,
) -> (SyncHandle, JoinHandle<()>) {
    let (commands_tx, mut commands_rx) = mpsc::channel::<EngineCommand>(64);

    let task = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Sync engine shutting down");
                    break;
                }
                maybe_frame = frames.recv() => match maybe_frame {
                    Some(frame) => {
                        engine.handle_frame(&frame).await;
                    }
                    None => {
                        info!("Transport closed; sync engine stopping");
                        break;
                    }
                },
                Some(command) = commands_rx.recv() => match command {
                    EngineCommand::SendRemoteMail { request, reply } => {
                        let result = engine.send_remote_mail(&request).await;
                        let _ = reply.send(result);
                    }
                    EngineCommand::NotifyLocalPost { board } => {
                        engine.notify_local_post(&board);
                    }
                    EngineCommand::PropagateDelete { uuid } => {
                        engine.propagate_delete(&uuid).await;
                    }
                },
                Some(event) = events_rx.recv() => {
                    engine.apply_event(event);
                }
                _ = tick.tick() => {
                    engine.tick().await;
                }
            }
        }
    });

    (SyncHandle { commands: commands_tx }, task)
}

/// Abbreviate a UUID for logs.
pub(crate) fn short(uuid: &str) -> &str {
    &uuid[..uuid.len().min(8)]
}
