//! Bulletin sync protocol.
//!
//! Same five-verb shape as remote mail, moving batched multi-post payloads:
//!
//! ```text
//! BOARDREQ|board_name|count|since_us
//! BOARDACK|board_name|OK
//! BOARDNAK|board_name|reason       reason ∈ NOBOARD NOSYNC
//! BOARDDAT|board_name|seq/total|chunk
//! BOARDDLV|board_name|OK
//! ```
//!
//! The reassembled payload is a record stream: records separated by 0x1F,
//! fields by 0x1E, in the order `uuid, author, origin_bbs, timestamp_us,
//! subject, body`. The per-peer watermark (`last_board_sync_us`) advances
//! only when BOARDDLV is heard, so a lost batch re-presents on the next
//! flush.

use tracing::{debug, info, warn};

use vireo_db::queries::{boards, messages, nodes, peers, users};
use vireo_transport::Transport;
use vireo_types::message::{MessageType, BULLETIN_EXPIRY_DAYS};

use crate::chunk::{self, BOARD_CHUNK_BYTES};
use crate::engine::{EngineEvent, IncomingBoardSync, PendingBoardSync, SyncEngine};
use crate::mrp::jitter;
use crate::wire::{BoardNakReason, BoardVerb};
use crate::Result;

const MICROS: i64 = 1_000_000;

/// Record separator within a reassembled payload.
const RECORD_SEP: char = '\u{1f}';

/// Field separator within a record.
const FIELD_SEP: char = '\u{1e}';

impl SyncEngine {
    /// Count a new locally-authored post toward the batch flush.
    pub fn notify_local_post(&mut self, board: &str) {
        let counter = self.board_counters.entry(board.to_string()).or_insert(0);
        *counter += 1;
        info!("Board sync counter: {board} = {counter}");
    }

    /// Flush batched posts when the counters say so: ten posts force it,
    /// one post is enough after an hour.
    pub(crate) async fn maybe_flush_boards(&mut self, now: i64) {
        let total: u32 = self.board_counters.values().sum();
        if total == 0 {
            return;
        }
        let elapsed_us = now - self.last_board_flush_us;
        let due = total >= self.ctx.settings.board_flush_threshold
            || elapsed_us >= self.ctx.settings.board_flush_interval_secs * MICROS;
        if !due {
            return;
        }
        self.flush_boards(now).await;
    }

    async fn flush_boards(&mut self, now: i64) {
        let counters = std::mem::take(&mut self.board_counters);
        self.last_board_flush_us = now;

        let targets: Vec<String> = self
            .ctx
            .settings
            .peers
            .iter()
            .filter(|p| p.enabled)
            .map(|p| p.node_id.clone())
            .collect();
        if targets.is_empty() {
            return;
        }

        for (board_name, count) in counters {
            if count == 0 {
                continue;
            }
            for peer_node in &targets {
                if let Err(e) = self.present_board_batch(&board_name, peer_node, now).await {
                    warn!("Board sync for '{board_name}' to {peer_node} failed: {e}");
                }
            }
        }
    }

    /// Collect our-origin posts newer than the peer's watermark, pack the
    /// record stream, and open the handshake.
    async fn present_board_batch(
        &mut self,
        board_name: &str,
        peer_node: &str,
        now: i64,
    ) -> Result<()> {
        let callsign = self.callsign().to_string();
        let (since_us, records, max_ts, count) = {
            let conn = self.ctx.db.lock();

            let Some(board) = boards::get_by_name(&conn, board_name)? else {
                return Ok(());
            };
            if !board.sync_enabled {
                return Ok(());
            }
            let Some(peer) = peers::get_by_node_id(&conn, peer_node)? else {
                return Ok(());
            };
            let since_us = peer.last_board_sync_us;

            let posts = messages::board_messages(&conn, board.id, Some(since_us), 1000, true)?;
            let mut records = Vec::new();
            let mut max_ts = since_us;
            for post in posts {
                if post.origin_bbs.as_deref() != Some(callsign.as_str()) {
                    continue;
                }

                // Board bodies are sealed under the master key at rest.
                let body = match self.ctx.master.open(&post.body_enc, &[]) {
                    Ok(pt) => String::from_utf8_lossy(&pt).into_owned(),
                    Err(e) => {
                        warn!("Skipping undecryptable post {}: {e}", post.uuid);
                        continue;
                    }
                };
                let subject = match &post.subject_enc {
                    Some(enc) => match self.ctx.master.open(enc, &[]) {
                        Ok(pt) => String::from_utf8_lossy(&pt).into_owned(),
                        Err(_) => String::new(),
                    },
                    None => String::new(),
                };
                let author = match post.sender_user_id {
                    Some(id) => users::get_by_id(&conn, id)
                        .map(|u| u.username)
                        .unwrap_or_else(|_| "unknown".to_string()),
                    None => "unknown".to_string(),
                };

                records.push(format!(
                    "{}{FIELD_SEP}{}{FIELD_SEP}{}{FIELD_SEP}{}{FIELD_SEP}{}{FIELD_SEP}{}",
                    post.uuid, author, callsign, post.created_at_us, subject, body
                ));
                max_ts = max_ts.max(post.created_at_us);
            }

            let count = records.len() as u32;
            (since_us, records, max_ts, count)
        };

        if records.is_empty() {
            return Ok(());
        }

        let payload: String = records.join(&RECORD_SEP.to_string());
        let chunks = chunk::chunk_bytes(&payload, BOARD_CHUNK_BYTES);

        self.pending_board.insert(
            (board_name.to_string(), peer_node.to_string()),
            PendingBoardSync {
                chunks,
                max_ts_us: max_ts,
                started_us: now,
            },
        );

        let req = BoardVerb::Req {
            board: board_name.to_string(),
            count,
            since_us,
        }
        .encode();
        info!("Board sync: {board_name} presenting {count} post(s) to {peer_node}");
        self.ctx.metrics.incr("bsp.batches_sent", 1);
        self.send_frame(&req, peer_node).await;
        Ok(())
    }

    pub(crate) async fn handle_board_frame(&mut self, text: &str, sender: &str) -> Result<()> {
        match BoardVerb::parse(text)? {
            BoardVerb::Req { board, count, .. } => {
                self.handle_boardreq(&board, count, sender).await
            }
            BoardVerb::Ack { board, .. } => self.handle_boardack(&board, sender).await,
            BoardVerb::Nak { board, reason } => {
                warn!("BOARDNAK for '{board}' from {sender}: {reason}");
                self.pending_board.remove(&(board, sender.to_string()));
                Ok(())
            }
            BoardVerb::Dat {
                board,
                seq,
                total,
                chunk,
            } => self.handle_boarddat(&board, seq, total, chunk, sender).await,
            BoardVerb::Dlv { board, .. } => self.handle_boarddlv(&board, sender),
        }
    }

    async fn handle_boardreq(&mut self, board_name: &str, count: u32, sender: &str) -> Result<()> {
        info!("BOARDREQ: board={board_name} count={count} from {sender}");

        let board = self.with_db(|conn| boards::get_by_name(conn, board_name))?;
        let Some(board) = board else {
            warn!("BOARDREQ: board '{board_name}' not found");
            self.send_board_nak(board_name, BoardNakReason::NoBoard, sender).await;
            return Ok(());
        };
        if !board.sync_enabled {
            warn!("BOARDREQ: board '{board_name}' not sync-enabled");
            self.send_board_nak(board_name, BoardNakReason::NoSync, sender).await;
            return Ok(());
        }

        self.incoming_board.insert(
            (board_name.to_string(), sender.to_string()),
            IncomingBoardSync {
                board_id: board.id,
                num_parts: 0,
                received: Default::default(),
                started_us: self.now_us(),
                delivering: false,
            },
        );

        let ack = BoardVerb::Ack {
            board: board_name.to_string(),
            status: "OK".into(),
        }
        .encode();
        info!("BOARDREQ: accepted '{board_name}', sending BOARDACK");
        self.send_frame(&ack, sender).await;
        Ok(())
    }

    async fn handle_boardack(&mut self, board_name: &str, sender: &str) -> Result<()> {
        let key = (board_name.to_string(), sender.to_string());
        let Some(pending) = self.pending_board.get(&key) else {
            warn!("BOARDACK: no pending board sync for '{board_name}' to {sender}");
            return Ok(());
        };

        info!(
            "BOARDACK: sending {} chunk(s) for '{board_name}' to {sender}",
            pending.chunks.len()
        );
        self.spawn_board_chunks(board_name.to_string(), sender.to_string(), pending.chunks.clone());
        Ok(())
    }

    async fn handle_boarddat(
        &mut self,
        board_name: &str,
        seq: u32,
        total: u32,
        chunk: String,
        sender: &str,
    ) -> Result<()> {
        debug!("BOARDDAT: board={board_name} part {seq}/{total} from {sender}");

        let key = (board_name.to_string(), sender.to_string());
        let Some(incoming) = self.incoming_board.get_mut(&key) else {
            warn!("BOARDDAT: no pending incoming sync for '{board_name}' from {sender}");
            return Ok(());
        };

        incoming.num_parts = total;
        incoming.received.insert(seq, chunk);

        let complete = incoming.received.len() as u32 >= total;
        if complete && !incoming.delivering {
            incoming.delivering = true;
            self.deliver_board_posts(&key).await?;
        }
        Ok(())
    }

    /// Reassemble the record stream and store every post we have not seen.
    async fn deliver_board_posts(&mut self, key: &(String, String)) -> Result<()> {
        let Some(incoming) = self.incoming_board.remove(key) else {
            return Ok(());
        };
        let (board_name, sender_node) = key;

        let Some(payload) = chunk::reassemble(&incoming.received, incoming.num_parts) else {
            warn!("Board sync for '{board_name}': chunk set incomplete");
            return Ok(());
        };

        let now = self.now_us();
        let expires = now + BULLETIN_EXPIRY_DAYS * 86_400 * MICROS;
        let (stored, skipped) = {
            let conn = self.ctx.db.lock();
            let sender = nodes::get_or_create(&conn, sender_node, now)?;

            let mut stored = 0u32;
            let mut skipped = 0u32;
            for record in payload.split(RECORD_SEP) {
                // Body is the last field and may contain anything.
                let fields: Vec<&str> = record.splitn(6, FIELD_SEP).collect();
                if fields.len() < 6 {
                    warn!(
                        "Skipping malformed board sync record ({} fields)",
                        fields.len()
                    );
                    continue;
                }
                let (uuid, author, origin_bbs, ts_str, subject, body) = (
                    fields[0], fields[1], fields[2], fields[3], fields[4], fields[5],
                );

                if messages::exists(&conn, uuid)? {
                    skipped += 1;
                    continue;
                }

                let timestamp_us: i64 = ts_str.parse().unwrap_or(now);
                let subject_enc = if subject.is_empty() {
                    None
                } else {
                    Some(self.ctx.master.seal(subject.as_bytes(), &[])?)
                };
                let body_enc = self.ctx.master.seal(body.as_bytes(), &[])?;
                let forwarded = format!("{author}@{origin_bbs}");

                messages::create(
                    &conn,
                    &messages::NewMessage {
                        uuid: Some(uuid),
                        msg_type: Some(MessageType::Bulletin),
                        board_id: Some(incoming.board_id),
                        sender_node_id: Some(sender.id),
                        subject_enc: subject_enc.as_deref(),
                        body_enc: &body_enc,
                        origin_bbs: Some(origin_bbs),
                        expires_at_us: Some(expires),
                        forwarded_to: Some(&forwarded),
                        ..messages::NewMessage::default()
                    },
                    // The carried timestamp keeps per-board order stable
                    // across re-ordered delivery.
                    timestamp_us,
                )?;
                stored += 1;
            }
            (stored, skipped)
        };

        info!("Board sync for '{board_name}': stored={stored}, skipped={skipped}");
        self.ctx.metrics.incr("bsp.posts_stored", stored as u64);

        // Confirm even when everything was a duplicate, so the sender can
        // advance its watermark.
        let dlv = BoardVerb::Dlv {
            board: board_name.clone(),
            status: "OK".into(),
        }
        .encode();
        self.send_frame(&dlv, sender_node).await;
        Ok(())
    }

    fn handle_boarddlv(&mut self, board_name: &str, sender: &str) -> Result<()> {
        let key = (board_name.to_string(), sender.to_string());
        let Some(pending) = self.pending_board.remove(&key) else {
            return Ok(());
        };

        // The batch landed: commit the watermark so these posts are never
        // presented to this peer again.
        self.with_db(|conn| peers::set_last_board_sync(conn, sender, pending.max_ts_us))?;
        info!(
            "BOARDDLV: '{board_name}' delivered to {sender}, watermark -> {}",
            pending.max_ts_us
        );
        self.ctx.metrics.incr("bsp.batches_delivered", 1);
        Ok(())
    }

    /// Chunk-task completion for a board batch.
    pub(crate) fn on_board_chunks_sent(&mut self, board: &str, peer_node: &str, ok: bool) {
        if ok {
            debug!("Board chunks for '{board}' sent to {peer_node}, awaiting BOARDDLV");
            return;
        }
        // Transmission aborted: drop the pending state. The peer's inbound
        // set will time out, and the un-advanced watermark re-presents the
        // batch on the next flush.
        warn!("Board chunk transmission for '{board}' to {peer_node} aborted");
        self.pending_board
            .remove(&(board.to_string(), peer_node.to_string()));
    }

    /// Drop stale board state in both directions.
    pub(crate) fn cleanup_stale_board_state(&mut self, now: i64) {
        let incoming_timeout = self.ctx.settings.incoming_timeout_secs * MICROS;
        self.incoming_board.retain(|(board, _), incoming| {
            let stale = now - incoming.started_us > incoming_timeout;
            if stale {
                warn!(
                    "Incoming board sync '{board}' timed out: {}/{} chunks",
                    incoming.received.len(),
                    incoming.num_parts
                );
            }
            !stale
        });

        let pending_timeout = self.ctx.settings.relay_timeout_secs * MICROS;
        self.pending_board.retain(|(board, peer), pending| {
            let stale = now - pending.started_us > pending_timeout;
            if stale {
                debug!("Pending board sync '{board}' to {peer} expired");
            }
            !stale
        });
    }

    async fn send_board_nak(&self, board: &str, reason: BoardNakReason, dest: &str) {
        let nak = BoardVerb::Nak {
            board: board.to_string(),
            reason,
        }
        .encode();
        self.send_frame(&nak, dest).await;
    }

    fn spawn_board_chunks(&self, board: String, peer_node: String, chunks: Vec<String>) {
        let transport = self.ctx.transport.clone();
        let events = self.events_tx.clone();
        let ack_timeout = self.ctx.settings.chunk_ack_timeout;
        let retries = self.ctx.settings.chunk_retries;

        tokio::spawn(async move {
            let ok = transmit_board_chunks(
                transport,
                &board,
                &chunks,
                &peer_node,
                retries,
                ack_timeout,
            )
            .await;
            let _ = events.send(EngineEvent::BoardChunksSent {
                board,
                peer_node,
                ok,
            });
        });
    }
}

/// Send a board chunk set in order, aborting on the first chunk that never
/// gets a link ACK — the receiver will time out and the batch re-presents.
async fn transmit_board_chunks(
    transport: Transport,
    board: &str,
    chunks: &[String],
    dest: &str,
    retries: u32,
    ack_timeout: std::time::Duration,
) -> bool {
    let total = chunks.len() as u32;

    for (i, chunk) in chunks.iter().enumerate() {
        let seq = (i + 1) as u32;
        let frame = BoardVerb::Dat {
            board: board.to_string(),
            seq,
            total,
            chunk: chunk.clone(),
        }
        .encode();

        let mut delivered = false;
        for attempt in 0..retries {
            let (acked, reason) = transport.send_dm_wait_ack(&frame, dest, ack_timeout).await;
            if acked {
                debug!("BOARDDAT {board} chunk {seq}/{total} ACKed");
                delivered = true;
                break;
            }
            warn!(
                "BOARDDAT {board} chunk {seq}/{total} failed: {reason} (attempt {}/{retries})",
                attempt + 1
            );
            if attempt + 1 < retries {
                tokio::time::sleep(jitter(3.0, 5.0)).await;
            }
        }

        if !delivered {
            warn!("BOARDDAT {board} chunk {seq}/{total} failed after {retries} attempts");
            return false;
        }
        if seq < total {
            tokio::time::sleep(jitter(2.2, 2.6)).await;
        }
    }

    info!("Sent {total} board chunk(s) for {board} to {dest}, awaiting BOARDDLV");
    true
}
