//! Route announcement, peer health, and the native sync envelope.
//!
//! Heartbeats ride the `advBBS|1|…` envelope:
//!
//! ```text
//! RAP_PING|ts_us
//! RAP_PONG|echo_ts_us|routes_csv
//! RAP_ROUTES|routes_csv
//! ```
//!
//! Any inbound traffic from a peer proves it alive; missed heartbeat
//! replies walk it through unreachable to dead. Coming alive re-drives any
//! queued mail that can now reach its destination; dying evaporates every
//! route learned through the peer.

use tracing::{debug, info, warn};

use vireo_db::queries::{messages, nodes, pending_mail, peers, routes as route_queries, users};
use vireo_types::addr::RemoteAddr;
use vireo_types::health::{PeerHealth, SyncDirection, DEAD_THRESHOLD, UNREACHABLE_THRESHOLD};
use vireo_types::message::MessageType;

use crate::engine::{short, SyncEngine};
use crate::native::{Hello, SyncMessage};
use crate::routes;
use crate::wire::NativeFrame;
use crate::{RemoteMailRequest, Result};

const MICROS: i64 = 1_000_000;

/// Minimum spacing between HELLOs to the same node, so two BBSs greeting
/// each other cannot ping-pong.
const HELLO_REPLY_SPACING_SECS: i64 = 300;

impl SyncEngine {
    pub(crate) async fn handle_native_frame(&mut self, text: &str, sender: &str) -> Result<()> {
        let frame = NativeFrame::parse(text)?;
        debug!("Native {} from {sender}", frame.verb);

        match frame.verb.as_str() {
            "HELLO" => self.handle_hello(&frame.payload, sender).await,
            "SYNC_REQ" => {
                info!("Sync request from {sender}: {}", frame.payload);
                Ok(())
            }
            "SYNC_MSG" => self.handle_sync_msg(&frame.payload, sender).await,
            "SYNC_ACK" => self.handle_sync_ack(&frame.payload, sender),
            "SYNC_DONE" => self.handle_sync_done(sender),
            "DELETE" => self.handle_delete(&frame.payload, sender),
            "RAP_PING" => self.handle_rap_ping(&frame.payload, sender).await,
            "RAP_PONG" => self.handle_rap_pong(&frame.payload, sender).await,
            "RAP_ROUTES" => self.handle_rap_routes(&frame.payload, sender).await,
            _ => Ok(()),
        }
    }

    // === Handshake & native sync ===

    async fn handle_hello(&mut self, payload: &str, sender: &str) -> Result<()> {
        let hello = Hello::decode(payload);
        info!(
            "Handshake from {} ({}) [{}]: {:?}",
            hello.name, hello.callsign, sender, hello.capabilities
        );

        let now = self.now_us();
        self.with_db(|conn| {
            peers::register_announced(
                conn,
                sender,
                &hello.callsign,
                &hello.name,
                &hello.capabilities.join(","),
                now,
            )
        })?;
        self.mark_peer_alive(sender, false).await?;

        // Answer, but never volley: a reply to our own greeting gets none.
        let last_sent = self.last_hello_sent_us.get(sender).copied().unwrap_or(0);
        if now - last_sent > HELLO_REPLY_SPACING_SECS * MICROS {
            self.send_hello(sender).await;
        }
        Ok(())
    }

    /// Send our HELLO to a node, recording when we did.
    pub(crate) async fn send_hello(&mut self, dest_node: &str) {
        let hello = Hello {
            callsign: self.callsign().to_string(),
            name: self.ctx.settings.bbs_name.clone(),
            capabilities: vec!["mail".to_string()],
        };
        let frame = NativeFrame::encode("HELLO", &hello.encode());
        self.last_hello_sent_us
            .insert(dest_node.to_string(), self.now_us());
        self.send_frame(&frame, dest_node).await;
    }

    async fn handle_sync_msg(&mut self, payload: &str, sender: &str) -> Result<()> {
        let msg = SyncMessage::decode(payload)?;
        debug!("Sync message from {sender}: {}", short(&msg.uuid));
        self.mark_peer_alive(sender, false).await?;

        // Bulletins flow over the board protocol; ignore them here.
        if msg.msg_type == "mail" {
            if let Err(e) = self.store_synced_mail(&msg, sender) {
                warn!("Failed to store synced mail {}: {e}", short(&msg.uuid));
            }
        }

        let ack = NativeFrame::encode("SYNC_ACK", &msg.uuid);
        self.send_frame(&ack, sender).await;
        Ok(())
    }

    fn store_synced_mail(&self, msg: &SyncMessage, sender: &str) -> Result<()> {
        let already = self.with_db(|conn| messages::exists(conn, &msg.uuid))?;
        if already {
            debug!("Duplicate synced message ignored: {}", short(&msg.uuid));
            return Ok(());
        }

        let recipient_name = msg.recipient.as_deref().unwrap_or_default();
        let recipient = self.with_db(|conn| users::get_by_username(conn, recipient_name))?;
        let Some(recipient) = recipient else {
            warn!("Synced mail recipient not found: {recipient_name}");
            return Ok(());
        };

        // Encrypt for the local recipient under their escrowed key.
        let user_key = self.ctx.master.open_user_key(&recipient.enc_key_master)?;
        let body_enc =
            vireo_crypto::envelope::seal_str(&user_key, msg.body.as_deref().unwrap_or(""), &[])?;
        let subject_enc = match msg.subject.as_deref() {
            Some(subject) => Some(vireo_crypto::envelope::seal_str(&user_key, subject, &[])?),
            None => None,
        };

        let now = self.now_us();
        let origin = msg.origin_bbs.clone().unwrap_or_else(|| sender.to_string());
        self.with_db(|conn| {
            let node = nodes::get_or_create(conn, sender, now)?;
            messages::create(
                conn,
                &messages::NewMessage {
                    uuid: Some(&msg.uuid),
                    msg_type: Some(MessageType::Mail),
                    sender_node_id: Some(node.id),
                    recipient_user_id: Some(recipient.id),
                    subject_enc: subject_enc.as_deref(),
                    body_enc: &body_enc,
                    origin_bbs: Some(&origin),
                    ..messages::NewMessage::default()
                },
                now,
            )?;
            Ok(())
        })?;

        self.record_sync(&msg.uuid, sender, SyncDirection::Received);
        info!(
            "Stored synced mail from {sender} to {}: {}",
            recipient.username,
            short(&msg.uuid)
        );
        Ok(())
    }

    /// Push one message to a peer over the native envelope.
    pub async fn send_sync_message(&mut self, msg: &SyncMessage, dest_node: &str) -> Result<()> {
        let frame = NativeFrame::encode("SYNC_MSG", &msg.encode()?);
        self.pending_sync_acks
            .insert(msg.uuid.clone(), (dest_node.to_string(), self.now_us()));
        self.send_frame(&frame, dest_node).await;
        Ok(())
    }

    fn handle_sync_ack(&mut self, payload: &str, sender: &str) -> Result<()> {
        let uuid = payload.trim();
        if uuid.is_empty() {
            return Ok(());
        }
        if self.pending_sync_acks.remove(uuid).is_some() {
            self.record_sync(uuid, sender, SyncDirection::Sent);
            info!("Message {} acknowledged by {sender}", short(uuid));
        }
        Ok(())
    }

    fn handle_sync_done(&mut self, sender: &str) -> Result<()> {
        let now = self.now_us();
        self.with_db(|conn| peers::set_last_sync(conn, sender, now))?;
        info!("Sync complete from {sender}");
        Ok(())
    }

    fn handle_delete(&mut self, payload: &str, sender: &str) -> Result<()> {
        let uuid = payload.trim();
        if uuid.is_empty() {
            return Ok(());
        }

        let row = self.with_db(|conn| messages::get_by_uuid(conn, uuid))?;
        let peer = self.with_db(|conn| peers::get_by_node_id(conn, sender))?;

        // Only the origin BBS may retract a message.
        let authorized = match (&row, &peer) {
            (Some(row), Some(peer)) => match (&row.origin_bbs, peer.wire_callsign()) {
                (Some(origin), Some(callsign)) => origin.eq_ignore_ascii_case(callsign),
                _ => false,
            },
            _ => false,
        };

        match (row, authorized) {
            (Some(row), true) => {
                self.with_db(|conn| messages::delete(conn, row.id).map(|_| ()))?;
                info!("Deleted message by peer request from {sender}: {}", short(uuid));
            }
            (Some(_), false) => {
                warn!("Rejected delete from {sender} for {}: not origin BBS", short(uuid));
            }
            (None, _) => {}
        }
        Ok(())
    }

    /// Ask every enabled peer to drop one of our messages.
    pub(crate) async fn propagate_delete(&mut self, uuid: &str) {
        let peers: Vec<String> = self
            .ctx
            .settings
            .peers
            .iter()
            .filter(|p| p.enabled)
            .map(|p| p.node_id.clone())
            .collect();
        let frame = NativeFrame::encode("DELETE", uuid);
        for node in peers {
            self.send_frame(&frame, &node).await;
        }
        debug!("Propagated delete for {}", short(uuid));
    }

    // === Heartbeats ===

    async fn handle_rap_ping(&mut self, payload: &str, sender: &str) -> Result<()> {
        let echo_ts: i64 = payload.parse().unwrap_or(0);
        debug!("RAP_PING from {sender}");
        self.mark_peer_alive(sender, false).await?;

        let now = self.now_us();
        let csv = self.with_db(|conn| routes::build_routes_csv(conn, &self.ctx.settings.callsign, now))?;
        let pong = NativeFrame::encode("RAP_PONG", &format!("{echo_ts}|{csv}"));
        self.send_frame(&pong, sender).await;
        Ok(())
    }

    async fn handle_rap_pong(&mut self, payload: &str, sender: &str) -> Result<()> {
        let (echo, csv) = payload.split_once('|').unwrap_or((payload, ""));
        let echo_ts: i64 = echo.parse().unwrap_or(0);
        let rtt_ms = if echo_ts > 0 {
            (self.now_us() - echo_ts) / 1000
        } else {
            0
        };
        info!("RAP_PONG from {sender} (RTT {rtt_ms}ms)");

        self.pending_pings.remove(sender);

        // Ingest the carried routes before any redrive: mail queued for a
        // destination this PONG just advertised must go out on this tick.
        let previous = self.db_mark_alive(sender, true)?;
        if !csv.is_empty() {
            self.ingest_peer_routes(sender, csv)?;
        }
        if previous != PeerHealth::Alive {
            info!("Peer {sender} health: {} -> alive", previous.as_str());
            self.redrive_pending_mail(sender).await;
        }
        Ok(())
    }

    async fn handle_rap_routes(&mut self, payload: &str, sender: &str) -> Result<()> {
        debug!("RAP_ROUTES from {sender}");
        self.mark_peer_alive(sender, false).await?;
        if !payload.is_empty() {
            self.ingest_peer_routes(sender, payload)?;
        }
        Ok(())
    }

    fn ingest_peer_routes(&self, sender: &str, csv: &str) -> Result<()> {
        let peer = self.with_db(|conn| peers::get_by_node_id(conn, sender))?;
        let Some(peer) = peer else {
            warn!("Route advertisement from unregistered node {sender}");
            return Ok(());
        };

        let ads = routes::parse_routes_csv(csv);
        let now = self.now_us();
        let expires = now + self.ctx.settings.route_expiry_secs * MICROS;
        let stored = self.with_db(|conn| {
            routes::ingest(
                conn,
                peer.id,
                &ads,
                &self.ctx.settings.callsign,
                self.ctx.settings.max_hops,
                now,
                expires,
            )
        })?;
        debug!("Ingested {stored} route(s) from {sender}");
        self.ctx.metrics.incr("rap.routes_learned", stored as u64);
        Ok(())
    }

    /// Flip a peer to alive in the store, returning its previous health.
    pub(crate) fn db_mark_alive(&self, node_id: &str, pong: bool) -> Result<PeerHealth> {
        let now = self.now_us();
        let peer = self.with_db(|conn| {
            let peer = peers::ensure_exists(conn, node_id, now)?;
            peers::mark_alive(conn, peer.id, now, pong)?;
            Ok(peer)
        })?;
        Ok(peer.health)
    }

    /// Any inbound traffic from a peer proves it alive. An ALIVE entry from
    /// any other state re-drives queued mail.
    pub(crate) async fn mark_peer_alive(&mut self, node_id: &str, pong: bool) -> Result<()> {
        let previous = self.db_mark_alive(node_id, pong)?;
        if previous != PeerHealth::Alive {
            info!("Peer {node_id} health: {} -> alive", previous.as_str());
            self.redrive_pending_mail(node_id).await;
        }
        Ok(())
    }

    /// Send heartbeat probes on the configured cadence.
    pub(crate) async fn maybe_send_heartbeats(&mut self, now: i64) {
        if now - self.last_heartbeat_us < self.ctx.settings.heartbeat_interval_secs * MICROS {
            return;
        }
        self.last_heartbeat_us = now;
        debug!("Sending heartbeat pings");

        let targets: Vec<String> = self
            .ctx
            .settings
            .peers
            .iter()
            .filter(|p| p.enabled)
            .map(|p| p.node_id.clone())
            .collect();
        for node in targets {
            let ping = NativeFrame::encode("RAP_PING", &now.to_string());
            self.send_frame(&ping, &node).await;
            self.pending_pings.insert(node, now);
            self.ctx.metrics.incr("rap.pings_sent", 1);
        }
    }

    /// Walk unanswered pings through the health state machine.
    pub(crate) async fn check_heartbeat_timeouts(&mut self, now: i64) {
        let timeout_us = self.ctx.settings.heartbeat_timeout_secs * MICROS;
        let timed_out: Vec<String> = self
            .pending_pings
            .iter()
            .filter(|(_, sent)| now - **sent > timeout_us)
            .map(|(node, _)| node.clone())
            .collect();

        for node_id in timed_out {
            self.pending_pings.remove(&node_id);

            let peer = match self.with_db(|conn| peers::get_by_node_id(conn, &node_id)) {
                Ok(Some(peer)) => peer,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Heartbeat bookkeeping failed for {node_id}: {e}");
                    continue;
                }
            };

            let failed = peer.failed_heartbeats + 1;
            let new_health = if failed >= DEAD_THRESHOLD {
                PeerHealth::Dead
            } else if failed >= UNREACHABLE_THRESHOLD {
                PeerHealth::Unreachable
            } else {
                peer.health
            };

            if let Err(e) = self.with_db(|conn| {
                peers::record_heartbeat_failure(conn, peer.id, failed, new_health)
            }) {
                warn!("Failed to record heartbeat failure for {node_id}: {e}");
                continue;
            }

            if new_health != peer.health {
                warn!(
                    "Peer {node_id} health: {} -> {} (failed={failed})",
                    peer.health.as_str(),
                    new_health.as_str()
                );
                if new_health == PeerHealth::Dead {
                    self.on_peer_dead(&node_id, peer.id);
                }
            }
        }
    }

    /// Every route learned via a dead peer evaporates.
    fn on_peer_dead(&self, node_id: &str, peer_id: i64) {
        match self.with_db(|conn| route_queries::delete_via_peer(conn, peer_id)) {
            Ok(n) => info!("Peer {node_id} dead; removed {n} learned route(s)"),
            Err(e) => warn!("Failed to expire routes via {node_id}: {e}"),
        }
    }

    /// Share the full route table on the configured cadence.
    pub(crate) async fn maybe_share_routes(&mut self, now: i64) {
        if now - self.last_route_share_us < self.ctx.settings.route_share_interval_secs * MICROS {
            return;
        }
        self.last_route_share_us = now;
        debug!("Sharing route table");

        let csv = match self.with_db(|conn| {
            routes::build_routes_csv(conn, &self.ctx.settings.callsign, now)
        }) {
            Ok(csv) => csv,
            Err(e) => {
                warn!("Failed to build route advertisement: {e}");
                return;
            }
        };

        let targets: Vec<String> = self
            .ctx
            .settings
            .peers
            .iter()
            .filter(|p| p.enabled)
            .map(|p| p.node_id.clone())
            .collect();
        for node in targets {
            let frame = NativeFrame::encode("RAP_ROUTES", &csv);
            self.send_frame(&frame, &node).await;
        }
    }

    pub(crate) fn sweep_expired_routes(&self, now: i64) {
        match self.with_db(|conn| route_queries::delete_expired(conn, now)) {
            Ok(n) if n > 0 => debug!("Cleaned up {n} expired route(s)"),
            Ok(_) => {}
            Err(e) => warn!("Route sweep failed: {e}"),
        }
    }

    /// Expired queued mail turns into an "expired" receipt to its sender.
    pub(crate) fn expire_pending_mail(&self, now: i64) {
        let expired = match self.with_db(|conn| pending_mail::expired(conn, now)) {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Pending-mail expiry scan failed: {e}");
                return;
            }
        };

        for row in expired {
            warn!(
                "Pending mail {} to {} expired",
                short(&row.mail_uuid),
                row.recipient_bbs
            );
            self.send_queue_receipt(row.sender_user_id, &row.recipient_bbs, false);
            if let Err(e) = self.with_db(|conn| pending_mail::delete(conn, &row.mail_uuid)) {
                warn!("Failed to delete expired pending mail: {e}");
            }
        }
    }

    /// A peer came alive: retry every queued mail that can now reach its
    /// destination through it, directly or via a learned route.
    pub(crate) async fn redrive_pending_mail(&mut self, peer_node: &str) {
        let now = self.now_us();
        let reachable = match self.with_db(|conn| {
            let Some(peer) = peers::get_by_node_id(conn, peer_node)? else {
                return Ok(Vec::new());
            };
            let mut reachable: Vec<String> = Vec::new();
            if let Some(callsign) = peer.wire_callsign() {
                reachable.push(callsign.to_uppercase());
            }
            for dest in route_queries::dests_via_peer(conn, peer.id, now)? {
                let upper = dest.to_uppercase();
                if !reachable.contains(&upper) {
                    reachable.push(upper);
                }
            }
            Ok(reachable)
        }) {
            Ok(reachable) => reachable,
            Err(e) => {
                warn!("Redrive scan for {peer_node} failed: {e}");
                return;
            }
        };

        if reachable.is_empty() {
            return;
        }

        let pending = match self.with_db(|conn| pending_mail::for_destinations(conn, &reachable, now))
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Pending-mail fetch for {peer_node} failed: {e}");
                return;
            }
        };
        if pending.is_empty() {
            return;
        }

        info!(
            "Peer {peer_node} online; retrying {} queued mail(s) for {reachable:?}",
            pending.len()
        );

        for row in pending {
            let body = String::from_utf8_lossy(&row.body).into_owned();
            let request = RemoteMailRequest {
                mail_uuid: row.mail_uuid.clone(),
                sender_user_id: row.sender_user_id,
                sender: RemoteAddr {
                    user: row.sender_username.clone(),
                    bbs: row.sender_bbs.clone(),
                },
                recipient: RemoteAddr {
                    user: row.recipient_username.clone(),
                    bbs: row.recipient_bbs.clone(),
                },
                body,
            };

            match self.try_send_remote(&request).await {
                Ok(()) => {
                    if let Err(e) =
                        self.with_db(|conn| pending_mail::delete(conn, &row.mail_uuid))
                    {
                        warn!("Failed to dequeue {}: {e}", short(&row.mail_uuid));
                    }
                    self.send_queue_receipt(row.sender_user_id, &row.recipient_bbs, true);
                    info!(
                        "Queued mail {} to {} resent",
                        short(&row.mail_uuid),
                        row.recipient_bbs
                    );
                    self.ctx.metrics.incr("rap.redriven", 1);
                }
                Err(e) => {
                    let status = e.to_string();
                    if let Err(db_err) = self.with_db(|conn| {
                        pending_mail::record_retry(conn, &row.mail_uuid, now, &status)
                    }) {
                        warn!("Failed to record retry for {}: {db_err}", short(&row.mail_uuid));
                    }
                    warn!(
                        "Queued mail {} retry failed: {status}",
                        short(&row.mail_uuid)
                    );
                }
            }
        }
    }

    /// System-mail receipt for a queued mail that was finally delivered or
    /// gave up.
    pub(crate) fn send_queue_receipt(&self, user_id: Option<i64>, dest_bbs: &str, delivered: bool) {
        let Some(user_id) = user_id else {
            return;
        };

        let (subject, body) = if delivered {
            (
                format!("Queued mail to {dest_bbs} delivered"),
                format!(
                    "Your message to {dest_bbs} was queued while the route was unavailable. \
                     It has now been delivered successfully."
                ),
            )
        } else {
            (
                format!("Queued mail to {dest_bbs} expired"),
                format!(
                    "Your message to {dest_bbs} could not be delivered within the retry \
                     period (24 hours) and has been discarded."
                ),
            )
        };

        let now = self.now_us();
        let result = self.with_db(|conn| {
            messages::create(
                conn,
                &messages::NewMessage {
                    msg_type: Some(MessageType::System),
                    recipient_user_id: Some(user_id),
                    subject_enc: Some(subject.as_bytes()),
                    body_enc: body.as_bytes(),
                    ..messages::NewMessage::default()
                },
                now,
            )
            .map(|_| ())
        });
        if let Err(e) = result {
            warn!("Failed to store queue receipt for user {user_id}: {e}");
        }
    }
}
