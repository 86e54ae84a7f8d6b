//! Remote mail protocol.
//!
//! Five verbs over text frames, all addressed to a single peer node:
//!
//! ```text
//! MAILREQ|uuid|from_user|from_bbs|to_user|to_bbs|hop|parts|route_csv
//! MAILACK|uuid|OK
//! MAILNAK|uuid|reason          reason ∈ LOOP MAXHOPS NOUSER NOROUTE
//! MAILDAT|uuid|seq/total|chunk
//! MAILDLV|uuid|OK|recipient@dst_bbs
//! ```
//!
//! The sender runs REQ → (ACK) → DAT* → (DLV) with bounded retry ladders;
//! a relay forwards the conversation verbatim after loop and hop checks;
//! the receiver collects chunks and confirms delivery idempotently.

use std::time::Duration;

use tracing::{debug, info, warn};

use vireo_db::queries::{messages, nodes, pending_mail, peers, sync_log, users};
use vireo_transport::Transport;
use vireo_types::health::SyncDirection;
use vireo_types::message::MAIL_EXPIRY_DAYS;

use crate::chunk::{self, MAIL_CHUNK_CHARS, MAIL_MAX_CHARS};
use crate::engine::{
    short, AwaitingDlv, EngineEvent, IncomingRemoteMail, PendingRemoteMail, PendingState,
    RelayState, SendOutcome, SyncEngine,
};
use crate::routes;
use crate::wire::{MailReq, MailVerb, NakReason};
use crate::{RemoteMailRequest, Result, SyncError};

const MICROS: i64 = 1_000_000;

impl SyncEngine {
    /// Hand an outbound remote mail to the protocol.
    ///
    /// A missing or down route queues the mail for redrive instead of
    /// failing; the caller reports "queued" to the user.
    pub async fn send_remote_mail(&mut self, request: &RemoteMailRequest) -> Result<SendOutcome> {
        let body_chars = request.body.chars().count();
        if body_chars > MAIL_MAX_CHARS {
            return Err(SyncError::PayloadTooLong {
                max: MAIL_MAX_CHARS,
                len: body_chars,
            });
        }

        match self.try_send_remote(request).await {
            Ok(()) => Ok(SendOutcome::Sent),
            Err(SyncError::RouteUnavailable(_))
            | Err(SyncError::Transport(vireo_transport::TransportError::NotConnected)) => {
                self.queue_pending(request, "no_route")?;
                Ok(SendOutcome::Queued)
            }
            Err(e) => Err(e),
        }
    }

    /// Attempt the handshake right now; errors instead of queueing.
    ///
    /// Idempotent per UUID: while a handshake for this mail is already in
    /// flight (awaiting its MAILACK or its MAILDLV), a re-presentation is a
    /// no-op — the delivery worker re-presents stored transit rows on its
    /// own cadence, and only the ladders here may retry a live handshake.
    pub(crate) async fn try_send_remote(&mut self, request: &RemoteMailRequest) -> Result<()> {
        if self.pending_remote.contains_key(&request.mail_uuid)
            || self.awaiting_dlv.contains_key(&request.mail_uuid)
        {
            debug!(
                "Remote mail {} already in flight, ignoring re-presentation",
                short(&request.mail_uuid)
            );
            return Ok(());
        }

        let now = self.now_us();
        let next_hop = self
            .with_db(|conn| routes::find_next_hop(conn, &request.recipient.bbs, now))?
            .ok_or_else(|| SyncError::RouteUnavailable(request.recipient.bbs.clone()))?;

        let chunks = chunk::chunk_chars(&request.body, MAIL_CHUNK_CHARS);
        let mailreq = MailReq {
            uuid: request.mail_uuid.clone(),
            from_user: request.sender.user.clone(),
            from_bbs: request.sender.bbs.clone(),
            to_user: request.recipient.user.clone(),
            to_bbs: request.recipient.bbs.clone(),
            hop: 1,
            parts: chunks.len() as u32,
            route: vec![self.callsign().to_string()],
        }
        .encode();

        self.ctx
            .transport
            .send_dm(&mailreq, &next_hop.via_node_id)
            .await?;
        info!(
            "Sent MAILREQ for {} to {} (attempt 1/{})",
            short(&request.mail_uuid),
            next_hop.via_node_id,
            self.ctx.settings.mailreq_max_attempts
        );
        self.ctx.metrics.incr("mrp.req_sent", 1);

        self.pending_remote.insert(
            request.mail_uuid.clone(),
            PendingRemoteMail {
                chunks,
                dest_node: next_hop.via_node_id,
                recipient: request.recipient.to_string(),
                mailreq,
                attempts: 1,
                next_retry_us: now + self.ctx.settings.mailreq_retry_secs[0] * MICROS,
                state: PendingState::AwaitAck,
            },
        );
        Ok(())
    }

    /// Persist a mail that cannot go out yet.
    pub(crate) fn queue_pending(&self, request: &RemoteMailRequest, status: &str) -> Result<()> {
        let now = self.now_us();
        let expires = now + self.ctx.settings.pending_mail_expiry_secs * MICROS;
        self.with_db(|conn| {
            pending_mail::queue(
                conn,
                &pending_mail::NewPendingMail {
                    mail_uuid: &request.mail_uuid,
                    sender_user_id: request.sender_user_id,
                    sender_username: &request.sender.user,
                    sender_bbs: &request.sender.bbs,
                    recipient_username: &request.recipient.user,
                    recipient_bbs: &request.recipient.bbs,
                    body: &request.body,
                    status,
                },
                now,
                expires,
            )
        })?;
        info!(
            "Queued mail {} to {} for later delivery ({status})",
            short(&request.mail_uuid),
            request.recipient.bbs
        );
        self.ctx.metrics.incr("mrp.queued", 1);
        Ok(())
    }

    pub(crate) async fn handle_mail_frame(&mut self, text: &str, sender: &str) -> Result<()> {
        match MailVerb::parse(text)? {
            MailVerb::Req(req) => self.handle_mailreq(req, sender).await,
            MailVerb::Ack { uuid, .. } => self.handle_mailack(&uuid, text, sender).await,
            MailVerb::Nak { uuid, reason } => self.handle_mailnak(&uuid, reason, text).await,
            MailVerb::Dat {
                uuid,
                seq,
                total,
                chunk,
            } => self.handle_maildat(&uuid, seq, total, chunk, text, sender).await,
            MailVerb::Dlv {
                uuid, destination, ..
            } => self.handle_maildlv(&uuid, &destination, text).await,
        }
    }

    async fn handle_mailreq(&mut self, req: MailReq, sender: &str) -> Result<()> {
        let uuid = req.uuid.clone();
        info!(
            "MAILREQ {}: {}@{} -> {}@{} (hop {})",
            short(&uuid),
            req.from_user,
            req.from_bbs,
            req.to_user,
            req.to_bbs,
            req.hop
        );

        // Loop guard: our callsign already in the route list.
        if req.route_contains(self.callsign()) {
            warn!("MAILREQ {}: loop detected", short(&uuid));
            self.send_nak(&uuid, NakReason::Loop, sender).await;
            return Ok(());
        }

        // Hop cap.
        if req.hop > self.ctx.settings.max_hops {
            warn!("MAILREQ {}: hop count {} over cap", short(&uuid), req.hop);
            self.send_nak(&uuid, NakReason::MaxHops, sender).await;
            return Ok(());
        }

        // Terminal destination: us.
        if req.to_bbs.eq_ignore_ascii_case(self.callsign()) {
            let recipient = self.with_db(|conn| users::get_by_username(conn, &req.to_user))?;
            if recipient.is_none() {
                warn!("MAILREQ {}: user '{}' not found", short(&uuid), req.to_user);
                self.send_nak(&uuid, NakReason::NoUser, sender).await;
                return Ok(());
            }

            self.incoming_mail.insert(
                uuid.clone(),
                IncomingRemoteMail {
                    from_user: req.from_user,
                    from_bbs: req.from_bbs,
                    to_user: req.to_user,
                    num_parts: req.parts,
                    received: Default::default(),
                    sender_node: sender.to_string(),
                    started_us: self.now_us(),
                    delivering: false,
                },
            );
            info!("MAILREQ {}: accepted, sending MAILACK", short(&uuid));
            let ack = MailVerb::Ack {
                uuid: uuid.clone(),
                status: "OK".into(),
            }
            .encode();
            self.send_frame(&ack, sender).await;
            return Ok(());
        }

        // Relay: find somewhere to forward.
        let now = self.now_us();
        let next_hop = self.with_db(|conn| routes::find_next_hop(conn, &req.to_bbs, now))?;
        let Some(next_hop) = next_hop else {
            warn!("MAILREQ {}: no route to {}", short(&uuid), req.to_bbs);
            self.send_nak(&uuid, NakReason::NoRoute, sender).await;
            return Ok(());
        };

        let mut relayed = req;
        relayed.route.push(self.callsign().to_string());
        relayed.hop += 1;

        self.relay.insert(
            uuid.clone(),
            RelayState {
                origin_node: sender.to_string(),
                dest_node: next_hop.via_node_id.clone(),
                started_us: now,
            },
        );

        info!(
            "MAILREQ {}: relaying toward {} via {}",
            short(&uuid),
            relayed.to_bbs,
            next_hop.via_node_id
        );
        self.ctx.metrics.incr("mrp.relayed", 1);
        self.send_frame(&relayed.encode(), &next_hop.via_node_id).await;
        Ok(())
    }

    async fn handle_mailack(&mut self, uuid: &str, raw: &str, sender: &str) -> Result<()> {
        info!("MAILACK {}: from {sender}", short(uuid));

        if let Some(relay) = self.relay.get(uuid) {
            let origin = relay.origin_node.clone();
            debug!("MAILACK {}: relaying back to {origin}", short(uuid));
            self.send_frame(raw, &origin).await;
            return Ok(());
        }

        let Some(pending) = self.pending_remote.get_mut(uuid) else {
            warn!("MAILACK {}: no pending mail (already sent or expired)", short(uuid));
            return Ok(());
        };
        if pending.state == PendingState::SendingChunks {
            // Duplicate ACK while the chunk task runs.
            return Ok(());
        }
        pending.state = PendingState::SendingChunks;

        let chunks = pending.chunks.clone();
        let dest = pending.dest_node.clone();
        info!(
            "MAILACK {}: sending {} chunk(s) to {dest}",
            short(uuid),
            chunks.len()
        );
        self.spawn_mail_chunks(
            uuid.to_string(),
            chunks,
            dest,
            None,
            self.ctx.settings.chunk_retries,
        );
        Ok(())
    }

    async fn handle_mailnak(&mut self, uuid: &str, reason: NakReason, raw: &str) -> Result<()> {
        warn!("MAILNAK {}: reason={reason}", short(uuid));

        if let Some(relay) = self.relay.remove(uuid) {
            self.send_frame(raw, &relay.origin_node).await;
            return Ok(());
        }

        if let Some(pending) = self.pending_remote.remove(uuid) {
            warn!(
                "MAILNAK {}: remote mail to {} rejected: {reason}",
                short(uuid),
                pending.recipient
            );
            self.fail_remote_mail(uuid, reason.as_str());
        }
        Ok(())
    }

    async fn handle_maildat(
        &mut self,
        uuid: &str,
        seq: u32,
        total: u32,
        chunk: String,
        raw: &str,
        sender: &str,
    ) -> Result<()> {
        debug!("MAILDAT {}: part {seq}/{total} from {sender}", short(uuid));

        if let Some(relay) = self.relay.get(uuid) {
            let dest = relay.dest_node.clone();
            self.send_frame(raw, &dest).await;
            return Ok(());
        }

        let Some(incoming) = self.incoming_mail.get_mut(uuid) else {
            // A duplicate after delivery: the sender missed our MAILDLV, so
            // confirm again rather than letting it retry forever.
            return self.confirm_delivered_duplicate(uuid, sender).await;
        };

        incoming.received.insert(seq, chunk);
        let complete = incoming.received.len() as u32 >= incoming.num_parts;
        if complete && !incoming.delivering {
            incoming.delivering = true;
            self.deliver_remote_mail(uuid).await?;
        }
        Ok(())
    }

    /// Idempotent MAILDLV for a chunk that arrives after the conversation
    /// finished and was stored.
    async fn confirm_delivered_duplicate(&mut self, uuid: &str, sender: &str) -> Result<()> {
        let row = self.with_db(|conn| messages::get_by_uuid(conn, uuid))?;
        let Some(row) = row else {
            debug!("MAILDAT {}: no pending incoming mail", short(uuid));
            return Ok(());
        };
        if !row.is_remote_inbound() {
            return Ok(());
        }

        let recipient = match row.recipient_user_id {
            Some(id) => self.with_db(|conn| users::get_by_id(conn, id))?.username,
            None => return Ok(()),
        };
        info!(
            "MAILDAT {}: duplicate after delivery, re-confirming",
            short(uuid)
        );
        let dlv = MailVerb::Dlv {
            uuid: uuid.to_string(),
            status: "OK".into(),
            destination: format!("{recipient}@{}", self.callsign()),
        }
        .encode();
        self.send_frame(&dlv, sender).await;
        Ok(())
    }

    /// Reassemble, store, notify, confirm.
    async fn deliver_remote_mail(&mut self, uuid: &str) -> Result<()> {
        let Some(incoming) = self.incoming_mail.remove(uuid) else {
            return Ok(());
        };

        let Some(body) = chunk::reassemble(&incoming.received, incoming.num_parts) else {
            warn!("DELIVER {}: chunk set incomplete", short(uuid));
            return Ok(());
        };

        info!(
            "Delivering remote mail {}: {}@{} -> {}",
            short(uuid),
            incoming.from_user,
            incoming.from_bbs,
            incoming.to_user
        );

        let recipient = self.with_db(|conn| users::get_by_username(conn, &incoming.to_user))?;
        let Some(recipient) = recipient else {
            warn!("DELIVER {}: recipient '{}' vanished", short(uuid), incoming.to_user);
            return Ok(());
        };

        let now = self.now_us();
        let expires = now + MAIL_EXPIRY_DAYS * 86_400 * MICROS;
        let outcome = self.with_db(|conn| {
            messages::create_incoming_remote_mail(
                conn,
                uuid,
                &incoming.from_user,
                &incoming.from_bbs,
                recipient.id,
                &body,
                now,
                expires,
            )
        })?;

        if outcome.is_duplicate() {
            info!("DELIVER {}: duplicate, confirming anyway", short(uuid));
        } else {
            self.ctx.metrics.incr("mrp.delivered_inbound", 1);
            self.record_sync(uuid, &incoming.sender_node, SyncDirection::Received);

            // Fire-and-forget poke; pulling the mail is the real ACK.
            let recipient_nodes =
                self.with_db(|conn| nodes::user_node_ids(conn, recipient.id))?;
            if let Some(node) = recipient_nodes.first() {
                let poke = format!(
                    "[MAIL] From: {}@{}. DM !mail to check.",
                    incoming.from_user, incoming.from_bbs
                );
                self.send_frame(&poke, node).await;
            }
        }

        let dlv = MailVerb::Dlv {
            uuid: uuid.to_string(),
            status: "OK".into(),
            destination: format!("{}@{}", incoming.to_user, self.callsign()),
        }
        .encode();
        self.send_frame(&dlv, &incoming.sender_node).await;
        info!("DELIVER {}: sent MAILDLV to {}", short(uuid), incoming.sender_node);
        Ok(())
    }

    async fn handle_maildlv(&mut self, uuid: &str, destination: &str, raw: &str) -> Result<()> {
        info!("MAILDLV {}: delivered to {destination}", short(uuid));

        if let Some(relay) = self.relay.remove(uuid) {
            self.send_frame(raw, &relay.origin_node).await;
            return Ok(());
        }

        self.awaiting_dlv.remove(uuid);
        self.pending_remote.remove(uuid);

        let now = self.now_us();
        self.with_db(|conn| {
            messages::mark_remote_delivered(conn, uuid, destination, now)?;
            let _ = pending_mail::delete(conn, uuid)?;
            Ok(())
        })?;
        self.ctx.metrics.incr("mrp.delivered_outbound", 1);
        Ok(())
    }

    /// Chunk-task completion: the pending entry graduates to awaiting the
    /// delivery confirmation, unless the confirmation already landed.
    pub(crate) fn on_mail_chunks_sent(&mut self, uuid: &str, failed: Vec<u32>) {
        let now = self.now_us();

        if let Some(pending) = self.pending_remote.remove(uuid) {
            let already_delivered = self
                .with_db(|conn| messages::get_by_uuid(conn, uuid))
                .ok()
                .flatten()
                .is_some_and(|row| row.delivered_at_us.is_some());
            if already_delivered {
                return;
            }

            if failed.is_empty() {
                info!("Sent all chunks for {}, awaiting MAILDLV", short(uuid));
            } else {
                warn!("{} chunk(s) failed for {}: {failed:?}", failed.len(), short(uuid));
            }

            self.awaiting_dlv.insert(
                uuid.to_string(),
                AwaitingDlv {
                    dest_node: pending.dest_node,
                    chunks: pending.chunks,
                    failed_chunks: failed,
                    attempts: 1,
                    next_retry_us: now + self.ctx.settings.maildlv_retry_secs[0] * MICROS,
                },
            );
        } else if let Some(awaiting) = self.awaiting_dlv.get_mut(uuid) {
            // A resend pass finished; remember what is still unconfirmed.
            awaiting.failed_chunks = failed;
        }
    }

    /// Retry MAILREQs that never got their MAILACK.
    pub(crate) async fn retry_pending_mailreq(&mut self, now: i64) {
        let due: Vec<String> = self
            .pending_remote
            .iter()
            .filter(|(_, p)| p.state == PendingState::AwaitAck && now >= p.next_retry_us)
            .map(|(uuid, _)| uuid.clone())
            .collect();

        for uuid in due {
            let max_attempts = self.ctx.settings.mailreq_max_attempts;
            let Some(pending) = self.pending_remote.get(&uuid) else {
                continue;
            };

            if pending.attempts >= max_attempts {
                warn!(
                    "MAILREQ {} failed after {} attempts, giving up",
                    short(&uuid),
                    pending.attempts
                );
                self.pending_remote.remove(&uuid);
                self.fail_remote_mail(&uuid, "NO_ACK");
                continue;
            }

            let mailreq = pending.mailreq.clone();
            let dest = pending.dest_node.clone();
            self.send_frame(&mailreq, &dest).await;

            if let Some(pending) = self.pending_remote.get_mut(&uuid) {
                let intervals = &self.ctx.settings.mailreq_retry_secs;
                let idx = (pending.attempts as usize).min(intervals.len() - 1);
                pending.attempts += 1;
                pending.next_retry_us = now + intervals[idx] * MICROS;
                info!(
                    "Retried MAILREQ for {} (attempt {}/{max_attempts})",
                    short(&uuid),
                    pending.attempts
                );
            }
        }
    }

    /// Resend chunk sets that never got their MAILDLV.
    pub(crate) fn retry_awaiting_dlv(&mut self, now: i64) {
        let due: Vec<String> = self
            .awaiting_dlv
            .iter()
            .filter(|(_, a)| now >= a.next_retry_us)
            .map(|(uuid, _)| uuid.clone())
            .collect();

        for uuid in due {
            let max_attempts = self.ctx.settings.maildlv_max_attempts;
            let Some(awaiting) = self.awaiting_dlv.get(&uuid) else {
                continue;
            };

            if awaiting.attempts >= max_attempts {
                warn!(
                    "MAILDLV for {} not received after {} attempts, giving up",
                    short(&uuid),
                    awaiting.attempts
                );
                self.awaiting_dlv.remove(&uuid);
                self.fail_remote_mail(&uuid, "NO_DLV_CONFIRM");
                continue;
            }

            let (chunks, dest, only) = {
                let awaiting = match self.awaiting_dlv.get_mut(&uuid) {
                    Some(a) => a,
                    None => continue,
                };
                let intervals = &self.ctx.settings.maildlv_retry_secs;
                let idx = (awaiting.attempts as usize).min(intervals.len() - 1);
                awaiting.attempts += 1;
                awaiting.next_retry_us = now + intervals[idx] * MICROS;

                let only = if awaiting.failed_chunks.is_empty() {
                    None
                } else {
                    Some(awaiting.failed_chunks.clone())
                };
                (awaiting.chunks.clone(), awaiting.dest_node.clone(), only)
            };

            match &only {
                Some(failed) => info!(
                    "Retrying {} failed chunk(s) for {} to {dest}",
                    failed.len(),
                    short(&uuid)
                ),
                None => info!(
                    "Retrying all chunks for {} to {dest} (no MAILDLV)",
                    short(&uuid)
                ),
            }
            self.spawn_mail_chunks(
                uuid.clone(),
                chunks,
                dest,
                only,
                self.ctx.settings.chunk_resend_retries,
            );
        }
    }

    /// Drop chunk sets and relay entries that timed out.
    pub(crate) fn cleanup_stale_mail_state(&mut self, now: i64) {
        let incoming_timeout = self.ctx.settings.incoming_timeout_secs * MICROS;
        self.incoming_mail.retain(|uuid, incoming| {
            let stale = now - incoming.started_us > incoming_timeout;
            if stale {
                warn!(
                    "Incoming mail {} timed out: {}/{} chunks",
                    short(uuid),
                    incoming.received.len(),
                    incoming.num_parts
                );
            }
            !stale
        });

        let relay_timeout = self.ctx.settings.relay_timeout_secs * MICROS;
        self.relay.retain(|uuid, relay| {
            let stale = now - relay.started_us > relay_timeout;
            if stale {
                debug!("Relay state {} expired", short(uuid));
            }
            !stale
        });
    }

    pub(crate) fn fail_remote_mail(&self, uuid: &str, reason: &str) {
        if let Err(e) = self.with_db(|conn| messages::mark_remote_failed(conn, uuid, reason)) {
            warn!("Failed to record mail failure for {}: {e}", short(uuid));
        }
        self.ctx.metrics.incr("mrp.failed", 1);
    }

    pub(crate) fn record_sync(&self, uuid: &str, peer_node: &str, direction: SyncDirection) {
        let now = self.now_us();
        let result = self.with_db(|conn| {
            let peer = peers::ensure_exists(conn, peer_node, now)?;
            sync_log::record(conn, uuid, peer.id, direction, "acked", now)
        });
        if let Err(e) = result {
            warn!("Failed to record sync log for {}: {e}", short(uuid));
        }
    }

    async fn send_nak(&self, uuid: &str, reason: NakReason, dest: &str) {
        let nak = MailVerb::Nak {
            uuid: uuid.to_string(),
            reason,
        }
        .encode();
        self.send_frame(&nak, dest).await;
        self.ctx.metrics.incr("mrp.nak_sent", 1);
    }

    fn spawn_mail_chunks(
        &self,
        uuid: String,
        chunks: Vec<String>,
        dest: String,
        only: Option<Vec<u32>>,
        retries: u32,
    ) {
        let transport = self.ctx.transport.clone();
        let events = self.events_tx.clone();
        let ack_timeout = self.ctx.settings.chunk_ack_timeout;

        tokio::spawn(async move {
            let failed =
                transmit_mail_chunks(transport, &uuid, &chunks, &dest, only, retries, ack_timeout)
                    .await;
            let _ = events.send(EngineEvent::MailChunksSent { uuid, failed });
        });
    }
}

/// Send a chunk set with per-chunk link-ACK retries. Returns the sequence
/// numbers that never got a link ACK.
async fn transmit_mail_chunks(
    transport: Transport,
    uuid: &str,
    chunks: &[String],
    dest: &str,
    only: Option<Vec<u32>>,
    retries: u32,
    ack_timeout: Duration,
) -> Vec<u32> {
    let total = chunks.len() as u32;
    let indices: Vec<u32> = only.unwrap_or_else(|| (1..=total).collect());
    let mut failed = Vec::new();

    for (pos, seq) in indices.iter().enumerate() {
        let Some(chunk) = chunks.get((*seq - 1) as usize) else {
            continue;
        };
        let frame = MailVerb::Dat {
            uuid: uuid.to_string(),
            seq: *seq,
            total,
            chunk: chunk.clone(),
        }
        .encode();

        let mut delivered = false;
        for attempt in 0..retries {
            let (acked, reason) = transport.send_dm_wait_ack(&frame, dest, ack_timeout).await;
            if acked {
                debug!("MAILDAT {} chunk {seq}/{total} ACKed", short(uuid));
                delivered = true;
                break;
            }
            warn!(
                "MAILDAT {} chunk {seq}/{total} failed: {reason} (attempt {}/{retries})",
                short(uuid),
                attempt + 1
            );
            if attempt + 1 < retries {
                tokio::time::sleep(jitter(3.0, 5.0)).await;
            }
        }

        if !delivered {
            failed.push(*seq);
        }
        if pos + 1 < indices.len() {
            tokio::time::sleep(jitter(2.2, 2.6)).await;
        }
    }

    failed
}

/// Uniform jitter between two second marks.
pub(crate) fn jitter(lo: f64, hi: f64) -> Duration {
    let secs = rand::Rng::gen_range(&mut rand::thread_rng(), lo..hi);
    Duration::from_secs_f64(secs)
}
