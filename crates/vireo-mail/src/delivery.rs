//! Background delivery worker.
//!
//! Every ten seconds the worker scans mail rows that were stored but never
//! delivered, honoring a per-attempt backoff ladder of `30 * {1, 2, 4}`
//! seconds. A due local row gets a short notification poke to each of the
//! recipient's nodes; the poke is fire-and-forget — the user pulling their
//! mail is the acknowledgment. A due transit row is presented to the remote
//! protocol, which ignores the presentation while a handshake for that UUID
//! is already in flight — so this doubles as restart recovery without ever
//! double-driving a live handshake, and the same attempt budget bounds both
//! branches.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use vireo_db::queries::{messages, nodes, users};
use vireo_types::clock::MICROS_PER_SEC;
use vireo_types::message::{
    ACK_TIMEOUT_SECS, BACKOFF_MULTIPLIERS, MAX_DELIVERY_ATTEMPTS, MAX_HOP_COUNT,
};

use crate::service::MailService;
use crate::Result;

/// Sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Rows examined per sweep.
const SWEEP_BATCH: i64 = 10;

/// Spawn the delivery worker.
pub fn spawn_delivery_worker(
    service: Arc<MailService>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Mail delivery worker started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Mail delivery worker stopped");
                    break;
                }
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                    if let Err(e) = process_pending_deliveries(&service).await {
                        error!("Delivery worker error: {e}");
                    }
                }
            }
        }
    })
}

/// One sweep over the pending rows.
pub async fn process_pending_deliveries(service: &MailService) -> Result<()> {
    let now = service.clock.now_us();
    let pending = {
        let conn = service.db.lock();
        messages::pending_deliveries(&conn, SWEEP_BATCH)?
    };

    for row in pending {
        // Backoff ladder keyed to the attempt count.
        if let Some(last) = row.last_attempt_us {
            let idx = (row.delivery_attempts as usize).min(BACKOFF_MULTIPLIERS.len() - 1);
            let wait_us = ACK_TIMEOUT_SECS * BACKOFF_MULTIPLIERS[idx] * MICROS_PER_SEC;
            if now - last < wait_us {
                continue;
            }
        }

        if row.is_remote_outbound() {
            // Present the row to the remote protocol; a handshake already
            // in flight ignores the re-presentation, and its own ladders
            // decide the terminal outcome.
            let final_attempt = row.delivery_attempts + 1 >= MAX_DELIVERY_ATTEMPTS;
            hand_off_transit_row(service, &row, now).await;
            if final_attempt {
                warn!(
                    "Transit mail {} presented {} times; no further presentations",
                    row.uuid,
                    row.delivery_attempts + 1
                );
                service.metrics.incr("mail.transit_presentations_exhausted", 1);
            }
            continue;
        }

        let delivered = attempt_local_delivery(service, &row).await;
        let conn = service.db.lock();
        if delivered {
            messages::mark_delivered(&conn, row.id, now)?;
            info!("Mail {} delivered", &row.uuid[..8.min(row.uuid.len())]);
            service.metrics.incr("mail.delivered", 1);
        } else if row.delivery_attempts + 1 >= MAX_DELIVERY_ATTEMPTS {
            if row.hop_count < MAX_HOP_COUNT {
                // Local encrypted mail has no transit form (the body is
                // sealed to the recipient's key), so there is nothing a
                // peer could deliver; the row is abandoned.
                messages::update_delivery_attempt(&conn, row.id, now, None)?;
                warn!(
                    "Mail {} undeliverable after {} attempts, giving up",
                    &row.uuid[..8.min(row.uuid.len())],
                    row.delivery_attempts + 1
                );
            } else {
                warn!(
                    "Mail {} exceeded max hops, giving up",
                    &row.uuid[..8.min(row.uuid.len())]
                );
            }
            service.metrics.incr("mail.abandoned", 1);
        } else {
            messages::update_delivery_attempt(&conn, row.id, now, None)?;
        }
    }

    Ok(())
}

/// Present a transit row to the sync engine, recording the attempt.
///
/// The engine treats a UUID that is already mid-handshake as a no-op, so
/// presenting here is always safe; it only matters for rows the engine is
/// not currently driving (fresh after a restart, or a crash between store
/// and signal).
async fn hand_off_transit_row(service: &MailService, row: &messages::MessageRow, now: i64) {
    let Some(request) = service.transit_request(row) else {
        warn!("Transit row {} has unparseable addressing", row.uuid);
        return;
    };

    {
        let conn = service.db.lock();
        if let Err(e) = messages::update_delivery_attempt(&conn, row.id, now, None) {
            warn!("Failed to record hand-off for {}: {e}", row.uuid);
            return;
        }
    }

    match service.sync.send_remote_mail(request).await {
        Ok(outcome) => info!("Transit mail {} handed to sync: {outcome:?}", row.uuid),
        Err(e) => warn!("Transit mail {} hand-off failed: {e}", row.uuid),
    }
}

/// Poke every node associated with the recipient. Sending the poke is the
/// success condition; there is no application-level ACK for it.
async fn attempt_local_delivery(service: &MailService, row: &messages::MessageRow) -> bool {
    let (recipient_nodes, sender_name) = {
        let conn = service.db.lock();
        let recipient_nodes = match row.recipient_user_id {
            Some(user_id) => nodes::user_node_ids(&conn, user_id).unwrap_or_default(),
            None => match row.recipient_node_id {
                Some(node_id) => nodes::get_by_id(&conn, node_id)
                    .map(|n| vec![n.node_id])
                    .unwrap_or_default(),
                None => Vec::new(),
            },
        };
        let sender_name = match row.sender_user_id {
            Some(id) => users::get_by_id(&conn, id)
                .map(|u| u.username)
                .unwrap_or_else(|_| "ERR".to_string()),
            None => "ERR".to_string(),
        };
        (recipient_nodes, sender_name)
    };

    if recipient_nodes.is_empty() {
        return false;
    }

    let notification = format!("[MAIL] From: {sender_name}. DM !mail to check.");
    for node in &recipient_nodes {
        match service.transport.send_dm(&notification, node).await {
            Ok(_) => {
                info!("Sent mail notification to {node}");
                return true;
            }
            Err(e) => warn!("Mail notification to {node} failed: {e}"),
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use vireo_crypto::master::MasterKey;
    use vireo_db::Db;
    use vireo_sync::{EngineContext, SyncEngine, SyncSettings};
    use vireo_transport::mock::MockRadio;
    use vireo_transport::{Transport, TransportConfig};
    use vireo_types::clock::Clock;

    use crate::accounts::AccountService;
    use crate::service::{MailConfig, MailService};

    fn fast_kdf() -> vireo_crypto::argon2id::KdfParams {
        vireo_crypto::argon2id::KdfParams {
            m_cost_kib: 1024,
            t_cost: 1,
            p_cost: 1,
        }
    }

    struct Fixture {
        service: Arc<MailService>,
        accounts: AccountService,
        radio: Arc<MockRadio>,
        db: Db,
        clock_cell: Arc<std::sync::atomic::AtomicI64>,
    }

    async fn fixture() -> Fixture {
        let db = Db::open_memory().expect("db");
        let master = Arc::new(MasterKey::generate());
        let radio = MockRadio::new();
        radio.auto_ack(true);
        let (transport, frames, _fatal) = Transport::start(
            radio.clone(),
            TransportConfig {
                min_send_interval: Duration::from_millis(1),
                ..TransportConfig::default()
            },
        )
        .expect("transport");

        let (clock, cell) = Clock::manual(1_000_000_000_000);

        let (engine, events_rx) = SyncEngine::new(EngineContext {
            db: db.clone(),
            transport: transport.clone(),
            master: master.clone(),
            settings: SyncSettings::default(),
            metrics: vireo_types::metrics::noop(),
            clock: clock.clone(),
        });
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        let (sync, _task) =
            vireo_sync::engine::spawn(engine, events_rx, frames, shutdown_tx.subscribe());

        let accounts = AccountService::new(db.clone(), master.clone(), fast_kdf(), clock.clone());
        let service = Arc::new(MailService::new(
            db.clone(),
            master,
            transport,
            sync,
            MailConfig::default(),
            vireo_types::metrics::noop(),
            clock,
        ));

        Fixture {
            service,
            accounts,
            radio,
            db,
            clock_cell: cell,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_mail_round_trip() {
        let fx = fixture().await;
        let alice = fx.accounts.register("alice", "pw", "!alice001").expect("alice");
        let bob = fx.accounts.register("bob", "pw", "!bob00001").expect("bob");

        let row = fx
            .service
            .compose_mail(alice.id, "!alice001", "bob", "hi", None)
            .expect("compose");
        assert!(row.subject_enc.is_some());

        let listing = fx.service.list_mail(bob.id, false, 10, 0).expect("list");
        assert_eq!(listing.len(), 1);
        assert!(listing[0].new);
        assert_eq!(listing[0].from, "alice");

        let view = fx.service.read_mail(bob.id, listing[0].id).expect("read");
        assert_eq!(view.body, "hi");
        assert_eq!(view.from, "alice");

        let listing = fx.service.list_mail(bob.id, false, 10, 0).expect("list");
        assert!(!listing[0].new);
    }

    #[tokio::test(start_paused = true)]
    async fn test_compose_rejections() {
        let fx = fixture().await;
        let alice = fx.accounts.register("alice", "pw", "!alice001").expect("alice");
        let eve = fx.accounts.register("eve", "pw", "!eve00001").expect("eve");
        fx.accounts.ban(eve.id, "spam").expect("ban");

        assert!(matches!(
            fx.service.compose_mail(alice.id, "!alice001", "nobody", "hi", None),
            Err(crate::MailError::RecipientNotFound(_))
        ));
        assert!(matches!(
            fx.service.compose_mail(alice.id, "!alice001", "eve", "hi", None),
            Err(crate::MailError::RecipientBanned)
        ));
        assert!(matches!(
            fx.service.compose_mail(alice.id, "!alice001", "alice", "hi", None),
            Err(crate::MailError::SelfAddressed)
        ));
        assert!(matches!(
            fx.service
                .compose_mail(alice.id, "!alice001", "eve", &"x".repeat(1001), None),
            Err(crate::MailError::BodyTooLong { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_requires_ownership() {
        let fx = fixture().await;
        let alice = fx.accounts.register("alice", "pw", "!alice001").expect("alice");
        let bob = fx.accounts.register("bob", "pw", "!bob00001").expect("bob");
        let carol = fx.accounts.register("carol", "pw", "!carol001").expect("carol");

        let row = fx
            .service
            .compose_mail(alice.id, "!alice001", "bob", "secret", None)
            .expect("compose");
        let _ = bob;
        assert!(matches!(
            fx.service.read_mail(carol.id, row.id),
            Err(crate::MailError::NotYours)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_pokes_recipient_node() {
        let fx = fixture().await;
        let alice = fx.accounts.register("alice", "pw", "!alice001").expect("alice");
        fx.accounts.register("bob", "pw", "!bob00001").expect("bob");

        fx.service
            .compose_mail(alice.id, "!alice001", "bob", "hello there", None)
            .expect("compose");

        fx.radio.clear_sent();
        process_pending_deliveries(&fx.service).await.expect("sweep");

        let pokes = fx.radio.sent_with_prefix("[MAIL] From: alice");
        assert_eq!(pokes.len(), 1);
        assert_eq!(pokes[0].destination, "!bob00001");

        // Poked once: the row is marked delivered and leaves the queue.
        process_pending_deliveries(&fx.service).await.expect("sweep");
        assert_eq!(fx.radio.sent_with_prefix("[MAIL] From: alice").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_ladder_gates_attempts() {
        let fx = fixture().await;
        let alice = fx.accounts.register("alice", "pw", "!alice001").expect("alice");
        let bob = fx.accounts.register("bob", "pw", "!bob00001").expect("bob");

        let row = fx
            .service
            .compose_mail(alice.id, "!alice001", "bob", "hi", None)
            .expect("compose");
        let _ = bob;

        // Simulate a failed first attempt at T0.
        {
            let conn = fx.db.lock();
            messages::update_delivery_attempt(&conn, row.id, fx.service.clock.now_us(), None)
                .expect("attempt");
        }

        fx.radio.clear_sent();

        // 20s later: attempt 1 backoff is 60s, so nothing goes out.
        fx.clock_cell.fetch_add(20 * MICROS_PER_SEC, std::sync::atomic::Ordering::SeqCst);
        process_pending_deliveries(&fx.service).await.expect("sweep");
        assert!(fx.radio.sent_with_prefix("[MAIL]").is_empty());

        // 70s after the attempt: due.
        fx.clock_cell.fetch_add(50 * MICROS_PER_SEC, std::sync::atomic::Ordering::SeqCst);
        process_pending_deliveries(&fx.service).await.expect("sweep");
        assert_eq!(fx.radio.sent_with_prefix("[MAIL]").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_system_mail_readable() {
        let fx = fixture().await;
        let alice = fx.accounts.register("alice", "pw", "!alice001").expect("alice");

        {
            let conn = fx.db.lock();
            messages::create(
                &conn,
                &messages::NewMessage {
                    msg_type: Some(vireo_types::message::MessageType::System),
                    recipient_user_id: Some(alice.id),
                    subject_enc: Some(b"Queued mail to GL42 delivered"),
                    body_enc: b"Your message was delivered.",
                    ..messages::NewMessage::default()
                },
                fx.service.clock.now_us(),
            )
            .expect("create");
        }

        let listing = fx.service.list_mail(alice.id, false, 10, 0).expect("list");
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].from, "SYSTEM");
        assert_eq!(
            listing[0].subject.as_deref(),
            Some("Queued mail to GL42 delivered")
        );

        let view = fx.service.read_mail(alice.id, listing[0].id).expect("read");
        assert_eq!(view.body, "Your message was delivered.");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transit_rows_presented_on_bounded_budget() {
        let fx = fixture().await;
        fx.accounts.register("alice", "pw", "!alice001").expect("alice");

        // A transit row the engine has never seen, as after a restart.
        {
            let conn = fx.db.lock();
            let node = nodes::get_or_create(&conn, "!alice001", fx.service.clock.now_us())
                .expect("node");
            messages::create_remote_outbound(
                &conn,
                "T-1",
                "alice",
                "ADV",
                node.id,
                "dave",
                "GL42",
                "queued body",
                fx.service.clock.now_us(),
            )
            .expect("row");
        }

        let attempts = |fx: &Fixture| {
            let conn = fx.db.lock();
            messages::get_by_uuid(&conn, "T-1")
                .expect("get")
                .expect("row")
                .delivery_attempts
        };

        // First sweep presents the row; with no route configured the
        // engine queues it for redrive.
        process_pending_deliveries(&fx.service).await.expect("sweep");
        assert_eq!(attempts(&fx), 1);
        {
            let conn = fx.db.lock();
            assert_eq!(
                vireo_db::queries::pending_mail::count(&conn).expect("count"),
                1
            );
        }

        // Inside the backoff window nothing more happens.
        process_pending_deliveries(&fx.service).await.expect("sweep");
        assert_eq!(attempts(&fx), 1);

        // Two more due sweeps exhaust the presentation budget.
        fx.clock_cell
            .fetch_add(61 * MICROS_PER_SEC, std::sync::atomic::Ordering::SeqCst);
        process_pending_deliveries(&fx.service).await.expect("sweep");
        assert_eq!(attempts(&fx), 2);

        fx.clock_cell
            .fetch_add(121 * MICROS_PER_SEC, std::sync::atomic::Ordering::SeqCst);
        process_pending_deliveries(&fx.service).await.expect("sweep");
        assert_eq!(attempts(&fx), 3);

        // The row never surfaces again; the queued copy (and its expiry
        // receipt) is the remote protocol's to resolve.
        fx.clock_cell
            .fetch_add(600 * MICROS_PER_SEC, std::sync::atomic::Ordering::SeqCst);
        process_pending_deliveries(&fx.service).await.expect("sweep");
        assert_eq!(attempts(&fx), 3);
        {
            let conn = fx.db.lock();
            assert_eq!(
                vireo_db::queries::pending_mail::count(&conn).expect("count"),
                1
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_tolerates_aad_clock_drift() {
        let fx = fixture().await;
        let alice = fx.accounts.register("alice", "pw", "!alice001").expect("alice");
        let bob = fx.accounts.register("bob", "pw", "!bob00001").expect("bob");

        // Seal a body whose AAD second trails the stored creation second by
        // two — the worst drift the reader must absorb.
        let created_us = fx.service.clock.now_us();
        let created_secs = created_us / MICROS_PER_SEC;
        let body_enc = {
            let conn = fx.db.lock();
            let bob_row = users::get_by_id(&conn, bob.id).expect("bob");
            let key = fx.service.master.open_user_key(&bob_row.enc_key_master).expect("key");
            let aad = vireo_crypto::envelope::mail_aad("alice", created_secs - 2);
            vireo_crypto::envelope::seal_str(&key, "drifted", &aad).expect("seal")
        };

        let row_id = {
            let conn = fx.db.lock();
            match messages::create(
                &conn,
                &messages::NewMessage {
                    msg_type: Some(vireo_types::message::MessageType::Mail),
                    sender_user_id: Some(alice.id),
                    recipient_user_id: Some(bob.id),
                    body_enc: &body_enc,
                    ..messages::NewMessage::default()
                },
                created_us,
            )
            .expect("create")
            {
                messages::CreateOutcome::Inserted(row) => row.id,
                messages::CreateOutcome::Duplicate => panic!("duplicate"),
            }
        };

        let view = fx.service.read_mail(bob.id, row_id).expect("read");
        assert_eq!(view.body, "drifted");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_falls_back_to_legacy_window() {
        let fx = fixture().await;
        let alice = fx.accounts.register("alice", "pw", "!alice001").expect("alice");
        let bob = fx.accounts.register("bob", "pw", "!bob00001").expect("bob");

        // A legacy row: its stored creation time has nothing to do with
        // the second inside its AAD, which lies a few minutes back.
        let now_secs = fx.service.clock.now_us() / MICROS_PER_SEC;
        let body_enc = {
            let conn = fx.db.lock();
            let bob_row = users::get_by_id(&conn, bob.id).expect("bob");
            let key = fx.service.master.open_user_key(&bob_row.enc_key_master).expect("key");
            let aad = vireo_crypto::envelope::mail_aad("alice", now_secs - 500);
            vireo_crypto::envelope::seal_str(&key, "legacy body", &aad).expect("seal")
        };

        let row_id = {
            let conn = fx.db.lock();
            match messages::create(
                &conn,
                &messages::NewMessage {
                    msg_type: Some(vireo_types::message::MessageType::Mail),
                    sender_user_id: Some(alice.id),
                    recipient_user_id: Some(bob.id),
                    body_enc: &body_enc,
                    ..messages::NewMessage::default()
                },
                // Creation stamp far from the AAD second.
                fx.service.clock.now_us() - 7200 * MICROS_PER_SEC,
            )
            .expect("create")
            {
                messages::CreateOutcome::Inserted(row) => row.id,
                messages::CreateOutcome::Duplicate => panic!("duplicate"),
            }
        };

        let view = fx.service.read_mail(bob.id, row_id).expect("read");
        assert_eq!(view.body, "legacy body");
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_mail_reads_as_plaintext() {
        let fx = fixture().await;
        let bob = fx.accounts.register("bob", "pw", "!bob00001").expect("bob");

        let row_id = {
            let conn = fx.db.lock();
            match messages::create_incoming_remote_mail(
                &conn,
                "R-77",
                "carol",
                "MV51",
                bob.id,
                "hello from afar",
                fx.service.clock.now_us(),
                fx.service.clock.now_us() + 1_000_000_000,
            )
            .expect("create")
            {
                messages::CreateOutcome::Inserted(row) => row.id,
                messages::CreateOutcome::Duplicate => panic!("duplicate"),
            }
        };

        let view = fx.service.read_mail(bob.id, row_id).expect("read");
        assert_eq!(view.body, "hello from afar");
        assert_eq!(view.from, "carol");
        assert_eq!(view.from_bbs.as_deref(), Some("MV51"));
        assert_eq!(view.subject, "(remote mail)");

        // Listings truncate the origin callsign for narrow screens.
        let listing = fx.service.list_mail(bob.id, false, 10, 0).expect("list");
        assert_eq!(listing[0].from, "carol@MV51");
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbox_summary() {
        let fx = fixture().await;
        let alice = fx.accounts.register("alice", "pw", "!alice001").expect("alice");
        let bob = fx.accounts.register("bob", "pw", "!bob00001").expect("bob");

        fx.service
            .compose_mail(alice.id, "!alice001", "bob", "one", None)
            .expect("compose");
        fx.service
            .compose_mail(alice.id, "!alice001", "bob", "two", None)
            .expect("compose");

        let summary = fx.service.get_inbox_summary(bob.id).expect("summary");
        assert_eq!(summary.total, 2);
        assert_eq!(summary.unread, 2);

        let listing = fx.service.list_mail(bob.id, false, 10, 0).expect("list");
        fx.service.read_mail(bob.id, listing[0].id).expect("read");

        let summary = fx.service.get_inbox_summary(bob.id).expect("summary");
        assert_eq!(summary.unread, 1);
    }
}
