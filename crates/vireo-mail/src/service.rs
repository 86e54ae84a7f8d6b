//! The mail delivery engine's user-facing surface.

use std::sync::Arc;

use tracing::info;

use vireo_crypto::envelope::{self, mail_aad};
use vireo_crypto::master::MasterKey;
use vireo_db::queries::{messages, nodes, users};
use vireo_db::Db;
use vireo_sync::{RemoteMailRequest, SendOutcome, SyncHandle};
use vireo_transport::Transport;
use vireo_types::addr::{RemoteAddr, TransitAddr};
use vireo_types::clock::{Clock, MICROS_PER_SEC};
use vireo_types::message::{MessageType, MAIL_EXPIRY_DAYS};
use vireo_types::metrics::Metrics;

use crate::{MailError, Result};

/// Maximum local mail body length, in characters.
pub const MAX_LOCAL_BODY: usize = 1000;

/// Maximum remote mail body length, in characters.
pub const MAX_REMOTE_BODY: usize = 450;

/// Implicit subject length when derived from the first word of the body.
const IMPLICIT_SUBJECT_CHARS: usize = 20;

/// Mail engine tuning.
#[derive(Clone, Debug)]
pub struct MailConfig {
    /// Our BBS callsign.
    pub callsign: String,
    /// Mail retention in days.
    pub expiry_days: i64,
    /// Backward search window (seconds) for rows whose AAD second cannot
    /// be reconstructed from metadata.
    pub legacy_aad_window_secs: i64,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            callsign: "ADV".to_string(),
            expiry_days: MAIL_EXPIRY_DAYS,
            legacy_aad_window_secs: 3600,
        }
    }
}

/// A decrypted mail, ready for display.
#[derive(Debug, Clone)]
pub struct MailView {
    pub id: i64,
    pub from: String,
    /// Origin BBS for remote mail.
    pub from_bbs: Option<String>,
    pub subject: String,
    pub body: String,
    pub date_us: i64,
    pub read: bool,
}

/// A mailbox listing entry (headers only).
#[derive(Debug, Clone)]
pub struct MailSummary {
    pub id: i64,
    pub from: String,
    pub subject: Option<String>,
    pub date_us: i64,
    pub new: bool,
}

/// Inbox counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboxSummary {
    pub unread: i64,
    pub total: i64,
}

/// The mail service.
pub struct MailService {
    pub(crate) db: Db,
    pub(crate) master: Arc<MasterKey>,
    pub(crate) transport: Transport,
    pub(crate) sync: SyncHandle,
    pub(crate) config: MailConfig,
    pub(crate) metrics: Metrics,
    pub(crate) clock: Clock,
}

impl MailService {
    pub fn new(
        db: Db,
        master: Arc<MasterKey>,
        transport: Transport,
        sync: SyncHandle,
        config: MailConfig,
        metrics: Metrics,
        clock: Clock,
    ) -> Self {
        Self {
            db,
            master,
            transport,
            sync,
            config,
            metrics,
            clock,
        }
    }

    /// Compose and store an encrypted local mail.
    pub fn compose_mail(
        &self,
        sender_user_id: i64,
        sender_node: &str,
        recipient_username: &str,
        body: &str,
        subject: Option<&str>,
    ) -> Result<messages::MessageRow> {
        if body.chars().count() > MAX_LOCAL_BODY {
            return Err(MailError::BodyTooLong { max: MAX_LOCAL_BODY });
        }

        let now = self.clock.now_us();
        let conn = self.db.lock();

        let recipient = users::get_by_username(&conn, recipient_username)?
            .ok_or_else(|| MailError::RecipientNotFound(recipient_username.to_string()))?;
        if recipient.is_banned {
            return Err(MailError::RecipientBanned);
        }
        if recipient.id == sender_user_id {
            return Err(MailError::SelfAddressed);
        }
        let sender = users::get_by_id(&conn, sender_user_id)?;

        // No explicit subject: the first word of the body stands in.
        let implicit;
        let subject = match subject {
            Some(s) => Some(s),
            None => {
                implicit = body
                    .split_whitespace()
                    .next()
                    .map(|w| w.chars().take(IMPLICIT_SUBJECT_CHARS).collect::<String>());
                implicit.as_deref()
            }
        };

        // Encrypt under the recipient's escrowed data key, binding the
        // sender and the compose second into the AAD.
        let recipient_key = self.master.open_user_key(&recipient.enc_key_master)?;
        let aad = mail_aad(&sender.username, now / MICROS_PER_SEC);
        let body_enc = envelope::seal_str(&recipient_key, body, &aad)?;
        let subject_enc = match subject {
            Some(s) => Some(envelope::seal_str(&recipient_key, s, &aad)?),
            None => None,
        };

        let node = nodes::get_or_create(&conn, sender_node, now)?;
        let expires = now + self.config.expiry_days * 86_400 * MICROS_PER_SEC;

        let outcome = messages::create(
            &conn,
            &messages::NewMessage {
                msg_type: Some(MessageType::Mail),
                sender_user_id: Some(sender_user_id),
                sender_node_id: Some(node.id),
                recipient_user_id: Some(recipient.id),
                subject_enc: subject_enc.as_deref(),
                body_enc: &body_enc,
                origin_bbs: Some(&self.config.callsign),
                expires_at_us: Some(expires),
                ..messages::NewMessage::default()
            },
            now,
        )?;

        let row = match outcome {
            messages::CreateOutcome::Inserted(row) => row,
            // A fresh v4 UUID cannot collide in practice; treat it as a
            // store fault if it somehow does.
            messages::CreateOutcome::Duplicate => {
                return Err(MailError::Db(vireo_db::DbError::UniqueViolation(
                    "message uuid".into(),
                )))
            }
        };

        info!("Mail composed: {} -> {}", sender.username, recipient.username);
        self.metrics.incr("mail.composed", 1);
        Ok(row)
    }

    /// Compose a remote mail (`user@BBS` form) and hand it to the sync
    /// engine. Returns the created row's UUID and whether it went out or
    /// was queued for a route.
    pub async fn compose_remote_mail(
        &self,
        sender_user_id: i64,
        sender_node: &str,
        recipient_username: &str,
        recipient_bbs: &str,
        body: &str,
    ) -> Result<(String, SendOutcome)> {
        let len = body.chars().count();
        if len > MAX_REMOTE_BODY {
            return Err(MailError::RemoteBodyTooLong {
                max: MAX_REMOTE_BODY,
                len,
            });
        }

        let now = self.clock.now_us();
        let recipient_bbs = recipient_bbs.to_uppercase();
        let uuid = uuid::Uuid::new_v4().to_string();

        let sender_username = {
            let conn = self.db.lock();
            let sender = users::get_by_id(&conn, sender_user_id)?;
            let node = nodes::get_or_create(&conn, sender_node, now)?;

            // The transit row goes down before the engine is signalled, so
            // a crash in between leaves a retryable row, not lost mail.
            messages::create_remote_outbound(
                &conn,
                &uuid,
                &sender.username,
                &self.config.callsign,
                node.id,
                recipient_username,
                &recipient_bbs,
                body,
                now,
            )?;
            // Marks the hand-off so the delivery worker leaves it to the
            // remote protocol.
            let row = messages::get_by_uuid(&conn, &uuid)?
                .ok_or(MailError::MessageNotFound)?;
            messages::update_delivery_attempt(&conn, row.id, now, None)?;
            sender.username
        };

        let outcome = self
            .sync
            .send_remote_mail(RemoteMailRequest {
                mail_uuid: uuid.clone(),
                sender_user_id: Some(sender_user_id),
                sender: RemoteAddr {
                    user: sender_username,
                    bbs: self.config.callsign.clone(),
                },
                recipient: RemoteAddr {
                    user: recipient_username.to_string(),
                    bbs: recipient_bbs,
                },
                body: body.to_string(),
            })
            .await?;

        self.metrics.incr("mail.remote_composed", 1);
        Ok((uuid, outcome))
    }

    /// Read and decrypt a mail, marking it read on success.
    pub fn read_mail(&self, user_id: i64, message_id: i64) -> Result<MailView> {
        let conn = self.db.lock();

        let row = messages::get_by_id(&conn, message_id)
            .map_err(|_| MailError::MessageNotFound)?;
        if row.recipient_user_id != Some(user_id) {
            return Err(MailError::NotYours);
        }

        let view = if row.msg_type == MessageType::System {
            // System notices are stored in the clear.
            MailView {
                id: row.id,
                from: "SYSTEM".to_string(),
                from_bbs: None,
                subject: row
                    .subject_enc
                    .as_deref()
                    .map(|s| String::from_utf8_lossy(s).into_owned())
                    .unwrap_or_else(|| "(no subject)".to_string()),
                body: String::from_utf8_lossy(&row.body_enc).into_owned(),
                date_us: row.created_at_us,
                read: row.read_at_us.is_some(),
            }
        } else if row.is_remote_inbound() {
            // Remote mail arrives in the clear at the BBS boundary.
            let sender_info = row.forwarded_to.clone().unwrap_or_else(|| "ERR".into());
            let (from, from_bbs) = match RemoteAddr::parse(&sender_info) {
                Ok(addr) => (addr.user, Some(addr.bbs)),
                Err(_) => (sender_info, None),
            };
            MailView {
                id: row.id,
                from,
                from_bbs,
                subject: "(remote mail)".to_string(),
                body: String::from_utf8_lossy(&row.body_enc).into_owned(),
                date_us: row.created_at_us,
                read: row.read_at_us.is_some(),
            }
        } else {
            let user = users::get_by_id(&conn, user_id)?;
            let user_key = self.master.open_user_key(&user.enc_key_master)?;

            let sender_name = match row.sender_user_id {
                Some(id) => users::get_by_id(&conn, id)
                    .map(|u| u.username)
                    .unwrap_or_else(|_| "ERR".to_string()),
                None => "ERR".to_string(),
            };

            let msg_secs = row.created_at_us / MICROS_PER_SEC;
            let body = self
                .try_decrypt(&row.body_enc, &user_key, &sender_name, msg_secs)
                .ok_or(MailError::DecryptionFailed)?;
            let subject = row
                .subject_enc
                .as_deref()
                .and_then(|enc| self.try_decrypt(enc, &user_key, &sender_name, msg_secs))
                .unwrap_or_else(|| "(no subject)".to_string());

            MailView {
                id: row.id,
                from: sender_name,
                from_bbs: None,
                subject,
                body,
                date_us: row.created_at_us,
                read: row.read_at_us.is_some(),
            }
        };

        messages::mark_read(&conn, row.id, self.clock.now_us())?;
        Ok(view)
    }

    /// Decrypt with the AAD candidates in order: none (legacy/external),
    /// the creation second with ±2 s of drift, then a bounded backward
    /// search for rows whose metadata predates the AAD rule.
    fn try_decrypt(
        &self,
        ciphertext: &[u8],
        key: &[u8; 32],
        sender_name: &str,
        msg_secs: i64,
    ) -> Option<String> {
        if let Ok(pt) = envelope::open_str(key, ciphertext, &[]) {
            return Some(pt);
        }

        for offset in -2..=2 {
            let aad = mail_aad(sender_name, msg_secs + offset);
            if let Ok(pt) = envelope::open_str(key, ciphertext, &aad) {
                return Some(pt);
            }
        }

        let now_secs = self.clock.now_us() / MICROS_PER_SEC;
        for offset in 0..self.config.legacy_aad_window_secs {
            let aad = mail_aad(sender_name, now_secs - offset);
            if let Ok(pt) = envelope::open_str(key, ciphertext, &aad) {
                return Some(pt);
            }
        }

        None
    }

    /// Mailbox listing, headers only.
    pub fn list_mail(
        &self,
        user_id: i64,
        unread_only: bool,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<MailSummary>> {
        let conn = self.db.lock();
        let rows = messages::user_mail(&conn, user_id, unread_only, limit, offset)?;

        let user_key = users::get_by_id(&conn, user_id)
            .ok()
            .and_then(|user| self.master.open_user_key(&user.enc_key_master).ok());

        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            let (from, subject) = if row.msg_type == MessageType::System {
                (
                    "SYSTEM".to_string(),
                    row.subject_enc
                        .as_deref()
                        .map(|s| String::from_utf8_lossy(s).into_owned()),
                )
            } else if row.is_remote_inbound() {
                let sender_info = row.forwarded_to.clone().unwrap_or_else(|| "ERR".into());
                let display = match RemoteAddr::parse(&sender_info) {
                    Ok(addr) => {
                        let bbs: String = addr.bbs.chars().take(4).collect();
                        format!("{}@{bbs}", addr.user)
                    }
                    Err(_) => sender_info,
                };
                (display, None)
            } else {
                let sender_name = match row.sender_user_id {
                    Some(id) => users::get_by_id(&conn, id)
                        .map(|u| u.username)
                        .unwrap_or_else(|_| "ERR".to_string()),
                    None => "ERR".to_string(),
                };
                let subject = match (&row.subject_enc, &user_key) {
                    (Some(enc), Some(key)) => self.try_decrypt(
                        enc,
                        key,
                        &sender_name,
                        row.created_at_us / MICROS_PER_SEC,
                    ),
                    _ => None,
                };
                (sender_name, subject)
            };

            result.push(MailSummary {
                id: row.id,
                from,
                subject,
                date_us: row.created_at_us,
                new: row.read_at_us.is_none(),
            });
        }
        Ok(result)
    }

    /// Delete a mail the user sent or received.
    pub fn delete_mail(&self, user_id: i64, message_id: i64) -> Result<()> {
        let conn = self.db.lock();
        let row = messages::get_by_id(&conn, message_id)
            .map_err(|_| MailError::MessageNotFound)?;

        if row.recipient_user_id != Some(user_id) && row.sender_user_id != Some(user_id) {
            return Err(MailError::NotYours);
        }
        messages::delete(&conn, row.id)?;
        Ok(())
    }

    /// Inbox counters.
    pub fn get_inbox_summary(&self, user_id: i64) -> Result<InboxSummary> {
        let conn = self.db.lock();
        Ok(InboxSummary {
            unread: messages::count_unread(&conn, user_id)?,
            total: messages::count_mail(&conn, user_id)?,
        })
    }

    /// Sent-remote-mail status view.
    pub fn sent_remote_mail(
        &self,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<messages::SentRemoteRow>> {
        let conn = self.db.lock();
        let user = users::get_by_id(&conn, user_id)?;
        Ok(messages::sent_remote(&conn, &user.username, limit)?)
    }

    pub(crate) fn transit_request(
        &self,
        row: &messages::MessageRow,
    ) -> Option<RemoteMailRequest> {
        let forwarded = row.forwarded_to.as_deref()?;
        let transit = TransitAddr::parse(forwarded).ok()?;
        let body = String::from_utf8_lossy(&row.body_enc).into_owned();
        Some(RemoteMailRequest {
            mail_uuid: row.uuid.clone(),
            sender_user_id: row.sender_user_id,
            sender: transit.sender,
            recipient: transit.recipient,
            body,
        })
    }
}
