//! Accounts: registration, authentication, bans, password rotation.
//!
//! Every account owns a random 32-byte data key stored twice: sealed to the
//! key derived from the password, and sealed under the operator master key.
//! Mail for the user is encrypted under the data key, so it stays readable
//! across a password reset (the operator reseals from the escrow copy) but
//! is never stored in cleartext.

use std::sync::Arc;

use tracing::info;

use vireo_crypto::argon2id::{self, KdfParams};
use vireo_crypto::master::{self, MasterKey};
use vireo_db::queries::{nodes, users};
use vireo_db::{Db, DbError};
use vireo_types::clock::Clock;
use vireo_types::ident;

use crate::{MailError, Result};

/// Account operations over the store.
pub struct AccountService {
    db: Db,
    master: Arc<MasterKey>,
    kdf: KdfParams,
    clock: Clock,
}

impl AccountService {
    pub fn new(db: Db, master: Arc<MasterKey>, kdf: KdfParams, clock: Clock) -> Self {
        Self {
            db,
            master,
            kdf,
            clock,
        }
    }

    /// Register a new user from a node. The node is linked as the account's
    /// primary and becomes its authentication anchor.
    pub fn register(
        &self,
        username: &str,
        password: &str,
        node_id: &str,
    ) -> Result<users::UserRow> {
        ident::validate_username(username)
            .map_err(|e| MailError::InvalidIdentifier(e.to_string()))?;

        let salt = argon2id::generate_salt();
        let verifier = argon2id::hash_password(password, &salt, &self.kdf)?;

        let user_key = master::generate_user_key();
        let password_key = argon2id::derive_key(password.as_bytes(), &salt, &self.kdf)?;
        let sealed_to_password = vireo_crypto::envelope::seal(&password_key, &user_key, &[])?;
        let sealed_to_master = self.master.seal_user_key(&user_key)?;

        let now = self.clock.now_us();
        let conn = self.db.lock();
        let user = users::create(
            &conn,
            &users::NewUser {
                username,
                password_hash: &verifier,
                salt: &salt,
                enc_key_password: &sealed_to_password,
                enc_key_master: &sealed_to_master,
            },
            now,
        )
        .map_err(|e| match e {
            DbError::UniqueViolation(_) => MailError::UsernameTaken,
            other => MailError::Db(other),
        })?;

        let node = nodes::get_or_create(&conn, node_id, now)?;
        nodes::link_user(&conn, user.id, node.id, true, now)?;

        info!("Registered user '{username}' from node {node_id}");
        Ok(user)
    }

    /// Authenticate a user logging in from a node.
    ///
    /// The node association is a weak second factor: a correct password
    /// from an unlinked node is still refused.
    pub fn login(&self, username: &str, password: &str, node_id: &str) -> Result<users::UserRow> {
        let conn = self.db.lock();
        let user = users::get_by_username(&conn, username)?
            .ok_or(MailError::InvalidCredentials)?;

        if user.is_banned {
            return Err(MailError::UserBanned);
        }

        let ok = argon2id::verify_password(password, &user.salt, &user.password_hash, &self.kdf)?;
        if !ok {
            return Err(MailError::InvalidCredentials);
        }

        let now = self.clock.now_us();
        let node = nodes::get_or_create(&conn, node_id, now)?;
        if !nodes::is_associated(&conn, user.id, node.id)? {
            return Err(MailError::NodeNotAuthorized);
        }

        users::touch_last_seen(&conn, user.id, now)?;
        Ok(user)
    }

    /// Change a password: verify the old one, unseal the data key with it,
    /// and reseal under the new password-derived key with a fresh salt.
    pub fn change_password(&self, user_id: i64, old: &str, new: &str) -> Result<()> {
        let conn = self.db.lock();
        let user = users::get_by_id(&conn, user_id)?;

        let ok = argon2id::verify_password(old, &user.salt, &user.password_hash, &self.kdf)?;
        if !ok {
            return Err(MailError::InvalidCredentials);
        }

        let old_key = argon2id::derive_key(old.as_bytes(), &user.salt, &self.kdf)?;
        let user_key = vireo_crypto::envelope::open(&old_key, &user.enc_key_password, &[])?;

        let salt = argon2id::generate_salt();
        let verifier = argon2id::hash_password(new, &salt, &self.kdf)?;
        let new_key = argon2id::derive_key(new.as_bytes(), &salt, &self.kdf)?;
        let resealed = vireo_crypto::envelope::seal(&new_key, &user_key, &[])?;

        users::update_password(&conn, user.id, &verifier, &salt, &resealed)?;
        info!("Password rotated for user id {user_id}");
        Ok(())
    }

    /// Operator password reset: recover the data key from escrow and reseal
    /// under a new password. No old password required.
    pub fn reset_password(&self, user_id: i64, new: &str) -> Result<()> {
        let conn = self.db.lock();
        let user = users::get_by_id(&conn, user_id)?;

        let user_key = self.master.open_user_key(&user.enc_key_master)?;

        let salt = argon2id::generate_salt();
        let verifier = argon2id::hash_password(new, &salt, &self.kdf)?;
        let new_key = argon2id::derive_key(new.as_bytes(), &salt, &self.kdf)?;
        let resealed = vireo_crypto::envelope::seal(&new_key, &user_key, &[])?;

        users::update_password(&conn, user.id, &verifier, &salt, &resealed)?;
        info!("Password reset via escrow for user id {user_id}");
        Ok(())
    }

    /// Ban a user. The account and its mail stay in place; only the flag
    /// and reason change, so lifting the ban restores everything.
    pub fn ban(&self, user_id: i64, reason: &str) -> Result<()> {
        let conn = self.db.lock();
        users::set_banned(&conn, user_id, true, Some(reason))?;
        info!("Banned user id {user_id}: {reason}");
        Ok(())
    }

    /// Lift a ban.
    pub fn unban(&self, user_id: i64) -> Result<()> {
        let conn = self.db.lock();
        users::set_banned(&conn, user_id, false, None)?;
        Ok(())
    }

    /// Delete a user outright, cascading every message they sent or
    /// received. Returns the number of messages removed.
    pub fn delete_user(&self, user_id: i64) -> Result<usize> {
        let conn = self.db.lock();
        let purged = users::delete_cascade(&conn, user_id)?;
        info!("Deleted user id {user_id} ({purged} messages purged)");
        Ok(purged)
    }
}
