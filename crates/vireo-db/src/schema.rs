//! SQL schema definitions.

/// Complete schema for the v1 database.
pub const SCHEMA_V1: &str = r#"
-- ============================================================
-- Users & Nodes
-- ============================================================

CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    password_hash BLOB NOT NULL,
    salt BLOB NOT NULL,
    enc_key_password BLOB NOT NULL,
    enc_key_master BLOB NOT NULL,
    is_admin INTEGER NOT NULL DEFAULT 0,
    is_banned INTEGER NOT NULL DEFAULT 0,
    ban_reason TEXT,
    created_at_us INTEGER NOT NULL,
    last_seen_us INTEGER
);

CREATE TABLE IF NOT EXISTS nodes (
    id INTEGER PRIMARY KEY,
    node_id TEXT NOT NULL UNIQUE,
    short_name TEXT,
    long_name TEXT,
    first_seen_us INTEGER NOT NULL,
    last_seen_us INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS user_nodes (
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    node_id INTEGER NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
    is_primary INTEGER NOT NULL DEFAULT 0,
    linked_at_us INTEGER NOT NULL,
    PRIMARY KEY (user_id, node_id)
);

-- ============================================================
-- Boards & Messages
-- ============================================================

CREATE TABLE IF NOT EXISTS boards (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    description TEXT,
    restricted INTEGER NOT NULL DEFAULT 0,
    sync_enabled INTEGER NOT NULL DEFAULT 0,
    created_at_us INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY,
    uuid TEXT NOT NULL UNIQUE,
    msg_type TEXT NOT NULL,
    board_id INTEGER REFERENCES boards(id) ON DELETE CASCADE,
    sender_user_id INTEGER REFERENCES users(id) ON DELETE SET NULL,
    sender_node_id INTEGER REFERENCES nodes(id) ON DELETE SET NULL,
    recipient_user_id INTEGER REFERENCES users(id) ON DELETE CASCADE,
    recipient_node_id INTEGER REFERENCES nodes(id) ON DELETE SET NULL,
    subject_enc BLOB,
    body_enc BLOB NOT NULL,
    created_at_us INTEGER NOT NULL,
    delivered_at_us INTEGER,
    read_at_us INTEGER,
    expires_at_us INTEGER,
    origin_bbs TEXT,
    delivery_attempts INTEGER NOT NULL DEFAULT 0,
    last_attempt_us INTEGER,
    forwarded_to TEXT,
    hop_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_messages_type_created ON messages(msg_type, created_at_us);
CREATE INDEX IF NOT EXISTS idx_messages_recipient ON messages(recipient_user_id);
CREATE INDEX IF NOT EXISTS idx_messages_board ON messages(board_id);
CREATE INDEX IF NOT EXISTS idx_messages_expires ON messages(expires_at_us);

-- ============================================================
-- Federation peers & learned routes
-- ============================================================

CREATE TABLE IF NOT EXISTS bbs_peers (
    id INTEGER PRIMARY KEY,
    node_id TEXT NOT NULL UNIQUE,
    callsign TEXT,
    name TEXT,
    protocol TEXT NOT NULL DEFAULT 'advbbs',
    sync_enabled INTEGER NOT NULL DEFAULT 1,
    capabilities TEXT,
    last_sync_us INTEGER NOT NULL DEFAULT 0,
    last_board_sync_us INTEGER NOT NULL DEFAULT 0,
    health_status TEXT NOT NULL DEFAULT 'unknown',
    failed_heartbeats INTEGER NOT NULL DEFAULT 0,
    last_pong_us INTEGER,
    quality_score REAL NOT NULL DEFAULT 1.0,
    first_seen_us INTEGER NOT NULL,
    last_seen_us INTEGER
);

CREATE TABLE IF NOT EXISTS rap_routes (
    id INTEGER PRIMARY KEY,
    dest_bbs TEXT NOT NULL,
    via_peer_id INTEGER NOT NULL REFERENCES bbs_peers(id) ON DELETE CASCADE,
    hop_count INTEGER NOT NULL,
    quality_score REAL NOT NULL DEFAULT 1.0,
    last_updated_us INTEGER NOT NULL,
    expires_at_us INTEGER NOT NULL,
    UNIQUE (dest_bbs, via_peer_id)
);

CREATE INDEX IF NOT EXISTS idx_routes_dest ON rap_routes(dest_bbs);
CREATE INDEX IF NOT EXISTS idx_routes_expires ON rap_routes(expires_at_us);

-- ============================================================
-- Queued outbound mail & sync log
-- ============================================================

CREATE TABLE IF NOT EXISTS rap_pending_mail (
    id INTEGER PRIMARY KEY,
    mail_uuid TEXT NOT NULL UNIQUE,
    sender_user_id INTEGER,
    sender_username TEXT NOT NULL,
    sender_bbs TEXT NOT NULL,
    recipient_username TEXT NOT NULL,
    recipient_bbs TEXT NOT NULL,
    body BLOB NOT NULL,
    queued_at_us INTEGER NOT NULL,
    expires_at_us INTEGER NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_retry_us INTEGER,
    last_status TEXT
);

CREATE INDEX IF NOT EXISTS idx_pending_mail_dest ON rap_pending_mail(recipient_bbs);

CREATE TABLE IF NOT EXISTS sync_log (
    message_uuid TEXT NOT NULL,
    peer_id INTEGER NOT NULL REFERENCES bbs_peers(id) ON DELETE CASCADE,
    direction TEXT NOT NULL,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 1,
    last_attempt_us INTEGER NOT NULL,
    PRIMARY KEY (message_uuid, peer_id, direction)
);
"#;
