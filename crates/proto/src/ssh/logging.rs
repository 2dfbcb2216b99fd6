//! Structured logging for SSH operations
//!
//! Provides structured, contextual logging using the `tracing` framework.
//! All log messages include relevant context fields for debugging.
//!
//! # Log Levels
//!
//! - **DEBUG**: packet traffic, channel events, SFTP requests
//! - **INFO**: key exchange completion, authentication outcome
//! - **WARN**: disconnects and recoverable anomalies
//!
//! # Example
//!
//! ```no_run
//! use tern_proto::ssh::logging;
//!
//! tracing_subscriber::fmt()
//!     .with_env_filter("tern_proto::ssh=debug")
//!     .init();
//!
//! logging::log_channel_event(0, 0, "open");
//! ```

use crate::ssh::kex::Negotiated;
use tracing::{debug, info, warn};

/// Log a completed key exchange
///
/// # Arguments
///
/// * `negotiated` - Algorithms in effect from now on
/// * `session_id` - Session identifier (first exchange hash)
/// * `rekey` - Whether this exchange replaced existing keys
pub fn log_kex_complete(negotiated: &Negotiated, session_id: &[u8], rekey: bool) {
    info!(
        kex = negotiated.kex.name(),
        host_key = negotiated.host_key.name(),
        cipher_c2s = negotiated.cipher_client_to_server.name(),
        cipher_s2c = negotiated.cipher_server_to_client.name(),
        mac_c2s = negotiated.mac_client_to_server.name(),
        mac_s2c = negotiated.mac_server_to_client.name(),
        session_id = %hex::encode(&session_id[..session_id.len().min(8)]),
        rekey = rekey,
        "Key exchange completed"
    );
}

/// Log one authentication attempt and its outcome
///
/// # Arguments
///
/// * `user` - User name
/// * `method` - Method name ("password", "publickey", ...)
/// * `outcome` - "success", "failure", "partial" or "pk-ok"
pub fn log_auth_attempt(user: &str, method: &str, outcome: &str) {
    if outcome == "success" {
        info!(user = user, method = method, "Authentication succeeded");
    } else {
        debug!(
            user = user,
            method = method,
            outcome = outcome,
            "Authentication attempt"
        );
    }
}

/// Log a channel lifecycle event
pub fn log_channel_event(local_id: u32, remote_id: u32, event: &str) {
    debug!(
        channel = local_id,
        remote_channel = remote_id,
        event = event,
        "Channel event"
    );
}

/// Log an outgoing SFTP request
pub fn log_sftp_request(kind: &str, request_id: u32, path: &str) {
    debug!(
        request = kind,
        request_id = request_id,
        path = path,
        "SFTP request"
    );
}

/// Log a disconnect, sent or received
///
/// # Arguments
///
/// * `reason` - Disconnect reason code (RFC 4253 Section 11.1)
/// * `description` - Human readable text
/// * `by_peer` - Whether the server initiated it
pub fn log_disconnect(reason: u32, description: &str, by_peer: bool) {
    warn!(
        reason = reason,
        description = description,
        by_peer = by_peer,
        "SSH disconnect"
    );
}
