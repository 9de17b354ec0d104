//! `tape-service`: the tape store behind a Unix domain socket.
//!
//! One service instance per user owns the database pool and the per-tape
//! write locks, so every agent process on the machine appends through the
//! same serialization point. Clients speak newline-delimited JSON-RPC-lite
//! (see [`protocol`]) and open with a `hello` handshake.

use std::path::PathBuf;

use tape_store::TapeConfig;

pub mod engine;
pub mod ipc;
pub mod protocol;

/// Protocol version for the tape service IPC.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Default socket filename.
pub const SOCKET_FILENAME: &str = "tape.sock";

/// Get the default socket path under the user's runtime directory.
///
/// Falls back to `/tmp/tape-<username>.sock` when there is none.
pub fn default_socket_path() -> PathBuf {
    if let Some(runtime_dir) = dirs::runtime_dir() {
        runtime_dir.join(SOCKET_FILENAME)
    } else {
        let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
        PathBuf::from(format!("/tmp/tape-{user}.sock"))
    }
}

/// Socket path from `[service] socket_path`, else the default.
pub fn configured_socket_path(cfg: &TapeConfig) -> PathBuf {
    cfg.service
        .socket_path
        .as_deref()
        .map(PathBuf::from)
        .unwrap_or_else(default_socket_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_path_wins() {
        let mut cfg = TapeConfig::in_memory();
        assert_eq!(configured_socket_path(&cfg), default_socket_path());

        cfg.service.socket_path = Some("/run/custom/tape.sock".to_string());
        assert_eq!(
            configured_socket_path(&cfg),
            PathBuf::from("/run/custom/tape.sock")
        );
    }

    #[test]
    fn default_path_ends_with_socket_name() {
        let path = default_socket_path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        assert!(name.starts_with("tape"), "{}", path.display());
        assert!(name.ends_with(".sock"), "{}", path.display());
    }
}
