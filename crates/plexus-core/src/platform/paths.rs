//! Where the broker socket lives.

use crate::config::IpcConfig;
use std::path::PathBuf;

/// Directory for the broker socket.
///
/// # Platform Behavior
/// - **Linux**: `$XDG_RUNTIME_DIR`, else the system temp dir
/// - **macOS**: the per-user temp dir (`$TMPDIR`)
pub fn socket_dir() -> PathBuf {
    dirs::runtime_dir().unwrap_or_else(std::env::temp_dir)
}

/// Default socket path: `{socket_dir}/plexus.sock`.
pub fn default_socket_path() -> PathBuf {
    socket_dir().join(IpcConfig::SOCKET_FILE_NAME)
}
