//! Centralized configuration for Plexus.
//!
//! Limits and timeouts shared by connections and the broker.

use std::time::Duration;

/// Wire and session limits.
pub struct IpcConfig;

impl IpcConfig {
    /// Largest frame payload accepted by the codec.
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    /// Connections the broker accepts concurrently before refusing new ones.
    pub const MAX_CONNECTIONS: usize = 256;
    /// Bound on nested call chains (A calls B calls A ...).
    pub const MAX_CALL_DEPTH: u32 = 32;
    pub const SOCKET_FILE_NAME: &'static str = "plexus.sock";
}

/// Handler priorities. Higher values are tried first.
pub struct PriorityConfig;

impl PriorityConfig {
    pub const DEFAULT: u16 = 100;
}
