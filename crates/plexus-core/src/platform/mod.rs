//! Platform abstraction layer.
//!
//! # Supported Platforms
//!
//! - **Linux**: Full support
//! - **macOS**: Full support
//! - **Windows**: Not supported (Unix domain sockets only)

pub mod paths;

pub use paths::{default_socket_path, socket_dir};
