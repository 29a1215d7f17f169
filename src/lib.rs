//! # gramtun
//!
//! An IP tunnel that carries packets over a text-messaging transport.
//! A local TUN device captures outbound packets, encodes them as text
//! payloads and sends them as chat messages; messages received from the
//! configured peer are decoded and written back into the TUN device.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Command Loop (app)                   │
//! │        (start/stop, pause, history cleanup)          │
//! ├─────────────────────────────────────────────────────┤
//! │                  Engine (engine)                     │
//! │   (capture, receive, batch flush, telemetry loops)   │
//! ├─────────────────────────────────────────────────────┤
//! │          Codec + Cache (codec, cache)                │
//! │     (text framing, packet batching under limits)     │
//! ├─────────────────────────────────────────────────────┤
//! │       Dispatcher + Session (dispatch, session)       │
//! │    (query correlation, authorization state gate)     │
//! ├─────────────────────────────────────────────────────┤
//! │                 Backend (backend)                    │
//! │        (messaging bridge connection, mocks)          │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod app;
pub mod backend;
pub mod cache;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod session;
pub mod stats;
pub mod tun;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Largest encoded payload the messaging service accepts in one message
pub const MESSAGE_MAX_SIZE: usize = 4096;

/// Extra capture-buffer room beyond the MTU for IP header variance
pub const PACKET_HEADER_SLACK: usize = 60;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
///
/// Codec, backend and dispatch failures stay local to their modules;
/// only I/O and configuration problems cross the crate boundary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}
