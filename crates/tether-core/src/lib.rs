//! # tether-core
//!
//! Foundation types shared by every tether crate:
//!
//! - [`protocol`]: message tags, status bytes, close codes, and frame codecs
//! - [`ids`]: connection and account identifiers, connection roles
//! - [`logging`]: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod ids;
pub mod logging;
pub mod protocol;

pub use ids::{AccountId, ConnectionId, Role};
pub use protocol::{
    AuthRequest, AuthResult, CloseCode, ConnectionStatus, FrameError, MessageType,
    auth_reply_frame, status_frame,
};
