//! # tether-auth
//!
//! Resolves opaque access tokens to account ids.
//!
//! - [`AuthResolver`]: the single-call contract the relay depends on
//! - [`HttpAuthResolver`]: implementation backed by the account service's
//!   `GET /oauth/token/info.json` endpoint
//!
//! Resolution never retries. A client that gets a failed reply may send a
//! new token on the same socket.

#![deny(unsafe_code)]

pub mod errors;
pub mod resolver;

pub use errors::AuthError;
pub use resolver::{AuthResolver, HttpAuthResolver};
