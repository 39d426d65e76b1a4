//! TLS interception front-end
//!
//! Peeks the ClientHello off an accepted connection without consuming
//! bytes, extracts the SNI, mints a leaf through the certificate store
//! and completes the server-side handshake. Connections that do not look
//! like TLS fall through to the plain-HTTP path with the peeked bytes
//! replayed.

pub mod adapter;
pub mod peek;
pub mod rewind;

pub use adapter::{AcceptedStream, AdapterError};
pub use peek::{parse_client_hello, PeekError, Sniff};
pub use rewind::Rewind;
