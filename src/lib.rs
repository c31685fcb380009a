//! Minimal multi-client chat relay over TCP.
//!
//! Clients register a display name, optionally join a named channel, and
//! broadcast text lines to every peer currently sharing that channel. Each
//! module focuses on a concrete responsibility:
//!
//! - [`cli`] parses the command-line interface for server and client modes.
//! - [`message`] defines the wire protocol: a tagged JSON payload behind a
//!   2-byte big-endian length prefix, plus async read/write helpers.
//! - [`registry`] tracks live connections and their channel membership.
//! - [`server`] accepts TCP connections and routes chat lines to the
//!   sender's channel peers.
//! - [`client`] connects to a relay, multiplexing stdin and server frames
//!   for a terminal user.
//!
//! Integration and unit tests use this crate directly to exercise the
//! routing state machine and wire protocol.

pub mod cli;
pub mod client;
pub mod message;
pub mod registry;
pub mod server;
