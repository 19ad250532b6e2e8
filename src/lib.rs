//! # tacplus
//!
//! Client and server implementation of the TACACS+ protocol
//! ([draft-grant-tacacs-02](https://datatracker.ietf.org/doc/html/draft-grant-tacacs-02)):
//! the binary wire codec, the MD5-keyed body obfuscation, and a
//! connection engine that can multiplex concurrent sessions over a
//! single TCP connection in both directions.
//!
//! A [`Client`] exposes the three request flavors ([`Client::send_acct`],
//! [`Client::send_author`], [`Client::send_authen_start`]); a
//! [`ServerConnHandler`] dispatches inbound sessions to a
//! [`RequestHandler`]. Both ends share the same [`ConnConfig`] and
//! session machinery.

#![warn(missing_docs)]
#![warn(clippy::cast_lossless)]
#![warn(clippy::cast_possible_truncation)]

pub mod protocol;

mod client;
pub use client::{Client, ClientAuthenSession, DialFuture, DialHook};

mod connection;
pub use connection::ConnConfig;

mod context;
pub use context::Context;

mod error;
pub use error::Error;

mod server;
pub use server::{RequestHandler, Server, ServerConnHandler, ServerSession};

mod session;
