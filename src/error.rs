//! Error types surfaced by the client and server halves of the crate.

use std::io;

use thiserror::Error;

/// An error raised by a TACACS+ exchange.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// A packet was truncated, over-long, or failed to decode. This is
    /// also how a mismatched shared secret surfaces: the deobfuscated
    /// body is garbage and no longer parses.
    #[error("bad secret or packet")]
    BadPacket,

    /// A packet field exceeded the length encodeable in its length prefix.
    #[error("{0} field too large")]
    FieldTooLarge(&'static str),

    /// More than 255 arguments were supplied for a request or response.
    #[error("too many args")]
    TooManyArgs,

    /// An argument exceeded 255 bytes.
    #[error("arg too long")]
    ArgTooLong,

    /// A packet carried an unsupported major version, or a minor version
    /// that does not match the shape of the request it carries.
    #[error("unsupported version {0:#04x}")]
    UnsupportedVersion(u8),

    /// A packet's type byte does not name a known session flavor.
    #[error("invalid session type {0}")]
    InvalidSessionType(u8),

    /// A peer packet arrived with a sequence number other than the
    /// expected one, or with the wrong parity for its direction.
    #[error("invalid sequence number")]
    InvalidSeqNo,

    /// The first packet of a session carried an unexpected sequence
    /// number; it is probably left over from a peer that timed out.
    #[error("session not found or timed out")]
    SessionNotFound,

    /// A freshly generated session id collided with a live session.
    /// Allocation retries this transparently.
    #[error("session id in use")]
    SessionIdInUse,

    /// The session has been torn down.
    #[error("session closed")]
    SessionClosed,

    /// The connection has been torn down.
    #[error("connection closed")]
    ConnectionClosed,

    /// A second session was requested on a connection that did not
    /// negotiate multiplexing.
    #[error("session multiplexing not supported")]
    MuxNotSupported,

    /// A session's one-slot inbound queue overflowed, which means the
    /// peer violated the half-duplex sequence discipline.
    #[error("packet queue full")]
    PacketQueueFull,

    /// The peer closed the connection in the middle of a packet.
    #[error("unexpected EOF")]
    UnexpectedEof,

    /// The session's sequence number reached its terminal value and no
    /// further packets may be sent.
    #[error("sequence number overflow")]
    SeqNoOverflow,

    /// An interactive authentication session exchanged too many continue
    /// packets and was aborted.
    #[error("session aborted, too many packets")]
    TooManyPackets,

    /// The caller's cancellation token fired.
    #[error("operation canceled")]
    Cancelled,

    /// The caller's deadline, or a configured read/write timeout, expired.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// An I/O error on the underlying connection.
    #[error(transparent)]
    Io(#[from] io::Error),
}
