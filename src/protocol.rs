//! TACACS+ protocol packet <-> binary format conversions.
//!
//! Packet bodies are modeled as owned structs with one module per session
//! flavor ([`authentication`], [`authorization`], [`accounting`]). The raw
//! header layout and body obfuscation live in [`packet`](self::packet).

use num_enum::{TryFromPrimitive, TryFromPrimitiveError};

use crate::error::Error;

pub mod accounting;
pub mod authentication;
pub mod authorization;

pub(crate) mod packet;
pub use packet::PacketFlags;

/// The protocol major version, occupying the upper nibble of the version byte.
pub const MAJOR_VERSION: u8 = 0xc;

/// The default protocol version byte (minor version zero).
pub const VERSION_DEFAULT: u8 = MAJOR_VERSION << 4;

/// The default protocol version with minor version one, required by some
/// CHAP/PAP/ARAP/MSCHAP authentication start packets.
pub const VERSION_MINOR_ONE: u8 = MAJOR_VERSION << 4 | 0x1;

/// The type of a protocol packet, which doubles as the session type.
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, TryFromPrimitive)]
pub enum PacketType {
    /// Authentication packet.
    Authentication = 0x1,

    /// Authorization packet.
    Authorization = 0x2,

    /// Accounting packet.
    Accounting = 0x3,
}

#[doc(hidden)]
impl From<TryFromPrimitiveError<PacketType>> for Error {
    fn from(value: TryFromPrimitiveError<PacketType>) -> Self {
        Self::InvalidSessionType(value.number)
    }
}

/// The method used to authenticate, as reported in authorization and
/// accounting requests.
#[repr(u8)]
#[allow(missing_docs)]
#[derive(Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive)]
pub enum AuthenticationMethod {
    NotSet = 0x00,
    None = 0x01,
    Krb5 = 0x02,
    Line = 0x03,
    Enable = 0x04,
    Local = 0x05,
    TacacsPlus = 0x06,
    Guest = 0x08,
    Radius = 0x10,
    Krb4 = 0x11,
    Rcmd = 0x20,
}

/// Something that can be serialized into its binary packet-body format.
///
/// Serialization appends to the provided buffer so that callers can reserve
/// the packet header up front.
pub(crate) trait Serialize {
    fn serialize_into_buffer(&self, buffer: &mut Vec<u8>) -> Result<(), Error>;
}

/// Something that can be deserialized from a raw packet body.
pub(crate) trait Deserialize: Sized {
    fn deserialize_from_buffer(buffer: &[u8]) -> Result<Self, Error>;
}

/// A consuming view over a raw packet body.
///
/// Every accessor validates the remaining length, so parsers can consume
/// fields in wire order and surface a uniform [`Error::BadPacket`] on any
/// under-run. Accessors that return owned values copy out of the buffer:
/// the backing packet allocation is reused and must not leak into
/// user-retained fields.
pub(crate) struct Reader<'raw> {
    buf: &'raw [u8],
}

impl<'raw> Reader<'raw> {
    pub(crate) fn new(buf: &'raw [u8]) -> Self {
        Self { buf }
    }

    pub(crate) fn byte(&mut self) -> Result<u8, Error> {
        let (&first, rest) = self.buf.split_first().ok_or(Error::BadPacket)?;
        self.buf = rest;
        Ok(first)
    }

    pub(crate) fn u16(&mut self) -> Result<u16, Error> {
        let raw = self.take(2)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    pub(crate) fn take(&mut self, count: usize) -> Result<&'raw [u8], Error> {
        if self.buf.len() < count {
            return Err(Error::BadPacket);
        }
        let (taken, rest) = self.buf.split_at(count);
        self.buf = rest;
        Ok(taken)
    }

    pub(crate) fn bytes(&mut self, count: usize) -> Result<Vec<u8>, Error> {
        self.take(count).map(<[u8]>::to_vec)
    }

    pub(crate) fn string(&mut self, count: usize) -> Result<String, Error> {
        String::from_utf8(self.bytes(count)?).map_err(|_| Error::BadPacket)
    }
}

/// Validates that a field fits in a u8 length prefix.
pub(crate) fn u8_len(len: usize, field: &'static str) -> Result<u8, Error> {
    u8::try_from(len).map_err(|_| Error::FieldTooLarge(field))
}

/// Validates that a field fits in a u16 length prefix.
pub(crate) fn u16_len(len: usize, field: &'static str) -> Result<u16, Error> {
    u16::try_from(len).map_err(|_| Error::FieldTooLarge(field))
}

pub(crate) fn put_u16(buffer: &mut Vec<u8>, value: u16) {
    buffer.extend_from_slice(&value.to_be_bytes());
}

/// Validates an argument list against the wire limits shared by the
/// authorization and accounting encodings: at most 255 arguments of at most
/// 255 bytes each.
pub(crate) fn arg_count(args: &[String]) -> Result<u8, Error> {
    let count = u8::try_from(args.len()).map_err(|_| Error::TooManyArgs)?;
    for arg in args {
        if arg.len() > usize::from(u8::MAX) {
            return Err(Error::ArgTooLong);
        }
    }
    Ok(count)
}

/// Truncates a message to the longest prefix that fits a u16 length
/// field without splitting a UTF-8 sequence.
pub(crate) fn truncate_to_u16(text: &str) -> String {
    let max = usize::from(u16::MAX);
    if text.len() <= max {
        return text.to_owned();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_owned()
}

/// Consumes the argument values recorded by a run of per-argument length
/// bytes. The lengths sit before the user fields on the wire, so callers
/// read them first and hand them over once the fixed fields are consumed.
pub(crate) fn read_args(reader: &mut Reader<'_>, lengths: &[u8]) -> Result<Vec<String>, Error> {
    lengths
        .iter()
        .map(|&len| reader.string(usize::from(len)))
        .collect()
}
