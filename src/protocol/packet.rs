//! Raw packet header layout and body obfuscation.

use bitflags::bitflags;
use byteorder::{ByteOrder, NetworkEndian};
use getset::CopyGetters;
use md5::{Digest, Md5};

use super::MAJOR_VERSION;
use crate::error::Error;

/// Length of the fixed packet header.
pub(crate) const HEADER_LEN: usize = 12;

/// Maximum possible packet body size (a maximal AuthorResponse).
pub(crate) const MAX_BODY_LEN: u32 = 196_356;

// Header field offsets.
pub(crate) const HDR_VERSION: usize = 0;
pub(crate) const HDR_TYPE: usize = 1;
pub(crate) const HDR_SEQ_NO: usize = 2;
pub(crate) const HDR_FLAGS: usize = 3;
pub(crate) const HDR_SESSION_ID: usize = 4;
pub(crate) const HDR_BODY_LEN: usize = 8;

/// Flags to indicate information about packets or the client/server.
#[repr(transparent)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct PacketFlags(u8);

bitflags! {
    impl PacketFlags: u8 {
        /// Requests that multiple sessions be multiplexed over a single
        /// TCP connection.
        const SINGLE_CONNECTION = 0x04;
    }
}

// Raw field accessors for routing inbound packets before their headers are
// fully validated. Callers guarantee the buffer holds at least HEADER_LEN
// bytes (the framer rejects anything shorter).

pub(crate) fn version(packet: &[u8]) -> u8 {
    packet[HDR_VERSION]
}

pub(crate) fn type_byte(packet: &[u8]) -> u8 {
    packet[HDR_TYPE]
}

pub(crate) fn seq_no(packet: &[u8]) -> u8 {
    packet[HDR_SEQ_NO]
}

pub(crate) fn flags(packet: &[u8]) -> PacketFlags {
    // the draft defines no other flag bits, peers may still set them
    PacketFlags::from_bits_truncate(packet[HDR_FLAGS])
}

pub(crate) fn session_id(packet: &[u8]) -> u32 {
    NetworkEndian::read_u32(&packet[HDR_SESSION_ID..HDR_SESSION_ID + 4])
}

pub(crate) fn body_len(packet: &[u8]) -> u32 {
    NetworkEndian::read_u32(&packet[HDR_BODY_LEN..HDR_BODY_LEN + 4])
}

/// A parsed or to-be-encoded packet header, minus the body length (which is
/// filled in from the body itself at encode time).
#[derive(Debug, PartialEq, Eq, Clone, Copy, CopyGetters)]
#[getset(get_copy = "pub(crate)")]
pub(crate) struct Header {
    /// The raw protocol version byte.
    version: u8,

    /// The raw session type byte. Kept unparsed so that replies to
    /// sessions of an unknown flavor can echo it.
    session_type: u8,

    /// The packet sequence number: odd for client packets, even for server
    /// packets.
    seq_no: u8,

    /// Header flags.
    flags: PacketFlags,

    /// ID of the session the packet belongs to.
    session_id: u32,
}

impl Header {
    pub(crate) fn new(
        version: u8,
        session_type: u8,
        seq_no: u8,
        flags: PacketFlags,
        session_id: u32,
    ) -> Self {
        Self {
            version,
            session_type,
            seq_no,
            flags,
            session_id,
        }
    }

    /// Parses a raw packet's header, rejecting unknown major versions.
    pub(crate) fn parse(packet: &[u8]) -> Result<Self, Error> {
        if packet.len() < HEADER_LEN {
            return Err(Error::BadPacket);
        }
        let version_byte = version(packet);
        if version_byte >> 4 != MAJOR_VERSION {
            return Err(Error::UnsupportedVersion(version_byte));
        }

        Ok(Self {
            version: version_byte,
            session_type: type_byte(packet),
            seq_no: seq_no(packet),
            flags: flags(packet),
            session_id: session_id(packet),
        })
    }

    /// Encodes the header into its 12-byte wire format.
    pub(crate) fn encode(&self, body_len: u32) -> [u8; HEADER_LEN] {
        let mut raw = [0; HEADER_LEN];
        raw[HDR_VERSION] = self.version;
        raw[HDR_TYPE] = self.session_type;
        raw[HDR_SEQ_NO] = self.seq_no;
        raw[HDR_FLAGS] = self.flags.bits();
        NetworkEndian::write_u32(&mut raw[HDR_SESSION_ID..HDR_SESSION_ID + 4], self.session_id);
        NetworkEndian::write_u32(&mut raw[HDR_BODY_LEN..HDR_BODY_LEN + 4], body_len);
        raw
    }
}

/// MD5 hash output size, in bytes.
const MD5_OUTPUT_LEN: usize = 16;

/// (De)obfuscates the body of a raw packet in place.
///
/// The pseudo-pad for each 16-byte block is the MD5 digest of
/// `session_id || key || version || seq_no || previous digest`, truncated
/// to the final partial block. Obfuscation is XOR against the pad, so
/// applying it twice with the same key restores the plaintext.
pub(crate) fn obfuscate_in_place(packet: &mut [u8], key: &[u8]) {
    let (header, body) = packet.split_at_mut(HEADER_LEN);

    // prehash the prefix common to every block's digest
    let mut prefix_hasher = Md5::new();
    prefix_hasher.update(&header[HDR_SESSION_ID..HDR_SESSION_ID + 4]);
    prefix_hasher.update(key);
    prefix_hasher.update([header[HDR_VERSION]]);
    prefix_hasher.update([header[HDR_SEQ_NO]]);

    let mut pad = [0; MD5_OUTPUT_LEN];
    let mut first = true;
    for chunk in body.chunks_mut(MD5_OUTPUT_LEN) {
        let mut hasher = prefix_hasher.clone();
        if !first {
            // previous pad block is appended to the prehashed prefix
            hasher.update(pad);
        }
        hasher.finalize_into((&mut pad).into());
        first = false;

        for (byte, pad_byte) in chunk.iter_mut().zip(pad.iter()) {
            *byte ^= pad_byte;
        }
    }
}
