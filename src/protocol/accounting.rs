//! Accounting packet bodies.

use bitflags::bitflags;
use num_enum::TryFromPrimitive;

use super::{arg_count, put_u16, read_args, u16_len, u8_len};
use super::{authentication, AuthenticationMethod, Deserialize, Reader, Serialize};
use crate::error::Error;

/// Record flags for an accounting request.
#[repr(transparent)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Flags(u8);

bitflags! {
    impl Flags: u8 {
        /// More records for this task follow.
        const MORE = 0x1;

        /// Start of a task.
        const START = 0x2;

        /// Task complete.
        const STOP = 0x4;

        /// Update on a long-running task.
        const WATCHDOG = 0x8;
    }
}

/// The server's status in an accounting reply.
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive)]
pub enum Status {
    /// The record was logged.
    Success = 0x01,

    /// Something went wrong logging the record.
    Error = 0x02,

    /// Forward the record to the alternative daemon named in the message.
    /// Transported but never acted on by this crate.
    Follow = 0x21,
}

/// An accounting request packet.
///
/// Identical to an authorization request on the wire apart from the
/// leading record flags byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// What kind of accounting record this is.
    pub flags: Flags,

    /// How the user authenticated.
    pub authen_method: AuthenticationMethod,

    /// Privilege level of the user.
    pub priv_lvl: u8,

    /// The authentication type used.
    pub authen_type: authentication::Type,

    /// The service the record belongs to.
    pub authen_service: authentication::Service,

    /// The user the record belongs to.
    pub user: String,

    /// The client port the user is connected on.
    pub port: String,

    /// The remote address the user is connecting from.
    pub rem_addr: String,

    /// Accounting arguments as `name=value` strings.
    pub args: Vec<String>,
}

impl Serialize for Request {
    fn serialize_into_buffer(&self, buffer: &mut Vec<u8>) -> Result<(), Error> {
        let user_len = u8_len(self.user.len(), "user")?;
        let port_len = u8_len(self.port.len(), "port")?;
        let rem_addr_len = u8_len(self.rem_addr.len(), "rem_addr")?;
        let args = arg_count(&self.args)?;

        buffer.extend_from_slice(&[
            self.flags.bits(),
            self.authen_method as u8,
            self.priv_lvl,
            self.authen_type as u8,
            self.authen_service as u8,
            user_len,
            port_len,
            rem_addr_len,
            args,
        ]);
        for arg in &self.args {
            buffer.push(arg.len() as u8);
        }
        buffer.extend_from_slice(self.user.as_bytes());
        buffer.extend_from_slice(self.port.as_bytes());
        buffer.extend_from_slice(self.rem_addr.as_bytes());
        for arg in &self.args {
            buffer.extend_from_slice(arg.as_bytes());
        }

        Ok(())
    }
}

impl Deserialize for Request {
    fn deserialize_from_buffer(buffer: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(buffer);

        let flags = Flags::from_bits_truncate(reader.byte()?);
        let authen_method =
            AuthenticationMethod::try_from(reader.byte()?).map_err(|_| Error::BadPacket)?;
        let priv_lvl = reader.byte()?;
        let authen_type =
            authentication::Type::try_from(reader.byte()?).map_err(|_| Error::BadPacket)?;
        let authen_service =
            authentication::Service::try_from(reader.byte()?).map_err(|_| Error::BadPacket)?;
        let user_len = usize::from(reader.byte()?);
        let port_len = usize::from(reader.byte()?);
        let rem_addr_len = usize::from(reader.byte()?);
        let args = usize::from(reader.byte()?);

        let arg_lengths = reader.bytes(args)?;
        let user = reader.string(user_len)?;
        let port = reader.string(port_len)?;
        let rem_addr = reader.string(rem_addr_len)?;

        Ok(Self {
            flags,
            authen_method,
            priv_lvl,
            authen_type,
            authen_service,
            user,
            port,
            rem_addr,
            args: read_args(&mut reader, &arg_lengths)?,
        })
    }
}

/// An accounting reply packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// The reply status.
    pub status: Status,

    /// A message to present to the user.
    pub server_msg: String,

    /// An administrative log message.
    pub data: String,
}

impl Serialize for Reply {
    fn serialize_into_buffer(&self, buffer: &mut Vec<u8>) -> Result<(), Error> {
        let server_msg_len = u16_len(self.server_msg.len(), "server_msg")?;
        let data_len = u16_len(self.data.len(), "data")?;

        // the status byte follows the length fields, unlike every other
        // reply body; the ordering is part of the wire format
        put_u16(buffer, server_msg_len);
        put_u16(buffer, data_len);
        buffer.push(self.status as u8);
        buffer.extend_from_slice(self.server_msg.as_bytes());
        buffer.extend_from_slice(self.data.as_bytes());

        Ok(())
    }
}

impl Deserialize for Reply {
    fn deserialize_from_buffer(buffer: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(buffer);

        let server_msg_len = usize::from(reader.u16()?);
        let data_len = usize::from(reader.u16()?);
        let status = Status::try_from(reader.byte()?).map_err(|_| Error::BadPacket)?;

        Ok(Self {
            status,
            server_msg: reader.string(server_msg_len)?,
            data: reader.string(data_len)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let request = Request {
            flags: Flags::MORE,
            authen_method: AuthenticationMethod::Enable,
            priv_lvl: 15,
            authen_type: authentication::Type::Chap,
            authen_service: authentication::Service::Pt,
            user: "joe".to_owned(),
            port: "port23".to_owned(),
            rem_addr: "192.168.1.1".to_owned(),
            args: vec!["a=b".to_owned(), "c=d".to_owned()],
        };

        let mut buffer = Vec::new();
        request.serialize_into_buffer(&mut buffer).unwrap();
        assert_eq!(Request::deserialize_from_buffer(&buffer).unwrap(), request);
    }

    #[test]
    fn reply_round_trip() {
        let reply = Reply {
            status: Status::Success,
            server_msg: "user log message".to_owned(),
            data: "admin log message".to_owned(),
        };

        let mut buffer = Vec::new();
        reply.serialize_into_buffer(&mut buffer).unwrap();
        assert_eq!(Reply::deserialize_from_buffer(&buffer).unwrap(), reply);
    }

    #[test]
    fn reply_status_follows_lengths_on_the_wire() {
        let reply = Reply {
            status: Status::Error,
            server_msg: "m".to_owned(),
            data: "dd".to_owned(),
        };

        let mut buffer = Vec::new();
        reply.serialize_into_buffer(&mut buffer).unwrap();

        assert_eq!(buffer, [0, 1, 0, 2, Status::Error as u8, b'm', b'd', b'd']);
    }

    #[test]
    fn reply_too_short_fails() {
        assert!(matches!(
            Reply::deserialize_from_buffer(&[0, 0, 0, 0]),
            Err(Error::BadPacket)
        ));
    }
}
