//! Authentication packet bodies: start, reply, and continue.

use num_enum::{TryFromPrimitive, TryFromPrimitiveError};

use super::{put_u16, u16_len, u8_len, Deserialize, Reader, Serialize};
use super::{VERSION_DEFAULT, VERSION_MINOR_ONE};
use crate::error::Error;

const REPLY_FLAG_NO_ECHO: u8 = 0x1;
const CONTINUE_FLAG_ABORT: u8 = 0x1;

/// The action requested by an authentication start packet.
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive)]
pub enum Action {
    /// Log a user in.
    Login = 0x01,

    /// Change the user's password.
    ChangePassword = 0x02,

    /// Send an unobfuscated password for verification (deprecated by the draft).
    SendPass = 0x03,

    /// Send authentication data for outbound verification.
    SendAuth = 0x04,
}

/// The type of authentication performed in a session.
#[repr(u8)]
#[allow(missing_docs)]
#[derive(Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive)]
pub enum Type {
    NotSet = 0x00,
    Ascii = 0x01,
    Pap = 0x02,
    Chap = 0x03,
    Arap = 0x04,
    MsChap = 0x05,
}

/// The service requesting authentication.
#[repr(u8)]
#[allow(missing_docs)]
#[derive(Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive)]
pub enum Service {
    None = 0x00,
    Login = 0x01,
    Enable = 0x02,
    Ppp = 0x03,
    Arap = 0x04,
    Pt = 0x05,
    Rcmd = 0x06,
    X25 = 0x07,
    Nasi = 0x08,
    FwProxy = 0x09,
}

/// The server's status in an authentication reply.
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive)]
pub enum Status {
    /// Authentication succeeded.
    Pass = 0x01,

    /// Authentication failed.
    Fail = 0x02,

    /// The client should prompt the user for the data described in the
    /// server message.
    GetData = 0x03,

    /// The client should prompt the user for a username.
    GetUser = 0x04,

    /// The client should prompt the user for a password.
    GetPass = 0x05,

    /// The client should restart the session from a fresh start packet.
    Restart = 0x06,

    /// The server encountered an error; the message holds the reason.
    Error = 0x07,

    /// The client should contact the alternative server named in the
    /// message. Transported but never acted on by this crate.
    Follow = 0x21,
}

impl From<TryFromPrimitiveError<Status>> for Error {
    fn from(_: TryFromPrimitiveError<Status>) -> Self {
        Error::BadPacket
    }
}

/// An authentication start packet, the first packet of every
/// authentication session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Start {
    /// The authentication action to perform.
    pub action: Action,

    /// Privilege level the user is authenticating at.
    pub priv_lvl: u8,

    /// The authentication type in use.
    pub authen_type: Type,

    /// The requesting service.
    pub authen_service: Service,

    /// The user being authenticated, possibly empty for interactive logins.
    pub user: String,

    /// The client port the user is connected on.
    pub port: String,

    /// The remote address the user is connecting from.
    pub rem_addr: String,

    /// Method-specific authentication data (e.g. the PAP password or CHAP
    /// challenge/response).
    pub data: Vec<u8>,
}

impl Start {
    /// The protocol version byte this start packet must be carried under.
    ///
    /// Outbound PAP/CHAP/ARAP/MSCHAP logins and PAP/CHAP/MSCHAP send-auth
    /// exchanges use minor version one; everything else the default.
    pub(crate) fn wire_version(&self) -> u8 {
        match (self.action, self.authen_type) {
            (Action::Login, Type::Pap | Type::Chap | Type::Arap | Type::MsChap) => {
                VERSION_MINOR_ONE
            }
            (Action::SendAuth, Type::Pap | Type::Chap | Type::MsChap) => VERSION_MINOR_ONE,
            _ => VERSION_DEFAULT,
        }
    }
}

impl Serialize for Start {
    fn serialize_into_buffer(&self, buffer: &mut Vec<u8>) -> Result<(), Error> {
        let user_len = u8_len(self.user.len(), "user")?;
        let port_len = u8_len(self.port.len(), "port")?;
        let rem_addr_len = u8_len(self.rem_addr.len(), "rem_addr")?;
        let data_len = u8_len(self.data.len(), "data")?;

        buffer.extend_from_slice(&[
            self.action as u8,
            self.priv_lvl,
            self.authen_type as u8,
            self.authen_service as u8,
            user_len,
            port_len,
            rem_addr_len,
            data_len,
        ]);
        buffer.extend_from_slice(self.user.as_bytes());
        buffer.extend_from_slice(self.port.as_bytes());
        buffer.extend_from_slice(self.rem_addr.as_bytes());
        buffer.extend_from_slice(&self.data);

        Ok(())
    }
}

impl Deserialize for Start {
    fn deserialize_from_buffer(buffer: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(buffer);

        let action = Action::try_from(reader.byte()?).map_err(|_| Error::BadPacket)?;
        let priv_lvl = reader.byte()?;
        let authen_type = Type::try_from(reader.byte()?).map_err(|_| Error::BadPacket)?;
        let authen_service = Service::try_from(reader.byte()?).map_err(|_| Error::BadPacket)?;
        let user_len = usize::from(reader.byte()?);
        let port_len = usize::from(reader.byte()?);
        let rem_addr_len = usize::from(reader.byte()?);
        let data_len = usize::from(reader.byte()?);

        Ok(Self {
            action,
            priv_lvl,
            authen_type,
            authen_service,
            user: reader.string(user_len)?,
            port: reader.string(port_len)?,
            rem_addr: reader.string(rem_addr_len)?,
            data: reader.bytes(data_len)?,
        })
    }
}

/// An authentication reply packet sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// The reply status.
    pub status: Status,

    /// Whether the client must suppress echoing of the user's response.
    pub no_echo: bool,

    /// A message to present to the user.
    pub server_msg: String,

    /// Method-specific reply data.
    pub data: Vec<u8>,
}

impl Reply {
    /// Whether this reply ends the session.
    ///
    /// The `GetData`/`GetUser`/`GetPass` statuses expect a further continue
    /// packet from the client; every other status is terminal.
    pub fn is_final(&self) -> bool {
        !matches!(self.status, Status::GetData | Status::GetUser | Status::GetPass)
    }
}

impl Serialize for Reply {
    fn serialize_into_buffer(&self, buffer: &mut Vec<u8>) -> Result<(), Error> {
        let server_msg_len = u16_len(self.server_msg.len(), "server_msg")?;
        let data_len = u16_len(self.data.len(), "data")?;

        let flags = if self.no_echo { REPLY_FLAG_NO_ECHO } else { 0 };
        buffer.extend_from_slice(&[self.status as u8, flags]);
        put_u16(buffer, server_msg_len);
        put_u16(buffer, data_len);
        buffer.extend_from_slice(self.server_msg.as_bytes());
        buffer.extend_from_slice(&self.data);

        Ok(())
    }
}

impl Deserialize for Reply {
    fn deserialize_from_buffer(buffer: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(buffer);

        let status = Status::try_from(reader.byte()?)?;
        let no_echo = reader.byte()? & REPLY_FLAG_NO_ECHO != 0;
        let server_msg_len = usize::from(reader.u16()?);
        let data_len = usize::from(reader.u16()?);

        Ok(Self {
            status,
            no_echo,
            server_msg: reader.string(server_msg_len)?,
            data: reader.bytes(data_len)?,
        })
    }
}

/// An authentication continue packet, the client's answer to a non-final
/// reply.
///
/// On the wire the packet carries both a `user_msg` and a `data` field; an
/// aborting continue transports its reason in `data` while a normal one
/// carries the user's response in `user_msg`. [`Continue::message`] holds
/// whichever field is meaningful so callers never have to know about the
/// placement quirk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Continue {
    /// Whether the client is aborting the session.
    pub abort: bool,

    /// The user's response, or the abort reason when [`abort`](Self::abort)
    /// is set.
    pub message: String,
}

impl Serialize for Continue {
    fn serialize_into_buffer(&self, buffer: &mut Vec<u8>) -> Result<(), Error> {
        let message_len = u16_len(self.message.len(), "message")?;

        if self.abort {
            put_u16(buffer, 0);
            put_u16(buffer, message_len);
        } else {
            put_u16(buffer, message_len);
            put_u16(buffer, 0);
        }
        buffer.push(if self.abort { CONTINUE_FLAG_ABORT } else { 0 });
        buffer.extend_from_slice(self.message.as_bytes());

        Ok(())
    }
}

impl Deserialize for Continue {
    fn deserialize_from_buffer(buffer: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(buffer);

        let user_msg_len = usize::from(reader.u16()?);
        let data_len = usize::from(reader.u16()?);
        let abort = reader.byte()? & CONTINUE_FLAG_ABORT != 0;

        let user_msg = reader.string(user_msg_len)?;
        let data = reader.string(data_len)?;

        Ok(Self {
            abort,
            message: if abort { data } else { user_msg },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<T>(packet: &T) -> T
    where
        T: Serialize + Deserialize,
    {
        let mut buffer = Vec::new();
        packet
            .serialize_into_buffer(&mut buffer)
            .expect("serialization should succeed");
        T::deserialize_from_buffer(&buffer).expect("deserialization should succeed")
    }

    #[test]
    fn start_round_trip() {
        let start = Start {
            action: Action::SendAuth,
            priv_lvl: 23,
            authen_type: Type::Arap,
            authen_service: Service::X25,
            user: "fred".to_owned(),
            port: "tty00".to_owned(),
            rem_addr: "10.1.2.3".to_owned(),
            data: vec![0, 1, 2, 3, 0, 1],
        };

        assert_eq!(round_trip(&start), start);
    }

    #[test]
    fn start_version_depends_on_action_and_type() {
        let mut start = Start {
            action: Action::Login,
            priv_lvl: 1,
            authen_type: Type::Pap,
            authen_service: Service::Login,
            user: String::new(),
            port: String::new(),
            rem_addr: String::new(),
            data: Vec::new(),
        };
        assert_eq!(start.wire_version(), VERSION_MINOR_ONE);

        start.authen_type = Type::Ascii;
        assert_eq!(start.wire_version(), VERSION_DEFAULT);

        start.action = Action::SendAuth;
        start.authen_type = Type::Arap;
        assert_eq!(start.wire_version(), VERSION_DEFAULT);

        start.authen_type = Type::MsChap;
        assert_eq!(start.wire_version(), VERSION_MINOR_ONE);
    }

    #[test]
    fn start_oversized_field_fails() {
        let start = Start {
            action: Action::Login,
            priv_lvl: 1,
            authen_type: Type::Ascii,
            authen_service: Service::Login,
            user: "u".repeat(256),
            port: String::new(),
            rem_addr: String::new(),
            data: Vec::new(),
        };

        let err = start.serialize_into_buffer(&mut Vec::new()).unwrap_err();
        assert!(matches!(err, Error::FieldTooLarge("user")));
    }

    #[test]
    fn reply_round_trip() {
        let reply = Reply {
            status: Status::Follow,
            no_echo: true,
            server_msg: "nothing here".to_owned(),
            data: vec![9, 8, 7, 6],
        };

        assert_eq!(round_trip(&reply), reply);
    }

    #[test]
    fn reply_terminal_statuses() {
        let mut reply = Reply {
            status: Status::Pass,
            no_echo: false,
            server_msg: String::new(),
            data: Vec::new(),
        };
        assert!(reply.is_final());

        for status in [Status::GetData, Status::GetUser, Status::GetPass] {
            reply.status = status;
            assert!(!reply.is_final());
        }

        reply.status = Status::Follow;
        assert!(reply.is_final());
    }

    #[test]
    fn reply_truncated_fails() {
        let reply = Reply {
            status: Status::Pass,
            no_echo: false,
            server_msg: "welcome".to_owned(),
            data: Vec::new(),
        };

        let mut buffer = Vec::new();
        reply.serialize_into_buffer(&mut buffer).unwrap();
        buffer.truncate(buffer.len() - 2);

        assert!(matches!(
            Reply::deserialize_from_buffer(&buffer),
            Err(Error::BadPacket)
        ));
    }

    #[test]
    fn continue_round_trips_both_flavors() {
        let normal = Continue {
            abort: false,
            message: "message one".to_owned(),
        };
        assert_eq!(round_trip(&normal), normal);

        let aborted = Continue {
            abort: true,
            message: "message two".to_owned(),
        };
        assert_eq!(round_trip(&aborted), aborted);
    }

    #[test]
    fn continue_abort_reason_travels_in_data_field() {
        let aborted = Continue {
            abort: true,
            message: "why".to_owned(),
        };

        let mut buffer = Vec::new();
        aborted.serialize_into_buffer(&mut buffer).unwrap();

        // user_msg_len 0, data_len 3, abort flag, then the reason bytes
        assert_eq!(buffer, [0, 0, 0, 3, CONTINUE_FLAG_ABORT, b'w', b'h', b'y']);
    }
}
