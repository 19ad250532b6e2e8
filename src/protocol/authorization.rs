//! Authorization packet bodies.

use num_enum::TryFromPrimitive;

use super::{arg_count, put_u16, read_args, u16_len, u8_len};
use super::{authentication, AuthenticationMethod, Deserialize, Reader, Serialize};
use crate::error::Error;

/// The server's status in an authorization response.
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive)]
pub enum Status {
    /// The request is authorized; response arguments are added to the
    /// request arguments.
    PassAdd = 0x01,

    /// The request is authorized; response arguments replace the request
    /// arguments.
    PassRepl = 0x02,

    /// The request is denied.
    Fail = 0x10,

    /// The server encountered an error processing the request.
    Error = 0x11,

    /// Forward the request to the alternative daemon named in the message.
    /// Transported but never acted on by this crate.
    Follow = 0x21,
}

/// An authorization request packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// How the user authenticated.
    pub authen_method: AuthenticationMethod,

    /// Privilege level of the user.
    pub priv_lvl: u8,

    /// The authentication type used.
    pub authen_type: authentication::Type,

    /// The service requesting authorization.
    pub authen_service: authentication::Service,

    /// The user requesting authorization.
    pub user: String,

    /// The client port the user is connected on.
    pub port: String,

    /// The remote address the user is connecting from.
    pub rem_addr: String,

    /// Authorization arguments as `name=value` / `name*value` strings.
    pub args: Vec<String>,
}

impl Serialize for Request {
    fn serialize_into_buffer(&self, buffer: &mut Vec<u8>) -> Result<(), Error> {
        let user_len = u8_len(self.user.len(), "user")?;
        let port_len = u8_len(self.port.len(), "port")?;
        let rem_addr_len = u8_len(self.rem_addr.len(), "rem_addr")?;
        let args = arg_count(&self.args)?;

        buffer.extend_from_slice(&[
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

/// An authorization response packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// The response status.
    pub status: Status,

    /// Arguments returned by the server.
    pub args: Vec<String>,

    /// A message to present to the user.
    pub server_msg: String,

    /// An administrative log message.
    pub data: String,
}

impl Serialize for Response {
    fn serialize_into_buffer(&self, buffer: &mut Vec<u8>) -> Result<(), Error> {
        let args = arg_count(&self.args)?;
        let server_msg_len = u16_len(self.server_msg.len(), "server_msg")?;
        let data_len = u16_len(self.data.len(), "data")?;

        buffer.extend_from_slice(&[self.status as u8, args]);
        put_u16(buffer, server_msg_len);
        put_u16(buffer, data_len);
        for arg in &self.args {
            buffer.push(arg.len() as u8);
        }
        buffer.extend_from_slice(self.server_msg.as_bytes());
        buffer.extend_from_slice(self.data.as_bytes());
        for arg in &self.args {
            buffer.extend_from_slice(arg.as_bytes());
        }

        Ok(())
    }
}

impl Deserialize for Response {
    fn deserialize_from_buffer(buffer: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(buffer);

        let status = Status::try_from(reader.byte()?).map_err(|_| Error::BadPacket)?;
        let args = usize::from(reader.byte()?);
        let server_msg_len = usize::from(reader.u16()?);
        let data_len = usize::from(reader.u16()?);

        let arg_lengths = reader.bytes(args)?;
        let server_msg = reader.string(server_msg_len)?;
        let data = reader.string(data_len)?;

        Ok(Self {
            status,
            args: read_args(&mut reader, &arg_lengths)?,
            server_msg,
            data,
        })
    }
}
