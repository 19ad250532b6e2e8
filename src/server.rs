//! Serving TACACS+ requests: per-session dispatch, the interactive
//! server session, and a listener accept loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::connection::{ConnConfig, Connection, Role, SessionSpawner};
use crate::context::Context;
use crate::error::Error;
use crate::protocol::{accounting, authentication, authorization};
use crate::protocol::{truncate_to_u16, Deserialize, PacketType, Serialize, VERSION_DEFAULT};
use crate::session::SessionHandle;

/// Processes the three types of TACACS+ requests on behalf of a server.
///
/// Each handler receives a decoded request and returns the reply to send
/// back, or `None` to close the session with no reply. The supplied
/// [`ServerSession`] exposes the peer's addresses and, for
/// authentication, the interactive prompts; its [`ServerSession::context`]
/// is cancelled when the session or connection closes.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Processes an authentication start. Interactive exchanges can
    /// prompt the user through `session` before returning the final
    /// reply.
    async fn handle_authen_start(
        &self,
        start: authentication::Start,
        session: &mut ServerSession,
    ) -> Option<authentication::Reply>;

    /// Processes an authorization request.
    async fn handle_author_request(
        &self,
        request: authorization::Request,
        session: &mut ServerSession,
    ) -> Option<authorization::Response>;

    /// Processes an accounting request.
    async fn handle_acct_request(
        &self,
        request: accounting::Request,
        session: &mut ServerSession,
    ) -> Option<accounting::Reply>;
}

/// Serves TACACS+ requests on network connections.
pub struct ServerConnHandler<H> {
    /// The request handler sessions are dispatched to.
    pub handler: Arc<H>,

    /// The connection configuration.
    pub config: ConnConfig,
}

impl<H> Clone for ServerConnHandler<H> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            config: self.config.clone(),
        }
    }
}

impl<H: RequestHandler> ServerConnHandler<H> {
    /// Creates a connection handler dispatching to `handler`.
    pub fn new(handler: H, config: ConnConfig) -> Self {
        Self {
            handler: Arc::new(handler),
            config,
        }
    }

    /// Processes incoming TACACS+ sessions on `stream` until the
    /// connection closes.
    pub async fn serve(&self, stream: TcpStream) {
        let spawner: SessionSpawner = {
            let handler = Arc::clone(&self.handler);
            Box::new(move |session| {
                let handler = Arc::clone(&handler);
                tokio::spawn(serve_session(handler, session));
            })
        };

        let (connection, _) = Connection::new(stream, self.config.clone(), Role::Server, Some(spawner));
        connection.run().await;
    }
}

async fn serve_session<H: RequestHandler>(handler: Arc<H>, session: SessionHandle) {
    let session_type = session.session_type;
    let mut session = ServerSession { inner: session };

    let result = match PacketType::try_from(session_type) {
        Ok(PacketType::Authentication) => serve_authen_session(&*handler, &mut session).await,
        Ok(PacketType::Authorization) => serve_author_session(&*handler, &mut session).await,
        Ok(PacketType::Accounting) => serve_acct_session(&*handler, &mut session).await,
        Err(err) => serve_unknown_session(&mut session, err.into()).await,
    };
    if let Err(err) = result {
        warn!(error = %err, "server session failed");
    }

    session.close().await;
}

async fn serve_authen_session<H: RequestHandler>(
    handler: &H,
    session: &mut ServerSession,
) -> Result<(), Error> {
    let ctx = session.context();

    let start = match session.read_request::<authentication::Start>(&ctx).await {
        Ok(start) if session.inner.version != start.wire_version() => {
            Err(Error::UnsupportedVersion(session.inner.version))
        }
        other => other,
    };
    let start = match start {
        Ok(start) => start,
        Err(err) => {
            let reply = authentication::Reply {
                status: authentication::Status::Error,
                no_echo: false,
                server_msg: truncate_to_u16(&err.to_string()),
                data: Vec::new(),
            };
            let _ = session.write_reply(&ctx, &reply).await;
            return Err(err);
        }
    };

    if let Some(reply) = handler.handle_authen_start(start, session).await {
        session.write_reply(&ctx, &reply).await?;
    }
    Ok(())
}

async fn serve_author_session<H: RequestHandler>(
    handler: &H,
    session: &mut ServerSession,
) -> Result<(), Error> {
    let ctx = session.context();

    let request = match session.read_request::<authorization::Request>(&ctx).await {
        Ok(request) if session.inner.version != VERSION_DEFAULT => {
            Err(Error::UnsupportedVersion(session.inner.version))
        }
        other => other,
    };
    let request = match request {
        Ok(request) => request,
        Err(err) => {
            let response = authorization::Response {
                status: authorization::Status::Error,
                args: Vec::new(),
                server_msg: truncate_to_u16(&err.to_string()),
                data: String::new(),
            };
            let _ = session.write_reply(&ctx, &response).await;
            return Err(err);
        }
    };

    if let Some(response) = handler.handle_author_request(request, session).await {
        session.write_reply(&ctx, &response).await?;
    }
    Ok(())
}

async fn serve_acct_session<H: RequestHandler>(
    handler: &H,
    session: &mut ServerSession,
) -> Result<(), Error> {
    let ctx = session.context();

    let request = match session.read_request::<accounting::Request>(&ctx).await {
        Ok(request) if session.inner.version != VERSION_DEFAULT => {
            Err(Error::UnsupportedVersion(session.inner.version))
        }
        other => other,
    };
    let request = match request {
        Ok(request) => request,
        Err(err) => {
            let reply = accounting::Reply {
                status: accounting::Status::Error,
                server_msg: truncate_to_u16(&err.to_string()),
                data: String::new(),
            };
            let _ = session.write_reply(&ctx, &reply).await;
            return Err(err);
        }
    };

    if let Some(reply) = handler.handle_acct_request(request, session).await {
        session.write_reply(&ctx, &reply).await?;
    }
    Ok(())
}

/// A session of an unknown flavor is drained and answered with an empty
/// reply so the peer is not left waiting.
async fn serve_unknown_session(session: &mut ServerSession, err: Error) -> Result<(), Error> {
    let ctx = session.context();
    session.inner.read_packet(&ctx).await?;
    let _ = session.inner.write_packet(&ctx, &[]).await;
    Err(err)
}

/// A server-side TACACS+ session, handed to [`RequestHandler`] methods.
pub struct ServerSession {
    inner: SessionHandle,
}

impl ServerSession {
    /// A context cancelled when this session or its connection closes.
    pub fn context(&self) -> Context {
        Context::with_cancellation(self.inner.done.clone())
    }

    /// The address of the connection's peer.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr()
    }

    /// The local address of the connection.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }

    /// Emits a diagnostic message attributed to this session.
    pub fn log(&self, message: &str) {
        info!(session_id = self.inner.id, message, "server session");
    }

    /// Prompts the TACACS+ client for data with the given message. If
    /// `no_echo` is set the client will not echo the user's response as
    /// it is entered.
    pub async fn get_data(
        &mut self,
        ctx: &Context,
        message: &str,
        no_echo: bool,
    ) -> Result<authentication::Continue, Error> {
        self.prompt(ctx, authentication::Status::GetData, message, no_echo)
            .await
    }

    /// Prompts the TACACS+ client for a username with the given message.
    pub async fn get_user(
        &mut self,
        ctx: &Context,
        message: &str,
    ) -> Result<authentication::Continue, Error> {
        self.prompt(ctx, authentication::Status::GetUser, message, false)
            .await
    }

    /// Prompts the TACACS+ client for a password with the given message.
    pub async fn get_pass(
        &mut self,
        ctx: &Context,
        message: &str,
    ) -> Result<authentication::Continue, Error> {
        self.prompt(ctx, authentication::Status::GetPass, message, true)
            .await
    }

    /// Sends a prompt reply and awaits the client's continue.
    ///
    /// An aborting continue closes the session before being returned, so
    /// handlers observing `abort` should return `None`. Errors other than
    /// closure and cancellation are reported to the client as an error
    /// reply before the session closes.
    async fn prompt(
        &mut self,
        ctx: &Context,
        status: authentication::Status,
        message: &str,
        no_echo: bool,
    ) -> Result<authentication::Continue, Error> {
        let reply = authentication::Reply {
            status,
            no_echo,
            server_msg: message.to_owned(),
            data: Vec::new(),
        };
        self.write_reply(ctx, &reply).await?;

        match self.read_request::<authentication::Continue>(ctx).await {
            Ok(answer) => {
                if answer.abort {
                    self.close().await;
                }
                Ok(answer)
            }
            Err(err) => {
                match err {
                    Error::SessionClosed | Error::Cancelled | Error::DeadlineExceeded => {}
                    _ => {
                        let reply = authentication::Reply {
                            status: authentication::Status::Error,
                            no_echo: false,
                            server_msg: truncate_to_u16(&err.to_string()),
                            data: Vec::new(),
                        };
                        let _ = self.write_reply(ctx, &reply).await;
                    }
                }
                self.close().await;
                Err(err)
            }
        }
    }

    async fn read_request<T: Deserialize>(&mut self, ctx: &Context) -> Result<T, Error> {
        self.inner.read_body(ctx).await
    }

    async fn write_reply<T: Serialize>(&mut self, ctx: &Context, reply: &T) -> Result<(), Error> {
        self.inner.write_body(ctx, reply).await
    }

    async fn close(&mut self) {
        self.inner.close().await;
    }
}

/// A generic accept loop serving TACACS+ connections.
pub struct Server<H> {
    handler: ServerConnHandler<H>,
}

impl<H: RequestHandler> Server<H> {
    /// Creates a server dispatching connections to `handler`.
    pub fn new(handler: ServerConnHandler<H>) -> Self {
        Self { handler }
    }

    /// Accepts connections on `listener`, serving each on its own task.
    ///
    /// Transient accept errors are retried with exponential backoff
    /// (5ms doubling up to 1s); anything else is returned.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        let mut delay = Duration::ZERO;
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    delay = Duration::ZERO;
                    let handler = self.handler.clone();
                    tokio::spawn(async move { handler.serve(stream).await });
                }
                Err(err) if is_transient_accept_error(&err) => {
                    delay = if delay.is_zero() {
                        Duration::from_millis(5)
                    } else {
                        (delay * 2).min(Duration::from_secs(1))
                    };
                    warn!(error = %err, ?delay, "accept failed, retrying");
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::{self, Header, PacketFlags, HEADER_LEN};
    use crate::protocol::{PacketType, VERSION_DEFAULT};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const SECRET: &[u8] = b"test secret";

    struct NullHandler;

    #[async_trait]
    impl RequestHandler for NullHandler {
        async fn handle_authen_start(
            &self,
            _start: authentication::Start,
            _session: &mut ServerSession,
        ) -> Option<authentication::Reply> {
            None
        }

        async fn handle_author_request(
            &self,
            _request: authorization::Request,
            _session: &mut ServerSession,
        ) -> Option<authorization::Response> {
            None
        }

        async fn handle_acct_request(
            &self,
            _request: accounting::Request,
            _session: &mut ServerSession,
        ) -> Option<accounting::Reply> {
            None
        }
    }

    /// Serves a null handler on a loopback connection and returns the raw
    /// client side of it.
    async fn serve_raw_pair() -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let config = ConnConfig {
                secret: SECRET.to_vec(),
                ..ConnConfig::default()
            };
            ServerConnHandler::new(NullHandler, config).serve(stream).await;
        });
        TcpStream::connect(addr).await.unwrap()
    }

    fn raw_packet(session_type: u8, seq_no: u8, session_id: u32, body: &[u8]) -> Vec<u8> {
        let header = Header::new(
            VERSION_DEFAULT,
            session_type,
            seq_no,
            PacketFlags::empty(),
            session_id,
        );
        let mut raw = header.encode(body.len() as u32).to_vec();
        raw.extend_from_slice(body);
        packet::obfuscate_in_place(&mut raw, SECRET);
        raw
    }

    async fn read_raw(stream: &mut TcpStream) -> Vec<u8> {
        let mut header = [0; HEADER_LEN];
        stream.read_exact(&mut header).await.unwrap();
        let body_len = packet::body_len(&header) as usize;
        let mut raw = header.to_vec();
        raw.resize(HEADER_LEN + body_len, 0);
        stream.read_exact(&mut raw[HEADER_LEN..]).await.unwrap();
        packet::obfuscate_in_place(&mut raw, SECRET);
        raw
    }

    #[tokio::test]
    async fn stale_first_packet_yields_error_reply() {
        let mut stream = serve_raw_pair().await;

        let start = authentication::Start {
            action: authentication::Action::Login,
            priv_lvl: 1,
            authen_type: authentication::Type::Ascii,
            authen_service: authentication::Service::Login,
            user: "u".to_owned(),
            port: "tty0".to_owned(),
            rem_addr: "1.2.3.4".to_owned(),
            data: Vec::new(),
        };
        let mut body = Vec::new();
        start.serialize_into_buffer(&mut body).unwrap();

        // a first packet with sequence number 5 looks like a leftover
        // from a timed-out session
        let raw = raw_packet(PacketType::Authentication as u8, 5, 42, &body);
        stream.write_all(&raw).await.unwrap();

        let reply_raw = read_raw(&mut stream).await;
        assert_eq!(packet::seq_no(&reply_raw), 1);
        let reply =
            authentication::Reply::deserialize_from_buffer(&reply_raw[HEADER_LEN..]).unwrap();
        assert_eq!(reply.status, authentication::Status::Error);
        assert_eq!(reply.server_msg, Error::SessionNotFound.to_string());
    }

    #[tokio::test]
    async fn unsupported_major_version_closes_connection() {
        let mut stream = serve_raw_pair().await;

        let mut raw = raw_packet(PacketType::Accounting as u8, 1, 7, &[0; 8]);
        raw[0] = 0x30;
        stream.write_all(&raw).await.unwrap();

        let mut buf = [0; 1];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_session_type_gets_empty_reply() {
        let mut stream = serve_raw_pair().await;

        let raw = raw_packet(9, 1, 99, &[1, 2, 3]);
        stream.write_all(&raw).await.unwrap();

        let reply_raw = read_raw(&mut stream).await;
        assert_eq!(packet::type_byte(&reply_raw), 9);
        assert_eq!(packet::seq_no(&reply_raw), 2);
        assert_eq!(reply_raw.len(), HEADER_LEN);
    }
}
