//! A TACACS+ client that connects to a single server.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::net::TcpStream;

use crate::connection::{ConnConfig, ConnHandle, Connection, Role};
use crate::context::Context;
use crate::error::Error;
use crate::protocol::{accounting, authentication, authorization};
use crate::protocol::{truncate_to_u16, PacketType, VERSION_DEFAULT};
use crate::session::SessionHandle;

/// A (pinned, boxed) future that resolves to a dialed connection, as
/// returned from a [`DialHook`].
pub type DialFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

/// An optional hook used by a [`Client`] to open its network connections.
///
/// The hook receives the operation's [`Context`], the network (always
/// `"tcp"`) and the server address. The `Box` allows both closures and
/// function pointers; async closures can be emulated with closures
/// returning `Box::pin`ned async blocks.
pub type DialHook = Box<dyn Fn(&Context, &str, &str) -> DialFuture + Send + Sync>;

/// A TACACS+ client that sends requests to a single server address.
///
/// If the client's [`ConnConfig`] enables session multiplexing, the
/// client caches a single open connection and runs every session over it;
/// otherwise each request dials its own connection.
pub struct Client {
    addr: String,
    config: ConnConfig,
    dial_hook: Option<DialHook>,

    /// The currently cached multiplexed connection.
    cached: Arc<Mutex<Option<ConnHandle>>>,
}

impl Client {
    /// Creates a client for the given server address, dialed with the
    /// platform TCP dialer.
    pub fn new(addr: impl Into<String>, config: ConnConfig) -> Self {
        Self {
            addr: addr.into(),
            config,
            dial_hook: None,
            cached: Arc::new(Mutex::new(None)),
        }
    }

    /// Creates a client whose connections are opened by `dial_hook`.
    pub fn with_dial_hook(
        addr: impl Into<String>,
        config: ConnConfig,
        dial_hook: DialHook,
    ) -> Self {
        Self {
            addr: addr.into(),
            config,
            dial_hook: Some(dial_hook),
            cached: Arc::new(Mutex::new(None)),
        }
    }

    /// Closes the cached connection, if there is one. Outstanding
    /// sessions on it are torn down.
    pub fn close(&self) {
        let conn = lock_cache(&self.cached).clone();
        if let Some(conn) = conn {
            conn.close();
        }
    }

    async fn dial(&self, ctx: &Context) -> Result<TcpStream, Error> {
        let connect = async {
            match &self.dial_hook {
                Some(hook) => hook(ctx, "tcp", &self.addr).await.map_err(Error::from),
                None => TcpStream::connect(&self.addr).await.map_err(Error::from),
            }
        };
        ctx.run(connect).await
    }

    /// Opens a session, reusing the cached multiplexed connection when
    /// possible.
    async fn new_session(&self, ctx: &Context) -> Result<SessionHandle, Error> {
        let mux = self.config.mux || self.config.legacy_mux;
        if mux {
            let cached = lock_cache(&self.cached).clone();
            if let Some(conn) = cached {
                if let Ok(session) = conn.new_session(ctx).await {
                    return Ok(session);
                }
            }
        }

        let stream = self.dial(ctx).await?;
        let (connection, conn) = Connection::new(stream, self.config.clone(), Role::Client, None);
        tokio::spawn(connection.run());

        let session = match conn.new_session(ctx).await {
            Ok(session) => session,
            Err(err) => {
                conn.close();
                return Err(err);
            }
        };

        if mux {
            let mut cached = lock_cache(&self.cached);
            if cached.is_none() {
                *cached = Some(conn.clone());
                drop(cached);

                // clear the cached reference once the connection closes
                let cache = Arc::clone(&self.cached);
                let done = conn.shared.done.clone();
                tokio::spawn(async move {
                    done.cancelled().await;
                    *lock_cache(&cache) = None;
                });
            } else {
                drop(cached);

                // another dial raced us into the cache; close this
                // connection when its only session completes so idle
                // connections never leak
                let session_done = session.done.clone();
                tokio::spawn(async move {
                    session_done.cancelled().await;
                    conn.close();
                });
            }
        }

        Ok(session)
    }

    async fn start_session<Req, Rep>(
        &self,
        ctx: &Context,
        version: u8,
        session_type: PacketType,
        request: &Req,
    ) -> Result<(Rep, SessionHandle), Error>
    where
        Req: crate::protocol::Serialize,
        Rep: crate::protocol::Deserialize,
    {
        let mut session = self.new_session(ctx).await?;
        session.version = version;
        session.session_type = session_type as u8;

        match session.send_request(ctx, request).await {
            Ok(reply) => Ok((reply, session)),
            Err(err) => {
                session.close().await;
                Err(err)
            }
        }
    }

    /// Sends an accounting request, returning the server's reply.
    pub async fn send_acct(
        &self,
        ctx: &Context,
        request: &accounting::Request,
    ) -> Result<accounting::Reply, Error> {
        let (reply, mut session) = self
            .start_session(ctx, VERSION_DEFAULT, PacketType::Accounting, request)
            .await?;
        session.close().await;
        Ok(reply)
    }

    /// Sends an authorization request, returning the server's response.
    pub async fn send_author(
        &self,
        ctx: &Context,
        request: &authorization::Request,
    ) -> Result<authorization::Response, Error> {
        let (response, mut session) = self
            .start_session(ctx, VERSION_DEFAULT, PacketType::Authorization, request)
            .await?;
        session.close().await;
        Ok(response)
    }

    /// Sends an authentication start, returning the server's first reply
    /// and, for an interactive exchange, the session to complete it with.
    ///
    /// The session is `Some` exactly when the reply is non-final (a
    /// `GetData`/`GetUser`/`GetPass` prompt); it must then be driven to
    /// completion with [`ClientAuthenSession::send_continue`] or
    /// [`ClientAuthenSession::abort`].
    pub async fn send_authen_start(
        &self,
        ctx: &Context,
        start: &authentication::Start,
    ) -> Result<(authentication::Reply, Option<ClientAuthenSession>), Error> {
        let (reply, mut session): (authentication::Reply, _) = self
            .start_session(
                ctx,
                start.wire_version(),
                PacketType::Authentication,
                start,
            )
            .await?;

        if reply.is_final() {
            session.close().await;
            Ok((reply, None))
        } else {
            Ok((reply, Some(ClientAuthenSession { session })))
        }
    }
}

fn lock_cache(cache: &Mutex<Option<ConnHandle>>) -> MutexGuard<'_, Option<ConnHandle>> {
    cache.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An in-progress interactive authentication session.
#[derive(Debug)]
pub struct ClientAuthenSession {
    session: SessionHandle,
}

impl ClientAuthenSession {
    /// Answers the server's last prompt, returning its next reply.
    ///
    /// A final reply closes the session. A session that has exchanged too
    /// many packets for its sequence numbers is aborted with an empty
    /// reason and fails with [`Error::TooManyPackets`].
    pub async fn send_continue(
        &mut self,
        ctx: &Context,
        message: &str,
    ) -> Result<authentication::Reply, Error> {
        if self.session.seq >= 0xfe {
            let _ = self.send_abort(ctx, "").await;
            self.session.close().await;
            return Err(Error::TooManyPackets);
        }

        let packet = authentication::Continue {
            abort: false,
            message: message.to_owned(),
        };
        match self
            .session
            .send_request::<_, authentication::Reply>(ctx, &packet)
            .await
        {
            Ok(reply) => {
                if reply.is_final() {
                    self.session.close().await;
                }
                Ok(reply)
            }
            Err(err) => {
                self.session.close().await;
                Err(err)
            }
        }
    }

    /// Aborts the session, sending the reason to the server.
    pub async fn abort(&mut self, ctx: &Context, reason: &str) -> Result<(), Error> {
        let result = self.send_abort(ctx, reason).await;
        self.session.close().await;
        result
    }

    /// Closes the session without notifying the server.
    pub async fn close(&mut self) {
        self.session.close().await;
    }

    async fn send_abort(&mut self, ctx: &Context, reason: &str) -> Result<(), Error> {
        let packet = authentication::Continue {
            abort: true,
            message: truncate_to_u16(reason),
        };
        self.session.write_body(ctx, &packet).await
    }
}
