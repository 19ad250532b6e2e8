//! The per-connection engine: framer read/write loops and the arbiter
//! task that multiplexes sessions over one TCP connection.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::context::Context;
use crate::error::Error;
use crate::protocol::packet::{self, PacketFlags, HEADER_LEN, MAX_BODY_LEN};
use crate::protocol::{MAJOR_VERSION, VERSION_DEFAULT};
use crate::session::SessionHandle;

/// Configuration parameters for a TACACS+ connection.
///
/// Setting `mux` or `legacy_mux` allows multiplexing multiple sessions
/// over a single network connection.
///
/// `mux` allows multiplexing only if both the client and server set the
/// single-connection header flag, as described in the draft. `legacy_mux`
/// assumes both ends allow multiplexing and doesn't set the flag;
/// it overrides `mux` when both are set.
///
/// A mismatch between the client and server on the multiplex type is
/// handled gracefully where possible: a server accepts multiplexed
/// sessions even when multiplexing was never negotiated but closes the
/// connection as soon as it has no sessions, and a `legacy_mux` server
/// echoes the single-connection flag if the client sets it, which lets a
/// `mux` client multiplex to it.
///
/// Timeouts are ignored if zero.
#[derive(Debug, Clone, Default)]
pub struct ConnConfig {
    /// Allow sessions to be multiplexed over a single connection.
    pub mux: bool,

    /// Allow session multiplexing without setting the single-connection
    /// header flag.
    pub legacy_mux: bool,

    /// Shared secret key used to obfuscate packet bodies.
    pub secret: Vec<u8>,

    /// Candidate secrets tried in order when decrypting inbound sessions,
    /// for rolling key rotation. When non-empty this replaces `secret`.
    pub rotating_secrets: Vec<Vec<u8>>,

    /// Time before closing an idle multiplexed connection with no
    /// sessions.
    pub idle_timeout: Duration,

    /// Maximum time to read a packet, not counting the wait for its first
    /// byte.
    pub read_timeout: Duration,

    /// Maximum time to write a packet.
    pub write_timeout: Duration,
}

impl ConnConfig {
    pub(crate) fn secret_count(&self) -> usize {
        if self.rotating_secrets.is_empty() {
            1
        } else {
            self.rotating_secrets.len()
        }
    }

    pub(crate) fn secret_at(&self, index: usize) -> &[u8] {
        if self.rotating_secrets.is_empty() {
            &self.secret
        } else {
            &self.rotating_secrets[index]
        }
    }
}

/// Which end of the protocol this connection speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

impl Role {
    /// The parity of sequence numbers this side emits: clients send odd,
    /// servers even. Inbound packets must carry the opposite parity.
    pub(crate) fn own_parity(self) -> u8 {
        match self {
            Role::Client => 1,
            Role::Server => 0,
        }
    }
}

/// A last-error latch shared between a session or connection and its
/// owner. No I/O ever happens with the lock held.
#[derive(Debug, Default)]
pub(crate) struct ErrorSlot(Mutex<Option<Error>>);

impl ErrorSlot {
    fn lock(&self) -> MutexGuard<'_, Option<Error>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set(&self, err: Error) {
        *self.lock() = Some(err);
    }

    pub(crate) fn take(&self) -> Option<Error> {
        self.lock().take()
    }

    pub(crate) fn replace(&self, err: Error) -> Option<Error> {
        self.lock().replace(err)
    }
}

/// A request to write one raw packet, submitted to the connection's
/// dedicated writer. The writer drains requests serially, which keeps
/// packets on the wire in the order their sequence numbers were assigned.
pub(crate) struct WriteRequest {
    pub(crate) packet: Vec<u8>,
    pub(crate) deadline: Option<Instant>,
    pub(crate) ack: oneshot::Sender<Result<(), Error>>,
}

/// A request to allocate a new locally originated session.
pub(crate) struct SessionRequest {
    pub(crate) id: u32,
    pub(crate) reply: oneshot::Sender<Result<SessionHandle, Error>>,
}

/// Connection state shared with its sessions and handles.
#[derive(Debug)]
pub(crate) struct ConnShared {
    pub(crate) config: ConnConfig,
    pub(crate) role: Role,
    pub(crate) write_tx: mpsc::Sender<WriteRequest>,
    pub(crate) close_tx: mpsc::Sender<u32>,
    pub(crate) done: CancellationToken,
    pub(crate) err: ErrorSlot,
    pub(crate) local_addr: Option<SocketAddr>,
    pub(crate) peer_addr: Option<SocketAddr>,

    /// Whether the peer's first packet carried the single-connection flag.
    peer_single_connect: AtomicBool,
}

impl ConnShared {
    /// Header flags for outbound packets.
    ///
    /// A client requests draft-style multiplexing with the flag; a server
    /// echoes or asserts it on replies once the peer has requested it,
    /// covering both the negotiated and legacy multiplex modes.
    pub(crate) fn outbound_flags(&self) -> PacketFlags {
        let single = match self.role {
            Role::Client => self.config.mux && !self.config.legacy_mux,
            Role::Server => {
                self.peer_single_connect.load(Ordering::Relaxed)
                    && (self.config.mux || self.config.legacy_mux)
            }
        };
        if single {
            PacketFlags::SINGLE_CONNECTION
        } else {
            PacketFlags::empty()
        }
    }
}

/// A cloneable reference to a running connection, used to allocate
/// sessions and request shutdown.
#[derive(Clone)]
pub(crate) struct ConnHandle {
    pub(crate) shared: Arc<ConnShared>,
    session_tx: mpsc::Sender<SessionRequest>,
}

impl ConnHandle {
    /// Signals the connection to shut down.
    pub(crate) fn close(&self) {
        self.shared.done.cancel();
    }

    /// Allocates a new session with a random id, retrying on the
    /// (unlikely) id collision.
    pub(crate) async fn new_session(&self, ctx: &Context) -> Result<SessionHandle, Error> {
        loop {
            let id: u32 = rand::random();
            let (reply_tx, reply_rx) = oneshot::channel();
            let request = SessionRequest {
                id,
                reply: reply_tx,
            };

            tokio::select! {
                _ = self.shared.done.cancelled() => {
                    return Err(self.shared.err.take().unwrap_or(Error::ConnectionClosed));
                }
                err = ctx.done() => return Err(err),
                sent = self.session_tx.send(request) => {
                    if sent.is_err() {
                        return Err(self.shared.err.take().unwrap_or(Error::ConnectionClosed));
                    }
                    match reply_rx.await {
                        Ok(Err(Error::SessionIdInUse)) => continue,
                        Ok(result) => return result,
                        Err(_) => return Err(Error::ConnectionClosed),
                    }
                }
            }
        }
    }
}

/// Spawned for each session the arbiter creates from an inbound packet.
pub(crate) type SessionSpawner = Box<dyn Fn(SessionHandle) + Send + Sync>;

/// A TACACS+ network connection.
///
/// [`Connection::run`] drives the whole connection: it spawns the framer
/// read and write loops and then serves as the arbiter, multiplexing
/// inbound packets, session create requests and session close requests
/// over the session table. The table is touched only by the arbiter, so
/// it needs no lock.
pub(crate) struct Connection {
    stream: TcpStream,
    shared: Arc<ConnShared>,
    handler: Option<SessionSpawner>,
    write_rx: mpsc::Receiver<WriteRequest>,
    close_rx: mpsc::Receiver<u32>,
    session_rx: mpsc::Receiver<SessionRequest>,
}

impl Connection {
    pub(crate) fn new(
        stream: TcpStream,
        config: ConnConfig,
        role: Role,
        handler: Option<SessionSpawner>,
    ) -> (Self, ConnHandle) {
        let (write_tx, write_rx) = mpsc::channel(1);
        let (close_tx, close_rx) = mpsc::channel(16);
        let (session_tx, session_rx) = mpsc::channel(1);

        let shared = Arc::new(ConnShared {
            role,
            write_tx,
            close_tx,
            done: CancellationToken::new(),
            err: ErrorSlot::default(),
            local_addr: stream.local_addr().ok(),
            peer_addr: stream.peer_addr().ok(),
            peer_single_connect: AtomicBool::new(false),
            config,
        });

        let connection = Self {
            stream,
            shared: Arc::clone(&shared),
            handler,
            write_rx,
            close_rx,
            session_rx,
        };
        let handle = ConnHandle { shared, session_tx };

        (connection, handle)
    }

    /// Runs the connection to completion.
    pub(crate) async fn run(self) {
        let Self {
            stream,
            shared,
            handler,
            write_rx,
            mut close_rx,
            mut session_rx,
        } = self;

        let (read_half, write_half) = stream.into_split();
        let (read_tx, mut read_rx) = mpsc::channel(1);
        tokio::spawn(read_loop(read_half, read_tx, Arc::clone(&shared)));
        tokio::spawn(write_loop(write_half, write_rx, Arc::clone(&shared)));

        let mut arbiter = Arbiter {
            // for legacy_mux multiplex regardless of header flags; for
            // draft mux check the first inbound packet for the flag
            mux: shared.config.legacy_mux,
            check_mux: shared.config.mux && !shared.config.legacy_mux,
            saw_first_packet: false,
            idle_deadline: None,
            sessions: HashMap::new(),
            shared: Arc::clone(&shared),
            handler,
        };

        loop {
            tokio::select! {
                Some(raw) = read_rx.recv() => arbiter.process_packet(raw),
                Some(id) = close_rx.recv() => arbiter.close_session(id),
                Some(request) = session_rx.recv() => arbiter.new_session(request),
                _ = shared.done.cancelled() => break,
                _ = idle_wait(arbiter.idle_deadline) => break,
            }
            // close non-mux connections with no sessions
            if arbiter.sessions.is_empty() && !arbiter.mux {
                break;
            }
        }

        arbiter.cleanup();
    }
}

/// Resolves when the idle deadline passes; pends forever without one.
async fn idle_wait(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct SessionEntry {
    in_tx: mpsc::Sender<Vec<u8>>,
    done: CancellationToken,
    err: Arc<ErrorSlot>,
}

struct Arbiter {
    shared: Arc<ConnShared>,
    handler: Option<SessionSpawner>,
    sessions: HashMap<u32, SessionEntry>,
    mux: bool,
    check_mux: bool,
    saw_first_packet: bool,
    idle_deadline: Option<Instant>,
}

impl Arbiter {
    /// Routes one inbound raw packet to its session, creating the session
    /// first on the server side.
    fn process_packet(&mut self, raw: Vec<u8>) {
        if !self.saw_first_packet {
            self.saw_first_packet = true;
            let single = packet::flags(&raw).contains(PacketFlags::SINGLE_CONNECTION);
            self.shared
                .peer_single_connect
                .store(single, Ordering::Relaxed);
            // multiplex status must be decided before any further packet
            // is routed
            if self.check_mux {
                self.mux = single;
                self.check_mux = false;
            }
        }

        let id = packet::session_id(&raw);
        if !self.sessions.contains_key(&id) {
            if self.handler.is_none() {
                // client side: an unknown id is a peer protocol error
                debug!(session_id = id, "dropping packet for unknown session");
                return;
            }

            if self.sessions.is_empty() {
                if let Some(deadline) = self.idle_deadline {
                    if deadline <= Instant::now() {
                        // the idle timer has fired; let the connection close
                        self.shared.done.cancel();
                        return;
                    }
                    self.idle_deadline = None;
                }
            }

            let session = self.make_session(
                id,
                packet::version(&raw),
                packet::type_byte(&raw),
                None,
            );
            if let Some(handler) = &self.handler {
                handler(session);
            }
        }

        let overflow = match self.sessions.get(&id) {
            Some(entry) => match entry.in_tx.try_send(raw) {
                Ok(()) => None,
                Err(_) => Some(Arc::clone(&entry.err)),
            },
            None => None,
        };
        if let Some(err) = overflow {
            // a full one-slot queue means the peer broke the half-duplex
            // sequence discipline
            self.close_session(id);
            err.set(Error::PacketQueueFull);
        }
    }

    /// Serves a client request to allocate a new session.
    fn new_session(&mut self, request: SessionRequest) {
        let result = if !self.mux && !self.sessions.is_empty() {
            Err(Error::MuxNotSupported)
        } else if self.sessions.contains_key(&request.id) {
            Err(Error::SessionIdInUse)
        } else if self.sessions.is_empty()
            && self
                .idle_deadline
                .is_some_and(|deadline| deadline <= Instant::now())
        {
            // the idle timer fired before this request arrived
            Err(Error::ConnectionClosed)
        } else {
            self.idle_deadline = None;
            Ok(self.make_session(request.id, VERSION_DEFAULT, 0, Some(0)))
        };
        let _ = request.reply.send(result);
    }

    fn make_session(
        &mut self,
        id: u32,
        version: u8,
        session_type: u8,
        secret_index: Option<usize>,
    ) -> SessionHandle {
        let (in_tx, in_rx) = mpsc::channel(1);
        let done = CancellationToken::new();
        let err = Arc::new(ErrorSlot::default());

        self.sessions.insert(
            id,
            SessionEntry {
                in_tx,
                done: done.clone(),
                err: Arc::clone(&err),
            },
        );

        SessionHandle::new(
            id,
            version,
            session_type,
            secret_index,
            in_rx,
            done,
            err,
            Arc::clone(&self.shared),
        )
    }

    fn close_session(&mut self, id: u32) {
        let Some(entry) = self.sessions.remove(&id) else {
            // session already closed
            return;
        };
        entry.err.set(Error::SessionClosed);
        entry.done.cancel();
        // dropping the entry closes the session's inbound channel

        if self.sessions.is_empty() && self.mux && !self.shared.config.idle_timeout.is_zero() {
            self.idle_deadline = Some(Instant::now() + self.shared.config.idle_timeout);
        }
    }

    fn cleanup(&mut self) {
        // connection done is signalled before the per-session signals
        self.shared.done.cancel();
        for (_, entry) in self.sessions.drain() {
            entry.done.cancel();
        }
    }
}

/// Reads raw packets off the socket and feeds them to the arbiter.
async fn read_loop(
    mut read_half: OwnedReadHalf,
    read_tx: mpsc::Sender<Vec<u8>>,
    shared: Arc<ConnShared>,
) {
    loop {
        let raw = tokio::select! {
            _ = shared.done.cancelled() => return,
            result = read_packet(&mut read_half, &shared.config) => match result {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    // clean EOF between packets
                    shared.done.cancel();
                    return;
                }
                Err(err) => {
                    if !shared.done.is_cancelled() {
                        shared.err.set(err);
                        shared.done.cancel();
                    }
                    return;
                }
            },
        };

        tokio::select! {
            _ = shared.done.cancelled() => return,
            sent = read_tx.send(raw) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

/// Reads one raw packet, or `None` on a clean EOF before any of it
/// arrived.
async fn read_packet(
    stream: &mut OwnedReadHalf,
    config: &ConnConfig,
) -> Result<Option<Vec<u8>>, Error> {
    let mut header = [0; HEADER_LEN];

    // wait for the first byte with no deadline; once a packet has begun,
    // the rest of it must arrive within the read timeout
    if stream.read(&mut header[..1]).await? == 0 {
        return Ok(None);
    }
    let deadline =
        (!config.read_timeout.is_zero()).then(|| Instant::now() + config.read_timeout);
    read_exact_by(stream, &mut header[1..], deadline).await?;

    let version = header[packet::HDR_VERSION];
    if version >> 4 != MAJOR_VERSION {
        return Err(Error::UnsupportedVersion(version));
    }

    let body_len = packet::body_len(&header);
    if body_len > MAX_BODY_LEN {
        return Err(Error::BadPacket);
    }

    let mut raw = vec![0; HEADER_LEN + body_len as usize];
    raw[..HEADER_LEN].copy_from_slice(&header);
    if body_len > 0 {
        read_exact_by(stream, &mut raw[HEADER_LEN..], deadline).await?;
    }
    Ok(Some(raw))
}

async fn read_exact_by(
    stream: &mut OwnedReadHalf,
    buf: &mut [u8],
    deadline: Option<Instant>,
) -> Result<(), Error> {
    let result = match deadline {
        Some(deadline) => timeout_at(deadline, stream.read_exact(buf))
            .await
            .map_err(|_| Error::DeadlineExceeded)?,
        None => stream.read_exact(buf).await,
    };

    match result {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Err(Error::UnexpectedEof),
        Err(err) => Err(err.into()),
    }
}

/// Drains write requests serially, applying the tighter of the caller's
/// deadline and the configured write timeout. Any write error closes the
/// connection: a partial write would poison the sequence discipline of
/// every session sharing it.
async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut write_rx: mpsc::Receiver<WriteRequest>,
    shared: Arc<ConnShared>,
) {
    loop {
        let request = tokio::select! {
            _ = shared.done.cancelled() => return,
            received = write_rx.recv() => match received {
                Some(request) => request,
                None => return,
            },
        };

        let mut deadline = request.deadline;
        if !shared.config.write_timeout.is_zero() {
            let cap = Instant::now() + shared.config.write_timeout;
            deadline = Some(match deadline {
                Some(existing) if existing < cap => existing,
                _ => cap,
            });
        }

        let result = write_all_by(&mut write_half, &request.packet, deadline).await;
        let failed = result.is_err();
        let _ = request.ack.send(result);
        if failed {
            shared.done.cancel();
            return;
        }
    }
}

async fn write_all_by(
    stream: &mut OwnedWriteHalf,
    packet: &[u8],
    deadline: Option<Instant>,
) -> Result<(), Error> {
    let write = async {
        stream.write_all(packet).await?;
        stream.flush().await
    };

    match deadline {
        Some(deadline) => timeout_at(deadline, write)
            .await
            .map_err(|_| Error::DeadlineExceeded)?
            .map_err(Error::from),
        None => write.await.map_err(Error::from),
    }
}
