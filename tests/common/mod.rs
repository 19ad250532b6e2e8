//! Shared fixtures: a loopback test server with a connection counter and
//! a credential-table request handler.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;

use tacplus::protocol::{accounting, authentication, authorization};
use tacplus::{Client, ConnConfig, RequestHandler, ServerConnHandler, ServerSession};

pub const SECRET: &[u8] = b"shared secret";

/// Roughly one network/scheduler quantum for timing-sensitive tests.
pub const TIME_SCALE: Duration = Duration::from_millis(40);

pub struct Account {
    pub password: &'static str,
    pub args: &'static [&'static str],
}

/// A handler backed by a static credential table. Usernames resolving to
/// `"ignore"` make every handler return `None`. An optional delay is
/// applied before each request is processed.
pub struct TableHandler {
    accounts: HashMap<&'static str, Account>,
    delay: Duration,
}

impl TableHandler {
    pub fn new(delay: Duration) -> Self {
        let mut accounts = HashMap::new();
        accounts.insert(
            "user",
            Account {
                password: "password123",
                args: &["priv-lvl=5"],
            },
        );
        accounts.insert(
            "fred",
            Account {
                password: "@password@",
                args: &["priv-lvl=1", "timeout=5"],
            },
        );
        Self { accounts, delay }
    }
}

#[async_trait]
impl RequestHandler for TableHandler {
    async fn handle_authen_start(
        &self,
        start: authentication::Start,
        session: &mut ServerSession,
    ) -> Option<authentication::Reply> {
        tokio::time::sleep(self.delay).await;
        let ctx = session.context();

        let mut user = start.user;
        while user.is_empty() {
            let answer = session.get_user(&ctx, "Username:").await.ok()?;
            if answer.abort {
                return None;
            }
            user = answer.message;
        }
        if user == "ignore" {
            return None;
        }

        let mut pass = String::new();
        while pass.is_empty() {
            let answer = session.get_pass(&ctx, "Password:").await.ok()?;
            if answer.abort {
                return None;
            }
            pass = answer.message;
        }

        let status = match self.accounts.get(user.as_str()) {
            Some(account) if account.password == pass => authentication::Status::Pass,
            _ => authentication::Status::Fail,
        };
        Some(authentication::Reply {
            status,
            no_echo: false,
            server_msg: String::new(),
            data: Vec::new(),
        })
    }

    async fn handle_author_request(
        &self,
        request: authorization::Request,
        _session: &mut ServerSession,
    ) -> Option<authorization::Response> {
        tokio::time::sleep(self.delay).await;

        if request.user == "ignore" {
            return None;
        }
        match self.accounts.get(request.user.as_str()) {
            Some(account) => Some(authorization::Response {
                status: authorization::Status::PassAdd,
                args: account.args.iter().map(|&s| s.to_owned()).collect(),
                server_msg: String::new(),
                data: String::new(),
            }),
            None => Some(authorization::Response {
                status: authorization::Status::Fail,
                args: Vec::new(),
                server_msg: String::new(),
                data: String::new(),
            }),
        }
    }

    async fn handle_acct_request(
        &self,
        request: accounting::Request,
        _session: &mut ServerSession,
    ) -> Option<accounting::Reply> {
        tokio::time::sleep(self.delay).await;

        if request.user == "ignore" {
            return None;
        }
        Some(accounting::Reply {
            status: accounting::Status::Success,
            server_msg: String::new(),
            data: String::new(),
        })
    }
}

/// A loopback server that counts accepted connections.
pub struct TestServer {
    pub addr: SocketAddr,
    conns: Arc<AtomicUsize>,
}

impl TestServer {
    pub fn conn_count(&self) -> usize {
        self.conns.load(Ordering::SeqCst)
    }
}

pub fn server_config() -> ConnConfig {
    ConnConfig {
        secret: SECRET.to_vec(),
        mux: true,
        ..ConnConfig::default()
    }
}

pub fn client_config() -> ConnConfig {
    server_config()
}

/// Routes engine diagnostics into the test harness's captured output.
/// Safe to call from every test; only the first call installs.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Starts a server with the given connection config and handler delay.
pub async fn start_server(config: ConnConfig, delay: Duration) -> TestServer {
    init_tracing();

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("binding a loopback listener should succeed");
    let addr = listener
        .local_addr()
        .expect("listener should have a local address");
    let conns = Arc::new(AtomicUsize::new(0));

    let handler = ServerConnHandler::new(TableHandler::new(delay), config);
    let counter = Arc::clone(&conns);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let handler = handler.clone();
            tokio::spawn(async move { handler.serve(stream).await });
        }
    });

    TestServer { addr, conns }
}

/// Starts a default mux server and returns it with a matching client.
pub async fn test_instance() -> (TestServer, Client) {
    let server = start_server(server_config(), Duration::ZERO).await;
    let client = Client::new(server.addr.to_string(), client_config());
    (server, client)
}

pub fn acct_request() -> accounting::Request {
    accounting::Request {
        flags: accounting::Flags::START,
        authen_method: tacplus::protocol::AuthenticationMethod::None,
        priv_lvl: 1,
        authen_type: authentication::Type::Chap,
        authen_service: authentication::Service::Ppp,
        user: "fred".to_owned(),
        port: "123".to_owned(),
        rem_addr: "1.2.3.4".to_owned(),
        args: vec![
            "variable=something".to_owned(),
            "arg2=".to_owned(),
            "arg3=abcd".to_owned(),
        ],
    }
}

pub fn author_request() -> authorization::Request {
    authorization::Request {
        authen_method: tacplus::protocol::AuthenticationMethod::Line,
        priv_lvl: 1,
        authen_type: authentication::Type::Ascii,
        authen_service: authentication::Service::Login,
        user: "user".to_owned(),
        port: "321".to_owned(),
        rem_addr: "4.3.2.1".to_owned(),
        args: vec!["variable=somethingelse".to_owned(), "arg2=123".to_owned()],
    }
}

pub fn authen_start() -> authentication::Start {
    authentication::Start {
        action: authentication::Action::Login,
        priv_lvl: 1,
        authen_type: authentication::Type::Ascii,
        authen_service: authentication::Service::Login,
        user: String::new(),
        port: "tty123".to_owned(),
        rem_addr: "1.2.3.4".to_owned(),
        data: Vec::new(),
    }
}
