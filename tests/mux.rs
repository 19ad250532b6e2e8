use std::time::Duration;

use tacplus::{Client, ConnConfig, Context, Error};
use tokio::time::{sleep, Instant};

mod common;

use common::{acct_request, authen_start, author_request, start_server, SECRET, TIME_SCALE};

async fn run_mux_case(client_mux: bool, server_mux: bool) {
    let mut server_config = common::server_config();
    server_config.mux = server_mux;
    let server = start_server(server_config, Duration::ZERO).await;

    let mut client_config = common::client_config();
    client_config.mux = client_mux;
    let client = Client::new(server.addr.to_string(), client_config);
    let ctx = Context::background();

    client
        .send_acct(&ctx, &acct_request())
        .await
        .expect("accounting request should succeed");

    let (_, session) = client
        .send_authen_start(&ctx, &authen_start())
        .await
        .expect("authentication start should succeed");
    let mut session = session.expect("interactive session expected");

    client
        .send_author(&ctx, &author_request())
        .await
        .expect("authorization request should succeed");

    session
        .abort(&ctx, "aborted")
        .await
        .expect("abort should succeed");

    let expected = if client_mux && server_mux { 1 } else { 3 };
    assert_eq!(
        server.conn_count(),
        expected,
        "client_mux={client_mux} server_mux={server_mux}"
    );
    client.close();
}

#[tokio::test]
async fn connection_mux_matrix() {
    run_mux_case(false, false).await;
    run_mux_case(true, false).await;
    run_mux_case(false, true).await;
    run_mux_case(true, true).await;
}

#[tokio::test]
async fn idle_timeout_closes_cached_connection() {
    let server = start_server(common::server_config(), Duration::ZERO).await;

    let mut config = common::client_config();
    config.idle_timeout = 2 * TIME_SCALE;
    let client = Client::new(server.addr.to_string(), config);
    let ctx = Context::background();

    // (sleep before request, expected connection count after)
    let schedule = [
        (Duration::ZERO, 1),
        (TIME_SCALE, 1),
        (3 * TIME_SCALE, 2),
        (TIME_SCALE, 2),
        (3 * TIME_SCALE, 3),
    ];

    for (i, (pause, expected)) in schedule.into_iter().enumerate() {
        sleep(pause).await;
        client
            .send_acct(&ctx, &acct_request())
            .await
            .expect("accounting request should succeed");
        assert_eq!(server.conn_count(), expected, "case {i}");
    }
    client.close();
}

#[tokio::test]
async fn wrong_secret_surfaces_as_bad_packet() {
    let server = start_server(common::server_config(), Duration::ZERO).await;

    let good = Client::new(server.addr.to_string(), common::client_config());
    let ctx = Context::background();
    good.send_acct(&ctx, &acct_request())
        .await
        .expect("accounting with the right secret should succeed");
    good.close();

    let bad = Client::new(
        server.addr.to_string(),
        ConnConfig {
            secret: b"bad secret".to_vec(),
            mux: true,
            ..ConnConfig::default()
        },
    );
    let err = bad
        .send_acct(&ctx, &acct_request())
        .await
        .expect_err("accounting with the wrong secret should fail");
    assert!(matches!(err, Error::BadPacket), "got {err}");
    bad.close();
}

#[tokio::test]
async fn request_timeout() {
    let server = start_server(common::server_config(), 2 * TIME_SCALE).await;
    let client = Client::new(server.addr.to_string(), common::client_config());

    let ctx = Context::with_deadline(Instant::now() + 4 * TIME_SCALE);
    client
        .send_acct(&ctx, &acct_request())
        .await
        .expect("request within the deadline should succeed");

    let ctx = Context::with_deadline(Instant::now() + TIME_SCALE);
    let err = client
        .send_acct(&ctx, &acct_request())
        .await
        .expect_err("request past the deadline should fail");
    assert!(matches!(err, Error::DeadlineExceeded), "got {err}");
    client.close();
}

/// A handler returning `None` closes the session with no reply: on a
/// multiplexed connection the client just times out waiting, while on a
/// non-multiplexed one the dedicated connection closes under it.
#[tokio::test]
async fn ignored_requests() {
    let server = start_server(common::server_config(), Duration::ZERO).await;

    let mut request = acct_request();
    request.user = "ignore".to_owned();

    let muxed = Client::new(server.addr.to_string(), common::client_config());
    let ctx = Context::with_deadline(Instant::now() + TIME_SCALE);
    let err = muxed
        .send_acct(&ctx, &request)
        .await
        .expect_err("ignored request should time out");
    assert!(matches!(err, Error::DeadlineExceeded), "got {err}");
    muxed.close();

    let plain = Client::new(
        server.addr.to_string(),
        ConnConfig {
            secret: SECRET.to_vec(),
            ..ConnConfig::default()
        },
    );
    let ctx = Context::with_deadline(Instant::now() + 10 * TIME_SCALE);
    let err = plain
        .send_acct(&ctx, &request)
        .await
        .expect_err("ignored request should observe the closed session");
    assert!(matches!(err, Error::SessionClosed), "got {err}");
    plain.close();
}

#[tokio::test]
async fn ignored_authen_and_author_requests() {
    let server = start_server(common::server_config(), Duration::ZERO).await;
    let client = Client::new(
        server.addr.to_string(),
        ConnConfig {
            secret: SECRET.to_vec(),
            ..ConnConfig::default()
        },
    );

    let mut start = authen_start();
    start.user = "ignore".to_owned();
    let ctx = Context::with_deadline(Instant::now() + 10 * TIME_SCALE);
    let err = client
        .send_authen_start(&ctx, &start)
        .await
        .expect_err("ignored start should observe the closed session");
    assert!(matches!(err, Error::SessionClosed), "got {err}");

    let mut request = author_request();
    request.user = "ignore".to_owned();
    let ctx = Context::with_deadline(Instant::now() + 10 * TIME_SCALE);
    let err = client
        .send_author(&ctx, &request)
        .await
        .expect_err("ignored request should observe the closed session");
    assert!(matches!(err, Error::SessionClosed), "got {err}");
    client.close();
}

