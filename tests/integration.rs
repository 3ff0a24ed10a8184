//! End-to-end tests over real sockets: server and bot exchange the full
//! handshake, then drive requests, commands, timeouts, kicks, and shutdown
//! on both transports.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::*;
use tether::{
    ClientBuilder, DisconnectReason, Server, ServerBuilder, TransportKind,
};
use tokio::time::timeout;

/// Spin up a server with the standard task set used across tests.
async fn start_server(transport: TransportKind) -> (Server<RecordingService>, u16) {
    let server = ServerBuilder::new(test_config(transport), RecordingService::default())
        .task("echo", |_service, commander, envelope| async move {
            commander.response(&envelope, envelope.data.clone());
            Ok(())
        })
        .task("fail", |_service, commander, envelope| async move {
            commander.error(&envelope, "nope", Bytes::new());
            Ok(())
        })
        .task("tick-back", |_service, commander, envelope| async move {
            commander.command("tick", envelope.data.clone());
            Ok(())
        })
        .task("roundtrip", |_service, commander, envelope| async move {
            let doubled = commander.fetch("double", envelope.data.clone()).await?;
            commander.response(&envelope, doubled.data.clone());
            Ok(())
        })
        .bind()
        .await
        .expect("bind failed");

    let port = server.local_addr().port();
    (server, port)
}

#[tokio::test]
async fn happy_rpc_over_stream() {
    let (server, port) = start_server(TransportKind::Stream).await;
    let bot = connect_ready(port, TransportKind::Stream).await;

    let reply = bot.fetch("echo", Bytes::from_static(b"hi")).await.unwrap();
    assert_eq!(reply.name, "echo");
    assert_eq!(reply.id, 0);
    assert_eq!(&reply.data[..], b"hi");
    assert_eq!(reply.error, "");

    bot.disconnect();
    server.stop().await;
}

#[tokio::test]
async fn happy_rpc_over_websocket() {
    let (server, port) = start_server(TransportKind::WebSocket).await;
    let bot = connect_ready(port, TransportKind::WebSocket).await;

    let reply = bot.fetch("echo", Bytes::from_static(b"hi")).await.unwrap();
    assert_eq!(reply.name, "echo");
    assert_eq!(&reply.data[..], b"hi");
    assert_eq!(reply.error, "");

    bot.disconnect();
    server.stop().await;
}

#[tokio::test]
async fn request_ids_are_unique_and_monotonic() {
    let (server, port) = start_server(TransportKind::Stream).await;
    let bot = connect_ready(port, TransportKind::Stream).await;

    for expected in 0u64..3 {
        let reply = bot.fetch("echo", Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(reply.id, expected);
    }

    bot.disconnect();
    server.stop().await;
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let (server, port) = start_server(TransportKind::Stream).await;

    let mut config = test_config(TransportKind::Stream);
    config.port = port;
    config.request_timeout = Duration::from_millis(100);
    let bot = ClientBuilder::new(config).connect().await.unwrap();
    bot.ready().await.unwrap();

    // No task named "slow" exists; the server warns, we expire locally.
    let reply = timeout(Duration::from_secs(2), bot.fetch("slow", Bytes::new()))
        .await
        .expect("timeout never fired")
        .unwrap();
    assert_eq!(reply.error, "timeout");
    assert_eq!(reply.name, "slow");

    // The connection survives a request timeout.
    let reply = bot.fetch("echo", Bytes::from_static(b"still up")).await.unwrap();
    assert_eq!(&reply.data[..], b"still up");

    bot.disconnect();
    server.stop().await;
}

#[tokio::test]
async fn failing_task_reports_error_envelope() {
    let (server, port) = start_server(TransportKind::Stream).await;
    let bot = connect_ready(port, TransportKind::Stream).await;

    let reply = bot.fetch("fail", Bytes::new()).await.unwrap();
    assert!(reply.is_failure());
    assert_eq!(reply.error, "nope");

    bot.disconnect();
    server.stop().await;
}

#[tokio::test]
async fn service_kicks_silent_bot() {
    let mut server_config = test_config(TransportKind::Stream);
    server_config.pulse_interval = Duration::from_millis(10);
    server_config.pulse_limit = 3;
    let server = ServerBuilder::new(server_config, RecordingService::default())
        .bind()
        .await
        .unwrap();
    let port = server.local_addr().port();

    // A bot whose own pulse is far too slow to keep the link alive.
    let mut bot_config = test_config(TransportKind::Stream);
    bot_config.port = port;
    bot_config.pulse_interval = Duration::from_secs(10);
    let bot = ClientBuilder::new(bot_config).connect().await.unwrap();
    bot.ready().await.unwrap();

    let reason = timeout(Duration::from_secs(2), bot.closed())
        .await
        .expect("kick never arrived");
    assert_eq!(reason, DisconnectReason::Timeout);

    server.stop().await;
}

#[tokio::test]
async fn bot_heartbeat_keeps_connection_alive() {
    let mut server_config = test_config(TransportKind::Stream);
    server_config.pulse_interval = Duration::from_millis(25);
    server_config.pulse_limit = 3;
    let server = ServerBuilder::new(server_config, RecordingService::default())
        .bind()
        .await
        .unwrap();
    let port = server.local_addr().port();

    let mut bot_config = test_config(TransportKind::Stream);
    bot_config.port = port;
    bot_config.pulse_interval = Duration::from_millis(20);
    let bot = ClientBuilder::new(bot_config).connect().await.unwrap();
    bot.ready().await.unwrap();

    // Well past the server's tolerated silence; heartbeats must carry it.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!bot.is_closed());
    assert_eq!(server.connections(), 1);

    bot.disconnect();
    server.stop().await;
}

#[tokio::test]
async fn command_fans_out_in_registration_order() {
    let (server, port) = start_server(TransportKind::Stream).await;
    let bot = connect_ready(port, TransportKind::Stream).await;

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let first = order.clone();
    let second = order.clone();
    bot.on("tick", move |envelope| {
        assert_eq!(&envelope.data[..], b"T");
        first.lock().unwrap().push(1);
    });
    bot.on("tick", move |envelope| {
        assert_eq!(&envelope.data[..], b"T");
        second.lock().unwrap().push(2);
    });

    // Subscriptions and the trigger flow through the same op queue, so
    // they are installed before this command leaves.
    bot.command("tick-back", Bytes::from_static(b"T"));

    assert!(
        wait_until(Duration::from_secs(2), || *order.lock().unwrap() == vec![1, 2]).await,
        "fan-out order was {:?}",
        order.lock().unwrap()
    );

    bot.disconnect();
    server.stop().await;
}

#[tokio::test]
async fn service_can_request_from_bot() {
    let (server, port) = start_server(TransportKind::Stream).await;
    let bot = connect_ready(port, TransportKind::Stream).await;

    bot.on_request("double", |commander, envelope| {
        let mut doubled = envelope.data.to_vec();
        doubled.extend_from_slice(&envelope.data);
        commander.response(&envelope, doubled);
    });

    // The roundtrip task asks the bot to double the data, then echoes the
    // bot's answer back.
    let reply = bot
        .fetch("roundtrip", Bytes::from_static(b"ab"))
        .await
        .unwrap();
    assert_eq!(&reply.data[..], b"abab");

    bot.disconnect();
    server.stop().await;
}

#[tokio::test]
async fn rejected_handshake_kicks_with_reason() {
    let server = ServerBuilder::new(
        test_config(TransportKind::Stream),
        RecordingService::default(),
    )
    .validator(RejectingValidator)
    .bind()
    .await
    .unwrap();
    let port = server.local_addr().port();

    let bot = connect_raw(port, TransportKind::Stream).await;

    let reason = timeout(Duration::from_secs(2), bot.closed())
        .await
        .expect("disconnect never surfaced");
    assert_eq!(reason, DisconnectReason::Handshake);
    assert!(bot.ready().await.is_err());

    server.stop().await;
}

#[tokio::test]
async fn server_shutdown_broadcasts_server_down() {
    let (server, port) = start_server(TransportKind::Stream).await;

    let bot_a = connect_ready(port, TransportKind::Stream).await;
    let bot_b = connect_ready(port, TransportKind::Stream).await;
    assert_eq!(server.connections(), 2);

    server.stop().await;

    let reason_a = timeout(Duration::from_secs(2), bot_a.closed()).await.unwrap();
    let reason_b = timeout(Duration::from_secs(2), bot_b.closed()).await.unwrap();
    assert_eq!(reason_a, DisconnectReason::ServerDown);
    assert_eq!(reason_b, DisconnectReason::ServerDown);
}

#[tokio::test]
async fn service_lifecycle_callbacks_fire() {
    let service = Arc::new(RecordingService::default());
    // ServerBuilder owns its service; share state through the Arc fields.
    let server = ServerBuilder::new(
        test_config(TransportKind::Stream),
        SharedRecording(service.clone()),
    )
    .bind()
    .await
    .unwrap();
    let port = server.local_addr().port();

    let bot = connect_ready(port, TransportKind::Stream).await;
    assert!(
        wait_until(Duration::from_secs(2), || {
            service.ready.lock().unwrap().len() == 1
        })
        .await
    );

    bot.disconnect();
    assert!(
        wait_until(Duration::from_secs(2), || {
            !service.disconnects.lock().unwrap().is_empty()
        })
        .await
    );
    let (id, reason) = service.disconnects.lock().unwrap()[0].clone();
    assert_eq!(id, service.ready.lock().unwrap()[0]);
    assert_eq!(reason, DisconnectReason::Normal);

    server.stop().await;
}

#[tokio::test]
async fn server_initiated_command_reaches_bot() {
    let service = Arc::new(RecordingService::default());
    let server = ServerBuilder::new(
        test_config(TransportKind::Stream),
        SharedRecording(service.clone()),
    )
    .bind()
    .await
    .unwrap();
    let port = server.local_addr().port();

    let bot = connect_ready(port, TransportKind::Stream).await;
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    bot.on("announce", move |envelope| {
        sink.lock().unwrap().push(envelope.data.clone());
    });

    // Wait for the service to observe ready, then push a command from the
    // server side of the connection.
    assert!(
        wait_until(Duration::from_secs(2), || {
            service.latest.lock().unwrap().is_some()
        })
        .await
    );
    let service_client = service.latest.lock().unwrap().clone().unwrap();
    service_client.command("announce", Bytes::from_static(b"hello bots"));

    assert!(
        wait_until(Duration::from_secs(2), || !seen.lock().unwrap().is_empty()).await
    );
    assert_eq!(&seen.lock().unwrap()[0][..], b"hello bots");

    bot.disconnect();
    server.stop().await;
}

/// Wrapper service delegating to a shared [`RecordingService`].
struct SharedRecording(Arc<RecordingService>);

impl tether::Service for SharedRecording {
    fn on_connect(&self, client: &tether::Client) {
        tether::Service::on_connect(&*self.0, client);
    }

    fn on_ready(&self, client: &tether::Client) {
        tether::Service::on_ready(&*self.0, client);
    }

    fn on_disconnect(&self, client: &tether::Client, reason: DisconnectReason) {
        tether::Service::on_disconnect(&*self.0, client, reason);
    }
}
