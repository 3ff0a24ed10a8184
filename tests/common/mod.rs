//! Shared helpers for integration tests: short-fuse configs, a recording
//! service, and connect helpers that complete the handshake.

use std::sync::Mutex;
use std::time::Duration;

use tether::validator::{Validator, Verdict};
use tether::{Client, ClientBuilder, Config, DisconnectReason, Result, Service, TransportKind};

pub fn test_config(transport: TransportKind) -> Config {
    let mut config = Config::default();
    config.transport = transport;
    config.host = "127.0.0.1".to_string();
    config.port = 0;
    config.pulse_interval = Duration::from_millis(50);
    config.pulse_limit = 20;
    config.request_timeout = Duration::from_millis(2000);
    config.service_name = "tether-test".to_string();
    config
}

/// Service that records lifecycle events and keeps the most recent ready
/// client around for server-initiated traffic.
#[derive(Default)]
pub struct RecordingService {
    pub ready: Mutex<Vec<String>>,
    pub latest: Mutex<Option<Client>>,
    pub disconnects: Mutex<Vec<(String, DisconnectReason)>>,
}

impl Service for RecordingService {
    fn on_ready(&self, client: &Client) {
        self.ready.lock().unwrap().push(client.id().to_string());
        *self.latest.lock().unwrap() = Some(client.clone());
    }

    fn on_disconnect(&self, client: &Client, reason: DisconnectReason) {
        self.disconnects
            .lock()
            .unwrap()
            .push((client.id().to_string(), reason));
    }
}

/// Validator that fails every verification; used to exercise the
/// bad-handshake paths.
pub struct RejectingValidator;

impl Validator for RejectingValidator {
    fn handshake(&self, _payload: Option<&[u8]>) -> Result<Vec<u8>> {
        Ok(b"offer".to_vec())
    }

    fn verify_handshake(&self, _body: &[u8]) -> Verdict {
        Verdict::Failed
    }

    fn acknowledgement(&self, _body: &[u8]) -> Result<Vec<u8>> {
        Ok(b"ack".to_vec())
    }

    fn verify_acknowledgement(&self, _body: &[u8]) -> Verdict {
        Verdict::Failed
    }
}

/// Connect a bot to a local port and wait for the handshake to finish.
pub async fn connect_ready(port: u16, transport: TransportKind) -> Client {
    let client = connect_raw(port, transport).await;
    client.ready().await.expect("handshake did not complete");
    client
}

/// Connect a bot without waiting for ready.
pub async fn connect_raw(port: u16, transport: TransportKind) -> Client {
    let mut config = test_config(transport);
    config.port = port;
    ClientBuilder::new(config)
        .connect()
        .await
        .expect("connect failed")
}

/// Poll until the condition holds or the deadline passes.
pub async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let end = tokio::time::Instant::now() + deadline;
    while tokio::time::Instant::now() < end {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
