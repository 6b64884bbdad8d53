//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use auth_proxy::config::ProxyConfig;
use auth_proxy::lifecycle::Shutdown;
use auth_proxy::net::listener::Listener;
use auth_proxy::policy::ApiKeyPolicy;
use auth_proxy::proxy::{
    BackendConnector, BackendError, BackendTarget, Clock, Connect, PolicyDecision, PolicyError,
    PolicyEvaluator, ProxyServer, RequestHead, SharedPolicy, Transport,
};

pub const CRLF: &str = "\r\n";

/// Transport that records everything the handler asks of it.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    pub sent: Vec<u8>,
    pub relayed: Vec<u8>,
    pub close_requests: usize,
    /// Call order: "send", "close", "relay".
    pub calls: Vec<&'static str>,
}

impl Transport for RecordingTransport {
    fn send(&mut self, bytes: Bytes) {
        self.sent.extend_from_slice(&bytes);
        self.calls.push("send");
    }

    fn close_after_writing(&mut self) {
        self.close_requests += 1;
        self.calls.push("close");
    }

    fn relay_to_backend(&mut self, bytes: Bytes) {
        self.relayed.extend_from_slice(&bytes);
        self.calls.push("relay");
    }
}

/// Connector answering every connect with a fixed outcome.
#[derive(Debug)]
pub struct StubConnector {
    pub outcome: Option<Connect>,
    pub targets: Vec<BackendTarget>,
}

impl StubConnector {
    pub fn ready() -> Self {
        Self { outcome: Some(Connect::Ready), targets: Vec::new() }
    }

    pub fn pending() -> Self {
        Self { outcome: Some(Connect::Pending), targets: Vec::new() }
    }

    pub fn refusing() -> Self {
        Self { outcome: None, targets: Vec::new() }
    }
}

impl BackendConnector for StubConnector {
    fn connect(&mut self, target: &BackendTarget) -> Result<Connect, BackendError> {
        self.targets.push(target.clone());
        self.outcome.ok_or_else(|| BackendError::Refused(target.clone()))
    }
}

/// Policy returning a canned decision and recording what it saw.
#[derive(Debug)]
pub struct StubPolicy {
    decision: Result<PolicyDecision, String>,
    seen: Mutex<Vec<RequestHead>>,
}

impl StubPolicy {
    pub fn deciding(decision: PolicyDecision) -> Arc<Self> {
        Arc::new(Self { decision: Ok(decision), seen: Mutex::new(Vec::new()) })
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self { decision: Err(message.to_string()), seen: Mutex::new(Vec::new()) })
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn seen(&self) -> Vec<RequestHead> {
        self.seen.lock().unwrap().clone()
    }
}

impl PolicyEvaluator for StubPolicy {
    fn evaluate(&self, head: &RequestHead) -> Result<PolicyDecision, PolicyError> {
        self.seen.lock().unwrap().push(head.clone());
        self.decision.clone().map_err(PolicyError::Unavailable)
    }
}

/// Clock frozen at a settable instant.
#[derive(Debug, Clone)]
pub struct ManualClock(Arc<Mutex<SystemTime>>);

impl ManualClock {
    pub fn at(time: SystemTime) -> Self {
        Self(Arc::new(Mutex::new(time)))
    }

    pub fn set(&self, time: SystemTime) {
        *self.0.lock().unwrap() = time;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.0.lock().unwrap()
    }
}

/// A backend that records each request (read to EOF) and replies with a
/// fixed body.
pub struct RecordingBackend {
    pub addr: SocketAddr,
    pub requests: mpsc::UnboundedReceiver<Vec<u8>>,
}

pub async fn start_recording_backend(body: &'static str) -> RecordingBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let mut request = Vec::new();
                        let _ = socket.read_to_end(&mut request).await;
                        let _ = tx.send(request);
                        let response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    RecordingBackend { addr, requests: rx }
}

/// A backend that echoes every byte back as it reads, one chunk at a time.
///
/// It only reads more once the previous chunk is written, so a proxy that
/// stops reading its replies stalls it.
pub async fn start_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = socket.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
                let _ = wr.shutdown().await;
            });
        }
    });

    addr
}

/// An address with nothing listening on it.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Start the proxy on an ephemeral port with the API key policy.
pub async fn start_proxy(mut config: ProxyConfig) -> (SocketAddr, Shutdown) {
    config.listener.bind_address = "127.0.0.1:0".into();
    config.observability.metrics_enabled = false;

    let listener = Listener::bind(&config.listener).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let policy: SharedPolicy = Arc::new(ApiKeyPolicy::from_config(&config.policy));
    let server = ProxyServer::new(&config, policy);

    let shutdown = Shutdown::new();
    let rx = shutdown.subscribe();
    tokio::spawn(server.run(listener, rx));
    (addr, shutdown)
}

/// Write `chunks` as separate writes, half-close, and collect the reply.
pub async fn exchange(addr: SocketAddr, chunks: &[&[u8]]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.set_nodelay(true).unwrap();
    for chunk in chunks {
        stream.write_all(chunk).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    stream.shutdown().await.unwrap();

    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut reply))
        .await
        .expect("proxy reply timed out")
        .unwrap();
    reply
}
