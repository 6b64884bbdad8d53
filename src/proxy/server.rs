//! Accept loop and per-connection driver.
//!
//! # Responsibilities
//! - Accept client connections within the listener's limit
//! - Run one [`ConnectionHandler`] per connection in its own task
//! - Perform the handler's queued dials and writes in order
//! - Once forwarding, copy both directions concurrently, feeding `on_data`
//!   and `on_response`
//! - After a local response, drain unread client input before closing
//! - Stop accepting on shutdown and wait for open connections to drain

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};

use crate::config::ProxyConfig;
use crate::net::connection::{ConnectionId, ConnectionTracker};
use crate::net::listener::{Listener, ListenerError};
use crate::proxy::decision::{BackendError, BackendTarget, PolicyEvaluator};
use crate::proxy::handler::{ConnectionHandler, HandlerOptions, Phase};
use crate::proxy::outbox::{Dialer, Outbound, Outbox};

/// Policy shared by every connection task.
pub type SharedPolicy = Arc<dyn PolicyEvaluator + Send + Sync>;

const IO_CHUNK_SIZE: usize = 16 * 1024;
const BACKEND_SOURCE: &str = "backend";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const LINGER_TIMEOUT: Duration = Duration::from_millis(500);

struct ConnectionContext {
    policy: SharedPolicy,
    options: HandlerOptions,
    connect_timeout: Duration,
}

/// The authenticating proxy server.
pub struct ProxyServer {
    context: Arc<ConnectionContext>,
    tracker: ConnectionTracker,
}

impl ProxyServer {
    pub fn new(config: &ProxyConfig, policy: SharedPolicy) -> Self {
        Self {
            context: Arc::new(ConnectionContext {
                policy,
                options: config.handler_options(),
                connect_timeout: config.backend.connect_timeout(),
            }),
            tracker: ConnectionTracker::new(),
        }
    }

    /// Open connections, for shutdown coordination and tests.
    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Accept connections until the shutdown signal fires.
    pub async fn run(
        self,
        listener: Listener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ListenerError> {
        tracing::info!(
            address = ?listener.local_addr().ok(),
            max_connections = listener.max_connections(),
            "Proxy server starting"
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer, permit) = match accepted {
                        Ok(conn) => conn,
                        Err(ListenerError::Accept(err)) => {
                            tracing::warn!(error = %err, "Accept failed");
                            continue;
                        }
                        Err(err) => return Err(err),
                    };

                    let guard = self.tracker.track();
                    let context = Arc::clone(&self.context);
                    tokio::spawn(async move {
                        let id = guard.id();
                        tracing::debug!(connection_id = %id, peer_addr = %peer, "Connection opened");
                        if let Err(err) = serve_connection(stream, id, &context).await {
                            tracing::debug!(connection_id = %id, error = %err, "Connection ended with I/O error");
                        }
                        drop(permit);
                        drop(guard);
                    });
                }
                _ = shutdown.recv() => {
                    tracing::info!(active = self.tracker.active_count(), "Shutdown signal received, draining");
                    break;
                }
            }
        }

        if tokio::time::timeout(DRAIN_TIMEOUT, self.tracker.wait_for_drain())
            .await
            .is_err()
        {
            tracing::warn!(
                active = self.tracker.active_count(),
                "Drain timeout elapsed with connections still open"
            );
        }

        tracing::info!("Proxy server stopped");
        Ok(())
    }
}

type ProxyHandler = ConnectionHandler<SharedPolicy, Outbox, Dialer>;

enum Flow {
    Continue,
    Close,
}

/// How the head phase of a connection ended.
enum Negotiated {
    /// Forwarding with the buffered prefix already written to the backend.
    Relay(TcpStream),
    /// A local response was written and the client write side shut down.
    Rejected,
    /// The client went away before a decision.
    ClientGone,
}

async fn serve_connection(
    stream: TcpStream,
    id: ConnectionId,
    context: &ConnectionContext,
) -> io::Result<()> {
    let (mut client_rd, mut client_wr) = stream.into_split();
    let mut handler = ConnectionHandler::new(
        id,
        Arc::clone(&context.policy),
        Outbox::new(),
        Dialer::new(),
        context.options.clone(),
    );

    let negotiated = negotiate(&mut handler, &mut client_rd, &mut client_wr, context).await;
    let result = match negotiated {
        Ok(Negotiated::Relay(backend)) => relay(&mut handler, client_rd, client_wr, backend).await,
        Ok(Negotiated::Rejected) => {
            discard_unread(&mut handler, &mut client_rd).await;
            Ok(())
        }
        Ok(Negotiated::ClientGone) => Ok(()),
        Err(err) => Err(err),
    };

    handler.on_close();
    result
}

/// Feed client bytes to the handler until it forwards or answers locally.
async fn negotiate(
    handler: &mut ProxyHandler,
    client_rd: &mut OwnedReadHalf,
    client_wr: &mut OwnedWriteHalf,
    context: &ConnectionContext,
) -> io::Result<Negotiated> {
    let id = handler.id();
    let mut backend: Option<TcpStream> = None;
    let mut buf = vec![0u8; IO_CHUNK_SIZE];

    loop {
        if let Some(target) = handler.backend_mut().take_pending() {
            let outcome = match dial(&target, context.connect_timeout).await {
                Ok(stream) => {
                    backend = Some(stream);
                    handler.on_backend_connected()
                }
                Err(err) => handler.on_backend_connect_failed(err),
            };
            if let Err(err) = outcome {
                tracing::error!(connection_id = %id, error = %err, "Dial outcome rejected");
            }
        }

        if let Flow::Close = flush(handler.transport_mut(), client_wr, backend.as_mut(), id).await? {
            return Ok(Negotiated::Rejected);
        }

        if matches!(handler.phase(), Phase::Forwarding(_)) {
            if let Some(stream) = backend.take() {
                return Ok(Negotiated::Relay(stream));
            }
        }

        let n = client_rd.read(&mut buf).await?;
        if n == 0 {
            return Ok(Negotiated::ClientGone);
        }
        handler.on_data(&buf[..n]);
    }
}

/// Copy both directions concurrently until each side has finished.
///
/// The handler sits behind a lock that is never held across an await, so
/// either direction can block on a slow peer without stalling the other.
async fn relay(
    handler: &mut ProxyHandler,
    client_rd: OwnedReadHalf,
    client_wr: OwnedWriteHalf,
    backend: TcpStream,
) -> io::Result<()> {
    let (backend_rd, backend_wr) = backend.into_split();
    let shared = Mutex::new(handler);

    let (up, down) = tokio::try_join!(
        relay_upstream(&shared, client_rd, backend_wr),
        relay_downstream(&shared, backend_rd, client_wr),
    )?;

    let handler = shared.into_inner();
    tracing::debug!(
        connection_id = %handler.id(),
        client_to_backend = up,
        backend_to_client = down,
        "Relay finished"
    );
    Ok(())
}

async fn relay_upstream(
    handler: &Mutex<&mut ProxyHandler>,
    mut client: OwnedReadHalf,
    mut backend: OwnedWriteHalf,
) -> io::Result<u64> {
    let mut total = 0u64;
    let mut buf = vec![0u8; IO_CHUNK_SIZE];
    loop {
        let n = client.read(&mut buf).await?;
        if n == 0 {
            // Half-close toward the backend; its reply keeps flowing.
            backend.shutdown().await?;
            return Ok(total);
        }

        let queued: Vec<Outbound> = {
            let mut handler = handler.lock().await;
            handler.on_data(&buf[..n]);
            std::iter::from_fn(|| handler.transport_mut().pop()).collect()
        };
        for item in queued {
            if let Outbound::Backend(bytes) = item {
                backend.write_all(&bytes).await?;
            }
        }
        total = total.saturating_add(n as u64);
    }
}

async fn relay_downstream(
    handler: &Mutex<&mut ProxyHandler>,
    mut backend: OwnedReadHalf,
    mut client: OwnedWriteHalf,
) -> io::Result<u64> {
    let mut total = 0u64;
    let mut buf = vec![0u8; IO_CHUNK_SIZE];
    loop {
        let n = backend.read(&mut buf).await?;
        if n == 0 {
            client.shutdown().await?;
            return Ok(total);
        }
        handler.lock().await.on_response(BACKEND_SOURCE, &buf[..n]);
        client.write_all(&buf[..n]).await?;
        total = total.saturating_add(n as u64);
    }
}

/// Read and count what the client still sends after a local response so
/// closing the socket does not reset the connection under unread input.
async fn discard_unread(handler: &mut ProxyHandler, client: &mut OwnedReadHalf) {
    let mut buf = vec![0u8; IO_CHUNK_SIZE];
    let drain = async {
        loop {
            match client.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => handler.on_data(&buf[..n]),
            }
        }
    };
    if tokio::time::timeout(LINGER_TIMEOUT, drain).await.is_err() {
        tracing::debug!(connection_id = %handler.id(), "Client still sending after rejection");
    }
}

async fn flush(
    outbox: &mut Outbox,
    client: &mut OwnedWriteHalf,
    mut backend: Option<&mut TcpStream>,
    id: ConnectionId,
) -> io::Result<Flow> {
    while let Some(item) = outbox.pop() {
        match item {
            Outbound::Client(bytes) => client.write_all(&bytes).await?,
            Outbound::Backend(bytes) => match backend.as_deref_mut() {
                Some(stream) => stream.write_all(&bytes).await?,
                None => {
                    tracing::error!(connection_id = %id, bytes = bytes.len(), "Relay without backend connection dropped");
                }
            },
            Outbound::CloseAfterWriting => {
                client.flush().await?;
                client.shutdown().await?;
                return Ok(Flow::Close);
            }
        }
    }
    Ok(Flow::Continue)
}

async fn dial(target: &BackendTarget, timeout: Duration) -> Result<TcpStream, BackendError> {
    let connect = TcpStream::connect((target.host.as_str(), target.port));
    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(source)) => Err(BackendError::Connect {
            target: target.clone(),
            source,
        }),
        Err(_) => Err(BackendError::Timeout(target.clone())),
    }
}
