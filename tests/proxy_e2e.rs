//! End-to-end tests over real sockets: client → proxy → mock backend.

mod common;

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use auth_proxy::config::ProxyConfig;
use common::{closed_port, exchange, start_echo_backend, start_proxy, start_recording_backend};

fn config_for(backend_port: u16) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.backend.host = "127.0.0.1".into();
    config.backend.port = backend_port;
    config.backend.connect_timeout_secs = 2;
    config.policy.keys = vec!["k1".into()];
    config
}

#[tokio::test]
async fn allowed_request_reaches_backend_unchanged() {
    let mut backend = start_recording_backend("hello").await;
    let (addr, shutdown) = start_proxy(config_for(backend.addr.port())).await;

    let request = b"POST /things HTTP/1.1\r\nHost: localhost\r\nX-Api-Key: k1\r\nContent-Length: 4\r\n\r\nping";
    let reply = exchange(addr, &[&request[..]]).await;

    let reply = String::from_utf8_lossy(&reply);
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "got {reply:?}");
    assert!(reply.ends_with("hello"));

    let received = tokio::time::timeout(Duration::from_secs(5), backend.requests.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, request.to_vec());

    shutdown.trigger();
}

#[tokio::test]
async fn head_split_across_writes_is_forwarded() {
    let mut backend = start_recording_backend("ok").await;
    let (addr, shutdown) = start_proxy(config_for(backend.addr.port())).await;

    let chunks: [&[u8]; 4] = [
        b"GET /?api_key=k1 HTTP/1.1\r\n",
        b"Host: local",
        b"host\r\n\r",
        b"\n",
    ];
    let reply = exchange(addr, &chunks).await;
    assert!(reply.starts_with(b"HTTP/1.1 200 OK\r\n"));

    let received = backend.requests.recv().await.unwrap();
    assert_eq!(received, chunks.concat());

    shutdown.trigger();
}

#[tokio::test]
async fn missing_key_is_rejected_locally() {
    let mut backend = start_recording_backend("unreachable").await;
    let (addr, shutdown) = start_proxy(config_for(backend.addr.port())).await;

    let reply = exchange(addr, &[&b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n"[..]]).await;
    let reply = String::from_utf8_lossy(&reply);

    assert!(reply.starts_with(
        "HTTP/1.1 403 Forbidden\r\nContent-Type: application/json\r\nConnection: close\r\nDate: "
    ));
    assert!(reply.contains("API_KEY_MISSING"));

    let nothing = tokio::time::timeout(Duration::from_millis(200), backend.requests.recv()).await;
    assert!(nothing.is_err(), "backend must not see rejected requests");

    shutdown.trigger();
}

#[tokio::test]
async fn unknown_key_is_rejected_locally() {
    let backend = start_recording_backend("unreachable").await;
    let (addr, shutdown) = start_proxy(config_for(backend.addr.port())).await;

    let reply = exchange(addr, &[&b"GET / HTTP/1.1\r\nX-Api-Key: nope\r\n\r\n"[..]]).await;
    let reply = String::from_utf8_lossy(&reply);

    assert!(reply.starts_with("HTTP/1.1 403 Forbidden\r\n"));
    assert!(reply.contains("API_KEY_INVALID"));

    shutdown.trigger();
}

#[tokio::test]
async fn unreachable_backend_answers_bad_gateway() {
    let port = closed_port().await.port();
    let (addr, shutdown) = start_proxy(config_for(port)).await;

    let reply = exchange(addr, &[&b"GET / HTTP/1.1\r\nX-Api-Key: k1\r\n\r\n"[..]]).await;

    assert!(reply.starts_with(b"HTTP/1.1 502 Bad Gateway\r\n"));

    shutdown.trigger();
}

#[tokio::test]
async fn malformed_head_answers_bad_request() {
    let backend = start_recording_backend("unreachable").await;
    let (addr, shutdown) = start_proxy(config_for(backend.addr.port())).await;

    let reply = exchange(addr, &[&b"GET / HTTP/1.1\r\nbroken header\r\n\r\n"[..]]).await;

    assert!(reply.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));

    shutdown.trigger();
}

#[tokio::test]
async fn forwarded_upload_and_echo_flow_at_the_same_time() {
    let backend = start_echo_backend().await;
    let mut config = config_for(backend.port());
    config.policy.allow_anonymous = true;
    let (addr, shutdown) = start_proxy(config).await;

    let head = b"POST / HTTP/1.1\r\nHost: a\r\n\r\n";
    let body_len = 16 * 1024 * 1024;
    let expected = (head.len() + body_len) as u64;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut rd, mut wr) = stream.into_split();

    let reader = tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        let mut echoed = 0u64;
        loop {
            match rd.read(&mut buf).await.unwrap() {
                0 => return echoed,
                n => echoed += n as u64,
            }
        }
    });

    let upload = async move {
        wr.write_all(head).await.unwrap();
        let chunk = vec![b'x'; 64 * 1024];
        for _ in 0..body_len / chunk.len() {
            wr.write_all(&chunk).await.unwrap();
        }
        wr.shutdown().await.unwrap();
    };

    let echoed = tokio::time::timeout(Duration::from_secs(30), async {
        upload.await;
        reader.await.unwrap()
    })
    .await
    .expect("relay stalled with traffic in both directions");

    assert_eq!(echoed, expected);

    shutdown.trigger();
}

#[tokio::test]
async fn rejection_survives_unread_request_body() {
    let backend = start_recording_backend("unreachable").await;
    let (addr, shutdown) = start_proxy(config_for(backend.addr.port())).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut rd, mut wr) = stream.into_split();

    let writer = tokio::spawn(async move {
        let mut request = b"POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: 262144\r\n\r\n".to_vec();
        request.extend(std::iter::repeat(b'x').take(256 * 1024));
        // The proxy may close once it has drained; a late write error is fine.
        let _ = wr.write_all(&request).await;
        let _ = wr.shutdown().await;
    });

    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), rd.read_to_end(&mut reply))
        .await
        .expect("proxy reply timed out")
        .unwrap();
    let _ = writer.await;

    let reply = String::from_utf8_lossy(&reply);
    assert!(reply.starts_with("HTTP/1.1 403 Forbidden\r\n"), "got {reply:?}");
    assert!(reply.contains("API_KEY_MISSING"));

    shutdown.trigger();
}
