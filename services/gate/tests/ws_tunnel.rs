//! WebSocket tunnel integration tests.


use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{client_async, connect_async};

use harness::{
    dead_addr, eventually, init_crypto_provider, ws_tunnel, TlsFiles, PROBE_INTERVAL,
    PROBE_TIMEOUT,
};
use linegate_gate::config::CertConfig;
use linegate_gate::{GateContext, GateError, SocketTuning, WsTunnel};
use linegate_wire::{real_ip_frame, Frame};

const WAIT: Duration = Duration::from_secs(3);

/// Backend that records what it receives and answers every read with one
/// `world` frame.
struct FramedBackend {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<u8>>>,
}

impl FramedBackend {
    async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));

        let store = Arc::clone(&received);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let reply = world_frame();
                    let mut buf = [0u8; 1024];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                store.lock().unwrap().extend_from_slice(&buf[..n]);
                                if stream.write_all(&reply).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        Self { addr, received }
    }

    fn received(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }
}

fn world_frame() -> Vec<u8> {
    Frame::new(7, b"world".to_vec()).encode()
}

async fn next_message<S>(ws: &mut S) -> Message
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    timeout(WAIT, ws.next())
        .await
        .expect("no message in time")
        .expect("stream ended")
        .unwrap()
}

#[tokio::test]
async fn test_backend_frame_forwarded_as_one_text_message() {
    let backend = FramedBackend::spawn().await;
    let ctx = GateContext::new();
    let tunnel = ws_tunnel(&ctx, backend.addr, &[]).await;
    let addr = tunnel.start().await.unwrap();

    let (mut ws, _) = connect_async(format!("ws://{addr}/gate/ws")).await.unwrap();
    ws.send(Message::binary(b"hi".to_vec())).await.unwrap();

    let message = next_message(&mut ws).await;
    assert!(message.is_text());
    let data = message.into_data();
    assert_eq!(data.len(), 21);
    assert_eq!(&data[..], &world_frame()[..]);
    assert_eq!(&data[16..], b"world");

    ws.close(None).await.unwrap();
    drop(ws);
    assert!(eventually(WAIT, || tunnel.active_sessions() == 0).await);

    let stats = ctx.stats().snapshot();
    assert_eq!(stats.success_num, 1);
    assert_eq!(stats.client_in_size, 2);
    assert_eq!(stats.server_in_size, 21);
    assert_eq!(stats.server_out_size, 21);

    tunnel.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_client_messages_reach_backend_verbatim() {
    let backend = FramedBackend::spawn().await;
    let ctx = GateContext::new();
    let tunnel = ws_tunnel(&ctx, backend.addr, &["/game", "/chat"]).await;
    let addr = tunnel.start().await.unwrap();

    let (mut ws, _) = connect_async(format!("ws://{addr}/chat")).await.unwrap();
    ws.send(Message::binary(vec![0u8, 1, 2, 0xff])).await.unwrap();
    ws.send(Message::text("abc")).await.unwrap();

    let expected = [0u8, 1, 2, 0xff, b'a', b'b', b'c'];
    assert!(eventually(WAIT, || backend.received() == expected).await);

    drop(ws);
    tunnel.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_unknown_path_is_not_found() {
    let backend = FramedBackend::spawn().await;
    let ctx = GateContext::new();
    let tunnel = ws_tunnel(&ctx, backend.addr, &["/game"]).await;
    let addr = tunnel.start().await.unwrap();

    let err = connect_async(format!("ws://{addr}/elsewhere")).await.unwrap_err();
    assert!(matches!(err, WsError::Http(ref response) if response.status() == 404));
    assert_eq!(tunnel.active_sessions(), 0);

    tunnel.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_no_usable_line_is_not_found() {
    let ctx = GateContext::new();
    let tunnel = ws_tunnel(&ctx, dead_addr().await, &[]).await;
    let addr = tunnel.start().await.unwrap();

    let err = connect_async(format!("ws://{addr}/gate/ws")).await.unwrap_err();
    assert!(matches!(err, WsError::Http(ref response) if response.status() == 404));

    let stats = ctx.stats().snapshot();
    assert_eq!(stats.failed_num, 1);
    assert_eq!(stats.success_num, 0);
    assert_eq!(tunnel.active_sessions(), 0);

    tunnel.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_redirect_preamble_precedes_first_message() {
    let backend = FramedBackend::spawn().await;
    let ctx = GateContext::new();
    let tunnel = WsTunnel::new(
        "ws-redirect",
        "127.0.0.1:0",
        Vec::new(),
        SocketTuning::default(),
        ctx.clone(),
    );
    tunnel
        .pool()
        .add_line(backend.addr.to_string(), PROBE_TIMEOUT, PROBE_INTERVAL, 10, true)
        .await;
    let addr = tunnel.start().await.unwrap();

    let (mut ws, _) = connect_async(format!("ws://{addr}/gate/ws")).await.unwrap();
    ws.send(Message::binary(b"ping".to_vec())).await.unwrap();
    let message = next_message(&mut ws).await;
    assert_eq!(&message.into_data()[..], &world_frame()[..]);

    let mut expected = real_ip_frame(IpAddr::V4(Ipv4Addr::LOCALHOST));
    expected.extend_from_slice(b"ping");
    assert!(eventually(WAIT, || backend.received() == expected).await);

    drop(ws);
    tunnel.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_idle_websocket_client_never_dials() {
    let backend = FramedBackend::spawn().await;
    let ctx = GateContext::new();
    let tunnel = ws_tunnel(&ctx, backend.addr, &[]).await;
    let addr = tunnel.start().await.unwrap();
    let line = tunnel.pool().lines().await.remove(0);

    let (ws, _) = connect_async(format!("ws://{addr}/gate/ws")).await.unwrap();
    assert!(eventually(WAIT, || ctx.stats().snapshot().in_num == 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stats = ctx.stats().snapshot();
    assert_eq!(line.current_load(), 0);
    assert_eq!(stats.out_num, 0);
    assert_eq!(stats.success_num, 0);
    assert!(backend.received().is_empty());

    drop(ws);
    assert!(eventually(WAIT, || tunnel.active_sessions() == 0).await);
    tunnel.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_unreadable_certificate_fails_start() {
    let backend = FramedBackend::spawn().await;
    let tunnel = WsTunnel::with_tls(
        "wss-it",
        "127.0.0.1:0",
        Vec::new(),
        vec![CertConfig {
            certfile: PathBuf::from("/nonexistent/gate.crt"),
            keyfile: PathBuf::from("/nonexistent/gate.key"),
        }],
        SocketTuning::default(),
        GateContext::new(),
    );
    tunnel
        .pool()
        .add_line(backend.addr.to_string(), PROBE_TIMEOUT, PROBE_INTERVAL, 10, false)
        .await;

    let err = tunnel.start().await.unwrap_err();
    assert!(matches!(err, GateError::Tls { .. }));
    assert!(tunnel.local_addr().await.is_none());
}

#[tokio::test]
async fn test_tls_roundtrip() {
    init_crypto_provider();
    let files = TlsFiles::generate("localhost").unwrap();
    let backend = FramedBackend::spawn().await;
    let ctx = GateContext::new();

    let tunnel = WsTunnel::with_tls(
        "wss-it",
        "127.0.0.1:0",
        Vec::new(),
        vec![files.cert.clone()],
        SocketTuning::default(),
        ctx.clone(),
    );
    tunnel
        .pool()
        .add_line(backend.addr.to_string(), PROBE_TIMEOUT, PROBE_INTERVAL, 10, false)
        .await;
    let addr = tunnel.start().await.unwrap();
    assert!(tunnel.is_tls());

    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(CertificateDer::from(files.cert_der.clone()))
        .unwrap();
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let tcp = TcpStream::connect(addr).await.unwrap();
    let tls = connector
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .unwrap();
    let (mut ws, _) = client_async("wss://localhost/gate/wss", tls).await.unwrap();

    ws.send(Message::text("secure")).await.unwrap();
    let message = next_message(&mut ws).await;
    assert_eq!(&message.into_data()[..], &world_frame()[..]);
    assert!(eventually(WAIT, || backend.received() == b"secure").await);

    drop(ws);
    tunnel.stop(Duration::from_secs(2)).await.unwrap();
    assert_eq!(ctx.stats().snapshot().success_num, 1);
}
