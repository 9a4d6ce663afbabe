//! Echo client for the gateway.
//!
//! Opens `--clients` sessions over TCP, WebSocket or both, sends numbered
//! `hello <i>` frames every `--interval-ms` and logs each echo.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, info_span, warn, Instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use linegate_wire::{Frame, FrameReader, DEFAULT_READ_BUFFER};

const ECHO_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "echo-client", version, about = "Gateway echo client")]
struct Cli {
    /// Gateway TCP tunnel address.
    #[arg(long)]
    tcp: Option<String>,

    /// Gateway WebSocket URL, e.g. ws://127.0.0.1:10001/gate/ws.
    #[arg(long)]
    ws: Option<String>,

    /// Concurrent sessions per transport.
    #[arg(long, default_value_t = 1)]
    clients: usize,

    /// Messages per session.
    #[arg(long, default_value_t = 10)]
    count: u64,

    /// Pause between messages.
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Command word carried by each frame.
    #[arg(long, default_value_t = 1)]
    cmd: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    if cli.tcp.is_none() && cli.ws.is_none() {
        bail!("nothing to do: pass --tcp and/or --ws");
    }
    let interval = Duration::from_millis(cli.interval_ms);

    let mut sessions = JoinSet::new();
    for client in 0..cli.clients {
        if let Some(addr) = &cli.tcp {
            let addr = addr.clone();
            let span = info_span!("tcp", client);
            sessions.spawn(tcp_session(addr, cli.cmd, cli.count, interval).instrument(span));
        }
        if let Some(url) = &cli.ws {
            let url = url.clone();
            let span = info_span!("ws", client);
            sessions.spawn(ws_session(url, cli.cmd, cli.count, interval).instrument(span));
        }
    }

    let mut failed = 0usize;
    while let Some(joined) = sessions.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "Session failed");
                failed += 1;
            }
            Err(e) => {
                warn!(error = %e, "Session task failed");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        bail!("{failed} session(s) failed");
    }
    info!("All sessions complete");
    Ok(())
}

fn hello(cmd: u32, i: u64) -> Vec<u8> {
    Frame::new(cmd, format!("hello {i}").into_bytes()).encode()
}

async fn tcp_session(addr: String, cmd: u32, count: u64, interval: Duration) -> Result<()> {
    let mut stream = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("Failed to connect to {addr}"))?;
    let mut reader = FrameReader::new(DEFAULT_READ_BUFFER);

    for i in 0..count {
        stream.write_all(&hello(cmd, i)).await?;
        let span = reader.read_frame(&mut stream, ECHO_DEADLINE).await?;
        let frame = Frame::decode(span)?;
        info!(seq = i, body = %String::from_utf8_lossy(&frame.body), "Echo received");
        tokio::time::sleep(interval).await;
    }
    Ok(())
}

async fn ws_session(url: String, cmd: u32, count: u64, interval: Duration) -> Result<()> {
    let (mut ws, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("Failed to connect to {url}"))?;

    for i in 0..count {
        ws.send(Message::binary(hello(cmd, i))).await?;

        let message = loop {
            let next = tokio::time::timeout(ECHO_DEADLINE, ws.next())
                .await
                .context("Timed out waiting for echo")?;
            match next {
                Some(Ok(message)) if message.is_text() || message.is_binary() => break message,
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => bail!("gateway closed the session"),
            }
        };

        let frame = Frame::decode(&message.into_data())?;
        info!(seq = i, body = %String::from_utf8_lossy(&frame.body), "Echo received");
        tokio::time::sleep(interval).await;
    }

    ws.close(None).await?;
    Ok(())
}
