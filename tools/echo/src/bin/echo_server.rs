//! Framed echo backend.
//!
//! Listens on every `--listen` address, logs the real-IP preamble the gateway
//! sends on redirect lines and echoes every other frame unchanged.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, info_span, warn, Instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use linegate_wire::{
    parse_real_ip, FrameReader, Header, WireError, CMD_SET_REAL_IP, DEFAULT_READ_BUFFER,
};

#[derive(Debug, Parser)]
#[command(name = "echo-server", version, about = "Framed echo backend")]
struct Cli {
    /// Address to listen on; repeat for several listeners.
    #[arg(short, long, required = true)]
    listen: Vec<SocketAddr>,

    /// Idle time after which a connection is dropped.
    #[arg(long, default_value_t = 60)]
    idle_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let idle = Duration::from_secs(cli.idle_secs);

    let mut servers = Vec::with_capacity(cli.listen.len());
    for addr in &cli.listen {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        info!(%addr, "Echo server listening");
        servers.push(tokio::spawn(accept_loop(listener, idle)));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    for server in servers {
        server.abort();
    }
    Ok(())
}

async fn accept_loop(listener: TcpListener, idle: Duration) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let span = info_span!("connection", %peer);
                tokio::spawn(
                    async move {
                        match echo(stream, idle).await {
                            Ok(frames) => debug!(frames, "Connection closed"),
                            Err(e) => debug!(error = %e, "Connection ended"),
                        }
                    }
                    .instrument(span),
                );
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Echo frames until the peer goes away. Returns the number echoed.
async fn echo(mut stream: TcpStream, idle: Duration) -> Result<u64, WireError> {
    let mut reader = FrameReader::new(DEFAULT_READ_BUFFER);
    let mut frames = 0u64;

    loop {
        let span = match reader.read_frame(&mut stream, idle).await {
            Ok(span) => span,
            // Gateway probes connect and close without sending.
            Err(WireError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(frames);
            }
            Err(e) => return Err(e),
        };

        let header = Header::decode(span)?;
        if header.cmd == CMD_SET_REAL_IP {
            match parse_real_ip(span) {
                Ok(ip) => info!(real_ip = %ip, "Client address received"),
                Err(e) => warn!(error = %e, "Malformed real-IP preamble"),
            }
            continue;
        }

        debug!(cmd = header.cmd, body_len = header.body_len, "Echo");
        stream.write_all(span).await?;
        frames += 1;
    }
}
