//! Named tunnel engines built from configuration.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::lookup_host;
use tracing::{error, info};

use crate::config::{GateConfig, ProxyConfig, ProxyKind};
use crate::context::GateContext;
use crate::error::GateError;
use crate::proxy::{LinePool, TcpTunnel, WsTunnel};

/// A tunnel engine as seen by the registry.
#[async_trait]
pub trait Tunnel: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ProxyKind;

    /// Start listening; returns the bound address.
    async fn start(&self) -> Result<SocketAddr, GateError>;

    /// Stop listening and wait up to `grace` for sessions to drain.
    async fn stop(&self, grace: Duration) -> Result<(), GateError>;

    async fn local_addr(&self) -> Option<SocketAddr>;

    fn pool(&self) -> &LinePool;
}

#[async_trait]
impl Tunnel for TcpTunnel {
    fn name(&self) -> &str {
        TcpTunnel::name(self)
    }

    fn kind(&self) -> ProxyKind {
        ProxyKind::Tcp
    }

    async fn start(&self) -> Result<SocketAddr, GateError> {
        TcpTunnel::start(self).await
    }

    async fn stop(&self, grace: Duration) -> Result<(), GateError> {
        TcpTunnel::stop(self, grace).await
    }

    async fn local_addr(&self) -> Option<SocketAddr> {
        TcpTunnel::local_addr(self).await
    }

    fn pool(&self) -> &LinePool {
        TcpTunnel::pool(self)
    }
}

#[async_trait]
impl Tunnel for WsTunnel {
    fn name(&self) -> &str {
        WsTunnel::name(self)
    }

    fn kind(&self) -> ProxyKind {
        ProxyKind::Websocket
    }

    async fn start(&self) -> Result<SocketAddr, GateError> {
        WsTunnel::start(self).await
    }

    async fn stop(&self, grace: Duration) -> Result<(), GateError> {
        WsTunnel::stop(self, grace).await
    }

    async fn local_addr(&self) -> Option<SocketAddr> {
        WsTunnel::local_addr(self).await
    }

    fn pool(&self) -> &LinePool {
        WsTunnel::pool(self)
    }
}

/// Every configured engine, in configuration order.
pub struct ProxyRegistry {
    tunnels: Vec<Arc<dyn Tunnel>>,
    by_name: HashMap<String, usize>,
}

impl ProxyRegistry {
    /// Build one engine per `[[proxy]]` entry and add its lines.
    pub async fn from_config(config: &GateConfig, ctx: GateContext) -> Result<Self, GateError> {
        let options = &config.options;
        let tuning = options.socket.tuning();
        let mut tunnels: Vec<Arc<dyn Tunnel>> = Vec::with_capacity(config.proxies.len());
        let mut by_name = HashMap::new();

        for proxy in &config.proxies {
            if by_name.contains_key(&proxy.name) {
                return Err(GateError::DuplicateProxy(proxy.name.clone()));
            }
            check_recursive(proxy).await?;

            let tunnel: Arc<dyn Tunnel> = match proxy.kind {
                ProxyKind::Tcp => Arc::new(TcpTunnel::new(
                    proxy.name.clone(),
                    proxy.listen.clone(),
                    tuning,
                    ctx.clone(),
                )),
                ProxyKind::Websocket if proxy.tls => Arc::new(WsTunnel::with_tls(
                    proxy.name.clone(),
                    proxy.listen.clone(),
                    proxy.paths.clone(),
                    proxy.certs.clone(),
                    tuning,
                    ctx.clone(),
                )),
                ProxyKind::Websocket => Arc::new(WsTunnel::new(
                    proxy.name.clone(),
                    proxy.listen.clone(),
                    proxy.paths.clone(),
                    tuning,
                    ctx.clone(),
                )),
            };

            let redirect = proxy.redirect.unwrap_or(options.redirect);
            for node in &proxy.nodes {
                tunnel
                    .pool()
                    .add_line(
                        node.addr.clone(),
                        options.heartbeat.timeout(),
                        options.heartbeat.interval(),
                        node.max_load,
                        redirect,
                    )
                    .await;
            }

            info!(
                proxy = %proxy.name,
                kind = %proxy.kind,
                listen = %proxy.listen,
                lines = proxy.nodes.len(),
                redirect,
                "Proxy configured"
            );

            by_name.insert(proxy.name.clone(), tunnels.len());
            tunnels.push(tunnel);
        }

        Ok(Self { tunnels, by_name })
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tunnel>> {
        self.by_name.get(name).map(|&i| Arc::clone(&self.tunnels[i]))
    }

    pub fn tunnels(&self) -> &[Arc<dyn Tunnel>] {
        &self.tunnels
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// Start every engine. The first failure is returned; engines started
    /// before it keep running until `stop_all`.
    pub async fn start_all(&self) -> Result<(), GateError> {
        for tunnel in &self.tunnels {
            if let Err(e) = tunnel.start().await {
                error!(proxy = %tunnel.name(), error = %e, "Proxy failed to start");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Stop every engine, each with the full grace period. Reports the first
    /// error after all engines were asked to stop.
    pub async fn stop_all(&self, grace: Duration) -> Result<(), GateError> {
        let mut first_err = None;
        for tunnel in &self.tunnels {
            if let Err(e) = tunnel.stop(grace).await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Reject a node that points back at the proxy's own listener.
async fn check_recursive(proxy: &ProxyConfig) -> Result<(), GateError> {
    let Some(listen) = resolve(&proxy.listen).await else {
        // Unresolvable listen addresses surface as bind errors at start.
        return Ok(());
    };

    for node in &proxy.nodes {
        let Some(node_addr) = resolve(&node.addr).await else {
            continue;
        };
        if points_at(listen, node_addr) {
            return Err(GateError::RecursiveLine {
                name: proxy.name.clone(),
                addr: node.addr.clone(),
            });
        }
    }
    Ok(())
}

async fn resolve(addr: &str) -> Option<SocketAddr> {
    if let Ok(parsed) = addr.parse() {
        return Some(parsed);
    }
    lookup_host(addr).await.ok()?.next()
}

fn points_at(listen: SocketAddr, node: SocketAddr) -> bool {
    if listen.port() != node.port() {
        return false;
    }
    if listen.ip() == node.ip() {
        return true;
    }
    listen.ip().is_unspecified() && is_local(node.ip())
}

fn is_local(ip: IpAddr) -> bool {
    ip.is_loopback() || ip.is_unspecified()
}
