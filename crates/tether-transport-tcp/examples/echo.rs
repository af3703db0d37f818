//! 回显演示：同一进程内启动服务端与客户端，发送几行文本并打印回显。
//!
//! ```text
//! RUST_LOG=debug cargo run -p tether-transport-tcp --example echo
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tether_transport_tcp::{
    ClientConfig, ClientEngine, ClientHandler, ConnectionState, Result, ServerConfig,
    ServerEngine, ServerHandler,
};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

struct EchoServer;

#[async_trait]
impl ServerHandler for EchoServer {
    async fn on_received(&self, server: &ServerEngine, state: &Arc<ConnectionState>) -> Result<()> {
        for chunk in state.drain_received() {
            server.send(state, &chunk).await;
        }
        Ok(())
    }
}

struct PrintClient {
    echoed: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl ClientHandler for PrintClient {
    async fn on_received(&self, _client: &ClientEngine, state: &Arc<ConnectionState>) -> Result<()> {
        let bytes = state.drain_received().concat();
        let _ = self.echoed.send(String::from_utf8_lossy(&bytes).into_owned());
        Ok(())
    }

    async fn on_disconnected(&self, _client: &ClientEngine) {
        info!("client disconnected");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let server = ServerEngine::new(ServerConfig::default().with_pool_capacity(16), EchoServer)?;
    let addr = server.start("127.0.0.1", 0).await?;

    let (echoed_tx, mut echoed) = mpsc::unbounded_channel();
    let client = ClientEngine::new(ClientConfig::default(), PrintClient { echoed: echoed_tx })?;
    client.connect("127.0.0.1", addr.port()).await?;

    for line in ["hello", "tether"] {
        client.send(line).await?;
        let reply = tokio::time::timeout(Duration::from_secs(2), echoed.recv())
            .await
            .context("echo timed out")?
            .context("client handler dropped")?;
        println!("{line} -> {reply}");
    }

    client.close().await;
    server.close().await;
    Ok(())
}
