use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::BoxedStream;
use super::Dial;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Dialer that opens plain TCP connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectDialer;

#[async_trait]
impl Dial for DirectDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .with_context(|| format!("TCP connect to {host}:{port} timed out"))?
            .with_context(|| format!("TCP connect to {host}:{port} failed"))?;
        Ok(Box::new(stream))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
