use std::time::Duration;

use anyhow::bail;
use anyhow::ensure;
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

use super::BoxedStream;
use super::Dial;
use super::DialerImpl;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Dialer that tunnels through an HTTP proxy with a CONNECT request,
/// optionally carrying basic proxy authorization.
pub struct HttpConnectDialer {
    forward: Box<DialerImpl>,
    host: String,
    port: u16,
    auth: Option<(String, String)>,
}

impl HttpConnectDialer {
    #[must_use]
    pub fn new(
        forward: DialerImpl,
        host: String,
        port: u16,
        auth: Option<(String, String)>,
    ) -> Self {
        Self {
            forward: Box::new(forward),
            host,
            port,
            auth,
        }
    }
}

#[async_trait]
impl Dial for HttpConnectDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream> {
        let mut stream = self
            .forward
            .dial(&self.host, self.port)
            .await
            .with_context(|| format!("failed to dial http proxy {}:{}", self.host, self.port))?;

        timeout(
            HANDSHAKE_TIMEOUT,
            connect(&mut stream, host, port, self.auth.as_ref()),
        )
        .await
        .with_context(|| format!("CONNECT to {}:{} timed out", self.host, self.port))?
        .with_context(|| format!("CONNECT through {}:{} failed", self.host, self.port))?;

        Ok(stream)
    }

    async fn close(&self) -> Result<()> {
        self.forward.close().await
    }
}

async fn connect(
    stream: &mut BoxedStream,
    host: &str,
    port: u16,
    auth: Option<&(String, String)>,
) -> Result<()> {
    let target = host_port(host, port);

    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some((user, secret)) = auth {
        let credentials = STANDARD.encode(format!("{user}:{secret}"));
        request.push_str(&format!("Proxy-Authorization: Basic {credentials}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    // Read the response head only; the tunnel bytes follow it.
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        ensure!(head.len() < MAX_RESPONSE_HEAD, "proxy response too large");
        head.push(stream.read_u8().await?);
    }

    let head = String::from_utf8_lossy(&head);
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .context("malformed proxy response")?;

    if status != 200 {
        bail!("connection error: status code: {status}");
    }

    Ok(())
}

fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
