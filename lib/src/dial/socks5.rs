use std::net::IpAddr;

use anyhow::bail;
use anyhow::ensure;
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;

use super::BoxedStream;
use super::Dial;
use super::DialerImpl;

/// Dialer that tunnels through a SOCKS5 proxy (RFC 1928), optionally with
/// username/password authentication (RFC 1929).
pub struct Socks5Dialer {
    forward: Box<DialerImpl>,
    host: String,
    port: u16,
    auth: Option<(String, String)>,
}

impl Socks5Dialer {
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
impl Dial for Socks5Dialer {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream> {
        let mut stream = self
            .forward
            .dial(&self.host, self.port)
            .await
            .with_context(|| format!("failed to dial socks5 proxy {}:{}", self.host, self.port))?;

        handshake(&mut stream, host, port, self.auth.as_ref())
            .await
            .with_context(|| format!("socks5 handshake with {}:{} failed", self.host, self.port))?;

        Ok(stream)
    }

    async fn close(&self) -> Result<()> {
        self.forward.close().await
    }
}

async fn handshake(
    stream: &mut BoxedStream,
    host: &str,
    port: u16,
    auth: Option<&(String, String)>,
) -> Result<()> {
    // Method negotiation.
    let methods: &[u8] = if auth.is_some() { &[0x00, 0x02] } else { &[0x00] };
    let mut greeting = Vec::with_capacity(2 + methods.len());
    greeting.push(0x05);
    greeting.push(u8::try_from(methods.len()).expect("method list fits"));
    greeting.extend_from_slice(methods);
    stream.write_all(&greeting).await?;

    let mut chosen = [0u8; 2];
    stream.read_exact(&mut chosen).await?;
    ensure!(chosen[0] == 0x05, "unexpected SOCKS version {}", chosen[0]);

    match chosen[1] {
        0x00 => {}
        0x02 => {
            let Some((user, secret)) = auth else {
                bail!("proxy requires authentication");
            };
            subnegotiate(stream, user, secret).await?;
        }
        0xff => bail!("no acceptable authentication method"),
        other => bail!("unsupported authentication method {other}"),
    }

    // Connect request.
    let mut request = vec![0x05, 0x01, 0x00];
    if let Ok(ip) = host.parse::<IpAddr>() {
        match ip {
            IpAddr::V4(v4) => {
                request.push(0x01);
                request.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                request.push(0x04);
                request.extend_from_slice(&v6.octets());
            }
        }
    } else {
        ensure!(host.len() <= 255, "hostname too long for SOCKS5");
        request.push(0x03);
        request.push(u8::try_from(host.len()).expect("length checked"));
        request.extend_from_slice(host.as_bytes());
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    ensure!(reply[0] == 0x05, "unexpected SOCKS version {}", reply[0]);
    if reply[1] != 0x00 {
        bail!("proxy refused connection: {}", reply_text(reply[1]));
    }

    // Discard the bound address.
    match reply[3] {
        0x01 => {
            let mut bound = [0u8; 6];
            stream.read_exact(&mut bound).await?;
        }
        0x03 => {
            let len = stream.read_u8().await? as usize;
            let mut bound = vec![0u8; len + 2];
            stream.read_exact(&mut bound).await?;
        }
        0x04 => {
            let mut bound = [0u8; 18];
            stream.read_exact(&mut bound).await?;
        }
        other => bail!("unexpected address type {other}"),
    }

    Ok(())
}

async fn subnegotiate(stream: &mut BoxedStream, user: &str, secret: &str) -> Result<()> {
    ensure!(
        user.len() <= 255 && secret.len() <= 255,
        "credentials too long for SOCKS5"
    );

    let mut message = Vec::with_capacity(3 + user.len() + secret.len());
    message.push(0x01);
    message.push(u8::try_from(user.len()).expect("length checked"));
    message.extend_from_slice(user.as_bytes());
    message.push(u8::try_from(secret.len()).expect("length checked"));
    message.extend_from_slice(secret.as_bytes());
    stream.write_all(&message).await?;

    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await?;
    ensure!(status[1] == 0x00, "proxy rejected credentials");

    Ok(())
}

fn reply_text(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown failure",
    }
}
