//! Composable dial capability used to reach a target through zero or more
//! intermediate hops.

use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use enum_dispatch::enum_dispatch;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;

use crate::host::AuthnKind;
use crate::host::HostOption;
use crate::Error;

pub mod direct;
pub mod http;
pub mod socks5;
pub mod ssh;

/// Byte stream produced by a dialer.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn Stream>;

impl std::fmt::Debug for dyn Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Stream")
    }
}

/// Dialers produce a byte stream to an address, possibly routed through an
/// inner dialer. Closing a dialer tears down its own state first, then its
/// inner dialer, so a chain closes outermost-first.
#[async_trait]
#[enum_dispatch]
pub trait Dial {
    /// Dials the given address.
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream>;

    /// Releases any state held by this dialer and its inner chain.
    async fn close(&self) -> Result<()>;
}

/// All dialer implementations.
#[enum_dispatch(Dial)]
pub enum DialerImpl {
    Direct(direct::DirectDialer),
    Socks5(socks5::Socks5Dialer),
    HttpConnect(http::HttpConnectDialer),
    SshTunnel(ssh::SshTunnelDialer),
}

impl std::fmt::Debug for DialerImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let variant = match self {
            DialerImpl::Direct(_) => "Direct",
            DialerImpl::Socks5(_) => "Socks5",
            DialerImpl::HttpConnect(_) => "HttpConnect",
            DialerImpl::SshTunnel(_) => "SshTunnel",
        };
        f.debug_tuple("DialerImpl").field(&variant).finish()
    }
}

/// Builds a dialer chain from the ordered hop list.
///
/// The first hop is nearest to the operator; each subsequent hop wraps the
/// accumulated dialer as its forward. An empty list yields a direct dialer.
/// A failure while constructing hop `k` closes hops `1..k-1` and never
/// touches later hops.
pub async fn chain(hops: &[HostOption]) -> Result<DialerImpl> {
    let mut dialer = DialerImpl::from(direct::DirectDialer);

    for hop in hops {
        dialer = wrap(dialer, hop)
            .await
            .with_context(|| format!("failed to chain proxy {}", hop.address))?;
    }

    Ok(dialer)
}

async fn wrap(forward: DialerImpl, hop: &HostOption) -> Result<DialerImpl> {
    match hop.authn.kind {
        AuthnKind::Ssh => ssh::SshTunnelDialer::connect(forward, hop)
            .await
            .map(Into::into),
        AuthnKind::Proxy => match parse_proxy(hop) {
            Ok(proxy) => Ok(proxy.wrap(forward)),
            Err(err) => {
                let _ = forward.close().await;
                Err(err)
            }
        },
        other => {
            let _ = forward.close().await;
            Err(Error::UnknownAuthnType(other.to_string()).into())
        }
    }
}

struct ProxyHop {
    kind: ProxyKind,
    host: String,
    port: u16,
    auth: Option<(String, String)>,
}

enum ProxyKind {
    Socks5,
    HttpConnect,
}

impl ProxyHop {
    fn wrap(self, forward: DialerImpl) -> DialerImpl {
        match self.kind {
            ProxyKind::Socks5 => {
                socks5::Socks5Dialer::new(forward, self.host, self.port, self.auth).into()
            }
            ProxyKind::HttpConnect => {
                http::HttpConnectDialer::new(forward, self.host, self.port, self.auth).into()
            }
        }
    }
}

fn parse_proxy(hop: &HostOption) -> Result<ProxyHop> {
    let parsed = hop
        .parse_address()
        .context("failed to parse proxy address")?;

    let auth = if hop.authn.user.is_empty() && hop.authn.secret.is_empty() {
        None
    } else {
        Some((hop.authn.user.clone(), hop.authn.secret.clone()))
    };

    let (kind, port) = match parsed.scheme.as_str() {
        "socks5" | "socks5h" => (ProxyKind::Socks5, parsed.port_or(1080)),
        "http" => (ProxyKind::HttpConnect, parsed.port_or(80)),
        "https" => (ProxyKind::HttpConnect, parsed.port_or(443)),
        other => return Err(Error::UnknownProxyScheme(other.to_string()).into()),
    };

    Ok(ProxyHop {
        kind,
        host: parsed.host,
        port,
        auth,
    })
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::Mutex;

    use tokio::io::AsyncReadExt;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::net::TcpStream;

    use super::*;
    use crate::host::HostAuthn;

    fn proxy_hop(address: String) -> HostOption {
        HostOption {
            address,
            authn: HostAuthn {
                kind: AuthnKind::Proxy,
                user: String::new(),
                secret: String::new(),
                agent: false,
            },
            insecure: false,
        }
    }

    type TargetLog = Arc<Mutex<Vec<String>>>;

    /// Echoes every byte back to the peer.
    async fn spawn_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = conn.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        addr
    }

    /// Minimal SOCKS5 server without auth that records and forwards to the
    /// requested target.
    async fn spawn_socks5(log: TargetLog) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                let log = log.clone();
                tokio::spawn(async move {
                    let mut head = [0u8; 2];
                    conn.read_exact(&mut head).await.unwrap();
                    let mut methods = vec![0u8; head[1] as usize];
                    conn.read_exact(&mut methods).await.unwrap();
                    conn.write_all(&[0x05, 0x00]).await.unwrap();

                    let mut req = [0u8; 4];
                    conn.read_exact(&mut req).await.unwrap();
                    assert_eq!(&req[..3], &[0x05, 0x01, 0x00]);
                    let host = match req[3] {
                        0x01 => {
                            let mut ip = [0u8; 4];
                            conn.read_exact(&mut ip).await.unwrap();
                            std::net::Ipv4Addr::from(ip).to_string()
                        }
                        0x03 => {
                            let len = conn.read_u8().await.unwrap() as usize;
                            let mut name = vec![0u8; len];
                            conn.read_exact(&mut name).await.unwrap();
                            String::from_utf8(name).unwrap()
                        }
                        other => panic!("unexpected atyp {other}"),
                    };
                    let port = conn.read_u16().await.unwrap();
                    log.lock().unwrap().push(format!("{host}:{port}"));

                    let mut upstream = TcpStream::connect((host.as_str(), port)).await.unwrap();
                    conn.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                        .await
                        .unwrap();
                    let _ = tokio::io::copy_bidirectional(&mut conn, &mut upstream).await;
                });
            }
        });
        addr
    }

    /// Minimal HTTP CONNECT proxy that records and forwards.
    async fn spawn_http_proxy(log: TargetLog) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                let log = log.clone();
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    while !head.ends_with(b"\r\n\r\n") {
                        let b = conn.read_u8().await.unwrap();
                        head.push(b);
                    }
                    let head = String::from_utf8(head).unwrap();
                    let target = head
                        .lines()
                        .next()
                        .unwrap()
                        .split_whitespace()
                        .nth(1)
                        .unwrap()
                        .to_string();
                    log.lock().unwrap().push(target.clone());

                    let mut upstream = TcpStream::connect(target.as_str()).await.unwrap();
                    conn.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                        .await
                        .unwrap();
                    let _ = tokio::io::copy_bidirectional(&mut conn, &mut upstream).await;
                });
            }
        });
        addr
    }

    async fn roundtrip(dialer: &DialerImpl, addr: SocketAddr) {
        let mut stream = dialer.dial("127.0.0.1", addr.port()).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn direct_chain_dials() {
        let echo = spawn_echo().await;
        let dialer = chain(&[]).await.unwrap();
        roundtrip(&dialer, echo).await;
        dialer.close().await.unwrap();
    }

    #[tokio::test]
    async fn socks5_hop_routes_to_target() {
        let echo = spawn_echo().await;
        let log = TargetLog::default();
        let proxy = spawn_socks5(log.clone()).await;

        let dialer = chain(&[proxy_hop(format!("socks5://{proxy}"))]).await.unwrap();
        roundtrip(&dialer, echo).await;
        dialer.close().await.unwrap();

        assert_eq!(log.lock().unwrap().as_slice(), [format!("127.0.0.1:{}", echo.port())]);
    }

    #[tokio::test]
    async fn http_connect_hop_routes_to_target() {
        let echo = spawn_echo().await;
        let log = TargetLog::default();
        let proxy = spawn_http_proxy(log.clone()).await;

        let dialer = chain(&[proxy_hop(format!("http://{proxy}"))]).await.unwrap();
        roundtrip(&dialer, echo).await;
        dialer.close().await.unwrap();

        assert_eq!(log.lock().unwrap().as_slice(), [format!("127.0.0.1:{}", echo.port())]);
    }

    #[tokio::test]
    async fn hops_compose_in_listed_order() {
        let echo = spawn_echo().await;
        let first_log = TargetLog::default();
        let second_log = TargetLog::default();
        let first = spawn_socks5(first_log.clone()).await;
        let second = spawn_socks5(second_log.clone()).await;

        let hops = [
            proxy_hop(format!("socks5://{first}")),
            proxy_hop(format!("socks5://{second}")),
        ];
        let dialer = chain(&hops).await.unwrap();
        roundtrip(&dialer, echo).await;
        dialer.close().await.unwrap();

        // The first hop is asked to reach the second; the second reaches the
        // target.
        assert_eq!(first_log.lock().unwrap().as_slice(), [format!("127.0.0.1:{}", second.port())]);
        assert_eq!(second_log.lock().unwrap().as_slice(), [format!("127.0.0.1:{}", echo.port())]);
    }

    #[tokio::test]
    async fn unknown_proxy_scheme_is_rejected() {
        let err = chain(&[proxy_hop("ftp://127.0.0.1:21".to_string())])
            .await
            .unwrap_err();
        let err = err
            .downcast_ref::<Error>()
            .expect("expected a typed error");
        assert!(matches!(err, Error::UnknownProxyScheme(scheme) if scheme == "ftp"));
    }

    #[tokio::test]
    async fn unknown_hop_authn_is_rejected() {
        let mut hop = proxy_hop("socks5://127.0.0.1:1080".to_string());
        hop.authn.kind = AuthnKind::Winrm;

        let err = chain(&[hop]).await.unwrap_err();
        let err = err
            .downcast_ref::<Error>()
            .expect("expected a typed error");
        assert!(matches!(err, Error::UnknownAuthnType(kind) if kind == "winrm"));
    }

    #[tokio::test]
    async fn dial_failure_is_attributed_to_the_hop() {
        let log = TargetLog::default();
        let proxy = spawn_socks5(log.clone()).await;

        // Reserve a port and close it so the connect is refused.
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed = closed.local_addr().unwrap();

        let dialer = chain(&[proxy_hop(format!("socks5://{}:1", proxy.ip()))]).await.unwrap();
        let err = dialer
            .dial("127.0.0.1", closed.port())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains(&format!("{}:1", proxy.ip())));
        dialer.close().await.unwrap();

        // The hop itself was unreachable, so nothing was asked to reach the
        // target.
        assert!(log.lock().unwrap().is_empty());
    }
}
