use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use anyhow::ensure;
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use russh::client::Handle;
use russh::keys::key::PrivateKeyWithHashAlg;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::error;
use tracing::warn;

use super::BoxedStream;
use super::Dial;
use super::DialerImpl;
use crate::host::HostAuthn;
use crate::host::HostOption;

/// Dialer that tunnels through an SSH bastion via direct-tcpip channels.
pub struct SshTunnelDialer {
    handle: Mutex<Handle<HostKeyHandler>>,
    forward: Box<DialerImpl>,
    address: String,
}

impl SshTunnelDialer {
    /// Dials the hop through `forward` and performs the SSH handshake.
    /// On failure the forward chain is closed before returning.
    pub async fn connect(forward: DialerImpl, hop: &HostOption) -> Result<Self> {
        match Self::connect_inner(&forward, hop).await {
            Ok(handle) => Ok(Self {
                handle: Mutex::new(handle),
                forward: Box::new(forward),
                address: hop.address.clone(),
            }),
            Err(err) => {
                let _ = forward.close().await;
                Err(err.context(format!("failed to dial {} via SSH", hop.address)))
            }
        }
    }

    async fn connect_inner(
        forward: &DialerImpl,
        hop: &HostOption,
    ) -> Result<Handle<HostKeyHandler>> {
        let parsed = hop.parse_address()?;
        let port = parsed.port_or(22);

        let stream = forward.dial(&parsed.host, port).await?;

        handshake(stream, hop, &parsed.host, port).await
    }
}

#[async_trait]
impl Dial for SshTunnelDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream> {
        let mut handle = self.handle.lock().await;
        let channel = handle
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .with_context(|| {
                format!("failed to open tunnel to {host}:{port} via {}", self.address)
            })?;

        Ok(Box::new(channel.into_stream()))
    }

    async fn close(&self) -> Result<()> {
        let mut handle = self.handle.lock().await;
        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "", "English")
            .await;
        drop(handle);

        self.forward.close().await
    }
}

/// Performs the SSH handshake and authentication over an established
/// stream. Shared by the tunnel dialer and the SSH host.
pub(crate) async fn handshake(
    stream: BoxedStream,
    opt: &HostOption,
    host: &str,
    port: u16,
) -> Result<Handle<HostKeyHandler>> {
    let config = Arc::new(russh::client::Config {
        keepalive_interval: Some(Duration::from_secs(15)),
        ..Default::default()
    });

    let handler = HostKeyHandler {
        host: host.to_string(),
        port,
        insecure: opt.insecure,
    };

    let mut handle = russh::client::connect_stream(config, stream, handler)
        .await
        .context("SSH handshake failed")?;

    authenticate(&mut handle, &opt.authn).await?;

    Ok(handle)
}

async fn authenticate(handle: &mut Handle<HostKeyHandler>, authn: &HostAuthn) -> Result<()> {
    if authn.agent {
        return authenticate_agent(handle, authn).await;
    }

    if authn.secret.is_empty() {
        let authenticated = handle.authenticate_none(&authn.user).await?;
        ensure!(authenticated.success(), "ssh authentication failed");
        return Ok(());
    }

    if authn.secret.contains("-----BEGIN") {
        ensure!(
            !authn.secret.contains("ENCRYPTED"),
            "encrypted private key is not supported"
        );

        let key = russh::keys::decode_secret_key(&authn.secret, None)
            .context("failed to parse private key")?;
        let hash_alg = match key.algorithm() {
            russh::keys::Algorithm::Rsa { hash } => hash,
            _else => None,
        };
        let key = PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg);

        let authenticated = handle.authenticate_publickey(&authn.user, key).await?;
        ensure!(authenticated.success(), "ssh authentication failed");
        return Ok(());
    }

    let authenticated = handle
        .authenticate_password(&authn.user, &authn.secret)
        .await?;
    ensure!(authenticated.success(), "ssh authentication failed");

    Ok(())
}

/// Iterates through all identities found in the SSH agent and returns on
/// the first authentication success, or failure if exhausted.
async fn authenticate_agent(
    handle: &mut Handle<HostKeyHandler>,
    authn: &HostAuthn,
) -> Result<()> {
    let socket = std::env::var("SSH_AUTH_SOCK").context("SSH_AUTH_SOCK is not set")?;
    let mut agent = russh::keys::agent::client::AgentClient::connect_uds(&socket)
        .await
        .context("failed to connect SSH agent")?;

    let identities = agent.request_identities().await?;

    for key in identities {
        let fingerprint = key.fingerprint(Default::default());
        let hash_alg = match key.algorithm() {
            russh::keys::Algorithm::Rsa { hash } => hash,
            _else => None,
        };
        let result = handle
            .authenticate_publickey_with(&authn.user, key, hash_alg, &mut agent)
            .await;
        match result {
            Ok(authenticated) => {
                if authenticated.success() {
                    return Ok(());
                }
                debug!(user = %authn.user, key = %fingerprint, "ssh agent auth denied");
            }
            Err(err) => error!(error = ?err, "ssh agent auth failed"),
        }
    }

    bail!("unable to authenticate with ssh agent");
}

/// Accepts any host key in insecure mode; otherwise requires a match in the
/// local known-hosts file.
#[derive(Debug)]
pub(crate) struct HostKeyHandler {
    host: String,
    port: u16,
    insecure: bool,
}

impl russh::client::Handler for HostKeyHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        if self.insecure {
            return Ok(true);
        }

        match russh::keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(known) => Ok(known),
            Err(err) => {
                warn!(error = ?err, host = %self.host, "host key verification failed");
                Ok(false)
            }
        }
    }
}
