//! Remote host capability: state probing, command execution, interactive
//! shells and file transfer over SSH or WinRM.

use anyhow::bail;
use anyhow::ensure;
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use chrono::DateTime;
use chrono::Utc;
use enum_dispatch::enum_dispatch;
use serde::Deserialize;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::Error;

pub mod codec;
pub mod ssh;
pub mod winrm;

// Options --------------------------------------------------------------------

/// How to reach and authenticate against one remote endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostOption {
    /// Address in the form `[scheme://](ip|dns)[:port]`.
    pub address: String,
    pub authn: HostAuthn,
    #[serde(default)]
    pub insecure: bool,
}

/// Authentication descriptor for a host or a proxy hop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostAuthn {
    #[serde(rename = "type")]
    pub kind: AuthnKind,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub agent: bool,
}

/// Closed set of authn tags. Hosts accept `ssh`/`winrm`, proxy hops accept
/// `ssh`/`proxy`, artifact and runtime sources accept `basic`/`bearer`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum::EnumString,
    strum::Display,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum AuthnKind {
    Ssh,
    Winrm,
    Proxy,
    Basic,
    Bearer,
}

/// A target endpoint plus the ordered proxy hops in front of it; the first
/// hop is nearest to the operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostOptions {
    #[serde(flatten)]
    pub host: HostOption,
    #[serde(default)]
    pub proxies: Vec<HostOption>,
}

// Address --------------------------------------------------------------------

/// Endpoint address parsed once per connection attempt. A zero port means
/// the protocol default applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAddress {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl HostAddress {
    #[must_use]
    pub fn port_or(&self, default: u16) -> u16 {
        if self.port == 0 {
            default
        } else {
            self.port
        }
    }
}

impl HostOption {
    /// Parses the raw address. `scheme://host[:port]` forms go through a
    /// URL parser; bare `host[:port]` forms are split directly.
    pub fn parse_address(&self) -> Result<HostAddress> {
        let raw = self.address.as_str();

        if raw.contains("://") {
            let url = url::Url::parse(raw)
                .with_context(|| format!("failed to parse address {raw}"))?;
            let host = url
                .host_str()
                .with_context(|| format!("address {raw} has no host"))?
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();

            return Ok(HostAddress {
                scheme: url.scheme().to_string(),
                host,
                port: url.port().unwrap_or(0),
            });
        }

        let (host, port) = split_host_port(raw)
            .with_context(|| format!("failed to parse address {raw}"))?;

        Ok(HostAddress {
            scheme: String::new(),
            host,
            port,
        })
    }
}

fn split_host_port(raw: &str) -> Result<(String, u16)> {
    if let Some(rest) = raw.strip_prefix('[') {
        let (host, rest) = rest.split_once(']').context("unclosed bracket")?;
        let port = match rest.strip_prefix(':') {
            Some(port) => port.parse::<u16>().context("invalid port")?,
            None => 0,
        };
        return Ok((host.to_string(), port));
    }

    // A lone colon separates the port; multiple colons mean a bare IPv6
    // address without a port.
    if raw.bytes().filter(|b| *b == b':').count() == 1 {
        let (host, port) = raw.split_once(':').expect("colon counted");
        let port = port.parse::<u16>().context("invalid port")?;
        return Ok((host.to_string(), port));
    }

    Ok((raw.to_string(), 0))
}

// Capability -----------------------------------------------------------------

/// Status of one remote host.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HostStatus {
    pub accessible: bool,
    pub os: String,
    pub arch: String,
    pub version: String,
}

/// Metadata of one remote file.
#[derive(Debug, Clone)]
pub struct RemoteFileInfo {
    pub name: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub dir: bool,
}

/// A live, authenticated connection to one machine.
///
/// Owned exclusively by the caller that created it and must be closed
/// exactly once; each shell or file transfer acquires its own underlying
/// session.
#[async_trait]
#[enum_dispatch]
pub trait Host {
    /// Probes the host for OS, architecture and kernel version.
    async fn state(&self) -> Result<HostStatus>;

    /// Executes a one-shot command to completion.
    async fn execute(&self, cmd: &str, args: &[&str]) -> Result<()>;

    /// Executes a one-shot command and returns combined stdout and stderr.
    async fn execute_with_output(&self, cmd: &str, args: &[&str]) -> Result<Vec<u8>>;

    /// Starts an interactive shell terminal.
    async fn shell(&self) -> Result<TerminalImpl>;

    /// Uploads a local file to the given remote path.
    async fn upload_file(&self, from: &Utf8Path, to: &str) -> Result<()>;

    /// Uploads a local directory tree to the given remote path.
    async fn upload_directory(&self, from: &Utf8Path, to: &str) -> Result<()>;

    /// Downloads a remote file. A missing or non-file path is an error.
    async fn download_file(&self, from: &str) -> Result<Vec<u8>>;

    /// Opens a remote directory handle. A missing or non-directory path is
    /// an error.
    async fn download_directory(&self, from: &str) -> Result<RemoteDirectory>;

    /// Releases the connection and its proxy chain.
    async fn close(&self) -> Result<()>;
}

/// All host implementations.
#[enum_dispatch(Host)]
pub enum HostImpl {
    Ssh(ssh::SshHost),
    Winrm(winrm::WinrmHost),
}

impl std::fmt::Debug for HostImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let variant = match self {
            HostImpl::Ssh(_) => "Ssh",
            HostImpl::Winrm(_) => "Winrm",
        };
        f.debug_tuple("HostImpl").field(&variant).finish()
    }
}

/// An interactive multi-command session layered on one host connection.
///
/// Lifetime is strictly nested inside the owning host's lifetime; not
/// reusable after close.
#[async_trait]
#[enum_dispatch]
pub trait Terminal {
    /// Executes a command inside the running shell.
    async fn execute(&mut self, cmd: &str, args: &[&str]) -> Result<()>;

    /// Executes a command inside the running shell and returns its output.
    async fn execute_with_output(&mut self, cmd: &str, args: &[&str]) -> Result<Vec<u8>>;

    /// Ends the shell and releases its session.
    async fn close(&mut self) -> Result<()>;
}

/// All terminal implementations.
#[enum_dispatch(Terminal)]
pub enum TerminalImpl {
    Ssh(ssh::SshTerminal),
    Winrm(winrm::WinrmTerminal),
}

/// Lazy handle over a remote directory.
pub enum RemoteDirectory {
    Ssh(ssh::SshDirectory),
    Winrm(winrm::WinrmDirectory),
}

impl RemoteDirectory {
    pub async fn stat(&self, name: &str) -> Result<RemoteFileInfo> {
        match self {
            RemoteDirectory::Ssh(dir) => dir.stat(name).await,
            RemoteDirectory::Winrm(dir) => dir.stat(name).await,
        }
    }

    pub async fn read_dir(&self, name: &str) -> Result<Vec<RemoteFileInfo>> {
        match self {
            RemoteDirectory::Ssh(dir) => dir.read_dir(name).await,
            RemoteDirectory::Winrm(dir) => dir.read_dir(name).await,
        }
    }

    pub async fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        match self {
            RemoteDirectory::Ssh(dir) => dir.read_file(name).await,
            RemoteDirectory::Winrm(dir) => dir.read_file(name).await,
        }
    }

    pub async fn close(self) -> Result<()> {
        match self {
            RemoteDirectory::Ssh(dir) => dir.close().await,
            RemoteDirectory::Winrm(dir) => dir.close().await,
        }
    }
}

/// Connects to the target described by `opts`, selecting the protocol
/// solely by the authn tag. The token cancels in-flight operations; for
/// SSH, cancellation kills the remote process.
pub async fn connect(opts: &HostOptions, cancel: CancellationToken) -> Result<HostImpl> {
    ensure!(!opts.host.address.is_empty(), "no address specified");

    match opts.host.authn.kind {
        AuthnKind::Ssh => Ok(ssh::SshHost::connect(opts, cancel).await?.into()),
        AuthnKind::Winrm => Ok(winrm::WinrmHost::connect(opts, cancel).await?.into()),
        other => Err(Error::UnknownAuthnType(other.to_string()).into()),
    }
}

// Local walk -----------------------------------------------------------------

/// Collects a local directory tree depth-first, directories before their
/// contents, entries sorted by name for deterministic upload order.
pub(crate) fn walk_local(root: &Utf8Path) -> Result<Vec<(Utf8PathBuf, bool)>> {
    fn recurse(
        root: &Utf8Path,
        rel: &Utf8Path,
        out: &mut Vec<(Utf8PathBuf, bool)>,
    ) -> Result<()> {
        let full = root.join(rel);
        let mut entries = full
            .read_dir_utf8()
            .with_context(|| format!("failed to read directory {full}"))?
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by(|a, b| a.file_name().cmp(b.file_name()));

        for entry in entries {
            let entry_rel = rel.join(entry.file_name());
            let kind = entry.file_type()?;
            if kind.is_dir() {
                out.push((entry_rel.clone(), true));
                recurse(root, &entry_rel, out)?;
            } else if kind.is_file() {
                out.push((entry_rel, false));
            }
        }

        Ok(())
    }

    ensure!(root.is_dir(), "{root} is not a directory");

    let mut out = Vec::new();
    recurse(root, Utf8Path::new(""), &mut out)?;
    Ok(out)
}

// Blank-command guard shared by both protocols.
pub(crate) fn ensure_command(cmd: &str) -> Result<()> {
    if cmd.is_empty() {
        bail!(Error::BlankCommand);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn option(address: &str) -> HostOption {
        HostOption {
            address: address.to_string(),
            authn: HostAuthn {
                kind: AuthnKind::Ssh,
                user: String::new(),
                secret: String::new(),
                agent: false,
            },
            insecure: false,
        }
    }

    #[rstest]
    #[case("ssh://10.0.0.4:22", "ssh", "10.0.0.4", 22)]
    #[case("ssh://10.0.0.4", "ssh", "10.0.0.4", 0)]
    #[case("winrm://box.example.com:5986", "winrm", "box.example.com", 5986)]
    #[case("https://proxy.example.com", "https", "proxy.example.com", 0)]
    #[case("10.0.0.4:2222", "", "10.0.0.4", 2222)]
    #[case("10.0.0.4", "", "10.0.0.4", 0)]
    #[case("box.example.com", "", "box.example.com", 0)]
    #[case("[::1]:22", "", "::1", 22)]
    #[case("::1", "", "::1", 0)]
    fn parse_address_works(
        #[case] address: &str,
        #[case] scheme: &str,
        #[case] host: &str,
        #[case] port: u16,
    ) {
        let parsed = option(address).parse_address().unwrap();
        assert_eq!(parsed.scheme, scheme);
        assert_eq!(parsed.host, host);
        assert_eq!(parsed.port, port);
    }

    #[rstest]
    #[case("10.0.0.4:notaport")]
    #[case("[::1:22")]
    fn parse_address_rejects(#[case] address: &str) {
        assert!(option(address).parse_address().is_err());
    }

    #[test]
    fn port_defaulting() {
        let parsed = option("ssh://10.0.0.4").parse_address().unwrap();
        assert_eq!(parsed.port_or(22), 22);

        let parsed = option("ssh://10.0.0.4:2222").parse_address().unwrap();
        assert_eq!(parsed.port_or(22), 2222);
    }

    #[rstest]
    #[case("ssh", AuthnKind::Ssh)]
    #[case("winrm", AuthnKind::Winrm)]
    #[case("PROXY", AuthnKind::Proxy)]
    fn authn_kind_parses(#[case] tag: &str, #[case] should: AuthnKind) {
        let kind: AuthnKind = tag.parse().unwrap();
        assert_eq!(kind, should);
    }

    #[tokio::test]
    async fn connect_rejects_unknown_authn() {
        let mut opt = option("10.0.0.4");
        opt.authn.kind = AuthnKind::Basic;
        let opts = HostOptions {
            host: opt,
            proxies: Vec::new(),
        };

        let err = connect(&opts, CancellationToken::new()).await.unwrap_err();
        let err = err.downcast_ref::<Error>().expect("typed error");
        assert!(matches!(err, Error::UnknownAuthnType(kind) if kind == "basic"));
    }

    #[tokio::test]
    async fn connect_rejects_blank_address() {
        let opts = HostOptions {
            host: option(""),
            proxies: Vec::new(),
        };

        assert!(connect(&opts, CancellationToken::new()).await.is_err());
    }
}
