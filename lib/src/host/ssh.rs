use anyhow::anyhow;
use anyhow::bail;
use anyhow::ensure;
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use camino::Utf8Path;
use chrono::DateTime;
use chrono::Utc;
use russh::client::Handle;
use russh::client::Msg;
use russh::Channel;
use russh::ChannelMsg;
use russh_sftp::client::SftpSession;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::codec;
use super::ensure_command;
use super::walk_local;
use super::Host;
use super::HostOptions;
use super::HostStatus;
use super::RemoteDirectory;
use super::RemoteFileInfo;
use super::Terminal;
use super::TerminalImpl;
use crate::dial;
use crate::dial::ssh::HostKeyHandler;
use crate::dial::Dial;
use crate::dial::DialerImpl;
use crate::util;
use crate::Error;

/// SSH-backed host. Every operation opens a fresh session channel bound to
/// the host's cancellation token; cancellation kills the remote process.
pub struct SshHost {
    handle: Mutex<Handle<HostKeyHandler>>,
    proxies: DialerImpl,
    cancel: CancellationToken,
    platform: &'static str,
}

impl SshHost {
    pub async fn connect(opts: &HostOptions, cancel: CancellationToken) -> Result<Self> {
        ensure!(opts.host.authn.kind == super::AuthnKind::Ssh, "invalid type");
        ensure!(!opts.host.address.is_empty(), "no address specified");

        let proxies = dial::chain(&opts.proxies).await.with_context(|| {
            format!("failed to dial {} via proxies", opts.host.address)
        })?;

        let handle = match Self::dial_target(&proxies, opts).await {
            Ok(handle) => handle,
            Err(err) => {
                let _ = proxies.close().await;
                return Err(err);
            }
        };

        Ok(Self {
            handle: Mutex::new(handle),
            proxies,
            cancel,
            platform: "linux",
        })
    }

    async fn dial_target(
        proxies: &DialerImpl,
        opts: &HostOptions,
    ) -> Result<Handle<HostKeyHandler>> {
        let parsed = opts.host.parse_address()?;
        let port = parsed.port_or(22);

        let stream = proxies
            .dial(&parsed.host, port)
            .await
            .with_context(|| format!("failed to dial {}", opts.host.address))?;

        dial::ssh::handshake(stream, &opts.host, &parsed.host, port)
            .await
            .with_context(|| format!("failed to dial {}", opts.host.address))
    }

    /// Opens a new session channel. Channel open doubles as the liveness
    /// probe: a dead transport fails here instead of hanging a command.
    async fn session(&self) -> Result<Session> {
        let mut handle = self.handle.lock().await;

        let opened = tokio::select! {
            opened = handle.channel_open_session() => Some(opened),
            () = self.cancel.cancelled() => None,
        };
        drop(handle);

        match opened {
            Some(channel) => Ok(Session {
                channel: channel.context("disconnected")?,
                cancel: self.cancel.clone(),
            }),
            None => Err(Error::Canceled.into()),
        }
    }

    async fn sftp(&self) -> Result<SftpSession> {
        let session = self.session().await?;
        let mut channel = session.channel;

        channel
            .request_subsystem(true, "sftp")
            .await
            .context("failed to request sftp subsystem")?;

        SftpSession::new(channel.into_stream())
            .await
            .context("failed to start sftp session")
    }
}

#[async_trait]
impl Host for SshHost {
    async fn state(&self) -> Result<HostStatus> {
        let mut terminal = self.shell().await?;

        let probe = async {
            let os = terminal
                .execute_with_output("uname", &["-s"])
                .await
                .context("failed to get os")?;
            let os = String::from_utf8_lossy(&os).trim().to_lowercase();

            let arch = terminal
                .execute_with_output("uname", &["-m"])
                .await
                .context("failed to get arch")?;
            let arch = normalize_arch(String::from_utf8_lossy(&arch).trim().to_lowercase());

            let version = terminal
                .execute_with_output("uname", &["-r"])
                .await
                .context("failed to get kernel version")?;
            let version = String::from_utf8_lossy(&version).trim().to_lowercase();

            Ok(HostStatus {
                accessible: true,
                os,
                arch,
                version,
            })
        }
        .await;

        let _ = terminal.close().await;
        probe
    }

    async fn execute(&self, cmd: &str, args: &[&str]) -> Result<()> {
        ensure_command(cmd)?;

        let command = codec::encode_exec_input(self.platform, cmd, args);
        let mut session = self.session().await?;
        let mut sink = Vec::new();
        session.run(&command, &mut sink).await
    }

    async fn execute_with_output(&self, cmd: &str, args: &[&str]) -> Result<Vec<u8>> {
        ensure_command(cmd)?;

        let command = codec::encode_exec_input(self.platform, cmd, args);
        let mut session = self.session().await?;
        let mut output = Vec::new();
        session.run(&command, &mut output).await?;
        Ok(output)
    }

    async fn shell(&self) -> Result<TerminalImpl> {
        let mut session = self.session().await?;

        let command = codec::encode_exec_input(self.platform, "/bin/sh", &[]);
        session
            .channel
            .exec(true, command.as_str())
            .await
            .context("failed to start shell")?;

        Ok(SshTerminal {
            session,
            echo: format!("#{}#", util::id::hex(8)),
            platform: self.platform,
            pending: Vec::new(),
            eof: false,
        }
        .into())
    }

    async fn upload_file(&self, from: &Utf8Path, to: &str) -> Result<()> {
        ensure!(!to.is_empty(), "blank remote file path");

        let sftp = self.sftp().await?;
        let result = async {
            let mut src = tokio::fs::File::open(from)
                .await
                .with_context(|| format!("failed to open {from}"))?;
            let mut dst = sftp
                .create(to)
                .await
                .with_context(|| format!("failed to create remote file {to}"))?;

            copy_pooled(&mut src, &mut dst).await?;
            dst.shutdown().await?;
            Ok(())
        }
        .await;

        let _ = sftp.close().await;
        result
    }

    async fn upload_directory(&self, from: &Utf8Path, to: &str) -> Result<()> {
        ensure!(!to.is_empty(), "blank remote directory path");

        let entries = walk_local(from)?;

        let sftp = self.sftp().await?;
        let result = async {
            mkdir_all(&sftp, to).await?;

            for (rel, is_dir) in &entries {
                let remote = format!("{to}/{rel}");
                if *is_dir {
                    mkdir_all(&sftp, &remote).await?;
                    continue;
                }

                let mut src = tokio::fs::File::open(from.join(rel))
                    .await
                    .with_context(|| format!("failed to open {}", from.join(rel)))?;
                let mut dst = sftp
                    .create(&remote)
                    .await
                    .with_context(|| format!("failed to create remote file {remote}"))?;
                copy_pooled(&mut src, &mut dst).await?;
                dst.shutdown().await?;
            }

            Ok(())
        }
        .await;

        let _ = sftp.close().await;
        result
    }

    async fn download_file(&self, from: &str) -> Result<Vec<u8>> {
        ensure!(!from.is_empty(), "blank remote file path");

        let sftp = self.sftp().await?;
        let result = async {
            let meta = sftp
                .metadata(from)
                .await
                .with_context(|| format!("failed to stat remote path {from}"))?;
            ensure!(!meta.is_dir(), "remote path is not a file");

            let mut file = sftp
                .open(from)
                .await
                .with_context(|| format!("failed to open remote file {from}"))?;
            let mut content = Vec::new();
            file.read_to_end(&mut content).await?;
            Ok(content)
        }
        .await;

        let _ = sftp.close().await;
        result
    }

    async fn download_directory(&self, from: &str) -> Result<RemoteDirectory> {
        ensure!(!from.is_empty(), "blank remote directory path");

        let sftp = self.sftp().await?;
        let meta = match sftp.metadata(from).await {
            Ok(meta) => meta,
            Err(err) => {
                let _ = sftp.close().await;
                return Err(err).with_context(|| format!("failed to stat remote path {from}"));
            }
        };
        if !meta.is_dir() {
            let _ = sftp.close().await;
            bail!("remote path is not a directory");
        }

        Ok(RemoteDirectory::Ssh(SshDirectory {
            sftp,
            root: from.to_string(),
        }))
    }

    async fn close(&self) -> Result<()> {
        let mut handle = self.handle.lock().await;
        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "", "English")
            .await;
        drop(handle);

        self.proxies.close().await
    }
}

// Session --------------------------------------------------------------------

/// One session channel plus the cancellation token governing it.
struct Session {
    channel: Channel<Msg>,
    cancel: CancellationToken,
}

impl Session {
    /// Waits for the next channel message. On cancellation the remote
    /// process group is killed before surfacing [`Error::Canceled`].
    async fn next_msg(&mut self) -> Result<Option<ChannelMsg>> {
        let next = tokio::select! {
            msg = self.channel.wait() => Some(msg),
            () = self.cancel.cancelled() => None,
        };

        match next {
            Some(msg) => Ok(msg),
            None => {
                let _ = self.channel.signal(russh::Sig::KILL).await;
                Err(Error::Canceled.into())
            }
        }
    }

    /// Runs one command to completion, collecting combined stdout and
    /// stderr into `out`.
    async fn run(&mut self, command: &str, out: &mut Vec<u8>) -> Result<()> {
        self.channel.exec(true, command).await?;

        let mut status = None;
        loop {
            let Some(msg) = self.next_msg().await? else {
                break;
            };

            match msg {
                ChannelMsg::Data { ref data } => out.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => out.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => {
                    status = Some(exit_status);
                    // more data may still arrive after the status
                }
                _ => {}
            }
        }

        match status {
            Some(0) => Ok(()),
            Some(code) => Err(Error::exit_status(code).into()),
            None => Err(anyhow!("program did not exit cleanly")),
        }
    }
}

// Terminal -------------------------------------------------------------------

/// Interactive `/bin/sh` session with echo-marker framing.
pub struct SshTerminal {
    session: Session,
    echo: String,
    platform: &'static str,
    pending: Vec<u8>,
    eof: bool,
}

impl SshTerminal {
    async fn run(&mut self, out: &mut Vec<u8>, cmd: &str, args: &[&str]) -> Result<()> {
        ensure_command(cmd)?;

        let input = codec::encode_shell_input(self.platform, cmd, args, &self.echo);
        self.session
            .channel
            .data(input.as_bytes())
            .await
            .context("failed to write to shell")?;

        loop {
            while let Some(line) = codec::take_line(&mut self.pending) {
                match codec::decode_shell_output(&line, &self.echo) {
                    Some(result) => return result.map_err(Into::into),
                    None => out.extend_from_slice(line.as_bytes()),
                }
            }

            if self.eof {
                bail!("shell closed before the command completed");
            }

            match self.session.next_msg().await? {
                Some(ChannelMsg::Data { ref data }) => self.pending.extend_from_slice(data),
                Some(ChannelMsg::ExtendedData { ref data, ext: 1 }) => {
                    self.pending.extend_from_slice(data);
                }
                Some(_) => {}
                None => self.eof = true,
            }
        }
    }
}

#[async_trait]
impl Terminal for SshTerminal {
    async fn execute(&mut self, cmd: &str, args: &[&str]) -> Result<()> {
        let mut sink = Vec::new();
        self.run(&mut sink, cmd, args).await
    }

    async fn execute_with_output(&mut self, cmd: &str, args: &[&str]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.run(&mut out, cmd, args).await?;
        Ok(out)
    }

    async fn close(&mut self) -> Result<()> {
        let _ = self.session.channel.eof().await;

        let mut status = None;
        loop {
            match self.session.channel.wait().await {
                Some(ChannelMsg::ExitStatus { exit_status }) => status = Some(exit_status),
                Some(_) => {}
                None => break,
            }
        }

        match status {
            Some(code) if code != 0 => Err(Error::exit_status(code).into()),
            _ => Ok(()),
        }
    }
}

// File transfer --------------------------------------------------------------

/// Lazy handle over a remote directory, backed by a dedicated SFTP session.
pub struct SshDirectory {
    sftp: SftpSession,
    root: String,
}

impl SshDirectory {
    fn join(&self, name: &str) -> String {
        if name.is_empty() || name == "." {
            self.root.clone()
        } else {
            format!("{}/{name}", self.root)
        }
    }

    pub async fn stat(&self, name: &str) -> Result<RemoteFileInfo> {
        let path = self.join(name);
        let meta = self
            .sftp
            .metadata(&path)
            .await
            .with_context(|| format!("failed to stat remote path {path}"))?;

        Ok(RemoteFileInfo {
            name: path,
            size: meta.size.unwrap_or(0),
            modified: meta
                .mtime
                .and_then(|secs| DateTime::<Utc>::from_timestamp(i64::from(secs), 0)),
            dir: meta.is_dir(),
        })
    }

    pub async fn read_dir(&self, name: &str) -> Result<Vec<RemoteFileInfo>> {
        let path = self.join(name);
        let entries = self
            .sftp
            .read_dir(&path)
            .await
            .with_context(|| format!("failed to list remote directory {path}"))?;

        Ok(entries
            .into_iter()
            .map(|entry| {
                let meta = entry.metadata();
                RemoteFileInfo {
                    name: entry.file_name(),
                    size: meta.size.unwrap_or(0),
                    modified: meta
                        .mtime
                        .and_then(|secs| DateTime::<Utc>::from_timestamp(i64::from(secs), 0)),
                    dir: meta.is_dir(),
                }
            })
            .collect())
    }

    pub async fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.join(name);
        let mut file = self
            .sftp
            .open(&path)
            .await
            .with_context(|| format!("failed to open remote file {path}"))?;

        let mut content = Vec::new();
        file.read_to_end(&mut content).await?;
        Ok(content)
    }

    pub async fn close(self) -> Result<()> {
        let _ = self.sftp.close().await;
        Ok(())
    }
}

async fn mkdir_all(sftp: &SftpSession, path: &str) -> Result<()> {
    let absolute = path.starts_with('/');
    let mut current = String::new();

    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if current.is_empty() {
            if absolute {
                current = format!("/{segment}");
            } else {
                current = segment.to_string();
            }
        } else {
            current = format!("{current}/{segment}");
        }

        if sftp.metadata(&current).await.is_ok() {
            continue;
        }

        if let Err(err) = sftp.create_dir(&current).await {
            // Lost the race against another writer, or the server reports
            // an existing path differently.
            if sftp.metadata(&current).await.is_ok() {
                debug!(path = %current, "remote directory already exists");
                continue;
            }
            return Err(err).with_context(|| format!("failed to create remote directory {current}"));
        }
    }

    Ok(())
}

/// Copies using a pooled buffer, releasing it on every exit path.
async fn copy_pooled<R, W>(src: &mut R, dst: &mut W) -> Result<u64>
where
    R: tokio::io::AsyncRead + Unpin + ?Sized,
    W: tokio::io::AsyncWrite + Unpin + ?Sized,
{
    let mut buf = util::pool::shared().get(0);
    let mut total = 0u64;

    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n]).await?;
        total += n as u64;
    }

    Ok(total)
}

fn normalize_arch(arch: String) -> String {
    match arch.as_str() {
        "x86_64" => "amd64".to_string(),
        "i386" | "i686" | "x86" => "386".to_string(),
        _ if arch.ends_with("aarch64") || arch.ends_with("armv8") => "arm64".to_string(),
        _ if arch.starts_with("riscv") => "riscv64".to_string(),
        _ if arch.starts_with("arm") => "arm".to_string(),
        _ => arch,
    }
}
