use std::sync::Arc;

use anyhow::bail;
use anyhow::ensure;
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use camino::Utf8Path;
use chrono::NaiveDateTime;
use quick_xml::events::Event;
use quick_xml::Reader;
use tokio_util::sync::CancellationToken;
use tracing::warn;

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
use crate::util;
use crate::Error;

pub mod protocol;

use protocol::powershell;
use protocol::WinrmClient;

const PLATFORM: &str = "windows";

/// WinRM-backed host. The client connects per request, so construction
/// validates options and builds the proxy chain without touching the
/// network.
pub struct WinrmHost {
    client: Arc<WinrmClient>,
}

impl WinrmHost {
    pub async fn connect(opts: &HostOptions, cancel: CancellationToken) -> Result<Self> {
        ensure!(opts.host.authn.kind == super::AuthnKind::Winrm, "invalid type");
        ensure!(!opts.host.address.is_empty(), "no address specified");

        if opts.host.authn.agent {
            return Err(Error::Unsupported("winrm NTLM authentication").into());
        }

        let proxies = dial::chain(&opts.proxies).await.with_context(|| {
            format!("failed to dial {} via proxies", opts.host.address)
        })?;

        let parsed = match opts.host.parse_address() {
            Ok(parsed) => parsed,
            Err(err) => {
                let _ = dial::Dial::close(&proxies).await;
                return Err(err);
            }
        };

        let client = WinrmClient::new(
            proxies,
            parsed.host.clone(),
            parsed.port_or(5985),
            parsed.scheme == "https",
            opts.host.insecure,
            opts.host.authn.user.clone(),
            opts.host.authn.secret.clone(),
            cancel,
        );

        Ok(Self {
            client: Arc::new(client),
        })
    }

    /// Runs one command in a fresh shell, combined output into `out`.
    async fn run(&self, out: &mut Vec<u8>, cmd: &str, args: &[&str]) -> Result<()> {
        ensure_command(cmd)?;

        let command = codec::encode_shell_input(PLATFORM, cmd, args, "");
        let shell_id = self.client.create_shell().await?;

        let result = self.client.run_command(&shell_id, &command, out).await;
        let _ = self.client.delete_shell(&shell_id).await;
        result
    }
}

#[async_trait]
impl Host for WinrmHost {
    async fn state(&self) -> Result<HostStatus> {
        let mut terminal = self.shell().await?;

        let probe = async {
            // Numeric processor architecture, per Win32_Processor.
            let arch = terminal
                .execute_with_output(
                    &powershell(
                        "Get-WmiObject Win32_Processor -Property Architecture | \
                         Select-Object -ExpandProperty Architecture",
                    ),
                    &[],
                )
                .await
                .context("failed to get arch")?;
            let arch = map_processor_arch(String::from_utf8_lossy(&arch).trim());

            let version = terminal
                .execute_with_output(
                    &powershell(
                        "Get-WmiObject Win32_OperatingSystem -Property Version | \
                         Select-Object -ExpandProperty Version",
                    ),
                    &[],
                )
                .await
                .context("failed to get kernel version")?;
            let version = String::from_utf8_lossy(&version).trim().to_lowercase();

            Ok(HostStatus {
                accessible: true,
                os: PLATFORM.to_string(),
                arch: arch.to_string(),
                version,
            })
        }
        .await;

        let _ = terminal.close().await;
        probe
    }

    async fn execute(&self, cmd: &str, args: &[&str]) -> Result<()> {
        let mut sink = Vec::new();
        self.run(&mut sink, cmd, args).await
    }

    async fn execute_with_output(&self, cmd: &str, args: &[&str]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.run(&mut out, cmd, args).await?;
        Ok(out)
    }

    async fn shell(&self) -> Result<TerminalImpl> {
        let shell_id = self.client.create_shell().await?;

        let command_id = match self.client.command(&shell_id, "powershell.exe").await {
            Ok(command_id) => command_id,
            Err(err) => {
                let _ = self.client.delete_shell(&shell_id).await;
                return Err(err);
            }
        };

        Ok(WinrmTerminal {
            client: self.client.clone(),
            shell_id,
            command_id,
            echo: format!("#{}#", util::id::hex(8)),
            pending: Vec::new(),
        }
        .into())
    }

    async fn upload_file(&self, from: &Utf8Path, to: &str) -> Result<()> {
        ensure!(!to.is_empty(), "blank remote file path");

        let transport = FileTransport::open(self.client.clone()).await?;
        let result = transport.upload(from, to).await;
        let _ = transport.close().await;
        result
    }

    async fn upload_directory(&self, from: &Utf8Path, to: &str) -> Result<()> {
        ensure!(!to.is_empty(), "blank remote directory path");

        let entries = walk_local(from)?;

        let transport = FileTransport::open(self.client.clone()).await?;
        let result = async {
            transport.mkdir_all(to).await?;

            for (rel, is_dir) in &entries {
                let remote = format!("{to}/{rel}");
                if *is_dir {
                    transport.mkdir_all(&remote).await?;
                } else {
                    transport.upload(&from.join(rel), &remote).await?;
                }
            }

            Ok(())
        }
        .await;

        let _ = transport.close().await;
        result
    }

    async fn download_file(&self, from: &str) -> Result<Vec<u8>> {
        ensure!(!from.is_empty(), "blank remote file path");

        Err(Error::Unsupported("winrm file read").into())
    }

    async fn download_directory(&self, from: &str) -> Result<RemoteDirectory> {
        ensure!(!from.is_empty(), "blank remote directory path");

        let transport = FileTransport::open(self.client.clone()).await?;
        Ok(RemoteDirectory::Winrm(WinrmDirectory {
            transport,
            root: from.to_string(),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.client.close().await
    }
}

// Terminal -------------------------------------------------------------------

/// Interactive `powershell.exe` session with echo-marker framing, stdin
/// fed through Send messages and output drained through Receive polls.
pub struct WinrmTerminal {
    client: Arc<WinrmClient>,
    shell_id: String,
    command_id: String,
    echo: String,
    pending: Vec<u8>,
}

impl WinrmTerminal {
    async fn run(&mut self, out: &mut Vec<u8>, cmd: &str, args: &[&str]) -> Result<()> {
        ensure_command(cmd)?;

        let input = codec::encode_shell_input(PLATFORM, cmd, args, &self.echo);
        self.client
            .send_stdin(&self.shell_id, &self.command_id, input.as_bytes(), false)
            .await
            .context("failed to write to shell")?;

        loop {
            while let Some(line) = codec::take_line(&mut self.pending) {
                match codec::decode_shell_output(&line, &self.echo) {
                    Some(result) => return result.map_err(Into::into),
                    None => out.extend_from_slice(line.as_bytes()),
                }
            }

            let received = match self.client.receive(&self.shell_id, &self.command_id).await {
                Ok(received) => received,
                Err(err) => {
                    if protocol::is_canceled(&err) {
                        let _ = self.client.signal(&self.shell_id, &self.command_id).await;
                    }
                    return Err(err);
                }
            };

            self.pending.extend_from_slice(&received.stdout);
            self.pending.extend_from_slice(&received.stderr);

            if received.done {
                bail!("shell terminated before the command completed");
            }
        }
    }
}

#[async_trait]
impl Terminal for WinrmTerminal {
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
        let _ = self.client.signal(&self.shell_id, &self.command_id).await;
        self.client.delete_shell(&self.shell_id).await
    }
}

// File transfer --------------------------------------------------------------

/// File operations over one WinRM shell. WinRM has no file channel, so
/// files are written as base64 text lines and decoded in place on
/// finalize.
struct FileTransport {
    client: Arc<WinrmClient>,
    shell_id: String,
}

impl FileTransport {
    async fn open(client: Arc<WinrmClient>) -> Result<Self> {
        let shell_id = client.create_shell().await?;
        Ok(Self { client, shell_id })
    }

    async fn close(&self) -> Result<()> {
        self.client.delete_shell(&self.shell_id).await
    }

    async fn run(&self, command: &str, out: &mut Vec<u8>) -> Result<()> {
        self.client.run_command(&self.shell_id, command, out).await
    }

    async fn run_discard(&self, command: &str) -> Result<()> {
        let mut sink = Vec::new();
        self.run(command, &mut sink).await
    }

    async fn mkdir_all(&self, path: &str) -> Result<()> {
        let path = to_windows_path(path);
        self.run_discard(&powershell(&format!(
            "New-Item -Force -ItemType Directory -Path {path}"
        )))
        .await
        .with_context(|| format!("failed to create directory {path}"))
    }

    async fn upload(&self, from: &Utf8Path, to: &str) -> Result<()> {
        let mut writer = self.create(to).await?;

        let content = tokio::fs::read(from)
            .await
            .with_context(|| format!("failed to open {from}"))?;

        // Keep each appended line under the command length limit once the
        // path and base64 expansion are accounted for.
        let chunk = ((8000 - to.len()) / 4) * 3;
        for part in content.chunks(chunk.max(1)) {
            writer.write(part).await?;
        }

        writer.finalize().await
    }

    async fn create(&self, path: &str) -> Result<ChunkedWriter<'_>> {
        ensure!(!path.is_empty(), "blank path");

        let path = to_windows_path(path);
        self.run_discard(&powershell(&format!(
            "New-Item -Force -ItemType File -Path {path}"
        )))
        .await
        .with_context(|| format!("failed to create file {path}"))?;

        Ok(ChunkedWriter {
            transport: self,
            path,
            finalized: false,
        })
    }

    async fn stat(&self, path: &str) -> Result<RemoteFileInfo> {
        ensure!(!path.is_empty(), "blank path");

        let path = to_windows_path(path);
        let mut out = Vec::new();
        self.run(
            &powershell(&format!(
                "Get-ItemProperty -Path {path} | \
                 Select-Object -Property FullName,LastWriteTimeUtc,Attributes,Length | \
                 ConvertTo-Xml -NoTypeInformation -As String"
            )),
            &mut out,
        )
        .await
        .with_context(|| format!("failed to stat file {path}"))?;

        parse_stat(&String::from_utf8_lossy(&out))
    }
}

/// Two-phase remote file writer: accumulate base64 lines, then decode and
/// replace the file server-side exactly once.
struct ChunkedWriter<'a> {
    transport: &'a FileTransport,
    path: String,
    finalized: bool,
}

impl ChunkedWriter<'_> {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let encoded = STANDARD.encode(data);
        self.transport
            .run_discard(&format!("echo {encoded} >> \"{}\"", self.path))
            .await
            .with_context(|| format!("failed to append to {}", self.path))
    }

    /// Rewrites the base64 line file into its decoded content. Skipping
    /// this step leaves unusable text on the remote side, so failures get
    /// a dedicated error.
    async fn finalize(mut self) -> Result<()> {
        self.finalized = true;

        let script = format!(
            r#"$path = "{}"
if (Test-Path ${{path}} -Type Leaf) {{
    $rd = [System.IO.File]::OpenText(${{path}})
    $wr = [System.IO.File]::OpenWrite(${{path}}.tmp)
    try {{
        for(;;) {{
            $bs64 = $rd.ReadLine()
            if (${{bs64}} -eq $null) {{ break }}
            $bs = [System.Convert]::FromBase64String(${{bs64}})
            $wr.Write(${{bs}}, 0, ${{bs}}.Length)
        }}
        Move-Item -Path ${{path}}.tmp -Destination ${{path}} -Force
    }} finally {{
        $rd.Close()
        $wr.Close()
    }}
}} else {{
    throw [System.IO.FileNotFoundException]::new("could not find path: $path")
}}"#,
            self.path
        );

        match self.transport.run_discard(&powershell(&script)).await {
            Ok(()) => Ok(()),
            Err(err) => Err(err.context(Error::Unfinalized(self.path.clone()))),
        }
    }
}

impl Drop for ChunkedWriter<'_> {
    fn drop(&mut self) {
        if !self.finalized {
            // Data-loss risk: the remote path still holds base64 text.
            warn!(path = %self.path, "remote file dropped without finalize");
        }
    }
}

/// Lazy handle over a remote directory. Stat works; listing and raw reads
/// are documented WinRM limitations.
pub struct WinrmDirectory {
    transport: FileTransport,
    root: String,
}

impl WinrmDirectory {
    fn join(&self, name: &str) -> String {
        if name.is_empty() || name == "." {
            self.root.clone()
        } else {
            format!("{}/{name}", self.root)
        }
    }

    pub async fn stat(&self, name: &str) -> Result<RemoteFileInfo> {
        self.transport.stat(&self.join(name)).await
    }

    pub async fn read_dir(&self, _name: &str) -> Result<Vec<RemoteFileInfo>> {
        Err(Error::Unsupported("winrm directory listing").into())
    }

    pub async fn read_file(&self, _name: &str) -> Result<Vec<u8>> {
        Err(Error::Unsupported("winrm file read").into())
    }

    pub async fn close(self) -> Result<()> {
        self.transport.close().await
    }
}

// Helpers --------------------------------------------------------------------

fn to_windows_path(path: &str) -> String {
    let path = if path.contains(' ') {
        format!("'{}'", path.trim_matches(['\'', '"']))
    } else {
        path.to_string()
    };

    path.replace('/', "\\")
}

/// Maps the `Win32_Processor.Architecture` code to a canonical name.
/// Unmapped codes yield an empty string, not an error.
fn map_processor_arch(code: &str) -> &'static str {
    match code {
        "0" => "386",
        "1" => "mips",
        "2" => "alpha",
        "3" => "ppc",
        "5" => "arm",
        "6" => "ia64",
        "9" => "amd64",
        "12" => "arm64",
        _ => "",
    }
}

/// Parses the `ConvertTo-Xml` rendering of a `Get-ItemProperty` object.
fn parse_stat(xml: &str) -> Result<RemoteFileInfo> {
    let mut reader = Reader::from_str(xml);
    let mut property: Option<String> = None;
    let mut objects = 0usize;

    let mut info = RemoteFileInfo {
        name: String::new(),
        size: 0,
        modified: None,
        dir: false,
    };
    let mut seen = 0usize;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"Object" => objects += 1,
                b"Property" => {
                    property = e
                        .try_get_attribute("Name")
                        .ok()
                        .flatten()
                        .and_then(|attr| attr.unescape_value().ok())
                        .map(|value| value.into_owned());
                }
                _ => {}
            },
            Ok(Event::Text(t)) => {
                let Some(name) = property.as_deref() else {
                    continue;
                };
                let value = t.unescape().unwrap_or_default();
                let value = value.trim();
                seen += 1;

                match name {
                    "FullName" => info.name = value.to_string(),
                    "LastWriteTimeUtc" => {
                        let parsed = NaiveDateTime::parse_from_str(value, "%Y/%m/%d %H:%M:%S")
                            .with_context(|| format!("failed to parse file time {value}"))?;
                        info.modified = Some(parsed.and_utc());
                    }
                    "Attributes" => info.dir = value.contains("Directory"),
                    "Length" => {
                        info.size = value
                            .parse::<u64>()
                            .with_context(|| format!("failed to parse file length {value}"))?;
                    }
                    _ => seen -= 1,
                }
            }
            Ok(Event::End(e)) if e.local_name().as_ref() == b"Property" => property = None,
            Ok(Event::Eof) => break,
            Err(err) => return Err(err).context("failed to parse file info"),
            _ => {}
        }
    }

    ensure!(
        objects == 1 && seen > 0,
        "failed to parse file info: no object or no properties"
    );

    Ok(info)
}

#[cfg(test)]
mod tests {
    use chrono::Datelike;
    use chrono::Timelike;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("0", "386")]
    #[case("1", "mips")]
    #[case("5", "arm")]
    #[case("9", "amd64")]
    #[case("12", "arm64")]
    #[case("7", "")]
    #[case("garbage", "")]
    fn processor_arch_mapping(#[case] code: &str, #[case] should: &str) {
        assert_eq!(map_processor_arch(code), should);
    }

    #[rstest]
    #[case("/var/local/courier", r"\var\local\courier")]
    #[case("C:/Program Files/app", r"'C:\Program Files\app'")]
    #[case(r#""C:/quoted path""#, r"'C:\quoted path'")]
    fn windows_path_conversion(#[case] path: &str, #[case] should: &str) {
        assert_eq!(to_windows_path(path), should);
    }

    #[test]
    fn stat_output_parses() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<Objects>
 <Object>
   <Property Name="FullName">C:\Users\Administrator\test.txt</Property>
   <Property Name="LastWriteTimeUtc">2023/9/18 5:32:42</Property>
   <Property Name="Attributes">Archive</Property>
   <Property Name="Length">120</Property>
 </Object>
</Objects>"#;

        let info = parse_stat(xml).unwrap();
        assert_eq!(info.name, r"C:\Users\Administrator\test.txt");
        assert_eq!(info.size, 120);
        assert!(!info.dir);

        let modified = info.modified.unwrap();
        assert_eq!(
            (modified.year(), modified.month(), modified.day()),
            (2023, 9, 18)
        );
        assert_eq!(
            (modified.hour(), modified.minute(), modified.second()),
            (5, 32, 42)
        );
    }

    #[test]
    fn stat_directory_flag() {
        let xml = r#"<Objects><Object>
            <Property Name="FullName">C:\Users</Property>
            <Property Name="Attributes">Directory</Property>
        </Object></Objects>"#;

        let info = parse_stat(xml).unwrap();
        assert!(info.dir);
    }

    #[test]
    fn stat_rejects_empty_output() {
        assert!(parse_stat("<Objects></Objects>").is_err());
    }

    #[test]
    fn upload_chunk_size_accounts_for_path_and_encoding() {
        let to = "/var/local/courier/artifact/app/command";
        let chunk = ((8000 - to.len()) / 4) * 3;
        // The encoded line plus redirection must stay under the 8000 char
        // command limit.
        let encoded = STANDARD.encode(vec![0u8; chunk]);
        assert!(encoded.len() + to.len() + 16 < 8200);
    }
}
