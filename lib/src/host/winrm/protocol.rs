//! Minimal WS-Man client for the Windows shell resource, speaking SOAP
//! over HTTP/1.1 directly on a dialed stream so proxy chains apply.

use anyhow::bail;
use anyhow::ensure;
use anyhow::Context;
use anyhow::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use quick_xml::events::Event;
use quick_xml::Reader;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::dial::BoxedStream;
use crate::dial::Dial;
use crate::dial::DialerImpl;
use crate::Error;

pub(crate) const MAX_ENVELOPE_SIZE: usize = 153_600;
const OPERATION_TIMEOUT: &str = "PT60S";
const LOCALE: &str = "en-US";

const RESOURCE_URI: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";
const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_SEND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Send";
const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";
const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";

// The server reports this WSMan code when a Receive call outlives the
// operation timeout without producing output; the caller just polls again.
const FAULT_OPERATION_TIMEOUT: &str = "2150858793";

/// One WinRM endpoint. Connections are per-request; the dialer chain is
/// held for the lifetime of the client and closed with it.
pub(crate) struct WinrmClient {
    dialer: DialerImpl,
    host: String,
    port: u16,
    https: bool,
    insecure: bool,
    user: String,
    secret: String,
    cancel: CancellationToken,
}

/// Output of one Receive call.
#[derive(Debug, Default)]
pub(crate) struct Receive {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub done: bool,
    pub exit_code: Option<i64>,
}

impl WinrmClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dialer: DialerImpl,
        host: String,
        port: u16,
        https: bool,
        insecure: bool,
        user: String,
        secret: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            dialer,
            host,
            port,
            https,
            insecure,
            user,
            secret,
            cancel,
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.dialer.close().await
    }

    pub async fn create_shell(&self) -> Result<String> {
        let options = concat!(
            "<w:OptionSet>",
            "<w:Option Name=\"WINRS_NOPROFILE\">FALSE</w:Option>",
            "<w:Option Name=\"WINRS_CODEPAGE\">65001</w:Option>",
            "</w:OptionSet>"
        );
        let body = concat!(
            "<rsp:Shell>",
            "<rsp:InputStreams>stdin</rsp:InputStreams>",
            "<rsp:OutputStreams>stdout stderr</rsp:OutputStreams>",
            "</rsp:Shell>"
        );

        let envelope = self.envelope(ACTION_CREATE, None, options, body);
        let response = self.post(&envelope).await?;

        xml_text(&response, "ShellId")
            .or_else(|| xml_selector_text(&response, "ShellId"))
            .context("no ShellId in create response")
    }

    pub async fn delete_shell(&self, shell_id: &str) -> Result<()> {
        let envelope = self.envelope(ACTION_DELETE, Some(shell_id), "", "");
        self.post_teardown(&envelope).await.map(|_| ())
    }

    /// Starts a command inside the shell and returns its command id.
    pub async fn command(&self, shell_id: &str, command: &str) -> Result<String> {
        let options = concat!(
            "<w:OptionSet>",
            "<w:Option Name=\"WINRS_CONSOLEMODE_STDIN\">TRUE</w:Option>",
            "<w:Option Name=\"WINRS_SKIP_CMD_SHELL\">FALSE</w:Option>",
            "</w:OptionSet>"
        );
        let body = format!(
            "<rsp:CommandLine><rsp:Command>{}</rsp:Command></rsp:CommandLine>",
            xml_escape(command)
        );

        let envelope = self.envelope(ACTION_COMMAND, Some(shell_id), options, &body);
        let response = self.post(&envelope).await?;

        xml_text(&response, "CommandId").context("no CommandId in command response")
    }

    pub async fn send_stdin(
        &self,
        shell_id: &str,
        command_id: &str,
        data: &[u8],
        end: bool,
    ) -> Result<()> {
        let end = if end { " End=\"true\"" } else { "" };
        let body = format!(
            "<rsp:Send><rsp:Stream Name=\"stdin\" CommandId=\"{command_id}\"{end}>{}</rsp:Stream></rsp:Send>",
            STANDARD.encode(data)
        );

        let envelope = self.envelope(ACTION_SEND, Some(shell_id), "", &body);
        self.post(&envelope).await.map(|_| ())
    }

    /// Polls for output. Returns an empty result when the server reports
    /// an operation timeout so the caller can keep polling.
    pub async fn receive(&self, shell_id: &str, command_id: &str) -> Result<Receive> {
        let body = format!(
            "<rsp:Receive><rsp:DesiredStream CommandId=\"{command_id}\">stdout stderr</rsp:DesiredStream></rsp:Receive>"
        );

        let envelope = self.envelope(ACTION_RECEIVE, Some(shell_id), "", &body);
        let (status, response) = self.post_raw(&envelope, true).await?;

        if status != 200 {
            if response.contains(FAULT_OPERATION_TIMEOUT) {
                return Ok(Receive::default());
            }
            bail!(fault_error(status, &response));
        }

        Ok(parse_receive(&response))
    }

    /// Terminates a running command. Used on the teardown path, so it is
    /// not subject to cancellation itself.
    pub async fn signal(&self, shell_id: &str, command_id: &str) -> Result<()> {
        let body = format!(
            "<rsp:Signal CommandId=\"{command_id}\"><rsp:Code>{SIGNAL_TERMINATE}</rsp:Code></rsp:Signal>"
        );

        let envelope = self.envelope(ACTION_SIGNAL, Some(shell_id), "", &body);
        self.post_teardown(&envelope).await.map(|_| ())
    }

    /// Runs one command to completion inside the shell, collecting output
    /// into `out`. Cancellation terminates the remote command.
    pub async fn run_command(
        &self,
        shell_id: &str,
        command: &str,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let command_id = self.command(shell_id, command).await?;

        loop {
            let received = match self.receive(shell_id, &command_id).await {
                Ok(received) => received,
                Err(err) => {
                    if is_canceled(&err) {
                        let _ = self.signal(shell_id, &command_id).await;
                    }
                    return Err(err);
                }
            };

            out.extend_from_slice(&received.stdout);
            out.extend_from_slice(&received.stderr);

            if received.done {
                return match received.exit_code {
                    Some(code) if code != 0 => Err(Error::Exit(code.to_string()).into()),
                    _ => Ok(()),
                };
            }
        }
    }

    // HTTP -------------------------------------------------------------------

    async fn post(&self, envelope: &str) -> Result<String> {
        let (status, body) = self.post_raw(envelope, true).await?;
        if status != 200 {
            bail!(fault_error(status, &body));
        }
        Ok(body)
    }

    async fn post_teardown(&self, envelope: &str) -> Result<String> {
        let (status, body) = self.post_raw(envelope, false).await?;
        if status != 200 {
            bail!(fault_error(status, &body));
        }
        Ok(body)
    }

    async fn post_raw(&self, envelope: &str, cancelable: bool) -> Result<(u16, String)> {
        if cancelable {
            let response = tokio::select! {
                response = self.exchange(envelope) => Some(response),
                () = self.cancel.cancelled() => None,
            };
            match response {
                Some(response) => response,
                None => Err(Error::Canceled.into()),
            }
        } else {
            self.exchange(envelope).await
        }
    }

    async fn exchange(&self, envelope: &str) -> Result<(u16, String)> {
        let stream = self
            .dialer
            .dial(&self.host, self.port)
            .await
            .with_context(|| format!("failed to dial {}:{}", self.host, self.port))?;

        let mut stream: BoxedStream = if self.https {
            let connector = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(self.insecure)
                .danger_accept_invalid_hostnames(self.insecure)
                .build()
                .context("failed to build TLS connector")?;
            let connector = tokio_native_tls::TlsConnector::from(connector);
            Box::new(
                connector
                    .connect(&self.host, stream)
                    .await
                    .context("TLS handshake failed")?,
            )
        } else {
            stream
        };

        let credentials = STANDARD.encode(format!("{}:{}", self.user, self.secret));
        let head = format!(
            "POST /wsman HTTP/1.1\r\n\
             Host: {}:{}\r\n\
             Content-Type: application/soap+xml;charset=UTF-8\r\n\
             Authorization: Basic {credentials}\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n",
            self.host,
            self.port,
            envelope.len(),
        );

        stream.write_all(head.as_bytes()).await?;
        stream.write_all(envelope.as_bytes()).await?;
        stream.flush().await?;

        let mut raw = Vec::new();
        stream
            .read_to_end(&mut raw)
            .await
            .context("failed to read response")?;

        parse_http_response(&raw)
    }

    fn envelope(
        &self,
        action: &str,
        shell_id: Option<&str>,
        options: &str,
        body: &str,
    ) -> String {
        let message_id = uuid::Uuid::new_v4();
        let selectors = shell_id
            .map(|id| {
                format!(
                    "<w:SelectorSet><w:Selector Name=\"ShellId\">{id}</w:Selector></w:SelectorSet>"
                )
            })
            .unwrap_or_default();

        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <s:Envelope \
             xmlns:s=\"http://www.w3.org/2003/05/soap-envelope\" \
             xmlns:a=\"http://schemas.xmlsoap.org/ws/2004/08/addressing\" \
             xmlns:w=\"http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd\" \
             xmlns:rsp=\"http://schemas.microsoft.com/wbem/wsman/1/windows/shell\">\
             <s:Header>\
             <a:To>http://{host}:{port}/wsman</a:To>\
             <a:ReplyTo><a:Address mustUnderstand=\"true\">http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</a:Address></a:ReplyTo>\
             <w:MaxEnvelopeSize mustUnderstand=\"true\">{size}</w:MaxEnvelopeSize>\
             <a:MessageID>uuid:{message_id}</a:MessageID>\
             <w:Locale mustUnderstand=\"false\" xml:lang=\"{locale}\"/>\
             <w:OperationTimeout>{timeout}</w:OperationTimeout>\
             <w:ResourceURI mustUnderstand=\"true\">{resource}</w:ResourceURI>\
             <a:Action mustUnderstand=\"true\">{action}</a:Action>\
             {selectors}{options}\
             </s:Header>\
             <s:Body>{body}</s:Body>\
             </s:Envelope>",
            host = self.host,
            port = self.port,
            size = MAX_ENVELOPE_SIZE,
            locale = LOCALE,
            timeout = OPERATION_TIMEOUT,
            resource = RESOURCE_URI,
        )
    }
}

/// Wraps a script for execution through `powershell.exe -encodedCommand`,
/// which expects base64 over UTF-16LE.
#[must_use]
pub(crate) fn powershell(script: &str) -> String {
    let utf16: Vec<u8> = script.encode_utf16().flat_map(u16::to_le_bytes).collect();
    format!("powershell.exe -encodedCommand {}", STANDARD.encode(utf16))
}

pub(crate) fn is_canceled(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<Error>(), Some(Error::Canceled))
}

// Response parsing -----------------------------------------------------------

fn parse_http_response(raw: &[u8]) -> Result<(u16, String)> {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .context("malformed response: missing header terminator")?;
    let (head, rest) = raw.split_at(split);
    let body = &rest[4..];

    let head = String::from_utf8_lossy(head);
    let mut lines = head.lines();
    let status_line = lines.next().context("malformed response: empty head")?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .with_context(|| format!("malformed status line: {status_line}"))?;

    let mut chunked = false;
    let mut content_length = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = value.eq_ignore_ascii_case("chunked");
        } else if name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse::<usize>().ok();
        }
    }

    let body = if chunked {
        dechunk(body)?
    } else if let Some(length) = content_length {
        ensure!(body.len() >= length, "truncated response body");
        body[..length].to_vec()
    } else {
        body.to_vec()
    };

    Ok((status, String::from_utf8_lossy(&body).into_owned()))
}

fn dechunk(mut body: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();

    loop {
        let line_end = body
            .windows(2)
            .position(|w| w == b"\r\n")
            .context("malformed chunk size line")?;
        let size_line = String::from_utf8_lossy(&body[..line_end]);
        let size_text = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_text, 16)
            .with_context(|| format!("malformed chunk size {size_text}"))?;
        body = &body[line_end + 2..];

        if size == 0 {
            break;
        }

        ensure!(body.len() >= size + 2, "truncated chunk");
        out.extend_from_slice(&body[..size]);
        body = &body[size + 2..];
    }

    Ok(out)
}

fn fault_error(status: u16, body: &str) -> anyhow::Error {
    match fault_message(body) {
        Some(message) => anyhow::anyhow!("WinRM fault (status {status}): {message}"),
        None => anyhow::anyhow!("WinRM request failed: status {status}"),
    }
}

/// Extracts the human-readable fault reason from a SOAP fault body.
fn fault_message(xml: &str) -> Option<String> {
    xml_text(xml, "Text").or_else(|| xml_text(xml, "Message"))
}

/// Text content of the first element with the given local name.
fn xml_text(xml: &str, name: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    let mut depth = 0usize;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.local_name().as_ref() == name.as_bytes() => depth += 1,
            Ok(Event::End(e)) if e.local_name().as_ref() == name.as_bytes() => {
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Text(t)) if depth > 0 => {
                return t.unescape().ok().map(|text| text.trim().to_string());
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

/// Text content of the `Selector` element whose `Name` attribute matches.
fn xml_selector_text(xml: &str, name: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    let mut matched = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"Selector" => {
                matched = attribute(&e, "Name").as_deref() == Some(name);
            }
            Ok(Event::Text(t)) if matched => {
                return t.unescape().ok().map(|text| text.trim().to_string());
            }
            Ok(Event::End(e)) if e.local_name().as_ref() == b"Selector" => matched = false,
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

fn parse_receive(xml: &str) -> Receive {
    let mut reader = Reader::from_str(xml);
    let mut received = Receive::default();
    let mut stream: Option<String> = None;
    let mut in_exit_code = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"Stream" => stream = attribute(&e, "Name"),
                b"CommandState" => {
                    if attribute(&e, "State").is_some_and(|s| s.ends_with("/Done")) {
                        received.done = true;
                    }
                }
                b"ExitCode" => in_exit_code = true,
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"CommandState"
                    && attribute(&e, "State").is_some_and(|s| s.ends_with("/Done"))
                {
                    received.done = true;
                }
            }
            Ok(Event::Text(t)) => {
                if in_exit_code {
                    if let Ok(text) = t.unescape() {
                        received.exit_code = text.trim().parse::<i64>().ok();
                    }
                } else if let Some(name) = stream.as_deref() {
                    let Ok(text) = t.unescape() else { continue };
                    let Ok(decoded) = STANDARD.decode(text.trim()) else {
                        continue;
                    };
                    match name {
                        "stdout" => received.stdout.extend_from_slice(&decoded),
                        "stderr" => received.stderr.extend_from_slice(&decoded),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"Stream" => stream = None,
                b"ExitCode" => in_exit_code = false,
                _ => {}
            },
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }

    received
}

fn attribute(e: &quick_xml::events::BytesStart<'_>, name: &str) -> Option<String> {
    e.try_get_attribute(name)
        .ok()
        .flatten()
        .and_then(|attr| attr.unescape_value().ok())
        .map(|value| value.into_owned())
}

fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::dial::direct::DirectDialer;

    fn client() -> WinrmClient {
        WinrmClient::new(
            DirectDialer.into(),
            "box.example.com".to_string(),
            5985,
            false,
            false,
            "administrator".to_string(),
            "secret".to_string(),
            CancellationToken::new(),
        )
    }

    #[test]
    fn envelope_carries_protocol_parameters() {
        let envelope = client().envelope(ACTION_COMMAND, Some("SHELL-1"), "", "<x/>");

        assert!(envelope.contains("<w:MaxEnvelopeSize mustUnderstand=\"true\">153600</w:MaxEnvelopeSize>"));
        assert!(envelope.contains("<w:OperationTimeout>PT60S</w:OperationTimeout>"));
        assert!(envelope.contains("xml:lang=\"en-US\""));
        assert!(envelope.contains(RESOURCE_URI));
        assert!(envelope.contains(ACTION_COMMAND));
        assert!(envelope.contains("<w:Selector Name=\"ShellId\">SHELL-1</w:Selector>"));
        assert!(envelope.contains("<s:Body><x/></s:Body>"));
    }

    #[test]
    fn envelope_omits_selector_without_shell() {
        let envelope = client().envelope(ACTION_CREATE, None, "", "");
        assert!(!envelope.contains("SelectorSet"));
    }

    #[test]
    fn shell_id_is_extracted_from_create_response() {
        let response = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"
            xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell">
            <s:Body><rsp:Shell>
            <rsp:ShellId>4132E8F1-39D2-4A22-B59B-0C26E65822F6</rsp:ShellId>
            <rsp:InputStreams>stdin</rsp:InputStreams>
            </rsp:Shell></s:Body></s:Envelope>"#;

        assert_eq!(
            xml_text(response, "ShellId").as_deref(),
            Some("4132E8F1-39D2-4A22-B59B-0C26E65822F6")
        );
    }

    #[test]
    fn shell_id_falls_back_to_selector() {
        let response = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"
            xmlns:w="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd">
            <s:Body><w:SelectorSet>
            <w:Selector Name="ShellId">77E9B6A1-3C39-4C7C-9A3A-9C0DDA3E0A5A</w:Selector>
            </w:SelectorSet></s:Body></s:Envelope>"#;

        assert_eq!(
            xml_selector_text(response, "ShellId").as_deref(),
            Some("77E9B6A1-3C39-4C7C-9A3A-9C0DDA3E0A5A")
        );
    }

    #[test]
    fn receive_parses_streams_state_and_exit_code() {
        let stdout = STANDARD.encode("hello ");
        let stdout2 = STANDARD.encode("world");
        let stderr = STANDARD.encode("oops");
        let response = format!(
            r#"<rsp:ReceiveResponse xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell">
            <rsp:Stream Name="stdout" CommandId="C1">{stdout}</rsp:Stream>
            <rsp:Stream Name="stdout" CommandId="C1">{stdout2}</rsp:Stream>
            <rsp:Stream Name="stderr" CommandId="C1">{stderr}</rsp:Stream>
            <rsp:CommandState CommandId="C1" State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done">
            <rsp:ExitCode>42</rsp:ExitCode>
            </rsp:CommandState>
            </rsp:ReceiveResponse>"#
        );

        let received = parse_receive(&response);
        assert_eq!(received.stdout, b"hello world");
        assert_eq!(received.stderr, b"oops");
        assert!(received.done);
        assert_eq!(received.exit_code, Some(42));
    }

    #[test]
    fn receive_running_state_is_not_done() {
        let response = r#"<rsp:ReceiveResponse xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell">
            <rsp:CommandState CommandId="C1" State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Running"/>
            </rsp:ReceiveResponse>"#;

        let received = parse_receive(response);
        assert!(!received.done);
        assert!(received.stdout.is_empty());
    }

    #[test]
    fn fault_text_is_surfaced() {
        let response = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope">
            <s:Body><s:Fault><s:Reason>
            <s:Text xml:lang="en-US">The request is not valid.</s:Text>
            </s:Reason></s:Fault></s:Body></s:Envelope>"#;

        assert_eq!(
            fault_message(response).as_deref(),
            Some("The request is not valid.")
        );
    }

    #[rstest]
    #[case(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nbody", 200, "body")]
    #[case(b"HTTP/1.1 401 Unauthorized\r\n\r\n", 401, "")]
    #[case(
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nbody\r\n0\r\n\r\n",
        200,
        "body"
    )]
    fn http_responses_parse(#[case] raw: &[u8], #[case] status: u16, #[case] body: &str) {
        let (parsed_status, parsed_body) = parse_http_response(raw).unwrap();
        assert_eq!(parsed_status, status);
        assert_eq!(parsed_body, body);
    }

    #[test]
    fn powershell_encoding_round_trips() {
        let wrapped = powershell("Get-ChildItem");
        let encoded = wrapped
            .strip_prefix("powershell.exe -encodedCommand ")
            .unwrap();

        let bytes = STANDARD.decode(encoded).unwrap();
        let utf16: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        assert_eq!(String::from_utf16(&utf16).unwrap(), "Get-ChildItem");
    }

    #[test]
    fn command_text_is_escaped() {
        assert_eq!(
            xml_escape(r#"echo "a & b""#),
            "echo &quot;a &amp; b&quot;"
        );
    }
}
