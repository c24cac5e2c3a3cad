//! Command encoding for one-shot execution and echo-marker framing for
//! interactive shells.
//!
//! The framing is not binary safe: a command whose own output ends with
//! the marker text would be misread. Markers are random per invocation,
//! which keeps collisions out of practical reach.

use crate::Error;

/// Encodes a command line for a one-shot exec call that does not go
/// through an interactive shell. POSIX shell quoting on non-Windows,
/// Windows argv quoting on Windows.
#[must_use]
pub fn encode_exec_input(platform: &str, cmd: &str, args: &[&str]) -> String {
    let quote = if platform.eq_ignore_ascii_case("windows") {
        windows_argv_quote
    } else {
        posix_shell_quote
    };

    let mut words = Vec::with_capacity(args.len() + 1);
    words.push(quote(cmd));
    words.extend(args.iter().map(|arg| quote(arg)));
    words.join(" ")
}

/// Encodes a command line for an interactive shell. Arguments are joined
/// with spaces as-is (pre-quoted, trusted input) and a platform-specific
/// suffix echoes the shell's exit status concatenated with the marker.
#[must_use]
pub fn encode_shell_input(platform: &str, cmd: &str, args: &[&str], echo: &str) -> String {
    let tail = if platform.eq_ignore_ascii_case("windows") {
        format!("; Write-Output $?{echo}`r`n\n")
    } else {
        format!("; echo $?{echo};\n")
    };

    if args.is_empty() {
        return format!("{cmd}{tail}");
    }

    format!("{cmd} {}{tail}", args.join(" "))
}

/// Inspects one output line for the echo marker. `None` means the line is
/// ordinary command output; `Some(Ok(()))` marks a zero exit status and
/// `Some(Err(_))` carries the non-zero code text.
#[must_use]
pub fn decode_shell_output(line: &str, echo: &str) -> Option<Result<(), Error>> {
    if echo.is_empty() {
        return None;
    }

    let code = line.strip_suffix(echo)?;
    if code == "0" {
        Some(Ok(()))
    } else {
        Some(Err(Error::Exit(code.to_string())))
    }
}

/// Splits one `\n`-terminated line off the front of `buf`, stripping the
/// line terminator and a trailing `\r`.
pub(crate) fn take_line(buf: &mut Vec<u8>) -> Option<String> {
    let pos = buf.iter().position(|b| *b == b'\n')?;
    let mut line: Vec<u8> = buf.drain(..=pos).collect();
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Some(String::from_utf8_lossy(&line).into_owned())
}

fn posix_shell_quote(word: &str) -> String {
    fn safe(b: u8) -> bool {
        matches!(b,
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9'
            | b'_' | b'-' | b'.' | b'/' | b':' | b'@' | b'%' | b'+' | b'=' | b',')
    }

    if !word.is_empty() && word.bytes().all(safe) {
        return word.to_string();
    }

    format!("'{}'", word.replace('\'', r"'\''"))
}

fn windows_argv_quote(word: &str) -> String {
    if !word.is_empty() && !word.contains([' ', '\t', '\n', '\x0b', '"']) {
        return word.to_string();
    }

    let mut out = String::with_capacity(word.len() + 2);
    out.push('"');

    let mut backslashes = 0usize;
    for c in word.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                out.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                out.push('"');
                backslashes = 0;
            }
            _ => {
                out.extend(std::iter::repeat('\\').take(backslashes));
                out.push(c);
                backslashes = 0;
            }
        }
    }

    out.extend(std::iter::repeat('\\').take(backslashes * 2));
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn exec_input_differs_by_platform() {
        let windows = encode_exec_input("windows", "nginx-debug", &["-g", "daemon off;"]);
        let posix = encode_exec_input("linux", "nginx-debug", &["-g", "daemon off;"]);

        assert_eq!(windows, r#"nginx-debug -g "daemon off;""#);
        assert_eq!(posix, "nginx-debug -g 'daemon off;'");
        assert_ne!(windows, posix);
    }

    #[rstest]
    #[case(&["a+x", "/usr/bin/svc"], "chmod a+x /usr/bin/svc")]
    #[case(&["it's"], r"chmod 'it'\''s'")]
    #[case(&[""], "chmod ''")]
    #[case(&["two words"], "chmod 'two words'")]
    fn posix_quoting(#[case] args: &[&str], #[case] should: &str) {
        assert_eq!(encode_exec_input("linux", "chmod", args), should);
    }

    #[rstest]
    #[case(&["plain"], "dir plain")]
    #[case(&["two words"], r#"dir "two words""#)]
    #[case(&[r#"say "hi""#], r#"dir "say \"hi\"""#)]
    #[case(&[r"trail\"], r#"dir trail\"#)]
    #[case(&[r"back\slash end "], "dir \"back\\slash end \"")]
    fn windows_quoting(#[case] args: &[&str], #[case] should: &str) {
        assert_eq!(encode_exec_input("windows", "dir", args), should);
    }

    #[test]
    fn shell_input_posix_tail() {
        let input = encode_shell_input("linux", "uname", &["-s"], "#beef00ff#");
        assert_eq!(input, "uname -s; echo $?#beef00ff#;\n");
    }

    #[test]
    fn shell_input_windows_tail() {
        let input = encode_shell_input("windows", "hostname", &[], "#beef00ff#");
        assert_eq!(input, "hostname; Write-Output $?#beef00ff#`r`n\n");
    }

    #[rstest]
    #[case("0#e#", true, None)]
    #[case("1#e#", true, Some("1"))]
    #[case("127#e#", true, Some("127"))]
    #[case("ordinary output", false, None)]
    #[case("#e# but not a suffix", false, None)]
    fn decode_works(
        #[case] line: &str,
        #[case] found: bool,
        #[case] code: Option<&str>,
    ) {
        match decode_shell_output(line, "#e#") {
            None => assert!(!found),
            Some(Ok(())) => {
                assert!(found);
                assert_eq!(code, None);
            }
            Some(Err(Error::Exit(text))) => {
                assert!(found);
                assert_eq!(code, Some(text.as_str()));
            }
            Some(Err(other)) => panic!("unexpected error {other}"),
        }
    }

    #[rstest]
    #[case("0", true)]
    #[case("1", false)]
    #[case("255", false)]
    fn decode_recovers_encoded_status(#[case] code: &str, #[case] ok: bool) {
        // The suffix appended by `encode_shell_input` makes the remote shell
        // print `<status><echo>`; feeding that line back must reproduce the
        // status.
        let echo = "#00c0ffee#";
        let line = format!("{code}{echo}");
        match decode_shell_output(&line, echo).expect("marker must match") {
            Ok(()) => assert!(ok),
            Err(Error::Exit(text)) => {
                assert!(!ok);
                assert_eq!(text, code);
            }
            Err(other) => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn empty_echo_never_matches() {
        assert!(decode_shell_output("0", "").is_none());
    }

    #[test]
    fn take_line_strips_terminators() {
        let mut buf = b"one\r\ntwo\npartial".to_vec();
        assert_eq!(take_line(&mut buf).as_deref(), Some("one"));
        assert_eq!(take_line(&mut buf).as_deref(), Some("two"));
        assert_eq!(take_line(&mut buf), None);
        assert_eq!(buf, b"partial");
    }
}
