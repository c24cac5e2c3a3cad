use thiserror::Error;

/// Failures that callers are expected to distinguish.
///
/// Everything else travels as plain [`anyhow::Error`] context chains; these
/// variants are the ones the rollout engine and the CLI match on.
#[derive(Debug, Error)]
pub enum Error {
    /// Authn tag did not select any host or hop implementation.
    #[error("unknown host authn type: {0}")]
    UnknownAuthnType(String),

    /// Proxy hop address carried a scheme no dialer understands.
    #[error("unknown proxy scheme: {0}")]
    UnknownProxyScheme(String),

    /// Caller asked to execute an empty command.
    #[error("blank command")]
    BlankCommand,

    /// Remote command completed with a non-zero exit status. The code is
    /// kept as text because the shell codec recovers it from an output
    /// line, not from a protocol field.
    #[error("exit code {0}")]
    Exit(String),

    /// The operation was canceled, usually because a sibling task in the
    /// same fan-out phase failed first. Not authoritative for the target
    /// it is reported against.
    #[error("operation canceled")]
    Canceled,

    /// Documented protocol limitation, not a transient failure.
    #[error("{0} is not supported")]
    Unsupported(&'static str),

    /// A chunked remote file was dropped before its finalize step ran;
    /// the remote path still holds base64 text, not the file content.
    #[error("remote file {0} was not finalized")]
    Unfinalized(String),
}

impl Error {
    /// Exit error from a protocol-level status code.
    #[must_use]
    pub fn exit_status(code: u32) -> Self {
        Error::Exit(code.to_string())
    }
}
