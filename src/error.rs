//! Crate error types

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("key error: {0}")]
    Key(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("error on listening: {0}")]
    Bind(String),

    #[error("error on accept: {0}")]
    Accept(String),

    #[error("{0}")]
    HostKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("invalid address {0:?}: {1}")]
    Address(String, String),

    #[error("name resolution failed: {0}")]
    Resolve(String),

    #[error("command exited with status {0}")]
    ExitStatus(u32),

    #[error("ssh protocol error: {0}")]
    Protocol(String),

    #[error("connection closed")]
    Disconnected,

    /// Output of a persistent-session command matched the error matcher.
    /// The offending output is carried verbatim for introspection.
    #[error("{}", format_terminal(.output))]
    Terminal { output: Vec<u8> },
}

impl Error {
    /// Returns the offending output when this is a [`Error::Terminal`].
    pub fn terminal_output(&self) -> Option<&[u8]> {
        match self {
            Error::Terminal { output } => Some(output),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::Terminal { .. })
    }
}

fn format_terminal(output: &[u8]) -> String {
    let text = String::from_utf8_lossy(output);
    format!("detected error: \n  {}", text.replace('\n', "\n  "))
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        Error::Protocol(err.to_string())
    }
}

impl From<russh::keys::Error> for Error {
    fn from(err: russh::keys::Error) -> Self {
        Error::Key(err.to_string())
    }
}
