use std::fmt;
use std::path::Path;
use std::process::ExitStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// An external tool could not be launched or exited non-zero.
    Tool,
    /// A file could not be created, read, renamed or removed.
    Io,
    /// An extracted value failed a required shape check.
    Validation,
    /// The configuration file is malformed.
    Config,
    Other,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
    exit_code: Option<i32>,
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::with_kind(ErrorKind::Other, msg)
    }

    pub fn with_kind<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
            exit_code: None,
        }
    }

    pub fn tool_failed(tool: &str, status: ExitStatus) -> Self {
        let msg = match status.code() {
            Some(code) => format!("`{tool}` failed: exit status {code}"),
            None => format!("`{tool}` failed: {status}"),
        };
        Self {
            kind: ErrorKind::Tool,
            msg,
            exit_code: status.code(),
        }
    }

    pub fn tool_launch(tool: &str, err: std::io::Error) -> Self {
        Self::with_kind(ErrorKind::Tool, format!("failed to launch `{tool}`: {err}"))
    }

    pub fn io(action: &str, path: &Path, err: std::io::Error) -> Self {
        Self::with_kind(
            ErrorKind::Io,
            format!("failed to {action} {}: {err}", path.display()),
        )
    }

    pub fn validation<M: Into<String>>(msg: M) -> Self {
        Self::with_kind(ErrorKind::Validation, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Exit code of the failed tool, when the process exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Prefix the message while keeping kind and exit code.
    pub fn context(mut self, prefix: impl fmt::Display) -> Self {
        self.msg = format!("{prefix}: {}", self.msg);
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::with_kind(ErrorKind::Io, err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::with_kind(ErrorKind::Config, err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
