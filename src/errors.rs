//! Error types shared across the crate.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Shared crate result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Machine-readable kind carried by a [`CmdError`].
///
/// The numeric values are part of the wire format and travel in the
/// `X-Stream-Error-Code` trailer and in early-failure bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum ErrorCode {
    /// Generic command failure.
    #[default]
    Normal,
    /// The caller sent something the command cannot accept.
    Client,
    /// A bug in the command or the framework.
    Implementation,
    /// The requested entity or command does not exist.
    NotFound,
    /// Unrecoverable failure.
    Fatal,
    /// The caller is being throttled.
    RateLimited,
    /// The caller is not permitted to run this command.
    Forbidden,
}

impl ErrorCode {
    /// Numeric wire representation.
    #[must_use]
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Normal => 0,
            Self::Client => 1,
            Self::Implementation => 2,
            Self::NotFound => 3,
            Self::Fatal => 4,
            Self::RateLimited => 5,
            Self::Forbidden => 6,
        }
    }
}

impl From<u32> for ErrorCode {
    fn from(code: u32) -> Self {
        match code {
            1 => Self::Client,
            2 => Self::Implementation,
            3 => Self::NotFound,
            4 => Self::Fatal,
            5 => Self::RateLimited,
            6 => Self::Forbidden,
            _ => Self::Normal,
        }
    }
}

impl From<ErrorCode> for u32 {
    fn from(code: ErrorCode) -> Self {
        code.as_u32()
    }
}

/// Structured command error preserved across the in-process and HTTP paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CmdError {
    /// Human-readable message.
    #[serde(rename = "Message")]
    pub message: String,
    /// Machine-readable kind.
    #[serde(rename = "Code", default)]
    pub code: ErrorCode,
}

impl CmdError {
    /// Build an error with an explicit kind.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
        }
    }

    /// Build an [`ErrorCode::Normal`] error.
    pub fn normal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Normal, message)
    }
}

impl Display for CmdError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for CmdError {}

/// Crate error enumeration covering every failure mode of the stream
/// protocol and its transports.
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Malformed request, unknown command or option, bad arity.
    Protocol(String),
    /// Origin or method rejected by the admission policy.
    Forbidden(String),
    /// A typed encoder received a value of the wrong shape.
    Cast(String),
    /// Serialising a value for the wire failed.
    Encode(String),
    /// `emit` was called on a closed stream.
    ClosedEmitter,
    /// `close` was called on a closed stream.
    DoubleClose,
    /// The invocation was cancelled or its deadline passed.
    Cancelled(String),
    /// A structured error raised by a command handler.
    Command(CmdError),
    /// HTTP transport failure.
    Http(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Shorthand for a structured handler error.
    pub fn command(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Command(CmdError::new(code, message))
    }

    /// Whether this error came from the cancellation context.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// The structured error, when this error carries one.
    #[must_use]
    pub fn structured(&self) -> Option<&CmdError> {
        match self {
            Self::Command(err) => Some(err),
            _ => None,
        }
    }

    /// Kind used when this error is downgraded to a [`CmdError`].
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Command(err) => err.code,
            Self::Protocol(_) => ErrorCode::Client,
            Self::Forbidden(_) => ErrorCode::Forbidden,
            Self::Cast(_) | Self::ClosedEmitter | Self::DoubleClose => ErrorCode::Implementation,
            _ => ErrorCode::Normal,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            Self::Cast(msg) => write!(f, "cast error: {msg}"),
            Self::Encode(msg) => write!(f, "encode: {msg}"),
            Self::ClosedEmitter => f.write_str("cannot write to closed emitter"),
            Self::DoubleClose => f.write_str("closing closed emitter"),
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
            Self::Command(err) => f.write_str(&err.message),
            Self::Http(msg) => write!(f, "http: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<CmdError> for AppError {
    fn from(err: CmdError) -> Self {
        Self::Command(err)
    }
}

impl From<&AppError> for CmdError {
    fn from(err: &AppError) -> Self {
        match err {
            AppError::Command(inner) => inner.clone(),
            other => CmdError::new(other.code(), other.to_string()),
        }
    }
}

impl From<AppError> for CmdError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Command(inner) => inner,
            other => CmdError::new(other.code(), other.to_string()),
        }
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encode(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}
