//! HTTP transport for command streams.
//!
//! Each emitted value is written as one chunk of a chunked response body.
//! JSON values are newline-delimited; other encodings are length-prefixed
//! when the client sends [`VALUE_FRAMING`], so values survive rechunking.
//! How the stream ended is carried in trailer fields: an absent or empty
//! [`STREAM_ERROR`] trailer means success, otherwise it holds the error
//! message and [`STREAM_ERROR_CODE`] its kind. A handler that
//! fails before emitting anything gets a non-200 status and a JSON error
//! body instead.

pub mod client;
pub mod codec;
pub mod server;

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::errors::{CmdError, ErrorCode};

/// Trailer carrying the terminal error message.
pub const STREAM_ERROR: &str = "x-stream-error";
/// Trailer carrying the numeric [`ErrorCode`] of the terminal error.
pub const STREAM_ERROR_CODE: &str = "x-stream-error-code";
/// Header carrying the declared stream length.
pub const CONTENT_LENGTH_HINT: &str = "x-content-length";
/// Header marking a streamed response body.
pub const CHUNKED_OUTPUT: &str = "x-chunked-output";
/// Request and response header selecting per-value framing.
pub const VALUE_FRAMING: &str = "x-value-framing";
/// The only [`VALUE_FRAMING`] scheme: a 4-byte big-endian length prefix.
pub const LENGTH_DELIMITED: &str = "length-delimited";
/// Value of the `Trailer` response header.
///
/// Lower-case so it matches the field names hyper compares against.
pub const DECLARED_TRAILERS: &str = "x-stream-error, x-stream-error-code";

/// JSON body of an early-failure response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error message.
    #[serde(rename = "Message")]
    pub message: String,
    /// Numeric error kind.
    #[serde(rename = "Code", default)]
    pub code: ErrorCode,
    /// Always `"error"`.
    #[serde(rename = "Type", default = "error_type")]
    pub kind: String,
}

fn error_type() -> String {
    "error".into()
}

impl From<&CmdError> for ErrorBody {
    fn from(err: &CmdError) -> Self {
        Self {
            message: err.message.clone(),
            code: err.code,
            kind: error_type(),
        }
    }
}

impl From<ErrorBody> for CmdError {
    fn from(body: ErrorBody) -> Self {
        CmdError::new(body.code, body.message)
    }
}

/// HTTP status used for an early failure of the given kind.
#[must_use]
pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Client => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::Normal | ErrorCode::Implementation | ErrorCode::Fatal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
