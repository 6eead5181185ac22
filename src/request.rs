//! Per-invocation request context.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::command::{ENCODING_OPTION, TIMEOUT_OPTION};
use crate::{AppError, Result};

/// Output format negotiated through the `encoding` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Human-readable text, one value per line.
    Text,
    /// Newline-delimited JSON.
    Json,
    /// One XML document per value.
    Xml,
    /// Compact binary; commands must register their own encoder.
    Protobuf,
}

impl Encoding {
    /// Option value naming this encoding.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
            Self::Xml => "xml",
            Self::Protobuf => "protobuf",
        }
    }

    /// MIME type sent in `Content-Type`.
    #[must_use]
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Text => "text/plain",
            Self::Json => "application/json",
            Self::Xml => "application/xml",
            Self::Protobuf => "application/protobuf",
        }
    }

    /// Inverse of [`Encoding::content_type`], ignoring parameters.
    #[must_use]
    pub fn from_content_type(value: &str) -> Option<Self> {
        let mime = value.split(';').next().unwrap_or_default().trim();
        [Self::Text, Self::Json, Self::Xml, Self::Protobuf]
            .into_iter()
            .find(|enc| enc.content_type().eq_ignore_ascii_case(mime))
    }
}

impl Display for Encoding {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Encoding {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "xml" => Ok(Self::Xml),
            "protobuf" => Ok(Self::Protobuf),
            other => Err(AppError::Protocol(format!("unknown encoding: {other}"))),
        }
    }
}

/// Typed option value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    /// Boolean flag.
    Bool(bool),
    /// Unsigned integer.
    Uint(u64),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// Single string.
    String(String),
    /// Repeated string option.
    Strings(Vec<String>),
}

impl OptionValue {
    /// Render the value as query-string values.
    #[must_use]
    pub fn to_query_values(&self) -> Vec<String> {
        match self {
            Self::Bool(v) => vec![v.to_string()],
            Self::Uint(v) => vec![v.to_string()],
            Self::Int(v) => vec![v.to_string()],
            Self::Float(v) => vec![v.to_string()],
            Self::String(v) => vec![v.clone()],
            Self::Strings(v) => v.clone(),
        }
    }
}

/// One uploaded file or stream section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    /// Multipart field name.
    pub field: String,
    /// Original file name, when the sender supplied one.
    pub file_name: Option<String>,
    /// Declared MIME type.
    pub content_type: Option<String>,
    /// File contents.
    pub data: Bytes,
}

/// Ordered set of uploaded files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSet(Vec<FilePart>);

impl FileSet {
    /// Iterate over the parts in upload order.
    pub fn iter(&self) -> impl Iterator<Item = &FilePart> {
        self.0.iter()
    }

    /// Number of parts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no files were uploaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append a part.
    pub fn push(&mut self, part: FilePart) {
        self.0.push(part);
    }
}

/// Immutable invocation context handed to a command handler.
#[derive(Debug, Clone, Default)]
pub struct Request {
    path: Vec<String>,
    arguments: Vec<String>,
    options: BTreeMap<String, OptionValue>,
    files: FileSet,
    cancel: CancellationToken,
}

impl Request {
    /// Start a request for the given command path.
    pub fn new<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            path: path.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Set the positional arguments.
    #[must_use]
    pub fn with_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    /// Set one option value.
    #[must_use]
    pub fn with_option(mut self, name: impl Into<String>, value: OptionValue) -> Self {
        self.options.insert(name.into(), value);
        self
    }

    /// Replace all option values.
    #[must_use]
    pub fn with_options(mut self, options: BTreeMap<String, OptionValue>) -> Self {
        self.options = options;
        self
    }

    /// Negotiate an output encoding.
    #[must_use]
    pub fn with_encoding(self, encoding: Encoding) -> Self {
        self.with_option(ENCODING_OPTION, OptionValue::String(encoding.as_str().into()))
    }

    /// Attach an uploaded file.
    #[must_use]
    pub fn with_file(mut self, part: FilePart) -> Self {
        self.files.push(part);
        self
    }

    /// Use an existing cancellation context.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Command path segments.
    #[must_use]
    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// Positional arguments.
    #[must_use]
    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    /// All option values keyed by canonical name.
    #[must_use]
    pub fn options(&self) -> &BTreeMap<String, OptionValue> {
        &self.options
    }

    /// Raw option value.
    #[must_use]
    pub fn option(&self, name: &str) -> Option<&OptionValue> {
        self.options.get(name)
    }

    /// Boolean option; `None` when absent or of another kind.
    #[must_use]
    pub fn option_bool(&self, name: &str) -> Option<bool> {
        match self.options.get(name) {
            Some(OptionValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    /// String option; `None` when absent or of another kind.
    #[must_use]
    pub fn option_str(&self, name: &str) -> Option<&str> {
        match self.options.get(name) {
            Some(OptionValue::String(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Uploaded files.
    #[must_use]
    pub fn files(&self) -> &FileSet {
        &self.files
    }

    /// Cancellation context of this invocation.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Negotiated encoding, or `fallback` when none was requested.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the option names an unknown encoding.
    pub fn encoding_or(&self, fallback: Encoding) -> Result<Encoding> {
        match self.option_str(ENCODING_OPTION) {
            Some(raw) => raw.parse(),
            None => Ok(fallback),
        }
    }

    /// Negotiated encoding, defaulting to JSON.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the option names an unknown encoding.
    pub fn encoding(&self) -> Result<Encoding> {
        self.encoding_or(Encoding::Json)
    }

    /// Deadline requested through the `timeout` option.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the option is not a valid duration.
    pub fn timeout(&self) -> Result<Option<Duration>> {
        self.option_str(TIMEOUT_OPTION)
            .map(parse_duration)
            .transpose()
    }
}

/// Parse durations such as `250ms`, `10s`, `2m` or `1h`. A bare number
/// is read as seconds.
///
/// # Errors
///
/// Returns `AppError::Protocol` on an empty value, a missing number or
/// an unknown unit.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let amount: u64 = digits
        .parse()
        .map_err(|_| AppError::Protocol(format!("invalid duration: {raw:?}")))?;

    let duration = match unit {
        "ms" => Duration::from_millis(amount),
        "" | "s" => Duration::from_secs(amount),
        "m" => Duration::from_secs(amount.saturating_mul(60)),
        "h" => Duration::from_secs(amount.saturating_mul(3600)),
        other => {
            return Err(AppError::Protocol(format!(
                "invalid duration unit {other:?} in {raw:?}"
            )))
        }
    };
    Ok(duration)
}
