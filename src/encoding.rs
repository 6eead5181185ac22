//! Encoder registry.
//!
//! Commands emit [`Payload`]s. An [`Encoder`] turns one payload into
//! bytes for the negotiated [`Encoding`]; [`EncoderMap::resolve`] picks the
//! command's own encoder first, then the built-in one for the format, then
//! JSON.

use std::any::type_name;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::request::{Encoding, Request};
use crate::stream::Emitter;
use crate::{AppError, Result};

/// Root element name used by the XML encoder.
pub const XML_ROOT: &str = "Output";

/// One value travelling through a command stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Structured value.
    Json(Value),
    /// Opaque bytes. Text and XML write them as they are; JSON carries
    /// them as a string, or as an array of byte values if not UTF-8.
    Raw(Bytes),
}

impl Payload {
    /// A string value.
    pub fn text(value: impl Into<String>) -> Self {
        Self::Json(Value::String(value.into()))
    }

    /// Serialise a typed value.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Encode` if `value` cannot be represented as JSON.
    pub fn from_typed<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::Json(serde_json::to_value(value)?))
    }

    /// Recover a typed value.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Cast` if the payload does not have the shape of `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let value = match self {
            Self::Json(value) => value.clone(),
            Self::Raw(bytes) => match std::str::from_utf8(bytes) {
                Ok(text) => Value::String(text.to_owned()),
                Err(_) => {
                    return Err(AppError::Cast(format!(
                        "expected {}, got binary data",
                        type_name::<T>()
                    )))
                }
            },
        };

        serde_json::from_value(value).map_err(|err| {
            AppError::Cast(format!(
                "expected {}, got {}: {err}",
                type_name::<T>(),
                self.kind()
            ))
        })
    }

    /// The string, if this payload is one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Json(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Short name of the payload's shape, for diagnostics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Json(Value::Null) => "null",
            Self::Json(Value::Bool(_)) => "bool",
            Self::Json(Value::Number(_)) => "number",
            Self::Json(Value::String(_)) => "string",
            Self::Json(Value::Array(_)) => "array",
            Self::Json(Value::Object(_)) => "object",
            Self::Raw(_) => "bytes",
        }
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self::text(value)
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self::text(value)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Self::Raw(value)
    }
}

impl Emitter<Payload> {
    /// Serialise and emit a typed value.
    ///
    /// # Errors
    ///
    /// `AppError::Encode` if the value cannot be serialised, otherwise the
    /// same as [`Emitter::emit`].
    pub async fn emit_value<T: Serialize>(&self, value: &T) -> Result<()> {
        self.emit(Payload::from_typed(value)?).await
    }
}

type EncodeFn = dyn Fn(&Request, &mut dyn Write, &Payload) -> Result<()> + Send + Sync;

/// Serialises one payload into an output sink.
#[derive(Clone)]
pub struct Encoder(Arc<EncodeFn>);

impl fmt::Debug for Encoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Encoder")
    }
}

impl Encoder {
    /// Encoder receiving the payload as is.
    pub fn new<F>(encode: F) -> Self
    where
        F: Fn(&Request, &mut dyn Write, &Payload) -> Result<()> + Send + Sync + 'static,
    {
        Self(Arc::new(encode))
    }

    /// Encoder for values of type `T`. A payload of another shape fails
    /// with `AppError::Cast` before `encode` runs.
    pub fn typed<T, F>(encode: F) -> Self
    where
        T: DeserializeOwned + 'static,
        F: Fn(&Request, &mut dyn Write, T) -> Result<()> + Send + Sync + 'static,
    {
        Self::new(move |req, sink, payload| encode(req, sink, payload.decode::<T>()?))
    }

    /// Encode one payload.
    ///
    /// # Errors
    ///
    /// Whatever the encode function reports.
    pub fn encode(&self, req: &Request, sink: &mut dyn Write, payload: &Payload) -> Result<()> {
        (self.0)(req, sink, payload)
    }

    /// Encode one payload into a fresh buffer.
    ///
    /// # Errors
    ///
    /// Whatever the encode function reports.
    pub fn encode_to_vec(&self, req: &Request, payload: &Payload) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.encode(req, &mut buf, payload)?;
        Ok(buf)
    }

    /// Built-in text encoder: strings as lines, other values as compact
    /// JSON lines.
    #[must_use]
    pub fn text() -> Self {
        Self::new(|_, sink, payload| {
            match payload {
                Payload::Json(Value::String(s)) => writeln!(sink, "{s}")?,
                Payload::Json(value) => {
                    serde_json::to_writer(&mut *sink, value)?;
                    sink.write_all(b"\n")?;
                }
                Payload::Raw(bytes) => sink.write_all(bytes)?,
            }
            Ok(())
        })
    }

    /// Built-in JSON encoder: one value per line.
    #[must_use]
    pub fn json() -> Self {
        Self::new(|_, sink, payload| {
            match payload {
                Payload::Json(value) => serde_json::to_writer(&mut *sink, value)?,
                Payload::Raw(bytes) => match std::str::from_utf8(bytes) {
                    Ok(text) => serde_json::to_writer(&mut *sink, text)?,
                    Err(_) => serde_json::to_writer(&mut *sink, bytes.as_ref())?,
                },
            }
            sink.write_all(b"\n")?;
            Ok(())
        })
    }

    /// Built-in XML encoder: one document per line under [`XML_ROOT`].
    #[must_use]
    pub fn xml() -> Self {
        Self::new(|_, sink, payload| {
            match payload {
                Payload::Json(value) => {
                    let doc = quick_xml::se::to_string_with_root(XML_ROOT, value)
                        .map_err(|err| AppError::Encode(format!("xml: {err}")))?;
                    writeln!(sink, "{doc}")?;
                }
                Payload::Raw(bytes) => sink.write_all(bytes)?,
            }
            Ok(())
        })
    }

    /// Built-in encoder for a format, if there is one.
    #[must_use]
    pub fn builtin(encoding: Encoding) -> Option<Self> {
        match encoding {
            Encoding::Text => Some(Self::text()),
            Encoding::Json => Some(Self::json()),
            Encoding::Xml => Some(Self::xml()),
            Encoding::Protobuf => None,
        }
    }
}

/// Per-format encoders of one command.
#[derive(Debug, Clone, Default)]
pub struct EncoderMap(BTreeMap<Encoding, Encoder>);

impl EncoderMap {
    /// Register `encoder` for `encoding`, replacing any previous one.
    pub fn insert(&mut self, encoding: Encoding, encoder: Encoder) {
        self.0.insert(encoding, encoder);
    }

    /// Encoder registered for exactly this format.
    #[must_use]
    pub fn get(&self, encoding: Encoding) -> Option<&Encoder> {
        self.0.get(&encoding)
    }

    /// Resolve the encoder used for `encoding`, falling back to the
    /// built-in encoder and finally to JSON.
    #[must_use]
    pub fn resolve(&self, encoding: Encoding) -> Encoder {
        self.get(encoding)
            .cloned()
            .or_else(|| Encoder::builtin(encoding))
            .unwrap_or_else(Encoder::json)
    }
}
