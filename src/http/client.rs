//! HTTP client transport.
//!
//! [`Client::execute`] posts a [`Request`] to a remote server and returns
//! an [`HttpResponse`], which implements the same [`Consumer`] contract as
//! the in-process stream. The body is read frame by frame and reframed into
//! values by line (JSON) or by length prefix (other encodings); the trailer
//! frame, if any, decides how the stream ended once the body is exhausted.

use std::collections::VecDeque;

use axum::http::{header, HeaderMap, StatusCode};
use bytes::{Bytes, BytesMut};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt;
use reqwest::multipart::{Form, Part};
use reqwest::Url;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::codec::{JsonLinesCodec, ValueFrameCodec};
use super::{
    ErrorBody, CONTENT_LENGTH_HINT, LENGTH_DELIMITED, STREAM_ERROR, STREAM_ERROR_CODE,
    VALUE_FRAMING,
};
use crate::config::DEFAULT_MAX_LINE_BYTES;
use crate::encoding::Payload;
use crate::errors::{CmdError, ErrorCode};
use crate::request::{Encoding, FileSet, Request};
use crate::stream::{Consumer, ConsumerFuture, Received};
use crate::{AppError, Result};

/// Default API prefix, matching the server's default `api_path`.
pub const DEFAULT_API_PATH: &str = "/api/v0";

/// Remote command executor.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    base: Url,
    api_path: String,
    max_line_bytes: usize,
}

impl Client {
    /// Client for the server at `base`, e.g. `127.0.0.1:6798` or
    /// `http://localhost:6798`. A missing scheme defaults to `http`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `base` is not a valid URL or the HTTP
    /// client cannot be built.
    pub fn new(base: &str) -> Result<Self> {
        let base = if base.contains("://") {
            base.to_owned()
        } else {
            format!("http://{base}")
        };
        let base = Url::parse(&base)
            .map_err(|err| AppError::Config(format!("invalid server address {base:?}: {err}")))?;

        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| AppError::Config(format!("failed to build HTTP client: {err}")))?;

        Ok(Self {
            http,
            base,
            api_path: DEFAULT_API_PATH.to_owned(),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        })
    }

    /// Use a different API prefix.
    #[must_use]
    pub fn with_api_path(mut self, api_path: impl Into<String>) -> Self {
        self.api_path = api_path.into().trim_end_matches('/').to_owned();
        self
    }

    /// Limit the length of one JSON line in response bodies.
    #[must_use]
    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }

    /// URL invoking `req`: the command path below the API prefix, one
    /// `arg` pair per argument and one pair per option value.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the base URL cannot carry a path.
    pub fn command_url(&self, req: &Request) -> Result<Url> {
        if self.base.cannot_be_a_base() {
            return Err(AppError::Config(format!(
                "server address {} cannot carry a path",
                self.base
            )));
        }

        let mut url = self.base.clone();
        url.set_path(&format!("{}/{}", self.api_path, req.path().join("/")));

        let mut pairs: Vec<(&str, String)> = req
            .arguments()
            .iter()
            .map(|arg| ("arg", arg.clone()))
            .collect();
        for (name, value) in req.options() {
            pairs.extend(
                value
                    .to_query_values()
                    .into_iter()
                    .map(|v| (name.as_str(), v)),
            );
        }

        if pairs.is_empty() {
            url.set_query(None);
        } else {
            let mut query = url.query_pairs_mut();
            query.clear();
            for (name, value) in &pairs {
                query.append_pair(name, value);
            }
        }
        Ok(url)
    }

    /// Invoke the command named by `req` on the server.
    ///
    /// # Errors
    ///
    /// - `AppError::Command` with the server's code when the server
    ///   rejects the call before streaming (a non-200 status).
    /// - `AppError::Cancelled` if `req` is cancelled before the response
    ///   headers arrive.
    /// - `AppError::Http` on transport failure.
    pub async fn execute(&self, req: &Request) -> Result<HttpResponse> {
        let url = self.command_url(req)?;
        debug!(%url, "invoking remote command");

        // hyper only sends trailers to clients that ask for them.
        let mut builder = self
            .http
            .post(url)
            .header(header::TE, "trailers")
            .header(VALUE_FRAMING, LENGTH_DELIMITED);
        if !req.files().is_empty() {
            builder = builder.multipart(multipart_form(req.files())?);
        }

        let cancel = req.cancellation().clone();
        let resp = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(AppError::Cancelled("context canceled".into()));
            }
            resp = builder.send() => resp?,
        };

        let status = resp.status();
        if status != StatusCode::OK {
            return Err(AppError::Command(early_failure(status, resp).await));
        }

        let length = resp
            .headers()
            .get(CONTENT_LENGTH_HINT)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0);
        let encoding = match resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(Encoding::from_content_type)
        {
            Some(encoding) => encoding,
            None => req.encoding()?,
        };

        let framed = resp
            .headers()
            .get(VALUE_FRAMING)
            .is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(LENGTH_DELIMITED.as_bytes()));
        let framing = if encoding == Encoding::Json {
            Framing::Lines(JsonLinesCodec::with_max_line_bytes(self.max_line_bytes))
        } else if framed {
            Framing::Delimited(ValueFrameCodec::new())
        } else {
            Framing::Chunks
        };

        let body = axum::http::Response::from(resp).into_body().boxed_unsync();

        Ok(HttpResponse {
            body,
            framing,
            buffer: BytesMut::new(),
            pending: VecDeque::new(),
            trailers: None,
            terminal: None,
            length,
            encoding,
            cancel,
        })
    }
}

fn multipart_form(files: &FileSet) -> Result<Form> {
    let mut form = Form::new();
    for file in files.iter() {
        let mut part = Part::bytes(file.data.to_vec());
        if let Some(name) = &file.file_name {
            part = part.file_name(name.clone());
        }
        if let Some(content_type) = &file.content_type {
            part = part.mime_str(content_type)?;
        }
        form = form.part(file.field.clone(), part);
    }
    Ok(form)
}

/// Decode the JSON error body of a non-200 response, falling back to the
/// raw body text.
async fn early_failure(status: StatusCode, resp: reqwest::Response) -> CmdError {
    let text = match resp.text().await {
        Ok(text) => text,
        Err(err) => return CmdError::normal(format!("{status}: {err}")),
    };
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => CmdError::from(body),
        Err(_) if text.trim().is_empty() => CmdError::normal(status.to_string()),
        Err(_) => CmdError::normal(text.trim().to_owned()),
    }
}

/// Terminal outcome described by the trailer fields, if any.
///
/// An absent or empty error trailer means success. A code trailer that
/// does not parse is treated as [`ErrorCode::Normal`].
#[must_use]
pub fn trailer_outcome(trailers: Option<&HeaderMap>) -> Option<CmdError> {
    let trailers = trailers?;
    let message = trailers
        .get(STREAM_ERROR)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
        .filter(|message| !message.is_empty())?;
    let code = trailers
        .get(STREAM_ERROR_CODE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u32>().ok())
        .map_or(ErrorCode::Normal, ErrorCode::from);
    Some(CmdError::new(code, message))
}

/// How body bytes are cut into values.
#[derive(Debug)]
enum Framing {
    /// One JSON value per line.
    Lines(JsonLinesCodec),
    /// One length-prefixed frame per value.
    Delimited(ValueFrameCodec),
    /// Unframed output from a server that ignored the framing request;
    /// every body chunk is taken as a value.
    Chunks,
}

/// Consumer half of a remote invocation.
pub struct HttpResponse {
    body: UnsyncBoxBody<Bytes, reqwest::Error>,
    framing: Framing,
    buffer: BytesMut,
    pending: VecDeque<Payload>,
    trailers: Option<HeaderMap>,
    terminal: Option<std::result::Result<(), AppError>>,
    length: u64,
    encoding: Encoding,
    cancel: CancellationToken,
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("encoding", &self.encoding)
            .field("length", &self.length)
            .field("terminal", &self.terminal)
            .finish_non_exhaustive()
    }
}

impl HttpResponse {
    /// Encoding the server answered with.
    #[must_use]
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Declared length from the `x-content-length` header, zero if absent.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Terminal error, once the body has been read to the end.
    #[must_use]
    pub fn error(&self) -> Option<CmdError> {
        match &self.terminal {
            Some(Err(err)) => Some(CmdError::from(err)),
            _ => None,
        }
    }

    /// Cancellation context of the invocation.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wait for the next value, the end of the stream, or cancellation.
    pub async fn next(&mut self) -> Received<Payload> {
        loop {
            if let Some(value) = self.pending.pop_front() {
                return Received::Value(value);
            }
            match &self.terminal {
                Some(Ok(())) => return Received::EndOfStream,
                Some(Err(err)) => return Received::Error(err.clone()),
                None => {}
            }

            let frame = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    self.terminal = Some(Err(AppError::Cancelled("context canceled".into())));
                    continue;
                }
                frame = self.body.frame() => frame,
            };

            match frame {
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) => self.push_data(&data),
                    Err(frame) => {
                        if let Ok(trailers) = frame.into_trailers() {
                            self.trailers = Some(trailers);
                        }
                    }
                },
                Some(Err(err)) => {
                    warn!(%err, "response body failed");
                    self.terminal = Some(Err(AppError::from(err)));
                }
                None => self.finish(),
            }
        }
    }

    fn push_data(&mut self, data: &Bytes) {
        if matches!(self.framing, Framing::Chunks) {
            if !data.is_empty() {
                self.pending.push_back(Payload::Raw(data.clone()));
            }
            return;
        }

        self.buffer.extend_from_slice(data);
        if let Err(err) = self.drain(false) {
            self.terminal = Some(Err(err));
        }
    }

    /// Move every complete value in the buffer to `pending`.
    fn drain(&mut self, eof: bool) -> Result<()> {
        let buffer = &mut self.buffer;
        loop {
            let value = match &mut self.framing {
                Framing::Lines(codec) if eof => codec.decode_eof(buffer)?.map(Payload::Json),
                Framing::Lines(codec) => codec.decode(buffer)?.map(Payload::Json),
                Framing::Delimited(codec) if eof => codec.decode_eof(buffer)?.map(Payload::Raw),
                Framing::Delimited(codec) => codec.decode(buffer)?.map(Payload::Raw),
                Framing::Chunks => None,
            };
            match value {
                Some(value) => self.pending.push_back(value),
                None => return Ok(()),
            }
        }
    }

    fn finish(&mut self) {
        if let Err(err) = self.drain(true) {
            self.terminal = Some(Err(err));
            return;
        }

        self.terminal = Some(match trailer_outcome(self.trailers.as_ref()) {
            Some(err) => {
                debug!(%err, "stream ended with error trailer");
                Err(AppError::Command(err))
            }
            None => Ok(()),
        });
    }
}

impl Consumer for HttpResponse {
    type Item = Payload;

    fn next(&mut self) -> ConsumerFuture<'_, Received<Payload>> {
        Box::pin(HttpResponse::next(self))
    }

    fn length(&self) -> ConsumerFuture<'static, u64> {
        Box::pin(std::future::ready(self.length))
    }

    fn error(&self) -> Option<CmdError> {
        HttpResponse::error(self)
    }
}
