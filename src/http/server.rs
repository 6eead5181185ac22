//! HTTP server transport.
//!
//! Mounts the command tree under `config.api_path` behind an axum router.
//! Each request is decoded into a [`Request`], the command runs on its own
//! task, and the consumer half of its stream is turned into a chunked
//! response body: one data frame per emitted value, then a trailer frame
//! when the stream ends with an error.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{FromRequest, Multipart, Query, Request as HttpRequest, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{any, get};
use axum::{Json, Router};
use http_body::Frame;
use http_body_util::StreamBody;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, info_span, warn, Instrument};

use super::codec::ValueFrameCodec;
use super::{
    status_for, ErrorBody, CHUNKED_OUTPUT, CONTENT_LENGTH_HINT, DECLARED_TRAILERS,
    LENGTH_DELIMITED, STREAM_ERROR, STREAM_ERROR_CODE, VALUE_FRAMING,
};
use crate::command::{self, Command, Environment};
use crate::config::ServerConfig;
use crate::encoding::{Encoder, Payload};
use crate::errors::CmdError;
use crate::request::{Encoding, FilePart, OptionValue, Request};
use crate::stream::{Received, Response};
use crate::{AppError, Result};

/// Upper bound for a JSON request body.
const MAX_JSON_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Response headers browsers may read on allowed origins.
const EXPOSED_HEADERS: &str =
    "x-stream-error, x-stream-error-code, x-content-length, x-chunked-output, x-value-framing";

#[derive(Clone)]
struct ServerState {
    config: Arc<ServerConfig>,
    root: Arc<Command>,
    env: Environment,
}

/// Optional JSON request body.
#[derive(Debug, Deserialize)]
struct JsonBody {
    #[serde(default)]
    arguments: Vec<String>,
    #[serde(default)]
    options: BTreeMap<String, OptionValue>,
}

/// Handler for `GET /health`.
async fn health() -> &'static str {
    "ok"
}

/// Build the router serving `root` under `config.api_path`.
pub fn router(config: Arc<ServerConfig>, root: Arc<Command>, env: Environment) -> Router {
    let api_route = format!("{}/{{*path}}", config.api_path);
    let state = ServerState { config, root, env };

    Router::new()
        .route(&api_route, any(invoke))
        .route_layer(middleware::from_fn_with_state(state.clone(), admission))
        .route("/health", get(health))
        .with_state(state)
}

/// Bind `config.bind_addr()` and serve until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Config` if the server fails to bind and
/// `AppError::Http` if serving fails.
pub async fn serve(
    config: Arc<ServerConfig>,
    root: Arc<Command>,
    env: Environment,
    ct: CancellationToken,
) -> Result<()> {
    let bind = config.bind_addr();
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind HTTP on {bind}: {err}")))?;
    serve_listener(listener, router(config, root, env), ct).await
}

/// Serve `router` on an already bound listener until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Http` if serving fails.
pub async fn serve_listener(
    listener: TcpListener,
    router: Router,
    ct: CancellationToken,
) -> Result<()> {
    let local = listener.local_addr()?;
    info!(%local, "starting HTTP command transport");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Http(format!("server error: {err}")))?;

    info!("HTTP command transport shut down");
    Ok(())
}

// ── Admission ─────────────────────────────────────────────────────────────────

/// Origin/method policy, applied before any command runs.
async fn admission(
    State(state): State<ServerState>,
    request: HttpRequest,
    next: Next,
) -> HttpResponse {
    let origin = request_origin(request.headers());
    if let Some(origin) = origin.as_deref() {
        if !state.config.origin_allowed(origin) {
            warn!(%origin, "request rejected: origin not allowed");
            return failure_response(&AppError::Forbidden(format!(
                "origin {origin} is not allowed"
            )));
        }
    }

    let method = request.method().clone();
    let mut response = if method == Method::OPTIONS {
        preflight(state.config.allow_get)
    } else if method == Method::POST || (method == Method::GET && state.config.allow_get) {
        next.run(request).await
    } else {
        warn!(%method, "request rejected: method not allowed");
        method_not_allowed(&method)
    };

    if let Some(origin) = origin {
        apply_cors(response.headers_mut(), &origin);
    }
    response
}

/// Origin of the caller: the `Origin` header, or the origin part of
/// `Referer` when a client only sends that.
fn request_origin(headers: &HeaderMap) -> Option<String> {
    if let Some(origin) = headers.get(header::ORIGIN) {
        return Some(String::from_utf8_lossy(origin.as_bytes()).into_owned());
    }
    headers
        .get(header::REFERER)
        .and_then(|referer| referer.to_str().ok())
        .and_then(origin_of_url)
}

/// `scheme://authority` of an absolute URL.
fn origin_of_url(url: &str) -> Option<String> {
    let (scheme, rest) = url.split_once("://")?;
    let authority = rest
        .split(|c| c == '/' || c == '?' || c == '#')
        .next()
        .filter(|authority| !authority.is_empty())?;
    Some(format!("{scheme}://{authority}"))
}

fn preflight(allow_get: bool) -> HttpResponse {
    let methods = if allow_get { "POST, GET" } else { "POST" };
    (
        StatusCode::NO_CONTENT,
        [
            (header::ACCESS_CONTROL_ALLOW_METHODS, methods),
            (
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                "content-type, te, x-value-framing",
            ),
        ],
    )
        .into_response()
}

fn apply_cors(headers: &mut HeaderMap, origin: &str) {
    if let Ok(value) = HeaderValue::from_str(origin) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        headers.insert(
            header::ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_static(EXPOSED_HEADERS),
        );
        headers.append(header::VARY, HeaderValue::from_static("origin"));
    }
}

fn method_not_allowed(method: &Method) -> HttpResponse {
    let err = CmdError::new(
        crate::errors::ErrorCode::Client,
        format!("method {method} not allowed"),
    );
    (StatusCode::METHOD_NOT_ALLOWED, Json(ErrorBody::from(&err))).into_response()
}

// ── Invocation ────────────────────────────────────────────────────────────────

async fn invoke(State(state): State<ServerState>, request: HttpRequest) -> HttpResponse {
    let path = command_path(&state.config.api_path, request.uri().path());
    let span = info_span!(
        "invoke",
        path = %path.join("/"),
        request_id = %uuid::Uuid::new_v4()
    );
    run_invocation(state, path, request).instrument(span).await
}

async fn run_invocation(state: ServerState, path: Vec<String>, request: HttpRequest) -> HttpResponse {
    let command = match state.root.resolve(&path) {
        Ok(command) => command,
        Err(err) => return failure_response(&err),
    };

    if request.method() == Method::GET && !command.is_read_only() {
        return method_not_allowed(request.method());
    }

    let wants_frames = request
        .headers()
        .get(VALUE_FRAMING)
        .is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(LENGTH_DELIMITED.as_bytes()));

    let req = match decode_request(&state, command, path, request).await {
        Ok(req) => req,
        Err(err) => return failure_response(&err),
    };

    let encoding = match req.encoding_or(state.config.default_encoding) {
        Ok(encoding) => encoding,
        Err(err) => return failure_response(&err),
    };
    let encoder = command.encoders().resolve(encoding);
    // JSON output is already line-delimited.
    let frames = (wants_frames && encoding != Encoding::Json).then(ValueFrameCodec::new);

    let response = match command::execute(command, req.clone(), Arc::clone(&state.env)) {
        Ok(response) => response,
        Err(err) => return failure_response(&err),
    };

    stream_response(req, encoding, encoder, frames, response).await
}

/// Command path segments below the API prefix.
fn command_path(api_path: &str, uri_path: &str) -> Vec<String> {
    uri_path
        .strip_prefix(api_path)
        .unwrap_or(uri_path)
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Decode arguments, options and files. Malformed input, unknown options
/// and arity mismatches are rejected here, before the handler runs.
async fn decode_request(
    state: &ServerState,
    command: &Command,
    path: Vec<String>,
    request: HttpRequest,
) -> Result<Request> {
    let Query(pairs) = Query::<Vec<(String, String)>>::try_from_uri(request.uri())
        .map_err(|err| AppError::Protocol(format!("malformed query: {err}")))?;

    let mut arguments = Vec::new();
    let mut raw_options = Vec::new();
    for (name, value) in pairs {
        if name == "arg" {
            arguments.push(value);
        } else {
            raw_options.push((name, value));
        }
    }

    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let mut files = Vec::new();
    let mut typed = BTreeMap::new();

    if content_type.starts_with("multipart/form-data") {
        let mut multipart = Multipart::from_request(request, state)
            .await
            .map_err(|err| AppError::Protocol(format!("malformed multipart body: {err}")))?;
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|err| AppError::Protocol(format!("malformed multipart body: {err}")))?
        {
            let name = field.name().unwrap_or_default().to_owned();
            let file_name = field.file_name().map(str::to_owned);
            let part_type = field.content_type().map(str::to_owned);
            let data = field
                .bytes()
                .await
                .map_err(|err| AppError::Protocol(format!("malformed multipart body: {err}")))?;
            files.push(FilePart {
                field: name,
                file_name,
                content_type: part_type,
                data,
            });
        }
    } else if content_type.starts_with("application/json") {
        let body = axum::body::to_bytes(request.into_body(), MAX_JSON_BODY_BYTES)
            .await
            .map_err(|err| AppError::Protocol(format!("unreadable body: {err}")))?;
        if !body.is_empty() {
            let parsed: JsonBody = serde_json::from_slice(&body)
                .map_err(|err| AppError::Protocol(format!("malformed json body: {err}")))?;
            arguments.extend(parsed.arguments);
            typed = parsed.options;
        }
    } else if !content_type.is_empty() {
        return Err(AppError::Protocol(format!(
            "unsupported content type {content_type:?}"
        )));
    }

    let options = command.parse_options(&raw_options, typed)?;
    command.check_arguments(&arguments)?;

    let req = files.into_iter().fold(
        Request::new(path)
            .with_arguments(arguments)
            .with_options(options)
            .with_cancellation(CancellationToken::new()),
        Request::with_file,
    );

    // Surface a bad deadline before anything runs.
    req.timeout()?;
    Ok(req)
}

/// Early failure: nothing was streamed, so a status and body can still
/// describe the error.
fn failure_response(err: &AppError) -> HttpResponse {
    let cmd_err = CmdError::from(err);
    let status = status_for(cmd_err.code);
    warn!(%err, %status, "invocation failed before streaming");
    (status, Json(ErrorBody::from(&cmd_err))).into_response()
}

/// Wait for the first outcome of the stream and encode it; commit to a
/// streamed 200 response only once that succeeded.
async fn stream_response(
    req: Request,
    encoding: Encoding,
    encoder: Encoder,
    frames: Option<ValueFrameCodec>,
    response: Response<Payload>,
) -> HttpResponse {
    // Disconnecting the client drops the body, which cancels the handler.
    let guard = req.cancellation().clone().drop_guard();

    let mut body = BodyState {
        req,
        encoder,
        frames,
        response,
        pending: None,
        done: false,
        _guard: guard,
    };

    match body.response.next().await {
        Received::Value(value) => match body.encode(&value) {
            Ok(chunk) => body.pending = chunk,
            Err(err) => {
                body.req.cancellation().cancel();
                return failure_response(&err);
            }
        },
        Received::EndOfStream => body.done = true,
        Received::Error(err) => return failure_response(&err),
    }
    let length = body.response.length().await;

    let mut builder = axum::http::Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, encoding.content_type())
        .header(header::TRAILER, DECLARED_TRAILERS)
        .header(CHUNKED_OUTPUT, "1");
    if length > 0 {
        builder = builder.header(CONTENT_LENGTH_HINT, length);
    }
    if body.frames.is_some() {
        builder = builder.header(VALUE_FRAMING, LENGTH_DELIMITED);
    }

    let frames = futures_util::stream::unfold(body, next_frame);

    builder
        .body(Body::new(StreamBody::new(frames)))
        .unwrap_or_else(|err| {
            warn!(%err, "failed to build streamed response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

type FrameResult = std::result::Result<Frame<Bytes>, Infallible>;

struct BodyState {
    req: Request,
    encoder: Encoder,
    frames: Option<ValueFrameCodec>,
    response: Response<Payload>,
    pending: Option<Bytes>,
    done: bool,
    _guard: DropGuard,
}

impl BodyState {
    /// Wire bytes of one value, or `None` when there is nothing to send.
    fn encode(&mut self, value: &Payload) -> Result<Option<Bytes>> {
        let chunk = Bytes::from(self.encoder.encode_to_vec(&self.req, value)?);
        match self.frames.as_mut() {
            Some(frames) => frames.frame(chunk).map(Some),
            // A zero-length chunk would end the chunked body early.
            None if chunk.is_empty() => Ok(None),
            None => Ok(Some(chunk)),
        }
    }
}

/// Produce the next body frame: encoded values as data, a failure as the
/// trailer frame, nothing after a successful end.
async fn next_frame(mut body: BodyState) -> Option<(FrameResult, BodyState)> {
    if let Some(chunk) = body.pending.take() {
        return Some((Ok(Frame::data(chunk)), body));
    }

    loop {
        if body.done {
            return None;
        }

        match body.response.next().await {
            Received::Value(value) => match body.encode(&value) {
                Ok(None) => {}
                Ok(Some(chunk)) => return Some((Ok(Frame::data(chunk)), body)),
                Err(err) => {
                    warn!(%err, "encoding failed mid-stream; cancelling command");
                    body.req.cancellation().cancel();
                    body.done = true;
                    return Some((Ok(Frame::trailers(error_trailers(&err))), body));
                }
            },
            Received::EndOfStream => {
                debug!("stream completed");
                body.done = true;
            }
            Received::Error(err) => {
                warn!(%err, "stream closed with error after output");
                body.done = true;
                return Some((Ok(Frame::trailers(error_trailers(&err))), body));
            }
        }
    }
}

fn error_trailers(err: &AppError) -> HeaderMap {
    let err = CmdError::from(err);
    let message: String = err
        .message
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();

    let mut trailers = HeaderMap::new();
    trailers.insert(
        HeaderName::from_static(STREAM_ERROR),
        HeaderValue::from_bytes(message.as_bytes())
            .unwrap_or_else(|_| HeaderValue::from_static("error")),
    );
    trailers.insert(
        HeaderName::from_static(STREAM_ERROR_CODE),
        HeaderValue::from(err.code.as_u32()),
    );
    trailers
}
