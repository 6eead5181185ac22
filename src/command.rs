//! Command definitions and in-process execution.
//!
//! A [`Command`] couples a handler with the options, arguments and
//! encoders the transports need to invoke it. Commands form a tree; the
//! HTTP server resolves URL paths against it.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::encoding::{Encoder, EncoderMap, Payload};
use crate::errors::{CmdError, ErrorCode};
use crate::request::{Encoding, OptionValue, Request};
use crate::stream::{self, Emitter, Response};
use crate::{AppError, Result};

/// Name of the global option selecting the output encoding.
pub const ENCODING_OPTION: &str = "encoding";
/// Short alias of [`ENCODING_OPTION`].
pub const ENCODING_ALIAS: &str = "enc";
/// Name of the global option asking for chunked channel output.
pub const STREAM_CHANNELS_OPTION: &str = "stream-channels";
/// Name of the global option setting an invocation deadline.
pub const TIMEOUT_OPTION: &str = "timeout";

/// Opaque capability bag passed through to handlers untouched.
pub type Environment = Arc<dyn Any + Send + Sync>;

/// Boxed future returned by a handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Command body: emits zero or more values and returns.
pub type Handler = Arc<dyn Fn(Request, Emitter<Payload>, Environment) -> HandlerFuture + Send + Sync>;

/// Value type of an option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    /// `true` / `false`; a bare flag counts as `true`.
    Bool,
    /// Signed integer.
    Int,
    /// Unsigned integer.
    Uint,
    /// Floating point number.
    Float,
    /// Single string.
    String,
    /// Repeatable string.
    Strings,
}

impl OptionKind {
    fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Uint => "uint",
            Self::Float => "float",
            Self::String => "string",
            Self::Strings => "string list",
        }
    }

    /// Parse raw query-string values for an option of this kind.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` when a value does not parse or a
    /// single-valued option is given more than once.
    pub fn parse(self, option: &str, raw: &[String]) -> Result<OptionValue> {
        if self == Self::Strings {
            return Ok(OptionValue::Strings(raw.to_vec()));
        }

        let [value] = raw else {
            return Err(AppError::Protocol(format!(
                "option {option:?} expects a single value, got {}",
                raw.len()
            )));
        };

        let mismatch = || {
            AppError::Protocol(format!(
                "option {option:?}: could not convert {value:?} to {}",
                self.name()
            ))
        };

        let parsed = match self {
            Self::Bool => match value.as_str() {
                "" | "true" | "1" => OptionValue::Bool(true),
                "false" | "0" => OptionValue::Bool(false),
                _ => return Err(mismatch()),
            },
            Self::Int => OptionValue::Int(value.parse().map_err(|_| mismatch())?),
            Self::Uint => OptionValue::Uint(value.parse().map_err(|_| mismatch())?),
            Self::Float => OptionValue::Float(value.parse().map_err(|_| mismatch())?),
            Self::String | Self::Strings => OptionValue::String(value.clone()),
        };
        Ok(parsed)
    }

    /// Check a value that arrived already typed, e.g. from a JSON body.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` when the value has another kind.
    pub fn coerce(self, option: &str, value: OptionValue) -> Result<OptionValue> {
        match (self, value) {
            (Self::Bool, v @ OptionValue::Bool(_))
            | (Self::Int, v @ OptionValue::Int(_))
            | (Self::Uint, v @ OptionValue::Uint(_))
            | (Self::Float, v @ OptionValue::Float(_))
            | (Self::String, v @ OptionValue::String(_))
            | (Self::Strings, v @ OptionValue::Strings(_)) => Ok(v),
            (Self::Int, OptionValue::Uint(n)) => i64::try_from(n)
                .map(OptionValue::Int)
                .map_err(|_| AppError::Protocol(format!("option {option:?}: {n} overflows int"))),
            #[allow(clippy::cast_precision_loss)]
            (Self::Float, OptionValue::Uint(n)) => Ok(OptionValue::Float(n as f64)),
            #[allow(clippy::cast_precision_loss)]
            (Self::Float, OptionValue::Int(n)) => Ok(OptionValue::Float(n as f64)),
            (Self::Strings, OptionValue::String(s)) => Ok(OptionValue::Strings(vec![s])),
            (kind, other) => Err(AppError::Protocol(format!(
                "option {option:?}: expected {}, got {other:?}",
                kind.name()
            ))),
        }
    }
}

/// Declared option of a command.
#[derive(Debug, Clone)]
pub struct OptionSpec {
    /// Canonical name first, aliases after.
    pub names: Vec<String>,
    /// Value type.
    pub kind: OptionKind,
    /// One-line help text.
    pub description: String,
}

impl OptionSpec {
    /// Declare an option under `name`.
    pub fn new(name: impl Into<String>, kind: OptionKind, description: impl Into<String>) -> Self {
        Self {
            names: vec![name.into()],
            kind,
            description: description.into(),
        }
    }

    /// Add an alias.
    #[must_use]
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.names.push(alias.into());
        self
    }

    /// Canonical name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.names.first().map_or("", String::as_str)
    }

    fn matches(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }
}

/// Options every command accepts.
#[must_use]
pub fn global_options() -> Vec<OptionSpec> {
    vec![
        OptionSpec::new(ENCODING_OPTION, OptionKind::String, "Output encoding.")
            .alias(ENCODING_ALIAS),
        OptionSpec::new(
            STREAM_CHANNELS_OPTION,
            OptionKind::Bool,
            "Stream channel output.",
        ),
        OptionSpec::new(TIMEOUT_OPTION, OptionKind::String, "Deadline for the call."),
    ]
}

/// Declared positional argument.
#[derive(Debug, Clone)]
pub struct ArgSpec {
    /// Argument name for help and errors.
    pub name: String,
    /// Whether at least one value must be given.
    pub required: bool,
    /// Whether this argument absorbs all remaining values.
    pub variadic: bool,
    /// One-line help text.
    pub description: String,
}

impl ArgSpec {
    /// Declare a string argument.
    pub fn new(
        name: impl Into<String>,
        required: bool,
        variadic: bool,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            required,
            variadic,
            description: description.into(),
        }
    }
}

/// A node of the command tree.
#[derive(Clone, Default)]
pub struct Command {
    handler: Option<Handler>,
    options: Vec<OptionSpec>,
    arguments: Vec<ArgSpec>,
    encoders: EncoderMap,
    read_only: bool,
    subcommands: BTreeMap<String, Command>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("runnable", &self.handler.is_some())
            .field("options", &self.options)
            .field("arguments", &self.arguments)
            .field("read_only", &self.read_only)
            .field("subcommands", &self.subcommands.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Command {
    /// Runnable command backed by `handler`.
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(Request, Emitter<Payload>, Environment) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            handler: Some(Arc::new(
                move |req: Request, re: Emitter<Payload>, env: Environment| -> HandlerFuture {
                    Box::pin(handler(req, re, env))
                },
            )),
            ..Self::default()
        }
    }

    /// Non-runnable parent that only groups subcommands.
    #[must_use]
    pub fn namespace() -> Self {
        Self::default()
    }

    /// Declare an option.
    #[must_use]
    pub fn option(mut self, spec: OptionSpec) -> Self {
        self.options.push(spec);
        self
    }

    /// Declare a positional argument.
    #[must_use]
    pub fn argument(mut self, spec: ArgSpec) -> Self {
        self.arguments.push(spec);
        self
    }

    /// Register an encoder for one format.
    #[must_use]
    pub fn encoder(mut self, encoding: Encoding, encoder: Encoder) -> Self {
        self.encoders.insert(encoding, encoder);
        self
    }

    /// Allow invocation through `GET` when the server permits it.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Attach a child command.
    #[must_use]
    pub fn subcommand(mut self, name: impl Into<String>, command: Command) -> Self {
        self.subcommands.insert(name.into(), command);
        self
    }

    /// Whether this command may be called through `GET`.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Whether this command has a handler.
    #[must_use]
    pub fn is_runnable(&self) -> bool {
        self.handler.is_some()
    }

    /// Encoders registered on this command.
    #[must_use]
    pub fn encoders(&self) -> &EncoderMap {
        &self.encoders
    }

    /// Child command by name.
    #[must_use]
    pub fn child(&self, name: &str) -> Option<&Command> {
        self.subcommands.get(name)
    }

    /// Resolve a full command path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Command` with [`ErrorCode::NotFound`] when a
    /// segment does not name a subcommand, or the target is not runnable.
    pub fn resolve<S: AsRef<str>>(&self, path: &[S]) -> Result<&Command> {
        let mut current = self;
        for segment in path {
            let segment = segment.as_ref();
            current = current.child(segment).ok_or_else(|| {
                AppError::command(ErrorCode::NotFound, format!("unknown command {segment:?}"))
            })?;
        }
        if !current.is_runnable() {
            return Err(AppError::command(
                ErrorCode::NotFound,
                format!("command {:?} cannot be run", join_path(path)),
            ));
        }
        Ok(current)
    }

    /// Split CLI tokens into the longest command path and the remaining
    /// positional arguments.
    #[must_use]
    pub fn split_path<'a>(&self, tokens: &'a [String]) -> (&'a [String], &'a [String]) {
        let mut current = self;
        let mut consumed = 0;
        for token in tokens {
            match current.child(token) {
                Some(next) => {
                    current = next;
                    consumed += 1;
                }
                None => break,
            }
        }
        tokens.split_at(consumed)
    }

    fn find_option(&self, name: &str) -> Option<OptionSpec> {
        self.options
            .iter()
            .cloned()
            .chain(global_options())
            .find(|spec| spec.matches(name))
    }

    /// Parse raw `name=value` pairs into typed options keyed by canonical
    /// name. Values already typed (from a JSON body) are checked instead.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` for unknown options and type mismatches.
    pub fn parse_options(
        &self,
        raw: &[(String, String)],
        typed: BTreeMap<String, OptionValue>,
    ) -> Result<BTreeMap<String, OptionValue>> {
        let mut grouped: BTreeMap<String, (OptionSpec, Vec<String>)> = BTreeMap::new();
        for (name, value) in raw {
            let spec = self
                .find_option(name)
                .ok_or_else(|| AppError::Protocol(format!("unknown option {name:?}")))?;
            grouped
                .entry(spec.name().to_owned())
                .or_insert_with(|| (spec, Vec::new()))
                .1
                .push(value.clone());
        }

        let mut options = BTreeMap::new();
        for (name, (spec, values)) in grouped {
            let value = spec.kind.parse(&name, &values)?;
            options.insert(name, value);
        }

        for (name, value) in typed {
            let spec = self
                .find_option(&name)
                .ok_or_else(|| AppError::Protocol(format!("unknown option {name:?}")))?;
            let value = spec.kind.coerce(&name, value)?;
            options.insert(spec.name().to_owned(), value);
        }

        Ok(options)
    }

    /// Check the argument count against the declared arity.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` when required arguments are missing or
    /// too many are given.
    pub fn check_arguments(&self, arguments: &[String]) -> Result<()> {
        let variadic = self.arguments.last().is_some_and(|spec| spec.variadic);
        let required = self.arguments.iter().filter(|spec| spec.required).count();

        if arguments.len() < required {
            let missing = self
                .arguments
                .iter()
                .filter(|spec| spec.required)
                .nth(arguments.len())
                .map_or("argument", |spec| spec.name.as_str());
            return Err(AppError::Protocol(format!(
                "missing required argument {missing:?}"
            )));
        }

        if !variadic && arguments.len() > self.arguments.len() {
            return Err(AppError::Protocol(format!(
                "expected at most {} argument(s), got {}",
                self.arguments.len(),
                arguments.len()
            )));
        }

        Ok(())
    }
}

fn join_path<S: AsRef<str>>(path: &[S]) -> String {
    path.iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run `command` for `req` on its own task and return the consumer half.
///
/// The handler's return value closes the stream: `Ok` closes it
/// successfully, `Err` closes it with that error. A handler that already
/// closed the stream itself is left alone. A panicking handler closes the
/// stream with an [`ErrorCode::Implementation`] error.
///
/// # Errors
///
/// Returns `AppError::Command` with [`ErrorCode::NotFound`] if the command
/// has no handler, and `AppError::Protocol` for an invalid `timeout`.
pub fn execute(command: &Command, req: Request, env: Environment) -> Result<Response<Payload>> {
    let handler = command.handler.clone().ok_or_else(|| {
        AppError::command(ErrorCode::NotFound, "command cannot be run")
    })?;

    let cancel = req.cancellation().clone();
    let deadline_timer = req.timeout()?.map(|deadline| {
        let timer = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(deadline) => {
                    debug!(?deadline, "invocation deadline passed");
                    timer.cancel();
                }
                () = timer.cancelled() => {}
            }
        })
    });

    let (emitter, response) = stream::channel(cancel);
    let supervisor = emitter.clone();
    let task = tokio::spawn(handler(req, emitter, env));

    tokio::spawn(async move {
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(join) => {
                warn!(%join, "command handler panicked");
                Err(AppError::Command(CmdError::new(
                    ErrorCode::Implementation,
                    format!("handler panicked: {join}"),
                )))
            }
        };

        let closed = match outcome {
            Ok(()) => supervisor.close().await,
            Err(err) => {
                debug!(%err, "command handler returned an error");
                supervisor.close_with_error(err).await
            }
        };

        if let Err(err) = closed {
            debug!(%err, "command closed its own stream");
        }
        if let Some(timer) = deadline_timer {
            timer.abort();
        }
    });

    Ok(response)
}
