#![forbid(unsafe_code)]

//! `cmdpipe-ctl` — command-line client for a `cmdpipe` server.
//!
//! Splits its trailing tokens into a command path and arguments, invokes
//! the command over HTTP and prints every streamed value as it arrives.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use cmdpipe::command::TIMEOUT_OPTION;
use cmdpipe::demo;
use cmdpipe::encoding::Payload;
use cmdpipe::http::client::Client;
use cmdpipe::request::{parse_duration, Encoding, FilePart, OptionValue, Request};
use cmdpipe::stream::Received;
use cmdpipe::{AppError, Result};

#[derive(Debug, Parser)]
#[command(
    name = "cmdpipe-ctl",
    about = "Invoke commands on a cmdpipe server",
    version,
    long_about = None
)]
struct Cli {
    /// Server address.
    #[arg(long, default_value = "127.0.0.1:6798")]
    api: String,

    /// API prefix the server mounts commands under.
    #[arg(long, default_value = "/api/v0")]
    api_path: String,

    /// Output encoding: text, json or xml.
    #[arg(long = "enc", default_value = "text")]
    encoding: String,

    /// Deadline for the call, e.g. `10s` or `500ms`.
    #[arg(long)]
    timeout: Option<String>,

    /// Extra option as `name=value`; may be repeated.
    #[arg(long = "opt", value_name = "NAME=VALUE")]
    options: Vec<String>,

    /// File uploaded as a multipart section; may be repeated.
    #[arg(long = "file")]
    files: Vec<PathBuf>,

    /// Command path followed by its arguments.
    #[arg(required = true, trailing_var_arg = true)]
    tokens: Vec<String>,
}

fn main() {
    let args = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error: failed to build tokio runtime: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(run(args)) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

async fn run(args: Cli) -> Result<()> {
    let encoding: Encoding = args.encoding.parse()?;
    let request = build_request(&args, encoding)?;

    if let Some(raw) = &args.timeout {
        let deadline = parse_duration(raw)?;
        let cancel = request.cancellation().clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline + Duration::from_millis(100)).await;
            cancel.cancel();
        });
    }

    let client = Client::new(&args.api)?.with_api_path(args.api_path.clone());
    let mut response = client.execute(&request).await?;

    let stdout = std::io::stdout();
    loop {
        match response.next().await {
            Received::Value(value) => {
                let mut out = stdout.lock();
                print_value(&mut out, &value)?;
                out.flush()?;
            }
            Received::EndOfStream => return Ok(()),
            Received::Error(err) => return Err(err),
        }
    }
}

fn build_request(args: &Cli, encoding: Encoding) -> Result<Request> {
    let root = demo::root();
    let (path, arguments) = root.split_path(&args.tokens);
    if path.is_empty() {
        return Err(AppError::Protocol(format!(
            "unknown command {:?}",
            args.tokens.first().map_or("", String::as_str)
        )));
    }

    let mut request = Request::new(path.iter().cloned())
        .with_arguments(arguments.iter().cloned())
        .with_encoding(encoding)
        .with_cancellation(CancellationToken::new());

    if let Some(timeout) = &args.timeout {
        request = request.with_option(TIMEOUT_OPTION, OptionValue::String(timeout.clone()));
    }
    for option in &args.options {
        let (name, value) = option
            .split_once('=')
            .ok_or_else(|| AppError::Protocol(format!("option {option:?} is not NAME=VALUE")))?;
        request = request.with_option(name, OptionValue::String(value.to_owned()));
    }
    for path in &args.files {
        let data = std::fs::read(path)?;
        request = request.with_file(FilePart {
            field: "file".into(),
            file_name: path.file_name().map(|name| name.to_string_lossy().into_owned()),
            content_type: None,
            data: Bytes::from(data),
        });
    }

    Ok(request)
}

fn print_value(out: &mut impl Write, value: &Payload) -> Result<()> {
    match value {
        Payload::Raw(bytes) => out.write_all(bytes)?,
        Payload::Json(Value::String(text)) => writeln!(out, "{text}")?,
        Payload::Json(other) => writeln!(out, "{}", serde_json::to_string_pretty(other)?)?,
    }
    Ok(())
}
