//! Adder command tree served by the `cmdpipe` binary.
//!
//! `add` emits progress as plain strings, ending with the total;
//! `encode-add` emits typed [`AddStatus`] values and leaves the text
//! rendering to its encoder.

use std::fmt;
use std::io::Write;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::command::{ArgSpec, Command, OptionKind, OptionSpec};
use crate::encoding::{Encoder, Payload};
use crate::errors::ErrorCode;
use crate::request::{Encoding, OptionValue, Request};
use crate::{AppError, Result};

/// Progress of an `encode-add` run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AddStatus {
    /// Sum so far.
    pub current: i64,
    /// Summands still to add.
    pub left: usize,
}

impl fmt::Display for AddStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.left == 0 {
            write!(f, "total: {}", self.current)
        } else {
            write!(f, "intermediate result: {}; {} left", self.current, self.left)
        }
    }
}

/// Option pausing `encode-add` between values, in milliseconds.
pub const DELAY_OPTION: &str = "delay-ms";

fn summands() -> ArgSpec {
    ArgSpec::new("summands", true, true, "Values to sum.")
}

fn parse_summand(raw: &str) -> Result<i64> {
    raw.trim().parse().map_err(|err| {
        AppError::command(ErrorCode::Client, format!("invalid summand {raw:?}: {err}"))
    })
}

/// Running totals over `arguments`, one per summand.
///
/// # Errors
///
/// Returns a [`ErrorCode::Client`] error for the first summand that is not
/// an integer.
pub fn running_sums(arguments: &[String]) -> Result<Vec<AddStatus>> {
    let mut sum = 0_i64;
    arguments
        .iter()
        .enumerate()
        .map(|(i, raw)| {
            sum = sum.saturating_add(parse_summand(raw)?);
            Ok(AddStatus {
                current: sum,
                left: arguments.len() - i - 1,
            })
        })
        .collect()
}

fn add() -> Command {
    Command::new(|req: Request, re, _env| async move {
        for status in running_sums(req.arguments())? {
            re.emit(Payload::text(status.to_string())).await?;
        }
        Ok::<(), AppError>(())
    })
    .argument(summands())
}

fn encode_add() -> Command {
    Command::new(|req: Request, re, _env| async move {
        let delay = match req.option(DELAY_OPTION) {
            Some(OptionValue::Uint(ms)) => Duration::from_millis(*ms),
            _ => Duration::ZERO,
        };
        let sums = running_sums(req.arguments())?;
        re.set_length(sums.len() as u64).await;
        for status in sums {
            re.emit_value(&status).await?;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        Ok::<(), AppError>(())
    })
    .argument(summands())
    .option(OptionSpec::new(
        DELAY_OPTION,
        OptionKind::Uint,
        "Pause between values.",
    ))
    .encoder(Encoding::Text, status_text())
}

/// Text rendering of [`AddStatus`].
#[must_use]
pub fn status_text() -> Encoder {
    Encoder::typed(|_req: &Request, sink: &mut dyn Write, status: AddStatus| {
        Ok(writeln!(sink, "{status}")?)
    })
}

fn echo() -> Command {
    Command::new(|req: Request, re, _env| async move {
        for file in req.files().iter() {
            re.emit(Payload::text(String::from_utf8_lossy(&file.data)))
                .await?;
        }
        Ok::<(), AppError>(())
    })
}

fn version() -> Command {
    Command::new(|_req: Request, re, _env| async move {
        re.emit_once(Payload::text(env!("CARGO_PKG_VERSION"))).await
    })
    .read_only()
}

/// Root of the adder tree.
#[must_use]
pub fn root() -> Command {
    Command::namespace()
        .subcommand("add", add())
        .subcommand("encode-add", encode_add())
        .subcommand("echo", echo())
        .subcommand("version", version())
}
