#![forbid(unsafe_code)]

//! Command execution with streamed responses.
//!
//! A command handler writes values into an [`stream::Emitter`]; the caller
//! reads them from the paired consumer, either in process or across HTTP
//! through [`http::server`] and [`http::client`].

pub mod command;
pub mod config;
pub mod demo;
pub mod encoding;
pub mod errors;
pub mod http;
pub mod request;
pub mod stream;

pub use config::ServerConfig;
pub use errors::{AppError, Result};
