//! Server configuration parsing and validation.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

use serde::Deserialize;

use crate::request::Encoding;
use crate::{AppError, Result};

/// Default line limit for newline-delimited JSON bodies: 1 MiB.
pub const DEFAULT_MAX_LINE_BYTES: usize = 1_048_576;

fn default_http_port() -> u16 {
    6798
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_api_path() -> String {
    "/api/v0".into()
}

fn default_max_line_bytes() -> usize {
    DEFAULT_MAX_LINE_BYTES
}

/// HTTP server configuration parsed from `cmdpipe.toml`.
///
/// Every field has a default, so an empty document is a valid config.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct ServerConfig {
    /// TCP port for the HTTP transport.
    pub http_port: u16,
    /// Interface to bind.
    pub bind_address: IpAddr,
    /// URL prefix under which command paths are mounted.
    pub api_path: String,
    /// Origins allowed to call the API. `*` allows any origin.
    pub allowed_origins: Vec<String>,
    /// Accept `GET` for commands marked read-only.
    pub allow_get: bool,
    /// Maximum accepted length of one JSON line on the client side.
    pub max_line_bytes: usize,
    /// Encoding used when a request does not negotiate one.
    pub default_encoding: Encoding,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            bind_address: default_bind_address(),
            api_path: default_api_path(),
            allowed_origins: Vec::new(),
            allow_get: false,
            max_line_bytes: default_max_line_bytes(),
            default_encoding: Encoding::Json,
        }
    }
}

impl ServerConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Socket address the server binds to.
    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.http_port)
    }

    /// Whether a browser origin passes the allow-list.
    #[must_use]
    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins
            .iter()
            .any(|allowed| allowed == "*" || allowed.eq_ignore_ascii_case(origin))
    }

    fn validate(&mut self) -> Result<()> {
        if !self.api_path.starts_with('/') {
            return Err(AppError::Config("api_path must start with '/'".into()));
        }

        let trimmed = self.api_path.trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(AppError::Config("api_path must not be the root".into()));
        }
        self.api_path = trimmed.to_owned();

        if self.max_line_bytes == 0 {
            return Err(AppError::Config(
                "max_line_bytes must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}
