//! Client configuration parsing, validation, and address discovery.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::rpc::framing::DEFAULT_MAX_FRAME_BYTES;
use crate::rpc::connection::DEFAULT_MAX_CONCURRENT_INVOCATIONS;
use crate::rpc::ConnectionOptions;
use crate::{AppError, Result};

/// File in which the peer advertises its host address.
pub const ADDRESS_FILE: &str = "act-r-address.txt";

/// File in which the peer advertises its port number.
pub const PORT_FILE: &str = "act-r-port-num.txt";

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    2650
}

fn default_client_name() -> String {
    "actr-remote".into()
}

fn default_true() -> bool {
    true
}

fn default_trace_monitor_prefix() -> String {
    "rust-echo".into()
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

fn default_max_concurrent_invocations() -> usize {
    DEFAULT_MAX_CONCURRENT_INVOCATIONS
}

/// Client configuration parsed from a TOML file.
///
/// Every key is optional:
///
/// ```toml
/// host = "127.0.0.1"
/// port = 2650
/// client_name = "actr-remote"
/// echo_output = true
/// show_output = true
/// trace_monitor_prefix = "rust-echo"
/// max_frame_bytes = 16777216
/// max_concurrent_invocations = 64
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ClientConfig {
    /// Peer host name or address.
    #[serde(default = "default_host")]
    pub host: String,
    /// Peer TCP port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Name announced with `set-name`; also the local registration owner.
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// Install the trace output monitor after connecting.
    #[serde(default = "default_true")]
    pub echo_output: bool,
    /// Forward trace lines to subscribers.
    #[serde(default = "default_true")]
    pub show_output: bool,
    /// Prefix of the peer-side trace monitor procedure name.
    #[serde(default = "default_trace_monitor_prefix")]
    pub trace_monitor_prefix: String,
    /// Largest inbound frame accepted, in bytes.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Peer invocations of local procedures allowed to run at once.
    #[serde(default = "default_max_concurrent_invocations")]
    pub max_concurrent_invocations: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_name: default_client_name(),
            echo_output: true,
            show_output: true,
            trace_monitor_prefix: default_trace_monitor_prefix(),
            max_frame_bytes: default_max_frame_bytes(),
            max_concurrent_invocations: default_max_concurrent_invocations(),
        }
    }
}

impl ClientConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read, contains
    /// invalid TOML, or fails validation.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Override host and port with the values the peer advertises in `dir`.
    ///
    /// Missing files leave the current values in place; unreadable or
    /// unparsable contents are logged and ignored.
    pub fn apply_address_files(&mut self, dir: impl AsRef<Path>) {
        let dir = dir.as_ref();

        if let Some(host) = read_trimmed(&dir.join(ADDRESS_FILE)) {
            debug!(%host, "config: peer address discovered");
            self.host = host;
        }

        if let Some(raw) = read_trimmed(&dir.join(PORT_FILE)) {
            match raw.parse::<u16>() {
                Ok(port) if port != 0 => {
                    debug!(port, "config: peer port discovered");
                    self.port = port;
                }
                _ => warn!(value = %raw, "config: ignoring invalid advertised port"),
            }
        }
    }

    /// Options for [`crate::rpc::Connection`].
    #[must_use]
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            owner: self.client_name.clone(),
            max_frame_bytes: self.max_frame_bytes,
            max_concurrent_invocations: self.max_concurrent_invocations,
        }
    }

    /// Check field invariants.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(AppError::Config("host must not be empty".into()));
        }

        if self.port == 0 {
            return Err(AppError::Config("port must be greater than zero".into()));
        }

        if self.client_name.trim().is_empty() {
            return Err(AppError::Config("client_name must not be empty".into()));
        }

        if self.trace_monitor_prefix.trim().is_empty() {
            return Err(AppError::Config(
                "trace_monitor_prefix must not be empty".into(),
            ));
        }

        if self.max_frame_bytes < 1024 {
            return Err(AppError::Config(
                "max_frame_bytes must be at least 1024".into(),
            ));
        }

        if self.max_concurrent_invocations == 0 {
            return Err(AppError::Config(
                "max_concurrent_invocations must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(raw) => {
            let trimmed = raw.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_owned())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => {
            warn!(path = %path.display(), %err, "config: failed to read address file");
            None
        }
    }
}
