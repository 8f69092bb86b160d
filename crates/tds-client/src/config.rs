//! Connection configuration.

use std::time::Duration;

use tds_tls::TlsOptions;
use tds_wire::TdsVersion;
use tds_wire::packet::DEFAULT_PACKET_SIZE;

use crate::error::ConfigError;
use crate::transaction::IsolationLevel;

/// Default port when neither a port nor an instance name is configured.
pub const DEFAULT_PORT: u16 = 1433;

/// Which diagnostic classes produce `debug` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugOptions {
    /// Log packet headers.
    pub packet: bool,
    /// Log packet payload bytes.
    pub data: bool,
    /// Log decoded payloads.
    pub payload: bool,
    /// Log parsed tokens.
    pub token: bool,
}

/// Per-connection options.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Server port. Mutually exclusive with `instance_name`; defaults to
    /// 1433 when neither is set.
    pub port: Option<u32>,
    /// Named instance to resolve a port for. Mutually exclusive with
    /// `port`.
    pub instance_name: Option<String>,
    /// Initial database.
    pub database: Option<String>,
    /// Application name reported in LOGIN7.
    pub app_name: String,
    /// Outbound packet size until the server renegotiates it.
    pub packet_size: u32,
    /// TDS version to request.
    pub tds_version: TdsVersion,
    /// Time allowed from starting to connect until `connect` is emitted.
    pub connect_timeout: Duration,
    /// Per-request timeout, enforced by the layer driving `cancel`.
    pub request_timeout: Duration,
    /// Time allowed for an attention acknowledgement, enforced by the
    /// layer driving `cancel`.
    pub cancel_timeout: Duration,
    /// `set textsize` value in the initial session batch.
    pub textsize: u32,
    /// Isolation level for transactions begun without an explicit one.
    pub isolation_level: IsolationLevel,
    /// Ask the server for an encrypted session.
    pub encrypt: bool,
    /// TLS trust settings used when encryption is negotiated.
    pub tls: TlsOptions,
    /// Interpret server datetimes as UTC.
    pub use_utc: bool,
    /// Deduplicate result columns by name, keeping the first occurrence.
    pub use_column_names: bool,
    /// Collect rows and hand them to the request completion callback.
    pub row_collection_on_request_completion: bool,
    /// Collect rows per statement, resetting the buffer at each `done`.
    pub row_collection_on_done: bool,
    /// Diagnostic classes to surface as `debug` events.
    pub debug: DebugOptions,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            port: None,
            instance_name: None,
            database: None,
            app_name: "tds-client".into(),
            packet_size: DEFAULT_PACKET_SIZE as u32,
            tds_version: TdsVersion::V7_4,
            connect_timeout: Duration::from_millis(15_000),
            request_timeout: Duration::from_millis(15_000),
            cancel_timeout: Duration::from_millis(5_000),
            textsize: 2_147_483_647,
            isolation_level: IsolationLevel::ReadCommitted,
            encrypt: false,
            tls: TlsOptions::default(),
            use_utc: true,
            use_column_names: false,
            row_collection_on_request_completion: false,
            row_collection_on_done: false,
            debug: DebugOptions::default(),
        }
    }
}

/// Connection configuration: where to connect and how to authenticate.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host name or address.
    pub server: String,
    /// Login name.
    pub user_name: String,
    /// Password.
    pub password: String,
    /// Everything else.
    pub options: ConnectOptions,
}

impl Config {
    /// Create a configuration with default options.
    #[must_use]
    pub fn new(
        server: impl Into<String>,
        user_name: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            server: server.into(),
            user_name: user_name.into(),
            password: password.into(),
            options: ConnectOptions::default(),
        }
    }

    /// Replace the options wholesale.
    #[must_use]
    pub fn with_options(mut self, options: ConnectOptions) -> Self {
        self.options = options;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.is_empty() {
            return Err(ConfigError::MissingServer);
        }
        if let Some(port) = self.options.port {
            if port == 0 || port >= 65_536 {
                return Err(ConfigError::PortOutOfRange(port));
            }
            if self.options.instance_name.is_some() {
                return Err(ConfigError::PortAndInstanceName);
            }
        }
        Ok(())
    }

    /// The port to connect to, or `None` when an instance lookup is
    /// needed first.
    #[must_use]
    pub fn static_port(&self) -> Option<u16> {
        if self.options.instance_name.is_some() {
            return None;
        }
        Some(self.options.port.map_or(DEFAULT_PORT, |p| p as u16))
    }
}
