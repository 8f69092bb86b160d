//! # tds-client
//!
//! The connection core of a TDS client driver: a nine-state session
//! state machine, the message framing and TLS negotiation beneath it,
//! a single-slot request lifecycle with attention-based cancellation,
//! and the transaction descriptor stack.
//!
//! The core ([`Connection`]) is sans-io and event-driven: feed it socket
//! bytes and timer expirations, drain outbound bytes and observable
//! events. [`Client`] wraps it in a tokio task for everyday use:
//!
//! ```rust,ignore
//! use tds_client::{Client, Config};
//!
//! let config = Config::new("db.example.test", "sa", "secret");
//! let (client, _events) = Client::connect(config).await?;
//! let result = client.exec_sql_batch("select name from sys.databases").await?;
//! println!("{} rows", result.row_count);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod event;
pub mod instance;
pub mod request;
pub mod state;
pub mod transaction;

pub use config::{Config, ConnectOptions, DebugOptions, DEFAULT_PORT};
pub use connection::Connection;
pub use driver::{Client, Events, ExecResult};
pub use error::{ConfigError, ConnectionError, ErrorCode, RequestError};
pub use event::ConnectionEvent;
pub use instance::{InstanceResolver, NoInstanceResolver};
pub use request::Request;
pub use state::{Event, State};
pub use transaction::{IsolationLevel, Transaction};

pub use tds_wire::rpc::{ParamValue, RpcParam};
pub use tds_wire::token::Row;
pub use tds_wire::TdsVersion;
