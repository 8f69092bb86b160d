//! Async driver: pumps a TCP socket through the connection core.
//!
//! The core in [`crate::connection`] is sans-io; this module supplies the
//! io. One tokio task owns the socket and the [`Connection`], reading
//! socket bytes into [`Connection::feed`], flushing the core's outbound
//! queue, arming the connect timer, and applying caller commands that
//! arrive over a channel. [`Client`] is the cheap cloneable handle that
//! sends those commands and awaits their completion.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use tds_wire::rpc::RpcParam;
use tds_wire::token::Row;

use crate::config::Config;
use crate::connection::Connection;
use crate::error::{ConnectionError, ErrorCode, RequestError};
use crate::event::ConnectionEvent;
use crate::instance::{InstanceResolver, NoInstanceResolver};
use crate::state::Event;
use crate::transaction::IsolationLevel;

/// Outcome of a completed request.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Sum of the server's reported row counts.
    pub row_count: u64,
    /// Collected rows, when a row-collection option is enabled.
    pub rows: Vec<Row>,
}

/// Stream of connection events for the caller to observe.
pub type Events = mpsc::UnboundedReceiver<ConnectionEvent>;

type RequestReply = oneshot::Sender<(Option<RequestError>, u64, Vec<Row>)>;
type TransactionReply = oneshot::Sender<(Option<RequestError>, u64)>;
type PrepareReply = oneshot::Sender<(Option<RequestError>, Option<i32>)>;

enum Command {
    SqlBatch {
        sql: String,
        reply: RequestReply,
    },
    ExecSql {
        sql: String,
        params: Vec<RpcParam>,
        reply: RequestReply,
    },
    Prepare {
        sql: String,
        params: Vec<RpcParam>,
        reply: PrepareReply,
    },
    Execute {
        handle: i32,
        params: Vec<RpcParam>,
        reply: RequestReply,
    },
    Unprepare {
        handle: i32,
        reply: RequestReply,
    },
    CallProcedure {
        name: String,
        params: Vec<RpcParam>,
        reply: RequestReply,
    },
    BeginTransaction {
        name: String,
        isolation: Option<IsolationLevel>,
        reply: TransactionReply,
    },
    CommitTransaction {
        reply: TransactionReply,
    },
    RollbackTransaction {
        reply: TransactionReply,
    },
    Reset {
        reply: RequestReply,
    },
    Cancel,
    Close,
}

/// Async handle to a driven connection.
#[derive(Clone, Debug)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
}

impl Client {
    /// Connect, log in, and run the initial session batch.
    ///
    /// Resolves when the connection reaches `LoggedIn`; the returned
    /// [`Events`] stream carries everything the connection emits,
    /// starting with the `connect` event itself.
    pub async fn connect(config: Config) -> Result<(Self, Events), ConnectionError> {
        Self::connect_with_resolver(config, Arc::new(NoInstanceResolver)).await
    }

    /// Connect with a custom named-instance resolver.
    pub async fn connect_with_resolver(
        config: Config,
        resolver: Arc<dyn InstanceResolver>,
    ) -> Result<(Self, Events), ConnectionError> {
        let connection =
            Connection::new(config).map_err(|e| ConnectionError::new(e.to_string(), None))?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(run_connection(
            connection,
            resolver,
            command_rx,
            event_tx,
            ready_tx,
        ));

        match ready_rx.await {
            Ok(None) => Ok((Self { commands: command_tx }, event_rx)),
            Ok(Some(error)) => Err(error),
            Err(_) => Err(ConnectionError::new(
                "Connection task exited before connecting.",
                Some(ErrorCode::Socket),
            )),
        }
    }

    fn closed() -> RequestError {
        RequestError::new("Connection is closed.", Some(ErrorCode::InvalidState))
    }

    async fn request(
        &self,
        build: impl FnOnce(RequestReply) -> Command,
    ) -> Result<ExecResult, RequestError> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| Self::closed())?;
        let (error, row_count, rows) = outcome.await.map_err(|_| Self::closed())?;
        match error {
            Some(error) => Err(error),
            None => Ok(ExecResult { row_count, rows }),
        }
    }

    async fn transaction_request(
        &self,
        build: impl FnOnce(TransactionReply) -> Command,
    ) -> Result<u64, RequestError> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| Self::closed())?;
        let (error, descriptor) = outcome.await.map_err(|_| Self::closed())?;
        match error {
            Some(error) => Err(error),
            None => Ok(descriptor),
        }
    }

    /// Execute a raw SQL batch.
    pub async fn exec_sql_batch(&self, sql: impl Into<String>) -> Result<ExecResult, RequestError> {
        let sql = sql.into();
        self.request(|reply| Command::SqlBatch { sql, reply }).await
    }

    /// Execute parameterized SQL via `sp_executesql`.
    pub async fn exec_sql(
        &self,
        sql: impl Into<String>,
        params: Vec<RpcParam>,
    ) -> Result<ExecResult, RequestError> {
        let sql = sql.into();
        self.request(|reply| Command::ExecSql { sql, params, reply })
            .await
    }

    /// Prepare a statement, returning its handle.
    pub async fn prepare(
        &self,
        sql: impl Into<String>,
        params: Vec<RpcParam>,
    ) -> Result<i32, RequestError> {
        let sql = sql.into();
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(Command::Prepare { sql, params, reply })
            .map_err(|_| Self::closed())?;
        let (error, handle) = outcome.await.map_err(|_| Self::closed())?;
        if let Some(error) = error {
            return Err(error);
        }
        handle.ok_or_else(|| {
            RequestError::new("Server did not return a statement handle.", None)
        })
    }

    /// Execute a prepared statement.
    pub async fn execute(
        &self,
        handle: i32,
        params: Vec<RpcParam>,
    ) -> Result<ExecResult, RequestError> {
        self.request(|reply| Command::Execute {
            handle,
            params,
            reply,
        })
        .await
    }

    /// Release a prepared statement.
    pub async fn unprepare(&self, handle: i32) -> Result<ExecResult, RequestError> {
        self.request(|reply| Command::Unprepare { handle, reply })
            .await
    }

    /// Call a stored procedure by name.
    pub async fn call_procedure(
        &self,
        name: impl Into<String>,
        params: Vec<RpcParam>,
    ) -> Result<ExecResult, RequestError> {
        let name = name.into();
        self.request(|reply| Command::CallProcedure {
            name,
            params,
            reply,
        })
        .await
    }

    /// Begin a transaction; resolves to the new transaction descriptor.
    pub async fn begin_transaction(
        &self,
        name: impl Into<String>,
        isolation: Option<IsolationLevel>,
    ) -> Result<u64, RequestError> {
        let name = name.into();
        self.transaction_request(|reply| Command::BeginTransaction {
            name,
            isolation,
            reply,
        })
        .await
    }

    /// Commit the innermost transaction.
    pub async fn commit_transaction(&self) -> Result<u64, RequestError> {
        self.transaction_request(|reply| Command::CommitTransaction { reply })
            .await
    }

    /// Roll the innermost transaction back.
    pub async fn rollback_transaction(&self) -> Result<u64, RequestError> {
        self.transaction_request(|reply| Command::RollbackTransaction { reply })
            .await
    }

    /// Reset session state on the next request.
    pub async fn reset(&self) -> Result<ExecResult, RequestError> {
        self.request(|reply| Command::Reset { reply }).await
    }

    /// Cancel the in-flight request.
    pub fn cancel(&self) {
        let _ = self.commands.send(Command::Cancel);
    }

    /// Close the connection.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

async fn run_connection(
    mut connection: Connection,
    resolver: Arc<dyn InstanceResolver>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    ready: oneshot::Sender<Option<ConnectionError>>,
) {
    let host = connection.config().server.clone();
    let connect_timeout = connection.config().options.connect_timeout;
    let mut ready = Some(ready);

    let timer = tokio::time::sleep(connect_timeout);
    tokio::pin!(timer);

    // Resolve the port, directly or through the instance resolver.
    let port = match connection.config().static_port() {
        Some(port) => Some(port),
        None => {
            let instance = connection
                .config()
                .options
                .instance_name
                .clone()
                .unwrap_or_default();
            match resolver.resolve(&host, &instance) {
                Ok(port) => Some(port),
                Err(message) => {
                    connection.instance_lookup_failed(message);
                    None
                }
            }
        }
    };
    pump_events(&mut connection, &events, &mut ready);

    let stream = match port {
        Some(port) => {
            tokio::select! {
                result = TcpStream::connect((host.as_str(), port)) => match result {
                    Ok(stream) => Some(stream),
                    Err(e) => {
                        connection.dispatch(Event::SocketError(e));
                        None
                    }
                },
                () = &mut timer => {
                    connection.dispatch(Event::ConnectTimeout);
                    None
                }
            }
        }
        None => {
            // Lookup failed: the state machine stays put until the
            // connect timer closes it.
            timer.as_mut().await;
            connection.dispatch(Event::ConnectTimeout);
            None
        }
    };
    pump_events(&mut connection, &events, &mut ready);

    let Some(mut stream) = stream else {
        return;
    };

    connection.dispatch(Event::SocketConnect);

    let mut buf = vec![0u8; 16 * 1024];
    loop {
        if let Err(e) = flush(&mut connection, &mut stream).await {
            connection.dispatch(Event::SocketError(e));
        }
        pump_events(&mut connection, &events, &mut ready);
        if connection.is_closed() {
            break;
        }

        tokio::select! {
            biased;

            command = commands.recv() => match command {
                Some(command) => apply_command(&mut connection, command),
                None => connection.close(),
            },

            () = &mut timer, if connection.connect_timer_armed() => {
                connection.dispatch(Event::ConnectTimeout);
            },

            result = stream.read(&mut buf) => match result {
                Ok(0) => connection.dispatch(Event::SocketError(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "server closed the connection",
                ))),
                Ok(n) => connection.feed(&buf[..n]),
                Err(e) => connection.dispatch(Event::SocketError(e)),
            },
        }
    }
    pump_events(&mut connection, &events, &mut ready);
    // The socket drops here, in Final.
}

fn apply_command(connection: &mut Connection, command: Command) {
    match command {
        Command::SqlBatch { sql, reply } => {
            connection.exec_sql_batch(&sql, reply_sink(reply));
        }
        Command::ExecSql { sql, params, reply } => {
            connection.exec_sql(&sql, params, reply_sink(reply));
        }
        Command::Prepare { sql, params, reply } => {
            connection.prepare(&sql, params, move |error, handle| {
                let _ = reply.send((error, handle));
            });
        }
        Command::Execute {
            handle,
            params,
            reply,
        } => {
            connection.execute(handle, params, reply_sink(reply));
        }
        Command::Unprepare { handle, reply } => {
            connection.unprepare(handle, reply_sink(reply));
        }
        Command::CallProcedure {
            name,
            params,
            reply,
        } => {
            connection.call_procedure(&name, params, reply_sink(reply));
        }
        Command::BeginTransaction {
            name,
            isolation,
            reply,
        } => {
            connection.begin_transaction(&name, isolation, move |error, descriptor| {
                let _ = reply.send((error, descriptor));
            });
        }
        Command::CommitTransaction { reply } => {
            connection.commit_transaction(move |error, descriptor| {
                let _ = reply.send((error, descriptor));
            });
        }
        Command::RollbackTransaction { reply } => {
            connection.rollback_transaction(move |error, descriptor| {
                let _ = reply.send((error, descriptor));
            });
        }
        Command::Reset { reply } => {
            connection.reset(reply_sink(reply));
        }
        Command::Cancel => {
            connection.cancel();
        }
        Command::Close => connection.close(),
    }
}

fn reply_sink(
    reply: RequestReply,
) -> impl FnOnce(Option<RequestError>, u64, Vec<Row>) + Send + 'static {
    move |error, row_count, rows| {
        let _ = reply.send((error, row_count, rows));
    }
}

async fn flush(connection: &mut Connection, stream: &mut TcpStream) -> io::Result<()> {
    while connection.has_outbound() {
        let bytes = connection.take_outbound();
        stream.write_all(&bytes).await?;
    }
    Ok(())
}

fn pump_events(
    connection: &mut Connection,
    events: &mpsc::UnboundedSender<ConnectionEvent>,
    ready: &mut Option<oneshot::Sender<Option<ConnectionError>>>,
) {
    while let Some(event) = connection.poll_event() {
        if let ConnectionEvent::Connect(ref error) = event {
            if let Some(ready) = ready.take() {
                let _ = ready.send(error.clone());
            }
        }
        let _ = events.send(event);
    }
}
