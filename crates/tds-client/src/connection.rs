//! The connection core.
//!
//! [`Connection`] is the session state machine. It is sans-io and
//! single-writer: the owner feeds it socket bytes and timer expirations,
//! and drains caller-observable events plus wire-ready outbound bytes.
//! All session state — the current FSM state, the single request slot,
//! the transaction descriptor stack, the login window — is mutated only
//! from [`dispatch`](Connection::dispatch) and the user API methods, all
//! of which run on the owner's task.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::BytesMut;
use tds_framing::{IoEvent, MessageIo};
use tds_tls::TlsEngine;
use tds_wire::login7::Login7;
use tds_wire::packet::PacketType;
use tds_wire::prelogin::{EncryptionLevel, PreloginMessage};
use tds_wire::rpc::RpcParam;
use tds_wire::token::{Column, ColumnMetadata, DoneToken, Row, TokenEvent, TokenStreamParser};
use tds_wire::TdsVersion;

use crate::config::Config;
use crate::error::{ConfigError, ConnectionError, ErrorCode, RequestError};
use crate::event::ConnectionEvent;
use crate::request::{Request, TmOp, TransactionSink};
use crate::state::{Event, State};
use crate::transaction::{IsolationLevel, Transaction};

/// The LOGINACK interface value for T-SQL.
const INTERFACE_TSQL: u8 = 1;

/// A TDS session: configuration, state machine, framing engine, token
/// parser, the single request slot and the transaction stack.
pub struct Connection {
    config: Config,
    state: State,
    io: MessageIo,
    parser: TokenStreamParser,
    events: VecDeque<ConnectionEvent>,

    /// PRELOGIN responses are buffered whole before parsing.
    prelogin_response: BytesMut,

    request: Option<Request>,
    transactions: Vec<Transaction>,
    /// Server-issued transaction descriptors; the bottom entry is the
    /// zero sentinel pushed at construction, so `current` always exists.
    transaction_descriptors: Vec<u64>,

    tds_version: TdsVersion,
    logged_in: bool,
    login_error: Option<ConnectionError>,
    tls_negotiated: bool,
    reset_on_next_request: bool,
    proc_return_status: Option<i32>,

    connect_emitted: bool,
    connect_timer_armed: bool,
    closed: bool,
}

impl Connection {
    /// Validate the configuration and construct a connection in the
    /// `Connecting` state.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let tds_version = config.options.tds_version;
        let packet_size = config.options.packet_size as usize;
        Ok(Self {
            config,
            state: State::Connecting,
            io: MessageIo::new(packet_size),
            parser: TokenStreamParser::new(),
            events: VecDeque::new(),
            prelogin_response: BytesMut::new(),
            request: None,
            transactions: Vec::new(),
            transaction_descriptors: vec![0],
            tds_version,
            logged_in: false,
            login_error: None,
            tls_negotiated: false,
            reset_on_next_request: false,
            proc_return_status: None,
            connect_emitted: false,
            connect_timer_armed: true,
            closed: false,
        })
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    /// Whether the connection has reached `Final`.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether the connect timer should be running.
    #[must_use]
    pub fn connect_timer_armed(&self) -> bool {
        self.connect_timer_armed
    }

    /// The connection's configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The descriptor stack, sentinel first.
    #[must_use]
    pub fn transaction_descriptors(&self) -> &[u64] {
        &self.transaction_descriptors
    }

    /// Top of the descriptor stack; attached to every outbound request.
    #[must_use]
    pub fn current_transaction_descriptor(&self) -> u64 {
        self.transaction_descriptors.last().copied().unwrap_or(0)
    }

    /// Current outbound packet size.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.io.packet_size()
    }

    /// Return status stashed from the current request's RETURNSTATUS
    /// token; cleared when the procedure's `doneProc` arrives.
    #[must_use]
    pub fn proc_return_status(&self) -> Option<i32> {
        self.proc_return_status
    }

    /// Pop the next caller-observable event.
    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    /// Whether wire bytes are queued for the socket.
    #[must_use]
    pub fn has_outbound(&self) -> bool {
        self.io.has_outbound()
    }

    /// Take queued wire bytes.
    pub fn take_outbound(&mut self) -> bytes::Bytes {
        self.io.take_outbound()
    }

    /// Feed bytes read from the socket.
    pub fn feed(&mut self, bytes: &[u8]) {
        match self.io.receive(bytes) {
            Ok(io_events) => {
                for io_event in io_events {
                    match io_event {
                        IoEvent::Data(data) => self.dispatch(Event::Data(data)),
                        IoEvent::Message => self.dispatch(Event::Message),
                    }
                }
            }
            Err(e) => self.fatal(ConnectionError::new(
                format!("Framing error: {e}"),
                Some(ErrorCode::Socket),
            )),
        }
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    /// Dispatch one event against the current state.
    pub fn dispatch(&mut self, event: Event) {
        match (self.state, event) {
            // Final is a sink for everything.
            (State::Final, _) => {}

            (State::Connecting, Event::SocketConnect) => {
                self.send_prelogin();
                self.transition(State::SentPrelogin);
            }

            (State::SentPrelogin, Event::Data(data)) => {
                self.prelogin_response.extend_from_slice(&data);
            }
            (State::SentPrelogin, Event::Message) => self.evaluate_prelogin_response(),
            (State::SentPrelogin, Event::Tls) => {
                if self.start_tls_negotiation() {
                    self.send_login7();
                    self.transition(State::SentTlsSslNegotiation);
                }
            }
            (State::SentPrelogin, Event::NoTls) => {
                self.send_login7();
                self.transition(State::SentLogin7WithStandardLogin);
            }

            (State::SentTlsSslNegotiation, Event::Data(data)) => {
                match self.io.tls_handshake_data(&data) {
                    Ok(true) => self.dispatch(Event::TlsNegotiated),
                    Ok(false) => {}
                    Err(e) => self.fatal_login(ConnectionError::new(
                        format!("TLS negotiation failed: {e}"),
                        Some(ErrorCode::Socket),
                    )),
                }
            }
            (State::SentTlsSslNegotiation, Event::TlsNegotiated) => {
                self.tls_negotiated = true;
                self.emit(ConnectionEvent::Secure);
            }
            (State::SentTlsSslNegotiation, Event::Message) => {
                if self.tls_negotiated {
                    match self.io.encrypt_all_future_traffic() {
                        Ok(()) => self.transition(State::SentLogin7WithStandardLogin),
                        Err(e) => self.fatal_login(ConnectionError::new(
                            format!("TLS negotiation failed: {e}"),
                            Some(ErrorCode::Socket),
                        )),
                    }
                }
                // An intermediate handshake message otherwise: progress is
                // driven by the data packets fed to the engine, so there
                // is nothing to act on here.
            }

            (
                State::SentLogin7WithStandardLogin
                | State::LoggedInSendingInitialSql
                | State::SentClientRequest
                | State::SentAttention,
                Event::Data(data),
            ) => self.feed_parser(&data),

            (State::SentLogin7WithStandardLogin, Event::Message) => {
                if self.logged_in {
                    self.dispatch(Event::LoggedIn);
                } else {
                    let error = self.login_error.take().unwrap_or_else(|| {
                        ConnectionError::new("Login failed.", Some(ErrorCode::Login))
                    });
                    self.emit_connect(Some(error));
                    self.dispatch(Event::LoginFailed);
                }
            }
            (State::SentLogin7WithStandardLogin, Event::LoggedIn) => {
                self.transition(State::LoggedInSendingInitialSql);
            }
            (State::SentLogin7WithStandardLogin, Event::LoginFailed) => {
                self.transition(State::Final);
            }

            (State::LoggedInSendingInitialSql, Event::Message) => {
                self.connect_timer_armed = false;
                self.emit_connect(None);
                self.transition(State::LoggedIn);
            }

            (State::SentClientRequest, Event::Message) => {
                self.transition(State::LoggedIn);
                self.complete_request(None);
            }

            (State::SentAttention, Event::Message) => {
                // Messages between the attention signal and its
                // acknowledgement are discarded wholesale.
                let acknowledged = self.request.as_ref().is_some_and(|r| r.canceled);
                if acknowledged {
                    self.transition(State::LoggedIn);
                    self.complete_request(Some(RequestError::new(
                        "Canceled.",
                        Some(ErrorCode::Cancel),
                    )));
                }
            }

            // Socket failure is fatal wherever it happens.
            (_, Event::SocketError(e)) => {
                let error = ConnectionError::new(
                    format!("Socket error: {e}"),
                    Some(ErrorCode::Socket),
                );
                if self.request.is_some() {
                    self.complete_request(Some(RequestError::new(
                        format!("Socket error: {e}"),
                        Some(ErrorCode::Socket),
                    )));
                }
                if self.connect_emitted {
                    self.emit(ConnectionEvent::Error(error));
                } else {
                    self.emit_connect(Some(error));
                }
                self.transition(State::Final);
            }

            // The connect timer can fire in any pre-login state.
            (_, Event::ConnectTimeout) if self.connect_timer_armed => {
                let message = format!(
                    "Failed to connect to {} in {:?}",
                    self.config.server, self.config.options.connect_timeout
                );
                self.emit_connect(Some(ConnectionError::new(
                    message,
                    Some(ErrorCode::Timeout),
                )));
                self.transition(State::Final);
            }

            (state, event) => self.fatal(ConnectionError::new(
                format!("No event '{}' in state '{}'", event.name(), state.name()),
                None,
            )),
        }
    }

    fn transition(&mut self, to: State) {
        if self.state == to {
            return;
        }
        tracing::debug!(from = self.state.name(), to = to.name(), "state transition");
        self.emit(ConnectionEvent::Debug(format!(
            "State change: {} -> {}",
            self.state.name(),
            to.name()
        )));
        self.state = to;

        // Entry actions.
        match to {
            State::SentPrelogin => self.prelogin_response.clear(),
            State::LoggedInSendingInitialSql => self.send_initial_sql(),
            State::Final => self.cleanup(),
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Login sequence
    // ------------------------------------------------------------------

    fn send_prelogin(&mut self) {
        let encryption = if self.config.options.encrypt {
            EncryptionLevel::On
        } else {
            EncryptionLevel::Off
        };
        let mut prelogin = PreloginMessage::new().with_encryption(encryption);
        if let Some(ref instance) = self.config.options.instance_name {
            prelogin = prelogin.with_instance(instance.clone());
        }
        let payload = prelogin.encode();
        self.send(PacketType::Prelogin, &payload);
    }

    fn evaluate_prelogin_response(&mut self) {
        let payload = self.prelogin_response.split().freeze();
        match PreloginMessage::decode(&payload) {
            Ok(response) => {
                self.emit(ConnectionEvent::Debug(format!(
                    "PreLogin response: encryption {:?}",
                    response.encryption
                )));
                if response.encryption.requires_tls() {
                    self.dispatch(Event::Tls);
                } else {
                    self.dispatch(Event::NoTls);
                }
            }
            Err(e) => self.fatal_login(ConnectionError::new(
                format!("Malformed PreLogin response: {e}"),
                Some(ErrorCode::Login),
            )),
        }
    }

    /// Build the TLS engine and hand it to the framing layer. Returns
    /// false when setup fails, in which case the connection is closing.
    fn start_tls_negotiation(&mut self) -> bool {
        let server_name = self
            .config
            .options
            .tls
            .server_name
            .clone()
            .unwrap_or_else(|| self.config.server.clone());

        let engine = match self
            .config
            .options
            .tls
            .build()
            .and_then(|tls_config| TlsEngine::new(tls_config, &server_name))
        {
            Ok(engine) => engine,
            Err(e) => {
                self.fatal_login(ConnectionError::new(
                    format!("TLS negotiation failed: {e}"),
                    Some(ErrorCode::Socket),
                ));
                return false;
            }
        };

        if let Err(e) = self.io.tls_negotiation_starting(engine) {
            self.fatal_login(ConnectionError::new(
                format!("TLS negotiation failed: {e}"),
                Some(ErrorCode::Socket),
            ));
            return false;
        }
        true
    }

    fn send_login7(&mut self) {
        let options = &self.config.options;
        let login = Login7 {
            tds_version: options.tds_version,
            packet_size: options.packet_size,
            hostname: std::env::var("HOSTNAME").unwrap_or_default(),
            username: self.config.user_name.clone(),
            password: self.config.password.clone(),
            app_name: options.app_name.clone(),
            server_name: self.config.server.clone(),
            library_name: "tds-client".into(),
            database: options.database.clone().unwrap_or_default(),
            ..Login7::default()
        };
        let payload = login.encode();
        self.send(PacketType::Login7, &payload);
    }

    fn send_initial_sql(&mut self) {
        let sql = self.initial_sql();
        let payload = tds_wire::batch::encode_sql_batch(&sql, self.current_transaction_descriptor());
        self.send(PacketType::SqlBatch, &payload);
    }

    fn initial_sql(&self) -> String {
        format!(
            "set textsize {}\n\
             set quoted_identifier on\n\
             set arithabort off\n\
             set numeric_roundabort off\n\
             set ansi_warnings on\n\
             set ansi_padding on\n\
             set ansi_nulls on\n\
             set concat_null_yields_null on\n\
             set cursor_close_on_commit off\n\
             set implicit_transactions off\n\
             set language us_english\n\
             set dateformat mdy\n\
             set datefirst 7\n\
             set transaction isolation level read committed",
            self.config.options.textsize
        )
    }

    // ------------------------------------------------------------------
    // Token stream
    // ------------------------------------------------------------------

    fn feed_parser(&mut self, data: &[u8]) {
        match self.parser.add_buffer(data) {
            Ok(token_events) => {
                for token_event in token_events {
                    self.apply_token(token_event);
                    if self.state == State::Final {
                        break;
                    }
                }
            }
            Err(e) => self.fatal(ConnectionError::new(
                format!("Token stream error: {e}"),
                None,
            )),
        }
    }

    fn apply_token(&mut self, event: TokenEvent) {
        if self.config.options.debug.token {
            self.emit(ConnectionEvent::Debug(format!("token: {event:?}")));
        }
        match event {
            TokenEvent::InfoMessage(message) => {
                self.emit(ConnectionEvent::InfoMessage(message));
            }
            TokenEvent::ErrorMessage(message) => {
                if self.logged_in {
                    if let Some(request) = self.request.as_mut() {
                        if request.error.is_none() {
                            request.error = Some(RequestError::new(
                                message.message.clone(),
                                Some(ErrorCode::Request),
                            ));
                        }
                    }
                } else if self.login_error.is_none() {
                    self.login_error = Some(ConnectionError::new(
                        message.message.clone(),
                        Some(ErrorCode::Login),
                    ));
                }
                self.emit(ConnectionEvent::ErrorMessage(message));
            }
            TokenEvent::LoginAck(ack) => {
                let version = TdsVersion::from_raw(ack.tds_version);
                if ack.interface != INTERFACE_TSQL {
                    self.login_error = Some(ConnectionError::new(
                        "Server responded with unsupported interface.",
                        Some(ErrorCode::Login),
                    ));
                    self.logged_in = false;
                } else if !version.is_supported() {
                    self.login_error = Some(ConnectionError::new(
                        format!("Server responded with unknown TDS version 0x{:08X}.", ack.tds_version),
                        Some(ErrorCode::Login),
                    ));
                    self.logged_in = false;
                } else {
                    self.tds_version = version;
                    self.logged_in = true;
                }
            }
            TokenEvent::PacketSizeChange { new, .. } => {
                self.io.set_packet_size(new as usize);
            }
            TokenEvent::DatabaseChange { new, .. } => {
                self.emit(ConnectionEvent::DatabaseChange(new));
            }
            TokenEvent::LanguageChange { new, .. } => {
                self.emit(ConnectionEvent::LanguageChange(new));
            }
            TokenEvent::CharsetChange { new, .. } => {
                self.emit(ConnectionEvent::CharsetChange(new));
            }
            TokenEvent::BeginTransaction { descriptor } => {
                self.transaction_descriptors.push(descriptor);
            }
            TokenEvent::CommitTransaction | TokenEvent::RollbackTransaction => {
                // The zero sentinel at the bottom never pops.
                if self.transaction_descriptors.len() > 1 {
                    self.transaction_descriptors.pop();
                }
            }
            TokenEvent::ResetConnectionAck => {
                self.emit(ConnectionEvent::ResetConnection);
            }
            TokenEvent::ColumnMetadata(metadata) => {
                if self.request.is_none() {
                    self.fatal(ConnectionError::new(
                        "Received unexpected columnMetadata message",
                        None,
                    ));
                    return;
                }
                let metadata = if self.config.options.use_column_names {
                    Arc::new(dedupe_columns(&metadata))
                } else {
                    metadata
                };
                if let Some(request) = self.request.as_mut() {
                    request.metadata = Some(metadata);
                }
            }
            TokenEvent::Order(columns) => match self.request.as_mut() {
                Some(request) => request.order = columns,
                None => self.fatal(ConnectionError::new(
                    "Received unexpected order message",
                    None,
                )),
            },
            TokenEvent::Row(row) => {
                let collect = self.config.options.row_collection_on_request_completion
                    || self.config.options.row_collection_on_done;
                match self.request.as_mut() {
                    Some(request) => {
                        if collect {
                            request.rows.push(row);
                        }
                    }
                    None => self.fatal(ConnectionError::new(
                        "Received unexpected row message",
                        None,
                    )),
                }
            }
            TokenEvent::ReturnStatus(value) => {
                self.proc_return_status = Some(value);
            }
            TokenEvent::ReturnValue(value) => {
                if let Some(request) = self.request.as_mut() {
                    request.return_values.push(value);
                }
            }
            TokenEvent::DoneProc(done) => {
                self.apply_done(&done);
                self.proc_return_status = None;
            }
            TokenEvent::DoneInProc(done) => self.apply_done(&done),
            TokenEvent::Done(done) => {
                self.apply_done(&done);
                if done.is_attention_ack() {
                    if let Some(request) = self.request.as_mut() {
                        request.canceled = true;
                    }
                }
            }
        }
    }

    fn apply_done(&mut self, done: &DoneToken) {
        let reset_rows = self.config.options.row_collection_on_done;
        if let Some(request) = self.request.as_mut() {
            request.row_count += done.counted_rows();
            if reset_rows {
                request.rows.clear();
            }
        }
    }

    // ------------------------------------------------------------------
    // Request lifecycle
    // ------------------------------------------------------------------

    /// Install and send a request. Legal only in `LoggedIn` with an empty
    /// request slot; otherwise the request fails synchronously with
    /// `EINVALIDSTATE`.
    pub fn make_request(&mut self, request: Request) {
        if self.state != State::LoggedIn || self.request.is_some() {
            let message = format!(
                "Requests can only be made in the {} state, not the {} state",
                State::LoggedIn.name(),
                self.state.name()
            );
            request.fail(
                RequestError::new(message, Some(ErrorCode::InvalidState)),
                self.current_transaction_descriptor(),
            );
            return;
        }

        let (packet_type, payload) = request.encode(self.current_transaction_descriptor());
        if self.reset_on_next_request {
            self.io.queue_reset_connection();
            self.reset_on_next_request = false;
        }
        self.request = Some(request);
        self.send(packet_type, &payload);
        self.transition(State::SentClientRequest);
    }

    /// Execute a raw SQL batch.
    pub fn exec_sql_batch(
        &mut self,
        sql: &str,
        sink: impl FnOnce(Option<RequestError>, u64, Vec<Row>) + Send + 'static,
    ) {
        self.make_request(Request::sql_batch(sql, sink));
    }

    /// Execute parameterized SQL via `sp_executesql`.
    pub fn exec_sql(
        &mut self,
        sql: &str,
        params: Vec<RpcParam>,
        sink: impl FnOnce(Option<RequestError>, u64, Vec<Row>) + Send + 'static,
    ) {
        self.make_request(Request::exec_sql(sql, params, sink));
    }

    /// Prepare a statement via `sp_prepare`.
    pub fn prepare(
        &mut self,
        sql: &str,
        params: Vec<RpcParam>,
        sink: impl FnOnce(Option<RequestError>, Option<i32>) + Send + 'static,
    ) {
        self.make_request(Request::prepare(sql, params, sink));
    }

    /// Execute a prepared handle via `sp_execute`.
    pub fn execute(
        &mut self,
        handle: i32,
        params: Vec<RpcParam>,
        sink: impl FnOnce(Option<RequestError>, u64, Vec<Row>) + Send + 'static,
    ) {
        self.make_request(Request::execute(handle, params, sink));
    }

    /// Release a prepared handle via `sp_unprepare`.
    pub fn unprepare(
        &mut self,
        handle: i32,
        sink: impl FnOnce(Option<RequestError>, u64, Vec<Row>) + Send + 'static,
    ) {
        self.make_request(Request::unprepare(handle, sink));
    }

    /// Call a stored procedure by name.
    pub fn call_procedure(
        &mut self,
        name: &str,
        params: Vec<RpcParam>,
        sink: impl FnOnce(Option<RequestError>, u64, Vec<Row>) + Send + 'static,
    ) {
        self.make_request(Request::call_procedure(name, params, sink));
    }

    /// Cancel the in-flight request with an attention signal.
    ///
    /// Legal only in `SentClientRequest`; returns false with no side
    /// effect anywhere else.
    pub fn cancel(&mut self) -> bool {
        if self.state != State::SentClientRequest {
            return false;
        }
        self.send(PacketType::Attention, &[]);
        self.transition(State::SentAttention);
        true
    }

    fn complete_request(&mut self, override_error: Option<RequestError>) {
        if let Some(mut request) = self.request.take() {
            if let Some(error) = override_error {
                request.error = Some(error);
            }
            request.complete(self.current_transaction_descriptor());
        }
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Begin a transaction. The sink receives the new current descriptor
    /// once the server's `beginTransaction` token has arrived and the
    /// request completed.
    pub fn begin_transaction(
        &mut self,
        name: &str,
        isolation: Option<IsolationLevel>,
        sink: impl FnOnce(Option<RequestError>, u64) + Send + 'static,
    ) {
        if !self.tds_version.supports_transactions() {
            sink(
                Some(RequestError::new(
                    format!("Transactions are not supported on {}", self.tds_version),
                    None,
                )),
                self.current_transaction_descriptor(),
            );
            return;
        }
        let isolation = isolation.unwrap_or(self.config.options.isolation_level);
        self.transactions.push(Transaction::new(name, isolation));
        self.make_request(Request::transaction_manager(
            TmOp::Begin {
                isolation: isolation.tm_level(),
                name: name.into(),
            },
            Box::new(sink) as TransactionSink,
        ));
    }

    /// Commit the innermost transaction.
    pub fn commit_transaction(
        &mut self,
        sink: impl FnOnce(Option<RequestError>, u64) + Send + 'static,
    ) {
        match self.transactions.pop() {
            None => sink(
                Some(RequestError::new(
                    "No transaction in progress",
                    Some(ErrorCode::NoTransactionInProgress),
                )),
                self.current_transaction_descriptor(),
            ),
            Some(transaction) => self.make_request(Request::transaction_manager(
                TmOp::Commit {
                    name: transaction.name,
                },
                Box::new(sink) as TransactionSink,
            )),
        }
    }

    /// Roll the innermost transaction back.
    pub fn rollback_transaction(
        &mut self,
        sink: impl FnOnce(Option<RequestError>, u64) + Send + 'static,
    ) {
        match self.transactions.pop() {
            None => sink(
                Some(RequestError::new(
                    "No transaction in progress",
                    Some(ErrorCode::NoTransactionInProgress),
                )),
                self.current_transaction_descriptor(),
            ),
            Some(transaction) => self.make_request(Request::transaction_manager(
                TmOp::Rollback {
                    name: transaction.name,
                },
                Box::new(sink) as TransactionSink,
            )),
        }
    }

    /// Ask the server to reset session state on the next request, then
    /// re-issue the session-option batch.
    pub fn reset(
        &mut self,
        sink: impl FnOnce(Option<RequestError>, u64, Vec<Row>) + Send + 'static,
    ) {
        self.reset_on_next_request = true;
        let sql = self.initial_sql();
        self.exec_sql_batch(&sql, sink);
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Force the connection to `Final`.
    pub fn close(&mut self) {
        self.transition(State::Final);
    }

    /// Release resources. Runs exactly once, on entry to `Final`.
    fn cleanup(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.connect_timer_armed = false;
        if let Some(request) = self.request.take() {
            let descriptor = self.current_transaction_descriptor();
            request.fail(
                RequestError::new("Connection closed before request completed.", Some(ErrorCode::Cancel)),
                descriptor,
            );
        }
        self.logged_in = false;
        self.login_error = None;
        self.emit(ConnectionEvent::End);
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    fn send(&mut self, packet_type: PacketType, payload: &[u8]) {
        if self.closed {
            return;
        }
        if let Err(e) = self.io.send_message(packet_type, payload) {
            self.fatal(ConnectionError::new(
                format!("Failed to queue outbound message: {e}"),
                Some(ErrorCode::Socket),
            ));
        }
    }

    fn emit(&mut self, event: ConnectionEvent) {
        self.events.push_back(event);
    }

    /// Emit `connect` at most once; disarms the connect timer.
    fn emit_connect(&mut self, error: Option<ConnectionError>) {
        if self.connect_emitted {
            return;
        }
        self.connect_emitted = true;
        self.connect_timer_armed = false;
        self.events.push_back(ConnectionEvent::Connect(error));
    }

    /// A connection-fatal condition: surface the error and close.
    fn fatal(&mut self, error: ConnectionError) {
        tracing::debug!(%error, "fatal connection error");
        self.emit(ConnectionEvent::Error(error));
        self.transition(State::Final);
    }

    /// A login-window-fatal condition: surface through `connect` and
    /// close.
    fn fatal_login(&mut self, error: ConnectionError) {
        tracing::debug!(%error, "fatal login error");
        self.emit_connect(Some(error));
        self.transition(State::Final);
    }

    /// Report that named-instance lookup failed. The FSM stays where it
    /// is; the connect timer will eventually close the connection.
    pub fn instance_lookup_failed(&mut self, message: impl Into<String>) {
        self.emit_connect(Some(ConnectionError::new(
            message.into(),
            Some(ErrorCode::InstanceLookup),
        )));
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state.name())
            .field("logged_in", &self.logged_in)
            .field("request", &self.request.is_some())
            .field("descriptors", &self.transaction_descriptors.len())
            .finish_non_exhaustive()
    }
}

/// Keep the first column of each name, dropping later duplicates.
fn dedupe_columns(metadata: &ColumnMetadata) -> ColumnMetadata {
    let mut seen: Vec<&str> = Vec::new();
    let mut columns: Vec<Column> = Vec::new();
    for column in &metadata.columns {
        if seen.contains(&column.name.as_str()) {
            continue;
        }
        seen.push(&column.name);
        columns.push(column.clone());
    }
    ColumnMetadata { columns }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tds_wire::token::TypeInfo;

    #[test]
    fn dedupe_keeps_first_occurrence() {
        let metadata = ColumnMetadata {
            columns: vec![
                Column {
                    name: "id".into(),
                    info: TypeInfo::intn(),
                },
                Column {
                    name: "id".into(),
                    info: TypeInfo::nvarchar(64),
                },
                Column {
                    name: "name".into(),
                    info: TypeInfo::nvarchar(64),
                },
            ],
        };
        let deduped = dedupe_columns(&metadata);
        assert_eq!(deduped.columns.len(), 2);
        assert_eq!(deduped.columns[0].name, "id");
        assert_eq!(deduped.columns[0].info, TypeInfo::intn());
        assert_eq!(deduped.columns[1].name, "name");
    }
}
