//! End-to-end scenarios for the sans-io connection core, driven with
//! scripted server bytes.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tds_client::{
    Config, Connection, ConnectionEvent, ErrorCode, Event, IsolationLevel, RequestError, Row,
    State, TdsVersion,
};
use tds_framing::MessageIo;
use tds_wire::packet::PacketType;
use tds_wire::prelogin::{EncryptionLevel, PreloginMessage};
use tds_wire::token::{
    self, Column, ColumnMetadata, DoneStatus, DoneToken, LoginAck, ServerMessage, TokenType,
    TypeInfo,
};

// ---------------------------------------------------------------------
// Scripted-server helpers
// ---------------------------------------------------------------------

fn config() -> Config {
    Config::new("localhost", "sa", "secret")
}

/// Frame server-side token bytes the way the server would: a
/// TABULAR_RESULT message.
fn server_response(payload: &[u8]) -> Bytes {
    let mut io = MessageIo::new(4096);
    io.send_message(PacketType::TabularResult, payload).unwrap();
    io.take_outbound()
}

fn login_ack_bytes(tds_version: TdsVersion) -> BytesMut {
    let mut buf = BytesMut::new();
    LoginAck {
        interface: 1,
        tds_version: tds_version.raw(),
        prog_name: "Microsoft SQL Server".into(),
        prog_version: 0x0C00_0000,
    }
    .encode(&mut buf);
    buf
}

fn done_bytes(status: DoneStatus, row_count: u64) -> BytesMut {
    let mut buf = BytesMut::new();
    DoneToken {
        status,
        cur_cmd: 0,
        row_count,
    }
    .encode(TokenType::Done, &mut buf);
    buf
}

fn int_metadata(names: &[&str]) -> ColumnMetadata {
    ColumnMetadata {
        columns: names
            .iter()
            .map(|name| Column {
                name: (*name).into(),
                info: TypeInfo::intn(),
            })
            .collect(),
    }
}

fn int_row(values: &[i32]) -> Row {
    Row {
        values: values
            .iter()
            .map(|v| Some(Bytes::copy_from_slice(&v.to_le_bytes())))
            .collect(),
    }
}

/// Walk a fresh connection through the plaintext login sequence.
fn logged_in_connection(config: Config) -> Connection {
    let mut connection = Connection::new(config.clone()).unwrap();
    assert_eq!(connection.state(), State::Connecting);

    connection.dispatch(Event::SocketConnect);
    assert_eq!(connection.state(), State::SentPrelogin);
    let prelogin = connection.take_outbound();
    assert_eq!(prelogin[0], PacketType::Prelogin as u8);

    let response = PreloginMessage::new()
        .with_encryption(EncryptionLevel::Off)
        .encode();
    connection.feed(&server_response(&response));
    assert_eq!(connection.state(), State::SentLogin7WithStandardLogin);
    let login7 = connection.take_outbound();
    assert_eq!(login7[0], PacketType::Login7 as u8);

    let mut tokens = login_ack_bytes(config.options.tds_version);
    tokens.extend_from_slice(&done_bytes(DoneStatus::empty(), 0));
    connection.feed(&server_response(&tokens));
    assert_eq!(connection.state(), State::LoggedInSendingInitialSql);

    // The session-option batch goes out on entry to this state.
    let initial_sql = connection.take_outbound();
    assert_eq!(initial_sql[0], PacketType::SqlBatch as u8);

    connection.feed(&server_response(&done_bytes(DoneStatus::empty(), 0)));
    assert_eq!(connection.state(), State::LoggedIn);

    // Swallow the events of the login sequence.
    while connection.poll_event().is_some() {}
    connection
}

type CapturedOutcome = Arc<Mutex<Option<(Option<RequestError>, u64, Vec<Row>)>>>;

fn capture() -> (
    CapturedOutcome,
    impl FnOnce(Option<RequestError>, u64, Vec<Row>) + Send + 'static,
) {
    let slot: CapturedOutcome = Arc::new(Mutex::new(None));
    let writer = Arc::clone(&slot);
    (slot, move |error, row_count, rows| {
        *writer.lock().unwrap() = Some((error, row_count, rows));
    })
}

fn drain_events(connection: &mut Connection) -> Vec<ConnectionEvent> {
    let mut events = Vec::new();
    while let Some(event) = connection.poll_event() {
        events.push(event);
    }
    events
}

// ---------------------------------------------------------------------
// Scenario 1: plaintext happy path
// ---------------------------------------------------------------------

#[test]
fn plaintext_login_reaches_logged_in_and_emits_connect() {
    let mut connection = Connection::new(config()).unwrap();
    connection.dispatch(Event::SocketConnect);

    let response = PreloginMessage::new()
        .with_encryption(EncryptionLevel::Off)
        .encode();
    connection.feed(&server_response(&response));

    let mut tokens = login_ack_bytes(TdsVersion::V7_4);
    tokens.extend_from_slice(&done_bytes(DoneStatus::empty(), 0));
    connection.feed(&server_response(&tokens));
    connection.feed(&server_response(&done_bytes(DoneStatus::empty(), 0)));

    assert_eq!(connection.state(), State::LoggedIn);
    assert!(!connection.connect_timer_armed());

    let events = drain_events(&mut connection);
    let connects: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ConnectionEvent::Connect(err) => Some(err),
            _ => None,
        })
        .collect();
    assert_eq!(connects.len(), 1);
    assert!(connects[0].is_none());
}

// ---------------------------------------------------------------------
// Scenario 2: TLS negotiation starts inside PRELOGIN packets
// ---------------------------------------------------------------------

#[test]
fn encrypted_prelogin_response_starts_tls_inside_prelogin_packets() {
    let mut config = config();
    config.options.encrypt = true;
    config.options.tls.trust_server_certificate = true;

    let mut connection = Connection::new(config).unwrap();
    connection.dispatch(Event::SocketConnect);
    let _prelogin = connection.take_outbound();

    let response = PreloginMessage::new()
        .with_encryption(EncryptionLevel::On)
        .encode();
    connection.feed(&server_response(&response));

    assert_eq!(connection.state(), State::SentTlsSslNegotiation);

    // The queued bytes are PRELOGIN-typed packets whose payload is a TLS
    // handshake record (the ClientHello); LOGIN7 is held back until the
    // session is secure.
    let wire = connection.take_outbound();
    assert_eq!(wire[0], PacketType::Prelogin as u8);
    assert_eq!(wire[8], 0x16);
    assert!(!connection.has_outbound());
}

// ---------------------------------------------------------------------
// Scenario 3: login failure
// ---------------------------------------------------------------------

#[test]
fn server_error_before_login_ack_fails_the_connect() {
    let mut connection = Connection::new(config()).unwrap();
    connection.dispatch(Event::SocketConnect);

    let response = PreloginMessage::new()
        .with_encryption(EncryptionLevel::Off)
        .encode();
    connection.feed(&server_response(&response));

    let mut tokens = BytesMut::new();
    ServerMessage {
        number: 18456,
        state: 1,
        class: 14,
        message: "Login failed for user 'sa'.".into(),
        server: "db01".into(),
        procedure: String::new(),
        line: 1,
    }
    .encode(TokenType::Error, &mut tokens);
    tokens.extend_from_slice(&done_bytes(DoneStatus::ERROR, 0));
    connection.feed(&server_response(&tokens));

    assert_eq!(connection.state(), State::Final);
    assert!(connection.is_closed());

    let events = drain_events(&mut connection);
    let connect_error = events
        .iter()
        .find_map(|e| match e {
            ConnectionEvent::Connect(Some(err)) => Some(err.clone()),
            _ => None,
        })
        .expect("connect event with error");
    assert_eq!(connect_error.code, Some(ErrorCode::Login));
    assert_eq!(connect_error.message, "Login failed for user 'sa'.");
    assert!(events.iter().any(|e| matches!(e, ConnectionEvent::End)));
}

#[test]
fn login_without_ack_synthesizes_elogin() {
    let mut connection = Connection::new(config()).unwrap();
    connection.dispatch(Event::SocketConnect);

    let response = PreloginMessage::new()
        .with_encryption(EncryptionLevel::Off)
        .encode();
    connection.feed(&server_response(&response));

    // A response with no LOGINACK and no ERROR at all.
    connection.feed(&server_response(&done_bytes(DoneStatus::empty(), 0)));

    let events = drain_events(&mut connection);
    let connect_error = events
        .iter()
        .find_map(|e| match e {
            ConnectionEvent::Connect(Some(err)) => Some(err.clone()),
            _ => None,
        })
        .expect("connect event with error");
    assert_eq!(connect_error.code, Some(ErrorCode::Login));
    assert_eq!(connection.state(), State::Final);
}

// ---------------------------------------------------------------------
// Scenario 4: a query returning rows
// ---------------------------------------------------------------------

#[test]
fn query_collects_rows_when_enabled() {
    let mut cfg = config();
    cfg.options.row_collection_on_request_completion = true;
    let mut connection = logged_in_connection(cfg);

    let (outcome, sink) = capture();
    connection.exec_sql_batch("select id, age from people", sink);
    assert_eq!(connection.state(), State::SentClientRequest);
    let batch = connection.take_outbound();
    assert_eq!(batch[0], PacketType::SqlBatch as u8);

    let mut tokens = BytesMut::new();
    int_metadata(&["id", "age"]).encode(&mut tokens);
    let metadata = int_metadata(&["id", "age"]);
    for values in [[1, 30], [2, 40], [3, 50]] {
        int_row(&values).encode(&metadata, &mut tokens);
    }
    tokens.extend_from_slice(&done_bytes(DoneStatus::COUNT, 3));
    connection.feed(&server_response(&tokens));

    assert_eq!(connection.state(), State::LoggedIn);
    let (error, row_count, rows) = outcome.lock().unwrap().take().expect("request completed");
    assert!(error.is_none());
    assert_eq!(row_count, 3);
    assert_eq!(rows.len(), 3);
    assert_eq!(
        rows[0].values[0].as_deref(),
        Some(&1i32.to_le_bytes()[..])
    );
}

#[test]
fn query_reports_count_only_when_collection_disabled() {
    let mut connection = logged_in_connection(config());

    let (outcome, sink) = capture();
    connection.exec_sql_batch("select id from people", sink);

    let mut tokens = BytesMut::new();
    let metadata = int_metadata(&["id"]);
    metadata.encode(&mut tokens);
    for values in [[1], [2], [3]] {
        int_row(&values).encode(&metadata, &mut tokens);
    }
    tokens.extend_from_slice(&done_bytes(DoneStatus::COUNT, 3));
    connection.feed(&server_response(&tokens));

    let (error, row_count, rows) = outcome.lock().unwrap().take().expect("request completed");
    assert!(error.is_none());
    assert_eq!(row_count, 3);
    assert!(rows.is_empty());
}

#[test]
fn server_error_during_request_surfaces_as_erequest() {
    let mut connection = logged_in_connection(config());

    let (outcome, sink) = capture();
    connection.exec_sql_batch("select 1/0", sink);

    let mut tokens = BytesMut::new();
    ServerMessage {
        number: 8134,
        state: 1,
        class: 16,
        message: "Divide by zero error encountered.".into(),
        server: "db01".into(),
        procedure: String::new(),
        line: 1,
    }
    .encode(TokenType::Error, &mut tokens);
    tokens.extend_from_slice(&done_bytes(DoneStatus::ERROR, 0));
    connection.feed(&server_response(&tokens));

    assert_eq!(connection.state(), State::LoggedIn);
    let (error, _, _) = outcome.lock().unwrap().take().expect("request completed");
    let error = error.expect("request error");
    assert_eq!(error.code, Some(ErrorCode::Request));
    assert_eq!(error.message, "Divide by zero error encountered.");
}

// ---------------------------------------------------------------------
// Scenario 5: cancellation round trip
// ---------------------------------------------------------------------

#[test]
fn cancel_sends_attention_and_completes_on_the_ack() {
    let mut connection = logged_in_connection(config());

    let (outcome, sink) = capture();
    connection.exec_sql_batch("select * from huge_table", sink);
    let _batch = connection.take_outbound();

    assert!(connection.cancel());
    assert_eq!(connection.state(), State::SentAttention);
    let attention = connection.take_outbound();
    assert_eq!(attention[0], PacketType::Attention as u8);
    assert_eq!(attention.len(), 8);

    // An intermediate response message arrives first; it is discarded.
    let mut intermediate = BytesMut::new();
    let metadata = int_metadata(&["id"]);
    metadata.encode(&mut intermediate);
    int_row(&[7]).encode(&metadata, &mut intermediate);
    intermediate.extend_from_slice(&done_bytes(DoneStatus::COUNT | DoneStatus::MORE, 1));
    connection.feed(&server_response(&intermediate));

    assert_eq!(connection.state(), State::SentAttention);
    assert!(outcome.lock().unwrap().is_none());

    // The attention acknowledgement completes the request with ECANCEL.
    connection.feed(&server_response(&done_bytes(DoneStatus::ATTENTION, 0)));
    assert_eq!(connection.state(), State::LoggedIn);

    let (error, _, _) = outcome.lock().unwrap().take().expect("request completed");
    let error = error.expect("cancel error");
    assert_eq!(error.code, Some(ErrorCode::Cancel));
    assert_eq!(error.message, "Canceled.");
}

#[test]
fn cancel_outside_a_request_is_a_no_op() {
    let mut connection = logged_in_connection(config());
    assert!(!connection.cancel());
    assert!(!connection.has_outbound());
    assert_eq!(connection.state(), State::LoggedIn);
}

// ---------------------------------------------------------------------
// Scenario 6: nested transactions and the descriptor stack
// ---------------------------------------------------------------------

fn finish_transaction_request(connection: &mut Connection, tokens: BytesMut) {
    let mut with_done = tokens;
    with_done.extend_from_slice(&done_bytes(DoneStatus::empty(), 0));
    connection.feed(&server_response(&with_done));
}

#[test]
fn nested_transactions_wind_and_unwind_the_descriptor_stack() {
    let mut connection = logged_in_connection(config());
    assert_eq!(connection.transaction_descriptors(), &[0]);

    let begun: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));

    for descriptor in [0x11u64, 0x22] {
        let begun = Arc::clone(&begun);
        connection.begin_transaction("", None, move |error, current| {
            assert!(error.is_none());
            begun.lock().unwrap().push(current);
        });
        let tm = connection.take_outbound();
        assert_eq!(tm[0], PacketType::TransactionManager as u8);

        let mut tokens = BytesMut::new();
        token::encode_env_begin_transaction(descriptor, &mut tokens);
        finish_transaction_request(&mut connection, tokens);
    }
    assert_eq!(connection.transaction_descriptors(), &[0, 0x11, 0x22]);
    assert_eq!(*begun.lock().unwrap(), vec![0x11, 0x22]);
    assert_eq!(connection.current_transaction_descriptor(), 0x22);

    // Inner commit.
    connection.commit_transaction(|error, _| assert!(error.is_none()));
    let mut tokens = BytesMut::new();
    token::encode_env_commit_transaction(0x22, &mut tokens);
    finish_transaction_request(&mut connection, tokens);
    assert_eq!(connection.transaction_descriptors(), &[0, 0x11]);

    // Outer commit.
    connection.commit_transaction(|error, _| assert!(error.is_none()));
    let mut tokens = BytesMut::new();
    token::encode_env_commit_transaction(0x11, &mut tokens);
    finish_transaction_request(&mut connection, tokens);
    assert_eq!(connection.transaction_descriptors(), &[0]);

    // A request issued afterwards carries the zero sentinel.
    let (_, sink) = capture();
    connection.exec_sql_batch("select 1", sink);
    let batch = connection.take_outbound();
    // ALL_HEADERS transaction descriptor sits at payload bytes 10..18,
    // 8 bytes past the packet header.
    assert_eq!(&batch[8 + 10..8 + 18], &[0u8; 8]);
}

#[test]
fn commit_without_transaction_fails_synchronously() {
    let mut connection = logged_in_connection(config());

    let captured: Arc<Mutex<Option<RequestError>>> = Arc::new(Mutex::new(None));
    let writer = Arc::clone(&captured);
    connection.commit_transaction(move |error, _| {
        *writer.lock().unwrap() = error;
    });

    let error = captured.lock().unwrap().take().expect("synchronous error");
    assert_eq!(error.code, Some(ErrorCode::NoTransactionInProgress));
    assert!(!connection.has_outbound());
}

#[test]
fn rollback_without_transaction_fails_synchronously() {
    let mut connection = logged_in_connection(config());

    let captured: Arc<Mutex<Option<RequestError>>> = Arc::new(Mutex::new(None));
    let writer = Arc::clone(&captured);
    connection.rollback_transaction(move |error, _| {
        *writer.lock().unwrap() = error;
    });

    let error = captured.lock().unwrap().take().expect("synchronous error");
    assert_eq!(error.code, Some(ErrorCode::NoTransactionInProgress));
}

#[test]
fn transactions_rejected_below_tds_7_2() {
    let mut cfg = config();
    cfg.options.tds_version = TdsVersion::V7_1;
    let mut connection = logged_in_connection(cfg);

    let captured: Arc<Mutex<Option<RequestError>>> = Arc::new(Mutex::new(None));
    let writer = Arc::clone(&captured);
    connection.begin_transaction("tx", Some(IsolationLevel::Serializable), move |error, _| {
        *writer.lock().unwrap() = error;
    });

    let error = captured.lock().unwrap().take().expect("synchronous error");
    assert!(error.message.contains("not supported"));
    assert!(!connection.has_outbound());
}

// ---------------------------------------------------------------------
// Invariants and boundary behaviors
// ---------------------------------------------------------------------

#[test]
fn requests_outside_logged_in_fail_with_einvalidstate() {
    let mut connection = Connection::new(config()).unwrap();

    let (outcome, sink) = capture();
    connection.exec_sql_batch("select 1", sink);

    let (error, _, _) = outcome.lock().unwrap().take().expect("synchronous failure");
    let error = error.expect("error");
    assert_eq!(error.code, Some(ErrorCode::InvalidState));
    assert!(error.message.contains("Connecting"));
    assert_eq!(connection.state(), State::Connecting);
}

#[test]
fn second_request_while_one_is_in_flight_is_rejected() {
    let mut connection = logged_in_connection(config());

    let (_, first) = capture();
    connection.exec_sql_batch("select 1", first);
    let _ = connection.take_outbound();

    let (outcome, second) = capture();
    connection.exec_sql_batch("select 2", second);
    let (error, _, _) = outcome.lock().unwrap().take().expect("synchronous failure");
    assert_eq!(error.unwrap().code, Some(ErrorCode::InvalidState));
    // Nothing extra went out.
    assert!(!connection.has_outbound());
}

#[test]
fn unknown_event_in_state_is_fatal() {
    let mut connection = Connection::new(config()).unwrap();
    connection.dispatch(Event::Message);

    assert_eq!(connection.state(), State::Final);
    let events = drain_events(&mut connection);
    let error = events
        .iter()
        .find_map(|e| match e {
            ConnectionEvent::Error(err) => Some(err.clone()),
            _ => None,
        })
        .expect("fatal error event");
    assert!(error.message.contains("No event 'message'"));
    assert!(error.message.contains("Connecting"));
}

#[test]
fn cleanup_runs_exactly_once() {
    let mut connection = logged_in_connection(config());
    connection.close();
    connection.close();

    let events = drain_events(&mut connection);
    let ends = events
        .iter()
        .filter(|e| matches!(e, ConnectionEvent::End))
        .count();
    assert_eq!(ends, 1);
    assert!(connection.is_closed());
}

#[test]
fn no_outbound_traffic_after_final() {
    let mut connection = logged_in_connection(config());
    connection.close();
    let _ = connection.take_outbound();

    let (outcome, sink) = capture();
    connection.exec_sql_batch("select 1", sink);
    assert!(!connection.has_outbound());
    // The request fails instead of being sent.
    assert!(outcome.lock().unwrap().is_some());
}

#[test]
fn connect_timeout_emits_etimeout_and_closes() {
    let mut connection = Connection::new(config()).unwrap();
    connection.dispatch(Event::SocketConnect);
    connection.dispatch(Event::ConnectTimeout);

    assert_eq!(connection.state(), State::Final);
    let events = drain_events(&mut connection);
    let connect_error = events
        .iter()
        .find_map(|e| match e {
            ConnectionEvent::Connect(Some(err)) => Some(err.clone()),
            _ => None,
        })
        .expect("connect error");
    assert_eq!(connect_error.code, Some(ErrorCode::Timeout));
}

#[test]
fn socket_error_during_request_fails_the_request_and_closes() {
    let mut connection = logged_in_connection(config());

    let (outcome, sink) = capture();
    connection.exec_sql_batch("select 1", sink);
    connection.dispatch(Event::SocketError(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "reset by peer",
    )));

    assert_eq!(connection.state(), State::Final);
    let (error, _, _) = outcome.lock().unwrap().take().expect("request completed");
    assert_eq!(error.unwrap().code, Some(ErrorCode::Socket));
}

#[test]
fn packet_size_change_propagates_to_framing() {
    let mut connection = logged_in_connection(config());
    assert_eq!(connection.packet_size(), 4096);

    let (_, sink) = capture();
    connection.exec_sql_batch("select 1", sink);
    let mut tokens = BytesMut::new();
    token::encode_env_packet_size(8192, 4096, &mut tokens);
    tokens.extend_from_slice(&done_bytes(DoneStatus::empty(), 0));
    connection.feed(&server_response(&tokens));

    assert_eq!(connection.packet_size(), 8192);
}

#[test]
fn row_count_sums_across_done_tokens() {
    let mut connection = logged_in_connection(config());

    let (outcome, sink) = capture();
    connection.exec_sql_batch("insert a; insert b", sink);

    let mut tokens = done_bytes(DoneStatus::COUNT | DoneStatus::MORE, 2);
    tokens.extend_from_slice(&done_bytes(DoneStatus::COUNT, 5));
    connection.feed(&server_response(&tokens));

    let (error, row_count, _) = outcome.lock().unwrap().take().expect("request completed");
    assert!(error.is_none());
    assert_eq!(row_count, 7);
}
