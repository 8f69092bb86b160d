//! Driver tests against a scripted in-process server.

#![allow(clippy::unwrap_used, clippy::panic)]

use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tds_client::{Client, Config, ConnectionEvent, ErrorCode, TdsVersion};
use tds_wire::packet::{PacketHeader, PacketStatus, PacketType};
use tds_wire::prelogin::{EncryptionLevel, PreloginMessage};
use tds_wire::token::{
    self, Column, ColumnMetadata, DoneStatus, DoneToken, LoginAck, Row, TokenType, TypeInfo,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn read_message(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut payload = Vec::new();
    loop {
        let mut header = [0u8; 8];
        stream.read_exact(&mut header).await.unwrap();
        let length = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut body = vec![0u8; length - 8];
        stream.read_exact(&mut body).await.unwrap();
        payload.extend_from_slice(&body);
        if header[1] & 0x01 != 0 {
            return (header[0], payload);
        }
    }
}

async fn write_message(stream: &mut TcpStream, packet_type: PacketType, payload: &[u8]) {
    let mut buf = BytesMut::new();
    let header = PacketHeader {
        packet_type,
        status: PacketStatus::END_OF_MESSAGE,
        length: (payload.len() + 8) as u16,
        spid: 0,
        packet_id: 1,
        window: 0,
    };
    header.encode(&mut buf);
    buf.put_slice(payload);
    stream.write_all(&buf).await.unwrap();
}

fn done(status: DoneStatus, row_count: u64) -> BytesMut {
    let mut buf = BytesMut::new();
    DoneToken {
        status,
        cur_cmd: 0,
        row_count,
    }
    .encode(TokenType::Done, &mut buf);
    buf
}

fn login_response() -> BytesMut {
    let mut buf = BytesMut::new();
    LoginAck {
        interface: 1,
        tds_version: TdsVersion::V7_4.raw(),
        prog_name: "Microsoft SQL Server".into(),
        prog_version: 0x0C00_0000,
    }
    .encode(&mut buf);
    token::encode_env_database("example", "master", &mut buf);
    buf.extend_from_slice(&done(DoneStatus::empty(), 0));
    buf
}

fn query_response() -> BytesMut {
    let metadata = ColumnMetadata {
        columns: vec![Column {
            name: "id".into(),
            info: TypeInfo::intn(),
        }],
    };
    let mut buf = BytesMut::new();
    metadata.encode(&mut buf);
    for value in [1i32, 2] {
        Row {
            values: vec![Some(bytes::Bytes::copy_from_slice(&value.to_le_bytes()))],
        }
        .encode(&metadata, &mut buf);
    }
    buf.extend_from_slice(&done(DoneStatus::COUNT, 2));
    buf
}

/// Accept one connection and walk it through login plus one query.
async fn scripted_server(listener: TcpListener) {
    let (mut stream, _) = listener.accept().await.unwrap();

    let (packet_type, _) = read_message(&mut stream).await;
    assert_eq!(packet_type, PacketType::Prelogin as u8);
    let prelogin = PreloginMessage::new()
        .with_encryption(EncryptionLevel::Off)
        .encode();
    write_message(&mut stream, PacketType::TabularResult, &prelogin).await;

    let (packet_type, _) = read_message(&mut stream).await;
    assert_eq!(packet_type, PacketType::Login7 as u8);
    write_message(&mut stream, PacketType::TabularResult, &login_response()).await;

    // Initial session-option batch.
    let (packet_type, payload) = read_message(&mut stream).await;
    assert_eq!(packet_type, PacketType::SqlBatch as u8);
    let sql: String = payload[22..]
        .chunks(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .map(|unit| char::from_u32(u32::from(unit)).unwrap())
        .collect();
    assert!(sql.starts_with("set textsize"));
    assert!(sql.contains("set transaction isolation level read committed"));
    write_message(&mut stream, PacketType::TabularResult, &done(DoneStatus::empty(), 0)).await;

    // One query.
    let (packet_type, _) = read_message(&mut stream).await;
    assert_eq!(packet_type, PacketType::SqlBatch as u8);
    write_message(&mut stream, PacketType::TabularResult, &query_response()).await;

    // Hold the socket open until the client hangs up.
    let mut rest = [0u8; 64];
    let _ = stream.read(&mut rest).await;
}

#[tokio::test]
async fn login_and_query_through_a_real_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(scripted_server(listener));

    let mut config = Config::new("127.0.0.1", "sa", "secret");
    config.options.port = Some(u32::from(port));
    config.options.row_collection_on_request_completion = true;

    let (client, mut events) = Client::connect(config).await.unwrap();

    // The event stream replays the login sequence up to the successful
    // connect, including the database change observed on the way.
    let mut saw_database_change = false;
    loop {
        match events.recv().await {
            Some(ConnectionEvent::DatabaseChange(db)) => {
                assert_eq!(db, "example");
                saw_database_change = true;
            }
            Some(ConnectionEvent::Connect(None)) => break,
            Some(ConnectionEvent::Connect(Some(error))) => panic!("connect failed: {error}"),
            Some(_) => {}
            None => panic!("event stream ended before connect"),
        }
    }
    assert!(saw_database_change);

    let result = client.exec_sql_batch("select id from t").await.unwrap();
    assert_eq!(result.row_count, 2);
    assert_eq!(result.rows.len(), 2);
    assert_eq!(
        result.rows[1].values[0].as_deref(),
        Some(&2i32.to_le_bytes()[..])
    );

    client.close();
    server.await.unwrap();
}

#[tokio::test]
async fn silent_server_times_out_with_etimeout() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    // Accept but never answer.
    tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let mut config = Config::new("127.0.0.1", "sa", "secret");
    config.options.port = Some(u32::from(port));
    config.options.connect_timeout = Duration::from_millis(200);

    let error = Client::connect(config).await.unwrap_err();
    assert_eq!(error.code, Some(ErrorCode::Timeout));
}

#[tokio::test]
async fn refused_connection_reports_esocket() {
    // Bind then drop to find a port with nothing listening.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut config = Config::new("127.0.0.1", "sa", "secret");
    config.options.port = Some(u32::from(port));
    config.options.connect_timeout = Duration::from_millis(500);

    let error = Client::connect(config).await.unwrap_err();
    assert_eq!(error.code, Some(ErrorCode::Socket));
}

#[tokio::test]
async fn unresolvable_instance_reports_einstlookup() {
    let mut config = Config::new("127.0.0.1", "sa", "secret");
    config.options.instance_name = Some("SQLEXPRESS".into());
    config.options.connect_timeout = Duration::from_millis(200);

    let error = Client::connect(config).await.unwrap_err();
    assert_eq!(error.code, Some(ErrorCode::InstanceLookup));
}
