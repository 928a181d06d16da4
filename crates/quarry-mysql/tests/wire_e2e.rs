//! End-to-end exchanges against a scripted in-process server.
//!
//! Each test spawns a listener on a loopback port, replays a canned
//! packet exchange on a background thread, and drives the driver against
//! it. Server-side assertions propagate through the join at the end.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::JoinHandle;

use quarry_mysql::auth::native_password_scramble;
use quarry_mysql::{connect, BinValue, Error, Value};

const CHALLENGE: [u8; 20] = [
    0x52, 0x2F, 0x6E, 0x31, 0x5C, 0x55, 0x22, 0x35, 0x6B, 0x2F, 0x34, 0x60, 0x3C, 0x25, 0x23,
    0x4C, 0x2E, 0x54, 0x36, 0x29,
];

fn packet(seq: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![
        (payload.len() & 0xFF) as u8,
        ((payload.len() >> 8) & 0xFF) as u8,
        ((payload.len() >> 16) & 0xFF) as u8,
        seq,
    ];
    out.extend_from_slice(payload);
    out
}

fn lenenc_str(s: &[u8]) -> Vec<u8> {
    assert!(s.len() < 251);
    let mut out = vec![s.len() as u8];
    out.extend_from_slice(s);
    out
}

fn greeting_payload() -> Vec<u8> {
    let mut p = vec![0x0A];
    p.extend_from_slice(b"5.6.51-scripted\0");
    p.extend_from_slice(&7u32.to_le_bytes()); // thread id
    p.extend_from_slice(&CHALLENGE[..8]);
    p.push(0x00); // filler
    p.extend_from_slice(&0xF7FFu16.to_le_bytes()); // lower capabilities, PROTOCOL_41 included
    p.push(0x21); // charset
    p.extend_from_slice(&0x0002u16.to_le_bytes()); // status
    p.extend_from_slice(&0x0000u16.to_le_bytes()); // upper capabilities
    p.push(21); // auth data length
    p.extend_from_slice(&[0u8; 10]); // reserved
    p.extend_from_slice(&CHALLENGE[8..20]);
    p.push(0x00); // trailing NUL after the scramble
    p
}

fn ok_payload(affected: u8, last_insert_id: u8) -> Vec<u8> {
    let mut p = vec![0x00, affected, last_insert_id];
    p.extend_from_slice(&0x0002u16.to_le_bytes()); // status
    p.extend_from_slice(&0u16.to_le_bytes()); // warnings
    p
}

fn eof_payload() -> Vec<u8> {
    vec![0xFE, 0x00, 0x00, 0x02, 0x00]
}

fn err_payload(code: u16, sql_state: &str, message: &str) -> Vec<u8> {
    let mut p = vec![0xFF];
    p.extend_from_slice(&code.to_le_bytes());
    p.push(b'#');
    p.extend_from_slice(sql_state.as_bytes());
    p.extend_from_slice(message.as_bytes());
    p
}

fn prepare_ok_payload(id: u32, columns: u16, params: u16) -> Vec<u8> {
    let mut p = vec![0x00];
    p.extend_from_slice(&id.to_le_bytes());
    p.extend_from_slice(&columns.to_le_bytes());
    p.extend_from_slice(&params.to_le_bytes());
    p.push(0x00); // reserved
    p.extend_from_slice(&0u16.to_le_bytes()); // warnings
    p
}

fn column_def_payload(table: &str, name: &str, ftype: u8, flags: u16) -> Vec<u8> {
    let mut p = Vec::new();
    p.extend(lenenc_str(b"def"));
    p.extend(lenenc_str(b"test"));
    p.extend(lenenc_str(table.as_bytes()));
    p.extend(lenenc_str(table.as_bytes()));
    p.extend(lenenc_str(name.as_bytes()));
    p.extend(lenenc_str(name.as_bytes()));
    p.push(0x0C); // length of the fixed tail
    p.extend_from_slice(&0x21u16.to_le_bytes()); // charset
    p.extend_from_slice(&255u32.to_le_bytes()); // column length
    p.push(ftype);
    p.extend_from_slice(&flags.to_le_bytes());
    p.push(0x00); // decimals
    p.extend_from_slice(&[0x00, 0x00]); // filler
    p
}

fn read_client_packet(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).expect("client packet header");
    let len = usize::from(head[0]) | usize::from(head[1]) << 8 | usize::from(head[2]) << 16;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).expect("client packet payload");
    (head[3], payload)
}

fn serve_handshake(stream: &mut TcpStream) {
    stream
        .write_all(&packet(0, &greeting_payload()))
        .expect("write greeting");

    let (seq, login) = read_client_packet(stream);
    assert_eq!(seq, 1, "login must continue the greeting sequence");

    // Capabilities, max packet size, charset echo, 23 reserved bytes.
    assert_eq!(login[8], 0x21, "charset must be echoed from the greeting");
    assert!(login[9..32].iter().all(|&b| b == 0));

    let mut rest = &login[32..];
    let nul = rest.iter().position(|&b| b == 0).expect("user NUL");
    assert_eq!(&rest[..nul], b"root");
    rest = &rest[nul + 1..];

    assert_eq!(rest[0], 20, "scramble length byte");
    let expected = native_password_scramble("secret", &CHALLENGE);
    assert_eq!(&rest[1..21], expected.as_slice(), "scramble mismatch");

    stream
        .write_all(&packet(2, &ok_payload(0, 0)))
        .expect("write login ok");
}

/// Read a COM_STMT_PREPARE and reply with the given metadata.
fn serve_prepare(
    stream: &mut TcpStream,
    sql: &str,
    id: u32,
    params: &[Vec<u8>],
    columns: &[Vec<u8>],
) {
    let (seq, payload) = read_client_packet(stream);
    assert_eq!(seq, 0, "commands restart the sequence");
    assert_eq!(payload[0], 0x16);
    assert_eq!(&payload[1..], sql.as_bytes());

    let mut seq = 1u8;
    let mut send = |payload: &[u8], seq: &mut u8| {
        stream.write_all(&packet(*seq, payload)).expect("write");
        *seq = seq.wrapping_add(1);
    };

    send(
        &prepare_ok_payload(id, columns.len() as u16, params.len() as u16),
        &mut seq,
    );
    for def in params {
        send(def, &mut seq);
    }
    if !params.is_empty() {
        send(&eof_payload(), &mut seq);
    }
    for def in columns {
        send(def, &mut seq);
    }
    if !columns.is_empty() {
        send(&eof_payload(), &mut seq);
    }
}

/// Read a COM_STMT_EXECUTE and reply with the given packets.
fn serve_execute(stream: &mut TcpStream, id: u32, replies: &[Vec<u8>]) -> Vec<u8> {
    let (seq, payload) = read_client_packet(stream);
    assert_eq!(seq, 0, "commands restart the sequence");
    assert_eq!(payload[0], 0x17);
    assert_eq!(&payload[1..5], &id.to_le_bytes());
    assert_eq!(payload[5], 0x00, "no cursor");
    assert_eq!(&payload[6..10], &1u32.to_le_bytes(), "iteration count");

    let mut seq = 1u8;
    for reply in replies {
        stream.write_all(&packet(seq, reply)).expect("write reply");
        seq = seq.wrapping_add(1);
    }
    payload
}

fn spawn_server<F>(script: F) -> (String, JoinHandle<()>)
where
    F: FnOnce(&mut TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();
    let handle = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        script(&mut stream);
    });
    (addr, handle)
}

fn dsn(addr: &str) -> String {
    format!("tcp://root:secret@{addr}?db=test&timeout=2s")
}

#[test]
fn handshake_then_ping_then_quit() {
    let (addr, server) = spawn_server(|stream| {
        serve_handshake(stream);

        let (seq, payload) = read_client_packet(stream);
        assert_eq!(seq, 0);
        assert_eq!(payload, [0x0E]); // COM_PING
        stream.write_all(&packet(1, &ok_payload(0, 0))).unwrap();

        let (seq, payload) = read_client_packet(stream);
        assert_eq!(seq, 0);
        assert_eq!(payload, [0x01]); // COM_QUIT
    });

    let mut conn = connect(&dsn(&addr)).expect("connect");
    assert_eq!(conn.server_version(), "5.6.51-scripted");
    assert_eq!(conn.connection_id(), 7);
    conn.ping().expect("ping");
    conn.close().expect("close");

    server.join().unwrap();
}

#[test]
fn empty_result_set_yields_columns_but_no_rows() {
    // S1: prepare, query with zero parameters, immediate end of rows.
    let (addr, server) = spawn_server(|stream| {
        serve_handshake(stream);
        serve_prepare(
            stream,
            "SELECT 1 WHERE FALSE",
            1,
            &[],
            &[column_def_payload("", "1", 0x08, 0)],
        );
        let payload = serve_execute(
            stream,
            1,
            &[
                vec![0x01], // column count
                column_def_payload("", "1", 0x08, 0),
                eof_payload(),
                eof_payload(), // no rows
            ],
        );
        assert_eq!(payload.len(), 10, "no parameter block expected");
    });

    let mut conn = connect(&dsn(&addr)).expect("connect");
    let mut stmt = conn.prepare("SELECT 1 WHERE FALSE").expect("prepare");
    assert_eq!(stmt.param_count(), 0);

    let mut rows = stmt.query(&[]).expect("query");
    assert_eq!(rows.columns(), vec!["1".to_string()]);
    assert!(!rows.next().expect("next"));
    assert!(!rows.next().expect("next is sticky"));
    rows.close().expect("close rows");

    server.join().unwrap();
}

#[test]
fn parameters_echo_back_as_a_row() {
    // S2: three parameters (true, "hi", NULL) echoed as TINY, VAR_STRING,
    // and NULL columns.
    let param_def = || column_def_payload("", "?", 0xFD, 0);
    let (addr, server) = spawn_server(move |stream| {
        serve_handshake(stream);
        serve_prepare(
            stream,
            "SELECT ?, ?, ?",
            42,
            &[param_def(), param_def(), param_def()],
            &[
                column_def_payload("", "?", 0x01, 0),
                column_def_payload("", "?", 0xFD, 0),
                column_def_payload("", "?", 0x06, 0),
            ],
        );
        let payload = serve_execute(
            stream,
            42,
            &[
                vec![0x03],
                column_def_payload("", "?", 0x01, 0),
                column_def_payload("", "?", 0xFD, 0),
                column_def_payload("", "?", 0x06, 0),
                eof_payload(),
                // Binary row: header, bitmap (third column NULL), TINY 1,
                // then "hi" as a length-encoded body.
                vec![0x00, 0x10, 0x01, 0x02, b'h', b'i'],
                eof_payload(),
            ],
        );

        // The execute payload itself: NULL bitmap marks parameter 3, the
        // types announce TINY, STRING, NULL, and only two values follow.
        assert_eq!(
            payload,
            vec![
                0x17, 42, 0, 0, 0, 0x00, 0x01, 0x00, 0x00, 0x00, // header
                0b0000_0100, // parameter NULL bitmap
                0x01, // new-params-bound
                0x01, 0x00, 0xFE, 0x00, 0x06, 0x00, // types
                0x01, // true
                0x02, b'h', b'i', // "hi"
            ]
        );
    });

    let mut conn = connect(&dsn(&addr)).expect("connect");
    let mut stmt = conn.prepare("SELECT ?, ?, ?").expect("prepare");
    assert_eq!(stmt.param_count(), 3);

    let mut rows = stmt
        .query(&[Value::Bool(true), Value::Text("hi".to_string()), Value::Null])
        .expect("query");
    assert!(rows.next().expect("first row"));
    assert_eq!(rows.get(0), Some(BinValue::Int(1)));
    assert_eq!(rows.get(1), Some(BinValue::Bytes(b"hi")));
    assert_eq!(rows.get(2), Some(BinValue::Null));
    assert_eq!(rows.get(3), None);
    assert!(!rows.next().expect("end of rows"));

    server.join().unwrap();
}

#[test]
fn exec_reports_counters_and_server_errors() {
    // S3: an INSERT answered with OK, then the same statement answered
    // with a server error packet.
    let (addr, server) = spawn_server(|stream| {
        serve_handshake(stream);
        serve_prepare(
            stream,
            "INSERT INTO t VALUES (?)",
            7,
            &[column_def_payload("", "?", 0xFD, 0)],
            &[],
        );
        serve_execute(stream, 7, &[ok_payload(1, 5)]);
        serve_execute(
            stream,
            7,
            &[err_payload(1146, "42S02", "Table 'test.t' doesn't exist")],
        );
    });

    let mut conn = connect(&dsn(&addr)).expect("connect");
    let mut stmt = conn.prepare("INSERT INTO t VALUES (?)").expect("prepare");

    let result = stmt.exec(&[Value::BigInt(9)]).expect("exec");
    assert_eq!(result.rows_affected().expect("affected"), 1);
    assert_eq!(result.last_insert_id().expect("insert id"), 5);

    let err = stmt.exec(&[Value::BigInt(9)]).expect_err("server error");
    assert!(matches!(err, Error::Server(_)));
    let text = err.to_string();
    assert!(text.contains("Code=1146"), "got: {text}");
    assert!(text.contains("SqlState=#42S02"), "got: {text}");

    server.join().unwrap();
}

#[test]
fn multi_row_query_with_null() {
    // S5: three rows (1, "a"), (2, NULL), (3, "ccc"), then EOF. Closing
    // the exhausted iterator must not touch the wire.
    let (addr, server) = spawn_server(|stream| {
        serve_handshake(stream);
        serve_prepare(
            stream,
            "SELECT id, name FROM t",
            3,
            &[],
            &[
                column_def_payload("t", "id", 0x03, 0),
                column_def_payload("t", "name", 0xFD, 0),
            ],
        );
        serve_execute(
            stream,
            3,
            &[
                vec![0x02],
                column_def_payload("t", "id", 0x03, 0),
                column_def_payload("t", "name", 0xFD, 0),
                eof_payload(),
                vec![0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, b'a'],
                vec![0x00, 0b0000_1000, 0x02, 0x00, 0x00, 0x00],
                vec![0x00, 0x00, 0x03, 0x00, 0x00, 0x00, 0x03, b'c', b'c', b'c'],
                eof_payload(),
            ],
        );

        // Statement close arrives with no reply owed.
        let (seq, payload) = read_client_packet(stream);
        assert_eq!(seq, 0);
        assert_eq!(payload, [0x19, 3, 0, 0, 0]);
    });

    let mut conn = connect(&dsn(&addr)).expect("connect");
    let mut stmt = conn.prepare("SELECT id, name FROM t").expect("prepare");
    assert_eq!(stmt.column_count(), 2);

    {
        let mut rows = stmt.query(&[]).expect("query");
        assert_eq!(rows.columns(), vec!["t.id".to_string(), "t.name".to_string()]);

        assert!(rows.next().expect("row 1"));
        assert_eq!(rows.get(0), Some(BinValue::Int(1)));
        assert_eq!(rows.get(1), Some(BinValue::Bytes(b"a")));

        assert!(rows.next().expect("row 2"));
        assert_eq!(rows.get(0), Some(BinValue::Int(2)));
        assert_eq!(rows.get(1), Some(BinValue::Null));

        assert!(rows.next().expect("row 3"));
        assert_eq!(rows.get(0), Some(BinValue::Int(3)));
        assert_eq!(rows.get(1), Some(BinValue::Bytes(b"ccc")));

        assert!(!rows.next().expect("end"));
        rows.close().expect("close exhausted rows without I/O");
    }
    stmt.close().expect("close statement");

    server.join().unwrap();
}

#[test]
fn exec_against_a_result_set_yields_unknown_counters() {
    // A caller asking for a row count gets sentinel errors when the
    // server produced a result set instead of an OK.
    let (addr, server) = spawn_server(|stream| {
        serve_handshake(stream);
        serve_prepare(
            stream,
            "SELECT 1",
            11,
            &[],
            &[column_def_payload("", "1", 0x08, 0)],
        );
        serve_execute(
            stream,
            11,
            &[
                vec![0x01],
                column_def_payload("", "1", 0x08, 0),
                eof_payload(),
                vec![0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0], // one LONGLONG row
                eof_payload(),
            ],
        );
    });

    let mut conn = connect(&dsn(&addr)).expect("connect");
    let mut stmt = conn.prepare("SELECT 1").expect("prepare");

    let result = stmt.exec(&[]).expect("exec drains the result set");
    assert!(matches!(
        result.rows_affected(),
        Err(Error::UnknownRowsAffected)
    ));
    assert!(matches!(
        result.last_insert_id(),
        Err(Error::UnknownLastInsertId)
    ));

    server.join().unwrap();
}

#[test]
fn server_error_on_prepare_leaves_the_connection_usable() {
    let (addr, server) = spawn_server(|stream| {
        serve_handshake(stream);

        let (_, payload) = read_client_packet(stream);
        assert_eq!(payload[0], 0x16);
        stream
            .write_all(&packet(
                1,
                &err_payload(1064, "42000", "You have an error in your SQL syntax"),
            ))
            .unwrap();

        // The connection must still answer a ping afterwards.
        let (_, payload) = read_client_packet(stream);
        assert_eq!(payload, [0x0E]);
        stream.write_all(&packet(1, &ok_payload(0, 0))).unwrap();
    });

    let mut conn = connect(&dsn(&addr)).expect("connect");
    let err = conn.prepare("SELEKT 1").expect_err("syntax error");
    assert!(matches!(err, Error::Server(_)));
    assert!(!err.is_fatal());
    conn.ping().expect("connection survives a server error");

    server.join().unwrap();
}

#[test]
fn bad_handshake_protocol_version_is_fatal() {
    let (addr, server) = spawn_server(|stream| {
        let mut bogus = greeting_payload();
        bogus[0] = 0x09;
        stream.write_all(&packet(0, &bogus)).unwrap();
    });

    let err = connect(&dsn(&addr)).expect_err("protocol version 9 must be rejected");
    assert!(matches!(err, Error::Protocol(_)));

    server.join().unwrap();
}

#[test]
fn authentication_failure_surfaces_the_server_message() {
    let (addr, server) = spawn_server(|stream| {
        stream.write_all(&packet(0, &greeting_payload())).unwrap();
        let _ = read_client_packet(stream);
        stream
            .write_all(&packet(
                2,
                &err_payload(1045, "28000", "Access denied for user 'root'"),
            ))
            .unwrap();
    });

    let err = connect(&dsn(&addr)).expect_err("access denied");
    assert!(matches!(err, Error::Connection(_)));
    assert!(err.to_string().contains("Access denied"), "got: {err}");

    server.join().unwrap();
}

#[test]
fn parameter_count_mismatch_is_rejected_before_sending() {
    let (addr, server) = spawn_server(|stream| {
        serve_handshake(stream);
        serve_prepare(
            stream,
            "INSERT INTO t VALUES (?)",
            5,
            &[column_def_payload("", "?", 0xFD, 0)],
            &[],
        );
        // Nothing else arrives: the mismatched exec is never sent, and
        // the well-formed one that follows is.
        serve_execute(stream, 5, &[ok_payload(1, 1)]);
    });

    let mut conn = connect(&dsn(&addr)).expect("connect");
    let mut stmt = conn.prepare("INSERT INTO t VALUES (?)").expect("prepare");

    let err = stmt.exec(&[]).expect_err("zero of one parameters");
    assert!(matches!(err, Error::Encoding(_)));
    assert!(!err.is_fatal());

    stmt.exec(&[Value::Text("x".to_string())])
        .expect("statement still usable");

    server.join().unwrap();
}
