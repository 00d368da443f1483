use redis::Commands;
use replis::config::Config;
use replis::replication::replica;
use replis::server::{ServerContext, run_server};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::warn;

fn start_master(port: u16) -> CancellationToken {
    let config = Config {
        port,
        ..Default::default()
    };
    let ctx = ServerContext::new(config);
    let cancel = CancellationToken::new();

    let server_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = run_server(ctx, server_cancel).await;
    });
    cancel
}

fn start_replica(port: u16, master_port: u16) -> CancellationToken {
    let config = Config {
        port,
        replicaof: Some(("127.0.0.1".to_string(), master_port)),
        ..Default::default()
    };
    let ctx = ServerContext::new(config);
    let cancel = CancellationToken::new();

    let server_ctx = ctx.clone();
    let server_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = run_server(server_ctx, server_cancel).await;
    });

    let link_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = replica::run_replica_link(ctx, link_cancel).await {
            warn!("replica link ended: {e}");
        }
    });
    cancel
}

fn get_client(port: u16) -> redis::Connection {
    let client = redis::Client::open(format!("redis://127.0.0.1:{port}/")).unwrap();
    // Retry connection a few times
    for i in 0..50 {
        match client.get_connection() {
            Ok(conn) => return conn,
            Err(_) if i < 49 => {
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
            Err(e) => panic!("Failed to connect: {e}"),
        }
    }
    unreachable!()
}

fn read_crlf_line(reader: &mut impl BufRead) -> String {
    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line).unwrap();
    String::from_utf8_lossy(&line).into_owned()
}

/// Drive the replica side of the handshake on a raw socket, returning
/// the connected stream, its reader, and the master's replication id.
fn raw_handshake(port: u16, listening_port: u16) -> (TcpStream, BufReader<TcpStream>, String) {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let mut reader = BufReader::new(stream.try_clone().unwrap());

    stream.write_all(b"*1\r\n$4\r\nPING\r\n").unwrap();
    assert_eq!(read_crlf_line(&mut reader), "+PONG\r\n");

    let lp = listening_port.to_string();
    stream
        .write_all(
            format!(
                "*3\r\n$8\r\nREPLCONF\r\n$14\r\nlistening-port\r\n${}\r\n{}\r\n",
                lp.len(),
                lp
            )
            .as_bytes(),
        )
        .unwrap();
    assert_eq!(read_crlf_line(&mut reader), "+OK\r\n");

    stream
        .write_all(b"*3\r\n$8\r\nREPLCONF\r\n$4\r\ncapa\r\n$6\r\npsync2\r\n")
        .unwrap();
    assert_eq!(read_crlf_line(&mut reader), "+OK\r\n");

    stream
        .write_all(b"*3\r\n$5\r\nPSYNC\r\n$1\r\n?\r\n$2\r\n-1\r\n")
        .unwrap();
    let line = read_crlf_line(&mut reader);
    assert!(line.starts_with("+FULLRESYNC "), "got: {line}");
    let replid = line.split_whitespace().nth(1).unwrap().to_string();
    assert_eq!(replid.len(), 40);
    assert!(line.trim_end().ends_with(" 0"));

    // Snapshot: $<N>\r\n then exactly N bytes, no trailing CRLF.
    let header = read_crlf_line(&mut reader);
    assert!(header.starts_with('$'), "got: {header}");
    let len: usize = header[1..].trim_end().parse().unwrap();
    let mut rdb = vec![0u8; len];
    reader.read_exact(&mut rdb).unwrap();
    assert!(rdb.starts_with(b"REDIS"));

    (stream, reader, replid)
}

#[tokio::test]
async fn test_ping() {
    let port = 17100;
    let _server = start_master(port);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    tokio::task::spawn_blocking(move || {
        let mut conn = get_client(port);
        let result: String = redis::cmd("PING").query(&mut conn).unwrap();
        assert_eq!(result, "PONG");
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_echo() {
    let port = 17101;
    let _server = start_master(port);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    tokio::task::spawn_blocking(move || {
        let mut conn = get_client(port);
        let result: String = redis::cmd("ECHO").arg("hello").query(&mut conn).unwrap();
        assert_eq!(result, "hello");
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_set_get() {
    let port = 17102;
    let _server = start_master(port);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    tokio::task::spawn_blocking(move || {
        let mut conn = get_client(port);

        let _: () = conn.set("mykey", "myvalue").unwrap();
        let val: String = conn.get("mykey").unwrap();
        assert_eq!(val, "myvalue");

        // SET overwrites
        let _: () = conn.set("mykey", "other").unwrap();
        let val: String = conn.get("mykey").unwrap();
        assert_eq!(val, "other");

        let missing: Option<String> = conn.get("nosuchkey").unwrap();
        assert_eq!(missing, None);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_set_px_expiry() {
    let port = 17103;
    let _server = start_master(port);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    tokio::task::spawn_blocking(move || {
        let mut conn = get_client(port);

        let ok: String = redis::cmd("SET")
            .arg("foo")
            .arg("bar")
            .arg("PX")
            .arg(100)
            .query(&mut conn)
            .unwrap();
        assert_eq!(ok, "OK");

        std::thread::sleep(std::time::Duration::from_millis(50));
        let val: Option<String> = conn.get("foo").unwrap();
        assert_eq!(val, Some("bar".to_string()));

        std::thread::sleep(std::time::Duration::from_millis(150));
        let val: Option<String> = conn.get("foo").unwrap();
        assert_eq!(val, None);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_info_replication() {
    let port = 17104;
    let _server = start_master(port);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    tokio::task::spawn_blocking(move || {
        let mut conn = get_client(port);
        let info: String = redis::cmd("INFO")
            .arg("replication")
            .query(&mut conn)
            .unwrap();

        assert!(info.contains("role:master"));
        assert!(info.contains("master_repl_offset:0"));

        let replid = info
            .lines()
            .find_map(|l| l.strip_prefix("master_replid:"))
            .unwrap()
            .trim();
        assert_eq!(replid.len(), 40);
        assert!(replid.chars().all(|c| c.is_ascii_hexdigit()));
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_unknown_command_is_an_error() {
    let port = 17105;
    let _server = start_master(port);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    tokio::task::spawn_blocking(move || {
        let mut conn = get_client(port);
        let result: Result<String, _> = redis::cmd("NOSUCHCMD").query(&mut conn);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("unknown command"), "got: {err}");

        // The connection survives the error.
        let pong: String = redis::cmd("PING").query(&mut conn).unwrap();
        assert_eq!(pong, "PONG");
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_framing_error_reply() {
    let port = 17106;
    let _server = start_master(port);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    tokio::task::spawn_blocking(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());

        // Not a RESP type byte
        stream.write_all(b"HELLO\r\n").unwrap();
        let line = read_crlf_line(&mut reader);
        assert!(line.starts_with("-ERR: "), "got: {line}");
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_handshake_against_master() {
    let port = 17107;
    let _server = start_master(port);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    tokio::task::spawn_blocking(move || {
        let (_stream, _reader, replid) = raw_handshake(port, 6380);
        assert!(replid.chars().all(|c| c.is_ascii_hexdigit()));
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_propagation_and_getack() {
    let port = 17108;
    let _server = start_master(port);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    tokio::task::spawn_blocking(move || {
        let (mut stream, mut reader, _replid) = raw_handshake(port, 6380);

        // A client write is propagated byte-for-byte.
        let mut conn = get_client(port);
        let _: () = conn.set("foo", "bar").unwrap();

        let expected = b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n";
        let mut propagated = vec![0u8; expected.len()];
        reader.read_exact(&mut propagated).unwrap();
        assert_eq!(propagated, expected);

        // Master offset advanced by exactly the raw length.
        let info: String = redis::cmd("INFO")
            .arg("replication")
            .query(&mut conn)
            .unwrap();
        assert!(
            info.contains(&format!("master_repl_offset:{}", expected.len())),
            "got: {info}"
        );

        // WAIT triggers a GETACK fan-out; answer it with a caught-up
        // offset and the quorum completes.
        let wait = std::thread::spawn(move || {
            let mut conn = get_client(port);
            let acked: i64 = redis::cmd("WAIT")
                .arg(1)
                .arg(2000)
                .query(&mut conn)
                .unwrap();
            acked
        });

        let getack = b"*3\r\n$8\r\nREPLCONF\r\n$6\r\nGETACK\r\n$1\r\n*\r\n";
        let mut received = vec![0u8; getack.len()];
        reader.read_exact(&mut received).unwrap();
        assert_eq!(received, getack);

        let offset = expected.len().to_string();
        stream
            .write_all(
                format!(
                    "*3\r\n$8\r\nREPLCONF\r\n$3\r\nACK\r\n${}\r\n{}\r\n",
                    offset.len(),
                    offset
                )
                .as_bytes(),
            )
            .unwrap();

        assert_eq!(wait.join().unwrap(), 1);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_wait_with_no_pending_writes() {
    let port = 17109;
    let _server = start_master(port);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    tokio::task::spawn_blocking(move || {
        let mut conn = get_client(port);
        let acked: i64 = redis::cmd("WAIT").arg(0).arg(100).query(&mut conn).unwrap();
        assert_eq!(acked, 0);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_full_replication_end_to_end() {
    let master_port = 17110;
    let replica_port = 17111;

    let _master = start_master(master_port);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let _replica = start_replica(replica_port, master_port);
    // Let the handshake finish
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    tokio::task::spawn_blocking(move || {
        let mut master = get_client(master_port);
        let mut replica = get_client(replica_port);

        let info: String = redis::cmd("INFO")
            .arg("replication")
            .query(&mut replica)
            .unwrap();
        assert!(info.contains("role:slave"), "got: {info}");

        let _: () = master.set("replicated", "yes").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(300));

        let val: Option<String> = replica.get("replicated").unwrap();
        assert_eq!(val, Some("yes".to_string()));

        // The applied write moved the replica's offset.
        let info: String = redis::cmd("INFO")
            .arg("replication")
            .query(&mut replica)
            .unwrap();
        let offset = info
            .lines()
            .find_map(|l| l.strip_prefix("master_repl_offset:"))
            .unwrap()
            .trim();
        let raw_len = b"*3\r\n$3\r\nSET\r\n$10\r\nreplicated\r\n$3\r\nyes\r\n".len();
        assert_eq!(offset, raw_len.to_string());
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_replica_serves_reads_after_master_write() {
    let master_port = 17112;
    let replica_port = 17113;

    let _master = start_master(master_port);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let _replica = start_replica(replica_port, master_port);
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    tokio::task::spawn_blocking(move || {
        let mut master = get_client(master_port);

        for i in 0..5 {
            let _: () = master.set(format!("key{i}"), format!("value{i}")).unwrap();
        }
        std::thread::sleep(std::time::Duration::from_millis(300));

        let mut replica = get_client(replica_port);
        for i in 0..5 {
            let val: Option<String> = replica.get(format!("key{i}")).unwrap();
            assert_eq!(val, Some(format!("value{i}")));
        }
    })
    .await
    .unwrap();
}
