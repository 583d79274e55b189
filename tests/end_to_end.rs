//! End-to-end tunnel tests.
//!
//! Every test binds real listeners on 127.0.0.1 ephemeral ports: the relay
//! and keeper run as spawned tasks and the test plays the remaining roles
//! (proxy client, target server, or a hand-rolled peer speaking the carrier
//! protocol directly).

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use session_tunnel::ports;
use session_tunnel::protocol::{read_line, take_frame, Offset, SessionHeader};
use session_tunnel::{keeper, relay};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const BULK_TIMEOUT: Duration = Duration::from_secs(30);

const RESPONSE_200: &str = "HTTP/1.0 200 Connection Established\r\nConnection: close\r\n\r\n";

async fn start_relay(allowed: &str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let allowed = ports::parse_port_set(allowed).unwrap();
    tokio::spawn(relay::serve(listener, allowed));
    addr
}

async fn start_keeper(relay_addr: SocketAddr) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(keeper::serve(listener, relay_addr.to_string()));
    addr
}

async fn start_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut rd, mut wr) = conn.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

/// Connects to the keeper and issues a CONNECT request for `hostport`.
async fn connect_through(keeper_addr: SocketAddr, hostport: &str) -> TcpStream {
    let mut client = TcpStream::connect(keeper_addr).await.unwrap();
    client
        .write_all(format!("CONNECT {hostport} HTTP/1.1\r\nHost: {hostport}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    client
}

/// Reads the HTTP response head, stopping exactly at the blank line so any
/// tunnelled bytes that follow stay in the stream.
async fn read_response_head(client: &mut TcpStream) -> String {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        head.push(client.read_u8().await.unwrap());
        assert!(head.len() < 4096, "response head too large");
    }
    String::from_utf8(head).unwrap()
}

/// Wraps a payload in the carrier's 2-byte length prefix.
fn frame(payload: &[u8]) -> Vec<u8> {
    let mut framed = (payload.len() as u16).to_be_bytes().to_vec();
    framed.extend_from_slice(payload);
    framed
}

/// Reads framed data off a carrier until a non-empty payload arrives,
/// skipping keepalive frames.
async fn recv_payload(carrier: &mut TcpStream, acc: &mut BytesMut) -> Bytes {
    loop {
        match take_frame(acc) {
            Some(payload) if payload.is_empty() => continue,
            Some(payload) => return payload,
            None => {}
        }
        let mut chunk = [0u8; 4096];
        let n = carrier.read(&mut chunk).await.unwrap();
        assert!(n > 0, "carrier closed while waiting for a frame");
        acc.extend_from_slice(&chunk[..n]);
    }
}

async fn expect_eof(conn: &mut TcpStream) {
    let mut buf = [0u8; 16];
    let n = conn.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "expected EOF, got {n} bytes");
}

#[tokio::test]
async fn connect_round_trip_through_echo() {
    timeout(TEST_TIMEOUT, async {
        let relay_addr = start_relay("1-65535").await;
        let keeper_addr = start_keeper(relay_addr).await;
        let echo_addr = start_echo().await;

        let mut client = connect_through(keeper_addr, &echo_addr.to_string()).await;
        assert_eq!(read_response_head(&mut client).await, RESPONSE_200);

        client.write_all(b"hello\n").await.unwrap();
        let mut back = [0u8; 6];
        client.read_exact(&mut back).await.unwrap();
        assert_eq!(&back, b"hello\n");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn bulk_transfer_preserves_bytes() {
    timeout(BULK_TIMEOUT, async {
        let relay_addr = start_relay("1-65535").await;
        let keeper_addr = start_keeper(relay_addr).await;
        let echo_addr = start_echo().await;

        let mut client = connect_through(keeper_addr, &echo_addr.to_string()).await;
        read_response_head(&mut client).await;

        let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
        client.write_all(&payload).await.unwrap();

        let mut back = vec![0u8; payload.len()];
        client.read_exact(&mut back).await.unwrap();
        assert_eq!(back, payload);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn disallowed_port_closes_without_response() {
    timeout(TEST_TIMEOUT, async {
        let relay_addr = start_relay("80,443").await;
        let keeper_addr = start_keeper(relay_addr).await;
        // an ephemeral-port target is never inside 80,443
        let echo_addr = start_echo().await;

        let mut client = connect_through(keeper_addr, &echo_addr.to_string()).await;
        expect_eof(&mut client).await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn non_connect_preamble_is_dropped() {
    timeout(TEST_TIMEOUT, async {
        let relay_addr = start_relay("1-65535").await;
        let keeper_addr = start_keeper(relay_addr).await;

        let mut client = TcpStream::connect(keeper_addr).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: example\r\n\r\n")
            .await
            .unwrap();
        expect_eof(&mut client).await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn keeper_gives_up_when_relay_unreachable() {
    timeout(TEST_TIMEOUT, async {
        // grab an address that nothing listens on
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let keeper_addr = start_keeper(dead_addr).await;
        let mut client = connect_through(keeper_addr, "127.0.0.1:9999").await;
        expect_eof(&mut client).await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unknown_or_nil_sessions_are_dropped() {
    timeout(TEST_TIMEOUT, async {
        let relay_addr = start_relay("1-65535").await;

        // unknown UUID with a resumption offset: no state may be created
        let mut carrier = TcpStream::connect(relay_addr).await.unwrap();
        let hdr = SessionHeader {
            uuid: Uuid::new_v4(),
            offset: Offset::Delivered(0),
        };
        hdr.write_to(&mut carrier).await.unwrap();
        expect_eof(&mut carrier).await;

        // the all-zero UUID is rejected even for new-session requests
        let mut carrier = TcpStream::connect(relay_addr).await.unwrap();
        let hdr = SessionHeader {
            uuid: Uuid::nil(),
            offset: Offset::NewRequest,
        };
        hdr.write_to(&mut carrier).await.unwrap();
        expect_eof(&mut carrier).await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn client_eof_tears_down_target() {
    timeout(TEST_TIMEOUT, async {
        let relay_addr = start_relay("1-65535").await;
        let keeper_addr = start_keeper(relay_addr).await;

        // a sink target that reports everything it saw once its socket closes
        let sink = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let sink_addr = sink.local_addr().unwrap();
        let (seen_tx, seen_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut conn, _) = sink.accept().await.unwrap();
            let mut seen = Vec::new();
            conn.read_to_end(&mut seen).await.unwrap();
            let _ = seen_tx.send(seen);
        });

        let mut client = connect_through(keeper_addr, &sink_addr.to_string()).await;
        read_response_head(&mut client).await;
        client.write_all(b"bye").await.unwrap();
        drop(client);

        // the keeper flushes, signals EOF, and the relay closes the target
        let seen = seen_rx.await.unwrap();
        assert_eq!(seen, b"bye");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn target_eof_reaches_client() {
    timeout(TEST_TIMEOUT, async {
        let relay_addr = start_relay("1-65535").await;
        let keeper_addr = start_keeper(relay_addr).await;

        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = target.accept().await.unwrap();
            conn.write_all(b"0123456789").await.unwrap();
        });

        let mut client = connect_through(keeper_addr, &target_addr.to_string()).await;
        read_response_head(&mut client).await;

        let mut got = [0u8; 10];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"0123456789");
        expect_eof(&mut client).await;
    })
    .await
    .expect("test timed out");
}

/// Plays the keeper role by hand against a real relay: the session must
/// survive a dropped carrier and replay bytes buffered while no carrier was
/// attached.
#[tokio::test]
async fn relay_resumes_after_carrier_loss() {
    timeout(TEST_TIMEOUT, async {
        let relay_addr = start_relay("1-65535").await;
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        let uuid = Uuid::new_v4();

        // leg 1: open the session and push one frame to the target
        let mut leg1 = TcpStream::connect(relay_addr).await.unwrap();
        SessionHeader {
            uuid,
            offset: Offset::NewRequest,
        }
        .write_to(&mut leg1)
        .await
        .unwrap();
        leg1.write_all(format!("{target_addr}\n").as_bytes())
            .await
            .unwrap();
        let reply = SessionHeader::read_from(&mut leg1).await.unwrap();
        assert_eq!(reply.uuid, uuid);
        assert_eq!(reply.offset, Offset::NewAccepted);

        let (mut target_conn, _) = target.accept().await.unwrap();
        leg1.write_all(&frame(b"hello")).await.unwrap();
        let mut got = [0u8; 5];
        target_conn.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello");
        sleep(Duration::from_millis(50)).await;
        drop(leg1);

        // the target answers while no carrier is attached; the relay buffers
        target_conn.write_all(b"world").await.unwrap();
        sleep(Duration::from_millis(50)).await;

        // leg 2: resume and collect the replayed bytes
        let mut leg2 = TcpStream::connect(relay_addr).await.unwrap();
        SessionHeader {
            uuid,
            offset: Offset::Delivered(0),
        }
        .write_to(&mut leg2)
        .await
        .unwrap();
        let reply = SessionHeader::read_from(&mut leg2).await.unwrap();
        assert_eq!(reply.uuid, uuid);
        assert_eq!(reply.offset, Offset::Delivered(5));
        let mut got = [0u8; 5];
        leg2.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"world");

        // target hangs up: the relay drops the carrier and answers the next
        // one with the EOF sentinel
        drop(target_conn);
        expect_eof(&mut leg2).await;

        let mut leg3 = TcpStream::connect(relay_addr).await.unwrap();
        SessionHeader {
            uuid,
            offset: Offset::Delivered(5),
        }
        .write_to(&mut leg3)
        .await
        .unwrap();
        let reply = SessionHeader::read_from(&mut leg3).await.unwrap();
        assert_eq!(reply.offset, Offset::TargetEof);

        // the session is gone; the same UUID is now a stranger
        let mut leg4 = TcpStream::connect(relay_addr).await.unwrap();
        SessionHeader {
            uuid,
            offset: Offset::Delivered(5),
        }
        .write_to(&mut leg4)
        .await
        .unwrap();
        expect_eof(&mut leg4).await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn new_carrier_supersedes_old() {
    timeout(TEST_TIMEOUT, async {
        let relay_addr = start_relay("1-65535").await;
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        let uuid = Uuid::new_v4();

        let mut leg1 = TcpStream::connect(relay_addr).await.unwrap();
        SessionHeader {
            uuid,
            offset: Offset::NewRequest,
        }
        .write_to(&mut leg1)
        .await
        .unwrap();
        leg1.write_all(format!("{target_addr}\n").as_bytes())
            .await
            .unwrap();
        assert_eq!(
            SessionHeader::read_from(&mut leg1).await.unwrap().offset,
            Offset::NewAccepted
        );
        let (_target_conn, _) = target.accept().await.unwrap();

        let mut leg2 = TcpStream::connect(relay_addr).await.unwrap();
        SessionHeader {
            uuid,
            offset: Offset::Delivered(0),
        }
        .write_to(&mut leg2)
        .await
        .unwrap();
        assert_eq!(
            SessionHeader::read_from(&mut leg2).await.unwrap().offset,
            Offset::Delivered(0)
        );

        // the first carrier is closed as soon as the second takes over
        expect_eof(&mut leg1).await;
    })
    .await
    .expect("test timed out");
}

/// Plays the relay role by hand against a real keeper: after a dropped
/// carrier the keeper must redial, announce how much it delivered to the
/// client, and signal client EOF on one last carrier.
#[tokio::test]
async fn keeper_resumes_after_carrier_loss() {
    timeout(TEST_TIMEOUT, async {
        let fake_relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let keeper_addr = start_keeper(fake_relay.local_addr().unwrap()).await;

        let mut client = connect_through(keeper_addr, "upstream.test:9999").await;

        // leg 1: accept the session
        let (mut leg1, _) = fake_relay.accept().await.unwrap();
        let hdr = SessionHeader::read_from(&mut leg1).await.unwrap();
        assert_eq!(hdr.offset, Offset::NewRequest);
        let uuid = hdr.uuid;
        assert_eq!(read_line(&mut leg1, b'\n').await.unwrap(), "upstream.test:9999");
        SessionHeader {
            uuid,
            offset: Offset::NewAccepted,
        }
        .write_to(&mut leg1)
        .await
        .unwrap();
        assert_eq!(read_response_head(&mut client).await, RESPONSE_200);

        // the return path is raw bytes
        leg1.write_all(b"hello").await.unwrap();
        let mut got = [0u8; 5];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello");
        sleep(Duration::from_millis(50)).await;
        drop(leg1);

        // leg 2: the keeper redials and announces its delivered count
        let (mut leg2, _) = fake_relay.accept().await.unwrap();
        let hdr = SessionHeader::read_from(&mut leg2).await.unwrap();
        assert_eq!(hdr.uuid, uuid);
        assert_eq!(hdr.offset, Offset::Delivered(5));
        SessionHeader {
            uuid,
            offset: Offset::Delivered(0),
        }
        .write_to(&mut leg2)
        .await
        .unwrap();

        // the tunnel still works in both directions
        client.write_all(b"ping").await.unwrap();
        let mut acc = BytesMut::new();
        assert_eq!(recv_payload(&mut leg2, &mut acc).await, Bytes::from_static(b"ping"));
        leg2.write_all(b"pong").await.unwrap();
        let mut got = [0u8; 4];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"pong");

        // client hangs up: the keeper signals EOF on one last carrier
        drop(client);
        let (mut leg3, _) = fake_relay.accept().await.unwrap();
        let hdr = SessionHeader::read_from(&mut leg3).await.unwrap();
        assert_eq!(hdr.uuid, uuid);
        assert_eq!(hdr.offset, Offset::ClientEof);
    })
    .await
    .expect("test timed out");
}
