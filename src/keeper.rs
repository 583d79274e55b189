//! Client-side keeper: accepts HTTP CONNECT proxy requests and carries each
//! session to the relay over disposable carrier connections, redialing and
//! resuming from the last acknowledged offset whenever a carrier drops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::buffer::ReplayBuffer;
use crate::ports;
use crate::protocol::{self, Offset, SessionHeader};

/// Consecutive carrier attempts allowed between successful header exchanges.
const RETRY_LIMIT: u32 = 100;
/// Pause before redialing a relay that refused or dropped a carrier.
const REDIAL_DELAY: Duration = Duration::from_secs(3);
/// How long to wait for the relay's header on a fresh carrier.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
/// Idle tick; an empty tick sends a zero-length frame as a liveness probe.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(3);
/// Scratch size for reads from the client and the carrier.
const SCRATCH_SIZE: usize = 10_000;
/// Header lines scanned for the CONNECT request before giving up.
const MAX_PREAMBLE_LINES: usize = 100;
/// Wakeup channel depth; senders skip when it is full, the tick catches up.
const NOTIFY_DEPTH: usize = 3;

const ESTABLISHED_RESPONSE: &[u8] =
    b"HTTP/1.0 200 Connection Established\r\nConnection: close\r\n\r\n";

/// Accepts proxy clients forever, one session task per connection.
pub async fn serve(listener: TcpListener, relay_addr: String) -> Result<()> {
    loop {
        let (client, addr) = listener.accept().await?;
        debug!(peer = %addr, "incoming proxy connection");
        let relay_addr = relay_addr.clone();
        tokio::spawn(handle_client(client, relay_addr));
    }
}

async fn handle_client(mut client: TcpStream, relay_addr: String) {
    let Some(hostport) = read_preamble(&mut client).await else {
        // not a CONNECT request; drop without a response
        return;
    };
    let uuid = Uuid::new_v4();
    info!(%uuid, %hostport, "session opened");

    let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_DEPTH);
    let session = KeeperSession {
        uuid,
        hostport,
        relay_addr,
        pending: Arc::new(Mutex::new(ReplayBuffer::new())),
        close_local: Arc::new(AtomicBool::new(false)),
        shutdown: Arc::new(Notify::new()),
        notify_tx,
    };

    let (client_rd, client_wr) = client.into_split();
    let reader = tokio::spawn(local_reader(
        client_rd,
        session.pending.clone(),
        session.close_local.clone(),
        session.shutdown.clone(),
        session.notify_tx.clone(),
    ));

    session.run(client_wr, notify_rx).await;
    let _ = reader.await;
}

/// Scans up to [`MAX_PREAMBLE_LINES`] header lines for a CONNECT request and
/// returns the requested `host:port`. Anything malformed drops the client.
async fn read_preamble(client: &mut TcpStream) -> Option<String> {
    let mut hostport = None;
    for _ in 0..MAX_PREAMBLE_LINES {
        let line = protocol::read_line(client, b'\n').await.ok()?;
        if let Some(req) = line
            .strip_prefix("CONNECT ")
            .and_then(|rest| rest.strip_suffix(" HTTP/1.1"))
        {
            if ports::split_host_port(req).is_err() {
                debug!(request = %req, "invalid CONNECT endpoint");
                return None;
            }
            hostport = Some(req.to_string());
        } else if line.is_empty() {
            break;
        }
    }
    hostport
}

/// Reads the client connection into the replay buffer until EOF or error.
async fn local_reader(
    mut client_rd: OwnedReadHalf,
    pending: Arc<Mutex<ReplayBuffer>>,
    close_local: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    notify_tx: mpsc::Sender<()>,
) {
    let mut scratch = vec![0u8; SCRATCH_SIZE];
    let shutdown_fut = shutdown.notified();
    tokio::pin!(shutdown_fut);
    loop {
        if close_local.load(Ordering::SeqCst) {
            break;
        }
        tokio::select! {
            _ = &mut shutdown_fut => break,
            res = client_rd.read(&mut scratch) => match res {
                Ok(0) | Err(_) => {
                    close_local.store(true, Ordering::SeqCst);
                    let _ = notify_tx.try_send(());
                    break;
                }
                Ok(n) => {
                    pending.lock().unwrap().append(&scratch[..n]);
                    let _ = notify_tx.try_send(());
                }
            },
        }
    }
}

/// What ended a single carrier leg.
enum LegEnd {
    /// The carrier failed; redial and resume.
    Reconnect,
    /// The relay announced the target is gone.
    RemoteEof,
    /// The client is gone and every queued frame has been delivered.
    Flushed,
}

struct KeeperSession {
    uuid: Uuid,
    hostport: String,
    relay_addr: String,
    pending: Arc<Mutex<ReplayBuffer>>,
    close_local: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    notify_tx: mpsc::Sender<()>,
}

impl KeeperSession {
    /// The carrier retry loop: dials the relay until the session finishes or
    /// the retry budget runs dry.
    async fn run(self, mut client_wr: OwnedWriteHalf, mut notify_rx: mpsc::Receiver<()>) {
        let mut established = false;
        let mut delivered: u64 = 0;
        let mut attempts: u32 = 0;
        let mut ever_connected = false;
        let mut remote_closed = false;

        loop {
            if self.close_local.load(Ordering::SeqCst) && self.pending.lock().unwrap().is_empty() {
                break;
            }
            if attempts == RETRY_LIMIT {
                debug!(uuid = %self.uuid, "retry budget exhausted");
                break;
            }
            attempts += 1;

            let carrier = match TcpStream::connect(&self.relay_addr).await {
                Ok(carrier) => carrier,
                Err(err) => {
                    if !established {
                        debug!(uuid = %self.uuid, %err, "relay unreachable, dropping session");
                        break;
                    }
                    debug!(uuid = %self.uuid, %err, "redial failed");
                    time::sleep(REDIAL_DELAY).await;
                    continue;
                }
            };
            ever_connected = true;

            match self
                .run_leg(
                    carrier,
                    &mut established,
                    &mut delivered,
                    &mut client_wr,
                    &mut notify_rx,
                    &mut attempts,
                )
                .await
            {
                Ok(LegEnd::Reconnect) => continue,
                Ok(LegEnd::Flushed) => break,
                Ok(LegEnd::RemoteEof) => {
                    debug!(uuid = %self.uuid, "target closed");
                    remote_closed = true;
                    break;
                }
                Err(err) => {
                    warn!(uuid = %self.uuid, %err, "session failed");
                    break;
                }
            }
        }

        // Tell the relay the session is over so it can drop its state. Best
        // effort; the relay also reaps sessions that simply go quiet.
        if ever_connected && !remote_closed {
            self.send_client_eof().await;
        }
        self.close_local.store(true, Ordering::SeqCst);
        let _ = client_wr.shutdown().await;
        self.shutdown.notify_waiters();
        debug!(uuid = %self.uuid, "session closed");
    }

    /// Runs one carrier leg: header exchange, replay-buffer advance, then the
    /// steady-state shuttle until the carrier or the session ends.
    async fn run_leg(
        &self,
        mut carrier: TcpStream,
        established: &mut bool,
        delivered: &mut u64,
        client_wr: &mut OwnedWriteHalf,
        notify_rx: &mut mpsc::Receiver<()>,
        attempts: &mut u32,
    ) -> Result<LegEnd> {
        let offset = if *established {
            Offset::Delivered(*delivered)
        } else {
            Offset::NewRequest
        };
        let hdr = SessionHeader { uuid: self.uuid, offset };
        if hdr.write_to(&mut carrier).await.is_err() {
            return Ok(LegEnd::Reconnect);
        }
        if !*established {
            let line = format!("{}\n", self.hostport);
            if carrier.write_all(line.as_bytes()).await.is_err() {
                return Ok(LegEnd::Reconnect);
            }
        }

        let reply = match time::timeout(HANDSHAKE_TIMEOUT, SessionHeader::read_from(&mut carrier))
            .await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => {
                if !*established {
                    bail!("relay rejected the session: {err}");
                }
                debug!(uuid = %self.uuid, %err, "header exchange failed");
                time::sleep(REDIAL_DELAY).await;
                return Ok(LegEnd::Reconnect);
            }
            Err(_) => {
                if !*established {
                    bail!("relay did not answer the handshake in time");
                }
                debug!(uuid = %self.uuid, "header exchange timed out");
                return Ok(LegEnd::Reconnect);
            }
        };

        if reply.uuid != self.uuid {
            bail!("peer answered with a foreign session id");
        }

        let peer_offset = match reply.offset {
            Offset::TargetEof => return Ok(LegEnd::RemoteEof),
            Offset::NewAccepted if !*established => {
                *established = true;
                debug!(uuid = %self.uuid, "session established");
                if client_wr.write_all(ESTABLISHED_RESPONSE).await.is_err() {
                    self.close_local.store(true, Ordering::SeqCst);
                }
                0
            }
            Offset::Delivered(n) if *established => n,
            other => bail!("unexpected handshake reply {other:?}"),
        };
        self.pending.lock().unwrap().advance_to(peer_offset)?;
        *attempts = 0;

        let (mut carrier_rd, mut carrier_wr) = carrier.into_split();
        let mut tick = time::interval_at(
            time::Instant::now() + KEEPALIVE_INTERVAL,
            KEEPALIVE_INTERVAL,
        );
        let mut scratch = vec![0u8; SCRATCH_SIZE];
        loop {
            tokio::select! {
                res = carrier_rd.read(&mut scratch) => match res {
                    // the return path is unframed: raw bytes go straight to the client
                    Ok(0) | Err(_) => return Ok(LegEnd::Reconnect),
                    Ok(n) => {
                        if client_wr.write_all(&scratch[..n]).await.is_err() {
                            self.close_local.store(true, Ordering::SeqCst);
                            return Ok(LegEnd::Reconnect);
                        }
                        *delivered += n as u64;
                    }
                },
                _ = tick.tick() => {
                    if flush_pending(&mut carrier_wr, &self.pending).await.is_err() {
                        return Ok(LegEnd::Reconnect);
                    }
                }
                _ = notify_rx.recv() => {
                    if flush_pending(&mut carrier_wr, &self.pending).await.is_err() {
                        return Ok(LegEnd::Reconnect);
                    }
                }
            }
            if self.close_local.load(Ordering::SeqCst) && self.pending.lock().unwrap().is_empty() {
                return Ok(LegEnd::Flushed);
            }
        }
    }

    /// Opens one last carrier and announces the client EOF.
    async fn send_client_eof(&self) {
        debug!(uuid = %self.uuid, "sending EOF signal");
        let eof = SessionHeader {
            uuid: self.uuid,
            offset: Offset::ClientEof,
        };
        let _ = time::timeout(HANDSHAKE_TIMEOUT, async {
            if let Ok(mut carrier) = TcpStream::connect(&self.relay_addr).await {
                let _ = eof.write_to(&mut carrier).await;
            }
        })
        .await;
    }
}

/// Drains queued frames to the carrier, popping each after a successful
/// write. An empty queue sends a zero-length frame instead so a dead carrier
/// is noticed even when the tunnel is idle.
async fn flush_pending(
    carrier_wr: &mut OwnedWriteHalf,
    pending: &Mutex<ReplayBuffer>,
) -> std::io::Result<()> {
    let mut sent_any = false;
    loop {
        let frame = pending.lock().unwrap().front();
        match frame {
            Some(frame) => {
                carrier_wr.write_all(&frame).await?;
                pending.lock().unwrap().pop_front(frame.len());
                sent_any = true;
            }
            None => {
                if !sent_any {
                    carrier_wr.write_all(&0u16.to_be_bytes()).await?;
                }
                return Ok(());
            }
        }
    }
}
