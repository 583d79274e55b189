//! Server-side relay: owns the UUID→session table, dials the real targets,
//! and replays buffered target bytes to whichever carrier currently
//! represents a session.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, Notify};
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::buffer::ReplayBuffer;
use crate::ports;
use crate::protocol::{self, Offset, SessionHeader};

/// How long to wait for a carrier's opening header.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
/// Idle tick driving the outbound drain loop.
const DRAIN_INTERVAL: Duration = Duration::from_secs(1);
/// Scratch size for reads from the carrier and the target.
const SCRATCH_SIZE: usize = 10_000;
/// Wakeup channel depth; senders skip when it is full, the tick catches up.
const NOTIFY_DEPTH: usize = 3;
/// Sessions with no carrier traffic for this long are pruned.
const STALE_SESSION_TIMEOUT: Duration = Duration::from_secs(120);
/// How often the pruning sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Accepts carriers forever, one handler task per connection.
pub async fn serve(listener: TcpListener, allowed: HashSet<u16>) -> Result<()> {
    let table = Arc::new(SessionTable::default());
    let allowed = Arc::new(allowed);

    tokio::spawn(reap_stale(table.clone()));

    loop {
        let (carrier, addr) = listener.accept().await?;
        debug!(peer = %addr, "incoming carrier");
        let table = table.clone();
        let allowed = allowed.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_carrier(carrier, table, allowed).await {
                debug!(%err, "carrier handler error");
            }
        });
    }
}

/// Periodically drops sessions whose keeper has gone quiet without sending
/// an EOF signal, closing their target connections.
async fn reap_stale(table: Arc<SessionTable>) {
    let mut tick = time::interval(SWEEP_INTERVAL);
    loop {
        tick.tick().await;
        for session in table.remove_stale(STALE_SESSION_TIMEOUT) {
            warn!(uuid = %session.uuid, "pruning stale session");
            session.close().await;
        }
    }
}

#[derive(Default)]
struct SessionTable {
    inner: Mutex<HashMap<Uuid, Arc<Session>>>,
}

impl SessionTable {
    fn get(&self, uuid: &Uuid) -> Option<Arc<Session>> {
        self.inner.lock().unwrap().get(uuid).cloned()
    }

    /// Inserts the session unless the UUID is already taken.
    fn insert(&self, session: Arc<Session>) -> bool {
        match self.inner.lock().unwrap().entry(session.uuid) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(session);
                true
            }
        }
    }

    fn remove(&self, uuid: &Uuid) -> Option<Arc<Session>> {
        self.inner.lock().unwrap().remove(uuid)
    }

    fn remove_stale(&self, idle: Duration) -> Vec<Arc<Session>> {
        let mut map = self.inner.lock().unwrap();
        let stale: Vec<Uuid> = map
            .iter()
            .filter(|(_, s)| s.last_seen.lock().unwrap().elapsed() > idle)
            .map(|(uuid, _)| *uuid)
            .collect();
        stale.iter().filter_map(|uuid| map.remove(uuid)).collect()
    }
}

/// Per-UUID session state that outlives any individual carrier.
struct Session {
    uuid: Uuid,
    /// Target→keeper frames awaiting acknowledgement.
    pending: Mutex<ReplayBuffer>,
    notify_tx: mpsc::Sender<()>,
    notify_rx: AsyncMutex<mpsc::Receiver<()>>,
    target_wr: AsyncMutex<OwnedWriteHalf>,
    /// Payload bytes written to the target so far.
    delivered: AtomicU64,
    /// False until the `-2` acceptance header has gone out.
    accepted: AtomicBool,
    /// The target returned EOF or an error; nothing more will be queued.
    close_local: AtomicBool,
    /// Serializes carrier handlers; a new carrier supersedes the old one.
    handler_lock: AsyncMutex<()>,
    /// Bumped by each new carrier to wake the superseded handler.
    epoch: watch::Sender<u64>,
    /// Stops the target reader when the session is torn down.
    shutdown: Notify,
    last_seen: Mutex<Instant>,
}

impl Session {
    fn new(uuid: Uuid, target_wr: OwnedWriteHalf) -> Arc<Self> {
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_DEPTH);
        let (epoch, _) = watch::channel(0);
        Arc::new(Self {
            uuid,
            pending: Mutex::new(ReplayBuffer::new()),
            notify_tx,
            notify_rx: AsyncMutex::new(notify_rx),
            target_wr: AsyncMutex::new(target_wr),
            delivered: AtomicU64::new(0),
            accepted: AtomicBool::new(false),
            close_local: AtomicBool::new(false),
            handler_lock: AsyncMutex::new(()),
            epoch,
            shutdown: Notify::new(),
            last_seen: Mutex::new(Instant::now()),
        })
    }

    fn touch(&self) {
        *self.last_seen.lock().unwrap() = Instant::now();
    }

    /// Stops the target reader and closes the outbound half of the target
    /// connection; the socket is released once both halves drop.
    async fn close(&self) {
        self.close_local.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        let _ = self.target_wr.lock().await.shutdown().await;
    }
}

/// Reads the target connection into the replay buffer until EOF or error.
async fn target_reader(mut target_rd: OwnedReadHalf, session: Arc<Session>) {
    let mut scratch = vec![0u8; SCRATCH_SIZE];
    let shutdown_fut = session.shutdown.notified();
    tokio::pin!(shutdown_fut);
    loop {
        if session.close_local.load(Ordering::SeqCst) {
            break;
        }
        tokio::select! {
            _ = &mut shutdown_fut => break,
            res = target_rd.read(&mut scratch) => match res {
                Ok(0) | Err(_) => {
                    session.close_local.store(true, Ordering::SeqCst);
                    let _ = session.notify_tx.try_send(());
                    break;
                }
                Ok(n) => {
                    session.pending.lock().unwrap().append(&scratch[..n]);
                    let _ = session.notify_tx.try_send(());
                }
            },
        }
    }
    debug!(uuid = %session.uuid, "target reader done");
}

/// Drives one incoming carrier from header exchange to carrier death.
async fn handle_carrier(
    mut carrier: TcpStream,
    table: Arc<SessionTable>,
    allowed: Arc<HashSet<u16>>,
) -> Result<()> {
    let rcv = match time::timeout(HANDSHAKE_TIMEOUT, SessionHeader::read_from(&mut carrier)).await {
        Ok(Ok(rcv)) => rcv,
        _ => return Ok(()),
    };
    if rcv.uuid.is_nil() {
        return Ok(());
    }

    let (session, just_created) = match table.get(&rcv.uuid) {
        Some(session) => {
            debug!(uuid = %rcv.uuid, "carrier matched live session");
            (session, false)
        }
        None => {
            if rcv.offset != Offset::NewRequest {
                debug!(uuid = %rcv.uuid, offset = ?rcv.offset, "carrier for unknown session");
                return Ok(());
            }
            let hostport = protocol::read_line(&mut carrier, b'\n')
                .await
                .context("no endpoint line after session request")?;
            let (_, port) = match ports::split_host_port(&hostport) {
                Ok(parts) => parts,
                Err(err) => {
                    debug!(%hostport, %err, "bad endpoint");
                    return Ok(());
                }
            };
            if !allowed.contains(&port) {
                info!(%hostport, "destination port not allowed");
                return Ok(());
            }
            let target = match TcpStream::connect(&hostport).await {
                Ok(target) => target,
                Err(err) => {
                    debug!(%hostport, %err, "could not dial endpoint");
                    return Ok(());
                }
            };
            info!(uuid = %rcv.uuid, %hostport, "session opened");

            let (target_rd, target_wr) = target.into_split();
            let session = Session::new(rcv.uuid, target_wr);
            tokio::spawn(target_reader(target_rd, session.clone()));
            if !table.insert(session.clone()) {
                // lost a creation race for this UUID; keep the older session
                session.close().await;
                return Ok(());
            }
            (session, true)
        }
    };

    // Supersede whatever carrier currently serves this session, then wait for
    // its handler to finish before taking over.
    let mut my_epoch = 0;
    session.epoch.send_modify(|epoch| {
        *epoch += 1;
        my_epoch = *epoch;
    });
    let _handler = session.handler_lock.lock().await;
    let mut epoch_rx = session.epoch.subscribe();
    if *epoch_rx.borrow_and_update() != my_epoch {
        return Ok(());
    }
    session.touch();

    let peer_offset = match rcv.offset {
        Offset::ClientEof => {
            debug!(uuid = %session.uuid, "client EOF, dropping session");
            table.remove(&session.uuid);
            session.close().await;
            return Ok(());
        }
        Offset::Delivered(n) => {
            if session.close_local.load(Ordering::SeqCst) {
                debug!(uuid = %session.uuid, "target EOF, signalling and dropping session");
                let eof = SessionHeader {
                    uuid: session.uuid,
                    offset: Offset::TargetEof,
                };
                let _ = eof.write_to(&mut carrier).await;
                table.remove(&session.uuid);
                return Ok(());
            }
            Some(n)
        }
        Offset::NewRequest => {
            if session.accepted.load(Ordering::SeqCst) {
                warn!(uuid = %session.uuid, "duplicate session request, dropping session");
                table.remove(&session.uuid);
                session.close().await;
                return Ok(());
            }
            if !just_created {
                // a retried request repeats the endpoint line; consume it so
                // it cannot be mistaken for frame data
                if protocol::read_line(&mut carrier, b'\n').await.is_err() {
                    return Ok(());
                }
            }
            None
        }
        Offset::NewAccepted | Offset::TargetEof => {
            warn!(uuid = %session.uuid, offset = ?rcv.offset, "nonsense offset from keeper");
            table.remove(&session.uuid);
            session.close().await;
            return Ok(());
        }
    };

    let my_offset = if session.accepted.load(Ordering::SeqCst) {
        Offset::Delivered(session.delivered.load(Ordering::SeqCst))
    } else {
        Offset::NewAccepted
    };
    let hdr = SessionHeader {
        uuid: session.uuid,
        offset: my_offset,
    };
    if hdr.write_to(&mut carrier).await.is_err() {
        if my_offset == Offset::NewAccepted {
            // never even greeted the keeper; no point keeping the session
            table.remove(&session.uuid);
            session.close().await;
        }
        return Ok(());
    }
    session.accepted.store(true, Ordering::SeqCst);

    let peer_offset = peer_offset.unwrap_or(0);
    let advanced = session.pending.lock().unwrap().advance_to(peer_offset);
    if let Err(err) = advanced {
        warn!(uuid = %session.uuid, %err, "replay window lost, dropping session");
        table.remove(&session.uuid);
        session.close().await;
        return Ok(());
    }
    session.touch();

    let (mut carrier_rd, mut carrier_wr) = carrier.into_split();
    let mut inbound = BytesMut::new();
    let mut scratch = vec![0u8; SCRATCH_SIZE];
    let mut tick = time::interval_at(time::Instant::now() + DRAIN_INTERVAL, DRAIN_INTERVAL);
    let mut notify_rx = session.notify_rx.lock().await;

    'leg: loop {
        // biased: drain readable tunnel data before reacting to supersession,
        // so bytes the keeper already sent still reach the target
        tokio::select! {
            biased;
            res = carrier_rd.read(&mut scratch) => match res {
                Ok(0) | Err(_) => break 'leg,
                Ok(n) => {
                    session.touch();
                    inbound.extend_from_slice(&scratch[..n]);
                    while let Some(payload) = protocol::take_frame(&mut inbound) {
                        if payload.is_empty() {
                            // keepalive
                            continue;
                        }
                        let mut target_wr = session.target_wr.lock().await;
                        if target_wr.write_all(&payload).await.is_err() {
                            session.close_local.store(true, Ordering::SeqCst);
                            break 'leg;
                        }
                        session.delivered.fetch_add(payload.len() as u64, Ordering::SeqCst);
                    }
                }
            },
            _ = tick.tick() => {}
            _ = notify_rx.recv() => {}
            res = epoch_rx.changed() => {
                if res.is_err() || *epoch_rx.borrow_and_update() != my_epoch {
                    debug!(uuid = %session.uuid, "carrier superseded");
                    break 'leg;
                }
            }
        }

        if flush_pending(&mut carrier_wr, &session.pending).await.is_err() {
            break 'leg;
        }
        if session.close_local.load(Ordering::SeqCst)
            && session.pending.lock().unwrap().is_empty()
        {
            // everything the target sent has been flushed; drop the carrier
            // and answer the next one with the EOF signal
            break 'leg;
        }
    }

    debug!(uuid = %session.uuid, "carrier done");
    Ok(())
}

/// Drains queued frames to the carrier as raw payload bytes, popping each
/// frame after a successful write. The return path carries no framing, so an
/// idle tunnel sends nothing here; dead carriers surface through the reader.
async fn flush_pending(
    carrier_wr: &mut OwnedWriteHalf,
    pending: &Mutex<ReplayBuffer>,
) -> std::io::Result<()> {
    loop {
        let frame = pending.lock().unwrap().front();
        match frame {
            Some(frame) => {
                carrier_wr.write_all(&frame[2..]).await?;
                pending.lock().unwrap().pop_front(frame.len());
            }
            None => return Ok(()),
        }
    }
}
