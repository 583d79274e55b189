//! Per-direction replay buffer with a cumulative-offset cursor.

use anyhow::{bail, Result};
use bytes::{Buf, Bytes, BytesMut};

use crate::protocol::MAX_FRAME;

/// Ordered queue of data frames produced locally but not yet acknowledged by
/// the peer, addressed by cumulative payload offset.
///
/// Frames are stored back to back with their 2-byte length prefixes so the
/// queue can be replayed frame-by-frame after a carrier loss. `base` counts
/// the payload bytes dequeued so far; the peer's announced offset must always
/// fall inside `[base, base + queued]`.
#[derive(Debug, Default)]
pub struct ReplayBuffer {
    frames: BytesMut,
    base: u64,
    queued: u64,
}

impl ReplayBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cumulative payload bytes dequeued since the session started.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Payload bytes currently queued, excluding length prefixes.
    pub fn queued(&self) -> u64 {
        self.queued
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Wraps `payload` into length-prefixed frames and queues them.
    ///
    /// Called only by the local reader task. Payloads larger than a single
    /// frame are split; readers use 10 kB scratch buffers so this is a
    /// single frame in practice.
    pub fn append(&mut self, payload: &[u8]) {
        for chunk in payload.chunks(MAX_FRAME) {
            self.frames
                .extend_from_slice(&(chunk.len() as u16).to_be_bytes());
            self.frames.extend_from_slice(chunk);
            self.queued += chunk.len() as u64;
        }
    }

    /// Copies the head frame out, length prefix included.
    ///
    /// The copy lets the caller release the buffer lock while it writes the
    /// frame to the carrier; on success it comes back with [`pop_front`].
    ///
    /// [`pop_front`]: ReplayBuffer::pop_front
    pub fn front(&self) -> Option<Bytes> {
        if self.frames.len() < 2 {
            return None;
        }
        let len = u16::from_be_bytes([self.frames[0], self.frames[1]]) as usize;
        Some(Bytes::copy_from_slice(&self.frames[..2 + len]))
    }

    /// Drops `n` bytes from the head after a successful carrier write, where
    /// `n` covers exactly one frame: its payload plus the 2-byte prefix.
    pub fn pop_front(&mut self, n: usize) {
        debug_assert!(n >= 2 && n <= self.frames.len());
        debug_assert_eq!(
            u16::from_be_bytes([self.frames[0], self.frames[1]]) as usize,
            n - 2
        );
        self.frames.advance(n);
        let payload = (n - 2) as u64;
        self.base += payload;
        self.queued -= payload;
    }

    /// Discards frames already delivered by the peer, as announced in its
    /// handshake header.
    ///
    /// The announced offset must land inside the replay window and on a frame
    /// boundary; anything else means the two sides disagree about the stream
    /// and the session cannot be resumed safely.
    pub fn advance_to(&mut self, peer_offset: u64) -> Result<()> {
        if peer_offset < self.base || peer_offset > self.base + self.queued {
            bail!(
                "peer offset {peer_offset} outside replay window [{}, {}]",
                self.base,
                self.base + self.queued
            );
        }
        while self.base < peer_offset {
            let Some(frame) = self.front() else {
                bail!("replay queue ended short of peer offset {peer_offset}");
            };
            if self.base + (frame.len() as u64 - 2) > peer_offset {
                bail!("peer offset {peer_offset} does not fall on a frame boundary");
            }
            self.pop_front(frame.len());
        }
        Ok(())
    }
}
