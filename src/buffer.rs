use std::fmt;

use crate::consts::{BUF_RETAIN_MAX, BUF_SIZE, EOF_MARKER};

/// The replay window can no longer satisfy a resume request, or the
/// cursor bookkeeping has gone off the rails. Either way the session
/// cannot be recovered; callers downcast to tell this apart from the
/// retryable spawn and socket errors.
#[derive(Debug)]
pub struct ReplayWindowError(String);

impl fmt::Display for ReplayWindowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for ReplayWindowError {}

/// StreamBuf is the bookkeeping for a single forwarded stream: the
/// retained tail of everything read from the producer, a cursor
/// tracking how much of it has been written to the consumer, the
/// running byte count used by the resume handshake, and the
/// end-of-stream flag.
///
/// The in-band EOF marker lives in `buf` like ordinary data so that
/// `rbytes` and the cursor arithmetic treat it uniformly.
#[derive(Debug, Default)]
pub struct StreamBuf {
    /// Most recent bytes read from the producer, marker included.
    buf: Vec<u8>,
    /// How many bytes of `buf` have been written to the consumer.
    ibuf: usize,
    /// Total bytes ever read from the producer, including bytes that
    /// have since been dropped from `buf`.
    rbytes: u64,
    /// Never reverts once set.
    eof: bool,
}

impl StreamBuf {
    pub fn new() -> Self {
        StreamBuf::default()
    }

    /// Append a chunk read from the producer. A tail equal to the EOF
    /// marker means the producing side signalled end-of-stream in-band;
    /// a marker split across reads is recognized once its final byte
    /// lands.
    pub fn record(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
        self.rbytes += chunk.len() as u64;
        if !self.eof && self.buf.ends_with(EOF_MARKER) {
            self.eof = true;
        }
    }

    /// Synthesize end-of-stream: append the marker as if the producer
    /// had sent it. Used by originating producers when their handle
    /// reports a clean zero-length read.
    pub fn push_eof(&mut self) {
        if self.eof {
            return;
        }
        self.buf.extend_from_slice(EOF_MARKER);
        self.rbytes += EOF_MARKER.len() as u64;
        self.eof = true;
    }

    pub fn rbytes(&self) -> u64 {
        self.rbytes
    }

    pub fn eof(&self) -> bool {
        self.eof
    }

    /// Bytes not yet written to the consumer, marker included.
    pub fn pending(&self) -> &[u8] {
        &self.buf[self.ibuf..]
    }

    /// The slice the next write should come from. User-facing
    /// endpoints must never see the marker bytes, so `strip_marker`
    /// caps the window just short of them. Before the marker is
    /// complete, a tail that could still turn out to be one (the
    /// marker arrives fragmented like any other bytes) is held back
    /// until the next read disambiguates it.
    pub fn write_window(&self, strip_marker: bool) -> &[u8] {
        let mut end = self.buf.len();
        if strip_marker {
            if self.eof {
                end = end.saturating_sub(EOF_MARKER.len());
            } else {
                end -= marker_overhang(&self.buf);
            }
        }
        if self.ibuf >= end {
            &[]
        } else {
            &self.buf[self.ibuf..end]
        }
    }

    pub fn advance(&mut self, n: usize) {
        self.ibuf += n;
        debug_assert!(self.ibuf <= self.buf.len());
    }

    /// Step the cursor over the trailing marker once everything before
    /// it has been delivered. The marker is consumed, never forwarded.
    /// Idempotent, so the forwarding loops can call it every pass.
    pub fn consume_marker(&mut self) {
        if self.eof && self.buf.len() - self.ibuf == EOF_MARKER.len() {
            self.ibuf = self.buf.len();
        }
    }

    /// Drop anything still pending. Used when the consumer is gone for
    /// good: the counters keep running so resume arithmetic stays
    /// consistent, but nothing further will be delivered.
    pub fn discard_pending(&mut self) {
        self.ibuf = self.buf.len();
    }

    pub fn drained(&self) -> bool {
        self.ibuf == self.buf.len()
    }

    /// End-of-stream seen and every byte (marker included) accounted
    /// for by the cursor.
    pub fn complete(&self) -> bool {
        self.eof && self.drained()
    }

    /// Producer-side backpressure: too much buffered-but-unwritten
    /// data, stop reading until the consumer catches up.
    pub fn saturated(&self) -> bool {
        self.buf.len() - self.ibuf > BUF_SIZE
    }

    /// Enforce the retention bound: at 3x BUF_SIZE, drop the oldest
    /// BUF_SIZE bytes. The dropped range must already have been
    /// written; backpressure guarantees that unless the cursor
    /// bookkeeping is broken, which is fatal.
    pub fn reclaim(&mut self) -> Result<(), ReplayWindowError> {
        if self.buf.len() < BUF_RETAIN_MAX {
            return Ok(());
        }
        if self.ibuf < BUF_SIZE {
            return Err(ReplayWindowError(format!(
                "cannot reclaim {} retained bytes: only {} written so far",
                BUF_SIZE, self.ibuf
            )));
        }
        self.buf.drain(..BUF_SIZE);
        self.ibuf -= BUF_SIZE;
        Ok(())
    }

    /// Reposition the cursor from a peer's delivered-byte count so
    /// replay begins at the first unconfirmed byte. Bytes older than
    /// the retained window cannot be replayed.
    pub fn rewind(&mut self, delivered: u64) -> Result<(), ReplayWindowError> {
        if delivered > self.rbytes {
            return Err(ReplayWindowError(format!(
                "peer reports {} bytes delivered but only {} were ever read",
                delivered, self.rbytes
            )));
        }
        let lag = self.rbytes - delivered;
        if lag > self.buf.len() as u64 {
            return Err(ReplayWindowError(format!(
                "resume needs the last {} bytes but only {} are retained",
                lag,
                self.buf.len()
            )));
        }
        self.ibuf = self.buf.len() - lag as usize;
        Ok(())
    }
}

/// Length of the longest proper marker prefix sitting at the end of
/// `buf`. Such a tail cannot be written to a stripping consumer yet:
/// the next read decides whether it was the marker or just data.
fn marker_overhang(buf: &[u8]) -> usize {
    let max = (EOF_MARKER.len() - 1).min(buf.len());
    for k in (1..=max).rev() {
        if buf.ends_with(&EOF_MARKER[..k]) {
            return k;
        }
    }
    0
}
