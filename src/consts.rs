use std::time;

/// Streams are indexed 0/1/2 everywhere: input (app to command),
/// output and error (command back to the app).
pub const STREAM_IN: usize = 0;
pub const STREAM_OUT: usize = 1;
pub const STREAM_ERR: usize = 2;

/// How much unwritten data a stream may accumulate before we stop
/// reading from its producer.
pub const BUF_SIZE: usize = 1024 * 8192;

/// Replay buffers may grow to three times the backpressure bound
/// before the oldest BUF_SIZE bytes get dropped.
pub const BUF_RETAIN_MAX: usize = 3 * BUF_SIZE;

/// The unit of a single read or write in the forwarding loops.
pub const CHUNK_SIZE: usize = 8192;

/// The in-band end-of-stream sentinel. It travels through the replay
/// buffers like ordinary data so the byte accounting stays uniform, and
/// gets stripped again before any user-visible endpoint. A collision
/// with real data is tolerated by assumption.
pub const EOF_MARKER: &[u8] = b"SSHIM_EOFOE_MIHSS";

pub const POLL_MS: u16 = 100;

/// Bound on all handshake reads: the sockdir negotiation, the epoch
/// announcement, and the byte-count exchange. Overridable with
/// --timeout.
pub const HANDSHAKE_TIMEOUT: time::Duration = time::Duration::from_secs(10);

/// How many consecutive transport spawn failures we absorb before
/// declaring the session dead.
pub const MAX_SPAWN_RETRIES: u32 = 5;

/// Socket names inside the daemon's socket dir. sock.1 carries streams
/// 0 and 1, sock.2 carries stream 2 plus the reverse-direction finacks.
pub const SOCK_MAIN: &str = "sock.1";
pub const SOCK_AUX: &str = "sock.2";

pub const SOCKDIR_PREFIX: &str = "sshim-";
