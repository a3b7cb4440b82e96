//! Control-line I/O for the resume protocol.
//!
//! Every control exchange (sockdir path, epoch announcement, byte-count
//! pair, finack, the OK/X tokens) is a newline-terminated ASCII line
//! read one byte at a time, because raw stream data follows immediately
//! on the same channel and a buffered read would swallow it.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::time::Instant;

use anyhow::{anyhow, bail, Context};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags};

use crate::consts;

/// Control lines are tiny (a path or a couple of decimals); anything
/// longer means the channel is not speaking our protocol.
const LINE_MAX: usize = 512;

/// The go-ahead the local side sends after learning the sockdir.
pub const TOKEN_OK: &str = "OK";
/// The remote proxy's report that the daemon cannot be reached.
pub const TOKEN_NO_DAEMON: &str = "X";

/// Mark a descriptor non-blocking, preserving its other status flags.
pub fn set_nonblocking<F: AsFd>(fd: &F) -> anyhow::Result<()> {
    let bits = fcntl(fd.as_fd(), FcntlArg::F_GETFL).context("getting fd status flags")?;
    let mut flags = OFlag::from_bits_retain(bits);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(fd.as_fd(), FcntlArg::F_SETFL(flags)).context("setting O_NONBLOCK")?;
    Ok(())
}

/// Convert a child stdio pipe into a non-blocking File handle. Plain
/// Files rather than the Child* wrappers so the forwarding loops can
/// treat every endpoint uniformly.
pub fn nonblocking_file<T: Into<OwnedFd>>(pipe: Option<T>) -> anyhow::Result<File> {
    let fd: OwnedFd = pipe
        .ok_or_else(|| anyhow!("child process is missing a stdio pipe"))?
        .into();
    let file = File::from(fd);
    set_nonblocking(&file)?;
    Ok(file)
}

/// Block until `fd` reports any of `events` (or a hangup), bounded by
/// the deadline.
fn wait_for<F: AsFd>(fd: &F, events: PollFlags, deadline: Instant) -> anyhow::Result<()> {
    loop {
        let now = Instant::now();
        if now >= deadline {
            bail!("timed out waiting for the control channel");
        }
        let remaining = (deadline - now).as_millis().min(u128::from(consts::POLL_MS)) as u16;
        let mut fds = [PollFd::new(fd.as_fd(), events)];
        match poll(&mut fds, remaining) {
            Ok(0) => continue,
            Ok(_) => {
                let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                if revents.intersects(events | PollFlags::POLLHUP | PollFlags::POLLERR) {
                    return Ok(());
                }
            }
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e).context("polling control channel"),
        }
    }
}

/// Read a single newline-terminated line, one byte per read, and return
/// it without the newline.
pub fn read_line<T: Read + AsFd>(src: &mut T, deadline: Instant) -> anyhow::Result<String> {
    let mut line: Vec<u8> = Vec::with_capacity(32);
    loop {
        wait_for(src, PollFlags::POLLIN, deadline)?;
        let mut byte = [0u8; 1];
        match src.read(&mut byte) {
            Ok(0) => bail!("channel closed mid control line"),
            Ok(_) => {
                if byte[0] == b'\n' {
                    break;
                }
                line.push(byte[0]);
                if line.len() > LINE_MAX {
                    bail!("control line exceeds {} bytes", LINE_MAX);
                }
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                continue;
            }
            Err(e) => return Err(e).context("reading control line"),
        }
    }

    String::from_utf8(line).context("control line is not utf8")
}

/// Write `line` plus a trailing newline, retrying short writes until
/// the deadline.
pub fn write_line<T: Write + AsFd>(dst: &mut T, line: &str, deadline: Instant) -> anyhow::Result<()> {
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');

    let mut off = 0;
    while off < buf.len() {
        wait_for(dst, PollFlags::POLLOUT, deadline)?;
        match dst.write(&buf[off..]) {
            Ok(0) => bail!("channel closed mid control line"),
            Ok(n) => off += n,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                continue;
            }
            Err(e) => return Err(e).context("writing control line"),
        }
    }
    dst.flush().context("flushing control line")?;
    Ok(())
}

pub fn format_counts(n1: u64, n2: u64) -> String {
    format!("{},{}", n1, n2)
}

pub fn parse_counts(line: &str) -> anyhow::Result<(u64, u64)> {
    let (a, b) = line
        .split_once(',')
        .ok_or_else(|| anyhow!("expected a byte-count pair, got {:?}", line))?;
    Ok((
        a.parse().context("parsing first byte count")?,
        b.parse().context("parsing second byte count")?,
    ))
}

pub fn parse_count(line: &str) -> anyhow::Result<u64> {
    line.parse()
        .with_context(|| format!("expected a byte count, got {:?}", line))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(2)
    }

    #[test]
    fn line_round_trip() {
        let (mut a, mut b) = UnixStream::pair().expect("socketpair");
        write_line(&mut a, "1048576,42", deadline()).expect("write");
        let line = read_line(&mut b, deadline()).expect("read");
        assert_eq!(line, "1048576,42");
        assert_eq!(parse_counts(&line).expect("parse"), (1048576, 42));
    }

    #[test]
    fn read_leaves_stream_data_alone() {
        let (mut a, mut b) = UnixStream::pair().expect("socketpair");
        a.write_all(b"7\npayload").expect("write");

        let line = read_line(&mut b, deadline()).expect("read line");
        assert_eq!(line, "7");
        assert_eq!(parse_count(&line).expect("parse"), 7);

        // the byte-at-a-time read must not have consumed the payload
        let mut rest = [0u8; 7];
        b.read_exact(&mut rest).expect("read payload");
        assert_eq!(&rest, b"payload");
    }

    #[test]
    fn read_times_out() {
        let (_a, mut b) = UnixStream::pair().expect("socketpair");
        let res = read_line(&mut b, Instant::now() + Duration::from_millis(150));
        assert!(res.is_err());
    }

    #[test]
    fn count_parse_errors() {
        let cases = vec!["", "12", "a,b", "1,2,3", "-4,1"];
        for line in cases {
            assert!(parse_counts(line).is_err(), "{:?} should not parse", line);
        }
    }
}
