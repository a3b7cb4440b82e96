//! The remote proxy: the transient middle leg of the relay. A fresh
//! incarnation is spawned through the transport on every (re)connect.
//! The first incarnation exists only to set the daemon up; every later
//! one connects to the daemon's sockets and forwards bytes until
//! something breaks or the session completes.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use nix::poll::{poll, PollFd, PollFlags};
use tracing::{debug, info, trace, warn};

use crate::buffer::StreamBuf;
use crate::consts::{self, STREAM_ERR, STREAM_IN, STREAM_OUT};
use crate::control;
use crate::daemon;

/// First incarnation: create the sockdir with both listening sockets,
/// hand the path back through the transport, and once the local side
/// acknowledges, detach into the daemon. The foreground half exits
/// with the detach, so this transport connection never forwards data;
/// forwarding starts with the next epoch.
pub fn bootstrap(command: &[String], epoch: u64, timeout: Duration) -> anyhow::Result<()> {
    if command.is_empty() {
        bail!("bootstrap invocation carries no user command");
    }

    let sockdir = tempfile::Builder::new()
        .prefix(consts::SOCKDIR_PREFIX)
        .rand_bytes(8)
        .tempdir()
        .context("creating sockdir")?;
    // sock.2 is bound last: its presence tells resuming proxies that
    // both sockets are ready
    let main_listener = UnixListener::bind(sockdir.path().join(consts::SOCK_MAIN))
        .context("binding sock.1")?;
    let aux_listener = UnixListener::bind(sockdir.path().join(consts::SOCK_AUX))
        .context("binding sock.2")?;

    let (mut stdin, mut stdout, _stderr) = stdio_files()?;
    let deadline = Instant::now() + timeout;
    let dir_line = sockdir.path().display().to_string();
    control::write_line(&mut stdout, &dir_line, deadline).context("announcing sockdir")?;
    let ack = control::read_line(&mut stdin, deadline).context("awaiting sockdir ack")?;
    if ack != control::TOKEN_OK {
        bail!("unexpected sockdir ack: {:?}", ack);
    }
    info!("sockdir {} acknowledged, detaching daemon", dir_line);

    // Parent exits here; the child gets a new session with its stdio
    // on the null device and becomes the daemon.
    daemonize::Daemonize::new().start().context("detaching daemon")?;

    daemon::run(sockdir, main_listener, aux_listener, command.to_vec(), epoch, timeout)
}

/// A resume incarnation: dial the daemon, announce our epoch, relay
/// the byte-count exchange, then forward until done.
pub fn run(sockdir: &Path, epoch: u64, timeout: Duration) -> anyhow::Result<()> {
    info!("\n\n==================== STARTING REMOTE PROXY ====================\n\n");

    let (mut stdin, mut stdout, stderr) = stdio_files()?;
    let deadline = Instant::now() + timeout;

    let (mut aux, mut main) = match dial(sockdir, deadline) {
        Ok(pair) => pair,
        Err(err) => {
            // The daemon is gone. The one useful thing left to do is
            // tell the local side, so it stops respawning us.
            warn!("cannot reach daemon: {:?}", err);
            let _ = control::write_line(&mut stdout, control::TOKEN_NO_DAEMON, deadline);
            return Err(err);
        }
    };

    control::write_line(&mut aux, &epoch.to_string(), deadline)
        .context("announcing epoch on sock.2")?;
    control::write_line(&mut main, &epoch.to_string(), deadline)
        .context("announcing epoch on sock.1")?;

    // relay the byte-count exchange between the local side and the
    // daemon; stream data follows immediately on both channels
    let counts = control::read_line(&mut stdin, deadline).context("reading local byte counts")?;
    control::write_line(&mut main, &counts, deadline).context("relaying byte counts")?;
    let reply = control::read_line(&mut main, deadline).context("reading daemon byte count")?;
    control::write_line(&mut stdout, &reply, deadline).context("relaying daemon byte count")?;
    info!("epoch {} connected (local counts {}, daemon count {})", epoch, counts, reply);

    Relay::new(stdin, stdout, stderr, main, aux)?.forward()
}

fn stdio_files() -> anyhow::Result<(File, File, File)> {
    // Dup the raw descriptors instead of using the std handles: the
    // std handles buffer, and a buffered read would swallow stream
    // data that follows a control line.
    Ok((
        File::from(io::stdin().as_fd().try_clone_to_owned().context("duping stdin")?),
        File::from(io::stdout().as_fd().try_clone_to_owned().context("duping stdout")?),
        File::from(io::stderr().as_fd().try_clone_to_owned().context("duping stderr")?),
    ))
}

fn dial(sockdir: &Path, deadline: Instant) -> anyhow::Result<(UnixStream, UnixStream)> {
    let aux_path = sockdir.join(consts::SOCK_AUX);
    let main_path = sockdir.join(consts::SOCK_MAIN);

    // On the first resume the daemon may still be mid-bootstrap, and
    // sock.2 appears last.
    let mut sleep_ms = 5;
    while !aux_path.exists() {
        if Instant::now() >= deadline {
            bail!("daemon socket {} never appeared", aux_path.display());
        }
        thread::sleep(Duration::from_millis(sleep_ms));
        sleep_ms = (sleep_ms * 2).min(200);
    }

    let aux = UnixStream::connect(&aux_path)
        .with_context(|| format!("connecting to {}", aux_path.display()))?;
    let main = UnixStream::connect(&main_path)
        .with_context(|| format!("connecting to {}", main_path.display()))?;
    Ok((aux, main))
}

#[derive(Clone, Copy, Debug)]
enum Arm {
    StdinRead,
    StdoutWrite,
    StderrWrite,
    MainIo,
    AuxIo,
}

/// The forwarding half of a resume incarnation. Stateless beyond its
/// own epoch: the buffers here start empty and die with the process;
/// anything lost with us gets replayed from the durable ends.
struct Relay {
    stdin: File,
    stdout: File,
    stderr: File,
    main: UnixStream,
    aux: UnixStream,
    streams: [StreamBuf; 3],
    /// Queued finack bytes awaiting a writable aux socket.
    finack_out: Vec<u8>,
    finack_sent: [bool; 2],
    /// The transport's input reached EOF without an in-band marker.
    stdin_eof: bool,
}

impl Relay {
    fn new(
        stdin: File,
        stdout: File,
        stderr: File,
        main: UnixStream,
        aux: UnixStream,
    ) -> anyhow::Result<Relay> {
        for f in [&stdin, &stdout, &stderr] {
            control::set_nonblocking(f)?;
        }
        main.set_nonblocking(true).context("marking sock.1 nonblocking")?;
        aux.set_nonblocking(true).context("marking sock.2 nonblocking")?;

        Ok(Relay {
            stdin,
            stdout,
            stderr,
            main,
            aux,
            streams: [StreamBuf::new(), StreamBuf::new(), StreamBuf::new()],
            finack_out: Vec::new(),
            finack_sent: [false, false],
            stdin_eof: false,
        })
    }

    fn forward(mut self) -> anyhow::Result<()> {
        loop {
            self.tick()?;
            if self.done() {
                break;
            }
        }
        info!("all streams delivered and acknowledged");
        Ok(())
    }

    /// Both outbound streams fully delivered to the transport and both
    /// finacks flushed back to the daemon. Stream 0 does not get a
    /// say: it may well still be open when the command exits.
    fn done(&self) -> bool {
        self.streams[STREAM_OUT].complete()
            && self.streams[STREAM_ERR].complete()
            && self.finack_sent == [true, true]
            && self.finack_out.is_empty()
    }

    fn tick(&mut self) -> anyhow::Result<()> {
        let mut fds: Vec<PollFd> = Vec::with_capacity(5);
        let mut arms: Vec<Arm> = Vec::with_capacity(5);

        if !self.stdin_eof
            && !self.streams[STREAM_IN].eof()
            && !self.streams[STREAM_IN].saturated()
        {
            fds.push(PollFd::new(self.stdin.as_fd(), PollFlags::POLLIN));
            arms.push(Arm::StdinRead);
        }
        if !self.streams[STREAM_OUT].pending().is_empty() {
            fds.push(PollFd::new(self.stdout.as_fd(), PollFlags::POLLOUT));
            arms.push(Arm::StdoutWrite);
        }
        if !self.streams[STREAM_ERR].pending().is_empty() {
            fds.push(PollFd::new(self.stderr.as_fd(), PollFlags::POLLOUT));
            arms.push(Arm::StderrWrite);
        }

        let mut main_flags = PollFlags::empty();
        if !self.streams[STREAM_OUT].eof() && !self.streams[STREAM_OUT].saturated() {
            main_flags |= PollFlags::POLLIN;
        }
        if !self.streams[STREAM_IN].pending().is_empty() {
            main_flags |= PollFlags::POLLOUT;
        }
        if !main_flags.is_empty() {
            fds.push(PollFd::new(self.main.as_fd(), main_flags));
            arms.push(Arm::MainIo);
        }

        let mut aux_flags = PollFlags::empty();
        if !self.streams[STREAM_ERR].eof() && !self.streams[STREAM_ERR].saturated() {
            aux_flags |= PollFlags::POLLIN;
        }
        if !self.finack_out.is_empty() {
            aux_flags |= PollFlags::POLLOUT;
        }
        if !aux_flags.is_empty() {
            fds.push(PollFd::new(self.aux.as_fd(), aux_flags));
            arms.push(Arm::AuxIo);
        }

        if fds.is_empty() {
            thread::sleep(Duration::from_millis(u64::from(consts::POLL_MS)));
        } else {
            match poll(&mut fds, consts::POLL_MS) {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => return Ok(()),
                Err(e) => return Err(e).context("polling relay handles"),
            }
        }

        let ready: Vec<(Arm, PollFlags)> = arms
            .iter()
            .zip(fds.iter())
            .filter_map(|(arm, fd)| {
                fd.revents().filter(|r| !r.is_empty()).map(|r| (*arm, r))
            })
            .collect();
        drop(fds);

        let readish = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
        for (arm, revents) in ready {
            match arm {
                Arm::StdinRead => self.read_stdin()?,
                Arm::StdoutWrite => self.write_stdout()?,
                Arm::StderrWrite => self.write_stderr()?,
                Arm::MainIo => {
                    if revents.intersects(readish) {
                        self.read_main()?;
                    }
                    if revents.contains(PollFlags::POLLOUT) {
                        self.write_main()?;
                    }
                }
                Arm::AuxIo => {
                    if revents.intersects(readish) {
                        self.read_aux()?;
                    }
                    if revents.contains(PollFlags::POLLOUT) {
                        self.write_aux()?;
                    }
                }
            }
        }

        self.queue_finacks();

        if self.stdin_eof && !self.done() {
            // A clean teardown races our final finack flush: the local
            // side closes the transport as soon as it has the last
            // byte. Completed streams get that flush; anything else is
            // a break, and aborting lets the local side respawn.
            if !(self.streams[STREAM_OUT].complete() && self.streams[STREAM_ERR].complete()) {
                bail!("transport input closed mid-session");
            }
        }

        for s in self.streams.iter_mut() {
            s.reclaim()?;
        }
        Ok(())
    }

    /// A stream is acknowledged once every byte of it, marker
    /// included, has gone out toward the local side.
    fn queue_finacks(&mut self) {
        for (slot, idx) in [(0usize, STREAM_OUT), (1usize, STREAM_ERR)] {
            if !self.finack_sent[slot] && self.streams[idx].complete() {
                info!("stream {} fully delivered, acknowledging", idx);
                self.finack_out.extend_from_slice(format!("{}\n", idx).as_bytes());
                self.finack_sent[slot] = true;
            }
        }
    }

    fn read_stdin(&mut self) -> anyhow::Result<()> {
        let mut chunk = [0u8; consts::CHUNK_SIZE];
        match self.stdin.read(&mut chunk) {
            Ok(0) => {
                debug!("transport input closed");
                self.stdin_eof = true;
            }
            Ok(n) => {
                trace!("read {} bytes of stream 0", n);
                self.streams[STREAM_IN].record(&chunk[..n]);
            }
            Err(e) if retryable(&e) => {}
            Err(e) => return Err(e).context("reading transport input"),
        }
        Ok(())
    }

    fn write_stdout(&mut self) -> anyhow::Result<()> {
        let window = self.streams[STREAM_OUT].pending();
        let n = window.len().min(consts::CHUNK_SIZE);
        match self.stdout.write(&window[..n]) {
            Ok(written) => {
                trace!("wrote {} bytes of stream 1 to the transport", written);
                self.streams[STREAM_OUT].advance(written);
            }
            Err(e) if retryable(&e) => {}
            Err(e) => return Err(e).context("writing stream 1 to the transport"),
        }
        Ok(())
    }

    fn write_stderr(&mut self) -> anyhow::Result<()> {
        let window = self.streams[STREAM_ERR].pending();
        let n = window.len().min(consts::CHUNK_SIZE);
        match self.stderr.write(&window[..n]) {
            Ok(written) => {
                trace!("wrote {} bytes of stream 2 to the transport", written);
                self.streams[STREAM_ERR].advance(written);
            }
            Err(e) if retryable(&e) => {}
            Err(e) => return Err(e).context("writing stream 2 to the transport"),
        }
        Ok(())
    }

    fn read_main(&mut self) -> anyhow::Result<()> {
        let mut chunk = [0u8; consts::CHUNK_SIZE];
        match self.main.read(&mut chunk) {
            Ok(0) => {
                // eviction by a newer epoch, or the daemon finishing
                // up; either way this incarnation is over
                if !self.done() {
                    bail!("daemon closed the stream-0/1 socket");
                }
            }
            Ok(n) => {
                trace!("read {} bytes of stream 1", n);
                self.streams[STREAM_OUT].record(&chunk[..n]);
                if self.streams[STREAM_OUT].eof() {
                    debug!("stream 1 end-of-stream marker received");
                }
            }
            Err(e) if retryable(&e) => {}
            Err(e) => return Err(e).context("reading from the stream-0/1 socket"),
        }
        Ok(())
    }

    fn write_main(&mut self) -> anyhow::Result<()> {
        let window = self.streams[STREAM_IN].pending();
        let n = window.len().min(consts::CHUNK_SIZE);
        match self.main.write(&window[..n]) {
            Ok(written) => {
                trace!("wrote {} bytes of stream 0 to the daemon", written);
                self.streams[STREAM_IN].advance(written);
            }
            Err(e) if retryable(&e) => {}
            Err(e) => return Err(e).context("writing stream 0 to the daemon"),
        }
        Ok(())
    }

    fn read_aux(&mut self) -> anyhow::Result<()> {
        let mut chunk = [0u8; consts::CHUNK_SIZE];
        match self.aux.read(&mut chunk) {
            Ok(0) => {
                if !self.done() {
                    bail!("daemon closed the stream-2 socket");
                }
            }
            Ok(n) => {
                trace!("read {} bytes of stream 2", n);
                self.streams[STREAM_ERR].record(&chunk[..n]);
                if self.streams[STREAM_ERR].eof() {
                    debug!("stream 2 end-of-stream marker received");
                }
            }
            Err(e) if retryable(&e) => {}
            Err(e) => return Err(e).context("reading from the stream-2 socket"),
        }
        Ok(())
    }

    fn write_aux(&mut self) -> anyhow::Result<()> {
        match self.aux.write(&self.finack_out) {
            Ok(written) => {
                debug!("flushed {} finack bytes", written);
                self.finack_out.drain(..written);
            }
            Err(e) if retryable(&e) => {}
            Err(e) => return Err(e).context("writing finacks to the daemon"),
        }
        Ok(())
    }
}

fn retryable(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted
}
