//! The local proxy: sits between the invoking application and the
//! transport client, owns the epoch counter, and respawns the
//! transport whenever the connection to the remote side breaks.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use std::{env, thread};

use anyhow::{bail, Context};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags};
use tracing::{debug, error, info, trace, warn};

use crate::buffer::{ReplayWindowError, StreamBuf};
use crate::config::Config;
use crate::consts::{self, STREAM_ERR, STREAM_IN, STREAM_OUT};
use crate::control;
use crate::transport::{self, TransportCommand};
use crate::Args;

pub fn run(args: &Args, config: &Config) -> anyhow::Result<()> {
    let transport = transport::split(&args.rest)?;
    info!("\n\n==================== STARTING SESSION ====================\n\n");

    let mut session = Session::new(args, config, transport)?;
    session.forward()
}

/// Marker error: the remote proxy reported (with the literal `X`) that
/// the daemon cannot be contacted. Respawning will not help.
#[derive(Debug)]
struct DaemonUnreachable;

impl fmt::Display for DaemonUnreachable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "remote daemon is unreachable")
    }
}
impl std::error::Error for DaemonUnreachable {}

/// One incarnation of the transport client and its three pipes.
struct Link {
    child: std::process::Child,
    stdin: File,
    stdout: File,
    stderr: File,
    stdout_closed: bool,
    stderr_closed: bool,
}

impl Link {
    fn shutdown(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// The application-facing side: dups of the stdio descriptors we
/// inherited from whoever invoked us.
struct AppSide {
    stdin: File,
    stdout: File,
    stderr: File,
    stdin_open: bool,
}

/// The inherited stdio descriptors may be shared with the invoking
/// shell, so the O_NONBLOCK we need for the forwarding loop has to be
/// undone on the way out.
struct StdioFlagsGuard {
    saved: [OFlag; 3],
}

impl StdioFlagsGuard {
    fn set_nonblocking() -> anyhow::Result<StdioFlagsGuard> {
        let (stdin, stdout, stderr) = (io::stdin(), io::stdout(), io::stderr());
        let fds = [stdin.as_fd(), stdout.as_fd(), stderr.as_fd()];
        let mut saved = [OFlag::empty(); 3];
        for (slot, fd) in saved.iter_mut().zip(fds.iter()) {
            let bits = fcntl(fd, FcntlArg::F_GETFL).context("getting stdio flags")?;
            *slot = OFlag::from_bits_retain(bits);
            fcntl(fd, FcntlArg::F_SETFL(*slot | OFlag::O_NONBLOCK))
                .context("setting stdio nonblocking")?;
        }
        Ok(StdioFlagsGuard { saved })
    }
}

impl Drop for StdioFlagsGuard {
    fn drop(&mut self) {
        let (stdin, stdout, stderr) = (io::stdin(), io::stdout(), io::stderr());
        let fds: [BorrowedFd; 3] = [stdin.as_fd(), stdout.as_fd(), stderr.as_fd()];
        for (fd, flags) in fds.iter().zip(self.saved.iter()) {
            if let Err(e) = fcntl(fd, FcntlArg::F_SETFL(*flags)) {
                error!("error restoring stdio flags: {:?}", e);
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Arm {
    AppRead,
    AppWrite(usize),
    LinkRead(usize),
    LinkWrite,
}

struct Session {
    transport: TransportCommand,
    /// Path of the shim binary on the remote host.
    shim: String,
    /// Extra flags (timeout, remote logging) for internal invocations.
    remote_flags: Vec<String>,
    timeout: Duration,
    retry_budget: u32,
    epoch: u64,
    /// Memoized after the bootstrap negotiation; its presence turns
    /// every later spawn into a resume.
    sockdir: Option<String>,
    streams: [StreamBuf; 3],
    app: AppSide,
    link: Option<Link>,
    /// Set when a write toward the application comes back broken.
    /// There is nobody left to deliver output to, so the session just
    /// winds down.
    app_gone: bool,
    _stdio_flags: StdioFlagsGuard,
}

impl Session {
    fn new(args: &Args, config: &Config, transport: TransportCommand) -> anyhow::Result<Session> {
        let timeout_secs = args
            .timeout
            .or(config.timeout_secs)
            .or_else(|| transport.absorbed.get("ConnectTimeout").and_then(|v| v.parse().ok()));
        let timeout = timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(consts::HANDSHAKE_TIMEOUT);

        let mut remote_flags = Vec::new();
        if let Some(secs) = timeout_secs {
            remote_flags.push(format!("--timeout={}", secs));
        }
        if let Some(path) = &config.remote_log_file {
            remote_flags.push(format!("--log-file={}", path));
        }
        for _ in 0..config.remote_verbose.unwrap_or(0) {
            remote_flags.push(String::from("-v"));
        }

        let shim = match &config.remote_shim {
            Some(s) => s.clone(),
            None => env::args().next().unwrap_or_else(|| String::from("sshim")),
        };

        let _stdio_flags = StdioFlagsGuard::set_nonblocking()?;
        let app = AppSide {
            stdin: File::from(
                io::stdin().as_fd().try_clone_to_owned().context("duping stdin")?,
            ),
            stdout: File::from(
                io::stdout().as_fd().try_clone_to_owned().context("duping stdout")?,
            ),
            stderr: File::from(
                io::stderr().as_fd().try_clone_to_owned().context("duping stderr")?,
            ),
            stdin_open: true,
        };

        Ok(Session {
            transport,
            shim,
            remote_flags,
            timeout,
            retry_budget: config.spawn_retries.unwrap_or(consts::MAX_SPAWN_RETRIES),
            epoch: 0,
            sockdir: None,
            streams: [StreamBuf::new(), StreamBuf::new(), StreamBuf::new()],
            app,
            link: None,
            app_gone: false,
            _stdio_flags,
        })
    }

    fn forward(&mut self) -> anyhow::Result<()> {
        loop {
            if self.finished() {
                break;
            }
            if self.link.is_none() && self.need_link() {
                self.connect()?;
            }
            self.tick()?;
        }

        info!("session complete");
        self.finish_link();
        Ok(())
    }

    /// The session is over once both command-to-app streams have been
    /// delivered in full. Stream 0 has no terminal state of its own:
    /// its life ends with the app's EOF or the command's exit.
    fn finished(&self) -> bool {
        if self.app_gone {
            // nobody left to deliver output to; just flush the
            // synthesized stream-0 EOF so the daemon can close the
            // command's input, then go. A broken transport does not
            // excuse dropping that tail: it gets reconnected like any
            // other break.
            return self.streams[STREAM_IN].drained();
        }
        self.streams[STREAM_OUT].complete() && self.streams[STREAM_ERR].complete()
    }

    fn need_link(&self) -> bool {
        if self.app_gone && !self.streams[STREAM_IN].drained() {
            // the app's consumer is gone but the tail of stream 0
            // (synthesized EOF included) still has to reach the daemon
            return true;
        }
        !(self.streams[STREAM_OUT].eof() && self.streams[STREAM_ERR].eof())
    }

    /// Establish a forwarding link, spawning the transport as many
    /// times as it takes (within the retry budget). The first
    /// successful spawn only negotiates the sockdir; forwarding always
    /// runs on a later epoch.
    fn connect(&mut self) -> anyhow::Result<()> {
        let mut failures = 0;
        while self.link.is_none() {
            match self.try_connect() {
                Ok(()) => {}
                Err(err) => {
                    if err.downcast_ref::<DaemonUnreachable>().is_some()
                        || err.downcast_ref::<ReplayWindowError>().is_some()
                    {
                        return Err(err);
                    }
                    failures += 1;
                    if failures >= self.retry_budget {
                        return Err(err.context(format!(
                            "giving up after {} failed transport spawns",
                            failures
                        )));
                    }
                    warn!("transport spawn attempt {} failed: {:?}", failures, err);
                    thread::sleep(Duration::from_millis(250));
                }
            }
        }
        Ok(())
    }

    fn try_connect(&mut self) -> anyhow::Result<()> {
        self.epoch += 1;
        let spawn_args = self.transport.spawn_args(
            &self.shim,
            self.epoch,
            self.sockdir.as_deref(),
            &self.remote_flags,
        );
        info!(
            "spawning transport at epoch {}: {} {:?}",
            self.epoch, self.transport.program, spawn_args
        );

        let mut child = Command::new(&self.transport.program)
            .args(&spawn_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawning transport client")?;
        let stdin = control::nonblocking_file(child.stdin.take())
            .context("taking transport stdin")?;
        let stdout = control::nonblocking_file(child.stdout.take())
            .context("taking transport stdout")?;
        let stderr = control::nonblocking_file(child.stderr.take())
            .context("taking transport stderr")?;
        let mut link =
            Link { child, stdin, stdout, stderr, stdout_closed: false, stderr_closed: false };

        let deadline = Instant::now() + self.timeout;
        if self.sockdir.is_none() {
            match negotiate_sockdir(&mut link, deadline) {
                Ok(dir) => {
                    info!("daemon bootstrapped with sockdir {}", dir);
                    self.sockdir = Some(dir);
                    reap_bootstrap(link, deadline);
                    Ok(())
                }
                Err(err) => {
                    link.shutdown();
                    Err(err)
                }
            }
        } else {
            match self.resume(&mut link, deadline) {
                Ok(()) => {
                    self.link = Some(link);
                    Ok(())
                }
                Err(err) => {
                    link.shutdown();
                    Err(err)
                }
            }
        }
    }

    /// The byte-count exchange: report how much of streams 1 and 2 we
    /// have seen, learn how much of stream 0 the daemon has seen, and
    /// rewind our replay cursor to the first unconfirmed byte.
    fn resume(&mut self, link: &mut Link, deadline: Instant) -> anyhow::Result<()> {
        let counts = control::format_counts(
            self.streams[STREAM_OUT].rbytes(),
            self.streams[STREAM_ERR].rbytes(),
        );
        control::write_line(&mut link.stdin, &counts, deadline)
            .context("reporting received-byte counts")?;

        let reply = control::read_line(&mut link.stdout, deadline)
            .context("reading daemon's stream-0 count")?;
        if reply == control::TOKEN_NO_DAEMON {
            return Err(anyhow::Error::new(DaemonUnreachable));
        }
        let delivered = control::parse_count(&reply)?;
        self.streams[STREAM_IN].rewind(delivered)?;
        info!(
            "connected at epoch {}: stream 0 confirmed through byte {}, {} bytes to replay",
            self.epoch,
            delivered,
            self.streams[STREAM_IN].pending().len()
        );
        Ok(())
    }

    fn drop_link(&mut self) {
        if let Some(link) = self.link.take() {
            link.shutdown();
        }
    }

    /// Clean teardown: close our pipe ends and give the transport a
    /// moment to flush (the remote proxy still owes the daemon its
    /// final finacks) before resorting to a kill.
    fn finish_link(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        let Link { mut child, stdin, stdout, stderr, .. } = link;
        drop(stdin);
        drop(stdout);
        drop(stderr);

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!("transport exited: {}", status);
                    return;
                }
                Ok(None) if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(20));
                }
                _ => {
                    warn!("transport lingered after session end, killing it");
                    let _ = child.kill();
                    let _ = child.wait();
                    return;
                }
            }
        }
    }

    /// One pass of the forwarding loop: a readiness poll over whatever
    /// handles currently have work, then service of the ready arms.
    fn tick(&mut self) -> anyhow::Result<()> {
        let mut fds: Vec<PollFd> = Vec::with_capacity(6);
        let mut arms: Vec<Arm> = Vec::with_capacity(6);

        if self.app.stdin_open
            && !self.streams[STREAM_IN].eof()
            && !self.streams[STREAM_IN].saturated()
        {
            fds.push(PollFd::new(self.app.stdin.as_fd(), PollFlags::POLLIN));
            arms.push(Arm::AppRead);
        }
        if !self.app_gone {
            if !self.streams[STREAM_OUT].write_window(true).is_empty() {
                fds.push(PollFd::new(self.app.stdout.as_fd(), PollFlags::POLLOUT));
                arms.push(Arm::AppWrite(STREAM_OUT));
            }
            if !self.streams[STREAM_ERR].write_window(true).is_empty() {
                fds.push(PollFd::new(self.app.stderr.as_fd(), PollFlags::POLLOUT));
                arms.push(Arm::AppWrite(STREAM_ERR));
            }
        }
        if let Some(link) = self.link.as_ref() {
            if !link.stdout_closed
                && !self.streams[STREAM_OUT].eof()
                && !self.streams[STREAM_OUT].saturated()
            {
                fds.push(PollFd::new(link.stdout.as_fd(), PollFlags::POLLIN));
                arms.push(Arm::LinkRead(STREAM_OUT));
            }
            if !link.stderr_closed
                && !self.streams[STREAM_ERR].eof()
                && !self.streams[STREAM_ERR].saturated()
            {
                fds.push(PollFd::new(link.stderr.as_fd(), PollFlags::POLLIN));
                arms.push(Arm::LinkRead(STREAM_ERR));
            }
            if !self.streams[STREAM_IN].pending().is_empty() {
                fds.push(PollFd::new(link.stdin.as_fd(), PollFlags::POLLOUT));
                arms.push(Arm::LinkWrite);
            }
        }

        if fds.is_empty() {
            thread::sleep(Duration::from_millis(u64::from(consts::POLL_MS)));
        } else {
            match poll(&mut fds, consts::POLL_MS) {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => return Ok(()),
                Err(e) => return Err(e).context("polling session handles"),
            }
        }

        let ready: Vec<Arm> = arms
            .iter()
            .zip(fds.iter())
            .filter(|(_, fd)| fd.revents().map(|r| !r.is_empty()).unwrap_or(false))
            .map(|(arm, _)| *arm)
            .collect();
        drop(fds);

        for arm in ready {
            match arm {
                Arm::AppRead => self.read_app()?,
                Arm::AppWrite(idx) => self.write_app(idx)?,
                Arm::LinkRead(idx) => self.read_link(idx)?,
                Arm::LinkWrite => self.write_link()?,
            }
        }

        self.streams[STREAM_OUT].consume_marker();
        self.streams[STREAM_ERR].consume_marker();
        if self.app_gone {
            self.streams[STREAM_OUT].discard_pending();
            self.streams[STREAM_ERR].discard_pending();
        }

        self.check_transport()?;

        for s in self.streams.iter_mut() {
            s.reclaim()?;
        }
        Ok(())
    }

    fn read_app(&mut self) -> anyhow::Result<()> {
        let mut chunk = [0u8; consts::CHUNK_SIZE];
        match self.app.stdin.read(&mut chunk) {
            Ok(0) => {
                info!("application closed its input");
                self.streams[STREAM_IN].push_eof();
                self.app.stdin_open = false;
            }
            Ok(n) => {
                trace!("read {} bytes from the application", n);
                self.streams[STREAM_IN].record(&chunk[..n]);
            }
            Err(e) if retryable(&e) => {}
            Err(e) => return Err(e).context("reading application input"),
        }
        Ok(())
    }

    fn write_app(&mut self, idx: usize) -> anyhow::Result<()> {
        let window = self.streams[idx].write_window(true);
        let n = window.len().min(consts::CHUNK_SIZE);
        if n == 0 {
            return Ok(());
        }
        let file =
            if idx == STREAM_OUT { &mut self.app.stdout } else { &mut self.app.stderr };
        match file.write(&window[..n]) {
            Ok(written) => {
                trace!("wrote {} bytes of stream {} to the application", written, idx);
                self.streams[idx].advance(written);
            }
            Err(e) if retryable(&e) => {}
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                // The app's consumer vanished. Stop reading its input
                // and synthesize stream-0 EOF so the remote side can
                // close the command's stdin.
                info!("application-side consumer for stream {} is gone", idx);
                self.app_gone = true;
                self.streams[STREAM_IN].push_eof();
                self.app.stdin_open = false;
            }
            Err(e) => return Err(e).context("writing to the application"),
        }
        Ok(())
    }

    fn read_link(&mut self, idx: usize) -> anyhow::Result<()> {
        let mut chunk = [0u8; consts::CHUNK_SIZE];
        let res = {
            let Some(link) = self.link.as_mut() else {
                return Ok(());
            };
            let file = if idx == STREAM_OUT { &mut link.stdout } else { &mut link.stderr };
            file.read(&mut chunk)
        };
        match res {
            Ok(0) => {
                if let Some(link) = self.link.as_mut() {
                    if idx == STREAM_OUT {
                        link.stdout_closed = true;
                    } else {
                        link.stderr_closed = true;
                    }
                }
                if !self.streams[idx].eof() {
                    // closure without the end-of-stream marker is a
                    // break, not an EOF
                    info!("transport stream {} broke mid-stream", idx);
                    self.drop_link();
                }
            }
            Ok(n) => {
                trace!("read {} transport bytes for stream {}", n, idx);
                self.streams[idx].record(&chunk[..n]);
                if self.streams[idx].eof() {
                    debug!("stream {} end-of-stream marker received", idx);
                }
            }
            Err(e) if retryable(&e) => {}
            Err(e) => {
                info!("transport read error on stream {} ({}), reconnecting", idx, e);
                self.drop_link();
            }
        }
        Ok(())
    }

    fn write_link(&mut self) -> anyhow::Result<()> {
        let res = {
            let Some(link) = self.link.as_mut() else {
                return Ok(());
            };
            let window = self.streams[STREAM_IN].pending();
            let n = window.len().min(consts::CHUNK_SIZE);
            link.stdin.write(&window[..n])
        };
        match res {
            Ok(written) => {
                trace!("wrote {} bytes of stream 0 to the transport", written);
                self.streams[STREAM_IN].advance(written);
            }
            Err(e) if retryable(&e) => {}
            Err(e) => {
                info!("transport write failed ({}), reconnecting", e);
                self.drop_link();
            }
        }
        Ok(())
    }

    /// Non-blocking child status check, once per loop pass. The link
    /// only comes down once both pipes have drained: the tail of the
    /// data (markers included) may still be in flight when the child
    /// exits.
    fn check_transport(&mut self) -> anyhow::Result<()> {
        let Some(link) = self.link.as_mut() else {
            return Ok(());
        };
        match link.child.try_wait() {
            Ok(Some(status)) => {
                let out_done = link.stdout_closed || self.streams[STREAM_OUT].eof();
                let err_done = link.stderr_closed || self.streams[STREAM_ERR].eof();
                if out_done && err_done {
                    debug!("transport exited: {}", status);
                    self.drop_link();
                }
            }
            Ok(None) => {}
            Err(e) => return Err(e).context("checking transport status"),
        }
        Ok(())
    }
}

fn retryable(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted
}

/// First contact: the remote side announces where its sockets live,
/// and we acknowledge so it can detach the daemon.
fn negotiate_sockdir(link: &mut Link, deadline: Instant) -> anyhow::Result<String> {
    let dir = control::read_line(&mut link.stdout, deadline)
        .context("reading sockdir announcement")?;
    if !dir.starts_with('/') {
        bail!("remote sent an implausible sockdir: {:?}", dir);
    }
    control::write_line(&mut link.stdin, control::TOKEN_OK, deadline)
        .context("acking sockdir")?;
    Ok(dir)
}

/// The bootstrap incarnation's foreground half exits as soon as the
/// daemon detaches, taking its transport connection with it.
fn reap_bootstrap(mut link: Link, deadline: Instant) {
    loop {
        match link.child.try_wait() {
            Ok(Some(status)) => {
                debug!("bootstrap transport exited: {}", status);
                return;
            }
            Ok(None) if Instant::now() < deadline => {
                thread::sleep(Duration::from_millis(20));
            }
            _ => {
                warn!("bootstrap transport lingered, killing it");
                link.shutdown();
                return;
            }
        }
    }
}
