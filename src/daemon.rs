//! The session daemon: the durable remote end of the relay. It owns
//! the user command, survives transport breaks, and replays whatever a
//! dead remote proxy failed to deliver once the next incarnation dials
//! in.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use nix::poll::{poll, PollFd, PollFlags};
use tempfile::TempDir;
use tracing::{debug, info, trace, warn};

use crate::buffer::{ReplayWindowError, StreamBuf};
use crate::consts::{self, STREAM_ERR, STREAM_IN, STREAM_OUT};
use crate::control;

pub fn run(
    sockdir: TempDir,
    main_listener: UnixListener,
    aux_listener: UnixListener,
    argv: Vec<String>,
    epoch: u64,
    timeout: Duration,
) -> anyhow::Result<()> {
    info!("\n\n==================== STARTING DAEMON ====================\n\n");

    let mut daemon = Daemon::new(main_listener, aux_listener, &argv, epoch, timeout)?;
    let res = daemon.serve();

    // the sockdir and both socket files go away with the session
    if let Err(err) = sockdir.close() {
        warn!("cleaning up sockdir: {:?}", err);
    }
    res
}

#[derive(Clone, Copy, Debug)]
enum Arm {
    AcceptMain,
    AcceptAux,
    MainIo,
    AuxIo,
    CmdWrite,
    CmdRead(usize),
}

struct Daemon {
    main_listener: UnixListener,
    aux_listener: UnixListener,
    /// The currently registered proxy connections: streams 0 and 1
    /// ride `main`, stream 2 and the reverse finacks ride `aux`. At
    /// most one peer each; a newer epoch evicts the old registration.
    main: Option<UnixStream>,
    aux: Option<UnixStream>,
    /// High-water mark of announced epochs. Connections announcing
    /// anything smaller are stale proxies from a superseded
    /// incarnation.
    epoch: u64,
    timeout: Duration,
    child: Child,
    child_status: Option<ExitStatus>,
    cmd_in: Option<File>,
    cmd_out: Option<File>,
    cmd_err: Option<File>,
    streams: [StreamBuf; 3],
    /// Streams still awaiting an end-of-session acknowledgement from
    /// the proxy. The daemon may not exit while this is non-empty.
    finacks: HashSet<usize>,
    /// Partial finack line riding the aux socket.
    aux_line: Vec<u8>,
}

impl Daemon {
    fn new(
        main_listener: UnixListener,
        aux_listener: UnixListener,
        argv: &[String],
        epoch: u64,
        timeout: Duration,
    ) -> anyhow::Result<Daemon> {
        let program = argv.first().ok_or_else(|| anyhow!("no user command to run"))?;
        let mut child = Command::new(program)
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning user command {:?}", program))?;
        info!("spawned user command {:?} (pid {})", argv, child.id());

        let cmd_in = control::nonblocking_file(child.stdin.take()).context("taking command stdin")?;
        let cmd_out =
            control::nonblocking_file(child.stdout.take()).context("taking command stdout")?;
        let cmd_err =
            control::nonblocking_file(child.stderr.take()).context("taking command stderr")?;

        main_listener.set_nonblocking(true).context("marking sock.1 nonblocking")?;
        aux_listener.set_nonblocking(true).context("marking sock.2 nonblocking")?;

        Ok(Daemon {
            main_listener,
            aux_listener,
            main: None,
            aux: None,
            epoch,
            timeout,
            child,
            child_status: None,
            cmd_in: Some(cmd_in),
            cmd_out: Some(cmd_out),
            cmd_err: Some(cmd_err),
            streams: [StreamBuf::new(), StreamBuf::new(), StreamBuf::new()],
            finacks: HashSet::from([STREAM_OUT, STREAM_ERR]),
            aux_line: Vec::new(),
        })
    }

    fn serve(&mut self) -> anyhow::Result<()> {
        loop {
            self.tick()?;
            if self.finished() {
                break;
            }
        }
        info!("session drained and acknowledged, daemon exiting");
        Ok(())
    }

    /// Both outbound streams delivered in full, both acknowledged, and
    /// the user command reaped.
    fn finished(&self) -> bool {
        self.streams[STREAM_OUT].complete()
            && self.streams[STREAM_ERR].complete()
            && self.finacks.is_empty()
            && self.child_status.is_some()
    }

    fn tick(&mut self) -> anyhow::Result<()> {
        let mut fds: Vec<PollFd> = Vec::with_capacity(7);
        let mut arms: Vec<Arm> = Vec::with_capacity(7);

        fds.push(PollFd::new(self.main_listener.as_fd(), PollFlags::POLLIN));
        arms.push(Arm::AcceptMain);
        fds.push(PollFd::new(self.aux_listener.as_fd(), PollFlags::POLLIN));
        arms.push(Arm::AcceptAux);

        if let Some(main) = self.main.as_ref() {
            let mut flags = PollFlags::empty();
            if !self.streams[STREAM_IN].eof() && !self.streams[STREAM_IN].saturated() {
                flags |= PollFlags::POLLIN;
            }
            if !self.streams[STREAM_OUT].pending().is_empty() {
                flags |= PollFlags::POLLOUT;
            }
            if !flags.is_empty() {
                fds.push(PollFd::new(main.as_fd(), flags));
                arms.push(Arm::MainIo);
            }
        }
        if let Some(aux) = self.aux.as_ref() {
            // always readable: finacks can arrive at any point
            let mut flags = PollFlags::POLLIN;
            if !self.streams[STREAM_ERR].pending().is_empty() {
                flags |= PollFlags::POLLOUT;
            }
            fds.push(PollFd::new(aux.as_fd(), flags));
            arms.push(Arm::AuxIo);
        }
        if let Some(cmd_in) = self.cmd_in.as_ref() {
            if !self.streams[STREAM_IN].write_window(true).is_empty() {
                fds.push(PollFd::new(cmd_in.as_fd(), PollFlags::POLLOUT));
                arms.push(Arm::CmdWrite);
            }
        }
        if let Some(cmd_out) = self.cmd_out.as_ref() {
            if !self.streams[STREAM_OUT].saturated() {
                fds.push(PollFd::new(cmd_out.as_fd(), PollFlags::POLLIN));
                arms.push(Arm::CmdRead(STREAM_OUT));
            }
        }
        if let Some(cmd_err) = self.cmd_err.as_ref() {
            if !self.streams[STREAM_ERR].saturated() {
                fds.push(PollFd::new(cmd_err.as_fd(), PollFlags::POLLIN));
                arms.push(Arm::CmdRead(STREAM_ERR));
            }
        }

        match poll(&mut fds, consts::POLL_MS) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => return Ok(()),
            Err(e) => return Err(e).context("polling daemon handles"),
        }

        let ready: Vec<(Arm, PollFlags)> = arms
            .iter()
            .zip(fds.iter())
            .filter_map(|(arm, fd)| fd.revents().filter(|r| !r.is_empty()).map(|r| (*arm, r)))
            .collect();
        drop(fds);

        for (arm, revents) in ready {
            match arm {
                Arm::AcceptMain => self.accept_main()?,
                Arm::AcceptAux => self.accept_aux()?,
                Arm::MainIo => {
                    if revents.contains(PollFlags::POLLIN) {
                        self.read_main()?;
                    } else if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                        // hangup with nothing left to read; whatever
                        // the socket still held gets replayed to the
                        // next incarnation instead
                        info!("main socket hung up, awaiting a replacement");
                        self.main = None;
                    }
                    if revents.contains(PollFlags::POLLOUT) && self.main.is_some() {
                        self.write_main()?;
                    }
                }
                Arm::AuxIo => {
                    if revents.contains(PollFlags::POLLIN) {
                        self.read_aux()?;
                    } else if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                        info!("aux socket hung up, awaiting a replacement");
                        self.aux = None;
                    }
                    if revents.contains(PollFlags::POLLOUT) && self.aux.is_some() {
                        self.write_aux()?;
                    }
                }
                Arm::CmdWrite => self.write_cmd()?,
                Arm::CmdRead(idx) => self.read_cmd(idx)?,
            }
        }

        // non-blocking reap; the command's exit is what ultimately
        // ends streams 1 and 2
        if self.child_status.is_none() {
            if let Some(status) = self.child.try_wait().context("checking command status")? {
                info!("user command exited: {}", status);
                self.child_status = Some(status);
            }
        }

        self.streams[STREAM_IN].consume_marker();
        if self.streams[STREAM_IN].complete() && self.cmd_in.is_some() {
            info!("stream 0 fully delivered, closing command stdin");
            self.cmd_in = None;
        }
        if self.cmd_in.is_none() {
            // no consumer for stream 0: keep counting, deliver nothing
            self.streams[STREAM_IN].discard_pending();
        }

        for s in self.streams.iter_mut() {
            s.reclaim()?;
        }
        Ok(())
    }

    fn accept_main(&mut self) -> anyhow::Result<()> {
        loop {
            match self.main_listener.accept() {
                Ok((stream, _)) => {
                    if let Err(err) = self.register_main(stream) {
                        if err.downcast_ref::<ReplayWindowError>().is_some() {
                            return Err(err.context("resume impossible, session unrecoverable"));
                        }
                        warn!("rejecting sock.1 connection: {:?}", err);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e).context("accepting on sock.1"),
            }
        }
    }

    fn accept_aux(&mut self) -> anyhow::Result<()> {
        loop {
            match self.aux_listener.accept() {
                Ok((stream, _)) => {
                    if let Err(err) = self.register_aux(stream) {
                        warn!("rejecting sock.2 connection: {:?}", err);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e).context("accepting on sock.2"),
            }
        }
    }

    /// The sock.1 handshake: epoch check, eviction, then the byte
    /// count exchange that tells the new proxy where to resume.
    fn register_main(&mut self, mut stream: UnixStream) -> anyhow::Result<()> {
        stream.set_nonblocking(true).context("marking connection nonblocking")?;
        let deadline = Instant::now() + self.timeout;

        let line = control::read_line(&mut stream, deadline).context("reading epoch")?;
        let epoch: u64 = line.parse().context("parsing epoch")?;
        if epoch < self.epoch {
            // a proxy from a superseded incarnation; dropped, and
            // deliberately not logged
            return Ok(());
        }
        self.epoch = epoch;
        if self.main.take().is_some() {
            debug!("evicted previous sock.1 peer in favor of epoch {}", epoch);
        }

        control::write_line(&mut stream, &self.streams[STREAM_IN].rbytes().to_string(), deadline)
            .context("reporting stream-0 byte count")?;
        let counts =
            control::read_line(&mut stream, deadline).context("reading delivered-byte counts")?;
        let (n1, n2) = control::parse_counts(&counts)?;
        self.streams[STREAM_OUT].rewind(n1)?;
        self.streams[STREAM_ERR].rewind(n2)?;

        // A count covering the whole stream, marker included, is
        // itself proof of delivery. No replay will flow for that
        // stream, so no finack can ever come from this incarnation.
        for (idx, confirmed) in [(STREAM_OUT, n1), (STREAM_ERR, n2)] {
            if self.streams[idx].eof()
                && confirmed == self.streams[idx].rbytes()
                && self.finacks.remove(&idx)
            {
                info!("stream {} delivery confirmed by handshake", idx);
            }
        }

        info!(
            "sock.1 peer registered at epoch {}: confirmed {}/{} bytes, replaying {}/{}",
            epoch,
            n1,
            n2,
            self.streams[STREAM_OUT].pending().len(),
            self.streams[STREAM_ERR].pending().len(),
        );
        self.main = Some(stream);
        Ok(())
    }

    /// The sock.2 handshake carries no resume data, only the epoch.
    fn register_aux(&mut self, mut stream: UnixStream) -> anyhow::Result<()> {
        stream.set_nonblocking(true).context("marking connection nonblocking")?;
        let deadline = Instant::now() + self.timeout;

        let line = control::read_line(&mut stream, deadline).context("reading epoch")?;
        let epoch: u64 = line.parse().context("parsing epoch")?;
        if epoch < self.epoch {
            return Ok(());
        }
        self.epoch = epoch;
        if self.aux.take().is_some() {
            debug!("evicted previous sock.2 peer in favor of epoch {}", epoch);
        }
        self.aux_line.clear();
        self.aux = Some(stream);
        Ok(())
    }

    fn read_main(&mut self) -> anyhow::Result<()> {
        let mut chunk = [0u8; consts::CHUNK_SIZE];
        let res = match self.main.as_mut() {
            Some(s) => s.read(&mut chunk),
            None => return Ok(()),
        };
        match res {
            Ok(0) => {
                info!("main socket closed, awaiting a replacement");
                self.main = None;
            }
            Ok(n) => {
                trace!("read {} bytes of stream 0", n);
                self.streams[STREAM_IN].record(&chunk[..n]);
                if self.streams[STREAM_IN].eof() {
                    debug!("stream 0 end-of-stream marker received");
                }
            }
            Err(e) if retryable(&e) => {}
            Err(e) => {
                info!("main socket read error ({}), awaiting a replacement", e);
                self.main = None;
            }
        }
        Ok(())
    }

    fn write_main(&mut self) -> anyhow::Result<()> {
        let res = {
            let Some(main) = self.main.as_mut() else {
                return Ok(());
            };
            let window = self.streams[STREAM_OUT].pending();
            let n = window.len().min(consts::CHUNK_SIZE);
            main.write(&window[..n])
        };
        match res {
            Ok(written) => {
                trace!("wrote {} bytes of stream 1", written);
                self.streams[STREAM_OUT].advance(written);
            }
            Err(e) if retryable(&e) => {}
            Err(e) => {
                info!("main socket write error ({}), awaiting a replacement", e);
                self.main = None;
            }
        }
        Ok(())
    }

    /// The aux socket's inbound direction only ever carries finack
    /// lines; anything else is post-finack chatter and gets discarded.
    fn read_aux(&mut self) -> anyhow::Result<()> {
        let mut chunk = [0u8; 64];
        let res = match self.aux.as_mut() {
            Some(s) => s.read(&mut chunk),
            None => return Ok(()),
        };
        match res {
            Ok(0) => {
                info!("aux socket closed, awaiting a replacement");
                self.aux = None;
            }
            Ok(n) => {
                for byte in &chunk[..n] {
                    if *byte == b'\n' {
                        self.take_finack();
                        self.aux_line.clear();
                    } else {
                        self.aux_line.push(*byte);
                        if self.aux_line.len() > 16 {
                            self.aux_line.clear();
                        }
                    }
                }
            }
            Err(e) if retryable(&e) => {}
            Err(e) => {
                info!("aux socket read error ({}), awaiting a replacement", e);
                self.aux = None;
            }
        }
        Ok(())
    }

    fn take_finack(&mut self) {
        let idx = std::str::from_utf8(&self.aux_line)
            .ok()
            .and_then(|s| s.parse::<usize>().ok());
        match idx {
            Some(idx) if idx == STREAM_OUT || idx == STREAM_ERR => {
                if self.finacks.remove(&idx) {
                    info!("stream {} delivery acknowledged", idx);
                }
                // repeats after a reconnect are harmless
            }
            _ => trace!("discarding aux chatter {:?}", self.aux_line),
        }
    }

    fn write_aux(&mut self) -> anyhow::Result<()> {
        let res = {
            let Some(aux) = self.aux.as_mut() else {
                return Ok(());
            };
            let window = self.streams[STREAM_ERR].pending();
            let n = window.len().min(consts::CHUNK_SIZE);
            aux.write(&window[..n])
        };
        match res {
            Ok(written) => {
                trace!("wrote {} bytes of stream 2", written);
                self.streams[STREAM_ERR].advance(written);
            }
            Err(e) if retryable(&e) => {}
            Err(e) => {
                info!("aux socket write error ({}), awaiting a replacement", e);
                self.aux = None;
            }
        }
        Ok(())
    }

    fn write_cmd(&mut self) -> anyhow::Result<()> {
        let res = {
            let Some(cmd_in) = self.cmd_in.as_mut() else {
                return Ok(());
            };
            let window = self.streams[STREAM_IN].write_window(true);
            let n = window.len().min(consts::CHUNK_SIZE);
            cmd_in.write(&window[..n])
        };
        match res {
            Ok(written) => {
                trace!("wrote {} bytes of stream 0 to the command", written);
                self.streams[STREAM_IN].advance(written);
            }
            Err(e) if retryable(&e) => {}
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                info!("command stopped reading its input");
                self.cmd_in = None;
            }
            Err(e) => return Err(e).context("writing to command stdin"),
        }
        Ok(())
    }

    fn read_cmd(&mut self, idx: usize) -> anyhow::Result<()> {
        let mut chunk = [0u8; consts::CHUNK_SIZE];
        let res = {
            let handle = if idx == STREAM_OUT { &mut self.cmd_out } else { &mut self.cmd_err };
            match handle.as_mut() {
                Some(f) => f.read(&mut chunk),
                None => return Ok(()),
            }
        };
        match res {
            Ok(0) => {
                // the originating producer is done: emit the in-band
                // marker so every relay downstream sees the EOF
                info!("command stream {} reached end-of-stream", idx);
                self.streams[idx].push_eof();
                if idx == STREAM_OUT {
                    self.cmd_out = None;
                } else {
                    self.cmd_err = None;
                }
            }
            Ok(n) => {
                trace!("read {} bytes of stream {} from the command", n, idx);
                self.streams[idx].record(&chunk[..n]);
            }
            Err(e) if retryable(&e) => {}
            Err(e) => return Err(e).context("reading command output"),
        }
        Ok(())
    }
}

fn retryable(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted
}
