// This module is used from multiple test files, each of which gets
// compiled into its own binary. Not all the binaries use all the
// stuff here.
#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use tempfile::TempDir;

pub fn shim_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_sshim"))
}

/// A transport stand-in for ssh: drop the host argument and exec the
/// remote half locally.
const RELIABLE_TRANSPORT: &str = "#!/bin/sh
# stand-in for ssh: drop the host argument, run the remote command locally
shift
exec \"$@\"
";

/// A hermetic home for one test session. The fake transport script,
/// the config file, the log files, and (via TMPDIR) the daemon's
/// sockdir all live in one temp dir that dies with the fixture.
pub struct Fixture {
    pub tmp: TempDir,
    transport: PathBuf,
}

impl Fixture {
    pub fn new() -> anyhow::Result<Fixture> {
        Fixture::with_script(String::from(RELIABLE_TRANSPORT))
    }

    /// A fixture whose transport breaks exactly once: the first
    /// forwarding invocation (recognizable by its --sockdir argument)
    /// gets SIGKILLed after `kill_after` seconds, mid-stream.
    pub fn new_flaky(kill_after: &str) -> anyhow::Result<Fixture> {
        // the script sees the argv as: host shim --remote --try=N
        // [--sockdir=...] ...; $4 only carries --sockdir on forwarding
        // spawns, never on the bootstrap
        let script = format!(
            r#"#!/bin/sh
marker="$(dirname "$0")/flaky.tripped"
shift
case "$4" in
--sockdir=*)
    if [ ! -e "$marker" ]; then
        : > "$marker"
        exec timeout -s KILL {} "$@"
    fi
    ;;
esac
exec "$@"
"#,
            kill_after,
        );
        Fixture::with_script(script)
    }

    fn with_script(script: String) -> anyhow::Result<Fixture> {
        let tmp = tempfile::Builder::new()
            .prefix("sshim-test")
            .rand_bytes(8)
            .tempdir()
            .context("creating test tmp dir")?;

        let transport = tmp.path().join("fakessh");
        fs::write(&transport, script).context("writing fake transport")?;
        let mut perms = fs::metadata(&transport)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&transport, perms).context("marking fake transport executable")?;

        let config = tmp.path().join("config.toml");
        fs::write(
            &config,
            format!(
                "remote_log_file = \"{}\"\nremote_verbose = 2\n",
                tmp.path().join("remote.log").display(),
            ),
        )
        .context("writing test config")?;

        Ok(Fixture { tmp, transport })
    }

    /// Spawn a full session running `cmd` through the fake transport.
    pub fn spawn(&self, cmd: &[&str]) -> anyhow::Result<Child> {
        self.spawn_proc(cmd)
            .with_context(|| format!("spawning sshim session for {:?}", cmd))
    }

    fn spawn_proc(&self, cmd: &[&str]) -> std::io::Result<Child> {
        Command::new(shim_bin())
            .arg("-v")
            .arg("-v")
            .arg("--log-file")
            .arg(self.tmp.path().join("local.log"))
            .arg("--config-file")
            .arg(self.tmp.path().join("config.toml"))
            .arg(&self.transport)
            .arg("testhost")
            .args(cmd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // the remote side inherits this, so the daemon's sockdir
            // lands inside the fixture where we can see it
            .env("TMPDIR", self.tmp.path())
            .spawn()
    }

    pub fn sockdir_exists(&self) -> anyhow::Result<bool> {
        for entry in fs::read_dir(self.tmp.path()).context("scanning fixture dir")? {
            let entry = entry.context("reading fixture dir entry")?;
            if entry.file_name().to_string_lossy().starts_with("sshim-") {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// The daemon exits (and removes its sockdir) a beat after the
    /// local proxy does, so cleanup assertions have to wait for it.
    pub fn await_sockdir_cleanup(&self, bound: Duration) -> anyhow::Result<()> {
        let deadline = Instant::now() + bound;
        while self.sockdir_exists()? {
            if Instant::now() >= deadline {
                bail!("sockdir was never cleaned up");
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        Ok(())
    }
}

impl std::ops::Drop for Fixture {
    fn drop(&mut self) {
        // The daemon detaches from the session, so a failing test (or
        // one that orphans it on purpose) needs a sweep. Everything
        // spawned on the remote side carries this fixture's path in
        // its argv.
        let _ = Command::new("pkill")
            .arg("-9")
            .arg("-f")
            .arg(self.tmp.path().as_os_str())
            .status();
    }
}
