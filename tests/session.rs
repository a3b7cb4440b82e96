use std::io::{Read, Write};
use std::time::Duration;

use anyhow::Context;
use ntest::timeout;

mod support;

#[test]
#[timeout(30000)]
fn happy_path() -> anyhow::Result<()> {
    let fixture = support::Fixture::new()?;
    let mut proc = fixture.spawn(&["cat"])?;

    let mut stdin = proc.stdin.take().context("missing stdin")?;
    stdin.write_all(b"hello\n").context("writing input")?;
    drop(stdin);

    let out = proc.wait_with_output().context("waiting for session")?;
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(out.stdout, b"hello\n");
    assert_empty(&out.stderr);
    Ok(())
}

#[test]
#[timeout(30000)]
fn interactive_round_trips() -> anyhow::Result<()> {
    let fixture = support::Fixture::new()?;
    let mut proc = fixture.spawn(&["cat"])?;

    let mut stdin = proc.stdin.take().context("missing stdin")?;
    let mut stdout = proc.stdout.take().context("missing stdout")?;

    // each line must come back while the session is still live
    stdin.write_all(b"one\n").context("writing first line")?;
    let mut buf = [0u8; 4];
    stdout.read_exact(&mut buf).context("reading first echo")?;
    assert_eq!(&buf, b"one\n");

    stdin.write_all(b"two\n").context("writing second line")?;
    stdout.read_exact(&mut buf).context("reading second echo")?;
    assert_eq!(&buf, b"two\n");

    drop(stdin);
    let mut rest = Vec::new();
    stdout.read_to_end(&mut rest).context("draining stdout")?;
    assert!(rest.is_empty(), "unexpected trailing output: {:?}", rest);

    let status = proc.wait().context("waiting for session")?;
    assert!(status.success());
    Ok(())
}

// `echo` exits on its own: streams 1 and 2 must close out and the
// session must end even though the application never closes its input.
#[test]
#[timeout(30000)]
fn command_eof_ends_session_with_input_open() -> anyhow::Result<()> {
    let fixture = support::Fixture::new()?;
    let mut proc = fixture.spawn(&["echo", "abc"])?;

    let stdin = proc.stdin.take().context("missing stdin")?;
    let out = proc.wait_with_output().context("waiting for session")?;
    drop(stdin);

    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(out.stdout, b"abc\n");
    assert_eq!(out.stderr, b"");
    Ok(())
}

#[test]
#[timeout(30000)]
fn stderr_is_forwarded_separately() -> anyhow::Result<()> {
    let fixture = support::Fixture::new()?;
    let mut proc = fixture.spawn(&["sh", "-c", "echo out; echo err >&2"])?;

    drop(proc.stdin.take());
    let out = proc.wait_with_output().context("waiting for session")?;

    assert!(out.status.success());
    assert_eq!(out.stdout, b"out\n");
    assert_eq!(out.stderr, b"err\n");
    Ok(())
}

// The command's exit status is not carried back; a clean session ends
// with 0 no matter what the remote command returned.
#[test]
#[timeout(30000)]
fn remote_exit_status_is_not_preserved() -> anyhow::Result<()> {
    let fixture = support::Fixture::new()?;
    let mut proc = fixture.spawn(&["sh", "-c", "exit 3"])?;

    drop(proc.stdin.take());
    let out = proc.wait_with_output().context("waiting for session")?;

    assert!(out.status.success());
    Ok(())
}

#[test]
#[timeout(60000)]
fn binary_payload_round_trips() -> anyhow::Result<()> {
    use rand::RngCore;

    let fixture = support::Fixture::new()?;
    let mut proc = fixture.spawn(&["cat"])?;

    let mut payload = vec![0u8; 64 * 1024];
    rand::thread_rng().fill_bytes(&mut payload);

    let mut stdin = proc.stdin.take().context("missing stdin")?;
    stdin.write_all(&payload).context("writing payload")?;
    drop(stdin);

    let out = proc.wait_with_output().context("waiting for session")?;
    assert!(out.status.success());
    assert_eq!(out.stdout, payload);
    Ok(())
}

// When the application-side consumer of stream 1 hangs up, the session
// winds down cleanly instead of erroring or spinning.
#[test]
#[timeout(30000)]
fn broken_output_pipe_winds_the_session_down() -> anyhow::Result<()> {
    let fixture = support::Fixture::new()?;
    let mut proc = fixture.spawn(&["yes"])?;

    let _stdin = proc.stdin.take();
    let mut stdout = proc.stdout.take().context("missing stdout")?;

    // prove output is flowing, then hang up on it
    let mut buf = [0u8; 4096];
    stdout.read_exact(&mut buf).context("reading some output")?;
    drop(stdout);

    let status = proc.wait().context("waiting for session")?;
    assert!(status.success());
    Ok(())
}

#[test]
#[timeout(30000)]
fn sockdir_removed_at_session_end() -> anyhow::Result<()> {
    let fixture = support::Fixture::new()?;
    let mut proc = fixture.spawn(&["echo", "done"])?;

    drop(proc.stdin.take());
    let out = proc.wait_with_output().context("waiting for session")?;
    assert!(out.status.success());
    assert_eq!(out.stdout, b"done\n");

    fixture.await_sockdir_cleanup(Duration::from_secs(10))
}

fn assert_empty(buf: &[u8]) {
    assert!(buf.is_empty(), "expected no bytes, got {:?}", String::from_utf8_lossy(buf));
}
