use std::io::Write;
use std::time::Duration;

use anyhow::Context;
use ntest::timeout;
use rand::RngCore;

mod support;

// The transport dies once between two bursts of input; the second
// burst must arrive through a fresh incarnation with nothing lost and
// nothing duplicated.
#[test]
#[timeout(120000)]
fn resumes_after_transport_break() -> anyhow::Result<()> {
    let fixture = support::Fixture::new_flaky("0.5")?;
    let mut proc = fixture.spawn(&["cat"])?;
    let mut stdin = proc.stdin.take().context("missing stdin")?;

    let mut payload = vec![0u8; 256 * 1024];
    rand::thread_rng().fill_bytes(&mut payload);

    stdin.write_all(&payload[..128 * 1024]).context("writing first half")?;
    // outlive the doomed first forwarding epoch
    std::thread::sleep(Duration::from_millis(1200));
    stdin.write_all(&payload[128 * 1024..]).context("writing second half")?;
    drop(stdin);

    let out = proc.wait_with_output().context("waiting for session")?;
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(out.stdout.len(), payload.len());
    assert_eq!(out.stdout, payload, "payload corrupted across the reconnect");
    assert_eq!(out.stderr, b"");
    Ok(())
}

// Same, but with the break landing in the middle of a continuous
// stream of writes rather than between two bursts.
#[test]
#[timeout(120000)]
fn resumes_mid_write() -> anyhow::Result<()> {
    let fixture = support::Fixture::new_flaky("0.3")?;
    let mut proc = fixture.spawn(&["cat"])?;
    let mut stdin = proc.stdin.take().context("missing stdin")?;

    let mut payload = vec![0u8; 2 * 1024 * 1024];
    rand::thread_rng().fill_bytes(&mut payload);

    for chunk in payload.chunks(64 * 1024) {
        stdin.write_all(chunk).context("writing chunk")?;
        std::thread::sleep(Duration::from_millis(25));
    }
    drop(stdin);

    let out = proc.wait_with_output().context("waiting for session")?;
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(out.stdout.len(), payload.len());
    assert_eq!(out.stdout, payload, "payload corrupted across the reconnect");
    Ok(())
}
