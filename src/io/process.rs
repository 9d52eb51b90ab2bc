//! Child process execution with timeouts and bounded output capture.
//!
//! Both the agent adapter and the test runner spawn external programs. Output
//! is drained on dedicated threads while the child runs so a chatty process
//! can never deadlock on a full pipe, and each stream is capped in memory.

use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use wait_timeout::ChildExt;

/// Exit code recorded when a command is killed on timeout, mirroring the
/// shell convention.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Captured output of one child process run.
#[derive(Debug)]
pub struct CapturedRun {
    /// Exit code; [`TIMEOUT_EXIT_CODE`] on timeout, -1 when killed by signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Bytes discarded beyond the per-stream cap.
    pub stdout_dropped: usize,
    pub stderr_dropped: usize,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl CapturedRun {
    /// Stdout/stderr joined for log files, with truncation markers.
    pub fn transcript(&self, label: &str) -> String {
        let mut buf = String::new();
        buf.push_str("=== stdout ===\n");
        buf.push_str(&self.stdout);
        if self.stdout_dropped > 0 {
            buf.push_str(&format!("\n[{label} stdout truncated {} bytes]\n", self.stdout_dropped));
        }
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&self.stderr);
        if self.stderr_dropped > 0 {
            buf.push_str(&format!("\n[{label} stderr truncated {} bytes]\n", self.stderr_dropped));
        }
        if self.timed_out {
            buf.push_str(&format!("\n[{label} timed out]\n"));
        }
        buf
    }
}

/// Run `cmd` to completion with a deadline and per-stream output cap.
///
/// The child is killed (then reaped) when the timeout elapses; the captured
/// output collected up to that point is still returned.
pub fn run_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CapturedRun> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let started = Instant::now();
    let mut child = cmd.spawn().context("spawn command")?;

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin.write_all(input).context("write stdin")?;
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_reader = thread::spawn(move || drain_limited(stdout, output_limit_bytes));
    let stderr_reader = thread::spawn(move || drain_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            timed_out = true;
            child.kill().context("kill timed-out command")?;
            child.wait().context("reap command after kill")?
        }
    };

    let (stdout, stdout_dropped) = join_reader(stdout_reader).context("join stdout reader")?;
    let (stderr, stderr_dropped) = join_reader(stderr_reader).context("join stderr reader")?;

    let exit_code = if timed_out {
        TIMEOUT_EXIT_CODE
    } else {
        status.code().unwrap_or(-1)
    };

    Ok(CapturedRun {
        exit_code,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        stdout_dropped,
        stderr_dropped,
        timed_out,
        elapsed: started.elapsed(),
    })
}

fn join_reader(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Read a stream to the end, keeping at most `limit` bytes and counting the
/// rest so the pipe is always drained.
fn drain_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut dropped = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            dropped += n - keep;
        } else {
            dropped += n;
        }
    }

    Ok((buf, dropped))
}
