//! JSON-over-stdio child processes with a timeout and bounded output.
//!
//! Used by command-backed tools and providers: the request is written to the
//! child's stdin as JSON, and the child's stdout must be a single JSON value.

use std::io::{Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

use crate::error::CoreError;

/// Bounds applied to one child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessLimits {
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

#[derive(Debug)]
struct Captured {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    truncated: usize,
    timed_out: bool,
}

/// Run `argv` with `input` on stdin and parse stdout as JSON.
///
/// Timeouts, non-zero exits, truncated output and unparseable stdout are all
/// `ExternalFailure`s, so callers may retry them.
#[instrument(skip_all, fields(program = argv.first().map(String::as_str).unwrap_or("")))]
pub fn run_json_command(argv: &[String], input: &Value, limits: ProcessLimits) -> Result<Value> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("command must not be empty"))?;
    let mut cmd = Command::new(program);
    cmd.args(args);

    let stdin = serde_json::to_vec(input).context("serialize command input")?;
    let captured = run_captured(cmd, &stdin, limits)?;

    if captured.timed_out {
        return Err(CoreError::ExternalFailure(format!(
            "{program} timed out after {}ms",
            limits.timeout.as_millis()
        ))
        .into());
    }
    if !captured.status.success() {
        let stderr = String::from_utf8_lossy(&captured.stderr);
        return Err(CoreError::ExternalFailure(format!(
            "{program} exited with {:?}: {}",
            captured.status.code(),
            stderr.trim()
        ))
        .into());
    }
    if captured.truncated > 0 {
        return Err(CoreError::ExternalFailure(format!(
            "{program} output exceeded {} bytes",
            limits.output_limit_bytes
        ))
        .into());
    }

    serde_json::from_slice(&captured.stdout).map_err(|err| {
        CoreError::ExternalFailure(format!("{program} wrote invalid JSON: {err}")).into()
    })
}

fn run_captured(mut cmd: Command, stdin: &[u8], limits: ProcessLimits) -> Result<Captured> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = cmd.spawn().context("spawn command")?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let limit = limits.output_limit_bytes;
    let stdout_reader = thread::spawn(move || read_limited(stdout, limit));
    let stderr_reader = thread::spawn(move || read_limited(stderr, limit));

    // Readers are already draining, so a chatty child cannot block this write.
    {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        if let Err(err) = child_stdin.write_all(stdin) {
            warn!(err = %err, "child closed stdin early");
        }
    }

    let mut timed_out = false;
    let status = match child
        .wait_timeout(limits.timeout)
        .context("wait for command")?
    {
        Some(status) => status,
        None => {
            warn!(timeout_secs = limits.timeout.as_secs(), "command timed out, killing");
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_reader(stdout_reader).context("join stdout")?;
    let (stderr, stderr_truncated) = join_reader(stderr_reader).context("join stderr")?;
    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(Captured {
        status,
        stdout,
        stderr,
        truncated: stdout_truncated,
        timed_out,
    })
}

fn join_reader(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    handle
        .join()
        .map_err(|_| anyhow!("output reader thread panicked"))?
}

/// Read to EOF, keeping at most `limit` bytes and counting the rest.
fn read_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut kept = Vec::new();
    let mut dropped = 0usize;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            return Ok((kept, dropped));
        }
        let room = limit.saturating_sub(kept.len()).min(n);
        kept.extend_from_slice(&chunk[..room]);
        dropped += n - room;
    }
}
