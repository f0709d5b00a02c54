//! Child processes with a wall-clock timeout and bounded output capture.
//!
//! Used for generator commands and for sandbox children. Stdin is fed from
//! its own thread while stdout and stderr are drained concurrently, so a
//! child that never reads its input or floods its output cannot wedge the
//! parent.

use std::borrow::Cow;
use std::io::{ErrorKind, Read, Write};
use std::process::{ChildStdin, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

const CHUNK_BYTES: usize = 8192;

/// One captured stream. Bytes past the limit are drained and counted, not
/// kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub truncated: usize,
}

impl Captured {
    pub fn lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    /// `"\n[<label> truncated N bytes]\n"`, or nothing if complete.
    pub fn notice(&self, label: &str) -> String {
        if self.truncated > 0 {
            format!("\n[{label} truncated {} bytes]\n", self.truncated)
        } else {
            String::new()
        }
    }
}

/// Result of a finished (or killed) child.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Captured,
    pub stderr: Captured,
    /// The child was killed after `timeout`; `status` is the post-kill status.
    pub timed_out: bool,
}

/// Run `cmd` to completion or until `timeout`, feeding `stdin` if given.
///
/// Spawn and wait failures are errors. A non-zero exit, a timeout or a child
/// that closed stdin early are reported in the returned [`CommandOutput`].
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            error!(%err, "failed to spawn command");
            return Err(err).context("spawn command");
        }
    };

    let writer = match stdin {
        Some(input) => {
            let pipe = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            Some(feed_stdin(pipe, input.to_vec()))
        }
        None => None,
    };
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout = thread::spawn(move || capture(stdout, output_limit_bytes));
    let stderr = thread::spawn(move || capture(stderr, output_limit_bytes));

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => (status, false),
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            child.kill().context("kill command")?;
            (child.wait().context("wait command after kill")?, true)
        }
    };

    if let Some(writer) = writer {
        join(writer, "stdin writer")?.context("write stdin")?;
    }
    let stdout = join(stdout, "stdout reader")?.context("read stdout")?;
    let stderr = join(stderr, "stderr reader")?.context("read stderr")?;
    if stdout.truncated > 0 || stderr.truncated > 0 {
        warn!(
            stdout_truncated = stdout.truncated,
            stderr_truncated = stderr.truncated,
            "output truncated"
        );
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

/// Write `input` and close the pipe. A child that exits without reading
/// shows up as a broken pipe, which is not an error here.
fn feed_stdin(mut pipe: ChildStdin, input: Vec<u8>) -> JoinHandle<Result<()>> {
    thread::spawn(move || match pipe.write_all(&input) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::BrokenPipe => {
            debug!("child closed stdin early");
            Ok(())
        }
        Err(err) => Err(err.into()),
    })
}

fn join<T>(handle: JoinHandle<Result<T>>, what: &str) -> Result<Result<T>> {
    handle
        .join()
        .map_err(|_| anyhow!("{what} thread panicked"))
}

fn capture<R: Read>(mut reader: R, limit: usize) -> Result<Captured> {
    let mut captured = Captured::default();
    let mut chunk = [0u8; CHUNK_BYTES];
    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        let keep = n.min(limit.saturating_sub(captured.bytes.len()));
        captured.bytes.extend_from_slice(&chunk[..keep]);
        captured.truncated += n - keep;
    }
    Ok(captured)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn stdin_is_echoed_back() {
        let output =
            run_command_with_timeout(sh("cat"), Some(b"hello"), Duration::from_secs(5), 1024)
                .expect("run");
        assert!(output.status.success());
        assert_eq!(output.stdout.lossy(), "hello");
        assert!(!output.timed_out);
    }

    #[test]
    fn output_beyond_limit_is_counted() {
        let output = run_command_with_timeout(
            sh("printf 0123456789; printf oops >&2"),
            None,
            Duration::from_secs(5),
            4,
        )
        .expect("run");
        assert_eq!(output.stdout.bytes, b"0123");
        assert_eq!(output.stdout.truncated, 6);
        assert_eq!(
            output.stdout.notice("child stdout"),
            "\n[child stdout truncated 6 bytes]\n"
        );
        assert_eq!(output.stderr.lossy(), "oops");
        assert!(output.stderr.notice("child stderr").is_empty());
    }

    #[test]
    fn child_ignoring_stdin_is_not_an_error() {
        let input = vec![b'x'; 1 << 20];
        let output =
            run_command_with_timeout(sh("exit 3"), Some(&input), Duration::from_secs(5), 1024)
                .expect("run");
        assert_eq!(output.status.code(), Some(3));
    }

    #[test]
    fn slow_child_is_killed() {
        let output =
            run_command_with_timeout(sh("exec sleep 5"), None, Duration::from_millis(100), 1024)
                .expect("run");
        assert!(output.timed_out);
        assert!(!output.status.success());
    }

    #[test]
    fn missing_program_fails_to_spawn() {
        let err = run_command_with_timeout(
            Command::new("definitely-not-a-real-binary"),
            None,
            Duration::from_secs(1),
            16,
        )
        .expect_err("spawn");
        assert!(format!("{err:#}").contains("spawn command"));
    }
}
