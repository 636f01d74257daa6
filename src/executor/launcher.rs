// =============================================================================
// Process Launcher - one child process per script invocation
// =============================================================================
//
// Protocol: the request document is written to the child's stdin, stdin is
// closed, stdout and stderr are drained concurrently until the child exits,
// and stdout is parsed as exactly one JSON document.
//
// Lifetime guarantees:
//   - Every child runs in its own process group (Unix), so scripts that fork
//     helpers are torn down as a unit.
//   - On timeout the group is SIGKILLed and the child reaped before the
//     failure is returned.
//   - A drop guard sweeps the group on every exit path, including a caller
//     dropping the future mid-flight.
// =============================================================================

use std::future::Future;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::Semaphore;
use tracing::{debug, instrument, trace, warn};

use crate::types::IndicatorRequest;

// =============================================================================
// Errors
// =============================================================================

/// Process-level outcome of a failed invocation.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// Interpreter or script binary could not be started.
    #[error("failed to spawn process: {0}")]
    Spawn(#[source] std::io::Error),

    /// The process ended unsuccessfully (non-zero code or signal).
    #[error("process ended with {status}")]
    NonZeroExit {
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },

    /// The process exited cleanly but stdout was not one JSON document.
    #[error("stdout is not valid JSON: {source}")]
    InvalidJson {
        #[source]
        source: serde_json::Error,
        stdout: String,
        stderr: String,
    },

    /// Wall-clock budget exceeded; the process group has been killed.
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Pipe or wait failure while the process was running.
    #[error("I/O error while running process: {0}")]
    Io(#[source] std::io::Error),
}

// =============================================================================
// ScriptRunner seam
// =============================================================================

/// Runs one script with one request document inside a time budget.
///
/// [`ProcessLauncher`] is the production implementation; the gateway and
/// registry are generic over this trait so tests can count or fake spawns.
pub trait ScriptRunner: Send + Sync + 'static {
    fn run(
        &self,
        script: &Path,
        request: &IndicatorRequest,
        timeout: Duration,
    ) -> impl Future<Output = Result<Value, LaunchError>> + Send;
}

// =============================================================================
// ProcessLauncher
// =============================================================================

/// Serialisable counters for the health endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LauncherStats {
    pub spawned_total: u64,
    pub timed_out_total: u64,
    pub in_flight: usize,
    pub max_concurrency: Option<usize>,
}

/// Spawns indicator scripts as isolated child processes.
pub struct ProcessLauncher {
    /// Program used to run a script (`python3 <script>`). `None` executes the
    /// script file directly.
    interpreter: Option<String>,
    /// Admission bound shared by all concurrent invocations.
    admission: Option<Arc<Semaphore>>,
    max_concurrency: Option<usize>,
    spawned_total: AtomicU64,
    timed_out_total: AtomicU64,
    in_flight: AtomicUsize,
}

impl ProcessLauncher {
    /// `max_concurrency == 0` leaves the launcher unbounded.
    pub fn new(interpreter: Option<String>, max_concurrency: usize) -> Self {
        let interpreter = interpreter.filter(|s| !s.trim().is_empty());
        let (admission, max_concurrency) = if max_concurrency == 0 {
            (None, None)
        } else {
            (
                Some(Arc::new(Semaphore::new(max_concurrency))),
                Some(max_concurrency),
            )
        };

        debug!(
            interpreter = ?interpreter,
            max_concurrency = ?max_concurrency,
            "ProcessLauncher initialised"
        );

        Self {
            interpreter,
            admission,
            max_concurrency,
            spawned_total: AtomicU64::new(0),
            timed_out_total: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn stats(&self) -> LauncherStats {
        LauncherStats {
            spawned_total: self.spawned_total.load(Ordering::Relaxed),
            timed_out_total: self.timed_out_total.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            max_concurrency: self.max_concurrency,
        }
    }

    fn command(&self, script: &Path) -> Command {
        let mut cmd = match &self.interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(script);
                cmd
            }
            None => Command::new(script),
        };
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

impl ScriptRunner for ProcessLauncher {
    #[instrument(
        skip(self, request, timeout),
        name = "launcher::run",
        fields(script = %script.display(), mode = %request.mode)
    )]
    async fn run(
        &self,
        script: &Path,
        request: &IndicatorRequest,
        timeout: Duration,
    ) -> Result<Value, LaunchError> {
        let _permit = match &self.admission {
            Some(sem) => Some(sem.clone().acquire_owned().await.map_err(|_| {
                LaunchError::Io(std::io::Error::other("admission semaphore closed"))
            })?),
            None => None,
        };

        let payload = serde_json::to_vec(request).map_err(|e| LaunchError::Io(e.into()))?;

        let mut child = self.command(script).spawn().map_err(LaunchError::Spawn)?;
        self.spawned_total.fetch_add(1, Ordering::Relaxed);
        let _in_flight = InFlight::enter(&self.in_flight);
        let mut group = GroupGuard(child.id());
        let started = Instant::now();

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let outcome = tokio::time::timeout(timeout, async {
            let (fed, out, err) = tokio::join!(
                feed_stdin(stdin, &payload),
                drain(stdout),
                drain(stderr)
            );
            if let Err(e) = fed {
                // A script may exit before consuming its input.
                debug!(error = %e, "stdin not fully consumed by script");
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, out?, err?))
        })
        .await;

        let (status, stdout, stderr) = match outcome {
            Err(_) => {
                group.kill();
                let _ = child.kill().await;
                self.timed_out_total.fetch_add(1, Ordering::Relaxed);
                warn!(timeout_ms = timeout.as_millis() as u64, "script timed out, process group killed");
                return Err(LaunchError::Timeout(timeout));
            }
            Ok(Err(e)) => {
                group.kill();
                let _ = child.kill().await;
                return Err(LaunchError::Io(e));
            }
            Ok(Ok(done)) => done,
        };

        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        let stderr = String::from_utf8_lossy(&stderr).into_owned();
        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            status = %status,
            stdout_bytes = stdout.len(),
            stderr_bytes = stderr.len(),
            "script exited"
        );

        if !status.success() {
            return Err(LaunchError::NonZeroExit {
                status,
                stdout,
                stderr,
            });
        }

        serde_json::from_str::<Value>(stdout.trim()).map_err(|source| LaunchError::InvalidJson {
            source,
            stdout,
            stderr,
        })
    }
}

// =============================================================================
// Stream helpers
// =============================================================================

async fn feed_stdin(stdin: Option<ChildStdin>, payload: &[u8]) -> std::io::Result<()> {
    let Some(mut stdin) = stdin else {
        return Ok(());
    };
    stdin.write_all(payload).await?;
    stdin.shutdown().await?;
    // Dropping the handle closes the pipe and signals EOF.
    Ok(())
}

async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

// =============================================================================
// Guards
// =============================================================================

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Kills the child's process group when dropped (or explicitly).
struct GroupGuard(Option<u32>);

impl GroupGuard {
    fn kill(&mut self) {
        if let Some(pgid) = self.0.take() {
            kill_process_group(pgid);
        }
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    // SAFETY: kill(2) takes plain integers; a negative pid addresses the group.
    let rc = unsafe { libc::kill(-(pgid as libc::pid_t), libc::SIGKILL) };
    if rc == 0 {
        trace!(pgid, "process group signalled");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Candle;
    use serde_json::Map;
    use std::path::PathBuf;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        path
    }

    fn sh() -> ProcessLauncher {
        ProcessLauncher::new(Some("sh".to_string()), 0)
    }

    fn request() -> IndicatorRequest {
        IndicatorRequest::execute(
            "echo",
            vec![Candle { time: 60, open: 1.0, high: 1.0, low: 1.0, close: 1.0, volume: 1.0 }],
            Map::new(),
        )
    }

    #[tokio::test]
    async fn request_reaches_stdin_and_stdout_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "echo.sh", "cat");
        let launcher = sh();

        let out = launcher
            .run(&script, &request(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out["name"], "echo");
        assert_eq!(out["candleData"][0]["time"], 60);
        assert_eq!(launcher.stats().spawned_total, 1);
        assert_eq!(launcher.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn non_zero_exit_keeps_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "crash.sh", "echo 'boom: bad input' >&2\nexit 3");

        let err = sh()
            .run(&script, &request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            LaunchError::NonZeroExit { status, stderr, .. } => {
                assert_eq!(status.code(), Some(3));
                assert!(stderr.contains("boom: bad input"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_and_empty_stdout_are_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let garbage = write_script(dir.path(), "garbage.sh", "echo 'not json at all'");
        let silent = write_script(dir.path(), "silent.sh", "exit 0");
        let launcher = sh();

        for script in [garbage, silent] {
            let err = launcher
                .run(&script, &request(), Duration::from_secs(5))
                .await
                .unwrap_err();
            assert!(matches!(err, LaunchError::InvalidJson { .. }), "{err:?}");
        }
    }

    #[tokio::test]
    async fn missing_interpreter_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "ok.sh", "cat");
        let launcher = ProcessLauncher::new(Some("no-such-interpreter-4f1c".to_string()), 0);

        let err = launcher
            .run(&script, &request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::Spawn(_)), "{err:?}");
        assert_eq!(launcher.stats().spawned_total, 0);
    }

    #[tokio::test]
    async fn script_ignoring_large_input_still_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "lazy.sh",
            r#"echo '{"success":true,"values":[]}'"#,
        );
        let candles = (0..20_000)
            .map(|i| Candle { time: i * 60, open: 1.0, high: 1.0, low: 1.0, close: 1.0, volume: 1.0 })
            .collect();
        let req = IndicatorRequest::execute("lazy", candles, Map::new());

        let out = sh().run(&script, &req, Duration::from_secs(5)).await.unwrap();
        assert_eq!(out["success"], true);
    }

    #[cfg(target_os = "linux")]
    fn process_gone(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Err(_) => true,
            // Field 3 is the state; a zombie has already been killed.
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .and_then(|rest| rest.split_whitespace().next())
                .map(|state| state == "Z" || state == "X")
                .unwrap_or(true),
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timeout_kills_the_whole_process_tree() {
        let dir = tempfile::tempdir().unwrap();
        let shell_pid = dir.path().join("shell.pid");
        let child_pid = dir.path().join("child.pid");
        let script = write_script(
            dir.path(),
            "hang.sh",
            &format!(
                "echo $$ > {}\nsleep 30 &\necho $! > {}\nwait",
                shell_pid.display(),
                child_pid.display()
            ),
        );
        let launcher = sh();

        let started = Instant::now();
        let err = launcher
            .run(&script, &request(), Duration::from_millis(800))
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::Timeout(_)), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(launcher.stats().timed_out_total, 1);

        let read_pid = |p: &Path| -> u32 { std::fs::read_to_string(p).unwrap().trim().parse().unwrap() };
        let pids = [read_pid(&shell_pid), read_pid(&child_pid)];

        let deadline = Instant::now() + Duration::from_secs(3);
        while !pids.iter().all(|&p| process_gone(p)) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        for pid in pids {
            assert!(process_gone(pid), "pid {pid} survived the timeout");
        }
    }

    #[tokio::test]
    async fn admission_bound_serialises_beyond_the_limit() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "slow.sh",
            "sleep 0.4\necho '{\"success\":true,\"values\":[]}'",
        );
        let launcher = ProcessLauncher::new(Some("sh".to_string()), 1);
        let req = request();

        let started = Instant::now();
        let (a, b) = tokio::join!(
            launcher.run(&script, &req, Duration::from_secs(5)),
            launcher.run(&script, &req, Duration::from_secs(5)),
        );
        assert!(a.is_ok() && b.is_ok());
        assert!(started.elapsed() >= Duration::from_millis(800));
        assert_eq!(launcher.stats().max_concurrency, Some(1));
    }
}
