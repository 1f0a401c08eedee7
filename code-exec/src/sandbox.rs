use nix::errno::Errno;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader},
    process::{Child, Command},
    task::JoinHandle,
    time::{self, Duration, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    config::SandboxConfig,
    error::Error,
    output::OutputBuffer,
    types::{ExecutionResult, ResourceLimits},
    Result,
};

/// Longest chunk taken from a stream before it is split.
const MAX_CHUNK: u64 = 64 * 1024;

const SANDBOX_PATH: &str = "/usr/bin:/bin:/usr/sbin:/sbin";

/// Runs a compiled artifact as a time-bounded child process.
#[derive(Debug, Clone)]
pub struct SandboxExecutor {
    limits: ResourceLimits,
    timeout: Duration,
    drain_grace: Duration,
}

impl SandboxExecutor {
    pub fn new(limits: ResourceLimits, timeout: Duration) -> Self {
        Self {
            limits,
            timeout,
            drain_grace: Duration::from_millis(200),
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::new(config.limits.clone(), config.timeout()).with_drain_grace(config.drain_grace())
    }

    pub fn with_drain_grace(mut self, drain_grace: Duration) -> Self {
        self.drain_grace = drain_grace;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `program` inside `workdir`, streaming its stdout and stderr into
    /// `output` as lines arrive.
    ///
    /// The process gets its own process group so that descendants can be
    /// killed along with it. A deadline expiry yields
    /// [`ExecutionResult::TimedOut`] even if the kill itself fails.
    pub async fn execute(
        &self,
        program: &Path,
        args: &[String],
        workdir: &Path,
        output: &OutputBuffer,
    ) -> Result<ExecutionResult> {
        debug!("Sandbox execute - Program: {}", program.display());
        debug!("Sandbox execute - Args: {:?}", args);
        debug!("Sandbox execute - Workdir: {}", workdir.display());

        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", workdir)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        let file_size = self.limits.file_size;
        let cpu_time = u64::from(self.limits.cpu_time);

        // SAFETY: only async-signal-safe setrlimit calls run between fork and
        // exec.
        unsafe {
            command.pre_exec(move || {
                if file_size > 0 {
                    setrlimit(Resource::RLIMIT_FSIZE, file_size, file_size)
                        .map_err(std::io::Error::from)?;
                }
                if cpu_time > 0 {
                    setrlimit(Resource::RLIMIT_CPU, cpu_time, cpu_time)
                        .map_err(std::io::Error::from)?;
                }
                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::Sandbox(format!("Failed to spawn process: {}", e)))?;
        let group = child.id().map(|id| Pid::from_raw(id as i32));
        info!("Spawned sandboxed process {:?}", child.id());

        let readers = [
            child.stdout.take().map(|s| pump(s, output.clone())),
            child.stderr.take().map(|s| pump(s, output.clone())),
        ];

        let result = match time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => {
                let exit_code = exit_code(&status);
                info!("Sandboxed process exited with code {}", exit_code);
                ExecutionResult::Completed { exit_code }
            }
            Ok(Err(e)) => {
                terminate(&mut child, group).await;
                return Err(Error::Sandbox(format!("Failed to wait for process: {}", e)));
            }
            Err(_) => {
                warn!(
                    "Sandboxed process exceeded {}ms, killing",
                    self.timeout.as_millis()
                );
                terminate(&mut child, group).await;
                ExecutionResult::TimedOut
            }
        };

        // Descendants may still hold the pipes open.
        if let Some(group) = group {
            kill_group(group);
        }
        self.drain(readers).await;

        Ok(result)
    }

    async fn drain(&self, readers: [Option<JoinHandle<()>>; 2]) {
        let deadline = Instant::now() + self.drain_grace;
        for reader in readers.into_iter().flatten() {
            let abort = reader.abort_handle();
            if time::timeout_at(deadline, reader).await.is_err() {
                debug!("Output reader still open after grace period, aborting");
                abort.abort();
            }
        }
    }
}

fn pump<R>(stream: R, output: OutputBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut chunk = Vec::new();
        loop {
            chunk.clear();
            match (&mut reader).take(MAX_CHUNK).read_until(b'\n', &mut chunk).await {
                Ok(0) => break,
                Ok(_) => {
                    if chunk.last() == Some(&b'\n') {
                        chunk.pop();
                    }
                    if chunk.last() == Some(&b'\r') {
                        chunk.pop();
                    }
                    output.append(&String::from_utf8_lossy(&chunk));
                }
                Err(e) => {
                    debug!("Stopped reading process output: {}", e);
                    break;
                }
            }
        }
    })
}

async fn terminate(child: &mut Child, group: Option<Pid>) {
    if let Some(group) = group {
        kill_group(group);
    }
    if let Err(e) = child.kill().await {
        warn!("Failed to kill sandboxed process: {}", e);
    }
}

fn kill_group(group: Pid) {
    match killpg(group, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to kill process group {}: {}", group, e),
    }
}

/// Exit code, or `128 + signal` for a process ended by a signal.
fn exit_code(status: &ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(timeout_ms: u64) -> SandboxExecutor {
        SandboxExecutor::new(ResourceLimits::default(), Duration::from_millis(timeout_ms))
    }

    fn shell(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_exit_code_from_signal() {
        assert_eq!(exit_code(&ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code(&ExitStatus::from_raw(2 << 8)), 2);
        assert_eq!(exit_code(&ExitStatus::from_raw(9)), 137);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputBuffer::new();
        let result = executor(1000)
            .execute(Path::new("/nonexistent/program"), &[], dir.path(), &output)
            .await;
        assert!(matches!(result, Err(Error::Sandbox(_))));
    }

    #[tokio::test]
    async fn test_environment_is_confined_to_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputBuffer::new();
        let result = executor(3000)
            .execute(
                Path::new("/bin/sh"),
                &shell("echo \"$HOME\"; pwd; echo \"[$CARGO]\""),
                dir.path(),
                &output,
            )
            .await
            .unwrap();

        assert_eq!(result, ExecutionResult::Completed { exit_code: 0 });
        let workdir = dir.path().canonicalize().unwrap();
        let chunks = output.chunks();
        assert_eq!(chunks[0], format!("{}\n", dir.path().display()));
        assert_eq!(chunks[1], format!("{}\n", workdir.display()));
        assert_eq!(chunks[2], "[]\n");
    }

    #[tokio::test]
    async fn test_carriage_returns_are_stripped() {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputBuffer::new();
        executor(3000)
            .execute(
                Path::new("/bin/sh"),
                &shell("printf 'a\\r\\nb'"),
                dir.path(),
                &output,
            )
            .await
            .unwrap();
        assert_eq!(output.chunks(), vec!["a\n".to_string(), "b\n".to_string()]);
    }

    #[tokio::test]
    async fn test_background_children_do_not_hold_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputBuffer::new();
        let started = std::time::Instant::now();
        let result = executor(3000)
            .execute(
                Path::new("/bin/sh"),
                &shell("sleep 10 & echo done"),
                dir.path(),
                &output,
            )
            .await
            .unwrap();

        assert_eq!(result, ExecutionResult::Completed { exit_code: 0 });
        assert!(output.contents().contains("done"));
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
