use std::path::Path;
use tokio::time::{Duration, Instant};
use tokio_test::{assert_err, assert_ok};

use super::utils::{short_timeout, test_limits};
use crate::{
    output::OutputBuffer, sandbox::SandboxExecutor, types::ExecutionResult, types::ResourceLimits,
};

fn sh(script: &str) -> Vec<String> {
    vec!["-c".to_string(), script.to_string()]
}

async fn run_script(
    executor: &SandboxExecutor,
    script: &str,
) -> (ExecutionResult, OutputBuffer) {
    let dir = tempfile::tempdir().unwrap();
    let output = OutputBuffer::new();
    let result = assert_ok!(
        executor
            .execute(Path::new("/bin/sh"), &sh(script), dir.path(), &output)
            .await
    );
    (result, output)
}

#[tokio::test]
async fn test_sandbox_basic() {
    let executor = SandboxExecutor::new(test_limits(), Duration::from_secs(5));
    let (result, output) = run_script(&executor, "echo Hello").await;
    assert_eq!(result, ExecutionResult::Completed { exit_code: 0 });
    assert_eq!(output.contents(), "Hello\n");
}

#[tokio::test]
async fn test_sandbox_captures_both_streams() {
    let executor = SandboxExecutor::new(test_limits(), Duration::from_secs(5));
    let (result, output) = run_script(&executor, "echo out; echo err 1>&2; echo out2").await;
    assert_eq!(result, ExecutionResult::Completed { exit_code: 0 });

    let chunks = output.chunks();
    assert_eq!(chunks.len(), 3);
    assert!(chunks.contains(&"err\n".to_string()));
    // Order within one stream is preserved.
    let out: Vec<_> = chunks.iter().filter(|c| c.starts_with("out")).collect();
    assert_eq!(out, vec!["out\n", "out2\n"]);
}

#[tokio::test]
async fn test_sandbox_exit_code() {
    let executor = SandboxExecutor::new(test_limits(), Duration::from_secs(5));
    let (result, _) = run_script(&executor, "exit 3").await;
    assert_eq!(result, ExecutionResult::Completed { exit_code: 3 });
    assert!(!result.is_success());

    let (result, _) = run_script(&executor, "kill -9 $$").await;
    assert_eq!(result, ExecutionResult::Completed { exit_code: 137 });
}

#[tokio::test]
async fn test_sandbox_timeout() {
    let executor = SandboxExecutor::new(test_limits(), short_timeout());
    let started = Instant::now();
    let (result, output) = run_script(&executor, "echo started; sleep 10; echo finished").await;

    assert_eq!(result, ExecutionResult::TimedOut);
    assert!(started.elapsed() < Duration::from_secs(5));
    // Output produced before the kill is kept.
    assert_eq!(output.chunks(), vec!["started\n".to_string()]);
}

#[tokio::test]
async fn test_sandbox_timeout_kills_descendants() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("survivor");
    let executor = SandboxExecutor::new(test_limits(), short_timeout());
    let script = format!("(sleep 2; touch {}) & wait", marker.display());
    let (result, _) = run_script(&executor, &script).await;
    assert_eq!(result, ExecutionResult::TimedOut);

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(!marker.exists());
}

/// Whether `pid` names a live process. Zombies waiting to be reaped by
/// whoever inherited them count as dead.
#[cfg(target_os = "linux")]
fn is_alive(pid: &str) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next())
            .map_or(false, |state| state != 'Z'),
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_sandbox_timeout_kills_process_group() {
    let executor = SandboxExecutor::new(test_limits(), Duration::from_millis(300));
    let (result, output) = run_script(&executor, "sleep 30 & echo $!; wait").await;
    assert_eq!(result, ExecutionResult::TimedOut);

    let chunks = output.chunks();
    let pid = chunks[0].trim().to_string();
    assert!(pid.parse::<u32>().is_ok(), "{:?}", chunks);

    let deadline = Instant::now() + Duration::from_secs(2);
    while is_alive(&pid) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!is_alive(&pid), "background sleep {} survived the timeout", pid);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_sandbox_cpu_limit() {
    let limits = ResourceLimits {
        cpu_time: 1,
        ..test_limits()
    };
    let executor = SandboxExecutor::new(limits, Duration::from_secs(10));
    let (result, _) = run_script(&executor, "while :; do :; done").await;
    // SIGXCPU (24) or SIGKILL at the hard limit.
    match result {
        ExecutionResult::Completed { exit_code } => {
            assert!(exit_code == 128 + 24 || exit_code == 128 + 9, "{}", exit_code)
        }
        other => panic!("expected the CPU limit to end the process, got {:?}", other),
    }
}

#[tokio::test]
async fn test_sandbox_missing_program() {
    let dir = tempfile::tempdir().unwrap();
    let executor = SandboxExecutor::new(test_limits(), short_timeout());
    let output = OutputBuffer::new();
    assert_err!(
        executor
            .execute(Path::new("./does-not-exist"), &[], dir.path(), &output)
            .await
    );
    assert!(output.is_empty());
}
