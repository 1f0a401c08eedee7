use std::path::Path;
use std::time::Duration;
use which::which;

use crate::{config::SandboxConfig, types::ResourceLimits};

pub fn test_limits() -> ResourceLimits {
    ResourceLimits {
        cpu_time: 5,
        file_size: 10 * 1024 * 1024, // 10MB
    }
}

/// Configuration whose workspaces live under `temp_root`.
pub fn test_config(temp_root: &Path) -> SandboxConfig {
    SandboxConfig {
        limits: test_limits(),
        ..SandboxConfig::default()
    }
    .with_temp_root(temp_root)
}

pub fn short_timeout() -> Duration {
    Duration::from_millis(500)
}

/// Whether `root` still holds any session workspace.
pub fn has_workspaces(root: &Path) -> bool {
    std::fs::read_dir(root)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .any(|e| e.file_name().to_string_lossy().starts_with("sandbox-"))
        })
        .unwrap_or(false)
}

pub(crate) fn skip_if_not_available(tools: &[&str]) -> bool {
    let missing: Vec<_> = tools
        .iter()
        .filter(|tool| which(**tool).is_err())
        .map(|s| (*s).to_string())
        .collect();

    if !missing.is_empty() {
        eprintln!("Skipping test: {} not available", missing.join(", "));
        return true;
    }
    false
}
