//! Sandbox configuration.
//!
//! A [`SandboxConfig`] is built once (usually from a TOML file), validated,
//! and then shared read-only by every component of the pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{
    error::Error,
    types::{CapabilityDescriptor, ResourceLimits},
    Result,
};

/// Default deadline for the sandboxed program.
pub const DEFAULT_TIMEOUT_MS: u64 = 3000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Wall-clock deadline for the compiled program, in milliseconds
    pub timeout_ms: u64,
    /// How long to keep reading output after the process has gone
    pub drain_grace_ms: u64,
    /// Maximum number of sessions running at once
    pub max_concurrent_sessions: usize,
    /// Capabilities denied to every session, in addition to its own list
    pub denylist: Vec<CapabilityDescriptor>,
    pub workspace: WorkspaceConfig,
    pub compiler: CompilerConfig,
    pub libraries: LibraryAllowList,
    pub limits: ResourceLimits,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            drain_grace_ms: 200,
            max_concurrent_sessions: 4,
            denylist: Vec::new(),
            workspace: WorkspaceConfig::default(),
            compiler: CompilerConfig::default(),
            libraries: LibraryAllowList::default(),
            limits: ResourceLimits::default(),
        }
    }
}

impl SandboxConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| Error::Config(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(Error::Config("timeout_ms must be greater than zero".into()));
        }
        if self.max_concurrent_sessions == 0 {
            return Err(Error::Config(
                "max_concurrent_sessions must be greater than zero".into(),
            ));
        }
        if self.compiler.compile_timeout_secs == 0 {
            return Err(Error::Config(
                "compiler.compile_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.workspace.prefix.contains(std::path::is_separator) {
            return Err(Error::Config(format!(
                "workspace.prefix must not contain a path separator: {}",
                self.workspace.prefix
            )));
        }
        if !["2015", "2018", "2021", "2024"].contains(&self.compiler.edition.as_str()) {
            return Err(Error::Config(format!(
                "Unsupported edition: {}",
                self.compiler.edition
            )));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis().max(1) as u64;
        self
    }

    pub fn with_temp_root(mut self, temp_root: impl Into<PathBuf>) -> Self {
        self.workspace.temp_root = Some(temp_root.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Parent directory for session workspaces; the system temp dir if unset
    pub temp_root: Option<PathBuf>,
    /// Prefix of each workspace directory name, followed by the session id
    pub prefix: String,
    /// File copied into every workspace instead of the built-in template
    pub support_template: Option<PathBuf>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            temp_root: None,
            prefix: "sandbox-".to_string(),
            support_template: None,
        }
    }
}

impl WorkspaceConfig {
    pub fn root(&self) -> PathBuf {
        self.temp_root.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Compiler binary, resolved through `PATH` unless absolute
    pub rustc: String,
    pub edition: String,
    pub opt_level: String,
    pub compile_timeout_secs: u64,
    pub crate_name: String,
    pub artifact_name: String,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            rustc: "rustc".to_string(),
            edition: "2021".to_string(),
            opt_level: "2".to_string(),
            compile_timeout_secs: 30,
            crate_name: "sandbox_program".to_string(),
            artifact_name: "sandbox-program".to_string(),
        }
    }
}

impl CompilerConfig {
    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.compile_timeout_secs)
    }
}

/// Libraries a program may link against.
///
/// `crates` maps crate names to compiled library files; `platform` names
/// crates that are referenced for every program whether or not it uses them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryAllowList {
    pub version: String,
    pub crates: BTreeMap<String, PathBuf>,
    pub platform: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.timeout(), Duration::from_millis(3000));
        assert!(config.denylist.is_empty());
        assert_eq!(config.compiler.rustc, "rustc");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let config = SandboxConfig::from_toml_str(
            r#"
            timeout_ms = 1500
            denylist = ["std::fs::File", "std::process::Command#new"]

            [workspace]
            temp_root = "/var/tmp"
            prefix = "run-"

            [compiler]
            edition = "2018"
            compile_timeout_secs = 10

            [libraries]
            version = "2024.1"
            platform = ["serde"]

            [libraries.crates]
            serde = "/opt/libs/libserde.rlib"

            [limits]
            cpu_time = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.timeout_ms, 1500);
        assert_eq!(config.denylist.len(), 2);
        assert_eq!(config.denylist[1].method.as_deref(), Some("new"));
        assert_eq!(config.workspace.root(), PathBuf::from("/var/tmp"));
        assert_eq!(config.workspace.prefix, "run-");
        assert_eq!(config.compiler.edition, "2018");
        assert_eq!(config.compiler.opt_level, "2");
        assert_eq!(config.libraries.version, "2024.1");
        assert_eq!(
            config.libraries.crates.get("serde"),
            Some(&PathBuf::from("/opt/libs/libserde.rlib"))
        );
        assert_eq!(config.limits.cpu_time, 5);
        assert_eq!(config.limits.file_size, ResourceLimits::default().file_size);
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            SandboxConfig::from_toml_str("timeout_ms = 0"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            SandboxConfig::from_toml_str("denylist = [\"not a type\"]"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            SandboxConfig::from_toml_str("[workspace]\nprefix = \"a/b\""),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            SandboxConfig::from_toml_str("[compiler]\nedition = \"2019\""),
            Err(Error::Config(_))
        ));
    }
}
