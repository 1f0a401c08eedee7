//! # Code Execution Sandbox
//!
//! Runs untrusted Rust programs: each program is audited against a denylist
//! of capabilities, compiled with `rustc`, and executed in a child process
//! under a wall-clock deadline. Every session gets its own workspace
//! directory, which is removed when the session ends.

mod audit;
mod builder;
mod config;
mod error;
mod frontend;
mod output;
mod references;
mod sandbox;
mod service;
mod session;
mod types;
mod workspace;

#[cfg(test)]
mod tests;

pub use audit::{AuditVerdict, PolicyAuditor};
pub use builder::BuildOrchestrator;
pub use config::{
    CompilerConfig, LibraryAllowList, SandboxConfig, WorkspaceConfig, DEFAULT_TIMEOUT_MS,
};
pub use error::Error;
pub use frontend::{
    CompileOutcome, CompilerFrontend, ProgramStructure, RustcFrontend, SemanticModel,
};
pub use output::OutputBuffer;
pub use references::{AllowListProvider, LibraryReference, ReferenceProvider};
pub use sandbox::SandboxExecutor;
pub use service::{CodeExecutionService, RunHandle};
pub use session::{Session, SessionController, SessionReport};
pub use types::{
    normalize_path, CallKind, CallSite, CapabilityDescriptor, Diagnostic, ExecutionResult, Phase,
    ResourceLimits, Severity, TypeRef,
};
pub use workspace::{remove_workspace, Workspace, SUPPORT_FILE_NAME};

/// Result type for sandbox operations
pub type Result<T> = std::result::Result<T, Error>;
