//! Sessions and the controller that drives one through the pipeline.
//!
//! A run moves a [`Session`] through parse, audit, build and execute,
//! stopping at the first stage that produces a terminal result. The
//! session's workspace is removed before the run is reported finished, on
//! every path.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{
    audit::PolicyAuditor,
    builder::BuildOrchestrator,
    config::SandboxConfig,
    error::Error,
    frontend::{CompileOutcome, CompilerFrontend, RustcFrontend},
    output::OutputBuffer,
    references::{AllowListProvider, ReferenceProvider},
    sandbox::SandboxExecutor,
    types::{duration_ms, CapabilityDescriptor, ExecutionResult, Phase},
    workspace::Workspace,
    Result,
};

/// One request: source text in, result and captured output out.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    source: String,
    denylist: Vec<CapabilityDescriptor>,
    phase: watch::Sender<Phase>,
    output: OutputBuffer,
    result: OnceLock<ExecutionResult>,
    workspace: OnceLock<PathBuf>,
}

impl Session {
    pub fn new(source: impl Into<String>) -> Self {
        let (phase, _) = watch::channel(Phase::Pending);
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            denylist: Vec::new(),
            phase,
            output: OutputBuffer::new(),
            result: OnceLock::new(),
            workspace: OnceLock::new(),
        }
    }

    /// Capabilities denied to this session. Duplicates are dropped, order is
    /// kept.
    pub fn with_denylist(
        mut self,
        denylist: impl IntoIterator<Item = CapabilityDescriptor>,
    ) -> Self {
        for descriptor in denylist {
            if !self.denylist.contains(&descriptor) {
                self.denylist.push(descriptor);
            }
        }
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn denylist(&self) -> &[CapabilityDescriptor] {
        &self.denylist
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Output captured so far.
    pub fn output(&self) -> String {
        self.output.contents()
    }

    pub fn output_buffer(&self) -> &OutputBuffer {
        &self.output
    }

    /// Terminal result, or `NotRun` while the pipeline is still going.
    pub fn result(&self) -> ExecutionResult {
        self.result.get().cloned().unwrap_or(ExecutionResult::NotRun)
    }

    /// Workspace directory allocated for this session, once there is one.
    pub fn workspace(&self) -> Option<&PathBuf> {
        self.workspace.get()
    }

    fn claim(&self) -> bool {
        self.phase.send_if_modified(|phase| {
            if *phase == Phase::Pending {
                *phase = Phase::Parsing;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        debug!("Session {} entering {:?}", self.id, phase);
        self.phase.send_replace(phase);
    }

    fn finish(&self, result: ExecutionResult) {
        if self.result.set(result).is_err() {
            error!("Session {} already has a result", self.id);
        }
    }
}

/// What a finished run hands back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub result: ExecutionResult,
    pub output: String,
    pub chunks: Vec<String>,
    pub workspace: Option<PathBuf>,
    #[serde(with = "duration_ms", rename = "elapsed_ms")]
    pub elapsed: Duration,
}

impl SessionReport {
    fn from_session(session: &Session, elapsed: Duration) -> Self {
        Self {
            session_id: session.id(),
            result: session.result(),
            output: session.output(),
            chunks: session.output_buffer().chunks(),
            workspace: session.workspace().cloned(),
            elapsed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_success()
    }
}

/// Composes workspace, audit, build and sandbox into one run.
pub struct SessionController {
    config: Arc<SandboxConfig>,
    frontend: Arc<dyn CompilerFrontend>,
    builder: BuildOrchestrator,
    executor: SandboxExecutor,
}

impl SessionController {
    pub fn new(
        config: Arc<SandboxConfig>,
        frontend: Arc<dyn CompilerFrontend>,
        references: Arc<dyn ReferenceProvider>,
    ) -> Self {
        let builder = BuildOrchestrator::new(
            frontend.clone(),
            references,
            config.compiler.artifact_name.clone(),
        );
        let executor = SandboxExecutor::from_config(&config);
        Self {
            config,
            frontend,
            builder,
            executor,
        }
    }

    /// Controller using `rustc` and the configured library allow-list.
    pub fn from_config(config: Arc<SandboxConfig>) -> Result<Self> {
        let frontend = Arc::new(RustcFrontend::new(config.compiler.clone()));
        let references = Arc::new(AllowListProvider::new(&config.libraries)?);
        Ok(Self::new(config, frontend, references))
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run `session` to completion.
    ///
    /// Pipeline outcomes (violation, compile failure, completion, timeout)
    /// are reported through `Ok`; `Err` means the run itself broke, in which
    /// case the session result stays `NotRun`.
    pub async fn run(&self, session: &Session) -> Result<SessionReport> {
        if !session.claim() {
            return Err(Error::System(format!(
                "Session {} has already been run",
                session.id()
            )));
        }
        let started = Instant::now();
        info!("Starting session {}", session.id());

        let workspace = match Workspace::create(&self.config.workspace, &session.id()).await {
            Ok(workspace) => workspace,
            Err(e) => {
                session.set_phase(Phase::Finished);
                return Err(e);
            }
        };
        // Set only once, right after the claim above.
        let _ = session.workspace.set(workspace.path().to_path_buf());

        let outcome = self.drive(session, &workspace).await;
        let cleanup = workspace.destroy().await;

        let outcome = match (outcome, cleanup) {
            (Ok(result), Ok(())) => {
                session.finish(result);
                Ok(())
            }
            (Ok(result), Err(e)) => {
                session.finish(result);
                Err(e)
            }
            (Err(e), cleanup) => {
                if let Err(cleanup) = cleanup {
                    error!("Session {} cleanup failed: {}", session.id(), cleanup);
                }
                Err(e)
            }
        };
        session.set_phase(Phase::Finished);

        match &outcome {
            Ok(()) => info!("Session {} finished: {}", session.id(), session.result()),
            Err(e) => error!("Session {} failed: {}", session.id(), e),
        }
        outcome.map(|()| SessionReport::from_session(session, started.elapsed()))
    }

    async fn drive(&self, session: &Session, workspace: &Workspace) -> Result<ExecutionResult> {
        let program = match self.frontend.parse(session.source()) {
            Ok(program) => program,
            Err(diagnostics) => return Ok(ExecutionResult::CompileFailed { diagnostics }),
        };
        let model = match self.frontend.resolve(&program) {
            Ok(model) => model,
            Err(diagnostics) => return Ok(ExecutionResult::CompileFailed { diagnostics }),
        };
        debug!(
            "Parsed {} items, {} call sites",
            program.item_count(),
            model.call_sites().len()
        );

        session.set_phase(Phase::Auditing);
        let auditor = PolicyAuditor::new(
            self.config
                .denylist
                .iter()
                .chain(session.denylist())
                .cloned(),
        );
        if let Some(call_site) = auditor.audit(&model).offending_call_site() {
            return Ok(ExecutionResult::PolicyViolation {
                call_site: call_site.clone(),
            });
        }

        session.set_phase(Phase::Building);
        let artifact = match self.builder.build(&program, &model, workspace).await? {
            CompileOutcome::Built { artifact } => artifact,
            CompileOutcome::Failed { diagnostics } => {
                return Ok(ExecutionResult::CompileFailed { diagnostics })
            }
        };

        session.set_phase(Phase::Executing);
        self.executor
            .execute(&artifact, &[], workspace.path(), session.output_buffer())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_defaults() {
        let session = Session::new("fn main() {}").with_denylist([
            "std::fs::File".parse().unwrap(),
            "std::fs::File".parse().unwrap(),
            "std::process".parse().unwrap(),
        ]);
        assert_eq!(session.phase(), Phase::Pending);
        assert_eq!(session.result(), ExecutionResult::NotRun);
        assert_eq!(session.denylist().len(), 2);
        assert!(session.output().is_empty());
        assert!(session.workspace().is_none());
    }

    #[test]
    fn test_sessions_have_distinct_ids() {
        assert_ne!(Session::new("").id(), Session::new("").id());
    }

    #[test]
    fn test_result_is_set_once() {
        let session = Session::new("");
        session.finish(ExecutionResult::TimedOut);
        session.finish(ExecutionResult::Completed { exit_code: 0 });
        assert_eq!(session.result(), ExecutionResult::TimedOut);
    }

    #[test]
    fn test_claim_only_once() {
        let session = Session::new("");
        assert!(session.claim());
        assert!(!session.claim());
        assert_eq!(session.phase(), Phase::Parsing);
    }

    #[test]
    fn test_report_serialization() {
        let session = Session::new("");
        session.output_buffer().append("hello");
        session.finish(ExecutionResult::Completed { exit_code: 0 });
        let report = SessionReport::from_session(&session, Duration::from_millis(42));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["elapsed_ms"], 42);
        assert_eq!(json["result"]["status"], "completed");
        assert_eq!(json["output"], "hello\n");
        assert!(report.is_success());
    }
}
