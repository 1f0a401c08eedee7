use std::sync::Arc;
use tokio::{sync::Semaphore, task::JoinHandle};
use tracing::debug;
use uuid::Uuid;

use crate::{
    config::SandboxConfig,
    error::Error,
    frontend::CompilerFrontend,
    references::ReferenceProvider,
    session::{Session, SessionController, SessionReport},
    types::Phase,
    Result,
};

/// Runs sessions in the background, at most `max_concurrent_sessions` at a
/// time.
#[derive(Clone)]
pub struct CodeExecutionService {
    controller: Arc<SessionController>,
    semaphore: Arc<Semaphore>,
    config: Arc<SandboxConfig>,
}

impl CodeExecutionService {
    pub fn new(config: SandboxConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let controller = SessionController::from_config(config.clone())?;
        Ok(Self::from_controller(config, controller))
    }

    /// Service over a caller-supplied frontend and reference provider.
    pub fn with_components(
        config: SandboxConfig,
        frontend: Arc<dyn CompilerFrontend>,
        references: Arc<dyn ReferenceProvider>,
    ) -> Self {
        let config = Arc::new(config);
        let controller = SessionController::new(config.clone(), frontend, references);
        Self::from_controller(config, controller)
    }

    fn from_controller(config: Arc<SandboxConfig>, controller: SessionController) -> Self {
        Self {
            controller: Arc::new(controller),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_sessions)),
            config,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Start `session` in the background. Its output and phase can be
    /// observed through the handle while it runs.
    pub fn spawn(&self, session: Session) -> RunHandle {
        let session = Arc::new(session);
        let controller = self.controller.clone();
        let semaphore = self.semaphore.clone();
        let running = session.clone();

        let task = tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| Error::System(format!("Failed to acquire execution permit: {}", e)))?;
            debug!("Session {} acquired an execution slot", running.id());
            controller.run(&running).await
        });

        RunHandle { session, task }
    }

    /// Run `session` and wait for its report.
    pub async fn execute(&self, session: Session) -> Result<SessionReport> {
        self.spawn(session).wait().await
    }

    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Handle to a session running in the background.
///
/// Dropping the handle does not stop the run; the workspace is still
/// removed when the run ends.
#[derive(Debug)]
pub struct RunHandle {
    session: Arc<Session>,
    task: JoinHandle<Result<SessionReport>>,
}

impl RunHandle {
    pub fn id(&self) -> Uuid {
        self.session.id()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Output captured so far.
    pub fn output(&self) -> String {
        self.session.output()
    }

    pub fn phase(&self) -> Phase {
        self.session.phase()
    }

    /// Wait until the session has reached `phase` or a later one.
    pub async fn wait_for_phase(&self, phase: Phase) -> Phase {
        let mut receiver = self.session.subscribe_phase();
        let reached = match receiver.wait_for(|current| *current >= phase).await {
            Ok(current) => *current,
            Err(_) => self.session.phase(),
        };
        reached
    }

    pub async fn wait(self) -> Result<SessionReport> {
        self.task
            .await
            .map_err(|e| Error::System(format!("Session task failed: {}", e)))?
    }
}
