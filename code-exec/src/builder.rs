use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    frontend::{CompileOutcome, CompilerFrontend, ProgramStructure, SemanticModel},
    references::ReferenceProvider,
    workspace::Workspace,
    Result,
};

/// Drives the compiler frontend once a program has passed the audit.
#[derive(Clone)]
pub struct BuildOrchestrator {
    frontend: Arc<dyn CompilerFrontend>,
    references: Arc<dyn ReferenceProvider>,
    artifact_name: String,
}

impl BuildOrchestrator {
    pub fn new(
        frontend: Arc<dyn CompilerFrontend>,
        references: Arc<dyn ReferenceProvider>,
        artifact_name: impl Into<String>,
    ) -> Self {
        Self {
            frontend,
            references,
            artifact_name: artifact_name.into(),
        }
    }

    /// Where the artifact lands inside `workspace`.
    pub fn artifact_path(&self, workspace: &Workspace) -> PathBuf {
        workspace.join(&self.artifact_name)
    }

    pub async fn build(
        &self,
        program: &ProgramStructure,
        model: &SemanticModel,
        workspace: &Workspace,
    ) -> Result<CompileOutcome> {
        self.frontend.check_tools().await?;

        let references = self.references.references(model.referenced_namespaces())?;
        debug!(
            "Linking {} librar{}: {:?}",
            references.len(),
            if references.len() == 1 { "y" } else { "ies" },
            references.iter().map(|r| r.name.as_str()).collect::<Vec<_>>()
        );

        let output = self.artifact_path(workspace);
        let outcome = self.frontend.compile(program, &references, &output).await?;
        match &outcome {
            CompileOutcome::Built { artifact } => info!("Built {}", artifact.display()),
            CompileOutcome::Failed { diagnostics } => warn!(
                "Build failed with {} diagnostic(s)",
                diagnostics.len()
            ),
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::WorkspaceConfig,
        frontend::MockCompilerFrontend,
        references::{LibraryReference, MockReferenceProvider},
        types::Diagnostic,
        Error,
    };
    use mockall::predicate::eq;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    const SOURCE: &str = "use serde_json::json; fn main() { let _ = json!(1); }";

    async fn workspace(temp: &assert_fs::TempDir) -> Workspace {
        let config = WorkspaceConfig {
            temp_root: Some(temp.path().to_path_buf()),
            ..WorkspaceConfig::default()
        };
        Workspace::create(&config, &Uuid::new_v4()).await.unwrap()
    }

    fn program() -> (ProgramStructure, SemanticModel) {
        let program = ProgramStructure::parse(SOURCE).unwrap();
        let model = SemanticModel::build(&program.syntax().unwrap());
        (program, model)
    }

    #[tokio::test]
    async fn test_build_passes_references_to_compiler() {
        let temp = assert_fs::TempDir::new().unwrap();
        let workspace = workspace(&temp).await;
        let (program, model) = program();
        let expected_artifact = workspace.join("sandbox-program");

        let mut references = MockReferenceProvider::new();
        references
            .expect_references()
            .with(eq(BTreeSet::from(["serde_json".to_string()])))
            .times(1)
            .returning(|_| {
                Ok(vec![LibraryReference {
                    name: "serde_json".into(),
                    path: "/libs/libserde_json.rlib".into(),
                }])
            });

        let mut frontend = MockCompilerFrontend::new();
        frontend.expect_check_tools().times(1).returning(|| Ok(()));
        let artifact = expected_artifact.clone();
        frontend
            .expect_compile()
            .withf(move |_, refs, output| refs.len() == 1 && output == artifact)
            .times(1)
            .returning(|_, _, output| {
                Ok(CompileOutcome::Built {
                    artifact: output.to_path_buf(),
                })
            });

        let builder =
            BuildOrchestrator::new(Arc::new(frontend), Arc::new(references), "sandbox-program");
        let outcome = builder.build(&program, &model, &workspace).await.unwrap();
        assert_eq!(
            outcome,
            CompileOutcome::Built {
                artifact: expected_artifact
            }
        );
        workspace.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_build_surfaces_diagnostics() {
        let temp = assert_fs::TempDir::new().unwrap();
        let workspace = workspace(&temp).await;
        let (program, model) = program();

        let mut references = MockReferenceProvider::new();
        references.expect_references().returning(|_| Ok(vec![]));
        let mut frontend = MockCompilerFrontend::new();
        frontend.expect_check_tools().returning(|| Ok(()));
        frontend.expect_compile().returning(|_, _, _| {
            Ok(CompileOutcome::Failed {
                diagnostics: vec![Diagnostic::error("unresolved import `serde_json`")],
            })
        });

        let builder =
            BuildOrchestrator::new(Arc::new(frontend), Arc::new(references), "sandbox-program");
        match builder.build(&program, &model, &workspace).await.unwrap() {
            CompileOutcome::Failed { diagnostics } => assert_eq!(diagnostics.len(), 1),
            other => panic!("expected failure, got {:?}", other),
        }
        workspace.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_toolchain_stops_build() {
        let temp = assert_fs::TempDir::new().unwrap();
        let workspace = workspace(&temp).await;
        let (program, model) = program();

        let mut references = MockReferenceProvider::new();
        references.expect_references().never();
        let mut frontend = MockCompilerFrontend::new();
        frontend
            .expect_check_tools()
            .returning(|| Err(Error::ToolNotFound("rustc".into())));
        frontend.expect_compile().never();

        let builder =
            BuildOrchestrator::new(Arc::new(frontend), Arc::new(references), "sandbox-program");
        let result = builder.build(&program, &model, &workspace).await;
        assert!(matches!(result, Err(Error::ToolNotFound(_))));
        workspace.destroy().await.unwrap();
    }
}
