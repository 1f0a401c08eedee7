//! Compiler frontend collaborator: parsing, name resolution and code emission.

mod rustc;
mod semantic;

pub use rustc::RustcFrontend;
pub use semantic::SemanticModel;

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::{references::LibraryReference, types::Diagnostic, Result};

/// A program that has been checked to parse.
///
/// Syntax trees are not `Send`, so only the validated source is kept and the
/// tree is rebuilt on demand inside synchronous code.
#[derive(Debug, Clone)]
pub struct ProgramStructure {
    source: String,
    item_count: usize,
}

impl ProgramStructure {
    pub fn parse(source: &str) -> std::result::Result<Self, Vec<Diagnostic>> {
        let file = syn::parse_file(source).map_err(syntax_diagnostics)?;
        Ok(Self {
            source: source.to_string(),
            item_count: file.items.len(),
        })
    }

    pub fn syntax(&self) -> std::result::Result<syn::File, Vec<Diagnostic>> {
        syn::parse_file(&self.source).map_err(syntax_diagnostics)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Number of top-level items.
    pub fn item_count(&self) -> usize {
        self.item_count
    }
}

fn syntax_diagnostics(err: syn::Error) -> Vec<Diagnostic> {
    err.into_iter()
        .map(|e| {
            let start = e.span().start();
            Diagnostic::error(e.to_string()).at(start.line, start.column + 1)
        })
        .collect()
}

/// Result of asking the frontend to emit an executable.
#[derive(Debug, Clone, PartialEq)]
pub enum CompileOutcome {
    Built { artifact: PathBuf },
    Failed { diagnostics: Vec<Diagnostic> },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CompilerFrontend: Send + Sync {
    /// Parse source text; syntax errors come back as diagnostics.
    fn parse(&self, source: &str) -> std::result::Result<ProgramStructure, Vec<Diagnostic>>;

    /// Build the semantic model used by the policy audit.
    fn resolve(
        &self,
        program: &ProgramStructure,
    ) -> std::result::Result<SemanticModel, Vec<Diagnostic>>;

    /// Check that the toolchain is available
    async fn check_tools(&self) -> Result<()>;

    /// Emit a standalone executable at `output`.
    async fn compile(
        &self,
        program: &ProgramStructure,
        references: &[LibraryReference],
        output: &Path,
    ) -> Result<CompileOutcome>;
}
