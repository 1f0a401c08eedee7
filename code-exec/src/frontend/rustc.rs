use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::{io::AsyncWriteExt, process::Command, time};
use tracing::{debug, info, warn};

use super::{CompileOutcome, CompilerFrontend, ProgramStructure, SemanticModel};
use crate::{
    config::CompilerConfig,
    error::Error,
    references::LibraryReference,
    types::{Diagnostic, Severity},
    Result,
};

/// Frontend backed by `syn` for parsing and the `rustc` binary for code
/// generation.
pub struct RustcFrontend {
    config: CompilerConfig,
}

impl RustcFrontend {
    pub fn new(config: CompilerConfig) -> Self {
        Self { config }
    }

    fn rustc_path(&self) -> Result<PathBuf> {
        which::which(&self.config.rustc)
            .map_err(|e| Error::ToolNotFound(format!("{}: {}", self.config.rustc, e)))
    }

    fn compile_args(&self, references: &[LibraryReference], output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-".into(),
            "--crate-name".into(),
            self.config.crate_name.clone().into(),
            "--crate-type".into(),
            "bin".into(),
            "--edition".into(),
            self.config.edition.clone().into(),
            "-C".into(),
            format!("opt-level={}", self.config.opt_level).into(),
            "--error-format=json".into(),
            "-o".into(),
            output.as_os_str().to_owned(),
        ];

        let mut search_dirs = BTreeSet::new();
        for reference in references {
            let mut extern_arg = OsString::from(format!("{}=", reference.name));
            extern_arg.push(&reference.path);
            args.push("--extern".into());
            args.push(extern_arg);
            if let Some(dir) = reference.path.parent() {
                search_dirs.insert(dir.to_path_buf());
            }
        }
        for dir in search_dirs {
            let mut search = OsString::from("dependency=");
            search.push(&dir);
            args.push("-L".into());
            args.push(search);
        }

        args
    }
}

#[async_trait]
impl CompilerFrontend for RustcFrontend {
    fn parse(&self, source: &str) -> std::result::Result<ProgramStructure, Vec<Diagnostic>> {
        ProgramStructure::parse(source)
    }

    fn resolve(
        &self,
        program: &ProgramStructure,
    ) -> std::result::Result<SemanticModel, Vec<Diagnostic>> {
        let file = program.syntax()?;
        Ok(SemanticModel::build(&file))
    }

    async fn check_tools(&self) -> Result<()> {
        let rustc = self.rustc_path()?;
        debug!("Using compiler at {}", rustc.display());
        Ok(())
    }

    async fn compile(
        &self,
        program: &ProgramStructure,
        references: &[LibraryReference],
        output: &Path,
    ) -> Result<CompileOutcome> {
        let rustc = self.rustc_path()?;
        let args = self.compile_args(references, output);
        debug!("Compiling with {} {:?}", rustc.display(), args);

        let mut child = Command::new(&rustc)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Compiler(format!("Failed to spawn {}: {}", rustc.display(), e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // rustc may exit before reading all of stdin (e.g. bad flags);
            // its diagnostics are still collected below.
            if let Err(e) = stdin.write_all(program.source().as_bytes()).await {
                debug!("Failed to write source to compiler: {}", e);
            }
            drop(stdin);
        }

        let deadline = self.config.compile_timeout();
        let result = match time::timeout(deadline, child.wait_with_output()).await {
            Ok(result) => {
                result.map_err(|e| Error::Compiler(format!("Failed to wait for compiler: {}", e)))?
            }
            Err(_) => {
                warn!("Compilation exceeded {}s, compiler killed", deadline.as_secs());
                return Ok(CompileOutcome::Failed {
                    diagnostics: vec![Diagnostic::error(format!(
                        "compilation exceeded the {}s deadline",
                        deadline.as_secs()
                    ))],
                });
            }
        };

        let stderr = String::from_utf8_lossy(&result.stderr);
        let mut diagnostics = parse_diagnostics(&stderr);

        if result.status.success() {
            if !output.exists() {
                return Err(Error::Compiler(format!(
                    "Compiler reported success but {} is missing",
                    output.display()
                )));
            }
            info!("Compiled artifact {}", output.display());
            return Ok(CompileOutcome::Built {
                artifact: output.to_path_buf(),
            });
        }

        if !diagnostics.iter().any(Diagnostic::is_error) {
            let message = match stderr.trim() {
                "" => format!("compiler exited with {}", result.status),
                raw => raw.to_string(),
            };
            diagnostics.push(Diagnostic::error(message));
        }
        Ok(CompileOutcome::Failed { diagnostics })
    }
}

#[derive(Debug, Deserialize)]
struct RustcMessage {
    #[serde(rename = "$message_type")]
    message_type: Option<String>,
    message: String,
    level: String,
    code: Option<RustcCode>,
    #[serde(default)]
    spans: Vec<RustcSpan>,
    rendered: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RustcCode {
    code: String,
}

#[derive(Debug, Deserialize)]
struct RustcSpan {
    line_start: usize,
    column_start: usize,
    is_primary: bool,
}

fn severity(level: &str) -> Severity {
    match level {
        "warning" => Severity::Warning,
        "help" => Severity::Help,
        level if level.starts_with("error") => Severity::Error,
        _ => Severity::Note,
    }
}

/// Parse `--error-format=json` output; lines that are not diagnostics are
/// skipped.
fn parse_diagnostics(stderr: &str) -> Vec<Diagnostic> {
    stderr
        .lines()
        .filter(|line| line.trim_start().starts_with('{'))
        .filter_map(|line| serde_json::from_str::<RustcMessage>(line).ok())
        .filter(|msg| {
            msg.message_type
                .as_deref()
                .map_or(true, |kind| kind == "diagnostic")
        })
        .map(|msg| {
            let primary = msg.spans.iter().find(|span| span.is_primary);
            Diagnostic {
                severity: severity(&msg.level),
                message: msg.message,
                code: msg.code.map(|c| c.code),
                line: primary.map(|s| s.line_start),
                column: primary.map(|s| s.column_start),
                rendered: msg.rendered,
            }
        })
        .collect()
}
