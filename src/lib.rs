//! Command-line front end for the code execution sandbox.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use code_exec::{
    AuditVerdict, CallSite, CapabilityDescriptor, CodeExecutionService, CompilerFrontend,
    Diagnostic, ExecutionResult, PolicyAuditor, RustcFrontend, SandboxConfig, Session,
    SessionReport,
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::debug;

/// Exit status when the program was rejected by the audit.
pub const EXIT_POLICY_VIOLATION: u8 = 77;
/// Exit status when the program did not compile.
pub const EXIT_COMPILE_FAILED: u8 = 65;
/// Exit status when the program ran past its deadline.
pub const EXIT_TIMED_OUT: u8 = 124;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Sandbox configuration file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Audit, compile and run a program
    Run(RunArgs),
    /// Audit a program without compiling it
    Audit(AuditArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Source file, or `-` to read from stdin
    pub file: PathBuf,

    /// Deny a capability, e.g. `std::fs::File` or `std::process::Command#new`
    #[arg(short, long = "deny", value_name = "DESCRIPTOR")]
    pub deny: Vec<CapabilityDescriptor>,

    /// Execution deadline in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Print the session report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct AuditArgs {
    /// Source file, or `-` to read from stdin
    pub file: PathBuf,

    /// Deny a capability, e.g. `std::fs::File` or `std::process::Command#new`
    #[arg(short, long = "deny", value_name = "DESCRIPTOR")]
    pub deny: Vec<CapabilityDescriptor>,

    /// Print the audit report as JSON
    #[arg(long)]
    pub json: bool,
}

/// What `audit` found in a program.
#[derive(Debug, Serialize)]
pub struct AuditReport {
    pub call_sites: Vec<CallSite>,
    pub namespaces: BTreeSet<String>,
    pub verdict: AuditVerdict,
}

pub fn load_config(path: Option<&Path>) -> Result<SandboxConfig> {
    match path {
        Some(path) => SandboxConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(SandboxConfig::default()),
    }
}

pub fn read_source(file: &Path) -> Result<String> {
    if file == Path::new("-") {
        let mut source = String::new();
        std::io::stdin()
            .read_to_string(&mut source)
            .context("Failed to read source from stdin")?;
        return Ok(source);
    }
    std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))
}

/// Parse, resolve and audit `source` without compiling it.
pub fn audit_source(
    config: &SandboxConfig,
    source: &str,
    deny: &[CapabilityDescriptor],
) -> std::result::Result<AuditReport, Vec<Diagnostic>> {
    let frontend = RustcFrontend::new(config.compiler.clone());
    let program = frontend.parse(source)?;
    let model = frontend.resolve(&program)?;
    let auditor = PolicyAuditor::new(config.denylist.iter().chain(deny).cloned());
    let verdict = auditor.audit(&model);
    Ok(AuditReport {
        call_sites: model.call_sites().to_vec(),
        namespaces: model.referenced_namespaces().clone(),
        verdict,
    })
}

/// Process exit status for a finished session.
pub fn exit_status(result: &ExecutionResult) -> u8 {
    match result {
        ExecutionResult::Completed { exit_code } => (*exit_code & 0xff) as u8,
        ExecutionResult::PolicyViolation { .. } => EXIT_POLICY_VIOLATION,
        ExecutionResult::CompileFailed { .. } => EXIT_COMPILE_FAILED,
        ExecutionResult::TimedOut => EXIT_TIMED_OUT,
        ExecutionResult::NotRun => 1,
    }
}

pub async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Run(args) => {
            if let Some(timeout_ms) = args.timeout_ms {
                config = config.with_timeout(Duration::from_millis(timeout_ms));
            }
            let source = read_source(&args.file)?;
            run_program(config, source, args).await
        }
        Command::Audit(args) => {
            let source = read_source(&args.file)?;
            audit_program(&config, &source, &args)
        }
    }
}

async fn run_program(config: SandboxConfig, source: String, args: RunArgs) -> Result<ExitCode> {
    let service =
        CodeExecutionService::new(config).context("Failed to start the execution service")?;
    let session = Session::new(source).with_denylist(args.deny);
    debug!("Running session {}", session.id());

    let report = service.execute(session).await.context("Session failed")?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(ExitCode::from(exit_status(&report.result)))
}

fn print_report(report: &SessionReport) {
    print!("{}", report.output);
    if let ExecutionResult::CompileFailed { diagnostics } = &report.result {
        for diagnostic in diagnostics {
            eprintln!("{}", diagnostic);
        }
    }
    eprintln!("{} ({} ms)", report.result, report.elapsed.as_millis());
}

fn audit_program(config: &SandboxConfig, source: &str, args: &AuditArgs) -> Result<ExitCode> {
    let report = match audit_source(config, source, &args.deny) {
        Ok(report) => report,
        Err(diagnostics) => {
            for diagnostic in &diagnostics {
                eprintln!("{}", diagnostic);
            }
            return Ok(ExitCode::from(EXIT_COMPILE_FAILED));
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for site in &report.call_sites {
            println!("{:?}\t{}", site.kind, site);
        }
        match &report.verdict {
            AuditVerdict::Passed { scanned } => {
                eprintln!("passed ({} call sites checked)", scanned)
            }
            AuditVerdict::Violation {
                call_site,
                descriptor,
            } => eprintln!("violation: {} is denied by {}", call_site, descriptor),
            AuditVerdict::Unresolved { call_site } => {
                eprintln!("violation: {} could not be resolved", call_site)
            }
        }
    }

    Ok(if report.verdict.is_violation() {
        ExitCode::from(EXIT_POLICY_VIOLATION)
    } else {
        ExitCode::SUCCESS
    })
}
