use assert_fs::prelude::*;
use clap::Parser;
use code_exec::{AuditVerdict, ExecutionResult};
use code_sandbox::{
    audit_source, exit_status, load_config, read_source, Cli, Command, EXIT_COMPILE_FAILED,
    EXIT_POLICY_VIOLATION, EXIT_TIMED_OUT,
};
use std::time::Duration;

#[test]
fn test_parse_run_arguments() {
    let cli = Cli::try_parse_from([
        "code-sandbox",
        "run",
        "main.rs",
        "--deny",
        "std::fs::File",
        "-d",
        "std::process::Command#new",
        "--timeout-ms",
        "1500",
        "--json",
    ])
    .unwrap();

    match cli.command {
        Command::Run(args) => {
            assert_eq!(args.file.to_str(), Some("main.rs"));
            assert_eq!(args.deny.len(), 2);
            assert_eq!(args.deny[1].method.as_deref(), Some("new"));
            assert_eq!(args.timeout_ms, Some(1500));
            assert!(args.json);
        }
        other => panic!("unexpected command {:?}", other),
    }
}

#[test]
fn test_invalid_descriptor_is_rejected() {
    let result = Cli::try_parse_from(["code-sandbox", "audit", "-", "--deny", "std::fs::File<"]);
    assert!(result.is_err());
}

#[test]
fn test_global_config_flag() {
    let cli = Cli::try_parse_from(["code-sandbox", "audit", "main.rs", "--config", "sandbox.toml"])
        .unwrap();
    assert_eq!(cli.config.as_deref().and_then(|p| p.to_str()), Some("sandbox.toml"));
    assert!(matches!(cli.command, Command::Audit(_)));
}

#[test]
fn test_load_config_file() {
    let temp = assert_fs::TempDir::new().unwrap();
    let file = temp.child("sandbox.toml");
    file.write_str(
        r#"
        timeout_ms = 2000
        denylist = ["std::net::TcpStream"]

        [workspace]
        temp_root = "/tmp/sandboxes"
        "#,
    )
    .unwrap();

    let config = load_config(Some(file.path())).unwrap();
    assert_eq!(config.timeout(), Duration::from_millis(2000));
    assert_eq!(config.denylist.len(), 1);
    assert!(load_config(Some(&temp.path().join("missing.toml"))).is_err());
    assert_eq!(load_config(None).unwrap().timeout_ms, 3000);
}

#[test]
fn test_read_source_file() {
    let temp = assert_fs::TempDir::new().unwrap();
    let file = temp.child("main.rs");
    file.write_str("fn main() {}").unwrap();
    assert_eq!(read_source(file.path()).unwrap(), "fn main() {}");
    assert!(read_source(&temp.path().join("absent.rs")).is_err());
}

#[test]
fn test_audit_source() {
    let config = load_config(None).unwrap();
    let source = r#"
        use std::fs;
        fn main() {
            fs::remove_file("/tmp/x").ok();
        }
    "#;

    let report = audit_source(&config, source, &[]).unwrap();
    assert_eq!(report.call_sites.len(), 1);
    assert!(matches!(report.verdict, AuditVerdict::Passed { .. }));

    let deny = vec!["std::fs".parse().unwrap()];
    let report = audit_source(&config, source, &deny).unwrap();
    assert!(report.verdict.is_violation());

    let diagnostics = audit_source(&config, "fn main( {", &deny).unwrap_err();
    assert!(!diagnostics.is_empty());
}

#[test]
fn test_exit_status_mapping() {
    assert_eq!(exit_status(&ExecutionResult::Completed { exit_code: 0 }), 0);
    assert_eq!(exit_status(&ExecutionResult::Completed { exit_code: 3 }), 3);
    assert_eq!(exit_status(&ExecutionResult::TimedOut), EXIT_TIMED_OUT);
    assert_eq!(
        exit_status(&ExecutionResult::CompileFailed {
            diagnostics: vec![]
        }),
        EXIT_COMPILE_FAILED
    );
    let call_site = code_exec::CallSite {
        container: code_exec::TypeRef::new("std::fs::File"),
        method: "open".into(),
        kind: code_exec::CallKind::Path,
        line: 1,
        column: 1,
    };
    assert_eq!(
        exit_status(&ExecutionResult::PolicyViolation { call_site }),
        EXIT_POLICY_VIOLATION
    );
}
