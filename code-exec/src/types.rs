use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// A resolved type (or module) path with optional generic arguments.
///
/// Paths are stored in normalised form: no leading `::`, no whitespace, and
/// `core::`/`alloc::` rewritten to `std::` so re-exports compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeRef {
    pub path: String,
    pub generic_args: Vec<TypeRef>,
}

impl TypeRef {
    pub fn new(path: impl AsRef<str>) -> Self {
        Self {
            path: normalize_path(path.as_ref()),
            generic_args: Vec::new(),
        }
    }

    pub fn with_args(path: impl AsRef<str>, generic_args: Vec<TypeRef>) -> Self {
        Self {
            path: normalize_path(path.as_ref()),
            generic_args,
        }
    }

    pub fn is_generic(&self) -> bool {
        !self.generic_args.is_empty()
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)?;
        if !self.generic_args.is_empty() {
            write!(f, "<")?;
            for (i, arg) in self.generic_args.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", arg)?;
            }
            write!(f, ">")?;
        }
        Ok(())
    }
}

impl FromStr for TypeRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parser = TypeParser { input: s, pos: 0 };
        let ty = parser.parse_type()?;
        parser.skip_ws();
        if parser.pos != s.len() {
            return Err(Error::InvalidDescriptor(format!(
                "unexpected trailing input in '{}'",
                s
            )));
        }
        Ok(ty)
    }
}

/// Normalise a `::`-separated path for structural comparison.
pub fn normalize_path(path: &str) -> String {
    let compact: String = path.chars().filter(|c| !c.is_whitespace()).collect();
    let trimmed = compact.trim_start_matches("::");
    for root in ["core", "alloc"] {
        if trimmed == root {
            return "std".to_string();
        }
        if let Some(rest) = trimmed.strip_prefix(root).and_then(|r| r.strip_prefix("::")) {
            return format!("std::{}", rest);
        }
    }
    trimmed.to_string()
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_')
}

struct TypeParser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> TypeParser<'a> {
    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek() {
            if !c.is_whitespace() {
                break;
            }
            self.pos += c.len_utf8();
        }
    }

    fn parse_type(&mut self) -> Result<TypeRef, Error> {
        self.skip_ws();
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == ':' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
        let raw = &self.input[start..self.pos];
        let path = normalize_path(raw);
        if path.is_empty() || !path.split("::").all(is_identifier) {
            return Err(Error::InvalidDescriptor(format!(
                "invalid type path '{}' in '{}'",
                raw, self.input
            )));
        }

        self.skip_ws();
        let mut generic_args = Vec::new();
        if self.peek() == Some('<') {
            self.pos += 1;
            loop {
                generic_args.push(self.parse_type()?);
                self.skip_ws();
                match self.peek() {
                    Some(',') => self.pos += 1,
                    Some('>') => {
                        self.pos += 1;
                        break;
                    }
                    _ => {
                        return Err(Error::InvalidDescriptor(format!(
                            "unterminated generic argument list in '{}'",
                            self.input
                        )))
                    }
                }
            }
        }

        Ok(TypeRef { path, generic_args })
    }
}

/// Identifies a disallowed capability: a type, optionally a generic
/// instantiation of it, optionally narrowed to one method.
///
/// Text form: `path::to::Type<Arg, ...>#method`, where the generic arguments
/// and the `#method` filter are both optional.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CapabilityDescriptor {
    pub ty: TypeRef,
    pub method: Option<String>,
}

impl CapabilityDescriptor {
    /// Block every call on `ty`.
    pub fn for_type(ty: TypeRef) -> Self {
        Self { ty, method: None }
    }

    /// Block only calls of `method` on `ty`.
    pub fn for_method(ty: TypeRef, method: impl Into<String>) -> Self {
        Self {
            ty,
            method: Some(method.into()),
        }
    }

    /// Whether `resolved` is this descriptor's type.
    ///
    /// A descriptor without generic arguments matches every instantiation;
    /// one with arguments requires the same arity and recursively matching
    /// arguments.
    pub fn matches_type(&self, resolved: &TypeRef) -> bool {
        type_matches(&self.ty, resolved)
    }

    /// Whether the call site falls under this descriptor.
    ///
    /// Besides calls on the type, a path naming the type itself matches:
    /// for whole-type descriptors always, and for method descriptors when the
    /// path is a value or sits in a macro body, where the eventual call is
    /// not visible.
    pub fn matches(&self, call: &CallSite) -> bool {
        let callee = call.callee_path();
        let (member, named) = match call.kind {
            // Generic arguments are not recovered from macro tokens.
            CallKind::Macro => (
                self.ty.path == call.container.path,
                self.ty.path == callee.path,
            ),
            _ => (self.matches_type(&call.container), self.matches_type(&callee)),
        };
        let method_allowed = self
            .method
            .as_deref()
            .map_or(true, |method| method == call.method);
        if member && method_allowed {
            return true;
        }
        match call.kind {
            CallKind::Method => false,
            CallKind::Path => named && self.method.is_none(),
            CallKind::Reference | CallKind::Macro => named,
        }
    }
}

fn type_matches(pattern: &TypeRef, resolved: &TypeRef) -> bool {
    if pattern.path != resolved.path {
        return false;
    }
    if pattern.generic_args.is_empty() {
        return true;
    }
    pattern.generic_args.len() == resolved.generic_args.len()
        && pattern
            .generic_args
            .iter()
            .zip(&resolved.generic_args)
            .all(|(p, r)| type_matches(p, r))
}

impl fmt::Display for CapabilityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ty)?;
        if let Some(method) = &self.method {
            write!(f, "#{}", method)?;
        }
        Ok(())
    }
}

impl FromStr for CapabilityDescriptor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ty, method) = match s.rsplit_once('#') {
            Some((ty, method)) => {
                let method = method.trim();
                if !is_identifier(method) {
                    return Err(Error::InvalidDescriptor(format!(
                        "invalid method filter '{}' in '{}'",
                        method, s
                    )));
                }
                (ty, Some(method.to_string()))
            }
            None => (s, None),
        };
        Ok(Self {
            ty: ty.parse()?,
            method,
        })
    }
}

impl TryFrom<String> for CapabilityDescriptor {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CapabilityDescriptor> for String {
    fn from(value: CapabilityDescriptor) -> Self {
        value.to_string()
    }
}

/// How a call site was written in the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    /// `Type::method(..)` or an imported function called by name.
    Path,
    /// `receiver.method(..)` with a receiver of known type.
    Method,
    /// A function path used as a value, e.g. `let f = std::fs::remove_file;`.
    Reference,
    /// A path inside a macro body that is not a list of expressions, such as
    /// a `macro_rules!` definition.
    Macro,
}

/// A resolved reference found while walking the program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    #[serde(with = "type_ref_serde")]
    pub container: TypeRef,
    pub method: String,
    pub kind: CallKind,
    pub line: usize,
    pub column: usize,
}

impl CallSite {
    /// The item the call site names, e.g. `std::fs::File` for a reference to
    /// `File` inside `std::fs`.
    pub fn callee_path(&self) -> TypeRef {
        TypeRef::new(format!("{}::{}", self.container.path, self.method))
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}::{} at {}:{}",
            self.container, self.method, self.line, self.column
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Note,
    Help,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Note => write!(f, "note"),
            Severity::Help => write!(f, "help"),
        }
    }
}

/// A compiler message surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub line: Option<usize>,
    #[serde(default)]
    pub column: Option<usize>,
    /// Human-readable rendering as produced by the compiler, if any.
    #[serde(default)]
    pub rendered: Option<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            code: None,
            line: None,
            column: None,
            rendered: None,
        }
    }

    pub fn at(mut self, line: usize, column: usize) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(rendered) = &self.rendered {
            return write!(f, "{}", rendered.trim_end());
        }
        write!(f, "{}", self.severity)?;
        if let Some(code) = &self.code {
            write!(f, "[{}]", code)?;
        }
        write!(f, ": {}", self.message)?;
        if let (Some(line), Some(column)) = (self.line, self.column) {
            write!(f, " (line {}, column {})", line, column)?;
        }
        Ok(())
    }
}

/// Terminal outcome of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResult {
    NotRun,
    PolicyViolation { call_site: CallSite },
    CompileFailed { diagnostics: Vec<Diagnostic> },
    Completed { exit_code: i32 },
    TimedOut,
}

impl ExecutionResult {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionResult::NotRun)
    }

    /// True only for a run that completed with exit code zero.
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Completed { exit_code: 0 })
    }

    pub fn status(&self) -> &'static str {
        match self {
            ExecutionResult::NotRun => "not_run",
            ExecutionResult::PolicyViolation { .. } => "policy_violation",
            ExecutionResult::CompileFailed { .. } => "compile_failed",
            ExecutionResult::Completed { .. } => "completed",
            ExecutionResult::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionResult::NotRun => write!(f, "not run"),
            ExecutionResult::PolicyViolation { call_site } => {
                write!(f, "policy violation: {} is blocked", call_site)
            }
            ExecutionResult::CompileFailed { diagnostics } => {
                write!(f, "compilation failed with {} diagnostic(s)", diagnostics.len())
            }
            ExecutionResult::Completed { exit_code } => {
                write!(f, "completed with exit code {}", exit_code)
            }
            ExecutionResult::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Pipeline stage a session is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Pending,
    Parsing,
    Auditing,
    Building,
    Executing,
    Finished,
}

/// Resource limits applied to the sandboxed process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Maximum CPU time (seconds)
    pub cpu_time: u32,
    /// Maximum size of any file the program writes (bytes)
    pub file_size: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_time: 30,
            file_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

mod type_ref_serde {
    use super::TypeRef;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ty: &TypeRef, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(ty)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<TypeRef, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// `Duration` as whole milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(container: &str, method: &str) -> CallSite {
        CallSite {
            container: container.parse().unwrap(),
            method: method.to_string(),
            kind: CallKind::Path,
            line: 1,
            column: 0,
        }
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("::std::fs::File"), "std::fs::File");
        assert_eq!(normalize_path("core::cell::RefCell"), "std::cell::RefCell");
        assert_eq!(normalize_path("alloc :: vec :: Vec"), "std::vec::Vec");
        assert_eq!(normalize_path("corefoo::Bar"), "corefoo::Bar");
    }

    #[test]
    fn test_descriptor_parsing() {
        let desc: CapabilityDescriptor =
            "std::collections::HashMap<std::string::String, Vec<u8>>#insert"
                .parse()
                .unwrap();
        assert_eq!(desc.ty.path, "std::collections::HashMap");
        assert_eq!(desc.ty.generic_args.len(), 2);
        assert_eq!(desc.ty.generic_args[1].generic_args[0].path, "u8");
        assert_eq!(desc.method.as_deref(), Some("insert"));
        assert_eq!(
            desc.to_string(),
            "std::collections::HashMap<std::string::String, Vec<u8>>#insert"
        );
    }

    #[test]
    fn test_descriptor_parse_errors() {
        assert!("".parse::<CapabilityDescriptor>().is_err());
        assert!("std::fs::File#".parse::<CapabilityDescriptor>().is_err());
        assert!("Vec<u8".parse::<CapabilityDescriptor>().is_err());
        assert!("std:::fs".parse::<CapabilityDescriptor>().is_err());
        assert!("Vec<u8> extra".parse::<CapabilityDescriptor>().is_err());
    }

    #[test]
    fn test_structural_equality() {
        let a: CapabilityDescriptor = "std::vec::Vec<u8>".parse().unwrap();
        let b: CapabilityDescriptor = "::alloc::vec::Vec< u8 >".parse().unwrap();
        let c: CapabilityDescriptor = "std::vec::Vec<u16>".parse().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_whole_type_match() {
        let desc: CapabilityDescriptor = "std::fs::File".parse().unwrap();
        assert!(desc.matches(&site("std::fs::File", "open")));
        assert!(desc.matches(&site("std::fs::File", "create")));
        assert!(!desc.matches(&site("std::fs::OpenOptions", "new")));
    }

    #[test]
    fn test_method_filter_match() {
        let desc: CapabilityDescriptor = "std::fs::File#create".parse().unwrap();
        assert!(desc.matches(&site("std::fs::File", "create")));
        assert!(!desc.matches(&site("std::fs::File", "open")));
    }

    #[test]
    fn test_generic_match() {
        let open: CapabilityDescriptor = "std::collections::HashMap".parse().unwrap();
        let closed: CapabilityDescriptor = "std::collections::HashMap<std::string::String, u32>"
            .parse()
            .unwrap();

        let instantiated = site("std::collections::HashMap<std::string::String, u32>", "new");
        let other = site("std::collections::HashMap<u32, u32>", "new");
        let inferred = site("std::collections::HashMap", "new");

        assert!(open.matches(&instantiated));
        assert!(open.matches(&inferred));
        assert!(closed.matches(&instantiated));
        assert!(!closed.matches(&other));
        assert!(!closed.matches(&inferred));
    }

    #[test]
    fn test_paths_naming_the_type() {
        let whole: CapabilityDescriptor = "std::fs::File".parse().unwrap();
        let open: CapabilityDescriptor = "std::fs::File#open".parse().unwrap();

        let mut named = site("std::fs", "File");
        assert!(whole.matches(&named));
        assert!(!open.matches(&named));

        named.kind = CallKind::Reference;
        assert!(open.matches(&named));
        named.kind = CallKind::Macro;
        assert!(open.matches(&named));

        let mut method = site("std::fs", "File");
        method.kind = CallKind::Method;
        assert!(!whole.matches(&method));

        let closed: CapabilityDescriptor = "std::vec::Vec<std::string::String>".parse().unwrap();
        let mut in_macro = site("std::vec::Vec", "new");
        in_macro.kind = CallKind::Macro;
        assert!(closed.matches(&in_macro));
        assert!(!closed.matches(&site("std::vec::Vec", "new")));
    }

    #[test]
    fn test_descriptor_serde() {
        let descs: Vec<CapabilityDescriptor> =
            serde_json::from_str(r#"["std::fs::File", "std::process::Command#new"]"#).unwrap();
        assert_eq!(descs[1].method.as_deref(), Some("new"));
        let json = serde_json::to_string(&descs).unwrap();
        assert_eq!(json, r#"["std::fs::File","std::process::Command#new"]"#);
        assert!(serde_json::from_str::<CapabilityDescriptor>(r#""bad path!""#).is_err());
    }

    #[test]
    fn test_execution_result_serde() {
        let result = ExecutionResult::Completed { exit_code: 3 };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["exit_code"], 3);
        assert!(!result.is_success());
        assert!(ExecutionResult::Completed { exit_code: 0 }.is_success());
        assert!(!ExecutionResult::NotRun.is_terminal());
    }
}
