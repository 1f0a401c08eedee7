//! Resolution of the libraries a program is compiled against.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::debug;

use crate::{config::LibraryAllowList, error::Error, Result};

/// A compiled library handed to the compiler as `--extern name=path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryReference {
    pub name: String,
    pub path: PathBuf,
}

#[cfg_attr(test, mockall::automock)]
pub trait ReferenceProvider: Send + Sync {
    /// Libraries to link for a program that references `namespaces`.
    fn references(&self, namespaces: &BTreeSet<String>) -> Result<Vec<LibraryReference>>;
}

fn crate_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"))
}

/// Provider backed by the configured library allow-list.
///
/// Platform crates are always referenced. Other crates are referenced only
/// when the program names them; namespaces outside the allow-list are left
/// for the compiler to reject.
#[derive(Debug, Clone)]
pub struct AllowListProvider {
    allow_list: LibraryAllowList,
}

impl AllowListProvider {
    pub fn new(allow_list: &LibraryAllowList) -> Result<Self> {
        for name in allow_list.crates.keys() {
            if !crate_name_pattern().is_match(name) {
                return Err(Error::InvalidReference(format!(
                    "'{}' is not a valid crate name",
                    name
                )));
            }
        }
        for name in &allow_list.platform {
            if !allow_list.crates.contains_key(name) {
                return Err(Error::InvalidReference(format!(
                    "platform crate '{}' has no library path",
                    name
                )));
            }
        }
        Ok(Self {
            allow_list: allow_list.clone(),
        })
    }

    /// Version label of the configured library set.
    pub fn version(&self) -> &str {
        &self.allow_list.version
    }

    fn reference(&self, name: &str) -> Result<Option<LibraryReference>> {
        let Some(path) = self.allow_list.crates.get(name) else {
            return Ok(None);
        };
        if !path.is_file() {
            return Err(Error::InvalidReference(format!(
                "library for '{}' not found at {}",
                name,
                path.display()
            )));
        }
        Ok(Some(LibraryReference {
            name: name.to_string(),
            path: path.clone(),
        }))
    }
}

impl ReferenceProvider for AllowListProvider {
    fn references(&self, namespaces: &BTreeSet<String>) -> Result<Vec<LibraryReference>> {
        let mut names: Vec<&str> = self.allow_list.platform.iter().map(String::as_str).collect();
        for namespace in namespaces {
            if !names.contains(&namespace.as_str()) {
                names.push(namespace);
            }
        }

        let mut references = Vec::with_capacity(names.len());
        for name in names {
            match self.reference(name)? {
                Some(reference) => references.push(reference),
                None => debug!("Namespace '{}' is not in the library allow-list", name),
            }
        }
        Ok(references)
    }
}
