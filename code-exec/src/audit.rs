use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    frontend::SemanticModel,
    types::{CallSite, CapabilityDescriptor},
};

/// Outcome of checking a program against a denylist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum AuditVerdict {
    Passed {
        scanned: usize,
    },
    Violation {
        call_site: CallSite,
        descriptor: CapabilityDescriptor,
    },
    /// A call into the program itself that resolution could not follow, so
    /// it may hide a denied capability.
    Unresolved {
        call_site: CallSite,
    },
}

impl AuditVerdict {
    /// Whether the program was rejected.
    pub fn is_violation(&self) -> bool {
        self.offending_call_site().is_some()
    }

    pub fn offending_call_site(&self) -> Option<&CallSite> {
        match self {
            AuditVerdict::Passed { .. } => None,
            AuditVerdict::Violation { call_site, .. } | AuditVerdict::Unresolved { call_site } => {
                Some(call_site)
            }
        }
    }
}

/// Rejects programs whose call sites resolve to a denied capability.
#[derive(Debug, Clone, Default)]
pub struct PolicyAuditor {
    denylist: Vec<CapabilityDescriptor>,
}

impl PolicyAuditor {
    pub fn new(denylist: impl IntoIterator<Item = CapabilityDescriptor>) -> Self {
        let mut unique: Vec<CapabilityDescriptor> = Vec::new();
        for descriptor in denylist {
            if !unique.contains(&descriptor) {
                unique.push(descriptor);
            }
        }
        Self { denylist: unique }
    }

    pub fn denylist(&self) -> &[CapabilityDescriptor] {
        &self.denylist
    }

    /// Scan call sites in source order and stop at the first denied one.
    ///
    /// With a non-empty denylist, a call to a local path that resolution
    /// could not follow rejects the program as well.
    pub fn audit(&self, model: &SemanticModel) -> AuditVerdict {
        let sites = model.call_sites();
        if self.denylist.is_empty() {
            debug!("Empty denylist, skipping {} call sites", sites.len());
            return AuditVerdict::Passed { scanned: 0 };
        }

        let denied: Vec<CapabilityDescriptor> = self
            .denylist
            .iter()
            .map(|d| CapabilityDescriptor {
                ty: model.canonical_type(&d.ty),
                method: d.method.clone(),
            })
            .collect();

        for (scanned, site) in sites.iter().enumerate() {
            if let Some(descriptor) = denied.iter().find(|d| d.matches(site)) {
                warn!(
                    "Denied call {} matched {} after {} call sites",
                    site, descriptor, scanned
                );
                return AuditVerdict::Violation {
                    call_site: site.clone(),
                    descriptor: descriptor.clone(),
                };
            }
            if model.is_unresolved(site) {
                warn!("Rejecting unresolved local call {}", site);
                return AuditVerdict::Unresolved {
                    call_site: site.clone(),
                };
            }
        }

        debug!("Audit passed, {} call sites scanned", sites.len());
        AuditVerdict::Passed {
            scanned: sites.len(),
        }
    }
}
