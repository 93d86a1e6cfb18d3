//! Structured run diagnostics, distinct from the process logger.
//!
//! Every pass and the orchestrator append ordered records here; the final
//! `ProtectionResult` carries the full sequence.

use serde_json::Value;

/// Well-known diagnostic codes.
pub mod codes {
    /// A pass was skipped because `can_apply` returned false.
    pub const PASS_SKIPPED: &str = "ORC001";
    /// A pass raised a failure and was recorded as not applied.
    pub const PASS_FAILED: &str = "ORC002";
    /// The enabled passes form a dependency cycle.
    pub const CONFIGURATION_CYCLE: &str = "ORC003";
    /// A reflection-style string literal names a renamed member.
    pub const REFLECTION_REFERENCE: &str = "RN001";
    /// Count of renamed members.
    pub const RENAME_SUMMARY: &str = "RN002";
    /// Count of encrypted string literals.
    pub const STRINGS_ENCRYPTED: &str = "SE001";
    /// A method could not be flattened and was reverted.
    pub const FLATTEN_REVERTED: &str = "CF001";
    /// A try region straddles shuffled blocks; the method was skipped.
    pub const REGION_STRADDLE: &str = "CF002";
    /// Count of methods that received debugger probes.
    pub const PROBES_INJECTED: &str = "AD001";
    /// The emitted module failed a post-condition check.
    pub const POST_CONDITION: &str = "FIN001";
}

/// Severity of a [`Diagnostic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// One structured record produced during a protection run.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: &'static str,
    pub message: String,
    /// Optional structured payload (method names, counts, raw errors).
    pub payload: Option<Value>,
}

impl Diagnostic {
    pub fn info(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            code,
            message: message.into(),
            payload: None,
        }
    }

    pub fn warning(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            code,
            message: message.into(),
            payload: None,
        }
    }

    pub fn error(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            code,
            message: message.into(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
    }

    #[test]
    fn payload_round_trips() {
        let diag = Diagnostic::warning(codes::FLATTEN_REVERTED, "reverted")
            .with_payload(serde_json::json!({ "method": "T::M" }));
        assert_eq!(diag.payload.unwrap()["method"], "T::M");
    }
}
