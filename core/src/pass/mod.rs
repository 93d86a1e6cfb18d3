//! Pass infrastructure.
//!
//! Each pass declares scheduling metadata (priority, dependencies,
//! conflicts) alongside an applicability test and the mutation itself. The
//! registry assembles the enabled set from the configuration; the
//! [`orchestrator`] resolves a valid order and supervises execution.

pub mod anti_debug;
pub mod control_flow;
pub mod orchestrator;
pub mod renaming;
pub mod string_encryption;
pub mod watermark;

use crate::context::ProtectionContext;
use crate::error::PassError;
use crate::module::Module;
use modshield_config::ProtectionConfig;

pub use anti_debug::AntiDebugPass;
pub use control_flow::ControlFlowPass;
pub use orchestrator::{Orchestrator, PassRecord};
pub use renaming::RenamingPass;
pub use string_encryption::StringEncryptionPass;
pub use watermark::WatermarkPass;

/// One orchestrator-scheduled transformation unit.
pub trait Pass {
    /// Stable identifier, unique within a run.
    fn id(&self) -> &'static str;

    /// Human-readable name.
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Higher priority schedules earlier among order-equivalent passes.
    fn priority(&self) -> i32 {
        0
    }

    /// Ids that must have completed before this pass runs.
    fn dependencies(&self) -> &[&'static str] {
        &[]
    }

    /// Ids that, when enabled, must execute *before* this pass so their
    /// output is this pass's input.
    fn conflicts_with(&self) -> &[&'static str] {
        &[]
    }

    /// Whether the pass has anything to do on this module. A false here is
    /// a skip with an info diagnostic, not an error.
    fn can_apply(&self, module: &Module) -> bool;

    /// Perform the mutation. Failures are supervised by the orchestrator;
    /// a failing pass must stay atomic per method and never leave the
    /// module globally unusable.
    fn apply(&self, module: &mut Module, ctx: &mut ProtectionContext) -> Result<(), PassError>;
}

/// The passes enabled by the configuration switches, in registration order.
pub fn registry_for(config: &ProtectionConfig) -> Vec<Box<dyn Pass>> {
    let mut passes: Vec<Box<dyn Pass>> = Vec::new();
    if config.enable_renaming {
        passes.push(Box::new(RenamingPass));
    }
    if config.enable_string_encryption {
        passes.push(Box::new(StringEncryptionPass));
    }
    if config.enable_control_flow {
        passes.push(Box::new(ControlFlowPass));
    }
    if config.enable_anti_debug || config.enable_anti_tamper {
        passes.push(Box::new(AntiDebugPass));
    }
    if config.enable_watermarking {
        passes.push(Box::new(WatermarkPass));
    }
    passes
}

#[cfg(test)]
mod tests {
    use super::*;
    use modshield_config::ProtectionLevel;

    #[test]
    fn registry_follows_the_switches() {
        let all = registry_for(&ProtectionConfig::default());
        let ids: Vec<_> = all.iter().map(|p| p.id()).collect();
        assert_eq!(
            ids,
            vec![
                "renaming",
                "string-encryption",
                "control-flow",
                "anti-debug",
                "watermark"
            ]
        );

        let none = registry_for(&ProtectionConfig::with_level(ProtectionLevel::None));
        assert!(none.is_empty());
    }

    #[test]
    fn pass_ids_are_distinct() {
        let passes = registry_for(&ProtectionConfig::default());
        let mut ids: Vec<_> = passes.iter().map(|p| p.id()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), passes.len());
    }
}
