//! The protection run entry point.
//!
//! `Protector::protect` is the sole way in: it validates the inputs, loads
//! the module through the codec, schedules and runs the enabled passes,
//! finalizes, and writes the output. Fatal conditions before any mutation
//! (missing input, configuration cycles) are folded into a failed
//! [`ProtectionResult`]; only a full-debug-mode re-raise propagates as
//! `Err`.

use crate::context::ProtectionContext;
use crate::diagnostics::{codes, Diagnostic};
use crate::error::ProtectionError;
use crate::finalize;
use crate::module::{BincodeModuleIo, ModuleIo};
use crate::pass::{registry_for, Orchestrator, PassRecord};
use modshield_config::ProtectionConfig;
use std::path::Path;
use std::time::{Duration, Instant};

/// Aggregated outcome of one protection run.
#[derive(Debug)]
pub struct ProtectionResult {
    /// True when no error was recorded anywhere in the run.
    pub success: bool,
    /// Ids of passes whose `apply` completed, in execution order.
    pub applied: Vec<String>,
    /// Fatal and per-pass errors, in occurrence order.
    pub errors: Vec<ProtectionError>,
    /// Wall-clock duration of the whole run.
    pub duration: Duration,
    /// Per-pass execution records.
    pub passes: Vec<PassRecord>,
    /// The ordered diagnostics sequence.
    pub diagnostics: Vec<Diagnostic>,
}

impl ProtectionResult {
    fn failed(error: ProtectionError, diagnostics: Vec<Diagnostic>, started: Instant) -> Self {
        Self {
            success: false,
            applied: Vec::new(),
            errors: vec![error],
            duration: started.elapsed(),
            passes: Vec::new(),
            diagnostics,
        }
    }
}

/// Drives protection runs through a module codec.
pub struct Protector {
    io: Box<dyn ModuleIo>,
}

impl Default for Protector {
    fn default() -> Self {
        Self::new()
    }
}

impl Protector {
    /// A protector over the default bincode/zstd codec.
    pub fn new() -> Self {
        Self {
            io: Box::new(BincodeModuleIo::new()),
        }
    }

    /// A protector over a custom codec.
    pub fn with_io(io: Box<dyn ModuleIo>) -> Self {
        Self { io }
    }

    /// Run the full pipeline over the module at `input`.
    ///
    /// Returns `Err` only when debug mode is `Full` and a pass failure was
    /// re-raised; every other failure is reported through the result.
    pub fn protect(
        &self,
        input: &Path,
        config: ProtectionConfig,
    ) -> Result<ProtectionResult, ProtectionError> {
        let started = Instant::now();
        log::info!("protecting `{}`", input.display());

        let mut ctx = match ProtectionContext::new(config) {
            Ok(ctx) => ctx,
            Err(e) => {
                log::error!("invalid configuration: {e}");
                return Ok(ProtectionResult::failed(e, Vec::new(), started));
            }
        };
        let output = ctx
            .config
            .output_path
            .clone()
            .expect("context construction validated the output path");

        let mut module = match self.io.load(input) {
            Ok(module) => module,
            Err(e) => {
                log::error!("failed to load `{}`: {e}", input.display());
                return Ok(ProtectionResult::failed(
                    e.into(),
                    ctx.take_diagnostics(),
                    started,
                ));
            }
        };

        let orchestrator = Orchestrator::new(registry_for(&ctx.config));
        // Resolve the order before touching the module so a configuration
        // cycle aborts with zero mutations.
        if let Err(e) = orchestrator.execution_order() {
            ctx.add_diagnostic(Diagnostic::error(codes::CONFIGURATION_CYCLE, e.to_string()));
            return Ok(ProtectionResult::failed(e, ctx.take_diagnostics(), started));
        }

        let (passes, mut errors) = orchestrator.run(&mut module, &mut ctx)?;

        let post_conditions = finalize::finalize_module(&mut module, &ctx);
        finalize::report_post_conditions(&mut ctx, &post_conditions);
        errors.extend(post_conditions);

        // The module is written even when post-conditions failed; only a
        // write failure leaves no output guarantees.
        if let Err(e) = self.io.write(&module, &output) {
            log::error!("failed to write `{}`: {e}", output.display());
            errors.push(ProtectionError::Write(e));
        } else {
            log::info!("protected module written to `{}`", output.display());
            self.emit_mapping_file(&mut ctx, &output);
        }

        let success = errors.is_empty();
        Ok(ProtectionResult {
            success,
            applied: ctx.applied().map(str::to_owned).collect(),
            errors,
            duration: started.elapsed(),
            passes,
            diagnostics: ctx.take_diagnostics(),
        })
    }

    /// Optional textual rename map beside the output. Failure to write it
    /// degrades to a warning; the protected module is already on disk.
    fn emit_mapping_file(&self, ctx: &mut ProtectionContext, output: &Path) {
        if !ctx.config.renaming.generate_mapping_file || ctx.rename_map.is_empty() {
            return;
        }
        let path = output.with_extension("map");
        let mut contents = String::new();
        for (original, renamed) in ctx.rename_map.iter() {
            contents.push_str(original);
            contents.push_str(" -> ");
            contents.push_str(renamed);
            contents.push('\n');
        }
        if let Err(e) = std::fs::write(&path, contents) {
            log::warn!("failed to write mapping file `{}`: {e}", path.display());
            ctx.warning(
                codes::RENAME_SUMMARY,
                format!("mapping file `{}` could not be written: {e}", path.display()),
            );
        } else {
            log::info!("rename map written to `{}`", path.display());
        }
    }
}
