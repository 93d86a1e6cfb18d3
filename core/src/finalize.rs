//! Post-pass canonicalisation: branch-width simplify/optimise, debug-symbol
//! dropping and the emit-time post-condition checks.
//!
//! `simplify_branches` widens every macro form so instruction insertion can
//! never invalidate an encoded displacement; `optimize_branches` narrows
//! them back where the final layout allows. The control-flow pass uses the
//! same two helpers around its surgery.

use crate::context::ProtectionContext;
use crate::diagnostics::codes;
use crate::error::ProtectionError;
use crate::module::{InstrId, MethodBody, Module, Opcode, Operand};
use modshield_config::{DebugMode, OptimizationLevel};
use std::collections::HashMap;

/// Short branch instructions are two bytes under the width model.
const SHORT_BRANCH_SIZE: u32 = 2;

/// Expand every short-form opcode to its long encoding.
pub fn simplify_branches(body: &mut MethodBody) {
    for instruction in &mut body.instructions {
        instruction.opcode = instruction.opcode.long_form();
    }
}

/// Narrow long forms back to short where the encoded displacement fits.
/// Narrowing only shrinks the layout, so the fix-point converges.
pub fn optimize_branches(body: &mut MethodBody) {
    loop {
        let offsets = body.offsets();
        let index_of: HashMap<InstrId, usize> = body
            .instructions
            .iter()
            .enumerate()
            .map(|(i, instr)| (instr.id, i))
            .collect();
        let mut narrowed = Vec::new();
        for (i, instruction) in body.instructions.iter().enumerate() {
            let Some(short) = instruction.opcode.short_form() else {
                continue;
            };
            match &instruction.operand {
                Operand::Target(target) => {
                    let Some(&ti) = index_of.get(target) else {
                        continue;
                    };
                    let end = i64::from(offsets[i] + SHORT_BRANCH_SIZE);
                    let displacement = i64::from(offsets[ti]) - end;
                    if (-128..=127).contains(&displacement) {
                        narrowed.push((i, short));
                    }
                }
                Operand::Int32(value) if instruction.opcode == Opcode::LdcI4 => {
                    if (-128..=127).contains(&i64::from(*value)) {
                        narrowed.push((i, short));
                    }
                }
                _ => {}
            }
        }
        if narrowed.is_empty() {
            break;
        }
        for (i, short) in narrowed {
            body.instructions[i].opcode = short;
        }
    }
}

/// Run the finalizer over the whole module. Returns post-condition errors;
/// the module is still written when only these fail.
pub fn finalize_module(module: &mut Module, ctx: &ProtectionContext) -> Vec<ProtectionError> {
    if ctx.config.optimization >= OptimizationLevel::Minimal {
        for body in module.bodies_mut() {
            simplify_branches(body);
            optimize_branches(body);
        }
    }

    let keep_symbols =
        ctx.config.preserve_debug_symbols || ctx.config.debug_mode == DebugMode::SymbolsOnly;
    if !keep_symbols {
        for body in module.bodies_mut() {
            body.sequence_points.clear();
        }
    }

    let mut errors = Vec::new();
    if module.types.is_empty() {
        errors.push(ProtectionError::PostCondition(
            "emitted module declares no types".to_owned(),
        ));
    }
    if let Some(entry) = module.entry_point {
        if module.method(entry).body.is_none() {
            errors.push(ProtectionError::PostCondition(format!(
                "entry point `{}` has no body",
                module.method_full_name(entry)
            )));
        }
    }
    errors
}

/// Record post-condition failures as error diagnostics.
pub fn report_post_conditions(ctx: &mut ProtectionContext, errors: &[ProtectionError]) {
    for error in errors {
        ctx.error(codes::POST_CONDITION, error.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Method, MethodFlags, MethodSig, TypeDef, TypeFlags, TypeSig};
    use modshield_config::ProtectionConfig;

    #[test]
    fn near_branches_narrow_and_far_branches_stay_long() {
        let mut body = MethodBody::new();
        let near = body.push(Opcode::Nop, Operand::None);
        body.push(Opcode::Br, Operand::Target(near));
        // Pad far enough that a branch over it cannot use an 8-bit
        // displacement.
        let far_branch = body.push(Opcode::Br, Operand::Target(InstrId(0)));
        for _ in 0..40 {
            body.push(Opcode::LdcI4, Operand::Int32(100_000));
            body.push(Opcode::Pop, Operand::None);
        }
        let far = body.push(Opcode::Ret, Operand::None);
        let position = body.position_of(far_branch).unwrap();
        body.instructions[position].operand = Operand::Target(far);

        optimize_branches(&mut body);
        assert_eq!(body.instructions[1].opcode, Opcode::BrS);
        let far_position = body.position_of(far_branch).unwrap();
        assert_eq!(body.instructions[far_position].opcode, Opcode::Br);
    }

    #[test]
    fn small_constants_narrow() {
        let mut body = MethodBody::new();
        body.push(Opcode::LdcI4, Operand::Int32(5));
        body.push(Opcode::LdcI4, Operand::Int32(100_000));
        body.push(Opcode::Ret, Operand::None);
        optimize_branches(&mut body);
        assert_eq!(body.instructions[0].opcode, Opcode::LdcI4S);
        assert_eq!(body.instructions[1].opcode, Opcode::LdcI4);
    }

    #[test]
    fn simplify_then_optimize_is_a_fix_point() {
        let mut body = MethodBody::new();
        let target = body.push(Opcode::Nop, Operand::None);
        body.push(Opcode::BrS, Operand::Target(target));
        body.push(Opcode::Ret, Operand::None);
        simplify_branches(&mut body);
        assert_eq!(body.instructions[1].opcode, Opcode::Br);
        optimize_branches(&mut body);
        let first = body.instructions.clone();
        simplify_branches(&mut body);
        optimize_branches(&mut body);
        assert_eq!(body.instructions, first);
    }

    fn finalize_ctx(optimization: OptimizationLevel) -> ProtectionContext {
        ProtectionContext::new(
            ProtectionConfig::builder()
                .output_path("o")
                .optimization(optimization)
                .build(),
        )
        .unwrap()
    }

    #[test]
    fn no_optimization_leaves_bodies_untouched() {
        let mut module = Module::new("demo");
        let ty = module.add_type(TypeDef::new("A", "T", TypeFlags::empty()));
        let mut body = MethodBody::new();
        let target = body.push(Opcode::Nop, Operand::None);
        body.push(Opcode::Br, Operand::Target(target));
        body.push(Opcode::Ret, Operand::None);
        let before = body.clone();
        module.add_method(
            Method::new("M", MethodFlags::STATIC, ty, MethodSig::new(vec![], TypeSig::Void))
                .with_body(body),
        );
        let ctx = finalize_ctx(OptimizationLevel::None);
        let errors = finalize_module(&mut module, &ctx);
        assert!(errors.is_empty());
        assert_eq!(
            module.methods[0].body.as_ref().unwrap().instructions,
            before.instructions
        );
    }

    #[test]
    fn sequence_points_drop_unless_preserved() {
        let mut module = Module::new("demo");
        let ty = module.add_type(TypeDef::new("A", "T", TypeFlags::empty()));
        let mut body = MethodBody::new();
        let id = body.push(Opcode::Ret, Operand::None);
        body.sequence_points.push(crate::module::SequencePoint {
            instruction: id,
            line: 3,
        });
        module.add_method(
            Method::new("M", MethodFlags::STATIC, ty, MethodSig::new(vec![], TypeSig::Void))
                .with_body(body),
        );
        let ctx = finalize_ctx(OptimizationLevel::Balanced);
        finalize_module(&mut module, &ctx);
        assert!(module.methods[0]
            .body
            .as_ref()
            .unwrap()
            .sequence_points
            .is_empty());
    }

    #[test]
    fn entry_point_without_body_fails_the_post_condition() {
        let mut module = Module::new("demo");
        let ty = module.add_type(TypeDef::new("A", "T", TypeFlags::empty()));
        let m = module.add_method(Method::new(
            "Main",
            MethodFlags::STATIC,
            ty,
            MethodSig::new(vec![], TypeSig::Void),
        ));
        module.entry_point = Some(m);
        let ctx = finalize_ctx(OptimizationLevel::None);
        let errors = finalize_module(&mut module, &ctx);
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], ProtectionError::PostCondition(_)));
    }
}
