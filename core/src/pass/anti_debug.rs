//! Anti-debug and anti-tamper probe injection.
//!
//! Synthesises a helper type holding platform-invoke declarations
//! (metadata-only), managed detection methods, a timing probe, the
//! integrity check with its transform-time baked checksum, and a corruption
//! method. The module static initialiser gains the startup check chain;
//! selected method bodies gain entry and periodic probes. Every injected
//! snippet nets zero on the evaluation stack.

use super::Pass;
use crate::context::ProtectionContext;
use crate::crypto;
use crate::diagnostics::codes;
use crate::error::PassError;
use crate::module::{
    InstrId, Instruction, MemberRef, Method, MethodBody, MethodFlags, MethodId, MethodSig, Module,
    Opcode, Operand, PInvokeInfo, TypeDef, TypeFlags, TypeId, TypeSig,
};
use crate::naming::{NameAllocator, NameIntent, NameScope};
use modshield_config::{AntiTamperMode, RenamingMode};

pub struct AntiDebugPass;

/// Handles to the synthesized helper members used during injection.
struct Helper {
    ty: TypeId,
    checks: Vec<MethodId>,
    quick_check: MethodId,
    corrupt: MethodId,
}

impl Pass for AntiDebugPass {
    fn id(&self) -> &'static str {
        "anti-debug"
    }

    fn name(&self) -> &'static str {
        "Anti-debug and tamper probes"
    }

    fn description(&self) -> &'static str {
        "Injects debugger-detection and integrity probes wired to a corruption routine"
    }

    fn priority(&self) -> i32 {
        40
    }

    fn conflicts_with(&self) -> &[&'static str] {
        // Probes must land in final bodies: after literal substitution and
        // after flattening.
        &["string-encryption", "control-flow"]
    }

    fn can_apply(&self, module: &Module) -> bool {
        module.methods.iter().any(|m| m.body.is_some()) || module.has_user_types()
    }

    fn apply(&self, module: &mut Module, ctx: &mut ProtectionContext) -> Result<(), PassError> {
        let helper = self.build_helper(module, ctx)?;
        self.inject_startup_chain(module, &helper);

        let mut probed = 0usize;
        if ctx.config.enable_anti_debug {
            let probability = match ctx.config.anti_tamper.mode {
                AntiTamperMode::None => 0,
                AntiTamperMode::Light => 30,
                AntiTamperMode::Normal => 60,
                AntiTamperMode::Heavy => 90,
            };
            probed = self.inject_method_probes(module, ctx, &helper, probability);
        }

        ctx.info(
            codes::PROBES_INJECTED,
            format!("startup checks installed; {probed} methods carry entry probes"),
        );
        Ok(())
    }
}

impl AntiDebugPass {
    /// Synthesise the helper type and all of its members. The integrity
    /// check compares against a checksum of the module as it stands when
    /// this pass runs.
    fn build_helper(
        &self,
        module: &mut Module,
        ctx: &mut ProtectionContext,
    ) -> Result<Helper, PassError> {
        let checksum = crypto::module_checksum(module);
        let baked = i64::from_le_bytes(
            checksum[..8]
                .try_into()
                .map_err(|_| PassError::new("checksum shorter than eight bytes"))?,
        );

        let mut allocator = NameAllocator::new(ctx.config.renaming.scheme, RenamingMode::Normal);
        let mut type_scope = NameScope::with_names(module.types.iter().map(|t| t.name.clone()));
        let type_name = allocator.mint(&mut ctx.rng, &mut type_scope, NameIntent::Type);
        let ty = module.add_type(TypeDef::new(
            "",
            type_name,
            TypeFlags::SEALED | TypeFlags::ABSTRACT,
        ));
        let mut members = NameScope::new();
        let mint =
            |ctx: &mut ProtectionContext, allocator: &mut NameAllocator, members: &mut NameScope| {
                allocator.mint(&mut ctx.rng, members, NameIntent::Method)
            };

        // Platform-invoke declarations: metadata only, no bodies.
        let pinvoke = |module: &mut Module, name: String, native: &str, entry: &str, params: usize, returns: bool| {
            let mut method = Method::new(
                name,
                MethodFlags::STATIC | MethodFlags::PINVOKE_IMPL,
                ty,
                MethodSig::new(vec![TypeSig::Object; params], if returns { TypeSig::Bool } else { TypeSig::Void }),
            );
            method.pinvoke = Some(PInvokeInfo {
                module: native.to_owned(),
                entry_point: entry.to_owned(),
            });
            module.add_method(method)
        };
        let native_present = pinvoke(
            module,
            mint(ctx, &mut allocator, &mut members),
            "kernel32.dll",
            "IsDebuggerPresent",
            0,
            true,
        );
        let remote_present = pinvoke(
            module,
            mint(ctx, &mut allocator, &mut members),
            "kernel32.dll",
            "CheckRemoteDebuggerPresent",
            2,
            true,
        );
        let current_process = pinvoke(
            module,
            mint(ctx, &mut allocator, &mut members),
            "kernel32.dll",
            "GetCurrentProcess",
            0,
            true,
        );
        let output_debug_string = pinvoke(
            module,
            mint(ctx, &mut allocator, &mut members),
            "kernel32.dll",
            "OutputDebugStringA",
            1,
            false,
        );
        pinvoke(
            module,
            mint(ctx, &mut allocator, &mut members),
            "ntdll.dll",
            "NtQueryInformationProcess",
            5,
            true,
        );

        let add_check = |module: &mut Module, name: String, body: MethodBody| {
            module.add_method(
                Method::new(name, MethodFlags::STATIC, ty, MethodSig::new(vec![], TypeSig::Bool))
                    .with_body(body),
            )
        };

        // Native probe.
        let mut body = MethodBody::new();
        body.push(Opcode::Call, Operand::Method(native_present));
        body.push(Opcode::Ret, Operand::None);
        let check_native = add_check(module, mint(ctx, &mut allocator, &mut members), body);

        // Managed attached flag.
        let mut body = MethodBody::new();
        body.push(
            Opcode::Call,
            Operand::Member(MemberRef::new("System.Diagnostics.Debugger", "get_IsAttached", 0, true)),
        );
        body.push(Opcode::Ret, Operand::None);
        let check_managed = add_check(module, mint(ctx, &mut allocator, &mut members), body);

        // Remote debugger over the current process handle.
        let mut body = MethodBody::new();
        body.push(Opcode::Call, Operand::Method(current_process));
        body.push(Opcode::LdcI4, Operand::Int32(0));
        body.push(Opcode::Call, Operand::Method(remote_present));
        body.push(Opcode::Ret, Operand::None);
        let check_remote = add_check(module, mint(ctx, &mut allocator, &mut members), body);

        // Process-environment-block flag; the native query itself is the
        // p-invoke above, the managed fallback reports clean.
        let mut body = MethodBody::new();
        body.push(Opcode::LdcI4, Operand::Int32(0));
        body.push(Opcode::Ret, Operand::None);
        let check_peb = add_check(module, mint(ctx, &mut allocator, &mut members), body);

        // Heap-flag anomaly over the process handle.
        let mut body = MethodBody::new();
        body.push(Opcode::Call, Operand::Method(current_process));
        body.push(Opcode::Pop, Operand::None);
        body.push(Opcode::LdcI4, Operand::Int32(0));
        body.push(Opcode::Ret, Operand::None);
        let check_heap = add_check(module, mint(ctx, &mut allocator, &mut members), body);

        // Output-debug-string trick: without a debugger the call fails and
        // the last error stays set.
        let mut body = MethodBody::new();
        body.push(Opcode::LdStr, Operand::Str(ctx.rng.next_string(12)));
        body.push(Opcode::Call, Operand::Method(output_debug_string));
        body.push(
            Opcode::Call,
            Operand::Member(MemberRef::new(
                "System.Runtime.InteropServices.Marshal",
                "GetLastWin32Error",
                0,
                true,
            )),
        );
        body.push(Opcode::LdcI4, Operand::Int32(0));
        body.push(Opcode::Ceq, Operand::None);
        body.push(Opcode::Ret, Operand::None);
        let check_ods = add_check(module, mint(ctx, &mut allocator, &mut members), body);

        // Trap flag: single-step detection is a design-extension point.
        let mut body = MethodBody::new();
        body.push(Opcode::LdcI4, Operand::Int32(0));
        body.push(Opcode::Ret, Operand::None);
        let check_trap = add_check(module, mint(ctx, &mut allocator, &mut members), body);

        // Parent-process name against known debugger hosts.
        let mut body = MethodBody::new();
        let name_local = body.add_local(TypeSig::Str);
        body.push(
            Opcode::Call,
            Operand::Member(MemberRef::new(
                "System.Diagnostics.Process",
                "GetParentProcessName",
                0,
                true,
            )),
        );
        body.push(Opcode::Stloc, Operand::Local(name_local));
        let contains = MemberRef::new("System.String", "Contains", 2, true);
        for (i, needle) in ["dbg", "ida", "dnspy"].iter().enumerate() {
            body.push(Opcode::Ldloc, Operand::Local(name_local));
            body.push(Opcode::LdStr, Operand::Str((*needle).to_owned()));
            body.push(Opcode::Call, Operand::Member(contains.clone()));
            if i > 0 {
                body.push(Opcode::Or, Operand::None);
            }
        }
        body.push(Opcode::Ret, Operand::None);
        let check_parent = add_check(module, mint(ctx, &mut allocator, &mut members), body);

        // Timing analysis over consecutive tick samples.
        let mut body = MethodBody::new();
        let ticks = MemberRef::new("System.Environment", "get_TickCount", 0, true);
        body.push(Opcode::Call, Operand::Member(ticks.clone()));
        body.push(Opcode::Call, Operand::Member(ticks));
        body.push(Opcode::Sub, Operand::None);
        body.push(Opcode::Neg, Operand::None);
        body.push(Opcode::LdcI4, Operand::Int32(500));
        body.push(Opcode::Cgt, Operand::None);
        body.push(Opcode::Ret, Operand::None);
        let check_timing = add_check(module, mint(ctx, &mut allocator, &mut members), body);

        // Environment artefacts left by managed profilers and debuggers.
        let mut body = MethodBody::new();
        body.push(Opcode::LdStr, Operand::Str("COR_ENABLE_PROFILING".to_owned()));
        body.push(
            Opcode::Call,
            Operand::Member(MemberRef::new(
                "System.Environment",
                "GetEnvironmentVariable",
                1,
                true,
            )),
        );
        body.push(
            Opcode::Call,
            Operand::Member(MemberRef::new("System.String", "IsNullOrEmpty", 1, true)),
        );
        body.push(Opcode::LdcI4, Operand::Int32(0));
        body.push(Opcode::Ceq, Operand::None);
        body.push(Opcode::Ret, Operand::None);
        let check_environment = add_check(module, mint(ctx, &mut allocator, &mut members), body);

        // Checksum computation plus the comparison against the baked value.
        let mut body = MethodBody::new();
        body.push(
            Opcode::Call,
            Operand::Member(MemberRef::new("System.Reflection.Module", "ComputeChecksum", 0, true)),
        );
        body.push(Opcode::Ret, Operand::None);
        let compute_checksum = module.add_method(
            Method::new(
                mint(ctx, &mut allocator, &mut members),
                MethodFlags::STATIC,
                ty,
                MethodSig::new(vec![], TypeSig::Int64),
            )
            .with_body(body),
        );

        let mut body = MethodBody::new();
        body.push(Opcode::Call, Operand::Method(compute_checksum));
        body.push(Opcode::LdcI8, Operand::Int64(baked));
        body.push(Opcode::Ceq, Operand::None);
        body.push(Opcode::LdcI4, Operand::Int32(0));
        body.push(Opcode::Ceq, Operand::None);
        body.push(Opcode::Ret, Operand::None);
        let check_integrity = add_check(module, mint(ctx, &mut allocator, &mut members), body);

        // Corruption: fault the process, or exit when configured to be
        // polite about it.
        let mut body = MethodBody::new();
        if ctx.config.anti_tamper.corrupt_on_tamper {
            body.push(Opcode::LdNull, Operand::None);
            body.push(Opcode::Throw, Operand::None);
        } else {
            body.push(Opcode::LdcI4, Operand::Int32(1));
            body.push(
                Opcode::Call,
                Operand::Member(MemberRef::new("System.Environment", "Exit", 1, false)),
            );
            body.push(Opcode::Ret, Operand::None);
        }
        let corrupt = module.add_method(
            Method::new(
                mint(ctx, &mut allocator, &mut members),
                MethodFlags::STATIC,
                ty,
                MethodSig::new(vec![], TypeSig::Void),
            )
            .with_body(body),
        );

        // Startup order per the probe chain contract.
        let mut checks = Vec::new();
        if ctx.config.enable_anti_debug {
            checks.extend([
                check_native,
                check_remote,
                check_managed,
                check_peb,
                check_heap,
                check_ods,
                check_trap,
                check_parent,
                check_timing,
                check_environment,
            ]);
        }
        if ctx.config.enable_anti_tamper && ctx.config.anti_tamper.validate_checksum {
            checks.push(check_integrity);
        }

        Ok(Helper {
            ty,
            checks,
            quick_check: check_managed,
            corrupt,
        })
    }

    /// Prepend the startup chain to the module static initialiser, creating
    /// one when the module has none.
    fn inject_startup_chain(&self, module: &mut Module, helper: &Helper) {
        let initializer = module.module_initializer().unwrap_or_else(|| {
            let mut body = MethodBody::new();
            body.push(Opcode::Ret, Operand::None);
            module.add_method(
                Method::new(
                    ".cctor",
                    MethodFlags::STATIC | MethodFlags::SPECIAL_NAME | MethodFlags::RT_SPECIAL_NAME,
                    module.global_type,
                    MethodSig::new(vec![], TypeSig::Void),
                )
                .with_body(body),
            )
        });
        let body = module.methods[initializer.index()]
            .body
            .get_or_insert_with(MethodBody::new);
        if body.is_empty() {
            body.push(Opcode::Ret, Operand::None);
        }
        let prefix = build_check_chain(body, &helper.checks, helper.corrupt);
        body.instructions.splice(0..0, prefix);
    }

    /// Entry probes with the per-mode probability, plus periodic probes in
    /// long bodies.
    fn inject_method_probes(
        &self,
        module: &mut Module,
        ctx: &mut ProtectionContext,
        helper: &Helper,
        probability: u32,
    ) -> usize {
        if probability == 0 {
            return 0;
        }
        let mut probed = 0usize;
        for id in module.method_ids() {
            let method = module.method(id);
            if method.declaring == helper.ty
                || method.is_constructor()
                || method.is_accessor()
                || method.flags.contains(MethodFlags::SPECIAL_NAME)
                || method.pinvoke.is_some()
                || method.body.is_none()
            {
                continue;
            }
            if ctx
                .preservation
                .method_excluded(&module.method_full_name(id))
                || ctx.preservation.type_excluded(module, method.declaring)
            {
                continue;
            }
            if !ctx.rng.next_percent(probability) {
                continue;
            }
            let body = module.methods[id.index()].body.as_mut().unwrap();
            if body.is_empty() {
                continue;
            }

            // Periodic probes first so entry insertion does not shift the
            // chosen interior points.
            if body.len() > 50 {
                let mut at = body.len().saturating_sub(1);
                while at >= 20 {
                    if !body.instructions[at - 1].opcode.is_branch()
                        && !body.instructions[at].opcode.is_branch()
                    {
                        let skip = body.instructions[at].id;
                        let probe = probe_sequence(body, helper, skip);
                        body.instructions.splice(at..at, probe);
                    }
                    at -= 20;
                }
            }

            let entry = body.instructions[0].id;
            let probe = probe_sequence(body, helper, entry);
            body.instructions.splice(0..0, probe);
            probed += 1;
        }
        probed
    }
}

/// `call check; brfalse next; call corrupt` per check, falling through the
/// whole chain when nothing fires. Zero net stack effect.
fn build_check_chain(body: &mut MethodBody, checks: &[MethodId], corrupt: MethodId) -> Vec<Instruction> {
    let after_chain = body.instructions.first().map(|i| i.id);
    let call_ids: Vec<InstrId> = checks.iter().map(|_| body.mint_id()).collect();
    let mut prefix = Vec::with_capacity(checks.len() * 3);
    for (i, &check) in checks.iter().enumerate() {
        let next = call_ids
            .get(i + 1)
            .copied()
            .or(after_chain)
            .unwrap_or(call_ids[i]);
        prefix.push(Instruction {
            id: call_ids[i],
            opcode: Opcode::Call,
            operand: Operand::Method(check),
        });
        prefix.push(Instruction {
            id: body.mint_id(),
            opcode: Opcode::Brfalse,
            operand: Operand::Target(next),
        });
        prefix.push(Instruction {
            id: body.mint_id(),
            opcode: Opcode::Call,
            operand: Operand::Method(corrupt),
        });
    }
    prefix
}

/// One entry/periodic probe: quick check, skip over the corruption call
/// when clean.
fn probe_sequence(body: &mut MethodBody, helper: &Helper, skip_to: InstrId) -> Vec<Instruction> {
    vec![
        Instruction {
            id: body.mint_id(),
            opcode: Opcode::Call,
            operand: Operand::Method(helper.quick_check),
        },
        Instruction {
            id: body.mint_id(),
            opcode: Opcode::Brfalse,
            operand: Operand::Target(skip_to),
        },
        Instruction {
            id: body.mint_id(),
            opcode: Opcode::Call,
            operand: Operand::Method(helper.corrupt),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use modshield_config::ProtectionConfig;

    fn ctx_with(config: ProtectionConfig) -> ProtectionContext {
        ProtectionContext::new(config).unwrap()
    }

    fn config() -> ProtectionConfig {
        ProtectionConfig::builder().seed(9).output_path("o").build()
    }

    fn module_with_bodies(count: usize) -> Module {
        let mut module = Module::new("demo");
        let ty = module.add_type(TypeDef::new("Obf", "T", TypeFlags::empty()));
        for i in 0..count {
            let mut body = MethodBody::new();
            body.push(Opcode::LdcI4, Operand::Int32(i as i32));
            body.push(Opcode::Pop, Operand::None);
            body.push(Opcode::Ret, Operand::None);
            module.add_method(
                Method::new(
                    format!("M{i}"),
                    MethodFlags::STATIC,
                    ty,
                    MethodSig::new(vec![], TypeSig::Void),
                )
                .with_body(body),
            );
        }
        module
    }

    #[test]
    fn startup_chain_lands_in_a_created_initializer() {
        let mut module = module_with_bodies(1);
        assert!(module.module_initializer().is_none());
        let mut ctx = ctx_with(config());
        AntiDebugPass.apply(&mut module, &mut ctx).unwrap();
        let initializer = module.module_initializer().expect("cctor was created");
        let body = module.method(initializer).body.as_ref().unwrap();
        assert_eq!(body.instructions[0].opcode, Opcode::Call);
        assert_eq!(body.instructions[1].opcode, Opcode::Brfalse);
        assert_eq!(body.instructions[2].opcode, Opcode::Call);
        assert!(body.targets_resolve());
        // The whole chain nets zero and the initializer still returns.
        let net: i32 = body
            .instructions
            .iter()
            .map(|i| i.stack_delta(&module))
            .sum();
        assert_eq!(net, 0);
        assert_eq!(body.instructions.last().unwrap().opcode, Opcode::Ret);
    }

    #[test]
    fn existing_initializer_is_prepended_not_replaced() {
        let mut module = module_with_bodies(0);
        let mut body = MethodBody::new();
        let marker = body.push(Opcode::LdcI4, Operand::Int32(1234));
        body.push(Opcode::Pop, Operand::None);
        body.push(Opcode::Ret, Operand::None);
        module.add_method(
            Method::new(
                ".cctor",
                MethodFlags::STATIC | MethodFlags::SPECIAL_NAME | MethodFlags::RT_SPECIAL_NAME,
                module.global_type,
                MethodSig::new(vec![], TypeSig::Void),
            )
            .with_body(body),
        );
        let mut ctx = ctx_with(config());
        AntiDebugPass.apply(&mut module, &mut ctx).unwrap();
        let initializer = module.module_initializer().unwrap();
        let body = module.method(initializer).body.as_ref().unwrap();
        assert!(body.instructions.iter().any(|i| i.id == marker));
        // Original code still follows the chain.
        let marker_position = body.position_of(marker).unwrap();
        assert!(marker_position > 0);
    }

    #[test]
    fn helper_type_is_sealed_global_namespace_with_pinvokes() {
        let mut module = module_with_bodies(1);
        let before = module.types.len();
        let mut ctx = ctx_with(config());
        AntiDebugPass.apply(&mut module, &mut ctx).unwrap();
        let helper = module
            .types
            .iter()
            .skip(before)
            .find(|t| t.flags.contains(TypeFlags::SEALED))
            .expect("helper type added");
        assert!(helper.namespace.is_empty());
        assert!(helper.flags.contains(TypeFlags::ABSTRACT));
        let pinvokes: Vec<_> = helper
            .methods
            .iter()
            .filter(|&&m| module.method(m).pinvoke.is_some())
            .collect();
        assert!(pinvokes.len() >= 4);
        for &&m in &pinvokes {
            let method = module.method(m);
            assert!(method.body.is_none(), "p-invoke declarations carry no body");
            assert!(method.flags.contains(MethodFlags::PINVOKE_IMPL));
        }
    }

    #[test]
    fn heavy_mode_probes_most_methods() {
        let mut module = module_with_bodies(30);
        let mut config = config();
        config.anti_tamper.mode = AntiTamperMode::Heavy;
        let mut ctx = ctx_with(config);
        AntiDebugPass.apply(&mut module, &mut ctx).unwrap();
        let probed = (0..30)
            .filter(|&i| {
                let body = module.methods[i].body.as_ref().unwrap();
                body.instructions[0].opcode == Opcode::Call
            })
            .count();
        assert!(probed > 15, "expected most of 30 methods probed, got {probed}");
        // Probe snippets keep the stack balanced.
        for method in &module.methods {
            if let Some(body) = &method.body {
                assert!(body.targets_resolve());
            }
        }
    }

    #[test]
    fn mode_none_injects_no_method_probes() {
        let mut module = module_with_bodies(10);
        let mut config = config();
        config.anti_tamper.mode = AntiTamperMode::None;
        let mut ctx = ctx_with(config);
        AntiDebugPass.apply(&mut module, &mut ctx).unwrap();
        for i in 0..10 {
            let body = module.methods[i].body.as_ref().unwrap();
            assert_eq!(body.instructions[0].opcode, Opcode::LdcI4);
        }
    }

    #[test]
    fn long_bodies_receive_periodic_probes() {
        let mut module = Module::new("demo");
        let ty = module.add_type(TypeDef::new("Obf", "T", TypeFlags::empty()));
        let mut body = MethodBody::new();
        for i in 0..60 {
            body.push(Opcode::LdcI4, Operand::Int32(i));
            body.push(Opcode::Pop, Operand::None);
        }
        body.push(Opcode::Ret, Operand::None);
        module.add_method(
            Method::new("Long", MethodFlags::STATIC, ty, MethodSig::new(vec![], TypeSig::Void))
                .with_body(body),
        );
        let mut config = config();
        config.anti_tamper.mode = AntiTamperMode::Heavy;
        let mut ctx = ctx_with(config);
        AntiDebugPass.apply(&mut module, &mut ctx).unwrap();
        let body = module.methods[0].body.as_ref().unwrap();
        let probe_calls = body
            .instructions
            .iter()
            .filter(|i| matches!(i.operand, Operand::Method(_)) && i.opcode == Opcode::Call)
            .count();
        assert!(
            probe_calls >= 6,
            "expected entry plus periodic probes, found {probe_calls} calls"
        );
    }

    #[test]
    fn corruption_faults_or_exits_per_configuration() {
        for corrupt in [true, false] {
            let mut module = module_with_bodies(1);
            let mut config = config();
            config.anti_tamper.corrupt_on_tamper = corrupt;
            let mut ctx = ctx_with(config);
            AntiDebugPass.apply(&mut module, &mut ctx).unwrap();
            let faulting = module.methods.iter().any(|m| {
                m.body.as_ref().is_some_and(|b| {
                    b.instructions
                        .windows(2)
                        .any(|w| w[0].opcode == Opcode::LdNull && w[1].opcode == Opcode::Throw)
                })
            });
            assert_eq!(faulting, corrupt);
        }
    }

    #[test]
    fn integrity_check_is_gated_on_anti_tamper() {
        let mut module = module_with_bodies(1);
        let mut config = config();
        config.enable_anti_tamper = false;
        let mut ctx = ctx_with(config);
        AntiDebugPass.apply(&mut module, &mut ctx).unwrap();
        let has_baked_checksum = module.methods.iter().any(|m| {
            m.body.as_ref().is_some_and(|b| {
                b.instructions
                    .iter()
                    .any(|i| matches!(i.operand, Operand::Int64(_)))
            })
        });
        // The comparison body exists on the helper, but the startup chain
        // must not invoke it.
        let initializer = module.module_initializer().unwrap();
        let chain = module.method(initializer).body.as_ref().unwrap();
        let chained_checks: Vec<MethodId> = chain
            .instructions
            .iter()
            .filter_map(|i| match i.operand {
                Operand::Method(m) => Some(m),
                _ => None,
            })
            .collect();
        let integrity_chained = chained_checks.iter().any(|&m| {
            module.method(m).body.as_ref().is_some_and(|b| {
                b.instructions
                    .iter()
                    .any(|i| matches!(i.operand, Operand::Int64(_)))
            })
        });
        assert!(has_baked_checksum);
        assert!(!integrity_chained);
    }
}
