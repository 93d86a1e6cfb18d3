//! End-to-end protection runs over file-backed modules.

use modshield_core::context::ProtectionContext;
use modshield_core::diagnostics::codes;
use modshield_core::error::{PassError, ProtectionError};
use modshield_core::module::{
    BincodeModuleIo, Method, MethodBody, MethodFlags, MethodSig, Module, ModuleIo, Opcode,
    Operand, TypeDef, TypeFlags, TypeSig,
};
use modshield_core::modshield_config::{
    OptimizationLevel, ProtectionConfig, ProtectionLevel,
};
use modshield_core::pass::{Orchestrator, Pass};
use modshield_core::Protector;
use std::path::{Path, PathBuf};

/// One type `T` with a static `Greet` that returns the literal `"hi"`.
fn trivial_module() -> Module {
    let mut module = Module::new("trivial");
    let ty = module.add_type(TypeDef::new("Acme", "T", TypeFlags::empty()));
    let mut body = MethodBody::new();
    body.push(Opcode::LdStr, Operand::Str("hi".to_owned()));
    body.push(Opcode::Ret, Operand::None);
    let greet = module.add_method(
        Method::new(
            "Greet",
            MethodFlags::STATIC,
            ty,
            MethodSig::new(vec![], TypeSig::Str),
        )
        .with_body(body),
    );
    module.entry_point = Some(greet);
    module
}

fn write_module(dir: &Path, name: &str, module: &Module) -> PathBuf {
    let path = dir.join(name);
    BincodeModuleIo::new().write(module, &path).unwrap();
    path
}

fn literal_occurs(module: &Module, literal: &str) -> bool {
    module.methods.iter().any(|m| {
        m.body.as_ref().is_some_and(|b| {
            b.instructions
                .iter()
                .any(|i| matches!(&i.operand, Operand::Str(s) if s == literal))
        })
    })
}

#[test]
fn default_pipeline_protects_a_trivial_module() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_module(dir.path(), "in.msm", &trivial_module());
    let output = dir.path().join("out.msm");
    let config = ProtectionConfig::builder()
        .seed(2024)
        .output_path(&output)
        .build();

    let result = Protector::new().protect(&input, config).unwrap();
    assert!(result.success, "errors: {:?}", result.errors);
    for pass in ["renaming", "string-encryption", "control-flow", "anti-debug", "watermark"] {
        assert!(
            result.applied.iter().any(|id| id == pass),
            "pass `{pass}` missing from {:?}",
            result.applied
        );
    }

    let protected = BincodeModuleIo::new().load(&output).unwrap();
    // The literal is gone everywhere, including the injected helpers.
    assert!(!literal_occurs(&protected, "hi"));
    // The original identifiers are gone.
    assert!(!protected.types.iter().any(|t| t.name == "T"));
    assert!(!protected.methods.iter().any(|m| m.name == "Greet"));
    // A sealed, non-constructible helper type carries the decryptor and the
    // ciphertext blobs.
    let helper_fields: Vec<_> = protected
        .fields
        .iter()
        .filter(|f| f.initial_value.is_some())
        .collect();
    assert!(!helper_fields.is_empty(), "no ciphertext blobs were injected");
    // The rewritten entry body loads a blob field instead of the literal.
    let entry = protected.entry_point.expect("entry point survived");
    let body = protected.methods[entry.index()].body.as_ref().unwrap();
    assert!(body.instructions.iter().any(|i| i.opcode == Opcode::Ldsfld));
    assert!(body.targets_resolve());
    // The watermark attribute is present on the module.
    assert!(protected
        .custom_attributes
        .iter()
        .any(|a| a.ctor.declaring_type == "ProtectedModuleAttribute"));
}

#[test]
fn renaming_disabled_keeps_names_but_encrypts_strings() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_module(dir.path(), "in.msm", &trivial_module());
    let output = dir.path().join("out.msm");
    let config = ProtectionConfig::builder()
        .seed(2024)
        .output_path(&output)
        .renaming(false)
        .build();

    let result = Protector::new().protect(&input, config).unwrap();
    assert!(result.success);
    assert!(!result.applied.iter().any(|id| id == "renaming"));

    let protected = BincodeModuleIo::new().load(&output).unwrap();
    assert!(protected.types.iter().any(|t| t.name == "T"));
    assert!(protected.methods.iter().any(|m| m.name == "Greet"));
    assert!(!literal_occurs(&protected, "hi"));
}

#[test]
fn excluded_type_keeps_its_name_while_others_change() {
    let dir = tempfile::tempdir().unwrap();
    let mut module = Module::new("two-types");
    module.add_type(TypeDef::new("Keep", "Me", TypeFlags::empty()));
    module.add_type(TypeDef::new("Obf", "Us", TypeFlags::empty()));
    let input = write_module(dir.path(), "in.msm", &module);
    let output = dir.path().join("out.msm");
    let config = ProtectionConfig::builder()
        .seed(5)
        .output_path(&output)
        .exclude_type("Keep.Me")
        .build();

    let result = Protector::new().protect(&input, config).unwrap();
    assert!(result.success);
    let protected = BincodeModuleIo::new().load(&output).unwrap();
    assert!(protected.types.iter().any(|t| t.name == "Me"));
    assert!(!protected.types.iter().any(|t| t.name == "Us"));
}

#[test]
fn missing_input_fails_without_creating_output() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.msm");
    let config = ProtectionConfig::builder().output_path(&output).build();

    let result = Protector::new()
        .protect(&dir.path().join("missing.msm"), config)
        .unwrap();
    assert!(!result.success);
    assert!(result.errors.iter().any(|e| e.is_not_found()));
    assert!(result.applied.is_empty());
    assert!(!output.exists());
}

#[test]
fn disabled_pipeline_with_no_optimization_is_a_bitwise_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_module(dir.path(), "in.msm", &trivial_module());
    let output = dir.path().join("out.msm");
    let mut config = ProtectionConfig::with_level(ProtectionLevel::None);
    config.optimization = OptimizationLevel::None;
    config.output_path = Some(output.clone());

    let result = Protector::new().protect(&input, config).unwrap();
    assert!(result.success);
    assert!(result.applied.is_empty());
    assert_eq!(std::fs::read(&input).unwrap(), std::fs::read(&output).unwrap());
}

#[test]
fn fixed_seed_runs_are_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_module(dir.path(), "in.msm", &trivial_module());
    let run = |name: &str| {
        let output = dir.path().join(name);
        let config = ProtectionConfig::builder()
            .seed(77)
            .output_path(&output)
            .build();
        let result = Protector::new().protect(&input, config).unwrap();
        assert!(result.success);
        std::fs::read(output).unwrap()
    };
    assert_eq!(run("a.msm"), run("b.msm"));
}

#[test]
fn mapping_file_is_emitted_beside_the_output() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_module(dir.path(), "in.msm", &trivial_module());
    let output = dir.path().join("out.msm");
    let config = ProtectionConfig::builder()
        .seed(3)
        .output_path(&output)
        .mapping_file(true)
        .build();

    let result = Protector::new().protect(&input, config).unwrap();
    assert!(result.success);
    let mapping = std::fs::read_to_string(dir.path().join("out.map")).unwrap();
    assert!(mapping.contains("Acme.T -> "));
    assert!(mapping.contains("Acme.T::Greet -> "));
}

#[test]
fn applied_ids_are_distinct_and_a_subset_of_enabled() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_module(dir.path(), "in.msm", &trivial_module());
    let output = dir.path().join("out.msm");
    let config = ProtectionConfig::builder().seed(1).output_path(&output).build();
    let result = Protector::new().protect(&input, config).unwrap();

    let mut ids = result.applied.clone();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), result.applied.len());
    let enabled = [
        "renaming",
        "string-encryption",
        "control-flow",
        "anti-debug",
        "watermark",
    ];
    assert!(result.applied.iter().all(|id| enabled.contains(&id.as_str())));
}

/// Two mutually dependent passes: scheduling must fail before any mutation.
struct CyclicStub {
    id: &'static str,
    dependency: &'static str,
}

impl Pass for CyclicStub {
    fn id(&self) -> &'static str {
        self.id
    }
    fn name(&self) -> &'static str {
        self.id
    }
    fn description(&self) -> &'static str {
        "cyclic stub"
    }
    fn dependencies(&self) -> &[&'static str] {
        std::slice::from_ref(&self.dependency)
    }
    fn can_apply(&self, _module: &Module) -> bool {
        true
    }
    fn apply(&self, module: &mut Module, _ctx: &mut ProtectionContext) -> Result<(), PassError> {
        module.name.push('!');
        Ok(())
    }
}

#[test]
fn dependency_cycle_fails_with_zero_mutations() {
    let orchestrator = Orchestrator::new(vec![
        Box::new(CyclicStub {
            id: "a",
            dependency: "b",
        }),
        Box::new(CyclicStub {
            id: "b",
            dependency: "a",
        }),
    ]);
    let mut module = trivial_module();
    let mut ctx =
        ProtectionContext::new(ProtectionConfig::builder().output_path("o").build()).unwrap();
    let err = orchestrator.run(&mut module, &mut ctx).unwrap_err();
    assert!(matches!(err, ProtectionError::DependencyCycle(_)));
    assert_eq!(module.name, "trivial");
    assert_eq!(ctx.applied().count(), 0);
}

#[test]
fn pass_skips_are_reported_as_diagnostics_not_errors() {
    // A module with no string loads: the string pass must skip, the run
    // must still succeed.
    let dir = tempfile::tempdir().unwrap();
    let mut module = Module::new("stringless");
    let ty = module.add_type(TypeDef::new("Obf", "T", TypeFlags::empty()));
    let mut body = MethodBody::new();
    body.push(Opcode::LdcI4, Operand::Int32(11));
    body.push(Opcode::Pop, Operand::None);
    body.push(Opcode::Ret, Operand::None);
    module.add_method(
        Method::new("M", MethodFlags::STATIC, ty, MethodSig::new(vec![], TypeSig::Void))
            .with_body(body),
    );
    let input = write_module(dir.path(), "in.msm", &module);
    let output = dir.path().join("out.msm");
    let config = ProtectionConfig::builder().seed(4).output_path(&output).build();

    let result = Protector::new().protect(&input, config).unwrap();
    assert!(result.success);
    assert!(!result.applied.iter().any(|id| id == "string-encryption"));
    assert!(result
        .diagnostics
        .iter()
        .any(|d| d.code == codes::PASS_SKIPPED && d.message.contains("string-encryption")));
}
