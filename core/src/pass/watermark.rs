//! Module watermarking.
//!
//! Stamps the module with a marker custom attribute carrying the protector
//! version, backed by a synthesized attribute type so the reference resolves
//! in-module.

use super::Pass;
use crate::context::ProtectionContext;
use crate::error::PassError;
use crate::module::{
    AttrArg, CustomAttribute, MemberRef, Method, MethodFlags, MethodSig, Module, TypeDef,
    TypeFlags, TypeSig,
};

const ATTRIBUTE_TYPE: &str = "ProtectedModuleAttribute";

pub struct WatermarkPass;

impl Pass for WatermarkPass {
    fn id(&self) -> &'static str {
        "watermark"
    }

    fn name(&self) -> &'static str {
        "Watermark"
    }

    fn description(&self) -> &'static str {
        "Adds a marker custom attribute to the module"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn can_apply(&self, _module: &Module) -> bool {
        true
    }

    fn apply(&self, module: &mut Module, _ctx: &mut ProtectionContext) -> Result<(), PassError> {
        if module
            .custom_attributes
            .iter()
            .any(|a| a.ctor.declaring_type == ATTRIBUTE_TYPE)
        {
            return Ok(());
        }
        let attribute_type = module.add_type(TypeDef::new(
            "",
            ATTRIBUTE_TYPE,
            TypeFlags::SEALED,
        ));
        module.add_method(Method::new(
            ".ctor",
            MethodFlags::PUBLIC | MethodFlags::SPECIAL_NAME | MethodFlags::RT_SPECIAL_NAME,
            attribute_type,
            MethodSig::new(vec![TypeSig::Object, TypeSig::Str], TypeSig::Void),
        ));
        module.custom_attributes.push(CustomAttribute {
            ctor: MemberRef::new(ATTRIBUTE_TYPE, ".ctor", 2, false),
            args: vec![AttrArg::Str(format!(
                "modshield {}",
                env!("CARGO_PKG_VERSION")
            ))],
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modshield_config::ProtectionConfig;

    fn ctx() -> ProtectionContext {
        ProtectionContext::new(ProtectionConfig::builder().output_path("o").build()).unwrap()
    }

    #[test]
    fn watermark_attribute_is_added_once() {
        let mut module = Module::new("demo");
        let mut context = ctx();
        WatermarkPass.apply(&mut module, &mut context).unwrap();
        WatermarkPass.apply(&mut module, &mut context).unwrap();
        let marks: Vec<_> = module
            .custom_attributes
            .iter()
            .filter(|a| a.ctor.declaring_type == ATTRIBUTE_TYPE)
            .collect();
        assert_eq!(marks.len(), 1);
        assert!(matches!(&marks[0].args[0], AttrArg::Str(s) if s.starts_with("modshield ")));
        // The attribute type itself exists in the module.
        assert!(module.types.iter().any(|t| t.name == ATTRIBUTE_TYPE));
    }
}
