//! String-literal encryption.
//!
//! Three phases: collect every eligible inline literal into the encrypted
//! registry (one record per distinct value), inject a decryptor type whose
//! static byte-array fields carry the ciphertext, then rewrite each
//! `ldstr` into a field load plus a decryptor call with the same net stack
//! effect. Repeated literals share a ciphertext because encryption is
//! deterministic per key.

use super::Pass;
use crate::context::{EncryptedString, ProtectionContext};
use crate::crypto;
use crate::diagnostics::codes;
use crate::error::PassError;
use crate::module::{
    Field, FieldFlags, FieldId, InstrId, Instruction, MemberRef, Method, MethodBody, MethodFlags,
    MethodId, MethodSig, Module, Opcode, Operand, TypeDef, TypeFlags, TypeSig,
};
use crate::naming::{NameAllocator, NameIntent, NameScope};
use modshield_config::{EncryptionAlgorithm, RenamingMode};

pub struct StringEncryptionPass;

/// One rewrite site: which instruction of which method loads which record.
struct Site {
    method: MethodId,
    instr: InstrId,
    record: usize,
}

impl Pass for StringEncryptionPass {
    fn id(&self) -> &'static str {
        "string-encryption"
    }

    fn name(&self) -> &'static str {
        "String encryption"
    }

    fn description(&self) -> &'static str {
        "Replaces inline string literals with encrypted blobs and an injected decryptor"
    }

    fn priority(&self) -> i32 {
        80
    }

    fn conflicts_with(&self) -> &[&'static str] {
        // Renaming must have settled before literals are compared against
        // preserved prefixes and the decryptor type is minted.
        &["renaming"]
    }

    fn can_apply(&self, module: &Module) -> bool {
        module.methods.iter().any(|m| {
            m.body.as_ref().is_some_and(|b| {
                b.instructions
                    .iter()
                    .any(|i| matches!(&i.operand, Operand::Str(_)) && i.opcode == Opcode::LdStr)
            })
        })
    }

    fn apply(&self, module: &mut Module, ctx: &mut ProtectionContext) -> Result<(), PassError> {
        if !ctx.config.encryption.encrypt_strings {
            ctx.info(codes::STRINGS_ENCRYPTED, "string encryption disabled by configuration");
            return Ok(());
        }
        let algorithm = ctx.config.encryption.algorithm;
        let dynamic = ctx.config.encryption.dynamic_decryption;

        // Phase 1: collect. The shared key backs the static decryptor; per
        // literal keys are only drawn under dynamic decryption.
        let module_key = ctx.rng.next_bytes(32);
        let mut sites = Vec::new();
        for method_id in module.method_ids() {
            if self.body_excluded(module, ctx, method_id) {
                continue;
            }
            let Some(body) = &module.method(method_id).body else {
                continue;
            };
            for instruction in &body.instructions {
                if instruction.opcode != Opcode::LdStr {
                    continue;
                }
                let Operand::Str(literal) = &instruction.operand else {
                    continue;
                };
                if literal.chars().count() < 2 {
                    continue;
                }
                if ctx.preservation.is_framework_name(literal) {
                    continue;
                }
                let rng = &mut ctx.rng;
                let record = ctx.strings.intern(literal, || {
                    let key = if dynamic {
                        rng.next_bytes(16)
                    } else {
                        module_key.clone()
                    };
                    EncryptedString {
                        plaintext: literal.clone(),
                        ciphertext: crypto::encrypt(algorithm, literal.as_bytes(), &key),
                        key,
                        algorithm,
                        data_field: None,
                        key_field: None,
                    }
                });
                sites.push(Site {
                    method: method_id,
                    instr: instruction.id,
                    record,
                });
            }
        }

        if sites.is_empty() {
            ctx.info(codes::STRINGS_ENCRYPTED, "no eligible string literals");
            return Ok(());
        }

        // Phase 3 (before substitution, which needs the member handles):
        // inject the decryptor type.
        let injected = self.inject_decryptor(module, ctx, algorithm, &module_key, dynamic);

        // Phase 2: substitute every recorded load.
        for site in &sites {
            let record = ctx.strings.get(site.record);
            let data_field = record.data_field.ok_or_else(|| {
                PassError::new("encrypted record lost its data field during injection")
            })?;
            let key_field = record.key_field;
            let body = module.methods[site.method.index()]
                .body
                .as_mut()
                .ok_or_else(|| PassError::new("collected body vanished"))?;
            let position = body
                .position_of(site.instr)
                .ok_or_else(|| PassError::new("collected instruction vanished"))?;
            body.instructions.remove(position);
            // The field load takes over the removed instruction's handle so
            // branch targets and region boundaries stay valid.
            body.insert_instr(
                position,
                Instruction {
                    id: site.instr,
                    opcode: Opcode::Ldsfld,
                    operand: Operand::Field(data_field),
                },
            );
            if dynamic {
                let key_field = key_field
                    .ok_or_else(|| PassError::new("dynamic record lost its key field"))?;
                body.insert(position + 1, Opcode::Ldsfld, Operand::Field(key_field));
                body.insert(position + 2, Opcode::Call, Operand::Method(injected.dynamic_decrypt));
            } else {
                body.insert(position + 1, Opcode::Call, Operand::Method(injected.static_decrypt));
            }
        }

        let unique = ctx.strings.len();
        log::debug!("encrypted {unique} distinct literals at {} sites", sites.len());
        ctx.info(
            codes::STRINGS_ENCRYPTED,
            format!("encrypted {unique} string literals ({} load sites)", sites.len()),
        );
        Ok(())
    }
}

struct InjectedDecryptor {
    static_decrypt: MethodId,
    dynamic_decrypt: MethodId,
}

impl StringEncryptionPass {
    fn body_excluded(&self, module: &Module, ctx: &ProtectionContext, id: MethodId) -> bool {
        let method = module.method(id);
        ctx.preservation
            .method_excluded(&module.method_full_name(id))
            || ctx.preservation.type_excluded(module, method.declaring)
    }

    /// Synthesise the decryptor type: ciphertext fields, the shared key
    /// field, a two-argument dynamic decryptor and a one-argument static
    /// decryptor that supplies the baked key itself.
    fn inject_decryptor(
        &self,
        module: &mut Module,
        ctx: &mut ProtectionContext,
        algorithm: EncryptionAlgorithm,
        module_key: &[u8],
        dynamic: bool,
    ) -> InjectedDecryptor {
        let mut allocator = NameAllocator::new(ctx.config.renaming.scheme, RenamingMode::Normal);
        let mut type_scope = NameScope::with_names(module.types.iter().map(|t| t.name.clone()));
        let type_name = allocator.mint(&mut ctx.rng, &mut type_scope, NameIntent::Type);
        let holder = module.add_type(TypeDef::new(
            "",
            type_name,
            TypeFlags::SEALED | TypeFlags::ABSTRACT,
        ));

        let mut members = NameScope::new();
        for record in ctx.strings.records_mut() {
            let data_name = allocator.mint(&mut ctx.rng, &mut members, NameIntent::Field);
            let mut data = Field::new(
                data_name,
                FieldFlags::STATIC | FieldFlags::INIT_ONLY,
                holder,
                TypeSig::ByteArray,
            );
            data.initial_value = Some(record.ciphertext.clone());
            record.data_field = Some(module.add_field(data));
        }
        let shared_key = self.add_key_field(module, ctx, &mut allocator, &mut members, holder, module_key);
        if dynamic {
            for index in 0..ctx.strings.len() {
                let key = ctx.strings.get(index).key.clone();
                let field = self.add_key_field(module, ctx, &mut allocator, &mut members, holder, &key);
                ctx.strings.get_mut(index).key_field = Some(field);
            }
        }

        let dynamic_name = allocator.mint(&mut ctx.rng, &mut members, NameIntent::Method);
        let mut dynamic_method = Method::new(
            dynamic_name,
            MethodFlags::STATIC,
            holder,
            MethodSig::new(vec![TypeSig::ByteArray, TypeSig::ByteArray], TypeSig::Str),
        );
        dynamic_method.body = Some(match algorithm {
            EncryptionAlgorithm::Custom => custom_xor_body(),
            EncryptionAlgorithm::SymmetricBlock => {
                external_transform_body("System.Security.Cryptography.AesCtr")
            }
            EncryptionAlgorithm::Stream => {
                external_transform_body("System.Security.Cryptography.ChaCha20")
            }
        });
        let dynamic_decrypt = module.add_method(dynamic_method);

        let static_name = allocator.mint(&mut ctx.rng, &mut members, NameIntent::Method);
        let mut static_method = Method::new(
            static_name,
            MethodFlags::STATIC,
            holder,
            MethodSig::new(vec![TypeSig::ByteArray], TypeSig::Str),
        );
        let mut body = MethodBody::new();
        body.push(Opcode::Ldarg, Operand::Arg(0));
        body.push(Opcode::Ldsfld, Operand::Field(shared_key));
        body.push(Opcode::Call, Operand::Method(dynamic_decrypt));
        body.push(Opcode::Ret, Operand::None);
        static_method.body = Some(body);
        let static_decrypt = module.add_method(static_method);

        InjectedDecryptor {
            static_decrypt,
            dynamic_decrypt,
        }
    }

    fn add_key_field(
        &self,
        module: &mut Module,
        ctx: &mut ProtectionContext,
        allocator: &mut NameAllocator,
        members: &mut NameScope,
        holder: crate::module::TypeId,
        key: &[u8],
    ) -> FieldId {
        let name = allocator.mint(&mut ctx.rng, members, NameIntent::Field);
        let mut field = Field::new(
            name,
            FieldFlags::STATIC | FieldFlags::INIT_ONLY,
            holder,
            TypeSig::ByteArray,
        );
        field.initial_value = Some(key.to_vec());
        module.add_field(field)
    }
}

/// The custom-XOR inverse, expressed as a genuine bytecode loop:
/// `result[i] = data[i] ^ key[i % key.len] ^ (i * 17) & 0xff`.
fn custom_xor_body() -> MethodBody {
    let mut body = MethodBody::new();
    let result = body.add_local(TypeSig::ByteArray);
    let i = body.add_local(TypeSig::Int32);

    // result = new byte[data.len]
    body.push(Opcode::Ldarg, Operand::Arg(0));
    body.push(Opcode::Ldlen, Operand::None);
    body.push(Opcode::Newarr, Operand::Member(MemberRef::new("System", "Byte", 0, false)));
    body.push(Opcode::Stloc, Operand::Local(result));
    // i = 0
    body.push(Opcode::LdcI4, Operand::Int32(0));
    body.push(Opcode::Stloc, Operand::Local(i));
    // while i < data.len
    let check = body.push(Opcode::Ldloc, Operand::Local(i));
    body.push(Opcode::Ldarg, Operand::Arg(0));
    body.push(Opcode::Ldlen, Operand::None);
    body.push(Opcode::Clt, Operand::None);
    let exit_branch = body.mint_id();
    // result[i] = ...
    body.push(Opcode::Ldloc, Operand::Local(result));
    body.push(Opcode::Ldloc, Operand::Local(i));
    body.push(Opcode::Ldarg, Operand::Arg(0));
    body.push(Opcode::Ldloc, Operand::Local(i));
    body.push(Opcode::Ldelem, Operand::None);
    body.push(Opcode::Ldarg, Operand::Arg(1));
    body.push(Opcode::Ldloc, Operand::Local(i));
    body.push(Opcode::Ldarg, Operand::Arg(1));
    body.push(Opcode::Ldlen, Operand::None);
    body.push(Opcode::Rem, Operand::None);
    body.push(Opcode::Ldelem, Operand::None);
    body.push(Opcode::Xor, Operand::None);
    body.push(Opcode::Ldloc, Operand::Local(i));
    body.push(Opcode::LdcI4, Operand::Int32(17));
    body.push(Opcode::Mul, Operand::None);
    body.push(Opcode::LdcI4, Operand::Int32(0xff));
    body.push(Opcode::And, Operand::None);
    body.push(Opcode::Xor, Operand::None);
    body.push(Opcode::ConvU1, Operand::None);
    body.push(Opcode::Stelem, Operand::None);
    // i += 1
    body.push(Opcode::Ldloc, Operand::Local(i));
    body.push(Opcode::LdcI4, Operand::Int32(1));
    body.push(Opcode::Add, Operand::None);
    body.push(Opcode::Stloc, Operand::Local(i));
    body.push(Opcode::Br, Operand::Target(check));
    // done: decode UTF-8 bytes
    let done = body.push(Opcode::Ldloc, Operand::Local(result));
    body.push(
        Opcode::Call,
        Operand::Member(MemberRef::new("System.Text.Encoding", "Utf8GetString", 1, true)),
    );
    body.push(Opcode::Ret, Operand::None);

    // Place the loop-exit branch now that its target exists.
    let position = body.position_of(check).unwrap() + 4;
    body.insert_instr(
        position,
        Instruction {
            id: exit_branch,
            opcode: Opcode::Brfalse,
            operand: Operand::Target(done),
        },
    );
    body
}

/// Block and stream inverses lean on the runtime's crypto surface; the
/// bodies are call sequences over external member references.
fn external_transform_body(provider: &str) -> MethodBody {
    let mut body = MethodBody::new();
    body.push(Opcode::Ldarg, Operand::Arg(0));
    body.push(Opcode::Ldarg, Operand::Arg(1));
    body.push(
        Opcode::Call,
        Operand::Member(MemberRef::new(provider, "Transform", 2, true)),
    );
    body.push(
        Opcode::Call,
        Operand::Member(MemberRef::new("System.Text.Encoding", "Utf8GetString", 1, true)),
    );
    body.push(Opcode::Ret, Operand::None);
    body
}
