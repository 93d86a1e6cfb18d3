//! Identifier rewriting with scope-aware allocation and cross-reference
//! repair.
//!
//! Operands reference members through arena handles, so mutating a name in
//! place repairs every bytecode reference implicitly. The work here is
//! deciding what may be renamed: runtime-special members, constructors,
//! excluded members, public surface, virtual dispatch linkage and
//! platform-invoke declarations all keep their names. String-form
//! (reflection) references cannot be repaired and are reported instead.

use super::Pass;
use crate::context::ProtectionContext;
use crate::diagnostics::{codes, Diagnostic};
use crate::error::PassError;
use crate::module::{
    EventId, FieldFlags, FieldId, MethodFlags, MethodId, Module, Opcode, Operand, PropertyId,
    TypeFlags, TypeId,
};
use crate::naming::{NameAllocator, NameIntent, NameScope};
use modshield_config::{RenamingMode, RenamingSettings};
use std::collections::{HashMap, HashSet};

pub struct RenamingPass;

/// Pre-transform full names, captured before any mutation so exclusion
/// rules and the rename map both speak the input module's language.
struct NameSnapshot {
    types: Vec<String>,
    methods: Vec<String>,
    fields: Vec<String>,
    properties: Vec<String>,
    events: Vec<String>,
}

impl NameSnapshot {
    fn capture(module: &Module) -> Self {
        let member = |declaring: TypeId, name: &str| {
            format!("{}::{}", module.type_full_name(declaring), name)
        };
        Self {
            types: module.type_ids().map(|id| module.type_full_name(id)).collect(),
            methods: module
                .methods
                .iter()
                .map(|m| member(m.declaring, &m.name))
                .collect(),
            fields: module
                .fields
                .iter()
                .map(|f| member(f.declaring, &f.name))
                .collect(),
            properties: module
                .properties
                .iter()
                .map(|p| member(p.declaring, &p.name))
                .collect(),
            events: module
                .events
                .iter()
                .map(|e| member(e.declaring, &e.name))
                .collect(),
        }
    }
}

/// Per-type member avoid-sets, seeded lazily from the type's current
/// members.
struct MemberScopes {
    scopes: HashMap<TypeId, NameScope>,
}

impl MemberScopes {
    fn new() -> Self {
        Self {
            scopes: HashMap::new(),
        }
    }

    fn scope_mut(&mut self, module: &Module, declaring: TypeId) -> &mut NameScope {
        self.scopes.entry(declaring).or_insert_with(|| {
            let ty = module.type_def(declaring);
            let mut names: Vec<String> = Vec::new();
            names.extend(ty.methods.iter().map(|&m| module.method(m).name.clone()));
            names.extend(ty.fields.iter().map(|&f| module.field(f).name.clone()));
            names.extend(ty.properties.iter().map(|&p| module.property(p).name.clone()));
            names.extend(ty.events.iter().map(|&e| module.event(e).name.clone()));
            NameScope::with_names(names)
        })
    }
}

impl RenamingPass {
    fn type_preserved(&self, module: &Module, ctx: &ProtectionContext, id: TypeId, original: &str) -> bool {
        let ty = module.type_def(id);
        if ty.is_global_module() {
            return true;
        }
        if ty.flags.intersects(TypeFlags::SPECIAL_NAME | TypeFlags::RT_SPECIAL_NAME) {
            return true;
        }
        if ctx.preservation.is_framework_name(original) {
            return true;
        }
        if ctx.preservation.type_excluded_by_name(original, &ty.namespace) {
            return true;
        }
        if ctx.preservation.preserve_public_api() && module.is_type_public(id) {
            return true;
        }
        false
    }

    /// The preservation filter for methods. Accessor methods are preserved
    /// here and renamed through their property or event instead.
    fn method_preserved(
        &self,
        module: &Module,
        ctx: &ProtectionContext,
        id: MethodId,
        snapshot: &NameSnapshot,
    ) -> bool {
        let method = module.method(id);
        if method.flags.contains(MethodFlags::RT_SPECIAL_NAME) || method.is_constructor() {
            return true;
        }
        if method.flags.contains(MethodFlags::SPECIAL_NAME) {
            return true;
        }
        if method.is_operator() {
            return true;
        }
        let original = &snapshot.methods[id.index()];
        if ctx.preservation.method_excluded(original) {
            return true;
        }
        if self.container_excluded(module, ctx, method.declaring, snapshot) {
            return true;
        }
        if ctx.preservation.preserve_public_api()
            && method.flags.contains(MethodFlags::PUBLIC)
            && module.is_type_public(method.declaring)
        {
            return true;
        }
        if method.flags.contains(MethodFlags::VIRTUAL) && method.implements.is_none() {
            // Virtual linkage to out-of-module bases cannot be repaired.
            return true;
        }
        if method.pinvoke.is_some() || method.flags.contains(MethodFlags::PINVOKE_IMPL) {
            return true;
        }
        false
    }

    fn field_preserved(
        &self,
        module: &Module,
        ctx: &ProtectionContext,
        id: FieldId,
        settings: &RenamingSettings,
        snapshot: &NameSnapshot,
    ) -> bool {
        let field = module.field(id);
        if field
            .flags
            .intersects(FieldFlags::SPECIAL_NAME | FieldFlags::RT_SPECIAL_NAME)
        {
            return true;
        }
        let declaring = module.type_def(field.declaring);
        if declaring.flags.contains(TypeFlags::ENUM)
            && field.flags.contains(FieldFlags::LITERAL)
            && !settings.rename_enum_members
        {
            return true;
        }
        if self.container_excluded(module, ctx, field.declaring, snapshot) {
            return true;
        }
        if ctx.preservation.preserve_public_api()
            && field.flags.contains(FieldFlags::PUBLIC)
            && module.is_type_public(field.declaring)
        {
            return true;
        }
        false
    }

    fn container_excluded(
        &self,
        module: &Module,
        ctx: &ProtectionContext,
        declaring: TypeId,
        snapshot: &NameSnapshot,
    ) -> bool {
        let original = &snapshot.types[declaring.index()];
        let namespace = &module.type_def(declaring).namespace;
        ctx.preservation.is_framework_name(original)
            || ctx.preservation.type_excluded_by_name(original, namespace)
    }
}

impl Pass for RenamingPass {
    fn id(&self) -> &'static str {
        "renaming"
    }

    fn name(&self) -> &'static str {
        "Identifier renaming"
    }

    fn description(&self) -> &'static str {
        "Rewrites type and member names while preserving semantic linkages"
    }

    fn priority(&self) -> i32 {
        100
    }

    fn can_apply(&self, module: &Module) -> bool {
        module.has_user_types()
    }

    fn apply(&self, module: &mut Module, ctx: &mut ProtectionContext) -> Result<(), PassError> {
        let settings = ctx.config.renaming.clone();
        if settings.mode == RenamingMode::None {
            ctx.info(codes::RENAME_SUMMARY, "renaming mode is none; nothing renamed");
            return Ok(());
        }

        let snapshot = NameSnapshot::capture(module);
        let mut allocator = NameAllocator::new(settings.scheme, settings.mode);
        let mut scopes = MemberScopes::new();
        let mut renamed_simple_names: HashSet<String> = HashSet::new();
        let mut renamed = 0usize;

        // Types. The module-wide avoid-set covers every existing type name
        // so minted names cannot shadow survivors.
        let mut type_scope =
            NameScope::with_names(module.types.iter().map(|t| t.name.clone()));
        for id in module.type_ids() {
            if self.type_preserved(module, ctx, id, &snapshot.types[id.index()]) {
                continue;
            }
            let fresh = allocator.mint(&mut ctx.rng, &mut type_scope, NameIntent::Type);
            ctx.rename_map.insert(&snapshot.types[id.index()], &fresh);
            renamed_simple_names.insert(module.type_def(id).name.clone());
            let ty = module.type_def_mut(id);
            ty.name = fresh;
            if settings.flatten_namespaces && ty.enclosing.is_none() {
                ty.namespace = settings.namespace_prefix.clone();
            }
            renamed += 1;
        }

        // Interface methods defined in this module rename first; their
        // implementors adopt the same fresh name so dispatch stays linked.
        let mut interface_names: HashMap<MethodId, String> = HashMap::new();
        for id in module.method_ids() {
            let declaring = module.method(id).declaring;
            if !module.type_def(declaring).flags.contains(TypeFlags::INTERFACE) {
                continue;
            }
            if self.method_preserved_on_interface(module, ctx, id, &snapshot) {
                continue;
            }
            let scope = scopes.scope_mut(module, declaring);
            let fresh = allocator.mint(&mut ctx.rng, scope, NameIntent::Method);
            ctx.rename_map.insert(&snapshot.methods[id.index()], &fresh);
            renamed_simple_names.insert(module.method(id).name.clone());
            interface_names.insert(id, fresh.clone());
            module.method_mut(id).name = fresh;
            renamed += 1;
        }

        // Remaining methods.
        for id in module.method_ids() {
            let method = module.method(id);
            let declaring = method.declaring;
            if module.type_def(declaring).flags.contains(TypeFlags::INTERFACE) {
                continue;
            }
            if let Some(interface_method) = method.implements {
                if let Some(adopted) = interface_names.get(&interface_method) {
                    let adopted = adopted.clone();
                    ctx.rename_map.insert(&snapshot.methods[id.index()], &adopted);
                    renamed_simple_names.insert(module.method(id).name.clone());
                    scopes.scope_mut(module, declaring).register(adopted.clone());
                    module.method_mut(id).name = adopted;
                    renamed += 1;
                }
                // An implementor of a preserved in-module interface method
                // keeps its name with the interface.
                continue;
            }
            if self.method_preserved(module, ctx, id, &snapshot) {
                continue;
            }
            let scope = scopes.scope_mut(module, declaring);
            let fresh = allocator.mint(&mut ctx.rng, scope, NameIntent::Method);
            ctx.rename_map.insert(&snapshot.methods[id.index()], &fresh);
            renamed_simple_names.insert(module.method(id).name.clone());
            module.method_mut(id).name = fresh;
            renamed += 1;
        }

        // Fields.
        if settings.rename_fields {
            for id in module.field_ids() {
                if self.field_preserved(module, ctx, id, &settings, &snapshot) {
                    continue;
                }
                let declaring = module.field(id).declaring;
                let scope = scopes.scope_mut(module, declaring);
                let fresh = allocator.mint(&mut ctx.rng, scope, NameIntent::Field);
                ctx.rename_map.insert(&snapshot.fields[id.index()], &fresh);
                renamed_simple_names.insert(module.field(id).name.clone());
                module.field_mut(id).name = fresh;
                renamed += 1;
            }
        }

        // Properties, with accessor synchronisation.
        if settings.rename_properties {
            for index in 0..module.properties.len() {
                let id = PropertyId(index as u32);
                let property = module.property(id);
                let declaring = property.declaring;
                let accessors = [property.get, property.set];
                if self.container_excluded(module, ctx, declaring, &snapshot) {
                    continue;
                }
                // A property whose accessor must keep its name keeps its own.
                if accessors
                    .iter()
                    .flatten()
                    .any(|&m| self.accessor_pinned(module, ctx, m))
                {
                    continue;
                }
                let scope = scopes.scope_mut(module, declaring);
                let fresh = allocator.mint(&mut ctx.rng, scope, NameIntent::Property);
                ctx.rename_map.insert(&snapshot.properties[id.index()], &fresh);
                renamed_simple_names.insert(module.property(id).name.clone());
                module.properties[id.index()].name = fresh.clone();
                renamed += 1;
                let pairs = [("get_", accessors[0]), ("set_", accessors[1])];
                for (prefix, accessor) in pairs {
                    if let Some(m) = accessor {
                        let synced = format!("{prefix}{fresh}");
                        ctx.rename_map.insert(&snapshot.methods[m.index()], &synced);
                        module.method_mut(m).name = synced;
                    }
                }
            }
        }

        // Events, same shape as properties.
        if settings.rename_events {
            for index in 0..module.events.len() {
                let id = EventId(index as u32);
                let event = module.event(id);
                let declaring = event.declaring;
                let accessors = [event.add, event.remove, event.raise];
                if self.container_excluded(module, ctx, declaring, &snapshot) {
                    continue;
                }
                if accessors
                    .iter()
                    .flatten()
                    .any(|&m| self.accessor_pinned(module, ctx, m))
                {
                    continue;
                }
                let scope = scopes.scope_mut(module, declaring);
                let fresh = allocator.mint(&mut ctx.rng, scope, NameIntent::Event);
                ctx.rename_map.insert(&snapshot.events[id.index()], &fresh);
                renamed_simple_names.insert(module.event(id).name.clone());
                module.events[id.index()].name = fresh.clone();
                renamed += 1;
                let pairs = [
                    ("add_", accessors[0]),
                    ("remove_", accessors[1]),
                    ("raise_", accessors[2]),
                ];
                for (prefix, accessor) in pairs {
                    if let Some(m) = accessor {
                        let synced = format!("{prefix}{fresh}");
                        ctx.rename_map.insert(&snapshot.methods[m.index()], &synced);
                        module.method_mut(m).name = synced;
                    }
                }
            }
        }

        // Reflection-style references are strings the metadata model cannot
        // repair; report and leave them untouched.
        let mut reflection_hits = Vec::new();
        for id in module.method_ids() {
            let Some(body) = &module.method(id).body else {
                continue;
            };
            for instruction in &body.instructions {
                if instruction.opcode != Opcode::LdStr {
                    continue;
                }
                if let Operand::Str(s) = &instruction.operand {
                    if renamed_simple_names.contains(s) || ctx.rename_map.contains(s) {
                        reflection_hits.push((module.method_full_name(id), s.clone()));
                    }
                }
            }
        }
        for (method, literal) in reflection_hits {
            ctx.add_diagnostic(
                Diagnostic::warning(
                    codes::REFLECTION_REFERENCE,
                    format!(
                        "string literal `{literal}` in `{method}` names a renamed member and was left untouched"
                    ),
                )
                .with_payload(serde_json::json!({ "method": method, "literal": literal })),
            );
        }

        log::debug!("renamed {renamed} members");
        ctx.info(codes::RENAME_SUMMARY, format!("renamed {renamed} members"));
        Ok(())
    }
}

impl RenamingPass {
    /// Interface methods skip the virtual-dispatch preservation rule (the
    /// whole point is renaming contract and implementors together) but
    /// respect everything else.
    fn method_preserved_on_interface(
        &self,
        module: &Module,
        ctx: &ProtectionContext,
        id: MethodId,
        snapshot: &NameSnapshot,
    ) -> bool {
        let method = module.method(id);
        if method.flags.contains(MethodFlags::RT_SPECIAL_NAME)
            || method.flags.contains(MethodFlags::SPECIAL_NAME)
        {
            return true;
        }
        if ctx.preservation.method_excluded(&snapshot.methods[id.index()]) {
            return true;
        }
        if self.container_excluded(module, ctx, method.declaring, snapshot) {
            return true;
        }
        if ctx.preservation.preserve_public_api()
            && method.flags.contains(MethodFlags::PUBLIC)
            && module.is_type_public(method.declaring)
        {
            return true;
        }
        false
    }

    /// Accessors that must keep their names pin their property or event.
    fn accessor_pinned(&self, module: &Module, ctx: &ProtectionContext, id: MethodId) -> bool {
        let method = module.method(id);
        if method.flags.contains(MethodFlags::RT_SPECIAL_NAME) {
            return true;
        }
        if method.pinvoke.is_some() {
            return true;
        }
        if method.flags.contains(MethodFlags::VIRTUAL) && method.implements.is_none() {
            return true;
        }
        if ctx.preservation.preserve_public_api()
            && method.flags.contains(MethodFlags::PUBLIC)
            && module.is_type_public(method.declaring)
        {
            return true;
        }
        false
    }
}
