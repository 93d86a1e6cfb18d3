//! The mutable module graph.
//!
//! Metadata items live in flat arenas on [`Module`] and refer to each other
//! through index handles (`TypeId`, `MethodId`, ...). Bytecode operands carry
//! those handles rather than names, so renaming a member repairs every
//! reference implicitly. Bodies and instructions live in [`body`].

mod body;
mod io;

pub use body::{
    ExceptionRegion, ExceptionRegionKind, FlowControl, InstrId, Instruction, Local, LocalId,
    MethodBody, Opcode, Operand, SequencePoint,
};
pub use io::{BincodeModuleIo, ModuleIo};

use bincode::{Decode, Encode};
use bitflags::bitflags;

/// Name of the synthetic container for free-standing members.
pub const GLOBAL_TYPE_NAME: &str = "<Module>";

macro_rules! arena_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode,
        )]
        pub struct $name(pub u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

arena_id!(
    /// Handle into [`Module::types`].
    TypeId
);
arena_id!(
    /// Handle into [`Module::methods`].
    MethodId
);
arena_id!(
    /// Handle into [`Module::fields`].
    FieldId
);
arena_id!(
    /// Handle into [`Module::properties`].
    PropertyId
);
arena_id!(
    /// Handle into [`Module::events`].
    EventId
);

bitflags! {
    /// Attribute bits of a type definition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeFlags: u32 {
        const PUBLIC          = 1 << 0;
        const SEALED          = 1 << 1;
        const ABSTRACT        = 1 << 2;
        const INTERFACE       = 1 << 3;
        const ENUM            = 1 << 4;
        const SPECIAL_NAME    = 1 << 5;
        const RT_SPECIAL_NAME = 1 << 6;
        /// The synthetic module-scope container.
        const GLOBAL_MODULE   = 1 << 7;
    }
}

bitflags! {
    /// Attribute bits of a method definition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodFlags: u32 {
        const PUBLIC          = 1 << 0;
        const STATIC          = 1 << 1;
        const VIRTUAL         = 1 << 2;
        const ABSTRACT        = 1 << 3;
        const SPECIAL_NAME    = 1 << 4;
        const RT_SPECIAL_NAME = 1 << 5;
        /// Declared in metadata as resolving to a native entry point.
        const PINVOKE_IMPL    = 1 << 6;
    }
}

bitflags! {
    /// Attribute bits of a field definition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FieldFlags: u32 {
        const PUBLIC          = 1 << 0;
        const STATIC          = 1 << 1;
        const INIT_ONLY       = 1 << 2;
        /// Compile-time constant (enum members among others).
        const LITERAL         = 1 << 3;
        const SPECIAL_NAME    = 1 << 4;
        const RT_SPECIAL_NAME = 1 << 5;
    }
}

macro_rules! encode_flags {
    ($name:ident) => {
        impl Encode for $name {
            fn encode<E: bincode::enc::Encoder>(
                &self,
                encoder: &mut E,
            ) -> Result<(), bincode::error::EncodeError> {
                self.bits().encode(encoder)
            }
        }

        impl<Context> Decode<Context> for $name {
            fn decode<D: bincode::de::Decoder<Context = Context>>(
                decoder: &mut D,
            ) -> Result<Self, bincode::error::DecodeError> {
                Ok(Self::from_bits_retain(u32::decode(decoder)?))
            }
        }

        impl<'de, Context> bincode::BorrowDecode<'de, Context> for $name {
            fn borrow_decode<D: bincode::de::BorrowDecoder<'de, Context = Context>>(
                decoder: &mut D,
            ) -> Result<Self, bincode::error::DecodeError> {
                Ok(Self::from_bits_retain(u32::decode(decoder)?))
            }
        }
    };
}

encode_flags!(TypeFlags);
encode_flags!(MethodFlags);
encode_flags!(FieldFlags);

/// Shape of a value slot in signatures, locals and fields.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum TypeSig {
    Void,
    Bool,
    Int32,
    Int64,
    Float64,
    Str,
    ByteArray,
    Object,
    /// A named type, in-module or external, by full name.
    Named(String),
}

/// Method signature. Instance methods carry their receiver as an explicit
/// leading parameter, so call-site stack accounting reads straight off
/// `params`.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct MethodSig {
    pub params: Vec<TypeSig>,
    pub ret: TypeSig,
}

impl MethodSig {
    pub fn new(params: Vec<TypeSig>, ret: TypeSig) -> Self {
        Self { params, ret }
    }

    pub fn returns_value(&self) -> bool {
        self.ret != TypeSig::Void
    }
}

/// Reference to a member defined outside the module (framework surface).
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct MemberRef {
    pub declaring_type: String,
    pub name: String,
    pub signature: MemberRefSig,
}

/// Arity view of an external member: how many values the call consumes and
/// whether it pushes one back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct MemberRefSig {
    pub params: u8,
    pub returns_value: bool,
}

impl MemberRef {
    pub fn new(
        declaring_type: impl Into<String>,
        name: impl Into<String>,
        params: u8,
        returns_value: bool,
    ) -> Self {
        Self {
            declaring_type: declaring_type.into(),
            name: name.into(),
            signature: MemberRefSig {
                params,
                returns_value,
            },
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}::{}", self.declaring_type, self.name)
    }
}

/// One positional argument of a custom attribute.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum AttrArg {
    Str(String),
    Int32(i32),
    Bool(bool),
}

/// A custom attribute attached to the module, a type or a method.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct CustomAttribute {
    pub ctor: MemberRef,
    pub args: Vec<AttrArg>,
}

/// Platform-invoke record of a method without a managed body.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct PInvokeInfo {
    pub module: String,
    pub entry_point: String,
}

/// A type definition.
#[derive(Debug, Clone, Encode, Decode)]
pub struct TypeDef {
    pub namespace: String,
    pub name: String,
    pub flags: TypeFlags,
    /// Enclosing type for nested types.
    pub enclosing: Option<TypeId>,
    /// In-module interfaces this type implements.
    pub interfaces: Vec<TypeId>,
    pub methods: Vec<MethodId>,
    pub fields: Vec<FieldId>,
    pub properties: Vec<PropertyId>,
    pub events: Vec<EventId>,
    pub custom_attributes: Vec<CustomAttribute>,
}

impl TypeDef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, flags: TypeFlags) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            flags,
            enclosing: None,
            interfaces: Vec::new(),
            methods: Vec::new(),
            fields: Vec::new(),
            properties: Vec::new(),
            events: Vec::new(),
            custom_attributes: Vec::new(),
        }
    }

    pub fn is_global_module(&self) -> bool {
        self.flags.contains(TypeFlags::GLOBAL_MODULE)
    }
}

/// A method definition.
#[derive(Debug, Clone, Encode, Decode)]
pub struct Method {
    pub name: String,
    pub flags: MethodFlags,
    pub declaring: TypeId,
    pub signature: MethodSig,
    /// Present on platform-invoke declarations; such methods have no body.
    pub pinvoke: Option<PInvokeInfo>,
    pub body: Option<MethodBody>,
    /// In-module interface method this method implements, if any.
    pub implements: Option<MethodId>,
    pub custom_attributes: Vec<CustomAttribute>,
}

impl Method {
    pub fn new(
        name: impl Into<String>,
        flags: MethodFlags,
        declaring: TypeId,
        signature: MethodSig,
    ) -> Self {
        Self {
            name: name.into(),
            flags,
            declaring,
            signature,
            pinvoke: None,
            body: None,
            implements: None,
            custom_attributes: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: MethodBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn is_constructor(&self) -> bool {
        self.flags.contains(MethodFlags::RT_SPECIAL_NAME)
            && (self.name == ".ctor" || self.name == ".cctor")
    }

    pub fn is_static_initializer(&self) -> bool {
        self.name == ".cctor" && self.flags.contains(MethodFlags::STATIC)
    }

    /// Property/event accessor or operator overload, by naming convention.
    pub fn is_accessor(&self) -> bool {
        self.flags.contains(MethodFlags::SPECIAL_NAME)
            && ["get_", "set_", "add_", "remove_", "raise_"]
                .iter()
                .any(|p| self.name.starts_with(p))
    }

    pub fn is_operator(&self) -> bool {
        self.name.starts_with("op_")
    }
}

/// A field definition.
#[derive(Debug, Clone, Encode, Decode)]
pub struct Field {
    pub name: String,
    pub flags: FieldFlags,
    pub declaring: TypeId,
    pub ty: TypeSig,
    /// Static data blob mapped behind the field (ciphertext arrays).
    pub initial_value: Option<Vec<u8>>,
}

impl Field {
    pub fn new(
        name: impl Into<String>,
        flags: FieldFlags,
        declaring: TypeId,
        ty: TypeSig,
    ) -> Self {
        Self {
            name: name.into(),
            flags,
            declaring,
            ty,
            initial_value: None,
        }
    }
}

/// A property with optional accessors.
#[derive(Debug, Clone, Encode, Decode)]
pub struct Property {
    pub name: String,
    pub declaring: TypeId,
    pub get: Option<MethodId>,
    pub set: Option<MethodId>,
}

/// An event with optional accessors.
#[derive(Debug, Clone, Encode, Decode)]
pub struct Event {
    pub name: String,
    pub declaring: TypeId,
    pub add: Option<MethodId>,
    pub remove: Option<MethodId>,
    pub raise: Option<MethodId>,
}

/// A loaded module: flat metadata arenas plus module-wide state.
#[derive(Debug, Clone, Encode, Decode)]
pub struct Module {
    pub name: String,
    pub types: Vec<TypeDef>,
    pub methods: Vec<Method>,
    pub fields: Vec<Field>,
    pub properties: Vec<Property>,
    pub events: Vec<Event>,
    /// The synthetic container for free-standing members; always present.
    pub global_type: TypeId,
    pub entry_point: Option<MethodId>,
    pub custom_attributes: Vec<CustomAttribute>,
}

impl Module {
    /// A module containing only the global type.
    pub fn new(name: impl Into<String>) -> Self {
        let global = TypeDef::new("", GLOBAL_TYPE_NAME, TypeFlags::GLOBAL_MODULE);
        Self {
            name: name.into(),
            types: vec![global],
            methods: Vec::new(),
            fields: Vec::new(),
            properties: Vec::new(),
            events: Vec::new(),
            global_type: TypeId(0),
            entry_point: None,
            custom_attributes: Vec::new(),
        }
    }

    pub fn type_def(&self, id: TypeId) -> &TypeDef {
        &self.types[id.index()]
    }

    pub fn type_def_mut(&mut self, id: TypeId) -> &mut TypeDef {
        &mut self.types[id.index()]
    }

    pub fn method(&self, id: MethodId) -> &Method {
        &self.methods[id.index()]
    }

    pub fn method_mut(&mut self, id: MethodId) -> &mut Method {
        &mut self.methods[id.index()]
    }

    pub fn field(&self, id: FieldId) -> &Field {
        &self.fields[id.index()]
    }

    pub fn field_mut(&mut self, id: FieldId) -> &mut Field {
        &mut self.fields[id.index()]
    }

    pub fn property(&self, id: PropertyId) -> &Property {
        &self.properties[id.index()]
    }

    pub fn event(&self, id: EventId) -> &Event {
        &self.events[id.index()]
    }

    pub fn type_ids(&self) -> impl Iterator<Item = TypeId> + use<> {
        (0..self.types.len() as u32).map(TypeId)
    }

    pub fn method_ids(&self) -> impl Iterator<Item = MethodId> + use<> {
        (0..self.methods.len() as u32).map(MethodId)
    }

    pub fn field_ids(&self) -> impl Iterator<Item = FieldId> + use<> {
        (0..self.fields.len() as u32).map(FieldId)
    }

    pub fn add_type(&mut self, ty: TypeDef) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.types.push(ty);
        id
    }

    /// Adds a method and registers it on its declaring type.
    pub fn add_method(&mut self, method: Method) -> MethodId {
        let declaring = method.declaring;
        let id = MethodId(self.methods.len() as u32);
        self.methods.push(method);
        self.types[declaring.index()].methods.push(id);
        id
    }

    pub fn add_field(&mut self, field: Field) -> FieldId {
        let declaring = field.declaring;
        let id = FieldId(self.fields.len() as u32);
        self.fields.push(field);
        self.types[declaring.index()].fields.push(id);
        id
    }

    pub fn add_property(&mut self, property: Property) -> PropertyId {
        let declaring = property.declaring;
        let id = PropertyId(self.properties.len() as u32);
        self.properties.push(property);
        self.types[declaring.index()].properties.push(id);
        id
    }

    pub fn add_event(&mut self, event: Event) -> EventId {
        let declaring = event.declaring;
        let id = EventId(self.events.len() as u32);
        self.events.push(event);
        self.types[declaring.index()].events.push(id);
        id
    }

    /// Full name of a type: `Namespace.Name`, with `/` separating nesting.
    pub fn type_full_name(&self, id: TypeId) -> String {
        let ty = self.type_def(id);
        match ty.enclosing {
            Some(parent) => format!("{}/{}", self.type_full_name(parent), ty.name),
            None if ty.namespace.is_empty() => ty.name.clone(),
            None => format!("{}.{}", ty.namespace, ty.name),
        }
    }

    /// Full name of a method: `Namespace.Type::Name`.
    pub fn method_full_name(&self, id: MethodId) -> String {
        let method = self.method(id);
        format!("{}::{}", self.type_full_name(method.declaring), method.name)
    }

    /// Full name of a field: `Namespace.Type::Name`.
    pub fn field_full_name(&self, id: FieldId) -> String {
        let field = self.field(id);
        format!("{}::{}", self.type_full_name(field.declaring), field.name)
    }

    /// Whether the type is reachable from outside the module: public itself
    /// and, for nested types, enclosed only by public types.
    pub fn is_type_public(&self, id: TypeId) -> bool {
        let ty = self.type_def(id);
        if !ty.flags.contains(TypeFlags::PUBLIC) {
            return false;
        }
        match ty.enclosing {
            Some(parent) => self.is_type_public(parent),
            None => true,
        }
    }

    /// Whether a module type other than the global container exists.
    pub fn has_user_types(&self) -> bool {
        self.types.iter().any(|t| !t.is_global_module())
    }

    /// The module static initializer on the global type, if present.
    pub fn module_initializer(&self) -> Option<MethodId> {
        self.type_def(self.global_type)
            .methods
            .iter()
            .copied()
            .find(|&m| self.method(m).is_static_initializer())
    }

    /// All bodies, for whole-module sweeps.
    pub fn bodies_mut(&mut self) -> impl Iterator<Item = &mut MethodBody> {
        self.methods.iter_mut().filter_map(|m| m.body.as_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_module_has_only_the_global_type() {
        let module = Module::new("demo");
        assert_eq!(module.types.len(), 1);
        assert!(module.type_def(module.global_type).is_global_module());
        assert!(!module.has_user_types());
    }

    #[test]
    fn full_names_combine_namespace_and_nesting() {
        let mut module = Module::new("demo");
        let outer = module.add_type(TypeDef::new("Acme.App", "Outer", TypeFlags::PUBLIC));
        let mut nested = TypeDef::new("", "Inner", TypeFlags::empty());
        nested.enclosing = Some(outer);
        let inner = module.add_type(nested);
        assert_eq!(module.type_full_name(outer), "Acme.App.Outer");
        assert_eq!(module.type_full_name(inner), "Acme.App.Outer/Inner");
    }

    #[test]
    fn add_method_registers_on_declaring_type() {
        let mut module = Module::new("demo");
        let ty = module.add_type(TypeDef::new("A", "T", TypeFlags::empty()));
        let m = module.add_method(Method::new(
            "Run",
            MethodFlags::STATIC,
            ty,
            MethodSig::new(vec![], TypeSig::Void),
        ));
        assert_eq!(module.type_def(ty).methods, vec![m]);
        assert_eq!(module.method_full_name(m), "A.T::Run");
    }

    #[test]
    fn nested_visibility_requires_public_chain() {
        let mut module = Module::new("demo");
        let outer = module.add_type(TypeDef::new("A", "Outer", TypeFlags::empty()));
        let mut nested = TypeDef::new("", "Inner", TypeFlags::PUBLIC);
        nested.enclosing = Some(outer);
        let inner = module.add_type(nested);
        assert!(!module.is_type_public(inner));
    }

    #[test]
    fn constructor_detection_uses_rt_special_name() {
        let mut module = Module::new("demo");
        let ty = module.add_type(TypeDef::new("A", "T", TypeFlags::empty()));
        let ctor = Method::new(
            ".ctor",
            MethodFlags::SPECIAL_NAME | MethodFlags::RT_SPECIAL_NAME,
            ty,
            MethodSig::new(vec![TypeSig::Object], TypeSig::Void),
        );
        assert!(ctor.is_constructor());
        let cctor = Method::new(
            ".cctor",
            MethodFlags::STATIC | MethodFlags::RT_SPECIAL_NAME,
            ty,
            MethodSig::new(vec![], TypeSig::Void),
        );
        assert!(cctor.is_static_initializer());
    }
}
