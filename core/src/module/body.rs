//! Method bodies: instruction lists, locals, exception regions.
//!
//! Instructions are identified by body-scoped [`InstrId`] handles minted from
//! a per-body counter. Branch operands and exception-region boundaries carry
//! handles, never positions, so passes can insert, remove and reorder
//! instructions without rewriting targets.

use super::{MemberRef, Module, TypeSig};
use bincode::{Decode, Encode};

/// Stable handle to one instruction within one body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct InstrId(pub u32);

/// Handle into a body's local-variable table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub struct LocalId(pub u16);

/// How an instruction leaves the instruction stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    /// Falls through to the next instruction.
    Next,
    /// Falls through after a call.
    Call,
    /// Unconditional transfer.
    Branch,
    /// Two-way or multi-way transfer.
    CondBranch,
    Return,
    Throw,
}

/// The instruction set. Branch and `ldc.i4` opcodes exist in long and short
/// (`*S`) encodings; everything else has one width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub enum Opcode {
    Nop,
    // constants
    LdcI4,
    LdcI4S,
    LdcI8,
    LdcR8,
    LdStr,
    LdNull,
    // locals and arguments
    Ldloc,
    Stloc,
    Ldarg,
    Starg,
    // fields
    Ldfld,
    Stfld,
    Ldsfld,
    Stsfld,
    // calls
    Call,
    Callvirt,
    Newobj,
    // arrays
    Newarr,
    Ldlen,
    Ldelem,
    Stelem,
    // stack
    Dup,
    Pop,
    // arithmetic and bitwise
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Not,
    Neg,
    Shl,
    Shr,
    // comparisons
    Ceq,
    Cgt,
    Clt,
    ConvI4,
    ConvU1,
    // branches
    Br,
    BrS,
    Brtrue,
    BrtrueS,
    Brfalse,
    BrfalseS,
    Beq,
    BeqS,
    BneUn,
    BneUnS,
    Switch,
    // exits
    Ret,
    Throw,
}

impl Opcode {
    pub fn flow_control(self) -> FlowControl {
        use Opcode::*;
        match self {
            Br | BrS => FlowControl::Branch,
            Brtrue | BrtrueS | Brfalse | BrfalseS | Beq | BeqS | BneUn | BneUnS | Switch => {
                FlowControl::CondBranch
            }
            Ret => FlowControl::Return,
            Throw => FlowControl::Throw,
            Call | Callvirt | Newobj => FlowControl::Call,
            _ => FlowControl::Next,
        }
    }

    /// Branch or conditional branch.
    pub fn is_branch(self) -> bool {
        matches!(
            self.flow_control(),
            FlowControl::Branch | FlowControl::CondBranch
        )
    }

    /// Ends a basic block.
    pub fn ends_block(self) -> bool {
        matches!(
            self.flow_control(),
            FlowControl::Branch | FlowControl::CondBranch | FlowControl::Return | FlowControl::Throw
        )
    }

    /// The long encoding of a short-form opcode (identity otherwise).
    pub fn long_form(self) -> Opcode {
        use Opcode::*;
        match self {
            BrS => Br,
            BrtrueS => Brtrue,
            BrfalseS => Brfalse,
            BeqS => Beq,
            BneUnS => BneUn,
            LdcI4S => LdcI4,
            other => other,
        }
    }

    /// The short encoding, when one exists.
    pub fn short_form(self) -> Option<Opcode> {
        use Opcode::*;
        match self {
            Br => Some(BrS),
            Brtrue => Some(BrtrueS),
            Brfalse => Some(BrfalseS),
            Beq => Some(BeqS),
            BneUn => Some(BneUnS),
            LdcI4 => Some(LdcI4S),
            _ => None,
        }
    }

    pub fn is_short(self) -> bool {
        use Opcode::*;
        matches!(self, BrS | BrtrueS | BrfalseS | BeqS | BneUnS | LdcI4S)
    }
}

/// Instruction operand.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum Operand {
    None,
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Str(String),
    Local(LocalId),
    Arg(u16),
    Type(super::TypeId),
    Method(super::MethodId),
    Field(super::FieldId),
    /// Reference to a member outside the module.
    Member(MemberRef),
    /// Jump target.
    Target(InstrId),
    /// Jump table of a `switch`.
    Targets(Vec<InstrId>),
}

/// One (opcode, operand) pair with its stable handle.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct Instruction {
    pub id: InstrId,
    pub opcode: Opcode,
    pub operand: Operand,
}

impl Instruction {
    /// Net stack effect: pushes minus pops. Calls read their arity from the
    /// callee signature; in-module instance methods carry the receiver as an
    /// explicit parameter.
    pub fn stack_delta(&self, module: &Module) -> i32 {
        use Opcode::*;
        match self.opcode {
            Nop | Br | BrS | Ret | Not | Neg | Newarr | Ldlen | ConvI4 | ConvU1 => 0,
            LdcI4 | LdcI4S | LdcI8 | LdcR8 | LdStr | LdNull | Ldloc | Ldarg | Ldsfld | Dup => 1,
            Ldfld => 0,
            Stloc | Starg | Stsfld | Pop | Throw | Switch | Brtrue | BrtrueS | Brfalse
            | BrfalseS => -1,
            Add | Sub | Mul | Div | Rem | And | Or | Xor | Shl | Shr | Ceq | Cgt | Clt
            | Ldelem => -1,
            Stfld | Beq | BeqS | BneUn | BneUnS => -2,
            Stelem => -3,
            Call | Callvirt => match &self.operand {
                Operand::Method(id) => {
                    let sig = &module.method(*id).signature;
                    let pushed = i32::from(sig.returns_value());
                    pushed - sig.params.len() as i32
                }
                Operand::Member(member) => {
                    i32::from(member.signature.returns_value) - i32::from(member.signature.params)
                }
                _ => 0,
            },
            Newobj => match &self.operand {
                // The receiver slot of the ctor signature is produced, not consumed.
                Operand::Method(id) => {
                    1 - (module.method(*id).signature.params.len() as i32 - 1).max(0)
                }
                Operand::Member(member) => {
                    1 - (i32::from(member.signature.params) - 1).max(0)
                }
                _ => 1,
            },
        }
    }

    /// Encoded size in bytes under the on-disk width model. Only relative
    /// sizes matter: the finalizer uses them to decide when a short branch
    /// displacement fits.
    pub fn encoded_size(&self) -> u32 {
        use Opcode::*;
        match self.opcode {
            Nop | LdNull | Dup | Pop | Ret | Throw | Add | Sub | Mul | Div | Rem | And | Or
            | Xor | Not | Neg | Shl | Shr | Ldlen | Ldelem | Stelem | ConvI4 | ConvU1 => 1,
            Ceq | Cgt | Clt => 2,
            LdcI4S | BrS | BrtrueS | BrfalseS | BeqS | BneUnS => 2,
            Ldloc | Stloc | Ldarg | Starg => 4,
            LdcI4 | LdStr | Ldfld | Stfld | Ldsfld | Stsfld | Call | Callvirt | Newobj | Newarr
            | Br | Brtrue | Brfalse | Beq | BneUn => 5,
            LdcI8 | LdcR8 => 9,
            Switch => match &self.operand {
                Operand::Targets(targets) => 5 + 4 * targets.len() as u32,
                _ => 5,
            },
        }
    }
}

/// A local variable slot.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct Local {
    pub ty: TypeSig,
}

/// Kind of a protected region handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum ExceptionRegionKind {
    Catch,
    Finally,
    Fault,
    Filter,
}

/// A protected region. Boundaries are instruction handles; `try_end` and
/// `handler_end` are inclusive.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct ExceptionRegion {
    pub kind: ExceptionRegionKind,
    pub try_start: InstrId,
    pub try_end: InstrId,
    pub handler_start: InstrId,
    pub handler_end: InstrId,
    pub catch_type: Option<String>,
}

/// Source-line anchor for debug symbols.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct SequencePoint {
    pub instruction: InstrId,
    pub line: u32,
}

/// The ordered instruction list of a method plus locals and regions.
#[derive(Debug, Clone, Encode, Decode)]
pub struct MethodBody {
    pub instructions: Vec<Instruction>,
    pub locals: Vec<Local>,
    pub regions: Vec<ExceptionRegion>,
    pub sequence_points: Vec<SequencePoint>,
    next_instr: u32,
}

impl Default for MethodBody {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodBody {
    pub fn new() -> Self {
        Self {
            instructions: Vec::new(),
            locals: Vec::new(),
            regions: Vec::new(),
            sequence_points: Vec::new(),
            next_instr: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Mint a fresh handle without placing an instruction yet.
    pub fn mint_id(&mut self) -> InstrId {
        let id = InstrId(self.next_instr);
        self.next_instr += 1;
        id
    }

    /// Append an instruction; returns its handle.
    pub fn push(&mut self, opcode: Opcode, operand: Operand) -> InstrId {
        let id = self.mint_id();
        self.instructions.push(Instruction { id, opcode, operand });
        id
    }

    /// Insert before `index`; returns the new instruction's handle.
    pub fn insert(&mut self, index: usize, opcode: Opcode, operand: Operand) -> InstrId {
        let id = self.mint_id();
        self.instructions.insert(index, Instruction { id, opcode, operand });
        id
    }

    /// Insert a pre-built instruction (used when a handle was minted ahead
    /// of placement, e.g. for forward branch targets).
    pub fn insert_instr(&mut self, index: usize, instruction: Instruction) {
        self.instructions.insert(index, instruction);
    }

    pub fn add_local(&mut self, ty: TypeSig) -> LocalId {
        let id = LocalId(self.locals.len() as u16);
        self.locals.push(Local { ty });
        id
    }

    /// Position of a handle in the current ordering.
    pub fn position_of(&self, id: InstrId) -> Option<usize> {
        self.instructions.iter().position(|i| i.id == id)
    }

    pub fn instr(&self, id: InstrId) -> Option<&Instruction> {
        self.instructions.iter().find(|i| i.id == id)
    }

    /// Every target referenced by a branch or switch in this body.
    pub fn referenced_targets(&self) -> Vec<InstrId> {
        let mut targets = Vec::new();
        for instruction in &self.instructions {
            match &instruction.operand {
                Operand::Target(t) => targets.push(*t),
                Operand::Targets(table) => targets.extend(table.iter().copied()),
                _ => {}
            }
        }
        targets
    }

    /// Every branch target and region boundary resolves to a live
    /// instruction.
    pub fn targets_resolve(&self) -> bool {
        let live: std::collections::HashSet<InstrId> =
            self.instructions.iter().map(|i| i.id).collect();
        self.referenced_targets().iter().all(|t| live.contains(t))
            && self.regions.iter().all(|r| {
                live.contains(&r.try_start)
                    && live.contains(&r.try_end)
                    && live.contains(&r.handler_start)
                    && live.contains(&r.handler_end)
            })
    }

    /// Byte offset of each instruction under the width model.
    pub fn offsets(&self) -> Vec<u32> {
        let mut offsets = Vec::with_capacity(self.instructions.len());
        let mut offset = 0u32;
        for instruction in &self.instructions {
            offsets.push(offset);
            offset += instruction.encoded_size();
        }
        offsets
    }
}
