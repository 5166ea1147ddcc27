//! Low-level instruction records.
//!
//! The instruction selector produces a [`LirList`] of [`Lir`] records for a
//! single method. Pseudo opcodes mark labels, safepoints, exported PCs and
//! block boundaries; they occupy no code bytes but carry positions that the
//! mapping tables are built from.

pub mod list;
pub mod literal;
pub mod switch;

use serde::{Deserialize, Serialize};

pub use list::{LirId, LirList};
pub use literal::{InvokeType, LiteralId, LiteralPool};
pub use switch::{FillArrayData, SwitchKind, SwitchPayload, SwitchTable};

/// Byte offset into the native code image.
pub type CodeOffset = u32;
/// Offset into the original bytecode, in 16-bit code units.
pub type DexOffset = u32;

/// Number of operand slots in an instruction record.
pub const MAX_OPERANDS: usize = 5;

/// Pseudo opcodes. These never encode to machine code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PseudoOp {
    MethodEntry,
    MethodExit,
    Barrier,
    EntryBlock,
    ExitBlock,
    DalvikByteCodeBoundary,
    Align4,
    EhBlockLabel,
    TargetLabel,
    NormalBlockLabel,
    ThrowTarget,
    IntrinsicRetry,
    SuspendTarget,
    /// Native PC recorded in the pc2dex block.
    SafepointPc,
    /// Native PC recorded in the dex2pc block.
    ExportedPc,
    CaseLabel,
}

impl PseudoOp {
    /// Whether this pseudo op names a position other instructions branch to.
    pub fn is_label(self) -> bool {
        matches!(
            self,
            PseudoOp::EhBlockLabel
                | PseudoOp::TargetLabel
                | PseudoOp::NormalBlockLabel
                | PseudoOp::ThrowTarget
                | PseudoOp::IntrinsicRetry
                | PseudoOp::SuspendTarget
                | PseudoOp::CaseLabel
        )
    }
}

/// Opcode of an instruction record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Opcode {
    Pseudo(PseudoOp),
    /// Target-specific opcode, opaque to this layer.
    Target(u16),
}

impl Opcode {
    pub fn is_pseudo(self) -> bool {
        matches!(self, Opcode::Pseudo(_))
    }
}

/// Kind of fixup the encoder must apply to an instruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FixupKind {
    #[default]
    None,
    Label,
    Load,
    Branch,
    CondBranch,
    Adr,
    SwitchTable,
}

/// Resource mask bits. The low bits are owned by the target's register
/// numbering; the top bits describe memory.
pub mod resource {
    pub const ENCODE_ALL: u64 = !0;
    pub const ENCODE_MUST_NOT_ALIAS: u64 = 1 << 63;
    pub const ENCODE_HEAP_REF: u64 = 1 << 62;
    pub const ENCODE_LITERAL: u64 = 1 << 61;
    pub const ENCODE_DALVIK_REG: u64 = 1 << 60;
    pub const ENCODE_MEM: u64 =
        ENCODE_DALVIK_REG | ENCODE_LITERAL | ENCODE_HEAP_REF | ENCODE_MUST_NOT_ALIAS;
}

/// Kind of memory a load or store touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemRefKind {
    Literal,
    DalvikReg,
    HeapRef,
    MustNotAlias,
}

/// Use/def resource masks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMasks {
    pub use_mask: u64,
    pub def_mask: u64,
}

/// Per-instruction flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LirFlags {
    pub is_nop: bool,
    pub fixup: FixupKind,
    /// Dalvik register id, MSB set for 64-bit accesses.
    pub alias_info: u32,
    /// Set once the resource masks were repurposed and must not be read.
    pub use_def_invalid: bool,
}

/// Encode a dalvik register id and width into `alias_info`.
pub fn encode_alias_info(reg: u32, is_64bit: bool) -> u32 {
    (reg & 0x7fff_ffff) | if is_64bit { 1 << 31 } else { 0 }
}

/// A low-level instruction record.
#[derive(Debug, Clone, PartialEq)]
pub struct Lir {
    pub opcode: Opcode,
    pub operands: [i32; MAX_OPERANDS],
    /// Source PC of the bytecode this instruction was generated for.
    pub dex_offset: DexOffset,
    /// Native offset, valid only after the encoder assigned offsets.
    pub offset: CodeOffset,
    pub masks: ResourceMasks,
    pub flags: LirFlags,
    pub(crate) prev: Option<LirId>,
    pub(crate) next: Option<LirId>,
    pub(crate) linked: bool,
}

impl Lir {
    pub fn new(opcode: Opcode, dex_offset: DexOffset) -> Self {
        Self {
            opcode,
            operands: [0; MAX_OPERANDS],
            dex_offset,
            offset: 0,
            masks: ResourceMasks::default(),
            flags: LirFlags::default(),
            prev: None,
            next: None,
            linked: false,
        }
    }

    pub fn pseudo(op: PseudoOp, dex_offset: DexOffset) -> Self {
        Self::new(Opcode::Pseudo(op), dex_offset)
    }

    pub fn target(opcode: u16, dex_offset: DexOffset, operands: &[i32]) -> Self {
        let mut lir = Self::new(Opcode::Target(opcode), dex_offset);
        let n = operands.len().min(MAX_OPERANDS);
        lir.operands[..n].copy_from_slice(&operands[..n]);
        lir
    }

    pub fn with_fixup(mut self, fixup: FixupKind) -> Self {
        self.flags.fixup = fixup;
        self
    }

    pub fn prev(&self) -> Option<LirId> {
        self.prev
    }

    pub fn next(&self) -> Option<LirId> {
        self.next
    }

    pub fn is_linked(&self) -> bool {
        self.linked
    }

    pub fn is_pseudo(&self, op: PseudoOp) -> bool {
        self.opcode == Opcode::Pseudo(op)
    }

    /// Replace the memory bits of the use (load) or def (store) mask.
    pub fn set_mem_ref_type(&mut self, is_load: bool, kind: MemRefKind) {
        debug_assert!(!self.flags.use_def_invalid);
        let mask = if is_load {
            &mut self.masks.use_mask
        } else {
            &mut self.masks.def_mask
        };
        *mask &= !resource::ENCODE_MEM;
        *mask |= match kind {
            MemRefKind::Literal => {
                debug_assert!(is_load, "literal pool is read-only");
                resource::ENCODE_LITERAL
            }
            MemRefKind::DalvikReg => resource::ENCODE_DALVIK_REG,
            MemRefKind::HeapRef => resource::ENCODE_HEAP_REF,
            MemRefKind::MustNotAlias => {
                debug_assert!(is_load, "only loads can be marked must-not-alias");
                resource::ENCODE_MUST_NOT_ALIAS
            }
        };
    }

    /// Mark a load/store that accesses a dalvik register through the stack.
    pub fn annotate_dalvik_reg_access(&mut self, reg: u32, is_load: bool, is_64bit: bool) {
        self.set_mem_ref_type(is_load, MemRefKind::DalvikReg);
        self.flags.alias_info = encode_alias_info(reg, is_64bit);
    }
}

/// Bytecode conditional branch opcodes understood by [`evaluate_branch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfOpcode {
    IfEq,
    IfNe,
    IfLt,
    IfGe,
    IfGt,
    IfLe,
    IfEqz,
    IfNez,
    IfLtz,
    IfGez,
    IfGtz,
    IfLez,
}

/// Fold a conditional branch whose operands are both constant.
pub fn evaluate_branch(opcode: IfOpcode, src1: i32, src2: i32) -> bool {
    match opcode {
        IfOpcode::IfEq => src1 == src2,
        IfOpcode::IfNe => src1 != src2,
        IfOpcode::IfLt => src1 < src2,
        IfOpcode::IfGe => src1 >= src2,
        IfOpcode::IfGt => src1 > src2,
        IfOpcode::IfLe => src1 <= src2,
        IfOpcode::IfEqz => src1 == 0,
        IfOpcode::IfNez => src1 != 0,
        IfOpcode::IfLtz => src1 < 0,
        IfOpcode::IfGez => src1 >= 0,
        IfOpcode::IfGtz => src1 > 0,
        IfOpcode::IfLez => src1 <= 0,
    }
}

/// Comparison condition codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionCode {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

/// Condition for `b op a` given the condition for `a op b`.
pub fn flip_comparison_order(before: ConditionCode) -> ConditionCode {
    match before {
        ConditionCode::Eq => ConditionCode::Eq,
        ConditionCode::Ne => ConditionCode::Ne,
        ConditionCode::Lt => ConditionCode::Gt,
        ConditionCode::Gt => ConditionCode::Lt,
        ConditionCode::Le => ConditionCode::Ge,
        ConditionCode::Ge => ConditionCode::Le,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_ref_type_replaces_memory_bits() {
        let mut lir = Lir::target(1, 0, &[0, 1]);
        lir.masks.use_mask = 0b1010 | resource::ENCODE_HEAP_REF;
        lir.set_mem_ref_type(true, MemRefKind::Literal);
        assert_eq!(lir.masks.use_mask, 0b1010 | resource::ENCODE_LITERAL);
        assert_eq!(lir.masks.def_mask, 0);
    }

    #[test]
    fn test_annotate_dalvik_reg_access() {
        let mut lir = Lir::target(2, 0, &[]);
        lir.annotate_dalvik_reg_access(7, false, true);
        assert_eq!(lir.masks.def_mask, resource::ENCODE_DALVIK_REG);
        assert_eq!(lir.flags.alias_info, 7 | (1 << 31));
    }

    #[test]
    fn test_evaluate_branch() {
        assert!(evaluate_branch(IfOpcode::IfLt, -1, 3));
        assert!(!evaluate_branch(IfOpcode::IfGe, -1, 3));
        assert!(evaluate_branch(IfOpcode::IfLez, 0, 99));
        assert!(!evaluate_branch(IfOpcode::IfGtz, 0, 99));
        assert!(evaluate_branch(IfOpcode::IfNe, 4, 5));
    }

    #[test]
    fn test_flip_comparison_order() {
        assert_eq!(flip_comparison_order(ConditionCode::Lt), ConditionCode::Gt);
        assert_eq!(flip_comparison_order(ConditionCode::Ge), ConditionCode::Le);
        assert_eq!(flip_comparison_order(ConditionCode::Eq), ConditionCode::Eq);
    }
}
