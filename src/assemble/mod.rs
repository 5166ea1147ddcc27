//! Layout and installation of the code image.
//!
//! The machine-code encoder is an external collaborator reached through
//! [`InstructionEncoder`]; this module owns everything around it: the
//! output buffer, the data layout and the data installers.

pub mod codebuf;
pub mod install;
pub mod layout;

pub use codebuf::CodeBuffer;
pub use layout::DataLayout;

use crate::codegen::CodegenUnit;
use crate::error::Result;
use crate::lir::{CodeOffset, LirId, LirList, Opcode, PseudoOp};

/// Target-specific machine-code encoder.
pub trait InstructionEncoder {
    /// Stamp a native offset on every linked instruction and return the
    /// size of the instruction stream in bytes. Nops occupy no space.
    fn assign_offsets(&mut self, lir: &mut LirList) -> Result<CodeOffset>;

    /// Encode the instruction stream. Data offsets are assigned by the time
    /// this runs, so PC-relative literal loads can be resolved.
    fn encode(&mut self, unit: &CodegenUnit) -> Result<Vec<u8>>;
}

/// Encoder where every target instruction has the same width. Used by the
/// CLI and tests; the bytes are a placeholder of opcode and first operand.
#[derive(Debug, Clone, Copy)]
pub struct FixedWidthEncoder {
    width: u32,
}

impl FixedWidthEncoder {
    pub fn new(width: u32) -> Self {
        Self { width }
    }
}

impl Default for FixedWidthEncoder {
    fn default() -> Self {
        Self::new(4)
    }
}

impl InstructionEncoder for FixedWidthEncoder {
    fn assign_offsets(&mut self, lir: &mut LirList) -> Result<CodeOffset> {
        let ids: Vec<LirId> = lir.iter().map(|(id, _)| id).collect();
        let mut offset: CodeOffset = 0;
        for id in ids {
            let insn = lir.get_mut(id);
            if insn.opcode == Opcode::Pseudo(PseudoOp::Align4) {
                offset = codebuf::align_up(offset, 4);
            }
            insn.offset = offset;
            if !insn.flags.is_nop && !insn.opcode.is_pseudo() {
                offset += self.width;
            }
        }
        Ok(offset)
    }

    fn encode(&mut self, unit: &CodegenUnit) -> Result<Vec<u8>> {
        let mut buf = CodeBuffer::new();
        for (_, insn) in unit.lir().live() {
            if let Opcode::Target(opcode) = insn.opcode {
                buf.pad_to(insn.offset);
                let word = ((opcode as u64) << 16) | (insn.operands[0] as u16 as u64);
                buf.emit_pointer(word, self.width.min(8));
                for _ in 8..self.width {
                    buf.emit_u8(0);
                }
            }
        }
        Ok(buf.into_code())
    }
}
