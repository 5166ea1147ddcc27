//! Writers for the data region of the code image.
//!
//! Each installer walks its pool or tables in layout order, pads the buffer
//! with zeros up to the assigned start offset and appends little-endian
//! data.

use tracing::debug;

use super::codebuf::CodeBuffer;
use crate::config::BranchOrigin;
use crate::error::{AssembleError, Result};
use crate::lir::{
    CodeOffset, FillArrayData, FixupKind, InvokeType, LirList, LiteralPool, SwitchKind,
    SwitchTable,
};
use crate::patch::{CodePatch, CodePatchSink, MethodContext, PatchKind};

fn seek(buf: &mut CodeBuffer, offset: CodeOffset, what: &'static str) -> Result<()> {
    buf.pad_to(offset);
    if buf.offset() != offset {
        return Err(AssembleError::LayoutMismatch {
            what,
            expected: offset,
            actual: buf.offset(),
        });
    }
    Ok(())
}

/// Write the word pool.
pub fn install_word_literals(
    buf: &mut CodeBuffer,
    pool: &LiteralPool,
    data_offset: CodeOffset,
) -> Result<()> {
    seek(buf, data_offset, "literal pool")?;
    for (_, lit) in pool.iter() {
        seek(buf, lit.offset, "word literal")?;
        buf.emit_word(lit.operands[0]);
    }
    Ok(())
}

/// Write a pointer pool and report each entry to the patch sink. The
/// placeholder is the target index, so identical methods produce identical
/// bytes regardless of patch order.
pub fn install_pointer_literals(
    buf: &mut CodeBuffer,
    pool: &LiteralPool,
    kind: PatchKind,
    context: MethodContext,
    pointer_size: u32,
    sink: &dyn CodePatchSink,
) -> Result<()> {
    for (_, lit) in pool.iter() {
        seek(buf, lit.offset, "pointer literal")?;
        let target = lit.operands[0] as u32;
        let target_invoke_type = InvokeType::from_operand(lit.operands[1]).ok_or_else(|| {
            AssembleError::malformed("pointer literal", format!("invoke type {}", lit.operands[1]))
        })?;
        sink.add_patch(CodePatch {
            kind,
            context,
            target_method_idx: target,
            target_invoke_type,
            literal_offset: buf.offset(),
        });
        buf.emit_pointer(target as u64, pointer_size);
    }
    Ok(())
}

/// Resolve the displacement origin of one switch table.
pub fn branch_origin(table: &SwitchTable, lir: &LirList, origin: BranchOrigin) -> Result<CodeOffset> {
    let anchor = || {
        table
            .anchor
            .map(|id| lir.get(id))
            .ok_or(AssembleError::MissingSwitchAnchor(table.vaddr))
    };
    Ok(match origin {
        BranchOrigin::AnchorPlusAdvance(advance) => {
            let anchor = anchor()?;
            debug_assert!(anchor.flags.fixup != FixupKind::None);
            anchor.offset + advance
        }
        BranchOrigin::Anchor => anchor()?.offset,
        BranchOrigin::TableStart => table.offset,
        BranchOrigin::MethodStart => 0,
    })
}

/// Write switch tables: `(key, disp)` pairs for sparse tables,
/// displacements alone for packed tables, in original case order.
pub fn install_switch_tables(
    buf: &mut CodeBuffer,
    tables: &[SwitchTable],
    lir: &LirList,
    origin: BranchOrigin,
) -> Result<()> {
    for table in tables {
        seek(buf, table.offset, "switch table")?;
        let entries = table.payload.entries();
        if table.targets.len() != entries {
            return Err(AssembleError::malformed(
                "switch table",
                format!("{} targets resolved for {} cases", table.targets.len(), entries),
            ));
        }
        let base = branch_origin(table, lir, origin)?;
        debug!("Switch table for offset 0x{:x}", base);
        for (i, &target) in table.targets.iter().enumerate() {
            let disp = (lir.get(target).offset as i32).wrapping_sub(base as i32);
            match table.payload.kind() {
                SwitchKind::Sparse => {
                    let key = table.payload.key(i);
                    debug!("  Case[{}] key: 0x{:x}, disp: 0x{:x}", i, key, disp);
                    buf.emit_word(key);
                    buf.emit_word(disp);
                }
                SwitchKind::Packed => {
                    debug!("  Case[{}] disp: 0x{:x}", i, disp);
                    buf.emit_word(disp);
                }
            }
        }
    }
    Ok(())
}

/// Copy fill-array-data payloads, header included.
pub fn install_fill_array_data(buf: &mut CodeBuffer, tables: &[FillArrayData]) -> Result<()> {
    for table in tables {
        seek(buf, table.offset, "fill-array-data")?;
        let units = table.size.div_ceil(2) as usize;
        for &unit in &table.units()[..units] {
            buf.emit_u16(unit);
        }
    }
    Ok(())
}
