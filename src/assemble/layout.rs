//! Data offset assignment.
//!
//! Once the encoder knows the size of the instruction stream, data follows
//! it in a fixed order: word literals, code-patch literals, method-patch
//! literals, switch tables, fill-array data. The installers walk the same
//! order.

use super::codebuf::align_up;
use crate::lir::{CodeOffset, FillArrayData, LiteralPool, SwitchTable};

/// Word constants: 4 bytes each, no extra alignment.
pub fn assign_literal_offsets(pool: &mut LiteralPool, mut offset: CodeOffset) -> CodeOffset {
    for lit in pool.iter_mut() {
        lit.offset = offset;
        offset += 4;
    }
    offset
}

/// Pointer literals: aligned to and sized by the pointer width.
pub fn assign_pointer_offsets(
    pool: &mut LiteralPool,
    offset: CodeOffset,
    pointer_size: u32,
) -> CodeOffset {
    let mut offset = align_up(offset, pointer_size);
    for lit in pool.iter_mut() {
        lit.offset = offset;
        offset += pointer_size;
    }
    offset
}

pub fn assign_switch_table_offsets(tables: &mut [SwitchTable], mut offset: CodeOffset) -> CodeOffset {
    for table in tables {
        table.offset = offset;
        offset += table.payload.installed_size();
    }
    offset
}

pub fn assign_fill_array_data_offsets(
    tables: &mut [FillArrayData],
    mut offset: CodeOffset,
) -> CodeOffset {
    for table in tables {
        table.offset = offset;
        offset = align_up(offset + table.size, 4);
    }
    offset
}

/// Offsets produced by one layout pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataLayout {
    /// Start of the data region (code end rounded to 4).
    pub data_offset: CodeOffset,
    /// Size of the whole image.
    pub total_size: CodeOffset,
}

/// The pools and tables of one method.
pub struct DataSections<'a> {
    pub literals: &'a mut LiteralPool,
    pub code_literals: &'a mut LiteralPool,
    pub method_literals: &'a mut LiteralPool,
    pub switch_tables: &'a mut [SwitchTable],
    pub fill_array_data: &'a mut [FillArrayData],
}

/// Assign every data offset after an instruction stream of `code_size` bytes.
pub fn assign_data_offsets(
    sections: DataSections<'_>,
    code_size: CodeOffset,
    pointer_size: u32,
) -> DataLayout {
    let data_offset = align_up(code_size, 4);
    let mut offset = assign_literal_offsets(sections.literals, data_offset);
    offset = assign_pointer_offsets(sections.code_literals, offset, pointer_size);
    offset = assign_pointer_offsets(sections.method_literals, offset, pointer_size);
    offset = assign_switch_table_offsets(sections.switch_tables, offset);
    offset = assign_fill_array_data_offsets(sections.fill_array_data, offset);
    DataLayout {
        data_offset,
        total_size: offset,
    }
}
