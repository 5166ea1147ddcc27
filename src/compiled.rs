//! The compiled method artifact and the register map packed into it.

use serde::{Deserialize, Serialize};

use crate::assemble::codebuf::align_up;
use crate::config::InstructionSet;
use crate::error::{AssembleError, Result};
use crate::leb128::{Leb128Encoder, decode_unsigned_leb128};

/// Number of low bits of a vmap entry holding the virtual register.
pub const VREG_NUM_WIDTH: u32 = 16;
/// Marker separating core and fp entries, in place of the return address.
pub const INVALID_VREG: u32 = 0xffff;
pub const STACK_ALIGNMENT: u32 = 16;
/// Largest frame, in bytes, that still aligns without wrapping.
pub const MAX_FRAME_SIZE: u32 = u32::MAX - (STACK_ALIGNMENT - 1);

/// Everything the installation stage needs for one method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledMethod {
    pub instruction_set: InstructionSet,
    pub code: Vec<u8>,
    pub frame_size_in_bytes: u32,
    pub core_spill_mask: u32,
    pub fp_spill_mask: u32,
    pub mapping_table: Vec<u8>,
    pub vmap_table: Vec<u8>,
    pub gc_map: Vec<u8>,
}

/// Register and spill counts that determine the frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameLayout {
    pub num_regs: u32,
    pub num_outs: u32,
    pub num_compiler_temps: u32,
    pub core_spill_mask: u32,
    pub fp_spill_mask: u32,
}

impl FrameLayout {
    pub fn num_core_spills(&self) -> u32 {
        self.core_spill_mask.count_ones()
    }

    pub fn num_fp_spills(&self) -> u32 {
        self.fp_spill_mask.count_ones()
    }

    /// Spills, a filler word, virtual registers, outs, temps and the method
    /// pointer, rounded up to the stack alignment.
    pub fn compute_frame_size(&self) -> Result<u32> {
        let too_large = || AssembleError::LimitExceeded {
            what: "frame size",
            value: self.num_regs as usize
                + self.num_outs as usize
                + self.num_compiler_temps as usize,
            limit: (MAX_FRAME_SIZE / 4) as usize,
        };
        let words = [self.num_regs, self.num_outs, self.num_compiler_temps, 1]
            .into_iter()
            .try_fold(self.num_core_spills() + self.num_fp_spills() + 1, u32::checked_add)
            .ok_or_else(too_large)?;
        let bytes = words
            .checked_mul(4)
            .filter(|&b| b <= MAX_FRAME_SIZE)
            .ok_or_else(too_large)?;
        Ok(align_up(bytes, STACK_ALIGNMENT))
    }
}

/// Encode the vmap table. Core entries may arrive out of order; they are
/// sorted on their full value (physical register sort key in the high
/// bits) and then stripped to the virtual register number.
pub fn build_vmap_table(
    core_vmap: &[u32],
    fp_vmap: &[u32],
    frame_size: u32,
    layout: &FrameLayout,
) -> Vec<u8> {
    let mut core = core_vmap.to_vec();
    core.sort_unstable();
    let mask = (1u32 << VREG_NUM_WIDTH) - 1;

    let mut entries: Vec<u32> = core.iter().map(|&e| e & mask).collect();
    if frame_size > 0 {
        entries.push(INVALID_VREG);
    } else {
        debug_assert_eq!(layout.core_spill_mask, 0);
        debug_assert_eq!(layout.fp_spill_mask, 0);
    }
    entries.extend(fp_vmap.iter().map(|&e| e & mask));

    let mut encoder = Leb128Encoder::new();
    encoder.push_unsigned(entries.len() as u32);
    for entry in entries {
        encoder.push_unsigned(entry);
    }
    encoder.into_data()
}

/// Decode a vmap table back into its entries.
pub fn decode_vmap_table(data: &[u8]) -> Result<Vec<u32>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let mut pos = 0;
    let count = decode_unsigned_leb128(data, &mut pos)?;
    (0..count)
        .map(|_| decode_unsigned_leb128(data, &mut pos))
        .collect()
}
