//! Native PC <-> source PC mapping table.
//!
//! ```text
//! [uleb total][uleb pc2dex_count]
//! pc2dex_count x ([uleb native delta][sleb dex delta])
//! (total - pc2dex_count) x ([uleb native delta][sleb dex delta])
//! ```
//!
//! Deltas are taken against the previous entry of the same block, starting
//! from (0, 0). The first block comes from `SafepointPc` markers, the second
//! from `ExportedPc` markers, both in list order.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use super::Diagnostic;
use crate::error::{AssembleError, MappingKind, Result};
use crate::leb128::{
    decode_signed_leb128, decode_unsigned_leb128, encode_signed_leb128, encode_unsigned_leb128,
    signed_leb128_size, unsigned_leb128_size,
};
use crate::lir::{Lir, LirList, PseudoOp};

/// One (native offset, source PC) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MappingEntry {
    pub native_pc_offset: u32,
    pub dex_pc: u32,
}

fn kind_of(lir: &Lir) -> Option<MappingKind> {
    if lir.flags.is_nop {
        return None;
    }
    if lir.is_pseudo(PseudoOp::SafepointPc) {
        Some(MappingKind::PcToDex)
    } else if lir.is_pseudo(PseudoOp::ExportedPc) {
        Some(MappingKind::DexToPc)
    } else {
        None
    }
}

/// Running delta state of one block.
#[derive(Debug, Clone, Copy)]
struct DeltaEncoder {
    kind: MappingKind,
    native_offset: u32,
    dex_offset: u32,
    entries: u32,
    data_size: usize,
}

impl DeltaEncoder {
    fn new(kind: MappingKind) -> Self {
        Self {
            kind,
            native_offset: 0,
            dex_offset: 0,
            entries: 0,
            data_size: 0,
        }
    }

    fn step(&mut self, lir: &Lir) -> Result<(u32, i32)> {
        let native_delta = lir.offset.checked_sub(self.native_offset).ok_or(
            AssembleError::NonMonotonicOffset {
                kind: self.kind,
                previous: self.native_offset,
                offset: lir.offset,
            },
        )?;
        let dex_delta = (lir.dex_offset as i32).wrapping_sub(self.dex_offset as i32);
        self.native_offset = lir.offset;
        self.dex_offset = lir.dex_offset;
        self.entries += 1;
        self.data_size += unsigned_leb128_size(native_delta) + signed_leb128_size(dex_delta);
        Ok((native_delta, dex_delta))
    }
}

/// Build the encoded mapping table from the offset-stamped list.
pub fn create_mapping_table(lir: &LirList) -> Result<Vec<u8>> {
    // Pass 1: sizes.
    let mut pc2dex = DeltaEncoder::new(MappingKind::PcToDex);
    let mut dex2pc = DeltaEncoder::new(MappingKind::DexToPc);
    for (_, insn) in lir.iter() {
        match kind_of(insn) {
            Some(MappingKind::PcToDex) => {
                pc2dex.step(insn)?;
            }
            Some(MappingKind::DexToPc) => {
                dex2pc.step(insn)?;
            }
            None => {}
        }
    }

    let total_entries = pc2dex.entries + dex2pc.entries;
    let hdr_data_size =
        unsigned_leb128_size(total_entries) + unsigned_leb128_size(pc2dex.entries);
    let data_size = hdr_data_size + pc2dex.data_size + dex2pc.data_size;

    // Pass 2: encode both blocks.
    let mut table = Vec::with_capacity(data_size);
    encode_unsigned_leb128(&mut table, total_entries);
    encode_unsigned_leb128(&mut table, pc2dex.entries);
    debug_assert_eq!(table.len(), hdr_data_size);
    let mut second = Vec::with_capacity(dex2pc.data_size);
    let mut pc2dex_state = DeltaEncoder::new(MappingKind::PcToDex);
    let mut dex2pc_state = DeltaEncoder::new(MappingKind::DexToPc);
    for (_, insn) in lir.iter() {
        let (out, state) = match kind_of(insn) {
            Some(MappingKind::PcToDex) => (&mut table, &mut pc2dex_state),
            Some(MappingKind::DexToPc) => (&mut second, &mut dex2pc_state),
            None => continue,
        };
        let (native_delta, dex_delta) = state.step(insn)?;
        encode_unsigned_leb128(out, native_delta);
        encode_signed_leb128(out, dex_delta);
    }
    debug_assert_eq!(table.len(), hdr_data_size + pc2dex.data_size);
    table.extend_from_slice(&second);
    debug_assert_eq!(table.len(), data_size);

    debug!(
        pc2dex = pc2dex.entries,
        dex2pc = dex2pc.entries,
        bytes = table.len(),
        "built mapping table"
    );
    Ok(table)
}

/// Decoded mapping table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingTable {
    pc_to_dex: Vec<MappingEntry>,
    dex_to_pc: Vec<MappingEntry>,
}

impl MappingTable {
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self::default());
        }
        let mut pos = 0;
        let total = decode_unsigned_leb128(data, &mut pos)?;
        let pc2dex_count = decode_unsigned_leb128(data, &mut pos)?;
        if pc2dex_count > total {
            return Err(AssembleError::malformed(
                "mapping table",
                format!("pc2dex count {} exceeds total {}", pc2dex_count, total),
            ));
        }
        let pc_to_dex = decode_block(data, &mut pos, pc2dex_count)?;
        let dex_to_pc = decode_block(data, &mut pos, total - pc2dex_count)?;
        if pos != data.len() {
            return Err(AssembleError::malformed(
                "mapping table",
                format!("{} trailing bytes", data.len() - pos),
            ));
        }
        Ok(Self {
            pc_to_dex,
            dex_to_pc,
        })
    }

    pub fn total_size(&self) -> usize {
        self.pc_to_dex.len() + self.dex_to_pc.len()
    }

    pub fn pc_to_dex(&self) -> &[MappingEntry] {
        &self.pc_to_dex
    }

    pub fn dex_to_pc(&self) -> &[MappingEntry] {
        &self.dex_to_pc
    }

    /// Native offset exported for `dex_pc`.
    pub fn native_pc_for(&self, dex_pc: u32) -> Option<u32> {
        self.dex_to_pc
            .iter()
            .find(|e| e.dex_pc == dex_pc)
            .map(|e| e.native_pc_offset)
    }

    /// Log both blocks at debug level.
    pub fn dump(&self, method_name: &str) {
        for (name, entries) in [("PC2Dex_MappingTable", &self.pc_to_dex), ("Dex2PC_MappingTable", &self.dex_to_pc)] {
            if entries.is_empty() {
                continue;
            }
            debug!("{} {}[{}] = {{", name, method_name, entries.len());
            for e in entries.iter() {
                debug!("    {{0x{:05x}, 0x{:04x}}},", e.native_pc_offset, e.dex_pc);
            }
            debug!("  }};");
        }
    }
}

fn decode_block(data: &[u8], pos: &mut usize, count: u32) -> Result<Vec<MappingEntry>> {
    let mut entries = Vec::with_capacity(count as usize);
    let mut native_pc_offset: u32 = 0;
    let mut dex_pc: u32 = 0;
    for _ in 0..count {
        let native_delta = decode_unsigned_leb128(data, pos)?;
        let dex_delta = decode_signed_leb128(data, pos)?;
        native_pc_offset = native_pc_offset.wrapping_add(native_delta);
        dex_pc = (dex_pc as i32).wrapping_add(dex_delta) as u32;
        entries.push(MappingEntry {
            native_pc_offset,
            dex_pc,
        });
    }
    Ok(entries)
}

/// Check that `table` reproduces exactly the markers in `lir`.
pub fn verify_mapping_table(table: &[u8], lir: &LirList) -> Result<()> {
    let decoded = MappingTable::decode(table)?;
    let mut pc2dex = decoded.pc_to_dex.iter();
    let mut dex2pc = decoded.dex_to_pc.iter();
    for (id, insn) in lir.iter() {
        let it = match kind_of(insn) {
            Some(MappingKind::PcToDex) => &mut pc2dex,
            Some(MappingKind::DexToPc) => &mut dex2pc,
            None => continue,
        };
        let expected = MappingEntry {
            native_pc_offset: insn.offset,
            dex_pc: insn.dex_offset,
        };
        match it.next() {
            Some(entry) if *entry == expected => {}
            Some(entry) => {
                return Err(AssembleError::MappingTableMismatch(format!(
                    "{} expects {:?}, table has {:?}",
                    id, expected, entry
                )));
            }
            None => {
                return Err(AssembleError::MappingTableMismatch(format!(
                    "table ends before {}",
                    id
                )));
            }
        }
    }
    if pc2dex.next().is_some() || dex2pc.next().is_some() {
        return Err(AssembleError::MappingTableMismatch(
            "table has entries with no marker".to_string(),
        ));
    }
    Ok(())
}

/// Cross-check exported source PCs against the declared catch entry points.
pub fn verify_catch_entries(table: &MappingTable, catches: &BTreeSet<u32>) -> Vec<Diagnostic> {
    let mut dex_pcs: Vec<u32> = table.dex_to_pc.iter().map(|e| e.dex_pc).collect();
    dex_pcs.sort_unstable();

    let mut diagnostics = Vec::new();
    let mut it = dex_pcs.iter().peekable();
    for &catch_pc in catches {
        while let Some(&&pc) = it.peek() {
            if pc >= catch_pc {
                break;
            }
            warn!("Unexpected catch entry @ dex pc 0x{:x}", pc);
            diagnostics.push(Diagnostic::UnexpectedCatchEntry { dex_pc: pc });
            it.next();
        }
        match it.peek() {
            Some(&&pc) if pc == catch_pc => {
                it.next();
            }
            _ => {
                warn!("Missing native PC for catch entry @ 0x{:x}", catch_pc);
                diagnostics.push(Diagnostic::MissingCatchEntry { dex_pc: catch_pc });
            }
        }
    }
    // Anything left over sorts after the last declared handler.
    for &pc in it {
        warn!("Unexpected catch entry @ dex pc 0x{:x}", pc);
        diagnostics.push(Diagnostic::UnexpectedCatchEntry { dex_pc: pc });
    }
    diagnostics
}
