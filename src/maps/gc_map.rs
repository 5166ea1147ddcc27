//! Native PC -> reference bitmap map.
//!
//! ```text
//! byte 0: bits[0:3] native offset width, bits[3:8] low 5 bits of bitmap width
//! byte 1: bitmap width >> 5
//! byte 2-3: entry count (little-endian)
//! entries x ([offset: offset width bytes LE][bitmap: bitmap width bytes])
//! ```
//!
//! The entries form an open-addressed hash table keyed by native offset,
//! with exactly one slot per safepoint and linear probing.

use tracing::debug;

use super::dex_gc_map::ReferenceLiveness;
use super::mapping_table::MappingTable;
use crate::error::{AssembleError, Result};

const HEADER_SIZE: usize = 4;

/// Slot hash shared by the builder and the reader.
pub fn hash(native_offset: u32) -> u32 {
    let mut hash = native_offset;
    hash ^= (hash >> 20) ^ (hash >> 12);
    hash ^= (hash >> 7) ^ (hash >> 4);
    hash
}

/// Bytes needed to store `max_native_offset`.
fn offset_width(mut max_native_offset: u32) -> usize {
    let mut width = 0;
    while max_native_offset != 0 {
        width += 1;
        max_native_offset >>= 8;
    }
    width
}

fn check_limit(what: &'static str, value: usize, limit: usize) -> Result<()> {
    if value >= limit {
        return Err(AssembleError::LimitExceeded { what, value, limit });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct NativePcToReferenceMapBuilder {
    entries: usize,
    references_width: usize,
    native_offset_width: usize,
    in_use: Vec<bool>,
    filled: usize,
    table: Vec<u8>,
}

impl NativePcToReferenceMapBuilder {
    /// Set up a table with `entries` slots. Widths that do not fit the
    /// header fields are rejected.
    pub fn new(entries: usize, max_native_offset: u32, references_width: usize) -> Result<Self> {
        let native_offset_width = offset_width(max_native_offset);
        check_limit("native offset width", native_offset_width, 1 << 3)?;
        check_limit("reference bitmap width", references_width, 1 << 13)?;
        check_limit("reference map entry count", entries, 1 << 16)?;

        let entry_width = native_offset_width + references_width;
        let mut table = vec![0u8; entry_width * entries + HEADER_SIZE];
        table[0] = (native_offset_width & 7) as u8;
        table[0] |= ((references_width << 3) & 0xff) as u8;
        table[1] = ((references_width >> 5) & 0xff) as u8;
        table[2] = (entries & 0xff) as u8;
        table[3] = ((entries >> 8) & 0xff) as u8;
        Ok(Self {
            entries,
            references_width,
            native_offset_width,
            in_use: vec![false; entries],
            filled: 0,
            table,
        })
    }

    pub fn native_offset_width(&self) -> usize {
        self.native_offset_width
    }

    fn entry_width(&self) -> usize {
        self.native_offset_width + self.references_width
    }

    fn slot_offset(&self, index: usize) -> usize {
        index * self.entry_width() + HEADER_SIZE
    }

    /// Insert one safepoint. Fails once every slot is taken.
    pub fn add_entry(&mut self, native_offset: u32, references: &[u8]) -> Result<()> {
        if self.filled >= self.entries {
            return Err(AssembleError::ReferenceMapFull {
                capacity: self.entries,
            });
        }
        if references.len() != self.references_width {
            return Err(AssembleError::BitmapWidthMismatch {
                expected: self.references_width,
                actual: references.len(),
            });
        }
        let mut index = hash(native_offset) as usize % self.entries;
        while self.in_use[index] {
            index = (index + 1) % self.entries;
        }
        self.in_use[index] = true;
        self.filled += 1;

        let at = self.slot_offset(index);
        for i in 0..self.native_offset_width {
            self.table[at + i] = (native_offset >> (i * 8)) as u8;
        }
        let bitmap_at = at + self.native_offset_width;
        self.table[bitmap_at..bitmap_at + self.references_width].copy_from_slice(references);
        debug_assert_eq!(read_offset(&self.table[at..], self.native_offset_width), native_offset);
        Ok(())
    }

    pub fn finish(self) -> Vec<u8> {
        self.table
    }
}

fn read_offset(bytes: &[u8], width: usize) -> u32 {
    (0..width).fold(0u32, |acc, i| acc | ((bytes[i] as u32) << (i * 8)))
}

/// Reader over an encoded native reference map.
#[derive(Debug, Clone, Copy)]
pub struct NativePcOffsetToReferenceMap<'a> {
    data: &'a [u8],
}

impl<'a> NativePcOffsetToReferenceMap<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(AssembleError::malformed("native gc map", "missing header"));
        }
        let map = Self { data };
        let expected = HEADER_SIZE + map.num_entries() * map.entry_width();
        if data.len() != expected {
            return Err(AssembleError::malformed(
                "native gc map",
                format!("{} bytes, header implies {}", data.len(), expected),
            ));
        }
        Ok(map)
    }

    pub fn native_offset_width(&self) -> usize {
        (self.data[0] & 7) as usize
    }

    pub fn reg_width(&self) -> usize {
        ((self.data[0] as usize) >> 3) | ((self.data[1] as usize) << 5)
    }

    pub fn num_entries(&self) -> usize {
        self.data[2] as usize | ((self.data[3] as usize) << 8)
    }

    fn entry_width(&self) -> usize {
        self.native_offset_width() + self.reg_width()
    }

    fn slot(&self, index: usize) -> &'a [u8] {
        let at = HEADER_SIZE + index * self.entry_width();
        &self.data[at..at + self.entry_width()]
    }

    /// Native offset stored in slot `index`.
    pub fn code_offset(&self, index: usize) -> u32 {
        read_offset(self.slot(index), self.native_offset_width())
    }

    /// Bitmap stored in slot `index`.
    pub fn entry_bitmap(&self, index: usize) -> &'a [u8] {
        &self.slot(index)[self.native_offset_width()..]
    }

    /// Look up the bitmap recorded for `native_offset`.
    pub fn find_bit_map(&self, native_offset: u32) -> Option<&'a [u8]> {
        let entries = self.num_entries();
        if entries == 0 {
            return None;
        }
        let start = hash(native_offset) as usize % entries;
        let mut index = start;
        loop {
            if self.code_offset(index) == native_offset {
                return Some(self.entry_bitmap(index));
            }
            index = (index + 1) % entries;
            if index == start {
                return None;
            }
        }
    }

    pub fn has_entry(&self, native_offset: u32) -> bool {
        self.find_bit_map(native_offset).is_some()
    }
}

/// Build the native map: one entry per pc2dex entry of `mapping_table`,
/// carrying the verifier's bitmap for that entry's source PC.
pub fn create_native_gc_map(
    mapping_table: &[u8],
    liveness: &dyn ReferenceLiveness,
) -> Result<Vec<u8>> {
    let table = MappingTable::decode(mapping_table)?;
    let safepoints = table.pc_to_dex();
    let max_native_offset = safepoints
        .iter()
        .map(|e| e.native_pc_offset)
        .max()
        .unwrap_or(0);
    let mut builder = NativePcToReferenceMapBuilder::new(
        safepoints.len(),
        max_native_offset,
        liveness.reg_width(),
    )?;
    for entry in safepoints {
        let references = liveness
            .find_bit_map(entry.dex_pc)
            .ok_or(AssembleError::MissingReferenceBitmap(entry.dex_pc))?;
        builder.add_entry(entry.native_pc_offset, references)?;
    }
    debug!(
        entries = safepoints.len(),
        max_native_offset, "built native gc map"
    );
    Ok(builder.finish())
}
