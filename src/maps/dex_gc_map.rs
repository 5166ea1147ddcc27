//! Source PC -> reference bitmap map produced by the verifier.
//!
//! ```text
//! byte 0: bits[0:3] format, bits[3:8] bitmap width bits 8..13
//! byte 1: low 8 bits of bitmap width (width = byte1 | (byte0 & !7) << 5)
//! byte 2-3: entry count (little-endian)
//! entries x ([pc: 1 or 2 bytes LE][bitmap: bitmap width bytes])
//! ```
//!
//! Entries are sorted by source PC. Bit `r` of a bitmap is set when
//! virtual register `r` holds a reference at that PC.

use std::collections::BTreeMap;

use crate::error::{AssembleError, Result};

const HEADER_SIZE: usize = 4;

/// Encoding of the PC column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterMapFormat {
    /// One-byte PCs.
    Compact8 = 2,
    /// Two-byte PCs.
    Compact16 = 3,
}

impl RegisterMapFormat {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            2 => Some(RegisterMapFormat::Compact8),
            3 => Some(RegisterMapFormat::Compact16),
            _ => None,
        }
    }

    pub fn pc_width(self) -> usize {
        match self {
            RegisterMapFormat::Compact8 => 1,
            RegisterMapFormat::Compact16 => 2,
        }
    }
}

/// Anything that can tell which registers hold references at a source PC.
pub trait ReferenceLiveness {
    /// Bytes per bitmap.
    fn reg_width(&self) -> usize;

    fn find_bit_map(&self, dex_pc: u32) -> Option<&[u8]>;
}

/// Reader over an encoded verifier map.
#[derive(Debug, Clone, Copy)]
pub struct DexPcToReferenceMap<'a> {
    data: &'a [u8],
    format: RegisterMapFormat,
}

impl<'a> DexPcToReferenceMap<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(AssembleError::malformed("dex gc map", "missing header"));
        }
        let format = RegisterMapFormat::from_bits(data[0] & 7).ok_or_else(|| {
            AssembleError::malformed("dex gc map", format!("unknown format {}", data[0] & 7))
        })?;
        let map = Self { data, format };
        let expected = HEADER_SIZE + map.num_entries() * map.entry_width();
        if data.len() != expected {
            return Err(AssembleError::malformed(
                "dex gc map",
                format!("{} bytes, header implies {}", data.len(), expected),
            ));
        }
        Ok(map)
    }

    pub fn format(&self) -> RegisterMapFormat {
        self.format
    }

    pub fn num_entries(&self) -> usize {
        self.data[2] as usize | ((self.data[3] as usize) << 8)
    }

    fn entry_width(&self) -> usize {
        self.format.pc_width() + self.reg_width()
    }

    fn entry(&self, index: usize) -> &'a [u8] {
        let at = HEADER_SIZE + index * self.entry_width();
        &self.data[at..at + self.entry_width()]
    }

    /// Source PC of entry `index`.
    pub fn dex_pc(&self, index: usize) -> u32 {
        let entry = self.entry(index);
        match self.format {
            RegisterMapFormat::Compact8 => entry[0] as u32,
            RegisterMapFormat::Compact16 => entry[0] as u32 | ((entry[1] as u32) << 8),
        }
    }

    /// Bitmap of entry `index`.
    pub fn bit_map(&self, index: usize) -> &'a [u8] {
        &self.entry(index)[self.format.pc_width()..]
    }
}

impl ReferenceLiveness for DexPcToReferenceMap<'_> {
    fn reg_width(&self) -> usize {
        self.data[1] as usize | (((self.data[0] & !7) as usize) << 5)
    }

    fn find_bit_map(&self, dex_pc: u32) -> Option<&[u8]> {
        (0..self.num_entries())
            .find(|&i| self.dex_pc(i) == dex_pc)
            .map(|i| self.bit_map(i))
    }
}

/// Builds a verifier map from per-PC reference sets.
#[derive(Debug, Clone, Default)]
pub struct DexGcMapBuilder {
    num_regs: usize,
    entries: BTreeMap<u32, Vec<u8>>,
}

impl DexGcMapBuilder {
    pub fn new(num_regs: usize) -> Self {
        Self {
            num_regs,
            entries: BTreeMap::new(),
        }
    }

    pub fn reg_width(&self) -> usize {
        self.num_regs.div_ceil(8)
    }

    /// Declare `dex_pc` as a safepoint with no live references yet.
    pub fn add_safepoint(&mut self, dex_pc: u32) -> &mut Vec<u8> {
        let width = self.reg_width();
        self.entries.entry(dex_pc).or_insert_with(|| vec![0; width])
    }

    /// Mark register `reg` as holding a reference at `dex_pc`.
    pub fn set_reference(&mut self, dex_pc: u32, reg: usize) -> Result<()> {
        if reg >= self.num_regs {
            return Err(AssembleError::LimitExceeded {
                what: "reference register",
                value: reg,
                limit: self.num_regs,
            });
        }
        self.add_safepoint(dex_pc)[reg / 8] |= 1 << (reg % 8);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn build(&self) -> Result<Vec<u8>> {
        let reg_width = self.reg_width();
        if reg_width >= 1 << 13 {
            return Err(AssembleError::LimitExceeded {
                what: "reference bitmap width",
                value: reg_width,
                limit: 1 << 13,
            });
        }
        if self.entries.len() >= 1 << 16 {
            return Err(AssembleError::LimitExceeded {
                what: "dex gc map entry count",
                value: self.entries.len(),
                limit: 1 << 16,
            });
        }
        let max_pc = self.entries.keys().next_back().copied().unwrap_or(0);
        let format = match max_pc {
            0..=0xff => RegisterMapFormat::Compact8,
            0x100..=0xffff => RegisterMapFormat::Compact16,
            _ => {
                return Err(AssembleError::LimitExceeded {
                    what: "dex gc map pc",
                    value: max_pc as usize,
                    limit: 1 << 16,
                });
            }
        };

        let count = self.entries.len();
        let mut data = Vec::with_capacity(HEADER_SIZE + count * (format.pc_width() + reg_width));
        data.push(format as u8 | ((reg_width >> 5) & !7) as u8);
        data.push((reg_width & 0xff) as u8);
        data.push(count as u8);
        data.push((count >> 8) as u8);
        for (&pc, bitmap) in &self.entries {
            data.push(pc as u8);
            if format == RegisterMapFormat::Compact16 {
                data.push((pc >> 8) as u8);
            }
            data.extend_from_slice(bitmap);
        }
        Ok(data)
    }
}
