//! Switch and fill-array-data tables.
//!
//! Payload formats, in 16-bit code units:
//!
//! ```text
//! packed-switch  0x0100 | size | first_key (2) | targets[size] (2 each)
//! sparse-switch  0x0200 | size | keys[size] (2 each) | targets[size] (2 each)
//! fill-array     0x0300 | width | count (2) | data[(count * width + 1) / 2]
//! ```
//!
//! Targets are relative to the switch instruction's source PC.

use tracing::debug;

use super::{CodeOffset, DexOffset, LirId};
use crate::error::{AssembleError, Result};

pub const PACKED_SWITCH_SIGNATURE: u16 = 0x0100;
pub const SPARSE_SWITCH_SIGNATURE: u16 = 0x0200;
pub const ARRAY_DATA_SIGNATURE: u16 = 0x0300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchKind {
    Packed,
    Sparse,
}

fn read_i32(units: &[u16], at: usize) -> i32 {
    (units[at] as u32 | ((units[at + 1] as u32) << 16)) as i32
}

fn require(units: &[u16], needed: usize) -> Result<()> {
    if units.len() < needed {
        return Err(AssembleError::TruncatedPayload {
            needed,
            available: units.len(),
        });
    }
    Ok(())
}

/// Validated view of a switch payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchPayload {
    units: Vec<u16>,
    kind: SwitchKind,
}

impl SwitchPayload {
    pub fn parse(units: Vec<u16>) -> Result<Self> {
        require(&units, 2)?;
        let entries = units[1] as usize;
        let kind = match units[0] {
            PACKED_SWITCH_SIGNATURE => {
                require(&units, 4 + entries * 2)?;
                SwitchKind::Packed
            }
            SPARSE_SWITCH_SIGNATURE => {
                require(&units, 2 + entries * 4)?;
                SwitchKind::Sparse
            }
            ident => return Err(AssembleError::InvalidPayload(ident)),
        };
        Ok(Self { units, kind })
    }

    /// Build a packed payload.
    pub fn packed(first_key: i32, targets: &[i32]) -> Self {
        let mut units = vec![PACKED_SWITCH_SIGNATURE, targets.len() as u16];
        push_i32(&mut units, first_key);
        for &t in targets {
            push_i32(&mut units, t);
        }
        Self {
            units,
            kind: SwitchKind::Packed,
        }
    }

    /// Build a sparse payload. Keys are kept in the given order.
    pub fn sparse(cases: &[(i32, i32)]) -> Self {
        let mut units = vec![SPARSE_SWITCH_SIGNATURE, cases.len() as u16];
        for &(key, _) in cases {
            push_i32(&mut units, key);
        }
        for &(_, target) in cases {
            push_i32(&mut units, target);
        }
        Self {
            units,
            kind: SwitchKind::Sparse,
        }
    }

    pub fn kind(&self) -> SwitchKind {
        self.kind
    }

    pub fn entries(&self) -> usize {
        self.units[1] as usize
    }

    pub fn units(&self) -> &[u16] {
        &self.units
    }

    /// Key of case `i`.
    pub fn key(&self, i: usize) -> i32 {
        match self.kind {
            SwitchKind::Packed => read_i32(&self.units, 2).wrapping_add(i as i32),
            SwitchKind::Sparse => read_i32(&self.units, 2 + i * 2),
        }
    }

    /// Branch target of case `i`, relative to the switch instruction.
    pub fn relative_target(&self, i: usize) -> i32 {
        match self.kind {
            SwitchKind::Packed => read_i32(&self.units, 4 + i * 2),
            SwitchKind::Sparse => read_i32(&self.units, 2 + self.entries() * 2 + i * 2),
        }
    }

    /// Bytes this table occupies in the code image.
    pub fn installed_size(&self) -> u32 {
        let per_entry = match self.kind {
            SwitchKind::Packed => 4,
            SwitchKind::Sparse => 8,
        };
        self.entries() as u32 * per_entry
    }

    pub fn dump(&self) {
        match self.kind {
            SwitchKind::Packed => debug!(
                "Packed switch table - ident:0x{:x}, entries: {}, low_key: {}",
                self.units[0],
                self.entries(),
                self.key(0)
            ),
            SwitchKind::Sparse => debug!(
                "Sparse switch table - ident:0x{:x}, entries: {}",
                self.units[0],
                self.entries()
            ),
        }
        for i in 0..self.entries() {
            debug!("  Key[{}] -> 0x{:x}", self.key(i), self.relative_target(i));
        }
    }
}

fn push_i32(units: &mut Vec<u16>, value: i32) {
    units.push(value as u16);
    units.push((value as u32 >> 16) as u16);
}

/// A switch table extracted from the bytecode.
#[derive(Debug, Clone)]
pub struct SwitchTable {
    pub payload: SwitchPayload,
    /// Source PC of the switch instruction.
    pub vaddr: DexOffset,
    /// Instruction whose offset is the displacement origin, if any.
    pub anchor: Option<LirId>,
    /// Resolved case targets, one per entry, filled by case label marking.
    pub targets: Vec<LirId>,
    pub offset: CodeOffset,
}

impl SwitchTable {
    pub fn new(payload: SwitchPayload, vaddr: DexOffset, anchor: Option<LirId>) -> Self {
        Self {
            payload,
            vaddr,
            anchor,
            targets: Vec::new(),
            offset: 0,
        }
    }

    /// Source PC of case `i`'s target.
    pub fn case_vaddr(&self, i: usize) -> DexOffset {
        (self.vaddr as i32).wrapping_add(self.payload.relative_target(i)) as DexOffset
    }
}

/// A fill-array-data payload.
#[derive(Debug, Clone)]
pub struct FillArrayData {
    units: Vec<u16>,
    pub vaddr: DexOffset,
    /// Installed size in bytes, payload header included.
    pub size: u32,
    pub offset: CodeOffset,
}

impl FillArrayData {
    pub fn parse(units: Vec<u16>, vaddr: DexOffset) -> Result<Self> {
        require(&units, 4)?;
        if units[0] != ARRAY_DATA_SIGNATURE {
            return Err(AssembleError::InvalidPayload(units[0]));
        }
        let width = units[1] as u32;
        let count = units[2] as u32 | ((units[3] as u32) << 16);
        let size = width
            .checked_mul(count)
            .and_then(|data| data.checked_add(8))
            .ok_or(AssembleError::LimitExceeded {
                what: "fill-array-data size",
                value: usize::MAX,
                limit: u32::MAX as usize,
            })?;
        require(&units, (size as usize).div_ceil(2))?;
        Ok(Self {
            units,
            vaddr,
            size,
            offset: 0,
        })
    }

    /// Build a payload from raw element bytes.
    pub fn from_elements(element_width: u16, data: &[u8], vaddr: DexOffset) -> Result<Self> {
        let width = element_width.max(1) as usize;
        let count = (data.len() / width) as u32;
        let mut units = vec![ARRAY_DATA_SIGNATURE, element_width, count as u16, (count >> 16) as u16];
        for chunk in data.chunks(2) {
            let lo = chunk[0] as u16;
            let hi = chunk.get(1).copied().unwrap_or(0) as u16;
            units.push(lo | (hi << 8));
        }
        Self::parse(units, vaddr)
    }

    pub fn units(&self) -> &[u16] {
        &self.units
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_payload() {
        let payload = SwitchPayload::packed(10, &[4, -6, 20]);
        let parsed = SwitchPayload::parse(payload.units().to_vec()).unwrap();
        assert_eq!(parsed.kind(), SwitchKind::Packed);
        assert_eq!(parsed.entries(), 3);
        assert_eq!(parsed.key(2), 12);
        assert_eq!(parsed.relative_target(1), -6);
        assert_eq!(parsed.installed_size(), 12);
    }

    #[test]
    fn test_sparse_payload_keeps_case_order() {
        let payload = SwitchPayload::sparse(&[(9, 30), (1, 10), (5, 20)]);
        assert_eq!(payload.kind(), SwitchKind::Sparse);
        assert_eq!(payload.key(0), 9);
        assert_eq!(payload.relative_target(0), 30);
        assert_eq!(payload.key(2), 5);
        assert_eq!(payload.installed_size(), 24);
    }

    #[test]
    fn test_invalid_and_truncated_payloads() {
        assert!(matches!(
            SwitchPayload::parse(vec![0x0400, 0]),
            Err(AssembleError::InvalidPayload(0x0400))
        ));
        assert!(matches!(
            SwitchPayload::parse(vec![SPARSE_SWITCH_SIGNATURE, 2, 0, 0]),
            Err(AssembleError::TruncatedPayload { needed: 10, available: 4 })
        ));
    }

    #[test]
    fn test_case_vaddr() {
        let table = SwitchTable::new(SwitchPayload::packed(0, &[3, -2]), 0x10, None);
        assert_eq!(table.case_vaddr(0), 0x13);
        assert_eq!(table.case_vaddr(1), 0x0e);
    }

    #[test]
    fn test_fill_array_data_size() {
        let data = FillArrayData::from_elements(2, &[1, 0, 2, 0, 3, 0], 0).unwrap();
        assert_eq!(data.size, 8 + 6);
        assert_eq!(data.units().len(), 4 + 3);

        let odd = FillArrayData::from_elements(1, &[1, 2, 3], 0).unwrap();
        assert_eq!(odd.size, 11);
        assert_eq!(odd.units().len(), 6);
    }
}
