//! Literal pools.
//!
//! A pool is a singly linked, newest-first list of data records. It is
//! backed by a vector in insertion order, so list order is the reverse of
//! the vector and prepending is a push.

use serde::{Deserialize, Serialize};

use super::CodeOffset;

/// Invoke kind recorded with a pointer literal for the patcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvokeType {
    #[default]
    Static,
    Direct,
    Virtual,
    Super,
    Interface,
}

impl InvokeType {
    pub fn as_operand(self) -> i32 {
        self as i32
    }

    pub fn from_operand(value: i32) -> Option<Self> {
        Some(match value {
            0 => InvokeType::Static,
            1 => InvokeType::Direct,
            2 => InvokeType::Virtual,
            3 => InvokeType::Super,
            4 => InvokeType::Interface,
            _ => return None,
        })
    }
}

/// Handle to a record in a [`LiteralPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LiteralId(u32);

/// A data record. For word pools `operands[0]` is the value and
/// `operands[1]` may hold the high word of a wide constant found by
/// [`LiteralPool::scan_for_exact_wide`]. For pointer pools `operands[0]` is
/// the target index and `operands[1]` the invoke type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Literal {
    pub operands: [i32; 2],
    pub offset: CodeOffset,
}

#[derive(Debug, Clone, Default)]
pub struct LiteralPool {
    entries: Vec<Literal>,
    estimated_size: u32,
}

impl LiteralPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes this pool has added to the code size estimate.
    pub fn estimated_size(&self) -> u32 {
        self.estimated_size
    }

    pub fn get(&self, id: LiteralId) -> &Literal {
        &self.entries[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: LiteralId) -> &mut Literal {
        &mut self.entries[id.0 as usize]
    }

    /// The entry following `id` in list order (the one added before it).
    pub fn next(&self, id: LiteralId) -> Option<LiteralId> {
        id.0.checked_sub(1).map(LiteralId)
    }

    /// Iterate in list order, newest first.
    pub fn iter(&self) -> impl Iterator<Item = (LiteralId, &Literal)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .rev()
            .map(|(i, lit)| (LiteralId(i as u32), lit))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Literal> + '_ {
        self.entries.iter_mut().rev()
    }

    fn prepend(&mut self, operands: [i32; 2], size: u32) -> LiteralId {
        let id = LiteralId(self.entries.len() as u32);
        self.entries.push(Literal {
            operands,
            offset: 0,
        });
        self.estimated_size += size;
        id
    }

    /// Add a 32-bit constant.
    pub fn add_word(&mut self, value: i32) -> LiteralId {
        self.prepend([value, 0], 4)
    }

    /// Add a 64-bit constant as two words: high first, then low. The low
    /// word is returned; the high word follows it in list order.
    pub fn add_wide(&mut self, low: i32, high: i32) -> LiteralId {
        self.add_word(high);
        self.add_word(low)
    }

    /// Add a pointer-sized patch target.
    pub fn add_pointer(&mut self, target: u32, invoke_type: InvokeType, pointer_size: u32) -> LiteralId {
        self.prepend([target as i32, invoke_type.as_operand()], pointer_size)
    }

    /// First entry, newest first, whose value is within `tolerance` of
    /// `value`.
    pub fn scan_for_near(&self, value: i32, tolerance: u32) -> Option<LiteralId> {
        self.iter()
            .find(|(_, lit)| (value.wrapping_sub(lit.operands[0]) as u32) <= tolerance)
            .map(|(id, _)| id)
    }

    /// Find a wide constant: the low word must match and the entry right
    /// after it must hold the high word. Records `high` on the match.
    pub fn scan_for_exact_wide(&mut self, low: i32, high: i32) -> Option<LiteralId> {
        let mut lo_target: Option<LiteralId> = None;
        let mut found = None;
        for (id, lit) in self.iter() {
            if let Some(lo) = lo_target {
                if lit.operands[0] == high {
                    found = Some(lo);
                    break;
                }
            }
            lo_target = (lit.operands[0] == low).then_some(id);
        }
        let lo = found?;
        self.get_mut(lo).operands[1] = high;
        Some(lo)
    }

    /// Find a pointer literal for the same target and invoke kind.
    pub fn scan_for_pointer(&self, target: u32, invoke_type: InvokeType) -> Option<LiteralId> {
        self.iter()
            .find(|(_, lit)| {
                lit.operands[0] == target as i32 && lit.operands[1] == invoke_type.as_operand()
            })
            .map(|(id, _)| id)
    }
}
