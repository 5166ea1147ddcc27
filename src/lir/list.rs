//! Arena-backed doubly linked instruction list.
//!
//! Records are allocated into a `Vec<Lir>` and addressed by [`LirId`]; the
//! prev/next links are indices into that vector. Unlinking never moves a
//! record, so ids held by switch tables and labels stay valid.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Lir, PseudoOp, resource};
use crate::error::{AssembleError, Result};

/// Stable handle to an instruction record in a [`LirList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LirId(u32);

impl LirId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for LirId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Instruction list for one method.
#[derive(Debug, Clone)]
pub struct LirList {
    arena: Vec<Lir>,
    first: Option<LirId>,
    last: Option<LirId>,
    len: usize,
    retain_nops: bool,
    limit: Option<usize>,
}

impl LirList {
    /// Create an empty list. With `retain_nops_for_diagnostics`, nop'ed
    /// instructions stay linked (flagged) instead of being unlinked.
    pub fn new(retain_nops_for_diagnostics: bool) -> Self {
        Self {
            arena: Vec::new(),
            first: None,
            last: None,
            len: 0,
            retain_nops: retain_nops_for_diagnostics,
            limit: None,
        }
    }

    /// Cap the number of records this arena will hand out.
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    /// Allocate a record without linking it.
    pub fn alloc(&mut self, mut lir: Lir) -> Result<LirId> {
        if let Some(limit) = self.limit {
            if self.arena.len() >= limit {
                return Err(AssembleError::ArenaExhausted { limit });
            }
        }
        lir.prev = None;
        lir.next = None;
        lir.linked = false;
        let id = LirId(self.arena.len() as u32);
        self.arena.push(lir);
        Ok(id)
    }

    /// Allocate a record and append it.
    pub fn push(&mut self, lir: Lir) -> Result<LirId> {
        let id = self.alloc(lir)?;
        self.append(id);
        Ok(id)
    }

    pub fn get(&self, id: LirId) -> &Lir {
        &self.arena[id.index()]
    }

    pub fn get_mut(&mut self, id: LirId) -> &mut Lir {
        &mut self.arena[id.index()]
    }

    pub fn first(&self) -> Option<LirId> {
        self.first
    }

    pub fn last(&self) -> Option<LirId> {
        self.last
    }

    /// Number of linked records.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    /// Add `id` at the tail.
    pub fn append(&mut self, id: LirId) {
        debug_assert!(!self.get(id).linked, "{} is already linked", id);
        match self.last {
            None => {
                debug_assert!(self.first.is_none());
                self.first = Some(id);
            }
            Some(last) => {
                self.arena[last.index()].next = Some(id);
            }
        }
        let lir = &mut self.arena[id.index()];
        lir.prev = self.last;
        lir.next = None;
        lir.linked = true;
        self.last = Some(id);
        self.len += 1;
    }

    /// Link `id` immediately before `anchor`.
    ///
    /// prev <-> id <-> anchor
    pub fn insert_before(&mut self, anchor: LirId, id: LirId) {
        debug_assert!(self.get(anchor).linked, "anchor {} is not linked", anchor);
        debug_assert!(!self.get(id).linked, "{} is already linked", id);
        let prev = self.arena[anchor.index()].prev;
        match prev {
            Some(prev) => self.arena[prev.index()].next = Some(id),
            None => self.first = Some(id),
        }
        let lir = &mut self.arena[id.index()];
        lir.prev = prev;
        lir.next = Some(anchor);
        lir.linked = true;
        self.arena[anchor.index()].prev = Some(id);
        self.len += 1;
    }

    /// Link `id` immediately after `anchor`.
    ///
    /// anchor <-> id <-> old next
    pub fn insert_after(&mut self, anchor: LirId, id: LirId) {
        debug_assert!(self.get(anchor).linked, "anchor {} is not linked", anchor);
        debug_assert!(!self.get(id).linked, "{} is already linked", id);
        let next = self.arena[anchor.index()].next;
        match next {
            Some(next) => self.arena[next.index()].prev = Some(id),
            None => self.last = Some(id),
        }
        let lir = &mut self.arena[id.index()];
        lir.prev = Some(anchor);
        lir.next = next;
        lir.linked = true;
        self.arena[anchor.index()].next = Some(id);
        self.len += 1;
    }

    /// Remove `id` from the list. The record stays allocated.
    pub fn unlink(&mut self, id: LirId) {
        if !self.arena[id.index()].linked {
            return;
        }
        let (prev, next) = {
            let lir = &self.arena[id.index()];
            (lir.prev, lir.next)
        };
        match prev {
            Some(prev) => self.arena[prev.index()].next = next,
            None => {
                debug_assert_eq!(self.first, Some(id));
                self.first = next;
            }
        }
        match next {
            Some(next) => self.arena[next.index()].prev = prev,
            None => {
                debug_assert_eq!(self.last, Some(id));
                self.last = prev;
            }
        }
        let lir = &mut self.arena[id.index()];
        lir.prev = None;
        lir.next = None;
        lir.linked = false;
        self.len -= 1;
    }

    /// Turn `id` into a nop. Unlinks it unless nops are retained for
    /// diagnostics, in which case it stays linked with `is_nop` set.
    pub fn convert_to_nop(&mut self, id: LirId) {
        self.arena[id.index()].flags.is_nop = true;
        if !self.retain_nops {
            self.unlink(id);
        }
    }

    /// Record a safepoint after the call `inst`: the call is made to clobber
    /// everything and a `SafepointPc` marker is appended.
    pub fn mark_safepoint_pc(&mut self, inst: LirId) -> Result<LirId> {
        let lir = self.get_mut(inst);
        debug_assert!(!lir.flags.use_def_invalid);
        lir.masks.def_mask = resource::ENCODE_ALL;
        let dex_offset = lir.dex_offset;
        let mut marker = Lir::pseudo(PseudoOp::SafepointPc, dex_offset);
        marker.masks.def_mask = resource::ENCODE_ALL;
        self.push(marker)
    }

    /// Append an `ExportedPc` marker for `dex_offset`.
    pub fn mark_exported_pc(&mut self, dex_offset: u32) -> Result<LirId> {
        let mut marker = Lir::pseudo(PseudoOp::ExportedPc, dex_offset);
        marker.masks.def_mask = resource::ENCODE_ALL;
        self.push(marker)
    }

    /// Iterate linked records in list order, nops included.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            cursor: self.first,
        }
    }

    /// Iterate linked records that are not flagged as nops.
    pub fn live(&self) -> impl Iterator<Item = (LirId, &Lir)> + '_ {
        self.iter().filter(|(_, lir)| !lir.flags.is_nop)
    }

    /// Walk the list and check that prev/next links and trackers agree.
    pub fn check_links(&self) -> Result<()> {
        let mut prev: Option<LirId> = None;
        let mut count = 0;
        let mut cursor = self.first;
        while let Some(id) = cursor {
            let lir = self.get(id);
            if !lir.linked {
                return Err(AssembleError::ListCorrupted(format!("{} reachable but not linked", id)));
            }
            if lir.prev != prev {
                return Err(AssembleError::ListCorrupted(format!(
                    "{}.prev is {:?}, expected {:?}",
                    id, lir.prev, prev
                )));
            }
            count += 1;
            if count > self.arena.len() {
                return Err(AssembleError::ListCorrupted("cycle detected".to_string()));
            }
            prev = Some(id);
            cursor = lir.next;
        }
        if self.last != prev {
            return Err(AssembleError::ListCorrupted(format!(
                "tail tracker is {:?}, walk ended at {:?}",
                self.last, prev
            )));
        }
        if count != self.len {
            return Err(AssembleError::ListCorrupted(format!(
                "walked {} records, length says {}",
                count, self.len
            )));
        }
        Ok(())
    }

    /// Log the list at debug level.
    pub fn dump(&self) {
        for (id, lir) in self.iter() {
            if lir.flags.is_nop && !self.retain_nops {
                continue;
            }
            match lir.opcode {
                super::Opcode::Pseudo(PseudoOp::SafepointPc) => {
                    debug!("LsafepointPC_0x{:x}_{:x}:", lir.offset, lir.dex_offset)
                }
                super::Opcode::Pseudo(PseudoOp::ExportedPc) => {
                    debug!("LexportedPC_0x{:x}_{:x}:", lir.offset, lir.dex_offset)
                }
                super::Opcode::Pseudo(PseudoOp::DalvikByteCodeBoundary) => {
                    debug!("-------- dalvik offset: 0x{:x}", lir.dex_offset)
                }
                super::Opcode::Pseudo(op) if op.is_label() => debug!("{} ({:?}):", id, op),
                super::Opcode::Pseudo(op) => debug!("-------- {:?}", op),
                super::Opcode::Target(opcode) => debug!(
                    "{:05x}: op{:<6} {:?}{}",
                    lir.offset,
                    opcode,
                    lir.operands,
                    if lir.flags.is_nop { "(nop)" } else { "" }
                ),
            }
        }
    }
}

pub struct Iter<'a> {
    list: &'a LirList,
    cursor: Option<LirId>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (LirId, &'a Lir);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor?;
        let lir = self.list.get(id);
        self.cursor = lir.next;
        Some((id, lir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::Opcode;

    fn op(n: u16) -> Lir {
        Lir::target(n, 0, &[])
    }

    fn opcodes(list: &LirList) -> Vec<u16> {
        list.iter()
            .map(|(_, lir)| match lir.opcode {
                Opcode::Target(n) => n,
                Opcode::Pseudo(_) => u16::MAX,
            })
            .collect()
    }

    #[test]
    fn test_append_and_iterate() {
        let mut list = LirList::new(false);
        assert!(list.is_empty());
        list.push(op(1)).unwrap();
        list.push(op(2)).unwrap();
        list.push(op(3)).unwrap();
        assert_eq!(opcodes(&list), vec![1, 2, 3]);
        assert_eq!(list.len(), 3);
        list.check_links().unwrap();
    }

    #[test]
    fn test_insert_before_and_after() {
        let mut list = LirList::new(false);
        let a = list.push(op(1)).unwrap();
        let c = list.push(op(3)).unwrap();
        let b = list.alloc(op(2)).unwrap();
        list.insert_before(c, b);
        let d = list.alloc(op(4)).unwrap();
        list.insert_after(c, d);
        let z = list.alloc(op(0)).unwrap();
        list.insert_before(a, z);
        assert_eq!(opcodes(&list), vec![0, 1, 2, 3, 4]);
        assert_eq!(list.first(), Some(z));
        assert_eq!(list.last(), Some(d));
        list.check_links().unwrap();
    }

    #[test]
    fn test_unlink_head_tail_middle_and_sole() {
        let mut list = LirList::new(false);
        let a = list.push(op(1)).unwrap();
        let b = list.push(op(2)).unwrap();
        let c = list.push(op(3)).unwrap();
        let d = list.push(op(4)).unwrap();

        list.unlink(a);
        assert_eq!(list.first(), Some(b));
        list.unlink(d);
        assert_eq!(list.last(), Some(c));
        list.check_links().unwrap();

        list.unlink(b);
        assert_eq!(opcodes(&list), vec![3]);
        list.unlink(c);
        assert!(list.is_empty());
        assert_eq!(list.last(), None);
        list.check_links().unwrap();

        // Unlinking twice is harmless.
        list.unlink(c);
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn test_mixed_operation_sequence_keeps_links_consistent() {
        let mut list = LirList::new(false);
        let mut ids = Vec::new();
        for i in 0..16u16 {
            ids.push(list.push(op(i)).unwrap());
        }
        for (step, &id) in ids.iter().enumerate().step_by(3) {
            list.unlink(id);
            list.check_links().unwrap();
            let fresh = list.alloc(op(100 + step as u16)).unwrap();
            match list.first() {
                Some(head) if step % 2 == 0 => list.insert_before(head, fresh),
                Some(_) => {
                    let tail = list.last().unwrap();
                    list.insert_after(tail, fresh);
                }
                None => list.append(fresh),
            }
            list.check_links().unwrap();
        }
        for (id, lir) in list.iter() {
            if let Some(next) = lir.next() {
                assert_eq!(list.get(next).prev(), Some(id));
            }
            if let Some(prev) = lir.prev() {
                assert_eq!(list.get(prev).next(), Some(id));
            }
        }
    }

    #[test]
    fn test_convert_to_nop_unlinks_by_default() {
        let mut list = LirList::new(false);
        list.push(op(1)).unwrap();
        let b = list.push(op(2)).unwrap();
        list.push(op(3)).unwrap();
        list.convert_to_nop(b);
        assert_eq!(opcodes(&list), vec![1, 3]);
        assert!(list.get(b).flags.is_nop);
        assert!(!list.get(b).is_linked());
    }

    #[test]
    fn test_convert_to_nop_retained_for_diagnostics() {
        let mut list = LirList::new(true);
        list.push(op(1)).unwrap();
        let b = list.push(op(2)).unwrap();
        list.convert_to_nop(b);
        assert_eq!(opcodes(&list), vec![1, 2]);
        assert_eq!(list.live().count(), 1);
    }

    #[test]
    fn test_mark_safepoint_pc() {
        let mut list = LirList::new(false);
        let call = list.push(Lir::target(9, 0x12, &[])).unwrap();
        let marker = list.mark_safepoint_pc(call).unwrap();
        assert_eq!(list.get(call).masks.def_mask, resource::ENCODE_ALL);
        let marker = list.get(marker);
        assert!(marker.is_pseudo(PseudoOp::SafepointPc));
        assert_eq!(marker.dex_offset, 0x12);
        assert_eq!(list.last(), Some(LirId(1)));
    }

    #[test]
    fn test_arena_limit() {
        let mut list = LirList::new(false).with_limit(Some(2));
        list.push(op(1)).unwrap();
        list.push(op(2)).unwrap();
        let err = list.push(op(3)).unwrap_err();
        assert!(matches!(err, AssembleError::ArenaExhausted { limit: 2 }));
    }
}
