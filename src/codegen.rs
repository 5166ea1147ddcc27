//! Per-method code generation state.
//!
//! A [`CodegenUnit`] owns everything produced for one method: the
//! instruction list, the three literal pools, switch and fill-array tables,
//! and the finished side tables. It is never shared between threads; only
//! the patch sink is.
//!
//! The pipeline after instruction selection is:
//!
//! 1. [`CodegenUnit::process_switch_tables`] resolves case targets
//! 2. [`CodegenUnit::assign_offsets`] lays out code and data
//! 3. [`CodegenUnit::install`] encodes and appends data
//! 4. [`CodegenUnit::create_mapping_tables`] and
//!    [`CodegenUnit::create_native_gc_map`] build the side tables
//! 5. [`CodegenUnit::get_compiled_method`] packages the result
//!
//! [`CodegenUnit::materialize`] runs all of them in order.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info};

use crate::assemble::install::{
    install_fill_array_data, install_pointer_literals, install_switch_tables,
    install_word_literals,
};
use crate::assemble::layout::{DataSections, assign_data_offsets};
use crate::assemble::{CodeBuffer, DataLayout, InstructionEncoder};
use crate::compiled::{CompiledMethod, FrameLayout, build_vmap_table};
use crate::config::AssemblerConfig;
use crate::error::{AssembleError, Result};
use crate::lir::{
    DexOffset, FillArrayData, FixupKind, InvokeType, Lir, LirId, LirList, LiteralId,
    LiteralPool, PseudoOp, SwitchPayload, SwitchTable, resource,
};
use crate::maps::gc_map::create_native_gc_map;
use crate::maps::mapping_table::{
    MappingTable, create_mapping_table, verify_catch_entries, verify_mapping_table,
};
use crate::maps::{Diagnostic, ReferenceLiveness};
use crate::patch::{CodePatchSink, MethodContext, PatchKind};

pub struct CodegenUnit {
    config: AssemblerConfig,
    context: MethodContext,
    lir: LirList,
    literals: LiteralPool,
    code_literals: LiteralPool,
    method_literals: LiteralPool,
    switch_tables: Vec<SwitchTable>,
    fill_array_data: Vec<FillArrayData>,
    block_labels: HashMap<DexOffset, LirId>,
    catches: BTreeSet<DexOffset>,
    core_vmap_table: Vec<u32>,
    fp_vmap_table: Vec<u32>,
    frame: FrameLayout,
    frame_size: u32,
    data_layout: DataLayout,
    code: Vec<u8>,
    mapping_table: Vec<u8>,
    native_gc_map: Vec<u8>,
    diagnostics: Vec<Diagnostic>,
}

impl CodegenUnit {
    pub fn new(config: AssemblerConfig, context: MethodContext) -> Self {
        let lir = LirList::new(config.retain_nops_for_diagnostics).with_limit(config.max_lir_count);
        Self {
            config,
            context,
            lir,
            literals: LiteralPool::new(),
            code_literals: LiteralPool::new(),
            method_literals: LiteralPool::new(),
            switch_tables: Vec::new(),
            fill_array_data: Vec::new(),
            block_labels: HashMap::new(),
            catches: BTreeSet::new(),
            core_vmap_table: Vec::new(),
            fp_vmap_table: Vec::new(),
            frame: FrameLayout::default(),
            frame_size: 0,
            data_layout: DataLayout::default(),
            code: Vec::new(),
            mapping_table: Vec::new(),
            native_gc_map: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    pub fn config(&self) -> &AssemblerConfig {
        &self.config
    }

    pub fn context(&self) -> MethodContext {
        self.context
    }

    pub fn lir(&self) -> &LirList {
        &self.lir
    }

    pub fn lir_mut(&mut self) -> &mut LirList {
        &mut self.lir
    }

    pub fn literals(&self) -> &LiteralPool {
        &self.literals
    }

    pub fn code_literals(&self) -> &LiteralPool {
        &self.code_literals
    }

    pub fn method_literals(&self) -> &LiteralPool {
        &self.method_literals
    }

    pub fn switch_tables(&self) -> &[SwitchTable] {
        &self.switch_tables
    }

    pub fn fill_array_data(&self) -> &[FillArrayData] {
        &self.fill_array_data
    }

    pub fn data_layout(&self) -> DataLayout {
        self.data_layout
    }

    pub fn mapping_table(&self) -> &[u8] {
        &self.mapping_table
    }

    pub fn native_gc_map(&self) -> &[u8] {
        &self.native_gc_map
    }

    /// Non-fatal findings from table verification.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Bytes of data the pools have added so far.
    pub fn estimated_data_size(&self) -> u32 {
        self.literals.estimated_size()
            + self.code_literals.estimated_size()
            + self.method_literals.estimated_size()
    }

    // Literal pools

    pub fn add_word_data(&mut self, value: i32) -> LiteralId {
        self.literals.add_word(value)
    }

    pub fn add_wide_data(&mut self, low: i32, high: i32) -> LiteralId {
        self.literals.add_wide(low, high)
    }

    /// Reuse a word literal within `tolerance` of `value` if there is one.
    pub fn scan_literal_pool(&self, value: i32, tolerance: u32) -> Option<LiteralId> {
        self.literals.scan_for_near(value, tolerance)
    }

    pub fn scan_literal_pool_wide(&mut self, low: i32, high: i32) -> Option<LiteralId> {
        self.literals.scan_for_exact_wide(low, high)
    }

    /// Code pointer literal for a direct call, shared per (target, kind).
    pub fn add_code_literal(&mut self, target: u32, invoke_type: InvokeType) -> LiteralId {
        let pointer_size = self.config.instruction_set.pointer_size();
        self.code_literals
            .scan_for_pointer(target, invoke_type)
            .unwrap_or_else(|| self.code_literals.add_pointer(target, invoke_type, pointer_size))
    }

    /// Method pointer literal, shared per (target, kind).
    pub fn add_method_literal(&mut self, target: u32, invoke_type: InvokeType) -> LiteralId {
        let pointer_size = self.config.instruction_set.pointer_size();
        self.method_literals
            .scan_for_pointer(target, invoke_type)
            .unwrap_or_else(|| self.method_literals.add_pointer(target, invoke_type, pointer_size))
    }

    // Blocks, switches and frame

    pub fn register_block_label(&mut self, dex_offset: DexOffset, label: LirId) {
        self.block_labels.insert(dex_offset, label);
    }

    /// Append a normal block label for `dex_offset` and register it.
    pub fn new_block_label(&mut self, dex_offset: DexOffset) -> Result<LirId> {
        let label = self.lir.push(Lir::pseudo(PseudoOp::NormalBlockLabel, dex_offset))?;
        self.register_block_label(dex_offset, label);
        Ok(label)
    }

    pub fn block_label(&self, dex_offset: DexOffset) -> Option<LirId> {
        self.block_labels.get(&dex_offset).copied()
    }

    /// Declare `dex_offset` as the start of an exception handler.
    pub fn add_catch_entry(&mut self, dex_offset: DexOffset) {
        self.catches.insert(dex_offset);
    }

    pub fn add_switch_table(
        &mut self,
        payload: SwitchPayload,
        vaddr: DexOffset,
        anchor: Option<LirId>,
    ) -> usize {
        if self.config.verbose {
            payload.dump();
        }
        self.switch_tables.push(SwitchTable::new(payload, vaddr, anchor));
        self.switch_tables.len() - 1
    }

    pub fn add_fill_array_data(&mut self, data: FillArrayData) -> usize {
        self.fill_array_data.push(data);
        self.fill_array_data.len() - 1
    }

    pub fn set_frame(&mut self, frame: FrameLayout) -> Result<()> {
        self.frame_size = frame.compute_frame_size()?;
        self.frame = frame;
        Ok(())
    }

    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    /// Record a promoted core register: physical sort key in the high
    /// bits, virtual register in the low bits.
    pub fn record_core_vmap(&mut self, entry: u32) {
        self.core_vmap_table.push(entry);
    }

    pub fn record_fp_vmap(&mut self, vreg: u32) {
        self.fp_vmap_table.push(vreg);
    }

    /// Resolve every case of every switch table to a target instruction.
    /// In verbose mode each target gets its own `CaseLabel` carrying the
    /// case key, so listings show which key lands where.
    pub fn process_switch_tables(&mut self) -> Result<()> {
        for table in self.switch_tables.iter_mut() {
            table.targets.clear();
            for i in 0..table.payload.entries() {
                let case_vaddr = table.case_vaddr(i);
                let label = *self
                    .block_labels
                    .get(&case_vaddr)
                    .ok_or(AssembleError::MissingBlockLabel(case_vaddr))?;
                let target = if self.config.verbose {
                    if !self.lir.get(label).is_linked() {
                        return Err(AssembleError::ListCorrupted(format!(
                            "block label {} for dex offset {:#x} is not linked",
                            label, case_vaddr
                        )));
                    }
                    let mut case = Lir::pseudo(PseudoOp::CaseLabel, case_vaddr)
                        .with_fixup(FixupKind::Label);
                    case.operands[0] = table.payload.key(i);
                    case.masks.def_mask = resource::ENCODE_ALL;
                    let case = self.lir.alloc(case)?;
                    self.lir.insert_after(label, case);
                    case
                } else {
                    label
                };
                table.targets.push(target);
            }
        }
        Ok(())
    }

    /// Let the encoder stamp instruction offsets, then lay out the data
    /// region behind the code.
    pub fn assign_offsets(&mut self, encoder: &mut dyn InstructionEncoder) -> Result<DataLayout> {
        let code_size = encoder.assign_offsets(&mut self.lir)?;
        self.data_layout = assign_data_offsets(
            DataSections {
                literals: &mut self.literals,
                code_literals: &mut self.code_literals,
                method_literals: &mut self.method_literals,
                switch_tables: &mut self.switch_tables,
                fill_array_data: &mut self.fill_array_data,
            },
            code_size,
            self.config.instruction_set.pointer_size(),
        );
        debug!(
            code_size,
            data_offset = self.data_layout.data_offset,
            total_size = self.data_layout.total_size,
            "assigned offsets"
        );
        Ok(self.data_layout)
    }

    /// Encode instructions and append every data section.
    pub fn install(
        &mut self,
        encoder: &mut dyn InstructionEncoder,
        sink: &dyn CodePatchSink,
    ) -> Result<()> {
        let code = encoder.encode(self)?;
        let mut buf = CodeBuffer::from_code(code);
        let pointer_size = self.config.instruction_set.pointer_size();
        install_word_literals(&mut buf, &self.literals, self.data_layout.data_offset)?;
        install_pointer_literals(
            &mut buf,
            &self.code_literals,
            PatchKind::Code,
            self.context,
            pointer_size,
            sink,
        )?;
        install_pointer_literals(
            &mut buf,
            &self.method_literals,
            PatchKind::Method,
            self.context,
            pointer_size,
            sink,
        )?;
        install_switch_tables(&mut buf, &self.switch_tables, &self.lir, self.config.branch_origin())?;
        install_fill_array_data(&mut buf, &self.fill_array_data)?;
        buf.pad_to(self.data_layout.total_size);
        if buf.offset() != self.data_layout.total_size {
            return Err(AssembleError::LayoutMismatch {
                what: "end of image",
                expected: self.data_layout.total_size,
                actual: buf.offset(),
            });
        }
        self.code = buf.into_code();
        Ok(())
    }

    /// Build the mapping table, verifying it when configured to.
    pub fn create_mapping_tables(&mut self) -> Result<()> {
        self.mapping_table = create_mapping_table(&self.lir)?;
        if self.config.verify_tables {
            verify_mapping_table(&self.mapping_table, &self.lir)?;
            let decoded = MappingTable::decode(&self.mapping_table)?;
            let found = verify_catch_entries(&decoded, &self.catches);
            self.diagnostics.extend(found);
        }
        Ok(())
    }

    pub fn create_native_gc_map(&mut self, liveness: &dyn ReferenceLiveness) -> Result<()> {
        self.native_gc_map = create_native_gc_map(&self.mapping_table, liveness)?;
        Ok(())
    }

    pub fn get_compiled_method(&self) -> CompiledMethod {
        let vmap_table = build_vmap_table(
            &self.core_vmap_table,
            &self.fp_vmap_table,
            self.frame_size,
            &self.frame,
        );
        CompiledMethod {
            instruction_set: self.config.instruction_set,
            code: self.code.clone(),
            frame_size_in_bytes: self.frame_size,
            core_spill_mask: self.frame.core_spill_mask,
            fp_spill_mask: self.frame.fp_spill_mask,
            mapping_table: self.mapping_table.clone(),
            vmap_table,
            gc_map: self.native_gc_map.clone(),
        }
    }

    /// Run the whole back end for this method.
    pub fn materialize(
        &mut self,
        encoder: &mut dyn InstructionEncoder,
        liveness: &dyn ReferenceLiveness,
        sink: &dyn CodePatchSink,
    ) -> Result<CompiledMethod> {
        self.process_switch_tables()?;
        self.assign_offsets(encoder)?;
        self.install(encoder, sink)?;
        self.create_mapping_tables()?;
        self.create_native_gc_map(liveness)?;
        if self.config.verbose {
            self.dump();
        }
        let method = self.get_compiled_method();
        info!(
            method_idx = self.context.method_idx,
            code_bytes = method.code.len(),
            frame_size = method.frame_size_in_bytes,
            diagnostics = self.diagnostics.len(),
            "compiled method"
        );
        Ok(method)
    }

    /// Log the listing, pools and tables at debug level.
    pub fn dump(&self) {
        debug!(
            "Dumping LIR insns for method {} ({} insns, {} data bytes)",
            self.context.method_idx,
            self.lir.len(),
            self.estimated_data_size()
        );
        self.lir.dump();
        for (_, lit) in self.literals.iter() {
            debug!("{:x} ({:04x}): .word (0x{:x})", lit.offset, lit.offset, lit.operands[0]);
        }
        for (_, lit) in self.code_literals.iter().chain(self.method_literals.iter()) {
            debug!(
                "{:x} ({:04x}): .word (target #{}, {:?})",
                lit.offset,
                lit.offset,
                lit.operands[0],
                InvokeType::from_operand(lit.operands[1])
            );
        }
        match MappingTable::decode(&self.mapping_table) {
            Ok(table) => table.dump(&format!("method_{}", self.context.method_idx)),
            Err(e) => debug!("mapping table unreadable: {}", e),
        }
    }
}
