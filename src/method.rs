//! JSON method descriptions.
//!
//! The CLI has no instruction selector in front of it, so it reads the
//! selector's output from a JSON file: a flat instruction stream plus the
//! switch, fill-array, catch, frame and reference information for one
//! method.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::assemble::FixedWidthEncoder;
use crate::codegen::CodegenUnit;
use crate::compiled::{CompiledMethod, FrameLayout};
use crate::config::{AssemblerConfig, InstructionSet};
use crate::error::{AssembleError, Result};
use crate::lir::{FillArrayData, FixupKind, InvokeType, Lir, PseudoOp, SwitchPayload};
use crate::maps::{DexGcMapBuilder, DexPcToReferenceMap, Diagnostic};
use crate::patch::{CodePatch, CodePatchSink, MethodContext, MethodPatchSink};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Instruction {
    /// Start of the basic block at `dex_pc`.
    Label { dex_pc: u32 },
    /// Plain target instruction.
    Op {
        opcode: u16,
        dex_pc: u32,
        #[serde(default)]
        operands: Vec<i32>,
        /// Already eliminated by an optimization pass.
        #[serde(default)]
        nop: bool,
    },
    /// Call followed by a safepoint.
    Call {
        opcode: u16,
        dex_pc: u32,
        #[serde(default)]
        operands: Vec<i32>,
    },
    /// Call through the code pointer pool.
    InvokeCode {
        opcode: u16,
        dex_pc: u32,
        target: u32,
        #[serde(default)]
        invoke_type: InvokeType,
    },
    /// Call through the method pointer pool.
    InvokeMethod {
        opcode: u16,
        dex_pc: u32,
        target: u32,
        #[serde(default)]
        invoke_type: InvokeType,
    },
    /// PC-relative load of a word constant.
    LoadWord { opcode: u16, dex_pc: u32, value: i32 },
    /// PC-relative load of a 64-bit constant.
    LoadWide {
        opcode: u16,
        dex_pc: u32,
        low: i32,
        high: i32,
    },
    /// Table dispatch through `switches[table]`.
    Switch { opcode: u16, dex_pc: u32, table: usize },
    ExportPc { dex_pc: u32 },
    Align4,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SwitchDescription {
    Packed {
        dex_pc: u32,
        first_key: i32,
        targets: Vec<i32>,
    },
    Sparse {
        dex_pc: u32,
        /// `(key, relative target)` in case order.
        cases: Vec<(i32, i32)>,
    },
}

impl SwitchDescription {
    fn dex_pc(&self) -> u32 {
        match self {
            SwitchDescription::Packed { dex_pc, .. } | SwitchDescription::Sparse { dex_pc, .. } => {
                *dex_pc
            }
        }
    }

    fn payload(&self) -> SwitchPayload {
        match self {
            SwitchDescription::Packed {
                first_key, targets, ..
            } => SwitchPayload::packed(*first_key, targets),
            SwitchDescription::Sparse { cases, .. } => SwitchPayload::sparse(cases),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillArrayDescription {
    pub dex_pc: u32,
    pub element_width: u16,
    pub data: Vec<u8>,
}

/// Registers holding references at one source PC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceSet {
    pub dex_pc: u32,
    #[serde(default)]
    pub registers: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDescription {
    pub name: String,
    #[serde(default)]
    pub dex_file: u32,
    #[serde(default)]
    pub class_def_idx: u32,
    #[serde(default)]
    pub method_idx: u32,
    #[serde(default)]
    pub invoke_type: InvokeType,
    /// Overrides the configured instruction set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction_set: Option<InstructionSet>,
    pub instructions: Vec<Instruction>,
    #[serde(default)]
    pub switches: Vec<SwitchDescription>,
    #[serde(default)]
    pub fill_arrays: Vec<FillArrayDescription>,
    #[serde(default)]
    pub catches: Vec<u32>,
    #[serde(default)]
    pub frame: FrameLayout,
    #[serde(default)]
    pub core_vmap: Vec<u32>,
    #[serde(default)]
    pub fp_vmap: Vec<u32>,
    /// Verifier output. Every call site must have an entry.
    #[serde(default)]
    pub references: Vec<ReferenceSet>,
}

impl MethodDescription {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn context(&self) -> MethodContext {
        MethodContext {
            dex_file: self.dex_file,
            class_def_idx: self.class_def_idx,
            method_idx: self.method_idx,
            invoke_type: self.invoke_type,
        }
    }

    /// Encode the verifier reference map for this method.
    pub fn dex_gc_map(&self) -> Result<Vec<u8>> {
        let mut builder = DexGcMapBuilder::new(self.frame.num_regs as usize);
        for set in &self.references {
            builder.add_safepoint(set.dex_pc);
            for &reg in &set.registers {
                builder.set_reference(set.dex_pc, reg)?;
            }
        }
        builder.build()
    }

    /// Replay the instruction stream into a fresh unit.
    pub fn build_unit(&self, config: &AssemblerConfig) -> Result<CodegenUnit> {
        let mut config = config.clone();
        if let Some(isa) = self.instruction_set {
            config.instruction_set = isa;
        }
        let mut cu = CodegenUnit::new(config, self.context());
        let mut anchors = HashMap::new();

        for insn in &self.instructions {
            match insn {
                Instruction::Label { dex_pc } => {
                    cu.new_block_label(*dex_pc)?;
                }
                Instruction::Op {
                    opcode,
                    dex_pc,
                    operands,
                    nop,
                } => {
                    let id = cu.lir_mut().push(Lir::target(*opcode, *dex_pc, operands))?;
                    if *nop {
                        cu.lir_mut().convert_to_nop(id);
                    }
                }
                Instruction::Call {
                    opcode,
                    dex_pc,
                    operands,
                } => {
                    let id = cu.lir_mut().push(Lir::target(*opcode, *dex_pc, operands))?;
                    cu.lir_mut().mark_safepoint_pc(id)?;
                }
                Instruction::InvokeCode {
                    opcode,
                    dex_pc,
                    target,
                    invoke_type,
                } => {
                    cu.add_code_literal(*target, *invoke_type);
                    let lir = Lir::target(*opcode, *dex_pc, &[*target as i32]).with_fixup(FixupKind::Load);
                    let id = cu.lir_mut().push(lir)?;
                    cu.lir_mut().mark_safepoint_pc(id)?;
                }
                Instruction::InvokeMethod {
                    opcode,
                    dex_pc,
                    target,
                    invoke_type,
                } => {
                    cu.add_method_literal(*target, *invoke_type);
                    let lir = Lir::target(*opcode, *dex_pc, &[*target as i32]).with_fixup(FixupKind::Load);
                    let id = cu.lir_mut().push(lir)?;
                    cu.lir_mut().mark_safepoint_pc(id)?;
                }
                Instruction::LoadWord {
                    opcode,
                    dex_pc,
                    value,
                } => {
                    if cu.scan_literal_pool(*value, 0).is_none() {
                        cu.add_word_data(*value);
                    }
                    let lir = Lir::target(*opcode, *dex_pc, &[*value]).with_fixup(FixupKind::Load);
                    cu.lir_mut().push(lir)?;
                }
                Instruction::LoadWide {
                    opcode,
                    dex_pc,
                    low,
                    high,
                } => {
                    if cu.scan_literal_pool_wide(*low, *high).is_none() {
                        cu.add_wide_data(*low, *high);
                    }
                    let lir = Lir::target(*opcode, *dex_pc, &[*low, *high]).with_fixup(FixupKind::Load);
                    cu.lir_mut().push(lir)?;
                }
                Instruction::Switch {
                    opcode,
                    dex_pc,
                    table,
                } => {
                    if *table >= self.switches.len() {
                        return Err(AssembleError::malformed(
                            "method description",
                            format!("switch at 0x{:x} names table {}", dex_pc, table),
                        ));
                    }
                    let lir = Lir::target(*opcode, *dex_pc, &[*table as i32])
                        .with_fixup(FixupKind::SwitchTable);
                    anchors.insert(*table, cu.lir_mut().push(lir)?);
                }
                Instruction::ExportPc { dex_pc } => {
                    cu.lir_mut().mark_exported_pc(*dex_pc)?;
                }
                Instruction::Align4 => {
                    cu.lir_mut().push(Lir::pseudo(PseudoOp::Align4, 0))?;
                }
            }
        }

        for (i, switch) in self.switches.iter().enumerate() {
            cu.add_switch_table(switch.payload(), switch.dex_pc(), anchors.get(&i).copied());
        }
        for fill in &self.fill_arrays {
            cu.add_fill_array_data(FillArrayData::from_elements(
                fill.element_width,
                &fill.data,
                fill.dex_pc,
            )?);
        }
        for &catch in &self.catches {
            cu.add_catch_entry(catch);
        }
        cu.set_frame(self.frame)?;
        for &entry in &self.core_vmap {
            cu.record_core_vmap(entry);
        }
        for &vreg in &self.fp_vmap {
            cu.record_fp_vmap(vreg);
        }
        Ok(cu)
    }
}

/// A compiled method as written by the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledArtifact {
    pub name: String,
    pub method_idx: u32,
    pub compiled: CompiledMethod,
    #[serde(default)]
    pub patches: Vec<CodePatch>,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
}

impl CompiledArtifact {
    /// Where the artifact for method `name` goes inside `out_dir`. Names
    /// must be plain file names.
    pub fn output_path(out_dir: &Path, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(AssembleError::malformed(
                "method description",
                format!("method name {:?} is not a plain file name", name),
            ));
        }
        Ok(out_dir.join(format!("{}.compiled.json", name)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

/// Result of compiling one description.
#[derive(Debug, Clone)]
pub struct MethodOutput {
    pub method: CompiledMethod,
    /// Patches this compilation produced, also forwarded to the shared sink.
    pub patches: Vec<CodePatch>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Compile one description with the fixed-width encoder.
pub fn compile_method(
    desc: &MethodDescription,
    config: &AssemblerConfig,
    sink: &dyn CodePatchSink,
) -> Result<MethodOutput> {
    let mut cu = desc.build_unit(config)?;
    let dex_gc_map = desc.dex_gc_map()?;
    let liveness = DexPcToReferenceMap::new(&dex_gc_map)?;
    let own = MethodPatchSink::new(sink);
    let method = cu.materialize(&mut FixedWidthEncoder::default(), &liveness, &own)?;
    Ok(MethodOutput {
        method,
        patches: own.into_patches(),
        diagnostics: cu.diagnostics().to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::PatchRecorder;

    const SAMPLE: &str = r#"{
        "name": "sample",
        "method_idx": 3,
        "instructions": [
            {"op": "label", "dex_pc": 0},
            {"op": "load-word", "opcode": 1, "dex_pc": 0, "value": 42},
            {"op": "invoke-code", "opcode": 2, "dex_pc": 2, "target": 9},
            {"op": "op", "opcode": 3, "dex_pc": 4, "nop": true},
            {"op": "export-pc", "dex_pc": 4},
            {"op": "label", "dex_pc": 4},
            {"op": "op", "opcode": 4, "dex_pc": 4}
        ],
        "catches": [4],
        "frame": {"num_regs": 3},
        "references": [{"dex_pc": 2, "registers": [0, 2]}]
    }"#;

    #[test]
    fn test_parse_and_compile() {
        let desc: MethodDescription = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(desc.instructions.len(), 7);
        let recorder = PatchRecorder::new();
        let config = AssemblerConfig {
            verify_tables: true,
            ..Default::default()
        };
        let output = compile_method(&desc, &config, &recorder).unwrap();
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);
        // three live instructions, a word literal, a code pointer
        assert_eq!(output.method.code.len(), 20);
        assert_eq!(output.patches, recorder.patches_for(3));
        let patches = output.patches;
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].literal_offset, 16);
        assert_eq!(patches[0].target_method_idx, 9);
    }

    #[test]
    fn test_patches_stay_with_their_method() {
        let calls_code: MethodDescription = serde_json::from_str(
            r#"{
                "name": "a",
                "instructions": [{"op": "invoke-code", "opcode": 1, "dex_pc": 0, "target": 9}],
                "frame": {"num_regs": 2},
                "references": [{"dex_pc": 0, "registers": [1]}]
            }"#,
        )
        .unwrap();
        let calls_method: MethodDescription = serde_json::from_str(
            r#"{
                "name": "b",
                "instructions": [{"op": "invoke-method", "opcode": 1, "dex_pc": 0, "target": 77}],
                "frame": {"num_regs": 2},
                "references": [{"dex_pc": 0, "registers": [1]}]
            }"#,
        )
        .unwrap();
        assert_eq!(calls_code.method_idx, calls_method.method_idx);

        let recorder = PatchRecorder::new();
        let config = AssemblerConfig::default();
        let a = compile_method(&calls_code, &config, &recorder).unwrap();
        let b = compile_method(&calls_method, &config, &recorder).unwrap();

        assert_eq!(recorder.len(), 2);
        assert_eq!(a.patches.len(), 1);
        assert_eq!(a.patches[0].target_method_idx, 9);
        assert_eq!(b.patches.len(), 1);
        assert_eq!(b.patches[0].target_method_idx, 77);
    }

    #[test]
    fn test_oversized_frame_is_an_error() {
        let mut desc: MethodDescription = serde_json::from_str(SAMPLE).unwrap();
        desc.frame.num_regs = u32::MAX / 2;
        let err = compile_method(&desc, &AssemblerConfig::default(), &PatchRecorder::new())
            .unwrap_err();
        assert!(matches!(err, AssembleError::LimitExceeded { .. }));
    }

    #[test]
    fn test_output_path_rejects_separators() {
        let dir = Path::new("out");
        assert_eq!(
            CompiledArtifact::output_path(dir, "calls").unwrap(),
            dir.join("calls.compiled.json")
        );
        for name in ["../x", "a/b", "a\\b", "..", ""] {
            assert!(CompiledArtifact::output_path(dir, name).is_err(), "{:?}", name);
        }
    }

    #[test]
    fn test_missing_reference_set_is_fatal() {
        let mut desc: MethodDescription = serde_json::from_str(SAMPLE).unwrap();
        desc.references.clear();
        let err = compile_method(&desc, &AssemblerConfig::default(), &PatchRecorder::new())
            .unwrap_err();
        assert!(matches!(err, AssembleError::MissingReferenceBitmap(2)));
    }

    #[test]
    fn test_unknown_switch_table() {
        let desc = MethodDescription {
            name: "bad".to_string(),
            dex_file: 0,
            class_def_idx: 0,
            method_idx: 0,
            invoke_type: InvokeType::Static,
            instruction_set: None,
            instructions: vec![Instruction::Switch {
                opcode: 1,
                dex_pc: 0,
                table: 0,
            }],
            switches: Vec::new(),
            fill_arrays: Vec::new(),
            catches: Vec::new(),
            frame: FrameLayout::default(),
            core_vmap: Vec::new(),
            fp_vmap: Vec::new(),
            references: Vec::new(),
        };
        assert!(desc.build_unit(&AssemblerConfig::default()).is_err());
    }
}
