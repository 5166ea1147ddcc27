//! Assembler configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::Result;

/// Default file name looked up by the CLI.
pub const CONFIG_FILE_NAME: &str = "lirasm.toml";

/// Target instruction set of the method being assembled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstructionSet {
    /// Thumb2 (32-bit ARM)
    #[default]
    Thumb2,
    /// 32-bit x86
    X86,
    /// 32-bit MIPS
    Mips,
}

impl InstructionSet {
    /// Width of a native pointer in bytes.
    pub fn pointer_size(self) -> u32 {
        match self {
            InstructionSet::Thumb2 | InstructionSet::X86 | InstructionSet::Mips => 4,
        }
    }

    /// Origin switch displacements are measured from on this target.
    pub fn default_branch_origin(self) -> BranchOrigin {
        match self {
            // bx reads the PC with its automatic advance applied
            InstructionSet::Thumb2 => BranchOrigin::AnchorPlusAdvance(4),
            InstructionSet::X86 => BranchOrigin::MethodStart,
            InstructionSet::Mips => BranchOrigin::Anchor,
        }
    }
}

impl std::fmt::Display for InstructionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstructionSet::Thumb2 => write!(f, "thumb2"),
            InstructionSet::X86 => write!(f, "x86"),
            InstructionSet::Mips => write!(f, "mips"),
        }
    }
}

/// Reference point for switch-table displacements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BranchOrigin {
    /// Offset of the dispatching instruction plus its PC advance.
    AnchorPlusAdvance(u32),
    /// Offset of the dispatching instruction.
    Anchor,
    /// Start of the table itself.
    TableStart,
    /// Start of the method (offset 0).
    MethodStart,
}

/// Configuration for assembling one method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AssemblerConfig {
    pub instruction_set: InstructionSet,
    /// Keep nop'ed instructions linked (flagged) so listings can show them.
    pub retain_nops_for_diagnostics: bool,
    /// Emit listings and table dumps; also inserts case labels for switches.
    pub verbose: bool,
    /// Re-decode and cross-check the mapping table after building it.
    pub verify_tables: bool,
    /// Hard limit on LIR records per method (None = unlimited)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_lir_count: Option<usize>,
    /// Overrides the instruction set's switch displacement origin.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub switch_branch_origin: Option<BranchOrigin>,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            instruction_set: InstructionSet::Thumb2,
            retain_nops_for_diagnostics: false,
            verbose: false,
            verify_tables: cfg!(debug_assertions),
            max_lir_count: None,
            switch_branch_origin: None,
        }
    }
}

impl AssemblerConfig {
    pub fn branch_origin(&self) -> BranchOrigin {
        self.switch_branch_origin
            .unwrap_or_else(|| self.instruction_set.default_branch_origin())
    }

    /// Load a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Write this config as TOML.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_origins() {
        assert_eq!(
            InstructionSet::Thumb2.default_branch_origin(),
            BranchOrigin::AnchorPlusAdvance(4)
        );
        assert_eq!(InstructionSet::X86.default_branch_origin(), BranchOrigin::MethodStart);
        assert_eq!(InstructionSet::Mips.default_branch_origin(), BranchOrigin::Anchor);
    }

    #[test]
    fn test_override_origin() {
        let config = AssemblerConfig {
            switch_branch_origin: Some(BranchOrigin::TableStart),
            ..Default::default()
        };
        assert_eq!(config.branch_origin(), BranchOrigin::TableStart);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: AssemblerConfig = toml::from_str(
            r#"
instruction-set = "mips"
retain-nops-for-diagnostics = true
max-lir-count = 512
"#,
        )
        .unwrap();
        assert_eq!(config.instruction_set, InstructionSet::Mips);
        assert!(config.retain_nops_for_diagnostics);
        assert!(!config.verbose);
        assert_eq!(config.max_lir_count, Some(512));
        assert_eq!(config.switch_branch_origin, None);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let config = AssemblerConfig {
            instruction_set: InstructionSet::X86,
            verbose: true,
            switch_branch_origin: Some(BranchOrigin::AnchorPlusAdvance(8)),
            ..Default::default()
        };
        config.save(&path).unwrap();
        let loaded = AssemblerConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
