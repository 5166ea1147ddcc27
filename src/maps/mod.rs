//! Binary side tables produced for a compiled method.
//!
//! - `mapping_table`: native PC <-> source PC (exception dispatch, unwinding)
//! - `gc_map`: native PC -> live reference bitmap (precise GC)
//! - `dex_gc_map`: the verifier's source PC -> bitmap table that feeds it

pub mod dex_gc_map;
pub mod gc_map;
pub mod mapping_table;

pub use dex_gc_map::{DexGcMapBuilder, DexPcToReferenceMap, ReferenceLiveness};
pub use gc_map::{
    NativePcOffsetToReferenceMap, NativePcToReferenceMapBuilder, create_native_gc_map,
};
pub use mapping_table::{MappingEntry, MappingTable};

use serde::{Deserialize, Serialize};

/// Non-fatal consistency findings surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Diagnostic {
    /// An exported PC exists for a source PC that is not a catch entry.
    UnexpectedCatchEntry { dex_pc: u32 },
    /// A declared catch entry has no exported native PC.
    MissingCatchEntry { dex_pc: u32 },
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Diagnostic::UnexpectedCatchEntry { dex_pc } => {
                write!(f, "unexpected catch entry @ dex pc 0x{:x}", dex_pc)
            }
            Diagnostic::MissingCatchEntry { dex_pc } => {
                write!(f, "missing native PC for catch entry @ 0x{:x}", dex_pc)
            }
        }
    }
}
