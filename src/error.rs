//! Error type shared by every stage of method assembly.
//!
//! Everything in here is fatal for the method being compiled: the variants
//! describe broken upstream contracts or malformed tables, never conditions
//! worth retrying. Consistency warnings that should not abort a compilation
//! are reported as [`crate::maps::Diagnostic`] values instead.

use thiserror::Error;

/// Which block of the mapping table an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingKind {
    /// Native PC -> source PC entries recorded at safepoints.
    PcToDex,
    /// Source PC -> native PC entries recorded for exported PCs.
    DexToPc,
}

impl std::fmt::Display for MappingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MappingKind::PcToDex => write!(f, "pc2dex"),
            MappingKind::DexToPc => write!(f, "dex2pc"),
        }
    }
}

#[derive(Debug, Error)]
pub enum AssembleError {
    /// The per-method arena hit its configured capacity.
    #[error("LIR arena exhausted: limit of {limit} instructions reached")]
    ArenaExhausted { limit: usize },

    /// Link structure of the instruction list is inconsistent.
    #[error("instruction list corrupted: {0}")]
    ListCorrupted(String),

    #[error("{kind} native offsets out of order: {offset:#x} follows {previous:#x}")]
    NonMonotonicOffset {
        kind: MappingKind,
        previous: u32,
        offset: u32,
    },

    #[error("reference map is full: all {capacity} slots are in use")]
    ReferenceMapFull { capacity: usize },

    #[error("missing reference bitmap for dex pc {0:#x}")]
    MissingReferenceBitmap(u32),

    #[error("reference bitmap has {actual} bytes, table expects {expected}")]
    BitmapWidthMismatch { expected: usize, actual: usize },

    #[error("{what} {value} does not fit (limit {limit})")]
    LimitExceeded {
        what: &'static str,
        value: usize,
        limit: usize,
    },

    #[error("invalid payload ident {0:#06x}")]
    InvalidPayload(u16),

    #[error("payload truncated: need {needed} code units, have {available}")]
    TruncatedPayload { needed: usize, available: usize },

    #[error("no block label for dex offset {0:#x}")]
    MissingBlockLabel(u32),

    #[error("switch table at dex offset {0:#x} has no anchor instruction")]
    MissingSwitchAnchor(u32),

    #[error("malformed {table}: {reason}")]
    MalformedTable {
        table: &'static str,
        reason: String,
    },

    /// The encoded mapping table does not reproduce the instruction walk.
    #[error("mapping table mismatch: {0}")]
    MappingTableMismatch(String),

    #[error("data layout mismatch: {what} expected at {expected:#x}, buffer is at {actual:#x}")]
    LayoutMismatch {
        what: &'static str,
        expected: u32,
        actual: u32,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("invalid method description: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AssembleError>;

impl AssembleError {
    pub(crate) fn malformed(table: &'static str, reason: impl Into<String>) -> Self {
        AssembleError::MalformedTable {
            table,
            reason: reason.into(),
        }
    }
}
