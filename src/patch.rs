//! Code patch sink.
//!
//! Pointer literals written into a method's code are placeholders; the
//! sink is told where each one lives so the linker can resolve it later.
//! A single sink is shared by every compilation worker.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::lir::InvokeType;

/// Identity of the method being compiled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodContext {
    pub dex_file: u32,
    pub class_def_idx: u32,
    pub method_idx: u32,
    pub invoke_type: InvokeType,
}

/// Which pointer pool a patch came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatchKind {
    /// Direct code pointer of the target method.
    Code,
    /// Method object pointer.
    Method,
}

/// One pending patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodePatch {
    pub kind: PatchKind,
    pub context: MethodContext,
    pub target_method_idx: u32,
    pub target_invoke_type: InvokeType,
    /// Byte offset of the placeholder within the method's code.
    pub literal_offset: u32,
}

/// Receiver for patch records. Implementations are shared across worker
/// threads and must synchronize internally.
pub trait CodePatchSink: Send + Sync {
    fn add_patch(&self, patch: CodePatch);
}

/// Sink that records every patch in memory.
#[derive(Debug, Default)]
pub struct PatchRecorder {
    patches: Mutex<Vec<CodePatch>>,
}

impl PatchRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the recorded patches.
    pub fn patches(&self) -> Vec<CodePatch> {
        self.lock().clone()
    }

    /// Patches recorded for one method.
    pub fn patches_for(&self, method_idx: u32) -> Vec<CodePatch> {
        self.lock()
            .iter()
            .filter(|p| p.context.method_idx == method_idx)
            .copied()
            .collect()
    }

    /// Take the recorded patches, in arrival order.
    pub fn into_patches(self) -> Vec<CodePatch> {
        self.patches.into_inner().unwrap_or_else(|e| e.into_inner())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<CodePatch>> {
        // A worker that panicked mid-push leaves the vector intact.
        self.patches.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CodePatchSink for PatchRecorder {
    fn add_patch(&self, patch: CodePatch) {
        self.lock().push(patch);
    }
}

/// Sink for a single compilation job. Keeps its own copy of every patch
/// and forwards each one to the shared sink, so a job can report exactly
/// the patches it produced even when method indices collide.
pub struct MethodPatchSink<'a> {
    shared: &'a dyn CodePatchSink,
    local: PatchRecorder,
}

impl<'a> MethodPatchSink<'a> {
    pub fn new(shared: &'a dyn CodePatchSink) -> Self {
        Self {
            shared,
            local: PatchRecorder::new(),
        }
    }

    pub fn into_patches(self) -> Vec<CodePatch> {
        self.local.into_patches()
    }
}

impl CodePatchSink for MethodPatchSink<'_> {
    fn add_patch(&self, patch: CodePatch) {
        self.local.add_patch(patch);
        self.shared.add_patch(patch);
    }
}
