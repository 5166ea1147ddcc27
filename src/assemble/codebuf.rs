//! Output buffer for the final code image.
//!
//! The encoder's bytes go in first; the installers then append pools and
//! tables at the offsets the layout pass assigned.

/// A growable little-endian byte sink.
#[derive(Debug, Clone, Default)]
pub struct CodeBuffer {
    code: Vec<u8>,
}

impl CodeBuffer {
    /// Create a new empty code buffer.
    pub fn new() -> Self {
        Self { code: Vec::new() }
    }

    /// Start from already-encoded instruction bytes.
    pub fn from_code(code: Vec<u8>) -> Self {
        Self { code }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Current write offset.
    pub fn offset(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    /// Emit a 16-bit value (little-endian).
    pub fn emit_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 32-bit word (little-endian).
    pub fn emit_word(&mut self, value: i32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a pointer-sized value (little-endian).
    pub fn emit_pointer(&mut self, value: u64, pointer_size: u32) {
        let bytes = value.to_le_bytes();
        self.code.extend_from_slice(&bytes[..pointer_size as usize]);
    }

    /// Zero-pad up to `offset`. Does nothing if already past it.
    pub fn pad_to(&mut self, offset: u32) {
        if (offset as usize) > self.code.len() {
            self.code.resize(offset as usize, 0);
        }
    }

    /// Align the buffer to the given power-of-two boundary.
    pub fn align(&mut self, alignment: u32) {
        let aligned = align_up(self.offset(), alignment);
        self.pad_to(aligned);
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn into_code(self) -> Vec<u8> {
        self.code
    }
}

/// Round `offset` up to a power-of-two `alignment`.
pub fn align_up(offset: u32, alignment: u32) -> u32 {
    debug_assert!(alignment.is_power_of_two());
    (offset + (alignment - 1)) & !(alignment - 1)
}
