//! Shared helpers for machine-level tests.

use crate::isa::OpCode;
use crate::machine::MachineState;
use crate::program::ProgramImage;

/// Creation height used by test machines.
pub(crate) const CREATION_BLOCK_HEIGHT: u32 = 8;

/// 32 bytes of recognizable register payload.
pub(crate) const TEST_BYTES: &[u8; 32] = b"This string is exactly 32 bytes!";

/// Byte-level code builder for hand-assembled test programs.
pub(crate) struct CodeBuf {
    bytes: Vec<u8>,
}

impl CodeBuf {
    pub fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    pub fn op(mut self, op: OpCode) -> Self {
        self.bytes.push(op as u8);
        self
    }

    /// Appends a raw byte, e.g. an intentionally invalid opcode.
    pub fn raw(mut self, byte: u8) -> Self {
        self.bytes.push(byte);
        self
    }

    /// Appends a data-cell index operand.
    pub fn cell(mut self, index: i32) -> Self {
        self.bytes.extend_from_slice(&index.to_be_bytes());
        self
    }

    /// Appends a 64-bit immediate operand.
    pub fn long(mut self, value: i64) -> Self {
        self.bytes.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Appends a function-code operand.
    pub fn func(mut self, raw: u16) -> Self {
        self.bytes.extend_from_slice(&raw.to_be_bytes());
        self
    }

    /// Appends a branch-displacement operand.
    pub fn offset(mut self, offset: i8) -> Self {
        self.bytes.push(offset as u8);
        self
    }

    /// Appends a code-address operand.
    pub fn code_addr(mut self, address: u32) -> Self {
        self.bytes.extend_from_slice(&address.to_be_bytes());
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.bytes
    }
}

/// Builds a machine around `code` with the given initial data cells and
/// comfortable stack sizes.
pub(crate) fn machine(code: Vec<u8>, data_cells: &[i64]) -> MachineState {
    let mut data = Vec::with_capacity(data_cells.len() * 8);
    for cell in data_cells {
        data.extend_from_slice(&cell.to_be_bytes());
    }
    ProgramImage::new(code, data, 32, 64)
        .expect("image construction failed")
        .instantiate(CREATION_BLOCK_HEIGHT)
}

/// Builds a machine whose data segment holds `cells` zeroed cells.
pub(crate) fn machine_with_zeroed_data(code: Vec<u8>, cells: usize) -> MachineState {
    machine(code, &vec![0i64; cells])
}
