//! Program image representation and serialization.
//!
//! A [`ProgramImage`] bundles everything fixed at machine creation: the code
//! segment and the initial contents and sizes of the data and stack
//! segments. Images serialize to `magic || version || sizes || segments`,
//! all integers big-endian, and are stored once; per-round state travels as
//! snapshots instead.

use crate::codec::VALUE_SIZE;
use crate::machine::MachineState;
use thiserror::Error;

/// Magic bytes identifying a serialized program image.
const MAGIC: &[u8; 4] = b"ATBC";

/// Current image format version.
pub const CURRENT_VERSION: u16 = 3;

/// Errors raised while building or decoding a program image.
#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("program image truncated")]
    Truncated,
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("trailing bytes after program image")]
    TrailingBytes,
    #[error("{segment} segment size {size} is not a multiple of {}", VALUE_SIZE)]
    MisalignedSegment { segment: &'static str, size: u32 },
}

/// Immutable creation-time description of one machine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProgramImage {
    pub version: u16,
    /// Executable bytes; padded to a whole number of cells.
    pub code: Vec<u8>,
    /// Initial data segment; padded to a whole number of cells.
    pub data: Vec<u8>,
    /// Initial call-stack bytes.
    pub call_stack: Vec<u8>,
    /// Initial user-stack bytes.
    pub user_stack: Vec<u8>,
}

fn take<'a>(bytes: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8], ProgramError> {
    let end = pos
        .checked_add(len)
        .filter(|&end| end <= bytes.len())
        .ok_or(ProgramError::Truncated)?;
    let out = &bytes[*pos..end];
    *pos = end;
    Ok(out)
}

fn pad_to_cell(mut bytes: Vec<u8>) -> Vec<u8> {
    let rem = bytes.len() % VALUE_SIZE;
    if rem != 0 {
        bytes.resize(bytes.len() + VALUE_SIZE - rem, 0);
    }
    bytes
}

impl ProgramImage {
    /// Builds an image from code and initial data, padding both to whole
    /// cells, with empty stacks of the given sizes.
    pub fn new(
        code: Vec<u8>,
        data: Vec<u8>,
        call_stack_size: u32,
        user_stack_size: u32,
    ) -> Result<Self, ProgramError> {
        for (size, segment) in [
            (call_stack_size, "call stack"),
            (user_stack_size, "user stack"),
        ] {
            if size as usize % VALUE_SIZE != 0 {
                return Err(ProgramError::MisalignedSegment { segment, size });
            }
        }

        Ok(Self {
            version: CURRENT_VERSION,
            code: pad_to_cell(code),
            data: pad_to_cell(data),
            call_stack: vec![0; call_stack_size as usize],
            user_stack: vec![0; user_stack_size as usize],
        })
    }

    /// Serializes the image to its portable binary format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            MAGIC.len()
                + 2
                + 4 * 4
                + self.code.len()
                + self.data.len()
                + self.call_stack.len()
                + self.user_stack.len(),
        );
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&self.version.to_be_bytes());
        for segment in [&self.code, &self.data, &self.call_stack, &self.user_stack] {
            out.extend_from_slice(&(segment.len() as u32).to_be_bytes());
        }
        for segment in [&self.code, &self.data, &self.call_stack, &self.user_stack] {
            out.extend_from_slice(segment);
        }
        out
    }

    /// Deserializes an image, validating magic, version, segment alignment,
    /// and exact length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProgramError> {
        let mut pos = 0usize;

        if take(bytes, &mut pos, MAGIC.len())? != MAGIC {
            return Err(ProgramError::BadMagic);
        }

        let version = u16::from_be_bytes(take(bytes, &mut pos, 2)?.try_into().unwrap());
        if version != CURRENT_VERSION {
            return Err(ProgramError::UnsupportedVersion(version));
        }

        let mut sizes = [0u32; 4];
        for size in sizes.iter_mut() {
            *size = u32::from_be_bytes(take(bytes, &mut pos, 4)?.try_into().unwrap());
        }
        for (size, segment) in sizes
            .iter()
            .zip(["code", "data", "call stack", "user stack"])
        {
            if *size as usize % VALUE_SIZE != 0 {
                return Err(ProgramError::MisalignedSegment {
                    segment,
                    size: *size,
                });
            }
        }

        let code = take(bytes, &mut pos, sizes[0] as usize)?.to_vec();
        let data = take(bytes, &mut pos, sizes[1] as usize)?.to_vec();
        let call_stack = take(bytes, &mut pos, sizes[2] as usize)?.to_vec();
        let user_stack = take(bytes, &mut pos, sizes[3] as usize)?.to_vec();

        if pos != bytes.len() {
            return Err(ProgramError::TrailingBytes);
        }

        Ok(Self {
            version,
            code,
            data,
            call_stack,
            user_stack,
        })
    }

    /// Instantiates a fresh machine from this image.
    ///
    /// Stacks start empty regardless of any seed bytes carried by the
    /// image's stack sections; flags are cleared and registers zeroed.
    pub fn instantiate(&self, creation_block_height: u32) -> MachineState {
        MachineState::from_segments(
            self.code.clone(),
            self.data.clone(),
            self.call_stack.len() as u32,
            self.user_stack.len() as u32,
            creation_block_height,
        )
    }
}
