//! Primitive codecs for the machine's byte segments.
//!
//! Every multi-byte integer in a code or data segment is big-endian two's
//! complement: 64-bit immediates, 32-bit addresses, 16-bit function codes,
//! signed 8-bit branch displacements. Data addresses travel through the code
//! stream as cell indices and are converted to byte offsets here, with
//! bounds validation at fetch time.

use crate::errors::ExecutionError;

/// Width of one data cell, in bytes.
pub const VALUE_SIZE: usize = 8;
/// Width of one call-stack entry (a code address), in bytes.
pub const ADDRESS_SIZE: usize = 4;
/// Width of the A and B registers, in bytes (four data cells).
pub const AB_REGISTER_SIZE: usize = 32;

fn take<'a>(code: &'a [u8], cursor: &mut u32, wanted: usize) -> Result<&'a [u8], ExecutionError> {
    let start = *cursor as usize;
    let end = start.checked_add(wanted).filter(|&end| end <= code.len());

    match end {
        Some(end) => {
            *cursor = end as u32;
            Ok(&code[start..end])
        }
        None => Err(ExecutionError::CodeUnderflow {
            offset: *cursor,
            wanted,
            limit: code.len() as u32,
        }),
    }
}

/// Fetches a 64-bit immediate from the code stream.
pub fn fetch_long(code: &[u8], cursor: &mut u32) -> Result<i64, ExecutionError> {
    let bytes = take(code, cursor, 8)?;
    Ok(i64::from_be_bytes(bytes.try_into().unwrap()))
}

/// Fetches a raw 32-bit integer from the code stream.
pub fn fetch_int(code: &[u8], cursor: &mut u32) -> Result<i32, ExecutionError> {
    let bytes = take(code, cursor, 4)?;
    Ok(i32::from_be_bytes(bytes.try_into().unwrap()))
}

/// Fetches a signed branch displacement from the code stream.
pub fn fetch_offset(code: &[u8], cursor: &mut u32) -> Result<i8, ExecutionError> {
    let bytes = take(code, cursor, 1)?;
    Ok(bytes[0] as i8)
}

/// Fetches a 16-bit function code from the code stream.
pub fn fetch_func(code: &[u8], cursor: &mut u32) -> Result<u16, ExecutionError> {
    let bytes = take(code, cursor, 2)?;
    Ok(u16::from_be_bytes(bytes.try_into().unwrap()))
}

/// Fetches a data-cell index from the code stream and converts it to a
/// validated byte offset into the data segment.
pub fn fetch_data_address(
    code: &[u8],
    cursor: &mut u32,
    data_len: usize,
) -> Result<u32, ExecutionError> {
    let index = fetch_int(code, cursor)?;
    check_cell_index(index as i64, data_len)
}

/// Validates a cell index against the data segment, returning the byte
/// offset of the cell.
///
/// A cell is addressable iff its full [`VALUE_SIZE`] bytes lie inside the
/// segment.
pub fn check_cell_index(index: i64, data_len: usize) -> Result<u32, ExecutionError> {
    let offset = index.checked_mul(VALUE_SIZE as i64);
    match offset {
        Some(offset) if index >= 0 && offset as u64 + VALUE_SIZE as u64 <= data_len as u64 => {
            Ok(offset as u32)
        }
        _ => Err(ExecutionError::InvalidAddress {
            offset: offset.unwrap_or(i64::MAX),
            limit: data_len as u32,
        }),
    }
}

/// Fetches a code address from the code stream, validated against the code
/// segment.
///
/// An address equal to the segment length is accepted; decoding from it
/// underflows on the next fetch.
pub fn fetch_code_address(
    code: &[u8],
    cursor: &mut u32,
    code_len: usize,
) -> Result<u32, ExecutionError> {
    let address = fetch_int(code, cursor)?;
    if address < 0 || address as usize > code_len {
        return Err(ExecutionError::InvalidAddress {
            offset: address as i64,
            limit: code_len as u32,
        });
    }
    Ok(address as u32)
}

/// A block height and intra-block transaction sequence packed into 64 bits.
///
/// The high 32 bits carry the height, the low 32 bits the sequence. Ordering
/// on the packed value is chronological.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct Timestamp {
    pub block_height: u32,
    pub transaction_sequence: u32,
}

impl Timestamp {
    pub fn new(block_height: u32, transaction_sequence: u32) -> Self {
        Self {
            block_height,
            transaction_sequence,
        }
    }

    /// Unpacks a timestamp from its 64-bit wire form.
    pub fn from_long(value: i64) -> Self {
        Self {
            block_height: (value >> 32) as u32,
            transaction_sequence: value as u32,
        }
    }

    /// Packs this timestamp into its 64-bit wire form.
    pub fn to_long(self) -> i64 {
        ((self.block_height as i64) << 32) | self.transaction_sequence as i64
    }
}
