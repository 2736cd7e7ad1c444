//! Canonical machine-state snapshots.
//!
//! Between rounds the host persists each machine as a snapshot. The byte
//! layout is normative: two implementations fed the same code image and the
//! same host responses must produce byte-identical snapshots after the same
//! number of rounds.
//!
//! All integers are big-endian. The layout is a fixed header followed by
//! the mutable segments:
//!
//! 1. Segment sizes: code, data, call stack, user stack (4 × u32)
//! 2. Program counter, user-stack pointer, call-stack pointer (3 × u32)
//! 3. Flags bitfield (u32), including presence bits for the optional
//!    checkpoints
//! 4. Checkpoints: on-stop address, on-error address, sleep-until height
//!    (3 × u32, zero when the presence bit is clear)
//! 5. Counters: steps, current block height, creation block height (3 ×
//!    u32), previous balance, current balance, freeze threshold (3 × i64)
//! 6. A and B registers (8 × i64)
//! 7. Data segment, user-stack, and call-stack bytes
//!
//! The code segment is immutable and carried by the program image, not the
//! snapshot.

use crate::codec::{ADDRESS_SIZE, VALUE_SIZE};
use crate::machine::MachineState;
use thiserror::Error;

const FLAG_RUNNING: u32 = 1 << 0;
const FLAG_SLEEPING: u32 = 1 << 1;
const FLAG_STOPPED: u32 = 1 << 2;
const FLAG_FINISHED: u32 = 1 << 3;
const FLAG_FROZEN: u32 = 1 << 4;
const FLAG_HAD_FATAL_ERROR: u32 = 1 << 5;
const FLAG_FIRST_OPCODE_AFTER_SLEEPING: u32 = 1 << 6;
const FLAG_HAS_SLEEP_UNTIL: u32 = 1 << 7;
const FLAG_HAS_ON_ERROR: u32 = 1 << 8;

const KNOWN_FLAGS: u32 = FLAG_RUNNING
    | FLAG_SLEEPING
    | FLAG_STOPPED
    | FLAG_FINISHED
    | FLAG_FROZEN
    | FLAG_HAD_FATAL_ERROR
    | FLAG_FIRST_OPCODE_AFTER_SLEEPING
    | FLAG_HAS_SLEEP_UNTIL
    | FLAG_HAS_ON_ERROR;

/// Fixed header length, in bytes.
const HEADER_LEN: usize = 4 * 14 + 8 * 3 + 8 * 8;

/// Errors raised while decoding a snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot truncated")]
    Truncated,
    #[error("trailing bytes after snapshot")]
    TrailingBytes,
    #[error("code segment length {actual} does not match recorded size {recorded}")]
    CodeMismatch { recorded: u32, actual: u32 },
    #[error("unknown flag bits {bits:#x}")]
    UnknownFlags { bits: u32 },
    #[error("snapshot field out of range: {field}")]
    FieldRange { field: &'static str },
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], SnapshotError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or(SnapshotError::Truncated)?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, SnapshotError> {
        Ok(u32::from_be_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64, SnapshotError> {
        Ok(i64::from_be_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    fn finish(&self) -> Result<(), SnapshotError> {
        if self.pos != self.buf.len() {
            return Err(SnapshotError::TrailingBytes);
        }
        Ok(())
    }
}

impl MachineState {
    /// Serializes the machine into its canonical snapshot bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            HEADER_LEN + self.data.len() + self.user_stack.len() + self.call_stack.len(),
        );

        for size in [
            self.code.len() as u32,
            self.data.len() as u32,
            self.call_stack.len() as u32,
            self.user_stack.len() as u32,
            self.pc,
            self.user_stack_ptr,
            self.call_stack_ptr,
        ] {
            out.extend_from_slice(&size.to_be_bytes());
        }

        out.extend_from_slice(&self.flag_bits().to_be_bytes());

        for checkpoint in [
            self.on_stop_address,
            self.on_error_address.unwrap_or(0),
            self.sleep_until_height.unwrap_or(0),
            self.steps,
            self.current_block_height,
            self.creation_block_height,
        ] {
            out.extend_from_slice(&checkpoint.to_be_bytes());
        }

        for counter in [
            self.previous_balance,
            self.current_balance,
            self.frozen_balance,
        ] {
            out.extend_from_slice(&counter.to_be_bytes());
        }

        for limb in self.a.iter().chain(self.b.iter()) {
            out.extend_from_slice(&limb.to_be_bytes());
        }

        out.extend_from_slice(&self.data);
        out.extend_from_slice(&self.user_stack);
        out.extend_from_slice(&self.call_stack);

        out
    }

    /// Rebuilds a machine from its snapshot and the immutable code segment.
    pub fn deserialize(code: Vec<u8>, bytes: &[u8]) -> Result<MachineState, SnapshotError> {
        let mut r = Reader::new(bytes);

        let code_size = r.u32()?;
        if code_size as usize != code.len() {
            return Err(SnapshotError::CodeMismatch {
                recorded: code_size,
                actual: code.len() as u32,
            });
        }
        let data_size = r.u32()? as usize;
        let call_stack_size = r.u32()? as usize;
        let user_stack_size = r.u32()? as usize;
        for (size, field) in [
            (data_size, "data size"),
            (call_stack_size, "call stack size"),
            (user_stack_size, "user stack size"),
        ] {
            if size % VALUE_SIZE != 0 {
                return Err(SnapshotError::FieldRange { field });
            }
        }

        let pc = r.u32()?;
        let user_stack_ptr = r.u32()?;
        let call_stack_ptr = r.u32()?;
        if user_stack_ptr as usize > user_stack_size || user_stack_ptr as usize % VALUE_SIZE != 0 {
            return Err(SnapshotError::FieldRange {
                field: "user stack pointer",
            });
        }
        if call_stack_ptr as usize > call_stack_size || call_stack_ptr as usize % ADDRESS_SIZE != 0
        {
            return Err(SnapshotError::FieldRange {
                field: "call stack pointer",
            });
        }

        let flags = r.u32()?;
        if flags & !KNOWN_FLAGS != 0 {
            return Err(SnapshotError::UnknownFlags {
                bits: flags & !KNOWN_FLAGS,
            });
        }

        let on_stop_address = r.u32()?;
        let on_error = r.u32()?;
        let sleep_until = r.u32()?;
        let steps = r.u32()?;
        let current_block_height = r.u32()?;
        let creation_block_height = r.u32()?;
        let previous_balance = r.i64()?;
        let current_balance = r.i64()?;
        let frozen_balance = r.i64()?;

        let mut a = [0i64; 4];
        let mut b = [0i64; 4];
        for limb in a.iter_mut().chain(b.iter_mut()) {
            *limb = r.i64()?;
        }

        let data = r.bytes(data_size)?.to_vec();
        let user_stack = r.bytes(user_stack_size)?.to_vec();
        let call_stack = r.bytes(call_stack_size)?.to_vec();
        r.finish()?;

        Ok(MachineState {
            code,
            data,
            call_stack,
            user_stack,
            pc,
            call_stack_ptr,
            user_stack_ptr,
            running: flags & FLAG_RUNNING != 0,
            sleeping: flags & FLAG_SLEEPING != 0,
            stopped: flags & FLAG_STOPPED != 0,
            finished: flags & FLAG_FINISHED != 0,
            frozen: flags & FLAG_FROZEN != 0,
            had_fatal_error: flags & FLAG_HAD_FATAL_ERROR != 0,
            first_opcode_after_sleeping: flags & FLAG_FIRST_OPCODE_AFTER_SLEEPING != 0,
            on_stop_address,
            on_error_address: (flags & FLAG_HAS_ON_ERROR != 0).then_some(on_error),
            sleep_until_height: (flags & FLAG_HAS_SLEEP_UNTIL != 0).then_some(sleep_until),
            steps,
            current_block_height,
            creation_block_height,
            previous_balance,
            current_balance,
            frozen_balance,
            a,
            b,
        })
    }

    fn flag_bits(&self) -> u32 {
        let mut flags = 0;
        for (set, bit) in [
            (self.running, FLAG_RUNNING),
            (self.sleeping, FLAG_SLEEPING),
            (self.stopped, FLAG_STOPPED),
            (self.finished, FLAG_FINISHED),
            (self.frozen, FLAG_FROZEN),
            (self.had_fatal_error, FLAG_HAD_FATAL_ERROR),
            (
                self.first_opcode_after_sleeping,
                FLAG_FIRST_OPCODE_AFTER_SLEEPING,
            ),
            (self.sleep_until_height.is_some(), FLAG_HAS_SLEEP_UNTIL),
            (self.on_error_address.is_some(), FLAG_HAS_ON_ERROR),
        ] {
            if set {
                flags |= bit;
            }
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::run_round;
    use crate::isa::OpCode;
    use crate::test_api::TestApi;
    use crate::test_utils::{machine, machine_with_zeroed_data, CodeBuf};

    fn mid_flight_machine() -> (MachineState, TestApi) {
        // Touches every serialized facet: data, both stacks, registers,
        // checkpoints, then parks the machine asleep.
        let code = CodeBuf::new()
            .op(OpCode::ErrAdr)
            .code_addr(0)
            .op(OpCode::SetPcs)
            .op(OpCode::PshDat)
            .cell(0)
            .op(OpCode::ExtFunVal)
            .func(0x0100)
            .long(0x1234)
            .op(OpCode::ExtFunVal)
            .func(0x0106)
            .long(0x5678)
            .op(OpCode::JmpSub)
            .code_addr(38)
            .op(OpCode::SlpVal)
            .long(5)
            .op(OpCode::RetSub)
            .build();
        let mut state = machine(code, &[0x0abc, 0]);
        let mut api = TestApi::new();

        let receipt = run_round(&mut state, &mut api);
        assert!(!receipt.finished);
        assert!(state.is_sleeping());
        (state, api)
    }

    #[test]
    fn round_trip_preserves_every_observable_bit() {
        let (state, _api) = mid_flight_machine();

        let bytes = state.serialize();
        let restored = MachineState::deserialize(state.code().to_vec(), &bytes).unwrap();
        assert_eq!(restored, state);
        // Canonical form: re-serializing yields identical bytes.
        assert_eq!(restored.serialize(), bytes);
    }

    #[test]
    fn restored_machine_continues_identically() {
        let (mut original, mut api) = mid_flight_machine();

        let bytes = original.serialize();
        let mut restored = MachineState::deserialize(original.code().to_vec(), &bytes).unwrap();

        for _ in 0..6 {
            api.bump_current_block_height();
            run_round(&mut original, &mut api);
        }

        let mut api2 = TestApi::new();
        for _ in 0..6 {
            api2.bump_current_block_height();
            run_round(&mut restored, &mut api2);
        }

        assert_eq!(restored, original);
    }

    #[test]
    fn header_layout_is_stable() {
        let state = machine_with_zeroed_data(vec![OpCode::Nop as u8], 2);
        let bytes = state.serialize();

        // code size 8 (padded), data 16, call stack 32, user stack 64.
        assert_eq!(hex::encode(&bytes[..16]), "00000008000000100000002000000040");
        // PC 0, user stack pointer 64, call stack pointer 32, flags 0.
        assert_eq!(hex::encode(&bytes[16..32]), "00000000000000400000002000000000");
        assert_eq!(bytes.len(), HEADER_LEN + 16 + 64 + 32);
    }

    #[test]
    fn presence_bits_track_optional_checkpoints() {
        let mut state = machine_with_zeroed_data(vec![OpCode::Nop as u8], 2);
        assert_eq!(state.flag_bits() & FLAG_HAS_ON_ERROR, 0);
        assert_eq!(state.flag_bits() & FLAG_HAS_SLEEP_UNTIL, 0);

        state.set_on_error_address(Some(0));
        state.set_sleep_until_height(Some(0));
        assert_ne!(state.flag_bits() & FLAG_HAS_ON_ERROR, 0);
        assert_ne!(state.flag_bits() & FLAG_HAS_SLEEP_UNTIL, 0);

        // A zero-valued checkpoint survives the round trip as present.
        let restored =
            MachineState::deserialize(state.code().to_vec(), &state.serialize()).unwrap();
        assert_eq!(restored.on_error_address(), Some(0));
        assert_eq!(restored.sleep_until_height(), Some(0));
    }

    #[test]
    fn truncated_snapshot_rejected() {
        let state = machine_with_zeroed_data(vec![OpCode::Nop as u8], 2);
        let bytes = state.serialize();
        assert!(matches!(
            MachineState::deserialize(state.code().to_vec(), &bytes[..bytes.len() - 1]),
            Err(SnapshotError::Truncated)
        ));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let state = machine_with_zeroed_data(vec![OpCode::Nop as u8], 2);
        let mut bytes = state.serialize();
        bytes.push(0);
        assert!(matches!(
            MachineState::deserialize(state.code().to_vec(), &bytes),
            Err(SnapshotError::TrailingBytes)
        ));
    }

    #[test]
    fn code_length_mismatch_rejected() {
        let state = machine_with_zeroed_data(vec![OpCode::Nop as u8], 2);
        let bytes = state.serialize();
        assert!(matches!(
            MachineState::deserialize(vec![0; 16], &bytes),
            Err(SnapshotError::CodeMismatch { .. })
        ));
    }

    #[test]
    fn unknown_flag_bits_rejected() {
        let state = machine_with_zeroed_data(vec![OpCode::Nop as u8], 2);
        let mut bytes = state.serialize();
        // Flags live at offset 28; set a reserved bit.
        bytes[28] |= 0x80;
        assert!(matches!(
            MachineState::deserialize(state.code().to_vec(), &bytes),
            Err(SnapshotError::UnknownFlags { .. })
        ));
    }

    #[test]
    fn misaligned_stack_pointer_rejected() {
        let state = machine_with_zeroed_data(vec![OpCode::Nop as u8], 2);
        let mut bytes = state.serialize();
        // User stack pointer lives at offset 20.
        bytes[20..24].copy_from_slice(&3u32.to_be_bytes());
        assert!(matches!(
            MachineState::deserialize(state.code().to_vec(), &bytes),
            Err(SnapshotError::FieldRange { .. })
        ));
    }
}
