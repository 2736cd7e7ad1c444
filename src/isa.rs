//! Instruction Set Architecture (ISA) definitions.
//!
//! The [`for_each_opcode!`](crate::for_each_opcode) macro holds the canonical
//! opcode definitions and invokes a callback macro for code generation. This
//! enables multiple modules to generate opcode-related code without
//! duplicating definitions.
//!
//! This module generates:
//! - The [`OpCode`] enum with byte mappings
//! - `TryFrom<u8>` for decoding opcode bytes
//! - Mnemonic, parameter-schema, and base-step-cost lookups
//!
//! See [`machine`](crate::machine) for the dispatch loop and
//! [`assembler`](crate::assembler) for text encoding/decoding.
//!
//! # Bytecode Format
//!
//! Instructions use variable-length encoding, big-endian throughout:
//! - Opcode: 1 byte
//! - Immediate value: 8 bytes
//! - Data address (cell index) / code address: 4 bytes
//! - Branch displacement: 1 signed byte, relative to the opcode byte
//! - Function code: 2 bytes
//!
//! In opcode documentation, `@addr` means "store at addr", `$addr` means
//! "fetch from addr", and `@($addr)` / `$($addr)` mean one level of cell
//! indirection.

use crate::errors::ExecutionError;

/// Parameter kinds an opcode may declare, in code-stream order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParamKind {
    /// Literal 64-bit value.
    Value,
    /// Data cell written by the opcode.
    DestAddr,
    /// Data cell read by the opcode.
    SrcAddr,
    /// Data cell holding the index of the cell to write.
    IndirectDestAddr,
    /// As [`ParamKind::IndirectDestAddr`], offset by an index cell.
    IndirectDestAddrWithIndex,
    /// Data cell holding the index of the cell to read.
    IndirectSrcAddr,
    /// As [`ParamKind::IndirectSrcAddr`], offset by an index cell.
    IndirectSrcAddrWithIndex,
    /// Data cell holding the index offset for indirect-with-index forms.
    Index,
    /// Literal byte offset into the code segment.
    CodeAddr,
    /// Signed byte displacement relative to the opcode byte.
    Offset,
    /// 16-bit function code.
    Func,
    /// Data cell holding a block height.
    BlockHeight,
}

impl ParamKind {
    /// Encoded width of this parameter, in bytes.
    pub const fn width(self) -> usize {
        match self {
            ParamKind::Value => 8,
            ParamKind::Offset => 1,
            ParamKind::Func => 2,
            _ => 4,
        }
    }
}

/// Base step cost for ordinary opcodes.
pub const BASE_STEPS: u32 = 1;
/// Base step cost for the external-function opcode family.
pub const FUNCTION_CALL_STEPS: u32 = 10;

/// Invokes a callback macro with the complete opcode definition list.
///
/// Each entry is `Name = byte, "MNEMONIC" => [param: Kind, ...], steps`.
#[macro_export]
macro_rules! for_each_opcode {
    ($callback:ident) => {
        $callback! {
            /// NOP ; does nothing
            Nop = 0x7f, "NOP" => [], 1,
            /// SET_VAL @addr value ; @addr = value
            SetVal = 0x01, "SET_VAL" => [dst: DestAddr, value: Value], 1,
            /// SET_DAT @addr1 $addr2 ; @addr1 = $addr2
            SetDat = 0x02, "SET_DAT" => [dst: DestAddr, src: SrcAddr], 1,
            /// CLR_DAT @addr ; @addr = 0
            ClrDat = 0x03, "CLR_DAT" => [dst: DestAddr], 1,
            /// INC_DAT @addr ; @addr += 1, wrapping
            IncDat = 0x04, "INC_DAT" => [dst: DestAddr], 1,
            /// DEC_DAT @addr ; @addr -= 1, wrapping
            DecDat = 0x05, "DEC_DAT" => [dst: DestAddr], 1,
            /// ADD_DAT @addr1 $addr2 ; @addr1 += $addr2, wrapping
            AddDat = 0x06, "ADD_DAT" => [dst: DestAddr, src: SrcAddr], 1,
            /// SUB_DAT @addr1 $addr2 ; @addr1 -= $addr2, wrapping
            SubDat = 0x07, "SUB_DAT" => [dst: DestAddr, src: SrcAddr], 1,
            /// MUL_DAT @addr1 $addr2 ; @addr1 *= $addr2, wrapping
            MulDat = 0x08, "MUL_DAT" => [dst: DestAddr, src: SrcAddr], 1,
            /// DIV_DAT @addr1 $addr2 ; @addr1 /= $addr2 (faults on zero divisor)
            DivDat = 0x09, "DIV_DAT" => [dst: DestAddr, src: SrcAddr], 1,
            /// BOR_DAT @addr1 $addr2 ; @addr1 |= $addr2
            BorDat = 0x0a, "BOR_DAT" => [dst: DestAddr, src: SrcAddr], 1,
            /// AND_DAT @addr1 $addr2 ; @addr1 &= $addr2
            AndDat = 0x0b, "AND_DAT" => [dst: DestAddr, src: SrcAddr], 1,
            /// XOR_DAT @addr1 $addr2 ; @addr1 ^= $addr2
            XorDat = 0x0c, "XOR_DAT" => [dst: DestAddr, src: SrcAddr], 1,
            /// NOT_DAT @addr ; @addr = ~$addr
            NotDat = 0x0d, "NOT_DAT" => [dst: DestAddr], 1,
            /// SET_IND @addr1 $addr2 ; @addr1 = $($addr2)
            SetInd = 0x0e, "SET_IND" => [dst: DestAddr, src: IndirectSrcAddr], 1,
            /// SET_IDX @addr1 $addr2 $addr3 ; @addr1 = $($addr2 + $addr3)
            SetIdx = 0x0f, "SET_IDX" => [dst: DestAddr, src: IndirectSrcAddrWithIndex, index: Index], 1,
            /// PSH_DAT $addr ; push $addr onto the user stack
            PshDat = 0x10, "PSH_DAT" => [src: SrcAddr], 1,
            /// POP_DAT @addr ; pop the user stack into @addr
            PopDat = 0x11, "POP_DAT" => [dst: DestAddr], 1,
            /// JMP_SUB addr ; push the return PC onto the call stack, PC = addr
            JmpSub = 0x12, "JMP_SUB" => [target: CodeAddr], 1,
            /// RET_SUB ; pop the call stack into PC
            RetSub = 0x13, "RET_SUB" => [], 1,
            /// IND_DAT @addr1 $addr2 ; @($addr1) = $addr2
            IndDat = 0x14, "IND_DAT" => [dst: IndirectDestAddr, src: SrcAddr], 1,
            /// IDX_DAT @addr1 $addr2 $addr3 ; @($addr1 + $addr2) = $addr3
            IdxDat = 0x15, "IDX_DAT" => [dst: IndirectDestAddrWithIndex, index: Index, src: SrcAddr], 1,
            /// MOD_DAT @addr1 $addr2 ; @addr1 %= $addr2 (faults on zero divisor)
            ModDat = 0x16, "MOD_DAT" => [dst: DestAddr, src: SrcAddr], 1,
            /// SHL_DAT @addr1 $addr2 ; @addr1 <<= $addr2 (zero once shifted past 64)
            ShlDat = 0x17, "SHL_DAT" => [dst: DestAddr, src: SrcAddr], 1,
            /// SHR_DAT @addr1 $addr2 ; @addr1 >>= $addr2, logical (zero once shifted past 64)
            ShrDat = 0x18, "SHR_DAT" => [dst: DestAddr, src: SrcAddr], 1,
            /// JMP_ADR addr ; PC = addr
            JmpAdr = 0x1a, "JMP_ADR" => [target: CodeAddr], 1,
            /// BZR_DAT $addr offset ; if $addr == 0, PC += offset
            BzrDat = 0x1b, "BZR_DAT" => [src: SrcAddr, offset: Offset], 1,
            /// BNZ_DAT $addr offset ; if $addr != 0, PC += offset
            BnzDat = 0x1e, "BNZ_DAT" => [src: SrcAddr, offset: Offset], 1,
            /// BGT_DAT $addr1 $addr2 offset ; if $addr1 > $addr2, PC += offset
            BgtDat = 0x1f, "BGT_DAT" => [a: SrcAddr, b: SrcAddr, offset: Offset], 1,
            /// BLT_DAT $addr1 $addr2 offset ; if $addr1 < $addr2, PC += offset
            BltDat = 0x20, "BLT_DAT" => [a: SrcAddr, b: SrcAddr, offset: Offset], 1,
            /// BGE_DAT $addr1 $addr2 offset ; if $addr1 >= $addr2, PC += offset
            BgeDat = 0x21, "BGE_DAT" => [a: SrcAddr, b: SrcAddr, offset: Offset], 1,
            /// BLE_DAT $addr1 $addr2 offset ; if $addr1 <= $addr2, PC += offset
            BleDat = 0x22, "BLE_DAT" => [a: SrcAddr, b: SrcAddr, offset: Offset], 1,
            /// BEQ_DAT $addr1 $addr2 offset ; if $addr1 == $addr2, PC += offset
            BeqDat = 0x23, "BEQ_DAT" => [a: SrcAddr, b: SrcAddr, offset: Offset], 1,
            /// BNE_DAT $addr1 $addr2 offset ; if $addr1 != $addr2, PC += offset
            BneDat = 0x24, "BNE_DAT" => [a: SrcAddr, b: SrcAddr, offset: Offset], 1,
            /// SLP_DAT $addr ; sleep until block height $addr
            SlpDat = 0x25, "SLP_DAT" => [height: BlockHeight], 1,
            /// FIZ_DAT $addr ; if $addr == 0, finish permanently
            FizDat = 0x26, "FIZ_DAT" => [src: SrcAddr], 1,
            /// STZ_DAT $addr ; if $addr == 0, PC = on-stop address and stop
            StzDat = 0x27, "STZ_DAT" => [src: SrcAddr], 1,
            /// FIN_IMD ; finish permanently
            FinImd = 0x28, "FIN_IMD" => [], 1,
            /// STP_IMD ; PC = on-stop address and stop
            StpImd = 0x29, "STP_IMD" => [], 1,
            /// SLP_IMD ; sleep until the next block
            SlpImd = 0x2a, "SLP_IMD" => [], 1,
            /// ERR_ADR addr ; on-error address = addr
            ErrAdr = 0x2b, "ERR_ADR" => [target: CodeAddr], 1,
            /// SLP_VAL value ; sleep for value blocks
            SlpVal = 0x2c, "SLP_VAL" => [value: Value], 1,
            /// SET_PCS ; on-stop address = PC after this opcode
            SetPcs = 0x30, "SET_PCS" => [], 1,
            /// EXT_FUN func ; func()
            ExtFun = 0x32, "EXT_FUN" => [func: Func], 10,
            /// EXT_FUN_DAT func $addr ; func($addr)
            ExtFunDat = 0x33, "EXT_FUN_DAT" => [func: Func, src: SrcAddr], 10,
            /// EXT_FUN_DAT_2 func $addr1 $addr2 ; func($addr1, $addr2)
            ExtFunDat2 = 0x34, "EXT_FUN_DAT_2" => [func: Func, src1: SrcAddr, src2: SrcAddr], 10,
            /// EXT_FUN_RET func @addr ; @addr = func()
            ExtFunRet = 0x35, "EXT_FUN_RET" => [func: Func, dst: DestAddr], 10,
            /// EXT_FUN_RET_DAT func @addr1 $addr2 ; @addr1 = func($addr2)
            ExtFunRetDat = 0x36, "EXT_FUN_RET_DAT" => [func: Func, dst: DestAddr, src: SrcAddr], 10,
            /// EXT_FUN_RET_DAT_2 func @addr1 $addr2 $addr3 ; @addr1 = func($addr2, $addr3)
            ExtFunRetDat2 = 0x37, "EXT_FUN_RET_DAT_2" => [func: Func, dst: DestAddr, src1: SrcAddr, src2: SrcAddr], 10,
            /// EXT_FUN_VAL func value ; func(value)
            ExtFunVal = 0x38, "EXT_FUN_VAL" => [func: Func, value: Value], 10,
            /// ADD_VAL @addr value ; @addr += value, wrapping
            AddVal = 0x46, "ADD_VAL" => [dst: DestAddr, value: Value], 1,
            /// SUB_VAL @addr value ; @addr -= value, wrapping
            SubVal = 0x47, "SUB_VAL" => [dst: DestAddr, value: Value], 1,
            /// MUL_VAL @addr value ; @addr *= value, wrapping
            MulVal = 0x48, "MUL_VAL" => [dst: DestAddr, value: Value], 1,
            /// DIV_VAL @addr value ; @addr /= value (faults on zero divisor)
            DivVal = 0x49, "DIV_VAL" => [dst: DestAddr, value: Value], 1,
            /// SHL_VAL @addr value ; @addr <<= value (zero once shifted past 64)
            ShlVal = 0x4a, "SHL_VAL" => [dst: DestAddr, value: Value], 1,
            /// SHR_VAL @addr value ; @addr >>= value, logical (zero once shifted past 64)
            ShrVal = 0x4b, "SHR_VAL" => [dst: DestAddr, value: Value], 1,
        }
    };
}

#[macro_export]
macro_rules! define_opcodes {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $opcode:literal, $mnemonic:literal => [
                $( $field:ident : $kind:ident ),* $(,)?
            ], $steps:expr
        ),* $(,)?
    ) => {
        /// Machine opcodes, one per bytecode tag.
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
        pub enum OpCode {
            $(
                $(#[$doc])*
                $name = $opcode,
            )*
        }

        impl TryFrom<u8> for OpCode {
            type Error = ExecutionError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $( $opcode => Ok(OpCode::$name), )*
                    _ => Err(ExecutionError::InvalidOpCode {
                        opcode: value,
                        offset: 0,
                    }),
                }
            }
        }

        impl OpCode {
            /// Every opcode, in definition order.
            pub const ALL: &'static [OpCode] = &[ $( OpCode::$name, )* ];

            /// Returns the assembly mnemonic for this opcode.
            pub const fn mnemonic(&self) -> &'static str {
                match self {
                    $( OpCode::$name => $mnemonic, )*
                }
            }

            /// Returns the opcode for an assembly mnemonic, if any.
            pub fn from_mnemonic(mnemonic: &str) -> Option<OpCode> {
                match mnemonic {
                    $( $mnemonic => Some(OpCode::$name), )*
                    _ => None,
                }
            }

            /// Returns the parameter schema, in code-stream order.
            pub const fn params(&self) -> &'static [ParamKind] {
                match self {
                    $( OpCode::$name => &[ $( ParamKind::$kind, )* ], )*
                }
            }

            /// Returns the default step cost charged per dispatch.
            pub const fn base_steps(&self) -> u32 {
                match self {
                    $( OpCode::$name => $steps, )*
                }
            }
        }
    };
}

for_each_opcode!(define_opcodes);

impl OpCode {
    /// Total encoded width of this instruction, opcode byte included.
    pub fn encoded_len(&self) -> usize {
        1 + self.params().iter().map(|kind| kind.width()).sum::<usize>()
    }

    /// Whether this opcode belongs to the external-function family.
    pub fn is_function_call(&self) -> bool {
        (*self as u8) >= OpCode::ExtFun as u8 && (*self as u8) <= OpCode::ExtFunVal as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_try_from_invalid() {
        assert!(matches!(
            OpCode::try_from(0x00),
            Err(ExecutionError::InvalidOpCode { opcode: 0x00, .. })
        ));
        assert!(matches!(
            OpCode::try_from(0xff),
            Err(ExecutionError::InvalidOpCode { opcode: 0xff, .. })
        ));
    }

    #[test]
    fn opcode_round_trips_through_byte() {
        for &op in OpCode::ALL {
            assert_eq!(OpCode::try_from(op as u8).unwrap(), op);
        }
    }

    #[test]
    fn mnemonic_round_trips() {
        for &op in OpCode::ALL {
            assert_eq!(OpCode::from_mnemonic(op.mnemonic()), Some(op));
        }
    }

    #[test]
    fn encoded_len_sums_parameter_widths() {
        assert_eq!(OpCode::Nop.encoded_len(), 1);
        assert_eq!(OpCode::SetVal.encoded_len(), 1 + 4 + 8);
        assert_eq!(OpCode::BgtDat.encoded_len(), 1 + 4 + 4 + 1);
        assert_eq!(OpCode::ExtFunRetDat2.encoded_len(), 1 + 2 + 4 + 4 + 4);
    }

    #[test]
    fn function_family_has_higher_base_cost() {
        for &op in OpCode::ALL {
            if op.is_function_call() {
                assert_eq!(op.base_steps(), FUNCTION_CALL_STEPS, "{}", op.mnemonic());
            } else {
                assert_eq!(op.base_steps(), BASE_STEPS, "{}", op.mnemonic());
            }
        }
    }
}
