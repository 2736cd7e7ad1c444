//! Static checks for ISA stability.
//!
//! These tests pin the wire-visible facts of the machine: opcode bytes,
//! parameter schemas, encoded widths, function-code values, and declared
//! shapes. Consensus depends on them never changing; any edit to the
//! canonical tables will fail here first.

#[cfg(test)]
mod tests {
    use crate::functions::FunctionCode;
    use crate::isa::{OpCode, ParamKind};
    use std::collections::HashSet;

    #[test]
    fn opcode_bytes_unchanged() {
        // Moves, immediates, arithmetic
        assert_eq!(OpCode::Nop as u8, 0x7f);
        assert_eq!(OpCode::SetVal as u8, 0x01);
        assert_eq!(OpCode::SetDat as u8, 0x02);
        assert_eq!(OpCode::ClrDat as u8, 0x03);
        assert_eq!(OpCode::IncDat as u8, 0x04);
        assert_eq!(OpCode::DecDat as u8, 0x05);
        assert_eq!(OpCode::AddDat as u8, 0x06);
        assert_eq!(OpCode::SubDat as u8, 0x07);
        assert_eq!(OpCode::MulDat as u8, 0x08);
        assert_eq!(OpCode::DivDat as u8, 0x09);
        // Bitwise
        assert_eq!(OpCode::BorDat as u8, 0x0a);
        assert_eq!(OpCode::AndDat as u8, 0x0b);
        assert_eq!(OpCode::XorDat as u8, 0x0c);
        assert_eq!(OpCode::NotDat as u8, 0x0d);
        // Indirect
        assert_eq!(OpCode::SetInd as u8, 0x0e);
        assert_eq!(OpCode::SetIdx as u8, 0x0f);
        assert_eq!(OpCode::IndDat as u8, 0x14);
        assert_eq!(OpCode::IdxDat as u8, 0x15);
        // Stacks and subroutines
        assert_eq!(OpCode::PshDat as u8, 0x10);
        assert_eq!(OpCode::PopDat as u8, 0x11);
        assert_eq!(OpCode::JmpSub as u8, 0x12);
        assert_eq!(OpCode::RetSub as u8, 0x13);
        // Remaining arithmetic
        assert_eq!(OpCode::ModDat as u8, 0x16);
        assert_eq!(OpCode::ShlDat as u8, 0x17);
        assert_eq!(OpCode::ShrDat as u8, 0x18);
        // Jumps and branches
        assert_eq!(OpCode::JmpAdr as u8, 0x1a);
        assert_eq!(OpCode::BzrDat as u8, 0x1b);
        assert_eq!(OpCode::BnzDat as u8, 0x1e);
        assert_eq!(OpCode::BgtDat as u8, 0x1f);
        assert_eq!(OpCode::BltDat as u8, 0x20);
        assert_eq!(OpCode::BgeDat as u8, 0x21);
        assert_eq!(OpCode::BleDat as u8, 0x22);
        assert_eq!(OpCode::BeqDat as u8, 0x23);
        assert_eq!(OpCode::BneDat as u8, 0x24);
        // Lifecycle
        assert_eq!(OpCode::SlpDat as u8, 0x25);
        assert_eq!(OpCode::FizDat as u8, 0x26);
        assert_eq!(OpCode::StzDat as u8, 0x27);
        assert_eq!(OpCode::FinImd as u8, 0x28);
        assert_eq!(OpCode::StpImd as u8, 0x29);
        assert_eq!(OpCode::SlpImd as u8, 0x2a);
        assert_eq!(OpCode::ErrAdr as u8, 0x2b);
        assert_eq!(OpCode::SlpVal as u8, 0x2c);
        assert_eq!(OpCode::SetPcs as u8, 0x30);
        // External functions
        assert_eq!(OpCode::ExtFun as u8, 0x32);
        assert_eq!(OpCode::ExtFunDat as u8, 0x33);
        assert_eq!(OpCode::ExtFunDat2 as u8, 0x34);
        assert_eq!(OpCode::ExtFunRet as u8, 0x35);
        assert_eq!(OpCode::ExtFunRetDat as u8, 0x36);
        assert_eq!(OpCode::ExtFunRetDat2 as u8, 0x37);
        assert_eq!(OpCode::ExtFunVal as u8, 0x38);
        // Immediate arithmetic
        assert_eq!(OpCode::AddVal as u8, 0x46);
        assert_eq!(OpCode::SubVal as u8, 0x47);
        assert_eq!(OpCode::MulVal as u8, 0x48);
        assert_eq!(OpCode::DivVal as u8, 0x49);
        assert_eq!(OpCode::ShlVal as u8, 0x4a);
        assert_eq!(OpCode::ShrVal as u8, 0x4b);
    }

    #[test]
    fn opcode_bytes_are_unique() {
        let mut seen = HashSet::new();
        for &op in OpCode::ALL {
            assert!(seen.insert(op as u8), "duplicate opcode byte {:#04x}", op as u8);
        }
    }

    #[test]
    fn encoded_widths_unchanged() {
        assert_eq!(OpCode::Nop.encoded_len(), 1);
        assert_eq!(OpCode::SetVal.encoded_len(), 13);
        assert_eq!(OpCode::SetDat.encoded_len(), 9);
        assert_eq!(OpCode::SetIdx.encoded_len(), 13);
        assert_eq!(OpCode::PshDat.encoded_len(), 5);
        assert_eq!(OpCode::JmpSub.encoded_len(), 5);
        assert_eq!(OpCode::RetSub.encoded_len(), 1);
        assert_eq!(OpCode::BzrDat.encoded_len(), 6);
        assert_eq!(OpCode::BgtDat.encoded_len(), 10);
        assert_eq!(OpCode::SlpVal.encoded_len(), 9);
        assert_eq!(OpCode::ExtFun.encoded_len(), 3);
        assert_eq!(OpCode::ExtFunDat.encoded_len(), 7);
        assert_eq!(OpCode::ExtFunDat2.encoded_len(), 11);
        assert_eq!(OpCode::ExtFunRet.encoded_len(), 7);
        assert_eq!(OpCode::ExtFunRetDat.encoded_len(), 11);
        assert_eq!(OpCode::ExtFunRetDat2.encoded_len(), 15);
        assert_eq!(OpCode::ExtFunVal.encoded_len(), 11);
    }

    #[test]
    fn branch_schemas_end_with_offset() {
        for op in [
            OpCode::BzrDat,
            OpCode::BnzDat,
            OpCode::BgtDat,
            OpCode::BltDat,
            OpCode::BgeDat,
            OpCode::BleDat,
            OpCode::BeqDat,
            OpCode::BneDat,
        ] {
            assert_eq!(op.params().last(), Some(&ParamKind::Offset), "{}", op.mnemonic());
        }
    }

    #[test]
    fn ext_fun_family_is_contiguous() {
        for &op in OpCode::ALL {
            let in_range = (op as u8) >= 0x32 && (op as u8) <= 0x38;
            assert_eq!(op.is_function_call(), in_range, "{}", op.mnemonic());
            if in_range {
                assert_eq!(op.params().first(), Some(&ParamKind::Func), "{}", op.mnemonic());
            }
        }
    }

    #[test]
    fn function_code_values_unchanged() {
        assert_eq!(FunctionCode::Echo.value(), 0x0001);
        assert_eq!(FunctionCode::SetA1.value(), 0x0100);
        assert_eq!(FunctionCode::SetA4.value(), 0x0103);
        assert_eq!(FunctionCode::SetA1A2.value(), 0x0104);
        assert_eq!(FunctionCode::SetB1.value(), 0x0106);
        assert_eq!(FunctionCode::SetB3B4.value(), 0x010b);
        assert_eq!(FunctionCode::SetADat.value(), 0x0110);
        assert_eq!(FunctionCode::SetBDat.value(), 0x0111);
        assert_eq!(FunctionCode::GetADat.value(), 0x0112);
        assert_eq!(FunctionCode::GetBDat.value(), 0x0113);
        assert_eq!(FunctionCode::SetAInd.value(), 0x0114);
        assert_eq!(FunctionCode::SetBInd.value(), 0x0115);
        assert_eq!(FunctionCode::GetAInd.value(), 0x0116);
        assert_eq!(FunctionCode::GetBInd.value(), 0x0117);
        assert_eq!(FunctionCode::ClearA.value(), 0x0120);
        assert_eq!(FunctionCode::SwapAAndB.value(), 0x0128);
        assert_eq!(FunctionCode::XorBWithA.value(), 0x012e);
        assert_eq!(FunctionCode::UnsignedCompareAWithB.value(), 0x0130);
        assert_eq!(FunctionCode::SignedCompareAWithB.value(), 0x0131);
        assert_eq!(FunctionCode::GetA1.value(), 0x0140);
        assert_eq!(FunctionCode::GetB4.value(), 0x0147);
        assert_eq!(FunctionCode::Sha3AToB.value(), 0x0200);
        assert_eq!(FunctionCode::CheckSha3AWithB.value(), 0x0201);
        assert_eq!(FunctionCode::GetBlockTimestamp.value(), 0x0300);
        assert_eq!(FunctionCode::PutTxAfterTimestampIntoA.value(), 0x0304);
        assert_eq!(FunctionCode::GenerateRandomUsingTxInA.value(), 0x0308);
        assert_eq!(FunctionCode::PutCreatorIntoB.value(), 0x030b);
        assert_eq!(FunctionCode::GetCurrentBalance.value(), 0x0400);
        assert_eq!(FunctionCode::PayToAddressInB.value(), 0x0402);
        assert_eq!(FunctionCode::AddMinutesToTimestamp.value(), 0x0406);
        assert_eq!(crate::functions::API_PASSTHROUGH_BASE, 0x0500);
    }

    #[test]
    fn function_code_values_are_unique_and_below_platform_range() {
        let mut seen = HashSet::new();
        for &function in FunctionCode::CORE {
            assert!(
                seen.insert(function.value()),
                "duplicate function code {:#06x}",
                function.value()
            );
            assert!(function.value() < crate::functions::API_PASSTHROUGH_BASE);
        }
    }

    #[test]
    fn function_shapes_unchanged() {
        let shapes = [
            (FunctionCode::Echo, 1, false),
            (FunctionCode::SetA1, 1, false),
            (FunctionCode::SetA1A2, 2, false),
            (FunctionCode::SetADat, 1, false),
            (FunctionCode::GetBInd, 1, false),
            (FunctionCode::ClearA, 0, false),
            (FunctionCode::CheckAIsZero, 0, true),
            (FunctionCode::CheckAEqualsB, 0, true),
            (FunctionCode::SwapAAndB, 0, false),
            (FunctionCode::UnsignedCompareAWithB, 0, true),
            (FunctionCode::SignedCompareAWithB, 0, true),
            (FunctionCode::GetA1, 0, true),
            (FunctionCode::Sha3AToB, 0, false),
            (FunctionCode::CheckSha3AWithB, 0, true),
            (FunctionCode::GetBlockTimestamp, 0, true),
            (FunctionCode::PutTxAfterTimestampIntoA, 1, false),
            (FunctionCode::GenerateRandomUsingTxInA, 0, true),
            (FunctionCode::GetCurrentBalance, 0, true),
            (FunctionCode::PayToAddressInB, 1, false),
            (FunctionCode::PayAllToAddressInB, 0, false),
            (FunctionCode::MessageAToAddressInB, 0, false),
            (FunctionCode::AddMinutesToTimestamp, 2, true),
        ];

        for (function, params, returns) in shapes {
            assert_eq!(function.param_count(), params, "{}", function.mnemonic());
            assert_eq!(function.returns_value(), returns, "{}", function.mnemonic());
        }
    }
}
