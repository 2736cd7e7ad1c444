//! Function-code (external function) definitions.
//!
//! Function codes are 16-bit syscall selectors invoked by the EXT_FUN opcode
//! family. The [`for_each_function!`](crate::for_each_function) macro holds
//! the canonical table and invokes a callback macro for code generation,
//! producing the [`FunctionCode`] enum with raw-code, mnemonic, arity, and
//! return-flag lookups.
//!
//! Core codes operate on the A/B registers and the machine's balances and
//! are executed here. Raw codes at [`API_PASSTHROUGH_BASE`] and above are
//! platform-specific and delegate to the host's pre-check/execute hooks.
//!
//! Before dispatch the invoking opcode's shape (argument count, whether a
//! return value is expected) is verified against the function's declaration;
//! a mismatch is an [`ExecutionError::IllegalFunctionCode`] fault.

use crate::api::Api;
use crate::codec::Timestamp;
use crate::errors::ExecutionError;
use crate::machine::MachineState;
use sha3::{Digest, Sha3_256};
use std::cmp::Ordering;
use tracing::info;

/// First raw code delegated to the host platform.
pub const API_PASSTHROUGH_BASE: u16 = 0x0500;

/// Argument and return-value carrier for one function invocation.
///
/// The invoking opcode fills `value1`/`value2` from the code stream or data
/// segment; a returning function leaves its result in `return_value`.
#[derive(Debug, Default)]
pub struct FunctionData {
    pub value1: Option<i64>,
    pub value2: Option<i64>,
    pub return_value: Option<i64>,
    /// Whether the invoking opcode expects a return value.
    pub returns_value: bool,
}

impl FunctionData {
    pub fn with_no_args(returns_value: bool) -> Self {
        Self {
            returns_value,
            ..Self::default()
        }
    }

    pub fn with_one_arg(value1: i64, returns_value: bool) -> Self {
        Self {
            value1: Some(value1),
            returns_value,
            ..Self::default()
        }
    }

    pub fn with_two_args(value1: i64, value2: i64, returns_value: bool) -> Self {
        Self {
            value1: Some(value1),
            value2: Some(value2),
            returns_value,
            ..Self::default()
        }
    }

    pub fn param_count(&self) -> usize {
        match (self.value1, self.value2) {
            (Some(_), Some(_)) => 2,
            (Some(_), None) => 1,
            _ => 0,
        }
    }

    fn arg1(&self) -> i64 {
        self.value1.unwrap_or_default()
    }

    fn arg2(&self) -> i64 {
        self.value2.unwrap_or_default()
    }
}

/// Invokes a callback macro with the complete core function-code list.
///
/// Each entry is `Name = raw, "MNEMONIC", param_count, returns_value`.
#[macro_export]
macro_rules! for_each_function {
    ($callback:ident) => {
        $callback! {
            /// Logs its argument through the diagnostics sink.
            Echo = 0x0001, "ECHO", 1, false,
            // =========================
            // A/B register cell setters
            // =========================
            /// A1 = arg
            SetA1 = 0x0100, "SET_A1", 1, false,
            /// A2 = arg
            SetA2 = 0x0101, "SET_A2", 1, false,
            /// A3 = arg
            SetA3 = 0x0102, "SET_A3", 1, false,
            /// A4 = arg
            SetA4 = 0x0103, "SET_A4", 1, false,
            /// A1 = arg1, A2 = arg2
            SetA1A2 = 0x0104, "SET_A1_A2", 2, false,
            /// A3 = arg1, A4 = arg2
            SetA3A4 = 0x0105, "SET_A3_A4", 2, false,
            /// B1 = arg
            SetB1 = 0x0106, "SET_B1", 1, false,
            /// B2 = arg
            SetB2 = 0x0107, "SET_B2", 1, false,
            /// B3 = arg
            SetB3 = 0x0108, "SET_B3", 1, false,
            /// B4 = arg
            SetB4 = 0x0109, "SET_B4", 1, false,
            /// B1 = arg1, B2 = arg2
            SetB1B2 = 0x010a, "SET_B1_B2", 2, false,
            /// B3 = arg1, B4 = arg2
            SetB3B4 = 0x010b, "SET_B3_B4", 2, false,
            // =========================
            // A/B transfers with the data segment
            // =========================
            /// A = 32 bytes of data starting at cell `arg`
            SetADat = 0x0110, "SET_A_DAT", 1, false,
            /// B = 32 bytes of data starting at cell `arg`
            SetBDat = 0x0111, "SET_B_DAT", 1, false,
            /// 32 bytes of data starting at cell `arg` = A
            GetADat = 0x0112, "GET_A_DAT", 1, false,
            /// 32 bytes of data starting at cell `arg` = B
            GetBDat = 0x0113, "GET_B_DAT", 1, false,
            /// A = 32 bytes of data starting at the cell indexed by `arg`
            SetAInd = 0x0114, "SET_A_IND", 1, false,
            /// B = 32 bytes of data starting at the cell indexed by `arg`
            SetBInd = 0x0115, "SET_B_IND", 1, false,
            /// 32 bytes of data starting at the cell indexed by `arg` = A
            GetAInd = 0x0116, "GET_A_IND", 1, false,
            /// 32 bytes of data starting at the cell indexed by `arg` = B
            GetBInd = 0x0117, "GET_B_IND", 1, false,
            // =========================
            // A/B whole-register operations
            // =========================
            /// A = 0
            ClearA = 0x0120, "CLEAR_A", 0, false,
            /// B = 0
            ClearB = 0x0121, "CLEAR_B", 0, false,
            /// A = 0, B = 0
            ClearAAndB = 0x0122, "CLEAR_A_AND_B", 0, false,
            /// A = B
            CopyAFromB = 0x0123, "COPY_A_FROM_B", 0, false,
            /// B = A
            CopyBFromA = 0x0124, "COPY_B_FROM_A", 0, false,
            /// returns 1 if A == 0, else 0
            CheckAIsZero = 0x0125, "CHECK_A_IS_ZERO", 0, true,
            /// returns 1 if B == 0, else 0
            CheckBIsZero = 0x0126, "CHECK_B_IS_ZERO", 0, true,
            /// returns 1 if A == B, else 0
            CheckAEqualsB = 0x0127, "CHECK_A_EQUALS_B", 0, true,
            /// A <-> B
            SwapAAndB = 0x0128, "SWAP_A_AND_B", 0, false,
            /// A |= B
            OrAWithB = 0x0129, "OR_A_WITH_B", 0, false,
            /// B |= A
            OrBWithA = 0x012a, "OR_B_WITH_A", 0, false,
            /// A &= B
            AndAWithB = 0x012b, "AND_A_WITH_B", 0, false,
            /// B &= A
            AndBWithA = 0x012c, "AND_B_WITH_A", 0, false,
            /// A ^= B
            XorAWithB = 0x012d, "XOR_A_WITH_B", 0, false,
            /// B ^= A
            XorBWithA = 0x012e, "XOR_B_WITH_A", 0, false,
            /// 256-bit unsigned compare; returns -1, 0, or +1
            UnsignedCompareAWithB = 0x0130, "UNSIGNED_COMPARE_A_WITH_B", 0, true,
            /// 256-bit signed compare; returns -1, 0, or +1
            SignedCompareAWithB = 0x0131, "SIGNED_COMPARE_A_WITH_B", 0, true,
            // =========================
            // A/B register cell getters
            // =========================
            /// returns A1
            GetA1 = 0x0140, "GET_A1", 0, true,
            /// returns A2
            GetA2 = 0x0141, "GET_A2", 0, true,
            /// returns A3
            GetA3 = 0x0142, "GET_A3", 0, true,
            /// returns A4
            GetA4 = 0x0143, "GET_A4", 0, true,
            /// returns B1
            GetB1 = 0x0144, "GET_B1", 0, true,
            /// returns B2
            GetB2 = 0x0145, "GET_B2", 0, true,
            /// returns B3
            GetB3 = 0x0146, "GET_B3", 0, true,
            /// returns B4
            GetB4 = 0x0147, "GET_B4", 0, true,
            // =========================
            // Hashing
            // =========================
            /// B = SHA3-256(A)
            Sha3AToB = 0x0200, "SHA3_A_TO_B", 0, false,
            /// returns 1 if SHA3-256(A) == B, else 0
            CheckSha3AWithB = 0x0201, "CHECK_SHA3_A_WITH_B", 0, true,
            // =========================
            // Chain and transaction queries
            // =========================
            /// returns the current block height as a packed timestamp
            GetBlockTimestamp = 0x0300, "GET_BLOCK_TIMESTAMP", 0, true,
            /// returns the machine's creation height as a packed timestamp
            GetCreationTimestamp = 0x0301, "GET_CREATION_TIMESTAMP", 0, true,
            /// returns the previous block height as a packed timestamp
            GetPreviousBlockTimestamp = 0x0302, "GET_PREVIOUS_BLOCK_TIMESTAMP", 0, true,
            /// A = hash of the previous block
            PutPreviousBlockHashIntoA = 0x0303, "PUT_PREVIOUS_BLOCK_HASH_INTO_A", 0, false,
            /// A = id of the first transaction to this machine after `arg`
            PutTxAfterTimestampIntoA = 0x0304, "PUT_TX_AFTER_TIMESTAMP_INTO_A", 1, false,
            /// returns the type of the transaction identified by A
            GetTypeFromTxInA = 0x0305, "GET_TYPE_FROM_TX_IN_A", 0, true,
            /// returns the amount of the transaction identified by A
            GetAmountFromTxInA = 0x0306, "GET_AMOUNT_FROM_TX_IN_A", 0, true,
            /// returns the timestamp of the transaction identified by A
            GetTimestampFromTxInA = 0x0307, "GET_TIMESTAMP_FROM_TX_IN_A", 0, true,
            /// two-phase: sleeps one block, then returns entropy drawn from A
            GenerateRandomUsingTxInA = 0x0308, "GENERATE_RANDOM_USING_TX_IN_A", 0, true,
            /// B = message of the transaction identified by A
            PutMessageFromTxInAIntoB = 0x0309, "PUT_MESSAGE_FROM_TX_IN_A_INTO_B", 0, false,
            /// B = sender address of the transaction identified by A
            PutAddressFromTxInAIntoB = 0x030a, "PUT_ADDRESS_FROM_TX_IN_A_INTO_B", 0, false,
            /// B = address of this machine's creator
            PutCreatorIntoB = 0x030b, "PUT_CREATOR_INTO_B", 0, false,
            // =========================
            // Balances and outbound actions
            // =========================
            /// returns the machine's balance
            GetCurrentBalance = 0x0400, "GET_CURRENT_BALANCE", 0, true,
            /// returns the balance at the start of the round
            GetPreviousBalance = 0x0401, "GET_PREVIOUS_BALANCE", 0, true,
            /// pays min(arg, balance) to the address in B
            PayToAddressInB = 0x0402, "PAY_TO_ADDRESS_IN_B", 1, false,
            /// pays the whole balance to the address in B
            PayAllToAddressInB = 0x0403, "PAY_ALL_TO_ADDRESS_IN_B", 0, false,
            /// pays min(previous balance, balance) to the address in B
            PayPreviousToAddressInB = 0x0404, "PAY_PREVIOUS_TO_ADDRESS_IN_B", 0, false,
            /// sends A as a message to the address in B
            MessageAToAddressInB = 0x0405, "MESSAGE_A_TO_ADDRESS_IN_B", 0, false,
            /// returns arg1 advanced by arg2 minutes of block time
            AddMinutesToTimestamp = 0x0406, "ADD_MINUTES_TO_TIMESTAMP", 2, true,
        }
    };
}

#[macro_export]
macro_rules! define_functions {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $raw:literal, $mnemonic:literal, $params:expr, $returns:expr
        ),* $(,)?
    ) => {
        /// Function codes addressable by the EXT_FUN opcode family.
        #[repr(u16)]
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
        pub enum FunctionCode {
            $(
                $(#[$doc])*
                $name = $raw,
            )*
            /// Host-defined platform function; raw codes at
            /// [`API_PASSTHROUGH_BASE`] and above.
            ApiPassthrough = 0xffff,
        }

        impl FunctionCode {
            /// Every core function code, in definition order.
            pub const CORE: &'static [FunctionCode] = &[ $( FunctionCode::$name, )* ];

            /// Resolves a raw 16-bit code to its function, if any.
            pub fn lookup(raw: u16) -> Option<FunctionCode> {
                if raw >= API_PASSTHROUGH_BASE {
                    return Some(FunctionCode::ApiPassthrough);
                }
                match raw {
                    $( $raw => Some(FunctionCode::$name), )*
                    _ => None,
                }
            }

            /// The raw wire code for this function.
            pub const fn value(&self) -> u16 {
                match self {
                    $( FunctionCode::$name => $raw, )*
                    FunctionCode::ApiPassthrough => API_PASSTHROUGH_BASE,
                }
            }

            pub const fn mnemonic(&self) -> &'static str {
                match self {
                    $( FunctionCode::$name => $mnemonic, )*
                    FunctionCode::ApiPassthrough => "API_PASSTHROUGH",
                }
            }

            /// Resolves a core function mnemonic.
            pub fn from_mnemonic(mnemonic: &str) -> Option<FunctionCode> {
                match mnemonic {
                    $( $mnemonic => Some(FunctionCode::$name), )*
                    _ => None,
                }
            }

            /// Declared argument count (0, 1, or 2).
            pub const fn param_count(&self) -> usize {
                match self {
                    $( FunctionCode::$name => $params, )*
                    FunctionCode::ApiPassthrough => 0,
                }
            }

            /// Whether the function produces a return value.
            pub const fn returns_value(&self) -> bool {
                match self {
                    $( FunctionCode::$name => $returns, )*
                    FunctionCode::ApiPassthrough => false,
                }
            }
        }
    };
}

for_each_function!(define_functions);

impl FunctionCode {
    /// Verifies the invoking opcode's shape against this function's
    /// declaration. Platform codes delegate the check to the host.
    pub fn pre_execute_check<A: Api>(
        self,
        api: &A,
        param_count: usize,
        returns_value: bool,
        raw: u16,
    ) -> Result<(), ExecutionError> {
        if let FunctionCode::ApiPassthrough = self {
            return api.platform_specific_pre_execute_check(param_count, returns_value, raw);
        }

        if param_count != self.param_count() || returns_value != self.returns_value() {
            return Err(ExecutionError::IllegalFunctionCode {
                raw,
                reason: format!(
                    "opcode shape ({} arg(s), returns {}) does not match declared ({} arg(s), returns {})",
                    param_count,
                    returns_value,
                    self.param_count(),
                    self.returns_value(),
                ),
            });
        }

        Ok(())
    }

    /// Executes this function against the machine and host.
    pub fn execute<A: Api>(
        self,
        data: &mut FunctionData,
        state: &mut MachineState,
        api: &mut A,
        raw: u16,
    ) -> Result<(), ExecutionError> {
        match self {
            FunctionCode::Echo => {
                info!("echo {:#018x}", data.arg1());
            }

            FunctionCode::SetA1 => state.set_a1(data.arg1()),
            FunctionCode::SetA2 => state.set_a2(data.arg1()),
            FunctionCode::SetA3 => state.set_a3(data.arg1()),
            FunctionCode::SetA4 => state.set_a4(data.arg1()),
            FunctionCode::SetA1A2 => {
                state.set_a1(data.arg1());
                state.set_a2(data.arg2());
            }
            FunctionCode::SetA3A4 => {
                state.set_a3(data.arg1());
                state.set_a4(data.arg2());
            }
            FunctionCode::SetB1 => state.set_b1(data.arg1()),
            FunctionCode::SetB2 => state.set_b2(data.arg1()),
            FunctionCode::SetB3 => state.set_b3(data.arg1()),
            FunctionCode::SetB4 => state.set_b4(data.arg1()),
            FunctionCode::SetB1B2 => {
                state.set_b1(data.arg1());
                state.set_b2(data.arg2());
            }
            FunctionCode::SetB3B4 => {
                state.set_b3(data.arg1());
                state.set_b4(data.arg2());
            }

            FunctionCode::SetADat | FunctionCode::SetAInd => {
                state.load_a_from_cells(data.arg1())?
            }
            FunctionCode::SetBDat | FunctionCode::SetBInd => {
                state.load_b_from_cells(data.arg1())?
            }
            FunctionCode::GetADat | FunctionCode::GetAInd => {
                state.store_a_to_cells(data.arg1())?
            }
            FunctionCode::GetBDat | FunctionCode::GetBInd => {
                state.store_b_to_cells(data.arg1())?
            }

            FunctionCode::ClearA => state.a = [0; 4],
            FunctionCode::ClearB => state.b = [0; 4],
            FunctionCode::ClearAAndB => {
                state.a = [0; 4];
                state.b = [0; 4];
            }
            FunctionCode::CopyAFromB => state.a = state.b,
            FunctionCode::CopyBFromA => state.b = state.a,
            FunctionCode::CheckAIsZero => {
                data.return_value = Some(bool_value(state.a == [0; 4]));
            }
            FunctionCode::CheckBIsZero => {
                data.return_value = Some(bool_value(state.b == [0; 4]));
            }
            FunctionCode::CheckAEqualsB => {
                data.return_value = Some(bool_value(state.a == state.b));
            }
            FunctionCode::SwapAAndB => std::mem::swap(&mut state.a, &mut state.b),
            FunctionCode::OrAWithB => combine(&mut state.a, state.b, |a, b| a | b),
            FunctionCode::OrBWithA => combine(&mut state.b, state.a, |a, b| a | b),
            FunctionCode::AndAWithB => combine(&mut state.a, state.b, |a, b| a & b),
            FunctionCode::AndBWithA => combine(&mut state.b, state.a, |a, b| a & b),
            FunctionCode::XorAWithB => combine(&mut state.a, state.b, |a, b| a ^ b),
            FunctionCode::XorBWithA => combine(&mut state.b, state.a, |a, b| a ^ b),
            FunctionCode::UnsignedCompareAWithB => {
                data.return_value = Some(compare_a_with_b(state, false));
            }
            FunctionCode::SignedCompareAWithB => {
                data.return_value = Some(compare_a_with_b(state, true));
            }

            FunctionCode::GetA1 => data.return_value = Some(state.get_a1()),
            FunctionCode::GetA2 => data.return_value = Some(state.get_a2()),
            FunctionCode::GetA3 => data.return_value = Some(state.get_a3()),
            FunctionCode::GetA4 => data.return_value = Some(state.get_a4()),
            FunctionCode::GetB1 => data.return_value = Some(state.get_b1()),
            FunctionCode::GetB2 => data.return_value = Some(state.get_b2()),
            FunctionCode::GetB3 => data.return_value = Some(state.get_b3()),
            FunctionCode::GetB4 => data.return_value = Some(state.get_b4()),

            FunctionCode::Sha3AToB => {
                let digest: [u8; 32] = Sha3_256::digest(state.get_a_bytes()).into();
                state.set_b_bytes(&digest);
            }
            FunctionCode::CheckSha3AWithB => {
                let digest: [u8; 32] = Sha3_256::digest(state.get_a_bytes()).into();
                data.return_value = Some(bool_value(digest == state.get_b_bytes()));
            }

            FunctionCode::GetBlockTimestamp => {
                let height = state.current_block_height();
                data.return_value = Some(Timestamp::new(height, 0).to_long());
            }
            FunctionCode::GetCreationTimestamp => {
                let height = api.at_creation_block_height(state);
                data.return_value = Some(Timestamp::new(height, 0).to_long());
            }
            FunctionCode::GetPreviousBlockTimestamp => {
                let height = state.current_block_height().saturating_sub(1);
                data.return_value = Some(Timestamp::new(height, 0).to_long());
            }
            FunctionCode::PutPreviousBlockHashIntoA => {
                api.put_previous_block_hash_into_a(state);
            }
            FunctionCode::PutTxAfterTimestampIntoA => {
                let timestamp = Timestamp::from_long(data.arg1());
                api.put_transaction_after_timestamp_into_a(timestamp, state);
            }
            FunctionCode::GetTypeFromTxInA => {
                data.return_value = Some(api.get_type_from_transaction_in_a(state));
            }
            FunctionCode::GetAmountFromTxInA => {
                data.return_value = Some(api.get_amount_from_transaction_in_a(state));
            }
            FunctionCode::GetTimestampFromTxInA => {
                data.return_value = Some(api.get_timestamp_from_transaction_in_a(state));
            }
            FunctionCode::GenerateRandomUsingTxInA => {
                data.return_value = Some(api.generate_random_using_transaction_in_a(state));
            }
            FunctionCode::PutMessageFromTxInAIntoB => {
                api.put_message_from_transaction_in_a_into_b(state);
            }
            FunctionCode::PutAddressFromTxInAIntoB => {
                api.put_address_from_transaction_in_a_into_b(state);
            }
            FunctionCode::PutCreatorIntoB => api.put_creator_address_into_b(state),

            FunctionCode::GetCurrentBalance => {
                data.return_value = Some(state.get_current_balance());
            }
            FunctionCode::GetPreviousBalance => {
                data.return_value = Some(state.get_previous_balance());
            }
            FunctionCode::PayToAddressInB => {
                let amount = data.arg1().clamp(0, state.get_current_balance());
                api.pay_amount_to_b(amount, state);
                state.set_current_balance(state.get_current_balance() - amount);
            }
            FunctionCode::PayAllToAddressInB => {
                let amount = state.get_current_balance();
                api.pay_amount_to_b(amount, state);
                state.set_current_balance(0);
            }
            FunctionCode::PayPreviousToAddressInB => {
                let amount = state
                    .get_previous_balance()
                    .clamp(0, state.get_current_balance());
                api.pay_amount_to_b(amount, state);
                state.set_current_balance(state.get_current_balance() - amount);
            }
            FunctionCode::MessageAToAddressInB => api.message_a_to_b(state),
            FunctionCode::AddMinutesToTimestamp => {
                let timestamp = Timestamp::from_long(data.arg1());
                let advanced = api.add_minutes_to_timestamp(timestamp, data.arg2(), state);
                data.return_value = Some(advanced.to_long());
            }

            FunctionCode::ApiPassthrough => {
                api.platform_specific_post_check_execute(data, state, raw)?;
            }
        }

        Ok(())
    }
}

fn bool_value(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}

fn combine(dst: &mut [i64; 4], src: [i64; 4], f: fn(i64, i64) -> i64) {
    for limb in 0..4 {
        dst[limb] = f(dst[limb], src[limb]);
    }
}

/// 256-bit A-versus-B comparison, A1/B1 being the most-significant limb.
/// The signed variant takes its sign from that limb alone.
fn compare_a_with_b(state: &MachineState, signed: bool) -> i64 {
    for limb in 0..4 {
        let (a, b) = (state.a[limb], state.b[limb]);
        let ordering = if signed && limb == 0 {
            a.cmp(&b)
        } else {
            (a as u64).cmp(&(b as u64))
        };
        match ordering {
            Ordering::Less => return -1,
            Ordering::Greater => return 1,
            Ordering::Equal => {}
        }
    }
    0
}
