//! Host interface.
//!
//! The embedding environment implements [`Api`] to give machines their view
//! of the surrounding ledger: the block clock, the feed of transactions
//! addressed to the machine, balances, outbound actions, and metering
//! parameters. The executor and the function-code table call through this
//! trait; nothing else crosses the machine boundary.
//!
//! All amounts and packed timestamps are plain `i64`s so they can flow
//! through data cells unchanged.

use crate::codec::Timestamp;
use crate::errors::ExecutionError;
use crate::functions::FunctionData;
use crate::isa::OpCode;
use crate::machine::MachineState;
use tracing::error;

/// Default per-round step budget.
pub const MAX_STEPS_PER_ROUND: u32 = 500;

/// Callbacks the embedding environment provides to machines.
///
/// Metering methods have defaults matching the reference parameters; chain,
/// transaction, and action methods must be supplied. Platform-specific
/// function codes (raw `>= 0x0500`) default to rejection.
pub trait Api {
    // ==================== Metering ====================

    /// Step budget for one round of execution.
    fn max_steps_per_round(&self) -> u32 {
        MAX_STEPS_PER_ROUND
    }

    /// Step cost charged for dispatching `opcode`.
    fn op_code_steps(&self, opcode: OpCode) -> u32 {
        opcode.base_steps()
    }

    /// Fee the host charges per step.
    fn fee_per_step(&self) -> i64 {
        1
    }

    // ==================== Chain clock ====================

    /// Height of the block currently being processed.
    fn current_block_height(&self) -> u32;

    /// Height of the block in which the machine was created.
    fn at_creation_block_height(&self, state: &MachineState) -> u32 {
        state.creation_block_height()
    }

    /// Sets A to the hash of the previous block.
    fn put_previous_block_hash_into_a(&mut self, state: &mut MachineState);

    // ==================== Transaction feed ====================

    /// Sets A to the 32-byte identifier of the first transaction addressed
    /// to this machine strictly after `timestamp`, or to zero bytes if none
    /// exists yet.
    fn put_transaction_after_timestamp_into_a(
        &mut self,
        timestamp: Timestamp,
        state: &mut MachineState,
    );

    /// Type of the transaction identified by A.
    fn get_type_from_transaction_in_a(&mut self, state: &mut MachineState) -> i64;

    /// Amount of the transaction identified by A; zero for non-payments.
    fn get_amount_from_transaction_in_a(&mut self, state: &mut MachineState) -> i64;

    /// Packed timestamp of the transaction identified by A.
    fn get_timestamp_from_transaction_in_a(&mut self, state: &mut MachineState) -> i64;

    /// Two-phase entropy source.
    ///
    /// On the first call the host puts the machine to sleep and the opcode
    /// re-executes after the next block; on the second call
    /// [`MachineState::is_first_opcode_after_sleeping`] is set and the host
    /// returns a value derived from A and the fresh block hash.
    fn generate_random_using_transaction_in_a(&mut self, state: &mut MachineState) -> i64;

    /// Sets B to the message carried by the transaction identified by A.
    fn put_message_from_transaction_in_a_into_b(&mut self, state: &mut MachineState);

    /// Sets B to the sender address of the transaction identified by A.
    fn put_address_from_transaction_in_a_into_b(&mut self, state: &mut MachineState);

    /// Sets B to the machine creator's address.
    fn put_creator_address_into_b(&mut self, state: &mut MachineState);

    // ==================== Balances and actions ====================

    /// The machine's ledger balance.
    fn current_balance(&self, state: &MachineState) -> i64;

    /// Queues a payment of `amount` to the address in B.
    fn pay_amount_to_b(&mut self, amount: i64, state: &mut MachineState);

    /// Queues a message carrying A to the address in B.
    fn message_a_to_b(&mut self, state: &mut MachineState);

    /// Advances `timestamp` by `minutes` of block time.
    fn add_minutes_to_timestamp(
        &self,
        timestamp: Timestamp,
        minutes: i64,
        state: &mut MachineState,
    ) -> Timestamp;

    /// Called once when the machine finishes; `amount` is the remaining
    /// balance to refund to the creator.
    fn on_finished(&mut self, amount: i64, state: &mut MachineState);

    /// Called when a fault terminates the machine.
    fn on_fatal_error(&mut self, state: &mut MachineState, error: &ExecutionError) {
        let _ = state;
        error!("fatal machine error: {error}");
    }

    // ==================== Platform-specific functions ====================

    /// Shape check for a platform function code (raw `>= 0x0500`).
    fn platform_specific_pre_execute_check(
        &self,
        param_count: usize,
        returns_value: bool,
        raw_function_code: u16,
    ) -> Result<(), ExecutionError> {
        let _ = (param_count, returns_value);
        Err(ExecutionError::IllegalFunctionCode {
            raw: raw_function_code,
            reason: "unrecognised platform-specific function code".to_string(),
        })
    }

    /// Executes a platform function code (raw `>= 0x0500`).
    fn platform_specific_post_check_execute(
        &mut self,
        function_data: &mut FunctionData,
        state: &mut MachineState,
        raw_function_code: u16,
    ) -> Result<(), ExecutionError> {
        let _ = (function_data, state);
        Err(ExecutionError::IllegalFunctionCode {
            raw: raw_function_code,
            reason: "unrecognised platform-specific function code".to_string(),
        })
    }
}
