//! Per-round execution driver.
//!
//! [`run_round`] advances one machine through a single block-bound window:
//! it applies the freeze and sleep pre-checks, then decodes, meters, and
//! dispatches opcodes until a stop condition, handling faults via the
//! on-error address or terminating the machine. Fee settlement and ledger
//! writes stay with the host; the returned [`RoundReceipt`] carries what the
//! host needs to account for the round.

use crate::api::Api;
use crate::errors::ExecutionError;
use crate::machine::MachineState;
use tracing::{debug, error, trace};

/// Accounting summary of one executed round.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RoundReceipt {
    /// Steps charged this round.
    pub steps: u32,
    /// Fees owed for this round: steps times the host's per-step fee.
    pub fees: i64,
    /// Whether the machine latched `finished` this round.
    pub finished: bool,
}

/// Runs one round of execution against the host.
///
/// A finished machine is a no-op forever. A frozen machine stays frozen
/// until its balance again covers the freeze threshold. A sleeping machine
/// wakes only once the current block height reaches its sleep-until height,
/// or immediately when no height was recorded.
pub fn run_round<A: Api>(state: &mut MachineState, api: &mut A) -> RoundReceipt {
    let height = api.current_block_height();
    state.set_current_block_height(height);

    if state.is_finished() {
        return RoundReceipt::default();
    }

    let balance = api.current_balance(state);
    state.set_current_balance(balance);

    let threshold = match state.frozen_balance() {
        0 => api.fee_per_step(),
        threshold => threshold,
    };
    if balance < threshold {
        if !state.is_frozen() {
            debug!(balance, threshold, "machine frozen");
        }
        state.set_frozen(true);
        return RoundReceipt::default();
    }
    state.set_frozen(false);

    if state.is_sleeping() {
        if let Some(until) = state.sleep_until_height() {
            if height < until {
                return RoundReceipt::default();
            }
        }
        debug!(height, "machine woke from sleep");
        state.wake();
    }

    state.set_stopped(false);
    state.reset_steps();
    state.set_previous_balance(balance);
    state.set_running(true);

    let max_steps = api.max_steps_per_round();

    loop {
        if state.is_sleeping() || state.is_stopped() || state.is_finished() {
            break;
        }

        let opcode = match state.peek_opcode() {
            Ok(opcode) => opcode,
            Err(e) => {
                fatal(state, api, &e);
                break;
            }
        };

        let cost = api.op_code_steps(opcode);
        if state.steps().saturating_add(cost) > max_steps {
            debug!(
                steps = state.steps(),
                cost, max_steps, "step budget exhausted, yielding until next block"
            );
            state.auto_yield();
            break;
        }
        state.add_steps(cost);

        trace!(pc = state.program_counter(), opcode = opcode.mnemonic(), "dispatch");

        match state.step(api) {
            Ok(()) => {}
            Err(e) => {
                let redirect = e.is_redirectable().then(|| state.on_error_address()).flatten();
                match redirect {
                    Some(address) => {
                        debug!(%e, address, "fault redirected to on-error address");
                        state.set_pc(address);
                        state.set_had_fatal_error(false);
                    }
                    None => {
                        fatal(state, api, &e);
                        break;
                    }
                }
            }
        }

        state.clear_first_opcode_after_sleeping();
    }

    state.set_running(false);

    let steps = state.steps();
    let fees = steps as i64 * api.fee_per_step();
    let finished = state.is_finished();

    if finished {
        let remaining = state.get_current_balance();
        debug!(remaining, "machine finished, refunding remainder");
        api.on_finished(remaining, state);
        state.set_current_balance(0);
    }

    RoundReceipt {
        steps,
        fees,
        finished,
    }
}

fn fatal<A: Api>(state: &mut MachineState, api: &mut A, e: &ExecutionError) {
    error!(%e, pc = state.program_counter(), "fatal fault, terminating machine");
    state.set_had_fatal_error(true);
    state.set_finished(true);
    api.on_fatal_error(state, e);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::OpCode;
    use crate::test_api::{TestApi, AT_ADDRESS, AT_CREATOR_ADDRESS, INITIAL_BALANCE};
    use crate::test_utils::{machine_with_zeroed_data, CodeBuf};

    #[test]
    fn finished_machine_stays_finished() {
        let code = CodeBuf::new().op(OpCode::FinImd).build();
        let mut state = machine_with_zeroed_data(code, 2);
        let mut api = TestApi::new();

        let receipt = run_round(&mut state, &mut api);
        assert!(receipt.finished);
        assert_eq!(receipt.steps, 1);
        assert!(state.is_finished());
        assert!(!state.had_fatal_error());

        let receipt = run_round(&mut state, &mut api);
        assert_eq!(receipt, RoundReceipt::default());
    }

    #[test]
    fn finish_refunds_remaining_balance_to_creator() {
        let code = CodeBuf::new().op(OpCode::FinImd).build();
        let mut state = machine_with_zeroed_data(code, 2);
        let mut api = TestApi::new();

        run_round(&mut state, &mut api);

        assert_eq!(api.balance(AT_ADDRESS), 0);
        assert_eq!(api.balance(AT_CREATOR_ADDRESS), INITIAL_BALANCE * 2);
        assert_eq!(state.get_current_balance(), 0);
    }

    #[test]
    fn receipt_accounts_steps_and_fees() {
        let code = CodeBuf::new()
            .op(OpCode::Nop)
            .op(OpCode::Nop)
            .op(OpCode::ExtFun)
            .func(0x0128)
            .op(OpCode::FinImd)
            .build();
        let mut state = machine_with_zeroed_data(code, 2);
        let mut api = TestApi::new();

        let receipt = run_round(&mut state, &mut api);
        // Two NOPs + FIN_IMD at one step each, one function call at ten.
        assert_eq!(receipt.steps, 13);
        assert_eq!(receipt.fees, 13);
    }

    #[test]
    fn step_budget_exhaustion_yields_until_next_block() {
        let mut buf = CodeBuf::new();
        for _ in 0..600 {
            buf = buf.op(OpCode::Nop);
        }
        let code = buf.op(OpCode::FinImd).build();
        let mut state = machine_with_zeroed_data(code, 2);
        let mut api = TestApi::new();
        let start_height = api.current_block_height();

        let receipt = run_round(&mut state, &mut api);
        assert_eq!(receipt.steps, crate::api::MAX_STEPS_PER_ROUND);
        assert!(!receipt.finished);
        assert!(state.is_sleeping());
        assert_eq!(state.sleep_until_height(), Some(start_height + 1));
        assert_eq!(state.program_counter(), 500);

        // Same block: still asleep, nothing runs.
        let receipt = run_round(&mut state, &mut api);
        assert_eq!(receipt.steps, 0);
        assert_eq!(state.program_counter(), 500);

        api.bump_current_block_height();
        let receipt = run_round(&mut state, &mut api);
        assert!(receipt.finished);
        assert_eq!(receipt.steps, 101);
    }

    #[test]
    fn sleep_until_height_executes_nothing_before_wakeup() {
        let code = CodeBuf::new()
            .op(OpCode::SlpVal)
            .long(3)
            .op(OpCode::IncDat)
            .cell(0)
            .op(OpCode::FinImd)
            .build();
        let mut state = machine_with_zeroed_data(code, 2);
        let mut api = TestApi::new();
        let start_height = api.current_block_height();

        let receipt = run_round(&mut state, &mut api);
        assert!(state.is_sleeping());
        assert_eq!(state.sleep_until_height(), Some(start_height + 3));
        assert_eq!(receipt.steps, 1);

        for _ in 0..2 {
            api.bump_current_block_height();
            let receipt = run_round(&mut state, &mut api);
            assert_eq!(receipt.steps, 0);
            assert_eq!(state.get_data_long(0).unwrap(), 0);
        }

        api.bump_current_block_height();
        let receipt = run_round(&mut state, &mut api);
        assert!(receipt.finished);
        assert_eq!(state.get_data_long(0).unwrap(), 1);
        assert!(!state.is_sleeping());
    }

    #[test]
    fn slp_imd_sleeps_one_block() {
        let code = CodeBuf::new()
            .op(OpCode::SlpImd)
            .op(OpCode::FinImd)
            .build();
        let mut state = machine_with_zeroed_data(code, 2);
        let mut api = TestApi::new();

        run_round(&mut state, &mut api);
        assert!(state.is_sleeping());

        api.bump_current_block_height();
        let receipt = run_round(&mut state, &mut api);
        assert!(receipt.finished);
    }

    #[test]
    fn stopped_machine_resumes_at_on_stop_address() {
        let code = CodeBuf::new()
            .op(OpCode::SetPcs)
            .op(OpCode::IncDat)
            .cell(0)
            .op(OpCode::StpImd)
            .build();
        let mut state = machine_with_zeroed_data(code, 2);
        let mut api = TestApi::new();

        let receipt = run_round(&mut state, &mut api);
        assert!(state.is_stopped());
        assert_eq!(state.get_data_long(0).unwrap(), 1);
        assert_eq!(state.program_counter(), 1);

        api.charge_fees(receipt.fees);
        assert_eq!(api.balance(AT_ADDRESS), INITIAL_BALANCE - 3);

        run_round(&mut state, &mut api);
        assert_eq!(state.get_data_long(0).unwrap(), 2);
        assert!(state.is_stopped());
    }

    #[test]
    fn fault_redirects_to_on_error_address() {
        // 0: ERR_ADR [19]; 5: DIV_DAT @0 $1 (divide by zero); 14: FIN_IMD
        // 15..19: padding; 19: SET_VAL @1 1; 32: FIN_IMD
        let code = CodeBuf::new()
            .op(OpCode::ErrAdr)
            .code_addr(19)
            .op(OpCode::DivDat)
            .cell(0)
            .cell(1)
            .op(OpCode::FinImd)
            .raw(0)
            .raw(0)
            .raw(0)
            .raw(0)
            .op(OpCode::SetVal)
            .cell(1)
            .long(1)
            .op(OpCode::FinImd)
            .build();
        let mut state = machine_with_zeroed_data(code, 2);
        let mut api = TestApi::new();

        let receipt = run_round(&mut state, &mut api);
        assert!(receipt.finished);
        assert!(!state.had_fatal_error());
        assert_eq!(state.get_data_long(1).unwrap(), 1);
    }

    #[test]
    fn fault_without_on_error_address_is_fatal() {
        let code = CodeBuf::new()
            .op(OpCode::DivDat)
            .cell(0)
            .cell(1)
            .build();
        let mut state = machine_with_zeroed_data(code, 2);
        let mut api = TestApi::new();

        let receipt = run_round(&mut state, &mut api);
        assert!(receipt.finished);
        assert!(state.is_finished());
        assert!(state.had_fatal_error());
        // Remaining balance was refunded to the creator.
        assert_eq!(api.balance(AT_ADDRESS), 0);
        assert_eq!(api.balance(AT_CREATOR_ADDRESS), INITIAL_BALANCE * 2);
    }

    #[test]
    fn code_underflow_is_fatal_despite_on_error_address() {
        // ERR_ADR then run off the end of the code segment.
        let code = CodeBuf::new().op(OpCode::ErrAdr).code_addr(0).build();
        let mut state = machine_with_zeroed_data(code, 2);
        let mut api = TestApi::new();

        // ERR_ADR executes, then the zero padding decodes as an invalid
        // opcode and terminates the machine.
        let receipt = run_round(&mut state, &mut api);
        assert!(receipt.finished);
        assert!(state.had_fatal_error());
    }

    #[test]
    fn low_balance_freezes_until_refunded() {
        let code = CodeBuf::new()
            .op(OpCode::IncDat)
            .cell(0)
            .op(OpCode::FinImd)
            .build();
        let mut state = machine_with_zeroed_data(code, 2);
        let mut api = TestApi::new();
        api.set_at_balance(0);

        let receipt = run_round(&mut state, &mut api);
        assert!(state.is_frozen());
        assert_eq!(receipt.steps, 0);
        assert_eq!(state.get_data_long(0).unwrap(), 0);

        api.set_at_balance(1000);
        let receipt = run_round(&mut state, &mut api);
        assert!(!state.is_frozen());
        assert!(receipt.finished);
        assert_eq!(state.get_data_long(0).unwrap(), 1);
    }

    #[test]
    fn previous_balance_is_recorded_at_round_start() {
        let code = CodeBuf::new().op(OpCode::FinImd).build();
        let mut state = machine_with_zeroed_data(code, 2);
        let mut api = TestApi::new();
        api.set_at_balance(777);

        run_round(&mut state, &mut api);
        assert_eq!(state.get_previous_balance(), 777);
    }

    #[test]
    fn two_phase_random_sleeps_then_returns_entropy() {
        let code = CodeBuf::new()
            .op(OpCode::ExtFunRet)
            .func(0x0308)
            .cell(0)
            .op(OpCode::FinImd)
            .build();
        let mut state = machine_with_zeroed_data(code, 2);
        let mut api = TestApi::new();

        // First phase: the host puts the machine to sleep and the opcode
        // stays current so it re-executes on wake-up.
        let receipt = run_round(&mut state, &mut api);
        assert!(!receipt.finished);
        assert!(state.is_sleeping());
        assert_eq!(state.program_counter(), 0);
        assert_eq!(state.get_data_long(0).unwrap(), 0);

        api.bump_current_block_height();
        let receipt = run_round(&mut state, &mut api);
        assert!(receipt.finished);
        // A is all zeroes, so the test host's mix is fully determined.
        assert_eq!(state.get_data_long(0).unwrap(), 37217);
        assert!(!state.is_first_opcode_after_sleeping());
    }

    #[test]
    fn transaction_feed_round_trip() {
        let mut api = TestApi::new();
        let tx = api.payment_to_at("Initiator", 250);
        api.add_transaction_to_current_block(tx);
        api.add_current_block_to_chain();

        let since = crate::codec::Timestamp::new(crate::test_utils::CREATION_BLOCK_HEIGHT, 0);
        // @0 holds the cursor timestamp; the amount lands in @1.
        let code = CodeBuf::new()
            .op(OpCode::SetVal)
            .cell(0)
            .long(since.to_long())
            .op(OpCode::ExtFunDat)
            .func(0x0304)
            .cell(0)
            .op(OpCode::ExtFunRet)
            .func(0x0306)
            .cell(1)
            .op(OpCode::FinImd)
            .build();
        let mut state = machine_with_zeroed_data(code, 2);

        let receipt = run_round(&mut state, &mut api);
        assert!(receipt.finished);
        assert!(!state.had_fatal_error());
        assert_eq!(state.get_data_long(1).unwrap(), 250);
    }
}
