//! In-memory host used by machine and executor tests.
//!
//! Models just enough of a ledger to exercise the host interface: a chain
//! of blocks with deterministic hashes, a handful of accounts, a feed of
//! transactions addressed to the machine, and the two platform-specific
//! function codes the original host declares (0x0501 and 0x0502).

use crate::api::Api;
use crate::codec::Timestamp;
use crate::errors::ExecutionError;
use crate::functions::FunctionData;
use crate::machine::MachineState;
use sha3::{Digest, Sha3_256};
use std::collections::BTreeMap;

pub(crate) const BLOCK_PERIOD_SECONDS: i64 = 60;
pub(crate) const INITIAL_BALANCE: i64 = 10_0000_0000;
pub(crate) const INITIAL_BLOCK_HEIGHT: u32 = 10;

pub(crate) const AT_ADDRESS: &str = "AT";
pub(crate) const AT_CREATOR_ADDRESS: &str = "AT Creator";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum TxType {
    Payment = 0,
    Message = 1,
}

#[derive(Clone, Debug)]
pub(crate) struct TestTransaction {
    pub timestamp: i64,
    pub tx_hash: [u8; 32],
    pub tx_type: TxType,
    pub sender: String,
    pub recipient: String,
    pub amount: i64,
    pub message: [u8; 32],
}

#[derive(Clone, Debug)]
pub(crate) struct TestBlock {
    pub block_hash: [u8; 32],
    pub transactions: Vec<TestTransaction>,
}

/// Encodes a readable address into its 32-byte ledger form.
pub(crate) fn encode_address(address: &str) -> [u8; 32] {
    let mut encoded = [0u8; 32];
    encoded[..address.len()].copy_from_slice(address.as_bytes());
    encoded
}

fn decode_address(encoded: &[u8; 32]) -> String {
    let end = encoded
        .iter()
        .rposition(|&byte| byte != 0)
        .map_or(0, |index| index + 1);
    String::from_utf8_lossy(&encoded[..end]).into_owned()
}

pub(crate) struct TestApi {
    pub blockchain: Vec<TestBlock>,
    pub accounts: BTreeMap<String, i64>,
    pub messages: BTreeMap<String, Vec<[u8; 32]>>,
    pub transactions: BTreeMap<[u8; 32], TestTransaction>,
    current_block: Vec<TestTransaction>,
    current_height: u32,
    hash_counter: u64,
}

impl TestApi {
    pub fn new() -> Self {
        let mut api = Self {
            blockchain: Vec::new(),
            accounts: BTreeMap::new(),
            messages: BTreeMap::new(),
            transactions: BTreeMap::new(),
            current_block: Vec::new(),
            current_height: INITIAL_BLOCK_HEIGHT,
            hash_counter: 0,
        };

        for _ in 1..=INITIAL_BLOCK_HEIGHT {
            let hash = api.next_hash();
            api.blockchain.push(TestBlock {
                block_hash: hash,
                transactions: Vec::new(),
            });
        }

        api.accounts.insert(AT_ADDRESS.to_string(), INITIAL_BALANCE);
        api.accounts
            .insert(AT_CREATOR_ADDRESS.to_string(), INITIAL_BALANCE);
        api.accounts
            .insert("Initiator".to_string(), INITIAL_BALANCE * 2);
        api.accounts
            .insert("Responder".to_string(), INITIAL_BALANCE * 3);

        api
    }

    fn next_hash(&mut self) -> [u8; 32] {
        self.hash_counter += 1;
        Sha3_256::digest(self.hash_counter.to_be_bytes()).into()
    }

    pub fn balance(&self, address: &str) -> i64 {
        self.accounts.get(address).copied().unwrap_or(0)
    }

    pub fn set_at_balance(&mut self, balance: i64) {
        self.accounts.insert(AT_ADDRESS.to_string(), balance);
    }

    /// Debits the machine account by the round's fees.
    pub fn charge_fees(&mut self, fees: i64) {
        *self.accounts.get_mut(AT_ADDRESS).unwrap() -= fees;
    }

    pub fn payment_to_at(&mut self, sender: &str, amount: i64) -> TestTransaction {
        let tx_hash = self.next_hash();
        TestTransaction {
            timestamp: 0,
            tx_hash,
            tx_type: TxType::Payment,
            sender: sender.to_string(),
            recipient: AT_ADDRESS.to_string(),
            amount,
            message: [0; 32],
        }
    }

    pub fn message_to_at(&mut self, sender: &str, message: [u8; 32]) -> TestTransaction {
        let tx_hash = self.next_hash();
        TestTransaction {
            timestamp: 0,
            tx_hash,
            tx_type: TxType::Message,
            sender: sender.to_string(),
            recipient: AT_ADDRESS.to_string(),
            amount: 0,
            message,
        }
    }

    pub fn add_transaction_to_current_block(&mut self, transaction: TestTransaction) {
        self.current_block.push(transaction);
    }

    /// Seals the current block: stamps transaction timestamps, indexes the
    /// transactions, applies inbound payments, and advances the chain tip.
    pub fn add_current_block_to_chain(&mut self) {
        let height = self.blockchain.len() as u32 + 1;
        let block_hash = self.next_hash();
        let mut transactions = std::mem::take(&mut self.current_block);

        for (sequence, transaction) in transactions.iter_mut().enumerate() {
            transaction.timestamp = Timestamp::new(height, sequence as u32).to_long();
            self.transactions
                .insert(transaction.tx_hash, transaction.clone());

            if transaction.tx_type == TxType::Payment && transaction.sender != AT_ADDRESS {
                *self
                    .accounts
                    .entry(transaction.sender.clone())
                    .or_insert(0) -= transaction.amount;
                *self
                    .accounts
                    .entry(transaction.recipient.clone())
                    .or_insert(0) += transaction.amount;
            }
        }

        self.blockchain.push(TestBlock {
            block_hash,
            transactions,
        });
        self.current_height = height;
    }

    pub fn bump_current_block_height(&mut self) {
        let hash = self.next_hash();
        self.blockchain.push(TestBlock {
            block_hash: hash,
            transactions: Vec::new(),
        });
        self.current_height += 1;
    }

    fn transaction_from_a(&self, state: &MachineState) -> Option<&TestTransaction> {
        self.transactions.get(&state.get_a_bytes())
    }

    fn record_outgoing(&mut self, recipient: &str, tx_type: TxType, amount: i64, message: [u8; 32]) {
        let tx_hash = self.next_hash();
        self.current_block.push(TestTransaction {
            timestamp: 0,
            tx_hash,
            tx_type,
            sender: AT_ADDRESS.to_string(),
            recipient: recipient.to_string(),
            amount,
            message,
        });
    }
}

impl Api for TestApi {
    fn current_block_height(&self) -> u32 {
        self.current_height
    }

    fn put_previous_block_hash_into_a(&mut self, state: &mut MachineState) {
        let previous_height = self.current_height - 1;
        let hash = self.blockchain[previous_height as usize - 1].block_hash;
        state.set_a_bytes(&hash);
    }

    fn put_transaction_after_timestamp_into_a(
        &mut self,
        timestamp: Timestamp,
        state: &mut MachineState,
    ) {
        let mut height = timestamp.block_height.max(1);
        let mut sequence = if timestamp.block_height == 0 {
            0
        } else {
            timestamp.transaction_sequence as usize + 1
        };

        while height <= self.current_height {
            let Some(block) = self.blockchain.get(height as usize - 1) else {
                break;
            };

            match block.transactions.get(sequence) {
                None => {
                    height += 1;
                    sequence = 0;
                }
                Some(transaction) => {
                    if transaction.recipient == AT_ADDRESS {
                        let hash = transaction.tx_hash;
                        state.set_a_bytes(&hash);
                        return;
                    }
                    sequence += 1;
                }
            }
        }

        state.set_a_bytes(&[0; 32]);
    }

    fn get_type_from_transaction_in_a(&mut self, state: &mut MachineState) -> i64 {
        self.transaction_from_a(state)
            .map_or(0, |transaction| transaction.tx_type as i64)
    }

    fn get_amount_from_transaction_in_a(&mut self, state: &mut MachineState) -> i64 {
        self.transaction_from_a(state)
            .filter(|transaction| transaction.tx_type == TxType::Payment)
            .map_or(0, |transaction| transaction.amount)
    }

    fn get_timestamp_from_transaction_in_a(&mut self, state: &mut MachineState) -> i64 {
        self.transaction_from_a(state)
            .map_or(0, |transaction| transaction.timestamp)
    }

    fn generate_random_using_transaction_in_a(&mut self, state: &mut MachineState) -> i64 {
        if !state.is_first_opcode_after_sleeping() {
            // First phase: wait for the next block's entropy.
            state.set_sleeping(true);
            return 0;
        }

        ((state.get_a1() ^ 9) << 3)
            ^ ((state.get_a2() ^ 9) << 12)
            ^ ((state.get_a3() ^ 9) << 5)
            ^ (state.get_a4() ^ 9)
    }

    fn put_message_from_transaction_in_a_into_b(&mut self, state: &mut MachineState) {
        if let Some(transaction) = self.transaction_from_a(state) {
            if transaction.tx_type == TxType::Message {
                let message = transaction.message;
                state.set_b_bytes(&message);
            }
        }
    }

    fn put_address_from_transaction_in_a_into_b(&mut self, state: &mut MachineState) {
        if let Some(transaction) = self.transaction_from_a(state) {
            let sender = encode_address(&transaction.sender);
            state.set_b_bytes(&sender);
        }
    }

    fn put_creator_address_into_b(&mut self, state: &mut MachineState) {
        state.set_b_bytes(&encode_address(AT_CREATOR_ADDRESS));
    }

    fn current_balance(&self, _state: &MachineState) -> i64 {
        self.balance(AT_ADDRESS)
    }

    fn pay_amount_to_b(&mut self, amount: i64, state: &mut MachineState) {
        if amount == 0 {
            return;
        }
        let recipient = decode_address(&state.get_b_bytes());
        *self.accounts.entry(recipient.clone()).or_insert(0) += amount;
        *self.accounts.get_mut(AT_ADDRESS).unwrap() -= amount;
        self.record_outgoing(&recipient, TxType::Payment, amount, [0; 32]);
    }

    fn message_a_to_b(&mut self, state: &mut MachineState) {
        let recipient = decode_address(&state.get_b_bytes());
        let message = state.get_a_bytes();
        self.messages
            .entry(recipient.clone())
            .or_default()
            .push(message);
        self.record_outgoing(&recipient, TxType::Message, 0, message);
    }

    fn add_minutes_to_timestamp(
        &self,
        timestamp: Timestamp,
        minutes: i64,
        _state: &mut MachineState,
    ) -> Timestamp {
        let blocks = minutes * 60 / BLOCK_PERIOD_SECONDS;
        Timestamp::new(
            (timestamp.block_height as i64 + blocks).clamp(0, u32::MAX as i64) as u32,
            timestamp.transaction_sequence,
        )
    }

    fn on_finished(&mut self, amount: i64, _state: &mut MachineState) {
        if amount == 0 {
            return;
        }
        *self
            .accounts
            .entry(AT_CREATOR_ADDRESS.to_string())
            .or_insert(0) += amount;
        *self.accounts.get_mut(AT_ADDRESS).unwrap() -= amount;
        self.record_outgoing(AT_CREATOR_ADDRESS, TxType::Payment, amount, [0; 32]);
    }

    fn platform_specific_pre_execute_check(
        &self,
        param_count: usize,
        returns_value: bool,
        raw_function_code: u16,
    ) -> Result<(), ExecutionError> {
        let (required_params, returns) = match raw_function_code {
            0x0501 => (1, false),
            0x0502 => (0, true),
            _ => {
                return Err(ExecutionError::IllegalFunctionCode {
                    raw: raw_function_code,
                    reason: "unrecognised platform-specific function code".to_string(),
                })
            }
        };

        if param_count != required_params || returns_value != returns {
            return Err(ExecutionError::IllegalFunctionCode {
                raw: raw_function_code,
                reason: "platform-specific function shape mismatch".to_string(),
            });
        }

        Ok(())
    }

    fn platform_specific_post_check_execute(
        &mut self,
        function_data: &mut FunctionData,
        _state: &mut MachineState,
        raw_function_code: u16,
    ) -> Result<(), ExecutionError> {
        match raw_function_code {
            0x0501 => Ok(()),
            0x0502 => {
                function_data.return_value = Some(0x0502);
                Ok(())
            }
            _ => Err(ExecutionError::IllegalFunctionCode {
                raw: raw_function_code,
                reason: "unrecognised platform-specific function code".to_string(),
            }),
        }
    }
}
