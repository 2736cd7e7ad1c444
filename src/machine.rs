//! Machine state and single-opcode dispatch.
//!
//! [`MachineState`] owns the four byte segments (code, data, call stack, user
//! stack), the program counter, flags, checkpoints, counters, and the A/B
//! registers. [`MachineState::step`] decodes one opcode, validates its
//! operands, and dispatches to a handler. All arithmetic uses wrapping
//! semantics; divide and modulo by zero fault.
//!
//! The program counter points at the opcode byte currently being decoded;
//! branch displacements are relative to that byte. Handlers observe `pc`
//! already advanced past the full instruction and overwrite it to jump.

use crate::api::Api;
use crate::codec::{self, ADDRESS_SIZE, VALUE_SIZE};
use crate::errors::ExecutionError;
use crate::functions::{FunctionCode, FunctionData};
use crate::isa::OpCode;

/// Complete execution state of one automated transaction.
///
/// Segment sizes are fixed at creation and survive across rounds. The code
/// segment is read-only during execution.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MachineState {
    pub(crate) code: Vec<u8>,
    pub(crate) data: Vec<u8>,
    /// Call stack bytes; grows downward, entries are 32-bit code addresses.
    pub(crate) call_stack: Vec<u8>,
    /// User stack bytes; grows downward, entries are 64-bit values.
    pub(crate) user_stack: Vec<u8>,
    pub(crate) pc: u32,
    /// Byte position of the call-stack top; equals the segment length when empty.
    pub(crate) call_stack_ptr: u32,
    /// Byte position of the user-stack top; equals the segment length when empty.
    pub(crate) user_stack_ptr: u32,
    pub(crate) running: bool,
    pub(crate) sleeping: bool,
    pub(crate) stopped: bool,
    pub(crate) finished: bool,
    pub(crate) frozen: bool,
    pub(crate) had_fatal_error: bool,
    pub(crate) first_opcode_after_sleeping: bool,
    pub(crate) on_stop_address: u32,
    pub(crate) on_error_address: Option<u32>,
    pub(crate) sleep_until_height: Option<u32>,
    pub(crate) steps: u32,
    pub(crate) current_block_height: u32,
    pub(crate) creation_block_height: u32,
    pub(crate) previous_balance: i64,
    pub(crate) current_balance: i64,
    /// Balance below which the executor freezes the machine instead of
    /// running a round. Zero means "one step's fee".
    pub(crate) frozen_balance: i64,
    pub(crate) a: [i64; 4],
    pub(crate) b: [i64; 4],
}

macro_rules! dispatch_op {
    // Entry point
    (
        machine = $m:ident,
        api = $api:ident,
        op = $op:ident,
        base = $base:ident,
        cursor = $cursor:ident,
        { $( $variant:ident => $handler:ident $args:tt ),* $(,)? }
    ) => {{
        match $op {
            $(
                OpCode::$variant => {
                    dispatch_op!(@call $m, $api, $base, $cursor, $handler, $args)
                }
            )*
        }
    }};

    // Handler that reaches the host (semicolon-free marker `api;`)
    (@call $m:ident, $api:ident, $base:ident, $cursor:ident, $handler:ident,
        (api; $( $field:ident : $kind:ident ),* $(,)? )
    ) => {{
        $( let $field = dispatch_op!(@fetch $m, $cursor, $kind)?; )*
        $m.pc = $cursor;
        $m.$handler($base, $api, $( $field ),*)
    }};

    // Pure handler
    (@call $m:ident, $api:ident, $base:ident, $cursor:ident, $handler:ident,
        ( $( $field:ident : $kind:ident ),* $(,)? )
    ) => {{
        $( let $field = dispatch_op!(@fetch $m, $cursor, $kind)?; )*
        $m.pc = $cursor;
        $m.$handler($base, $( $field ),*)
    }};

    // Decode an i64 immediate
    (@fetch $m:ident, $cursor:ident, Value) => {
        codec::fetch_long(&$m.code, &mut $cursor)
    };

    // Decode a signed byte branch displacement
    (@fetch $m:ident, $cursor:ident, Offset) => {
        codec::fetch_offset(&$m.code, &mut $cursor)
    };

    // Decode a u16 function code
    (@fetch $m:ident, $cursor:ident, Func) => {
        codec::fetch_func(&$m.code, &mut $cursor)
    };

    // Decode a code address, validated against the code segment
    (@fetch $m:ident, $cursor:ident, CodeAddr) => {
        codec::fetch_code_address(&$m.code, &mut $cursor, $m.code.len())
    };

    // Every remaining kind is a data-cell index, validated against the data
    // segment and converted to a byte offset
    (@fetch $m:ident, $cursor:ident, $kind:ident) => {
        codec::fetch_data_address(&$m.code, &mut $cursor, $m.data.len())
    };
}

impl MachineState {
    /// Builds a fresh machine around pre-sized segments.
    ///
    /// Stacks start empty, flags cleared, registers zeroed.
    pub(crate) fn from_segments(
        code: Vec<u8>,
        data: Vec<u8>,
        call_stack_size: u32,
        user_stack_size: u32,
        creation_block_height: u32,
    ) -> Self {
        Self {
            code,
            data,
            call_stack: vec![0; call_stack_size as usize],
            user_stack: vec![0; user_stack_size as usize],
            pc: 0,
            call_stack_ptr: call_stack_size,
            user_stack_ptr: user_stack_size,
            running: false,
            sleeping: false,
            stopped: false,
            finished: false,
            frozen: false,
            had_fatal_error: false,
            first_opcode_after_sleeping: false,
            on_stop_address: 0,
            on_error_address: None,
            sleep_until_height: None,
            steps: 0,
            current_block_height: 0,
            creation_block_height,
            previous_balance: 0,
            current_balance: 0,
            frozen_balance: 0,
            a: [0; 4],
            b: [0; 4],
        }
    }

    // ==================== Flags and checkpoints ====================

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_sleeping(&self) -> bool {
        self.sleeping
    }

    /// Marks the machine sleeping. When no sleep-until height is set the
    /// machine wakes on the next round, re-executing the current opcode if a
    /// host function initiated the sleep.
    pub fn set_sleeping(&mut self, sleeping: bool) {
        self.sleeping = sleeping;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn set_stopped(&mut self, stopped: bool) {
        self.stopped = stopped;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn set_finished(&mut self, finished: bool) {
        self.finished = finished;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn set_frozen(&mut self, frozen: bool) {
        self.frozen = frozen;
    }

    pub fn had_fatal_error(&self) -> bool {
        self.had_fatal_error
    }

    pub(crate) fn set_had_fatal_error(&mut self, value: bool) {
        self.had_fatal_error = value;
    }

    /// True only while executing the first opcode after waking from sleep.
    /// Two-phase host functions consult this to detect their second phase.
    pub fn is_first_opcode_after_sleeping(&self) -> bool {
        self.first_opcode_after_sleeping
    }

    pub(crate) fn clear_first_opcode_after_sleeping(&mut self) {
        self.first_opcode_after_sleeping = false;
    }

    pub fn set_on_stop_address(&mut self, address: u32) {
        self.on_stop_address = address;
    }

    pub fn on_stop_address(&self) -> u32 {
        self.on_stop_address
    }

    pub fn set_on_error_address(&mut self, address: Option<u32>) {
        self.on_error_address = address;
    }

    pub fn on_error_address(&self) -> Option<u32> {
        self.on_error_address
    }

    pub fn set_sleep_until_height(&mut self, height: Option<u32>) {
        self.sleep_until_height = height;
    }

    pub fn sleep_until_height(&self) -> Option<u32> {
        self.sleep_until_height
    }

    /// Clears sleep state and arms the first-opcode-after-sleeping flag.
    pub(crate) fn wake(&mut self) {
        self.sleeping = false;
        self.sleep_until_height = None;
        self.first_opcode_after_sleeping = true;
    }

    /// Yields the round, resuming at the current PC next block.
    pub(crate) fn auto_yield(&mut self) {
        self.sleeping = true;
        self.sleep_until_height = Some(self.current_block_height.saturating_add(1));
    }

    pub(crate) fn set_running(&mut self, running: bool) {
        self.running = running;
    }

    // ==================== Counters and balances ====================

    pub fn program_counter(&self) -> u32 {
        self.pc
    }

    pub(crate) fn set_pc(&mut self, pc: u32) {
        self.pc = pc;
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    pub(crate) fn reset_steps(&mut self) {
        self.steps = 0;
    }

    pub(crate) fn add_steps(&mut self, steps: u32) {
        self.steps = self.steps.saturating_add(steps);
    }

    pub fn current_block_height(&self) -> u32 {
        self.current_block_height
    }

    pub(crate) fn set_current_block_height(&mut self, height: u32) {
        self.current_block_height = height;
    }

    pub fn creation_block_height(&self) -> u32 {
        self.creation_block_height
    }

    pub fn get_current_balance(&self) -> i64 {
        self.current_balance
    }

    pub fn set_current_balance(&mut self, balance: i64) {
        self.current_balance = balance;
    }

    pub fn get_previous_balance(&self) -> i64 {
        self.previous_balance
    }

    pub(crate) fn set_previous_balance(&mut self, balance: i64) {
        self.previous_balance = balance;
    }

    /// Freeze threshold; zero selects the host's per-step fee.
    pub fn frozen_balance(&self) -> i64 {
        self.frozen_balance
    }

    pub fn set_frozen_balance(&mut self, threshold: i64) {
        self.frozen_balance = threshold;
    }

    // ==================== A/B registers ====================

    pub fn get_a1(&self) -> i64 {
        self.a[0]
    }

    pub fn get_a2(&self) -> i64 {
        self.a[1]
    }

    pub fn get_a3(&self) -> i64 {
        self.a[2]
    }

    pub fn get_a4(&self) -> i64 {
        self.a[3]
    }

    pub fn get_b1(&self) -> i64 {
        self.b[0]
    }

    pub fn get_b2(&self) -> i64 {
        self.b[1]
    }

    pub fn get_b3(&self) -> i64 {
        self.b[2]
    }

    pub fn get_b4(&self) -> i64 {
        self.b[3]
    }

    pub fn set_a1(&mut self, value: i64) {
        self.a[0] = value;
    }

    pub fn set_a2(&mut self, value: i64) {
        self.a[1] = value;
    }

    pub fn set_a3(&mut self, value: i64) {
        self.a[2] = value;
    }

    pub fn set_a4(&mut self, value: i64) {
        self.a[3] = value;
    }

    pub fn set_b1(&mut self, value: i64) {
        self.b[0] = value;
    }

    pub fn set_b2(&mut self, value: i64) {
        self.b[1] = value;
    }

    pub fn set_b3(&mut self, value: i64) {
        self.b[2] = value;
    }

    pub fn set_b4(&mut self, value: i64) {
        self.b[3] = value;
    }

    /// Returns A as 32 bytes, cells in order, each big-endian.
    pub fn get_a_bytes(&self) -> [u8; 32] {
        register_bytes(&self.a)
    }

    /// Returns B as 32 bytes, cells in order, each big-endian.
    pub fn get_b_bytes(&self) -> [u8; 32] {
        register_bytes(&self.b)
    }

    pub fn set_a_bytes(&mut self, bytes: &[u8; 32]) {
        self.a = register_cells(bytes);
    }

    pub fn set_b_bytes(&mut self, bytes: &[u8; 32]) {
        self.b = register_cells(bytes);
    }

    // ==================== Data segment access ====================

    /// Reads the data cell at the given index, bounds-checked.
    pub fn get_data_long(&self, index: i64) -> Result<i64, ExecutionError> {
        let offset = codec::check_cell_index(index, self.data.len())?;
        Ok(self.read_long(offset))
    }

    /// Writes the data cell at the given index, bounds-checked.
    pub fn put_data_long(&mut self, index: i64, value: i64) -> Result<(), ExecutionError> {
        let offset = codec::check_cell_index(index, self.data.len())?;
        self.write_long(offset, value);
        Ok(())
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    fn read_long(&self, offset: u32) -> i64 {
        let offset = offset as usize;
        i64::from_be_bytes(self.data[offset..offset + VALUE_SIZE].try_into().unwrap())
    }

    fn write_long(&mut self, offset: u32, value: i64) {
        let offset = offset as usize;
        self.data[offset..offset + VALUE_SIZE].copy_from_slice(&value.to_be_bytes());
    }

    /// Validates a 32-byte register window starting at the given cell index
    /// and returns its byte offset.
    fn register_window(&self, index: i64) -> Result<usize, ExecutionError> {
        let offset = codec::check_cell_index(index, self.data.len())?;
        let end = offset as usize + AB_CELLS * VALUE_SIZE;
        if end > self.data.len() {
            return Err(ExecutionError::InvalidAddress {
                offset: offset as i64,
                limit: self.data.len() as u32,
            });
        }
        Ok(offset as usize)
    }

    /// Loads A from four consecutive data cells starting at `index`.
    pub(crate) fn load_a_from_cells(&mut self, index: i64) -> Result<(), ExecutionError> {
        let offset = self.register_window(index)?;
        for limb in 0..AB_CELLS {
            self.a[limb] = self.read_long((offset + limb * VALUE_SIZE) as u32);
        }
        Ok(())
    }

    /// Loads B from four consecutive data cells starting at `index`.
    pub(crate) fn load_b_from_cells(&mut self, index: i64) -> Result<(), ExecutionError> {
        let offset = self.register_window(index)?;
        for limb in 0..AB_CELLS {
            self.b[limb] = self.read_long((offset + limb * VALUE_SIZE) as u32);
        }
        Ok(())
    }

    /// Stores A into four consecutive data cells starting at `index`.
    pub(crate) fn store_a_to_cells(&mut self, index: i64) -> Result<(), ExecutionError> {
        let offset = self.register_window(index)?;
        for limb in 0..AB_CELLS {
            self.write_long((offset + limb * VALUE_SIZE) as u32, self.a[limb]);
        }
        Ok(())
    }

    /// Stores B into four consecutive data cells starting at `index`.
    pub(crate) fn store_b_to_cells(&mut self, index: i64) -> Result<(), ExecutionError> {
        let offset = self.register_window(index)?;
        for limb in 0..AB_CELLS {
            self.write_long((offset + limb * VALUE_SIZE) as u32, self.b[limb]);
        }
        Ok(())
    }

    // ==================== Stacks ====================

    fn push_user(&mut self, value: i64) -> Result<(), ExecutionError> {
        if (self.user_stack_ptr as usize) < VALUE_SIZE {
            return Err(ExecutionError::StackBounds {
                reason: "no room on user stack to push data",
            });
        }
        self.user_stack_ptr -= VALUE_SIZE as u32;
        let at = self.user_stack_ptr as usize;
        self.user_stack[at..at + VALUE_SIZE].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    fn pop_user(&mut self) -> Result<i64, ExecutionError> {
        let at = self.user_stack_ptr as usize;
        if at + VALUE_SIZE > self.user_stack.len() {
            return Err(ExecutionError::StackBounds {
                reason: "empty user stack from which to pop data",
            });
        }
        let value = i64::from_be_bytes(self.user_stack[at..at + VALUE_SIZE].try_into().unwrap());
        // Clear the vacated slot
        self.user_stack[at..at + VALUE_SIZE].fill(0);
        self.user_stack_ptr += VALUE_SIZE as u32;
        Ok(value)
    }

    fn push_call(&mut self, address: u32) -> Result<(), ExecutionError> {
        if (self.call_stack_ptr as usize) < ADDRESS_SIZE {
            return Err(ExecutionError::StackBounds {
                reason: "no room on call stack to call subroutine",
            });
        }
        self.call_stack_ptr -= ADDRESS_SIZE as u32;
        let at = self.call_stack_ptr as usize;
        self.call_stack[at..at + ADDRESS_SIZE].copy_from_slice(&address.to_be_bytes());
        Ok(())
    }

    fn pop_call(&mut self) -> Result<u32, ExecutionError> {
        let at = self.call_stack_ptr as usize;
        if at + ADDRESS_SIZE > self.call_stack.len() {
            return Err(ExecutionError::StackBounds {
                reason: "empty call stack missing return address",
            });
        }
        let address = u32::from_be_bytes(self.call_stack[at..at + ADDRESS_SIZE].try_into().unwrap());
        // Clear the vacated slot
        self.call_stack[at..at + ADDRESS_SIZE].fill(0);
        self.call_stack_ptr += ADDRESS_SIZE as u32;
        Ok(address)
    }

    // ==================== Decode and dispatch ====================

    /// Decodes the opcode at the current PC without consuming it.
    pub(crate) fn peek_opcode(&self) -> Result<OpCode, ExecutionError> {
        let byte = *self
            .code
            .get(self.pc as usize)
            .ok_or(ExecutionError::CodeUnderflow {
                offset: self.pc,
                wanted: 1,
                limit: self.code.len() as u32,
            })?;
        OpCode::try_from(byte).map_err(|_| ExecutionError::InvalidOpCode {
            opcode: byte,
            offset: self.pc,
        })
    }

    /// Advances the machine by exactly one opcode.
    ///
    /// Operands are validated during decode; a fault leaves the PC at the
    /// faulting opcode. On success the PC has moved past the instruction
    /// unless the opcode was a jump, branch, call, return, or a host
    /// function that put the machine to sleep.
    pub fn step<A: Api>(&mut self, api: &mut A) -> Result<(), ExecutionError> {
        let base = self.pc;
        let mut cursor = self.pc;
        let op = self.peek_opcode()?;
        cursor += 1;

        dispatch_op! {
            machine = self,
            api = api,
            op = op,
            base = base,
            cursor = cursor,
            {
                Nop => op_nop(),
                // Moves and immediates
                SetVal => op_set_val(dst: DestAddr, value: Value),
                SetDat => op_set_dat(dst: DestAddr, src: SrcAddr),
                ClrDat => op_clr_dat(dst: DestAddr),
                IncDat => op_inc_dat(dst: DestAddr),
                DecDat => op_dec_dat(dst: DestAddr),
                // Data arithmetic
                AddDat => op_add_dat(dst: DestAddr, src: SrcAddr),
                SubDat => op_sub_dat(dst: DestAddr, src: SrcAddr),
                MulDat => op_mul_dat(dst: DestAddr, src: SrcAddr),
                DivDat => op_div_dat(dst: DestAddr, src: SrcAddr),
                ModDat => op_mod_dat(dst: DestAddr, src: SrcAddr),
                // Bitwise
                BorDat => op_bor_dat(dst: DestAddr, src: SrcAddr),
                AndDat => op_and_dat(dst: DestAddr, src: SrcAddr),
                XorDat => op_xor_dat(dst: DestAddr, src: SrcAddr),
                NotDat => op_not_dat(dst: DestAddr),
                ShlDat => op_shl_dat(dst: DestAddr, src: SrcAddr),
                ShrDat => op_shr_dat(dst: DestAddr, src: SrcAddr),
                // Indirect
                SetInd => op_set_ind(dst: DestAddr, src: IndirectSrcAddr),
                SetIdx => op_set_idx(dst: DestAddr, src: IndirectSrcAddrWithIndex, index: Index),
                IndDat => op_ind_dat(dst: IndirectDestAddr, src: SrcAddr),
                IdxDat => op_idx_dat(dst: IndirectDestAddrWithIndex, index: Index, src: SrcAddr),
                // Stacks, calls, jumps
                PshDat => op_psh_dat(src: SrcAddr),
                PopDat => op_pop_dat(dst: DestAddr),
                JmpSub => op_jmp_sub(target: CodeAddr),
                RetSub => op_ret_sub(),
                JmpAdr => op_jmp_adr(target: CodeAddr),
                // Branches
                BzrDat => op_bzr_dat(src: SrcAddr, offset: Offset),
                BnzDat => op_bnz_dat(src: SrcAddr, offset: Offset),
                BgtDat => op_bgt_dat(a: SrcAddr, b: SrcAddr, offset: Offset),
                BltDat => op_blt_dat(a: SrcAddr, b: SrcAddr, offset: Offset),
                BgeDat => op_bge_dat(a: SrcAddr, b: SrcAddr, offset: Offset),
                BleDat => op_ble_dat(a: SrcAddr, b: SrcAddr, offset: Offset),
                BeqDat => op_beq_dat(a: SrcAddr, b: SrcAddr, offset: Offset),
                BneDat => op_bne_dat(a: SrcAddr, b: SrcAddr, offset: Offset),
                // Lifecycle
                SlpDat => op_slp_dat(height: BlockHeight),
                FizDat => op_fiz_dat(src: SrcAddr),
                StzDat => op_stz_dat(src: SrcAddr),
                FinImd => op_fin_imd(),
                StpImd => op_stp_imd(),
                SlpImd => op_slp_imd(),
                ErrAdr => op_err_adr(target: CodeAddr),
                SlpVal => op_slp_val(value: Value),
                SetPcs => op_set_pcs(),
                // External functions
                ExtFun => op_ext_fun(api; func: Func),
                ExtFunDat => op_ext_fun_dat(api; func: Func, src: SrcAddr),
                ExtFunDat2 => op_ext_fun_dat_2(api; func: Func, src1: SrcAddr, src2: SrcAddr),
                ExtFunRet => op_ext_fun_ret(api; func: Func, dst: DestAddr),
                ExtFunRetDat => op_ext_fun_ret_dat(api; func: Func, dst: DestAddr, src: SrcAddr),
                ExtFunRetDat2 => op_ext_fun_ret_dat_2(api; func: Func, dst: DestAddr, src1: SrcAddr, src2: SrcAddr),
                ExtFunVal => op_ext_fun_val(api; func: Func, value: Value),
                // Immediate arithmetic
                AddVal => op_add_val(dst: DestAddr, value: Value),
                SubVal => op_sub_val(dst: DestAddr, value: Value),
                MulVal => op_mul_val(dst: DestAddr, value: Value),
                DivVal => op_div_val(dst: DestAddr, value: Value),
                ShlVal => op_shl_val(dst: DestAddr, value: Value),
                ShrVal => op_shr_val(dst: DestAddr, value: Value),
            }
        }
    }

    // ==================== Shared handler helpers ====================

    fn data_op(&mut self, dst: u32, rhs: i64, f: fn(i64, i64) -> i64) {
        let value = f(self.read_long(dst), rhs);
        self.write_long(dst, value);
    }

    fn branch_target(&self, base: u32, offset: i8) -> Result<u32, ExecutionError> {
        let target = base as i64 + offset as i64;
        if target < 0 || target >= self.code.len() as i64 {
            return Err(ExecutionError::InvalidAddress {
                offset: target,
                limit: self.code.len() as u32,
            });
        }
        Ok(target as u32)
    }

    fn branch_if(
        &mut self,
        base: u32,
        a: u32,
        b: u32,
        offset: i8,
        cmp: fn(i64, i64) -> bool,
    ) -> Result<(), ExecutionError> {
        let target = self.branch_target(base, offset)?;
        if cmp(self.read_long(a), self.read_long(b)) {
            self.pc = target;
        }
        Ok(())
    }

    fn clamp_height(value: i64) -> u32 {
        value.clamp(0, u32::MAX as i64) as u32
    }

    // ==================== Opcode handlers ====================

    fn op_nop(&mut self, _base: u32) -> Result<(), ExecutionError> {
        Ok(())
    }

    fn op_set_val(&mut self, _base: u32, dst: u32, value: i64) -> Result<(), ExecutionError> {
        self.write_long(dst, value);
        Ok(())
    }

    fn op_set_dat(&mut self, _base: u32, dst: u32, src: u32) -> Result<(), ExecutionError> {
        let value = self.read_long(src);
        self.write_long(dst, value);
        Ok(())
    }

    fn op_clr_dat(&mut self, _base: u32, dst: u32) -> Result<(), ExecutionError> {
        self.write_long(dst, 0);
        Ok(())
    }

    fn op_inc_dat(&mut self, _base: u32, dst: u32) -> Result<(), ExecutionError> {
        let value = self.read_long(dst).wrapping_add(1);
        self.write_long(dst, value);
        Ok(())
    }

    fn op_dec_dat(&mut self, _base: u32, dst: u32) -> Result<(), ExecutionError> {
        let value = self.read_long(dst).wrapping_sub(1);
        self.write_long(dst, value);
        Ok(())
    }

    fn op_add_dat(&mut self, _base: u32, dst: u32, src: u32) -> Result<(), ExecutionError> {
        let rhs = self.read_long(src);
        self.data_op(dst, rhs, i64::wrapping_add);
        Ok(())
    }

    fn op_sub_dat(&mut self, _base: u32, dst: u32, src: u32) -> Result<(), ExecutionError> {
        let rhs = self.read_long(src);
        self.data_op(dst, rhs, i64::wrapping_sub);
        Ok(())
    }

    fn op_mul_dat(&mut self, _base: u32, dst: u32, src: u32) -> Result<(), ExecutionError> {
        let rhs = self.read_long(src);
        self.data_op(dst, rhs, i64::wrapping_mul);
        Ok(())
    }

    fn op_div_dat(&mut self, _base: u32, dst: u32, src: u32) -> Result<(), ExecutionError> {
        let rhs = self.read_long(src);
        if rhs == 0 {
            return Err(ExecutionError::IllegalOperation {
                reason: "divide by zero",
            });
        }
        self.data_op(dst, rhs, i64::wrapping_div);
        Ok(())
    }

    fn op_mod_dat(&mut self, _base: u32, dst: u32, src: u32) -> Result<(), ExecutionError> {
        let rhs = self.read_long(src);
        if rhs == 0 {
            return Err(ExecutionError::IllegalOperation {
                reason: "modulo by zero",
            });
        }
        self.data_op(dst, rhs, i64::wrapping_rem);
        Ok(())
    }

    fn op_bor_dat(&mut self, _base: u32, dst: u32, src: u32) -> Result<(), ExecutionError> {
        let rhs = self.read_long(src);
        self.data_op(dst, rhs, |a, b| a | b);
        Ok(())
    }

    fn op_and_dat(&mut self, _base: u32, dst: u32, src: u32) -> Result<(), ExecutionError> {
        let rhs = self.read_long(src);
        self.data_op(dst, rhs, |a, b| a & b);
        Ok(())
    }

    fn op_xor_dat(&mut self, _base: u32, dst: u32, src: u32) -> Result<(), ExecutionError> {
        let rhs = self.read_long(src);
        self.data_op(dst, rhs, |a, b| a ^ b);
        Ok(())
    }

    fn op_not_dat(&mut self, _base: u32, dst: u32) -> Result<(), ExecutionError> {
        let value = !self.read_long(dst);
        self.write_long(dst, value);
        Ok(())
    }

    fn op_shl_dat(&mut self, _base: u32, dst: u32, src: u32) -> Result<(), ExecutionError> {
        let rhs = self.read_long(src);
        self.data_op(dst, rhs, shl_value);
        Ok(())
    }

    fn op_shr_dat(&mut self, _base: u32, dst: u32, src: u32) -> Result<(), ExecutionError> {
        let rhs = self.read_long(src);
        self.data_op(dst, rhs, shr_value);
        Ok(())
    }

    fn op_set_ind(&mut self, _base: u32, dst: u32, src: u32) -> Result<(), ExecutionError> {
        let index = self.read_long(src);
        let from = codec::check_cell_index(index, self.data.len())?;
        let value = self.read_long(from);
        self.write_long(dst, value);
        Ok(())
    }

    fn op_set_idx(
        &mut self,
        _base: u32,
        dst: u32,
        src: u32,
        index: u32,
    ) -> Result<(), ExecutionError> {
        let from = self.indexed_cell(src, index)?;
        let value = self.read_long(from);
        self.write_long(dst, value);
        Ok(())
    }

    fn op_ind_dat(&mut self, _base: u32, dst: u32, src: u32) -> Result<(), ExecutionError> {
        let index = self.read_long(dst);
        let to = codec::check_cell_index(index, self.data.len())?;
        let value = self.read_long(src);
        self.write_long(to, value);
        Ok(())
    }

    fn op_idx_dat(
        &mut self,
        _base: u32,
        dst: u32,
        index: u32,
        src: u32,
    ) -> Result<(), ExecutionError> {
        let to = self.indexed_cell(dst, index)?;
        let value = self.read_long(src);
        self.write_long(to, value);
        Ok(())
    }

    /// Resolves `$base_cell + $index_cell` to a validated byte offset.
    fn indexed_cell(&self, base_addr: u32, index_addr: u32) -> Result<u32, ExecutionError> {
        let base_index = self.read_long(base_addr);
        let offset_index = self.read_long(index_addr);
        let cell = base_index
            .checked_add(offset_index)
            .ok_or(ExecutionError::InvalidAddress {
                offset: i64::MAX,
                limit: self.data.len() as u32,
            })?;
        codec::check_cell_index(cell, self.data.len())
    }

    fn op_psh_dat(&mut self, _base: u32, src: u32) -> Result<(), ExecutionError> {
        let value = self.read_long(src);
        self.push_user(value)
    }

    fn op_pop_dat(&mut self, _base: u32, dst: u32) -> Result<(), ExecutionError> {
        let value = self.pop_user()?;
        self.write_long(dst, value);
        Ok(())
    }

    fn op_jmp_sub(&mut self, _base: u32, target: u32) -> Result<(), ExecutionError> {
        self.push_call(self.pc)?;
        self.pc = target;
        Ok(())
    }

    fn op_ret_sub(&mut self, _base: u32) -> Result<(), ExecutionError> {
        self.pc = self.pop_call()?;
        Ok(())
    }

    fn op_jmp_adr(&mut self, _base: u32, target: u32) -> Result<(), ExecutionError> {
        self.pc = target;
        Ok(())
    }

    fn op_bzr_dat(&mut self, base: u32, src: u32, offset: i8) -> Result<(), ExecutionError> {
        let target = self.branch_target(base, offset)?;
        if self.read_long(src) == 0 {
            self.pc = target;
        }
        Ok(())
    }

    fn op_bnz_dat(&mut self, base: u32, src: u32, offset: i8) -> Result<(), ExecutionError> {
        let target = self.branch_target(base, offset)?;
        if self.read_long(src) != 0 {
            self.pc = target;
        }
        Ok(())
    }

    fn op_bgt_dat(&mut self, base: u32, a: u32, b: u32, offset: i8) -> Result<(), ExecutionError> {
        self.branch_if(base, a, b, offset, |a, b| a > b)
    }

    fn op_blt_dat(&mut self, base: u32, a: u32, b: u32, offset: i8) -> Result<(), ExecutionError> {
        self.branch_if(base, a, b, offset, |a, b| a < b)
    }

    fn op_bge_dat(&mut self, base: u32, a: u32, b: u32, offset: i8) -> Result<(), ExecutionError> {
        self.branch_if(base, a, b, offset, |a, b| a >= b)
    }

    fn op_ble_dat(&mut self, base: u32, a: u32, b: u32, offset: i8) -> Result<(), ExecutionError> {
        self.branch_if(base, a, b, offset, |a, b| a <= b)
    }

    fn op_beq_dat(&mut self, base: u32, a: u32, b: u32, offset: i8) -> Result<(), ExecutionError> {
        self.branch_if(base, a, b, offset, |a, b| a == b)
    }

    fn op_bne_dat(&mut self, base: u32, a: u32, b: u32, offset: i8) -> Result<(), ExecutionError> {
        self.branch_if(base, a, b, offset, |a, b| a != b)
    }

    fn op_slp_dat(&mut self, _base: u32, height: u32) -> Result<(), ExecutionError> {
        let value = self.read_long(height);
        self.sleep_until_height = Some(Self::clamp_height(value));
        self.sleeping = true;
        Ok(())
    }

    fn op_fiz_dat(&mut self, _base: u32, src: u32) -> Result<(), ExecutionError> {
        if self.read_long(src) == 0 {
            self.finished = true;
        }
        Ok(())
    }

    fn op_stz_dat(&mut self, _base: u32, src: u32) -> Result<(), ExecutionError> {
        if self.read_long(src) == 0 {
            self.pc = self.on_stop_address;
            self.stopped = true;
        }
        Ok(())
    }

    fn op_fin_imd(&mut self, _base: u32) -> Result<(), ExecutionError> {
        self.finished = true;
        Ok(())
    }

    fn op_stp_imd(&mut self, _base: u32) -> Result<(), ExecutionError> {
        self.pc = self.on_stop_address;
        self.stopped = true;
        Ok(())
    }

    fn op_slp_imd(&mut self, _base: u32) -> Result<(), ExecutionError> {
        self.sleep_until_height = Some(self.current_block_height.saturating_add(1));
        self.sleeping = true;
        Ok(())
    }

    fn op_err_adr(&mut self, _base: u32, target: u32) -> Result<(), ExecutionError> {
        self.on_error_address = Some(target);
        Ok(())
    }

    fn op_slp_val(&mut self, _base: u32, value: i64) -> Result<(), ExecutionError> {
        let blocks = Self::clamp_height(value);
        self.sleep_until_height = Some(self.current_block_height.saturating_add(blocks));
        self.sleeping = true;
        Ok(())
    }

    fn op_set_pcs(&mut self, _base: u32) -> Result<(), ExecutionError> {
        self.on_stop_address = self.pc;
        Ok(())
    }

    // ==================== External-function handlers ====================

    fn function_for(&self, raw: u16) -> Result<FunctionCode, ExecutionError> {
        FunctionCode::lookup(raw).ok_or_else(|| ExecutionError::IllegalFunctionCode {
            raw,
            reason: "unknown function code".to_string(),
        })
    }

    /// Host functions may put the machine to sleep; the opcode is then
    /// re-executed on wake-up.
    fn rewound_for_sleep(&mut self, base: u32) -> bool {
        if self.sleeping {
            self.pc = base;
        }
        self.sleeping
    }

    fn call_function<A: Api>(
        &mut self,
        base: u32,
        api: &mut A,
        raw: u16,
        data: &mut FunctionData,
    ) -> Result<bool, ExecutionError> {
        let function = self.function_for(raw)?;
        function.pre_execute_check(api, data.param_count(), data.returns_value, raw)?;
        function.execute(data, self, api, raw)?;
        Ok(self.rewound_for_sleep(base))
    }

    fn op_ext_fun<A: Api>(&mut self, base: u32, api: &mut A, func: u16) -> Result<(), ExecutionError> {
        let mut data = FunctionData::with_no_args(false);
        self.call_function(base, api, func, &mut data)?;
        Ok(())
    }

    fn op_ext_fun_dat<A: Api>(
        &mut self,
        base: u32,
        api: &mut A,
        func: u16,
        src: u32,
    ) -> Result<(), ExecutionError> {
        let mut data = FunctionData::with_one_arg(self.read_long(src), false);
        self.call_function(base, api, func, &mut data)?;
        Ok(())
    }

    fn op_ext_fun_dat_2<A: Api>(
        &mut self,
        base: u32,
        api: &mut A,
        func: u16,
        src1: u32,
        src2: u32,
    ) -> Result<(), ExecutionError> {
        let mut data =
            FunctionData::with_two_args(self.read_long(src1), self.read_long(src2), false);
        self.call_function(base, api, func, &mut data)?;
        Ok(())
    }

    fn op_ext_fun_val<A: Api>(
        &mut self,
        base: u32,
        api: &mut A,
        func: u16,
        value: i64,
    ) -> Result<(), ExecutionError> {
        let mut data = FunctionData::with_one_arg(value, false);
        self.call_function(base, api, func, &mut data)?;
        Ok(())
    }

    fn finish_returning_call(
        &mut self,
        raw: u16,
        dst: u32,
        data: FunctionData,
    ) -> Result<(), ExecutionError> {
        let value = data
            .return_value
            .ok_or_else(|| ExecutionError::IllegalFunctionCode {
                raw,
                reason: "function returned no value".to_string(),
            })?;
        self.write_long(dst, value);
        Ok(())
    }

    fn op_ext_fun_ret<A: Api>(
        &mut self,
        base: u32,
        api: &mut A,
        func: u16,
        dst: u32,
    ) -> Result<(), ExecutionError> {
        let mut data = FunctionData::with_no_args(true);
        if self.call_function(base, api, func, &mut data)? {
            return Ok(());
        }
        self.finish_returning_call(func, dst, data)
    }

    fn op_ext_fun_ret_dat<A: Api>(
        &mut self,
        base: u32,
        api: &mut A,
        func: u16,
        dst: u32,
        src: u32,
    ) -> Result<(), ExecutionError> {
        let mut data = FunctionData::with_one_arg(self.read_long(src), true);
        if self.call_function(base, api, func, &mut data)? {
            return Ok(());
        }
        self.finish_returning_call(func, dst, data)
    }

    fn op_ext_fun_ret_dat_2<A: Api>(
        &mut self,
        base: u32,
        api: &mut A,
        func: u16,
        dst: u32,
        src1: u32,
        src2: u32,
    ) -> Result<(), ExecutionError> {
        let mut data =
            FunctionData::with_two_args(self.read_long(src1), self.read_long(src2), true);
        if self.call_function(base, api, func, &mut data)? {
            return Ok(());
        }
        self.finish_returning_call(func, dst, data)
    }

    // ==================== Immediate arithmetic handlers ====================

    fn op_add_val(&mut self, _base: u32, dst: u32, value: i64) -> Result<(), ExecutionError> {
        self.data_op(dst, value, i64::wrapping_add);
        Ok(())
    }

    fn op_sub_val(&mut self, _base: u32, dst: u32, value: i64) -> Result<(), ExecutionError> {
        self.data_op(dst, value, i64::wrapping_sub);
        Ok(())
    }

    fn op_mul_val(&mut self, _base: u32, dst: u32, value: i64) -> Result<(), ExecutionError> {
        self.data_op(dst, value, i64::wrapping_mul);
        Ok(())
    }

    fn op_div_val(&mut self, _base: u32, dst: u32, value: i64) -> Result<(), ExecutionError> {
        if value == 0 {
            return Err(ExecutionError::IllegalOperation {
                reason: "divide by zero",
            });
        }
        self.data_op(dst, value, i64::wrapping_div);
        Ok(())
    }

    fn op_shl_val(&mut self, _base: u32, dst: u32, value: i64) -> Result<(), ExecutionError> {
        self.data_op(dst, value, shl_value);
        Ok(())
    }

    fn op_shr_val(&mut self, _base: u32, dst: u32, value: i64) -> Result<(), ExecutionError> {
        self.data_op(dst, value, shr_value);
        Ok(())
    }
}

const AB_CELLS: usize = codec::AB_REGISTER_SIZE / VALUE_SIZE;

fn register_bytes(cells: &[i64; 4]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (limb, value) in cells.iter().enumerate() {
        out[limb * VALUE_SIZE..(limb + 1) * VALUE_SIZE].copy_from_slice(&value.to_be_bytes());
    }
    out
}

fn register_cells(bytes: &[u8; 32]) -> [i64; 4] {
    let mut cells = [0i64; 4];
    for (limb, cell) in cells.iter_mut().enumerate() {
        *cell = i64::from_be_bytes(
            bytes[limb * VALUE_SIZE..(limb + 1) * VALUE_SIZE]
                .try_into()
                .unwrap(),
        );
    }
    cells
}

/// Shift amounts of 64 or more drain every bit.
fn shl_value(a: i64, b: i64) -> i64 {
    if b >= 64 {
        0
    } else {
        ((a as u64).wrapping_shl(b as u32)) as i64
    }
}

fn shr_value(a: i64, b: i64) -> i64 {
    if b >= 64 {
        0
    } else {
        ((a as u64).wrapping_shr(b as u32)) as i64
    }
}
