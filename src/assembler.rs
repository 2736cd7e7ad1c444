//! Instruction text to bytecode compilation, and back.
//!
//! Converts a human-readable listing into executable code bytes and
//! disassembles code bytes into the same listing. The operand syntax is
//! chosen so that `assemble(disassemble(code)) == code` for any code the
//! disassembler accepts.
//!
//! # Syntax
//!
//! ```text
//! MNEMONIC operand1, operand2, ...  ; optional comment
//! ```
//!
//! - Mnemonics are uppercase (e.g. `SET_VAL`, `BZR_DAT`)
//! - `#` prefixes a 64-bit immediate in hex (e.g. `#000000000000007b`)
//! - `@` prefixes a written data cell index in hex (e.g. `@00000002`)
//! - `$` prefixes a read data cell index in hex (e.g. `$00000003`)
//! - `[...]` wraps a code address in hex (e.g. `[0004]`)
//! - Branch displacements are signed decimal (e.g. `+12`, `-5`)
//! - Functions are core mnemonics (e.g. `SWAP_A_AND_B`) or `FN(hex)`
//! - Comments start with `;`
//! - Commas between operands are optional
//!
//! Invoking a core function by mnemonic validates the opcode's shape
//! against the function declaration at compile time; the raw `FN(hex)`
//! form is passed through unchecked and faults at execute time instead.

use crate::errors::{CompilationError, ExecutionError};
use crate::functions::{FunctionCode, API_PASSTHROUGH_BASE};
use crate::isa::{OpCode, ParamKind};

/// Computes the signed-byte displacement from `position` to `target`.
pub fn calc_offset(position: u32, target: u32) -> Result<i8, CompilationError> {
    let offset = target as i64 - position as i64;
    if offset < i8::MIN as i64 || offset > i8::MAX as i64 {
        return Err(CompilationError::OffsetTooWide { offset, position });
    }
    Ok(offset as i8)
}

/// Invocation shape of an external-function opcode: argument count and
/// whether a return value is stored.
fn call_shape(op: OpCode) -> Option<(usize, bool)> {
    match op {
        OpCode::ExtFun => Some((0, false)),
        OpCode::ExtFunDat | OpCode::ExtFunVal => Some((1, false)),
        OpCode::ExtFunDat2 => Some((2, false)),
        OpCode::ExtFunRet => Some((0, true)),
        OpCode::ExtFunRetDat => Some((1, true)),
        OpCode::ExtFunRetDat2 => Some((2, true)),
        _ => None,
    }
}

fn tokenize(line: &str) -> Vec<&str> {
    let line = line.split(';').next().unwrap_or("");
    line.split([' ', '\t', ','])
        .filter(|token| !token.is_empty())
        .collect()
}

fn invalid_operand(line: usize, expected: &'static str, token: &str) -> CompilationError {
    CompilationError::InvalidOperand {
        line,
        expected,
        token: token.to_string(),
    }
}

fn parse_hex_u32(
    line: usize,
    expected: &'static str,
    digits: &str,
) -> Result<u32, CompilationError> {
    if digits.is_empty() || digits.len() > 8 {
        return Err(invalid_operand(line, expected, digits));
    }
    u32::from_str_radix(digits, 16).map_err(|_| invalid_operand(line, expected, digits))
}

fn parse_value(line: usize, token: &str) -> Result<i64, CompilationError> {
    const EXPECTED: &str = "immediate like #0000000000000001";
    let digits = token
        .strip_prefix('#')
        .ok_or_else(|| invalid_operand(line, EXPECTED, token))?;
    if digits.is_empty() || digits.len() > 16 {
        return Err(invalid_operand(line, EXPECTED, token));
    }
    u64::from_str_radix(digits, 16)
        .map(|value| value as i64)
        .map_err(|_| invalid_operand(line, EXPECTED, token))
}

fn parse_dest_addr(line: usize, token: &str) -> Result<u32, CompilationError> {
    const EXPECTED: &str = "written cell like @00000002";
    let digits = token
        .strip_prefix('@')
        .ok_or_else(|| invalid_operand(line, EXPECTED, token))?;
    parse_hex_u32(line, EXPECTED, digits)
}

fn parse_src_addr(line: usize, token: &str) -> Result<u32, CompilationError> {
    const EXPECTED: &str = "read cell like $00000003";
    let digits = token
        .strip_prefix('$')
        .ok_or_else(|| invalid_operand(line, EXPECTED, token))?;
    parse_hex_u32(line, EXPECTED, digits)
}

fn parse_code_addr(line: usize, token: &str) -> Result<u32, CompilationError> {
    const EXPECTED: &str = "code address like [0004]";
    let digits = token
        .strip_prefix('[')
        .and_then(|token| token.strip_suffix(']'))
        .ok_or_else(|| invalid_operand(line, EXPECTED, token))?;
    parse_hex_u32(line, EXPECTED, digits)
}

fn parse_offset(line: usize, position: u32, token: &str) -> Result<i8, CompilationError> {
    let offset: i64 = token
        .parse()
        .map_err(|_| invalid_operand(line, "signed displacement like +12", token))?;
    if offset < i8::MIN as i64 || offset > i8::MAX as i64 {
        return Err(CompilationError::OffsetTooWide { offset, position });
    }
    Ok(offset as i8)
}

fn parse_func(line: usize, op: OpCode, token: &str) -> Result<u16, CompilationError> {
    if let Some(function) = FunctionCode::from_mnemonic(token) {
        let (param_count, returns_value) = call_shape(op).unwrap_or((0, false));
        if param_count != function.param_count() || returns_value != function.returns_value() {
            return Err(CompilationError::WrongOpcodeForFunction {
                line,
                opcode: op.mnemonic(),
                function: function.mnemonic(),
            });
        }
        return Ok(function.value());
    }

    const EXPECTED: &str = "function mnemonic or FN(hex)";
    let digits = token
        .strip_prefix("FN(")
        .and_then(|token| token.strip_suffix(')'))
        .ok_or_else(|| invalid_operand(line, EXPECTED, token))?;
    if digits.is_empty() || digits.len() > 4 {
        return Err(invalid_operand(line, EXPECTED, token));
    }
    let raw =
        u16::from_str_radix(digits, 16).map_err(|_| invalid_operand(line, EXPECTED, token))?;
    if raw < API_PASSTHROUGH_BASE && FunctionCode::lookup(raw).is_none() {
        return Err(CompilationError::UnknownFunction { line, raw });
    }
    Ok(raw)
}

/// Assembles one instruction, appending its encoding to `out`.
///
/// `line` is used for diagnostics; `out.len()` is taken as the
/// instruction's position for displacement checks.
fn assemble_tokens(
    line: usize,
    tokens: &[&str],
    out: &mut Vec<u8>,
) -> Result<(), CompilationError> {
    let op = OpCode::from_mnemonic(tokens[0]).ok_or_else(|| CompilationError::UnknownMnemonic {
        line,
        mnemonic: tokens[0].to_string(),
    })?;

    let operands = &tokens[1..];
    if operands.len() != op.params().len() {
        return Err(CompilationError::OperandCount {
            line,
            mnemonic: op.mnemonic(),
            expected: op.params().len(),
            actual: operands.len(),
        });
    }

    let position = out.len() as u32;
    out.push(op as u8);

    for (kind, token) in op.params().iter().zip(operands) {
        match kind {
            ParamKind::Value => {
                out.extend_from_slice(&parse_value(line, token)?.to_be_bytes());
            }
            ParamKind::DestAddr
            | ParamKind::IndirectDestAddr
            | ParamKind::IndirectDestAddrWithIndex => {
                out.extend_from_slice(&parse_dest_addr(line, token)?.to_be_bytes());
            }
            ParamKind::SrcAddr
            | ParamKind::IndirectSrcAddr
            | ParamKind::IndirectSrcAddrWithIndex
            | ParamKind::Index
            | ParamKind::BlockHeight => {
                out.extend_from_slice(&parse_src_addr(line, token)?.to_be_bytes());
            }
            ParamKind::CodeAddr => {
                out.extend_from_slice(&parse_code_addr(line, token)?.to_be_bytes());
            }
            ParamKind::Offset => {
                out.push(parse_offset(line, position, token)? as u8);
            }
            ParamKind::Func => {
                out.extend_from_slice(&parse_func(line, op, token)?.to_be_bytes());
            }
        }
    }

    Ok(())
}

/// Assembles a single instruction line into its encoding.
pub fn assemble_line(source: &str) -> Result<Vec<u8>, CompilationError> {
    let tokens = tokenize(source);
    if tokens.is_empty() {
        return Err(CompilationError::UnknownMnemonic {
            line: 1,
            mnemonic: String::new(),
        });
    }
    let mut out = Vec::new();
    assemble_tokens(1, &tokens, &mut out)?;
    Ok(out)
}

/// Assembles a multi-line listing into code bytes.
///
/// Blank lines and comment-only lines are skipped. Line numbers in errors
/// are 1-based.
pub fn assemble_source(source: &str) -> Result<Vec<u8>, CompilationError> {
    let mut out = Vec::new();
    for (index, line) in source.lines().enumerate() {
        let tokens = tokenize(line);
        if tokens.is_empty() {
            continue;
        }
        assemble_tokens(index + 1, &tokens, &mut out)?;
    }
    Ok(out)
}

/// Disassembles the instruction at `*cursor`, advancing the cursor past it.
///
/// Operands are printed raw; data addresses are not validated against any
/// data segment.
pub fn disassemble_instruction(code: &[u8], cursor: &mut u32) -> Result<String, ExecutionError> {
    use crate::codec;

    let offset = *cursor;
    let byte = *code
        .get(offset as usize)
        .ok_or(ExecutionError::CodeUnderflow {
            offset,
            wanted: 1,
            limit: code.len() as u32,
        })?;
    let op = OpCode::try_from(byte).map_err(|_| ExecutionError::InvalidOpCode {
        opcode: byte,
        offset,
    })?;
    *cursor += 1;

    let mut out = String::from(op.mnemonic());
    for kind in op.params() {
        match kind {
            ParamKind::Value => {
                let value = codec::fetch_long(code, cursor)?;
                out.push_str(&format!(" #{:016x}", value as u64));
            }
            ParamKind::DestAddr
            | ParamKind::IndirectDestAddr
            | ParamKind::IndirectDestAddrWithIndex => {
                let index = codec::fetch_int(code, cursor)?;
                out.push_str(&format!(" @{:08x}", index as u32));
            }
            ParamKind::SrcAddr
            | ParamKind::IndirectSrcAddr
            | ParamKind::IndirectSrcAddrWithIndex
            | ParamKind::Index
            | ParamKind::BlockHeight => {
                let index = codec::fetch_int(code, cursor)?;
                out.push_str(&format!(" ${:08x}", index as u32));
            }
            ParamKind::CodeAddr => {
                let address = codec::fetch_int(code, cursor)?;
                out.push_str(&format!(" [{:04x}]", address as u32));
            }
            ParamKind::Offset => {
                let offset = codec::fetch_offset(code, cursor)?;
                out.push_str(&format!(" {:+}", offset));
            }
            ParamKind::Func => {
                let raw = codec::fetch_func(code, cursor)?;
                match FunctionCode::lookup(raw) {
                    Some(function) if function != FunctionCode::ApiPassthrough => {
                        out.push(' ');
                        out.push_str(function.mnemonic());
                    }
                    _ => out.push_str(&format!(" FN({:04x})", raw)),
                }
            }
        }
    }

    Ok(out)
}

/// Disassembles a whole code segment, one instruction per line.
///
/// Trailing zero bytes are treated as cell padding and ignored.
pub fn disassemble(code: &[u8]) -> Result<String, ExecutionError> {
    let mut out = String::new();
    let mut cursor = 0u32;

    while (cursor as usize) < code.len() {
        if code[cursor as usize..].iter().all(|&byte| byte == 0) {
            break;
        }
        let line = disassemble_instruction(code, &mut cursor)?;
        out.push_str(&line);
        out.push('\n');
    }

    Ok(out)
}
