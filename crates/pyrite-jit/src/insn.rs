//! Decoded bytecode instructions and compilation input.

use pyrite_runtime::Const;

use crate::opcodes;

/// One decoded instruction unit.
///
/// `arg` already has any EXTENDED_ARG prefixes folded in; the prefixes
/// themselves remain in the stream as NOP placeholders so that jump
/// offsets, which count instruction units, stay valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: u8,
    pub arg: u32,
}

impl Instruction {
    pub fn new(opcode: u8, arg: u32) -> Self {
        Instruction { opcode, arg }
    }
}

/// Decode a raw code buffer of 2-byte units into instructions, folding
/// EXTENDED_ARG prefixes.
pub fn decode(raw: &[u8]) -> Vec<Instruction> {
    let mut out = Vec::with_capacity(raw.len() / 2);
    let mut prefix: u32 = 0;
    for unit in raw.chunks_exact(2) {
        let (opcode, arg_byte) = (unit[0], unit[1]);
        if opcode == opcodes::EXTENDED_ARG {
            prefix = (prefix | arg_byte as u32) << 8;
            // Placeholder keeps instruction indices stable.
            out.push(Instruction::new(opcodes::NOP, 0));
        } else {
            out.push(Instruction::new(opcode, prefix | arg_byte as u32));
            prefix = 0;
        }
    }
    out
}

/// Everything the compiler needs to translate one function.
pub struct FunctionSource {
    /// Symbol name; must be unique across the engine.
    pub name: String,
    /// Number of leading locals filled from call arguments.
    pub param_count: usize,
    /// Total local slot count, parameters included.
    pub local_count: usize,
    pub code: Vec<Instruction>,
    pub consts: Vec<Const>,
    pub names: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_folds_extended_arg() {
        let raw = [
            opcodes::EXTENDED_ARG,
            0x01,
            opcodes::LOAD_CONST,
            0x02,
            opcodes::RETURN_VALUE,
            0,
        ];
        let code = decode(&raw);
        assert_eq!(code.len(), 3);
        assert_eq!(code[0], Instruction::new(opcodes::NOP, 0));
        assert_eq!(code[1], Instruction::new(opcodes::LOAD_CONST, 0x0102));
        assert_eq!(code[2], Instruction::new(opcodes::RETURN_VALUE, 0));
    }

    #[test]
    fn decode_chains_multiple_prefixes() {
        let raw = [
            opcodes::EXTENDED_ARG,
            0x01,
            opcodes::EXTENDED_ARG,
            0x02,
            opcodes::JUMP_FORWARD,
            0x03,
        ];
        let code = decode(&raw);
        assert_eq!(code[2].arg, 0x010203);
    }
}
