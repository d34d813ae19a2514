//! Opcode numbers and operand decoding.
//!
//! Tracks the CPython 3.13 instruction set. Several opcodes pack more than
//! one operand into `arg`; the helpers below keep that bit-twiddling in one
//! place.

// Opcodes without an argument.
pub const CACHE: u8 = 0;
pub const BINARY_SLICE: u8 = 2;
pub const STORE_SLICE: u8 = 3;
pub const CHECK_EXC_MATCH: u8 = 5;
pub const BINARY_SUBSCR: u8 = 6;
pub const DELETE_SUBSCR: u8 = 8;
pub const END_FOR: u8 = 9;
pub const GET_ITER: u8 = 16;
pub const NOP: u8 = 21;
pub const POP_EXCEPT: u8 = 23;
pub const POP_TOP: u8 = 25;
pub const PUSH_EXC_INFO: u8 = 26;
pub const PUSH_NULL: u8 = 27;
pub const RETURN_VALUE: u8 = 33;
pub const STORE_SUBSCR: u8 = 36;
pub const TO_BOOL: u8 = 37;
pub const UNARY_INVERT: u8 = 38;
pub const UNARY_NEGATIVE: u8 = 39;
pub const UNARY_NOT: u8 = 40;

// Opcodes with an argument.
pub const BINARY_OP: u8 = 45;
pub const BUILD_CONST_KEY_MAP: u8 = 46;
pub const BUILD_LIST: u8 = 47;
pub const BUILD_MAP: u8 = 48;
pub const BUILD_SET: u8 = 49;
pub const BUILD_SLICE: u8 = 50;
pub const BUILD_TUPLE: u8 = 52;
pub const CALL: u8 = 53;
pub const CALL_FUNCTION_EX: u8 = 54;
pub const CALL_KW: u8 = 57;
pub const COMPARE_OP: u8 = 58;
pub const CONTAINS_OP: u8 = 59;
pub const COPY: u8 = 61;
pub const DELETE_ATTR: u8 = 63;
pub const DICT_MERGE: u8 = 64;
pub const DICT_UPDATE: u8 = 65;
pub const EXTENDED_ARG: u8 = 69;
pub const FOR_ITER: u8 = 72;
pub const IS_OP: u8 = 75;
pub const JUMP_BACKWARD: u8 = 77;
pub const JUMP_BACKWARD_NO_INTERRUPT: u8 = 78;
pub const JUMP_FORWARD: u8 = 79;
pub const LIST_APPEND: u8 = 80;
pub const LIST_EXTEND: u8 = 81;
pub const LOAD_ATTR: u8 = 82;
pub const LOAD_CONST: u8 = 83;
pub const LOAD_FAST: u8 = 85;
pub const LOAD_FAST_LOAD_FAST: u8 = 88;
pub const LOAD_GLOBAL: u8 = 91;
pub const MAP_ADD: u8 = 94;
pub const POP_JUMP_IF_FALSE: u8 = 97;
pub const POP_JUMP_IF_NONE: u8 = 98;
pub const POP_JUMP_IF_NOT_NONE: u8 = 99;
pub const POP_JUMP_IF_TRUE: u8 = 100;
pub const RAISE_VARARGS: u8 = 101;
pub const RERAISE: u8 = 102;
pub const RETURN_CONST: u8 = 103;
pub const SET_ADD: u8 = 104;
pub const SET_UPDATE: u8 = 106;
pub const STORE_ATTR: u8 = 108;
pub const STORE_FAST: u8 = 110;
pub const STORE_FAST_STORE_FAST: u8 = 112;
pub const SWAP: u8 = 115;
pub const UNPACK_SEQUENCE: u8 = 116;
pub const RESUME: u8 = 149;

use pyrite_runtime::{BinOp, CmpOp};

/// Number of inplace sub-operators stacked after the plain ones in
/// BINARY_OP's operand space.
const INPLACE_BASE: u32 = 13;

/// Decode a BINARY_OP operand. Inplace variants share the plain semantics.
/// Returns None for sub-operators with no runtime support (matmul).
pub fn binary_op_kind(arg: u32) -> Option<BinOp> {
    let arg = if arg >= INPLACE_BASE {
        arg - INPLACE_BASE
    } else {
        arg
    };
    match arg {
        0 => Some(BinOp::Add),
        1 => Some(BinOp::And),
        2 => Some(BinOp::FloorDiv),
        3 => Some(BinOp::Shl),
        5 => Some(BinOp::Mul),
        6 => Some(BinOp::Rem),
        7 => Some(BinOp::Or),
        8 => Some(BinOp::Pow),
        9 => Some(BinOp::Shr),
        10 => Some(BinOp::Sub),
        11 => Some(BinOp::TrueDiv),
        12 => Some(BinOp::Xor),
        _ => None,
    }
}

/// Decode a COMPARE_OP operand; the operator lives in the high bits.
pub fn compare_kind(arg: u32) -> Option<CmpOp> {
    match arg >> 5 {
        0 => Some(CmpOp::Lt),
        1 => Some(CmpOp::Le),
        2 => Some(CmpOp::Eq),
        3 => Some(CmpOp::Ne),
        4 => Some(CmpOp::Gt),
        5 => Some(CmpOp::Ge),
        _ => None,
    }
}

/// LOAD_ATTR / STORE_ATTR / LOAD_GLOBAL keep the name index in the high
/// bits and a flag in the low bit.
pub fn name_index(arg: u32) -> usize {
    (arg >> 1) as usize
}

/// LOAD_ATTR low bit: the attribute is about to be called.
pub fn attr_method_flag(arg: u32) -> bool {
    arg & 1 != 0
}

/// LOAD_GLOBAL low bit: push a null "no self" marker after the global.
pub fn global_pushes_null(arg: u32) -> bool {
    arg & 1 != 0
}

/// LOAD_FAST_LOAD_FAST / STORE_FAST_STORE_FAST pack two local slots into
/// one operand.
pub fn fast_pair(arg: u32) -> (usize, usize) {
    ((arg >> 4) as usize, (arg & 0xf) as usize)
}

/// CONTAINS_OP / IS_OP low bit flips the result.
pub fn invert_flag(arg: u32) -> bool {
    arg & 1 != 0
}

/// Where execution resumes when a FOR_ITER loop finishes: past the END_FOR
/// and POP_TOP that follow the jump target.
pub fn for_iter_exit(target: usize) -> usize {
    target + 2
}

/// Opcode name for diagnostics.
pub fn name(op: u8) -> &'static str {
    match op {
        CACHE => "CACHE",
        BINARY_SLICE => "BINARY_SLICE",
        STORE_SLICE => "STORE_SLICE",
        CHECK_EXC_MATCH => "CHECK_EXC_MATCH",
        BINARY_SUBSCR => "BINARY_SUBSCR",
        DELETE_SUBSCR => "DELETE_SUBSCR",
        END_FOR => "END_FOR",
        GET_ITER => "GET_ITER",
        NOP => "NOP",
        POP_EXCEPT => "POP_EXCEPT",
        POP_TOP => "POP_TOP",
        PUSH_EXC_INFO => "PUSH_EXC_INFO",
        PUSH_NULL => "PUSH_NULL",
        RETURN_VALUE => "RETURN_VALUE",
        STORE_SUBSCR => "STORE_SUBSCR",
        TO_BOOL => "TO_BOOL",
        UNARY_INVERT => "UNARY_INVERT",
        UNARY_NEGATIVE => "UNARY_NEGATIVE",
        UNARY_NOT => "UNARY_NOT",
        BINARY_OP => "BINARY_OP",
        BUILD_CONST_KEY_MAP => "BUILD_CONST_KEY_MAP",
        BUILD_LIST => "BUILD_LIST",
        BUILD_MAP => "BUILD_MAP",
        BUILD_SET => "BUILD_SET",
        BUILD_SLICE => "BUILD_SLICE",
        BUILD_TUPLE => "BUILD_TUPLE",
        CALL => "CALL",
        CALL_FUNCTION_EX => "CALL_FUNCTION_EX",
        CALL_KW => "CALL_KW",
        COMPARE_OP => "COMPARE_OP",
        CONTAINS_OP => "CONTAINS_OP",
        COPY => "COPY",
        DELETE_ATTR => "DELETE_ATTR",
        DICT_MERGE => "DICT_MERGE",
        DICT_UPDATE => "DICT_UPDATE",
        EXTENDED_ARG => "EXTENDED_ARG",
        FOR_ITER => "FOR_ITER",
        IS_OP => "IS_OP",
        JUMP_BACKWARD => "JUMP_BACKWARD",
        JUMP_BACKWARD_NO_INTERRUPT => "JUMP_BACKWARD_NO_INTERRUPT",
        JUMP_FORWARD => "JUMP_FORWARD",
        LIST_APPEND => "LIST_APPEND",
        LIST_EXTEND => "LIST_EXTEND",
        LOAD_ATTR => "LOAD_ATTR",
        LOAD_CONST => "LOAD_CONST",
        LOAD_FAST => "LOAD_FAST",
        LOAD_FAST_LOAD_FAST => "LOAD_FAST_LOAD_FAST",
        LOAD_GLOBAL => "LOAD_GLOBAL",
        MAP_ADD => "MAP_ADD",
        POP_JUMP_IF_FALSE => "POP_JUMP_IF_FALSE",
        POP_JUMP_IF_NONE => "POP_JUMP_IF_NONE",
        POP_JUMP_IF_NOT_NONE => "POP_JUMP_IF_NOT_NONE",
        POP_JUMP_IF_TRUE => "POP_JUMP_IF_TRUE",
        RAISE_VARARGS => "RAISE_VARARGS",
        RERAISE => "RERAISE",
        RETURN_CONST => "RETURN_CONST",
        SET_ADD => "SET_ADD",
        SET_UPDATE => "SET_UPDATE",
        STORE_ATTR => "STORE_ATTR",
        STORE_FAST => "STORE_FAST",
        STORE_FAST_STORE_FAST => "STORE_FAST_STORE_FAST",
        SWAP => "SWAP",
        UNPACK_SEQUENCE => "UNPACK_SEQUENCE",
        RESUME => "RESUME",
        _ => "<unknown>",
    }
}
