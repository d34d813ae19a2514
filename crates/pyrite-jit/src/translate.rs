//! Per-opcode lowering.
//!
//! Ownership protocol: every boxed stack slot carries one reference unit
//! owned by the frame. Helpers borrow their pointer arguments unless noted,
//! so the pattern for a consuming opcode is call, release the consumed
//! inputs, then branch on the result. The error epilogue releases whatever
//! the frame still owns and returns the null sentinel.

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{types, InstBuilder, Value};

use pyrite_runtime::{BinOp, Const};

use crate::compiler::FunctionCompiler;
use crate::insn::Instruction;
use crate::opcodes;
use crate::stack::{Slot, SlotTag};
use crate::TranslateError;

impl FunctionCompiler<'_> {
    /// Translate one instruction. Returns true when the instruction
    /// terminates the current block.
    pub(crate) fn translate_inst(&mut self, inst: Instruction) -> Result<bool, TranslateError> {
        let arg = inst.arg;
        match inst.opcode {
            opcodes::NOP | opcodes::CACHE | opcodes::RESUME => {}

            opcodes::POP_TOP => {
                let slot = self.stack.pop()?;
                if slot.tag == SlotTag::Boxed {
                    self.call_helper("pyr_decref", &[slot.value])?;
                }
            }
            opcodes::COPY => {
                let slot = self.stack.peek(arg as usize)?;
                if slot.tag == SlotTag::Boxed {
                    self.call_helper("pyr_incref", &[slot.value])?;
                }
                self.stack.push(slot);
            }
            opcodes::SWAP => {
                self.stack.swap_with_top(arg as usize)?;
            }
            opcodes::PUSH_NULL => {
                let null = self.iconst(0);
                self.stack.push(Slot::boxed(null));
            }

            opcodes::LOAD_CONST => self.load_const(arg as usize)?,
            opcodes::RETURN_CONST => {
                self.load_const(arg as usize)?;
                return self.translate_return();
            }
            opcodes::RETURN_VALUE => return self.translate_return(),

            opcodes::LOAD_FAST => self.load_fast(arg as usize)?,
            opcodes::LOAD_FAST_LOAD_FAST => {
                let (a, b) = opcodes::fast_pair(arg);
                self.load_fast(a)?;
                self.load_fast(b)?;
            }
            opcodes::STORE_FAST => self.store_fast(arg as usize)?,
            opcodes::STORE_FAST_STORE_FAST => {
                let (a, b) = opcodes::fast_pair(arg);
                // Top of stack goes to the first slot.
                self.store_fast(a)?;
                self.store_fast(b)?;
            }

            opcodes::LOAD_GLOBAL => {
                let tables = self.tables_ptr();
                let idx = self.iconst(opcodes::name_index(arg) as i64);
                let value = self.call_helper_ret("pyr_global_load", &[tables, idx])?;
                self.check_not_null(value)?;
                self.stack.push(Slot::boxed(value));
                if opcodes::global_pushes_null(arg) {
                    let null = self.iconst(0);
                    self.stack.push(Slot::boxed(null));
                }
            }

            opcodes::BINARY_OP => self.translate_binary(arg)?,
            opcodes::COMPARE_OP => self.translate_compare(arg)?,
            opcodes::IS_OP => self.translate_is(arg)?,
            opcodes::CONTAINS_OP => {
                let container = self.stack.pop()?;
                let item = self.stack.pop()?;
                let container = self.ensure_boxed(container)?;
                let item = self.ensure_boxed(item)?;
                let invert = self.iconst(opcodes::invert_flag(arg) as i64);
                let found = self.call_helper_ret("pyr_contains", &[container, item, invert])?;
                self.call_helper("pyr_decref", &[container])?;
                self.call_helper("pyr_decref", &[item])?;
                self.check_status(found)?;
                let result = self.call_helper_ret("pyr_bool_new", &[found])?;
                self.stack.push(Slot::boxed(result));
            }

            opcodes::UNARY_NEGATIVE => {
                let slot = self.stack.pop()?;
                match slot.tag {
                    SlotTag::Native => {
                        let neg = self.builder.ins().ineg(slot.value);
                        self.stack.push(Slot::native(neg));
                    }
                    SlotTag::Boxed => {
                        let res = self.call_helper_ret("pyr_negate", &[slot.value])?;
                        self.call_helper("pyr_decref", &[slot.value])?;
                        self.check_not_null(res)?;
                        self.stack.push(Slot::boxed(res));
                    }
                }
            }
            opcodes::UNARY_INVERT => {
                let slot = self.stack.pop()?;
                match slot.tag {
                    SlotTag::Native => {
                        let inv = self.builder.ins().bnot(slot.value);
                        self.stack.push(Slot::native(inv));
                    }
                    SlotTag::Boxed => {
                        let res = self.call_helper_ret("pyr_invert", &[slot.value])?;
                        self.call_helper("pyr_decref", &[slot.value])?;
                        self.check_not_null(res)?;
                        self.stack.push(Slot::boxed(res));
                    }
                }
            }
            opcodes::UNARY_NOT => {
                let truth = self.pop_truth()?;
                let flipped = self.builder.ins().bxor_imm(truth, 1);
                let result = self.call_helper_ret("pyr_bool_new", &[flipped])?;
                self.stack.push(Slot::boxed(result));
            }
            opcodes::TO_BOOL => {
                let truth = self.pop_truth()?;
                self.stack.push(Slot::native(truth));
            }

            opcodes::POP_JUMP_IF_TRUE => return self.translate_pop_jump(arg, true),
            opcodes::POP_JUMP_IF_FALSE => return self.translate_pop_jump(arg, false),
            opcodes::POP_JUMP_IF_NONE => return self.translate_pop_jump_none(arg, true),
            opcodes::POP_JUMP_IF_NOT_NONE => return self.translate_pop_jump_none(arg, false),

            opcodes::JUMP_FORWARD => {
                let target = self.current_pc + 1 + arg as usize;
                let args = self.edge_args(target)?;
                let block = self.target_block(target);
                self.builder.ins().jump(block, &args);
                return Ok(true);
            }
            opcodes::JUMP_BACKWARD | opcodes::JUMP_BACKWARD_NO_INTERRUPT => {
                let target = (self.current_pc + 1).saturating_sub(arg as usize);
                let args = self.edge_args(target)?;
                let block = self.target_block(target);
                self.builder.ins().jump(block, &args);
                return Ok(true);
            }

            opcodes::BUILD_TUPLE => self.translate_build_seq("pyr_tuple_new", arg as usize)?,
            opcodes::BUILD_LIST => self.translate_build_seq("pyr_list_new", arg as usize)?,
            opcodes::BUILD_MAP => {
                let pairs = self.stack.pop_n(2 * arg as usize)?;
                let dict = self.call_helper_ret("pyr_dict_new", &[])?;
                for pair in pairs.chunks_exact(2) {
                    let key = self.ensure_boxed(pair[0])?;
                    let value = self.ensure_boxed(pair[1])?;
                    let status = self.call_helper_ret("pyr_dict_set", &[dict, key, value])?;
                    self.call_helper("pyr_decref", &[key])?;
                    self.call_helper("pyr_decref", &[value])?;
                    self.stack.push(Slot::boxed(dict));
                    self.check_status(status)?;
                    self.stack.pop()?;
                }
                self.stack.push(Slot::boxed(dict));
            }
            opcodes::BUILD_CONST_KEY_MAP => {
                let count = arg as usize;
                let keys_slot = self.stack.pop()?;
                let keys = self.ensure_boxed(keys_slot)?;
                let values = self.stack.pop_n(count)?;
                let expected = self.iconst(count as i64);
                let status = self.call_helper_ret("pyr_unpack_check", &[keys, expected])?;
                self.stack.push(Slot::boxed(keys));
                self.check_status(status)?;
                self.stack.pop()?;
                let dict = self.call_helper_ret("pyr_dict_new", &[])?;
                for (i, value) in values.into_iter().enumerate() {
                    let value = self.ensure_boxed(value)?;
                    let idx = self.iconst(i as i64);
                    // Infallible after the length check above.
                    let key = self.call_helper_ret("pyr_seq_get", &[keys, idx])?;
                    let status = self.call_helper_ret("pyr_dict_set", &[dict, key, value])?;
                    self.call_helper("pyr_decref", &[key])?;
                    self.call_helper("pyr_decref", &[value])?;
                    self.stack.push(Slot::boxed(keys));
                    self.stack.push(Slot::boxed(dict));
                    self.check_status(status)?;
                    self.stack.pop()?;
                    self.stack.pop()?;
                }
                self.call_helper("pyr_decref", &[keys])?;
                self.stack.push(Slot::boxed(dict));
            }
            opcodes::BUILD_SET => {
                let elems = self.stack.pop_n(arg as usize)?;
                let set = self.call_helper_ret("pyr_set_new", &[])?;
                for elem in elems {
                    let v = self.ensure_boxed(elem)?;
                    self.call_helper_ret("pyr_set_add", &[set, v])?;
                    self.call_helper("pyr_decref", &[v])?;
                }
                self.stack.push(Slot::boxed(set));
            }
            opcodes::BUILD_SLICE => {
                let count = arg as usize;
                let step = if count == 3 {
                    let s = self.stack.pop()?;
                    Some(self.ensure_boxed(s)?)
                } else {
                    None
                };
                let stop = self.stack.pop()?;
                let start = self.stack.pop()?;
                let stop = self.ensure_boxed(stop)?;
                let start = self.ensure_boxed(start)?;
                let step_v = step.unwrap_or_else(|| self.iconst(0));
                let slice = self.call_helper_ret("pyr_slice_new", &[start, stop, step_v])?;
                self.call_helper("pyr_decref", &[start])?;
                self.call_helper("pyr_decref", &[stop])?;
                if let Some(step) = step {
                    self.call_helper("pyr_decref", &[step])?;
                }
                self.stack.push(Slot::boxed(slice));
            }

            opcodes::LIST_APPEND => {
                let slot = self.stack.pop()?;
                let value = self.ensure_boxed(slot)?;
                let list = self.stack.peek(arg as usize)?.value;
                let status = self.call_helper_ret("pyr_list_append", &[list, value])?;
                self.check_status(status)?;
            }
            opcodes::SET_ADD => {
                let slot = self.stack.pop()?;
                let value = self.ensure_boxed(slot)?;
                let set = self.stack.peek(arg as usize)?.value;
                let status = self.call_helper_ret("pyr_set_add", &[set, value])?;
                self.call_helper("pyr_decref", &[value])?;
                self.check_status(status)?;
            }
            opcodes::MAP_ADD => {
                let value = self.stack.pop()?;
                let key = self.stack.pop()?;
                let value = self.ensure_boxed(value)?;
                let key = self.ensure_boxed(key)?;
                let dict = self.stack.peek(arg as usize)?.value;
                let status = self.call_helper_ret("pyr_dict_set", &[dict, key, value])?;
                self.call_helper("pyr_decref", &[key])?;
                self.call_helper("pyr_decref", &[value])?;
                self.check_status(status)?;
            }
            opcodes::LIST_EXTEND => {
                self.translate_merge_into("pyr_list_extend", arg as usize)?;
            }
            opcodes::SET_UPDATE => {
                self.translate_merge_into("pyr_set_update", arg as usize)?;
            }
            opcodes::DICT_UPDATE | opcodes::DICT_MERGE => {
                self.translate_merge_into("pyr_dict_update", arg as usize)?;
            }

            opcodes::BINARY_SUBSCR => {
                let key = self.stack.pop()?;
                let obj = self.stack.pop()?;
                let key = self.ensure_boxed(key)?;
                let obj = self.ensure_boxed(obj)?;
                let res = self.call_helper_ret("pyr_getitem", &[obj, key])?;
                self.call_helper("pyr_decref", &[obj])?;
                self.call_helper("pyr_decref", &[key])?;
                self.check_not_null(res)?;
                self.stack.push(Slot::boxed(res));
            }
            opcodes::STORE_SUBSCR => {
                let key = self.stack.pop()?;
                let obj = self.stack.pop()?;
                let value = self.stack.pop()?;
                let key = self.ensure_boxed(key)?;
                let obj = self.ensure_boxed(obj)?;
                let value = self.ensure_boxed(value)?;
                let status = self.call_helper_ret("pyr_setitem", &[obj, key, value])?;
                self.call_helper("pyr_decref", &[obj])?;
                self.call_helper("pyr_decref", &[key])?;
                self.call_helper("pyr_decref", &[value])?;
                self.check_status(status)?;
            }
            opcodes::DELETE_SUBSCR => {
                let key = self.stack.pop()?;
                let obj = self.stack.pop()?;
                let key = self.ensure_boxed(key)?;
                let obj = self.ensure_boxed(obj)?;
                let status = self.call_helper_ret("pyr_delitem", &[obj, key])?;
                self.call_helper("pyr_decref", &[obj])?;
                self.call_helper("pyr_decref", &[key])?;
                self.check_status(status)?;
            }
            opcodes::BINARY_SLICE => {
                let stop = self.stack.pop()?;
                let start = self.stack.pop()?;
                let obj = self.stack.pop()?;
                let stop = self.ensure_boxed(stop)?;
                let start = self.ensure_boxed(start)?;
                let obj = self.ensure_boxed(obj)?;
                let null = self.iconst(0);
                let slice = self.call_helper_ret("pyr_slice_new", &[start, stop, null])?;
                self.call_helper("pyr_decref", &[start])?;
                self.call_helper("pyr_decref", &[stop])?;
                let res = self.call_helper_ret("pyr_getitem", &[obj, slice])?;
                self.call_helper("pyr_decref", &[slice])?;
                self.call_helper("pyr_decref", &[obj])?;
                self.check_not_null(res)?;
                self.stack.push(Slot::boxed(res));
            }
            opcodes::STORE_SLICE => {
                let stop = self.stack.pop()?;
                let start = self.stack.pop()?;
                let obj = self.stack.pop()?;
                let value = self.stack.pop()?;
                let stop = self.ensure_boxed(stop)?;
                let start = self.ensure_boxed(start)?;
                let obj = self.ensure_boxed(obj)?;
                let value = self.ensure_boxed(value)?;
                let null = self.iconst(0);
                let slice = self.call_helper_ret("pyr_slice_new", &[start, stop, null])?;
                self.call_helper("pyr_decref", &[start])?;
                self.call_helper("pyr_decref", &[stop])?;
                let status = self.call_helper_ret("pyr_setitem", &[obj, slice, value])?;
                self.call_helper("pyr_decref", &[slice])?;
                self.call_helper("pyr_decref", &[obj])?;
                self.call_helper("pyr_decref", &[value])?;
                self.check_status(status)?;
            }

            opcodes::LOAD_ATTR => {
                let slot = self.stack.pop()?;
                let obj = self.ensure_boxed(slot)?;
                let name = self.name_value(opcodes::name_index(arg))?;
                let attr = self.call_helper_ret("pyr_getattr", &[obj, name])?;
                self.call_helper("pyr_decref", &[obj])?;
                self.check_not_null(attr)?;
                self.stack.push(Slot::boxed(attr));
                if opcodes::attr_method_flag(arg) {
                    // No bound methods in this object model: the callee is
                    // a plain value, so the "self" slot stays empty.
                    let null = self.iconst(0);
                    self.stack.push(Slot::boxed(null));
                }
            }
            opcodes::STORE_ATTR => {
                let obj = self.stack.pop()?;
                let value = self.stack.pop()?;
                let obj = self.ensure_boxed(obj)?;
                let value = self.ensure_boxed(value)?;
                let name = self.name_value(opcodes::name_index(arg))?;
                let status = self.call_helper_ret("pyr_setattr", &[obj, name, value])?;
                self.call_helper("pyr_decref", &[obj])?;
                self.call_helper("pyr_decref", &[value])?;
                self.check_status(status)?;
            }
            opcodes::DELETE_ATTR => {
                let obj = self.stack.pop()?;
                let obj = self.ensure_boxed(obj)?;
                let name = self.name_value(arg as usize)?;
                let null = self.iconst(0);
                let status = self.call_helper_ret("pyr_setattr", &[obj, name, null])?;
                self.call_helper("pyr_decref", &[obj])?;
                self.check_status(status)?;
            }

            opcodes::GET_ITER => {
                let slot = self.stack.pop()?;
                let obj = self.ensure_boxed(slot)?;
                let iter = self.call_helper_ret("pyr_getiter", &[obj])?;
                self.call_helper("pyr_decref", &[obj])?;
                self.check_not_null(iter)?;
                self.stack.push(Slot::boxed(iter));
            }
            opcodes::FOR_ITER => return self.translate_for_iter(arg),
            opcodes::END_FOR => {
                // Only reachable on exception unwind paths, which this
                // compiler handles by returning to the caller instead.
                let slot = self.stack.pop()?;
                if slot.tag == SlotTag::Boxed {
                    self.call_helper("pyr_decref", &[slot.value])?;
                }
            }

            opcodes::UNPACK_SEQUENCE => {
                let count = arg as usize;
                let slot = self.stack.pop()?;
                let seq = self.ensure_boxed(slot)?;
                let expected = self.iconst(count as i64);
                let status = self.call_helper_ret("pyr_unpack_check", &[seq, expected])?;
                self.stack.push(Slot::boxed(seq));
                self.check_status(status)?;
                self.stack.pop()?;
                // Right-to-left, so the first element ends up on top. The
                // length check above makes these fetches infallible.
                for i in (0..count).rev() {
                    let idx = self.iconst(i as i64);
                    let elem = self.call_helper_ret("pyr_seq_get", &[seq, idx])?;
                    self.stack.push(Slot::boxed(elem));
                }
                self.call_helper("pyr_decref", &[seq])?;
            }

            opcodes::CALL => return self.translate_call(arg as usize, false).map(|_| false),
            opcodes::CALL_KW => return self.translate_call(arg as usize, true).map(|_| false),
            opcodes::CALL_FUNCTION_EX => self.translate_call_ex(arg)?,

            opcodes::RAISE_VARARGS => return self.translate_raise(arg),
            opcodes::RERAISE => {
                let slot = self.stack.pop()?;
                let exc = self.ensure_boxed(slot)?;
                self.call_helper("pyr_raise", &[exc])?;
                self.emit_error_return()?;
                return Ok(true);
            }
            opcodes::PUSH_EXC_INFO => {
                let exc = self.stack.pop()?;
                let prev = self.call_helper_ret("pyr_exc_save", &[exc.value])?;
                self.stack.push(Slot::boxed(prev));
                self.stack.push(exc);
            }
            opcodes::POP_EXCEPT => {
                let slot = self.stack.pop()?;
                let prev = self.ensure_boxed(slot)?;
                self.call_helper("pyr_exc_restore", &[prev])?;
            }
            opcodes::CHECK_EXC_MATCH => {
                let class = self.stack.pop()?;
                let class = self.ensure_boxed(class)?;
                let exc = self.stack.peek(1)?.value;
                let matched = self.call_helper_ret("pyr_exc_matches", &[exc, class])?;
                self.call_helper("pyr_decref", &[class])?;
                let result = self.call_helper_ret("pyr_bool_new", &[matched])?;
                self.stack.push(Slot::boxed(result));
            }

            other => {
                return Err(TranslateError::UnsupportedOpcode {
                    opcode: other,
                    name: opcodes::name(other),
                })
            }
        }
        Ok(false)
    }

    // =========================================================================
    // Loads
    // =========================================================================

    fn load_const(&mut self, idx: usize) -> Result<(), TranslateError> {
        let entry = self
            .tables
            .const_at(idx)
            .ok_or(TranslateError::BadConstIndex(idx))?;
        match entry {
            Const::Int(v) => {
                let value = self.iconst(*v);
                self.stack.push(Slot::native(value));
            }
            Const::Obj(_) => {
                let addr = self
                    .tables
                    .const_slot_addr(idx)
                    .ok_or(TranslateError::BadConstIndex(idx))?;
                let value = self.load_slot(addr);
                self.call_helper("pyr_incref", &[value])?;
                self.stack.push(Slot::boxed(value));
            }
        }
        Ok(())
    }

    fn load_fast(&mut self, slot: usize) -> Result<(), TranslateError> {
        let value = self.read_var(slot)?;
        self.call_helper("pyr_incref", &[value])?;
        self.stack.push(Slot::boxed(value));
        Ok(())
    }

    fn store_fast(&mut self, slot: usize) -> Result<(), TranslateError> {
        let popped = self.stack.pop()?;
        let new = self.ensure_boxed(popped)?;
        let old = self.read_var(slot)?;
        self.write_var(slot, new)?;
        self.call_helper("pyr_decref", &[old])?;
        Ok(())
    }

    fn name_value(&mut self, idx: usize) -> Result<Value, TranslateError> {
        let addr = self
            .tables
            .name_slot_addr(idx)
            .ok_or(TranslateError::BadNameIndex(idx))?;
        Ok(self.load_slot(addr))
    }

    // =========================================================================
    // Operators
    // =========================================================================

    fn translate_binary(&mut self, arg: u32) -> Result<(), TranslateError> {
        let op = opcodes::binary_op_kind(arg).ok_or(TranslateError::UnsupportedOpcode {
            opcode: opcodes::BINARY_OP,
            name: "BINARY_OP (matmul)",
        })?;
        let b = self.stack.pop()?;
        let a = self.stack.pop()?;
        if a.tag == SlotTag::Native && b.tag == SlotTag::Native {
            if let Some(value) = self.native_binary(op, a.value, b.value) {
                self.stack.push(Slot::native(value));
                return Ok(());
            }
        }
        let a = self.ensure_boxed(a)?;
        let b = self.ensure_boxed(b)?;
        let code = self.iconst(op.code());
        let res = self.call_helper_ret("pyr_binary_op", &[code, a, b])?;
        self.call_helper("pyr_decref", &[a])?;
        self.call_helper("pyr_decref", &[b])?;
        self.check_not_null(res)?;
        self.stack.push(Slot::boxed(res));
        Ok(())
    }

    /// Unboxed fast path. Division and power stay boxed: their semantics
    /// (floor behavior, zero checks, float promotion) live in the runtime.
    fn native_binary(&mut self, op: BinOp, a: Value, b: Value) -> Option<Value> {
        let ins = self.builder.ins();
        match op {
            BinOp::Add => Some(ins.iadd(a, b)),
            BinOp::Sub => Some(ins.isub(a, b)),
            BinOp::Mul => Some(ins.imul(a, b)),
            BinOp::And => Some(ins.band(a, b)),
            BinOp::Or => Some(ins.bor(a, b)),
            BinOp::Xor => Some(ins.bxor(a, b)),
            BinOp::Shl => Some(ins.ishl(a, b)),
            BinOp::Shr => Some(ins.sshr(a, b)),
            BinOp::TrueDiv | BinOp::FloorDiv | BinOp::Rem | BinOp::Pow => None,
        }
    }

    fn translate_compare(&mut self, arg: u32) -> Result<(), TranslateError> {
        let op = opcodes::compare_kind(arg).ok_or(TranslateError::UnsupportedOpcode {
            opcode: opcodes::COMPARE_OP,
            name: "COMPARE_OP",
        })?;
        let b = self.stack.pop()?;
        let a = self.stack.pop()?;
        if a.tag == SlotTag::Native && b.tag == SlotTag::Native {
            let cc = match op {
                pyrite_runtime::CmpOp::Lt => IntCC::SignedLessThan,
                pyrite_runtime::CmpOp::Le => IntCC::SignedLessThanOrEqual,
                pyrite_runtime::CmpOp::Eq => IntCC::Equal,
                pyrite_runtime::CmpOp::Ne => IntCC::NotEqual,
                pyrite_runtime::CmpOp::Gt => IntCC::SignedGreaterThan,
                pyrite_runtime::CmpOp::Ge => IntCC::SignedGreaterThanOrEqual,
            };
            let flag = self.builder.ins().icmp(cc, a.value, b.value);
            let flag = self.builder.ins().uextend(types::I64, flag);
            let result = self.call_helper_ret("pyr_bool_new", &[flag])?;
            self.stack.push(Slot::boxed(result));
            return Ok(());
        }
        let a = self.ensure_boxed(a)?;
        let b = self.ensure_boxed(b)?;
        let code = self.iconst(op.code());
        let res = self.call_helper_ret("pyr_compare", &[code, a, b])?;
        self.call_helper("pyr_decref", &[a])?;
        self.call_helper("pyr_decref", &[b])?;
        self.check_not_null(res)?;
        self.stack.push(Slot::boxed(res));
        Ok(())
    }

    fn translate_is(&mut self, arg: u32) -> Result<(), TranslateError> {
        let b = self.stack.pop()?;
        let a = self.stack.pop()?;
        let flag = match (a.tag, b.tag) {
            (SlotTag::Native, SlotTag::Native) => {
                let eq = self.builder.ins().icmp(IntCC::Equal, a.value, b.value);
                self.builder.ins().uextend(types::I64, eq)
            }
            (SlotTag::Boxed, SlotTag::Boxed) => {
                let eq = self.builder.ins().icmp(IntCC::Equal, a.value, b.value);
                let eq = self.builder.ins().uextend(types::I64, eq);
                self.call_helper("pyr_decref", &[a.value])?;
                self.call_helper("pyr_decref", &[b.value])?;
                eq
            }
            _ => {
                // An unboxed integer is never the same object as a boxed
                // value.
                for slot in [a, b] {
                    if slot.tag == SlotTag::Boxed {
                        self.call_helper("pyr_decref", &[slot.value])?;
                    }
                }
                self.iconst(0)
            }
        };
        let flag = if opcodes::invert_flag(arg) {
            self.builder.ins().bxor_imm(flag, 1)
        } else {
            flag
        };
        let result = self.call_helper_ret("pyr_bool_new", &[flag])?;
        self.stack.push(Slot::boxed(result));
        Ok(())
    }

    /// Pop the top of stack and reduce it to a 0/1 native truth value.
    fn pop_truth(&mut self) -> Result<Value, TranslateError> {
        let slot = self.stack.pop()?;
        match slot.tag {
            SlotTag::Native => {
                let nz = self.builder.ins().icmp_imm(IntCC::NotEqual, slot.value, 0);
                Ok(self.builder.ins().uextend(types::I64, nz))
            }
            SlotTag::Boxed => {
                let truth = self.call_helper_ret("pyr_truth", &[slot.value])?;
                self.call_helper("pyr_decref", &[slot.value])?;
                Ok(truth)
            }
        }
    }

    // =========================================================================
    // Branches
    // =========================================================================

    fn translate_pop_jump(&mut self, arg: u32, jump_if: bool) -> Result<bool, TranslateError> {
        let cond = self.pop_truth()?;
        let target = self.current_pc + 1 + arg as usize;
        let args = self.edge_args(target)?;
        let block = self.target_block(target);
        let fall = self.builder.create_block();
        if jump_if {
            self.builder.ins().brif(cond, block, &args, fall, &[]);
        } else {
            self.builder.ins().brif(cond, fall, &[], block, &args);
        }
        self.builder.switch_to_block(fall);
        self.builder.seal_block(fall);
        Ok(false)
    }

    fn translate_pop_jump_none(
        &mut self,
        arg: u32,
        jump_if_none: bool,
    ) -> Result<bool, TranslateError> {
        let slot = self.stack.pop()?;
        let cond = match slot.tag {
            // Unboxed integers are never None.
            SlotTag::Native => self.iconst(0),
            SlotTag::Boxed => {
                let is_none = self.call_helper_ret("pyr_is_none", &[slot.value])?;
                self.call_helper("pyr_decref", &[slot.value])?;
                is_none
            }
        };
        let target = self.current_pc + 1 + arg as usize;
        let args = self.edge_args(target)?;
        let block = self.target_block(target);
        let fall = self.builder.create_block();
        if jump_if_none {
            self.builder.ins().brif(cond, block, &args, fall, &[]);
        } else {
            self.builder.ins().brif(cond, fall, &[], block, &args);
        }
        self.builder.switch_to_block(fall);
        self.builder.seal_block(fall);
        Ok(false)
    }

    fn translate_for_iter(&mut self, arg: u32) -> Result<bool, TranslateError> {
        // The iterator stays on the stack for the loop body; the exit edge
        // leaves without it.
        self.box_stack()?;
        let iter = self.stack.peek(1)?.value;
        let next = self.call_helper_ret("pyr_iter_next", &[iter])?;

        let exit_pc = opcodes::for_iter_exit(self.current_pc + 1 + arg as usize);
        let body = self.builder.create_block();
        let null_case = self.builder.create_block();
        let is_null = self.builder.ins().icmp_imm(IntCC::Equal, next, 0);
        self.builder.ins().brif(is_null, null_case, &[], body, &[]);

        // Null means either a raised exception or plain exhaustion.
        self.builder.switch_to_block(null_case);
        self.builder.seal_block(null_case);
        let pending = self.call_helper_ret("pyr_pending", &[])?;
        let err = self.builder.create_block();
        let exhausted = self.builder.create_block();
        self.builder.ins().brif(pending, err, &[], exhausted, &[]);

        self.builder.switch_to_block(err);
        self.builder.seal_block(err);
        self.emit_error_return()?;

        self.builder.switch_to_block(exhausted);
        self.builder.seal_block(exhausted);
        let iter_slot = self.stack.pop()?;
        self.call_helper("pyr_decref", &[iter_slot.value])?;
        let exit_args = self.edge_args(exit_pc)?;
        let exit_block = self.target_block(exit_pc);
        self.builder.ins().jump(exit_block, &exit_args);

        // Loop body: iterator back underneath the fresh value.
        self.stack.push(iter_slot);
        self.builder.switch_to_block(body);
        self.builder.seal_block(body);
        self.stack.push(Slot::boxed(next));
        Ok(false)
    }

    // =========================================================================
    // Builds and calls
    // =========================================================================

    fn translate_build_seq(
        &mut self,
        ctor: &'static str,
        count: usize,
    ) -> Result<(), TranslateError> {
        let elems = self.stack.pop_n(count)?;
        let len = self.iconst(count as i64);
        let seq = self.call_helper_ret(ctor, &[len])?;
        for (i, elem) in elems.into_iter().enumerate() {
            let value = self.ensure_boxed(elem)?;
            let idx = self.iconst(i as i64);
            // Transfers the element's unit into the container.
            self.call_helper("pyr_seq_set", &[seq, idx, value])?;
        }
        self.stack.push(Slot::boxed(seq));
        Ok(())
    }

    fn translate_merge_into(
        &mut self,
        helper: &'static str,
        depth: usize,
    ) -> Result<(), TranslateError> {
        let slot = self.stack.pop()?;
        let src = self.ensure_boxed(slot)?;
        let dst = self.stack.peek(depth)?.value;
        let status = self.call_helper_ret(helper, &[dst, src])?;
        self.call_helper("pyr_decref", &[src])?;
        self.check_status(status)?;
        Ok(())
    }

    /// CALL and CALL_KW. The operand counts every argument value on the
    /// stack; for CALL_KW a tuple of names above them marks the trailing
    /// arguments as keywords, and the runtime does the split.
    fn translate_call(&mut self, argc: usize, with_kw: bool) -> Result<(), TranslateError> {
        let kwnames = if with_kw {
            let slot = self.stack.pop()?;
            Some(self.ensure_boxed(slot)?)
        } else {
            None
        };
        let args = self.stack.pop_n(argc)?;
        let self_slot = self.stack.pop()?;
        let callable_slot = self.stack.pop()?;
        let callable = self.ensure_boxed(callable_slot)?;
        let self_or_null = self.ensure_boxed(self_slot)?;

        let len = self.iconst(argc as i64);
        let pack = self.call_helper_ret("pyr_tuple_new", &[len])?;
        for (i, arg) in args.into_iter().enumerate() {
            let value = self.ensure_boxed(arg)?;
            let idx = self.iconst(i as i64);
            self.call_helper("pyr_seq_set", &[pack, idx, value])?;
        }

        let kw = kwnames.unwrap_or_else(|| self.iconst(0));
        let res = self.call_helper_ret("pyr_call", &[callable, self_or_null, pack, kw])?;
        self.call_helper("pyr_decref", &[pack])?;
        self.call_helper("pyr_decref", &[callable])?;
        self.call_helper("pyr_decref", &[self_or_null])?;
        if let Some(kwnames) = kwnames {
            self.call_helper("pyr_decref", &[kwnames])?;
        }
        self.check_not_null(res)?;
        self.stack.push(Slot::boxed(res));
        Ok(())
    }

    fn translate_call_ex(&mut self, flags: u32) -> Result<(), TranslateError> {
        let kwargs = if flags & 1 != 0 {
            let slot = self.stack.pop()?;
            Some(self.ensure_boxed(slot)?)
        } else {
            None
        };
        let args_slot = self.stack.pop()?;
        let marker = self.stack.pop()?;
        let callable_slot = self.stack.pop()?;
        let args = self.ensure_boxed(args_slot)?;
        let callable = self.ensure_boxed(callable_slot)?;
        let kw = kwargs.unwrap_or_else(|| self.iconst(0));
        let res = self.call_helper_ret("pyr_call_ex", &[callable, args, kw])?;
        self.call_helper("pyr_decref", &[args])?;
        self.call_helper("pyr_decref", &[callable])?;
        self.call_helper("pyr_decref", &[marker.value])?;
        if let Some(kwargs) = kwargs {
            self.call_helper("pyr_decref", &[kwargs])?;
        }
        self.check_not_null(res)?;
        self.stack.push(Slot::boxed(res));
        Ok(())
    }

    // =========================================================================
    // Returns and raises
    // =========================================================================

    fn translate_return(&mut self) -> Result<bool, TranslateError> {
        let slot = self.stack.pop()?;
        let value = self.ensure_boxed(slot)?;
        self.emit_return(value)?;
        Ok(true)
    }

    fn translate_raise(&mut self, arg: u32) -> Result<bool, TranslateError> {
        match arg {
            0 => {
                self.call_helper("pyr_reraise", &[])?;
            }
            1 => {
                let slot = self.stack.pop()?;
                let exc = self.ensure_boxed(slot)?;
                // pyr_raise takes over the unit.
                self.call_helper("pyr_raise", &[exc])?;
            }
            2 => {
                let cause_slot = self.stack.pop()?;
                let exc_slot = self.stack.pop()?;
                let cause = self.ensure_boxed(cause_slot)?;
                let exc = self.ensure_boxed(exc_slot)?;
                self.call_helper("pyr_raise_from", &[exc, cause])?;
            }
            other => {
                return Err(TranslateError::BadRaiseForm(other));
            }
        }
        self.emit_error_return()?;
        Ok(true)
    }
}
