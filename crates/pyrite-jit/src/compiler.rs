//! Function compiler: Python bytecode -> Cranelift IR.
//!
//! This module handles the control-flow reconstruction for a single
//! function. The per-opcode lowering lives in `translate`.

use std::collections::HashMap;

use cranelift_codegen::ir::{types, Block, FuncRef, Function, InstBuilder, MemFlags, Value};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext, Variable};

use pyrite_runtime::tables::UnitTables;

use crate::insn::FunctionSource;
use crate::opcodes;
use crate::stack::{EvalStack, Slot, SlotTag};
use crate::TranslateError;

/// FuncRefs for the runtime helpers, rebound per compiled function.
pub(crate) struct HelperMap {
    funcs: HashMap<&'static str, FuncRef>,
}

impl HelperMap {
    pub(crate) fn new() -> Self {
        HelperMap {
            funcs: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, name: &'static str, func: FuncRef) {
        self.funcs.insert(name, func);
    }

    pub(crate) fn get(&self, name: &'static str) -> Result<FuncRef, TranslateError> {
        self.funcs
            .get(name)
            .copied()
            .ok_or(TranslateError::MissingHelper(name))
    }
}

/// Compiles a single function to Cranelift IR.
///
/// The operand stack is emulated at compile time: each slot is an SSA
/// value tagged as an unboxed integer or an owned object pointer. At
/// block boundaries the live stack travels as block parameters, with
/// every slot boxed first so merge points have a single representation.
pub(crate) struct FunctionCompiler<'a> {
    pub(crate) builder: FunctionBuilder<'a>,
    pub(crate) source: &'a FunctionSource,
    pub(crate) tables: &'a UnitTables,
    pub(crate) helpers: &'a HelperMap,
    /// Cranelift Variable for each local slot.
    pub(crate) vars: Vec<Variable>,
    /// Block for each instruction index that is a jump target.
    pub(crate) blocks: HashMap<usize, Block>,
    /// Stack depth at entry to each target block, recorded by the first
    /// incoming edge. Block parameters are appended at the same time.
    shapes: HashMap<usize, usize>,
    pub(crate) stack: EvalStack,
    entry_block: Block,
    pub(crate) current_pc: usize,
}

impl<'a> FunctionCompiler<'a> {
    pub(crate) fn new(
        func: &'a mut Function,
        func_ctx: &'a mut FunctionBuilderContext,
        source: &'a FunctionSource,
        tables: &'a UnitTables,
        helpers: &'a HelperMap,
    ) -> Self {
        let mut builder = FunctionBuilder::new(func, func_ctx);
        let entry_block = builder.create_block();
        builder.append_block_params_for_function_params(entry_block);
        Self {
            builder,
            source,
            tables,
            helpers,
            vars: Vec::new(),
            blocks: HashMap::new(),
            shapes: HashMap::new(),
            stack: EvalStack::new(),
            entry_block,
            current_pc: 0,
        }
    }

    /// Compile the function.
    ///
    /// After this returns, the Cranelift function is ready for code
    /// generation.
    pub(crate) fn compile(mut self) -> Result<(), TranslateError> {
        self.declare_variables();
        self.scan_jump_targets();

        self.builder.switch_to_block(self.entry_block);
        self.emit_prologue()?;

        let mut terminated = false;
        for pc in 0..self.source.code.len() {
            self.current_pc = pc;

            if let Some(&block) = self.blocks.get(&pc) {
                if !terminated {
                    // Fall-through edge into the target block.
                    let args = self.edge_args(pc)?;
                    self.builder.ins().jump(block, &args);
                }
                if !self.shapes.contains_key(&pc) {
                    // Registered by a jump that itself sits in dead code.
                    // Fill the block with a bare return so finalization
                    // sees every created block complete; nothing jumps
                    // here.
                    self.builder.switch_to_block(block);
                    let zero = self.builder.ins().iconst(types::I64, 0);
                    self.builder.ins().return_(&[zero]);
                    terminated = true;
                    continue;
                }
                self.builder.switch_to_block(block);
                let params = self.builder.block_params(block).to_vec();
                self.stack.reset_from_params(&params);
            } else if terminated {
                // Dead code between a terminator and the next jump target.
                continue;
            }

            let inst = self.source.code[pc];
            terminated = self.translate_inst(inst)?;
        }

        if !terminated {
            // Defensive: well-formed bytecode always ends with a return.
            let none = self.call_helper_ret("pyr_none_new", &[])?;
            self.emit_return(none)?;
        }

        self.builder.seal_all_blocks();
        self.builder.finalize();
        Ok(())
    }

    fn declare_variables(&mut self) {
        for i in 0..self.source.local_count {
            let var = Variable::from_u32(i as u32);
            self.builder.declare_var(var, types::I64);
            self.vars.push(var);
        }
    }

    /// Pre-scan for jump targets and create their blocks.
    fn scan_jump_targets(&mut self) {
        for (pc, inst) in self.source.code.iter().enumerate() {
            let next = pc + 1;
            match inst.opcode {
                opcodes::JUMP_FORWARD
                | opcodes::POP_JUMP_IF_FALSE
                | opcodes::POP_JUMP_IF_TRUE
                | opcodes::POP_JUMP_IF_NONE
                | opcodes::POP_JUMP_IF_NOT_NONE => {
                    self.ensure_block(next + inst.arg as usize);
                }
                opcodes::JUMP_BACKWARD | opcodes::JUMP_BACKWARD_NO_INTERRUPT => {
                    self.ensure_block(next.saturating_sub(inst.arg as usize));
                }
                opcodes::FOR_ITER => {
                    // Loop exit resumes past the END_FOR / POP_TOP pair at
                    // the jump target.
                    self.ensure_block(opcodes::for_iter_exit(next + inst.arg as usize));
                }
                _ => {}
            }
        }
    }

    fn ensure_block(&mut self, pc: usize) -> Block {
        if let Some(&block) = self.blocks.get(&pc) {
            return block;
        }
        let block = self.builder.create_block();
        self.blocks.insert(pc, block);
        block
    }

    /// Entry prologue: arguments become the leading locals (one reference
    /// unit each), remaining locals start unbound.
    fn emit_prologue(&mut self) -> Result<(), TranslateError> {
        let params = self.builder.block_params(self.entry_block).to_vec();
        for i in 0..self.vars.len() {
            let var = self.vars[i];
            if i < self.source.param_count {
                let arg = params[i];
                self.call_helper("pyr_incref", &[arg])?;
                self.builder.def_var(var, arg);
            } else {
                let zero = self.builder.ins().iconst(types::I64, 0);
                self.builder.def_var(var, zero);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Emission utilities used by translate
    // =========================================================================

    pub(crate) fn read_var(&mut self, slot: usize) -> Result<Value, TranslateError> {
        let var = *self
            .vars
            .get(slot)
            .ok_or(TranslateError::BadLocalSlot(slot))?;
        Ok(self.builder.use_var(var))
    }

    pub(crate) fn write_var(&mut self, slot: usize, value: Value) -> Result<(), TranslateError> {
        let var = *self
            .vars
            .get(slot)
            .ok_or(TranslateError::BadLocalSlot(slot))?;
        self.builder.def_var(var, value);
        Ok(())
    }

    pub(crate) fn iconst(&mut self, v: i64) -> Value {
        self.builder.ins().iconst(types::I64, v)
    }

    /// Address of the unit's side tables, baked in as a constant. The
    /// tables are pinned for the lifetime of the installed function.
    pub(crate) fn tables_ptr(&mut self) -> Value {
        let addr = self.tables as *const UnitTables as i64;
        self.iconst(addr)
    }

    /// Load the boxed object stored in a pinned table slot.
    pub(crate) fn load_slot(&mut self, addr: *const pyrite_runtime::ObjRef) -> Value {
        let addr = self.iconst(addr as i64);
        self.builder
            .ins()
            .load(types::I64, MemFlags::trusted(), addr, 0)
    }

    /// Call a runtime helper with no result.
    pub(crate) fn call_helper(
        &mut self,
        name: &'static str,
        args: &[Value],
    ) -> Result<(), TranslateError> {
        let func = self.helpers.get(name)?;
        self.builder.ins().call(func, args);
        Ok(())
    }

    /// Call a runtime helper that produces a value.
    pub(crate) fn call_helper_ret(
        &mut self,
        name: &'static str,
        args: &[Value],
    ) -> Result<Value, TranslateError> {
        let func = self.helpers.get(name)?;
        let call = self.builder.ins().call(func, args);
        self.builder
            .inst_results(call)
            .first()
            .copied()
            .ok_or(TranslateError::MissingHelper(name))
    }

    /// Box a native slot so it can cross an ownership boundary.
    pub(crate) fn ensure_boxed(&mut self, slot: Slot) -> Result<Value, TranslateError> {
        match slot.tag {
            SlotTag::Boxed => Ok(slot.value),
            SlotTag::Native => self.call_helper_ret("pyr_box_int", &[slot.value]),
        }
    }

    /// Box every native slot still on the stack, in place.
    pub(crate) fn box_stack(&mut self) -> Result<(), TranslateError> {
        for i in 0..self.stack.depth() {
            let slot = self.stack.slots()[i];
            if slot.tag == SlotTag::Native {
                let boxed = self.call_helper_ret("pyr_box_int", &[slot.value])?;
                self.stack.slots_mut()[i] = Slot::boxed(boxed);
            }
        }
        Ok(())
    }

    /// Prepare the argument list for a jump to the target instruction,
    /// recording the target's stack depth on the first edge.
    pub(crate) fn edge_args(&mut self, target: usize) -> Result<Vec<Value>, TranslateError> {
        self.box_stack()?;
        let block = self.ensure_block(target);
        let depth = self.stack.depth();
        match self.shapes.get(&target) {
            Some(&expected) => {
                if expected != depth {
                    return Err(TranslateError::DepthMismatch {
                        at: target,
                        expected,
                        found: depth,
                    });
                }
            }
            None => {
                for _ in 0..depth {
                    self.builder.append_block_param(block, types::I64);
                }
                self.shapes.insert(target, depth);
            }
        }
        Ok(self.stack.slots().iter().map(|s| s.value).collect())
    }

    pub(crate) fn target_block(&mut self, target: usize) -> Block {
        self.ensure_block(target)
    }

    /// Release every reference the frame still owns and return the error
    /// sentinel. Emitted into whichever block the builder is positioned at.
    pub(crate) fn emit_error_return(&mut self) -> Result<(), TranslateError> {
        let live: Vec<Value> = self
            .stack
            .slots()
            .iter()
            .filter(|s| s.tag == SlotTag::Boxed)
            .map(|s| s.value)
            .collect();
        for value in live {
            self.call_helper("pyr_decref", &[value])?;
        }
        self.release_locals()?;
        let zero = self.iconst(0);
        self.builder.ins().return_(&[zero]);
        Ok(())
    }

    /// Normal return: the frame gives up its locals, the result unit
    /// transfers to the caller.
    pub(crate) fn emit_return(&mut self, value: Value) -> Result<(), TranslateError> {
        let live: Vec<Value> = self
            .stack
            .slots()
            .iter()
            .filter(|s| s.tag == SlotTag::Boxed)
            .map(|s| s.value)
            .collect();
        for v in live {
            self.call_helper("pyr_decref", &[v])?;
        }
        self.stack.clear();
        self.release_locals()?;
        self.builder.ins().return_(&[value]);
        Ok(())
    }

    fn release_locals(&mut self) -> Result<(), TranslateError> {
        for i in 0..self.vars.len() {
            let v = self.read_var(i)?;
            self.call_helper("pyr_decref", &[v])?;
        }
        Ok(())
    }

    /// Branch to an inline error epilogue when `result` is the null
    /// sentinel; execution continues with `result` known non-null.
    pub(crate) fn check_not_null(&mut self, result: Value) -> Result<(), TranslateError> {
        let err = self.builder.create_block();
        let cont = self.builder.create_block();
        let is_null = self
            .builder
            .ins()
            .icmp_imm(cranelift_codegen::ir::condcodes::IntCC::Equal, result, 0);
        self.builder.ins().brif(is_null, err, &[], cont, &[]);
        self.builder.switch_to_block(err);
        self.builder.seal_block(err);
        self.emit_error_return()?;
        self.builder.switch_to_block(cont);
        self.builder.seal_block(cont);
        Ok(())
    }

    /// Same as `check_not_null` for helpers that report failure as a
    /// negative status.
    pub(crate) fn check_status(&mut self, status: Value) -> Result<(), TranslateError> {
        let err = self.builder.create_block();
        let cont = self.builder.create_block();
        let failed = self.builder.ins().icmp_imm(
            cranelift_codegen::ir::condcodes::IntCC::SignedLessThan,
            status,
            0,
        );
        self.builder.ins().brif(failed, err, &[], cont, &[]);
        self.builder.switch_to_block(err);
        self.builder.seal_block(err);
        self.emit_error_return()?;
        self.builder.switch_to_block(cont);
        self.builder.seal_block(cont);
        Ok(())
    }
}
