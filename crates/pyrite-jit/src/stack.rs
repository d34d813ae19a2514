//! The compile-time model of the operand stack.
//!
//! Translation never materializes a runtime stack; it tracks which SSA
//! value each stack slot would hold and whether that value is an unboxed
//! machine integer or an owned object pointer.

use cranelift_codegen::ir::Value;

use crate::TranslateError;

/// How a stack slot is represented in generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotTag {
    /// Unboxed i64. No ownership attached.
    Native,
    /// Object pointer; the frame owns one reference unit. May be the null
    /// "no self" marker pushed for calls.
    Boxed,
}

#[derive(Debug, Clone, Copy)]
pub struct Slot {
    pub tag: SlotTag,
    pub value: Value,
}

impl Slot {
    pub fn native(value: Value) -> Self {
        Slot {
            tag: SlotTag::Native,
            value,
        }
    }

    pub fn boxed(value: Value) -> Self {
        Slot {
            tag: SlotTag::Boxed,
            value,
        }
    }
}

/// Operand stack as seen at the current translation point.
#[derive(Default)]
pub struct EvalStack {
    slots: Vec<Slot>,
}

impl EvalStack {
    pub fn new() -> Self {
        EvalStack { slots: Vec::new() }
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    pub fn push(&mut self, slot: Slot) {
        self.slots.push(slot);
    }

    pub fn pop(&mut self) -> Result<Slot, TranslateError> {
        self.slots.pop().ok_or(TranslateError::StackUnderflow)
    }

    pub fn pop_n(&mut self, n: usize) -> Result<Vec<Slot>, TranslateError> {
        if self.slots.len() < n {
            return Err(TranslateError::StackUnderflow);
        }
        Ok(self.slots.split_off(self.slots.len() - n))
    }

    /// Slot `n` positions below the top (1 = top).
    pub fn peek(&self, n: usize) -> Result<Slot, TranslateError> {
        self.slots
            .len()
            .checked_sub(n)
            .and_then(|i| self.slots.get(i))
            .copied()
            .ok_or(TranslateError::StackUnderflow)
    }

    /// Replace slot `n` positions below the top.
    pub fn set(&mut self, n: usize, slot: Slot) -> Result<(), TranslateError> {
        let i = self
            .slots
            .len()
            .checked_sub(n)
            .ok_or(TranslateError::StackUnderflow)?;
        *self
            .slots
            .get_mut(i)
            .ok_or(TranslateError::StackUnderflow)? = slot;
        Ok(())
    }

    /// Swap the top with the slot `n` positions below it (1 = top). An
    /// operand of zero is malformed bytecode, not a panic.
    pub fn swap_with_top(&mut self, n: usize) -> Result<(), TranslateError> {
        let len = self.slots.len();
        if n == 0 || n > len {
            return Err(TranslateError::StackUnderflow);
        }
        self.slots.swap(len - n, len - 1);
        Ok(())
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn slots_mut(&mut self) -> &mut [Slot] {
        &mut self.slots
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Rebuild the stack from block parameters; everything crossing a block
    /// boundary is boxed.
    pub fn reset_from_params(&mut self, params: &[Value]) {
        self.slots.clear();
        self.slots.extend(params.iter().map(|&v| Slot::boxed(v)));
    }
}
