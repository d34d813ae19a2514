//! JIT compiler for Python 3.13 bytecode using Cranelift.
//!
//! # Architecture
//!
//! - `JitEngine`: main entry point, owns the Cranelift JITModule and the
//!   installed functions
//! - `FunctionCompiler`: compiles a single function (bytecode -> IR)
//! - `translate`: per-opcode lowering, including the reference-count
//!   choreography
//! - `pyrite-runtime`: the object model and the `pyr_*` helpers that the
//!   generated code calls
//!
//! # Compiled Function Signature
//!
//! Every compiled function uses the same C ABI shape, one pointer-sized
//! parameter per Python parameter:
//! ```ignore
//! extern "C" fn(arg0: ObjRef, ..., argN: ObjRef) -> ObjRef
//! ```
//!
//! Arguments are borrowed from the caller. The result transfers one
//! reference unit out; a null result means the thread's pending-exception
//! slot holds the raised exception.
//!
//! # Threading
//!
//! Compilation is single-threaded (`&mut self`). A [`NativeEntry`] may be
//! moved or cloned into another thread, but the objects a unit touches
//! (its boxed constants, globals, and anything reachable from the
//! arguments) use unsynchronized interior mutability, so all calls that
//! can reach the same objects must run on one thread at a time. Entries
//! are `Send` and intentionally not `Sync`.

mod compiler;
mod insn;
pub mod opcodes;
mod stack;
mod translate;

pub use insn::{decode, FunctionSource, Instruction};

use std::collections::HashMap;
use std::sync::Arc;

use cranelift_codegen::ir::{types, AbiParam, Signature, UserFuncName};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::FunctionBuilderContext;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module};
use thiserror::Error;

use pyrite_runtime::error::{take_pending, RaisedError};
use pyrite_runtime::tables::UnitTables;
use pyrite_runtime::{ObjRef, OwnedRef};

use crate::compiler::{FunctionCompiler, HelperMap};

/// Entry adapters are generated for up to this many parameters.
pub const MAX_ENTRY_ARITY: usize = 4;

// =============================================================================
// Errors
// =============================================================================

/// A defect in the bytecode being translated.
#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("operand stack underflow")]
    StackUnderflow,
    #[error("unsupported opcode {opcode} ({name})")]
    UnsupportedOpcode { opcode: u8, name: &'static str },
    #[error("constant index {0} out of range")]
    BadConstIndex(usize),
    #[error("name index {0} out of range")]
    BadNameIndex(usize),
    #[error("local slot {0} out of range")]
    BadLocalSlot(usize),
    #[error("jump target {at} entered with stack depth {found}, expected {expected}")]
    DepthMismatch {
        at: usize,
        expected: usize,
        found: usize,
    },
    #[error("RAISE_VARARGS with unsupported argument count {0}")]
    BadRaiseForm(u32),
    #[error("runtime helper '{0}' is not registered")]
    MissingHelper(&'static str),
}

#[derive(Debug, Error)]
pub enum JitError {
    #[error("Cranelift module error: {0}")]
    Module(#[from] cranelift_module::ModuleError),
    #[error("IR verification failed: {0}")]
    Verify(String),
    #[error(transparent)]
    Translate(#[from] TranslateError),
    #[error("a function named '{0}' is already installed")]
    DuplicateName(String),
    #[error("function source is malformed: {0}")]
    BadSource(String),
    #[error("entry arity {0} exceeds the supported maximum of {MAX_ENTRY_ARITY}")]
    UnsupportedArity(usize),
    #[error("host setup error: {0}")]
    Host(String),
}

/// Failure of a call through a [`NativeEntry`].
#[derive(Debug, Error)]
pub enum CallError {
    #[error("function takes {expected} arguments, got {got}")]
    Arity { expected: usize, got: usize },
    #[error(transparent)]
    Raised(#[from] RaisedError),
}

// =============================================================================
// Runtime helper registry
// =============================================================================

/// (symbol, address, parameter count, has result). Every parameter and
/// result is pointer-sized.
type HelperSpec = (&'static str, *const u8, usize, bool);

fn runtime_helpers() -> Vec<HelperSpec> {
    use pyrite_runtime::api;
    vec![
        ("pyr_incref", api::pyr_incref as *const u8, 1, false),
        ("pyr_decref", api::pyr_decref as *const u8, 1, false),
        ("pyr_box_int", api::pyr_box_int as *const u8, 1, true),
        ("pyr_none_new", api::pyr_none_new as *const u8, 0, true),
        ("pyr_bool_new", api::pyr_bool_new as *const u8, 1, true),
        ("pyr_is_none", api::pyr_is_none as *const u8, 1, true),
        ("pyr_truth", api::pyr_truth as *const u8, 1, true),
        ("pyr_binary_op", api::pyr_binary_op as *const u8, 3, true),
        ("pyr_compare", api::pyr_compare as *const u8, 3, true),
        ("pyr_negate", api::pyr_negate as *const u8, 1, true),
        ("pyr_invert", api::pyr_invert as *const u8, 1, true),
        ("pyr_tuple_new", api::pyr_tuple_new as *const u8, 1, true),
        ("pyr_list_new", api::pyr_list_new as *const u8, 1, true),
        ("pyr_seq_set", api::pyr_seq_set as *const u8, 3, false),
        ("pyr_list_append", api::pyr_list_append as *const u8, 2, true),
        ("pyr_list_extend", api::pyr_list_extend as *const u8, 2, true),
        ("pyr_dict_new", api::pyr_dict_new as *const u8, 0, true),
        ("pyr_dict_set", api::pyr_dict_set as *const u8, 3, true),
        ("pyr_dict_update", api::pyr_dict_update as *const u8, 2, true),
        ("pyr_set_new", api::pyr_set_new as *const u8, 0, true),
        ("pyr_set_add", api::pyr_set_add as *const u8, 2, true),
        ("pyr_set_update", api::pyr_set_update as *const u8, 2, true),
        ("pyr_getitem", api::pyr_getitem as *const u8, 2, true),
        ("pyr_setitem", api::pyr_setitem as *const u8, 3, true),
        ("pyr_delitem", api::pyr_delitem as *const u8, 2, true),
        ("pyr_slice_new", api::pyr_slice_new as *const u8, 3, true),
        ("pyr_contains", api::pyr_contains as *const u8, 3, true),
        ("pyr_getattr", api::pyr_getattr as *const u8, 2, true),
        ("pyr_setattr", api::pyr_setattr as *const u8, 3, true),
        ("pyr_getiter", api::pyr_getiter as *const u8, 1, true),
        ("pyr_iter_next", api::pyr_iter_next as *const u8, 1, true),
        ("pyr_seq_get", api::pyr_seq_get as *const u8, 2, true),
        ("pyr_unpack_check", api::pyr_unpack_check as *const u8, 2, true),
        ("pyr_global_load", api::pyr_global_load as *const u8, 2, true),
        ("pyr_call", api::pyr_call as *const u8, 4, true),
        ("pyr_call_ex", api::pyr_call_ex as *const u8, 3, true),
        ("pyr_raise", api::pyr_raise as *const u8, 1, false),
        ("pyr_raise_from", api::pyr_raise_from as *const u8, 2, false),
        ("pyr_reraise", api::pyr_reraise as *const u8, 0, false),
        ("pyr_pending", api::pyr_pending as *const u8, 0, true),
        ("pyr_exc_save", api::pyr_exc_save as *const u8, 1, true),
        ("pyr_exc_restore", api::pyr_exc_restore as *const u8, 1, false),
        ("pyr_exc_matches", api::pyr_exc_matches as *const u8, 2, true),
    ]
}

// =============================================================================
// NativeEntry
// =============================================================================

/// An installed function: executable code plus the side tables it reads.
#[derive(Clone)]
pub struct NativeEntry {
    code_ptr: *const u8,
    param_count: usize,
    tables: Arc<UnitTables>,
}

// SAFETY: code_ptr points into executable memory owned by the engine's
// JITModule, which is never freed while entries are reachable, and the
// table structure itself is safe to hand between threads. Entries are
// deliberately not Sync: executing compiled code mutates unsynchronized
// interior state of the unit's objects (see the module doc on threading),
// so callers move or clone an entry into a thread rather than sharing one
// by reference.
unsafe impl Send for NativeEntry {}

impl NativeEntry {
    pub fn param_count(&self) -> usize {
        self.param_count
    }

    /// The unit's side tables, e.g. for binding globals before a call.
    pub fn tables(&self) -> &UnitTables {
        &self.tables
    }

    /// Invoke the compiled function. Arguments are borrowed; the result is
    /// a fresh ownership unit.
    pub fn call(&self, args: &[OwnedRef]) -> Result<OwnedRef, CallError> {
        if args.len() != self.param_count {
            return Err(CallError::Arity {
                expected: self.param_count,
                got: args.len(),
            });
        }
        let p = |i: usize| args[i].as_ptr();
        // SAFETY: the signature was fixed at compile time and the arity
        // was checked above.
        let raw: ObjRef = unsafe {
            match self.param_count {
                0 => {
                    let f: extern "C" fn() -> ObjRef = std::mem::transmute(self.code_ptr);
                    f()
                }
                1 => {
                    let f: extern "C" fn(ObjRef) -> ObjRef = std::mem::transmute(self.code_ptr);
                    f(p(0))
                }
                2 => {
                    let f: extern "C" fn(ObjRef, ObjRef) -> ObjRef =
                        std::mem::transmute(self.code_ptr);
                    f(p(0), p(1))
                }
                3 => {
                    let f: extern "C" fn(ObjRef, ObjRef, ObjRef) -> ObjRef =
                        std::mem::transmute(self.code_ptr);
                    f(p(0), p(1), p(2))
                }
                4 => {
                    let f: extern "C" fn(ObjRef, ObjRef, ObjRef, ObjRef) -> ObjRef =
                        std::mem::transmute(self.code_ptr);
                    f(p(0), p(1), p(2), p(3))
                }
                _ => unreachable!("arity bounded at compile time"),
            }
        };
        match unsafe { OwnedRef::from_raw(raw) } {
            Some(value) => Ok(value),
            None => {
                let exc = take_pending().unwrap_or_else(|| {
                    pyrite_runtime::error::runtime_error(
                        "compiled function failed without raising",
                    )
                });
                Err(RaisedError::new(exc).into())
            }
        }
    }
}

// =============================================================================
// JitEngine
// =============================================================================

/// Compiles bytecode functions to native code and keeps them installed
/// under their unique names.
pub struct JitEngine {
    module: JITModule,
    ctx: cranelift_codegen::Context,
    /// FuncIds for the runtime helpers, declared once at engine creation.
    helper_ids: HashMap<&'static str, FuncId>,
    installed: HashMap<String, NativeEntry>,
    next_id: u32,
}

impl JitEngine {
    /// Create an engine. `opt_level` follows the usual 0..=3 scale and is
    /// clamped: 0 disables optimization, 1 and 2 optimize for speed, 3
    /// trades a little speed for size.
    pub fn new(opt_level: u8) -> Result<Self, JitError> {
        let mut flag_builder = settings::builder();
        let level = match opt_level {
            0 => "none",
            1 | 2 => "speed",
            _ => "speed_and_size",
        };
        flag_builder
            .set("opt_level", level)
            .map_err(|e| JitError::Host(e.to_string()))?;

        let isa_builder = cranelift_native::builder().map_err(|e| JitError::Host(e.to_string()))?;
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| JitError::Host(e.to_string()))?;

        let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        for (name, addr, _, _) in runtime_helpers() {
            builder.symbol(name, addr);
        }

        let mut module = JITModule::new(builder);
        let ctx = module.make_context();

        // Declare every helper once; each compilation rebinds them into
        // the function being built.
        let call_conv = module.target_config().default_call_conv;
        let mut helper_ids = HashMap::new();
        for (name, _, params, has_result) in runtime_helpers() {
            let mut sig = Signature::new(call_conv);
            for _ in 0..params {
                sig.params.push(AbiParam::new(types::I64));
            }
            if has_result {
                sig.returns.push(AbiParam::new(types::I64));
            }
            let id = module.declare_function(name, Linkage::Import, &sig)?;
            helper_ids.insert(name, id);
        }

        Ok(Self {
            module,
            ctx,
            helper_ids,
            installed: HashMap::new(),
            next_id: 0,
        })
    }

    /// Compile `source` and install it under its name.
    ///
    /// Names are permanent: compiling a second function under an already
    /// installed name is an error, never a silent replacement.
    pub fn compile(&mut self, source: &FunctionSource) -> Result<(), JitError> {
        if self.installed.contains_key(&source.name) {
            return Err(JitError::DuplicateName(source.name.clone()));
        }
        if source.param_count > MAX_ENTRY_ARITY {
            return Err(JitError::UnsupportedArity(source.param_count));
        }
        if source.local_count < source.param_count {
            return Err(JitError::BadSource(format!(
                "local_count {} is below param_count {}",
                source.local_count, source.param_count
            )));
        }
        log::debug!(
            "compiling '{}': {} instructions, {} params",
            source.name,
            source.code.len(),
            source.param_count
        );

        // The side tables are pinned behind an Arc so the addresses baked
        // into the code stay valid for the entry's lifetime.
        let tables = Arc::new(UnitTables::new(
            source.consts.clone(),
            source.names.clone(),
        ));

        let call_conv = self.module.target_config().default_call_conv;
        let mut sig = Signature::new(call_conv);
        for _ in 0..source.param_count {
            sig.params.push(AbiParam::new(types::I64));
        }
        sig.returns.push(AbiParam::new(types::I64));

        let func_id = self
            .module
            .declare_function(&source.name, Linkage::Local, &sig)?;

        self.ctx.func.signature = sig;
        self.ctx.func.name = UserFuncName::user(0, self.next_id);
        self.next_id += 1;

        let mut func_ctx = FunctionBuilderContext::new();
        let mut helpers = HelperMap::new();
        for (&name, &id) in &self.helper_ids {
            let func_ref = self.module.declare_func_in_func(id, &mut self.ctx.func);
            helpers.insert(name, func_ref);
        }

        let compiler = FunctionCompiler::new(
            &mut self.ctx.func,
            &mut func_ctx,
            source,
            &tables,
            &helpers,
        );
        compiler.compile()?;

        if std::env::var("PYRITE_DUMP_IR").is_ok() {
            eprintln!("=== IR for {} ===", source.name);
            eprintln!("{}", self.ctx.func);
            eprintln!("=== End IR ===\n");
        }

        cranelift_codegen::verify_function(&self.ctx.func, self.module.isa())
            .map_err(|e| JitError::Verify(e.to_string()))?;

        self.module.define_function(func_id, &mut self.ctx)?;
        self.module.clear_context(&mut self.ctx);
        self.module.finalize_definitions()?;
        let code_ptr = self.module.get_finalized_function(func_id);
        log::debug!("installed '{}'", source.name);

        self.installed.insert(
            source.name.clone(),
            NativeEntry {
                code_ptr,
                param_count: source.param_count,
                tables,
            },
        );
        Ok(())
    }

    /// Look up an installed function.
    pub fn lookup(&self, name: &str) -> Option<&NativeEntry> {
        self.installed.get(name)
    }

    pub fn installed_count(&self) -> usize {
        self.installed.len()
    }
}
