//! Pyrite runtime: the boxed object model, operator semantics, and the
//! C-ABI surface that JIT-compiled code calls into.
//!
//! The runtime is independent of any particular code generator. It owns:
//!
//! - the reference-counted object model ([`object`], [`handle`])
//! - operator and protocol semantics ([`ops`], [`seq`])
//! - exception state and builtin exception types ([`error`])
//! - per-unit constant/name/global side tables ([`tables`])
//! - the `pyr_*` extern functions registered with the JIT ([`api`])

pub mod api;
pub mod error;
pub mod handle;
pub mod object;
pub mod ops;
pub mod seq;
pub mod tables;

pub use error::RaisedError;
pub use handle::{decref, incref, ObjRef, OwnedRef};
pub use object::{repr, truthy, NativeFn, Obj, Payload};
pub use ops::{BinOp, CmpOp};
pub use tables::{Const, UnitTables};
