//! Per-unit side tables.
//!
//! Compiled code never bakes object addresses into instructions. Instead
//! each translation unit owns a `UnitTables` with its constants, interned
//! names, and global bindings, and generated code reaches them through the
//! table pointer plus an index. The pointer arrays are allocated once and
//! never reallocated, so their element addresses are stable for the lifetime
//! of the unit.

use std::sync::Mutex;

use crate::error::name_error;
use crate::handle::{ObjRef, OwnedRef};

/// A constant-pool entry as supplied by the frontend.
#[derive(Clone)]
pub enum Const {
    /// Small integer, eligible for the unboxed fast path.
    Int(i64),
    /// Anything else, pre-boxed.
    Obj(OwnedRef),
}

impl Const {
    pub fn is_int(&self) -> bool {
        matches!(self, Const::Int(_))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Const::Int(i) => Some(*i),
            Const::Obj(_) => None,
        }
    }
}

pub struct UnitTables {
    consts: Vec<Const>,
    names: Vec<String>,
    /// Boxed constants, parallel to `consts`; null for `Const::Int` entries.
    /// Boxed lazily at table build so generated loads are a plain deref.
    const_ptrs: Box<[ObjRef]>,
    /// Interned name objects, parallel to `names`.
    name_ptrs: Box<[ObjRef]>,
    /// Global bindings, parallel to `names`. None means unbound.
    globals: Mutex<Vec<Option<OwnedRef>>>,
    /// Owners of the boxed entries in `const_ptrs` and `name_ptrs`.
    _const_owners: Vec<OwnedRef>,
    _name_owners: Vec<OwnedRef>,
}

// SAFETY: the raw pointer arrays only alias objects kept alive by the
// owner vectors; the arrays themselves are read-only after construction
// and global bindings go through the Mutex. This covers the table
// structure only: the objects handed out are refcounted atomically but
// carry unsynchronized cells, so code touching a unit's objects must be
// confined to one thread at a time.
unsafe impl Send for UnitTables {}
unsafe impl Sync for UnitTables {}

impl UnitTables {
    pub fn new(consts: Vec<Const>, names: Vec<String>) -> Self {
        let mut const_owners = Vec::new();
        let const_ptrs: Box<[ObjRef]> = consts
            .iter()
            .map(|c| match c {
                Const::Int(_) => std::ptr::null_mut(),
                Const::Obj(o) => {
                    let owned = o.clone();
                    let ptr = owned.as_ptr();
                    const_owners.push(owned);
                    ptr
                }
            })
            .collect();
        let mut name_owners = Vec::new();
        let name_ptrs: Box<[ObjRef]> = names
            .iter()
            .map(|n| {
                let owned = OwnedRef::str(n.clone());
                let ptr = owned.as_ptr();
                name_owners.push(owned);
                ptr
            })
            .collect();
        let globals = Mutex::new(vec![None; names.len()]);
        UnitTables {
            consts,
            names,
            const_ptrs,
            name_ptrs,
            globals,
            _const_owners: const_owners,
            _name_owners: name_owners,
        }
    }

    pub fn const_count(&self) -> usize {
        self.consts.len()
    }

    pub fn name_count(&self) -> usize {
        self.names.len()
    }

    pub fn const_at(&self, idx: usize) -> Option<&Const> {
        self.consts.get(idx)
    }

    pub fn name_at(&self, idx: usize) -> Option<&str> {
        self.names.get(idx).map(String::as_str)
    }

    /// Address of the boxed-constant slot, for a load emitted by the
    /// compiler. Null slot contents mean the constant is an unboxed int.
    pub fn const_slot_addr(&self, idx: usize) -> Option<*const ObjRef> {
        self.const_ptrs.get(idx).map(|p| p as *const ObjRef)
    }

    /// Address of the interned-name slot.
    pub fn name_slot_addr(&self, idx: usize) -> Option<*const ObjRef> {
        self.name_ptrs.get(idx).map(|p| p as *const ObjRef)
    }

    /// Bind a global by name. Unknown names are ignored (the unit never
    /// references them).
    pub fn set_global(&self, name: &str, value: OwnedRef) {
        match self.names.iter().position(|n| n == name) {
            Some(idx) => {
                if let Ok(mut globals) = self.globals.lock() {
                    log::debug!("bound global '{}'", name);
                    globals[idx] = Some(value);
                }
            }
            None => {
                log::debug!("no slot for global '{}', binding ignored", name);
            }
        }
    }

    /// Look up global slot `idx`, returning a fresh ownership unit.
    pub fn global_at(&self, idx: usize) -> Result<OwnedRef, OwnedRef> {
        let bound = self
            .globals
            .lock()
            .ok()
            .and_then(|g| g.get(idx).cloned().flatten());
        match bound {
            Some(v) => Ok(v),
            None => {
                let name = self.name_at(idx).unwrap_or("?");
                Err(name_error(format!("name '{}' is not defined", name)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::repr;

    #[test]
    fn int_consts_have_null_slots() {
        let tables = UnitTables::new(
            vec![Const::Int(5), Const::Obj(OwnedRef::str("hi"))],
            vec![],
        );
        let int_slot = tables.const_slot_addr(0).unwrap();
        let obj_slot = tables.const_slot_addr(1).unwrap();
        assert!(unsafe { *int_slot }.is_null());
        assert!(!unsafe { *obj_slot }.is_null());
        assert!(tables.const_slot_addr(2).is_none());
    }

    #[test]
    fn name_slots_hold_interned_strings() {
        let tables = UnitTables::new(vec![], vec!["x".into(), "print".into()]);
        let slot = tables.name_slot_addr(1).unwrap();
        let ptr = unsafe { *slot };
        assert_eq!(repr(unsafe { &*ptr }), "'print'");
    }

    #[test]
    fn unbound_global_is_a_name_error() {
        let tables = UnitTables::new(vec![], vec!["g".into()]);
        assert!(tables.global_at(0).is_err());
        tables.set_global("g", OwnedRef::int(9));
        let got = tables.global_at(0).unwrap();
        assert_eq!(repr(got.obj()), "9");
    }

    #[test]
    fn binding_unknown_name_is_a_no_op() {
        let tables = UnitTables::new(vec![], vec!["a".into()]);
        tables.set_global("missing", OwnedRef::int(1));
        assert!(tables.global_at(0).is_err());
    }
}
