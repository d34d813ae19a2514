//! C-ABI entry points for generated code.
//!
//! Every function here is registered as a callable symbol with the JIT
//! module. The ABI is deliberately narrow: arguments and results are
//! `ObjRef` (a raw object pointer) or `i64`. A null `ObjRef` result, or a
//! negative `i64` status, means an exception is pending in the calling
//! thread's slot.
//!
//! Ownership convention: unless a function's docs say otherwise, pointer
//! arguments are borrowed and pointer results transfer one ownership unit
//! to the caller.
//!
//! # Safety
//!
//! These functions are only sound when called with pointers produced by
//! this runtime. Generated code upholds that by construction; host code
//! should prefer the safe `OwnedRef` API.

use crate::error::{self, normalize_raise, set_pending, type_error};
use crate::handle::{decref, incref, ObjRef, OwnedRef};
use crate::object::{truthy, Payload};
use crate::ops::{binary_op, compare, invert, negate, BinOp, CmpOp};
use crate::seq;
use crate::tables::UnitTables;

/// Borrow a raw handle for the duration of a call without touching its
/// ownership count.
///
/// # Safety
/// `ptr` must be non-null and live.
unsafe fn borrowed(ptr: ObjRef) -> &'static crate::object::Obj {
    &*ptr
}

fn take(result: Result<OwnedRef, OwnedRef>) -> ObjRef {
    match result {
        Ok(v) => v.into_raw(),
        Err(exc) => {
            set_pending(exc);
            std::ptr::null_mut()
        }
    }
}

fn status(result: Result<(), OwnedRef>) -> i64 {
    match result {
        Ok(()) => 0,
        Err(exc) => {
            set_pending(exc);
            -1
        }
    }
}

// =============================================================================
// Ownership
// =============================================================================

/// # Safety
/// `ptr` must be null or a live object handle.
#[no_mangle]
pub unsafe extern "C" fn pyr_incref(ptr: ObjRef) {
    incref(ptr);
}

/// # Safety
/// `ptr` must be null or a live handle on which the caller holds a unit.
#[no_mangle]
pub unsafe extern "C" fn pyr_decref(ptr: ObjRef) {
    decref(ptr);
}

// =============================================================================
// Boxing and singletons
// =============================================================================

#[no_mangle]
pub extern "C" fn pyr_box_int(value: i64) -> ObjRef {
    OwnedRef::int(value).into_raw()
}

#[no_mangle]
pub extern "C" fn pyr_none_new() -> ObjRef {
    OwnedRef::none().into_raw()
}

#[no_mangle]
pub extern "C" fn pyr_bool_new(value: i64) -> ObjRef {
    OwnedRef::bool_obj(value != 0).into_raw()
}

/// # Safety
/// `ptr` must be null or live.
#[no_mangle]
pub unsafe extern "C" fn pyr_is_none(ptr: ObjRef) -> i64 {
    if ptr.is_null() {
        return 0;
    }
    matches!(borrowed(ptr).payload, Payload::None) as i64
}

/// Truth value of a live object. Cannot fail.
///
/// # Safety
/// `ptr` must be live.
#[no_mangle]
pub unsafe extern "C" fn pyr_truth(ptr: ObjRef) -> i64 {
    truthy(borrowed(ptr)) as i64
}

// =============================================================================
// Operators
// =============================================================================

/// Binary operator dispatch; `op` is a `BinOp` code from `pyr_binop_code`.
///
/// # Safety
/// `a` and `b` must be live.
#[no_mangle]
pub unsafe extern "C" fn pyr_binary_op(op: i64, a: ObjRef, b: ObjRef) -> ObjRef {
    let Some(op) = BinOp::from_code(op) else {
        set_pending(type_error("invalid binary operator code"));
        return std::ptr::null_mut();
    };
    take(binary_op(op, borrowed(a), borrowed(b)))
}

/// Rich comparison; `op` is a `CmpOp` code from `pyr_cmpop_code`.
///
/// # Safety
/// `a` and `b` must be live.
#[no_mangle]
pub unsafe extern "C" fn pyr_compare(op: i64, a: ObjRef, b: ObjRef) -> ObjRef {
    let Some(op) = CmpOp::from_code(op) else {
        set_pending(type_error("invalid comparison operator code"));
        return std::ptr::null_mut();
    };
    take(compare(op, borrowed(a), borrowed(b)))
}

/// # Safety
/// `a` must be live.
#[no_mangle]
pub unsafe extern "C" fn pyr_negate(a: ObjRef) -> ObjRef {
    take(negate(borrowed(a)))
}

/// # Safety
/// `a` must be live.
#[no_mangle]
pub unsafe extern "C" fn pyr_invert(a: ObjRef) -> ObjRef {
    take(invert(borrowed(a)))
}

// =============================================================================
// Containers
// =============================================================================

#[no_mangle]
pub extern "C" fn pyr_tuple_new(len: i64) -> ObjRef {
    let elems = (0..len).map(|_| OwnedRef::none()).collect();
    OwnedRef::tuple(elems).into_raw()
}

#[no_mangle]
pub extern "C" fn pyr_list_new(len: i64) -> ObjRef {
    let elems = (0..len).map(|_| OwnedRef::none()).collect();
    OwnedRef::list(elems).into_raw()
}

/// Store `value` at index `idx` of a freshly built tuple or list. Steals
/// `value`.
///
/// # Safety
/// `seq` must be a live tuple or list with `idx` in range; `value` must be
/// a live handle whose unit transfers in.
#[no_mangle]
pub unsafe extern "C" fn pyr_seq_set(seq: ObjRef, idx: i64, value: ObjRef) {
    let value = match OwnedRef::from_raw(value) {
        Some(v) => v,
        None => return,
    };
    match &borrowed(seq).payload {
        Payload::Tuple(v) | Payload::List(v) => {
            if let Some(slot) = v.borrow_mut().get_mut(idx as usize) {
                *slot = value;
            }
        }
        _ => {}
    }
}

/// Append to a list. Steals `value`.
///
/// # Safety
/// `list` must be a live list; `value` transfers in.
#[no_mangle]
pub unsafe extern "C" fn pyr_list_append(list: ObjRef, value: ObjRef) -> i64 {
    let Some(value) = OwnedRef::from_raw(value) else {
        return -1;
    };
    match &borrowed(list).payload {
        Payload::List(v) => {
            v.borrow_mut().push(value);
            0
        }
        _ => {
            set_pending(type_error("append target is not a list"));
            -1
        }
    }
}

/// Extend a list with the elements of an iterable. Borrows `iterable`.
///
/// # Safety
/// Both handles must be live.
#[no_mangle]
pub unsafe extern "C" fn pyr_list_extend(list: ObjRef, iterable: ObjRef) -> i64 {
    let src = borrowed(iterable);
    let dst = match &borrowed(list).payload {
        Payload::List(v) => v,
        _ => {
            set_pending(type_error("extend target is not a list"));
            return -1;
        }
    };
    let mut i = 0;
    loop {
        match seq::seq_get(src, i) {
            Ok(Some(elem)) => dst.borrow_mut().push(elem),
            Ok(None) => return 0,
            Err(exc) => {
                set_pending(exc);
                return -1;
            }
        }
        i += 1;
    }
}

#[no_mangle]
pub extern "C" fn pyr_dict_new() -> ObjRef {
    OwnedRef::dict().into_raw()
}

/// Insert into a dict. Borrows both key and value.
///
/// # Safety
/// All handles must be live.
#[no_mangle]
pub unsafe extern "C" fn pyr_dict_set(dict: ObjRef, key: ObjRef, value: ObjRef) -> i64 {
    incref(value);
    let Some(value) = OwnedRef::from_raw(value) else {
        return -1;
    };
    status(seq::setitem(borrowed(dict), borrowed(key), value))
}

/// Merge `other`'s entries into `dict`. Borrows `other`.
///
/// # Safety
/// Both handles must be live.
#[no_mangle]
pub unsafe extern "C" fn pyr_dict_update(dict: ObjRef, other: ObjRef) -> i64 {
    let pairs = match &borrowed(other).payload {
        Payload::Dict(pairs) => pairs.borrow().clone(),
        _ => {
            set_pending(type_error(format!(
                "'{}' object is not a mapping",
                borrowed(other).type_name()
            )));
            return -1;
        }
    };
    for (k, v) in pairs {
        if status(seq::setitem(borrowed(dict), k.obj(), v)) != 0 {
            return -1;
        }
    }
    0
}

#[no_mangle]
pub extern "C" fn pyr_set_new() -> ObjRef {
    OwnedRef::set().into_raw()
}

/// Add to a set. Borrows `value`.
///
/// # Safety
/// Both handles must be live.
#[no_mangle]
pub unsafe extern "C" fn pyr_set_add(set: ObjRef, value: ObjRef) -> i64 {
    let elems = match &borrowed(set).payload {
        Payload::Set(v) => v,
        _ => {
            set_pending(type_error("add target is not a set"));
            return -1;
        }
    };
    let present = elems
        .borrow()
        .iter()
        .any(|e| crate::object::obj_eq(e.obj(), borrowed(value)));
    if !present {
        incref(value);
        if let Some(value) = OwnedRef::from_raw(value) {
            elems.borrow_mut().push(value);
        }
    }
    0
}

/// Add every element of an iterable to a set. Borrows `iterable`.
///
/// # Safety
/// Both handles must be live.
#[no_mangle]
pub unsafe extern "C" fn pyr_set_update(set: ObjRef, iterable: ObjRef) -> i64 {
    let src = borrowed(iterable);
    let mut i = 0;
    loop {
        match seq::seq_get(src, i) {
            Ok(Some(elem)) => {
                if pyr_set_add(set, elem.as_ptr()) != 0 {
                    return -1;
                }
            }
            Ok(None) => return 0,
            Err(exc) => {
                set_pending(exc);
                return -1;
            }
        }
        i += 1;
    }
}

// =============================================================================
// Subscripts, slices, attributes
// =============================================================================

/// # Safety
/// Both handles must be live.
#[no_mangle]
pub unsafe extern "C" fn pyr_getitem(obj: ObjRef, key: ObjRef) -> ObjRef {
    take(seq::getitem(borrowed(obj), borrowed(key)))
}

/// `obj[key] = value`. Borrows all three.
///
/// # Safety
/// All handles must be live.
#[no_mangle]
pub unsafe extern "C" fn pyr_setitem(obj: ObjRef, key: ObjRef, value: ObjRef) -> i64 {
    incref(value);
    let Some(value) = OwnedRef::from_raw(value) else {
        return -1;
    };
    status(seq::setitem(borrowed(obj), borrowed(key), value))
}

/// # Safety
/// Both handles must be live.
#[no_mangle]
pub unsafe extern "C" fn pyr_delitem(obj: ObjRef, key: ObjRef) -> i64 {
    status(seq::delitem(borrowed(obj), borrowed(key)))
}

/// Build a slice object. Borrows the bounds; null means "absent".
///
/// # Safety
/// Non-null arguments must be live.
#[no_mangle]
pub unsafe extern "C" fn pyr_slice_new(start: ObjRef, stop: ObjRef, step: ObjRef) -> ObjRef {
    let grab = |ptr: ObjRef| {
        if ptr.is_null() {
            None
        } else {
            incref(ptr);
            OwnedRef::from_raw(ptr)
        }
    };
    OwnedRef::new(Payload::Slice {
        start: grab(start),
        stop: grab(stop),
        step: grab(step),
    })
    .into_raw()
}

/// Membership test; `invert` flips the result. Returns 0/1, or -1 on error.
///
/// # Safety
/// Both handles must be live.
#[no_mangle]
pub unsafe extern "C" fn pyr_contains(container: ObjRef, item: ObjRef, invert: i64) -> i64 {
    match seq::contains(borrowed(container), borrowed(item)) {
        Ok(found) => (found ^ (invert != 0)) as i64,
        Err(exc) => {
            set_pending(exc);
            -1
        }
    }
}

/// Attribute load; `name` must be a string object.
///
/// # Safety
/// Both handles must be live.
#[no_mangle]
pub unsafe extern "C" fn pyr_getattr(obj: ObjRef, name: ObjRef) -> ObjRef {
    let name = match &borrowed(name).payload {
        Payload::Str(s) => s.clone(),
        _ => {
            set_pending(type_error("attribute name must be a string"));
            return std::ptr::null_mut();
        }
    };
    take(seq::getattr(borrowed(obj), &name))
}

/// Attribute store; a null `value` deletes the attribute. Borrows all.
///
/// # Safety
/// `obj` and `name` must be live; `value` must be null or live.
#[no_mangle]
pub unsafe extern "C" fn pyr_setattr(obj: ObjRef, name: ObjRef, value: ObjRef) -> i64 {
    let name = match &borrowed(name).payload {
        Payload::Str(s) => s.clone(),
        _ => {
            set_pending(type_error("attribute name must be a string"));
            return -1;
        }
    };
    let value = if value.is_null() {
        None
    } else {
        incref(value);
        OwnedRef::from_raw(value)
    };
    status(seq::setattr(borrowed(obj), &name, value))
}

// =============================================================================
// Iteration
// =============================================================================

/// # Safety
/// `obj` must be live.
#[no_mangle]
pub unsafe extern "C" fn pyr_getiter(obj: ObjRef) -> ObjRef {
    incref(obj);
    let Some(owned) = OwnedRef::from_raw(obj) else {
        return std::ptr::null_mut();
    };
    take(seq::getiter(borrowed(obj), &owned))
}

/// Advance an iterator. Null with no pending exception means exhausted.
///
/// # Safety
/// `iter` must be live.
#[no_mangle]
pub unsafe extern "C" fn pyr_iter_next(iter: ObjRef) -> ObjRef {
    match seq::iter_next(borrowed(iter)) {
        Ok(Some(v)) => v.into_raw(),
        Ok(None) => std::ptr::null_mut(),
        Err(exc) => {
            set_pending(exc);
            std::ptr::null_mut()
        }
    }
}

/// Element `i` of a sequence, for unpacking. Errors if out of range.
///
/// # Safety
/// `obj` must be live.
#[no_mangle]
pub unsafe extern "C" fn pyr_seq_get(obj: ObjRef, i: i64) -> ObjRef {
    match seq::seq_get(borrowed(obj), i as usize) {
        Ok(Some(v)) => v.into_raw(),
        Ok(None) => {
            set_pending(crate::error::value_error(
                "not enough values to unpack",
            ));
            std::ptr::null_mut()
        }
        Err(exc) => {
            set_pending(exc);
            std::ptr::null_mut()
        }
    }
}

/// Verify that `obj` is a sequence of exactly `expected` elements, so a
/// following run of `pyr_seq_get` calls cannot fail.
///
/// # Safety
/// `obj` must be live.
#[no_mangle]
pub unsafe extern "C" fn pyr_unpack_check(obj: ObjRef, expected: i64) -> i64 {
    match seq::seq_len(borrowed(obj)) {
        Ok(n) if n as i64 == expected => 0,
        Ok(n) if (n as i64) < expected => {
            set_pending(crate::error::value_error(format!(
                "not enough values to unpack (expected {}, got {})",
                expected, n
            )));
            -1
        }
        Ok(_) => {
            set_pending(crate::error::value_error(format!(
                "too many values to unpack (expected {})",
                expected
            )));
            -1
        }
        Err(exc) => {
            set_pending(exc);
            -1
        }
    }
}

// =============================================================================
// Globals
// =============================================================================

/// Load global slot `idx` from a unit's side tables.
///
/// # Safety
/// `tables` must point to the live `UnitTables` of the executing unit.
#[no_mangle]
pub unsafe extern "C" fn pyr_global_load(tables: *const UnitTables, idx: i64) -> ObjRef {
    take((*tables).global_at(idx as usize))
}

// =============================================================================
// Calls
// =============================================================================

fn split_call_args(
    args: &[ObjRef],
    kwnames: Option<&crate::object::Obj>,
) -> Result<(Vec<ObjRef>, Vec<(ObjRef, ObjRef)>), OwnedRef> {
    let Some(kwnames) = kwnames else {
        return Ok((args.to_vec(), Vec::new()));
    };
    let names = match &kwnames.payload {
        Payload::Tuple(v) => v.borrow(),
        _ => return Err(type_error("keyword names must be a tuple")),
    };
    let nkw = names.len();
    if nkw > args.len() {
        return Err(type_error("more keyword names than arguments"));
    }
    let npos = args.len() - nkw;
    let kwargs = names
        .iter()
        .zip(&args[npos..])
        .map(|(name, value)| (name.as_ptr(), *value))
        .collect();
    Ok((args[..npos].to_vec(), kwargs))
}

fn do_call(
    callable: ObjRef,
    self_or_null: ObjRef,
    args_tuple: ObjRef,
    kwnames: ObjRef,
) -> Result<OwnedRef, OwnedRef> {
    let callable = unsafe { borrowed(callable) };
    let func = match &callable.payload {
        Payload::Function { func, .. } => *func,
        Payload::ExcType { .. } => {
            // Calling an exception type constructs an instance.
            let args = unsafe { borrowed(args_tuple) };
            let message = match &args.payload {
                Payload::Tuple(v) => v
                    .borrow()
                    .first()
                    .map(|m| m.to_string())
                    .unwrap_or_default(),
                _ => String::new(),
            };
            incref(callable as *const crate::object::Obj as ObjRef);
            let ty = unsafe {
                OwnedRef::from_raw(callable as *const crate::object::Obj as ObjRef)
            }
            .ok_or_else(|| type_error("null callable"))?;
            return Ok(error::new_exc(ty, message));
        }
        _ => {
            return Err(type_error(format!(
                "'{}' object is not callable",
                callable.type_name()
            )))
        }
    };
    let positional = match unsafe { &borrowed(args_tuple).payload } {
        Payload::Tuple(v) => v.borrow().iter().map(|e| e.as_ptr()).collect::<Vec<_>>(),
        _ => return Err(type_error("argument pack must be a tuple")),
    };
    let mut all_args = Vec::with_capacity(positional.len() + 1);
    if !self_or_null.is_null() {
        all_args.push(self_or_null);
    }
    all_args.extend(positional);
    let kwnames = if kwnames.is_null() {
        None
    } else {
        Some(unsafe { borrowed(kwnames) })
    };
    let (pos, kw) = split_call_args(&all_args, kwnames)?;
    func(&pos, &kw)
}

/// Invoke a callable.
///
/// `args_tuple` packs the arguments in call order; when `kwnames` is a
/// non-null tuple of strings, its length N marks the trailing N arguments
/// as keyword arguments and the rest as positional. Borrows everything.
///
/// # Safety
/// `callable` and `args_tuple` must be live; `self_or_null` and `kwnames`
/// must be null or live.
#[no_mangle]
pub unsafe extern "C" fn pyr_call(
    callable: ObjRef,
    self_or_null: ObjRef,
    args_tuple: ObjRef,
    kwnames: ObjRef,
) -> ObjRef {
    take(do_call(callable, self_or_null, args_tuple, kwnames))
}

/// Invoke a callable with an unpacked argument tuple and optional keyword
/// dict. Borrows everything.
///
/// # Safety
/// `callable` and `args_tuple` must be live; `kwargs` must be null or a
/// live dict.
#[no_mangle]
pub unsafe extern "C" fn pyr_call_ex(
    callable: ObjRef,
    args_tuple: ObjRef,
    kwargs: ObjRef,
) -> ObjRef {
    if kwargs.is_null() {
        return pyr_call(callable, std::ptr::null_mut(), args_tuple, std::ptr::null_mut());
    }
    let pairs = match &borrowed(kwargs).payload {
        Payload::Dict(pairs) => pairs.borrow().clone(),
        _ => {
            set_pending(type_error("argument after ** must be a mapping"));
            return std::ptr::null_mut();
        }
    };
    // Fold the dict into the trailing-keyword convention.
    let positional = match &borrowed(args_tuple).payload {
        Payload::Tuple(v) => v.borrow().clone(),
        _ => {
            set_pending(type_error("argument after * must be a tuple"));
            return std::ptr::null_mut();
        }
    };
    let mut packed = positional;
    let mut names = Vec::with_capacity(pairs.len());
    for (k, v) in pairs {
        names.push(k);
        packed.push(v);
    }
    let args = OwnedRef::tuple(packed);
    let kwnames = OwnedRef::tuple(names);
    pyr_call(callable, std::ptr::null_mut(), args.as_ptr(), kwnames.as_ptr())
}

// =============================================================================
// Exceptions
// =============================================================================

/// Raise `value`, normalizing types to instances. Steals `value`.
///
/// # Safety
/// `value` must be a live handle whose unit transfers in.
#[no_mangle]
pub unsafe extern "C" fn pyr_raise(value: ObjRef) {
    if let Some(value) = OwnedRef::from_raw(value) {
        set_pending(normalize_raise(value));
    }
}

/// Raise `value` with an explicit `cause`. Steals both.
///
/// # Safety
/// Both must be live handles whose units transfer in.
#[no_mangle]
pub unsafe extern "C" fn pyr_raise_from(value: ObjRef, cause: ObjRef) {
    let cause = OwnedRef::from_raw(cause);
    if let Some(value) = OwnedRef::from_raw(value) {
        let exc = normalize_raise(value);
        if let Payload::Exc { cause: slot, .. } = &exc.obj().payload {
            *slot.borrow_mut() = cause.map(|c| normalize_raise(c));
        }
        set_pending(exc);
    }
}

/// Re-raise the exception currently being handled.
#[no_mangle]
pub extern "C" fn pyr_reraise() {
    match error::handled() {
        Some(exc) => set_pending(exc),
        None => set_pending(error::runtime_error("No active exception to reraise")),
    }
}

/// Is an exception pending in this thread?
#[no_mangle]
pub extern "C" fn pyr_pending() -> i64 {
    error::pending_set() as i64
}

/// Make `exc` the handled exception and return the previously handled one
/// (or None). Borrows `exc`; the result transfers out.
///
/// # Safety
/// `exc` must be live.
#[no_mangle]
pub unsafe extern "C" fn pyr_exc_save(exc: ObjRef) -> ObjRef {
    incref(exc);
    let prev = error::swap_handled(OwnedRef::from_raw(exc));
    prev.unwrap_or_else(OwnedRef::none).into_raw()
}

/// Restore the handled slot from a saved value. Steals `prev`; a None
/// object clears the slot.
///
/// # Safety
/// `prev` must be a live handle whose unit transfers in.
#[no_mangle]
pub unsafe extern "C" fn pyr_exc_restore(prev: ObjRef) {
    let prev = OwnedRef::from_raw(prev);
    let prev = prev.filter(|p| !matches!(p.obj().payload, Payload::None));
    error::swap_handled(prev);
}

/// Does `exc` match exception class (or tuple of classes) `class`?
///
/// # Safety
/// Both handles must be live.
#[no_mangle]
pub unsafe extern "C" fn pyr_exc_matches(exc: ObjRef, class: ObjRef) -> i64 {
    error::exc_matches(borrowed(exc), borrowed(class), class) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::repr;

    #[test]
    fn binary_op_reports_errors_via_pending() {
        let a = OwnedRef::int(1);
        let z = OwnedRef::int(0);
        let out = unsafe {
            pyr_binary_op(BinOp::TrueDiv.code(), a.as_ptr(), z.as_ptr())
        };
        assert!(out.is_null());
        let exc = error::take_pending().unwrap();
        assert!(repr(exc.obj()).starts_with("ZeroDivisionError"));
    }

    #[test]
    fn call_splits_trailing_keywords() {
        fn record(args: &[ObjRef], kwargs: &[(ObjRef, ObjRef)]) -> Result<OwnedRef, OwnedRef> {
            let mut parts: Vec<String> = args
                .iter()
                .map(|a| repr(unsafe { &**a }))
                .collect();
            for (k, v) in kwargs {
                let name = match unsafe { &(**k).payload } {
                    Payload::Str(s) => s.clone(),
                    _ => panic!("keyword names are strings"),
                };
                parts.push(format!("{}={}", name, repr(unsafe { &**v })));
            }
            Ok(OwnedRef::str(parts.join(",")))
        }
        let f = OwnedRef::function("record", record);
        let args = OwnedRef::tuple(vec![
            OwnedRef::int(1),
            OwnedRef::int(2),
            OwnedRef::int(3),
        ]);
        let kwnames = OwnedRef::tuple(vec![OwnedRef::str("b"), OwnedRef::str("c")]);
        let out = unsafe {
            pyr_call(
                f.as_ptr(),
                std::ptr::null_mut(),
                args.as_ptr(),
                kwnames.as_ptr(),
            )
        };
        let out = unsafe { OwnedRef::from_raw(out) }.unwrap();
        assert_eq!(out.to_string(), "1,b=2,c=3");
    }

    #[test]
    fn call_ex_folds_kwargs_dict() {
        fn record(args: &[ObjRef], kwargs: &[(ObjRef, ObjRef)]) -> Result<OwnedRef, OwnedRef> {
            Ok(OwnedRef::int(
                args.len() as i64 * 10 + kwargs.len() as i64,
            ))
        }
        let f = OwnedRef::function("record", record);
        let args = OwnedRef::tuple(vec![OwnedRef::int(1), OwnedRef::int(2)]);
        let kwargs = OwnedRef::dict();
        let k = OwnedRef::str("flag");
        unsafe {
            assert_eq!(
                pyr_dict_set(kwargs.as_ptr(), k.as_ptr(), OwnedRef::bool_obj(true).as_ptr()),
                0
            );
        }
        let out = unsafe { pyr_call_ex(f.as_ptr(), args.as_ptr(), kwargs.as_ptr()) };
        let out = unsafe { OwnedRef::from_raw(out) }.unwrap();
        assert_eq!(repr(out.obj()), "21");
    }

    #[test]
    fn exc_save_restore_round_trip() {
        let exc = error::type_error("inner");
        let prev = unsafe { OwnedRef::from_raw(pyr_exc_save(exc.as_ptr())) }.unwrap();
        assert!(matches!(prev.obj().payload, Payload::None));
        assert!(error::handled().is_some());
        pyr_reraise();
        assert_eq!(pyr_pending(), 1);
        let _ = error::take_pending();
        unsafe { pyr_exc_restore(prev.into_raw()) };
        assert!(error::handled().is_none());
    }

    #[test]
    fn set_add_deduplicates() {
        let s = unsafe { OwnedRef::from_raw(pyr_set_new()) }.unwrap();
        let one = OwnedRef::int(1);
        let one_again = OwnedRef::int(1);
        unsafe {
            pyr_set_add(s.as_ptr(), one.as_ptr());
            pyr_set_add(s.as_ptr(), one_again.as_ptr());
        }
        assert_eq!(seq::seq_len(s.obj()).unwrap(), 1);
    }
}
