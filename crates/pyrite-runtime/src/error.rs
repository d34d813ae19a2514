//! Exception machinery.
//!
//! The runtime carries two thread-local slots: the *pending* exception
//! (installed by a raise, observed by the caller when a compiled function
//! returns the null sentinel) and the *handled* exception (the one an
//! except-block is currently processing, saved/restored around handler
//! regions).

use std::cell::RefCell;
use std::sync::OnceLock;

use thiserror::Error;

use crate::handle::{ObjRef, OwnedRef, Pinned};
use crate::object::{repr, Obj, Payload};

thread_local! {
    static PENDING: RefCell<Option<OwnedRef>> = const { RefCell::new(None) };
    static HANDLED: RefCell<Option<OwnedRef>> = const { RefCell::new(None) };
}

/// Install the pending exception, replacing any previous one.
pub fn set_pending(exc: OwnedRef) {
    log::trace!("pending exception set: {}", repr(exc.obj()));
    PENDING.with(|slot| *slot.borrow_mut() = Some(exc));
}

/// Take the pending exception, clearing the slot.
pub fn take_pending() -> Option<OwnedRef> {
    PENDING.with(|slot| slot.borrow_mut().take())
}

pub fn pending_set() -> bool {
    PENDING.with(|slot| slot.borrow().is_some())
}

/// Swap the handled-exception slot, returning the previous occupant.
pub fn swap_handled(new: Option<OwnedRef>) -> Option<OwnedRef> {
    HANDLED.with(|slot| std::mem::replace(&mut *slot.borrow_mut(), new))
}

pub fn handled() -> Option<OwnedRef> {
    HANDLED.with(|slot| slot.borrow().clone())
}

// =============================================================================
// Builtin exception types
// =============================================================================

macro_rules! builtin_types {
    ($($cell:ident => $getter:ident, $name:literal;)*) => {
        $(
            static $cell: OnceLock<Pinned> = OnceLock::new();

            pub fn $getter() -> OwnedRef {
                let ptr = $cell
                    .get_or_init(|| {
                        Pinned(
                            OwnedRef::new(Payload::ExcType {
                                name: $name.to_string(),
                            })
                            .into_raw(),
                        )
                    })
                    .0;
                crate::handle::incref(ptr);
                // The pinned pointer is never null.
                unsafe { OwnedRef::from_raw(ptr) }.unwrap_or_else(|| unreachable!())
            }
        )*
    };
}

builtin_types! {
    TYPE_ERROR => type_error_type, "TypeError";
    VALUE_ERROR => value_error_type, "ValueError";
    NAME_ERROR => name_error_type, "NameError";
    ATTRIBUTE_ERROR => attribute_error_type, "AttributeError";
    INDEX_ERROR => index_error_type, "IndexError";
    KEY_ERROR => key_error_type, "KeyError";
    ZERO_DIVISION_ERROR => zero_division_error_type, "ZeroDivisionError";
    RUNTIME_ERROR => runtime_error_type, "RuntimeError";
}

/// Instantiate an exception of the given type.
pub fn new_exc(ty: OwnedRef, message: impl Into<String>) -> OwnedRef {
    OwnedRef::new(Payload::Exc {
        ty,
        message: message.into(),
        cause: RefCell::new(None),
    })
}

pub fn type_error(message: impl Into<String>) -> OwnedRef {
    new_exc(type_error_type(), message)
}

pub fn value_error(message: impl Into<String>) -> OwnedRef {
    new_exc(value_error_type(), message)
}

pub fn name_error(message: impl Into<String>) -> OwnedRef {
    new_exc(name_error_type(), message)
}

pub fn attribute_error(message: impl Into<String>) -> OwnedRef {
    new_exc(attribute_error_type(), message)
}

pub fn index_error(message: impl Into<String>) -> OwnedRef {
    new_exc(index_error_type(), message)
}

pub fn key_error(message: impl Into<String>) -> OwnedRef {
    new_exc(key_error_type(), message)
}

pub fn zero_division_error(message: impl Into<String>) -> OwnedRef {
    new_exc(zero_division_error_type(), message)
}

pub fn runtime_error(message: impl Into<String>) -> OwnedRef {
    new_exc(runtime_error_type(), message)
}

/// Does `exc` match `class`? Classes match themselves and their instances;
/// a tuple of classes matches if any element does.
pub fn exc_matches(exc: &Obj, class: &Obj, class_ptr: ObjRef) -> bool {
    if let Payload::Tuple(elems) = &class.payload {
        return elems
            .borrow()
            .iter()
            .any(|c| exc_matches(exc, c.obj(), c.as_ptr()));
    }
    let exc_ty: ObjRef = match &exc.payload {
        Payload::Exc { ty, .. } => ty.as_ptr(),
        Payload::ExcType { .. } => exc as *const Obj as ObjRef,
        _ => return false,
    };
    std::ptr::eq(exc_ty, class_ptr)
}

/// Normalize a raised value into an exception instance.
///
/// Raising a type instantiates it; raising an instance uses it as-is;
/// anything else is a TypeError.
pub fn normalize_raise(value: OwnedRef) -> OwnedRef {
    match &value.obj().payload {
        Payload::Exc { .. } => value,
        Payload::ExcType { .. } => new_exc(value, ""),
        _ => type_error("exceptions must derive from BaseException"),
    }
}

// =============================================================================
// Host-facing error type
// =============================================================================

/// An exception that escaped a compiled function, as seen by the host.
#[derive(Debug, Error)]
#[error("uncaught exception: {message}")]
pub struct RaisedError {
    pub exception: OwnedRef,
    message: String,
}

impl RaisedError {
    pub fn new(exception: OwnedRef) -> Self {
        let message = repr(exception.obj());
        RaisedError { exception, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_slot_round_trip() {
        assert!(take_pending().is_none());
        set_pending(type_error("boom"));
        assert!(pending_set());
        let exc = take_pending().unwrap();
        assert!(matches!(exc.obj().payload, Payload::Exc { .. }));
        assert!(take_pending().is_none());
    }

    #[test]
    fn matching_by_type_identity() {
        let exc = new_exc(key_error_type(), "missing");
        let cls = key_error_type();
        let other = type_error_type();
        assert!(exc_matches(exc.obj(), cls.obj(), cls.as_ptr()));
        assert!(!exc_matches(exc.obj(), other.obj(), other.as_ptr()));
    }

    #[test]
    fn matching_against_type_tuple() {
        let exc = new_exc(index_error_type(), "");
        let classes = OwnedRef::tuple(vec![type_error_type(), index_error_type()]);
        assert!(exc_matches(exc.obj(), classes.obj(), classes.as_ptr()));
    }

    #[test]
    fn raise_normalization() {
        let inst = normalize_raise(zero_division_error_type());
        assert!(matches!(inst.obj().payload, Payload::Exc { .. }));
        let not_exc = normalize_raise(OwnedRef::int(3));
        let cls = type_error_type();
        assert!(exc_matches(not_exc.obj(), cls.obj(), cls.as_ptr()));
    }
}
