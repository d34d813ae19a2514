//! Object handles and ownership.
//!
//! Generated code and the C ABI traffic in raw `ObjRef` pointers with manual
//! ownership accounting. Host-side Rust code uses `OwnedRef`, which holds
//! exactly one ownership unit and releases it on drop, so a missing or
//! doubled adjustment is a type error rather than a latent leak.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::object::{repr, Obj, Payload};

/// Raw object handle. Null means "absent" (the error sentinel).
pub type ObjRef = *mut Obj;

/// Pinned pointer wrapper for process-lifetime singletons.
pub(crate) struct Pinned(pub ObjRef);

// SAFETY: a Pinned always wraps an immortal object whose payload is never
// mutated after construction.
unsafe impl Send for Pinned {}
unsafe impl Sync for Pinned {}

/// Increment the ownership count. Null-safe.
#[inline]
pub fn incref(ptr: ObjRef) {
    if ptr.is_null() {
        return;
    }
    let obj = unsafe { &*ptr };
    if obj.immortal {
        return;
    }
    obj.rc.fetch_add(1, Ordering::Relaxed);
}

/// Release one ownership unit, deallocating at zero. Null-safe.
#[inline]
pub fn decref(ptr: ObjRef) {
    if ptr.is_null() {
        return;
    }
    let obj = unsafe { &*ptr };
    if obj.immortal {
        return;
    }
    if obj.rc.fetch_sub(1, Ordering::Release) == 1 {
        std::sync::atomic::fence(Ordering::Acquire);
        // Drops the payload, which releases child OwnedRefs recursively.
        drop(unsafe { Box::from_raw(ptr) });
    }
}

/// An owning handle: holds exactly one ownership unit.
pub struct OwnedRef(NonNull<Obj>);

impl OwnedRef {
    /// Allocate a new object with an initial count of one.
    pub fn new(payload: Payload) -> Self {
        let boxed = Box::new(Obj {
            rc: AtomicUsize::new(1),
            immortal: false,
            payload,
        });
        // Box never yields null.
        let ptr = NonNull::new(Box::into_raw(boxed)).unwrap_or_else(|| unreachable!());
        OwnedRef(ptr)
    }

    /// Adopt a raw handle, taking over one ownership unit.
    ///
    /// # Safety
    /// `ptr` must either be null or point to a live object on which the
    /// caller holds an ownership unit that is being transferred in.
    pub unsafe fn from_raw(ptr: ObjRef) -> Option<Self> {
        NonNull::new(ptr).map(OwnedRef)
    }

    /// Give up the ownership unit and return the raw handle.
    pub fn into_raw(self) -> ObjRef {
        let ptr = self.0.as_ptr();
        std::mem::forget(self);
        ptr
    }

    /// Borrow the raw handle without transferring ownership.
    #[inline]
    pub fn as_ptr(&self) -> ObjRef {
        self.0.as_ptr()
    }

    /// Borrow the underlying object.
    #[inline]
    pub fn obj(&self) -> &Obj {
        unsafe { self.0.as_ref() }
    }

    /// Current ownership count (for leak assertions in tests).
    pub fn refcount(&self) -> usize {
        self.obj().rc.load(Ordering::Relaxed)
    }

    // Convenience constructors for the common payloads.

    pub fn none() -> Self {
        let ptr = crate::object::none_singleton();
        incref(ptr);
        unsafe { OwnedRef::from_raw(ptr) }.unwrap_or_else(|| unreachable!())
    }

    pub fn bool_obj(v: bool) -> Self {
        let ptr = crate::object::bool_singleton(v);
        incref(ptr);
        unsafe { OwnedRef::from_raw(ptr) }.unwrap_or_else(|| unreachable!())
    }

    pub fn int(v: i64) -> Self {
        OwnedRef::new(Payload::Int(v))
    }

    pub fn float(v: f64) -> Self {
        OwnedRef::new(Payload::Float(v))
    }

    pub fn str(v: impl Into<String>) -> Self {
        OwnedRef::new(Payload::Str(v.into()))
    }

    pub fn tuple(elems: Vec<OwnedRef>) -> Self {
        OwnedRef::new(Payload::Tuple(std::cell::RefCell::new(elems)))
    }

    pub fn list(elems: Vec<OwnedRef>) -> Self {
        OwnedRef::new(Payload::List(std::cell::RefCell::new(elems)))
    }

    pub fn dict() -> Self {
        OwnedRef::new(Payload::Dict(std::cell::RefCell::new(Vec::new())))
    }

    pub fn set() -> Self {
        OwnedRef::new(Payload::Set(std::cell::RefCell::new(Vec::new())))
    }

    pub fn record() -> Self {
        OwnedRef::new(Payload::Record(std::cell::RefCell::new(Vec::new())))
    }

    pub fn function(name: impl Into<String>, func: crate::object::NativeFn) -> Self {
        OwnedRef::new(Payload::Function {
            name: name.into(),
            func,
        })
    }
}

impl Clone for OwnedRef {
    fn clone(&self) -> Self {
        incref(self.as_ptr());
        OwnedRef(self.0)
    }
}

impl Drop for OwnedRef {
    fn drop(&mut self) {
        decref(self.0.as_ptr());
    }
}

impl fmt::Display for OwnedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.obj().payload {
            Payload::Str(s) => f.write_str(s),
            _ => f.write_str(&repr(self.obj())),
        }
    }
}

impl fmt::Debug for OwnedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&repr(self.obj()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_and_drop_balance() {
        let a = OwnedRef::int(7);
        assert_eq!(a.refcount(), 1);
        let b = a.clone();
        assert_eq!(a.refcount(), 2);
        drop(b);
        assert_eq!(a.refcount(), 1);
    }

    #[test]
    fn raw_round_trip_keeps_one_unit() {
        let a = OwnedRef::str("x");
        let raw = a.into_raw();
        let back = unsafe { OwnedRef::from_raw(raw) }.unwrap();
        assert_eq!(back.refcount(), 1);
    }

    #[test]
    fn container_drop_releases_children() {
        let elem = OwnedRef::int(1);
        let watch = elem.clone();
        let t = OwnedRef::tuple(vec![elem]);
        assert_eq!(watch.refcount(), 2);
        drop(t);
        assert_eq!(watch.refcount(), 1);
    }
}
