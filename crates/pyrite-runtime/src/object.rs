//! The boxed object model.
//!
//! Every boxed value is a heap `Obj` with a shared ownership count and a
//! `Payload`. Container payloads own their elements through `OwnedRef`, so
//! deallocation releases children without any manual walking.

use std::cell::{Cell, RefCell};
use std::sync::atomic::AtomicUsize;
use std::sync::OnceLock;

use crate::handle::{ObjRef, OwnedRef, Pinned};

/// Signature of host-registered callables.
///
/// Positional arguments are borrowed; keyword arguments arrive as
/// (name, value) pairs with string-payload names. The callee returns a new
/// ownership unit, or an exception object on failure.
pub type NativeFn = fn(args: &[ObjRef], kwargs: &[(ObjRef, ObjRef)]) -> Result<OwnedRef, OwnedRef>;

pub struct Obj {
    pub(crate) rc: AtomicUsize,
    pub(crate) immortal: bool,
    pub payload: Payload,
}

pub enum Payload {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(RefCell<Vec<OwnedRef>>),
    List(RefCell<Vec<OwnedRef>>),
    /// Insertion-ordered key/value pairs; keys compared with `obj_eq`.
    Dict(RefCell<Vec<(OwnedRef, OwnedRef)>>),
    Set(RefCell<Vec<OwnedRef>>),
    Slice {
        start: Option<OwnedRef>,
        stop: Option<OwnedRef>,
        step: Option<OwnedRef>,
    },
    Iter {
        seq: OwnedRef,
        pos: Cell<usize>,
    },
    /// Generic attribute carrier (name -> value).
    Record(RefCell<Vec<(String, OwnedRef)>>),
    Function {
        name: String,
        func: NativeFn,
    },
    ExcType {
        name: String,
    },
    Exc {
        ty: OwnedRef,
        message: String,
        cause: RefCell<Option<OwnedRef>>,
    },
}

impl Obj {
    pub fn type_name(&self) -> &str {
        match &self.payload {
            Payload::None => "NoneType",
            Payload::Bool(_) => "bool",
            Payload::Int(_) => "int",
            Payload::Float(_) => "float",
            Payload::Str(_) => "str",
            Payload::Tuple(_) => "tuple",
            Payload::List(_) => "list",
            Payload::Dict(_) => "dict",
            Payload::Set(_) => "set",
            Payload::Slice { .. } => "slice",
            Payload::Iter { .. } => "iterator",
            Payload::Record(_) => "object",
            Payload::Function { .. } => "function",
            Payload::ExcType { name } => name,
            Payload::Exc { .. } => "exception",
        }
    }
}

// =============================================================================
// Singletons
// =============================================================================

fn pinned(cell: &OnceLock<Pinned>, make: impl FnOnce() -> Payload) -> ObjRef {
    cell.get_or_init(|| {
        let boxed = Box::new(Obj {
            rc: AtomicUsize::new(1),
            immortal: true,
            payload: make(),
        });
        Pinned(Box::into_raw(boxed))
    })
    .0
}

static NONE: OnceLock<Pinned> = OnceLock::new();
static TRUE: OnceLock<Pinned> = OnceLock::new();
static FALSE: OnceLock<Pinned> = OnceLock::new();

pub(crate) fn none_singleton() -> ObjRef {
    pinned(&NONE, || Payload::None)
}

pub(crate) fn bool_singleton(v: bool) -> ObjRef {
    if v {
        pinned(&TRUE, || Payload::Bool(true))
    } else {
        pinned(&FALSE, || Payload::Bool(false))
    }
}

// =============================================================================
// Truth, equality, ordering
// =============================================================================

/// The full truth protocol: None/false/zero/empty are false.
pub fn truthy(o: &Obj) -> bool {
    match &o.payload {
        Payload::None => false,
        Payload::Bool(b) => *b,
        Payload::Int(i) => *i != 0,
        Payload::Float(f) => *f != 0.0,
        Payload::Str(s) => !s.is_empty(),
        Payload::Tuple(v) => !v.borrow().is_empty(),
        Payload::List(v) => !v.borrow().is_empty(),
        Payload::Dict(v) => !v.borrow().is_empty(),
        Payload::Set(v) => !v.borrow().is_empty(),
        _ => true,
    }
}

/// Numeric view used by arithmetic and comparisons; bools count as ints.
pub(crate) enum Num {
    Int(i64),
    Float(f64),
}

pub(crate) fn as_num(o: &Obj) -> Option<Num> {
    match &o.payload {
        Payload::Bool(b) => Some(Num::Int(*b as i64)),
        Payload::Int(i) => Some(Num::Int(*i)),
        Payload::Float(f) => Some(Num::Float(*f)),
        _ => None,
    }
}

/// Structural equality. Falls back to identity for unordered kinds.
pub fn obj_eq(a: &Obj, b: &Obj) -> bool {
    if std::ptr::eq(a, b) {
        return true;
    }
    match (&a.payload, &b.payload) {
        (Payload::None, Payload::None) => true,
        (Payload::Str(x), Payload::Str(y)) => x == y,
        (Payload::Tuple(x), Payload::Tuple(y)) | (Payload::List(x), Payload::List(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(p, q)| obj_eq(p.obj(), q.obj()))
        }
        _ => match (as_num(a), as_num(b)) {
            (Some(Num::Int(x)), Some(Num::Int(y))) => x == y,
            (Some(Num::Int(x)), Some(Num::Float(y))) => x as f64 == y,
            (Some(Num::Float(x)), Some(Num::Int(y))) => x == y as f64,
            (Some(Num::Float(x)), Some(Num::Float(y))) => x == y,
            _ => false,
        },
    }
}

/// Total-order comparison for the orderable kinds.
pub fn obj_cmp(a: &Obj, b: &Obj) -> Result<std::cmp::Ordering, OwnedRef> {
    use std::cmp::Ordering;
    match (&a.payload, &b.payload) {
        (Payload::Str(x), Payload::Str(y)) => Ok(x.cmp(y)),
        (Payload::Tuple(x), Payload::Tuple(y)) | (Payload::List(x), Payload::List(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            for (p, q) in x.iter().zip(y.iter()) {
                match obj_cmp(p.obj(), q.obj())? {
                    Ordering::Equal => continue,
                    other => return Ok(other),
                }
            }
            Ok(x.len().cmp(&y.len()))
        }
        _ => match (as_num(a), as_num(b)) {
            (Some(Num::Int(x)), Some(Num::Int(y))) => Ok(x.cmp(&y)),
            (Some(x), Some(y)) => {
                let (x, y) = (num_f64(x), num_f64(y));
                Ok(x.partial_cmp(&y).unwrap_or(Ordering::Equal))
            }
            _ => Err(crate::error::type_error(format!(
                "'{}' and '{}' are not orderable",
                a.type_name(),
                b.type_name()
            ))),
        },
    }
}

pub(crate) fn num_f64(n: Num) -> f64 {
    match n {
        Num::Int(i) => i as f64,
        Num::Float(f) => f,
    }
}

// =============================================================================
// Repr
// =============================================================================

pub fn repr(o: &Obj) -> String {
    match &o.payload {
        Payload::None => "None".to_string(),
        Payload::Bool(true) => "True".to_string(),
        Payload::Bool(false) => "False".to_string(),
        Payload::Int(i) => i.to_string(),
        Payload::Float(f) => format!("{:?}", f),
        Payload::Str(s) => format!("'{}'", s),
        Payload::Tuple(v) => {
            let parts: Vec<String> = v.borrow().iter().map(|e| repr(e.obj())).collect();
            if parts.len() == 1 {
                format!("({},)", parts[0])
            } else {
                format!("({})", parts.join(", "))
            }
        }
        Payload::List(v) => {
            let parts: Vec<String> = v.borrow().iter().map(|e| repr(e.obj())).collect();
            format!("[{}]", parts.join(", "))
        }
        Payload::Dict(v) => {
            let parts: Vec<String> = v
                .borrow()
                .iter()
                .map(|(k, val)| format!("{}: {}", repr(k.obj()), repr(val.obj())))
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
        Payload::Set(v) => {
            let items = v.borrow();
            if items.is_empty() {
                "set()".to_string()
            } else {
                let parts: Vec<String> = items.iter().map(|e| repr(e.obj())).collect();
                format!("{{{}}}", parts.join(", "))
            }
        }
        Payload::Slice { start, stop, step } => {
            let part = |x: &Option<OwnedRef>| {
                x.as_ref()
                    .map(|v| repr(v.obj()))
                    .unwrap_or_else(|| "None".to_string())
            };
            format!("slice({}, {}, {})", part(start), part(stop), part(step))
        }
        Payload::Iter { .. } => "<iterator>".to_string(),
        Payload::Record(_) => "<object>".to_string(),
        Payload::Function { name, .. } => format!("<function {}>", name),
        Payload::ExcType { name } => format!("<class '{}'>", name),
        Payload::Exc { ty, message, .. } => {
            let tyname = match &ty.obj().payload {
                Payload::ExcType { name } => name.clone(),
                _ => "exception".to_string(),
            };
            if message.is_empty() {
                tyname
            } else {
                format!("{}: {}", tyname, message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truth_protocol() {
        assert!(!truthy(OwnedRef::none().obj()));
        assert!(!truthy(OwnedRef::int(0).obj()));
        assert!(!truthy(OwnedRef::str("").obj()));
        assert!(!truthy(OwnedRef::tuple(vec![]).obj()));
        assert!(truthy(OwnedRef::int(-3).obj()));
        assert!(truthy(OwnedRef::str("x").obj()));
    }

    #[test]
    fn numeric_equality_crosses_kinds() {
        let a = OwnedRef::int(2);
        let b = OwnedRef::float(2.0);
        let t = OwnedRef::bool_obj(true);
        let one = OwnedRef::int(1);
        assert!(obj_eq(a.obj(), b.obj()));
        assert!(obj_eq(t.obj(), one.obj()));
    }

    #[test]
    fn tuple_equality_is_elementwise() {
        let a = OwnedRef::tuple(vec![OwnedRef::int(1), OwnedRef::str("a")]);
        let b = OwnedRef::tuple(vec![OwnedRef::int(1), OwnedRef::str("a")]);
        let c = OwnedRef::tuple(vec![OwnedRef::int(1)]);
        assert!(obj_eq(a.obj(), b.obj()));
        assert!(!obj_eq(a.obj(), c.obj()));
    }

    #[test]
    fn singletons_are_shared() {
        let a = OwnedRef::none();
        let b = OwnedRef::none();
        assert!(std::ptr::eq(a.as_ptr(), b.as_ptr()));
    }
}
