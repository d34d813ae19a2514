//! Subscripting, slicing, attribute access, and iteration.

use std::cell::Cell;

use crate::error::{attribute_error, index_error, key_error, type_error};
use crate::handle::OwnedRef;
use crate::object::{obj_eq, repr, Obj, Payload};

/// Resolve a possibly-negative index against `len`.
fn resolve_index(idx: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let idx = if idx < 0 { idx + len } else { idx };
    if (0..len).contains(&idx) {
        Some(idx as usize)
    } else {
        None
    }
}

fn want_int(o: &Obj, what: &str) -> Result<i64, OwnedRef> {
    match &o.payload {
        Payload::Int(i) => Ok(*i),
        Payload::Bool(b) => Ok(*b as i64),
        _ => Err(type_error(format!(
            "{} must be an integer, not '{}'",
            what,
            o.type_name()
        ))),
    }
}

/// Normalized slice bounds: (start, stop, step) over a sequence of `len`.
pub fn slice_indices(slice: &Obj, len: usize) -> Result<(i64, i64, i64), OwnedRef> {
    let (start, stop, step) = match &slice.payload {
        Payload::Slice { start, stop, step } => (start, stop, step),
        _ => return Err(type_error("expected a slice")),
    };
    let step = match step {
        Some(s) => want_int(s.obj(), "slice step")?,
        None => 1,
    };
    if step == 0 {
        return Err(crate::error::value_error("slice step cannot be zero"));
    }
    let len = len as i64;
    let (def_start, def_stop) = if step > 0 { (0, len) } else { (len - 1, -1) };
    let clamp = |raw: i64| -> i64 {
        let v = if raw < 0 { raw + len } else { raw };
        if step > 0 {
            v.clamp(0, len)
        } else {
            v.clamp(-1, len - 1)
        }
    };
    let start = match start {
        Some(s) => clamp(want_int(s.obj(), "slice start")?),
        None => def_start,
    };
    let stop = match stop {
        Some(s) => clamp(want_int(s.obj(), "slice stop")?),
        None => def_stop,
    };
    Ok((start, stop, step))
}

fn slice_positions(slice: &Obj, len: usize) -> Result<Vec<usize>, OwnedRef> {
    let (start, stop, step) = slice_indices(slice, len)?;
    let mut out = Vec::new();
    let mut i = start;
    if step > 0 {
        while i < stop {
            out.push(i as usize);
            i += step;
        }
    } else {
        while i > stop {
            out.push(i as usize);
            i += step;
        }
    }
    Ok(out)
}

/// `obj[key]`, covering index, slice, and dict lookup.
pub fn getitem(obj: &Obj, key: &Obj) -> Result<OwnedRef, OwnedRef> {
    if matches!(key.payload, Payload::Slice { .. }) {
        return getslice(obj, key);
    }
    match &obj.payload {
        Payload::Tuple(v) | Payload::List(v) => {
            let v = v.borrow();
            let idx = want_int(key, "sequence index")?;
            match resolve_index(idx, v.len()) {
                Some(i) => Ok(v[i].clone()),
                None => Err(index_error(format!(
                    "{} index out of range",
                    obj.type_name()
                ))),
            }
        }
        Payload::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let idx = want_int(key, "string index")?;
            match resolve_index(idx, chars.len()) {
                Some(i) => Ok(OwnedRef::str(chars[i].to_string())),
                None => Err(index_error("string index out of range")),
            }
        }
        Payload::Dict(pairs) => pairs
            .borrow()
            .iter()
            .find(|(k, _)| obj_eq(k.obj(), key))
            .map(|(_, v)| v.clone())
            .ok_or_else(|| key_error(repr(key))),
        _ => Err(type_error(format!(
            "'{}' object is not subscriptable",
            obj.type_name()
        ))),
    }
}

/// `obj[slice]` for str, tuple, and list.
pub fn getslice(obj: &Obj, slice: &Obj) -> Result<OwnedRef, OwnedRef> {
    match &obj.payload {
        Payload::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let out: String = slice_positions(slice, chars.len())?
                .into_iter()
                .map(|i| chars[i])
                .collect();
            Ok(OwnedRef::str(out))
        }
        Payload::Tuple(v) => {
            let v = v.borrow();
            let out = slice_positions(slice, v.len())?
                .into_iter()
                .map(|i| v[i].clone())
                .collect();
            Ok(OwnedRef::tuple(out))
        }
        Payload::List(v) => {
            let v = v.borrow();
            let out = slice_positions(slice, v.len())?
                .into_iter()
                .map(|i| v[i].clone())
                .collect();
            Ok(OwnedRef::list(out))
        }
        _ => Err(type_error(format!(
            "'{}' object is not sliceable",
            obj.type_name()
        ))),
    }
}

/// `obj[key] = value` for lists and dicts. `value` is a transferred unit.
pub fn setitem(obj: &Obj, key: &Obj, value: OwnedRef) -> Result<(), OwnedRef> {
    match &obj.payload {
        Payload::List(v) => {
            if matches!(key.payload, Payload::Slice { .. }) {
                let positions = slice_positions(key, v.borrow().len())?;
                let items: Vec<OwnedRef> = match &value.obj().payload {
                    Payload::List(src) => src.borrow().clone(),
                    Payload::Tuple(src) => src.borrow().clone(),
                    _ => return Err(type_error("can only assign an iterable to a slice")),
                };
                if positions.len() != items.len() {
                    return Err(crate::error::value_error(format!(
                        "attempt to assign sequence of size {} to slice of size {}",
                        items.len(),
                        positions.len()
                    )));
                }
                let mut dst = v.borrow_mut();
                for (pos, item) in positions.into_iter().zip(items) {
                    dst[pos] = item;
                }
                return Ok(());
            }
            let idx = want_int(key, "list index")?;
            let mut v = v.borrow_mut();
            let len = v.len();
            match resolve_index(idx, len) {
                Some(i) => {
                    v[i] = value;
                    Ok(())
                }
                None => Err(index_error("list assignment index out of range")),
            }
        }
        Payload::Dict(pairs) => {
            let mut pairs = pairs.borrow_mut();
            if let Some(slot) = pairs.iter_mut().find(|(k, _)| obj_eq(k.obj(), key)) {
                slot.1 = value;
            } else {
                // Keys are borrowed in; retain one unit for the table.
                crate::handle::incref(key as *const Obj as crate::handle::ObjRef);
                let key = unsafe {
                    OwnedRef::from_raw(key as *const Obj as crate::handle::ObjRef)
                }
                .ok_or_else(|| type_error("null dict key"))?;
                pairs.push((key, value));
            }
            Ok(())
        }
        _ => Err(type_error(format!(
            "'{}' object does not support item assignment",
            obj.type_name()
        ))),
    }
}

/// `del obj[key]` for lists and dicts.
pub fn delitem(obj: &Obj, key: &Obj) -> Result<(), OwnedRef> {
    match &obj.payload {
        Payload::List(v) => {
            if matches!(key.payload, Payload::Slice { .. }) {
                let mut positions = slice_positions(key, v.borrow().len())?;
                positions.sort_unstable();
                let mut v = v.borrow_mut();
                for pos in positions.into_iter().rev() {
                    v.remove(pos);
                }
                return Ok(());
            }
            let idx = want_int(key, "list index")?;
            let mut v = v.borrow_mut();
            let len = v.len();
            match resolve_index(idx, len) {
                Some(i) => {
                    v.remove(i);
                    Ok(())
                }
                None => Err(index_error("list assignment index out of range")),
            }
        }
        Payload::Dict(pairs) => {
            let mut pairs = pairs.borrow_mut();
            match pairs.iter().position(|(k, _)| obj_eq(k.obj(), key)) {
                Some(i) => {
                    pairs.remove(i);
                    Ok(())
                }
                None => Err(key_error(repr(key))),
            }
        }
        _ => Err(type_error(format!(
            "'{}' object doesn't support item deletion",
            obj.type_name()
        ))),
    }
}

/// Membership test. Dicts test keys; strings test substrings.
pub fn contains(container: &Obj, item: &Obj) -> Result<bool, OwnedRef> {
    match &container.payload {
        Payload::Tuple(v) | Payload::List(v) | Payload::Set(v) => {
            Ok(v.borrow().iter().any(|e| obj_eq(e.obj(), item)))
        }
        Payload::Dict(pairs) => Ok(pairs.borrow().iter().any(|(k, _)| obj_eq(k.obj(), item))),
        Payload::Str(s) => match &item.payload {
            Payload::Str(sub) => Ok(s.contains(sub.as_str())),
            _ => Err(type_error(format!(
                "'in <string>' requires string as left operand, not '{}'",
                item.type_name()
            ))),
        },
        _ => Err(type_error(format!(
            "argument of type '{}' is not iterable",
            container.type_name()
        ))),
    }
}

// =============================================================================
// Attributes
// =============================================================================

pub fn getattr(obj: &Obj, name: &str) -> Result<OwnedRef, OwnedRef> {
    match &obj.payload {
        Payload::Record(fields) => fields
            .borrow()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| {
                attribute_error(format!("object has no attribute '{}'", name))
            }),
        Payload::Exc { ty, message, cause } => match name {
            "args" => Ok(OwnedRef::tuple(vec![OwnedRef::str(message.clone())])),
            "__cause__" => Ok(cause
                .borrow()
                .clone()
                .unwrap_or_else(OwnedRef::none)),
            "__class__" => Ok(ty.clone()),
            _ => Err(attribute_error(format!(
                "exception has no attribute '{}'",
                name
            ))),
        },
        _ => Err(attribute_error(format!(
            "'{}' object has no attribute '{}'",
            obj.type_name(),
            name
        ))),
    }
}

/// Set (value = Some) or delete (value = None) an attribute.
pub fn setattr(obj: &Obj, name: &str, value: Option<OwnedRef>) -> Result<(), OwnedRef> {
    let fields = match &obj.payload {
        Payload::Record(fields) => fields,
        _ => {
            return Err(attribute_error(format!(
                "'{}' object has no settable attributes",
                obj.type_name()
            )))
        }
    };
    let mut fields = fields.borrow_mut();
    match value {
        Some(v) => {
            if let Some(slot) = fields.iter_mut().find(|(n, _)| n == name) {
                slot.1 = v;
            } else {
                fields.push((name.to_string(), v));
            }
            Ok(())
        }
        None => match fields.iter().position(|(n, _)| n == name) {
            Some(i) => {
                fields.remove(i);
                Ok(())
            }
            None => Err(attribute_error(format!(
                "object has no attribute '{}'",
                name
            ))),
        },
    }
}

// =============================================================================
// Iteration
// =============================================================================

/// Produce an iterator over a container. Iterators pass through unchanged.
pub fn getiter(obj: &Obj, obj_ref: &OwnedRef) -> Result<OwnedRef, OwnedRef> {
    match &obj.payload {
        Payload::Iter { .. } => Ok(obj_ref.clone()),
        Payload::Tuple(_)
        | Payload::List(_)
        | Payload::Str(_)
        | Payload::Dict(_)
        | Payload::Set(_) => Ok(OwnedRef::new(Payload::Iter {
            seq: obj_ref.clone(),
            pos: Cell::new(0),
        })),
        _ => Err(type_error(format!(
            "'{}' object is not iterable",
            obj.type_name()
        ))),
    }
}

/// Fetch element `i` of an iterable without consuming it (used for unpacking
/// and iterator advancement). Dicts yield keys.
pub fn seq_get(obj: &Obj, i: usize) -> Result<Option<OwnedRef>, OwnedRef> {
    match &obj.payload {
        Payload::Tuple(v) | Payload::List(v) | Payload::Set(v) => {
            Ok(v.borrow().get(i).cloned())
        }
        Payload::Str(s) => Ok(s.chars().nth(i).map(|c| OwnedRef::str(c.to_string()))),
        Payload::Dict(pairs) => Ok(pairs.borrow().get(i).map(|(k, _)| k.clone())),
        _ => Err(type_error(format!(
            "'{}' object is not indexable",
            obj.type_name()
        ))),
    }
}

/// Advance an iterator. `Ok(None)` means exhausted.
pub fn iter_next(iter: &Obj) -> Result<Option<OwnedRef>, OwnedRef> {
    match &iter.payload {
        Payload::Iter { seq, pos } => {
            let i = pos.get();
            match seq_get(seq.obj(), i)? {
                Some(v) => {
                    pos.set(i + 1);
                    Ok(Some(v))
                }
                None => Ok(None),
            }
        }
        _ => Err(type_error(format!(
            "'{}' object is not an iterator",
            iter.type_name()
        ))),
    }
}

/// Number of elements, for unpack checks.
pub fn seq_len(obj: &Obj) -> Result<usize, OwnedRef> {
    match &obj.payload {
        Payload::Tuple(v) | Payload::List(v) | Payload::Set(v) => Ok(v.borrow().len()),
        Payload::Str(s) => Ok(s.chars().count()),
        Payload::Dict(pairs) => Ok(pairs.borrow().len()),
        _ => Err(type_error(format!(
            "object of type '{}' has no len()",
            obj.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_indices_wrap() {
        let v = OwnedRef::list(vec![OwnedRef::int(10), OwnedRef::int(20), OwnedRef::int(30)]);
        let key = OwnedRef::int(-1);
        let got = getitem(v.obj(), key.obj()).unwrap();
        assert_eq!(repr(got.obj()), "30");
        let bad = OwnedRef::int(3);
        assert!(getitem(v.obj(), bad.obj()).is_err());
    }

    #[test]
    fn dict_lookup_by_structural_equality() {
        let d = OwnedRef::dict();
        let k = OwnedRef::str("answer");
        setitem(d.obj(), k.obj(), OwnedRef::int(42)).unwrap();
        let k2 = OwnedRef::str("answer");
        let got = getitem(d.obj(), k2.obj()).unwrap();
        assert_eq!(repr(got.obj()), "42");
        delitem(d.obj(), k2.obj()).unwrap();
        assert!(getitem(d.obj(), k2.obj()).is_err());
    }

    #[test]
    fn slicing_with_negative_step() {
        let s = OwnedRef::str("abcdef");
        let slice = OwnedRef::new(Payload::Slice {
            start: None,
            stop: None,
            step: Some(OwnedRef::int(-1)),
        });
        let got = getitem(s.obj(), slice.obj()).unwrap();
        assert_eq!(got.to_string(), "fedcba");
    }

    #[test]
    fn slice_bounds_clamp() {
        let v = OwnedRef::list(vec![OwnedRef::int(1), OwnedRef::int(2), OwnedRef::int(3)]);
        let slice = OwnedRef::new(Payload::Slice {
            start: Some(OwnedRef::int(1)),
            stop: Some(OwnedRef::int(100)),
            step: None,
        });
        let got = getitem(v.obj(), slice.obj()).unwrap();
        assert_eq!(repr(got.obj()), "[2, 3]");
    }

    #[test]
    fn membership() {
        let v = OwnedRef::tuple(vec![OwnedRef::int(1), OwnedRef::str("x")]);
        let hit = OwnedRef::str("x");
        let miss = OwnedRef::int(9);
        assert!(contains(v.obj(), hit.obj()).unwrap());
        assert!(!contains(v.obj(), miss.obj()).unwrap());
        let s = OwnedRef::str("hello");
        let sub = OwnedRef::str("ell");
        assert!(contains(s.obj(), sub.obj()).unwrap());
    }

    #[test]
    fn record_attributes() {
        let r = OwnedRef::record();
        setattr(r.obj(), "x", Some(OwnedRef::int(1))).unwrap();
        let got = getattr(r.obj(), "x").unwrap();
        assert_eq!(repr(got.obj()), "1");
        setattr(r.obj(), "x", None).unwrap();
        assert!(getattr(r.obj(), "x").is_err());
    }

    #[test]
    fn iteration_over_list() {
        let v = OwnedRef::list(vec![OwnedRef::int(1), OwnedRef::int(2)]);
        let it = getiter(v.obj(), &v).unwrap();
        assert_eq!(repr(iter_next(it.obj()).unwrap().unwrap().obj()), "1");
        assert_eq!(repr(iter_next(it.obj()).unwrap().unwrap().obj()), "2");
        assert!(iter_next(it.obj()).unwrap().is_none());
        // Exhausted iterators stay exhausted.
        assert!(iter_next(it.obj()).unwrap().is_none());
    }

    #[test]
    fn dict_iteration_yields_keys() {
        let d = OwnedRef::dict();
        let k = OwnedRef::str("k");
        setitem(d.obj(), k.obj(), OwnedRef::int(1)).unwrap();
        let it = getiter(d.obj(), &d).unwrap();
        assert_eq!(repr(iter_next(it.obj()).unwrap().unwrap().obj()), "'k'");
    }
}
