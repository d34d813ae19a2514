//! Arithmetic, comparison, and unary operators over boxed values.
//!
//! Integer arithmetic wraps on overflow. Division and modulo floor toward
//! negative infinity, matching the quotient/remainder identity
//! `a == (a // b) * b + a % b` with the remainder taking the divisor's sign.

use crate::error::{type_error, zero_division_error};
use crate::handle::OwnedRef;
use crate::object::{as_num, num_f64, obj_cmp, obj_eq, Num, Obj, Payload};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    TrueDiv,
    FloorDiv,
    Rem,
    Pow,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

impl BinOp {
    /// Stable ABI code used by generated calls into the runtime.
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<BinOp> {
        const ALL: [BinOp; 12] = [
            BinOp::Add,
            BinOp::Sub,
            BinOp::Mul,
            BinOp::TrueDiv,
            BinOp::FloorDiv,
            BinOp::Rem,
            BinOp::Pow,
            BinOp::And,
            BinOp::Or,
            BinOp::Xor,
            BinOp::Shl,
            BinOp::Shr,
        ];
        usize::try_from(code).ok().and_then(|i| ALL.get(i).copied())
    }

    fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::TrueDiv => "/",
            BinOp::FloorDiv => "//",
            BinOp::Rem => "%",
            BinOp::Pow => "**",
            BinOp::And => "&",
            BinOp::Or => "|",
            BinOp::Xor => "^",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
}

impl CmpOp {
    /// Stable ABI code used by generated calls into the runtime.
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<CmpOp> {
        const ALL: [CmpOp; 6] = [
            CmpOp::Lt,
            CmpOp::Le,
            CmpOp::Eq,
            CmpOp::Ne,
            CmpOp::Gt,
            CmpOp::Ge,
        ];
        usize::try_from(code).ok().and_then(|i| ALL.get(i).copied())
    }
}

fn unsupported(op: BinOp, a: &Obj, b: &Obj) -> OwnedRef {
    type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op.symbol(),
        a.type_name(),
        b.type_name()
    ))
}

fn floor_div_i64(a: i64, b: i64) -> Result<i64, OwnedRef> {
    if b == 0 {
        return Err(zero_division_error("integer division or modulo by zero"));
    }
    let q = a.wrapping_div(b);
    let r = a.wrapping_rem(b);
    if r != 0 && (r < 0) != (b < 0) {
        Ok(q.wrapping_sub(1))
    } else {
        Ok(q)
    }
}

fn floor_mod_i64(a: i64, b: i64) -> Result<i64, OwnedRef> {
    if b == 0 {
        return Err(zero_division_error("integer division or modulo by zero"));
    }
    let r = a.wrapping_rem(b);
    if r != 0 && (r < 0) != (b < 0) {
        Ok(r.wrapping_add(b))
    } else {
        Ok(r)
    }
}

fn floor_mod_f64(a: f64, b: f64) -> Result<f64, OwnedRef> {
    if b == 0.0 {
        return Err(zero_division_error("float modulo"));
    }
    let r = a % b;
    if r != 0.0 && (r < 0.0) != (b < 0.0) {
        Ok(r + b)
    } else {
        Ok(r)
    }
}

fn int_pow(base: i64, exp: i64) -> OwnedRef {
    if exp < 0 {
        return OwnedRef::float((base as f64).powi(exp.clamp(i32::MIN as i64, i32::MAX as i64) as i32));
    }
    let mut acc: i64 = 1;
    let mut base = base;
    let mut exp = exp as u64;
    while exp > 0 {
        if exp & 1 == 1 {
            acc = acc.wrapping_mul(base);
        }
        base = base.wrapping_mul(base);
        exp >>= 1;
    }
    OwnedRef::int(acc)
}

fn numeric_binary(op: BinOp, x: Num, y: Num) -> Result<OwnedRef, OwnedRef> {
    // Integer-only operators first.
    if let (Num::Int(a), Num::Int(b)) = (&x, &y) {
        let (a, b) = (*a, *b);
        return match op {
            BinOp::Add => Ok(OwnedRef::int(a.wrapping_add(b))),
            BinOp::Sub => Ok(OwnedRef::int(a.wrapping_sub(b))),
            BinOp::Mul => Ok(OwnedRef::int(a.wrapping_mul(b))),
            BinOp::TrueDiv => {
                if b == 0 {
                    Err(zero_division_error("division by zero"))
                } else {
                    Ok(OwnedRef::float(a as f64 / b as f64))
                }
            }
            BinOp::FloorDiv => floor_div_i64(a, b).map(OwnedRef::int),
            BinOp::Rem => floor_mod_i64(a, b).map(OwnedRef::int),
            BinOp::Pow => Ok(int_pow(a, b)),
            BinOp::And => Ok(OwnedRef::int(a & b)),
            BinOp::Or => Ok(OwnedRef::int(a | b)),
            BinOp::Xor => Ok(OwnedRef::int(a ^ b)),
            BinOp::Shl => Ok(OwnedRef::int(a.wrapping_shl(b as u32))),
            BinOp::Shr => Ok(OwnedRef::int(a.wrapping_shr(b as u32))),
        };
    }
    let (a, b) = (num_f64(x), num_f64(y));
    match op {
        BinOp::Add => Ok(OwnedRef::float(a + b)),
        BinOp::Sub => Ok(OwnedRef::float(a - b)),
        BinOp::Mul => Ok(OwnedRef::float(a * b)),
        BinOp::TrueDiv => {
            if b == 0.0 {
                Err(zero_division_error("float division by zero"))
            } else {
                Ok(OwnedRef::float(a / b))
            }
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                Err(zero_division_error("float floor division by zero"))
            } else {
                Ok(OwnedRef::float((a / b).floor()))
            }
        }
        BinOp::Rem => floor_mod_f64(a, b).map(OwnedRef::float),
        BinOp::Pow => Ok(OwnedRef::float(a.powf(b))),
        BinOp::And | BinOp::Or | BinOp::Xor | BinOp::Shl | BinOp::Shr => Err(type_error(format!(
            "unsupported operand type(s) for {}: 'float'",
            op.symbol()
        ))),
    }
}

fn repeat_count(n: i64) -> usize {
    if n < 0 {
        0
    } else {
        n as usize
    }
}

/// Apply a binary operator; the inplace variants share these semantics.
pub fn binary_op(op: BinOp, a: &Obj, b: &Obj) -> Result<OwnedRef, OwnedRef> {
    match (op, &a.payload, &b.payload) {
        (BinOp::Add, Payload::Str(x), Payload::Str(y)) => {
            let mut s = String::with_capacity(x.len() + y.len());
            s.push_str(x);
            s.push_str(y);
            Ok(OwnedRef::str(s))
        }
        (BinOp::Add, Payload::List(x), Payload::List(y)) => {
            let mut out: Vec<OwnedRef> = x.borrow().clone();
            out.extend(y.borrow().iter().cloned());
            Ok(OwnedRef::list(out))
        }
        (BinOp::Add, Payload::Tuple(x), Payload::Tuple(y)) => {
            let mut out: Vec<OwnedRef> = x.borrow().clone();
            out.extend(y.borrow().iter().cloned());
            Ok(OwnedRef::tuple(out))
        }
        (BinOp::Mul, Payload::Str(s), Payload::Int(n)) | (BinOp::Mul, Payload::Int(n), Payload::Str(s)) => {
            Ok(OwnedRef::str(s.repeat(repeat_count(*n))))
        }
        (BinOp::Mul, Payload::List(v), Payload::Int(n)) | (BinOp::Mul, Payload::Int(n), Payload::List(v)) => {
            let src = v.borrow();
            let mut out = Vec::with_capacity(src.len() * repeat_count(*n));
            for _ in 0..repeat_count(*n) {
                out.extend(src.iter().cloned());
            }
            Ok(OwnedRef::list(out))
        }
        (BinOp::Mul, Payload::Tuple(v), Payload::Int(n)) | (BinOp::Mul, Payload::Int(n), Payload::Tuple(v)) => {
            let src = v.borrow();
            let mut out = Vec::with_capacity(src.len() * repeat_count(*n));
            for _ in 0..repeat_count(*n) {
                out.extend(src.iter().cloned());
            }
            Ok(OwnedRef::tuple(out))
        }
        _ => match (as_num(a), as_num(b)) {
            (Some(x), Some(y)) => numeric_binary(op, x, y),
            _ => Err(unsupported(op, a, b)),
        },
    }
}

/// Rich comparison producing a bool.
pub fn compare(op: CmpOp, a: &Obj, b: &Obj) -> Result<OwnedRef, OwnedRef> {
    use std::cmp::Ordering;
    let result = match op {
        CmpOp::Eq => obj_eq(a, b),
        CmpOp::Ne => !obj_eq(a, b),
        CmpOp::Lt => obj_cmp(a, b)? == Ordering::Less,
        CmpOp::Le => obj_cmp(a, b)? != Ordering::Greater,
        CmpOp::Gt => obj_cmp(a, b)? == Ordering::Greater,
        CmpOp::Ge => obj_cmp(a, b)? != Ordering::Less,
    };
    Ok(OwnedRef::bool_obj(result))
}

/// Unary negation.
pub fn negate(a: &Obj) -> Result<OwnedRef, OwnedRef> {
    match as_num(a) {
        Some(Num::Int(i)) => Ok(OwnedRef::int(i.wrapping_neg())),
        Some(Num::Float(f)) => Ok(OwnedRef::float(-f)),
        None => Err(type_error(format!(
            "bad operand type for unary -: '{}'",
            a.type_name()
        ))),
    }
}

/// Unary bitwise inversion (ints and bools only).
pub fn invert(a: &Obj) -> Result<OwnedRef, OwnedRef> {
    match as_num(a) {
        Some(Num::Int(i)) => Ok(OwnedRef::int(!i)),
        _ => Err(type_error(format!(
            "bad operand type for unary ~: '{}'",
            a.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_val(r: &OwnedRef) -> i64 {
        match r.obj().payload {
            Payload::Int(i) => i,
            _ => panic!("expected int, got {:?}", r),
        }
    }

    fn float_val(r: &OwnedRef) -> f64 {
        match r.obj().payload {
            Payload::Float(f) => f,
            _ => panic!("expected float, got {:?}", r),
        }
    }

    #[test]
    fn floor_division_rounds_toward_negative_infinity() {
        let a = OwnedRef::int(-7);
        let b = OwnedRef::int(2);
        let q = binary_op(BinOp::FloorDiv, a.obj(), b.obj()).unwrap();
        let r = binary_op(BinOp::Rem, a.obj(), b.obj()).unwrap();
        assert_eq!(int_val(&q), -4);
        assert_eq!(int_val(&r), 1);
    }

    #[test]
    fn true_division_always_floats() {
        let a = OwnedRef::int(7);
        let b = OwnedRef::int(2);
        let q = binary_op(BinOp::TrueDiv, a.obj(), b.obj()).unwrap();
        assert_eq!(float_val(&q), 3.5);
    }

    #[test]
    fn division_by_zero_raises() {
        let a = OwnedRef::int(1);
        let z = OwnedRef::int(0);
        assert!(binary_op(BinOp::TrueDiv, a.obj(), z.obj()).is_err());
        assert!(binary_op(BinOp::FloorDiv, a.obj(), z.obj()).is_err());
        assert!(binary_op(BinOp::Rem, a.obj(), z.obj()).is_err());
    }

    #[test]
    fn integer_overflow_wraps() {
        let a = OwnedRef::int(i64::MAX);
        let one = OwnedRef::int(1);
        let sum = binary_op(BinOp::Add, a.obj(), one.obj()).unwrap();
        assert_eq!(int_val(&sum), i64::MIN);
    }

    #[test]
    fn mixed_arithmetic_promotes_to_float() {
        let a = OwnedRef::int(3);
        let b = OwnedRef::float(0.5);
        let sum = binary_op(BinOp::Add, a.obj(), b.obj()).unwrap();
        assert_eq!(float_val(&sum), 3.5);
    }

    #[test]
    fn string_concat_and_repeat() {
        let a = OwnedRef::str("ab");
        let b = OwnedRef::str("cd");
        let n = OwnedRef::int(3);
        let cat = binary_op(BinOp::Add, a.obj(), b.obj()).unwrap();
        let rep = binary_op(BinOp::Mul, a.obj(), n.obj()).unwrap();
        assert_eq!(cat.to_string(), "abcd");
        assert_eq!(rep.to_string(), "ababab");
    }

    #[test]
    fn list_repeat_with_negative_count_is_empty() {
        let v = OwnedRef::list(vec![OwnedRef::int(1)]);
        let n = OwnedRef::int(-2);
        let rep = binary_op(BinOp::Mul, v.obj(), n.obj()).unwrap();
        match &rep.obj().payload {
            Payload::List(items) => assert!(items.borrow().is_empty()),
            _ => panic!("expected list"),
        }
    }

    #[test]
    fn negative_exponent_goes_float() {
        let a = OwnedRef::int(2);
        let b = OwnedRef::int(-2);
        let p = binary_op(BinOp::Pow, a.obj(), b.obj()).unwrap();
        assert_eq!(float_val(&p), 0.25);
    }

    #[test]
    fn bitwise_rejects_floats() {
        let a = OwnedRef::float(1.0);
        let b = OwnedRef::int(1);
        assert!(binary_op(BinOp::And, a.obj(), b.obj()).is_err());
    }

    #[test]
    fn comparisons_across_numeric_kinds() {
        let a = OwnedRef::int(2);
        let b = OwnedRef::float(2.5);
        let lt = compare(CmpOp::Lt, a.obj(), b.obj()).unwrap();
        assert!(crate::object::truthy(lt.obj()));
        let bad = OwnedRef::str("x");
        assert!(compare(CmpOp::Lt, a.obj(), bad.obj()).is_err());
        assert!(compare(CmpOp::Ne, a.obj(), bad.obj()).is_ok());
    }

    #[test]
    fn unary_ops() {
        let a = OwnedRef::int(5);
        assert_eq!(int_val(&negate(a.obj()).unwrap()), -5);
        assert_eq!(int_val(&invert(a.obj()).unwrap()), -6);
        let s = OwnedRef::str("x");
        assert!(negate(s.obj()).is_err());
    }
}
