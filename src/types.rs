//! The value model: element types, dynamic values, and their byte layout.
//!
//! Every field element, global, and ghost-buffer cell is described by an
//! [`EbbType`] and carried dynamically as a [`Value`]. Values encode to and
//! decode from a fixed little-endian byte layout; field columns, ghost
//! buffers, and the binary mesh format all speak that layout, so a row copy
//! is always a plain byte copy.
//!
//! Widening is the only implicit conversion the type checker accepts:
//! `i32 → u64 / f32 / f64` and `f32 → f64`, applied element-wise to vectors
//! and matrices of the same shape. Everything else is rejected at kernel
//! compile.

use crate::ids::RelationId;
use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Scalar primitive kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarKind {
    Bool,
    I32,
    U64,
    F32,
    F64,
}

impl ScalarKind {
    /// Encoded size in bytes.
    pub fn size_of(self) -> usize {
        match self {
            ScalarKind::Bool => 1,
            ScalarKind::I32 | ScalarKind::F32 => 4,
            ScalarKind::U64 | ScalarKind::F64 => 8,
        }
    }

    /// True if `self` implicitly widens to `to`.
    pub fn widens_to(self, to: ScalarKind) -> bool {
        matches!(
            (self, to),
            (ScalarKind::I32, ScalarKind::U64)
                | (ScalarKind::I32, ScalarKind::F32)
                | (ScalarKind::I32, ScalarKind::F64)
                | (ScalarKind::F32, ScalarKind::F64)
        )
    }

    pub fn is_numeric(self) -> bool {
        !matches!(self, ScalarKind::Bool)
    }
}

/// The element type of a field, global, or kernel expression.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EbbType {
    Scalar(ScalarKind),
    Vector { elem: ScalarKind, len: usize },
    Matrix { elem: ScalarKind, rows: usize, cols: usize },
    /// A row handle into another relation. `lanes` is 1 for plain, grouped,
    /// and elastic targets, and one lane per axis for grid targets.
    Key { relation: RelationId, lanes: usize },
}

impl EbbType {
    pub fn scalar(kind: ScalarKind) -> Self {
        EbbType::Scalar(kind)
    }

    pub fn vector(elem: ScalarKind, len: usize) -> Self {
        EbbType::Vector { elem, len }
    }

    pub fn matrix(elem: ScalarKind, rows: usize, cols: usize) -> Self {
        EbbType::Matrix { elem, rows, cols }
    }

    /// Encoded element size in bytes.
    pub fn size_of(&self) -> usize {
        match self {
            EbbType::Scalar(k) => k.size_of(),
            EbbType::Vector { elem, len } => elem.size_of() * len,
            EbbType::Matrix { elem, rows, cols } => elem.size_of() * rows * cols,
            EbbType::Key { lanes, .. } => 8 * lanes,
        }
    }

    /// The scalar kind of the elements, if this is a scalar/vector/matrix.
    pub fn elem_kind(&self) -> Option<ScalarKind> {
        match self {
            EbbType::Scalar(k) => Some(*k),
            EbbType::Vector { elem, .. } | EbbType::Matrix { elem, .. } => Some(*elem),
            EbbType::Key { .. } => None,
        }
    }

    pub fn is_key(&self) -> bool {
        matches!(self, EbbType::Key { .. })
    }

    /// True if a value of `self` implicitly widens to `to`: identical types,
    /// or scalar widening applied element-wise over an identical shape.
    pub fn widens_to(&self, to: &EbbType) -> bool {
        if self == to {
            return true;
        }
        match (self, to) {
            (EbbType::Scalar(a), EbbType::Scalar(b)) => a.widens_to(*b),
            (
                EbbType::Vector { elem: a, len: la },
                EbbType::Vector { elem: b, len: lb },
            ) => la == lb && a.widens_to(*b),
            (
                EbbType::Matrix { elem: a, rows: ra, cols: ca },
                EbbType::Matrix { elem: b, rows: rb, cols: cb },
            ) => ra == rb && ca == cb && a.widens_to(*b),
            _ => false,
        }
    }
}

/// A dynamically-typed element value.
///
/// Vector and matrix payloads hold scalar `Value`s only; key payloads hold
/// one signed lane per axis (a single lane for non-grid targets).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    I32(i32),
    U64(u64),
    F32(f32),
    F64(f64),
    Vector(Vec<Value>),
    Matrix { rows: usize, cols: usize, elems: Vec<Value> },
    Key(Vec<i64>),
}

macro_rules! scalar_accessors {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        paste::paste! {
            $(
                #[doc = concat!("Extract a `", stringify!($ty), "` scalar, if that is what this value is.")]
                pub fn [<as_ $ty>](&self) -> Option<$ty> {
                    match self {
                        Value::$variant(v) => Some(*v),
                        _ => None,
                    }
                }
            )*
        }
    };
}

impl Value {
    scalar_accessors! {
        Bool => bool,
        I32 => i32,
        U64 => u64,
        F32 => f32,
        F64 => f64,
    }

    /// The all-zeros / identity-free default for a type: `false`, numeric
    /// zero, or a zero key.
    pub fn zero(ty: &EbbType) -> Value {
        fn scalar_zero(k: ScalarKind) -> Value {
            match k {
                ScalarKind::Bool => Value::Bool(false),
                ScalarKind::I32 => Value::I32(0),
                ScalarKind::U64 => Value::U64(0),
                ScalarKind::F32 => Value::F32(0.0),
                ScalarKind::F64 => Value::F64(0.0),
            }
        }
        match ty {
            EbbType::Scalar(k) => scalar_zero(*k),
            EbbType::Vector { elem, len } => {
                Value::Vector(vec![scalar_zero(*elem); *len])
            }
            EbbType::Matrix { elem, rows, cols } => Value::Matrix {
                rows: *rows,
                cols: *cols,
                elems: vec![scalar_zero(*elem); rows * cols],
            },
            EbbType::Key { lanes, .. } => Value::Key(vec![0; *lanes]),
        }
    }

    /// The scalar kind of this value, if it is a bare scalar.
    pub fn scalar_kind(&self) -> Option<ScalarKind> {
        match self {
            Value::Bool(_) => Some(ScalarKind::Bool),
            Value::I32(_) => Some(ScalarKind::I32),
            Value::U64(_) => Some(ScalarKind::U64),
            Value::F32(_) => Some(ScalarKind::F32),
            Value::F64(_) => Some(ScalarKind::F64),
            _ => None,
        }
    }

    /// True if this value structurally matches `ty`.
    pub fn matches(&self, ty: &EbbType) -> bool {
        match (self, ty) {
            (v, EbbType::Scalar(k)) => v.scalar_kind() == Some(*k),
            (Value::Vector(elems), EbbType::Vector { elem, len }) => {
                elems.len() == *len
                    && elems.iter().all(|e| e.scalar_kind() == Some(*elem))
            }
            (
                Value::Matrix { rows, cols, elems },
                EbbType::Matrix { elem, rows: r, cols: c },
            ) => {
                rows == r
                    && cols == c
                    && elems.iter().all(|e| e.scalar_kind() == Some(*elem))
            }
            (Value::Key(lanes), EbbType::Key { lanes: n, .. }) => lanes.len() == *n,
            _ => false,
        }
    }

    /// Widen this value to `ty`, if the widening table allows it.
    pub fn widen_to(&self, ty: &EbbType) -> Option<Value> {
        fn widen_scalar(v: &Value, to: ScalarKind) -> Option<Value> {
            if v.scalar_kind() == Some(to) {
                return Some(v.clone());
            }
            match (v, to) {
                (Value::I32(x), ScalarKind::U64) if *x >= 0 => Some(Value::U64(*x as u64)),
                (Value::I32(x), ScalarKind::F32) => Some(Value::F32(*x as f32)),
                (Value::I32(x), ScalarKind::F64) => Some(Value::F64(f64::from(*x))),
                (Value::F32(x), ScalarKind::F64) => Some(Value::F64(f64::from(*x))),
                _ => None,
            }
        }
        if self.matches(ty) {
            return Some(self.clone());
        }
        match ty {
            EbbType::Scalar(k) => widen_scalar(self, *k),
            EbbType::Vector { elem, len } => match self {
                Value::Vector(elems) if elems.len() == *len => {
                    let widened: Option<Vec<Value>> =
                        elems.iter().map(|e| widen_scalar(e, *elem)).collect();
                    widened.map(Value::Vector)
                }
                _ => None,
            },
            EbbType::Matrix { elem, rows, cols } => match self {
                Value::Matrix { rows: r, cols: c, elems } if r == rows && c == cols => {
                    let widened: Option<Vec<Value>> =
                        elems.iter().map(|e| widen_scalar(e, *elem)).collect();
                    widened.map(|elems| Value::Matrix {
                        rows: *rows,
                        cols: *cols,
                        elems,
                    })
                }
                _ => None,
            },
            _ => None,
        }
    }

    /// Append the little-endian encoding of this value to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Bool(b) => out.push(u8::from(*b)),
            Value::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::F64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Vector(elems) => {
                for e in elems {
                    e.encode_into(out);
                }
            }
            Value::Matrix { elems, .. } => {
                for e in elems {
                    e.encode_into(out);
                }
            }
            Value::Key(lanes) => {
                for l in lanes {
                    out.extend_from_slice(&l.to_le_bytes());
                }
            }
        }
    }

    /// Encode into a fresh buffer of exactly `ty.size_of()` bytes.
    pub fn encode(&self, ty: &EbbType) -> Vec<u8> {
        let mut out = Vec::with_capacity(ty.size_of());
        self.encode_into(&mut out);
        debug_assert_eq!(out.len(), ty.size_of());
        out
    }

    /// Decode a value of type `ty` from the front of `bytes`.
    pub fn decode(ty: &EbbType, bytes: &[u8]) -> Result<Value> {
        if bytes.len() < ty.size_of() {
            bail!(
                "truncated value: need {} bytes for {:?}, have {}",
                ty.size_of(),
                ty,
                bytes.len()
            );
        }
        fn scalar(k: ScalarKind, b: &[u8]) -> Value {
            match k {
                ScalarKind::Bool => Value::Bool(b[0] != 0),
                ScalarKind::I32 => Value::I32(i32::from_le_bytes(b[..4].try_into().unwrap())),
                ScalarKind::U64 => Value::U64(u64::from_le_bytes(b[..8].try_into().unwrap())),
                ScalarKind::F32 => Value::F32(f32::from_le_bytes(b[..4].try_into().unwrap())),
                ScalarKind::F64 => Value::F64(f64::from_le_bytes(b[..8].try_into().unwrap())),
            }
        }
        Ok(match ty {
            EbbType::Scalar(k) => scalar(*k, bytes),
            EbbType::Vector { elem, len } => {
                let sz = elem.size_of();
                Value::Vector((0..*len).map(|i| scalar(*elem, &bytes[i * sz..])).collect())
            }
            EbbType::Matrix { elem, rows, cols } => {
                let sz = elem.size_of();
                Value::Matrix {
                    rows: *rows,
                    cols: *cols,
                    elems: (0..rows * cols)
                        .map(|i| scalar(*elem, &bytes[i * sz..]))
                        .collect(),
                }
            }
            EbbType::Key { lanes, .. } => Value::Key(
                (0..*lanes)
                    .map(|i| i64::from_le_bytes(bytes[i * 8..i * 8 + 8].try_into().unwrap()))
                    .collect(),
            ),
        })
    }
}

/// Convenience constructors used heavily by tests and the AST builders.
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}
impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::U64(v)
    }
}
impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::F32(v)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

/// Build a `Value::Vector` of `f64` lanes.
pub fn vec_f64(lanes: &[f64]) -> Value {
    Value::Vector(lanes.iter().map(|v| Value::F64(*v)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(EbbType::scalar(ScalarKind::Bool).size_of(), 1);
        assert_eq!(EbbType::vector(ScalarKind::F64, 3).size_of(), 24);
        assert_eq!(EbbType::matrix(ScalarKind::F32, 2, 2).size_of(), 16);
    }

    #[test]
    fn roundtrip_scalars() -> Result<()> {
        let cases = vec![
            (EbbType::scalar(ScalarKind::Bool), Value::Bool(true)),
            (EbbType::scalar(ScalarKind::I32), Value::I32(-7)),
            (EbbType::scalar(ScalarKind::U64), Value::U64(1 << 40)),
            (EbbType::scalar(ScalarKind::F64), Value::F64(-0.25)),
        ];
        for (ty, v) in cases {
            let bytes = v.encode(&ty);
            assert_eq!(Value::decode(&ty, &bytes)?, v);
        }
        Ok(())
    }

    #[test]
    fn roundtrip_vector() -> Result<()> {
        let ty = EbbType::vector(ScalarKind::F64, 3);
        let v = vec_f64(&[1.0, 2.5, -3.0]);
        assert_eq!(Value::decode(&ty, &v.encode(&ty))?, v);
        Ok(())
    }

    #[test]
    fn widening_table() {
        assert!(EbbType::scalar(ScalarKind::I32).widens_to(&EbbType::scalar(ScalarKind::F64)));
        assert!(EbbType::scalar(ScalarKind::F32).widens_to(&EbbType::scalar(ScalarKind::F64)));
        assert!(!EbbType::scalar(ScalarKind::F64).widens_to(&EbbType::scalar(ScalarKind::F32)));
        assert!(!EbbType::scalar(ScalarKind::U64).widens_to(&EbbType::scalar(ScalarKind::I32)));

        assert_eq!(
            Value::I32(3).widen_to(&EbbType::scalar(ScalarKind::F64)),
            Some(Value::F64(3.0))
        );
        assert_eq!(Value::F64(3.0).widen_to(&EbbType::scalar(ScalarKind::I32)), None);
    }

    #[test]
    fn truncated_decode_is_an_error() {
        let ty = EbbType::scalar(ScalarKind::U64);
        assert!(Value::decode(&ty, &[0u8; 4]).is_err());
    }
}
