//! The reduction op table.
//!
//! Every reduction in a kernel — into a global, into a field, on CPU or on
//! the device — names one of these commutative-associative ops. Each op
//! knows its identity per element type and a combine step; the device tree
//! reduction and the per-chunk CPU fold both drive reductions exclusively
//! through [`ReduceOp::identity`] and [`ReduceOp::apply`], so identity
//! initialization is what makes the short-block case correct without
//! special-casing.
//!
//! Float `Min`/`Max` use total ordering (`ordered-float`), so NaNs order
//! deterministically instead of poisoning comparisons.

use crate::error::phase_err;
use crate::types::{EbbType, ScalarKind, Value};
use anyhow::Result;
use ordered_float::OrderedFloat;

/// A commutative-associative reduction operator with an identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ReduceOp {
    Add,
    Mul,
    Min,
    Max,
    And,
    Or,
}

macro_rules! numeric_combine {
    ($($kind:ident => $ty:ty),* $(,)?) => {
        paste::paste! {
            $(
                fn [<combine_ $kind:lower>](op: ReduceOp, a: $ty, b: $ty) -> $ty {
                    match op {
                        ReduceOp::Add => a + b,
                        ReduceOp::Mul => a * b,
                        ReduceOp::Min => if b < a { b } else { a },
                        ReduceOp::Max => if b > a { b } else { a },
                        // rejected by `supports` before we ever get here
                        ReduceOp::And | ReduceOp::Or => a,
                    }
                }
            )*
        }
    };
}

numeric_combine! {
    I32 => i32,
    U64 => u64,
}

fn combine_f32(op: ReduceOp, a: f32, b: f32) -> f32 {
    match op {
        ReduceOp::Add => a + b,
        ReduceOp::Mul => a * b,
        ReduceOp::Min => OrderedFloat(a).min(OrderedFloat(b)).0,
        ReduceOp::Max => OrderedFloat(a).max(OrderedFloat(b)).0,
        ReduceOp::And | ReduceOp::Or => a,
    }
}

fn combine_f64(op: ReduceOp, a: f64, b: f64) -> f64 {
    match op {
        ReduceOp::Add => a + b,
        ReduceOp::Mul => a * b,
        ReduceOp::Min => OrderedFloat(a).min(OrderedFloat(b)).0,
        ReduceOp::Max => OrderedFloat(a).max(OrderedFloat(b)).0,
        ReduceOp::And | ReduceOp::Or => a,
    }
}

impl ReduceOp {
    /// True if this op is defined for elements of `kind`.
    pub fn supports_scalar(self, kind: ScalarKind) -> bool {
        match self {
            ReduceOp::And | ReduceOp::Or => kind == ScalarKind::Bool,
            ReduceOp::Add | ReduceOp::Mul | ReduceOp::Min | ReduceOp::Max => kind.is_numeric(),
        }
    }

    /// True if this op is defined for `ty`. Key types never reduce.
    pub fn supports(self, ty: &EbbType) -> bool {
        match ty.elem_kind() {
            Some(kind) => self.supports_scalar(kind),
            None => false,
        }
    }

    /// The identity element `e` for this op over `ty` (`x ⊕ e == x`).
    pub fn identity(self, ty: &EbbType) -> Result<Value> {
        if !self.supports(ty) {
            return phase_err(format!("reduction {self:?} unsupported for {ty:?}"));
        }
        fn scalar_identity(op: ReduceOp, kind: ScalarKind) -> Value {
            match (op, kind) {
                (ReduceOp::Add, ScalarKind::I32) => Value::I32(0),
                (ReduceOp::Add, ScalarKind::U64) => Value::U64(0),
                (ReduceOp::Add, ScalarKind::F32) => Value::F32(0.0),
                (ReduceOp::Add, ScalarKind::F64) => Value::F64(0.0),
                (ReduceOp::Mul, ScalarKind::I32) => Value::I32(1),
                (ReduceOp::Mul, ScalarKind::U64) => Value::U64(1),
                (ReduceOp::Mul, ScalarKind::F32) => Value::F32(1.0),
                (ReduceOp::Mul, ScalarKind::F64) => Value::F64(1.0),
                (ReduceOp::Min, ScalarKind::I32) => Value::I32(i32::MAX),
                (ReduceOp::Min, ScalarKind::U64) => Value::U64(u64::MAX),
                (ReduceOp::Min, ScalarKind::F32) => Value::F32(f32::INFINITY),
                (ReduceOp::Min, ScalarKind::F64) => Value::F64(f64::INFINITY),
                (ReduceOp::Max, ScalarKind::I32) => Value::I32(i32::MIN),
                (ReduceOp::Max, ScalarKind::U64) => Value::U64(0),
                (ReduceOp::Max, ScalarKind::F32) => Value::F32(f32::NEG_INFINITY),
                (ReduceOp::Max, ScalarKind::F64) => Value::F64(f64::NEG_INFINITY),
                (ReduceOp::And, _) => Value::Bool(true),
                (ReduceOp::Or, _) => Value::Bool(false),
                // Bool with an arithmetic op is filtered by `supports`
                _ => unreachable!("unsupported identity"),
            }
        }
        Ok(match ty {
            EbbType::Scalar(k) => scalar_identity(self, *k),
            EbbType::Vector { elem, len } => {
                Value::Vector(vec![scalar_identity(self, *elem); *len])
            }
            EbbType::Matrix { elem, rows, cols } => Value::Matrix {
                rows: *rows,
                cols: *cols,
                elems: vec![scalar_identity(self, *elem); rows * cols],
            },
            EbbType::Key { .. } => unreachable!("keys never reduce"),
        })
    }

    /// Combine two values of the same structural type: `a ⊕ b`.
    ///
    /// Vector and matrix values combine element-wise.
    pub fn apply(self, a: &Value, b: &Value) -> Value {
        match (a, b) {
            (Value::Bool(x), Value::Bool(y)) => Value::Bool(match self {
                ReduceOp::And => *x && *y,
                ReduceOp::Or => *x || *y,
                _ => *x,
            }),
            (Value::I32(x), Value::I32(y)) => Value::I32(combine_i32(self, *x, *y)),
            (Value::U64(x), Value::U64(y)) => Value::U64(combine_u64(self, *x, *y)),
            (Value::F32(x), Value::F32(y)) => Value::F32(combine_f32(self, *x, *y)),
            (Value::F64(x), Value::F64(y)) => Value::F64(combine_f64(self, *x, *y)),
            (Value::Vector(xs), Value::Vector(ys)) => Value::Vector(
                xs.iter().zip(ys).map(|(x, y)| self.apply(x, y)).collect(),
            ),
            (
                Value::Matrix { rows, cols, elems: xs },
                Value::Matrix { elems: ys, .. },
            ) => Value::Matrix {
                rows: *rows,
                cols: *cols,
                elems: xs.iter().zip(ys).map(|(x, y)| self.apply(x, y)).collect(),
            },
            _ => a.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::vec_f64;

    #[test]
    fn identities_hold() -> Result<()> {
        let f64t = EbbType::scalar(ScalarKind::F64);
        let x = Value::F64(3.5);
        for op in [ReduceOp::Add, ReduceOp::Mul, ReduceOp::Min, ReduceOp::Max] {
            let e = op.identity(&f64t)?;
            assert_eq!(op.apply(&x, &e), x, "{op:?}");
        }
        let boolt = EbbType::scalar(ScalarKind::Bool);
        assert_eq!(
            ReduceOp::Or.apply(&Value::Bool(true), &ReduceOp::Or.identity(&boolt)?),
            Value::Bool(true)
        );
        Ok(())
    }

    #[test]
    fn vector_add_is_elementwise() {
        let a = vec_f64(&[1.0, 2.0]);
        let b = vec_f64(&[0.5, -2.0]);
        assert_eq!(ReduceOp::Add.apply(&a, &b), vec_f64(&[1.5, 0.0]));
    }

    #[test]
    fn bool_arith_unsupported() {
        let boolt = EbbType::scalar(ScalarKind::Bool);
        assert!(!ReduceOp::Add.supports(&boolt));
        assert!(ReduceOp::Add.identity(&boolt).is_err());
    }

    #[test]
    fn min_ignores_nan_ordering_pitfalls() {
        let m = ReduceOp::Min.apply(&Value::F64(f64::NAN), &Value::F64(1.0));
        // total order puts NaN above all reals
        assert_eq!(m, Value::F64(1.0));
    }

    #[test]
    fn keys_never_reduce() {
        let k = EbbType::Key { relation: crate::ids::RelationId::new(0), lanes: 1 };
        assert!(!ReduceOp::Add.supports(&k));
    }
}
