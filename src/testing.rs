//! Testing utilities for kernels and relations.
//!
//! Small helpers used by this crate's own test suite and by embedding
//! programs: value-list builders, collection assertions, and
//! tempfile-backed scratch directories for I/O tests.
//!
//! ```no_run
//! use meshflow::testing::*;
//! use meshflow::types::Value;
//!
//! let vals = f64s(&[1.0, 2.0, 3.0]);
//! assert_values_equal(&vals, &f64s(&[1.0, 2.0, 3.0]));
//! ```

use crate::types::Value;

/// A scratch directory that cleans itself up.
pub fn scratch_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("create scratch dir")
}

/// Build a value column from `f64`s.
pub fn f64s(vals: &[f64]) -> Vec<Value> {
    vals.iter().map(|v| Value::F64(*v)).collect()
}

/// Build a value column from `i32`s.
pub fn i32s(vals: &[i32]) -> Vec<Value> {
    vals.iter().map(|v| Value::I32(*v)).collect()
}

/// Build a value column from `u64`s.
pub fn u64s(vals: &[u64]) -> Vec<Value> {
    vals.iter().map(|v| Value::U64(*v)).collect()
}

/// Build a value column from `bool`s.
pub fn bools(vals: &[bool]) -> Vec<Value> {
    vals.iter().map(|v| Value::Bool(*v)).collect()
}

/// Extract `f64` scalars from a dumped column.
///
/// # Panics
/// Panics when any value is not an `F64`.
pub fn as_f64s(vals: &[Value]) -> Vec<f64> {
    vals.iter()
        .map(|v| v.as_f64().expect("expected an f64 column"))
        .collect()
}

/// Extract `i32` scalars from a dumped column.
///
/// # Panics
/// Panics when any value is not an `I32`.
pub fn as_i32s(vals: &[Value]) -> Vec<i32> {
    vals.iter()
        .map(|v| v.as_i32().expect("expected an i32 column"))
        .collect()
}

/// Exact, order-dependent column comparison with a readable diff.
///
/// # Panics
/// Panics when the columns differ.
pub fn assert_values_equal(actual: &[Value], expected: &[Value]) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "column length mismatch: {} vs {}",
        actual.len(),
        expected.len()
    );
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert_eq!(a, e, "row {i} differs");
    }
}

/// Assert two floats agree within `tol`.
///
/// # Panics
/// Panics when they differ by more than `tol`.
pub fn assert_near(a: f64, b: f64, tol: f64) {
    assert!(
        (a - b).abs() <= tol,
        "{a} and {b} differ by {} (tolerance {tol})",
        (a - b).abs()
    );
}
