//! CSV field I/O.
//!
//! Row-major, one relation row per line, values comma-separated. Vector and
//! matrix elements are flattened row-major into consecutive columns.
//! Booleans are `0`/`1`; floats print six decimals by default or a caller
//! precision. Read errors are annotated with the offending row.

use crate::relation::{Field, Relation};
use crate::types::{ScalarKind, Value};
use anyhow::{Context, Result, bail};
use csv::{ReaderBuilder, WriterBuilder};
use std::fs::{File, create_dir_all};
use std::path::Path;

fn fmt_scalar(v: &Value, precision: Option<usize>) -> String {
    match v {
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::I32(x) => x.to_string(),
        Value::U64(x) => x.to_string(),
        Value::F32(x) => match precision {
            Some(p) => format!("{x:.p$}"),
            None => format!("{x:.6}"),
        },
        Value::F64(x) => match precision {
            Some(p) => format!("{x:.p$}"),
            None => format!("{x:.6}"),
        },
        _ => unreachable!("flattened before formatting"),
    }
}

fn flatten(v: &Value, out: &mut Vec<String>, precision: Option<usize>) {
    match v {
        Value::Vector(elems) => {
            for e in elems {
                out.push(fmt_scalar(e, precision));
            }
        }
        Value::Matrix { elems, .. } => {
            for e in elems {
                out.push(fmt_scalar(e, precision));
            }
        }
        Value::Key(lanes) => {
            for l in lanes {
                out.push(l.to_string());
            }
        }
        scalar => out.push(fmt_scalar(scalar, precision)),
    }
}

fn parse_scalar(kind: ScalarKind, s: &str) -> Result<Value> {
    let s = s.trim();
    Ok(match kind {
        ScalarKind::Bool => match s {
            "0" => Value::Bool(false),
            "1" => Value::Bool(true),
            _ => bail!("expected 0 or 1 for a bool, got `{s}`"),
        },
        ScalarKind::I32 => Value::I32(s.parse().with_context(|| format!("parse i32 `{s}`"))?),
        ScalarKind::U64 => Value::U64(s.parse().with_context(|| format!("parse u64 `{s}`"))?),
        ScalarKind::F32 => Value::F32(s.parse().with_context(|| format!("parse f32 `{s}`"))?),
        ScalarKind::F64 => Value::F64(s.parse().with_context(|| format!("parse f64 `{s}`"))?),
    })
}

/// How many CSV columns one cell of this field occupies.
fn lane_count(field: &Field) -> usize {
    match field.ty() {
        crate::types::EbbType::Vector { len, .. } => len,
        crate::types::EbbType::Matrix { rows, cols, .. } => rows * cols,
        crate::types::EbbType::Key { lanes, .. } => lanes,
        _ => 1,
    }
}

/// Write one field column as CSV, one row per line. Returns the row count.
pub fn write_field_csv(
    rel: &Relation,
    field: &Field,
    path: impl AsRef<Path>,
    precision: Option<usize>,
) -> Result<usize> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        create_dir_all(parent).with_context(|| format!("mkdir -p {}", parent.display()))?;
    }
    let f = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut wtr = WriterBuilder::new().has_headers(false).from_writer(f);
    let values = rel.dump(field)?;
    for (i, v) in values.iter().enumerate() {
        let mut record = Vec::new();
        flatten(v, &mut record, precision);
        wtr.write_record(&record)
            .with_context(|| format!("serialize CSV row #{}", i + 1))?;
    }
    wtr.flush()?;
    Ok(values.len())
}

/// Load one field column from CSV. The file must hold exactly one line per
/// visible row.
pub fn read_field_csv(rel: &Relation, field: &Field, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_reader(f);

    let ty = field.ty();
    let lanes = lane_count(field);
    let mut values = Vec::new();
    for (i, rec) in rdr.records().enumerate() {
        let rec = rec.with_context(|| format!("parse CSV record #{}", i + 1))?;
        if rec.len() != lanes {
            bail!(
                "CSV record #{} has {} values, field needs {lanes}",
                i + 1,
                rec.len()
            );
        }
        let v = match &ty {
            crate::types::EbbType::Scalar(k) => parse_scalar(*k, &rec[0])
                .with_context(|| format!("CSV record #{}", i + 1))?,
            crate::types::EbbType::Vector { elem, .. } => {
                let elems: Result<Vec<Value>> =
                    rec.iter().map(|s| parse_scalar(*elem, s)).collect();
                Value::Vector(elems.with_context(|| format!("CSV record #{}", i + 1))?)
            }
            crate::types::EbbType::Matrix { elem, rows, cols } => {
                let elems: Result<Vec<Value>> =
                    rec.iter().map(|s| parse_scalar(*elem, s)).collect();
                Value::Matrix {
                    rows: *rows,
                    cols: *cols,
                    elems: elems.with_context(|| format!("CSV record #{}", i + 1))?,
                }
            }
            crate::types::EbbType::Key { .. } => {
                let mut ls = Vec::with_capacity(lanes);
                for s in rec.iter() {
                    ls.push(s.trim().parse::<i64>().with_context(|| {
                        format!("parse key lane `{s}` in CSV record #{}", i + 1)
                    })?);
                }
                Value::Key(ls)
            }
        };
        values.push(v);
    }

    let n = rel.logical_size();
    if values.len() as u64 != n {
        bail!(
            "{} holds {} rows, relation `{}` has {n}",
            path.display(),
            values.len(),
            rel.name()
        );
    }
    rel.load(field, &values)
}
