//! The launch engine and the in-crate kernel executable.
//!
//! The execution core consumes compiled kernels through the
//! [`CompiledKernel`] seam: an executable is handed the bound argument data
//! and invoked once per row. The in-crate code generator ([`AstExec`])
//! evaluates the typed AST directly; a JIT back end would implement the same
//! trait.
//!
//! Writes are restricted by phase analysis to the centered row, so written
//! columns split into disjoint contiguous chunks and row chunks run in
//! parallel with rayon. Read columns are shared snapshots and readable from
//! any chunk. Kernels that insert (shared write index) or scatter a field
//! reduction run on a single chunk.

use crate::ids::{GlobalId, RelationId};
use crate::kernel::ast::{BinOp, Expr, Key, KernelDef, Stmt, UnOp};
use crate::relation::InsertReservation;
use crate::reduce::ReduceOp;
use crate::store::ColumnView;
use crate::types::{EbbType, ScalarKind, Value};
use anyhow::{Result, anyhow, bail};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

/// How the CPU engine schedules row chunks (the device engine always runs
/// block-shaped).
#[derive(Clone, Copy, Debug)]
pub enum ExecMode {
    Sequential,
    Parallel { partitions: Option<usize> },
}

#[derive(Clone, Debug)]
pub(crate) struct GridInfo {
    pub dims: Vec<u64>,
    pub periodic: Vec<bool>,
}

impl GridInfo {
    pub fn coords_of(&self, row: u64) -> Vec<u64> {
        let mut row = row;
        let mut out = vec![0u64; self.dims.len()];
        for (i, d) in self.dims.iter().enumerate().rev() {
            out[i] = row % d;
            row /= d;
        }
        out
    }

    /// Linear row of the centered cell displaced by `offset`, or `None`
    /// when the displacement leaves the grid on a non-periodic axis.
    pub fn offset_row(&self, row: u64, offset: &[i64]) -> Option<u64> {
        let coords = self.coords_of(row);
        let mut linear = 0u64;
        for i in 0..self.dims.len() {
            let d = self.dims[i] as i64;
            let mut c = coords[i] as i64 + offset[i];
            if self.periodic[i] {
                c = c.rem_euclid(d);
            } else if c < 0 || c >= d {
                return None;
            }
            linear = linear * self.dims[i] + c as u64;
        }
        Some(linear)
    }
}

/// The row set a launch iterates.
#[derive(Clone)]
pub(crate) enum Domain {
    /// All rows `[0, n)`.
    Range { n: u64 },
    /// Rows `[0, len)` filtered by a boolmask subset.
    Mask { mask: Arc<Vec<bool>> },
    /// An index-subset's packed row list.
    Index { rows: Arc<Vec<u64>> },
}

impl Domain {
    /// Number of candidate rows iterated (before live-mask filtering).
    pub fn candidate_rows(&self) -> u64 {
        match self {
            Domain::Range { n } => *n,
            Domain::Mask { mask } => mask.iter().filter(|b| **b).count() as u64,
            Domain::Index { rows } => rows.len() as u64,
        }
    }
}

/// Where the elastic live guard reads from during a launch.
#[derive(Clone)]
pub(crate) enum LiveGuard {
    None,
    /// The live mask is read-only this launch.
    View(ColumnView),
    /// The live mask is a write column (deleting kernels).
    WriteCol(crate::kernel::ast::FieldRef),
}

#[derive(Clone)]
pub(crate) struct QueryBind {
    pub relation: RelationId,
    pub offset: ColumnView,
    pub length: ColumnView,
}

/// Everything a launch shares read-only across chunks.
pub(crate) struct BindData {
    pub launch: RelationId,
    pub domain: Domain,
    /// Inclusive per-axis row bounds, as exposed in the argument layout.
    pub bounds: Vec<(u64, u64)>,
    pub grid: Option<GridInfo>,
    pub reads: Vec<(crate::kernel::ast::FieldRef, ColumnView)>,
    pub globals_in: Vec<(GlobalId, Value)>,
    pub global_reduces: Vec<(GlobalId, ReduceOp, EbbType)>,
    pub queries: Vec<QueryBind>,
    pub live: LiveGuard,
    /// Dims of grid relations reachable through multi-lane key values.
    pub key_grids: Vec<(RelationId, Vec<u64>)>,
    pub delete_live: Option<crate::kernel::ast::FieldRef>,
}

/// Exclusively-held columns a launch mutates, split into chunk slices by the
/// engine.
pub(crate) struct WriteCols {
    pub cols: Vec<(crate::kernel::ast::FieldRef, crate::store::ColumnOwned)>,
    pub reduce_cols: Vec<(crate::kernel::ast::FieldRef, ReduceOp, crate::store::ColumnOwned)>,
}

/// Bind-time state of an inserting launch.
pub(crate) struct InsertBind {
    pub reservation: InsertReservation,
    /// The write index; starts at the reservation base.
    pub next: u64,
    /// Checked-out target columns: (field name, type, elem size, bytes).
    pub cols: Vec<(String, EbbType, usize, Vec<u8>)>,
    pub live_bytes: Vec<u8>,
}

/// What a launch produced, before post-processing.
pub(crate) struct LaunchOutcome {
    pub rows: u64,
    /// Reduction totals aligned with `BindData::global_reduces`; still to be
    /// combined into the live globals.
    pub global_totals: Vec<Value>,
    pub deleted: u64,
}

pub(crate) type WriteSlice<'a> = (crate::kernel::ast::FieldRef, usize, EbbType, &'a mut [u8]);
pub(crate) type ReduceSlice<'a> =
    (crate::kernel::ast::FieldRef, ReduceOp, usize, EbbType, &'a mut [u8]);

/// Per-chunk mutable execution context handed to the executable.
pub(crate) struct RowCtx<'a> {
    pub bind: &'a BindData,
    /// Row range the write slices cover.
    pub chunk_start: u64,
    pub chunk_end: u64,
    pub write_slices: Vec<WriteSlice<'a>>,
    pub reduce_slices: Vec<ReduceSlice<'a>>,
    /// One accumulator per reduced global (identity-initialized).
    pub global_acc: Vec<Value>,
    pub deleted: u64,
    pub insert: Option<&'a mut InsertBind>,
}

/// The contract between the core and a compiled kernel body: run one row
/// against the bound argument data.
pub(crate) trait CompiledKernel: Send + Sync {
    fn exec_row(&self, row: u64, ctx: &mut RowCtx) -> Result<()>;
}

// --- the in-crate code generator: a direct AST evaluator --------------------

pub(crate) struct AstExec {
    pub def: Arc<KernelDef>,
}

type Locals = HashMap<String, Value>;

impl CompiledKernel for AstExec {
    fn exec_row(&self, row: u64, ctx: &mut RowCtx) -> Result<()> {
        let mut locals = Locals::new();
        exec_stmts(&self.def.body, row, ctx, &mut locals)
    }
}

fn exec_stmts(stmts: &[Stmt], row: u64, ctx: &mut RowCtx, locals: &mut Locals) -> Result<()> {
    for s in stmts {
        exec_stmt(s, row, ctx, locals)?;
    }
    Ok(())
}

fn exec_stmt(s: &Stmt, row: u64, ctx: &mut RowCtx, locals: &mut Locals) -> Result<()> {
    match s {
        Stmt::Let { name, value } => {
            let v = eval(value, row, ctx, locals)?;
            locals.insert(name.clone(), v);
            Ok(())
        }
        Stmt::Assign { field, value } => {
            let v = eval(value, row, ctx, locals)?;
            let slot = ctx
                .write_slices
                .iter_mut()
                .find(|(r, ..)| r == field)
                .ok_or_else(|| anyhow!("write column not bound"))?;
            let (_, elem, ty, bytes) = slot;
            let v = v
                .widen_to(ty)
                .ok_or_else(|| anyhow!("value does not fit the field type"))?;
            let off = (row - ctx.chunk_start) as usize * *elem;
            bytes[off..off + *elem].copy_from_slice(&v.encode(ty));
            Ok(())
        }
        Stmt::ReduceField { field, key, op, value } => {
            let v = eval(value, row, ctx, locals)?;
            let target = resolve_key(key, row, ctx, locals, field.relation)?;
            if target < ctx.chunk_start || target >= ctx.chunk_end {
                bail!("scattered field reduction outside the scheduled chunk");
            }
            let slot = ctx
                .reduce_slices
                .iter_mut()
                .find(|(r, ..)| r == field)
                .ok_or_else(|| anyhow!("reduce column not bound"))?;
            let (_, _, elem, ty, bytes) = slot;
            let v = v
                .widen_to(ty)
                .ok_or_else(|| anyhow!("value does not fit the field type"))?;
            let off = (target - ctx.chunk_start) as usize * *elem;
            let current = Value::decode(ty, &bytes[off..off + *elem])?;
            let next = op.apply(&current, &v);
            bytes[off..off + *elem].copy_from_slice(&next.encode(ty));
            Ok(())
        }
        Stmt::ReduceGlobal { global, op, value } => {
            let v = eval(value, row, ctx, locals)?;
            let idx = ctx
                .bind
                .global_reduces
                .iter()
                .position(|(g, ..)| g == global)
                .ok_or_else(|| anyhow!("reduced global not bound"))?;
            let ty = &ctx.bind.global_reduces[idx].2;
            let v = v
                .widen_to(ty)
                .ok_or_else(|| anyhow!("value does not fit the global type"))?;
            ctx.global_acc[idx] = op.apply(&ctx.global_acc[idx], &v);
            Ok(())
        }
        Stmt::If { cond, then_s, else_s } => {
            let c = eval(cond, row, ctx, locals)?;
            if c.as_bool().ok_or_else(|| anyhow!("non-bool condition"))? {
                exec_stmts(then_s, row, ctx, locals)
            } else {
                exec_stmts(else_s, row, ctx, locals)
            }
        }
        Stmt::ForQuery { var, relation, body } => {
            let q = ctx
                .bind
                .queries
                .iter()
                .find(|q| q.relation == *relation)
                .ok_or_else(|| anyhow!("query columns not bound"))?;
            let off = q
                .offset
                .value_at(row)?
                .as_u64()
                .ok_or_else(|| anyhow!("bad offset column"))?;
            let len = q
                .length
                .value_at(row)?
                .as_u64()
                .ok_or_else(|| anyhow!("bad length column"))?;
            for r in off..off + len {
                locals.insert(var.clone(), Value::Key(vec![r as i64]));
                exec_stmts(body, row, ctx, locals)?;
            }
            locals.remove(var);
            Ok(())
        }
        Stmt::Insert { values, .. } => {
            // Evaluate the full record first; the claim below needs the
            // exclusive borrow.
            let mut record = Vec::with_capacity(values.len());
            for (name, e) in values {
                record.push((name.as_str(), eval(e, row, ctx, locals)?));
            }
            let ins = ctx
                .insert
                .as_mut()
                .ok_or_else(|| anyhow!("insert state not bound"))?;
            let claim = ins.next;
            if claim >= ins.reservation.cap {
                bail!(
                    "insert exceeded its reservation of {} rows",
                    ins.reservation.cap - ins.reservation.base
                );
            }
            ins.next += 1;
            for (name, v) in record {
                let (_, ty, elem, bytes) = ins
                    .cols
                    .iter_mut()
                    .find(|(n, ..)| n == name)
                    .ok_or_else(|| anyhow!("insert field `{name}` not bound"))?;
                let off = claim as usize * *elem;
                bytes[off..off + *elem].copy_from_slice(&v.encode(ty));
            }
            ins.live_bytes[claim as usize] = 1;
            Ok(())
        }
        Stmt::Delete => {
            let live = ctx
                .bind
                .delete_live
                .ok_or_else(|| anyhow!("delete state not bound"))?;
            let slot = ctx
                .write_slices
                .iter_mut()
                .find(|(r, ..)| *r == live)
                .ok_or_else(|| anyhow!("live mask not bound"))?;
            let off = (row - ctx.chunk_start) as usize;
            slot.3[off] = 0;
            ctx.deleted += 1;
            Ok(())
        }
    }
}

fn eval(e: &Expr, row: u64, ctx: &RowCtx, locals: &Locals) -> Result<Value> {
    match e {
        Expr::Const(v) => Ok(v.clone()),
        Expr::Local(name) => locals
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("unknown local `{name}`")),
        Expr::RowIndex => Ok(Value::U64(row)),
        Expr::ReadGlobal(g) => ctx
            .bind
            .globals_in
            .iter()
            .find(|(id, _)| id == g)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| anyhow!("global not bound")),
        Expr::ReadField { field, key } => {
            let target = resolve_key(key, row, ctx, locals, field.relation)?;
            read_field(ctx, *field, target)
        }
        Expr::Unary(op, inner) => {
            let v = eval(inner, row, ctx, locals)?;
            eval_unop(*op, v)
        }
        Expr::Binary(op, a, b) => {
            let va = eval(a, row, ctx, locals)?;
            let vb = eval(b, row, ctx, locals)?;
            eval_binop(*op, va, vb)
        }
        Expr::Select { cond, then_e, else_e } => {
            let c = eval(cond, row, ctx, locals)?;
            if c.as_bool().ok_or_else(|| anyhow!("non-bool select condition"))? {
                eval(then_e, row, ctx, locals)
            } else {
                eval(else_e, row, ctx, locals)
            }
        }
        Expr::VecCons(lanes) => {
            let vals: Result<Vec<Value>> =
                lanes.iter().map(|l| eval(l, row, ctx, locals)).collect();
            Ok(Value::Vector(vals?))
        }
        Expr::Index { base, lane } => {
            let v = eval(base, row, ctx, locals)?;
            match v {
                Value::Vector(elems) => elems
                    .get(*lane)
                    .cloned()
                    .ok_or_else(|| anyhow!("vector lane out of range")),
                _ => bail!("lane extraction on a non-vector"),
            }
        }
        Expr::Cast(kind, inner) => {
            let v = eval(inner, row, ctx, locals)?;
            cast_scalar(&v, *kind)
        }
        Expr::InBounds(offset) => {
            let grid = ctx
                .bind
                .grid
                .as_ref()
                .ok_or_else(|| anyhow!("in-bounds probe without a grid"))?;
            Ok(Value::Bool(grid.offset_row(row, offset).is_some()))
        }
    }
}

fn read_field(ctx: &RowCtx, f: crate::kernel::ast::FieldRef, target: u64) -> Result<Value> {
    // ReadWrite fields are checked out as chunk slices; phase analysis
    // guarantees reads of them are centered, hence inside the chunk.
    if let Some((_, elem, ty, bytes)) = ctx.write_slices.iter().find(|(r, ..)| *r == f) {
        let off = (target - ctx.chunk_start) as usize * *elem;
        return Value::decode(ty, &bytes[off..off + *elem]);
    }
    if let Some((_, view)) = ctx.bind.reads.iter().find(|(r, _)| *r == f) {
        return view.value_at(target);
    }
    bail!("field read not bound")
}

fn resolve_key(
    key: &Key,
    row: u64,
    ctx: &RowCtx,
    locals: &Locals,
    owner: RelationId,
) -> Result<u64> {
    match key {
        Key::Centered => Ok(row),
        Key::Offset(offset) => {
            let grid = ctx
                .bind
                .grid
                .as_ref()
                .ok_or_else(|| anyhow!("offset access without a grid"))?;
            grid.offset_row(row, offset)
                .ok_or_else(|| anyhow!("stencil access outside the grid at row {row}"))
        }
        Key::Expr(e) => {
            let v = eval(e, row, ctx, locals)?;
            let lanes = match v {
                Value::Key(lanes) => lanes,
                other => bail!("key expression produced {other:?}"),
            };
            if lanes.len() == 1 {
                if lanes[0] < 0 {
                    bail!("negative row key");
                }
                return Ok(lanes[0] as u64);
            }
            let dims = if owner == ctx.bind.launch {
                ctx.bind
                    .grid
                    .as_ref()
                    .map(|g| g.dims.clone())
                    .ok_or_else(|| anyhow!("multi-lane key into a non-grid relation"))?
            } else {
                ctx.bind
                    .key_grids
                    .iter()
                    .find(|(r, _)| *r == owner)
                    .map(|(_, d)| d.clone())
                    .ok_or_else(|| anyhow!("grid dims for key target not bound"))?
            };
            let mut linear = 0u64;
            for (c, d) in lanes.iter().zip(&dims) {
                if *c < 0 || *c as u64 >= *d {
                    bail!("grid key out of range");
                }
                linear = linear * d + *c as u64;
            }
            Ok(linear)
        }
    }
}

fn eval_unop(op: UnOp, v: Value) -> Result<Value> {
    match (op, v) {
        (UnOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnOp::Neg, Value::I32(x)) => Ok(Value::I32(-x)),
        (UnOp::Neg, Value::F32(x)) => Ok(Value::F32(-x)),
        (UnOp::Neg, Value::F64(x)) => Ok(Value::F64(-x)),
        (UnOp::Neg, Value::Vector(xs)) => {
            let out: Result<Vec<Value>> =
                xs.into_iter().map(|x| eval_unop(UnOp::Neg, x)).collect();
            Ok(Value::Vector(out?))
        }
        (op, v) => bail!("cannot apply {op:?} to {v:?}"),
    }
}

/// Unify two scalar operands by the widening table.
fn unify_pair(a: Value, b: Value) -> Result<(Value, Value)> {
    let (ka, kb) = (a.scalar_kind(), b.scalar_kind());
    match (ka, kb) {
        (Some(ka), Some(kb)) if ka == kb => Ok((a, b)),
        (Some(ka), Some(kb)) if ka.widens_to(kb) => {
            let a = a
                .widen_to(&EbbType::scalar(kb))
                .ok_or_else(|| anyhow!("widening failed"))?;
            Ok((a, b))
        }
        (Some(ka), Some(kb)) if kb.widens_to(ka) => {
            let b = b
                .widen_to(&EbbType::scalar(ka))
                .ok_or_else(|| anyhow!("widening failed"))?;
            Ok((a, b))
        }
        _ => bail!("operand kinds do not unify"),
    }
}

fn eval_binop(op: BinOp, a: Value, b: Value) -> Result<Value> {
    // element-wise lift over vectors and matrices
    match (&a, &b) {
        (Value::Vector(xs), Value::Vector(ys)) if xs.len() == ys.len() => {
            let out: Result<Vec<Value>> = xs
                .iter()
                .zip(ys)
                .map(|(x, y)| eval_binop(op, x.clone(), y.clone()))
                .collect();
            return Ok(Value::Vector(out?));
        }
        (Value::Matrix { rows, cols, elems: xs }, Value::Matrix { elems: ys, .. }) => {
            let out: Result<Vec<Value>> = xs
                .iter()
                .zip(ys)
                .map(|(x, y)| eval_binop(op, x.clone(), y.clone()))
                .collect();
            return Ok(Value::Matrix { rows: *rows, cols: *cols, elems: out? });
        }
        _ => {}
    }

    match op {
        BinOp::And | BinOp::Or => {
            let (x, y) = (
                a.as_bool().ok_or_else(|| anyhow!("logic op on non-bool"))?,
                b.as_bool().ok_or_else(|| anyhow!("logic op on non-bool"))?,
            );
            return Ok(Value::Bool(match op {
                BinOp::And => x && y,
                _ => x || y,
            }));
        }
        BinOp::Eq => return Ok(Value::Bool(equal_after_unify(a, b)?)),
        BinOp::Ne => return Ok(Value::Bool(!equal_after_unify(a, b)?)),
        _ => {}
    }

    let (a, b) = unify_pair(a, b)?;
    macro_rules! arith {
        ($x:expr, $y:expr, $wrap:path) => {
            match op {
                BinOp::Add => $wrap($x + $y),
                BinOp::Sub => $wrap($x - $y),
                BinOp::Mul => $wrap($x * $y),
                BinOp::Div => $wrap($x / $y),
                BinOp::Mod => $wrap($x % $y),
                BinOp::Lt => Value::Bool($x < $y),
                BinOp::Le => Value::Bool($x <= $y),
                BinOp::Gt => Value::Bool($x > $y),
                BinOp::Ge => Value::Bool($x >= $y),
                _ => unreachable!(),
            }
        };
    }
    Ok(match (a, b) {
        (Value::I32(x), Value::I32(y)) => {
            if matches!(op, BinOp::Div | BinOp::Mod) && y == 0 {
                bail!("integer division by zero");
            }
            arith!(x, y, Value::I32)
        }
        (Value::U64(x), Value::U64(y)) => {
            if matches!(op, BinOp::Div | BinOp::Mod) && y == 0 {
                bail!("integer division by zero");
            }
            arith!(x, y, Value::U64)
        }
        (Value::F32(x), Value::F32(y)) => arith!(x, y, Value::F32),
        (Value::F64(x), Value::F64(y)) => arith!(x, y, Value::F64),
        (a, b) => bail!("cannot apply {op:?} to {a:?} and {b:?}"),
    })
}

fn equal_after_unify(a: Value, b: Value) -> Result<bool> {
    if a.scalar_kind().is_some() && b.scalar_kind().is_some() {
        let (a, b) = unify_pair(a, b)?;
        Ok(a == b)
    } else {
        Ok(a == b)
    }
}

fn cast_scalar(v: &Value, to: ScalarKind) -> Result<Value> {
    let out = match (v, to) {
        (Value::I32(x), ScalarKind::I32) => Value::I32(*x),
        (Value::I32(x), ScalarKind::U64) => Value::U64(*x as u64),
        (Value::I32(x), ScalarKind::F32) => Value::F32(*x as f32),
        (Value::I32(x), ScalarKind::F64) => Value::F64(f64::from(*x)),
        (Value::U64(x), ScalarKind::I32) => Value::I32(*x as i32),
        (Value::U64(x), ScalarKind::U64) => Value::U64(*x),
        (Value::U64(x), ScalarKind::F32) => Value::F32(*x as f32),
        (Value::U64(x), ScalarKind::F64) => Value::F64(*x as f64),
        (Value::F32(x), ScalarKind::I32) => Value::I32(*x as i32),
        (Value::F32(x), ScalarKind::U64) => Value::U64(*x as u64),
        (Value::F32(x), ScalarKind::F32) => Value::F32(*x),
        (Value::F32(x), ScalarKind::F64) => Value::F64(f64::from(*x)),
        (Value::F64(x), ScalarKind::I32) => Value::I32(*x as i32),
        (Value::F64(x), ScalarKind::U64) => Value::U64(*x as u64),
        (Value::F64(x), ScalarKind::F32) => Value::F32(*x as f32),
        (Value::F64(x), ScalarKind::F64) => Value::F64(*x),
        (v, to) => bail!("cannot cast {v:?} to {to:?}"),
    };
    Ok(out)
}

// --- chunked launch engine --------------------------------------------------

/// Contiguous row chunks tiling `[0, n)`.
pub(crate) fn chunk_ranges(n: u64, parts: usize) -> Vec<(u64, u64)> {
    if n == 0 {
        return vec![(0, 0)];
    }
    let parts = (parts.max(1) as u64).min(n);
    let per = n.div_ceil(parts);
    let mut out = Vec::new();
    let mut start = 0;
    while start < n {
        let end = (start + per).min(n);
        out.push((start, end));
        start = end;
    }
    out
}

/// Split every write column into per-chunk mutable slices, transposed to
/// `[chunk][column]` order.
pub(crate) fn split_write_cols<'a>(
    cols: &'a mut [(crate::kernel::ast::FieldRef, crate::store::ColumnOwned)],
    chunks: &[(u64, u64)],
) -> Vec<Vec<WriteSlice<'a>>> {
    let mut per_col: Vec<Vec<WriteSlice<'a>>> = Vec::with_capacity(cols.len());
    for (fref, col) in cols.iter_mut() {
        let elem = col.elem_size;
        let ty = col.ty.clone();
        let mut rest: &mut [u8] = col.bytes.as_mut_slice();
        let mut slices = Vec::with_capacity(chunks.len());
        for &(s, e) in chunks {
            let take = (e - s) as usize * elem;
            let (head, tail) = rest.split_at_mut(take);
            slices.push((*fref, elem, ty.clone(), head));
            rest = tail;
        }
        per_col.push(slices);
    }
    transpose(per_col, chunks.len())
}

pub(crate) fn split_reduce_cols<'a>(
    cols: &'a mut [(crate::kernel::ast::FieldRef, ReduceOp, crate::store::ColumnOwned)],
    chunks: &[(u64, u64)],
) -> Vec<Vec<ReduceSlice<'a>>> {
    let mut per_col: Vec<Vec<ReduceSlice<'a>>> = Vec::with_capacity(cols.len());
    for (fref, op, col) in cols.iter_mut() {
        let elem = col.elem_size;
        let ty = col.ty.clone();
        let mut rest: &mut [u8] = col.bytes.as_mut_slice();
        let mut slices = Vec::with_capacity(chunks.len());
        for &(s, e) in chunks {
            let take = (e - s) as usize * elem;
            let (head, tail) = rest.split_at_mut(take);
            slices.push((*fref, *op, elem, ty.clone(), head));
            rest = tail;
        }
        per_col.push(slices);
    }
    transpose(per_col, chunks.len())
}

fn transpose<T>(per_col: Vec<Vec<T>>, n_chunks: usize) -> Vec<Vec<T>> {
    let mut iters: Vec<_> = per_col.into_iter().map(Vec::into_iter).collect();
    (0..n_chunks)
        .map(|_| iters.iter_mut().map(|it| it.next().unwrap()).collect())
        .collect()
}

pub(crate) struct ChunkOut {
    pub acc: Vec<Value>,
    pub deleted: u64,
    pub rows: u64,
}

/// Is a candidate row live (elastic relations skip dead rows)?
pub(crate) fn row_live(ctx: &RowCtx, row: u64) -> Result<bool> {
    match &ctx.bind.live {
        LiveGuard::None => Ok(true),
        LiveGuard::View(view) => Ok(view.bytes[row as usize] != 0),
        LiveGuard::WriteCol(fref) => {
            let (_, _, _, bytes) = ctx
                .write_slices
                .iter()
                .find(|(r, ..)| r == fref)
                .ok_or_else(|| anyhow!("live mask not bound"))?;
            Ok(bytes[(row - ctx.chunk_start) as usize] != 0)
        }
    }
}

/// Run one chunk: iterate its candidate rows, apply domain and live
/// filtering, and execute the kernel per surviving row.
pub(crate) fn run_chunk(
    exec: &dyn CompiledKernel,
    bind: &BindData,
    chunk: (u64, u64),
    write_slices: Vec<WriteSlice<'_>>,
    reduce_slices: Vec<ReduceSlice<'_>>,
    identities: &[Value],
    insert: Option<&mut InsertBind>,
) -> Result<ChunkOut> {
    let mut ctx = RowCtx {
        bind,
        chunk_start: chunk.0,
        chunk_end: chunk.1,
        write_slices,
        reduce_slices,
        global_acc: identities.to_vec(),
        deleted: 0,
        insert,
    };
    let mut rows = 0u64;
    match &bind.domain {
        Domain::Range { .. } => {
            for row in chunk.0..chunk.1 {
                if row_live(&ctx, row)? {
                    exec.exec_row(row, &mut ctx)?;
                    rows += 1;
                }
            }
        }
        Domain::Mask { mask } => {
            for row in chunk.0..chunk.1 {
                if mask[row as usize] && row_live(&ctx, row)? {
                    exec.exec_row(row, &mut ctx)?;
                    rows += 1;
                }
            }
        }
        Domain::Index { rows: list } => {
            // index launches run on a single full-width chunk
            for &row in list.iter() {
                if row_live(&ctx, row)? {
                    exec.exec_row(row, &mut ctx)?;
                    rows += 1;
                }
            }
        }
    }
    Ok(ChunkOut { acc: ctx.global_acc, deleted: ctx.deleted, rows })
}

/// The CPU engine: one chunk sequentially, or rayon over row chunks.
pub(crate) fn run_cpu(
    exec: &dyn CompiledKernel,
    bind: &BindData,
    writes: &mut WriteCols,
    mut insert: Option<&mut InsertBind>,
    mode: ExecMode,
    default_partitions: usize,
    n_rows: u64,
) -> Result<LaunchOutcome> {
    let identities: Vec<Value> = bind
        .global_reduces
        .iter()
        .map(|(_, op, ty)| op.identity(ty))
        .collect::<Result<Vec<_>>>()?;

    let sequential = matches!(mode, ExecMode::Sequential)
        || insert.is_some()
        || matches!(bind.domain, Domain::Index { .. });

    let chunks = if sequential {
        vec![(0, n_rows)]
    } else {
        let parts = match mode {
            ExecMode::Parallel { partitions } => partitions.unwrap_or(default_partitions),
            ExecMode::Sequential => 1,
        };
        chunk_ranges(n_rows, parts)
    };

    let write_chunks = split_write_cols(&mut writes.cols, &chunks);
    let reduce_chunks = split_reduce_cols(&mut writes.reduce_cols, &chunks);

    let outs: Vec<ChunkOut> = if sequential {
        let mut outs = Vec::with_capacity(chunks.len());
        for ((chunk, ws), rs) in chunks.iter().zip(write_chunks).zip(reduce_chunks) {
            outs.push(run_chunk(
                exec,
                bind,
                *chunk,
                ws,
                rs,
                &identities,
                insert.as_deref_mut(),
            )?);
        }
        outs
    } else {
        chunks
            .par_iter()
            .zip(write_chunks.into_par_iter().zip(reduce_chunks))
            .map(|(chunk, (ws, rs))| run_chunk(exec, bind, *chunk, ws, rs, &identities, None))
            .collect::<Result<Vec<_>>>()?
    };

    Ok(merge_outs(bind, identities, outs))
}

pub(crate) fn merge_outs(
    bind: &BindData,
    identities: Vec<Value>,
    outs: Vec<ChunkOut>,
) -> LaunchOutcome {
    let mut totals = identities;
    let mut deleted = 0;
    let mut rows = 0;
    for out in outs {
        for (i, (_, op, _)) in bind.global_reduces.iter().enumerate() {
            totals[i] = op.apply(&totals[i], &out.acc[i]);
        }
        deleted += out.deleted;
        rows += out.rows;
    }
    LaunchOutcome { rows, global_totals: totals, deleted }
}
