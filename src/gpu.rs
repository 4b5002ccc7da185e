//! The device engine: block-structured launches and the two-pass tree
//! reduction.
//!
//! Real PTX emission is an external collaborator; this layer is a
//! deterministic in-process executor that preserves the device execution
//! shape exactly, so reduction-ordering semantics are testable:
//!
//! - a primary pass of `M = ceil(N/B)` blocks of `B` threads (blocks run
//!   rayon-parallel), each block reducing its threads' contributions through
//!   identity-initialized shared slots and a stride-halving tree, thread 0
//!   writing `scratch[block]`;
//! - a secondary pass of exactly one block striding over `scratch[0..M)`
//!   and tree-reducing to the final total, which the caller combines into
//!   the live global with the op once more (pre-existing values survive).
//!
//! `M < B` needs no special case: untouched shared slots hold the identity.
//! Scratch lives in plain vectors, so it is released even when
//! post-processing aborts early.
//!
//! Kernels that claim rows through a shared write index (inserts) or
//! scatter field reductions keep the block/tree shape but stride their
//! blocks on one worker.

use crate::kernel::ast::{Expr, Key, KernelDef, Stmt};
use crate::kernel::exec::{
    BindData, CompiledKernel, Domain, InsertBind, LaunchOutcome, ReduceSlice, RowCtx, WriteCols,
    WriteSlice, row_live, split_reduce_cols, split_write_cols,
};
use crate::reduce::ReduceOp;
use crate::types::Value;
use anyhow::Result;
use rayon::prelude::*;

/// In-block tree reduction over per-thread shared slots: for
/// `step = B/2, B/4, …, 1`, slot `tid < step` absorbs slot `tid + step`,
/// with a barrier between steps (implicit in this sequential emulation).
pub(crate) fn tree_reduce(shared: &mut [Vec<Value>], ops: &[ReduceOp]) {
    let b = shared.len();
    let mut step = b / 2;
    while step >= 1 {
        for tid in 0..step {
            for (g, op) in ops.iter().enumerate() {
                let v = op.apply(&shared[tid][g], &shared[tid + step][g]);
                shared[tid][g] = v;
            }
        }
        step /= 2;
    }
}

/// The secondary kernel: one block of `block` threads strides over the
/// per-block scratch array and tree-reduces it to one total per global.
pub(crate) fn secondary_pass(
    scratch: &[Vec<Value>],
    identities: &[Value],
    ops: &[ReduceOp],
    block: usize,
) -> Vec<Value> {
    let m = scratch.len();
    let mut shared: Vec<Vec<Value>> = (0..block).map(|_| identities.to_vec()).collect();
    for (tid, slot) in shared.iter_mut().enumerate() {
        // gridDim is 1, so the stride is exactly the block width
        let mut gt = tid;
        while gt < m {
            for (g, op) in ops.iter().enumerate() {
                slot[g] = op.apply(&slot[g], &scratch[gt][g]);
            }
            gt += block;
        }
    }
    tree_reduce(&mut shared, ops);
    shared.swap_remove(0)
}

/// Block-sized tiles of `[0, n)`.
fn block_tiles(n: u64, block: u64) -> Vec<(u64, u64)> {
    if n == 0 {
        return vec![(0, 0)];
    }
    let mut out = Vec::with_capacity(n.div_ceil(block) as usize);
    let mut start = 0;
    while start < n {
        out.push((start, (start + block).min(n)));
        start += block;
    }
    out
}

struct BlockOut {
    scratch: Vec<Value>,
    deleted: u64,
    rows: u64,
}

fn run_block(
    exec: &dyn CompiledKernel,
    bind: &BindData,
    chunk: (u64, u64),
    write_slices: Vec<WriteSlice<'_>>,
    reduce_slices: Vec<ReduceSlice<'_>>,
    identities: &[Value],
    ops: &[ReduceOp],
    block: usize,
) -> Result<BlockOut> {
    let mut shared: Vec<Vec<Value>> = (0..block).map(|_| identities.to_vec()).collect();
    let mut ctx = RowCtx {
        bind,
        chunk_start: chunk.0,
        chunk_end: chunk.1,
        write_slices,
        reduce_slices,
        global_acc: identities.to_vec(),
        deleted: 0,
        insert: None,
    };
    let mut rows = 0u64;
    for (tid, slot) in shared.iter_mut().enumerate() {
        let row = chunk.0 + tid as u64;
        if row >= chunk.1 {
            continue;
        }
        let admitted = match &bind.domain {
            Domain::Range { .. } => true,
            Domain::Mask { mask } => mask[row as usize],
            Domain::Index { .. } => unreachable!("index launches use the strided path"),
        };
        if admitted && row_live(&ctx, row)? {
            // the thread accumulates its contributions into shared[tid]
            std::mem::swap(&mut ctx.global_acc, slot);
            let res = exec.exec_row(row, &mut ctx);
            std::mem::swap(&mut ctx.global_acc, slot);
            res?;
            rows += 1;
        }
    }
    tree_reduce(&mut shared, ops);
    Ok(BlockOut { scratch: shared.swap_remove(0), deleted: ctx.deleted, rows })
}

#[allow(clippy::too_many_arguments)]
fn run_strided(
    exec: &dyn CompiledKernel,
    bind: &BindData,
    writes: &mut WriteCols,
    insert: Option<&mut InsertBind>,
    block: usize,
    n_rows: u64,
    identities: &[Value],
    ops: &[ReduceOp],
    candidates: &[u64],
) -> Result<(Vec<Vec<Value>>, u64, u64)> {
    let chunks = vec![(0, n_rows)];
    let mut wc = split_write_cols(&mut writes.cols, &chunks);
    let mut rc = split_reduce_cols(&mut writes.reduce_cols, &chunks);
    let mut ctx = RowCtx {
        bind,
        chunk_start: 0,
        chunk_end: n_rows,
        write_slices: wc.remove(0),
        reduce_slices: rc.remove(0),
        global_acc: identities.to_vec(),
        deleted: 0,
        insert,
    };
    let mut scratch = Vec::with_capacity(candidates.len().div_ceil(block.max(1)));
    let mut rows = 0u64;
    let mut pos = 0usize;
    while pos < candidates.len() {
        let mut shared: Vec<Vec<Value>> = (0..block).map(|_| identities.to_vec()).collect();
        for (tid, slot) in shared.iter_mut().enumerate() {
            let Some(&row) = candidates.get(pos + tid) else { break };
            if row_live(&ctx, row)? {
                std::mem::swap(&mut ctx.global_acc, slot);
                let res = exec.exec_row(row, &mut ctx);
                std::mem::swap(&mut ctx.global_acc, slot);
                res?;
                rows += 1;
            }
        }
        tree_reduce(&mut shared, ops);
        scratch.push(shared.swap_remove(0));
        pos += block;
    }
    Ok((scratch, ctx.deleted, rows))
}

/// The device launch engine. `block` is the configured block size (a power
/// of two); `n_rows` is the width of the write columns. `force_strided`
/// routes inserting / scatter-reducing kernels onto the single-worker
/// strided path.
pub(crate) fn run_device(
    exec: &dyn CompiledKernel,
    bind: &BindData,
    writes: &mut WriteCols,
    insert: Option<&mut InsertBind>,
    block: usize,
    n_rows: u64,
    force_strided: bool,
) -> Result<LaunchOutcome> {
    let identities: Vec<Value> = bind
        .global_reduces
        .iter()
        .map(|(_, op, ty)| op.identity(ty))
        .collect::<Result<Vec<_>>>()?;
    let ops: Vec<ReduceOp> = bind.global_reduces.iter().map(|(_, op, _)| *op).collect();

    let strided =
        force_strided || insert.is_some() || matches!(bind.domain, Domain::Index { .. });

    // scratch is allocated before the primary pass and dropped after the
    // secondary pass, error paths included
    let (scratch, deleted, rows) = if strided {
        let candidates: Vec<u64> = match &bind.domain {
            Domain::Range { n } => (0..*n).collect(),
            Domain::Mask { mask } => (0..mask.len() as u64)
                .filter(|r| mask[*r as usize])
                .collect(),
            Domain::Index { rows } => rows.as_ref().clone(),
        };
        run_strided(exec, bind, writes, insert, block, n_rows, &identities, &ops, &candidates)?
    } else {
        let chunks = block_tiles(n_rows, block as u64);
        let write_chunks = split_write_cols(&mut writes.cols, &chunks);
        let reduce_chunks = split_reduce_cols(&mut writes.reduce_cols, &chunks);
        let outs: Vec<BlockOut> = chunks
            .par_iter()
            .zip(write_chunks.into_par_iter().zip(reduce_chunks))
            .map(|(chunk, (ws, rs))| {
                run_block(exec, bind, *chunk, ws, rs, &identities, &ops, block)
            })
            .collect::<Result<Vec<_>>>()?;
        let mut scratch = Vec::with_capacity(outs.len());
        let mut deleted = 0;
        let mut rows = 0;
        for out in outs {
            scratch.push(out.scratch);
            deleted += out.deleted;
            rows += out.rows;
        }
        (scratch, deleted, rows)
    };

    let global_totals = if ops.is_empty() {
        Vec::new()
    } else {
        secondary_pass(&scratch, &identities, &ops, block)
    };

    Ok(LaunchOutcome { rows, global_totals, deleted })
}

/// Pretty-print the lowered device form of a kernel (written to stderr when
/// the dev dump toggle is set).
pub(crate) fn lowered_dump(def: &KernelDef) -> String {
    let mut out = String::new();
    out.push_str(&format!(".kernel {} (relation {})\n", def.name, def.relation.raw()));
    for s in &def.body {
        dump_stmt(&mut out, s, 1);
    }
    out
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str("  ");
    }
}

fn dump_stmt(out: &mut String, s: &Stmt, depth: usize) {
    indent(out, depth);
    match s {
        Stmt::Let { name, value } => {
            out.push_str(&format!("let {name} = {}\n", dump_expr(value)));
        }
        Stmt::Assign { field, value } => {
            out.push_str(&format!(
                "st.field f{} <- {}\n",
                field.field.raw(),
                dump_expr(value)
            ));
        }
        Stmt::ReduceField { field, op, value, .. } => {
            out.push_str(&format!(
                "red.field f{} {op:?} {}\n",
                field.field.raw(),
                dump_expr(value)
            ));
        }
        Stmt::ReduceGlobal { global, op, value } => {
            out.push_str(&format!(
                "red.global g{} {op:?} {}\n",
                global.raw(),
                dump_expr(value)
            ));
        }
        Stmt::If { cond, then_s, else_s } => {
            out.push_str(&format!("if {} {{\n", dump_expr(cond)));
            for s in then_s {
                dump_stmt(out, s, depth + 1);
            }
            if !else_s.is_empty() {
                indent(out, depth);
                out.push_str("} else {\n");
                for s in else_s {
                    dump_stmt(out, s, depth + 1);
                }
            }
            indent(out, depth);
            out.push_str("}\n");
        }
        Stmt::ForQuery { var, relation, body } => {
            out.push_str(&format!("for {var} in query(r{}) {{\n", relation.raw()));
            for s in body {
                dump_stmt(out, s, depth + 1);
            }
            indent(out, depth);
            out.push_str("}\n");
        }
        Stmt::Insert { relation, values } => {
            let fields: Vec<String> = values.iter().map(|(n, _)| n.clone()).collect();
            out.push_str(&format!(
                "insert r{} {{{}}}\n",
                relation.raw(),
                fields.join(", ")
            ));
        }
        Stmt::Delete => out.push_str("delete\n"),
    }
}

fn dump_expr(e: &Expr) -> String {
    match e {
        Expr::Const(v) => format!("{v:?}"),
        Expr::Local(n) => n.clone(),
        Expr::RowIndex => "row".into(),
        Expr::ReadGlobal(g) => format!("ld.global g{}", g.raw()),
        Expr::ReadField { field, key } => {
            let k = match key {
                Key::Centered => "@".to_string(),
                Key::Offset(o) => format!("@{o:?}"),
                Key::Expr(e) => format!("[{}]", dump_expr(e)),
            };
            format!("ld.field f{}{k}", field.field.raw())
        }
        Expr::Unary(op, a) => format!("({op:?} {})", dump_expr(a)),
        Expr::Binary(op, a, b) => format!("({} {op:?} {})", dump_expr(a), dump_expr(b)),
        Expr::Select { cond, then_e, else_e } => format!(
            "sel({}, {}, {})",
            dump_expr(cond),
            dump_expr(then_e),
            dump_expr(else_e)
        ),
        Expr::VecCons(lanes) => {
            let l: Vec<String> = lanes.iter().map(dump_expr).collect();
            format!("vec({})", l.join(", "))
        }
        Expr::Index { base, lane } => format!("{}[{lane}]", dump_expr(base)),
        Expr::Cast(kind, a) => format!("cvt.{kind:?}({})", dump_expr(a)),
        Expr::InBounds(o) => format!("inbounds{o:?}"),
    }
}
