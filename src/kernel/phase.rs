//! Phase analysis: per-field and per-global access classification.
//!
//! Walks a type-checked kernel and classifies every accessed field as
//! `ReadOnly`, `ReadWrite` (centered), or `Reduce(op)`, and every accessed
//! global as read or reduced. The combinations that cannot be scheduled
//! safely are rejected here:
//!
//! - a field that is uncentered-read and written (non-reduce) in one kernel,
//! - a field or global mixing a reduction with direct reads/writes,
//! - two different reduction ops on the same field or global.
//!
//! The resulting [`PhaseReport`] is what drives argument-layout
//! construction, data binding, and the distributed signal discipline.

use crate::error::phase_err;
use crate::ids::{GlobalId, RelationId};
use crate::kernel::ast::{Expr, FieldRef, Key, KernelDef, Stmt};
use crate::layout::Privilege;
use crate::reduce::ReduceOp;
use crate::store::Store;
use anyhow::Result;

#[derive(Clone, Debug, Default)]
struct FieldUse {
    reads_centered: bool,
    reads_uncentered: bool,
    writes: bool,
    reduce: Option<ReduceOp>,
    reduce_uncentered: bool,
}

/// One classified field access.
#[derive(Clone, Debug)]
pub struct FieldAccess {
    pub field: FieldRef,
    pub privilege: Privilege,
    pub uncentered_read: bool,
    /// A reduce privilege applied through a non-centered key (forces
    /// sequential execution on the CPU engine).
    pub uncentered_reduce: bool,
}

/// One classified global access.
#[derive(Clone, Debug)]
pub struct GlobalAccess {
    pub global: GlobalId,
    pub reduce: Option<ReduceOp>,
}

/// A query loop over a grouped relation, with the aux columns it touches.
#[derive(Clone, Debug)]
pub struct QueryUse {
    pub relation: RelationId,
    pub offset: FieldRef,
    pub length: FieldRef,
}

/// The phase report for one kernel: everything the layout and the scheduler
/// need to know about its accesses.
#[derive(Clone, Debug, Default)]
pub struct PhaseReport {
    pub fields: Vec<FieldAccess>,
    pub globals: Vec<GlobalAccess>,
    pub queries: Vec<QueryUse>,
    pub insert_target: Option<RelationId>,
    pub deletes: bool,
}

impl PhaseReport {
    /// True if the CPU engine must run this kernel on a single chunk:
    /// inserting kernels claim rows through a shared write index, and
    /// scattered field reductions write outside the centered chunk.
    pub fn requires_sequential(&self) -> bool {
        self.insert_target.is_some() || self.fields.iter().any(|f| f.uncentered_reduce)
    }
}

struct Walk {
    uses: Vec<(FieldRef, FieldUse)>,
    globals: Vec<(GlobalId, bool, Option<ReduceOp>)>,
    queries: Vec<QueryUse>,
    insert_target: Option<RelationId>,
    deletes: bool,
}

impl Walk {
    fn field_use(&mut self, f: FieldRef) -> &mut FieldUse {
        if let Some(i) = self.uses.iter().position(|(r, _)| *r == f) {
            &mut self.uses[i].1
        } else {
            self.uses.push((f, FieldUse::default()));
            &mut self.uses.last_mut().unwrap().1
        }
    }

    fn global_use(&mut self, g: GlobalId) -> &mut (GlobalId, bool, Option<ReduceOp>) {
        if let Some(i) = self.globals.iter().position(|(id, _, _)| *id == g) {
            &mut self.globals[i]
        } else {
            self.globals.push((g, false, None));
            self.globals.last_mut().unwrap()
        }
    }
}

/// Produce the phase report for a type-checked kernel.
pub(crate) fn analyze(store: &Store, def: &KernelDef) -> Result<PhaseReport> {
    let mut w = Walk {
        uses: Vec::new(),
        globals: Vec::new(),
        queries: Vec::new(),
        insert_target: None,
        deletes: false,
    };
    walk_stmts(store, &mut w, &def.body)?;

    let mut report = PhaseReport::default();
    for (fref, u) in &w.uses {
        let name = store.with_relation(fref.relation, |r| r.fields[fref.field.index()].name.clone());
        let privilege = match u.reduce {
            Some(op) => {
                if u.reads_centered || u.reads_uncentered || u.writes {
                    return phase_err(format!(
                        "field `{name}` mixes a reduction with direct access"
                    ));
                }
                Privilege::Reduce(op)
            }
            None if u.writes => {
                if u.reads_uncentered {
                    return phase_err(format!(
                        "field `{name}` is uncentered-read and written by the same kernel"
                    ));
                }
                Privilege::ReadWrite
            }
            None => Privilege::ReadOnly,
        };
        report.fields.push(FieldAccess {
            field: *fref,
            privilege,
            uncentered_read: u.reads_uncentered,
            uncentered_reduce: u.reduce_uncentered,
        });
    }
    for (g, read, reduce) in &w.globals {
        if *read && reduce.is_some() {
            let name = store.with_inner(|inner| inner.globals[g.index()].name.clone());
            return phase_err(format!("global `{name}` is read and reduced by the same kernel"));
        }
        report.globals.push(GlobalAccess { global: *g, reduce: *reduce });
    }
    report.queries = w.queries;
    report.insert_target = w.insert_target;
    report.deletes = w.deletes;

    // the insert target's columns are claimed wholesale by the write-index
    // protocol; no other access to them can be scheduled in the same kernel,
    // and a kernel cannot insert into the relation it is mapped over
    if let Some(target) = report.insert_target {
        if target == def.relation {
            return phase_err("kernel inserts into the relation it is mapped over");
        }
        if report.fields.iter().any(|f| f.field.relation == target) {
            return phase_err(
                "kernel both inserts into and accesses fields of the target relation",
            );
        }
    }
    Ok(report)
}

fn record_read(w: &mut Walk, f: FieldRef, key: &Key) {
    let centered = matches!(key, Key::Centered);
    let u = w.field_use(f);
    if centered {
        u.reads_centered = true;
    } else {
        u.reads_uncentered = true;
    }
}

fn walk_expr(store: &Store, w: &mut Walk, e: &Expr) -> Result<()> {
    match e {
        Expr::Const(_) | Expr::Local(_) | Expr::RowIndex | Expr::InBounds(_) => Ok(()),
        Expr::ReadGlobal(g) => {
            w.global_use(*g).1 = true;
            Ok(())
        }
        Expr::ReadField { field, key } => {
            record_read(w, *field, key);
            if let Key::Expr(inner) = key {
                walk_expr(store, w, inner)?;
            }
            Ok(())
        }
        Expr::Unary(_, a) => walk_expr(store, w, a),
        Expr::Binary(_, a, b) => {
            walk_expr(store, w, a)?;
            walk_expr(store, w, b)
        }
        Expr::Select { cond, then_e, else_e } => {
            walk_expr(store, w, cond)?;
            walk_expr(store, w, then_e)?;
            walk_expr(store, w, else_e)
        }
        Expr::VecCons(lanes) => {
            for lane in lanes {
                walk_expr(store, w, lane)?;
            }
            Ok(())
        }
        Expr::Index { base, .. } => walk_expr(store, w, base),
        Expr::Cast(_, a) => walk_expr(store, w, a),
    }
}

fn walk_stmts(store: &Store, w: &mut Walk, stmts: &[Stmt]) -> Result<()> {
    for s in stmts {
        walk_stmt(store, w, s)?;
    }
    Ok(())
}

fn walk_stmt(store: &Store, w: &mut Walk, s: &Stmt) -> Result<()> {
    match s {
        Stmt::Let { value, .. } => walk_expr(store, w, value),
        Stmt::Assign { field, value } => {
            walk_expr(store, w, value)?;
            w.field_use(*field).writes = true;
            Ok(())
        }
        Stmt::ReduceField { field, key, op, value } => {
            walk_expr(store, w, value)?;
            if let Key::Expr(inner) = key {
                walk_expr(store, w, inner)?;
            }
            let u = w.field_use(*field);
            if let Some(prev) = u.reduce
                && prev != *op
            {
                return phase_err("field reduced with two different ops");
            }
            u.reduce = Some(*op);
            if !matches!(key, Key::Centered) {
                u.reduce_uncentered = true;
            }
            Ok(())
        }
        Stmt::ReduceGlobal { global, op, value } => {
            walk_expr(store, w, value)?;
            let g = w.global_use(*global);
            if let Some(prev) = g.2
                && prev != *op
            {
                return phase_err("global reduced with two different ops");
            }
            g.2 = Some(*op);
            Ok(())
        }
        Stmt::If { cond, then_s, else_s } => {
            walk_expr(store, w, cond)?;
            walk_stmts(store, w, then_s)?;
            walk_stmts(store, w, else_s)
        }
        Stmt::ForQuery { relation, body, .. } => {
            if !w.queries.iter().any(|q| q.relation == *relation) {
                let (offset, length, source) = store.with_relation(*relation, |r| {
                    let g = r.grouping.as_ref().expect("type checker admitted the query");
                    (g.offset_field, g.length_field, g.source)
                });
                w.queries.push(QueryUse {
                    relation: *relation,
                    offset: FieldRef { relation: source, field: offset },
                    length: FieldRef { relation: source, field: length },
                });
            }
            walk_stmts(store, w, body)
        }
        Stmt::Insert { relation, values } => {
            if let Some(prev) = w.insert_target
                && prev != *relation
            {
                return phase_err("kernel inserts into two different relations");
            }
            w.insert_target = Some(*relation);
            for (_, e) in values {
                walk_expr(store, w, e)?;
            }
            Ok(())
        }
        Stmt::Delete => {
            w.deletes = true;
            Ok(())
        }
    }
}
