//! Kernel type checking.
//!
//! Runs once at compile, before phase analysis. Widening (`i32 → u64/f32/f64`,
//! `f32 → f64`, element-wise over identical shapes) is the only implicit
//! conversion; every other assignment or operand mix is rejected here, so
//! the executor never sees an ill-typed tree.

use crate::error::phase_err;
use crate::ids::RelationId;
use crate::kernel::ast::{BinOp, Expr, Key, KernelDef, Stmt, UnOp};
use crate::relation::RelationMode;
use crate::store::Store;
use crate::types::{EbbType, ScalarKind, Value};
use anyhow::Result;
use std::collections::HashMap;

pub(crate) struct TypeEnv<'a> {
    store: &'a Store,
    launch: RelationId,
    launch_mode: RelationMode,
    grid_dims: usize,
    locals: HashMap<String, EbbType>,
}

/// Check a kernel definition against the current schema.
pub(crate) fn check_kernel(store: &Store, def: &KernelDef) -> Result<()> {
    let (launch_mode, grid_dims) = store.with_relation(def.relation, |r| (r.mode, r.dims.len()));
    let mut env = TypeEnv {
        store,
        launch: def.relation,
        launch_mode,
        grid_dims,
        locals: HashMap::new(),
    };
    check_stmts(&mut env, &def.body)
}

fn value_type(v: &Value) -> Result<EbbType> {
    match v {
        Value::Bool(_) => Ok(EbbType::scalar(ScalarKind::Bool)),
        Value::I32(_) => Ok(EbbType::scalar(ScalarKind::I32)),
        Value::U64(_) => Ok(EbbType::scalar(ScalarKind::U64)),
        Value::F32(_) => Ok(EbbType::scalar(ScalarKind::F32)),
        Value::F64(_) => Ok(EbbType::scalar(ScalarKind::F64)),
        Value::Vector(elems) => {
            let kind = elems
                .first()
                .and_then(Value::scalar_kind)
                .ok_or_else(|| crate::error::Error::Phase("empty vector literal".into()))?;
            if elems.iter().any(|e| e.scalar_kind() != Some(kind)) {
                return phase_err("vector literal mixes scalar kinds");
            }
            Ok(EbbType::vector(kind, elems.len()))
        }
        Value::Matrix { rows, cols, elems } => {
            let kind = elems
                .first()
                .and_then(Value::scalar_kind)
                .ok_or_else(|| crate::error::Error::Phase("empty matrix literal".into()))?;
            Ok(EbbType::matrix(kind, *rows, *cols))
        }
        Value::Key(_) => phase_err("key literals are not allowed in kernels"),
    }
}

fn unify(a: &EbbType, b: &EbbType) -> Option<EbbType> {
    if a == b {
        Some(a.clone())
    } else if a.widens_to(b) {
        Some(b.clone())
    } else if b.widens_to(a) {
        Some(a.clone())
    } else {
        None
    }
}

fn numeric(ty: &EbbType) -> bool {
    ty.elem_kind().is_some_and(ScalarKind::is_numeric)
}

pub(crate) fn check_expr(env: &mut TypeEnv, e: &Expr) -> Result<EbbType> {
    match e {
        Expr::Const(v) => value_type(v),
        Expr::Local(name) => env
            .locals
            .get(name)
            .cloned()
            .ok_or_else(|| crate::error::Error::Phase(format!("unknown local `{name}`")).into()),
        Expr::RowIndex => Ok(EbbType::scalar(ScalarKind::U64)),
        Expr::ReadGlobal(g) => Ok(env.store.global_type(*g)),
        Expr::ReadField { field, key } => {
            let ty = env
                .store
                .with_relation(field.relation, |r| r.fields[field.field.index()].ty.clone());
            check_key(env, field.relation, key)?;
            Ok(ty)
        }
        Expr::Unary(UnOp::Neg, inner) => {
            let t = check_expr(env, inner)?;
            if !numeric(&t) {
                return phase_err(format!("negation of non-numeric {t:?}"));
            }
            Ok(t)
        }
        Expr::Unary(UnOp::Not, inner) => {
            let t = check_expr(env, inner)?;
            if t != EbbType::scalar(ScalarKind::Bool) {
                return phase_err(format!("`not` applied to {t:?}"));
            }
            Ok(t)
        }
        Expr::Binary(op, a, b) => {
            let ta = check_expr(env, a)?;
            let tb = check_expr(env, b)?;
            match op {
                BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => {
                    let t = unify(&ta, &tb).ok_or_else(|| {
                        crate::error::Error::Phase(format!("cannot combine {ta:?} and {tb:?}"))
                    })?;
                    if !numeric(&t) {
                        return phase_err(format!("arithmetic on non-numeric {t:?}"));
                    }
                    Ok(t)
                }
                BinOp::Mod => {
                    let t = unify(&ta, &tb).ok_or_else(|| {
                        crate::error::Error::Phase(format!("cannot combine {ta:?} and {tb:?}"))
                    })?;
                    match t {
                        EbbType::Scalar(ScalarKind::I32) | EbbType::Scalar(ScalarKind::U64) => {
                            Ok(t)
                        }
                        _ => phase_err(format!("`%` needs integer scalars, got {t:?}")),
                    }
                }
                BinOp::Eq | BinOp::Ne => {
                    unify(&ta, &tb).ok_or_else(|| {
                        crate::error::Error::Phase(format!("cannot compare {ta:?} and {tb:?}"))
                    })?;
                    Ok(EbbType::scalar(ScalarKind::Bool))
                }
                BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                    let t = unify(&ta, &tb).ok_or_else(|| {
                        crate::error::Error::Phase(format!("cannot compare {ta:?} and {tb:?}"))
                    })?;
                    if !matches!(t, EbbType::Scalar(k) if k.is_numeric()) {
                        return phase_err(format!("ordering needs numeric scalars, got {t:?}"));
                    }
                    Ok(EbbType::scalar(ScalarKind::Bool))
                }
                BinOp::And | BinOp::Or => {
                    let boolean = EbbType::scalar(ScalarKind::Bool);
                    if ta != boolean || tb != boolean {
                        return phase_err(format!("logic op on {ta:?} and {tb:?}"));
                    }
                    Ok(boolean)
                }
            }
        }
        Expr::Select { cond, then_e, else_e } => {
            let tc = check_expr(env, cond)?;
            if tc != EbbType::scalar(ScalarKind::Bool) {
                return phase_err(format!("select condition is {tc:?}, not bool"));
            }
            let ta = check_expr(env, then_e)?;
            let tb = check_expr(env, else_e)?;
            unify(&ta, &tb).ok_or_else(|| {
                crate::error::Error::Phase(format!("select arms differ: {ta:?} vs {tb:?}")).into()
            })
        }
        Expr::VecCons(lanes) => {
            if lanes.is_empty() {
                return phase_err("empty vector constructor");
            }
            let mut kind: Option<ScalarKind> = None;
            for lane in lanes {
                let t = check_expr(env, lane)?;
                let k = match t {
                    EbbType::Scalar(k) if k.is_numeric() => k,
                    _ => return phase_err(format!("vector lane is {t:?}")),
                };
                kind = Some(match kind {
                    None => k,
                    Some(prev) => {
                        if prev == k {
                            prev
                        } else if prev.widens_to(k) {
                            k
                        } else if k.widens_to(prev) {
                            prev
                        } else {
                            return phase_err("vector lanes mix incompatible kinds");
                        }
                    }
                });
            }
            Ok(EbbType::vector(kind.unwrap(), lanes.len()))
        }
        Expr::Index { base, lane } => {
            let t = check_expr(env, base)?;
            match t {
                EbbType::Vector { elem, len } => {
                    if *lane >= len {
                        return phase_err(format!("lane {lane} out of range for {len}-vector"));
                    }
                    Ok(EbbType::scalar(elem))
                }
                _ => phase_err(format!("lane extraction on non-vector {t:?}")),
            }
        }
        Expr::Cast(kind, inner) => {
            let t = check_expr(env, inner)?;
            if !matches!(t, EbbType::Scalar(k) if k.is_numeric()) || !kind.is_numeric() {
                return phase_err(format!("cast from {t:?} to {kind:?}"));
            }
            Ok(EbbType::scalar(*kind))
        }
        Expr::InBounds(offset) => {
            check_grid_offset(env, offset)?;
            Ok(EbbType::scalar(ScalarKind::Bool))
        }
    }
}

fn check_grid_offset(env: &TypeEnv, offset: &[i64]) -> Result<()> {
    if env.launch_mode != RelationMode::Grid {
        return phase_err("grid offsets require a grid launch relation");
    }
    if offset.len() != env.grid_dims {
        return phase_err(format!(
            "offset has {} axes, grid has {}",
            offset.len(),
            env.grid_dims
        ));
    }
    Ok(())
}

fn check_key(env: &mut TypeEnv, owner: RelationId, key: &Key) -> Result<()> {
    match key {
        Key::Centered => {
            if owner != env.launch {
                return phase_err("centered access to a field of another relation");
            }
            Ok(())
        }
        Key::Offset(offset) => {
            if owner != env.launch {
                return phase_err("offset access to a field of another relation");
            }
            check_grid_offset(env, offset)
        }
        Key::Expr(e) => {
            let t = check_expr(env, e)?;
            match t {
                EbbType::Key { relation, .. } if relation == owner => Ok(()),
                _ => phase_err(format!(
                    "key expression has type {t:?}, expected a key into the field's relation"
                )),
            }
        }
    }
}

fn check_stmts(env: &mut TypeEnv, stmts: &[Stmt]) -> Result<()> {
    for s in stmts {
        check_stmt(env, s)?;
    }
    Ok(())
}

fn check_stmt(env: &mut TypeEnv, s: &Stmt) -> Result<()> {
    match s {
        Stmt::Let { name, value } => {
            let t = check_expr(env, value)?;
            env.locals.insert(name.clone(), t);
            Ok(())
        }
        Stmt::Assign { field, value } => {
            if field.relation != env.launch {
                return phase_err("assignment to a field of another relation");
            }
            let field_ty = env
                .store
                .with_relation(field.relation, |r| r.fields[field.field.index()].ty.clone());
            let t = check_expr(env, value)?;
            if !t.widens_to(&field_ty) {
                return phase_err(format!(
                    "cannot assign {t:?} into a field of type {field_ty:?}"
                ));
            }
            Ok(())
        }
        Stmt::ReduceField { field, key, op, value } => {
            let field_ty = env
                .store
                .with_relation(field.relation, |r| r.fields[field.field.index()].ty.clone());
            if !op.supports(&field_ty) {
                return phase_err(format!("reduction {op:?} unsupported for {field_ty:?}"));
            }
            check_key(env, field.relation, key)?;
            let t = check_expr(env, value)?;
            if !t.widens_to(&field_ty) {
                return phase_err(format!(
                    "cannot reduce {t:?} into a field of type {field_ty:?}"
                ));
            }
            Ok(())
        }
        Stmt::ReduceGlobal { global, op, value } => {
            let gty = env.store.global_type(*global);
            if !op.supports(&gty) {
                return phase_err(format!("reduction {op:?} unsupported for {gty:?}"));
            }
            let t = check_expr(env, value)?;
            if !t.widens_to(&gty) {
                return phase_err(format!(
                    "cannot reduce {t:?} into a global of type {gty:?}"
                ));
            }
            Ok(())
        }
        Stmt::If { cond, then_s, else_s } => {
            let tc = check_expr(env, cond)?;
            if tc != EbbType::scalar(ScalarKind::Bool) {
                return phase_err(format!("if condition is {tc:?}, not bool"));
            }
            // branch-local bindings do not escape
            let saved = env.locals.clone();
            check_stmts(env, then_s)?;
            env.locals = saved.clone();
            check_stmts(env, else_s)?;
            env.locals = saved;
            Ok(())
        }
        Stmt::ForQuery { var, relation, body } => {
            let grouped_source = env.store.with_relation(*relation, |r| {
                r.grouping.as_ref().map(|g| g.source)
            });
            match grouped_source {
                Some(src) if src == env.launch => {}
                Some(_) => {
                    return phase_err("query loop over a relation grouped by a different key");
                }
                None => return phase_err("query loop over an ungrouped relation"),
            }
            let saved = env.locals.clone();
            env.locals
                .insert(var.clone(), EbbType::Key { relation: *relation, lanes: 1 });
            check_stmts(env, body)?;
            env.locals = saved;
            Ok(())
        }
        Stmt::Insert { relation, values } => {
            let (mode, signature) = env
                .store
                .with_relation(*relation, |r| (r.mode, r.structural_signature()));
            if mode != RelationMode::Elastic {
                return phase_err("insert into a non-elastic relation");
            }
            // The record must match the structural type exactly: every
            // visible field present, every value type equal, no widening.
            if values.len() != signature.len() {
                return phase_err(format!(
                    "insert record has {} fields, relation has {}",
                    values.len(),
                    signature.len()
                ));
            }
            for (name, expr) in values {
                let Some((_, fty)) = signature.iter().find(|(n, _)| n == name) else {
                    return phase_err(format!("insert names unknown field `{name}`"));
                };
                let t = check_expr(env, expr)?;
                if t != *fty {
                    return phase_err(format!(
                        "insert field `{name}`: {t:?} does not match {fty:?} exactly"
                    ));
                }
            }
            Ok(())
        }
        Stmt::Delete => {
            if env.launch_mode != RelationMode::Elastic {
                return phase_err("delete from a non-elastic relation");
            }
            Ok(())
        }
    }
}
