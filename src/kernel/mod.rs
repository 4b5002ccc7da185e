//! Kernels and their compiled versions — the execution state machine.
//!
//! A *version* is a (kernel, processor, subset-shape) triple: CPU vs device
//! and boolmask- vs index-subset launches each get their own compiled
//! version of the same source kernel. Each version proceeds
//!
//! ```text
//! declared --compile()--> compiled --dynamic_checks()--> ready --launch()--> launched
//!                ^                                                     |
//!                '------------- re-compile on schema change -----------'
//! ```
//!
//! `compile` type-checks the AST, runs phase analysis, builds the argument
//! layout (registering every accessed field with its privilege, declaring
//! insert/delete intent, and extending the layout with scratch entries for
//! device global reductions), and emits the executable through the code
//! generator seam. `dynamic_checks` runs at every execute: field residency,
//! elastic record shape, subset shape. `bind` snapshots column data and
//! resolves bounds; `launch` drives the chunked CPU engine or the
//! block-shaped device engine; `post_launch` settles reductions, inserts,
//! and deletes.

pub mod ast;
pub(crate) mod exec;
pub mod phase;
mod typecheck;

pub use exec::ExecMode;
pub use phase::{FieldAccess, GlobalAccess, PhaseReport};

use crate::error::{phase_err, schema_err};
use crate::gpu;
use crate::ids::RelationId;
use crate::kernel::ast::{FieldRef, KernelDef};
use crate::kernel::exec::{
    AstExec, BindData, Domain, GridInfo, InsertBind, LiveGuard, QueryBind, WriteCols,
};
use crate::layout::{ArgLayout, Privilege};
use crate::relation::{RelationMode, Subset, SubsetKind, SubsetStorage};
use crate::store::{Processor, Store};
use crate::types::EbbType;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// The subset shape a version was compiled for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubsetShape {
    Full,
    BoolMask,
    Index,
}

/// Lifecycle state of one compiled version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionState {
    Declared,
    Compiled,
    Ready,
    Launched,
}

/// Options for one launch.
pub struct LaunchOpts<'a> {
    pub processor: Processor,
    pub subset: Option<&'a Subset>,
    pub mode: ExecMode,
}

impl Default for LaunchOpts<'_> {
    fn default() -> Self {
        Self {
            processor: Processor::Cpu,
            subset: None,
            mode: ExecMode::Parallel { partitions: None },
        }
    }
}

impl LaunchOpts<'_> {
    pub fn sequential() -> Self {
        Self { mode: ExecMode::Sequential, ..Self::default() }
    }

    pub fn gpu() -> Self {
        Self { processor: Processor::Gpu, ..Self::default() }
    }
}

/// What one launch did.
#[derive(Clone, Copy, Debug, Default)]
pub struct LaunchStats {
    /// Rows the kernel actually ran on (live, selected rows).
    pub rows: u64,
    pub inserted: u64,
    pub deleted: u64,
    /// True if the delete settled below half occupancy and auto-defrag ran.
    pub defragged: bool,
}

struct Version {
    state: VersionState,
    report: PhaseReport,
    layout: ArgLayout,
    exec: Arc<AstExec>,
    /// Schema generations of every relation the kernel touches, captured at
    /// compile.
    schema_gens: Vec<(RelationId, u64)>,
}

struct KernelInner {
    def: Arc<KernelDef>,
    versions: HashMap<(Processor, SubsetShape), Version>,
}

/// A user kernel, holding one compiled version per (processor, subset
/// shape) it has been launched with.
pub struct Kernel {
    inner: Arc<Mutex<KernelInner>>,
}

impl Clone for Kernel {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl Kernel {
    pub fn new(def: KernelDef) -> Self {
        Self {
            inner: Arc::new(Mutex::new(KernelInner {
                def: Arc::new(def),
                versions: HashMap::new(),
            })),
        }
    }

    pub fn name(&self) -> String {
        self.inner.lock().unwrap().def.name.clone()
    }

    /// The current state of a version. A (processor, shape) pair that has
    /// never compiled is still declared.
    pub fn version_state(&self, processor: Processor, shape: SubsetShape) -> VersionState {
        self.inner
            .lock()
            .unwrap()
            .versions
            .get(&(processor, shape))
            .map_or(VersionState::Declared, |v| v.state)
    }

    /// Launch on the CPU over the full relation with default scheduling.
    pub fn launch_default(&self, store: &Store) -> Result<LaunchStats> {
        self.launch(store, LaunchOpts::default())
    }

    /// Compile (if needed), check, bind, and execute this kernel.
    pub fn launch(&self, store: &Store, opts: LaunchOpts) -> Result<LaunchStats> {
        let mut inner = self.inner.lock().unwrap();
        let def = Arc::clone(&inner.def);

        let shape = match opts.subset {
            None => SubsetShape::Full,
            Some(s) => match s.kind() {
                SubsetKind::BoolMask => SubsetShape::BoolMask,
                SubsetKind::Index => SubsetShape::Index,
            },
        };

        // compile on first use of this (processor, shape) pair
        if !inner.versions.contains_key(&(opts.processor, shape)) {
            let v = compile(store, &def, opts.processor, shape)?;
            inner.versions.insert((opts.processor, shape), v);
        }

        // dynamic checks; a schema change sends the version back through
        // compile
        let gens_now = schema_gens(store, &inner.versions[&(opts.processor, shape)].report, &def);
        if gens_now != inner.versions[&(opts.processor, shape)].schema_gens {
            tracing::debug!(kernel = %def.name, "schema changed; recompiling");
            let v = compile(store, &def, opts.processor, shape)?;
            inner.versions.insert((opts.processor, shape), v);
        }
        let version = inner
            .versions
            .get_mut(&(opts.processor, shape))
            .expect("just inserted");
        dynamic_checks(store, version, &def, &opts, shape)?;
        version.state = VersionState::Ready;

        let stats = run_version(store, version, &def, &opts)?;
        version.state = VersionState::Launched;
        Ok(stats)
    }
}

fn compile(
    store: &Store,
    def: &Arc<KernelDef>,
    processor: Processor,
    shape: SubsetShape,
) -> Result<Version> {
    typecheck::check_kernel(store, def)?;
    let report = phase::analyze(store, def)?;

    // argument layout: bounds, optional index record, fields, globals,
    // device scratch
    let n_dims = store.with_relation(def.relation, |r| r.dims.len().max(1));
    let mut layout = ArgLayout::new(n_dims);
    for fa in &report.fields {
        layout.add_field(fa.field.relation, fa.field.field, fa.privilege, fa.uncentered_read)?;
    }
    for ga in &report.globals {
        layout.add_global(ga.global, ga.reduce)?;
    }
    if processor == Processor::Gpu {
        for ga in &report.globals {
            if ga.reduce.is_some() {
                layout.add_scratch(ga.global)?;
            }
        }
    }
    if let Some(target) = report.insert_target {
        layout.declare_insert(target)?;
    }
    if report.deletes {
        layout.declare_delete()?;
    }
    layout.finalize();

    if processor == Processor::Gpu && store.config().ptx_dump {
        eprintln!("{}", gpu::lowered_dump(def));
    }

    let exec = Arc::new(AstExec { def: Arc::clone(def) });
    let schema_gens = schema_gens(store, &report, def);
    tracing::debug!(kernel = %def.name, ?processor, ?shape, "compiled");
    Ok(Version { state: VersionState::Compiled, report, layout, exec, schema_gens })
}

/// Generations of every relation the kernel touches, in a stable order.
fn schema_gens(store: &Store, report: &PhaseReport, def: &KernelDef) -> Vec<(RelationId, u64)> {
    let mut rels = vec![def.relation];
    for fa in &report.fields {
        rels.push(fa.field.relation);
    }
    for q in &report.queries {
        rels.push(q.relation);
    }
    if let Some(t) = report.insert_target {
        rels.push(t);
    }
    rels.sort_by_key(|r| r.raw());
    rels.dedup();
    rels.into_iter()
        .map(|r| (r, store.with_relation(r, |d| d.generation)))
        .collect()
}

fn dynamic_checks(
    store: &Store,
    version: &Version,
    def: &KernelDef,
    opts: &LaunchOpts,
    shape: SubsetShape,
) -> Result<()> {
    // subset sanity and shape match
    if let Some(s) = opts.subset {
        if s.relation().id() != def.relation {
            return schema_err(format!(
                "kernel `{}` launched with a subset of a different relation",
                def.name
            ));
        }
        let supplied = match s.kind() {
            SubsetKind::BoolMask => SubsetShape::BoolMask,
            SubsetKind::Index => SubsetShape::Index,
        };
        if supplied != shape {
            return phase_err(format!(
                "kernel `{}`: compiled for {shape:?} launches, given {supplied:?}",
                def.name
            ));
        }
    }

    // every accessed field must reside on the target processor
    for fa in &version.report.fields {
        let (name, loc) = store.with_relation(fa.field.relation, |r| {
            let f = &r.fields[fa.field.field.index()];
            (f.name.clone(), f.location)
        });
        if loc != opts.processor {
            return phase_err(format!(
                "field `{name}` resides on {loc:?}, kernel targets {:?}",
                opts.processor
            ));
        }
    }

    // deleting kernels need an elastic launch relation with no subsets
    if version.report.deletes {
        let (mode, has_subsets) = store
            .with_relation(def.relation, |r| (r.mode, !r.subsets.is_empty()));
        if mode != RelationMode::Elastic || has_subsets {
            return phase_err(format!(
                "kernel `{}` deletes, which needs an elastic relation with no subsets",
                def.name
            ));
        }
    }

    // inserting kernels: the record must still match the target's
    // structural type (the schema-generation guard recompiled us if the
    // schema moved, so the compile-time check is current)
    if let Some(target) = version.report.insert_target {
        let rel = store.relation(target);
        if !rel.insert_allowed() {
            return schema_err(format!(
                "kernel `{}` inserts into `{}`, which is not insertable",
                def.name,
                rel.name()
            ));
        }
    }
    Ok(())
}

fn run_version(
    store: &Store,
    version: &mut Version,
    def: &KernelDef,
    opts: &LaunchOpts,
) -> Result<LaunchStats> {
    let (mode, dims, periodic, concrete) = store.with_relation(def.relation, |r| {
        (r.mode, r.dims.clone(), r.periodic.clone(), r.concrete)
    });
    let n_rows = concrete;

    // --- bind ---------------------------------------------------------------

    let domain = match opts.subset {
        None => Domain::Range { n: n_rows },
        Some(s) => match s.storage() {
            SubsetStorage::BoolMask(mask) => Domain::Mask { mask },
            SubsetStorage::Index(rows) => Domain::Index { rows },
        },
    };

    let bounds: Vec<(u64, u64)> = if mode == RelationMode::Grid {
        dims.iter().map(|d| (0, d.saturating_sub(1))).collect()
    } else if let Domain::Index { rows } = &domain {
        vec![(0, rows.len().saturating_sub(1) as u64)]
    } else {
        vec![(0, n_rows.saturating_sub(1))]
    };

    let grid = (mode == RelationMode::Grid).then(|| GridInfo { dims, periodic });

    // The insert reservation is the only fallible bind step, so it runs
    // before any column is checked out; phase analysis guarantees the
    // target's columns are not otherwise accessed by this kernel.
    let mut insert_bind = if let Some(target) = version.report.insert_target {
        let reservation =
            crate::relation::reserve_for_insert(store, target, domain.candidate_rows())?;
        let signature = store.with_relation(target, |r| r.structural_signature());
        let mut cols = Vec::with_capacity(signature.len());
        for (name, ty) in &signature {
            let fid = store
                .with_relation(target, |r| r.field_by_name(name))
                .expect("signature fields exist");
            let col = store.take_column(target, fid);
            cols.push((name.clone(), ty.clone(), col.elem_size, col.bytes));
        }
        let live_id = store
            .with_relation(target, |r| r.live_mask)
            .expect("elastic relations carry a live mask");
        let live_col = store.take_column(target, live_id);
        let next = reservation.base;
        Some((InsertBind { reservation, next, cols, live_bytes: live_col.bytes }, live_id))
    } else {
        None
    };

    let mut reads = Vec::new();
    let mut writes = WriteCols { cols: Vec::new(), reduce_cols: Vec::new() };
    let mut key_grids = Vec::new();
    for fa in &version.report.fields {
        let ty = store
            .with_relation(fa.field.relation, |r| r.fields[fa.field.field.index()].ty.clone());
        if let EbbType::Key { relation, lanes } = &ty
            && *lanes > 1
        {
            let dims = store.with_relation(*relation, |r| r.dims.clone());
            key_grids.push((*relation, dims));
        }
        match fa.privilege {
            Privilege::ReadOnly => {
                reads.push((fa.field, store.read_view(fa.field.relation, fa.field.field)));
            }
            Privilege::ReadWrite => {
                let col = store.take_column(fa.field.relation, fa.field.field);
                writes.cols.push((fa.field, col));
            }
            Privilege::Reduce(op) => {
                let col = store.take_column(fa.field.relation, fa.field.field);
                writes.reduce_cols.push((fa.field, op, col));
            }
        }
    }

    let queries: Vec<QueryBind> = version
        .report
        .queries
        .iter()
        .map(|q| QueryBind {
            relation: q.relation,
            offset: store.read_view(q.offset.relation, q.offset.field),
            length: store.read_view(q.length.relation, q.length.field),
        })
        .collect();

    // elastic live guard (and the delete write column)
    let mut delete_live = None;
    let live = if mode == RelationMode::Elastic {
        let live_id = store
            .with_relation(def.relation, |r| r.live_mask)
            .expect("elastic relations carry a live mask");
        let fref = FieldRef { relation: def.relation, field: live_id };
        if version.report.deletes {
            let col = store.take_column(def.relation, live_id);
            writes.cols.push((fref, col));
            delete_live = Some(fref);
            LiveGuard::WriteCol(fref)
        } else {
            LiveGuard::View(store.read_view(def.relation, live_id))
        }
    } else {
        LiveGuard::None
    };

    let globals_in = version
        .report
        .globals
        .iter()
        .filter(|g| g.reduce.is_none())
        .map(|g| (g.global, store.global_value(g.global)))
        .collect();
    let global_reduces: Vec<_> = version
        .report
        .globals
        .iter()
        .filter_map(|g| g.reduce.map(|op| (g.global, op, store.global_type(g.global))))
        .collect();

    let bind = BindData {
        launch: def.relation,
        domain,
        bounds,
        grid,
        reads,
        globals_in,
        global_reduces,
        queries,
        live,
        key_grids,
        delete_live,
    };

    if store.config().verbose_logging {
        let deps: Vec<String> = version
            .layout
            .fields()
            .iter()
            .map(|e| format!("f{}:{:?}", e.field.raw(), e.privilege))
            .collect();
        tracing::info!(
            kernel = %def.name,
            bounds = ?bind.bounds,
            deps = %deps.join(" "),
            "launch dependencies"
        );
    }

    // --- launch -------------------------------------------------------------

    let exec = Arc::clone(&version.exec);
    let force_sequential = version.report.requires_sequential();
    let result = match opts.processor {
        Processor::Cpu => exec::run_cpu(
            exec.as_ref(),
            &bind,
            &mut writes,
            insert_bind.as_mut().map(|(i, _)| i),
            if force_sequential { ExecMode::Sequential } else { opts.mode },
            store.config().cpu_partitions,
            n_rows,
        ),
        Processor::Gpu => gpu::run_device(
            exec.as_ref(),
            &bind,
            &mut writes,
            insert_bind.as_mut().map(|(i, _)| i),
            store.config().gpu_block_size,
            n_rows,
            force_sequential,
        ),
    };

    // --- restore checked-out columns on every path --------------------------

    for (fref, col) in writes.cols {
        store.put_column(fref.relation, fref.field, col.bytes);
    }
    for (fref, _, col) in writes.reduce_cols {
        store.put_column(fref.relation, fref.field, col.bytes);
    }
    if let Some((ins, live_id)) = &mut insert_bind {
        let target = ins.reservation.target;
        for (name, _, _, bytes) in ins.cols.drain(..) {
            let fid = store
                .with_relation(target, |r| r.field_by_name(&name))
                .expect("signature fields exist");
            store.put_column(target, fid, bytes);
        }
        store.put_column(target, *live_id, std::mem::take(&mut ins.live_bytes));
    }

    // --- post-launch --------------------------------------------------------

    let outcome = match result {
        Ok(o) => o,
        Err(e) => {
            // undo the reservation so a failed insert leaves no header room
            if let Some((ins, _)) = &insert_bind {
                let r = &ins.reservation;
                store.relation(r.target).resize(r.base, Some(r.old_logical))?;
            }
            return Err(e);
        }
    };

    for (i, (gid, op, _)) in bind.global_reduces.iter().enumerate() {
        let old = store.global_value(*gid);
        store.set_global_value(*gid, op.apply(&old, &outcome.global_totals[i]));
    }

    let mut stats = LaunchStats {
        rows: outcome.rows,
        deleted: outcome.deleted,
        ..Default::default()
    };
    if let Some((ins, _)) = &insert_bind {
        crate::relation::finish_insert(store, &ins.reservation, ins.next)?;
        stats.inserted = ins.next - ins.reservation.base;
    }
    if version.report.deletes && outcome.deleted > 0 {
        stats.defragged = crate::relation::finish_delete(store, def.relation, outcome.deleted)?;
    }

    tracing::debug!(
        kernel = %def.name,
        rows = stats.rows,
        inserted = stats.inserted,
        deleted = stats.deleted,
        "launched"
    );
    Ok(stats)
}
