//! The central store: an arena of relations and globals.
//!
//! The [`Store`] is the container all runtime objects live in. It is
//! lightweight, cloneable, and thread-safe via internal `Arc<Mutex<_>>`
//! wrapping; handles ([`Relation`](crate::relation::Relation),
//! [`Field`](crate::relation::Field), [`Global`]) refer back to it by id.
//!
//! # Overview
//! - Relations, their fields, and their subsets are arena entries; every
//!   cross-reference is an index newtype from [`ids`](crate::ids), never a
//!   pointer, so the relation↔field cycle never materializes.
//! - A relation's raw id doubles as its stable UID on the control plane.
//! - Kernel launches snapshot the column data they need (`Arc` clones for
//!   reads, checked-out byte vectors for writes) and hold the lock only for
//!   the duration of the snapshot, never across a launch.

use crate::config::Config;
use crate::error::schema_err;
use crate::ids::{FieldId, GlobalId, RelationId};
use crate::relation::{Relation, RelationData, RelationMode};
use crate::types::{EbbType, Value};
use anyhow::Result;
use std::sync::{Arc, Mutex};

/// Field residency: which processor a column's storage currently belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Processor {
    Cpu,
    Gpu,
}

/// How a new relation is shaped. `Grouped` is not directly constructible;
/// it is reached from `Plain` via [`Relation::group_by`].
#[derive(Clone, Debug)]
pub enum RelationShape {
    Plain { size: u64 },
    Grid { dims: Vec<u64>, periodic: Vec<bool> },
    Elastic { size: u64 },
}

pub(crate) struct GlobalData {
    pub name: String,
    pub ty: EbbType,
    pub value: Value,
}

pub(crate) struct StoreInner {
    pub relations: Vec<RelationData>,
    pub globals: Vec<GlobalData>,
}

/// Thread-safe arena holding every relation and global of one runtime.
pub struct Store {
    pub(crate) inner: Arc<Mutex<StoreInner>>,
    pub(crate) config: Arc<Config>,
}

impl Clone for Store {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            config: Arc::clone(&self.config),
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Store {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                relations: Vec::new(),
                globals: Vec::new(),
            })),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Create a new relation. Fails if the name is taken, if a grid has no
    /// dims (or more than three), or if the periodic flags do not match the
    /// dims.
    pub fn new_relation(&self, name: &str, shape: RelationShape) -> Result<Relation> {
        let mut inner = self.inner.lock().unwrap();
        if inner.relations.iter().any(|r| r.name == name) {
            return schema_err(format!("relation name `{name}` is already taken"));
        }
        let data = match shape {
            RelationShape::Plain { size } => RelationData::new(name, RelationMode::Plain, size),
            RelationShape::Elastic { size } => {
                RelationData::new(name, RelationMode::Elastic, size)
            }
            RelationShape::Grid { dims, periodic } => {
                if dims.is_empty() || dims.len() > 3 {
                    return schema_err(format!(
                        "grid relation `{name}` needs 1 to 3 dims, got {}",
                        dims.len()
                    ));
                }
                if periodic.len() != dims.len() {
                    return schema_err(format!(
                        "grid relation `{name}`: {} periodic flags for {} dims",
                        periodic.len(),
                        dims.len()
                    ));
                }
                let size = dims.iter().product();
                let mut d = RelationData::new(name, RelationMode::Grid, size);
                d.dims = dims;
                d.periodic = periodic;
                d
            }
        };
        let id = RelationId::new(inner.relations.len());
        inner.relations.push(data);
        drop(inner);

        let rel = Relation { store: self.clone(), id };
        if rel.mode() == RelationMode::Elastic {
            rel.allocate_live_mask()?;
        }
        tracing::debug!(relation = name, uid = id.raw(), "new relation");
        Ok(rel)
    }

    /// Look up a relation handle by id.
    pub fn relation(&self, id: RelationId) -> Relation {
        Relation { store: self.clone(), id }
    }

    /// Look up a relation by name.
    pub fn relation_by_name(&self, name: &str) -> Option<Relation> {
        let inner = self.inner.lock().unwrap();
        inner
            .relations
            .iter()
            .position(|r| r.name == name)
            .map(|i| Relation { store: self.clone(), id: RelationId::new(i) })
    }

    /// Create a typed global. The initial value must match the type exactly.
    pub fn new_global(&self, name: &str, ty: EbbType, init: Value) -> Result<Global> {
        if !init.matches(&ty) {
            return schema_err(format!(
                "global `{name}`: initial value does not match {ty:?}"
            ));
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.globals.iter().any(|g| g.name == name) {
            return schema_err(format!("global name `{name}` is already taken"));
        }
        let id = GlobalId::new(inner.globals.len());
        inner.globals.push(GlobalData { name: name.to_string(), ty, value: init });
        Ok(Global { store: self.clone(), id })
    }

    pub fn global(&self, id: GlobalId) -> Global {
        Global { store: self.clone(), id }
    }

    // --- crate-internal accessors -------------------------------------------

    pub(crate) fn with_relation<R>(
        &self,
        id: RelationId,
        f: impl FnOnce(&RelationData) -> R,
    ) -> R {
        let inner = self.inner.lock().unwrap();
        f(&inner.relations[id.index()])
    }

    pub(crate) fn with_relation_mut<R>(
        &self,
        id: RelationId,
        f: impl FnOnce(&mut RelationData) -> R,
    ) -> R {
        let mut inner = self.inner.lock().unwrap();
        f(&mut inner.relations[id.index()])
    }

    pub(crate) fn with_inner<R>(&self, f: impl FnOnce(&mut StoreInner) -> R) -> R {
        let mut inner = self.inner.lock().unwrap();
        f(&mut inner)
    }

    /// Cheap shared snapshot of a column for reading.
    pub(crate) fn read_view(&self, rel: RelationId, field: FieldId) -> ColumnView {
        let inner = self.inner.lock().unwrap();
        let fd = &inner.relations[rel.index()].fields[field.index()];
        ColumnView {
            ty: fd.ty.clone(),
            elem_size: fd.elem_size,
            bytes: Arc::clone(&fd.bytes),
        }
    }

    /// Check a column's bytes out for exclusive mutation. The store keeps an
    /// empty placeholder until [`Store::put_column`] restores it; callers
    /// must restore on every path, including failed launches.
    pub(crate) fn take_column(&self, rel: RelationId, field: FieldId) -> ColumnOwned {
        let mut inner = self.inner.lock().unwrap();
        let fd = &mut inner.relations[rel.index()].fields[field.index()];
        let bytes = std::mem::take(Arc::make_mut(&mut fd.bytes));
        ColumnOwned {
            ty: fd.ty.clone(),
            elem_size: fd.elem_size,
            bytes,
        }
    }

    pub(crate) fn put_column(&self, rel: RelationId, field: FieldId, bytes: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        let fd = &mut inner.relations[rel.index()].fields[field.index()];
        fd.bytes = Arc::new(bytes);
    }

    pub(crate) fn global_value(&self, id: GlobalId) -> Value {
        let inner = self.inner.lock().unwrap();
        inner.globals[id.index()].value.clone()
    }

    pub(crate) fn global_type(&self, id: GlobalId) -> EbbType {
        let inner = self.inner.lock().unwrap();
        inner.globals[id.index()].ty.clone()
    }

    pub(crate) fn set_global_value(&self, id: GlobalId, v: Value) {
        let mut inner = self.inner.lock().unwrap();
        inner.globals[id.index()].value = v;
    }
}

/// A shared, read-only snapshot of one field column.
#[derive(Clone)]
pub(crate) struct ColumnView {
    pub ty: EbbType,
    pub elem_size: usize,
    pub bytes: Arc<Vec<u8>>,
}

impl ColumnView {
    pub fn value_at(&self, row: u64) -> Result<Value> {
        let off = row as usize * self.elem_size;
        Value::decode(&self.ty, &self.bytes[off..off + self.elem_size])
    }
}

/// An exclusively-held column checked out of the store for a launch.
pub(crate) struct ColumnOwned {
    pub ty: EbbType,
    pub elem_size: usize,
    pub bytes: Vec<u8>,
}

/// A process-wide typed scalar with explicit get/set.
#[derive(Clone)]
pub struct Global {
    pub(crate) store: Store,
    pub(crate) id: GlobalId,
}

impl Global {
    pub fn id(&self) -> GlobalId {
        self.id
    }

    pub fn name(&self) -> String {
        self.store
            .with_inner(|inner| inner.globals[self.id.index()].name.clone())
    }

    pub fn ty(&self) -> EbbType {
        self.store.global_type(self.id)
    }

    pub fn get(&self) -> Value {
        self.store.global_value(self.id)
    }

    /// Replace the value. Widening is applied; anything else is a schema
    /// error.
    pub fn set(&self, v: impl Into<Value>) -> Result<()> {
        let v = v.into();
        let ty = self.ty();
        match v.widen_to(&ty) {
            Some(v) => {
                self.store.set_global_value(self.id, v);
                Ok(())
            }
            None => schema_err(format!(
                "global `{}`: value {v:?} does not fit {ty:?}",
                self.name()
            )),
        }
    }
}
