//! Relations and their typed field columns.
//!
//! A relation is an ordered collection of rows in one of four modes:
//!
//! - `Plain` — opaque row ids.
//! - `Grid` — a 1-, 2- or 3-dimensional index space with per-axis
//!   periodicity; rows are cells in row-major order (last axis fastest).
//! - `Grouped` — reached from `Plain` via [`Relation::group_by`]: rows are
//!   sorted ascending by a key field, and the key's source relation carries
//!   `offset`/`length` columns locating each group.
//! - `Elastic` — supports row insertion and deletion through kernels; live
//!   rows may be sparse until a defrag pass packs them.
//!
//! Fields are raw little-endian byte columns sized `concrete_size *
//! elem_size`; that invariant is maintained by every operation here. The
//! [`Relation`] and [`Field`] types are cheap cloneable handles into the
//! owning [`Store`](crate::store::Store).

mod elastic;
mod subset;

pub use elastic::DefragStats;
pub use subset::{Subset, SubsetKind};

pub(crate) use elastic::{
    InsertReservation, RowCopier, finish_delete, finish_insert, reserve_for_insert,
};
pub(crate) use subset::{SubsetData, SubsetStorage};

use crate::error::schema_err;
use crate::ids::{FieldId, RelationId};
use crate::store::{Processor, Store};
use crate::types::{EbbType, ScalarKind, Value};
use anyhow::Result;
use std::sync::Arc;

/// The storage/behavior mode of a relation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelationMode {
    Plain,
    Grid,
    Grouped,
    Elastic,
}

/// Grouping metadata recorded on a grouped relation.
pub(crate) struct GroupInfo {
    /// The key field on the grouped relation itself.
    pub key_field: FieldId,
    /// The relation the key references; carries the aux columns.
    pub source: RelationId,
    /// `offset[k]` on the source: first grouped row with key `k`.
    pub offset_field: FieldId,
    /// `length[k]` on the source: number of grouped rows with key `k`.
    pub length_field: FieldId,
}

pub(crate) struct FieldData {
    pub name: String,
    pub ty: EbbType,
    pub elem_size: usize,
    pub bytes: Arc<Vec<u8>>,
    pub location: Processor,
}

pub(crate) struct RelationData {
    pub name: String,
    pub mode: RelationMode,
    pub dims: Vec<u64>,
    pub periodic: Vec<bool>,
    pub logical: u64,
    pub concrete: u64,
    pub fragmented: bool,
    pub fields: Vec<FieldData>,
    pub subsets: Vec<SubsetData>,
    pub live_mask: Option<FieldId>,
    pub grouping: Option<GroupInfo>,
    /// Relations that grouped themselves by a key into this relation.
    pub grouped_by_me: Vec<RelationId>,
    /// Bumped on every schema-affecting operation; compiled kernel versions
    /// compare it to decide whether to re-compile.
    pub generation: u64,
    /// Cached defrag row-copy routine, keyed by the structural signature.
    pub defrag_copier: Option<(Vec<u8>, Arc<RowCopier>)>,
}

impl RelationData {
    pub(crate) fn new(name: &str, mode: RelationMode, size: u64) -> Self {
        Self {
            name: name.to_string(),
            mode,
            dims: Vec::new(),
            periodic: Vec::new(),
            logical: size,
            concrete: size,
            fragmented: false,
            fields: Vec::new(),
            subsets: Vec::new(),
            live_mask: None,
            grouping: None,
            grouped_by_me: Vec::new(),
            generation: 0,
            defrag_copier: None,
        }
    }

    pub(crate) fn field_by_name(&self, name: &str) -> Option<FieldId> {
        self.fields
            .iter()
            .position(|f| f.name == name)
            .map(FieldId::new)
    }

    /// The structural signature: the ordered element types of the visible
    /// columns. Insert records and defrag copiers are keyed by this.
    pub(crate) fn structural_signature(&self) -> Vec<(String, EbbType)> {
        self.fields
            .iter()
            .filter(|f| !f.name.starts_with("__"))
            .map(|f| (f.name.clone(), f.ty.clone()))
            .collect()
    }
}

/// A handle to one relation in a store.
#[derive(Clone)]
pub struct Relation {
    pub(crate) store: Store,
    pub(crate) id: RelationId,
}

impl std::fmt::Debug for Relation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relation").field("id", &self.id).finish()
    }
}

/// A handle to one typed column of a relation.
#[derive(Clone)]
pub struct Field {
    pub(crate) store: Store,
    pub(crate) relation: RelationId,
    pub(crate) id: FieldId,
}

impl std::fmt::Debug for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Field")
            .field("relation", &self.relation)
            .field("id", &self.id)
            .finish()
    }
}

impl Relation {
    pub fn id(&self) -> RelationId {
        self.id
    }

    pub fn name(&self) -> String {
        self.store.with_relation(self.id, |r| r.name.clone())
    }

    pub fn mode(&self) -> RelationMode {
        self.store.with_relation(self.id, |r| r.mode)
    }

    pub fn dims(&self) -> Vec<u64> {
        self.store.with_relation(self.id, |r| r.dims.clone())
    }

    pub fn periodic(&self) -> Vec<bool> {
        self.store.with_relation(self.id, |r| r.periodic.clone())
    }

    /// Rows visible to the user.
    pub fn logical_size(&self) -> u64 {
        self.store.with_relation(self.id, |r| r.logical)
    }

    /// Rows actually allocated. Equal to the logical size except on elastic
    /// relations.
    pub fn concrete_size(&self) -> u64 {
        self.store.with_relation(self.id, |r| r.concrete)
    }

    pub fn is_fragmented(&self) -> bool {
        self.store.with_relation(self.id, |r| r.fragmented)
    }

    pub fn is_elastic(&self) -> bool {
        self.mode() == RelationMode::Elastic
    }

    pub fn is_grid(&self) -> bool {
        self.mode() == RelationMode::Grid
    }

    pub(crate) fn generation(&self) -> u64 {
        self.store.with_relation(self.id, |r| r.generation)
    }

    /// Kernels may insert into this relation: elastic, and no subsets.
    pub fn insert_allowed(&self) -> bool {
        self.store
            .with_relation(self.id, |r| r.mode == RelationMode::Elastic && r.subsets.is_empty())
    }

    /// The key type for handles into this relation: one lane per grid axis,
    /// a single lane otherwise.
    pub fn key_type(&self) -> EbbType {
        self.store.with_relation(self.id, |r| EbbType::Key {
            relation: self.id,
            lanes: if r.mode == RelationMode::Grid { r.dims.len() } else { 1 },
        })
    }

    // --- fields -------------------------------------------------------------

    /// Create a typed field. Fails if the relation is fragmented, the name
    /// is taken or reserved, or the type is a key into elastic storage (row
    /// ids are not stable there).
    pub fn new_field(&self, name: &str, ty: EbbType) -> Result<Field> {
        if name.is_empty() || name.starts_with("__") {
            return schema_err(format!("field name `{name}` is reserved"));
        }
        if let EbbType::Key { relation, lanes } = &ty {
            let (target_mode, target_dims) = self
                .store
                .with_relation(*relation, |r| (r.mode, r.dims.len()));
            if target_mode == RelationMode::Elastic {
                return schema_err(format!(
                    "field `{name}`: keys into elastic relations are forbidden"
                ));
            }
            let want = if target_mode == RelationMode::Grid { target_dims } else { 1 };
            if *lanes != want {
                return schema_err(format!(
                    "field `{name}`: key needs {want} lanes, got {lanes}"
                ));
            }
        }
        let id = self.store.with_relation_mut(self.id, |r| {
            if r.fragmented {
                return schema_err(format!(
                    "relation `{}` is fragmented; defrag before adding fields",
                    r.name
                ));
            }
            if r.field_by_name(name).is_some() {
                return schema_err(format!(
                    "field name `{name}` is already taken on `{}`",
                    r.name
                ));
            }
            Ok(push_field(r, name, ty))
        })?;
        Ok(Field { store: self.store.clone(), relation: self.id, id })
    }

    /// Look up a field by name. Hidden bookkeeping columns are not exposed.
    pub fn field(&self, name: &str) -> Option<Field> {
        if name.starts_with("__") {
            return None;
        }
        self.store
            .with_relation(self.id, |r| r.field_by_name(name))
            .map(|id| Field { store: self.store.clone(), relation: self.id, id })
    }

    pub(crate) fn field_handle(&self, id: FieldId) -> Field {
        Field { store: self.store.clone(), relation: self.id, id }
    }

    pub(crate) fn live_mask_field(&self) -> Option<Field> {
        self.store
            .with_relation(self.id, |r| r.live_mask)
            .map(|id| self.field_handle(id))
    }

    pub(crate) fn allocate_live_mask(&self) -> Result<()> {
        self.store.with_relation_mut(self.id, |r| {
            let id = push_field(r, "__live", EbbType::scalar(ScalarKind::Bool));
            // rows present at creation are live
            let n = r.concrete as usize;
            r.fields[id.index()].bytes = Arc::new(vec![1u8; n]);
            r.live_mask = Some(id);
            Ok(())
        })
    }

    /// Exchange the storage of two same-typed fields of this relation.
    pub fn swap(&self, a: &Field, b: &Field) -> Result<()> {
        if a.relation != self.id || b.relation != self.id {
            return schema_err("swap: both fields must belong to this relation");
        }
        self.store.with_relation_mut(self.id, |r| {
            let (ia, ib) = (a.id.index(), b.id.index());
            if r.fields[ia].ty != r.fields[ib].ty {
                return schema_err(format!(
                    "swap: `{}` and `{}` differ in type",
                    r.fields[ia].name, r.fields[ib].name
                ));
            }
            let ba = Arc::clone(&r.fields[ia].bytes);
            let bb = Arc::clone(&r.fields[ib].bytes);
            r.fields[ia].bytes = bb;
            r.fields[ib].bytes = ba;
            Ok(())
        })
    }

    /// Copy the contents of `from` into `to` (same relation, same type).
    pub fn copy(&self, from: &Field, to: &Field) -> Result<()> {
        if from.relation != self.id || to.relation != self.id {
            return schema_err("copy: both fields must belong to this relation");
        }
        self.store.with_relation_mut(self.id, |r| {
            let (i, j) = (from.id.index(), to.id.index());
            if r.fields[i].ty != r.fields[j].ty {
                return schema_err(format!(
                    "copy: `{}` and `{}` differ in type",
                    r.fields[i].name, r.fields[j].name
                ));
            }
            r.fields[j].bytes = Arc::clone(&r.fields[i].bytes);
            Ok(())
        })
    }

    // --- grid helpers -------------------------------------------------------

    /// Row-major linear index of a grid cell (last axis fastest).
    pub fn linear_of(&self, coords: &[u64]) -> u64 {
        let dims = self.dims();
        debug_assert_eq!(coords.len(), dims.len());
        coords
            .iter()
            .zip(&dims)
            .fold(0u64, |acc, (c, d)| acc * d + c)
    }

    /// Grid coordinates of a linear row id.
    pub fn coords_of(&self, row: u64) -> Vec<u64> {
        let dims = self.dims();
        let mut row = row;
        let mut out = vec![0u64; dims.len()];
        for (i, d) in dims.iter().enumerate().rev() {
            out[i] = row % d;
            row /= d;
        }
        out
    }

    // --- grouping -----------------------------------------------------------

    /// Sort-check this plain relation against `key` and transition it to
    /// grouped mode, producing `offset`/`length` columns on the key's source
    /// relation.
    ///
    /// Fails unless the relation is plain, the key is a single-lane key
    /// field of this relation referencing a source no larger than this
    /// relation, and the key column is sorted ascending.
    pub fn group_by(&self, key: &Field) -> Result<()> {
        if key.relation != self.id {
            return schema_err("group_by: key field belongs to a different relation");
        }
        if self.mode() != RelationMode::Plain {
            return schema_err(format!(
                "group_by: relation `{}` is not plain",
                self.name()
            ));
        }
        let key_ty = key.ty();
        let source = match key_ty {
            EbbType::Key { relation, lanes: 1 } => relation,
            _ => {
                return schema_err(format!(
                    "group_by: `{}` is not a single-lane key field",
                    key.name()
                ));
            }
        };
        let src_logical = self.store.with_relation(source, |r| r.logical);
        let n = self.logical_size();
        if src_logical > n {
            return schema_err(format!(
                "group_by: source relation ({src_logical} rows) is larger than `{}` ({n} rows)",
                self.name()
            ));
        }

        // Linear scan: verify ascending order and accumulate group extents.
        let view = self.store.read_view(self.id, key.id);
        let mut offsets = vec![0u64; src_logical as usize];
        let mut lengths = vec![0u64; src_logical as usize];
        let mut prev: i64 = -1;
        for row in 0..n {
            let k = match view.value_at(row)? {
                Value::Key(lanes) => lanes[0],
                _ => unreachable!("key column holds keys"),
            };
            if k < prev {
                return schema_err(format!(
                    "group_by: key field `{}` is not sorted ascending at row {row}",
                    key.name()
                ));
            }
            if k < 0 || k as u64 >= src_logical {
                return schema_err(format!(
                    "group_by: key {k} at row {row} is out of range"
                ));
            }
            if k != prev {
                offsets[k as usize] = row;
            }
            lengths[k as usize] += 1;
            prev = k;
        }

        let rel_name = self.name();
        let (offset_field, length_field) =
            self.store.with_relation_mut(source, |src| {
                let off = push_field(src, &format!("__offset_{rel_name}"), EbbType::scalar(ScalarKind::U64));
                let len = push_field(src, &format!("__length_{rel_name}"), EbbType::scalar(ScalarKind::U64));
                src.fields[off.index()].bytes = Arc::new(encode_u64s(&offsets));
                src.fields[len.index()].bytes = Arc::new(encode_u64s(&lengths));
                src.grouped_by_me.push(self.id);
                src.generation += 1;
                (off, len)
            });

        self.store.with_relation_mut(self.id, |r| {
            r.mode = RelationMode::Grouped;
            r.grouping = Some(GroupInfo {
                key_field: key.id,
                source,
                offset_field,
                length_field,
            });
            r.generation += 1;
        });
        tracing::debug!(relation = %rel_name, key = %key.name(), "grouped");
        Ok(())
    }

    /// The key field this relation is grouped by, if any.
    pub fn group_key(&self) -> Option<Field> {
        self.store
            .with_relation(self.id, |r| r.grouping.as_ref().map(|g| g.key_field))
            .map(|id| self.field_handle(id))
    }

    /// Relations grouped by a key into this relation.
    pub fn grouped_relations(&self) -> Vec<Relation> {
        self.store
            .with_relation(self.id, |r| r.grouped_by_me.clone())
            .into_iter()
            .map(|id| Relation { store: self.store.clone(), id })
            .collect()
    }

    /// The contiguous row range of this grouped relation whose key equals
    /// `key_row` (a row of the key's source relation).
    pub fn rows_with_key(&self, key_row: u64) -> Result<std::ops::Range<u64>> {
        let (source, off_f, len_f) = self.store.with_relation(self.id, |r| {
            r.grouping
                .as_ref()
                .map(|g| (g.source, g.offset_field, g.length_field))
                .ok_or_else(|| {
                    crate::error::Error::Schema(format!("relation `{}` is not grouped", r.name))
                })
        })?;
        let off = self
            .store
            .read_view(source, off_f)
            .value_at(key_row)?
            .as_u64()
            .unwrap_or(0);
        let len = self
            .store
            .read_view(source, len_f)
            .value_at(key_row)?
            .as_u64()
            .unwrap_or(0);
        Ok(off..off + len)
    }

    // --- sizing -------------------------------------------------------------

    /// Resize an elastic relation's backing storage. Field contents are
    /// preserved for indices below `min(old_concrete, new_concrete)`.
    pub fn resize(&self, new_concrete: u64, new_logical: Option<u64>) -> Result<()> {
        if self.mode() != RelationMode::Elastic {
            return schema_err(format!("resize: relation `{}` is not elastic", self.name()));
        }
        if let Some(l) = new_logical
            && l > new_concrete
        {
            return schema_err(format!(
                "resize: logical {l} would exceed concrete {new_concrete}"
            ));
        }
        self.store.with_relation_mut(self.id, |r| {
            for f in &mut r.fields {
                let bytes = Arc::make_mut(&mut f.bytes);
                bytes.resize(new_concrete as usize * f.elem_size, 0);
            }
            r.concrete = new_concrete;
            r.logical = new_logical.unwrap_or_else(|| r.logical.min(new_concrete));
        });
        Ok(())
    }

    // --- typed element access ----------------------------------------------

    /// Read one element.
    pub fn read_value(&self, field: &Field, row: u64) -> Result<Value> {
        self.store.read_view(self.id, field.id).value_at(row)
    }

    /// Write one element, widening if needed.
    pub fn write_value(&self, field: &Field, row: u64, v: impl Into<Value>) -> Result<()> {
        let v = v.into();
        self.store.with_relation_mut(self.id, |r| {
            let fd = &mut r.fields[field.id.index()];
            let v = match v.widen_to(&fd.ty) {
                Some(v) => v,
                None => {
                    return schema_err(format!(
                        "field `{}`: value {v:?} does not fit {:?}",
                        fd.name, fd.ty
                    ));
                }
            };
            let off = row as usize * fd.elem_size;
            let bytes = Arc::make_mut(&mut fd.bytes);
            let enc = v.encode(&fd.ty);
            bytes[off..off + enc.len()].copy_from_slice(&enc);
            Ok(())
        })
    }

    /// Load a full column of values, one per visible row.
    pub fn load(&self, field: &Field, values: &[Value]) -> Result<()> {
        if self.is_fragmented() {
            return schema_err(format!(
                "load: relation `{}` is fragmented",
                self.name()
            ));
        }
        let n = self.logical_size();
        if values.len() as u64 != n {
            return schema_err(format!(
                "load: {} values for {n} rows of `{}`",
                values.len(),
                self.name()
            ));
        }
        for (row, v) in values.iter().enumerate() {
            self.write_value(field, row as u64, v.clone())?;
        }
        Ok(())
    }

    /// Dump a column in row order. On elastic relations only live rows are
    /// returned (in storage order).
    pub fn dump(&self, field: &Field) -> Result<Vec<Value>> {
        let view = self.store.read_view(self.id, field.id);
        if self.is_elastic() {
            let live = self.live_mask_field().expect("elastic relations carry a live mask");
            let live_view = self.store.read_view(self.id, live.id);
            let mut out = Vec::new();
            for row in 0..self.concrete_size() {
                if live_view.value_at(row)? == Value::Bool(true) {
                    out.push(view.value_at(row)?);
                }
            }
            Ok(out)
        } else {
            (0..self.logical_size()).map(|row| view.value_at(row)).collect()
        }
    }

    /// Set every allocated row of a field to one value.
    pub fn fill(&self, field: &Field, v: impl Into<Value>) -> Result<()> {
        let v = v.into();
        self.store.with_relation_mut(self.id, |r| {
            let fd = &mut r.fields[field.id.index()];
            let v = match v.widen_to(&fd.ty) {
                Some(v) => v,
                None => {
                    return schema_err(format!(
                        "fill: value {v:?} does not fit {:?}",
                        fd.ty
                    ));
                }
            };
            let enc = v.encode(&fd.ty);
            let n = r.concrete as usize;
            let bytes = Arc::make_mut(&mut fd.bytes);
            for row in 0..n {
                bytes[row * fd.elem_size..(row + 1) * fd.elem_size].copy_from_slice(&enc);
            }
            Ok(())
        })
    }
}

impl Field {
    pub fn id(&self) -> FieldId {
        self.id
    }

    pub fn relation_id(&self) -> RelationId {
        self.relation
    }

    pub fn relation(&self) -> Relation {
        Relation { store: self.store.clone(), id: self.relation }
    }

    pub fn name(&self) -> String {
        self.store
            .with_relation(self.relation, |r| r.fields[self.id.index()].name.clone())
    }

    pub fn ty(&self) -> EbbType {
        self.store
            .with_relation(self.relation, |r| r.fields[self.id.index()].ty.clone())
    }

    pub fn elem_size(&self) -> usize {
        self.store
            .with_relation(self.relation, |r| r.fields[self.id.index()].elem_size)
    }

    pub fn location(&self) -> Processor {
        self.store
            .with_relation(self.relation, |r| r.fields[self.id.index()].location)
    }

    /// Migrate this field's storage to `proc`. The emulated device shares
    /// the host address space, so this flips the residency tag.
    pub fn move_to(&self, proc: Processor) {
        self.store.with_relation_mut(self.relation, |r| {
            r.fields[self.id.index()].location = proc;
        });
    }
}

/// Append a field column to a relation, zero-initialized at the current
/// concrete size. Callers have already validated the name.
pub(crate) fn push_field(r: &mut RelationData, name: &str, ty: EbbType) -> FieldId {
    let elem_size = ty.size_of();
    let id = FieldId::new(r.fields.len());
    r.fields.push(FieldData {
        name: name.to_string(),
        ty,
        elem_size,
        bytes: Arc::new(vec![0u8; r.concrete as usize * elem_size]),
        location: Processor::Cpu,
    });
    r.generation += 1;
    id
}

fn encode_u64s(vals: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vals.len() * 8);
    for v in vals {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}
