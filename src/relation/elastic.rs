//! The elastic-relation mutation protocol: insert reservations, deletion
//! accounting, and the defrag pack step.
//!
//! Kernels never resize storage mid-flight. An inserting launch reserves
//! header room up front (`concrete + launch_size` rows) and claims rows
//! through a write-index; a deleting launch clears live-mask bits and counts
//! them. Both settle in `post_launch`, which calls back into this module.
//!
//! The defrag row-copy routine is generated per structural signature and
//! cached on the relation; a sha-256 digest of the signature detects schema
//! changes and forces regeneration.

use crate::error::schema_err;
use crate::ids::RelationId;
use crate::relation::{FieldData, Relation};
use crate::store::{Processor, Store};
use anyhow::Result;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Outcome of a defrag pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DefragStats {
    /// Rows relocated from the tail into holes.
    pub moved: u64,
}

/// Generated row-copy routine for one structural signature. Copies a row of
/// every column except the live mask, which the pack protocol flips
/// explicitly.
pub(crate) struct RowCopier {
    field_indices: Vec<usize>,
}

impl RowCopier {
    fn generate(fields: &[FieldData], live_idx: Option<usize>) -> Self {
        let field_indices = (0..fields.len())
            .filter(|i| Some(*i) != live_idx)
            .collect();
        Self { field_indices }
    }

    fn copy_row(&self, fields: &mut [FieldData], dst: u64, src: u64) {
        for &i in &self.field_indices {
            let fd = &mut fields[i];
            let sz = fd.elem_size;
            let bytes = Arc::make_mut(&mut fd.bytes);
            let (s, d) = (src as usize * sz, dst as usize * sz);
            bytes.copy_within(s..s + sz, d);
        }
    }
}

/// Bookkeeping for an inserting launch, produced at bind time.
pub(crate) struct InsertReservation {
    pub target: RelationId,
    /// Concrete size before the reservation; the write index starts here.
    pub base: u64,
    /// Reserved concrete size; a claim reaching this boundary is fatal.
    pub cap: u64,
    pub old_logical: u64,
}

/// Reserve header room on the insert target: `concrete + launch_rows` rows,
/// logical size untouched.
pub(crate) fn reserve_for_insert(
    store: &Store,
    target: RelationId,
    launch_rows: u64,
) -> Result<InsertReservation> {
    let rel = store.relation(target);
    if !rel.insert_allowed() {
        return schema_err(format!(
            "insert into `{}` requires an elastic relation with no subsets",
            rel.name()
        ));
    }
    let base = rel.concrete_size();
    let old_logical = rel.logical_size();
    let cap = base + launch_rows;
    rel.resize(cap, Some(old_logical))?;
    Ok(InsertReservation { target, base, cap, old_logical })
}

/// Settle an inserting launch: shrink back to the claimed row count, grow
/// the logical size by the rows actually inserted, and mark fragmented.
pub(crate) fn finish_insert(
    store: &Store,
    res: &InsertReservation,
    final_index: u64,
) -> Result<()> {
    let rel = store.relation(res.target);
    let inserted = final_index - res.base;
    rel.resize(final_index, Some(res.old_logical + inserted))?;
    store.with_relation_mut(res.target, |r| r.fragmented = true);
    tracing::debug!(relation = %rel.name(), inserted, "insert settled");
    Ok(())
}

/// Settle a deleting launch: shrink the logical size and auto-defrag when
/// occupancy drops to half or below. Returns true if a defrag ran.
pub(crate) fn finish_delete(store: &Store, rel: RelationId, deleted: u64) -> Result<bool> {
    let handle = store.relation(rel);
    let (logical, concrete) = store.with_relation_mut(rel, |r| {
        r.logical -= deleted.min(r.logical);
        if deleted > 0 {
            r.fragmented = true;
        }
        (r.logical, r.concrete)
    });
    tracing::debug!(relation = %handle.name(), deleted, logical, "delete settled");
    if deleted > 0 && logical * 2 <= concrete {
        handle.defrag()?;
        return Ok(true);
    }
    Ok(false)
}

impl Relation {
    /// Pack live rows to the front and release dead storage.
    ///
    /// Two cursors walk toward each other: `src` descends over dead tail
    /// rows, `dst` ascends over live head rows, and each `dst < src` pair
    /// moves one row. Afterwards `concrete == logical` and the relation is
    /// no longer fragmented. Running defrag on an already-packed relation is
    /// a no-op, so the operation is idempotent.
    pub fn defrag(&self) -> Result<DefragStats> {
        if !self.is_elastic() {
            return schema_err(format!("defrag: relation `{}` is not elastic", self.name()));
        }

        // Device-resident columns migrate to host for the scan and return
        // afterwards.
        let displaced: Vec<usize> = self.store.with_relation_mut(self.id, |r| {
            let moved: Vec<usize> = r
                .fields
                .iter()
                .enumerate()
                .filter(|(_, f)| f.location == Processor::Gpu)
                .map(|(i, _)| i)
                .collect();
            for &i in &moved {
                r.fields[i].location = Processor::Cpu;
            }
            moved
        });

        let stats = self.store.with_relation_mut(self.id, |r| {
            let live_idx = r.live_mask.map(|f| f.index());
            let copier = cached_copier(r, live_idx);

            let Some(live_idx) = live_idx else {
                return DefragStats::default();
            };
            let concrete = r.concrete;
            let mut stats = DefragStats::default();
            if concrete > 0 {
                let mut dst: u64 = 0;
                let mut src: u64 = concrete - 1;
                while dst < src {
                    while src > dst && !live_bit(r, live_idx, src) {
                        src -= 1;
                    }
                    while dst < src && live_bit(r, live_idx, dst) {
                        dst += 1;
                    }
                    if dst < src {
                        copier.copy_row(&mut r.fields, dst, src);
                        set_live_bit(r, live_idx, dst, true);
                        set_live_bit(r, live_idx, src, false);
                        stats.moved += 1;
                    }
                }
            }

            // Release the dead tail.
            let logical = r.logical;
            for f in &mut r.fields {
                let bytes = Arc::make_mut(&mut f.bytes);
                bytes.truncate(logical as usize * f.elem_size);
            }
            r.concrete = logical;
            r.fragmented = false;
            stats
        });

        self.store.with_relation_mut(self.id, |r| {
            for &i in &displaced {
                r.fields[i].location = Processor::Gpu;
            }
        });

        tracing::debug!(relation = %self.name(), moved = stats.moved, "defrag");
        Ok(stats)
    }
}

fn live_bit(r: &crate::relation::RelationData, live_idx: usize, row: u64) -> bool {
    r.fields[live_idx].bytes[row as usize] != 0
}

fn set_live_bit(r: &mut crate::relation::RelationData, live_idx: usize, row: u64, v: bool) {
    let bytes = Arc::make_mut(&mut r.fields[live_idx].bytes);
    bytes[row as usize] = u8::from(v);
}

/// Fetch the cached copy routine, regenerating it when the structural
/// signature digest has changed.
fn cached_copier(
    r: &mut crate::relation::RelationData,
    live_idx: Option<usize>,
) -> Arc<RowCopier> {
    let digest = signature_digest(r);
    if let Some((cached, copier)) = &r.defrag_copier
        && *cached == digest
    {
        return Arc::clone(copier);
    }
    let copier = Arc::new(RowCopier::generate(&r.fields, live_idx));
    r.defrag_copier = Some((digest, Arc::clone(&copier)));
    copier
}

fn signature_digest(r: &crate::relation::RelationData) -> Vec<u8> {
    let sig = r.structural_signature();
    let encoded = serde_json::to_vec(&sig).expect("signature serializes");
    Sha256::digest(&encoded).to_vec()
}
