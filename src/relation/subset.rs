//! Named read-only filters over a relation's rows.
//!
//! A subset is built once from a predicate and never mutated. Storage shape
//! is chosen by selectivity: a dense boolean mask when more than 10% of the
//! rows are selected (or whenever the source is a grid, where launches are
//! range-shaped anyway), and a packed index list otherwise.

use crate::error::schema_err;
use crate::ids::{RelationId, SubsetId};
use crate::relation::Relation;
use crate::store::Store;
use anyhow::Result;
use std::sync::Arc;

/// The storage shape a subset ended up with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubsetKind {
    BoolMask,
    Index,
}

#[derive(Clone)]
pub(crate) enum SubsetStorage {
    BoolMask(Arc<Vec<bool>>),
    Index(Arc<Vec<u64>>),
}

pub(crate) struct SubsetData {
    pub name: String,
    pub storage: SubsetStorage,
}

/// A handle to one subset of a relation.
#[derive(Clone)]
pub struct Subset {
    pub(crate) store: Store,
    pub(crate) relation: RelationId,
    pub(crate) id: SubsetId,
}

impl Relation {
    /// Evaluate `pred` once per visible row and record the selected rows as
    /// a named subset.
    pub fn new_subset(&self, name: &str, mut pred: impl FnMut(u64) -> bool) -> Result<Subset> {
        if self.is_fragmented() {
            return schema_err(format!(
                "new_subset: relation `{}` is fragmented",
                self.name()
            ));
        }
        let taken = self
            .store
            .with_relation(self.id, |r| r.subsets.iter().any(|s| s.name == name));
        if taken {
            return schema_err(format!(
                "subset name `{name}` is already taken on `{}`",
                self.name()
            ));
        }

        let n = self.logical_size();
        let mut mask = vec![false; n as usize];
        let mut selected = 0u64;
        for row in 0..n {
            if pred(row) {
                mask[row as usize] = true;
                selected += 1;
            }
        }

        let storage = if self.is_grid() || selected * 10 > n {
            SubsetStorage::BoolMask(Arc::new(mask))
        } else {
            let idx: Vec<u64> = (0..n).filter(|r| mask[*r as usize]).collect();
            SubsetStorage::Index(Arc::new(idx))
        };

        let id = self.store.with_relation_mut(self.id, |r| {
            let id = SubsetId::new(r.subsets.len());
            r.subsets.push(SubsetData { name: name.to_string(), storage });
            id
        });
        tracing::debug!(relation = %self.name(), subset = name, selected, "new subset");
        Ok(Subset { store: self.store.clone(), relation: self.id, id })
    }

    pub fn subset(&self, name: &str) -> Option<Subset> {
        self.store
            .with_relation(self.id, |r| r.subsets.iter().position(|s| s.name == name))
            .map(|i| Subset {
                store: self.store.clone(),
                relation: self.id,
                id: SubsetId::new(i),
            })
    }
}

impl Subset {
    pub fn name(&self) -> String {
        self.store
            .with_relation(self.relation, |r| r.subsets[self.id.index()].name.clone())
    }

    pub fn relation(&self) -> Relation {
        Relation { store: self.store.clone(), id: self.relation }
    }

    pub fn kind(&self) -> SubsetKind {
        self.store.with_relation(self.relation, |r| {
            match r.subsets[self.id.index()].storage {
                SubsetStorage::BoolMask(_) => SubsetKind::BoolMask,
                SubsetStorage::Index(_) => SubsetKind::Index,
            }
        })
    }

    /// Number of selected rows.
    pub fn len(&self) -> u64 {
        self.store.with_relation(self.relation, |r| {
            match &r.subsets[self.id.index()].storage {
                SubsetStorage::BoolMask(m) => m.iter().filter(|b| **b).count() as u64,
                SubsetStorage::Index(i) => i.len() as u64,
            }
        })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn storage(&self) -> SubsetStorage {
        self.store
            .with_relation(self.relation, |r| r.subsets[self.id.index()].storage.clone())
    }
}
