//! Lightweight unique identifiers for objects registered in a [`Store`](crate::store::Store).
//!
//! Relations, fields, globals, and subsets all live in arenas inside the
//! store; cross-references between them are these index newtypes, never
//! pointers. That breaks the relation↔field ownership cycle and lets a whole
//! store be torn down in one move.
//!
//! The raw value of a [`RelationId`] doubles as the relation's stable numeric
//! UID on the distributed control plane.

use serde::{Deserialize, Serialize};

/// Unique numeric identifier for a relation within a store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct RelationId(u32);

/// Identifier for a field, scoped to its owning relation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct FieldId(u32);

/// Identifier for a process-wide global value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct GlobalId(u32);

/// Identifier for a subset, scoped to its owning relation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct SubsetId(u32);

macro_rules! id_impls {
    ($($name:ident),* $(,)?) => {
        $(
            impl $name {
                pub(crate) fn new(v: usize) -> Self {
                    Self(v as u32)
                }

                /// Return the underlying numeric value.
                pub fn raw(&self) -> u32 {
                    self.0
                }

                pub(crate) fn index(&self) -> usize {
                    self.0 as usize
                }
            }
        )*
    };
}

id_impls!(RelationId, FieldId, GlobalId, SubsetId);
