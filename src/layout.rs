//! The packed per-kernel argument layout.
//!
//! The front end and back end communicate through one ordered descriptor per
//! compiled kernel version: bounds per axis, an optional index-subset
//! record, one entry per referenced field with its required privilege, one
//! entry per referenced global, and one scratch entry per device
//! global-reduction target.
//!
//! Layout finalization is one-shot. The first query of the layout freezes
//! it; adding a field or global afterwards is a
//! [`Layout`](crate::error::Error::Layout) error — always an implementation
//! bug in the caller, surfaced loudly rather than silently reordered.

use crate::error::layout_err;
use crate::ids::{FieldId, GlobalId, RelationId};
use crate::reduce::ReduceOp;
use anyhow::Result;

/// The privilege a kernel requires on one field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Privilege {
    /// The kernel only reads (centered or uncentered).
    ReadOnly,
    /// The kernel reads and writes the centered row.
    ReadWrite,
    /// The kernel reduces with a commutative-associative op.
    Reduce(ReduceOp),
}

#[derive(Clone, Debug)]
pub struct FieldEntry {
    pub relation: RelationId,
    pub field: FieldId,
    pub privilege: Privilege,
    /// True when some read goes through a non-centered key.
    pub uncentered_read: bool,
}

#[derive(Clone, Debug)]
pub struct GlobalEntry {
    pub global: GlobalId,
    pub reduce: Option<ReduceOp>,
}

/// The ordered argument descriptor of one kernel version.
#[derive(Clone, Debug)]
pub struct ArgLayout {
    n_dims: usize,
    fields: Vec<FieldEntry>,
    globals: Vec<GlobalEntry>,
    /// Globals that get a per-block scratch array on device launches.
    scratch: Vec<GlobalId>,
    insert_target: Option<RelationId>,
    deletes: bool,
    finalized: bool,
}

impl ArgLayout {
    /// Start a layout for a launch domain with `n_dims` axes (1 for plain
    /// and elastic relations).
    pub fn new(n_dims: usize) -> Self {
        Self {
            n_dims: n_dims.max(1),
            fields: Vec::new(),
            globals: Vec::new(),
            scratch: Vec::new(),
            insert_target: None,
            deletes: false,
            finalized: false,
        }
    }

    fn check_open(&self, what: &str) -> Result<()> {
        if self.finalized {
            return layout_err(format!(
                "cannot add {what} after the layout was finalized"
            ));
        }
        Ok(())
    }

    /// Register a referenced field with its privilege. Re-registering the
    /// same field keeps the first entry.
    pub fn add_field(
        &mut self,
        relation: RelationId,
        field: FieldId,
        privilege: Privilege,
        uncentered_read: bool,
    ) -> Result<()> {
        self.check_open("a field")?;
        if !self
            .fields
            .iter()
            .any(|e| e.relation == relation && e.field == field)
        {
            self.fields.push(FieldEntry { relation, field, privilege, uncentered_read });
        }
        Ok(())
    }

    /// Register a referenced global.
    pub fn add_global(&mut self, global: GlobalId, reduce: Option<ReduceOp>) -> Result<()> {
        self.check_open("a global")?;
        if !self.globals.iter().any(|e| e.global == global) {
            self.globals.push(GlobalEntry { global, reduce });
        }
        Ok(())
    }

    /// Register a per-block scratch array for a device global reduction.
    pub fn add_scratch(&mut self, global: GlobalId) -> Result<()> {
        self.check_open("a scratch array")?;
        if !self.scratch.contains(&global) {
            self.scratch.push(global);
        }
        Ok(())
    }

    /// Declare that the kernel inserts into `target`.
    pub fn declare_insert(&mut self, target: RelationId) -> Result<()> {
        self.check_open("an insert declaration")?;
        self.insert_target = Some(target);
        Ok(())
    }

    /// Declare that the kernel deletes from its launch relation.
    pub fn declare_delete(&mut self) -> Result<()> {
        self.check_open("a delete declaration")?;
        self.deletes = true;
        Ok(())
    }

    /// Freeze the layout. Idempotent; implied by the first query.
    pub fn finalize(&mut self) {
        self.finalized = true;
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    // Queries finalize on first use.

    pub fn n_dims(&mut self) -> usize {
        self.finalize();
        self.n_dims
    }

    pub fn fields(&mut self) -> &[FieldEntry] {
        self.finalize();
        &self.fields
    }

    pub fn globals(&mut self) -> &[GlobalEntry] {
        self.finalize();
        &self.globals
    }

    pub fn scratch(&mut self) -> &[GlobalId] {
        self.finalize();
        &self.scratch
    }

    pub fn insert_target(&mut self) -> Option<RelationId> {
        self.finalize();
        self.insert_target
    }

    pub fn deletes(&mut self) -> bool {
        self.finalize();
        self.deletes
    }
}
