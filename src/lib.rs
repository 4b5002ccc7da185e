//! # Meshflow
//!
//! A **data-parallel kernel runtime** for relational mesh and grid data.
//! Programs describe their domain as *relations* (vertices, edges, cells,
//! grid cells) carrying typed per-row *fields* and process-wide *globals*,
//! then map small per-element *kernels* over them. The runtime compiles
//! each kernel per processor, schedules it over the relation's row space,
//! enforces data-race safety through phase analysis, and performs parallel
//! reductions with well-defined ordering.
//!
//! ## Key features
//!
//! - **Relations** - plain, grid (1-3 dims with per-axis periodicity),
//!   grouped (sorted by a key field), and elastic (insert/delete/defrag)
//! - **Typed fields** - scalars, fixed-size vectors and matrices, and
//!   row-handle keys into other relations
//! - **Kernels** - a sealed typed AST with centered and stencil accesses,
//!   query loops over grouped relations, inserts, and deletes
//! - **Phase analysis** - per-field read-only / read-write / reduce
//!   classification that rejects unschedulable access mixes at compile
//! - **Reductions** - commutative-associative ops with identities; the
//!   device engine runs the shared-slot tree reduction with a secondary
//!   pass over per-block scratch
//! - **Subsets** - predicate-built row filters stored as boolmasks or
//!   packed index lists by selectivity
//! - **Distributed mode** (feature `distributed`) - signal-graph
//!   scheduler, grid partitioner, ghost-exchange channels, and the
//!   event-driven control plane over an in-process node fleet
//! - **I/O** - binary mesh files, OFF triangle meshes, CSV field columns
//!
//! ## Quick start
//!
//! ```no_run
//! use meshflow::*;
//! use meshflow::kernel::ast::*;
//! # use anyhow::Result;
//!
//! # fn main() -> Result<()> {
//! let store = Store::default();
//!
//! // four vertices with a position field
//! let verts = store.new_relation("vertices", RelationShape::Plain { size: 4 })?;
//! let pos = verts.new_field("pos", EbbType::vector(ScalarKind::F64, 3))?;
//!
//! // a global accumulator and a kernel reducing into it
//! let com = store.new_global(
//!     "com",
//!     EbbType::vector(ScalarKind::F64, 3),
//!     types::vec_f64(&[0.0, 0.0, 0.0]),
//! )?;
//! let k = Kernel::new(KernelDef::new(
//!     "center_of_mass",
//!     verts.id(),
//!     vec![reduce_global(&com, ReduceOp::Add, read(&pos))],
//! ));
//! k.launch_default(&store)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Execution model
//!
//! Kernels go through **compile → dynamic checks → bind → launch →
//! post-launch**. Compilation happens once per (processor, subset shape)
//! pair and is repeated automatically when a relation's schema changes.
//! Launches are deferred nowhere: `Kernel::launch` runs the kernel to
//! completion on the calling thread's engine (sequential, rayon row
//! chunks, or the block-shaped device emulation).
//!
//! ## Module overview
//!
//! - [`store`] - the arena of relations and globals
//! - [`relation`] - relations, fields, subsets, grouping, elastic storage
//! - [`types`] / [`reduce`] - the value model and the reduction op table
//! - [`kernel`] - AST, type checking, phase analysis, versions, launches
//! - [`layout`] - the packed per-kernel argument descriptor
//! - [`config`] - immutable runtime configuration from the environment
//! - [`sched`] / [`dist`] - the distributed scheduler, partitioner, ghost
//!   channels, and control plane (feature `distributed`)
//! - [`io`] - mesh / OFF / CSV readers and writers
//! - [`testing`] - assertions and builders for pipeline tests

pub mod config;
pub mod error;
pub mod ids;
pub mod io;
pub mod kernel;
pub mod layout;
pub mod reduce;
pub mod relation;
pub mod store;
pub mod testing;
pub mod types;

mod gpu;

#[cfg(feature = "distributed")]
pub mod dist;

#[cfg(feature = "distributed")]
pub mod sched;

// General re-exports
pub use config::{Config, RuntimeMode};
pub use error::Error;
pub use ids::{FieldId, GlobalId, RelationId, SubsetId};
pub use kernel::ast::KernelDef;
pub use kernel::{ExecMode, Kernel, LaunchOpts, LaunchStats, SubsetShape, VersionState};
pub use layout::{ArgLayout, Privilege};
pub use reduce::ReduceOp;
pub use relation::{Field, Relation, RelationMode, Subset, SubsetKind};
pub use store::{Global, Processor, RelationShape, Store};
pub use types::{EbbType, ScalarKind, Value};

// Gated re-exports
#[cfg(feature = "io-csv")]
pub use io::csv::{read_field_csv, write_field_csv};

#[cfg(feature = "io-mesh")]
pub use io::mesh::{MeshFile, read_mesh, write_mesh};

#[cfg(feature = "io-mesh")]
pub use io::off::{OffMesh, directed_edges, read_off, write_off};

#[cfg(feature = "distributed")]
pub use dist::Cluster;

#[cfg(feature = "distributed")]
pub use sched::{Scheduler, SignalId};
