//! Distributed mode: grid partitioning, ghost-exchange channels, and the
//! event-driven control plane over an in-process node fleet.
//!
//! Enable at runtime with the experimental-signals toggle (or
//! `Config::builder().mode(RuntimeMode::Distributed)`); the fleet size
//! comes from the num-partitions setting.

pub mod events;
pub mod ghost;
pub mod node;
pub mod partition;

pub use events::{AccessKind, Envelope, EventName};
pub use ghost::{ChannelKey, ChannelTable, GhostChannels, GhostRegion, ghost_id, neighbor_offsets};
pub use node::{Cluster, TaskCtx, TaskField, TaskFn};
pub use partition::{BlockBounds, GridPartition, grid_partition, plain_colors};
