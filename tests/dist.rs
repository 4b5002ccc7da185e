#![cfg(feature = "distributed")]

//! Partitioner geometry, ghost strips, and the event-driven cluster.

use meshflow::dist::events::AccessKind;
use meshflow::dist::ghost::{ghost_id, inner_region, neighbor_offsets, outer_region};
use meshflow::dist::partition::{BlockBounds, grid_partition};
use meshflow::dist::{Cluster, TaskCtx};
use meshflow::types::Value;
use meshflow::*;
use std::sync::Arc;

#[test]
fn neighbor_offset_enumeration() {
    assert_eq!(neighbor_offsets(1).len(), 2);
    assert_eq!(neighbor_offsets(2).len(), 8);
    assert_eq!(neighbor_offsets(3).len(), 26);
    // packing is base 3 with digits o+1, so ids are distinct and in range
    for o in neighbor_offsets(3) {
        let id = ghost_id(&o);
        assert!(id < 27);
        assert_ne!(id, 13); // the zero offset
    }
}

#[test]
fn inner_and_outer_strips_1d() {
    let block = BlockBounds { lo: vec![4], hi: vec![7] };
    let dims = vec![12u64];

    let inner = inner_region(&block, &[1], 2);
    assert_eq!(inner.axes, vec![vec![6, 7]]);
    let inner = inner_region(&block, &[-1], 2);
    assert_eq!(inner.axes, vec![vec![4, 5]]);

    let outer = outer_region(&block, &[1], 2, &dims, &[false]).unwrap();
    assert_eq!(outer.axes, vec![vec![8, 9]]);
    let outer = outer_region(&block, &[-1], 2, &dims, &[false]).unwrap();
    assert_eq!(outer.axes, vec![vec![2, 3]]);

    // past the grid on a non-periodic axis: no strip, no channel
    let edge_block = BlockBounds { lo: vec![0], hi: vec![3] };
    assert!(outer_region(&edge_block, &[-1], 2, &dims, &[false]).is_none());
    // with periodicity the strip wraps
    let wrapped = outer_region(&edge_block, &[-1], 2, &dims, &[true]).unwrap();
    assert_eq!(wrapped.axes, vec![vec![10, 11]]);
}

#[test]
fn strips_span_partition_width_on_undisplaced_axes() {
    let block = BlockBounds { lo: vec![0, 4], hi: vec![3, 7] };
    let inner = inner_region(&block, &[0, 1], 2);
    // axis 0 undisplaced: full block width; axis 1 displaced: depth 2
    assert_eq!(inner.axes[0], vec![0, 1, 2, 3]);
    assert_eq!(inner.axes[1], vec![6, 7]);
    assert_eq!(inner.cell_count(), 8);
}

#[test]
fn cluster_builds_relations_fields_and_constants() -> anyhow::Result<()> {
    let config = Config::builder().mode(RuntimeMode::Distributed).num_partitions(2).build();
    let mut cluster = Cluster::launch(&config)?;
    assert_eq!(cluster.compute_nodes(), 2);

    let rel = cluster.new_relation("cells", &[8], &[false])?;
    cluster.partition(rel, &[2])?;
    let u = cluster.new_field(rel, "u", EbbType::scalar(ScalarKind::F64))?;
    cluster.prepare_field(rel, u)?;
    cluster.load_constant(rel, u, Value::F64(2.5))?;

    // each node holds a 4-cell shard filled with the constant
    for node in 1..=2 {
        let bytes = cluster.fetch_field(rel, u, node)?;
        assert_eq!(bytes.len(), 4 * 8);
        for cell in bytes.chunks(8) {
            assert_eq!(f64::from_le_bytes(cell.try_into().unwrap()), 2.5);
        }
    }
    Ok(())
}

#[test]
fn ghost_exchange_carries_neighbor_data() -> anyhow::Result<()> {
    let config = Config::builder().mode(RuntimeMode::Distributed).num_partitions(3).build();
    let mut cluster = Cluster::launch(&config)?;

    let rel = cluster.new_relation("cells", &[12], &[false])?;
    cluster.partition(rel, &[3])?;
    let u = cluster.new_field(rel, "u", EbbType::scalar(ScalarKind::F64))?;
    cluster.prepare_field(rel, u)?;
    cluster.load_constant(rel, u, Value::F64(0.0))?;

    // pass 1: every node stamps its id over its block
    let stamp = cluster.define_task(
        "stamp",
        rel,
        vec![(u, AccessKind::ReadWrite)],
        Arc::new(|ctx: &mut TaskCtx| {
            let block = ctx.block.clone();
            let me = ctx.node as f64;
            let f = ctx.field_mut("u").unwrap();
            for c in block.lo[0]..=block.hi[0] {
                f.write(&block, &[c], &Value::F64(me))?;
            }
            Ok(())
        }),
    )?;
    cluster.launch_task(stamp)?;

    // pass 2: the exchange runs before the body, so each node can see its
    // left neighbor's stamp; record it in the first cell of the block
    let probe = cluster.define_task(
        "probe_left",
        rel,
        vec![(u, AccessKind::ReadWrite)],
        Arc::new(|ctx: &mut TaskCtx| {
            let block = ctx.block.clone();
            let left = if block.lo[0] == 0 {
                Value::F64(-1.0)
            } else {
                ctx.field("u").unwrap().read(&block, &[block.lo[0] - 1])?
            };
            let f = ctx.field_mut("u").unwrap();
            f.write(&block, &[block.lo[0]], &left)?;
            Ok(())
        }),
    )?;
    cluster.launch_task(probe)?;

    let first_cell = |node: usize| -> anyhow::Result<f64> {
        let bytes = cluster.fetch_field(rel, u, node)?;
        Ok(f64::from_le_bytes(bytes[0..8].try_into().unwrap()))
    };
    assert_eq!(first_cell(1)?, -1.0); // no left neighbor on a closed border
    assert_eq!(first_cell(2)?, 1.0);
    assert_eq!(first_cell(3)?, 2.0);
    Ok(())
}

#[test]
fn periodic_ghosts_wrap_around() -> anyhow::Result<()> {
    let config = Config::builder().mode(RuntimeMode::Distributed).num_partitions(2).build();
    let mut cluster = Cluster::launch(&config)?;

    let rel = cluster.new_relation("ring", &[8], &[true])?;
    cluster.partition(rel, &[2])?;
    let u = cluster.new_field(rel, "u", EbbType::scalar(ScalarKind::F64))?;
    cluster.prepare_field(rel, u)?;
    cluster.load_constant(rel, u, Value::F64(0.0))?;

    let stamp = cluster.define_task(
        "stamp",
        rel,
        vec![(u, AccessKind::ReadWrite)],
        Arc::new(|ctx: &mut TaskCtx| {
            let block = ctx.block.clone();
            let me = ctx.node as f64;
            let f = ctx.field_mut("u").unwrap();
            for c in block.lo[0]..=block.hi[0] {
                f.write(&block, &[c], &Value::F64(me))?;
            }
            Ok(())
        }),
    )?;
    cluster.launch_task(stamp)?;

    // node 1's left neighbor wraps to node 2's last cell
    let probe = cluster.define_task(
        "probe_wrap",
        rel,
        vec![(u, AccessKind::ReadWrite)],
        Arc::new(|ctx: &mut TaskCtx| {
            let block = ctx.block.clone();
            let dims = ctx.dims.clone();
            let left_coord = if block.lo[0] == 0 { dims[0] - 1 } else { block.lo[0] - 1 };
            let left = ctx.field("u").unwrap().read(&block, &[left_coord])?;
            let f = ctx.field_mut("u").unwrap();
            f.write(&block, &[block.lo[0]], &left)?;
            Ok(())
        }),
    )?;
    cluster.launch_task(probe)?;

    let bytes = cluster.fetch_field(rel, u, 1)?;
    assert_eq!(f64::from_le_bytes(bytes[0..8].try_into().unwrap()), 2.0);
    Ok(())
}

#[test]
fn partitioner_rejects_mismatched_fleet() {
    assert!(grid_partition(&[8, 8], &[2, 2], 5).is_err());
}
