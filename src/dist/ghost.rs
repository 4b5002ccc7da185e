//! Ghost-exchange channels: per-neighbor halo buffers over buffered
//! channels.
//!
//! For each non-zero offset `o ∈ {-1,0,+1}^d` a block owns two strips: an
//! *inner* strip (its own cells that the neighbor reads) and an *outer*
//! strip (the neighbor's cells mirrored locally). Strips span the ghost
//! depth on displaced axes and the partition width elsewhere, and carry raw
//! little-endian bytes.
//!
//! Channel endpoints pair up asynchronously through a shared
//! [`ChannelTable`] keyed by `(hid_base, src_node, dst_node, ghost_id)`;
//! either side may arrive first. `ghost_id ∈ [0, 3^d)` is the base-3
//! packing of the offset. When the neighbor block would fall outside the
//! blocking grid and the axis is not periodic, no channel is created — that
//! border is simply empty.
//!
//! A buffer whose size does not match the receiving strip is a
//! [`Protocol`](crate::error::Error::Protocol) error, fatal to the node
//! that observes it.

use crate::dist::partition::{BlockBounds, GridPartition, for_each_cell};
use crate::error::Error;
use anyhow::{Result, anyhow};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::collections::HashMap;
use std::sync::Mutex;

/// All non-zero neighbor offsets of a `d`-dimensional block, in ghost-id
/// order.
pub fn neighbor_offsets(d: usize) -> Vec<Vec<i64>> {
    let total = 3usize.pow(d as u32);
    let mut out = Vec::with_capacity(total - 1);
    for id in 0..total {
        let mut rest = id;
        let mut offset = vec![0i64; d];
        for a in (0..d).rev() {
            offset[a] = (rest % 3) as i64 - 1;
            rest /= 3;
        }
        if offset.iter().any(|o| *o != 0) {
            out.push(offset);
        }
    }
    out
}

/// Base-3 packing of an offset vector: each axis digit is `o + 1`.
pub fn ghost_id(offset: &[i64]) -> usize {
    offset.iter().fold(0usize, |acc, o| acc * 3 + (*o + 1) as usize)
}

/// An axis-decomposed cell region: explicit (already wrapped) coordinates
/// per axis; the region is their cartesian product in row-major order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GhostRegion {
    pub axes: Vec<Vec<u64>>,
}

impl GhostRegion {
    pub fn cell_count(&self) -> u64 {
        self.axes.iter().map(|a| a.len() as u64).product()
    }

    pub fn contains(&self, coords: &[u64]) -> bool {
        coords
            .iter()
            .zip(&self.axes)
            .all(|(c, axis)| axis.contains(c))
    }

    /// Row-major position of `coords` inside the region, if present.
    pub fn position_of(&self, coords: &[u64]) -> Option<u64> {
        let mut pos = 0u64;
        for (c, axis) in coords.iter().zip(&self.axes) {
            let i = axis.iter().position(|x| x == c)? as u64;
            pos = pos * axis.len() as u64 + i;
        }
        Some(pos)
    }

    /// Visit every cell in row-major order.
    pub fn for_each(&self, mut f: impl FnMut(&[u64])) {
        if self.axes.iter().any(Vec::is_empty) {
            return;
        }
        let lo: Vec<u64> = vec![0; self.axes.len()];
        let hi: Vec<u64> = self.axes.iter().map(|a| a.len() as u64 - 1).collect();
        let mut scratch = vec![0u64; self.axes.len()];
        for_each_cell(&lo, &hi, |idx| {
            for (a, i) in idx.iter().enumerate() {
                scratch[a] = self.axes[a][*i as usize];
            }
            f(&scratch);
        });
    }
}

/// The block-owned strip of cells a neighbor at `offset` reads.
pub fn inner_region(block: &BlockBounds, offset: &[i64], depth: u64) -> GhostRegion {
    let axes = offset
        .iter()
        .enumerate()
        .map(|(a, o)| {
            let (lo, hi) = (block.lo[a], block.hi[a]);
            let depth = depth.min(hi - lo + 1);
            match *o {
                0 => (lo..=hi).collect(),
                1 => (hi + 1 - depth..=hi).collect(),
                _ => (lo..=lo + depth - 1).collect(),
            }
        })
        .collect();
    GhostRegion { axes }
}

/// The strip just outside the block toward `offset`, with periodic wrap.
/// `None` when the strip leaves a non-periodic axis.
pub fn outer_region(
    block: &BlockBounds,
    offset: &[i64],
    depth: u64,
    dims: &[u64],
    periodic: &[bool],
) -> Option<GhostRegion> {
    let mut axes = Vec::with_capacity(offset.len());
    for (a, o) in offset.iter().enumerate() {
        let (lo, hi, d) = (block.lo[a], block.hi[a], dims[a]);
        let axis: Vec<u64> = match *o {
            0 => (lo..=hi).collect(),
            1 => {
                let cells: Vec<i64> = (1..=depth as i64).map(|k| hi as i64 + k).collect();
                wrap_axis(&cells, d, periodic[a])?
            }
            _ => {
                let cells: Vec<i64> = (1..=depth as i64).rev().map(|k| lo as i64 - k).collect();
                wrap_axis(&cells, d, periodic[a])?
            }
        };
        axes.push(axis);
    }
    Some(GhostRegion { axes })
}

fn wrap_axis(cells: &[i64], dim: u64, periodic: bool) -> Option<Vec<u64>> {
    let mut out = Vec::with_capacity(cells.len());
    for c in cells {
        if *c < 0 || *c as u64 >= dim {
            if !periodic {
                return None;
            }
            out.push(c.rem_euclid(dim as i64) as u64);
        } else {
            out.push(*c as u64);
        }
    }
    Some(out)
}

/// Copy a region out of a block-local row-major column.
pub fn gather(bytes: &[u8], elem: usize, block: &BlockBounds, region: &GhostRegion) -> Vec<u8> {
    let mut out = Vec::with_capacity(region.cell_count() as usize * elem);
    region.for_each(|coords| {
        let off = block_linear(block, coords) * elem;
        out.extend_from_slice(&bytes[off..off + elem]);
    });
    out
}

/// Row-major linear index of a global coordinate inside a block's storage.
pub fn block_linear(block: &BlockBounds, coords: &[u64]) -> usize {
    let mut linear = 0u64;
    for (a, c) in coords.iter().enumerate() {
        linear = linear * block.width(a) + (c - block.lo[a]);
    }
    linear as usize
}

/// Channel endpoint identity: which field instance, which direction, which
/// neighbor offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub hid_base: u64,
    pub src: usize,
    pub dst: usize,
    pub ghost_id: usize,
}

struct ChannelPair {
    tx: Sender<Vec<u8>>,
    rx: Option<Receiver<Vec<u8>>>,
}

/// Shared rendezvous for channel construction: each side asks for its
/// endpoint whenever it gets there, and the table lazily materializes the
/// matching source/destination pair.
#[derive(Default)]
pub struct ChannelTable {
    inner: Mutex<HashMap<ChannelKey, ChannelPair>>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn pair<'a>(
        map: &'a mut HashMap<ChannelKey, ChannelPair>,
        key: ChannelKey,
    ) -> &'a mut ChannelPair {
        map.entry(key).or_insert_with(|| {
            let (tx, rx) = unbounded();
            ChannelPair { tx, rx: Some(rx) }
        })
    }

    /// The sending endpoint for `key`.
    pub fn source(&self, key: ChannelKey) -> Sender<Vec<u8>> {
        let mut map = self.inner.lock().unwrap();
        Self::pair(&mut map, key).tx.clone()
    }

    /// The receiving endpoint for `key`. Each key has exactly one receiver.
    pub fn dest(&self, key: ChannelKey) -> Result<Receiver<Vec<u8>>> {
        let mut map = self.inner.lock().unwrap();
        Self::pair(&mut map, key)
            .rx
            .take()
            .ok_or_else(|| anyhow!(Error::Protocol(format!("duplicate destination for {key:?}"))))
    }
}

/// One neighbor's pair of strips plus its channel endpoints.
pub struct GhostLink {
    pub offset: Vec<i64>,
    pub ghost_id: usize,
    pub inner: GhostRegion,
    pub outer: GhostRegion,
    send: Sender<Vec<u8>>,
    recv: Receiver<Vec<u8>>,
}

/// All ghost links of one field on one node.
pub struct GhostChannels {
    pub links: Vec<GhostLink>,
    block: BlockBounds,
    elem: usize,
}

impl GhostChannels {
    /// Construct every link this node's block needs for one field.
    /// `hid_base` identifies the field instance across the cluster.
    pub fn build(
        table: &ChannelTable,
        hid_base: u64,
        node: usize,
        partition: &GridPartition,
        periodic: &[bool],
        depth: u64,
        elem: usize,
    ) -> Result<GhostChannels> {
        let block = partition
            .block_of_node(node)
            .ok_or_else(|| anyhow!(Error::Protocol(format!("node {node} owns no block"))))?
            .clone();
        let bcoords = partition.block_coords_of_node(node).expect("block exists");

        let mut links = Vec::new();
        for offset in neighbor_offsets(partition.dims.len()) {
            let Some(nbr) = neighbor_block(partition, &bcoords, &offset, periodic) else {
                continue;
            };
            let Some(outer) =
                outer_region(&block, &offset, depth, &partition.dims, periodic)
            else {
                continue;
            };
            let inner = inner_region(&block, &offset, depth);
            let reverse: Vec<i64> = offset.iter().map(|o| -o).collect();
            let gid = ghost_id(&offset);
            let send = table.source(ChannelKey { hid_base, src: node, dst: nbr, ghost_id: gid });
            let recv = table.dest(ChannelKey {
                hid_base,
                src: nbr,
                dst: node,
                ghost_id: ghost_id(&reverse),
            })?;
            links.push(GhostLink { offset, ghost_id: gid, inner, outer, send, recv });
        }
        Ok(GhostChannels { links, block, elem })
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Send phase: gather every inner strip from the block column and push
    /// it down its channel.
    pub fn send_all(&self, bytes: &[u8]) -> Result<()> {
        for l in &self.links {
            let buf = gather(bytes, self.elem, &self.block, &l.inner);
            l.send
                .send(buf)
                .map_err(|_| anyhow!(Error::Protocol("ghost channel closed".into())))?;
        }
        Ok(())
    }

    /// Receive phase: pull one buffer per link and store it as the outer
    /// strip, checking sizes.
    pub fn recv_all(&self, outer: &mut HashMap<usize, Vec<u8>>) -> Result<()> {
        for l in &self.links {
            let buf = l
                .recv
                .recv()
                .map_err(|_| anyhow!(Error::Protocol("ghost channel closed".into())))?;
            let want = l.outer.cell_count() as usize * self.elem;
            if buf.len() != want {
                return Err(anyhow!(Error::Protocol(format!(
                    "neighbor buffer is {} bytes, outer strip needs {want}",
                    buf.len()
                ))));
            }
            outer.insert(l.ghost_id, buf);
        }
        Ok(())
    }

    /// Full exchange: buffered sends first, then receives — every node
    /// doing the same never deadlocks.
    pub fn exchange(&self, bytes: &[u8], outer: &mut HashMap<usize, Vec<u8>>) -> Result<()> {
        self.send_all(bytes)?;
        self.recv_all(outer)
    }

    /// Read one cell of the mirrored neighbor data.
    pub fn read_outer(
        &self,
        outer: &HashMap<usize, Vec<u8>>,
        coords: &[u64],
    ) -> Option<Vec<u8>> {
        for l in &self.links {
            if let Some(pos) = l.outer.position_of(coords) {
                let buf = outer.get(&l.ghost_id)?;
                let off = pos as usize * self.elem;
                return Some(buf[off..off + self.elem].to_vec());
            }
        }
        None
    }
}

/// The neighbor block's owning node, or `None` past a non-periodic border.
fn neighbor_block(
    partition: &GridPartition,
    bcoords: &[usize],
    offset: &[i64],
    periodic: &[bool],
) -> Option<usize> {
    let mut nbr = Vec::with_capacity(bcoords.len());
    for (a, o) in offset.iter().enumerate() {
        let b = partition.blocking[a] as i64;
        let mut c = bcoords[a] as i64 + o;
        if c < 0 || c >= b {
            if !periodic[a] {
                return None;
            }
            c = c.rem_euclid(b);
        }
        nbr.push(c as usize);
    }
    Some(partition.node_of_block(&nbr))
}
