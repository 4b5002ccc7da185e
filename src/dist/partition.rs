//! Disjoint blocking of a grid relation over compute nodes.
//!
//! A grid of dims `d₁…d_k` splits into `B = Π bᵢ` axis-aligned blocks. Per
//! axis, the first block absorbs the remainder
//! (`dᵢ − ⌊dᵢ/bᵢ⌋·(bᵢ−1)` rows) and the rest take `⌊dᵢ/bᵢ⌋`. Block
//! `(i₁…i_k)` (1-based) maps to node `1 + Σ (iₐ−1)·Π_{β>α} bᵦ` — row-major,
//! so node ids run `1..=B` and `B` must equal the number of compute nodes.
//!
//! Plain relations get a disjoint coloring instead: row `r` is colored
//! `r / ⌈N/P⌉`.

use crate::error::schema_err;
use anyhow::Result;

/// One block's axis-aligned bounding rectangle; `hi` is inclusive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockBounds {
    pub lo: Vec<u64>,
    pub hi: Vec<u64>,
}

impl BlockBounds {
    /// Extent along one axis.
    pub fn width(&self, axis: usize) -> u64 {
        self.hi[axis] - self.lo[axis] + 1
    }

    pub fn cell_count(&self) -> u64 {
        (0..self.lo.len()).map(|a| self.width(a)).product()
    }

    pub fn contains(&self, coords: &[u64]) -> bool {
        coords
            .iter()
            .enumerate()
            .all(|(a, c)| *c >= self.lo[a] && *c <= self.hi[a])
    }
}

/// A complete disjoint blocking of one grid.
#[derive(Clone, Debug)]
pub struct GridPartition {
    pub dims: Vec<u64>,
    pub blocking: Vec<usize>,
    /// Blocks in row-major block-coordinate order.
    pub blocks: Vec<BlockBounds>,
    /// Compute node (1-based) per block, same order as `blocks`.
    pub map: Vec<usize>,
}

impl GridPartition {
    /// The block assigned to `node`, if any.
    pub fn block_of_node(&self, node: usize) -> Option<&BlockBounds> {
        self.map
            .iter()
            .position(|n| *n == node)
            .map(|i| &self.blocks[i])
    }

    /// Block coordinates (0-based) of the block assigned to `node`.
    pub fn block_coords_of_node(&self, node: usize) -> Option<Vec<usize>> {
        let i = self.map.iter().position(|n| *n == node)?;
        let mut rest = i;
        let mut out = vec![0usize; self.blocking.len()];
        for (a, b) in self.blocking.iter().enumerate().rev() {
            out[a] = rest % b;
            rest /= b;
        }
        Some(out)
    }

    /// The node owning the block at 0-based block coordinates.
    pub fn node_of_block(&self, coords: &[usize]) -> usize {
        let mut linear = 0usize;
        for (c, b) in coords.iter().zip(&self.blocking) {
            linear = linear * b + c;
        }
        self.map[linear]
    }

    /// Node color per grid cell, row-major.
    pub fn colors(&self) -> Vec<u64> {
        let total: u64 = self.dims.iter().product();
        let mut out = vec![0u64; total as usize];
        for (block, node) in self.blocks.iter().zip(&self.map) {
            for_each_cell(&block.lo, &block.hi, |coords| {
                let mut linear = 0u64;
                for (c, d) in coords.iter().zip(&self.dims) {
                    linear = linear * d + c;
                }
                out[linear as usize] = *node as u64;
            });
        }
        out
    }
}

/// Visit every cell of an inclusive rectangle in row-major order.
pub(crate) fn for_each_cell(lo: &[u64], hi: &[u64], mut f: impl FnMut(&[u64])) {
    let k = lo.len();
    let mut coords = lo.to_vec();
    loop {
        f(&coords);
        let mut axis = k;
        loop {
            if axis == 0 {
                return;
            }
            axis -= 1;
            if coords[axis] < hi[axis] {
                coords[axis] += 1;
                break;
            }
            coords[axis] = lo[axis];
        }
    }
}

/// Compute the blocking of `dims` over `blocking` blocks per axis.
/// `Π blocking` must equal the number of compute nodes.
pub fn grid_partition(dims: &[u64], blocking: &[usize], n_nodes: usize) -> Result<GridPartition> {
    if dims.len() != blocking.len() {
        return schema_err(format!(
            "blocking names {} axes for a {}-d grid",
            blocking.len(),
            dims.len()
        ));
    }
    let total: usize = blocking.iter().product();
    if total != n_nodes {
        return schema_err(format!(
            "blocking yields {total} blocks for {n_nodes} compute nodes"
        ));
    }
    // per-axis split points: first block takes the remainder
    let mut axis_extents: Vec<Vec<(u64, u64)>> = Vec::with_capacity(dims.len());
    for (d, b) in dims.iter().zip(blocking) {
        let b64 = *b as u64;
        if b64 == 0 || b64 > *d {
            return schema_err(format!("cannot split an axis of {d} rows into {b} blocks"));
        }
        let rest = d / b64;
        let first = d - rest * (b64 - 1);
        let mut extents = Vec::with_capacity(*b);
        let mut lo = 0u64;
        for i in 0..b64 {
            let w = if i == 0 { first } else { rest };
            extents.push((lo, lo + w - 1));
            lo += w;
        }
        axis_extents.push(extents);
    }

    let mut blocks = Vec::with_capacity(total);
    let mut map = Vec::with_capacity(total);
    let lo_idx = vec![0u64; dims.len()];
    let hi_idx: Vec<u64> = blocking.iter().map(|b| *b as u64 - 1).collect();
    for_each_cell(&lo_idx, &hi_idx, |bcoords| {
        let mut lo = Vec::with_capacity(dims.len());
        let mut hi = Vec::with_capacity(dims.len());
        for (a, bc) in bcoords.iter().enumerate() {
            let (l, h) = axis_extents[a][*bc as usize];
            lo.push(l);
            hi.push(h);
        }
        blocks.push(BlockBounds { lo, hi });
        // row-major node assignment, nodes are 1-based
        let mut linear = 0usize;
        for (bc, b) in bcoords.iter().zip(blocking) {
            linear = linear * b + *bc as usize;
        }
        map.push(1 + linear);
    });

    Ok(GridPartition {
        dims: dims.to_vec(),
        blocking: blocking.to_vec(),
        blocks,
        map,
    })
}

/// Disjoint coloring of a plain relation: row `r` gets color `r / ⌈N/P⌉`.
pub fn plain_colors(n_rows: u64, parts: u64) -> Vec<u64> {
    let parts = parts.max(1);
    let per = n_rows.div_ceil(parts).max(1);
    (0..n_rows).map(|r| r / per).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_block_takes_the_remainder() -> Result<()> {
        let p = grid_partition(&[10], &[3], 3)?;
        // 10 = 4 + 3 + 3
        assert_eq!(p.blocks[0], BlockBounds { lo: vec![0], hi: vec![3] });
        assert_eq!(p.blocks[1], BlockBounds { lo: vec![4], hi: vec![6] });
        assert_eq!(p.blocks[2], BlockBounds { lo: vec![7], hi: vec![9] });
        assert_eq!(p.map, vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn row_major_node_map_2d() -> Result<()> {
        let p = grid_partition(&[4, 6], &[2, 3], 6)?;
        assert_eq!(p.map, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(p.node_of_block(&[0, 0]), 1);
        assert_eq!(p.node_of_block(&[0, 2]), 3);
        assert_eq!(p.node_of_block(&[1, 0]), 4);
        assert_eq!(p.block_coords_of_node(5), Some(vec![1, 1]));
        Ok(())
    }

    #[test]
    fn blocks_are_disjoint_and_cover() -> Result<()> {
        let p = grid_partition(&[5, 7], &[2, 2], 4)?;
        let covered: u64 = p.blocks.iter().map(BlockBounds::cell_count).sum();
        assert_eq!(covered, 35);
        let colors = p.colors();
        assert!(colors.iter().all(|c| (1..=4).contains(&(*c as usize))));
        Ok(())
    }

    #[test]
    fn block_count_must_match_nodes() {
        assert!(grid_partition(&[8], &[3], 4).is_err());
    }

    #[test]
    fn plain_coloring() {
        let c = plain_colors(10, 3);
        // ceil(10/3) = 4 rows per color
        assert_eq!(c, vec![0, 0, 0, 0, 1, 1, 1, 1, 2, 2]);
    }
}
