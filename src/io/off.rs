//! OFF text meshes and the directed-edge builder.
//!
//! The accepted dialect is the minimal triangle-mesh form: a first line
//! `OFF`, a second line `nV nF 0`, `nV` lines of `x y z`, then `nF` lines
//! of `3 i j k`.

use anyhow::{Context, Result, bail};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

/// A triangle mesh read from an OFF file.
#[derive(Clone, Debug, PartialEq)]
pub struct OffMesh {
    pub positions: Vec<[f64; 3]>,
    pub faces: Vec<[u32; 3]>,
}

impl OffMesh {
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn face_count(&self) -> usize {
        self.faces.len()
    }
}

/// Parse an OFF triangle mesh.
pub fn read_off(path: impl AsRef<Path>) -> Result<OffMesh> {
    let path = path.as_ref();
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut lines = BufReader::new(f)
        .lines()
        .map(|l| l.map_err(anyhow::Error::from))
        .filter(|l| match l {
            Ok(s) => {
                let t = s.trim();
                !t.is_empty() && !t.starts_with('#')
            }
            Err(_) => true,
        });

    let header = lines
        .next()
        .ok_or_else(|| anyhow::anyhow!("{}: empty file", path.display()))??;
    if header.trim() != "OFF" {
        bail!("{}: missing OFF header", path.display());
    }
    let counts = lines
        .next()
        .ok_or_else(|| anyhow::anyhow!("{}: truncated after header", path.display()))??;
    let mut it = counts.split_whitespace();
    let nv: usize = it
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| anyhow::anyhow!("{}: bad vertex count", path.display()))?;
    let nf: usize = it
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| anyhow::anyhow!("{}: bad face count", path.display()))?;

    let mut positions = Vec::with_capacity(nv);
    for i in 0..nv {
        let line = lines
            .next()
            .ok_or_else(|| anyhow::anyhow!("{}: truncated at vertex {i}", path.display()))??;
        let mut it = line.split_whitespace();
        let mut p = [0f64; 3];
        for (a, slot) in p.iter_mut().enumerate() {
            *slot = it
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| {
                    anyhow::anyhow!("{}: bad coordinate {a} at vertex {i}", path.display())
                })?;
        }
        positions.push(p);
    }

    let mut faces = Vec::with_capacity(nf);
    for i in 0..nf {
        let line = lines
            .next()
            .ok_or_else(|| anyhow::anyhow!("{}: truncated at face {i}", path.display()))??;
        let mut it = line.split_whitespace();
        let arity: usize = it
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| anyhow::anyhow!("{}: bad arity at face {i}", path.display()))?;
        if arity != 3 {
            bail!("{}: face {i} has {arity} vertices; only triangles are supported", path.display());
        }
        let mut fce = [0u32; 3];
        for (a, slot) in fce.iter_mut().enumerate() {
            let v: u32 = it
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| anyhow::anyhow!("{}: bad index {a} at face {i}", path.display()))?;
            if v as usize >= nv {
                bail!("{}: face {i} references vertex {v} of {nv}", path.display());
            }
            *slot = v;
        }
        faces.push(fce);
    }

    Ok(OffMesh { positions, faces })
}

/// Write the minimal OFF form back out.
pub fn write_off(path: impl AsRef<Path>, mesh: &OffMesh) -> Result<()> {
    let path = path.as_ref();
    let mut f = File::create(path).with_context(|| format!("create {}", path.display()))?;
    writeln!(f, "OFF")?;
    writeln!(f, "{} {} 0", mesh.positions.len(), mesh.faces.len())?;
    for p in &mesh.positions {
        writeln!(f, "{} {} {}", p[0], p[1], p[2])?;
    }
    for face in &mesh.faces {
        writeln!(f, "3 {} {} {}", face[0], face[1], face[2])?;
    }
    Ok(())
}

/// Build the directed edge list of a triangle mesh: every undirected edge
/// appears twice (once per direction), sorted by tail then head — ready for
/// an edge relation grouped by tail vertex.
pub fn directed_edges(faces: &[[u32; 3]]) -> Vec<(u32, u32)> {
    let mut set = BTreeSet::new();
    for [i, j, k] in faces {
        for (a, b) in [(i, j), (j, k), (k, i)] {
            set.insert((*a, *b));
            set.insert((*b, *a));
        }
    }
    set.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edges_of_one_triangle() {
        let edges = directed_edges(&[[0, 1, 2]]);
        assert_eq!(edges.len(), 6);
        assert_eq!(edges[0], (0, 1));
        assert_eq!(edges[1], (0, 2));
        // sorted by tail, both directions present
        assert!(edges.contains(&(2, 0)) && edges.contains(&(1, 2)));
    }

    #[test]
    fn shared_edges_are_not_duplicated() {
        // two triangles sharing edge (1,2)
        let edges = directed_edges(&[[0, 1, 2], [1, 3, 2]]);
        // 5 undirected edges, stored twice each
        assert_eq!(edges.len(), 10);
    }
}
