//! The binary mesh file format (little-endian).
//!
//! A fixed header carries the magic (`0x18111022`), element counts
//! (vertices, edges, faces, cells, facet-edges, boundary sets), and file
//! offsets to the field table, the facet-edge table, and the boundary-set
//! table. Facet-edge records pair a face/edge with two half-facets (cell id
//! + vertex id). Boundary sets declare an element type byte (high bit
//! `0x80` marks an aggregated set), an inclusive-exclusive `[start, end)`
//! range, and the offset of a NUL-terminated name. Field records carry a
//! domain element type, a base type with vector/matrix flags and dims, an
//! element count, and offsets to the name and the raw row-major data.
//! Vertex positions trail the file as `double[3]` triples.
//!
//! Missing files, truncation, and a wrong magic are ordinary error returns
//! with a diagnostic; nothing aborts.

use crate::types::{EbbType, ScalarKind};
use anyhow::{Context, Result, bail};
use std::fs;
use std::path::Path;

pub const MESH_MAGIC: u32 = 0x1811_1022;

/// Element domains a boundary set or field can live on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MeshElement {
    Vertex,
    Edge,
    Face,
    Cell,
}

impl MeshElement {
    fn to_byte(self) -> u8 {
        match self {
            MeshElement::Vertex => 0,
            MeshElement::Edge => 1,
            MeshElement::Face => 2,
            MeshElement::Cell => 3,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        Ok(match b {
            0 => MeshElement::Vertex,
            1 => MeshElement::Edge,
            2 => MeshElement::Face,
            3 => MeshElement::Cell,
            _ => bail!("unknown mesh element type {b}"),
        })
    }
}

/// One side of a facet-edge record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HalfFacet {
    pub cell: u64,
    pub vertex: u64,
}

/// A face/edge pairing with its two half-facets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FacetEdge {
    pub face_edge: u64,
    pub hf: [HalfFacet; 2],
}

/// A named element range `[start, end)`.
#[derive(Clone, Debug, PartialEq)]
pub struct BoundarySet {
    pub element: MeshElement,
    pub aggregated: bool,
    pub start: u64,
    pub end: u64,
    pub name: String,
}

/// A field record: a named raw column over one element domain.
#[derive(Clone, Debug, PartialEq)]
pub struct MeshFieldRecord {
    pub domain: MeshElement,
    pub ty: EbbType,
    pub name: String,
    pub elem_count: u64,
    /// Row-major raw data, `elem_count * ty.size_of()` bytes.
    pub data: Vec<u8>,
}

/// Mesh element counts from the header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MeshCounts {
    pub vertices: u64,
    pub edges: u64,
    pub faces: u64,
    pub cells: u64,
    pub facet_edges: u64,
    pub boundaries: u64,
}

/// An entire parsed mesh file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeshFile {
    pub counts: MeshCounts,
    pub facet_edges: Vec<FacetEdge>,
    pub boundaries: Vec<BoundarySet>,
    pub fields: Vec<MeshFieldRecord>,
    pub positions: Vec<[f64; 3]>,
}

fn base_type_byte(ty: &EbbType) -> Result<(u8, u8, u8, u8)> {
    fn base(k: ScalarKind) -> Result<u8> {
        Ok(match k {
            ScalarKind::I32 => 0,
            ScalarKind::F32 => 1,
            ScalarKind::F64 => 2,
            ScalarKind::Bool => 3,
            ScalarKind::U64 => 4,
        })
    }
    Ok(match ty {
        EbbType::Scalar(k) => (base(*k)?, 0, 0, 0),
        EbbType::Vector { elem, len } => (base(*elem)?, 1, *len as u8, 0),
        EbbType::Matrix { elem, rows, cols } => (base(*elem)?, 2, *rows as u8, *cols as u8),
        EbbType::Key { .. } => bail!("key fields are not representable in mesh files"),
    })
}

fn type_from_bytes(base: u8, flags: u8, d0: u8, d1: u8) -> Result<EbbType> {
    let kind = match base {
        0 => ScalarKind::I32,
        1 => ScalarKind::F32,
        2 => ScalarKind::F64,
        3 => ScalarKind::Bool,
        4 => ScalarKind::U64,
        _ => bail!("unknown base type {base}"),
    };
    Ok(match flags {
        0 => EbbType::Scalar(kind),
        1 => EbbType::vector(kind, d0 as usize),
        2 => EbbType::matrix(kind, d0 as usize, d1 as usize),
        _ => bail!("unknown field flags {flags}"),
    })
}

/// Serialize a mesh to its binary form.
pub fn write_mesh(path: impl AsRef<Path>, mesh: &MeshFile) -> Result<()> {
    let path = path.as_ref();
    let mut out = Vec::new();

    // header: magic, six counts, three table offsets (patched below)
    out.extend_from_slice(&MESH_MAGIC.to_le_bytes());
    for c in [
        mesh.counts.vertices,
        mesh.counts.edges,
        mesh.counts.faces,
        mesh.counts.cells,
        mesh.facet_edges.len() as u64,
        mesh.boundaries.len() as u64,
    ] {
        out.extend_from_slice(&c.to_le_bytes());
    }
    let offsets_at = out.len();
    out.extend_from_slice(&[0u8; 24]); // field, facet-edge, boundary offsets

    // facet-edge table
    let facet_edge_off = out.len() as u64;
    for fe in &mesh.facet_edges {
        out.extend_from_slice(&fe.face_edge.to_le_bytes());
        for h in &fe.hf {
            out.extend_from_slice(&h.cell.to_le_bytes());
            out.extend_from_slice(&h.vertex.to_le_bytes());
        }
    }

    // boundary table: records first, then the name pool
    let boundary_off = out.len() as u64;
    let mut name_patches = Vec::new();
    for b in &mesh.boundaries {
        let ty = b.element.to_byte() | if b.aggregated { 0x80 } else { 0 };
        out.push(ty);
        out.extend_from_slice(&b.start.to_le_bytes());
        out.extend_from_slice(&b.end.to_le_bytes());
        name_patches.push(out.len());
        out.extend_from_slice(&[0u8; 8]);
    }
    for (b, patch) in mesh.boundaries.iter().zip(&name_patches) {
        let off = out.len() as u64;
        out[*patch..*patch + 8].copy_from_slice(&off.to_le_bytes());
        out.extend_from_slice(b.name.as_bytes());
        out.push(0);
    }

    // field table: record count, records, name pool, data pool
    let field_off = out.len() as u64;
    out.extend_from_slice(&(mesh.fields.len() as u64).to_le_bytes());
    let mut field_patches = Vec::new();
    for f in &mesh.fields {
        let (base, flags, d0, d1) = base_type_byte(&f.ty)?;
        out.push(f.domain.to_byte());
        out.push(base);
        out.push(flags);
        out.push(d0);
        out.push(d1);
        out.extend_from_slice(&f.elem_count.to_le_bytes());
        field_patches.push(out.len());
        out.extend_from_slice(&[0u8; 16]); // name offset, data offset
    }
    for (f, patch) in mesh.fields.iter().zip(&field_patches) {
        let name_off = out.len() as u64;
        out[*patch..*patch + 8].copy_from_slice(&name_off.to_le_bytes());
        out.extend_from_slice(f.name.as_bytes());
        out.push(0);
    }
    for (f, patch) in mesh.fields.iter().zip(&field_patches) {
        let data_off = out.len() as u64;
        out[*patch + 8..*patch + 16].copy_from_slice(&data_off.to_le_bytes());
        if f.data.len() as u64 != f.elem_count * f.ty.size_of() as u64 {
            bail!(
                "field `{}`: {} data bytes for {} elements of {:?}",
                f.name,
                f.data.len(),
                f.elem_count,
                f.ty
            );
        }
        out.extend_from_slice(&f.data);
    }

    // patch the table offsets
    out[offsets_at..offsets_at + 8].copy_from_slice(&field_off.to_le_bytes());
    out[offsets_at + 8..offsets_at + 16].copy_from_slice(&facet_edge_off.to_le_bytes());
    out[offsets_at + 16..offsets_at + 24].copy_from_slice(&boundary_off.to_le_bytes());

    // positions trail the file
    if mesh.positions.len() as u64 != mesh.counts.vertices {
        bail!(
            "{} positions for {} vertices",
            mesh.positions.len(),
            mesh.counts.vertices
        );
    }
    for p in &mesh.positions {
        for c in p {
            out.extend_from_slice(&c.to_le_bytes());
        }
    }

    fs::write(path, out).with_context(|| format!("write {}", path.display()))
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn at(bytes: &'a [u8], pos: usize) -> Self {
        Self { bytes, pos }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            bail!("truncated mesh file at offset {}", self.pos);
        }
        let s = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

fn read_cstr(bytes: &[u8], off: u64) -> Result<String> {
    let start = off as usize;
    let end = bytes[start..]
        .iter()
        .position(|b| *b == 0)
        .map(|p| start + p)
        .ok_or_else(|| anyhow::anyhow!("unterminated name string at offset {off}"))?;
    Ok(String::from_utf8_lossy(&bytes[start..end]).into_owned())
}

/// Parse a binary mesh file.
pub fn read_mesh(path: impl AsRef<Path>) -> Result<MeshFile> {
    let path = path.as_ref();
    let bytes = fs::read(path).with_context(|| format!("open {}", path.display()))?;
    let mut cur = Cursor::at(&bytes, 0);

    let magic = cur.u32()?;
    if magic != MESH_MAGIC {
        bail!(
            "{}: bad magic {magic:#010x}, expected {MESH_MAGIC:#010x}",
            path.display()
        );
    }
    let counts = MeshCounts {
        vertices: cur.u64()?,
        edges: cur.u64()?,
        faces: cur.u64()?,
        cells: cur.u64()?,
        facet_edges: cur.u64()?,
        boundaries: cur.u64()?,
    };
    let field_off = cur.u64()?;
    let facet_edge_off = cur.u64()?;
    let boundary_off = cur.u64()?;

    let mut cur = Cursor::at(&bytes, facet_edge_off as usize);
    let mut facet_edges = Vec::with_capacity(counts.facet_edges as usize);
    for _ in 0..counts.facet_edges {
        facet_edges.push(FacetEdge {
            face_edge: cur.u64()?,
            hf: [
                HalfFacet { cell: cur.u64()?, vertex: cur.u64()? },
                HalfFacet { cell: cur.u64()?, vertex: cur.u64()? },
            ],
        });
    }

    let mut cur = Cursor::at(&bytes, boundary_off as usize);
    let mut boundaries = Vec::with_capacity(counts.boundaries as usize);
    for _ in 0..counts.boundaries {
        let ty = cur.u8()?;
        let start = cur.u64()?;
        let end = cur.u64()?;
        let name_off = cur.u64()?;
        boundaries.push(BoundarySet {
            element: MeshElement::from_byte(ty & 0x7f)?,
            aggregated: ty & 0x80 != 0,
            start,
            end,
            name: read_cstr(&bytes, name_off)?,
        });
    }

    let mut cur = Cursor::at(&bytes, field_off as usize);
    let n_fields = cur.u64()?;
    let mut fields = Vec::with_capacity(n_fields as usize);
    for _ in 0..n_fields {
        let domain = MeshElement::from_byte(cur.u8()?)?;
        let base = cur.u8()?;
        let flags = cur.u8()?;
        let d0 = cur.u8()?;
        let d1 = cur.u8()?;
        let elem_count = cur.u64()?;
        let name_off = cur.u64()?;
        let data_off = cur.u64()?;
        let ty = type_from_bytes(base, flags, d0, d1)?;
        let len = elem_count as usize * ty.size_of();
        if data_off as usize + len > bytes.len() {
            bail!("{}: field data out of range", path.display());
        }
        fields.push(MeshFieldRecord {
            domain,
            name: read_cstr(&bytes, name_off)?,
            ty,
            elem_count,
            data: bytes[data_off as usize..data_off as usize + len].to_vec(),
        });
    }

    // positions trail the file
    let pos_bytes = counts.vertices as usize * 24;
    if pos_bytes > bytes.len() {
        bail!("{}: truncated position array", path.display());
    }
    let mut cur = Cursor::at(&bytes, bytes.len() - pos_bytes);
    let mut positions = Vec::with_capacity(counts.vertices as usize);
    for _ in 0..counts.vertices {
        positions.push([cur.f64()?, cur.f64()?, cur.f64()?]);
    }

    Ok(MeshFile { counts, facet_edges, boundaries, fields, positions })
}
