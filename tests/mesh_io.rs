#![cfg(all(feature = "io-mesh", feature = "io-csv"))]

use meshflow::io::mesh::{BoundarySet, FacetEdge, HalfFacet, MeshCounts, MeshElement, MeshFieldRecord};
use meshflow::testing::*;
use meshflow::types::Value;
use meshflow::*;
use std::io::Write;

/// The octahedron: 6 vertices, 8 triangles, 12 undirected edges.
const OCTAHEDRON: &str = "OFF\n6 8 0\n\
    1 0 0\n-1 0 0\n0 1 0\n0 -1 0\n0 0 1\n0 0 -1\n\
    3 0 2 4\n3 2 1 4\n3 1 3 4\n3 3 0 4\n\
    3 2 0 5\n3 1 2 5\n3 3 1 5\n3 0 3 5\n";

#[test]
fn octahedron_edge_build() -> anyhow::Result<()> {
    let dir = scratch_dir();
    let path = dir.path().join("octahedron.off");
    std::fs::File::create(&path)?.write_all(OCTAHEDRON.as_bytes())?;

    let mesh = read_off(&path)?;
    assert_eq!(mesh.vertex_count(), 6);
    assert_eq!(mesh.face_count(), 8);

    // each undirected edge stored twice
    let edge_list = directed_edges(&mesh.faces);
    assert_eq!(edge_list.len(), 24);

    // build the edge relation grouped by tail vertex
    let store = Store::default();
    let verts = store.new_relation("vertices", RelationShape::Plain { size: 6 })?;
    let edges = store.new_relation("edges", RelationShape::Plain { size: 24 })?;
    let tail = edges.new_field("tail", verts.key_type())?;
    let head = edges.new_field("head", verts.key_type())?;
    let tails: Vec<Value> = edge_list.iter().map(|(t, _)| Value::Key(vec![*t as i64])).collect();
    let heads: Vec<Value> = edge_list.iter().map(|(_, h)| Value::Key(vec![*h as i64])).collect();
    edges.load(&tail, &tails)?;
    edges.load(&head, &heads)?;
    edges.group_by(&tail)?;

    // Σ degree counts both endpoints of every stored edge
    let mut degree = vec![0u64; 6];
    for (t, h) in &edge_list {
        degree[*t as usize] += 1;
        degree[*h as usize] += 1;
    }
    assert_eq!(degree.iter().sum::<u64>(), 48);
    // a regular octahedron: every vertex sees 4 outgoing edges
    for v in 0..6 {
        assert_eq!(edges.rows_with_key(v)?.count(), 4);
    }
    Ok(())
}

#[test]
fn off_rejects_garbage() -> anyhow::Result<()> {
    let dir = scratch_dir();
    let path = dir.path().join("bad.off");
    std::fs::File::create(&path)?.write_all(b"PLY\n3 1 0\n")?;
    assert!(read_off(&path).is_err());
    Ok(())
}

#[test]
fn csv_field_roundtrip_vectors() -> anyhow::Result<()> {
    let dir = scratch_dir();
    let path = dir.path().join("pos.csv");

    let store = Store::default();
    let r = store.new_relation("verts", RelationShape::Plain { size: 3 })?;
    let pos = r.new_field("pos", EbbType::vector(ScalarKind::F64, 3))?;
    r.load(&pos, &[
        types::vec_f64(&[0.0, 1.5, -2.0]),
        types::vec_f64(&[3.25, 4.0, 5.0]),
        types::vec_f64(&[-1.0, 0.0, 0.125]),
    ])?;

    let rows = write_field_csv(&r, &pos, &path, Some(6))?;
    assert_eq!(rows, 3);

    // load into a second, identically-shaped relation
    let r2 = store.new_relation("verts2", RelationShape::Plain { size: 3 })?;
    let pos2 = r2.new_field("pos", EbbType::vector(ScalarKind::F64, 3))?;
    read_field_csv(&r2, &pos2, &path)?;
    assert_values_equal(&r2.dump(&pos2)?, &r.dump(&pos)?);
    Ok(())
}

#[test]
fn csv_booleans_are_zero_one() -> anyhow::Result<()> {
    let dir = scratch_dir();
    let path = dir.path().join("flags.csv");

    let store = Store::default();
    let r = store.new_relation("rows", RelationShape::Plain { size: 3 })?;
    let flag = r.new_field("flag", EbbType::scalar(ScalarKind::Bool))?;
    r.load(&flag, &bools(&[true, false, true]))?;
    write_field_csv(&r, &flag, &path, None)?;

    let text = std::fs::read_to_string(&path)?;
    assert_eq!(text.lines().collect::<Vec<_>>(), vec!["1", "0", "1"]);

    read_field_csv(&r, &flag, &path)?;
    assert_values_equal(&r.dump(&flag)?, &bools(&[true, false, true]));
    Ok(())
}

#[test]
fn binary_mesh_roundtrip() -> anyhow::Result<()> {
    let dir = scratch_dir();
    let path = dir.path().join("mesh.lmesh");

    let temps: Vec<u8> = [280.0f64, 281.5, 279.25]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    let mesh = MeshFile {
        counts: MeshCounts {
            vertices: 3,
            edges: 3,
            faces: 1,
            cells: 1,
            facet_edges: 2,
            boundaries: 2,
        },
        facet_edges: vec![
            FacetEdge {
                face_edge: 0,
                hf: [HalfFacet { cell: 0, vertex: 1 }, HalfFacet { cell: 0, vertex: 2 }],
            },
            FacetEdge {
                face_edge: 1,
                hf: [HalfFacet { cell: 0, vertex: 0 }, HalfFacet { cell: 0, vertex: 2 }],
            },
        ],
        boundaries: vec![
            BoundarySet {
                element: MeshElement::Vertex,
                aggregated: false,
                start: 0,
                end: 2,
                name: "inlet".into(),
            },
            BoundarySet {
                element: MeshElement::Cell,
                aggregated: true,
                start: 0,
                end: 1,
                name: "everything".into(),
            },
        ],
        fields: vec![MeshFieldRecord {
            domain: MeshElement::Vertex,
            ty: EbbType::scalar(ScalarKind::F64),
            name: "temperature".into(),
            elem_count: 3,
            data: temps,
        }],
        positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
    };

    write_mesh(&path, &mesh)?;
    let back = read_mesh(&path)?;
    assert_eq!(back, mesh);
    Ok(())
}

#[test]
fn wrong_magic_is_a_failure_return() -> anyhow::Result<()> {
    let dir = scratch_dir();
    let path = dir.path().join("not_a_mesh.lmesh");
    std::fs::write(&path, vec![0u8; 128])?;

    let err = read_mesh(&path).expect_err("bad magic");
    assert!(err.to_string().contains("magic"));
    Ok(())
}

#[test]
fn missing_files_error_cleanly() {
    assert!(read_mesh("/nonexistent/path.lmesh").is_err());
    assert!(read_off("/nonexistent/path.off").is_err());
}
