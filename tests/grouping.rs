use meshflow::types::Value;
use meshflow::*;

fn keys(vals: &[i64]) -> Vec<Value> {
    vals.iter().map(|v| Value::Key(vec![*v])).collect()
}

#[test]
fn group_by_builds_offsets_and_lengths() -> anyhow::Result<()> {
    let store = Store::default();
    let verts = store.new_relation("vertices", RelationShape::Plain { size: 4 })?;
    let edges = store.new_relation("edges", RelationShape::Plain { size: 6 })?;
    let tail = edges.new_field("tail", verts.key_type())?;
    // sorted ascending by tail: vertex 0 has 2 edges, 1 has 1, 2 none, 3 has 3
    edges.load(&tail, &keys(&[0, 0, 1, 3, 3, 3]))?;

    edges.group_by(&tail)?;
    assert_eq!(edges.mode(), RelationMode::Grouped);

    assert_eq!(edges.rows_with_key(0)?, 0..2);
    assert_eq!(edges.rows_with_key(1)?, 2..3);
    assert_eq!(edges.rows_with_key(2)?.count(), 0);
    assert_eq!(edges.rows_with_key(3)?, 3..6);

    // group soundness: the per-key lengths cover the whole relation
    let total: u64 = (0..4)
        .map(|k| edges.rows_with_key(k).map(|r| r.end - r.start).unwrap_or(0))
        .sum();
    assert_eq!(total, edges.logical_size());
    Ok(())
}

#[test]
fn grouping_records_key_and_back_reference() -> anyhow::Result<()> {
    let store = Store::default();
    let verts = store.new_relation("vertices", RelationShape::Plain { size: 2 })?;
    let edges = store.new_relation("edges", RelationShape::Plain { size: 3 })?;
    let tail = edges.new_field("tail", verts.key_type())?;
    edges.load(&tail, &keys(&[0, 1, 1]))?;
    edges.group_by(&tail)?;

    assert_eq!(edges.group_key().map(|f| f.name()), Some("tail".to_string()));
    let back: Vec<String> = verts.grouped_relations().iter().map(Relation::name).collect();
    assert_eq!(back, vec!["edges".to_string()]);
    Ok(())
}

#[test]
fn grouping_requires_sorted_keys() -> anyhow::Result<()> {
    let store = Store::default();
    let verts = store.new_relation("vertices", RelationShape::Plain { size: 3 })?;
    let edges = store.new_relation("edges", RelationShape::Plain { size: 3 })?;
    let tail = edges.new_field("tail", verts.key_type())?;
    edges.load(&tail, &keys(&[1, 0, 2]))?;

    let err = edges.group_by(&tail).expect_err("unsorted keys");
    assert_eq!(err.downcast_ref::<Error>().map(Error::code), Some("SCHEMA"));
    assert_eq!(edges.mode(), RelationMode::Plain);
    Ok(())
}

#[test]
fn grouping_a_non_plain_relation_is_rejected() -> anyhow::Result<()> {
    let store = Store::default();
    let verts = store.new_relation("vertices", RelationShape::Plain { size: 2 })?;
    let edges = store.new_relation("edges", RelationShape::Plain { size: 2 })?;
    let tail = edges.new_field("tail", verts.key_type())?;
    edges.load(&tail, &keys(&[0, 1]))?;
    edges.group_by(&tail)?;

    // already grouped: a second grouping is a schema error
    assert!(edges.group_by(&tail).is_err());
    Ok(())
}

#[test]
fn source_must_not_be_larger_than_grouped_relation() -> anyhow::Result<()> {
    let store = Store::default();
    let big = store.new_relation("big", RelationShape::Plain { size: 10 })?;
    let small = store.new_relation("small", RelationShape::Plain { size: 2 })?;
    let key = small.new_field("k", big.key_type())?;
    small.load(&key, &keys(&[0, 1]))?;
    assert!(small.group_by(&key).is_err());
    Ok(())
}
