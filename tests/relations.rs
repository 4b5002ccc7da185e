use meshflow::testing::*;
use meshflow::*;

#[test]
fn plain_relation_basics() -> anyhow::Result<()> {
    let store = Store::default();
    let r = store.new_relation("cells", RelationShape::Plain { size: 8 })?;
    assert_eq!(r.mode(), RelationMode::Plain);
    assert_eq!(r.logical_size(), 8);
    assert_eq!(r.concrete_size(), 8);
    assert!(!r.is_fragmented());
    Ok(())
}

#[test]
fn relation_names_are_unique() -> anyhow::Result<()> {
    let store = Store::default();
    store.new_relation("r", RelationShape::Plain { size: 1 })?;
    let err = store
        .new_relation("r", RelationShape::Plain { size: 1 })
        .expect_err("duplicate relation name");
    assert_eq!(err.downcast_ref::<Error>().map(Error::code), Some("SCHEMA"));
    Ok(())
}

#[test]
fn grid_needs_matching_periodic_flags() -> anyhow::Result<()> {
    let store = Store::default();
    assert!(
        store
            .new_relation(
                "g",
                RelationShape::Grid { dims: vec![4, 4], periodic: vec![true] }
            )
            .is_err()
    );
    let g = store.new_relation(
        "g",
        RelationShape::Grid { dims: vec![4, 4], periodic: vec![false, false] },
    )?;
    assert_eq!(g.logical_size(), 16);
    assert_eq!(g.dims(), vec![4, 4]);
    Ok(())
}

#[test]
fn grid_linear_and_coords_roundtrip() -> anyhow::Result<()> {
    let store = Store::default();
    let g = store.new_relation(
        "g",
        RelationShape::Grid { dims: vec![3, 4, 5], periodic: vec![false; 3] },
    )?;
    for row in 0..g.logical_size() {
        assert_eq!(g.linear_of(&g.coords_of(row)), row);
    }
    assert_eq!(g.linear_of(&[1, 2, 3]), 1 * 20 + 2 * 5 + 3);
    Ok(())
}

#[test]
fn duplicate_and_reserved_field_names_rejected() -> anyhow::Result<()> {
    let store = Store::default();
    let r = store.new_relation("r", RelationShape::Plain { size: 4 })?;
    r.new_field("t", EbbType::scalar(ScalarKind::F64))?;
    assert!(r.new_field("t", EbbType::scalar(ScalarKind::F64)).is_err());
    assert!(r.new_field("__secret", EbbType::scalar(ScalarKind::F64)).is_err());
    Ok(())
}

#[test]
fn key_into_elastic_is_rejected() -> anyhow::Result<()> {
    let store = Store::default();
    let particles = store.new_relation("particles", RelationShape::Elastic { size: 4 })?;
    let owners = store.new_relation("owners", RelationShape::Plain { size: 4 })?;
    let err = owners
        .new_field("p", particles.key_type())
        .expect_err("keys into elastic storage are forbidden");
    assert_eq!(err.downcast_ref::<Error>().map(Error::code), Some("SCHEMA"));
    Ok(())
}

#[test]
fn load_dump_roundtrip() -> anyhow::Result<()> {
    let store = Store::default();
    let r = store.new_relation("r", RelationShape::Plain { size: 4 })?;
    let f = r.new_field("v", EbbType::scalar(ScalarKind::F64))?;
    let vals = f64s(&[0.5, -1.0, 2.25, 7.0]);
    r.load(&f, &vals)?;
    assert_values_equal(&r.dump(&f)?, &vals);
    Ok(())
}

#[test]
fn swap_and_copy_require_same_type() -> anyhow::Result<()> {
    let store = Store::default();
    let r = store.new_relation("r", RelationShape::Plain { size: 3 })?;
    let a = r.new_field("a", EbbType::scalar(ScalarKind::F64))?;
    let b = r.new_field("b", EbbType::scalar(ScalarKind::F64))?;
    let c = r.new_field("c", EbbType::scalar(ScalarKind::I32))?;

    r.load(&a, &f64s(&[1.0, 2.0, 3.0]))?;
    r.load(&b, &f64s(&[9.0, 9.0, 9.0]))?;
    r.swap(&a, &b)?;
    assert_values_equal(&r.dump(&a)?, &f64s(&[9.0, 9.0, 9.0]));
    assert_values_equal(&r.dump(&b)?, &f64s(&[1.0, 2.0, 3.0]));

    r.copy(&b, &a)?;
    assert_values_equal(&r.dump(&a)?, &f64s(&[1.0, 2.0, 3.0]));

    assert!(r.swap(&a, &c).is_err());
    assert!(r.copy(&a, &c).is_err());
    Ok(())
}

#[test]
fn elastic_resize_preserves_prefix() -> anyhow::Result<()> {
    let store = Store::default();
    let r = store.new_relation("r", RelationShape::Elastic { size: 3 })?;
    let f = r.new_field("v", EbbType::scalar(ScalarKind::I32))?;
    r.load(&f, &i32s(&[10, 20, 30]))?;

    r.resize(5, Some(3))?;
    assert_eq!(r.concrete_size(), 5);
    assert_eq!(r.logical_size(), 3);
    assert_eq!(r.read_value(&f, 0)?, Value::I32(10));
    assert_eq!(r.read_value(&f, 2)?, Value::I32(30));

    r.resize(2, None)?;
    assert_eq!(r.concrete_size(), 2);
    assert_eq!(r.logical_size(), 2);
    assert_eq!(r.read_value(&f, 1)?, Value::I32(20));
    Ok(())
}

#[test]
fn resize_rejected_on_non_elastic() -> anyhow::Result<()> {
    let store = Store::default();
    let r = store.new_relation("r", RelationShape::Plain { size: 3 })?;
    assert!(r.resize(5, None).is_err());
    Ok(())
}

#[test]
fn globals_get_set_and_widen() -> anyhow::Result<()> {
    let store = Store::default();
    let g = store.new_global("energy", EbbType::scalar(ScalarKind::F64), Value::F64(0.0))?;
    assert_eq!(g.get(), Value::F64(0.0));
    g.set(3i32)?; // widens
    assert_eq!(g.get(), Value::F64(3.0));
    assert!(g.set(Value::Bool(true)).is_err());
    Ok(())
}
