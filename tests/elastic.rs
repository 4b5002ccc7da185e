use meshflow::kernel::ast::*;
use meshflow::testing::*;
use meshflow::*;

/// An elastic relation plus a plain "driver" relation whose rows produce
/// the inserts.
fn insert_fixture(store: &Store, n: u64) -> anyhow::Result<(Relation, Relation, Field)> {
    let driver = store.new_relation("driver", RelationShape::Plain { size: n })?;
    let particles = store.new_relation("particles", RelationShape::Elastic { size: 0 })?;
    let tag = particles.new_field("tag", EbbType::scalar(ScalarKind::I32))?;
    Ok((driver, particles, tag))
}

#[test]
fn insert_ten_rows_with_alternating_tags() -> anyhow::Result<()> {
    let store = Store::default();
    let (driver, particles, tag) = insert_fixture(&store, 10)?;

    // tag = row % 2
    let k = Kernel::new(KernelDef::new(
        "spawn",
        driver.id(),
        vec![insert(
            particles.id(),
            vec![("tag", cast(ScalarKind::I32, row_index().rem(con(2u64))))],
        )],
    ));
    let stats = k.launch(&store, LaunchOpts::sequential())?;

    assert_eq!(stats.inserted, 10);
    assert_eq!(particles.logical_size(), 10);
    assert_eq!(particles.concrete_size(), 10);
    assert!(particles.is_fragmented());
    assert_eq!(as_i32s(&particles.dump(&tag)?), vec![0, 1, 0, 1, 0, 1, 0, 1, 0, 1]);
    Ok(())
}

#[test]
fn delete_odd_tags_and_auto_defrag() -> anyhow::Result<()> {
    let store = Store::default();
    let (driver, particles, tag) = insert_fixture(&store, 10)?;
    let spawn = Kernel::new(KernelDef::new(
        "spawn",
        driver.id(),
        vec![insert(
            particles.id(),
            vec![("tag", cast(ScalarKind::I32, row_index().rem(con(2u64))))],
        )],
    ));
    spawn.launch(&store, LaunchOpts::sequential())?;

    let cull = Kernel::new(KernelDef::new(
        "cull_odd",
        particles.id(),
        vec![if_(read(&tag).eq(con(1i32)), vec![Stmt::Delete])],
    ));
    let stats = cull.launch(&store, LaunchOpts::sequential())?;

    assert_eq!(stats.deleted, 5);
    // 5 live of 10 concrete trips the half-occupancy auto defrag
    assert!(stats.defragged);
    assert_eq!(particles.logical_size(), 5);
    assert_eq!(particles.concrete_size(), 5);
    assert!(!particles.is_fragmented());
    assert_eq!(as_i32s(&particles.dump(&tag)?), vec![0, 0, 0, 0, 0]);
    Ok(())
}

#[test]
fn shallow_deletes_leave_fragmentation_behind() -> anyhow::Result<()> {
    let store = Store::default();
    let r = store.new_relation("r", RelationShape::Elastic { size: 4 })?;
    let v = r.new_field("v", EbbType::scalar(ScalarKind::I32))?;
    r.load(&v, &i32s(&[1, 2, 3, 4]))?;

    let k = Kernel::new(KernelDef::new(
        "drop_two",
        r.id(),
        vec![if_(read(&v).eq(con(2i32)), vec![Stmt::Delete])],
    ));
    let stats = k.launch(&store, LaunchOpts::sequential())?;

    assert_eq!(stats.deleted, 1);
    assert!(!stats.defragged); // 3 live of 4 concrete stays above half
    assert!(r.is_fragmented());
    assert_eq!(r.logical_size(), 3);
    assert_eq!(r.concrete_size(), 4);
    assert_eq!(as_i32s(&r.dump(&v)?), vec![1, 3, 4]);

    // launches over a fragmented relation skip the dead rows
    let bump = Kernel::new(KernelDef::new(
        "scale",
        r.id(),
        vec![assign(&v, read(&v).mul(con(10i32)))],
    ));
    bump.launch(&store, LaunchOpts::sequential())?;
    assert_eq!(as_i32s(&r.dump(&v)?), vec![10, 30, 40]);
    Ok(())
}

#[test]
fn defrag_is_idempotent() -> anyhow::Result<()> {
    let store = Store::default();
    let r = store.new_relation("r", RelationShape::Elastic { size: 6 })?;
    let v = r.new_field("v", EbbType::scalar(ScalarKind::I32))?;
    r.load(&v, &i32s(&[0, 1, 2, 3, 4, 5]))?;

    let k = Kernel::new(KernelDef::new(
        "drop_low",
        r.id(),
        vec![if_(read(&v).lt(con(2i32)), vec![Stmt::Delete])],
    ));
    k.launch(&store, LaunchOpts::sequential())?;

    // the delete already defragged (4 of 6 is above half, so force one)
    let first = r.defrag()?;
    let after_first = as_i32s(&r.dump(&v)?);
    let second = r.defrag()?;

    assert_eq!(second.moved, 0, "second defrag had nothing to move");
    assert_eq!(as_i32s(&r.dump(&v)?), after_first);
    assert!(!r.is_fragmented());
    assert_eq!(r.concrete_size(), r.logical_size());
    let _ = first;
    Ok(())
}

#[test]
fn new_fields_are_rejected_on_fragmented_relations() -> anyhow::Result<()> {
    let store = Store::default();
    let (driver, particles, _tag) = insert_fixture(&store, 4)?;
    let spawn = Kernel::new(KernelDef::new(
        "spawn",
        driver.id(),
        vec![insert(
            particles.id(),
            vec![("tag", cast(ScalarKind::I32, row_index().rem(con(2u64))))],
        )],
    ));
    spawn.launch(&store, LaunchOpts::sequential())?;
    assert!(particles.is_fragmented());

    let err = particles
        .new_field("late", EbbType::scalar(ScalarKind::F64))
        .expect_err("fragmented relations reject new fields");
    assert_eq!(err.downcast_ref::<Error>().map(Error::code), Some("SCHEMA"));

    particles.defrag()?;
    particles.new_field("late", EbbType::scalar(ScalarKind::F64))?;
    Ok(())
}

#[test]
fn inserts_into_relations_with_subsets_are_rejected() -> anyhow::Result<()> {
    let store = Store::default();
    let driver = store.new_relation("driver", RelationShape::Plain { size: 2 })?;
    let particles = store.new_relation("particles", RelationShape::Elastic { size: 2 })?;
    particles.new_field("tag", EbbType::scalar(ScalarKind::I32))?;
    particles.new_subset("all", |_| true)?;

    let k = Kernel::new(KernelDef::new(
        "spawn",
        driver.id(),
        vec![insert(particles.id(), vec![("tag", con(0i32))])],
    ));
    assert!(k.launch(&store, LaunchOpts::sequential()).is_err());
    Ok(())
}

#[test]
fn insert_records_must_match_the_structural_type_exactly() -> anyhow::Result<()> {
    let store = Store::default();
    let driver = store.new_relation("driver", RelationShape::Plain { size: 2 })?;
    let particles = store.new_relation("particles", RelationShape::Elastic { size: 0 })?;
    particles.new_field("tag", EbbType::scalar(ScalarKind::I32))?;
    particles.new_field("w", EbbType::scalar(ScalarKind::F64))?;

    // missing field
    let k = Kernel::new(KernelDef::new(
        "partial",
        driver.id(),
        vec![insert(particles.id(), vec![("tag", con(0i32))])],
    ));
    assert!(k.launch(&store, LaunchOpts::sequential()).is_err());

    // widening is not "exactly"
    let k = Kernel::new(KernelDef::new(
        "widened",
        driver.id(),
        vec![insert(
            particles.id(),
            vec![("tag", con(0i32)), ("w", con(1i32))],
        )],
    ));
    assert!(k.launch(&store, LaunchOpts::sequential()).is_err());

    let k = Kernel::new(KernelDef::new(
        "exact",
        driver.id(),
        vec![insert(
            particles.id(),
            vec![("tag", con(0i32)), ("w", con(1.0f64))],
        )],
    ));
    k.launch(&store, LaunchOpts::sequential())?;
    assert_eq!(particles.logical_size(), 2);
    Ok(())
}

#[test]
fn overflowing_the_reservation_is_fatal() -> anyhow::Result<()> {
    let store = Store::default();
    let driver = store.new_relation("driver", RelationShape::Plain { size: 3 })?;
    let particles = store.new_relation("particles", RelationShape::Elastic { size: 0 })?;
    particles.new_field("tag", EbbType::scalar(ScalarKind::I32))?;

    // two claims per driver row exceed the one-per-row reservation
    let k = Kernel::new(KernelDef::new(
        "greedy",
        driver.id(),
        vec![
            insert(particles.id(), vec![("tag", con(0i32))]),
            insert(particles.id(), vec![("tag", con(1i32))]),
        ],
    ));
    let err = k
        .launch(&store, LaunchOpts::sequential())
        .expect_err("reservation boundary");
    assert!(err.to_string().contains("reservation"));
    // the failed launch left no header room behind
    assert_eq!(particles.concrete_size(), 0);
    assert_eq!(particles.logical_size(), 0);
    Ok(())
}
