use meshflow::kernel::ast::*;
use meshflow::testing::*;
use meshflow::types::vec_f64;
use meshflow::*;

fn trace_init() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[test]
fn identity_kernel_preserves_loaded_values() -> anyhow::Result<()> {
    trace_init();
    let store = Store::default();
    let r = store.new_relation("r", RelationShape::Plain { size: 5 })?;
    let f = r.new_field("v", EbbType::scalar(ScalarKind::F64))?;
    let vals = f64s(&[1.5, -2.0, 0.0, 8.25, 1e9]);
    r.load(&f, &vals)?;

    let k = Kernel::new(KernelDef::new("identity", r.id(), vec![]));
    k.launch_default(&store)?;

    assert_values_equal(&r.dump(&f)?, &vals);
    Ok(())
}

#[test]
fn assignments_of_unrelated_types_are_rejected_at_compile() -> anyhow::Result<()> {
    let store = Store::default();
    let r = store.new_relation("r", RelationShape::Plain { size: 2 })?;
    let f = r.new_field("count", EbbType::scalar(ScalarKind::I32))?;

    // f64 does not narrow into i32 without an explicit cast
    let k = Kernel::new(KernelDef::new("bad", r.id(), vec![assign(&f, con(1.5f64))]));
    let err = k.launch_default(&store).expect_err("no legal widening");
    assert_eq!(err.downcast_ref::<Error>().map(Error::code), Some("PHASE"));

    // bool into a float field is just as dead
    let k = Kernel::new(KernelDef::new("worse", r.id(), vec![assign(&f, con(true))]));
    assert!(k.launch_default(&store).is_err());
    Ok(())
}

#[test]
fn widening_assignments_are_accepted() -> anyhow::Result<()> {
    let store = Store::default();
    let r = store.new_relation("r", RelationShape::Plain { size: 3 })?;
    let f = r.new_field("v", EbbType::scalar(ScalarKind::F64))?;

    let k = Kernel::new(KernelDef::new("widen", r.id(), vec![assign(&f, con(2i32))]));
    k.launch_default(&store)?;
    assert_values_equal(&r.dump(&f)?, &f64s(&[2.0, 2.0, 2.0]));
    Ok(())
}

#[test]
fn read_write_centered_field() -> anyhow::Result<()> {
    let store = Store::default();
    let r = store.new_relation("r", RelationShape::Plain { size: 4 })?;
    let f = r.new_field("v", EbbType::scalar(ScalarKind::F64))?;
    r.load(&f, &f64s(&[1.0, 2.0, 3.0, 4.0]))?;

    let k = Kernel::new(KernelDef::new(
        "double",
        r.id(),
        vec![assign(&f, read(&f).mul(con(2.0f64)))],
    ));
    k.launch(&store, LaunchOpts::default())?;
    assert_values_equal(&r.dump(&f)?, &f64s(&[2.0, 4.0, 6.0, 8.0]));
    Ok(())
}

#[test]
fn uncentered_read_plus_write_is_a_phase_error() -> anyhow::Result<()> {
    let store = Store::default();
    let g = store.new_relation(
        "grid",
        RelationShape::Grid { dims: vec![4, 4], periodic: vec![true, true] },
    )?;
    let t = g.new_field("t", EbbType::scalar(ScalarKind::F64))?;

    let k = Kernel::new(KernelDef::new(
        "shift",
        g.id(),
        vec![assign(&t, read_at(&t, &[1, 0]))],
    ));
    let err = k.launch_default(&store).expect_err("stencil read of a written field");
    assert_eq!(err.downcast_ref::<Error>().map(Error::code), Some("PHASE"));
    Ok(())
}

#[test]
fn periodic_stencil_reads_wrap() -> anyhow::Result<()> {
    let store = Store::default();
    let g = store.new_relation(
        "ring",
        RelationShape::Grid { dims: vec![4], periodic: vec![true] },
    )?;
    let src = g.new_field("src", EbbType::scalar(ScalarKind::F64))?;
    let dst = g.new_field("dst", EbbType::scalar(ScalarKind::F64))?;
    g.load(&src, &f64s(&[10.0, 20.0, 30.0, 40.0]))?;

    let k = Kernel::new(KernelDef::new(
        "shift_left",
        g.id(),
        vec![assign(&dst, read_at(&src, &[1]))],
    ));
    k.launch(&store, LaunchOpts::sequential())?;
    assert_values_equal(&g.dump(&dst)?, &f64s(&[20.0, 30.0, 40.0, 10.0]));
    Ok(())
}

#[test]
fn in_bounds_probe_guards_borders() -> anyhow::Result<()> {
    let store = Store::default();
    let g = store.new_relation(
        "line",
        RelationShape::Grid { dims: vec![5], periodic: vec![false] },
    )?;
    let src = g.new_field("src", EbbType::scalar(ScalarKind::F64))?;
    let dst = g.new_field("dst", EbbType::scalar(ScalarKind::F64))?;
    g.load(&src, &f64s(&[1.0, 2.0, 3.0, 4.0, 5.0]))?;

    // dst = right neighbor where it exists, else -1
    let k = Kernel::new(KernelDef::new(
        "guarded_shift",
        g.id(),
        vec![if_else(
            in_bounds(&[1]),
            vec![assign(&dst, read_at(&src, &[1]))],
            vec![assign(&dst, con(-1.0f64))],
        )],
    ));
    k.launch(&store, LaunchOpts::default())?;
    assert_values_equal(&g.dump(&dst)?, &f64s(&[2.0, 3.0, 4.0, 5.0, -1.0]));
    Ok(())
}

#[test]
fn centroid_of_a_tetrahedron() -> anyhow::Result<()> {
    let store = Store::default();
    let verts = store.new_relation("vertices", RelationShape::Plain { size: 4 })?;
    let pos = verts.new_field("pos", EbbType::vector(ScalarKind::F64, 3))?;
    verts.load(&pos, &[
        vec_f64(&[0.0, 0.0, 0.0]),
        vec_f64(&[2.0, 0.0, 0.0]),
        vec_f64(&[0.0, 2.0, 0.0]),
        vec_f64(&[0.0, 0.0, 2.0]),
    ])?;
    let com = store.new_global(
        "com",
        EbbType::vector(ScalarKind::F64, 3),
        vec_f64(&[0.0, 0.0, 0.0]),
    )?;

    let k = Kernel::new(KernelDef::new(
        "center_of_mass",
        verts.id(),
        vec![reduce_global(&com, ReduceOp::Add, read(&pos))],
    ));
    k.launch_default(&store)?;

    let Value::Vector(sum) = com.get() else { panic!("vector global") };
    let n = verts.logical_size() as f64;
    for lane in &sum {
        assert_near(lane.as_f64().unwrap() / n, 0.5, 1e-12);
    }
    Ok(())
}

#[test]
fn subset_launches_only_touch_selected_rows() -> anyhow::Result<()> {
    let store = Store::default();
    let r = store.new_relation("r", RelationShape::Plain { size: 10 })?;
    let f = r.new_field("v", EbbType::scalar(ScalarKind::I32))?;
    let evens = r.new_subset("evens", |row| row % 2 == 0)?;
    assert_eq!(evens.kind(), SubsetKind::BoolMask);

    let k = Kernel::new(KernelDef::new("mark", r.id(), vec![assign(&f, con(7i32))]));
    k.launch(&store, LaunchOpts { subset: Some(&evens), ..LaunchOpts::default() })?;

    let got = as_i32s(&r.dump(&f)?);
    assert_eq!(got, vec![7, 0, 7, 0, 7, 0, 7, 0, 7, 0]);
    Ok(())
}

#[test]
fn index_subset_launches_run_the_index_list() -> anyhow::Result<()> {
    let store = Store::default();
    let r = store.new_relation("r", RelationShape::Plain { size: 100 })?;
    let f = r.new_field("v", EbbType::scalar(ScalarKind::I32))?;
    let few = r.new_subset("few", |row| row == 3 || row == 97)?;
    assert_eq!(few.kind(), SubsetKind::Index);

    let k = Kernel::new(KernelDef::new("mark", r.id(), vec![assign(&f, con(1i32))]));
    let stats = k.launch(&store, LaunchOpts { subset: Some(&few), ..LaunchOpts::default() })?;
    assert_eq!(stats.rows, 2);
    assert_eq!(r.read_value(&f, 3)?, Value::I32(1));
    assert_eq!(r.read_value(&f, 97)?, Value::I32(1));
    assert_eq!(r.read_value(&f, 4)?, Value::I32(0));
    Ok(())
}

#[test]
fn subset_of_another_relation_is_rejected() -> anyhow::Result<()> {
    let store = Store::default();
    let a = store.new_relation("a", RelationShape::Plain { size: 4 })?;
    let b = store.new_relation("b", RelationShape::Plain { size: 4 })?;
    let f = a.new_field("v", EbbType::scalar(ScalarKind::I32))?;
    let sb = b.new_subset("all", |_| true)?;

    let k = Kernel::new(KernelDef::new("mark", a.id(), vec![assign(&f, con(1i32))]));
    assert!(
        k.launch(&store, LaunchOpts { subset: Some(&sb), ..LaunchOpts::default() })
            .is_err()
    );
    Ok(())
}

#[test]
fn versions_progress_to_launched() -> anyhow::Result<()> {
    let store = Store::default();
    let r = store.new_relation("r", RelationShape::Plain { size: 2 })?;
    let k = Kernel::new(KernelDef::new("noop", r.id(), vec![]));

    assert_eq!(
        k.version_state(Processor::Cpu, SubsetShape::Full),
        VersionState::Declared
    );
    k.launch_default(&store)?;
    assert_eq!(
        k.version_state(Processor::Cpu, SubsetShape::Full),
        VersionState::Launched
    );
    // a device launch compiles its own version
    assert_eq!(
        k.version_state(Processor::Gpu, SubsetShape::Full),
        VersionState::Declared
    );
    Ok(())
}

#[test]
fn fields_must_reside_on_the_target_processor() -> anyhow::Result<()> {
    let store = Store::default();
    let r = store.new_relation("r", RelationShape::Plain { size: 8 })?;
    let f = r.new_field("v", EbbType::scalar(ScalarKind::F64))?;

    let k = Kernel::new(KernelDef::new("touch", r.id(), vec![assign(&f, con(1.0f64))]));
    let err = k
        .launch(&store, LaunchOpts::gpu())
        .expect_err("field still resides on the CPU");
    assert_eq!(err.downcast_ref::<Error>().map(Error::code), Some("PHASE"));

    f.move_to(Processor::Gpu);
    k.launch(&store, LaunchOpts::gpu())?;
    f.move_to(Processor::Cpu);
    assert_values_equal(&r.dump(&f)?, &f64s(&[1.0; 8]));
    Ok(())
}

#[test]
fn query_loops_iterate_grouped_rows() -> anyhow::Result<()> {
    let store = Store::default();
    let verts = store.new_relation("vertices", RelationShape::Plain { size: 3 })?;
    let degree = verts.new_field("degree", EbbType::scalar(ScalarKind::U64))?;
    let edges = store.new_relation("edges", RelationShape::Plain { size: 4 })?;
    let tail = edges.new_field("tail", verts.key_type())?;
    edges.load(&tail, &[
        Value::Key(vec![0]),
        Value::Key(vec![0]),
        Value::Key(vec![0]),
        Value::Key(vec![2]),
    ])?;
    edges.group_by(&tail)?;

    // per vertex: count the edges whose tail is this vertex
    let k = Kernel::new(KernelDef::new(
        "out_degree",
        verts.id(),
        vec![for_query(
            "e",
            edges.id(),
            vec![Stmt::ReduceField {
                field: (&degree).into(),
                key: Key::Centered,
                op: ReduceOp::Add,
                value: con(1u64),
            }],
        )],
    ));
    k.launch_default(&store)?;

    let got: Vec<u64> = r_dump_u64(&verts, &degree)?;
    assert_eq!(got, vec![3, 0, 1]);
    Ok(())
}

fn r_dump_u64(rel: &Relation, f: &Field) -> anyhow::Result<Vec<u64>> {
    Ok(rel
        .dump(f)?
        .into_iter()
        .map(|v| v.as_u64().unwrap())
        .collect())
}
