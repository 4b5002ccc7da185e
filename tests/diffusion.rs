//! Heat diffusion on a 5×5 grid: seeded mass spreads over the closed
//! interior until it is uniform.

use meshflow::kernel::ast::*;
use meshflow::testing::*;
use meshflow::*;

const N: u64 = 5;
const K: f64 = 0.2;

#[test]
fn five_by_five_diffusion_converges_to_the_interior_mean() -> anyhow::Result<()> {
    let store = Store::default();
    let grid = store.new_relation(
        "cells",
        RelationShape::Grid { dims: vec![N, N], periodic: vec![false, false] },
    )?;
    let t = grid.new_field("t", EbbType::scalar(ScalarKind::F64))?;
    let t_new = grid.new_field("t_new", EbbType::scalar(ScalarKind::F64))?;
    let interior = grid.new_field("interior", EbbType::scalar(ScalarKind::Bool))?;

    // interior cells are those with all four neighbors on the grid
    let is_interior = |row: u64| {
        let c = grid.coords_of(row);
        (1..N - 1).contains(&c[0]) && (1..N - 1).contains(&c[1])
    };
    let vals: Vec<Value> = (0..N * N).map(|r| Value::Bool(is_interior(r))).collect();
    grid.load(&interior, &vals)?;
    let inside = grid.new_subset("inside", is_interior)?;

    // seed 25 units of heat at an interior cell
    grid.write_value(&t, grid.linear_of(&[1, 1]), 25.0f64)?;

    // four-neighbor flux, skipping non-interior neighbors so the interior
    // stays a closed system
    let flux = |o: [i64; 2]| {
        Expr::Select {
            cond: Box::new(read_at(&interior, &o)),
            then_e: Box::new(read_at(&t, &o).sub(read(&t))),
            else_e: Box::new(con(0.0f64)),
        }
    };
    let total_flux = flux([1, 0])
        .add(flux([-1, 0]))
        .add(flux([0, 1]))
        .add(flux([0, -1]));
    let diffuse = Kernel::new(KernelDef::new(
        "diffuse",
        grid.id(),
        vec![assign(&t_new, read(&t).add(con(K).mul(total_flux)))],
    ));

    for _ in 0..1000 {
        diffuse.launch(&store, LaunchOpts { subset: Some(&inside), ..LaunchOpts::default() })?;
        grid.swap(&t, &t_new)?;
    }

    let temps = as_f64s(&grid.dump(&t)?);
    let interior_cells: Vec<f64> = (0..N * N)
        .filter(|r| is_interior(*r))
        .map(|r| temps[r as usize])
        .collect();
    assert_eq!(interior_cells.len(), 9);

    let mean = interior_cells.iter().sum::<f64>() / interior_cells.len() as f64;
    assert_near(mean, 25.0 / 9.0, 1e-6);
    // fully converged: every interior cell carries the mean share
    for c in &interior_cells {
        assert_near(*c, 25.0 / 9.0, 1e-6);
    }
    // no heat leaked onto the boundary
    for r in 0..N * N {
        if !is_interior(r) {
            assert_near(temps[r as usize], 0.0, 1e-12);
        }
    }
    Ok(())
}
