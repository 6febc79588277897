use arrowfit::linalg::gram;
use arrowfit::{ArrowBlockMatrix, ParameterDefinition, ParameterLayout, SparseJacobian};
use criterion::Criterion;
use ndarray::Array2;
use rand::prelude::*;
use std::hint::black_box;

const DATASETS: usize = 20;
const POINTS: usize = 50;

fn layout() -> ParameterLayout {
    ParameterLayout::new(
        vec![POINTS; DATASETS],
        vec![
            ParameterDefinition::global("rate"),
            ParameterDefinition::global("phase"),
            ParameterDefinition::local("amplitude"),
            ParameterDefinition::local("offset"),
            ParameterDefinition::local("slope"),
        ],
    )
    .unwrap()
}

fn fill_jacobian(jacobian: &mut SparseJacobian, rng: &mut StdRng) {
    for def in 0..jacobian.layout().definitions().len() {
        if let Some(mut column) = jacobian.parameter_vector(def).unwrap() {
            column.mapv_inplace(|_| rng.random_range(-1.0..1.0));
        }
    }
    jacobian.splice_all().unwrap();
}

pub fn bench_arrow_matrix(c: &mut Criterion) {
    let layout = layout();
    let mut rng = StdRng::seed_from_u64(0);

    let mut sparse = SparseJacobian::new(&layout);
    fill_jacobian(&mut sparse, &mut rng);
    let dense: Array2<f64> = sparse.to_dense();
    let mut jtj = ArrowBlockMatrix::for_layout(&layout).unwrap();

    c.bench_function("JtJ from compact Jacobian", |b| {
        b.iter(|| black_box(&sparse).compute_jtj(&mut jtj).unwrap());
    });
    c.bench_function("JtJ from dense Jacobian into arrowhead blocks", |b| {
        b.iter(|| jtj.set_from_product(black_box(dense.view())).unwrap());
    });
    c.bench_function("JtJ from dense Jacobian, full product", |b| {
        b.iter(|| gram(black_box(dense.view())));
    });

    sparse.compute_jtj(&mut jtj).unwrap();
    jtj.add_to_diagonal(1e-3);
    let rhs = ndarray::Array1::from_shape_fn(jtj.total_size(), |_| rng.random_range(-1.0..1.0));
    c.bench_function("Arrowhead solve", |b| {
        b.iter(|| {
            let mut x = rhs.clone();
            black_box(&jtj).solve(&mut x).unwrap();
            x
        });
    });
}
