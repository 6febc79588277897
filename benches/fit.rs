use arrowfit::{
    FitEngineAlgorithm, FitEngineBuilderTrait, FitEngineTrait, FitFunction, IterationStatus,
    ModelError, ParameterDefinition, ParameterLayout, SimplexOptions,
};
use criterion::Criterion;
use ndarray::{Array1, ArrayView1, ArrayViewMut1};
use rand::prelude::*;
use rand_distr::StandardNormal;
use std::hint::black_box;

/// `y = a_i exp(-k t) + c_i` with a shared decay rate
struct Decay {
    layout: ParameterLayout,
    t: Array1<f64>,
    y: Array1<f64>,
}

impl Decay {
    fn new(datasets: usize, points: usize) -> Self {
        let layout = ParameterLayout::new(
            vec![points; datasets],
            vec![
                ParameterDefinition::global("rate"),
                ParameterDefinition::local("amplitude"),
                ParameterDefinition::local("offset"),
            ],
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let t: Array1<f64> = (0..datasets)
            .flat_map(|_| Array1::linspace(0.0, 5.0, points))
            .collect();
        let mut y = Array1::zeros(t.len());
        for ds in 0..datasets {
            let amplitude = 1.0 + ds as f64;
            let offset = 0.1 * ds as f64;
            for row in layout.dataset_range(ds).unwrap() {
                let noise: f64 = rng.sample(StandardNormal);
                y[row] = amplitude * (-0.7 * t[row]).exp() + offset + 1e-3 * noise;
            }
        }
        Self { layout, t, y }
    }

    fn guess(&self) -> Array1<f64> {
        Array1::ones(self.layout.free_parameter_count())
    }
}

impl FitFunction for Decay {
    fn layout(&self) -> &ParameterLayout {
        &self.layout
    }

    fn residuals(
        &self,
        parameters: ArrayView1<f64>,
        mut target: ArrayViewMut1<f64>,
    ) -> Result<(), ModelError> {
        let mut p = Array1::zeros(self.layout.full_parameter_count());
        self.layout
            .unpack_parameters(parameters, &mut p)
            .map_err(|err| ModelError::Failed(err.to_string()))?;
        for ds in 0..self.layout.dataset_count() {
            let (k, a, c) = (p[3 * ds], p[3 * ds + 1], p[3 * ds + 2]);
            for row in self.layout.dataset_range(ds).unwrap() {
                target[row] = a * (-k * self.t[row]).exp() + c - self.y[row];
            }
        }
        Ok(())
    }
}

fn fit(algorithm: &FitEngineAlgorithm, function: &Decay, max_iterations: usize) -> f64 {
    let mut engine = algorithm.build(function);
    engine.initialize(function.guess().view()).unwrap();
    for _ in 0..max_iterations {
        match engine.iterate() {
            Ok(IterationStatus::Continue) => {}
            Ok(IterationStatus::Converged) | Err(_) => break,
        }
    }
    engine.residuals()
}

pub fn bench_fit(c: &mut Criterion) {
    let function = Decay::new(10, 40);
    let algorithms = [
        ("Decay fit: trust-region", FitEngineAlgorithm::trust_region(), 100),
        (
            "Decay fit: simplex",
            FitEngineAlgorithm::Simplex(SimplexOptions::default().with_threshold(1e-6)),
            10_000,
        ),
    ];
    for (name, algorithm, max_iterations) in algorithms {
        c.bench_function(name, |b| {
            b.iter(|| fit(black_box(&algorithm), black_box(&function), max_iterations));
        });
    }
}
