use crate::error::FitError;
use crate::simplex::SimplexOptions;
use crate::stored_parameters::ParameterHistory;

use enum_dispatch::enum_dispatch;
use lazy_static::lazy_static;
use ndarray::{Array2, ArrayView1};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

mod function;
pub use function::{
    FINITE_DIFFERENCE_STEP, FINITE_DIFFERENCE_ZERO_STEP, FitFunction, forward_difference_jacobian,
};

mod simplex_engine;
pub use simplex_engine::{ResidualNorm, SimplexFitEngine};

mod trust_region;
pub use trust_region::{
    JACOBIAN_SCALING_FACTOR, JACOBIAN_SCALING_TRIES, TrustRegionFitEngine, TrustRegionOptions,
};

/// Life cycle of a [FitEngine]
///
/// `initialize()` can be called in any state and restarts the fit. `iterate()` is valid in the
/// `Initialized` and `Iterating` states only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EngineState {
    Uninitialized,
    Initialized,
    Iterating,
    Converged,
    Failed,
}

/// Result of a single successful iteration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IterationStatus {
    Continue,
    Converged,
}

/// Iterative minimizer of the residual norm
#[enum_dispatch]
pub trait FitEngineTrait {
    fn name(&self) -> &'static str;

    /// Starts a new fit from the packed vector of free parameters
    fn initialize(&mut self, guess: ArrayView1<f64>) -> Result<(), FitError>;

    /// Performs one step, the engine goes to the `Failed` state on error
    fn iterate(&mut self) -> Result<IterationStatus, FitError>;

    fn current_parameters(&self) -> ArrayView1<'_, f64>;

    /// Euclidean norm of the residual vector
    fn residuals(&self) -> f64;

    fn iterations(&self) -> usize;

    fn state(&self) -> EngineState;

    fn history(&self) -> &ParameterHistory;

    fn history_mut(&mut self) -> &mut ParameterHistory;

    /// Writes the parameter covariance matrix into `target`
    ///
    /// Returns `false` and leaves `target` untouched if the engine doesn't support it.
    fn compute_covariance_matrix(&mut self, target: &mut Array2<f64>) -> Result<bool, FitError>;

    /// Whether the engine weights the residuals itself, otherwise the function must do it
    fn handles_weights(&self) -> bool {
        false
    }
}

/// Engine built by [FitEngineAlgorithm]
#[enum_dispatch(FitEngineTrait)]
#[derive(Debug)]
pub enum FitEngine<F>
where
    F: FitFunction,
{
    TrustRegion(TrustRegionFitEngine<F>),
    Simplex(SimplexFitEngine<F>),
}

#[enum_dispatch]
pub trait FitEngineBuilderTrait {
    fn build<F: FitFunction>(&self, function: F) -> FitEngine<F>;

    fn engine_name(&self) -> &'static str;
}

impl FitEngineBuilderTrait for TrustRegionOptions {
    fn build<F: FitFunction>(&self, function: F) -> FitEngine<F> {
        TrustRegionFitEngine::new(function, self.clone()).into()
    }

    fn engine_name(&self) -> &'static str {
        "trust-region"
    }
}

impl FitEngineBuilderTrait for SimplexOptions {
    fn build<F: FitFunction>(&self, function: F) -> FitEngine<F> {
        SimplexFitEngine::new(function, self.clone()).into()
    }

    fn engine_name(&self) -> &'static str {
        "simplex"
    }
}

/// Engine kind together with its options
#[enum_dispatch(FitEngineBuilderTrait)]
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[non_exhaustive]
pub enum FitEngineAlgorithm {
    TrustRegion(TrustRegionOptions),
    Simplex(SimplexOptions),
}

impl FitEngineAlgorithm {
    pub fn trust_region() -> Self {
        Self::TrustRegion(TrustRegionOptions::default())
    }

    pub fn simplex() -> Self {
        Self::Simplex(SimplexOptions::default())
    }

    /// Default options of the engine registered under `name`
    pub fn from_name(name: &str) -> Result<Self, FitError> {
        ENGINE_REGISTRY
            .get(name)
            .map(|constructor| constructor())
            .ok_or_else(|| FitError::UnknownEngine(name.to_owned()))
    }
}

impl Default for FitEngineAlgorithm {
    fn default() -> Self {
        Self::trust_region()
    }
}

lazy_static! {
    static ref ENGINE_REGISTRY: BTreeMap<&'static str, fn() -> FitEngineAlgorithm> = {
        let mut registry: BTreeMap<&'static str, fn() -> FitEngineAlgorithm> = BTreeMap::new();
        registry.insert("trust-region", FitEngineAlgorithm::trust_region);
        registry.insert("multi", FitEngineAlgorithm::trust_region);
        registry.insert("simplex", FitEngineAlgorithm::simplex);
        registry
    };
}

/// Names accepted by [FitEngineAlgorithm::from_name], sorted
pub fn engine_names() -> Vec<&'static str> {
    ENGINE_REGISTRY.keys().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::*;

    use approx::assert_abs_diff_eq;

    fn run<F: FitFunction>(engine: &mut FitEngine<F>, max_iterations: usize) -> EngineState {
        engine.initialize(Array1::ones(7).view()).unwrap();
        for _ in 0..max_iterations {
            if engine.iterate().unwrap() == IterationStatus::Converged {
                break;
            }
        }
        engine.state()
    }

    #[test]
    fn registry() {
        assert_eq!(engine_names(), ["multi", "simplex", "trust-region"]);
        for name in engine_names() {
            let algorithm = FitEngineAlgorithm::from_name(name).unwrap();
            let expected = if name == "simplex" {
                "simplex"
            } else {
                "trust-region"
            };
            assert_eq!(algorithm.engine_name(), expected);
        }
        assert_eq!(
            FitEngineAlgorithm::from_name("levmar").unwrap_err(),
            FitError::UnknownEngine("levmar".into())
        );
    }

    #[test]
    fn built_engine_reports_algorithm_name() {
        let problem = QuadraticProblem::new();
        for algorithm in [FitEngineAlgorithm::trust_region(), FitEngineAlgorithm::simplex()] {
            let engine = algorithm.build(&problem);
            assert_eq!(engine.name(), algorithm.engine_name());
            assert_eq!(engine.state(), EngineState::Uninitialized);
            assert!(!engine.handles_weights());
        }
    }

    #[test]
    fn trust_region_through_enum() {
        let problem = QuadraticProblem::new();
        let mut engine = FitEngineAlgorithm::default().build(&problem);
        assert_eq!(run(&mut engine, 49), EngineState::Converged);
        assert_abs_diff_eq!(
            engine.current_parameters(),
            QuadraticProblem::solution(),
            epsilon = 1e-6
        );
        let mut covariance = Array2::zeros((7, 7));
        assert!(engine.compute_covariance_matrix(&mut covariance).unwrap());
    }

    #[test]
    fn simplex_through_enum() {
        let problem = QuadraticProblem::new();
        let algorithm = FitEngineAlgorithm::Simplex(SimplexOptions::default().with_threshold(1e-8));
        let mut engine = algorithm.build(&problem);
        let initial = {
            engine.initialize(Array1::ones(7).view()).unwrap();
            engine.history().last().unwrap().residuals
        };
        assert_eq!(run(&mut engine, 20000), EngineState::Converged);
        assert!(engine.history().best().unwrap().residuals < initial);
        let mut covariance = Array2::zeros((7, 7));
        assert!(!engine.compute_covariance_matrix(&mut covariance).unwrap());
    }

    #[test]
    fn algorithm_serialization() {
        let algorithm = FitEngineAlgorithm::Simplex(SimplexOptions::default());
        let json = serde_json::to_value(&algorithm).unwrap();
        assert_eq!(json["Simplex"]["alpha"], 1.0);
        let restored: FitEngineAlgorithm = serde_json::from_value(json).unwrap();
        assert_eq!(restored, algorithm);

        let algorithm = FitEngineAlgorithm::trust_region();
        let json = serde_json::to_string(&algorithm).unwrap();
        let restored: FitEngineAlgorithm = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, algorithm);
    }
}
