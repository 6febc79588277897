#![doc = include_str!("../README.md")]


mod arrow_matrix;
pub use arrow_matrix::ArrowBlockMatrix;

mod error;
pub use error::{FitError, ModelError};

pub mod fit_engine;
pub use fit_engine::{
    EngineState, FitEngine, FitEngineAlgorithm, FitEngineBuilderTrait, FitEngineTrait,
    FitFunction, IterationStatus, SimplexFitEngine, TrustRegionFitEngine, TrustRegionOptions,
    engine_names,
};

mod layout;
pub use layout::{ParameterDefinition, ParameterKind, ParameterLayout};

pub mod linalg;

mod simplex;
pub use simplex::{Objective, Simplex, SimplexOptions, SimplexStatus};

mod sparse_jacobian;
pub use sparse_jacobian::SparseJacobian;

mod stored_parameters;
pub use stored_parameters::{ParameterHistory, StoredParameters};

pub use ndarray;
