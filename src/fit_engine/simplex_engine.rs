use crate::error::FitError;
use crate::fit_engine::function::FitFunction;
use crate::fit_engine::{EngineState, FitEngineTrait, IterationStatus};
use crate::linalg::norm2;
use crate::simplex::{Objective, Simplex, SimplexOptions, SimplexStatus};
use crate::stored_parameters::{ParameterHistory, StoredParameters};

use log::debug;
use ndarray::{Array1, Array2, ArrayView1};

/// Residual norm of a [FitFunction], remembering the last evaluated value
#[derive(Clone, Debug)]
pub struct ResidualNorm<F> {
    function: F,
    residuals: Array1<f64>,
    last_norm: f64,
}

impl<F: FitFunction> ResidualNorm<F> {
    pub fn new(function: F) -> Self {
        let data_points = function.layout().data_points();
        Self {
            function,
            residuals: Array1::zeros(data_points),
            last_norm: f64::NAN,
        }
    }

    pub fn function(&self) -> &F {
        &self.function
    }

    /// Norm of the last evaluated residual vector, NaN before the first evaluation
    pub fn last_norm(&self) -> f64 {
        self.last_norm
    }
}

impl<F: FitFunction> Objective for ResidualNorm<F> {
    fn value(&mut self, parameters: ArrayView1<f64>) -> Result<f64, FitError> {
        self.function
            .residuals(parameters, self.residuals.view_mut())?;
        self.last_norm = norm2(self.residuals.view());
        Ok(self.last_norm)
    }
}

/// Derivative-free engine minimizing the residual norm with [Simplex]
///
/// Covariance matrix is not available.
#[derive(Clone, Debug)]
pub struct SimplexFitEngine<F> {
    simplex: Simplex<ResidualNorm<F>>,
    state: EngineState,
    iterations: usize,
    parameters: Array1<f64>,
    history: ParameterHistory,
}

impl<F: FitFunction> SimplexFitEngine<F> {
    pub fn new(function: F, options: SimplexOptions) -> Self {
        Self {
            simplex: Simplex::new(ResidualNorm::new(function), options),
            state: EngineState::Uninitialized,
            iterations: 0,
            parameters: Array1::zeros(0),
            history: ParameterHistory::new(),
        }
    }

    pub fn function(&self) -> &F {
        self.simplex.objective().function()
    }

    pub fn simplex(&self) -> &Simplex<ResidualNorm<F>> {
        &self.simplex
    }

    fn update_best(&mut self) -> Result<(), FitError> {
        let best = self.simplex.best().ok_or(FitError::NotInitialized)?;
        self.parameters.assign(&best.parameters);
        Ok(())
    }
}

impl<F: FitFunction> FitEngineTrait for SimplexFitEngine<F> {
    fn name(&self) -> &'static str {
        "simplex"
    }

    fn initialize(&mut self, guess: ArrayView1<f64>) -> Result<(), FitError> {
        let n = self.function().layout().free_parameter_count();
        if n == 0 {
            return Err(FitError::dimension("free parameters", 1, 0));
        }
        if guess.len() != n {
            return Err(FitError::dimension("initial guess", n, guess.len()));
        }
        self.iterations = 0;
        self.state = EngineState::Failed;
        self.parameters = guess.to_owned();
        self.simplex.initialize(guess)?;
        let center = self
            .simplex
            .vertices()
            .iter()
            .find(|v| v.parameters == guess)
            .map(|v| v.residuals)
            .unwrap_or(f64::NAN);
        self.history.push(StoredParameters::from_view(guess, center));
        self.update_best()?;
        self.state = EngineState::Initialized;
        Ok(())
    }

    fn iterate(&mut self) -> Result<IterationStatus, FitError> {
        match self.state {
            EngineState::Initialized | EngineState::Iterating => {}
            EngineState::Uninitialized => return Err(FitError::NotInitialized),
            state => return Err(FitError::InvalidState(state)),
        }
        self.iterations += 1;
        let result = self
            .simplex
            .iterate(None)
            .and_then(|status| self.update_best().map(|_| status));
        match result {
            Ok(status) => {
                if let Some(best) = self.simplex.best() {
                    self.history.push(best.clone());
                }
                if status == SimplexStatus::Converged {
                    debug!("simplex: converged after {} iterations", self.iterations);
                    self.state = EngineState::Converged;
                    Ok(IterationStatus::Converged)
                } else {
                    self.state = EngineState::Iterating;
                    Ok(IterationStatus::Continue)
                }
            }
            Err(err) => {
                self.state = EngineState::Failed;
                Err(err)
            }
        }
    }

    fn current_parameters(&self) -> ArrayView1<'_, f64> {
        self.parameters.view()
    }

    /// Norm of the last evaluated residual vector, which is not necessarily the best vertex
    fn residuals(&self) -> f64 {
        self.simplex.objective().last_norm()
    }

    fn iterations(&self) -> usize {
        self.iterations
    }

    fn state(&self) -> EngineState {
        self.state
    }

    fn history(&self) -> &ParameterHistory {
        &self.history
    }

    fn history_mut(&mut self) -> &mut ParameterHistory {
        &mut self.history
    }

    fn compute_covariance_matrix(&mut self, _target: &mut Array2<f64>) -> Result<bool, FitError> {
        Ok(false)
    }
}
