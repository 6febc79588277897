use crate::arrow_matrix::ArrowBlockMatrix;
use crate::error::FitError;
use crate::fit_engine::function::FitFunction;
use crate::fit_engine::{EngineState, FitEngineTrait, IterationStatus};
use crate::linalg::norm_inf;
use crate::sparse_jacobian::SparseJacobian;
use crate::stored_parameters::{ParameterHistory, StoredParameters};

use log::debug;
use ndarray::{Array1, Array2, ArrayView1};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Number of attempts to perform a step with a rescaled Jacobian before giving up
pub const JACOBIAN_SCALING_TRIES: usize = 19;
/// Jacobian multiplier applied after every ill-conditioned attempt
pub const JACOBIAN_SCALING_FACTOR: f64 = 1.6;

/// Damped Gauss-Newton (Levenberg-Marquardt) options
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename = "TrustRegion")]
pub struct TrustRegionOptions {
    /// Initial damping
    pub lambda: f64,
    /// Factor the damping is divided by after a good step and multiplied by after a bad one
    pub scale: f64,
    /// Convergence threshold on the relative parameter change
    pub end_threshold: f64,
    /// Added to the parameter magnitude in the relative change denominator
    pub relative_min: f64,
    /// Convergence threshold on the maximum absolute gradient component
    pub gradient_tolerance: f64,
    /// Maximum number of damping increases within a single iteration
    pub max_step_tries: usize,
    /// Use the compact Jacobian storage instead of the dense one
    pub sparse_jacobian: bool,
}

impl TrustRegionOptions {
    /// Create a new [TrustRegionOptions].
    ///
    /// # Arguments
    /// - `lambda`: initial Levenberg-Marquardt damping, positive
    /// - `scale`: damping change factor, larger than one
    /// - `end_threshold`: iterations converge when every `|Δp| / (relative_min + |p|)` is below
    ///   this value
    /// - `relative_min`: regularization of the relative parameter change
    /// - `gradient_tolerance`: iterations converge when the gradient is this small
    /// - `max_step_tries`: number of rejected damped steps before the iteration fails
    /// - `sparse_jacobian`: whether to use compact Jacobian storage
    pub fn new(
        lambda: f64,
        scale: f64,
        end_threshold: f64,
        relative_min: f64,
        gradient_tolerance: f64,
        max_step_tries: usize,
        sparse_jacobian: bool,
    ) -> Self {
        assert!(lambda > 0.0, "lambda must be positive");
        assert!(lambda.is_finite(), "lambda must be finite");
        assert!(scale > 1.0, "scale must be larger than unity");
        assert!(end_threshold >= 0.0, "end_threshold must be non-negative");
        assert!(relative_min >= 0.0, "relative_min must be non-negative");
        assert!(
            gradient_tolerance >= 0.0,
            "gradient_tolerance must be non-negative"
        );
        assert!(max_step_tries > 0, "max_step_tries must be positive");
        Self {
            lambda,
            scale,
            end_threshold,
            relative_min,
            gradient_tolerance,
            max_step_tries,
            sparse_jacobian,
        }
    }

    #[inline]
    pub fn default_lambda() -> f64 {
        1e-2
    }

    #[inline]
    pub fn default_scale() -> f64 {
        2.0
    }

    #[inline]
    pub fn default_end_threshold() -> f64 {
        1e-5
    }

    #[inline]
    pub fn default_relative_min() -> f64 {
        1e-3
    }

    #[inline]
    pub fn default_gradient_tolerance() -> f64 {
        1e-12
    }

    #[inline]
    pub fn default_max_step_tries() -> usize {
        30
    }

    #[inline]
    pub fn default_sparse_jacobian() -> bool {
        true
    }
}

impl Default for TrustRegionOptions {
    fn default() -> Self {
        Self::new(
            Self::default_lambda(),
            Self::default_scale(),
            Self::default_end_threshold(),
            Self::default_relative_min(),
            Self::default_gradient_tolerance(),
            Self::default_max_step_tries(),
            Self::default_sparse_jacobian(),
        )
    }
}

#[derive(Debug)]
struct Workspace {
    jacobian: SparseJacobian<'static>,
    jtj: ArrowBlockMatrix,
    damped: ArrowBlockMatrix,
    gradient: Array1<f64>,
}

struct Trial {
    parameters: Array1<f64>,
    residuals: Array1<f64>,
    squares: f64,
}

/// Levenberg-Marquardt engine exploiting the arrowhead structure of multi-dataset fits
///
/// Every iteration evaluates the Jacobian at the current point and tries the damped steps with
/// `λ` and `λ / scale`. The smaller damping is kept if it decreases the sum of squares, the
/// larger one if it doesn't increase it, otherwise the damping grows and the step is retried.
/// Ill-conditioned steps are retried with a Jacobian scaled by an increasing factor.
#[derive(Debug)]
pub struct TrustRegionFitEngine<F> {
    function: F,
    options: TrustRegionOptions,
    state: EngineState,
    iterations: usize,
    lambda: f64,
    parameters: Array1<f64>,
    residual_vector: Array1<f64>,
    residual_norm: f64,
    workspace: Option<Workspace>,
    history: ParameterHistory,
}

impl<F: FitFunction> TrustRegionFitEngine<F> {
    pub fn new(function: F, options: TrustRegionOptions) -> Self {
        let lambda = options.lambda;
        Self {
            function,
            options,
            state: EngineState::Uninitialized,
            iterations: 0,
            lambda,
            parameters: Array1::zeros(0),
            residual_vector: Array1::zeros(0),
            residual_norm: f64::NAN,
            workspace: None,
            history: ParameterHistory::new(),
        }
    }

    pub fn function(&self) -> &F {
        &self.function
    }

    pub fn options(&self) -> &TrustRegionOptions {
        &self.options
    }

    /// Current damping
    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    /// Jacobian of the last evaluation, `None` before initialization
    pub fn jacobian(&self) -> Option<&SparseJacobian<'static>> {
        self.workspace.as_ref().map(|ws| &ws.jacobian)
    }

    /// Normal-equations matrix of the last evaluation, `None` before initialization
    pub fn normal_matrix(&self) -> Option<&ArrowBlockMatrix> {
        self.workspace.as_ref().map(|ws| &ws.jtj)
    }

    fn evaluate_residuals(&self, parameters: ArrayView1<f64>) -> Result<Array1<f64>, FitError> {
        let mut residuals = Array1::zeros(self.function.layout().data_points());
        self.function.residuals(parameters, residuals.view_mut())?;
        if residuals.iter().any(|x| !x.is_finite()) {
            return Err(FitError::Domain("non-finite residuals".into()));
        }
        Ok(residuals)
    }

    // Evaluates J, JᵗJ and the gradient -Jᵗf at the current point
    fn evaluate_jacobian(&mut self, jacobian_scale: f64) -> Result<(), FitError> {
        let ws = self.workspace.as_mut().ok_or(FitError::NotInitialized)?;
        ws.jacobian.clear();
        self.function
            .jacobian(self.parameters.view(), &mut ws.jacobian)?;
        ws.jacobian.splice_all()?;
        if jacobian_scale != 1.0 {
            ws.jacobian.scale(jacobian_scale);
        }
        ws.jacobian.compute_jtj(&mut ws.jtj)?;
        ws.jacobian
            .compute_gradient(ws.gradient.view_mut(), self.residual_vector.view(), -1.0)?;
        Ok(())
    }

    /// Recomputes the Jacobian and the normal-equations matrix at the current parameters
    pub fn recompute_jacobian(&mut self) -> Result<(), FitError> {
        self.evaluate_jacobian(1.0)
    }

    // Returns None if the trial point is out of the model domain
    fn trial_step(&mut self, lambda: f64) -> Result<Option<Trial>, FitError> {
        let ws = self.workspace.as_mut().ok_or(FitError::NotInitialized)?;
        ws.damped.copy_from(&ws.jtj)?;
        ws.damped.add_to_diagonal(lambda);
        let mut delta = ws.gradient.clone();
        ws.damped.solve(&mut delta)?;
        let parameters = &self.parameters + &delta;
        match self.evaluate_residuals(parameters.view()) {
            Ok(residuals) => {
                let squares = residuals.dot(&residuals);
                Ok(Some(Trial {
                    parameters,
                    residuals,
                    squares,
                }))
            }
            Err(FitError::Domain(msg)) => {
                debug!("trust-region: trial point with λ = {lambda:e} is out of domain: {msg}");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn step(&mut self, jacobian_scale: f64) -> Result<IterationStatus, FitError> {
        self.evaluate_jacobian(jacobian_scale)?;
        let gradient_norm = self
            .workspace
            .as_ref()
            .map_or(f64::INFINITY, |ws| norm_inf(ws.gradient.view()));
        if gradient_norm <= self.options.gradient_tolerance {
            debug!("trust-region: gradient {gradient_norm:e} is below tolerance");
            return Ok(IterationStatus::Converged);
        }

        let current = self.residual_vector.dot(&self.residual_vector);
        let scale = self.options.scale;
        let mut accepted = None;
        for _ in 0..self.options.max_step_tries {
            let lambda = self.lambda;
            if let Some(trial) = self.trial_step(lambda)? {
                if let Some(smaller) = self.trial_step(lambda / scale)? {
                    if smaller.squares < current {
                        self.lambda = lambda / scale;
                        accepted = Some(smaller);
                        break;
                    }
                }
                if trial.squares <= current {
                    accepted = Some(trial);
                    break;
                }
            }
            self.lambda = lambda * scale;
            debug!("trust-region: rejected step, λ → {:e}", self.lambda);
        }
        let Some(trial) = accepted else {
            return Err(FitError::NoSuitableStep {
                tries: self.options.max_step_tries,
            });
        };

        let converged = trial
            .parameters
            .iter()
            .zip(self.parameters.iter())
            .all(|(&p, &previous)| {
                (p - previous).abs() / (self.options.relative_min + p.abs())
                    <= self.options.end_threshold
            });
        self.parameters = trial.parameters;
        self.residual_vector = trial.residuals;
        self.residual_norm = trial.squares.sqrt();
        self.history.push(StoredParameters::from_view(
            self.parameters.view(),
            self.residual_norm,
        ));
        Ok(if converged {
            IterationStatus::Converged
        } else {
            IterationStatus::Continue
        })
    }

    // One iteration, retrying ill-conditioned steps with a growing Jacobian scale
    fn scaled_step(&mut self) -> Result<IterationStatus, FitError> {
        let mut jacobian_scale = 1.0;
        let mut failures = 0;
        loop {
            match self.step(jacobian_scale) {
                Err(FitError::Conditioning(msg)) => {
                    failures += 1;
                    if failures >= JACOBIAN_SCALING_TRIES {
                        return Err(FitError::Conditioning(msg));
                    }
                    jacobian_scale *= JACOBIAN_SCALING_FACTOR;
                    debug!(
                        "trust-region: scaling problem: {msg}, scaling the Jacobian by {jacobian_scale}"
                    );
                }
                result => return result,
            }
        }
    }
}

impl<F: FitFunction> FitEngineTrait for TrustRegionFitEngine<F> {
    fn name(&self) -> &'static str {
        "trust-region"
    }

    fn initialize(&mut self, guess: ArrayView1<f64>) -> Result<(), FitError> {
        let layout = self.function.layout();
        let n = layout.free_parameter_count();
        if n == 0 {
            return Err(FitError::dimension("free parameters", 1, 0));
        }
        if guess.len() != n {
            return Err(FitError::dimension("initial guess", n, guess.len()));
        }
        self.iterations = 0;
        self.lambda = self.options.lambda;
        self.state = EngineState::Failed;
        let jacobian = if self.options.sparse_jacobian {
            SparseJacobian::new(layout)
        } else {
            SparseJacobian::dense(layout)
        };
        let jtj = ArrowBlockMatrix::for_layout(layout)?;
        self.workspace = Some(Workspace {
            jacobian,
            damped: jtj.clone(),
            jtj,
            gradient: Array1::zeros(n),
        });
        self.parameters = guess.to_owned();
        self.residual_vector = self.evaluate_residuals(guess)?;
        self.residual_norm = self.residual_vector.dot(&self.residual_vector).sqrt();
        self.history
            .push(StoredParameters::from_view(guess, self.residual_norm));
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
        let result = self.scaled_step();
        self.state = match result {
            Ok(IterationStatus::Continue) => EngineState::Iterating,
            Ok(IterationStatus::Converged) => EngineState::Converged,
            Err(_) => EngineState::Failed,
        };
        result
    }

    fn current_parameters(&self) -> ArrayView1<'_, f64> {
        self.parameters.view()
    }

    fn residuals(&self) -> f64 {
        self.residual_norm
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

    /// `(JᵗJ)⁻¹` with the Jacobian evaluated at the current parameters
    fn compute_covariance_matrix(&mut self, target: &mut Array2<f64>) -> Result<bool, FitError> {
        if self.workspace.is_none() {
            return Err(FitError::NotInitialized);
        }
        self.recompute_jacobian()?;
        let ws = self.workspace.as_ref().ok_or(FitError::NotInitialized)?;
        ws.jtj.invert_into(target)?;
        Ok(true)
    }
}
