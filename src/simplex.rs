use crate::error::FitError;
use crate::stored_parameters::StoredParameters;

use log::trace;
use ndarray::{Array1, ArrayView1};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Scalar function minimized by [Simplex]
///
/// [FitError::Domain] marks an infeasible point, the simplex then retries closer to the point it
/// came from. Any other error is propagated.
pub trait Objective {
    fn value(&mut self, parameters: ArrayView1<f64>) -> Result<f64, FitError>;
}

impl<F> Objective for F
where
    F: FnMut(ArrayView1<f64>) -> Result<f64, FitError>,
{
    fn value(&mut self, parameters: ArrayView1<f64>) -> Result<f64, FitError> {
        self(parameters)
    }
}

/// Nelder-Mead coefficients
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename = "Simplex")]
pub struct SimplexOptions {
    /// Reflection factor
    pub alpha: f64,
    /// Expansion factor
    pub beta: f64,
    /// Contraction factor
    pub gamma: f64,
    /// Shrink factor
    pub delta: f64,
    /// Maximum fractional change of the best vertex, or spread of the vertices around it, to
    /// report convergence
    #[serde(rename = "end_threshold")]
    pub threshold: f64,
    /// Smallest fraction of a step tried before giving up on an infeasible direction
    pub min_step_fraction: f64,
    /// Factor applied to a coordinate of the initial guess to build the initial vertices
    pub initial_vertex_factor: f64,
}

impl SimplexOptions {
    /// Create a new [SimplexOptions]
    ///
    /// # Arguments
    /// - `alpha`: reflection factor, positive
    /// - `beta`: expansion factor, larger than one
    /// - `gamma`: contraction factor, between zero and one
    /// - `delta`: shrink factor, between zero and one
    /// - `threshold`: fractional change of the best vertex below which the iterations converge
    /// - `min_step_fraction`: step fraction below which an infeasible direction is abandoned
    /// - `initial_vertex_factor`: factor used to build the initial simplex, positive and not one
    pub fn new(
        alpha: f64,
        beta: f64,
        gamma: f64,
        delta: f64,
        threshold: f64,
        min_step_fraction: f64,
        initial_vertex_factor: f64,
    ) -> Self {
        assert!(alpha > 0.0, "alpha must be positive");
        assert!(beta > 1.0, "beta must be larger than unity");
        assert!(gamma > 0.0 && gamma < 1.0, "gamma must be in (0, 1)");
        assert!(delta > 0.0 && delta < 1.0, "delta must be in (0, 1)");
        assert!(threshold >= 0.0, "threshold must be non-negative");
        assert!(
            min_step_fraction > 0.0 && min_step_fraction <= 1.0,
            "min_step_fraction must be in (0, 1]"
        );
        assert!(
            initial_vertex_factor > 0.0 && initial_vertex_factor != 1.0,
            "initial_vertex_factor must be positive and not unity"
        );
        Self {
            alpha,
            beta,
            gamma,
            delta,
            threshold,
            min_step_fraction,
            initial_vertex_factor,
        }
    }

    #[inline]
    pub fn default_alpha() -> f64 {
        1.0
    }

    #[inline]
    pub fn default_beta() -> f64 {
        2.0
    }

    #[inline]
    pub fn default_gamma() -> f64 {
        0.5
    }

    #[inline]
    pub fn default_delta() -> f64 {
        0.5
    }

    #[inline]
    pub fn default_threshold() -> f64 {
        1e-4
    }

    #[inline]
    pub fn default_min_step_fraction() -> f64 {
        1e-3
    }

    #[inline]
    pub fn default_initial_vertex_factor() -> f64 {
        2.0
    }

    /// Same options with another convergence threshold
    pub fn with_threshold(self, threshold: f64) -> Self {
        Self::new(
            self.alpha,
            self.beta,
            self.gamma,
            self.delta,
            threshold,
            self.min_step_fraction,
            self.initial_vertex_factor,
        )
    }
}

impl Default for SimplexOptions {
    fn default() -> Self {
        Self::new(
            Self::default_alpha(),
            Self::default_beta(),
            Self::default_gamma(),
            Self::default_delta(),
            Self::default_threshold(),
            Self::default_min_step_fraction(),
            Self::default_initial_vertex_factor(),
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimplexStatus {
    Continue,
    Converged,
}

fn linear_combination(
    f1: f64,
    v1: ArrayView1<f64>,
    f2: f64,
    v2: ArrayView1<f64>,
) -> Array1<f64> {
    let mut result = &v1 * f1;
    result.scaled_add(f2, &v2);
    result
}

/// Added to the magnitude of the reference value when measuring relative changes
pub const RELATIVE_CHANGE_FLOOR: f64 = 1e-3;

fn relative_change(x: f64, reference: f64) -> f64 {
    (x - reference).abs() / (RELATIVE_CHANGE_FLOOR + reference.abs())
}

/// Nelder-Mead minimizer
///
/// Vertices are kept sorted by the objective value, the best one first.
#[derive(Clone, Debug)]
pub struct Simplex<O> {
    objective: O,
    options: SimplexOptions,
    vertices: Vec<StoredParameters>,
}

impl<O: Objective> Simplex<O> {
    pub fn new(objective: O, options: SimplexOptions) -> Self {
        Self {
            objective,
            options,
            vertices: vec![],
        }
    }

    pub fn options(&self) -> &SimplexOptions {
        &self.options
    }

    pub fn objective(&self) -> &O {
        &self.objective
    }

    pub fn objective_mut(&mut self) -> &mut O {
        &mut self.objective
    }

    pub fn vertices(&self) -> &[StoredParameters] {
        &self.vertices
    }

    /// Replaces the vertices and sorts them
    ///
    /// A simplex in `n` dimensions has `n + 1` vertices of the same length, otherwise
    /// [FitError::Dimension] is returned and the current vertices are kept.
    pub fn set_vertices(&mut self, vertices: Vec<StoredParameters>) -> Result<(), FitError> {
        let dim = vertices.first().map_or(0, |v| v.parameters.len());
        if vertices.len() != dim + 1 {
            return Err(FitError::dimension(
                "simplex vertex count",
                dim + 1,
                vertices.len(),
            ));
        }
        if let Some(vertex) = vertices.iter().find(|v| v.parameters.len() != dim) {
            return Err(FitError::dimension(
                "simplex vertex",
                dim,
                vertex.parameters.len(),
            ));
        }
        self.vertices = vertices;
        self.sort();
        Ok(())
    }

    /// Best vertex, `None` before initialization
    pub fn best(&self) -> Option<&StoredParameters> {
        self.vertices.first()
    }

    /// Evaluates the objective, non-finite values mean an infeasible point
    pub fn compute(&mut self, x: Array1<f64>) -> Result<StoredParameters, FitError> {
        let value = self.objective.value(x.view())?;
        if !value.is_finite() {
            return Err(FitError::Domain(format!("objective value is {value}")));
        }
        Ok(StoredParameters::new(x, value))
    }

    pub fn sort(&mut self) {
        self.vertices.sort_by(|a, b| a.total_cmp_residuals(b));
    }

    /// Evaluates `dest`, or a point between `origin` and `dest` if `dest` is infeasible
    ///
    /// The step is halved while the objective reports [FitError::Domain], down to the minimum
    /// step fraction.
    pub fn step_towards(
        &mut self,
        origin: ArrayView1<f64>,
        dest: ArrayView1<f64>,
    ) -> Result<StoredParameters, FitError> {
        let mut factor = 1.0;
        while factor >= self.options.min_step_fraction {
            let point = linear_combination(factor, dest, 1.0 - factor, origin);
            match self.compute(point) {
                Err(FitError::Domain(msg)) => {
                    trace!("simplex: infeasible point at step fraction {factor}: {msg}");
                    factor *= 0.5;
                }
                result => return result,
            }
        }
        Err(FitError::UnreachableStep)
    }

    /// Vertex built from `center` by scaling its `idx` coordinate
    ///
    /// The coordinate is multiplied by the initial vertex factor, or set to it when it is zero.
    /// If no feasible point is found in this direction, the opposite scaling is tried.
    pub fn initial_vertex(
        &mut self,
        center: ArrayView1<f64>,
        idx: usize,
    ) -> Result<StoredParameters, FitError> {
        if idx >= center.len() {
            return Err(FitError::index("simplex coordinate", idx, center.len()));
        }
        let factor = self.options.initial_vertex_factor;
        let mut target = center.to_owned();
        target[idx] = if center[idx] != 0.0 {
            center[idx] * factor
        } else {
            factor
        };
        match self.step_towards(center, target.view()) {
            Err(FitError::UnreachableStep) => {}
            result => return result,
        }
        target[idx] = if center[idx] != 0.0 {
            center[idx] / factor
        } else {
            1.0 / factor
        };
        self.step_towards(center, target.view())
    }

    /// Builds the `n + 1` initial vertices around a feasible `center`
    pub fn initialize(&mut self, center: ArrayView1<f64>) -> Result<(), FitError> {
        let mut vertices = Vec::with_capacity(center.len() + 1);
        vertices.push(self.compute(center.to_owned())?);
        for idx in 0..center.len() {
            vertices.push(self.initial_vertex(center, idx)?);
        }
        self.set_vertices(vertices)
    }

    /// Mean of all the vertices but the worst one
    pub fn centroid(&self) -> Result<Array1<f64>, FitError> {
        let n = match self.vertices.len() {
            0 => return Err(FitError::NotInitialized),
            1 => 1,
            n => n - 1,
        };
        let mut centroid = self.vertices[0].parameters.clone();
        for vertex in &self.vertices[1..n] {
            centroid += &vertex.parameters;
        }
        centroid /= n as f64;
        Ok(centroid)
    }

    fn worst_mut(&mut self) -> Result<&mut StoredParameters, FitError> {
        self.vertices.last_mut().ok_or(FitError::NotInitialized)
    }

    /// Performs one Nelder-Mead step
    ///
    /// The centroid of all the vertices but the worst is used when `centroid` is `None`.
    pub fn iterate(
        &mut self,
        centroid: Option<ArrayView1<f64>>,
    ) -> Result<SimplexStatus, FitError> {
        if self.vertices.len() < 2 {
            return Err(FitError::NotInitialized);
        }
        let c = match centroid {
            Some(c) => {
                if c.len() != self.vertices[0].parameters.len() {
                    return Err(FitError::dimension(
                        "simplex centroid",
                        self.vertices[0].parameters.len(),
                        c.len(),
                    ));
                }
                c.to_owned()
            }
            None => self.centroid()?,
        };
        let n = self.vertices.len();
        let best = self.vertices[0].clone();
        let worst = self.vertices[n - 1].clone();
        let (alpha, beta, gamma, delta) = (
            self.options.alpha,
            self.options.beta,
            self.options.gamma,
            self.options.delta,
        );

        // x_r = c + alpha (c - x_worst)
        let t = linear_combination(1.0 + alpha, c.view(), -alpha, worst.parameters.view());
        let mut r = self.step_towards(c.view(), t.view())?;
        trace!("simplex: reflection {:e}", r.residuals);

        if r < best {
            // x_e = c + beta (x_r - c)
            let t = linear_combination(1.0 - beta, c.view(), beta, r.parameters.view());
            match self.step_towards(c.view(), t.view()) {
                Ok(e) => {
                    trace!("simplex: expansion {:e}", e.residuals);
                    if e < r {
                        r = e;
                    }
                }
                Err(FitError::UnreachableStep) => {}
                Err(err) => return Err(err),
            }
            *self.worst_mut()? = r;
        } else if r < self.vertices[n - 2] {
            *self.worst_mut()? = r;
        } else {
            let improved = if worst < r {
                // x_oc = c + gamma (x_r - c)
                let t = linear_combination(1.0 - gamma, c.view(), gamma, r.parameters.view());
                let contracted = self.step_towards(c.view(), t.view())?;
                trace!("simplex: outer contraction {:e}", contracted.residuals);
                (contracted < r).then_some(contracted)
            } else {
                // x_ic = c - gamma (x_r - c)
                let t = linear_combination(1.0 + gamma, c.view(), -gamma, r.parameters.view());
                let contracted = self.step_towards(c.view(), t.view())?;
                trace!("simplex: inner contraction {:e}", contracted.residuals);
                (contracted < worst).then_some(contracted)
            };
            match improved {
                Some(vertex) => *self.worst_mut()? = vertex,
                None => {
                    trace!("simplex: shrink towards the best vertex");
                    for i in 1..n {
                        let t = linear_combination(
                            1.0 - delta,
                            best.parameters.view(),
                            delta,
                            self.vertices[i].parameters.view(),
                        );
                        self.vertices[i] = self.step_towards(best.parameters.view(), t.view())?;
                    }
                }
            }
        }
        self.sort();

        let new_best = &self.vertices[0].parameters;
        let threshold = self.options.threshold;
        let within_threshold = |a: &Array1<f64>, b: &Array1<f64>| {
            a.iter()
                .zip(b.iter())
                .all(|(&x, &reference)| relative_change(x, reference) <= threshold)
        };
        // The best vertex may stay in place while the others contract around it
        let converged = (*new_best != best.parameters
            && within_threshold(new_best, &best.parameters))
            || self.vertices[1..]
                .iter()
                .all(|vertex| within_threshold(&vertex.parameters, new_best));
        Ok(if converged {
            SimplexStatus::Converged
        } else {
            SimplexStatus::Continue
        })
    }
}
