use crate::error::{FitError, ModelError};
use crate::layout::ParameterLayout;
use crate::sparse_jacobian::SparseJacobian;

use ndarray::{Array1, ArrayView1, ArrayViewMut1, Zip};

/// Relative step of the forward finite differences
pub const FINITE_DIFFERENCE_STEP: f64 = 1e-6;
/// Step used for parameters equal to zero
pub const FINITE_DIFFERENCE_ZERO_STEP: f64 = 1e-8;

/// Residuals of a multi-dataset model and their derivatives
///
/// All the methods take the packed vector of free parameters, see [ParameterLayout]. Values of
/// the fixed parameters are owned by the implementation.
pub trait FitFunction {
    fn layout(&self) -> &ParameterLayout;

    /// Writes `model - data` for every data point, datasets are concatenated in layout order
    fn residuals(
        &self,
        parameters: ArrayView1<f64>,
        target: ArrayViewMut1<f64>,
    ) -> Result<(), ModelError>;

    /// Fills the derivatives of the residuals, `target` is cleared by the caller
    ///
    /// Default implementation uses forward finite differences.
    fn jacobian(
        &self,
        parameters: ArrayView1<f64>,
        target: &mut SparseJacobian,
    ) -> Result<(), ModelError> {
        forward_difference_jacobian(self, parameters, target)
    }
}

impl<F: FitFunction + ?Sized> FitFunction for &F {
    fn layout(&self) -> &ParameterLayout {
        (**self).layout()
    }

    fn residuals(
        &self,
        parameters: ArrayView1<f64>,
        target: ArrayViewMut1<f64>,
    ) -> Result<(), ModelError> {
        (**self).residuals(parameters, target)
    }

    fn jacobian(
        &self,
        parameters: ArrayView1<f64>,
        target: &mut SparseJacobian,
    ) -> Result<(), ModelError> {
        (**self).jacobian(parameters, target)
    }
}

fn contract_error(error: FitError) -> ModelError {
    ModelError::Failed(error.to_string())
}

/// Jacobian approximated with one residual evaluation per free parameter
///
/// The step is `1e-6 |p|`, or `1e-8` if `p` is zero. Only the rows of the owning dataset are
/// written for local parameters.
pub fn forward_difference_jacobian<F: FitFunction + ?Sized>(
    function: &F,
    parameters: ArrayView1<f64>,
    target: &mut SparseJacobian,
) -> Result<(), ModelError> {
    let layout = function.layout();
    let mut base = Array1::zeros(layout.data_points());
    function.residuals(parameters, base.view_mut())?;
    let mut shifted = parameters.to_owned();
    let mut residuals = Array1::zeros(layout.data_points());
    for (position, &(def, dataset)) in layout.free_parameters().iter().enumerate() {
        let p = parameters[position];
        let step = if p == 0.0 {
            FINITE_DIFFERENCE_ZERO_STEP
        } else {
            FINITE_DIFFERENCE_STEP * p.abs()
        };
        shifted[position] = p + step;
        function.residuals(shifted.view(), residuals.view_mut())?;
        shifted[position] = p;

        match dataset {
            None => {
                if let Some(mut column) = target.parameter_vector(def).map_err(contract_error)? {
                    Zip::from(&mut column)
                        .and(&residuals)
                        .and(&base)
                        .for_each(|d, &r, &r0| *d = (r - r0) / step);
                }
            }
            Some(ds) => {
                let rows = layout.dataset_range(ds).map_err(contract_error)?;
                if let Some(mut column) = target
                    .parameter_vector_for_dataset(def, ds)
                    .map_err(contract_error)?
                {
                    for (d, row) in column.iter_mut().zip(rows) {
                        *d = (residuals[row] - base[row]) / step;
                    }
                }
            }
        }
    }
    Ok(())
}
