use crate::arrow_matrix::ArrowBlockMatrix;
use crate::error::FitError;
use crate::layout::ParameterLayout;

use itertools::Itertools;
use ndarray::{Array2, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Axis, s};
use std::ops::Range;

#[derive(Debug)]
enum Storage<'a> {
    /// One column per definition with at least one free instance
    Compact(Array2<f64>),
    /// One column per free parameter
    Dense(Array2<f64>),
    /// Same as `Dense`, but the storage is borrowed from the caller
    External(ArrayViewMut2<'a, f64>),
}

/// Jacobian of a multi-dataset fit
///
/// In the sparse mode, every parameter definition that is free for at least one dataset owns a
/// single column of length `data_points()`. For a global parameter it is the usual Jacobian
/// column, for a local parameter the rows of each dataset hold the derivatives with respect to
/// that dataset's own instance of the parameter. This is enough to compute `JᵗJ`, `Jᵗr` and
/// `J Δp` without ever forming the `data_points() × free_parameter_count()` matrix.
///
/// The dense modes store the conventional Jacobian, either owned or borrowed from the caller.
/// Columns obtained with [SparseJacobian::parameter_vector] for local parameters must then be
/// distributed to their datasets with [SparseJacobian::splice_parameter].
#[derive(Debug)]
pub struct SparseJacobian<'a> {
    layout: ParameterLayout,
    // Compact storage column of every definition
    columns: Vec<Option<usize>>,
    storage: Storage<'a>,
}

impl SparseJacobian<'static> {
    /// Jacobian with the compact storage
    pub fn new(layout: &ParameterLayout) -> Self {
        let mut columns = vec![None; layout.parameters_per_dataset()];
        let effective = layout
            .free_parameters()
            .iter()
            .map(|&(def, _)| def)
            .unique()
            .sorted()
            .collect_vec();
        for (column, &def) in effective.iter().enumerate() {
            columns[def] = Some(column);
        }
        Self {
            layout: layout.clone(),
            columns,
            storage: Storage::Compact(Array2::zeros((layout.data_points(), effective.len()))),
        }
    }

    /// Jacobian with the owned dense storage
    pub fn dense(layout: &ParameterLayout) -> Self {
        Self {
            layout: layout.clone(),
            columns: vec![None; layout.parameters_per_dataset()],
            storage: Storage::Dense(Array2::zeros((
                layout.data_points(),
                layout.free_parameter_count(),
            ))),
        }
    }
}

impl<'a> SparseJacobian<'a> {
    /// Jacobian writing into the caller-owned `data_points() × free_parameter_count()` matrix
    ///
    /// The matrix is zeroed.
    pub fn with_external(
        layout: &ParameterLayout,
        mut matrix: ArrayViewMut2<'a, f64>,
    ) -> Result<Self, FitError> {
        if matrix.nrows() != layout.data_points() {
            return Err(FitError::dimension(
                "rows of the external Jacobian",
                layout.data_points(),
                matrix.nrows(),
            ));
        }
        if matrix.ncols() != layout.free_parameter_count() {
            return Err(FitError::dimension(
                "columns of the external Jacobian",
                layout.free_parameter_count(),
                matrix.ncols(),
            ));
        }
        matrix.fill(0.0);
        Ok(Self {
            layout: layout.clone(),
            columns: vec![None; layout.parameters_per_dataset()],
            storage: Storage::External(matrix),
        })
    }

    pub fn layout(&self) -> &ParameterLayout {
        &self.layout
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self.storage, Storage::Compact(_))
    }

    fn matrix(&self) -> ArrayView2<'_, f64> {
        match &self.storage {
            Storage::Compact(m) | Storage::Dense(m) => m.view(),
            Storage::External(m) => m.view(),
        }
    }

    fn matrix_mut(&mut self) -> ArrayViewMut2<'_, f64> {
        match &mut self.storage {
            Storage::Compact(m) | Storage::Dense(m) => m.view_mut(),
            Storage::External(m) => m.view_mut(),
        }
    }

    // Storage column and row range of the free parameter at `position`
    fn support(&self, position: usize) -> (usize, Range<usize>) {
        let (def, ds) = self.layout.free_parameters()[position];
        let column = match self.storage {
            Storage::Compact(_) => self.columns[def].unwrap_or_default(),
            _ => position,
        };
        let rows = match ds {
            Some(ds) => self.layout.dataset_range(ds).unwrap_or_default(),
            None => 0..self.layout.data_points(),
        };
        (column, rows)
    }

    // Dense column collecting all the datasets of a local definition before the splice
    fn first_free_position(&self, def: usize) -> Option<usize> {
        (0..self.layout.dataset_count())
            .find_map(|ds| self.layout.position(def, Some(ds)).ok().flatten())
    }

    fn definition_column(&self, def: usize) -> Result<Option<usize>, FitError> {
        Ok(match self.storage {
            Storage::Compact(_) => {
                self.layout.is_global(def)?;
                self.columns[def]
            }
            _ => match self.layout.position(def, None)? {
                Some(position) => Some(position),
                None => self.first_free_position(def),
            },
        })
    }

    /// Column of a parameter definition over all data points
    ///
    /// For a local parameter the rows of every dataset receive the derivatives with respect to
    /// the instance of this dataset. Returns `None` if the parameter is fixed everywhere. In
    /// dense mode, local columns must be spliced afterwards.
    pub fn parameter_vector(
        &mut self,
        def: usize,
    ) -> Result<Option<ArrayViewMut1<'_, f64>>, FitError> {
        let Some(column) = self.definition_column(def)? else {
            return Ok(None);
        };
        Ok(Some(self.matrix_mut().index_axis_move(Axis(1), column)))
    }

    /// Rows of the dataset in the column of the parameter
    ///
    /// Returns `None` if the parameter is fixed for this dataset.
    pub fn parameter_vector_for_dataset(
        &mut self,
        def: usize,
        dataset: usize,
    ) -> Result<Option<ArrayViewMut1<'_, f64>>, FitError> {
        let rows = self.layout.dataset_range(dataset)?;
        let column = match self.layout.position(def, Some(dataset))? {
            None => return Ok(None),
            Some(position) => match self.storage {
                Storage::Compact(_) => self.columns[def],
                _ => Some(position),
            },
        };
        let Some(column) = column else {
            return Ok(None);
        };
        Ok(Some(self.matrix_mut().slice_move(s![rows, column])))
    }

    /// Moves the rows written through [SparseJacobian::parameter_vector] for a local parameter
    /// into the columns of the corresponding datasets
    ///
    /// Rows of datasets for which the parameter is fixed are zeroed. Does nothing in sparse mode
    /// and for global parameters.
    pub fn splice_parameter(&mut self, def: usize) -> Result<(), FitError> {
        if self.is_sparse() || self.layout.is_global(def)? {
            return Ok(());
        }
        let Some(source) = self.first_free_position(def) else {
            return Ok(());
        };
        for ds in 0..self.layout.dataset_count() {
            let rows = self.layout.dataset_range(ds)?;
            let target = self.layout.position(def, Some(ds))?;
            if target == Some(source) {
                continue;
            }
            let mut matrix = self.matrix_mut();
            let values = matrix.slice(s![rows.clone(), source]).to_owned();
            if let Some(target) = target {
                let mut target_rows = matrix.slice_mut(s![rows.clone(), target]);
                target_rows += &values;
            }
            matrix.slice_mut(s![rows, source]).fill(0.0);
        }
        Ok(())
    }

    /// [SparseJacobian::splice_parameter] for every definition
    pub fn splice_all(&mut self) -> Result<(), FitError> {
        for def in 0..self.layout.parameters_per_dataset() {
            self.splice_parameter(def)?;
        }
        Ok(())
    }

    // Calls f(p, q, JᵗJ[p, q]) for every structurally non-zero element with p <= q
    fn for_each_jtj_element(&self, mut f: impl FnMut(usize, usize, f64)) {
        let matrix = self.matrix();
        let dot = |p: usize, q: usize, rows: Range<usize>| {
            let (cp, _) = self.support(p);
            let (cq, _) = self.support(q);
            matrix
                .slice(s![rows.clone(), cp])
                .dot(&matrix.slice(s![rows, cq]))
        };
        let free = self.layout.free_parameters();
        let n_globals = free.iter().take_while(|(_, ds)| ds.is_none()).count();
        let all_rows = 0..self.layout.data_points();
        for p in 0..n_globals {
            for q in p..n_globals {
                f(p, q, dot(p, q, all_rows.clone()));
            }
        }
        let locals = (n_globals..free.len()).chunk_by(|&p| free[p].1);
        for (_, group) in &locals {
            let group = group.collect_vec();
            let (_, rows) = self.support(group[0]);
            for p in 0..n_globals {
                for &q in group.iter() {
                    f(p, q, dot(p, q, rows.clone()));
                }
            }
            for (i, &p) in group.iter().enumerate() {
                for &q in group[i..].iter() {
                    f(p, q, dot(p, q, rows.clone()));
                }
            }
        }
    }

    /// Computes the normal-equations matrix `JᵗJ`
    ///
    /// `target` must have the block structure of the layout, see
    /// [ArrowBlockMatrix::for_layout].
    pub fn compute_jtj(&self, target: &mut ArrowBlockMatrix) -> Result<(), FitError> {
        if target.block_sizes() != self.layout.block_sizes() {
            return Err(FitError::dimension(
                "normal-equations matrix size",
                self.layout.free_parameter_count(),
                target.total_size(),
            ));
        }
        if !self.is_sparse() {
            return target.set_from_product(self.matrix());
        }
        target.clear();
        let mut result = Ok(());
        self.for_each_jtj_element(|p, q, value| {
            if result.is_ok() {
                result = target.set(p, q, value);
            }
        });
        result
    }

    /// Computes `JᵗJ` into a dense `free_parameter_count()` square matrix
    pub fn compute_jtj_dense(&self, target: &mut Array2<f64>) -> Result<(), FitError> {
        let n = self.layout.free_parameter_count();
        if target.dim() != (n, n) {
            return Err(FitError::dimension(
                "normal-equations matrix size",
                n,
                target.nrows().max(target.ncols()),
            ));
        }
        target.fill(0.0);
        self.for_each_jtj_element(|p, q, value| {
            target[(p, q)] = value;
            target[(q, p)] = value;
        });
        Ok(())
    }

    /// Computes `scale Jᵗ residual`
    pub fn compute_gradient(
        &self,
        mut target: ArrayViewMut1<f64>,
        residual: ArrayView1<f64>,
        scale: f64,
    ) -> Result<(), FitError> {
        if target.len() != self.layout.free_parameter_count() {
            return Err(FitError::dimension(
                "gradient",
                self.layout.free_parameter_count(),
                target.len(),
            ));
        }
        if residual.len() != self.layout.data_points() {
            return Err(FitError::dimension(
                "residual vector",
                self.layout.data_points(),
                residual.len(),
            ));
        }
        let matrix = self.matrix();
        for (position, x) in target.iter_mut().enumerate() {
            let (column, rows) = self.support(position);
            *x = scale
                * matrix
                    .slice(s![rows.clone(), column])
                    .dot(&residual.slice(s![rows]));
        }
        Ok(())
    }

    /// Computes the change of the residuals `J delta_p` predicted by the linear model
    pub fn apply(
        &self,
        delta_p: ArrayView1<f64>,
        mut delta_r: ArrayViewMut1<f64>,
    ) -> Result<(), FitError> {
        if delta_p.len() != self.layout.free_parameter_count() {
            return Err(FitError::dimension(
                "parameter step",
                self.layout.free_parameter_count(),
                delta_p.len(),
            ));
        }
        if delta_r.len() != self.layout.data_points() {
            return Err(FitError::dimension(
                "residual change",
                self.layout.data_points(),
                delta_r.len(),
            ));
        }
        delta_r.fill(0.0);
        let matrix = self.matrix();
        for (position, &dp) in delta_p.iter().enumerate() {
            let (column, rows) = self.support(position);
            delta_r
                .slice_mut(s![rows.clone()])
                .scaled_add(dp, &matrix.slice(s![rows, column]));
        }
        Ok(())
    }

    /// Sets `self` to `self * factor + other`
    ///
    /// Both Jacobians must share the same layout and storage mode.
    pub fn add_jacobian(&mut self, other: &SparseJacobian, factor: f64) -> Result<(), FitError> {
        if self.layout != other.layout || self.is_sparse() != other.is_sparse() {
            return Err(FitError::dimension(
                "layout of the added Jacobian",
                self.layout.free_parameter_count(),
                other.layout.free_parameter_count(),
            ));
        }
        let mut matrix = self.matrix_mut();
        matrix *= factor;
        matrix += &other.matrix();
        Ok(())
    }

    /// Multiplies every derivative by `factor`
    pub fn scale(&mut self, factor: f64) {
        let mut matrix = self.matrix_mut();
        matrix *= factor;
    }

    pub fn clear(&mut self) {
        self.matrix_mut().fill(0.0);
    }

    /// Conventional `data_points() × free_parameter_count()` Jacobian
    pub fn to_dense(&self) -> Array2<f64> {
        let matrix = self.matrix();
        let mut dense = Array2::zeros((
            self.layout.data_points(),
            self.layout.free_parameter_count(),
        ));
        for position in 0..self.layout.free_parameter_count() {
            let (column, rows) = self.support(position);
            dense
                .slice_mut(s![rows.clone(), position])
                .assign(&matrix.slice(s![rows, column]));
        }
        dense
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::ParameterDefinition;
    use crate::linalg::gram;

    use approx::assert_abs_diff_eq;
    use ndarray::Array1;

    fn layout() -> ParameterLayout {
        ParameterLayout::new(
            vec![3, 4, 2],
            vec![
                ParameterDefinition::local("b"),
                ParameterDefinition::global("a"),
                ParameterDefinition::local("c"),
                ParameterDefinition::global("fixed"),
            ],
        )
        .unwrap()
        .with_fixed(3, None)
        .unwrap()
        .with_fixed(0, Some(1))
        .unwrap()
    }

    fn derivative(row: usize, def: usize, ds: usize) -> f64 {
        1.0 + row as f64 * 0.5 - def as f64 + 0.25 * (ds * ds) as f64
    }

    fn dataset_of_row(layout: &ParameterLayout, row: usize) -> usize {
        (0..layout.dataset_count())
            .find(|&ds| layout.dataset_range(ds).unwrap().contains(&row))
            .unwrap()
    }

    fn fill(jacobian: &mut SparseJacobian) {
        let layout = jacobian.layout().clone();
        for def in 0..layout.parameters_per_dataset() {
            if let Some(mut column) = jacobian.parameter_vector(def).unwrap() {
                for (row, x) in column.iter_mut().enumerate() {
                    *x = derivative(row, def, dataset_of_row(&layout, row));
                }
            }
        }
        jacobian.splice_all().unwrap();
    }

    fn expected_dense(layout: &ParameterLayout) -> Array2<f64> {
        let mut dense = Array2::zeros((layout.data_points(), layout.free_parameter_count()));
        for (position, &(def, ds)) in layout.free_parameters().iter().enumerate() {
            for row in 0..layout.data_points() {
                let row_ds = dataset_of_row(layout, row);
                if ds.is_none() || ds == Some(row_ds) {
                    dense[(row, position)] = derivative(row, def, row_ds);
                }
            }
        }
        dense
    }

    #[test]
    fn compact_storage_shape() {
        let layout = layout();
        assert_eq!(layout.free_parameter_count(), 6);
        let jacobian = SparseJacobian::new(&layout);
        assert!(jacobian.is_sparse());
        assert_eq!(jacobian.matrix().dim(), (9, 3));
        assert_eq!(jacobian.columns, vec![Some(0), Some(1), Some(2), None]);
    }

    #[test]
    fn sparse_and_dense_agree() {
        let layout = layout();
        let expected = expected_dense(&layout);
        let residual = Array1::linspace(-1.0, 2.0, layout.data_points());
        let delta_p = Array1::linspace(0.5, -0.5, layout.free_parameter_count());

        let mut sparse = SparseJacobian::new(&layout);
        let mut dense = SparseJacobian::dense(&layout);
        fill(&mut sparse);
        fill(&mut dense);
        for jacobian in [&sparse, &dense] {
            assert_abs_diff_eq!(jacobian.to_dense(), expected, epsilon = 1e-14);

            let mut jtj = ArrowBlockMatrix::for_layout(&layout).unwrap();
            jacobian.compute_jtj(&mut jtj).unwrap();
            assert_abs_diff_eq!(jtj.to_full_matrix(), gram(expected.view()), epsilon = 1e-12);

            let mut jtj_dense = Array2::zeros((6, 6));
            jacobian.compute_jtj_dense(&mut jtj_dense).unwrap();
            assert_abs_diff_eq!(jtj_dense, gram(expected.view()), epsilon = 1e-12);

            let mut gradient = Array1::zeros(6);
            jacobian
                .compute_gradient(gradient.view_mut(), residual.view(), -2.0)
                .unwrap();
            assert_abs_diff_eq!(gradient, -2.0 * expected.t().dot(&residual), epsilon = 1e-12);

            let mut delta_r = Array1::from_elem(9, f64::NAN);
            jacobian.apply(delta_p.view(), delta_r.view_mut()).unwrap();
            assert_abs_diff_eq!(delta_r, expected.dot(&delta_p), epsilon = 1e-12);
        }
    }

    #[test]
    fn local_columns_stay_inside_their_dataset() {
        let layout = layout();
        let mut jacobian = SparseJacobian::dense(&layout);
        fill(&mut jacobian);
        let dense = jacobian.to_dense();
        for (position, &(_, ds)) in layout.free_parameters().iter().enumerate() {
            let Some(ds) = ds else { continue };
            let rows = layout.dataset_range(ds).unwrap();
            for row in (0..layout.data_points()).filter(|row| !rows.contains(row)) {
                assert_eq!(dense[(row, position)], 0.0);
                assert_eq!(jacobian.matrix()[(row, position)], 0.0);
            }
        }
    }

    #[test]
    fn dataset_vectors() {
        let layout = layout();
        let mut jacobian = SparseJacobian::dense(&layout);
        assert!(
            jacobian
                .parameter_vector_for_dataset(0, 1)
                .unwrap()
                .is_none()
        );
        assert!(jacobian.parameter_vector(3).unwrap().is_none());
        {
            let mut v = jacobian.parameter_vector_for_dataset(2, 1).unwrap().unwrap();
            assert_eq!(v.len(), 4);
            v.fill(3.0);
        }
        jacobian.splice_all().unwrap();
        let position = layout.position(2, Some(1)).unwrap().unwrap();
        let dense = jacobian.to_dense();
        assert_eq!(dense.column(position).sum(), 12.0);
        assert_eq!(dense.sum(), 12.0);
    }

    #[test]
    fn external_storage() {
        let layout = layout();
        let mut storage = Array2::from_elem((9, 6), 1.0);
        {
            let mut jacobian = SparseJacobian::with_external(&layout, storage.view_mut()).unwrap();
            assert!(!jacobian.is_sparse());
            assert_eq!(jacobian.to_dense().sum(), 0.0);
            fill(&mut jacobian);
        }
        assert_abs_diff_eq!(storage, expected_dense(&layout), epsilon = 1e-14);

        let mut wrong = Array2::zeros((9, 5));
        assert!(matches!(
            SparseJacobian::with_external(&layout, wrong.view_mut()),
            Err(FitError::Dimension {
                expected: 6,
                actual: 5,
                ..
            })
        ));
    }

    #[test]
    fn scale_and_add() {
        let layout = layout();
        let mut a = SparseJacobian::new(&layout);
        let mut b = SparseJacobian::new(&layout);
        fill(&mut a);
        fill(&mut b);
        b.scale(0.5);
        a.add_jacobian(&b, 3.0).unwrap();
        assert_abs_diff_eq!(a.to_dense(), 3.5 * expected_dense(&layout), epsilon = 1e-12);

        let dense = SparseJacobian::dense(&layout);
        assert!(a.add_jacobian(&dense, 1.0).is_err());
        a.clear();
        assert_eq!(a.to_dense().sum(), 0.0);
    }

    #[test]
    fn contract_violations() {
        let layout = layout();
        let mut jacobian = SparseJacobian::new(&layout);
        assert!(matches!(
            jacobian.parameter_vector(4),
            Err(FitError::Index { index: 4, .. })
        ));
        assert!(matches!(
            jacobian.parameter_vector_for_dataset(0, 3),
            Err(FitError::Index { index: 3, .. })
        ));
        assert!(matches!(
            jacobian.compute_gradient(Array1::zeros(5).view_mut(), Array1::zeros(9).view(), 1.0),
            Err(FitError::Dimension { .. })
        ));
        assert!(matches!(
            jacobian.apply(Array1::zeros(6).view(), Array1::zeros(8).view_mut()),
            Err(FitError::Dimension { .. })
        ));
        let mut wrong = ArrowBlockMatrix::new(&[1, 2, 2]).unwrap();
        assert!(jacobian.compute_jtj(&mut wrong).is_err());
    }
}
