use crate::error::FitError;

use itertools::Itertools;
use ndarray::{Array1, ArrayView1};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Whether a parameter is shared by all datasets or owned by each of them
#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ParameterKind {
    Global,
    Local,
}

/// Named parameter of the fit model
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub struct ParameterDefinition {
    pub name: String,
    pub kind: ParameterKind,
}

impl ParameterDefinition {
    pub fn global(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ParameterKind::Global,
        }
    }

    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ParameterKind::Local,
        }
    }
}

/// Layout of the parameters of a multi-dataset fit
///
/// Every definition exists once per dataset in the "unpacked" representation, which is indexed
/// by `dataset * parameters_per_dataset() + definition`. Global parameters share a single value
/// across datasets. Only free parameters are seen by the fit engines: they are packed in the
/// arrowhead order, i.e. free global parameters first, then the free local parameters of the
/// first dataset, of the second one and so on. This order is what makes the normal-equations
/// matrix an [ArrowBlockMatrix](crate::ArrowBlockMatrix).
#[derive(Clone, Debug, PartialEq)]
pub struct ParameterLayout {
    definitions: Vec<ParameterDefinition>,
    // Row offsets of the datasets, one more than the number of datasets
    offsets: Vec<usize>,
    fixed: Vec<bool>,
    positions: Vec<Option<usize>>,
    // (definition, dataset) for every free position, dataset is None for globals
    free_parameters: Vec<(usize, Option<usize>)>,
    block_sizes: Vec<usize>,
}

impl ParameterLayout {
    /// Creates a layout with all the parameters free
    ///
    /// # Arguments
    /// - `points_per_dataset`: number of data points of each dataset, datasets occupy consecutive
    ///   rows of the residual vector in this order
    /// - `definitions`: parameter definitions, shared by all datasets
    pub fn new(
        points_per_dataset: Vec<usize>,
        definitions: Vec<ParameterDefinition>,
    ) -> Result<Self, FitError> {
        if points_per_dataset.is_empty() {
            return Err(FitError::dimension("number of datasets", 1, 0));
        }
        if let Some(&empty) = points_per_dataset.iter().find(|&&n| n == 0) {
            return Err(FitError::dimension("points in dataset", 1, empty));
        }
        if definitions.is_empty() {
            return Err(FitError::dimension("number of parameter definitions", 1, 0));
        }
        let offsets = std::iter::once(0)
            .chain(points_per_dataset.iter().scan(0, |acc, &n| {
                *acc += n;
                Some(*acc)
            }))
            .collect();
        let size = points_per_dataset.len() * definitions.len();
        let mut layout = Self {
            definitions,
            offsets,
            fixed: vec![false; size],
            positions: vec![None; size],
            free_parameters: vec![],
            block_sizes: vec![],
        };
        layout.compute_positions();
        Ok(layout)
    }

    fn compute_positions(&mut self) {
        let n_defs = self.definitions.len();
        let n_ds = self.dataset_count();
        self.positions.iter_mut().for_each(|p| *p = None);
        self.free_parameters.clear();
        self.block_sizes.clear();

        let globals = self
            .definitions
            .iter()
            .positions(|d| d.kind == ParameterKind::Global)
            .filter(|&def| !self.fixed[def])
            .collect_vec();
        for def in globals {
            let position = self.free_parameters.len();
            for ds in 0..n_ds {
                self.positions[ds * n_defs + def] = Some(position);
            }
            self.free_parameters.push((def, None));
        }
        self.block_sizes.push(self.free_parameters.len());

        for ds in 0..n_ds {
            let start = self.free_parameters.len();
            for def in 0..n_defs {
                let idx = ds * n_defs + def;
                if self.definitions[def].kind == ParameterKind::Local && !self.fixed[idx] {
                    self.positions[idx] = Some(self.free_parameters.len());
                    self.free_parameters.push((def, Some(ds)));
                }
            }
            self.block_sizes.push(self.free_parameters.len() - start);
        }
        self.block_sizes.retain(|&s| s > 0);
    }

    fn check_definition(&self, def: usize) -> Result<(), FitError> {
        if def >= self.definitions.len() {
            return Err(FitError::index(
                "parameter definition",
                def,
                self.definitions.len(),
            ));
        }
        Ok(())
    }

    fn check_dataset(&self, ds: usize) -> Result<(), FitError> {
        if ds >= self.dataset_count() {
            return Err(FitError::index("dataset", ds, self.dataset_count()));
        }
        Ok(())
    }

    /// Fixes or frees a parameter
    ///
    /// `dataset` is ignored for global parameters, `None` addresses all datasets of a local one.
    pub fn set_fixed(
        &mut self,
        def: usize,
        dataset: Option<usize>,
        fixed: bool,
    ) -> Result<(), FitError> {
        self.check_definition(def)?;
        if let Some(ds) = dataset {
            self.check_dataset(ds)?;
        }
        let n_defs = self.definitions.len();
        match (self.definitions[def].kind, dataset) {
            (ParameterKind::Local, Some(ds)) => self.fixed[ds * n_defs + def] = fixed,
            _ => (0..self.dataset_count()).for_each(|ds| self.fixed[ds * n_defs + def] = fixed),
        }
        self.compute_positions();
        Ok(())
    }

    /// Builder-style [ParameterLayout::set_fixed]
    pub fn with_fixed(mut self, def: usize, dataset: Option<usize>) -> Result<Self, FitError> {
        self.set_fixed(def, dataset, true)?;
        Ok(self)
    }

    pub fn is_fixed(&self, def: usize, dataset: usize) -> Result<bool, FitError> {
        self.check_definition(def)?;
        self.check_dataset(dataset)?;
        Ok(self.fixed[dataset * self.definitions.len() + def])
    }

    pub fn definitions(&self) -> &[ParameterDefinition] {
        &self.definitions
    }

    pub fn definition_index(&self, name: &str) -> Option<usize> {
        self.definitions.iter().position(|d| d.name == name)
    }

    pub fn is_global(&self, def: usize) -> Result<bool, FitError> {
        self.check_definition(def)?;
        Ok(self.definitions[def].kind == ParameterKind::Global)
    }

    /// Number of parameters solved for
    pub fn free_parameter_count(&self) -> usize {
        self.free_parameters.len()
    }

    pub fn dataset_count(&self) -> usize {
        self.offsets.len() - 1
    }

    /// Number of parameter definitions, i.e. the number of unpacked parameters per dataset
    pub fn parameters_per_dataset(&self) -> usize {
        self.definitions.len()
    }

    /// Size of the unpacked parameter vector
    pub fn full_parameter_count(&self) -> usize {
        self.fixed.len()
    }

    /// Total number of data points, i.e. the length of the residual vector
    pub fn data_points(&self) -> usize {
        self.offsets[self.offsets.len() - 1]
    }

    /// Rows of the residual vector belonging to the dataset
    pub fn dataset_range(&self, dataset: usize) -> Result<Range<usize>, FitError> {
        self.check_dataset(dataset)?;
        Ok(self.offsets[dataset]..self.offsets[dataset + 1])
    }

    /// Position of the parameter in the packed vector of free parameters
    ///
    /// Returns `None` for a fixed parameter. `dataset` is ignored for global parameters, a local
    /// parameter has no position without a dataset.
    pub fn position(&self, def: usize, dataset: Option<usize>) -> Result<Option<usize>, FitError> {
        self.check_definition(def)?;
        if let Some(ds) = dataset {
            self.check_dataset(ds)?;
        }
        let n_defs = self.definitions.len();
        Ok(match (self.definitions[def].kind, dataset) {
            (ParameterKind::Global, _) => self.positions[def],
            (ParameterKind::Local, Some(ds)) => self.positions[ds * n_defs + def],
            (ParameterKind::Local, None) => None,
        })
    }

    /// Definition and dataset (`None` for globals) of the free parameter at `position`
    pub fn free_parameter(&self, position: usize) -> Result<(usize, Option<usize>), FitError> {
        self.free_parameters
            .get(position)
            .copied()
            .ok_or_else(|| FitError::index("free parameter", position, self.free_parameters.len()))
    }

    /// Definition and dataset of every free parameter in the packed order
    pub fn free_parameters(&self) -> &[(usize, Option<usize>)] {
        &self.free_parameters
    }

    /// Sizes of the non-empty diagonal blocks of the normal-equations matrix
    ///
    /// The first one holds the free global parameters when there are any.
    pub fn block_sizes(&self) -> &[usize] {
        &self.block_sizes
    }

    /// Extracts the free parameters from an unpacked parameter vector
    pub fn pack_parameters(&self, unpacked: ArrayView1<f64>) -> Result<Array1<f64>, FitError> {
        if unpacked.len() != self.full_parameter_count() {
            return Err(FitError::dimension(
                "unpacked parameters",
                self.full_parameter_count(),
                unpacked.len(),
            ));
        }
        let n_defs = self.definitions.len();
        Ok(self
            .free_parameters
            .iter()
            .map(|&(def, ds)| unpacked[ds.unwrap_or(0) * n_defs + def])
            .collect())
    }

    /// Writes the free parameters into an unpacked parameter vector, fixed values are kept
    pub fn unpack_parameters(
        &self,
        packed: ArrayView1<f64>,
        unpacked: &mut Array1<f64>,
    ) -> Result<(), FitError> {
        if packed.len() != self.free_parameter_count() {
            return Err(FitError::dimension(
                "packed parameters",
                self.free_parameter_count(),
                packed.len(),
            ));
        }
        if unpacked.len() != self.full_parameter_count() {
            return Err(FitError::dimension(
                "unpacked parameters",
                self.full_parameter_count(),
                unpacked.len(),
            ));
        }
        let n_defs = self.definitions.len();
        for (&(def, ds), &value) in self.free_parameters.iter().zip(packed.iter()) {
            match ds {
                Some(ds) => unpacked[ds * n_defs + def] = value,
                None => (0..self.dataset_count()).for_each(|ds| unpacked[ds * n_defs + def] = value),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ndarray::array;

    fn three_datasets() -> ParameterLayout {
        ParameterLayout::new(
            vec![4, 5, 3],
            vec![
                ParameterDefinition::local("b"),
                ParameterDefinition::global("a"),
                ParameterDefinition::local("c"),
            ],
        )
        .unwrap()
    }

    #[test]
    fn arrowhead_order() {
        let layout = three_datasets();
        assert_eq!(layout.free_parameter_count(), 7);
        assert_eq!(layout.data_points(), 12);
        assert_eq!(layout.block_sizes(), &[1, 2, 2, 2]);
        assert_eq!(layout.position(1, None).unwrap(), Some(0));
        assert_eq!(layout.position(1, Some(2)).unwrap(), Some(0));
        assert_eq!(layout.position(0, Some(0)).unwrap(), Some(1));
        assert_eq!(layout.position(2, Some(0)).unwrap(), Some(2));
        assert_eq!(layout.position(0, Some(2)).unwrap(), Some(5));
        assert_eq!(layout.position(0, None).unwrap(), None);
        assert_eq!(layout.dataset_range(1).unwrap(), 4..9);
        assert_eq!(layout.free_parameter(6).unwrap(), (2, Some(2)));
    }

    #[test]
    fn fixing_parameters_shrinks_blocks() {
        let layout = three_datasets()
            .with_fixed(1, None)
            .unwrap()
            .with_fixed(2, Some(1))
            .unwrap();
        assert_eq!(layout.free_parameter_count(), 5);
        assert_eq!(layout.block_sizes(), &[2, 1, 2]);
        assert_eq!(layout.position(2, Some(1)).unwrap(), None);
        assert_eq!(layout.position(0, Some(1)).unwrap(), Some(2));
        assert!(layout.is_fixed(2, 1).unwrap());
        assert!(!layout.is_fixed(2, 0).unwrap());
    }

    #[test]
    fn pack_unpack() {
        let layout = three_datasets().with_fixed(2, Some(1)).unwrap();
        // b, a, c per dataset
        let unpacked = array![1.0, 10.0, 2.0, 3.0, 10.0, -1.0, 5.0, 10.0, 6.0];
        let packed = layout.pack_parameters(unpacked.view()).unwrap();
        assert_eq!(packed, array![10.0, 1.0, 2.0, 3.0, 5.0, 6.0]);

        let mut target = Array1::from_elem(9, 0.5);
        layout.unpack_parameters((&packed * 2.0).view(), &mut target).unwrap();
        assert_eq!(
            target,
            array![2.0, 20.0, 4.0, 6.0, 20.0, 0.5, 10.0, 20.0, 12.0]
        );
    }

    #[test]
    fn invalid_layouts() {
        let defs = vec![ParameterDefinition::global("a")];
        assert!(matches!(
            ParameterLayout::new(vec![], defs.clone()),
            Err(FitError::Dimension { .. })
        ));
        assert!(matches!(
            ParameterLayout::new(vec![3, 0], defs),
            Err(FitError::Dimension { .. })
        ));
        assert!(matches!(
            ParameterLayout::new(vec![3], vec![]),
            Err(FitError::Dimension { .. })
        ));
    }

    #[test]
    fn out_of_range_indices() {
        let layout = three_datasets();
        assert!(matches!(
            layout.position(3, None),
            Err(FitError::Index { index: 3, size: 3, .. })
        ));
        assert!(matches!(
            layout.dataset_range(3),
            Err(FitError::Index { .. })
        ));
        assert_eq!(layout.definition_index("c"), Some(2));
        assert_eq!(layout.definition_index("z"), None);
    }
}
