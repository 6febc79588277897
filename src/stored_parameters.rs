use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Parameter vector together with the norm of its residuals
///
/// Comparison only looks at the residual norm, so that sorting puts the best point first.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredParameters {
    pub parameters: Array1<f64>,
    pub residuals: f64,
}

impl StoredParameters {
    pub fn new(parameters: Array1<f64>, residuals: f64) -> Self {
        Self {
            parameters,
            residuals,
        }
    }

    pub fn from_view(parameters: ArrayView1<f64>, residuals: f64) -> Self {
        Self::new(parameters.to_owned(), residuals)
    }

    /// Residuals ordering, NaN is worse than anything else
    pub fn total_cmp_residuals(&self, other: &Self) -> Ordering {
        match (self.residuals.is_nan(), other.residuals.is_nan()) {
            (false, false) => self.residuals.total_cmp(&other.residuals),
            (a, b) => a.cmp(&b),
        }
    }
}

impl PartialEq for StoredParameters {
    fn eq(&self, other: &Self) -> bool {
        self.residuals == other.residuals
    }
}

impl PartialOrd for StoredParameters {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.residuals.partial_cmp(&other.residuals)
    }
}

/// Stack of the points visited by a fit engine, in insertion order
///
/// The history is never truncated by the engines.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ParameterHistory {
    entries: Vec<StoredParameters>,
}

impl ParameterHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: StoredParameters) {
        self.entries.push(entry);
    }

    pub fn pop(&mut self) -> Option<StoredParameters> {
        self.entries.pop()
    }

    /// Most recently pushed entry
    pub fn last(&self) -> Option<&StoredParameters> {
        self.entries.last()
    }

    /// Entry with the smallest residuals, the earliest one wins a tie
    pub fn best(&self) -> Option<&StoredParameters> {
        self.entries
            .iter()
            .reduce(|best, x| match x.total_cmp_residuals(best) {
                Ordering::Less => x,
                _ => best,
            })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> std::slice::Iter<'_, StoredParameters> {
        self.entries.iter()
    }

    pub fn as_slice(&self) -> &[StoredParameters] {
        &self.entries
    }
}

impl<'a> IntoIterator for &'a ParameterHistory {
    type Item = &'a StoredParameters;
    type IntoIter = std::slice::Iter<'a, StoredParameters>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
