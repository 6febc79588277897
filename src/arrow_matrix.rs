use crate::error::FitError;
use crate::layout::ParameterLayout;
use crate::linalg::{LuDecomposition, gram};

use ndarray::{Array1, Array2, ArrayView2, ArrayViewMut2, s};
use std::ops::Range;

/// Symmetric "arrowhead" block matrix
///
/// The matrix consists of a leading (global) block, diagonal blocks for every dataset and the
/// coupling strips between the leading block and each diagonal block. The coupling between two
/// different non-leading blocks is structurally zero and takes no storage. This is the shape of
/// the normal-equations matrix `JᵗJ` of a multi-dataset fit where the parameters are ordered as
/// described in [ParameterLayout].
#[derive(Clone, Debug, PartialEq)]
pub struct ArrowBlockMatrix {
    sizes: Vec<usize>,
    offsets: Vec<usize>,
    diag: Vec<Array2<f64>>,
    top: Vec<Array2<f64>>,
    left: Vec<Array2<f64>>,
}

impl ArrowBlockMatrix {
    /// Allocates a zero matrix with the given block sizes, the first one is the leading block
    pub fn new(sizes: &[usize]) -> Result<Self, FitError> {
        if sizes.is_empty() {
            return Err(FitError::Allocation("at least one block is required".into()));
        }
        if let Some(i) = sizes.iter().position(|&s| s == 0) {
            return Err(FitError::Allocation(format!("block {i} has zero size")));
        }
        let offsets = std::iter::once(0)
            .chain(sizes.iter().scan(0, |acc, &s| {
                *acc += s;
                Some(*acc)
            }))
            .collect();
        let s0 = sizes[0];
        Ok(Self {
            sizes: sizes.to_vec(),
            offsets,
            diag: sizes.iter().map(|&s| Array2::zeros((s, s))).collect(),
            top: sizes[1..].iter().map(|&s| Array2::zeros((s0, s))).collect(),
            left: sizes[1..].iter().map(|&s| Array2::zeros((s, s0))).collect(),
        })
    }

    /// Allocates a matrix shaped after the free parameters of `layout`
    pub fn for_layout(layout: &ParameterLayout) -> Result<Self, FitError> {
        Self::new(layout.block_sizes())
    }

    pub fn total_size(&self) -> usize {
        self.offsets[self.sizes.len()]
    }

    pub fn block_sizes(&self) -> &[usize] {
        &self.sizes
    }

    pub fn block_count(&self) -> usize {
        self.sizes.len()
    }

    fn block_range(&self, block: usize) -> Range<usize> {
        self.offsets[block]..self.offsets[block + 1]
    }

    fn check_block(&self, block: usize, first: usize) -> Result<(), FitError> {
        if block < first || block >= self.block_count() {
            return Err(FitError::index("matrix block", block, self.block_count()));
        }
        Ok(())
    }

    /// Diagonal block, block 0 is the leading one
    pub fn diagonal(&self, block: usize) -> Result<ArrayView2<'_, f64>, FitError> {
        self.check_block(block, 0)?;
        Ok(self.diag[block].view())
    }

    /// Coupling of the leading block to block `block >= 1`, shape `s₀ × s_block`
    pub fn top(&self, block: usize) -> Result<ArrayView2<'_, f64>, FitError> {
        self.check_block(block, 1)?;
        Ok(self.top[block - 1].view())
    }

    /// Transposed counterpart of [ArrowBlockMatrix::top]
    pub fn left(&self, block: usize) -> Result<ArrayView2<'_, f64>, FitError> {
        self.check_block(block, 1)?;
        Ok(self.left[block - 1].view())
    }

    // (block, index inside the block)
    fn locate(&self, i: usize) -> Result<(usize, usize), FitError> {
        if i >= self.total_size() {
            return Err(FitError::index("matrix element", i, self.total_size()));
        }
        let block = self.offsets.partition_point(|&o| o <= i) - 1;
        Ok((block, i - self.offsets[block]))
    }

    /// Element of the full symmetric matrix, structurally-zero elements are zero
    pub fn get(&self, i: usize, j: usize) -> Result<f64, FitError> {
        let (bi, li) = self.locate(i)?;
        let (bj, lj) = self.locate(j)?;
        Ok(if bi == bj {
            self.diag[bi][(li, lj)]
        } else if bi == 0 {
            self.top[bj - 1][(li, lj)]
        } else if bj == 0 {
            self.left[bi - 1][(li, lj)]
        } else {
            0.0
        })
    }

    fn element_mut<'a>(
        &'a mut self,
        i: usize,
        j: usize,
    ) -> Result<(&'a mut f64, Option<&'a mut f64>), FitError> {
        let (bi, li) = self.locate(i)?;
        let (bj, lj) = self.locate(j)?;
        // The mirror of a diagonal-block element is in the same array, see update()
        if bi == bj {
            return Ok((&mut self.diag[bi][(li, lj)], None));
        }
        if bi == 0 {
            return Ok((
                &mut self.top[bj - 1][(li, lj)],
                Some(&mut self.left[bj - 1][(lj, li)]),
            ));
        }
        if bj == 0 {
            return Ok((
                &mut self.left[bi - 1][(li, lj)],
                Some(&mut self.top[bi - 1][(lj, li)]),
            ));
        }
        Err(FitError::index(
            "structurally zero matrix element",
            j,
            self.total_size(),
        ))
    }

    /// Sets the element `(i, j)` and its mirror `(j, i)`
    ///
    /// Fails with [FitError::Index] for elements coupling two different non-leading blocks.
    pub fn set(&mut self, i: usize, j: usize, value: f64) -> Result<(), FitError> {
        self.update(i, j, |x| *x = value)
    }

    /// Adds `value` to the element `(i, j)` and to its mirror `(j, i)`
    pub fn add(&mut self, i: usize, j: usize, value: f64) -> Result<(), FitError> {
        self.update(i, j, |x| *x += value)
    }

    fn update(&mut self, i: usize, j: usize, f: impl Fn(&mut f64)) -> Result<(), FitError> {
        let same_block = self.locate(i)?.0 == self.locate(j)?.0;
        let (element, mirror) = self.element_mut(i, j)?;
        f(element);
        if let Some(mirror) = mirror {
            f(mirror);
        }
        if same_block && i != j {
            let (mirror, _) = self.element_mut(j, i)?;
            f(mirror);
        }
        Ok(())
    }

    /// Sets all elements to zero
    pub fn clear(&mut self) {
        self.diag
            .iter_mut()
            .chain(self.top.iter_mut())
            .chain(self.left.iter_mut())
            .for_each(|block| block.fill(0.0));
    }

    /// Copies the values of a matrix with the same block structure
    pub fn copy_from(&mut self, other: &Self) -> Result<(), FitError> {
        if self.sizes != other.sizes {
            return Err(FitError::dimension(
                "block structure of the copied matrix",
                self.total_size(),
                other.total_size(),
            ));
        }
        self.clone_from(other);
        Ok(())
    }

    /// Adds `value` to every diagonal element, e.g. the Levenberg-Marquardt damping `JᵗJ + λI`
    pub fn add_to_diagonal(&mut self, value: f64) {
        for block in self.diag.iter_mut() {
            block.diag_mut().iter_mut().for_each(|x| *x += value);
        }
    }

    /// Sets the matrix to `srcᵗ src`, where `src` has one column per matrix row
    pub fn set_from_product(&mut self, src: ArrayView2<f64>) -> Result<(), FitError> {
        if src.ncols() != self.total_size() {
            return Err(FitError::dimension(
                "columns of the product source",
                self.total_size(),
                src.ncols(),
            ));
        }
        let global = src.slice(s![.., self.block_range(0)]);
        self.diag[0] = gram(global);
        for block in 1..self.block_count() {
            let local = src.slice(s![.., self.block_range(block)]);
            self.diag[block] = gram(local);
            let top = global.t().dot(&local);
            self.left[block - 1] = top.t().to_owned();
            self.top[block - 1] = top;
        }
        Ok(())
    }

    /// Writes the full `T × T` matrix into `target`
    pub fn expand_to_full_matrix(&self, target: &mut Array2<f64>) -> Result<(), FitError> {
        let t = self.total_size();
        if target.dim() != (t, t) {
            return Err(FitError::dimension(
                "expanded matrix size",
                t,
                if target.nrows() != t {
                    target.nrows()
                } else {
                    target.ncols()
                },
            ));
        }
        target.fill(0.0);
        self.write_blocks(target.view_mut());
        Ok(())
    }

    /// Full matrix as a new dense array
    pub fn to_full_matrix(&self) -> Array2<f64> {
        let t = self.total_size();
        let mut target = Array2::zeros((t, t));
        self.write_blocks(target.view_mut());
        target
    }

    // `target` must be a zeroed T × T matrix
    fn write_blocks(&self, mut target: ArrayViewMut2<f64>) {
        let global = self.block_range(0);
        target
            .slice_mut(s![global.clone(), global.clone()])
            .assign(&self.diag[0]);
        for block in 1..self.block_count() {
            let local = self.block_range(block);
            target
                .slice_mut(s![local.clone(), local.clone()])
                .assign(&self.diag[block]);
            target
                .slice_mut(s![global.clone(), local.clone()])
                .assign(&self.top[block - 1]);
            target
                .slice_mut(s![local, global.clone()])
                .assign(&self.left[block - 1]);
        }
    }

    fn factorize(&self) -> Result<ArrowFactorization, FitError> {
        let mut schur = self.diag[0].clone();
        let mut local = Vec::with_capacity(self.block_count() - 1);
        for block in 1..self.block_count() {
            let lu = LuDecomposition::new(self.diag[block].view()).map_err(|err| match err {
                FitError::Conditioning(msg) => {
                    FitError::Conditioning(format!("diagonal block {block}: {msg}"))
                }
                err => err,
            })?;
            // A_i⁻¹ C_iᵗ
            let mut coupling = self.left[block - 1].clone();
            lu.solve_matrix_in_place(&mut coupling)?;
            schur -= &self.top[block - 1].dot(&coupling);
            local.push((lu, coupling));
        }
        let schur = LuDecomposition::new(schur.view())?;
        Ok(ArrowFactorization { schur, local })
    }

    fn solve_factorized(
        &self,
        factors: &ArrowFactorization,
        rhs: &mut Array1<f64>,
    ) -> Result<(), FitError> {
        let global = self.block_range(0);
        let mut ys = Vec::with_capacity(factors.local.len());
        let mut reduced = rhs.slice(s![global.clone()]).to_owned();
        for (block, (lu, _)) in (1..self.block_count()).zip(factors.local.iter()) {
            let mut y = rhs.slice(s![self.block_range(block)]).to_owned();
            lu.solve_in_place(y.view_mut())?;
            reduced -= &self.top[block - 1].dot(&y);
            ys.push(y);
        }
        factors.schur.solve_in_place(reduced.view_mut())?;
        for ((block, (_, coupling)), y) in (1..self.block_count())
            .zip(factors.local.iter())
            .zip(ys.into_iter())
        {
            let x = y - coupling.dot(&reduced);
            rhs.slice_mut(s![self.block_range(block)]).assign(&x);
        }
        rhs.slice_mut(s![global]).assign(&reduced);
        Ok(())
    }

    /// Solves `A x = rhs` in place using the block Schur complement of the leading block
    ///
    /// Every non-leading diagonal block is factorized and eliminated, the reduced system of the
    /// leading block is solved and the local solutions are recovered by back-substitution.
    /// Singular blocks result in [FitError::Conditioning].
    pub fn solve(&self, rhs: &mut Array1<f64>) -> Result<(), FitError> {
        if rhs.len() != self.total_size() {
            return Err(FitError::dimension(
                "right-hand side",
                self.total_size(),
                rhs.len(),
            ));
        }
        let factors = self.factorize()?;
        self.solve_factorized(&factors, rhs)
    }

    /// Writes the dense inverse matrix into `target`
    pub fn invert_into(&self, target: &mut Array2<f64>) -> Result<(), FitError> {
        let t = self.total_size();
        if target.dim() != (t, t) {
            return Err(FitError::dimension(
                "inverse matrix size",
                t,
                if target.nrows() != t {
                    target.nrows()
                } else {
                    target.ncols()
                },
            ));
        }
        let factors = self.factorize()?;
        for k in 0..t {
            let mut column = Array1::zeros(t);
            column[k] = 1.0;
            self.solve_factorized(&factors, &mut column)?;
            target.column_mut(k).assign(&column);
        }
        Ok(())
    }
}

struct ArrowFactorization {
    schur: LuDecomposition,
    // LU of the diagonal block and A_i⁻¹ C_iᵗ
    local: Vec<(LuDecomposition, Array2<f64>)>,
}
