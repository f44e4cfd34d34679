//! Compressed sparse column operators.
//!
//! Every linear map in the engine (projection, finite differences, wavelet
//! analysis) is a `SparseOperator`. Storage is `faer`'s CSC matrix; the
//! products the estimators need are written directly against the column
//! pointers so the hot loops stay allocation-free apart from the output.

use crate::error::{Result, TomoError};
use faer::sparse::{SparseColMat, Triplet};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct SparseOperator {
    nrows: usize,
    ncols: usize,
    matrix: SparseColMat<usize, f64>,
}

/// Plain CSC arrays, used for persisting operators and comparing structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseParts {
    pub nrows: usize,
    pub ncols: usize,
    pub col_ptr: Vec<usize>,
    pub row_idx: Vec<usize>,
    pub values: Vec<f64>,
}

impl SparseOperator {
    /// Build from `(row, col, value)` entries. Duplicates are summed and
    /// entries that cancel to exactly zero are dropped.
    pub fn from_triplets(
        nrows: usize,
        ncols: usize,
        entries: impl IntoIterator<Item = (usize, usize, f64)>,
    ) -> Result<Self> {
        let mut entries: Vec<(usize, usize, f64)> = entries.into_iter().collect();
        for &(r, c, _) in &entries {
            if r >= nrows || c >= ncols {
                return Err(TomoError::Sparse(format!(
                    "entry ({r}, {c}) outside a {nrows}x{ncols} operator"
                )));
            }
        }
        entries.sort_unstable_by_key(|&(r, c, _)| (c, r));

        let mut triplets: Vec<Triplet<usize, usize, f64>> = Vec::with_capacity(entries.len());
        let mut iter = entries.into_iter().peekable();
        while let Some((r, c, mut v)) = iter.next() {
            while let Some(&(r2, c2, v2)) = iter.peek() {
                if r2 != r || c2 != c {
                    break;
                }
                v += v2;
                iter.next();
            }
            if v != 0.0 {
                triplets.push(Triplet::new(r, c, v));
            }
        }

        let matrix = SparseColMat::try_new_from_triplets(nrows, ncols, &triplets)
            .map_err(|e| TomoError::Sparse(format!("{e:?}")))?;
        Ok(Self {
            nrows,
            ncols,
            matrix,
        })
    }

    pub fn identity(n: usize) -> Result<Self> {
        Self::from_triplets(n, n, (0..n).map(|i| (i, i, 1.0)))
    }

    /// An operator with no stored entries.
    pub fn zeros(nrows: usize, ncols: usize) -> Result<Self> {
        Self::from_triplets(nrows, ncols, std::iter::empty())
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn nnz(&self) -> usize {
        let (symbolic, _) = self.matrix.parts();
        (0..self.ncols).map(|j| symbolic.col_range(j).len()).sum()
    }

    /// Row indices and values of column `j`.
    pub fn column(&self, j: usize) -> (&[usize], &[f64]) {
        let (symbolic, values) = self.matrix.parts();
        let range = symbolic.col_range(j);
        (&symbolic.row_idx()[range.clone()], &values[range])
    }

    /// `A x`.
    pub fn apply(&self, x: &[f64]) -> Vec<f64> {
        debug_assert_eq!(x.len(), self.ncols);
        let mut out = vec![0.0; self.nrows];
        for (j, &xj) in x.iter().enumerate() {
            if xj == 0.0 {
                continue;
            }
            let (rows, vals) = self.column(j);
            for (&r, &v) in rows.iter().zip(vals) {
                out[r] += v * xj;
            }
        }
        out
    }

    /// `Aᵗ v`. Each output entry is an independent column dot product, so the
    /// parallel evaluation is deterministic.
    pub fn apply_transpose(&self, v: &[f64]) -> Vec<f64> {
        debug_assert_eq!(v.len(), self.nrows);
        (0..self.ncols)
            .into_par_iter()
            .map(|j| {
                let (rows, vals) = self.column(j);
                rows.iter().zip(vals).map(|(&r, &a)| a * v[r]).sum()
            })
            .collect()
    }

    /// All stored entries as `(row, col, value)`, column-major.
    pub fn triplets(&self) -> Vec<(usize, usize, f64)> {
        let mut out = Vec::with_capacity(self.nnz());
        for j in 0..self.ncols {
            let (rows, vals) = self.column(j);
            out.extend(rows.iter().zip(vals).map(|(&r, &v)| (r, j, v)));
        }
        out
    }

    /// `self · rhs`.
    pub fn compose(&self, rhs: &SparseOperator) -> Result<Self> {
        if self.ncols != rhs.nrows {
            return Err(TomoError::Sparse(format!(
                "cannot compose {}x{} with {}x{}",
                self.nrows, self.ncols, rhs.nrows, rhs.ncols
            )));
        }
        let mut entries = Vec::new();
        for j in 0..rhs.ncols {
            let (mid_rows, mid_vals) = rhs.column(j);
            for (&k, &b) in mid_rows.iter().zip(mid_vals) {
                let (rows, vals) = self.column(k);
                entries.extend(rows.iter().zip(vals).map(|(&r, &a)| (r, j, a * b)));
            }
        }
        Self::from_triplets(self.nrows, rhs.ncols, entries)
    }

    /// Kronecker product `a ⊗ b`.
    pub fn kron(a: &SparseOperator, b: &SparseOperator) -> Result<Self> {
        let mut entries = Vec::with_capacity(a.nnz() * b.nnz());
        for (ra, ca, va) in a.triplets() {
            for (rb, cb, vb) in b.triplets() {
                entries.push((ra * b.nrows + rb, ca * b.ncols + cb, va * vb));
            }
        }
        Self::from_triplets(a.nrows * b.nrows, a.ncols * b.ncols, entries)
    }

    /// Stack operators with equal column counts on top of each other.
    pub fn vstack(blocks: &[&SparseOperator]) -> Result<Self> {
        let ncols = blocks.first().map_or(0, |b| b.ncols);
        let mut entries = Vec::new();
        let mut offset = 0;
        for block in blocks {
            if block.ncols != ncols {
                return Err(TomoError::Sparse(format!(
                    "cannot stack blocks with {} and {} columns",
                    ncols, block.ncols
                )));
            }
            entries.extend(
                block
                    .triplets()
                    .into_iter()
                    .map(|(r, c, v)| (r + offset, c, v)),
            );
            offset += block.nrows;
        }
        Self::from_triplets(offset, ncols, entries)
    }

    pub fn to_parts(&self) -> SparseParts {
        let mut col_ptr = Vec::with_capacity(self.ncols + 1);
        let mut row_idx = Vec::with_capacity(self.nnz());
        let mut values = Vec::with_capacity(self.nnz());
        col_ptr.push(0);
        for j in 0..self.ncols {
            let (rows, vals) = self.column(j);
            row_idx.extend_from_slice(rows);
            values.extend_from_slice(vals);
            col_ptr.push(row_idx.len());
        }
        SparseParts {
            nrows: self.nrows,
            ncols: self.ncols,
            col_ptr,
            row_idx,
            values,
        }
    }

    pub fn from_parts(parts: &SparseParts) -> Result<Self> {
        if parts.col_ptr.len() != parts.ncols + 1
            || parts.row_idx.len() != parts.values.len()
            || parts.col_ptr.last().copied() != Some(parts.values.len())
        {
            return Err(TomoError::Sparse("inconsistent CSC arrays".to_string()));
        }
        let mut entries = Vec::with_capacity(parts.values.len());
        for j in 0..parts.ncols {
            for idx in parts.col_ptr[j]..parts.col_ptr[j + 1] {
                entries.push((parts.row_idx[idx], j, parts.values[idx]));
            }
        }
        Self::from_triplets(parts.nrows, parts.ncols, entries)
    }
}

impl PartialEq for SparseOperator {
    fn eq(&self, other: &Self) -> bool {
        self.to_parts() == other.to_parts()
    }
}
