//! Linear-system assembly structures and the Krylov solve wrapper.
//!
//! The matrix keeps an explicit sparsity pattern across assemblies so
//! boundary conditions can reserve their fill-in once and the driver
//! can forbid zero insertions afterwards. Solves go through `kryst`'s
//! BiCGStab with the serial communicator.

use std::sync::Arc;

use kryst::solver::LinearSolver;
use kryst::{
    parallel::{NoComm, UniverseComm},
    preconditioner::PcSide,
};
use nalgebra::DVector;
use num_traits::Zero;

use crate::error::{Result, SolverError};

/// Insertion-mode flag threaded through every assembler. Assemblers
/// may promote the flag (NotSet -> Add -> Insert) but never demote it;
/// the driver resets it to NotSet at phase boundaries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertMode {
    NotSet,
    Add,
    Insert,
}

impl InsertMode {
    fn strength(self) -> u8 {
        match self {
            InsertMode::NotSet => 0,
            InsertMode::Add => 1,
            InsertMode::Insert => 2,
        }
    }

    pub fn promote(&mut self, to: InsertMode) {
        debug_assert!(
            to.strength() >= self.strength(),
            "insertion-mode demotion {:?} -> {:?}",
            self,
            to
        );
        if to.strength() > self.strength() {
            *self = to;
        }
    }
}

/// Sparse system matrix with assembly semantics: add/insert entries,
/// row redirection and row clearing for the boundary-condition
/// preprocess phase, and CSR export for the Krylov backend.
pub struct SysMatrix {
    n: usize,
    rows: Vec<Vec<(usize, f64)>>,
    ignore_zero_entries: bool,
}

impl SysMatrix {
    pub fn new(n: usize) -> Self {
        Self {
            n,
            rows: vec![Vec::new(); n],
            ignore_zero_entries: false,
        }
    }

    pub fn n_rows(&self) -> usize {
        self.n
    }

    pub fn nnz(&self) -> usize {
        self.rows.iter().map(Vec::len).sum()
    }

    /// Once set, entries of exactly zero no longer create new
    /// positions; existing positions are still written. Mirrors the
    /// backend's IGNORE_ZERO_ENTRIES option used after the first
    /// assembly has reserved the full pattern.
    pub fn set_ignore_zero_entries(&mut self, on: bool) {
        self.ignore_zero_entries = on;
    }

    /// Zero the values, keep the sparsity pattern.
    pub fn zero_entries(&mut self) {
        for row in &mut self.rows {
            for entry in row.iter_mut() {
                entry.1 = 0.0;
            }
        }
    }

    pub fn add(&mut self, i: usize, j: usize, v: f64) {
        self.write(i, j, v, false);
    }

    pub fn insert(&mut self, i: usize, j: usize, v: f64) {
        self.write(i, j, v, true);
    }

    /// Write under an explicit insertion mode. NotSet is a contract
    /// violation by the caller and treated as Add.
    pub fn set(&mut self, i: usize, j: usize, v: f64, mode: InsertMode) {
        debug_assert!(mode != InsertMode::NotSet, "write with unset insertion mode");
        self.write(i, j, v, mode == InsertMode::Insert);
    }

    fn write(&mut self, i: usize, j: usize, v: f64, overwrite: bool) {
        debug_assert!(i < self.n && j < self.n);
        let row = &mut self.rows[i];
        match row.binary_search_by_key(&j, |e| e.0) {
            Ok(pos) => {
                if overwrite {
                    row[pos].1 = v;
                } else {
                    row[pos].1 += v;
                }
            }
            Err(pos) => {
                if v.is_zero() && self.ignore_zero_entries {
                    return;
                }
                row.insert(pos, (j, v));
            }
        }
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.rows[i]
            .binary_search_by_key(&j, |e| e.0)
            .map(|pos| self.rows[i][pos].1)
            .unwrap_or(0.0)
    }

    /// Add each `src` row into the paired `dst` row.
    pub fn add_rows_to_rows(&mut self, src: &[usize], dst: &[usize]) {
        debug_assert_eq!(src.len(), dst.len());
        for (&s, &d) in src.iter().zip(dst) {
            if s == d {
                continue;
            }
            let moved = self.rows[s].clone();
            for (j, v) in moved {
                self.write(d, j, v, false);
            }
        }
    }

    /// Zero every listed row in place, keeping its pattern so the
    /// subsequent boundary insertions do not re-allocate.
    pub fn zero_rows(&mut self, rows: &[usize]) {
        for &i in rows {
            for entry in self.rows[i].iter_mut() {
                entry.1 = 0.0;
            }
        }
    }

    pub fn diagonal(&self) -> DVector<f64> {
        DVector::from_iterator(self.n, (0..self.n).map(|i| self.get(i, i)))
    }

    /// Left-scale: row i multiplied by l[i].
    pub fn scale_rows(&mut self, l: &DVector<f64>) {
        for (i, row) in self.rows.iter_mut().enumerate() {
            for entry in row.iter_mut() {
                entry.1 *= l[i];
            }
        }
    }

    pub fn to_csr(&self) -> kryst::matrix::sparse::CsrMatrix<f64> {
        let mut indptr = Vec::with_capacity(self.n + 1);
        let mut indices = Vec::with_capacity(self.nnz());
        let mut data = Vec::with_capacity(self.nnz());
        indptr.push(0);
        for row in &self.rows {
            for &(j, v) in row {
                indices.push(j);
                data.push(v);
            }
            indptr.push(indices.len());
        }
        kryst::matrix::sparse::CsrMatrix::from_csr(self.n, self.n, indptr, indices, data)
    }
}

/// Residual-vector counterpart of the preprocess row rewrite: add each
/// src component into its dst component, then zero the clear list.
pub fn vec_add_clear_rows(r: &mut DVector<f64>, src: &[usize], dst: &[usize], clear: &[usize]) {
    debug_assert_eq!(src.len(), dst.len());
    for (&s, &d) in src.iter().zip(dst) {
        if s != d {
            let v = r[s];
            r[d] += v;
        }
    }
    for &i in clear {
        r[i] = 0.0;
    }
}

/// Solve J y = b with BiCGStab. `tol` is the forcing-term tolerance
/// chosen by the Newton driver.
pub fn solve_bicgstab(
    matrix: &SysMatrix,
    rhs: &DVector<f64>,
    tol: f64,
    max_iterations: usize,
) -> Result<(DVector<f64>, usize)> {
    let n = matrix.n_rows();

    // solve against a unit-norm right-hand side so the tolerance acts
    // on the relative residual, then scale the solution back
    let rhs_norm = rhs.norm();
    if rhs_norm == 0.0 {
        return Ok((DVector::zeros(n), 0));
    }
    let b = rhs / rhs_norm;

    let op = kryst::matrix::op::CsrOp::new(Arc::new(matrix.to_csr()));

    let mut solver = kryst::solver::bicgstab::BiCgStabSolver::new(tol, max_iterations);
    let mut workspace = kryst::context::ksp_context::Workspace::new(n);
    solver.setup_workspace(&mut workspace);

    let mut y = DVector::from_element(n, 0.0);
    let stats = solver
        .solve(
            &op,
            None,
            b.as_slice(),
            y.as_mut_slice(),
            PcSide::Left,
            &UniverseComm::NoComm(NoComm {}),
            None,
            Some(&mut workspace),
        )
        .map_err(|e| SolverError::LinearSolveFailure(format!("{e:?}")))?;

    y *= rhs_norm;
    if !y.iter().all(|v| v.is_finite()) {
        return Err(SolverError::LinearSolveFailure(
            "non-finite entries in Krylov solution".into(),
        ));
    }

    Ok((y, stats.iterations))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_insert_modes() {
        let mut m = SysMatrix::new(3);
        m.add(0, 0, 1.0);
        m.add(0, 0, 2.0);
        assert_eq!(m.get(0, 0), 3.0);
        m.insert(0, 0, 5.0);
        assert_eq!(m.get(0, 0), 5.0);
    }

    #[test]
    fn preprocess_row_rewrite() {
        let mut m = SysMatrix::new(3);
        m.add(0, 0, 2.0);
        m.add(0, 1, -1.0);
        m.add(2, 2, 4.0);
        m.add_rows_to_rows(&[0], &[2]);
        assert_eq!(m.get(2, 0), 2.0);
        assert_eq!(m.get(2, 1), -1.0);
        assert_eq!(m.get(2, 2), 4.0);

        m.zero_rows(&[0]);
        assert_eq!(m.get(0, 0), 0.0);
        assert_eq!(m.get(0, 1), 0.0);

        let mut r = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        vec_add_clear_rows(&mut r, &[0], &[2], &[0]);
        assert_eq!(r[2], 4.0);
        assert_eq!(r[0], 0.0);
    }

    #[test]
    fn zero_entries_keeps_pattern_and_ignore_zero_blocks_new_fill() {
        let mut m = SysMatrix::new(2);
        m.add(0, 1, 3.0);
        m.zero_entries();
        assert_eq!(m.nnz(), 1);

        m.set_ignore_zero_entries(true);
        m.add(1, 0, 0.0);
        assert_eq!(m.nnz(), 1);
        m.add(0, 1, 0.0);
        assert_eq!(m.nnz(), 1);
    }

    #[test]
    fn insert_mode_promotes_but_never_demotes() {
        let mut mode = InsertMode::NotSet;
        mode.promote(InsertMode::Add);
        assert_eq!(mode, InsertMode::Add);
        mode.promote(InsertMode::Insert);
        assert_eq!(mode, InsertMode::Insert);
        // re-promoting to the same strength is a no-op
        mode.promote(InsertMode::Insert);
        assert_eq!(mode, InsertMode::Insert);
    }
}
