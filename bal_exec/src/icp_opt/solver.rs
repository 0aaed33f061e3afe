//! # QP solver adapter
//!
//! Sums the task contributions into a single QP of the form
//!
//! ```text
//! minimise    0.5 x' H x + g' x
//! subject to  A_eq x  = b_eq
//!             A_in x <= b_in
//! ```
//!
//! and solves it with the Clarabel interior point solver.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use clarabel::algebra::CscMatrix;
use clarabel::solver::{
    DefaultSettingsBuilder, DefaultSolver, IPSolver, SolverStatus,
    SupportedConeT::{NonnegativeConeT, ZeroConeT}
};
use log::trace;
use nalgebra::{DMatrix, DVector};
use std::time::Instant;

// Internal
use super::{OptStatus, QpIndex, SolverError, Task};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Limits on a single solve.
#[derive(Debug, Clone, Copy)]
pub struct SolverSettings {
    /// Wall clock budget for one solve. Passed to the solver as its time
    /// limit and checked again after the solve returns.
    ///
    /// Units: seconds
    pub max_solve_time_s: f64,

    /// Maximum number of interior point iterations.
    pub max_iters: u32
}

/// An assembled QP.
#[derive(Debug, Clone)]
pub struct QpProblem {
    pub hessian: DMatrix<f64>,
    pub gradient: DVector<f64>,
    pub a_eq: DMatrix<f64>,
    pub b_eq: DVector<f64>,
    pub a_in: DMatrix<f64>,
    pub b_in: DVector<f64>
}

/// A successful solve.
#[derive(Debug, Clone)]
pub struct QpOutcome {
    pub x: DVector<f64>,
    pub status: OptStatus,

    /// Units: seconds
    pub solve_time_s: f64
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl QpProblem {
    /// Sum the contributions of every task into one problem.
    pub fn assemble(tasks: &[Task], index: &QpIndex) -> Self {
        let n = index.size();

        let mut hessian = DMatrix::zeros(n, n);
        let mut gradient = DVector::zeros(n);
        let mut eq_rows: Vec<(DMatrix<f64>, DVector<f64>)> = Vec::new();
        let mut in_rows: Vec<(DMatrix<f64>, DVector<f64>)> = Vec::new();

        for task in tasks {
            let input = task.input(index);
            let size = input.quadratic.nrows();

            if size > 0 {
                let mut block = hessian.view_mut((input.offset, input.offset), (size, size));
                block += &input.quadratic;

                let mut rows = gradient.rows_mut(input.offset, size);
                rows += &input.linear;
            }

            if let Some(c) = input.equality {
                eq_rows.push((c.a, c.b));
            }
            if let Some(c) = input.inequality {
                in_rows.push((c.a, c.b));
            }
        }

        let (a_eq, b_eq) = stack_rows(&eq_rows, n);
        let (a_in, b_in) = stack_rows(&in_rows, n);

        Self {
            hessian,
            gradient,
            a_eq,
            b_eq,
            a_in,
            b_in
        }
    }

    /// Number of decision variables.
    pub fn num_variables(&self) -> usize {
        self.gradient.len()
    }

    /// Evaluate the cost at a point.
    pub fn cost(&self, x: &DVector<f64>) -> f64 {
        0.5 * x.dot(&(&self.hessian * x)) + self.gradient.dot(x)
    }

    /// Check the Hessian is positive definite.
    pub fn is_positive_definite(&self) -> bool {
        self.hessian.iter().all(|v| v.is_finite())
            && self.hessian.clone().cholesky().is_some()
    }

    /// Solve the problem.
    ///
    /// # Errors
    /// - `NumericalFailure` if the Hessian is not positive definite or the
    ///   solver reports a numerical problem.
    /// - `Infeasible` if the constraints cannot be satisfied.
    /// - `Timeout` if the solve ran out of time.
    /// - `NotConverged` if the iteration limit was reached.
    pub fn solve(&self, settings: &SolverSettings) -> Result<QpOutcome, SolverError> {
        if !self.is_positive_definite() {
            return Err(SolverError::NumericalFailure(
                String::from("the Hessian is not positive definite")))
        }

        let n_eq = self.a_eq.nrows();
        let n_in = self.a_in.nrows();
        let n = self.num_variables();

        // Equality rows must come first to match the cone order
        let mut a_all = DMatrix::zeros(n_eq + n_in, n);
        a_all.rows_mut(0, n_eq).copy_from(&self.a_eq);
        a_all.rows_mut(n_eq, n_in).copy_from(&self.a_in);

        let mut b_all: Vec<f64> = Vec::with_capacity(n_eq + n_in);
        b_all.extend(self.b_eq.iter());
        b_all.extend(self.b_in.iter());

        let q: Vec<f64> = self.gradient.iter().copied().collect();

        let p_csc = dmatrix_to_csc_upper_tri(&self.hessian);
        let a_csc = dmatrix_to_csc(&a_all);

        // Clarabel's nonnegative cone is `A x + s = b, s >= 0`, i.e. `A x <= b`
        let cones = [ZeroConeT(n_eq), NonnegativeConeT(n_in)];

        let clarabel_settings = DefaultSettingsBuilder::default()
            .max_iter(settings.max_iters)
            .time_limit(settings.max_solve_time_s)
            .verbose(false)
            .build()
            .map_err(|e| SolverError::Setup(format!("{:?}", e)))?;

        let start = Instant::now();

        let mut solver = DefaultSolver::new(&p_csc, &q, &a_csc, &b_all, &cones, clarabel_settings);
        solver.solve();

        let solve_time_s = start.elapsed().as_secs_f64();
        let sol = &solver.solution;

        trace!(
            "QP with {} variables solved in {:.06} s, status {:?}",
            n, solve_time_s, sol.status
        );

        let status = match sol.status {
            SolverStatus::Solved => OptStatus::Solved,
            SolverStatus::AlmostSolved => OptStatus::AlmostSolved,
            SolverStatus::PrimalInfeasible
            | SolverStatus::DualInfeasible
            | SolverStatus::AlmostPrimalInfeasible
            | SolverStatus::AlmostDualInfeasible => {
                return Err(SolverError::Infeasible(format!("{:?}", sol.status)))
            },
            SolverStatus::MaxTime => {
                return Err(SolverError::Timeout {
                    elapsed_s: solve_time_s,
                    budget_s: settings.max_solve_time_s
                })
            },
            SolverStatus::MaxIterations => {
                return Err(SolverError::NotConverged(settings.max_iters))
            },
            other => {
                return Err(SolverError::NumericalFailure(format!("{:?}", other)))
            }
        };

        // The solver only checks its time limit between iterations
        if solve_time_s > settings.max_solve_time_s {
            return Err(SolverError::Timeout {
                elapsed_s: solve_time_s,
                budget_s: settings.max_solve_time_s
            })
        }

        if sol.x.len() != n || sol.x.iter().any(|v| !v.is_finite()) {
            return Err(SolverError::NumericalFailure(
                String::from("the solution is not finite")))
        }

        Ok(QpOutcome {
            x: DVector::from_column_slice(&sol.x),
            status,
            solve_time_s
        })
    }
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

/// Stack constraint rows into a single matrix and vector.
fn stack_rows(rows: &[(DMatrix<f64>, DVector<f64>)], num_cols: usize) -> (DMatrix<f64>, DVector<f64>) {
    let num_rows = rows.iter().map(|(a, _)| a.nrows()).sum();

    let mut a_all = DMatrix::zeros(num_rows, num_cols);
    let mut b_all = DVector::zeros(num_rows);

    let mut row = 0;
    for (a, b) in rows {
        a_all.rows_mut(row, a.nrows()).copy_from(a);
        b_all.rows_mut(row, b.len()).copy_from(b);
        row += a.nrows();
    }

    (a_all, b_all)
}

/// Convert a nalgebra `DMatrix<f64>` to a Clarabel `CscMatrix<f64>`.
fn dmatrix_to_csc(m: &DMatrix<f64>) -> CscMatrix<f64> {
    let (nrows, ncols) = m.shape();
    let mut colptr = vec![0usize; ncols + 1];
    let mut rowval = Vec::new();
    let mut nzval = Vec::new();

    for j in 0..ncols {
        for i in 0..nrows {
            let v = m[(i, j)];
            if v != 0.0 {
                rowval.push(i);
                nzval.push(v);
            }
        }
        colptr[j + 1] = rowval.len();
    }

    CscMatrix::new(nrows, ncols, colptr, rowval, nzval)
}

/// Convert a symmetric nalgebra `DMatrix<f64>` to the upper triangular
/// `CscMatrix<f64>` Clarabel expects for the cost.
fn dmatrix_to_csc_upper_tri(m: &DMatrix<f64>) -> CscMatrix<f64> {
    let (nrows, ncols) = m.shape();
    let mut colptr = vec![0usize; ncols + 1];
    let mut rowval = Vec::new();
    let mut nzval = Vec::new();

    for j in 0..ncols {
        for i in 0..=j.min(nrows.saturating_sub(1)) {
            let v = m[(i, j)];
            if v != 0.0 {
                rowval.push(i);
                nzval.push(v);
            }
        }
        colptr[j + 1] = rowval.len();
    }

    CscMatrix::new(nrows, ncols, colptr, rowval, nzval)
}
