//! Minimal affine-LMI problem representation and the base-relaxation builder.
//!
//! This is deliberately not a modeling language. The regressors in this crate
//! need exactly: named matrix variables (possibly symmetric), matrix
//! expressions affine in those variables (transposes, constant left/right
//! products, block assembly, scalar-times-identity), PSD constraints, and a
//! scalar objective with linear terms plus squares of scalar variables. The
//! IR covers that set and nothing more; a solver backend consumes it through
//! the read-only accessors at the bottom.

use crate::factorization::{FactorForm, Factorization};
use crate::stats::SufficientStatistics;
use ndarray::{s, Array2};
use thiserror::Error;

/// Errors raised on problem misuse; all of them are configuration errors in
/// the sense of the crate's taxonomy.
#[derive(Error, Debug)]
pub enum ProblemError {
    #[error("problem has already been solved and can no longer be modified")]
    AlreadySolved,

    #[error("a variable named `{0}` already exists in this problem")]
    DuplicateVariable(String),

    #[error("no variable named `{0}` in this problem")]
    UnknownVariable(String),

    #[error(
        "variable `{name}` has shape {rows}x{cols}, expected {expected_rows}x{expected_cols}"
    )]
    VariableShape {
        name: String,
        rows: usize,
        cols: usize,
        expected_rows: usize,
        expected_cols: usize,
    },

    #[error("matrix expressions have incompatible shapes: {0}x{1} vs {2}x{3}")]
    ShapeMismatch(usize, usize, usize, usize),

    #[error("an LMI block must be square, got {0}x{1}")]
    NotSquare(usize, usize),
}

/// A scalar expression `constant + sum coeff * x_k` over the problem's
/// flattened decision variables.
#[derive(Debug, Clone, Default)]
pub struct AffExpr {
    pub constant: f64,
    pub terms: Vec<(usize, f64)>,
}

impl AffExpr {
    pub fn constant(value: f64) -> Self {
        Self {
            constant: value,
            terms: Vec::new(),
        }
    }

    pub fn variable(index: usize) -> Self {
        Self {
            constant: 0.0,
            terms: vec![(index, 1.0)],
        }
    }

    pub fn add_scaled(&mut self, other: &AffExpr, scale: f64) {
        self.constant += other.constant * scale;
        for &(index, weight) in &other.terms {
            self.terms.push((index, weight * scale));
        }
    }

    pub fn scaled(&self, scale: f64) -> Self {
        let mut out = AffExpr::default();
        out.add_scaled(self, scale);
        out
    }
}

/// A matrix of affine scalar expressions.
#[derive(Debug, Clone)]
pub struct MatExpr {
    entries: Array2<AffExpr>,
}

impl MatExpr {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            entries: Array2::from_elem((rows, cols), AffExpr::default()),
        }
    }

    pub fn from_constant(m: &Array2<f64>) -> Self {
        Self {
            entries: Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| {
                AffExpr::constant(m[[i, j]])
            }),
        }
    }

    /// `scale * I_n` as a constant expression.
    pub fn identity_scaled(n: usize, scale: f64) -> Self {
        let mut out = Self::zeros(n, n);
        for i in 0..n {
            out.entries[[i, i]] = AffExpr::constant(scale);
        }
        out
    }

    /// `x_index * I_n` for a scalar decision variable.
    pub fn scalar_identity(index: usize, n: usize) -> Self {
        let mut out = Self::zeros(n, n);
        for i in 0..n {
            out.entries[[i, i]] = AffExpr::variable(index);
        }
        out
    }

    /// A 1x1 expression block, used for scalar inequalities.
    pub fn scalar(expr: AffExpr) -> Self {
        let mut out = Self::zeros(1, 1);
        out.entries[[0, 0]] = expr;
        out
    }

    pub fn nrows(&self) -> usize {
        self.entries.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.entries.ncols()
    }

    pub fn entry(&self, i: usize, j: usize) -> &AffExpr {
        &self.entries[[i, j]]
    }

    pub fn t(&self) -> Self {
        Self {
            entries: self.entries.t().to_owned(),
        }
    }

    pub fn neg(&self) -> Self {
        self.scale(-1.0)
    }

    pub fn scale(&self, scale: f64) -> Self {
        Self {
            entries: self.entries.mapv(|e| e.scaled(scale)),
        }
    }

    pub fn add(&self, other: &Self) -> Result<Self, ProblemError> {
        if self.nrows() != other.nrows() || self.ncols() != other.ncols() {
            return Err(ProblemError::ShapeMismatch(
                self.nrows(),
                self.ncols(),
                other.nrows(),
                other.ncols(),
            ));
        }
        let mut out = self.clone();
        for (dst, src) in out.entries.iter_mut().zip(other.entries.iter()) {
            dst.add_scaled(src, 1.0);
        }
        Ok(out)
    }

    pub fn add_constant(&self, m: &Array2<f64>) -> Result<Self, ProblemError> {
        self.add(&MatExpr::from_constant(m))
    }

    /// `self - eps * I`; requires a square expression.
    pub fn sub_scaled_identity(&self, eps: f64) -> Result<Self, ProblemError> {
        if self.nrows() != self.ncols() {
            return Err(ProblemError::NotSquare(self.nrows(), self.ncols()));
        }
        let mut out = self.clone();
        for i in 0..out.nrows() {
            out.entries[[i, i]].constant -= eps;
        }
        Ok(out)
    }

    /// `c * self` for a constant matrix `c`.
    pub fn premul(&self, c: &Array2<f64>) -> Result<Self, ProblemError> {
        if c.ncols() != self.nrows() {
            return Err(ProblemError::ShapeMismatch(
                c.nrows(),
                c.ncols(),
                self.nrows(),
                self.ncols(),
            ));
        }
        let mut out = Self::zeros(c.nrows(), self.ncols());
        for i in 0..c.nrows() {
            for j in 0..self.ncols() {
                let dst = &mut out.entries[[i, j]];
                for k in 0..self.nrows() {
                    dst.add_scaled(self.entry(k, j), c[[i, k]]);
                }
            }
        }
        Ok(out)
    }

    /// `self * c` for a constant matrix `c`.
    pub fn postmul(&self, c: &Array2<f64>) -> Result<Self, ProblemError> {
        if self.ncols() != c.nrows() {
            return Err(ProblemError::ShapeMismatch(
                self.nrows(),
                self.ncols(),
                c.nrows(),
                c.ncols(),
            ));
        }
        let mut out = Self::zeros(self.nrows(), c.ncols());
        for i in 0..self.nrows() {
            for j in 0..c.ncols() {
                let dst = &mut out.entries[[i, j]];
                for k in 0..self.ncols() {
                    dst.add_scaled(self.entry(i, k), c[[k, j]]);
                }
            }
        }
        Ok(out)
    }

    pub fn columns(&self, range: std::ops::Range<usize>) -> Self {
        Self {
            entries: self.entries.slice(s![.., range]).to_owned(),
        }
    }

    /// Assembles a block matrix from a row-major grid of blocks.
    pub fn block(rows: Vec<Vec<MatExpr>>) -> Result<Self, ProblemError> {
        let row_heights: Vec<usize> = rows.iter().map(|r| r[0].nrows()).collect();
        let col_widths: Vec<usize> = rows[0].iter().map(|b| b.ncols()).collect();
        let total_rows: usize = row_heights.iter().sum();
        let total_cols: usize = col_widths.iter().sum();
        let mut out = Self::zeros(total_rows, total_cols);
        let mut row_offset = 0;
        for (bi, row) in rows.iter().enumerate() {
            let mut col_offset = 0;
            for (bj, block) in row.iter().enumerate() {
                if block.nrows() != row_heights[bi] || block.ncols() != col_widths[bj] {
                    return Err(ProblemError::ShapeMismatch(
                        block.nrows(),
                        block.ncols(),
                        row_heights[bi],
                        col_widths[bj],
                    ));
                }
                for i in 0..block.nrows() {
                    for j in 0..block.ncols() {
                        out.entries[[row_offset + i, col_offset + j]] =
                            block.entries[[i, j]].clone();
                    }
                }
                col_offset += col_widths[bj];
            }
            row_offset += row_heights[bi];
        }
        Ok(out)
    }
}

/// Shape and layout of one named matrix variable.
#[derive(Debug, Clone)]
pub struct VarInfo {
    name: String,
    rows: usize,
    cols: usize,
    symmetric: bool,
    offset: usize,
}

impl VarInfo {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn is_symmetric(&self) -> bool {
        self.symmetric
    }

    /// Number of scalar decision variables backing this matrix. Symmetric
    /// variables store only the packed upper triangle, so symmetry is
    /// structural rather than a constraint.
    pub fn scalar_len(&self) -> usize {
        if self.symmetric {
            self.rows * (self.rows + 1) / 2
        } else {
            self.rows * self.cols
        }
    }

    /// Flattened scalar index of entry (i, j).
    pub fn scalar_index(&self, i: usize, j: usize) -> usize {
        if self.symmetric {
            let (a, b) = if i <= j { (i, j) } else { (j, i) };
            // Packed entries before row a: sum_{t<a} (n - t).
            self.offset + a * (2 * self.rows - a + 1) / 2 + (b - a)
        } else {
            self.offset + i * self.cols + j
        }
    }
}

/// One PSD constraint `expr >= 0`.
#[derive(Debug, Clone)]
pub struct LmiConstraint {
    expr: MatExpr,
}

impl LmiConstraint {
    pub fn expr(&self) -> &MatExpr {
        &self.expr
    }
}

/// Scalar objective `constant + sum lin_k x_k + sum quad_k x_k^2`, minimized.
#[derive(Debug, Clone, Default)]
pub struct Objective {
    pub constant: f64,
    pub linear: Vec<(usize, f64)>,
    pub quadratic: Vec<(usize, f64)>,
}

/// One SDP instance. Built fresh per solve call and exclusively owned by it;
/// after `mark_solved` every mutation fails.
#[derive(Debug, Default)]
pub struct OptimizationProblem {
    vars: Vec<VarInfo>,
    n_scalars: usize,
    constraints: Vec<LmiConstraint>,
    objective: Objective,
    solved: bool,
}

impl OptimizationProblem {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_mutable(&self) -> Result<(), ProblemError> {
        if self.solved {
            Err(ProblemError::AlreadySolved)
        } else {
            Ok(())
        }
    }

    fn push_variable(
        &mut self,
        name: &str,
        rows: usize,
        cols: usize,
        symmetric: bool,
    ) -> Result<usize, ProblemError> {
        self.ensure_mutable()?;
        if self.vars.iter().any(|v| v.name == name) {
            return Err(ProblemError::DuplicateVariable(name.to_string()));
        }
        let info = VarInfo {
            name: name.to_string(),
            rows,
            cols,
            symmetric,
            offset: self.n_scalars,
        };
        self.n_scalars += info.scalar_len();
        self.vars.push(info);
        Ok(self.vars.len() - 1)
    }

    pub fn add_variable(&mut self, name: &str, rows: usize, cols: usize) -> Result<usize, ProblemError> {
        self.push_variable(name, rows, cols, false)
    }

    pub fn add_symmetric_variable(&mut self, name: &str, dim: usize) -> Result<usize, ProblemError> {
        self.push_variable(name, dim, dim, true)
    }

    pub fn variable(&self, name: &str) -> Option<usize> {
        self.vars.iter().position(|v| v.name == name)
    }

    /// Looks up a variable and checks its shape; shape mismatches here are
    /// how a term detects it is being applied to a problem built for
    /// different data dimensions.
    pub fn expect_variable(
        &self,
        name: &str,
        rows: usize,
        cols: usize,
    ) -> Result<usize, ProblemError> {
        let id = self
            .variable(name)
            .ok_or_else(|| ProblemError::UnknownVariable(name.to_string()))?;
        let info = &self.vars[id];
        if info.rows != rows || info.cols != cols {
            return Err(ProblemError::VariableShape {
                name: name.to_string(),
                rows: info.rows,
                cols: info.cols,
                expected_rows: rows,
                expected_cols: cols,
            });
        }
        Ok(id)
    }

    pub fn var_info(&self, id: usize) -> &VarInfo {
        &self.vars[id]
    }

    /// The variable as a matrix expression. For symmetric variables both
    /// triangles reference the same scalars.
    pub fn var_expr(&self, id: usize) -> MatExpr {
        let info = &self.vars[id];
        let mut out = MatExpr::zeros(info.rows, info.cols);
        for i in 0..info.rows {
            for j in 0..info.cols {
                out.entries[[i, j]] = AffExpr::variable(info.scalar_index(i, j));
            }
        }
        out
    }

    /// Scalar index of a 1x1 variable.
    pub fn scalar_index_of(&self, id: usize) -> usize {
        self.vars[id].scalar_index(0, 0)
    }

    pub fn add_psd_constraint(&mut self, expr: MatExpr) -> Result<(), ProblemError> {
        self.ensure_mutable()?;
        if expr.nrows() != expr.ncols() {
            return Err(ProblemError::NotSquare(expr.nrows(), expr.ncols()));
        }
        // Symmetrize so the backend can rely on exact symmetry.
        let n = expr.nrows();
        let mut sym = MatExpr::zeros(n, n);
        for i in 0..n {
            for j in 0..n {
                let mut e = expr.entry(i, j).scaled(0.5);
                e.add_scaled(expr.entry(j, i), 0.5);
                sym.entries[[i, j]] = e;
            }
        }
        self.constraints.push(LmiConstraint { expr: sym });
        Ok(())
    }

    pub fn add_nsd_constraint(&mut self, expr: MatExpr) -> Result<(), ProblemError> {
        self.add_psd_constraint(expr.neg())
    }

    pub fn add_objective_constant(&mut self, value: f64) -> Result<(), ProblemError> {
        self.ensure_mutable()?;
        self.objective.constant += value;
        Ok(())
    }

    pub fn add_objective_linear(&mut self, scalar: usize, coeff: f64) -> Result<(), ProblemError> {
        self.ensure_mutable()?;
        self.objective.linear.push((scalar, coeff));
        Ok(())
    }

    pub fn add_objective_quadratic(&mut self, scalar: usize, coeff: f64) -> Result<(), ProblemError> {
        self.ensure_mutable()?;
        self.objective.quadratic.push((scalar, coeff));
        Ok(())
    }

    /// Adds `scale * tr(X m^T)` for a variable X and a constant `m` of the
    /// same shape.
    pub fn add_objective_trace_product(
        &mut self,
        id: usize,
        m: &Array2<f64>,
        scale: f64,
    ) -> Result<(), ProblemError> {
        self.ensure_mutable()?;
        let info = &self.vars[id];
        if info.rows != m.nrows() || info.cols != m.ncols() {
            return Err(ProblemError::ShapeMismatch(
                info.rows,
                info.cols,
                m.nrows(),
                m.ncols(),
            ));
        }
        let mut terms = Vec::with_capacity(info.rows * info.cols);
        for i in 0..info.rows {
            for j in 0..info.cols {
                terms.push((info.scalar_index(i, j), scale * m[[i, j]]));
            }
        }
        self.objective.linear.extend(terms);
        Ok(())
    }

    /// Adds `scale * tr(X)` for a square variable X.
    pub fn add_objective_trace(&mut self, id: usize, scale: f64) -> Result<(), ProblemError> {
        self.ensure_mutable()?;
        let info = &self.vars[id];
        if info.rows != info.cols {
            return Err(ProblemError::NotSquare(info.rows, info.cols));
        }
        let mut terms = Vec::with_capacity(info.rows);
        for i in 0..info.rows {
            terms.push((info.scalar_index(i, i), scale));
        }
        self.objective.linear.extend(terms);
        Ok(())
    }

    /// Poisons the problem against further mutation.
    pub fn mark_solved(&mut self) {
        self.solved = true;
    }

    pub fn is_solved(&self) -> bool {
        self.solved
    }

    pub fn variables(&self) -> &[VarInfo] {
        &self.vars
    }

    pub fn constraints(&self) -> &[LmiConstraint] {
        &self.constraints
    }

    pub fn objective(&self) -> &Objective {
        &self.objective
    }

    pub fn scalar_count(&self) -> usize {
        self.n_scalars
    }
}

/// Assembles the base loss-bounding relaxation.
///
/// Variables `U` (p_theta x p) and symmetric `Z` (p_theta x p_theta);
/// constraints `Z - eps I >= 0` and the factorization's Schur block;
/// objective `min c - 2 tr(U g^T) + tr(Z)`. Since every feasible point
/// satisfies `Z >= U h U^T`, the objective upper-bounds the per-sample
/// squared loss and is tight at the optimum.
pub fn build_base(
    stats: &SufficientStatistics,
    factorization: &Factorization,
    eps: f64,
) -> Result<OptimizationProblem, ProblemError> {
    let p_theta = stats.g.nrows();
    let p = stats.g.ncols();
    let mut problem = OptimizationProblem::new();
    let u = problem.add_variable("U", p_theta, p)?;
    let z = problem.add_symmetric_variable("Z", p_theta)?;

    let z_expr = problem.var_expr(z);
    problem.add_psd_constraint(z_expr.sub_scaled_identity(eps)?)?;

    let u_expr = problem.var_expr(u);
    let schur = match factorization.form() {
        FactorForm::InverseCorner(h_inv) => MatExpr::block(vec![
            vec![z_expr, u_expr],
            vec![
                problem.var_expr(u).t(),
                MatExpr::from_constant(h_inv),
            ],
        ])?,
        FactorForm::Factor(f) => {
            let uf = u_expr.postmul(f)?;
            let uf_t = uf.t();
            MatExpr::block(vec![
                vec![z_expr, uf],
                vec![uf_t, MatExpr::identity_scaled(f.ncols(), 1.0)],
            ])?
        }
    };
    problem.add_psd_constraint(schur)?;

    problem.add_objective_constant(stats.c)?;
    problem.add_objective_trace_product(u, &stats.g, -2.0)?;
    problem.add_objective_trace(z, 1.0)?;
    Ok(problem)
}
