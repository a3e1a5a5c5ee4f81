//! Bridge between ndarray storage and faer kernels: dense products and the
//! general eigenvalue solver used by the companion-matrix root finder.

use faer::linalg::matmul::matmul;
use faer::linalg::solvers::EvdError;
use faer::{Accum, Mat, MatRef, Par, get_global_parallelism};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("eigenvalue iteration failed: {0:?}")]
    Eigen(EvdError),
    #[error("eigenvalues need a square matrix, got {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },
    #[error("matrix contains non-finite entries")]
    NonFinite,
}

/// Products with fewer multiply-adds than this stay on ndarray.
const FAER_MIN_WORK: usize = 4096;
/// Smallest dimension that must be reached before faer is worth the copy.
const FAER_MIN_DIM: usize = 32;
/// Every dimension must reach this before the product is split across threads.
const PARALLEL_MIN_DIM: usize = 128;

#[inline]
fn prefers_faer(m: usize, n: usize, k: usize) -> bool {
    m.max(n).max(k) >= FAER_MIN_DIM && m.saturating_mul(n).saturating_mul(k) >= FAER_MIN_WORK
}

#[inline]
fn parallelism(dims: &[usize]) -> Par {
    if dims.iter().all(|&d| d >= PARALLEL_MIN_DIM) {
        get_global_parallelism()
    } else {
        Par::Seq
    }
}

/// Runs `f` on a faer view of `a`. Row- or column-contiguous arrays are
/// borrowed as they are; anything else is gathered into a row-major buffer.
fn with_mat_ref<S, R>(a: &ArrayBase<S, Ix2>, f: impl FnOnce(MatRef<'_, f64>) -> R) -> R
where
    S: Data<Elem = f64>,
{
    let (rows, cols) = a.dim();
    if let Some(data) = a.as_slice() {
        return f(MatRef::from_row_major_slice(data, rows, cols));
    }
    let transposed = a.t();
    if let Some(data) = transposed.as_slice() {
        return f(MatRef::from_column_major_slice(data, rows, cols));
    }
    let gathered: Vec<f64> = a.iter().copied().collect();
    f(MatRef::from_row_major_slice(&gathered, rows, cols))
}

fn product(lhs: MatRef<'_, f64>, rhs: MatRef<'_, f64>) -> Array2<f64> {
    let (m, k, n) = (lhs.nrows(), lhs.ncols(), rhs.ncols());
    let mut out = Mat::<f64>::zeros(m, n);
    matmul(
        out.as_mut(),
        Accum::Replace,
        lhs,
        rhs,
        1.0,
        parallelism(&[m, k, n]),
    );
    Array2::from_shape_fn((m, n), |(i, j)| out[(i, j)])
}

/// `A B` for A (n x p) and B (p x q).
pub fn fast_ab<S1, S2>(a: &ArrayBase<S1, Ix2>, b: &ArrayBase<S2, Ix2>) -> Array2<f64>
where
    S1: Data<Elem = f64>,
    S2: Data<Elem = f64>,
{
    let (n, p) = a.dim();
    debug_assert_eq!(p, b.nrows(), "inner dimensions must agree");
    if !prefers_faer(n, b.ncols(), p) {
        return a.dot(b);
    }
    with_mat_ref(a, |a| with_mat_ref(b, |b| product(a, b)))
}

/// `A^T B` for A (n x p) and B (n x q), without materialising the transpose.
pub fn fast_atb<S1, S2>(a: &ArrayBase<S1, Ix2>, b: &ArrayBase<S2, Ix2>) -> Array2<f64>
where
    S1: Data<Elem = f64>,
    S2: Data<Elem = f64>,
{
    let (n, p) = a.dim();
    debug_assert_eq!(n, b.nrows(), "row counts must agree");
    if !prefers_faer(p, b.ncols(), n) {
        return a.t().dot(b);
    }
    with_mat_ref(a, |a| with_mat_ref(b, |b| product(a.transpose(), b)))
}

/// `A^T v` for A (n x p) and v (n).
pub fn fast_atv<S1, S2>(a: &ArrayBase<S1, Ix2>, v: &ArrayBase<S2, Ix1>) -> Array1<f64>
where
    S1: Data<Elem = f64>,
    S2: Data<Elem = f64>,
{
    let (n, p) = a.dim();
    debug_assert_eq!(n, v.len(), "vector length must match the row count");
    if !prefers_faer(p, 1, n) {
        return a.t().dot(v);
    }
    let column: Vec<f64> = v.iter().copied().collect();
    let rhs = MatRef::from_column_major_slice(&column, n, 1);
    with_mat_ref(a, |a| product(a.transpose(), rhs)).column(0).to_owned()
}

/// Symmetry up to `abs_tol + rel_tol * max(1, max|a_ij|)`.
pub(crate) fn is_symmetric_with_tolerance<S: Data<Elem = f64>>(
    matrix: &ArrayBase<S, Ix2>,
    rel_tol: f64,
    abs_tol: f64,
) -> bool {
    if !matrix.is_square() {
        return false;
    }
    let largest = matrix.iter().fold(0.0f64, |acc, &v| acc.max(v.abs()));
    let tol = abs_tol + rel_tol * largest.max(1.0);
    matrix
        .indexed_iter()
        .filter(|((i, j), _)| i < j)
        .all(|((i, j), &v)| (v - matrix[[j, i]]).abs() <= tol)
}

/// One eigenvalue of a real, possibly non-symmetric, matrix.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ComplexEigenvalue {
    pub re: f64,
    pub im: f64,
}

impl ComplexEigenvalue {
    /// Imaginary part negligible against `max(1, |re|)`.
    #[inline]
    pub fn is_real(&self, rel_tol: f64) -> bool {
        self.im.abs() <= rel_tol * self.re.abs().max(1.0)
    }
}

pub trait FaerEigenvalues {
    /// All eigenvalues of a general square matrix, unordered.
    fn eigenvalues(&self) -> Result<Vec<ComplexEigenvalue>, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerEigenvalues for ArrayBase<S, Ix2> {
    fn eigenvalues(&self) -> Result<Vec<ComplexEigenvalue>, FaerLinalgError> {
        let (rows, cols) = self.dim();
        if rows != cols {
            return Err(FaerLinalgError::NotSquare { rows, cols });
        }
        if !self.iter().all(|v| v.is_finite()) {
            return Err(FaerLinalgError::NonFinite);
        }
        if rows == 0 {
            return Ok(Vec::new());
        }
        let values = with_mat_ref(self, |m| m.eigenvalues()).map_err(FaerLinalgError::Eigen)?;
        Ok(values
            .into_iter()
            .map(|z| ComplexEigenvalue { re: z.re, im: z.im })
            .collect())
    }
}
