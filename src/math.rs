use std::ops::Range;

use faer::linalg::solvers::Llt;
use faer::{Col, Mat, Scale, Side};
use itertools::izip;

#[inline]
pub(crate) fn axpy(x: &[f64], y: &mut [f64], a: f64) {
    assert!(x.len() == y.len());
    izip!(x, y).for_each(|(x, y)| {
        *y += a * x;
    });
}

#[inline]
pub(crate) fn col_dot(a: &Col<f64>, b: &Col<f64>) -> f64 {
    a.transpose() * b
}

pub(crate) fn abs_sum(a: &Col<f64>) -> f64 {
    a.iter().map(|x| x.abs()).sum()
}

pub(crate) fn col_from_slice(values: &[f64]) -> Col<f64> {
    Col::from_fn(values.len(), |i| values[i])
}

pub(crate) fn col_to_vec(values: &Col<f64>) -> Vec<f64> {
    values.iter().copied().collect()
}

/// `x' M x` for a square `M`.
pub(crate) fn quad_form(m: &Mat<f64>, x: &Col<f64>) -> f64 {
    let mx = m * x;
    x.transpose() * &mx
}

/// Copy of the square diagonal block `m[range, range]`.
pub(crate) fn diagonal_block(m: &Mat<f64>, range: Range<usize>) -> Mat<f64> {
    let n = range.len();
    m.submatrix(range.start, range.start, n, n).to_owned()
}

/// `trace(a b)` without forming the product.
pub(crate) fn trace_product(a: &Mat<f64>, b: &Mat<f64>) -> f64 {
    assert!(a.ncols() == b.nrows() && a.nrows() == b.ncols());
    (0..a.nrows()).map(|i| a.row(i) * b.col(i)).sum()
}

/// Cholesky factorization of a symmetric matrix, `None` if it is not
/// numerically positive definite.
pub(crate) fn cholesky(a: &Mat<f64>) -> Option<Llt<f64>> {
    let llt = Llt::new(a.as_ref(), Side::Lower).ok()?;
    let positive = llt
        .L()
        .diagonal()
        .column_vector()
        .iter()
        .all(|d| d.is_finite() && *d > 0f64);
    positive.then_some(llt)
}

pub(crate) fn symmetrize(m: &mut Mat<f64>) {
    let sym = Scale(0.5) * (&*m + m.transpose());
    *m = sym;
}
