//! Woodbury-style inverse of the damped empirical Fisher.
//!
//! For a history `G` of `n` gradients (the columns of a `k x n` matrix) and a
//! damping `λ > 0`, the curvature approximation is
//!
//! ```text
//! F = λ I + (1/n) Σ g_i g_iᵀ
//! ```
//!
//! Applying Sherman-Morrison once per column gives `F⁻¹` as `(1/λ) I` minus a
//! rank-`n` correction. The correction is encoded by two `n x n` matrices:
//!
//! - `D`, upper-triangular, with `D[i, j] = g_iᵀ F_i⁻¹ g_j` where `F_i` is the
//!   approximation built from the first `i` columns. It is produced by a
//!   sequence of rank-1 Schur-complement eliminations ([`schur_factor`]).
//! - `B`, lower-triangular, whose row `i` expresses `F_i⁻¹ g_i` as a
//!   combination of `g_0..=g_i` ([`recombination_factor`]).
//!
//! Both depend on `k` only through the Gram matrix `GᵀG`, so the `n³` work is
//! independent of the parameter count. [`CurvatureFactorization::apply`] then
//! costs two matrix-vector products against `G`.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip, s};

use crate::MfacError;

/// Reciprocal of the damping. `λ = 0` (or a non-finite λ) has no usable
/// reciprocal and is reported as a degeneracy.
fn damping_scale(damping: f64) -> Result<f64, MfacError> {
    let scale = damping.recip();
    if !damping.is_finite() || !scale.is_finite() {
        log::warn!(
            "[M-FAC] damping {:e} has no finite reciprocal; cannot factor curvature",
            damping
        );
        return Err(MfacError::NumericDegeneracy {
            context: "damping reciprocal",
            value: damping,
        });
    }
    Ok(scale)
}

/// Rejects pivots that are non-finite or vanish relative to the column count.
#[inline]
fn checked_pivot(value: f64, count: usize) -> Result<f64, MfacError> {
    if !value.is_finite() || value.abs() <= f64::EPSILON * count as f64 {
        log::warn!(
            "[M-FAC] degenerate elimination pivot {:e} (history of {} columns)",
            value,
            count
        );
        return Err(MfacError::NumericDegeneracy {
            context: "elimination pivot",
            value,
        });
    }
    Ok(value)
}

/// The denominators `n + D[i, i]` shared by the recombination and the
/// forward substitution.
fn pivots(d: ArrayView2<'_, f64>) -> Result<Array1<f64>, MfacError> {
    let n = d.nrows();
    d.diag()
        .iter()
        .map(|&v| checked_pivot(n as f64 + v, n))
        .collect()
}

fn require_square(m: ArrayView2<'_, f64>) -> Result<usize, MfacError> {
    let (rows, cols) = m.dim();
    if rows != cols {
        return Err(MfacError::DimensionMismatch {
            expected: rows,
            got: cols,
        });
    }
    Ok(rows)
}

/// Builds the upper-triangular factor `D` from the history columns.
///
/// Starts from `D = GᵀG / λ` and eliminates one row/column per step: at step
/// `idx` the trailing block `D[idx.., idx..]` receives the rank-1 update
/// `-(r rᵀ) / (n + D[idx-1, idx-1])` with `r = D[idx-1, idx..]`. Each step reads
/// the row finalised by the previous one, so the loop is inherently
/// sequential. Entries below the diagonal are zeroed at the end.
pub fn schur_factor(
    history: ArrayView2<'_, f64>,
    damping: f64,
) -> Result<Array2<f64>, MfacError> {
    let scale = damping_scale(damping)?;
    let n = history.ncols();
    let mut d = history.t().dot(&history) * scale;

    for idx in 1..n {
        let pivot = checked_pivot(n as f64 + d[[idx - 1, idx - 1]], n)?;
        let row = d.slice(s![idx - 1, idx..]).to_owned();
        let outer = row
            .view()
            .insert_axis(Axis(1))
            .dot(&row.view().insert_axis(Axis(0)));
        d.slice_mut(s![idx.., idx..]).scaled_add(-1.0 / pivot, &outer);
    }

    Zip::indexed(&mut d).for_each(|(i, j), v| {
        if i > j {
            *v = 0.0;
        }
    });
    Ok(d)
}

/// Builds the lower-triangular factor `B` from a finished `D`.
///
/// `B` starts as `I / λ`; row `idx` (below the diagonal) becomes
/// `tmpᵀ · B[..idx, ..idx]` with `tmp[j] = -D[j, idx] / (n + D[j, j])`.
/// The diagonal and the strict upper triangle keep their initial values.
pub fn recombination_factor(
    d: ArrayView2<'_, f64>,
    damping: f64,
) -> Result<Array2<f64>, MfacError> {
    let n = require_square(d)?;
    let scale = damping_scale(damping)?;
    let pivots = pivots(d)?;
    let mut b = Array2::<f64>::eye(n) * scale;

    for idx in 1..n {
        let tmp: Array1<f64> = (0..idx).map(|j| -d[[j, idx]] / pivots[j]).collect();
        let row = tmp.dot(&b.slice(s![..idx, ..idx]));
        b.slice_mut(s![idx, ..idx]).assign(&row);
    }
    Ok(b)
}

/// Snapshot of the curvature factors for one history state.
///
/// Borrows the history it was built from, so the history cannot change while
/// the factors are in use.
#[derive(Debug, Clone)]
pub struct CurvatureFactorization<'a> {
    history: ArrayView2<'a, f64>,
    d: Array2<f64>,
    b: Array2<f64>,
    pivots: Array1<f64>,
    damping: f64,
    scale: f64,
}

impl<'a> CurvatureFactorization<'a> {
    /// Factors `λ I + (1/n) G Gᵀ` for the `n` columns of `history`.
    pub fn new(history: ArrayView2<'a, f64>, damping: f64) -> Result<Self, MfacError> {
        let scale = damping_scale(damping)?;
        let d = schur_factor(history, damping)?;
        let b = recombination_factor(d.view(), damping)?;
        let pivots = pivots(d.view())?;
        log::debug!(
            "[M-FAC] factored history: width {}, {} columns, min pivot {:e}",
            history.nrows(),
            history.ncols(),
            pivots.iter().copied().fold(f64::INFINITY, f64::min)
        );
        Ok(Self {
            history,
            d,
            b,
            pivots,
            damping,
            scale,
        })
    }

    /// Upper-triangular Schur factor.
    pub fn d(&self) -> &Array2<f64> {
        &self.d
    }

    /// Lower-triangular recombination factor.
    pub fn b(&self) -> &Array2<f64> {
        &self.b
    }

    pub fn damping(&self) -> f64 {
        self.damping
    }

    /// Number of history columns `n` the factors were built from.
    pub fn rank(&self) -> usize {
        self.d.nrows()
    }

    /// Parameter-space width `k`.
    pub fn width(&self) -> usize {
        self.history.nrows()
    }

    /// Returns `F⁻¹ x`.
    ///
    /// The projection `q = Gᵀx / λ` is decorrelated by forward substitution
    /// against `D`, giving `c[i] = (F_i⁻¹ g_i)ᵀ x / (n + D[i, i])`. The
    /// correction `G Bᵀ c` is then subtracted from `x / λ`.
    pub fn apply(&self, x: ArrayView1<'_, f64>) -> Result<Array1<f64>, MfacError> {
        if x.len() != self.width() {
            return Err(MfacError::DimensionMismatch {
                expected: self.width(),
                got: x.len(),
            });
        }

        let n = self.rank();
        let mut q = self.history.t().dot(&x) * self.scale;
        let mut c = Array1::<f64>::zeros(n);
        for i in 0..n {
            let ci = q[i] / self.pivots[i];
            c[i] = ci;
            q.slice_mut(s![i + 1..])
                .scaled_add(-ci, &self.d.slice(s![i, i + 1..]));
        }

        let r = self.b.t().dot(&c);
        let correction = self.history.dot(&r);
        Ok(&x * self.scale - &correction)
    }

    /// Returns `-F⁻¹ x`, the preconditioned descent direction for gradient `x`.
    pub fn descent_direction(&self, x: ArrayView1<'_, f64>) -> Result<Array1<f64>, MfacError> {
        Ok(-self.apply(x)?)
    }
}
