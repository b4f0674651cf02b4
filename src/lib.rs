//! Matrix-free approximate curvature (M-FAC) preconditioning.
//!
//! This crate corrects raw gradients with curvature information taken from a
//! short rolling window of past gradients. The curvature is modelled as the
//! damped empirical Fisher
//!
//! ```text
//! F = λ I + (1/m) Σ g_i g_iᵀ
//! ```
//!
//! over the last `m` gradients, and `F⁻¹ x` is evaluated through repeated
//! Sherman-Morrison (Woodbury) updates without ever forming a `k x k` matrix.
//! Factoring costs `O(k m² + m³)` and each inverse-vector product `O(k m)`.
//!
//! # Features
//! - [`flatten`] / [`deflatten`]: per-parameter tensors ⇄ one flat vector, with a
//!   [`ShapeManifest`] recorded once and checked on every step.
//! - [`GradientHistory`]: ring buffer of the last `m` gradients with an explicit
//!   unbound/bound width, newest entry always at age 0.
//! - [`schur_factor`] and [`recombination_factor`]: the two triangular factors,
//!   as pure functions; [`CurvatureFactorization`] bundles them and applies `F⁻¹`.
//! - [`Mfac`]: descent driver with learning rate, momentum, weight decay and a
//!   configurable warm-up policy ([`WarmupPolicy`]).
//! - Errors are reported through [`MfacError`]; degenerate pivots abort the step
//!   instead of producing NaNs.
//!
//! ## Defaults (key settings)
//! - Learning rate `1e-3`, momentum `0`, weight decay `0`.
//! - Warm-up: factor only the gradients recorded so far (`WarmupPolicy::LiveColumns`).
//!
//! # Example
//!
//! Minimize a small quadratic with a two-entry parameter tensor.
//!
//! ```
//! use mfac::{Mfac, MfacError};
//! use ndarray::{ArrayD, array};
//!
//! let curvature = array![1.0, 2.0].into_dyn();
//! let loss = |w: &ArrayD<f64>| 0.5 * (w * w * &curvature).sum();
//!
//! let mut params = vec![array![3.0, -2.0].into_dyn()];
//! let mut opt = Mfac::new(4, 1.0)?.with_learning_rate(0.2);
//!
//! let initial = loss(&params[0]);
//! for _ in 0..50 {
//!     let grad = &params[0] * &curvature;
//!     opt.step(&mut params, &[grad])?;
//! }
//! assert!(loss(&params[0]) < 0.2 * initial);
//! # Ok::<(), MfacError>(())
//! ```

pub mod curvature;
pub mod flatten;
pub mod history;
pub mod optimizer;

#[cfg(test)]
mod test_support;

pub use curvature::{CurvatureFactorization, recombination_factor, schur_factor};
pub use flatten::{ShapeManifest, deflatten, flatten};
pub use history::GradientHistory;
pub use optimizer::{Mfac, StepReport, WarmupPolicy};

/// An error type for clear diagnostics.
#[derive(Debug, thiserror::Error)]
pub enum MfacError {
    /// A flat vector or tensor list disagrees with the recorded shapes.
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    /// A vector's length disagrees with the bound history width or the
    /// factorization it is applied to.
    #[error("Dimension mismatch: expected length {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error(
        "Numeric degeneracy in {context} (value {value:e}); the curvature factorization is ill-defined."
    )]
    NumericDegeneracy {
        /// Which quantity degenerated.
        context: &'static str,
        /// The offending value.
        value: f64,
    },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Gradient entry {index} is NaN or infinite.")]
    NonFiniteInput { index: usize },
    #[error("The gradient history has no width yet; append or bind first.")]
    HistoryUnbound,
}
