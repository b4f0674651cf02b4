//! Gradient-descent driver around the curvature engine.
//!
//! Each [`Mfac::step`] flattens the incoming gradients, pushes them into the
//! rolling history, factors the damped Fisher approximation of that history
//! and moves the parameters along `-F⁻¹ g`.

use ndarray::{Array1, ArrayD, ArrayView1, ArrayView2};

use crate::curvature::CurvatureFactorization;
use crate::flatten::{ShapeManifest, deflatten, flatten};
use crate::history::GradientHistory;
use crate::MfacError;

/// Which history columns the factorization sees before the window fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WarmupPolicy {
    /// Only the gradients actually recorded so far; the Fisher average is
    /// taken over that many columns.
    #[default]
    LiveColumns,
    /// All `m` slots, with unfilled slots contributing zero columns and the
    /// average always taken over `m`.
    ZeroPadded,
}

/// Summary of one optimizer step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    /// 1-based index of the step just taken.
    pub step: u64,
    /// Number of history columns the factorization used.
    pub history_len: usize,
    /// Euclidean norm of the applied parameter change.
    pub update_norm: f64,
}

/// M-FAC optimizer: preconditioned gradient descent with a rolling
/// empirical-Fisher estimate.
#[derive(Debug, Clone)]
pub struct Mfac {
    history: GradientHistory,
    damping: f64,
    learning_rate: f64,
    momentum: f64,
    weight_decay: f64,
    warmup: WarmupPolicy,
    manifest: Option<ShapeManifest>,
    velocity: Option<Array1<f64>>,
    steps: u64,
}

impl Mfac {
    /// Creates an optimizer keeping `history_size` gradients with damping `λ`.
    ///
    /// Both values are fixed for the lifetime of the optimizer.
    pub fn new(history_size: usize, damping: f64) -> Result<Self, MfacError> {
        if !(damping.is_finite() && damping > 0.0) {
            return Err(MfacError::InvalidConfig(format!(
                "damping must be positive and finite, got {damping}"
            )));
        }
        let history = GradientHistory::new(history_size)?;
        log::info!(
            "[M-FAC] optimizer created: history size {}, damping {:e}",
            history_size,
            damping
        );
        Ok(Self {
            history,
            damping,
            learning_rate: 1e-3,
            momentum: 0.0,
            weight_decay: 0.0,
            warmup: WarmupPolicy::default(),
            manifest: None,
            velocity: None,
            steps: 0,
        })
    }

    /// Sets the step size (default: 1e-3). Non-positive or non-finite values are ignored.
    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        if learning_rate.is_finite() && learning_rate > 0.0 {
            self.learning_rate = learning_rate;
        }
        self
    }

    /// Sets heavy-ball momentum on the preconditioned direction (default: 0).
    /// Values outside `[0, 1)` are ignored.
    pub fn with_momentum(mut self, momentum: f64) -> Self {
        if (0.0..1.0).contains(&momentum) {
            self.momentum = momentum;
        }
        self
    }

    /// Sets L2 weight decay, added to the gradient before it enters the
    /// history (default: 0). Negative or non-finite values are ignored.
    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        if weight_decay.is_finite() && weight_decay >= 0.0 {
            self.weight_decay = weight_decay;
        }
        self
    }

    /// Chooses how the partly filled history is treated (default: `LiveColumns`).
    pub fn with_warmup(mut self, warmup: WarmupPolicy) -> Self {
        self.warmup = warmup;
        self
    }

    pub fn history_size(&self) -> usize {
        self.history.capacity()
    }

    pub fn damping(&self) -> f64 {
        self.damping
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Number of completed steps since construction or the last reset.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn history(&self) -> &GradientHistory {
        &self.history
    }

    /// Shapes recorded from the first batch of gradients, if any.
    pub fn manifest(&self) -> Option<&ShapeManifest> {
        self.manifest.as_ref()
    }

    /// Forgets the history, momentum and recorded shapes.
    pub fn reset(&mut self) {
        self.history.reset();
        self.manifest = None;
        self.velocity = None;
        self.steps = 0;
        log::info!("[M-FAC] optimizer state reset");
    }

    /// Resolves the shape manifest for this batch without storing it.
    fn resolve_manifest(&self, grads: &[ArrayD<f64>]) -> Result<ShapeManifest, MfacError> {
        match &self.manifest {
            Some(manifest) => {
                manifest.check(grads)?;
                Ok(manifest.clone())
            }
            None => Ok(ShapeManifest::of(grads)),
        }
    }

    fn remember_manifest(&mut self, manifest: ShapeManifest) {
        if self.manifest.is_none() {
            log::info!(
                "[M-FAC] tracking {} tensors with {} parameters",
                manifest.len(),
                manifest.total_elements()
            );
            self.manifest = Some(manifest);
        }
    }

    fn factor_window(&self) -> Result<ArrayView2<'_, f64>, MfacError> {
        let window = match self.warmup {
            WarmupPolicy::LiveColumns => self.history.live(),
            WarmupPolicy::ZeroPadded => self.history.storage(),
        };
        window.ok_or(MfacError::HistoryUnbound)
    }

    /// Records `gradient` and returns `F⁻¹ gradient` for the updated history.
    ///
    /// If the updated history cannot be factored, the gradient is taken back
    /// out so that the history is exactly as it was before the call.
    fn inverse_product(
        &mut self,
        gradient: ArrayView1<'_, f64>,
    ) -> Result<(Array1<f64>, usize), MfacError> {
        let displaced = self.history.record(gradient)?;
        match self.factor_and_apply(gradient) {
            Ok(result) => Ok(result),
            Err(err) => {
                log::warn!("[M-FAC] dropping gradient, history became unfactorable: {err}");
                self.history.retract(displaced)?;
                Err(err)
            }
        }
    }

    fn factor_and_apply(
        &self,
        gradient: ArrayView1<'_, f64>,
    ) -> Result<(Array1<f64>, usize), MfacError> {
        let window = self.factor_window()?;
        let factorization = CurvatureFactorization::new(window, self.damping)?;
        let product = factorization.apply(gradient)?;
        Ok((product, factorization.rank()))
    }

    /// Pushes `grads` into the history and returns the preconditioned
    /// gradients `F⁻¹ g`, one tensor per input, without touching any parameter.
    pub fn precondition(&mut self, grads: &[ArrayD<f64>]) -> Result<Vec<ArrayD<f64>>, MfacError> {
        let manifest = self.resolve_manifest(grads)?;
        let flat = flatten(grads);
        let (product, rank) = self.inverse_product(flat.view())?;
        log::debug!("[M-FAC] preconditioned gradient against {} history columns", rank);
        let out = deflatten(product.view(), &manifest)?;
        self.remember_manifest(manifest);
        Ok(out)
    }

    /// Takes one descent step: `params -= lr * v` with
    /// `v = momentum * v + F⁻¹ (g + weight_decay * params)`.
    ///
    /// On error the parameters, momentum, history and recorded shapes are
    /// left as they were.
    pub fn step(
        &mut self,
        params: &mut [ArrayD<f64>],
        grads: &[ArrayD<f64>],
    ) -> Result<StepReport, MfacError> {
        let manifest = self.resolve_manifest(grads)?;
        manifest.check(params)?;

        let mut gradient = flatten(grads);
        if self.weight_decay > 0.0 {
            gradient.scaled_add(self.weight_decay, &flatten(params));
        }

        let (product, rank) = self.inverse_product(gradient.view())?;
        let velocity = match &self.velocity {
            Some(v) if self.momentum > 0.0 => v * self.momentum + &product,
            _ => product,
        };

        let deltas = deflatten(velocity.view(), &manifest)?;
        for (param, delta) in params.iter_mut().zip(&deltas) {
            param.scaled_add(-self.learning_rate, delta);
        }

        let update_norm = self.learning_rate * velocity.dot(&velocity).sqrt();
        self.velocity = Some(velocity);
        self.remember_manifest(manifest);
        self.steps += 1;

        log::debug!(
            "[M-FAC] step {}: {} history columns, update norm {:e}",
            self.steps,
            rank,
            update_norm
        );
        Ok(StepReport {
            step: self.steps,
            history_len: rank,
            update_norm,
        })
    }
}
