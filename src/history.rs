//! Fixed-capacity rolling window of flattened gradients.
//!
//! The window is a dense `k x m` matrix used as a ring: insertion number `t`
//! (counting from zero) is written to column `t % m`, so an append costs one
//! column copy and never shifts older entries. Logical order (oldest to
//! newest) is recovered from the insertion counter when a caller asks for it.
//!
//! A fresh buffer is unbound. Its width `k` is fixed either by [`GradientHistory::bind`]
//! or by the first [`GradientHistory::append`]; every later vector is checked
//! against it.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};

use crate::MfacError;

#[derive(Debug, Clone)]
enum Slots {
    Unbound,
    Bound(Array2<f64>),
}

/// What one append overwrote, so that the append can be taken back.
#[derive(Debug, Clone)]
pub(crate) struct Displaced {
    slot: usize,
    previous: Array1<f64>,
    bound_width: bool,
}

/// Rolling window of the last `capacity` gradients.
#[derive(Debug, Clone)]
pub struct GradientHistory {
    capacity: usize,
    slots: Slots,
    count: u64,
}

impl GradientHistory {
    /// Creates an unbound buffer holding up to `capacity` gradients.
    pub fn new(capacity: usize) -> Result<Self, MfacError> {
        if capacity == 0 {
            return Err(MfacError::InvalidConfig(
                "history capacity must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            capacity,
            slots: Slots::Unbound,
            count: 0,
        })
    }

    /// Fixes the vector width and allocates the zero-filled storage.
    ///
    /// Re-binding to the width already in force is a no-op; any other width is
    /// a `DimensionMismatch`.
    pub fn bind(&mut self, width: usize) -> Result<(), MfacError> {
        match &self.slots {
            Slots::Bound(storage) if storage.nrows() == width => Ok(()),
            Slots::Bound(storage) => Err(MfacError::DimensionMismatch {
                expected: storage.nrows(),
                got: width,
            }),
            Slots::Unbound => {
                self.slots = Slots::Bound(Array2::zeros((width, self.capacity)));
                log::debug!(
                    "[M-FAC history] bound to width {} with capacity {}",
                    width,
                    self.capacity
                );
                Ok(())
            }
        }
    }

    /// Stores `vector` as the newest entry, evicting the oldest once full.
    pub fn append(&mut self, vector: ArrayView1<'_, f64>) -> Result<(), MfacError> {
        self.record(vector).map(|_| ())
    }

    /// Appends `vector` and returns what the write displaced.
    pub(crate) fn record(&mut self, vector: ArrayView1<'_, f64>) -> Result<Displaced, MfacError> {
        if let Some(index) = vector.iter().position(|v| !v.is_finite()) {
            return Err(MfacError::NonFiniteInput { index });
        }
        let bound_width = !self.is_bound();
        self.bind(vector.len())?;
        let slot = self.slot_of(self.count);
        let previous = match &mut self.slots {
            Slots::Bound(storage) => {
                let mut column = storage.column_mut(slot);
                let previous = column.to_owned();
                column.assign(&vector);
                previous
            }
            Slots::Unbound => return Err(MfacError::HistoryUnbound),
        };
        self.count += 1;
        Ok(Displaced {
            slot,
            previous,
            bound_width,
        })
    }

    /// Takes back the most recent [`record`](Self::record). An append that
    /// bound the width leaves the buffer unbound again.
    pub(crate) fn retract(&mut self, displaced: Displaced) -> Result<(), MfacError> {
        if displaced.bound_width {
            self.reset();
            return Ok(());
        }
        match &mut self.slots {
            Slots::Bound(storage) => {
                storage.column_mut(displaced.slot).assign(&displaced.previous);
                self.count -= 1;
                log::debug!(
                    "[M-FAC history] retracted newest entry, {} appends remain",
                    self.count
                );
                Ok(())
            }
            Slots::Unbound => Err(MfacError::HistoryUnbound),
        }
    }

    /// Drops the stored gradients and the bound width.
    pub fn reset(&mut self) {
        self.slots = Slots::Unbound;
        self.count = 0;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of appends since construction or the last reset.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Number of slots holding a real gradient, `min(count, capacity)`.
    pub fn len(&self) -> usize {
        self.count.min(self.capacity as u64) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count >= self.capacity as u64
    }

    pub fn is_bound(&self) -> bool {
        matches!(self.slots, Slots::Bound(..))
    }

    /// Bound width `k`, if any.
    pub fn width(&self) -> Option<usize> {
        match &self.slots {
            Slots::Bound(storage) => Some(storage.nrows()),
            Slots::Unbound => None,
        }
    }

    #[inline]
    fn slot_of(&self, insertion: u64) -> usize {
        (insertion % self.capacity as u64) as usize
    }

    /// Physical slot of the entry `age` insertions old (`0` is the newest).
    fn slot_for_age(&self, age: usize) -> Option<usize> {
        if age >= self.len() {
            return None;
        }
        Some(self.slot_of(self.count - 1 - age as u64))
    }

    /// The entry inserted `age` appends ago; `get(0)` is the most recent.
    pub fn get(&self, age: usize) -> Option<ArrayView1<'_, f64>> {
        let slot = self.slot_for_age(age)?;
        match &self.slots {
            Slots::Bound(storage) => Some(storage.column(slot)),
            Slots::Unbound => None,
        }
    }

    pub fn newest(&self) -> Option<ArrayView1<'_, f64>> {
        self.get(0)
    }

    /// All `capacity` physical columns, including zero-filled ones.
    ///
    /// Column order follows the ring, not insertion age.
    pub fn storage(&self) -> Option<ArrayView2<'_, f64>> {
        match &self.slots {
            Slots::Bound(storage) => Some(storage.view()),
            Slots::Unbound => None,
        }
    }

    /// Physical columns holding real gradients.
    ///
    /// Before the ring wraps, the first `len()` slots are exactly the filled
    /// ones; afterwards every slot is live.
    pub fn live(&self) -> Option<ArrayView2<'_, f64>> {
        match &self.slots {
            Slots::Bound(storage) => Some(storage.slice(s![.., ..self.len()])),
            Slots::Unbound => None,
        }
    }

    /// Physical slots of the live entries, oldest first.
    fn slots_oldest_first(&self) -> Vec<usize> {
        (0..self.len())
            .rev()
            .map(|age| self.slot_of(self.count - 1 - age as u64))
            .collect()
    }

    /// Copy of the live entries as columns, oldest first.
    pub fn ordered(&self) -> Option<Array2<f64>> {
        let storage = self.storage()?;
        Some(storage.select(Axis(1), &self.slots_oldest_first()))
    }

    /// Copy of the live entries as rows, newest first.
    pub fn ordered_rows(&self) -> Option<Array2<f64>> {
        let storage = self.storage()?;
        let mut slots = self.slots_oldest_first();
        slots.reverse();
        Some(storage.t().select(Axis(0), &slots))
    }
}

#[cfg(test)]
mod tests {
    use super::GradientHistory;
    use crate::MfacError;
    use ndarray::{Array2, array};
    use spectral::prelude::*;

    fn columns(m: &Array2<f64>) -> Vec<Vec<f64>> {
        m.columns().into_iter().map(|c| c.to_vec()).collect()
    }

    // --- Construction and binding ---

    #[test]
    fn test_zero_capacity_is_rejected() {
        assert!(matches!(
            GradientHistory::new(0),
            Err(MfacError::InvalidConfig(..))
        ));
    }

    #[test]
    fn test_first_append_binds_width() {
        let mut history = GradientHistory::new(4).unwrap();
        assert!(!history.is_bound());
        assert!(history.width().is_none());
        history.append(array![1.0, 2.0, 3.0].view()).unwrap();
        assert!(history.is_bound());
        assert_eq!(history.width(), Some(3));
        assert_eq!(history.storage().unwrap().dim(), (3, 4));
    }

    #[test]
    fn test_explicit_bind_then_mismatched_append() {
        let mut history = GradientHistory::new(2).unwrap();
        history.bind(3).unwrap();
        history.bind(3).unwrap();
        assert!(matches!(
            history.bind(5),
            Err(MfacError::DimensionMismatch {
                expected: 3,
                got: 5
            })
        ));
        let result = history.append(array![1.0, 2.0].view());
        assert!(matches!(
            result,
            Err(MfacError::DimensionMismatch {
                expected: 3,
                got: 2
            })
        ));
        assert_eq!(history.count(), 0);
    }

    #[test]
    fn test_width_enforced_after_first_append() {
        let mut history = GradientHistory::new(3).unwrap();
        history.append(array![1.0, 0.0].view()).unwrap();
        let result = history.append(array![1.0, 0.0, 2.0].view());
        assert!(matches!(
            result,
            Err(MfacError::DimensionMismatch {
                expected: 2,
                got: 3
            })
        ));
        assert_eq!(history.count(), 1);
    }

    #[test]
    fn test_non_finite_gradient_is_rejected() {
        let mut history = GradientHistory::new(2).unwrap();
        let result = history.append(array![1.0, f64::NAN, 0.0].view());
        assert!(matches!(result, Err(MfacError::NonFiniteInput { index: 1 })));
        assert!(!history.is_bound());
    }

    // --- FIFO behaviour ---

    #[test]
    fn test_capacity_three_scenario() {
        let mut history = GradientHistory::new(3).unwrap();
        for v in [array![1.0, 0.0], array![0.0, 1.0], array![1.0, 1.0], array![2.0, 0.0]] {
            history.append(v.view()).unwrap();
        }
        let ordered = history.ordered().unwrap();
        assert_eq!(
            columns(&ordered),
            vec![vec![0.0, 1.0], vec![1.0, 1.0], vec![2.0, 0.0]]
        );
        assert_eq!(history.count(), 4);
        assert_eq!(history.len(), 3);
        assert_eq!(history.newest().unwrap().to_vec(), vec![2.0, 0.0]);
    }

    #[test]
    fn test_keeps_last_m_for_many_insertions() {
        let m = 4;
        for n in [m + 1, 2 * m, 3 * m + 2, 37] {
            let mut history = GradientHistory::new(m).unwrap();
            for i in 0..n {
                let x = i as f64;
                history.append(array![x, -x, x * x].view()).unwrap();
            }
            let expected: Vec<Vec<f64>> = ((n - m)..n)
                .map(|i| {
                    let x = i as f64;
                    vec![x, -x, x * x]
                })
                .collect();
            assert_eq!(columns(&history.ordered().unwrap()), expected);
            assert_that!(&history.count()).is_equal_to(n as u64);
        }
    }

    #[test]
    fn test_row_layout_is_newest_first() {
        let mut history = GradientHistory::new(2).unwrap();
        for v in [array![1.0, 0.0], array![0.0, 1.0], array![3.0, 3.0]] {
            history.append(v.view()).unwrap();
        }
        let rows = history.ordered_rows().unwrap();
        assert_eq!(rows, array![[3.0, 3.0], [0.0, 1.0]]);
        assert_eq!(history.get(1).unwrap().to_vec(), vec![0.0, 1.0]);
        assert!(history.get(2).is_none());
    }

    #[test]
    fn test_partial_fill_exposes_live_prefix() {
        let mut history = GradientHistory::new(4).unwrap();
        history.append(array![1.0, 2.0].view()).unwrap();
        history.append(array![3.0, 4.0].view()).unwrap();
        assert!(!history.is_full());
        assert_eq!(history.live().unwrap(), array![[1.0, 3.0], [2.0, 4.0]]);
        let storage = history.storage().unwrap();
        assert_eq!(storage.column(2).to_vec(), vec![0.0, 0.0]);
        assert_eq!(storage.column(3).to_vec(), vec![0.0, 0.0]);
    }

    // --- Taking an append back ---

    #[test]
    fn test_retract_restores_evicted_entry() {
        let mut history = GradientHistory::new(2).unwrap();
        history.append(array![1.0, 0.0].view()).unwrap();
        history.append(array![0.0, 1.0].view()).unwrap();
        let displaced = history.record(array![9.0, 9.0].view()).unwrap();
        assert_eq!(history.newest().unwrap().to_vec(), vec![9.0, 9.0]);

        history.retract(displaced).unwrap();
        assert_eq!(history.count(), 2);
        assert_eq!(
            columns(&history.ordered().unwrap()),
            vec![vec![1.0, 0.0], vec![0.0, 1.0]]
        );
    }

    #[test]
    fn test_retract_before_wrap_restores_zero_slot() {
        let mut history = GradientHistory::new(3).unwrap();
        history.append(array![1.0, 2.0].view()).unwrap();
        let displaced = history.record(array![3.0, 4.0].view()).unwrap();
        history.retract(displaced).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history.storage().unwrap().column(1).to_vec(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_retracting_binding_append_unbinds() {
        let mut history = GradientHistory::new(2).unwrap();
        let displaced = history.record(array![1.0, 2.0].view()).unwrap();
        history.retract(displaced).unwrap();
        assert!(!history.is_bound());
        assert!(history.is_empty());
        history.append(array![1.0, 2.0, 3.0].view()).unwrap();
        assert_eq!(history.width(), Some(3));
    }

    #[test]
    fn test_unbound_history_has_no_ordered_copies() {
        let history = GradientHistory::new(2).unwrap();
        assert!(history.ordered().is_none());
        assert!(history.ordered_rows().is_none());
    }

    #[test]
    fn test_reset_unbinds_and_clears_counter() {
        let mut history = GradientHistory::new(2).unwrap();
        history.append(array![1.0, 2.0].view()).unwrap();
        history.reset();
        assert!(history.is_empty());
        assert!(!history.is_bound());
        history.append(array![1.0, 2.0, 3.0].view()).unwrap();
        assert_eq!(history.width(), Some(3));
        assert_eq!(history.newest().unwrap(), array![1.0, 2.0, 3.0]);
    }
}
