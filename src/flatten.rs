//! Conversion between per-parameter gradient tensors and one flat vector.
//!
//! The curvature engine only ever sees a single vector in parameter space. A
//! model, on the other hand, hands over one tensor per trainable parameter.
//! [`flatten`] concatenates those tensors in their logical (row-major) order
//! and [`deflatten`] undoes it, guided by a [`ShapeManifest`] recorded once.

use ndarray::{Array1, ArrayD, ArrayView1, IxDyn};

use crate::MfacError;

/// Ordered list of tensor shapes, one per parameter.
///
/// A zero-dimensional shape (`[]`) describes a scalar and holds one element.
/// Any shape with a zero extent holds none.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShapeManifest {
    shapes: Vec<Vec<usize>>,
    total: usize,
}

impl ShapeManifest {
    pub fn new(shapes: Vec<Vec<usize>>) -> Self {
        let total = shapes.iter().map(|s| element_count(s)).sum();
        Self { shapes, total }
    }

    /// Records the shapes of `tensors` in order.
    pub fn of(tensors: &[ArrayD<f64>]) -> Self {
        Self::new(tensors.iter().map(|t| t.shape().to_vec()).collect())
    }

    pub fn shapes(&self) -> &[Vec<usize>] {
        &self.shapes
    }

    /// Number of tensors described.
    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    /// Sum of element counts across all shapes; the width `k` of a flat vector.
    pub fn total_elements(&self) -> usize {
        self.total
    }

    /// True when `tensors` has exactly these shapes, in this order.
    pub fn matches(&self, tensors: &[ArrayD<f64>]) -> bool {
        self.shapes.len() == tensors.len()
            && self
                .shapes
                .iter()
                .zip(tensors)
                .all(|(shape, t)| shape.as_slice() == t.shape())
    }

    /// Returns the first position where `tensors` disagrees with the manifest
    /// as a `ShapeMismatch`, or `Ok(())` when they match.
    pub fn check(&self, tensors: &[ArrayD<f64>]) -> Result<(), MfacError> {
        if self.shapes.len() != tensors.len() {
            return Err(MfacError::ShapeMismatch {
                expected: vec![self.shapes.len()],
                got: vec![tensors.len()],
            });
        }
        for (shape, t) in self.shapes.iter().zip(tensors) {
            if shape.as_slice() != t.shape() {
                return Err(MfacError::ShapeMismatch {
                    expected: shape.clone(),
                    got: t.shape().to_vec(),
                });
            }
        }
        Ok(())
    }
}

#[inline]
fn element_count(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Concatenates every element of every tensor, in input order.
pub fn flatten(tensors: &[ArrayD<f64>]) -> Array1<f64> {
    let total = tensors.iter().map(|t| t.len()).sum();
    let mut flat = Vec::with_capacity(total);
    for t in tensors {
        flat.extend(t.iter().copied());
    }
    Array1::from(flat)
}

/// Splits `vector` into contiguous chunks sized by `manifest` and reshapes each
/// chunk to its recorded shape.
pub fn deflatten(
    vector: ArrayView1<'_, f64>,
    manifest: &ShapeManifest,
) -> Result<Vec<ArrayD<f64>>, MfacError> {
    if vector.len() != manifest.total_elements() {
        return Err(MfacError::ShapeMismatch {
            expected: vec![manifest.total_elements()],
            got: vec![vector.len()],
        });
    }

    let mut tensors = Vec::with_capacity(manifest.len());
    let mut offset = 0;
    for shape in manifest.shapes() {
        let count = element_count(shape);
        let chunk = vector.slice(ndarray::s![offset..offset + count]).to_vec();
        let tensor = ArrayD::from_shape_vec(IxDyn(shape), chunk).map_err(|_| {
            MfacError::ShapeMismatch {
                expected: shape.clone(),
                got: vec![count],
            }
        })?;
        tensors.push(tensor);
        offset += count;
    }
    Ok(tensors)
}
