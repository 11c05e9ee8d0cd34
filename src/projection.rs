//! Stack of detector images, one per projection index.

use ndarray::{Array3, ArrayView2, ArrayViewMut2, Axis};

use crate::error::{ReconError, Result};
use crate::grid::ProjectionGrid;

/// Dense projection stack stored `[projection, v, u]`.
///
/// Read-only input to back-projection; every detector image shares one grid.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionStack {
    grid: ProjectionGrid,
    data: Array3<f32>,
}

impl ProjectionStack {
    pub fn zeros(grid: ProjectionGrid, count: usize) -> Self {
        let [nv, nu] = grid.shape();
        Self {
            data: Array3::zeros((count, nv, nu)),
            grid,
        }
    }

    pub fn from_array(grid: ProjectionGrid, data: Array3<f32>) -> Result<Self> {
        let [nv, nu] = grid.shape();
        let (_, dv, du) = data.dim();
        if (dv, du) != (nv, nu) {
            return Err(ReconError::mismatch(format!(
                "projection buffer {:?} does not match detector shape {:?}",
                data.shape(),
                grid.shape()
            )));
        }
        Ok(Self {
            grid,
            data: data.as_standard_layout().into_owned(),
        })
    }

    pub fn grid(&self) -> &ProjectionGrid {
        &self.grid
    }

    /// Number of projection images.
    pub fn len(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn image(&self, index: usize) -> ArrayView2<'_, f32> {
        self.data.index_axis(Axis(0), index)
    }

    pub fn image_mut(&mut self, index: usize) -> ArrayViewMut2<'_, f32> {
        self.data.index_axis_mut(Axis(0), index)
    }

    pub fn into_data(self) -> Array3<f32> {
        self.data
    }

    /// Inner product with another stack on the same grid, accumulated in f64.
    pub fn dot(&self, other: &ProjectionStack) -> f64 {
        self.data
            .iter()
            .zip(other.data.iter())
            .map(|(&a, &b)| a as f64 * b as f64)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_shape() {
        let grid = ProjectionGrid::centered([5, 3], [1.0, 1.0]).unwrap();
        let mut stack = ProjectionStack::zeros(grid, 4);
        assert_eq!(stack.len(), 4);
        assert_eq!(stack.image(0).dim(), (3, 5));
        stack.image_mut(2)[[1, 4]] = 3.0;
        assert_eq!(stack.data()[[2, 1, 4]], 3.0);
    }

    #[test]
    fn test_rejects_wrong_detector_shape() {
        let grid = ProjectionGrid::centered([5, 3], [1.0, 1.0]).unwrap();
        let err = ProjectionStack::from_array(grid, Array3::zeros((2, 5, 3))).unwrap_err();
        assert!(matches!(err, ReconError::GeometryMismatch(_)));
    }
}
