//! Sampling grids for volumes and projection images.
//!
//! A grid ties discrete indices to physical coordinates:
//! `point = origin + Direction * (index * spacing)`.
//! Index order is always fastest axis first (`[x, y, z]` for volumes,
//! `[u, v]` for detector pixels), while buffers are stored C-order with the
//! fastest axis last.

use nalgebra::{Matrix2, Matrix3, Matrix4, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{ReconError, Result};

/// Physical frame and extent of a 3D volume.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolumeGrid {
    /// Number of voxels along x, y, z.
    pub size: [usize; 3],
    /// Physical distance between voxel centres along x, y, z.
    pub spacing: [f64; 3],
    /// Physical position of voxel (0, 0, 0).
    pub origin: [f64; 3],
    /// Direction cosines, column i is the physical direction of index axis i.
    pub direction: Matrix3<f64>,
}

impl VolumeGrid {
    /// Axis-aligned grid. Spacings must be strictly positive.
    pub fn new(size: [usize; 3], spacing: [f64; 3], origin: [f64; 3]) -> Result<Self> {
        if spacing.iter().any(|&s| !(s > 0.0) || !s.is_finite()) {
            return Err(ReconError::parameter(format!(
                "volume spacing must be positive, got {:?}",
                spacing
            )));
        }
        Ok(Self {
            size,
            spacing,
            origin,
            direction: Matrix3::identity(),
        })
    }

    /// Grid of `size` voxels centred on the physical origin.
    pub fn centered(size: [usize; 3], spacing: [f64; 3]) -> Result<Self> {
        let mut origin = [0.0; 3];
        for a in 0..3 {
            origin[a] = -0.5 * (size[a].saturating_sub(1)) as f64 * spacing[a];
        }
        Self::new(size, spacing, origin)
    }

    /// Replace the direction cosines. The matrix must be invertible.
    pub fn with_direction(mut self, direction: Matrix3<f64>) -> Result<Self> {
        if direction.determinant().abs() < 1e-12 {
            return Err(ReconError::parameter("volume direction matrix is singular"));
        }
        self.direction = direction;
        Ok(self)
    }

    /// Buffer shape in `[z, y, x]` order.
    pub fn shape(&self) -> [usize; 3] {
        [self.size[2], self.size[1], self.size[0]]
    }

    pub fn voxel_count(&self) -> usize {
        self.size.iter().product()
    }

    /// Homogeneous map from continuous voxel index `[i, j, k, 1]` to physical point.
    pub fn index_to_physical(&self) -> Matrix4<f64> {
        let scaled = self.direction * Matrix3::from_diagonal(&Vector3::from(self.spacing));
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&scaled);
        m.fixed_view_mut::<3, 1>(0, 3)
            .copy_from(&Vector3::from(self.origin));
        m
    }

    /// Homogeneous map from physical point to continuous voxel index.
    pub fn physical_to_index(&self) -> Result<Matrix4<f64>> {
        self.index_to_physical()
            .try_inverse()
            .ok_or_else(|| ReconError::parameter("volume index-to-physical map is singular"))
    }

    /// Physical position of voxel centre `[i, j, k]`.
    pub fn point(&self, index: [f64; 3]) -> Vector3<f64> {
        let scaled = Vector3::new(
            index[0] * self.spacing[0],
            index[1] * self.spacing[1],
            index[2] * self.spacing[2],
        );
        Vector3::from(self.origin) + self.direction * scaled
    }

    /// Fail with `GeometryMismatch` unless `other` samples the same space.
    pub fn ensure_same(&self, other: &VolumeGrid, what: &str) -> Result<()> {
        if self.size != other.size {
            return Err(ReconError::mismatch(format!(
                "{} has size {:?}, volume has {:?}",
                what, other.size, self.size
            )));
        }
        let close = |a: f64, b: f64| (a - b).abs() <= 1e-6 * a.abs().max(b.abs()).max(1.0);
        let frame_matches = (0..3).all(|a| {
            close(self.spacing[a], other.spacing[a]) && close(self.origin[a], other.origin[a])
        }) && self
            .direction
            .iter()
            .zip(other.direction.iter())
            .all(|(&a, &b)| close(a, b));
        if !frame_matches {
            return Err(ReconError::mismatch(format!(
                "{} is not sampled on the volume grid",
                what
            )));
        }
        Ok(())
    }
}

/// Physical frame and extent of one detector image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProjectionGrid {
    /// Number of pixels along u (columns) and v (rows).
    pub size: [usize; 2],
    pub spacing: [f64; 2],
    /// Detector-plane coordinate of pixel (0, 0).
    pub origin: [f64; 2],
    pub direction: Matrix2<f64>,
}

impl ProjectionGrid {
    pub fn new(size: [usize; 2], spacing: [f64; 2], origin: [f64; 2]) -> Result<Self> {
        if spacing.iter().any(|&s| !(s > 0.0) || !s.is_finite()) {
            return Err(ReconError::parameter(format!(
                "projection spacing must be positive, got {:?}",
                spacing
            )));
        }
        Ok(Self {
            size,
            spacing,
            origin,
            direction: Matrix2::identity(),
        })
    }

    /// Detector of `size` pixels centred on the detector-plane origin.
    pub fn centered(size: [usize; 2], spacing: [f64; 2]) -> Result<Self> {
        let origin = [
            -0.5 * (size[0].saturating_sub(1)) as f64 * spacing[0],
            -0.5 * (size[1].saturating_sub(1)) as f64 * spacing[1],
        ];
        Self::new(size, spacing, origin)
    }

    /// Buffer shape of one image in `[v, u]` order.
    pub fn shape(&self) -> [usize; 2] {
        [self.size[1], self.size[0]]
    }

    /// Homogeneous 2D map from detector-plane coordinate to continuous pixel index.
    pub fn physical_to_index(&self) -> Result<Matrix3<f64>> {
        let scaled = self.direction * Matrix2::from_diagonal(&Vector2::from(self.spacing));
        let mut m = Matrix3::identity();
        m.fixed_view_mut::<2, 2>(0, 0).copy_from(&scaled);
        m.fixed_view_mut::<2, 1>(0, 2)
            .copy_from(&Vector2::from(self.origin));
        m.try_inverse()
            .ok_or_else(|| ReconError::parameter("projection direction matrix is singular"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_physical_roundtrip() {
        let grid = VolumeGrid::new([4, 5, 6], [0.5, 1.0, 2.0], [-1.0, 2.0, 3.0]).unwrap();
        let p = grid.point([1.0, 2.0, 3.0]);
        assert_eq!(p, Vector3::new(-0.5, 4.0, 9.0));

        let back = grid.physical_to_index().unwrap() * p.push(1.0);
        for (a, expected) in [1.0, 2.0, 3.0].iter().enumerate() {
            assert!((back[a] - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn test_centered_grid() {
        let grid = VolumeGrid::centered([4, 4, 4], [1.0; 3]).unwrap();
        assert_eq!(grid.origin, [-1.5, -1.5, -1.5]);
        assert_eq!(grid.shape(), [4, 4, 4]);

        let det = ProjectionGrid::centered([3, 5], [2.0, 1.0]).unwrap();
        assert_eq!(det.origin, [-2.0, -2.0]);
        assert_eq!(det.shape(), [5, 3]);
    }

    #[test]
    fn test_rejects_bad_spacing() {
        assert!(VolumeGrid::new([2, 2, 2], [1.0, 0.0, 1.0], [0.0; 3]).is_err());
        assert!(ProjectionGrid::new([2, 2], [-1.0, 1.0], [0.0; 2]).is_err());
    }

    #[test]
    fn test_projection_physical_to_index() {
        let det = ProjectionGrid::new([10, 10], [0.5, 2.0], [1.0, -4.0]).unwrap();
        let m = det.physical_to_index().unwrap();
        let idx = m * nalgebra::Vector3::new(2.0, 0.0, 1.0);
        assert!((idx[0] - 2.0).abs() < 1e-12);
        assert!((idx[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_direction_rotates_index_axes() {
        // x index runs along physical y
        let swap = Matrix3::new(0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        let grid = VolumeGrid::new([3, 3, 3], [2.0, 1.0, 1.0], [0.0; 3])
            .unwrap()
            .with_direction(swap)
            .unwrap();
        assert_eq!(grid.point([1.0, 0.0, 0.0]), Vector3::new(0.0, 2.0, 0.0));
        assert!(grid.with_direction(Matrix3::zeros()).is_err());
    }

    #[test]
    fn test_ensure_same() {
        let a = VolumeGrid::centered([4, 4, 4], [1.0; 3]).unwrap();
        let b = VolumeGrid::centered([4, 4, 5], [1.0; 3]).unwrap();
        assert!(a.ensure_same(&a, "mask").is_ok());
        assert!(matches!(
            a.ensure_same(&b, "mask"),
            Err(ReconError::GeometryMismatch(_))
        ));
    }
}
