//! Forward projection: the dual of back-projection.
//!
//! The reconstruction only needs the `ForwardProjector` contract. The
//! splatting projector shipped here is the exact transpose of
//! `VoxelBackProjector`: every voxel distributes its value over the same four
//! detector pixels with the same bilinear weights that back-projection reads
//! them with, so the two form an adjoint pair up to rounding.

use ndarray::Array2;

use crate::error::Result;
use crate::geometry::{DetectorMapping, Geometry};
use crate::grid::ProjectionGrid;
use crate::volume::Volume;

/// Forward-projection collaborator.
///
/// Must be geometrically dual to the back-projector it is paired with for the
/// conjugate-gradient solver to converge.
pub trait ForwardProjector: Send + Sync {
    /// Simulate projection `index` of `volume`, sampled on `grid` (`[v, u]`).
    fn forward_project(
        &self,
        volume: &Volume,
        geometry: &Geometry,
        grid: &ProjectionGrid,
        index: usize,
    ) -> Result<Array2<f32>>;
}

/// Voxel-driven bilinear splatting, transpose of `VoxelBackProjector`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SplatForwardProjector;

impl ForwardProjector for SplatForwardProjector {
    fn forward_project(
        &self,
        volume: &Volume,
        geometry: &Geometry,
        grid: &ProjectionGrid,
        index: usize,
    ) -> Result<Array2<f32>> {
        let mapping = geometry.mapping_for(volume.grid(), grid, index)?;
        let [nu, nv] = grid.size;
        let mut image = vec![0.0f64; nu * nv];

        for ((k, j, i), &value) in volume.data().indexed_iter() {
            if value == 0.0 {
                continue;
            }
            let (i, j, k) = (i as f64, j as f64, k as f64);
            let coords = match &mapping {
                DetectorMapping::Flat(m) => m.project([i, j, k]),
                DetectorMapping::Cylindrical(c) => c.project(i, j, k),
            };
            if let Some([cu, cv]) = coords {
                splat(&mut image, nu, nv, cu, cv, value as f64);
            }
        }

        Ok(Array2::from_shape_fn((nv, nu), |(v, u)| {
            image[v * nu + u] as f32
        }))
    }
}

/// Transpose of `backprojection::bilinear`.
#[inline(always)]
fn splat(image: &mut [f64], nu: usize, nv: usize, cu: f64, cv: f64, value: f64) {
    if !(cu > -1.0 && cv > -1.0 && cu < nu as f64 && cv < nv as f64) {
        return;
    }
    let (fu, fv) = (cu.floor(), cv.floor());
    let (du, dv) = (cu - fu, cv - fv);
    let (iu, iv) = (fu as isize, fv as isize);
    let mut add = |u: isize, v: isize, w: f64| {
        if u >= 0 && v >= 0 && (u as usize) < nu && (v as usize) < nv {
            image[v as usize * nu + u as usize] += w * value;
        }
    };
    add(iu, iv, (1.0 - dv) * (1.0 - du));
    add(iu + 1, iv, (1.0 - dv) * du);
    add(iu, iv + 1, dv * (1.0 - du));
    add(iu + 1, iv + 1, dv * du);
}
