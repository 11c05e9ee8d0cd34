//! Linear operators handed to the conjugate-gradient solver.
//!
//! `ProjectionOperator` couples the forward and back projectors with the
//! phase interpolation weights, so that a 4D series `x` maps to projections
//! `A x` and back to `Aᵀ A x`. `MotionCompensatedOperator` sandwiches the
//! same normal operator between a per-phase warp and its inverse.

use std::sync::Arc;

use ndarray::{Array2, Array3, Axis};
use rayon::prelude::*;
use tracing::debug;

use crate::backprojection::BackProjector;
use crate::error::{ReconError, Result};
use crate::forward::ForwardProjector;
use crate::geometry::Geometry;
use crate::grid::{ProjectionGrid, VolumeGrid};
use crate::projection::ProjectionStack;
use crate::volume::{Volume, VolumeSeries};
use crate::warp::{unwarp_series, warp_series, DvfSet, Warper};

/// Square operator on volume series.
pub trait LinearOperator: Send + Sync {
    fn apply(&self, x: &VolumeSeries) -> Result<VolumeSeries>;
}

/// Normal operator of a least-squares data term: `apply` is `Aᵀ A (+ λ I)`
/// and `right_hand_side` is `Aᵀ b`.
pub trait DataFidelity: LinearOperator {
    fn right_hand_side(&self, projections: &ProjectionStack) -> Result<VolumeSeries>;

    fn n_phases(&self) -> usize;
}

/// `A`: series to projections through the phase interpolation weights.
pub struct ProjectionOperator {
    geometry: Arc<Geometry>,
    volume_grid: VolumeGrid,
    projection_grid: ProjectionGrid,
    /// `[n_phases, n_projections]`
    weights: Array2<f32>,
    forward: Arc<dyn ForwardProjector>,
    back: Arc<dyn BackProjector>,
    tikhonov: f64,
}

impl std::fmt::Debug for ProjectionOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionOperator")
            .field("volume_grid", &self.volume_grid)
            .field("projection_grid", &self.projection_grid)
            .field("weights", &self.weights.dim())
            .field("tikhonov", &self.tikhonov)
            .finish()
    }
}

impl ProjectionOperator {
    pub fn new(
        geometry: Arc<Geometry>,
        volume_grid: VolumeGrid,
        projection_grid: ProjectionGrid,
        weights: Array2<f32>,
        forward: Arc<dyn ForwardProjector>,
        back: Arc<dyn BackProjector>,
    ) -> Result<Self> {
        let (n_phases, n_proj) = weights.dim();
        if n_phases == 0 {
            return Err(ReconError::parameter("at least one phase is required"));
        }
        if n_proj > geometry.len() {
            return Err(ReconError::InvalidIndex {
                index: n_proj - 1,
                len: geometry.len(),
            });
        }
        Ok(Self {
            geometry,
            volume_grid,
            projection_grid,
            weights: weights.as_standard_layout().into_owned(),
            forward,
            back,
            tikhonov: 0.0,
        })
    }

    /// Add `λ x` to the normal operator.
    pub fn with_tikhonov(mut self, lambda: f64) -> Result<Self> {
        if !(lambda.is_finite() && lambda >= 0.0) {
            return Err(ReconError::parameter(format!(
                "Tikhonov weight must be non-negative, got {}",
                lambda
            )));
        }
        self.tikhonov = lambda;
        Ok(self)
    }

    pub fn n_projections(&self) -> usize {
        self.weights.ncols()
    }

    pub fn volume_grid(&self) -> &VolumeGrid {
        &self.volume_grid
    }

    fn check_series(&self, x: &VolumeSeries) -> Result<()> {
        self.volume_grid.ensure_same(x.grid(), "volume series")?;
        if x.n_phases() != self.weights.nrows() {
            return Err(ReconError::mismatch(format!(
                "series has {} phases, operator expects {}",
                x.n_phases(),
                self.weights.nrows()
            )));
        }
        Ok(())
    }

    /// `y_n = Σ_p w[p, n] · FP_n(x_p)`
    pub fn forward(&self, x: &VolumeSeries) -> Result<ProjectionStack> {
        self.check_series(x)?;
        let phases = (0..x.n_phases())
            .map(|p| x.phase_volume(p))
            .collect::<Result<Vec<Volume>>>()?;
        let [nu, nv] = self.projection_grid.size;

        let images = (0..self.n_projections())
            .into_par_iter()
            .map(|n| {
                let mut image = Array2::<f32>::zeros((nv, nu));
                for (p, volume) in phases.iter().enumerate() {
                    let w = self.weights[[p, n]];
                    if w == 0.0 {
                        continue;
                    }
                    let projected = self.forward.forward_project(
                        volume,
                        &self.geometry,
                        &self.projection_grid,
                        n,
                    )?;
                    image.scaled_add(w, &projected);
                }
                Ok(image)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut data = Array3::<f32>::zeros((images.len(), nv, nu));
        for (mut slot, image) in data.axis_iter_mut(Axis(0)).zip(&images) {
            slot.assign(image);
        }
        ProjectionStack::from_array(self.projection_grid, data)
    }

    /// `x_p = Σ_n w[p, n] · BP_n(y_n)`
    pub fn adjoint(&self, projections: &ProjectionStack) -> Result<VolumeSeries> {
        if projections.len() != self.n_projections() {
            return Err(ReconError::mismatch(format!(
                "{} projections, operator expects {}",
                projections.len(),
                self.n_projections()
            )));
        }
        let n_phases = self.weights.nrows();
        let mut out = VolumeSeries::zeros(self.volume_grid, n_phases);
        for (p, row) in self.weights.axis_iter(Axis(0)).enumerate() {
            let mut volume = Volume::zeros(self.volume_grid);
            self.back
                .backproject_weighted(&mut volume, projections, &self.geometry, &row.to_vec())?;
            out.set_phase(p, &volume)?;
        }
        Ok(out)
    }
}

impl LinearOperator for ProjectionOperator {
    fn apply(&self, x: &VolumeSeries) -> Result<VolumeSeries> {
        let mut out = self.adjoint(&self.forward(x)?)?;
        if self.tikhonov > 0.0 {
            out.axpy(self.tikhonov, x);
        }
        Ok(out)
    }
}

impl DataFidelity for ProjectionOperator {
    fn right_hand_side(&self, projections: &ProjectionStack) -> Result<VolumeSeries> {
        self.adjoint(projections)
    }

    fn n_phases(&self) -> usize {
        self.weights.nrows()
    }
}

/// `U(N(W x))`: warp each phase to the reference, apply the normal operator
/// `N`, unwarp the result.
pub struct MotionCompensatedOperator<O> {
    inner: O,
    dvfs: Arc<DvfSet>,
    warper: Arc<dyn Warper>,
}

impl<O: DataFidelity> MotionCompensatedOperator<O> {
    /// Fails with `GeometryMismatch` unless `dvfs` holds one field pair per phase.
    pub fn new(
        inner: O,
        grid: &VolumeGrid,
        dvfs: Arc<DvfSet>,
        warper: Arc<dyn Warper>,
    ) -> Result<Self> {
        dvfs.check(inner.n_phases(), grid)?;
        debug!(phases = dvfs.n_phases(), "motion-compensated operator");
        Ok(Self {
            inner,
            dvfs,
            warper,
        })
    }

    pub fn inner(&self) -> &O {
        &self.inner
    }
}

impl<O: DataFidelity> LinearOperator for MotionCompensatedOperator<O> {
    fn apply(&self, x: &VolumeSeries) -> Result<VolumeSeries> {
        let warped = warp_series(self.warper.as_ref(), x, &self.dvfs.forward)?;
        let normal = self.inner.apply(&warped)?;
        unwarp_series(self.warper.as_ref(), &normal, &self.dvfs.inverse)
    }
}

impl<O: DataFidelity> DataFidelity for MotionCompensatedOperator<O> {
    fn right_hand_side(&self, projections: &ProjectionStack) -> Result<VolumeSeries> {
        let rhs = self.inner.right_hand_side(projections)?;
        unwarp_series(self.warper.as_ref(), &rhs, &self.dvfs.inverse)
    }

    fn n_phases(&self) -> usize {
        self.inner.n_phases()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backprojection::VoxelBackProjector;
    use crate::forward::SplatForwardProjector;
    use crate::signal::PhaseSignal;
    use crate::warp::{DisplacementField, TrilinearWarper};

    fn setup(n_phases: usize) -> ProjectionOperator {
        let mut geometry = Geometry::new();
        for angle in [0.0, 60.0, 120.0, 200.0] {
            geometry
                .add_circular_projection(50.0, 100.0, angle, 0.0, 0.0)
                .unwrap();
        }
        let signal = PhaseSignal::new(vec![0.0, 0.3, 0.55, 0.8]).unwrap();
        ProjectionOperator::new(
            Arc::new(geometry),
            VolumeGrid::centered([6, 6, 4], [1.0; 3]).unwrap(),
            ProjectionGrid::centered([16, 10], [1.0; 2]).unwrap(),
            signal.interpolation_weights(n_phases).unwrap(),
            Arc::new(SplatForwardProjector),
            Arc::new(VoxelBackProjector::new()),
        )
        .unwrap()
    }

    fn bump(grid: VolumeGrid, n_phases: usize) -> VolumeSeries {
        let mut x = VolumeSeries::zeros(grid, n_phases);
        for ((p, k, j, i), v) in x.data_mut().indexed_iter_mut() {
            *v = ((i + 2 * j + 3 * k + p) % 5) as f32;
        }
        x
    }

    #[test]
    fn test_forward_and_adjoint_are_dual() {
        let op = setup(2);
        let x = bump(*op.volume_grid(), 2);
        let ax = op.forward(&x).unwrap();
        let y = ProjectionStack::from_array(
            ProjectionGrid::centered([16, 10], [1.0; 2]).unwrap(),
            Array3::from_shape_fn((4, 10, 16), |(n, v, u)| ((n + u + 3 * v) % 7) as f32 * 0.1),
        )
        .unwrap();
        let aty = op.adjoint(&y).unwrap();
        let lhs = ax.dot(&y);
        let rhs = x.dot(&aty);
        assert!((lhs - rhs).abs() <= 1e-4 * lhs.abs().max(1.0), "{} vs {}", lhs, rhs);
    }

    #[test]
    fn test_tikhonov_adds_identity() {
        let op = setup(1);
        let x = bump(*op.volume_grid(), 1);
        let plain = op.apply(&x).unwrap();
        let op = setup(1).with_tikhonov(2.0).unwrap();
        let damped = op.apply(&x).unwrap();
        let diff = damped.difference(&plain);
        let mut expected = x.clone();
        expected.data_mut().mapv_inplace(|v| 2.0 * v);
        let err = diff.difference(&expected).norm();
        assert!(err < 1e-3 * expected.norm());
        assert!(setup(1).with_tikhonov(-1.0).is_err());
    }

    #[test]
    fn test_phase_count_mismatch() {
        let op = setup(2);
        let x = bump(*op.volume_grid(), 3);
        assert!(matches!(
            op.forward(&x),
            Err(ReconError::GeometryMismatch(_))
        ));
    }

    #[test]
    fn test_motion_operator_with_zero_fields_matches_plain() {
        let grid = *setup(2).volume_grid();
        let dvfs = DvfSet::new(
            vec![DisplacementField::zeros(grid); 2],
            vec![DisplacementField::zeros(grid); 2],
        );
        let mc = MotionCompensatedOperator::new(
            setup(2),
            &grid,
            Arc::new(dvfs),
            Arc::new(TrilinearWarper),
        )
        .unwrap();
        let x = bump(grid, 2);
        let plain = mc.inner().apply(&x).unwrap();
        let err = mc.apply(&x).unwrap().difference(&plain).norm();
        assert!(err <= 1e-5 * plain.norm());
    }

    #[test]
    fn test_motion_operator_rejects_wrong_field_count() {
        let grid = *setup(2).volume_grid();
        let dvfs = DvfSet::new(
            vec![DisplacementField::zeros(grid); 3],
            vec![DisplacementField::zeros(grid); 3],
        );
        let result =
            MotionCompensatedOperator::new(setup(2), &grid, Arc::new(dvfs), Arc::new(TrilinearWarper));
        assert!(matches!(result, Err(ReconError::GeometryMismatch(_))));
    }
}
