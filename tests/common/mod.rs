#![allow(dead_code)]

use cbct_recon::{
    ForwardProjector, Geometry, PhaseSignal, ProjectionGrid, ProjectionStack,
    SplatForwardProjector, Volume, VolumeGrid,
};
use ndarray::{Array3, Axis};

pub const SID: f64 = 50.0;
pub const SDD: f64 = 100.0;

/// Circular scan around Y with magnification 2.
pub fn circular_geometry(angles_deg: &[f64]) -> Geometry {
    let mut geometry = Geometry::new();
    for &angle in angles_deg {
        geometry
            .add_circular_projection(SID, SDD, angle, 0.0, 0.0)
            .unwrap();
    }
    geometry
}

pub fn small_volume_grid() -> VolumeGrid {
    VolumeGrid::centered([5, 4, 3], [1.0; 3]).unwrap()
}

pub fn small_detector_grid() -> ProjectionGrid {
    ProjectionGrid::centered([12, 9], [1.0; 2]).unwrap()
}

/// Smooth positive blob centred in the grid.
pub fn blob(grid: VolumeGrid) -> Volume {
    let mut volume = Volume::zeros(grid);
    let [nx, ny, nz] = grid.size;
    let centre = [
        (nx as f64 - 1.0) / 2.0,
        (ny as f64 - 1.0) / 2.0,
        (nz as f64 - 1.0) / 2.0,
    ];
    for ((k, j, i), v) in volume.data_mut().indexed_iter_mut() {
        let d2 = (i as f64 - centre[0]).powi(2)
            + (j as f64 - centre[1]).powi(2)
            + (k as f64 - centre[2]).powi(2);
        *v = (-d2 / 4.0).exp() as f32;
    }
    volume
}

/// Forward project `volume` through every record of `geometry`.
pub fn simulate(volume: &Volume, geometry: &Geometry, grid: ProjectionGrid) -> ProjectionStack {
    let [nu, nv] = grid.size;
    let mut data = Array3::<f32>::zeros((geometry.len(), nv, nu));
    for (n, mut slot) in data.axis_iter_mut(Axis(0)).enumerate() {
        let image = SplatForwardProjector
            .forward_project(volume, geometry, &grid, n)
            .unwrap();
        slot.assign(&image);
    }
    ProjectionStack::from_array(grid, data).unwrap()
}

/// Phase values evenly spread over one breathing cycle.
pub fn even_signal(n_projections: usize) -> PhaseSignal {
    PhaseSignal::new(
        (0..n_projections)
            .map(|n| n as f64 / n_projections as f64)
            .collect(),
    )
    .unwrap()
}
