//! Displacement vector fields and the warp collaborator.
//!
//! Fields are indexed by phase and shared read-only between the
//! motion-compensated solver and the inverse-warp regularization stage.

use ndarray::{Array4, ArrayView1};
use rayon::prelude::*;

use crate::error::{ReconError, Result};
use crate::grid::VolumeGrid;
use crate::volume::{Volume, VolumeSeries};

/// Dense displacement field stored `[z, y, x, 3]`, physical units, xyz order.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplacementField {
    grid: VolumeGrid,
    data: Array4<f32>,
}

impl DisplacementField {
    pub fn zeros(grid: VolumeGrid) -> Self {
        let [nz, ny, nx] = grid.shape();
        Self {
            data: Array4::zeros((nz, ny, nx, 3)),
            grid,
        }
    }

    pub fn from_array(grid: VolumeGrid, data: Array4<f32>) -> Result<Self> {
        let [nz, ny, nx] = grid.shape();
        if data.dim() != (nz, ny, nx, 3) {
            return Err(ReconError::mismatch(format!(
                "displacement buffer {:?} does not match grid shape {:?} x 3",
                data.shape(),
                grid.shape()
            )));
        }
        Ok(Self {
            grid,
            data: data.as_standard_layout().into_owned(),
        })
    }

    /// Same displacement everywhere.
    pub fn uniform(grid: VolumeGrid, displacement: [f32; 3]) -> Self {
        let mut field = Self::zeros(grid);
        for mut vector in field.data.rows_mut() {
            vector.assign(&ArrayView1::from(&displacement[..]));
        }
        field
    }

    pub fn grid(&self) -> &VolumeGrid {
        &self.grid
    }

    pub fn data(&self) -> &Array4<f32> {
        &self.data
    }
}

/// Per-phase forward fields and their inverses.
#[derive(Debug, Clone, PartialEq)]
pub struct DvfSet {
    pub forward: Vec<DisplacementField>,
    pub inverse: Vec<DisplacementField>,
}

impl DvfSet {
    pub fn new(forward: Vec<DisplacementField>, inverse: Vec<DisplacementField>) -> Self {
        Self { forward, inverse }
    }

    pub fn n_phases(&self) -> usize {
        self.forward.len()
    }

    /// Fail with `GeometryMismatch` unless there is one field pair per phase on `grid`.
    pub fn check(&self, n_phases: usize, grid: &VolumeGrid) -> Result<()> {
        if self.forward.len() != n_phases || self.inverse.len() != n_phases {
            return Err(ReconError::mismatch(format!(
                "{} forward / {} inverse displacement fields for {} phases",
                self.forward.len(),
                self.inverse.len(),
                n_phases
            )));
        }
        for field in self.forward.iter().chain(&self.inverse) {
            grid.ensure_same(field.grid(), "displacement field")?;
        }
        Ok(())
    }
}

/// Warp / unwarp collaborator.
pub trait Warper: Send + Sync {
    /// Resample `volume` through `field`.
    fn warp(&self, volume: &Volume, field: &DisplacementField) -> Result<Volume>;

    /// Undo a warp, given the inverse of the field used to warp.
    fn unwarp(&self, volume: &Volume, inverse_field: &DisplacementField) -> Result<Volume> {
        self.warp(volume, inverse_field)
    }
}

/// Warp every phase of `series` through its own field.
pub fn warp_series(
    warper: &dyn Warper,
    series: &VolumeSeries,
    fields: &[DisplacementField],
) -> Result<VolumeSeries> {
    map_phases(series, fields, |volume, field| warper.warp(volume, field))
}

/// Unwarp every phase of `series` with its inverse field.
pub fn unwarp_series(
    warper: &dyn Warper,
    series: &VolumeSeries,
    inverse_fields: &[DisplacementField],
) -> Result<VolumeSeries> {
    map_phases(series, inverse_fields, |volume, field| {
        warper.unwarp(volume, field)
    })
}

fn map_phases(
    series: &VolumeSeries,
    fields: &[DisplacementField],
    f: impl Fn(&Volume, &DisplacementField) -> Result<Volume>,
) -> Result<VolumeSeries> {
    if fields.len() != series.n_phases() {
        return Err(ReconError::mismatch(format!(
            "{} displacement fields for {} phases",
            fields.len(),
            series.n_phases()
        )));
    }
    let mut out = VolumeSeries::zeros(*series.grid(), series.n_phases());
    for (p, field) in fields.iter().enumerate() {
        let moved = f(&series.phase_volume(p)?, field)?;
        out.set_phase(p, &moved)?;
    }
    Ok(out)
}

/// Backward mapping `out(p) = in(p + d(p))` with trilinear interpolation.
///
/// Samples falling outside the input contribute zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrilinearWarper;

impl Warper for TrilinearWarper {
    fn warp(&self, volume: &Volume, field: &DisplacementField) -> Result<Volume> {
        let grid = *volume.grid();
        grid.ensure_same(field.grid(), "displacement field")?;
        let to_index = grid.physical_to_index()?;
        let [nx, ny, _] = grid.size;
        let input = volume.data();
        let displacement = field.data();

        let mut out = Volume::zeros(grid);
        if grid.voxel_count() == 0 {
            return Ok(out);
        }
        out.as_slice_mut()?
            .par_chunks_mut(nx * ny)
            .enumerate()
            .for_each(|(k, plane)| {
                for (offset, voxel) in plane.iter_mut().enumerate() {
                    let (j, i) = (offset / nx, offset % nx);
                    let d = displacement.slice(ndarray::s![k, j, i, ..]);
                    let p = grid.point([i as f64, j as f64, k as f64]);
                    let moved = nalgebra::Vector4::new(
                        p[0] + d[0] as f64,
                        p[1] + d[1] as f64,
                        p[2] + d[2] as f64,
                        1.0,
                    );
                    let c = to_index * moved;
                    *voxel = trilinear(input, [c[0], c[1], c[2]]);
                }
            });
        Ok(out)
    }
}

/// Trilinear resampling of `volume` onto `grid`, matched by physical position.
///
/// Voxels of `grid` outside the source volume read zero.
pub fn resample(volume: &Volume, grid: VolumeGrid) -> Result<Volume> {
    if *volume.grid() == grid {
        return Ok(volume.clone());
    }
    let to_source = volume.grid().physical_to_index()?;
    let [nx, ny, _] = grid.size;
    let input = volume.data();

    let mut out = Volume::zeros(grid);
    if grid.voxel_count() == 0 {
        return Ok(out);
    }
    out.as_slice_mut()?
        .par_chunks_mut(nx * ny)
        .enumerate()
        .for_each(|(k, plane)| {
            for (offset, voxel) in plane.iter_mut().enumerate() {
                let (j, i) = (offset / nx, offset % nx);
                let c = to_source * grid.point([i as f64, j as f64, k as f64]).push(1.0);
                *voxel = trilinear(input, [c[0], c[1], c[2]]);
            }
        });
    Ok(out)
}

fn trilinear(input: &ndarray::Array3<f32>, c: [f64; 3]) -> f32 {
    let (nz, ny, nx) = input.dim();
    let n = [nx, ny, nz];
    if (0..3).any(|a| !(c[a] > -1.0 && c[a] < n[a] as f64)) {
        return 0.0;
    }
    let f = c.map(f64::floor);
    let t = [c[0] - f[0], c[1] - f[1], c[2] - f[2]];
    let base = f.map(|v| v as isize);
    let mut acc = 0.0f64;
    for corner in 0..8 {
        let idx = [
            base[0] + (corner & 1) as isize,
            base[1] + ((corner >> 1) & 1) as isize,
            base[2] + ((corner >> 2) & 1) as isize,
        ];
        if (0..3).any(|a| idx[a] < 0 || idx[a] as usize >= n[a]) {
            continue;
        }
        let mut w = 1.0;
        for a in 0..3 {
            w *= if (corner >> a) & 1 == 1 { t[a] } else { 1.0 - t[a] };
        }
        acc += w * input[[idx[2] as usize, idx[1] as usize, idx[0] as usize]] as f64;
    }
    acc as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> VolumeGrid {
        VolumeGrid::centered([6, 5, 4], [2.0; 3]).unwrap()
    }

    fn ramp() -> Volume {
        let mut vol = Volume::zeros(grid());
        for ((k, j, i), v) in vol.data_mut().indexed_iter_mut() {
            *v = (i + 10 * j + 100 * k) as f32;
        }
        vol
    }

    #[test]
    fn test_zero_field_is_identity() {
        let vol = ramp();
        let out = TrilinearWarper
            .warp(&vol, &DisplacementField::zeros(grid()))
            .unwrap();
        assert_eq!(out, vol);
    }

    #[test]
    fn test_uniform_shift_by_one_voxel() {
        let vol = ramp();
        // one voxel along x is 2 mm
        let field = DisplacementField::uniform(grid(), [2.0, 0.0, 0.0]);
        let out = TrilinearWarper.warp(&vol, &field).unwrap();
        assert_eq!(out.data()[[1, 2, 3]], vol.data()[[1, 2, 4]]);
        // sampling beyond the last column reads zeros
        assert!(out.data()[[1, 2, 5]].abs() < 1e-6);

        let back = TrilinearWarper
            .unwarp(&out, &DisplacementField::uniform(grid(), [-2.0, 0.0, 0.0]))
            .unwrap();
        assert_eq!(back.data()[[1, 2, 3]], vol.data()[[1, 2, 3]]);
    }

    #[test]
    fn test_resample_onto_finer_grid() {
        let coarse = VolumeGrid::centered([3, 3, 3], [2.0; 3]).unwrap();
        let mut vol = Volume::zeros(coarse);
        for ((_, _, i), v) in vol.data_mut().indexed_iter_mut() {
            *v = i as f32;
        }
        let fine = VolumeGrid::centered([4, 3, 2], [1.0; 3]).unwrap();
        let out = resample(&vol, fine).unwrap();
        // x = -1.5 .. 1.5 falls on coarse index 0.25 .. 1.75
        for (i, expected) in [0.25f32, 0.75, 1.25, 1.75].iter().enumerate() {
            assert!((out.data()[[1, 2, i]] - expected).abs() < 1e-6);
        }
        assert_eq!(resample(&vol, coarse).unwrap(), vol);

        let outside = VolumeGrid::new([2, 2, 2], [1.0; 3], [10.0; 3]).unwrap();
        assert!(resample(&vol, outside).unwrap().data().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_dvf_set_check() {
        let set = DvfSet::new(
            vec![DisplacementField::zeros(grid()); 3],
            vec![DisplacementField::zeros(grid()); 3],
        );
        assert!(set.check(3, &grid()).is_ok());
        assert!(matches!(
            set.check(4, &grid()),
            Err(ReconError::GeometryMismatch(_))
        ));
    }
}
