//! Owned volume buffers.
//!
//! A `Volume` is one 3D estimate, a `VolumeSeries` is the 4D sequence of
//! phase volumes the reconstruction works on. Both are moved from stage to
//! stage; nothing in the crate keeps a reference to a buffer it has handed on.

use ndarray::{Array3, Array4, ArrayView3, ArrayViewMut3, Axis, Zip};

use crate::error::{ReconError, Result};
use crate::grid::VolumeGrid;

/// Dense 3D volume stored `[z, y, x]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    grid: VolumeGrid,
    data: Array3<f32>,
}

impl Volume {
    pub fn zeros(grid: VolumeGrid) -> Self {
        Self {
            data: Array3::zeros(grid.shape()),
            grid,
        }
    }

    /// Wrap an existing buffer. Its shape must be the grid's `[z, y, x]` shape.
    pub fn from_array(grid: VolumeGrid, data: Array3<f32>) -> Result<Self> {
        if data.dim() != (grid.shape()[0], grid.shape()[1], grid.shape()[2]) {
            return Err(ReconError::mismatch(format!(
                "volume buffer {:?} does not match grid shape {:?}",
                data.shape(),
                grid.shape()
            )));
        }
        Ok(Self {
            grid,
            data: data.as_standard_layout().into_owned(),
        })
    }

    pub fn grid(&self) -> &VolumeGrid {
        &self.grid
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Array3<f32> {
        &mut self.data
    }

    pub fn into_data(self) -> Array3<f32> {
        self.data
    }

    /// Contiguous `[z, y, x]` slice. Buffers are kept in standard layout.
    pub(crate) fn as_slice_mut(&mut self) -> Result<&mut [f32]> {
        self.data
            .as_slice_mut()
            .ok_or_else(|| ReconError::parameter("volume buffer is not contiguous"))
    }
}

/// Sequence of phase volumes stored `[phase, z, y, x]`.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeSeries {
    grid: VolumeGrid,
    data: Array4<f32>,
}

impl VolumeSeries {
    pub fn zeros(grid: VolumeGrid, n_phases: usize) -> Self {
        let [nz, ny, nx] = grid.shape();
        Self {
            data: Array4::zeros((n_phases, nz, ny, nx)),
            grid,
        }
    }

    pub fn from_array(grid: VolumeGrid, data: Array4<f32>) -> Result<Self> {
        let [nz, ny, nx] = grid.shape();
        let (_, dz, dy, dx) = data.dim();
        if (dz, dy, dx) != (nz, ny, nx) {
            return Err(ReconError::mismatch(format!(
                "series buffer {:?} does not match grid shape {:?}",
                data.shape(),
                grid.shape()
            )));
        }
        Ok(Self {
            grid,
            data: data.as_standard_layout().into_owned(),
        })
    }

    /// Series with every phase set to a copy of `volume`.
    pub fn repeat(volume: &Volume, n_phases: usize) -> Self {
        let mut series = Self::zeros(*volume.grid(), n_phases);
        for mut phase in series.data.outer_iter_mut() {
            phase.assign(volume.data());
        }
        series
    }

    pub fn grid(&self) -> &VolumeGrid {
        &self.grid
    }

    pub fn n_phases(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    pub fn data(&self) -> &Array4<f32> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Array4<f32> {
        &mut self.data
    }

    pub fn into_data(self) -> Array4<f32> {
        self.data
    }

    pub fn phase(&self, p: usize) -> Result<ArrayView3<'_, f32>> {
        ReconError::check_index(p, self.n_phases())?;
        Ok(self.data.index_axis(Axis(0), p))
    }

    pub fn phase_mut(&mut self, p: usize) -> Result<ArrayViewMut3<'_, f32>> {
        ReconError::check_index(p, self.n_phases())?;
        Ok(self.data.index_axis_mut(Axis(0), p))
    }

    /// Owned copy of phase `p` as a standalone volume.
    pub fn phase_volume(&self, p: usize) -> Result<Volume> {
        Ok(Volume {
            grid: self.grid,
            data: self.phase(p)?.to_owned(),
        })
    }

    /// Overwrite phase `p` with `volume`, which must share the series grid.
    pub fn set_phase(&mut self, p: usize, volume: &Volume) -> Result<()> {
        self.grid.ensure_same(volume.grid(), "phase volume")?;
        self.phase_mut(p)?.assign(volume.data());
        Ok(())
    }

    /// Fail with `GeometryMismatch` unless `other` has the same grid and phase count.
    pub fn ensure_compatible(&self, other: &VolumeSeries) -> Result<()> {
        self.grid.ensure_same(&other.grid, "series")?;
        if self.n_phases() != other.n_phases() {
            return Err(ReconError::mismatch(format!(
                "series has {} phases, expected {}",
                other.n_phases(),
                self.n_phases()
            )));
        }
        Ok(())
    }

    /// Inner product, accumulated in f64.
    pub fn dot(&self, other: &VolumeSeries) -> f64 {
        let mut acc = 0.0f64;
        Zip::from(&self.data).and(&other.data).for_each(|&a, &b| {
            acc += a as f64 * b as f64;
        });
        acc
    }

    pub fn norm(&self) -> f64 {
        self.dot(self).sqrt()
    }

    /// `self += alpha * x`
    pub fn axpy(&mut self, alpha: f64, x: &VolumeSeries) {
        let alpha = alpha as f32;
        Zip::from(&mut self.data).and(&x.data).for_each(|y, &x| {
            *y += alpha * x;
        });
    }

    /// `self = x + beta * self`
    pub fn xpby(&mut self, x: &VolumeSeries, beta: f64) {
        let beta = beta as f32;
        Zip::from(&mut self.data).and(&x.data).for_each(|y, &x| {
            *y = x + beta * *y;
        });
    }

    /// `self - other`, consuming `self`.
    pub fn difference(mut self, other: &VolumeSeries) -> VolumeSeries {
        self.data -= &other.data;
        self
    }
}
