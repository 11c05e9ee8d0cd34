//! Regularization stages applied between solver runs.
//!
//! Every stage consumes a volume series and hands back a new one of the same
//! shape. The orchestrator evaluates them through a `RegularizationPipeline`,
//! a fixed-order list of `(enabled, stage)` slots.

use std::fmt;
use std::sync::Arc;

use ndarray::{Axis, Zip};
use tracing::debug;

use crate::error::{ReconError, Result};
use crate::grid::VolumeGrid;
use crate::volume::{Volume, VolumeSeries};
use crate::warp::{resample, unwarp_series, warp_series, DvfSet, Warper};

/// A regularizer on 4D volume sequences.
pub trait RegularizationStage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Reject inputs this stage cannot process before any work is done.
    fn check(&self, _grid: &VolumeGrid, _n_phases: usize) -> Result<()> {
        Ok(())
    }

    fn apply(&self, x: VolumeSeries) -> Result<VolumeSeries>;
}

/// Denoising collaborator (total variation, wavelets, L0 gradient, ...).
///
/// Must return a series with the shape and grid of its input.
pub trait SequenceDenoiser: Send + Sync {
    fn denoise(&self, x: VolumeSeries) -> Result<VolumeSeries>;
}

/// `max(x, 0)` per voxel.
#[derive(Debug, Clone, Copy, Default)]
pub struct Positivity;

impl RegularizationStage for Positivity {
    fn name(&self) -> &'static str {
        "positivity"
    }

    fn apply(&self, mut x: VolumeSeries) -> Result<VolumeSeries> {
        x.data_mut().mapv_inplace(|v| v.max(0.0));
        Ok(x)
    }
}

/// Blend voxels outside the region of interest toward their temporal mean:
/// `out = m·x + (1 − m)·mean_t(x)`.
///
/// The mask may live on any grid; it is sampled at the series voxel
/// positions and reads 0 outside its own extent.
#[derive(Debug, Clone)]
pub struct AverageOutOfRoi {
    mask: Volume,
}

impl AverageOutOfRoi {
    /// Mask values must lie in `[0, 1]`; 1 is inside the region.
    pub fn new(mask: Volume) -> Result<Self> {
        if let Some(bad) = mask
            .data()
            .iter()
            .find(|m| !(m.is_finite() && **m >= 0.0 && **m <= 1.0))
        {
            return Err(ReconError::parameter(format!(
                "ROI mask value {} is outside [0, 1]",
                bad
            )));
        }
        Ok(Self { mask })
    }

    pub fn mask(&self) -> &Volume {
        &self.mask
    }
}

impl RegularizationStage for AverageOutOfRoi {
    fn name(&self) -> &'static str {
        "roi-average"
    }

    fn apply(&self, mut x: VolumeSeries) -> Result<VolumeSeries> {
        let Some(mean) = x.data().mean_axis(Axis(0)) else {
            return Ok(x);
        };
        // masks drawn on another grid are resampled onto the series grid
        let resampled;
        let mask = if self.mask.grid() == x.grid() {
            &self.mask
        } else {
            resampled = resample(&self.mask, *x.grid())?;
            &resampled
        };
        for phase in x.data_mut().axis_iter_mut(Axis(0)) {
            Zip::from(phase)
                .and(&mean)
                .and(mask.data())
                .for_each(|v, &avg, &m| *v = m * *v + (1.0 - m) * avg);
        }
        Ok(x)
    }
}

/// Adapts a `SequenceDenoiser` collaborator to the stage contract.
pub struct DenoiserStage {
    name: &'static str,
    denoiser: Arc<dyn SequenceDenoiser>,
}

impl DenoiserStage {
    pub fn new(name: &'static str, denoiser: Arc<dyn SequenceDenoiser>) -> Self {
        Self { name, denoiser }
    }
}

impl fmt::Debug for DenoiserStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DenoiserStage").field("name", &self.name).finish()
    }
}

impl RegularizationStage for DenoiserStage {
    fn name(&self) -> &'static str {
        self.name
    }

    fn apply(&self, x: VolumeSeries) -> Result<VolumeSeries> {
        let grid = *x.grid();
        let n_phases = x.n_phases();
        let out = self.denoiser.denoise(x)?;
        grid.ensure_same(out.grid(), self.name)?;
        if out.n_phases() != n_phases {
            return Err(ReconError::mismatch(format!(
                "{} returned {} phases, expected {}",
                self.name,
                out.n_phases(),
                n_phases
            )));
        }
        Ok(out)
    }
}

/// Moves every phase to the reference frame through its forward field, so the
/// temporal stages compare voxels that follow the same tissue.
pub struct WarpSequence {
    dvfs: Arc<DvfSet>,
    warper: Arc<dyn Warper>,
}

impl WarpSequence {
    pub fn new(dvfs: Arc<DvfSet>, warper: Arc<dyn Warper>) -> Self {
        Self { dvfs, warper }
    }
}

impl fmt::Debug for WarpSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WarpSequence")
            .field("phases", &self.dvfs.n_phases())
            .finish()
    }
}

impl RegularizationStage for WarpSequence {
    fn name(&self) -> &'static str {
        "warp"
    }

    fn check(&self, grid: &VolumeGrid, n_phases: usize) -> Result<()> {
        self.dvfs.check(n_phases, grid)
    }

    fn apply(&self, x: VolumeSeries) -> Result<VolumeSeries> {
        self.check(x.grid(), x.n_phases())?;
        warp_series(self.warper.as_ref(), &x, &self.dvfs.forward)
    }
}

/// Undoes `WarpSequence`.
///
/// Starts from the inverse-field unwarp `y = U(x)`, then refines it with
/// `y ← y + U(S ⊙ (x − W(y)))`, where `S` keeps only voxels whose forward warp
/// samples lie fully inside the volume. Without refinements this is the
/// plain inverse-field unwarp.
pub struct UnwarpSequence {
    dvfs: Arc<DvfSet>,
    warper: Arc<dyn Warper>,
    refinements: usize,
}

impl UnwarpSequence {
    pub fn new(dvfs: Arc<DvfSet>, warper: Arc<dyn Warper>, refinements: usize) -> Self {
        Self {
            dvfs,
            warper,
            refinements,
        }
    }

    /// 1 where the forward warp of a constant volume is fully supported.
    fn support(&self, grid: VolumeGrid, n_phases: usize) -> Result<VolumeSeries> {
        let mut ones = VolumeSeries::zeros(grid, n_phases);
        ones.data_mut().fill(1.0);
        let mut reach = warp_series(self.warper.as_ref(), &ones, &self.dvfs.forward)?;
        reach
            .data_mut()
            .mapv_inplace(|v| if (v - 1.0).abs() <= SUPPORT_TOLERANCE { 1.0 } else { 0.0 });
        Ok(reach)
    }
}

const SUPPORT_TOLERANCE: f32 = 1e-3;

impl fmt::Debug for UnwarpSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnwarpSequence")
            .field("phases", &self.dvfs.n_phases())
            .field("refinements", &self.refinements)
            .finish()
    }
}

impl RegularizationStage for UnwarpSequence {
    fn name(&self) -> &'static str {
        "unwarp"
    }

    fn check(&self, grid: &VolumeGrid, n_phases: usize) -> Result<()> {
        self.dvfs.check(n_phases, grid)
    }

    fn apply(&self, x: VolumeSeries) -> Result<VolumeSeries> {
        self.check(x.grid(), x.n_phases())?;
        let warper = self.warper.as_ref();
        let mut y = unwarp_series(warper, &x, &self.dvfs.inverse)?;
        if self.refinements == 0 {
            return Ok(y);
        }
        let support = self.support(*x.grid(), x.n_phases())?;
        for it in 0..self.refinements {
            let mut residual = x.clone().difference(&warp_series(warper, &y, &self.dvfs.forward)?);
            *residual.data_mut() *= support.data();
            debug!(iteration = it, residual = residual.norm(), "unwarp refinement");
            y.axpy(1.0, &unwarp_series(warper, &residual, &self.dvfs.inverse)?);
        }
        Ok(y)
    }
}

/// Position of a stage in the fixed regularization order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Positivity,
    RoiAverage,
    SpatialTv,
    Wavelets,
    Warp,
    TemporalTv,
    TemporalL0,
    Unwarp,
}

impl StageKind {
    pub const ORDER: [StageKind; 8] = [
        StageKind::Positivity,
        StageKind::RoiAverage,
        StageKind::SpatialTv,
        StageKind::Wavelets,
        StageKind::Warp,
        StageKind::TemporalTv,
        StageKind::TemporalL0,
        StageKind::Unwarp,
    ];

    /// What must be bound before an enabled stage of this kind can run.
    pub fn requirement(self) -> &'static str {
        match self {
            StageKind::Positivity => "nothing",
            StageKind::RoiAverage => "ROI mask",
            StageKind::SpatialTv => "spatial TV denoiser",
            StageKind::Wavelets => "wavelets denoiser",
            StageKind::TemporalTv => "temporal TV denoiser",
            StageKind::TemporalL0 => "temporal L0 denoiser",
            StageKind::Warp | StageKind::Unwarp => "displacement fields",
        }
    }
}

struct Slot {
    kind: StageKind,
    enabled: bool,
    stage: Option<Box<dyn RegularizationStage>>,
}

/// The ordered stage list, evaluated in one place.
pub struct RegularizationPipeline {
    slots: Vec<Slot>,
}

impl RegularizationPipeline {
    /// All stages disabled and unbound, in `StageKind::ORDER`.
    pub fn new() -> Self {
        Self {
            slots: StageKind::ORDER
                .iter()
                .map(|&kind| Slot {
                    kind,
                    enabled: false,
                    stage: None,
                })
                .collect(),
        }
    }

    fn slot_mut(&mut self, kind: StageKind) -> &mut Slot {
        // slots are built from ORDER, which follows declaration order
        &mut self.slots[kind as usize]
    }

    pub fn set_enabled(&mut self, kind: StageKind, enabled: bool) {
        self.slot_mut(kind).enabled = enabled;
    }

    pub fn bind(&mut self, kind: StageKind, stage: Box<dyn RegularizationStage>) {
        self.slot_mut(kind).stage = Some(stage);
    }

    pub fn enabled(&self) -> impl Iterator<Item = StageKind> + '_ {
        self.slots.iter().filter(|s| s.enabled).map(|s| s.kind)
    }

    /// `MissingInput` for an enabled stage with nothing bound, then each
    /// bound stage's own checks.
    pub fn verify(&self, grid: &VolumeGrid, n_phases: usize) -> Result<()> {
        for slot in self.slots.iter().filter(|s| s.enabled) {
            let stage = slot
                .stage
                .as_ref()
                .ok_or(ReconError::MissingInput(slot.kind.requirement()))?;
            stage.check(grid, n_phases)?;
        }
        Ok(())
    }

    pub fn apply(&self, mut x: VolumeSeries) -> Result<VolumeSeries> {
        for slot in &self.slots {
            if !slot.enabled {
                continue;
            }
            let stage = slot
                .stage
                .as_ref()
                .ok_or(ReconError::MissingInput(slot.kind.requirement()))?;
            debug!(stage = stage.name(), "regularization");
            x = stage.apply(x)?;
        }
        Ok(x)
    }
}

impl Default for RegularizationPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RegularizationPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                self.slots
                    .iter()
                    .map(|s| (s.kind, s.enabled, s.stage.is_some())),
            )
            .finish()
    }
}
