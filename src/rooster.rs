//! 4D ROOSTER: alternate a conjugate-gradient data-fidelity solve with the
//! regularization stages, feeding each outer iteration's result back as the
//! next starting estimate.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backprojection::BackProjector;
use crate::cg::ConjugateGradient;
use crate::error::{ReconError, Result};
use crate::forward::ForwardProjector;
use crate::geometry::Geometry;
use crate::operator::{DataFidelity, MotionCompensatedOperator, ProjectionOperator};
use crate::projection::ProjectionStack;
use crate::regularization::{
    AverageOutOfRoi, DenoiserStage, Positivity, RegularizationPipeline, SequenceDenoiser,
    StageKind, UnwarpSequence, WarpSequence,
};
use crate::signal::PhaseSignal;
use crate::volume::{Volume, VolumeSeries};
use crate::warp::{DvfSet, Warper};

/// Outer-loop settings. Every regularization stage is off unless enabled here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoosterConfig {
    pub outer_iterations: usize,
    pub cg_iterations: usize,
    pub cg_tolerance: Option<f64>,
    /// λ in `(AᵀA + λI) x = Aᵀb`.
    pub tikhonov: f64,
    pub phases: usize,
    pub positivity: bool,
    pub roi_average: bool,
    pub spatial_tv: bool,
    pub wavelets: bool,
    pub temporal_tv: bool,
    pub temporal_l0: bool,
    /// Solve with the warped operator `U AᵀA W`.
    pub motion_compensation: bool,
    /// Run the temporal stages on the sequence warped to the reference frame.
    pub warping: bool,
    /// Refinement steps of the unwarp; 0 unwarps with the inverse fields only.
    pub unwarp_refinements: usize,
}

impl Default for RoosterConfig {
    fn default() -> Self {
        Self {
            outer_iterations: 5,
            cg_iterations: 4,
            cg_tolerance: None,
            tikhonov: 0.0,
            phases: 1,
            positivity: true,
            roi_average: false,
            spatial_tv: false,
            wavelets: false,
            temporal_tv: false,
            temporal_l0: false,
            motion_compensation: false,
            warping: false,
            unwarp_refinements: 3,
        }
    }
}

impl RoosterConfig {
    /// Parse and validate. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ReconError::parameter(format!("invalid ROOSTER config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.outer_iterations == 0 {
            return Err(ReconError::parameter("outer_iterations must be at least 1"));
        }
        if self.cg_iterations == 0 {
            return Err(ReconError::parameter("cg_iterations must be at least 1"));
        }
        if self.phases == 0 {
            return Err(ReconError::parameter("phases must be at least 1"));
        }
        if !(self.tikhonov.is_finite() && self.tikhonov >= 0.0) {
            return Err(ReconError::parameter(format!(
                "tikhonov must be non-negative, got {}",
                self.tikhonov
            )));
        }
        if let Some(tol) = self.cg_tolerance {
            if !(tol.is_finite() && tol >= 0.0) {
                return Err(ReconError::parameter(format!(
                    "cg_tolerance must be non-negative, got {}",
                    tol
                )));
            }
        }
        Ok(())
    }

    fn stage_enabled(&self, kind: StageKind) -> bool {
        match kind {
            StageKind::Positivity => self.positivity,
            StageKind::RoiAverage => self.roi_average,
            StageKind::SpatialTv => self.spatial_tv,
            StageKind::Wavelets => self.wavelets,
            StageKind::TemporalTv => self.temporal_tv,
            StageKind::TemporalL0 => self.temporal_l0,
            StageKind::Warp | StageKind::Unwarp => self.warping,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoosterOutcome {
    pub volumes: VolumeSeries,
    /// CG residual norms, one history per outer iteration.
    pub cg_residuals: Vec<Vec<f64>>,
}

struct Motion {
    dvfs: Arc<DvfSet>,
    warper: Arc<dyn Warper>,
}

/// The ROOSTER reconstruction loop.
///
/// The projector pair is fixed by `new`; collaborators for the optional
/// stages are bound with the `with_*` methods before `run`.
pub struct Rooster {
    config: RoosterConfig,
    projections: ProjectionStack,
    geometry: Arc<Geometry>,
    weights: ndarray::Array2<f32>,
    forward: Arc<dyn ForwardProjector>,
    back: Arc<dyn BackProjector>,
    pipeline: RegularizationPipeline,
    motion: Option<Motion>,
}

impl fmt::Debug for Rooster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rooster")
            .field("config", &self.config)
            .field("projections", &self.projections.len())
            .field("pipeline", &self.pipeline)
            .field("motion", &self.motion.is_some())
            .finish()
    }
}

impl Rooster {
    pub fn new(
        config: RoosterConfig,
        projections: ProjectionStack,
        geometry: Geometry,
        signal: PhaseSignal,
        forward: Arc<dyn ForwardProjector>,
        back: Arc<dyn BackProjector>,
    ) -> Result<Self> {
        config.validate()?;
        if signal.len() != projections.len() {
            return Err(ReconError::mismatch(format!(
                "{} phase values for {} projections",
                signal.len(),
                projections.len()
            )));
        }
        if projections.len() > geometry.len() {
            return Err(ReconError::InvalidIndex {
                index: projections.len() - 1,
                len: geometry.len(),
            });
        }
        let weights = signal.interpolation_weights(config.phases)?;

        let mut pipeline = RegularizationPipeline::new();
        pipeline.bind(StageKind::Positivity, Box::new(Positivity));
        for kind in StageKind::ORDER {
            pipeline.set_enabled(kind, config.stage_enabled(kind));
        }

        Ok(Self {
            config,
            projections,
            geometry: Arc::new(geometry),
            weights,
            forward,
            back,
            pipeline,
            motion: None,
        })
    }

    pub fn config(&self) -> &RoosterConfig {
        &self.config
    }

    /// The projector pair is part of the operator definition.
    pub fn set_forward_projector(&mut self, _forward: Arc<dyn ForwardProjector>) -> Result<()> {
        Err(ReconError::ConfigurationLocked("forward projector"))
    }

    pub fn set_back_projector(&mut self, _back: Arc<dyn BackProjector>) -> Result<()> {
        Err(ReconError::ConfigurationLocked("back projector"))
    }

    pub fn with_roi_mask(mut self, mask: Volume) -> Result<Self> {
        self.pipeline
            .bind(StageKind::RoiAverage, Box::new(AverageOutOfRoi::new(mask)?));
        Ok(self)
    }

    /// Bind the displacement fields used by the motion-compensated solve and
    /// the warp stages around the temporal denoisers.
    pub fn with_motion(mut self, dvfs: DvfSet, warper: Arc<dyn Warper>) -> Self {
        let dvfs = Arc::new(dvfs);
        self.pipeline.bind(
            StageKind::Warp,
            Box::new(WarpSequence::new(dvfs.clone(), warper.clone())),
        );
        self.pipeline.bind(
            StageKind::Unwarp,
            Box::new(UnwarpSequence::new(
                dvfs.clone(),
                warper.clone(),
                self.config.unwarp_refinements,
            )),
        );
        self.motion = Some(Motion { dvfs, warper });
        self
    }

    pub fn with_spatial_tv(self, denoiser: Arc<dyn SequenceDenoiser>) -> Self {
        self.with_denoiser(StageKind::SpatialTv, "spatial-tv", denoiser)
    }

    pub fn with_wavelets(self, denoiser: Arc<dyn SequenceDenoiser>) -> Self {
        self.with_denoiser(StageKind::Wavelets, "wavelets", denoiser)
    }

    pub fn with_temporal_tv(self, denoiser: Arc<dyn SequenceDenoiser>) -> Self {
        self.with_denoiser(StageKind::TemporalTv, "temporal-tv", denoiser)
    }

    pub fn with_temporal_l0(self, denoiser: Arc<dyn SequenceDenoiser>) -> Self {
        self.with_denoiser(StageKind::TemporalL0, "temporal-l0", denoiser)
    }

    fn with_denoiser(
        mut self,
        kind: StageKind,
        name: &'static str,
        denoiser: Arc<dyn SequenceDenoiser>,
    ) -> Self {
        self.pipeline
            .bind(kind, Box::new(DenoiserStage::new(name, denoiser)));
        self
    }

    fn data_fidelity(&self, initial: &VolumeSeries) -> Result<Box<dyn DataFidelity>> {
        let grid = *initial.grid();
        let op = ProjectionOperator::new(
            self.geometry.clone(),
            grid,
            *self.projections.grid(),
            self.weights.clone(),
            self.forward.clone(),
            self.back.clone(),
        )?
        .with_tikhonov(self.config.tikhonov)?;

        if !self.config.motion_compensation {
            return Ok(Box::new(op));
        }
        let motion = self
            .motion
            .as_ref()
            .ok_or(ReconError::MissingInput("displacement fields"))?;
        Ok(Box::new(MotionCompensatedOperator::new(
            op,
            &grid,
            motion.dvfs.clone(),
            motion.warper.clone(),
        )?))
    }

    /// Run every outer iteration starting from `initial`.
    pub fn run(&self, initial: VolumeSeries) -> Result<RoosterOutcome> {
        if initial.n_phases() != self.config.phases {
            return Err(ReconError::mismatch(format!(
                "initial estimate has {} phases, configured for {}",
                initial.n_phases(),
                self.config.phases
            )));
        }
        self.pipeline
            .verify(initial.grid(), initial.n_phases())?;
        let op = self.data_fidelity(&initial)?;
        let b = op.right_hand_side(&self.projections)?;
        let cg = ConjugateGradient {
            iterations: self.config.cg_iterations,
            tolerance: self.config.cg_tolerance,
        };
        debug!(stages = ?self.pipeline.enabled().collect::<Vec<_>>(), "ROOSTER start");

        let mut x = initial;
        let mut cg_residuals = Vec::with_capacity(self.config.outer_iterations);
        for iteration in 0..self.config.outer_iterations {
            let solved = cg.solve(op.as_ref(), &b, x)?;
            info!(
                iteration,
                cg_iterations = solved.iterations_run,
                residual = solved.residual_norms.last().copied().unwrap_or(0.0),
                "ROOSTER outer iteration"
            );
            cg_residuals.push(solved.residual_norms);
            x = self.pipeline.apply(solved.solution)?;
        }

        Ok(RoosterOutcome {
            volumes: x,
            cg_residuals,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_and_json() {
        let config = RoosterConfig::from_json_str(r#"{"phases": 4, "temporal_tv": true}"#).unwrap();
        assert_eq!(config.phases, 4);
        assert!(config.temporal_tv);
        assert_eq!(config.cg_iterations, RoosterConfig::default().cg_iterations);
        assert!(config.positivity);
        assert!(!config.warping);
        assert_eq!(config.unwarp_refinements, 3);
    }

    #[test]
    fn test_config_validation() {
        for json in [
            r#"{"outer_iterations": 0}"#,
            r#"{"cg_iterations": 0}"#,
            r#"{"phases": 0}"#,
            r#"{"tikhonov": -1.0}"#,
            r#"{"phases": "three"}"#,
        ] {
            assert!(matches!(
                RoosterConfig::from_json_str(json),
                Err(ReconError::InvalidParameter(_))
            ));
        }
    }
}
