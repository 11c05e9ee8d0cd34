//! Cone-beam CT reconstruction: geometry, voxel back-projection, and the
//! 4D ROOSTER iterative reconstruction loop.

pub mod backprojection;
pub mod cg;
pub mod error;
pub mod forward;
pub mod geometry;
pub mod grid;
pub mod operator;
pub mod projection;
pub mod regularization;
pub mod rooster;
pub mod signal;
pub mod volume;
pub mod warp;

pub use backprojection::{BackProjectionFilter, BackProjectionPath, BackProjector, VoxelBackProjector};
pub use cg::{CgOutcome, ConjugateGradient};
pub use error::{ReconError, Result};
pub use forward::{ForwardProjector, SplatForwardProjector};
pub use geometry::{DetectorShape, Geometry, ProjectionMatrix, ProjectionRecord};
pub use grid::{ProjectionGrid, VolumeGrid};
pub use operator::{DataFidelity, LinearOperator, MotionCompensatedOperator, ProjectionOperator};
pub use projection::ProjectionStack;
pub use regularization::{RegularizationStage, SequenceDenoiser};
pub use rooster::{Rooster, RoosterConfig, RoosterOutcome};
pub use signal::PhaseSignal;
pub use volume::{Volume, VolumeSeries};
pub use warp::{DisplacementField, DvfSet, TrilinearWarper, Warper};
