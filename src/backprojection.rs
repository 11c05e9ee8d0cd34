//! Voxel-driven cone-beam back-projection.
//!
//! The centre of every voxel is projected into each detector image and the
//! bilinearly interpolated value is added to the voxel. The output volume is
//! split into disjoint z-slabs that rayon workers fill independently; the
//! projection stack and the detector mappings are shared read-only.
//!
//! Per projection one of four kernels runs:
//! - cylindrical detector: nonlinear arc mapping through the source frame,
//! - along X / along Y: the matrix column of that axis only moves one
//!   detector coordinate, so depth and the other coordinate are computed once
//!   per line instead of once per voxel,
//! - generic: full matrix-vector product per voxel.
//!
//! All four evaluate the matrix rows in the same order and accumulate
//! projections in index order, so the optimised kernels give bit-identical
//! volumes to the generic one.

use std::sync::Mutex;

use rayon::prelude::*;
use tracing::debug;

use crate::error::{ReconError, Result};
use crate::geometry::{
    CylindricalMapping, DetectorMapping, Geometry, MatrixCache, ProjectionMatrix, VoxelRegion,
};
use crate::projection::ProjectionStack;
use crate::volume::Volume;

/// Kernel chosen for one projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackProjectionPath {
    Cylindrical,
    /// Stepping along x moves only detector coordinate `varying` (0 = u, 1 = v).
    AlongX { varying: usize },
    /// Stepping along y moves only detector coordinate `varying`.
    AlongY { varying: usize },
    Generic,
}

impl BackProjectionPath {
    /// Pick the kernel for a mapping.
    pub fn classify(mapping: &DetectorMapping) -> Self {
        match mapping {
            DetectorMapping::Cylindrical(_) => Self::Cylindrical,
            DetectorMapping::Flat(m) => {
                if let Some(varying) = single_varying_row(m, 0) {
                    Self::AlongX { varying }
                } else if let Some(varying) = single_varying_row(m, 1) {
                    Self::AlongY { varying }
                } else {
                    Self::Generic
                }
            }
        }
    }
}

/// Detector row that alone depends on volume axis `axis`, if depth does not.
fn single_varying_row(m: &ProjectionMatrix, axis: usize) -> Option<usize> {
    let m = &m.0;
    if m[(2, axis)] != 0.0 {
        return None;
    }
    if m[(1, axis)] == 0.0 {
        Some(0)
    } else if m[(0, axis)] == 0.0 {
        Some(1)
    } else {
        None
    }
}

/// Back-projection operator contract used by the reconstruction operators.
pub trait BackProjector: Send + Sync {
    /// `volume += Σ_p weights[p] · BPₚ(projections[p])`.
    ///
    /// Projections with a zero weight are skipped.
    fn backproject_weighted(
        &self,
        volume: &mut Volume,
        projections: &ProjectionStack,
        geometry: &Geometry,
        weights: &[f32],
    ) -> Result<()>;
}

/// Voxel-based back-projector with bilinear detector interpolation.
#[derive(Debug, Default)]
pub struct VoxelBackProjector {
    /// Slab depth per parallel block; None picks one from the thread count.
    block_depth: Option<usize>,
    /// Restrict every call to one kernel (used to compare kernels).
    forced_path: Option<BackProjectionPath>,
    cache: Mutex<MatrixCache>,
}

impl VoxelBackProjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_block_depth(mut self, depth: usize) -> Self {
        self.block_depth = Some(depth.max(1));
        self
    }

    /// Force every flat projection through `BackProjectionPath::Generic`.
    pub fn generic_only(mut self) -> Self {
        self.forced_path = Some(BackProjectionPath::Generic);
        self
    }
}

impl BackProjector for VoxelBackProjector {
    fn backproject_weighted(
        &self,
        volume: &mut Volume,
        projections: &ProjectionStack,
        geometry: &Geometry,
        weights: &[f32],
    ) -> Result<()> {
        if weights.len() != projections.len() {
            return Err(ReconError::mismatch(format!(
                "{} weights for {} projections",
                weights.len(),
                projections.len()
            )));
        }
        if projections.len() > geometry.len() {
            return Err(ReconError::InvalidIndex {
                index: projections.len() - 1,
                len: geometry.len(),
            });
        }

        let mappings = {
            let mut cache = self
                .cache
                .lock()
                .map_err(|_| ReconError::parameter("projection matrix cache is poisoned"))?;
            cache
                .mappings(geometry, volume.grid(), projections.grid())?
                .to_vec()
        };

        let plans: Vec<Plan> = weights
            .iter()
            .enumerate()
            .filter(|(_, w)| **w != 0.0)
            .map(|(index, &weight)| {
                let mapping = mappings[index];
                let path = match (self.forced_path, mapping) {
                    (Some(forced), DetectorMapping::Flat(_)) => forced,
                    _ => BackProjectionPath::classify(&mapping),
                };
                Plan {
                    index,
                    weight: weight as f64,
                    mapping,
                    path,
                }
            })
            .collect();
        log_dispatch(&plans);

        backproject_plans(volume, projections, &plans, self.block_depth)
    }
}

/// One projection's share of a back-projection call.
#[derive(Debug, Clone, Copy)]
struct Plan {
    index: usize,
    weight: f64,
    mapping: DetectorMapping,
    path: BackProjectionPath,
}

fn log_dispatch(plans: &[Plan]) {
    let mut counts = [0usize; 4];
    for plan in plans {
        let slot = match plan.path {
            BackProjectionPath::Cylindrical => 0,
            BackProjectionPath::AlongX { .. } => 1,
            BackProjectionPath::AlongY { .. } => 2,
            BackProjectionPath::Generic => 3,
        };
        counts[slot] += 1;
    }
    debug!(
        "Back-projecting {} projections (cylindrical={}, along_x={}, along_y={}, generic={})",
        plans.len(),
        counts[0],
        counts[1],
        counts[2],
        counts[3]
    );
}

/// Volume dimensions in `[x, y, z]` order plus detector size.
#[derive(Debug, Clone, Copy)]
struct Extent {
    nx: usize,
    ny: usize,
    nu: usize,
    nv: usize,
}

fn backproject_plans(
    volume: &mut Volume,
    projections: &ProjectionStack,
    plans: &[Plan],
    block_depth: Option<usize>,
) -> Result<()> {
    let [nx, ny, nz] = volume.grid().size;
    let [nu, nv] = projections.grid().size;
    if plans.is_empty() || nx * ny * nz == 0 || nu * nv == 0 {
        return Ok(());
    }
    let images = projections
        .data()
        .as_slice()
        .ok_or_else(|| ReconError::parameter("projection buffer is not contiguous"))?;
    let extent = Extent { nx, ny, nu, nv };
    let depth = block_depth
        .unwrap_or_else(|| nz.div_ceil(rayon::current_num_threads() * 4))
        .max(1);

    volume
        .as_slice_mut()?
        .par_chunks_mut(nx * ny * depth)
        .enumerate()
        .for_each(|(block, slab)| {
            let k0 = block * depth;
            let region = VoxelRegion {
                start: [0, 0, k0],
                size: [nx, ny, slab.len() / (nx * ny)],
            };
            for plan in plans {
                let image = &images[plan.index * nu * nv..(plan.index + 1) * nu * nv];
                backproject_block(slab, &region, extent, image, plan);
            }
        });
    Ok(())
}

fn backproject_block(
    slab: &mut [f32],
    region: &VoxelRegion,
    extent: Extent,
    image: &[f32],
    plan: &Plan,
) {
    match plan.mapping {
        DetectorMapping::Flat(m) => {
            if footprint_misses(&m, region, extent) {
                return;
            }
            match plan.path {
                BackProjectionPath::AlongX { varying } => {
                    along_x(slab, region, extent, image, &m, varying, plan.weight)
                }
                BackProjectionPath::AlongY { varying } => {
                    along_y(slab, region, extent, image, &m, varying, plan.weight)
                }
                _ => generic(slab, region, extent, image, &m, plan.weight),
            }
        }
        DetectorMapping::Cylindrical(c) => {
            cylindrical(slab, region, extent, image, &c, plan.weight)
        }
    }
}

/// True when no voxel of `region` can land on the detector.
fn footprint_misses(m: &ProjectionMatrix, region: &VoxelRegion, e: Extent) -> bool {
    let Some(corners) = m.box_corners(region) else {
        return false;
    };
    let (mut lo, mut hi) = ([f64::INFINITY; 2], [f64::NEG_INFINITY; 2]);
    for c in corners {
        for a in 0..2 {
            lo[a] = lo[a].min(c[a]);
            hi[a] = hi[a].max(c[a]);
        }
    }
    hi[0] <= -1.0 || hi[1] <= -1.0 || lo[0] >= e.nu as f64 || lo[1] >= e.nv as f64
}

/// Bilinear interpolation with pixel centres at integer indices.
///
/// Neighbours outside the detector count as zero.
#[inline(always)]
pub(crate) fn bilinear(image: &[f32], nu: usize, nv: usize, cu: f64, cv: f64) -> f64 {
    if !(cu > -1.0 && cv > -1.0 && cu < nu as f64 && cv < nv as f64) {
        return 0.0;
    }
    let (fu, fv) = (cu.floor(), cv.floor());
    let (du, dv) = (cu - fu, cv - fv);
    let (iu, iv) = (fu as isize, fv as isize);
    let pixel = |u: isize, v: isize| -> f64 {
        if u >= 0 && v >= 0 && (u as usize) < nu && (v as usize) < nv {
            image[v as usize * nu + u as usize] as f64
        } else {
            0.0
        }
    };
    (1.0 - dv) * ((1.0 - du) * pixel(iu, iv) + du * pixel(iu + 1, iv))
        + dv * ((1.0 - du) * pixel(iu, iv + 1) + du * pixel(iu + 1, iv + 1))
}

#[inline(always)]
fn accumulate(voxel: &mut f32, weight: f64, value: f64) {
    *voxel += (weight * value) as f32;
}

#[inline(always)]
fn detector_coords(varying: usize, moving: f64, fixed: f64) -> (f64, f64) {
    if varying == 0 {
        (moving, fixed)
    } else {
        (fixed, moving)
    }
}

fn generic(
    slab: &mut [f32],
    region: &VoxelRegion,
    e: Extent,
    image: &[f32],
    m: &ProjectionMatrix,
    weight: f64,
) {
    for (dk, plane) in slab.chunks_mut(e.nx * e.ny).enumerate() {
        let k = (region.start[2] + dk) as f64;
        for (j, line) in plane.chunks_mut(e.nx).enumerate() {
            let j = j as f64;
            for (i, voxel) in line.iter_mut().enumerate() {
                let i = i as f64;
                let w = m.row_at(2, i, j, k);
                if !(w > 0.0) {
                    continue;
                }
                let cu = m.row_at(0, i, j, k) / w;
                let cv = m.row_at(1, i, j, k) / w;
                accumulate(voxel, weight, bilinear(image, e.nu, e.nv, cu, cv));
            }
        }
    }
}

fn along_x(
    slab: &mut [f32],
    region: &VoxelRegion,
    e: Extent,
    image: &[f32],
    m: &ProjectionMatrix,
    varying: usize,
    weight: f64,
) {
    let fixed = 1 - varying;
    let mm = &m.0;
    for (dk, plane) in slab.chunks_mut(e.nx * e.ny).enumerate() {
        let k = (region.start[2] + dk) as f64;
        for (j, line) in plane.chunks_mut(e.nx).enumerate() {
            let j = j as f64;
            let partial = |r: usize| (mm[(r, 3)] + mm[(r, 2)] * k) + mm[(r, 1)] * j;
            // column x is zero in these rows, so the x term has the same
            // value (and sign of zero) for every i >= 0
            let w = partial(2) + mm[(2, 0)] * 0.0;
            if !(w > 0.0) {
                continue;
            }
            let c_fixed = (partial(fixed) + mm[(fixed, 0)] * 0.0) / w;
            let base = partial(varying);
            let step = mm[(varying, 0)];
            for (i, voxel) in line.iter_mut().enumerate() {
                let c_moving = (base + step * i as f64) / w;
                let (cu, cv) = detector_coords(varying, c_moving, c_fixed);
                accumulate(voxel, weight, bilinear(image, e.nu, e.nv, cu, cv));
            }
        }
    }
}

fn along_y(
    slab: &mut [f32],
    region: &VoxelRegion,
    e: Extent,
    image: &[f32],
    m: &ProjectionMatrix,
    varying: usize,
    weight: f64,
) {
    let fixed = 1 - varying;
    let mm = &m.0;
    let mut depth = vec![0.0f64; e.nx];
    let mut c_fixed = vec![0.0f64; e.nx];
    for (dk, plane) in slab.chunks_mut(e.nx * e.ny).enumerate() {
        let k = (region.start[2] + dk) as f64;
        // depth and the fixed coordinate do not depend on j: one pass per plane
        for i in 0..e.nx {
            let row = |r: usize| {
                ((mm[(r, 3)] + mm[(r, 2)] * k) + mm[(r, 1)] * 0.0) + mm[(r, 0)] * i as f64
            };
            depth[i] = row(2);
            c_fixed[i] = row(fixed) / depth[i];
        }
        for (j, line) in plane.chunks_mut(e.nx).enumerate() {
            let j = j as f64;
            let base = (mm[(varying, 3)] + mm[(varying, 2)] * k) + mm[(varying, 1)] * j;
            let step = mm[(varying, 0)];
            for (i, voxel) in line.iter_mut().enumerate() {
                let w = depth[i];
                if !(w > 0.0) {
                    continue;
                }
                let c_moving = (base + step * i as f64) / w;
                let (cu, cv) = detector_coords(varying, c_moving, c_fixed[i]);
                accumulate(voxel, weight, bilinear(image, e.nu, e.nv, cu, cv));
            }
        }
    }
}

fn cylindrical(
    slab: &mut [f32],
    region: &VoxelRegion,
    e: Extent,
    image: &[f32],
    c: &CylindricalMapping,
    weight: f64,
) {
    for (dk, plane) in slab.chunks_mut(e.nx * e.ny).enumerate() {
        let k = (region.start[2] + dk) as f64;
        for (j, line) in plane.chunks_mut(e.nx).enumerate() {
            for (i, voxel) in line.iter_mut().enumerate() {
                if let Some([cu, cv]) = c.project(i as f64, j as f64, k) {
                    accumulate(voxel, weight, bilinear(image, e.nu, e.nv, cu, cv));
                }
            }
        }
    }
}

/// Back-projection of a whole projection stack into a volume.
///
/// Both inputs must be bound before `update`; they are never required to
/// share a physical frame. The volume is taken by value, accumulated into and
/// handed back.
pub struct BackProjectionFilter<'a> {
    geometry: &'a Geometry,
    volume: Option<Volume>,
    projections: Option<&'a ProjectionStack>,
    indices: Option<Vec<usize>>,
    scale: f32,
    projector: VoxelBackProjector,
}

impl<'a> BackProjectionFilter<'a> {
    pub fn new(geometry: &'a Geometry) -> Self {
        Self {
            geometry,
            volume: None,
            projections: None,
            indices: None,
            scale: 1.0,
            projector: VoxelBackProjector::new(),
        }
    }

    /// Volume to accumulate into (pre-zeroed or pre-populated by the caller).
    pub fn set_input_volume(mut self, volume: Volume) -> Self {
        self.volume = Some(volume);
        self
    }

    pub fn set_projections(mut self, projections: &'a ProjectionStack) -> Self {
        self.projections = Some(projections);
        self
    }

    /// Back-project only the listed projection indices.
    pub fn select_projections(mut self, indices: Vec<usize>) -> Self {
        self.indices = Some(indices);
        self
    }

    /// Constant multiplying every back-projected value.
    pub fn set_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    pub fn set_projector(mut self, projector: VoxelBackProjector) -> Self {
        self.projector = projector;
        self
    }

    /// Checks that inputs are correctly set.
    pub fn verify_preconditions(&self) -> Result<()> {
        let bound = usize::from(self.volume.is_some()) + usize::from(self.projections.is_some());
        if bound != 2 {
            return Err(ReconError::MissingInput(if self.volume.is_none() {
                "input volume"
            } else {
                "projection stack"
            }));
        }
        Ok(())
    }

    pub fn update(self) -> Result<Volume> {
        self.verify_preconditions()?;
        let (Some(mut volume), Some(projections)) = (self.volume, self.projections) else {
            return Err(ReconError::MissingInput("input volume"));
        };

        let weights = match &self.indices {
            None => vec![self.scale; projections.len()],
            Some(indices) => {
                let mut weights = vec![0.0; projections.len()];
                for &index in indices {
                    ReconError::check_index(index, self.geometry.len())?;
                    ReconError::check_index(index, projections.len())?;
                    weights[index] = self.scale;
                }
                weights
            }
        };
        self.projector
            .backproject_weighted(&mut volume, projections, self.geometry, &weights)?;
        Ok(volume)
    }
}
