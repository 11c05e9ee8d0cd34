//! Cone-beam acquisition geometry.
//!
//! Each projection index owns one record: a point source and a detector
//! plane spanned by two orthonormal directions anchored at the detector
//! origin. Detector-plane coordinates `(a, b)` of a physical point are
//! measured from that origin along `u` and `v`, after intersecting the ray
//! from the source through the point with the detector.
//!
//! Every matrix derived here is a pure function of one record and the
//! sampling grids; `MatrixCache` avoids rebuilding them while none of those
//! inputs change.

use nalgebra::{Matrix3, Matrix3x4, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{ReconError, Result};
use crate::grid::{ProjectionGrid, VolumeGrid};

/// Acquisition parameters of one projection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProjectionRecord {
    pub source: [f64; 3],
    pub detector_origin: [f64; 3],
    /// Physical direction of increasing detector column index.
    pub detector_u: [f64; 3],
    /// Physical direction of increasing detector row index.
    pub detector_v: [f64; 3],
}

impl ProjectionRecord {
    fn source(&self) -> Vector3<f64> {
        Vector3::from(self.source)
    }

    fn origin(&self) -> Vector3<f64> {
        Vector3::from(self.detector_origin)
    }

    fn u(&self) -> Vector3<f64> {
        Vector3::from(self.detector_u)
    }

    fn v(&self) -> Vector3<f64> {
        Vector3::from(self.detector_v)
    }

    /// Detector normal oriented from the source towards the detector.
    fn normal(&self) -> Vector3<f64> {
        let n = self.u().cross(&self.v());
        if n.dot(&(self.origin() - self.source())) < 0.0 {
            -n
        } else {
            n
        }
    }

    /// Normalise the detector directions and reject degenerate detectors.
    fn normalized(mut self) -> Result<Self> {
        let finite = self
            .source
            .iter()
            .chain(&self.detector_origin)
            .chain(&self.detector_u)
            .chain(&self.detector_v)
            .all(|c| c.is_finite());
        if !finite {
            return Err(ReconError::parameter("projection record has non-finite values"));
        }
        let u = self.u();
        let v = self.v();
        if u.norm() < 1e-12 || v.norm() < 1e-12 {
            return Err(ReconError::parameter("detector direction has zero length"));
        }
        // unit vectors pass through untouched so re-validation is idempotent
        let unit = |d: Vector3<f64>| if (d.norm() - 1.0).abs() > 1e-12 { d.normalize() } else { d };
        let (u, v) = (unit(u), unit(v));
        if u.dot(&v).abs() > 1e-6 {
            return Err(ReconError::parameter("detector directions are not orthogonal"));
        }
        self.detector_u = u.into();
        self.detector_v = v.into();
        if self.normal().dot(&(self.origin() - self.source())).abs() < 1e-12 {
            return Err(ReconError::parameter("detector plane contains the source"));
        }
        Ok(self)
    }
}

/// Shape of the detector surface, shared by every projection of a geometry.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum DetectorShape {
    #[default]
    Flat,
    /// Cylinder of the given radius whose axis passes through the source
    /// along the detector `v` direction.
    CylindricalCenteredOnSource { radius: f64 },
}

/// Index-to-index projection matrix: homogeneous voxel index `[i, j, k, 1]`
/// to homogeneous detector index `[cu·w, cv·w, w]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectionMatrix(pub Matrix3x4<f64>);

impl ProjectionMatrix {
    /// Numerator of row `r` at voxel `[i, j, k]`, summed slowest axis first.
    ///
    /// Every back-projection path evaluates rows in exactly this order.
    #[inline(always)]
    pub fn row_at(&self, r: usize, i: f64, j: f64, k: f64) -> f64 {
        let m = &self.0;
        ((m[(r, 3)] + m[(r, 2)] * k) + m[(r, 1)] * j) + m[(r, 0)] * i
    }

    /// Continuous detector index of voxel `[i, j, k]`, None behind the source.
    pub fn project(&self, index: [f64; 3]) -> Option<[f64; 2]> {
        let [i, j, k] = index;
        let w = self.row_at(2, i, j, k);
        if !(w > 0.0) {
            return None;
        }
        Some([self.row_at(0, i, j, k) / w, self.row_at(1, i, j, k) / w])
    }

    /// Projected corner voxels of `region`, None if empty or partly behind the source.
    pub fn box_corners(&self, region: &VoxelRegion) -> Option<[[f64; 2]; 8]> {
        if region.is_empty() {
            return None;
        }
        let lo = region.start.map(|s| s as f64);
        let hi = [0, 1, 2].map(|a| (region.start[a] + region.size[a] - 1) as f64);
        let mut corners = [[0.0; 2]; 8];
        for (c, corner) in corners.iter_mut().enumerate() {
            *corner = self.project([
                if c & 1 == 0 { lo[0] } else { hi[0] },
                if c & 2 == 0 { lo[1] } else { hi[1] },
                if c & 4 == 0 { lo[2] } else { hi[2] },
            ])?;
        }
        Some(corners)
    }
}

/// Maps needed to back-project through a cylindrical detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CylindricalMapping {
    /// Voxel index to source-centred frame `[x·u, y·v, depth]`.
    pub volume_index_to_source_frame: Matrix3x4<f64>,
    /// Homogeneous 2D detector-surface coordinate to pixel index.
    pub projection_physical_to_index: Matrix3<f64>,
    pub radius: f64,
    /// Surface coordinate of the detector origin, subtracted from every point.
    pub origin_offset: [f64; 2],
}

impl CylindricalMapping {
    /// Continuous detector index of voxel `[i, j, k]`, None behind the source.
    #[inline(always)]
    pub fn project(&self, i: f64, j: f64, k: f64) -> Option<[f64; 2]> {
        let m = &self.volume_index_to_source_frame;
        let row = |r: usize| ((m[(r, 3)] + m[(r, 2)] * k) + m[(r, 1)] * j) + m[(r, 0)] * i;
        let (x, y, z) = (row(0), row(1), row(2));
        if !(z > 0.0) {
            return None;
        }
        let a = self.radius * x.atan2(z) - self.origin_offset[0];
        let b = self.radius * y / x.hypot(z) - self.origin_offset[1];
        let p = &self.projection_physical_to_index;
        Some([
            p[(0, 0)] * a + p[(0, 1)] * b + p[(0, 2)],
            p[(1, 0)] * a + p[(1, 1)] * b + p[(1, 2)],
        ])
    }
}

/// Per-projection mapping, tagged by detector shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DetectorMapping {
    Flat(ProjectionMatrix),
    Cylindrical(CylindricalMapping),
}

/// Voxel region `[start, start + size)` in `[x, y, z]` index order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoxelRegion {
    pub start: [usize; 3],
    pub size: [usize; 3],
}

impl VoxelRegion {
    pub fn whole(grid: &VolumeGrid) -> Self {
        Self {
            start: [0; 3],
            size: grid.size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size.iter().any(|&s| s == 0)
    }
}

/// Ordered projection records plus the detector shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    records: Vec<ProjectionRecord>,
    #[serde(default)]
    detector_shape: DetectorShape,
}

impl Geometry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from records, validating each one.
    pub fn from_records(records: Vec<ProjectionRecord>) -> Result<Self> {
        let mut geometry = Self::new();
        for record in records {
            geometry.add_projection(record)?;
        }
        Ok(geometry)
    }

    /// Parse and validate a geometry serialised as JSON.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let raw: Geometry = serde_json::from_str(json)
            .map_err(|e| ReconError::parameter(format!("geometry JSON: {}", e)))?;
        let geometry = Self::from_records(raw.records)?;
        match raw.detector_shape {
            DetectorShape::Flat => Ok(geometry),
            DetectorShape::CylindricalCenteredOnSource { radius } => {
                geometry.with_cylindrical_detector(radius)
            }
        }
    }

    /// Use a cylindrical detector centred on the source for every projection.
    pub fn with_cylindrical_detector(mut self, radius: f64) -> Result<Self> {
        if !(radius > 0.0) || !radius.is_finite() {
            return Err(ReconError::parameter(format!(
                "cylindrical detector radius must be positive, got {}",
                radius
            )));
        }
        self.detector_shape = DetectorShape::CylindricalCenteredOnSource { radius };
        Ok(self)
    }

    pub fn add_projection(&mut self, record: ProjectionRecord) -> Result<()> {
        self.records.push(record.normalized()?);
        Ok(())
    }

    /// Append a projection of a circular trajectory around the Y axis.
    ///
    /// At angle zero the source sits at `(0, 0, sid)` and the detector centre
    /// at `(0, 0, sid - sdd)`, with `u` along +X and `v` along +Y. The
    /// offsets move the detector origin along `u` and `v`.
    pub fn add_circular_projection(
        &mut self,
        sid: f64,
        sdd: f64,
        gantry_angle_deg: f64,
        offset_u: f64,
        offset_v: f64,
    ) -> Result<()> {
        if !(sdd > 0.0) || !(sid > 0.0) {
            return Err(ReconError::parameter(format!(
                "source distances must be positive (sid={}, sdd={})",
                sid, sdd
            )));
        }
        let (sin, cos) = gantry_angle_deg.to_radians().sin_cos();
        let source = Vector3::new(sid * sin, 0.0, sid * cos);
        let towards_detector = Vector3::new(-sin, 0.0, -cos);
        let u = Vector3::new(cos, 0.0, -sin);
        let v = Vector3::new(0.0, 1.0, 0.0);
        let origin = source + towards_detector * sdd + u * offset_u + v * offset_v;
        self.add_projection(ProjectionRecord {
            source: source.into(),
            detector_origin: origin.into(),
            detector_u: u.into(),
            detector_v: v.into(),
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn detector_shape(&self) -> DetectorShape {
        self.detector_shape
    }

    pub fn record(&self, index: usize) -> Result<&ProjectionRecord> {
        ReconError::check_index(index, self.records.len())?;
        Ok(&self.records[index])
    }

    /// Physical point to homogeneous detector-plane coordinate `[a·w, b·w, w]`.
    ///
    /// `w` is the distance of the point from the source along the detector
    /// normal, so it is positive exactly for points in front of the source.
    pub fn physical_projection_matrix(&self, index: usize) -> Result<Matrix3x4<f64>> {
        let record = self.record(index)?;
        let s = record.source();
        let o = record.origin();
        let n = record.normal();
        let source_to_detector = n.dot(&(o - s));
        let rows = [
            n * record.u().dot(&(s - o)) + record.u() * source_to_detector,
            n * record.v().dot(&(s - o)) + record.v() * source_to_detector,
            n,
        ];
        let mut m = Matrix3x4::zeros();
        for (r, row) in rows.iter().enumerate() {
            for c in 0..3 {
                m[(r, c)] = row[c];
            }
            m[(r, 3)] = -row.dot(&s);
        }
        Ok(m)
    }

    /// Index-to-index matrix for a flat detector plane.
    pub fn matrix_for(
        &self,
        volume_grid: &VolumeGrid,
        projection_grid: &ProjectionGrid,
        index: usize,
    ) -> Result<ProjectionMatrix> {
        let physical = self.physical_projection_matrix(index)?;
        let to_index = projection_grid.physical_to_index()?;
        Ok(ProjectionMatrix(
            to_index * physical * volume_grid.index_to_physical(),
        ))
    }

    /// Voxel index to the source-centred frame `[u·(X-S), v·(X-S), n·(X-S)]`.
    pub fn volume_index_to_projection_physical(
        &self,
        volume_grid: &VolumeGrid,
        index: usize,
    ) -> Result<Matrix3x4<f64>> {
        let record = self.record(index)?;
        let s = record.source();
        let axes = [record.u(), record.v(), record.normal()];
        let mut m = Matrix3x4::zeros();
        for (r, axis) in axes.iter().enumerate() {
            for c in 0..3 {
                m[(r, c)] = axis[c];
            }
            m[(r, 3)] = -axis.dot(&s);
        }
        Ok(m * volume_grid.index_to_physical())
    }

    /// Mapping used by back-projection, chosen by the detector shape.
    pub fn mapping_for(
        &self,
        volume_grid: &VolumeGrid,
        projection_grid: &ProjectionGrid,
        index: usize,
    ) -> Result<DetectorMapping> {
        match self.detector_shape {
            DetectorShape::Flat => Ok(DetectorMapping::Flat(self.matrix_for(
                volume_grid,
                projection_grid,
                index,
            )?)),
            DetectorShape::CylindricalCenteredOnSource { radius } => {
                let record = self.record(index)?;
                let o = record.origin() - record.source();
                let (x, y, z) = (
                    record.u().dot(&o),
                    record.v().dot(&o),
                    record.normal().dot(&o),
                );
                Ok(DetectorMapping::Cylindrical(CylindricalMapping {
                    volume_index_to_source_frame: self
                        .volume_index_to_projection_physical(volume_grid, index)?,
                    projection_physical_to_index: projection_grid.physical_to_index()?,
                    radius,
                    origin_offset: [radius * x.atan2(z), radius * y / x.hypot(z)],
                }))
            }
        }
    }

    /// Detector indices of the eight corner voxels of `region`.
    ///
    /// Returns None when a corner lies behind the source, since the corners
    /// then no longer bound the projected footprint.
    pub fn physical_to_index_box_corners(
        &self,
        volume_grid: &VolumeGrid,
        projection_grid: &ProjectionGrid,
        index: usize,
        region: &VoxelRegion,
    ) -> Result<Option<[[f64; 2]; 8]>> {
        Ok(self
            .matrix_for(volume_grid, projection_grid, index)?
            .box_corners(region))
    }
}

/// Detector mappings for every projection, rebuilt only when the geometry or
/// either sampling grid changes.
#[derive(Debug, Default)]
pub struct MatrixCache {
    key: Option<(Geometry, VolumeGrid, ProjectionGrid)>,
    mappings: Vec<DetectorMapping>,
}

impl MatrixCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mappings(
        &mut self,
        geometry: &Geometry,
        volume_grid: &VolumeGrid,
        projection_grid: &ProjectionGrid,
    ) -> Result<&[DetectorMapping]> {
        let fresh = matches!(
            &self.key,
            Some((g, v, p)) if g == geometry && v == volume_grid && p == projection_grid
        );
        if !fresh {
            self.mappings = (0..geometry.len())
                .map(|i| geometry.mapping_for(volume_grid, projection_grid, i))
                .collect::<Result<_>>()?;
            self.key = Some((geometry.clone(), *volume_grid, *projection_grid));
        }
        Ok(&self.mappings)
    }
}
