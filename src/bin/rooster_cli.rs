use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;
use ndarray::Array3;
use ndarray_npy::{write_npy, NpzReader};
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cbct_recon::{
    Geometry, PhaseSignal, ProjectionGrid, ProjectionStack, Rooster, RoosterConfig,
    SplatForwardProjector, Volume, VolumeGrid, VolumeSeries, VoxelBackProjector,
};

/// 4D ROOSTER cone-beam reconstruction.
///
/// Expected NPZ file structure:
///   - key "projections": 3D array (projections, rows, columns) of f32
///   - key "roi_mask" (optional): 3D array (z, y, x) of f32 in [0, 1],
///     covering the reconstruction extent at any resolution
///
/// The geometry JSON holds the reconstruction grid, the detector pixel
/// spacing and either explicit projection records or a circular scan.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to NPZ file containing projections (and optionally roi_mask)
    #[arg(long)]
    projections: PathBuf,

    /// Path to scan geometry JSON
    #[arg(long)]
    geometry: PathBuf,

    /// Path to phase signal CSV, one value in [0, 1) per projection
    #[arg(long)]
    phases: PathBuf,

    /// Optional ROOSTER config JSON; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of reconstructed phases
    #[arg(long)]
    phases_count: Option<usize>,

    /// Number of outer ROOSTER iterations
    #[arg(long)]
    outer_iters: Option<usize>,

    /// Number of CG iterations per outer iteration
    #[arg(long)]
    cg_iters: Option<usize>,

    /// Output path for the reconstructed 4D series (.npy, phase-major)
    #[arg(long)]
    output: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ScanFile {
    volume_size: [usize; 3],
    volume_spacing: [f64; 3],
    detector_spacing: [f64; 2],
    #[serde(default)]
    geometry: Option<serde_json::Value>,
    #[serde(default)]
    circular: Option<CircularScan>,
}

#[derive(Debug, Deserialize)]
struct CircularScan {
    sid: f64,
    sdd: f64,
    angles_deg: Vec<f64>,
    #[serde(default)]
    offset_u: f64,
    #[serde(default)]
    offset_v: f64,
}

impl ScanFile {
    fn geometry(&self) -> Result<Geometry> {
        match (&self.geometry, &self.circular) {
            (Some(records), None) => Geometry::from_json_str(&records.to_string())
                .map_err(|e| anyhow!("Invalid projection records: {}", e)),
            (None, Some(scan)) => {
                let mut geometry = Geometry::new();
                for &angle in &scan.angles_deg {
                    geometry
                        .add_circular_projection(
                            scan.sid,
                            scan.sdd,
                            angle,
                            scan.offset_u,
                            scan.offset_v,
                        )
                        .map_err(|e| anyhow!("Invalid circular scan at {} deg: {}", angle, e))?;
                }
                Ok(geometry)
            }
            _ => Err(anyhow!(
                "Geometry JSON needs exactly one of 'geometry' or 'circular'"
            )),
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    // --- Load projections (+ optional ROI mask) from NPZ ---
    let file = File::open(&args.projections)
        .map_err(|e| anyhow!("Failed to open NPZ {:?}: {}", args.projections, e))?;
    let mut npz = NpzReader::new(file)
        .map_err(|e| anyhow!("Failed to read NPZ {:?}: {}", args.projections, e))?;
    let names = npz
        .names()
        .map_err(|e| anyhow!("Failed to list NPZ {:?}: {}", args.projections, e))?;

    let raw: Array3<f32> = npz
        .by_name("projections")
        .map_err(|e| anyhow!("Missing or invalid 'projections' array in NPZ: {}", e))?;
    let has_mask = names
        .iter()
        .any(|n| n.trim_end_matches(".npy") == "roi_mask");
    let roi_mask: Option<Array3<f32>> = if has_mask {
        Some(
            npz.by_name("roi_mask")
                .map_err(|e| anyhow!("Invalid 'roi_mask' array in NPZ: {}", e))?,
        )
    } else {
        None
    };

    // --- Geometry and grids ---
    let scan_text = fs::read_to_string(&args.geometry)
        .map_err(|e| anyhow!("Failed to read geometry JSON {:?}: {}", args.geometry, e))?;
    let scan: ScanFile = serde_json::from_str(&scan_text)
        .map_err(|e| anyhow!("Failed to parse geometry JSON {:?}: {}", args.geometry, e))?;
    let geometry = scan.geometry()?;
    let volume_grid = VolumeGrid::centered(scan.volume_size, scan.volume_spacing)?;
    let (_, rows, cols) = raw.dim();
    let detector_grid = ProjectionGrid::centered([cols, rows], scan.detector_spacing)?;
    let projections = ProjectionStack::from_array(detector_grid, raw)?;

    // --- Phase signal and config ---
    let phase_text = fs::read_to_string(&args.phases)
        .map_err(|e| anyhow!("Failed to read phase file {:?}: {}", args.phases, e))?;
    let signal = PhaseSignal::parse_csv(&phase_text)?;

    let mut config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .map_err(|e| anyhow!("Failed to read config {:?}: {}", path, e))?;
            RoosterConfig::from_json_str(&text)?
        }
        None => RoosterConfig::default(),
    };
    if let Some(n) = args.phases_count {
        config.phases = n;
    }
    if let Some(n) = args.outer_iters {
        config.outer_iterations = n;
    }
    if let Some(n) = args.cg_iters {
        config.cg_iterations = n;
    }
    config.roi_average = config.roi_average || roi_mask.is_some();

    info!(
        projections = projections.len(),
        volume = ?volume_grid.size,
        phases = config.phases,
        outer_iterations = config.outer_iterations,
        cg_iterations = config.cg_iterations,
        "Running ROOSTER"
    );

    let n_phases = config.phases;
    let mut rooster = Rooster::new(
        config,
        projections,
        geometry,
        signal,
        Arc::new(SplatForwardProjector),
        Arc::new(VoxelBackProjector::new()),
    )?;
    if let Some(mask) = roi_mask {
        // a mask of any shape spans the reconstruction extent and is resampled onto it
        let (mz, my, mx) = mask.dim();
        let mask_size = [mx, my, mz];
        let mut mask_spacing = [0.0; 3];
        for a in 0..3 {
            mask_spacing[a] = scan.volume_spacing[a] * scan.volume_size[a] as f64
                / mask_size[a].max(1) as f64;
        }
        let mask_grid = if mask_size == volume_grid.size {
            volume_grid
        } else {
            VolumeGrid::centered(mask_size, mask_spacing)?
        };
        rooster = rooster.with_roi_mask(Volume::from_array(mask_grid, mask)?)?;
    }

    // --- Run reconstruction ---
    let outcome = rooster.run(VolumeSeries::zeros(volume_grid, n_phases))?;

    // --- Save series as .npy ---
    write_npy(&args.output, outcome.volumes.data())
        .map_err(|e| anyhow!("Failed to write output NPY {:?}: {}", args.output, e))?;

    info!(output = ?args.output, "Reconstruction written");

    Ok(())
}
