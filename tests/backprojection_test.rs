mod common;

use cbct_recon::{
    BackProjectionFilter, BackProjectionPath, BackProjector, Geometry, ProjectionGrid,
    ProjectionRecord, ProjectionStack, ReconError, Volume, VolumeGrid, VoxelBackProjector,
};
use ndarray::Array3;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

use common::{circular_geometry, small_detector_grid, small_volume_grid};

fn random_array(shape: (usize, usize, usize), seed: u64) -> Array3<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array3::random_using(shape, Uniform::new(-0.5f32, 0.5), &mut rng)
}

/// One record of a circular scan, optionally with the detector axes swapped
/// so that y moves the detector column instead of the row.
fn record(angle_deg: f64, swap_axes: bool, offset: [f64; 2]) -> ProjectionRecord {
    let (sin, cos) = angle_deg.to_radians().sin_cos();
    let source = [common::SID * sin, 0.0, common::SID * cos];
    let towards = [-sin, 0.0, -cos];
    let along_gantry = [cos, 0.0, -sin];
    let axial = [0.0, 1.0, 0.0];
    let (u, v) = if swap_axes {
        (axial, along_gantry)
    } else {
        (along_gantry, axial)
    };
    let mut origin = [0.0; 3];
    for a in 0..3 {
        origin[a] = source[a] + towards[a] * common::SDD + u[a] * offset[0] + v[a] * offset[1];
    }
    ProjectionRecord {
        source,
        detector_origin: origin,
        detector_u: u,
        detector_v: v,
    }
}

fn backproject(
    projector: &VoxelBackProjector,
    start: &Array3<f32>,
    grid: VolumeGrid,
    stack: &ProjectionStack,
    geometry: &Geometry,
) -> Volume {
    let mut volume = Volume::from_array(grid, start.clone()).unwrap();
    let weights: Vec<f32> = (0..stack.len()).map(|n| 0.5 + n as f32).collect();
    projector
        .backproject_weighted(&mut volume, stack, geometry, &weights)
        .unwrap();
    volume
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn axis_paths_match_generic_path(
        angles in prop::collection::vec(0.0f64..360.0, 1..4),
        swap in prop::collection::vec(any::<bool>(), 4),
        offset_u in -3.0f64..3.0,
        offset_v in -3.0f64..3.0,
        seed in any::<u64>(),
        block_depth in 1usize..4,
    ) {
        let mut geometry = Geometry::new();
        // angle zero keeps the x-aligned kernels in every run
        geometry.add_projection(record(0.0, swap[0], [offset_u, offset_v])).unwrap();
        for (n, &angle) in angles.iter().enumerate() {
            geometry
                .add_projection(record(angle, swap[n + 1], [offset_u, offset_v]))
                .unwrap();
        }
        let vgrid = small_volume_grid();
        let pgrid = small_detector_grid();
        let [nu, nv] = pgrid.size;
        let stack = ProjectionStack::from_array(
            pgrid,
            random_array((geometry.len(), nv, nu), seed),
        )
        .unwrap();
        let start = random_array((3, 4, 5), seed ^ 0xabcdef);

        let fast = backproject(
            &VoxelBackProjector::new().with_block_depth(block_depth),
            &start,
            vgrid,
            &stack,
            &geometry,
        );
        let generic = backproject(
            &VoxelBackProjector::new().generic_only(),
            &start,
            vgrid,
            &stack,
            &geometry,
        );
        for (a, b) in fast.data().iter().zip(generic.data()) {
            prop_assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn zero_projections_leave_volume_unchanged(seed in any::<u64>(), angle in 0.0f64..360.0) {
        let geometry = circular_geometry(&[angle, angle + 90.0]);
        let vgrid = small_volume_grid();
        let start = random_array((3, 4, 5), seed);
        let stack = ProjectionStack::zeros(small_detector_grid(), 2);
        let out = backproject(&VoxelBackProjector::new(), &start, vgrid, &stack, &geometry);
        prop_assert_eq!(out.data(), &start);
    }
}

#[test]
fn kernels_selected_for_circular_and_swapped_detectors() {
    let mut geometry = Geometry::new();
    geometry.add_projection(record(0.0, false, [0.0; 2])).unwrap();
    geometry.add_projection(record(0.0, true, [0.0; 2])).unwrap();
    geometry.add_projection(record(40.0, true, [0.0; 2])).unwrap();
    let vgrid = small_volume_grid();
    let pgrid = small_detector_grid();
    let path = |n| BackProjectionPath::classify(&geometry.mapping_for(&vgrid, &pgrid, n).unwrap());
    assert_eq!(path(0), BackProjectionPath::AlongX { varying: 0 });
    assert_eq!(path(1), BackProjectionPath::AlongX { varying: 1 });
    assert_eq!(path(2), BackProjectionPath::AlongY { varying: 0 });
}

#[test]
fn point_source_peaks_at_expected_voxel() {
    let geometry = circular_geometry(&[0.0, 60.0, 120.0]);
    // voxel (2, 2, 2) sits on the isocentre
    let vgrid = VolumeGrid::new([4, 4, 4], [1.0; 3], [-2.0; 3]).unwrap();
    let pgrid = ProjectionGrid::centered([9, 9], [1.0; 2]).unwrap();
    let mut point = Volume::zeros(vgrid);
    point.data_mut()[[2, 2, 2]] = 1.0;
    let stack = common::simulate(&point, &geometry, pgrid);

    let out = BackProjectionFilter::new(&geometry)
        .set_input_volume(Volume::zeros(vgrid))
        .set_projections(&stack)
        .update()
        .unwrap();

    let (peak, value) = out
        .data()
        .indexed_iter()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(idx, v)| (idx, *v))
        .unwrap();
    let expected = (2usize, 2usize, 2usize);
    assert!(
        peak.0.abs_diff(expected.0) <= 1
            && peak.1.abs_diff(expected.1) <= 1
            && peak.2.abs_diff(expected.2) <= 1,
        "peak {:?}",
        peak
    );
    assert!((value - 3.0).abs() < 1e-5);
}

#[test]
fn cylindrical_point_source_peaks_at_isocentre() {
    let geometry = circular_geometry(&[0.0, 60.0, 120.0])
        .with_cylindrical_detector(common::SDD)
        .unwrap();
    let vgrid = VolumeGrid::centered([5, 5, 5], [1.0; 3]).unwrap();
    let pgrid = ProjectionGrid::centered([9, 9], [1.0; 2]).unwrap();
    let mut point = Volume::zeros(vgrid);
    point.data_mut()[[2, 2, 2]] = 1.0;
    let stack = common::simulate(&point, &geometry, pgrid);

    let out = BackProjectionFilter::new(&geometry)
        .set_input_volume(Volume::zeros(vgrid))
        .set_projections(&stack)
        .set_projector(VoxelBackProjector::new().with_block_depth(2))
        .update()
        .unwrap();

    let (peak, value) = out
        .data()
        .indexed_iter()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(idx, v)| (idx, *v))
        .unwrap();
    assert_eq!(peak, (2, 2, 2));
    assert!((value - 3.0).abs() < 1e-5, "peak value {}", value);
    // off the central rays the three views do not agree
    assert!(out.data()[[2, 2, 3]] < 1.5);
}

#[test]
fn selected_projection_out_of_range() {
    let geometry = circular_geometry(&[0.0, 90.0]);
    let stack = ProjectionStack::zeros(small_detector_grid(), 2);
    let result = BackProjectionFilter::new(&geometry)
        .set_input_volume(Volume::zeros(small_volume_grid()))
        .set_projections(&stack)
        .select_projections(vec![0, 2])
        .update();
    assert_eq!(result, Err(ReconError::InvalidIndex { index: 2, len: 2 }));
}

#[test]
fn scale_multiplies_every_contribution() {
    let geometry = circular_geometry(&[0.0, 45.0]);
    let stack = common::simulate(
        &common::blob(small_volume_grid()),
        &geometry,
        small_detector_grid(),
    );
    let run = |scale| {
        BackProjectionFilter::new(&geometry)
            .set_input_volume(Volume::zeros(small_volume_grid()))
            .set_projections(&stack)
            .set_scale(scale)
            .update()
            .unwrap()
    };
    let once = run(1.0);
    let twice = run(2.0);
    for (a, b) in once.data().iter().zip(twice.data()) {
        assert!((2.0 * a - b).abs() <= 1e-5 * b.abs().max(1.0));
    }
}
