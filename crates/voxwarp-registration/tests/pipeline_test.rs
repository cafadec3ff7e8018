//! End-to-end pipeline tests with a stubbed affine collaborator.

use std::cell::Cell;

use nalgebra::Vector3;

use voxwarp_core::spatial::CoordinateFrame;
use voxwarp_core::transform::AffineMatrix;
use voxwarp_core::volume::Volume;
use voxwarp_registration::{
    compose, AffineMode, AffineOutcome, AffineRegistrar, AffineRequest, PatchSolver,
    PipelineConfig, PipelineController, PipelineError, PipelineInputs, WeightMode,
};

/// Smooth blob with the given center, positive well out from the center so
/// the padding planner sees content near the faces.
fn blob(dims: [usize; 3], center: [f64; 3]) -> Volume {
    Volume::from_fn(dims, CoordinateFrame::identity(), |x, y, z| {
        let dx = x as f64 - center[0];
        let dy = y as f64 - center[1];
        let dz = z as f64 - center[2];
        let r2 = dx * dx + dy * dy + dz * dz;
        (1000.0 * (-r2 / 260.0).exp()) as f32
    })
}

fn inputs(base: Volume, source: Volume) -> PipelineInputs {
    PipelineInputs {
        base,
        source,
        initial_warp: None,
        user_weight: None,
        exclusion_mask: None,
    }
}

/// Collaborator stub that counts invocations and can serve a canned result.
struct StubRegistrar {
    register_calls: Cell<usize>,
    resample_calls: Cell<usize>,
    result: Option<(Volume, AffineMatrix)>,
}

impl StubRegistrar {
    fn refusing() -> Self {
        Self {
            register_calls: Cell::new(0),
            resample_calls: Cell::new(0),
            result: None,
        }
    }

    fn serving(resampled: Volume, matrix: AffineMatrix) -> Self {
        Self {
            register_calls: Cell::new(0),
            resample_calls: Cell::new(0),
            result: Some((resampled, matrix)),
        }
    }
}

impl AffineRegistrar for StubRegistrar {
    fn register(&self, _request: &AffineRequest<'_>) -> voxwarp_registration::Result<AffineOutcome> {
        self.register_calls.set(self.register_calls.get() + 1);
        match &self.result {
            Some((vol, matrix)) => Ok(AffineOutcome {
                resampled_source: vol.clone(),
                matrix: Some(*matrix),
            }),
            None => Err(PipelineError::collaborator("stub refuses to register")),
        }
    }

    fn resample(&self, _request: &AffineRequest<'_>) -> voxwarp_registration::Result<AffineOutcome> {
        self.resample_calls.set(self.resample_calls.get() + 1);
        match &self.result {
            Some((vol, _)) => Ok(AffineOutcome {
                resampled_source: vol.clone(),
                matrix: None,
            }),
            None => Err(PipelineError::collaborator("stub refuses to resample")),
        }
    }
}

#[test]
fn integer_shift_recovered_end_to_end() {
    // Two identical 64-cubes differing by an integer voxel shift, binary
    // weight mode, padding enabled. Content sits off-center so margins are
    // actually planned.
    let dims = [64, 64, 64];
    let shift = [3.0, 2.0, 1.0];
    let center = [26.0, 32.0, 30.0];
    let base = blob(dims, center);
    let source = blob(
        dims,
        [center[0] + shift[0], center[1] + shift[1], center[2] + shift[2]],
    );

    let config = PipelineConfig::builder()
        .weight_mode(WeightMode::Binary)
        .min_patch(42)
        .write_inverse_warp(true)
        .build()
        .unwrap();
    let solver = PatchSolver::new();
    let outputs = PipelineController::new(&config, &solver)
        .run(inputs(base.clone(), source))
        .unwrap();

    // Outputs are back on the original grid.
    let image = outputs.warped_image.expect("warped image requested");
    assert_eq!(image.dims(), dims);
    assert_eq!(outputs.forward_warp.dims(), dims);

    // The forward warp at the volume center carries the shift.
    let d = outputs
        .forward_warp
        .displacement_at(center[0] as usize, center[1] as usize, center[2] as usize);
    assert!((d.x - shift[0]).abs() <= 0.75, "dx = {}", d.x);
    assert!((d.y - shift[1]).abs() <= 0.75, "dy = {}", d.y);
    assert!((d.z - shift[2]).abs() <= 0.75, "dz = {}", d.z);

    // The inverse warp at the shifted center maps back.
    let inv = outputs.inverse_warp.expect("inverse warp requested");
    let di = inv.displacement_at(
        (center[0] + shift[0]) as usize,
        (center[1] + shift[1]) as usize,
        (center[2] + shift[2]) as usize,
    );
    assert!((di.x + shift[0]).abs() <= 0.75, "inv dx = {}", di.x);
    assert!((di.y + shift[1]).abs() <= 0.75, "inv dy = {}", di.y);
    assert!((di.z + shift[2]).abs() <= 0.75, "inv dz = {}", di.z);

    // The warped image matches the base where the weight had support.
    let err = (image.value_at(26, 32, 30) - base.value_at(26, 32, 30)).abs();
    assert!(err < 100.0, "center mismatch {err}");
}

#[test]
fn resample_only_auto_disables_on_shared_grid() {
    // Same grid on both sides; the collaborator must not be invoked.
    let dims = [32, 32, 32];
    let base = blob(dims, [16.0, 16.0, 16.0]);
    let source = blob(dims, [18.0, 16.0, 16.0]);

    let config = PipelineConfig::builder()
        .resample_only(true)
        .min_patch(16)
        .build()
        .unwrap();
    let solver = PatchSolver::new();
    let registrar = StubRegistrar::refusing();
    let outputs = PipelineController::new(&config, &solver)
        .with_registrar(&registrar)
        .run(inputs(base, source))
        .unwrap();

    assert_eq!(registrar.register_calls.get(), 0);
    assert_eq!(registrar.resample_calls.get(), 0);
    assert!(outputs.affine_matrix.is_none());
}

#[test]
fn affine_prereg_composes_leading_translation() {
    // The stub pretends to align the source perfectly and reports a pure
    // translation; the composed warp must carry that translation.
    let dims = [32, 32, 32];
    let center = [16.0, 16.0, 16.0];
    let base = blob(dims, center);
    let original_source = blob(dims, [18.0, 16.0, 16.0]);
    let matrix = AffineMatrix::from_translation(Vector3::new(2.0, 0.0, 0.0));

    // The canned "aligned" source must not be bit-identical to the base, or
    // the load stage would reject the pair; scale it slightly (correlation
    // matching is scale-invariant).
    let mut aligned = base.clone();
    for v in aligned.data_mut().iter_mut() {
        *v *= 0.9;
    }

    let config = PipelineConfig::builder()
        .affine(AffineMode::Full)
        .min_patch(16)
        .build()
        .unwrap();
    let solver = PatchSolver::new();
    let registrar = StubRegistrar::serving(aligned, matrix);
    let outputs = PipelineController::new(&config, &solver)
        .with_registrar(&registrar)
        .run(inputs(base, original_source))
        .unwrap();

    assert_eq!(registrar.register_calls.get(), 1);
    assert!(outputs.affine_matrix.is_some());

    // Solved warp is near zero (stub aligned the volumes), so the composed
    // warp is the translation in index space.
    let d = outputs.forward_warp.displacement_at(16, 16, 16);
    assert!((d.x - 2.0).abs() <= 0.75, "dx = {}", d.x);
    assert!(d.y.abs() <= 0.75);
    assert!(d.z.abs() <= 0.75);
}

#[test]
fn collaborator_failure_is_fatal() {
    let dims = [24, 24, 24];
    let base = blob(dims, [12.0, 12.0, 12.0]);
    // Different grid so resampling is genuinely needed.
    let source =
        blob(dims, [13.0, 12.0, 12.0]).with_frame(CoordinateFrame::axis_aligned([2.0, 2.0, 2.0]));

    let config = PipelineConfig::builder().resample_only(true).build().unwrap();
    let solver = PatchSolver::new();
    let registrar = StubRegistrar::refusing();
    let err = PipelineController::new(&config, &solver)
        .with_registrar(&registrar)
        .run(inputs(base, source))
        .unwrap_err();
    assert!(matches!(err, PipelineError::Collaborator(_)));
    assert_eq!(registrar.resample_calls.get(), 1);
}

#[test]
fn identical_volumes_rejected_at_load() {
    let dims = [24, 24, 24];
    let base = blob(dims, [12.0, 12.0, 12.0]);
    let config = PipelineConfig::builder().build().unwrap();
    let solver = PatchSolver::new();
    let err = PipelineController::new(&config, &solver)
        .run(inputs(base.clone(), base))
        .unwrap_err();
    assert!(matches!(err, PipelineError::Input(_)));
}

#[test]
fn grid_mismatch_rejected_at_load() {
    let base = blob([24, 24, 24], [12.0, 12.0, 12.0]);
    let source = blob([20, 24, 24], [10.0, 12.0, 12.0]);
    let config = PipelineConfig::builder().build().unwrap();
    let solver = PatchSolver::new();
    let err = PipelineController::new(&config, &solver)
        .run(inputs(base, source))
        .unwrap_err();
    assert!(matches!(err, PipelineError::Input(_)));
}

#[test]
fn forbidden_pairs_fail_before_any_work() {
    // The documented forbidden option pairs surface as configuration errors
    // straight from the builder, before any volume is touched.
    let pairs: Vec<voxwarp_registration::Result<PipelineConfig>> = vec![
        PipelineConfig::builder()
            .affine(AffineMode::Full)
            .plusminus(true)
            .build(),
        PipelineConfig::builder()
            .affine(AffineMode::Full)
            .initial_warp(true)
            .build(),
        PipelineConfig::builder()
            .affine(AffineMode::Fast)
            .init_level(3)
            .build(),
        PipelineConfig::builder()
            .initial_warp(true)
            .duplo(true)
            .build(),
        PipelineConfig::builder().duplo(true).max_level(2).build(),
        PipelineConfig::builder().lock_axes(true, true, true).build(),
    ];
    for result in pairs {
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }
}

#[test]
fn plusminus_produces_symmetric_outputs() {
    let dims = [32, 32, 32];
    let base = blob(dims, [16.0, 16.0, 16.0]);
    let source = blob(dims, [20.0, 16.0, 16.0]);

    let config = PipelineConfig::builder()
        .plusminus(true)
        .min_patch(16)
        .build()
        .unwrap();
    let solver = PatchSolver::new();
    let outputs = PipelineController::new(&config, &solver)
        .run(inputs(base, source))
        .unwrap();

    let minus = outputs.minus.expect("symmetric mode yields a minus side");
    let p = outputs.forward_warp.displacement_at(16, 16, 16);
    let m = minus.warp.displacement_at(16, 16, 16);
    // Each side moves half the net warp, in opposite directions.
    assert!((p.x + m.x).abs() < 1e-4);
    assert!((p.x - 2.0).abs() <= 1.0, "px = {}", p.x);
}

#[test]
fn composed_then_inverted_shift_roundtrips() {
    // compose::invert is the documented failure path for fold-over; a clean
    // field inverts and composes back to identity.
    let mut warp = voxwarp_core::transform::WarpField::zeros([12, 12, 12]);
    for k in 0..12 {
        for j in 0..12 {
            for i in 0..12 {
                warp.set_displacement(i, j, k, [1.0, 0.0, -1.0]);
            }
        }
    }
    let inv = compose::invert(&warp).unwrap();
    let round = voxwarp_core::transform::WarpField::compose(&warp, &inv);
    assert!(round.displacement_at(6, 6, 6).norm() < 0.05);
}
