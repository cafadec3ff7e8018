//! Cross-module geometry tests: padding, frames and warp grids must stay
//! consistent through pad/crop cycles.

use nalgebra::{Point3, Vector3};

use voxwarp_core::interpolation::InterpKind;
use voxwarp_core::spatial::{conform_margins, CoordinateFrame};
use voxwarp_core::transform::WarpField;
use voxwarp_core::volume::{PaddingSpec, Volume};

fn ramp_volume(dims: [usize; 3]) -> Volume {
    let frame = CoordinateFrame::new(
        Point3::new(12.0, -4.0, 7.5),
        Vector3::new(0.5, 1.0, 2.0),
        nalgebra::Matrix3::identity(),
    );
    Volume::from_fn(dims, frame, |x, y, z| (x + 7 * y + 49 * z) as f32)
}

#[test]
fn pad_crop_restores_extent_and_values() {
    let vol = ramp_volume([10, 9, 8]);
    let spec = PaddingSpec::from_faces([3, 1, 0, 4, 2, 2]);
    let padded = vol.pad(&spec);
    assert_eq!(padded.dims(), [14, 13, 12]);

    let restored = padded.crop(&spec);
    assert_eq!(restored.dims(), vol.dims());
    assert!(restored.identical_to(&vol));
}

#[test]
fn padded_grid_conforms_to_original() {
    let vol = ramp_volume([10, 10, 10]);
    let spec = PaddingSpec::from_faces([2, 3, 1, 0, 4, 1]);
    let padded = vol.pad(&spec);

    let margins = conform_margins(
        (padded.frame(), padded.dims()),
        (vol.frame(), vol.dims()),
    )
    .unwrap();
    assert_eq!(margins, spec.faces());
}

#[test]
fn warp_crop_tracks_volume_crop() {
    // A warp padded alongside its volume maps the same world positions
    // after both are cropped.
    let vol = ramp_volume([8, 8, 8]);
    let spec = PaddingSpec::uniform(2);
    let padded = vol.pad(&spec);

    let mut warp = WarpField::zeros(padded.dims());
    for k in 0..12 {
        for j in 0..12 {
            for i in 0..12 {
                warp.set_displacement(i, j, k, [1.0, 0.0, 0.0]);
            }
        }
    }
    let warp = warp.adopt_frame(*padded.frame());
    let cropped = warp.crop(&spec);

    assert_eq!(cropped.dims(), vol.dims());
    let frame = cropped.frame().unwrap();
    assert!((frame.origin() - vol.frame().origin()).norm() < 1e-12);
}

#[test]
fn identity_warp_resamples_padded_volume_in_place() {
    let vol = ramp_volume([6, 6, 6]);
    let spec = PaddingSpec::uniform(3);
    let padded = vol.pad(&spec);

    // An identity warp on the padded grid pulls the original volume into
    // padded coordinates through world space.
    let warp = WarpField::zeros(padded.dims()).adopt_frame(*padded.frame());
    let rendered = warp.resample_source(&vol, InterpKind::Linear);

    for z in 0..6 {
        for y in 0..6 {
            for x in 0..6 {
                let got = rendered.value_at(x + 3, y + 3, z + 3);
                let want = vol.value_at(x, y, z);
                assert!((got - want).abs() < 1e-4, "({x},{y},{z}): {got} vs {want}");
            }
        }
    }
}
