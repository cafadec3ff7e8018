//! NIfTI reading and writing for volumes and warp fields.
//!
//! Files are `[X, Y, Z]` on disk; in memory voxwarp stores `[Z, Y, X]`.
//! Warp fields travel as 4-D images with the displacement component on the
//! last axis.

use std::path::Path;

use anyhow::{bail, Context, Result};
use nalgebra::{Matrix3, Point3, Vector3};
use ndarray::{Array3, Array4, ArrayD, Axis};
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};

use voxwarp_core::spatial::CoordinateFrame;
use voxwarp_core::transform::WarpField;
use voxwarp_core::volume::Volume;

/// Coordinate frame from a NIfTI header: sform when present, then qform,
/// then plain pixdim scaling.
fn frame_from_header(header: &NiftiHeader) -> CoordinateFrame {
    let affine = if header.sform_code > 0 {
        [
            header.srow_x,
            header.srow_y,
            header.srow_z,
            [0.0, 0.0, 0.0, 1.0],
        ]
    } else if header.qform_code > 0 {
        let b = header.quatern_b as f64;
        let c = header.quatern_c as f64;
        let d = header.quatern_d as f64;
        let a = (1.0 - (b * b + c * c + d * d).min(1.0)).sqrt();
        let qfac = if header.pixdim[0] == 0.0 { 1.0 } else { header.pixdim[0] as f64 };

        let r = [
            [a * a + b * b - c * c - d * d, 2.0 * b * c - 2.0 * a * d, 2.0 * b * d + 2.0 * a * c],
            [2.0 * b * c + 2.0 * a * d, a * a + c * c - b * b - d * d, 2.0 * c * d - 2.0 * a * b],
            [2.0 * b * d - 2.0 * a * c, 2.0 * c * d + 2.0 * a * b, a * a + d * d - c * c - b * b],
        ];
        let dx = header.pixdim[1] as f64;
        let dy = header.pixdim[2] as f64;
        let dz = header.pixdim[3] as f64 * qfac;
        let q = [header.quatern_x, header.quatern_y, header.quatern_z];
        [
            [(r[0][0] * dx) as f32, (r[0][1] * dy) as f32, (r[0][2] * dz) as f32, q[0]],
            [(r[1][0] * dx) as f32, (r[1][1] * dy) as f32, (r[1][2] * dz) as f32, q[1]],
            [(r[2][0] * dx) as f32, (r[2][1] * dy) as f32, (r[2][2] * dz) as f32, q[2]],
            [0.0, 0.0, 0.0, 1.0],
        ]
    } else {
        let dx = header.pixdim[1].max(1e-6);
        let dy = header.pixdim[2].max(1e-6);
        let dz = header.pixdim[3].max(1e-6);
        [
            [dx, 0.0, 0.0, 0.0],
            [0.0, dy, 0.0, 0.0],
            [0.0, 0.0, dz, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ]
    };

    let origin = Point3::new(affine[0][3] as f64, affine[1][3] as f64, affine[2][3] as f64);
    let cols: Vec<Vector3<f64>> = (0..3)
        .map(|c| Vector3::new(affine[0][c] as f64, affine[1][c] as f64, affine[2][c] as f64))
        .collect();
    let norms: Vec<f64> = cols.iter().map(|v| v.norm()).collect();
    let spacing = Vector3::new(norms[0].max(1e-9), norms[1].max(1e-9), norms[2].max(1e-9));
    let direction = Matrix3::from_columns(&[
        cols[0] / spacing[0],
        cols[1] / spacing[1],
        cols[2] / spacing[2],
    ]);

    CoordinateFrame::new(origin, spacing, direction)
}

/// NIfTI header carrying a frame's sform and pixdims, for writing. The tag
/// (a run identifier) lands in the description field.
fn header_from_frame(frame: &CoordinateFrame, tag: &str) -> NiftiHeader {
    let m = frame.index_to_world_matrix();
    let spacing = frame.spacing();
    let row = |r: usize| {
        [
            m[(r, 0)] as f32,
            m[(r, 1)] as f32,
            m[(r, 2)] as f32,
            m[(r, 3)] as f32,
        ]
    };
    let mut descrip = tag.as_bytes().to_vec();
    descrip.truncate(79);
    NiftiHeader {
        pixdim: [
            1.0,
            spacing[0] as f32,
            spacing[1] as f32,
            spacing[2] as f32,
            1.0,
            1.0,
            1.0,
            1.0,
        ],
        sform_code: 2,
        qform_code: 0,
        srow_x: row(0),
        srow_y: row(1),
        srow_z: row(2),
        descrip,
        ..NiftiHeader::default()
    }
}

/// `[X, Y, Z]` disk order to the in-memory `[Z, Y, X]` order.
fn to_zyx(xyz: Array3<f32>) -> Array3<f32> {
    xyz.permuted_axes([2, 1, 0]).as_standard_layout().to_owned()
}

/// In-memory `[Z, Y, X]` order to `[X, Y, Z]` disk order.
fn to_xyz(zyx: &Array3<f32>) -> Array3<f32> {
    zyx.clone()
        .permuted_axes([2, 1, 0])
        .as_standard_layout()
        .to_owned()
}

/// Read a 3-D NIfTI file into a volume.
pub fn read_volume<P: AsRef<Path>>(path: P) -> Result<Volume> {
    let path = path.as_ref();
    let obj = ReaderOptions::new()
        .read_file(path)
        .with_context(|| format!("failed to read NIfTI file {}", path.display()))?;
    let frame = frame_from_header(obj.header());

    let data: ArrayD<f32> = obj
        .into_volume()
        .into_ndarray::<f32>()
        .context("failed to convert NIfTI volume to ndarray")?;
    let data = match data.ndim() {
        3 => data,
        // Tolerate a trailing singleton (single sub-brick) dimension.
        4 if data.shape()[3] == 1 => data.index_axis_move(Axis(3), 0),
        n => bail!("expected a 3-D NIfTI volume, found {n} dimensions"),
    };
    let xyz = data
        .into_dimensionality::<ndarray::Ix3>()
        .context("NIfTI volume is not 3-D")?;
    Ok(Volume::new(to_zyx(xyz), frame))
}

/// Write a volume as a 3-D NIfTI file.
pub fn write_volume<P: AsRef<Path>>(path: P, volume: &Volume) -> Result<()> {
    write_volume_tagged(path, volume, "")
}

/// Write a volume, stamping `tag` (a run identifier) into the header
/// description.
pub fn write_volume_tagged<P: AsRef<Path>>(path: P, volume: &Volume, tag: &str) -> Result<()> {
    let path = path.as_ref();
    let header = header_from_frame(volume.frame(), tag);
    let xyz = to_xyz(volume.data());
    nifti::writer::WriterOptions::new(path)
        .reference_header(&header)
        .write_nifti(&xyz)
        .with_context(|| format!("failed to write NIfTI file {}", path.display()))?;
    Ok(())
}

/// Read a warp field from a 4-D NIfTI file (`[X, Y, Z, 3]`), adopting the
/// header's coordinate frame.
pub fn read_warp<P: AsRef<Path>>(path: P) -> Result<WarpField> {
    let path = path.as_ref();
    let obj = ReaderOptions::new()
        .read_file(path)
        .with_context(|| format!("failed to read warp file {}", path.display()))?;
    let frame = frame_from_header(obj.header());

    let data: ArrayD<f32> = obj
        .into_volume()
        .into_ndarray::<f32>()
        .context("failed to convert warp volume to ndarray")?;
    if data.ndim() != 4 || data.shape()[3] != 3 {
        bail!(
            "warp file {} must be 4-D with 3 displacement components, got shape {:?}",
            path.display(),
            data.shape()
        );
    }
    let four = data
        .into_dimensionality::<ndarray::Ix4>()
        .context("warp volume is not 4-D")?;

    let comp = |c: usize| to_zyx(four.index_axis(Axis(3), c).to_owned());
    Ok(WarpField::from_components(comp(0), comp(1), comp(2)).adopt_frame(frame))
}

/// Write a warp field as a 4-D NIfTI file. The field must have adopted a
/// coordinate frame.
pub fn write_warp<P: AsRef<Path>>(path: P, warp: &WarpField) -> Result<()> {
    write_warp_tagged(path, warp, "")
}

/// Write a warp field, stamping `tag` into the header description.
pub fn write_warp_tagged<P: AsRef<Path>>(path: P, warp: &WarpField, tag: &str) -> Result<()> {
    let path = path.as_ref();
    let frame = warp
        .frame()
        .context("cannot write a warp field that has not adopted a coordinate frame")?;
    let header = header_from_frame(frame, tag);

    let [nx, ny, nz] = warp.dims();
    let mut out = Array4::<f32>::zeros((nx, ny, nz, 3));
    for (c, comp) in warp.components().into_iter().enumerate() {
        let xyz = to_xyz(comp);
        out.index_axis_mut(Axis(3), c).assign(&xyz);
    }
    nifti::writer::WriterOptions::new(path)
        .reference_header(&header)
        .write_nifti(&out)
        .with_context(|| format!("failed to write warp file {}", path.display()))?;
    Ok(())
}
