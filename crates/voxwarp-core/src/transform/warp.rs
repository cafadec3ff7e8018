//! Dense per-voxel displacement fields.
//!
//! Displacements are stored in index units of the grid the field lives on,
//! one `Array3<f32>` per component. A field is grid-only until it adopts a
//! [`CoordinateFrame`], which happens at output boundaries.

use nalgebra::Vector3;
use ndarray::parallel::prelude::*;
use ndarray::{Array3, Axis, Zip};

use crate::interpolation::{sample_linear, InterpKind};
use crate::spatial::CoordinateFrame;
use crate::volume::{pad, PaddingSpec, Volume};

/// Dense displacement field over a voxel grid.
///
/// The mapped position of grid point `x` is `x + d(x)`. Approximate
/// invertibility is assumed, not verified.
#[derive(Debug, Clone)]
pub struct WarpField {
    dx: Array3<f32>,
    dy: Array3<f32>,
    dz: Array3<f32>,
    frame: Option<CoordinateFrame>,
}

impl WarpField {
    /// Identity (all-zero) field over `(nx, ny, nz)` voxels.
    pub fn zeros(dims: [usize; 3]) -> Self {
        let shape = (dims[2], dims[1], dims[0]);
        Self {
            dx: Array3::zeros(shape),
            dy: Array3::zeros(shape),
            dz: Array3::zeros(shape),
            frame: None,
        }
    }

    /// Assemble from per-component arrays (`[z, y, x]` order).
    pub fn from_components(dx: Array3<f32>, dy: Array3<f32>, dz: Array3<f32>) -> Self {
        assert!(
            dx.dim() == dy.dim() && dy.dim() == dz.dim(),
            "displacement components must share a grid"
        );
        Self {
            dx,
            dy,
            dz,
            frame: None,
        }
    }

    pub fn nx(&self) -> usize {
        self.dx.dim().2
    }

    pub fn ny(&self) -> usize {
        self.dx.dim().1
    }

    pub fn nz(&self) -> usize {
        self.dx.dim().0
    }

    /// Logical dimensions `(nx, ny, nz)`.
    pub fn dims(&self) -> [usize; 3] {
        [self.nx(), self.ny(), self.nz()]
    }

    pub fn components(&self) -> [&Array3<f32>; 3] {
        [&self.dx, &self.dy, &self.dz]
    }

    pub fn components_mut(&mut self) -> [&mut Array3<f32>; 3] {
        [&mut self.dx, &mut self.dy, &mut self.dz]
    }

    /// Frame adopted for output, if any.
    pub fn frame(&self) -> Option<&CoordinateFrame> {
        self.frame.as_ref()
    }

    /// Adopt a coordinate frame; done only at output boundaries.
    pub fn adopt_frame(mut self, frame: CoordinateFrame) -> Self {
        self.frame = Some(frame);
        self
    }

    pub fn displacement_at(&self, x: usize, y: usize, z: usize) -> Vector3<f64> {
        Vector3::new(
            self.dx[[z, y, x]] as f64,
            self.dy[[z, y, x]] as f64,
            self.dz[[z, y, x]] as f64,
        )
    }

    pub fn set_displacement(&mut self, x: usize, y: usize, z: usize, d: [f32; 3]) {
        self.dx[[z, y, x]] = d[0];
        self.dy[[z, y, x]] = d[1];
        self.dz[[z, y, x]] = d[2];
    }

    /// Trilinear displacement sample at a continuous `(x, y, z)` index.
    pub fn sample_displacement(&self, x: f64, y: f64, z: f64) -> Vector3<f64> {
        Vector3::new(
            sample_linear(&self.dx, x, y, z) as f64,
            sample_linear(&self.dy, x, y, z) as f64,
            sample_linear(&self.dz, x, y, z) as f64,
        )
    }

    /// Multiply every displacement by `factor`.
    pub fn scaled(mut self, factor: f32) -> Self {
        for comp in self.components_mut() {
            Zip::from(comp).par_for_each(|v| *v *= factor);
        }
        self
    }

    /// Zero out one displacement component (0 = x, 1 = y, 2 = z).
    pub fn lock_axis(&mut self, axis: usize) {
        match axis {
            0 => self.dx.fill(0.0),
            1 => self.dy.fill(0.0),
            2 => self.dz.fill(0.0),
            _ => panic!("axis must be 0, 1 or 2, got {axis}"),
        }
    }

    /// Largest displacement magnitude over the grid, in voxels.
    pub fn max_magnitude(&self) -> f64 {
        let mut max2 = 0.0f64;
        Zip::from(&self.dx)
            .and(&self.dy)
            .and(&self.dz)
            .for_each(|&a, &b, &c| {
                let m = (a as f64).powi(2) + (b as f64).powi(2) + (c as f64).powi(2);
                if m > max2 {
                    max2 = m;
                }
            });
        max2.sqrt()
    }

    /// Crop the grid by the given margins; the adopted frame, if any, shrinks
    /// with it.
    pub fn crop(&self, spec: &PaddingSpec) -> WarpField {
        WarpField {
            dx: pad::crop_array(&self.dx, spec),
            dy: pad::crop_array(&self.dy, spec),
            dz: pad::crop_array(&self.dz, spec),
            frame: self.frame.map(|f| f.shrunk_low(spec.low())),
        }
    }

    /// Extend the grid by the given margins, linearly extrapolating each
    /// component from the two boundary samples along each axis.
    pub fn extend(&self, spec: &PaddingSpec) -> WarpField {
        let extend_comp = |comp: &Array3<f32>| {
            let mut out = extend_axis(comp, Axis(2), spec.x_lo, spec.x_hi);
            out = extend_axis(&out, Axis(1), spec.y_lo, spec.y_hi);
            extend_axis(&out, Axis(0), spec.z_lo, spec.z_hi)
        };
        WarpField {
            dx: extend_comp(&self.dx),
            dy: extend_comp(&self.dy),
            dz: extend_comp(&self.dz),
            frame: self.frame.map(|f| f.grown_low(spec.low())),
        }
    }

    /// Compose two fields: the result maps `x` through `first`, then
    /// `second`: `d(x) = d1(x) + d2(x + d1(x))`.
    pub fn compose(first: &WarpField, second: &WarpField) -> WarpField {
        assert_eq!(first.dims(), second.dims(), "composed warps must share a grid");
        let mut out = WarpField::zeros(first.dims());
        let [nx, ny, _] = first.dims();

        let (odx, rest) = out_split(&mut out);
        let (ody, odz) = rest;
        odx.axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(ody.axis_iter_mut(Axis(0)).into_par_iter())
            .zip(odz.axis_iter_mut(Axis(0)).into_par_iter())
            .enumerate()
            .for_each(|(k, ((mut sx, mut sy), mut sz))| {
                for j in 0..ny {
                    for i in 0..nx {
                        let d1 = first.displacement_at(i, j, k);
                        let p = Vector3::new(i as f64, j as f64, k as f64) + d1;
                        let d2 = second.sample_displacement(p.x, p.y, p.z);
                        let d = d1 + d2;
                        sx[[j, i]] = d.x as f32;
                        sy[[j, i]] = d.y as f32;
                        sz[[j, i]] = d.z as f32;
                    }
                }
            });
        out.frame = second.frame;
        out
    }

    /// Warp a volume living on this field's grid: `out(x) = vol(x + d(x))`.
    pub fn apply_to(&self, volume: &Volume, interp: InterpKind) -> Volume {
        assert_eq!(self.dims(), volume.dims(), "warp and volume grids differ");
        let [nx, ny, nz] = volume.dims();
        let data = volume.data();
        let mut out = Array3::zeros((nz, ny, nx));
        out.axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(k, mut slab)| {
                for j in 0..ny {
                    for i in 0..nx {
                        let d = self.displacement_at(i, j, k);
                        slab[[j, i]] =
                            interp.sample(data, i as f64 + d.x, j as f64 + d.y, k as f64 + d.z);
                    }
                }
            });
        Volume::new(out, *volume.frame())
    }

    /// Re-render `source` (on its own grid) through this field onto the
    /// field's adopted frame: index → world → source index → interpolate.
    ///
    /// Requires an adopted frame.
    pub fn resample_source(&self, source: &Volume, interp: InterpKind) -> Volume {
        let frame = self
            .frame
            .expect("resample_source requires an adopted coordinate frame");
        let to_source = source.frame().world_to_index_matrix() * frame.index_to_world_matrix();
        let [nx, ny, nz] = self.dims();
        let data = source.data();
        let mut out = Array3::zeros((nz, ny, nx));
        out.axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(k, mut slab)| {
                for j in 0..ny {
                    for i in 0..nx {
                        let d = self.displacement_at(i, j, k);
                        let p = nalgebra::Vector4::new(
                            i as f64 + d.x,
                            j as f64 + d.y,
                            k as f64 + d.z,
                            1.0,
                        );
                        let q = to_source * p;
                        slab[[j, i]] = interp.sample(data, q.x, q.y, q.z);
                    }
                }
            });
        Volume::new(out, frame)
    }

    /// Upsample a field solved on a half-resolution grid onto `target_dims`,
    /// doubling the displacements.
    pub fn upsample_doubled(&self, target_dims: [usize; 3]) -> WarpField {
        let [nx, ny, nz] = target_dims;
        let mut out = WarpField::zeros(target_dims);
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let d = self.sample_displacement(
                        i as f64 * 0.5,
                        j as f64 * 0.5,
                        k as f64 * 0.5,
                    ) * 2.0;
                    out.set_displacement(i, j, k, [d.x as f32, d.y as f32, d.z as f32]);
                }
            }
        }
        out
    }
}

fn out_split(out: &mut WarpField) -> (&mut Array3<f32>, (&mut Array3<f32>, &mut Array3<f32>)) {
    let WarpField { dx, dy, dz, .. } = out;
    (dx, (dy, dz))
}

/// Extend one axis by `lo`/`hi` samples with linear extrapolation from the
/// two boundary samples (constant when the axis has a single sample).
fn extend_axis(data: &Array3<f32>, axis: Axis, lo: usize, hi: usize) -> Array3<f32> {
    if lo == 0 && hi == 0 {
        return data.clone();
    }
    let n = data.len_of(axis);
    let mut shape = [data.dim().0, data.dim().1, data.dim().2];
    shape[axis.index()] += lo + hi;
    let mut out = Array3::zeros((shape[0], shape[1], shape[2]));

    Zip::from(out.lanes_mut(axis))
        .and(data.lanes(axis))
        .par_for_each(|mut dst, src| {
            for t in 0..dst.len() {
                let pos = t as isize - lo as isize;
                dst[t] = if pos < 0 {
                    if n > 1 {
                        src[0] + (src[0] - src[1]) * (-pos) as f32
                    } else {
                        src[0]
                    }
                } else if pos as usize >= n {
                    let over = pos as usize - (n - 1);
                    if n > 1 {
                        src[n - 1] + (src[n - 1] - src[n - 2]) * over as f32
                    } else {
                        src[n - 1]
                    }
                } else {
                    src[pos as usize]
                };
            }
        });
    out
}
