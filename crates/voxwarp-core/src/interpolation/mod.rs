//! Interpolators for sampling volumes at continuous indices.

use ndarray::Array3;
use serde::{Deserialize, Serialize};

/// Sampling kernel selection, threaded through configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InterpKind {
    #[default]
    Linear,
    Nearest,
}

impl InterpKind {
    /// Sample `data` (`[z, y, x]` order) at continuous index `(x, y, z)`,
    /// clamped to the grid.
    pub fn sample(&self, data: &Array3<f32>, x: f64, y: f64, z: f64) -> f32 {
        match self {
            InterpKind::Linear => sample_linear(data, x, y, z),
            InterpKind::Nearest => sample_nearest(data, x, y, z),
        }
    }
}

#[inline]
fn clamp_index(v: f64, n: usize) -> f64 {
    v.clamp(0.0, (n - 1) as f64)
}

/// Trilinear sample of `data` at continuous `(x, y, z)`, clamped to the grid.
pub fn sample_linear(data: &Array3<f32>, x: f64, y: f64, z: f64) -> f32 {
    let (nz, ny, nx) = data.dim();
    let x = clamp_index(x, nx);
    let y = clamp_index(y, ny);
    let z = clamp_index(z, nz);

    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let z0 = z.floor() as usize;
    let x1 = (x0 + 1).min(nx - 1);
    let y1 = (y0 + 1).min(ny - 1);
    let z1 = (z0 + 1).min(nz - 1);

    let wx = (x - x0 as f64) as f32;
    let wy = (y - y0 as f64) as f32;
    let wz = (z - z0 as f64) as f32;

    let lerp = |a: f32, b: f32, w: f32| a + (b - a) * w;

    let c00 = lerp(data[[z0, y0, x0]], data[[z0, y0, x1]], wx);
    let c10 = lerp(data[[z0, y1, x0]], data[[z0, y1, x1]], wx);
    let c01 = lerp(data[[z1, y0, x0]], data[[z1, y0, x1]], wx);
    let c11 = lerp(data[[z1, y1, x0]], data[[z1, y1, x1]], wx);

    let c0 = lerp(c00, c10, wy);
    let c1 = lerp(c01, c11, wy);
    lerp(c0, c1, wz)
}

/// Nearest-neighbor sample of `data` at continuous `(x, y, z)`.
pub fn sample_nearest(data: &Array3<f32>, x: f64, y: f64, z: f64) -> f32 {
    let (nz, ny, nx) = data.dim();
    let xi = clamp_index(x, nx).round() as usize;
    let yi = clamp_index(y, ny).round() as usize;
    let zi = clamp_index(z, nz).round() as usize;
    data[[zi.min(nz - 1), yi.min(ny - 1), xi.min(nx - 1)]]
}
