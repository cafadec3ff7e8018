//! Affine matrix files: 12 numbers forming the top three rows of a 4×4
//! transform, as produced by the external affine-registration tool.

use std::path::Path;

use anyhow::{bail, Context, Result};

use voxwarp_core::transform::AffineMatrix;

/// Read an affine matrix from a whitespace-separated text file.
///
/// Lines starting with `#` are comments. Exactly 12 values are required
/// (row-major, rows of the 3×4 upper part).
pub fn read_affine_matrix<P: AsRef<Path>>(path: P) -> Result<AffineMatrix> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read matrix file {}", path.display()))?;

    let values: Vec<f64> = text
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .flat_map(|line| line.split_whitespace())
        .map(|tok| {
            tok.parse::<f64>()
                .with_context(|| format!("bad number {tok:?} in {}", path.display()))
        })
        .collect::<Result<_>>()?;

    if values.len() != 12 {
        bail!(
            "matrix file {} has {} values, expected 12",
            path.display(),
            values.len()
        );
    }
    let mut rows = [0.0; 12];
    rows.copy_from_slice(&values);
    Ok(AffineMatrix::from_rows_3x4(rows))
}
