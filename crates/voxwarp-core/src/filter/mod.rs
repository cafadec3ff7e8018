//! Numeric filters over volumes: Gaussian blur, median filter, downsampling.
//!
//! Kernels are data-parallel internally (rayon); callers remain
//! single-threaded.

pub mod downsample;
pub mod gaussian;
pub mod median;

pub use downsample::downsample_by_two;
pub use gaussian::{fwhm_to_sigma, gaussian_blur, GaussianFilter};
pub use median::{median_filter, median_filter_array};
