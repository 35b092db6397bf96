//! 2-D phase correlation on `rustfft`.
//!
//! Estimates the translation of `current` relative to `reference` from the peak
//! of the inverse transform of their normalized cross-power spectrum. The peak
//! location is refined to sub-pixel precision with a three-point parabola along
//! each axis.

use ndarray::Array2;
use num_complex::Complex;
use rustfft::FftPlanner;

use crate::error::{AppResult, DaqError};

/// Cross-power terms below this magnitude carry no phase information.
const MAGNITUDE_FLOOR: f64 = 1e-12;

/// Translation of `current` relative to `reference`, in array indices.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseShift {
    /// Shift along the first (row) axis
    pub row: f64,
    /// Shift along the second (column) axis
    pub col: f64,
    /// Height of the correlation peak (1.0 for a pure translation)
    pub peak: f64,
}

fn fft2(data: &mut [Complex<f64>], rows: usize, cols: usize, inverse: bool) {
    let mut planner = FftPlanner::<f64>::new();
    let (row_fft, col_fft) = if inverse {
        (planner.plan_fft_inverse(cols), planner.plan_fft_inverse(rows))
    } else {
        (planner.plan_fft_forward(cols), planner.plan_fft_forward(rows))
    };

    for row in data.chunks_exact_mut(cols) {
        row_fft.process(row);
    }

    let mut column = vec![Complex::new(0.0, 0.0); rows];
    for c in 0..cols {
        for r in 0..rows {
            column[r] = data[r * cols + c];
        }
        col_fft.process(&mut column);
        for r in 0..rows {
            data[r * cols + c] = column[r];
        }
    }
}

/// Background-subtracted copy of `image` zero-padded to `rows x cols`.
///
/// The minimum is taken as background so padding matches the dark surround.
fn prepare(image: &Array2<f64>, rows: usize, cols: usize) -> Option<Vec<Complex<f64>>> {
    let count = image.len();
    if count == 0 {
        return None;
    }
    let mean = image.sum() / count as f64;
    let variance = image.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
    if !variance.is_finite() || variance <= MAGNITUDE_FLOOR {
        return None;
    }
    let background = image.iter().copied().fold(f64::INFINITY, f64::min);

    let mut out = vec![Complex::new(0.0, 0.0); rows * cols];
    for ((r, c), v) in image.indexed_iter() {
        out[r * cols + c] = Complex::new(v - background, 0.0);
    }
    Some(out)
}

/// Vertex offset of the parabola through three samples, within -0.5..0.5.
fn parabolic(left: f64, center: f64, right: f64) -> f64 {
    let denom = left - 2.0 * center + right;
    if denom.abs() < MAGNITUDE_FLOOR {
        0.0
    } else {
        (0.5 * (left - right) / denom).clamp(-0.5, 0.5)
    }
}

fn unwrap_index(index: f64, len: usize) -> f64 {
    if index > len as f64 / 2.0 {
        index - len as f64
    } else {
        index
    }
}

/// Phase-correlate two images of possibly different sizes.
///
/// Both images are background-subtracted and zero-padded to the larger extent on each
/// axis. Returns `DaqError::DegenerateCorrelation` for empty or flat input and
/// for spectra without a finite peak.
pub fn phase_correlate(reference: &Array2<f64>, current: &Array2<f64>) -> AppResult<PhaseShift> {
    let rows = reference.nrows().max(current.nrows());
    let cols = reference.ncols().max(current.ncols());
    if rows == 0 || cols == 0 {
        return Err(DaqError::DegenerateCorrelation("empty projection".into()));
    }

    let (mut f, mut g) = match (prepare(reference, rows, cols), prepare(current, rows, cols)) {
        (Some(f), Some(g)) => (f, g),
        _ => {
            return Err(DaqError::DegenerateCorrelation(
                "projection has no contrast".into(),
            ))
        }
    };

    fft2(&mut f, rows, cols, false);
    fft2(&mut g, rows, cols, false);

    let mut cross: Vec<Complex<f64>> = g
        .iter()
        .zip(f.iter())
        .map(|(g, f)| {
            let product = g * f.conj();
            let magnitude = product.norm();
            if magnitude > MAGNITUDE_FLOOR {
                product / magnitude
            } else {
                Complex::new(0.0, 0.0)
            }
        })
        .collect();

    fft2(&mut cross, rows, cols, true);

    let scale = (rows * cols) as f64;
    let surface: Vec<f64> = cross.iter().map(|c| c.re / scale).collect();

    let (peak_index, peak) = surface
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .fold(None, |best: Option<(usize, f64)>, (i, v)| match best {
            Some((_, bv)) if bv >= v => best,
            _ => Some((i, v)),
        })
        .ok_or_else(|| DaqError::DegenerateCorrelation("no finite correlation peak".into()))?;

    if peak <= MAGNITUDE_FLOOR {
        return Err(DaqError::DegenerateCorrelation(format!(
            "correlation peak {peak:e} too small"
        )));
    }

    let pr = peak_index / cols;
    let pc = peak_index % cols;
    let at = |r: usize, c: usize| surface[(r % rows) * cols + (c % cols)];

    let row_refine = if rows >= 3 {
        parabolic(at(pr + rows - 1, pc), peak, at(pr + 1, pc))
    } else {
        0.0
    };
    let col_refine = if cols >= 3 {
        parabolic(at(pr, pc + cols - 1), peak, at(pr, pc + 1))
    } else {
        0.0
    };

    Ok(PhaseShift {
        row: unwrap_index(pr as f64, rows) + row_refine,
        col: unwrap_index(pc as f64, cols) + col_refine,
        peak,
    })
}
