//! Window masks and Gaussian tapers for local attention.
//!
//! Both builders produce `[batch, source_len]` `f32` tensors. The window
//! mask is multiplicative (`1.0` keeps a position, `0.0` zeroes its score)
//! rather than additive, so a masked position still contributes `exp(0)` to
//! the softmax denominator.

use candle_core::{Device, Result, Tensor};

/// Floors raw centre predictions and clamps them into `[0, source_len - 1]`.
pub fn snap_centres(raw: &[f32], source_len: usize) -> Vec<f32> {
    let last = source_len.saturating_sub(1) as f32;
    raw.iter()
        .map(|&value| {
            let floored = value.floor();
            if floored.is_nan() {
                0.0
            } else {
                floored.clamp(0.0, last)
            }
        })
        .collect()
}

/// Inclusive position bounds `[centre - window + 1, centre + window]`.
///
/// Bounds are signed and may fall outside the sequence; callers compare
/// positions against them directly.
pub fn window_bounds(centre: f32, window_size: usize) -> (f32, f32) {
    let window = window_size as f32;
    (centre - window + 1.0, centre + window)
}

/// Builds the 0/1 window mask for every batch row.
pub fn window_mask(
    device: &Device,
    centres: &[f32],
    window_size: usize,
    source_len: usize,
) -> Result<Tensor> {
    let batch = centres.len();
    let mut data = vec![0f32; batch * source_len];

    for (b, &centre) in centres.iter().enumerate() {
        let (low, high) = window_bounds(centre, window_size);
        let row_start = b * source_len;
        for pos in 0..source_len {
            let position = pos as f32;
            if position >= low && position <= high {
                data[row_start + pos] = 1.0;
            }
        }
    }

    Tensor::from_vec(data, (batch, source_len), device)
}

/// Builds `exp(-(pos - centre)^2 / sigma^2)` with `sigma = window_size / 2`.
///
/// A zero-width window degenerates to an indicator at the centre.
pub fn gaussian_taper(
    device: &Device,
    centres: &[f32],
    window_size: usize,
    source_len: usize,
) -> Result<Tensor> {
    let batch = centres.len();
    let sigma = window_size as f32 / 2.0;
    let denominator = sigma * sigma;
    let mut data = vec![0f32; batch * source_len];

    for (b, &centre) in centres.iter().enumerate() {
        let row_start = b * source_len;
        for pos in 0..source_len {
            let offset = pos as f32 - centre;
            data[row_start + pos] = if denominator > 0.0 {
                (-(offset * offset) / denominator).exp()
            } else if offset == 0.0 {
                1.0
            } else {
                0.0
            };
        }
    }

    Tensor::from_vec(data, (batch, source_len), device)
}
