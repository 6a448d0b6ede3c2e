//! ALiBi positional bias and the causal mask.
//!
//! Instead of position embeddings, each head adds `slope · (key − query)` to
//! its attention scores, so a query attends less to distant keys. Slopes form
//! a geometric sequence per head.
//!
//! # Reference
//!
//! [Train Short, Test Long: Attention with Linear Biases](https://arxiv.org/abs/2108.12409)

use crate::error::Result;
use candle_core::{Device, Tensor};

/// Per-head slopes for `n_head` heads.
///
/// With `p = 2^⌊log2 n_head⌋`, heads `k < p` get `m0^(k+1)` where
/// `m0 = 2^(-bias_max / p)`; the remaining heads interleave with
/// `m1^(2(k−p)+1)` where `m1 = 2^(-bias_max / 2 / p)`.
pub fn slopes(n_head: usize, bias_max: f32) -> Vec<f32> {
    if n_head == 0 {
        return Vec::new();
    }
    let pow2 = 1usize << n_head.ilog2();
    let m0 = 2f32.powf(-bias_max / pow2 as f32);
    let m1 = 2f32.powf(-(bias_max / 2.0) / pow2 as f32);

    (0..n_head)
        .map(|k| {
            if k < pow2 {
                m0.powi(k as i32 + 1)
            } else {
                m1.powi(2 * (k - pow2) as i32 + 1)
            }
        })
        .collect()
}

/// Additive bias of shape `(n_head, n_new, n_past + n_new)`.
///
/// Query row `i` sits at absolute position `n_past + i`; entry `(h, i, j)` is
/// `slopes[h] · (j − (n_past + i))`. Entries for future keys are positive and
/// must be covered by [`causal_mask`].
pub fn attention_bias(
    slopes: &[f32],
    n_past: usize,
    n_new: usize,
    staging: &mut Vec<f32>,
    device: &Device,
) -> Result<Tensor> {
    let n_kv = n_past + n_new;
    staging.clear();
    for &slope in slopes {
        for i in 0..n_new {
            let query = (n_past + i) as f32;
            staging.extend((0..n_kv).map(|j| slope * (j as f32 - query)));
        }
    }
    Ok(Tensor::from_slice(staging.as_slice(), (slopes.len(), n_new, n_kv), device)?)
}

/// Causal mask of shape `(n_new, n_past + n_new)`: `0` where key `j` is at
/// or before the query's absolute position, `-inf` after.
pub fn causal_mask(n_past: usize, n_new: usize, staging: &mut Vec<f32>, device: &Device) -> Result<Tensor> {
    let n_kv = n_past + n_new;
    staging.clear();
    for i in 0..n_new {
        let query = n_past + i;
        staging.extend((0..n_kv).map(|j| if j > query { f32::NEG_INFINITY } else { 0.0 }));
    }
    Ok(Tensor::from_slice(staging.as_slice(), (n_new, n_kv), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slopes_power_of_two_heads() {
        let s = slopes(8, 8.0);
        // m0 = 2^-1
        for (k, slope) in s.iter().enumerate() {
            let expected = 0.5f32.powi(k as i32 + 1);
            assert!((slope - expected).abs() < 1e-7, "head {k}: {slope} vs {expected}");
        }
    }

    #[test]
    fn slopes_non_power_of_two_heads() {
        let s = slopes(12, 8.0);
        assert_eq!(s.len(), 12);
        // heads 8.. use m1 = 2^-0.5 with odd exponents
        let m1 = 2f32.powf(-0.5);
        assert!((s[8] - m1).abs() < 1e-6);
        assert!((s[9] - m1.powi(3)).abs() < 1e-6);
        assert!((s[11] - m1.powi(7)).abs() < 1e-6);
    }

    #[test]
    fn single_head_slope() {
        let s = slopes(1, 8.0);
        assert_eq!(s.len(), 1);
        assert!((s[0] - 2f32.powi(-8)).abs() < 1e-9);
    }

    #[test]
    fn bias_grows_with_distance() {
        let bias = attention_bias(&[0.5], 2, 2, &mut Vec::new(), &Device::Cpu).unwrap();
        assert_eq!(bias.dims(), &[1, 2, 4]);
        let rows: Vec<Vec<f32>> = bias.squeeze(0).unwrap().to_vec2().unwrap();
        // query at position 2
        assert_eq!(rows[0], vec![-1.0, -0.5, 0.0, 0.5]);
        // query at position 3
        assert_eq!(rows[1], vec![-1.5, -1.0, -0.5, 0.0]);
    }

    #[test]
    fn mask_hides_future_keys() {
        let mask = causal_mask(1, 3, &mut Vec::new(), &Device::Cpu).unwrap();
        let rows: Vec<Vec<f32>> = mask.to_vec2().unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows[0][..2].iter().all(|v| *v == 0.0));
        assert!(rows[0][2..].iter().all(|v| v.is_infinite()));
        assert!(rows[2].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn staging_is_reused() {
        let mut staging = Vec::with_capacity(64);
        let ptr = staging.as_ptr();
        causal_mask(0, 4, &mut staging, &Device::Cpu).unwrap();
        attention_bias(&[1.0, 0.5], 0, 4, &mut staging, &Device::Cpu).unwrap();
        assert_eq!(staging.as_ptr(), ptr);
        assert_eq!(staging.len(), 32);
    }
}
