//! Differentiable resize and small tensor helpers shared by the encoder bank and
//! the perturbation engine.
//!
//! `candle-core` does not ship a differentiable bilinear `interpolate`, so the
//! per-step resizes inside the PGD loop (spec §4.1 "internally resizes ... bilinear,
//! no corner align") are expressed as two matrix multiplications against
//! precomputed, non-learnable interpolation-weight matrices — `matmul` is
//! differentiable in `candle`'s autograd, so gradients flow back through the resize
//! into `delta` exactly as they would through a native bilinear op.

use candle_core::{DType, Device, Result, Tensor};

/// Bilinear resize of an `(N, C, H, W)` tensor to `(N, C, out_h, out_w)`,
/// `align_corners=false` (PyTorch / `F.interpolate` default), implemented as
/// `Wh @ x @ Ww` per channel.
pub fn bilinear_resize(x: &Tensor, out_h: usize, out_w: usize, device: &Device) -> Result<Tensor> {
    let (n, c, h_in, w_in) = x.dims4()?;
    if h_in == out_h && w_in == out_w {
        return Ok(x.clone());
    }
    let wh = bilinear_weight_matrix(out_h, h_in, device)?; // (out_h, h_in)
    let ww = bilinear_weight_matrix(out_w, w_in, device)?; // (out_w, w_in)
    let ww_t = ww.t()?.contiguous()?; // (w_in, out_w)

    let flat = x.reshape((n * c, h_in, w_in))?;
    let stage1 = wh.broadcast_matmul(&flat)?; // (n*c, out_h, w_in)
    let stage2 = stage1.broadcast_matmul(&ww_t)?; // (n*c, out_h, out_w)
    stage2.reshape((n, c, out_h, out_w))
}

/// Build the `(out, in)` row-stochastic bilinear weight matrix for one axis.
fn bilinear_weight_matrix(out_len: usize, in_len: usize, device: &Device) -> Result<Tensor> {
    let mut weights = vec![0f32; out_len * in_len];
    let scale = in_len as f32 / out_len as f32;
    for o in 0..out_len {
        // align_corners=false source-coordinate mapping.
        let src = (o as f32 + 0.5) * scale - 0.5;
        let src = src.clamp(0.0, (in_len - 1) as f32);
        let lo = src.floor() as usize;
        let hi = (lo + 1).min(in_len - 1);
        let frac = src - lo as f32;
        weights[o * in_len + lo] += 1.0 - frac;
        if hi != lo {
            weights[o * in_len + hi] += frac;
        }
    }
    Tensor::from_vec(weights, (out_len, in_len), device)
}

/// Bicubic (Catmull-Rom) upscale of a single-precision `(H, W)` plane, used only at
/// finalization (spec §4.4 "upscale δ bicubically"), where differentiability is no
/// longer required (the upscale happens with gradients disabled). Operates directly
/// on `f32` planes rather than through 8-bit `image` crate resampling to avoid
/// quantizing `delta` before the final clamp.
pub fn bicubic_resize_plane(src: &[f32], in_h: usize, in_w: usize, out_h: usize, out_w: usize) -> Vec<f32> {
    let mut dst = vec![0f32; out_h * out_w];
    let scale_y = in_h as f32 / out_h as f32;
    let scale_x = in_w as f32 / out_w as f32;

    let at = |y: isize, x: isize| -> f32 {
        let y = y.clamp(0, in_h as isize - 1) as usize;
        let x = x.clamp(0, in_w as isize - 1) as usize;
        src[y * in_w + x]
    };

    for oy in 0..out_h {
        let sy = (oy as f32 + 0.5) * scale_y - 0.5;
        let y0 = sy.floor() as isize;
        let ty = sy - y0 as f32;
        for ox in 0..out_w {
            let sx = (ox as f32 + 0.5) * scale_x - 0.5;
            let x0 = sx.floor() as isize;
            let tx = sx - x0 as f32;

            let mut rows = [0f32; 4];
            for (i, dy) in (-1..=2).enumerate() {
                let p0 = at(y0 + dy, x0 - 1);
                let p1 = at(y0 + dy, x0);
                let p2 = at(y0 + dy, x0 + 1);
                let p3 = at(y0 + dy, x0 + 2);
                rows[i] = cubic_hermite(p0, p1, p2, p3, tx);
            }
            dst[oy * out_w + ox] = cubic_hermite(rows[0], rows[1], rows[2], rows[3], ty);
        }
    }
    dst
}

fn cubic_hermite(p0: f32, p1: f32, p2: f32, p3: f32, t: f32) -> f32 {
    let a = -0.5 * p0 + 1.5 * p1 - 1.5 * p2 + 0.5 * p3;
    let b = p0 - 2.5 * p1 + 2.0 * p2 - 0.5 * p3;
    let c = -0.5 * p0 + 0.5 * p2;
    let d = p1;
    ((a * t + b) * t + c) * t + d
}

/// L2-normalize the last dimension of a `(N, D)` embedding batch.
pub fn l2_normalize(x: &Tensor) -> Result<Tensor> {
    let norm = x.sqr()?.sum_keepdim(1)?.sqrt()?;
    x.broadcast_div(&norm)
}

/// Mean cosine similarity between two `(N, D)` L2-normalized batches, reduced
/// across the batch dimension to a scalar `Tensor`.
pub fn cosine_similarity_mean(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let dot = (a * b)?.sum(1)?;
    dot.mean(0)
}

/// `x * 2 - 1`: rescale an image tensor from `[0,1]` to `[-1,1]` (LPIPS domain,
/// spec §4.3).
pub fn to_signed_domain(x: &Tensor) -> Result<Tensor> {
    (x * 2.0)?.broadcast_sub(&Tensor::new(1f32, x.device())?)
}

/// Construct a normalization tensor of shape `(1, 3, 1, 1)` from per-channel
/// constants, broadcastable against an `(N, 3, H, W)` image tensor.
pub fn channel_constant(values: [f32; 3], device: &Device) -> Result<Tensor> {
    Tensor::from_vec(values.to_vec(), (1, 3, 1, 1), device)?.to_dtype(DType::F32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bilinear_resize_is_a_noop_at_the_same_size() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::rand(0f32, 1f32, (1, 3, 8, 8), &device)?;
        let resized = bilinear_resize(&x, 8, 8, &device)?;
        assert_eq!(resized.dims4()?, (1, 3, 8, 8));
        Ok(())
    }

    #[test]
    fn bilinear_resize_changes_shape_and_preserves_constant_planes() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::ones((1, 1, 4, 4), DType::F32, &device)?;
        let resized = bilinear_resize(&x, 2, 2, &device)?;
        assert_eq!(resized.dims4()?, (1, 1, 2, 2));
        let values = resized.flatten_all()?.to_vec1::<f32>()?;
        for v in values {
            assert!((v - 1.0).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn bicubic_resize_plane_preserves_a_flat_field() {
        let src = vec![5.0f32; 4 * 4];
        let dst = bicubic_resize_plane(&src, 4, 4, 8, 8);
        assert_eq!(dst.len(), 64);
        for v in dst {
            assert!((v - 5.0).abs() < 1e-4);
        }
    }

    #[test]
    fn l2_normalize_produces_unit_norm_rows() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::from_vec(vec![3f32, 4f32, 0f32, 5f32], (2, 2), &device)?;
        let normalized = l2_normalize(&x)?;
        let norms = normalized.sqr()?.sum(1)?.to_vec1::<f32>()?;
        for n in norms {
            assert!((n - 1.0).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn cosine_similarity_mean_of_identical_normalized_batches_is_one() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::from_vec(vec![1f32, 0f32, 0f32, 1f32], (2, 2), &device)?;
        let sim = cosine_similarity_mean(&x, &x)?;
        let value = sim.to_scalar::<f32>()?;
        assert!((value - 1.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn to_signed_domain_maps_zero_one_to_minus_one_one() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::from_vec(vec![0f32, 0.5f32, 1f32], (3,), &device)?;
        let signed = to_signed_domain(&x)?.to_vec1::<f32>()?;
        assert!((signed[0] - -1.0).abs() < 1e-5);
        assert!((signed[1] - 0.0).abs() < 1e-5);
        assert!((signed[2] - 1.0).abs() < 1e-5);
        Ok(())
    }
}
