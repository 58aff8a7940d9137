//! Perceptual Loss Module (C1, spec §4.3): differentiable LPIPS distance over
//! a frozen AlexNet backbone with the reference `lpips` package's per-layer
//! linear calibration weights, following the same `candle_nn`
//! Conv2d/VarBuilder loading convention used by the encoder bank (spec §4.1).

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{conv2d, conv2d_no_bias, Conv2d, Conv2dConfig, Module, VarBuilder};
use hf_hub::api::sync::Api;

/// `lpips`'s internal `ScalingLayer`: a second, AlexNet-specific normalization
/// applied on top of the engine's own `[-1,1]` rescale (spec §4.3 "Accepts two
/// tensors in the [-1,1] domain").
const SCALE_SHIFT: [f32; 3] = [-0.030, -0.088, -0.188];
const SCALE_SCALE: [f32; 3] = [0.458, 0.233, 0.225];

const TAP_CHANNELS: [usize; 5] = [64, 192, 384, 256, 256];

struct AlexNetFeatures {
    conv1: Conv2d,
    conv2: Conv2d,
    conv3: Conv2d,
    conv4: Conv2d,
    conv5: Conv2d,
}

impl AlexNetFeatures {
    fn load(vb: VarBuilder) -> Result<Self> {
        let pad = |p: usize| Conv2dConfig {
            padding: p,
            ..Default::default()
        };
        let stride = |s: usize, p: usize| Conv2dConfig {
            stride: s,
            padding: p,
            ..Default::default()
        };
        Ok(Self {
            conv1: conv2d(3, 64, 11, stride(4, 2), vb.pp("features.0"))?,
            conv2: conv2d(64, 192, 5, pad(2), vb.pp("features.3"))?,
            conv3: conv2d(192, 384, 3, pad(1), vb.pp("features.6"))?,
            conv4: conv2d(384, 256, 3, pad(1), vb.pp("features.8"))?,
            conv5: conv2d(256, 256, 3, pad(1), vb.pp("features.10"))?,
        })
    }

    /// Returns the five ReLU activation taps LPIPS compares (spec §4.3).
    fn forward_taps(&self, x: &Tensor) -> Result<[Tensor; 5]> {
        let h1 = self.conv1.forward(x)?.relu()?;
        let p1 = h1.max_pool2d_with_stride(3, 2)?;
        let h2 = self.conv2.forward(&p1)?.relu()?;
        let p2 = h2.max_pool2d_with_stride(3, 2)?;
        let h3 = self.conv3.forward(&p2)?.relu()?;
        let h4 = self.conv4.forward(&h3)?.relu()?;
        let h5 = self.conv5.forward(&h4)?.relu()?;
        Ok([h1, h2, h3, h4, h5])
    }
}

pub struct Lpips {
    backbone: AlexNetFeatures,
    lin: [Conv2d; 5],
    shift: Tensor,
    scale: Tensor,
}

impl Lpips {
    pub fn load(api: &Api, device: &Device, dtype: DType) -> anyhow::Result<Self> {
        let repo = api.model("richzhang/lpips-alexnet".to_string());
        let weights = repo.get("alexnet_lpips.safetensors")?;
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], dtype, device)? };

        let backbone = AlexNetFeatures::load(vb.pp("backbone"))?;
        let mut lin = Vec::with_capacity(5);
        for (i, &channels) in TAP_CHANNELS.iter().enumerate() {
            lin.push(conv2d_no_bias(
                channels,
                1,
                1,
                Conv2dConfig::default(),
                vb.pp(format!("lin.{i}")),
            )?);
        }
        let lin: [Conv2d; 5] = lin
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected 5 LPIPS calibration layers"))?;

        let shift = Tensor::from_vec(SCALE_SHIFT.to_vec(), (1, 3, 1, 1), device)?.to_dtype(dtype)?;
        let scale = Tensor::from_vec(SCALE_SCALE.to_vec(), (1, 3, 1, 1), device)?.to_dtype(dtype)?;

        Ok(Self {
            backbone,
            lin,
            shift,
            scale,
        })
    }

    /// `a`, `b`: `(N, 3, H, W)` in `[-1,1]`, same shape. Returns a scalar `>= 0`
    /// distance, differentiable with respect to both inputs.
    pub fn distance(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        let a = self.scale_layer(a)?;
        let b = self.scale_layer(b)?;
        let taps_a = self.backbone.forward_taps(&a)?;
        let taps_b = self.backbone.forward_taps(&b)?;

        let mut total: Option<Tensor> = None;
        for (i, (fa, fb)) in taps_a.iter().zip(taps_b.iter()).enumerate() {
            let na = unit_normalize_channels(fa)?;
            let nb = unit_normalize_channels(fb)?;
            let diff = (na - nb)?.sqr()?;
            let weighted = self.lin[i].forward(&diff)?; // (N, 1, h, w)
            let spatial_mean = weighted.mean(3)?.mean(2)?.squeeze(1)?; // (N,)
            total = Some(match total {
                Some(acc) => (acc + spatial_mean)?,
                None => spatial_mean,
            });
        }
        total.expect("at least one tap").mean_all()
    }

    fn scale_layer(&self, x: &Tensor) -> Result<Tensor> {
        x.broadcast_sub(&self.shift)?.broadcast_div(&self.scale)
    }
}

/// Normalize each spatial location's channel vector to unit L2 norm (LPIPS's
/// `normalize_tensor`), so the per-tap distance measures direction, not scale.
fn unit_normalize_channels(x: &Tensor) -> Result<Tensor> {
    let norm = x.sqr()?.sum_keepdim(1)?.sqrt()?;
    x.broadcast_div(&(norm + 1e-10)?)
}
