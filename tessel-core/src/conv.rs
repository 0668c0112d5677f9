//! Convolution construction with an explicit padding mode.
//!
//! Textures only tile when the convolutions that produce them wrap around at
//! the borders. Rather than patching layer construction globally, the padding
//! mode is a constructor parameter: every convolution this crate builds goes
//! through [`conv2d`], and [`pad_circular`] exposes the wrap-around padding
//! itself for places that need it on raw tensors (e.g. latents before VAE
//! decode).

use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PaddingMode {
    Zeros,
    /// Wrap-around padding; opposite edges of the sample continue into each
    /// other, which is what makes the output seamlessly tileable.
    #[default]
    Circular,
}

/// Pads the last two axes of `t` by `pad` elements on each side, taking the
/// padded values from the opposite edge.
pub fn pad_circular(t: &Tensor, pad: usize) -> Result<Tensor> {
    if pad == 0 {
        return Ok(t.clone());
    }
    let dims = t.dims();
    if dims.len() < 2 {
        candle_core::bail!("pad_circular expects at least two axes, got {dims:?}")
    }
    let (h_axis, w_axis) = (dims.len() - 2, dims.len() - 1);
    let (h, w) = (dims[h_axis], dims[w_axis]);
    if pad > h || pad > w {
        candle_core::bail!("circular pad {pad} exceeds spatial extent {h}x{w}")
    }
    let left = t.narrow(w_axis, w - pad, pad)?;
    let right = t.narrow(w_axis, 0, pad)?;
    let t = Tensor::cat(&[&left, t, &right], w_axis)?;
    let top = t.narrow(h_axis, h - pad, pad)?;
    let bottom = t.narrow(h_axis, 0, pad)?;
    Tensor::cat(&[&top, &t, &bottom], h_axis)
}

/// A 2d convolution whose padding mode is fixed at construction. In circular
/// mode the input is wrapped first and the inner convolution runs unpadded,
/// so the output extent matches the zero-padded equivalent.
#[derive(Clone, Debug)]
pub struct Conv2dPadded {
    inner: Conv2d,
    mode: PaddingMode,
    padding: usize,
}

impl Conv2dPadded {
    pub fn new(weight: Tensor, bias: Option<Tensor>, config: Conv2dConfig, mode: PaddingMode) -> Self {
        let padding = config.padding;
        let inner = Conv2d::new(weight, bias, inner_config(config, mode));
        Self {
            inner,
            mode,
            padding,
        }
    }

    pub fn mode(&self) -> PaddingMode {
        self.mode
    }
}

impl Module for Conv2dPadded {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self.mode {
            PaddingMode::Zeros => self.inner.forward(xs),
            PaddingMode::Circular => {
                let xs = pad_circular(xs, self.padding)?;
                self.inner.forward(&xs)
            }
        }
    }
}

/// Drop-in counterpart of `candle_nn::conv2d` taking the padding mode
/// explicitly.
pub fn conv2d(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    config: Conv2dConfig,
    mode: PaddingMode,
    vb: VarBuilder,
) -> Result<Conv2dPadded> {
    let padding = config.padding;
    let inner = candle_nn::conv2d(
        in_channels,
        out_channels,
        kernel_size,
        inner_config(config, mode),
        vb,
    )?;
    Ok(Conv2dPadded {
        inner,
        mode,
        padding,
    })
}

fn inner_config(config: Conv2dConfig, mode: PaddingMode) -> Conv2dConfig {
    match mode {
        PaddingMode::Zeros => config,
        // the wrap happens on the input, the convolution itself is unpadded
        PaddingMode::Circular => Conv2dConfig {
            padding: 0,
            ..config
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, IndexOp};

    #[test]
    fn pad_circular_wraps_edges() -> Result<()> {
        let t = Tensor::new(&[[1f32, 2.], [3., 4.]], &Device::Cpu)?;
        let padded = pad_circular(&t, 1)?;
        assert_eq!(padded.dims(), [4, 4]);
        // corners come from the diagonally opposite cells
        assert_eq!(padded.i((0, 0))?.to_scalar::<f32>()?, 4.);
        assert_eq!(padded.i((0, 3))?.to_scalar::<f32>()?, 3.);
        assert_eq!(padded.i((3, 0))?.to_scalar::<f32>()?, 2.);
        assert_eq!(padded.i((3, 3))?.to_scalar::<f32>()?, 1.);
        // center is untouched
        assert_eq!(padded.i((1, 1))?.to_scalar::<f32>()?, 1.);
        assert_eq!(padded.i((2, 2))?.to_scalar::<f32>()?, 4.);
        Ok(())
    }

    #[test]
    fn pad_circular_rejects_oversized_pad() -> Result<()> {
        let t = Tensor::zeros((1, 1, 2, 2), candle_core::DType::F32, &Device::Cpu)?;
        assert!(pad_circular(&t, 3).is_err());
        Ok(())
    }

    #[test]
    fn circular_conv_sees_the_whole_torus() -> Result<()> {
        // With a 3x3 kernel of ones over a 3x3 input, every circular window
        // covers the full grid, so each output equals the total sum.
        let dev = Device::Cpu;
        let input = Tensor::arange(0f32, 9., &dev)?.reshape((1, 1, 3, 3))?;
        let weight = Tensor::ones((1, 1, 3, 3), candle_core::DType::F32, &dev)?;
        let config = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv = Conv2dPadded::new(weight, None, config, PaddingMode::Circular);
        let output = conv.forward(&input)?;
        assert_eq!(output.dims(), [1, 1, 3, 3]);
        let values = output.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|&v| (v - 36.).abs() < 1e-5));
        Ok(())
    }

    #[test]
    fn zeros_mode_matches_plain_conv2d() -> Result<()> {
        let dev = Device::Cpu;
        let input = Tensor::arange(0f32, 32., &dev)?.reshape((1, 2, 4, 4))?;
        let weight = Tensor::arange(0f32, 18., &dev)?.reshape((1, 2, 3, 3))?;
        let config = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let padded = Conv2dPadded::new(weight.clone(), None, config, PaddingMode::Zeros);
        let plain = Conv2d::new(weight, None, config);
        let a = padded.forward(&input)?.flatten_all()?.to_vec1::<f32>()?;
        let b = plain.forward(&input)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn circular_output_extent_matches_zero_padding() -> Result<()> {
        let dev = Device::Cpu;
        let input = Tensor::arange(0f32, 25., &dev)?.reshape((1, 1, 5, 5))?;
        let weight = Tensor::ones((1, 1, 3, 3), candle_core::DType::F32, &dev)?;
        let config = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv = Conv2dPadded::new(weight, None, config, PaddingMode::Circular);
        assert_eq!(conv.forward(&input)?.dims(), [1, 1, 5, 5]);
        Ok(())
    }
}
