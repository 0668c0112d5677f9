//! Spherical linear interpolation between latent vectors.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

/// Above this |cosine| the two vectors are near-(anti)parallel and the slerp
/// denominator degenerates, so interpolation falls back to lerp.
pub const DOT_THRESHOLD: f32 = 0.9995;

/// Slerp over host slices. Both inputs must have the same length.
pub fn slerp_slice(t: f32, v0: &[f32], v1: &[f32], dot_threshold: f32) -> Vec<f32> {
    debug_assert_eq!(v0.len(), v1.len());
    let norm0 = v0.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm1 = v1.iter().map(|v| v * v).sum::<f32>().sqrt();
    let dot = if norm0 == 0. || norm1 == 0. {
        1.
    } else {
        v0.iter().zip(v1).map(|(a, b)| a * b).sum::<f32>() / (norm0 * norm1)
    };

    if dot.abs() > dot_threshold {
        return v0
            .iter()
            .zip(v1)
            .map(|(a, b)| (1. - t) * a + t * b)
            .collect();
    }

    let theta_0 = dot.clamp(-1., 1.).acos();
    let sin_theta_0 = theta_0.sin();
    let theta_t = theta_0 * t;
    let s0 = (theta_0 - theta_t).sin() / sin_theta_0;
    let s1 = theta_t.sin() / sin_theta_0;
    v0.iter().zip(v1).map(|(a, b)| s0 * a + s1 * b).collect()
}

/// Slerp over tensors, wherever they live. The math runs on host memory in
/// f32; the result comes back with the shape, dtype and device of `v0`.
pub fn slerp(t: f32, v0: &Tensor, v1: &Tensor) -> Result<Tensor> {
    if v0.shape() != v1.shape() {
        anyhow::bail!(
            "slerp expects matching shapes, got {:?} and {:?}",
            v0.shape(),
            v1.shape()
        );
    }
    let device = v0.device().clone();
    let dtype = v0.dtype();
    let shape = v0.shape().clone();

    let host = |v: &Tensor| -> Result<Vec<f32>> {
        Ok(v.to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?)
    };
    let blended = slerp_slice(t, &host(v0)?, &host(v1)?, DOT_THRESHOLD);

    let out = Tensor::from_vec(blended, shape, &Device::Cpu)?
        .to_dtype(dtype)?
        .to_device(&device)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: &[f32], b: &[f32]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-5, "{a:?} != {b:?}");
        }
    }

    #[test]
    fn endpoints_return_the_inputs() {
        let v0 = [1.0f32, 0., 2.];
        let v1 = [0.0f32, 3., -1.];
        assert_close(&slerp_slice(0., &v0, &v1, DOT_THRESHOLD), &v0);
        assert_close(&slerp_slice(1., &v0, &v1, DOT_THRESHOLD), &v1);
    }

    #[test]
    fn parallel_vectors_fall_back_to_lerp() {
        let v = [0.5f32, -1.5, 2.5];
        for t in [0.0f32, 0.25, 0.5, 0.75, 1.0] {
            assert_close(&slerp_slice(t, &v, &v, DOT_THRESHOLD), &v);
        }
    }

    #[test]
    fn orthogonal_vectors_follow_the_arc() {
        // For orthogonal unit vectors theta = pi/2, so the midpoint is
        // sin(pi/4) * (v0 + v1).
        let v0 = [1.0f32, 0.];
        let v1 = [0.0f32, 1.];
        let mid = slerp_slice(0.5, &v0, &v1, DOT_THRESHOLD);
        let s = std::f32::consts::FRAC_1_SQRT_2;
        assert_close(&mid, &[s, s]);
    }

    #[test]
    fn tensor_variant_preserves_shape_and_dtype() -> Result<()> {
        let dev = Device::Cpu;
        let v0 = Tensor::new(&[[1f32, 0.], [0., 2.]], &dev)?.to_dtype(DType::F16)?;
        let v1 = Tensor::new(&[[0f32, 1.], [2., 0.]], &dev)?.to_dtype(DType::F16)?;
        let out = slerp(0.0, &v0, &v1)?;
        assert_eq!(out.shape(), v0.shape());
        assert_eq!(out.dtype(), DType::F16);
        let diff = (out.to_dtype(DType::F32)? - v0.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-3);
        Ok(())
    }

    #[test]
    fn tensor_variant_rejects_shape_mismatch() -> Result<()> {
        let dev = Device::Cpu;
        let v0 = Tensor::zeros((2, 2), DType::F32, &dev)?;
        let v1 = Tensor::zeros((4,), DType::F32, &dev)?;
        assert!(slerp(0.5, &v0, &v1).is_err());
        Ok(())
    }
}
