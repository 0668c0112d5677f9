pub mod conv;
pub mod device_map;
pub mod interp;
pub mod loader;
mod predictor;
mod sd;
mod util;

pub use conv::{pad_circular, Conv2dPadded, PaddingMode};
pub use device_map::DeviceMap;
pub use interp::{slerp, slerp_slice};
pub use loader::Loader;
pub use predictor::TexturePredictor;
pub use sd::{SdLoader, SdModel};
pub use util::{image_to_tensor, select_best_device, tensor_to_image};

use std::path::PathBuf;

use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// One texture generation job. Built once per invocation and never mutated.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, PartialOrd)]
pub struct GenerationRequest {
    pub prompt: String,
    /// When set, generation is conditioned on this image (image-to-image).
    pub init_image: Option<PathBuf>,
    pub steps: Option<usize>,
    pub guidance: Option<f64>,
    /// How far image-to-image may deviate from the input image.
    pub strength: Option<f64>,
    pub seed: Option<u64>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            init_image: None,
            steps: None,
            guidance: None,
            strength: None,
            seed: None,
        }
    }

    pub fn with_init_image(mut self, path: impl Into<PathBuf>) -> Self {
        self.init_image = Some(path.into());
        self
    }

    /// The mode is derived from the presence of an init image, never stored
    /// separately, so the two cannot disagree.
    pub fn mode(&self) -> Mode {
        if self.init_image.is_some() {
            Mode::ImageToImage
        } else {
            Mode::TextToImage
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    TextToImage,
    ImageToImage,
}

pub trait ModelLike: Send + Sync {
    fn run(&self, request: GenerationRequest) -> anyhow::Result<DynamicImage>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_follows_init_image() {
        let request = GenerationRequest::new("tileable fabric pattern");
        assert_eq!(request.mode(), Mode::TextToImage);

        let request = request.with_init_image("swatch.png");
        assert_eq!(request.mode(), Mode::ImageToImage);
    }
}
