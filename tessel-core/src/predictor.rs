use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use hf_hub::api::tokio::Api;

use crate::{DeviceMap, GenerationRequest, Loader, ModelLike, SdLoader, SdModel};

/// Front end over the Stable Diffusion pipeline. The pipeline is expensive to
/// build, so it lives in an `Option` and is constructed on first use, at most
/// once per predictor.
pub struct TexturePredictor {
    api: Api,
    device_map: DeviceMap,
    model: Option<SdModel>,
    img2img: bool,
}

impl TexturePredictor {
    pub fn new(api: Api, device_map: DeviceMap) -> Self {
        Self {
            api,
            device_map,
            model: None,
            img2img: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.model.is_some()
    }

    /// The mode the pipeline was set up with. Meaningful once initialized.
    pub fn is_img2img(&self) -> bool {
        self.img2img
    }

    /// Loads the pipeline into memory.
    pub async fn setup(&mut self, use_img2img: bool) -> Result<()> {
        println!("Loading Stable Diffusion pipeline...");
        self.img2img = use_img2img;
        let model = SdLoader::load(self.api.clone(), self.device_map).await?;
        self.model = Some(model);
        Ok(())
    }

    /// Generates a single texture image and writes it to `output_path`. The
    /// output format follows the path's extension.
    pub async fn generate_texture(
        &mut self,
        prompt: &str,
        image_path: Option<&Path>,
        output_path: &Path,
        seed: Option<u64>,
    ) -> Result<PathBuf> {
        if self.model.is_none() {
            self.setup(image_path.is_some()).await?;
        }
        let model = self.model.as_ref().context("pipeline not initialized")?;

        println!("Generating texture with prompt: {prompt}");

        let mut request = GenerationRequest::new(prompt);
        request.seed = seed;
        if let Some(path) = image_path {
            request = request.with_init_image(path);
        }

        let image = model.run(request)?;
        image
            .save(output_path)
            .with_context(|| format!("failed to save texture to {}", output_path.display()))?;
        println!("Texture saved to: {}", output_path.display());
        Ok(output_path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_uninitialized() {
        let api = Api::new().expect("hub api");
        let predictor = TexturePredictor::new(api, DeviceMap::ForceCpu);
        assert!(!predictor.is_initialized());
        assert!(!predictor.is_img2img());
    }
}
